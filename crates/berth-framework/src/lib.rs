//! berth-framework — the plugin host of the berth scheduler.
//!
//! A `Framework` is built per scheduling profile. It owns ordered plugin
//! lists per extension point and runs them with the per-point policies
//! (short-circuiting, fan-out, aggregation) the scheduling pipeline
//! relies on:
//!
//! ```text
//! PreFilter → Filter → PostFilter → PreScore → Score → NormalizeScore
//!     → Reserve → Permit → PreBind → Bind → PostBind
//! ```
//!
//! Plugins are singletons per profile, constructed once from a `Registry`
//! of factories. Each plugin exposes the extension points it implements
//! through capability accessors on the `Plugin` trait; the framework
//! never downcasts.

pub mod cancel;
pub mod config;
pub mod cycle_state;
pub mod error;
pub mod handle;
pub mod parallelize;
pub mod plugin;
pub mod registry;
pub mod runtime;
pub mod status;
pub mod waiting;

pub use cancel::CancelToken;
pub use config::{
    ExtensionPoint, PluginConfig, PluginSet, PluginSpec, Plugins, SchedulerProfile,
};
pub use cycle_state::{CycleState, StateData};
pub use error::{FrameworkError, FrameworkResult};
pub use handle::{
    Binder, EmptyNominator, Handle, Listers, LogRecorder, NoopBinder, Recorder, SnapshotRef,
    StaticListers, TaskNominator,
};
pub use plugin::{
    BindPlugin, FilterPlugin, NodeScore, NodeScoreList, NodeToStatusMap, Plugin,
    PluginToNodeScores, PostBindPlugin, PostFilterPlugin, PostFilterResult, PreBindPlugin,
    PreFilterExtensions, PreFilterPlugin, PreScorePlugin, PermitPlugin, QueueSortPlugin,
    QueuedTaskInfo, ReservePlugin, ScoreExtensions, ScorePlugin, MAX_NODE_SCORE, MIN_NODE_SCORE,
};
pub use registry::{PluginFactory, Registry};
pub use runtime::{Framework, FrameworkOptions};
pub use status::{Code, Status};
pub use waiting::{WaitingTask, WaitingTasks};
