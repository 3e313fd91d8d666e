//! berth-cache — the scheduler's view of cluster state.
//!
//! Two layers:
//!
//! - `Cache`: the authoritative, mutable in-memory store of nodes and
//!   placed/assumed tasks. Event handlers apply mutations; the scheduling
//!   loop optimistically assumes tasks here before binding confirms.
//! - `Snapshot`: an immutable per-cycle view built from the cache.
//!   Refreshing is generation-numbered so only NodeInfos that changed
//!   since the last refresh are copied.
//!
//! # Architecture
//!
//! ```text
//! event handlers ──► Cache ──UpdateSnapshot──► Snapshot (per cycle)
//!                      ▲                          │
//!            assume / forget / finish_binding     └─► Framework plugins
//! ```

pub mod cache;
pub mod error;
pub mod node_info;
pub mod snapshot;

pub use cache::Cache;
pub use error::{CacheError, CacheResult};
pub use node_info::NodeInfo;
pub use snapshot::Snapshot;
