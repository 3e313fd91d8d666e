//! Out-of-process scheduling extenders.
//!
//! An extender participates after the local filter and score phases.
//! Transport is the implementation's concern; the trait is synchronous
//! and implementations are expected to enforce their own deadlines.
//! Plugins never perform outbound calls from Filter; anything that must
//! talk to the outside world belongs here.

use std::collections::HashMap;
use std::sync::Arc;

use berth_cache::NodeInfo;
use berth_core::Task;

/// Outcome of an extender's filter pass.
#[derive(Debug, Clone, Default)]
pub struct ExtenderFilterResult {
    /// Names of nodes that survive.
    pub node_names: Vec<String>,
    /// Node → reason for nodes rejected but retryable.
    pub failed: HashMap<String, String>,
    /// Node → reason for nodes rejected until something structural
    /// changes.
    pub failed_and_unresolvable: HashMap<String, String>,
}

/// One extender score for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

pub trait Extender: Send + Sync {
    fn name(&self) -> &str;

    /// Errors from an ignorable extender are skipped with a warning;
    /// otherwise they abort the cycle.
    fn is_ignorable(&self) -> bool {
        false
    }

    /// Whether this extender takes over binding for interested tasks.
    fn is_binder(&self) -> bool {
        false
    }

    /// Whether the task concerns this extender at all.
    fn is_interested(&self, task: &Task) -> bool;

    /// Shrink the feasible set and annotate failures.
    fn filter(&self, task: &Task, nodes: &[Arc<NodeInfo>])
        -> anyhow::Result<ExtenderFilterResult>;

    /// Optional scores plus the weight to apply to them.
    fn prioritize(
        &self,
        _task: &Task,
        _nodes: &[Arc<NodeInfo>],
    ) -> anyhow::Result<(Vec<HostPriority>, i64)> {
        Ok((Vec::new(), 0))
    }

    /// Bind through the extender; only called when `is_binder` is true.
    fn bind(&self, _task: &Task, _node: &str) -> anyhow::Result<()> {
        anyhow::bail!("extender does not implement bind")
    }
}
