//! Scheduler error types and feasibility failures.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use berth_core::Task;
use berth_framework::NodeToStatusMap;

/// Default cap on a rendered feasibility message.
pub const DEFAULT_REASON_TRUNCATION: usize = 1024;

/// What filtering learned about each node, plus the plugins that
/// contributed unschedulable verdicts.
#[derive(Debug, Clone, Default)]
pub struct Diagnosis {
    pub node_to_status: NodeToStatusMap,
    pub unschedulable_plugins: BTreeSet<String>,
}

/// Structured feasibility failure: no node can host the task right now.
///
/// Not a transport-level error; callers route it to the unschedulable
/// queue with wake-up subscriptions derived from `unschedulable_plugins`.
#[derive(Debug, Clone)]
pub struct FitError {
    pub task: Arc<Task>,
    pub num_all_nodes: usize,
    pub diagnosis: Diagnosis,
}

impl FitError {
    /// Human-readable rendering: reasons deduplicated, grouped with
    /// counts, sorted, and capped at `max_len` bytes.
    pub fn render(&self, max_len: usize) -> String {
        use std::collections::BTreeMap;

        let mut histogram: BTreeMap<&str, usize> = BTreeMap::new();
        for status in self.diagnosis.node_to_status.values() {
            for reason in status.reasons() {
                *histogram.entry(reason.as_str()).or_insert(0) += 1;
            }
        }
        let reasons: Vec<String> = histogram
            .into_iter()
            .map(|(reason, count)| format!("{count} {reason}"))
            .collect();

        let mut message = format!(
            "0/{} nodes are available: {}.",
            self.num_all_nodes,
            reasons.join(", ")
        );
        if message.len() > max_len {
            message.truncate(max_len.saturating_sub(3));
            message.push_str("...");
        }
        message
    }
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(DEFAULT_REASON_TRUNCATION))
    }
}

impl std::error::Error for FitError {}

/// Errors surfaced by a scheduling cycle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no nodes available to schedule tasks")]
    NoNodesAvailable,

    #[error(transparent)]
    Unschedulable(#[from] FitError),

    #[error("no profile registered for scheduler name {0}")]
    UnknownProfile(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
