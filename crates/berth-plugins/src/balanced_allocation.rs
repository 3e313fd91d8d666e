//! Balanced resource allocation scoring.
//!
//! Scores a node by how evenly its resources would be utilized after
//! placing the task: the closer the requested fractions of the
//! configured resources are to each other, the higher the score. A pure
//! function of the node's aggregates and the task's requests; no
//! normalization pass is needed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use berth_core::Task;
use berth_framework::{
    CancelToken, CycleState, Handle, Plugin, ScorePlugin, Status, MAX_NODE_SCORE, MIN_NODE_SCORE,
};

pub const NAME: &str = "BalancedAllocation";

/// One resource considered for balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    1
}

/// Plugin arguments: which resources participate in the balance measure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancedAllocationArgs {
    pub resources: Vec<ResourceSpec>,
}

impl Default for BalancedAllocationArgs {
    fn default() -> Self {
        Self {
            resources: vec![
                ResourceSpec {
                    name: "cpu".to_string(),
                    weight: 1,
                },
                ResourceSpec {
                    name: "memory".to_string(),
                    weight: 1,
                },
            ],
        }
    }
}

pub struct BalancedAllocation {
    handle: Handle,
    args: BalancedAllocationArgs,
}

pub fn factory(args: &serde_json::Value, handle: &Handle) -> anyhow::Result<Arc<dyn Plugin>> {
    let args = if args.is_null() {
        BalancedAllocationArgs::default()
    } else {
        serde_json::from_value(args.clone())?
    };
    Ok(Arc::new(BalancedAllocation {
        handle: handle.clone(),
        args,
    }))
}

impl Plugin for BalancedAllocation {
    fn name(&self) -> &str {
        NAME
    }

    fn score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

impl ScorePlugin for BalancedAllocation {
    fn score(
        &self,
        _ctx: &CancelToken,
        _state: &CycleState,
        task: &Task,
        node_name: &str,
    ) -> (i64, Status) {
        let snapshot = self.handle.snapshot.get();
        let Some(info) = snapshot.get(node_name) else {
            return (
                0,
                Status::error(format!("node {node_name} not found in snapshot")),
            );
        };
        let Some(node) = info.node.as_ref() else {
            return (0, Status::error(format!("node {node_name} has no node object")));
        };

        let task_requests = task.total_requests();
        let mut fractions: Vec<f64> = Vec::with_capacity(self.args.resources.len());
        for resource in &self.args.resources {
            let task_request = task_requests.get(&resource.name).unwrap_or(0);
            // An extended resource the task does not ask for says nothing
            // about this placement's balance.
            if task_request == 0 && is_extended(&resource.name) {
                continue;
            }
            // Resources the node does not declare are skipped entirely.
            let Some(allocatable) = node.allocatable.get(&resource.name) else {
                continue;
            };
            let requested = info.requested.get(&resource.name).unwrap_or(0) + task_request;
            let fraction = fraction_of_capacity(requested, allocatable);
            if fraction <= 1.0 {
                fractions.push(fraction);
            }
        }

        (balance_score(&fractions), Status::success())
    }
}

fn is_extended(resource: &str) -> bool {
    resource != "cpu" && resource != "memory"
}

/// Requested over allocatable; a node declaring zero capacity counts as
/// fully utilized, which makes it balanced by definition.
fn fraction_of_capacity(requested: i64, allocatable: i64) -> f64 {
    if allocatable == 0 {
        return 1.0;
    }
    requested as f64 / allocatable as f64
}

/// `(1 − σ) × MaxNodeScore`, where σ is the population standard
/// deviation of the requested fractions.
fn balance_score(fractions: &[f64]) -> i64 {
    if fractions.is_empty() {
        return MAX_NODE_SCORE;
    }
    let count = fractions.len() as f64;
    let mean = fractions.iter().sum::<f64>() / count;
    let variance = fractions
        .iter()
        .map(|f| (f - mean) * (f - mean))
        .sum::<f64>()
        / count;
    let std_dev = variance.sqrt();
    (((1.0 - std_dev) * MAX_NODE_SCORE as f64) as i64).clamp(MIN_NODE_SCORE, MAX_NODE_SCORE)
}
