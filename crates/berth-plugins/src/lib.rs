//! berth-plugins — built-in scheduling plugins.
//!
//! - `InterTaskAffinity`: required inter-task affinity/anti-affinity,
//!   including the symmetric check against already-placed tasks
//! - `BalancedAllocation`: prefers nodes whose per-resource utilization
//!   stays even after the placement
//! - `DefaultBinder`: binds through the handle's binding sink
//! - `PrioritySort`: queue ordering by priority, then arrival
//!
//! `default_registry` wires all of them into a plugin registry.

pub mod balanced_allocation;
pub mod default_binder;
pub mod inter_task_affinity;
pub mod priority_sort;

pub use balanced_allocation::{BalancedAllocation, BalancedAllocationArgs, ResourceSpec};
pub use default_binder::DefaultBinder;
pub use inter_task_affinity::InterTaskAffinity;
pub use priority_sort::PrioritySort;

use berth_framework::{FrameworkResult, Registry};

/// Registry with every built-in plugin registered under its canonical
/// name.
pub fn default_registry() -> FrameworkResult<Registry> {
    let mut registry = Registry::new();
    registry.register(priority_sort::NAME, priority_sort::factory)?;
    registry.register(default_binder::NAME, default_binder::factory)?;
    registry.register(inter_task_affinity::NAME, inter_task_affinity::factory)?;
    registry.register(balanced_allocation::NAME, balanced_allocation::factory)?;
    Ok(registry)
}
