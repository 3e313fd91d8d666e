//! berth-core — domain types for the berth workload scheduler.
//!
//! The vocabulary every other crate speaks:
//!
//! - `Task`: a unit of work awaiting placement on a node
//! - `Node`: a machine that can host tasks, with capacity and labels
//! - `ResourceList`: resource quantities by name (cpu, memory, extended)
//! - `LabelSelector`: label matching with set-based expression operators
//! - `ClusterEvent`: a cluster mutation kind, used to wake parked tasks
//!
//! Types here are pure data plus matching logic. Nothing in this crate
//! touches the cache, the plugin framework, or the scheduling loop.

pub mod event;
pub mod selector;
pub mod types;

pub use event::{ActionType, ClusterEvent, EventResource};
pub use selector::{LabelSelector, SelectorOperator, SelectorRequirement};
pub use types::{
    AffinityTerm, ContainerSpec, Node, NodeName, ResourceList, Taint, TaintEffect, Task,
    TaskAffinity, TaskId, Toleration, TolerationOperator, TopologySpreadTerm,
};
