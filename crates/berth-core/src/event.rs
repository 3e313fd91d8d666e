//! Cluster event vocabulary.
//!
//! Plugins declare which cluster mutations could make a previously
//! unschedulable task feasible again; the queue uses the declarations to
//! wake parked tasks.

use serde::{Deserialize, Serialize};

/// Resource kind an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventResource {
    Task,
    Node,
    VolumeClaim,
    /// Matches any resource; used for the default "wake on everything" set.
    WildCard,
}

/// What happened to the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Add,
    Update,
    Delete,
    /// Matches any action.
    All,
}

/// A cluster mutation kind: resource plus action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub resource: EventResource,
    pub action: ActionType,
}

impl ClusterEvent {
    pub const fn new(resource: EventResource, action: ActionType) -> Self {
        Self { resource, action }
    }

    /// The event that matches every cluster mutation.
    pub const fn wildcard() -> Self {
        Self {
            resource: EventResource::WildCard,
            action: ActionType::All,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.resource == EventResource::WildCard && self.action == ActionType::All
    }

    /// Whether a registration (self) covers an observed event.
    pub fn covers(&self, observed: &ClusterEvent) -> bool {
        let resource_ok =
            self.resource == EventResource::WildCard || self.resource == observed.resource;
        let action_ok = self.action == ActionType::All || self.action == observed.action;
        resource_ok && action_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_covers_everything() {
        let wildcard = ClusterEvent::wildcard();
        assert!(wildcard.covers(&ClusterEvent::new(EventResource::Node, ActionType::Add)));
        assert!(wildcard.covers(&ClusterEvent::new(EventResource::Task, ActionType::Delete)));
    }

    #[test]
    fn exact_registration_covers_only_itself() {
        let registration = ClusterEvent::new(EventResource::Node, ActionType::Add);
        assert!(registration.covers(&ClusterEvent::new(EventResource::Node, ActionType::Add)));
        assert!(!registration.covers(&ClusterEvent::new(EventResource::Node, ActionType::Delete)));
        assert!(!registration.covers(&ClusterEvent::new(EventResource::Task, ActionType::Add)));
    }

    #[test]
    fn action_wildcard_covers_all_actions_of_resource() {
        let registration = ClusterEvent::new(EventResource::VolumeClaim, ActionType::All);
        assert!(
            registration.covers(&ClusterEvent::new(EventResource::VolumeClaim, ActionType::Delete))
        );
        assert!(!registration.covers(&ClusterEvent::new(EventResource::Node, ActionType::Delete)));
    }
}
