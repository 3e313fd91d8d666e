//! Scheduling profile configuration.
//!
//! A profile names a scheduler and selects plugins per extension point.
//! The synthetic `multi_point` set enables a plugin at every point it
//! implements; explicit per-point entries take precedence for ordering
//! and weight, and per-point disable lists prune the expansion.

use serde::{Deserialize, Serialize};

/// Sentinel disabling every plugin in a disable list.
pub const WILDCARD_PLUGIN: &str = "*";

/// One scheduler profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerProfile {
    /// Unique across profiles; tasks select a profile by this name.
    pub scheduler_name: String,
    #[serde(default)]
    pub plugins: Plugins,
    #[serde(default)]
    pub plugin_config: Vec<PluginConfig>,
    /// 0 selects the adaptive sampling formula.
    #[serde(default)]
    pub percentage_of_nodes_to_score: i32,
}

impl SchedulerProfile {
    pub fn new(scheduler_name: &str) -> Self {
        Self {
            scheduler_name: scheduler_name.to_string(),
            ..Self::default()
        }
    }
}

/// Per-extension-point plugin selections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plugins {
    #[serde(default)]
    pub queue_sort: PluginSet,
    #[serde(default)]
    pub pre_filter: PluginSet,
    #[serde(default)]
    pub filter: PluginSet,
    #[serde(default)]
    pub post_filter: PluginSet,
    #[serde(default)]
    pub pre_score: PluginSet,
    #[serde(default)]
    pub score: PluginSet,
    #[serde(default)]
    pub reserve: PluginSet,
    #[serde(default)]
    pub permit: PluginSet,
    #[serde(default)]
    pub pre_bind: PluginSet,
    #[serde(default)]
    pub bind: PluginSet,
    #[serde(default)]
    pub post_bind: PluginSet,
    /// Synthetic set expanded at framework construction.
    #[serde(default)]
    pub multi_point: PluginSet,
}

impl Plugins {
    pub fn for_point(&self, point: ExtensionPoint) -> &PluginSet {
        match point {
            ExtensionPoint::QueueSort => &self.queue_sort,
            ExtensionPoint::PreFilter => &self.pre_filter,
            ExtensionPoint::Filter => &self.filter,
            ExtensionPoint::PostFilter => &self.post_filter,
            ExtensionPoint::PreScore => &self.pre_score,
            ExtensionPoint::Score => &self.score,
            ExtensionPoint::Reserve => &self.reserve,
            ExtensionPoint::Permit => &self.permit,
            ExtensionPoint::PreBind => &self.pre_bind,
            ExtensionPoint::Bind => &self.bind,
            ExtensionPoint::PostBind => &self.post_bind,
        }
    }

    pub fn for_point_mut(&mut self, point: ExtensionPoint) -> &mut PluginSet {
        match point {
            ExtensionPoint::QueueSort => &mut self.queue_sort,
            ExtensionPoint::PreFilter => &mut self.pre_filter,
            ExtensionPoint::Filter => &mut self.filter,
            ExtensionPoint::PostFilter => &mut self.post_filter,
            ExtensionPoint::PreScore => &mut self.pre_score,
            ExtensionPoint::Score => &mut self.score,
            ExtensionPoint::Reserve => &mut self.reserve,
            ExtensionPoint::Permit => &mut self.permit,
            ExtensionPoint::PreBind => &mut self.pre_bind,
            ExtensionPoint::Bind => &mut self.bind,
            ExtensionPoint::PostBind => &mut self.post_bind,
        }
    }
}

/// Enabled plugins (ordered) and disabled plugin names for one point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginSet {
    #[serde(default)]
    pub enabled: Vec<PluginSpec>,
    #[serde(default)]
    pub disabled: Vec<PluginSpec>,
}

impl PluginSet {
    pub fn enable(names: &[&str]) -> Self {
        Self {
            enabled: names.iter().map(|n| PluginSpec::new(n)).collect(),
            disabled: Vec::new(),
        }
    }

    pub fn disables(&self, name: &str) -> bool {
        self.disabled
            .iter()
            .any(|p| p.name == name || p.name == WILDCARD_PLUGIN)
    }
}

/// A plugin reference with an optional weight (0 = unset).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    #[serde(default)]
    pub weight: i32,
}

impl PluginSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            weight: 0,
        }
    }

    pub fn weighted(name: &str, weight: i32) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }
}

/// Opaque per-plugin configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// The extension points, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionPoint {
    QueueSort,
    PreFilter,
    Filter,
    PostFilter,
    PreScore,
    Score,
    Reserve,
    Permit,
    PreBind,
    Bind,
    PostBind,
}

impl ExtensionPoint {
    pub const ALL: [ExtensionPoint; 11] = [
        ExtensionPoint::QueueSort,
        ExtensionPoint::PreFilter,
        ExtensionPoint::Filter,
        ExtensionPoint::PostFilter,
        ExtensionPoint::PreScore,
        ExtensionPoint::Score,
        ExtensionPoint::Reserve,
        ExtensionPoint::Permit,
        ExtensionPoint::PreBind,
        ExtensionPoint::Bind,
        ExtensionPoint::PostBind,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExtensionPoint::QueueSort => "QueueSort",
            ExtensionPoint::PreFilter => "PreFilter",
            ExtensionPoint::Filter => "Filter",
            ExtensionPoint::PostFilter => "PostFilter",
            ExtensionPoint::PreScore => "PreScore",
            ExtensionPoint::Score => "Score",
            ExtensionPoint::Reserve => "Reserve",
            ExtensionPoint::Permit => "Permit",
            ExtensionPoint::PreBind => "PreBind",
            ExtensionPoint::Bind => "Bind",
            ExtensionPoint::PostBind => "PostBind",
        }
    }
}
