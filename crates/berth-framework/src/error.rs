//! Framework construction errors. All of these abort startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error("plugin {0} already registered")]
    AlreadyRegistered(String),

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("repeated config for plugin {0}")]
    DuplicatePluginConfig(String),

    #[error("plugin {plugin} does not implement {point}")]
    DoesNotImplement {
        plugin: String,
        point: &'static str,
    },

    #[error("invalid weight {weight} for plugin {plugin}; want 0..={max}")]
    InvalidWeight {
        plugin: String,
        weight: i32,
        max: i32,
    },

    #[error("exactly one queue sort plugin is required, found {0}")]
    QueueSortCount(usize),

    #[error("at least one bind plugin is required")]
    NoBindPlugin,

    #[error("percentage of nodes to score must be in [0, 100], got {0}")]
    InvalidPercentage(i32),

    #[error("initializing plugin {plugin}: {source}")]
    FactoryFailed {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type FrameworkResult<T> = Result<T, FrameworkError>;
