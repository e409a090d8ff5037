use thiserror::Error;

/// Errors raised by a [`SubscriptionSource`](crate::source::SubscriptionSource) or its handles.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Unable to resolve resource: {0}")]
    Discovery(String),

    #[error("Invalid watch target: {0}")]
    InvalidTarget(String),

    #[error("Subscription task ended before the watch was established")]
    Interrupted,

    /// For `SubscriptionHandle` implementations whose teardown can fail. Aborting a
    /// `KubeSource` task cannot fail, so its handles never return this.
    #[error("Failed to close subscription: {0}")]
    Close(String),
}

/// Errors found while reading the watcher configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid mode {0:?}, expected one of watch, inform, all")]
    InvalidMode(String),

    #[error("Invalid timeout {0:?}, expected a positive number of seconds")]
    InvalidTimeout(String),
}
