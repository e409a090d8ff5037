//! Watches one resource kind on a Kubernetes cluster and reports every change, keeping the
//! subscription alive across expired watches.
//!
//! A [`Supervisor`] runs a raw [`WatchSession`], a cached [`MirrorSession`], or both, against a
//! [`SubscriptionSource`]. Changes go to a [`ResourceEventSink`]. Stream retries run on a
//! single-worker [`RetryScheduler`].

pub mod config;
pub mod error;
pub mod kube_source;
pub mod mirror;
pub mod scheduler;
pub mod source;
pub mod supervisor;
pub mod types;
pub mod utils;
pub mod watcher;

#[cfg(test)]
mod test_support;

pub use config::WatcherConfig;
pub use error::{ConfigError, SourceError};
pub use kube_source::KubeSource;
pub use mirror::MirrorSession;
pub use scheduler::RetryScheduler;
pub use source::{
    LogSink, MirrorObserver, ResourceEventSink, StreamObserver, SubscriptionHandle,
    SubscriptionSource,
};
pub use supervisor::Supervisor;
pub use types::{
    Action, ChangeEvent, ClosureCause, EventOrigin, Mode, NamespaceScope, SessionState,
    WatchOptions, WatchTarget,
};
pub use watcher::{WatchSession, RETRY_DELAY};
