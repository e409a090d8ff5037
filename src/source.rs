// System
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

// Third Party
use async_trait::async_trait;
use tracing::{debug, error, info};

// Local
use crate::error::SourceError;
use crate::types::{Action, ChangeEvent, ClosureCause, EventOrigin, WatchOptions, WatchTarget};

/// A live subscription. Dropping the handle without closing it leaves the subscription running.
pub trait SubscriptionHandle: Send {
    /// Release the subscription. May block briefly on network teardown.
    fn close(&mut self) -> Result<(), SourceError>;
}

/// Callbacks for a stream subscription, invoked on the source's own task.
pub trait StreamObserver: Send + Sync {
    fn on_event(&self, event: ChangeEvent);

    /// `None` means the subscription was closed deliberately.
    fn on_closed(&self, cause: Option<ClosureCause>);
}

/// Callbacks for a mirror subscription, invoked as the locally cached copy changes.
pub trait MirrorObserver: Send + Sync {
    fn on_add(&self, namespace: Option<&str>, name: &str);

    fn on_update(&self, namespace: Option<&str>, name: &str);

    /// `final_state_unknown` is set when the deletion was inferred from a relist rather than
    /// observed directly.
    fn on_delete(&self, namespace: Option<&str>, name: &str, final_state_unknown: bool);
}

/// Opens subscriptions against the cluster API.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// Open a raw event stream. Errors returned here mean the target could not be reached or is
    /// invalid; once a handle is returned, failures arrive through `observer.on_closed`.
    async fn open_stream(
        &self,
        target: &WatchTarget,
        options: &WatchOptions,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<Box<dyn SubscriptionHandle>, SourceError>;

    /// Open a cached mirror. The source is responsible for keeping the mirror connected.
    async fn open_mirror(
        &self,
        target: &WatchTarget,
        observer: Arc<dyn MirrorObserver>,
    ) -> Result<Box<dyn SubscriptionHandle>, SourceError>;
}

/// Receives every change the sessions observe. Called synchronously from callback context, so
/// implementations must not block for long.
pub trait ResourceEventSink: Send + Sync {
    fn notify(&self, origin: EventOrigin, event: &ChangeEvent);
}

/// Writes each change as a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ResourceEventSink for LogSink {
    fn notify(&self, origin: EventOrigin, event: &ChangeEvent) {
        let namespace = event.namespace.as_deref().unwrap_or("<none>");
        match origin {
            EventOrigin::Stream => info!(
                "Action: {}, Namespace: {}, Name: {}",
                event.action, namespace, event.name
            ),
            EventOrigin::Mirror => {
                let verb = match event.action {
                    Action::Added => "Add",
                    Action::Modified => "Update",
                    Action::Deleted => "Delete",
                    Action::Unknown => "Unknown",
                };
                info!("{}, Namespace: {}, Name: {}", verb, namespace, event.name)
            }
        }
    }
}

/// Release `handle`, logging instead of propagating any error or panic from the release path.
pub(crate) fn release_handle(mut handle: Box<dyn SubscriptionHandle>, target: &WatchTarget) {
    match panic::catch_unwind(AssertUnwindSafe(|| handle.close())) {
        Ok(Ok(())) => debug!("Released subscription on {}", target),
        Ok(Err(error)) => error!("Failed to release subscription on {}: {}", target, error),
        Err(_) => error!("Subscription on {} panicked while being released", target),
    }
}

/// Hand `event` to `sink`, containing any panic so the delivering task survives.
pub(crate) fn deliver(sink: &dyn ResourceEventSink, origin: EventOrigin, event: &ChangeEvent) {
    if panic::catch_unwind(AssertUnwindSafe(|| sink.notify(origin, event))).is_err() {
        error!(
            "Event sink panicked on {} for {:?}/{}",
            event.action, event.namespace, event.name
        );
    }
}
