// System
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// Third Party
use tracing::{debug, error, info};

// Local
use crate::source::{
    deliver, release_handle, MirrorObserver, ResourceEventSink, SubscriptionHandle,
    SubscriptionSource,
};
use crate::types::{Action, ChangeEvent, EventOrigin, WatchTarget};

/// Callback plumbing for a cached mirror subscription. The source keeps the mirror connected, so
/// there is no retry here; the session only forwards changes and tears the handle down.
pub struct MirrorSession {
    target: Arc<WatchTarget>,
    source: Arc<dyn SubscriptionSource>,
    sink: Arc<dyn ResourceEventSink>,
    closed: AtomicBool,
    handle: Mutex<Option<Box<dyn SubscriptionHandle>>>,
}

impl MirrorSession {
    pub fn new(
        target: Arc<WatchTarget>,
        source: Arc<dyn SubscriptionSource>,
        sink: Arc<dyn ResourceEventSink>,
    ) -> Self {
        Self {
            target,
            source,
            sink,
            closed: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        if self.is_closed() {
            debug!("Mirror of {} is closed, not starting", self.target);
            return;
        }
        if self.lock_handle().is_some() {
            debug!("Mirror of {} is already running", self.target);
            return;
        }

        info!("The informer is starting...");
        let observer: Arc<dyn MirrorObserver> = Arc::new(MirrorForwarder {
            sink: self.sink.clone(),
        });
        let handle = match self.source.open_mirror(&self.target, observer).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to start informer on {}: {}", self.target, e);
                return;
            }
        };

        let mut slot = self.lock_handle();
        if self.is_closed() || slot.is_some() {
            drop(slot);
            release_handle(handle, &self.target);
        } else {
            *slot = Some(handle);
            info!("Mirroring {}", self.target);
        }
    }

    /// Release the mirror. Errors are logged, never returned; repeated calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.lock_handle().take();
        if let Some(handle) = handle {
            release_handle(handle, &self.target);
        }
        debug!("Mirror of {} closed", self.target);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.lock_handle().is_some()
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<Box<dyn SubscriptionHandle>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MirrorForwarder {
    sink: Arc<dyn ResourceEventSink>,
}

impl MirrorForwarder {
    fn forward(&self, action: Action, namespace: Option<&str>, name: &str) {
        let event = ChangeEvent::new(action, namespace, name);
        deliver(self.sink.as_ref(), EventOrigin::Mirror, &event);
    }
}

impl MirrorObserver for MirrorForwarder {
    fn on_add(&self, namespace: Option<&str>, name: &str) {
        self.forward(Action::Added, namespace, name);
    }

    fn on_update(&self, namespace: Option<&str>, name: &str) {
        self.forward(Action::Modified, namespace, name);
    }

    fn on_delete(&self, namespace: Option<&str>, name: &str, final_state_unknown: bool) {
        if final_state_unknown {
            debug!(
                "Deletion of {:?}/{} was inferred from a relist",
                namespace, name
            );
        }
        self.forward(Action::Deleted, namespace, name);
    }
}
