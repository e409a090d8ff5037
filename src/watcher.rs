// System
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

// Third Party
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

// Local
use crate::scheduler::RetryScheduler;
use crate::source::{
    deliver, release_handle, ResourceEventSink, StreamObserver, SubscriptionHandle,
    SubscriptionSource,
};
use crate::types::{ChangeEvent, ClosureCause, EventOrigin, SessionState, WatchOptions, WatchTarget};

/// Delay before reopening a stream after a recoverable closure or a failed open.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// A self-healing stream subscription on one [`WatchTarget`].
///
/// Each successful open moves the session to `Active`. A recoverable closure releases the handle
/// and schedules exactly one reopen after [`RETRY_DELAY`]; a fatal closure terminates the
/// session. Retries are unbounded.
///
/// [`close`](Self::close) sets the closed flag before anything else, and every retry checks it
/// before reopening, so a retry that fires after `close` never revives the session.
#[derive(Clone)]
pub struct WatchSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    target: Arc<WatchTarget>,
    options: WatchOptions,
    source: Arc<dyn SubscriptionSource>,
    sink: Arc<dyn ResourceEventSink>,
    scheduler: Arc<RetryScheduler>,
    closed: AtomicBool,
    slot: Mutex<Slot>,
}

struct Slot {
    state: SessionState,
    handle: Option<Box<dyn SubscriptionHandle>>,
    /// Bumped on every open attempt. Callbacks from older subscriptions are ignored.
    generation: u64,
}

impl WatchSession {
    pub fn new(
        target: Arc<WatchTarget>,
        options: WatchOptions,
        source: Arc<dyn SubscriptionSource>,
        sink: Arc<dyn ResourceEventSink>,
        scheduler: Arc<RetryScheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                target,
                options,
                source,
                sink,
                scheduler,
                closed: AtomicBool::new(false),
                slot: Mutex::new(Slot {
                    state: SessionState::Idle,
                    handle: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Open the stream. Never fails: an open error is logged and retried after [`RETRY_DELAY`].
    pub async fn start(&self) {
        self.inner.start().await
    }

    /// Release the current subscription. Safe to call any number of times, in any state.
    pub fn close(&self) {
        self.inner.close()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_slot().state
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl SessionInner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether callbacks tagged with `generation` still belong to the live subscription.
    fn is_current(&self, generation: u64) -> bool {
        !self.is_closed() && self.lock_slot().generation == generation
    }

    async fn start(self: &Arc<Self>) {
        if self.is_closed() {
            debug!("Watch on {} is closed, not starting", self.target);
            return;
        }
        let generation = {
            let mut slot = self.lock_slot();
            if slot.state != SessionState::Idle {
                debug!(
                    "Watch on {} is {:?}, ignoring start",
                    self.target, slot.state
                );
                return;
            }
            slot.generation += 1;
            slot.state = SessionState::Starting;
            slot.generation
        };

        info!("The watcher is starting...");
        let observer: Arc<dyn StreamObserver> = Arc::new(SessionObserver {
            session: Arc::downgrade(self),
            generation,
        });
        match self
            .source
            .open_stream(&self.target, &self.options, observer)
            .await
        {
            Ok(handle) => self.activate(generation, handle),
            Err(e) => {
                warn!("Watch connection to {} failed: {}", self.target, e);
                self.retry_later(generation);
            }
        }
    }

    fn activate(&self, generation: u64, handle: Box<dyn SubscriptionHandle>) {
        let mut handle = Some(handle);
        {
            let mut slot = self.lock_slot();
            if !self.is_closed()
                && slot.generation == generation
                && slot.state == SessionState::Starting
            {
                slot.handle = handle.take();
                slot.state = SessionState::Active;
                info!("Watching {}", self.target);
            }
        }
        // Closed, or the stream already ended while the open was completing.
        if let Some(handle) = handle {
            debug!("Discarding subscription on {} opened too late", self.target);
            release_handle(handle, &self.target);
        }
    }

    /// Move a live attempt back to `Idle` and schedule its single retry.
    fn retry_later(self: &Arc<Self>, generation: u64) {
        let stale = {
            let mut slot = self.lock_slot();
            if self.is_closed()
                || slot.generation != generation
                || !matches!(slot.state, SessionState::Starting | SessionState::Active)
            {
                return;
            }
            slot.state = SessionState::Idle;
            slot.handle.take()
        };
        if let Some(handle) = stale {
            release_handle(handle, &self.target);
        }

        warn!(
            "Retrying watch on {} in {} seconds...",
            self.target,
            RETRY_DELAY.as_secs()
        );
        let session = Arc::downgrade(self);
        let scheduled = self.scheduler.schedule_once(RETRY_DELAY, async move {
            match session.upgrade() {
                Some(session) if !session.is_closed() => session.start().await,
                _ => debug!("Watch session closed, dropping retry"),
            }
        });
        if !scheduled {
            warn!(
                "Retry scheduler is shut down, not reopening watch on {}",
                self.target
            );
        }
    }

    /// Release the handle after an unrecoverable closure. The session stays `Terminated`.
    fn terminate(&self, generation: u64) {
        let handle = {
            let mut slot = self.lock_slot();
            if slot.generation != generation
                || !matches!(slot.state, SessionState::Starting | SessionState::Active)
            {
                return;
            }
            slot.state = SessionState::Closing;
            slot.handle.take()
        };
        if let Some(handle) = handle {
            release_handle(handle, &self.target);
        }
        self.lock_slot().state = SessionState::Terminated;
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Watch on {} already closed", self.target);
            return;
        }
        let handle = {
            let mut slot = self.lock_slot();
            slot.state = SessionState::Closing;
            slot.handle.take()
        };
        if let Some(handle) = handle {
            release_handle(handle, &self.target);
        }
        self.lock_slot().state = SessionState::Terminated;
        debug!("Watch on {} closed", self.target);
    }

    fn on_closed(self: &Arc<Self>, generation: u64, cause: Option<ClosureCause>) {
        match cause {
            None => debug!("Watch on {} closed deliberately", self.target),
            Some(cause) if cause.recoverable => {
                warn!("Closed: {}", cause.message);
                self.retry_later(generation);
            }
            Some(cause) => {
                error!(
                    "Watch on {} failed and will not be retried: {}",
                    self.target, cause.message
                );
                self.terminate(generation);
            }
        }
    }
}

/// The callback target handed to the source for one open attempt.
struct SessionObserver {
    session: Weak<SessionInner>,
    generation: u64,
}

impl StreamObserver for SessionObserver {
    fn on_event(&self, event: ChangeEvent) {
        match self.session.upgrade() {
            Some(session) if session.is_current(self.generation) => {
                deliver(session.sink.as_ref(), EventOrigin::Stream, &event)
            }
            _ => debug!("Dropping {} for {} from a retired watch", event.action, event.name),
        }
    }

    fn on_closed(&self, cause: Option<ClosureCause>) {
        if let Some(session) = self.session.upgrade() {
            session.on_closed(self.generation, cause);
        }
    }
}
