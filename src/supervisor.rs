// System
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

// Third Party
use tracing::{error, info, warn};

// Local
use crate::mirror::MirrorSession;
use crate::scheduler::RetryScheduler;
use crate::source::{ResourceEventSink, SubscriptionSource};
use crate::types::{Mode, WatchOptions, WatchTarget};
use crate::watcher::WatchSession;

/// Owns the sessions selected by [`Mode`] and the scheduler their retries run on.
pub struct Supervisor {
    source: Arc<dyn SubscriptionSource>,
    sink: Arc<dyn ResourceEventSink>,
    scheduler: Option<Arc<RetryScheduler>>,
    watch: Option<WatchSession>,
    mirror: Option<MirrorSession>,
    stopped: bool,
}

impl Supervisor {
    pub fn new(source: Arc<dyn SubscriptionSource>, sink: Arc<dyn ResourceEventSink>) -> Self {
        Self {
            source,
            sink,
            scheduler: None,
            watch: None,
            mirror: None,
            stopped: false,
        }
    }

    /// Create the scheduler, then create and start each session `mode` asks for.
    pub async fn start(&mut self, mode: Mode, target: WatchTarget, options: WatchOptions) {
        if self.stopped {
            warn!("Supervisor already stopped, ignoring start");
            return;
        }
        if self.scheduler.is_some() {
            warn!("Supervisor already started, ignoring start");
            return;
        }
        info!("Starting {:?} for {}", mode, target);
        let target = Arc::new(target);
        let scheduler = Arc::new(RetryScheduler::new());
        self.scheduler = Some(scheduler.clone());

        if mode.runs_stream() {
            let session = WatchSession::new(
                target.clone(),
                options,
                self.source.clone(),
                self.sink.clone(),
                scheduler,
            );
            session.start().await;
            self.watch = Some(session);
        }

        if mode.runs_mirror() {
            let session = MirrorSession::new(target, self.source.clone(), self.sink.clone());
            session.start().await;
            self.mirror = Some(session);
        }
    }

    /// Close every session, then drop all pending retries. Each step runs even if an earlier one
    /// fails.
    pub fn stop(&mut self) {
        info!("The application is stopping...");
        self.stopped = true;

        if let Some(session) = self.watch.take() {
            if panic::catch_unwind(AssertUnwindSafe(|| session.close())).is_err() {
                error!("Watch session panicked while closing");
            }
        }
        if let Some(session) = self.mirror.take() {
            if panic::catch_unwind(AssertUnwindSafe(|| session.close())).is_err() {
                error!("Mirror session panicked while closing");
            }
        }
        if let Some(scheduler) = self.scheduler.take() {
            if panic::catch_unwind(AssertUnwindSafe(|| scheduler.shutdown_now())).is_err() {
                error!("Retry scheduler panicked while shutting down");
            }
        }
    }

    pub fn watch_session(&self) -> Option<&WatchSession> {
        self.watch.as_ref()
    }

    pub fn mirror_session(&self) -> Option<&MirrorSession> {
        self.mirror.as_ref()
    }
}
