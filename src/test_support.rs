//! In-memory collaborators for unit tests.

// System
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// Third Party
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

// Local
use crate::error::SourceError;
use crate::source::{
    MirrorObserver, ResourceEventSink, StreamObserver, SubscriptionHandle, SubscriptionSource,
};
use crate::types::{ChangeEvent, EventOrigin, WatchOptions, WatchTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    Stream,
    Mirror,
}

/// One successful call to `open_stream` or `open_mirror`.
#[derive(Clone)]
pub struct OpenRecord {
    pub kind: OpenKind,
    pub target: WatchTarget,
    pub options: Option<WatchOptions>,
    pub at: Instant,
    pub stream_observer: Option<Arc<dyn StreamObserver>>,
    pub mirror_observer: Option<Arc<dyn MirrorObserver>>,
    pub closes: Arc<AtomicUsize>,
}

impl OpenRecord {
    pub fn stream(&self) -> Arc<dyn StreamObserver> {
        self.stream_observer.clone().expect("not a stream record")
    }

    pub fn mirror(&self) -> Arc<dyn MirrorObserver> {
        self.mirror_observer.clone().expect("not a mirror record")
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Script {
    open_failures: VecDeque<String>,
    failing_closes: usize,
    panicking_closes: usize,
    gate: Option<Arc<Notify>>,
}

/// A scripted [`SubscriptionSource`] that records every open.
#[derive(Default)]
pub struct FakeSource {
    records: Mutex<Vec<OpenRecord>>,
    script: Mutex<Script>,
    failed_opens: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `open_*` call fails with `message`.
    pub fn fail_next_open(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .open_failures
            .push_back(message.to_string());
    }

    /// The next stream open is recorded immediately but only returns its handle once the
    /// returned gate is notified.
    pub fn gate_next_open(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script.lock().unwrap().gate = Some(gate.clone());
        gate
    }

    /// The next `count` handles returned will fail when closed.
    pub fn fail_closes(&self, count: usize) {
        self.script.lock().unwrap().failing_closes += count;
    }

    /// The next `count` handles returned will panic when closed.
    pub fn panic_on_closes(&self, count: usize) {
        self.script.lock().unwrap().panicking_closes += count;
    }

    pub fn records(&self) -> Vec<OpenRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn opens(&self, kind: OpenKind) -> Vec<OpenRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.kind == kind)
            .collect()
    }

    pub fn failed_opens(&self) -> usize {
        self.failed_opens.load(Ordering::SeqCst)
    }

    fn open(
        &self,
        kind: OpenKind,
        target: &WatchTarget,
        options: Option<WatchOptions>,
        stream_observer: Option<Arc<dyn StreamObserver>>,
        mirror_observer: Option<Arc<dyn MirrorObserver>>,
    ) -> Result<Box<dyn SubscriptionHandle>, SourceError> {
        let mut script = self.script.lock().unwrap();
        if let Some(message) = script.open_failures.pop_front() {
            self.failed_opens.fetch_add(1, Ordering::SeqCst);
            return Err(SourceError::Discovery(message));
        }
        let behaviour = if script.panicking_closes > 0 {
            script.panicking_closes -= 1;
            CloseBehaviour::Panic
        } else if script.failing_closes > 0 {
            script.failing_closes -= 1;
            CloseBehaviour::Fail
        } else {
            CloseBehaviour::Succeed
        };
        let closes = Arc::new(AtomicUsize::new(0));
        self.records.lock().unwrap().push(OpenRecord {
            kind,
            target: target.clone(),
            options,
            at: Instant::now(),
            stream_observer,
            mirror_observer,
            closes: closes.clone(),
        });
        Ok(Box::new(FakeHandle { closes, behaviour }))
    }
}

#[async_trait]
impl SubscriptionSource for FakeSource {
    async fn open_stream(
        &self,
        target: &WatchTarget,
        options: &WatchOptions,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<Box<dyn SubscriptionHandle>, SourceError> {
        let gate = self.script.lock().unwrap().gate.take();
        let handle = self.open(OpenKind::Stream, target, Some(*options), Some(observer), None);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        handle
    }

    async fn open_mirror(
        &self,
        target: &WatchTarget,
        observer: Arc<dyn MirrorObserver>,
    ) -> Result<Box<dyn SubscriptionHandle>, SourceError> {
        self.open(OpenKind::Mirror, target, None, None, Some(observer))
    }
}

#[derive(Clone, Copy)]
enum CloseBehaviour {
    Succeed,
    Fail,
    Panic,
}

struct FakeHandle {
    closes: Arc<AtomicUsize>,
    behaviour: CloseBehaviour,
}

impl SubscriptionHandle for FakeHandle {
    fn close(&mut self) -> Result<(), SourceError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            CloseBehaviour::Succeed => Ok(()),
            CloseBehaviour::Fail => Err(SourceError::Close("connection reset".to_string())),
            CloseBehaviour::Panic => panic!("handle exploded while closing"),
        }
    }
}

/// Records every notification in delivery order.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(EventOrigin, ChangeEvent)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(EventOrigin, ChangeEvent)> {
        self.events.lock().unwrap().clone()
    }
}

impl ResourceEventSink for RecordingSink {
    fn notify(&self, origin: EventOrigin, event: &ChangeEvent) {
        self.events.lock().unwrap().push((origin, event.clone()));
    }
}

/// A sink that panics on every notification.
pub struct PanickingSink;

impl ResourceEventSink for PanickingSink {
    fn notify(&self, _origin: EventOrigin, _event: &ChangeEvent) {
        panic!("sink exploded");
    }
}

/// Let spawned tasks run without advancing the clock.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
