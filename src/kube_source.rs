// System
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

// Third Party
use async_trait::async_trait;
use futures::{pin_mut, Stream, StreamExt};
use kube::{
    api::{Api, DynamicObject, WatchEvent, WatchParams},
    core::GroupVersionKind,
    discovery::{self, ApiResource, Scope},
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// Local
use crate::error::SourceError;
use crate::source::{MirrorObserver, StreamObserver, SubscriptionHandle, SubscriptionSource};
use crate::types::{
    Action, ChangeEvent, ClosureCause, NamespaceScope, WatchOptions, WatchTarget,
};

/// HTTP 410 Gone: the resource version the watch started from has been compacted away.
const GONE: u16 = 410;

/// Opens subscriptions on arbitrary resource kinds through the Kubernetes API.
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    pub fn new(client: &Client) -> Self {
        Self {
            client: client.clone(),
        }
    }

    /// Resolve the target's kind through discovery and build an `Api` for its scope.
    async fn api_for(&self, target: &WatchTarget) -> Result<Api<DynamicObject>, SourceError> {
        if target.kind.trim().is_empty() || target.api_version.trim().is_empty() {
            return Err(SourceError::InvalidTarget(target.to_string()));
        }
        let (group, version) = target.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &target.kind);
        let (resource, capabilities) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| SourceError::Discovery(format!("{}: {}", target, e)))?;
        Ok(self.scoped_api(&target.scope, &resource, &capabilities.scope))
    }

    fn scoped_api(
        &self,
        scope: &NamespaceScope,
        resource: &ApiResource,
        resource_scope: &Scope,
    ) -> Api<DynamicObject> {
        match (scope, resource_scope) {
            (NamespaceScope::Namespace(ns), Scope::Namespaced) => {
                Api::namespaced_with(self.client.clone(), ns, resource)
            }
            (NamespaceScope::Namespace(ns), Scope::Cluster) => {
                warn!(
                    "{} is cluster scoped, ignoring namespace {}",
                    resource.kind, ns
                );
                Api::all_with(self.client.clone(), resource)
            }
            (NamespaceScope::AllNamespaces, _) => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl SubscriptionSource for KubeSource {
    async fn open_stream(
        &self,
        target: &WatchTarget,
        options: &WatchOptions,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<Box<dyn SubscriptionHandle>, SourceError> {
        let api = self.api_for(target).await?;
        let mut params = WatchParams::default();
        if let Some(timeout) = options.timeout_seconds {
            params = params.timeout(timeout);
        }

        // The task owns the Api so the stream can outlive this call; the open result is reported
        // back before any event is delivered.
        let (opened_tx, opened_rx) = oneshot::channel();
        let target = target.clone();
        let task = AbortOnDrop::new(tokio::spawn(async move {
            let open = api.watch(&params, "0");
            run_stream(open, opened_tx, observer.as_ref(), &target).await;
        }));

        match opened_rx.await {
            Ok(Ok(())) => Ok(Box::new(TaskHandle::new(task.disarm()))),
            Ok(Err(e)) => Err(SourceError::Kube(e)),
            Err(_) => Err(SourceError::Interrupted),
        }
    }

    async fn open_mirror(
        &self,
        target: &WatchTarget,
        observer: Arc<dyn MirrorObserver>,
    ) -> Result<Box<dyn SubscriptionHandle>, SourceError> {
        let api = self.api_for(target).await?;
        let target = target.clone();
        let task = tokio::spawn(async move {
            let mut mirror = MirrorIndex::default();
            let mut stream = watcher(api, watcher::Config::default())
                .default_backoff()
                .boxed();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => mirror.apply(event, observer.as_ref()),
                    Err(e) => warn!("Informer on {} hit an error, recovering: {}", target, e),
                }
            }
            debug!("Informer stream on {} ended", target);
        });
        Ok(Box::new(TaskHandle::new(task)))
    }
}

/// Aborts the task when dropped, unless ownership was passed on with `disarm`. Keeps a watch
/// from running unowned when the caller of `open_stream` goes away mid-open.
struct AbortOnDrop {
    task: Option<JoinHandle<()>>,
}

impl AbortOnDrop {
    fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    fn disarm(mut self) -> JoinHandle<()> {
        match self.task.take() {
            Some(task) => task,
            None => unreachable!("AbortOnDrop disarmed twice"),
        }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Aborts the background task that drives a subscription.
struct TaskHandle {
    task: Option<JoinHandle<()>>,
}

impl TaskHandle {
    fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }
}

impl SubscriptionHandle for TaskHandle {
    fn close(&mut self) -> Result<(), SourceError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

/// Body of a stream subscription task: wait for the watch request, report the outcome, then drive
/// the stream. Nothing is delivered unless the opener is still waiting for the result.
async fn run_stream<F, S>(
    open: F,
    opened: oneshot::Sender<Result<(), kube::Error>>,
    observer: &dyn StreamObserver,
    target: &WatchTarget,
) where
    F: Future<Output = Result<S, kube::Error>>,
    S: Stream<Item = Result<WatchEvent<DynamicObject>, kube::Error>>,
{
    let stream = match open.await {
        Ok(stream) => stream,
        Err(e) => {
            // The opener logs this; there is nothing to clean up if it already left.
            let _ = opened.send(Err(e));
            return;
        }
    };
    if opened.send(Ok(())).is_err() {
        debug!("Nobody is waiting for the watch on {}, dropping it", target);
        return;
    }
    let cause = drive_stream(stream, observer).await;
    debug!("Watch stream on {} ended: {}", target, cause.message);
    observer.on_closed(Some(cause));
}

/// Forward events until the stream closes. A stream that simply ends has expired.
async fn drive_stream<S>(stream: S, observer: &dyn StreamObserver) -> ClosureCause
where
    S: Stream<Item = Result<WatchEvent<DynamicObject>, kube::Error>>,
{
    pin_mut!(stream);
    while let Some(item) = stream.next().await {
        match classify(item) {
            StreamStep::Event(event) => observer.on_event(event),
            StreamStep::Skip => {}
            StreamStep::Closed(cause) => return cause,
        }
    }
    ClosureCause::recoverable("watch expired")
}

#[derive(Debug, PartialEq)]
enum StreamStep {
    Event(ChangeEvent),
    Skip,
    Closed(ClosureCause),
}

/// Map one raw watch item to a change, a no-op, or the reason the stream is over.
fn classify(item: Result<WatchEvent<DynamicObject>, kube::Error>) -> StreamStep {
    match item {
        Ok(WatchEvent::Added(obj)) => StreamStep::Event(change(Action::Added, &obj)),
        Ok(WatchEvent::Modified(obj)) => StreamStep::Event(change(Action::Modified, &obj)),
        Ok(WatchEvent::Deleted(obj)) => StreamStep::Event(change(Action::Deleted, &obj)),
        Ok(WatchEvent::Bookmark(_)) => StreamStep::Skip,
        Ok(WatchEvent::Error(response)) if response.code == GONE => {
            StreamStep::Closed(ClosureCause::recoverable(response.message))
        }
        Ok(WatchEvent::Error(response)) => StreamStep::Closed(ClosureCause::fatal(format!(
            "{} ({}): {}",
            response.reason, response.code, response.message
        ))),
        Err(kube::Error::Api(response)) if response.code == GONE => {
            StreamStep::Closed(ClosureCause::recoverable(response.message))
        }
        Err(e) => StreamStep::Closed(ClosureCause::fatal(e.to_string())),
    }
}

fn change(action: Action, obj: &DynamicObject) -> ChangeEvent {
    ChangeEvent {
        action,
        namespace: obj.namespace(),
        name: obj.name_any(),
    }
}

type ObjectKey = (Option<String>, String);

fn key_of(obj: &DynamicObject) -> ObjectKey {
    (obj.namespace(), obj.name_any())
}

/// The set of objects currently mirrored, used to tell adds from updates and to infer deletions
/// that happened while the watch was disconnected.
#[derive(Default)]
struct MirrorIndex {
    known: HashSet<ObjectKey>,
}

impl MirrorIndex {
    fn apply(&mut self, event: watcher::Event<DynamicObject>, observer: &dyn MirrorObserver) {
        match event {
            watcher::Event::Applied(obj) => self.upsert(key_of(&obj), observer),
            watcher::Event::Deleted(obj) => {
                let (namespace, name) = key_of(&obj);
                self.known.remove(&(namespace.clone(), name.clone()));
                observer.on_delete(namespace.as_deref(), &name, false);
            }
            watcher::Event::Restarted(objs) => {
                let listed: HashSet<ObjectKey> = objs.iter().map(key_of).collect();
                let mut vanished: Vec<ObjectKey> =
                    self.known.difference(&listed).cloned().collect();
                vanished.sort();
                for key in objs.iter().map(key_of) {
                    self.upsert(key, observer);
                }
                for (namespace, name) in vanished {
                    self.known.remove(&(namespace.clone(), name.clone()));
                    observer.on_delete(namespace.as_deref(), &name, true);
                }
            }
        }
    }

    fn upsert(&mut self, key: ObjectKey, observer: &dyn MirrorObserver) {
        let (namespace, name) = &key;
        if self.known.contains(&key) {
            observer.on_update(namespace.as_deref(), name);
        } else {
            observer.on_add(namespace.as_deref(), name);
            self.known.insert(key);
        }
    }
}
