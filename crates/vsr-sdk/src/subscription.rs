//! Live subscriptions to rule streams and views.
//!
//! A subscription owns one replica behind a `tokio` mutex, a pump task that
//! feeds transport messages through the dispatcher, and one serial notifier
//! per registered listener.
//!
//! ```text
//! transport rx -> pump -> dispatcher -> on_*() [replica lock]
//!                                          |- apply / reconcile
//!                                          |- resync RPC on gap (lock held)
//!                                          '- enqueue calls
//!                                                    '-> notifier worker -> listener
//! ```
//!
//! Calls are enqueued while the replica lock is held and delivered after it
//! is released, so listener code never runs under the lock.

use crate::client::ClientConfig;
use crate::dispatch::{NotificationDispatcher, PendingCall, Route, RuleMessage, RuleRoute, ViewRoute};
use crate::error::{Result, SdkError};
use crate::listener::{Deliver, ListenerId, RuleCall, RuleListener, ViewCall, ViewListener};
use crate::network::{RuleSource, ViewSource};
use crate::notifier::ListenerNotifier;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vsr_core::{
    ModificationCounter, ResultFragment, ResultSnapshot, Rule, RuleChanges, RuleSnapshot,
};
use vsr_delta::{
    ApplyOutcome, Classification, IncomingResult, ReconcileOutcome, ReconcilerStats, ResultKind,
    ResultReconciler, ResyncOutcome, RuleSetReplicator,
};

// ============================================================================
// Listener registry
// ============================================================================

/// The notifiers of every listener on one subscription.
struct ListenerSet<L: ?Sized, C> {
    coalesce: bool,
    entries: RwLock<Vec<(ListenerId, Arc<ListenerNotifier<L, C>>)>>,
}

impl<L, C> ListenerSet<L, C>
where
    L: ?Sized + Send + Sync + 'static,
    C: Deliver<L> + Clone,
{
    fn new(coalesce: bool) -> Self {
        Self {
            coalesce,
            entries: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, listener: Arc<L>, catch_up: Vec<C>) -> ListenerId {
        let id = ListenerId::new();
        let notifier = ListenerNotifier::spawn(listener, self.coalesce);
        for call in catch_up {
            notifier.notify(call);
        }
        self.entries.write().push((id, Arc::new(notifier)));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, notifier)| {
            if *existing == id {
                notifier.close();
                false
            } else {
                true
            }
        });
        entries.len() != before
    }

    fn broadcast(&self, calls: &[C]) {
        if calls.is_empty() {
            return;
        }
        for (_, notifier) in self.entries.read().iter() {
            for call in calls {
                notifier.notify(call.clone());
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn notifiers(&self) -> Vec<Arc<ListenerNotifier<L, C>>> {
        self.entries
            .read()
            .iter()
            .map(|(_, notifier)| notifier.clone())
            .collect()
    }

    fn pause(&self) {
        for notifier in self.notifiers() {
            notifier.pause();
        }
    }

    fn resume(&self) {
        for notifier in self.notifiers() {
            notifier.resume();
        }
    }

    async fn flush(&self) {
        let notifiers = self.notifiers();
        join_all(notifiers.iter().map(|notifier| notifier.flush())).await;
    }

    fn close_all(&self) {
        for (_, notifier) in self.entries.write().drain(..) {
            notifier.close();
        }
    }
}

fn spawn_pump<F>(
    mut rx: mpsc::Receiver<Vec<u8>>,
    dispatcher: Arc<NotificationDispatcher>,
    on_end: F,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            dispatcher.dispatch(&raw).await;
        }
        on_end.await;
    })
}

// ============================================================================
// Rule subscriptions
// ============================================================================

struct RuleInner<T: RuleSource> {
    stream: String,
    source: Arc<T>,
    dispatcher: Arc<NotificationDispatcher>,
    replica: Mutex<RuleSetReplicator>,
    listeners: ListenerSet<dyn RuleListener, RuleCall>,
    closed: AtomicBool,
}

impl<T: RuleSource> RuleInner<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fetch and install the authoritative set. Caller holds the replica lock.
    async fn resync(
        &self,
        replica: &mut RuleSetReplicator,
        since: ModificationCounter,
    ) -> Result<Option<RuleChanges>> {
        let snapshot = self
            .source
            .fetch_rule_snapshot(&self.stream, since)
            .await
            .map_err(|e| SdkError::ResyncFailed(e.to_string()))?;

        if self.is_closed() {
            debug!(stream = %self.stream, "discarding resync completed after teardown");
            return Ok(None);
        }

        match replica.resync(snapshot) {
            ResyncOutcome::Replaced(changes) => {
                info!(
                    stream = %self.stream,
                    %since,
                    version = %replica.version(),
                    added = changes.added.len(),
                    removed = changes.removed.len(),
                    "rule resync complete"
                );
                Ok(Some(changes))
            }
            ResyncOutcome::Stale => Ok(None),
        }
    }

    /// Stop feeding the replica. Pending calls are discarded only on request.
    async fn teardown(&self, discard_pending: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatcher.deregister(&self.stream);
        self.source.unsubscribe_rules(&self.stream).await;
        if discard_pending {
            self.listeners.close_all();
        }
        info!(stream = %self.stream, "rule subscription closed");
    }

    /// Synchronous teardown for a handle dropped without `close()`.
    fn detach(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.dispatcher.deregister(&self.stream);
            self.source.forget_rules(&self.stream);
            debug!(stream = %self.stream, "rule subscription dropped");
        }
        self.listeners.close_all();
    }

    async fn on_disconnected(&self) {
        if !self.is_closed() {
            warn!(stream = %self.stream, "transport disconnected");
            self.teardown(false).await;
        }
    }
}

#[async_trait]
impl<T: RuleSource> RuleRoute for RuleInner<T> {
    async fn on_rule_message(&self, message: RuleMessage) {
        if self.is_closed() {
            return;
        }
        let mut replica = self.replica.lock().await;
        if self.is_closed() {
            return;
        }

        let changes = match message {
            RuleMessage::Delta(delta) => match replica.apply_delta(&delta) {
                Ok(ApplyOutcome::Applied(changes)) => Some(changes),
                Ok(ApplyOutcome::Stale) => None,
                Ok(ApplyOutcome::Gap {
                    since,
                    received_from,
                }) => {
                    debug!(
                        stream = %self.stream,
                        %since,
                        from = %received_from,
                        "gap detected, resyncing"
                    );
                    match self.resync(&mut replica, since).await {
                        Ok(changes) => changes,
                        Err(e) => {
                            error!(stream = %self.stream, error = %e, "closing rule subscription");
                            drop(replica);
                            self.teardown(false).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "dropping rule delta");
                    None
                }
            },
            RuleMessage::Snapshot(snapshot) => match replica.resync(snapshot) {
                ResyncOutcome::Replaced(changes) => Some(changes),
                ResyncOutcome::Stale => None,
            },
        };

        if let Some(changes) = changes {
            self.listeners.broadcast(&RuleCall::from_changes(changes));
        }
    }
}

/// A live mirror of one server-side rule set.
pub struct RuleSubscription<T: RuleSource> {
    inner: Arc<RuleInner<T>>,
    pump: JoinHandle<()>,
}

impl<T: RuleSource> RuleSubscription<T> {
    pub(crate) async fn open(
        stream: impl Into<String>,
        source: Arc<T>,
        dispatcher: Arc<NotificationDispatcher>,
        config: &ClientConfig,
    ) -> Result<Self> {
        let stream = stream.into();
        if dispatcher.is_routed(&stream) {
            return Err(SdkError::AlreadySubscribed(stream));
        }

        // Subscribe before seeding so nothing published in between is missed.
        let rx = source
            .subscribe_rules(&stream)
            .await
            .map_err(|e| SdkError::TransportDisconnected(e.to_string()))?;
        let snapshot = match source
            .fetch_rule_snapshot(&stream, ModificationCounter::ZERO)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                source.unsubscribe_rules(&stream).await;
                return Err(SdkError::ResyncFailed(e.to_string()));
            }
        };
        let version = snapshot.version;
        let rule_count = snapshot.rules.len();

        let inner = Arc::new(RuleInner {
            stream: stream.clone(),
            source: source.clone(),
            dispatcher: dispatcher.clone(),
            replica: Mutex::new(RuleSetReplicator::seeded(snapshot)),
            listeners: ListenerSet::new(config.coalesce_results),
            closed: AtomicBool::new(false),
        });

        if !dispatcher.register(stream.clone(), Route::Rules(inner.clone())) {
            source.unsubscribe_rules(&stream).await;
            return Err(SdkError::AlreadySubscribed(stream));
        }

        let pump = spawn_pump(rx, dispatcher, {
            let inner = inner.clone();
            async move { inner.on_disconnected().await }
        });

        info!(%stream, %version, rules = rule_count, "rule subscription opened");
        Ok(Self { inner, pump })
    }

    pub fn stream(&self) -> &str {
        &self.inner.stream
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Register a listener. It first hears about every rule already held.
    pub async fn add_listener(&self, listener: Arc<dyn RuleListener>) -> Result<ListenerId> {
        let replica = self.inner.replica.lock().await;
        if self.is_closed() {
            return Err(SdkError::SubscriptionClosed(self.inner.stream.clone()));
        }
        let catch_up = RuleCall::from_changes(RuleChanges {
            added: replica.rules().cloned().collect(),
            removed: Vec::new(),
        });
        Ok(self.inner.listeners.add(listener, catch_up))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub async fn version(&self) -> ModificationCounter {
        self.inner.replica.lock().await.version()
    }

    pub async fn rules(&self) -> Vec<Rule> {
        self.inner.replica.lock().await.rules().cloned().collect()
    }

    pub async fn snapshot(&self) -> RuleSnapshot {
        self.inner.replica.lock().await.snapshot()
    }

    pub async fn resync_count(&self) -> u64 {
        self.inner.replica.lock().await.resync_count()
    }

    /// Hold delivery to every listener; calls keep queueing.
    pub fn pause(&self) {
        self.inner.listeners.pause();
    }

    pub fn resume(&self) {
        self.inner.listeners.resume();
    }

    /// Wait until every listener has received everything queued so far.
    pub async fn flush(&self) {
        self.inner.listeners.flush().await;
    }

    /// Unsubscribe, stop the pump and discard undelivered calls.
    pub async fn close(&self) {
        self.inner.teardown(true).await;
        self.pump.abort();
    }
}

impl<T: RuleSource> Drop for RuleSubscription<T> {
    fn drop(&mut self) {
        self.pump.abort();
        self.inner.detach();
    }
}

// ============================================================================
// View subscriptions
// ============================================================================

struct ViewInner<T: ViewSource> {
    view: String,
    source: Arc<T>,
    dispatcher: Arc<NotificationDispatcher>,
    reconciler: Mutex<ResultReconciler>,
    listeners: ListenerSet<dyn ViewListener, ViewCall>,
    closed: AtomicBool,
}

/// The listener call for a merge, if the merge is worth reporting.
fn result_call(
    classification: Classification,
    kind: ResultKind,
    full: ResultSnapshot,
    delta: ResultFragment,
) -> Option<ViewCall> {
    // Only a new cycle is reported without a visible change.
    if classification != Classification::New && delta.is_empty() {
        return None;
    }
    Some(match kind {
        ResultKind::Full => ViewCall::Completed { full, delta },
        ResultKind::Fragment => ViewCall::FragmentCompleted { full, delta },
    })
}

impl<T: ViewSource> ViewInner<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reconcile one result. Caller holds the reconciler lock.
    async fn reconcile(
        &self,
        reconciler: &mut ResultReconciler,
        incoming: IncomingResult,
    ) -> Result<Vec<ViewCall>> {
        let outcome = reconciler.reconcile(incoming.clone());
        let (baseline_time, incoming_time) = match outcome {
            ReconcileOutcome::Merged {
                classification,
                kind,
                baseline,
                delta,
            } => return Ok(result_call(classification, kind, baseline, delta).into_iter().collect()),
            ReconcileOutcome::Discarded => return Ok(Vec::new()),
            ReconcileOutcome::Discontinuity {
                baseline_time,
                incoming_time,
            } => (baseline_time, incoming_time),
        };

        debug!(
            view = %self.view,
            baseline = %baseline_time,
            logical_time = %incoming_time,
            "missed result cycles, resyncing"
        );
        let fetched = self
            .source
            .fetch_result_snapshot(&self.view)
            .await
            .map_err(|e| SdkError::ResyncFailed(e.to_string()))?;

        if self.is_closed() {
            debug!(view = %self.view, "discarding resync completed after teardown");
            return Ok(Vec::new());
        }

        let mut calls = Vec::new();
        if let Some(snapshot) = fetched {
            if let Some(delta) = reconciler.install(snapshot) {
                if let Some(full) = reconciler.baseline() {
                    info!(
                        view = %self.view,
                        logical_time = %full.logical_time,
                        "result resync complete"
                    );
                    calls.push(ViewCall::Completed {
                        full: full.clone(),
                        delta,
                    });
                }
            }
        }

        // A snapshot at or past the fragment's time already contains it.
        if reconciler.baseline_time() >= Some(incoming.logical_time) {
            debug!(
                view = %self.view,
                logical_time = %incoming.logical_time,
                "fragment superseded by resync snapshot"
            );
            return Ok(calls);
        }

        if let ReconcileOutcome::Merged {
            classification,
            kind,
            baseline,
            delta,
        } = reconciler.reconcile_unchecked(incoming)
        {
            calls.extend(result_call(classification, kind, baseline, delta));
        }
        Ok(calls)
    }

    async fn teardown(&self, discard_pending: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatcher.deregister(&self.view);
        self.source.unsubscribe_view(&self.view).await;
        if discard_pending {
            self.listeners.close_all();
        }
        info!(view = %self.view, "view subscription closed");
    }

    fn detach(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.dispatcher.deregister(&self.view);
            self.source.forget_view(&self.view);
            debug!(view = %self.view, "view subscription dropped");
        }
        self.listeners.close_all();
    }

    /// Tell listeners the client is going away, then stop feeding the baseline.
    async fn fail(&self, reason: String) {
        self.listeners
            .broadcast(&[ViewCall::Shutdown(Some(reason))]);
        self.teardown(false).await;
    }

    async fn on_disconnected(&self) {
        if !self.is_closed() {
            warn!(view = %self.view, "transport disconnected");
            self.fail(SdkError::TransportDisconnected(self.view.clone()).to_string())
                .await;
        }
    }
}

#[async_trait]
impl<T: ViewSource> ViewRoute for ViewInner<T> {
    async fn on_view_call(&self, call: PendingCall) {
        if self.is_closed() {
            return;
        }
        let mut reconciler = self.reconciler.lock().await;
        if self.is_closed() {
            return;
        }

        let calls = match call {
            PendingCall::Completed(full) => {
                self.reconcile(&mut reconciler, IncomingResult::full(full))
                    .await
            }
            PendingCall::FragmentCompleted(fragment) => {
                self.reconcile(&mut reconciler, IncomingResult::fragment(fragment))
                    .await
            }
            PendingCall::Started(time) => Ok(vec![ViewCall::Started(time)]),
            PendingCall::DefinitionCompiled => Ok(vec![ViewCall::DefinitionCompiled]),
            PendingCall::CompilationFailed(reason) => Ok(vec![ViewCall::CompilationFailed(reason)]),
            PendingCall::ExecutionFailed {
                logical_time,
                reason,
            } => Ok(vec![ViewCall::ExecutionFailed {
                logical_time,
                reason,
            }]),
            PendingCall::ProcessCompleted => Ok(vec![ViewCall::ProcessCompleted]),
            PendingCall::ProcessTerminated { interrupted } => {
                Ok(vec![ViewCall::ProcessTerminated { interrupted }])
            }
            PendingCall::Shutdown => Ok(vec![ViewCall::Shutdown(None)]),
        };

        match calls {
            Ok(calls) => self.listeners.broadcast(&calls),
            Err(e) => {
                error!(view = %self.view, error = %e, "closing view subscription");
                drop(reconciler);
                self.fail(e.to_string()).await;
            }
        }
    }
}

/// A live, reconciled view of one computation's results.
pub struct ViewSubscription<T: ViewSource> {
    inner: Arc<ViewInner<T>>,
    pump: JoinHandle<()>,
}

impl<T: ViewSource> ViewSubscription<T> {
    pub(crate) async fn open(
        view: impl Into<String>,
        source: Arc<T>,
        dispatcher: Arc<NotificationDispatcher>,
        config: &ClientConfig,
    ) -> Result<Self> {
        let view = view.into();
        if dispatcher.is_routed(&view) {
            return Err(SdkError::AlreadySubscribed(view));
        }

        let rx = source
            .subscribe_view(&view)
            .await
            .map_err(|e| SdkError::TransportDisconnected(e.to_string()))?;
        let latest = match source.fetch_result_snapshot(&view).await {
            Ok(latest) => latest,
            Err(e) => {
                source.unsubscribe_view(&view).await;
                return Err(SdkError::ResyncFailed(e.to_string()));
            }
        };
        let seeded_at = latest.as_ref().map(|s| s.logical_time);

        let reconciler = match latest {
            Some(snapshot) => ResultReconciler::seeded(snapshot),
            None => ResultReconciler::new(),
        }
        .with_discontinuity_detection(config.resync_results_on_gap);

        let inner = Arc::new(ViewInner {
            view: view.clone(),
            source: source.clone(),
            dispatcher: dispatcher.clone(),
            reconciler: Mutex::new(reconciler),
            listeners: ListenerSet::new(config.coalesce_results),
            closed: AtomicBool::new(false),
        });

        if !dispatcher.register(view.clone(), Route::View(inner.clone())) {
            source.unsubscribe_view(&view).await;
            return Err(SdkError::AlreadySubscribed(view));
        }

        let pump = spawn_pump(rx, dispatcher, {
            let inner = inner.clone();
            async move { inner.on_disconnected().await }
        });

        info!(%view, logical_time = ?seeded_at, "view subscription opened");
        Ok(Self { inner, pump })
    }

    pub fn view(&self) -> &str {
        &self.inner.view
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Register a listener. If a baseline is held, it is delivered first as a completed cycle.
    pub async fn add_listener(&self, listener: Arc<dyn ViewListener>) -> Result<ListenerId> {
        let reconciler = self.inner.reconciler.lock().await;
        if self.is_closed() {
            return Err(SdkError::SubscriptionClosed(self.inner.view.clone()));
        }
        let catch_up = reconciler
            .baseline()
            .map(|full| ViewCall::Completed {
                full: full.clone(),
                delta: full.diff(None),
            })
            .into_iter()
            .collect();
        Ok(self.inner.listeners.add(listener, catch_up))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub async fn baseline(&self) -> Option<ResultSnapshot> {
        self.inner.reconciler.lock().await.baseline().cloned()
    }

    pub async fn stats(&self) -> ReconcilerStats {
        self.inner.reconciler.lock().await.stats().clone()
    }

    pub fn pause(&self) {
        self.inner.listeners.pause();
    }

    pub fn resume(&self) {
        self.inner.listeners.resume();
    }

    pub async fn flush(&self) {
        self.inner.listeners.flush().await;
    }

    pub async fn close(&self) {
        self.inner.teardown(true).await;
        self.pump.abort();
    }
}

impl<T: ViewSource> Drop for ViewSubscription<T> {
    fn drop(&mut self) {
        self.pump.abort();
        self.inner.detach();
    }
}
