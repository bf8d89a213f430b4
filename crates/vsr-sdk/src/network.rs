//! Transport abstractions for rule streams and views.
//!
//! A transport offers pub/sub of raw envelopes plus the synchronous snapshot
//! RPCs used for seeding and resync. [`MemoryTransport`] implements both
//! sides in-process and can inject delivery faults for testing.

use crate::dispatch::{Envelope, WireBody};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use vsr_core::{
    overlay, ModificationCounter, ResultFragment, ResultSnapshot, Rule, RuleDelta, RuleSnapshot,
};
use vsr_delta::{DeliverySimulator, DeliveryStats, NetworkConfig};

/// Transport error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Disconnected")]
    Disconnected,

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Source of rule-set notifications.
#[async_trait]
pub trait RuleSource: Send + Sync + 'static {
    /// Subscribe to raw envelopes for a rule stream.
    async fn subscribe_rules(&self, stream: &str)
        -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    /// Fetch the authoritative rule set. Used for seeding and for gap resync.
    async fn fetch_rule_snapshot(
        &self,
        stream: &str,
        since: ModificationCounter,
    ) -> Result<RuleSnapshot, TransportError>;

    async fn unsubscribe_rules(&self, stream: &str);

    /// Drop the subscription without awaiting. Called when a handle is dropped unclosed.
    fn forget_rules(&self, stream: &str);
}

/// Source of computation-cycle notifications for views.
#[async_trait]
pub trait ViewSource: Send + Sync + 'static {
    /// Subscribe to raw envelopes for a view.
    async fn subscribe_view(&self, view: &str) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    /// Fetch the latest full result, if the view has completed a cycle.
    async fn fetch_result_snapshot(
        &self,
        view: &str,
    ) -> Result<Option<ResultSnapshot>, TransportError>;

    async fn unsubscribe_view(&self, view: &str);

    /// Drop the subscription without awaiting. Called when a handle is dropped unclosed.
    fn forget_view(&self, view: &str);
}

#[derive(Debug, Default)]
struct RuleStreamState {
    version: ModificationCounter,
    rules: BTreeSet<Rule>,
}

/// RPC counters, for asserting on resync behaviour.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcStats {
    pub rule_fetches: u64,
    pub result_fetches: u64,
}

/// In-memory transport for testing and simulation.
///
/// Holds the authoritative state of every rule stream and view. Published
/// messages go through a [`DeliverySimulator`]: on a perfect network they are
/// delivered right away, otherwise they stay in flight until [`flush`](Self::flush).
pub struct MemoryTransport {
    buffer: usize,
    rule_streams: RwLock<HashMap<String, RuleStreamState>>,
    views: RwLock<HashMap<String, Option<ResultSnapshot>>>,
    subscribers: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    wire: Mutex<DeliverySimulator<(String, Vec<u8>)>>,
    rule_fetches: AtomicU64,
    result_fetches: AtomicU64,
    fail_fetches: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
}

impl MemoryTransport {
    /// A fault-free transport.
    pub fn new() -> Self {
        Self::with_network(NetworkConfig::default())
    }

    /// A transport whose deliveries follow `config`.
    pub fn with_network(config: NetworkConfig) -> Self {
        Self {
            buffer: 256,
            rule_streams: RwLock::new(HashMap::new()),
            views: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            wire: Mutex::new(DeliverySimulator::new(config)),
            rule_fetches: AtomicU64::new(0),
            result_fetches: AtomicU64::new(0),
            fail_fetches: AtomicBool::new(false),
            fetch_delay: Mutex::new(None),
        }
    }

    /// Capacity of each subscriber channel.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn network(&self) -> NetworkConfig {
        self.wire.lock().config().clone()
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.wire.lock().stats().clone()
    }

    pub fn rpc_stats(&self) -> RpcStats {
        RpcStats {
            rule_fetches: self.rule_fetches.load(Ordering::SeqCst),
            result_fetches: self.result_fetches.load(Ordering::SeqCst),
        }
    }

    /// Make every snapshot RPC fail with [`TransportError::Disconnected`].
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Delay every snapshot RPC.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock() = delay;
    }

    // ------------------------------------------------------------------
    // Authoritative state
    // ------------------------------------------------------------------

    /// Declare a rule stream with its initial contents.
    pub fn create_rule_stream<I, R>(&self, stream: impl Into<String>, version: u64, rules: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<Rule>,
    {
        self.rule_streams.write().insert(
            stream.into(),
            RuleStreamState {
                version: ModificationCounter::new(version),
                rules: rules.into_iter().map(Into::into).collect(),
            },
        );
    }

    /// Declare a view that has not completed a cycle yet.
    pub fn create_view(&self, view: impl Into<String>) {
        self.views.write().insert(view.into(), None);
    }

    /// Replace a view's latest result without publishing anything.
    pub fn set_result_snapshot(&self, view: impl Into<String>, snapshot: ResultSnapshot) {
        self.views.write().insert(view.into(), Some(snapshot));
    }

    pub fn rule_snapshot(&self, stream: &str) -> Option<RuleSnapshot> {
        self.rule_streams
            .read()
            .get(stream)
            .map(|state| RuleSnapshot {
                version: state.version,
                rules: state.rules.clone(),
            })
    }

    pub fn result_snapshot(&self, view: &str) -> Option<ResultSnapshot> {
        self.views.read().get(view).cloned().flatten()
    }

    /// Change a rule stream and publish the resulting delta.
    ///
    /// Bumps the stream's version by one and returns the delta that was sent.
    pub async fn publish_rule_change<A, R, B, S>(
        &self,
        stream: &str,
        added: A,
        removed: B,
    ) -> Result<RuleDelta, TransportError>
    where
        A: IntoIterator<Item = R>,
        R: Into<Rule>,
        B: IntoIterator<Item = S>,
        S: Into<Rule>,
    {
        let delta = {
            let mut streams = self.rule_streams.write();
            let state = streams
                .get_mut(stream)
                .ok_or_else(|| TransportError::UnknownStream(stream.to_string()))?;

            let added: BTreeSet<Rule> = added.into_iter().map(Into::into).collect();
            let removed: BTreeSet<Rule> = removed.into_iter().map(Into::into).collect();
            for rule in &removed {
                state.rules.remove(rule);
            }
            state.rules.extend(added.iter().cloned());

            let delta = RuleDelta {
                from_version: state.version,
                to_version: state.version.next(),
                added,
                removed,
            };
            state.version = delta.to_version;
            delta
        };

        self.send(stream, WireBody::RuleDelta(delta.clone())).await?;
        Ok(delta)
    }

    /// Publish a full result and make it the view's latest snapshot.
    pub async fn publish_full(
        &self,
        view: &str,
        snapshot: ResultSnapshot,
    ) -> Result<(), TransportError> {
        {
            let mut views = self.views.write();
            let latest = views
                .get_mut(view)
                .ok_or_else(|| TransportError::UnknownStream(view.to_string()))?;
            let keep_held = matches!(latest, Some(held) if held.logical_time > snapshot.logical_time);
            if !keep_held {
                *latest = Some(snapshot.clone());
            }
        }
        self.send(view, WireBody::Completed(snapshot)).await
    }

    /// Publish a fragment and fold it into the view's latest snapshot.
    pub async fn publish_fragment(
        &self,
        view: &str,
        fragment: ResultFragment,
    ) -> Result<(), TransportError> {
        {
            let mut views = self.views.write();
            let latest = views
                .get_mut(view)
                .ok_or_else(|| TransportError::UnknownStream(view.to_string()))?;
            let next = match latest.take() {
                Some(held) => ResultSnapshot {
                    logical_time: held.logical_time.max(fragment.logical_time),
                    values: overlay(&held.values, &fragment.values),
                },
                None => ResultSnapshot {
                    logical_time: fragment.logical_time,
                    values: fragment.values.clone(),
                },
            };
            *latest = Some(next);
        }
        self.send(view, WireBody::FragmentCompleted(fragment)).await
    }

    /// Send a body without touching authoritative state.
    pub async fn send(&self, route: &str, body: WireBody) -> Result<(), TransportError> {
        let raw = Envelope::new(route, body)
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.send_raw(route, raw).await;
        Ok(())
    }

    /// Put raw bytes on the wire towards `route`'s subscriber.
    pub async fn send_raw(&self, route: &str, raw: Vec<u8>) {
        let perfect = {
            let mut wire = self.wire.lock();
            wire.send((route.to_string(), raw));
            wire.config().is_perfect()
        };
        if perfect {
            self.flush().await;
        }
    }

    /// Deliver everything in flight. Returns the number of messages handed to subscribers.
    pub async fn flush(&self) -> usize {
        let batch = self.wire.lock().drain();
        let mut delivered = 0;
        for (route, raw) in batch {
            let tx = self.subscribers.read().get(&route).cloned();
            match tx {
                Some(tx) => {
                    if tx.send(raw).await.is_ok() {
                        delivered += 1;
                    }
                }
                None => debug!(%route, "no subscriber, message dropped"),
            }
        }
        delivered
    }

    /// Let withheld messages through and deliver everything.
    pub async fn release_withheld(&self) -> usize {
        self.wire.lock().release_withheld();
        self.flush().await
    }

    /// Messages still held back by the simulated network.
    pub fn withheld_count(&self) -> usize {
        self.wire.lock().withheld_count()
    }

    /// Drop the subscriber for `route`, as if the connection broke.
    pub fn disconnect(&self, route: &str) -> bool {
        self.subscribers.write().remove(route).is_some()
    }

    pub fn has_subscriber(&self, route: &str) -> bool {
        self.subscribers.read().contains_key(route)
    }

    fn open_channel(&self, route: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.write().insert(route.to_string(), tx);
        rx
    }

    async fn before_fetch(&self) -> Result<(), TransportError> {
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleSource for MemoryTransport {
    async fn subscribe_rules(
        &self,
        stream: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        if !self.rule_streams.read().contains_key(stream) {
            return Err(TransportError::UnknownStream(stream.to_string()));
        }
        Ok(self.open_channel(stream))
    }

    async fn fetch_rule_snapshot(
        &self,
        stream: &str,
        since: ModificationCounter,
    ) -> Result<RuleSnapshot, TransportError> {
        self.rule_fetches.fetch_add(1, Ordering::SeqCst);
        self.before_fetch().await?;
        debug!(%stream, %since, "serving rule snapshot");
        self.rule_snapshot(stream)
            .ok_or_else(|| TransportError::UnknownStream(stream.to_string()))
    }

    async fn unsubscribe_rules(&self, stream: &str) {
        self.forget_rules(stream);
    }

    fn forget_rules(&self, stream: &str) {
        self.subscribers.write().remove(stream);
    }
}

#[async_trait]
impl ViewSource for MemoryTransport {
    async fn subscribe_view(&self, view: &str) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        if !self.views.read().contains_key(view) {
            return Err(TransportError::UnknownStream(view.to_string()));
        }
        Ok(self.open_channel(view))
    }

    async fn fetch_result_snapshot(
        &self,
        view: &str,
    ) -> Result<Option<ResultSnapshot>, TransportError> {
        self.result_fetches.fetch_add(1, Ordering::SeqCst);
        self.before_fetch().await?;
        let views = self.views.read();
        let latest = views
            .get(view)
            .ok_or_else(|| TransportError::UnknownStream(view.to_string()))?;
        Ok(latest.clone())
    }

    async fn unsubscribe_view(&self, view: &str) {
        self.forget_view(view);
    }

    fn forget_view(&self, view: &str) {
        self.subscribers.write().remove(view);
    }
}
