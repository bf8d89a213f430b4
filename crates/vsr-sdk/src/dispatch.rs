//! Wire envelope decoding and routing of inbound notifications.
//!
//! Every message on the wire is a JSON envelope:
//!
//! ```text
//! { "route": "<stream or view id>", "body": { "kind": "rule_delta", ... } }
//! ```
//!
//! The dispatcher decodes the body and hands it to whichever subscription
//! registered the route. Nothing here ever fails towards the transport: bad
//! or unroutable messages are logged, counted and dropped.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};
use vsr_core::{LogicalTime, ResultFragment, ResultSnapshot, RuleDelta, RuleSnapshot};
use vsr_delta::ReplicaError;

/// Body of a wire envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireBody {
    RuleDelta(RuleDelta),
    RuleSnapshot(RuleSnapshot),
    Started {
        #[serde(rename = "logicalTime")]
        logical_time: LogicalTime,
    },
    Completed(ResultSnapshot),
    FragmentCompleted(ResultFragment),
    DefinitionCompiled,
    CompilationFailed {
        reason: String,
    },
    ExecutionFailed {
        #[serde(rename = "logicalTime")]
        logical_time: LogicalTime,
        reason: String,
    },
    ProcessCompleted,
    ProcessTerminated {
        interrupted: bool,
    },
    Shutdown,
}

/// A routed wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub route: String,
    pub body: WireBody,
}

impl Envelope {
    pub fn new(route: impl Into<String>, body: WireBody) -> Self {
        Self {
            route: route.into(),
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse an envelope, rejecting rule deltas that cover no versions.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        if let WireBody::RuleDelta(delta) = &envelope.body {
            if !delta.is_well_formed() {
                return Err(ReplicaError::EmptyRange {
                    from: delta.from_version,
                    to: delta.to_version,
                }
                .into());
            }
        }
        Ok(envelope)
    }
}

/// A decoded rule-stream message.
#[derive(Clone, Debug, PartialEq)]
pub enum RuleMessage {
    Delta(RuleDelta),
    Snapshot(RuleSnapshot),
}

/// A decoded view notification that has not been reconciled yet.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingCall {
    Started(LogicalTime),
    Completed(ResultSnapshot),
    FragmentCompleted(ResultFragment),
    DefinitionCompiled,
    CompilationFailed(String),
    ExecutionFailed {
        logical_time: LogicalTime,
        reason: String,
    },
    ProcessCompleted,
    ProcessTerminated {
        interrupted: bool,
    },
    Shutdown,
}

/// What a body decodes to.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Rules(RuleMessage),
    View(PendingCall),
}

impl From<WireBody> for Inbound {
    fn from(body: WireBody) -> Self {
        match body {
            WireBody::RuleDelta(delta) => Inbound::Rules(RuleMessage::Delta(delta)),
            WireBody::RuleSnapshot(snapshot) => Inbound::Rules(RuleMessage::Snapshot(snapshot)),
            WireBody::Started { logical_time } => Inbound::View(PendingCall::Started(logical_time)),
            WireBody::Completed(full) => Inbound::View(PendingCall::Completed(full)),
            WireBody::FragmentCompleted(fragment) => {
                Inbound::View(PendingCall::FragmentCompleted(fragment))
            }
            WireBody::DefinitionCompiled => Inbound::View(PendingCall::DefinitionCompiled),
            WireBody::CompilationFailed { reason } => {
                Inbound::View(PendingCall::CompilationFailed(reason))
            }
            WireBody::ExecutionFailed {
                logical_time,
                reason,
            } => Inbound::View(PendingCall::ExecutionFailed {
                logical_time,
                reason,
            }),
            WireBody::ProcessCompleted => Inbound::View(PendingCall::ProcessCompleted),
            WireBody::ProcessTerminated { interrupted } => {
                Inbound::View(PendingCall::ProcessTerminated { interrupted })
            }
            WireBody::Shutdown => Inbound::View(PendingCall::Shutdown),
        }
    }
}

/// Receiver side of a rule stream route.
#[async_trait]
pub trait RuleRoute: Send + Sync {
    async fn on_rule_message(&self, message: RuleMessage);
}

/// Receiver side of a view route.
#[async_trait]
pub trait ViewRoute: Send + Sync {
    async fn on_view_call(&self, call: PendingCall);
}

/// A registered route target.
#[derive(Clone)]
pub enum Route {
    Rules(Arc<dyn RuleRoute>),
    View(Arc<dyn ViewRoute>),
}

/// What happened to one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the registered subscription.
    Routed,
    /// Not valid JSON, not a known body, or an invalid delta.
    Malformed,
    /// No subscription registered for the route.
    Unrouted,
    /// A rule body on a view route, or the reverse.
    Mismatched,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub routed: u64,
    pub malformed: u64,
    pub unrouted: u64,
    pub mismatched: u64,
}

/// Decodes raw transport messages and routes them to subscriptions.
#[derive(Default)]
pub struct NotificationDispatcher {
    routes: RwLock<HashMap<String, Route>>,
    stats: Mutex<DispatchStats>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. Returns false if the id is already taken.
    pub fn register(&self, id: impl Into<String>, route: Route) -> bool {
        let mut routes = self.routes.write();
        let id = id.into();
        if routes.contains_key(&id) {
            return false;
        }
        routes.insert(id, route);
        true
    }

    pub fn deregister(&self, id: &str) -> bool {
        self.routes.write().remove(id).is_some()
    }

    pub fn is_routed(&self, id: &str) -> bool {
        self.routes.read().contains_key(id)
    }

    /// Ids of every registered route, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().clone()
    }

    /// Decode one raw message and hand it to its route.
    pub async fn dispatch(&self, raw: &[u8]) -> DispatchOutcome {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "dropping malformed message");
                return self.record(DispatchOutcome::Malformed);
            }
        };

        // Clone the target out so the table lock is not held across the await.
        let route = self.routes.read().get(&envelope.route).cloned();
        let Some(route) = route else {
            warn!(route = %envelope.route, "dropping message for unknown route");
            return self.record(DispatchOutcome::Unrouted);
        };

        trace!(route = %envelope.route, "dispatching");
        match (route, Inbound::from(envelope.body)) {
            (Route::Rules(target), Inbound::Rules(message)) => {
                target.on_rule_message(message).await;
                self.record(DispatchOutcome::Routed)
            }
            (Route::View(target), Inbound::View(call)) => {
                target.on_view_call(call).await;
                self.record(DispatchOutcome::Routed)
            }
            _ => {
                warn!(route = %envelope.route, "dropping message of the wrong kind for route");
                self.record(DispatchOutcome::Mismatched)
            }
        }
    }

    fn record(&self, outcome: DispatchOutcome) -> DispatchOutcome {
        let mut stats = self.stats.lock();
        match outcome {
            DispatchOutcome::Routed => stats.routed += 1,
            DispatchOutcome::Malformed => stats.malformed += 1,
            DispatchOutcome::Unrouted => stats.unrouted += 1,
            DispatchOutcome::Mismatched => stats.mismatched += 1,
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SdkError;

    #[derive(Default)]
    struct Recorder {
        rules: Mutex<Vec<RuleMessage>>,
        calls: Mutex<Vec<PendingCall>>,
    }

    #[async_trait]
    impl RuleRoute for Recorder {
        async fn on_rule_message(&self, message: RuleMessage) {
            self.rules.lock().push(message);
        }
    }

    #[async_trait]
    impl ViewRoute for Recorder {
        async fn on_view_call(&self, call: PendingCall) {
            self.calls.lock().push(call);
        }
    }

    fn encode(route: &str, body: WireBody) -> Vec<u8> {
        Envelope::new(route, body).encode().unwrap()
    }

    #[test]
    fn test_wire_shape() {
        let raw = encode("rules", WireBody::RuleDelta(RuleDelta::new(5, 6).with_added(["C"])));
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();

        assert_eq!(json["route"], "rules");
        assert_eq!(json["body"]["kind"], "rule_delta");
        assert_eq!(json["body"]["fromVersion"], 5);
        assert_eq!(json["body"]["toVersion"], 6);
        assert_eq!(json["body"]["added"][0], "C");
    }

    #[test]
    fn test_result_bodies_decode() {
        let raw = br#"{"route":"v","body":{"kind":"fragment_completed","logicalTime":101,
            "values":{"Y":{"type":"int","value":3}}}}"#;
        let envelope = Envelope::decode(raw).unwrap();

        let expected = ResultFragment::new(101, [("Y", 3)]);
        assert_eq!(envelope.body, WireBody::FragmentCompleted(expected));

        let raw = br#"{"route":"v","body":{"kind":"shutdown"}}"#;
        assert_eq!(Envelope::decode(raw).unwrap().body, WireBody::Shutdown);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            Envelope::decode(b"{\"route\":"),
            Err(SdkError::Malformed(_))
        ));

        let raw = encode("r", WireBody::RuleDelta(RuleDelta::new(4, 4)));
        assert_eq!(
            Envelope::decode(&raw).unwrap_err(),
            SdkError::Replica(ReplicaError::EmptyRange {
                from: 4.into(),
                to: 4.into(),
            })
        );
    }

    #[tokio::test]
    async fn test_routes_by_kind() {
        let dispatcher = NotificationDispatcher::new();
        let rules = Arc::new(Recorder::default());
        let view = Arc::new(Recorder::default());
        assert!(dispatcher.register("r", Route::Rules(rules.clone())));
        assert!(dispatcher.register("v", Route::View(view.clone())));

        let delta = RuleDelta::new(0, 1).with_added(["A"]);
        let outcome = dispatcher
            .dispatch(&encode("r", WireBody::RuleDelta(delta.clone())))
            .await;
        assert_eq!(outcome, DispatchOutcome::Routed);

        let outcome = dispatcher
            .dispatch(&encode("v", WireBody::ProcessCompleted))
            .await;
        assert_eq!(outcome, DispatchOutcome::Routed);

        assert_eq!(*rules.rules.lock(), vec![RuleMessage::Delta(delta)]);
        assert_eq!(*view.calls.lock(), vec![PendingCall::ProcessCompleted]);
    }

    #[tokio::test]
    async fn test_bad_messages_are_dropped() {
        let dispatcher = NotificationDispatcher::new();
        let view = Arc::new(Recorder::default());
        dispatcher.register("v", Route::View(view.clone()));

        assert_eq!(dispatcher.dispatch(b"not json").await, DispatchOutcome::Malformed);
        assert_eq!(
            dispatcher.dispatch(br#"{"route":"v","body":{"kind":"bogus"}}"#).await,
            DispatchOutcome::Malformed
        );
        assert_eq!(
            dispatcher
                .dispatch(&encode("v", WireBody::RuleDelta(RuleDelta::new(3, 3))))
                .await,
            DispatchOutcome::Malformed
        );
        assert_eq!(
            dispatcher
                .dispatch(&encode("nowhere", WireBody::Shutdown))
                .await,
            DispatchOutcome::Unrouted
        );
        assert_eq!(
            dispatcher
                .dispatch(&encode("v", WireBody::RuleSnapshot(RuleSnapshot::default())))
                .await,
            DispatchOutcome::Mismatched
        );

        // The route still works after all of that.
        assert_eq!(
            dispatcher.dispatch(&encode("v", WireBody::Shutdown)).await,
            DispatchOutcome::Routed
        );

        let stats = dispatcher.stats();
        assert_eq!(stats.malformed, 3);
        assert_eq!(stats.unrouted, 1);
        assert_eq!(stats.mismatched, 1);
        assert_eq!(stats.routed, 1);
    }

    #[test]
    fn test_register_is_exclusive() {
        let dispatcher = NotificationDispatcher::new();
        let rules = Arc::new(Recorder::default());

        assert!(dispatcher.register("r", Route::Rules(rules.clone())));
        assert!(!dispatcher.register("r", Route::Rules(rules)));
        assert_eq!(dispatcher.routes(), vec!["r".to_string()]);

        assert!(dispatcher.deregister("r"));
        assert!(!dispatcher.is_routed("r"));
    }
}
