//! Shared listeners and polling helpers for SDK integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use vsr_sdk::{LogicalTime, ResultFragment, ResultSnapshot, Rule, RuleListener, ViewListener};

/// Poll `check` until it returns true, or panic after about two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Records every rule callback and mirrors the set it describes.
#[derive(Default)]
pub struct RuleLog {
    pub events: Mutex<Vec<String>>,
    pub mirror: Mutex<BTreeSet<Rule>>,
}

impl RuleLog {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn mirror(&self) -> BTreeSet<Rule> {
        self.mirror.lock().clone()
    }
}

fn names(rules: &[Rule]) -> String {
    rules
        .iter()
        .map(Rule::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

impl RuleListener for RuleLog {
    fn rule_added(&self, rule: &Rule) {
        self.events.lock().push(format!("+{}", rule));
        self.mirror.lock().insert(rule.clone());
    }

    fn rule_removed(&self, rule: &Rule) {
        self.events.lock().push(format!("-{}", rule));
        self.mirror.lock().remove(rule);
    }

    fn rules_added(&self, rules: &[Rule]) {
        self.events.lock().push(format!("+[{}]", names(rules)));
        self.mirror.lock().extend(rules.iter().cloned());
    }

    fn rules_removed(&self, rules: &[Rule]) {
        self.events.lock().push(format!("-[{}]", names(rules)));
        let mut mirror = self.mirror.lock();
        for rule in rules {
            mirror.remove(rule);
        }
    }
}

/// One recorded view callback.
#[derive(Clone, Debug, PartialEq)]
pub enum ViewEvent {
    Started(u64),
    Completed(ResultSnapshot, ResultFragment),
    Fragment(ResultSnapshot, ResultFragment),
    ExecutionFailed(u64, String),
    ProcessCompleted,
    Shutdown(Option<String>),
}

#[derive(Default)]
pub struct ViewLog {
    pub events: Mutex<Vec<ViewEvent>>,
}

impl ViewLog {
    pub fn events(&self) -> Vec<ViewEvent> {
        self.events.lock().clone()
    }

    pub fn last_full(&self) -> Option<ResultSnapshot> {
        self.events.lock().iter().rev().find_map(|event| match event {
            ViewEvent::Completed(full, _) | ViewEvent::Fragment(full, _) => Some(full.clone()),
            _ => None,
        })
    }
}

impl ViewListener for ViewLog {
    fn cycle_started(&self, logical_time: LogicalTime) {
        self.events
            .lock()
            .push(ViewEvent::Started(logical_time.get()));
    }

    fn cycle_completed(&self, full: &ResultSnapshot, delta: &ResultFragment) {
        self.events
            .lock()
            .push(ViewEvent::Completed(full.clone(), delta.clone()));
    }

    fn cycle_fragment_completed(&self, full: &ResultSnapshot, delta: &ResultFragment) {
        self.events
            .lock()
            .push(ViewEvent::Fragment(full.clone(), delta.clone()));
    }

    fn cycle_execution_failed(&self, logical_time: LogicalTime, reason: &str) {
        self.events
            .lock()
            .push(ViewEvent::ExecutionFailed(logical_time.get(), reason.to_string()));
    }

    fn process_completed(&self) {
        self.events.lock().push(ViewEvent::ProcessCompleted);
    }

    fn client_shutdown(&self, reason: Option<&str>) {
        self.events
            .lock()
            .push(ViewEvent::Shutdown(reason.map(str::to_string)));
    }
}
