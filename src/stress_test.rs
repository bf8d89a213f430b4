use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use vsr_delta::DeliveryStats;
use vsr_sdk::{
    Client, ClientConfig, MemoryTransport, NetworkConfig, ResultFragment, ResultSnapshot, Rule,
    RuleListener, SdkError, TargetId, Value, ViewListener,
};

/// How long replicas get to catch up once every message has been released.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Statistics collected during stress testing
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub name: &'static str,
    pub subscriptions: usize,
    pub operations: usize,
    pub delivery: DeliveryStats,
    pub resyncs: u64,
    pub snapshot_fetches: u64,
    pub listener_calls: u64,
    pub converged: usize,
    pub total_time: Duration,
    pub ops_per_second: f64,
}

impl StressTestStats {
    pub fn all_converged(&self) -> bool {
        self.converged == self.subscriptions
    }

    pub fn print(&self) {
        let verdict = if self.all_converged() { "yes" } else { "NO" };
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║  {:<58}║", format!("{} Statistics", self.name));
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Subscriptions:             {:>30} ║", self.subscriptions);
        println!("║  Operations Published:      {:>30} ║", self.operations);
        println!("║  Messages Sent:             {:>30} ║", self.delivery.sent);
        println!("║  Withheld / Dup / Reorder:  {:>30} ║",
                 format!("{} / {} / {}", self.delivery.withheld, self.delivery.duplicated, self.delivery.reordered));
        println!("║  Resyncs:                   {:>30} ║", self.resyncs);
        println!("║  Snapshot Fetches:          {:>30} ║", self.snapshot_fetches);
        println!("║  Listener Calls:            {:>30} ║", self.listener_calls);
        println!("║  Converged:                 {:>30} ║",
                 format!("{} ({}/{})", verdict, self.converged, self.subscriptions));
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Operations/Second:         {:>30.0} ║", self.ops_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Mirrors a rule set from listener callbacks alone.
#[derive(Default)]
struct RuleMirror {
    rules: Mutex<BTreeSet<Rule>>,
    calls: AtomicU64,
}

impl RuleListener for RuleMirror {
    fn rule_added(&self, rule: &Rule) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.rules.lock().insert(rule.clone());
    }

    fn rule_removed(&self, rule: &Rule) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.rules.lock().remove(rule);
    }

    fn rules_added(&self, rules: &[Rule]) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.rules.lock().extend(rules.iter().cloned());
    }

    fn rules_removed(&self, rules: &[Rule]) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut mirror = self.rules.lock();
        for rule in rules {
            mirror.remove(rule);
        }
    }
}

/// Keeps the last full result a view listener was handed.
#[derive(Default)]
struct ResultMirror {
    latest: Mutex<Option<ResultSnapshot>>,
    calls: AtomicU64,
}

impl ViewListener for ResultMirror {
    fn cycle_completed(&self, full: &ResultSnapshot, _delta: &ResultFragment) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        *self.latest.lock() = Some(full.clone());
    }

    fn cycle_fragment_completed(&self, full: &ResultSnapshot, _delta: &ResultFragment) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        *self.latest.lock() = Some(full.clone());
    }
}

enum RuleOp {
    Add(String),
    Remove(String),
}

/// Generator that yields random membership changes over a fixed rule universe
fn rule_op_generator(seed: u64, num_ops: usize, universe: usize) -> impl Stream<Item = RuleOp> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..num_ops {
            let rule = format!("rule-{}", rng.gen_range(0..universe));
            if rng.gen_bool(0.35) {
                yield RuleOp::Remove(rule);
            } else {
                yield RuleOp::Add(rule);
            }
        }
    }
}

enum ResultOp {
    Full(ResultSnapshot),
    Fragment(ResultFragment),
}

fn target(idx: usize) -> TargetId {
    TargetId::new(format!("target-{}", idx))
}

/// Generator for one view's cycles. Fulls carry every target; fragments a few.
fn result_cycle_generator(seed: u64, cycles: u64, targets: usize) -> impl Stream<Item = ResultOp> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for cycle in 1..=cycles {
            if cycle == 1 || rng.gen_bool(0.2) {
                let values = (0..targets).map(|t| (target(t), Value::Int(rng.gen_range(0..1_000))));
                yield ResultOp::Full(ResultSnapshot::new(cycle, values.collect::<Vec<_>>()));
            } else {
                let touched = rng.gen_range(1..=targets.min(3));
                let values = (0..touched)
                    .map(|_| (target(rng.gen_range(0..targets)), Value::Int(rng.gen_range(0..1_000))))
                    .collect::<Vec<_>>();
                yield ResultOp::Fragment(ResultFragment::new(cycle, values));
            }
        }
    }
}

fn chaotic_transport(seed: u64, config: &ClientConfig) -> Arc<MemoryTransport> {
    Arc::new(
        MemoryTransport::with_network(NetworkConfig::chaotic().with_seed(seed))
            .with_buffer(config.subscription_buffer),
    )
}

/// Poll `converged` until it holds or `timeout` passes.
async fn settle<F, Fut>(timeout: Duration, mut converged: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if converged().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Concurrent producers mutate rule streams over a chaotic transport
pub async fn stress_test_rules(
    num_streams: usize,
    producers_per_stream: usize,
    ops_per_producer: usize,
    seed: u64,
) -> Result<StressTestStats, SdkError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Rule Replication Stress Test (Async)                ║");
    println!("║  Streams: {} | Producers/Stream: {} | Ops/Producer: {} ║",
             num_streams, producers_per_stream, ops_per_producer);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let config = ClientConfig::default();
    let transport = chaotic_transport(seed, &config);
    let client = Client::new(transport.clone(), config);

    let streams: Vec<String> = (0..num_streams).map(|i| format!("limits-{}", i)).collect();
    let mut subscriptions = Vec::with_capacity(num_streams);
    let mut mirrors = Vec::with_capacity(num_streams);
    for stream in &streams {
        transport.create_rule_stream(stream.as_str(), 0, Vec::<&str>::new());
        let sub = client.subscribe_rules(stream.as_str()).await?;
        let mirror = Arc::new(RuleMirror::default());
        sub.add_listener(mirror.clone()).await?;
        subscriptions.push(sub);
        mirrors.push(mirror);
    }

    println!("\n[Phase 1/2] Publishing rule changes...");

    // Phase 1: every producer hammers its stream concurrently
    let mut handles = vec![];
    for (idx, stream) in streams.iter().enumerate() {
        for producer in 0..producers_per_stream {
            let transport = Arc::clone(&transport);
            let stream = stream.clone();
            let producer_seed = seed.wrapping_mul(31).wrapping_add((idx * producers_per_stream + producer) as u64);
            let handle = tokio::spawn(async move {
                let mut ops = Box::pin(rule_op_generator(producer_seed, ops_per_producer, 24));
                let mut published = 0usize;
                while let Some(op) = ops.next().await {
                    let sent = match op {
                        RuleOp::Add(rule) => {
                            transport.publish_rule_change(&stream, [rule], Vec::<String>::new()).await
                        }
                        RuleOp::Remove(rule) => {
                            transport.publish_rule_change(&stream, Vec::<String>::new(), [rule]).await
                        }
                    };
                    if let Err(e) = sent {
                        warn!(%stream, error = %e, "producer stopped");
                        break;
                    }
                    published += 1;

                    if published % 16 == 0 {
                        transport.flush().await;
                        tokio::task::yield_now().await;
                    }
                }
                published
            });
            handles.push(handle);
        }
    }

    let mut operations = 0;
    for handle in handles {
        operations += handle.await.unwrap_or(0);
    }
    transport.release_withheld().await;

    println!("[Phase 1/2] ✓ Completed");
    println!("[Phase 2/2] Waiting for replicas to converge...");

    // Phase 2: every replica and every listener mirror must match the server
    let mut converged = 0;
    for (sub, mirror) in subscriptions.iter().zip(&mirrors) {
        let Some(expected) = transport.rule_snapshot(sub.stream()) else {
            continue;
        };
        let expected = &expected;
        let replica_ok = settle(SETTLE_TIMEOUT, || async move { sub.snapshot().await == *expected }).await;
        sub.flush().await;
        if replica_ok && *mirror.rules.lock() == expected.rules {
            converged += 1;
        } else {
            warn!(stream = %sub.stream(), "replica diverged");
        }
    }

    let mut resyncs = 0;
    for sub in &subscriptions {
        resyncs += sub.resync_count().await;
        sub.close().await;
    }

    let total_time = start.elapsed();
    println!("[Phase 2/2] ✓ Completed");

    Ok(StressTestStats {
        name: "Rule Replication",
        subscriptions: num_streams,
        operations,
        delivery: transport.delivery_stats(),
        resyncs,
        snapshot_fetches: transport.rpc_stats().rule_fetches,
        listener_calls: mirrors.iter().map(|m| m.calls.load(Ordering::Relaxed)).sum(),
        converged,
        total_time,
        ops_per_second: operations as f64 / total_time.as_secs_f64(),
    })
}

/// Views publish full and partial cycles concurrently over a chaotic transport
pub async fn stress_test_views(
    num_views: usize,
    cycles_per_view: u64,
    targets: usize,
    seed: u64,
) -> Result<StressTestStats, SdkError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Result Reconciliation Stress Test (Async)           ║");
    println!("║  Views: {} | Cycles/View: {} | Targets: {} ║",
             num_views, cycles_per_view, targets);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let config = ClientConfig::default();
    let transport = chaotic_transport(seed, &config);
    let client = Client::new(transport.clone(), config);

    let views: Vec<String> = (0..num_views).map(|i| format!("risk-{}", i)).collect();
    let mut subscriptions = Vec::with_capacity(num_views);
    let mut mirrors = Vec::with_capacity(num_views);
    for view in &views {
        transport.create_view(view.as_str());
        let sub = client.subscribe_view(view.as_str()).await?;
        let mirror = Arc::new(ResultMirror::default());
        sub.add_listener(mirror.clone()).await?;
        subscriptions.push(sub);
        mirrors.push(mirror);
    }

    println!("\n[Phase 1/2] Publishing result cycles...");

    // Phase 1: one producer per view, all views at once
    let mut handles = vec![];
    for (idx, view) in views.iter().enumerate() {
        let transport = Arc::clone(&transport);
        let view = view.clone();
        let view_seed = seed.wrapping_mul(17).wrapping_add(idx as u64);
        let handle = tokio::spawn(async move {
            let mut cycles = Box::pin(result_cycle_generator(view_seed, cycles_per_view, targets));
            let mut published = 0usize;
            while let Some(op) = cycles.next().await {
                let sent = match op {
                    ResultOp::Full(full) => transport.publish_full(&view, full).await,
                    ResultOp::Fragment(fragment) => transport.publish_fragment(&view, fragment).await,
                };
                if let Err(e) = sent {
                    warn!(%view, error = %e, "producer stopped");
                    return published;
                }
                published += 1;

                if published % 8 == 0 {
                    transport.flush().await;
                    tokio::task::yield_now().await;
                }
            }

            // A closing full result outranks everything still in flight.
            let closing = ResultSnapshot::new(
                cycles_per_view + 1,
                (0..targets).map(|t| (target(t), Value::Int(t as i64))).collect::<Vec<_>>(),
            );
            match transport.publish_full(&view, closing).await {
                Ok(()) => published + 1,
                Err(e) => {
                    warn!(%view, error = %e, "closing cycle not published");
                    published
                }
            }
        });
        handles.push(handle);
    }

    let mut operations = 0;
    for handle in handles {
        operations += handle.await.unwrap_or(0);
    }
    transport.release_withheld().await;

    println!("[Phase 1/2] ✓ Completed");
    println!("[Phase 2/2] Waiting for baselines to converge...");

    // Phase 2: baselines and listener views must equal the closing cycle
    let mut converged = 0;
    for (sub, mirror) in subscriptions.iter().zip(&mirrors) {
        let Some(expected) = transport.result_snapshot(sub.view()) else {
            continue;
        };
        let expected = &expected;
        let baseline_ok = settle(SETTLE_TIMEOUT, || async move {
            sub.baseline().await.as_ref() == Some(expected)
        })
        .await;
        sub.flush().await;
        if baseline_ok && mirror.latest.lock().as_ref() == Some(expected) {
            converged += 1;
        } else {
            warn!(view = %sub.view(), "baseline diverged");
        }
    }

    let mut resyncs = 0;
    for sub in &subscriptions {
        resyncs += sub.stats().await.resyncs;
        sub.close().await;
    }

    let total_time = start.elapsed();
    println!("[Phase 2/2] ✓ Completed");

    Ok(StressTestStats {
        name: "Result Reconciliation",
        subscriptions: num_views,
        operations,
        delivery: transport.delivery_stats(),
        resyncs,
        snapshot_fetches: transport.rpc_stats().result_fetches,
        listener_calls: mirrors.iter().map(|m| m.calls.load(Ordering::Relaxed)).sum(),
        converged,
        total_time,
        ops_per_second: operations as f64 / total_time.as_secs_f64(),
    })
}

/// Rule replication at growing stream counts
pub async fn stress_test_scaling(max_streams: usize, step_size: usize) -> Result<bool, SdkError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║    Scaling Analysis - Rule Replication vs Stream Count     ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut all_converged = true;
    let mut current_streams = step_size;
    while current_streams <= max_streams {
        let stats = stress_test_rules(current_streams, 2, 100, current_streams as u64).await?;
        stats.print();
        all_converged &= stats.all_converged();
        current_streams += step_size;
    }
    Ok(all_converged)
}
