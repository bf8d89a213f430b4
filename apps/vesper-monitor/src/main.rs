//! # Vesper Monitor
//!
//! A terminal walkthrough of the Vesper SDK. Every scenario runs a real
//! [`Client`] over the in-memory transport and prints what the registered
//! listeners observe.
//!
//! ```text
//! server ──delta/result──▶ MemoryTransport ──▶ dispatcher ──▶ subscription
//!                                                                 │
//!                                         console listener ◀──────┘
//! ```

use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;
use vsr_sdk::client::quick::chaotic_client;
use vsr_sdk::{
    Client, ClientConfig, LogicalTime, MemoryTransport, ResultFragment, ResultSnapshot, Rule,
    RuleDelta, RuleListener, RuleSubscription, SdkError, ViewListener, ViewSubscription, WireBody,
};

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "vesper-monitor")]
#[command(about = "Watch rule replication and result reconciliation (Vesper SDK)")]
#[command(version)]
struct Cli {
    /// Log SDK internals at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rule stream: in-order delta, duplicate, then a gap repaired by resync
    Rules,
    /// View results: full replace, fragment overlay, late fragment, ambiguous pair
    Results,
    /// Rule stream over a network that reorders, duplicates and withholds
    Chaos {
        /// Seed for the simulated network and the change generator
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Number of rule changes to publish
        #[arg(long, default_value_t = 200)]
        ops: usize,
    },
    /// Interactive REPL driving one rule stream by hand
    Interactive,
}

// ─── Console listeners ─────────────────────────────────────────────────────

fn rule_list(rules: &[Rule]) -> String {
    rules
        .iter()
        .map(Rule::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Prints every rule callback it receives.
struct ConsoleRules;

impl RuleListener for ConsoleRules {
    fn rule_added(&self, rule: &Rule) {
        println!("    {} {}", "+".bright_green().bold(), rule.as_str().bright_green());
    }

    fn rule_removed(&self, rule: &Rule) {
        println!("    {} {}", "-".bright_red().bold(), rule.as_str().bright_red());
    }

    fn rules_added(&self, rules: &[Rule]) {
        println!(
            "    {} [{}]",
            "+".bright_green().bold(),
            rule_list(rules).bright_green()
        );
    }

    fn rules_removed(&self, rules: &[Rule]) {
        println!(
            "    {} [{}]",
            "-".bright_red().bold(),
            rule_list(rules).bright_red()
        );
    }
}

fn show_values<'a, I, K, V>(values: I) -> String
where
    I: IntoIterator<Item = (&'a K, &'a V)>,
    K: std::fmt::Display + 'a,
    V: std::fmt::Display + 'a,
{
    let parts: Vec<String> = values
        .into_iter()
        .map(|(target, value)| format!("{}: {}", target, value))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

/// Prints every view callback it receives.
struct ConsoleView;

impl ViewListener for ConsoleView {
    fn cycle_started(&self, logical_time: LogicalTime) {
        println!("    {} cycle {} started", "◦".bright_blue(), logical_time);
    }

    fn cycle_completed(&self, full: &ResultSnapshot, delta: &ResultFragment) {
        println!(
            "    {} completed  @{}  full={}  delta={}",
            "■".bright_green(),
            full.logical_time,
            show_values(&full.values).bold(),
            show_values(&delta.values).dimmed()
        );
    }

    fn cycle_fragment_completed(&self, full: &ResultSnapshot, delta: &ResultFragment) {
        println!(
            "    {} fragment   @{}  full={}  delta={}",
            "▪".bright_green(),
            full.logical_time,
            show_values(&full.values).bold(),
            show_values(&delta.values).dimmed()
        );
    }

    fn cycle_execution_failed(&self, logical_time: LogicalTime, reason: &str) {
        println!(
            "    {} cycle {} failed: {}",
            "✗".bright_red(),
            logical_time,
            reason
        );
    }

    fn process_completed(&self) {
        println!("    {} process completed", "✓".bright_green());
    }

    fn client_shutdown(&self, reason: Option<&str>) {
        println!(
            "    {} client shutdown: {}",
            "!".bright_red().bold(),
            reason.unwrap_or("requested")
        );
    }
}

// ─── Display helpers ───────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn warn_line(text: &str) {
    println!("  {} {}", "!".bright_red(), text);
}

async fn show_rule_replica(sub: &RuleSubscription<MemoryTransport>) {
    let snapshot = sub.snapshot().await;
    let rules: Vec<Rule> = snapshot.rules.into_iter().collect();
    println!(
        "  {} {} {} {}",
        "▪".bright_magenta(),
        sub.stream().bright_magenta().bold(),
        format!("v{}", snapshot.version.get()).bright_cyan(),
        format!("{{{}}}", rule_list(&rules)).bold()
    );
}

async fn show_baseline(sub: &ViewSubscription<MemoryTransport>) {
    match sub.baseline().await {
        Some(full) => println!(
            "  {} {} @{} {}",
            "▪".bright_magenta(),
            sub.view().bright_magenta().bold(),
            full.logical_time,
            show_values(&full.values).bold()
        ),
        None => println!(
            "  {} {} {}",
            "▪".bright_magenta(),
            sub.view().bright_magenta().bold(),
            "(no baseline)".dimmed()
        ),
    }
}

fn convergence_result(converged: bool) {
    if converged {
        println!(
            "\n  {} {}",
            "✓".bright_green().bold(),
            "REPLICA CONVERGED — identical to the server!"
                .bright_green()
                .bold()
        );
    } else {
        println!(
            "\n  {} {}",
            "✗".bright_red().bold(),
            "DIVERGENCE DETECTED — replica differs from the server!"
                .bright_red()
                .bold()
        );
    }
}

/// Poll `check` until it holds or a couple of seconds pass.
async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_version(sub: &RuleSubscription<MemoryTransport>, version: u64) -> bool {
    let settled = wait_until(|| async move { sub.version().await.get() >= version }).await;
    sub.flush().await;
    settled
}

// ─── Scenarios ─────────────────────────────────────────────────────────────

async fn run_rules() -> Result<(), SdkError> {
    header("RULES — Versioned Deltas, Duplicates and Gap Resync");

    let client = Client::new_with_memory_transport(ClientConfig::default());
    let transport = client.transport().clone();
    let stream = "do-not-retry";

    section("Phase 1: Subscribe to a stream the server holds at v5");
    transport.create_rule_stream(stream, 5, ["A", "B"]);
    let sub = client.subscribe_rules(stream).await?;
    sub.add_listener(Arc::new(ConsoleRules)).await?;
    sub.flush().await;
    show_rule_replica(&sub).await;

    section("Phase 2: In-order delta {5 → 6, +C}");
    let delta = transport
        .publish_rule_change(stream, ["C"], Vec::<&str>::new())
        .await
        .map_err(|e| SdkError::TransportDisconnected(e.to_string()))?;
    wait_for_version(&sub, 6).await;
    show_rule_replica(&sub).await;

    section("Phase 3: The same delta arrives again");
    transport
        .send(stream, WireBody::RuleDelta(delta))
        .await
        .map_err(|e| SdkError::TransportDisconnected(e.to_string()))?;
    sub.flush().await;
    step("Stale delta ignored, no listener calls");
    show_rule_replica(&sub).await;

    section("Phase 4: Server moves to {B, C}@8; only {7 → 8, -A} reaches us");
    transport.create_rule_stream(stream, 8, ["B", "C"]);
    transport
        .send(
            stream,
            WireBody::RuleDelta(RuleDelta::new(7, 8).with_removed(["A"])),
        )
        .await
        .map_err(|e| SdkError::TransportDisconnected(e.to_string()))?;
    wait_for_version(&sub, 8).await;
    step(&format!(
        "Gap detected (expected from v6), resyncs = {}",
        sub.resync_count().await
    ));
    show_rule_replica(&sub).await;

    let converged = transport
        .rule_snapshot(stream)
        .map(|expected| expected.rules)
        == Some(sub.snapshot().await.rules);
    convergence_result(converged);

    sub.close().await;
    Ok(())
}

async fn run_results() -> Result<(), SdkError> {
    header("RESULTS — Full Replace, Overlay, Late and Ambiguous Fragments");

    let client = Client::new_with_memory_transport(ClientConfig::default());
    let transport = client.transport().clone();
    let view = "risk";
    transport.create_view(view);

    let sub = client.subscribe_view(view).await?;
    sub.add_listener(Arc::new(ConsoleView)).await?;

    let publish = |body: WireBody| {
        let transport = transport.clone();
        async move {
            transport
                .send(view, body)
                .await
                .map_err(|e| SdkError::TransportDisconnected(e.to_string()))
        }
    };

    section("Phase 1: Full result {X: 1, Y: 2}@100");
    publish(WireBody::Started {
        logical_time: LogicalTime::new(100),
    })
    .await?;
    publish(WireBody::Completed(ResultSnapshot::new(100, [("X", 1), ("Y", 2)]))).await?;
    sub.flush().await;
    show_baseline(&sub).await;

    section("Phase 2: Fragment {Y: 3}@101 overlays the baseline");
    publish(WireBody::FragmentCompleted(ResultFragment::new(101, [("Y", 3)]))).await?;
    sub.flush().await;
    show_baseline(&sub).await;

    section("Phase 3: Late fragment {X: 7}@99 arrives out of order");
    publish(WireBody::FragmentCompleted(ResultFragment::new(99, [("X", 7)]))).await?;
    sub.flush().await;
    step("Held values win; the baseline keeps time 101");
    show_baseline(&sub).await;

    section("Phase 4: New full result {X: 9}@102 replaces everything");
    publish(WireBody::Completed(ResultSnapshot::new(102, [("X", 9)]))).await?;
    sub.flush().await;
    show_baseline(&sub).await;

    section("Phase 5: Two fragments for the same cycle @103");
    publish(WireBody::FragmentCompleted(ResultFragment::new(103, [("X", 1)]))).await?;
    publish(WireBody::FragmentCompleted(ResultFragment::new(103, [("X", 2)]))).await?;
    sub.flush().await;
    step("Second fragment is ambiguous; merged with last-applied-wins");
    show_baseline(&sub).await;

    section("Reconciler statistics");
    let stats = sub.stats().await;
    step(&format!(
        "new = {}, ambiguous = {}, old discarded = {}, old rebased = {}",
        stats.new, stats.ambiguous, stats.old_discarded, stats.old_rebased
    ));
    step(&format!(
        "covered = {}, discontinuities = {}, resyncs = {}",
        stats.covered, stats.discontinuities, stats.resyncs
    ));

    publish(WireBody::ProcessCompleted).await?;
    sub.flush().await;
    sub.close().await;
    Ok(())
}

async fn run_chaos(seed: u64, ops: usize) -> Result<(), SdkError> {
    header("CHAOS — Reordering, Duplication and Withheld Messages");

    let client = chaotic_client(seed);
    let transport = client.transport().clone();
    let stream = "limits";
    transport.create_rule_stream(stream, 0, Vec::<&str>::new());
    let sub = client.subscribe_rules(stream).await?;

    let network = transport.network();
    section("Network");
    step(&format!(
        "loss = {:.0}%, duplication = {:.0}%, reordering = {:.0}%, seed = {}",
        network.loss_rate * 100.0,
        network.dup_rate * 100.0,
        network.reorder_rate * 100.0,
        seed
    ));

    section(&format!("Phase 1: Publish {} rule changes", ops));
    for i in 0..ops {
        let rule = format!("r{}", (i * 7 + seed as usize) % 13);
        let published = if i % 3 == 0 {
            transport
                .publish_rule_change(stream, Vec::<String>::new(), [rule])
                .await
        } else {
            transport
                .publish_rule_change(stream, [rule], Vec::<String>::new())
                .await
        };
        published.map_err(|e| SdkError::TransportDisconnected(e.to_string()))?;
        if i % 10 == 9 {
            transport.flush().await;
        }
    }
    step(&format!(
        "{} message(s) still withheld by the network",
        transport.withheld_count()
    ));

    section("Phase 2: Release withheld traffic");
    transport.release_withheld().await;

    let expected = transport
        .rule_snapshot(stream)
        .ok_or_else(|| SdkError::TransportDisconnected(stream.to_string()))?;
    let settled = wait_for_version(&sub, expected.version.get()).await;

    let delivery = transport.delivery_stats();
    step(&format!(
        "sent = {}, withheld = {}, duplicated = {}, reordered = {}",
        delivery.sent, delivery.withheld, delivery.duplicated, delivery.reordered
    ));
    step(&format!(
        "resyncs = {}, snapshot fetches = {}",
        sub.resync_count().await,
        transport.rpc_stats().rule_fetches
    ));
    let dispatch = client.dispatcher().stats();
    step(&format!(
        "routed = {}, malformed = {}, unrouted = {}",
        dispatch.routed, dispatch.malformed, dispatch.unrouted
    ));

    section("Final state");
    show_rule_replica(&sub).await;
    convergence_result(settled && sub.snapshot().await == expected);

    sub.close().await;
    Ok(())
}

async fn run_interactive() -> Result<(), SdkError> {
    header("INTERACTIVE REPL — Vesper Rule Stream");

    let client = Client::new_with_memory_transport(ClientConfig::default());
    let transport = client.transport().clone();
    let stream = "rules";
    transport.create_rule_stream(stream, 0, Vec::<&str>::new());
    let sub = client.subscribe_rules(stream).await?;
    sub.add_listener(Arc::new(ConsoleRules)).await?;

    println!();
    println!("  {}", "Commands:".bold().underline());
    println!(
        "    {} <rule>...              Publish a delta adding rules",
        "add".bright_cyan()
    );
    println!(
        "    {} <rule>...           Publish a delta removing rules",
        "remove".bright_cyan()
    );
    println!(
        "    {} <rule>...             Change the server without sending (forces a gap)",
        "skip".bright_cyan()
    );
    println!(
        "    {} <from> <to>         Send a hand-made empty delta",
        "delta".bright_cyan()
    );
    println!(
        "    {}                       Hold listener delivery",
        "pause".bright_cyan()
    );
    println!(
        "    {}                      Resume listener delivery",
        "resume".bright_cyan()
    );
    println!(
        "    {}                        Show replica and server state",
        "show".bright_cyan()
    );
    println!(
        "    {}                        Exit",
        "quit".bright_cyan()
    );
    println!();

    loop {
        print!("{}", "vesper> ".bright_cyan().bold());
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() || input.is_empty() {
            break;
        }
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0] {
            "add" | "+" | "remove" | "rm" | "-" => {
                if parts.len() < 2 {
                    warn_line("Usage: add|remove <rule>...");
                    continue;
                }
                let rules = parts[1..].iter().copied();
                let published = if matches!(parts[0], "add" | "+") {
                    transport
                        .publish_rule_change(stream, rules, Vec::<&str>::new())
                        .await
                } else {
                    transport
                        .publish_rule_change(stream, Vec::<&str>::new(), rules)
                        .await
                };
                match published {
                    Ok(delta) => {
                        step(&format!(
                            "published v{} → v{}",
                            delta.from_version.get(),
                            delta.to_version.get()
                        ));
                        wait_for_version(&sub, delta.to_version.get()).await;
                    }
                    Err(e) => warn_line(&e.to_string()),
                }
            }

            "skip" => {
                if parts.len() < 2 {
                    warn_line("Usage: skip <rule>...");
                    continue;
                }
                let Some(server) = transport.rule_snapshot(stream) else {
                    warn_line("stream is gone");
                    continue;
                };
                let mut rules = server.rules;
                rules.extend(parts[1..].iter().map(|r| Rule::from(*r)));
                let version = server.version.next();
                transport.create_rule_stream(stream, version.get(), rules);
                step(&format!(
                    "server silently at v{}; the next delta will expose the gap",
                    version.get()
                ));
            }

            "delta" => {
                let range = (
                    parts.get(1).and_then(|s| s.parse::<u64>().ok()),
                    parts.get(2).and_then(|s| s.parse::<u64>().ok()),
                );
                let (Some(from), Some(to)) = range else {
                    warn_line("Usage: delta <from> <to>");
                    continue;
                };
                if let Err(e) = transport
                    .send(stream, WireBody::RuleDelta(RuleDelta::new(from, to)))
                    .await
                {
                    warn_line(&e.to_string());
                    continue;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                sub.flush().await;
                show_rule_replica(&sub).await;
            }

            "pause" => {
                sub.pause();
                step("listener delivery paused");
            }

            "resume" => {
                sub.resume();
                sub.flush().await;
                step("listener delivery resumed");
            }

            "show" | "s" => {
                show_rule_replica(&sub).await;
                if let Some(server) = transport.rule_snapshot(stream) {
                    let rules: Vec<Rule> = server.rules.into_iter().collect();
                    println!(
                        "  {} {} {} {}",
                        "▪".bright_yellow(),
                        "server".bright_yellow().bold(),
                        format!("v{}", server.version.get()).bright_cyan(),
                        format!("{{{}}}", rule_list(&rules)).bold()
                    );
                }
                step(&format!("resyncs = {}", sub.resync_count().await));
            }

            "quit" | "exit" | "q" => {
                println!("  {}", "Goodbye!".dimmed());
                break;
            }

            "help" | "h" | "?" => {
                println!("  add <r>... | remove <r>... | skip <r>... | delta <from> <to>");
                println!("  pause | resume | show | quit");
            }

            other => {
                println!(
                    "  {} Unknown command '{}' — type 'help'",
                    "?".bright_yellow(),
                    other
                );
            }
        }

        if sub.is_closed() {
            warn_line("subscription closed");
            break;
        }
    }

    sub.close().await;
    Ok(())
}

// ─── Entry point ───────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let outcome = match cli.command {
        Commands::Rules => run_rules().await,
        Commands::Results => run_results().await,
        Commands::Chaos { seed, ops } => run_chaos(seed, ops).await,
        Commands::Interactive => run_interactive().await,
    };

    if let Err(e) = outcome {
        eprintln!("{} {}", "error:".bright_red().bold(), e);
        std::process::exit(1);
    }
}
