// shroud/src/main.rs
//
// Shroud: drive the traffic obfuscation engine from the command line.
//
// Two operational modes:
//   simulate  synthetic collaborators enqueue a mixed action stream at --rate
//   replay    replay a captured JSONL action log at scaled speed
//
// Usage:
//   shroud --mode simulate --rate 2.0 --duration 120
//   shroud --mode replay --path captured.jsonl --speed 10.0 --config engine.json

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shroud::{dispatch_fn, Action, ActionKind, DispatchFn, DispatchRequest, Engine, EngineConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "shroud",
    about   = "Traffic pattern randomization and behavioral scheduling engine",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "simulate")]
    mode: Mode,

    #[arg(long, help = "Engine config JSON (defaults used when omitted)")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "1.0", help = "Actions per second (simulate mode)")]
    rate: f64,

    #[arg(long, default_value = "60", help = "Run time in seconds (simulate mode)")]
    duration: u64,

    #[arg(long, default_value = "/tmp/shroud_actions.jsonl",
          help = "JSONL action log (replay mode)")]
    path: PathBuf,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    speed: f64,

    #[arg(long, default_value = "10", help = "Seconds between stats lines")]
    stats_every: u64,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Simulate, // synthetic action stream
    Replay,   // captured JSONL log
}

/// One line of a replay capture.
#[derive(Debug, Deserialize)]
struct CapturedAction {
    offset_ms: u64,
    kind:      ActionKind,
    #[serde(default)]
    target:    Option<String>,
}

// ── Dispatch sink ─────────────────────────────────────────────────────────────

/// Stands in for the real network / DOM layer: logs what would happen.
fn logging_sink(dispatched: Arc<AtomicU64>) -> DispatchFn {
    dispatch_fn(move |req: DispatchRequest| {
        let dispatched = Arc::clone(&dispatched);
        async move {
            dispatched.fetch_add(1, Ordering::Relaxed);
            info!(
                id      = req.id,
                kind    = %req.kind,
                at_ms   = req.dispatched_at,
                target  = req.payload["target"].as_str().unwrap_or("-"),
                ua      = req.header("user-agent").unwrap_or("-"),
                "Dispatch"
            );
            anyhow::Ok(())
        }
    })
}

fn action_for(kind: ActionKind, target: Option<String>, sink: &DispatchFn) -> Action {
    let action = Action::new(kind, json!({ "target": target }), Arc::clone(sink));
    match kind {
        ActionKind::RuleUpdate | ActionKind::Telemetry => action.with_headers(vec![
            ("User-Agent".into(), format!("shroud/{}", env!("CARGO_PKG_VERSION"))),
            ("Accept".into(), "application/json".into()),
        ]),
        _ => action,
    }
}

// ── Sources ───────────────────────────────────────────────────────────────────

const SIMULATED_MIX: [(ActionKind, u32); 4] = [
    (ActionKind::ResourceBlock, 50),
    (ActionKind::CosmeticHide,  30),
    (ActionKind::RuleUpdate,    5),
    (ActionKind::Telemetry,     15),
];

fn simulated_kind<R: Rng + ?Sized>(mix: &WeightedIndex<u32>, rng: &mut R) -> ActionKind {
    SIMULATED_MIX[mix.sample(rng)].0
}

async fn simulate(engine: &Engine, sink: &DispatchFn, rate: f64, duration: Duration) -> Result<()> {
    anyhow::ensure!(rate > 0.0, "--rate must be positive");
    let mix = WeightedIndex::new(SIMULATED_MIX.iter().map(|(_, w)| *w))?;
    let end = Instant::now() + duration;

    while Instant::now() < end {
        let (kind, gap) = {
            let mut rng = rand::thread_rng();
            let kind = simulated_kind(&mix, &mut rng);
            // Poisson arrivals
            let u: f64 = rng.gen_range(f64::EPSILON..1.0);
            (kind, Duration::from_secs_f64(-u.ln() / rate))
        };
        engine.enqueue(action_for(kind, Some(format!("sim://{kind}")), sink));
        tokio::time::sleep(gap).await;
    }
    Ok(())
}

async fn replay_jsonl(engine: &Engine, sink: &DispatchFn, path: PathBuf, speed: f64) -> Result<()> {
    anyhow::ensure!(speed > 0.0, "--speed must be positive");
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let mut actions: Vec<CapturedAction> = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() { continue; }
        match serde_json::from_str::<CapturedAction>(line) {
            Ok(a)  => actions.push(a),
            Err(e) => warn!("Skipping line {}: {}", n + 1, e),
        }
    }
    if actions.is_empty() { return Ok(()); }
    actions.sort_by_key(|a| a.offset_ms);

    info!("Replaying {} actions from {}", actions.len(), path.display());
    let base = Instant::now();
    for a in actions {
        let target = base + Duration::from_secs_f64(a.offset_ms as f64 / 1000.0 / speed);
        let now    = Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
        engine.enqueue(action_for(a.kind, a.target, sink));
    }
    Ok(())
}

async fn print_stats_loop(engine: Arc<Engine>, every: Duration) {
    let start = Instant::now();
    loop {
        tokio::time::sleep(every).await;
        let s = engine.statistics();
        println!(
            "── stats  uptime={:.0}s  queued={}  active={}  history={}  risk={}  dispatched={}  failed={}  decoys={}  poison={} ──",
            start.elapsed().as_secs_f64(), s.queued_count, s.active_dispatches, s.history_size,
            s.traffic_pattern.risk_level, s.dispatched_total, s.failed_total,
            s.decoys_enqueued, s.poison_passes,
        );
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("shroud=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None       => EngineConfig::default(),
    };

    let engine     = Arc::new(Engine::new(cfg)?);
    let dispatched = Arc::new(AtomicU64::new(0));
    let sink       = logging_sink(Arc::clone(&dispatched));
    engine.start();

    let stats = tokio::spawn(print_stats_loop(Arc::clone(&engine), Duration::from_secs(cli.stats_every.max(1))));

    let source = async {
        match cli.mode {
            Mode::Simulate => {
                info!(rate = cli.rate, duration_s = cli.duration, "Simulating collaborators");
                simulate(&engine, &sink, cli.rate, Duration::from_secs(cli.duration)).await
            }
            Mode::Replay => {
                info!(speed = cli.speed, "Replay mode");
                replay_jsonl(&engine, &sink, cli.path.clone(), cli.speed).await
            }
        }
    };

    tokio::select! {
        res = source => res?,
        _   = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    // Let queued work drain before reporting.
    let drain_deadline = Instant::now() + Duration::from_secs(30);
    while engine.statistics().queued_count > 0 && Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    stats.abort();

    let report = engine.statistics();
    println!("{}", serde_json::to_string_pretty(&report)?);
    info!(sink_calls = dispatched.load(Ordering::Relaxed), "Done");
    engine.cleanup();
    Ok(())
}
