use std::process;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pacer::config::ENV_MAX_CONCURRENCY;
use pacer::{BoundedExecutor, Config, PACER_VERSION};

/// Operations submitted in order: (name, duration in ms).
const SCENARIO: [(&str, u64); 4] = [("A", 100), ("B", 100), ("C", 50), ("D", 10)];

const DEFAULT_MAX: usize = 2;

struct Args {
    max: Option<String>,
    json: bool,
}

enum Command {
    Run(Args),
    Version,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Version) => {
            println!("pacer-demo {PACER_VERSION}");
            return;
        }
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: pacer-demo [--max N] [--json]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --max <N>     Concurrent operations [default: {DEFAULT_MAX}]");
            eprintln!("  --json        Print final executor stats as JSON");
            eprintln!("  --version     Print version");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut max = None;
    let mut json = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--max" => {
                i += 1;
                max = Some(args.get(i).ok_or("--max requires a value")?.clone());
            }
            "--json" => json = true,
            "--version" | "-V" => return Ok(Command::Version),
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Command::Run(Args { max, json }))
}

/// Initialize tracing with PACER_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("PACER_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("pacer={base_level},pacer_demo={base_level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn load_config(max: Option<&str>) -> pacer::Result<Config> {
    let mut config = Config {
        max_concurrency: DEFAULT_MAX,
        ..Config::default()
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(raw) = max {
        config.apply_env(|key| (key == ENV_MAX_CONCURRENCY).then(|| raw.to_string()))?;
    }
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.max.as_deref()).context("invalid configuration")?;
    let executor = BoundedExecutor::from_config(&config).context("failed to create executor")?;
    info!(max = executor.capacity(), "Running scenario");

    let t0 = Instant::now();
    let runs: Vec<_> = SCENARIO
        .into_iter()
        .map(|(name, ms)| {
            executor.execute(move || async move {
                let started = t0.elapsed();
                info!(op = name, at_ms = started.as_millis() as u64, "Operation started");
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let finished = t0.elapsed();
                info!(op = name, at_ms = finished.as_millis() as u64, "Operation finished");
                (name, started, finished)
            })
        })
        .collect();

    for (name, started, finished) in join_all(runs).await {
        println!(
            "{name}: started {:>4}ms  finished {:>4}ms",
            started.as_millis(),
            finished.as_millis()
        );
    }

    if args.json {
        let stats = serde_json::to_string_pretty(&executor.stats())
            .context("failed to serialize stats")?;
        println!("{stats}");
    }

    Ok(())
}
