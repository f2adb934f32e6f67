use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use rules_engine::{
    actors::{ActorManager, EngineHandle, RawData},
    config::{EngineConfig, config_path, read_config_file},
    insights::Insight,
    progress::TracingProgress,
    rules::{RuleBundle, RuleInstance, RuleInstanceFactory},
    storage::{StorageBackend, open_backend},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Replay telemetry through the rules engine
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (defaults to $RULES_ENGINE_CONFIG)
    #[arg(short, long)]
    file: Option<String>,

    /// Rule bundle: rules, global variables and equipment bindings
    #[arg(short, long)]
    bundle: Option<PathBuf>,

    /// JSON-lines telemetry file, one RawData per line
    #[arg(short, long)]
    telemetry: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = filter::Targets::new()
        .with_targets(vec![("rules_engine", level)])
        .with_default(LevelFilter::WARN);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = match config_path(args.file.clone()) {
        Some(path) => read_config_file(&path)?,
        None => {
            debug!("no config file given, using defaults");
            EngineConfig::default()
        }
    };

    let backend = open_backend(&config.storage()).await?;
    let bundle = load_bundle(args.bundle.as_ref(), backend.as_ref()).await?;

    let instances =
        RuleInstanceFactory::generate_all(&bundle.rules, &bundle.snapshot(), &TracingProgress);
    let failed: Vec<RuleInstance> = instances.iter().filter(|i| !i.is_ready()).cloned().collect();

    let manager = Arc::new(ActorManager::new(Arc::clone(&backend), &config));
    let registration = manager.register_instances(instances);
    let restored = manager.restore_from_backend().await?;
    info!(
        "{} actors ready, {} failed, {} removed, {restored} restored",
        registration.ready, registration.failed, registration.removed
    );

    let engine = EngineHandle::spawn(Arc::clone(&manager), &config);

    if let Some(path) = &args.telemetry {
        replay(&engine, path).await?;
    }

    let stats = engine.sync().await?;
    info!("{} points received, {} routed", stats.received, stats.routed);

    let report = engine.shutdown().await?;
    info!(
        "final flush: {} actor states, {} insights",
        report.actors_written, report.insights_written
    );

    print_summary(&manager.insights(), &failed);

    backend.close().await?;
    Ok(())
}

/// The bundle from disk, stored for later runs; without one the stored
/// rules are used.
async fn load_bundle(
    path: Option<&PathBuf>,
    backend: &dyn StorageBackend,
) -> anyhow::Result<RuleBundle> {
    let Some(path) = path else {
        let rules = backend.load_rules().await?;
        let global_variables = backend.load_global_variables().await?;
        info!("using {} stored rules", rules.len());
        return Ok(RuleBundle {
            rules,
            global_variables,
            equipment: Vec::new(),
        });
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bundle {}", path.display()))?;
    let bundle = RuleBundle::from_json(&text)
        .map_err(|e| anyhow::anyhow!("Invalid rule bundle provided: {e}"))?;

    backend.save_rules(bundle.rules.clone()).await?;
    backend
        .save_global_variables(bundle.global_variables.clone())
        .await?;

    info!(
        "loaded {} rules, {} global variables, {} equipment",
        bundle.rules.len(),
        bundle.global_variables.len(),
        bundle.equipment.len()
    );
    Ok(bundle)
}

async fn replay(engine: &EngineHandle, path: &PathBuf) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open telemetry {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut line_number = 0;
    let mut skipped = 0;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<RawData>(&line) {
            Ok(raw) => engine.send(raw).await?,
            Err(e) => {
                skipped += 1;
                warn!("line {line_number}: skipping malformed telemetry: {e}");
            }
        }
    }

    info!("replayed {line_number} lines ({skipped} skipped)");
    Ok(())
}

fn print_summary(insights: &[Insight], failed: &[RuleInstance]) {
    let now = Utc::now();

    println!("{} insights", insights.len());
    for insight in insights {
        println!(
            "  {:<40} {:<18} occurrences={:<4} faulted={:<4} faulty={} sync={}",
            insight.id,
            insight.status.as_str(),
            insight.occurrences.len(),
            insight.faulted_count,
            insight.is_faulty(),
            insight.should_sync(now)
        );
    }

    if !failed.is_empty() {
        println!("{} rule instances failed to bind", failed.len());
        for instance in failed {
            println!(
                "  {:<40} {}",
                instance.id,
                instance.scan_error.as_deref().unwrap_or_default()
            );
        }
    }
}
