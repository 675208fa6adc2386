use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;

use treewatch::{
    cli::Cli,
    config::{load_records, MonitorConfig},
    DryRunSource, Monitor, StopReason, TargetRegistry, TreeBuilder,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();

    let config = cli.monitor_config();
    config.validate()?;

    let config_path = cli.get_config_path();
    let records = load_records(&config_path)?;
    let registry = TargetRegistry::resolve(&records)
        .with_context(|| format!("Invalid target in {}", config_path.display()))?;

    if registry.is_empty() {
        tracing::warn!("no targets configured in {}", config_path.display());
    }

    if cli.check {
        run_check(registry, &config).await;
        return Ok(());
    }

    run_monitor(registry, &config).await
}

async fn run_monitor(registry: TargetRegistry, config: &MonitorConfig) -> Result<()> {
    let (monitor, streams) =
        Monitor::with_notify(registry, config).context("Failed to create file system watcher")?;

    tracing::info!("Registering watch tree ({} targets)", monitor.registry().len());
    monitor.register_targets().await;

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;

    let shutdown = async move {
        let _ = shutdown_rx.recv().await;
    };

    match monitor.run(streams, shutdown).await {
        StopReason::SourceError(err) => Err(err).context("File watcher stopped"),
        StopReason::EventsClosed | StopReason::Shutdown => Ok(()),
    }
}

async fn run_check(registry: TargetRegistry, config: &MonitorConfig) {
    let source = Arc::new(DryRunSource::new());
    let builder = TreeBuilder::new(source.clone(), config.max_parallel);
    builder.register_targets(&registry).await;

    println!("targets ({}):", registry.len());
    for target in registry.targets() {
        let depth = if target.is_unbounded() {
            "unbounded".to_string()
        } else {
            target.depth.to_string()
        };
        let kinds: Vec<&str> = treewatch::EventKind::PRIORITY
            .iter()
            .filter(|kind| target.events.contains_kind(**kind))
            .map(|kind| kind.label())
            .collect();
        println!("  - {}", target.path.display());
        println!("      depth: {}", depth);
        println!("      events: {}", kinds.join("|"));
    }

    let dirs = source.registered();
    println!();
    println!("directories ({}):", dirs.len());
    for dir in dirs {
        println!("  {}", dir.display());
    }
}
