//! Fee Pipeline Node
//!
//! Main entry point for the adaptive admission and settlement pipeline.
//! Runs every stage on its own interval against an in-memory ledger and a
//! local validator roster. Ledger state is persisted to disk and survives
//! restarts.

use anyhow::Result;
use clap::Parser;
use fee_pipeline::{
    ledger::LedgerMetadata, FeeSealer, LedgerPersistence, MemoryLedger, PersistentStore, Pipeline,
    PipelineEvent,
};
use pipeline_consensus::LocalConsensusBuilder;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod simulator;

use config::NodeConfig;

/// Fee Pipeline Node
#[derive(Parser, Debug)]
#[command(name = "fee-pipeline")]
#[command(about = "Adaptive transaction admission, batching and fee settlement", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Data directory for persistent state
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Save state every N seconds (0 = only on shutdown)
    #[arg(long, default_value = "30")]
    save_interval: u64,

    /// Secret the sealing key is derived from (random key when absent)
    #[arg(long)]
    seal_secret: Option<String>,

    /// Override the batching interval in milliseconds
    #[arg(long)]
    batch_interval_ms: Option<u64>,

    /// Override the collaborator call timeout in milliseconds
    #[arg(long)]
    call_timeout_ms: Option<u64>,

    /// Disable the traffic simulator
    #[arg(long)]
    no_simulation: bool,

    /// Log pipeline stats every N seconds
    #[arg(long, default_value = "10")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = NodeConfig::load(args.config.as_deref())?;
    if let Some(ms) = args.batch_interval_ms {
        config.pipeline.batch_interval_ms = ms;
    }
    if let Some(ms) = args.call_timeout_ms {
        config.pipeline.call_timeout_ms = ms;
    }
    if args.no_simulation {
        config.simulation.enabled = false;
    }
    config.validate()?;

    run(args, config).await
}

async fn run(args: Args, config: NodeConfig) -> Result<()> {
    tracing::info!("Starting Fee Pipeline node");
    tracing::info!(
        "  Batch: {}..={} (start {}, step {})",
        config.pipeline.batch.min_size,
        config.pipeline.batch.max_size,
        config.pipeline.batch.default_size,
        config.pipeline.batch.step
    );
    tracing::info!("  Fixed fee ceiling: {}ppm", config.pipeline.fee.fixed_ceiling_ppm);
    tracing::info!(
        "  Validators: {} (committee {}, quorum {})",
        config.validators,
        config.committee_size,
        config.quorum
    );
    tracing::info!("  Data directory: {:?}", args.data_dir);
    tracing::info!("  Save interval: {}s", args.save_interval);

    // Create data directory if it doesn't exist
    std::fs::create_dir_all(&args.data_dir)?;

    // Open persistent store
    let persistent_store = Arc::new(PersistentStore::open(&args.data_dir)?);

    // Load existing ledger state from disk
    let ledger = Arc::new(MemoryLedger::new(config.sub_blocks_per_block));
    match persistent_store.load_metadata()? {
        Some(metadata) => {
            tracing::info!(
                "Loading ledger from disk: last sub-block {}, saved at {}",
                metadata.last_sub_block,
                format_ts(metadata.last_save_ts)
            );
            let loaded = ledger.load_from_disk(&persistent_store)?;
            tracing::info!("Loaded {} sub-blocks from persistent storage", loaded);
        }
        None => tracing::info!("No existing state found, starting fresh"),
    }
    let first_sub_block = ledger.next_sub_block_id();

    let consensus = Arc::new(
        LocalConsensusBuilder::new()
            .generated_validators("fee-pipeline", config.validators)
            .committee_size(config.committee_size)
            .quorum(config.quorum)
            .build(),
    );

    let sealer = match &args.seal_secret {
        Some(secret) => FeeSealer::new(*blake3::hash(secret.as_bytes()).as_bytes()),
        None => {
            tracing::warn!("No seal secret given; sealed values will not be readable after restart");
            FeeSealer::generate()
        }
    };

    let pipeline = Pipeline::builder()
        .config(config.pipeline.clone())
        .ledger(ledger.clone())
        .validator(consensus.clone())
        .sealer(Arc::new(sealer))
        .first_sub_block_id(first_sub_block)
        .build()?;
    let batch = pipeline.batch_config();
    tracing::info!(
        "Pipeline ready, first sub-block {}, batch {}..={} step {}",
        first_sub_block,
        batch.min_size,
        batch.max_size,
        batch.step
    );

    // Log notable events
    let mut events = pipeline.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PipelineEvent::FeeBoundsAdjusted { load, bounds }) => {
                    tracing::debug!(
                        "Load {}: floor {}, sub-ceiling {}ppm",
                        load,
                        bounds.floor,
                        bounds.sub_ceiling_ppm
                    );
                }
                Ok(PipelineEvent::BatchSizeChanged { from, to, load }) => {
                    tracing::info!("Batch size {} -> {} (load {})", from, to, load);
                }
                Ok(PipelineEvent::RewardsDistributed { sub_block, amount }) => {
                    tracing::debug!("Rewards for {}: {}", sub_block, amount);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event logger skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (scheduler, mut outcomes) = pipeline.start(1024);
    let outcome_drain = tokio::spawn(async move {
        let mut failed_cycles = 0u64;
        while let Some(outcome) = outcomes.recv().await {
            if outcome.result.is_err() {
                failed_cycles += 1;
            }
        }
        tracing::info!("{} failed cycles during this run", failed_cycles);
    });

    // Simulated traffic
    let simulating = Arc::new(AtomicBool::new(config.simulation.enabled));
    let mut simulation = Vec::new();
    if config.simulation.enabled {
        let after = simulator::last_tx_id(&ledger);
        tracing::info!(
            "Simulating {} submissions/s starting after {}",
            config.simulation.rate_per_sec,
            after
        );
        simulation.push(simulator::spawn_submissions(
            pipeline.transaction_sender(),
            config.simulation.clone(),
            after,
            simulating.clone(),
        ));
        simulation.push(simulator::spawn_completions(
            ledger.clone(),
            config.simulation.clone(),
            simulating.clone(),
        ));
    }

    // Periodic save to disk
    let save_store = persistent_store.clone();
    let save_ledger = ledger.clone();
    let save_interval = args.save_interval;
    let saver = tokio::spawn(async move {
        if save_interval == 0 {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(save_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = save_ledger.save_to_disk(&save_store) {
                tracing::error!("Failed to save ledger: {}", e);
            }
        }
    });

    // Periodic stats
    let stats_ledger = ledger.clone();
    let stats_consensus = consensus.clone();
    let stats_pool = pipeline.pool().clone();
    let stats_interval = args.stats_interval.max(1);
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            let ledger_stats = stats_ledger.stats();
            let consensus_stats = stats_consensus.stats();
            tracing::info!(
                "Pool {} admitted / {} pending | {} sub-blocks, {} blocks, {} finalizations, {} distributions, {} refunds ({} pending, {} settled) | {}/{} validators active, {} proofs, {} quorum failures",
                stats_pool.admitted_len(),
                stats_pool.pending_len(),
                ledger_stats.sub_blocks,
                ledger_stats.blocks,
                ledger_stats.finalize_calls,
                ledger_stats.distribute_calls,
                ledger_stats.refunds,
                ledger_stats.pending_refunds,
                ledger_stats.settled,
                consensus_stats.active_validators,
                consensus_stats.validators,
                consensus_stats.proofs_generated,
                consensus_stats.quorum_failures
            );
        }
    });

    tracing::info!("Fee pipeline running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    simulating.store(false, Ordering::SeqCst);
    for handle in simulation {
        handle.abort();
    }
    scheduler
        .shutdown(Duration::from_millis(config.pipeline.call_timeout_ms * 2))
        .await;

    let bounds = pipeline.fee_bounds();
    tracing::info!(
        "Final fee bounds: floor {}, sub-ceiling {}ppm, batch target {}",
        bounds.floor,
        bounds.sub_ceiling_ppm,
        pipeline.batch_target()
    );

    // Save state before shutdown
    tracing::info!("Saving final state...");
    match ledger.save_to_disk(&persistent_store) {
        Ok(count) => {
            let metadata: Option<LedgerMetadata> = persistent_store.load_metadata()?;
            tracing::info!(
                "Final state saved: {} sub-blocks, last {}",
                count,
                metadata.map(|m| m.last_sub_block).unwrap_or_default()
            );
        }
        Err(e) => tracing::error!("Failed to save final state: {}", e),
    }

    // Abort tasks
    saver.abort();
    reporter.abort();
    event_logger.abort();
    drop(pipeline);
    let _ = tokio::time::timeout(Duration::from_secs(1), outcome_drain).await;

    tracing::info!("Node stopped");

    Ok(())
}

fn format_ts(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}
