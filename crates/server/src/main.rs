//! # Meridian World Node
//!
//! Headless node hosting the spatial view-cache core.
//!
//! ## Usage
//!
//! ```bash
//! # Start with default settings
//! meridian-server
//!
//! # Start with a config file, overriding the grid size
//! meridian-server --config node.toml --space-size 120
//!
//! # Run the scripted demo world with debug logging
//! meridian-server --demo --verbose
//! ```

mod config;
mod demo;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use meridian_spatial::{DeltaOrdering, LocalExecutor, MemoryDirectory, Universe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ServerConfig;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "meridian-server")]
#[command(about = "Meridian world node")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node name reported in logs
    #[arg(long)]
    node_name: Option<String>,

    /// Edge length of a grid space (world units)
    #[arg(long)]
    space_size: Option<f32>,

    /// Radius of a view's proximity sphere (world units)
    #[arg(long)]
    proximity_radius: Option<f32>,

    /// Cache processor interval (ms)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Queue owner used for deltas
    #[arg(long, value_enum)]
    ordering: Option<OrderingArg>,

    /// Run the scripted demo world
    #[arg(long)]
    demo: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderingArg {
    PerView,
    PerUpdate,
}

impl From<OrderingArg> for DeltaOrdering {
    fn from(arg: OrderingArg) -> Self {
        match arg {
            OrderingArg::PerView => DeltaOrdering::PerView,
            OrderingArg::PerUpdate => DeltaOrdering::PerUpdate,
        }
    }
}

impl Args {
    /// CLI flags take precedence over the file
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(name) = &self.node_name {
            config.server.node_name = name.clone();
        }
        if let Some(size) = self.space_size {
            config.spatial.grid.space_size = size;
        }
        if let Some(radius) = self.proximity_radius {
            config.spatial.view.proximity_radius = radius;
        }
        if let Some(interval) = self.interval_ms {
            config.spatial.processor.interval_ms = interval;
        }
        if let Some(ordering) = self.ordering {
            config.spatial.processor.ordering = ordering.into();
        }
        if self.demo {
            config.server.demo = true;
        }
    }
}

// ============================================================================
// Main
// ============================================================================

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);
    config
        .spatial
        .validate()
        .context("invalid configuration after applying command-line flags")?;
    Ok(config)
}

/// Log node-wide counters until shutdown fires
fn spawn_status(
    universe: Arc<Universe>,
    executor: Arc<LocalExecutor>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let stats = executor.stats();
                    info!(
                        cells = universe.cell_count(),
                        views = universe.view_count(),
                        spaces = universe.space_manager().len(),
                        tasks_pending = stats.pending,
                        tasks_completed = stats.completed,
                        tasks_failed = stats.failed,
                        tasks_rejected = stats.rejected,
                        "Node status"
                    );
                    for cache in universe.view_caches() {
                        let cache_stats = cache.stats();
                        debug!(
                            view = %cache.view_id(),
                            spaces = cache_stats.entered_spaces,
                            roots = cache_stats.cached_roots,
                            pending = cache_stats.pending_updates,
                            processed = cache_stats.updates_processed,
                            revalidations = cache_stats.space_revalidations,
                            scheduled = cache_stats.batches_scheduled,
                            rejected = cache_stats.batches_rejected,
                            "View cache status"
                        );
                    }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║                  Meridian World Node                       ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = load_config(&args)?;
    let spatial = &config.spatial;
    info!(
        node = %config.server.node_name,
        space_size = spatial.grid.space_size,
        max_spaces_per_lookup = spatial.grid.max_spaces_per_lookup,
        proximity_radius = spatial.view.proximity_radius,
        interval_ms = spatial.processor.interval_ms,
        ordering = ?spatial.processor.ordering,
        queue_capacity = spatial.executor.queue_capacity,
        "Node configuration"
    );

    let executor = Arc::new(LocalExecutor::new(spatial.executor.queue_capacity));
    let directory = Arc::new(MemoryDirectory::new());
    let universe = Arc::new(Universe::new(
        spatial.clone(),
        executor.clone(),
        directory.clone(),
    )?);

    universe.start()?;
    let runner = executor.spawn_runner(universe.processor().shutdown_receiver());
    let status = spawn_status(
        universe.clone(),
        executor.clone(),
        config.server.status_interval(),
        universe.processor().shutdown_receiver(),
    );

    let (demo_client, walker) = if config.server.demo {
        let client = demo::build_world(&universe, &directory)?;
        let walker = demo::spawn_walker(
            universe.clone(),
            spatial.processor.interval(),
            universe.processor().shutdown_receiver(),
        );
        (Some(client), Some(walker))
    } else {
        (None, None)
    };

    info!("Node running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    universe.shutdown();
    executor.shutdown();

    for (name, handle) in [("executor runner", Some(runner)), ("status", Some(status)), ("demo walker", walker)] {
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Background task ended abnormally");
            }
        }
    }

    // Tasks accepted before shutdown
    let drained = executor.run_pending();
    if let Some(client) = demo_client {
        let (loads, unloads, revalidations) = client.totals();
        info!(loads, unloads, revalidations, "Demo client totals");
    }
    info!(drained, "Node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let args = Args::parse_from([
            "meridian-server",
            "--space-size",
            "64",
            "--ordering",
            "per-update",
            "--node-name",
            "west",
            "--demo",
        ]);
        let mut config = ServerConfig::default();
        args.apply(&mut config);

        assert_eq!(config.spatial.grid.space_size, 64.0);
        assert_eq!(config.spatial.processor.ordering, DeltaOrdering::PerUpdate);
        assert_eq!(config.server.node_name, "west");
        assert!(config.server.demo);
        assert_eq!(config.spatial.view.proximity_radius, 35.0);
    }

    #[test]
    fn test_invalid_flag_rejected() {
        let args = Args::parse_from(["meridian-server", "--interval-ms", "0"]);
        assert!(load_config(&args).is_err());
    }
}
