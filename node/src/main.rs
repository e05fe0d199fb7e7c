//! Compute Grid Node
//!
//! The node is the per-host execution manager of a peer-to-peer compute
//! grid. It accepts externally offered subtasks, fetches their input
//! resources, runs them in isolated workers with deadline supervision, and
//! reports success, failure or timeout back to the task server.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// The node is organized into several modules, each with a distinct
// responsibility.
mod computer;
mod config;
mod container;
mod monitor;
mod registry;
mod resources;
mod server;
mod vm;
mod worker;

#[cfg(test)]
mod tests;

use computer::{ComputerEvent, TaskComputer};
use config::ConfigManager;
use container::LocalContainerManager;
use monitor::{MonitorEvent, MonitorReceiver};
use server::{DetachedTaskServer, NoBenchmarks};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use vm::TestVm;

/// Command-line arguments for the node
#[derive(Parser, Debug)]
#[command(name = "node")]
#[command(about = "Compute grid node that accepts subtasks and reports outcomes", long_about = None)]
struct CliArgs {
    /// Path to the configuration directory containing node.toml and compute.toml
    #[arg(value_name = "CONFIG_DIR")]
    config_dir: PathBuf,

    /// Override the node name from config file
    #[arg(long = "node-name", value_name = "NAME")]
    node_name: Option<String>,

    /// Override the accept-tasks switch from config file
    #[arg(long = "accept-tasks", value_name = "BOOL")]
    accept_tasks: Option<bool>,
}

/// The main application structure for the node. It owns the Task Computer
/// and the receiving halves of the control and monitor channels.
pub struct Node {
    config_manager: ConfigManager,
    computer: TaskComputer,
    event_rx: mpsc::Receiver<ComputerEvent>,
    monitor_rx: MonitorReceiver,
    last_config_check: Instant,
}

impl Node {
    /// Creates and fully initializes a node: loads configuration, wires the
    /// collaborator seams, and constructs the Task Computer.
    pub async fn new(config_dir: PathBuf, cli_args: &CliArgs) -> Result<Self> {
        info!("Starting compute grid node");

        // The data directory is expected to be a sibling of the config
        // directory.
        let data_dir = config_dir
            .parent()
            .map(|p| p.join("data"))
            .unwrap_or_else(|| PathBuf::from("./data"));
        info!("Data directory: {}", data_dir.display());

        let mut config_manager = ConfigManager::new(config_dir)?;
        config_manager.load_config().await?;

        let mut node_config = config_manager
            .node_config
            .clone()
            .context("Node configuration not loaded")?;
        let mut compute_config = config_manager
            .compute_config
            .clone()
            .context("Compute configuration not loaded")?;

        if let Some(node_name) = &cli_args.node_name {
            info!("Node name override provided via command line");
            node_config.node_name = node_name.clone();
            node_config.validate().context("Invalid node name override")?;
        }
        if let Some(accept_tasks) = cli_args.accept_tasks {
            info!("Accept-tasks override provided via command line");
            compute_config.accept_tasks = accept_tasks;
        }

        info!(
            node_name = %node_config.node_name,
            accept_tasks = compute_config.accept_tasks,
            max_assigned_tasks = compute_config.max_assigned_tasks,
            "Node configuration loaded"
        );

        let (event_tx, event_rx) = mpsc::channel(node_config.channel_buffer_size);
        let (monitor_tx, monitor_rx) = monitor::channel();

        // The payload execution seam: until a sandboxed interpreter is wired
        // in, payloads run in the deterministic test interpreter.
        info!("Payload runtime: deterministic test interpreter");
        let computer = TaskComputer::new(
            node_config.node_name.clone(),
            data_dir,
            Arc::new(DetachedTaskServer),
            Arc::new(LocalContainerManager::install()),
            Arc::new(NoBenchmarks),
            Arc::new(TestVm),
            monitor_tx,
            event_tx,
            &compute_config,
        )?;

        Ok(Self {
            config_manager,
            computer,
            event_rx,
            monitor_rx,
            last_config_check: Instant::now(),
        })
    }

    /// Runs the node's main loop: drains control and monitor events and
    /// drives the Task Computer's tick.
    pub async fn run(&mut self) -> Result<()> {
        let node_config = self
            .config_manager
            .node_config
            .clone()
            .context("Node configuration not loaded")?;

        let mut tick =
            tokio::time::interval(Duration::from_millis(node_config.tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Starting node main loop");

        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    self.computer.handle_event(event);
                }
                Some(event) = self.monitor_rx.recv() => {
                    Self::log_monitor_event(event);
                }
                _ = tick.tick() => {
                    self.computer.run();
                    if let Err(e) = self.check_config_if_needed(&node_config).await {
                        warn!("Configuration check failed: {}", e);
                    }
                }
            }
        }
    }

    /// Reloads the compute configuration when the files changed on disk.
    /// Node-level settings require a restart and are only reported.
    async fn check_config_if_needed(
        &mut self,
        node_config: &shared::config::NodeConfig,
    ) -> Result<()> {
        let check_interval = Duration::from_secs(node_config.config_check_interval_seconds);
        if self.last_config_check.elapsed() < check_interval {
            return Ok(());
        }
        self.last_config_check = Instant::now();

        if self.config_manager.check_for_changes().await? {
            let compute_config = self
                .config_manager
                .compute_config
                .clone()
                .context("Compute configuration not loaded")?;
            self.computer.change_config(&compute_config, true, false)?;
            info!("Compute configuration reapplied");

            if self.config_manager.node_config.as_ref() != Some(node_config) {
                warn!("Node-level configuration changed; restart required to apply");
            }
        }
        Ok(())
    }

    fn log_monitor_event(event: MonitorEvent) {
        match event {
            MonitorEvent::ComputationTimeSpent { success, value } => {
                info!(success, value, "computation_time_spent");
            }
        }
    }

    /// Asks live workers to stop before the process exits.
    pub fn shutdown(&mut self) {
        self.computer.quit();
        let stats = self.computer.stats();
        info!(
            requested = stats.tasks_requested,
            computed = stats.computed_tasks,
            timed_out = stats.tasks_with_timeout,
            errored = stats.tasks_with_errors,
            "Final computation statistics"
        );
    }
}

// The `#[tokio::main]` attribute transforms the `async fn main` into a
// synchronous `fn main` that initializes a tokio runtime and runs the async
// code.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the logging framework (`tracing`).
    let file_appender = tracing_appender::rolling::daily("./logs", "node.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Configure logging with proper RUST_LOG environment variable handling
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("node=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("Compute grid node starting up");
    info!("Configuration directory: {}", cli_args.config_dir.display());

    let mut node = match Node::new(cli_args.config_dir.clone(), &cli_args).await {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to initialize node: {}", e);
            let mut current_error = e.source();
            while let Some(err) = current_error {
                error!("  Caused by: {}", err);
                current_error = err.source();
            }
            std::process::exit(1);
        }
    };

    // Set up signal handling for graceful shutdown.
    let shutdown_signal = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                },
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                },
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C");
        }
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                error!("Node error: {}", e);
                std::process::exit(1);
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received");
        }
    }

    node.shutdown();
    debug!("Node shutdown complete");
    Ok(())
}
