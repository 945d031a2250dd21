//! Local Static Provisioner
//!
//! Node agent that publishes pre-prepared local directories and block
//! devices as PersistentVolumes and recycles them when released.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_static_provisioner::{
    DefaultClientFactory, OsVolumeUtil, ProvisionController, ProvisionerConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local Static Provisioner - node-local PV discovery and recycling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this instance manages
    #[arg(long, env = "MY_NODE_NAME")]
    node_name: String,

    /// Namespace this process runs in; cleanup Jobs and events land here
    #[arg(long, env = "MY_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Container image for cleanup Jobs
    #[arg(long, env = "JOB_CONTAINER_IMAGE", default_value = "")]
    job_container_image: String,

    /// Directory holding the provisioner configuration files
    #[arg(long, env = "PROVISIONER_CONFIG_DIR", default_value = local_static_provisioner::config::DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Deadline in seconds for individual cluster API calls
    #[arg(long, env = "API_TIMEOUT_SECONDS", default_value_t = 30)]
    api_timeout_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Local Static Provisioner");
    info!("  Version: {}", local_static_provisioner::VERSION);
    info!("  Node: {}", args.node_name);
    info!("  Namespace: {}", args.namespace);
    info!("  Config dir: {}", args.config_dir.display());

    let config = match ProvisionerConfig::load_from_dir(&args.config_dir) {
        Ok(config) => config,
        Err(e) => {
            error!("Cannot load provisioner configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "  Storage classes: {}",
        config.classes.names().collect::<Vec<_>>().join(", ")
    );

    let controller = ProvisionController::new(
        config,
        args.node_name,
        args.namespace,
        args.job_container_image,
        Arc::new(DefaultClientFactory),
        Arc::new(OsVolumeUtil::new()),
    )
    .with_request_timeout(std::time::Duration::from_secs(args.api_timeout_seconds));

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    match controller.run(cancel).await {
        Ok(()) => {
            info!("Provisioner shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Provisioner failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Cancel the controller on SIGINT or SIGTERM. In-flight cleanup processes
/// are left running; they are re-observed on the next run.
fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("cannot install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received interrupt, shutting down");
        }
        cancel.cancel();
    });
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
