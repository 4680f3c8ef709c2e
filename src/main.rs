use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use snap_executor::backoff::Backoff;
use snap_executor::config::{Config, SnapConfig};
use snap_executor::transport::ProcessEnvironment;
use snap_executor::{
    EnvironmentError, ExecutionError, ExecutionPayload, ExecutionService, OriginAllowList, ProviderHooks,
    ServiceEvent,
};

/// How long an environment must stay up before a later loss starts the
/// recovery backoff from scratch.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

fn print_help() {
    println!(
        "\
snap-executor v{}

Runs untrusted snaps as jobs inside one shared sandbox host process.

USAGE:
    snap-executor [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/executor.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, snap_executor=debug,warn)

EXAMPLES:
    snap-executor                               # uses config/executor.toml
    snap-executor /etc/snaps/executor.toml      # custom config path
    RUST_LOG=debug snap-executor                # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("snap-executor v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("snap_executor=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/executor.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!("Sandbox host: {}", config.environment.description());
    info!(
        "Allowed origins: {}",
        config.permissions.allowed_origins.join(", ")
    );
    info!(
        "Timeouts: init {}ms, ping {}ms, request {}ms",
        config.service.init_timeout_ms,
        config.service.ping_timeout_ms,
        config.service.request_timeout_ms
    );

    let hooks = ProviderHooks::new();
    info!("Provider hooks: {} registered", hooks.len());

    let service = ExecutionService::new(
        Arc::new(ProcessEnvironment::new(config.environment.clone())),
        config.service.clone(),
        Arc::new(hooks),
        Arc::new(OriginAllowList::new(
            config.permissions.allowed_origins.clone(),
        )),
    );
    let mut events = service.events();

    if let Err(e) = start_snaps(&service, &config.snaps).await {
        error!("Cannot create execution environment: {e}");
        service.shutdown();
        return Err(anyhow!("Cannot create execution environment: {e}"));
    }

    let mut backoff = Backoff::from_config(&config.recovery);
    let mut up_since = Instant::now();

    // ── Event loop ─────────────────────────────────────────────────
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                service.shutdown();
                return Ok(());
            }
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event listener fell behind, {skipped} event(s) skipped");
                continue;
            }
            Err(RecvError::Closed) => return Ok(()),
        };

        match event {
            ServiceEvent::EnvironmentLost { generation, reason } => {
                // A loss reported by an environment we already replaced.
                if let Some(current) = service.environment() {
                    if current.generation() > generation {
                        debug!("Ignoring loss of stale environment generation {generation}");
                        continue;
                    }
                }
                error!("Execution environment lost: {reason}");

                if up_since.elapsed() >= STABILITY_THRESHOLD {
                    backoff.reset();
                    info!("Environment was stable, backoff reset");
                } else {
                    warn!(
                        "Environment lasted only {}s",
                        up_since.elapsed().as_secs()
                    );
                }

                if !recover(&service, &config, &mut backoff).await? {
                    return Ok(());
                }
                up_since = Instant::now();
            }
            ServiceEvent::JobReady { job_id, snap_id } => {
                debug!("Snap {snap_id} ready in job {job_id}");
            }
            ServiceEvent::JobTerminated { job_id, snap_id } => {
                debug!("Snap {snap_id} stopped (job {job_id})");
            }
            ServiceEvent::UnhandledError { snap_id, error } => {
                warn!("Snap {snap_id} crashed: {error}");
            }
            ServiceEvent::OutboundRequest { snap_id } => {
                debug!("Snap {snap_id} started an outbound request");
            }
            ServiceEvent::OutboundResponse { snap_id } => {
                debug!("Snap {snap_id} finished an outbound request");
            }
        }
    }
}

/// Tears the lost environment down and brings the configured snaps back,
/// retrying with backoff. Returns `Ok(false)` on a shutdown signal.
async fn recover(service: &ExecutionService, config: &Config, backoff: &mut Backoff) -> Result<bool> {
    loop {
        service.recover_environment();

        if backoff.exceeded_max_attempts(config.recovery.max_attempts) {
            error!(
                "Exceeded {} recovery attempts, giving up",
                config.recovery.max_attempts
            );
            return Err(anyhow!(
                "Max recovery attempts ({}) exceeded",
                config.recovery.max_attempts
            ));
        }

        // Wait before retrying, but allow graceful shutdown during the wait
        let delay = backoff.next_delay();
        info!(
            "Recreating execution environment in {}s (attempt {})...",
            delay.as_secs(),
            backoff.attempt
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received during recovery, exiting");
                service.shutdown();
                return Ok(false);
            }
        }

        match start_snaps(service, &config.snaps).await {
            Ok(()) => {
                info!("Execution environment recovered");
                return Ok(true);
            }
            Err(e) if !e.is_retriable() => {
                error!("Permanent environment error: {e}");
                return Err(anyhow!("Cannot recreate execution environment: {e}"));
            }
            Err(e) => warn!("Recovery attempt failed: {e}"),
        }
    }
}

/// Executes every configured snap.
///
/// A snap that fails on its own (bad source, init timeout) is logged and
/// skipped. Failing to create the environment stops the batch.
async fn start_snaps(
    service: &ExecutionService,
    snaps: &[SnapConfig],
) -> std::result::Result<(), EnvironmentError> {
    for snap in snaps {
        let source_code = match tokio::fs::read_to_string(&snap.path).await {
            Ok(source) => source,
            Err(e) => {
                error!("Cannot read snap {} from {}: {e}", snap.id, snap.path.display());
                continue;
            }
        };

        let payload = ExecutionPayload {
            snap_id: snap.id.clone(),
            source_code,
            endowments: snap.endowments.clone(),
        };

        match service.execute_snap(payload).await {
            Ok(job_id) => info!("Started snap {} (job {job_id})", snap.id),
            Err(ExecutionError::EnvironmentCreation(e)) => return Err(e),
            Err(e) => error!("Snap {} failed to start: {e}", snap.id),
        }
    }
    Ok(())
}
