//! ChainBridge Relayer
//!
//! Watches each configured chain for bridge deposits and drives the matching
//! proposal through vote and execute on the destination chain.
//!
//! # Pipeline
//!
//! 1. A listener scans confirmed blocks for `Deposit` events
//! 2. Each deposit becomes a message routed to its destination's writer
//! 3. The writer votes, waits for the vote threshold, then executes
//! 4. The listener commits its checkpoint once the whole window is delivered

use std::sync::Arc;

use relayer::api::{self, AppState};
use relayer::config::Config;
use relayer::metrics::Metrics;
use relayer::relayer::Relayer;
use tokio::sync::watch;
use tracing::{error, info};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting ChainBridge Relayer");

    let config = Config::load()?;
    info!(
        chains = config.chains.len(),
        persistent = config.database_url.is_some(),
        api_port = config.api_port,
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new());
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let relayer = Relayer::connect(&config, metrics.clone(), stop_rx.clone()).await?;

    let api_state = AppState::new(metrics, relayer.domains());
    let api_port = config.api_port;
    let api_stop = stop_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_server(api_port, api_state, api_stop).await {
            error!(error = %e, "API server error");
        }
    });

    let store = relayer.store();
    let halted = relayer.run().await;
    if let Err(e) = store.close().await {
        error!(error = %e, "Failed to close checkpoint store");
    }

    if !halted.is_empty() {
        for chain in &halted {
            error!(domain_id = chain.domain_id, error = %chain.error, "Chain halted");
        }
        return Err(eyre::eyre!("{} chain(s) halted on fatal errors", halted.len()));
    }

    info!("ChainBridge Relayer stopped");
    Ok(())
}

/// Initialize tracing. `LOG_FORMAT=json` switches to JSON lines.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
