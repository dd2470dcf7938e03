use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

mod client_logic;
use client_logic::{config, observer::ClientObserver};
use lib_peer::{Engine, Transports};

/// How long shutdown waits for the tables to settle.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    let _log_guard = lib_peer::init_tracing(&config.log_options())?;
    let options = config.client_options()?;

    tracing::info!("Welcome to the peer client");
    tracing::info!(
        client_type = %options.engine.client_type,
        netstated = options.engine.netstated.as_deref().unwrap_or(""),
        tag = %options.realtime.tag,
        proxyport = options.local.proxy_port,
        "Effective configuration"
    );
    tracing::debug!("options: {}", serde_json::to_string(&options)?);

    let observer = Arc::new(ClientObserver::new());
    let mut ready = observer.ready();
    let transports = Transports::from_options(&options)?;
    let engine = Engine::boot(&options, &transports, observer.clone())?;
    if let Some(addr) = engine.local_addr() {
        tracing::info!(%addr, "Local proxy endpoint listening");
    }
    ready.mark_unchanged();
    engine.start();
    engine.debug();

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        tracing::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        tracing::warn!("Cannot listen for SIGTERM: {e}");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    engine.debug();
    engine.stop();
    match tokio::time::timeout(STOP_GRACE, ready.changed()).await {
        Ok(_) => tracing::info!("Shutdown complete."),
        Err(_) => tracing::warn!("Tables did not settle within {:?}; exiting anyway.", STOP_GRACE),
    }
    Ok(())
}
