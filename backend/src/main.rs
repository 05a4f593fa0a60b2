use anyhow::Context;
use tokio_util::sync::CancellationToken;

use lmchat_lib::config::AppConfig;
use lmchat_lib::logging;
use lmchat_lib::state::AppState;
use lmchat_lib::{log_error, log_info, log_warn};

/// Owns startup, model sync and shutdown. Client-facing transports embed
/// `lmchat_lib` and call into `lmchat_lib::commands`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    logging::init_tracing(&config.log_filter);
    if let Err(e) = logging::init_logging(&config.data_dir) {
        tracing::warn!("File logging disabled: {e}");
    }

    let state = AppState::initialize(config)
        .await
        .context("failed to initialize application state")?;

    if state.models.test_connection().await {
        match state.models.sync_from_provider().await {
            Ok(count) => log_info!("lmchat.models", "Startup sync added {} models", count),
            Err(e) => log_error!("lmchat.models", "Startup sync failed: {}", e),
        }
    } else {
        log_warn!(
            "lmchat.provider",
            "Provider at {} is not reachable; continuing with the local catalogue",
            state.provider.endpoint()
        );
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    log_info!("lmchat", "Backend ready; press Ctrl+C to stop");
    shutdown.cancelled().await;

    state.db.optimize().await;
    log_info!("lmchat", "Shutdown complete");
    Ok(())
}
