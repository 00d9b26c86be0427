//! Graceful-shutdown signal handling.

use tokio_util::sync::CancellationToken;

/// Installs a handler for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. The supervisor and the workers watch this token and drain
/// gracefully.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        token_clone.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, initiating graceful shutdown");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for Ctrl+C");
    }
}
