//! Translates SIGINT/SIGTERM into cancellation of the ingester
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Spawns a task that cancels `token` on the first SIGINT or SIGTERM
pub fn listen(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("failed to install SIGINT handler: {e}");
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
                    error!("failed to install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, draining"),
            _ = terminate => info!("received SIGTERM, draining"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
}
