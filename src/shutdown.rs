//! Signal-driven shutdown.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on SIGTERM or SIGINT.
///
/// The listener exits quietly if `token` is cancelled some other way first.
pub fn forward_signals(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        tracing::warn!(error = %e, "failed to install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                }
                _ = token.cancelled() => return,
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        tracing::warn!(error = %e, "failed to listen for ctrl-c");
                        return;
                    }
                    tracing::info!("received ctrl-c, initiating graceful shutdown");
                }
                _ = token.cancelled() => return,
            }
        }

        token.cancel();
    })
}
