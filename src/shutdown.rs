use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::node::NodeContext;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The first signal puts the node into drain mode: nothing new is claimed
/// and the node exits once its running jobs finish. A second signal cancels
/// the returned token straight away.
///
/// # Errors
///
/// Returns an error if a signal handler cannot be registered.
pub fn install_shutdown_handler(ctx: Arc<NodeContext>) -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = token_clone.cancelled() => return,
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };

            if ctx.begin_drain() {
                tracing::info!(
                    signal = name,
                    running_jobs = ctx.running_jobs(),
                    "Draining: no new jobs will be claimed"
                );
            } else {
                tracing::warn!(signal = name, "Second signal received, shutting down now");
                token_clone.cancel();
                return;
            }
        }
    });

    Ok(token)
}
