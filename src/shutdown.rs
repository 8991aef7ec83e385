use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install the process shutdown handler.
///
/// Returns a `CancellationToken` cancelled on SIGINT or SIGTERM. Every
/// subsystem watches a child of this token: the scheduler loop exits, the
/// executor drains in-flight executions, and the gossip member announces
/// its leave before the process ends.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let shutdown = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "shutting down");

        shutdown.cancel();
    });

    token
}
