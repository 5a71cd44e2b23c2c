//! Process-wide shutdown signal: a single `CancellationToken` that every
//! background task (`orchestrator`'s four tickers, `monitoring`, the
//! control surface's axum server) selects on, plus the OS signal handlers
//! and `force-restart` RPC that trigger it.
//!
//! `SIGKILL` cannot actually be caught by a process (the kernel never
//! delivers it to user code) and so has no handler here, unlike the three
//! signals below.

use tokio_util::sync::CancellationToken;

/// Waits for `SIGINT`, `SIGTERM`, or `SIGQUIT` (Unix) / Ctrl-C (elsewhere)
/// and cancels `closer`. Returns once the token has been cancelled, whether
/// by a caught signal or by something else (e.g. the `force-restart` RPC,
/// or a listener's unrecoverable login failure) triggering it first.
pub async fn wait_for_shutdown(closer: CancellationToken) {
    tokio::select! {
        _ = closer.cancelled() => {}
        _ = catch_signals() => closer.cancel(),
    }
}

#[cfg(unix)]
async fn catch_signals() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigquit.recv() => tracing::info!("received SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn catch_signals() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
    tracing::info!("received ctrl-c");
}
