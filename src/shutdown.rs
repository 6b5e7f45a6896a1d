use std::future::Future;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Resolves with the stop reason on ctrl-c or, on unix, SIGTERM. Handlers are
/// installed when this is called, so a signal sent before the first poll is
/// not lost. Must be called inside a tokio runtime.
pub fn shutdown_signal() -> impl Future<Output = &'static str> + Send {
    #[cfg(unix)]
    let sigterm = signal(SignalKind::terminate()).ok();

    async move {
        #[cfg(unix)]
        if let Some(mut sigterm) = sigterm {
            return tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl_c",
                _ = sigterm.recv() => "sigterm",
            };
        }

        let _ = tokio::signal::ctrl_c().await;
        "ctrl_c"
    }
}
