/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both ask the loop to stop between ticks.
/// A recovery sequence already in progress is allowed to finish first.
use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

pub struct SignalHandler {
    interrupt: Signal,
    terminate: Signal,
}

impl SignalHandler {
    /// Register the handlers. Must be called from within the tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Resolve on the first SIGINT or SIGTERM.
    pub async fn wait(mut self) -> ShutdownSignal {
        let received = tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        };
        tracing::info!(signal = ?received, "shutdown requested");
        received
    }
}
