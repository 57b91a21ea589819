/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both cancel the job's token, which the
/// supervisor observes at its suspension points and turns into the stop
/// protocol. Later signals are logged and otherwise ignored: the stop
/// protocol always runs to completion so the capture process is never orphaned.
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

const SHUTDOWN_SIGNALS: [(&str, SignalKind); 2] = [
    ("SIGINT", SignalKind::interrupt()),
    ("SIGTERM", SignalKind::terminate()),
];

pub struct SignalHandler {
    token: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
}

impl SignalHandler {
    /// Register SIGINT/SIGTERM listeners that cancel `token`.
    ///
    /// Listeners log through the subscriber current at install time.
    pub fn install(token: CancellationToken) -> std::io::Result<SignalHandler> {
        Self::listen(token, &SHUTDOWN_SIGNALS)
    }

    fn listen(
        token: CancellationToken,
        signals: &[(&'static str, SignalKind)],
    ) -> std::io::Result<SignalHandler> {
        let mut listeners = Vec::with_capacity(signals.len());
        for &(name, kind) in signals {
            let mut stream = signal(kind)?;
            let cancel = token.clone();
            let listener = async move {
                while stream.recv().await.is_some() {
                    if cancel.is_cancelled() {
                        tracing::warn!(signal = name, "already stopping, signal ignored");
                    } else {
                        tracing::info!(signal = name, "interrupt received, stopping capture");
                        cancel.cancel();
                    }
                }
            };
            listeners.push(tokio::spawn(listener.with_current_subscriber()));
        }
        Ok(SignalHandler { token, listeners })
    }

    /// The token cancelled on the first interrupt.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}
