use anyhow::Result;
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{info, warn};

/// Signal types that can be received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// SIGTERM or SIGINT
    Shutdown,
    /// SIGHUP: re-read the preference record
    Reload,
}

/// Forwards process signals to the service as [`SignalType`]s
pub struct SignalHandler {
    signal_sender: mpsc::UnboundedSender<SignalType>,
}

impl SignalHandler {
    pub fn new(signal_sender: mpsc::UnboundedSender<SignalType>) -> Self {
        Self { signal_sender }
    }

    /// Register the handlers and forward signals from a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn() -> Result<mpsc::UnboundedReceiver<SignalType>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
        let handler = Self::new(sender);
        tokio::spawn(async move { handler.forward(signals).await });
        Ok(receiver)
    }

    /// Forward signals until a shutdown signal arrives or the receiver is dropped
    async fn forward(self, mut signals: Signals) {
        info!("Signal handler initialized, listening for SIGTERM, SIGINT, SIGHUP");

        while let Some(signal) = signals.next().await {
            let signal_type = match signal {
                SIGTERM | SIGINT => {
                    info!(
                        "Received shutdown signal ({}), initiating graceful shutdown",
                        signal
                    );
                    SignalType::Shutdown
                }
                SIGHUP => {
                    info!("Received SIGHUP signal, reloading preferences");
                    SignalType::Reload
                }
                _ => {
                    warn!("Received unexpected signal: {}", signal);
                    continue;
                }
            };

            if self.signal_sender.send(signal_type).is_err() {
                warn!("Service is no longer listening for signals");
                break;
            }
            if signal_type == SignalType::Shutdown {
                break;
            }
        }

        signals.handle().close();
    }
}
