//! Process signals that end a local session
//!
//! Ctrl-C and, on unix, SIGTERM both resolve the shutdown future, so a
//! terminated owner still writes its metadata and clears its registry record.

use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Which signal ended the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Signal handlers installed up front, before the session starts
pub struct Shutdown {
    #[cfg(unix)]
    terminate: Option<Signal>,
}

impl Shutdown {
    /// Take over SIGTERM so it no longer kills the process outright
    pub fn install() -> Self {
        #[cfg(unix)]
        {
            let terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!("SIGTERM handler unavailable: {}", e);
                    None
                }
            };
            Self { terminate }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    pub async fn wait(self) -> ShutdownSignal {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Ctrl+C handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match self.terminate {
                Some(mut stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let received = tokio::select! {
            _ = interrupt => ShutdownSignal::Interrupt,
            _ = terminate => ShutdownSignal::Terminate,
        };
        info!("{:?} received, stopping", received);
        received
    }
}
