use futures::future;
use tokio::select;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// Resolves once SIGINT or SIGTERM is received.
pub struct Shutdown {
    rx: watch::Receiver<Option<&'static str>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            rx: spawn_signal_listener(),
        }
    }

    /// Waits for a signal and returns its name.
    pub async fn wait(&mut self) -> &'static str {
        match self.rx.wait_for(Option::is_some).await {
            Ok(signal) => (*signal).unwrap_or("unknown signal"),
            // the listener task is gone, nothing will ever be received
            Err(_) => future::pending().await,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_signal_listener() -> watch::Receiver<Option<&'static str>> {
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate()).ok();

        let term_future = async {
            if let Some(ref mut sigterm) = sigterm {
                sigterm.recv().await;
                Some("SIGTERM")
            } else {
                future::pending::<Option<&'static str>>().await
            }
        };

        let received = select! {
            res = signal::ctrl_c() => match res {
                Ok(()) => Some("SIGINT"),
                Err(e) => {
                    warn!("Failed to listen for SIGINT: {:?}", e);
                    None
                }
            },
            name = term_future => name,
        };

        if let Some(name) = received {
            info!("Received {}.", name);
            let _ = tx.send(Some(name));
        } else {
            // keep the channel open so waiters stay pending
            future::pending::<()>().await;
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_returns_signal_name() {
        let (tx, rx) = watch::channel(None);
        let mut shutdown = Shutdown { rx };
        assert!(shutdown.rx.borrow().is_none());

        tx.send(Some("SIGTERM")).unwrap();
        assert_eq!(shutdown.wait().await, "SIGTERM");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_pending_without_signal() {
        let (_tx, rx) = watch::channel(None);
        let mut shutdown = Shutdown { rx };
        let res = tokio::time::timeout(Duration::from_secs(60), shutdown.wait()).await;
        assert!(res.is_err());
    }
}
