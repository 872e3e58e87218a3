//! Process-wide shutdown signal.

use tokio::sync::watch;
use tracing::info;

/// Broadcasts a single shutdown edge to every session.
///
/// Cloned receivers observe the flip via [`ShutdownToken::wait`]; the signal
/// is latched, so late subscribers see it immediately.
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

pub fn shutdown_pair() -> (ShutdownHandle, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownToken { rx })
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Trip the shutdown signal on SIGINT.
    pub fn install_ctrl_c(self) {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                self.trigger();
            }
        });
    }
}

impl ShutdownToken {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}
