use std::future::Future;
use tokio::sync::watch;

use crate::error::{IndexError, IndexResult};

/// Fires the shutdown once; held by the signal-watching task
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Observed by the engine at every await point and between transaction writes
#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.0.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown fires. Never resolves if the trigger is dropped unfired.
    pub async fn wait(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Runs `fut` unless shutdown fires first
    pub async fn guard<F: Future>(&self, fut: F) -> IndexResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.wait() => Err(IndexError::Cancelled),
            out = fut => Ok(out),
        }
    }

    pub async fn sleep(&self, duration: std::time::Duration) -> IndexResult<()> {
        self.guard(tokio::time::sleep(duration)).await
    }
}
