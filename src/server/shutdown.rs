//! Graceful-drain signalling between a listener and its sessions.

use std::sync::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Notifier tells the accept loop and all sessions of one listener that a
/// drain is in progress, and lets the listener wait until they are gone.
#[derive(Debug)]
pub struct Notifier {
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
    complete_tx: RwLock<Option<mpsc::Sender<()>>>,
    complete_rx: Mutex<mpsc::Receiver<()>>,
}

impl Notifier {
    pub fn new() -> Notifier {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = mpsc::channel(1);
        Notifier {
            shutdown_tx: RwLock::new(Some(shutdown_tx)),
            complete_tx: RwLock::new(Some(complete_tx)),
            complete_rx: Mutex::new(complete_rx),
        }
    }

    /// Signal the drain. Dropping the senders wakes every subscribed
    /// watcher; the final completion sender clone disappears when the last
    /// watcher goes out of scope, which is what `linger` waits for.
    pub fn notify(&self) {
        drop(self.shutdown_tx.write().unwrap_or_else(|e| e.into_inner()).take());
        drop(self.complete_tx.write().unwrap_or_else(|e| e.into_inner()).take());
    }

    /// Wait until every watcher handed out by `subscribe` has been dropped.
    pub async fn linger(&self) {
        let _ = self.complete_rx.lock().await.recv().await;
    }

    /// Obtain a watcher. Holding it marks the caller as still draining.
    pub fn subscribe(&self) -> Watcher {
        let sender = self.shutdown_tx.read().unwrap_or_else(|e| e.into_inner());
        let complete = self.complete_tx.read().unwrap_or_else(|e| e.into_inner());
        Watcher {
            shutdown: sender.is_none(),
            shutdown_rx: sender.as_ref().map(|tx| tx.subscribe()),
            _complete_tx: complete.clone(),
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier::new()
    }
}

/// Held by the accept loop and by every session task of a listener.
#[derive(Debug)]
pub struct Watcher {
    shutdown: bool,
    shutdown_rx: Option<broadcast::Receiver<()>>,
    _complete_tx: Option<mpsc::Sender<()>>,
}

impl Watcher {
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Wait for the drain signal; returns immediately once it was seen.
    pub async fn listen(&mut self) {
        if self.shutdown {
            return;
        }
        if let Some(rx) = self.shutdown_rx.as_mut() {
            // Only closure is ever observed here, a value is never sent.
            let _ = rx.recv().await;
        }
        self.shutdown = true;
    }
}
