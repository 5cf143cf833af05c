//! Bounded spooling of activity rows into the database.
//!
//! Protocol handlers must never stall on the activity log: records go into a
//! bounded queue drained by a single writer task. When the queue is full or
//! the database is unreachable the record is dropped and the drop itself is
//! logged, together with a running count.

use super::Store;
use slog::Logger;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const QUEUE_DEPTH: usize = 512;

#[derive(Debug)]
struct Entry {
    listener_id: Option<i64>,
    username: String,
    action: String,
    path: String,
    success: bool,
}

/// Write side of the activity queue. Cheap to clone.
#[derive(Clone)]
pub struct ActivitySpool {
    tx: mpsc::Sender<Entry>,
    dropped: Arc<AtomicU64>,
    logger: Logger,
}

impl ActivitySpool {
    /// Spawn the writer task and return the spool handle. Must be called
    /// from within a Tokio runtime.
    pub fn new(store: Store, logger: Logger) -> ActivitySpool {
        let (tx, mut rx) = mpsc::channel::<Entry>(QUEUE_DEPTH);
        let writer_logger = logger.clone();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let result = store
                    .log_activity(entry.listener_id, &entry.username, &entry.action, &entry.path, entry.success)
                    .await;
                if let Err(err) = result {
                    slog::warn!(writer_logger, "dropping activity record, store unreachable";
                        "action" => %entry.action, "error" => %err);
                }
            }
        });
        ActivitySpool {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            logger,
        }
    }

    /// Queue one record. Never blocks; on overflow the record is dropped
    /// and the drop is logged.
    pub fn enqueue(&self, listener_id: Option<i64>, username: &str, action: &str, path: &str, success: bool) {
        let entry = Entry {
            listener_id,
            username: username.to_string(),
            action: action.to_string(),
            path: path.to_string(),
            success,
        };
        if self.tx.try_send(entry).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            slog::warn!(self.logger, "activity queue full, dropping record"; "dropped_total" => total);
        }
    }

    /// How many records have been dropped since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
