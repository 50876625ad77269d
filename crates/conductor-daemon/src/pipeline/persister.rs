//! Background writer that batches log entries into the log store.
//!
//! Writes happen when `batch_size` entries are queued or `interval` elapses,
//! whichever comes first. A failed write is logged and the batch dropped;
//! callers enqueueing entries never wait on storage.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::models::LogEntry;
use crate::ports::LogStore;

enum PersistCommand {
    Append(LogEntry),
    /// Write everything queued so far, then acknowledge.
    Flush(oneshot::Sender<()>),
}

pub struct LogPersister {
    tx: mpsc::UnboundedSender<PersistCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogPersister {
    /// Start the writer task.
    pub fn spawn(store: Arc<dyn LogStore>, batch_size: usize, interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_persister(store, rx, batch_size.max(1), interval));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue one entry. Never blocks.
    pub fn enqueue(&self, entry: LogEntry) {
        if self.tx.send(PersistCommand::Append(entry)).is_err() {
            warn!("Log persister is gone, entry not persisted");
        }
    }

    /// Wait until every entry queued before this call has been written (or
    /// dropped after a failed write).
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Flush and stop the writer task.
    pub async fn shutdown(&self) {
        self.flush().await;
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

async fn run_persister(
    store: Arc<dyn LogStore>,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
    batch_size: usize,
    interval: Duration,
) {
    let mut pending: Vec<LogEntry> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(PersistCommand::Append(entry)) => {
                    pending.push(entry);
                    if pending.len() >= batch_size {
                        write_batch(store.as_ref(), &mut pending).await;
                    }
                }
                Some(PersistCommand::Flush(ack)) => {
                    write_batch(store.as_ref(), &mut pending).await;
                    let _ = ack.send(());
                }
                None => {
                    write_batch(store.as_ref(), &mut pending).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                write_batch(store.as_ref(), &mut pending).await;
            }
        }
    }
    debug!("Log persister stopped");
}

async fn write_batch(store: &dyn LogStore, pending: &mut Vec<LogEntry>) {
    if pending.is_empty() {
        return;
    }
    match store.append_logs(pending).await {
        Ok(()) => debug!(count = pending.len(), "Persisted log batch"),
        Err(e) => warn!(
            count = pending.len(),
            error = %e,
            "Failed to persist log batch, entries dropped"
        ),
    }
    pending.clear();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use conductor_core::db::DatabaseError;

    use super::*;
    use crate::models::MessageType;

    #[derive(Default)]
    struct RecordingStore {
        batches: std::sync::Mutex<Vec<Vec<LogEntry>>>,
        fail: AtomicBool,
    }

    impl RecordingStore {
        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl LogStore for RecordingStore {
        async fn append_logs(&self, entries: &[LogEntry]) -> Result<(), DatabaseError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DatabaseError::Query("disk full".to_string()));
            }
            self.batches.lock().unwrap().push(entries.to_vec());
            Ok(())
        }

        async fn list_logs(
            &self,
            _session_id: &str,
            _offset: u32,
            _limit: u32,
        ) -> Result<Vec<LogEntry>, DatabaseError> {
            Ok(Vec::new())
        }

        async fn count_logs(&self, _session_id: &str) -> Result<u64, DatabaseError> {
            Ok(0)
        }
    }

    fn entry(sequence: i64) -> LogEntry {
        LogEntry {
            session_id: "s".to_string(),
            sequence,
            message_type: MessageType::Raw,
            content: format!("line {sequence}"),
            timestamp: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writes_full_batches_by_count() {
        let store = Arc::new(RecordingStore::default());
        let persister = LogPersister::spawn(store.clone(), 3, Duration::from_secs(3600));
        for i in 1..=7 {
            persister.enqueue(entry(i));
        }
        persister.flush().await;
        assert_eq!(store.batch_sizes(), vec![3, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_partial_batch_when_interval_elapses() {
        let store = Arc::new(RecordingStore::default());
        let persister = LogPersister::spawn(store.clone(), 100, Duration::from_millis(500));
        persister.enqueue(entry(1));
        persister.enqueue(entry(2));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.batch_sizes(), vec![2]);
        drop(persister);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_is_dropped_and_later_writes_continue() {
        let store = Arc::new(RecordingStore::default());
        let persister = LogPersister::spawn(store.clone(), 10, Duration::from_secs(3600));
        store.fail.store(true, Ordering::SeqCst);
        persister.enqueue(entry(1));
        persister.flush().await;
        store.fail.store(false, Ordering::SeqCst);
        persister.enqueue(entry(2));
        persister.shutdown().await;
        let batches = store.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].sequence, 2);
    }
}
