use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::sync::KeyedMutex;
use crate::wal::Wal;

use super::{InMemoryStore, ReservationStore, StoreError};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: Reservation,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Reservation>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                        Ok(other) => {
                            // Flush what we have before handling anything else.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// Write and fsync a batch as a unit. On any failure the log is rolled back
/// to its length before the batch, so a commit reported as failed never
/// reappears on replay.
fn flush_batch(wal: &mut Wal, batch: &[(Reservation, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let written = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = written {
        warn!("log write failed for a batch of {}: {e}", batch.len());
        if let Err(rollback) = wal.rollback() {
            error!("log rollback failed, refusing further writes: {rollback}");
        }
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<(Reservation, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

fn writer_gone() -> StoreError {
    StoreError::Unavailable("WAL writer shut down".into())
}

/// Durable store: an append-only log of reservation snapshots with an
/// in-memory materialized view for reads.
///
/// A record is visible to readers only after its batch is fsynced.
pub struct WalStore {
    path: PathBuf,
    view: InMemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Per-reservation serialization of version check + append + apply.
    writes: KeyedMutex<Ulid>,
    /// Commits share it; compaction takes it exclusively so the snapshot
    /// never misses a record that is fsynced but not yet applied.
    compaction_gate: RwLock<()>,
}

impl WalStore {
    /// Replay the log at `path`, cut off any torn tail, and start the
    /// group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, records) = Wal::recover(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let view = InMemoryStore::new();
        let replayed = records.len();
        for record in records {
            view.put(record);
        }
        info!("replayed {replayed} log entries ({} reservations) from {}", view.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            view,
            wal_tx,
            writes: KeyedMutex::new(),
            compaction_gate: RwLock::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn wal_append(&self, record: Reservation) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { record, response: tx })
            .await
            .map_err(|_| writer_gone())?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Rewrite the log with only the latest snapshot of each reservation.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;
        let records = self.view.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| writer_gone())?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl ReservationStore for WalStore {
    async fn load(&self, kind: ResourceKind, resource_id: ResourceId, day: NaiveDate) -> Result<Vec<Reservation>, StoreError> {
        self.view.load(kind, resource_id, day).await
    }

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        self.view.get(id).await
    }

    async fn commit(&self, reservation: &Reservation, expected_version: Option<u64>) -> Result<u64, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let _write = self.writes.lock(reservation.id).await;

        let version = self.view.next_version(&reservation.id, expected_version)?;
        let record = Reservation {
            version,
            ..reservation.clone()
        };
        self.wal_append(record.clone()).await?;
        self.view.put(record);
        Ok(version)
    }

    async fn approved_ended_by(&self, now: NaiveDateTime) -> Result<Vec<Ulid>, StoreError> {
        self.view.approved_ended_by(now).await
    }
}
