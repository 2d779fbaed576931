mod admission;
mod bans;
mod booking;
mod catalog;
mod conflict;
mod error;
mod queries;
mod review;
mod store;
mod usage;
#[cfg(test)]
mod tests;

pub use admission::{resolve_admission, Admission};
pub use bans::BanExpiry;
pub use booking::{Created, NewReservation, Resubmission};
pub use conflict::{find_conflict, has_conflict};
pub use error::{ConflictKind, EngineError};
pub use queries::ReservationFilter;
pub use store::{SharedRoomState, Store};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::audit::{AuditEvent, AuditSink};
use crate::directory::{Capability, Directory};
use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Commit, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// All-or-nothing: a failed batch is rolled back off the log before the
/// callers hear about it, so nothing they were told failed can replay later.
fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    if let Err(e) = write_batch(wal, batch) {
        if let Err(rollback_err) = wal.rollback() {
            tracing::error!(error = %rollback_err, "wal rollback failed, refusing further writes");
        }
        return Err(e);
    }
    Ok(())
}

fn write_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    for (commit, _) in batch {
        wal.append_buffered(commit)?;
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(compact(wal));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Rebuild state from the file itself and rewrite it as one snapshot commit.
/// Runs on the writer task, so no append can interleave with the swap.
fn compact(wal: &mut Wal) -> io::Result<()> {
    let commits = Wal::replay(wal.path())?;
    let snapshot = Store::from_commits(&commits)
        .snapshot()
        .map_err(|e| io::Error::other(e.to_string()))?;
    Wal::write_compact_file(wal.path(), &snapshot)?;
    wal.swap_compact_file()
}

/// Trimmed free-text reason; blank becomes `None`.
pub(super) fn optional_reason(reason: Option<String>) -> Result<Option<String>, EngineError> {
    let reason = reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(reason)
}

/// What to write to the audit log once an operation has an outcome.
pub(super) struct AuditTarget {
    pub actor: Ulid,
    pub target_type: &'static str,
    pub target_id: Option<Ulid>,
    pub diff: Option<serde_json::Value>,
}

/// The reservation scheduling engine: owns the store, the WAL writer and the
/// collaborator handles. Cheap to share behind an `Arc`.
pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) audit: Arc<dyn AuditSink>,
    /// Serializes ban writes so supersede-then-insert is one step.
    pub(super) ban_write: Mutex<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must run inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        directory: Arc<dyn Directory>,
        audit: Arc<dyn AuditSink>,
    ) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let store = Store::from_commits(&commits);
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            store,
            wal_tx,
            directory,
            audit,
            ban_write: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Write a commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, commit: Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// WAL-append + apply for a room-scoped event. Caller holds the room's write lock.
    pub(super) async fn persist_room_event(
        &self,
        rs: &mut RoomState,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(vec![event.clone()]).await?;
        self.store.apply_to_room(rs, &event);
        Ok(())
    }

    /// WAL-append + apply for events outside any room timeline.
    pub(super) async fn persist(&self, commit: Commit) -> Result<(), EngineError> {
        self.wal_append(commit.clone()).await?;
        for event in &commit {
            self.store.apply(event);
        }
        Ok(())
    }

    pub(super) async fn require_capability(
        &self,
        actor: Ulid,
        capability: Capability,
    ) -> Result<(), EngineError> {
        if self.directory.has_capability(actor, capability).await {
            Ok(())
        } else {
            debug!(%actor, capability = capability.code(), "capability check failed");
            Err(EngineError::Forbidden(error::MISSING_CAPABILITY))
        }
    }

    /// Audit the outcome (best-effort), record metrics, and hand the result back.
    pub(super) fn conclude<T>(
        &self,
        action: &'static str,
        started: Instant,
        target: AuditTarget,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let event = AuditEvent {
            actor: target.actor,
            action,
            target_type: target.target_type,
            target_id: target.target_id,
            success: result.is_ok(),
            reason: result.as_ref().err().map(|e| e.to_string()),
            diff: target.diff,
        };
        if let Err(e) = self.audit.record(event) {
            warn!("audit write failed for {action}: {e}");
            metrics::counter!(observability::AUDIT_FAILURES_TOTAL).increment(1);
        }
        observability::record_operation(action, started, &result);
        result
    }

    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
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
