mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::{EngineError, ErrorClass};
pub use mutations::{ConfirmRequest, HoldRequest, SweepReport};
pub use queries::{HoldConflict, OutboxStats};

pub use conflict::now_ms;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use fs2::FileExt;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::graph::TableGraph;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTableState = Arc<RwLock<TableState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    /// Stop the writer as if the disk had gone away.
    #[cfg(test)]
    Halt,
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

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(cmd) = deferred {
                    if !handle_non_append(&mut wal, cmd) {
                        break;
                    }
                }
            }
            other => {
                if !handle_non_append(&mut wal, other) {
                    break;
                }
            }
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Commit, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns false when the writer should stop.
fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            let result = wal.append_buffered(&commit).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
        #[cfg(test)]
        WalCommand::Halt => return false,
    }
    true
}

/// Write guards on a set of tables, always taken in ascending id order.
pub(crate) struct TableLocks {
    guards: Vec<OwnedRwLockWriteGuard<TableState>>,
}

impl TableLocks {
    pub(super) fn none() -> Self {
        Self { guards: Vec::new() }
    }

    /// Replay only: every lock is uncontended, tables missing from the layout are skipped.
    fn try_acquire(tables: &HashMap<Ulid, SharedTableState>, table_ids: &[Ulid]) -> Self {
        let guards = table_ids
            .iter()
            .filter_map(|id| tables.get(id))
            .filter_map(|ts| ts.clone().try_write_owned().ok())
            .collect();
        Self { guards }
    }

    pub(super) fn get_mut(&mut self, table_id: &Ulid) -> Option<&mut TableState> {
        let idx = self
            .guards
            .binary_search_by_key(table_id, |g| g.table_id)
            .ok()?;
        Some(&mut self.guards[idx])
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &TableState> {
        self.guards.iter().map(|g| &**g)
    }
}

/// Capacity store for one restaurant.
///
/// Tables carry the occupancy timelines and are the unit of locking: any
/// write touching a table holds that table's write lock from validation to
/// apply. Bookings are serialized per booking id. All state changes go
/// through `persist_and_apply`, which writes one WAL commit and then applies it.
pub struct Engine {
    pub restaurant_id: Ulid,
    pub graph: Arc<TableGraph>,
    pub notify: Arc<NotifyHub>,
    pub(super) tables: HashMap<Ulid, SharedTableState>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) booking_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    pub(super) holds: DashMap<Ulid, Hold>,
    pub(super) assignments: DashMap<Ulid, Assignment>,
    /// booking id → assignment ids
    pub(super) booking_assignments: DashMap<Ulid, Vec<Ulid>>,
    pub(super) outbox: DashMap<Ulid, OutboxEvent>,
    pub(super) outbox_keys: DashMap<String, Ulid>,
    pub(super) outbox_claim: Mutex<()>,
    /// Shared by every commit, exclusive for compaction snapshots.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Exclusive lock on `<wal>.lock`, released when the engine drops.
    _wal_lock: File,
}

impl Engine {
    pub fn new(
        restaurant_id: Ulid,
        wal_path: PathBuf,
        graph: Arc<TableGraph>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let wal_lock = lock_wal(&wal_path)?;
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let tables = graph
            .table_ids()
            .map(|id| (id, Arc::new(RwLock::new(TableState::new(id)))))
            .collect();

        let engine = Self {
            restaurant_id,
            graph,
            notify,
            tables,
            bookings: DashMap::new(),
            booking_locks: DashMap::new(),
            holds: DashMap::new(),
            assignments: DashMap::new(),
            booking_assignments: DashMap::new(),
            outbox: DashMap::new(),
            outbox_keys: DashMap::new(),
            outbox_claim: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
            _wal_lock: wal_lock,
        };

        for commit in &commits {
            let table_ids = engine.commit_table_ids(commit);
            let mut locks = TableLocks::try_acquire(&engine.tables, &table_ids);
            for event in &commit.events {
                engine.apply_event(event, &mut locks);
            }
        }

        // Claims interrupted by a restart go back to the queue.
        for mut entry in engine.outbox.iter_mut() {
            if entry.status == OutboxStatus::Processing {
                entry.status = OutboxStatus::Pending;
            }
        }

        Ok(engine)
    }

    /// Write a commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, commit: &Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify as one step. The caller holds the write
    /// locks of every table the events touch.
    pub(super) async fn persist_and_apply(
        &self,
        events: Vec<Event>,
        locks: &mut TableLocks,
    ) -> Result<(), EngineError> {
        let commit = Commit::new(now_ms(), events);
        let _gate = self.commit_gate.read().await;
        if let Err(e) = self.wal_append(&commit).await {
            self.release_outbox_keys(&commit);
            return Err(e);
        }
        for event in &commit.events {
            self.apply_event(event, locks);
        }
        drop(_gate);
        for event in &commit.events {
            self.notify.send(self.restaurant_id, event);
            if let Some(booking_id) = event_booking_id(event) {
                self.notify.send(booking_id, event);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn halt_wal_writer(&self) {
        if self.wal_tx.send(WalCommand::Halt).await.is_ok() {
            self.wal_tx.closed().await;
        }
    }

    /// Give back dedupe keys reserved by a commit that never made it to disk.
    fn release_outbox_keys(&self, commit: &Commit) {
        for event in &commit.events {
            if let Event::OutboxEnqueued(row) = event {
                if let Some(key) = &row.dedupe_key {
                    self.outbox_keys.remove_if(key, |_, id| *id == row.id);
                }
            }
        }
    }

    /// Lock `table_ids` (sorted, deduplicated) in ascending order.
    pub(crate) async fn lock_tables(&self, table_ids: &[Ulid]) -> Result<TableLocks, EngineError> {
        debug_assert!(table_ids.windows(2).all(|w| w[0] < w[1]), "table ids must be sorted");
        let mut guards = Vec::with_capacity(table_ids.len());
        for id in table_ids {
            let ts = self
                .tables
                .get(id)
                .ok_or(EngineError::UnknownTable(*id))?
                .clone();
            guards.push(ts.write_owned().await);
        }
        Ok(TableLocks { guards })
    }

    /// Serialize read-validate-write on one booking.
    pub(super) async fn lock_booking(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, EngineError> {
        if !self.bookings.contains_key(booking_id) {
            return Err(EngineError::BookingNotFound(*booking_id));
        }
        let lock = self.booking_locks.entry(*booking_id).or_default().clone();
        Ok(lock.lock_owned().await)
    }

    /// Tables touched by a commit, resolved against the current indexes.
    fn commit_table_ids(&self, commit: &Commit) -> Vec<Ulid> {
        let mut ids = Vec::new();
        for event in &commit.events {
            match event {
                Event::HoldPlaced(h) => ids.extend_from_slice(&h.table_ids),
                Event::AssignmentCreated(a) => ids.extend_from_slice(&a.table_ids),
                Event::HoldReleased { id } => {
                    if let Some(h) = self.holds.get(id) {
                        ids.extend_from_slice(&h.table_ids);
                    }
                }
                Event::AssignmentRemoved { id } => {
                    if let Some(a) = self.assignments.get(id) {
                        ids.extend_from_slice(&a.table_ids);
                    }
                }
                _ => {}
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }

    fn apply_event(&self, event: &Event, locks: &mut TableLocks) {
        match event {
            Event::BookingCreated(booking) => {
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingUpdated {
                id,
                status,
                assigned_zone,
                version,
            } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.status = *status;
                    booking.assigned_zone = *assigned_zone;
                    booking.version = *version;
                }
            }
            Event::HoldPlaced(hold) => {
                for table_id in &hold.table_ids {
                    if let Some(ts) = locks.get_mut(table_id) {
                        ts.insert_interval(Interval {
                            id: hold.id,
                            span: hold.span,
                            kind: IntervalKind::Hold {
                                expires_at: hold.expires_at,
                            },
                        });
                    }
                }
                self.holds.insert(hold.id, hold.clone());
            }
            Event::HoldReleased { id } => {
                if let Some((_, hold)) = self.holds.remove(id) {
                    for table_id in &hold.table_ids {
                        if let Some(ts) = locks.get_mut(table_id) {
                            ts.remove_interval(*id);
                        }
                    }
                }
            }
            Event::AssignmentCreated(assignment) => {
                for table_id in &assignment.table_ids {
                    if let Some(ts) = locks.get_mut(table_id) {
                        ts.insert_interval(Interval {
                            id: assignment.id,
                            span: assignment.span,
                            kind: IntervalKind::Assignment {
                                booking_id: assignment.booking_id,
                            },
                        });
                    }
                }
                self.booking_assignments
                    .entry(assignment.booking_id)
                    .or_default()
                    .push(assignment.id);
                self.assignments.insert(assignment.id, assignment.clone());
            }
            Event::AssignmentRemoved { id } => {
                if let Some((_, assignment)) = self.assignments.remove(id) {
                    for table_id in &assignment.table_ids {
                        if let Some(ts) = locks.get_mut(table_id) {
                            ts.remove_interval(*id);
                        }
                    }
                    if let Some(mut ids) = self.booking_assignments.get_mut(&assignment.booking_id) {
                        ids.retain(|a| a != id);
                    }
                    self.booking_assignments
                        .remove_if(&assignment.booking_id, |_, ids| ids.is_empty());
                }
            }
            Event::OutboxEnqueued(outbox_event) => {
                if let Some(key) = &outbox_event.dedupe_key {
                    self.outbox_keys.insert(key.clone(), outbox_event.id);
                }
                self.outbox.insert(outbox_event.id, outbox_event.clone());
            }
            Event::OutboxUpdated {
                id,
                status,
                attempt_count,
                next_attempt_at,
                last_error,
            } => {
                if let Some(mut entry) = self.outbox.get_mut(id) {
                    entry.status = *status;
                    entry.attempt_count = *attempt_count;
                    entry.next_attempt_at = *next_attempt_at;
                    entry.last_error = last_error.clone();
                }
            }
            Event::OutboxKeyRetained { key, id } => {
                self.outbox_keys.insert(key.clone(), *id);
            }
        }
    }
}

/// Claim exclusive ownership of a WAL. A second engine on the same file, in
/// this process or another, would append from its own in-memory state.
fn lock_wal(wal_path: &Path) -> io::Result<File> {
    let mut lock_path = wal_path.as_os_str().to_owned();
    lock_path.push(".lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    file.try_lock_exclusive().map_err(|e| {
        io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("{} is in use by another engine: {e}", wal_path.display()),
        )
    })?;
    Ok(file)
}

/// Booking an event concerns, if any.
fn event_booking_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated(b) => Some(b.id),
        Event::BookingUpdated { id, .. } => Some(*id),
        Event::HoldPlaced(h) => h.booking_id,
        Event::AssignmentCreated(a) => Some(a.booking_id),
        Event::OutboxEnqueued(e) => e.booking_id,
        Event::HoldReleased { .. }
        | Event::AssignmentRemoved { .. }
        | Event::OutboxUpdated { .. }
        | Event::OutboxKeyRetained { .. } => None,
    }
}
