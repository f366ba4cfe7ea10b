mod appointments;
mod error;
mod inventory;
mod queries;
mod schedules;
mod tx;

pub(crate) use appointments::check_bookable;
pub use appointments::{MissedSweep, NewAppointment};
pub use error::{BookingError, ErrorKind};
pub use schedules::{BatchSchedules, NewSchedule, ScheduleUpdate};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Frame, Wal};

use tx::ScheduleTx;

pub type SharedScheduleState = Arc<RwLock<ScheduleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        frame: Frame,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Frame>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued, then
/// syncs once for the whole batch. A failed flush sets `failed`: queued
/// frames are already applied in memory, so memory is now ahead of the log.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>, failed: Arc<AtomicBool>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { frame, response } => {
                let mut batch = vec![(frame, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { frame, response }) => batch.push((frame, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    if !failed.swap(true, Ordering::AcqRel) {
                        tracing::error!("WAL flush failed, refusing further writes until restart: {e}");
                    }
                }
                for (_, tx) in batch {
                    let r = match &result {
                        Ok(()) => Ok(()),
                        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                    };
                    let _ = tx.send(r);
                }

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Frame, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (frame, _) in batch {
        if let Err(e) = wal.append_buffered(frame) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so partial bytes don't bleed into the
    // next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Apply one event to a schedule row. Returns whether the row changed, which
/// is how conditional updates (reserve, release, status transitions) report
/// that their predicate held.
pub(crate) fn apply_to_schedule(rs: &mut ScheduleState, event: &Event) -> bool {
    match event {
        Event::SlotReserved { .. } => rs.reserve(),
        Event::SlotReleased { .. } => rs.release(),
        Event::AppointmentCreated(appointment) => {
            rs.appointments.push(appointment.clone());
            true
        }
        Event::AppointmentCancelled { id, reason, at, .. } => {
            transition(rs, id, AppointmentStatus::Pending, AppointmentStatus::Cancelled, |a| {
                a.cancel_reason = Some(reason.clone());
                a.cancelled_at = Some(*at);
            })
        }
        Event::AppointmentCheckedIn { id, at, .. } => {
            transition(rs, id, AppointmentStatus::Pending, AppointmentStatus::CheckedIn, |a| {
                a.checked_in_at = Some(*at);
            })
        }
        Event::AppointmentCompleted { id, at, .. } => {
            transition(rs, id, AppointmentStatus::CheckedIn, AppointmentStatus::Completed, |a| {
                a.completed_at = Some(*at);
            })
        }
        Event::AppointmentMissed { id, .. } => {
            transition(rs, id, AppointmentStatus::Pending, AppointmentStatus::Missed, |_| {})
        }
        Event::ScheduleUpdated {
            start_time,
            end_time,
            total_slots,
            available_slots,
            enabled,
            ..
        } => {
            if *available_slots > *total_slots {
                return false;
            }
            let s = &mut rs.schedule;
            s.start_time = *start_time;
            s.end_time = *end_time;
            s.total_slots = *total_slots;
            s.available_slots = *available_slots;
            s.enabled = *enabled;
            true
        }
        Event::ScheduleDeleted { .. } => {
            let changed = !rs.deleted;
            rs.deleted = true;
            changed
        }
        // Creation happens at the map level.
        Event::ScheduleCreated(_) => false,
    }
}

/// `UPDATE ... SET status = to WHERE id = ? AND status = from`.
fn transition(
    rs: &mut ScheduleState,
    id: &Ulid,
    from: AppointmentStatus,
    to: AppointmentStatus,
    stamp: impl FnOnce(&mut Appointment),
) -> bool {
    match rs.appointment_mut(id) {
        Some(a) if a.status == from => {
            a.status = to;
            stamp(a);
            true
        }
        _ => false,
    }
}

/// Write access to one schedule row. Holds the commit gate shared so that a
/// compaction never snapshots a half-applied transaction.
pub(crate) struct ScheduleLock {
    _gate: OwnedRwLockReadGuard<()>,
    pub(crate) guard: OwnedRwLockWriteGuard<ScheduleState>,
}

pub struct Engine {
    pub(super) schedules: DashMap<Ulid, SharedScheduleState>,
    /// Live schedule per (doctor, date, period).
    pub(super) slot_index: DashMap<(DoctorId, NaiveDate, Period), Ulid>,
    /// Reverse lookup: appointment id → schedule id.
    pub(super) appointment_index: DashMap<Ulid, Ulid>,
    pub(super) user_index: DashMap<UserId, Vec<Ulid>>,
    /// Appointment number → appointment id. Also used to claim numbers before commit.
    pub(super) appointment_numbers: DashMap<String, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    wal_failed: Arc<AtomicBool>,
    commit_gate: Arc<RwLock<()>>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) checkin_window: CheckinWindow,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let frames = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        let wal_failed = Arc::new(AtomicBool::new(false));
        tokio::spawn(wal_writer_loop(wal, wal_rx, wal_failed.clone()));

        let engine = Self {
            schedules: DashMap::new(),
            slot_index: DashMap::new(),
            appointment_index: DashMap::new(),
            user_index: DashMap::new(),
            appointment_numbers: DashMap::new(),
            wal_tx,
            wal_failed,
            commit_gate: Arc::new(RwLock::new(())),
            notify,
            clock,
            checkin_window: CheckinWindow::default(),
        };

        let mut replayed = 0usize;
        let mut skipped = 0usize;
        for frame in &frames {
            if engine.replay_frame(frame)? {
                replayed += frame.len();
            } else {
                skipped += 1;
            }
        }
        if replayed > 0 {
            tracing::info!("replayed {replayed} events from {}", wal_path.display());
        }
        if skipped > 0 {
            tracing::warn!("skipped {skipped} WAL frames that did not apply");
        }
        metrics::gauge!(crate::observability::SCHEDULES_ACTIVE).set(engine.slot_index.len() as f64);

        Ok(engine)
    }

    /// Apply one logged frame at startup. Schedule creations install rows;
    /// the remaining events go through a transaction on their row and are
    /// kept only if every one of them applies.
    fn replay_frame(&self, frame: &[Event]) -> io::Result<bool> {
        let (created, rest): (Vec<&Event>, Vec<&Event>) =
            frame.iter().partition(|e| matches!(e, Event::ScheduleCreated(_)));
        for event in created {
            if let Event::ScheduleCreated(schedule) = event {
                self.schedules
                    .insert(schedule.id, Arc::new(RwLock::new(ScheduleState::new(schedule.clone()))));
                self.index_event(event);
            }
        }

        let Some(first) = rest.first() else {
            return Ok(true);
        };
        let schedule_id = first.schedule_id();
        if rest.iter().any(|e| e.schedule_id() != schedule_id) {
            return Ok(false);
        }
        let Some(rs) = self.get_state(&schedule_id) else {
            return Ok(false);
        };
        // Sole owner of every Arc here, so try_write never contends. Never use
        // blocking_write: this runs inside the runtime.
        let mut guard = rs.try_write().map_err(io::Error::other)?;
        let mut tx = ScheduleTx::begin(&mut guard);
        for event in &rest {
            if !tx.record((*event).clone()) {
                tracing::warn!("dropping WAL frame on schedule {schedule_id}: {event:?} no longer applies");
                return Ok(false);
            }
        }
        tx.mark_committed();
        drop(tx);
        for event in rest {
            self.index_event(event);
        }
        Ok(true)
    }

    pub fn with_checkin_window(mut self, window: CheckinWindow) -> Self {
        self.checkin_window = window;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn checkin_window(&self) -> &CheckinWindow {
        &self.checkin_window
    }

    fn ensure_writable(&self) -> Result<(), BookingError> {
        if self.wal_failed.load(Ordering::Acquire) {
            return Err(BookingError::WalError("log is read-only after a failed write".into()));
        }
        Ok(())
    }

    /// Wait for room in the writer's queue. Nothing is queued yet, so a
    /// caller dropped here leaves no trace.
    pub(super) async fn wal_slot(&self) -> Result<mpsc::Permit<'_, WalCommand>, BookingError> {
        self.ensure_writable()?;
        self.wal_tx
            .reserve()
            .await
            .map_err(|_| BookingError::WalError("WAL writer shut down".into()))
    }

    /// Hand a frame to the writer. From here on the frame reaches the log
    /// whether or not the caller keeps polling, so memory must keep it too.
    pub(super) fn queue(permit: mpsc::Permit<'_, WalCommand>, frame: Frame) -> oneshot::Receiver<io::Result<()>> {
        let (tx, rx) = oneshot::channel();
        permit.send(WalCommand::Append { frame, response: tx });
        rx
    }

    /// Wait until a queued frame is synced.
    pub(super) async fn durable(rx: oneshot::Receiver<io::Result<()>>) -> Result<(), BookingError> {
        rx.await
            .map_err(|_| BookingError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::WalError(e.to_string()))
    }

    pub(super) fn get_state(&self, id: &Ulid) -> Option<SharedScheduleState> {
        self.schedules.get(id).map(|e| e.value().clone())
    }

    pub(super) async fn begin_commit(&self) -> OwnedRwLockReadGuard<()> {
        self.commit_gate.clone().read_owned().await
    }

    /// Lock a live (not deleted) schedule row for writing.
    pub(crate) async fn lock_schedule(&self, id: Ulid) -> Result<ScheduleLock, BookingError> {
        let rs = self.get_state(&id).ok_or(BookingError::ScheduleNotFound(id))?;
        let gate = self.begin_commit().await;
        let guard = rs.write_owned().await;
        if guard.deleted {
            return Err(BookingError::ScheduleNotFound(id));
        }
        Ok(ScheduleLock { _gate: gate, guard })
    }

    /// Resolve appointment → schedule and lock that schedule for writing.
    pub(crate) async fn lock_appointment(&self, id: Ulid) -> Result<ScheduleLock, BookingError> {
        let schedule_id = self
            .appointment_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(BookingError::AppointmentNotFound(id))?;
        self.lock_schedule(schedule_id)
            .await
            .map_err(|_| BookingError::AppointmentNotFound(id))
    }

    /// Write a transaction as one WAL frame and wait for it to sync.
    ///
    /// If the frame cannot be queued the transaction drops uncommitted and
    /// rolls itself back. Once queued it is kept, indexed and published
    /// before the wait, so a caller dropped mid-commit leaves memory matching
    /// the log. A failed sync after that point makes the engine read-only.
    pub(crate) async fn commit(&self, mut tx: ScheduleTx<'_>) -> Result<Vec<Event>, BookingError> {
        let events = tx.events().to_vec();
        if events.is_empty() {
            tx.mark_committed();
            return Ok(events);
        }
        let permit = self.wal_slot().await?;
        let synced = Self::queue(permit, events.clone());
        tx.mark_committed();
        let schedule_id = tx.state().id();
        let available = tx.state().schedule.available_slots;
        drop(tx);
        for event in &events {
            self.index_event(event);
        }
        self.notify.send(schedule_id, &events, available);
        Self::durable(synced).await?;
        Ok(events)
    }

    /// Maintain secondary indexes once an event is queued for the log.
    fn index_event(&self, event: &Event) {
        match event {
            Event::ScheduleCreated(s) => {
                self.slot_index.insert((s.doctor_id, s.date, s.period), s.id);
            }
            Event::ScheduleDeleted { id } => {
                self.slot_index.retain(|_, v| *v != *id);
            }
            Event::AppointmentCreated(a) => {
                self.appointment_index.insert(a.id, a.schedule_id);
                self.appointment_numbers.insert(a.appointment_no.clone(), a.id);
                self.user_index.entry(a.user_id).or_default().push(a.id);
            }
            _ => {}
        }
    }

    /// Claim a unique appointment number: `YYYYMMDDHHMMSS` + random digits.
    pub(super) fn claim_appointment_no(&self, id: Ulid, now: NaiveDateTime) -> Result<String, BookingError> {
        use rand::Rng;
        let bound = 10u32.pow(APPOINTMENT_NO_SUFFIX_DIGITS);
        let width = APPOINTMENT_NO_SUFFIX_DIGITS as usize;
        let mut rng = rand::thread_rng();
        for _ in 0..APPOINTMENT_NO_ATTEMPTS {
            let suffix: u32 = rng.gen_range(0..bound);
            let no = format!("{}{suffix:0width$}", now.format("%Y%m%d%H%M%S"));
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.appointment_numbers.entry(no.clone()) {
                slot.insert(id);
                return Ok(no);
            }
        }
        Err(BookingError::InvalidInput("could not allocate an appointment number"))
    }

    /// Rewrite the WAL as one frame per live schedule.
    pub async fn compact_wal(&self) -> Result<(), BookingError> {
        // Exclusive gate: no transaction is between mutation and commit.
        let _gate = self.commit_gate.write().await;
        self.ensure_writable()?;

        let rows: Vec<SharedScheduleState> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut snapshot = Vec::with_capacity(rows.len());
        for rs in rows {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            let mut frame = Vec::with_capacity(guard.appointments.len() + 1);
            frame.push(Event::ScheduleCreated(guard.schedule.clone()));
            frame.extend(guard.appointments.iter().cloned().map(Event::AppointmentCreated));
            snapshot.push(frame);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| BookingError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::WalError(e.to_string()))
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
