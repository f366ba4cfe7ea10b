use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::tx::ScheduleTx;
use super::{BookingError, Engine, SharedScheduleState};

/// Inputs for a booking whose caller, token, and patient were already checked.
#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub user_id: UserId,
    pub patient_id: PatientId,
    pub symptom: Option<String>,
}

/// Outcome of one missed-appointment sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissedSweep {
    pub schedules: usize,
    pub missed: usize,
    pub failed: usize,
}

/// Bookability checks that depend only on the schedule row.
pub(crate) fn check_bookable(schedule: &Schedule, today: NaiveDate) -> Result<(), BookingError> {
    if !schedule.enabled {
        return Err(BookingError::ScheduleDisabled(schedule.id));
    }
    if schedule.date < today {
        return Err(BookingError::ScheduleExpired(schedule.id));
    }
    Ok(())
}

impl Engine {
    /// Reserve a slot and insert a pending appointment as one transaction.
    ///
    /// Runs under the schedule's write lock: schedule checks, the duplicate
    /// pending check, the conditional reserve, slot numbering, and the insert
    /// either all commit in one WAL frame or none of them take effect.
    pub async fn book(&self, schedule_id: Ulid, req: NewAppointment) -> Result<Appointment, BookingError> {
        if req.symptom.as_ref().is_some_and(|s| s.chars().count() > MAX_SYMPTOM_LEN) {
            return Err(BookingError::InvalidInput("symptom description too long"));
        }
        let now = self.clock.now();

        let mut lock = self.lock_schedule(schedule_id).await?;
        check_bookable(&lock.guard.schedule, now.date())?;
        if let Some(existing) = lock.guard.pending_for_user(&req.user_id) {
            return Err(BookingError::DuplicatePendingAppointment(existing.id));
        }

        let mut tx = ScheduleTx::begin(&mut lock.guard);
        if !tx.reserve() {
            metrics::counter!(crate::observability::CAPACITY_EXHAUSTED_TOTAL).increment(1);
            return Err(BookingError::CapacityExhausted(schedule_id));
        }

        let schedule = &tx.state().schedule;
        let id = Ulid::new();
        let appointment = Appointment {
            id,
            appointment_no: self.claim_appointment_no(id, now)?,
            user_id: req.user_id,
            patient_id: req.patient_id,
            doctor_id: schedule.doctor_id,
            department_id: schedule.department_id,
            schedule_id,
            date: schedule.date,
            period: schedule.period,
            time: schedule.start_time,
            slot_number: tx.state().next_slot_number(),
            status: AppointmentStatus::Pending,
            symptom: req.symptom,
            cancel_reason: None,
            created_at: now,
            cancelled_at: None,
            checked_in_at: None,
            completed_at: None,
        };
        tx.record(Event::AppointmentCreated(appointment.clone()));

        if let Err(e) = self.commit(tx).await {
            // Still claimed only if the frame never reached the writer.
            if !self.appointment_index.contains_key(&appointment.id) {
                self.appointment_numbers.remove(&appointment.appointment_no);
            }
            return Err(e);
        }
        info!(
            "appointment {} booked on schedule {schedule_id} slot {} for user {}",
            appointment.id, appointment.slot_number, appointment.user_id
        );
        Ok(appointment)
    }

    /// `pending → cancelled`, returning the slot. Not allowed on the visit day.
    pub async fn cancel(&self, user_id: UserId, id: Ulid, reason: String) -> Result<Appointment, BookingError> {
        let reason_len = reason.chars().count();
        if !(MIN_CANCEL_REASON_LEN..=MAX_CANCEL_REASON_LEN).contains(&reason_len) {
            return Err(BookingError::InvalidInput("cancel reason must be 2 to 256 characters"));
        }
        let now = self.clock.now();

        let mut lock = self.lock_appointment(id).await?;
        let schedule_id = lock.guard.id();
        let current = owned_appointment(&lock.guard, user_id, id)?;
        expect_status(current, AppointmentStatus::Pending)?;
        if !current.can_cancel(now.date()) {
            return Err(BookingError::SameDayCancellation(id));
        }

        let mut tx = ScheduleTx::begin(&mut lock.guard);
        if !tx.record(Event::AppointmentCancelled { id, schedule_id, reason, at: now }) {
            return Err(BookingError::AppointmentNotFound(id));
        }
        tx.release();
        self.commit(tx).await?;
        info!("appointment {id} cancelled, slot returned to schedule {schedule_id}");
        appointment_snapshot(&lock.guard, id)
    }

    /// `pending → checked_in` inside the check-in window.
    pub async fn checkin(&self, user_id: UserId, id: Ulid) -> Result<Appointment, BookingError> {
        let now = self.clock.now();

        let mut lock = self.lock_appointment(id).await?;
        let schedule_id = lock.guard.id();
        let current = owned_appointment(&lock.guard, user_id, id)?;
        expect_status(current, AppointmentStatus::Pending)?;
        if !current.can_checkin(now, &self.checkin_window) {
            return Err(BookingError::OutsideCheckinWindow(id));
        }

        let mut tx = ScheduleTx::begin(&mut lock.guard);
        if !tx.record(Event::AppointmentCheckedIn { id, schedule_id, at: now }) {
            return Err(BookingError::AppointmentNotFound(id));
        }
        self.commit(tx).await?;
        info!("appointment {id} checked in");
        appointment_snapshot(&lock.guard, id)
    }

    /// Staff disposition: `checked_in → completed`.
    pub async fn complete(&self, id: Ulid) -> Result<Appointment, BookingError> {
        let now = self.clock.now();

        let mut lock = self.lock_appointment(id).await?;
        let schedule_id = lock.guard.id();
        let current = lock
            .guard
            .appointment(&id)
            .ok_or(BookingError::AppointmentNotFound(id))?;
        expect_status(current, AppointmentStatus::CheckedIn)?;

        let mut tx = ScheduleTx::begin(&mut lock.guard);
        if !tx.record(Event::AppointmentCompleted { id, schedule_id, at: now }) {
            return Err(BookingError::AppointmentNotFound(id));
        }
        self.commit(tx).await?;
        info!("appointment {id} completed");
        appointment_snapshot(&lock.guard, id)
    }

    /// Move every pending appointment dated `date` to missed. Slots are not
    /// returned. Each schedule commits separately; a failed schedule is
    /// counted and left for the next run.
    pub async fn mark_missed(&self, date: NaiveDate) -> MissedSweep {
        let mut report = MissedSweep::default();
        let rows: Vec<SharedScheduleState> = self.schedules.iter().map(|e| e.value().clone()).collect();

        for rs in rows {
            {
                let guard = rs.read().await;
                if guard.deleted || guard.schedule.date != date {
                    continue;
                }
            }
            let gate = self.begin_commit().await;
            let mut guard = rs.write().await;
            let schedule_id = guard.id();
            let pending: Vec<Ulid> = guard
                .appointments
                .iter()
                .filter(|a| a.status == AppointmentStatus::Pending)
                .map(|a| a.id)
                .collect();
            if pending.is_empty() {
                continue;
            }
            report.schedules += 1;

            let mut tx = ScheduleTx::begin(&mut guard);
            for id in &pending {
                tx.record(Event::AppointmentMissed { id: *id, schedule_id });
            }
            match self.commit(tx).await {
                Ok(events) => {
                    report.missed += events.len();
                    debug!("schedule {schedule_id}: {} appointments marked missed", events.len());
                }
                Err(e) => {
                    report.failed += pending.len();
                    warn!("missed sweep failed on schedule {schedule_id}: {e}");
                }
            }
            drop(guard);
            drop(gate);
        }

        metrics::counter!(crate::observability::MISSED_TOTAL).increment(report.missed as u64);
        report
    }
}

fn owned_appointment<'a>(rs: &'a ScheduleState, user_id: UserId, id: Ulid) -> Result<&'a Appointment, BookingError> {
    let a = rs.appointment(&id).ok_or(BookingError::AppointmentNotFound(id))?;
    if a.user_id != user_id {
        return Err(BookingError::AppointmentNotOwned(id));
    }
    Ok(a)
}

fn expect_status(a: &Appointment, expected: AppointmentStatus) -> Result<(), BookingError> {
    if a.status != expected {
        return Err(BookingError::InvalidStatus {
            id: a.id,
            expected,
            actual: a.status,
        });
    }
    Ok(())
}

fn appointment_snapshot(rs: &ScheduleState, id: Ulid) -> Result<Appointment, BookingError> {
    rs.appointment(&id)
        .cloned()
        .ok_or(BookingError::AppointmentNotFound(id))
}
