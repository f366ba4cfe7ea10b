use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::tx::ScheduleTx;
use super::{BookingError, Engine};

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub doctor_id: DoctorId,
    pub department_id: DepartmentId,
    pub date: NaiveDate,
    pub period: Period,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub total_slots: u32,
    pub enabled: bool,
}

/// Repeat a weekly pattern over a date range.
#[derive(Debug, Clone)]
pub struct BatchSchedules {
    pub doctor_id: DoctorId,
    pub department_id: DepartmentId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub periods: Vec<Period>,
    pub weekdays: Vec<Weekday>,
    pub morning: (NaiveTime, NaiveTime),
    pub afternoon: (NaiveTime, NaiveTime),
    pub total_slots: u32,
}

#[derive(Debug, Clone)]
pub struct ScheduleUpdate {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub total_slots: u32,
    pub enabled: bool,
}

fn validate_slots(total_slots: u32) -> Result<(), BookingError> {
    if total_slots == 0 || total_slots > MAX_TOTAL_SLOTS {
        return Err(BookingError::InvalidInput("total slots must be between 1 and 999"));
    }
    Ok(())
}

fn validate_times(start: NaiveTime, end: NaiveTime) -> Result<(), BookingError> {
    if start >= end {
        return Err(BookingError::InvalidInput("start time must be before end time"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_schedule(&self, req: NewSchedule) -> Result<Schedule, BookingError> {
        validate_slots(req.total_slots)?;
        validate_times(req.start_time, req.end_time)?;
        if req.date < self.clock.today() {
            return Err(BookingError::InvalidInput("schedule date cannot be in the past"));
        }

        let schedule = Schedule {
            id: Ulid::new(),
            doctor_id: req.doctor_id,
            department_id: req.department_id,
            date: req.date,
            period: req.period,
            start_time: req.start_time,
            end_time: req.end_time,
            total_slots: req.total_slots,
            available_slots: req.total_slots,
            enabled: req.enabled,
        };

        let _gate = self.begin_commit().await;
        let permit = self.wal_slot().await?;
        self.claim_slot(&schedule)?;
        let synced = Self::queue(permit, vec![Event::ScheduleCreated(schedule.clone())]);
        self.install(&schedule);
        Self::durable(synced).await?;
        info!("schedule {} created for doctor {} on {} {}", schedule.id, schedule.doctor_id, schedule.date, schedule.period);
        Ok(schedule)
    }

    /// Create every (weekday, period) in range that does not exist yet, as a
    /// single WAL frame. Returns the schedules created.
    pub async fn batch_create_schedules(&self, req: BatchSchedules) -> Result<Vec<Schedule>, BookingError> {
        validate_slots(req.total_slots)?;
        validate_times(req.morning.0, req.morning.1)?;
        validate_times(req.afternoon.0, req.afternoon.1)?;
        if req.start_date < self.clock.today() {
            return Err(BookingError::InvalidInput("start date cannot be in the past"));
        }
        if req.end_date < req.start_date {
            return Err(BookingError::InvalidInput("end date cannot be before start date"));
        }
        if (req.end_date - req.start_date).num_days() > MAX_BATCH_DAYS {
            return Err(BookingError::InvalidInput("date range cannot exceed 90 days"));
        }

        let _gate = self.begin_commit().await;
        let permit = self.wal_slot().await?;
        let mut created = Vec::new();
        for date in req.start_date.iter_days().take_while(|d| *d <= req.end_date) {
            if !req.weekdays.contains(&date.weekday()) {
                continue;
            }
            for &period in &req.periods {
                let (start_time, end_time) = match period {
                    Period::Morning => req.morning,
                    Period::Afternoon => req.afternoon,
                };
                let schedule = Schedule {
                    id: Ulid::new(),
                    doctor_id: req.doctor_id,
                    department_id: req.department_id,
                    date,
                    period,
                    start_time,
                    end_time,
                    total_slots: req.total_slots,
                    available_slots: req.total_slots,
                    enabled: true,
                };
                // Existing tuples are skipped, not reported.
                if self.claim_slot(&schedule).is_ok() {
                    created.push(schedule);
                }
            }
        }

        if created.is_empty() {
            return Err(BookingError::InvalidInput("no schedules to create"));
        }

        let synced = Self::queue(permit, created.iter().cloned().map(Event::ScheduleCreated).collect());
        for s in &created {
            self.install(s);
        }
        Self::durable(synced).await?;
        info!("batch created {} schedules for doctor {}", created.len(), req.doctor_id);
        Ok(created)
    }

    /// Change times, capacity, or the enabled flag. Capacity may not drop below
    /// the number already booked; the remaining count is recomputed from it.
    pub async fn update_schedule(&self, id: Ulid, update: ScheduleUpdate) -> Result<Schedule, BookingError> {
        validate_slots(update.total_slots)?;
        validate_times(update.start_time, update.end_time)?;

        let mut lock = self.lock_schedule(id).await?;
        let booked = lock.guard.schedule.booked_slots();
        if update.total_slots < booked {
            return Err(BookingError::CapacityBelowBooked {
                requested: update.total_slots,
                booked,
            });
        }

        let mut tx = ScheduleTx::begin(&mut lock.guard);
        tx.record(Event::ScheduleUpdated {
            id,
            start_time: update.start_time,
            end_time: update.end_time,
            total_slots: update.total_slots,
            available_slots: update.total_slots - booked,
            enabled: update.enabled,
        });
        self.commit(tx).await?;
        info!("schedule {id} updated: total {} enabled {}", update.total_slots, update.enabled);
        Ok(lock.guard.schedule.clone())
    }

    /// Soft delete. Refused once any appointment references the schedule.
    pub async fn delete_schedule(&self, id: Ulid) -> Result<(), BookingError> {
        let mut lock = self.lock_schedule(id).await?;
        if !lock.guard.appointments.is_empty() {
            return Err(BookingError::ScheduleHasAppointments(id));
        }
        let mut tx = ScheduleTx::begin(&mut lock.guard);
        tx.record(Event::ScheduleDeleted { id });
        self.commit(tx).await?;
        metrics::gauge!(crate::observability::SCHEDULES_ACTIVE).decrement(1.0);
        info!("schedule {id} deleted");
        Ok(())
    }

    /// Reserve the (doctor, date, period) key for `schedule`.
    fn claim_slot(&self, schedule: &Schedule) -> Result<(), BookingError> {
        match self
            .slot_index
            .entry((schedule.doctor_id, schedule.date, schedule.period))
        {
            Entry::Occupied(_) => Err(BookingError::ScheduleExists {
                doctor_id: schedule.doctor_id,
                date: schedule.date,
                period: schedule.period,
            }),
            Entry::Vacant(slot) => {
                slot.insert(schedule.id);
                Ok(())
            }
        }
    }

    fn install(&self, schedule: &Schedule) {
        self.schedules.insert(
            schedule.id,
            Arc::new(RwLock::new(ScheduleState::new(schedule.clone()))),
        );
        metrics::gauge!(crate::observability::SCHEDULES_ACTIVE).increment(1.0);
    }
}
