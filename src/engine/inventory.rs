//! Slot inventory. `available_slots` only moves through the two conditional
//! updates below, each of which reports whether it affected the row; callers
//! never read the count and write it back.

use ulid::Ulid;

use crate::model::ScheduleState;

use super::tx::ScheduleTx;
use super::{BookingError, Engine};

impl ScheduleState {
    /// Decrement `available_slots` if it is positive.
    pub fn reserve(&mut self) -> bool {
        match self.schedule.available_slots.checked_sub(1) {
            Some(left) => {
                self.schedule.available_slots = left;
                true
            }
            None => false,
        }
    }

    /// Increment `available_slots` if that keeps it within `total_slots`.
    /// Safe to call when nothing was reserved.
    pub fn release(&mut self) -> bool {
        if self.schedule.available_slots < self.schedule.total_slots {
            self.schedule.available_slots += 1;
            true
        } else {
            false
        }
    }

    /// `max(slot_number) + 1` over every appointment ever booked here.
    /// Display ordering only.
    pub fn next_slot_number(&self) -> u32 {
        self.appointments
            .iter()
            .map(|a| a.slot_number)
            .max()
            .unwrap_or(0)
            + 1
    }
}

impl Engine {
    /// Conditional decrement of one schedule's remaining capacity, committed
    /// on its own. Fails with `CapacityExhausted` at zero. Returns the
    /// remaining count.
    pub async fn reserve(&self, schedule_id: Ulid) -> Result<u32, BookingError> {
        let mut lock = self.lock_schedule(schedule_id).await?;
        let mut tx = ScheduleTx::begin(&mut lock.guard);
        if !tx.reserve() {
            metrics::counter!(crate::observability::CAPACITY_EXHAUSTED_TOTAL).increment(1);
            return Err(BookingError::CapacityExhausted(schedule_id));
        }
        self.commit(tx).await?;
        Ok(lock.guard.schedule.available_slots)
    }

    /// Return one unit of capacity. `Ok(false)` when already at capacity.
    pub async fn release(&self, schedule_id: Ulid) -> Result<bool, BookingError> {
        let mut lock = self.lock_schedule(schedule_id).await?;
        let mut tx = ScheduleTx::begin(&mut lock.guard);
        let released = tx.release();
        self.commit(tx).await?;
        Ok(released)
    }

    pub async fn next_slot_number(&self, schedule_id: Ulid) -> Result<u32, BookingError> {
        let rs = self
            .get_state(&schedule_id)
            .ok_or(BookingError::ScheduleNotFound(schedule_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(BookingError::ScheduleNotFound(schedule_id));
        }
        Ok(guard.next_slot_number())
    }
}
