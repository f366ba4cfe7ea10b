use crate::model::*;

use super::apply_to_schedule;

/// Prior value of whatever a recorded event touched.
enum Undo {
    Available(u32),
    Schedule(Schedule),
    Appointment(Appointment),
    Inserted,
    Deleted(bool),
}

/// Transaction on one schedule row, run while the caller holds its write lock.
///
/// Every step is applied immediately so later steps see it, and remembered in
/// an undo log. Dropping the transaction without committing restores the row.
pub(crate) struct ScheduleTx<'a> {
    state: &'a mut ScheduleState,
    events: Vec<Event>,
    undo: Vec<Undo>,
    committed: bool,
}

impl<'a> ScheduleTx<'a> {
    pub(crate) fn begin(state: &'a mut ScheduleState) -> Self {
        Self {
            state,
            events: Vec::new(),
            undo: Vec::new(),
            committed: false,
        }
    }

    pub(crate) fn state(&self) -> &ScheduleState {
        &*self.state
    }

    pub(crate) fn events(&self) -> &[Event] {
        &self.events
    }

    /// Apply `event` if its predicate holds. Returns whether the row changed;
    /// an event that changed nothing is not recorded.
    pub(crate) fn record(&mut self, event: Event) -> bool {
        let undo = match &event {
            Event::SlotReserved { .. } | Event::SlotReleased { .. } => {
                Undo::Available(self.state.schedule.available_slots)
            }
            Event::ScheduleUpdated { .. } => Undo::Schedule(self.state.schedule.clone()),
            Event::ScheduleDeleted { .. } => Undo::Deleted(self.state.deleted),
            Event::AppointmentCreated(_) => Undo::Inserted,
            Event::AppointmentCancelled { id, .. }
            | Event::AppointmentCheckedIn { id, .. }
            | Event::AppointmentCompleted { id, .. }
            | Event::AppointmentMissed { id, .. } => match self.state.appointment(id) {
                Some(a) => Undo::Appointment(a.clone()),
                None => return false,
            },
            Event::ScheduleCreated(_) => return false,
        };
        if !apply_to_schedule(&mut *self.state, &event) {
            return false;
        }
        self.undo.push(undo);
        self.events.push(event);
        true
    }

    /// Conditional decrement of `available_slots`.
    pub(crate) fn reserve(&mut self) -> bool {
        let schedule_id = self.state.id();
        self.record(Event::SlotReserved { schedule_id })
    }

    /// Conditional increment of `available_slots`, bounded by `total_slots`.
    pub(crate) fn release(&mut self) -> bool {
        let schedule_id = self.state.id();
        self.record(Event::SlotReleased { schedule_id })
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }

    fn rollback(&mut self) {
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Available(n) => self.state.schedule.available_slots = n,
                Undo::Schedule(s) => self.state.schedule = s,
                Undo::Deleted(d) => self.state.deleted = d,
                Undo::Inserted => {
                    self.state.appointments.pop();
                }
                Undo::Appointment(prev) => {
                    if let Some(a) = self.state.appointment_mut(&prev.id) {
                        *a = prev;
                    }
                }
            }
        }
        self.events.clear();
    }
}

impl Drop for ScheduleTx<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.events.is_empty() {
            tracing::debug!("rolling back {} events on schedule {}", self.events.len(), self.state.id());
            self.rollback();
        }
    }
}
