use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, SharedScheduleState};

impl Engine {
    /// Snapshot every live schedule row matching `keep`.
    async fn collect_schedules(&self, keep: impl Fn(&Schedule) -> bool) -> Vec<Schedule> {
        let rows: Vec<SharedScheduleState> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in rows {
            let guard = rs.read().await;
            if !guard.deleted && keep(&guard.schedule) {
                out.push(guard.schedule.clone());
            }
        }
        out.sort_by_key(|s| (s.date, s.period, s.start_time));
        out
    }

    pub async fn get_schedule(&self, id: Ulid) -> Option<ScheduleInfo> {
        let rs = self.get_state(&id)?;
        let guard = rs.read().await;
        if guard.deleted {
            return None;
        }
        Some(ScheduleInfo::from(&guard.schedule))
    }

    /// Enabled schedules for one doctor in `[from, to]`.
    pub async fn list_doctor_schedules(&self, doctor_id: DoctorId, from: NaiveDate, to: NaiveDate) -> Vec<ScheduleInfo> {
        self.collect_schedules(|s| s.doctor_id == doctor_id && s.enabled && s.date >= from && s.date <= to)
            .await
            .iter()
            .map(ScheduleInfo::from)
            .collect()
    }

    /// Schedules a patient could book right now: enabled, capacity left, not
    /// in the past.
    pub async fn list_available_schedules(
        &self,
        doctor_id: Option<DoctorId>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Vec<ScheduleInfo> {
        let from = from.max(self.clock.today());
        self.collect_schedules(|s| {
            doctor_id.is_none_or(|d| s.doctor_id == d)
                && s.enabled
                && s.available_slots > 0
                && s.date >= from
                && s.date <= to
        })
        .await
        .iter()
        .map(ScheduleInfo::from)
        .collect()
    }

    pub async fn appointment(&self, id: Ulid) -> Option<Appointment> {
        let schedule_id = self.appointment_index.get(&id).map(|e| *e.value())?;
        let rs = self.get_state(&schedule_id)?;
        let guard = rs.read().await;
        guard.appointment(&id).cloned()
    }

    /// Look up by the human-facing appointment number.
    pub async fn appointment_by_no(&self, appointment_no: &str) -> Option<Appointment> {
        let id = self.appointment_numbers.get(appointment_no).map(|e| *e.value())?;
        self.appointment(id).await
    }

    /// A user's appointments, newest first, optionally filtered by status.
    pub async fn user_appointments(&self, user_id: UserId, status: Option<AppointmentStatus>) -> Vec<Appointment> {
        let ids = match self.user_index.get(&user_id) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.appointment(id).await {
                Some(a) if status.is_none_or(|s| a.status == s) => out.push(a),
                _ => {}
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Staff listing. `page` is 1-based; `page_size` is clamped to
    /// `1..=MAX_PAGE_SIZE`. Returns the page and the total match count.
    pub async fn list_appointments(
        &self,
        filter: &AppointmentFilter,
        page: usize,
        page_size: usize,
    ) -> (Vec<Appointment>, usize) {
        let rows: Vec<SharedScheduleState> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut matched = Vec::new();
        for rs in rows {
            let guard = rs.read().await;
            matched.extend(guard.appointments.iter().filter(|a| filter.matches(a)).cloned());
        }
        matched.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then(b.created_at.cmp(&a.created_at))
                .then(b.id.cmp(&a.id))
        });

        let total = matched.len();
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let skip = page.saturating_sub(1).saturating_mul(page_size);
        let items = matched.into_iter().skip(skip).take(page_size).collect();
        (items, total)
    }

    /// Every pending appointment dated `date`, in schedule then slot order.
    pub async fn pending_on(&self, date: NaiveDate) -> Vec<Appointment> {
        let rows: Vec<SharedScheduleState> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in rows {
            let guard = rs.read().await;
            if guard.deleted || guard.schedule.date != date {
                continue;
            }
            out.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.status == AppointmentStatus::Pending)
                    .cloned(),
            );
        }
        out.sort_by_key(|a| (a.time, a.schedule_id, a.slot_number));
        out
    }

    /// Attach the guards derived from the current clock.
    pub fn view(&self, appointment: Appointment) -> AppointmentView {
        let now = self.clock.now();
        AppointmentView {
            can_cancel: appointment.can_cancel(now.date()),
            can_checkin: appointment.can_checkin(now, &self.checkin_window),
            appointment,
            doctor_name: None,
            department_name: None,
        }
    }

    /// Number of live schedules.
    pub fn schedule_count(&self) -> usize {
        self.slot_index.len()
    }
}
