use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type UserId = Ulid;
pub type PatientId = Ulid;
pub type DoctorId = Ulid;
pub type DepartmentId = Ulid;

/// Half-day block a schedule covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Morning,
    Afternoon,
}

impl Period {
    pub const ALL: [Period; 2] = [Period::Morning, Period::Afternoon];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Morning => "morning",
            Period::Afternoon => "afternoon",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "morning" => Some(Period::Morning),
            "afternoon" => Some(Period::Afternoon),
            _ => None,
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Appointment lifecycle. `Pending` is the only state a patient action can leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    CheckedIn,
    Completed,
    Cancelled,
    Missed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::CheckedIn => "checked_in",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Missed => "missed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::Missed
        )
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One doctor's bookable block for a date and period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Ulid,
    pub doctor_id: DoctorId,
    pub department_id: DepartmentId,
    pub date: NaiveDate,
    pub period: Period,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub total_slots: u32,
    pub available_slots: u32,
    pub enabled: bool,
}

impl Schedule {
    pub fn booked_slots(&self) -> u32 {
        self.total_slots - self.available_slots
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub appointment_no: String,
    pub user_id: UserId,
    pub patient_id: PatientId,
    pub doctor_id: DoctorId,
    pub department_id: DepartmentId,
    pub schedule_id: Ulid,
    pub date: NaiveDate,
    pub period: Period,
    pub time: NaiveTime,
    pub slot_number: u32,
    pub status: AppointmentStatus,
    pub symptom: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub cancelled_at: Option<NaiveDateTime>,
    pub checked_in_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
}

impl Appointment {
    pub fn scheduled_at(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }

    /// Cancellation is only allowed for pending visits dated strictly after `today`.
    pub fn can_cancel(&self, today: NaiveDate) -> bool {
        self.status == AppointmentStatus::Pending && self.date > today
    }

    pub fn can_checkin(&self, now: NaiveDateTime, window: &CheckinWindow) -> bool {
        self.status == AppointmentStatus::Pending && window.contains(self.scheduled_at(), now)
    }
}

/// Half-open check-in window `[at - early, at + late)` around a scheduled time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckinWindow {
    pub early: TimeDelta,
    pub late: TimeDelta,
}

impl Default for CheckinWindow {
    fn default() -> Self {
        Self {
            early: TimeDelta::minutes(crate::limits::CHECKIN_EARLY_MINUTES),
            late: TimeDelta::minutes(crate::limits::CHECKIN_LATE_MINUTES),
        }
    }
}

impl CheckinWindow {
    pub fn contains(&self, scheduled_at: NaiveDateTime, now: NaiveDateTime) -> bool {
        now >= scheduled_at - self.early && now < scheduled_at + self.late
    }
}

/// In-memory row for a schedule: the schedule itself plus every appointment
/// booked against it, ordered by slot number.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub schedule: Schedule,
    pub deleted: bool,
    pub appointments: Vec<Appointment>,
}

impl ScheduleState {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            deleted: false,
            appointments: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.schedule.id
    }

    pub fn appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn appointment_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Any pending appointment held by `user` on this schedule. A schedule is
    /// unique per (doctor, date, period), so this is the duplicate-pending check.
    pub fn pending_for_user(&self, user: &UserId) -> Option<&Appointment> {
        self.appointments
            .iter()
            .find(|a| a.user_id == *user && a.status == AppointmentStatus::Pending)
    }
}

/// WAL record. A committed transaction is written as one frame of events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ScheduleCreated(Schedule),
    ScheduleUpdated {
        id: Ulid,
        start_time: NaiveTime,
        end_time: NaiveTime,
        total_slots: u32,
        available_slots: u32,
        enabled: bool,
    },
    ScheduleDeleted {
        id: Ulid,
    },
    SlotReserved {
        schedule_id: Ulid,
    },
    SlotReleased {
        schedule_id: Ulid,
    },
    AppointmentCreated(Appointment),
    AppointmentCancelled {
        id: Ulid,
        schedule_id: Ulid,
        reason: String,
        at: NaiveDateTime,
    },
    AppointmentCheckedIn {
        id: Ulid,
        schedule_id: Ulid,
        at: NaiveDateTime,
    },
    AppointmentCompleted {
        id: Ulid,
        schedule_id: Ulid,
        at: NaiveDateTime,
    },
    AppointmentMissed {
        id: Ulid,
        schedule_id: Ulid,
    },
}

impl Event {
    pub fn schedule_id(&self) -> Ulid {
        match self {
            Event::ScheduleCreated(s) => s.id,
            Event::AppointmentCreated(a) => a.schedule_id,
            Event::ScheduleUpdated { id, .. } | Event::ScheduleDeleted { id } => *id,
            Event::SlotReserved { schedule_id }
            | Event::SlotReleased { schedule_id }
            | Event::AppointmentCancelled { schedule_id, .. }
            | Event::AppointmentCheckedIn { schedule_id, .. }
            | Event::AppointmentCompleted { schedule_id, .. }
            | Event::AppointmentMissed { schedule_id, .. } => *schedule_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleInfo {
    #[serde(flatten)]
    pub schedule: Schedule,
    /// Enabled and has capacity left.
    pub bookable: bool,
}

impl From<&Schedule> for ScheduleInfo {
    fn from(schedule: &Schedule) -> Self {
        Self {
            bookable: schedule.enabled && schedule.available_slots > 0,
            schedule: schedule.clone(),
        }
    }
}

/// Appointment plus the guards derived at read time. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppointmentView {
    #[serde(flatten)]
    pub appointment: Appointment,
    pub doctor_name: Option<String>,
    pub department_name: Option<String>,
    pub can_cancel: bool,
    pub can_checkin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<AppointmentStatus>,
    pub doctor_id: Option<DoctorId>,
    /// Substring of the appointment number, or of a patient or doctor name.
    /// Empty means no keyword.
    pub keyword: Option<String>,
    /// Patients and doctors whose names contain `keyword`. Names live outside
    /// the engine, so the caller resolves them.
    pub named_patients: HashSet<PatientId>,
    pub named_doctors: HashSet<DoctorId>,
}

impl AppointmentFilter {
    pub fn keyword(&self) -> Option<&str> {
        self.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }

    pub fn matches(&self, a: &Appointment) -> bool {
        self.from.is_none_or(|d| a.date >= d)
            && self.to.is_none_or(|d| a.date <= d)
            && self.status.is_none_or(|s| a.status == s)
            && self.doctor_id.is_none_or(|d| a.doctor_id == d)
            && self.keyword().is_none_or(|k| {
                a.appointment_no.contains(k)
                    || self.named_patients.contains(&a.patient_id)
                    || self.named_doctors.contains(&a.doctor_id)
            })
    }
}
