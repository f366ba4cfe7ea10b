use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::{AppointmentStatus, DoctorId, Period};

/// Coarse error classes exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    CapacityExhausted,
    DuplicateRequest,
    AccessDenied,
    InvalidInput,
    StoreFailure,
}

#[derive(Debug)]
pub enum BookingError {
    TokenInvalid,
    UserNotFound(Ulid),
    UserBlocked { until: NaiveDateTime },
    DoctorNotFound(DoctorId),
    DoctorDisabled(DoctorId),
    ScheduleNotFound(Ulid),
    ScheduleDisabled(Ulid),
    ScheduleExpired(Ulid),
    ScheduleExists {
        doctor_id: DoctorId,
        date: NaiveDate,
        period: Period,
    },
    ScheduleHasAppointments(Ulid),
    CapacityBelowBooked { requested: u32, booked: u32 },
    PatientNotFound(Ulid),
    DuplicatePendingAppointment(Ulid),
    CapacityExhausted(Ulid),
    AppointmentNotFound(Ulid),
    AppointmentNotOwned(Ulid),
    InvalidStatus {
        id: Ulid,
        expected: AppointmentStatus,
        actual: AppointmentStatus,
    },
    SameDayCancellation(Ulid),
    OutsideCheckinWindow(Ulid),
    InvalidInput(&'static str),
    WalError(String),
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        use BookingError::*;
        match self {
            UserNotFound(_) | DoctorNotFound(_) | ScheduleNotFound(_) | PatientNotFound(_)
            | AppointmentNotFound(_) => ErrorKind::NotFound,
            UserBlocked { .. }
            | DoctorDisabled(_)
            | ScheduleDisabled(_)
            | ScheduleExpired(_)
            | ScheduleHasAppointments(_)
            | CapacityBelowBooked { .. }
            | InvalidStatus { .. }
            | SameDayCancellation(_)
            | OutsideCheckinWindow(_) => ErrorKind::InvalidState,
            CapacityExhausted(_) => ErrorKind::CapacityExhausted,
            TokenInvalid | DuplicatePendingAppointment(_) | ScheduleExists { .. } => {
                ErrorKind::DuplicateRequest
            }
            AppointmentNotOwned(_) => ErrorKind::AccessDenied,
            InvalidInput(_) => ErrorKind::InvalidInput,
            WalError(_) => ErrorKind::StoreFailure,
        }
    }

    /// Stable message safe to show an end user. Carries no storage detail.
    pub fn user_message(&self) -> &'static str {
        use BookingError::*;
        match self {
            TokenInvalid => "request token is invalid or expired, please retry",
            UserNotFound(_) => "account not found",
            UserBlocked { .. } => "your account is temporarily blocked from booking",
            DoctorNotFound(_) => "doctor not found",
            DoctorDisabled(_) => "doctor is not taking appointments",
            ScheduleNotFound(_) => "schedule not found",
            ScheduleDisabled(_) => "this schedule has been suspended",
            ScheduleExpired(_) => "this schedule has expired",
            ScheduleExists { .. } => "a schedule for this period already exists",
            ScheduleHasAppointments(_) => "schedule has appointments and cannot be deleted",
            CapacityBelowBooked { .. } => "total slots cannot be less than booked slots",
            PatientNotFound(_) => "patient not found",
            DuplicatePendingAppointment(_) => "you already have an appointment for this period",
            CapacityExhausted(_) => "slot is full",
            AppointmentNotFound(_) | AppointmentNotOwned(_) => "appointment not found",
            InvalidStatus { expected: AppointmentStatus::CheckedIn, .. } => {
                "only checked-in appointments can be completed"
            }
            InvalidStatus { .. } => "only pending appointments can be changed",
            SameDayCancellation(_) => "cannot cancel on the day of your visit",
            OutsideCheckinWindow(_) => "check-in is not open for this appointment",
            InvalidInput(msg) => *msg,
            WalError(_) => "service temporarily unavailable, please retry",
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::TokenInvalid => write!(f, "idempotency token invalid or consumed"),
            BookingError::UserNotFound(id) => write!(f, "user not found: {id}"),
            BookingError::UserBlocked { until } => write!(f, "user blocked until {until}"),
            BookingError::DoctorNotFound(id) => write!(f, "doctor not found: {id}"),
            BookingError::DoctorDisabled(id) => write!(f, "doctor disabled: {id}"),
            BookingError::ScheduleNotFound(id) => write!(f, "schedule not found: {id}"),
            BookingError::ScheduleDisabled(id) => write!(f, "schedule disabled: {id}"),
            BookingError::ScheduleExpired(id) => write!(f, "schedule expired: {id}"),
            BookingError::ScheduleExists {
                doctor_id,
                date,
                period,
            } => write!(f, "schedule already exists: doctor {doctor_id} on {date} {period}"),
            BookingError::ScheduleHasAppointments(id) => {
                write!(f, "cannot delete schedule {id}: has appointments")
            }
            BookingError::CapacityBelowBooked { requested, booked } => {
                write!(f, "total slots {requested} below booked count {booked}")
            }
            BookingError::PatientNotFound(id) => write!(f, "patient not found: {id}"),
            BookingError::DuplicatePendingAppointment(id) => {
                write!(f, "pending appointment already exists: {id}")
            }
            BookingError::CapacityExhausted(id) => {
                write!(f, "schedule {id} has no available slots")
            }
            BookingError::AppointmentNotFound(id) => write!(f, "appointment not found: {id}"),
            BookingError::AppointmentNotOwned(id) => {
                write!(f, "appointment {id} belongs to another user")
            }
            BookingError::InvalidStatus {
                id,
                expected,
                actual,
            } => write!(f, "appointment {id} is {actual}, expected {expected}"),
            BookingError::SameDayCancellation(id) => {
                write!(f, "appointment {id} is today and cannot be cancelled")
            }
            BookingError::OutsideCheckinWindow(id) => {
                write!(f, "appointment {id} is outside its check-in window")
            }
            BookingError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            BookingError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failure_hides_detail() {
        let err = BookingError::WalError("disk full at /var/data".into());
        assert_eq!(err.kind(), ErrorKind::StoreFailure);
        assert!(!err.user_message().contains("disk"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn ownership_mismatch_looks_like_not_found() {
        let id = Ulid::new();
        let owned = BookingError::AppointmentNotOwned(id);
        assert_eq!(owned.kind(), ErrorKind::AccessDenied);
        assert_eq!(
            owned.user_message(),
            BookingError::AppointmentNotFound(id).user_message()
        );
    }

    #[test]
    fn taxonomy_mapping() {
        let id = Ulid::new();
        assert_eq!(BookingError::TokenInvalid.kind(), ErrorKind::DuplicateRequest);
        assert_eq!(
            BookingError::DuplicatePendingAppointment(id).kind(),
            ErrorKind::DuplicateRequest
        );
        assert_eq!(BookingError::CapacityExhausted(id).kind(), ErrorKind::CapacityExhausted);
        assert_eq!(BookingError::SameDayCancellation(id).kind(), ErrorKind::InvalidState);
        assert_eq!(BookingError::OutsideCheckinWindow(id).kind(), ErrorKind::InvalidState);
        assert_eq!(BookingError::ScheduleNotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(BookingError::CapacityExhausted(id).user_message(), "slot is full");
    }
}
