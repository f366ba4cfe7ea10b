//! Booking workflow: the caller-facing surface. Cross-service checks (token,
//! account, patient ownership, doctor status) run here; everything that must
//! be atomic with the inventory runs inside the engine under the schedule lock.

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::directory::Directory;
use crate::engine::{
    check_bookable, BatchSchedules, BookingError, Engine, NewAppointment, NewSchedule, ScheduleUpdate,
};
use crate::idempotency::{IssuedToken, TokenGuard};
use crate::model::*;

pub struct BookingService {
    engine: Arc<Engine>,
    tokens: Arc<TokenGuard>,
    directory: Arc<dyn Directory>,
}

/// Patient-side create request.
#[derive(Debug, Clone)]
pub struct CreateAppointment {
    pub token: String,
    pub schedule_id: Ulid,
    pub patient_id: PatientId,
    pub symptom: Option<String>,
}

impl BookingService {
    pub fn new(engine: Arc<Engine>, tokens: Arc<TokenGuard>, directory: Arc<dyn Directory>) -> Self {
        Self {
            engine,
            tokens,
            directory,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn tokens(&self) -> &Arc<TokenGuard> {
        &self.tokens
    }

    // ── Patient surface ──────────────────────────────────

    pub fn issue_token(&self, user_id: UserId) -> IssuedToken {
        self.tokens.issue(user_id)
    }

    /// Book one slot. The token is consumed first and stays consumed whatever
    /// happens after, so a failed attempt needs a fresh token.
    pub async fn create(&self, user_id: UserId, req: CreateAppointment) -> Result<Appointment, BookingError> {
        let start = Instant::now();
        let result = self.create_inner(user_id, req).await;

        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => {
                debug!("booking rejected for user {user_id}: {e}");
                error_label(e)
            }
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(crate::observability::BOOKING_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn create_inner(&self, user_id: UserId, req: CreateAppointment) -> Result<Appointment, BookingError> {
        self.tokens.consume(user_id, &req.token)?;

        let now = self.engine.clock().now();
        let user = self
            .directory
            .user(user_id)
            .await
            .ok_or(BookingError::UserNotFound(user_id))?;
        if let Some(until) = user.blocked_until.filter(|_| user.is_blocked(now)) {
            return Err(BookingError::UserBlocked { until });
        }

        // Early rejection only; the engine re-checks under the schedule lock.
        let schedule = self
            .engine
            .get_schedule(req.schedule_id)
            .await
            .ok_or(BookingError::ScheduleNotFound(req.schedule_id))?;
        check_bookable(&schedule.schedule, now.date())?;

        self.directory
            .patient(user_id, req.patient_id)
            .await
            .ok_or(BookingError::PatientNotFound(req.patient_id))?;

        self.engine
            .book(
                req.schedule_id,
                NewAppointment {
                    user_id,
                    patient_id: req.patient_id,
                    symptom: req.symptom,
                },
            )
            .await
    }

    pub async fn cancel(&self, user_id: UserId, id: Ulid, reason: String) -> Result<Appointment, BookingError> {
        let result = self.engine.cancel(user_id, id, reason).await;
        match &result {
            Ok(_) => metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1),
            Err(e) => debug!("cancel rejected for {id}: {e}"),
        }
        result
    }

    pub async fn checkin(&self, user_id: UserId, id: Ulid) -> Result<Appointment, BookingError> {
        let result = self.engine.checkin(user_id, id).await;
        match &result {
            Ok(_) => metrics::counter!(crate::observability::CHECKINS_TOTAL).increment(1),
            Err(e) => debug!("check-in rejected for {id}: {e}"),
        }
        result
    }

    /// One of the caller's appointments. Someone else's reads as not found.
    pub async fn get(&self, user_id: UserId, id: Ulid) -> Result<AppointmentView, BookingError> {
        let appointment = self
            .engine
            .appointment(id)
            .await
            .ok_or(BookingError::AppointmentNotFound(id))?;
        if appointment.user_id != user_id {
            return Err(BookingError::AppointmentNotOwned(id));
        }
        Ok(self.enrich(appointment).await)
    }

    pub async fn list_mine(&self, user_id: UserId, status: Option<AppointmentStatus>) -> Vec<AppointmentView> {
        let mut out = Vec::new();
        for a in self.engine.user_appointments(user_id, status).await {
            out.push(self.enrich(a).await);
        }
        out
    }

    // ── Staff surface ────────────────────────────────────

    pub async fn complete(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.engine.complete(id).await
    }

    pub async fn list_all(
        &self,
        filter: &AppointmentFilter,
        page: usize,
        page_size: usize,
    ) -> (Vec<AppointmentView>, usize) {
        let mut filter = filter.clone();
        if let Some(keyword) = filter.keyword().map(str::to_owned) {
            filter.named_patients = self.directory.patients_named(&keyword).await.into_iter().collect();
            filter.named_doctors = self.directory.doctors_named(&keyword).await.into_iter().collect();
        }
        let (items, total) = self.engine.list_appointments(&filter, page, page_size).await;
        let mut out = Vec::with_capacity(items.len());
        for a in items {
            out.push(self.enrich(a).await);
        }
        (out, total)
    }

    /// The doctor must exist and be enabled; the department is taken from the
    /// doctor's profile.
    pub async fn create_schedule(&self, mut req: NewSchedule) -> Result<Schedule, BookingError> {
        req.department_id = self.bookable_doctor(req.doctor_id).await?;
        self.engine.create_schedule(req).await
    }

    pub async fn batch_create_schedules(&self, mut req: BatchSchedules) -> Result<Vec<Schedule>, BookingError> {
        req.department_id = self.bookable_doctor(req.doctor_id).await?;
        self.engine.batch_create_schedules(req).await
    }

    pub async fn update_schedule(&self, id: Ulid, update: ScheduleUpdate) -> Result<Schedule, BookingError> {
        self.engine.update_schedule(id, update).await
    }

    pub async fn delete_schedule(&self, id: Ulid) -> Result<(), BookingError> {
        self.engine.delete_schedule(id).await?;
        self.engine.notify.remove(&id);
        Ok(())
    }

    pub async fn get_schedule(&self, id: Ulid) -> Result<ScheduleInfo, BookingError> {
        self.engine
            .get_schedule(id)
            .await
            .ok_or(BookingError::ScheduleNotFound(id))
    }

    pub async fn list_doctor_schedules(&self, doctor_id: DoctorId, from: NaiveDate, to: NaiveDate) -> Vec<ScheduleInfo> {
        self.engine.list_doctor_schedules(doctor_id, from, to).await
    }

    pub async fn list_available_schedules(
        &self,
        doctor_id: Option<DoctorId>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Vec<ScheduleInfo> {
        self.engine.list_available_schedules(doctor_id, from, to).await
    }

    async fn bookable_doctor(&self, doctor_id: DoctorId) -> Result<DepartmentId, BookingError> {
        let doctor = self
            .directory
            .doctor(doctor_id)
            .await
            .ok_or(BookingError::DoctorNotFound(doctor_id))?;
        if !doctor.enabled {
            return Err(BookingError::DoctorDisabled(doctor_id));
        }
        info!("doctor {doctor_id} ({}) accepted for scheduling", doctor.name);
        Ok(doctor.department_id)
    }

    async fn enrich(&self, appointment: Appointment) -> AppointmentView {
        let doctor = self.directory.doctor(appointment.doctor_id).await;
        let mut view = self.engine.view(appointment);
        if let Some(doctor) = doctor {
            view.doctor_name = Some(doctor.name);
            view.department_name = Some(doctor.department_name);
        }
        view
    }
}

fn error_label(e: &BookingError) -> &'static str {
    use crate::engine::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => "not_found",
        ErrorKind::InvalidState => "invalid_state",
        ErrorKind::CapacityExhausted => "capacity_exhausted",
        ErrorKind::DuplicateRequest => "duplicate_request",
        ErrorKind::AccessDenied => "access_denied",
        ErrorKind::InvalidInput => "invalid_input",
        ErrorKind::StoreFailure => "store_failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::directory::{DoctorProfile, InMemoryDirectory, PatientRecord, UserProfile};
    use crate::notify::NotifyHub;
    use chrono::{NaiveTime, TimeDelta};
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_booking");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    struct Fixture {
        service: BookingService,
        directory: Arc<InMemoryDirectory>,
        user: UserId,
        patient: PatientId,
        doctor: DoctorId,
    }

    fn fixture(name: &str) -> Fixture {
        let now = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let engine = Arc::new(Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), clock).unwrap());
        let directory = Arc::new(InMemoryDirectory::new());
        let user = Ulid::new();
        let patient = Ulid::new();
        let doctor = Ulid::new();
        directory.put_user(UserProfile::new(user));
        directory.put_patient(PatientRecord {
            id: patient,
            user_id: user,
            name: "Zhang San".into(),
        });
        directory.put_doctor(DoctorProfile {
            id: doctor,
            department_id: Ulid::new(),
            name: "Dr. Chen".into(),
            department_name: "Cardiology".into(),
            enabled: true,
        });
        let service = BookingService::new(
            engine,
            Arc::new(TokenGuard::new(Duration::from_secs(300))),
            directory.clone(),
        );
        Fixture {
            service,
            directory,
            user,
            patient,
            doctor,
        }
    }

    fn new_schedule(doctor: DoctorId, total_slots: u32) -> NewSchedule {
        NewSchedule {
            doctor_id: doctor,
            department_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2026, 4, 3).unwrap(),
            period: Period::Morning,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            total_slots,
            enabled: true,
        }
    }

    fn request(f: &Fixture, schedule_id: Ulid) -> CreateAppointment {
        CreateAppointment {
            token: f.service.issue_token(f.user).token,
            schedule_id,
            patient_id: f.patient,
            symptom: Some("chest pain".into()),
        }
    }

    #[tokio::test]
    async fn create_returns_pending_with_first_slot() {
        let f = fixture("create_first_slot.wal");
        let schedule = f.service.create_schedule(new_schedule(f.doctor, 3)).await.unwrap();

        let a = f.service.create(f.user, request(&f, schedule.id)).await.unwrap();
        assert_eq!(a.status, AppointmentStatus::Pending);
        assert_eq!(a.slot_number, 1);
        assert_eq!(a.appointment_no.len(), 20);
        assert!(a.appointment_no.starts_with("20260401100000"));

        let info = f.service.get_schedule(schedule.id).await.unwrap();
        assert_eq!(info.schedule.available_slots, 2);
    }

    #[tokio::test]
    async fn schedule_takes_department_from_doctor() {
        let f = fixture("schedule_department.wal");
        let doctor = f.directory.doctor(f.doctor).await.unwrap();
        let schedule = f.service.create_schedule(new_schedule(f.doctor, 3)).await.unwrap();
        assert_eq!(schedule.department_id, doctor.department_id);
    }

    #[tokio::test]
    async fn disabled_doctor_cannot_be_scheduled() {
        let f = fixture("disabled_doctor.wal");
        let mut doctor = f.directory.doctor(f.doctor).await.unwrap();
        doctor.enabled = false;
        f.directory.put_doctor(doctor);

        let err = f.service.create_schedule(new_schedule(f.doctor, 3)).await.unwrap_err();
        assert!(matches!(err, BookingError::DoctorDisabled(_)));
        let err = f.service.create_schedule(new_schedule(Ulid::new(), 3)).await.unwrap_err();
        assert!(matches!(err, BookingError::DoctorNotFound(_)));
    }

    #[tokio::test]
    async fn blocked_user_rejected_and_token_burned() {
        let f = fixture("blocked_user.wal");
        let schedule = f.service.create_schedule(new_schedule(f.doctor, 3)).await.unwrap();
        let mut user = f.directory.user(f.user).await.unwrap();
        let now = f.service.engine().clock().now();
        user.blocked_until = Some(now + TimeDelta::days(7));
        f.directory.put_user(user);

        let req = request(&f, schedule.id);
        let err = f.service.create(f.user, req.clone()).await.unwrap_err();
        assert!(matches!(err, BookingError::UserBlocked { .. }));

        // Same token again: already consumed.
        let err = f.service.create(f.user, req).await.unwrap_err();
        assert!(matches!(err, BookingError::TokenInvalid));
    }

    #[tokio::test]
    async fn foreign_patient_rejected() {
        let f = fixture("foreign_patient.wal");
        let schedule = f.service.create_schedule(new_schedule(f.doctor, 3)).await.unwrap();
        let mut req = request(&f, schedule.id);
        req.patient_id = Ulid::new();
        let err = f.service.create(f.user, req).await.unwrap_err();
        assert!(matches!(err, BookingError::PatientNotFound(_)));
        assert_eq!(
            f.service.get_schedule(schedule.id).await.unwrap().schedule.available_slots,
            3
        );
    }

    #[tokio::test]
    async fn disabled_schedule_rejected() {
        let f = fixture("disabled_schedule.wal");
        let mut req = new_schedule(f.doctor, 3);
        req.enabled = false;
        let schedule = f.service.create_schedule(req).await.unwrap();
        let err = f.service.create(f.user, request(&f, schedule.id)).await.unwrap_err();
        assert!(matches!(err, BookingError::ScheduleDisabled(_)));
    }

    #[tokio::test]
    async fn get_hides_other_users_appointment() {
        let f = fixture("get_hides_foreign.wal");
        let schedule = f.service.create_schedule(new_schedule(f.doctor, 3)).await.unwrap();
        let a = f.service.create(f.user, request(&f, schedule.id)).await.unwrap();

        let view = f.service.get(f.user, a.id).await.unwrap();
        assert_eq!(view.doctor_name.as_deref(), Some("Dr. Chen"));
        assert_eq!(view.department_name.as_deref(), Some("Cardiology"));
        assert!(view.can_cancel);
        assert!(!view.can_checkin);

        let err = f.service.get(Ulid::new(), a.id).await.unwrap_err();
        assert_eq!(err.user_message(), "appointment not found");
    }

    #[tokio::test]
    async fn delete_schedule_drops_change_feed() {
        let f = fixture("delete_drops_feed.wal");
        let schedule = f.service.create_schedule(new_schedule(f.doctor, 3)).await.unwrap();
        let _rx = f.service.engine().notify.subscribe(schedule.id);
        assert_eq!(f.service.engine().notify.channel_count(), 1);

        f.service.delete_schedule(schedule.id).await.unwrap();
        assert_eq!(f.service.engine().notify.channel_count(), 0);
        assert!(f.service.get_schedule(schedule.id).await.is_err());
    }
}
