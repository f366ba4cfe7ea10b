use async_trait::async_trait;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{DepartmentId, DoctorId, PatientId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    /// Booking is refused until this instant.
    pub blocked_until: Option<NaiveDateTime>,
}

impl UserProfile {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            blocked_until: None,
        }
    }

    pub fn is_blocked(&self, now: NaiveDateTime) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }
}

/// A person a user may book on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: PatientId,
    pub user_id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorProfile {
    pub id: DoctorId,
    pub department_id: DepartmentId,
    pub name: String,
    pub department_name: String,
    pub enabled: bool,
}

/// Read-only view of the account, patient, and doctor records the booking
/// flow depends on. Owned by other services.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn user(&self, id: UserId) -> Option<UserProfile>;

    /// The patient, only if it belongs to `user`.
    async fn patient(&self, user: UserId, id: PatientId) -> Option<PatientRecord>;

    async fn doctor(&self, id: DoctorId) -> Option<DoctorProfile>;

    /// Patients whose name contains `keyword`, ignoring case.
    async fn patients_named(&self, keyword: &str) -> Vec<PatientId>;

    /// Doctors whose name contains `keyword`, ignoring case.
    async fn doctors_named(&self, keyword: &str) -> Vec<DoctorId>;
}

fn name_contains(name: &str, keyword: &str) -> bool {
    name.to_lowercase().contains(&keyword.to_lowercase())
}

#[derive(Default)]
pub struct InMemoryDirectory {
    users: DashMap<UserId, UserProfile>,
    patients: DashMap<PatientId, PatientRecord>,
    doctors: DashMap<DoctorId, DoctorProfile>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_user(&self, user: UserProfile) {
        self.users.insert(user.id, user);
    }

    pub fn put_patient(&self, patient: PatientRecord) {
        self.patients.insert(patient.id, patient);
    }

    pub fn put_doctor(&self, doctor: DoctorProfile) {
        self.doctors.insert(doctor.id, doctor);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn user(&self, id: UserId) -> Option<UserProfile> {
        self.users.get(&id).map(|e| e.value().clone())
    }

    async fn patient(&self, user: UserId, id: PatientId) -> Option<PatientRecord> {
        self.patients
            .get(&id)
            .filter(|p| p.user_id == user)
            .map(|p| p.value().clone())
    }

    async fn doctor(&self, id: DoctorId) -> Option<DoctorProfile> {
        self.doctors.get(&id).map(|e| e.value().clone())
    }

    async fn patients_named(&self, keyword: &str) -> Vec<PatientId> {
        self.patients
            .iter()
            .filter(|p| name_contains(&p.name, keyword))
            .map(|p| p.id)
            .collect()
    }

    async fn doctors_named(&self, keyword: &str) -> Vec<DoctorId> {
        self.doctors
            .iter()
            .filter(|d| name_contains(&d.name, keyword))
            .map(|d| d.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    #[tokio::test]
    async fn patient_lookup_checks_owner() {
        let dir = InMemoryDirectory::new();
        let owner = Ulid::new();
        let patient = PatientRecord {
            id: Ulid::new(),
            user_id: owner,
            name: "Li Wei".into(),
        };
        dir.put_patient(patient.clone());

        assert_eq!(dir.patient(owner, patient.id).await, Some(patient.clone()));
        assert_eq!(dir.patient(Ulid::new(), patient.id).await, None);
    }

    #[tokio::test]
    async fn name_search_ignores_case() {
        let dir = InMemoryDirectory::new();
        let patient = PatientRecord {
            id: Ulid::new(),
            user_id: Ulid::new(),
            name: "Li Wei".into(),
        };
        dir.put_patient(patient.clone());

        assert_eq!(dir.patients_named("li w").await, vec![patient.id]);
        assert!(dir.patients_named("zhang").await.is_empty());
        assert!(dir.doctors_named("li").await.is_empty());
    }

    #[test]
    fn block_expires() {
        let now = NaiveDate::from_ymd_opt(2026, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let mut user = UserProfile::new(Ulid::new());
        assert!(!user.is_blocked(now));
        user.blocked_until = Some(now + chrono::TimeDelta::days(1));
        assert!(user.is_blocked(now));
        assert!(!user.is_blocked(now + chrono::TimeDelta::days(1)));
    }
}
