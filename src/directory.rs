use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

/// Read-only view of patient records owned by another system.
#[async_trait]
pub trait PatientDirectory: Send + Sync {
    async fn patient_exists(&self, patient_id: Ulid) -> bool;
    async fn patient_is_active(&self, patient_id: Ulid) -> bool;
}

/// Patients known to a practice, fed by `register_patient` and persisted in the WAL.
#[derive(Debug, Default)]
pub struct PatientRegistry {
    patients: DashMap<Ulid, bool>,
}

impl PatientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, id: Ulid, active: bool) {
        self.patients.insert(id, active);
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.patients.contains_key(id)
    }

    /// `(id, active)` pairs, for WAL compaction.
    pub fn snapshot(&self) -> Vec<(Ulid, bool)> {
        self.patients.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}

#[async_trait]
impl PatientDirectory for PatientRegistry {
    async fn patient_exists(&self, patient_id: Ulid) -> bool {
        self.patients.contains_key(&patient_id)
    }

    async fn patient_is_active(&self, patient_id: Ulid) -> bool {
        self.patients.get(&patient_id).is_some_and(|e| *e.value())
    }
}
