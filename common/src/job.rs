use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub type JobId = String;

/// Atributo del descriptor con la predicción de duración (en ms) que usa el placement.
pub const JOB_ATTRIBUTES_RUNTIME_PREDICTION_MS: &str = "job.runtimePredictionMs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Accepted,
    KillInitiated,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub reason_code: String,
    pub reason_message: String,
    /// Wall time en ms
    pub timestamp: i64,
}

impl JobStatus {
    pub const REASON_NORMAL: &'static str = "normal";
    pub const REASON_FAILED: &'static str = "failed";
    pub const REASON_KILLED: &'static str = "killed";

    pub fn new(
        state: JobState,
        reason_code: impl Into<String>,
        reason_message: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            state,
            reason_code: reason_code.into(),
            reason_message: reason_message.into(),
            timestamp,
        }
    }
}

/* --------- Extensiones por tipo de job --------- */

/// Job batch: número fijo de tareas, cada una con su índice estable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJobExt {
    pub size: u32,
    pub retry_policy: RetryPolicy,
    /// Límite de ejecución por tarea (ms)
    pub runtime_limit_ms: u64,
    pub retry_on_runtime_limit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub min: u32,
    pub desired: u32,
    pub max: u32,
}

/// Job de servicio con tamaño elástico. Existe en el modelo pero este
/// control loop sólo sabe reconciliar jobs batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceJobExt {
    pub capacity: Capacity,
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobExtensions {
    Batch(BatchJobExt),
    Service(ServiceJobExt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Batch,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub owner: String,
    /// Grupo de capacidad declarado (puede no existir; ver tier assignment)
    pub capacity_group: String,
    pub attributes: BTreeMap<String, String>,
    pub extensions: JobExtensions,
}

impl JobDescriptor {
    pub fn batch(name: impl Into<String>, size: u32, retry_policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            owner: String::new(),
            capacity_group: String::new(),
            attributes: BTreeMap::new(),
            extensions: JobExtensions::Batch(BatchJobExt {
                size,
                retry_policy,
                runtime_limit_ms: 0,
                retry_on_runtime_limit: false,
            }),
        }
    }

    pub fn with_capacity_group(mut self, capacity_group: impl Into<String>) -> Self {
        self.capacity_group = capacity_group.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub descriptor: JobDescriptor,
    pub status: JobStatus,
    pub status_history: Vec<JobStatus>,
}

impl Job {
    /// Job recién aceptado, con id generado.
    pub fn new(descriptor: JobDescriptor, timestamp: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            descriptor,
            status: JobStatus::new(JobState::Accepted, JobStatus::REASON_NORMAL, "Job accepted", timestamp),
            status_history: Vec::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.status.state
    }

    pub fn job_type(&self) -> JobType {
        match self.descriptor.extensions {
            JobExtensions::Batch(_) => JobType::Batch,
            JobExtensions::Service(_) => JobType::Service,
        }
    }

    pub fn batch_ext(&self) -> Option<&BatchJobExt> {
        match &self.descriptor.extensions {
            JobExtensions::Batch(ext) => Some(ext),
            JobExtensions::Service(_) => None,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match &self.descriptor.extensions {
            JobExtensions::Batch(ext) => ext.retry_policy,
            JobExtensions::Service(ext) => ext.retry_policy,
        }
    }

    /// Copia del job con un nuevo estado; el estado anterior pasa al historial.
    pub fn with_status(&self, status: JobStatus) -> Job {
        let mut job = self.clone();
        job.status_history.push(job.status.clone());
        job.status = status;
        job
    }

    pub fn runtime_prediction(&self) -> Option<Duration> {
        self.descriptor
            .attributes
            .get(JOB_ATTRIBUTES_RUNTIME_PREDICTION_MS)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_status_guarda_el_estado_anterior_en_el_historial() {
        let job = Job::new(JobDescriptor::batch("j", 2, RetryPolicy::immediate(1)), 10);
        let killed = job.with_status(JobStatus::new(JobState::KillInitiated, JobStatus::REASON_KILLED, "user", 20));

        assert_eq!(killed.state(), JobState::KillInitiated);
        assert_eq!(killed.status_history.len(), 1);
        assert_eq!(killed.status_history[0].state, JobState::Accepted);
        // el original no cambia
        assert_eq!(job.state(), JobState::Accepted);
    }

    #[test]
    fn runtime_prediction_se_lee_de_los_atributos() {
        let descriptor = JobDescriptor::batch("j", 1, RetryPolicy::default())
            .with_attribute(JOB_ATTRIBUTES_RUNTIME_PREDICTION_MS, "1500");
        let job = Job::new(descriptor, 0);
        assert_eq!(job.runtime_prediction(), Some(Duration::from_millis(1500)));

        let sin_prediccion = Job::new(JobDescriptor::batch("j", 1, RetryPolicy::default()), 0);
        assert_eq!(sin_prediccion.runtime_prediction(), None);
    }

    #[test]
    fn estados_se_serializan_en_mayusculas() {
        let s = serde_json::to_string(&JobState::KillInitiated).unwrap();
        assert_eq!(s, "\"KILL_INITIATED\"");
    }
}
