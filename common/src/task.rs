use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ModelError;
use crate::job::JobId;

pub type TaskId = String;

/// Marca en el contexto de la tarea: el sustrato ya creó la unidad ejecutable.
pub const TASK_ATTRIBUTES_POD_CREATED: &str = "task.podCreated";
/// Espera de reintento calculada al terminar la tarea (texto legible, ej "5s").
pub const TASK_ATTRIBUTES_RETRY_DELAY: &str = "task.retryDelay";

/// Ciclo de vida de una tarea. El orden de las variantes es el orden del ciclo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Accepted,
    Launched,
    StartInitiated,
    Started,
    KillInitiated,
    Finished,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished)
    }

    /// Activa pero todavía sin arrancar: cuenta contra el presupuesto de admisión.
    pub fn is_active_not_started(&self) -> bool {
        matches!(
            self,
            TaskState::Accepted | TaskState::Launched | TaskState::StartInitiated
        )
    }

    pub fn can_transition_to(&self, target: TaskState) -> bool {
        match self {
            TaskState::Finished => false,
            TaskState::KillInitiated => {
                matches!(target, TaskState::KillInitiated | TaskState::Finished)
            }
            // nunca se vuelve atrás en el ciclo
            current => target >= *current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub reason_code: String,
    pub reason_message: String,
    /// Wall time en ms
    pub timestamp: i64,
}

impl TaskStatus {
    pub const REASON_NORMAL: &'static str = "normal";
    pub const REASON_FAILED: &'static str = "failed";
    pub const REASON_TASK_KILLED: &'static str = "killed";
    pub const REASON_POD_CREATED: &'static str = "podCreated";
    pub const REASON_STUCK_IN_STATE: &'static str = "stuckInState";
    pub const REASON_RUNTIME_LIMIT_EXCEEDED: &'static str = "runtimeLimitExceeded";
    pub const REASON_CRASHED: &'static str = "crashed";
    pub const REASON_TRANSIENT_SYSTEM_ERROR: &'static str = "transientSystemError";
    pub const REASON_LOCAL_SYSTEM_ERROR: &'static str = "localSystemError";
    pub const REASON_UNKNOWN_SYSTEM_ERROR: &'static str = "unknownSystemError";

    pub fn new(
        state: TaskState,
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

    /// Fallos que no son culpa de la tarea: se reintentan sin consumir la política del usuario.
    pub fn is_system_error(&self) -> bool {
        matches!(
            self.reason_code.as_str(),
            Self::REASON_TRANSIENT_SYSTEM_ERROR
                | Self::REASON_LOCAL_SYSTEM_ERROR
                | Self::REASON_UNKNOWN_SYSTEM_ERROR
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    /// Slot estable dentro del job batch (0..size-1)
    pub index: u32,
    /// Id de la primera tarea de la cadena de reemplazos
    pub original_id: TaskId,
    pub resubmit_of: Option<TaskId>,
    pub resubmit_number: u32,
    pub system_resubmit_number: u32,
    pub status: TaskStatus,
    pub status_history: Vec<TaskStatus>,
    pub task_context: BTreeMap<String, String>,
}

impl Task {
    /// Tarea nueva en estado Accepted para el índice dado.
    pub fn new_batch_task(job_id: &str, index: u32, timestamp: i64) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            original_id: id.clone(),
            id,
            job_id: job_id.to_string(),
            index,
            resubmit_of: None,
            resubmit_number: 0,
            system_resubmit_number: 0,
            status: TaskStatus::new(TaskState::Accepted, TaskStatus::REASON_NORMAL, "Task accepted", timestamp),
            status_history: Vec::new(),
            task_context: BTreeMap::new(),
        }
    }

    /// Nueva instancia que reemplaza a esta (misma posición, nuevo id).
    pub fn replacement(&self, timestamp: i64) -> Self {
        let mut next = Task::new_batch_task(&self.job_id, self.index, timestamp);
        next.original_id = self.original_id.clone();
        next.resubmit_of = Some(self.id.clone());
        next.resubmit_number = self.resubmit_number + 1;
        next.system_resubmit_number = if self.status.is_system_error() {
            self.system_resubmit_number + 1
        } else {
            self.system_resubmit_number
        };
        next
    }

    pub fn state(&self) -> TaskState {
        self.status.state
    }

    pub fn is_pod_created(&self) -> bool {
        self.task_context
            .get(TASK_ATTRIBUTES_POD_CREATED)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Copia con nuevo estado, sin validar la transición.
    pub fn with_status(&self, status: TaskStatus) -> Task {
        let mut task = self.clone();
        task.status_history.push(task.status.clone());
        task.status = status;
        task
    }

    /// Como `with_status` pero rechaza transiciones hacia atrás.
    pub fn transition(&self, status: TaskStatus) -> Result<Task, ModelError> {
        if !self.state().can_transition_to(status.state) {
            return Err(ModelError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.state(),
                to: status.state,
            });
        }
        Ok(self.with_status(status))
    }

    pub fn with_context(&self, key: &str, value: impl Into<String>) -> Task {
        let mut task = self.clone();
        task.task_context.insert(key.to_string(), value.into());
        task
    }

    /// Cuánto estuvo la tarea en `state` la última vez que pasó por él.
    /// Si sigue en ese estado se mide hasta `now`.
    pub fn time_in_state(&self, state: TaskState, now: i64) -> Option<i64> {
        let mut timeline: Vec<&TaskStatus> = self.status_history.iter().collect();
        timeline.push(&self.status);

        let pos = timeline.iter().rposition(|s| s.state == state)?;
        let entered = timeline[pos].timestamp;
        let left = timeline
            .get(pos + 1)
            .map(|next| next.timestamp)
            .unwrap_or(now);
        Some((left - entered).max(0))
    }
}
