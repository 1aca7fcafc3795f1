use thiserror::Error;

use crate::task::{TaskId, TaskState};

/// Errores de validación del modelo de dominio.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("transición inválida de la tarea {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },
}
