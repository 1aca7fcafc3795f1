use common::{JobId, JobType, TaskId};
use thiserror::Error;

/// Errores del job manager.
///
/// Sólo `TaskNotFound`/`JobNotFound` llegan al usuario; el resto se
/// absorbe en el loop de reconciliación y se reintenta en el próximo ciclo.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobManagerError {
    #[error("tarea no encontrada: {0}")]
    TaskNotFound(TaskId),

    #[error("job no encontrado: {0}")]
    JobNotFound(JobId),

    #[error("el job {0} ya existe")]
    JobAlreadyExists(JobId),

    #[error("tipo de job no soportado por el reconciliador: {0:?}")]
    UnsupportedJobType(JobType),

    #[error("error del store: {0}")]
    Store(String),

    #[error("no se pudo lanzar la tarea: {0}")]
    Launch(String),

    #[error("no se pudo matar la tarea: {0}")]
    Kill(String),

    #[error("el engine del job {0} ya no está activo")]
    EngineClosed(JobId),
}

pub type Result<T> = std::result::Result<T, JobManagerError>;
