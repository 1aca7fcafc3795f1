//! Contratos de los colaboradores externos que usa el reconciliador.
//!
//! Store durable, servicio de placement, sustrato de ejecución y lookup de
//! grupos de capacidad. Las implementaciones reales viven fuera de este
//! crate; `crate::stubs` trae versiones en memoria.

use async_trait::async_trait;
use common::{Job, JobId, Task, TaskId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{JobManagerError, Result};

pub const DEFAULT_CAPACITY_GROUP: &str = "DEFAULT";

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn store_job(&self, job: &Job) -> Result<()>;
    async fn update_job(&self, job: &Job) -> Result<()>;
    /// Borra el job y sus tareas. Sólo se llama con el job ya terminado.
    async fn delete_job(&self, job: &Job) -> Result<()>;
    async fn store_task(&self, task: &Task) -> Result<()>;
    /// Asume que el registro de la tarea ya existe.
    async fn update_task(&self, task: &Task) -> Result<()>;
    async fn replace_task(&self, old_task: &Task, new_task: &Task) -> Result<()>;
    async fn retrieve_jobs(&self) -> Result<Vec<Job>>;
    async fn retrieve_tasks_for_job(&self, job_id: &str) -> Result<Vec<Task>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Critical,
    Flex,
}

/// Lo que se encola en el servicio de placement para una tarea.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueableTask {
    pub tier: Tier,
    pub capacity_group: String,
    pub job_id: JobId,
    pub task_id: TaskId,
    pub task_index: u32,
    pub runtime_prediction: Option<Duration>,
}

/// Placement / bin-packing. Fire-and-forget: no bloquea ni falla a este nivel.
pub trait SchedulingService: Send + Sync {
    fn add_task(&self, task: QueueableTask);
    fn remove_task(&self, task_id: &str);
}

/// Cliente del sustrato que crea/destruye la unidad ejecutable de una tarea.
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    async fn launch_task(&self, job: &Job, task: &Task) -> Result<()>;
    async fn kill_task(&self, task_id: &str, reason: &str) -> Result<()>;
    /// Traduce un error de lanzamiento a un reason code de tarea.
    fn resolve_reason_code(&self, error: &JobManagerError) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationSla {
    pub app_name: String,
    pub tier: Tier,
}

pub trait CapacityGroupService: Send + Sync {
    fn find_application_sla(&self, name: &str) -> Option<ApplicationSla>;
}

/// Resuelve (tier, grupo de capacidad) de un job.
///
/// Si el grupo declarado no existe se usa `DEFAULT`; si tampoco existe el
/// default, el job cae en tier Flex.
pub fn get_tier_assignment(job: &Job, capacity_groups: &dyn CapacityGroupService) -> (Tier, String) {
    let declared = job.descriptor.capacity_group.as_str();
    let sla = if declared.is_empty() {
        None
    } else {
        capacity_groups.find_application_sla(declared)
    };

    match sla {
        Some(sla) => (sla.tier, sla.app_name),
        None => match capacity_groups.find_application_sla(DEFAULT_CAPACITY_GROUP) {
            Some(default) => (default.tier, default.app_name),
            None => (Tier::Flex, DEFAULT_CAPACITY_GROUP.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{JobDescriptor, RetryPolicy};
    use std::collections::HashMap;

    struct Groups(HashMap<String, ApplicationSla>);

    impl CapacityGroupService for Groups {
        fn find_application_sla(&self, name: &str) -> Option<ApplicationSla> {
            self.0.get(name).cloned()
        }
    }

    fn groups() -> Groups {
        let mut m = HashMap::new();
        m.insert(
            "analytics".to_string(),
            ApplicationSla {
                app_name: "analytics".to_string(),
                tier: Tier::Critical,
            },
        );
        m.insert(
            DEFAULT_CAPACITY_GROUP.to_string(),
            ApplicationSla {
                app_name: DEFAULT_CAPACITY_GROUP.to_string(),
                tier: Tier::Flex,
            },
        );
        Groups(m)
    }

    #[test]
    fn grupo_declarado_existente() {
        let job = Job::new(
            JobDescriptor::batch("j", 1, RetryPolicy::default()).with_capacity_group("analytics"),
            0,
        );
        assert_eq!(get_tier_assignment(&job, &groups()), (Tier::Critical, "analytics".to_string()));
    }

    #[test]
    fn grupo_desconocido_cae_en_default() {
        let job = Job::new(
            JobDescriptor::batch("j", 1, RetryPolicy::default()).with_capacity_group("no-existe"),
            0,
        );
        assert_eq!(
            get_tier_assignment(&job, &groups()),
            (Tier::Flex, DEFAULT_CAPACITY_GROUP.to_string())
        );
    }

    #[test]
    fn sin_default_configurado_es_flex() {
        let job = Job::new(JobDescriptor::batch("j", 1, RetryPolicy::default()), 0);
        let empty = Groups(HashMap::new());
        assert_eq!(
            get_tier_assignment(&job, &empty),
            (Tier::Flex, DEFAULT_CAPACITY_GROUP.to_string())
        );
    }
}
