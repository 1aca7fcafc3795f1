//! Resolvers: comparan los tres modelos de un job y devuelven las acciones
//! que acercan running y store a la referencia.

pub mod batch;

pub use batch::{BatchDifferenceResolver, BatchJobView};

use common::{CallMetadata, Job, JobHolder, JobState, Task, TaskState, TaskStatus};
use std::collections::HashSet;
use std::sync::Arc;

use crate::action::BoxedChangeAction;
use crate::actions::{finish_stuck_kill, kill_task};
use crate::context::JobManagerContext;
use crate::model::ModelViews;
use crate::retryer;

pub trait DifferenceResolver: Send + Sync {
    /// Función pura de los modelos (y del reloj): no hace I/O.
    fn apply(&self, views: &ModelViews) -> Vec<BoxedChangeAction>;

    /// El engine del job se retiró.
    fn job_closed(&self, _job_id: &str) {}
}

/// Tareas activas sin arrancar, contando una sola vez las que aparecen en
/// referencia y en running.
pub fn count_active_not_started_tasks(reference: &JobHolder, running: &JobHolder) -> u32 {
    let mut ids: HashSet<&str> = HashSet::new();
    for task in reference.tasks().chain(running.tasks()) {
        if task.state().is_active_not_started() {
            ids.insert(task.id.as_str());
        }
    }
    ids.len() as u32
}

/// Si una tarea terminada debe reemplazarse.
///
/// Terminaciones normales y kills nunca. Superar el límite de ejecución sólo
/// si el job lo permite. Los errores de sistema siempre; el resto mientras
/// queden reintentos de usuario en la política.
pub fn should_retry(job: &Job, task: &Task) -> bool {
    if task.state() != TaskState::Finished || job.state() != JobState::Accepted {
        return false;
    }
    let status = &task.status;
    match status.reason_code.as_str() {
        TaskStatus::REASON_NORMAL | TaskStatus::REASON_TASK_KILLED => return false,
        TaskStatus::REASON_RUNTIME_LIMIT_EXCEEDED => {
            let allowed = job
                .batch_ext()
                .map(|ext| ext.retry_on_runtime_limit)
                .unwrap_or(false);
            if !allowed {
                return false;
            }
        }
        _ => {}
    }
    if status.is_system_error() {
        return true;
    }
    let user_retries = task.resubmit_number.saturating_sub(task.system_resubmit_number);
    user_retries < job.retry_policy().retries
}

/// Kills / cierres para tareas que pasaron demasiado tiempo en un estado intermedio.
pub fn find_task_state_timeouts(ctx: &Arc<JobManagerContext>, views: &ModelViews) -> Vec<BoxedChangeAction> {
    let now = ctx.now();
    let config = &ctx.config;
    let mut actions = Vec::new();

    for task in views.running.tasks() {
        let state = task.state();
        let timeout = retryer::clamp_millis(match state {
            TaskState::Launched => config.task_in_launched_state_timeout_ms,
            TaskState::StartInitiated => config.task_in_start_initiated_state_timeout_ms,
            TaskState::KillInitiated => config.task_in_kill_initiated_state_timeout_ms,
            _ => continue,
        });
        let in_state = task.time_in_state(state, now).unwrap_or(0);
        if in_state < timeout {
            continue;
        }

        if state == TaskState::KillInitiated {
            actions.push(finish_stuck_kill(ctx.clone(), task));
        } else {
            let message = format!("Task stuck in {state:?} state");
            actions.push(kill_task(
                ctx.clone(),
                &task.id,
                TaskStatus::REASON_STUCK_IN_STATE,
                &message,
                CallMetadata::reconciler(message.clone()),
            ));
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{JobDescriptor, RetryPolicy};

    fn job(retries: u32) -> Job {
        Job::new(JobDescriptor::batch("r", 1, RetryPolicy::immediate(retries)), 0)
    }

    fn finished(reason: &str) -> Task {
        Task::new_batch_task("j", 0, 0).with_status(TaskStatus::new(TaskState::Finished, reason, "", 1))
    }

    #[test]
    fn active_not_started_sin_duplicados() {
        let j = job(0);
        let accepted = Task::new_batch_task(&j.id, 0, 0);
        let started = Task::new_batch_task(&j.id, 1, 0)
            .with_status(TaskStatus::new(TaskState::Started, "normal", "", 1));
        let launched = Task::new_batch_task(&j.id, 2, 0)
            .with_status(TaskStatus::new(TaskState::Launched, "normal", "", 1));

        let reference = JobHolder::for_job(j.clone())
            .add_child(JobHolder::for_task(accepted.clone()))
            .add_child(JobHolder::for_task(started));
        let running = JobHolder::for_job(j)
            .add_child(JobHolder::for_task(accepted))
            .add_child(JobHolder::for_task(launched));

        assert_eq!(count_active_not_started_tasks(&reference, &running), 2);
    }

    #[test]
    fn normal_y_killed_no_se_reintentan() {
        assert!(!should_retry(&job(5), &finished(TaskStatus::REASON_NORMAL)));
        assert!(!should_retry(&job(5), &finished(TaskStatus::REASON_TASK_KILLED)));
    }

    #[test]
    fn fallo_de_usuario_consume_la_politica() {
        let j = job(1);
        let first = finished(TaskStatus::REASON_FAILED);
        assert!(should_retry(&j, &first));

        let second = first
            .replacement(2)
            .with_status(TaskStatus::new(TaskState::Finished, TaskStatus::REASON_FAILED, "", 3));
        assert!(!should_retry(&j, &second));
    }

    #[test]
    fn errores_de_sistema_siempre_se_reintentan() {
        assert!(should_retry(&job(0), &finished(TaskStatus::REASON_TRANSIENT_SYSTEM_ERROR)));
    }

    #[test]
    fn runtime_limit_respeta_el_flag_del_job() {
        let task = finished(TaskStatus::REASON_RUNTIME_LIMIT_EXCEEDED);
        assert!(!should_retry(&job(3), &task));

        let mut permissive = job(3);
        if let common::JobExtensions::Batch(ext) = &mut permissive.descriptor.extensions {
            ext.retry_on_runtime_limit = true;
        }
        assert!(should_retry(&permissive, &task));
    }

    #[test]
    fn job_terminando_no_reintenta() {
        let j = job(3).with_status(common::JobStatus::new(JobState::KillInitiated, "killed", "", 1));
        assert!(!should_retry(&j, &finished(TaskStatus::REASON_FAILED)));
    }
}
