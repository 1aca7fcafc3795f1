//! Acciones de cambio que emiten los resolvers y las operaciones de usuario.

pub mod create_or_replace;
pub mod job;
pub mod kill;
pub mod task;

pub use create_or_replace::create_or_replace_task;
pub use job::{complete_job, kill_job, remove_job_from_store, update_job_in_store};
pub use kill::{finish_stuck_kill, kill_all_tasks, kill_task};
pub use task::{
    launch_task, schedule_task, update_task_and_write_it_to_store, update_task_in_running_model,
    write_reference_task_to_store, RunningTaskChange, TaskChange,
};

use common::{Backoff, CallMetadata, JobHolder, Task};

use crate::context::JobManagerContext;
use crate::model::{ModelAction, ModelActionHolder, ModelChange, ModelViews};
use crate::retryer;

/// Holder de la tarea en el modelo de referencia. Si no está, la violación
/// se registra y la acción no hace nada.
pub(crate) fn expect_task_holder<'a>(
    ctx: &JobManagerContext,
    views: &'a ModelViews,
    task_id: &str,
    action: &str,
) -> Option<&'a JobHolder> {
    match views.reference.find_child_by_id(task_id) {
        Some(holder) if holder.task().is_some() => Some(holder),
        _ => {
            ctx.code_invariants.inconsistent(format_args!(
                "{action}: la tarea {task_id} no está en el modelo de referencia del job {}",
                views.reference.id()
            ));
            None
        }
    }
}

/// Cambios para una tarea que acaba de terminar: en referencia con su
/// espera de reintento calculada, en running tal cual.
pub(crate) fn finished_task_updates(
    ctx: &JobManagerContext,
    views: &ModelViews,
    holder: &JobHolder,
    finished: &Task,
    summary: &str,
    call_metadata: &CallMetadata,
) -> Vec<ModelActionHolder> {
    let backoff = views
        .job()
        .map(|job| job.retry_policy().backoff)
        .unwrap_or(Backoff::Immediate);
    let with_retry = retryer::with_retryer(holder, finished, &backoff, &ctx.config, ctx.now());
    let delay = with_retry
        .millis_tag(retryer::ATTR_TASK_RETRY_DELAY_MS)
        .unwrap_or(0);

    vec![
        ModelActionHolder::reference(ModelAction::new(
            ModelChange::SetTaskHolder(with_retry),
            format!(
                "{summary}; retry delay {}",
                retryer::format_delay(u64::try_from(delay).unwrap_or(0))
            ),
            call_metadata.clone(),
        )),
        ModelActionHolder::running(ModelAction::new(
            ModelChange::UpdateTask(finished.clone()),
            summary,
            call_metadata.clone(),
        )),
    ]
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::clock::TestClock;
    use crate::config::JobManagerConfig;
    use crate::context::{CodeInvariants, JobManagerContext};
    use crate::stubs::{InMemoryCapacityGroups, InMemoryJobStore, InMemoryScheduling, InMemorySubstrate};

    pub struct Harness {
        pub ctx: Arc<JobManagerContext>,
        pub clock: Arc<TestClock>,
        pub store: Arc<InMemoryJobStore>,
        pub scheduling: Arc<InMemoryScheduling>,
        pub substrate: Arc<InMemorySubstrate>,
    }

    pub fn harness(config: JobManagerConfig) -> Harness {
        let clock = Arc::new(TestClock::new(1_000_000));
        let store = Arc::new(InMemoryJobStore::default());
        let scheduling = Arc::new(InMemoryScheduling::default());
        let substrate = Arc::new(InMemorySubstrate::default());
        let ctx = Arc::new(JobManagerContext {
            config: Arc::new(config),
            store: store.clone(),
            scheduling: scheduling.clone(),
            substrate: substrate.clone(),
            capacity_groups: Arc::new(InMemoryCapacityGroups::with_default()),
            clock: clock.clone(),
            code_invariants: Arc::new(CodeInvariants::default()),
        });
        Harness {
            ctx,
            clock,
            store,
            scheduling,
            substrate,
        }
    }
}
