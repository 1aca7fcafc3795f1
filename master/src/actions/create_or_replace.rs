use async_trait::async_trait;
use common::{CallMetadata, HolderTag, JobHolder, Task};
use std::sync::Arc;
use tracing::info;

use crate::action::{ActionDescriptor, BoxedChangeAction, ChangeAction, Trigger};
use crate::context::JobManagerContext;
use crate::error::Result;
use crate::model::{ModelAction, ModelActionHolder, ModelChange, ModelViews};
use crate::retryer::ATTR_TASK_RETRY_COUNT;

struct CreateOrReplaceBatchTask {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
    index: u32,
}

/// Crea la tarea del índice o, si ya hay una terminada, la reemplaza por una nueva.
pub fn create_or_replace_task(ctx: Arc<JobManagerContext>, job_id: &str, index: u32) -> BoxedChangeAction {
    Box::new(CreateOrReplaceBatchTask {
        descriptor: ActionDescriptor::new(
            "createOrReplaceBatchTask",
            format!("{job_id}#{index}"),
            Trigger::Reconciler,
            format!("Creating or replacing task at index {index}"),
        ),
        ctx,
        index,
    })
}

impl CreateOrReplaceBatchTask {
    fn call_metadata(&self) -> CallMetadata {
        CallMetadata::reconciler(self.descriptor.summary.clone())
    }

    async fn create(&self, job_id: &str) -> Result<Vec<ModelActionHolder>> {
        let task = Task::new_batch_task(job_id, self.index, self.ctx.now());
        self.ctx.store.store_task(&task).await?;
        info!(job_id = %job_id, task_id = %task.id, index = self.index, "tarea nueva creada");

        let holder = JobHolder::for_task(task);
        Ok(vec![
            ModelActionHolder::reference(ModelAction::new(
                ModelChange::SetTaskHolder(holder.clone()),
                "Creating new task",
                self.call_metadata(),
            )),
            ModelActionHolder::store(ModelAction::new(
                ModelChange::SetTaskHolder(holder),
                "Creating new task",
                self.call_metadata(),
            )),
        ])
    }

    async fn replace(&self, old_holder: &JobHolder, old_task: &Task) -> Result<Vec<ModelActionHolder>> {
        let new_task = old_task.replacement(self.ctx.now());
        self.ctx.store.replace_task(old_task, &new_task).await?;
        info!(
            job_id = %old_task.job_id,
            old_task_id = %old_task.id,
            task_id = %new_task.id,
            index = self.index,
            resubmit = new_task.resubmit_number,
            "tarea reemplazada"
        );

        let failures = old_holder.count_tag(ATTR_TASK_RETRY_COUNT).unwrap_or(0);
        let reference_holder =
            JobHolder::for_task(new_task.clone()).add_tag(ATTR_TASK_RETRY_COUNT, HolderTag::Count(failures));
        Ok(vec![
            ModelActionHolder::reference(ModelAction::new(
                ModelChange::ReplaceTask {
                    old_task_id: old_task.id.clone(),
                    holder: reference_holder,
                },
                "Replacing finished task",
                self.call_metadata(),
            )),
            ModelActionHolder::store(ModelAction::new(
                ModelChange::ReplaceTask {
                    old_task_id: old_task.id.clone(),
                    holder: JobHolder::for_task(new_task),
                },
                "Replacing finished task",
                self.call_metadata(),
            )),
            ModelActionHolder::running(ModelAction::new(
                ModelChange::RemoveTask(old_task.id.clone()),
                "Removing replaced task",
                self.call_metadata(),
            )),
        ])
    }
}

#[async_trait]
impl ChangeAction for CreateOrReplaceBatchTask {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let Some(job) = views.job() else {
            return Ok(vec![]);
        };
        let existing = views
            .reference
            .children()
            .iter()
            .find(|holder| holder.task().map(|t| t.index) == Some(self.index));

        match existing {
            None => self.create(&job.id).await,
            Some(holder) => match holder.task() {
                Some(task) if task.state().is_terminal() => self.replace(holder, task).await,
                Some(task) => {
                    self.ctx.code_invariants.inconsistent(format_args!(
                        "no se puede reemplazar la tarea {} del índice {}: está en {:?}",
                        task.id,
                        self.index,
                        task.state()
                    ));
                    Ok(vec![])
                }
                None => Ok(vec![]),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::harness;
    use crate::config::JobManagerConfig;
    use crate::services::JobStore;
    use common::{Job, JobDescriptor, RetryPolicy, TaskState, TaskStatus};

    fn views() -> ModelViews {
        ModelViews::new(Job::new(JobDescriptor::batch("reemplazos", 2, RetryPolicy::immediate(3)), 0))
    }

    #[tokio::test]
    async fn crea_la_tarea_del_indice_faltante() {
        let h = harness(JobManagerConfig::default());
        let mut views = views();
        let job_id = views.reference.id().to_string();

        let updates = create_or_replace_task(h.ctx.clone(), &job_id, 1)
            .apply(&views)
            .await
            .unwrap();
        for u in &updates {
            views.apply(u);
        }

        let task = views.reference.tasks().next().unwrap().clone();
        assert_eq!(task.index, 1);
        assert_eq!(task.state(), TaskState::Accepted);
        assert_eq!(views.store.find_task(&task.id), Some(&task));
        assert_eq!(h.store.task(&task.id), Some(task));
    }

    #[tokio::test]
    async fn reemplaza_una_terminada_conservando_el_contador() {
        let h = harness(JobManagerConfig::default());
        let mut views = views();
        let job_id = views.reference.id().to_string();
        let old = Task::new_batch_task(&job_id, 0, 0)
            .with_status(TaskStatus::new(TaskState::Finished, "failed", "", 10));
        h.store.store_task(&old).await.unwrap();
        views.reference = views
            .reference
            .add_child(JobHolder::for_task(old.clone()).add_tag(ATTR_TASK_RETRY_COUNT, HolderTag::Count(2)));
        views.store = views.store.add_child(JobHolder::for_task(old.clone()));
        views.running = views.running.add_child(JobHolder::for_task(old.clone()));

        let updates = create_or_replace_task(h.ctx.clone(), &job_id, 0)
            .apply(&views)
            .await
            .unwrap();
        for u in &updates {
            views.apply(u);
        }

        assert!(views.reference.find_task(&old.id).is_none());
        assert!(views.store.find_task(&old.id).is_none());
        assert!(views.running.find_task(&old.id).is_none());

        let replacement = views.reference.children()[0].clone();
        let task = replacement.task().unwrap();
        assert_eq!(task.index, 0);
        assert_eq!(task.resubmit_of.as_deref(), Some(old.id.as_str()));
        assert_eq!(task.resubmit_number, 1);
        assert_eq!(replacement.count_tag(ATTR_TASK_RETRY_COUNT), Some(2));
        assert!(h.store.task(&old.id).is_none());
        assert_eq!(h.store.task(&task.id).as_ref(), Some(task));
    }

    #[tokio::test]
    async fn no_reemplaza_una_tarea_viva() {
        let h = harness(JobManagerConfig::default());
        let mut views = views();
        let job_id = views.reference.id().to_string();
        let live = Task::new_batch_task(&job_id, 0, 0);
        views.reference = views.reference.add_child(JobHolder::for_task(live));

        let updates = create_or_replace_task(h.ctx.clone(), &job_id, 0)
            .apply(&views)
            .await
            .unwrap();
        assert!(updates.is_empty());
        assert_eq!(h.ctx.code_invariants.violations(), 1);
    }

    #[tokio::test]
    async fn error_del_store_no_produce_cambios() {
        let h = harness(JobManagerConfig::default());
        h.store.fail_next_writes(1);
        let views = views();
        let job_id = views.reference.id().to_string();

        let result = create_or_replace_task(h.ctx.clone(), &job_id, 0).apply(&views).await;
        assert!(result.is_err());
        assert_eq!(h.store.task_count(), 0);
    }
}
