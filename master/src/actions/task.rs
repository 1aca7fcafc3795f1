use async_trait::async_trait;
use common::{CallMetadata, JobHolder, Task, TaskState, TaskStatus, TASK_ATTRIBUTES_POD_CREATED};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{expect_task_holder, finished_task_updates};
use crate::action::{ActionDescriptor, BoxedChangeAction, ChangeAction, Trigger};
use crate::context::JobManagerContext;
use crate::error::{JobManagerError, Result};
use crate::model::{ModelAction, ModelActionHolder, ModelChange, ModelViews};
use crate::services::{get_tier_assignment, QueueableTask};

/// Cambio de usuario sobre una tarea.
pub type TaskChange = Box<dyn Fn(&Task) -> Task + Send + Sync>;
/// Cambio reportado por el sustrato; `None` descarta el evento.
pub type RunningTaskChange = Box<dyn Fn(&Task) -> Option<Task> + Send + Sync>;

/* ----------------------------- scheduleTask ----------------------------- */

struct ScheduleTask {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
    task_id: String,
}

/// Encola la tarea en placement y la registra en el modelo running.
pub fn schedule_task(ctx: Arc<JobManagerContext>, task: &Task) -> BoxedChangeAction {
    Box::new(ScheduleTask {
        descriptor: ActionDescriptor::new(
            "scheduleTask",
            &task.id,
            Trigger::Reconciler,
            "Adding task to the placement queue",
        ),
        ctx,
        task_id: task.id.clone(),
    })
}

#[async_trait]
impl ChangeAction for ScheduleTask {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let Some(job) = views.job() else {
            return Ok(vec![]);
        };
        let Some(holder) = expect_task_holder(&self.ctx, views, &self.task_id, self.descriptor.name)
        else {
            return Ok(vec![]);
        };
        let Some(task) = holder.task() else {
            return Ok(vec![]);
        };

        let (tier, capacity_group) = get_tier_assignment(job, self.ctx.capacity_groups.as_ref());
        self.ctx.scheduling.add_task(QueueableTask {
            tier,
            capacity_group: capacity_group.clone(),
            job_id: job.id.clone(),
            task_id: task.id.clone(),
            task_index: task.index,
            runtime_prediction: job.runtime_prediction(),
        });
        info!(
            job_id = %job.id,
            task_id = %task.id,
            index = task.index,
            tier = ?tier,
            capacity_group = %capacity_group,
            "tarea encolada para placement"
        );

        Ok(vec![ModelActionHolder::running(ModelAction::new(
            ModelChange::SetTaskHolder(JobHolder::for_task(task.clone())),
            "Creating new task entity holder",
            CallMetadata::reconciler(self.descriptor.summary.clone()),
        ))])
    }
}

/* ---------------------------- launchTaskInKube ---------------------------- */

struct LaunchTask {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
    task_id: String,
    call_metadata: CallMetadata,
}

/// El placement eligió nodo: pide al sustrato crear la unidad ejecutable.
pub fn launch_task(ctx: Arc<JobManagerContext>, task_id: &str) -> BoxedChangeAction {
    Box::new(LaunchTask {
        descriptor: ActionDescriptor::new(
            "launchTaskInKube",
            task_id,
            Trigger::Reconciler,
            "Launching task in the execution substrate",
        ),
        ctx,
        task_id: task_id.to_string(),
        call_metadata: CallMetadata::reconciler("Launching task in the execution substrate"),
    })
}

#[async_trait]
impl ChangeAction for LaunchTask {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let Some(job) = views.job() else {
            return Ok(vec![]);
        };
        let Some(holder) = expect_task_holder(&self.ctx, views, &self.task_id, self.descriptor.name)
        else {
            return Ok(vec![]);
        };
        let Some(task) = holder.task() else {
            return Ok(vec![]);
        };
        if task.state() != TaskState::Accepted || task.is_pod_created() {
            debug!(task_id = %task.id, state = ?task.state(), "launch ignorado: la tarea ya avanzó");
            return Ok(vec![]);
        }

        let now = self.ctx.now();
        match self.ctx.substrate.launch_task(job, task).await {
            Ok(()) => {
                let launched = task
                    .with_context(TASK_ATTRIBUTES_POD_CREATED, "true")
                    .with_status(TaskStatus::new(
                        TaskState::Accepted,
                        TaskStatus::REASON_POD_CREATED,
                        "Pod created in the execution substrate",
                        now,
                    ));
                info!(job_id = %job.id, task_id = %task.id, "pod creado");
                Ok(ModelActionHolder::reference_and_running(ModelAction::new(
                    ModelChange::UpdateTask(launched),
                    "Pod created",
                    self.call_metadata.clone(),
                )))
            }
            Err(e) => {
                let reason = self.ctx.substrate.resolve_reason_code(&e);
                warn!(job_id = %job.id, task_id = %task.id, reason = %reason, "no se pudo crear el pod: {e}");
                let finished = task.with_status(TaskStatus::new(
                    TaskState::Finished,
                    reason,
                    format!("Failed to create pod: {e}"),
                    now,
                ));
                Ok(finished_task_updates(
                    &self.ctx,
                    views,
                    holder,
                    &finished,
                    "Pod creation failure",
                    &self.call_metadata,
                ))
            }
        }
    }
}

/* ----------------------- writeReferenceTaskToStore ----------------------- */

struct WriteReferenceTaskToStore {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
    task_id: String,
}

/// Persiste la versión de referencia de la tarea y la refleja en el modelo store.
pub fn write_reference_task_to_store(ctx: Arc<JobManagerContext>, task_id: &str) -> BoxedChangeAction {
    Box::new(WriteReferenceTaskToStore {
        descriptor: ActionDescriptor::new(
            "writeReferenceTaskToStore",
            task_id,
            Trigger::Reconciler,
            "Writing runtime task changes to store",
        ),
        ctx,
        task_id: task_id.to_string(),
    })
}

#[async_trait]
impl ChangeAction for WriteReferenceTaskToStore {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let Some(holder) = expect_task_holder(&self.ctx, views, &self.task_id, self.descriptor.name)
        else {
            return Ok(vec![]);
        };
        let Some(task) = holder.task() else {
            return Ok(vec![]);
        };

        self.ctx.store.update_task(task).await?;
        if task.state().is_terminal() {
            self.ctx.scheduling.remove_task(&task.id);
        }
        debug!(task_id = %task.id, state = ?task.state(), "tarea persistida");

        Ok(vec![ModelActionHolder::store(ModelAction::new(
            ModelChange::SetTaskHolder(JobHolder::for_task(task.clone())),
            "Updating task in store model",
            CallMetadata::reconciler(self.descriptor.summary.clone()),
        ))])
    }
}

/* --------------------- updateTaskAndWriteItToStore --------------------- */

struct UpdateTaskAndWriteItToStore {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
    task_id: String,
    change: TaskChange,
    call_metadata: CallMetadata,
}

/// Cambio pedido por un usuario: se persiste primero y recién después se
/// refleja en referencia y store.
pub fn update_task_and_write_it_to_store(
    ctx: Arc<JobManagerContext>,
    task_id: &str,
    change: TaskChange,
    summary: &str,
    call_metadata: CallMetadata,
) -> BoxedChangeAction {
    Box::new(UpdateTaskAndWriteItToStore {
        descriptor: ActionDescriptor::new(
            "updateTaskAndWriteItToStore",
            task_id,
            Trigger::User,
            summary,
        ),
        ctx,
        task_id: task_id.to_string(),
        change,
        call_metadata,
    })
}

#[async_trait]
impl ChangeAction for UpdateTaskAndWriteItToStore {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let task = views
            .reference
            .find_task(&self.task_id)
            .ok_or_else(|| JobManagerError::TaskNotFound(self.task_id.clone()))?;

        let updated = (self.change)(task);
        self.ctx.store.update_task(&updated).await?;

        Ok(ModelActionHolder::reference_and_store(ModelAction::new(
            ModelChange::UpdateTask(updated),
            self.descriptor.summary.clone(),
            self.call_metadata.clone(),
        )))
    }
}

/* --------------------- updateTaskInRunningModel --------------------- */

struct UpdateTaskInRunningModel {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
    task_id: String,
    change: RunningTaskChange,
    call_metadata: CallMetadata,
}

/// Cambio observado en el sustrato. Actualiza referencia y running; si la
/// tarea terminó, además le calcula la espera de reintento.
pub fn update_task_in_running_model(
    ctx: Arc<JobManagerContext>,
    task_id: &str,
    change: RunningTaskChange,
    summary: &str,
    call_metadata: CallMetadata,
) -> BoxedChangeAction {
    Box::new(UpdateTaskInRunningModel {
        descriptor: ActionDescriptor::new(
            "updateTaskInRunningModel",
            task_id,
            Trigger::Reconciler,
            summary,
        ),
        ctx,
        task_id: task_id.to_string(),
        change,
        call_metadata,
    })
}

#[async_trait]
impl ChangeAction for UpdateTaskInRunningModel {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let Some(holder) = expect_task_holder(&self.ctx, views, &self.task_id, self.descriptor.name)
        else {
            return Ok(vec![]);
        };
        let Some(current) = holder.task() else {
            return Ok(vec![]);
        };
        let Some(updated) = (self.change)(current) else {
            return Ok(vec![]);
        };

        if updated.state().is_terminal() {
            return Ok(finished_task_updates(
                &self.ctx,
                views,
                holder,
                &updated,
                &self.descriptor.summary,
                &self.call_metadata,
            ));
        }

        Ok(ModelActionHolder::reference_and_running(ModelAction::new(
            ModelChange::UpdateTask(updated),
            self.descriptor.summary.clone(),
            self.call_metadata.clone(),
        )))
    }
}
