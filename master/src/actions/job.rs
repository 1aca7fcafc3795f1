use async_trait::async_trait;
use common::{CallMetadata, JobState, JobStatus, TaskStatus};
use std::sync::Arc;
use tracing::info;

use crate::action::{ActionDescriptor, BoxedChangeAction, ChangeAction, Trigger};
use crate::context::JobManagerContext;
use crate::error::{JobManagerError, Result};
use crate::model::{ModelAction, ModelActionHolder, ModelChange, ModelViews};

/* ---------------------------- updateJobInStore ---------------------------- */

struct UpdateJobInStore {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
}

/// Persiste el job de referencia y lo refleja en el modelo store.
pub fn update_job_in_store(ctx: Arc<JobManagerContext>, job_id: &str) -> BoxedChangeAction {
    Box::new(UpdateJobInStore {
        descriptor: ActionDescriptor::new(
            "updateJobInStore",
            job_id,
            Trigger::Reconciler,
            "Updating job record in store",
        ),
        ctx,
    })
}

#[async_trait]
impl ChangeAction for UpdateJobInStore {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let Some(job) = views.job() else {
            return Ok(vec![]);
        };
        self.ctx.store.update_job(job).await?;
        Ok(vec![ModelActionHolder::store(ModelAction::new(
            ModelChange::UpdateJob(job.clone()),
            "Updating job in store model",
            CallMetadata::reconciler(self.descriptor.summary.clone()),
        ))])
    }
}

/* ------------------------------ completeJob ------------------------------ */

struct CompleteJob {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
}

/// Pasa el job a Finished. Sólo cambia la referencia; el store lo alcanza
/// en el ciclo siguiente.
pub fn complete_job(ctx: Arc<JobManagerContext>, job_id: &str) -> BoxedChangeAction {
    Box::new(CompleteJob {
        descriptor: ActionDescriptor::new(
            "completeJob",
            job_id,
            Trigger::Reconciler,
            "Completing job",
        ),
        ctx,
    })
}

#[async_trait]
impl ChangeAction for CompleteJob {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let Some(job) = views.job() else {
            return Ok(vec![]);
        };
        if job.state() == JobState::Finished {
            return Ok(vec![]);
        }

        let reason = if job.state() == JobState::KillInitiated {
            JobStatus::REASON_KILLED
        } else if views
            .reference
            .tasks()
            .all(|t| t.status.reason_code == TaskStatus::REASON_NORMAL)
        {
            JobStatus::REASON_NORMAL
        } else {
            JobStatus::REASON_FAILED
        };

        let finished = job.with_status(JobStatus::new(
            JobState::Finished,
            reason,
            "All tasks finished",
            self.ctx.now(),
        ));
        info!(job_id = %job.id, reason = reason, "job terminado");

        Ok(vec![ModelActionHolder::reference(ModelAction::new(
            ModelChange::UpdateJob(finished),
            "Job finished",
            CallMetadata::reconciler(self.descriptor.summary.clone()),
        ))])
    }
}

/* --------------------------- removeJobFromStore --------------------------- */

struct RemoveJobFromStore {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
}

/// Borra el job terminado del store y marca la referencia como cerrada.
pub fn remove_job_from_store(ctx: Arc<JobManagerContext>, job_id: &str) -> BoxedChangeAction {
    Box::new(RemoveJobFromStore {
        descriptor: ActionDescriptor::new(
            "removeJobFromStore",
            job_id,
            Trigger::Reconciler,
            "Removing finished job from store",
        ),
        ctx,
    })
}

#[async_trait]
impl ChangeAction for RemoveJobFromStore {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let Some(job) = views.job() else {
            return Ok(vec![]);
        };
        self.ctx.store.delete_job(job).await?;
        info!(job_id = %job.id, "job borrado del store");

        Ok(vec![ModelActionHolder::reference(ModelAction::new(
            ModelChange::CloseJob,
            "Closing job",
            CallMetadata::reconciler(self.descriptor.summary.clone()),
        ))])
    }
}

/* -------------------------------- killJob -------------------------------- */

struct KillJob {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
    reason: String,
    call_metadata: CallMetadata,
}

/// Pedido de usuario: el job pasa a KillInitiated (persistido primero).
/// Los kills de las tareas los emite el resolver en los ciclos siguientes.
pub fn kill_job(
    ctx: Arc<JobManagerContext>,
    job_id: &str,
    reason: &str,
    call_metadata: CallMetadata,
) -> BoxedChangeAction {
    Box::new(KillJob {
        descriptor: ActionDescriptor::new("killJob", job_id, Trigger::User, "Killing job"),
        ctx,
        reason: reason.to_string(),
        call_metadata,
    })
}

#[async_trait]
impl ChangeAction for KillJob {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let job = views
            .job()
            .ok_or_else(|| JobManagerError::JobNotFound(self.descriptor.id.clone()))?;
        if job.state() != JobState::Accepted {
            return Ok(vec![]);
        }

        let killing = job.with_status(JobStatus::new(
            JobState::KillInitiated,
            JobStatus::REASON_KILLED,
            self.reason.clone(),
            self.ctx.now(),
        ));
        self.ctx.store.update_job(&killing).await?;
        info!(job_id = %job.id, caller = %self.call_metadata.caller_id, "kill de job pedido");

        Ok(ModelActionHolder::reference_and_store(ModelAction::new(
            ModelChange::UpdateJob(killing),
            "Changing job state to KillInitiated",
            self.call_metadata.clone(),
        )))
    }
}
