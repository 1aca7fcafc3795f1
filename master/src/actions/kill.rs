use async_trait::async_trait;
use common::{CallMetadata, Task, TaskState, TaskStatus};
use std::sync::Arc;
use tracing::{debug, info};

use super::{expect_task_holder, finished_task_updates, update_task_in_running_model};
use crate::action::{ActionDescriptor, BoxedChangeAction, ChangeAction, Trigger};
use crate::context::JobManagerContext;
use crate::error::Result;
use crate::model::{ModelAction, ModelActionHolder, ModelChange, ModelViews};
use crate::retryer;

struct KillTask {
    descriptor: ActionDescriptor,
    ctx: Arc<JobManagerContext>,
    task_id: String,
    reason_code: String,
    reason_message: String,
    call_metadata: CallMetadata,
}

/// Mata una tarea. Si el sustrato todavía no creó el pod, la tarea termina
/// acá mismo; si no, se pide el kill y la tarea queda en KillInitiated.
pub fn kill_task(
    ctx: Arc<JobManagerContext>,
    task_id: &str,
    reason_code: &str,
    reason_message: &str,
    call_metadata: CallMetadata,
) -> BoxedChangeAction {
    Box::new(KillTask {
        descriptor: ActionDescriptor::new(
            "killTask",
            task_id,
            Trigger::Reconciler,
            format!("Killing task: {reason_message}"),
        ),
        ctx,
        task_id: task_id.to_string(),
        reason_code: reason_code.to_string(),
        reason_message: reason_message.to_string(),
        call_metadata,
    })
}

#[async_trait]
impl ChangeAction for KillTask {
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
        if matches!(task.state(), TaskState::KillInitiated | TaskState::Finished) {
            debug!(task_id = %task.id, state = ?task.state(), "kill ignorado");
            return Ok(vec![]);
        }

        let now = self.ctx.now();
        if !task.is_pod_created() {
            let finished = task.with_status(TaskStatus::new(
                TaskState::Finished,
                self.reason_code.clone(),
                self.reason_message.clone(),
                now,
            ));
            info!(task_id = %task.id, reason = %self.reason_code, "tarea sin pod terminada directamente");
            return Ok(finished_task_updates(
                &self.ctx,
                views,
                holder,
                &finished,
                "Task killed before its pod was created",
                &self.call_metadata,
            ));
        }

        self.ctx
            .substrate
            .kill_task(&task.id, &self.reason_message)
            .await?;
        info!(task_id = %task.id, reason = %self.reason_code, "kill pedido al sustrato");

        let killing = task.with_status(TaskStatus::new(
            TaskState::KillInitiated,
            self.reason_code.clone(),
            self.reason_message.clone(),
            now,
        ));
        Ok(ModelActionHolder::reference_and_running(ModelAction::new(
            ModelChange::UpdateTask(killing),
            "Changing task state to KillInitiated",
            self.call_metadata.clone(),
        )))
    }
}

/// La tarea quedó colgada en KillInitiated: se da por terminada.
pub fn finish_stuck_kill(ctx: Arc<JobManagerContext>, task: &Task) -> BoxedChangeAction {
    let clock = ctx.clock.clone();
    update_task_in_running_model(
        ctx,
        &task.id,
        Box::new(move |current: &Task| {
            if current.state() != TaskState::KillInitiated {
                return None;
            }
            Some(current.with_status(TaskStatus::new(
                TaskState::Finished,
                TaskStatus::REASON_STUCK_IN_STATE,
                "Task stuck in KillInitiated state",
                clock.wall_time(),
            )))
        }),
        "Finishing task stuck in KillInitiated state",
        CallMetadata::reconciler("Task stuck in KillInitiated state"),
    )
}

/// Kills para todas las tareas vivas del job (job en KillInitiated).
///
/// Las que ya están en KillInitiated sólo se tocan si pasaron el timeout.
pub fn kill_all_tasks(ctx: &Arc<JobManagerContext>, views: &ModelViews) -> Vec<BoxedChangeAction> {
    let now = ctx.now();
    let timeout = retryer::clamp_millis(ctx.config.task_in_kill_initiated_state_timeout_ms);
    let call_metadata = CallMetadata::reconciler("Killing all tasks of a terminating job");

    views
        .reference
        .tasks()
        .filter_map(|task| match task.state() {
            TaskState::Finished => None,
            TaskState::KillInitiated => {
                let stuck = task
                    .time_in_state(TaskState::KillInitiated, now)
                    .map(|t| t >= timeout)
                    .unwrap_or(false);
                stuck.then(|| finish_stuck_kill(ctx.clone(), task))
            }
            _ => Some(kill_task(
                ctx.clone(),
                &task.id,
                TaskStatus::REASON_TASK_KILLED,
                "Killing task as part of job termination",
                call_metadata.clone(),
            )),
        })
        .collect()
}
