use common::{Backoff, Job, JobHolder, JobState, Task, TaskState};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

use super::{count_active_not_started_tasks, find_task_state_timeouts, should_retry, DifferenceResolver};
use crate::action::BoxedChangeAction;
use crate::actions::{
    complete_job, create_or_replace_task, kill_all_tasks, remove_job_from_store, schedule_task,
    update_job_in_store, write_reference_task_to_store,
};
use crate::context::JobManagerContext;
use crate::interceptor::RetryActionInterceptor;
use crate::model::ModelViews;
use crate::retryer;

/// Vista de un árbol de job batch: job, tamaño pedido, tareas e índices ocupados.
pub struct BatchJobView<'a> {
    pub holder: &'a JobHolder,
    pub job: &'a Job,
    pub required_size: u32,
    pub tasks: Vec<&'a Task>,
    pub indexes: HashSet<u32>,
}

impl<'a> BatchJobView<'a> {
    pub fn new(holder: &'a JobHolder) -> Option<Self> {
        let job = holder.job()?;
        let required_size = job.batch_ext()?.size;
        let tasks: Vec<&Task> = holder.tasks().collect();
        let indexes = tasks.iter().map(|t| t.index).collect();
        Some(Self {
            holder,
            job,
            required_size,
            tasks,
            indexes,
        })
    }
}

/// Resolver de jobs batch.
///
/// Primero sincroniza el store con la referencia (con backoff si el store
/// viene fallando), después sincroniza el sustrato, y si no queda nada por
/// hacer cierra el job.
pub struct BatchDifferenceResolver {
    ctx: Arc<JobManagerContext>,
    store_write_retry_interceptor: Arc<RetryActionInterceptor>,
}

impl BatchDifferenceResolver {
    pub fn new(ctx: Arc<JobManagerContext>) -> Self {
        let interceptor = RetryActionInterceptor::new(
            "storeWrite",
            Backoff::Exponential {
                initial_delay_ms: ctx.config.store_write_retry_initial_delay_ms,
                max_delay_ms: ctx.config.store_write_retry_max_delay_ms,
            },
            ctx.clock.clone(),
        );
        Self {
            ctx,
            store_write_retry_interceptor: interceptor,
        }
    }

    pub fn store_write_retry_interceptor(&self) -> &Arc<RetryActionInterceptor> {
        &self.store_write_retry_interceptor
    }

    fn create_new_task_action(&self, job_id: &str, index: u32) -> BoxedChangeAction {
        self.store_write_retry_interceptor
            .apply(create_or_replace_task(self.ctx.clone(), job_id, index))
    }

    fn apply_store(&self, views: &ModelViews, ref_view: &BatchJobView, allowed_new_tasks: &mut u32) -> Vec<BoxedChangeAction> {
        if !self.store_write_retry_interceptor.execution_limits(&views.store) {
            return vec![];
        }

        let mut actions = Vec::new();
        let job = ref_view.job;
        if views.reference.entity() != views.store.entity() {
            actions.push(
                self.store_write_retry_interceptor
                    .apply(update_job_in_store(self.ctx.clone(), &job.id)),
            );
        }

        let now = self.ctx.now();
        let is_job_terminating = job.state() == JobState::KillInitiated;
        for reference_task in views.reference.children() {
            let Some(task) = reference_task.task() else {
                continue;
            };
            let in_sync = views
                .store
                .find_child_by_id(reference_task.id())
                .map(|store_holder| store_holder == reference_task)
                .unwrap_or(false);
            let retry = !is_job_terminating && should_retry(job, task) && *allowed_new_tasks > 0;

            if in_sync {
                if retry && retryer::should_retry_now(reference_task, now) {
                    actions.push(self.create_new_task_action(&job.id, task.index));
                }
            } else {
                actions.push(
                    self.store_write_retry_interceptor
                        .apply(write_reference_task_to_store(self.ctx.clone(), &task.id)),
                );
            }
            // se cuentan tanto los reintentos inmediatos como los demorados
            if retry {
                *allowed_new_tasks -= 1;
            }
        }
        actions
    }

    fn apply_runtime(&self, views: &ModelViews, ref_view: &BatchJobView, allowed_new_tasks: &mut u32) -> Vec<BoxedChangeAction> {
        match ref_view.job.state() {
            JobState::KillInitiated => return kill_all_tasks(&self.ctx, views),
            JobState::Finished => return vec![],
            JobState::Accepted => {}
        }

        let mut actions = self.find_job_size_inconsistencies(views, ref_view, allowed_new_tasks);
        actions.extend(self.find_missing_running_tasks(views, ref_view));
        actions.extend(find_task_state_timeouts(&self.ctx, views));
        actions
    }

    /// Índices sin tarea, del más bajo al más alto, hasta agotar el presupuesto.
    fn find_job_size_inconsistencies(
        &self,
        views: &ModelViews,
        ref_view: &BatchJobView,
        allowed_new_tasks: &mut u32,
    ) -> Vec<BoxedChangeAction> {
        let can_update_store = self.store_write_retry_interceptor.execution_limits(&views.store);
        if !can_update_store || ref_view.tasks.len() as u32 >= ref_view.required_size {
            return vec![];
        }

        let mut missing = Vec::new();
        for index in 0..ref_view.required_size {
            if *allowed_new_tasks == 0 {
                break;
            }
            if !ref_view.indexes.contains(&index) {
                *allowed_new_tasks -= 1;
                missing.push(self.create_new_task_action(&ref_view.job.id, index));
            }
        }
        missing
    }

    fn find_missing_running_tasks(&self, views: &ModelViews, ref_view: &BatchJobView) -> Vec<BoxedChangeAction> {
        ref_view
            .tasks
            .iter()
            .filter(|task| task.state() != TaskState::Finished)
            .filter(|task| views.running.find_child_by_id(&task.id).is_none())
            .map(|task| schedule_task(self.ctx.clone(), task))
            .collect()
    }

    fn remove_completed_job(&self, views: &ModelViews, ref_view: &BatchJobView) -> Vec<BoxedChangeAction> {
        let job = ref_view.job;
        if job.state() != JobState::Finished {
            if all_done(views, ref_view) {
                return vec![complete_job(self.ctx.clone(), &job.id)];
            }
            return vec![];
        }

        let store_finished = views
            .store
            .job()
            .map(|j| j.state() == JobState::Finished)
            .unwrap_or(false);
        if store_finished && !views.is_closed() {
            return vec![remove_job_from_store(self.ctx.clone(), &job.id)];
        }
        vec![]
    }
}

/// Todas las tareas terminaron, están persistidas y ninguna se va a
/// reintentar. Mientras el job siga aceptado además cada posición tiene que
/// tener su tarea; un job matado puede cerrar con posiciones vacías.
fn all_done(views: &ModelViews, ref_view: &BatchJobView) -> bool {
    let terminating = ref_view.job.state() == JobState::KillInitiated;
    if !terminating && (ref_view.tasks.len() as u32) < ref_view.required_size {
        return false;
    }
    views.reference.children().iter().all(|holder| {
        let Some(task) = holder.task() else {
            return true;
        };
        task.state() == TaskState::Finished
            && !should_retry(ref_view.job, task)
            && views.store.find_child_by_id(holder.id()) == Some(holder)
    })
}

impl DifferenceResolver for BatchDifferenceResolver {
    fn apply(&self, views: &ModelViews) -> Vec<BoxedChangeAction> {
        let Some(ref_view) = BatchJobView::new(&views.reference) else {
            self.ctx.code_invariants.inconsistent(format_args!(
                "el job {} no es batch o su raíz no es un job",
                views.reference.id()
            ));
            return vec![];
        };

        let active_not_started = count_active_not_started_tasks(&views.reference, &views.running);
        let mut allowed_new_tasks = self
            .ctx
            .config
            .active_not_started_tasks_limit
            .saturating_sub(active_not_started);

        let mut actions = self.apply_store(views, &ref_view, &mut allowed_new_tasks);
        actions.extend(self.apply_runtime(views, &ref_view, &mut allowed_new_tasks));

        if actions.is_empty() {
            actions.extend(self.remove_completed_job(views, &ref_view));
        }

        trace!(
            job_id = %ref_view.job.id,
            actions = actions.len(),
            active_not_started,
            "resolver evaluado"
        );
        actions
    }

    fn job_closed(&self, job_id: &str) {
        self.store_write_retry_interceptor.forget(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{harness, Harness};
    use crate::config::JobManagerConfig;
    use crate::model::ModelActionHolder;
    use crate::retryer::ATTR_TASK_RETRY_DELAY_MS;
    use common::{HolderTag, JobDescriptor, JobStatus, RetryPolicy, TaskStatus, TASK_ATTRIBUTES_POD_CREATED};

    fn config(limit: u32) -> JobManagerConfig {
        JobManagerConfig {
            active_not_started_tasks_limit: limit,
            ..JobManagerConfig::default()
        }
    }

    fn new_views(size: u32, retries: u32) -> ModelViews {
        ModelViews::new(Job::new(
            JobDescriptor::batch("resolver", size, RetryPolicy::immediate(retries)),
            0,
        ))
    }

    fn names(actions: &[BoxedChangeAction]) -> Vec<&'static str> {
        actions.iter().map(|a| a.descriptor().name).collect()
    }

    async fn run(actions: Vec<BoxedChangeAction>, views: &mut ModelViews) {
        let snapshot = views.clone();
        let mut all: Vec<ModelActionHolder> = Vec::new();
        for action in actions {
            if let Ok(updates) = action.apply(&snapshot).await {
                all.extend(updates);
            }
        }
        for u in &all {
            views.apply(u);
        }
    }

    fn put_task(views: &mut ModelViews, task: &Task, running: bool) {
        let holder = JobHolder::for_task(task.clone());
        views.reference = views.reference.add_child(holder.clone());
        views.store = views.store.add_child(holder.clone());
        if running {
            views.running = views.running.add_child(holder);
        }
    }

    #[tokio::test]
    async fn job_nuevo_crea_todos_los_indices_dentro_del_presupuesto() {
        let h = harness(config(5));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let mut views = new_views(3, 0);

        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["createOrReplaceBatchTask"; 3]);

        run(actions, &mut views).await;
        let mut indexes: Vec<u32> = views.reference.tasks().map(|t| t.index).collect();
        indexes.sort();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(views.store, views.reference);

        // siguiente ciclo: las tres se programan
        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["scheduleTask"; 3]);
        run(actions, &mut views).await;
        assert_eq!(h.scheduling.queued().len(), 3);
        assert_eq!(views.running.tasks().count(), 3);

        // y después no queda nada por hacer
        assert!(resolver.apply(&views).is_empty());
    }

    #[tokio::test]
    async fn presupuesto_limita_las_creaciones_a_los_indices_mas_bajos() {
        let h = harness(config(2));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let mut views = new_views(5, 0);

        run(resolver.apply(&views), &mut views).await;
        let mut indexes: Vec<u32> = views.reference.tasks().map(|t| t.index).collect();
        indexes.sort();
        assert_eq!(indexes, vec![0, 1]);

        // las dos siguen Accepted: no hay lugar para más
        let actions = resolver.apply(&views);
        assert!(!names(&actions).contains(&"createOrReplaceBatchTask"));
    }

    fn views_with_delayed_retry(h: &Harness) -> ModelViews {
        let mut views = new_views(3, 5);
        let job_id = views.reference.id().to_string();
        let now = h.ctx.now();

        // índice 0 falló y espera su reintento; los índices 1 y 2 faltan
        let failed = Task::new_batch_task(&job_id, 0, now)
            .with_status(TaskStatus::new(TaskState::Finished, TaskStatus::REASON_FAILED, "", now));
        put_task(&mut views, &failed, true);
        views.reference = views.reference.add_child(
            JobHolder::for_task(failed).add_tag(ATTR_TASK_RETRY_DELAY_MS, HolderTag::Millis(60_000)),
        );
        views
    }

    #[tokio::test]
    async fn reintento_demorado_consume_presupuesto() {
        let h = harness(config(1));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let views = views_with_delayed_retry(&h);

        // la única plaza la reserva el reintento pendiente
        assert!(resolver.apply(&views).is_empty());

        let h = harness(config(2));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let views = views_with_delayed_retry(&h);
        let job_id = views.reference.id().to_string();

        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["createOrReplaceBatchTask"]);
        assert_eq!(actions[0].descriptor().id, format!("{job_id}#1"));
    }

    fn views_with_two_failures(h: &Harness) -> (ModelViews, Task, Task) {
        let mut views = new_views(3, 5);
        let job_id = views.reference.id().to_string();
        let now = h.ctx.now();

        // índice 0 ya cumplió su espera, índice 1 todavía no; índice 2 falta
        let elapsed = Task::new_batch_task(&job_id, 0, now - 2_000)
            .with_status(TaskStatus::new(TaskState::Finished, TaskStatus::REASON_FAILED, "", now - 2_000));
        let delayed = Task::new_batch_task(&job_id, 1, now)
            .with_status(TaskStatus::new(TaskState::Finished, TaskStatus::REASON_FAILED, "", now));
        put_task(&mut views, &elapsed, true);
        put_task(&mut views, &delayed, true);
        views.reference = views.reference.add_child(
            JobHolder::for_task(elapsed.clone()).add_tag(ATTR_TASK_RETRY_DELAY_MS, HolderTag::Millis(1_000)),
        );
        views.reference = views.reference.add_child(
            JobHolder::for_task(delayed.clone()).add_tag(ATTR_TASK_RETRY_DELAY_MS, HolderTag::Millis(60_000)),
        );
        (views, elapsed, delayed)
    }

    #[tokio::test]
    async fn reintentos_vencidos_y_demorados_se_cobran_del_presupuesto() {
        let h = harness(config(5));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let (mut views, elapsed, delayed) = views_with_two_failures(&h);
        let job_id = views.reference.id().to_string();

        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["createOrReplaceBatchTask"; 2]);
        let ids: Vec<&str> = actions.iter().map(|a| a.descriptor().id.as_str()).collect();
        assert_eq!(ids, vec![format!("{job_id}#{}", elapsed.index), format!("{job_id}#2")]);

        run(actions, &mut views).await;
        let mut by_index: Vec<(u32, String)> =
            views.reference.tasks().map(|t| (t.index, t.id.clone())).collect();
        by_index.sort();
        assert_eq!(by_index.len(), 3);
        assert_ne!(by_index[0].1, elapsed.id);
        assert_eq!(by_index[1].1, delayed.id);
        assert_eq!(by_index[2].0, 2);
    }

    #[tokio::test]
    async fn dos_reintentos_y_una_creacion_consumen_tres_plazas() {
        // con 3 plazas alcanza para todo
        let h = harness(config(3));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let (views, _, _) = views_with_two_failures(&h);
        assert_eq!(resolver.apply(&views).len(), 2);

        // con 2 los reintentos se llevan todo y el índice 2 espera
        let h = harness(config(2));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let (views, elapsed, _) = views_with_two_failures(&h);
        let job_id = views.reference.id().to_string();
        let actions = resolver.apply(&views);
        let ids: Vec<&str> = actions.iter().map(|a| a.descriptor().id.as_str()).collect();
        assert_eq!(ids, vec![format!("{job_id}#{}", elapsed.index)]);
    }

    #[tokio::test]
    async fn tarea_fallida_se_reemplaza_cuando_vence_la_espera() {
        let h = harness(config(10));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let mut views = new_views(1, 2);
        let job_id = views.reference.id().to_string();
        let now = h.ctx.now();

        let failed = Task::new_batch_task(&job_id, 0, now)
            .with_status(TaskStatus::new(TaskState::Finished, TaskStatus::REASON_FAILED, "", now));
        put_task(&mut views, &failed, true);
        views.reference = views.reference.add_child(
            JobHolder::for_task(failed.clone()).add_tag(ATTR_TASK_RETRY_DELAY_MS, HolderTag::Millis(2_000)),
        );

        assert!(resolver.apply(&views).is_empty());

        h.clock.advance(2_000);
        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["createOrReplaceBatchTask"]);

        run(actions, &mut views).await;
        let replacement = views.reference.tasks().next().unwrap();
        assert_eq!(replacement.resubmit_of.as_deref(), Some(failed.id.as_str()));
        assert_eq!(replacement.index, 0);
    }

    #[tokio::test]
    async fn referencia_distinta_del_store_se_persiste() {
        let h = harness(config(10));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let mut views = new_views(1, 0);
        let job_id = views.reference.id().to_string();
        let task = Task::new_batch_task(&job_id, 0, 0);
        put_task(&mut views, &task, true);

        let started = task.with_status(TaskStatus::new(TaskState::Started, "normal", "", 5));
        views.reference = views.reference.add_child(JobHolder::for_task(started.clone()));

        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["writeReferenceTaskToStore"]);
        run(actions, &mut views).await;
        assert_eq!(views.store.find_task(&task.id), Some(&started));
        assert!(resolver.apply(&views).is_empty());
    }

    #[tokio::test]
    async fn store_caido_aplica_backoff() {
        let h: Harness = harness(config(10));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let mut views = new_views(1, 0);

        h.store.fail_next_writes(1);
        run(resolver.apply(&views), &mut views).await;
        assert_eq!(views.reference.tasks().count(), 0);

        h.clock.advance(2_000);
        assert!(resolver.apply(&views).is_empty());

        h.clock.advance(4_000);
        assert_eq!(names(&resolver.apply(&views)), vec!["createOrReplaceBatchTask"]);
    }

    #[tokio::test]
    async fn kill_initiated_solo_emite_kills() {
        let h = harness(config(10));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let mut views = new_views(3, 0);
        let job_id = views.reference.id().to_string();

        let t0 = Task::new_batch_task(&job_id, 0, 0);
        let t1 = Task::new_batch_task(&job_id, 1, 0)
            .with_context(TASK_ATTRIBUTES_POD_CREATED, "true")
            .with_status(TaskStatus::new(TaskState::Started, "normal", "", 1));
        put_task(&mut views, &t0, true);
        put_task(&mut views, &t1, true);

        let killing = views.job().unwrap().with_status(JobStatus::new(
            JobState::KillInitiated,
            JobStatus::REASON_KILLED,
            "user",
            1,
        ));
        views.reference = views.reference.set_entity(common::JobEntity::Job(killing.clone()));
        views.store = views.store.set_entity(common::JobEntity::Job(killing));

        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["killTask", "killTask"]);
    }

    #[tokio::test]
    async fn job_terminado_se_completa_persiste_y_cierra() {
        let h = harness(config(10));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let mut views = new_views(1, 0);
        let job_id = views.reference.id().to_string();
        let done = Task::new_batch_task(&job_id, 0, 0)
            .with_status(TaskStatus::new(TaskState::Finished, TaskStatus::REASON_NORMAL, "", 1));
        put_task(&mut views, &done, false);

        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["completeJob"]);
        run(actions, &mut views).await;

        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["updateJobInStore"]);
        run(actions, &mut views).await;

        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["removeJobFromStore"]);
        run(actions, &mut views).await;

        assert!(views.is_closed());
        assert!(resolver.apply(&views).is_empty());
    }

    #[tokio::test]
    async fn job_matado_cierra_aunque_falten_posiciones() {
        let h = harness(config(10));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let mut views = new_views(3, 0);
        let job_id = views.reference.id().to_string();
        let killed = Task::new_batch_task(&job_id, 0, 0)
            .with_status(TaskStatus::new(TaskState::Finished, TaskStatus::REASON_TASK_KILLED, "", 1));
        put_task(&mut views, &killed, false);

        let killing = views.job().unwrap().with_status(JobStatus::new(
            JobState::KillInitiated,
            JobStatus::REASON_KILLED,
            "user",
            1,
        ));
        views.reference = views.reference.set_entity(common::JobEntity::Job(killing.clone()));
        views.store = views.store.set_entity(common::JobEntity::Job(killing));

        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["completeJob"]);
        run(actions, &mut views).await;
        let job = views.job().unwrap();
        assert_eq!(job.state(), JobState::Finished);
        assert_eq!(job.status.reason_code, JobStatus::REASON_KILLED);
    }

    #[tokio::test]
    async fn tarea_colgada_en_launched_se_mata() {
        let h = harness(config(10));
        let resolver = BatchDifferenceResolver::new(h.ctx.clone());
        let mut views = new_views(1, 0);
        let job_id = views.reference.id().to_string();
        let now = h.ctx.now();
        let launched = Task::new_batch_task(&job_id, 0, now)
            .with_context(TASK_ATTRIBUTES_POD_CREATED, "true")
            .with_status(TaskStatus::new(TaskState::Launched, "normal", "", now));
        put_task(&mut views, &launched, true);

        assert!(resolver.apply(&views).is_empty());

        h.clock.advance(h.ctx.config.task_in_launched_state_timeout_ms as i64);
        let actions = resolver.apply(&views);
        assert_eq!(names(&actions), vec!["killTask"]);
        run(actions, &mut views).await;

        let t = views.reference.find_task(&launched.id).unwrap();
        assert_eq!(t.state(), TaskState::KillInitiated);
        assert_eq!(t.status.reason_code, TaskStatus::REASON_STUCK_IN_STATE);
    }
}
