use common::{
    CallMetadata, HolderTag, Job, JobDescriptor, JobId, JobType, Task, TaskState, TaskStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::action::BoxedChangeAction;
use crate::actions::{self, RunningTaskChange, TaskChange};
use crate::context::JobManagerContext;
use crate::engine::ReconciliationEngine;
use crate::error::{JobManagerError, Result};
use crate::model::{ModelViews, ATTR_CALL_METADATA};
use crate::resolver::{BatchDifferenceResolver, DifferenceResolver};

struct EngineCommand {
    action: BoxedChangeAction,
    reply: Option<oneshot::Sender<Result<()>>>,
}

struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    views: watch::Receiver<ModelViews>,
}

/// Punto de entrada del control loop.
///
/// Cada job activo tiene su engine corriendo en su propia task de tokio;
/// los pedidos de usuario y los eventos del sustrato le llegan por un canal
/// y se ejecutan entre ciclos. Después de cada ciclo el engine publica un
/// snapshot de sus modelos para las consultas.
#[derive(Clone)]
pub struct JobManager {
    ctx: Arc<JobManagerContext>,
    resolver: Arc<BatchDifferenceResolver>,
    engines: Arc<Mutex<HashMap<JobId, EngineHandle>>>,
}

impl JobManager {
    pub fn new(ctx: Arc<JobManagerContext>) -> Self {
        Self {
            resolver: Arc::new(BatchDifferenceResolver::new(ctx.clone())),
            ctx,
            engines: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &Arc<JobManagerContext> {
        &self.ctx
    }

    fn engines(&self) -> MutexGuard<'_, HashMap<JobId, EngineHandle>> {
        self.engines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /* ------------------------------ ciclo de vida ------------------------------ */

    /// Persiste el job y arranca su engine. Sólo jobs batch.
    pub async fn create_job(&self, descriptor: JobDescriptor, call_metadata: CallMetadata) -> Result<JobId> {
        let job = Job::new(descriptor, self.ctx.now());
        if job.job_type() != JobType::Batch {
            return Err(JobManagerError::UnsupportedJobType(job.job_type()));
        }
        if self.engines().contains_key(&job.id) {
            return Err(JobManagerError::JobAlreadyExists(job.id));
        }

        self.ctx.store.store_job(&job).await?;
        info!(
            job_id = %job.id,
            name = %job.descriptor.name,
            size = job.batch_ext().map(|e| e.size).unwrap_or(0),
            caller = %call_metadata.caller_id,
            "job aceptado"
        );

        let job_id = job.id.clone();
        let mut views = ModelViews::new(job);
        views.reference = views
            .reference
            .add_tag(ATTR_CALL_METADATA, HolderTag::CallMetadata(call_metadata));
        self.start_engine(views);
        Ok(job_id)
    }

    /// Levanta un engine por cada job batch que haya en el store.
    pub async fn bootstrap(&self) -> Result<usize> {
        let jobs = self.ctx.store.retrieve_jobs().await?;
        let mut started = 0;
        for job in jobs {
            if job.job_type() != JobType::Batch {
                warn!(job_id = %job.id, "job no batch en el store, se ignora");
                continue;
            }
            if self.engines().contains_key(&job.id) {
                continue;
            }
            let tasks = self.ctx.store.retrieve_tasks_for_job(&job.id).await?;
            info!(job_id = %job.id, tasks = tasks.len(), state = ?job.state(), "job recuperado del store");
            self.start_engine(ModelViews::restored(job, tasks));
            started += 1;
        }
        Ok(started)
    }

    /// Detiene todos los engines. Lo pendiente en sus colas se descarta.
    pub fn shutdown(&self) {
        let mut engines = self.engines();
        info!(engines = engines.len(), "deteniendo engines");
        engines.clear();
    }

    fn start_engine(&self, views: ModelViews) {
        let job_id = views.reference.id().to_string();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (views_tx, views_rx) = watch::channel(views.clone());
        let engine = ReconciliationEngine::new(views, self.resolver.clone());

        self.engines().insert(
            job_id,
            EngineHandle {
                commands: commands_tx,
                views: views_rx,
            },
        );

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_engine_loop(engine, commands_rx, views_tx).await;
        });
    }

    async fn run_engine_loop(
        self,
        mut engine: ReconciliationEngine,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
        views_tx: watch::Sender<ModelViews>,
    ) {
        let job_id = engine.job_id().to_string();
        let active = Duration::from_millis(self.ctx.config.reconciler_active_interval_ms);
        let idle = Duration::from_millis(self.ctx.config.reconciler_idle_interval_ms);
        let mut pause = Duration::ZERO;
        debug!(job_id = %job_id, "engine arrancado");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(EngineCommand { action, reply }) => engine.enqueue(action, reply),
                    None => {
                        info!(job_id = %job_id, "engine detenido");
                        break;
                    }
                },
                _ = tokio::time::sleep(pause) => {}
            }
            while let Ok(EngineCommand { action, reply }) = commands.try_recv() {
                engine.enqueue(action, reply);
            }

            let executed = engine.run_cycle().await;
            views_tx.send_replace(engine.views().clone());

            if engine.is_closed() {
                info!(job_id = %job_id, "job cerrado, engine retirado");
                break;
            }
            pause = if executed > 0 || engine.has_pending() {
                active
            } else {
                idle
            };
        }

        self.engines().remove(&job_id);
        self.resolver.job_closed(&job_id);
    }

    /* ----------------------------- operaciones ----------------------------- */

    fn send(&self, job_id: &str, action: BoxedChangeAction, reply: Option<oneshot::Sender<Result<()>>>) -> Result<()> {
        let engines = self.engines();
        let handle = engines
            .get(job_id)
            .ok_or_else(|| JobManagerError::JobNotFound(job_id.to_string()))?;
        handle
            .commands
            .send(EngineCommand { action, reply })
            .map_err(|_| JobManagerError::EngineClosed(job_id.to_string()))
    }

    /// Encola la acción y espera a que el engine la ejecute.
    async fn submit(&self, job_id: &str, action: BoxedChangeAction) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(job_id, action, Some(tx))?;
        rx.await
            .map_err(|_| JobManagerError::EngineClosed(job_id.to_string()))?
    }

    pub async fn kill_job(&self, job_id: &str, reason: &str, call_metadata: CallMetadata) -> Result<()> {
        let action = actions::kill_job(self.ctx.clone(), job_id, reason, call_metadata);
        self.submit(job_id, action).await
    }

    /// Cambio de usuario sobre una tarea: se persiste antes de verse en los modelos.
    pub async fn update_task(
        &self,
        job_id: &str,
        task_id: &str,
        change: TaskChange,
        summary: &str,
        call_metadata: CallMetadata,
    ) -> Result<()> {
        let action = actions::update_task_and_write_it_to_store(
            self.ctx.clone(),
            task_id,
            change,
            summary,
            call_metadata,
        );
        self.submit(job_id, action).await
    }

    /// Evento de estado del sustrato. Transiciones hacia atrás o repetidas se descartan.
    pub fn handle_task_status(&self, job_id: &str, task_id: &str, status: TaskStatus) -> Result<()> {
        let summary = format!("Task state change reported by the substrate: {:?}", status.state);
        let change: RunningTaskChange = Box::new(move |current: &Task| {
            if current.state() == status.state {
                return None;
            }
            let mut next = status.clone();
            // un kill pedido conserva su motivo al terminar
            if current.state() == TaskState::KillInitiated && next.state == TaskState::Finished {
                next.reason_code = current.status.reason_code.clone();
            }
            match current.transition(next) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!("evento del sustrato descartado: {e}");
                    None
                }
            }
        });
        let action = actions::update_task_in_running_model(
            self.ctx.clone(),
            task_id,
            change,
            &summary,
            CallMetadata::reconciler(summary.clone()),
        );
        self.send(job_id, action, None)
    }

    /// El placement asignó la tarea: toca crear el pod.
    pub fn handle_task_placed(&self, job_id: &str, task_id: &str) -> Result<()> {
        let action = actions::launch_task(self.ctx.clone(), task_id);
        self.send(job_id, action, None)
    }

    /* ------------------------------- consultas ------------------------------- */

    pub fn find_job(&self, job_id: &str) -> Option<Job> {
        let engines = self.engines();
        let handle = engines.get(job_id)?;
        let views = handle.views.borrow();
        views.job().cloned()
    }

    pub fn find_tasks(&self, job_id: &str) -> Vec<Task> {
        let engines = self.engines();
        let tasks = match engines.get(job_id) {
            Some(handle) => handle.views.borrow().reference.tasks().cloned().collect(),
            None => Vec::new(),
        };
        tasks
    }

    /// Último snapshot publicado por el engine del job.
    pub fn job_views(&self, job_id: &str) -> Option<ModelViews> {
        let engines = self.engines();
        engines.get(job_id).map(|handle| handle.views.borrow().clone())
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.engines().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Espera hasta que los modelos del job cumplan `condition`.
    /// `Ok(false)` si se venció el timeout o el engine se retiró antes.
    pub async fn wait_until<F>(&self, job_id: &str, timeout: Duration, mut condition: F) -> Result<bool>
    where
        F: FnMut(&ModelViews) -> bool,
    {
        let mut views = {
            let engines = self.engines();
            let handle = engines
                .get(job_id)
                .ok_or_else(|| JobManagerError::JobNotFound(job_id.to_string()))?;
            handle.views.clone()
        };

        let wait = async {
            loop {
                if condition(&views.borrow_and_update()) {
                    return true;
                }
                if views.changed().await.is_err() {
                    return condition(&views.borrow());
                }
            }
        };
        Ok(tokio::time::timeout(timeout, wait).await.unwrap_or(false))
    }

    pub async fn wait_until_closed(&self, job_id: &str, timeout: Duration) -> Result<bool> {
        self.wait_until(job_id, timeout, |views| views.is_closed()).await
    }
}
