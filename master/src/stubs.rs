//! Colaboradores en memoria para el binario de demo y los tests.
//!
//! El placement asigna cada tarea apenas se encola y el sustrato simula la
//! vida de la tarea emitiendo eventos de estado; `spawn_loopback` devuelve
//! ambos flujos al `JobManager`.

use async_trait::async_trait;
use common::{Job, JobId, Task, TaskId, TaskState, TaskStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::JobManagerConfig;
use crate::context::{CodeInvariants, JobManagerContext};
use crate::error::{JobManagerError, Result};
use crate::manager::JobManager;
use crate::services::{
    ApplicationSla, CapacityGroupService, ExecutionSubstrate, JobStore, QueueableTask,
    SchedulingService, Tier, DEFAULT_CAPACITY_GROUP,
};

/* ------------------------------- store ------------------------------- */

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    tasks: Mutex<HashMap<TaskId, Task>>,
    pending_failures: AtomicU32,
    writes: AtomicU64,
}

impl InMemoryJobStore {
    /// Las próximas `count` escrituras fallan.
    pub fn fail_next_writes(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).get(job_id).cloned()
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).get(task_id).cloned()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn write(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(JobManagerError::Store("fallo inyectado".into()));
        }
        Ok(())
    }

    fn put_task(&self, task: &Task) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone(), task.clone());
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn store_job(&self, job: &Job) -> Result<()> {
        self.write()?;
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        self.store_job(job).await
    }

    async fn delete_job(&self, job: &Job) -> Result<()> {
        self.write()?;
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job.id);
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, t| t.job_id != job.id);
        Ok(())
    }

    async fn store_task(&self, task: &Task) -> Result<()> {
        self.write()?;
        self.put_task(task);
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.write()?;
        self.put_task(task);
        Ok(())
    }

    async fn replace_task(&self, old_task: &Task, new_task: &Task) -> Result<()> {
        self.write()?;
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.remove(&old_task.id);
        tasks.insert(new_task.id.clone(), new_task.clone());
        Ok(())
    }

    async fn retrieve_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    async fn retrieve_tasks_for_job(&self, job_id: &str) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.index);
        Ok(tasks)
    }
}

/* ------------------------------ placement ------------------------------ */

#[derive(Debug, Default)]
pub struct InMemoryScheduling {
    queue: Mutex<Vec<QueueableTask>>,
    removed: Mutex<Vec<TaskId>>,
    placements: Mutex<Option<mpsc::UnboundedSender<QueueableTask>>>,
}

impl InMemoryScheduling {
    /// Placement que asigna cada tarea en cuanto se encola.
    pub fn with_placements() -> (Self, mpsc::UnboundedReceiver<QueueableTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduling = Self {
            placements: Mutex::new(Some(tx)),
            ..Self::default()
        };
        (scheduling, rx)
    }

    pub fn queued(&self) -> Vec<QueueableTask> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn removed(&self) -> Vec<TaskId> {
        self.removed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SchedulingService for InMemoryScheduling {
    fn add_task(&self, task: QueueableTask) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.iter().any(|q| q.task_id == task.task_id) {
                return;
            }
            queue.push(task.clone());
        }
        let placements = self.placements.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = placements.as_ref() {
            let _ = tx.send(task);
        }
    }

    fn remove_task(&self, task_id: &str) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|q| q.task_id != task_id);
        self.removed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task_id.to_string());
    }
}

/* ------------------------------ sustrato ------------------------------ */

/// Cambio de estado de una tarea visto por el sustrato.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatusEvent {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub status: TaskStatus,
}

pub struct InMemorySubstrate {
    clock: Arc<dyn Clock>,
    launched: Mutex<HashMap<TaskId, JobId>>,
    killed: Mutex<Vec<TaskId>>,
    launch_failure: Mutex<Option<(String, u32)>>,
    /// Con qué reason terminan las tareas lanzadas; `None` las deja en Started.
    finish_with: Mutex<Option<String>>,
    events: Option<mpsc::UnboundedSender<TaskStatusEvent>>,
}

impl Default for InMemorySubstrate {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            launched: Mutex::new(HashMap::new()),
            killed: Mutex::new(Vec::new()),
            launch_failure: Mutex::new(None),
            finish_with: Mutex::new(Some(TaskStatus::REASON_NORMAL.to_string())),
            events: None,
        }
    }
}

impl InMemorySubstrate {
    /// Sustrato que reporta la vida de cada tarea por el canal devuelto.
    pub fn with_events(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<TaskStatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let substrate = Self {
            clock,
            events: Some(tx),
            ..Self::default()
        };
        (substrate, rx)
    }

    /// Los próximos `count` lanzamientos fallan con ese reason code.
    pub fn fail_launches_with(&self, reason_code: &str, count: u32) {
        *self.launch_failure.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((reason_code.to_string(), count));
    }

    pub fn finish_tasks_with(&self, reason_code: Option<&str>) {
        *self.finish_with.lock().unwrap_or_else(|e| e.into_inner()) =
            reason_code.map(str::to_string);
    }

    pub fn launched(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn killed(&self) -> Vec<TaskId> {
        self.killed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn take_launch_failure(&self) -> Option<String> {
        let mut failure = self.launch_failure.lock().unwrap_or_else(|e| e.into_inner());
        match failure.as_mut() {
            Some((reason, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(reason.clone())
            }
            _ => None,
        }
    }

    fn emit(&self, job_id: &str, task_id: &str, state: TaskState, reason: &str) {
        if let Some(tx) = &self.events {
            let status = TaskStatus::new(state, reason, format!("{state:?}"), self.clock.wall_time());
            let _ = tx.send(TaskStatusEvent {
                job_id: job_id.to_string(),
                task_id: task_id.to_string(),
                status,
            });
        }
    }
}

#[async_trait]
impl ExecutionSubstrate for InMemorySubstrate {
    async fn launch_task(&self, job: &Job, task: &Task) -> Result<()> {
        if let Some(reason) = self.take_launch_failure() {
            warn!(task_id = %task.id, reason = %reason, "lanzamiento rechazado");
            return Err(JobManagerError::Launch(reason));
        }
        self.launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone(), job.id.clone());

        for state in [TaskState::Launched, TaskState::StartInitiated, TaskState::Started] {
            self.emit(&job.id, &task.id, state, TaskStatus::REASON_NORMAL);
        }
        let finish = self.finish_with.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(reason) = finish {
            self.emit(&job.id, &task.id, TaskState::Finished, &reason);
        }
        debug!(task_id = %task.id, "pod simulado creado");
        Ok(())
    }

    async fn kill_task(&self, task_id: &str, reason: &str) -> Result<()> {
        self.killed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task_id.to_string());
        let job_id = self
            .launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned();
        if let Some(job_id) = job_id {
            self.emit(&job_id, task_id, TaskState::Finished, TaskStatus::REASON_TASK_KILLED);
        }
        debug!(task_id = %task_id, reason = %reason, "pod simulado destruido");
        Ok(())
    }

    fn resolve_reason_code(&self, error: &JobManagerError) -> String {
        match error {
            JobManagerError::Launch(reason) => reason.clone(),
            _ => TaskStatus::REASON_UNKNOWN_SYSTEM_ERROR.to_string(),
        }
    }
}

/* -------------------------- grupos de capacidad -------------------------- */

#[derive(Debug, Default)]
pub struct InMemoryCapacityGroups {
    slas: HashMap<String, ApplicationSla>,
}

impl InMemoryCapacityGroups {
    pub fn with_default() -> Self {
        Self::default().with_group(DEFAULT_CAPACITY_GROUP, Tier::Flex)
    }

    pub fn with_group(mut self, name: &str, tier: Tier) -> Self {
        self.slas.insert(
            name.to_string(),
            ApplicationSla {
                app_name: name.to_string(),
                tier,
            },
        );
        self
    }
}

impl CapacityGroupService for InMemoryCapacityGroups {
    fn find_application_sla(&self, name: &str) -> Option<ApplicationSla> {
        self.slas.get(name).cloned()
    }
}

/* ------------------------------- loopback ------------------------------- */

/// Devuelve al manager las asignaciones del placement y los eventos del sustrato.
pub fn spawn_loopback(
    manager: JobManager,
    mut placements: mpsc::UnboundedReceiver<QueueableTask>,
    mut events: mpsc::UnboundedReceiver<TaskStatusEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(placed) = placements.recv() => {
                    if let Err(e) = manager.handle_task_placed(&placed.job_id, &placed.task_id) {
                        debug!(task_id = %placed.task_id, "asignación descartada: {e}");
                    }
                }
                Some(event) = events.recv() => {
                    if let Err(e) = manager.handle_task_status(&event.job_id, &event.task_id, event.status) {
                        debug!(task_id = %event.task_id, "evento descartado: {e}");
                    }
                }
                else => break,
            }
        }
    })
}

/// Manager armado sobre los colaboradores en memoria, con el loopback corriendo.
pub struct InMemoryStack {
    pub manager: JobManager,
    pub store: Arc<InMemoryJobStore>,
    pub scheduling: Arc<InMemoryScheduling>,
    pub substrate: Arc<InMemorySubstrate>,
    pub loopback: JoinHandle<()>,
}

/// Requiere un runtime de tokio activo.
pub fn in_memory_stack(config: JobManagerConfig, clock: Arc<dyn Clock>) -> InMemoryStack {
    in_memory_stack_with_store(config, clock, Arc::new(InMemoryJobStore::default()))
}

pub fn in_memory_stack_with_store(
    config: JobManagerConfig,
    clock: Arc<dyn Clock>,
    store: Arc<InMemoryJobStore>,
) -> InMemoryStack {
    let (scheduling, placements) = InMemoryScheduling::with_placements();
    let (substrate, events) = InMemorySubstrate::with_events(clock.clone());
    let scheduling = Arc::new(scheduling);
    let substrate = Arc::new(substrate);

    let ctx = Arc::new(JobManagerContext {
        config: Arc::new(config),
        store: store.clone(),
        scheduling: scheduling.clone(),
        substrate: substrate.clone(),
        capacity_groups: Arc::new(InMemoryCapacityGroups::with_default()),
        clock,
        code_invariants: Arc::new(CodeInvariants::default()),
    });
    let manager = JobManager::new(ctx);
    let loopback = spawn_loopback(manager.clone(), placements, events);

    InMemoryStack {
        manager,
        store,
        scheduling,
        substrate,
        loopback,
    }
}
