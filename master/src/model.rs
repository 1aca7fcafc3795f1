//! Los tres modelos de un job y los cambios puros que se aplican sobre ellos.

use common::{CallMetadata, HolderTag, Job, JobEntity, JobHolder, Task, TaskId, TaskState};

/// Tag en la raíz de referencia: el job ya se borró del store y el engine puede retirarse.
pub const ATTR_JOB_CLOSED: &str = "job.closed";
/// Tag con el `CallMetadata` del último cambio aplicado a un holder.
pub const ATTR_CALL_METADATA: &str = "callMetadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    /// Estado deseado
    Reference,
    /// Lo que reporta el sustrato
    Running,
    /// Lo que está persistido
    Store,
}

#[derive(Debug, Clone)]
pub enum ModelChange {
    UpdateJob(Job),
    /// Reemplaza la entidad conservando los tags del holder; agrega la tarea si no existe.
    UpdateTask(Task),
    /// Pone el holder completo (entidad y tags) tal cual viene.
    SetTaskHolder(JobHolder),
    ReplaceTask {
        old_task_id: TaskId,
        holder: JobHolder,
    },
    RemoveTask(TaskId),
    CloseJob,
}

/// Función pura `raíz -> raíz nueva`, con metadatos de auditoría.
#[derive(Debug, Clone)]
pub struct ModelAction {
    pub change: ModelChange,
    pub summary: String,
    pub call_metadata: CallMetadata,
}

impl ModelAction {
    pub fn new(change: ModelChange, summary: impl Into<String>, call_metadata: CallMetadata) -> Self {
        Self {
            change,
            summary: summary.into(),
            call_metadata,
        }
    }

    pub fn apply(&self, root: &JobHolder) -> JobHolder {
        let audit = HolderTag::CallMetadata(self.call_metadata.clone());
        match &self.change {
            ModelChange::UpdateJob(job) => root
                .set_entity(JobEntity::Job(job.clone()))
                .add_tag(ATTR_CALL_METADATA, audit),
            ModelChange::UpdateTask(task) => {
                let holder = match root.find_child_by_id(&task.id) {
                    Some(existing) => existing.set_entity(JobEntity::Task(task.clone())),
                    None => JobHolder::for_task(task.clone()),
                };
                root.add_child(holder.add_tag(ATTR_CALL_METADATA, audit))
            }
            ModelChange::SetTaskHolder(holder) => {
                root.add_child(holder.add_tag(ATTR_CALL_METADATA, audit))
            }
            ModelChange::ReplaceTask {
                old_task_id,
                holder,
            } => {
                let (without_old, _) = root.remove_child(old_task_id);
                without_old.add_child(holder.add_tag(ATTR_CALL_METADATA, audit))
            }
            ModelChange::RemoveTask(task_id) => root.remove_child(task_id).0,
            ModelChange::CloseJob => root
                .add_tag(ATTR_JOB_CLOSED, HolderTag::Flag(true))
                .add_tag(ATTR_CALL_METADATA, audit),
        }
    }
}

/// Un cambio de modelo dirigido a uno de los tres modelos.
#[derive(Debug, Clone)]
pub struct ModelActionHolder {
    pub model: Model,
    pub action: ModelAction,
}

impl ModelActionHolder {
    pub fn reference(action: ModelAction) -> Self {
        Self {
            model: Model::Reference,
            action,
        }
    }

    pub fn running(action: ModelAction) -> Self {
        Self {
            model: Model::Running,
            action,
        }
    }

    pub fn store(action: ModelAction) -> Self {
        Self {
            model: Model::Store,
            action,
        }
    }

    pub fn reference_and_running(action: ModelAction) -> Vec<Self> {
        vec![Self::reference(action.clone()), Self::running(action)]
    }

    pub fn reference_and_store(action: ModelAction) -> Vec<Self> {
        vec![Self::reference(action.clone()), Self::store(action)]
    }
}

fn is_in_substrate(task: &Task) -> bool {
    match task.state() {
        TaskState::Finished => false,
        TaskState::Accepted => task.is_pod_created(),
        _ => true,
    }
}

/// Snapshot de los tres árboles de un job.
#[derive(Debug, Clone)]
pub struct ModelViews {
    pub reference: JobHolder,
    pub running: JobHolder,
    pub store: JobHolder,
}

impl ModelViews {
    /// Job recién creado: ya está persistido, sin tareas.
    pub fn new(job: Job) -> Self {
        let root = JobHolder::for_job(job);
        Self {
            reference: root.clone(),
            running: root.clone(),
            store: root,
        }
    }

    /// Job recuperado del store en el arranque.
    ///
    /// Referencia y store arrancan iguales. El modelo running sólo recibe las
    /// tareas vivas que ya llegaron al sustrato: las Accepted sin pod se
    /// perdieron con la cola de placement y el resolver las vuelve a programar.
    pub fn restored(job: Job, tasks: Vec<Task>) -> Self {
        let mut views = Self::new(job);
        for task in tasks {
            let holder = JobHolder::for_task(task.clone());
            views.reference = views.reference.add_child(holder.clone());
            views.store = views.store.add_child(holder.clone());
            if is_in_substrate(&task) {
                views.running = views.running.add_child(holder);
            }
        }
        views
    }

    pub fn model(&self, model: Model) -> &JobHolder {
        match model {
            Model::Reference => &self.reference,
            Model::Running => &self.running,
            Model::Store => &self.store,
        }
    }

    pub fn apply(&mut self, update: &ModelActionHolder) {
        let target = match update.model {
            Model::Reference => &mut self.reference,
            Model::Running => &mut self.running,
            Model::Store => &mut self.store,
        };
        *target = update.action.apply(target);
    }

    pub fn job(&self) -> Option<&Job> {
        self.reference.job()
    }

    pub fn is_closed(&self) -> bool {
        self.reference.flag_tag(ATTR_JOB_CLOSED)
    }
}
