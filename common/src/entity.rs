use crate::holder::EntityHolder;
use crate::job::Job;
use crate::task::Task;

/// Entidades que viven en el árbol de un job: la raíz es el job y los hijos sus tareas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEntity {
    Job(Job),
    Task(Task),
}

impl JobEntity {
    pub fn as_job(&self) -> Option<&Job> {
        match self {
            JobEntity::Job(job) => Some(job),
            JobEntity::Task(_) => None,
        }
    }

    pub fn as_task(&self) -> Option<&Task> {
        match self {
            JobEntity::Task(task) => Some(task),
            JobEntity::Job(_) => None,
        }
    }
}

pub type JobHolder = EntityHolder<JobEntity>;

impl EntityHolder<JobEntity> {
    /// Raíz de un árbol nuevo para el job, sin tareas.
    pub fn for_job(job: Job) -> Self {
        EntityHolder::new_root(job.id.clone(), JobEntity::Job(job))
    }

    pub fn for_task(task: Task) -> Self {
        EntityHolder::new_root(task.id.clone(), JobEntity::Task(task))
    }

    pub fn job(&self) -> Option<&Job> {
        self.entity().as_job()
    }

    pub fn task(&self) -> Option<&Task> {
        self.entity().as_task()
    }

    /// Tareas hijas, en orden de inserción.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.children().iter().filter_map(|child| child.task())
    }

    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.find_child_by_id(task_id).and_then(|child| child.task())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDescriptor;
    use crate::retry::RetryPolicy;

    #[test]
    fn arbol_de_job_con_tareas() {
        let job = Job::new(JobDescriptor::batch("demo", 2, RetryPolicy::default()), 0);
        let t0 = Task::new_batch_task(&job.id, 0, 0);
        let t1 = Task::new_batch_task(&job.id, 1, 0);

        let root = JobHolder::for_job(job.clone())
            .add_child(JobHolder::for_task(t0.clone()))
            .add_child(JobHolder::for_task(t1.clone()));

        assert_eq!(root.id(), job.id);
        assert_eq!(root.job(), Some(&job));
        assert_eq!(root.tasks().count(), 2);
        assert_eq!(root.find_task(&t1.id), Some(&t1));
        assert!(root.task().is_none());
    }
}
