use common::{Job, JobId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::action::{ActionDescriptor, BoxedChangeAction};
use crate::error::Result;
use crate::model::{ModelActionHolder, ModelViews};
use crate::resolver::DifferenceResolver;

/// Acción externa (usuario o sustrato) esperando su turno, con el canal
/// por donde se avisa el resultado si alguien lo está esperando.
pub struct PendingChange {
    pub action: BoxedChangeAction,
    pub reply: Option<oneshot::Sender<Result<()>>>,
}

/// Engine de reconciliación de un job.
///
/// Es dueño de los tres modelos. Cada ciclo corre primero las acciones
/// externas encoladas (en orden, una después de la otra) y después le pide
/// acciones al resolver sobre el modelo resultante, que corren en paralelo
/// sobre el mismo snapshot. Los cambios se aplican en el orden en que se
/// emitieron.
pub struct ReconciliationEngine {
    job_id: JobId,
    views: ModelViews,
    resolver: Arc<dyn DifferenceResolver>,
    pending: VecDeque<PendingChange>,
}

impl ReconciliationEngine {
    pub fn new(views: ModelViews, resolver: Arc<dyn DifferenceResolver>) -> Self {
        Self {
            job_id: views.reference.id().to_string(),
            views,
            resolver,
            pending: VecDeque::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn views(&self) -> &ModelViews {
        &self.views
    }

    pub fn job(&self) -> Option<&Job> {
        self.views.job()
    }

    pub fn is_closed(&self) -> bool {
        self.views.is_closed()
    }

    pub fn enqueue(&mut self, action: BoxedChangeAction, reply: Option<oneshot::Sender<Result<()>>>) {
        self.pending.push_back(PendingChange { action, reply });
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Ejecuta un ciclo. Devuelve cuántas acciones corrieron.
    pub async fn run_cycle(&mut self) -> usize {
        let executed = self.run_pending().await;

        let actions = self.resolver.apply(&self.views);
        if actions.is_empty() {
            return executed;
        }
        executed + self.run_reconciler_actions(actions).await
    }

    async fn run_pending(&mut self) -> usize {
        let mut executed = 0;
        while let Some(PendingChange { action, reply }) = self.pending.pop_front() {
            let result = action.apply(&self.views).await;
            let outcome = match result {
                Ok(updates) => {
                    self.apply_updates(action.descriptor(), &updates);
                    Ok(())
                }
                Err(e) => {
                    warn!(
                        job_id = %self.job_id,
                        action = action.descriptor().name,
                        task_or_job = %action.descriptor().id,
                        "acción externa falló: {e}"
                    );
                    Err(e)
                }
            };
            if let Some(reply) = reply {
                // quien pidió el cambio puede haberse ido
                let _ = reply.send(outcome);
            }
            executed += 1;
        }
        executed
    }

    async fn run_reconciler_actions(&mut self, actions: Vec<BoxedChangeAction>) -> usize {
        let total = actions.len();
        let snapshot = Arc::new(self.views.clone());
        let mut set = JoinSet::new();

        for (position, action) in actions.into_iter().enumerate() {
            let snapshot = Arc::clone(&snapshot);
            set.spawn(async move {
                let result = action.apply(&snapshot).await;
                (position, action.descriptor().clone(), result)
            });
        }

        let mut results: Vec<Option<(ActionDescriptor, Result<Vec<ModelActionHolder>>)>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((position, descriptor, result)) => results[position] = Some((descriptor, result)),
                Err(e) => error!(job_id = %self.job_id, "acción abortada: {e}"),
            }
        }

        for (descriptor, result) in results.into_iter().flatten() {
            match result {
                Ok(updates) => self.apply_updates(&descriptor, &updates),
                Err(e) => warn!(
                    job_id = %self.job_id,
                    action = descriptor.name,
                    task_or_job = %descriptor.id,
                    "acción falló, se reintenta en otro ciclo: {e}"
                ),
            }
        }
        total
    }

    fn apply_updates(&mut self, descriptor: &ActionDescriptor, updates: &[ModelActionHolder]) {
        for update in updates {
            debug!(
                job_id = %self.job_id,
                action = descriptor.name,
                model = ?update.model,
                summary = %update.action.summary,
                "cambio de modelo"
            );
            self.views.apply(update);
        }
    }
}
