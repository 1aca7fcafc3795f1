use async_trait::async_trait;
use common::{Backoff, JobHolder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::action::{ActionDescriptor, BoxedChangeAction, ChangeAction};
use crate::clock::Clock;
use crate::error::Result;
use crate::model::{ModelActionHolder, ModelViews};
use crate::retryer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttemptRecord {
    last_attempt: i64,
    consecutive_failures: u32,
}

/// Backoff para acciones que escriben en el store.
///
/// Lleva, por job, cuándo terminó el último intento y cuántos fallos seguidos
/// hubo. Mientras no pase el backoff el resolver no emite escrituras nuevas.
pub struct RetryActionInterceptor {
    name: &'static str,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<String, AttemptRecord>>,
}

impl RetryActionInterceptor {
    pub fn new(name: &'static str, backoff: Backoff, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            name,
            backoff,
            clock,
            records: Mutex::new(HashMap::new()),
        })
    }

    /// `true` si se puede ejecutar otra acción interceptada sobre este job.
    pub fn execution_limits(&self, root: &JobHolder) -> bool {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get(root.id()) {
            None => true,
            Some(record) => {
                let wait = retryer::clamp_millis(self.backoff.delay_ms(record.consecutive_failures));
                self.clock.wall_time() >= record.last_attempt.saturating_add(wait)
            }
        }
    }

    /// Envuelve la acción para que su resultado quede registrado.
    pub fn apply(self: &Arc<Self>, action: BoxedChangeAction) -> BoxedChangeAction {
        let descriptor = action.descriptor().clone();
        Box::new(InterceptedAction {
            descriptor,
            inner: action,
            interceptor: Arc::clone(self),
        })
    }

    /// Olvida el historial de un job que ya cerró.
    pub fn forget(&self, job_id: &str) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(job_id);
    }

    pub fn consecutive_failures(&self, job_id: &str) -> u32 {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(job_id)
            .map(|r| r.consecutive_failures)
            .unwrap_or(0)
    }

    fn record(&self, job_id: &str, success: bool) {
        let now = self.clock.wall_time();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(job_id.to_string()).or_insert(AttemptRecord {
            last_attempt: now,
            consecutive_failures: 0,
        });
        record.last_attempt = now;
        if success {
            record.consecutive_failures = 0;
        } else {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        }
    }
}

struct InterceptedAction {
    descriptor: ActionDescriptor,
    inner: BoxedChangeAction,
    interceptor: Arc<RetryActionInterceptor>,
}

#[async_trait]
impl ChangeAction for InterceptedAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>> {
        let job_id = views.store.id().to_string();
        let result = self.inner.apply(views).await;
        match &result {
            Ok(_) => self.interceptor.record(&job_id, true),
            Err(e) => {
                self.interceptor.record(&job_id, false);
                warn!(
                    interceptor = self.interceptor.name,
                    job_id = %job_id,
                    action = self.descriptor.name,
                    failures = self.interceptor.consecutive_failures(&job_id),
                    "acción interceptada falló: {e}"
                );
            }
        }
        debug!(
            interceptor = self.interceptor.name,
            action = self.descriptor.name,
            ok = result.is_ok(),
            "intento registrado"
        );
        result
    }
}
