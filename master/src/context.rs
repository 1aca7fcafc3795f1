use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

use crate::clock::Clock;
use crate::config::JobManagerConfig;
use crate::services::{CapacityGroupService, ExecutionSubstrate, JobStore, SchedulingService};

/// Registro de violaciones de invariantes internas.
///
/// Una violación nunca tumba el proceso: se loguea, se cuenta y la acción
/// que la detectó se vuelve un no-op para ese ciclo.
#[derive(Debug, Default)]
pub struct CodeInvariants {
    violations: AtomicU64,
}

impl CodeInvariants {
    pub fn inconsistent(&self, message: impl Display) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        error!(target: "code_invariants", "invariante violada: {}", message);
    }

    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }
}

/// Todo lo que necesitan las acciones y los resolvers para trabajar.
#[derive(Clone)]
pub struct JobManagerContext {
    pub config: Arc<JobManagerConfig>,
    pub store: Arc<dyn JobStore>,
    pub scheduling: Arc<dyn SchedulingService>,
    pub substrate: Arc<dyn ExecutionSubstrate>,
    pub capacity_groups: Arc<dyn CapacityGroupService>,
    pub clock: Arc<dyn Clock>,
    pub code_invariants: Arc<CodeInvariants>,
}

impl JobManagerContext {
    pub fn now(&self) -> i64 {
        self.clock.wall_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inconsistent_cuenta_violaciones() {
        let inv = CodeInvariants::default();
        assert_eq!(inv.violations(), 0);
        inv.inconsistent("tarea x no encontrada");
        inv.inconsistent(format_args!("tarea {} no encontrada", "y"));
        assert_eq!(inv.violations(), 2);
    }
}
