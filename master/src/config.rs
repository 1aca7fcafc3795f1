use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Configuración del job manager.
///
/// Todos los tiempos en milisegundos. `from_env` permite sobreescribir cada
/// campo con una variable de entorno del mismo nombre en mayúsculas
/// (ej: `ACTIVE_NOT_STARTED_TASKS_LIMIT=50`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobManagerConfig {
    /// Máximo de tareas activas sin arrancar por job (control de admisión)
    pub active_not_started_tasks_limit: u32,
    pub min_retry_interval_ms: u64,
    /// Si la tarea corrió más que esto antes de fallar, su contador de reintentos se resetea
    pub task_retryer_reset_time_ms: u64,
    pub task_in_launched_state_timeout_ms: u64,
    pub task_in_start_initiated_state_timeout_ms: u64,
    pub task_in_kill_initiated_state_timeout_ms: u64,
    pub store_write_retry_initial_delay_ms: u64,
    pub store_write_retry_max_delay_ms: u64,
    /// Pausa entre ciclos mientras el job todavía produce acciones
    pub reconciler_active_interval_ms: u64,
    /// Pausa entre ciclos cuando el job ya convergió
    pub reconciler_idle_interval_ms: u64,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            active_not_started_tasks_limit: 300,
            min_retry_interval_ms: 1_000,
            task_retryer_reset_time_ms: 300_000,
            task_in_launched_state_timeout_ms: 600_000,
            task_in_start_initiated_state_timeout_ms: 600_000,
            task_in_kill_initiated_state_timeout_ms: 300_000,
            store_write_retry_initial_delay_ms: 5_000,
            store_write_retry_max_delay_ms: 5_000,
            reconciler_active_interval_ms: 10,
            reconciler_idle_interval_ms: 1_000,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

impl JobManagerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            active_not_started_tasks_limit: env_or(
                "ACTIVE_NOT_STARTED_TASKS_LIMIT",
                d.active_not_started_tasks_limit,
            ),
            min_retry_interval_ms: env_or("MIN_RETRY_INTERVAL_MS", d.min_retry_interval_ms),
            task_retryer_reset_time_ms: env_or(
                "TASK_RETRYER_RESET_TIME_MS",
                d.task_retryer_reset_time_ms,
            ),
            task_in_launched_state_timeout_ms: env_or(
                "TASK_IN_LAUNCHED_STATE_TIMEOUT_MS",
                d.task_in_launched_state_timeout_ms,
            ),
            task_in_start_initiated_state_timeout_ms: env_or(
                "TASK_IN_START_INITIATED_STATE_TIMEOUT_MS",
                d.task_in_start_initiated_state_timeout_ms,
            ),
            task_in_kill_initiated_state_timeout_ms: env_or(
                "TASK_IN_KILL_INITIATED_STATE_TIMEOUT_MS",
                d.task_in_kill_initiated_state_timeout_ms,
            ),
            store_write_retry_initial_delay_ms: env_or(
                "STORE_WRITE_RETRY_INITIAL_DELAY_MS",
                d.store_write_retry_initial_delay_ms,
            ),
            store_write_retry_max_delay_ms: env_or(
                "STORE_WRITE_RETRY_MAX_DELAY_MS",
                d.store_write_retry_max_delay_ms,
            ),
            reconciler_active_interval_ms: env_or(
                "RECONCILER_ACTIVE_INTERVAL_MS",
                d.reconciler_active_interval_ms,
            ),
            reconciler_idle_interval_ms: env_or(
                "RECONCILER_IDLE_INTERVAL_MS",
                d.reconciler_idle_interval_ms,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_razonables() {
        let c = JobManagerConfig::default();
        assert_eq!(c.active_not_started_tasks_limit, 300);
        assert_eq!(c.store_write_retry_initial_delay_ms, 5_000);
        assert_eq!(c.store_write_retry_max_delay_ms, 5_000);
    }

    #[test]
    fn env_or_ignora_valores_invalidos() {
        env::set_var("JOB_MANAGER_CONFIG_TEST_VALUE", "no-es-numero");
        assert_eq!(env_or("JOB_MANAGER_CONFIG_TEST_VALUE", 7u64), 7);
        env::set_var("JOB_MANAGER_CONFIG_TEST_VALUE", "42");
        assert_eq!(env_or("JOB_MANAGER_CONFIG_TEST_VALUE", 7u64), 42);
        env::remove_var("JOB_MANAGER_CONFIG_TEST_VALUE");
        assert_eq!(env_or("JOB_MANAGER_CONFIG_TEST_VALUE", 7u64), 7);
    }

    #[test]
    fn deserializa_con_campos_parciales() {
        let c: JobManagerConfig =
            serde_json::from_str(r#"{"active_not_started_tasks_limit": 5}"#).unwrap();
        assert_eq!(c.active_not_started_tasks_limit, 5);
        assert_eq!(c.min_retry_interval_ms, 1_000);
    }
}
