//! Espera de reintento por tarea.
//!
//! Cuando una tarea termina se le calcula cuánto hay que esperar antes de
//! reemplazarla. El valor queda como tag en el holder de referencia
//! (número) y en el contexto de la tarea (texto legible).

use common::{
    Backoff, HolderTag, JobEntity, JobHolder, Task, TaskState, TASK_ATTRIBUTES_RETRY_DELAY,
};

use crate::config::JobManagerConfig;

pub const ATTR_TASK_RETRY_DELAY_MS: &str = "task.retryDelayMs";
/// Fallos consecutivos de la cadena de tareas de un índice.
pub const ATTR_TASK_RETRY_COUNT: &str = "task.retryCount";

/// Calcula (fallos consecutivos, espera en ms) para una tarea que acaba de terminar.
///
/// Si la tarea estuvo en Started al menos `task_retryer_reset_time_ms`, el
/// historial se considera sano y el contador vuelve a 1.
pub fn next_retry(
    backoff: &Backoff,
    prior_failures: u32,
    time_in_started_ms: i64,
    config: &JobManagerConfig,
) -> (u32, u64) {
    let failures = if time_in_started_ms >= clamp_millis(config.task_retryer_reset_time_ms) {
        1
    } else {
        prior_failures.saturating_add(1)
    };
    let delay = backoff.delay_ms(failures).max(config.min_retry_interval_ms);
    (failures, delay)
}

/// Holder de referencia para `finished`, con la espera de reintento ya calculada.
pub fn with_retryer(
    holder: &JobHolder,
    finished: &Task,
    backoff: &Backoff,
    config: &JobManagerConfig,
    now: i64,
) -> JobHolder {
    let prior = holder.count_tag(ATTR_TASK_RETRY_COUNT).unwrap_or(0);
    let ran = finished.time_in_state(TaskState::Started, now).unwrap_or(0);
    let (failures, delay) = next_retry(backoff, prior, ran, config);

    let task = finished.with_context(TASK_ATTRIBUTES_RETRY_DELAY, format_delay(delay));
    holder
        .set_entity(JobEntity::Task(task))
        .add_tag(ATTR_TASK_RETRY_DELAY_MS, HolderTag::Millis(clamp_millis(delay)))
        .add_tag(ATTR_TASK_RETRY_COUNT, HolderTag::Count(failures))
}

/// `true` si ya pasó la espera desde que la tarea entró en su estado actual.
pub fn should_retry_now(holder: &JobHolder, now: i64) -> bool {
    let delay = holder.millis_tag(ATTR_TASK_RETRY_DELAY_MS).unwrap_or(0);
    if delay <= 0 {
        return true;
    }
    match holder.task() {
        Some(task) => task.status.timestamp.saturating_add(delay) <= now,
        None => true,
    }
}

/// Esperas que no entran en un i64 quedan en el máximo.
pub fn clamp_millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// "250ms", "5s", "1m 30s", "2h 0m 5s 10ms"
pub fn format_delay(ms: u64) -> String {
    if ms < 1_000 {
        return format!("{ms}ms");
    }
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let seconds = (ms / 1_000) % 60;
    let millis = ms % 1_000;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if hours > 0 || minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));
    if millis > 0 {
        parts.push(format!("{millis}ms"));
    }
    parts.join(" ")
}
