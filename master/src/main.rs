use anyhow::{bail, Context};
use common::{CallMetadata, JobDescriptor, RetryPolicy};
use master::stubs::in_memory_stack;
use master::{JobManagerConfig, SystemClock};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const JOB_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("master=debug")),
        )
        .init();

    let config = JobManagerConfig::from_env();
    info!(?config, "configuración cargada");

    let stack = in_memory_stack(config, Arc::new(SystemClock));
    let manager = stack.manager.clone();

    // los dos primeros lanzamientos se rechazan para ver los reemplazos
    stack.substrate.fail_launches_with("INSUFFICIENT_RESOURCES", 2);

    let caller = CallMetadata::new("demo", "demo de reconciliación");
    let descriptors = vec![
        JobDescriptor::batch("wordcount", 3, RetryPolicy::immediate(2)),
        JobDescriptor::batch("etl-nocturno", 5, RetryPolicy::exponential(200, 1_000, 3)),
        JobDescriptor::batch("reporte", 1, RetryPolicy::default()),
    ];

    let mut job_ids = Vec::new();
    for descriptor in descriptors {
        let job_id = manager
            .create_job(descriptor, caller.clone())
            .await
            .context("no se pudo crear el job")?;
        job_ids.push(job_id);
    }

    let mut summary = Vec::new();
    for job_id in &job_ids {
        let mut last_seen = None;
        let closed = manager
            .wait_until(job_id, JOB_TIMEOUT, |views| {
                let tasks: Vec<_> = views.reference.tasks().cloned().collect();
                last_seen = views.job().map(|job| (job.clone(), tasks));
                views.is_closed()
            })
            .await?;
        if !closed {
            warn!(job_id = %job_id, "el job no cerró a tiempo");
        }
        summary.push(json!({
            "job_id": job_id,
            "closed": closed,
            "job": last_seen.as_ref().map(|(job, _)| job),
            "tasks": last_seen.as_ref().map(|(_, tasks)| tasks),
        }));
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);

    let violations = manager.context().code_invariants.violations();
    manager.shutdown();
    stack.loopback.abort();
    if violations > 0 {
        bail!("{violations} invariantes violadas durante la demo");
    }
    Ok(())
}
