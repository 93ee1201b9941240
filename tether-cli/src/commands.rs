use anyhow::Context;
use serde::Serialize;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;

use tether_core::infrastructure::CoordinationStore;
use tether_core::types::{LockRecord, QueueStats, SchemaVersion};
use tether_core::{LockContext, MigrationPlan, QueueError, TetherClient};

/// Exit code for a wait interrupted by Ctrl-C.
const INTERRUPTED: u8 = 130;

pub async fn migrate(client: &TetherClient) -> anyhow::Result<ExitCode> {
    let manager = client.migration_manager(MigrationPlan::builtin());
    let outcome = manager.migrate().await.context("migration failed")?;
    tracing::info!(?outcome, "migration finished");
    print_json(&outcome)?;
    Ok(ExitCode::SUCCESS)
}

pub fn enqueue(client: &TetherClient, queue: &str, job_id: &str) -> anyhow::Result<ExitCode> {
    let entry = client.queue().enqueue(queue, job_id)?;
    print_json(&entry)?;
    Ok(ExitCode::SUCCESS)
}

pub async fn dequeue(
    client: &TetherClient,
    queues: &[String],
    requeue: bool,
) -> anyhow::Result<ExitCode> {
    let (cancel_tx, cancel) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let names: Vec<&str> = queues.iter().map(String::as_str).collect();
    let job = match client.queue().dequeue(&names, cancel).await {
        Ok(job) => job,
        Err(QueueError::Cancelled) => {
            tracing::info!("dequeue interrupted");
            return Ok(ExitCode::from(INTERRUPTED));
        }
        Err(e) => return Err(e.into()),
    };

    print_json(job.entry())?;
    if requeue {
        job.requeue()?;
    } else {
        job.remove_from_queue()?;
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn lock(
    client: &TetherClient,
    resource: &str,
    timeout: Duration,
    command: &[String],
) -> anyhow::Result<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("no command given to run under the lock");
    };

    let context = LockContext::new();
    let mut guard = client
        .lock()
        .acquire(&context, resource, timeout)
        .await
        .with_context(|| format!("locking '{resource}'"))?;
    tracing::info!(resource = %resource, program = %program, "lock held, running command");

    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("running '{program}'"));

    guard.release()?;
    let status = status?;

    // A child killed by a signal has no code
    let code = status.code().unwrap_or(1);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

#[derive(Serialize)]
struct Status {
    schema_version: Option<SchemaVersion>,
    locks: Vec<LockRecord>,
    queues: Vec<QueueStats>,
}

pub fn status(client: &TetherClient, queues: &[String]) -> anyhow::Result<ExitCode> {
    let store = client.store();
    let queue = client.queue();

    let report = Status {
        schema_version: store.schema_version()?.map(|r| r.version),
        locks: store.list_locks()?,
        queues: queues
            .iter()
            .map(|q| queue.stats(q))
            .collect::<Result<_, _>>()?,
    };
    print_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
