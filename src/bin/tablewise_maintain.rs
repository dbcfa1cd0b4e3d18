//! Out-of-band maintenance runner.
//!
//! ```text
//! tablewise-maintain <job> [--config PATH] [--batch-size N]
//! ```
//!
//! Jobs: `sweep-holds`, `prune-assignments`, `drain-outbox`, `retry-pending`,
//! `compact`, `all`. Runs one pass over every configured restaurant and
//! exits non-zero if any pass failed.
//!
//! Each restaurant's WAL is locked by whichever process opened it, so this
//! runner refuses to start while the service is up. Against a live service,
//! leave `maintenance.enabled` on and let its in-process maintainers run.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tablewise::config::Config;
use tablewise::engine::now_ms;
use tablewise::maintenance;
use tablewise::outbox::{LogSink, OutboxSink};
use tablewise::registry::{Registry, RegistryError, Venue};

const BATCH_SIZE_ENV: &str = "TABLEWISE_BATCH_SIZE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    SweepHolds,
    PruneAssignments,
    DrainOutbox,
    RetryPending,
    Compact,
}

impl Job {
    const ALL: [Job; 5] = [
        Job::SweepHolds,
        Job::PruneAssignments,
        Job::DrainOutbox,
        Job::RetryPending,
        Job::Compact,
    ];

    fn name(&self) -> &'static str {
        match self {
            Job::SweepHolds => "sweep-holds",
            Job::PruneAssignments => "prune-assignments",
            Job::DrainOutbox => "drain-outbox",
            Job::RetryPending => "retry-pending",
            Job::Compact => "compact",
        }
    }

    fn parse(raw: &str) -> Option<Vec<Job>> {
        if raw == "all" {
            return Some(Job::ALL.to_vec());
        }
        Job::ALL.into_iter().find(|j| j.name() == raw).map(|j| vec![j])
    }
}

struct Args {
    jobs: Vec<Job>,
    config: Option<String>,
    batch_size: Option<usize>,
}

fn usage() -> String {
    let names: Vec<&str> = Job::ALL.iter().map(|j| j.name()).collect();
    format!(
        "usage: tablewise-maintain <{}|all> [--config PATH] [--batch-size N]",
        names.join("|")
    )
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut jobs = None;
    let mut config = None;
    let mut batch_size = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(args.next().ok_or("--config needs a path")?),
            "--batch-size" => {
                let raw = args.next().ok_or("--batch-size needs a number")?;
                batch_size = Some(raw.parse().map_err(|_| format!("invalid batch size: {raw}"))?);
            }
            "-h" | "--help" => return Err(usage()),
            other if jobs.is_none() => {
                jobs = Some(Job::parse(other).ok_or_else(|| format!("unknown job: {other}\n{}", usage()))?);
            }
            other => return Err(format!("unexpected argument: {other}")),
        }
    }
    Ok(Args {
        jobs: jobs.ok_or_else(usage)?,
        config,
        batch_size,
    })
}

async fn run_job(
    job: Job,
    venue: &Venue,
    sink: &dyn OutboxSink,
    config: &Config,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let engine = &venue.engine;
    match job {
        Job::SweepHolds => {
            let report = maintenance::sweep_expired_holds(engine, now_ms(), batch_size).await;
            report.map(|r| info!(restaurant_id = %venue.id, released = r.total, "sweep-holds done"))
        }
        Job::PruneAssignments => maintenance::prune_orphaned_assignments(engine, batch_size)
            .await
            .map(|n| info!(restaurant_id = %venue.id, pruned = n, "prune-assignments done")),
        Job::DrainOutbox => maintenance::drain_outbox(engine, sink, batch_size)
            .await
            .map(|r| info!(restaurant_id = %venue.id, processed = r.processed, failed = r.failed, dead = r.dead, "drain-outbox done")),
        Job::RetryPending => maintenance::retry_pending_allocations(venue, batch_size, cancel)
            .await
            .map(|r| info!(restaurant_id = %venue.id, assigned = r.assigned, still_pending = r.still_pending, "retry-pending done")),
        Job::Compact => maintenance::maybe_compact(engine, config.engine.compact_threshold)
            .await
            .map(|done| info!(restaurant_id = %venue.id, compacted = done, "compact done")),
    }
    .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(2);
        }
    };

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    tablewise::observability::init_tracing(&config.log.filter, config.log.json);

    let batch_size = args
        .batch_size
        .or_else(|| std::env::var(BATCH_SIZE_ENV).ok().and_then(|s| s.parse().ok()))
        .unwrap_or(config.maintenance.batch_size)
        .max(1);

    let sink: Arc<dyn OutboxSink> = Arc::new(LogSink);
    let registry = match Registry::from_config(config.clone(), sink.clone()) {
        Ok(registry) => registry,
        Err(RegistryError::Store(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
            error!(error = %e, "restaurant storage is owned by a running service");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "failed to load restaurants");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let mut failures = 0;
    for venue in registry.venues() {
        for job in &args.jobs {
            if let Err(e) = run_job(*job, &venue, sink.as_ref(), &config, batch_size, &cancel).await {
                error!(restaurant_id = %venue.id, job = job.name(), error = %e, "maintenance job failed");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        error!(failures, "maintenance finished with failures");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
