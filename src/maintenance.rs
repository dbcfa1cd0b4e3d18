//! Background maintainers.
//!
//! Each job is a plain async function doing one bounded pass, so the
//! out-of-band runner can call it directly. [`spawn_all`] wraps the same
//! passes in interval loops for the service process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::coordinator::{AssignError, AssignOutcome, Trigger};
use crate::engine::{now_ms, Engine, EngineError, SweepReport};
use crate::limits::MAX_SWEEP_BATCH;
use crate::model::{BookingStatus, Ms};
use crate::observability;
use crate::outbox::{process_outbox_batch, BatchReport, OutboxSink};
use crate::registry::Venue;

/// Safety stop for one drain; a pass normally goes idle long before this.
const MAX_DRAIN_PASSES: usize = 50;

/// Release holds whose TTL has passed.
pub async fn sweep_expired_holds(engine: &Engine, now: Ms, limit: usize) -> Result<SweepReport, EngineError> {
    let report = engine.expire_stale_holds(now, limit.min(MAX_SWEEP_BATCH)).await?;
    if report.total > 0 {
        info!(restaurant_id = %engine.restaurant_id, released = report.total, "expired holds swept");
    }
    Ok(report)
}

/// Remove assignments whose booking is gone, cancelled or a no-show.
pub async fn prune_orphaned_assignments(engine: &Engine, limit: usize) -> Result<usize, EngineError> {
    let mut pruned = 0;
    for assignment_id in engine.collect_orphaned_assignments(limit.min(MAX_SWEEP_BATCH)) {
        if engine.release_assignment(assignment_id).await? {
            pruned += 1;
        }
    }
    if pruned > 0 {
        metrics::counter!(observability::ASSIGNMENTS_PRUNED_TOTAL).increment(pruned as u64);
        info!(restaurant_id = %engine.restaurant_id, pruned, "orphaned assignments pruned");
    }
    engine.notify.prune();
    Ok(pruned)
}

/// Deliver outbox rows in batches until a pass has nothing to do.
pub async fn drain_outbox(
    engine: &Engine,
    sink: &dyn OutboxSink,
    batch_size: usize,
) -> Result<BatchReport, EngineError> {
    let mut total = BatchReport::default();
    for pass in 0..MAX_DRAIN_PASSES {
        let report = process_outbox_batch(engine, sink, batch_size, now_ms()).await?;
        total.processed += report.processed;
        total.failed += report.failed;
        total.dead += report.dead;
        total.errors += report.errors;
        total.pending = report.pending;
        if report.is_idle() {
            break;
        }
        if pass + 1 < MAX_DRAIN_PASSES {
            let pause = rand::thread_rng().gen_range(25..100);
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
    }
    if total.processed + total.failed + total.dead > 0 {
        info!(
            restaurant_id = %engine.restaurant_id,
            processed = total.processed,
            failed = total.failed,
            dead = total.dead,
            "outbox drained"
        );
    }
    Ok(total)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub assigned: usize,
    pub still_pending: usize,
    pub failed: usize,
}

/// Re-run auto-assignment for bookings parked in `pending_allocation`.
pub async fn retry_pending_allocations(
    venue: &Venue,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<RetryReport, EngineError> {
    let mut report = RetryReport::default();
    for booking in venue
        .engine
        .bookings_with_status(BookingStatus::PendingAllocation, limit.min(MAX_SWEEP_BATCH))
    {
        if cancel.is_cancelled() {
            break;
        }
        report.attempted += 1;
        match venue.plan_and_assign(booking.id, Trigger::Retry, cancel.child_token()).await {
            Ok(AssignOutcome::Assigned { .. } | AssignOutcome::Noop { .. }) => report.assigned += 1,
            Ok(AssignOutcome::Deferred { .. }) | Err(AssignError::NoCapacity { .. }) => {
                report.still_pending += 1;
            }
            Err(AssignError::Repository(e)) => return Err(e),
            Err(e) => {
                warn!(booking_id = %booking.id, code = e.code(), error = %e, "pending allocation retry failed");
                report.failed += 1;
            }
        }
    }
    if report.attempted > 0 {
        info!(
            restaurant_id = %venue.id,
            attempted = report.attempted,
            assigned = report.assigned,
            still_pending = report.still_pending,
            "pending allocations retried"
        );
    }
    Ok(report)
}

/// Rewrite the WAL once enough appends have piled up. Returns true if it did.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(restaurant_id = %engine.restaurant_id, appends, "WAL compacted");
    Ok(true)
}

/// Run `pass` every `period` until `shutdown` fires. Failures are logged and
/// the loop carries on with the next tick.
pub async fn run_periodic<F, Fut, E>(
    job: &'static str,
    restaurant_id: Ulid,
    period: Duration,
    shutdown: CancellationToken,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(job, %restaurant_id, "maintainer stopped");
                return;
            }
            _ = interval.tick() => {}
        }
        let outcome = match pass().await {
            Ok(()) => "ok",
            Err(e) => {
                error!(job, %restaurant_id, error = %e, "maintenance pass failed");
                "error"
            }
        };
        metrics::counter!(observability::MAINTENANCE_RUNS_TOTAL, "job" => job, "outcome" => outcome)
            .increment(1);
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

/// Spawn every maintainer for one restaurant.
pub fn spawn_all(venue: Arc<Venue>, sink: Arc<dyn OutboxSink>, config: &Config, shutdown: CancellationToken) {
    let m = config.maintenance.clone();
    let batch = m.batch_size;
    let id = venue.id;

    let v = venue.clone();
    tokio::spawn(run_periodic("sweep_holds", id, secs(m.sweep_interval_secs), shutdown.clone(), move || {
        let v = v.clone();
        async move { sweep_expired_holds(&v.engine, now_ms(), batch).await.map(|_| ()) }
    }));

    let v = venue.clone();
    tokio::spawn(run_periodic("prune_assignments", id, secs(m.prune_interval_secs), shutdown.clone(), move || {
        let v = v.clone();
        async move { prune_orphaned_assignments(&v.engine, batch).await.map(|_| ()) }
    }));

    let v = venue.clone();
    tokio::spawn(run_periodic("drain_outbox", id, secs(m.outbox_interval_secs), shutdown.clone(), move || {
        let v = v.clone();
        let sink = sink.clone();
        async move { drain_outbox(&v.engine, sink.as_ref(), batch).await.map(|_| ()) }
    }));

    let v = venue.clone();
    let token = shutdown.clone();
    tokio::spawn(run_periodic("retry_pending", id, secs(m.retry_interval_secs), shutdown.clone(), move || {
        let v = v.clone();
        let token = token.clone();
        async move { retry_pending_allocations(&v, batch, &token).await.map(|_| ()) }
    }));

    let threshold = config.engine.compact_threshold;
    tokio::spawn(run_periodic("compact_wal", id, secs(m.compact_interval_secs), shutdown, move || {
        let v = venue.clone();
        async move { maybe_compact(&v.engine, threshold).await.map(|_| ()) }
    }));

    debug!(restaurant_id = %id, "maintainers started");
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{Duration as ChronoDuration, NaiveTime, Utc};

    use super::*;
    use crate::config::VenueConfig;
    use crate::engine::HoldRequest;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::outbox::LogSink;
    use crate::policy::VenuePolicy;
    use crate::registry::VenueSettings;
    use crate::window::compute_booking_window;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tablewise_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn venue(name: &str) -> Venue {
        let zone = Zone { id: Ulid::new(), name: "Main".into(), outdoor: false };
        let tables = (1..=2)
            .map(|n| Table {
                id: Ulid::new(),
                number: n.to_string(),
                zone_id: zone.id,
                category: TableCategory::Dining,
                seating_type: SeatingType::Standard,
                min_party_size: 1,
                capacity: 4,
                features: vec![],
                adjacent: vec![],
                active: true,
            })
            .collect();
        let config = VenueConfig {
            id: Ulid::new(),
            name: "Test".into(),
            policy: VenuePolicy::default(),
            zones: vec![zone],
            tables,
        };
        let settings = VenueSettings::from_config(&Config::default());
        Venue::new(&config, settings, test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
    }

    async fn booking(venue: &Venue) -> Booking {
        let policy = venue.policy().await;
        let date = (Utc::now() + ChronoDuration::days(2)).with_timezone(&policy.timezone).date_naive();
        let start = NaiveTime::from_hms_opt(13, 0, 0).unwrap();
        let window = compute_booking_window(date, start, 2, &policy, None).unwrap();
        let booking = Booking {
            id: Ulid::new(),
            restaurant_id: venue.id,
            date,
            start_time: start,
            end_time: start + ChronoDuration::minutes(i64::from(window.duration_minutes)),
            service: window.service,
            party_size: 2,
            seating_preference: SeatingPreference::Any,
            status: BookingStatus::Pending,
            assigned_zone: None,
            dining: window.dining,
            block: window.block,
            contact: Contact::default(),
            created_at: now_ms(),
            version: 0,
        };
        venue.engine.create_booking(booking).await.unwrap()
    }

    #[tokio::test]
    async fn sweeper_releases_only_expired_holds() {
        let v = venue("sweep.wal");
        let b = booking(&v).await;
        let table_ids: Vec<Ulid> = v.graph.table_ids().collect();
        for (i, table_id) in table_ids.iter().enumerate() {
            v.engine
                .acquire_hold(HoldRequest {
                    table_ids: vec![*table_id],
                    span: b.block,
                    ttl_ms: if i == 0 { 1_000 } else { 600_000 },
                    booking_id: None,
                    zone_id: None,
                    policy_version: None,
                })
                .await
                .unwrap();
        }

        let report = sweep_expired_holds(&v.engine, now_ms() + 60_000, 100).await.unwrap();
        assert_eq!(report.total, 1);
        let again = sweep_expired_holds(&v.engine, now_ms() + 60_000, 100).await.unwrap();
        assert_eq!(again.total, 0);
    }

    #[tokio::test]
    async fn pruner_frees_tables_of_cancelled_bookings() {
        let v = venue("prune.wal");
        let b = booking(&v).await;
        v.plan_and_assign(b.id, Trigger::Creation, CancellationToken::new()).await.unwrap();
        assert_eq!(prune_orphaned_assignments(&v.engine, 100).await.unwrap(), 0);

        v.engine.transition_booking(b.id, BookingStatus::Cancelled, None).await.unwrap();
        assert_eq!(v.engine.assignments_for_booking(&b.id).len(), 1);
        assert_eq!(prune_orphaned_assignments(&v.engine, 100).await.unwrap(), 1);
        assert!(v.engine.assignments_for_booking(&b.id).is_empty());
        assert!(v.engine.busy_tables(&b.block, now_ms()).await.is_empty());
    }

    #[tokio::test]
    async fn drain_runs_until_idle() {
        let v = venue("drain.wal");
        for _ in 0..3 {
            booking(&v).await;
        }
        let report = drain_outbox(&v.engine, &LogSink, 2).await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(v.engine.outbox_stats().done, 3);
        assert!(drain_outbox(&v.engine, &LogSink, 2).await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn retry_assigns_parked_bookings() {
        let v = venue("retry.wal");
        let b = booking(&v).await;
        v.engine.transition_booking(b.id, BookingStatus::PendingAllocation, None).await.unwrap();

        let report = retry_pending_allocations(&v, 100, &CancellationToken::new()).await.unwrap();
        assert_eq!(report, RetryReport { attempted: 1, assigned: 1, still_pending: 0, failed: 0 });
        assert_eq!(v.engine.booking(&b.id).unwrap().status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let v = venue("compact.wal");
        booking(&v).await;
        assert!(!maybe_compact(&v.engine, 1_000).await.unwrap());
        assert!(maybe_compact(&v.engine, 1).await.unwrap());
        assert!(v.engine.wal_appends_since_compact().await < 1);
    }

    #[tokio::test]
    async fn periodic_loop_survives_errors_and_stops_on_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let counter = runs.clone();
        let handle = tokio::spawn(run_periodic(
            "test",
            Ulid::new(),
            Duration::from_millis(10),
            shutdown.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
