//! Outbox delivery.
//!
//! Rows are written by the store in the same commit as the state change they
//! describe. This module drains them: claim a batch, hand each row to an
//! [`OutboxSink`], then mark it done, schedule a retry with backoff, or park
//! it as dead once the attempt budget is spent. Delivery is at-least-once;
//! sinks must tolerate duplicates (the dedupe key travels with the row).

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine, EngineError};
use crate::model::{Ms, OutboxEvent, OutboxStatus};
use crate::observability;

pub const BOOKING_CREATED: &str = "booking.created";
pub const BOOKING_STATUS_CHANGED: &str = "booking.status_changed";
pub const HOLD_CONFIRMED: &str = "capacity.hold.confirmed";
pub const ASSIGNMENT_RELEASED: &str = "capacity.assignment.released";

pub const KNOWN_EVENT_TYPES: [&str; 4] = [
    BOOKING_CREATED,
    BOOKING_STATUS_CHANGED,
    HOLD_CONFIRMED,
    ASSIGNMENT_RELEASED,
];

/// Attempts after which a row is parked as dead.
pub const MAX_ATTEMPTS: u32 = 10;

const BACKOFF_BASE_MS: Ms = 250;
const BACKOFF_MAX_MS: Ms = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("downstream unavailable: {0}")]
    Unavailable(String),
    #[error("payload rejected: {0}")]
    Rejected(String),
}

/// Downstream target for outbox rows.
#[async_trait]
pub trait OutboxSink: Send + Sync {
    async fn deliver(&self, event: &OutboxEvent) -> Result<(), DeliveryError>;
}

/// Writes every delivered row to the log. The default sink.
pub struct LogSink;

#[async_trait]
impl OutboxSink for LogSink {
    async fn deliver(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        info!(
            target: "tablewise::outbox",
            event_id = %event.id,
            event_type = %event.event_type,
            restaurant_id = %event.restaurant_id,
            booking_id = ?event.booking_id,
            payload = %event.payload,
            "outbox event delivered"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Delivered (or skipped as unknown) and marked done.
    pub processed: usize,
    /// Failed and rescheduled.
    pub failed: usize,
    /// Failed for the last time.
    pub dead: usize,
    /// Claimed but not delivered in this pass.
    pub pending: usize,
    /// Outcome could not be written; the row was requeued.
    pub errors: usize,
}

impl BatchReport {
    pub fn is_idle(&self) -> bool {
        self.processed == 0 && self.failed == 0
    }
}

/// `min(30s, 2^min(attempt, 8) * 250ms + jitter)` with `jitter` in `[0, 250ms)`.
pub fn backoff_delay_with(attempt: u32, jitter: Ms) -> Ms {
    let exp = attempt.min(8);
    BACKOFF_MAX_MS.min((1 << exp) * BACKOFF_BASE_MS + jitter)
}

pub fn backoff_delay(attempt: u32) -> Ms {
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_BASE_MS);
    backoff_delay_with(attempt, jitter)
}

/// Deliver up to `limit` due rows once.
///
/// A storage error on one row is logged and the row goes back to the queue;
/// the rest of the batch still runs. Returns the first storage error only
/// when every claimed row hit one, which usually means the WAL is down.
pub async fn process_outbox_batch(
    engine: &Engine,
    sink: &dyn OutboxSink,
    limit: usize,
    now: Ms,
) -> Result<BatchReport, EngineError> {
    let rows = engine.claim_outbox_batch(now, limit).await;
    let claimed = rows.len();
    let mut report = BatchReport::default();
    let mut unfinished = Vec::new();
    let mut first_error = None;

    for row in rows {
        match deliver_one(engine, sink, &row).await {
            Ok(RowOutcome::Done) => report.processed += 1,
            Ok(RowOutcome::Retry) => report.failed += 1,
            Ok(RowOutcome::Dead) => report.dead += 1,
            Err(e) => {
                warn!(event_id = %row.id, event_type = %row.event_type, error = %e, "outbox row not recorded, requeued");
                report.errors += 1;
                unfinished.push(row.id);
                first_error.get_or_insert(e);
            }
        }
    }
    engine.release_outbox_claims(&unfinished);

    report.pending = claimed.saturating_sub(report.processed);
    metrics::gauge!(observability::OUTBOX_PENDING).set(engine.outbox_stats().pending as f64);
    debug!(?report, "outbox batch");
    match first_error {
        Some(e) if report.errors == claimed => Err(e),
        _ => Ok(report),
    }
}

enum RowOutcome {
    Done,
    Retry,
    Dead,
}

async fn deliver_one(engine: &Engine, sink: &dyn OutboxSink, row: &OutboxEvent) -> Result<RowOutcome, EngineError> {
    if !KNOWN_EVENT_TYPES.contains(&row.event_type.as_str()) {
        warn!(event_id = %row.id, event_type = %row.event_type, "unknown outbox event type, marking done");
        engine.complete_outbox_event(row.id).await?;
        return Ok(RowOutcome::Done);
    }

    match sink.deliver(row).await {
        Ok(()) => {
            engine.complete_outbox_event(row.id).await?;
            metrics::counter!(observability::OUTBOX_DELIVERIES_TOTAL, "outcome" => "done").increment(1);
            Ok(RowOutcome::Done)
        }
        Err(e) => {
            let attempts = row.attempt_count + 1;
            let retry_at = (attempts < MAX_ATTEMPTS).then(|| now_ms() + backoff_delay(attempts));
            let status = engine.fail_outbox_event(row.id, e.to_string(), retry_at).await?;
            warn!(
                event_id = %row.id,
                event_type = %row.event_type,
                attempts,
                error = %e,
                "outbox delivery failed"
            );
            if status == OutboxStatus::Dead {
                metrics::counter!(observability::OUTBOX_DELIVERIES_TOTAL, "outcome" => "dead").increment(1);
                Ok(RowOutcome::Dead)
            } else {
                metrics::counter!(observability::OUTBOX_DELIVERIES_TOTAL, "outcome" => "retry").increment(1);
                Ok(RowOutcome::Retry)
            }
        }
    }
}
