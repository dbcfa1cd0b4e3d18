//! Automatic table assignment: plan, hold, confirm.
//!
//! Candidates come from the graph, ranked. Each one is held and then
//! confirmed; contention moves on to the next candidate. The whole run shares
//! one deadline and one cancellation token, and every storage call races
//! them. Hold and confirm commits run on their own tasks: when the run gives
//! up first, the commit still finishes and any hold it produced is released
//! once it lands.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::OnExhausted;
use crate::engine::{now_ms, ConfirmRequest, EngineError, ErrorClass, HoldRequest};
use crate::graph::Combination;
use crate::lifecycle;
use crate::model::{Assignment, Booking, BookingStatus, Hold};
use crate::observability;
use crate::registry::Venue;
use crate::window::{assert_not_in_past, WindowError};

/// Why an assignment run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Creation,
    Retry,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Creation => "creation",
            Trigger::Retry => "retry",
            Trigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub table_ids: Vec<Ulid>,
    pub table_numbers: Vec<String>,
    /// `assigned` or the store error code that ended the attempt.
    pub outcome: &'static str,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    Assigned {
        assignment: Assignment,
        combination: Combination,
    },
    /// No candidate worked; the booking now waits in `pending_allocation`.
    Deferred { booking: Booking },
    /// The booking already had tables.
    Noop { assignment: Assignment },
}

#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    #[error("booking not found: {0}")]
    NotFound(Ulid),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("assignment rejected: {0}")]
    Rejected(EngineError),
    #[error("no tables available after {} attempts", attempts.len())]
    NoCapacity { attempts: Vec<AttemptRecord> },
    #[error("assignment timed out after {elapsed_ms}ms and {} attempts", attempts.len())]
    Timeout {
        attempts: Vec<AttemptRecord>,
        elapsed_ms: u64,
    },
    #[error("assignment cancelled")]
    Cancelled,
    #[error("storage failure: {0}")]
    Repository(EngineError),
}

impl AssignError {
    pub fn code(&self) -> &'static str {
        match self {
            AssignError::NotFound(_) => "BOOKING_NOT_FOUND",
            AssignError::Window(e) => e.code(),
            AssignError::Rejected(e) | AssignError::Repository(e) => e.code(),
            AssignError::NoCapacity { .. } => "NO_CAPACITY",
            AssignError::Timeout { .. } => "ASSIGNMENT_TIMEOUT",
            AssignError::Cancelled => "ASSIGNMENT_CANCELLED",
        }
    }

    fn from_engine(e: EngineError) -> Self {
        match e.class() {
            ErrorClass::Repository => AssignError::Repository(e),
            ErrorClass::NotFound => match e {
                EngineError::BookingNotFound(id) => AssignError::NotFound(id),
                other => AssignError::Rejected(other),
            },
            ErrorClass::Validation | ErrorClass::Conflict => AssignError::Rejected(e),
        }
    }
}

/// Deadline and cancellation shared by every step of one run.
struct RunBudget {
    started: Instant,
    deadline: Instant,
    cancel: CancellationToken,
}

impl RunBudget {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Resolves when the run has to stop, whichever of deadline or cancel comes first.
    async fn expired(&self, attempts: &[AttemptRecord]) -> AssignError {
        tokio::select! {
            _ = self.cancel.cancelled() => AssignError::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => AssignError::Timeout {
                attempts: attempts.to_vec(),
                elapsed_ms: self.elapsed_ms(),
            },
        }
    }

    fn check(&self, attempts: &[AttemptRecord]) -> Result<(), AssignError> {
        if self.cancel.is_cancelled() {
            return Err(AssignError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(AssignError::Timeout {
                attempts: attempts.to_vec(),
                elapsed_ms: self.elapsed_ms(),
            });
        }
        Ok(())
    }
}

impl Venue {
    /// Find, hold and confirm tables for a booking.
    pub async fn plan_and_assign(
        &self,
        booking_id: Ulid,
        trigger: Trigger,
        cancel: CancellationToken,
    ) -> Result<AssignOutcome, AssignError> {
        let started = Instant::now();
        let budget = RunBudget {
            started,
            deadline: started + Duration::from_millis(self.settings.coordinator.timeout_ms),
            cancel,
        };
        let result = self.assign_inner(booking_id, trigger, &budget).await;

        let outcome = match &result {
            Ok(AssignOutcome::Assigned { .. }) => "assigned",
            Ok(AssignOutcome::Deferred { .. }) => "deferred",
            Ok(AssignOutcome::Noop { .. }) => "noop",
            Err(AssignError::NoCapacity { .. }) => "no_capacity",
            Err(AssignError::Timeout { .. }) => "timeout",
            Err(AssignError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        metrics::histogram!(
            observability::ASSIGNMENT_DURATION_SECONDS,
            "trigger" => trigger.as_str(),
            "outcome" => outcome
        )
        .record(started.elapsed().as_secs_f64());
        result
    }

    async fn assign_inner(
        &self,
        booking_id: Ulid,
        trigger: Trigger,
        budget: &RunBudget,
    ) -> Result<AssignOutcome, AssignError> {
        let engine = &self.engine;
        let booking = engine.booking(&booking_id).ok_or(AssignError::NotFound(booking_id))?;
        if let Some(assignment) = engine.assignments_for_booking(&booking_id).into_iter().next() {
            return Ok(AssignOutcome::Noop { assignment });
        }
        if !lifecycle::can_transition(booking.status, BookingStatus::Confirmed) {
            return Err(AssignError::Rejected(EngineError::AssignmentValidation(format!(
                "booking is {}",
                booking.status
            ))));
        }
        if !self.settings.allow_backdating {
            assert_not_in_past(booking.dining.start, now_ms(), self.settings.past_grace_minutes)?;
        }

        // Read locks only, so dropping this on expiry leaves nothing behind.
        let busy = tokio::select! {
            busy = engine.busy_tables(&booking.block, now_ms()) => busy,
            e = budget.expired(&[]) => return Err(e),
        };
        let candidates = self.graph.find_combinations(
            booking.party_size,
            booking.seating_preference,
            &busy,
            &self.settings.planner,
        );

        let max_attempts = self.settings.coordinator.max_attempts.max(1);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut index = 0;

        while index < candidates.len() && attempts.len() < max_attempts {
            budget.check(&attempts)?;
            let combination = &candidates[index];
            let attempt_started = Instant::now();
            let result = self.try_candidate(&booking, combination, budget, &attempts).await;

            let outcome = match &result {
                Ok(_) => "assigned",
                Err(AttemptFailure::Store(e)) => e.code(),
                Err(AttemptFailure::Abort(e)) => e.code(),
            };
            let record = AttemptRecord {
                table_ids: combination.table_ids.clone(),
                table_numbers: combination.table_numbers.clone(),
                outcome,
                duration_ms: attempt_started.elapsed().as_millis() as u64,
            };
            info!(
                target: "tablewise::assignment",
                trigger = trigger.as_str(),
                booking_id = %booking_id,
                tables = ?record.table_numbers,
                outcome,
                duration_ms = record.duration_ms,
                "assignment attempt"
            );
            metrics::counter!(
                observability::ASSIGNMENT_ATTEMPTS_TOTAL,
                "trigger" => trigger.as_str(),
                "outcome" => outcome
            )
            .increment(1);
            attempts.push(record);

            match result {
                Ok(assignment) => {
                    return Ok(AssignOutcome::Assigned {
                        assignment,
                        combination: combination.clone(),
                    });
                }
                Err(AttemptFailure::Abort(e)) => {
                    return Err(match e {
                        AssignError::Timeout { elapsed_ms, .. } => AssignError::Timeout {
                            attempts,
                            elapsed_ms,
                        },
                        other => other,
                    });
                }
                // Same tables again under the policy now in force.
                Err(AttemptFailure::Store(EngineError::PolicyDrift { .. })) => {}
                Err(AttemptFailure::Store(e)) if e.class() == ErrorClass::Conflict => index += 1,
                Err(AttemptFailure::Store(e)) => return Err(AssignError::from_engine(e)),
            }
        }

        budget.check(&attempts)?;
        self.exhausted(booking, attempts).await
    }

    async fn try_candidate(
        &self,
        booking: &Booking,
        combination: &Combination,
        budget: &RunBudget,
        attempts: &[AttemptRecord],
    ) -> Result<Assignment, AttemptFailure> {
        let policy_version = self.policy().await.version;
        let zone_id = combination.zone_id.or_else(|| {
            combination
                .table_ids
                .first()
                .and_then(|id| self.graph.table(id))
                .map(|t| t.zone_id)
        });
        let engine = self.engine.clone();
        let request = HoldRequest {
            table_ids: combination.table_ids.clone(),
            span: booking.block,
            ttl_ms: self.settings.hold_ttl_ms,
            booking_id: Some(booking.id),
            zone_id,
            policy_version: Some(policy_version),
        };
        let mut acquiring = tokio::spawn(async move { engine.acquire_hold(request).await });
        let hold = tokio::select! {
            joined = &mut acquiring => joined.map_err(task_failure)?.map_err(AttemptFailure::Store)?,
            e = budget.expired(attempts) => {
                self.release_when_acquired(acquiring);
                return Err(AttemptFailure::Abort(e));
            }
        };

        if let Err(e) = budget.check(attempts) {
            self.release_in_flight(&hold).await;
            return Err(AttemptFailure::Abort(e));
        }

        let current_version = self.policy().await.version;
        let engine = self.engine.clone();
        let request = ConfirmRequest {
            booking_id: booking.id,
            table_ids: Some(combination.table_ids.clone()),
            policy_version: current_version,
        };
        let hold_id = hold.id;
        let mut confirming = tokio::spawn(async move { engine.confirm_hold(hold_id, request).await });
        let confirmed = tokio::select! {
            joined = &mut confirming => joined.map_err(task_failure)?,
            e = budget.expired(attempts) => {
                self.release_unless_confirmed(hold_id, confirming);
                return Err(AttemptFailure::Abort(e));
            }
        };
        match confirmed {
            Ok(assignment) => Ok(assignment),
            Err(e) => {
                self.release_in_flight(&hold).await;
                Err(AttemptFailure::Store(e))
            }
        }
    }

    /// The run gave up while a hold was being committed: release it if it lands.
    fn release_when_acquired(&self, acquiring: JoinHandle<Result<Hold, EngineError>>) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Ok(Ok(hold)) = acquiring.await
                && let Err(e) = engine.release_hold(hold.id).await
            {
                warn!(hold_id = %hold.id, error = %e, "failed to release abandoned hold");
            }
        });
    }

    /// The run gave up during confirm. A confirm that lands keeps the booking
    /// seated; one that fails leaves a hold to release.
    fn release_unless_confirmed(&self, hold_id: Ulid, confirming: JoinHandle<Result<Assignment, EngineError>>) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if matches!(confirming.await, Ok(Ok(_))) {
                return;
            }
            if let Err(e) = engine.release_hold(hold_id).await {
                warn!(hold_id = %hold_id, error = %e, "failed to release abandoned hold");
            }
        });
    }

    async fn release_in_flight(&self, hold: &Hold) {
        if let Err(e) = self.engine.release_hold(hold.id).await {
            // The sweeper reclaims it once the TTL passes.
            warn!(hold_id = %hold.id, error = %e, "failed to release in-flight hold");
        }
    }

    async fn exhausted(
        &self,
        booking: Booking,
        attempts: Vec<AttemptRecord>,
    ) -> Result<AssignOutcome, AssignError> {
        let defer = self.settings.coordinator.on_exhausted == OnExhausted::Defer
            && lifecycle::can_transition(booking.status, BookingStatus::PendingAllocation);
        if !defer {
            return Err(AssignError::NoCapacity { attempts });
        }
        let booking = self
            .engine
            .transition_booking(booking.id, BookingStatus::PendingAllocation, None)
            .await
            .map_err(AssignError::from_engine)?;
        info!(
            target: "tablewise::assignment",
            booking_id = %booking.id,
            attempts = attempts.len(),
            "no tables available, booking deferred"
        );
        Ok(AssignOutcome::Deferred { booking })
    }
}

enum AttemptFailure {
    /// The store rejected the hold or the confirm.
    Store(EngineError),
    /// Deadline or cancellation hit during or between acquire and confirm.
    Abort(AssignError),
}

fn task_failure(e: tokio::task::JoinError) -> AttemptFailure {
    AttemptFailure::Store(EngineError::WalError(format!("storage task failed: {e}")))
}
