use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::lifecycle;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::outbox;

use super::conflict::{check_no_conflict, normalize_tables, now_ms, validate_span};
use super::{Engine, EngineError, TableLocks, WalCommand};

/// A request to claim tables for a window.
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub table_ids: Vec<Ulid>,
    pub span: Span,
    pub ttl_ms: Ms,
    pub booking_id: Option<Ulid>,
    pub zone_id: Option<Ulid>,
    pub policy_version: Option<u32>,
}

/// What the caller expects the hold to contain when binding it to a booking.
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub booking_id: Ulid,
    /// When set, must equal the held table set.
    pub table_ids: Option<Vec<Ulid>>,
    /// Policy version the caller is currently running with.
    pub policy_version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub total: usize,
    pub hold_ids: Vec<Ulid>,
}

impl Engine {
    /// Persist a new booking together with its `booking.created` outbox row.
    pub async fn create_booking(&self, booking: Booking) -> Result<Booking, EngineError> {
        if booking.restaurant_id != self.restaurant_id {
            return Err(EngineError::InvalidRequest("booking belongs to another restaurant"));
        }
        if booking.party_size == 0 {
            return Err(EngineError::InvalidRequest("party size must be at least 1"));
        }
        if booking.party_size > MAX_PARTY_SIZE {
            return Err(EngineError::LimitExceeded("party too large"));
        }
        if booking.contact.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("contact name too long"));
        }
        let contact_fields = [&booking.contact.email, &booking.contact.phone];
        if contact_fields
            .iter()
            .any(|f| f.as_ref().is_some_and(|v| v.len() > MAX_CONTACT_FIELD_LEN))
        {
            return Err(EngineError::LimitExceeded("contact field too long"));
        }
        validate_span(&booking.dining)?;
        validate_span(&booking.block)?;
        if !booking.block.contains_span(&booking.dining) {
            return Err(EngineError::InvalidRequest("block window must cover the dining window"));
        }

        let lock = self.booking_locks.entry(booking.id).or_default().clone();
        let _guard = lock.lock().await;
        if self.bookings.contains_key(&booking.id) {
            return Err(EngineError::BookingExists(booking.id));
        }

        let now = now_ms();
        let payload = serde_json::json!({
            "booking_id": booking.id,
            "restaurant_id": booking.restaurant_id,
            "date": booking.date,
            "start_time": booking.start_time,
            "party_size": booking.party_size,
            "service": booking.service,
            "status": booking.status,
        });
        let mut events = vec![Event::BookingCreated(booking.clone())];
        events.extend(self.outbox_row(
            outbox::BOOKING_CREATED,
            Some(booking.id),
            payload,
            Some(format!("booking.created:{}", booking.id)),
            now,
        ));
        self.persist_and_apply(events, &mut TableLocks::none()).await?;
        Ok(booking)
    }

    /// Claim every table in `req.table_ids` for `req.span`, all or nothing.
    pub async fn acquire_hold(&self, req: HoldRequest) -> Result<Hold, EngineError> {
        let result = self.acquire_hold_inner(req).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(EngineError::Conflict { .. }) => "conflict",
            Err(_) => "rejected",
        };
        metrics::counter!(observability::HOLDS_ACQUIRED_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn acquire_hold_inner(&self, req: HoldRequest) -> Result<Hold, EngineError> {
        validate_span(&req.span)?;
        if req.table_ids.is_empty() {
            return Err(EngineError::InvalidRequest("hold needs at least one table"));
        }
        if req.ttl_ms <= 0 {
            return Err(EngineError::InvalidRequest("hold ttl must be positive"));
        }
        if req.ttl_ms > MAX_HOLD_TTL_MS {
            return Err(EngineError::LimitExceeded("hold ttl too long"));
        }
        let table_ids = normalize_tables(&req.table_ids);
        if table_ids.len() > MAX_TABLES_PER_HOLD {
            return Err(EngineError::LimitExceeded("too many tables in one hold"));
        }
        if let Some(unknown) = table_ids.iter().find(|id| !self.tables.contains_key(id)) {
            return Err(EngineError::UnknownTable(*unknown));
        }
        if let Some(zone_id) = req.zone_id
            && self.graph.zone(&zone_id).is_none()
        {
            return Err(EngineError::InvalidRequest("unknown zone"));
        }

        let mut locks = self.lock_tables(&table_ids).await?;
        let now = now_ms();
        for ts in locks.iter() {
            check_no_conflict(ts, &req.span, now, None)?;
        }

        let hold = Hold {
            id: Ulid::new(),
            restaurant_id: self.restaurant_id,
            booking_id: req.booking_id,
            table_ids,
            zone_id: req.zone_id,
            span: req.span,
            created_at: now,
            expires_at: now + req.ttl_ms,
            policy_version: req.policy_version,
        };
        self.persist_and_apply(vec![Event::HoldPlaced(hold.clone())], &mut locks)
            .await?;
        Ok(hold)
    }

    /// Turn a live hold into a durable assignment for `req.booking_id`.
    ///
    /// In one commit: the hold is released, the assignment is created, the
    /// booking moves to `confirmed`, and a `capacity.hold.confirmed` outbox row
    /// is queued. Every check runs before anything is written.
    pub async fn confirm_hold(
        &self,
        hold_id: Ulid,
        req: ConfirmRequest,
    ) -> Result<Assignment, EngineError> {
        let now = now_ms();
        let hold = self.hold(&hold_id).ok_or(EngineError::HoldNotFound(hold_id))?;
        if !hold.is_live(now) {
            return Err(EngineError::HoldExpired(hold_id));
        }
        if let Some(held_for) = hold.booking_id
            && held_for != req.booking_id
        {
            return Err(EngineError::HoldBookingMismatch {
                hold_id,
                held_for,
                requested: req.booking_id,
            });
        }
        if hold.table_ids.is_empty() {
            return Err(EngineError::HoldEmpty(hold_id));
        }

        let _booking_guard = self.lock_booking(&req.booking_id).await?;
        let booking = self
            .booking(&req.booking_id)
            .ok_or(EngineError::BookingNotFound(req.booking_id))?;
        if booking.restaurant_id != hold.restaurant_id {
            return Err(EngineError::HoldRestaurantMismatch {
                hold_id,
                hold_restaurant: hold.restaurant_id,
                booking_restaurant: booking.restaurant_id,
            });
        }

        let mut missing = Vec::new();
        if hold.policy_version.is_none() {
            missing.push("policy_version");
        }
        if hold.zone_id.is_none() {
            missing.push("zone_id");
        }
        let (Some(quoted), Some(zone_id)) = (hold.policy_version, hold.zone_id) else {
            return Err(EngineError::HoldMetadataIncomplete { hold_id, missing });
        };
        if quoted != req.policy_version {
            return Err(EngineError::PolicyDrift {
                quoted,
                current: req.policy_version,
            });
        }
        if let Some(expected) = &req.table_ids
            && normalize_tables(expected) != hold.table_ids
        {
            return Err(EngineError::HoldTableMismatch(hold_id));
        }

        if !lifecycle::can_transition(booking.status, BookingStatus::Confirmed) {
            return Err(EngineError::AssignmentValidation(format!(
                "booking is {}",
                booking.status
            )));
        }
        if self.booking_assignments.contains_key(&booking.id) {
            return Err(EngineError::AssignmentValidation(
                "booking already has tables".into(),
            ));
        }
        if !hold.span.contains_span(&booking.block) {
            return Err(EngineError::AssignmentValidation(
                "hold window does not cover the booking".into(),
            ));
        }
        let capacity = self
            .graph
            .capacity_of(&hold.table_ids)
            .ok_or(EngineError::AssignmentValidation("hold references an unknown table".into()))?;
        if capacity < booking.party_size {
            return Err(EngineError::AssignmentValidation(format!(
                "tables seat {capacity}, party is {}",
                booking.party_size
            )));
        }

        let mut locks = self.lock_tables(&hold.table_ids).await?;
        // The sweeper or a release may have won the race for the locks.
        let now = now_ms();
        match self.hold(&hold_id) {
            None => return Err(EngineError::HoldNotFound(hold_id)),
            Some(h) if !h.is_live(now) => return Err(EngineError::HoldExpired(hold_id)),
            Some(_) => {}
        }
        for ts in locks.iter() {
            check_no_conflict(ts, &booking.block, now, Some(hold_id))?;
        }

        let assignment = Assignment {
            id: Ulid::new(),
            restaurant_id: self.restaurant_id,
            booking_id: booking.id,
            table_ids: hold.table_ids.clone(),
            span: booking.block,
            hold_id,
            created_at: now,
        };
        let payload = serde_json::json!({
            "hold_id": hold_id,
            "booking_id": booking.id,
            "assignment_id": assignment.id,
            "table_ids": assignment.table_ids,
            "zone_id": zone_id,
            "policy_version": quoted,
        });
        let mut events = vec![
            Event::HoldReleased { id: hold_id },
            Event::AssignmentCreated(assignment.clone()),
            Event::BookingUpdated {
                id: booking.id,
                status: BookingStatus::Confirmed,
                assigned_zone: Some(zone_id),
                version: booking.version + 1,
            },
        ];
        events.extend(self.outbox_row(
            outbox::HOLD_CONFIRMED,
            Some(booking.id),
            payload,
            Some(format!("hold.confirmed:{hold_id}")),
            now,
        ));
        self.persist_and_apply(events, &mut locks).await?;
        metrics::counter!(observability::HOLDS_CONFIRMED_TOTAL).increment(1);
        Ok(assignment)
    }

    /// Drop a hold. Returns false if it was already gone.
    pub async fn release_hold(&self, hold_id: Ulid) -> Result<bool, EngineError> {
        let Some(hold) = self.hold(&hold_id) else {
            return Ok(false);
        };
        let mut locks = self.lock_tables(&hold.table_ids).await?;
        if !self.holds.contains_key(&hold_id) {
            return Ok(false);
        }
        self.persist_and_apply(vec![Event::HoldReleased { id: hold_id }], &mut locks)
            .await?;
        Ok(true)
    }

    /// Release up to `limit` holds whose expiry is at or before `now`.
    pub async fn expire_stale_holds(&self, now: Ms, limit: usize) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        for hold_id in self.collect_expired_holds(now, limit.min(MAX_SWEEP_BATCH)) {
            let Some(hold) = self.hold(&hold_id) else {
                continue;
            };
            let mut locks = self.lock_tables(&hold.table_ids).await?;
            match self.hold(&hold_id) {
                Some(h) if !h.is_live(now) => {}
                _ => continue,
            }
            self.persist_and_apply(vec![Event::HoldReleased { id: hold_id }], &mut locks)
                .await?;
            report.total += 1;
            report.hold_ids.push(hold_id);
        }
        metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(report.total as u64);
        Ok(report)
    }

    /// Move a booking along the lifecycle table.
    ///
    /// Moving to the current status is accepted and writes nothing. When
    /// `expected_version` is given it must match the stored version.
    pub async fn transition_booking(
        &self,
        booking_id: Ulid,
        to: BookingStatus,
        expected_version: Option<u64>,
    ) -> Result<Booking, EngineError> {
        let _guard = self.lock_booking(&booking_id).await?;
        let mut booking = self
            .booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        if let Some(expected) = expected_version
            && expected != booking.version
        {
            return Err(EngineError::VersionConflict {
                expected,
                actual: booking.version,
            });
        }
        let check = lifecycle::validate_transition(booking.status, to);
        if !check.allowed {
            return Err(EngineError::TransitionNotAllowed {
                from: booking.status,
                to,
                allowed: check.allowed_targets,
            });
        }
        if booking.status == to {
            return Ok(booking);
        }

        let from = booking.status;
        let version = booking.version + 1;
        let payload = serde_json::json!({
            "booking_id": booking_id,
            "from": from,
            "to": to,
            "version": version,
        });
        let mut events = vec![Event::BookingUpdated {
            id: booking_id,
            status: to,
            assigned_zone: booking.assigned_zone,
            version,
        }];
        events.extend(self.outbox_row(
            outbox::BOOKING_STATUS_CHANGED,
            Some(booking_id),
            payload,
            Some(format!("booking.status:{booking_id}:{version}")),
            now_ms(),
        ));
        self.persist_and_apply(events, &mut TableLocks::none()).await?;

        booking.status = to;
        booking.version = version;
        Ok(booking)
    }

    /// Free the tables of an assignment. Returns false if it was already gone.
    pub async fn release_assignment(&self, assignment_id: Ulid) -> Result<bool, EngineError> {
        let Some(assignment) = self.assignment(&assignment_id) else {
            return Ok(false);
        };
        let mut locks = self.lock_tables(&assignment.table_ids).await?;
        if !self.assignments.contains_key(&assignment_id) {
            return Ok(false);
        }
        let payload = serde_json::json!({
            "assignment_id": assignment_id,
            "booking_id": assignment.booking_id,
            "table_ids": assignment.table_ids,
        });
        let mut events = vec![Event::AssignmentRemoved { id: assignment_id }];
        events.extend(self.outbox_row(
            outbox::ASSIGNMENT_RELEASED,
            Some(assignment.booking_id),
            payload,
            Some(format!("assignment.released:{assignment_id}")),
            now_ms(),
        ));
        self.persist_and_apply(events, &mut locks).await?;
        Ok(true)
    }

    // ── Outbox ───────────────────────────────────────────────

    /// Queue a standalone outbox row. Returns None when `dedupe_key` was already used.
    pub async fn enqueue_outbox_event(
        &self,
        event_type: &str,
        booking_id: Option<Ulid>,
        payload: serde_json::Value,
        dedupe_key: Option<String>,
    ) -> Result<Option<Ulid>, EngineError> {
        let Some(event) = self.outbox_row(event_type, booking_id, payload, dedupe_key, now_ms()) else {
            return Ok(None);
        };
        let id = match &event {
            Event::OutboxEnqueued(row) => row.id,
            _ => return Ok(None),
        };
        self.persist_and_apply(vec![event], &mut TableLocks::none()).await?;
        Ok(Some(id))
    }

    /// A new pending outbox row, or None if `dedupe_key` was already used.
    ///
    /// The key is reserved here, before the commit is written, so two callers
    /// racing on one key cannot both enqueue. A failed commit releases it.
    fn outbox_row(
        &self,
        event_type: &str,
        booking_id: Option<Ulid>,
        payload: serde_json::Value,
        dedupe_key: Option<String>,
        now: Ms,
    ) -> Option<Event> {
        let id = Ulid::new();
        if let Some(key) = &dedupe_key {
            match self.outbox_keys.entry(key.clone()) {
                Entry::Occupied(_) => return None,
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }
        Some(Event::OutboxEnqueued(OutboxEvent {
            id,
            event_type: event_type.to_string(),
            restaurant_id: self.restaurant_id,
            booking_id,
            payload: payload.to_string(),
            status: OutboxStatus::Pending,
            attempt_count: 0,
            next_attempt_at: now,
            created_at: now,
            dedupe_key,
            last_error: None,
        }))
    }

    /// Mark up to `limit` due rows as processing and return them, oldest first.
    ///
    /// Claims live in memory only: after a restart every processing row is
    /// pending again, so a crash mid-delivery means at-least-once.
    pub async fn claim_outbox_batch(&self, now: Ms, limit: usize) -> Vec<OutboxEvent> {
        let _claim = self.outbox_claim.lock().await;
        let mut due: Vec<OutboxEvent> = self
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending && e.next_attempt_at <= now)
            .map(|e| e.value().clone())
            .collect();
        due.sort_by_key(|e| (e.next_attempt_at, e.id));
        due.truncate(limit.min(MAX_OUTBOX_BATCH));
        for event in &mut due {
            if let Some(mut entry) = self.outbox.get_mut(&event.id) {
                entry.status = OutboxStatus::Processing;
            }
            event.status = OutboxStatus::Processing;
        }
        due
    }

    /// Return claimed rows whose outcome was never recorded to the queue.
    pub fn release_outbox_claims(&self, ids: &[Ulid]) {
        for id in ids {
            if let Some(mut entry) = self.outbox.get_mut(id) {
                if entry.status == OutboxStatus::Processing {
                    entry.status = OutboxStatus::Pending;
                }
            }
        }
    }

    pub async fn complete_outbox_event(&self, id: Ulid) -> Result<(), EngineError> {
        let event = self
            .outbox
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::InvalidRequest("unknown outbox event"))?;
        let update = Event::OutboxUpdated {
            id,
            status: OutboxStatus::Done,
            attempt_count: event.attempt_count + 1,
            next_attempt_at: event.next_attempt_at,
            last_error: None,
        };
        self.persist_and_apply(vec![update], &mut TableLocks::none()).await
    }

    /// Record a failed delivery. `retry_at = None` parks the row as dead.
    pub async fn fail_outbox_event(
        &self,
        id: Ulid,
        error: String,
        retry_at: Option<Ms>,
    ) -> Result<OutboxStatus, EngineError> {
        let event = self
            .outbox
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::InvalidRequest("unknown outbox event"))?;
        let status = if retry_at.is_some() {
            OutboxStatus::Pending
        } else {
            OutboxStatus::Dead
        };
        let update = Event::OutboxUpdated {
            id,
            status,
            attempt_count: event.attempt_count + 1,
            next_attempt_at: retry_at.unwrap_or(event.next_attempt_at),
            last_error: Some(error),
        };
        self.persist_and_apply(vec![update], &mut TableLocks::none()).await?;
        Ok(status)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only what is needed to rebuild the current state.
    ///
    /// Expired holds and delivered outbox rows are left out, and delivered
    /// rows are also dropped from memory.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let now = now_ms();

        self.outbox.retain(|_, e| e.status != OutboxStatus::Done);
        // Keys outlive their rows so a replayed request is still deduplicated.
        let mut retained_keys: Vec<(String, Ulid)> = self
            .outbox_keys
            .iter()
            .filter(|k| !self.outbox.contains_key(k.value()))
            .map(|k| (k.key().clone(), *k.value()))
            .collect();
        retained_keys.sort();

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        let mut holds: Vec<Hold> = self
            .holds
            .iter()
            .filter(|h| h.is_live(now))
            .map(|h| h.value().clone())
            .collect();
        holds.sort_by_key(|h| h.id);
        let mut assignments: Vec<Assignment> =
            self.assignments.iter().map(|a| a.value().clone()).collect();
        assignments.sort_by_key(|a| a.id);
        let mut outbox_rows: Vec<OutboxEvent> = self.outbox.iter().map(|e| e.value().clone()).collect();
        outbox_rows.sort_by_key(|e| e.id);

        let events = bookings
            .into_iter()
            .map(Event::BookingCreated)
            .chain(holds.into_iter().map(Event::HoldPlaced))
            .chain(assignments.into_iter().map(Event::AssignmentCreated))
            .chain(outbox_rows.into_iter().map(Event::OutboxEnqueued))
            .chain(
                retained_keys
                    .into_iter()
                    .map(|(key, id)| Event::OutboxKeyRetained { key, id }),
            );
        let commits = events.map(|e| Commit::new(now, vec![e])).collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
