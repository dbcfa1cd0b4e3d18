use std::collections::HashSet;

use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::conflict::normalize_tables;
use super::Engine;

/// A live claim that blocks a prospective hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoldConflict {
    pub table_id: Ulid,
    /// Hold id or assignment id.
    pub claim_id: Ulid,
    pub kind: &'static str,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub dead: usize,
}

impl Engine {
    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|b| b.value().clone())
    }

    /// Bookings with `status`, earliest block first.
    pub fn bookings_with_status(&self, status: BookingStatus, limit: usize) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.status == status)
            .map(|b| b.value().clone())
            .collect();
        out.sort_by_key(|b| (b.block.start, b.id));
        out.truncate(limit);
        out
    }

    pub fn hold(&self, id: &Ulid) -> Option<Hold> {
        self.holds.get(id).map(|h| h.value().clone())
    }

    pub fn holds_for_booking(&self, booking_id: &Ulid) -> Vec<Hold> {
        let mut out: Vec<Hold> = self
            .holds
            .iter()
            .filter(|h| h.booking_id.as_ref() == Some(booking_id))
            .map(|h| h.value().clone())
            .collect();
        out.sort_by_key(|h| h.id);
        out
    }

    pub fn assignment(&self, id: &Ulid) -> Option<Assignment> {
        self.assignments.get(id).map(|a| a.value().clone())
    }

    pub fn assignments_for_booking(&self, booking_id: &Ulid) -> Vec<Assignment> {
        let ids = self
            .booking_assignments
            .get(booking_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.assignment(id)).collect()
    }

    /// Tables with a live hold or assignment overlapping `span`.
    pub async fn busy_tables(&self, span: &Span, now: Ms) -> HashSet<Ulid> {
        let mut busy = HashSet::new();
        for (table_id, ts) in &self.tables {
            let guard = ts.read().await;
            if guard.overlapping(span).any(|i| i.is_live(now)) {
                busy.insert(*table_id);
            }
        }
        busy
    }

    /// Every live claim on `table_ids` overlapping `span`, by table then start.
    pub async fn find_hold_conflicts(&self, table_ids: &[Ulid], span: &Span, now: Ms) -> Vec<HoldConflict> {
        let mut out = Vec::new();
        for table_id in normalize_tables(table_ids) {
            let Some(ts) = self.tables.get(&table_id) else {
                continue;
            };
            let guard = ts.read().await;
            for interval in guard.overlapping(span).filter(|i| i.is_live(now)) {
                out.push(HoldConflict {
                    table_id,
                    claim_id: interval.id,
                    kind: match interval.kind {
                        IntervalKind::Hold { .. } => "hold",
                        IntervalKind::Assignment { .. } => "assignment",
                    },
                    span: interval.span,
                });
            }
        }
        out
    }

    /// Hold ids expired at `now`, soonest-expired first.
    pub fn collect_expired_holds(&self, now: Ms, limit: usize) -> Vec<Ulid> {
        let mut expired: Vec<(Ms, Ulid)> = self
            .holds
            .iter()
            .filter(|h| !h.is_live(now))
            .map(|h| (h.expires_at, h.id))
            .collect();
        expired.sort();
        expired.into_iter().take(limit).map(|(_, id)| id).collect()
    }

    /// Assignments whose booking is gone, cancelled or a no-show.
    pub fn collect_orphaned_assignments(&self, limit: usize) -> Vec<Ulid> {
        let mut orphaned: Vec<Ulid> = self
            .assignments
            .iter()
            .filter(|a| {
                self.bookings.get(&a.booking_id).is_none_or(|b| {
                    matches!(b.status, BookingStatus::Cancelled | BookingStatus::NoShow)
                })
            })
            .map(|a| a.id)
            .collect();
        orphaned.sort();
        orphaned.truncate(limit);
        orphaned
    }

    pub fn outbox_event(&self, id: &Ulid) -> Option<OutboxEvent> {
        self.outbox.get(id).map(|e| e.value().clone())
    }

    pub fn outbox_stats(&self) -> OutboxStats {
        let mut stats = OutboxStats::default();
        for entry in self.outbox.iter() {
            match entry.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Done => stats.done += 1,
                OutboxStatus::Dead => stats.dead += 1,
            }
        }
        stats
    }
}
