use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::policy::ServiceKey;

/// Unix milliseconds. Every stored instant is absolute, never wall-clock.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Venue layout ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableCategory {
    Bar,
    Dining,
    Lounge,
    Patio,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatingType {
    Standard,
    Sofa,
    Booth,
    HighTop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableFeature {
    Window,
    Quiet,
}

fn default_true() -> bool {
    true
}

fn default_min_party() -> u32 {
    1
}

/// A physical table. Changed only by venue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: Ulid,
    pub number: String,
    pub zone_id: Ulid,
    pub category: TableCategory,
    #[serde(default = "default_seating_type")]
    pub seating_type: SeatingType,
    #[serde(default = "default_min_party")]
    pub min_party_size: u32,
    pub capacity: u32,
    #[serde(default)]
    pub features: Vec<TableFeature>,
    /// Tables this one may be merged with. Symmetrized by the graph.
    #[serde(default)]
    pub adjacent: Vec<Ulid>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_seating_type() -> SeatingType {
    SeatingType::Standard
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: Ulid,
    pub name: String,
    #[serde(default)]
    pub outdoor: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatingPreference {
    #[default]
    Any,
    Indoor,
    Outdoor,
    Bar,
    Window,
    Quiet,
    Booth,
}

impl SeatingPreference {
    pub fn matches(&self, table: &Table, zone: Option<&Zone>) -> bool {
        let outdoor = table.category == TableCategory::Patio || zone.is_some_and(|z| z.outdoor);
        match self {
            SeatingPreference::Any => true,
            SeatingPreference::Indoor => !outdoor,
            SeatingPreference::Outdoor => outdoor,
            SeatingPreference::Bar => table.category == TableCategory::Bar,
            SeatingPreference::Window => table.features.contains(&TableFeature::Window),
            SeatingPreference::Quiet => table.features.contains(&TableFeature::Quiet),
            SeatingPreference::Booth => table.seating_type == SeatingType::Booth,
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    PendingAllocation,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 7] = [
        BookingStatus::Pending,
        BookingStatus::PendingAllocation,
        BookingStatus::Confirmed,
        BookingStatus::CheckedIn,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::NoShow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::PendingAllocation => "pending_allocation",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown booking status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        BookingStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// A guest booking. Mutated only through the lifecycle table, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub restaurant_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub service: ServiceKey,
    pub party_size: u32,
    pub seating_preference: SeatingPreference,
    pub status: BookingStatus,
    pub assigned_zone: Option<Ulid>,
    /// Time the guest is seated.
    pub dining: Span,
    /// Time the tables are occupied: dining plus pre/post buffers.
    pub block: Span,
    pub contact: Contact,
    pub created_at: Ms,
    /// Bumped on every status write; used as the optimistic guard.
    pub version: u64,
}

// ── Holds and assignments ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub restaurant_id: Ulid,
    pub booking_id: Option<Ulid>,
    /// Sorted, deduplicated.
    pub table_ids: Vec<Ulid>,
    pub zone_id: Option<Ulid>,
    pub span: Span,
    pub created_at: Ms,
    pub expires_at: Ms,
    /// Venue policy version the hold was quoted under.
    pub policy_version: Option<u32>,
}

impl Hold {
    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Ulid,
    pub restaurant_id: Ulid,
    pub booking_id: Ulid,
    pub table_ids: Vec<Ulid>,
    pub span: Span,
    pub hold_id: Ulid,
    pub created_at: Ms,
}

// ── Outbox ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Done,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Ulid,
    pub event_type: String,
    pub restaurant_id: Ulid,
    pub booking_id: Option<Ulid>,
    /// JSON document. Kept as text so the WAL codec stays self-describing-free.
    pub payload: String,
    pub status: OutboxStatus,
    pub attempt_count: u32,
    pub next_attempt_at: Ms,
    pub created_at: Ms,
    pub dedupe_key: Option<String>,
    pub last_error: Option<String>,
}

// ── Per-table occupancy ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalKind {
    Hold { expires_at: Ms },
    Assignment { booking_id: Ulid },
}

/// One claim on a table. Holds and assignments share the same timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    /// Hold id or assignment id.
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn is_live(&self, now: Ms) -> bool {
        match self.kind {
            IntervalKind::Hold { expires_at } => expires_at > now,
            IntervalKind::Assignment { .. } => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableState {
    pub table_id: Ulid,
    /// Sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl TableState {
    pub fn new(table_id: Ulid) -> Self {
        Self {
            table_id,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Intervals whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// State changes. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated(Booking),
    BookingUpdated {
        id: Ulid,
        status: BookingStatus,
        assigned_zone: Option<Ulid>,
        version: u64,
    },
    HoldPlaced(Hold),
    HoldReleased {
        id: Ulid,
    },
    AssignmentCreated(Assignment),
    AssignmentRemoved {
        id: Ulid,
    },
    OutboxEnqueued(OutboxEvent),
    OutboxUpdated {
        id: Ulid,
        status: OutboxStatus,
        attempt_count: u32,
        next_attempt_at: Ms,
        last_error: Option<String>,
    },
    /// A dedupe key whose row was delivered and compacted away.
    OutboxKeyRetained {
        key: String,
        id: Ulid,
    },
}

/// One atomic unit in the WAL: either every event applies or none does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub at: Ms,
    pub events: Vec<Event>,
}

impl Commit {
    pub fn new(at: Ms, events: Vec<Event>) -> Self {
        Self { at, events }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(category: TableCategory, seating_type: SeatingType, features: Vec<TableFeature>) -> Table {
        Table {
            id: Ulid::new(),
            number: "T1".into(),
            zone_id: Ulid::new(),
            category,
            seating_type,
            min_party_size: 1,
            capacity: 4,
            features,
            adjacent: vec![],
            active: true,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // touching, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn interval_ordering_and_overlap() {
        let mut ts = TableState::new(Ulid::new());
        for (start, end) in [(300, 400), (100, 200), (200, 300)] {
            ts.insert_interval(Interval {
                id: Ulid::new(),
                span: Span::new(start, end),
                kind: IntervalKind::Assignment { booking_id: Ulid::new() },
            });
        }
        let starts: Vec<Ms> = ts.intervals.iter().map(|i| i.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);

        let hits: Vec<_> = ts.overlapping(&Span::new(200, 300)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(200, 300));
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut ts = TableState::new(Ulid::new());
        ts.insert_interval(Interval {
            id: Ulid::new(),
            span: Span::new(100, 200),
            kind: IntervalKind::Hold { expires_at: 10 },
        });
        assert!(ts.remove_interval(Ulid::new()).is_none());
        assert_eq!(ts.intervals.len(), 1);
    }

    #[test]
    fn expired_hold_interval_is_not_live() {
        let interval = Interval {
            id: Ulid::new(),
            span: Span::new(0, 10),
            kind: IntervalKind::Hold { expires_at: 500 },
        };
        assert!(interval.is_live(499));
        assert!(!interval.is_live(500));
    }

    #[test]
    fn status_parse() {
        assert_eq!("checked_in".parse::<BookingStatus>(), Ok(BookingStatus::CheckedIn));
        assert_eq!(" NO_SHOW ".parse::<BookingStatus>(), Ok(BookingStatus::NoShow));
        assert!("seated".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn seating_preference_matching() {
        let patio = table(TableCategory::Patio, SeatingType::Standard, vec![]);
        let booth = table(TableCategory::Dining, SeatingType::Booth, vec![TableFeature::Window]);
        let garden = Zone { id: Ulid::new(), name: "Garden".into(), outdoor: true };

        assert!(SeatingPreference::Outdoor.matches(&patio, None));
        assert!(!SeatingPreference::Indoor.matches(&patio, None));
        assert!(SeatingPreference::Booth.matches(&booth, None));
        assert!(SeatingPreference::Window.matches(&booth, None));
        assert!(!SeatingPreference::Quiet.matches(&booth, None));
        assert!(SeatingPreference::Outdoor.matches(&booth, Some(&garden)));
        assert!(SeatingPreference::Any.matches(&booth, None));
    }

    #[test]
    fn commit_serialization_roundtrip() {
        let commit = Commit::new(
            5,
            vec![
                Event::HoldReleased { id: Ulid::new() },
                Event::AssignmentRemoved { id: Ulid::new() },
            ],
        );
        let bytes = bincode::serialize(&commit).unwrap();
        let decoded: Commit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(commit, decoded);
    }
}
