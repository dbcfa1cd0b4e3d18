//! Availability quotes: is a slot open, and if not, what is nearby.

use chrono::{Duration, NaiveDate, NaiveTime, Timelike};
use serde::Serialize;
use tracing::debug;

use crate::engine::now_ms;
use crate::graph::{Combination, TableGraph};
use crate::limits::MAX_ALTERNATIVES;
use crate::model::{Ms, SeatingPreference};
use crate::policy::{ServiceKey, VenuePolicy};
use crate::registry::Venue;
use crate::window::{assert_not_in_past, compute_booking_window, local_to_ms, BookingWindow, WindowError};

/// Minutes between quoted slots.
pub const SLOT_INTERVAL_MINUTES: u32 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotOption {
    pub date: NaiveDate,
    /// `HH:MM` in venue time.
    pub time: String,
    pub service: ServiceKey,
    pub table_numbers: Vec<String>,
    pub total_capacity: u32,
    #[serde(skip)]
    starts_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityReport {
    pub date: NaiveDate,
    pub time: String,
    pub party_size: u32,
    pub available: bool,
    /// Error code explaining why the slot is closed.
    pub reason: Option<&'static str>,
    pub window: Option<BookingWindow>,
    pub tables: Option<Combination>,
    /// Closest open slots, nearest first. Empty when the slot is open.
    pub alternatives: Vec<SlotOption>,
}

enum SlotState {
    Open(BookingWindow, Combination),
    Closed(Option<BookingWindow>, &'static str),
}

impl Venue {
    /// Quote one slot. Closed slots come back with ranked alternatives.
    ///
    /// Only an out-of-range party size is an error; every other reason a slot
    /// cannot be booked is reported in the result.
    pub async fn check_slot(
        &self,
        date: NaiveDate,
        time: NaiveTime,
        party_size: u32,
        preference: SeatingPreference,
    ) -> Result<AvailabilityReport, WindowError> {
        let policy = self.policy().await;
        let state = self.slot_state(&policy, date, time, party_size, preference, None).await?;

        let mut report = AvailabilityReport {
            date,
            time: format!("{:02}:{:02}", time.hour(), time.minute()),
            party_size,
            available: false,
            reason: None,
            window: None,
            tables: None,
            alternatives: Vec::new(),
        };
        match state {
            SlotState::Open(window, combination) => {
                report.available = true;
                report.window = Some(window);
                report.tables = Some(combination);
            }
            SlotState::Closed(window, reason) => {
                report.reason = Some(reason);
                report.window = window;
                let wanted = match window {
                    Some(w) => Some(w.dining.start),
                    // A wall-clock time skipped by DST is ranked from the hour after it.
                    None => local_to_ms(policy.timezone, date, time)
                        .or_else(|_| local_to_ms(policy.timezone, date, time + Duration::hours(1)))
                        .ok(),
                };
                if let Some(wanted) = wanted {
                    let open = self.open_slots(&policy, date, party_size, preference).await?;
                    report.alternatives = rank_alternatives(open, wanted);
                }
            }
        }
        Ok(report)
    }

    /// Every open slot on `date`, in time order.
    pub async fn available_slots(
        &self,
        date: NaiveDate,
        party_size: u32,
        preference: SeatingPreference,
    ) -> Result<Vec<SlotOption>, WindowError> {
        let policy = self.policy().await;
        let mut slots = self.open_slots(&policy, date, party_size, preference).await?;
        slots.sort_by_key(|s| s.starts_at);
        Ok(slots)
    }

    async fn open_slots(
        &self,
        policy: &VenuePolicy,
        date: NaiveDate,
        party_size: u32,
        preference: SeatingPreference,
    ) -> Result<Vec<SlotOption>, WindowError> {
        let mut open = Vec::new();
        for (service, period) in policy.ordered_services() {
            let minutes = period.duration_minutes();
            for offset in (0..minutes).step_by(SLOT_INTERVAL_MINUTES as usize) {
                let time = period.start + Duration::minutes(i64::from(offset));
                // Slots after midnight belong to the next calendar day.
                let slot_date = if time < period.start { date + Duration::days(1) } else { date };
                let state = self
                    .slot_state(policy, slot_date, time, party_size, preference, Some(service))
                    .await?;
                if let SlotState::Open(window, combination) = state {
                    open.push(SlotOption {
                        date: slot_date,
                        time: format!("{:02}:{:02}", time.hour(), time.minute()),
                        service,
                        table_numbers: combination.table_numbers,
                        total_capacity: combination.total_capacity,
                        starts_at: window.dining.start,
                    });
                }
            }
        }
        debug!(restaurant_id = %self.id, %date, party_size, open = open.len(), "slots scanned");
        Ok(open)
    }

    async fn slot_state(
        &self,
        policy: &VenuePolicy,
        date: NaiveDate,
        time: NaiveTime,
        party_size: u32,
        preference: SeatingPreference,
        service: Option<ServiceKey>,
    ) -> Result<SlotState, WindowError> {
        let window = match compute_booking_window(date, time, party_size, policy, service) {
            Ok(window) => window,
            Err(e @ WindowError::InvalidPartySize(_)) => return Err(e),
            Err(e) => return Ok(SlotState::Closed(None, e.code())),
        };
        let now = now_ms();
        if !self.settings.allow_backdating
            && let Err(e) = assert_not_in_past(window.dining.start, now, self.settings.past_grace_minutes)
        {
            return Ok(SlotState::Closed(Some(window), e.code()));
        }

        let busy = self.engine.busy_tables(&window.block, now).await;
        let best = self
            .graph
            .find_combinations(party_size, preference, &busy, &self.settings.planner)
            .into_iter()
            .next();
        Ok(match best {
            Some(combination) => SlotState::Open(window, combination),
            None => SlotState::Closed(Some(window), "NO_CAPACITY"),
        })
    }
}

/// Nearest first by distance from `wanted`; earlier wins a tie.
fn rank_alternatives(mut open: Vec<SlotOption>, wanted: Ms) -> Vec<SlotOption> {
    open.retain(|s| s.starts_at != wanted);
    open.sort_by_key(|s| ((s.starts_at - wanted).abs(), s.starts_at));
    open.truncate(MAX_ALTERNATIVES);
    open
}

/// Covers one service can seat: per active table, whole turns times capacity.
pub fn service_rotations(policy: &VenuePolicy, service: ServiceKey, graph: &TableGraph) -> u32 {
    let Some(period) = policy.service(service) else {
        return 0;
    };
    graph
        .tables()
        .filter(|t| t.active)
        .map(|t| period.rotations(t.capacity) * t.capacity)
        .sum()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use ulid::Ulid;

    use super::*;
    use crate::config::{Config, VenueConfig};
    use crate::coordinator::Trigger;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::registry::VenueSettings;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tablewise_test_availability");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn table(number: &str, zone: Ulid, capacity: u32) -> Table {
        Table {
            id: Ulid::new(),
            number: number.into(),
            zone_id: zone,
            category: TableCategory::Dining,
            seating_type: SeatingType::Standard,
            min_party_size: 1,
            capacity,
            features: vec![],
            adjacent: vec![],
            active: true,
        }
    }

    fn venue(name: &str) -> Venue {
        let zone = Zone { id: Ulid::new(), name: "Main".into(), outdoor: false };
        let config = VenueConfig {
            id: Ulid::new(),
            name: "Test".into(),
            policy: VenuePolicy::default(),
            tables: vec![table("1", zone.id, 2), table("2", zone.id, 2), table("3", zone.id, 4)],
            zones: vec![zone],
        };
        let settings = VenueSettings::from_config(&Config::default());
        Venue::new(&config, settings, test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    async fn future_date(venue: &Venue) -> NaiveDate {
        let tz = venue.policy().await.timezone;
        (Utc::now() + Duration::days(3)).with_timezone(&tz).date_naive()
    }

    async fn seat(venue: &Venue, date: NaiveDate, time: NaiveTime, party_size: u32) {
        let policy = venue.policy().await;
        let window = compute_booking_window(date, time, party_size, &policy, None).unwrap();
        let booking = Booking {
            id: Ulid::new(),
            restaurant_id: venue.id,
            date,
            start_time: time,
            end_time: time + Duration::minutes(i64::from(window.duration_minutes)),
            service: window.service,
            party_size,
            seating_preference: SeatingPreference::Any,
            status: BookingStatus::Pending,
            assigned_zone: None,
            dining: window.dining,
            block: window.block,
            contact: Contact::default(),
            created_at: now_ms(),
            version: 0,
        };
        venue.engine.create_booking(booking.clone()).await.unwrap();
        venue
            .plan_and_assign(booking.id, Trigger::Creation, CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn open_slot_quotes_tables() {
        let v = venue("open.wal");
        let date = future_date(&v).await;
        let report = v.check_slot(date, at(19, 0), 2, SeatingPreference::Any).await.unwrap();
        assert!(report.available);
        assert_eq!(report.time, "19:00");
        assert_eq!(report.tables.unwrap().total_capacity, 2);
        assert!(report.alternatives.is_empty());
    }

    #[tokio::test]
    async fn full_slot_offers_nearest_alternatives() {
        let v = venue("full.wal");
        let date = future_date(&v).await;
        for _ in 0..3 {
            seat(&v, date, at(19, 0), 2).await;
        }

        let report = v.check_slot(date, at(19, 0), 2, SeatingPreference::Any).await.unwrap();
        assert!(!report.available);
        assert_eq!(report.reason, Some("NO_CAPACITY"));
        assert_eq!(report.alternatives.len(), MAX_ALTERNATIVES);
        let times: Vec<&str> = report.alternatives.iter().map(|s| s.time.as_str()).collect();
        // 19:00-20:05 is taken on every table; 17:45 and 20:15 are equally close.
        assert_eq!(&times[..4], &["17:45", "20:15", "17:30", "20:30"]);
    }

    #[tokio::test]
    async fn outside_service_hours_is_reported_not_raised() {
        let v = venue("closed.wal");
        let date = future_date(&v).await;
        let report = v.check_slot(date, at(23, 30), 2, SeatingPreference::Any).await.unwrap();
        assert!(!report.available);
        assert_eq!(report.reason, Some("INVALID_WINDOW"));
        assert!(report.window.is_none());
        assert!(!report.alternatives.is_empty());

        assert!(matches!(
            v.check_slot(date, at(19, 0), 0, SeatingPreference::Any).await,
            Err(WindowError::InvalidPartySize(0))
        ));
    }

    #[tokio::test]
    async fn day_listing_covers_both_services() {
        let v = venue("listing.wal");
        let date = future_date(&v).await;
        let slots = v.available_slots(date, 4, SeatingPreference::Any).await.unwrap();
        // 12:00..15:00 and 17:00..22:00 every 15 minutes.
        assert_eq!(slots.len(), 12 + 20);
        assert_eq!(slots[0].time, "12:00");
        assert_eq!(slots[0].service, ServiceKey::Lunch);
        assert!(slots.windows(2).all(|w| w[0].starts_at < w[1].starts_at));
    }

    #[tokio::test]
    async fn time_skipped_by_dst_is_reported_closed() {
        let v = venue("dst_gap.wal");
        // London clocks jump from 01:00 to 02:00 on this Sunday.
        let spring_forward = NaiveDate::from_ymd_opt(2027, 3, 28).unwrap();
        let report = v
            .check_slot(spring_forward, at(1, 30), 2, SeatingPreference::Any)
            .await
            .unwrap();
        assert!(!report.available);
        assert!(report.reason.is_some());
        assert!(report.window.is_none());
        assert_eq!(report.alternatives[0].time, "12:00");
    }

    #[test]
    fn alternatives_rank_by_distance_then_earlier() {
        let option = |starts_at: Ms| SlotOption {
            date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            time: String::new(),
            service: ServiceKey::Dinner,
            table_numbers: vec![],
            total_capacity: 2,
            starts_at,
        };
        let ranked = rank_alternatives(vec![option(130), option(70), option(100), option(95)], 100);
        let starts: Vec<Ms> = ranked.iter().map(|s| s.starts_at).collect();
        assert_eq!(starts, vec![95, 70, 130]);
    }

    #[test]
    fn rotations_per_service() {
        let zone = Ulid::new();
        let graph = TableGraph::new(
            vec![Zone { id: zone, name: "Main".into(), outdoor: false }],
            vec![table("1", zone, 2), table("2", zone, 2), table("3", zone, 4)],
        )
        .unwrap();
        let policy = VenuePolicy::default();
        // Lunch is 180 minutes: two-tops turn every 65, the four-top every 80.
        assert_eq!(service_rotations(&policy, ServiceKey::Lunch, &graph), 2 * 2 + 2 * 2 + 2 * 4);
        assert_eq!(service_rotations(&policy, ServiceKey::Drinks, &graph), 0);
    }
}
