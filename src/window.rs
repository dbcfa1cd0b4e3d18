//! Time-of-day helpers and booking window computation.
//!
//! Everything that leaves this module is an absolute instant in unix millis.
//! Wall-clock strings are only ever parsed here, against the venue timezone.

use chrono::{Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::Serialize;

use crate::limits::MAX_PARTY_SIZE;
use crate::model::{Ms, Span, MINUTE_MS};
use crate::policy::{ServiceKey, ServicePeriod, VenuePolicy};

const MINUTES_PER_DAY: u32 = 1440;

// ── Time-of-day helpers ──────────────────────────────────────────

/// Canonical `HH:MM`. Accepts `H:MM`, `HH:MM` and `HH:MM:SS`; anything else is `None`.
pub fn normalize_time(raw: &str) -> Option<String> {
    parse_time(raw).map(|t| format!("{:02}:{:02}", t.hour(), t.minute()))
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    let mut parts = raw.split(':');
    let hour: u32 = parse_field(parts.next()?, 1, 2)?;
    let minute: u32 = parse_field(parts.next()?, 2, 2)?;
    if let Some(seconds) = parts.next() {
        parse_field(seconds, 2, 2)?;
    }
    if parts.next().is_some() {
        return None;
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn parse_field(s: &str, min_len: usize, max_len: usize) -> Option<u32> {
    if s.len() < min_len || s.len() > max_len || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

pub fn to_minutes(raw: &str) -> Option<u32> {
    parse_time(raw).map(|t| t.hour() * 60 + t.minute())
}

pub fn from_minutes(minutes: u32) -> Option<String> {
    if minutes >= MINUTES_PER_DAY {
        return None;
    }
    Some(format!("{:02}:{:02}", minutes / 60, minutes % 60))
}

/// Time-of-day slots from `start` (inclusive) to `end` (exclusive) every `interval` minutes.
#[derive(Debug, Clone)]
pub struct Slots {
    next: u32,
    end: u32,
    interval: u32,
}

impl Iterator for Slots {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.interval == 0 || self.next >= self.end {
            return None;
        }
        let current = self.next;
        self.next = self.next.checked_add(self.interval).unwrap_or(self.end);
        from_minutes(current)
    }
}

/// Malformed bounds, a zero interval or `end <= start` all yield an empty sequence.
/// The iterator is `Clone`, so a caller can restart it from any point.
pub fn slots_for_range(start: &str, end: &str, interval_minutes: u32) -> Slots {
    match (to_minutes(start), to_minutes(end)) {
        (Some(s), Some(e)) if e > s && interval_minutes > 0 => Slots {
            next: s,
            end: e,
            interval: interval_minutes,
        },
        _ => Slots {
            next: 0,
            end: 0,
            interval: 0,
        },
    }
}

/// Strict half-open overlap on absolute instants. Touching windows do not overlap.
pub fn windows_overlap(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

// ── Booking windows ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("invalid time of day: {0}")]
    InvalidTime(String),
    #[error("party size {0} is out of range")]
    InvalidPartySize(u32),
    #[error("no service period covers {date} {time}")]
    InvalidWindow { date: NaiveDate, time: NaiveTime },
    #[error("service {0} is not defined for this venue")]
    UnknownService(ServiceKey),
    #[error("booking would overrun the end of {0} service")]
    ServiceOverrun(ServiceKey),
    #[error("{date} {time} does not exist in {tz}")]
    NonexistentLocalTime { date: NaiveDate, time: NaiveTime, tz: Tz },
    #[error("booking starts {minutes_ago} minutes in the past")]
    BookingInPast { minutes_ago: i64 },
}

impl WindowError {
    pub fn code(&self) -> &'static str {
        match self {
            WindowError::InvalidTime(_) => "INVALID_TIME",
            WindowError::InvalidPartySize(_) => "INVALID_PARTY_SIZE",
            WindowError::InvalidWindow { .. } => "INVALID_WINDOW",
            WindowError::UnknownService(_) => "UNKNOWN_SERVICE",
            WindowError::ServiceOverrun(_) => "SERVICE_OVERRUN",
            WindowError::NonexistentLocalTime { .. } => "NONEXISTENT_LOCAL_TIME",
            WindowError::BookingInPast { .. } => "BOOKING_IN_PAST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BookingWindow {
    pub service: ServiceKey,
    pub dining: Span,
    /// `dining` widened by the service buffers. This is what occupies tables.
    pub block: Span,
    pub duration_minutes: u32,
    pub clamped_to_service_end: bool,
}

/// Resolve a local wall-clock time to an absolute instant. During a DST
/// fall-back the earlier of the two instants is used.
pub fn local_to_ms(tz: Tz, date: NaiveDate, time: NaiveTime) -> Result<Ms, WindowError> {
    match tz.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(dt) => Ok(dt.timestamp_millis()),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.timestamp_millis()),
        LocalResult::None => Err(WindowError::NonexistentLocalTime { date, time, tz }),
    }
}

/// Absolute close of `period` for a booking starting at local `start` on `date`.
fn service_close_ms(
    tz: Tz,
    period: &ServicePeriod,
    date: NaiveDate,
    start: NaiveTime,
) -> Result<Ms, WindowError> {
    let opened_on = if period.crosses_midnight() && start < period.end {
        date - Duration::days(1)
    } else {
        date
    };
    let closes_on = if period.crosses_midnight() {
        opened_on + Duration::days(1)
    } else {
        opened_on
    };
    local_to_ms(tz, closes_on, period.end)
}

pub fn compute_booking_window(
    date: NaiveDate,
    start: NaiveTime,
    party_size: u32,
    policy: &VenuePolicy,
    service_hint: Option<ServiceKey>,
) -> Result<BookingWindow, WindowError> {
    if party_size == 0 || party_size > MAX_PARTY_SIZE {
        return Err(WindowError::InvalidPartySize(party_size));
    }

    let service = match service_hint {
        Some(key) => key,
        None => policy
            .which_service(start)
            .ok_or(WindowError::InvalidWindow { date, time: start })?,
    };
    let period = policy
        .service(service)
        .ok_or(WindowError::UnknownService(service))?;
    if !period.contains(start) {
        return Err(WindowError::InvalidWindow { date, time: start });
    }
    let band = period
        .turn_band(party_size)
        .ok_or(WindowError::UnknownService(service))?;

    let start_ms = local_to_ms(policy.timezone, date, start)?;
    let pre = i64::from(period.buffer.pre) * MINUTE_MS;
    let post = i64::from(period.buffer.post) * MINUTE_MS;

    let mut dining_end = start_ms + i64::from(band.duration_minutes) * MINUTE_MS;
    let block_start = start_ms - pre;
    let mut block_end = dining_end + post;
    let mut clamped = false;

    if !period.allow_overrun {
        let close = service_close_ms(policy.timezone, period, date, start)?;
        if block_end > close {
            block_end = close;
            dining_end = block_end - post;
            clamped = true;
            if dining_end <= start_ms {
                return Err(WindowError::ServiceOverrun(service));
            }
        }
    }

    Ok(BookingWindow {
        service,
        dining: Span::new(start_ms, dining_end),
        block: Span::new(block_start, block_end),
        duration_minutes: ((dining_end - start_ms) / MINUTE_MS) as u32,
        clamped_to_service_end: clamped,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowIssue {
    InvalidTime,
    InvalidPartySize,
    OutsideServiceHours,
    ServiceOverrun,
    /// Informational: the window was shortened to fit the service.
    ClampedToServiceEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowValidation {
    pub ok: bool,
    pub reasons: Vec<WindowIssue>,
    pub window: Option<BookingWindow>,
}

/// Non-failing variant of [`compute_booking_window`] for quoting and forms.
pub fn validate_booking_window(
    date: NaiveDate,
    time: &str,
    party_size: u32,
    policy: &VenuePolicy,
) -> WindowValidation {
    let Some(start) = parse_time(time) else {
        return WindowValidation {
            ok: false,
            reasons: vec![WindowIssue::InvalidTime],
            window: None,
        };
    };

    match compute_booking_window(date, start, party_size, policy, None) {
        Ok(window) => {
            let reasons = if window.clamped_to_service_end {
                vec![WindowIssue::ClampedToServiceEnd]
            } else {
                Vec::new()
            };
            WindowValidation {
                ok: true,
                reasons,
                window: Some(window),
            }
        }
        Err(e) => {
            let issue = match e {
                WindowError::InvalidPartySize(_) => WindowIssue::InvalidPartySize,
                WindowError::InvalidWindow { .. } | WindowError::UnknownService(_) => {
                    WindowIssue::OutsideServiceHours
                }
                WindowError::ServiceOverrun(_) => WindowIssue::ServiceOverrun,
                WindowError::InvalidTime(_)
                | WindowError::NonexistentLocalTime { .. }
                | WindowError::BookingInPast { .. } => WindowIssue::InvalidTime,
            };
            WindowValidation {
                ok: false,
                reasons: vec![issue],
                window: None,
            }
        }
    }
}

/// Whole turns that fit into a service: `floor(service / (turn + buffer))`.
pub fn achievable_turns(service_minutes: u32, turn_minutes: u32, buffer_minutes: u32) -> u32 {
    let per_turn = turn_minutes + buffer_minutes;
    if per_turn == 0 {
        return 0;
    }
    service_minutes / per_turn
}

/// Reject starts older than `now - grace`.
pub fn assert_not_in_past(start: Ms, now: Ms, grace_minutes: u32) -> Result<(), WindowError> {
    let grace = i64::from(grace_minutes) * MINUTE_MS;
    if start + grace < now {
        return Err(WindowError::BookingInPast {
            minutes_ago: (now - start) / MINUTE_MS,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Buffer, TurnBand};
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn normalize_and_minutes() {
        assert_eq!(normalize_time(" 9:05 ").as_deref(), Some("09:05"));
        assert_eq!(normalize_time("18:30:00").as_deref(), Some("18:30"));
        assert_eq!(normalize_time("24:00"), None);
        assert_eq!(normalize_time("18h30"), None);
        assert_eq!(normalize_time(""), None);
        assert_eq!(to_minutes("12:30"), Some(750));
        assert_eq!(from_minutes(750).as_deref(), Some("12:30"));
        assert_eq!(from_minutes(1440), None);
    }

    #[test]
    fn slots_are_deterministic_and_restartable() {
        let slots = slots_for_range("12:00", "13:00", 15);
        let first: Vec<String> = slots.clone().collect();
        assert_eq!(first, vec!["12:00", "12:15", "12:30", "12:45"]);

        let mut partial = slots.clone();
        partial.next();
        let resumed = partial.clone();
        assert_eq!(partial.collect::<Vec<_>>(), resumed.collect::<Vec<_>>());
        assert_eq!(slots.collect::<Vec<_>>(), first);
    }

    #[test]
    fn slots_malformed_input_is_empty() {
        assert_eq!(slots_for_range("bogus", "22:00", 30).count(), 0);
        assert_eq!(slots_for_range("22:00", "12:00", 30).count(), 0);
        assert_eq!(slots_for_range("12:00", "22:00", 0).count(), 0);
    }

    #[test]
    fn lunch_booking_fits_service() {
        let policy = VenuePolicy::default();
        let check = validate_booking_window(date(2025, 5, 10), "12:30", 2, &policy);
        assert!(check.ok);
        assert!(check.reasons.is_empty());

        let window = check.window.unwrap();
        assert_eq!(window.service, ServiceKey::Lunch);
        assert_eq!(window.duration_minutes, 60);
        let close = local_to_ms(policy.timezone, date(2025, 5, 10), t(15, 0)).unwrap();
        assert!(window.dining.end <= close);
        // 12:30 BST is 11:30 UTC
        assert_eq!(window.dining.start, 1_746_876_600_000);
    }

    #[test]
    fn late_booking_is_outside_service() {
        let policy = VenuePolicy::default();
        let check = validate_booking_window(date(2025, 5, 10), "23:30", 2, &policy);
        assert!(!check.ok);
        assert!(check.reasons.contains(&WindowIssue::OutsideServiceHours));
        assert!(check.window.is_none());
    }

    #[test]
    fn malformed_time_reports_invalid_time() {
        let policy = VenuePolicy::default();
        let check = validate_booking_window(date(2025, 5, 10), "lunchtime", 2, &policy);
        assert_eq!(check.reasons, vec![WindowIssue::InvalidTime]);
    }

    #[test]
    fn block_includes_buffers() {
        let policy = VenuePolicy::default();
        let w = compute_booking_window(date(2025, 5, 10), t(18, 0), 4, &policy, None).unwrap();
        assert_eq!(w.service, ServiceKey::Dinner);
        assert_eq!(w.dining.duration_ms(), 75 * MINUTE_MS);
        assert_eq!(w.block.start, w.dining.start);
        assert_eq!(w.block.end, w.dining.end + 5 * MINUTE_MS);
        assert!(!w.clamped_to_service_end);
    }

    #[test]
    fn late_start_is_clamped_to_close() {
        let policy = VenuePolicy::default();
        let w = compute_booking_window(date(2025, 5, 10), t(14, 30), 2, &policy, None).unwrap();
        assert!(w.clamped_to_service_end);
        let close = local_to_ms(policy.timezone, date(2025, 5, 10), t(15, 0)).unwrap();
        assert_eq!(w.block.end, close);
        assert_eq!(w.dining.end, close - 5 * MINUTE_MS);
        assert_eq!(w.duration_minutes, 25);
    }

    #[test]
    fn start_inside_post_buffer_overruns() {
        let policy = VenuePolicy::default();
        let err = compute_booking_window(date(2025, 5, 10), t(14, 56), 2, &policy, None).unwrap_err();
        assert_eq!(err, WindowError::ServiceOverrun(ServiceKey::Lunch));
        assert_eq!(err.code(), "SERVICE_OVERRUN");
    }

    #[test]
    fn overrun_allowed_keeps_full_turn() {
        let mut policy = VenuePolicy::default();
        policy.services.get_mut(&ServiceKey::Lunch).unwrap().allow_overrun = true;
        let w = compute_booking_window(date(2025, 5, 10), t(14, 30), 2, &policy, None).unwrap();
        assert!(!w.clamped_to_service_end);
        assert_eq!(w.duration_minutes, 60);
    }

    #[test]
    fn service_hint_must_cover_start() {
        let policy = VenuePolicy::default();
        let err = compute_booking_window(date(2025, 5, 10), t(12, 30), 2, &policy, Some(ServiceKey::Dinner))
            .unwrap_err();
        assert!(matches!(err, WindowError::InvalidWindow { .. }));
        let err = compute_booking_window(date(2025, 5, 10), t(12, 30), 2, &policy, Some(ServiceKey::Drinks))
            .unwrap_err();
        assert_eq!(err, WindowError::UnknownService(ServiceKey::Drinks));
    }

    #[test]
    fn overnight_service_closes_next_day() {
        let mut policy = VenuePolicy::default();
        policy.services.insert(
            ServiceKey::Drinks,
            ServicePeriod {
                start: t(22, 0),
                end: t(1, 0),
                buffer: Buffer { pre: 0, post: 0 },
                turn_bands: vec![TurnBand { max_party_size: 10, duration_minutes: 90 }],
                allow_overrun: false,
            },
        );
        policy.service_order.push(ServiceKey::Drinks);

        // 00:15 on the 11th belongs to the service opened on the 10th
        let w = compute_booking_window(date(2025, 5, 11), t(0, 15), 2, &policy, None).unwrap();
        assert_eq!(w.service, ServiceKey::Drinks);
        assert!(w.clamped_to_service_end);
        assert_eq!(w.duration_minutes, 45);

        let w = compute_booking_window(date(2025, 5, 10), t(23, 0), 2, &policy, None).unwrap();
        assert!(!w.clamped_to_service_end);
        assert_eq!(w.duration_minutes, 90);
    }

    #[test]
    fn nonexistent_local_time_is_rejected() {
        let mut policy = VenuePolicy::default();
        policy.services.get_mut(&ServiceKey::Lunch).unwrap().start = t(0, 0);
        // Clocks jump from 01:00 to 02:00 on 2025-03-30 in London
        let err = compute_booking_window(date(2025, 3, 30), t(1, 30), 2, &policy, None).unwrap_err();
        assert!(matches!(err, WindowError::NonexistentLocalTime { .. }));
    }

    #[test]
    fn invalid_party_size() {
        let policy = VenuePolicy::default();
        let err = compute_booking_window(date(2025, 5, 10), t(12, 30), 0, &policy, None).unwrap_err();
        assert_eq!(err, WindowError::InvalidPartySize(0));
    }

    #[test]
    fn short_service_has_no_turns() {
        assert_eq!(achievable_turns(45, 60, 5), 0);
        assert_eq!(achievable_turns(180, 60, 5), 2);
        assert_eq!(achievable_turns(120, 0, 0), 0);
    }

    #[test]
    fn past_starts_respect_grace() {
        let now = 1_000 * MINUTE_MS;
        assert!(assert_not_in_past(now - 4 * MINUTE_MS, now, 5).is_ok());
        assert!(assert_not_in_past(now + MINUTE_MS, now, 0).is_ok());
        assert_eq!(
            assert_not_in_past(now - 30 * MINUTE_MS, now, 5),
            Err(WindowError::BookingInPast { minutes_ago: 30 })
        );
    }

    const ZONES: [Tz; 5] = [
        chrono_tz::Europe::London,
        chrono_tz::Europe::Paris,
        chrono_tz::America::New_York,
        chrono_tz::Asia::Kolkata,
        chrono_tz::Australia::Sydney,
    ];

    #[test]
    fn overlap_compares_instants_not_wall_clocks() {
        let day = date(2025, 7, 4);
        let london = |tm| local_to_ms(chrono_tz::Europe::London, day, tm).unwrap();
        let paris = |tm| local_to_ms(chrono_tz::Europe::Paris, day, tm).unwrap();
        // 19:00-20:00 London is 20:00-21:00 Paris.
        let dinner = Span::new(london(t(19, 0)), london(t(20, 0)));
        assert!(windows_overlap(&dinner, &Span::new(paris(t(20, 30)), paris(t(21, 30)))));
        assert!(!windows_overlap(&dinner, &Span::new(paris(t(21, 0)), paris(t(22, 0)))));
    }

    #[test]
    fn huge_interval_stops_at_the_first_slot() {
        let slots: Vec<String> = slots_for_range("00:01", "23:59", u32::MAX).collect();
        assert_eq!(slots, vec!["00:01"]);
        let mut slots = slots_for_range("00:01", "23:59", u32::MAX - 1);
        assert_eq!(slots.next().as_deref(), Some("00:01"));
        assert_eq!(slots.next(), None);
    }

    #[test]
    fn touching_windows_do_not_overlap() {
        let a = Span::new(0, 100);
        let b = Span::new(100, 200);
        assert!(!windows_overlap(&a, &b));
        assert!(!windows_overlap(&b, &a));
    }

    proptest! {
        #[test]
        fn overlap_follows_instants_across_zones(
            a_zone in prop::sample::select(ZONES.to_vec()),
            b_zone in prop::sample::select(ZONES.to_vec()),
            a_day in 0i64..365,
            b_day in 0i64..365,
            a_minute in 0u32..1440,
            b_minute in 0u32..1440,
            a_len in 1i64..600,
            b_len in 1i64..600,
        ) {
            let local = |day: i64, minute: u32| {
                (date(2025, 1, 1) + Duration::days(day), t(minute / 60, minute % 60))
            };
            let (a_date, a_time) = local(a_day, a_minute);
            let (b_date, b_time) = local(b_day, b_minute);
            let a_at = local_to_ms(a_zone, a_date, a_time);
            let b_at = local_to_ms(b_zone, b_date, b_time);
            prop_assume!(a_at.is_ok() && b_at.is_ok());
            let (a_at, b_at) = (a_at.unwrap(), b_at.unwrap());

            let a = Span::new(a_at, a_at + a_len * 60_000);
            let b = Span::new(b_at, b_at + b_len * 60_000);

            // Same comparison on UTC wall clocks, resolved independently.
            let utc = |tz: Tz, d: NaiveDate, tm: NaiveTime| {
                tz.from_local_datetime(&d.and_time(tm)).earliest().unwrap().naive_utc()
            };
            let a_utc = utc(a_zone, a_date, a_time);
            let b_utc = utc(b_zone, b_date, b_time);
            let expected = a_utc < b_utc + Duration::minutes(b_len) && b_utc < a_utc + Duration::minutes(a_len);

            prop_assert_eq!(windows_overlap(&a, &b), windows_overlap(&b, &a));
            prop_assert_eq!(windows_overlap(&a, &b), expected);
        }

        #[test]
        fn minutes_roundtrip(m in 0u32..1440) {
            let s = from_minutes(m).unwrap();
            prop_assert_eq!(to_minutes(&s), Some(m));
        }
    }
}
