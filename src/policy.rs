//! Venue operating policy: service periods, turn lengths, buffers, timezone.
//!
//! A policy is read-only once a venue is loaded. Operators change it by
//! publishing a new policy with a higher `version`; holds quoted under an
//! older version are refused at confirm time.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveTime, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKey {
    Lunch,
    Dinner,
    Drinks,
}

impl ServiceKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKey::Lunch => "lunch",
            ServiceKey::Dinner => "dinner",
            ServiceKey::Drinks => "drinks",
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minutes reserved around the dining time for setup and turnover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Buffer {
    pub pre: u32,
    pub post: u32,
}

impl Buffer {
    pub fn total(&self) -> u32 {
        self.pre + self.post
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnBand {
    pub max_party_size: u32,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePeriod {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    /// At or before `start` means the period runs past midnight.
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    #[serde(default)]
    pub buffer: Buffer,
    /// Ascending by `max_party_size`.
    pub turn_bands: Vec<TurnBand>,
    #[serde(default)]
    pub allow_overrun: bool,
}

impl ServicePeriod {
    pub fn crosses_midnight(&self) -> bool {
        self.end <= self.start
    }

    /// `start <= t < end`, wrapping past midnight when needed.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.crosses_midnight() {
            t >= self.start || t < self.end
        } else {
            self.start <= t && t < self.end
        }
    }

    pub fn duration_minutes(&self) -> u32 {
        let start = minute_of_day(self.start);
        let end = minute_of_day(self.end);
        if self.crosses_midnight() {
            end + 1440 - start
        } else {
            end - start
        }
    }

    /// First band whose limit covers the party; parties above every band use
    /// the last one, and an empty party uses the first.
    pub fn turn_band(&self, party_size: u32) -> Option<&TurnBand> {
        if party_size == 0 {
            return self.turn_bands.first();
        }
        self.turn_bands
            .iter()
            .find(|band| party_size <= band.max_party_size)
            .or_else(|| self.turn_bands.last())
    }

    /// How many full turns (dining plus buffers) a table gets in this period.
    pub fn rotations(&self, party_size: u32) -> u32 {
        self.turn_band(party_size).map_or(0, |band| {
            crate::window::achievable_turns(
                self.duration_minutes(),
                band.duration_minutes,
                self.buffer.total(),
            )
        })
    }
}

fn minute_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("service order names {0}, which has no definition")]
    UndefinedService(ServiceKey),
    #[error("service {0} has no turn bands")]
    NoTurnBands(ServiceKey),
    #[error("service {0} turn bands must be strictly ascending by party size")]
    UnorderedTurnBands(ServiceKey),
    #[error("service {0} has a zero-length turn band")]
    ZeroTurn(ServiceKey),
    #[error("service {0} starts and ends at the same time")]
    EmptyService(ServiceKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VenuePolicy {
    pub timezone: Tz,
    pub services: BTreeMap<ServiceKey, ServicePeriod>,
    /// Lookup order for `which_service`; earlier entries win overlaps.
    pub service_order: Vec<ServiceKey>,
    pub version: u32,
}

impl Default for VenuePolicy {
    fn default() -> Self {
        let at = |h: u32| NaiveTime::from_hms_opt(h, 0, 0).unwrap_or(NaiveTime::MIN);
        let bands = |largest: u32| {
            vec![
                TurnBand { max_party_size: 2, duration_minutes: 60 },
                TurnBand { max_party_size: 4, duration_minutes: 75 },
                TurnBand { max_party_size: 6, duration_minutes: 85 },
                TurnBand { max_party_size: 8, duration_minutes: largest },
            ]
        };
        let buffer = Buffer { pre: 0, post: 5 };

        let mut services = BTreeMap::new();
        services.insert(
            ServiceKey::Lunch,
            ServicePeriod {
                start: at(12),
                end: at(15),
                buffer,
                turn_bands: bands(85),
                allow_overrun: false,
            },
        );
        services.insert(
            ServiceKey::Dinner,
            ServicePeriod {
                start: at(17),
                end: at(22),
                buffer,
                turn_bands: bands(90),
                allow_overrun: false,
            },
        );

        Self {
            timezone: chrono_tz::Europe::London,
            services,
            service_order: vec![ServiceKey::Lunch, ServiceKey::Dinner],
            version: 1,
        }
    }
}

impl VenuePolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        for key in &self.service_order {
            if !self.services.contains_key(key) {
                return Err(PolicyError::UndefinedService(*key));
            }
        }
        for (key, period) in &self.services {
            if period.start == period.end {
                return Err(PolicyError::EmptyService(*key));
            }
            if period.turn_bands.is_empty() {
                return Err(PolicyError::NoTurnBands(*key));
            }
            if period.turn_bands.iter().any(|b| b.duration_minutes == 0) {
                return Err(PolicyError::ZeroTurn(*key));
            }
            if period
                .turn_bands
                .windows(2)
                .any(|w| w[0].max_party_size >= w[1].max_party_size)
            {
                return Err(PolicyError::UnorderedTurnBands(*key));
            }
        }
        Ok(())
    }

    pub fn service(&self, key: ServiceKey) -> Option<&ServicePeriod> {
        self.services.get(&key)
    }

    /// The first service in `service_order` open at local time `t`.
    pub fn which_service(&self, t: NaiveTime) -> Option<ServiceKey> {
        self.service_order
            .iter()
            .copied()
            .find(|key| self.services.get(key).is_some_and(|p| p.contains(t)))
    }

    /// Services in lookup order, skipping undefined keys.
    pub fn ordered_services(&self) -> impl Iterator<Item = (ServiceKey, &ServicePeriod)> {
        self.service_order
            .iter()
            .filter_map(|key| self.services.get(key).map(|p| (*key, p)))
    }
}

/// `HH:MM` (de)serialization for times of day.
mod hhmm {
    use chrono::NaiveTime;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        crate::window::parse_time(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid time of day: {raw}")))
    }
}
