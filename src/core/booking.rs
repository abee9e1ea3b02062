//! Booking windows
//!
//! A booking is a recording window `[date start_time, date end_time]` in the
//! device's local time. Windows are inclusive on both ends, and an end time
//! earlier than the start time means the booking runs past midnight.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize};

/// A scheduled recording window produced by the booking source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Opaque identifier (UUID or integer key in the source table)
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    /// Calendar day the window starts on
    pub date: NaiveDate,
    /// Window start (`HH:MM` or `HH:MM:SS`)
    #[serde(with = "clock_time")]
    pub start_time: NaiveTime,
    /// Window end (`HH:MM` or `HH:MM:SS`)
    #[serde(with = "clock_time")]
    pub end_time: NaiveTime,
}

impl Booking {
    pub fn new(id: impl Into<String>, date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> Self {
        Self {
            id: id.into(),
            date,
            start_time,
            end_time,
        }
    }

    /// When the window opens
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }

    /// When the window closes
    pub fn ends_at(&self) -> NaiveDateTime {
        let end = self.date.and_time(self.end_time);
        if self.end_time < self.start_time {
            end + Duration::days(1)
        } else {
            end
        }
    }

    /// Whether `now` falls inside the window
    pub fn is_active_at(&self, now: NaiveDateTime) -> bool {
        self.starts_at() <= now && now <= self.ends_at()
    }

    /// Whether the window closed strictly before `cutoff`
    pub fn ended_before(&self, cutoff: NaiveDateTime) -> bool {
        self.ends_at() < cutoff
    }
}

/// Pick the booking that should be recording at `now`.
///
/// Sources are trusted not to overlap, but if several windows are active the
/// earliest start wins (ties broken by id) so the choice is deterministic.
pub fn select_active(bookings: &[Booking], now: NaiveDateTime) -> Option<&Booking> {
    bookings
        .iter()
        .filter(|b| b.is_active_at(now))
        .min_by(|a, b| a.starts_at().cmp(&b.starts_at()).then_with(|| a.id.cmp(&b.id)))
}

/// Accept both string and numeric ids
fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

mod clock_time {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M:%S").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_clock_time(&raw).ok_or_else(|| de::Error::custom(format!("invalid time: {raw}")))
    }
}

/// Parse `HH:MM`, `HH:MM:SS` or `HH:MM:SS.ffffff`
pub fn parse_clock_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}
