use chrono::{Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;

/// Zone that day partitions and 14-digit segment names are written in.
///
/// Named and host-local zones resolve the offset per instant, so segments
/// recorded on either side of a DST change land on the right wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveZone {
    Fixed(FixedOffset),
    Named(Tz),
    Local,
}

impl ArchiveZone {
    pub fn utc() -> Self {
        Self::Fixed(Utc.fix())
    }

    /// IANA zone by name, e.g. `Europe/Berlin`.
    pub fn named(name: &str) -> Option<Self> {
        name.parse::<Tz>().ok().map(Self::Named)
    }

    /// Epoch-ms of a wall-clock time.
    ///
    /// A time repeated by a fall-back change resolves to its earlier
    /// instant; a time skipped by a spring-forward change is `None`.
    pub fn to_epoch_ms(&self, local: &NaiveDateTime) -> Option<i64> {
        match self {
            Self::Fixed(zone) => earliest_ms(zone, local),
            Self::Named(zone) => earliest_ms(zone, local),
            Self::Local => earliest_ms(&Local, local),
        }
    }

    /// Wall-clock time of an instant.
    pub fn wall_clock(&self, epoch_ms: i64) -> Option<NaiveDateTime> {
        match self {
            Self::Fixed(zone) => naive_local(zone, epoch_ms),
            Self::Named(zone) => naive_local(zone, epoch_ms),
            Self::Local => naive_local(&Local, epoch_ms),
        }
    }

    /// Epoch-ms at which `day` starts. Where midnight is skipped by a DST
    /// change, the first existing hour is used.
    pub fn start_of_day(&self, day: NaiveDate) -> Option<i64> {
        let midnight = day.and_hms_opt(0, 0, 0)?;
        (0..=2).find_map(|hours| self.to_epoch_ms(&(midnight + Duration::hours(hours))))
    }
}

impl From<FixedOffset> for ArchiveZone {
    fn from(offset: FixedOffset) -> Self {
        Self::Fixed(offset)
    }
}

impl fmt::Display for ArchiveZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(offset) => write!(f, "{offset}"),
            Self::Named(zone) => f.write_str(zone.name()),
            Self::Local => f.write_str("local"),
        }
    }
}

fn earliest_ms<Z: TimeZone>(zone: &Z, local: &NaiveDateTime) -> Option<i64> {
    zone.from_local_datetime(local)
        .earliest()
        .map(|at| at.timestamp_millis())
}

fn naive_local<Z: TimeZone>(zone: &Z, epoch_ms: i64) -> Option<NaiveDateTime> {
    zone.timestamp_millis_opt(epoch_ms)
        .single()
        .map(|at| at.naive_local())
}
