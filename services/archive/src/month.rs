use crate::error::{ArchiveError, Result};
use crate::locator::RecordingLocator;
use crate::store::ObjectStore;
use crate::timeline::QueryWarning;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Upper bound on concurrent day probes.
pub const MAX_PROBE_CONCURRENCY: usize = 31;

/// One flag per day of the month, first day first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthBitmap {
    pub days: Vec<bool>,
    pub warnings: Vec<QueryWarning>,
}

impl MonthBitmap {
    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Whether 1-based `day` has recordings.
    pub fn has_recordings(&self, day: u32) -> bool {
        day >= 1 && self.days.get(day as usize - 1).copied().unwrap_or(false)
    }
}

impl fmt::Display for MonthBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for present in &self.days {
            f.write_str(if *present { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Parse `yyyyMM` into year and month.
pub fn parse_month(month: &str) -> Result<(i32, u32)> {
    if month.len() != 6 || !month.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ArchiveError::InvalidMonth(month.to_string()));
    }
    let year: i32 = month[..4]
        .parse()
        .map_err(|_| ArchiveError::InvalidMonth(month.to_string()))?;
    let number: u32 = month[4..]
        .parse()
        .map_err(|_| ArchiveError::InvalidMonth(month.to_string()))?;
    if !(1..=12).contains(&number) {
        return Err(ArchiveError::InvalidMonth(month.to_string()));
    }
    Ok((year, number))
}

/// Number of days in a month, leap years included.
pub fn days_in_month(year: i32, month: u32) -> Result<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| ArchiveError::InvalidMonth(format!("{year:04}{month:02}")))?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| ArchiveError::InvalidMonth(format!("{year:04}{month:02}")))?;
    Ok((next - first).num_days() as u32)
}

/// Builds month bitmaps by probing each day partition.
pub struct MonthReporter {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl MonthReporter {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.clamp(1, MAX_PROBE_CONCURRENCY),
        }
    }

    /// Presence bitmap for `month` (`yyyyMM`).
    ///
    /// A failed probe marks its day absent and adds a warning; it never
    /// fails the report.
    #[instrument(skip(self), fields(locator = %locator))]
    pub async fn month_bitmap(&self, locator: &RecordingLocator, month: &str) -> Result<MonthBitmap> {
        let (year, number) = parse_month(month)?;
        let day_count = days_in_month(year, number)?;
        let month_prefix = locator.month_prefix(year, number);

        let probes: Vec<(usize, std::result::Result<bool, ArchiveError>)> =
            stream::iter(1..=day_count)
                .map(|day| {
                    let store = self.store.clone();
                    let prefix = format!("{month_prefix}{day:02}/");
                    async move {
                        let probe = store
                            .list_page(&prefix, None, Some(1))
                            .await
                            .map(|page| !page.keys.is_empty());
                        (day as usize - 1, probe)
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut days = vec![false; day_count as usize];
        let mut warnings = Vec::new();
        for (index, probe) in probes {
            match probe {
                Ok(present) => days[index] = present,
                Err(err) => {
                    let prefix = format!("{month_prefix}{:02}/", index + 1);
                    warn!(prefix = %prefix, error = %err, "Day probe failed, reporting absent");
                    metrics::counter!("archive.month.probe_failed").increment(1);
                    warnings.push(QueryWarning::new(prefix, err.to_string()));
                }
            }
        }
        warnings.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(MonthBitmap { days, warnings })
    }
}
