//! Filename-encoded segment index.
//!
//! A segment filename is `<start>-<durationMs>.<ext>`. The start token comes in
//! three legacy encodings that all live side by side in existing archives:
//!
//! | digits | meaning                    | example          |
//! |--------|----------------------------|------------------|
//! | 10     | epoch seconds              | `1717808359`     |
//! | 13     | epoch milliseconds         | `1717808359000`  |
//! | 14     | `yyyyMMddHHmmss`, archive zone | `20240608085919` |
//!
//! All of them normalize to epoch milliseconds.

use crate::error::{ArchiveError, Result};
use crate::locator::RecordingLocator;
use crate::zone::ArchiveZone;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

const COMPACT_FORMAT: &str = "%Y%m%d%H%M%S";

/// Container type of a segment, from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaExt {
    Ts,
    Mp4,
    M4s,
}

impl MediaExt {
    /// Parse an extension without the dot, case-insensitively.
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "ts" => Some(Self::Ts),
            "mp4" => Some(Self::Mp4),
            "m4s" => Some(Self::M4s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ts => "ts",
            Self::Mp4 => "mp4",
            Self::M4s => "m4s",
        }
    }

    /// Fragmented MP4 family (mp4 and m4s remux together).
    pub fn is_fragmented(&self) -> bool {
        matches!(self, Self::Mp4 | Self::M4s)
    }
}

impl fmt::Display for MediaExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the legacy encodings a start token uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartEncoding {
    EpochSeconds,
    EpochMillis,
    Compact,
}

/// Parsed `<start>-<durationMs>.<ext>` filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentName {
    start_ms: i64,
    duration_ms: i64,
    ext: MediaExt,
    encoding: StartEncoding,
    #[serde(skip)]
    start_token: String,
}

impl SegmentName {
    /// Build a name from its parts, rendering the start token in `encoding`.
    pub fn new(
        start_ms: i64,
        duration_ms: i64,
        ext: MediaExt,
        encoding: StartEncoding,
        zone: ArchiveZone,
    ) -> Result<Self> {
        let start_token = match encoding {
            StartEncoding::EpochSeconds => {
                if start_ms % 1000 != 0 {
                    return Err(ArchiveError::malformed(
                        start_ms.to_string(),
                        "epoch-seconds encoding cannot carry milliseconds",
                    ));
                }
                format!("{}", start_ms / 1000)
            }
            StartEncoding::EpochMillis => format!("{start_ms}"),
            StartEncoding::Compact => {
                if start_ms % 1000 != 0 {
                    return Err(ArchiveError::malformed(
                        start_ms.to_string(),
                        "compact encoding cannot carry milliseconds",
                    ));
                }
                let at = zone
                    .wall_clock(start_ms)
                    .ok_or_else(|| ArchiveError::malformed(start_ms.to_string(), "out of range"))?;
                at.format(COMPACT_FORMAT).to_string()
            }
        };

        if duration_ms < 0 {
            return Err(ArchiveError::malformed(
                duration_ms.to_string(),
                "negative duration",
            ));
        }

        // Re-parse so the token width is checked by the same rules as listing.
        let parsed = parse_start(&start_token, zone)?;
        Ok(Self {
            start_ms: parsed.0,
            duration_ms,
            ext,
            encoding,
            start_token,
        })
    }

    /// Parse a bare filename such as `20240608085919-30000.ts`.
    pub fn parse(file_name: &str, zone: ArchiveZone) -> Result<Self> {
        let (stem, ext) = file_name
            .rsplit_once('.')
            .ok_or_else(|| ArchiveError::malformed(file_name, "missing extension"))?;
        let ext = MediaExt::from_ext(ext)
            .ok_or_else(|| ArchiveError::malformed(file_name, format!("unknown extension '{ext}'")))?;

        let mut parts = stem.split('-');
        let (start_token, duration) = match (parts.next(), parts.next(), parts.next()) {
            (Some(start), Some(duration), None) => (start, duration),
            _ => {
                return Err(ArchiveError::malformed(
                    file_name,
                    "expected <start>-<durationMs>",
                ))
            }
        };

        let (start_ms, encoding) =
            parse_start(start_token, zone).map_err(|e| rename_malformed(e, file_name))?;
        let duration_ms = parse_digits(duration)
            .ok_or_else(|| ArchiveError::malformed(file_name, "duration is not a number"))?;

        Ok(Self {
            start_ms,
            duration_ms,
            ext,
            encoding,
            start_token: start_token.to_string(),
        })
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.start_ms.saturating_add(self.duration_ms)
    }

    pub fn ext(&self) -> MediaExt {
        self.ext
    }

    pub fn encoding(&self) -> StartEncoding {
        self.encoding
    }

    /// Canonical filename; round-trips the token exactly as parsed.
    pub fn file_name(&self) -> String {
        format!("{}-{}.{}", self.start_token, self.duration_ms, self.ext)
    }

    /// Calendar day (archive zone) the segment starts on.
    pub fn day(&self, zone: ArchiveZone) -> NaiveDate {
        day_of(self.start_ms, zone)
    }

    /// Whether `[start, end]` overlaps the inclusive window.
    pub fn overlaps(&self, start_ms: i64, end_ms: i64) -> bool {
        self.start_ms <= end_ms && self.end_ms() > start_ms
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// A full object key together with its parsed filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentKey {
    key: String,
    #[serde(flatten)]
    name: SegmentName,
}

impl SegmentKey {
    /// Parse the filename component of an object key.
    pub fn parse(key: &str, zone: ArchiveZone) -> Result<Self> {
        let file_name = key.rsplit('/').next().unwrap_or(key);
        let name = SegmentName::parse(file_name, zone).map_err(|e| rename_malformed(e, key))?;
        Ok(Self {
            key: key.to_string(),
            name,
        })
    }

    /// Parse the filename of a URI, ignoring query and fragment.
    ///
    /// The URI itself is kept as the key so presigned links survive.
    pub fn from_uri(uri: &str, zone: ArchiveZone) -> Result<Self> {
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let name = SegmentName::parse(file_name, zone).map_err(|e| rename_malformed(e, uri))?;
        Ok(Self {
            key: uri.to_string(),
            name,
        })
    }

    /// Key of `name` inside its day partition.
    pub fn for_locator(locator: &RecordingLocator, name: SegmentName, zone: ArchiveZone) -> Self {
        let key = format!("{}{}", locator.day_prefix(name.day(zone)), name.file_name());
        Self { key, name }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    pub fn start_ms(&self) -> i64 {
        self.name.start_ms
    }

    pub fn duration_ms(&self) -> i64 {
        self.name.duration_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.name.end_ms()
    }

    pub fn ext(&self) -> MediaExt {
        self.name.ext
    }

    pub fn into_key(self) -> String {
        self.key
    }
}

impl PartialOrd for SegmentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentKey {
    /// Chronological, then by key; lexicographic key order alone breaks
    /// when start tokens of different widths share a partition.
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_ms()
            .cmp(&other.start_ms())
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Calendar day of an epoch-ms instant in `zone`.
pub fn day_of(epoch_ms: i64, zone: ArchiveZone) -> NaiveDate {
    match zone.wall_clock(epoch_ms) {
        Some(at) => at.date(),
        None => NaiveDate::MIN,
    }
}

/// Epoch-ms at which `day` starts in `zone`.
pub fn midnight_ms(day: NaiveDate, zone: ArchiveZone) -> i64 {
    zone.start_of_day(day).unwrap_or_default()
}

/// Parse a start token in any of the three legacy encodings.
pub fn parse_start(token: &str, zone: ArchiveZone) -> Result<(i64, StartEncoding)> {
    let value =
        parse_digits(token).ok_or_else(|| ArchiveError::malformed(token, "start is not a number"))?;

    match token.len() {
        10 => Ok((value.saturating_mul(1000), StartEncoding::EpochSeconds)),
        13 => Ok((value, StartEncoding::EpochMillis)),
        14 => {
            let naive = NaiveDateTime::parse_from_str(token, COMPACT_FORMAT)
                .map_err(|e| ArchiveError::malformed(token, format!("bad yyyyMMddHHmmss: {e}")))?;
            // Repeated wall-clock times (DST fall-back) take the first instant.
            let at = zone
                .to_epoch_ms(&naive)
                .ok_or_else(|| ArchiveError::malformed(token, "local time skipped by DST"))?;
            Ok((at, StartEncoding::Compact))
        }
        n => Err(ArchiveError::malformed(
            token,
            format!("start has {n} digits, expected 10, 13 or 14"),
        )),
    }
}

fn parse_digits(s: &str) -> Option<i64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn rename_malformed(err: ArchiveError, name: &str) -> ArchiveError {
    match err {
        ArchiveError::MalformedSegmentName { reason, .. } => ArchiveError::malformed(name, reason),
        other => other,
    }
}
