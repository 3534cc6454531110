use crate::error::{ArchiveError, Result};
use crate::locator::RecordingLocator;
use crate::segment::{day_of, midnight_ms, SegmentKey};
use crate::store::{list_all_paged, ObjectStore};
use crate::zone::ArchiveZone;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Default cross-midnight lookback.
pub const DEFAULT_LOOKBACK_MS: i64 = 30_000;

/// Width of one lookback bucket in seconds.
const LOOKBACK_BUCKET_SECS: i64 = 10;

/// Number of buckets probed before midnight.
const LOOKBACK_BUCKETS: i64 = 3;

/// Inclusive `[start_ms, end_ms]` query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    start_ms: i64,
    end_ms: i64,
}

impl TimeWindow {
    /// Build a window, swapping the bounds if they are reversed.
    pub fn new(a_ms: i64, b_ms: i64) -> Self {
        Self {
            start_ms: a_ms.min(b_ms),
            end_ms: a_ms.max(b_ms),
        }
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.end_ms
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    /// Every calendar day in `zone` the window touches, in order.
    pub fn days(&self, zone: ArchiveZone) -> Vec<NaiveDate> {
        let last = day_of(self.end_ms, zone);
        let mut day = day_of(self.start_ms, zone);
        let mut days = vec![day];
        while day < last {
            match day.succ_opt() {
                Some(next) => {
                    day = next;
                    days.push(day);
                }
                None => break,
            }
        }
        days
    }
}

/// A listed key that could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryWarning {
    pub key: String,
    pub reason: String,
}

impl QueryWarning {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Ordered covering set for a window, plus the keys skipped along the way.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentSet {
    pub segments: Vec<SegmentKey>,
    pub warnings: Vec<QueryWarning>,
}

impl SegmentSet {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.segments.iter().map(SegmentKey::key).collect()
    }
}

/// One bar on a recording time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimelineSpan {
    pub start_ms: i64,
    pub duration_ms: i64,
}

/// Query engine over one object store.
#[derive(Clone)]
pub struct TimelineQuery {
    store: Arc<dyn ObjectStore>,
    zone: ArchiveZone,
    lookback_ms: i64,
    page_size: Option<i32>,
}

impl TimelineQuery {
    pub fn new(store: Arc<dyn ObjectStore>, zone: ArchiveZone) -> Self {
        Self {
            store,
            zone,
            lookback_ms: DEFAULT_LOOKBACK_MS,
            page_size: None,
        }
    }

    pub fn with_lookback_ms(mut self, lookback_ms: i64) -> Self {
        self.lookback_ms = lookback_ms.max(0);
        self
    }

    /// Override the store's listing page size.
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn zone(&self) -> ArchiveZone {
        self.zone
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Ordered segments covering `window`.
    pub async fn segments(&self, locator: &RecordingLocator, window: TimeWindow) -> Result<SegmentSet> {
        self.segments_cancellable(locator, window, &CancellationToken::new())
            .await
    }

    /// Like [`segments`](Self::segments), checking `cancel` between day partitions.
    #[instrument(skip(self, cancel), fields(locator = %locator, start_ms = window.start_ms, end_ms = window.end_ms))]
    pub async fn segments_cancellable(
        &self,
        locator: &RecordingLocator,
        window: TimeWindow,
        cancel: &CancellationToken,
    ) -> Result<SegmentSet> {
        let mut collector = Collector::new(window);
        let days = window.days(self.zone);

        for (index, day) in days.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            let prefix = locator.day_prefix(*day);
            let keys = list_all_paged(self.store.as_ref(), &prefix, self.page_size).await?;
            metrics::counter!("archive.segments.listed").increment(keys.len() as u64);
            debug!(prefix = %prefix, count = keys.len(), "Listed day partition");

            let covered_before = collector.covers_start;
            for key in keys {
                if let Some(segment) = self.parse_or_warn(key, &mut collector.warnings) {
                    collector.offer(segment);
                }
            }

            if index == 0 && !covered_before && !collector.covers_start {
                if cancel.is_cancelled() {
                    return Err(ArchiveError::Cancelled);
                }
                if let Some(segment) = self.lookback(locator, *day, window, &mut collector.warnings).await? {
                    collector.offer(segment);
                }
            }
        }

        Ok(collector.finish())
    }

    /// Start and duration of each covering segment.
    pub async fn timeline(
        &self,
        locator: &RecordingLocator,
        window: TimeWindow,
    ) -> Result<Vec<TimelineSpan>> {
        let set = self.segments(locator, window).await?;
        Ok(set
            .segments
            .iter()
            .map(|s| TimelineSpan {
                start_ms: s.start_ms(),
                duration_ms: s.duration_ms(),
            })
            .collect())
    }

    /// Probe the last buckets before `first_day`'s midnight for a segment
    /// that runs past midnight into the window.
    async fn lookback(
        &self,
        locator: &RecordingLocator,
        first_day: NaiveDate,
        window: TimeWindow,
        warnings: &mut Vec<QueryWarning>,
    ) -> Result<Option<SegmentKey>> {
        let midnight = midnight_ms(first_day, self.zone);
        if window.start_ms - self.lookback_ms >= midnight {
            return Ok(None);
        }
        let Some(previous_day) = first_day.pred_opt() else {
            return Ok(None);
        };

        let day_prefix = locator.day_prefix(previous_day);
        let midnight_secs = midnight.div_euclid(1000);
        let aligned = midnight_secs - midnight_secs.rem_euclid(LOOKBACK_BUCKET_SECS);

        for step in 1..=LOOKBACK_BUCKETS {
            let bucket_secs = aligned - step * LOOKBACK_BUCKET_SECS;
            let mut keys = Vec::new();
            for prefix in self.bucket_prefixes(&day_prefix, bucket_secs) {
                keys.extend(list_all_paged(self.store.as_ref(), &prefix, self.page_size).await?);
            }
            keys.sort();
            keys.dedup();

            let last = keys
                .into_iter()
                .filter_map(|key| self.parse_or_warn(key, warnings))
                .max();

            if let Some(segment) = last {
                debug!(key = segment.key(), bucket_secs, "Lookback found segment");
                let near_midnight = segment.end_ms() >= midnight - self.lookback_ms;
                let overlaps = segment.name().overlaps(window.start_ms, window.end_ms);
                return Ok((near_midnight && overlaps).then_some(segment));
            }
        }

        Ok(None)
    }

    /// Listing prefixes for one 10-second bucket: the 9-digit epoch-seconds
    /// prefix matches 10- and 13-digit names, the 13-character
    /// `yyyyMMddHHmms` prefix matches 14-digit names.
    fn bucket_prefixes(&self, day_prefix: &str, bucket_secs: i64) -> Vec<String> {
        let mut prefixes = Vec::with_capacity(2);
        let epoch = bucket_secs.to_string();
        if epoch.len() == 10 {
            prefixes.push(format!("{day_prefix}{}", &epoch[..9]));
        }
        if let Some(at) = self.zone.wall_clock(bucket_secs.saturating_mul(1000)) {
            let compact = at.format("%Y%m%d%H%M%S").to_string();
            prefixes.push(format!("{day_prefix}{}", &compact[..13]));
        }
        prefixes
    }

    fn parse_or_warn(&self, key: String, warnings: &mut Vec<QueryWarning>) -> Option<SegmentKey> {
        match SegmentKey::parse(&key, self.zone) {
            Ok(segment) => Some(segment),
            Err(ArchiveError::MalformedSegmentName { reason, .. }) => {
                warn!(key = %key, reason = %reason, "Skipping malformed segment name");
                metrics::counter!("archive.segments.malformed").increment(1);
                warnings.push(QueryWarning::new(key, reason));
                None
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Skipping unreadable segment key");
                warnings.push(QueryWarning::new(key, err.to_string()));
                None
            }
        }
    }
}

/// Covering subset of already-parsed segments, ordered by start.
pub(crate) fn cover(window: TimeWindow, segments: impl IntoIterator<Item = SegmentKey>) -> Vec<SegmentKey> {
    let mut collector = Collector::new(window);
    for segment in segments {
        collector.offer(segment);
    }
    collector.finish().segments
}

/// Applies the inclusion rule while listings stream in.
struct Collector {
    window: TimeWindow,
    inside: Vec<SegmentKey>,
    leading: Option<SegmentKey>,
    warnings: Vec<QueryWarning>,
    covers_start: bool,
}

impl Collector {
    fn new(window: TimeWindow) -> Self {
        Self {
            window,
            inside: Vec::new(),
            leading: None,
            warnings: Vec::new(),
            covers_start: false,
        }
    }

    fn offer(&mut self, segment: SegmentKey) {
        let start = segment.start_ms();
        if start <= self.window.start_ms {
            self.covers_start = true;
        }

        if start >= self.window.start_ms && start <= self.window.end_ms {
            self.inside.push(segment);
        } else if start < self.window.start_ms && segment.end_ms() > self.window.start_ms {
            // Only the latest-starting leading segment is kept.
            let replace = self.leading.as_ref().map_or(true, |current| segment > *current);
            if replace {
                self.leading = Some(segment);
            }
        }
    }

    fn finish(self) -> SegmentSet {
        let mut segments: Vec<SegmentKey> = self.leading.into_iter().chain(self.inside).collect();
        segments.sort();
        segments.dedup_by(|a, b| a.key() == b.key());
        SegmentSet {
            segments,
            warnings: self.warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::parse_start;
    use crate::store::memory::InMemoryStore;
    use crate::store::MockObjectStore;

    fn zone() -> ArchiveZone {
        chrono::FixedOffset::east_opt(8 * 3600).unwrap().into()
    }

    fn at(compact: &str) -> i64 {
        parse_start(compact, zone()).unwrap().0
    }

    fn locator() -> RecordingLocator {
        RecordingLocator::new("r", "dev", "0").unwrap()
    }

    fn query(store: Arc<InMemoryStore>) -> TimelineQuery {
        TimelineQuery::new(store, zone())
    }

    #[test]
    fn test_window_normalized_and_days() {
        let window = TimeWindow::new(at("20240610010000"), at("20240608230000"));
        assert_eq!(window.start_ms(), at("20240608230000"));
        let days: Vec<String> = window
            .days(zone())
            .iter()
            .map(|d| d.format("%Y%m%d").to_string())
            .collect();
        assert_eq!(days, vec!["20240608", "20240609", "20240610"]);
    }

    #[tokio::test]
    async fn test_left_edge_overlap_and_inside() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_keys([
            "r/dev/0/20240608/20240608085849-30000.ts",
            "r/dev/0/20240608/20240608085919-30000.ts",
            "r/dev/0/20240608/20240608085949-4520.ts",
            "r/dev/0/20240608/20240608090020-30000.ts",
        ]);

        let window = TimeWindow::new(at("20240608085930"), at("20240608090010"));
        let set = query(store).segments(&locator(), window).await.unwrap();

        assert_eq!(
            set.keys(),
            vec![
                "r/dev/0/20240608/20240608085919-30000.ts",
                "r/dev/0/20240608/20240608085949-4520.ts",
            ]
        );
        assert!(set.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_only_latest_leading_segment_kept() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_keys([
            "r/dev/0/20240608/20240608085800-120000.ts",
            "r/dev/0/20240608/20240608085919-30000.ts",
        ]);

        let window = TimeWindow::new(at("20240608085930"), at("20240608085940"));
        let set = query(store).segments(&locator(), window).await.unwrap();
        assert_eq!(set.keys(), vec!["r/dev/0/20240608/20240608085919-30000.ts"]);
    }

    #[tokio::test]
    async fn test_named_zone_places_winter_segment_at_its_own_offset() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_keys(["r/dev/0/20240115/20240115120000-30000.ts"]);
        let berlin = ArchiveZone::named("Europe/Berlin").unwrap();

        // 11:00:10Z..11:00:20Z is 12:00:10..12:00:20 CET.
        let window = TimeWindow::new(1_705_316_410_000, 1_705_316_420_000);
        let set = TimelineQuery::new(store, berlin)
            .segments(&locator(), window)
            .await
            .unwrap();
        assert_eq!(set.keys(), vec!["r/dev/0/20240115/20240115120000-30000.ts"]);
        assert_eq!(set.segments[0].start_ms(), 1_705_316_400_000);
    }

    #[tokio::test]
    async fn test_end_is_inclusive() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_keys(["r/dev/0/20240608/20240608090010-30000.ts"]);

        let window = TimeWindow::new(at("20240608085930"), at("20240608090010"));
        let set = query(store).segments(&locator(), window).await.unwrap();
        assert_eq!(set.segments.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_names_become_warnings() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_keys([
            "r/dev/0/20240608/index.m3u8",
            "r/dev/0/20240608/garbage-x.ts",
            "r/dev/0/20240608/20240608085949-4520.ts",
        ]);

        let window = TimeWindow::new(at("20240608085930"), at("20240608090010"));
        let set = query(store).segments(&locator(), window).await.unwrap();
        assert_eq!(set.segments.len(), 1);
        assert_eq!(set.warnings.len(), 2);
        assert!(set.warnings.iter().any(|w| w.key.ends_with("garbage-x.ts")));
    }

    #[tokio::test]
    async fn test_all_unparsable_is_distinguishable_from_empty() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_keys(["r/dev/0/20240608/bad.ts"]);

        let window = TimeWindow::new(at("20240608000100"), at("20240608010000"));
        let set = query(store).segments(&locator(), window).await.unwrap();
        assert!(set.is_empty());
        assert_eq!(set.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_day_window_sorted_across_days() {
        let store = Arc::new(InMemoryStore::with_page_size(1));
        store.insert_keys([
            "r/dev/0/20240608/20240608235930-30000.ts",
            "r/dev/0/20240609/20240609000000-30000.ts",
            "r/dev/0/20240609/20240609000030-30000.ts",
        ]);

        let window = TimeWindow::new(at("20240608235900"), at("20240609000100"));
        let set = query(store).segments(&locator(), window).await.unwrap();
        assert_eq!(set.segments.len(), 3);
        assert!(set
            .segments
            .windows(2)
            .all(|pair| pair[0].start_ms() < pair[1].start_ms()));
    }

    #[tokio::test]
    async fn test_mixed_widths_sorted_by_time() {
        let store = Arc::new(InMemoryStore::new());
        let later_secs = at("20240608090000") / 1000;
        let earlier_ms = at("20240608085950");
        let later = format!("r/dev/0/20240608/{later_secs}-10000.ts");
        let earlier = format!("r/dev/0/20240608/{earlier_ms}-10000.ts");
        store.insert_keys([later.as_str(), earlier.as_str()]);

        let window = TimeWindow::new(at("20240608085950"), at("20240608090005"));
        let set = query(store).segments(&locator(), window).await.unwrap();
        assert_eq!(set.keys(), vec![earlier.as_str(), later.as_str()]);
    }

    #[tokio::test]
    async fn test_lookback_finds_segment_spanning_midnight() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_keys([
            "r/dev/0/20240607/20240607235925-30000.ts",
            "r/dev/0/20240607/20240607235955-10000.ts",
            "r/dev/0/20240608/20240608000005-30000.ts",
        ]);

        let window = TimeWindow::new(at("20240608000002"), at("20240608000020"));
        let set = query(store).segments(&locator(), window).await.unwrap();
        assert_eq!(
            set.keys(),
            vec![
                "r/dev/0/20240607/20240607235955-10000.ts",
                "r/dev/0/20240608/20240608000005-30000.ts",
            ]
        );
    }

    #[tokio::test]
    async fn test_lookback_matches_epoch_names() {
        let store = Arc::new(InMemoryStore::new());
        let spanning_ms = at("20240607235948");
        let key = format!("r/dev/0/20240607/{spanning_ms}-15000.mp4");
        store.insert_keys([key.as_str()]);

        let window = TimeWindow::new(at("20240608000001"), at("20240608000010"));
        let set = query(store).segments(&locator(), window).await.unwrap();
        assert_eq!(set.keys(), vec![key.as_str()]);
    }

    #[tokio::test]
    async fn test_lookback_skipped_when_first_day_covers_start() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_keys([
            "r/dev/0/20240607/20240607235955-10000.ts",
            "r/dev/0/20240608/20240608000000-30000.ts",
        ]);

        let window = TimeWindow::new(at("20240608000002"), at("20240608000020"));
        let set = query(store.clone()).segments(&locator(), window).await.unwrap();
        assert_eq!(set.keys(), vec!["r/dev/0/20240608/20240608000000-30000.ts"]);
        assert_eq!(store.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_lookback_skipped_far_from_midnight() {
        let store = Arc::new(InMemoryStore::new());
        let window = TimeWindow::new(at("20240608010000"), at("20240608011000"));
        let set = query(store.clone()).segments(&locator(), window).await.unwrap();
        assert!(set.is_empty());
        assert_eq!(store.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_lookback_ignores_segment_ending_before_window() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_keys(["r/dev/0/20240607/20240607235955-3000.ts"]);

        let window = TimeWindow::new(at("20240608000002"), at("20240608000020"));
        let set = query(store).segments(&locator(), window).await.unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_is_fatal() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_listing("r/dev/0/20240609/");

        let window = TimeWindow::new(at("20240608235900"), at("20240609000100"));
        let err = query(store).segments(&locator(), window).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Transport { op: "list", .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_day() {
        let mut store = MockObjectStore::new();
        store.expect_list_page().times(0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let query = TimelineQuery::new(Arc::new(store), zone());
        let window = TimeWindow::new(at("20240608085930"), at("20240608090010"));
        let err = query
            .segments_cancellable(&locator(), window, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
    }

    #[tokio::test]
    async fn test_timeline_spans() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_keys([
            "r/dev/0/20240608/20240608085919-30000.ts",
            "r/dev/0/20240608/20240608085949-4520.ts",
        ]);

        let window = TimeWindow::new(at("20240608085930"), at("20240608090010"));
        let spans = query(store).timeline(&locator(), window).await.unwrap();
        assert_eq!(
            spans,
            vec![
                TimelineSpan {
                    start_ms: at("20240608085919"),
                    duration_ms: 30000
                },
                TimelineSpan {
                    start_ms: at("20240608085949"),
                    duration_ms: 4520
                },
            ]
        );
    }
}
