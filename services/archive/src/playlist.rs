use crate::config::{Config, UriModeConfig};
use crate::error::Result;
use crate::segment::{MediaExt, SegmentKey};
use crate::store::ObjectStore;
use crate::timeline::{cover, TimeWindow};
use crate::zone::ArchiveZone;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default gap above which adjacent entries are discontinuous.
pub const DEFAULT_DISCONTINUITY_GAP_MS: i64 = 2000;

/// Custom tag carrying the summed duration of every entry.
pub const TOTAL_DURATION_TAG: &str = "#EXT_X_TOTAL_DURATION:";

/// Presign requests in flight at once.
const PRESIGN_CONCURRENCY: usize = 16;

/// One playlist item, in playback order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub key: String,
    pub start_ms: i64,
    pub duration_ms: i64,
    pub ext: MediaExt,
}

impl From<&SegmentKey> for PlaylistEntry {
    fn from(segment: &SegmentKey) -> Self {
        Self {
            key: segment.key().to_string(),
            start_ms: segment.start_ms(),
            duration_ms: segment.duration_ms(),
            ext: segment.ext(),
        }
    }
}

/// How entry URIs are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriMode {
    /// Presigned GET URL valid for `ttl`.
    Presigned { ttl: Duration },
    /// The object key itself, optionally joined onto a base URL.
    RawKey { base_url: Option<String> },
}

impl UriMode {
    pub fn from_config(config: &Config) -> Self {
        match config.archive.uri_mode {
            UriModeConfig::Presigned => Self::Presigned {
                ttl: config.presigned_url_expiry(),
            },
            UriModeConfig::RawKey => Self::RawKey {
                base_url: config.archive.raw_base_url.clone(),
            },
        }
    }
}

/// Turns ordered entries into playlist text.
pub struct PlaylistSynthesizer {
    store: Arc<dyn ObjectStore>,
    uri_mode: UriMode,
    gap_ms: i64,
}

impl PlaylistSynthesizer {
    pub fn new(store: Arc<dyn ObjectStore>, uri_mode: UriMode) -> Self {
        Self {
            store,
            uri_mode,
            gap_ms: DEFAULT_DISCONTINUITY_GAP_MS,
        }
    }

    pub fn with_gap_ms(mut self, gap_ms: i64) -> Self {
        self.gap_ms = gap_ms;
        self
    }

    /// Render `entries` with one URI each. Presign failures are fatal.
    pub async fn synthesize(&self, entries: &[PlaylistEntry]) -> Result<String> {
        let uris: Vec<String> = stream::iter(entries)
            .map(|entry| self.uri_for(&entry.key))
            .buffered(PRESIGN_CONCURRENCY)
            .try_collect()
            .await?;

        debug!(entries = entries.len(), "Synthesized playlist");
        Ok(render(entries, &uris, self.gap_ms))
    }

    /// Render the covering segments of a query.
    pub async fn synthesize_segments(&self, segments: &[SegmentKey]) -> Result<String> {
        let entries: Vec<PlaylistEntry> = segments.iter().map(PlaylistEntry::from).collect();
        self.synthesize(&entries).await
    }

    async fn uri_for(&self, key: &str) -> Result<String> {
        match &self.uri_mode {
            UriMode::Presigned { ttl } => self.store.presign_get(key, *ttl).await,
            UriMode::RawKey { base_url: Some(base) } => {
                Ok(format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/')))
            }
            UriMode::RawKey { base_url: None } => Ok(key.to_string()),
        }
    }
}

/// Render a closed VOD media playlist.
///
/// `uris[i]` is the URI of `entries[i]`. A discontinuity precedes any entry
/// starting more than `gap_ms` after the previous entry's end, or whose
/// extension differs from the previous entry's.
pub fn render(entries: &[PlaylistEntry], uris: &[String], gap_ms: i64) -> String {
    let max_ms = entries.iter().map(|e| e.duration_ms).max().unwrap_or(0);
    let total_ms: i64 = entries.iter().map(|e| e.duration_ms).sum();
    let target_secs = (max_ms.max(0) + 999) / 1000;

    let mut playlist = String::new();
    let _ = writeln!(playlist, "#EXTM3U");
    let _ = writeln!(playlist, "#EXT-X-VERSION:7");
    let _ = writeln!(playlist, "#EXT-X-MEDIA-SEQUENCE:0");
    let _ = writeln!(playlist, "#EXT-X-TARGETDURATION:{target_secs}");
    let _ = writeln!(playlist, "#EXT-X-PLAYLIST-TYPE:VOD");
    let _ = writeln!(playlist, "{TOTAL_DURATION_TAG}{}", seconds(total_ms));

    let mut previous: Option<&PlaylistEntry> = None;
    for (entry, uri) in entries.iter().zip(uris) {
        if let Some(prev) = previous {
            let gap = entry.start_ms - (prev.start_ms + prev.duration_ms);
            if gap > gap_ms || entry.ext != prev.ext {
                let _ = writeln!(playlist, "#EXT-X-DISCONTINUITY");
            }
        }
        let _ = writeln!(playlist, "#EXTINF:{},", seconds(entry.duration_ms));
        let _ = writeln!(playlist, "{uri}");
        previous = Some(entry);
    }

    let _ = writeln!(playlist, "#EXT-X-ENDLIST");
    playlist
}

/// URI lines of a playlist, in order.
pub fn playlist_uris(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Keep only the entries of `text` that cover `window`, re-rendered.
///
/// Spans come from each URI's filename; URIs (query strings included)
/// are kept verbatim. Lines whose filename does not parse are dropped.
pub fn cut_playlist(text: &str, window: TimeWindow, zone: ArchiveZone, gap_ms: i64) -> String {
    let segments = playlist_uris(text)
        .into_iter()
        .filter_map(|uri| match SegmentKey::from_uri(&uri, zone) {
            Ok(segment) => Some(segment),
            Err(err) => {
                warn!(uri = %uri, error = %err, "Dropping playlist entry with unparsable name");
                None
            }
        });

    let kept = cover(window, segments);
    let entries: Vec<PlaylistEntry> = kept.iter().map(PlaylistEntry::from).collect();
    let uris: Vec<String> = kept.into_iter().map(SegmentKey::into_key).collect();
    render(&entries, &uris, gap_ms)
}

/// Milliseconds as seconds with millisecond precision.
fn seconds(ms: i64) -> String {
    format!("{}.{:03}", ms / 1000, (ms % 1000).abs())
}
