//! Nier Archive Service
//!
//! Time-indexed archive of camera recordings kept in an S3-compatible bucket.
//! Devices upload short MPEG-TS or fragmented MP4 segments whose filenames
//! carry their start time and duration; this crate answers "what was
//! recorded between A and B" on top of that layout and turns the answer into
//! something playable.
//!
//! ## Features
//!
//! - **Timeline Queries**: Resolve a time window to an ordered segment list,
//!   including the segment that started before midnight and runs into the
//!   window
//! - **Month Bitmap**: One probe per day to mark which days hold recordings
//! - **HLS Playlists**: VOD playlists with presigned or raw-key URIs and
//!   discontinuity markers on gaps
//! - **fMP4 Remux**: Concatenate fragmented MP4 segments into one file with a
//!   continuous decode timeline
//! - **Storage Migration**: Copy-then-delete moves between archive roots
//! - **Bulk Download**: Stream TS windows or merge fMP4 windows with progress
//!
//! ## Architecture
//!
//! ```text
//! S3 Bucket                         Engine                       Consumers
//! ┌──────────────────┐         ┌──────────────┐           ┌──────────────┐
//! │ {root}/          │         │ Timeline     │──────────▶│ Playlist     │
//! │   {device}/      │────────▶│ Query        │           │ Synthesizer  │
//! │   {channel}/     │         └──────────────┘           └──────────────┘
//! │   {yyyyMMdd}/    │                │                          │
//! │   {start}-{ms}.x │                ▼                          ▼
//! └──────────────────┘         ┌──────────────┐           ┌──────────────┐
//!        ▲      │              │ Downloader   │──────────▶│ Remuxer      │
//!        │      │              └──────────────┘           └──────────────┘
//!        │      ▼                     │
//! ┌──────────────┐             ┌──────────────┐
//! │ Migrator     │             │ Scratch Dir  │
//! └──────────────┘             │ + Sweeper    │
//!                              └──────────────┘
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod locator;
pub mod migrate;
pub mod month;
pub mod playlist;
pub mod progress;
pub mod remux;
pub mod scratch;
pub mod segment;
pub mod store;
pub mod timeline;
pub mod zone;

pub use config::Config;
pub use download::{import_segment, DownloadJob, DownloadOutcome, Downloader};
pub use error::{ArchiveError, Result};
pub use locator::RecordingLocator;
pub use migrate::{MigrationReport, Migrator};
pub use month::{MonthBitmap, MonthReporter};
pub use playlist::{PlaylistEntry, PlaylistSynthesizer, UriMode};
pub use progress::{Progress, ProgressFn};
pub use remux::{remux_files, RemuxSummary, Remuxer};
pub use scratch::ScratchDir;
pub use segment::{MediaExt, SegmentKey, SegmentName};
pub use store::{ObjectStore, S3Store};
pub use timeline::{SegmentSet, TimeWindow, TimelineQuery};
pub use zone::ArchiveZone;
