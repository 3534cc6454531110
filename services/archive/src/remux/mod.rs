//! Fragmented MP4 concatenation.
//!
//! Independently recorded fMP4 segments each carry their own init boxes and
//! their own decode clock. [`Remuxer`] stitches them into one stream:
//!
//! - `ftyp` and `moov` are written once, from the first input that has them
//! - every `mfhd` sequence number is replaced by a run-wide counter
//! - every `tfdt` is rebased so each track's decode time continues from where
//!   the previous input ended
//!
//! Boxes are rewritten in place and never resized, so `trun` data offsets
//! stay valid. All other boxes, `mdat` included, are streamed through as-is.

pub mod boxes;

#[cfg(test)]
pub(crate) mod fixtures;

use self::boxes::{
    children, read_u32, read_u64, BoxError, BoxHeader, BoxReader, BoxResult, FTYP, MDHD, MDIA,
    MFHD, MOOF, MOOV, MVEX, TFDT, TFHD, TKHD, TRAF, TRAK, TREX, TRUN,
};
use crate::error::{ArchiveError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const TFHD_BASE_DATA_OFFSET: u32 = 0x01;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x02;
const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x08;

const TRUN_DATA_OFFSET: u32 = 0x001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x004;
const TRUN_SAMPLE_DURATION: u32 = 0x100;
const TRUN_SAMPLE_FIELDS: u32 = 0xF00;

/// Run-wide state of one track.
#[derive(Debug, Clone, Copy, Default)]
struct TrackTimeline {
    timescale: u32,
    default_duration: u32,
    /// Decode time at which the next input's fragments start.
    cumulative: u64,
}

/// Per-input state of one track.
#[derive(Debug, Default)]
struct InputTrack {
    zero: Option<u64>,
    fragments: u64,
    last_offset: u64,
    span_end: u64,
    has_durations: bool,
}

/// Totals of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemuxSummary {
    pub inputs: usize,
    pub fragments: u64,
    pub bytes_written: u64,
}

/// Single-use concatenation run writing into `W`.
pub struct Remuxer<W: Write> {
    writer: W,
    ftyp_written: bool,
    moov_written: bool,
    sequence: u32,
    tracks: HashMap<u32, TrackTimeline>,
    summary: RemuxSummary,
}

impl<W: Write> Remuxer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            ftyp_written: false,
            moov_written: false,
            sequence: 0,
            tracks: HashMap::new(),
            summary: RemuxSummary::default(),
        }
    }

    /// Append one input. `duration_hint_ms` (from the segment filename) is
    /// used only when the fragments carry no sample durations at all.
    ///
    /// Any structural error aborts the run; the output written so far must
    /// be discarded.
    pub fn push_input<R: Read + Seek>(&mut self, reader: R, duration_hint_ms: i64) -> Result<()> {
        let input = self.summary.inputs;
        self.process_input(reader, duration_hint_ms)
            .map_err(|e| ArchiveError::remux(input, e.to_string()))?;
        self.summary.inputs += 1;
        Ok(())
    }

    /// Flush and hand back the writer.
    pub fn finish(mut self) -> Result<(W, RemuxSummary)> {
        self.writer.flush()?;
        Ok((self.writer, self.summary))
    }

    fn process_input<R: Read + Seek>(&mut self, reader: R, duration_hint_ms: i64) -> BoxResult<()> {
        let mut cursor = BoxReader::new(reader)?;
        let mut input_tracks: HashMap<u32, InputTrack> = HashMap::new();

        while let Some(header) = cursor.next_box()? {
            match header.box_type {
                FTYP => {
                    if !self.ftyp_written {
                        self.summary.bytes_written += cursor.copy_box(&header, &mut self.writer)?;
                        self.ftyp_written = true;
                    }
                }
                MOOV => {
                    let payload = cursor.read_payload(&header)?;
                    self.register_tracks(&payload)?;
                    if !self.moov_written {
                        self.write_box(&header, &payload)?;
                        self.moov_written = true;
                    }
                }
                MOOF => {
                    let mut payload = cursor.read_payload(&header)?;
                    self.rewrite_moof(&mut payload, &mut input_tracks)?;
                    self.write_box(&header, &payload)?;
                    self.summary.fragments += 1;
                }
                _ => {
                    self.summary.bytes_written += cursor.copy_box(&header, &mut self.writer)?;
                }
            }
        }

        self.advance_tracks(input_tracks, duration_hint_ms);
        Ok(())
    }

    fn write_box(&mut self, header: &BoxHeader, payload: &[u8]) -> BoxResult<()> {
        let header_len = header.write_to(&mut self.writer)?;
        self.writer.write_all(payload)?;
        self.summary.bytes_written += header_len + payload.len() as u64;
        Ok(())
    }

    /// Record track ids, timescales and default durations from a `moov`.
    fn register_tracks(&mut self, moov: &[u8]) -> BoxResult<()> {
        for child in children(moov)? {
            match child.box_type {
                TRAK => {
                    let (track_id, timescale) = parse_trak(child.payload(moov))?;
                    let track = self.tracks.entry(track_id).or_default();
                    if track.timescale == 0 {
                        track.timescale = timescale;
                    }
                }
                MVEX => {
                    let mvex = child.payload(moov);
                    for trex in children(mvex)?.into_iter().filter(|c| c.box_type == TREX) {
                        let p = trex.payload(mvex);
                        if p.len() < 16 {
                            return Err(BoxError::invalid(TREX, "too short"));
                        }
                        let track = self.tracks.entry(read_u32(p, 4)).or_default();
                        if track.default_duration == 0 {
                            track.default_duration = read_u32(p, 12);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn rewrite_moof(
        &mut self,
        moof: &mut [u8],
        input_tracks: &mut HashMap<u32, InputTrack>,
    ) -> BoxResult<()> {
        for child in children(moof)? {
            match child.box_type {
                MFHD => {
                    if child.end - child.payload_start < 8 {
                        return Err(BoxError::invalid(MFHD, "too short"));
                    }
                    self.sequence = self.sequence.wrapping_add(1);
                    let at = child.payload_start + 4;
                    moof[at..at + 4].copy_from_slice(&self.sequence.to_be_bytes());
                }
                TRAF => {
                    self.rewrite_traf(&mut moof[child.payload_start..child.end], input_tracks)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn rewrite_traf(
        &mut self,
        traf: &mut [u8],
        input_tracks: &mut HashMap<u32, InputTrack>,
    ) -> BoxResult<()> {
        let kids = children(traf)?;

        let tfhd = kids
            .iter()
            .find(|c| c.box_type == TFHD)
            .ok_or_else(|| BoxError::invalid(TRAF, "missing tfhd"))?;
        let (track_id, tfhd_default) = parse_tfhd(tfhd.payload(traf))?;

        let timeline = self.tracks.entry(track_id).or_default();
        let default_duration = tfhd_default.or((timeline.default_duration > 0).then_some(timeline.default_duration));
        let cumulative = timeline.cumulative;

        let mut duration = Some(0u64);
        let mut runs = 0;
        for trun in kids.iter().filter(|c| c.box_type == TRUN) {
            runs += 1;
            let run = parse_trun_duration(trun.payload(traf), default_duration)?;
            duration = duration.zip(run).map(|(a, b)| a + b);
        }
        if runs == 0 {
            duration = None;
        }

        let state = input_tracks.entry(track_id).or_default();
        let Some(tfdt) = kids.iter().find(|c| c.box_type == TFDT) else {
            // Nothing to rebase; the run follows the previous fragment.
            let offset = state.span_end;
            state.fragments += 1;
            state.last_offset = offset;
            if let Some(d) = duration {
                state.has_durations = true;
                state.span_end = offset + d;
            }
            debug!(track_id, offset, "Copied fragment without tfdt");
            return Ok(());
        };
        let body = &mut traf[tfdt.payload_start..tfdt.end];
        let raw = read_decode_time(body)?;

        // Fragments copied before the first tfdt already occupy `span_end`.
        let zero = *state.zero.get_or_insert(raw.saturating_sub(state.span_end));
        let offset = raw
            .checked_sub(zero)
            .ok_or_else(|| BoxError::invalid(TFDT, format!("track {track_id} decode time moved backwards")))?;
        let rebased = offset
            .checked_add(cumulative)
            .ok_or_else(|| BoxError::invalid(TFDT, "rebased decode time overflows 64 bits"))?;
        write_decode_time(body, rebased)?;

        state.fragments += 1;
        state.last_offset = offset;
        if let Some(d) = duration {
            state.has_durations = true;
            state.span_end = state.span_end.max(offset + d);
        }

        debug!(track_id, raw, rebased, "Rebased fragment");
        Ok(())
    }

    /// Move each track's running total past the input just written.
    fn advance_tracks(&mut self, input_tracks: HashMap<u32, InputTrack>, duration_hint_ms: i64) {
        for (track_id, state) in input_tracks {
            let timeline = self.tracks.entry(track_id).or_default();
            let advance = if state.has_durations {
                state.span_end.max(state.last_offset)
            } else if state.fragments > 1 {
                // Average fragment spacing stands in for the last fragment's length.
                state.last_offset + state.last_offset / (state.fragments - 1)
            } else if timeline.timescale > 0 {
                (duration_hint_ms.max(0) as u64).saturating_mul(timeline.timescale as u64) / 1000
            } else {
                warn!(track_id, "No duration or timescale for track, timeline will overlap");
                0
            };
            timeline.cumulative = timeline.cumulative.saturating_add(advance);
        }
    }
}

/// Concatenate fMP4 files into `output`.
///
/// `inputs` pairs each file with its filename duration in milliseconds.
/// On error the partially written output is left for the caller to remove.
pub fn remux_files(inputs: &[(PathBuf, i64)], output: &Path) -> Result<RemuxSummary> {
    let file = File::create(output)?;
    let mut remuxer = Remuxer::new(BufWriter::new(file));

    for (path, duration_hint_ms) in inputs {
        let input = File::open(path)?;
        remuxer.push_input(BufReader::new(input), *duration_hint_ms)?;
    }

    let (_, summary) = remuxer.finish()?;
    metrics::counter!("archive.remux.fragments").increment(summary.fragments);
    info!(
        output = %output.display(),
        inputs = summary.inputs,
        fragments = summary.fragments,
        bytes = summary.bytes_written,
        "Remux complete"
    );
    Ok(summary)
}

/// `(track_id, timescale)` of a `trak`.
fn parse_trak(trak: &[u8]) -> BoxResult<(u32, u32)> {
    let kids = children(trak)?;

    let tkhd = kids
        .iter()
        .find(|c| c.box_type == TKHD)
        .ok_or_else(|| BoxError::invalid(TRAK, "missing tkhd"))?
        .payload(trak);
    let track_id = versioned_u32(tkhd, TKHD, 12, 20)?;

    let mut timescale = 0;
    if let Some(mdia) = kids.iter().find(|c| c.box_type == MDIA) {
        let mdia = mdia.payload(trak);
        if let Some(mdhd) = children(mdia)?.into_iter().find(|c| c.box_type == MDHD) {
            timescale = versioned_u32(mdhd.payload(mdia), MDHD, 12, 20)?;
        }
    }

    Ok((track_id, timescale))
}

/// Read a u32 field whose offset depends on the full-box version.
fn versioned_u32(body: &[u8], box_type: [u8; 4], v0_at: usize, v1_at: usize) -> BoxResult<u32> {
    let at = match body.first() {
        Some(0) => v0_at,
        Some(1) => v1_at,
        Some(v) => return Err(BoxError::invalid(box_type, format!("unsupported version {v}"))),
        None => return Err(BoxError::invalid(box_type, "empty")),
    };
    if body.len() < at + 4 {
        return Err(BoxError::invalid(box_type, "too short"));
    }
    Ok(read_u32(body, at))
}

/// `(track_id, default_sample_duration)` of a `tfhd`.
fn parse_tfhd(body: &[u8]) -> BoxResult<(u32, Option<u32>)> {
    if body.len() < 8 {
        return Err(BoxError::invalid(TFHD, "too short"));
    }
    let flags = read_u32(body, 0) & 0x00FF_FFFF;
    let track_id = read_u32(body, 4);

    let mut pos = 8;
    if flags & TFHD_BASE_DATA_OFFSET != 0 {
        pos += 8;
    }
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        pos += 4;
    }
    let default_duration = if flags & TFHD_DEFAULT_SAMPLE_DURATION != 0 {
        if body.len() < pos + 4 {
            return Err(BoxError::invalid(TFHD, "default duration past end"));
        }
        Some(read_u32(body, pos)).filter(|d| *d > 0)
    } else {
        None
    };

    Ok((track_id, default_duration))
}

/// Summed sample durations of a `trun`, or `None` when neither the run nor
/// a default supplies them.
fn parse_trun_duration(body: &[u8], default_duration: Option<u32>) -> BoxResult<Option<u64>> {
    if body.len() < 8 {
        return Err(BoxError::invalid(TRUN, "too short"));
    }
    let flags = read_u32(body, 0) & 0x00FF_FFFF;
    let sample_count = read_u32(body, 4) as usize;

    if flags & TRUN_SAMPLE_DURATION == 0 {
        return Ok(default_duration.map(|d| d as u64 * sample_count as u64));
    }

    let mut pos = 8;
    if flags & TRUN_DATA_OFFSET != 0 {
        pos += 4;
    }
    if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        pos += 4;
    }
    let stride = 4 * (flags & TRUN_SAMPLE_FIELDS).count_ones() as usize;
    let needed = sample_count
        .checked_mul(stride)
        .and_then(|n| n.checked_add(pos))
        .ok_or_else(|| BoxError::invalid(TRUN, "sample table size overflows"))?;
    if body.len() < needed {
        return Err(BoxError::invalid(
            TRUN,
            format!("{sample_count} samples need {needed} bytes, have {}", body.len()),
        ));
    }

    // Duration is the first per-sample field when present.
    let total = (0..sample_count)
        .map(|i| read_u32(body, pos + i * stride) as u64)
        .sum();
    Ok(Some(total))
}

fn read_decode_time(tfdt: &[u8]) -> BoxResult<u64> {
    match tfdt.first() {
        Some(1) if tfdt.len() >= 12 => Ok(read_u64(tfdt, 4)),
        Some(0) if tfdt.len() >= 8 => Ok(read_u32(tfdt, 4) as u64),
        Some(0) | Some(1) => Err(BoxError::invalid(TFDT, "too short")),
        Some(v) => Err(BoxError::invalid(TFDT, format!("unsupported version {v}"))),
        None => Err(BoxError::invalid(TFDT, "empty")),
    }
}

fn write_decode_time(tfdt: &mut [u8], value: u64) -> BoxResult<()> {
    if tfdt[0] == 1 {
        tfdt[4..12].copy_from_slice(&value.to_be_bytes());
    } else {
        let narrow = u32::try_from(value)
            .map_err(|_| BoxError::invalid(TFDT, format!("rebased decode time {value} overflows 32 bits")))?;
        tfdt[4..8].copy_from_slice(&narrow.to_be_bytes());
    }
    Ok(())
}
