// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sample windows: byte offsets, sizes and timestamps for one block of
//! frames, built from the sample tables when playback reaches the block.

use log::{debug, warn};

use crate::source::{read_exact_at, ByteSource};
use crate::track::{SampleSizeTable, TableRef, Track};
use crate::{DecodeConfig, Error, Result, ToU64, ToUsize, TryVec};

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;

/// Sample tables are read from the source in chunks of this many bytes.
pub(crate) const READ_BULK_SIZE: usize = 4096;

/// Size of a full box header followed by an entry count.
const TABLE_HEADER_LEN: u64 = 16;
/// 'stsz' has the constant sample size before its count.
const STSZ_HEADER_LEN: u64 = 20;

/// Reads consecutive fixed-size entries of a sample table, buffering
/// `READ_BULK_SIZE` bytes at a time.
pub(crate) struct TableReader {
    next_offset: u64,
    remaining: u32,
    entry_len: usize,
    buf: [u8; READ_BULK_SIZE],
    pos: usize,
    len: usize,
}

impl TableReader {
    pub(crate) fn new(offset: u64, entries: u32, entry_len: usize) -> Self {
        debug_assert!(entry_len > 0 && entry_len <= READ_BULK_SIZE);
        Self { next_offset: offset, remaining: entries, entry_len, buf: [0; READ_BULK_SIZE], pos: 0, len: 0 }
    }

    /// Reader positioned at entry `first` of a table with the usual 16-byte header.
    pub(crate) fn for_table(table: TableRef, first: u32, entry_len: usize) -> Self {
        let offset = table.offset + TABLE_HEADER_LEN + u64::from(first) * entry_len.to_u64();
        Self::new(offset, table.entries.saturating_sub(first), entry_len)
    }

    pub(crate) fn next<S: ByteSource + ?Sized>(&mut self, source: &mut S) -> Result<Option<&[u8]>> {
        if self.pos >= self.len {
            if self.remaining == 0 {
                return Ok(None);
            }
            let per_read = u32::try_from(READ_BULK_SIZE / self.entry_len)?;
            let n = self.remaining.min(per_read);
            let bytes = n.to_usize() * self.entry_len;
            match read_exact_at(source, self.next_offset, &mut self.buf[..bytes]) {
                Ok(()) => {},
                Err(Error::UnexpectedEOF) => return Err(Error::CorruptIndex("sample table truncated")),
                Err(e) => return Err(e),
            }
            self.next_offset += bytes.to_u64();
            self.remaining -= n;
            self.pos = 0;
            self.len = bytes;
        }
        let entry = &self.buf[self.pos..self.pos + self.entry_len];
        self.pos += self.entry_len;
        Ok(Some(entry))
    }

    pub(crate) fn next_u32<S: ByteSource + ?Sized>(&mut self, source: &mut S) -> Result<Option<u32>> {
        Ok(self.next(source)?.map(|e| u32::from_be_bytes([e[0], e[1], e[2], e[3]])))
    }

    pub(crate) fn next_pair<S: ByteSource + ?Sized>(&mut self, source: &mut S) -> Result<Option<(u32, u32)>> {
        Ok(self.next(source)?.map(|e| {
            (u32::from_be_bytes([e[0], e[1], e[2], e[3]]), u32::from_be_bytes([e[4], e[5], e[6], e[7]]))
        }))
    }

    /// Next 32- or 64-bit chunk offset, depending on the entry length.
    fn next_chunk_offset<S: ByteSource + ?Sized>(&mut self, source: &mut S) -> Result<Option<u64>> {
        Ok(self.next(source)?.map(|e| match *e {
            [a, b, c, d] => u64::from(u32::from_be_bytes([a, b, c, d])),
            [a, b, c, d, e, f, g, h] => u64::from_be_bytes([a, b, c, d, e, f, g, h]),
            _ => 0,
        }))
    }
}

/// One 'stsc' entry: chunks from `first_chunk` on hold `samples_per_chunk` samples each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkRun {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    /// 1-based index into the sample descriptions.
    pub description_index: u32,
}

/// A position in the chunk run list, carried between builds so that
/// sequential playback never rescans the runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ChunkCursor {
    pub run: usize,
    /// 1-based chunk number; 0 when unset.
    pub chunk: u32,
    pub frames_before_chunk: u64,
}

/// A position in a run-length table ('stts' or 'ctts'): the entry index of a
/// run, the frames before it and, for 'stts', the decode time at its start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunCursor {
    pub entry: u32,
    pub frames_before: u64,
    pub time_before: u64,
}

impl RunCursor {
    /// Where a read starting at `frame` may begin.
    fn resume_at(self, frame: u32, table: TableRef) -> Self {
        if self.frames_before <= u64::from(frame) && self.entry < table.entries {
            self
        } else {
            Self::default()
        }
    }
}

/// Locations and timestamps of one block of frames.
#[derive(Debug)]
pub(crate) struct SampleWindow {
    pub block: u32,
    pub first_frame: u32,
    pub offsets: TryVec<u64>,
    pub sizes: TryVec<u32>,
    pub dts: TryVec<u64>,
    pub cts_offsets: TryVec<i64>,
    /// The chunk offset table ended inside this block.
    pub corrupt: bool,
    /// Frames below this number are usable.
    pub valid_frames: u32,
}

impl SampleWindow {
    /// Position of `frame` in the window's arrays.
    pub(crate) fn index_of(&self, frame: u32) -> Option<usize> {
        let i = frame.checked_sub(self.first_frame)?.to_usize();
        (i < self.offsets.len()).then_some(i)
    }
}

#[derive(Debug, Default)]
pub(crate) enum FramingState {
    #[default]
    Empty,
    Built(SampleWindow),
}

/// Read the 'stsc' runs of a track, once.
pub(crate) fn load_chunk_runs<S: ByteSource + ?Sized>(source: &mut S, track: &mut Track) -> Result<()> {
    if track.chunk_runs.is_some() {
        return Ok(());
    }
    let stsc = track.tables.stsc.ok_or(Error::CorruptIndex("missing stsc"))?;
    if stsc.entries == 0 {
        return Err(Error::CorruptIndex("empty stsc"));
    }
    let mut runs: TryVec<ChunkRun> = TryVec::with_capacity(stsc.entries.to_usize())?;
    let mut reader = TableReader::for_table(stsc, 0, 12);
    while let Some(e) = reader.next(source)? {
        let run = ChunkRun {
            first_chunk: u32::from_be_bytes([e[0], e[1], e[2], e[3]]),
            samples_per_chunk: u32::from_be_bytes([e[4], e[5], e[6], e[7]]),
            description_index: u32::from_be_bytes([e[8], e[9], e[10], e[11]]),
        };
        if run.first_chunk == 0 || runs.last().is_some_and(|prev| prev.first_chunk >= run.first_chunk) {
            return Err(Error::CorruptIndex("stsc runs out of order"));
        }
        if run.samples_per_chunk == 0 {
            return Err(Error::CorruptIndex("stsc run with no samples"));
        }
        runs.push(run)?;
    }
    debug!("track {}: {} chunk runs", track.id, runs.len());
    track.chunk_runs = Some(runs);
    Ok(())
}

/// Find the chunk holding `frame`, resuming from `start` when it lies before the frame.
/// Frames past the last run are placed by extrapolating its samples per chunk.
pub(crate) fn locate_chunk(runs: &[ChunkRun], frame: u32, start: ChunkCursor) -> Result<ChunkCursor> {
    let frame = u64::from(frame);
    let first = runs.first().ok_or(Error::CorruptIndex("empty stsc"))?;
    let mut cur = if start.chunk != 0 && start.run < runs.len() && start.frames_before_chunk <= frame {
        start
    } else {
        ChunkCursor { run: 0, chunk: first.first_chunk, frames_before_chunk: 0 }
    };

    loop {
        let spc = u64::from(runs[cur.run].samples_per_chunk);
        if spc == 0 {
            return Err(Error::CorruptIndex("stsc run with no samples"));
        }
        let Some(next) = runs.get(cur.run + 1) else {
            break;
        };
        let chunks_left = u64::from(next.first_chunk.saturating_sub(cur.chunk));
        let frames_left = chunks_left * spc;
        if frame < cur.frames_before_chunk + frames_left {
            break;
        }
        cur.frames_before_chunk += frames_left;
        cur.chunk = next.first_chunk;
        cur.run += 1;
    }

    let spc = u64::from(runs[cur.run].samples_per_chunk);
    let k = (frame - cur.frames_before_chunk) / spc;
    cur.chunk = u32::try_from(u64::from(cur.chunk) + k).map_err(|_| Error::CorruptIndex("chunk number overflow"))?;
    cur.frames_before_chunk += k * spc;
    Ok(cur)
}

/// 1-based sample description index in effect for `frame`.
pub(crate) fn description_index_for_frame<S: ByteSource + ?Sized>(
    source: &mut S,
    track: &mut Track,
    frame: u32,
) -> Result<u32> {
    load_chunk_runs(source, track)?;
    let runs = track.chunk_runs.as_deref().ok_or(Error::CorruptIndex("missing stsc"))?;
    let cur = locate_chunk(runs, frame, ChunkCursor::default())?;
    Ok(runs[cur.run].description_index)
}

/// Size of one sample, from the constant size or the 'stsz' entry.
pub(crate) fn sample_size_of<S: ByteSource + ?Sized>(source: &mut S, stsz: SampleSizeTable, frame: u32) -> Result<u32> {
    if stsz.sample_size != 0 {
        return Ok(stsz.sample_size);
    }
    if frame >= stsz.sample_count {
        return Err(Error::EndOfStream);
    }
    let mut raw = [0u8; 4];
    read_exact_at(source, stsz.offset + STSZ_HEADER_LEN + 4 * u64::from(frame), &mut raw)?;
    Ok(u32::from_be_bytes(raw))
}

/// Decode times of `count` frames from `first`. Frames past the end of
/// 'stts' continue with its last delta.
///
/// Starts from `cursor` when it lies at or before `first` and leaves it on
/// the run holding the last frame read.
pub(crate) fn read_decode_times<S: ByteSource + ?Sized>(
    source: &mut S,
    stts: TableRef,
    first: u32,
    count: u32,
    cursor: &mut RunCursor,
) -> Result<TryVec<u64>> {
    let mut out = TryVec::with_capacity(count.to_usize())?;
    if stts.entries == 1 {
        let mut reader = TableReader::for_table(stts, 0, 8);
        let (_, delta) = reader.next_pair(source)?.ok_or(Error::CorruptIndex("empty stts"))?;
        for i in 0..count {
            out.push(u64::from(delta).saturating_mul(u64::from(first) + u64::from(i)))?;
        }
        return Ok(out);
    }

    let start = cursor.resume_at(first, stts);
    let mut reader = TableReader::for_table(stts, start.entry, 8);
    let mut entry = start.entry;
    let mut run_start = start.frames_before;
    let mut time = start.time_before;
    let mut run_len = 0u64;
    let mut delta = 0u64;
    let mut last = start;
    for i in 0..count {
        let frame = u64::from(first) + u64::from(i);
        while frame >= run_start.saturating_add(run_len) {
            time = time.saturating_add(run_len.saturating_mul(delta));
            run_start += run_len;
            match reader.next_pair(source)? {
                Some((n, d)) => {
                    last = RunCursor { entry, frames_before: run_start, time_before: time };
                    entry += 1;
                    run_len = u64::from(n);
                    delta = u64::from(d);
                },
                None => run_len = u64::MAX - run_start,
            }
        }
        out.push(time.saturating_add((frame - run_start).saturating_mul(delta)))?;
    }
    *cursor = last;
    Ok(out)
}

pub(crate) fn decode_time_of<S: ByteSource + ?Sized>(source: &mut S, track: &Track, frame: u32) -> Result<u64> {
    let stts = track.tables.stts.ok_or(Error::CorruptIndex("missing stts"))?;
    let times = read_decode_times(source, stts, frame, 1, &mut RunCursor::default())?;
    times.first().copied().ok_or(Error::CorruptIndex("missing decode time"))
}

/// Composition offsets of `count` frames from `first`; zero without 'ctts'.
fn read_composition_offsets<S: ByteSource + ?Sized>(
    source: &mut S,
    ctts: Option<TableRef>,
    signed: bool,
    first: u32,
    count: u32,
    cursor: &mut RunCursor,
) -> Result<TryVec<i64>> {
    let mut out = TryVec::with_capacity(count.to_usize())?;
    let Some(ctts) = ctts else {
        for _ in 0..count {
            out.push(0)?;
        }
        return Ok(out);
    };
    let start = cursor.resume_at(first, ctts);
    let mut reader = TableReader::for_table(ctts, start.entry, 8);
    let mut entry = start.entry;
    let mut run_start = start.frames_before;
    let mut run_len = 0u64;
    let mut value = 0i64;
    let mut last = start;
    for i in 0..count {
        let frame = u64::from(first) + u64::from(i);
        while frame >= run_start.saturating_add(run_len) {
            run_start += run_len;
            match reader.next_pair(source)? {
                Some((n, raw)) => {
                    last = RunCursor { entry, frames_before: run_start, time_before: 0 };
                    entry += 1;
                    run_len = u64::from(n);
                    value = if signed { i64::from(raw as i32) } else { i64::from(raw) };
                },
                None => {
                    run_len = u64::MAX - run_start;
                    value = 0;
                },
            }
        }
        out.push(value)?;
    }
    *cursor = last;
    Ok(out)
}

/// Build the sample window for `block`.
pub(crate) fn build_block<S: ByteSource + ?Sized>(
    source: &mut S,
    track: &mut Track,
    block: u32,
    config: &DecodeConfig,
) -> Result<SampleWindow> {
    let per = config.frames_per_block();
    let total = track.total_frames();
    let first = block.checked_mul(per).filter(|&f| f < total).ok_or(Error::EndOfStream)?;
    let count = per.min(total - first);

    let stsz = track.tables.stsz.ok_or(Error::CorruptIndex("missing stsz"))?;
    let chunks = track.tables.chunk_offsets.ok_or(Error::CorruptIndex("missing chunk offsets"))?;
    let stts = track.tables.stts.ok_or(Error::CorruptIndex("missing stts"))?;
    load_chunk_runs(source, track)?;

    let dts = read_decode_times(source, stts, first, count, &mut track.stts_cursor)?;
    let signed = track.tables.ctts_version == 1;
    let cts_offsets =
        read_composition_offsets(source, track.tables.ctts, signed, first, count, &mut track.ctts_cursor)?;

    let runs = track.chunk_runs.as_deref().ok_or(Error::CorruptIndex("missing stsc"))?;
    let mut cur = locate_chunk(runs, first, track.cursor)?;
    if cur.chunk > chunks.entries {
        debug!("track {}: chunk {} is past the chunk offset table", track.id, cur.chunk);
        return Err(Error::EndOfStream);
    }

    // frames of the first chunk that precede this block
    let lead = u64::from(first) - cur.frames_before_chunk;
    let lead_frames = u32::try_from(lead).map_err(|_| Error::CorruptIndex("chunk larger than the track"))?;
    let mut sizes = TryVec::with_capacity(count.to_usize())?;
    let mut lead_bytes = 0u64;
    if stsz.sample_size != 0 {
        lead_bytes = lead * u64::from(stsz.sample_size);
        for _ in 0..count {
            sizes.push(stsz.sample_size)?;
        }
    } else {
        let from = u32::try_from(cur.frames_before_chunk)?;
        let entries = lead_frames.checked_add(count).ok_or(Error::CorruptIndex("chunk larger than the track"))?;
        let mut reader = TableReader::new(stsz.offset + STSZ_HEADER_LEN + 4 * u64::from(from), entries, 4);
        for _ in 0..lead_frames {
            let size = reader.next_u32(source)?.ok_or(Error::CorruptIndex("stsz shorter than its count"))?;
            lead_bytes += u64::from(size);
        }
        for _ in 0..count {
            sizes.push(reader.next_u32(source)?.ok_or(Error::CorruptIndex("stsz shorter than its count"))?)?;
        }
    }

    let width = chunks.entry_len();
    let available = chunks.entries - cur.chunk + 1;
    let offset_table = TableRef { offset: chunks.offset, entries: chunks.entries };
    let mut offset_reader = TableReader::for_table(offset_table, cur.chunk - 1, width);
    offset_reader.remaining = available.min(per.saturating_add(1));
    let chunk_base = offset_reader.next_chunk_offset(source)?.ok_or(Error::EndOfStream)?;

    let mut spc = u64::from(runs[cur.run].samples_per_chunk);
    let mut in_chunk = lead;
    let mut pos = chunk_base + lead_bytes;
    let mut offsets = TryVec::with_capacity(count.to_usize())?;
    let mut corrupt = false;
    let mut valid_frames = total;
    for i in 0..count {
        if in_chunk >= spc {
            cur.frames_before_chunk += spc;
            cur.chunk += 1;
            in_chunk = 0;
            if let Some(next) = runs.get(cur.run + 1) {
                if cur.chunk >= next.first_chunk {
                    cur.run += 1;
                    spc = u64::from(next.samples_per_chunk);
                }
            }
            match offset_reader.next_chunk_offset(source)? {
                Some(base) => pos = base,
                None => {
                    warn!("track {}: chunk offsets end at frame {}", track.id, first + i);
                    corrupt = true;
                    valid_frames = first + i;
                    break;
                },
            }
        }
        offsets.push(pos)?;
        pos = pos.saturating_add(u64::from(sizes[i.to_usize()]));
        in_chunk += 1;
    }

    track.cursor = cur;
    Ok(SampleWindow { block, first_frame: first, offsets, sizes, dts, cts_offsets, corrupt, valid_frames })
}

/// The window holding `frame`, building it when playback left the current one.
pub(crate) fn window_for<'t, S: ByteSource + ?Sized>(
    source: &mut S,
    track: &'t mut Track,
    frame: u32,
    config: &DecodeConfig,
) -> Result<&'t SampleWindow> {
    let block = frame / config.frames_per_block();
    let current = matches!(&track.window, FramingState::Built(w) if w.block == block);
    if !current {
        track.window = FramingState::Empty;
        let window = build_block(source, track, block, config)?;
        track.window = FramingState::Built(window);
    }
    match &track.window {
        FramingState::Built(window) => Ok(window),
        FramingState::Empty => Err(Error::CorruptIndex("sample window missing")),
    }
}
