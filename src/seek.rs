// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mapping media time to frames and frames to keyframes.

use log::{debug, trace};

use crate::framing::{self, TableReader};
use crate::source::ByteSource;
use crate::track::{TableRef, Track};
use crate::{scale_time, DecodeConfig, Error, Mp4Demuxer, Result, ToUsize, TryVec};

/// Which way [`Mp4Demuxer::nearest_sync_frame`] looks for a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    Forward,
    Backward,
}

/// Outcome of a keyframe search. Every variant carries a usable frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSearch {
    Found(u32),
    /// No keyframe at or after the request; clamped to the last one.
    EndOfStream(u32),
    /// No keyframe at or before the request; clamped to the first one.
    BeginningOfStream(u32),
}

impl SyncSearch {
    pub fn frame(self) -> u32 {
        match self {
            Self::Found(f) | Self::EndOfStream(f) | Self::BeginningOfStream(f) => f,
        }
    }
}

/// Entries shared by consecutive windows when the cache slides backwards.
const BACKWARD_OVERLAP: u32 = 16;
const MIN_CACHE_LEN: u32 = 32;

/// A window of consecutive 'stss' entries.
#[derive(Debug, Default)]
pub(crate) struct SyncCache {
    start: u32,
    entries: TryVec<u32>,
}

impl SyncCache {
    fn end(&self) -> u32 {
        self.start + self.entries.len() as u32
    }

    fn load<S: ByteSource + ?Sized>(&mut self, source: &mut S, stss: TableRef, start: u32, len: u32) -> Result<()> {
        let count = len.min(stss.entries.saturating_sub(start));
        if count == 0 {
            return Err(Error::CorruptIndex("sync sample window out of range"));
        }
        trace!("loading sync entries {start}..{}", start + count);
        let mut entries = TryVec::with_capacity(count.to_usize())?;
        let mut reader = TableReader::new(stss.offset + 16 + 4 * u64::from(start), count, 4);
        while let Some(sample) = reader.next_u32(source)? {
            if sample == 0 {
                return Err(Error::CorruptIndex("sync sample number zero"));
            }
            if entries.last().is_some_and(|&prev| prev >= sample) {
                return Err(Error::CorruptIndex("stss not sorted"));
            }
            entries.push(sample)?;
        }
        self.start = start;
        self.entries = entries;
        Ok(())
    }
}

/// First frame whose decode time is at or after `media_time`, clamped to the last frame.
pub(crate) fn time_to_frame<S: ByteSource + ?Sized>(source: &mut S, track: &Track, media_time: u64) -> Result<u32> {
    let total = track.total_frames();
    if total == 0 {
        return Ok(0);
    }
    let last = u64::from(total - 1);
    let stts = track.tables.stts.ok_or(Error::CorruptIndex("missing stts"))?;
    let mut reader = TableReader::for_table(stts, 0, 8);

    let frame = if stts.entries == 1 {
        let (_, delta) = reader.next_pair(source)?.ok_or(Error::CorruptIndex("empty stts"))?;
        if delta == 0 { 0 } else { media_time.div_ceil(u64::from(delta)) }
    } else if track.edits.len() > 2 {
        let mut frame = 0u64;
        let mut time = 0u64;
        loop {
            let Some((count, delta)) = reader.next_pair(source)? else {
                break frame;
            };
            let (count, delta) = (u64::from(count), u64::from(delta));
            if count > 0 {
                let last_in_run = time.saturating_add((count - 1).saturating_mul(delta));
                if media_time <= time {
                    break frame;
                }
                if media_time <= last_in_run {
                    break frame + (media_time - time).div_ceil(delta);
                }
            }
            time = time.saturating_add(count.saturating_mul(delta));
            frame += count;
        }
    } else {
        let t = media_time.saturating_sub(track.initial_gap.unwrap_or(0));
        if track.duration == 0 {
            0
        } else {
            let estimate = u128::from(t) * u128::from(total) / u128::from(track.duration);
            u64::try_from(estimate).unwrap_or(u64::MAX)
        }
    };
    Ok(u32::try_from(frame.min(last))?)
}

/// Nearest keyframe to `from` in the given direction, sliding the track's
/// sync cache over 'stss' as needed.
pub(crate) fn nearest_sync_frame<S: ByteSource + ?Sized>(
    source: &mut S,
    track: &mut Track,
    from: u32,
    direction: SeekDirection,
    config: &DecodeConfig,
) -> Result<SyncSearch> {
    let total = track.total_frames();
    if total == 0 {
        return Err(Error::EndOfStream);
    }
    let stss = match track.tables.stss {
        Some(stss) if track.has_seek_table && stss.entries > 0 => stss,
        _ if from >= total => return Ok(SyncSearch::EndOfStream(total - 1)),
        _ => return Ok(SyncSearch::Found(from)),
    };
    let from = from.min(total - 1);
    let cache_len = config.sync_cache_len.max(MIN_CACHE_LEN);
    let target = from + 1;
    let cache = &mut track.sync_cache;

    if cache.entries.is_empty() {
        let guess = u64::from(target) * u64::from(stss.entries) / u64::from(total);
        let guess = u32::try_from(guess).unwrap_or(stss.entries);
        let start = guess.saturating_sub(cache_len / 2).min(stss.entries.saturating_sub(cache_len));
        cache.load(source, stss, start, cache_len)?;
    }

    // closest entries seen in windows that were slid past
    let mut below = None;
    let mut above = None;
    loop {
        let (Some(&first), Some(&last)) = (cache.entries.first(), cache.entries.last()) else {
            return Err(Error::CorruptIndex("empty sync window"));
        };
        if first > target && cache.start > 0 && below.is_none() {
            above = Some(first);
            let start = cache.start.saturating_sub(cache_len - BACKWARD_OVERLAP);
            cache.load(source, stss, start, cache_len)?;
            if cache.entries.last().is_some_and(|&l| l < first) {
                return Err(Error::CorruptIndex("stss not sorted"));
            }
        } else if last < target && cache.end() < stss.entries && above.is_none() {
            below = Some(last);
            let start = cache.end();
            cache.load(source, stss, start, cache_len)?;
            if cache.entries.first().is_some_and(|&f| f <= last) {
                return Err(Error::CorruptIndex("stss not sorted"));
            }
        } else {
            break;
        }
    }

    let clamp = |sample: u32| {
        let frame = sample - 1;
        if frame < total { SyncSearch::Found(frame) } else { SyncSearch::EndOfStream(total - 1) }
    };
    let entries = &cache.entries[..];
    let result = match direction {
        SeekDirection::Forward => match entries.iter().find(|&&e| e >= target).copied().or(above) {
            Some(sample) => clamp(sample),
            None => SyncSearch::EndOfStream(entries.last().map_or(0, |&e| (e - 1).min(total - 1))),
        },
        SeekDirection::Backward => match entries.iter().rev().find(|&&e| e <= target).copied().or(below) {
            Some(sample) => clamp(sample),
            None => SyncSearch::BeginningOfStream(entries.first().map_or(0, |&e| (e - 1).min(total - 1))),
        },
    };
    debug!("track {}: sync search from {from} {direction:?} -> {result:?}", track.id);
    Ok(result)
}

impl<S: ByteSource> Mp4Demuxer<S> {
    /// Frame of `track` at `media_time`, in the track's timescale.
    pub fn time_to_frame(&mut self, track: usize, media_time: u64) -> Result<u32> {
        let Mp4Demuxer { source, tracks, .. } = self;
        let track = tracks.get(track).ok_or(Error::InvalidArgument("no such track"))?;
        time_to_frame(source, track, media_time)
    }

    /// Nearest keyframe of `track` at or after (forward) or at or before
    /// (backward) `from`.
    pub fn nearest_sync_frame(&mut self, track: usize, from: u32, direction: SeekDirection) -> Result<SyncSearch> {
        let Mp4Demuxer { source, tracks, config, .. } = self;
        let track = tracks.get_mut(track).ok_or(Error::InvalidArgument("no such track"))?;
        nearest_sync_frame(source, track, from, direction, config)
    }

    /// Position every track at `position_us`. The primary track lands on a
    /// keyframe and the others follow its timestamp. Returns the position
    /// actually reached, in microseconds.
    pub fn seek(&mut self, position_us: u64) -> Result<u64> {
        let duration = self.duration_us();
        let backward = self.rate < 0;
        let Mp4Demuxer { source, tracks, config, .. } = self;

        if position_us == 0 {
            for track in tracks.iter_mut() {
                track.reposition(0);
            }
            return Ok(0);
        }
        if position_us >= duration {
            for track in tracks.iter_mut() {
                let total = track.total_frames();
                track.reposition(total);
            }
            return Ok(duration);
        }

        let primary = tracks.primary();
        let mut reached = position_us;
        if let Some(index) = primary {
            let track = tracks.get_mut(index).ok_or(Error::InvalidArgument("no such track"))?;
            let media_time = scale_time(position_us, 1_000_000, track.timescale);
            let frame = time_to_frame(source, track, media_time)?;
            let direction = if backward { SeekDirection::Backward } else { SeekDirection::Forward };
            let key = nearest_sync_frame(source, track, frame, direction, config)?.frame();
            let dts = framing::decode_time_of(source, track, key)?;
            track.reposition(key);
            reached = scale_time(dts, track.timescale, 1_000_000);
            debug!("seek {position_us}us: track {} keyframe {key} at {reached}us", track.id);
        }

        for (i, track) in tracks.iter_mut().enumerate() {
            if Some(i) == primary || track.total_frames() == 0 {
                continue;
            }
            let media_time = scale_time(reached, 1_000_000, track.timescale);
            let frame = time_to_frame(source, track, media_time)?;
            track.reposition(frame);
        }
        Ok(reached)
    }

    /// The keyframe with the largest sample among the cached sync prefix,
    /// a good guess for a representative picture.
    pub fn thumbnail_frame(&mut self, track: usize) -> Result<Option<u32>> {
        let Mp4Demuxer { source, tracks, .. } = self;
        let track = tracks.get(track).ok_or(Error::InvalidArgument("no such track"))?;
        let total = track.total_frames();
        if total == 0 {
            return Ok(None);
        }
        if !track.has_seek_table || track.sync_prefix.is_empty() {
            return Ok(Some(0));
        }
        let stsz = track.tables.stsz.ok_or(Error::CorruptIndex("missing stsz"))?;
        let mut best: Option<(u32, u32)> = None;
        for &sample in track.sync_prefix.iter() {
            let Some(frame) = sample.checked_sub(1).filter(|&f| f < total) else {
                continue;
            };
            let size = framing::sample_size_of(source, stsz, frame)?;
            if best.is_none_or(|(_, best_size)| size > best_size) {
                best = Some((frame, size));
            }
        }
        Ok(Some(best.map_or(0, |(frame, _)| frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::tests::TableFile;
    use crate::track::{EditEntry, SampleSizeTable};

    fn track(total: u32) -> Track {
        let mut track = Track::default();
        track.tables.stsz = Some(SampleSizeTable { offset: 0, sample_size: 1, sample_count: total });
        track.duration = u64::from(total) * 1024;
        track
    }

    #[test]
    fn single_run_maps_exactly() {
        let mut file = TableFile::default();
        let mut audio = track(1000);
        audio.timescale = 48000;
        audio.tables.stts = Some(file.stts(&[(1000, 1024)]));
        let mut source = file.source();
        assert_eq!(time_to_frame(&mut source, &audio, 102_400).unwrap(), 100);
        assert_eq!(time_to_frame(&mut source, &audio, 102_401).unwrap(), 101);
        assert_eq!(time_to_frame(&mut source, &audio, u64::MAX).unwrap(), 999);

        let mut previous = 0;
        for t in (0..2_000_000).step_by(7919) {
            let frame = time_to_frame(&mut source, &audio, t).unwrap();
            assert!(frame >= previous);
            previous = frame;
        }
    }

    #[test]
    fn edited_tracks_scan_runs() {
        let mut file = TableFile::default();
        let mut video = track(4);
        video.tables.stts = Some(file.stts(&[(2, 10), (2, 20)]));
        for _ in 0..3 {
            video
                .edits
                .push(EditEntry { segment_duration: 1, media_time: 0, media_rate_integer: 1, media_rate_fraction: 0 })
                .unwrap();
        }
        let mut source = file.source();
        // decode times are 0, 10, 20, 40
        assert_eq!(time_to_frame(&mut source, &video, 0).unwrap(), 0);
        assert_eq!(time_to_frame(&mut source, &video, 20).unwrap(), 2);
        assert_eq!(time_to_frame(&mut source, &video, 25).unwrap(), 3);
        assert_eq!(time_to_frame(&mut source, &video, 500).unwrap(), 3);
    }

    #[test]
    fn proportional_estimate_skips_initial_gap() {
        let mut file = TableFile::default();
        let mut video = track(100);
        video.duration = 1000;
        video.initial_gap = Some(200);
        video.tables.stts = Some(file.stts(&[(50, 10), (50, 10)]));
        let mut source = file.source();
        assert_eq!(time_to_frame(&mut source, &video, 100).unwrap(), 0);
        assert_eq!(time_to_frame(&mut source, &video, 700).unwrap(), 50);
    }

    fn keyframe_track(file: &mut TableFile, total: u32, every: u32) -> Track {
        let mut video = track(total);
        let samples: std::vec::Vec<u32> = (0..total).step_by(every as usize).map(|f| f + 1).collect();
        video.tables.stss = Some(file.stss(&samples));
        video.has_seek_table = true;
        video
    }

    #[test]
    fn sync_search_stays_in_bounds() {
        let config = DecodeConfig::default().with_sync_cache_len(32);
        let mut file = TableFile::default();
        let mut video = keyframe_track(&mut file, 3000, 30);
        let mut source = file.source();

        for x in [0, 1, 29, 30, 31, 999, 1000, 2955, 2970, 1500, 5, 2999] {
            let fwd = nearest_sync_frame(&mut source, &mut video, x, SeekDirection::Forward, &config).unwrap();
            let back = nearest_sync_frame(&mut source, &mut video, x, SeekDirection::Backward, &config).unwrap();
            let (fwd, back) = (fwd.frame(), back.frame());
            assert!(back <= x, "{back} > {x}");
            assert!(back % 30 == 0 && fwd % 30 == 0);
            if x <= 2970 {
                assert!(fwd >= x, "{fwd} < {x}");
                assert!(fwd - back <= 30);
            }
        }
        let fwd = nearest_sync_frame(&mut source, &mut video, 1000, SeekDirection::Forward, &config).unwrap();
        assert_eq!(fwd, SyncSearch::Found(1020));
        let back = nearest_sync_frame(&mut source, &mut video, 1000, SeekDirection::Backward, &config).unwrap();
        assert_eq!(back, SyncSearch::Found(990));
    }

    #[test]
    fn sync_search_clamps_at_the_ends() {
        let config = DecodeConfig::default();
        let mut file = TableFile::default();
        let mut video = track(100);
        video.tables.stss = Some(file.stss(&[11, 51]));
        video.has_seek_table = true;
        let mut source = file.source();
        let past = nearest_sync_frame(&mut source, &mut video, 80, SeekDirection::Forward, &config).unwrap();
        assert_eq!(past, SyncSearch::EndOfStream(50));
        let before = nearest_sync_frame(&mut source, &mut video, 3, SeekDirection::Backward, &config).unwrap();
        assert_eq!(before, SyncSearch::BeginningOfStream(10));
    }

    #[test]
    fn every_frame_is_a_keyframe_without_stss() {
        let config = DecodeConfig::default();
        let mut source = TableFile::default().source();
        let mut audio = track(10);
        let found = nearest_sync_frame(&mut source, &mut audio, 7, SeekDirection::Backward, &config).unwrap();
        assert_eq!(found, SyncSearch::Found(7));
        let clamped = nearest_sync_frame(&mut source, &mut audio, 70, SeekDirection::Forward, &config).unwrap();
        assert_eq!(clamped, SyncSearch::EndOfStream(9));
        let last = nearest_sync_frame(&mut source, &mut audio, 9, SeekDirection::Forward, &config).unwrap();
        assert_eq!(last, SyncSearch::Found(9));
    }

    #[test]
    fn unsorted_stss_is_corrupt() {
        let config = DecodeConfig::default();
        let mut file = TableFile::default();
        let mut video = track(100);
        video.tables.stss = Some(file.stss(&[1, 40, 20]));
        video.has_seek_table = true;
        let mut source = file.source();
        let result = nearest_sync_frame(&mut source, &mut video, 30, SeekDirection::Forward, &config);
        assert!(matches!(result, Err(Error::CorruptIndex(_))));
    }
}
