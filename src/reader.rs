// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading access units and moving through a track.

use log::{debug, trace, warn};

use crate::framing::{self, FramingState};
use crate::source::{read_exact_at, seek_to, Availability, ByteSource};
use crate::track::{SampleDescription, Track};
use crate::{Error, Mp4Demuxer, Result, ToUsize, TryVec};

/// One compressed frame with its timing.
#[derive(Debug)]
pub struct AccessUnit {
    pub data: TryVec<u8>,
    /// Absolute file offset the bytes came from.
    pub offset: u64,
    /// Decode time in the track's timescale.
    pub dts: u64,
    /// Presentation time minus decode time.
    pub cts_offset: i64,
    /// Media time to add when the edit list starts with an empty edit.
    pub edit_offset: Option<u64>,
    pub frame: u32,
}

/// How the frame counter moved since the previous access unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Play,
    FastForward,
    Rewind,
}

fn step(track: &mut Track, backward: bool) {
    if backward {
        match track.counter.checked_sub(1) {
            Some(frame) => track.counter = frame,
            None => track.at_beginning = true,
        }
    } else {
        track.counter = track.counter.saturating_add(1);
    }
}

impl<S: ByteSource> Mp4Demuxer<S> {
    /// Set the play rate in thousandths of normal speed. Negative rates make
    /// [`Self::get_access_unit`] walk backwards.
    pub fn set_rate(&mut self, rate: i32) {
        self.rate = rate;
    }

    pub fn rate(&self) -> i32 {
        self.rate
    }

    /// Move the frame counter of `track`. `frame` may equal the frame count,
    /// which positions the track at its end.
    pub fn set_frame(&mut self, track: usize, frame: u32) -> Result<()> {
        let track = self.track_mut(track)?;
        if frame > track.total_frames() {
            return Err(Error::InvalidArgument("frame past the end of the track"));
        }
        track.reposition(frame);
        Ok(())
    }

    pub fn current_frame(&self, track: usize) -> Result<u32> {
        Ok(self.track_ref(track)?.counter)
    }

    pub fn total_frames(&self, track: usize) -> Result<u32> {
        Ok(self.track_ref(track)?.total_frames())
    }

    pub fn playback_state(&self, track: usize) -> Result<PlaybackState> {
        Ok(self.track_ref(track)?.play_state)
    }

    /// The sample description that applies to `frame`.
    pub fn description_for_frame(&mut self, track: usize, frame: u32) -> Result<&SampleDescription> {
        let index = {
            let Mp4Demuxer { source, tracks, .. } = self;
            let t = tracks.get_mut(track).ok_or(Error::InvalidArgument("no such track"))?;
            if frame >= t.total_frames() {
                return Err(Error::EndOfStream);
            }
            framing::description_index_for_frame(source, t, frame)?
        };
        let t = self.track_ref(track)?;
        index
            .checked_sub(1)
            .and_then(|i| t.descriptions.get(i.to_usize()))
            .ok_or(Error::CorruptIndex("sample description index out of range"))
    }

    /// Decoder configuration in effect for `frame`, for tracks whose
    /// configuration changes part way through.
    pub fn decoder_config_for_frame(&mut self, track: usize, frame: u32) -> Result<&[u8]> {
        Ok(&self.description_for_frame(track, frame)?.decoder_config)
    }

    /// Read the access unit at the track's frame counter. With `advance`
    /// the counter then moves one frame in the play direction.
    pub fn get_access_unit(&mut self, track: usize, advance: bool) -> Result<AccessUnit> {
        let backward = self.rate < 0;
        let Mp4Demuxer { source, tracks, config, decryptor, .. } = self;
        let track = tracks.get_mut(track).ok_or(Error::InvalidArgument("no such track"))?;
        if track.at_beginning {
            return Err(Error::BeginningOfStream);
        }
        let total = track.total_frames();

        loop {
            let frame = track.counter;
            if frame >= total {
                return Err(Error::EndOfStream);
            }
            if let FramingState::Built(window) = &track.window {
                if window.corrupt && frame >= window.valid_frames {
                    return Err(Error::EndOfStream);
                }
            }

            track.play_state = match track.last_frame {
                Some(last) if frame > last.saturating_add(1) => PlaybackState::FastForward,
                Some(last) if frame < last => PlaybackState::Rewind,
                _ => PlaybackState::Play,
            };

            let window = framing::window_for(source, track, frame, config)?;
            let Some(i) = window.index_of(frame) else {
                return Err(Error::EndOfStream);
            };
            let (offset, size) = (window.offsets[i], window.sizes[i]);
            let (dts, cts_offset) = (window.dts[i], window.cts_offsets[i]);

            let oversized = config.max_access_unit_size.is_some_and(|max| size > max);
            let outside = offset.checked_add(u64::from(size)).is_none_or(|end| end > source.size());
            if oversized || outside {
                track.skip_count += 1;
                warn!("track {}: skipping frame {frame} ({size} bytes at {offset})", track.id);
                if track.skip_count > config.max_consecutive_skips {
                    track.counter = total;
                    return Err(Error::EndOfStream);
                }
                step(track, backward);
                if track.at_beginning {
                    return Err(Error::BeginningOfStream);
                }
                continue;
            }
            track.skip_count = 0;

            if source.is_streaming() {
                seek_to(source, offset)?;
                if source.check_available(u64::from(size)) == Availability::NotReady {
                    return Err(Error::NotReady);
                }
            }
            let mut data = std::vec::Vec::new();
            data.try_reserve_exact(size.to_usize()).map_err(|_| Error::OutOfMemory)?;
            data.resize(size.to_usize(), 0);
            read_exact_at(source, offset, &mut data)?;

            if track.protected {
                match decryptor.as_mut() {
                    Some(decryptor) => decryptor.decrypt(&mut data).map_err(Error::DrmFailure)?,
                    None => debug!("track {}: protected frame {frame} passed through", track.id),
                }
            }

            trace!("track {}: frame {frame}, {size} bytes at {offset}, dts {dts}", track.id);
            track.last_frame = Some(frame);
            if advance {
                step(track, backward);
            }
            return Ok(AccessUnit {
                data: data.into(),
                offset,
                dts,
                cts_offset,
                edit_offset: track.initial_gap,
                frame,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::tests::TableFile;
    use crate::metadata::MediaMetadata;
    use crate::source::StreamSource;
    use crate::track::{MediaType, MovieHeader, TrackRegistry};
    use crate::DecodeConfig;
    use std::io::Cursor;

    type TestDemuxer = Mp4Demuxer<StreamSource<Cursor<std::vec::Vec<u8>>>>;

    /// One frame per chunk, 100 ticks apart.
    fn demuxer_with(frames: &[&[u8]], declared: &[u32], config: DecodeConfig) -> TestDemuxer {
        let mut file = TableFile::default();
        let n = frames.len() as u32;
        let mut track = Track { id: 1, media_type: MediaType::Video, timescale: 1000, ..Track::default() };
        track.tables.stts = Some(file.stts(&[(n, 100)]));
        track.tables.stsc = Some(file.stsc(&[(1, 1, 1)]));
        track.tables.stsz = Some(file.stsz(0, declared, n));
        let mut at = (file.data.len() + 16 + 4 * frames.len()) as u32;
        let offsets: std::vec::Vec<u32> = frames
            .iter()
            .map(|f| {
                let o = at;
                at += f.len() as u32;
                o
            })
            .collect();
        track.tables.chunk_offsets = Some(file.stco(&offsets));
        for f in frames {
            file.data.extend_from_slice(f);
        }

        let mut tracks = TrackRegistry::default();
        tracks.push(track, &config).unwrap();
        Mp4Demuxer {
            source: file.source(),
            config,
            file_type: None,
            media_data: None,
            movie: MovieHeader { timescale: 1000, duration: u64::from(n) * 100, next_track_id: 2 },
            tracks,
            metadata: MediaMetadata::default(),
            redirect_urls: TryVec::new(),
            decryptor: None,
            rate: 1000,
        }
    }

    fn demuxer(frames: &[&[u8]]) -> TestDemuxer {
        let sizes: std::vec::Vec<u32> = frames.iter().map(|f| f.len() as u32).collect();
        demuxer_with(frames, &sizes, DecodeConfig::default())
    }

    #[test]
    fn reads_frames_in_order() {
        let mut d = demuxer(&[b"one", b"three", b"xy"]);
        let first = d.get_access_unit(0, true).unwrap();
        assert_eq!(&first.data[..], b"one");
        assert_eq!((first.frame, first.dts, first.cts_offset), (0, 0, 0));
        let second = d.get_access_unit(0, true).unwrap();
        assert_eq!(&second.data[..], b"three");
        assert_eq!(second.dts, 100);
        assert_eq!(second.offset, first.offset + 3);
        assert_eq!(&d.get_access_unit(0, true).unwrap().data[..], b"xy");
        assert!(matches!(d.get_access_unit(0, true), Err(Error::EndOfStream)));
        assert_eq!(d.current_frame(0).unwrap(), 3);
    }

    #[test]
    fn reading_without_advancing_repeats() {
        let mut d = demuxer(&[b"aa", b"bbb"]);
        d.set_frame(0, 1).unwrap();
        let a = d.get_access_unit(0, false).unwrap();
        let b = d.get_access_unit(0, false).unwrap();
        assert_eq!((a.offset, a.data.len()), (b.offset, b.data.len()));
        assert_eq!(d.current_frame(0).unwrap(), 1);
    }

    #[test]
    fn frame_count_is_end_of_stream() {
        let mut d = demuxer(&[b"aa", b"bbb"]);
        d.set_frame(0, 2).unwrap();
        assert!(matches!(d.get_access_unit(0, false), Err(Error::EndOfStream)));
        assert!(matches!(d.set_frame(0, 3), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn negative_rate_walks_back_to_the_beginning() {
        let mut d = demuxer(&[b"a", b"b", b"c"]);
        d.set_rate(-1000);
        d.set_frame(0, 2).unwrap();
        assert_eq!(&d.get_access_unit(0, true).unwrap().data[..], b"c");
        assert_eq!(&d.get_access_unit(0, true).unwrap().data[..], b"b");
        assert_eq!(d.playback_state(0).unwrap(), PlaybackState::Rewind);
        assert_eq!(&d.get_access_unit(0, true).unwrap().data[..], b"a");
        assert!(matches!(d.get_access_unit(0, true), Err(Error::BeginningOfStream)));
        d.set_frame(0, 0).unwrap();
        assert!(d.get_access_unit(0, false).is_ok());
    }

    #[test]
    fn jumping_ahead_is_fast_forward() {
        let mut d = demuxer(&[b"a", b"b", b"c", b"d"]);
        d.get_access_unit(0, true).unwrap();
        assert_eq!(d.playback_state(0).unwrap(), PlaybackState::Play);
        d.set_frame(0, 3).unwrap();
        d.get_access_unit(0, true).unwrap();
        assert_eq!(d.playback_state(0).unwrap(), PlaybackState::FastForward);
    }

    #[test]
    fn oversized_frames_are_stepped_over() {
        let config = DecodeConfig::default().with_max_access_unit_size(4);
        let mut d = demuxer_with(&[b"ok", b"much too big", b"fine"], &[2, 12, 4], config);
        assert_eq!(&d.get_access_unit(0, true).unwrap().data[..], b"ok");
        let unit = d.get_access_unit(0, true).unwrap();
        assert_eq!(unit.frame, 2);
        assert_eq!(&unit.data[..], b"fine");
    }

    #[test]
    fn too_many_skips_end_the_track() {
        let config = DecodeConfig::default().with_max_consecutive_skips(2);
        // sizes claim more bytes than the file holds
        let mut d = demuxer_with(&[b"a", b"b", b"c", b"d"], &[1000, 1000, 1000, 1], config);
        assert!(matches!(d.get_access_unit(0, true), Err(Error::EndOfStream)));
        assert_eq!(d.current_frame(0).unwrap(), 4);
    }

    #[test]
    fn protected_frames_go_through_the_decryptor() {
        let mut d = demuxer(&[b"abc", b"fail"]);
        d.tracks.get_mut(0).unwrap().protected = true;
        d.set_decryptor(|data: &mut [u8]| {
            if data == b"fail" {
                return Err(std::io::Error::other("no key"));
            }
            data.iter_mut().for_each(|b| *b = b.to_ascii_uppercase());
            Ok(())
        });
        assert_eq!(&d.get_access_unit(0, true).unwrap().data[..], b"ABC");
        assert!(matches!(d.get_access_unit(0, true), Err(Error::DrmFailure(_))));
    }

    #[test]
    fn description_follows_chunk_runs() {
        let mut d = demuxer(&[b"a", b"b"]);
        assert!(matches!(d.description_for_frame(0, 0), Err(Error::CorruptIndex(_))));
        assert!(matches!(d.description_for_frame(0, 2), Err(Error::EndOfStream)));
    }
}
