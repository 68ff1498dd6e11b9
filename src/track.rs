// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `moov` tree: movie header, tracks, sample descriptions and the
//! locations of each track's sample tables.

use std::io::{Cursor, Read};

use log::{debug, warn};

use crate::boxes::{BoxType, FourCC};
use crate::descriptor::{
    parse_avc_config, read_esds, AacConfig, AvcConfig, EsDescriptor, OBJECT_MPEG4_VISUAL, STREAM_TYPE_VISUAL,
};
use crate::framing::{ChunkCursor, ChunkRun, FramingState, RunCursor};
use crate::metadata::{self, MediaMetadata};
use crate::reader::PlaybackState;
use crate::seek::SyncCache;
use crate::source::{read_exact_at, seek_to, ByteSource, SourceReader};
use crate::{
    be_i16, be_i32, be_i64, be_u16, be_u32, be_u64, read_box_header, read_fullbox_extra, read_fullbox_version_no_flags,
    recover_optional, scale_time, skip, skip_box_content, skip_box_remain, walk_children, BMFFBox, BoxIter, DecodeConfig,
    Error, Offset, Result, ToU64, ToUsize, TryString, TryVec,
};

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;

/// Largest sample entry body kept as a raw decoder configuration blob.
const MAX_SAMPLE_ENTRY_SIZE: u64 = 1024 * 1024;
/// Largest protection scheme box kept for the DRM engine.
const MAX_SINF_SIZE: u64 = 64 * 1024;

/// Track classification from the handler reference box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaType {
    Audio,
    Video,
    /// Streaming hint track (`strm` or `hint` handler).
    Stream,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecType {
    #[default]
    Unknown,
    Aac,
    /// AAC with spectral band replication (HE-AAC).
    AacSbr,
    Bsac,
    AmrNb,
    AmrWb,
    Qcelp,
    Evrc,
    Mpeg4Video,
    Avc,
    H263,
    MjpegA,
    MjpegB,
}

/// Movie header box 'mvhd'.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MovieHeader {
    pub timescale: u32,
    pub duration: u64,
    pub next_track_id: u32,
}

/// Location of a sample table: where its box starts and how many entries it declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableRef {
    /// Absolute offset of the box header.
    pub offset: u64,
    pub entries: u32,
}

/// Sample size box 'stsz'. Entries are only present when `sample_size` is 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleSizeTable {
    pub offset: u64,
    pub sample_size: u32,
    pub sample_count: u32,
}

/// Chunk offset box, 'stco' or 'co64'.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOffsetTable {
    pub offset: u64,
    pub entries: u32,
    /// 64-bit offsets ('co64').
    pub large: bool,
}

impl ChunkOffsetTable {
    pub(crate) fn entry_len(&self) -> usize {
        if self.large { 8 } else { 4 }
    }
}

/// Where each sample table of a track lives. Nothing but the location is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleTables {
    pub stts: Option<TableRef>,
    pub ctts: Option<TableRef>,
    pub ctts_version: u8,
    pub stsc: Option<TableRef>,
    pub stsz: Option<SampleSizeTable>,
    pub chunk_offsets: Option<ChunkOffsetTable>,
    pub stss: Option<TableRef>,
}

/// Edit list entry.
/// See ISO 14496-12:2015 § 8.6.6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditEntry {
    /// In movie timescale units.
    pub segment_duration: u64,
    /// In media timescale units; -1 is an empty edit.
    pub media_time: i64,
    pub media_rate_integer: i16,
    pub media_rate_fraction: i16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioParams {
    pub channel_count: u16,
    pub sample_size: u16,
    /// Integer part of the 16.16 sample rate.
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoParams {
    pub width: u16,
    pub height: u16,
    /// Contents of a 'fiel' box: field count and ordering.
    pub field_handling: Option<u16>,
    /// Contents of a 'gama' box, 16.16.
    pub gamma: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEntryParams {
    Audio(AudioParams),
    Video(VideoParams),
    Other,
}

/// Protection scheme information of an 'enca' or 'encv' entry.
#[derive(Debug, PartialEq)]
pub struct ProtectionInfo {
    /// Format of the content before encryption, from 'frma'.
    pub original_format: Option<FourCC>,
    /// The whole 'sinf' payload, for the DRM engine.
    pub sinf: TryVec<u8>,
}

/// One entry of the sample description box.
#[derive(Debug)]
pub struct SampleDescription {
    /// Sample entry type as stored, e.g. `mp4a` or `encv`.
    pub format: FourCC,
    pub codec: CodecType,
    pub data_reference_index: u16,
    pub params: SampleEntryParams,
    /// Decoder specific info handed to the decoder: the esds payload,
    /// the avcC record, or the raw entry body for codecs without one.
    pub decoder_config: TryVec<u8>,
    pub esds: Option<EsDescriptor>,
    pub avc: Option<AvcConfig>,
    pub aac: Option<AacConfig>,
    /// (buffer size, max bitrate, avg bitrate) from 'btrt'.
    pub bitrate: Option<(u32, u32, u32)>,
    pub protection: Option<ProtectionInfo>,
}

impl SampleDescription {
    fn new(format: FourCC, params: SampleEntryParams) -> Self {
        Self {
            format,
            codec: CodecType::Unknown,
            data_reference_index: 0,
            params,
            decoder_config: TryVec::new(),
            esds: None,
            avc: None,
            aac: None,
            bitrate: None,
            protection: None,
        }
    }
}

/// A parsed 'trak' plus its playback state.
#[derive(Debug, Default)]
pub struct Track {
    pub id: u32,
    pub media_type: MediaType,
    /// Codec of the first sample description.
    pub codec: CodecType,
    pub timescale: u32,
    pub duration: u64,
    pub width: u32,
    pub height: u32,
    pub avg_bitrate: u32,
    pub max_bitrate: u32,
    pub buffer_size: u32,
    pub descriptions: TryVec<SampleDescription>,
    pub edits: TryVec<EditEntry>,
    /// Media time of the first sample when the edit list starts with an empty edit.
    pub initial_gap: Option<u64>,
    pub tables: SampleTables,
    /// Leading sync sample numbers (1-based), read at open.
    pub sync_prefix: TryVec<u32>,
    /// False when there is no 'stss' or it is empty: every sample is a sync sample.
    pub has_seek_table: bool,
    pub protected: bool,
    /// URL from a data reference, or the single sample of a streaming hint track.
    pub embedded_url: Option<TryString>,

    pub(crate) handler_seen: bool,
    pub(crate) tkhd_hint: MediaType,
    /// (offset, size) of an 'stbl' met before 'hdlr'.
    pub(crate) pending_stbl: Option<(u64, u64)>,
    pub(crate) chunk_runs: Option<TryVec<ChunkRun>>,
    pub(crate) window: FramingState,
    pub(crate) cursor: ChunkCursor,
    pub(crate) stts_cursor: RunCursor,
    pub(crate) ctts_cursor: RunCursor,
    pub(crate) sync_cache: SyncCache,
    pub(crate) counter: u32,
    pub(crate) last_frame: Option<u32>,
    pub(crate) skip_count: u32,
    pub(crate) play_state: PlaybackState,
    pub(crate) at_beginning: bool,
}

impl Track {
    /// Number of samples, which is also the end-of-stream frame counter value.
    pub fn total_frames(&self) -> u32 {
        self.tables.stsz.map_or(0, |stsz| stsz.sample_count)
    }

    pub(crate) fn is_demuxable(&self) -> bool {
        matches!(self.media_type, MediaType::Audio | MediaType::Video | MediaType::Stream)
    }

    /// Forget the playback position and move the frame counter.
    pub(crate) fn reposition(&mut self, frame: u32) {
        self.counter = frame;
        self.skip_count = 0;
        self.at_beginning = false;
    }
}

/// The tracks of one movie, in file order.
#[derive(Debug, Default)]
pub(crate) struct TrackRegistry {
    tracks: TryVec<Track>,
}

impl TrackRegistry {
    /// Add a track. Audio and video tracks count toward `max_tracks`.
    pub(crate) fn push(&mut self, track: Track, config: &DecodeConfig) -> Result<()> {
        if matches!(track.media_type, MediaType::Audio | MediaType::Video) {
            let av = self
                .tracks
                .iter()
                .filter(|t| matches!(t.media_type, MediaType::Audio | MediaType::Video))
                .count();
            if let Some(max) = config.max_tracks {
                if av >= max.to_usize() {
                    return Err(Error::ResourceLimitExceeded("too many audio and video tracks"));
                }
            }
        }
        self.tracks.push(track)?;
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.tracks.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Track> {
        self.tracks.get_mut(index)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.iter_mut()
    }

    pub(crate) fn as_slice(&self) -> &[Track] {
        &self.tracks
    }

    /// The first video track with samples, else the first track with samples.
    pub(crate) fn primary(&self) -> Option<usize> {
        self.tracks
            .iter()
            .position(|t| t.media_type == MediaType::Video && t.total_frames() > 0)
            .or_else(|| self.tracks.iter().position(|t| t.total_frames() > 0))
    }
}

/// Everything parsed out of 'moov'.
pub(crate) struct MovieBox {
    pub header: MovieHeader,
    pub tracks: TrackRegistry,
    pub metadata: MediaMetadata,
    pub redirect_urls: TryVec<TryString>,
}

/// Parse a moov box.
/// See ISO 14496-12:2015 § 8.2.1
pub(crate) fn read_moov<T: Read + Offset>(src: &mut BMFFBox<'_, T>, config: &DecodeConfig) -> Result<MovieBox> {
    let mut header = None;
    let mut tracks = TrackRegistry::default();
    let mut metadata = MediaMetadata::default();
    let mut redirect_urls = TryVec::new();

    walk_children(src, |b| {
        let name = b.head.name;
        match name {
            BoxType::MovieHeaderBox => header = Some(read_mvhd(b, config)?),
            BoxType::TrackBox => {
                if let Some(track) = recover_optional(name, read_trak(b, config))? {
                    tracks.push(track, config)?;
                }
            },
            BoxType::UserDataBox => metadata::read_udta(b, &mut metadata, config.max_metadata_len)?,
            BoxType::MetadataBox => metadata::read_meta(b, &mut metadata, config.max_metadata_len, true)?,
            BoxType::ReferenceMovieBox => {
                recover_optional(name, read_rmra(b, &mut redirect_urls, config))?;
            },
            _ => skip_box_content(b)?,
        }
        Ok(())
    })?;

    let header = match header {
        Some(header) => header,
        // a reference movie only redirects elsewhere
        None if !redirect_urls.is_empty() => MovieHeader::default(),
        None => return Err(Error::InvalidData("moov without mvhd")),
    };

    for track in tracks.iter_mut() {
        track.initial_gap = match track.edits.first() {
            Some(edit) if edit.media_time == -1 => {
                Some(scale_time(edit.segment_duration, header.timescale, track.timescale))
            },
            _ => None,
        };
    }

    Ok(MovieBox { header, tracks, metadata, redirect_urls })
}

/// Parse an mvhd box.
fn read_mvhd<T: Read>(src: &mut BMFFBox<'_, T>, config: &DecodeConfig) -> Result<MovieHeader> {
    let (version, _) = read_fullbox_extra(src)?;
    let (timescale, duration) = match version {
        1 => {
            skip(src, 16)?; // creation and modification times
            (be_u32(src)?, be_u64(src)?)
        },
        0 => {
            skip(src, 8)?;
            (be_u32(src)?, u64::from(be_u32(src)?))
        },
        _ => return Err(Error::Unsupported("unhandled mvhd version")),
    };
    // rate, volume, reserved, matrix, pre_defined
    skip(src, 4 + 2 + 10 + 36 + 24)?;
    let next_track_id = be_u32(src)?;

    if timescale == 0 || duration == 0 {
        if !config.lenient {
            return Err(Error::InvalidData("mvhd timescale or duration is zero"));
        }
        warn!("mvhd timescale {timescale} duration {duration}");
    }
    Ok(MovieHeader { timescale, duration, next_track_id })
}

fn read_trak<T: Read + Offset>(src: &mut BMFFBox<'_, T>, config: &DecodeConfig) -> Result<Track> {
    let mut track = Track::default();
    walk_children(src, |b| {
        let name = b.head.name;
        match name {
            BoxType::TrackHeaderBox => read_tkhd(b, &mut track)?,
            BoxType::EditBox => {
                if let Some(edits) = recover_optional(name, read_edts(b, config))? {
                    track.edits = edits;
                }
            },
            BoxType::MediaBox => read_mdia(b, &mut track, config)?,
            _ => skip_box_content(b)?,
        }
        Ok(())
    })?;
    if !track.handler_seen {
        debug!("track {} has no hdlr, classified as {:?} from tkhd", track.id, track.tkhd_hint);
        track.media_type = track.tkhd_hint;
    }
    Ok(track)
}

/// Parse a tkhd box. The width, height and volume only hint at the media
/// type when no handler reference names it.
/// See ISO 14496-12:2015 § 8.3.2
fn read_tkhd<T: Read>(src: &mut BMFFBox<'_, T>, track: &mut Track) -> Result<()> {
    let (version, _) = read_fullbox_extra(src)?;
    match version {
        1 => {
            skip(src, 16)?;
            track.id = be_u32(src)?;
            skip(src, 4)?;
            track.duration = be_u64(src)?;
        },
        0 => {
            skip(src, 8)?;
            track.id = be_u32(src)?;
            skip(src, 4)?;
            track.duration = u64::from(be_u32(src)?);
        },
        _ => return Err(Error::Unsupported("unhandled tkhd version")),
    }
    // reserved, layer, alternate group
    skip(src, 8 + 2 + 2)?;
    let volume = be_u32(src)?;
    skip(src, 36)?; // matrix
    let width = be_u32(src)?;
    let height = be_u32(src)?;

    track.width = width >> 16;
    track.height = height >> 16;
    track.tkhd_hint = if volume == 0x0100_0000 {
        MediaType::Audio
    } else if width == 0x0140_0000 || height == 0x00f0_0000 {
        MediaType::Video
    } else {
        MediaType::Other
    };
    Ok(())
}

fn read_edts<T: Read>(src: &mut BMFFBox<'_, T>, config: &DecodeConfig) -> Result<TryVec<EditEntry>> {
    let mut edits = None;
    walk_children(src, |b| {
        if b.head.name == BoxType::EditListBox {
            edits = Some(read_elst(b, config)?);
        }
        Ok(())
    })?;
    Ok(edits.unwrap_or_default())
}

/// Parse an elst box.
/// See ISO 14496-12:2015 § 8.6.6
fn read_elst<T: Read>(src: &mut BMFFBox<'_, T>, config: &DecodeConfig) -> Result<TryVec<EditEntry>> {
    let version = read_fullbox_version_no_flags(src, &config.parse_options())?;
    let count = be_u32(src)?;
    if config.max_edit_entries.is_some_and(|max| count > max) {
        return Err(Error::ResourceLimitExceeded("too many edit list entries"));
    }
    let entry_len: u64 = if version == 1 { 20 } else { 12 };
    if u64::from(count) * entry_len > src.bytes_left() {
        return Err(Error::InvalidData("elst entries exceed the box"));
    }
    let mut edits = TryVec::with_capacity(count.to_usize())?;
    for _ in 0..count {
        let (segment_duration, media_time) = match version {
            1 => (be_u64(src)?, be_i64(src)?),
            0 => (u64::from(be_u32(src)?), i64::from(be_i32(src)?)),
            _ => return Err(Error::Unsupported("unhandled elst version")),
        };
        let media_rate_integer = be_i16(src)?;
        let media_rate_fraction = be_i16(src)?;
        edits.push(EditEntry { segment_duration, media_time, media_rate_integer, media_rate_fraction })?;
    }
    Ok(edits)
}

fn read_mdia<T: Read + Offset>(src: &mut BMFFBox<'_, T>, track: &mut Track, config: &DecodeConfig) -> Result<()> {
    walk_children(src, |b| {
        match b.head.name {
            BoxType::MediaHeaderBox => read_mdhd(b, track)?,
            BoxType::HandlerBox => read_hdlr(b, track)?,
            BoxType::MediaInformationBox => read_minf(b, track, config)?,
            _ => skip_box_content(b)?,
        }
        Ok(())
    })?;
    Ok(())
}

/// See ISO 14496-12:2015 § 8.4.2
fn read_mdhd<T: Read>(src: &mut BMFFBox<'_, T>, track: &mut Track) -> Result<()> {
    let (version, _) = read_fullbox_extra(src)?;
    let (timescale, duration) = match version {
        1 => {
            skip(src, 16)?;
            (be_u32(src)?, be_u64(src)?)
        },
        0 => {
            skip(src, 8)?;
            (be_u32(src)?, u64::from(be_u32(src)?))
        },
        _ => return Err(Error::Unsupported("unhandled mdhd version")),
    };
    track.timescale = timescale;
    track.duration = duration;
    Ok(())
}

/// See ISO 14496-12:2015 § 8.4.3
fn read_hdlr<T: Read>(src: &mut BMFFBox<'_, T>, track: &mut Track) -> Result<()> {
    skip(src, 8)?; // version, flags and pre_defined
    let handler_type = FourCC::from(be_u32(src)?);
    track.media_type = match &handler_type.value {
        b"soun" => MediaType::Audio,
        b"vide" => MediaType::Video,
        b"strm" | b"hint" => MediaType::Stream,
        _ => MediaType::Other,
    };
    track.handler_seen = true;
    Ok(())
}

fn read_minf<T: Read + Offset>(src: &mut BMFFBox<'_, T>, track: &mut Track, config: &DecodeConfig) -> Result<()> {
    walk_children(src, |b| {
        let name = b.head.name;
        match name {
            BoxType::SampleTableBox if !track.handler_seen => {
                track.pending_stbl = Some((b.start_offset(), b.head.size));
                skip_box_content(b)?;
            },
            BoxType::SampleTableBox if track.is_demuxable() => read_stbl(b, track, config)?,
            BoxType::DataInformationBox => {
                recover_optional(name, read_dinf(b, track, config))?;
            },
            _ => skip_box_content(b)?,
        }
        Ok(())
    })?;
    Ok(())
}

/// Read the (version, entry count) prefix shared by the sample tables.
fn read_table_ref<T: Read>(src: &mut BMFFBox<'_, T>, offset: u64, entry_len: u64) -> Result<(u8, TableRef)> {
    let (version, _) = read_fullbox_extra(src)?;
    let entries = be_u32(src)?;
    if u64::from(entries) * entry_len > src.bytes_left() {
        return Err(Error::InvalidData("sample table entries exceed the box"));
    }
    Ok((version, TableRef { offset, entries }))
}

fn require_version_zero(version: u8) -> Result<()> {
    if version != 0 {
        return Err(Error::Unsupported("unhandled sample table version"));
    }
    Ok(())
}

/// Parse an stbl box, recording where each table lives.
/// See ISO 14496-12:2015 § 8.5.1
pub(crate) fn read_stbl<T: Read + Offset>(src: &mut BMFFBox<'_, T>, track: &mut Track, config: &DecodeConfig) -> Result<()> {
    walk_children(src, |b| {
        let start = b.start_offset();
        match b.head.name {
            BoxType::SampleDescriptionBox => read_stsd(b, track, config)?,
            BoxType::TimeToSampleBox => {
                let (version, table) = read_table_ref(b, start, 8)?;
                require_version_zero(version)?;
                track.tables.stts = Some(table);
            },
            BoxType::CompositionOffsetBox => {
                let (version, table) = read_table_ref(b, start, 8)?;
                if version > 1 {
                    return Err(Error::Unsupported("unhandled ctts version"));
                }
                track.tables.ctts = Some(table);
                track.tables.ctts_version = version;
            },
            BoxType::SampleToChunkBox => {
                let (version, table) = read_table_ref(b, start, 12)?;
                require_version_zero(version)?;
                track.tables.stsc = Some(table);
            },
            BoxType::SampleSizeBox => {
                let (version, _) = read_fullbox_extra(b)?;
                require_version_zero(version)?;
                let sample_size = be_u32(b)?;
                let sample_count = be_u32(b)?;
                if sample_size == 0 && u64::from(sample_count) * 4 > b.bytes_left() {
                    return Err(Error::InvalidData("stsz entries exceed the box"));
                }
                track.tables.stsz = Some(SampleSizeTable { offset: start, sample_size, sample_count });
            },
            BoxType::ChunkOffsetBox | BoxType::ChunkLargeOffsetBox => {
                let large = b.head.name == BoxType::ChunkLargeOffsetBox;
                let (version, table) = read_table_ref(b, start, if large { 8 } else { 4 })?;
                require_version_zero(version)?;
                track.tables.chunk_offsets = Some(ChunkOffsetTable { offset: table.offset, entries: table.entries, large });
            },
            BoxType::SyncSampleBox => read_stss(b, start, track, config)?,
            _ => skip_box_content(b)?,
        }
        Ok(())
    })?;
    Ok(())
}

/// Record an stss box and read the leading entries for thumbnail selection.
fn read_stss<T: Read>(src: &mut BMFFBox<'_, T>, start: u64, track: &mut Track, config: &DecodeConfig) -> Result<()> {
    let (version, table) = read_table_ref(src, start, 4)?;
    require_version_zero(version)?;
    if table.entries == 0 {
        warn!("empty stss in track {}, treating every sample as a sync sample", track.id);
        track.has_seek_table = false;
        track.tables.stss = None;
        return Ok(());
    }
    let prefix = table.entries.min(config.sync_prefix_len);
    let mut sync_prefix = TryVec::with_capacity(prefix.to_usize())?;
    for _ in 0..prefix {
        sync_prefix.push(be_u32(src)?)?;
    }
    track.sync_prefix = sync_prefix;
    track.tables.stss = Some(table);
    track.has_seek_table = true;
    Ok(())
}

/// Parse an stsd box.
/// See ISO 14496-12:2015 § 8.5.2
fn read_stsd<T: Read>(src: &mut BMFFBox<'_, T>, track: &mut Track, config: &DecodeConfig) -> Result<()> {
    let version = read_fullbox_version_no_flags(src, &config.parse_options())?;
    if version != 0 {
        return Err(Error::Unsupported("unhandled stsd version"));
    }
    let count = be_u32(src)?;
    let kept = count.min(config.max_sample_descriptions);
    if kept < count {
        warn!("track {} declares {count} sample descriptions, keeping {kept}", track.id);
    }

    let media_type = track.media_type;
    let mut descriptions = TryVec::with_capacity(kept.to_usize())?;
    let mut seen = 0u32;
    walk_children(src, |b| {
        seen += 1;
        if seen > kept {
            return Ok(());
        }
        let name = b.head.name;
        let result = match media_type {
            MediaType::Audio => read_audio_sample_entry(b, config),
            MediaType::Video => read_video_sample_entry(b, config),
            _ => read_generic_sample_entry(b),
        };
        let description = match recover_optional(name, result)? {
            Some(description) => description,
            None => SampleDescription::new(name.into(), SampleEntryParams::Other),
        };
        descriptions.push(description)?;
        Ok(())
    })?;

    if let Some(first) = descriptions.first() {
        track.codec = first.codec;
        if let Some(esds) = &first.esds {
            track.buffer_size = esds.buffer_size;
            track.max_bitrate = esds.max_bitrate;
            track.avg_bitrate = esds.avg_bitrate;
        }
        if let Some((buffer_size, max_bitrate, avg_bitrate)) = first.bitrate {
            track.buffer_size = buffer_size;
            track.max_bitrate = max_bitrate;
            track.avg_bitrate = avg_bitrate;
        }
        if let SampleEntryParams::Video(video) = first.params {
            if track.width == 0 || track.height == 0 {
                track.width = u32::from(video.width);
                track.height = u32::from(video.height);
            }
        }
    }
    track.protected = descriptions.iter().any(|d| d.protection.is_some());
    track.descriptions = descriptions;
    Ok(())
}

fn codec_for_format(format: FourCC) -> CodecType {
    match &format.value {
        b"samr" => CodecType::AmrNb,
        b"sawb" => CodecType::AmrWb,
        b"sqcp" => CodecType::Qcelp,
        b"sevc" => CodecType::Evrc,
        b"mp4v" | b"mp42" => CodecType::Mpeg4Video,
        b"avc1" => CodecType::Avc,
        b"s263" | b"h263" | b"H263" => CodecType::H263,
        b"mjpa" => CodecType::MjpegA,
        b"mjpb" | b"jpeg" => CodecType::MjpegB,
        b"raw " | b"twos" | b"ulaw" | b"alaw" => {
            debug!("uncompressed audio format {format}");
            CodecType::Unknown
        },
        _ => CodecType::Unknown,
    }
}

/// Fixed fields of an audio sample entry, up to and including the sample rate.
fn read_audio_fields<R: Read>(src: &mut R) -> Result<(u16, u16, AudioParams)> {
    skip(src, 6)?; // reserved
    let data_reference_index = be_u16(src)?;
    let version = be_u16(src)?;
    skip(src, 6)?; // revision and vendor
    let channel_count = be_u16(src)?;
    let sample_size = be_u16(src)?;
    skip(src, 4)?; // pre_defined and reserved
    let sample_rate = be_u32(src)? >> 16;
    Ok((data_reference_index, version, AudioParams { channel_count, sample_size, sample_rate }))
}

/// Parse an audio sample entry.
/// See ISO 14496-12:2015 § 12.2.3
fn read_audio_sample_entry<T: Read>(src: &mut BMFFBox<'_, T>, config: &DecodeConfig) -> Result<SampleDescription> {
    let name = src.head.name;
    let format = FourCC::from(name);

    match name {
        BoxType::AmrNbSampleEntry
        | BoxType::AmrWbSampleEntry
        | BoxType::QcelpSampleEntry
        | BoxType::EvrcSampleEntry => {
            let body = src.read_into_try_vec(MAX_SAMPLE_ENTRY_SIZE)?;
            let (data_reference_index, _, params) = read_audio_fields(&mut Cursor::new(&body[..]))?;
            let mut description = SampleDescription::new(format, SampleEntryParams::Audio(params));
            description.codec = codec_for_format(format);
            description.data_reference_index = data_reference_index;
            description.decoder_config = body;
            return Ok(description);
        },
        _ => {},
    }

    let (data_reference_index, version, params) = read_audio_fields(src)?;
    match version {
        0 => {},
        1 => skip(src, 16)?,
        2 => skip(src, 16 + 20)?,
        _ => return Err(Error::Unsupported("unknown audio sample entry version")),
    }

    let mut description = SampleDescription::new(format, SampleEntryParams::Audio(params));
    description.data_reference_index = data_reference_index;
    walk_children(src, |b| {
        let name = b.head.name;
        match name {
            BoxType::ESDBox => description.esds = Some(read_esds(b)?),
            BoxType::QTWaveAtom => {
                if let Some(esds) = read_qt_wave_atom(b)? {
                    description.esds = Some(esds);
                }
            },
            BoxType::ProtectionSchemeInfoBox => description.protection = Some(read_sinf(b)?),
            _ => debug!("unhandled {name:?} in audio sample entry"),
        }
        Ok(())
    })?;

    let effective = effective_format(&description);
    if let Some(esds) = &description.esds {
        let (codec, aac) = esds.audio_codec()?;
        description.codec = codec;
        description.aac = aac;
        description.decoder_config.extend_from_slice(&esds.decoder_specific_info)?;
    } else {
        description.codec = codec_for_format(effective);
    }
    Ok(description)
}

/// Find an esds inside a QuickTime 'wave' atom.
fn read_qt_wave_atom<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<Option<EsDescriptor>> {
    let mut esds = None;
    walk_children(src, |b| {
        if b.head.name == BoxType::ESDBox {
            esds = Some(read_esds(b)?);
        }
        Ok(())
    })?;
    Ok(esds)
}

/// Format the entry decodes as, looking through protection.
fn effective_format(description: &SampleDescription) -> FourCC {
    description
        .protection
        .as_ref()
        .and_then(|p| p.original_format)
        .unwrap_or(description.format)
}

/// Keep a sinf payload and resolve its original format.
/// See ISO 14496-12:2015 § 8.12.1
fn read_sinf<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<ProtectionInfo> {
    let sinf = src.read_into_try_vec(MAX_SINF_SIZE)?;
    let mut original_format = None;
    let mut cursor = Cursor::new(&sinf[..]);
    let mut iter = BoxIter::new(&mut cursor);
    while let Some(mut b) = iter.next_box()? {
        if b.head.name == BoxType::OriginalFormatBox {
            original_format = Some(FourCC::from(be_u32(&mut b)?));
        }
        skip_box_remain(&mut b)?;
    }
    Ok(ProtectionInfo { original_format, sinf })
}

/// Fixed fields of a visual sample entry.
fn read_video_fields<R: Read>(src: &mut R) -> Result<(u16, VideoParams)> {
    skip(src, 6)?; // reserved
    let data_reference_index = be_u16(src)?;
    skip(src, 16)?; // pre_defined and reserved
    let width = be_u16(src)?;
    let height = be_u16(src)?;
    // resolution, reserved, frame count, compressor name, depth, pre_defined
    skip(src, 4 + 4 + 4 + 2 + 32 + 2 + 2)?;
    Ok((data_reference_index, VideoParams { width, height, field_handling: None, gamma: None }))
}

/// Parse a visual sample entry.
/// See ISO 14496-12:2015 § 12.1.3
fn read_video_sample_entry<T: Read>(src: &mut BMFFBox<'_, T>, config: &DecodeConfig) -> Result<SampleDescription> {
    let name = src.head.name;
    let format = FourCC::from(name);

    match name {
        BoxType::S263SampleEntry
        | BoxType::H263SampleEntry
        | BoxType::H263UpperSampleEntry
        | BoxType::MjpegASampleEntry
        | BoxType::MjpegBSampleEntry
        | BoxType::JpegSampleEntry => {
            let body = src.read_into_try_vec(MAX_SAMPLE_ENTRY_SIZE)?;
            let (data_reference_index, params) = read_video_fields(&mut Cursor::new(&body[..]))?;
            let mut description = SampleDescription::new(format, SampleEntryParams::Video(params));
            description.codec = codec_for_format(format);
            description.data_reference_index = data_reference_index;
            description.decoder_config = body;
            return Ok(description);
        },
        _ => {},
    }

    let (data_reference_index, mut params) = read_video_fields(src)?;
    let mut description = SampleDescription::new(format, SampleEntryParams::Other);
    description.data_reference_index = data_reference_index;
    walk_children(src, |b| {
        let name = b.head.name;
        match name {
            BoxType::ESDBox => description.esds = Some(read_esds(b)?),
            BoxType::AVCConfigurationBox => {
                let avcc = b.read_into_try_vec(MAX_SAMPLE_ENTRY_SIZE)?;
                description.avc = Some(parse_avc_config(&avcc, config.max_parameter_sets)?);
                description.decoder_config = avcc;
            },
            BoxType::BitRateBox => {
                let buffer_size = be_u32(b)?;
                let max_bitrate = be_u32(b)?;
                let avg_bitrate = be_u32(b)?;
                description.bitrate = Some((buffer_size, max_bitrate, avg_bitrate));
            },
            BoxType::FieldHandlingBox => params.field_handling = Some(be_u16(b)?),
            BoxType::GammaBox => params.gamma = Some(be_u32(b)?),
            BoxType::ProtectionSchemeInfoBox => description.protection = Some(read_sinf(b)?),
            _ => debug!("unhandled {name:?} in visual sample entry"),
        }
        Ok(())
    })?;
    description.params = SampleEntryParams::Video(params);

    let effective = effective_format(&description);
    description.codec = codec_for_format(effective);
    if let Some(esds) = &description.esds {
        if esds.object_type != OBJECT_MPEG4_VISUAL || esds.stream_type != STREAM_TYPE_VISUAL {
            return Err(Error::Unsupported("esds in visual entry is not MPEG-4 visual"));
        }
        description.codec = CodecType::Mpeg4Video;
        description.decoder_config.extend_from_slice(&esds.decoder_specific_info)?;
    }
    if description.codec == CodecType::Avc && description.avc.is_none() {
        return Err(Error::InvalidData("avc1 entry without avcC"));
    }
    Ok(description)
}

/// Sample entry of a hint or other non-audiovisual track.
fn read_generic_sample_entry<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<SampleDescription> {
    let format = FourCC::from(src.head.name);
    skip(src, 6)?;
    let mut description = SampleDescription::new(format, SampleEntryParams::Other);
    description.data_reference_index = be_u16(src)?;
    Ok(description)
}

/// Collect redirect URLs from a reference movie box.
fn read_rmra<T: Read>(src: &mut BMFFBox<'_, T>, urls: &mut TryVec<TryString>, config: &DecodeConfig) -> Result<()> {
    walk_children(src, |rmda| {
        if rmda.head.name != BoxType::ReferenceMovieDescriptorBox {
            return Ok(());
        }
        walk_children(rmda, |b| {
            if b.head.name == BoxType::DataReferenceRedirectBox {
                if let Some(url) = read_rdrf(b, config)? {
                    urls.push(url)?;
                }
            }
            Ok(())
        })?;
        Ok(())
    })?;
    Ok(())
}

fn read_rdrf<T: Read>(src: &mut BMFFBox<'_, T>, config: &DecodeConfig) -> Result<Option<TryString>> {
    skip(src, 4)?; // flags
    let reference_type = FourCC::from(be_u32(src)?);
    if reference_type != b"url " && reference_type != b"urlr" {
        debug!("redirect reference type {reference_type} (skipped)");
        return Ok(None);
    }
    let len = be_u32(src)?;
    read_url(src, u64::from(len), config).map(Some)
}

fn read_url<R: Read>(src: &mut R, len: u64, config: &DecodeConfig) -> Result<TryString> {
    if len > u64::from(config.max_metadata_len) {
        return Err(Error::ResourceLimitExceeded("URL too long"));
    }
    let mut url = std::vec::Vec::new();
    url.try_reserve_exact(len.try_into()?).map_err(|_| Error::OutOfMemory)?;
    let read = src.by_ref().take(len).read_to_end(&mut url)?;
    if read.to_u64() < len {
        return Err(Error::UnexpectedEOF);
    }
    // URLs are commonly NUL terminated
    while url.last() == Some(&0) {
        url.pop();
    }
    Ok(url.into())
}

/// Parse dinf/dref for an alias or handle entry naming an embedded URL.
fn read_dinf<T: Read>(src: &mut BMFFBox<'_, T>, track: &mut Track, config: &DecodeConfig) -> Result<()> {
    walk_children(src, |dref| {
        if dref.head.name != BoxType::DataReferenceBox {
            return Ok(());
        }
        skip(dref, 4)?; // version and flags
        let count = be_u32(dref)?;
        debug!("dref with {count} entries");
        walk_children(dref, |entry| {
            let named = matches!(entry.head.name, BoxType::HandleEntryBox | BoxType::AliasEntryBox);
            if named && track.embedded_url.is_none() {
                track.embedded_url = read_handle_url(entry, config)?;
            }
            Ok(())
        })?;
        Ok(())
    })?;
    Ok(())
}

fn read_handle_url<T: Read>(src: &mut BMFFBox<'_, T>, config: &DecodeConfig) -> Result<Option<TryString>> {
    skip(src, 8)?;
    let mut raw = [0u8; 9];
    src.read_exact(&mut raw)?;
    if &raw[5..9] != b"data" {
        return Ok(None);
    }
    let declared = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
    let len = declared.checked_sub(8).ok_or(Error::InvalidData("handle data length too small"))?;
    read_url(src, u64::from(len), config).map(Some)
}

/// Finish tracks once the whole movie box is known: parse sample tables
/// that were met before their handler, and read the URL carried by a
/// streaming hint track.
pub(crate) fn resolve_deferred<S: ByteSource + ?Sized>(
    source: &mut S,
    registry: &mut TrackRegistry,
    config: &DecodeConfig,
) -> Result<()> {
    for track in registry.iter_mut() {
        if let Some((offset, size)) = track.pending_stbl.take() {
            if track.is_demuxable() {
                match reparse_stbl(source, track, offset, size, config) {
                    Ok(()) => {},
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!("sample tables of track {} are unusable: {e}", track.id),
                }
            }
        }
        if track.media_type == MediaType::Stream && track.embedded_url.is_none() {
            match read_stream_url(source, track, config) {
                Ok(url) => track.embedded_url = url,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("stream URL of track {}: {e}", track.id),
            }
        }
    }
    Ok(())
}

fn reparse_stbl<S: ByteSource + ?Sized>(
    source: &mut S,
    track: &mut Track,
    offset: u64,
    size: u64,
    config: &DecodeConfig,
) -> Result<()> {
    seek_to(source, offset)?;
    let mut reader = SourceReader::new(source);
    let head = read_box_header(&mut reader)?;
    if head.name != BoxType::SampleTableBox || head.size != size {
        return Err(Error::InvalidData("deferred stbl moved"));
    }
    let mut b = BMFFBox { head, content: Read::take(&mut reader, head.size - head.offset) };
    read_stbl(&mut b, track, config)?;
    skip_box_remain(&mut b)
}

/// A streaming hint track with a single chunk carries its URL as that chunk's only sample.
fn read_stream_url<S: ByteSource + ?Sized>(
    source: &mut S,
    track: &Track,
    config: &DecodeConfig,
) -> Result<Option<TryString>> {
    let (Some(chunks), Some(stsz)) = (track.tables.chunk_offsets, track.tables.stsz) else {
        return Ok(None);
    };
    if chunks.entries != 1 || stsz.sample_size == 0 {
        return Ok(None);
    }
    let mut entry = [0u8; 8];
    let width = chunks.entry_len();
    read_exact_at(source, chunks.offset + 16, &mut entry[..width])?;
    let offset = if chunks.large {
        u64::from_be_bytes(entry)
    } else {
        u64::from(u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]))
    };
    if offset == 0 {
        return Ok(None);
    }
    let len = stsz.sample_size.min(config.max_metadata_len);
    seek_to(source, offset)?;
    let mut reader = SourceReader::new(source);
    read_url(&mut reader, u64::from(len), config).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
        let mut out = std::vec::Vec::new();
        out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(payload);
        out
    }

    fn full(name: &[u8; 4], version: u8, payload: &[u8]) -> std::vec::Vec<u8> {
        let mut body = vec![version, 0, 0, 0];
        body.extend_from_slice(payload);
        boxed(name, &body)
    }

    fn with_box<R>(data: std::vec::Vec<u8>, f: impl FnOnce(&mut BMFFBox<'_, Cursor<std::vec::Vec<u8>>>) -> R) -> R {
        let mut cursor = Cursor::new(data);
        let mut iter = BoxIter::new(&mut cursor);
        let mut b = iter.next_box().unwrap().unwrap();
        f(&mut b)
    }

    fn tkhd(volume: u32, width: u32, height: u32) -> std::vec::Vec<u8> {
        let mut p = vec![0u8; 8];
        p.extend_from_slice(&7u32.to_be_bytes());
        p.extend_from_slice(&[0; 4]);
        p.extend_from_slice(&100u32.to_be_bytes());
        p.extend_from_slice(&[0; 12]);
        p.extend_from_slice(&volume.to_be_bytes());
        p.extend_from_slice(&[0; 36]);
        p.extend_from_slice(&width.to_be_bytes());
        p.extend_from_slice(&height.to_be_bytes());
        full(b"tkhd", 0, &p)
    }

    #[test]
    fn tkhd_hints_media_type() {
        let mut track = Track::default();
        with_box(tkhd(0x0100_0000, 0, 0), |b| read_tkhd(b, &mut track)).unwrap();
        assert_eq!(track.id, 7);
        assert_eq!(track.tkhd_hint, MediaType::Audio);

        with_box(tkhd(0, 0x0140_0000, 0x00f0_0000), |b| read_tkhd(b, &mut track)).unwrap();
        assert_eq!(track.tkhd_hint, MediaType::Video);
        assert_eq!((track.width, track.height), (320, 240));
    }

    #[test]
    fn mvhd_versions() {
        let mut p = vec![0u8; 8];
        p.extend_from_slice(&1000u32.to_be_bytes());
        p.extend_from_slice(&5000u32.to_be_bytes());
        p.extend_from_slice(&[0; 76]);
        p.extend_from_slice(&3u32.to_be_bytes());
        let header = with_box(full(b"mvhd", 0, &p), |b| read_mvhd(b, &DecodeConfig::default())).unwrap();
        assert_eq!(header, MovieHeader { timescale: 1000, duration: 5000, next_track_id: 3 });

        let unsupported = with_box(full(b"mvhd", 2, &p), |b| read_mvhd(b, &DecodeConfig::default()));
        assert!(matches!(unsupported, Err(Error::Unsupported(_))));
    }

    #[test]
    fn mvhd_zero_duration() {
        let mut p = vec![0u8; 8];
        p.extend_from_slice(&1000u32.to_be_bytes());
        p.extend_from_slice(&[0; 4]);
        p.extend_from_slice(&[0; 80]);
        let strict = with_box(full(b"mvhd", 0, &p), |b| read_mvhd(b, &DecodeConfig::default()));
        assert!(matches!(strict, Err(Error::InvalidData(_))));
        let lenient = with_box(full(b"mvhd", 0, &p), |b| read_mvhd(b, &DecodeConfig::default().lenient(true)));
        assert_eq!(lenient.unwrap().duration, 0);
    }

    #[test]
    fn elst_is_bounded() {
        let mut p = 2u32.to_be_bytes().to_vec();
        for (duration, time) in [(500u32, -1i32), (9000, 0)] {
            p.extend_from_slice(&duration.to_be_bytes());
            p.extend_from_slice(&time.to_be_bytes());
            p.extend_from_slice(&[0, 1, 0, 0]);
        }
        let edits = with_box(full(b"elst", 0, &p), |b| read_elst(b, &DecodeConfig::default())).unwrap();
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].media_time, -1);
        assert_eq!(edits[1].segment_duration, 9000);
        assert_eq!(edits[1].media_rate_integer, 1);

        let limited = with_box(full(b"elst", 0, &p), |b| read_elst(b, &DecodeConfig::default().with_max_edit_entries(1)));
        assert!(matches!(limited, Err(Error::ResourceLimitExceeded(_))));
    }

    #[test]
    fn sample_table_versions_and_locations() {
        let mut stbl = full(b"stts", 0, &[0, 0, 0, 1, 0, 0, 0, 10, 0, 0, 0, 1]);
        stbl.extend(full(b"stsz", 0, &[0, 0, 0, 9, 0, 0, 0, 10]));
        stbl.extend(full(b"stss", 0, &[0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 6]));
        let mut track = Track { media_type: MediaType::Video, ..Track::default() };
        let config = DecodeConfig::default().with_sync_prefix_len(1);
        with_box(boxed(b"stbl", &stbl), |b| read_stbl(b, &mut track, &config)).unwrap();

        assert_eq!(track.tables.stts, Some(TableRef { offset: 8, entries: 1 }));
        assert_eq!(track.tables.stsz, Some(SampleSizeTable { offset: 32, sample_size: 9, sample_count: 10 }));
        assert_eq!(track.total_frames(), 10);
        assert!(track.has_seek_table);
        assert_eq!(&track.sync_prefix[..], &[1]);

        let v1 = full(b"stsc", 1, &[0, 0, 0, 0]);
        let mut track = Track::default();
        let result = with_box(boxed(b"stbl", &v1), |b| read_stbl(b, &mut track, &config));
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn empty_stss_disables_seek_table() {
        let stbl = full(b"stss", 0, &[0, 0, 0, 0]);
        let mut track = Track::default();
        with_box(boxed(b"stbl", &stbl), |b| read_stbl(b, &mut track, &DecodeConfig::default())).unwrap();
        assert!(!track.has_seek_table);
        assert!(track.tables.stss.is_none());
    }

    fn audio_entry(name: &[u8; 4], children: &[u8]) -> std::vec::Vec<u8> {
        let mut p = vec![0u8; 6];
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&[0; 8]);
        p.extend_from_slice(&2u16.to_be_bytes());
        p.extend_from_slice(&16u16.to_be_bytes());
        p.extend_from_slice(&[0; 4]);
        p.extend_from_slice(&(44100u32 << 16).to_be_bytes());
        p.extend_from_slice(children);
        boxed(name, &p)
    }

    #[test]
    fn mp4a_entry_with_esds() {
        let esds = full(
            b"esds",
            0,
            &[
                0x03, 0x16, 0x00, 0x01, 0x00, 0x04, 0x11, 0x40, 0x15, 0x00, 0x06, 0x00, 0x00, 0x01, 0xf4, 0x00, 0x00,
                0x01, 0xf4, 0x00, 0x05, 0x02, 0x12, 0x10,
            ],
        );
        let entry = audio_entry(b"mp4a", &esds);
        let description = with_box(entry, |b| read_audio_sample_entry(b, &DecodeConfig::default())).unwrap();
        assert_eq!(description.codec, CodecType::Aac);
        assert_eq!(&description.decoder_config[..], &[0x12, 0x10]);
        assert_eq!(
            description.params,
            SampleEntryParams::Audio(AudioParams { channel_count: 2, sample_size: 16, sample_rate: 44100 })
        );
        assert_eq!(description.aac.unwrap().sample_rate, 44100);
    }

    #[test]
    fn amr_entry_keeps_raw_body() {
        let entry = audio_entry(b"samr", &boxed(b"damr", &[1, 2, 3]));
        let body_len = entry.len() - 8;
        let description = with_box(entry, |b| read_audio_sample_entry(b, &DecodeConfig::default())).unwrap();
        assert_eq!(description.codec, CodecType::AmrNb);
        assert_eq!(description.decoder_config.len(), body_len);
        assert_eq!(description.data_reference_index, 1);
    }

    #[test]
    fn protected_entry_resolves_original_format() {
        let sinf = boxed(b"sinf", &boxed(b"frma", b"samr"));
        let entry = audio_entry(b"enca", &sinf);
        let description = with_box(entry, |b| read_audio_sample_entry(b, &DecodeConfig::default())).unwrap();
        let protection = description.protection.unwrap();
        assert_eq!(protection.original_format, Some(FourCC::new(b"samr")));
        assert_eq!(description.codec, CodecType::AmrNb);
    }

    #[test]
    fn stsd_keeps_bounded_entries_and_placeholders() {
        let mut entries = audio_entry(b"mp4a", &full(b"esds", 3, &[]));
        entries.extend(audio_entry(b"samr", &[]));
        entries.extend(audio_entry(b"sawb", &[]));
        let mut payload = 3u32.to_be_bytes().to_vec();
        payload.extend(entries);
        let mut track = Track { media_type: MediaType::Audio, ..Track::default() };
        let config = DecodeConfig::default().with_max_sample_descriptions(2);
        with_box(full(b"stsd", 0, &payload), |b| read_stsd(b, &mut track, &config)).unwrap();

        assert_eq!(track.descriptions.len(), 2);
        assert_eq!(track.descriptions[0].codec, CodecType::Unknown);
        assert_eq!(track.descriptions[0].format, FourCC::new(b"mp4a"));
        assert_eq!(track.descriptions[1].codec, CodecType::AmrNb);
        assert_eq!(track.codec, CodecType::Unknown);
    }

    #[test]
    fn track_limit_counts_audio_and_video_only() {
        let config = DecodeConfig::default().with_max_tracks(1);
        let mut registry = TrackRegistry::default();
        registry.push(Track { media_type: MediaType::Video, ..Track::default() }, &config).unwrap();
        registry.push(Track { media_type: MediaType::Stream, ..Track::default() }, &config).unwrap();
        let over = registry.push(Track { media_type: MediaType::Audio, ..Track::default() }, &config);
        assert!(matches!(over, Err(Error::ResourceLimitExceeded(_))));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn redirect_urls() {
        let mut rdrf = vec![0, 0, 0, 0];
        rdrf.extend_from_slice(b"url ");
        rdrf.extend_from_slice(&19u32.to_be_bytes());
        rdrf.extend_from_slice(b"http://example.com\0");
        let rmra = boxed(b"rmra", &boxed(b"rmda", &boxed(b"rdrf", &rdrf)));
        let mut urls = TryVec::new();
        with_box(rmra, |b| read_rmra(b, &mut urls, &DecodeConfig::default())).unwrap();
        assert_eq!(urls.len(), 1);
        assert_eq!(&urls[0][..], b"http://example.com");
    }
}
