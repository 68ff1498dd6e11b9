#![deny(unsafe_code)]
//! Demuxer for MP4 and 3GP files (ISO Base Media File Format).
//!
//! [`Mp4Demuxer`] walks the box tree once, records where each track's
//! sample tables live, and then serves compressed access units with their
//! timestamps on demand. Sample tables are never loaded whole: they are read
//! in bounded windows as playback moves through the file.
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::{debug, warn};

use byteorder::ReadBytesExt;
use fallible_collections::TryReserveError;
use std::convert::TryInto as _;

use std::io::{Read, Take};
use std::time::Duration;

mod boxes;
use crate::boxes::BoxType;
pub use crate::boxes::FourCC;

mod descriptor;
pub use crate::descriptor::{AacConfig, AvcConfig, EntropyCoding, EsDescriptor};

mod metadata;
pub use crate::metadata::{Charset, CoverArt, MediaMetadata, MetadataField, MetadataText};

mod source;
pub use crate::source::{Availability, ByteSource, Decryptor, SeekOrigin, StreamSource};
use crate::source::{read_exact_at, seek_to, SourceReader};

mod track;
pub use crate::track::{
    AudioParams, ChunkOffsetTable, CodecType, EditEntry, MediaType, MovieHeader, ProtectionInfo, SampleDescription,
    SampleEntryParams, SampleSizeTable, SampleTables, TableRef, Track, VideoParams,
};
use crate::track::{read_moov, MovieBox, TrackRegistry};

mod framing;

mod seek;
pub use crate::seek::{SeekDirection, SyncSearch};

mod reader;
pub use crate::reader::{AccessUnit, PlaybackState};

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self as u64
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self as usize
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

/// Indicate the current absolute position of a reader in its byte stream.
trait Offset {
    fn offset(&self) -> u64;
}

impl<T: AsRef<[u8]>> Offset for std::io::Cursor<T> {
    fn offset(&self) -> u64 {
        self.position()
    }
}

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;
#[doc(hidden)]
pub type TryString = fallible_collections::TryVec<u8>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes demuxer failures.
///
/// This enum wraps the standard `io::Error` type, unified with
/// our own parser and playback states and those of crates we use.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// The top-level scan ended without finding a moov box.
    NoMoov,
    /// Out of memory
    OutOfMemory,
    /// A configured resource limit was exceeded.
    ResourceLimitExceeded(&'static str),
    /// A sample table references data that does not exist.
    CorruptIndex(&'static str),
    /// A streaming source has not received the requested bytes yet.
    NotReady,
    /// No more access units in the playback direction.
    EndOfStream,
    /// Reverse playback reached frame 0.
    BeginningOfStream,
    /// The installed [`Decryptor`] rejected an access unit.
    DrmFailure(std::io::Error),
    /// The caller passed a track index or frame number that does not exist.
    InvalidArgument(&'static str),
}

impl Error {
    /// Whether retrying the same call later can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotReady)
    }

    /// Errors that must abort the parse even inside an optional box.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::NotReady | Self::OutOfMemory)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s)
            | Self::Unsupported(s)
            | Self::ResourceLimitExceeded(s)
            | Self::CorruptIndex(s)
            | Self::InvalidArgument(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::NoMoov => "Missing Moov box",
            Self::OutOfMemory => "OOM",
            Self::NotReady => "data not ready",
            Self::EndOfStream => "end of stream",
            Self::BeginningOfStream => "beginning of stream",
            Self::DrmFailure(err) => return write!(f, "decrypt failed: {err}"),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) | Error::CorruptIndex(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            Error::NotReady => std::io::ErrorKind::WouldBlock,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Basic ISO box structure.
///
/// mp4 files are a sequence of possibly-nested 'box' structures.  Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box. Together these
/// are enough to interpret the contents of that section of the file.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    /// Box type.
    name: BoxType,
    /// Size of the box in bytes. `u64::MAX` for an mdat that runs to the end of the file.
    size: u64,
    /// Offset to the start of the contained data (or header size).
    offset: u64,
    /// Uuid for extended type.
    #[allow(unused)]
    uuid: Option<[u8; 16]>,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    const MIN_LARGE_SIZE: u64 = 16;
}

/// File type box 'ftyp'.
#[derive(Debug)]
pub struct FileTypeBox {
    pub major_brand: FourCC,
    pub minor_version: u32,
    pub compatible_brands: TryVec<FourCC>,
}

/// Location of the first top-level media data box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaDataExtent {
    /// Absolute offset of the first payload byte.
    pub offset: u64,
    pub size: u64,
}

/// Options for the box readers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Enable lenient parsing mode
    ///
    /// When true, non-critical validation errors (like non-zero flags in boxes
    /// that expect zero flags, or a zero movie duration) will be ignored
    /// instead of returning errors.
    ///
    /// Default: false (strict validation)
    pub lenient: bool,
}

/// Configuration for opening and playing a file.
///
/// Every table the demuxer keeps in memory is bounded by one of these
/// fields, so a hostile file cannot make it allocate without limit.
///
/// # Examples
///
/// ```rust
/// use mp4_demux::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Smaller windows for a memory-constrained player
/// let config = DecodeConfig::default()
///     .with_max_frames_per_block(256)
///     .with_max_tracks(4);
///
/// // No limits on counts that come from the file
/// let config = DecodeConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Frames per sample window.
    /// Default: 1024
    pub max_frames_per_block: u32,

    /// Keyframe entries held by the seek cache of each track.
    /// Default: 128
    pub sync_cache_len: u32,

    /// Keyframe entries read eagerly at open for thumbnail selection.
    /// Default: 20
    pub sync_prefix_len: u32,

    /// Sample descriptions kept per track. Extra entries are skipped.
    /// Default: 16
    pub max_sample_descriptions: u32,

    /// SPS or PPS entries kept per AVC configuration.
    /// Default: 32
    pub max_parameter_sets: u32,

    /// Audio and video tracks accepted per file.
    /// Default: 32
    pub max_tracks: Option<u32>,

    /// Edit list entries kept per track.
    /// Default: 1024
    pub max_edit_entries: Option<u32>,

    /// Bytes kept per metadata text field.
    /// Default: 1024
    pub max_metadata_len: u32,

    /// Largest access unit handed out. Bigger frames are skipped.
    /// Default: 16 MiB
    pub max_access_unit_size: Option<u32>,

    /// Consecutive unreadable frames tolerated before giving up on a track.
    /// Default: 30
    pub max_consecutive_skips: u32,

    /// Attempts made while a streaming source reports the movie box as not ready.
    /// Default: 100
    pub max_ready_retries: u32,

    /// Sleep between those attempts.
    /// Default: 10 ms
    pub retry_backoff: Duration,

    /// Enable lenient parsing mode.
    /// Default: false (strict validation)
    pub lenient: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_frames_per_block: 1024,
            sync_cache_len: 128,
            sync_prefix_len: 20,
            max_sample_descriptions: 16,
            max_parameter_sets: 32,
            max_tracks: Some(32),
            max_edit_entries: Some(1024),
            max_metadata_len: 1024,
            max_access_unit_size: Some(16 * 1024 * 1024),
            max_consecutive_skips: 30,
            max_ready_retries: 100,
            retry_backoff: Duration::from_millis(10),
            lenient: false,
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no limits on counts taken from the file.
    ///
    /// Window and cache sizes keep their defaults; they bound working memory
    /// rather than what the file may declare.
    pub fn unlimited() -> Self {
        Self {
            max_tracks: None,
            max_edit_entries: None,
            max_access_unit_size: None,
            ..Self::default()
        }
    }

    /// Set the number of frames per sample window
    pub fn with_max_frames_per_block(mut self, frames: u32) -> Self {
        self.max_frames_per_block = frames;
        self
    }

    /// Set the keyframe cache length
    pub fn with_sync_cache_len(mut self, entries: u32) -> Self {
        self.sync_cache_len = entries;
        self
    }

    /// Set how many keyframes are read at open for thumbnail selection
    pub fn with_sync_prefix_len(mut self, entries: u32) -> Self {
        self.sync_prefix_len = entries;
        self
    }

    pub fn with_max_sample_descriptions(mut self, count: u32) -> Self {
        self.max_sample_descriptions = count;
        self
    }

    pub fn with_max_parameter_sets(mut self, count: u32) -> Self {
        self.max_parameter_sets = count;
        self
    }

    /// Set the maximum audio and video track count
    pub fn with_max_tracks(mut self, tracks: u32) -> Self {
        self.max_tracks = Some(tracks);
        self
    }

    pub fn with_max_edit_entries(mut self, entries: u32) -> Self {
        self.max_edit_entries = Some(entries);
        self
    }

    pub fn with_max_metadata_len(mut self, bytes: u32) -> Self {
        self.max_metadata_len = bytes;
        self
    }

    /// Set the largest access unit size in bytes
    pub fn with_max_access_unit_size(mut self, bytes: u32) -> Self {
        self.max_access_unit_size = Some(bytes);
        self
    }

    pub fn with_max_consecutive_skips(mut self, frames: u32) -> Self {
        self.max_consecutive_skips = frames;
        self
    }

    /// Set the retry policy used while a streaming source is not ready
    pub fn with_ready_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.max_ready_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    /// Enable lenient parsing mode
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub(crate) fn parse_options(&self) -> ParseOptions {
        ParseOptions { lenient: self.lenient }
    }

    pub(crate) fn frames_per_block(&self) -> u32 {
        self.max_frames_per_block.max(1)
    }
}

/// See ISO 14496-12:2015 § 4.2
struct BMFFBox<'a, T> {
    head: BoxHeader,
    content: Take<&'a mut T>,
}

impl<T: Read> BMFFBox<'_, T> {
    /// Read the rest of the box, refusing boxes larger than `limit` bytes.
    fn read_into_try_vec(&mut self, limit: u64) -> Result<TryVec<u8>> {
        let len = self.content.limit();
        if len > limit {
            return Err(Error::ResourceLimitExceeded("box payload too large to buffer"));
        }
        let mut vec = std::vec::Vec::new();
        vec.try_reserve_exact(len.try_into()?).map_err(|_| Error::OutOfMemory)?;
        self.content.read_to_end(&mut vec)?;
        Ok(vec.into())
    }
}

#[test]
fn box_read_to_end() {
    let tmp = &mut b"1234567890".as_slice();
    let mut src = BMFFBox {
        head: BoxHeader { name: BoxType::FileTypeBox, size: 5, offset: 0, uuid: None },
        content: <_ as Read>::take(tmp, 5),
    };
    let buf = src.read_into_try_vec(64).unwrap();
    assert_eq!(buf.len(), 5);
    assert_eq!(&buf[..], b"12345");
}

#[test]
fn box_read_to_end_over_limit() {
    let tmp = &mut b"1234567890".as_slice();
    let mut src = BMFFBox {
        head: BoxHeader { name: BoxType::FileTypeBox, size: 10, offset: 0, uuid: None },
        content: <_ as Read>::take(tmp, 10),
    };
    assert!(matches!(src.read_into_try_vec(4), Err(Error::ResourceLimitExceeded(_))));
}

struct BoxIter<'a, T> {
    src: &'a mut T,
}

impl<T: Read> BoxIter<'_, T> {
    fn new(src: &mut T) -> BoxIter<'_, T> {
        BoxIter { src }
    }

    fn next_box(&mut self) -> Result<Option<BMFFBox<'_, T>>> {
        let r = read_box_header(self.src);
        match r {
            Ok(h) => Ok(Some(BMFFBox {
                head: h,
                content: self.src.take(h.size - h.offset),
            })),
            Err(Error::UnexpectedEOF) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<T: Read> Read for BMFFBox<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl<T: Offset> Offset for BMFFBox<'_, T> {
    fn offset(&self) -> u64 {
        self.content.get_ref().offset()
    }
}

impl<T: Read> BMFFBox<'_, T> {
    fn bytes_left(&self) -> u64 {
        self.content.limit()
    }

    const fn get_header(&self) -> &BoxHeader {
        &self.head
    }
}

impl<T: Offset> BMFFBox<'_, T> {
    /// Absolute offset of the box header. Only meaningful before any payload is read.
    fn start_offset(&self) -> u64 {
        self.offset().saturating_sub(self.head.offset)
    }
}

impl<T> Drop for BMFFBox<'_, T> {
    fn drop(&mut self) {
        if self.content.limit() > 0 {
            let name: FourCC = From::from(self.head.name);
            debug!("Dropping {} bytes in '{}'", self.content.limit(), name);
        }
    }
}

/// Read and parse a box header.
///
/// Call this first to determine the type of a particular mp4 box
/// and its length. Used internally for dispatching to specific
/// parsers for the internal content, or to get the length to
/// skip unknown or uninteresting boxes.
///
/// A 64-bit or open-ended size is only accepted for `mdat`.
///
/// See ISO 14496-12:2015 § 4.2
fn read_box_header<T: ReadBytesExt>(src: &mut T) -> Result<BoxHeader> {
    let size32 = be_u32(src)?;
    let name = BoxType::from(be_u32(src)?);
    let size = match size32 {
        // valid only for the last top-level box, which must be mdat here
        0 => {
            if name != BoxType::MediaDataBox {
                return Err(Error::InvalidData("open-ended size on a box other than mdat"));
            }
            u64::MAX
        },
        1 => {
            if name != BoxType::MediaDataBox {
                return Err(Error::InvalidData("64-bit size on a box other than mdat"));
            }
            let size64 = be_u64(src)?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData("malformed wide size"));
            }
            size64
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData("malformed size"));
            }
            u64::from(size32)
        },
    };
    let mut offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    let uuid = if name == BoxType::UuidBox {
        if size >= offset + 16 {
            let mut buffer = [0u8; 16];
            src.read_exact(&mut buffer)?;
            offset += 16;
            Some(buffer)
        } else {
            debug!("malformed uuid, skipping");
            None
        }
    } else {
        None
    };
    Ok(BoxHeader { name, size, offset, uuid })
}

/// Parse the extra header fields for a full box.
fn read_fullbox_extra<T: ReadBytesExt>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

// Parse the extra fields for a full box whose flag fields must be zero.
fn read_fullbox_version_no_flags<T: ReadBytesExt>(src: &mut T, options: &ParseOptions) -> Result<u8> {
    let (version, flags) = read_fullbox_extra(src)?;

    if flags != 0 && !options.lenient {
        return Err(Error::Unsupported("expected flags to be 0"));
    }

    Ok(version)
}

/// Skip over the entire contents of a box.
fn skip_box_content<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    // Skip the contents of unknown chunks.
    let to_skip = {
        let header = src.get_header();
        debug!("{header:?} (skipped)");
        src.bytes_left()
    };
    skip(src, to_skip)
}

/// Skip over the remain data of a box.
fn skip_box_remain<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let remain = src.bytes_left();
    if remain > 0 {
        let header = src.get_header();
        debug!("remain {remain} (skipped) in {header:?}");
    }
    skip(src, remain)
}

/// Walk the children of a container box.
///
/// Each child is handed to `handler` with its reads clipped to the child's
/// payload. Whatever the handler leaves unread is skipped, as are trailing
/// bytes too short to hold another header. Returns the bytes consumed, which
/// equals the parent's payload size for well-formed input.
fn walk_children<'a, T, F>(src: &mut BMFFBox<'a, T>, mut handler: F) -> Result<u64>
where
    T: Read,
    F: FnMut(&mut BMFFBox<'_, BMFFBox<'a, T>>) -> Result<()>,
{
    let mut consumed = 0u64;
    while src.bytes_left() >= BoxHeader::MIN_SIZE {
        let available = src.bytes_left();
        let head = match read_box_header(src) {
            Ok(head) => head,
            Err(Error::UnexpectedEOF) => break,
            Err(e) => return Err(e),
        };
        if head.size > available {
            return Err(Error::InvalidData("child box exceeds its parent"));
        }
        let mut child = BMFFBox {
            head,
            content: Read::take(&mut *src, head.size - head.offset),
        };
        handler(&mut child)?;
        skip_box_remain(&mut child)?;
        consumed += head.size;
    }
    let trailing = src.bytes_left();
    if trailing > 0 {
        debug!("{trailing} trailing bytes in {:?}", src.head.name);
        skip(src, trailing)?;
        consumed += trailing;
    }
    Ok(consumed)
}

/// Contain a failure inside an optional box.
///
/// Returns `Ok(None)` after logging when the error is local to the box; the
/// walker then skips past it using the declared size.
fn recover_optional<V>(name: BoxType, result: Result<V>) -> Result<Option<V>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!("ignoring malformed {name:?} box: {e}");
            Ok(None)
        },
    }
}

/// Parse an ftyp box.
/// See ISO 14496-12:2015 § 4.3
fn read_ftyp<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<FileTypeBox> {
    let major = be_u32(src)?;
    let minor = be_u32(src)?;
    let bytes_left = src.bytes_left();
    if bytes_left % 4 != 0 {
        return Err(Error::InvalidData("invalid ftyp size"));
    }
    // Is a brand_count of zero valid?
    let brand_count = bytes_left / 4;
    let mut brands = TryVec::with_capacity(brand_count.try_into()?)?;
    for _ in 0..brand_count {
        brands.push(be_u32(src)?.into())?;
    }
    Ok(FileTypeBox {
        major_brand: From::from(major),
        minor_version: minor,
        compatible_brands: brands,
    })
}

/// Wait until a streaming source holds `len` bytes past its position.
fn wait_until_available<S: ByteSource>(source: &mut S, len: u64, config: &DecodeConfig) -> Result<()> {
    for attempt in 0..=config.max_ready_retries {
        match source.check_available(len) {
            Availability::Ok => return Ok(()),
            Availability::Insufficient => {
                warn!("movie box is truncated, parsing what is present");
                return Ok(());
            },
            Availability::EndOfStream => return Err(Error::UnexpectedEOF),
            Availability::NotReady => {
                if attempt < config.max_ready_retries {
                    std::thread::sleep(config.retry_backoff);
                }
            },
        }
    }
    Err(Error::NotReady)
}

/// An open MP4/3GP file.
///
/// Owns its [`ByteSource`]; every operation takes `&mut self` because each
/// one may move the source position.
///
/// ```no_run
/// use mp4_demux::{Mp4Demuxer, StreamSource};
///
/// let file = std::fs::File::open("clip.3gp").unwrap();
/// let mut demuxer = Mp4Demuxer::open(StreamSource::new(file).unwrap()).unwrap();
/// for track in 0..demuxer.track_count() {
///     while let Ok(unit) = demuxer.get_access_unit(track, true) {
///         println!("track {track} dts {} {} bytes", unit.dts, unit.data.len());
///     }
/// }
/// ```
pub struct Mp4Demuxer<S> {
    source: S,
    config: DecodeConfig,
    file_type: Option<FileTypeBox>,
    media_data: Option<MediaDataExtent>,
    movie: MovieHeader,
    tracks: TrackRegistry,
    metadata: MediaMetadata,
    redirect_urls: TryVec<TryString>,
    decryptor: Option<std::boxed::Box<dyn Decryptor>>,
    /// Play rate in thousandths; negative plays backwards.
    rate: i32,
}

impl<S: ByteSource> Mp4Demuxer<S> {
    /// Open a file with the default [`DecodeConfig`].
    pub fn open(source: S) -> Result<Self> {
        Self::open_with_config(source, &DecodeConfig::default())
    }

    /// Scan the top-level boxes, parse `moov` and build the track registry.
    pub fn open_with_config(mut source: S, config: &DecodeConfig) -> Result<Self> {
        seek_to(&mut source, 0)?;
        let mut file_type = None;
        let mut media_data = None;
        let mut movie: Option<MovieBox> = None;

        loop {
            let start = source.position();
            let head = {
                let mut reader = SourceReader::new(&mut source);
                match read_box_header(&mut reader) {
                    Ok(head) => head,
                    Err(Error::UnexpectedEOF) => break,
                    Err(e) if movie.is_some() => {
                        warn!("stopping top-level scan: {e}");
                        break;
                    },
                    Err(e) => return Err(e),
                }
            };
            let size = if head.size == u64::MAX {
                source.size().saturating_sub(start)
            } else {
                head.size
            };
            let payload = size.saturating_sub(head.offset);
            match head.name {
                BoxType::MovieBox if movie.is_none() => {
                    wait_until_available(&mut source, payload, config)?;
                    let mut reader = SourceReader::new(&mut source);
                    let mut b = BMFFBox { head, content: Read::take(&mut reader, payload) };
                    movie = Some(read_moov(&mut b, config)?);
                    skip_box_remain(&mut b)?;
                },
                BoxType::FileTypeBox if file_type.is_none() => {
                    let mut reader = SourceReader::new(&mut source);
                    let mut b = BMFFBox { head, content: Read::take(&mut reader, payload) };
                    file_type = recover_optional(head.name, read_ftyp(&mut b))?;
                    skip_box_remain(&mut b)?;
                },
                BoxType::MediaDataBox => {
                    debug!("mdat at {start}, {size} bytes");
                    if media_data.is_none() {
                        media_data = Some(MediaDataExtent { offset: start + head.offset, size: payload });
                    }
                },
                _ => debug!("{:?} at {start} (skipped)", head.name),
            }
            if head.size == u64::MAX || (movie.is_some() && media_data.is_some()) {
                break;
            }
            let next = start.checked_add(size).ok_or(Error::InvalidData("box extends past u64 offsets"))?;
            seek_to(&mut source, next)?;
        }

        let MovieBox { header, mut tracks, metadata, redirect_urls } = movie.ok_or(Error::NoMoov)?;
        track::resolve_deferred(&mut source, &mut tracks, config)?;
        debug!("opened: {} tracks, timescale {}, duration {}", tracks.len(), header.timescale, header.duration);

        Ok(Self {
            source,
            config: config.clone(),
            file_type,
            media_data,
            movie: header,
            tracks,
            metadata,
            redirect_urls,
            decryptor: None,
            rate: 1000,
        })
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn tracks(&self) -> &[Track] {
        self.tracks.as_slice()
    }

    pub(crate) fn track_ref(&self, index: usize) -> Result<&Track> {
        self.tracks.get(index).ok_or(Error::InvalidArgument("no such track"))
    }

    pub(crate) fn track_mut(&mut self, index: usize) -> Result<&mut Track> {
        self.tracks.get_mut(index).ok_or(Error::InvalidArgument("no such track"))
    }

    pub fn movie_header(&self) -> &MovieHeader {
        &self.movie
    }

    /// Movie duration in microseconds.
    pub fn duration_us(&self) -> u64 {
        scale_time(self.movie.duration, self.movie.timescale, 1_000_000)
    }

    pub fn file_type(&self) -> Option<&FileTypeBox> {
        self.file_type.as_ref()
    }

    pub fn major_brand(&self) -> Option<FourCC> {
        self.file_type.as_ref().map(|f| f.major_brand)
    }

    pub fn media_data(&self) -> Option<MediaDataExtent> {
        self.media_data
    }

    pub fn metadata(&self) -> &MediaMetadata {
        &self.metadata
    }

    pub fn metadata_field(&self, field: MetadataField) -> Option<&MetadataText> {
        self.metadata.get(field)
    }

    pub fn cover_art(&self) -> Option<CoverArt> {
        self.metadata.cover_art
    }

    /// Read the cover art image bytes from the file.
    pub fn read_cover_art(&mut self) -> Result<Option<TryVec<u8>>> {
        let Some(art) = self.metadata.cover_art else {
            return Ok(None);
        };
        let len: usize = art.size.try_into()?;
        let mut buf = std::vec::Vec::new();
        buf.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
        buf.resize(len, 0);
        read_exact_at(&mut self.source, art.offset, &mut buf)?;
        Ok(Some(buf.into()))
    }

    /// URLs collected from reference movie (`rmra`) redirects.
    pub fn redirect_urls(&self) -> &[TryString] {
        &self.redirect_urls
    }

    /// The first URL embedded in a data reference or a streaming hint track.
    pub fn embedded_url(&self) -> Option<&[u8]> {
        self.tracks.iter().find_map(|t| t.embedded_url.as_deref())
    }

    /// Decoder configuration of the track's first sample description.
    pub fn decoder_config(&self, track: usize) -> Result<&[u8]> {
        let track = self.track_ref(track)?;
        let desc = track.descriptions.first().ok_or(Error::Unsupported("track has no sample description"))?;
        Ok(&desc.decoder_config)
    }

    /// Size in bytes of the NAL unit length prefix of an AVC track.
    pub fn nal_length_size(&self, track: usize) -> Result<u8> {
        let track = self.track_ref(track)?;
        track
            .descriptions
            .iter()
            .find_map(|d| d.avc.as_ref())
            .map(|avc| avc.nal_length_size)
            .ok_or(Error::Unsupported("not an AVC track"))
    }

    pub fn aac_config(&self, track: usize) -> Result<Option<&AacConfig>> {
        let track = self.track_ref(track)?;
        Ok(track.descriptions.iter().find_map(|d| d.aac.as_ref()))
    }

    /// Install the decrypt hook applied to access units of protected tracks.
    pub fn set_decryptor<D: Decryptor + 'static>(&mut self, decryptor: D) {
        self.decryptor = Some(std::boxed::Box::new(decryptor));
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    pub fn into_source(self) -> S {
        self.source
    }
}

/// Rescale `value` from one timescale to another without intermediate overflow.
pub(crate) fn scale_time(value: u64, from: u32, to: u32) -> u64 {
    if from == 0 {
        return 0;
    }
    let scaled = u128::from(value) * u128::from(to) / u128::from(from);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Skip a number of bytes that we don't care to parse.
fn skip<T: Read>(src: &mut T, bytes: u64) -> Result<()> {
    let copied = std::io::copy(&mut src.take(bytes), &mut std::io::sink())?;
    if copied < bytes {
        return Err(Error::UnexpectedEOF);
    }
    Ok(())
}

fn be_i16<T: ReadBytesExt>(src: &mut T) -> Result<i16> {
    src.read_i16::<byteorder::BigEndian>().map_err(From::from)
}

fn be_i32<T: ReadBytesExt>(src: &mut T) -> Result<i32> {
    src.read_i32::<byteorder::BigEndian>().map_err(From::from)
}

fn be_i64<T: ReadBytesExt>(src: &mut T) -> Result<i64> {
    src.read_i64::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u24<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u24::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::BigEndian>().map_err(From::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn boxed(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
        let mut out = std::vec::Vec::new();
        out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn header_rejects_wide_size_outside_mdat() {
        let mut data = Cursor::new(b"\x00\x00\x00\x01moov\x00\x00\x00\x00\x00\x00\x00\x20".to_vec());
        assert!(matches!(read_box_header(&mut data), Err(Error::InvalidData(_))));

        let mut data = Cursor::new(b"\x00\x00\x00\x01mdat\x00\x00\x00\x00\x00\x00\x00\x20".to_vec());
        let head = read_box_header(&mut data).unwrap();
        assert_eq!(head.size, 32);
        assert_eq!(head.offset, 16);
    }

    #[test]
    fn header_rejects_short_and_open_ended_sizes() {
        let mut data = Cursor::new(b"\x00\x00\x00\x04free".to_vec());
        assert!(matches!(read_box_header(&mut data), Err(Error::InvalidData(_))));

        let mut data = Cursor::new(b"\x00\x00\x00\x00trak".to_vec());
        assert!(matches!(read_box_header(&mut data), Err(Error::InvalidData(_))));

        let mut data = Cursor::new(b"\x00\x00\x00\x00mdat".to_vec());
        assert_eq!(read_box_header(&mut data).unwrap().size, u64::MAX);
    }

    #[test]
    fn walker_consumes_whole_payload() {
        let mut payload = boxed(b"free", &[0; 5]);
        payload.extend(boxed(b"skip", &[]));
        payload.extend_from_slice(&[0, 0, 0]); // trailing bytes shorter than a header
        let outer = boxed(b"udta", &payload);

        let mut cursor = Cursor::new(outer);
        let mut iter = BoxIter::new(&mut cursor);
        let mut b = iter.next_box().unwrap().unwrap();
        let mut seen = std::vec::Vec::new();
        let consumed = walk_children(&mut b, |child| {
            seen.push(child.head.name);
            Ok(())
        })
        .unwrap();
        assert_eq!(consumed, payload.len() as u64);
        assert_eq!(seen, [BoxType::FreeSpaceBox, BoxType::SkipBox]);
        assert_eq!(b.bytes_left(), 0);
    }

    #[test]
    fn walker_rejects_oversized_child() {
        let mut payload = (64u32).to_be_bytes().to_vec();
        payload.extend_from_slice(b"free");
        let outer = boxed(b"udta", &payload);

        let mut cursor = Cursor::new(outer);
        let mut iter = BoxIter::new(&mut cursor);
        let mut b = iter.next_box().unwrap().unwrap();
        assert!(matches!(walk_children(&mut b, |_| Ok(())), Err(Error::InvalidData(_))));
    }

    #[test]
    fn optional_failures_are_contained() {
        let contained = recover_optional::<()>(BoxType::UserDataBox, Err(Error::InvalidData("bad")));
        assert!(matches!(contained, Ok(None)));
        let fatal = recover_optional::<()>(BoxType::UserDataBox, Err(Error::NotReady));
        assert!(matches!(fatal, Err(Error::NotReady)));
    }

    #[test]
    fn time_scaling_does_not_overflow() {
        assert_eq!(scale_time(102_400, 48_000, 1_000_000), 2_133_333);
        assert_eq!(scale_time(u64::MAX / 2, 1, 1_000_000), u64::MAX);
        assert_eq!(scale_time(5, 0, 1000), 0);
    }
}
