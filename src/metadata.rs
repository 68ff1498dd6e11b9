// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Title, artist and cover art from `udta`, `meta/ilst`, 3GPP asset boxes
//! and embedded ID3v2 tags.
//!
//! Metadata is best effort: a malformed box is logged and skipped, and
//! whatever was read before the failure is kept.

use std::io::{Read, Take};

use arrayvec::ArrayVec;
use log::debug;

use crate::boxes::BoxType;
use crate::{
    be_u16, be_u24, be_u32, read_fullbox_extra, skip, walk_children, BMFFBox, Error, Offset, Result, TryVec,
};

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct String;

/// Character encoding of a [`MetadataText`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    /// UTF-16 little endian, byte order mark removed.
    Utf16Le,
}

/// A metadata string as stored in the file, capped at `max_metadata_len` bytes.
#[derive(Debug, PartialEq)]
pub struct MetadataText {
    pub bytes: TryVec<u8>,
    pub charset: Charset,
}

impl MetadataText {
    fn utf8(raw: &[u8], max_len: u32) -> Result<Self> {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let raw = &raw[..end.min(max_len.try_into()?)];
        let mut bytes = TryVec::with_capacity(raw.len())?;
        bytes.extend_from_slice(raw)?;
        Ok(Self { bytes, charset: Charset::Utf8 })
    }

    fn utf16le(raw: &[u8], max_len: u32) -> Result<Self> {
        let end = raw
            .chunks_exact(2)
            .position(|pair| pair == [0, 0])
            .map_or(raw.len() & !1, |units| units * 2);
        let cap = usize::try_from(max_len)? & !1;
        let raw = &raw[..end.min(cap)];
        let mut bytes = TryVec::with_capacity(raw.len())?;
        bytes.extend_from_slice(raw)?;
        Ok(Self { bytes, charset: Charset::Utf16Le })
    }

    /// Decode to a Rust string, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> std::string::String {
        match self.charset {
            Charset::Utf8 => std::string::String::from_utf8_lossy(&self.bytes).into_owned(),
            Charset::Utf16Le => {
                let units = self.bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
                char::decode_utf16(units)
                    .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect()
            },
        }
    }
}

/// Location of an embedded cover image. The image bytes are never copied at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverArt {
    /// Absolute offset of the first image byte.
    pub offset: u64,
    pub size: u64,
}

/// Text fields of [`MediaMetadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    Title,
    Artist,
    AlbumArtist,
    Album,
    Genre,
    Year,
    Composer,
    Copyright,
}

/// Descriptive metadata gathered from every metadata box in the movie.
/// When several boxes carry the same field, the last one read wins.
#[derive(Debug, Default)]
pub struct MediaMetadata {
    pub title: Option<MetadataText>,
    pub artist: Option<MetadataText>,
    pub album_artist: Option<MetadataText>,
    pub album: Option<MetadataText>,
    pub genre: Option<MetadataText>,
    pub year: Option<MetadataText>,
    pub composer: Option<MetadataText>,
    pub copyright: Option<MetadataText>,
    pub track_number: Option<u32>,
    pub total_tracks: Option<u32>,
    pub cover_art: Option<CoverArt>,
}

impl MediaMetadata {
    pub fn get(&self, field: MetadataField) -> Option<&MetadataText> {
        match field {
            MetadataField::Title => self.title.as_ref(),
            MetadataField::Artist => self.artist.as_ref(),
            MetadataField::AlbumArtist => self.album_artist.as_ref(),
            MetadataField::Album => self.album.as_ref(),
            MetadataField::Genre => self.genre.as_ref(),
            MetadataField::Year => self.year.as_ref(),
            MetadataField::Composer => self.composer.as_ref(),
            MetadataField::Copyright => self.copyright.as_ref(),
        }
    }

    fn slot(&mut self, field: MetadataField) -> &mut Option<MetadataText> {
        match field {
            MetadataField::Title => &mut self.title,
            MetadataField::Artist => &mut self.artist,
            MetadataField::AlbumArtist => &mut self.album_artist,
            MetadataField::Album => &mut self.album,
            MetadataField::Genre => &mut self.genre,
            MetadataField::Year => &mut self.year,
            MetadataField::Composer => &mut self.composer,
            MetadataField::Copyright => &mut self.copyright,
        }
    }

    fn set(&mut self, field: MetadataField, text: MetadataText) {
        *self.slot(field) = Some(text);
    }
}

/// Log and drop a metadata failure. I/O errors still propagate.
fn swallow(name: BoxType, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            debug!("ignoring malformed {name:?} metadata: {e}");
            Ok(())
        },
        Ok(()) => Ok(()),
    }
}

/// Read up to `max_len` bytes of what is left in `src`.
fn read_capped<T: Read>(src: &mut T, available: u64, max_len: u64) -> Result<TryVec<u8>> {
    let len = available.min(max_len);
    let mut buf = std::vec::Vec::new();
    buf.try_reserve_exact(len.try_into()?).map_err(|_| Error::OutOfMemory)?;
    src.by_ref().take(len).read_to_end(&mut buf)?;
    Ok(buf.into())
}

/// Parse a udta box and its metadata children.
pub(crate) fn read_udta<T: Read + Offset>(src: &mut BMFFBox<'_, T>, meta: &mut MediaMetadata, max_len: u32) -> Result<()> {
    walk_children(src, |b| {
        let name = b.head.name;
        let result = match name {
            BoxType::MetadataBox => read_meta(b, meta, max_len, false),
            BoxType::TitleBox
            | BoxType::CopyrightBox
            | BoxType::PerformerBox
            | BoxType::GenreBox
            | BoxType::AuthorBox
            | BoxType::AlbumBox
            | BoxType::RecordingYearBox => read_asset_text(b, meta, max_len),
            _ => Ok(()),
        };
        swallow(name, result)
    })?;
    Ok(())
}

/// Parse a meta box holding `ilst` and `ID32` children.
///
/// A moov-level meta is only trusted when its version and flags are zero.
pub(crate) fn read_meta<T: Read + Offset>(
    src: &mut BMFFBox<'_, T>,
    meta: &mut MediaMetadata,
    max_len: u32,
    require_plain_header: bool,
) -> Result<()> {
    let (version, flags) = read_fullbox_extra(src)?;
    if require_plain_header && (version != 0 || flags != 0) {
        debug!("skipping meta with version {version} flags {flags:#x}");
        return Ok(());
    }
    walk_children(src, |b| {
        let name = b.head.name;
        let result = match name {
            BoxType::MetadataItemListBox => read_ilst(b, meta, max_len),
            BoxType::Id3v2Box => read_id32(b, meta, max_len),
            _ => Ok(()),
        };
        swallow(name, result)
    })?;
    Ok(())
}

fn ilst_field(item: BoxType) -> Option<MetadataField> {
    Some(match item {
        BoxType::NameItemBox => MetadataField::Title,
        BoxType::ArtistItemBox => MetadataField::Artist,
        BoxType::AlbumArtistItemBox => MetadataField::AlbumArtist,
        BoxType::AlbumItemBox => MetadataField::Album,
        BoxType::GenreItemBox => MetadataField::Genre,
        BoxType::DateItemBox => MetadataField::Year,
        BoxType::ComposerItemBox => MetadataField::Composer,
        _ => return None,
    })
}

fn read_ilst<T: Read + Offset>(src: &mut BMFFBox<'_, T>, meta: &mut MediaMetadata, max_len: u32) -> Result<()> {
    walk_children(src, |item| {
        let name = item.head.name;
        let result = walk_children(item, |data| {
            if data.head.name != BoxType::MetadataDataBox {
                return Ok(());
            }
            swallow(name, read_ilst_data(name, data, meta, max_len))
        });
        swallow(name, result.map(drop))
    })?;
    Ok(())
}

fn read_ilst_data<T: Read + Offset>(
    item: BoxType,
    src: &mut BMFFBox<'_, T>,
    meta: &mut MediaMetadata,
    max_len: u32,
) -> Result<()> {
    // type indicator and locale
    skip(src, 8)?;
    match item {
        BoxType::TrackNumberItemBox => {
            let mut raw = [0u8; 6];
            src.read_exact(&mut raw)?;
            let number = u16::from_be_bytes([raw[2], raw[3]]);
            let total = u16::from_be_bytes([raw[4], raw[5]]);
            meta.track_number = (number != 0).then_some(u32::from(number));
            meta.total_tracks = (total != 0).then_some(u32::from(total));
        },
        BoxType::CoverArtItemBox => {
            let size = src.bytes_left();
            if size > 0 {
                meta.cover_art = Some(CoverArt { offset: src.offset(), size });
            }
        },
        _ => {
            if let Some(field) = ilst_field(item) {
                let left = src.bytes_left();
                let raw = read_capped(src, left, u64::from(max_len))?;
                meta.set(field, MetadataText::utf8(&raw, max_len)?);
            }
        },
    }
    Ok(())
}

/// Decode a 3GPP asset string: byte order mark FF FE selects UTF-16LE,
/// FE FF is unsupported, anything else is UTF-8.
fn decode_asset_string(raw: &[u8], max_len: u32) -> Result<Option<MetadataText>> {
    match raw {
        [0xfe, 0xff, ..] => {
            debug!("big endian UTF-16 asset string (skipped)");
            Ok(None)
        },
        [0xff, 0xfe, rest @ ..] => MetadataText::utf16le(rest, max_len).map(Some),
        _ => MetadataText::utf8(raw, max_len).map(Some),
    }
}

/// Parse a 3GPP asset information box (`titl`, `cprt`, `perf`, `gnre`, `auth`, `albm`, `yrrc`).
///
/// See 3GPP TS 26.244 § 8
fn read_asset_text<T: Read>(src: &mut BMFFBox<'_, T>, meta: &mut MediaMetadata, max_len: u32) -> Result<()> {
    let name = src.head.name;
    read_fullbox_extra(src)?;

    if name == BoxType::RecordingYearBox {
        if src.bytes_left() != 2 {
            return Err(Error::InvalidData("yrrc must hold a 16-bit year"));
        }
        let year = be_u16(src)?.to_string();
        meta.set(MetadataField::Year, MetadataText::utf8(year.as_bytes(), max_len)?);
        return Ok(());
    }

    // pad bit and packed ISO-639-2/T language
    skip(src, 2)?;
    let left = src.bytes_left();
    let mut raw = read_capped(src, left, u64::from(max_len) + 2)?;

    let field = match name {
        BoxType::TitleBox => MetadataField::Title,
        BoxType::CopyrightBox => MetadataField::Copyright,
        BoxType::PerformerBox => MetadataField::Artist,
        BoxType::GenreBox => MetadataField::Genre,
        BoxType::AuthorBox => MetadataField::AlbumArtist,
        BoxType::AlbumBox => {
            // optional trailing track number after the terminated title
            if let [.., 0, track] = raw[..] {
                if track != 0 {
                    meta.track_number = Some(u32::from(track));
                    raw.pop();
                }
            }
            MetadataField::Album
        },
        _ => return Ok(()),
    };
    if let Some(text) = decode_asset_string(&raw, max_len)? {
        meta.set(field, text);
    }
    Ok(())
}

/// What an allow-listed ID3 frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Id3Frame {
    Text(MetadataField),
    TrackNumber,
    Picture,
}

fn id3_frame_kind(id: &[u8]) -> Option<Id3Frame> {
    Some(match id {
        b"TP1" | b"TPE1" => Id3Frame::Text(MetadataField::Artist),
        b"TP2" | b"TPE2" => Id3Frame::Text(MetadataField::AlbumArtist),
        b"TAL" | b"TALB" => Id3Frame::Text(MetadataField::Album),
        b"TCO" | b"TCON" => Id3Frame::Text(MetadataField::Genre),
        b"TT2" | b"TIT2" => Id3Frame::Text(MetadataField::Title),
        b"TCM" | b"TCOM" => Id3Frame::Text(MetadataField::Composer),
        b"TYE" | b"TYER" | b"TDRC" => Id3Frame::Text(MetadataField::Year),
        b"TCR" | b"TCOP" => Id3Frame::Text(MetadataField::Copyright),
        b"TRK" | b"TRCK" => Id3Frame::TrackNumber,
        b"PIC" | b"APIC" => Id3Frame::Picture,
        _ => return None,
    })
}

fn syncsafe(raw: [u8; 4]) -> u32 {
    raw.iter().fold(0, |acc, &b| (acc << 7) | u32::from(b & 0x7f))
}

/// Parse an `ID32` box: an ID3v2 tag stored inside the movie.
///
/// See ID3 tag version 2.3.0 § 3
fn read_id32<T: Read + Offset>(src: &mut BMFFBox<'_, T>, meta: &mut MediaMetadata, max_len: u32) -> Result<()> {
    // version, flags, then pad bit and language
    skip(src, 6)?;
    let mut header = [0u8; 10];
    src.read_exact(&mut header)?;
    if &header[..3] != b"ID3" {
        return Err(Error::InvalidData("ID32 box without an ID3 header"));
    }
    let major = header[3];
    if !(2..=4).contains(&major) {
        return Err(Error::Unsupported("unknown ID3 major version"));
    }
    let flags = header[5];
    let tag_size = u64::from(syncsafe([header[6], header[7], header[8], header[9]]));
    if tag_size > src.bytes_left() {
        return Err(Error::InvalidData("ID3 tag exceeds its box"));
    }
    let mut remaining = tag_size;

    if major >= 3 && flags & 0x40 != 0 {
        // v2.3 counts the size field out of the extended header, v2.4 counts it in
        let mut raw = [0u8; 4];
        src.read_exact(&mut raw)?;
        let ext_len = if major == 3 {
            u64::from(u32::from_be_bytes(raw))
        } else {
            u64::from(syncsafe(raw)).saturating_sub(4)
        };
        remaining = remaining.checked_sub(4 + ext_len).ok_or(Error::InvalidData("ID3 extended header too long"))?;
        skip(src, ext_len)?;
    }

    let (id_len, header_len) = if major == 2 { (3, 6) } else { (4, 10) };
    while remaining >= header_len {
        let mut raw_id = [0u8; 4];
        src.read_exact(&mut raw_id[..id_len])?;
        let id: ArrayVec<u8, 4> = raw_id[..id_len].iter().copied().collect();
        let size = match major {
            2 => u64::from(be_u24(src)?),
            3 => u64::from(be_u32(src)?),
            _ => u64::from(syncsafe(be_u32(src)?.to_be_bytes())),
        };
        if major > 2 {
            skip(src, 2)?; // frame flags
        }
        remaining -= header_len;
        if id[0] == 0 {
            // padding
            break;
        }
        if size > remaining {
            debug!("truncated ID3 frame {:?}", std::string::String::from_utf8_lossy(&id));
            break;
        }
        remaining -= size;

        let frame_start = src.offset();
        let mut frame = Read::take(&mut *src, size);
        if let Some(kind) = id3_frame_kind(&id) {
            let result = read_id3_frame(kind, major, &mut frame, frame_start, size, meta, max_len);
            if let Err(e) = result {
                if e.is_fatal() {
                    return Err(e);
                }
                debug!("ignoring ID3 frame {:?}: {e}", std::string::String::from_utf8_lossy(&id));
            }
        }
        let rest = frame.limit();
        skip(&mut frame, rest)?;
    }
    Ok(())
}

/// Consume a NUL-terminated string; UTF-16 strings end at a 00 00 pair.
fn skip_terminated<R: Read>(src: &mut R, wide: bool) -> Result<()> {
    let mut unit = [0u8; 2];
    let width = if wide { 2 } else { 1 };
    loop {
        src.read_exact(&mut unit[..width])?;
        if unit[..width].iter().all(|&b| b == 0) {
            return Ok(());
        }
    }
}

fn read_id3_frame<R: Read>(
    kind: Id3Frame,
    major: u8,
    frame: &mut Take<R>,
    frame_start: u64,
    size: u64,
    meta: &mut MediaMetadata,
    max_len: u32,
) -> Result<()> {
    let mut encoding = [0u8; 1];
    frame.read_exact(&mut encoding)?;
    let wide = match encoding[0] {
        0 => false,
        1 => true,
        other => {
            debug!("unsupported ID3 text encoding {other}");
            return Ok(());
        },
    };

    if kind == Id3Frame::Picture {
        if major == 2 {
            // PIC: three-byte image format and picture type
            skip(frame, 4)?;
        } else {
            skip_terminated(frame, false)?; // MIME type
            skip(frame, 1)?; // picture type
        }
        skip_terminated(frame, wide)?; // description
        let image_size = frame.limit();
        if image_size > 0 {
            let offset = frame_start + (size - image_size);
            meta.cover_art = Some(CoverArt { offset, size: image_size });
        }
        return Ok(());
    }

    let left = frame.limit();
    let raw = read_capped(frame, left, u64::from(max_len) + 2)?;
    let text = if wide {
        match raw[..] {
            [0xff, 0xfe, ..] => MetadataText::utf16le(&raw[2..], max_len)?,
            _ => {
                debug!("UTF-16 ID3 frame without a little endian byte order mark");
                return Ok(());
            },
        }
    } else {
        MetadataText::utf8(&raw, max_len)?
    };

    match kind {
        Id3Frame::Text(field) => meta.set(field, text),
        Id3Frame::TrackNumber => {
            let (number, total) = match text.charset {
                Charset::Utf8 => parse_track_number(&text.bytes),
                Charset::Utf16Le => parse_track_number(&narrow_utf16le(&text.bytes)?),
            };
            meta.track_number = number;
            meta.total_tracks = total;
        },
        _ => {},
    }
    Ok(())
}

/// ASCII bytes of UTF-16LE text; other characters become `?`.
fn narrow_utf16le(wide: &[u8]) -> Result<TryVec<u8>> {
    let mut out = TryVec::with_capacity(wide.len() / 2)?;
    for pair in wide.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        out.push(u8::try_from(unit).ok().filter(u8::is_ascii).unwrap_or(b'?'))?;
    }
    Ok(out)
}

/// Parse "N" or "N/M". Any other character clears both numbers.
fn parse_track_number(text: &[u8]) -> (Option<u32>, Option<u32>) {
    fn number(digits: &[u8]) -> Option<u32> {
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        std::str::from_utf8(digits).ok()?.parse().ok()
    }
    let mut parts = text.splitn(2, |&b| b == b'/');
    let first = parts.next().unwrap_or_default();
    match parts.next() {
        None => (number(first), None),
        Some(second) => match (number(first), number(second)) {
            (Some(n), Some(m)) => (Some(n), Some(m)),
            _ => (None, None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxIter;
    use std::io::Cursor;

    fn boxed(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
        let mut out = std::vec::Vec::new();
        out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(payload);
        out
    }

    fn parse_udta(payload: &[u8]) -> MediaMetadata {
        let mut cursor = Cursor::new(boxed(b"udta", payload));
        let mut iter = BoxIter::new(&mut cursor);
        let mut b = iter.next_box().unwrap().unwrap();
        let mut meta = MediaMetadata::default();
        read_udta(&mut b, &mut meta, 1024).unwrap();
        meta
    }

    fn id3_tag(frames: &[u8]) -> std::vec::Vec<u8> {
        let mut out = vec![0, 0, 0, 0, 0x15, 0xc7]; // full box, language
        out.extend_from_slice(b"ID3\x03\x00\x00");
        let len = frames.len() as u32;
        out.extend_from_slice(&[(len >> 21) as u8 & 0x7f, (len >> 14) as u8 & 0x7f, (len >> 7) as u8 & 0x7f, len as u8 & 0x7f]);
        out.extend_from_slice(frames);
        out
    }

    fn id3_frame(id: &[u8; 4], body: &[u8]) -> std::vec::Vec<u8> {
        let mut out = id.to_vec();
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn id3v23_utf8_title() {
        let tag = id3_tag(&id3_frame(b"TIT2", b"\x00Hello"));
        let mut meta_payload = vec![0, 0, 0, 0];
        meta_payload.extend(boxed(b"ID32", &tag));
        let meta = parse_udta(&boxed(b"meta", &meta_payload));
        let title = meta.title.unwrap();
        assert_eq!(&title.bytes[..], b"Hello");
        assert_eq!(title.charset, Charset::Utf8);
    }

    #[test]
    fn id3_utf16_needs_little_endian_bom() {
        let mut frames = id3_frame(b"TPE1", b"\x01\xff\xfeA\x00B\x00\x00\x00");
        frames.extend(id3_frame(b"TALB", b"\x01\xfe\xff\x00A"));
        frames.extend(id3_frame(b"TRCK", b"\x003/12"));
        let mut meta_payload = vec![0, 0, 0, 0];
        meta_payload.extend(boxed(b"ID32", &id3_tag(&frames)));
        let meta = parse_udta(&boxed(b"meta", &meta_payload));

        let artist = meta.artist.unwrap();
        assert_eq!(artist.charset, Charset::Utf16Le);
        assert_eq!(artist.to_string_lossy(), "AB");
        assert!(meta.album.is_none());
        assert_eq!(meta.track_number, Some(3));
        assert_eq!(meta.total_tracks, Some(12));
    }

    #[test]
    fn apic_records_image_location() {
        let frame = id3_frame(b"APIC", b"\x00image/png\x00\x03cover\x00PNGDATA");
        let mut meta_payload = vec![0, 0, 0, 0];
        meta_payload.extend(boxed(b"ID32", &id3_tag(&frame)));
        let udta = boxed(b"udta", &boxed(b"meta", &meta_payload));

        let mut cursor = Cursor::new(udta.clone());
        let mut iter = BoxIter::new(&mut cursor);
        let mut b = iter.next_box().unwrap().unwrap();
        let mut meta = MediaMetadata::default();
        read_udta(&mut b, &mut meta, 1024).unwrap();

        let art = meta.cover_art.unwrap();
        assert_eq!(art.size, 7);
        let start = art.offset as usize;
        assert_eq!(&udta[start..start + 7], b"PNGDATA");
    }

    #[test]
    fn ilst_items() {
        let mut ilst = boxed(b"\xa9nam", &boxed(b"data", b"\x00\x00\x00\x01\x00\x00\x00\x00Song"));
        ilst.extend(boxed(b"trkn", &boxed(b"data", b"\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x05\x00\x09\x00\x00")));
        ilst.extend(boxed(b"covr", &boxed(b"data", b"\x00\x00\x00\x0d\x00\x00\x00\x00JPEG")));
        let mut meta_payload = vec![0, 0, 0, 0];
        meta_payload.extend(boxed(b"ilst", &ilst));
        let meta = parse_udta(&boxed(b"meta", &meta_payload));

        assert_eq!(&meta.title.unwrap().bytes[..], b"Song");
        assert_eq!(meta.track_number, Some(5));
        assert_eq!(meta.total_tracks, Some(9));
        assert_eq!(meta.cover_art.unwrap().size, 4);
    }

    #[test]
    fn asset_strings() {
        let mut udta = boxed(b"titl", b"\x00\x00\x00\x00\x15\xc7Title\x00");
        udta.extend(boxed(b"perf", b"\x00\x00\x00\x00\x15\xc7\xff\xfeS\x00i\x00"));
        udta.extend(boxed(b"gnre", b"\x00\x00\x00\x00\x15\xc7\xfe\xff\x00R\x00k"));
        udta.extend(boxed(b"albm", b"\x00\x00\x00\x00\x15\xc7Album\x00\x07"));
        udta.extend(boxed(b"yrrc", b"\x00\x00\x00\x00\x07\xd5"));
        let meta = parse_udta(&udta);

        assert_eq!(&meta.title.unwrap().bytes[..], b"Title");
        assert_eq!(meta.artist.unwrap().to_string_lossy(), "Si");
        assert!(meta.genre.is_none());
        assert_eq!(&meta.album.unwrap().bytes[..], b"Album");
        assert_eq!(meta.track_number, Some(7));
        assert_eq!(&meta.year.unwrap().bytes[..], b"2005");
    }

    #[test]
    fn short_asset_strings_honour_the_bom() {
        let mut udta = boxed(b"cprt", b"\x00\x00\x00\x00\x15\xc7\xff\xfeA");
        udta.extend(boxed(b"gnre", b"\x00\x00\x00\x00\x15\xc7\xfe\xff\x00"));
        udta.extend(boxed(b"auth", b"\x00\x00\x00\x00\x15\xc7\xff\xfe"));
        let meta = parse_udta(&udta);

        let copyright = meta.copyright.unwrap();
        assert_eq!(copyright.charset, Charset::Utf16Le);
        assert!(copyright.bytes.is_empty());
        assert!(meta.genre.is_none());
        assert_eq!(meta.album_artist.unwrap().charset, Charset::Utf16Le);
    }

    #[test]
    fn utf16_track_number() {
        let frames = id3_frame(b"TRCK", b"\x01\xff\xfe5\x00/\x002\x000\x00");
        let mut meta_payload = vec![0, 0, 0, 0];
        meta_payload.extend(boxed(b"ID32", &id3_tag(&frames)));
        let meta = parse_udta(&boxed(b"meta", &meta_payload));
        assert_eq!(meta.track_number, Some(5));
        assert_eq!(meta.total_tracks, Some(20));

        assert_eq!(&narrow_utf16le(b"7\x00\xe9\x00").unwrap()[..], b"7?");
    }

    #[test]
    fn malformed_box_keeps_earlier_fields() {
        let mut udta = boxed(b"titl", b"\x00\x00\x00\x00\x15\xc7Kept");
        udta.extend(boxed(b"yrrc", b"\x00\x00\x00\x00\x07"));
        let meta = parse_udta(&udta);
        assert_eq!(&meta.title.unwrap().bytes[..], b"Kept");
        assert!(meta.year.is_none());
    }

    #[test]
    fn text_is_capped() {
        let text = MetadataText::utf8(b"abcdefgh", 3).unwrap();
        assert_eq!(&text.bytes[..], b"abc");
        let wide = MetadataText::utf16le(b"a\x00b\x00c\x00", 5).unwrap();
        assert_eq!(&wide.bytes[..], b"a\x00b\x00");
    }

    #[test]
    fn track_number_text() {
        assert_eq!(parse_track_number(b"4"), (Some(4), None));
        assert_eq!(parse_track_number(b"4/10"), (Some(4), Some(10)));
        assert_eq!(parse_track_number(b"4 of 10"), (None, None));
        assert_eq!(parse_track_number(b"4/x"), (None, None));
    }
}
