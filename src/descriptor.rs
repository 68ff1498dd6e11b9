// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codec configuration records: MPEG-4 elementary stream descriptors, AVC
//! decoder configuration, and the AAC AudioSpecificConfig.

use std::io::{Cursor, Read};

use bitreader::BitReader;
use byteorder::ReadBytesExt;
use log::{debug, warn};

use crate::track::CodecType;
use crate::{be_u16, be_u24, be_u32, read_fullbox_extra, skip, BMFFBox, Error, Result, ToUsize, TryVec};

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;

/// Largest esds payload buffered for parsing.
const MAX_ESDS_SIZE: u64 = 64 * 1024;

const ES_DESCRIPTOR_TAG: u8 = 0x03;
const DECODER_CONFIG_TAG: u8 = 0x04;
const DECODER_SPECIFIC_TAG: u8 = 0x05;

/// Object type indications, ISO 14496-1 Table 5 plus the 3GPP2 registrations.
pub(crate) const OBJECT_MPEG4_VISUAL: u8 = 0x20;
pub(crate) const OBJECT_MPEG4_AUDIO: u8 = 0x40;
const OBJECT_MPEG2_AAC_MAIN: u8 = 0x66;
const OBJECT_MPEG2_AAC_LC: u8 = 0x67;
const OBJECT_MPEG2_AAC_SSR: u8 = 0x68;
pub(crate) const OBJECT_EVRC: u8 = 0xD1;
pub(crate) const OBJECT_QCELP: u8 = 0xE1;

pub(crate) const STREAM_TYPE_VISUAL: u8 = 0x04;
pub(crate) const STREAM_TYPE_AUDIO: u8 = 0x05;

/// Parsed `esds` contents.
///
/// See ISO 14496-1:2010 § 7.2.6.5
#[derive(Debug, Default, PartialEq)]
pub struct EsDescriptor {
    pub es_id: u16,
    pub object_type: u8,
    pub stream_type: u8,
    pub buffer_size: u32,
    pub max_bitrate: u32,
    pub avg_bitrate: u32,
    pub decoder_specific_info: TryVec<u8>,
}

/// Parse an esds box.
pub(crate) fn read_esds<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<EsDescriptor> {
    let (version, _) = read_fullbox_extra(src)?;
    if version != 0 {
        return Err(Error::Unsupported("unknown esds version"));
    }
    let data = src.read_into_try_vec(MAX_ESDS_SIZE)?;
    parse_es_descriptor(&data)
}

/// Read an expandable descriptor length: up to four 7-bit groups, most significant first.
fn read_descriptor_length<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    let mut len = 0u32;
    for _ in 0..4 {
        let b = src.read_u8()?;
        len = (len << 7) | u32::from(b & 0x7f);
        if b & 0x80 == 0 {
            return Ok(len);
        }
    }
    Err(Error::InvalidData("descriptor length longer than four bytes"))
}

/// Read one descriptor header and return its tag with its body.
fn next_descriptor<'a>(data: &mut &'a [u8]) -> Result<(u8, &'a [u8])> {
    let mut cursor = Cursor::new(*data);
    let tag = cursor.read_u8()?;
    let len = read_descriptor_length(&mut cursor)?.to_usize();
    let start = usize::try_from(cursor.position())?;
    let body = data.get(start..start + len).ok_or(Error::InvalidData("descriptor exceeds esds"))?;
    *data = &data[start + len..];
    Ok((tag, body))
}

pub(crate) fn parse_es_descriptor(data: &[u8]) -> Result<EsDescriptor> {
    let mut esds = EsDescriptor::default();
    let mut remains = data;
    let (tag, body) = next_descriptor(&mut remains)?;
    if tag != ES_DESCRIPTOR_TAG {
        return Err(Error::InvalidData("esds does not start with an ES_Descriptor"));
    }

    let des = &mut Cursor::new(body);
    esds.es_id = be_u16(des)?;
    let flags = des.read_u8()?;
    // streamDependenceFlag
    if flags & 0x80 != 0 {
        skip(des, 2)?;
    }
    // URL_Flag
    if flags & 0x40 != 0 {
        let url_len = des.read_u8()?;
        skip(des, u64::from(url_len))?;
    }
    // OCRstreamFlag
    if flags & 0x20 != 0 {
        skip(des, 2)?;
    }

    let mut children = &body[usize::try_from(des.position())?..];
    while !children.is_empty() {
        let (tag, body) = next_descriptor(&mut children)?;
        match tag {
            DECODER_CONFIG_TAG => read_decoder_config(body, &mut esds)?,
            _ => debug!("Unsupported descriptor, tag {tag}"),
        }
    }
    Ok(esds)
}

/// See ISO 14496-1:2010 § 7.2.6.6
fn read_decoder_config(data: &[u8], esds: &mut EsDescriptor) -> Result<()> {
    let des = &mut Cursor::new(data);
    esds.object_type = des.read_u8()?;
    esds.stream_type = des.read_u8()? >> 2;
    esds.buffer_size = be_u24(des)?;
    esds.max_bitrate = be_u32(des)?;
    esds.avg_bitrate = be_u32(des)?;

    let mut children = &data[usize::try_from(des.position())?..];
    while !children.is_empty() {
        let (tag, body) = next_descriptor(&mut children)?;
        if tag == DECODER_SPECIFIC_TAG {
            esds.decoder_specific_info = TryVec::new();
            esds.decoder_specific_info.extend_from_slice(body)?;
        } else {
            debug!("Unsupported decoder config child, tag {tag}");
        }
    }
    Ok(())
}

impl EsDescriptor {
    /// Codec for an audio stream, or `Unsupported` when the object type is not one we demux.
    pub(crate) fn audio_codec(&self) -> Result<(CodecType, Option<AacConfig>)> {
        if self.stream_type != STREAM_TYPE_AUDIO {
            return Err(Error::Unsupported("esds stream type is not audio"));
        }
        match self.object_type {
            OBJECT_QCELP => Ok((CodecType::Qcelp, None)),
            OBJECT_EVRC => Ok((CodecType::Evrc, None)),
            OBJECT_MPEG4_AUDIO | OBJECT_MPEG2_AAC_MAIN | OBJECT_MPEG2_AAC_LC | OBJECT_MPEG2_AAC_SSR => {
                if self.decoder_specific_info.is_empty() {
                    // MPEG-2 AAC has no AudioSpecificConfig of its own
                    return Ok((CodecType::Aac, None));
                }
                let aac = parse_audio_specific_config(&self.decoder_specific_info)?;
                Ok((aac.codec(), Some(aac)))
            },
            _ => Err(Error::Unsupported("unknown audio object type")),
        }
    }
}

/// Entropy coding mode signalled by an H.264 picture parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyCoding {
    Cavlc,
    Cabac,
}

/// AVC decoder configuration record.
///
/// See ISO 14496-15:2014 § 5.3.3.1
#[derive(Debug, PartialEq)]
pub struct AvcConfig {
    pub configuration_version: u8,
    pub profile: u8,
    pub profile_compatibility: u8,
    pub level: u8,
    /// Bytes in each NAL unit length prefix (1, 2 or 4).
    pub nal_length_size: u8,
    pub sps: TryVec<TryVec<u8>>,
    pub pps: TryVec<TryVec<u8>>,
    /// Classified from the first picture parameter set.
    pub entropy_coding: Option<EntropyCoding>,
}

pub(crate) fn parse_avc_config(data: &[u8], max_parameter_sets: u32) -> Result<AvcConfig> {
    let src = &mut Cursor::new(data);
    let configuration_version = src.read_u8()?;
    let profile = src.read_u8()?;
    let profile_compatibility = src.read_u8()?;
    let level = src.read_u8()?;
    let nal_length_size = (src.read_u8()? & 0x03) + 1;

    let sps_count = src.read_u8()? & 0x1f;
    let sps = read_parameter_sets(src, sps_count, max_parameter_sets)?;
    let pps_count = src.read_u8()?;
    let pps = read_parameter_sets(src, pps_count, max_parameter_sets)?;

    let entropy_coding = match pps.first() {
        Some(first) => Some(pps_entropy_coding(first)?),
        None => None,
    };

    Ok(AvcConfig {
        configuration_version,
        profile,
        profile_compatibility,
        level,
        nal_length_size,
        sps,
        pps,
        entropy_coding,
    })
}

fn read_parameter_sets(src: &mut Cursor<&[u8]>, count: u8, max: u32) -> Result<TryVec<TryVec<u8>>> {
    if u32::from(count) > max {
        return Err(Error::ResourceLimitExceeded("too many AVC parameter sets"));
    }
    let mut sets = TryVec::with_capacity(count.to_usize())?;
    for _ in 0..count {
        let len = be_u16(src)?.to_usize();
        let mut set = TryVec::with_capacity(len)?;
        let start = usize::try_from(src.position())?;
        let bytes = src.get_ref().get(start..start + len).ok_or(Error::InvalidData("parameter set exceeds avcC"))?;
        set.extend_from_slice(bytes)?;
        src.set_position((start + len) as u64);
        sets.push(set)?;
    }
    Ok(sets)
}

/// Read an unsigned Exp-Golomb code.
fn read_ue(bits: &mut BitReader<'_>) -> Result<u32> {
    let mut leading_zeros = 0u8;
    while !bits.read_bool()? {
        leading_zeros += 1;
        if leading_zeros > 31 {
            return Err(Error::InvalidData("Exp-Golomb code too long"));
        }
    }
    if leading_zeros == 0 {
        return Ok(0);
    }
    let rest = bits.read_u32(leading_zeros)?;
    Ok((1u32 << leading_zeros) - 1 + rest)
}

/// See ISO 14496-10:2014 § 7.3.2.2
fn pps_entropy_coding(pps: &[u8]) -> Result<EntropyCoding> {
    let mut bits = BitReader::new(pps);
    bits.skip(8)?; // NAL unit header
    let pps_id = read_ue(&mut bits)?;
    if pps_id > 255 {
        return Err(Error::InvalidData("pic_parameter_set_id out of range"));
    }
    let sps_id = read_ue(&mut bits)?;
    if sps_id > 31 {
        return Err(Error::InvalidData("seq_parameter_set_id out of range"));
    }
    Ok(if bits.read_bool()? { EntropyCoding::Cabac } else { EntropyCoding::Cavlc })
}

/// Fields of an MPEG-4 AudioSpecificConfig.
///
/// See ISO 14496-3:2009 § 1.6.2.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AacConfig {
    pub object_type: u8,
    pub frequency_index: u8,
    pub sample_rate: u32,
    pub channel_config: u8,
    /// Spectral band replication is signalled.
    pub sbr: bool,
    pub extension_sample_rate: Option<u32>,
}

impl AacConfig {
    pub fn codec(&self) -> CodecType {
        match self.object_type {
            _ if self.sbr => CodecType::AacSbr,
            22 => CodecType::Bsac,
            _ => CodecType::Aac,
        }
    }
}

const FREQUENCY_TABLE: [u32; 13] = [96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350];

/// Read a 4-bit sampling frequency index, or the explicit 24-bit frequency after an escape.
fn read_sample_rate(bits: &mut BitReader<'_>) -> Result<(u8, u32)> {
    let index = bits.read_u8(4)?;
    let rate = if index == 0x0f {
        bits.read_u32(24)?
    } else {
        match FREQUENCY_TABLE.get(index.to_usize()) {
            Some(&rate) => rate,
            None => {
                warn!("reserved sampling frequency index {index}");
                return Err(Error::InvalidData("reserved sampling frequency index"));
            },
        }
    };
    Ok((index, rate))
}

pub(crate) fn parse_audio_specific_config(data: &[u8]) -> Result<AacConfig> {
    let mut bits = BitReader::new(data);
    let object_type = bits.read_u8(5)?;
    match object_type {
        1 | 2 | 5 | 22 | 29 => {},
        _ => return Err(Error::Unsupported("unsupported audio object type")),
    }
    let (frequency_index, sample_rate) = read_sample_rate(&mut bits)?;
    let channel_config = bits.read_u8(4)?;

    let mut sbr = false;
    let mut extension_sample_rate = None;
    if object_type == 5 || object_type == 29 {
        sbr = true;
        extension_sample_rate = Some(read_sample_rate(&mut bits)?.1);
    } else if object_type == 2 {
        // GASpecificConfig: frameLengthFlag, dependsOnCoreCoder, extensionFlag
        bits.skip(3)?;
        if bits.remaining() >= 16 {
            let sync = bits.read_u16(11)?;
            if sync == 0x2b7 {
                let extension_type = bits.read_u8(5)?;
                if extension_type == 5 && bits.read_bool()? {
                    sbr = true;
                    extension_sample_rate = Some(read_sample_rate(&mut bits)?.1);
                }
            }
        }
    }

    Ok(AacConfig {
        object_type,
        frequency_index,
        sample_rate,
        channel_config,
        sbr,
        extension_sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expandable_length_groups() {
        assert_eq!(read_descriptor_length(&mut Cursor::new(&[0x05u8][..])).unwrap(), 5);
        assert_eq!(read_descriptor_length(&mut Cursor::new(&[0x80u8, 0x80, 0x80, 0x22][..])).unwrap(), 0x22);
        assert_eq!(read_descriptor_length(&mut Cursor::new(&[0x81u8, 0x01][..])).unwrap(), 129);
        assert!(read_descriptor_length(&mut Cursor::new(&[0x80u8, 0x80, 0x80, 0x80, 0x01][..])).is_err());
    }

    #[test]
    fn aac_lc_descriptor() {
        let data = [
            0x03, 0x19, 0x00, 0x01, 0x00, // ES_Descriptor
            0x04, 0x11, 0x40, 0x15, 0x00, 0x06, 0x00, 0x00, 0x01, 0xf4, 0x00, 0x00, 0x01, 0xf4, 0x00, // DecoderConfig
            0x05, 0x02, 0x12, 0x10, // AudioSpecificConfig
            0x06, 0x01, 0x02, // SLConfig
        ];
        let esds = parse_es_descriptor(&data).unwrap();
        assert_eq!(esds.es_id, 1);
        assert_eq!(esds.object_type, OBJECT_MPEG4_AUDIO);
        assert_eq!(esds.stream_type, STREAM_TYPE_AUDIO);
        assert_eq!(esds.buffer_size, 0x600);
        assert_eq!(esds.max_bitrate, 128_000);
        assert_eq!(&esds.decoder_specific_info[..], &[0x12, 0x10]);

        let (codec, aac) = esds.audio_codec().unwrap();
        assert_eq!(codec, CodecType::Aac);
        let aac = aac.unwrap();
        assert_eq!(aac.sample_rate, 44100);
        assert_eq!(aac.channel_config, 2);
    }

    #[test]
    fn descriptor_must_fit() {
        let data = [0x03, 0x20, 0x00, 0x01, 0x00];
        assert!(matches!(parse_es_descriptor(&data), Err(Error::InvalidData(_))));
    }

    #[test]
    fn es_flags_skip_optional_fields() {
        let data = [
            0x03, 0x19, 0x00, 0x02, 0xe0, // all three flags
            0x00, 0x07, // dependsOn_ES_ID
            0x02, b'a', b'b', // URL
            0x00, 0x03, // OCR_ES_Id
            0x04, 0x0d, 0xe1, 0x15, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01,
        ];
        let esds = parse_es_descriptor(&data).unwrap();
        assert_eq!(esds.object_type, OBJECT_QCELP);
        assert_eq!(esds.avg_bitrate, 1);
        assert_eq!(esds.audio_codec().unwrap().0, CodecType::Qcelp);
    }

    #[test]
    fn sbr_explicit_and_backward_compatible() {
        // object type 5, 24 kHz core, stereo, 48 kHz extension
        let explicit = parse_audio_specific_config(&[0x2b, 0x11, 0x88, 0x00]).unwrap();
        assert!(explicit.sbr);
        assert_eq!(explicit.extension_sample_rate, Some(48000));
        assert_eq!(explicit.codec(), CodecType::AacSbr);

        // object type 2, 24 kHz, stereo, then sync 0x2b7, type 5, sbr flag, 48 kHz
        let implicit = parse_audio_specific_config(&[0x13, 0x10, 0x56, 0xe5, 0x98]).unwrap();
        assert!(implicit.sbr);
        assert_eq!(implicit.object_type, 2);
        assert_eq!(implicit.extension_sample_rate, Some(48000));
    }

    #[test]
    fn avc_config_and_entropy_mode() {
        let data = [
            0x01, 0x42, 0xc0, 0x1e, 0xff, // version, profile, compat, level, length size 4
            0xe1, 0x00, 0x03, 0x67, 0x42, 0xc0, // one SPS
            0x01, 0x00, 0x02, 0x68, 0xe0, // one PPS: ids 0/0, then the cabac bit set
        ];
        let avc = parse_avc_config(&data, 32).unwrap();
        assert_eq!(avc.nal_length_size, 4);
        assert_eq!(avc.sps.len(), 1);
        assert_eq!(&avc.pps[0][..], &[0x68, 0xe0]);
        assert_eq!(avc.entropy_coding, Some(EntropyCoding::Cabac));

        let cavlc = [0x01, 0x42, 0xc0, 0x1e, 0xfc, 0xe0, 0x01, 0x00, 0x02, 0x68, 0xc8];
        let avc = parse_avc_config(&cavlc, 32).unwrap();
        assert_eq!(avc.nal_length_size, 1);
        assert_eq!(avc.entropy_coding, Some(EntropyCoding::Cavlc));
    }

    #[test]
    fn parameter_set_count_is_bounded() {
        let data = [0x01, 0x42, 0xc0, 0x1e, 0xff, 0xe3];
        assert!(matches!(parse_avc_config(&data, 2), Err(Error::ResourceLimitExceeded(_))));
    }
}
