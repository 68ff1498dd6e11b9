// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:expr),*,) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub(crate) enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                use self::BoxType::*;
                match t {
                    $($(#[$attr])* $boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> Self {
                use self::BoxType::*;
                match b {
                    $($(#[$attr])* $boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                fourcc.fmt(f)
            }
        }
    }
}

/// A four-character code, as used for box types, brands and sample entry formats.
#[derive(Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl FourCC {
    pub const fn new(value: &[u8; 4]) -> Self {
        Self { value: *value }
    }
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self { value: number.to_be_bytes() }
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> Self {
        Self::from_be_bytes(fourcc.value)
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        Self { value }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => self.value.fmt(f),
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:#010x}", u32::from_be_bytes(self.value)),
        }
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value.eq(*other)
    }
}

box_database!(
    FileTypeBox                       0x6674_7970, // "ftyp"
    MediaDataBox                      0x6d64_6174, // "mdat"
    FreeSpaceBox                      0x6672_6565, // "free"
    SkipBox                           0x736b_6970, // "skip"
    WideBox                           0x7769_6465, // "wide"
    UuidBox                           0x7575_6964, // "uuid"
    MovieBox                          0x6d6f_6f76, // "moov"
    MovieHeaderBox                    0x6d76_6864, // "mvhd"
    TrackBox                          0x7472_616b, // "trak"
    TrackHeaderBox                    0x746b_6864, // "tkhd"
    EditBox                           0x6564_7473, // "edts"
    EditListBox                       0x656c_7374, // "elst"
    MediaBox                          0x6d64_6961, // "mdia"
    MediaHeaderBox                    0x6d64_6864, // "mdhd"
    HandlerBox                        0x6864_6c72, // "hdlr"
    MediaInformationBox               0x6d69_6e66, // "minf"
    DataInformationBox                0x6469_6e66, // "dinf"
    DataReferenceBox                  0x6472_6566, // "dref"
    AliasEntryBox                     0x616c_6973, // "alis"
    HandleEntryBox                    0x686e_646c, // "hndl"
    SampleTableBox                    0x7374_626c, // "stbl"
    SampleDescriptionBox              0x7374_7364, // "stsd"
    TimeToSampleBox                   0x7374_7473, // "stts"
    CompositionOffsetBox              0x6374_7473, // "ctts"
    SampleToChunkBox                  0x7374_7363, // "stsc"
    SampleSizeBox                     0x7374_737a, // "stsz"
    ChunkOffsetBox                    0x7374_636f, // "stco"
    ChunkLargeOffsetBox               0x636f_3634, // "co64"
    SyncSampleBox                     0x7374_7373, // "stss"
    UserDataBox                       0x7564_7461, // "udta"
    MetadataBox                       0x6d65_7461, // "meta"
    MetadataItemListBox               0x696c_7374, // "ilst"
    MetadataDataBox                   0x6461_7461, // "data"
    Id3v2Box                          0x4944_3332, // "ID32"
    TitleBox                          0x7469_746c, // "titl"
    CopyrightBox                      0x6370_7274, // "cprt"
    PerformerBox                      0x7065_7266, // "perf"
    GenreBox                          0x676e_7265, // "gnre"
    AuthorBox                         0x6175_7468, // "auth"
    AlbumBox                          0x616c_626d, // "albm"
    RecordingYearBox                  0x7972_7263, // "yrrc"
    NameItemBox                       0xa96e_616d, // "©nam"
    ArtistItemBox                     0xa941_5254, // "©ART"
    AlbumArtistItemBox                0x6141_5254, // "aART"
    AlbumItemBox                      0xa961_6c62, // "©alb"
    GenreItemBox                      0xa967_656e, // "©gen"
    DateItemBox                       0xa964_6179, // "©day"
    ComposerItemBox                   0xa977_7274, // "©wrt"
    TrackNumberItemBox                0x7472_6b6e, // "trkn"
    CoverArtItemBox                   0x636f_7672, // "covr"
    ReferenceMovieBox                 0x726d_7261, // "rmra"
    ReferenceMovieDescriptorBox       0x726d_6461, // "rmda"
    DataReferenceRedirectBox          0x7264_7266, // "rdrf"
    ESDBox                            0x6573_6473, // "esds"
    AVCConfigurationBox               0x6176_6343, // "avcC"
    BitRateBox                        0x6274_7274, // "btrt"
    FieldHandlingBox                  0x6669_656c, // "fiel"
    GammaBox                          0x6761_6d61, // "gama"
    QTWaveAtom                        0x7761_7665, // "wave"
    ProtectionSchemeInfoBox           0x7369_6e66, // "sinf"
    OriginalFormatBox                 0x6672_6d61, // "frma"
    MP4AudioSampleEntry               0x6d70_3461, // "mp4a"
    AmrNbSampleEntry                  0x7361_6d72, // "samr"
    AmrWbSampleEntry                  0x7361_7762, // "sawb"
    QcelpSampleEntry                  0x7371_6370, // "sqcp"
    EvrcSampleEntry                   0x7365_7663, // "sevc"
    ProtectedAudioSampleEntry         0x656e_6361, // "enca"
    MP4VideoSampleEntry               0x6d70_3476, // "mp4v"
    MP42VideoSampleEntry              0x6d70_3432, // "mp42"
    AVCSampleEntry                    0x6176_6331, // "avc1"
    S263SampleEntry                   0x7332_3633, // "s263"
    H263SampleEntry                   0x6832_3633, // "h263"
    H263UpperSampleEntry              0x4832_3633, // "H263"
    MjpegASampleEntry                 0x6d6a_7061, // "mjpa"
    MjpegBSampleEntry                 0x6d6a_7062, // "mjpb"
    JpegSampleEntry                   0x6a70_6567, // "jpeg"
    ProtectedVisualSampleEntry        0x656e_6376, // "encv"
);

#[test]
fn box_type_round_trips_through_u32() {
    let t = BoxType::from(0x6d6f_6f76);
    assert_eq!(t, BoxType::MovieBox);
    assert_eq!(u32::from(t), 0x6d6f_6f76);
    assert_eq!(BoxType::from(0x1234_5678), BoxType::UnknownBox(0x1234_5678));
    assert_eq!(format!("{:?}", BoxType::SampleTableBox), "stbl");
}

#[test]
fn fourcc_formats_non_ascii_as_hex() {
    assert_eq!(FourCC::from(*b"avc1").to_string(), "avc1");
    assert_eq!(FourCC::from(0xffff_ffff).to_string(), "0xffffffff");
    assert!(FourCC::new(b"mp4a") == b"mp4a");
}
