//! Print the tracks, metadata and first access units of an MP4/3GP file
use std::env;
use std::fs::File;

use mp4_demux::{MetadataField, Mp4Demuxer, StreamSource};

const FIELDS: [(MetadataField, &str); 8] = [
    (MetadataField::Title, "title"),
    (MetadataField::Artist, "artist"),
    (MetadataField::AlbumArtist, "album artist"),
    (MetadataField::Album, "album"),
    (MetadataField::Genre, "genre"),
    (MetadataField::Year, "year"),
    (MetadataField::Composer, "composer"),
    (MetadataField::Copyright, "copyright"),
];

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <mp4-file> [access units per track]", args[0]);
        std::process::exit(1);
    }
    let units: u32 = args.get(2).and_then(|n| n.parse().ok()).unwrap_or(5);

    let path = &args[1];
    let file = File::open(path).expect("Failed to open file");
    let source = StreamSource::new(file).expect("Failed to stat file");
    let mut demuxer = Mp4Demuxer::open(source).expect("Failed to parse movie");

    println!("{path}:");
    if let Some(brand) = demuxer.major_brand() {
        println!("  brand {brand}");
    }
    println!("  duration {} us", demuxer.duration_us());
    for (field, label) in FIELDS {
        if let Some(text) = demuxer.metadata_field(field) {
            println!("  {label}: {}", text.to_string_lossy());
        }
    }
    if let Some(art) = demuxer.cover_art() {
        println!("  cover art: {} bytes at {}", art.size, art.offset);
    }
    for url in demuxer.redirect_urls() {
        println!("  redirect: {}", String::from_utf8_lossy(&url[..]));
    }

    for index in 0..demuxer.track_count() {
        let Some(track) = demuxer.track(index) else { continue };
        println!(
            "  track {} {:?} {:?}: {} frames, timescale {}, {}x{}, {} bit/s",
            track.id,
            track.media_type,
            track.codec,
            track.total_frames(),
            track.timescale,
            track.width,
            track.height,
            track.avg_bitrate,
        );
        for (i, desc) in track.descriptions.iter().enumerate() {
            println!("    description {}: {} ({} config bytes)", i + 1, desc.format, desc.decoder_config.len());
        }
        for _ in 0..units {
            match demuxer.get_access_unit(index, true) {
                Ok(unit) => println!(
                    "    frame {} at {}: {} bytes, dts {}, cts offset {}",
                    unit.frame,
                    unit.offset,
                    unit.data.len(),
                    unit.dts,
                    unit.cts_offset
                ),
                Err(e) => {
                    println!("    {e}");
                    break;
                },
            }
        }
    }
}
