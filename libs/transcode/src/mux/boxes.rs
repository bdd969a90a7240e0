//! Box builders for the single-track output layout.

use super::SampleTables;

pub(super) const MOVIE_TIMESCALE: u32 = 1000;
/// Track/media timebase used for converting microsecond timestamps into sample deltas.
pub const MEDIA_TIMESCALE: u32 = 90_000;

const TRACK_ID: u32 = 1;

const UNITY_MATRIX: [u32; 9] = [
    0x0001_0000_u32,
    0,
    0,
    0,
    0x0001_0000_u32,
    0,
    0,
    0,
    0x4000_0000_u32,
];

/// What the sample description needs to know about the stream.
pub(super) struct VisualEntry<'a> {
    pub kind: &'a [u8; 4],
    pub config_kind: &'a [u8; 4],
    pub record: &'a [u8],
    pub width: u32,
    pub height: u32,
}

pub(super) fn build_box(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let length = (8 + payload.len()) as u32;
    let mut buffer = Vec::with_capacity(payload.len() + 8);
    buffer.extend_from_slice(&length.to_be_bytes());
    buffer.extend_from_slice(typ);
    buffer.extend_from_slice(payload);
    buffer
}

pub(super) fn build_ftyp_box() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"isom");
    payload.extend_from_slice(&0x200_u32.to_be_bytes());
    payload.extend_from_slice(b"isomiso2mp41");
    build_box(b"ftyp", &payload)
}

pub(super) fn build_moov_box(entry: &VisualEntry<'_>, tables: &SampleTables) -> Vec<u8> {
    let media_duration = tables.total_duration();
    let movie_duration = media_to_movie(media_duration);

    let mut payload = build_box(b"mvhd", &build_mvhd_payload(movie_duration));
    payload.extend_from_slice(&build_trak_box(entry, tables, movie_duration));
    build_box(b"moov", &payload)
}

fn media_to_movie(duration: u64) -> u32 {
    (duration * u64::from(MOVIE_TIMESCALE) / u64::from(MEDIA_TIMESCALE)).min(u64::from(u32::MAX))
        as u32
}

fn build_mvhd_payload(duration_ms: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_be_bytes()); // version + flags
    payload.extend_from_slice(&0u32.to_be_bytes()); // creation_time
    payload.extend_from_slice(&0u32.to_be_bytes()); // modification_time
    payload.extend_from_slice(&MOVIE_TIMESCALE.to_be_bytes());
    payload.extend_from_slice(&duration_ms.to_be_bytes());
    payload.extend_from_slice(&0x0001_0000_u32.to_be_bytes()); // rate (1.0)
    payload.extend_from_slice(&0x0100u16.to_be_bytes()); // volume (1.0)
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&0u64.to_be_bytes());
    for value in UNITY_MATRIX {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    payload.extend_from_slice(&[0u8; 24]); // pre_defined
    payload.extend_from_slice(&(TRACK_ID + 1).to_be_bytes()); // next_track_ID
    payload
}

fn build_trak_box(entry: &VisualEntry<'_>, tables: &SampleTables, duration_ms: u32) -> Vec<u8> {
    let mut payload = build_tkhd_box(entry.width, entry.height, duration_ms);
    payload.extend_from_slice(&build_mdia_box(entry, tables));
    build_box(b"trak", &payload)
}

/// Track enabled, in movie, in preview.
const TKHD_FLAGS: u32 = 0x0000_0003;

fn build_tkhd_box(width: u32, height: u32, duration_ms: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&TKHD_FLAGS.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&TRACK_ID.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&duration_ms.to_be_bytes());
    payload.extend_from_slice(&[0u8; 8]);
    payload.extend_from_slice(&0u16.to_be_bytes()); // layer
    payload.extend_from_slice(&0u16.to_be_bytes()); // alternate_group
    payload.extend_from_slice(&0u16.to_be_bytes()); // volume
    payload.extend_from_slice(&0u16.to_be_bytes());
    for value in UNITY_MATRIX {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    payload.extend_from_slice(&(width << 16).to_be_bytes());
    payload.extend_from_slice(&(height << 16).to_be_bytes());
    build_box(b"tkhd", &payload)
}

fn build_mdia_box(entry: &VisualEntry<'_>, tables: &SampleTables) -> Vec<u8> {
    let mut payload = build_mdhd_box(MEDIA_TIMESCALE, tables.total_duration());
    payload.extend_from_slice(&build_hdlr_box());
    payload.extend_from_slice(&build_minf_box(entry, tables));
    build_box(b"mdia", &payload)
}

fn encode_language_code(language: &str) -> [u8; 2] {
    // ISO 639-2/T codes pack into 15 bits as (c1<<10) | (c2<<5) | c3, offset by 0x60
    let mut packed = 0u16;
    for c in language.bytes().take(3) {
        packed = (packed << 5) | (u16::from(c).saturating_sub(0x60) & 0x1f);
    }
    packed.to_be_bytes()
}

fn build_mdhd_box(timescale: u32, duration: u64) -> Vec<u8> {
    let mut payload = Vec::new();
    if duration > u64::from(u32::MAX) {
        payload.extend_from_slice(&0x0100_0000_u32.to_be_bytes()); // version 1
        payload.extend_from_slice(&0u64.to_be_bytes());
        payload.extend_from_slice(&0u64.to_be_bytes());
        payload.extend_from_slice(&timescale.to_be_bytes());
        payload.extend_from_slice(&duration.to_be_bytes());
    } else {
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&timescale.to_be_bytes());
        payload.extend_from_slice(&(duration as u32).to_be_bytes());
    }
    payload.extend_from_slice(&encode_language_code("und"));
    payload.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
    build_box(b"mdhd", &payload)
}

fn build_hdlr_box() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(b"vide");
    payload.extend_from_slice(&[0u8; 12]);
    payload.extend_from_slice(b"VideoHandler\0");
    build_box(b"hdlr", &payload)
}

fn build_minf_box(entry: &VisualEntry<'_>, tables: &SampleTables) -> Vec<u8> {
    let mut payload = build_vmhd_box();
    payload.extend_from_slice(&build_dinf_box());
    payload.extend_from_slice(&build_stbl_box(entry, tables));
    build_box(b"minf", &payload)
}

fn build_vmhd_box() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&1u32.to_be_bytes()); // flags = 1
    payload.extend_from_slice(&[0u8; 8]); // graphicsmode + opcolor
    build_box(b"vmhd", &payload)
}

fn build_dinf_box() -> Vec<u8> {
    let url = build_box(b"url ", &1u32.to_be_bytes());
    let mut dref = Vec::new();
    dref.extend_from_slice(&0u32.to_be_bytes());
    dref.extend_from_slice(&1u32.to_be_bytes());
    dref.extend_from_slice(&url);
    build_box(b"dinf", &build_box(b"dref", &dref))
}

fn build_stbl_box(entry: &VisualEntry<'_>, tables: &SampleTables) -> Vec<u8> {
    let mut payload = build_stsd_box(entry);
    payload.extend_from_slice(&build_stts_box(&tables.durations));
    if tables.has_reorder {
        payload.extend_from_slice(&build_ctts_box(&tables.cts_offsets));
    }
    payload.extend_from_slice(&build_stsc_box(
        tables.samples_per_chunk,
        tables.chunk_offsets.len() as u32,
    ));
    payload.extend_from_slice(&build_stsz_box(&tables.sizes));
    payload.extend_from_slice(&build_stco_box(&tables.chunk_offsets));
    if !tables.keyframes.is_empty() {
        payload.extend_from_slice(&build_stss_box(&tables.keyframes));
    }
    build_box(b"stbl", &payload)
}

fn build_stsd_box(entry: &VisualEntry<'_>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&1u32.to_be_bytes());
    payload.extend_from_slice(&build_visual_sample_entry(entry));
    build_box(b"stsd", &payload)
}

/// Builds `avc1`/`hvc1`/`vp09`/`av01` around the stream's configuration record.
pub(super) fn build_visual_sample_entry(entry: &VisualEntry<'_>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0u8; 6]);
    payload.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    payload.extend_from_slice(&[0u8; 16]); // pre_defined + reserved
    // width and height are 16-bit in the visual sample entry
    payload.extend_from_slice(&(entry.width as u16).to_be_bytes());
    payload.extend_from_slice(&(entry.height as u16).to_be_bytes());
    payload.extend_from_slice(&0x0048_0000_u32.to_be_bytes()); // 72 dpi
    payload.extend_from_slice(&0x0048_0000_u32.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&1u16.to_be_bytes()); // frame_count
    payload.extend_from_slice(&[0u8; 32]); // compressorname
    payload.extend_from_slice(&0x0018u16.to_be_bytes());
    payload.extend_from_slice(&0xffffu16.to_be_bytes());
    payload.extend_from_slice(&build_box(entry.config_kind, entry.record));
    build_box(entry.kind, &payload)
}

pub(super) fn build_stts_box(durations: &[u32]) -> Vec<u8> {
    let entries = run_lengths(durations);
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (count, delta) in entries {
        payload.extend_from_slice(&count.to_be_bytes());
        payload.extend_from_slice(&delta.to_be_bytes());
    }
    build_box(b"stts", &payload)
}

/// Version 1 so that offsets may be negative.
pub(super) fn build_ctts_box(cts_offsets: &[i32]) -> Vec<u8> {
    let entries = run_lengths(cts_offsets);
    let mut payload = Vec::new();
    payload.extend_from_slice(&0x0100_0000_u32.to_be_bytes());
    payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (count, offset) in entries {
        payload.extend_from_slice(&count.to_be_bytes());
        payload.extend_from_slice(&offset.to_be_bytes());
    }
    build_box(b"ctts", &payload)
}

fn run_lengths<T: Copy + PartialEq>(values: &[T]) -> Vec<(u32, T)> {
    let mut entries: Vec<(u32, T)> = Vec::new();
    for &value in values {
        if let Some(last) = entries.last_mut() {
            if last.1 == value {
                last.0 += 1;
                continue;
            }
        }
        entries.push((1, value));
    }
    entries
}

pub(super) fn build_stsc_box(samples_per_chunk: u32, chunk_count: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_be_bytes());
    if chunk_count == 0 || samples_per_chunk == 0 {
        payload.extend_from_slice(&0u32.to_be_bytes());
        return build_box(b"stsc", &payload);
    }
    payload.extend_from_slice(&1u32.to_be_bytes());
    payload.extend_from_slice(&1u32.to_be_bytes()); // first_chunk
    payload.extend_from_slice(&samples_per_chunk.to_be_bytes());
    payload.extend_from_slice(&1u32.to_be_bytes()); // sample_description_index
    build_box(b"stsc", &payload)
}

pub(super) fn build_stsz_box(sizes: &[u32]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes()); // sample_size = 0 (table follows)
    payload.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
    for size in sizes {
        payload.extend_from_slice(&size.to_be_bytes());
    }
    build_box(b"stsz", &payload)
}

pub(super) fn build_stco_box(chunk_offsets: &[u32]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&(chunk_offsets.len() as u32).to_be_bytes());
    for offset in chunk_offsets {
        payload.extend_from_slice(&offset.to_be_bytes());
    }
    build_box(b"stco", &payload)
}

pub(super) fn build_stss_box(keyframes: &[u32]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&(keyframes.len() as u32).to_be_bytes());
    for index in keyframes {
        payload.extend_from_slice(&index.to_be_bytes());
    }
    build_box(b"stss", &payload)
}
