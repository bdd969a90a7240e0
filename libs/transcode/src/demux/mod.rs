//! ISO-BMFF container parsing.
//!
//! [`Mp4File::parse`] walks the box tree once and builds a track index. Samples are
//! resolved lazily from the sample tables and handed out as zero-copy slices of the
//! caller's buffer.

use bytes::Bytes;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, trace, warn};

mod boxes;
mod codec_string;
mod sample_table;

pub use boxes::FourCc;

use boxes::{BoxIter, Mp4Box, fourcc_str};
use sample_table::{SampleEntry, SampleTable};

/// Samples per batch when the caller has no preference.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Size of a visual sample entry's fixed fields, preceding its child boxes.
const VISUAL_SAMPLE_ENTRY_LEN: usize = 78;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DemuxError {
    #[error("{detail}")]
    Parse { detail: String },
    #[error("no video track found")]
    NoVideoTrack,
    #[error("track {0} not found")]
    UnknownTrack(u32),
    #[error("avcC, hvcC, vpcC, or av1C box not found in track {track_id}")]
    MissingConfigBox { track_id: u32 },
}

impl DemuxError {
    pub(crate) fn parse(detail: impl Into<String>) -> Self {
        DemuxError::Parse {
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Other(FourCc),
}

impl MediaType {
    fn from_handler(handler: FourCc) -> Self {
        match &handler {
            b"vide" => MediaType::Video,
            b"soun" => MediaType::Audio,
            _ => MediaType::Other(handler),
        }
    }
}

/// Per-track metadata reported by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: u32,
    pub media_type: MediaType,
    /// RFC 6381 codec string, e.g. `avc1.64001f`.
    pub codec: String,
    pub sample_entry: Option<FourCc>,
    pub coded_width: u32,
    pub coded_height: u32,
    pub timescale: u32,
    /// Media duration in `timescale` units.
    pub duration: u64,
    pub sample_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4Info {
    pub major_brand: Option<FourCc>,
    pub timescale: u32,
    pub duration: u64,
    pub is_fragmented: bool,
    pub tracks: SmallVec<[TrackInfo; 2]>,
}

/// Decoder configuration record found in a sample entry.
///
/// The payload excludes the 8-byte box header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecConfigBox {
    Avc(Bytes),
    Hevc(Bytes),
    Vp(Bytes),
    Av1(Bytes),
}

impl CodecConfigBox {
    /// Probe order when a sample entry carries more than one record.
    pub const PROBE_ORDER: [FourCc; 4] = [*b"avcC", *b"hvcC", *b"vpcC", *b"av1C"];

    fn from_box(kind: &FourCc, payload: Bytes) -> Option<Self> {
        match kind {
            b"avcC" => Some(CodecConfigBox::Avc(payload)),
            b"hvcC" => Some(CodecConfigBox::Hevc(payload)),
            b"vpcC" => Some(CodecConfigBox::Vp(payload)),
            b"av1C" => Some(CodecConfigBox::Av1(payload)),
            _ => None,
        }
    }

    pub fn fourcc(&self) -> FourCc {
        match self {
            CodecConfigBox::Avc(_) => *b"avcC",
            CodecConfigBox::Hevc(_) => *b"hvcC",
            CodecConfigBox::Vp(_) => *b"vpcC",
            CodecConfigBox::Av1(_) => *b"av1C",
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            CodecConfigBox::Avc(payload)
            | CodecConfigBox::Hevc(payload)
            | CodecConfigBox::Vp(payload)
            | CodecConfigBox::Av1(payload) => payload,
        }
    }
}

/// One access unit in decode order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub track_id: u32,
    /// 1-based sample number within the track.
    pub number: u32,
    /// Absolute offset of `data` within the container buffer.
    pub offset: u64,
    pub data: Bytes,
    pub dts: u64,
    pub cts: i64,
    pub duration: u32,
    pub timescale: u32,
    pub is_sync: bool,
}

impl Sample {
    /// Presentation timestamp in microseconds.
    pub fn timestamp_us(&self) -> i64 {
        ticks_to_micros(self.cts, self.timescale)
    }

    pub fn duration_us(&self) -> u64 {
        ticks_to_micros(i64::from(self.duration), self.timescale).max(0) as u64
    }
}

/// Converts track ticks to microseconds, truncating toward zero and saturating at
/// the `i64` range. Samples handed out by [`Mp4File::extract_samples`] always fit.
pub fn ticks_to_micros(ticks: i64, timescale: u32) -> i64 {
    checked_ticks_to_micros(ticks, timescale).unwrap_or(if ticks < 0 { i64::MIN } else { i64::MAX })
}

/// Like [`ticks_to_micros`], but `None` when the result leaves the `i64` range.
pub fn checked_ticks_to_micros(ticks: i64, timescale: u32) -> Option<i64> {
    if timescale == 0 {
        return Some(0);
    }
    i64::try_from(i128::from(ticks) * 1_000_000 / i128::from(timescale)).ok()
}

struct Track {
    table: SampleTable,
    config: Option<CodecConfigBox>,
}

/// A parsed, non-fragmented MP4 file.
pub struct Mp4File {
    data: Bytes,
    info: Mp4Info,
    tracks: Vec<Track>,
}

impl Mp4File {
    /// Parses the whole box tree. The buffer is kept and sliced, never copied.
    pub fn parse(data: Bytes) -> Result<Self, DemuxError> {
        let mut major_brand = None;
        let mut moov = None;
        let mut is_fragmented = false;
        for top in BoxIter::new(&data, 0) {
            let top = top?;
            trace!(kind = %fourcc_str(&top.kind), offset = top.offset, size = top.payload.len(), "top-level box");
            match &top.kind {
                b"ftyp" => major_brand = top.payload.get(..4).and_then(|b| b.try_into().ok()),
                b"moov" if moov.is_none() => moov = Some(top),
                b"moof" => is_fragmented = true,
                _ => {}
            }
        }
        let moov = moov.ok_or_else(|| DemuxError::parse("'moov' box not found"))?;
        if is_fragmented {
            warn!("movie fragments present; only samples indexed by 'moov' are read");
        }

        let (timescale, duration) = parse_mvhd(&moov.require(b"mvhd")?)?;
        let mut infos = SmallVec::new();
        let mut tracks = Vec::new();
        for trak in moov.children() {
            let trak = trak?;
            if &trak.kind != b"trak" {
                continue;
            }
            let (info, track) = parse_trak(&trak, &data)?;
            debug!(
                track_id = info.id,
                media_type = ?info.media_type,
                codec = %info.codec,
                samples = info.sample_count,
                "parsed track"
            );
            infos.push(info);
            tracks.push(track);
        }

        Ok(Mp4File {
            info: Mp4Info {
                major_brand,
                timescale,
                duration,
                is_fragmented,
                tracks: infos,
            },
            tracks,
            data,
        })
    }

    pub fn info(&self) -> &Mp4Info {
        &self.info
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The first track with a video handler.
    pub fn video_track(&self) -> Result<&TrackInfo, DemuxError> {
        locate_video_track(&self.info)
    }

    fn track(&self, track_id: u32) -> Result<(&TrackInfo, &Track), DemuxError> {
        self.info
            .tracks
            .iter()
            .zip(&self.tracks)
            .find(|(info, _)| info.id == track_id)
            .ok_or(DemuxError::UnknownTrack(track_id))
    }

    /// The configuration record of the track's first sample description.
    pub fn extract_decoder_config(&self, track_id: u32) -> Result<CodecConfigBox, DemuxError> {
        let (_, track) = self.track(track_id)?;
        track
            .config
            .clone()
            .ok_or(DemuxError::MissingConfigBox { track_id })
    }

    /// Resolves every sample of a track in decode order.
    pub fn extract_samples(
        &self,
        track_id: u32,
        batch_size_hint: usize,
    ) -> Result<Vec<Sample>, DemuxError> {
        let (info, _) = self.track(track_id)?;
        let mut samples = Vec::with_capacity((info.sample_count as usize).min(self.data.len()));
        for batch in self.sample_batches(track_id, batch_size_hint)? {
            samples.extend(batch?);
        }
        Ok(samples)
    }

    /// Resolves samples lazily, `batch_size` at a time.
    pub fn sample_batches(
        &self,
        track_id: u32,
        batch_size: usize,
    ) -> Result<SampleBatches<'_>, DemuxError> {
        let (info, track) = self.track(track_id)?;
        Ok(SampleBatches {
            data: &self.data,
            cursor: track.table.cursor(),
            track_id,
            timescale: info.timescale,
            batch_size: batch_size.max(1),
        })
    }
}

/// Returns the first track whose media type is video.
pub fn locate_video_track(info: &Mp4Info) -> Result<&TrackInfo, DemuxError> {
    info.tracks
        .iter()
        .find(|track| track.media_type == MediaType::Video)
        .ok_or(DemuxError::NoVideoTrack)
}

pub struct SampleBatches<'a> {
    data: &'a Bytes,
    cursor: sample_table::SampleCursor<'a>,
    track_id: u32,
    timescale: u32,
    batch_size: usize,
}

impl SampleBatches<'_> {
    fn slice(&self, entry: SampleEntry) -> Result<Sample, DemuxError> {
        let start = entry.offset;
        let end = start + u64::from(entry.size);
        if end > self.data.len() as u64 {
            return Err(DemuxError::parse(format!(
                "sample {} spans {start}..{end} past the end of a {} byte buffer",
                entry.number,
                self.data.len()
            )));
        }
        if checked_ticks_to_micros(entry.cts, self.timescale).is_none() {
            return Err(DemuxError::parse(format!(
                "sample {} presentation time {} at timescale {} overflows microseconds",
                entry.number, entry.cts, self.timescale
            )));
        }
        Ok(Sample {
            track_id: self.track_id,
            number: entry.number,
            offset: entry.offset,
            data: self.data.slice(start as usize..end as usize),
            dts: entry.dts,
            cts: entry.cts,
            duration: entry.duration,
            timescale: self.timescale,
            is_sync: entry.is_sync,
        })
    }
}

impl Iterator for SampleBatches<'_> {
    type Item = Result<Vec<Sample>, DemuxError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.cursor.next() {
                Some(Ok(entry)) => match self.slice(entry) {
                    Ok(sample) => batch.push(sample),
                    Err(err) => return Some(Err(err)),
                },
                Some(Err(err)) => return Some(Err(err)),
                None => break,
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

fn parse_mvhd(mvhd: &Mp4Box<'_>) -> Result<(u32, u64), DemuxError> {
    let (version, _, mut reader) = mvhd.full_box()?;
    let wide = version == 1;
    reader.u32_or_u64(wide)?; // creation_time
    reader.u32_or_u64(wide)?; // modification_time
    let timescale = reader.u32()?;
    let duration = reader.u32_or_u64(wide)?;
    Ok((timescale, duration))
}

fn parse_tkhd(tkhd: &Mp4Box<'_>) -> Result<u32, DemuxError> {
    let (version, _, mut reader) = tkhd.full_box()?;
    let wide = version == 1;
    reader.u32_or_u64(wide)?;
    reader.u32_or_u64(wide)?;
    reader.u32()
}

fn parse_mdhd(mdhd: &Mp4Box<'_>) -> Result<(u32, u64), DemuxError> {
    let (version, _, mut reader) = mdhd.full_box()?;
    let wide = version == 1;
    reader.u32_or_u64(wide)?;
    reader.u32_or_u64(wide)?;
    let timescale = reader.u32()?;
    if timescale == 0 {
        return Err(DemuxError::parse("'mdhd' timescale is zero"));
    }
    let duration = reader.u32_or_u64(wide)?;
    Ok((timescale, duration))
}

fn parse_hdlr(hdlr: &Mp4Box<'_>) -> Result<FourCc, DemuxError> {
    let (_, _, mut reader) = hdlr.full_box()?;
    reader.u32()?; // pre_defined
    reader.fourcc()
}

struct SampleDescription {
    entry: FourCc,
    width: u32,
    height: u32,
    config: Option<CodecConfigBox>,
}

/// Reads the first entry of `stsd`.
fn parse_stsd(
    stsd: &Mp4Box<'_>,
    media_type: MediaType,
    data: &Bytes,
) -> Result<Option<SampleDescription>, DemuxError> {
    let (_, _, mut reader) = stsd.full_box()?;
    let count = reader.u32()?;
    if count == 0 {
        return Ok(None);
    }
    let Some(entry) = stsd.children_after(8)?.next().transpose()? else {
        return Err(DemuxError::parse(format!(
            "'stsd' declares {count} entries but holds none"
        )));
    };
    if media_type != MediaType::Video || entry.payload.len() < VISUAL_SAMPLE_ENTRY_LEN {
        return Ok(Some(SampleDescription {
            entry: entry.kind,
            width: 0,
            height: 0,
            config: None,
        }));
    }

    let mut fields = boxes::Reader::new(entry.payload, entry.kind);
    fields.skip(24)?;
    let width = u32::from(fields.u16()?);
    let height = u32::from(fields.u16()?);

    let mut found: SmallVec<[Mp4Box<'_>; 4]> = SmallVec::new();
    for child in entry.children_after(VISUAL_SAMPLE_ENTRY_LEN)? {
        let child = child?;
        if CodecConfigBox::PROBE_ORDER.contains(&child.kind) {
            found.push(child);
        }
    }
    let config = CodecConfigBox::PROBE_ORDER.iter().find_map(|kind| {
        let child = found.iter().find(|child| &child.kind == kind)?;
        CodecConfigBox::from_box(kind, data.slice(child.payload_range()))
    });

    Ok(Some(SampleDescription {
        entry: entry.kind,
        width,
        height,
        config,
    }))
}

fn parse_trak(trak: &Mp4Box<'_>, data: &Bytes) -> Result<(TrackInfo, Track), DemuxError> {
    let id = parse_tkhd(&trak.require(b"tkhd")?)?;
    let mdia = trak.require(b"mdia")?;
    let (timescale, duration) = parse_mdhd(&mdia.require(b"mdhd")?)?;
    let media_type = MediaType::from_handler(parse_hdlr(&mdia.require(b"hdlr")?)?);
    let stbl = mdia.require(b"minf")?.require(b"stbl")?;
    let description = parse_stsd(&stbl.require(b"stsd")?, media_type, data)?;
    let table = SampleTable::parse(&stbl)?;

    let (sample_entry, codec, coded_width, coded_height, config) = match description {
        Some(desc) => (
            Some(desc.entry),
            codec_string::codec_string(&desc.entry, desc.config.as_ref()),
            desc.width,
            desc.height,
            desc.config,
        ),
        None => (None, String::new(), 0, 0, None),
    };

    let info = TrackInfo {
        id,
        media_type,
        codec,
        sample_entry,
        coded_width,
        coded_height,
        timescale,
        duration,
        sample_count: table.sample_count(),
    };
    Ok((info, Track { table, config }))
}
