//! Single-video-track MP4 writer.
//!
//! Chunks are queued in encoder emission order and laid out into `ftyp`, `moov`,
//! and one `mdat` chunk when the muxer is finalized.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{Av1Params, VideoCodec, Vp9Params};
use crate::provider::{EncodedChunkMetadata, EncodedVideoChunk};

mod boxes;

pub use boxes::MEDIA_TIMESCALE;

use boxes::{VisualEntry, build_ftyp_box, build_moov_box};

const MDAT_HEADER_LEN: u64 = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("first chunk must be a key chunk")]
    FirstChunkMustBeKey,
    #[error("chunk at {timestamp}us is empty")]
    EmptyChunk { timestamp: i64 },
    #[error("chunk at {timestamp}us precedes the first chunk")]
    TimestampBeforeOrigin { timestamp: i64 },
    #[error("first chunk must start at 0us, got {timestamp}us")]
    NonZeroFirstTimestamp { timestamp: i64 },
    #[error("{codec} has no MP4 sample entry")]
    UnsupportedCodec { codec: VideoCodec },
    #[error("{width}x{height} does not fit a visual sample entry")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("no decoder configuration for {codec} output")]
    MissingDecoderConfig { codec: VideoCodec },
    #[error("sample timing overflow")]
    DurationOverflow,
    #[error("output exceeds the 32-bit box size limit")]
    TooLarge,
}

/// How the first chunk's timestamp is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirstTimestamp {
    /// Shift every timestamp so the first chunk starts at zero.
    #[default]
    Offset,
    /// Reject a first chunk that does not start at zero.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxerConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub first_timestamp: FirstTimestamp,
    /// Write `moov` ahead of `mdat`.
    pub fast_start: bool,
    /// Codec string used to synthesize a VP9/AV1 record when no chunk metadata
    /// carries one.
    pub codec_string: Option<String>,
}

/// Summary statistics returned when finishing a mux.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MuxerStats {
    pub video_frames: u64,
    pub duration_secs: f64,
    pub bytes_written: u64,
}

struct SampleInfo {
    /// Presentation time in microseconds, relative to the origin.
    pts: i64,
    duration: Option<u64>,
    data: Bytes,
    is_keyframe: bool,
}

pub struct Mp4Muxer {
    config: MuxerConfig,
    samples: Vec<SampleInfo>,
    origin: Option<i64>,
    description: Option<Bytes>,
    codec_string: Option<String>,
}

impl Mp4Muxer {
    pub fn new(config: MuxerConfig) -> Result<Self, MuxError> {
        if config.codec.sample_entry().is_none() {
            return Err(MuxError::UnsupportedCodec {
                codec: config.codec,
            });
        }
        if config.width > u32::from(u16::MAX) || config.height > u32::from(u16::MAX) {
            return Err(MuxError::InvalidDimensions {
                width: config.width,
                height: config.height,
            });
        }
        Ok(Self {
            config,
            samples: Vec::new(),
            origin: None,
            description: None,
            codec_string: None,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Queues one encoded chunk.
    ///
    /// The first metadata carrying a decoder configuration supplies the sample
    /// description; later ones are ignored.
    pub fn add_video_chunk(
        &mut self,
        chunk: EncodedVideoChunk,
        metadata: EncodedChunkMetadata,
    ) -> Result<(), MuxError> {
        if self.samples.is_empty() && !chunk.is_key() {
            return Err(MuxError::FirstChunkMustBeKey);
        }
        if chunk.data.is_empty() {
            return Err(MuxError::EmptyChunk {
                timestamp: chunk.timestamp,
            });
        }
        if chunk.data.len() as u64 > u64::from(u32::MAX) {
            return Err(MuxError::TooLarge);
        }

        let origin = match self.origin {
            Some(origin) => origin,
            None => {
                let origin = match self.config.first_timestamp {
                    FirstTimestamp::Offset => chunk.timestamp,
                    FirstTimestamp::Strict if chunk.timestamp == 0 => 0,
                    FirstTimestamp::Strict => {
                        return Err(MuxError::NonZeroFirstTimestamp {
                            timestamp: chunk.timestamp,
                        });
                    }
                };
                self.origin = Some(origin);
                origin
            }
        };
        let pts = chunk
            .timestamp
            .checked_sub(origin)
            .ok_or(MuxError::DurationOverflow)?;
        if pts < 0 {
            return Err(MuxError::TimestampBeforeOrigin {
                timestamp: chunk.timestamp,
            });
        }

        if let Some(decoder_config) = metadata.decoder_config {
            if self.codec_string.is_none() {
                self.codec_string = Some(decoder_config.codec);
            }
            if self.description.is_none() {
                if let Some(description) = decoder_config.description {
                    debug!(len = description.len(), "captured decoder description");
                    self.description = Some(description);
                }
            }
        }

        self.samples.push(SampleInfo {
            pts,
            duration: chunk.duration,
            is_keyframe: chunk.is_key(),
            data: chunk.data,
        });
        Ok(())
    }

    /// Lays out the file. Consuming `self` makes a second finalize impossible.
    pub fn finalize(self) -> Result<(Bytes, MuxerStats), MuxError> {
        let record = self.config_record()?;
        let codec = self.config.codec;
        let (Some(kind), Some(config_kind)) = (
            codec.sample_entry_for(self.stream_codec_string()),
            codec.config_box(),
        ) else {
            return Err(MuxError::UnsupportedCodec { codec });
        };
        let entry = VisualEntry {
            kind,
            config_kind,
            record: &record,
            width: self.config.width,
            height: self.config.height,
        };

        let mdat_payload_len: u64 = self.samples.iter().map(|s| s.data.len() as u64).sum();
        let mdat_len = MDAT_HEADER_LEN + mdat_payload_len;
        if mdat_len > u64::from(u32::MAX) {
            return Err(MuxError::TooLarge);
        }

        let ftyp = build_ftyp_box();
        let ftyp_len = ftyp.len() as u64;
        let mut out = Vec::new();
        let tables;
        if self.config.fast_start {
            // moov's size does not depend on the offset it records
            let placeholder = SampleTables::from_samples(&self.samples, 0)?;
            let moov_len = build_moov_box(&entry, &placeholder).len() as u64;
            let offset = chunk_offset(ftyp_len + moov_len + MDAT_HEADER_LEN)?;
            tables = SampleTables::from_samples(&self.samples, offset)?;
            out.extend_from_slice(&ftyp);
            out.extend_from_slice(&build_moov_box(&entry, &tables));
            self.write_mdat(&mut out, mdat_len);
        } else {
            let offset = chunk_offset(ftyp_len + MDAT_HEADER_LEN)?;
            tables = SampleTables::from_samples(&self.samples, offset)?;
            out.extend_from_slice(&ftyp);
            self.write_mdat(&mut out, mdat_len);
            out.extend_from_slice(&build_moov_box(&entry, &tables));
        }

        let stats = MuxerStats {
            video_frames: self.samples.len() as u64,
            duration_secs: tables.total_duration() as f64 / f64::from(MEDIA_TIMESCALE),
            bytes_written: out.len() as u64,
        };
        info!(
            frames = stats.video_frames,
            duration_secs = stats.duration_secs,
            bytes = stats.bytes_written,
            fast_start = self.config.fast_start,
            "mp4 finalized"
        );
        Ok((Bytes::from(out), stats))
    }

    fn write_mdat(&self, out: &mut Vec<u8>, mdat_len: u64) {
        out.extend_from_slice(&(mdat_len as u32).to_be_bytes());
        out.extend_from_slice(b"mdat");
        for sample in &self.samples {
            out.extend_from_slice(&sample.data);
        }
    }

    /// The encoder-reported codec string, else the configured one.
    fn stream_codec_string(&self) -> Option<&str> {
        self.codec_string
            .as_deref()
            .or(self.config.codec_string.as_deref())
    }

    /// The configuration record for the sample entry, synthesized from the codec
    /// string for VP9 and AV1 when the encoder supplied none.
    fn config_record(&self) -> Result<Bytes, MuxError> {
        if let Some(description) = &self.description {
            return Ok(description.clone());
        }
        let codec = self.config.codec;
        let codec_string = self.stream_codec_string();
        let synthesized = match codec {
            VideoCodec::Vp9 => codec_string.and_then(Vp9Params::parse).map(build_vpcc_record),
            VideoCodec::Av1 => codec_string.and_then(Av1Params::parse).map(build_av1c_record),
            _ => None,
        };
        synthesized.ok_or(MuxError::MissingDecoderConfig { codec })
    }
}

fn chunk_offset(offset: u64) -> Result<u32, MuxError> {
    u32::try_from(offset).map_err(|_| MuxError::TooLarge)
}

/// `vpcC` version 1 record, including its full-box header.
fn build_vpcc_record(params: Vp9Params) -> Bytes {
    let mut record = vec![1, 0, 0, 0];
    record.push(params.profile);
    record.push(params.level);
    record.push(
        (params.bit_depth << 4)
            | ((params.chroma_subsampling & 0x07) << 1)
            | u8::from(params.full_range),
    );
    record.push(params.colour_primaries);
    record.push(params.transfer_characteristics);
    record.push(params.matrix_coefficients);
    record.extend_from_slice(&0u16.to_be_bytes()); // codecInitializationDataSize
    Bytes::from(record)
}

fn build_av1c_record(params: Av1Params) -> Bytes {
    let flags = (u8::from(params.high_tier) << 7)
        | (u8::from(params.bit_depth >= 10) << 6)
        | (u8::from(params.bit_depth == 12) << 5)
        | (u8::from(params.monochrome) << 4)
        | (u8::from(params.chroma_subsampling_x) << 3)
        | (u8::from(params.chroma_subsampling_y) << 2)
        | (params.chroma_sample_position & 0x03);
    Bytes::from(vec![
        0x81, // marker + version
        ((params.profile & 0x07) << 5) | (params.level & 0x1f),
        flags,
        0x00,
    ])
}

/// Per-sample tables in media timescale units.
struct SampleTables {
    durations: Vec<u32>,
    sizes: Vec<u32>,
    keyframes: Vec<u32>,
    chunk_offsets: Vec<u32>,
    samples_per_chunk: u32,
    cts_offsets: Vec<i32>,
    has_reorder: bool,
}

fn micros_to_media(us: i64) -> i64 {
    ((i128::from(us) * i128::from(MEDIA_TIMESCALE) + 500_000).div_euclid(1_000_000)) as i64
}

impl SampleTables {
    /// Decode timestamps are the sorted presentation timestamps, so every sample's
    /// composition offset is `pts - dts`. All samples go into one chunk.
    fn from_samples(samples: &[SampleInfo], chunk_offset: u32) -> Result<Self, MuxError> {
        let pts: Vec<i64> = samples.iter().map(|s| micros_to_media(s.pts)).collect();
        let mut dts = pts.clone();
        dts.sort_unstable();

        let mut durations = Vec::with_capacity(samples.len());
        for idx in 0..samples.len() {
            let delta = match dts.get(idx + 1) {
                Some(next) => next - dts[idx],
                None => samples[idx]
                    .duration
                    .map(|d| micros_to_media(i64::try_from(d).unwrap_or(i64::MAX)))
                    .filter(|&d| d > 0)
                    .or_else(|| durations.last().map(|&d: &u32| i64::from(d)))
                    .unwrap_or(1),
            };
            durations.push(u32::try_from(delta).map_err(|_| MuxError::DurationOverflow)?);
        }

        let mut has_reorder = false;
        let cts_offsets = pts
            .iter()
            .zip(&dts)
            .map(|(pts, dts)| {
                let offset = i32::try_from(pts - dts).map_err(|_| MuxError::DurationOverflow)?;
                has_reorder |= offset != 0;
                Ok(offset)
            })
            .collect::<Result<Vec<_>, MuxError>>()?;

        let keyframes = samples
            .iter()
            .enumerate()
            .filter(|(_, sample)| sample.is_keyframe)
            .map(|(idx, _)| idx as u32 + 1)
            .collect();

        let (chunk_offsets, samples_per_chunk) = if samples.is_empty() {
            (Vec::new(), 0)
        } else {
            (vec![chunk_offset], samples.len() as u32)
        };

        Ok(Self {
            durations,
            sizes: samples.iter().map(|s| s.data.len() as u32).collect(),
            keyframes,
            chunk_offsets,
            samples_per_chunk,
            cts_offsets,
            has_reorder,
        })
    }

    fn total_duration(&self) -> u64 {
        self.durations.iter().map(|&d| u64::from(d)).sum()
    }
}
