//! MP4 video transcoding.
//!
//! An input MP4 is demuxed into its first video track, every access unit is run
//! through a platform decoder and encoder, and the encoder's output is muxed into a
//! new single-track MP4:
//!
//! ```text
//! Mp4File::parse ─► extract_decoder_config ─► serialize_config_box
//!        │                                          │
//!        └─► extract_samples ─► Pipeline (decode ─► encode) ─► Mp4Muxer::finalize
//! ```
//!
//! Decoders and encoders are supplied through the [`provider::Platform`] trait.
//! [`provider::passthrough::PassthroughPlatform`] is a stream-copy platform that
//! remuxes a track without re-encoding it.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod codec;
pub mod config;
pub mod demux;
pub mod description;
pub mod error;
pub mod mux;
pub mod pipeline;
pub mod provider;
pub mod select;

pub use codec::VideoCodec;
pub use config::TranscodeConfig;
pub use demux::Mp4File;
pub use description::serialize_config_box;
pub use error::{Error, Result};
pub use mux::{Mp4Muxer, MuxerStats};
pub use pipeline::{Pipeline, PipelineState, SourceTrack};
pub use provider::EncoderConfig;

/// Output of [`transcode_file`].
#[derive(Debug, Clone)]
pub struct Transcoded {
    pub buffer: Bytes,
    pub stats: MuxerStats,
    pub encoder_config: EncoderConfig,
}

/// Transcodes the first video track of `input`, returning the new MP4.
pub async fn transcode<P: provider::Platform>(
    platform: &P,
    input: Bytes,
    config: &TranscodeConfig,
    cancel: CancellationToken,
) -> Result<Bytes> {
    let file = Mp4File::parse(input)?;
    let transcoded = transcode_file(platform, &file, config, cancel).await?;
    Ok(transcoded.buffer)
}

pub async fn transcode_file<P: provider::Platform>(
    platform: &P,
    file: &Mp4File,
    config: &TranscodeConfig,
    cancel: CancellationToken,
) -> Result<Transcoded> {
    let track = file.video_track()?;
    let config_box = file.extract_decoder_config(track.id)?;
    let description = serialize_config_box(&config_box);
    let samples = file.extract_samples(track.id, config.sample_batch_size)?;
    info!(
        track_id = track.id,
        codec = %track.codec,
        width = track.coded_width,
        height = track.coded_height,
        samples = samples.len(),
        target = %config.codec,
        "transcoding video track"
    );

    let target = config.target_codec().ok_or(Error::NoSupportedConfig)?;
    let mut muxer = Mp4Muxer::new(config.muxer_config(target))?;
    let source = SourceTrack::new(track, Some(description));
    let summary = Pipeline::new(platform, config.pipeline_options())
        .with_cancellation(cancel)
        .run(&source, &samples, &config.encoder_candidates(), &mut muxer)
        .await?;

    let (buffer, stats) = muxer.finalize()?;
    Ok(Transcoded {
        buffer,
        stats,
        encoder_config: summary.encoder_config,
    })
}
