//! Interfaces to the platform's video decoder and encoder.
//!
//! Providers are opaque: the pipeline hands them compressed chunks or decoded frames
//! and receives their results as messages on the channel passed at creation.
//! Submission calls return as soon as the work is queued.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

mod frame;
pub mod passthrough;

pub use frame::{FrameLease, VideoFrame};

/// Error type for provider operations
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider was used after `close`
    #[error("provider is closed")]
    Closed,

    /// `decode`/`encode` was called before `configure`
    #[error("provider is not configured")]
    Unconfigured,

    /// The configuration was rejected
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// The provider failed while processing queued work
    #[error("{0}")]
    Runtime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareAcceleration {
    #[default]
    NoPreference,
    PreferHardware,
    PreferSoftware,
}

/// Bitstream layout of H.264 encoder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvcBitstreamFormat {
    /// Length-prefixed NAL units with out-of-band parameter sets.
    #[default]
    Avc,
    /// Start-code delimited NAL units.
    AnnexB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AvcEncoderConfig {
    pub format: AvcBitstreamFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    /// Target bitrate in bits per second.
    pub bitrate: u64,
    pub hardware_acceleration: HardwareAcceleration,
    pub avc: Option<AvcEncoderConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    pub hardware_acceleration: HardwareAcceleration,
    /// Codec configuration record, without its box header.
    pub description: Option<Bytes>,
}

/// Result of a capability check. `config` is the provider's normalized echo of the
/// probed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSupport<C> {
    pub supported: bool,
    pub config: C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Key,
    Delta,
}

/// One compressed access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedVideoChunk {
    pub kind: ChunkKind,
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    /// Duration in microseconds.
    pub duration: Option<u64>,
    pub data: Bytes,
}

impl EncodedVideoChunk {
    pub fn is_key(&self) -> bool {
        self.kind == ChunkKind::Key
    }
}

/// Side information an encoder attaches to an output chunk. The first chunk after
/// `configure` carries the decoder configuration for the produced stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedChunkMetadata {
    pub decoder_config: Option<DecoderConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeOptions {
    pub key_frame: bool,
}

#[derive(Debug)]
pub enum DecoderOutput {
    Frame(VideoFrame),
    Error(ProviderError),
}

#[derive(Debug)]
pub enum EncoderOutput {
    Chunk(EncodedVideoChunk, EncodedChunkMetadata),
    Error(ProviderError),
}

pub type DecoderOutputTx = mpsc::UnboundedSender<DecoderOutput>;
pub type EncoderOutputTx = mpsc::UnboundedSender<EncoderOutput>;

#[allow(async_fn_in_trait)]
pub trait VideoDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), ProviderError>;

    /// Queues one chunk. Decoded frames arrive on the output channel.
    fn decode(&mut self, chunk: EncodedVideoChunk) -> Result<(), ProviderError>;

    /// Chunks accepted but not yet decoded.
    fn decode_queue_size(&self) -> usize;

    /// Resolves once every queued chunk has produced its output.
    async fn flush(&mut self) -> Result<(), ProviderError>;

    /// Releases the decoder. Calling it more than once has no effect.
    fn close(&mut self);
}

#[allow(async_fn_in_trait)]
pub trait VideoEncoder {
    fn configure(&mut self, config: &EncoderConfig) -> Result<(), ProviderError>;

    /// Queues one frame. The encoder copies or retains what it needs, so the caller
    /// may close the frame as soon as this returns.
    fn encode(&mut self, frame: &VideoFrame, options: EncodeOptions) -> Result<(), ProviderError>;

    fn encode_queue_size(&self) -> usize;

    async fn flush(&mut self) -> Result<(), ProviderError>;

    fn close(&mut self);
}

/// A source of decoders and encoders plus their capability checks.
#[allow(async_fn_in_trait)]
pub trait Platform {
    type Decoder: VideoDecoder;
    type Encoder: VideoEncoder;

    async fn is_decoder_config_supported(
        &self,
        config: &DecoderConfig,
    ) -> Result<ConfigSupport<DecoderConfig>, ProviderError>;

    async fn is_encoder_config_supported(
        &self,
        config: &EncoderConfig,
    ) -> Result<ConfigSupport<EncoderConfig>, ProviderError>;

    fn create_decoder(&self, output: DecoderOutputTx) -> Result<Self::Decoder, ProviderError>;

    fn create_encoder(&self, output: EncoderOutputTx) -> Result<Self::Encoder, ProviderError>;
}
