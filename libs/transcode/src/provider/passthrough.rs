//! Stream-copy providers.
//!
//! The decoder wraps each compressed access unit in a [`VideoFrame`] without touching
//! its bytes, and the encoder re-emits that payload unchanged together with the source
//! stream's codec string and decoder configuration. Only configurations that keep the
//! source codec family and dimensions are accepted, so the pair remuxes a stream
//! without re-encoding it. Acceleration preferences are accepted as given.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tracing::trace;

use super::{
    AvcBitstreamFormat, ChunkKind, ConfigSupport, DecoderConfig, DecoderOutput, DecoderOutputTx,
    EncodeOptions, EncodedChunkMetadata, EncodedVideoChunk, EncoderConfig, EncoderOutput,
    EncoderOutputTx, FrameLease, HardwareAcceleration, Platform, ProviderError, VideoDecoder,
    VideoEncoder, VideoFrame,
};
use crate::codec::VideoCodec;
use crate::pipeline::SourceTrack;

pub struct PassthroughPlatform {
    source: SourceTrack,
    live_frames: Arc<AtomicUsize>,
}

impl PassthroughPlatform {
    pub fn new(source: SourceTrack) -> Self {
        Self {
            source,
            live_frames: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn source(&self) -> &SourceTrack {
        &self.source
    }

    /// Frames handed out by decoders of this platform and not yet released.
    pub fn live_frames(&self) -> usize {
        self.live_frames.load(Ordering::SeqCst)
    }

    fn family(&self) -> Option<VideoCodec> {
        VideoCodec::from_codec_string(&self.source.codec)
    }

    fn accepts_encoder(&self, config: &EncoderConfig) -> bool {
        let family = VideoCodec::from_codec_string(&config.codec);
        family.is_some()
            && family == self.family()
            && config.width == self.source.coded_width
            && config.height == self.source.coded_height
            && config.avc.is_none_or(|avc| avc.format == AvcBitstreamFormat::Avc)
    }

    fn accepts_decoder(&self, config: &DecoderConfig) -> bool {
        let family = VideoCodec::from_codec_string(&config.codec);
        family.is_some() && family == self.family()
    }
}

impl Platform for PassthroughPlatform {
    type Decoder = PassthroughDecoder;
    type Encoder = PassthroughEncoder;

    async fn is_decoder_config_supported(
        &self,
        config: &DecoderConfig,
    ) -> Result<ConfigSupport<DecoderConfig>, ProviderError> {
        Ok(ConfigSupport {
            supported: self.accepts_decoder(config),
            config: config.clone(),
        })
    }

    async fn is_encoder_config_supported(
        &self,
        config: &EncoderConfig,
    ) -> Result<ConfigSupport<EncoderConfig>, ProviderError> {
        Ok(ConfigSupport {
            supported: self.accepts_encoder(config),
            config: config.clone(),
        })
    }

    fn create_decoder(&self, output: DecoderOutputTx) -> Result<PassthroughDecoder, ProviderError> {
        Ok(PassthroughDecoder {
            output,
            config: None,
            closed: false,
            live_frames: self.live_frames.clone(),
        })
    }

    fn create_encoder(&self, output: EncoderOutputTx) -> Result<PassthroughEncoder, ProviderError> {
        Ok(PassthroughEncoder {
            output,
            config: None,
            codec: self.source.codec.clone(),
            description: self.source.description.clone(),
            emitted: 0,
            closed: false,
        })
    }
}

pub struct PassthroughDecoder {
    output: DecoderOutputTx,
    config: Option<DecoderConfig>,
    closed: bool,
    live_frames: Arc<AtomicUsize>,
}

impl VideoDecoder for PassthroughDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), ProviderError> {
        if self.closed {
            return Err(ProviderError::Closed);
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn decode(&mut self, chunk: EncodedVideoChunk) -> Result<(), ProviderError> {
        if self.closed {
            return Err(ProviderError::Closed);
        }
        let config = self.config.as_ref().ok_or(ProviderError::Unconfigured)?;

        let live_frames = self.live_frames.clone();
        live_frames.fetch_add(1, Ordering::SeqCst);
        let frame = VideoFrame::new(
            chunk.timestamp,
            chunk.duration,
            config.coded_width,
            config.coded_height,
            chunk.data,
        )
        .with_lease(FrameLease::new(move || {
            live_frames.fetch_sub(1, Ordering::SeqCst);
        }));
        trace!(timestamp = frame.timestamp(), "passthrough decode");
        self.output
            .send(DecoderOutput::Frame(frame))
            .map_err(|_| ProviderError::Closed)
    }

    fn decode_queue_size(&self) -> usize {
        0
    }

    async fn flush(&mut self) -> Result<(), ProviderError> {
        if self.closed {
            return Err(ProviderError::Closed);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.config = None;
    }
}

pub struct PassthroughEncoder {
    output: EncoderOutputTx,
    config: Option<EncoderConfig>,
    /// The copied stream's own codec string, which may name an in-band variant
    /// (`avc3`, `hev1`) of the configured codec.
    codec: String,
    description: Option<Bytes>,
    emitted: u64,
    closed: bool,
}

impl VideoEncoder for PassthroughEncoder {
    fn configure(&mut self, config: &EncoderConfig) -> Result<(), ProviderError> {
        if self.closed {
            return Err(ProviderError::Closed);
        }
        self.config = Some(config.clone());
        self.emitted = 0;
        Ok(())
    }

    fn encode(&mut self, frame: &VideoFrame, options: EncodeOptions) -> Result<(), ProviderError> {
        if self.closed {
            return Err(ProviderError::Closed);
        }
        let config = self.config.as_ref().ok_or(ProviderError::Unconfigured)?;

        let kind = if options.key_frame || self.emitted == 0 {
            ChunkKind::Key
        } else {
            ChunkKind::Delta
        };
        let metadata = EncodedChunkMetadata {
            decoder_config: (self.emitted == 0).then(|| DecoderConfig {
                codec: self.codec.clone(),
                coded_width: config.width,
                coded_height: config.height,
                hardware_acceleration: HardwareAcceleration::NoPreference,
                description: self.description.clone(),
            }),
        };
        let chunk = EncodedVideoChunk {
            kind,
            timestamp: frame.timestamp(),
            duration: frame.duration(),
            data: frame.data().clone(),
        };
        self.emitted += 1;
        self.output
            .send(EncoderOutput::Chunk(chunk, metadata))
            .map_err(|_| ProviderError::Closed)
    }

    fn encode_queue_size(&self) -> usize {
        0
    }

    async fn flush(&mut self) -> Result<(), ProviderError> {
        if self.closed {
            return Err(ProviderError::Closed);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.config = None;
    }
}
