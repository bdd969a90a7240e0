//! Decode → encode → mux sequencing.
//!
//! The sequencer owns both providers for the duration of one run. Provider outputs
//! arrive on unbounded channels and are routed synchronously: decoded frames go to
//! the encoder and are released right after submission, encoded chunks go to the
//! muxer. Both providers are closed and both channels drained on every exit path.

use std::collections::HashSet;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::demux::{Sample, TrackInfo};
use crate::error::{Error, Result, Stage};
use crate::mux::Mp4Muxer;
use crate::provider::{
    ChunkKind, DecoderConfig, DecoderOutput, EncodeOptions, EncodedVideoChunk, EncoderConfig,
    EncoderOutput, HardwareAcceleration, Platform, ProviderError, VideoDecoder, VideoEncoder,
};
use crate::select;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Configuring,
    Decoding,
    Draining,
    Finalized,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Finalized | PipelineState::Failed | PipelineState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Upper bound on either provider's queue before submission waits for output.
    /// `None` submits without waiting.
    pub max_queue_depth: Option<usize>,
    /// Request a key frame for every frame whose source sample was a sync sample.
    pub preserve_keyframes: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_queue_depth: Some(32),
            preserve_keyframes: true,
        }
    }
}

/// What the decoder needs to know about the input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTrack {
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    pub description: Option<Bytes>,
}

impl SourceTrack {
    pub fn new(track: &TrackInfo, description: Option<Bytes>) -> Self {
        Self {
            codec: track.codec.clone(),
            coded_width: track.coded_width,
            coded_height: track.coded_height,
            description,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub encoder_config: EncoderConfig,
    /// Frames handed to the encoder.
    pub frames: u64,
    /// Chunks handed to the muxer.
    pub chunks: u64,
}

/// Rewrites codec strings some decoders refuse into an accepted equivalent.
pub fn normalize_decoder_codec(codec: &str) -> String {
    let codec = codec.replacen("031", "001", 1);
    if codec.starts_with("vp08") {
        "vp8".to_string()
    } else {
        codec
    }
}

pub struct Pipeline<'a, P: Platform> {
    platform: &'a P,
    options: PipelineOptions,
    cancel: CancellationToken,
    state: watch::Sender<PipelineState>,
}

impl<'a, P: Platform> Pipeline<'a, P> {
    pub fn new(platform: &'a P, options: PipelineOptions) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            platform,
            options,
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Receives every state transition. The last state stays readable after the
    /// run finishes.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    fn transition(&self, next: PipelineState) {
        let prev = self.state.send_replace(next);
        debug!(?prev, ?next, "pipeline transition");
    }

    /// Runs the pipeline to completion over `samples`, which must be in decode order.
    #[instrument(skip_all, fields(codec = %source.codec, samples = samples.len()))]
    pub async fn run(
        self,
        source: &SourceTrack,
        samples: &[Sample],
        candidates: &[EncoderConfig],
        muxer: &mut Mp4Muxer,
    ) -> Result<RunSummary> {
        let (decoded_tx, decoded_rx) = mpsc::unbounded_channel();
        let (encoded_tx, encoded_rx) = mpsc::unbounded_channel();
        let mut stages = Stages::<P> {
            decoder: None,
            encoder: None,
            decoded_rx,
            encoded_rx,
            sync_timestamps: HashSet::new(),
            frames: 0,
            chunks: 0,
        };

        let result = self
            .drive(
                &mut stages,
                source,
                samples,
                candidates,
                muxer,
                decoded_tx,
                encoded_tx,
            )
            .await;
        stages.close();

        match &result {
            Ok(summary) => {
                self.transition(PipelineState::Finalized);
                info!(
                    frames = summary.frames,
                    chunks = summary.chunks,
                    "pipeline finished"
                );
            }
            Err(Error::Cancelled) => self.transition(PipelineState::Cancelled),
            Err(err) => {
                self.transition(PipelineState::Failed);
                warn!(%err, "pipeline failed");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        stages: &mut Stages<P>,
        source: &SourceTrack,
        samples: &[Sample],
        candidates: &[EncoderConfig],
        muxer: &mut Mp4Muxer,
        decoded_tx: mpsc::UnboundedSender<DecoderOutput>,
        encoded_tx: mpsc::UnboundedSender<EncoderOutput>,
    ) -> Result<RunSummary> {
        self.check_cancelled()?;
        self.transition(PipelineState::Configuring);

        let encoder_config = select::select(self.platform, candidates).await?;
        let encoder = stages.encoder.insert(
            self.platform
                .create_encoder(encoded_tx)
                .map_err(|err| Error::provider(Stage::Encoder, err))?,
        );
        encoder
            .configure(&encoder_config)
            .map_err(|err| Error::provider(Stage::Encoder, err))?;

        let decoder_config = DecoderConfig {
            codec: normalize_decoder_codec(&source.codec),
            coded_width: source.coded_width,
            coded_height: source.coded_height,
            hardware_acceleration: HardwareAcceleration::PreferSoftware,
            description: source.description.clone(),
        };
        match self
            .platform
            .is_decoder_config_supported(&decoder_config)
            .await
        {
            Ok(support) if support.supported => {}
            Ok(_) => {
                return Err(Error::DecoderConfigUnsupported {
                    codec: decoder_config.codec,
                });
            }
            Err(err) => {
                warn!(?err, "decoder capability check failed");
                return Err(Error::DecoderConfigUnsupported {
                    codec: decoder_config.codec,
                });
            }
        }
        let decoder = stages.decoder.insert(
            self.platform
                .create_decoder(decoded_tx)
                .map_err(|err| Error::provider(Stage::Decoder, err))?,
        );
        decoder
            .configure(&decoder_config)
            .map_err(|err| Error::provider(Stage::Decoder, err))?;

        self.transition(PipelineState::Decoding);
        for sample in samples {
            self.check_cancelled()?;
            stages
                .throttle(self.options.max_queue_depth, &self.cancel, muxer)
                .await?;

            let chunk = EncodedVideoChunk {
                kind: if sample.is_sync {
                    ChunkKind::Key
                } else {
                    ChunkKind::Delta
                },
                timestamp: sample.timestamp_us(),
                duration: Some(sample.duration_us()),
                data: sample.data.clone(),
            };
            if self.options.preserve_keyframes && sample.is_sync {
                stages.sync_timestamps.insert(chunk.timestamp);
            }
            stages.decode(chunk)?;
            stages.pump(muxer)?;
        }

        self.check_cancelled()?;
        self.transition(PipelineState::Draining);
        stages.flush_decoder(&self.cancel).await?;
        stages.route_decoded()?;
        stages.flush_encoder(&self.cancel).await?;
        stages.route_encoded(muxer)?;

        Ok(RunSummary {
            encoder_config,
            frames: stages.frames,
            chunks: stages.chunks,
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

enum Routed {
    Decoded(Option<DecoderOutput>),
    Encoded(Option<EncoderOutput>),
}

struct Stages<P: Platform> {
    decoder: Option<P::Decoder>,
    encoder: Option<P::Encoder>,
    decoded_rx: mpsc::UnboundedReceiver<DecoderOutput>,
    encoded_rx: mpsc::UnboundedReceiver<EncoderOutput>,
    sync_timestamps: HashSet<i64>,
    frames: u64,
    chunks: u64,
}

impl<P: Platform> Stages<P> {
    fn decoder(&mut self) -> Result<&mut P::Decoder> {
        self.decoder
            .as_mut()
            .ok_or(Error::provider(Stage::Decoder, ProviderError::Unconfigured))
    }

    fn encoder(&mut self) -> Result<&mut P::Encoder> {
        self.encoder
            .as_mut()
            .ok_or(Error::provider(Stage::Encoder, ProviderError::Unconfigured))
    }

    fn decode(&mut self, chunk: EncodedVideoChunk) -> Result<()> {
        self.decoder()?
            .decode(chunk)
            .map_err(|err| Error::provider(Stage::Decoder, err))
    }

    /// Routes whatever output is already queued, without waiting.
    fn pump(&mut self, muxer: &mut Mp4Muxer) -> Result<()> {
        self.route_decoded()?;
        self.route_encoded(muxer)
    }

    fn route_decoded(&mut self) -> Result<()> {
        while let Ok(output) = self.decoded_rx.try_recv() {
            self.handle_decoded(output)?;
        }
        Ok(())
    }

    fn route_encoded(&mut self, muxer: &mut Mp4Muxer) -> Result<()> {
        while let Ok(output) = self.encoded_rx.try_recv() {
            self.handle_encoded(output, muxer)?;
        }
        Ok(())
    }

    fn handle_decoded(&mut self, output: DecoderOutput) -> Result<()> {
        let frame = match output {
            DecoderOutput::Frame(frame) => frame,
            DecoderOutput::Error(err) => return Err(Error::provider(Stage::Decoder, err)),
        };
        let key_frame = self.sync_timestamps.remove(&frame.timestamp());
        let encoded = self
            .encoder()?
            .encode(&frame, EncodeOptions { key_frame });
        frame.close();
        encoded.map_err(|err| Error::provider(Stage::Encoder, err))?;
        self.frames += 1;
        Ok(())
    }

    fn handle_encoded(&mut self, output: EncoderOutput, muxer: &mut Mp4Muxer) -> Result<()> {
        match output {
            EncoderOutput::Chunk(chunk, metadata) => {
                muxer.add_video_chunk(chunk, metadata)?;
                self.chunks += 1;
                Ok(())
            }
            EncoderOutput::Error(err) => Err(Error::provider(Stage::Encoder, err)),
        }
    }

    /// Waits on provider output until both queues are within `limit`.
    async fn throttle(
        &mut self,
        limit: Option<usize>,
        cancel: &CancellationToken,
        muxer: &mut Mp4Muxer,
    ) -> Result<()> {
        let Some(limit) = limit else {
            return Ok(());
        };
        loop {
            let decode_depth = self.decoder()?.decode_queue_size();
            let encode_depth = self.encoder()?.encode_queue_size();
            if decode_depth <= limit && encode_depth <= limit {
                return Ok(());
            }
            debug!(decode_depth, encode_depth, "waiting for provider output");
            let routed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                output = self.decoded_rx.recv() => Routed::Decoded(output),
                output = self.encoded_rx.recv() => Routed::Encoded(output),
            };
            match routed {
                Routed::Decoded(Some(output)) => self.handle_decoded(output)?,
                Routed::Encoded(Some(output)) => self.handle_encoded(output, muxer)?,
                Routed::Decoded(None) => {
                    return Err(Error::provider(Stage::Decoder, ProviderError::Closed));
                }
                Routed::Encoded(None) => {
                    return Err(Error::provider(Stage::Encoder, ProviderError::Closed));
                }
            }
        }
    }

    async fn flush_decoder(&mut self, cancel: &CancellationToken) -> Result<()> {
        let decoder = self.decoder()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = decoder.flush() => res.map_err(|err| Error::provider(Stage::Decoder, err)),
        }
    }

    async fn flush_encoder(&mut self, cancel: &CancellationToken) -> Result<()> {
        let encoder = self.encoder()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = encoder.flush() => res.map_err(|err| Error::provider(Stage::Encoder, err)),
        }
    }

    /// Closes both providers and drops any undelivered output, which releases the
    /// leases of frames still in flight.
    fn close(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.close();
        }
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.close();
        }
        let mut dropped = 0usize;
        while self.decoded_rx.try_recv().is_ok() {
            dropped += 1;
        }
        while self.encoded_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "dropped undelivered provider output");
        }
        self.sync_timestamps.clear();
    }
}
