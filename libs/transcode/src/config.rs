use serde::{Deserialize, Serialize};

use crate::codec::VideoCodec;
use crate::demux::DEFAULT_BATCH_SIZE;
use crate::mux::{FirstTimestamp, MuxerConfig};
use crate::pipeline::PipelineOptions;
use crate::provider::{AvcBitstreamFormat, AvcEncoderConfig, EncoderConfig, HardwareAcceleration};
use crate::select::{DEFAULT_ACCELERATION_ORDER, candidates_with};

/// Settings for one transcode run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Target codec string, e.g. `avc1.42001e`.
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    /// Target bitrate in bits per second.
    pub bitrate: u64,
    pub avc_format: AvcBitstreamFormat,
    /// Acceleration preferences probed in order.
    pub hardware_acceleration: Vec<HardwareAcceleration>,
    pub first_timestamp: FirstTimestamp,
    pub fast_start: bool,
    /// `0` disables backpressure.
    pub max_queue_depth: usize,
    pub preserve_keyframes: bool,
    pub sample_batch_size: usize,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            codec: "avc1.42001e".to_string(),
            width: 480,
            height: 640,
            framerate: 30.0,
            bitrate: 1_000_000,
            avc_format: AvcBitstreamFormat::Avc,
            hardware_acceleration: DEFAULT_ACCELERATION_ORDER.to_vec(),
            first_timestamp: FirstTimestamp::Offset,
            fast_start: true,
            max_queue_depth: 32,
            preserve_keyframes: true,
            sample_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl TranscodeConfig {
    pub fn target_codec(&self) -> Option<VideoCodec> {
        VideoCodec::from_codec_string(&self.codec)
    }

    /// Encoder configurations in priority order.
    pub fn encoder_candidates(&self) -> Vec<EncoderConfig> {
        let base = EncoderConfig {
            codec: self.codec.clone(),
            width: self.width,
            height: self.height,
            framerate: self.framerate,
            bitrate: self.bitrate,
            hardware_acceleration: HardwareAcceleration::NoPreference,
            avc: (self.target_codec() == Some(VideoCodec::Avc)).then_some(AvcEncoderConfig {
                format: self.avc_format,
            }),
        };
        let order = if self.hardware_acceleration.is_empty() {
            &DEFAULT_ACCELERATION_ORDER[..]
        } else {
            &self.hardware_acceleration[..]
        };
        candidates_with(&base, order)
    }

    pub fn muxer_config(&self, codec: VideoCodec) -> MuxerConfig {
        MuxerConfig {
            codec,
            width: self.width,
            height: self.height,
            first_timestamp: self.first_timestamp,
            fast_start: self.fast_start,
            codec_string: Some(self.codec.clone()),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            max_queue_depth: (self.max_queue_depth > 0).then_some(self.max_queue_depth),
            preserve_keyframes: self.preserve_keyframes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TranscodeConfig::default();
        let candidates = config.encoder_candidates();
        assert_eq!(candidates.len(), 3);
        assert_eq!(
            candidates[0].hardware_acceleration,
            HardwareAcceleration::PreferHardware
        );
        assert_eq!(candidates[0].width, 480);
        assert_eq!(candidates[0].height, 640);
        assert_eq!(
            candidates[0].avc,
            Some(AvcEncoderConfig {
                format: AvcBitstreamFormat::Avc
            })
        );
        assert_eq!(config.pipeline_options(), PipelineOptions::default());
    }

    #[test]
    fn zero_queue_depth_disables_backpressure() {
        let config = TranscodeConfig {
            max_queue_depth: 0,
            codec: "vp09.00.10.08".to_string(),
            hardware_acceleration: vec![HardwareAcceleration::PreferSoftware],
            ..Default::default()
        };
        assert_eq!(config.pipeline_options().max_queue_depth, None);
        let candidates = config.encoder_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].avc, None);
        assert_eq!(config.target_codec(), Some(VideoCodec::Vp9));
    }
}
