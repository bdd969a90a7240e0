//! Encoder configuration selection.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::provider::{EncoderConfig, HardwareAcceleration, Platform};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("no supported config found")]
    NoSupportedConfig,
}

/// Hardware acceleration preferences tried for each base configuration, in order.
pub const DEFAULT_ACCELERATION_ORDER: [HardwareAcceleration; 3] = [
    HardwareAcceleration::PreferHardware,
    HardwareAcceleration::NoPreference,
    HardwareAcceleration::PreferSoftware,
];

/// Expands one base configuration into the default priority list.
pub fn default_candidates(base: &EncoderConfig) -> Vec<EncoderConfig> {
    candidates_with(base, &DEFAULT_ACCELERATION_ORDER)
}

pub fn candidates_with(
    base: &EncoderConfig,
    acceleration: &[HardwareAcceleration],
) -> Vec<EncoderConfig> {
    acceleration
        .iter()
        .map(|&hardware_acceleration| EncoderConfig {
            hardware_acceleration,
            ..base.clone()
        })
        .collect()
}

/// Returns the first candidate the platform reports as supported.
///
/// Candidates are probed one at a time, in order, and probing stops at the first
/// match. A capability check that fails counts as "not supported".
pub async fn select<P: Platform>(
    platform: &P,
    candidates: &[EncoderConfig],
) -> Result<EncoderConfig, SelectError> {
    for (idx, candidate) in candidates.iter().enumerate() {
        match platform.is_encoder_config_supported(candidate).await {
            Ok(support) if support.supported => {
                info!(
                    codec = %candidate.codec,
                    width = candidate.width,
                    height = candidate.height,
                    hardware_acceleration = ?candidate.hardware_acceleration,
                    "selected encoder config"
                );
                return Ok(candidate.clone());
            }
            Ok(_) => debug!(candidate = idx, "encoder config not supported"),
            Err(err) => warn!(candidate = idx, ?err, "encoder capability check failed"),
        }
    }
    Err(SelectError::NoSupportedConfig)
}
