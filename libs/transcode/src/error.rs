use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

use crate::demux::DemuxError;
use crate::mux::MuxError;
use crate::provider::ProviderError;
use crate::select::SelectError;

/// Which provider an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decoder,
    Encoder,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Decoder => write!(f, "decoder"),
            Stage::Encoder => write!(f, "encoder"),
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    #[error("malformed container: {0}")]
    #[diagnostic(code(transcode::parse))]
    Parse(String),
    #[error("no video track found")]
    #[diagnostic(
        code(transcode::no_video_track),
        help("the input must contain at least one track with a `vide` handler")
    )]
    NoVideoTrack,
    #[error("avcC, hvcC, vpcC, or av1C box not found in track {track_id}")]
    #[diagnostic(code(transcode::missing_config_box))]
    MissingConfigBox { track_id: u32 },
    #[error("no supported encoder config found")]
    #[diagnostic(
        code(transcode::no_supported_config),
        help("check the target codec, dimensions, and the hardware acceleration list")
    )]
    NoSupportedConfig,
    #[error("decoder config not supported: {codec}")]
    #[diagnostic(code(transcode::decoder_config_unsupported))]
    DecoderConfigUnsupported { codec: String },
    #[error("{stage} error: {source}")]
    #[diagnostic(code(transcode::provider))]
    ProviderRuntime {
        stage: Stage,
        #[source]
        source: ProviderError,
    },
    #[error("muxer error: {0}")]
    #[diagnostic(code(transcode::mux))]
    Mux(#[from] MuxError),
    #[error("transcode cancelled")]
    #[diagnostic(code(transcode::cancelled))]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn provider(stage: Stage, source: ProviderError) -> Self {
        Error::ProviderRuntime { stage, source }
    }
}

impl From<DemuxError> for Error {
    fn from(err: DemuxError) -> Self {
        match err {
            DemuxError::NoVideoTrack => Error::NoVideoTrack,
            DemuxError::MissingConfigBox { track_id } => Error::MissingConfigBox { track_id },
            err @ (DemuxError::Parse { .. } | DemuxError::UnknownTrack(_)) => {
                Error::Parse(err.to_string())
            }
        }
    }
}

impl From<SelectError> for Error {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::NoSupportedConfig => Error::NoSupportedConfig,
        }
    }
}
