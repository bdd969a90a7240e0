use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;
use tracing::debug;
use transcode::TranscodeConfig;

pub const CONFIG_ENV: &str = "VIDEO_TRANSCODER_CONFIG";
const LOCAL_CONFIG: &str = "./video-transcoder.toml";

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    #[diagnostic(code(video_transcoder::config_io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("toml parsing failed")]
    #[diagnostic(code(video_transcoder::config_toml))]
    Toml(#[from] toml::de::Error),
}

/// Loads the first config found: the explicit path, then `$VIDEO_TRANSCODER_CONFIG`,
/// then `./video-transcoder.toml`. An explicit path that cannot be read is an error;
/// the others are skipped when missing. With no file at all the defaults apply.
pub fn load(explicit: Option<&Path>) -> Result<TranscodeConfig, ConfigError> {
    if let Some(path) = explicit {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        return parse(&contents);
    }
    let fallbacks = std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .into_iter()
        .chain([PathBuf::from(LOCAL_CONFIG)]);
    for path in fallbacks {
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        debug!(path = %path.display(), "loaded config");
        return parse(&contents);
    }
    Ok(TranscodeConfig::default())
}

pub fn parse(contents: &str) -> Result<TranscodeConfig, ConfigError> {
    Ok(toml::from_str(contents)?)
}
