use std::fmt;

use serde::{Deserialize, Serialize};

/// Video codec families understood by the container layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264/AVC, length-prefixed NAL units described by an `avcC` record.
    #[serde(alias = "h264")]
    Avc,
    /// H.265/HEVC, length-prefixed NAL units described by an `hvcC` record.
    #[serde(alias = "h265")]
    Hevc,
    /// VP8. Decodable, but there is no MP4 sample entry for it on the output side.
    Vp8,
    /// VP9, described by a `vpcC` record.
    Vp9,
    /// AV1, described by an `av1C` record.
    Av1,
}

impl VideoCodec {
    /// Classifies an RFC 6381 codec string (`avc1.42001e`, `vp09.00.10.08`, ...) by its
    /// sample-entry prefix.
    pub fn from_codec_string(codec: &str) -> Option<Self> {
        let prefix = codec.split('.').next().unwrap_or_default();
        match prefix {
            "avc1" | "avc3" => Some(VideoCodec::Avc),
            "hvc1" | "hev1" => Some(VideoCodec::Hevc),
            "vp8" | "vp08" => Some(VideoCodec::Vp8),
            "vp09" => Some(VideoCodec::Vp9),
            "av01" => Some(VideoCodec::Av1),
            _ => None,
        }
    }

    /// The visual sample entry written for this codec, if MP4 carries it.
    pub fn sample_entry(&self) -> Option<&'static [u8; 4]> {
        match self {
            VideoCodec::Avc => Some(b"avc1"),
            VideoCodec::Hevc => Some(b"hvc1"),
            VideoCodec::Vp8 => None,
            VideoCodec::Vp9 => Some(b"vp09"),
            VideoCodec::Av1 => Some(b"av01"),
        }
    }

    /// The sample entry named by `codec`'s prefix when it is a variant of this
    /// family, otherwise [`Self::sample_entry`]. `avc3` and `hev1` streams carry
    /// their parameter sets in-band and keep that entry.
    pub fn sample_entry_for(&self, codec: Option<&str>) -> Option<&'static [u8; 4]> {
        let prefix = codec.and_then(|codec| codec.split('.').next());
        match (self, prefix) {
            (VideoCodec::Avc, Some("avc3")) => Some(b"avc3"),
            (VideoCodec::Hevc, Some("hev1")) => Some(b"hev1"),
            _ => self.sample_entry(),
        }
    }

    /// The decoder configuration record nested in the sample entry.
    pub fn config_box(&self) -> Option<&'static [u8; 4]> {
        match self {
            VideoCodec::Avc => Some(b"avcC"),
            VideoCodec::Hevc => Some(b"hvcC"),
            VideoCodec::Vp8 => None,
            VideoCodec::Vp9 => Some(b"vpcC"),
            VideoCodec::Av1 => Some(b"av1C"),
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodec::Avc => write!(f, "H.264"),
            VideoCodec::Hevc => write!(f, "H.265"),
            VideoCodec::Vp8 => write!(f, "VP8"),
            VideoCodec::Vp9 => write!(f, "VP9"),
            VideoCodec::Av1 => write!(f, "AV1"),
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h264" | "h.264" | "avc" => Ok(VideoCodec::Avc),
            "h265" | "h.265" | "hevc" => Ok(VideoCodec::Hevc),
            "vp8" => Ok(VideoCodec::Vp8),
            "vp9" => Ok(VideoCodec::Vp9),
            "av1" => Ok(VideoCodec::Av1),
            other => {
                VideoCodec::from_codec_string(other).ok_or_else(|| format!("unknown video codec: {s}"))
            }
        }
    }
}

/// Fields of a `vp09.PP.LL.DD[.CC.cp.tc.mc.FF]` codec string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vp9Params {
    pub profile: u8,
    pub level: u8,
    pub bit_depth: u8,
    pub chroma_subsampling: u8,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
    pub full_range: bool,
}

impl Vp9Params {
    pub fn parse(codec: &str) -> Option<Self> {
        let mut parts = codec.split('.');
        if parts.next()? != "vp09" {
            return None;
        }
        let fields = parts
            .map(|part| part.parse::<u8>().ok())
            .collect::<Option<Vec<_>>>()?;
        if fields.len() < 3 {
            return None;
        }
        let field = |idx: usize, default: u8| fields.get(idx).copied().unwrap_or(default);
        Some(Vp9Params {
            profile: fields[0],
            level: fields[1],
            bit_depth: fields[2],
            chroma_subsampling: field(3, 1),
            colour_primaries: field(4, 1),
            transfer_characteristics: field(5, 1),
            matrix_coefficients: field(6, 1),
            full_range: field(7, 0) != 0,
        })
    }
}

/// Fields of an `av01.P.LLT.DD[.M.CCC.cp.tc.mc.F]` codec string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Av1Params {
    pub profile: u8,
    pub level: u8,
    pub high_tier: bool,
    pub bit_depth: u8,
    pub monochrome: bool,
    pub chroma_subsampling_x: bool,
    pub chroma_subsampling_y: bool,
    pub chroma_sample_position: u8,
}

impl Av1Params {
    pub fn parse(codec: &str) -> Option<Self> {
        let mut parts = codec.split('.');
        if parts.next()? != "av01" {
            return None;
        }
        let profile = parts.next()?.parse::<u8>().ok()?;
        let level_tier = parts.next()?;
        let (level, high_tier) = match level_tier.strip_suffix('M') {
            Some(level) => (level, false),
            None => (level_tier.strip_suffix('H')?, true),
        };
        let level = level.parse::<u8>().ok()?;
        let bit_depth = parts.next()?.parse::<u8>().ok()?;
        let monochrome = parts.next().map(|m| m == "1").unwrap_or(false);
        let (chroma_subsampling_x, chroma_subsampling_y, chroma_sample_position) =
            match parts.next() {
                Some(ccc) if ccc.len() == 3 => {
                    let digits = ccc.as_bytes();
                    (
                        digits[0] == b'1',
                        digits[1] == b'1',
                        digits[2].wrapping_sub(b'0') & 0x03,
                    )
                }
                _ => (true, true, 0),
            };
        Some(Av1Params {
            profile,
            level,
            high_tier,
            bit_depth,
            monochrome,
            chroma_subsampling_x,
            chroma_subsampling_y,
            chroma_sample_position,
        })
    }
}
