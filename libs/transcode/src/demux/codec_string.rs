//! RFC 6381 codec strings derived from sample entries.

use std::fmt::Write;

use super::CodecConfigBox;
use super::boxes::{FourCc, fourcc_str};

/// Builds the codec string a track reports, e.g. `avc1.64001f` or `vp09.00.10.08`.
///
/// Entries without a recognised configuration record report their bare fourcc.
pub(crate) fn codec_string(entry: &FourCc, config: Option<&CodecConfigBox>) -> String {
    let prefix = fourcc_str(entry);
    let derived = match config {
        Some(CodecConfigBox::Avc(avcc)) => avc(&prefix, avcc),
        Some(CodecConfigBox::Hevc(hvcc)) => hevc(&prefix, hvcc),
        Some(CodecConfigBox::Vp(vpcc)) => vp(&prefix, vpcc),
        Some(CodecConfigBox::Av1(av1c)) => av1(&prefix, av1c),
        None => None,
    };
    derived.unwrap_or(prefix)
}

fn avc(prefix: &str, avcc: &[u8]) -> Option<String> {
    let [_, profile, compat, level, ..] = avcc else {
        return None;
    };
    Some(format!("{prefix}.{profile:02x}{compat:02x}{level:02x}"))
}

fn hevc(prefix: &str, hvcc: &[u8]) -> Option<String> {
    if hvcc.len() < 13 {
        return None;
    }
    let space = match hvcc[1] >> 6 {
        1 => "A",
        2 => "B",
        3 => "C",
        _ => "",
    };
    let tier = if hvcc[1] & 0x20 == 0 { 'L' } else { 'H' };
    let profile_idc = hvcc[1] & 0x1f;
    let compat = u32::from_be_bytes([hvcc[2], hvcc[3], hvcc[4], hvcc[5]]).reverse_bits();
    let level = hvcc[12];

    let mut codec = format!("{prefix}.{space}{profile_idc}.{compat:x}.{tier}{level}");
    let constraints = &hvcc[6..12];
    let used = constraints
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    for byte in &constraints[..used] {
        let _ = write!(codec, ".{byte:x}");
    }
    Some(codec)
}

/// `vpcC` is a full box: four bytes of version and flags precede the record.
fn vp(prefix: &str, vpcc: &[u8]) -> Option<String> {
    let [_, _, _, _, profile, level, depth, ..] = vpcc else {
        return None;
    };
    Some(format!("{prefix}.{profile:02}.{level:02}.{:02}", depth >> 4))
}

fn av1(prefix: &str, av1c: &[u8]) -> Option<String> {
    let [_, profile_level, flags, ..] = av1c else {
        return None;
    };
    let profile = profile_level >> 5;
    let level = profile_level & 0x1f;
    let tier = if flags & 0x80 == 0 { 'M' } else { 'H' };
    let bit_depth = match (flags & 0x40 != 0, flags & 0x20 != 0) {
        (true, true) => 12,
        (true, false) => 10,
        _ => 8,
    };
    Some(format!("{prefix}.{profile}.{level:02}{tier}.{bit_depth:02}"))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn avc_profile_compat_level() {
        let avcc = CodecConfigBox::Avc(Bytes::from_static(&[1, 0x64, 0x00, 0x1f, 0xff]));
        assert_eq!(codec_string(b"avc1", Some(&avcc)), "avc1.64001f");
        assert_eq!(codec_string(b"avc3", Some(&avcc)), "avc3.64001f");
    }

    #[test]
    fn hevc_main_profile() {
        let mut hvcc = vec![1, 0x01, 0x60, 0x00, 0x00, 0x00, 0x90, 0, 0, 0, 0, 0, 93];
        hvcc.extend_from_slice(&[0xf0, 0x00]);
        let config = CodecConfigBox::Hevc(Bytes::from(hvcc));
        assert_eq!(codec_string(b"hvc1", Some(&config)), "hvc1.1.6.L93.90");
    }

    #[test]
    fn hevc_high_tier_with_space() {
        let hvcc = vec![1, 0xa2, 0x40, 0, 0, 0, 0, 0, 0, 0, 0, 0, 120];
        let config = CodecConfigBox::Hevc(Bytes::from(hvcc));
        assert_eq!(codec_string(b"hev1", Some(&config)), "hev1.B2.2.H120");
    }

    #[test]
    fn vp9_and_av1() {
        let vpcc = CodecConfigBox::Vp(Bytes::from_static(&[1, 0, 0, 0, 0, 10, 0x82, 1, 1, 1, 0, 0]));
        assert_eq!(codec_string(b"vp09", Some(&vpcc)), "vp09.00.10.08");
        assert_eq!(codec_string(b"vp08", Some(&vpcc)), "vp08.00.10.08");

        let av1c = CodecConfigBox::Av1(Bytes::from_static(&[0x81, 0x08, 0x4c, 0x00]));
        assert_eq!(codec_string(b"av01", Some(&av1c)), "av01.0.08M.10");
    }

    #[test]
    fn unknown_entries_report_fourcc() {
        assert_eq!(codec_string(b"mp4a", None), "mp4a");
        let short = CodecConfigBox::Avc(Bytes::from_static(&[1, 2]));
        assert_eq!(codec_string(b"avc1", Some(&short)), "avc1");
    }
}
