//! Decoder description bytes, as handed to a decoder's `configure`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::demux::CodecConfigBox;

const BOX_HEADER_LEN: usize = 8;

impl CodecConfigBox {
    /// Writes the record as a complete big-endian box: size, fourcc, payload.
    pub fn write_box(&self, out: &mut impl BufMut) {
        let payload = self.payload();
        out.put_u32((BOX_HEADER_LEN + payload.len()) as u32);
        out.put_slice(&self.fourcc());
        out.put_slice(payload);
    }
}

/// Serializes the configuration box and strips its 8-byte header, leaving exactly
/// the record a decoder expects as its description.
pub fn serialize_config_box(config: &CodecConfigBox) -> Bytes {
    let mut buf = BytesMut::with_capacity(BOX_HEADER_LEN + config.payload().len());
    config.write_box(&mut buf);
    buf.freeze().slice(BOX_HEADER_LEN..)
}
