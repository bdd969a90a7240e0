//! Box framing and big-endian field readers.

use std::ops::Range;

use zerocopy::byteorder::big_endian::{I32, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use super::DemuxError;

pub type FourCc = [u8; 4];

pub(crate) const HEADER_LEN: usize = 8;
const LARGE_HEADER_LEN: usize = 16;

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawHeader {
    size: U32,
    kind: [u8; 4],
}

/// One framed box, borrowed from the container buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Mp4Box<'a> {
    pub kind: FourCc,
    /// Absolute offset of the box header within the container buffer.
    pub offset: usize,
    pub header_len: usize,
    pub payload: &'a [u8],
}

impl<'a> Mp4Box<'a> {
    /// Absolute byte range of the payload within the container buffer.
    pub fn payload_range(&self) -> Range<usize> {
        let start = self.offset + self.header_len;
        start..start + self.payload.len()
    }

    pub fn children(&self) -> BoxIter<'a> {
        BoxIter::new(self.payload, self.offset + self.header_len)
    }

    /// Children of a box whose payload starts with `skip` bytes of fixed fields.
    pub fn children_after(&self, skip: usize) -> Result<BoxIter<'a>, DemuxError> {
        let Some(rest) = self.payload.get(skip..) else {
            return Err(DemuxError::parse(format!(
                "'{}' box at offset {} is shorter than its fixed fields",
                fourcc_str(&self.kind),
                self.offset
            )));
        };
        Ok(BoxIter::new(rest, self.offset + self.header_len + skip))
    }

    pub fn find(&self, kind: &FourCc) -> Result<Option<Mp4Box<'a>>, DemuxError> {
        for child in self.children() {
            let child = child?;
            if &child.kind == kind {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    pub fn require(&self, kind: &FourCc) -> Result<Mp4Box<'a>, DemuxError> {
        self.find(kind)?.ok_or_else(|| {
            DemuxError::parse(format!(
                "required '{}' box missing from '{}'",
                fourcc_str(kind),
                fourcc_str(&self.kind)
            ))
        })
    }

    /// Splits a full box payload into `(version, flags, body)`.
    pub fn full_box(&self) -> Result<(u8, u32, Reader<'a>), DemuxError> {
        let mut reader = Reader::new(self.payload, self.kind);
        let word = reader.u32()?;
        Ok(((word >> 24) as u8, word & 0x00ff_ffff, reader))
    }
}

/// Iterates the sibling boxes of one payload.
pub(crate) struct BoxIter<'a> {
    data: &'a [u8],
    base: usize,
    pos: usize,
    failed: bool,
}

impl<'a> BoxIter<'a> {
    pub fn new(data: &'a [u8], base: usize) -> Self {
        Self {
            data,
            base,
            pos: 0,
            failed: false,
        }
    }

    fn frame(&mut self) -> Result<Mp4Box<'a>, DemuxError> {
        let remaining = &self.data[self.pos..];
        let offset = self.base + self.pos;
        let (header, rest) = RawHeader::ref_from_prefix(remaining).map_err(|_| {
            DemuxError::parse(format!(
                "truncated box header at offset {offset}: {} bytes left",
                remaining.len()
            ))
        })?;
        let (size, header_len) = match header.size.get() {
            0 => (remaining.len() as u64, HEADER_LEN),
            1 => {
                let (large, _) = U64::read_from_prefix(rest).map_err(|_| {
                    DemuxError::parse(format!("truncated largesize field at offset {offset}"))
                })?;
                (large.get(), LARGE_HEADER_LEN)
            }
            size => (u64::from(size), HEADER_LEN),
        };
        if size < header_len as u64 || size > remaining.len() as u64 {
            return Err(DemuxError::parse(format!(
                "'{}' box at offset {offset} declares {size} bytes but {} remain",
                fourcc_str(&header.kind),
                remaining.len()
            )));
        }
        let size = size as usize;
        self.pos += size;
        Ok(Mp4Box {
            kind: header.kind,
            offset,
            header_len,
            payload: &remaining[header_len..size],
        })
    }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Result<Mp4Box<'a>, DemuxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let framed = self.frame();
        if framed.is_err() {
            self.failed = true;
        }
        Some(framed)
    }
}

/// Sequential big-endian reader over a box body.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    kind: FourCc,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], kind: FourCc) -> Self {
        Self { data, kind }
    }

    fn truncated(&self, wanted: usize) -> DemuxError {
        DemuxError::parse(format!(
            "'{}' box truncated: wanted {wanted} more bytes, {} left",
            fourcc_str(&self.kind),
            self.data.len()
        ))
    }

    fn read<T: FromBytes>(&mut self) -> Result<T, DemuxError> {
        let wanted = size_of::<T>();
        let (value, rest) = T::read_from_prefix(self.data).map_err(|_| self.truncated(wanted))?;
        self.data = rest;
        Ok(value)
    }

    pub fn u8(&mut self) -> Result<u8, DemuxError> {
        self.read::<u8>()
    }

    pub fn u16(&mut self) -> Result<u16, DemuxError> {
        self.read::<U16>().map(|v| v.get())
    }

    pub fn u32(&mut self) -> Result<u32, DemuxError> {
        self.read::<U32>().map(|v| v.get())
    }

    pub fn i32(&mut self) -> Result<i32, DemuxError> {
        self.read::<I32>().map(|v| v.get())
    }

    pub fn u64(&mut self) -> Result<u64, DemuxError> {
        self.read::<U64>().map(|v| v.get())
    }

    pub fn fourcc(&mut self) -> Result<FourCc, DemuxError> {
        self.read::<[u8; 4]>()
    }

    /// Reads a version-dependent 32/64-bit field.
    pub fn u32_or_u64(&mut self, wide: bool) -> Result<u64, DemuxError> {
        if wide {
            self.u64()
        } else {
            self.u32().map(u64::from)
        }
    }

    pub fn skip(&mut self, len: usize) -> Result<(), DemuxError> {
        self.bytes(len).map(|_| ())
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], DemuxError> {
        if self.data.len() < len {
            return Err(self.truncated(len));
        }
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(head)
    }

    /// Reads `count` fixed-size table entries in one borrow.
    pub fn entries<T>(&mut self, count: u32) -> Result<&'a [T], DemuxError>
    where
        T: FromBytes + KnownLayout + Immutable + Unaligned,
    {
        let count = count as usize;
        let wanted = count.saturating_mul(size_of::<T>());
        let (entries, rest) = <[T]>::ref_from_prefix_with_elems(self.data, count)
            .map_err(|_| self.truncated(wanted))?;
        self.data = rest;
        Ok(entries)
    }
}

pub(crate) fn fourcc_str(kind: &FourCc) -> String {
    kind.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn iterates_siblings_with_absolute_offsets() {
        let mut data = boxed(b"free", &[1, 2, 3]);
        data.extend(boxed(b"skip", &[]));
        let boxes: Vec<_> = BoxIter::new(&data, 100).collect::<Result<_, _>>().unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(&boxes[0].kind, b"free");
        assert_eq!(boxes[0].offset, 100);
        assert_eq!(boxes[0].payload, &[1, 2, 3]);
        assert_eq!(boxes[0].payload_range(), 108..111);
        assert_eq!(&boxes[1].kind, b"skip");
        assert_eq!(boxes[1].offset, 111);
    }

    #[test]
    fn largesize_and_to_end_framing() {
        let mut data = 1u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&20u64.to_be_bytes());
        data.extend_from_slice(&[9, 9, 9, 9]);
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"free");
        data.extend_from_slice(&[7, 7]);

        let boxes: Vec<_> = BoxIter::new(&data, 0).collect::<Result<_, _>>().unwrap();
        assert_eq!(boxes[0].header_len, 16);
        assert_eq!(boxes[0].payload, &[9, 9, 9, 9]);
        assert_eq!(boxes[1].payload, &[7, 7]);
    }

    #[test]
    fn overrun_stops_iteration_with_error() {
        let mut data = 64u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"moov");
        data.extend_from_slice(&[0; 8]);
        let mut iter = BoxIter::new(&data, 0);
        let err = iter.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("moov"), "{err}");
        assert!(iter.next().is_none());
    }

    #[test]
    fn undersized_box_is_rejected() {
        let mut data = 4u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"free");
        assert!(BoxIter::new(&data, 0).next().unwrap().is_err());

        let short = [0u8, 0, 0];
        assert!(BoxIter::new(&short, 0).next().unwrap().is_err());
    }

    #[test]
    fn reader_reports_truncation() {
        let mut reader = Reader::new(&[0, 0, 1, 0, 7], *b"mdhd");
        assert_eq!(reader.u32().unwrap(), 256);
        assert_eq!(reader.u8().unwrap(), 7);
        let err = reader.u16().unwrap_err();
        assert!(err.to_string().contains("mdhd"), "{err}");
    }
}
