//! Sample table (`stbl`) parsing and decode-order sample resolution.

use zerocopy::byteorder::big_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use super::DemuxError;
use super::boxes::Mp4Box;

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SttsEntry {
    count: U32,
    delta: U32,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct CttsEntry {
    count: U32,
    offset: I32,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct StscEntry {
    first_chunk: U32,
    samples_per_chunk: U32,
    _description_index: U32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SampleSizes {
    Uniform { size: u32, count: u32 },
    PerSample(Vec<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkRun {
    first_chunk: u32,
    samples_per_chunk: u32,
}

/// Owned copy of the tables needed to resolve samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SampleTable {
    sizes: SampleSizes,
    chunk_offsets: Vec<u64>,
    chunk_runs: Vec<ChunkRun>,
    time_to_sample: Vec<(u32, u32)>,
    composition_offsets: Vec<(u32, i64)>,
    sync_samples: Option<Vec<u32>>,
}

/// One resolved sample, before its bytes are sliced out of the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SampleEntry {
    pub number: u32,
    pub offset: u64,
    pub size: u32,
    pub dts: u64,
    pub cts: i64,
    pub duration: u32,
    pub is_sync: bool,
}

impl SampleTable {
    pub fn parse(stbl: &Mp4Box<'_>) -> Result<Self, DemuxError> {
        let sizes = match (stbl.find(b"stsz")?, stbl.find(b"stz2")?) {
            (Some(stsz), _) => parse_stsz(&stsz)?,
            (None, Some(stz2)) => parse_stz2(&stz2)?,
            (None, None) => return Err(DemuxError::parse("required 'stsz' box missing from 'stbl'")),
        };
        let chunk_offsets = match (stbl.find(b"stco")?, stbl.find(b"co64")?) {
            (Some(stco), _) => parse_stco(&stco)?,
            (None, Some(co64)) => parse_co64(&co64)?,
            (None, None) => return Err(DemuxError::parse("required 'stco' box missing from 'stbl'")),
        };
        let chunk_runs = parse_stsc(&stbl.require(b"stsc")?)?;
        let time_to_sample = parse_stts(&stbl.require(b"stts")?)?;
        let composition_offsets = match stbl.find(b"ctts")? {
            Some(ctts) => parse_ctts(&ctts)?,
            None => Vec::new(),
        };
        let sync_samples = stbl.find(b"stss")?.map(|stss| parse_stss(&stss)).transpose()?;

        let table = SampleTable {
            sizes,
            chunk_offsets,
            chunk_runs,
            time_to_sample,
            composition_offsets,
            sync_samples,
        };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<(), DemuxError> {
        let count = self.sample_count();
        if count == 0 {
            return Ok(());
        }
        if self.chunk_runs.is_empty() {
            return Err(DemuxError::parse(format!(
                "'stsc' has no entries for {count} samples"
            )));
        }
        if self
            .chunk_runs
            .windows(2)
            .any(|pair| pair[1].first_chunk <= pair[0].first_chunk)
        {
            return Err(DemuxError::parse("'stsc' first_chunk values are not increasing"));
        }
        let mut capacity: u64 = 0;
        for (idx, run) in self.chunk_runs.iter().enumerate() {
            let first = u64::from(run.first_chunk.max(1));
            let end = self
                .chunk_runs
                .get(idx + 1)
                .map_or(self.chunk_offsets.len() as u64 + 1, |next| {
                    u64::from(next.first_chunk)
                });
            capacity = capacity.saturating_add(
                end.saturating_sub(first)
                    .saturating_mul(u64::from(run.samples_per_chunk)),
            );
        }
        if capacity < u64::from(count) {
            return Err(DemuxError::parse(format!(
                "chunk tables hold {capacity} samples but 'stsz' declares {count}"
            )));
        }
        Ok(())
    }

    pub fn sample_count(&self) -> u32 {
        match &self.sizes {
            SampleSizes::Uniform { count, .. } => *count,
            SampleSizes::PerSample(sizes) => sizes.len() as u32,
        }
    }

    fn sample_size(&self, index: u32) -> u32 {
        match &self.sizes {
            SampleSizes::Uniform { size, .. } => *size,
            SampleSizes::PerSample(sizes) => sizes[index as usize],
        }
    }

    pub fn cursor(&self) -> SampleCursor<'_> {
        SampleCursor {
            table: self,
            next: 0,
            chunk: None,
            left_in_chunk: 0,
            next_offset: 0,
            run: 0,
            stts: RunCursor::default(),
            ctts: RunCursor::default(),
            stss: 0,
            dts: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RunCursor {
    idx: usize,
    used: u32,
}

impl RunCursor {
    /// Steps through a run-length table, repeating the last value once it is exhausted.
    fn step<T: Copy + Default>(&mut self, runs: &[(u32, T)]) -> T {
        loop {
            match runs.get(self.idx) {
                Some(&(count, value)) if self.used < count => {
                    self.used += 1;
                    return value;
                }
                Some(_) => {
                    self.idx += 1;
                    self.used = 0;
                }
                None => return runs.last().map(|run| run.1).unwrap_or_default(),
            }
        }
    }
}

/// Walks the sample table in decode order.
pub(crate) struct SampleCursor<'t> {
    table: &'t SampleTable,
    next: u32,
    chunk: Option<usize>,
    left_in_chunk: u32,
    next_offset: u64,
    run: usize,
    stts: RunCursor,
    ctts: RunCursor,
    stss: usize,
    dts: u64,
}

impl SampleCursor<'_> {
    fn advance_chunk(&mut self) -> Result<(), DemuxError> {
        while self.left_in_chunk == 0 {
            let chunk = self.chunk.map_or(0, |c| c + 1);
            let Some(&offset) = self.table.chunk_offsets.get(chunk) else {
                return Err(DemuxError::parse(format!(
                    "sample {} lies beyond the last chunk",
                    self.next + 1
                )));
            };
            let runs = &self.table.chunk_runs;
            while runs
                .get(self.run + 1)
                .is_some_and(|next| next.first_chunk as usize <= chunk + 1)
            {
                self.run += 1;
            }
            let Some(run) = runs.get(self.run) else {
                return Err(DemuxError::parse("'stsc' has no entries"));
            };
            self.left_in_chunk = run.samples_per_chunk;
            self.next_offset = offset;
            self.chunk = Some(chunk);
        }
        Ok(())
    }

    fn is_sync(&mut self, number: u32) -> bool {
        let Some(sync) = &self.table.sync_samples else {
            return true;
        };
        while sync.get(self.stss).is_some_and(|&s| s < number) {
            self.stss += 1;
        }
        sync.get(self.stss) == Some(&number)
    }

    fn resolve(&mut self) -> Result<SampleEntry, DemuxError> {
        self.advance_chunk()?;
        let index = self.next;
        let number = index + 1;
        let size = self.table.sample_size(index);
        let offset = self.next_offset;
        self.next_offset = offset.checked_add(u64::from(size)).ok_or_else(|| {
            DemuxError::parse(format!("sample {number} offset overflows"))
        })?;
        self.left_in_chunk -= 1;

        let duration = self.stts.step(&self.table.time_to_sample);
        let composition = self.ctts.step(&self.table.composition_offsets);
        let dts = self.dts;
        self.dts = dts.saturating_add(u64::from(duration));
        let cts = i64::try_from(dts)
            .ok()
            .and_then(|dts| dts.checked_add(composition))
            .ok_or_else(|| {
                DemuxError::parse(format!("sample {number} composition time overflows"))
            })?;
        let is_sync = self.is_sync(number);
        self.next += 1;

        Ok(SampleEntry {
            number,
            offset,
            size,
            dts,
            cts,
            duration,
            is_sync,
        })
    }
}

impl Iterator for SampleCursor<'_> {
    type Item = Result<SampleEntry, DemuxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.table.sample_count() {
            return None;
        }
        let entry = self.resolve();
        if entry.is_err() {
            // stop after the first inconsistency
            self.next = u32::MAX;
        }
        Some(entry)
    }
}

fn parse_stsz(stsz: &Mp4Box<'_>) -> Result<SampleSizes, DemuxError> {
    let (_, _, mut reader) = stsz.full_box()?;
    let size = reader.u32()?;
    let count = reader.u32()?;
    if size != 0 {
        return Ok(SampleSizes::Uniform { size, count });
    }
    let sizes = reader.entries::<U32>(count)?;
    Ok(SampleSizes::PerSample(sizes.iter().map(|s| s.get()).collect()))
}

fn parse_stz2(stz2: &Mp4Box<'_>) -> Result<SampleSizes, DemuxError> {
    let (_, _, mut reader) = stz2.full_box()?;
    reader.skip(3)?;
    let field_size = reader.u8()?;
    let count = reader.u32()?;
    let sizes = match field_size {
        4 => {
            let packed = reader.bytes(count.div_ceil(2) as usize)?;
            (0..count as usize)
                .map(|i| {
                    let byte = packed[i / 2];
                    u32::from(if i % 2 == 0 { byte >> 4 } else { byte & 0x0f })
                })
                .collect()
        }
        8 => reader
            .bytes(count as usize)?
            .iter()
            .map(|&b| u32::from(b))
            .collect(),
        16 => reader
            .bytes(count as usize * 2)?
            .chunks_exact(2)
            .map(|b| u32::from(u16::from_be_bytes([b[0], b[1]])))
            .collect(),
        other => {
            return Err(DemuxError::parse(format!(
                "'stz2' field size {other} is not 4, 8, or 16"
            )));
        }
    };
    Ok(SampleSizes::PerSample(sizes))
}

fn parse_stco(stco: &Mp4Box<'_>) -> Result<Vec<u64>, DemuxError> {
    let (_, _, mut reader) = stco.full_box()?;
    let count = reader.u32()?;
    let offsets = reader.entries::<U32>(count)?;
    Ok(offsets.iter().map(|o| u64::from(o.get())).collect())
}

fn parse_co64(co64: &Mp4Box<'_>) -> Result<Vec<u64>, DemuxError> {
    let (_, _, mut reader) = co64.full_box()?;
    let count = reader.u32()?;
    (0..count).map(|_| reader.u64()).collect()
}

fn parse_stsc(stsc: &Mp4Box<'_>) -> Result<Vec<ChunkRun>, DemuxError> {
    let (_, _, mut reader) = stsc.full_box()?;
    let count = reader.u32()?;
    let entries = reader.entries::<StscEntry>(count)?;
    Ok(entries
        .iter()
        .map(|e| ChunkRun {
            first_chunk: e.first_chunk.get(),
            samples_per_chunk: e.samples_per_chunk.get(),
        })
        .collect())
}

fn parse_stts(stts: &Mp4Box<'_>) -> Result<Vec<(u32, u32)>, DemuxError> {
    let (_, _, mut reader) = stts.full_box()?;
    let count = reader.u32()?;
    let entries = reader.entries::<SttsEntry>(count)?;
    Ok(entries
        .iter()
        .map(|e| (e.count.get(), e.delta.get()))
        .collect())
}

/// Version 0 offsets are unsigned, version 1 offsets are signed.
fn parse_ctts(ctts: &Mp4Box<'_>) -> Result<Vec<(u32, i64)>, DemuxError> {
    let (version, _, mut reader) = ctts.full_box()?;
    let count = reader.u32()?;
    let entries = reader.entries::<CttsEntry>(count)?;
    Ok(entries
        .iter()
        .map(|e| {
            let offset = if version == 0 {
                i64::from(e.offset.get() as u32)
            } else {
                i64::from(e.offset.get())
            };
            (e.count.get(), offset)
        })
        .collect())
}

fn parse_stss(stss: &Mp4Box<'_>) -> Result<Vec<u32>, DemuxError> {
    let (_, _, mut reader) = stss.full_box()?;
    let count = reader.u32()?;
    let entries = reader.entries::<U32>(count)?;
    let mut sync: Vec<u32> = entries.iter().map(|e| e.get()).collect();
    sync.sort_unstable();
    Ok(sync)
}
