use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use transcode::provider::{
    ChunkKind, ConfigSupport, DecoderConfig, DecoderOutput, DecoderOutputTx, EncodeOptions,
    EncodedChunkMetadata, EncodedVideoChunk, EncoderConfig, EncoderOutput, EncoderOutputTx,
    FrameLease, HardwareAcceleration, Platform, ProviderError, VideoDecoder, VideoEncoder,
    VideoFrame,
};

/// `avcC` record for constrained baseline, level 3.0, with one tiny SPS and PPS.
#[allow(dead_code)]
pub const AVCC: &[u8] = &[
    0x01, 0x42, 0x00, 0x1e, 0xff, 0xe1, 0x00, 0x04, 0x67, 0x42, 0x00, 0x1e, 0x01, 0x00, 0x02,
    0x68, 0xce,
];

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct SampleSpec {
    pub data: Vec<u8>,
    pub duration: u32,
    pub cts_offset: u32,
    pub sync: bool,
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct TrackSpec {
    pub handler: [u8; 4],
    pub sample_entry: [u8; 4],
    pub config: Option<([u8; 4], Vec<u8>)>,
    pub width: u16,
    pub height: u16,
    pub timescale: u32,
    pub samples: Vec<SampleSpec>,
}

impl TrackSpec {
    /// An AVC track of `count` samples at ~30 fps: presentation times 0, 33, 67, ...
    /// in a 1000 Hz timescale, with only the first sample a sync sample.
    #[allow(dead_code)]
    pub fn avc(count: u32, width: u16, height: u16) -> Self {
        let time = |idx: u32| (idx * 1000 + 15) / 30;
        let samples = (0..count)
            .map(|idx| SampleSpec {
                data: vec![0, 0, 0, 2, if idx == 0 { 0x65 } else { 0x41 }, idx as u8],
                duration: time(idx + 1) - time(idx),
                cts_offset: 0,
                sync: idx == 0,
            })
            .collect();
        TrackSpec {
            handler: *b"vide",
            sample_entry: *b"avc1",
            config: Some((*b"avcC", AVCC.to_vec())),
            width,
            height,
            timescale: 1000,
            samples,
        }
    }

    #[allow(dead_code)]
    pub fn audio(count: u32) -> Self {
        TrackSpec {
            handler: *b"soun",
            sample_entry: *b"mp4a",
            config: None,
            width: 0,
            height: 0,
            timescale: 48_000,
            samples: (0..count)
                .map(|idx| SampleSpec {
                    data: vec![0x21, idx as u8, 0x00],
                    duration: 1024,
                    cts_offset: 0,
                    sync: true,
                })
                .collect(),
        }
    }

    fn duration(&self) -> u32 {
        self.samples
            .iter()
            .fold(0u32, |total, s| total.saturating_add(s.duration))
    }
}

#[allow(dead_code)]
pub fn build_box(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(typ);
    out.extend_from_slice(payload);
    out
}

fn full_box(typ: &[u8; 4], version: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![version, 0, 0, 0];
    body.extend_from_slice(payload);
    build_box(typ, &body)
}

fn be32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// Writes `ftyp`, one `mdat` holding every track's samples track by track, then
/// `moov`.
#[allow(dead_code)]
pub fn build_mp4(tracks: &[TrackSpec]) -> Vec<u8> {
    let ftyp = build_box(b"ftyp", b"isom\0\0\x02\0isomiso2avc1mp41");
    let mut mdat_payload = Vec::new();
    let mut chunk_offsets = Vec::new();
    for track in tracks {
        chunk_offsets.push((ftyp.len() + 8 + mdat_payload.len()) as u32);
        for sample in &track.samples {
            mdat_payload.extend_from_slice(&sample.data);
        }
    }

    let movie_duration = tracks
        .iter()
        .map(|t| u64::from(t.duration()) * 1000 / u64::from(t.timescale))
        .max()
        .unwrap_or(0) as u32;
    let mut mvhd = be32(&[0, 0, 1000, movie_duration]);
    mvhd.resize(96, 0);
    let mut moov = full_box(b"mvhd", 0, &mvhd);
    for (idx, (track, chunk_offset)) in tracks.iter().zip(chunk_offsets).enumerate() {
        moov.extend(build_trak(idx as u32 + 1, track, chunk_offset));
    }

    let mut out = ftyp;
    out.extend(build_box(b"mdat", &mdat_payload));
    out.extend(build_box(b"moov", &moov));
    out
}

fn build_trak(track_id: u32, track: &TrackSpec, chunk_offset: u32) -> Vec<u8> {
    let mut tkhd = be32(&[0, 0, track_id, 0, track.duration()]);
    tkhd.resize(80, 0);

    let mut mdhd = be32(&[0, 0, track.timescale, track.duration()]);
    mdhd.extend_from_slice(&[0x55, 0xc4, 0, 0]);

    let mut hdlr = be32(&[0]);
    hdlr.extend_from_slice(&track.handler);
    hdlr.extend_from_slice(&[0; 12]);
    hdlr.push(0);

    let mut minf = Vec::new();
    if &track.handler == b"vide" {
        minf.extend(full_box(b"vmhd", 0, &[0; 8]));
    }
    minf.extend(build_box(b"stbl", &build_stbl(track, chunk_offset)));

    let mut mdia = full_box(b"mdhd", 0, &mdhd);
    mdia.extend(full_box(b"hdlr", 0, &hdlr));
    mdia.extend(build_box(b"minf", &minf));

    let mut trak = full_box(b"tkhd", 0, &tkhd);
    trak.extend(build_box(b"mdia", &mdia));
    build_box(b"trak", &trak)
}

fn build_stbl(track: &TrackSpec, chunk_offset: u32) -> Vec<u8> {
    let count = track.samples.len() as u32;

    let mut entry = vec![0u8; 6];
    entry.extend_from_slice(&1u16.to_be_bytes());
    if &track.handler == b"vide" {
        entry.extend_from_slice(&[0; 16]);
        entry.extend_from_slice(&track.width.to_be_bytes());
        entry.extend_from_slice(&track.height.to_be_bytes());
        entry.extend_from_slice(&be32(&[0x0048_0000, 0x0048_0000, 0]));
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0; 32]);
        entry.extend_from_slice(&0x0018u16.to_be_bytes());
        entry.extend_from_slice(&0xffffu16.to_be_bytes());
        if let Some((kind, record)) = &track.config {
            entry.extend(build_box(kind, record));
        }
    } else {
        entry.extend_from_slice(&[0; 20]);
    }
    let mut stsd = be32(&[1]);
    stsd.extend(build_box(&track.sample_entry, &entry));

    let mut stts = be32(&[count]);
    for sample in &track.samples {
        stts.extend(be32(&[1, sample.duration]));
    }

    let mut stbl = full_box(b"stsd", 0, &stsd);
    stbl.extend(full_box(b"stts", 0, &stts));
    if track.samples.iter().any(|s| s.cts_offset != 0) {
        let mut ctts = be32(&[count]);
        for sample in &track.samples {
            ctts.extend(be32(&[1, sample.cts_offset]));
        }
        stbl.extend(full_box(b"ctts", 0, &ctts));
    }
    stbl.extend(full_box(b"stsc", 0, &be32(&[1, 1, count, 1])));
    let mut stsz = be32(&[0, count]);
    for sample in &track.samples {
        stsz.extend(be32(&[sample.data.len() as u32]));
    }
    stbl.extend(full_box(b"stsz", 0, &stsz));
    stbl.extend(full_box(b"stco", 0, &be32(&[1, chunk_offset])));
    if !track.samples.iter().all(|s| s.sync) {
        let sync: Vec<u32> = track
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sync)
            .map(|(idx, _)| idx as u32 + 1)
            .collect();
        let mut stss = be32(&[sync.len() as u32]);
        stss.extend(be32(&sync));
        stbl.extend(full_box(b"stss", 0, &stss));
    }
    stbl
}

/// Light-weight representation of an MP4 box used for layout assertions.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub struct BoxRef {
    pub typ: [u8; 4],
    pub size: usize,
    pub offset: usize,
}

impl BoxRef {
    #[allow(dead_code)]
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset + 8..self.offset + self.size]
    }
}

/// Parses consecutive boxes from `data`, with offsets relative to `data`.
#[allow(dead_code)]
pub fn parse_boxes(data: &[u8]) -> Vec<BoxRef> {
    let mut boxes = Vec::new();
    let mut cursor = 0;
    while cursor + 8 <= data.len() {
        let size = u32::from_be_bytes(data[cursor..cursor + 4].try_into().unwrap()) as usize;
        if size < 8 || cursor + size > data.len() {
            break;
        }
        let typ = data[cursor + 4..cursor + 8].try_into().unwrap();
        boxes.push(BoxRef {
            typ,
            size,
            offset: cursor,
        });
        cursor += size;
    }
    boxes
}

/// Follows a path of plain container boxes and returns the last box's payload.
#[allow(dead_code)]
pub fn find_box<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    let (first, rest) = path.split_first()?;
    let found = parse_boxes(data).into_iter().find(|b| &b.typ == *first)?;
    let payload = found.payload(data);
    if rest.is_empty() {
        Some(payload)
    } else {
        find_box(payload, rest)
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    EncoderCheck(HardwareAcceleration),
    DecoderCheck(String),
    CreateDecoder,
    CreateEncoder,
    Decode(i64),
    FrameOut(i64),
    Encode { timestamp: i64, key_frame: bool },
    ChunkOut(i64),
    DecoderFlush,
    EncoderFlush,
    DecoderClose,
    EncoderClose,
}

/// Knobs for [`RecordingPlatform`].
#[allow(dead_code)]
pub struct Behavior {
    pub encoder_check: fn(&EncoderConfig) -> Result<bool, ProviderError>,
    pub decoder_supported: bool,
    /// Send a decoder error instead of the frame for this decode call (0-based).
    pub decoder_error_at: Option<usize>,
    /// Send an encoder error instead of the chunk for this encode call (0-based).
    pub encoder_error_at: Option<usize>,
    /// Cancel the token once this many chunks have been submitted to the decoder.
    pub cancel_after_decodes: Option<(usize, CancellationToken)>,
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior {
            encoder_check: |_| Ok(true),
            decoder_supported: true,
            decoder_error_at: None,
            encoder_error_at: None,
            cancel_after_decodes: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
    decoders: AtomicUsize,
    encoders: AtomicUsize,
}

/// A platform whose decoder and encoder emit output from spawned tasks, so it
/// arrives asynchronously like a real provider's. Every call is recorded.
#[allow(dead_code)]
pub struct RecordingPlatform {
    behavior: Arc<Behavior>,
    events: Arc<Mutex<Vec<Event>>>,
    counters: Arc<Counters>,
}

#[allow(dead_code)]
impl RecordingPlatform {
    pub fn new(behavior: Behavior) -> Self {
        RecordingPlatform {
            behavior: Arc::new(behavior),
            events: Arc::default(),
            counters: Arc::default(),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn frames_acquired(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn frames_released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    pub fn providers_created(&self) -> usize {
        self.counters.decoders.load(Ordering::SeqCst) + self.counters.encoders.load(Ordering::SeqCst)
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Platform for RecordingPlatform {
    type Decoder = RecordingDecoder;
    type Encoder = RecordingEncoder;

    async fn is_decoder_config_supported(
        &self,
        config: &DecoderConfig,
    ) -> Result<ConfigSupport<DecoderConfig>, ProviderError> {
        self.record(Event::DecoderCheck(config.codec.clone()));
        Ok(ConfigSupport {
            supported: self.behavior.decoder_supported,
            config: config.clone(),
        })
    }

    async fn is_encoder_config_supported(
        &self,
        config: &EncoderConfig,
    ) -> Result<ConfigSupport<EncoderConfig>, ProviderError> {
        self.record(Event::EncoderCheck(config.hardware_acceleration));
        let supported = (self.behavior.encoder_check)(config)?;
        Ok(ConfigSupport {
            supported,
            config: config.clone(),
        })
    }

    fn create_decoder(&self, output: DecoderOutputTx) -> Result<RecordingDecoder, ProviderError> {
        self.record(Event::CreateDecoder);
        self.counters.decoders.fetch_add(1, Ordering::SeqCst);
        Ok(RecordingDecoder {
            output,
            behavior: self.behavior.clone(),
            events: self.events.clone(),
            counters: self.counters.clone(),
            pending: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            configured: false,
            submitted: 0,
        })
    }

    fn create_encoder(&self, output: EncoderOutputTx) -> Result<RecordingEncoder, ProviderError> {
        self.record(Event::CreateEncoder);
        self.counters.encoders.fetch_add(1, Ordering::SeqCst);
        Ok(RecordingEncoder {
            output,
            behavior: self.behavior.clone(),
            events: self.events.clone(),
            pending: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            config: None,
            emitted: 0,
        })
    }
}

pub struct RecordingDecoder {
    output: DecoderOutputTx,
    behavior: Arc<Behavior>,
    events: Arc<Mutex<Vec<Event>>>,
    counters: Arc<Counters>,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    configured: bool,
    submitted: usize,
}

impl VideoDecoder for RecordingDecoder {
    fn configure(&mut self, _config: &DecoderConfig) -> Result<(), ProviderError> {
        self.configured = true;
        Ok(())
    }

    fn decode(&mut self, chunk: EncodedVideoChunk) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }
        if !self.configured {
            return Err(ProviderError::Unconfigured);
        }
        self.events.lock().unwrap().push(Event::Decode(chunk.timestamp));
        let fail = self.behavior.decoder_error_at == Some(self.submitted);
        self.submitted += 1;
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Some((after, cancel)) = &self.behavior.cancel_after_decodes {
            if self.submitted == *after {
                cancel.cancel();
            }
        }

        let output = self.output.clone();
        let events = self.events.clone();
        let counters = self.counters.clone();
        let pending = self.pending.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if !closed.load(Ordering::SeqCst) {
                let message = if fail {
                    DecoderOutput::Error(ProviderError::Runtime("corrupt slice".to_string()))
                } else {
                    counters.acquired.fetch_add(1, Ordering::SeqCst);
                    let lease_counters = counters.clone();
                    events.lock().unwrap().push(Event::FrameOut(chunk.timestamp));
                    DecoderOutput::Frame(
                        VideoFrame::new(chunk.timestamp, chunk.duration, 320, 240, chunk.data)
                            .with_lease(FrameLease::new(move || {
                                lease_counters.released.fetch_add(1, Ordering::SeqCst);
                            })),
                    )
                };
                let _ = output.send(message);
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    fn decode_queue_size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn flush(&mut self) -> Result<(), ProviderError> {
        self.events.lock().unwrap().push(Event::DecoderFlush);
        while self.pending.load(Ordering::SeqCst) > 0 {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.events.lock().unwrap().push(Event::DecoderClose);
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct RecordingEncoder {
    output: EncoderOutputTx,
    behavior: Arc<Behavior>,
    events: Arc<Mutex<Vec<Event>>>,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    config: Option<EncoderConfig>,
    emitted: usize,
}

impl VideoEncoder for RecordingEncoder {
    fn configure(&mut self, config: &EncoderConfig) -> Result<(), ProviderError> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn encode(&mut self, frame: &VideoFrame, options: EncodeOptions) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }
        let config = self.config.as_ref().ok_or(ProviderError::Unconfigured)?;
        self.events.lock().unwrap().push(Event::Encode {
            timestamp: frame.timestamp(),
            key_frame: options.key_frame,
        });
        let fail = self.behavior.encoder_error_at == Some(self.emitted);
        let first = self.emitted == 0;
        self.emitted += 1;
        let timestamp = frame.timestamp();
        let message = if fail {
            EncoderOutput::Error(ProviderError::Runtime("encoder stalled".to_string()))
        } else {
            let chunk = EncodedVideoChunk {
                kind: if first || options.key_frame {
                    ChunkKind::Key
                } else {
                    ChunkKind::Delta
                },
                timestamp,
                duration: frame.duration(),
                data: frame.data().clone(),
            };
            let metadata = EncodedChunkMetadata {
                decoder_config: first.then(|| DecoderConfig {
                    codec: config.codec.clone(),
                    coded_width: config.width,
                    coded_height: config.height,
                    hardware_acceleration: config.hardware_acceleration,
                    description: Some(Bytes::from_static(AVCC)),
                }),
            };
            EncoderOutput::Chunk(chunk, metadata)
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        let output = self.output.clone();
        let events = self.events.clone();
        let pending = self.pending.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if !closed.load(Ordering::SeqCst) {
                events.lock().unwrap().push(Event::ChunkOut(timestamp));
                let _ = output.send(message);
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    fn encode_queue_size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn flush(&mut self) -> Result<(), ProviderError> {
        self.events.lock().unwrap().push(Event::EncoderFlush);
        while self.pending.load(Ordering::SeqCst) > 0 {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.events.lock().unwrap().push(Event::EncoderClose);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Installs a test subscriber once; later calls are no-ops.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
