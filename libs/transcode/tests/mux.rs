use bytes::Bytes;
use transcode::demux::{CodecConfigBox, Mp4File};
use transcode::mux::{FirstTimestamp, Mp4Muxer, MuxError, MuxerConfig};
use transcode::provider::{ChunkKind, EncodedChunkMetadata, EncodedVideoChunk};
use transcode::VideoCodec;

mod support;
use support::find_box;

fn config(codec: VideoCodec, codec_string: &str) -> MuxerConfig {
    MuxerConfig {
        codec,
        width: 640,
        height: 360,
        first_timestamp: FirstTimestamp::Offset,
        fast_start: true,
        codec_string: Some(codec_string.to_string()),
    }
}

fn chunk(idx: i64) -> EncodedVideoChunk {
    EncodedVideoChunk {
        kind: if idx % 5 == 0 {
            ChunkKind::Key
        } else {
            ChunkKind::Delta
        },
        timestamp: 1_000_000 + idx * 40_000,
        duration: Some(40_000),
        data: Bytes::from(vec![idx as u8; 16]),
    }
}

fn mux(config: MuxerConfig, count: i64) -> (Bytes, transcode::MuxerStats) {
    let mut muxer = Mp4Muxer::new(config).unwrap();
    for idx in 0..count {
        muxer
            .add_video_chunk(chunk(idx), EncodedChunkMetadata::default())
            .unwrap();
    }
    muxer.finalize().unwrap()
}

#[test]
fn vp9_output_reads_back() {
    let (out, stats) = mux(config(VideoCodec::Vp9, "vp09.00.10.08"), 10);
    assert_eq!(stats.video_frames, 10);
    assert!((stats.duration_secs - 0.4).abs() < 1e-9);

    let file = Mp4File::parse(out).unwrap();
    let track = file.video_track().unwrap();
    assert_eq!(track.codec, "vp09.00.10.08");
    assert_eq!((track.coded_width, track.coded_height), (640, 360));
    assert!(matches!(
        file.extract_decoder_config(track.id).unwrap(),
        CodecConfigBox::Vp(_)
    ));

    let samples = file.extract_samples(track.id, 4).unwrap();
    let sync: Vec<u32> = samples
        .iter()
        .filter(|s| s.is_sync)
        .map(|s| s.number)
        .collect();
    assert_eq!(sync, vec![1, 6]);
    assert_eq!(samples[0].timestamp_us(), 0);
    assert_eq!(samples[9].timestamp_us(), 360_000);
}

#[test]
fn av1_output_reads_back() {
    let (out, _) = mux(config(VideoCodec::Av1, "av01.0.08M.10"), 3);
    let file = Mp4File::parse(out).unwrap();
    assert_eq!(file.video_track().unwrap().codec, "av01.0.08M.10");
}

#[test]
fn strict_first_timestamp_keeps_the_origin() {
    let mut muxer = Mp4Muxer::new(MuxerConfig {
        first_timestamp: FirstTimestamp::Strict,
        ..config(VideoCodec::Vp9, "vp09.00.10.08")
    })
    .unwrap();
    let mut first = chunk(0);
    first.timestamp = 0;
    muxer
        .add_video_chunk(first, EncodedChunkMetadata::default())
        .unwrap();
    assert_eq!(
        muxer.add_video_chunk(
            EncodedVideoChunk {
                data: Bytes::new(),
                ..chunk(1)
            },
            EncodedChunkMetadata::default()
        ),
        Err(MuxError::EmptyChunk {
            timestamp: 1_040_000
        })
    );
    assert_eq!(muxer.sample_count(), 1);
}

#[test]
fn box_layout() {
    let (out, _) = mux(config(VideoCodec::Vp9, "vp09.00.10.08"), 2);
    let tkhd = find_box(&out, &[b"moov", b"trak", b"tkhd"]).unwrap();
    assert_eq!(&tkhd[..4], &[0, 0, 0, 3], "tkhd is enabled and in movie");
    let mdhd = find_box(&out, &[b"moov", b"trak", b"mdia", b"mdhd"]).unwrap();
    assert_eq!(u32::from_be_bytes(mdhd[12..16].try_into().unwrap()), 90_000);
    let hdlr = find_box(&out, &[b"moov", b"trak", b"mdia", b"hdlr"]).unwrap();
    assert_eq!(&hdlr[8..12], b"vide");
    assert!(find_box(&out, &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"ctts"]).is_none());
}
