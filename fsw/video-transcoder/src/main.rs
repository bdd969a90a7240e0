use std::path::{Path, PathBuf};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use transcode::provider::passthrough::PassthroughPlatform;
use transcode::{Mp4File, SourceTrack, TranscodeConfig, serialize_config_box};

mod config;

/// Re-encodes the first video track of an MP4 file
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Transcode INPUT into OUTPUT
    Transcode(TranscodeArgs),
    /// Print the track index of INPUT
    Probe { input: PathBuf },
}

#[derive(clap::Args, Debug)]
struct TranscodeArgs {
    input: PathBuf,
    output: PathBuf,
    /// Target codec string, e.g. avc1.42001e
    #[arg(long)]
    codec: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Target bitrate in bits per second
    #[arg(short, long)]
    bitrate: Option<u64>,
    #[arg(long)]
    framerate: Option<f64>,
    /// Take codec and dimensions from the source track
    #[arg(long)]
    match_source: bool,
    /// Write moov after mdat
    #[arg(long)]
    no_fast_start: bool,
    /// Provider queue bound; 0 disables backpressure
    #[arg(long)]
    max_queue_depth: Option<usize>,
}

impl TranscodeArgs {
    fn apply(&self, config: &mut TranscodeConfig) {
        if let Some(codec) = &self.codec {
            config.codec = codec.clone();
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(bitrate) = self.bitrate {
            config.bitrate = bitrate;
        }
        if let Some(framerate) = self.framerate {
            config.framerate = framerate;
        }
        if self.no_fast_start {
            config.fast_start = false;
        }
        if let Some(depth) = self.max_queue_depth {
            config.max_queue_depth = depth;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Transcode(args) => {
            let mut config = config::load(cli.config.as_deref())?;
            args.apply(&mut config);
            run_transcode(args, config).await
        }
        Commands::Probe { input } => run_probe(input).await,
    }
}

async fn read_input(input: &Path) -> miette::Result<Mp4File> {
    let data = tokio::fs::read(input).await.into_diagnostic()?;
    Ok(Mp4File::parse(Bytes::from(data)).map_err(transcode::Error::from)?)
}

async fn run_transcode(args: TranscodeArgs, mut config: TranscodeConfig) -> miette::Result<()> {
    let file = read_input(&args.input).await?;
    let track = file.video_track().map_err(transcode::Error::from)?;
    if args.match_source {
        config.codec = track.codec.clone();
        config.width = track.coded_width;
        config.height = track.coded_height;
    }
    let description = file
        .extract_decoder_config(track.id)
        .map(|config_box| serialize_config_box(&config_box))
        .map_err(transcode::Error::from)?;
    let platform = PassthroughPlatform::new(SourceTrack::new(track, Some(description)));

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        let _drop = ctrl_c_cancel.drop_guard();
        tokio::signal::ctrl_c().await
    });

    let transcoded = transcode::transcode_file(&platform, &file, &config, cancel).await?;
    tokio::fs::write(&args.output, &transcoded.buffer)
        .await
        .into_diagnostic()?;
    info!(
        output = %args.output.display(),
        codec = %transcoded.encoder_config.codec,
        frames = transcoded.stats.video_frames,
        duration_secs = transcoded.stats.duration_secs,
        bytes = transcoded.stats.bytes_written,
        "transcode complete"
    );
    Ok(())
}

async fn run_probe(input: PathBuf) -> miette::Result<()> {
    let file = read_input(&input).await?;
    let info = file.info();
    let brand = info
        .major_brand
        .map(|brand| String::from_utf8_lossy(&brand).into_owned())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}: brand {brand}, timescale {}, duration {}{}",
        input.display(),
        info.timescale,
        info.duration,
        if info.is_fragmented { ", fragmented" } else { "" }
    );
    for track in &info.tracks {
        println!(
            "  track {} {:?} {} {}x{} timescale {} samples {}",
            track.id,
            track.media_type,
            track.codec,
            track.coded_width,
            track.coded_height,
            track.timescale,
            track.sample_count,
        );
    }
    Ok(())
}
