//! Host application
//!
//! Broadcasts a video/audio stream to every viewer that connects. With no
//! OS capture back-end wired in, the synthetic test pattern and tone
//! sources exercise the full transport.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lanmirror::capture::{TestPatternSource, ToneSource};
use lanmirror::codec::{PassthroughAudioEncoder, PassthroughVideoEncoder, VideoEncoder};
use lanmirror::constants::*;
use lanmirror::pipeline::{AudioCapturePath, HostPipeline};

struct Args {
    port: u16,
    fps: u32,
    bitrate: u32,
    width: u32,
    height: u32,
    verbose: bool,
}

fn print_usage(prog: &str) {
    eprintln!("Usage:");
    eprintln!("  {prog} [--port PORT] [--fps FPS] [--bitrate BPS] [--resolution WxH] [--verbose]");
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        port: DEFAULT_PORT,
        fps: DEFAULT_FPS,
        bitrate: DEFAULT_VIDEO_BITRATE,
        width: 1280,
        height: 720,
        verbose: false,
    };

    let argv: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--port" if i + 1 < argv.len() => {
                i += 1;
                args.port = argv[i].parse()?;
            }
            "--fps" if i + 1 < argv.len() => {
                i += 1;
                args.fps = argv[i].parse()?;
            }
            "--bitrate" if i + 1 < argv.len() => {
                i += 1;
                args.bitrate = argv[i].parse()?;
            }
            "--resolution" if i + 1 < argv.len() => {
                i += 1;
                let (w, h) = argv[i]
                    .split_once('x')
                    .ok_or_else(|| anyhow::anyhow!("resolution must be WxH"))?;
                args.width = w.parse()?;
                args.height = h.parse()?;
            }
            "--verbose" | "-v" => args.verbose = true,
            other => {
                print_usage(&argv[0]);
                bail!("unknown argument: {other}");
            }
        }
        i += 1;
    }
    Ok(args)
}

fn main() -> Result<()> {
    let args = parse_args()?;

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting host: {}x{} @ {} fps, {} bps, port {}",
        args.width,
        args.height,
        args.fps,
        args.bitrate,
        args.port
    );

    let video_source = Box::new(TestPatternSource::new(args.width, args.height)?);
    let encoder = Arc::new(PassthroughVideoEncoder::new(
        args.width,
        args.height,
        args.fps,
        args.bitrate,
    )?);
    let audio = AudioCapturePath {
        source: Box::new(ToneSource::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, 440.0)?),
        encoder: Box::new(PassthroughAudioEncoder::new()),
    };

    let pipeline = HostPipeline::start(
        args.port,
        args.fps,
        video_source,
        encoder.clone(),
        Some(audio),
        None,
    )?;

    tracing::info!(
        "Host ready on port {} (Ctrl+C to stop)",
        pipeline.local_addr()?.port()
    );

    loop {
        std::thread::sleep(Duration::from_secs(5));
        tracing::info!(
            "Stats: {} peers, max rtt {:.1} ms, {} frames encoded, bitrate {}",
            pipeline.server().peer_count(),
            pipeline.server().max_rtt_ms(),
            encoder.frames_encoded(),
            encoder.bitrate(),
        );
    }
}
