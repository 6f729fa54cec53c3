//! Viewer application
//!
//! Connects to a host and receives the stream. Headless by default: the
//! stats sink logs presentation progress in place of a real window.

use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lanmirror::codec::{PassthroughAudioDecoder, PassthroughVideoDecoder};
use lanmirror::constants::DEFAULT_PORT;
use lanmirror::net::Client;
use lanmirror::pipeline::{ViewerAudioPath, ViewerPipeline};
use lanmirror::render::{NullAudioSink, StatsVideoSink};

struct Args {
    host: IpAddr,
    port: u16,
    verbose: bool,
}

fn print_usage(prog: &str) {
    eprintln!("Usage:");
    eprintln!("  {prog} HOST_IP [--port PORT] [--verbose]");
}

fn parse_args() -> Result<Args> {
    let argv: Vec<String> = std::env::args().collect();
    let mut host = None;
    let mut port = DEFAULT_PORT;
    let mut verbose = false;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--port" if i + 1 < argv.len() => {
                i += 1;
                port = argv[i].parse()?;
            }
            "--verbose" | "-v" => verbose = true,
            value if !value.starts_with('-') && host.is_none() => {
                host = Some(value.parse().context("invalid host address")?);
            }
            other => {
                print_usage(&argv[0]);
                bail!("unknown argument: {other}");
            }
        }
        i += 1;
    }

    let Some(host) = host else {
        print_usage(&argv[0]);
        bail!("missing host address");
    };
    Ok(Args {
        host,
        port,
        verbose,
    })
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

    tracing::info!("Connecting to {}:{}...", args.host, args.port);

    let client = Arc::new(Client::new()?);
    client
        .connect(args.host, args.port)
        .context("connection failed")?;

    let config = client.stream_config();
    tracing::info!(
        "Connected: stream {}x{} @ {} fps, audio {} Hz x{}",
        config.width,
        config.height,
        config.fps,
        config.audio_sample_rate,
        config.audio_channels
    );

    let video_decoder = Box::new(PassthroughVideoDecoder::new(config.width, config.height));
    let audio = ViewerAudioPath {
        decoder: Box::new(PassthroughAudioDecoder::new(
            config.audio_sample_rate,
            config.audio_channels,
        )),
        sink: Box::new(NullAudioSink::new()),
    };

    let mut pipeline = ViewerPipeline::start(client, video_decoder, Some(audio), None)?;

    let mut sink = StatsVideoSink::new(30);
    pipeline.run(&mut sink);

    pipeline.stop();
    tracing::info!("Total frames presented: {}", sink.frames_presented());
    Ok(())
}
