//! Host pipeline: capture → encode → fragment → broadcast
//!
//! Thread layout (spawn order; joined in reverse):
//!
//! 1. recv/poll — protocol endpoint dispatch plus the adaptive bitrate tick
//! 2. send — drains both encoded queues and broadcasts
//! 3. video encode — raw ring to encoded ring
//! 4. video capture — paced at 1/fps, drops frames when the ring is full
//! 5. audio capture / 6. audio encode (optional)
//! 7. upstream audio decode (optional)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::capture::{AudioSource, VideoSource};
use crate::codec::{AudioDecoder, AudioEncoder, VideoEncoder};
use crate::constants::{
    AUDIO_ENCODED_QUEUE_CAPACITY, AUDIO_RAW_QUEUE_CAPACITY, DEFAULT_CHANNELS,
    DEFAULT_SAMPLE_RATE, VIDEO_RING_CAPACITY,
};
use crate::error::{Error, NetworkError};
use crate::net::server::Server;
use crate::queue::{BoundedQueue, SpscRing};
use crate::render::AudioSink;
use crate::types::{EncodedPacket, RawAudioFrame, RawVideoFrame, StreamConfig};

/// Cadence of the adaptive bitrate evaluation.
const ABR_INTERVAL: Duration = Duration::from_secs(5);

/// System-audio capture plus its encoder.
pub struct AudioCapturePath {
    pub source: Box<dyn AudioSource>,
    pub encoder: Box<dyn AudioEncoder>,
}

/// Decode-and-play path for viewer microphone audio.
pub struct UpstreamAudioPath {
    pub decoder: Box<dyn AudioDecoder>,
    pub sink: Box<dyn AudioSink>,
}

/// The host side of a streaming session.
pub struct HostPipeline {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    server: Arc<Server>,
    encoder: Arc<dyn VideoEncoder>,
    raw_audio: Arc<BoundedQueue<RawAudioFrame>>,
    encoded_audio: Arc<BoundedQueue<EncodedPacket>>,
    upstream_audio: Arc<BoundedQueue<EncodedPacket>>,
}

impl HostPipeline {
    /// Bind the host port and launch all pipeline threads.
    pub fn start(
        port: u16,
        fps: u32,
        mut video_source: Box<dyn VideoSource>,
        encoder: Arc<dyn VideoEncoder>,
        audio: Option<AudioCapturePath>,
        upstream: Option<UpstreamAudioPath>,
    ) -> Result<Self, Error> {
        if fps == 0 {
            return Err(Error::Config("fps must be nonzero".into()));
        }

        let (audio_sample_rate, audio_channels) = audio
            .as_ref()
            .map(|a| (a.source.sample_rate(), a.source.channels()))
            .unwrap_or((DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS));

        let config = StreamConfig {
            width: video_source.width(),
            height: video_source.height(),
            fps,
            video_bitrate: encoder.bitrate(),
            audio_sample_rate,
            audio_channels,
            codec_data: encoder.codec_data(),
        };
        let target_bitrate = config.video_bitrate;

        let server = Arc::new(Server::start(port, config)?);
        let running = Arc::new(AtomicBool::new(true));

        let raw_video: Arc<SpscRing<RawVideoFrame>> =
            Arc::new(SpscRing::new(VIDEO_RING_CAPACITY));
        let encoded_video: Arc<SpscRing<EncodedPacket>> =
            Arc::new(SpscRing::new(VIDEO_RING_CAPACITY));
        let raw_audio = Arc::new(BoundedQueue::new(AUDIO_RAW_QUEUE_CAPACITY));
        let encoded_audio = Arc::new(BoundedQueue::new(AUDIO_ENCODED_QUEUE_CAPACITY));
        let upstream_audio = Arc::new(BoundedQueue::new(AUDIO_ENCODED_QUEUE_CAPACITY));

        // Protocol callbacks: cheap, run on the recv thread
        {
            let encoder = encoder.clone();
            server.on_keyframe_request(move || encoder.request_keyframe());
        }
        if upstream.is_some() {
            let queue = upstream_audio.clone();
            server.on_client_audio(move |packet| {
                queue.push(packet);
            });
        }

        let mut threads = Vec::new();

        {
            let running = running.clone();
            let server = server.clone();
            let encoder = encoder.clone();
            threads.push(
                thread::Builder::new()
                    .name("host-poll".into())
                    .spawn(move || {
                        let mut last_abr = Instant::now();
                        while running.load(Ordering::Relaxed) {
                            server.poll();
                            if last_abr.elapsed() >= ABR_INTERVAL {
                                last_abr = Instant::now();
                                abr_step(&server, encoder.as_ref(), target_bitrate);
                            }
                        }
                    })?,
            );
        }

        {
            let running = running.clone();
            let server = server.clone();
            let encoded_video = encoded_video.clone();
            let encoded_audio = encoded_audio.clone();
            threads.push(
                thread::Builder::new()
                    .name("host-send".into())
                    .spawn(move || {
                        while running.load(Ordering::Relaxed) {
                            let mut idle = true;
                            if let Some(packet) = encoded_video.try_pop() {
                                server.broadcast(&packet);
                                idle = false;
                            }
                            if let Some(packet) = encoded_audio.try_pop() {
                                server.broadcast(&packet);
                                idle = false;
                            }
                            if idle {
                                thread::sleep(Duration::from_millis(1));
                            }
                        }
                    })?,
            );
        }

        {
            let running = running.clone();
            let encoder = encoder.clone();
            let raw_video = raw_video.clone();
            let encoded_video = encoded_video.clone();
            threads.push(
                thread::Builder::new()
                    .name("host-encode".into())
                    .spawn(move || {
                        while running.load(Ordering::Relaxed) {
                            match raw_video.try_pop() {
                                Some(frame) => match encoder.encode(&frame) {
                                    Ok(Some(packet)) => {
                                        if !encoded_video.try_push(packet) {
                                            debug!("Encoded ring full, dropping frame");
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(e) => warn!("Encode failed: {}", e),
                                },
                                None => thread::sleep(Duration::from_millis(1)),
                            }
                        }
                    })?,
            );
        }

        {
            let running = running.clone();
            let raw_video = raw_video.clone();
            let interval = Duration::from_micros(1_000_000 / fps as u64);
            threads.push(
                thread::Builder::new()
                    .name("host-capture".into())
                    .spawn(move || {
                        info!("Capture loop started ({} us interval)", interval.as_micros());
                        while running.load(Ordering::Relaxed) {
                            let start = Instant::now();
                            match video_source.next_frame() {
                                Ok(frame) => {
                                    if !raw_video.try_push(frame) {
                                        debug!("Raw ring full, dropping frame");
                                    }
                                }
                                Err(e) => warn!("Capture failed: {}", e),
                            }
                            let elapsed = start.elapsed();
                            if elapsed < interval {
                                thread::sleep(interval - elapsed);
                            }
                        }
                    })?,
            );
        }

        if let Some(AudioCapturePath {
            mut source,
            mut encoder,
        }) = audio
        {
            {
                let running = running.clone();
                let raw_audio = raw_audio.clone();
                threads.push(
                    thread::Builder::new()
                        .name("host-audio-capture".into())
                        .spawn(move || {
                            // The source paces itself (blocks per frame)
                            while running.load(Ordering::Relaxed) {
                                match source.next_frame() {
                                    Ok(frame) => {
                                        if !raw_audio.push(frame) {
                                            break; // queue closed
                                        }
                                    }
                                    Err(e) => warn!("Audio capture failed: {}", e),
                                }
                            }
                        })?,
                );
            }
            {
                let running = running.clone();
                let raw_audio = raw_audio.clone();
                let encoded_audio = encoded_audio.clone();
                threads.push(
                    thread::Builder::new()
                        .name("host-audio-encode".into())
                        .spawn(move || {
                            while running.load(Ordering::Relaxed) {
                                let Some(frame) = raw_audio.wait_pop(Duration::from_millis(100))
                                else {
                                    continue;
                                };
                                match encoder.encode(&frame) {
                                    Ok(Some(packet)) => {
                                        encoded_audio.push(packet);
                                    }
                                    Ok(None) => {}
                                    Err(e) => warn!("Audio encode failed: {}", e),
                                }
                            }
                        })?,
                );
            }
        }

        if let Some(UpstreamAudioPath {
            mut decoder,
            mut sink,
        }) = upstream
        {
            let running = running.clone();
            let upstream_audio = upstream_audio.clone();
            threads.push(
                thread::Builder::new()
                    .name("host-upstream-audio".into())
                    .spawn(move || {
                        while running.load(Ordering::Relaxed) {
                            let Some(packet) = upstream_audio.wait_pop(Duration::from_millis(100))
                            else {
                                continue;
                            };
                            match decoder.decode(&packet) {
                                Ok(Some(frame)) => sink.play(&frame),
                                Ok(None) => {}
                                Err(e) => debug!("Upstream audio decode failed: {}", e),
                            }
                        }
                    })?,
            );
        }

        info!("Host pipeline started on port {}", server.local_addr()?.port());
        Ok(Self {
            running,
            threads,
            server,
            encoder,
            raw_audio,
            encoded_audio,
            upstream_audio,
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn encoder(&self) -> &Arc<dyn VideoEncoder> {
        &self.encoder
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, NetworkError> {
        self.server.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop all threads: signal, wake queue waiters, join in reverse spawn
    /// order.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        self.raw_audio.close();
        self.encoded_audio.close();
        self.upstream_audio.close();
        while let Some(handle) = self.threads.pop() {
            let _ = handle.join();
        }
        info!("Host pipeline stopped");
    }
}

impl Drop for HostPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One adaptive-bitrate evaluation: step the encoder down under RTT
/// pressure, restore it when the network recovers, and resume on a
/// keyframe after every change.
fn abr_step(server: &Server, encoder: &dyn VideoEncoder, target_bitrate: u32) {
    let max_rtt = server.max_rtt_ms();
    let desired = next_bitrate(target_bitrate, max_rtt);
    if desired != encoder.bitrate() {
        info!(
            "Adaptive bitrate: {} -> {} (max rtt {:.1} ms)",
            encoder.bitrate(),
            desired,
            max_rtt
        );
        if let Err(e) = encoder.set_bitrate(desired) {
            warn!("Bitrate change failed: {}", e);
            return;
        }
        encoder.request_keyframe();
    }
}

/// RTT-driven bitrate policy relative to the configured target.
fn next_bitrate(target: u32, max_rtt_ms: f64) -> u32 {
    if max_rtt_ms > 100.0 {
        target / 2
    } else if max_rtt_ms > 50.0 {
        target / 4 * 3
    } else {
        target
    }
}
