//! Viewer pipeline: receive → reassemble → decode → present
//!
//! The recv thread is the socket's only receiver. Decode threads drain the
//! reassembled queues; the calling thread runs the render loop and keeps
//! only the latest decoded frame — for a mirrored screen, latency beats
//! frame-accurate playback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::capture::AudioSource;
use crate::codec::{AudioDecoder, AudioEncoder, VideoDecoder};
use crate::constants::DECODED_QUEUE_CAPACITY;
use crate::error::{Error, NetworkError};
use crate::net::client::Client;
use crate::queue::BoundedQueue;
use crate::render::{AudioSink, VideoSink};
use crate::types::{EncodedPacket, RawVideoFrame};

const DECODE_POP_TIMEOUT: Duration = Duration::from_millis(5);

/// Minimum spacing between keyframe requests issued on decode failures.
const RESYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Decode-and-play path for the broadcast audio stream.
pub struct ViewerAudioPath {
    pub decoder: Box<dyn AudioDecoder>,
    pub sink: Box<dyn AudioSink>,
}

/// Microphone capture sent upstream to the host.
pub struct MicrophonePath {
    pub source: Box<dyn AudioSource>,
    pub encoder: Box<dyn AudioEncoder>,
}

/// The viewer side of a streaming session.
pub struct ViewerPipeline {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    client: Arc<Client>,
    video_queue: Arc<BoundedQueue<EncodedPacket>>,
    audio_queue: Arc<BoundedQueue<EncodedPacket>>,
    decoded_queue: Arc<BoundedQueue<RawVideoFrame>>,
}

impl ViewerPipeline {
    /// Launch the receive and decode threads over an already-connected
    /// client. The first action is a keyframe request so playback starts at
    /// a decodable boundary.
    pub fn start(
        client: Arc<Client>,
        mut video_decoder: Box<dyn VideoDecoder>,
        audio: Option<ViewerAudioPath>,
        microphone: Option<MicrophonePath>,
    ) -> Result<Self, Error> {
        if !client.is_connected() {
            return Err(NetworkError::NotConnected.into());
        }

        let config = client.stream_config();
        if !config.codec_data.is_empty() {
            if let Err(e) = video_decoder.set_codec_data(&config.codec_data) {
                warn!("Codec data rejected: {}", e);
            }
        }

        client.request_keyframe();

        let running = Arc::new(AtomicBool::new(true));
        let video_queue = Arc::new(BoundedQueue::new(DECODED_QUEUE_CAPACITY * 4));
        let audio_queue = Arc::new(BoundedQueue::new(DECODED_QUEUE_CAPACITY * 4));
        let decoded_queue = Arc::new(BoundedQueue::new(DECODED_QUEUE_CAPACITY));

        let mut threads = Vec::new();

        {
            let running = running.clone();
            let client = client.clone();
            let video_queue = video_queue.clone();
            let audio_queue = audio_queue.clone();
            threads.push(
                thread::Builder::new()
                    .name("viewer-recv".into())
                    .spawn(move || {
                        while running.load(Ordering::Relaxed) && client.is_connected() {
                            client.poll(&video_queue, &audio_queue);
                        }
                    })?,
            );
        }

        {
            let running = running.clone();
            let client = client.clone();
            let video_queue = video_queue.clone();
            let decoded_queue = decoded_queue.clone();
            threads.push(
                thread::Builder::new()
                    .name("viewer-video-decode".into())
                    .spawn(move || {
                        let mut last_resync: Option<Instant> = None;
                        while running.load(Ordering::Relaxed) {
                            let Some(packet) = video_queue.wait_pop(DECODE_POP_TIMEOUT) else {
                                if video_queue.is_closed() {
                                    break;
                                }
                                continue;
                            };
                            match video_decoder.decode(&packet) {
                                Ok(Some(frame)) => {
                                    decoded_queue.push(frame);
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!("Decode failed: {}", e);
                                    // Resync at the next keyframe
                                    if last_resync.map_or(true, |t| t.elapsed() >= RESYNC_INTERVAL)
                                    {
                                        last_resync = Some(Instant::now());
                                        client.request_keyframe();
                                    }
                                }
                            }
                        }
                    })?,
            );
        }

        if let Some(ViewerAudioPath {
            mut decoder,
            mut sink,
        }) = audio
        {
            let running = running.clone();
            let audio_queue = audio_queue.clone();
            threads.push(
                thread::Builder::new()
                    .name("viewer-audio-decode".into())
                    .spawn(move || {
                        while running.load(Ordering::Relaxed) {
                            let Some(packet) = audio_queue.wait_pop(DECODE_POP_TIMEOUT) else {
                                if audio_queue.is_closed() {
                                    break;
                                }
                                continue;
                            };
                            match decoder.decode(&packet) {
                                Ok(Some(frame)) => sink.play(&frame),
                                Ok(None) => {}
                                Err(e) => warn!("Audio decode failed: {}", e),
                            }
                        }
                    })?,
            );
        }

        if let Some(MicrophonePath {
            mut source,
            mut encoder,
        }) = microphone
        {
            let running = running.clone();
            let client = client.clone();
            threads.push(
                thread::Builder::new()
                    .name("viewer-microphone".into())
                    .spawn(move || {
                        // The source paces itself (blocks per frame)
                        while running.load(Ordering::Relaxed) && client.is_connected() {
                            match source.next_frame() {
                                Ok(frame) => match encoder.encode(&frame) {
                                    Ok(Some(packet)) => client.send_audio(&packet),
                                    Ok(None) => {}
                                    Err(e) => warn!("Microphone encode failed: {}", e),
                                },
                                Err(e) => warn!("Microphone capture failed: {}", e),
                            }
                        }
                    })?,
            );
        }

        info!("Viewer pipeline started");
        Ok(Self {
            running,
            threads,
            client,
            video_queue,
            audio_queue,
            decoded_queue,
        })
    }

    /// Render loop on the calling thread. Drains the decoded queue keeping
    /// only the latest frame, presents it, and exits when the sink reports
    /// quit, the connection drops, or the pipeline is stopped. On exit all
    /// other threads are signalled.
    pub fn run(&self, sink: &mut dyn VideoSink) {
        while self.running.load(Ordering::Relaxed) && self.client.is_connected() {
            if !sink.poll_events() {
                break;
            }

            let mut latest = None;
            while let Some(frame) = self.decoded_queue.try_pop() {
                latest = Some(frame);
            }
            match latest {
                Some(frame) => sink.present(&frame),
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Stop all threads and disconnect: signal, wake queue waiters, join in
    /// reverse spawn order, send BYE.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.video_queue.close();
        self.audio_queue.close();
        self.decoded_queue.close();
        while let Some(handle) = self.threads.pop() {
            let _ = handle.join();
        }
        self.client.disconnect();
        info!("Viewer pipeline stopped");
    }
}

impl Drop for ViewerPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
