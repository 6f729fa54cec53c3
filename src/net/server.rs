//! Host protocol endpoint: peer tracking, broadcast, keyframe retransmit
//!
//! Thread-safety: `broadcast` runs on the send thread while `poll` runs on
//! the recv thread. The peer table and the keyframe cache are guarded by
//! separate locks so a NACK-serving resend never stalls a broadcast and
//! vice versa; neither lock is ever taken while holding the other.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::NetworkError;
use crate::net::assembler::{Reassembler, STALE_TIMEOUT};
use crate::net::fragment::Fragmenter;
use crate::net::socket::UdpEndpoint;
use crate::protocol::{NackPayload, Packet, PacketType, PingPayload, WelcomePayload};
use crate::types::{EncodedPacket, FrameType, StreamConfig};

/// Cadence of PING broadcasts (and of the maintenance tick).
pub const PING_INTERVAL: Duration = Duration::from_secs(2);

/// A peer silent for this long is dropped (5 missed ping rounds).
pub const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// RTT samples at or above this are considered bogus.
const RTT_SANITY_LIMIT_US: u64 = 10_000_000;

const POLL_RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Invoked when a viewer asks for a fresh keyframe.
pub type KeyframeRequestHandler = Box<dyn Fn() + Send + Sync>;

/// Invoked with each complete audio packet sent upstream by a viewer.
pub type ClientAudioHandler = Box<dyn Fn(EncodedPacket) + Send + Sync>;

struct PeerRecord {
    addr: SocketAddr,
    rtt_ms: f64,
    rtt_valid: bool,
    last_seen: Instant,
    /// Cleared once the peer proves it holds the codec config (first
    /// KEYFRAME_REQ or NACK); until then STREAM_CONFIG is re-sent each tick.
    config_synced: bool,
}

#[derive(Default)]
struct KeyframeCache {
    frame_id: u16,
    /// Serialized fragment datagrams, in index order
    fragments: Vec<Bytes>,
}

/// The host-side protocol endpoint.
pub struct Server {
    socket: UdpEndpoint,
    config: StreamConfig,
    clock: Clock,
    sequence: AtomicU16,
    peers: Mutex<Vec<PeerRecord>>,
    keyframe_cache: Mutex<KeyframeCache>,
    last_tick: Mutex<Instant>,
    upstream: Mutex<HashMap<SocketAddr, Reassembler>>,
    keyframe_handler: Mutex<Option<KeyframeRequestHandler>>,
    client_audio_handler: Mutex<Option<ClientAudioHandler>>,
}

impl Server {
    /// Bind the host socket and prepare for polling.
    pub fn start(port: u16, config: StreamConfig) -> Result<Self, NetworkError> {
        let socket = UdpEndpoint::bind(port)?;
        socket.set_recv_timeout(POLL_RECV_TIMEOUT)?;
        info!("Server started on port {}", socket.local_addr()?.port());

        Ok(Self {
            socket,
            config,
            clock: Clock::new(),
            sequence: AtomicU16::new(0),
            peers: Mutex::new(Vec::new()),
            keyframe_cache: Mutex::new(KeyframeCache::default()),
            last_tick: Mutex::new(Instant::now()),
            upstream: Mutex::new(HashMap::new()),
            keyframe_handler: Mutex::new(None),
            client_audio_handler: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket.local_addr()
    }

    /// Register the keyframe-request callback. Call before the poll loop
    /// starts; the handler runs on the recv thread and must be cheap.
    pub fn on_keyframe_request<F: Fn() + Send + Sync + 'static>(&self, handler: F) {
        *self.keyframe_handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// Register the upstream-audio callback. Same constraints as
    /// [`on_keyframe_request`](Self::on_keyframe_request).
    pub fn on_client_audio<F: Fn(EncodedPacket) + Send + Sync + 'static>(&self, handler: F) {
        *self.client_audio_handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// Host uptime in microseconds; the timebase of PING timestamps.
    pub fn uptime_us(&self) -> u64 {
        self.clock.now_us()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Largest valid RTT across peers, in milliseconds. Input to the
    /// adaptive bitrate loop.
    pub fn max_rtt_ms(&self) -> f64 {
        let peers = self.peers.lock().unwrap();
        peers
            .iter()
            .filter(|p| p.rtt_valid)
            .map(|p| p.rtt_ms)
            .fold(0.0, f64::max)
    }

    /// Fragment and send an encoded packet to every connected peer.
    ///
    /// Keyframe fragments are cached wholesale for NACK retransmission.
    pub fn broadcast(&self, packet: &EncodedPacket) {
        let fragments = Fragmenter::fragment(packet, &self.sequence);
        if fragments.is_empty() {
            return;
        }

        let wire: Vec<Bytes> = fragments.iter().map(|f| f.serialize()).collect();

        if packet.frame_type == FrameType::VideoKeyframe {
            let mut cache = self.keyframe_cache.lock().unwrap();
            cache.frame_id = packet.frame_id;
            cache.fragments = wire.clone();
        }

        let peers = self.peers.lock().unwrap();
        for peer in peers.iter() {
            for datagram in &wire {
                self.socket.send_to(datagram, peer.addr);
            }
        }
    }

    /// One iteration of the recv loop: run the periodic maintenance tick,
    /// then receive and dispatch at most one datagram.
    pub fn poll(&self) {
        self.maybe_tick();

        let Some((buf, source)) = self.socket.recv_from() else {
            return;
        };
        let Some(packet) = Packet::parse(&buf) else {
            return;
        };

        self.touch_peer(source);

        match packet.header.packet_type {
            PacketType::Hello => self.handle_hello(source),
            PacketType::Bye => self.handle_bye(source),
            PacketType::KeyframeReq => {
                info!("Keyframe requested by {}", source);
                self.mark_config_synced(source);
                if let Some(handler) = self.keyframe_handler.lock().unwrap().as_ref() {
                    handler();
                }
            }
            PacketType::Pong => self.handle_pong(&packet, source),
            PacketType::Nack => {
                self.mark_config_synced(source);
                self.handle_nack(&packet, source);
            }
            PacketType::VideoData | PacketType::AudioData => {
                self.handle_upstream(&packet, source);
            }
            _ => {}
        }
    }

    fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn maybe_tick(&self) {
        {
            let mut last = self.last_tick.lock().unwrap();
            if last.elapsed() < PING_INTERVAL {
                return;
            }
            *last = Instant::now();
        }

        self.purge_silent_peers(PEER_TIMEOUT);

        let (targets, unsynced): (Vec<SocketAddr>, Vec<SocketAddr>) = {
            let peers = self.peers.lock().unwrap();
            (
                peers.iter().map(|p| p.addr).collect(),
                peers
                    .iter()
                    .filter(|p| !p.config_synced)
                    .map(|p| p.addr)
                    .collect(),
            )
        };

        if !targets.is_empty() {
            let ping = Packet::control(
                PacketType::Ping,
                self.next_sequence(),
                PingPayload {
                    timestamp_us: self.clock.now_us(),
                }
                .encode(),
            )
            .serialize();
            for addr in &targets {
                self.socket.send_to(&ping, *addr);
            }
        }

        // UDP gives no ordering guarantee between WELCOME and STREAM_CONFIG,
        // so the config is repeated until the peer's first keyframe request
        // or NACK proves it arrived.
        for addr in unsynced {
            self.send_stream_config(addr);
        }

        let mut upstream = self.upstream.lock().unwrap();
        for assembler in upstream.values_mut() {
            assembler.purge_stale(STALE_TIMEOUT);
        }
    }

    fn purge_silent_peers(&self, timeout: Duration) {
        let now = Instant::now();
        let mut removed = Vec::new();
        {
            let mut peers = self.peers.lock().unwrap();
            peers.retain(|p| {
                let keep = now.duration_since(p.last_seen) <= timeout;
                if !keep {
                    removed.push(p.addr);
                }
                keep
            });
        }
        for addr in removed {
            info!("Peer {} timed out", addr);
            self.upstream.lock().unwrap().remove(&addr);
        }
    }

    fn touch_peer(&self, source: SocketAddr) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(peer) = peers.iter_mut().find(|p| p.addr == source) {
            peer.last_seen = Instant::now();
        }
    }

    fn mark_config_synced(&self, source: SocketAddr) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(peer) = peers.iter_mut().find(|p| p.addr == source) {
            peer.config_synced = true;
        }
    }

    fn handle_hello(&self, source: SocketAddr) {
        {
            let mut peers = self.peers.lock().unwrap();
            if peers.iter().any(|p| p.addr == source) {
                // Duplicate HELLO
                return;
            }
            peers.push(PeerRecord {
                addr: source,
                rtt_ms: 0.0,
                rtt_valid: false,
                last_seen: Instant::now(),
                config_synced: self.config.codec_data.is_empty(),
            });
        }
        info!("Peer connected: {}", source);

        let welcome = Packet::control(
            PacketType::Welcome,
            self.next_sequence(),
            WelcomePayload {
                width: self.config.width,
                height: self.config.height,
                fps: self.config.fps,
                video_bitrate: self.config.video_bitrate,
                audio_sample_rate: self.config.audio_sample_rate,
                audio_channels: self.config.audio_channels,
            }
            .encode(),
        );
        self.socket.send_to(&welcome.serialize(), source);
        self.send_stream_config(source);
    }

    fn handle_bye(&self, source: SocketAddr) {
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|p| p.addr != source);
        drop(peers);
        self.upstream.lock().unwrap().remove(&source);
        info!("Peer disconnected: {}", source);
    }

    fn handle_pong(&self, packet: &Packet, source: SocketAddr) {
        let Some(payload) = PingPayload::parse(&packet.payload) else {
            return;
        };
        let Some(rtt_ms) = rtt_from_pong(self.clock.now_us(), payload.timestamp_us) else {
            return;
        };

        let mut peers = self.peers.lock().unwrap();
        if let Some(peer) = peers.iter_mut().find(|p| p.addr == source) {
            peer.rtt_ms = rtt_ms;
            peer.rtt_valid = true;
            debug!("RTT to {} = {:.1} ms", source, rtt_ms);
        }
    }

    fn handle_nack(&self, packet: &Packet, source: SocketAddr) {
        let Some(nack) = NackPayload::parse(&packet.payload) else {
            return;
        };

        let cache = self.keyframe_cache.lock().unwrap();
        if cache.fragments.is_empty() || nack.frame_id != cache.frame_id {
            debug!(
                "NACK for keyframe {} (cached: {}), ignoring",
                nack.frame_id, cache.frame_id
            );
            return;
        }

        let mut resent = 0usize;
        for idx in &nack.missing {
            if let Some(datagram) = cache.fragments.get(*idx as usize) {
                self.socket.send_to(datagram, source);
                resent += 1;
            }
        }
        info!(
            "NACK from {}: resent {}/{} fragments of keyframe {}",
            source,
            resent,
            nack.missing.len(),
            nack.frame_id
        );
    }

    /// Viewer-to-host media (microphone audio). Reassembly is keyed per
    /// source endpoint so frame ids from different viewers cannot collide.
    fn handle_upstream(&self, packet: &Packet, source: SocketAddr) {
        let complete = {
            let mut upstream = self.upstream.lock().unwrap();
            let assembler = upstream.entry(source).or_default();
            assembler.feed(packet)
        };

        if let Some(frame) = complete {
            if frame.frame_type == FrameType::Audio {
                if let Some(handler) = self.client_audio_handler.lock().unwrap().as_ref() {
                    handler(frame);
                }
            }
        }
    }

    fn send_stream_config(&self, dest: SocketAddr) {
        if self.config.codec_data.is_empty() {
            return;
        }
        let packet = Packet::control(
            PacketType::StreamConfig,
            self.next_sequence(),
            Bytes::copy_from_slice(&self.config.codec_data),
        );
        self.socket.send_to(&packet.serialize(), dest);
        debug!(
            "Sent STREAM_CONFIG ({} bytes) to {}",
            self.config.codec_data.len(),
            dest
        );
    }
}

/// RTT in milliseconds from a PONG echo, or None when the sample fails the
/// sanity bounds (echo from the future, or at least 10 s old).
fn rtt_from_pong(now_us: u64, echoed_us: u64) -> Option<f64> {
    if echoed_us >= now_us {
        return None;
    }
    let rtt_us = now_us - echoed_us;
    if rtt_us >= RTT_SANITY_LIMIT_US {
        return None;
    }
    Some(rtt_us as f64 / 1000.0)
}
