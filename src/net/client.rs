//! Viewer protocol endpoint: handshake, receive loop, NACK emission
//!
//! The socket binds to an ephemeral port. `connect` performs the
//! HELLO → WELCOME → STREAM_CONFIG handshake on the caller's thread before
//! the recv thread starts; afterwards `poll` is the socket's only receiver
//! while `request_keyframe`, `send_audio` and `disconnect` may send from
//! other threads.

use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::net::assembler::{Reassembler, NACK_AGE, STALE_TIMEOUT};
use crate::net::fragment::Fragmenter;
use crate::net::socket::UdpEndpoint;
use crate::protocol::{NackPayload, Packet, PacketHeader, PacketType, WelcomePayload};
use crate::queue::BoundedQueue;
use crate::types::{EncodedPacket, FrameType, StreamConfig};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
const STREAM_RECV_TIMEOUT: Duration = Duration::from_millis(5);

/// Connection lifecycle of the viewer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// The viewer-side protocol endpoint.
pub struct Client {
    socket: UdpEndpoint,
    state: AtomicU8,
    server_addr: Mutex<Option<SocketAddr>>,
    config: Mutex<StreamConfig>,
    assembler: Mutex<Reassembler>,
    sequence: AtomicU16,
}

impl Client {
    pub fn new() -> Result<Self, NetworkError> {
        let socket = UdpEndpoint::bind_ephemeral()?;
        Ok(Self {
            socket,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            server_addr: Mutex::new(None),
            config: Mutex::new(StreamConfig::default()),
            assembler: Mutex::new(Reassembler::new()),
            sequence: AtomicU16::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Stream parameters received in WELCOME (valid once connected).
    pub fn stream_config(&self) -> StreamConfig {
        self.config.lock().unwrap().clone()
    }

    /// Perform the handshake with the host.
    ///
    /// WELCOME and STREAM_CONFIG are accepted in either order; a missing
    /// STREAM_CONFIG is tolerated since the host repeats it until our first
    /// KEYFRAME_REQ or NACK.
    pub fn connect(&self, host: IpAddr, port: u16) -> Result<(), NetworkError> {
        self.set_state(ConnectionState::Connecting);
        let server = SocketAddr::new(host, port);
        *self.server_addr.lock().unwrap() = Some(server);

        let result = self.handshake(server);
        match result {
            Ok(()) => {
                self.socket.set_recv_timeout(STREAM_RECV_TIMEOUT)?;
                self.set_state(ConnectionState::Connected);
                let config = self.config.lock().unwrap();
                info!(
                    "Connected to {} ({}x{} @ {} fps)",
                    server, config.width, config.height, config.fps
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn handshake(&self, server: SocketAddr) -> Result<(), NetworkError> {
        self.socket.set_recv_timeout(HANDSHAKE_TIMEOUT)?;

        let hello = Packet::control(PacketType::Hello, self.next_sequence(), Bytes::new());
        self.socket.send_to(&hello.serialize(), server);
        debug!("Sent HELLO to {}", server);

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut welcome: Option<WelcomePayload> = None;
        let mut codec_data: Option<Vec<u8>> = None;

        while Instant::now() < deadline && (welcome.is_none() || codec_data.is_none()) {
            let Some((buf, source)) = self.socket.recv_from() else {
                continue;
            };
            if source != server {
                continue;
            }
            let Some(packet) = Packet::parse(&buf) else {
                continue;
            };
            match packet.header.packet_type {
                PacketType::Welcome => {
                    welcome = WelcomePayload::parse(&packet.payload);
                }
                PacketType::StreamConfig => {
                    codec_data = Some(packet.payload.to_vec());
                }
                _ => {}
            }
        }

        let Some(wp) = welcome else {
            warn!("No WELCOME received (timeout)");
            return Err(NetworkError::ConnectTimeout);
        };
        if wp.width == 0 || wp.height == 0 || wp.width % 2 != 0 || wp.height % 2 != 0 {
            return Err(NetworkError::ConfigMismatch(format!(
                "bad dimensions {}x{}",
                wp.width, wp.height
            )));
        }
        if wp.fps == 0 {
            return Err(NetworkError::ConfigMismatch("fps is zero".into()));
        }

        let mut config = self.config.lock().unwrap();
        config.width = wp.width;
        config.height = wp.height;
        config.fps = wp.fps;
        config.video_bitrate = wp.video_bitrate;
        config.audio_sample_rate = wp.audio_sample_rate;
        config.audio_channels = wp.audio_channels;
        if let Some(data) = codec_data {
            info!("Received STREAM_CONFIG: {} bytes codec data", data.len());
            config.codec_data = data;
        }
        Ok(())
    }

    /// One iteration of the recv loop: receive and dispatch at most one
    /// datagram, then emit NACKs for aging keyframes and purge stale state.
    ///
    /// Complete frames are routed by type into the provided queues.
    pub fn poll(
        &self,
        video_queue: &BoundedQueue<EncodedPacket>,
        audio_queue: &BoundedQueue<EncodedPacket>,
    ) {
        if !self.is_connected() {
            return;
        }

        if let Some((buf, _source)) = self.socket.recv_from() {
            if let Some(packet) = Packet::parse(&buf) {
                self.dispatch(&packet, video_queue, audio_queue);
            }
        }

        let nacks = {
            let mut assembler = self.assembler.lock().unwrap();
            let incomplete = assembler.check_incomplete_keyframes(NACK_AGE);
            assembler.purge_stale(STALE_TIMEOUT);
            incomplete
        };
        for kf in nacks {
            debug!(
                "NACK keyframe {}: {}/{} fragments missing",
                kf.frame_id,
                kf.missing.len(),
                kf.frag_total
            );
            let nack = Packet::control(
                PacketType::Nack,
                self.next_sequence(),
                NackPayload {
                    frame_id: kf.frame_id,
                    missing: kf.missing,
                }
                .encode(),
            );
            self.send_to_server(&nack);
        }
    }

    fn dispatch(
        &self,
        packet: &Packet,
        video_queue: &BoundedQueue<EncodedPacket>,
        audio_queue: &BoundedQueue<EncodedPacket>,
    ) {
        match packet.header.packet_type {
            PacketType::VideoData | PacketType::AudioData => {
                let complete = self.assembler.lock().unwrap().feed(packet);
                if let Some(frame) = complete {
                    if frame.frame_type == FrameType::Audio {
                        audio_queue.push(frame);
                    } else {
                        video_queue.push(frame);
                    }
                }
            }
            PacketType::Ping => {
                // Echo payload and sequence so the host can match the probe
                let pong = Packet {
                    header: PacketHeader::control(PacketType::Pong, packet.header.sequence),
                    payload: packet.payload.clone(),
                };
                self.send_to_server(&pong);
            }
            PacketType::StreamConfig => {
                let mut config = self.config.lock().unwrap();
                if config.codec_data.is_empty() {
                    info!(
                        "Received late STREAM_CONFIG: {} bytes codec data",
                        packet.payload.len()
                    );
                    config.codec_data = packet.payload.to_vec();
                }
            }
            _ => {}
        }
    }

    /// Ask the host for a fresh keyframe (decodable entry point).
    pub fn request_keyframe(&self) {
        let req = Packet::control(PacketType::KeyframeReq, self.next_sequence(), Bytes::new());
        self.send_to_server(&req);
    }

    /// Fragment and send an encoded audio packet upstream (microphone).
    pub fn send_audio(&self, packet: &EncodedPacket) {
        let Some(server) = *self.server_addr.lock().unwrap() else {
            return;
        };
        for fragment in Fragmenter::fragment(packet, &self.sequence) {
            self.socket.send_to(&fragment.serialize(), server);
        }
    }

    /// Send a best-effort BYE and drop the connection.
    pub fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        let bye = Packet::control(PacketType::Bye, self.next_sequence(), Bytes::new());
        self.send_to_server(&bye);
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected");
    }

    fn send_to_server(&self, packet: &Packet) {
        if let Some(server) = *self.server_addr.lock().unwrap() {
            self.socket.send_to(&packet.serialize(), server);
        }
    }

    fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PingPayload, MAX_FRAGMENT_DATA};
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicU16;
    use std::thread;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// Scripted host side: a bare socket driven directly by the test.
    struct TestHost {
        socket: UdpEndpoint,
        sequence: AtomicU16,
    }

    impl TestHost {
        fn new() -> Self {
            let socket = UdpEndpoint::bind_ephemeral().unwrap();
            socket.set_recv_timeout(Duration::from_millis(200)).unwrap();
            Self {
                socket,
                sequence: AtomicU16::new(0),
            }
        }

        fn port(&self) -> u16 {
            self.socket.local_addr().unwrap().port()
        }

        fn recv(&self) -> Option<(Packet, SocketAddr)> {
            self.socket
                .recv_from()
                .and_then(|(buf, source)| Packet::parse(&buf).map(|p| (p, source)))
        }

        fn expect(&self, kind: PacketType) -> (Packet, SocketAddr) {
            for _ in 0..20 {
                if let Some((packet, source)) = self.recv() {
                    if packet.header.packet_type == kind {
                        return (packet, source);
                    }
                }
            }
            panic!("host never received {:?}", kind);
        }

        fn welcome_payload() -> WelcomePayload {
            WelcomePayload {
                width: 640,
                height: 480,
                fps: 30,
                video_bitrate: 2_000_000,
                audio_sample_rate: 48_000,
                audio_channels: 2,
            }
        }

        fn send_welcome(&self, dest: SocketAddr) {
            let packet = Packet::control(
                PacketType::Welcome,
                self.sequence.fetch_add(1, Ordering::Relaxed),
                Self::welcome_payload().encode(),
            );
            self.socket.send_to(&packet.serialize(), dest);
        }

        fn send_stream_config(&self, dest: SocketAddr, data: &[u8]) {
            let packet = Packet::control(
                PacketType::StreamConfig,
                self.sequence.fetch_add(1, Ordering::Relaxed),
                Bytes::copy_from_slice(data),
            );
            self.socket.send_to(&packet.serialize(), dest);
        }

        /// Accept a HELLO and answer the full handshake.
        fn accept(&self) -> SocketAddr {
            let (_, source) = self.expect(PacketType::Hello);
            self.send_welcome(source);
            self.send_stream_config(source, &[9, 8, 7]);
            source
        }
    }

    fn connected_pair() -> (TestHost, Client) {
        let host = TestHost::new();
        let client = Client::new().unwrap();
        let port = host.port();

        let handshake = thread::spawn(move || {
            let host = host;
            host.accept();
            host
        });
        client.connect(LOCALHOST, port).unwrap();
        (handshake.join().unwrap(), client)
    }

    #[test]
    fn connect_handshake_succeeds() {
        let (_host, client) = connected_pair();
        assert!(client.is_connected());
        let config = client.stream_config();
        assert_eq!(config.width, 640);
        assert_eq!(config.height, 480);
        assert_eq!(config.fps, 30);
        assert_eq!(config.codec_data, vec![9, 8, 7]);
    }

    #[test]
    fn connect_times_out_without_host() {
        let client = Client::new().unwrap();
        // Nothing listens on this socket's own port pair; use an unused one
        let unused = UdpEndpoint::bind_ephemeral().unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let start = Instant::now();
        let err = client.connect(LOCALHOST, port).unwrap_err();
        assert!(matches!(err, NetworkError::ConnectTimeout));
        assert!(start.elapsed() >= Duration::from_millis(900));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn handshake_tolerates_reversed_datagram_order() {
        let host = TestHost::new();
        let client = Client::new().unwrap();
        let port = host.port();

        let handshake = thread::spawn(move || {
            let (_, source) = host.expect(PacketType::Hello);
            // STREAM_CONFIG first, then WELCOME
            host.send_stream_config(source, &[1, 2]);
            host.send_welcome(source);
        });

        client.connect(LOCALHOST, port).unwrap();
        handshake.join().unwrap();
        assert_eq!(client.stream_config().codec_data, vec![1, 2]);
    }

    #[test]
    fn connect_rejects_bad_dimensions() {
        let host = TestHost::new();
        let client = Client::new().unwrap();
        let port = host.port();

        let handshake = thread::spawn(move || {
            let (_, source) = host.expect(PacketType::Hello);
            let mut wp = TestHost::welcome_payload();
            wp.width = 0;
            let packet = Packet::control(PacketType::Welcome, 0, wp.encode());
            host.socket.send_to(&packet.serialize(), source);
            host.send_stream_config(source, &[1]);
        });

        let err = client.connect(LOCALHOST, port).unwrap_err();
        assert!(matches!(err, NetworkError::ConfigMismatch(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        handshake.join().unwrap();
    }

    #[test]
    fn poll_routes_video_and_audio_frames() {
        let (host, client) = connected_pair();
        let client_addr = {
            // Learn the client's address from its KEYFRAME_REQ
            client.request_keyframe();
            host.expect(PacketType::KeyframeReq).1
        };

        let video_q = BoundedQueue::new(8);
        let audio_q = BoundedQueue::new(8);
        let seq = AtomicU16::new(0);

        let video = EncodedPacket {
            data: Bytes::from(vec![0x11; MAX_FRAGMENT_DATA + 5]),
            frame_type: FrameType::VideoKeyframe,
            pts_us: 1000,
            frame_id: 1,
        };
        let audio = EncodedPacket {
            data: Bytes::from(vec![0x22; 64]),
            frame_type: FrameType::Audio,
            pts_us: 1000,
            frame_id: 1,
        };
        for frag in Fragmenter::fragment(&video, &seq) {
            host.socket.send_to(&frag.serialize(), client_addr);
        }
        for frag in Fragmenter::fragment(&audio, &seq) {
            host.socket.send_to(&frag.serialize(), client_addr);
        }

        for _ in 0..100 {
            client.poll(&video_q, &audio_q);
            if !video_q.is_empty() && !audio_q.is_empty() {
                break;
            }
        }

        let v = video_q.try_pop().expect("video frame");
        assert_eq!(v.frame_type, FrameType::VideoKeyframe);
        assert_eq!(v.data.len(), MAX_FRAGMENT_DATA + 5);
        let a = audio_q.try_pop().expect("audio frame");
        assert_eq!(a.frame_type, FrameType::Audio);
        assert_eq!(a.data.len(), 64);
    }

    #[test]
    fn ping_is_answered_with_matching_pong() {
        let (host, client) = connected_pair();
        client.request_keyframe();
        let (_, client_addr) = host.expect(PacketType::KeyframeReq);

        let payload = PingPayload {
            timestamp_us: 777_777,
        }
        .encode();
        let ping = Packet {
            header: PacketHeader::control(PacketType::Ping, 31),
            payload: payload.clone(),
        };
        host.socket.send_to(&ping.serialize(), client_addr);

        let video_q = BoundedQueue::new(4);
        let audio_q = BoundedQueue::new(4);
        let pong = loop_until_pong(&host, &client, &video_q, &audio_q);
        assert_eq!(pong.header.sequence, 31);
        assert_eq!(pong.payload, payload);
    }

    fn loop_until_pong(
        host: &TestHost,
        client: &Client,
        video_q: &BoundedQueue<EncodedPacket>,
        audio_q: &BoundedQueue<EncodedPacket>,
    ) -> Packet {
        for _ in 0..100 {
            client.poll(video_q, audio_q);
            if let Some((packet, _)) = host.recv() {
                if packet.header.packet_type == PacketType::Pong {
                    return packet;
                }
            }
        }
        panic!("no PONG received");
    }

    #[test]
    fn missing_keyframe_fragment_triggers_nack_then_completes() {
        // S4, viewer side
        let (host, client) = connected_pair();
        client.request_keyframe();
        let (_, client_addr) = host.expect(PacketType::KeyframeReq);

        let video_q = BoundedQueue::new(8);
        let audio_q = BoundedQueue::new(8);
        let seq = AtomicU16::new(0);

        let keyframe = EncodedPacket {
            data: Bytes::from(vec![0x77; 2 * MAX_FRAGMENT_DATA + 30]),
            frame_type: FrameType::VideoKeyframe,
            pts_us: 0,
            frame_id: 7,
        };
        let frags = Fragmenter::fragment(&keyframe, &seq);
        assert_eq!(frags.len(), 3);

        // Deliver fragments 0 and 1 only
        host.socket.send_to(&frags[0].serialize(), client_addr);
        host.socket.send_to(&frags[1].serialize(), client_addr);
        for _ in 0..20 {
            client.poll(&video_q, &audio_q);
        }
        assert!(video_q.is_empty());

        // After the NACK age the client must report exactly index 2
        thread::sleep(NACK_AGE + Duration::from_millis(20));
        client.poll(&video_q, &audio_q);

        let (nack_packet, _) = host.expect(PacketType::Nack);
        let nack = NackPayload::parse(&nack_packet.payload).unwrap();
        assert_eq!(nack.frame_id, 7);
        assert_eq!(nack.missing, vec![2]);

        // Serve the retransmit; the frame completes
        host.socket.send_to(&frags[2].serialize(), client_addr);
        for _ in 0..50 {
            client.poll(&video_q, &audio_q);
            if !video_q.is_empty() {
                break;
            }
        }
        let frame = video_q.try_pop().expect("keyframe completes after NACK");
        assert_eq!(frame.frame_type, FrameType::VideoKeyframe);
        assert_eq!(frame.data.as_ref(), keyframe.data.as_ref());
    }

    #[test]
    fn late_stream_config_is_accepted_while_streaming() {
        let host = TestHost::new();
        let client = Client::new().unwrap();
        let port = host.port();

        // Handshake without STREAM_CONFIG (it was "lost")
        let handshake = thread::spawn(move || {
            let (_, source) = host.expect(PacketType::Hello);
            host.send_welcome(source);
            (host, source)
        });
        client.connect(LOCALHOST, port).unwrap();
        let (host, client_addr) = handshake.join().unwrap();
        assert!(client.stream_config().codec_data.is_empty());

        host.send_stream_config(client_addr, &[5, 5, 5]);
        let video_q = BoundedQueue::new(4);
        let audio_q = BoundedQueue::new(4);
        for _ in 0..100 {
            client.poll(&video_q, &audio_q);
            if !client.stream_config().codec_data.is_empty() {
                break;
            }
        }
        assert_eq!(client.stream_config().codec_data, vec![5, 5, 5]);
    }

    #[test]
    fn disconnect_sends_bye() {
        let (host, client) = connected_pair();
        client.disconnect();
        host.expect(PacketType::Bye);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn upstream_audio_is_fragmented_to_host() {
        let (host, client) = connected_pair();

        let audio = EncodedPacket {
            data: Bytes::from(vec![0x42; MAX_FRAGMENT_DATA + 12]),
            frame_type: FrameType::Audio,
            pts_us: 500,
            frame_id: 3,
        };
        client.send_audio(&audio);

        let mut asm = Reassembler::new();
        let mut complete = None;
        for _ in 0..20 {
            if let Some((packet, _)) = host.recv() {
                if packet.header.packet_type == PacketType::AudioData {
                    if let Some(frame) = asm.feed(&packet) {
                        complete = Some(frame);
                        break;
                    }
                }
            }
        }
        let frame = complete.expect("host reassembles upstream audio");
        assert_eq!(frame.frame_type, FrameType::Audio);
        assert_eq!(frame.data.as_ref(), audio.data.as_ref());
    }
}
