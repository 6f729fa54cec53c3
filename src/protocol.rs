//! Wire format: fragment header and typed control payloads
//!
//! Every datagram starts with a 16-byte little-endian header:
//!
//! ```text
//! ┌───────┬─────────┬──────┬───────┬──────────┬──────────────┬──────────┬──────────┬────────────┐
//! │ magic │ version │ type │ flags │ sequence │ timestamp_us │ frame_id │ frag_idx │ frag_total │
//! │  (1)  │   (1)   │ (1)  │  (1)  │   (2)    │     (4)      │   (2)    │   (2)    │    (2)     │
//! └───────┴─────────┴──────┴───────┴──────────┴──────────────┴──────────┴──────────┴────────────┘
//! ```
//!
//! Fragment indices are 16-bit so a single frame can span up to 65535
//! fragments (a 1080p keyframe needs ~2600). The sequence counter is 16-bit
//! to keep the header at 16 bytes; it is a per-endpoint diagnostic counter
//! and wraps harmlessly.
//!
//! Malformed datagrams (short, wrong magic, wrong version) parse to `None`
//! and are silently dropped: stray traffic on a LAN port must never take
//! down an endpoint.

use bytes::{BufMut, Bytes, BytesMut};

/// First byte of every datagram
pub const PROTOCOL_MAGIC: u8 = 0xAA;
pub const PROTOCOL_VERSION: u8 = 1;

/// Serialized header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Conservative datagram budget that avoids IP fragmentation on typical
/// Ethernet/PPPoE paths
pub const MAX_UDP_PAYLOAD: usize = 1200;

/// Encoded bytes carried per fragment
pub const MAX_FRAGMENT_DATA: usize = MAX_UDP_PAYLOAD - HEADER_SIZE;

/// Fragment carries (part of) a keyframe
pub const FLAG_KEYFRAME: u8 = 0x01;
/// First fragment of a frame
pub const FLAG_FIRST: u8 = 0x02;
/// Last fragment of a frame
pub const FLAG_LAST: u8 = 0x04;

/// Datagram type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    VideoData = 0x01,
    AudioData = 0x02,
    Hello = 0x10,
    Welcome = 0x11,
    Ack = 0x12,
    Nack = 0x13,
    KeyframeReq = 0x14,
    Ping = 0x20,
    Pong = 0x21,
    Bye = 0x30,
    StreamConfig = 0x40,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::VideoData),
            0x02 => Some(PacketType::AudioData),
            0x10 => Some(PacketType::Hello),
            0x11 => Some(PacketType::Welcome),
            0x12 => Some(PacketType::Ack),
            0x13 => Some(PacketType::Nack),
            0x14 => Some(PacketType::KeyframeReq),
            0x20 => Some(PacketType::Ping),
            0x21 => Some(PacketType::Pong),
            0x30 => Some(PacketType::Bye),
            0x40 => Some(PacketType::StreamConfig),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// The 16-byte datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    /// Per-endpoint datagram counter; wraps freely
    pub sequence: u16,
    /// Low 32 bits of the frame's pts in microseconds
    pub timestamp_us: u32,
    pub frame_id: u16,
    pub frag_idx: u16,
    pub frag_total: u16,
}

impl PacketHeader {
    /// Header for a control datagram (no fragmentation fields).
    pub fn control(packet_type: PacketType, sequence: u16) -> Self {
        Self {
            packet_type,
            flags: 0,
            sequence,
            timestamp_us: 0,
            frame_id: 0,
            frag_idx: 0,
            frag_total: 0,
        }
    }

    pub fn serialize(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf[0] = PROTOCOL_MAGIC;
        buf[1] = PROTOCOL_VERSION;
        buf[2] = self.packet_type.as_u8();
        buf[3] = self.flags;
        buf[4..6].copy_from_slice(&self.sequence.to_le_bytes());
        buf[6..10].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[10..12].copy_from_slice(&self.frame_id.to_le_bytes());
        buf[12..14].copy_from_slice(&self.frag_idx.to_le_bytes());
        buf[14..16].copy_from_slice(&self.frag_total.to_le_bytes());
    }

    /// Parse a header, rejecting short buffers, bad magic and unknown
    /// versions or types. Returns None so the caller can drop silently.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        if buf[0] != PROTOCOL_MAGIC || buf[1] != PROTOCOL_VERSION {
            return None;
        }
        let packet_type = PacketType::from_u8(buf[2])?;
        Some(Self {
            packet_type,
            flags: buf[3],
            sequence: u16::from_le_bytes([buf[4], buf[5]]),
            timestamp_us: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            frame_id: u16::from_le_bytes([buf[10], buf[11]]),
            frag_idx: u16::from_le_bytes([buf[12], buf[13]]),
            frag_total: u16::from_le_bytes([buf[14], buf[15]]),
        })
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }
}

/// A complete datagram: header plus opaque payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Control datagram with an optional payload.
    pub fn control(packet_type: PacketType, sequence: u16, payload: Bytes) -> Self {
        Self {
            header: PacketHeader::control(packet_type, sequence),
            payload,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        let mut header = [0u8; HEADER_SIZE];
        self.header.serialize(&mut header);
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let header = PacketHeader::parse(buf)?;
        Some(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..]),
        })
    }
}

/// WELCOME payload: the stream parameters a new viewer needs before the
/// first fragment arrives. 22 bytes packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WelcomePayload {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_bitrate: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
}

impl WelcomePayload {
    pub const SIZE: usize = 22;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.fps);
        buf.put_u32_le(self.video_bitrate);
        buf.put_u32_le(self.audio_sample_rate);
        buf.put_u16_le(self.audio_channels);
        buf.freeze()
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            width: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            height: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            fps: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            video_bitrate: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            audio_sample_rate: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            audio_channels: u16::from_le_bytes([buf[20], buf[21]]),
        })
    }
}

/// PING/PONG payload: the sender's monotonic clock in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPayload {
    pub timestamp_us: u64,
}

impl PingPayload {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.timestamp_us.to_le_bytes())
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            timestamp_us: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
        })
    }
}

/// NACK payload: a selective retransmit request for missing fragments of a
/// named frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackPayload {
    pub frame_id: u16,
    pub missing: Vec<u16>,
}

impl NackPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.missing.len() * 2);
        buf.put_u16_le(self.frame_id);
        buf.put_u16_le(self.missing.len() as u16);
        for idx in &self.missing {
            buf.put_u16_le(*idx);
        }
        buf.freeze()
    }

    /// Parse, tolerating a truncated index list (reads what fits).
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        let frame_id = u16::from_le_bytes([buf[0], buf[1]]);
        let num_missing = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        let mut missing = Vec::with_capacity(num_missing);
        let mut offset = 4;
        for _ in 0..num_missing {
            if offset + 2 > buf.len() {
                break;
            }
            missing.push(u16::from_le_bytes([buf[offset], buf[offset + 1]]));
            offset += 2;
        }
        Some(Self { frame_id, missing })
    }
}
