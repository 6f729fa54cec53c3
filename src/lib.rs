//! # lanmirror
//!
//! Low-latency screen and audio broadcasting over a LAN: one host, any
//! number of viewers, a single UDP port.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── HOST ───────────────────────────┐
//! │  ┌─────────┐   SPSC    ┌─────────┐   SPSC    ┌───────────┐  │
//! │  │ Screen  │──(raw)───▶│  Video  │──(enc)───▶│           │  │
//! │  │ Capture │           │ Encoder │           │   Send    │  │
//! │  └─────────┘           └─────────┘           │  Thread   │  │
//! │  ┌─────────┐   MPSC    ┌─────────┐   MPSC    │           │  │
//! │  │  Audio  │──(raw)───▶│  Audio  │──(enc)───▶│           │  │
//! │  │ Capture │           │ Encoder │           └─────┬─────┘  │
//! │  └─────────┘           └─────────┘                 │        │
//! │                                               fragmenter    │
//! │  ┌──────────────────────────────────────┐         │        │
//! │  │ Recv/Poll Thread                     │   ┌─────▼─────┐  │
//! │  │  HELLO/BYE/PONG/NACK/KEYFRAME_REQ    │◀──│ UDP :7878 │  │
//! │  │  + adaptive bitrate every 5 s        │   └─────┬─────┘  │
//! │  └──────────────────────────────────────┘         │        │
//! └───────────────────────────────────────────────────┼────────┘
//!                                                LAN  │
//! ┌─────────────────────────── VIEWER ────────────────┼────────┐
//! │  ┌──────────────────────────┐              ┌──────▼─────┐  │
//! │  │ Recv Thread              │◀─────────────│ UDP (ephem)│  │
//! │  │  reassemble → NACK lost  │              └────────────┘  │
//! │  │  keyframe fragments      │                              │
//! │  └──────┬───────────┬───────┘                              │
//! │    MPSC(video)  MPSC(audio)                                │
//! │  ┌──────▼─────┐ ┌───▼────────┐                             │
//! │  │Video Decode│ │Audio Decode│                             │
//! │  └──────┬─────┘ └───┬────────┘                             │
//! │    MPSC(decoded)    ▼ sink                                 │
//! │  ┌──────▼─────────────────┐                                │
//! │  │ Main thread: render    │  always-latest frame policy    │
//! │  └────────────────────────┘                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The wire protocol fragments each encoded frame into datagrams of at most
//! 1200 bytes, reassembles them tolerating loss, reordering and duplicates,
//! and selectively retransmits lost keyframe fragments via NACKs. P-frame
//! loss is absorbed; the next keyframe resynchronizes the decoder.

pub mod capture;
pub mod clock;
pub mod codec;
pub mod error;
pub mod net;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod render;
pub mod types;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default UDP port for the host
    pub const DEFAULT_PORT: u16 = 7878;

    /// Default capture/encode frame rate
    pub const DEFAULT_FPS: u32 = 30;

    /// Default video bitrate in bits per second (6 Mbps)
    pub const DEFAULT_VIDEO_BITRATE: u32 = 6_000_000;

    /// Default audio sample rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Socket send/recv buffer size; must absorb keyframe bursts
    pub const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

    /// Capacity of the raw/encoded video rings (power of 2)
    pub const VIDEO_RING_CAPACITY: usize = 4;

    /// Capacity of the decoded video queue on the viewer
    pub const DECODED_QUEUE_CAPACITY: usize = 4;

    /// Capacity of the raw audio queue
    pub const AUDIO_RAW_QUEUE_CAPACITY: usize = 8;

    /// Capacity of the encoded audio queue
    pub const AUDIO_ENCODED_QUEUE_CAPACITY: usize = 16;
}
