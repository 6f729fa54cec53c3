//! Core media types shared across the pipeline

use bytes::Bytes;

/// Raw video frame in planar YUV420p layout: the full-resolution Y plane
/// followed by the quarter-resolution U and V planes, each contiguous with
/// no padding.
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    /// YUV420p pixel data
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in microseconds
    pub pts_us: i64,
}

impl RawVideoFrame {
    /// Byte length of a YUV420p frame at the given even dimensions.
    pub fn expected_len(width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        w * h + 2 * (w / 2) * (h / 2)
    }

    /// True when dimensions are even and the buffer matches them.
    pub fn is_valid(&self) -> bool {
        self.width % 2 == 0
            && self.height % 2 == 0
            && self.data.len() == Self::expected_len(self.width, self.height)
    }
}

/// Raw audio frame containing interleaved float32 PCM samples.
#[derive(Debug, Clone)]
pub struct RawAudioFrame {
    /// Interleaved samples, `num_samples * channels` long
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel
    pub num_samples: u32,
    pub pts_us: i64,
}

impl RawAudioFrame {
    pub fn is_valid(&self) -> bool {
        self.samples.len() == self.num_samples as usize * self.channels as usize
    }

    /// Frame duration in microseconds.
    pub fn duration_us(&self) -> u64 {
        (self.num_samples as u64 * 1_000_000) / self.sample_rate as u64
    }
}

/// Kind of encoded media unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    VideoKeyframe,
    VideoPFrame,
    Audio,
}

impl FrameType {
    pub fn is_video(&self) -> bool {
        matches!(self, FrameType::VideoKeyframe | FrameType::VideoPFrame)
    }
}

/// One encoded media unit as produced by an encoder and carried by the
/// protocol as 1..N fragments.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Opaque codec bytes
    pub data: Bytes,
    pub frame_type: FrameType,
    pub pts_us: i64,
    /// Monotonic (mod 2^16) frame counter, independent per stream type
    pub frame_id: u16,
}

/// Stream parameters negotiated during the handshake.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_bitrate: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    /// Codec extradata (e.g. SPS/PPS); opaque to the protocol
    pub codec_data: Vec<u8>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: crate::constants::DEFAULT_FPS,
            video_bitrate: crate::constants::DEFAULT_VIDEO_BITRATE,
            audio_sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            audio_channels: crate::constants::DEFAULT_CHANNELS,
            codec_data: Vec::new(),
        }
    }
}
