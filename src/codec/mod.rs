//! Codec seams for the pipelines
//!
//! The pipelines treat codecs as black boxes behind these traits:
//! `encode(raw) -> packet` and `decode(packet) -> raw`. A real deployment
//! plugs in a hardware or libav-backed codec; the passthrough codec ships
//! as the working default, carrying raw YUV/PCM unchanged the way the
//! original transport bring-up did. It still honors the full encoder
//! contract: GOP-based keyframe marking, a force-keyframe flag sampled and
//! cleared by the next `encode`, and `set_bitrate` reconfiguration that is
//! exclusive with `encode`.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::CodecError;
use crate::types::{EncodedPacket, FrameType, RawAudioFrame, RawVideoFrame};

/// Video encoder seam. Shared between the encode thread and the control
/// paths (`request_keyframe` from the protocol callback, `set_bitrate` from
/// the adaptive loop), hence `&self` methods and internal synchronization.
pub trait VideoEncoder: Send + Sync {
    /// Encode one raw frame. `Ok(None)` means the codec buffered the frame.
    fn encode(&self, frame: &RawVideoFrame) -> Result<Option<EncodedPacket>, CodecError>;

    /// Make the next encoded frame a keyframe.
    fn request_keyframe(&self);

    /// Reconfigure the target bitrate, preserving dimensions and fps.
    /// Implementations must serialize this against `encode`.
    fn set_bitrate(&self, bitrate: u32) -> Result<(), CodecError>;

    fn bitrate(&self) -> u32;

    /// Codec extradata a decoder needs before the first packet.
    fn codec_data(&self) -> Vec<u8>;
}

/// Video decoder seam; owned by the decode thread.
pub trait VideoDecoder: Send {
    /// Install codec extradata received via STREAM_CONFIG.
    fn set_codec_data(&mut self, data: &[u8]) -> Result<(), CodecError>;

    /// Decode one packet. `Ok(None)` means the codec needs more input.
    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<RawVideoFrame>, CodecError>;
}

/// Audio encoder seam; owned by the audio encode thread.
pub trait AudioEncoder: Send {
    fn encode(&mut self, frame: &RawAudioFrame) -> Result<Option<EncodedPacket>, CodecError>;
}

/// Audio decoder seam; owned by the audio decode thread.
pub trait AudioDecoder: Send {
    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<RawAudioFrame>, CodecError>;
}

const CODEC_DATA_MAGIC: &[u8; 4] = b"RAWV";
const CODEC_DATA_SIZE: usize = 16;

struct VideoEncoderState {
    width: u32,
    height: u32,
    fps: u32,
    bitrate: u32,
    gop: u32,
    frame_id: u16,
    frames_since_keyframe: u32,
    frames_encoded: u64,
}

/// Identity video "encoder": passes YUV420p bytes through unchanged while
/// providing real keyframe cadence and reconfiguration semantics.
pub struct PassthroughVideoEncoder {
    state: Mutex<VideoEncoderState>,
    force_keyframe: AtomicBool,
}

impl PassthroughVideoEncoder {
    pub fn new(width: u32, height: u32, fps: u32, bitrate: u32) -> Result<Self, CodecError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(CodecError::EncoderInit(format!(
                "bad dimensions {width}x{height}"
            )));
        }
        if fps == 0 {
            return Err(CodecError::EncoderInit("fps is zero".into()));
        }
        info!(
            "Passthrough video encoder: {}x{} @ {} fps, bitrate {}",
            width, height, fps, bitrate
        );
        Ok(Self {
            state: Mutex::new(VideoEncoderState {
                width,
                height,
                fps,
                bitrate,
                gop: fps * 2,
                frame_id: 0,
                frames_since_keyframe: 0,
                frames_encoded: 0,
            }),
            force_keyframe: AtomicBool::new(false),
        })
    }

    pub fn frames_encoded(&self) -> u64 {
        self.state.lock().unwrap().frames_encoded
    }
}

impl VideoEncoder for PassthroughVideoEncoder {
    fn encode(&self, frame: &RawVideoFrame) -> Result<Option<EncodedPacket>, CodecError> {
        let mut state = self.state.lock().unwrap();
        if frame.width != state.width || frame.height != state.height {
            return Err(CodecError::EncodingFailed(format!(
                "frame is {}x{}, encoder is {}x{}",
                frame.width, frame.height, state.width, state.height
            )));
        }
        if !frame.is_valid() {
            return Err(CodecError::InvalidFrameSize(frame.data.len()));
        }

        let keyframe = self.force_keyframe.swap(false, Ordering::AcqRel)
            || state.frames_since_keyframe >= state.gop
            || state.frames_encoded == 0;
        if keyframe {
            state.frames_since_keyframe = 0;
        } else {
            state.frames_since_keyframe += 1;
        }

        let frame_id = state.frame_id;
        state.frame_id = state.frame_id.wrapping_add(1);
        state.frames_encoded += 1;

        Ok(Some(EncodedPacket {
            data: Bytes::copy_from_slice(&frame.data),
            frame_type: if keyframe {
                FrameType::VideoKeyframe
            } else {
                FrameType::VideoPFrame
            },
            pts_us: frame.pts_us,
            frame_id,
        }))
    }

    fn request_keyframe(&self) {
        self.force_keyframe.store(true, Ordering::Release);
        debug!("Keyframe requested");
    }

    fn set_bitrate(&self, bitrate: u32) -> Result<(), CodecError> {
        let mut state = self.state.lock().unwrap();
        if state.bitrate == bitrate {
            return Ok(());
        }
        info!("Changing bitrate: {} -> {}", state.bitrate, bitrate);
        // Reconfiguration restarts the GOP, so the stream resumes at a
        // decodable boundary
        state.bitrate = bitrate;
        state.frames_since_keyframe = 0;
        self.force_keyframe.store(true, Ordering::Release);
        Ok(())
    }

    fn bitrate(&self) -> u32 {
        self.state.lock().unwrap().bitrate
    }

    fn codec_data(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let mut buf = BytesMut::with_capacity(CODEC_DATA_SIZE);
        buf.put_slice(CODEC_DATA_MAGIC);
        buf.put_u32_le(state.width);
        buf.put_u32_le(state.height);
        buf.put_u32_le(state.fps);
        buf.to_vec()
    }
}

/// Identity video "decoder": interprets packet bytes as YUV420p at the
/// dimensions from WELCOME or the codec extradata.
pub struct PassthroughVideoDecoder {
    width: u32,
    height: u32,
}

impl PassthroughVideoDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl VideoDecoder for PassthroughVideoDecoder {
    fn set_codec_data(&mut self, data: &[u8]) -> Result<(), CodecError> {
        if data.len() < CODEC_DATA_SIZE || &data[0..4] != CODEC_DATA_MAGIC {
            return Err(CodecError::DecoderInit("bad codec data".into()));
        }
        self.width = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        self.height = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        Ok(())
    }

    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<RawVideoFrame>, CodecError> {
        let expected = RawVideoFrame::expected_len(self.width, self.height);
        if self.width == 0 || packet.data.len() != expected {
            return Err(CodecError::DecodingFailed(format!(
                "packet is {} bytes, expected {}",
                packet.data.len(),
                expected
            )));
        }
        Ok(Some(RawVideoFrame {
            data: packet.data.to_vec(),
            width: self.width,
            height: self.height,
            pts_us: packet.pts_us,
        }))
    }
}

/// Identity audio "encoder": interleaved f32 PCM to little-endian bytes.
pub struct PassthroughAudioEncoder {
    frame_id: u16,
    frames_encoded: u64,
}

impl PassthroughAudioEncoder {
    pub fn new() -> Self {
        Self {
            frame_id: 0,
            frames_encoded: 0,
        }
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

impl Default for PassthroughAudioEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEncoder for PassthroughAudioEncoder {
    fn encode(&mut self, frame: &RawAudioFrame) -> Result<Option<EncodedPacket>, CodecError> {
        if !frame.is_valid() {
            return Err(CodecError::InvalidFrameSize(frame.samples.len()));
        }
        let mut buf = BytesMut::with_capacity(frame.samples.len() * 4);
        for sample in &frame.samples {
            buf.put_f32_le(*sample);
        }
        let frame_id = self.frame_id;
        self.frame_id = self.frame_id.wrapping_add(1);
        self.frames_encoded += 1;
        Ok(Some(EncodedPacket {
            data: buf.freeze(),
            frame_type: FrameType::Audio,
            pts_us: frame.pts_us,
            frame_id,
        }))
    }
}

/// Identity audio "decoder": little-endian bytes back to f32 PCM.
pub struct PassthroughAudioDecoder {
    sample_rate: u32,
    channels: u16,
}

impl PassthroughAudioDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl AudioDecoder for PassthroughAudioDecoder {
    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<RawAudioFrame>, CodecError> {
        if self.channels == 0 {
            return Err(CodecError::DecoderInit("zero channels".into()));
        }
        if packet.data.len() % (4 * self.channels as usize) != 0 {
            return Err(CodecError::DecodingFailed(format!(
                "payload of {} bytes is not whole frames",
                packet.data.len()
            )));
        }
        let samples: Vec<f32> = packet
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let num_samples = (samples.len() / self.channels as usize) as u32;
        Ok(Some(RawAudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            num_samples,
            pts_us: packet.pts_us,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame(width: u32, height: u32, pts_us: i64) -> RawVideoFrame {
        RawVideoFrame {
            data: vec![0x80; RawVideoFrame::expected_len(width, height)],
            width,
            height,
            pts_us,
        }
    }

    #[test]
    fn first_frame_is_a_keyframe_then_gop_cadence() {
        let encoder = PassthroughVideoEncoder::new(64, 48, 2, 1_000_000).unwrap();
        // gop = fps * 2 = 4
        let first = encoder.encode(&raw_frame(64, 48, 0)).unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::VideoKeyframe);
        assert_eq!(first.frame_id, 0);

        for i in 1..=4 {
            let p = encoder.encode(&raw_frame(64, 48, i)).unwrap().unwrap();
            assert_eq!(p.frame_type, FrameType::VideoPFrame, "frame {i}");
            assert_eq!(p.frame_id, i as u16);
        }
        let next = encoder.encode(&raw_frame(64, 48, 5)).unwrap().unwrap();
        assert_eq!(next.frame_type, FrameType::VideoKeyframe);
    }

    #[test]
    fn force_keyframe_is_sampled_and_cleared() {
        let encoder = PassthroughVideoEncoder::new(64, 48, 30, 1_000_000).unwrap();
        encoder.encode(&raw_frame(64, 48, 0)).unwrap();

        encoder.request_keyframe();
        let forced = encoder.encode(&raw_frame(64, 48, 1)).unwrap().unwrap();
        assert_eq!(forced.frame_type, FrameType::VideoKeyframe);

        let after = encoder.encode(&raw_frame(64, 48, 2)).unwrap().unwrap();
        assert_eq!(after.frame_type, FrameType::VideoPFrame);
    }

    #[test]
    fn set_bitrate_reconfigures_and_forces_keyframe() {
        // S5 consequence: after a bitrate step the stream resumes on a keyframe
        let encoder = PassthroughVideoEncoder::new(64, 48, 30, 6_000_000).unwrap();
        encoder.encode(&raw_frame(64, 48, 0)).unwrap();
        encoder.encode(&raw_frame(64, 48, 1)).unwrap();

        encoder.set_bitrate(3_000_000).unwrap();
        assert_eq!(encoder.bitrate(), 3_000_000);
        let next = encoder.encode(&raw_frame(64, 48, 2)).unwrap().unwrap();
        assert_eq!(next.frame_type, FrameType::VideoKeyframe);
    }

    #[test]
    fn set_bitrate_to_current_value_is_a_no_op() {
        let encoder = PassthroughVideoEncoder::new(64, 48, 30, 6_000_000).unwrap();
        encoder.encode(&raw_frame(64, 48, 0)).unwrap();
        encoder.encode(&raw_frame(64, 48, 1)).unwrap();
        encoder.set_bitrate(6_000_000).unwrap();
        let next = encoder.encode(&raw_frame(64, 48, 2)).unwrap().unwrap();
        assert_eq!(next.frame_type, FrameType::VideoPFrame);
    }

    #[test]
    fn encoder_rejects_wrong_geometry() {
        let encoder = PassthroughVideoEncoder::new(64, 48, 30, 1_000_000).unwrap();
        assert!(encoder.encode(&raw_frame(32, 48, 0)).is_err());

        let mut short = raw_frame(64, 48, 0);
        short.data.truncate(10);
        assert!(encoder.encode(&short).is_err());
    }

    #[test]
    fn encoder_rejects_odd_dimensions() {
        assert!(PassthroughVideoEncoder::new(63, 48, 30, 1).is_err());
        assert!(PassthroughVideoEncoder::new(0, 48, 30, 1).is_err());
        assert!(PassthroughVideoEncoder::new(64, 48, 0, 1).is_err());
    }

    #[test]
    fn codec_data_configures_decoder() {
        let encoder = PassthroughVideoEncoder::new(64, 48, 30, 1_000_000).unwrap();
        let extradata = encoder.codec_data();
        assert_eq!(extradata.len(), CODEC_DATA_SIZE);

        let mut decoder = PassthroughVideoDecoder::new(0, 0);
        decoder.set_codec_data(&extradata).unwrap();

        let packet = encoder.encode(&raw_frame(64, 48, 7)).unwrap().unwrap();
        let decoded = decoder.decode(&packet).unwrap().unwrap();
        assert_eq!(decoded.width, 64);
        assert_eq!(decoded.height, 48);
        assert_eq!(decoded.pts_us, 7);
        assert_eq!(decoded.data.len(), RawVideoFrame::expected_len(64, 48));
    }

    #[test]
    fn decoder_rejects_garbage_codec_data() {
        let mut decoder = PassthroughVideoDecoder::new(0, 0);
        assert!(decoder.set_codec_data(b"nope").is_err());
    }

    #[test]
    fn decoder_rejects_truncated_packet() {
        let mut decoder = PassthroughVideoDecoder::new(64, 48);
        let packet = EncodedPacket {
            data: Bytes::from(vec![0u8; 100]),
            frame_type: FrameType::VideoPFrame,
            pts_us: 0,
            frame_id: 0,
        };
        assert!(decoder.decode(&packet).is_err());
    }

    #[test]
    fn audio_roundtrip_preserves_samples() {
        let mut encoder = PassthroughAudioEncoder::new();
        let mut decoder = PassthroughAudioDecoder::new(48_000, 2);

        let frame = RawAudioFrame {
            samples: vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25],
            sample_rate: 48_000,
            channels: 2,
            num_samples: 3,
            pts_us: 123,
        };
        let packet = encoder.encode(&frame).unwrap().unwrap();
        assert_eq!(packet.frame_type, FrameType::Audio);
        assert_eq!(packet.data.len(), 6 * 4);

        let decoded = decoder.decode(&packet).unwrap().unwrap();
        assert_eq!(decoded.samples, frame.samples);
        assert_eq!(decoded.num_samples, 3);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.pts_us, 123);
    }

    #[test]
    fn audio_frame_ids_are_monotonic() {
        let mut encoder = PassthroughAudioEncoder::new();
        let frame = RawAudioFrame {
            samples: vec![0.0; 4],
            sample_rate: 48_000,
            channels: 2,
            num_samples: 2,
            pts_us: 0,
        };
        for expected in 0..3u16 {
            let p = encoder.encode(&frame).unwrap().unwrap();
            assert_eq!(p.frame_id, expected);
        }
    }

    #[test]
    fn audio_decoder_rejects_ragged_payload() {
        let mut decoder = PassthroughAudioDecoder::new(48_000, 2);
        let packet = EncodedPacket {
            data: Bytes::from(vec![0u8; 6]), // not a multiple of 8
            frame_type: FrameType::Audio,
            pts_us: 0,
            frame_id: 0,
        };
        assert!(decoder.decode(&packet).is_err());
    }
}
