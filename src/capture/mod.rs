//! Capture seams for the host pipeline
//!
//! Real deployments plug OS capture back-ends (X11, DXGI, ScreenCaptureKit)
//! in behind these traits. The synthetic sources below generate an animated
//! test pattern and a sine tone, which keeps the whole transport exercisable
//! on any machine.

use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::error::CaptureError;
use crate::types::{RawAudioFrame, RawVideoFrame};

/// Video capture seam. `next_frame` may block on the capture back-end; the
/// capture thread paces calls to the configured frame rate.
pub trait VideoSource: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn next_frame(&mut self) -> Result<RawVideoFrame, CaptureError>;
}

/// Audio capture seam. `next_frame` blocks until one frame of samples is
/// available, which paces the audio capture thread.
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn next_frame(&mut self) -> Result<RawAudioFrame, CaptureError>;
}

/// Animated YUV420p gradient, in place of a real screen grab.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_index: u64,
    clock: Clock,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(CaptureError::NotAvailable(format!(
                "bad dimensions {width}x{height}"
            )));
        }
        Ok(Self {
            width,
            height,
            frame_index: 0,
            clock: Clock::new(),
        })
    }
}

impl VideoSource for TestPatternSource {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn next_frame(&mut self) -> Result<RawVideoFrame, CaptureError> {
        let w = self.width as usize;
        let h = self.height as usize;
        let t = self.frame_index as usize;
        let mut data = Vec::with_capacity(RawVideoFrame::expected_len(self.width, self.height));

        // Diagonal luma gradient scrolling over time
        for y in 0..h {
            for x in 0..w {
                data.push(((x + y + t * 4) & 0xFF) as u8);
            }
        }
        // Chroma planes drift so color visibly changes frame to frame
        for _y in 0..h / 2 {
            for x in 0..w / 2 {
                data.push(((x + t) & 0xFF) as u8);
            }
        }
        for y in 0..h / 2 {
            for _x in 0..w / 2 {
                data.push(((y + t * 2) & 0xFF) as u8);
            }
        }

        self.frame_index += 1;
        Ok(RawVideoFrame {
            data,
            width: self.width,
            height: self.height,
            pts_us: self.clock.now_us() as i64,
        })
    }
}

/// Sine tone generator, in place of a real system-audio loopback. Paces
/// itself: `next_frame` sleeps until the next frame boundary.
pub struct ToneSource {
    sample_rate: u32,
    channels: u16,
    frequency_hz: f32,
    samples_per_frame: u32,
    phase: f32,
    next_deadline: Instant,
    clock: Clock,
}

impl ToneSource {
    /// 10 ms frames of a sine tone at `frequency_hz`.
    pub fn new(sample_rate: u32, channels: u16, frequency_hz: f32) -> Result<Self, CaptureError> {
        if sample_rate == 0 || channels == 0 {
            return Err(CaptureError::NotAvailable("bad audio format".into()));
        }
        Ok(Self {
            sample_rate,
            channels,
            frequency_hz,
            samples_per_frame: sample_rate / 100,
            phase: 0.0,
            next_deadline: Instant::now(),
            clock: Clock::new(),
        })
    }

    fn frame_duration(&self) -> Duration {
        Duration::from_micros(
            self.samples_per_frame as u64 * 1_000_000 / self.sample_rate as u64,
        )
    }
}

impl AudioSource for ToneSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn next_frame(&mut self) -> Result<RawAudioFrame, CaptureError> {
        let now = Instant::now();
        if self.next_deadline > now {
            std::thread::sleep(self.next_deadline - now);
        }
        self.next_deadline = self.next_deadline.max(now) + self.frame_duration();

        let step = 2.0 * std::f32::consts::PI * self.frequency_hz / self.sample_rate as f32;
        let mut samples =
            Vec::with_capacity(self.samples_per_frame as usize * self.channels as usize);
        for _ in 0..self.samples_per_frame {
            let value = self.phase.sin() * 0.2;
            for _ in 0..self.channels {
                samples.push(value);
            }
            self.phase = (self.phase + step) % (2.0 * std::f32::consts::PI);
        }

        Ok(RawAudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            num_samples: self.samples_per_frame,
            pts_us: self.clock.now_us() as i64,
        })
    }
}
