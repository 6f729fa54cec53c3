//! Presentation seams for the viewer pipeline
//!
//! A real deployment plugs a GPU-backed window and an audio device in here.
//! The logging sinks keep the viewer runnable headless.

use tracing::info;

use crate::types::{RawAudioFrame, RawVideoFrame};

/// Video presentation seam, driven from the viewer's main thread.
pub trait VideoSink: Send {
    /// Present one frame.
    fn present(&mut self, frame: &RawVideoFrame);

    /// Pump windowing events. Returning false ends the session (quit/ESC).
    fn poll_events(&mut self) -> bool {
        true
    }
}

/// Audio playback seam. Implementations own their device buffering.
pub trait AudioSink: Send {
    fn play(&mut self, frame: &RawAudioFrame);
}

/// Headless video sink that logs every Nth presented frame.
pub struct StatsVideoSink {
    frames_presented: u64,
    log_every: u64,
}

impl StatsVideoSink {
    pub fn new(log_every: u64) -> Self {
        Self {
            frames_presented: 0,
            log_every: log_every.max(1),
        }
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }
}

impl VideoSink for StatsVideoSink {
    fn present(&mut self, frame: &RawVideoFrame) {
        self.frames_presented += 1;
        if self.frames_presented % self.log_every == 0 {
            info!(
                "Rendered {} frames ({}x{}, pts {} us)",
                self.frames_presented, frame.width, frame.height, frame.pts_us
            );
        }
    }
}

/// Audio sink that counts and discards samples.
pub struct NullAudioSink {
    samples_played: u64,
}

impl NullAudioSink {
    pub fn new() -> Self {
        Self { samples_played: 0 }
    }

    pub fn samples_played(&self) -> u64 {
        self.samples_played
    }
}

impl Default for NullAudioSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullAudioSink {
    fn play(&mut self, frame: &RawAudioFrame) {
        self.samples_played += frame.num_samples as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_sink_counts_frames() {
        let mut sink = StatsVideoSink::new(10);
        let frame = RawVideoFrame {
            data: vec![0; RawVideoFrame::expected_len(64, 48)],
            width: 64,
            height: 48,
            pts_us: 0,
        };
        for _ in 0..5 {
            sink.present(&frame);
        }
        assert_eq!(sink.frames_presented(), 5);
        assert!(sink.poll_events());
    }

    #[test]
    fn null_audio_sink_counts_samples() {
        let mut sink = NullAudioSink::new();
        let frame = RawAudioFrame {
            samples: vec![0.0; 960],
            sample_rate: 48_000,
            channels: 2,
            num_samples: 480,
            pts_us: 0,
        };
        sink.play(&frame);
        sink.play(&frame);
        assert_eq!(sink.samples_played(), 960);
    }
}
