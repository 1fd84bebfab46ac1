//! PCM frames exchanged between capture, peer links and playback.

use std::time::Duration;

/// Length of one audio frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Number of mono samples in one frame at `sample_rate`.
pub fn samples_per_frame(sample_rate: u32) -> usize {
    (sample_rate as u128 * FRAME_DURATION.as_millis() / 1000) as usize
}

/// A block of mono samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// One frame of silence.
    pub fn silent(sample_rate: u32) -> Self {
        Self::new(vec![0.0; samples_per_frame(sample_rate)], sample_rate)
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| *s == 0.0)
    }

    pub fn silence(&mut self) {
        self.samples.fill(0.0);
    }

    /// Copy of the frame at another rate, linearly interpolated.
    pub fn resampled(&self, sample_rate: u32) -> AudioFrame {
        if sample_rate == self.sample_rate || self.sample_rate == 0 || self.samples.is_empty() {
            return AudioFrame::new(self.samples.clone(), sample_rate);
        }
        let len = (self.samples.len() as u64 * sample_rate as u64 / self.sample_rate as u64) as usize;
        let step = self.sample_rate as f64 / sample_rate as f64;
        let last = self.samples.len() - 1;
        let samples = (0..len)
            .map(|i| {
                let pos = i as f64 * step;
                let index = pos as usize;
                let frac = (pos - index as f64) as f32;
                let a = self.samples[index.min(last)];
                let b = self.samples[(index + 1).min(last)];
                a + (b - a) * frac
            })
            .collect();
        AudioFrame::new(samples, sample_rate)
    }
}
