//! Remote audio playback through cpal.
//!
//! Every remote participant feeds its own queue; the output callback sums the
//! queues sample by sample.

use crate::audio::AudioFrame;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use log::{debug, error, info};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use voice_core::Error;

/// Queued audio per source is capped at this many seconds.
const MAX_BACKLOG_SECS: usize = 1;

struct Mixer {
    sample_rate: u32,
    sources: Mutex<HashMap<u64, VecDeque<f32>>>,
    next_source: AtomicU64,
}

impl Mixer {
    fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            sources: Mutex::new(HashMap::new()),
            next_source: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, VecDeque<f32>>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn source(self: &Arc<Self>) -> PlaybackSource {
        let id = self.next_source.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, VecDeque::new());
        PlaybackSource {
            id,
            mixer: self.clone(),
        }
    }

    /// Fill interleaved `out` with the next sample of every source, the same
    /// value on every channel. Missing samples are silence.
    fn mix_into(&self, out: &mut [f32], channels: usize) {
        let mut sources = self.lock();
        for frame in out.chunks_mut(channels.max(1)) {
            let mixed: f32 = sources
                .values_mut()
                .map(|queue| queue.pop_front().unwrap_or(0.0))
                .sum();
            frame.fill(mixed.clamp(-1.0, 1.0));
        }
    }
}

/// One remote participant's audio on the speaker. Dropping it removes the
/// participant from the mix.
pub struct PlaybackSource {
    id: u64,
    mixer: Arc<Mixer>,
}

impl PlaybackSource {
    /// Queue a frame behind whatever this source has not played yet.
    pub fn play(&self, frame: &AudioFrame) {
        let frame = frame.resampled(self.mixer.sample_rate);
        let max = self.mixer.sample_rate as usize * MAX_BACKLOG_SECS;
        let mut sources = self.mixer.lock();
        if let Some(queue) = sources.get_mut(&self.id) {
            queue.extend(frame.samples);
            let excess = queue.len().saturating_sub(max);
            queue.drain(..excess);
        }
    }
}

impl Drop for PlaybackSource {
    fn drop(&mut self) {
        self.mixer.lock().remove(&self.id);
    }
}

struct SpeakerInner {
    mixer: Arc<Mixer>,
    /// Dropping the sender lets the playback thread close the stream
    _shutdown: mpsc::Sender<()>,
}

/// The host output device. Clones share one output stream, which closes when
/// the last clone is dropped.
#[derive(Clone)]
pub struct Speaker {
    inner: Arc<SpeakerInner>,
}

impl Speaker {
    /// Open the named output device, or the host default when `preferred` is
    /// `None`.
    pub fn open(preferred: Option<&str>) -> Result<Self, Error> {
        let preferred = preferred.map(str::to_string);
        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown, shutdown_rx) = mpsc::channel::<()>();
        std::thread::Builder::new()
            .name("huddle-playback".to_string())
            .spawn(move || {
                let (stream, mixer, name) = match open_output(preferred.as_deref()) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(mixer));
                // Returns once every Speaker clone is gone.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Playback on {} closed", name);
            })
            .map_err(|e| Error::DeviceUnavailable(format!("playback thread: {}", e)))?;

        let mixer = ready_rx
            .recv()
            .map_err(|_| Error::DeviceUnavailable("playback thread exited".to_string()))??;
        Ok(Self {
            inner: Arc::new(SpeakerInner {
                mixer,
                _shutdown: shutdown,
            }),
        })
    }

    /// Add a source to the mix.
    pub fn source(&self) -> PlaybackSource {
        self.inner.mixer.source()
    }
}

fn open_output(preferred: Option<&str>) -> Result<(cpal::Stream, Arc<Mixer>, String), Error> {
    let host = cpal::default_host();
    let device = match preferred {
        Some(wanted) => host
            .output_devices()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| {
                Error::DeviceUnavailable(format!("output device '{}' not found", wanted))
            })?,
        None => host
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no default output device".to_string()))?,
    };
    let name = device.name().unwrap_or_else(|_| "speaker".to_string());
    let supported = device
        .default_output_config()
        .map_err(|e| Error::DeviceUnavailable(format!("{}: {}", name, e)))?;
    let config = supported.config();
    let mixer = Mixer::new(config.sample_rate.0);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build::<f32>(&device, &config, mixer.clone()),
        SampleFormat::I16 => build::<i16>(&device, &config, mixer.clone()),
        SampleFormat::U16 => build::<u16>(&device, &config, mixer.clone()),
        other => Err(Error::DeviceUnavailable(format!(
            "{}: unsupported sample format {:?}",
            name, other
        ))),
    }?;
    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(format!("{}: {}", name, e)))?;
    info!(
        "Playing remote audio on {} at {} Hz",
        name, config.sample_rate.0
    );
    Ok((stream, mixer, name))
}

fn build<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: Arc<Mixer>,
) -> Result<cpal::Stream, Error>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut mixed = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mixed.resize(data.len(), 0.0);
                mixer.mix_into(&mut mixed, channels);
                for (out, sample) in data.iter_mut().zip(&mixed) {
                    *out = T::from_sample(*sample);
                }
            },
            |e| error!("Playback stream error: {}", e),
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_are_summed_per_channel() {
        let mixer = Mixer::new(8_000);
        let a = mixer.source();
        let b = mixer.source();
        a.play(&AudioFrame::new(vec![0.25, 0.25], 8_000));
        b.play(&AudioFrame::new(vec![0.5], 8_000));

        let mut out = vec![1.0; 6];
        mixer.mix_into(&mut out, 2);
        assert_eq!(out, vec![0.75, 0.75, 0.25, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn mix_is_clipped() {
        let mixer = Mixer::new(8_000);
        let a = mixer.source();
        let b = mixer.source();
        a.play(&AudioFrame::new(vec![0.8], 8_000));
        b.play(&AudioFrame::new(vec![0.8], 8_000));

        let mut out = vec![0.0; 1];
        mixer.mix_into(&mut out, 1);
        assert_eq!(out, vec![1.0]);
    }

    #[test]
    fn frames_are_resampled_to_output_rate() {
        let mixer = Mixer::new(48_000);
        let source = mixer.source();
        source.play(&AudioFrame::new(vec![0.1; 160], 8_000));
        assert_eq!(mixer.lock()[&source.id].len(), 960);
    }

    #[test]
    fn backlog_is_bounded() {
        let mixer = Mixer::new(8_000);
        let source = mixer.source();
        for _ in 0..100 {
            source.play(&AudioFrame::silent(8_000));
        }
        assert_eq!(mixer.lock()[&source.id].len(), 8_000);
    }

    #[test]
    fn dropped_source_leaves_the_mix() {
        let mixer = Mixer::new(8_000);
        let source = mixer.source();
        source.play(&AudioFrame::new(vec![0.5; 4], 8_000));
        drop(source);
        assert!(mixer.lock().is_empty());

        let mut out = vec![1.0; 2];
        mixer.mix_into(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0]);
    }
}
