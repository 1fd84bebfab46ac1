//! Microphone capture through cpal.
//!
//! The cpal stream is not `Send`, so each capture runs on its own thread and
//! keeps the stream open until the track it feeds is stopped. Samples cross
//! into the async side through a ring buffer and are published as frames.

use crate::audio::{samples_per_frame, AudioFrame, FRAME_DURATION};
use crate::stream::MediaTrack;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use log::{debug, error};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use voice_core::{CaptureSource, Error};

/// What the opened input device reported.
#[derive(Debug, Clone)]
pub struct InputInfo {
    pub name: String,
    pub channels: u16,
    pub sample_rate: u32,
}

/// Map a cpal failure to the capture error a caller can act on.
pub(crate) fn classify(name: &str, message: String) -> Error {
    let lowered = message.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") {
        Error::PermissionDenied(CaptureSource::Microphone)
    } else {
        Error::DeviceUnavailable(format!("{}: {}", name, message))
    }
}

pub(crate) fn find_input(preferred: Option<&str>) -> Result<cpal::Device, Error> {
    let host = cpal::default_host();
    match preferred {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| Error::DeviceUnavailable(format!("input device '{}' not found", wanted))),
        None => host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no default input device".to_string())),
    }
}

/// Open the input device and feed `track` until it is stopped.
///
/// Returns once capture is running, or with the error that kept it from
/// starting.
pub(crate) async fn start(preferred: Option<String>, track: MediaTrack) -> Result<InputInfo, Error> {
    let runtime = Handle::current();
    let (ready_tx, ready_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("huddle-capture".to_string())
        .spawn(move || {
            let stream = match open(preferred.as_deref(), &track, &runtime) {
                Ok((stream, info)) => {
                    if ready_tx.send(Ok(info)).is_err() {
                        // Nobody is waiting for this capture any more.
                        track.stop();
                    }
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            runtime.block_on(track.ended());
            drop(stream);
            debug!("Capture for {} closed", track.label());
        })
        .map_err(|e| Error::DeviceUnavailable(format!("capture thread: {}", e)))?;

    ready_rx
        .await
        .map_err(|_| Error::DeviceUnavailable("capture thread exited".to_string()))?
}

fn open(
    preferred: Option<&str>,
    track: &MediaTrack,
    runtime: &Handle,
) -> Result<(cpal::Stream, InputInfo), Error> {
    let device = find_input(preferred)?;
    let name = device.name().unwrap_or_else(|_| "microphone".to_string());
    let supported = device
        .default_input_config()
        .map_err(|e| classify(&name, e.to_string()))?;
    let info = InputInfo {
        name: name.clone(),
        channels: supported.channels(),
        sample_rate: supported.sample_rate().0,
    };
    let config = supported.config();

    // One second of mono audio
    let (producer, consumer) = HeapRb::<f32>::new(info.sample_rate as usize).split();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build::<f32>(&device, &config, producer),
        SampleFormat::I16 => build::<i16>(&device, &config, producer),
        SampleFormat::U16 => build::<u16>(&device, &config, producer),
        other => Err(Error::DeviceUnavailable(format!(
            "{}: unsupported sample format {:?}",
            name, other
        ))),
    }?;
    stream.play().map_err(|e| classify(&name, e.to_string()))?;

    runtime.spawn(pump(consumer, track.clone(), info.sample_rate));
    Ok((stream, info))
}

/// Build an input stream that downmixes every device frame to mono.
fn build<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProducer<f32>,
) -> Result<cpal::Stream, Error>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
                    let _ = producer.push(sum / frame.len() as f32);
                }
            },
            |e| error!("Capture stream error: {}", e),
            None,
        )
        .map_err(|e| classify("input", e.to_string()))
}

/// Cut buffered samples into frames and publish them on `track` until it ends.
pub(crate) async fn pump(mut consumer: HeapConsumer<f32>, track: MediaTrack, sample_rate: u32) {
    let frame_len = samples_per_frame(sample_rate);
    let mut samples = vec![0.0; frame_len];
    let mut interval = tokio::time::interval(FRAME_DURATION);
    loop {
        tokio::select! {
            _ = track.ended() => break,
            _ = interval.tick() => {
                while consumer.len() >= frame_len {
                    consumer.pop_slice(&mut samples);
                    track.publish(AudioFrame::new(samples.clone(), sample_rate));
                }
            }
        }
    }
    debug!("Frame pump for {} stopped", track.label());
}
