//! G.711 μ-law (PCMU), the audio codec carried on peer links.

use media_io::AudioFrame;

/// PCMU always runs at 8 kHz.
pub const PCMU_RATE: u32 = 8_000;
/// Static RTP payload type of PCMU.
pub const PCMU_PAYLOAD_TYPE: u8 = 0;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte as i32;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode a frame as a PCMU payload, resampling to 8 kHz first.
pub fn encode_frame(frame: &AudioFrame) -> Vec<u8> {
    frame
        .resampled(PCMU_RATE)
        .samples
        .iter()
        .map(|s| linear_to_ulaw((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect()
}

pub fn decode_frame(payload: &[u8]) -> AudioFrame {
    let samples = payload
        .iter()
        .map(|b| ulaw_to_linear(*b) as f32 / 32_768.0)
        .collect();
    AudioFrame::new(samples, PCMU_RATE)
}
