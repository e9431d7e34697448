//! WAV helpers for the headless backend: read a mono input file for the
//! microphone and write the agent's recorded speech.

use crate::error::{SessionError, SessionResult};
use std::fs::File;
use std::path::Path;

/// Read a WAV file as mono normalized samples, returning `(samples, sample_rate)`.
///
/// Multi-channel files are down-mixed by averaging each frame.
pub fn read_mono(path: &Path) -> SessionResult<(Vec<f32>, u32)> {
    let mut file = File::open(path).map_err(|e| {
        SessionError::AudioDevice(format!("cannot open {}: {}", path.display(), e))
    })?;
    let (header, data) = wav::read(&mut file).map_err(|e| {
        SessionError::AudioDevice(format!("cannot read {}: {}", path.display(), e))
    })?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(v) => v.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(v) => v.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(v) => v.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(v) => v,
        wav::BitDepth::Empty => Vec::new(),
    };

    let channels = header.channel_count.max(1) as usize;
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok((mono, header.sampling_rate))
}

/// Write mono normalized samples as a 16-bit PCM WAV file.
pub fn write_mono(path: &Path, samples: &[f32], sample_rate: u32) -> SessionResult<()> {
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let pcm: Vec<i16> = samples
        .iter()
        .map(|&s| crate::audio::pcm::float_to_pcm16(s))
        .collect();

    let mut file = File::create(path).map_err(|e| {
        SessionError::AudioDevice(format!("cannot create {}: {}", path.display(), e))
    })?;
    wav::write(header, &wav::BitDepth::Sixteen(pcm), &mut file).map_err(|e| {
        SessionError::AudioDevice(format!("cannot write {}: {}", path.display(), e))
    })
}

/// Naive linear resampler, enough to feed a 44.1 kHz test file into a 16 kHz capture.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}
