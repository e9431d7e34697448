//! # PCM Codec
//!
//! Conversion between normalized `f32` samples and the base64 PCM16
//! little-endian payloads that travel over the relay connection.
//!
//! ## Sample Format:
//! - Outbound: microphone samples in [-1.0, 1.0] → signed 16-bit LE → base64
//! - Inbound: base64 → signed 16-bit LE → samples divided by 32768.0

use crate::error::{SessionError, SessionResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Convert one normalized sample to PCM16.
///
/// The negative side is scaled by 0x8000 and the positive side by 0x7FFF so that
/// -1.0 and 1.0 land exactly on `i16::MIN` and `i16::MAX`.
pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode normalized samples as PCM16 little-endian bytes.
pub fn encode_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec never fails.
        let _ = bytes.write_i16::<LittleEndian>(float_to_pcm16(sample));
    }
    bytes
}

/// Encode normalized samples straight to the base64 transport payload.
pub fn encode_frame(samples: &[f32]) -> String {
    STANDARD.encode(encode_pcm16le(samples))
}

/// Decode PCM16 little-endian bytes into normalized samples.
///
/// ## Errors:
/// - empty payload
/// - odd byte count (a truncated sample means the frame is corrupt)
pub fn decode_pcm16le(bytes: &[u8]) -> SessionResult<Vec<f32>> {
    if bytes.is_empty() {
        return Err(SessionError::Decode("empty audio payload".into()));
    }
    if bytes.len() % 2 != 0 {
        return Err(SessionError::Decode(format!(
            "odd PCM16 payload length {}",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

/// Decode a base64 transport payload into normalized samples.
pub fn decode_frame(payload: &str) -> SessionResult<Vec<f32>> {
    let bytes = STANDARD.decode(payload.trim())?;
    decode_pcm16le(&bytes)
}

/// Root-mean-square level of a block of samples, 0.0 for an empty block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_pcm16_scaling() {
        assert_eq!(float_to_pcm16(0.0), 0);
        assert_eq!(float_to_pcm16(1.0), i16::MAX);
        assert_eq!(float_to_pcm16(-1.0), i16::MIN);
        assert_eq!(float_to_pcm16(0.5), 16383);
        assert_eq!(float_to_pcm16(-0.5), -16384);
    }

    #[test]
    fn test_out_of_range_samples_are_clamped() {
        assert_eq!(float_to_pcm16(3.7), i16::MAX);
        assert_eq!(float_to_pcm16(-12.0), i16::MIN);
        assert_eq!(float_to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn test_encode_is_little_endian() {
        let bytes = encode_pcm16le(&[1.0, -1.0]);
        assert_eq!(bytes, vec![0xFF, 0x7F, 0x00, 0x80]);
    }

    #[test]
    fn test_decode_frame() {
        // 0x4000 = 16384 → 0.5, 0xC000 = -16384 → -0.5
        let payload = STANDARD.encode([0x00, 0x40, 0x00, 0xC0]);
        let samples = decode_frame(&payload).unwrap();
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn test_decode_rejects_corrupt_payloads() {
        assert!(matches!(decode_frame(""), Err(SessionError::Decode(_))));
        assert!(matches!(
            decode_frame(&STANDARD.encode([1u8, 2, 3])),
            Err(SessionError::Decode(_))
        ));
        assert!(matches!(
            decode_frame("!!not base64!!"),
            Err(SessionError::Decode(_))
        ));
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }
}
