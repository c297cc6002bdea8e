//! # Audio Body Decoding
//!
//! Converts raw request bodies into mono `f32` samples in [-1.0, 1.0].
//! Nothing here resamples or inspects the signal: sample rate and channel layout
//! are the client's contract.

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Encoding of an uploaded sample buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Little-endian IEEE 754 single precision
    #[default]
    F32le,
    /// Little-endian signed 16-bit PCM
    S16le,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32le => 4,
            SampleFormat::S16le => 2,
        }
    }
}

impl std::str::FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "f32le" | "f32" => Ok(SampleFormat::F32le),
            "s16le" | "s16" | "pcm16" => Ok(SampleFormat::S16le),
            _ => Err(format!("Unknown sample format: {}", s)),
        }
    }
}

/// Audio body decoding utilities.
pub struct AudioProcessor;

impl AudioProcessor {
    /// Decode a request body into samples.
    ///
    /// ## Returns:
    /// - **Ok(Vec<f32>)**: One value per sample (an empty body gives no samples)
    /// - **Err(String)**: The body length is not a whole number of samples
    pub fn decode(data: &[u8], format: SampleFormat) -> Result<Vec<f32>, String> {
        let width = format.bytes_per_sample();
        if data.len() % width != 0 {
            return Err(format!(
                "Audio body length {} is not a multiple of {} bytes ({:?} samples)",
                data.len(),
                width,
                format
            ));
        }

        let n_samples = data.len() / width;
        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(n_samples);

        match format {
            SampleFormat::F32le => {
                while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
                    samples.push(sample);
                }
            }
            SampleFormat::S16le => {
                let mut pcm = vec![0i16; n_samples];
                cursor
                    .read_i16_into::<LittleEndian>(&mut pcm)
                    .map_err(|e| format!("Failed to read PCM samples: {}", e))?;
                samples = Self::pcm_to_float(&pcm);
            }
        }

        Ok(samples)
    }

    /// Convert 16-bit PCM samples to 32-bit float format.
    ///
    /// Scales from [-32768, 32767] to [-1.0, 1.0).
    pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
        samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_format_parsing() {
        assert_eq!("f32le".parse::<SampleFormat>().unwrap(), SampleFormat::F32le);
        assert_eq!("S16LE".parse::<SampleFormat>().unwrap(), SampleFormat::S16le);
        assert!("mp3".parse::<SampleFormat>().is_err());
        assert_eq!(SampleFormat::default(), SampleFormat::F32le);
    }

    #[test]
    fn test_decode_f32le() {
        let mut body = Vec::new();
        for sample in [0.0f32, 0.5, -1.0] {
            body.extend_from_slice(&sample.to_le_bytes());
        }

        let samples = AudioProcessor::decode(&body, SampleFormat::F32le).unwrap();
        assert_eq!(samples, vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn test_decode_s16le() {
        let mut body = Vec::new();
        for sample in [0i16, 16384, -32768] {
            body.extend_from_slice(&sample.to_le_bytes());
        }

        let samples = AudioProcessor::decode(&body, SampleFormat::S16le).unwrap();
        assert_eq!(samples, vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn test_decode_rejects_partial_samples() {
        assert!(AudioProcessor::decode(&[0u8; 6], SampleFormat::F32le).is_err());
        assert!(AudioProcessor::decode(&[0u8; 3], SampleFormat::S16le).is_err());
        assert!(AudioProcessor::decode(&[], SampleFormat::F32le).unwrap().is_empty());
    }
}
