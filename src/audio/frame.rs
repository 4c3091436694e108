use crate::error::AudioDecodeError;

/// A fixed-length block of mono 16-bit PCM.
///
/// Samples are private: a frame is immutable once built, and handing it to
/// another component moves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode little-endian PCM16 bytes.
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32) -> Result<Self, AudioDecodeError> {
        Ok(Self::new(decode_pcm16(bytes)?, sample_rate))
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in milliseconds at the frame's sample rate.
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Little-endian byte layout used on the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Number of samples in one frame: `sample_rate × frame_duration_ms / 1000`, rounded.
pub fn frame_len(sample_rate: u32, frame_duration_ms: u32) -> usize {
    ((sample_rate as f64 * frame_duration_ms as f64) / 1000.0).round() as usize
}

/// Little-endian PCM16 bytes to samples. Odd lengths are rejected.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<i16>, AudioDecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioDecodeError::OddByteLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
