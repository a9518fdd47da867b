//! Frame codec seam
//!
//! One wire frame holds one fixed duration of compressed audio. The gateway
//! only ever touches frames through [`AudioCodec`], so swapping in an Opus
//! implementation is a matter of providing another impl behind the same
//! trait.

use crate::config::AudioFormat;
use crate::{Error, Result};

/// Encodes and decodes single fixed-duration audio frames
pub trait AudioCodec: Send + Sync {
    /// Decode one wire frame into PCM samples
    ///
    /// # Errors
    ///
    /// Returns error for malformed frames (recoverable; the caller drops the
    /// frame and keeps the connection).
    fn decode(&self, frame: &[u8]) -> Result<Vec<i16>>;

    /// Encode PCM samples for one frame into wire bytes
    ///
    /// # Errors
    ///
    /// Returns error if `samples` is not exactly one frame long.
    fn encode(&self, samples: &[i16]) -> Result<Vec<u8>>;

    /// Samples expected per frame
    fn samples_per_frame(&self) -> usize;
}

/// Little-endian 16-bit PCM frame codec
#[derive(Debug, Clone, Copy)]
pub struct Pcm16Codec {
    format: AudioFormat,
}

impl Pcm16Codec {
    /// Create a codec for the given audio contract
    #[must_use]
    pub const fn new(format: AudioFormat) -> Self {
        Self { format }
    }
}

impl AudioCodec for Pcm16Codec {
    fn decode(&self, frame: &[u8]) -> Result<Vec<i16>> {
        if frame.is_empty() {
            return Err(Error::Audio("empty audio frame".to_string()));
        }
        if frame.len() % 2 != 0 {
            return Err(Error::Audio(format!(
                "frame length {} is not sample-aligned",
                frame.len()
            )));
        }
        if frame.len() > self.format.frame_bytes() {
            return Err(Error::Audio(format!(
                "frame length {} exceeds {} bytes",
                frame.len(),
                self.format.frame_bytes()
            )));
        }

        Ok(frame
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn encode(&self, samples: &[i16]) -> Result<Vec<u8>> {
        if samples.len() != self.format.samples_per_frame() {
            return Err(Error::Audio(format!(
                "expected {} samples per frame, got {}",
                self.format.samples_per_frame(),
                samples.len()
            )));
        }

        let mut frame = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            frame.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(frame)
    }

    fn samples_per_frame(&self) -> usize {
        self.format.samples_per_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AUDIO_IN, AUDIO_OUT};

    #[test]
    fn round_trip_preserves_samples() {
        let codec = Pcm16Codec::new(AUDIO_IN);
        let samples: Vec<i16> = (0..codec.samples_per_frame())
            .map(|i| (i as i16).wrapping_mul(37))
            .collect();

        let frame = codec.encode(&samples).unwrap();
        assert_eq!(frame.len(), AUDIO_IN.frame_bytes());

        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn round_trip_preserves_frame_count_and_order() {
        // N frames in -> N ordered sample segments out
        let codec = Pcm16Codec::new(AUDIO_OUT);
        let n = codec.samples_per_frame();

        let frames: Vec<Vec<u8>> = (0..5i16)
            .map(|tag| codec.encode(&vec![tag; n]).unwrap())
            .collect();

        let decoded: Vec<Vec<i16>> = frames.iter().map(|f| codec.decode(f).unwrap()).collect();
        assert_eq!(decoded.len(), 5);
        for (tag, segment) in decoded.iter().enumerate() {
            assert!(segment.iter().all(|&s| s == tag as i16));
        }
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        let codec = Pcm16Codec::new(AUDIO_IN);
        assert!(codec.decode(&[]).is_err());
        assert!(codec.decode(&[1, 2, 3]).is_err());
        assert!(codec.decode(&vec![0u8; AUDIO_IN.frame_bytes() + 2]).is_err());
    }

    #[test]
    fn encode_rejects_wrong_length() {
        let codec = Pcm16Codec::new(AUDIO_IN);
        assert!(codec.encode(&[0i16; 10]).is_err());
    }

    #[test]
    fn short_final_frame_decodes() {
        let codec = Pcm16Codec::new(AUDIO_IN);
        let decoded = codec.decode(&[0, 0, 1, 0]).unwrap();
        assert_eq!(decoded, vec![0, 1]);
    }
}
