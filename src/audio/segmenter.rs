//! # Inbound Segmentation
//!
//! Buffers the continuous inbound telephony stream into time-bounded
//! segments that are handed to the transcriber one utterance window at a time.
//!
//! ## Accounting:
//! Duration is measured in *encoded* (wire) bytes:
//! `duration = encoded_bytes / (sample_rate × bytes_per_sample)`.
//! The segment holds the decoded PCM16, which is twice as large for μ-law.
//!
//! ## Invariant:
//! `sealed_bytes + remainder_len == total_received` at every point. A chunk
//! that crosses the threshold stays whole in the segment it completes, so no
//! bytes are split or dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::mulaw;

/// Encoding of the inbound wire audio, `"mulaw"` or `"linear16"` in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundEncoding {
    /// G.711 μ-law, one byte per sample
    MuLaw,
    /// Linear PCM16 little-endian, two bytes per sample
    Linear16,
}

impl InboundEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            InboundEncoding::MuLaw => 1,
            InboundEncoding::Linear16 => 2,
        }
    }

    /// Append the decoded PCM16-LE form of an encoded chunk.
    fn decode_into(&self, chunk: &[u8], out: &mut Vec<u8>) {
        match self {
            InboundEncoding::MuLaw => mulaw::append_mulaw_as_pcm16(chunk, out),
            InboundEncoding::Linear16 => out.extend_from_slice(chunk),
        }
    }
}

/// A sealed window of decoded inbound audio.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    /// Position of this segment within the call, starting at 0
    pub sequence: u64,
    /// Decoded PCM16-LE samples
    pub pcm: Vec<u8>,
    /// Wire bytes that produced `pcm`
    pub encoded_len: usize,
    /// Arrival time of the first chunk in the segment
    pub started_at: DateTime<Utc>,
    pub sample_rate: u32,
    pub bytes_per_sample: usize,
}

impl AudioSegment {
    pub fn duration(&self) -> Duration {
        let bytes_per_second = self.sample_rate as u64 * self.bytes_per_sample as u64;
        if bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.encoded_len as u64 * 1_000_000 / bytes_per_second)
    }
}

/// Accumulates inbound audio and seals segments at a duration threshold.
#[derive(Debug)]
pub struct InboundSegmenter {
    encoding: InboundEncoding,
    sample_rate: u32,
    threshold_bytes: usize,

    pcm: Vec<u8>,
    encoded_len: usize,
    started_at: Option<DateTime<Utc>>,

    next_sequence: u64,
    total_received: u64,
    sealed_bytes: u64,
}

impl InboundSegmenter {
    /// ## Threshold:
    /// `threshold × sample_rate × bytes_per_sample`, rounded up to whole
    /// bytes. With the defaults (1 s, 8 kHz, μ-law) that's 8000 bytes.
    pub fn new(encoding: InboundEncoding, sample_rate: u32, threshold: Duration) -> Self {
        let bytes_per_second = sample_rate as u128 * encoding.bytes_per_sample() as u128;
        let threshold_bytes = (threshold.as_micros() * bytes_per_second).div_ceil(1_000_000);

        Self {
            encoding,
            sample_rate,
            threshold_bytes: (threshold_bytes as usize).max(1),
            pcm: Vec::new(),
            encoded_len: 0,
            started_at: None,
            next_sequence: 0,
            total_received: 0,
            sealed_bytes: 0,
        }
    }

    /// Add one inbound chunk. Returns the segment it completed, if any.
    pub fn push(&mut self, chunk: &[u8]) -> Option<AudioSegment> {
        if chunk.is_empty() {
            return None;
        }

        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }

        self.encoding.decode_into(chunk, &mut self.pcm);
        self.encoded_len += chunk.len();
        self.total_received += chunk.len() as u64;

        if self.encoded_len >= self.threshold_bytes {
            Some(self.seal())
        } else {
            None
        }
    }

    /// Seal whatever is buffered. Flushing an empty buffer yields nothing,
    /// so calling this twice only ever produces one segment.
    pub fn flush(&mut self) -> Option<AudioSegment> {
        if self.encoded_len == 0 {
            return None;
        }
        Some(self.seal())
    }

    fn seal(&mut self) -> AudioSegment {
        let segment = AudioSegment {
            sequence: self.next_sequence,
            pcm: std::mem::take(&mut self.pcm),
            encoded_len: self.encoded_len,
            started_at: self.started_at.take().unwrap_or_else(Utc::now),
            sample_rate: self.sample_rate,
            bytes_per_sample: self.encoding.bytes_per_sample(),
        };

        self.next_sequence += 1;
        self.sealed_bytes += self.encoded_len as u64;
        self.encoded_len = 0;

        segment
    }

    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    /// Encoded bytes handed out in sealed segments so far.
    pub fn sealed_bytes(&self) -> u64 {
        self.sealed_bytes
    }

    /// Encoded bytes buffered in the unsealed segment.
    pub fn remainder_len(&self) -> usize {
        self.encoded_len
    }

    pub fn segments_sealed(&self) -> u64 {
        self.next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> InboundSegmenter {
        InboundSegmenter::new(InboundEncoding::MuLaw, 8000, Duration::from_secs(1))
    }

    #[test]
    fn test_threshold_uses_bytes_per_sample() {
        assert_eq!(segmenter().threshold_bytes(), 8000);

        let linear = InboundSegmenter::new(InboundEncoding::Linear16, 8000, Duration::from_secs(1));
        assert_eq!(linear.threshold_bytes(), 16000);

        let half = InboundSegmenter::new(InboundEncoding::MuLaw, 8000, Duration::from_millis(500));
        assert_eq!(half.threshold_bytes(), 4000);
    }

    #[test]
    fn test_eighteen_thousand_four_hundred_bytes() {
        let mut seg = segmenter();
        let chunk = [0xFFu8; 160];
        let mut sealed = Vec::new();

        // 115 telephony frames of 20 ms
        for _ in 0..115 {
            if let Some(segment) = seg.push(&chunk) {
                sealed.push(segment);
            }
        }

        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0].encoded_len, 8000);
        assert_eq!(sealed[1].encoded_len, 8000);
        assert_eq!(seg.remainder_len(), 2400);

        let last = seg.flush().unwrap();
        assert_eq!(last.encoded_len, 2400);
        assert_eq!(last.sequence, 2);
        sealed.push(last);

        let total: usize = sealed.iter().map(|s| s.encoded_len).sum();
        assert_eq!(total, 18_400);
        assert_eq!(seg.total_received(), 18_400);
    }

    #[test]
    fn test_segment_holds_decoded_pcm() {
        let mut seg = segmenter();
        let segment = seg.push(&[0x80u8; 8000]).unwrap();

        assert_eq!(segment.pcm.len(), 16000);
        assert_eq!(i16::from_le_bytes([segment.pcm[0], segment.pcm[1]]), 32124);
        assert_eq!(segment.duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_crossing_chunk_stays_whole() {
        let mut seg = segmenter();
        assert!(seg.push(&[0u8; 7900]).is_none());

        let segment = seg.push(&[0u8; 300]).unwrap();
        assert_eq!(segment.encoded_len, 8200);
        assert_eq!(seg.remainder_len(), 0);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut seg = segmenter();
        assert!(seg.flush().is_none());

        seg.push(&[1u8; 10]);
        assert!(seg.flush().is_some());
        assert!(seg.flush().is_none());
        assert_eq!(seg.segments_sealed(), 1);
    }

    #[test]
    fn test_byte_accounting_holds_for_irregular_chunks() {
        let mut seg = segmenter();
        let sizes = [1usize, 159, 160, 3000, 4999, 7, 8001, 0, 42, 12345];

        for size in sizes {
            seg.push(&vec![0x55u8; size]);
            assert_eq!(
                seg.sealed_bytes() + seg.remainder_len() as u64,
                seg.total_received()
            );
        }
    }
}
