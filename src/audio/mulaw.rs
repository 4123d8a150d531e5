//! # G.711 μ-law Companding
//!
//! Sample-accurate conversion between 16-bit linear PCM and 8-bit μ-law codes.
//! The telephony peer decodes with the fixed G.711 table, so the encoder must
//! match the standard law bit-for-bit.
//!
//! ## Code Layout:
//! - **bit 7**: sign (set for negative samples before inversion)
//! - **bits 6-4**: segment exponent (0-7)
//! - **bits 3-0**: mantissa within the segment
//! - **transmitted**: the one's complement of the above
//!
//! ## Bias:
//! G.711 adds 33 to the 14-bit magnitude. On the 16-bit scale used here that
//! is `33 << 2 = 0x84`, which is why the mantissa shift is `exponent + 3`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::StreamError;

/// Bias added to the magnitude before the segment search (16-bit scale).
pub const BIAS: i32 = 0x84;

/// Largest magnitude that still fits the top segment once biased.
pub const CLIP: i32 = 32635;

/// Upper bound (inclusive) of each of the 8 segments, biased magnitude.
const SEGMENT_ENDS: [i32; 8] = [0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF, 0x3FFF, 0x7FFF];

/// Encode one linear sample to a μ-law code.
pub fn encode_sample(sample: i16) -> u8 {
    let linear = sample as i32;
    let sign: u8 = if linear < 0 { 0x80 } else { 0x00 };
    let magnitude = linear.abs().min(CLIP) + BIAS;

    let exponent = SEGMENT_ENDS
        .iter()
        .position(|&end| magnitude <= end)
        .unwrap_or(7) as u8;
    let mantissa = ((magnitude >> (exponent as i32 + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// Decode one μ-law code back to a linear sample.
///
/// Returns the midpoint of the quantization interval the code stands for.
pub fn decode_sample(code: u8) -> i16 {
    let code = !code;
    let exponent = ((code & 0x70) >> 4) as i32;
    let mantissa = (code & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    let linear = if code & 0x80 != 0 { -magnitude } else { magnitude };

    linear.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Width of the quantization interval a code belongs to.
///
/// Used to bound round-trip error: `|decode(encode(s)) - s| <= step(encode(s))`.
pub fn quantization_step(code: u8) -> i32 {
    let exponent = ((!code & 0x70) >> 4) as i32;
    1 << (exponent + 3)
}

/// Convert PCM16 little-endian bytes to μ-law bytes (one byte per sample).
pub fn pcm16_to_mulaw(pcm: &[u8]) -> Result<Vec<u8>, StreamError> {
    if pcm.len() % 2 != 0 {
        return Err(StreamError::Transcode(format!(
            "PCM16 buffer has odd length {}",
            pcm.len()
        )));
    }

    let mut cursor = Cursor::new(pcm);
    let mut encoded = Vec::with_capacity(pcm.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        encoded.push(encode_sample(sample));
    }

    Ok(encoded)
}

/// Encode linear samples straight to μ-law bytes.
pub fn samples_to_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

/// Convert μ-law bytes to PCM16 little-endian bytes (two bytes per sample).
pub fn mulaw_to_pcm16(mulaw: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(mulaw.len() * 2);
    append_mulaw_as_pcm16(mulaw, &mut pcm);
    pcm
}

/// Decode μ-law bytes and append the PCM16-LE result to an existing buffer.
pub fn append_mulaw_as_pcm16(mulaw: &[u8], out: &mut Vec<u8>) {
    out.reserve(mulaw.len() * 2);
    for &code in mulaw {
        // Writing into a Vec cannot fail
        let _ = out.write_i16::<LittleEndian>(decode_sample(code));
    }
}
