//! # Container Transcoding
//!
//! Turns synthesized speech (a compressed audio container, MP3 from the usual
//! synthesis providers) into the telephony wire format.
//!
//! ## Pipeline:
//! 1. **Decode**: probe and decode the container with symphonia
//! 2. **Downmix**: average interleaved channels into one
//! 3. **Resample**: convert to the telephony rate with rubato
//! 4. **Quantize**: clamp to 16-bit PCM
//! 5. **Compand**: PCM16 → μ-law
//!
//! Every failure here is a `StreamError::Transcode` and only affects the one
//! synthesis result being converted.

use rubato::{FftFixedIn, Resampler};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use crate::audio::mulaw;
use crate::error::StreamError;

const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Decoded, interleaved audio straight out of the container.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

/// Converts synthesized audio containers to telephony μ-law at a fixed rate.
#[derive(Debug, Clone)]
pub struct AudioTranscoder {
    target_rate: u32,
}

impl AudioTranscoder {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Full container → μ-law conversion.
    pub fn container_to_mulaw(&self, container: &[u8]) -> Result<Vec<u8>, StreamError> {
        let pcm = self.container_to_pcm16(container)?;
        let encoded = mulaw::samples_to_mulaw(&pcm);

        debug!(
            container_bytes = container.len(),
            mulaw_bytes = encoded.len(),
            sample_rate = self.target_rate,
            "Transcoded synthesized audio"
        );

        Ok(encoded)
    }

    /// Container → mono PCM16 samples at the target rate.
    pub fn container_to_pcm16(&self, container: &[u8]) -> Result<Vec<i16>, StreamError> {
        let decoded = decode_container(container)?;
        let mono = downmix(&decoded.samples, decoded.channels);
        let resampled = resample(&mono, decoded.sample_rate, self.target_rate)?;
        Ok(to_pcm16(&resampled))
    }
}

/// Decode every packet of the first audio track into interleaved f32 samples.
pub fn decode_container(container: &[u8]) -> Result<DecodedAudio, StreamError> {
    if container.is_empty() {
        return Err(StreamError::Transcode("Audio container is empty".to_string()));
    }

    let source = Cursor::new(container.to_vec());
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| StreamError::Transcode(format!("Unrecognized audio container: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| StreamError::Transcode("No decodable audio track".to_string()))?;

    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| StreamError::Transcode("Audio track has no sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| StreamError::Transcode(format!("Unsupported codec: {}", e)))?;

    let mut samples = Vec::new();
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            // End of stream
            Err(SymphoniaError::IoError(_)) => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => {
                return Err(StreamError::Transcode(format!("Failed to read packet: {}", err)));
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                channels = spec.channels.count();
                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
            }
            // A corrupt frame inside an otherwise valid stream is skipped
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(SymphoniaError::IoError(_)) => continue,
            Err(err) => {
                return Err(StreamError::Transcode(format!("Decode failed: {}", err)));
            }
        }
    }

    if channels == 0 || samples.is_empty() {
        return Err(StreamError::Transcode(
            "Audio container produced no samples".to_string(),
        ));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Average interleaved channels into a single mono channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample mono audio between rates with an FFT resampler.
///
/// The resampler's output delay is skipped and its tail flushed, so the
/// result is aligned with the input and holds exactly `input * to / from`
/// samples.
pub fn resample(mono: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, StreamError> {
    if from_rate == to_rate || mono.is_empty() {
        return Ok(mono.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        return Err(StreamError::Transcode(format!(
            "Invalid resampling rates {} -> {}",
            from_rate, to_rate
        )));
    }

    let mut resampler = FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        RESAMPLER_CHUNK_SIZE,
        1,
        1,
    )
    .map_err(|e| StreamError::Transcode(format!("Failed to create resampler: {}", e)))?;

    let expected = (mono.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let delay = resampler.output_delay();
    let resample_err = |e: rubato::ResampleError| StreamError::Transcode(format!("Resampling failed: {}", e));

    let mut output = Vec::with_capacity(delay + expected + resampler.output_frames_max());
    let mut chunks = mono.chunks_exact(RESAMPLER_CHUNK_SIZE);

    for chunk in &mut chunks {
        let resampled = resampler.process(&[chunk], None).map_err(resample_err)?;
        output.extend_from_slice(&resampled[0]);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let resampled = resampler
            .process_partial(Some(&[remainder]), None)
            .map_err(resample_err)?;
        output.extend_from_slice(&resampled[0]);
    }

    // Push zeros until the delayed tail of the real signal has come out
    while output.len() < delay + expected {
        let resampled = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(resample_err)?;
        if resampled[0].is_empty() {
            break;
        }
        output.extend_from_slice(&resampled[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

/// Scale normalized float samples to clamped 16-bit PCM.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}
