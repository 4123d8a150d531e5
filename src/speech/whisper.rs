//! OpenAI-compatible Whisper transcription over HTTP.

use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::Deserialize;
use std::io::Cursor;
use tracing::debug;

use super::{provider_error, SpeechError, SpeechResult, Transcriber};

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

pub struct WhisperTranscriber {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl WhisperTranscriber {
    pub fn new(client: reqwest::Client, url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

/// Wrap raw PCM16-LE mono samples in a WAV container.
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> SpeechResult<Vec<u8>> {
    let mut samples = Vec::with_capacity(pcm.len() / 2);
    let mut reader = Cursor::new(pcm);
    while let Ok(sample) = reader.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let mut out = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut out)
        .map_err(|e| SpeechError::InvalidResponse(format!("Failed to build WAV: {}", e)))?;

    Ok(out.into_inner())
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> SpeechResult<String> {
        if self.api_key.is_empty() {
            return Err(SpeechError::NotConfigured("OpenAI API key not configured".to_string()));
        }

        let wav = pcm16_to_wav(pcm, sample_rate)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("segment.wav")
            .mime_str("audio/wav")
            .map_err(|e| SpeechError::InvalidResponse(format!("Failed to create form part: {}", e)))?;

        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(provider_error(response).await);
        }

        let body: TranscriptionResponse = response.json().await?;
        let text = body.text.trim().to_string();
        debug!(chars = text.len(), "Segment transcribed");

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_to_wav_round_trips() {
        let samples = [0i16, 1200, -1200, i16::MAX];
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let wav_bytes = pcm16_to_wav(&pcm, 8000).unwrap();
        assert_eq!(&wav_bytes[0..4], b"RIFF");

        let (header, data) = wav::read(&mut Cursor::new(wav_bytes)).unwrap();
        assert_eq!(header.sampling_rate, 8000);
        assert_eq!(header.channel_count, 1);
        assert_eq!(header.bits_per_sample, 16);
        assert_eq!(data.as_sixteen().unwrap(), &samples[..]);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let transcriber = WhisperTranscriber::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/v1/audio/transcriptions",
            "",
            "whisper-1",
        );
        let result = transcriber.transcribe(&[0u8; 320], 8000).await;
        assert!(matches!(result, Err(SpeechError::NotConfigured(_))));
    }
}
