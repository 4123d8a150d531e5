//! ElevenLabs text-to-speech.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{provider_error, SpeechError, SpeechResult, Synthesizer};

const API_BASE: &str = "https://api.elevenlabs.io/v1/text-to-speech";

pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
    model_id: String,
    base_url: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, voice_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            model_id: model_id.into(),
            base_url: API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.voice_id)
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> SpeechResult<Vec<u8>> {
        if self.api_key.is_empty() {
            return Err(SpeechError::NotConfigured("ElevenLabs API key not configured".to_string()));
        }

        info!(voice_id = %self.voice_id, chars = text.len(), "Synthesizing speech");

        let payload = json!({
            "text": text,
            "model_id": self.model_id,
            "voice_settings": {
                "stability": 0.5,
                "similarity_boost": 0.75
            }
        });

        let response = self
            .client
            .post(self.endpoint())
            .header("Accept", "audio/mpeg")
            .header("xi-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(provider_error(response).await);
        }

        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(SpeechError::InvalidResponse("Synthesis returned no audio".to_string()));
        }

        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_includes_voice() {
        let synth = ElevenLabsSynthesizer::new(reqwest::Client::new(), "key", "voice123", "eleven_turbo_v2");
        assert_eq!(synth.endpoint(), "https://api.elevenlabs.io/v1/text-to-speech/voice123");

        let synth = synth.with_base_url("http://localhost:9000/tts/");
        assert_eq!(synth.endpoint(), "http://localhost:9000/tts/voice123");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let synth = ElevenLabsSynthesizer::new(reqwest::Client::new(), "", "voice", "model");
        assert!(matches!(synth.synthesize("hi").await, Err(SpeechError::NotConfigured(_))));
        assert_eq!(synth.content_type(), "audio/mpeg");
    }
}
