//! # Speech Collaborators
//!
//! The three external services a call talks to, behind async traits so the
//! call pipeline never depends on a particular provider.
//!
//! ## Interfaces:
//! - **Transcriber**: segment PCM16 → text
//! - **Responder**: caller text → reply text (and whether the call is done)
//! - **Synthesizer**: reply text → compressed audio container
//!
//! Every failure is a [`SpeechError`] and is non-fatal to the session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::SpeechConfig;

pub mod elevenlabs;
pub mod responder;
pub mod whisper;

pub use elevenlabs::ElevenLabsSynthesizer;
pub use responder::{EchoResponder, WebhookResponder};
pub use whisper::WhisperTranscriber;

#[derive(Debug)]
pub enum SpeechError {
    /// Adapter is missing credentials or an endpoint
    NotConfigured(String),
    /// Provider answered with a non-success status
    Provider { status: u16, message: String },
    /// Request never got a usable answer
    Network(String),
    /// Provider answered with something we couldn't use
    InvalidResponse(String),
}

impl fmt::Display for SpeechError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeechError::NotConfigured(msg) => write!(f, "Not configured: {}", msg),
            SpeechError::Provider { status, message } => {
                write!(f, "Provider error ({}): {}", status, message)
            }
            SpeechError::Network(msg) => write!(f, "Network error: {}", msg),
            SpeechError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
        }
    }
}

impl std::error::Error for SpeechError {}

impl From<reqwest::Error> for SpeechError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SpeechError::InvalidResponse(err.to_string())
        } else {
            SpeechError::Network(err.to_string())
        }
    }
}

pub type SpeechResult<T> = Result<T, SpeechError>;

/// Who is on the line, passed to the responder with every utterance.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    pub call_sid: String,
    pub stream_sid: String,
    pub caller: Option<String>,
    pub called: Option<String>,
}

/// Reply to one caller utterance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Reply {
    #[serde(alias = "response")]
    pub text: String,
    /// The conversation is over once this reply has been spoken
    #[serde(rename = "isComplete", alias = "is_complete", default)]
    pub is_complete: bool,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> SpeechResult<String>;
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, call: &CallContext, text: &str) -> SpeechResult<Reply>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Returns a compressed audio container (MP3 for the bundled adapter).
    async fn synthesize(&self, text: &str) -> SpeechResult<Vec<u8>>;

    /// MIME type of what `synthesize` returns.
    fn content_type(&self) -> &str {
        "audio/mpeg"
    }
}

/// The collaborator handles shared by every call.
#[derive(Clone)]
pub struct SpeechServices {
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl SpeechServices {
    /// Wire the HTTP adapters from configuration.
    ///
    /// Missing API keys don't fail startup: the adapter reports
    /// `NotConfigured` on use and the call carries on without it.
    pub fn from_config(config: &SpeechConfig) -> SpeechResult<Self> {
        let client = http_client(config.request_timeout())?;

        let transcriber = WhisperTranscriber::new(
            client.clone(),
            &config.transcription_url,
            &config.openai_api_key,
            &config.transcription_model,
        );

        let responder: Arc<dyn Responder> = if config.responder_url.is_empty() {
            Arc::new(EchoResponder)
        } else {
            Arc::new(WebhookResponder::new(client.clone(), &config.responder_url))
        };

        let synthesizer = ElevenLabsSynthesizer::new(
            client,
            &config.elevenlabs_api_key,
            &config.voice_id,
            &config.synthesis_model,
        );

        Ok(Self {
            transcriber: Arc::new(transcriber),
            responder,
            synthesizer: Arc::new(synthesizer),
        })
    }
}

impl fmt::Debug for SpeechServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeechServices").finish_non_exhaustive()
    }
}

/// Build a shared HTTP client with the configured request timeout.
pub fn http_client(timeout: std::time::Duration) -> SpeechResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SpeechError::NotConfigured(format!("Failed to build HTTP client: {}", e)))
}

/// Pull a readable message out of a failed provider response.
pub(crate) async fn provider_error(response: reqwest::Response) -> SpeechError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    SpeechError::Provider { status, message }
}
