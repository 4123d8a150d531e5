//! # Configuration Management
//!
//! This module handles loading and managing the bridge configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, OPENAI_API_KEY, ELEVENLABS_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_AUDIO__SEGMENT_DURATION_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Nested keys:
//! Field names contain underscores, so nesting uses a double underscore:
//! `APP_SPEECH__VOICE_ID` becomes `speech.voice_id`.

use crate::audio::segmenter::InboundEncoding;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// G.711 telephony sample rate. Frames at any other rate are unplayable.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// Audio keys that describe the wire format. Set at startup only.
const FIXED_AUDIO_KEYS: [&str; 4] = [
    "sample_rate",
    "inbound_encoding",
    "outbound_chunk_bytes",
    "outbound_chunk_delay_ms",
];

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub speech: SpeechConfig,
    pub performance: PerformanceConfig,
    pub cache: CacheConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (what the telephony provider needs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Telephony audio parameters.
///
/// ## Fields:
/// - `sample_rate`: Wire sample rate in Hz, always 8000 for G.711 telephony
/// - `inbound_encoding`: Encoding of caller audio (`mulaw`, or `linear16` for providers that send PCM)
/// - `segment_duration_ms`: Inbound audio is sealed into segments of at least this length
/// - `outbound_chunk_bytes`: Size of each outbound media frame payload
/// - `outbound_chunk_delay_ms`: Delay between successive outbound frames
/// - `segment_queue_capacity`: Sealed segments waiting for transcription (drop-newest when full)
/// - `outbound_queue_capacity`: Serialized frames waiting for the socket (backpressure when full)
///
/// ## Latency trade-off:
/// Shorter segments reach the transcriber sooner but give it less context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub inbound_encoding: InboundEncoding,
    pub segment_duration_ms: u64,
    pub outbound_chunk_bytes: usize,
    pub outbound_chunk_delay_ms: u64,
    pub segment_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
}

impl AudioConfig {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    pub fn outbound_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.outbound_chunk_delay_ms)
    }
}

/// Speech collaborators: transcription, response generation and synthesis.
///
/// Empty API keys leave the matching adapter unconfigured. An empty
/// `responder_url` selects the built-in echo responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub openai_api_key: String,
    pub transcription_url: String,
    pub transcription_model: String,
    pub elevenlabs_api_key: String,
    pub voice_id: String,
    pub synthesis_model: String,
    pub responder_url: String,
    /// Spoken once when the stream starts (empty disables it)
    pub greeting: String,
    /// Spoken when synthesis of a reply fails
    pub fallback_message: String,
    pub request_timeout_secs: u64,
}

impl SpeechConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Calls beyond this limit are refused at the WebSocket upgrade
    pub max_concurrent_sessions: usize,
}

/// Synthesized audio cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: TELEPHONY_SAMPLE_RATE,
                inbound_encoding: InboundEncoding::MuLaw,
                segment_duration_ms: 1000,     // 1 s utterance windows
                outbound_chunk_bytes: 1600,    // 200 ms of μ-law per frame
                outbound_chunk_delay_ms: 20,
                segment_queue_capacity: 32,
                outbound_queue_capacity: 64,
            },
            speech: SpeechConfig {
                openai_api_key: String::new(),
                transcription_url: "https://api.openai.com/v1/audio/transcriptions".to_string(),
                transcription_model: "whisper-1".to_string(),
                elevenlabs_api_key: String::new(),
                voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
                synthesis_model: "eleven_turbo_v2".to_string(),
                responder_url: String::new(),
                greeting: "Hello, how can I help you today?".to_string(),
                fallback_message: "Sorry, I didn't catch that. Could you say it again?".to_string(),
                request_timeout_secs: 30,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
            cache: CacheConfig {
                max_entries: 100,
                ttl_secs: 3600,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle the platform variables deployment tooling sets directly
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_AUDIO__SEGMENT_DURATION_MS=1500`: Longer utterance windows
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `OPENAI_API_KEY=sk-...`: Same name the provider SDKs read
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("speech.openai_api_key", key)?;
        }

        if let Ok(key) = env::var("ELEVENLABS_API_KEY") {
            settings = settings.set_override("speech.elevenlabs_api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Zero values would either divide by zero in duration accounting,
    /// produce empty frames, or create channels tokio refuses to build.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate != TELEPHONY_SAMPLE_RATE {
            return Err(anyhow::anyhow!(
                "Audio sample rate must be {} Hz, got {}",
                TELEPHONY_SAMPLE_RATE,
                self.audio.sample_rate
            ));
        }

        if self.audio.segment_duration_ms == 0 {
            return Err(anyhow::anyhow!("Segment duration must be greater than 0"));
        }

        if self.audio.outbound_chunk_bytes == 0 {
            return Err(anyhow::anyhow!("Outbound chunk size must be greater than 0"));
        }

        if self.audio.segment_queue_capacity == 0 || self.audio.outbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Queue capacities must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.cache.max_entries == 0 {
            return Err(anyhow::anyhow!("Audio cache must hold at least one entry"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the provided fields change. For example `{"audio": {"segment_duration_ms": 1500}}`
    /// changes the segment window for calls that start afterwards.
    ///
    /// ## What is not updatable:
    /// API keys and collaborator URLs are wired into the adapters at startup;
    /// cache bounds are fixed when the cache is built. The wire format keys in
    /// `FIXED_AUDIO_KEYS` are rejected outright.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(key) = FIXED_AUDIO_KEYS.iter().find(|key| audio.get(**key).is_some()) {
                return Err(anyhow::anyhow!(
                    "audio.{} is part of the telephony wire format and cannot be changed at runtime",
                    key
                ));
            }
            if let Some(ms) = audio.get("segment_duration_ms").and_then(|v| v.as_u64()) {
                self.audio.segment_duration_ms = ms;
            }
            if let Some(cap) = audio.get("segment_queue_capacity").and_then(|v| v.as_u64()) {
                self.audio.segment_queue_capacity = usize::try_from(cap)
                    .map_err(|_| anyhow::anyhow!("Segment queue capacity {} is out of range", cap))?;
            }
            if let Some(cap) = audio.get("outbound_queue_capacity").and_then(|v| v.as_u64()) {
                self.audio.outbound_queue_capacity = usize::try_from(cap)
                    .map_err(|_| anyhow::anyhow!("Outbound queue capacity {} is out of range", cap))?;
            }
        }

        if let Some(speech) = partial_config.get("speech") {
            if let Some(greeting) = speech.get("greeting").and_then(|v| v.as_str()) {
                self.speech.greeting = greeting.to_string();
            }
            if let Some(fallback) = speech.get("fallback_message").and_then(|v| v.as_str()) {
                self.speech.fallback_message = fallback.to_string();
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = usize::try_from(sessions)
                    .map_err(|_| anyhow::anyhow!("Max concurrent sessions {} is out of range", sessions))?;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.sample_rate, 8000);
        assert_eq!(config.audio.outbound_chunk_bytes, 1600);
        assert_eq!(config.audio.outbound_chunk_delay(), Duration::from_millis(20));
        assert_eq!(config.audio.segment_duration(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.outbound_chunk_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.segment_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.sample_rate = 16000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "audio": {"segment_duration_ms": 1500}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.audio.segment_duration_ms, 1500);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"audio": {"sample_rate": 0}}"#).is_err());

        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
    }

    #[test]
    fn test_wire_format_is_not_runtime_updatable() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"sample_rate": 16000, "outbound_chunk_bytes": 7}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.audio.sample_rate, 8000);
        assert_eq!(config.audio.outbound_chunk_bytes, 1600);

        for json in [
            r#"{"audio": {"outbound_chunk_delay_ms": 5}}"#,
            r#"{"audio": {"inbound_encoding": "linear16"}}"#,
        ] {
            assert!(config.update_from_json(json).is_err(), "{} was accepted", json);
        }
        assert_eq!(config.audio.inbound_encoding, InboundEncoding::MuLaw);
    }

    #[test]
    fn test_inbound_encoding_deserializes_lowercase() {
        let audio: AudioConfig = serde_json::from_value(serde_json::json!({
            "sample_rate": 8000,
            "inbound_encoding": "linear16",
            "segment_duration_ms": 1000,
            "outbound_chunk_bytes": 1600,
            "outbound_chunk_delay_ms": 20,
            "segment_queue_capacity": 32,
            "outbound_queue_capacity": 64
        }))
        .unwrap();
        assert_eq!(audio.inbound_encoding, InboundEncoding::Linear16);
    }
}
