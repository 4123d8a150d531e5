//! # Outbound Pacing
//!
//! Re-emits synthesized speech as telephony frames at real-time speed.
//!
//! ## Chunking:
//! - Payload split into `chunk_size` slices, the last one shorter (no padding)
//! - `n` chunks are separated by `n - 1` delays
//! - Playback stops quietly once the session is no longer live

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audio::transcoder::AudioTranscoder;
use crate::error::StreamError;
use crate::stream::session::FrameEmitter;

/// Outcome of one playback run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackReport {
    pub chunks_sent: usize,
    pub bytes_sent: usize,
    /// True when the session went away before every chunk was sent
    pub interrupted: bool,
}

#[derive(Debug, Clone)]
pub struct OutboundPacer {
    chunk_size: usize,
    delay: Duration,
    transcoder: Arc<AudioTranscoder>,
}

impl OutboundPacer {
    pub fn new(chunk_size: usize, delay: Duration, transcoder: Arc<AudioTranscoder>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            delay,
            transcoder,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Transcode a synthesized container and play it.
    ///
    /// Decoding and resampling are CPU bound, so they run on the blocking pool.
    pub async fn speak(&self, container: Vec<u8>, emitter: &FrameEmitter) -> Result<PlaybackReport, StreamError> {
        let transcoder = self.transcoder.clone();
        let telephony = tokio::task::spawn_blocking(move || transcoder.container_to_mulaw(&container))
            .await
            .map_err(|e| StreamError::Transcode(format!("Transcode task failed: {}", e)))??;

        Ok(self.play(&telephony, emitter).await)
    }

    /// Emit already-encoded telephony audio in paced chunks.
    pub async fn play(&self, telephony: &[u8], emitter: &FrameEmitter) -> PlaybackReport {
        let mut report = PlaybackReport::default();
        let total_chunks = telephony.len().div_ceil(self.chunk_size);

        for (index, chunk) in telephony.chunks(self.chunk_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.delay).await;
            }

            if !emitter.is_live() {
                report.interrupted = true;
                break;
            }

            if let Err(e) = emitter.emit(chunk).await {
                warn!(
                    call_id = emitter.call_id(),
                    stream_sid = emitter.stream_sid(),
                    error = %e,
                    "Stopping playback"
                );
                report.interrupted = true;
                break;
            }

            report.chunks_sent += 1;
            report.bytes_sent += chunk.len();
        }

        if report.interrupted {
            info!(
                call_id = emitter.call_id(),
                sent = report.chunks_sent,
                total = total_chunks,
                "Playback interrupted"
            );
        } else {
            debug!(
                call_id = emitter.call_id(),
                chunks = report.chunks_sent,
                bytes = report.bytes_sent,
                "Playback complete"
            );
        }

        report
    }
}
