//! # Call Pipeline
//!
//! The per-call worker pair that turns caller audio into spoken replies.
//!
//! ## Tasks:
//! - **listener**: sealed segment → transcribe → respond → reply queue
//! - **speaker**: greeting, then reply → synthesize → cache → pace out
//!
//! The speaker finishes one playback before taking the next reply, so replies
//! never interleave on the line.
//!
//! ## Shutdown:
//! - The session dropping its segment sender ends the listener once the
//!   queue is drained, which in turn closes the reply queue.
//! - A reply marked complete ends the listener early.
//! - `StreamSession::close()` aborts both tasks through their abort handles,
//!   so nothing is transcribed or answered after the caller is gone.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::audio::pacer::OutboundPacer;
use crate::audio::segmenter::AudioSegment;
use crate::audio::transcoder::AudioTranscoder;
use crate::error::StreamError;
use crate::speech::{CallContext, Reply};
use crate::state::AppState;
use crate::stream::session::{FrameEmitter, StreamStart};

const REPLY_QUEUE_CAPACITY: usize = 8;

/// Join handles for the two tasks of one call.
pub struct PipelineHandle {
    listener: JoinHandle<()>,
    speaker: JoinHandle<()>,
}

impl PipelineHandle {
    /// Handle used by the session to cancel in-flight playback.
    pub fn speaker_abort_handle(&self) -> AbortHandle {
        self.speaker.abort_handle()
    }

    /// Handle used by the session to cancel a pending transcription.
    pub fn listener_abort_handle(&self) -> AbortHandle {
        self.listener.abort_handle()
    }

    /// Wait for both tasks. A cancelled speaker counts as finished.
    pub async fn join(self) {
        let _ = self.listener.await;
        let _ = self.speaker.await;
    }
}

/// Spawns the listener and speaker for a call that just started streaming.
pub struct CallPipeline {
    state: AppState,
}

impl CallPipeline {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn spawn(&self, call_id: &str, start: StreamStart) -> PipelineHandle {
        let config = self.state.get_config();

        let call = CallContext {
            call_sid: start.metadata.call_sid.clone().unwrap_or_else(|| call_id.to_string()),
            stream_sid: start.stream_sid.clone(),
            caller: start.metadata.caller.clone(),
            called: start.metadata.called.clone(),
        };

        let pacer = OutboundPacer::new(
            config.audio.outbound_chunk_bytes,
            config.audio.outbound_chunk_delay(),
            Arc::new(AudioTranscoder::new(config.audio.sample_rate)),
        );

        let greeting = Some(config.speech.greeting.trim().to_string()).filter(|g| !g.is_empty());

        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);

        let listener = Listener {
            state: self.state.clone(),
            call: call.clone(),
        };
        let speaker = Speaker {
            state: self.state.clone(),
            call,
            pacer,
            emitter: start.emitter,
            fallback_message: config.speech.fallback_message,
        };

        PipelineHandle {
            listener: tokio::spawn(listener.run(start.segments, reply_tx)),
            speaker: tokio::spawn(speaker.run(greeting, reply_rx)),
        }
    }
}

struct Listener {
    state: AppState,
    call: CallContext,
}

impl Listener {
    async fn run(self, mut segments: mpsc::Receiver<AudioSegment>, replies: mpsc::Sender<Reply>) {
        while let Some(segment) = segments.recv().await {
            let text = match self.transcribe(&segment).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(call_id = %self.call.call_sid, sequence = segment.sequence, error = %e, "Discarding segment");
                    continue;
                }
            };

            if text.is_empty() {
                debug!(call_id = %self.call.call_sid, sequence = segment.sequence, "No speech in segment");
                continue;
            }

            self.state.increment_segments_transcribed();
            info!(call_id = %self.call.call_sid, sequence = segment.sequence, text = %text, "Caller said");

            let reply = match self.state.speech.responder.respond(&self.call, &text).await {
                Ok(reply) => reply,
                Err(e) => {
                    let e = StreamError::SegmentFlush(format!("Responder failed: {}", e));
                    warn!(call_id = %self.call.call_sid, error = %e, "Discarding segment");
                    continue;
                }
            };

            let complete = reply.is_complete;
            if replies.send(reply).await.is_err() {
                break;
            }
            if complete {
                info!(call_id = %self.call.call_sid, "Conversation complete");
                break;
            }
        }

        debug!(call_id = %self.call.call_sid, "Listener finished");
    }

    async fn transcribe(&self, segment: &AudioSegment) -> Result<String, StreamError> {
        self.state
            .speech
            .transcriber
            .transcribe(&segment.pcm, segment.sample_rate)
            .await
            .map(|text| text.trim().to_string())
            .map_err(|e| StreamError::SegmentFlush(format!("Transcription failed: {}", e)))
    }
}

struct Speaker {
    state: AppState,
    call: CallContext,
    pacer: OutboundPacer,
    emitter: FrameEmitter,
    fallback_message: String,
}

impl Speaker {
    async fn run(self, greeting: Option<String>, mut replies: mpsc::Receiver<Reply>) {
        if let Some(greeting) = greeting {
            self.say(&greeting).await;
        }

        while let Some(reply) = replies.recv().await {
            if !self.emitter.is_live() {
                debug!(call_id = %self.call.call_sid, "Session gone, discarding reply");
                break;
            }
            if reply.text.trim().is_empty() {
                continue;
            }
            self.say(&reply.text).await;
        }

        debug!(call_id = %self.call.call_sid, "Speaker finished");
    }

    /// Speak `text`, falling back to the configured message once.
    async fn say(&self, text: &str) {
        match self.speak(text).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {}
            Err(e) => {
                warn!(call_id = %self.call.call_sid, error = %e, "Reply could not be spoken");
                if text != self.fallback_message && !self.fallback_message.is_empty() {
                    if let Err(e) = self.speak(&self.fallback_message).await {
                        warn!(call_id = %self.call.call_sid, error = %e, "Fallback could not be spoken");
                    }
                }
            }
        }
    }

    async fn speak(&self, text: &str) -> Result<(), StreamError> {
        let synthesizer = &self.state.speech.synthesizer;
        let audio = synthesizer
            .synthesize(text)
            .await
            .map_err(|e| StreamError::Transcode(format!("Synthesis failed: {}", e)))?;

        let audio_id = self
            .state
            .audio_cache
            .insert(&self.call.call_sid, audio.clone(), synthesizer.content_type())
            .await;

        let report = self.pacer.speak(audio, &self.emitter).await?;
        if report.interrupted {
            return Err(StreamError::Channel("Playback interrupted".to_string()));
        }

        self.state.increment_responses_spoken();
        info!(
            call_id = %self.call.call_sid,
            stream_sid = %self.call.stream_sid,
            audio_id = %audio_id,
            chunks = report.chunks_sent,
            bytes = report.bytes_sent,
            "Reply spoken"
        );
        Ok(())
    }
}
