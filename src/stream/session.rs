//! # Stream Session
//!
//! The protocol state machine for one call's media stream.
//!
//! ## States:
//! ```text
//! Idle --connected--> Connected --start--> Streaming --media*--> Streaming --stop--> Stopped
//! ```
//! `start` is also accepted straight from `Idle`. `Stopped` is terminal.
//!
//! ## Ownership:
//! The session is owned by the socket actor and is the only holder of the
//! segment queue sender. Concurrent tasks get read-only views: the segment
//! receiver and a [`FrameEmitter`] for outbound audio.
//!
//! ## Teardown:
//! `stop` and `close()` both flush the unsealed remainder, but the flush runs
//! once: whichever comes first seals it, the second finds the buffer empty.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::audio::segmenter::{AudioSegment, InboundEncoding, InboundSegmenter};
use crate::error::StreamError;
use crate::stream::frame::{Frame, OutboundMedia, StartMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connected,
    Streaming,
    Stopped,
}

/// Per-call settings, taken from `AudioConfig` when the socket opens.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub encoding: InboundEncoding,
    pub sample_rate: u32,
    pub segment_duration: Duration,
    pub segment_queue_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            encoding: InboundEncoding::MuLaw,
            sample_rate: 8000,
            segment_duration: Duration::from_secs(1),
            segment_queue_capacity: 32,
        }
    }
}

/// What a frame did to the session, so the owner can start or wind down work.
#[derive(Debug)]
pub enum Transition {
    None,
    Started(StreamStart),
    Stopped,
}

/// Handed to the owner when the stream starts.
#[derive(Debug)]
pub struct StreamStart {
    pub stream_sid: String,
    pub metadata: StartMetadata,
    /// Sealed segments in order; closes when the session stops
    pub segments: mpsc::Receiver<AudioSegment>,
    pub emitter: FrameEmitter,
}

/// Read-only view used by the pacing task to write outbound audio.
#[derive(Debug, Clone)]
pub struct FrameEmitter {
    call_id: Arc<str>,
    stream_sid: Arc<str>,
    tx: mpsc::Sender<String>,
    live: Arc<AtomicBool>,
    chunks_emitted: Arc<AtomicU64>,
}

impl FrameEmitter {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn stream_sid(&self) -> &str {
        &self.stream_sid
    }

    /// False once the session has stopped or the channel went away.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Wrap pre-transcoded telephony audio as a `media` frame and queue it.
    ///
    /// Waits when the outbound queue is full.
    pub async fn emit(&self, audio: &[u8]) -> Result<(), StreamError> {
        if !self.live.load(Ordering::Acquire) {
            return Err(StreamError::Channel("Session is no longer live".to_string()));
        }

        let frame = OutboundMedia::new(&self.stream_sid, audio).to_json()?;
        if self.tx.send(frame).await.is_err() {
            self.live.store(false, Ordering::Release);
            return Err(StreamError::Channel("Outbound channel closed".to_string()));
        }

        self.chunks_emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Counters for one session, logged at teardown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub media_frames: u64,
    pub media_bytes: u64,
    /// Media frames that arrived outside `Streaming`
    pub dropped_frames: u64,
    pub segments_sealed: u64,
    pub segments_dropped: u64,
    pub chunks_emitted: u64,
}

pub struct StreamSession {
    call_id: Arc<str>,
    settings: SessionSettings,
    state: SessionState,
    stream_sid: Option<Arc<str>>,

    segmenter: InboundSegmenter,
    segment_tx: Option<mpsc::Sender<AudioSegment>>,
    outbound_tx: mpsc::Sender<String>,
    live: Arc<AtomicBool>,
    pacing_task: Option<AbortHandle>,
    listener_task: Option<AbortHandle>,
    closed: bool,

    stats: SessionStats,
    chunks_emitted: Arc<AtomicU64>,
}

impl StreamSession {
    pub fn new(call_id: impl Into<String>, settings: SessionSettings, outbound_tx: mpsc::Sender<String>) -> Self {
        let segmenter = InboundSegmenter::new(settings.encoding, settings.sample_rate, settings.segment_duration);

        Self {
            call_id: Arc::from(call_id.into()),
            settings,
            state: SessionState::Idle,
            stream_sid: None,
            segmenter,
            segment_tx: None,
            outbound_tx,
            live: Arc::new(AtomicBool::new(false)),
            pacing_task: None,
            listener_task: None,
            closed: false,
            stats: SessionStats::default(),
            chunks_emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    /// Consume one raw text frame. Malformed frames are logged and dropped.
    pub fn handle_inbound(&mut self, text: &str) -> Transition {
        self.stats.frames_received += 1;

        match Frame::parse(text) {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => {
                self.stats.malformed_frames += 1;
                warn!(call_id = %self.call_id, error = %e, "Dropping malformed frame");
                Transition::None
            }
        }
    }

    /// Advance the state machine with an already decoded frame.
    pub fn handle_frame(&mut self, frame: Frame) -> Transition {
        if self.state == SessionState::Stopped {
            debug!(call_id = %self.call_id, event = frame.event_name(), "Ignoring frame after stop");
            return Transition::None;
        }

        match frame {
            Frame::Connected => {
                if self.state == SessionState::Idle {
                    self.state = SessionState::Connected;
                    info!(call_id = %self.call_id, "Media stream connected");
                }
                Transition::None
            }
            Frame::Start { stream_sid, start } => self.on_start(stream_sid, start),
            Frame::Media { media, .. } => {
                if self.state != SessionState::Streaming {
                    self.stats.dropped_frames += 1;
                    debug!(call_id = %self.call_id, state = ?self.state, "Dropping media before start");
                    return Transition::None;
                }

                match media.decode() {
                    Ok(audio) => {
                        self.on_audio(&audio);
                        Transition::None
                    }
                    Err(e) => {
                        self.stats.malformed_frames += 1;
                        warn!(call_id = %self.call_id, error = %e, "Dropping undecodable media payload");
                        Transition::None
                    }
                }
            }
            Frame::Stop => {
                info!(
                    call_id = %self.call_id,
                    stream_sid = self.stream_sid.as_deref().unwrap_or("-"),
                    "Media stream stopped"
                );
                self.shutdown();
                Transition::Stopped
            }
            Frame::Unknown => {
                debug!(call_id = %self.call_id, "Ignoring unrecognized event");
                Transition::None
            }
        }
    }

    fn on_start(&mut self, top_level_sid: Option<String>, metadata: StartMetadata) -> Transition {
        if self.state == SessionState::Streaming {
            warn!(call_id = %self.call_id, "Ignoring duplicate start");
            return Transition::None;
        }

        let Some(stream_sid) = metadata.stream_sid.clone().or(top_level_sid) else {
            warn!(call_id = %self.call_id, "Start frame without a stream id");
            return Transition::None;
        };

        let stream_sid: Arc<str> = Arc::from(stream_sid);
        let (segment_tx, segments) = mpsc::channel(self.settings.segment_queue_capacity);

        self.stream_sid = Some(stream_sid.clone());
        self.segment_tx = Some(segment_tx);
        self.state = SessionState::Streaming;
        self.live.store(true, Ordering::Release);

        info!(
            call_id = %self.call_id,
            stream_sid = %stream_sid,
            caller = metadata.caller.as_deref().unwrap_or("-"),
            called = metadata.called.as_deref().unwrap_or("-"),
            "Media stream started"
        );

        Transition::Started(StreamStart {
            stream_sid: stream_sid.to_string(),
            metadata,
            segments,
            emitter: self.build_emitter(stream_sid),
        })
    }

    fn on_audio(&mut self, audio: &[u8]) {
        self.stats.media_frames += 1;
        self.stats.media_bytes += audio.len() as u64;

        if let Some(segment) = self.segmenter.push(audio) {
            self.deliver(segment);
        }
    }

    /// Hand a sealed segment to the listener. A full queue drops the new segment.
    fn deliver(&mut self, segment: AudioSegment) {
        self.stats.segments_sealed += 1;

        let Some(tx) = &self.segment_tx else {
            self.stats.segments_dropped += 1;
            return;
        };

        match tx.try_send(segment) {
            Ok(()) => {}
            Err(TrySendError::Full(segment)) => {
                self.stats.segments_dropped += 1;
                warn!(
                    call_id = %self.call_id,
                    sequence = segment.sequence,
                    encoded_bytes = segment.encoded_len,
                    "Segment queue full, dropping segment"
                );
            }
            Err(TrySendError::Closed(segment)) => {
                self.stats.segments_dropped += 1;
                debug!(call_id = %self.call_id, sequence = segment.sequence, "No listener for segment");
            }
        }
    }

    /// Flush the remainder and move to `Stopped`. Safe to call repeatedly.
    fn shutdown(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }

        if let Some(segment) = self.segmenter.flush() {
            self.deliver(segment);
        }

        self.state = SessionState::Stopped;
        self.live.store(false, Ordering::Release);
        // Dropping the sender lets the listener drain and exit
        self.segment_tx = None;
    }

    /// Write pre-transcoded audio as a `media` frame.
    ///
    /// Before `start` there is no stream id to tag frames with, so this is a
    /// no-op with a warning.
    pub async fn emit(&self, audio: &[u8]) -> Result<(), StreamError> {
        match self.emitter() {
            Some(emitter) => emitter.emit(audio).await,
            None => {
                warn!(call_id = %self.call_id, "Cannot emit audio before the stream starts");
                Ok(())
            }
        }
    }

    /// View for the pacing task. `None` until a stream id has been captured.
    pub fn emitter(&self) -> Option<FrameEmitter> {
        self.stream_sid.clone().map(|sid| self.build_emitter(sid))
    }

    fn build_emitter(&self, stream_sid: Arc<str>) -> FrameEmitter {
        FrameEmitter {
            call_id: self.call_id.clone(),
            stream_sid,
            tx: self.outbound_tx.clone(),
            live: self.live.clone(),
            chunks_emitted: self.chunks_emitted.clone(),
        }
    }

    /// Register the task that paces outbound audio so `close()` can cancel it.
    pub fn attach_pacing_task(&mut self, handle: AbortHandle) {
        if self.closed {
            handle.abort();
            return;
        }
        self.pacing_task = Some(handle);
    }

    /// Register the task that transcribes sealed segments so `close()` can
    /// cancel a transcription still in flight.
    pub fn attach_listener_task(&mut self, handle: AbortHandle) {
        if self.closed {
            handle.abort();
            return;
        }
        self.listener_task = Some(handle);
    }

    /// Idempotent teardown, called when the channel goes away.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.shutdown();

        for task in [self.pacing_task.take(), self.listener_task.take()].into_iter().flatten() {
            task.abort();
        }

        let stats = self.stats();
        info!(
            call_id = %self.call_id,
            stream_sid = self.stream_sid.as_deref().unwrap_or("-"),
            frames = stats.frames_received,
            media_bytes = stats.media_bytes,
            dropped_frames = stats.dropped_frames,
            segments_sealed = stats.segments_sealed,
            segments_dropped = stats.segments_dropped,
            chunks_emitted = stats.chunks_emitted,
            "Session closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            chunks_emitted: self.chunks_emitted.load(Ordering::Relaxed),
            ..self.stats.clone()
        }
    }

    /// Inbound bytes not yet sealed into a segment.
    pub fn remainder_len(&self) -> usize {
        self.segmenter.remainder_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde_json::json;

    fn session() -> (StreamSession, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (StreamSession::new("CA-test", SessionSettings::default(), tx), rx)
    }

    fn start_frame(sid: &str) -> String {
        json!({
            "event": "start",
            "start": {"streamSid": sid, "callSid": "CA-test", "caller": "+15550001", "called": "+15550002"}
        })
        .to_string()
    }

    fn media_frame(audio: &[u8]) -> String {
        json!({"event": "media", "media": {"payload": STANDARD.encode(audio)}}).to_string()
    }

    fn start(session: &mut StreamSession, sid: &str) -> StreamStart {
        match session.handle_inbound(&start_frame(sid)) {
            Transition::Started(start) => start,
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[test]
    fn test_lifecycle() {
        let (mut session, _rx) = session();
        assert_eq!(session.state(), SessionState::Idle);

        session.handle_inbound(r#"{"event":"connected"}"#);
        assert_eq!(session.state(), SessionState::Connected);

        let started = start(&mut session, "MZ1");
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(started.stream_sid, "MZ1");
        assert_eq!(started.metadata.caller.as_deref(), Some("+15550001"));
        assert!(started.emitter.is_live());

        assert!(matches!(session.handle_inbound(r#"{"event":"stop"}"#), Transition::Stopped));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!started.emitter.is_live());

        // Terminal
        session.handle_inbound(&start_frame("MZ2"));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stream_sid(), Some("MZ1"));
    }

    #[test]
    fn test_media_before_start_is_dropped() {
        let (mut session, _rx) = session();
        session.handle_inbound(r#"{"event":"connected"}"#);
        session.handle_inbound(&media_frame(&[0xFF; 160]));

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.stream_sid(), None);
        assert_eq!(session.stats().dropped_frames, 1);
        assert_eq!(session.remainder_len(), 0);

        start(&mut session, "MZ1");
        session.handle_inbound(&media_frame(&[0xFF; 160]));
        assert_eq!(session.remainder_len(), 160);
    }

    #[test]
    fn test_start_without_connected() {
        let (mut session, _rx) = session();
        start(&mut session, "MZ1");
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_start_uses_top_level_stream_sid() {
        let (mut session, _rx) = session();
        let frame = json!({"event": "start", "streamSid": "MZ-top", "start": {"callSid": "CA1"}}).to_string();
        assert!(matches!(session.handle_inbound(&frame), Transition::Started(_)));
        assert_eq!(session.stream_sid(), Some("MZ-top"));
    }

    #[test]
    fn test_duplicate_start_is_ignored() {
        let (mut session, _rx) = session();
        start(&mut session, "MZ1");
        assert!(matches!(session.handle_inbound(&start_frame("MZ2")), Transition::None));
        assert_eq!(session.stream_sid(), Some("MZ1"));
    }

    #[test]
    fn test_malformed_and_unknown_frames_do_not_change_state() {
        let (mut session, _rx) = session();
        start(&mut session, "MZ1");

        session.handle_inbound("{broken");
        session.handle_inbound(r#"{"event":"mark","mark":{"name":"a"}}"#);
        session.handle_inbound(r#"{"event":"media","media":{"payload":"@@@"}}"#);

        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.stats().malformed_frames, 2);
        assert_eq!(session.stats().frames_received, 4);
    }

    #[test]
    fn test_segments_and_single_flush() {
        let (mut session, _rx) = session();
        let mut started = start(&mut session, "MZ1");

        for _ in 0..115 {
            session.handle_inbound(&media_frame(&[0xFF; 160]));
        }

        assert_eq!(started.segments.try_recv().unwrap().encoded_len, 8000);
        assert_eq!(started.segments.try_recv().unwrap().encoded_len, 8000);
        assert!(started.segments.try_recv().is_err());

        session.handle_inbound(r#"{"event":"stop"}"#);
        session.close();
        session.close();

        let last = started.segments.try_recv().unwrap();
        assert_eq!(last.encoded_len, 2400);
        assert_eq!(last.sequence, 2);
        // Sender released, queue drained
        assert!(matches!(
            started.segments.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(session.stats().segments_sealed, 3);
    }

    #[test]
    fn test_close_flushes_when_stop_never_arrived() {
        let (mut session, _rx) = session();
        let mut started = start(&mut session, "MZ1");
        session.handle_inbound(&media_frame(&[0xFF; 500]));

        session.close();
        assert!(session.is_closed());
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(started.segments.try_recv().unwrap().encoded_len, 500);

        session.close();
        assert!(started.segments.try_recv().is_err());
    }

    #[test]
    fn test_full_segment_queue_drops_newest() {
        let (tx, _rx) = mpsc::channel(4);
        let settings = SessionSettings {
            segment_queue_capacity: 1,
            ..SessionSettings::default()
        };
        let mut session = StreamSession::new("CA-full", settings, tx);
        let mut started = start(&mut session, "MZ1");

        session.handle_inbound(&media_frame(&[0x01; 8000]));
        session.handle_inbound(&media_frame(&[0x02; 8000]));

        let stats = session.stats();
        assert_eq!(stats.segments_sealed, 2);
        assert_eq!(stats.segments_dropped, 1);
        assert_eq!(started.segments.try_recv().unwrap().sequence, 0);
    }

    #[tokio::test]
    async fn test_emit_before_start_is_noop() {
        let (session, mut rx) = session();
        assert!(session.emitter().is_none());
        assert!(session.emit(&[0xFF; 10]).await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_emit_wraps_media_frame() {
        let (mut session, mut rx) = session();
        start(&mut session, "MZ1");

        session.emit(&[1, 2, 3]).await.unwrap();

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "media");
        assert_eq!(frame["streamSid"], "MZ1");
        assert_eq!(frame["media"]["payload"], STANDARD.encode([1u8, 2, 3]));
        assert_eq!(session.stats().chunks_emitted, 1);
    }

    #[tokio::test]
    async fn test_emit_after_disconnect_is_channel_error() {
        let (mut session, rx) = session();
        let started = start(&mut session, "MZ1");
        drop(rx);

        assert!(!started.emitter.is_live());
        assert!(matches!(started.emitter.emit(&[1]).await, Err(StreamError::Channel(_))));

        let (mut session, _rx) = self::session();
        let started = start(&mut session, "MZ1");
        session.close();
        assert!(matches!(started.emitter.emit(&[1]).await, Err(StreamError::Channel(_))));
    }

    #[tokio::test]
    async fn test_close_aborts_pacing_task() {
        let (mut session, _rx) = session();
        start(&mut session, "MZ1");

        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        session.attach_pacing_task(task.abort_handle());
        session.close();

        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_close_aborts_listener_task() {
        let (mut session, _rx) = session();
        start(&mut session, "MZ1");

        let listener = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        session.attach_listener_task(listener.abort_handle());
        session.close();
        assert!(listener.await.unwrap_err().is_cancelled());

        // Attaching after close cancels right away
        let late = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        session.attach_listener_task(late.abort_handle());
        assert!(late.await.unwrap_err().is_cancelled());
    }
}
