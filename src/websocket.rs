//! # Media Stream WebSocket Handler
//!
//! One WebSocket per call, opened by the telephony provider at `/media-stream`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Provider connects, optionally with `?callSid=...`
//! 2. **connected / start**: Control frames; `start` carries the stream id
//! 3. **media**: Base64 μ-law audio, 20 ms per frame
//! 4. **stop**: Provider hung up or ended the stream
//!
//! ## Message Flow:
//! - **Provider → Server**: JSON text frames, fed to the [`StreamSession`]
//! - **Server → Provider**: JSON `media` frames built by the call pipeline and
//!   delivered to this actor through a bounded channel
//!
//! ## Actor Model:
//! The actor owns the session outright. Inbound frames are handled one at a
//! time, in arrival order, on the actor's thread.

use crate::pipeline::CallPipeline;
use crate::state::AppState;
use crate::stream::session::{SessionSettings, StreamSession, Transition};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// A serialized frame on its way to the provider.
#[derive(Message)]
#[rtype(result = "()")]
struct OutboundFrame(String);

#[derive(Debug, Deserialize)]
pub struct MediaStreamQuery {
    #[serde(rename = "callSid")]
    call_sid: Option<String>,
}

pub struct MediaStreamSocket {
    state: AppState,
    session: StreamSession,
    outbound_rx: Option<mpsc::Receiver<String>>,
    last_heartbeat: Instant,
}

impl MediaStreamSocket {
    pub fn new(state: AppState, call_id: String) -> Self {
        let config = state.get_config();
        let settings = SessionSettings {
            encoding: config.audio.inbound_encoding,
            sample_rate: config.audio.sample_rate,
            segment_duration: config.audio.segment_duration(),
            segment_queue_capacity: config.audio.segment_queue_capacity,
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(config.audio.outbound_queue_capacity);

        Self {
            state,
            session: StreamSession::new(call_id, settings, outbound_tx),
            outbound_rx: Some(outbound_rx),
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_text(&mut self, text: &str) {
        match self.session.handle_inbound(text) {
            Transition::Started(start) => {
                let call_id = self.session.call_id().to_string();
                let handle = CallPipeline::new(self.state.clone()).spawn(&call_id, start);
                self.session.attach_pacing_task(handle.speaker_abort_handle());
                self.session.attach_listener_task(handle.listener_abort_handle());
            }
            Transition::Stopped => {
                debug!(call_id = self.session.call_id(), "Stream stopped, draining pipeline");
            }
            Transition::None => {}
        }
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(call_id = self.session.call_id(), "Media stream socket opened");

        if let Some(rx) = self.outbound_rx.take() {
            ctx.add_message_stream(ReceiverStream::new(rx).map(OutboundFrame));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = act.session.call_id(), "Media stream heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.session.close();
        self.state.end_session();
        info!(call_id = self.session.call_id(), "Media stream socket closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                warn!(call_id = self.session.call_id(), bytes = data.len(), "Ignoring binary frame");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(call_id = self.session.call_id(), reason = ?reason, "Provider closed media stream");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(call_id = self.session.call_id(), "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(call_id = self.session.call_id(), "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundFrame> for MediaStreamSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// `GET /media-stream`: upgrade to a media stream WebSocket.
///
/// Refused with 503 when `max_concurrent_sessions` calls are already open.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<MediaStreamQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    if !state.try_start_session() {
        warn!("Refusing media stream: session limit reached");
        return Ok(HttpResponse::ServiceUnavailable().json(json!({
            "error": {
                "type": "capacity_exceeded",
                "message": "Maximum concurrent sessions reached",
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        })));
    }

    let call_id = query
        .into_inner()
        .call_sid
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let socket = MediaStreamSocket::new(state.get_ref().clone(), call_id);

    match ws::start(socket, &req, stream) {
        Ok(response) => {
            state.record_call_started();
            Ok(response)
        }
        Err(err) => {
            // The actor never started, so `stopped` won't release the slot
            state.end_session();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_plain_request_is_rejected_and_slot_released() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/media-stream", web::get().to(media_stream)),
        )
        .await;

        let req = test::TestRequest::get().uri("/media-stream?callSid=CA1").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 0);
        assert_eq!(metrics.total_calls, 0);
    }

    #[actix_web::test]
    async fn test_session_limit_returns_503() {
        let state = test_state();
        let mut config = state.get_config();
        config.performance.max_concurrent_sessions = 1;
        state.update_config(config).unwrap();
        assert!(state.try_start_session());

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/media-stream", web::get().to(media_stream)),
        )
        .await;

        let req = test::TestRequest::get().uri("/media-stream").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
    }
}
