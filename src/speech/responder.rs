//! Response generation: a webhook to the conversation service, or an echo
//! when none is configured.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{provider_error, CallContext, Reply, Responder, SpeechResult};

/// POSTs `{callSid, text}` and expects `{response, isComplete}` back.
pub struct WebhookResponder {
    client: reqwest::Client,
    url: String,
}

impl WebhookResponder {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl Responder for WebhookResponder {
    async fn respond(&self, call: &CallContext, text: &str) -> SpeechResult<Reply> {
        let payload = json!({
            "callSid": call.call_sid,
            "streamSid": call.stream_sid,
            "caller": call.caller,
            "text": text,
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(provider_error(response).await);
        }

        let reply: Reply = response.json().await?;
        debug!(call_id = %call.call_sid, complete = reply.is_complete, "Responder replied");
        Ok(reply)
    }
}

/// Repeats what the caller said. Used when no conversation service is set up.
#[derive(Debug, Default)]
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, _call: &CallContext, text: &str) -> SpeechResult<Reply> {
        Ok(Reply {
            text: format!("You said: {}", text),
            is_complete: false,
        })
    }
}
