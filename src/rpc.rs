use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use http_body_util::BodyExt as _;
use hyper::{Method, Request, Uri, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    correlator::{ReportedEvent, normalize_reported},
    fetch::{FetchProxy, HttpClient, ProxyRequest, boxed_full},
    registry::SessionRegistry,
};

const ONE_SHOT_ATTEMPTS: usize = 3;
const ONE_SHOT_BACKOFF: Duration = Duration::from_millis(200);

pub const PONG_FRAME: &str = r#"{"type":"BRIDGE_PONG"}"#;

/// One-shot request envelope. A closed union; unknown `type` values are a
/// deserialization error surfaced as `{success: false}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Envelope {
    #[serde(rename = "BACKGROUND_FETCH")]
    BackgroundFetch(ProxyRequest),
    #[serde(rename = "NETWORK_CAPTURE_START")]
    NetworkCaptureStart(CaptureStart),
    #[serde(rename = "NETWORK_CAPTURE_STOP")]
    NetworkCaptureStop(CaptureStop),
    #[serde(rename = "TRACK_NETWORK_EVENT")]
    TrackNetworkEvent(TrackEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStart {
    pub session_id: String,
    pub tab_id: i64,
    pub started_at: i64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStop {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    pub session_id: String,
    pub event: ReportedEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Inbound frame on the persistent bridge channel. `req_id` is
/// caller-generated and echoed back verbatim, so concurrent requests can be
/// multiplexed over one channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeFrame {
    #[serde(rename = "BACKGROUND_FETCH", rename_all = "camelCase")]
    BackgroundFetch { req_id: Value, data: ProxyRequest },
    #[serde(rename = "BRIDGE_PING")]
    Ping,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeReply {
    pub ok: bool,
    pub req_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Message entry point external contexts use to reach the proxy and the
/// capture pipeline. Both transports, one-shot and bridge, delegate to the
/// same handlers; neither ever propagates an error past the boundary.
pub struct FrontDoor {
    fetch: Arc<FetchProxy>,
    registry: Arc<SessionRegistry>,
}

impl FrontDoor {
    pub fn new(fetch: Arc<FetchProxy>, registry: Arc<SessionRegistry>) -> Self {
        Self { fetch, registry }
    }

    pub async fn handle(&self, envelope: Envelope) -> ResponseEnvelope {
        match envelope {
            Envelope::BackgroundFetch(request) => {
                let response = self.fetch.execute(request).await;
                match serde_json::to_value(&response) {
                    Ok(data) => ResponseEnvelope::ok(data),
                    Err(err) => ResponseEnvelope::err(format!("encode proxy response: {err}")),
                }
            }
            Envelope::NetworkCaptureStart(start) => {
                tracing::info!(
                    session_id = %start.session_id,
                    tab_id = start.tab_id,
                    url = %start.url,
                    "network capture started"
                );
                self.registry
                    .register_session(start.tab_id, &start.session_id, start.started_at)
                    .await;
                ResponseEnvelope::ok(Value::Null)
            }
            Envelope::NetworkCaptureStop(stop) => {
                match self.registry.end_session(&stop.session_id).await {
                    Ok(count) => ResponseEnvelope::ok(Value::from(count)),
                    Err(err) => ResponseEnvelope::err(format!("{err:#}")),
                }
            }
            Envelope::TrackNetworkEvent(track) => {
                let event = normalize_reported(&track.session_id, track.event);
                match self.registry.buffer_event(&track.session_id, event).await {
                    Ok(()) => ResponseEnvelope::ok(Value::Null),
                    Err(err) => ResponseEnvelope::err(format!("{err:#}")),
                }
            }
        }
    }

    /// One bridge line in, one reply line out. Malformed frames get an
    /// `{ok: false}` reply with a null `reqId` instead of dropping the line.
    pub async fn handle_frame(&self, raw: &str) -> String {
        let frame: BridgeFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                return encode_reply(&BridgeReply {
                    ok: false,
                    req_id: Value::Null,
                    data: None,
                    error: Some(format!("parse bridge frame: {err}")),
                });
            }
        };

        match frame {
            BridgeFrame::Ping => PONG_FRAME.to_owned(),
            BridgeFrame::BackgroundFetch { req_id, data } => {
                let response = self.fetch.execute(data).await;
                let reply = match serde_json::to_value(&response) {
                    Ok(data) => BridgeReply {
                        ok: true,
                        req_id,
                        data: Some(data),
                        error: None,
                    },
                    Err(err) => BridgeReply {
                        ok: false,
                        req_id,
                        data: None,
                        error: Some(format!("encode proxy response: {err}")),
                    },
                };
                encode_reply(&reply)
            }
        }
    }
}

fn encode_reply(reply: &BridgeReply) -> String {
    serde_json::to_string(reply).unwrap_or_else(|err| {
        format!(r#"{{"ok":false,"reqId":null,"error":"encode bridge reply: {err}"}}"#)
    })
}

/// Caller-side one-shot transport. The send is retried a bounded number of
/// times with fixed backoff, for the window right after startup when the
/// listener is not yet reachable; the underlying fetch is never retried here.
pub async fn call_one_shot(
    client: &HttpClient,
    endpoint: &Uri,
    envelope: &Envelope,
) -> anyhow::Result<ResponseEnvelope> {
    let body = serde_json::to_vec(envelope).context("serialize rpc envelope")?;

    let mut last_error = None;
    for attempt in 1..=ONE_SHOT_ATTEMPTS {
        let request = Request::builder()
            .method(Method::POST)
            .uri(endpoint.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(boxed_full(body.clone()))
            .context("build rpc request")?;

        match client.request(request).await {
            Ok(response) => {
                let bytes = response
                    .into_body()
                    .collect()
                    .await
                    .context("read rpc response body")?
                    .to_bytes();
                return serde_json::from_slice(&bytes).context("parse rpc response envelope");
            }
            Err(err) => {
                tracing::debug!(attempt, "one-shot rpc send failed: {err}");
                last_error = Some(err);
                if attempt < ONE_SHOT_ATTEMPTS {
                    tokio::time::sleep(ONE_SHOT_BACKOFF).await;
                }
            }
        }
    }

    Err(last_error
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow::anyhow!("one-shot rpc send failed")))
    .with_context(|| format!("send rpc envelope to {endpoint} after {ONE_SHOT_ATTEMPTS} attempts"))
}
