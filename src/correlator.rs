use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::registry::SessionRegistry;

const REDACTED_PLACEHOLDER: &str = "REDACTED";

/// Query parameters whose values never leave the correlator.
const SENSITIVE_QUERY_KEYS: &[&str] = &["token", "auth", "authorization", "password", "key", "code"];

/// Raw lifecycle signal for one observed HTTP exchange. `id` is the network
/// layer's ephemeral request identifier; signals for one id arrive in order
/// (start, zero or more redirects, exactly one terminal), with no ordering
/// across ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LifecycleSignal {
    #[serde(rename_all = "camelCase")]
    Start {
        id: u64,
        tab_id: i64,
        url: String,
        method: String,
        kind: String,
        at: i64,
    },
    #[serde(rename_all = "camelCase")]
    Redirect {
        id: u64,
        from: String,
        to: String,
        status: u16,
        at: i64,
    },
    #[serde(rename_all = "camelCase")]
    Completed { id: u64, status: u16, at: i64 },
    #[serde(rename_all = "camelCase")]
    Errored { id: u64, error: String, at: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectHop {
    pub from: String,
    pub to: String,
    pub status: u16,
    pub at: i64,
}

/// Provenance of a finalized event: stitched from network-layer signals, or
/// self-reported by in-page instrumentation the network layer cannot see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Network,
    Reported,
}

/// Immutable per-exchange record handed to the session buffer. URLs are
/// already redacted by the time one of these exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedEvent {
    pub id: String,
    pub session_id: String,
    pub source: EventSource,
    pub kind: String,
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: i64,
    pub ended_at: i64,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirects: Vec<RedirectHop>,
}

/// Self-reported exchange arriving over RPC, normalized into the shared
/// event shape before it joins the per-session buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedEvent {
    pub id: String,
    pub url: String,
    #[serde(default = "default_reported_method")]
    pub method: String,
    #[serde(default = "default_reported_kind")]
    pub kind: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: i64,
    pub ended_at: i64,
}

fn default_reported_method() -> String {
    "GET".to_owned()
}

fn default_reported_kind() -> String {
    "reported".to_owned()
}

pub fn normalize_reported(session_id: &str, reported: ReportedEvent) -> FinalizedEvent {
    FinalizedEvent {
        id: reported.id,
        session_id: session_id.to_owned(),
        source: EventSource::Reported,
        kind: reported.kind,
        method: reported.method,
        url: redact_url(&reported.url),
        status: reported.status,
        error: reported.error,
        started_at: reported.started_at,
        ended_at: reported.ended_at,
        duration_ms: clamp_duration(reported.started_at, reported.ended_at),
        redirects: Vec::new(),
    }
}

struct InFlightExchange {
    /// `None` means the tab had no active session at start; the exchange is
    /// tracked so redirects and terminals find their entry, then dropped.
    session_id: Option<String>,
    url: String,
    method: String,
    kind: String,
    started_at: i64,
    redirects: Vec<RedirectHop>,
}

/// Joins disjoint lifecycle signals into finalized exchange records, keyed by
/// the ephemeral request id, and hands completed records to the session
/// registry. Consumes signals from a single bounded channel; the in-flight
/// table is owned by this loop alone.
pub struct Correlator {
    registry: Arc<SessionRegistry>,
    in_flight: HashMap<u64, InFlightExchange>,
}

impl Correlator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            in_flight: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut signals: mpsc::Receiver<LifecycleSignal>) {
        while let Some(signal) = signals.recv().await {
            self.handle_signal(signal).await;
        }
        tracing::debug!(
            abandoned = self.in_flight.len(),
            "lifecycle signal channel closed"
        );
    }

    pub async fn handle_signal(&mut self, signal: LifecycleSignal) {
        match signal {
            LifecycleSignal::Start {
                id,
                tab_id,
                url,
                method,
                kind,
                at,
            } => {
                let session_id = self
                    .registry
                    .session_for_tab(tab_id)
                    .await
                    .map(|session| session.session_id);
                self.in_flight.insert(
                    id,
                    InFlightExchange {
                        session_id,
                        url,
                        method,
                        kind,
                        started_at: at,
                        redirects: Vec::new(),
                    },
                );
            }
            LifecycleSignal::Redirect {
                id,
                from,
                to,
                status,
                at,
            } => {
                if let Some(exchange) = self.in_flight.get_mut(&id) {
                    exchange.redirects.push(RedirectHop {
                        from,
                        to,
                        status,
                        at,
                    });
                } else {
                    tracing::debug!(id, "redirect signal with no in-flight exchange");
                }
            }
            LifecycleSignal::Completed { id, status, at } => {
                self.finalize(id, Some(status), None, at).await;
            }
            LifecycleSignal::Errored { id, error, at } => {
                self.finalize(id, None, Some(error), at).await;
            }
        }
    }

    async fn finalize(&mut self, id: u64, status: Option<u16>, error: Option<String>, at: i64) {
        let Some(exchange) = self.in_flight.remove(&id) else {
            // Terminal without a start, e.g. the exchange began before the
            // session was registered. An accepted gap, not an error.
            tracing::debug!(id, "terminal signal with no in-flight exchange");
            return;
        };
        let Some(session_id) = exchange.session_id else {
            return;
        };

        let event = FinalizedEvent {
            id: id.to_string(),
            session_id: session_id.clone(),
            source: EventSource::Network,
            kind: exchange.kind,
            method: exchange.method,
            url: redact_url(&exchange.url),
            status,
            error,
            started_at: exchange.started_at,
            ended_at: at,
            duration_ms: clamp_duration(exchange.started_at, at),
            redirects: exchange.redirects,
        };
        if let Err(err) = self.registry.buffer_event(&session_id, event).await {
            tracing::warn!(id, session_id = %session_id, "buffer finalized event failed: {err:#}");
        }
    }
}

fn clamp_duration(started_at: i64, ended_at: i64) -> i64 {
    (ended_at - started_at).max(0)
}

/// Replaces the values of sensitive query parameters with a fixed
/// placeholder, preserving parameter presence and order. The path and
/// fragment pass through untouched.
pub fn redact_url(url: &str) -> String {
    let Some(query_start) = url.find('?') else {
        return url.to_owned();
    };
    let (base, rest) = url.split_at(query_start);
    let rest = &rest[1..];
    let (query, fragment) = match rest.find('#') {
        Some(pos) => (&rest[..pos], Some(&rest[pos..])),
        None => (rest, None),
    };

    let redacted = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((name, _)) if is_sensitive_param(name) => {
                format!("{name}={REDACTED_PLACEHOLDER}")
            }
            _ => pair.to_owned(),
        })
        .collect::<Vec<_>>()
        .join("&");

    match fragment {
        Some(fragment) => format!("{base}?{redacted}{fragment}"),
        None => format!("{base}?{redacted}"),
    }
}

fn is_sensitive_param(name: &str) -> bool {
    SENSITIVE_QUERY_KEYS
        .iter()
        .any(|key| name.eq_ignore_ascii_case(key))
}
