use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt as _;
use hyper::{Method, Request, Uri, header};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{fetch::HttpClient, store::ChunkedStore};

pub const CREDENTIALS_KEY: &str = "auth:tokens";

/// Current token pair. Owned exclusively by [`CredentialCache`]; everything
/// else reads snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

/// Token pair returned by a successful refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<i64>,
}

/// Seam to the identity provider's refresh endpoint.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<TokenSet>;
}

/// HTTP identity provider: `POST {refresh_url}` with the refresh token,
/// expecting a new token pair back. Any non-success status is a failed
/// refresh.
pub struct HttpIdentityProvider {
    client: HttpClient,
    refresh_url: Uri,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequestBody<'a> {
    refresh_token: &'a str,
}

impl HttpIdentityProvider {
    pub fn new(client: HttpClient, refresh_url: Uri) -> Self {
        Self {
            client,
            refresh_url,
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<TokenSet> {
        let body = serde_json::to_vec(&RefreshRequestBody { refresh_token })
            .context("serialize refresh request")?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.refresh_url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(crate::fetch::boxed_full(Bytes::from(body)))
            .context("build refresh request")?;

        let response = self
            .client
            .request(request)
            .await
            .context("request identity provider")?;
        let status = response.status();
        let response_body = response
            .into_body()
            .collect()
            .await
            .context("read refresh response body")?
            .to_bytes();

        if !status.is_success() {
            anyhow::bail!("identity provider rejected refresh: {status}");
        }

        serde_json::from_slice(&response_body).context("parse refresh response")
    }
}

enum RefreshRole {
    Leader(watch::Sender<Option<bool>>, watch::Receiver<Option<bool>>),
    Follower(watch::Receiver<Option<bool>>),
}

/// Clears the pending slot when the leader's refresh finishes or when the
/// leader future is dropped mid-flight, so a cancelled caller cannot strand a
/// dead channel in the slot. The channel comparison keeps a late-running drop
/// from clobbering a slot some newer leader already installed.
struct PendingSlotGuard<'a> {
    cache: &'a CredentialCache,
    channel: watch::Receiver<Option<bool>>,
}

impl Drop for PendingSlotGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.cache.lock_pending();
        if pending
            .as_ref()
            .is_some_and(|receiver| receiver.same_channel(&self.channel))
        {
            *pending = None;
        }
    }
}

/// Holds the current credential state and coalesces concurrent refresh
/// attempts: at most one request is ever in flight against the identity
/// provider, and every concurrent caller shares its outcome. The pending slot
/// is cleared unconditionally, on completion or cancellation, before the
/// outcome is delivered, so no refresh attempt ever poisons the next one.
pub struct CredentialCache {
    state: Mutex<CredentialState>,
    pending: Mutex<Option<watch::Receiver<Option<bool>>>>,
    provider: Arc<dyn IdentityProvider>,
    store: Option<ChunkedStore>,
}

impl CredentialCache {
    pub fn new(provider: Arc<dyn IdentityProvider>, store: Option<ChunkedStore>) -> Self {
        Self {
            state: Mutex::new(CredentialState::default()),
            pending: Mutex::new(None),
            provider,
            store,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CredentialState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<watch::Receiver<Option<bool>>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> CredentialState {
        self.lock_state().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.snapshot().access_token
    }

    /// External sign-in (or sign-out with an empty state): replaces the state
    /// wholesale and mirrors it.
    pub async fn set_tokens(&self, state: CredentialState) {
        *self.lock_state() = state.clone();
        self.mirror(&state).await;
    }

    /// Rehydrates the mirrored token pair from durable storage. Called once at
    /// startup; in-memory state is never authoritative across restarts.
    pub async fn load_persisted(&self) -> anyhow::Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        if let Some(persisted) = store.get::<CredentialState>(CREDENTIALS_KEY).await? {
            *self.lock_state() = persisted;
            tracing::debug!("rehydrated persisted credentials");
        }
        Ok(())
    }

    /// Single-flight refresh. The first caller performs the network call;
    /// callers arriving while it is outstanding await the same result.
    pub async fn refresh(&self) -> bool {
        let role = {
            let mut pending = self.lock_pending();
            match pending.as_ref() {
                Some(receiver) => RefreshRole::Follower(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    *pending = Some(receiver.clone());
                    RefreshRole::Leader(sender, receiver)
                }
            }
        };

        match role {
            RefreshRole::Leader(sender, channel) => {
                let slot = PendingSlotGuard {
                    cache: self,
                    channel,
                };
                let outcome = self.run_refresh().await;
                // Clear the slot before publishing so late arrivals start a
                // fresh attempt instead of observing a finished one.
                drop(slot);
                let _ = sender.send(Some(outcome));
                outcome
            }
            RefreshRole::Follower(mut receiver) => loop {
                if let Some(outcome) = *receiver.borrow_and_update() {
                    return outcome;
                }
                if receiver.changed().await.is_err() {
                    // The leader was dropped without publishing. Its guard
                    // clears the slot; sweep here as well in case this task
                    // observed the closed channel first.
                    let mut pending = self.lock_pending();
                    if pending
                        .as_ref()
                        .is_some_and(|stored| stored.same_channel(&receiver))
                    {
                        *pending = None;
                    }
                    return false;
                }
            },
        }
    }

    async fn run_refresh(&self) -> bool {
        let Some(refresh_token) = self.snapshot().refresh_token else {
            tracing::debug!("refresh requested with no refresh token on hand");
            return false;
        };

        match self.provider.refresh(&refresh_token).await {
            Ok(tokens) => {
                let state = CredentialState {
                    access_token: Some(tokens.access_token),
                    refresh_token: Some(tokens.refresh_token),
                    expires_at: tokens.expires_at,
                };
                *self.lock_state() = state.clone();
                self.mirror(&state).await;
                tracing::debug!("credential refresh succeeded");
                true
            }
            Err(err) => {
                tracing::debug!("credential refresh failed: {err:#}");
                false
            }
        }
    }

    async fn mirror(&self, state: &CredentialState) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if let Err(err) = store.put(CREDENTIALS_KEY, state).await {
            // Mirroring is best effort; the in-memory state is already updated.
            tracing::warn!("mirror credentials to durable storage failed: {err:#}");
        }
    }
}
