use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use http_body_util::BodyExt as _;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, header, service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::{
    config::Config,
    correlator::{Correlator, LifecycleSignal},
    credentials::{CredentialCache, HttpIdentityProvider, IdentityProvider, TokenSet},
    fetch::{
        FetchProxy, ProxyBody, boxed_full, build_http_client, ensure_rustls_crypto_provider,
    },
    registry::SessionRegistry,
    rpc::{Envelope, FrontDoor, ResponseEnvelope},
    store::{ChunkedStore, KeyValueStore, MemoryStore, SqliteStore},
};

const BRIDGE_REPLY_BUFFER: usize = 32;

#[derive(Debug)]
pub struct ServerHandle {
    pub listen_addr: SocketAddr,
    pub bridge_addr: Option<SocketAddr>,
    signals: mpsc::Sender<LifecycleSignal>,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    bridge_shutdown_tx: Option<oneshot::Sender<()>>,
    bridge_join: Option<tokio::task::JoinHandle<()>>,
    correlator_join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Sender feeding the correlator loop. The embedder bridges its network
    /// observation source into this channel; when the buffer is full the send
    /// awaits rather than dropping signals.
    pub fn signals(&self) -> mpsc::Sender<LifecycleSignal> {
        self.signals.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Some(bridge_shutdown_tx) = self.bridge_shutdown_tx {
            let _ = bridge_shutdown_tx.send(());
        }
        // Dropping the last signal sender ends the correlator loop.
        drop(self.signals);
        let _ = self.join.await;
        if let Some(bridge_join) = self.bridge_join {
            let _ = bridge_join.await;
        }
        let _ = self.correlator_join.await;
    }
}

/// Placeholder provider used when no identity endpoint is configured: every
/// refresh fails cleanly, so proxied 401s pass through to the caller.
struct DisabledIdentityProvider;

#[async_trait]
impl IdentityProvider for DisabledIdentityProvider {
    async fn refresh(&self, _refresh_token: &str) -> anyhow::Result<TokenSet> {
        anyhow::bail!("no identity provider configured")
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<ServerHandle> {
    ensure_rustls_crypto_provider()?;

    let store: Arc<dyn KeyValueStore> = match config.storage.as_ref() {
        Some(storage) => Arc::new(SqliteStore::open(
            storage.path.clone(),
            storage.item_size_limit,
        )?),
        None => {
            tracing::warn!(
                "no durable storage configured; capture history will not survive restarts"
            );
            Arc::new(MemoryStore::new(config.item_size_limit()))
        }
    };
    let chunked = ChunkedStore::new(store, config.chunk_size());
    let bytes_in_use = chunked.bytes_in_use().await.context("inspect storage usage")?;
    tracing::info!(bytes_in_use, "key/value store ready");

    let client = build_http_client()?;
    let refresh_url = config.auth.as_ref().map(|auth| auth.refresh_url.clone());
    let provider: Arc<dyn IdentityProvider> = match refresh_url.as_deref() {
        Some(url) => {
            let uri = url
                .parse()
                .with_context(|| format!("parse auth.refresh_url `{url}`"))?;
            Arc::new(HttpIdentityProvider::new(client.clone(), uri))
        }
        None => {
            tracing::warn!("no auth.refresh_url configured; credential refresh is disabled");
            Arc::new(DisabledIdentityProvider)
        }
    };
    let credentials = Arc::new(CredentialCache::new(provider, Some(chunked.clone())));
    credentials
        .load_persisted()
        .await
        .context("rehydrate persisted credentials")?;

    let fetch = Arc::new(FetchProxy::new(client, credentials, refresh_url));
    let registry = Arc::new(SessionRegistry::new(chunked));
    let recovered = registry.resume().await.context("resume session registry")?;
    if !recovered.is_empty() {
        tracing::info!(sessions = recovered.len(), "recovered durable session histories");
    }

    let (signal_tx, signal_rx) = mpsc::channel(config.signal_buffer());
    let correlator_join = tokio::spawn(Correlator::new(Arc::clone(&registry)).run(signal_rx));

    let front_door = Arc::new(FrontDoor::new(fetch, registry));

    let listener = TcpListener::bind(config.server.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", config.server.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let rpc_front_door = Arc::clone(&front_door);
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let front_door = Arc::clone(&rpc_front_door);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            rpc_handler(req, Arc::clone(&front_door))
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("rpc connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    let (bridge_addr, bridge_shutdown_tx, bridge_join) = match config.server.bridge_port {
        Some(port) => {
            let bridge_bind = SocketAddr::new(config.server.listen.ip(), port);
            let bridge_listener = TcpListener::bind(bridge_bind)
                .await
                .map_err(|err| anyhow::anyhow!("bind bridge {bridge_bind}: {err}"))?;
            let bridge_addr = bridge_listener
                .local_addr()
                .map_err(|err| anyhow::anyhow!("get bridge local_addr: {err}"))?;

            let (bridge_shutdown_tx, mut bridge_shutdown_rx) = oneshot::channel::<()>();
            let bridge_front_door = Arc::clone(&front_door);
            let bridge_join = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut bridge_shutdown_rx => break,
                        accept = bridge_listener.accept() => {
                            let Ok((stream, peer)) = accept else { continue };
                            tracing::debug!(%peer, "bridge channel opened");
                            let front_door = Arc::clone(&bridge_front_door);
                            tokio::spawn(handle_bridge_connection(stream, front_door));
                        }
                    }
                }
            });
            (Some(bridge_addr), Some(bridge_shutdown_tx), Some(bridge_join))
        }
        None => (None, None, None),
    };

    Ok(ServerHandle {
        listen_addr,
        bridge_addr,
        signals: signal_tx,
        shutdown_tx,
        join,
        bridge_shutdown_tx,
        bridge_join,
        correlator_join,
    })
}

async fn rpc_handler(
    req: Request<Incoming>,
    front_door: Arc<FrontDoor>,
) -> Result<Response<ProxyBody>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => json_response(StatusCode::OK, r#"{"status":"ok"}"#.to_owned()),
        (&Method::POST, "/rpc") => {
            let envelope = match req.into_body().collect().await {
                Ok(collected) => serde_json::from_slice::<Envelope>(&collected.to_bytes())
                    .map_err(|err| format!("parse rpc envelope: {err}")),
                Err(err) => Err(format!("read rpc request body: {err}")),
            };
            let reply = match envelope {
                Ok(envelope) => front_door.handle(envelope).await,
                Err(error) => ResponseEnvelope {
                    success: false,
                    data: None,
                    error: Some(error),
                },
            };
            match serde_json::to_string(&reply) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(err) => json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!(r#"{{"success":false,"error":"encode rpc response: {err}"}}"#),
                ),
            }
        }
        _ => json_response(
            StatusCode::NOT_FOUND,
            r#"{"success":false,"error":"not found"}"#.to_owned(),
        ),
    };
    Ok(response)
}

fn json_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

/// One bridge connection: newline-delimited JSON frames in, reply lines out.
/// Each frame is handled on its own task so a slow fetch never blocks the
/// frames queued behind it; replies are funneled through one writer task.
async fn handle_bridge_connection(stream: TcpStream, front_door: Arc<FrontDoor>) {
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, LinesCodec::new());
    let mut sink = FramedWrite::new(write_half, LinesCodec::new());

    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(BRIDGE_REPLY_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(line) = reply_rx.recv().await {
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!("bridge read error: {err}");
                break;
            }
        };
        let front_door = Arc::clone(&front_door);
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let reply = front_door.handle_frame(&frame).await;
            let _ = reply_tx.send(reply).await;
        });
    }

    drop(reply_tx);
    let _ = writer.await;
    tracing::debug!("bridge channel closed");
}
