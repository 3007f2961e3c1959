use std::{error::Error as StdError, sync::Arc};

use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Method, Request, StatusCode, Uri,
    header::{self, HeaderMap, HeaderName, HeaderValue},
};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credentials::CredentialCache;

pub type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;
pub type ProxyHttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;
pub type HttpClient = Client<ProxyHttpsConnector, ProxyBody>;

pub fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

pub fn build_http_client() -> anyhow::Result<HttpClient> {
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

/// Body payload crossing the RPC boundary. Binary payloads travel as base64
/// because the transports are JSON frames that cannot carry raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Payload {
    Json(Value),
    Text(String),
    Base64(String),
    #[default]
    Empty,
}

impl Payload {
    pub fn to_bytes(&self) -> anyhow::Result<Bytes> {
        match self {
            Self::Json(value) => Ok(Bytes::from(
                serde_json::to_vec(value).context("serialize json body")?,
            )),
            Self::Text(text) => Ok(Bytes::from(text.clone().into_bytes())),
            Self::Base64(encoded) => Ok(Bytes::from(
                BASE64.decode(encoded).context("decode base64 body")?,
            )),
            Self::Empty => Ok(Bytes::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "arrayBuffer")]
    ArrayBuffer,
}

/// One proxied request. Transient; exists only for the duration of the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Payload,
    /// Decode preference; inferred from `content-type` when absent.
    #[serde(default)]
    pub response_type: Option<ResponseType>,
    #[serde(default)]
    pub include_headers: bool,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

fn default_method() -> String {
    "GET".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub body: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ProxyResponse {
    fn failure(url: String, status_text: String, correlation_id: Option<String>) -> Self {
        Self {
            ok: false,
            status: 0,
            status_text,
            url,
            headers: None,
            body: Payload::Empty,
            correlation_id,
        }
    }
}

/// Executes outbound requests on behalf of sandboxed callers: attaches the
/// current bearer token, retries exactly once after a single-flight refresh
/// on 401, and converts every failure into a structured response. Transfers
/// are never aborted by the proxy itself; callers needing bounded latency
/// race externally.
pub struct FetchProxy {
    client: HttpClient,
    credentials: Arc<CredentialCache>,
    refresh_url: Option<String>,
}

impl FetchProxy {
    pub fn new(
        client: HttpClient,
        credentials: Arc<CredentialCache>,
        refresh_url: Option<String>,
    ) -> Self {
        Self {
            client,
            credentials,
            refresh_url,
        }
    }

    /// Never fails across the RPC boundary: every error becomes an
    /// `{ok: false, status: 0}` response with a readable `status_text`.
    pub async fn execute(&self, request: ProxyRequest) -> ProxyResponse {
        let url = request.url.clone();
        let correlation_id = request.correlation_id.clone();
        match self.try_execute(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(url = %url, "proxied request failed: {err:#}");
                ProxyResponse::failure(url, format!("{err:#}"), correlation_id)
            }
        }
    }

    async fn try_execute(&self, request: ProxyRequest) -> anyhow::Result<ProxyResponse> {
        let uri: Uri = request.url.parse().context("parse request url")?;
        let method: Method = request
            .method
            .to_ascii_uppercase()
            .parse()
            .context("parse request method")?;
        let body_bytes = request.body.to_bytes()?;

        let token = self.credentials.access_token();
        let response = self
            .send(&request, &uri, &method, body_bytes.clone(), token.as_deref())
            .await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED
            && !self.is_refresh_endpoint(&request.url)
        {
            if self.credentials.refresh().await {
                let refreshed = self.credentials.access_token();
                self.send(&request, &uri, &method, body_bytes, refreshed.as_deref())
                    .await?
            } else {
                // Refresh failed; surface the original 401 unchanged.
                response
            }
        } else {
            response
        };

        self.decode(&request, response).await
    }

    async fn send(
        &self,
        request: &ProxyRequest,
        uri: &Uri,
        method: &Method,
        body: Bytes,
        bearer: Option<&str>,
    ) -> anyhow::Result<hyper::Response<hyper::body::Incoming>> {
        let mut builder = Request::builder().method(method.clone()).uri(uri.clone());
        let headers = builder
            .headers_mut()
            .context("access request header map")?;
        build_headers(headers, &request.headers, bearer)?;

        let outbound = builder
            .body(boxed_full(body))
            .context("build proxied request")?;
        self.client
            .request(outbound)
            .await
            .context("request upstream")
    }

    async fn decode(
        &self,
        request: &ProxyRequest,
        response: hyper::Response<hyper::body::Incoming>,
    ) -> anyhow::Result<ProxyResponse> {
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let headers = request.include_headers.then(|| {
            response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_owned(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect::<Vec<_>>()
        });

        let bytes = response
            .into_body()
            .collect()
            .await
            .context("read response body")?
            .to_bytes();

        let response_type = request
            .response_type
            .unwrap_or_else(|| infer_response_type(content_type.as_deref()));
        let body = decode_body(&bytes, response_type)?;

        Ok(ProxyResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            status_text: status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_owned(),
            url: request.url.clone(),
            headers,
            body,
            correlation_id: request.correlation_id.clone(),
        })
    }

    fn is_refresh_endpoint(&self, url: &str) -> bool {
        self.refresh_url.as_deref() == Some(url)
    }
}

fn build_headers(
    headers: &mut HeaderMap,
    caller_headers: &[(String, String)],
    bearer: Option<&str>,
) -> anyhow::Result<()> {
    for (name, value) in caller_headers {
        let name: HeaderName = name.parse().with_context(|| format!("parse header name `{name}`"))?;
        let value =
            HeaderValue::from_str(value).with_context(|| format!("parse header value for `{name}`"))?;
        headers.append(name, value);
    }

    // The proxy's token only fills in for callers that brought none.
    if let Some(token) = bearer {
        if !headers.contains_key(header::AUTHORIZATION) {
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("build authorization header")?,
            );
        }
    }
    Ok(())
}

/// Responses without a `content-type` decode as binary so no bytes are lost.
fn infer_response_type(content_type: Option<&str>) -> ResponseType {
    let Some(content_type) = content_type else {
        return ResponseType::ArrayBuffer;
    };
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if mime == "application/json" || mime.ends_with("+json") {
        ResponseType::Json
    } else if mime.starts_with("text/") {
        ResponseType::Text
    } else {
        ResponseType::ArrayBuffer
    }
}

fn decode_body(bytes: &[u8], response_type: ResponseType) -> anyhow::Result<Payload> {
    if bytes.is_empty() {
        return Ok(Payload::Empty);
    }
    match response_type {
        ResponseType::Json => {
            let value = serde_json::from_slice(bytes).context("decode response body as json")?;
            Ok(Payload::Json(value))
        }
        ResponseType::Text => {
            let text = String::from_utf8(bytes.to_vec()).context("decode response body as text")?;
            Ok(Payload::Text(text))
        }
        ResponseType::ArrayBuffer => Ok(Payload::Base64(BASE64.encode(bytes))),
    }
}

#[cfg(test)]
mod tests {
    use hyper::header::{self, HeaderMap};
    use serde_json::json;

    use super::{Payload, ResponseType, build_headers, decode_body, infer_response_type};

    #[test]
    fn crypto_provider_installs_idempotently() {
        super::ensure_rustls_crypto_provider().unwrap();
        super::ensure_rustls_crypto_provider().unwrap();
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
    }

    #[test]
    fn content_type_inference_defaults_to_binary() {
        assert_eq!(infer_response_type(None), ResponseType::ArrayBuffer);
        assert_eq!(
            infer_response_type(Some("application/octet-stream")),
            ResponseType::ArrayBuffer
        );
        assert_eq!(
            infer_response_type(Some("application/json; charset=utf-8")),
            ResponseType::Json
        );
        assert_eq!(
            infer_response_type(Some("application/problem+json")),
            ResponseType::Json
        );
        assert_eq!(
            infer_response_type(Some("text/plain; charset=utf-8")),
            ResponseType::Text
        );
    }

    #[test]
    fn bearer_fills_in_only_when_caller_brought_no_authorization() {
        let mut headers = HeaderMap::new();
        build_headers(&mut headers, &[], Some("tok-1")).unwrap();
        assert_eq!(
            headers.get(header::AUTHORIZATION).unwrap(),
            "Bearer tok-1"
        );

        let mut headers = HeaderMap::new();
        build_headers(
            &mut headers,
            &[("Authorization".to_owned(), "Bearer caller".to_owned())],
            Some("tok-1"),
        )
        .unwrap();
        assert_eq!(
            headers.get(header::AUTHORIZATION).unwrap(),
            "Bearer caller"
        );
    }

    #[test]
    fn body_decode_covers_all_response_types() {
        let decoded = decode_body(br#"{"a":1}"#, ResponseType::Json).unwrap();
        assert_eq!(decoded, Payload::Json(json!({"a": 1})));

        let decoded = decode_body(b"plain", ResponseType::Text).unwrap();
        assert_eq!(decoded, Payload::Text("plain".to_owned()));

        let decoded = decode_body(&[0x00, 0xff, 0x10], ResponseType::ArrayBuffer).unwrap();
        assert_eq!(decoded, Payload::Base64("AP8Q".to_owned()));

        let decoded = decode_body(b"", ResponseType::Json).unwrap();
        assert_eq!(decoded, Payload::Empty);
    }

    #[test]
    fn malformed_json_body_is_a_decode_error() {
        let err = decode_body(b"not json", ResponseType::Json).unwrap_err();
        assert!(
            err.to_string().contains("decode response body as json"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn payload_bytes_round_trip() {
        let bytes = Payload::Base64("AP8Q".to_owned()).to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0x00, 0xff, 0x10]);

        let bytes = Payload::Json(json!({"k": "v"})).to_bytes().unwrap();
        assert_eq!(&bytes[..], br#"{"k":"v"}"#);

        assert!(Payload::Empty.to_bytes().unwrap().is_empty());
        assert!(Payload::Base64("!!".to_owned()).to_bytes().is_err());
    }

    #[test]
    fn envelope_serialization_is_camel_case_and_tagged() {
        let request: super::ProxyRequest = serde_json::from_value(json!({
            "url": "https://api.example/items",
            "method": "post",
            "headers": [["content-type", "application/json"]],
            "body": {"kind": "json", "data": {"a": 1}},
            "responseType": "arrayBuffer",
            "includeHeaders": true
        }))
        .unwrap();
        assert_eq!(request.response_type, Some(ResponseType::ArrayBuffer));
        assert!(request.include_headers);
        assert_eq!(request.body, Payload::Json(json!({"a": 1})));
    }
}
