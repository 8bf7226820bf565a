//! Per-session reverse proxy.
//!
//! A [`SessionProxy`] is opened once the session container answers its
//! readiness check and closed on teardown. Closing only flips a flag: new
//! requests are refused immediately, in-flight ones are not drained.

use axum::body::Body;
use axum::extract::ws::WebSocket;
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, header};
use futures::{SinkExt, StreamExt};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

pub type ProxyClient = Client<HttpConnector, Body>;

pub fn build_proxy_client() -> ProxyClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [header::HeaderName; 6] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

/// Enforce a body size limit based on Content-Length header.
pub fn enforce_proxy_body_limit(
    headers: &HeaderMap,
    max_body_bytes: usize,
) -> Result<(), StatusCode> {
    if let Some(value) = headers.get(header::CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or(StatusCode::BAD_REQUEST)?;
        if length > max_body_bytes {
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
    }
    Ok(())
}

pub struct SessionProxy {
    access_code: String,
    /// `host:port` of the app inside the session container.
    target: String,
    client: ProxyClient,
    max_body_bytes: usize,
    open: AtomicBool,
}

impl std::fmt::Debug for SessionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProxy")
            .field("access_code", &self.access_code)
            .field("target", &self.target)
            .field("open", &self.is_open())
            .finish()
    }
}

impl SessionProxy {
    pub fn open(
        access_code: impl Into<String>,
        target: impl Into<String>,
        client: ProxyClient,
        max_body_bytes: usize,
    ) -> Arc<Self> {
        let proxy = Self {
            access_code: access_code.into(),
            target: target.into(),
            client,
            max_body_bytes,
            open: AtomicBool::new(true),
        };
        info!(
            "Proxy opened for session {} -> {}",
            proxy.access_code, proxy.target
        );
        Arc::new(proxy)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Refuse new traffic from now on.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!(
                "Proxy closed for session {} -> {}",
                self.access_code, self.target
            );
        }
    }

    /// Forward one HTTP request to the session and return its response.
    ///
    /// Transport failures are logged and mapped to 502; they never affect the
    /// session itself.
    pub async fn forward_http(&self, req: Request<Body>) -> Result<Response<Body>, StatusCode> {
        if !self.is_open() {
            debug!("Refusing request for closed proxy {}", self.access_code);
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target_uri = format!("http://{}{}", self.target, path_and_query);
        debug!("Proxying request to {}", target_uri);

        let uri: Uri = target_uri.parse().map_err(|e| {
            error!("Invalid target URI {}: {:?}", target_uri, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

        let (parts, body) = req.into_parts();
        enforce_proxy_body_limit(&parts.headers, self.max_body_bytes)?;
        let body_bytes = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| {
                if e.to_string().contains("length limit") {
                    warn!(
                        "Proxy request body for session {} exceeded limit of {} bytes",
                        self.access_code, self.max_body_bytes
                    );
                    return StatusCode::PAYLOAD_TOO_LARGE;
                }
                error!("Failed to buffer proxy request body: {:?}", e);
                StatusCode::BAD_GATEWAY
            })?;

        let mut forwarded = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .version(parts.version)
            .body(Body::from(body_bytes.clone()))
            .map_err(|e| {
                error!("Failed to build proxy request: {:?}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?;

        let headers = forwarded.headers_mut();
        *headers = parts.headers.clone();
        for name in HOP_BY_HOP.iter() {
            headers.remove(name);
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_bytes.len()));
        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));

        // Host must match the target authority.
        let host = HeaderValue::from_str(&self.target).map_err(|e| {
            error!("Invalid Host header value {}: {:?}", self.target, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        headers.insert(header::HOST, host);

        match self.client.request(forwarded).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(parts, Body::new(body)))
            }
            Err(err) => {
                warn!(
                    "Proxy transport error for session {} -> {}: {:?}",
                    self.access_code, self.target, err
                );
                Err(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Relay an upgraded client socket to the same path on the session.
    pub async fn forward_upgrade(
        &self,
        client_socket: WebSocket,
        path_and_query: &str,
        cookie: Option<String>,
    ) -> anyhow::Result<()> {
        use axum::extract::ws::Message as AxumMessage;
        use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

        if !self.is_open() {
            anyhow::bail!("proxy for session {} is closed", self.access_code);
        }

        let target_url = format!("ws://{}{}", self.target, path_and_query);
        let mut request = target_url.as_str().into_client_request()?;
        if let Some(cookie) = cookie {
            request
                .headers_mut()
                .insert(header::COOKIE, HeaderValue::from_str(&cookie)?);
        }

        let (server_socket, _) = connect_async(request).await?;
        info!(
            "WebSocket upgrade relayed for session {} -> {}",
            self.access_code, target_url
        );

        let (mut client_tx, mut client_rx) = client_socket.split();
        let (mut server_tx, mut server_rx) = server_socket.split();

        let client_to_server = async {
            while let Some(msg) = client_rx.next().await {
                let msg = msg?;
                let forward = match msg {
                    AxumMessage::Text(text) => TungsteniteMessage::Text(text.to_string().into()),
                    AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
                    AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
                    AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
                    AxumMessage::Close(_) => TungsteniteMessage::Close(None),
                };
                server_tx.send(forward).await?;
            }
            Ok::<(), anyhow::Error>(())
        };

        let server_to_client = async {
            while let Some(msg) = server_rx.next().await {
                let msg = msg?;
                let forward = match msg {
                    TungsteniteMessage::Text(text) => AxumMessage::Text(text.to_string().into()),
                    TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
                    TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
                    TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
                    TungsteniteMessage::Close(_) => AxumMessage::Close(None),
                    TungsteniteMessage::Frame(_) => continue,
                };
                client_tx.send(forward).await?;
            }
            Ok::<(), anyhow::Error>(())
        };

        tokio::select! {
            result = client_to_server => result?,
            result = server_to_client => result?,
        }

        debug!("WebSocket relay finished for session {}", self.access_code);
        Ok(())
    }
}
