//! Outbound editor tunnel.
//!
//! In developer mode the platform reaches the local editor through a
//! connection the device initiates. This crate owns connection establishment
//! and the affinity used to land repeat connections on the same platform
//! instance; the relayed editor traffic itself is opaque to the agent.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid editor endpoint: {0}")]
    Endpoint(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Outbound editor tunnel façade.
#[async_trait]
pub trait Tunnel: Send + Sync + 'static {
    /// Open the tunnel with the given access token. `Ok(false)` means the
    /// platform refused the dial; the caller reports that in its command
    /// response.
    async fn connect(&self, token: &str) -> Result<bool, TunnelError>;

    async fn close(&self);

    /// Affinity captured from the last successful connect.
    async fn affinity(&self) -> Option<String>;
}

// ── EditorTunnel ──────────────────────────────────────────────────────────────

struct Inner {
    affinity: Option<String>,
    cancel: Option<CancellationToken>,
}

/// WebSocket-backed tunnel to the platform editor endpoint.
pub struct EditorTunnel {
    forge_url: String,
    device_id: String,
    inner: Mutex<Inner>,
}

impl EditorTunnel {
    pub fn new(forge_url: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            forge_url: forge_url.into(),
            device_id: device_id.into(),
            inner: Mutex::new(Inner {
                affinity: None,
                cancel: None,
            }),
        }
    }

    /// Seed the affinity persisted in the assignment record so a reconnect
    /// after restart lands on the same platform instance.
    pub async fn set_affinity(&self, affinity: Option<String>) {
        self.inner.lock().await.affinity = affinity;
    }
}

/// `https://forge.example.com` → `wss://forge.example.com/api/v1/devices/<id>/editor/comms/<token>`
fn editor_endpoint(forge_url: &str, device_id: &str, token: &str) -> Result<String, TunnelError> {
    let ws_base = if let Some(rest) = forge_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = forge_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(TunnelError::Endpoint(format!(
            "unsupported scheme in {forge_url}"
        )));
    };
    Ok(format!(
        "{}/api/v1/devices/{}/editor/comms/{}",
        ws_base.trim_end_matches('/'),
        device_id,
        token
    ))
}

/// First cookie pair of a `set-cookie` header, e.g. `FFSESSION=abc`.
fn affinity_from_cookie(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    if pair.contains('=') {
        Some(pair.to_string())
    } else {
        None
    }
}

#[async_trait]
impl Tunnel for EditorTunnel {
    async fn connect(&self, token: &str) -> Result<bool, TunnelError> {
        self.close().await;

        let url = editor_endpoint(&self.forge_url, &self.device_id, token)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TunnelError::Endpoint(e.to_string()))?;

        if let Some(affinity) = self.inner.lock().await.affinity.clone() {
            if let Ok(value) = affinity.parse() {
                request.headers_mut().insert("cookie", value);
            }
        }

        let (ws, response) = match tokio_tungstenite::connect_async(request).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "editor tunnel dial failed");
                return Ok(false);
            }
        };

        let cancel = CancellationToken::new();
        {
            let mut inner = self.inner.lock().await;
            if let Some(affinity) = response
                .headers()
                .get("set-cookie")
                .and_then(|v| v.to_str().ok())
                .and_then(affinity_from_cookie)
            {
                inner.affinity = Some(affinity);
            }
            inner.cancel = Some(cancel.clone());
        }
        info!(device = %self.device_id, "editor tunnel connected");

        let (mut sink, mut stream) = ws.split();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = sink.close().await;
                        break;
                    }
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("editor tunnel closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "editor tunnel read error");
                            break;
                        }
                    }
                }
            }
        });

        Ok(true)
    }

    async fn close(&self) {
        let cancel = self.inner.lock().await.cancel.take();
        if let Some(cancel) = cancel {
            debug!("closing editor tunnel");
            cancel.cancel();
        }
    }

    async fn affinity(&self) -> Option<String> {
        self.inner.lock().await.affinity.clone()
    }
}
