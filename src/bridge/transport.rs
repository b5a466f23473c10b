//! Control-plane channel: commands in, events out, over one WebSocket.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::protocol::{BridgeEvent, Command};

/// Destination for outbound bridge events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: BridgeEvent) -> Result<()>;
}

/// [`EventSink`] feeding an in-process channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: BridgeEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow::anyhow!("event channel closed"))
    }
}

/// Connection settings for the control-plane WebSocket.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub control_plane_url: String,
    pub session_id: String,
    pub sandbox_id: String,
    pub auth_token: String,
}

/// `<control plane>/sessions/<session>/ws?type=sandbox` with a ws(s) scheme.
pub fn websocket_url(control_plane_url: &str, session_id: &str) -> Result<Url> {
    let mut url = Url::parse(control_plane_url)
        .with_context(|| format!("Invalid control plane URL: {control_plane_url}"))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot use {scheme} scheme for {control_plane_url}"))?;
    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base}/sessions/{session_id}/ws"));
    url.set_query(Some("type=sandbox"));
    Ok(url)
}

/// Decode one text frame. Malformed frames are dropped.
pub fn decode_command(text: &str) -> Option<Command> {
    match serde_json::from_str::<Command>(text) {
        Ok(command) => Some(command),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed command frame");
            None
        }
    }
}

/// Open WebSocket to the control plane, split into a command stream and an
/// event sink.
pub struct WebSocketChannel {
    pub sink: WebSocketSink,
    pub commands: BoxStream<'static, Command>,
    writer: JoinHandle<()>,
}

/// Serializes events onto the socket through the channel's writer task.
#[derive(Clone)]
pub struct WebSocketSink {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl EventSink for WebSocketSink {
    async fn send(&self, event: BridgeEvent) -> Result<()> {
        let text = serde_json::to_string(&event).context("Failed to encode event")?;
        self.tx
            .send(Message::Text(text))
            .await
            .map_err(|_| anyhow::anyhow!("control plane connection closed"))
    }
}

impl WebSocketChannel {
    pub async fn connect(config: &ChannelConfig) -> Result<Self> {
        let url = websocket_url(&config.control_plane_url, &config.session_id)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .context("Failed to build WebSocket request")?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", config.auth_token))
                .context("Auth token is not a valid header value")?,
        );
        headers.insert(
            "X-Sandbox-ID",
            HeaderValue::from_str(&config.sandbox_id)
                .context("Sandbox id is not a valid header value")?,
        );

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to {}/sessions/{}/ws",
                    config.control_plane_url, config.session_id
                )
            })?;
        info!(session_id = %config.session_id, "Connected to control plane");

        let (mut ws_sink, ws_stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_sink.send(message).await {
                    warn!(error = %e, "Failed to write to control plane");
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        let commands = ws_stream
            .take_while(|frame| {
                let open = match frame {
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "Control plane closed the connection");
                        false
                    }
                    Ok(_) => true,
                    Err(e) => {
                        warn!(error = %e, "Control plane connection failed");
                        false
                    }
                };
                futures::future::ready(open)
            })
            .filter_map(|frame| {
                let command = match frame {
                    Ok(Message::Text(text)) => decode_command(&text),
                    Ok(Message::Binary(data)) => {
                        debug!(len = data.len(), "Ignoring binary frame");
                        None
                    }
                    _ => None,
                };
                futures::future::ready(command)
            })
            .boxed();

        Ok(Self {
            sink: WebSocketSink { tx },
            commands,
            writer,
        })
    }

    /// Flush queued events and close the socket.
    pub async fn close(self) {
        let Self { sink, commands, writer } = self;
        drop(commands);
        drop(sink);
        if let Err(e) = writer.await {
            warn!(error = %e, "Control plane writer task failed");
        }
    }
}
