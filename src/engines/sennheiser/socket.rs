//! Text-frame socket to the vendor's local SDK service

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// An open socket: frames to send, frames received.
/// The inbound stream ends when the connection closes.
pub struct SocketChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn open(&self, url: &str) -> Result<SocketChannel>;
}

/// WebSocket transport over tokio-tungstenite
pub struct WebSocketFactory;

#[async_trait]
impl SocketFactory for WebSocketFactory {
    async fn open(&self, url: &str) -> Result<SocketChannel> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        info!("Connected to {}", url);

        let (mut ws_sink, mut ws_stream_rx) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        // Forward outgoing frames to the WebSocket
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sink.close().await;
            debug!("WS writer stopped");
        });

        // Read incoming frames
        tokio::spawn(async move {
            loop {
                match ws_stream_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("SDK closed WS connection");
                        break;
                    }
                    Some(Ok(_)) => {} // Ignore binary/ping/pong
                    Some(Err(e)) => {
                        warn!("WS read error: {}", e);
                        break;
                    }
                    None => {
                        info!("WS stream ended");
                        break;
                    }
                }
            }
        });

        Ok(SocketChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
