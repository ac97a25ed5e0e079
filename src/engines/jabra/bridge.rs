//! Native desktop host speaking length-prefixed JSON over stdio

use anyhow::{Context, Result};
use async_trait::async_trait;
use headset_protocol::{bridge_frame_len, encode_bridge_frame, BridgeMessage, BridgeRequest};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// An open bridge. The inbound stream ends when the host exits.
pub struct BridgeChannel {
    pub outbound: mpsc::UnboundedSender<BridgeRequest>,
    pub inbound: mpsc::UnboundedReceiver<BridgeMessage>,
}

#[async_trait]
pub trait NativeBridge: Send + Sync {
    async fn open(&self) -> Result<BridgeChannel>;
}

/// Spawns the vendor's native host as a child process
pub struct ProcessBridge {
    command: String,
    args: Vec<String>,
}

impl ProcessBridge {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl NativeBridge for ProcessBridge {
    async fn open(&self) -> Result<BridgeChannel> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn native host {}", self.command))?;
        info!("Spawned native host {} (pid {:?})", self.command, child.id());

        let mut stdin = child.stdin.take().context("Native host has no stdin")?;
        let mut stdout = child.stdout.take().context("Native host has no stdout")?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<BridgeRequest>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<BridgeMessage>();

        // Frame outgoing requests onto stdin
        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let payload = match serde_json::to_vec(&request) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode bridge request: {}", e);
                        continue;
                    }
                };
                let frame = encode_bridge_frame(&payload);
                if stdin.write_all(&frame).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
            debug!("Bridge writer stopped");
        });

        // Read framed messages from stdout; the child lives as long as this task
        tokio::spawn(async move {
            loop {
                let mut header = [0u8; 4];
                if stdout.read_exact(&mut header).await.is_err() {
                    break;
                }
                let Some(len) = bridge_frame_len(header) else {
                    warn!("Oversized bridge frame, closing");
                    break;
                };
                let mut payload = vec![0u8; len];
                if stdout.read_exact(&mut payload).await.is_err() {
                    break;
                }
                match serde_json::from_slice::<BridgeMessage>(&payload) {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Ignoring undecodable bridge message: {}", e),
                }
            }
            info!("Native host stream ended");
            let _ = child.kill().await;
        });

        Ok(BridgeChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
