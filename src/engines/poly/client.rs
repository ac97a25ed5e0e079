//! HTTP client for the vendor's local REST hub

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use headset_protocol::{
    spokes_call_id_param, spokes_contact_param, SpokesCallEvent, SpokesDeviceInfo, SpokesResponse,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Call commands accepted by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    Incoming { call_id: u32, contact: Option<String> },
    Outgoing { call_id: u32, contact: Option<String> },
    Answer { call_id: u32 },
    Terminate { call_id: u32 },
    Mute { muted: bool },
    Hold { call_id: u32 },
    Resume { call_id: u32 },
}

impl CallCommand {
    pub fn endpoint(&self) -> &'static str {
        match self {
            CallCommand::Incoming { .. } => "IncomingCall",
            CallCommand::Outgoing { .. } => "OutgoingCall",
            CallCommand::Answer { .. } => "AnswerCall",
            CallCommand::Terminate { .. } => "TerminateCall",
            CallCommand::Mute { .. } => "MuteCall",
            CallCommand::Hold { .. } => "HoldCall",
            CallCommand::Resume { .. } => "ResumeCall",
        }
    }

    /// Query parameters besides the plugin name
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        match self {
            CallCommand::Incoming { call_id, contact } | CallCommand::Outgoing { call_id, contact } => {
                params.push(("callID", spokes_call_id_param(*call_id)));
                if let Some(name) = contact {
                    params.push(("contact", spokes_contact_param(name)));
                }
                params.push(("route", "ToHeadset".to_string()));
            }
            CallCommand::Answer { call_id }
            | CallCommand::Terminate { call_id }
            | CallCommand::Hold { call_id }
            | CallCommand::Resume { call_id } => {
                params.push(("callID", spokes_call_id_param(*call_id)));
            }
            CallCommand::Mute { muted } => params.push(("muted", muted.to_string())),
        }
        params
    }
}

#[async_trait]
pub trait SpokesClient: Send + Sync {
    async fn register(&self) -> Result<()>;
    async fn unregister(&self) -> Result<()>;
    /// Attached device, `None` when the hub reports no device
    async fn device_info(&self) -> Result<Option<SpokesDeviceInfo>>;
    async fn call_command(&self, command: &CallCommand) -> Result<()>;
    /// Drain queued call events
    async fn call_events(&self) -> Result<Vec<SpokesCallEvent>>;
}

/// reqwest-backed hub client
pub struct HttpSpokesClient {
    base_url: String,
    plugin_name: String,
    client: reqwest::Client,
}

impl HttpSpokesClient {
    pub fn new(base_url: &str, plugin_name: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to configure HTTP client ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            plugin_name: plugin_name.to_string(),
            client,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<SpokesResponse<T>> {
        let url = format!("{}/Spokes/{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .query(&[("name", self.plugin_name.as_str())])
            .query(params)
            .send()
            .await
            .with_context(|| format!("Failed to reach hub at {}", url))?;

        if !response.status().is_success() {
            return Err(anyhow!("Hub returned error status: {}", response.status()));
        }

        response
            .json::<SpokesResponse<T>>()
            .await
            .context("Failed to parse hub response")
    }
}

fn error_text<T>(response: &SpokesResponse<T>) -> String {
    response
        .err
        .as_ref()
        .map(|e| e.description.clone())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| response.description.clone())
}

#[async_trait]
impl SpokesClient for HttpSpokesClient {
    async fn register(&self) -> Result<()> {
        let response: SpokesResponse<bool> = self.get("SessionManager/Register", &[]).await?;
        if response.is_error {
            let text = error_text(&response);
            // Left over from a previous run
            if text.to_lowercase().contains("already") {
                debug!("Plugin already registered");
                return Ok(());
            }
            return Err(anyhow!("Register failed: {}", text));
        }
        Ok(())
    }

    async fn unregister(&self) -> Result<()> {
        let response: SpokesResponse<bool> = self.get("SessionManager/UnRegister", &[]).await?;
        if response.is_error {
            return Err(anyhow!("UnRegister failed: {}", error_text(&response)));
        }
        Ok(())
    }

    async fn device_info(&self) -> Result<Option<SpokesDeviceInfo>> {
        let response: SpokesResponse<SpokesDeviceInfo> = self.get("DeviceServices/Info", &[]).await?;
        if response.is_error {
            debug!("No device: {}", error_text(&response));
            return Ok(None);
        }
        Ok(response.result)
    }

    async fn call_command(&self, command: &CallCommand) -> Result<()> {
        let path = format!("CallServices/{}", command.endpoint());
        let response: SpokesResponse<bool> = self.get(&path, &command.params()).await?;
        if response.is_error {
            return Err(anyhow!("{} failed: {}", command.endpoint(), error_text(&response)));
        }
        Ok(())
    }

    async fn call_events(&self) -> Result<Vec<SpokesCallEvent>> {
        let response: SpokesResponse<Vec<SpokesCallEvent>> =
            self.get("CallServices/CallEvents", &[]).await?;
        if response.is_error {
            return Err(anyhow!("CallEvents failed: {}", error_text(&response)));
        }
        Ok(response.result.unwrap_or_default())
    }
}
