//! Poly / Plantronics headsets through the local REST hub
//!
//! The hub never pushes: two polling loops run while the plugin is registered, one for
//! device presence and one for queued call events.

pub mod client;

use self::client::{CallCommand, SpokesClient};
use crate::core::config::PolyConfig;
use crate::core::error::{HeadsetError, Result};
use crate::core::events::VendorEmitter;
use crate::vendor::call_ids::CallIdTable;
use crate::vendor::{
    label_contains_any, CallInfo, DeviceMetadata, VendorBase, VendorId, VendorImplementation,
    VendorState,
};
use async_trait::async_trait;
use headset_protocol::{spokes_action_name, SpokesCallEvent, SpokesDeviceInfo};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LABEL_KEYWORDS: &[&str] = &["poly", "plantronics"];

struct Inner {
    config: PolyConfig,
    client: Arc<dyn SpokesClient>,
    base: VendorBase,
    calls: Mutex<CallIdTable>,
    /// Plugin session is registered with the hub
    registered: AtomicBool,
    polling: Mutex<Vec<JoinHandle<()>>>,
}

/// REST-polling engine
pub struct PolyHeadset {
    inner: Arc<Inner>,
}

impl PolyHeadset {
    pub fn new(config: PolyConfig, client: Arc<dyn SpokesClient>, emitter: VendorEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                base: VendorBase::new(emitter),
                calls: Mutex::new(CallIdTable::new()),
                registered: AtomicBool::new(false),
                polling: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Relaxed)
    }
}

impl Drop for PolyHeadset {
    fn drop(&mut self) {
        self.inner.stop_polling();
    }
}

#[async_trait]
impl VendorImplementation for PolyHeadset {
    fn vendor(&self) -> VendorId {
        VendorId::Poly
    }

    fn state(&self) -> VendorState {
        self.inner.base.snapshot()
    }

    fn is_supported(&self) -> bool {
        self.inner.config.enabled
    }

    fn device_label_matches_vendor(&self, label: &str) -> bool {
        label_contains_any(label, LABEL_KEYWORDS)
    }

    async fn connect(&self, _device_label: &str) -> Result<()> {
        if self.inner.base.is_connected() {
            debug!("Poly already connected");
            return Ok(());
        }
        self.inner.stop_polling();
        self.inner.base.set_connecting();

        let wait = Duration::from_millis(self.inner.config.connect_timeout_ms);
        let probe = match tokio::time::timeout(wait, self.inner.register_and_probe()).await {
            Ok(probe) => probe,
            Err(_) => {
                self.inner.base.set_disconnected();
                return Err(HeadsetError::ConnectionTimeout {
                    vendor: VendorId::Poly,
                    waited: wait,
                });
            }
        };
        let device = match probe {
            Ok(device) => device,
            Err(e) => {
                self.inner.base.set_disconnected();
                return Err(e.into());
            }
        };

        self.inner.registered.store(true, Ordering::Relaxed);
        self.inner.start_polling();

        match device {
            Some(device) => {
                info!("Poly hub session registered ({})", device.product_name);
                self.inner
                    .base
                    .set_connected(Some(DeviceMetadata::named(device.product_name)));
            }
            None => {
                info!("Poly hub session registered, no device attached yet");
                self.inner.base.set_disconnected();
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.stop_polling();
        if self.inner.registered.swap(false, Ordering::Relaxed) {
            if let Err(e) = self.inner.client.unregister().await {
                warn!("Failed to unregister from the Poly hub: {}", e);
            }
        }
        self.inner.calls.lock().clear();
        self.inner.base.set_disconnected();
        info!("Poly disconnected");
        Ok(())
    }

    async fn incoming_call(&self, info: &CallInfo, _has_other_active_calls: bool) -> Result<()> {
        let call_id = self.inner.calls.lock().assign(&info.conversation_id);
        self.inner
            .command(CallCommand::Incoming {
                call_id,
                contact: info.contact_name.clone(),
            })
            .await
    }

    async fn outgoing_call(&self, info: &CallInfo) -> Result<()> {
        let call_id = self.inner.calls.lock().assign(&info.conversation_id);
        self.inner
            .command(CallCommand::Outgoing {
                call_id,
                contact: info.contact_name.clone(),
            })
            .await
    }

    async fn answer_call(&self, conversation_id: &str, _auto_answer: bool) -> Result<()> {
        let call_id = self.inner.calls.lock().assign(conversation_id);
        self.inner.command(CallCommand::Answer { call_id }).await
    }

    async fn reject_call(&self, conversation_id: &str) -> Result<()> {
        // The hub has no separate reject; terminating a ringing call rejects it
        self.end_call(conversation_id, false).await
    }

    async fn end_call(&self, conversation_id: &str, _has_other_active_calls: bool) -> Result<()> {
        let Some(call_id) = self.inner.calls.lock().release(conversation_id) else {
            debug!("No call id for {}, nothing to end", conversation_id);
            return Ok(());
        };
        self.inner.command(CallCommand::Terminate { call_id }).await
    }

    async fn end_all_calls(&self) -> Result<()> {
        let call_ids: Vec<u32> = {
            let mut calls = self.inner.calls.lock();
            let ids = calls
                .conversation_ids()
                .iter()
                .filter_map(|conversation| calls.call_id(conversation))
                .collect();
            calls.clear();
            ids
        };
        for call_id in call_ids {
            self.inner.command(CallCommand::Terminate { call_id }).await?;
        }
        Ok(())
    }

    async fn set_mute(&self, value: bool) -> Result<()> {
        self.inner.command(CallCommand::Mute { muted: value }).await?;
        self.inner.base.set_muted(value);
        Ok(())
    }

    async fn set_hold(&self, conversation_id: &str, value: bool) -> Result<()> {
        let Some(call_id) = self.inner.calls.lock().call_id(conversation_id) else {
            debug!("No call id for {}, hold ignored", conversation_id);
            return Ok(());
        };
        let command = if value {
            CallCommand::Hold { call_id }
        } else {
            CallCommand::Resume { call_id }
        };
        self.inner.command(command).await?;
        self.inner.base.set_held(value);
        Ok(())
    }
}

impl Inner {
    async fn register_and_probe(&self) -> anyhow::Result<Option<SpokesDeviceInfo>> {
        self.client.register().await?;
        self.client.device_info().await
    }

    async fn command(&self, command: CallCommand) -> Result<()> {
        if !self.registered.load(Ordering::Relaxed) {
            return Err(HeadsetError::NotConnected);
        }
        debug!("-> {:?}", command);
        self.client.call_command(&command).await?;
        Ok(())
    }

    // ── Polling ───────────────────────────────────────────────────

    fn start_polling(self: &Arc<Self>) {
        let device_poll = tokio::spawn(run_device_poll(Arc::clone(self)));
        let call_poll = tokio::spawn(run_call_poll(Arc::clone(self)));
        self.polling.lock().extend([device_poll, call_poll]);
    }

    fn stop_polling(&self) {
        for task in self.polling.lock().drain(..) {
            task.abort();
        }
    }

    async fn poll_device(&self) {
        match self.client.device_info().await {
            Ok(Some(device)) => {
                if !self.base.is_connected() {
                    info!("Poly device attached: {}", device.product_name);
                    self.base
                        .set_connected(Some(DeviceMetadata::named(device.product_name)));
                }
            }
            Ok(None) => {
                if self.base.is_connected() {
                    info!("Poly device detached");
                    self.base.set_disconnected();
                }
            }
            Err(e) => debug!("Device poll failed: {}", e),
        }
    }

    async fn poll_calls(&self) {
        match self.client.call_events().await {
            Ok(events) => {
                for event in events {
                    self.handle_call_event(event);
                }
            }
            Err(e) => debug!("Call event poll failed: {}", e),
        }
    }

    fn handle_call_event(&self, event: SpokesCallEvent) {
        let Some(action) = spokes_action_name(event.action) else {
            debug!("Ignoring call action {}", event.action);
            return;
        };
        let emitter = self.base.emitter();
        let conversation = self.calls.lock().conversation_id(event.call_id.id);
        debug!("<- {} for call {} ({:?})", action, event.call_id.id, conversation);

        match action {
            "AcceptCall" | "RejectCall" | "TerminateCall" | "CallEnded" => {
                let Some(id) = conversation else {
                    debug!("{} for unknown call {}", action, event.call_id.id);
                    return;
                };
                match action {
                    "AcceptCall" => emitter.answered(action, &id),
                    "RejectCall" => {
                        self.calls.lock().release(&id);
                        emitter.rejected(action, &id);
                    }
                    _ => {
                        self.calls.lock().release(&id);
                        emitter.ended(action, &id);
                    }
                }
            }
            "Mute" | "Unmute" => {
                let muted = action == "Mute";
                self.base.set_muted(muted);
                emitter.mute_changed(muted, action, conversation.as_deref());
            }
            "HoldCall" | "ResumeCall" => {
                let held = action == "HoldCall";
                self.base.set_held(held);
                emitter.hold_changed(held, action, conversation.as_deref());
            }
            _ => debug!("Ignoring call action {}", action),
        }
    }
}

/// Device presence loop. Runs while registered, including while no device is attached.
async fn run_device_poll(inner: Arc<Inner>) {
    let interval = Duration::from_millis(inner.config.device_poll_interval_ms);
    loop {
        tokio::time::sleep(interval).await;
        if inner.registered.load(Ordering::Relaxed) {
            inner.poll_device().await;
        }
    }
}

/// Call event loop. Idle while no device is attached.
async fn run_call_poll(inner: Arc<Inner>) {
    let interval = Duration::from_millis(inner.config.call_poll_interval_ms);
    loop {
        tokio::time::sleep(interval).await;
        if inner.registered.load(Ordering::Relaxed) && inner.base.is_connected() {
            inner.poll_calls().await;
        }
    }
}
