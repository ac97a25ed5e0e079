//! Yealink USB headsets driven over raw HID reports

pub mod state_machine;

use self::state_machine::{transition, CallEvent, CallState, Effect};
use crate::core::config::YealinkConfig;
use crate::core::error::{HeadsetError, Result};
use crate::core::events::VendorEmitter;
use crate::hid::{DeviceFilter, HidDeviceInfo, HidProvider, HidWriter, InputReport};
use crate::vendor::{
    label_contains_any, Capabilities, CallInfo, DeviceMetadata, VendorBase, VendorId,
    VendorImplementation, VendorState,
};
use async_trait::async_trait;
use headset_protocol::{ButtonCode, ChipProfile, DeviceStatus, FLAG_HOLD, FLAG_HOOK, FLAG_MUTE, FLAG_RING};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LABEL_KEYWORDS: &[&str] = &["yealink"];

/// Per-connection engine state
#[derive(Default)]
struct DeviceState {
    call_state: CallState,
    status: DeviceStatus,
    /// Chip constants, known once a device is open
    profile: Option<&'static ChipProfile>,
    conversation_id: Option<String>,
    muted: bool,
    held: bool,
}

struct Inner {
    config: YealinkConfig,
    provider: Arc<dyn HidProvider>,
    base: VendorBase,
    device: Mutex<DeviceState>,
    /// Open device. Held across each write so only one is in flight.
    writer: tokio::sync::Mutex<Option<Box<dyn HidWriter>>>,
    /// Input report task
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Binary-HID headset engine
pub struct YealinkHeadset {
    inner: Arc<Inner>,
}

impl YealinkHeadset {
    pub fn new(config: YealinkConfig, provider: Arc<dyn HidProvider>, emitter: VendorEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                provider,
                base: VendorBase::new(emitter),
                device: Mutex::new(DeviceState::default()),
                writer: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn call_state(&self) -> CallState {
        self.inner.device.lock().call_state
    }

    /// Status bitmask last written to the device
    pub fn device_status(&self) -> u16 {
        self.inner.device.lock().status.bits()
    }
}

impl Drop for YealinkHeadset {
    fn drop(&mut self) {
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl VendorImplementation for YealinkHeadset {
    fn vendor(&self) -> VendorId {
        VendorId::Yealink
    }

    fn state(&self) -> VendorState {
        self.inner.base.snapshot()
    }

    fn capabilities(&self) -> Capabilities {
        let profile = self.inner.device.lock().profile;
        Capabilities {
            supports_hold: profile.map_or(true, |p| p.supports(FLAG_HOLD)),
        }
    }

    fn is_supported(&self) -> bool {
        self.inner.config.enabled && self.inner.provider.is_available()
    }

    fn device_label_matches_vendor(&self, label: &str) -> bool {
        label_contains_any(label, LABEL_KEYWORDS)
    }

    async fn connect(&self, device_label: &str) -> Result<()> {
        if self.inner.base.is_connected() {
            debug!("Yealink already connected");
            return Ok(());
        }
        self.inner.base.set_connecting();
        if let Err(e) = self.inner.open_device(device_label).await {
            self.inner.base.set_disconnected();
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.close_device().await;
        info!("Yealink disconnected");
        Ok(())
    }

    async fn incoming_call(&self, info: &CallInfo, _has_other_active_calls: bool) -> Result<()> {
        {
            let mut device = self.inner.device.lock();
            if device.call_state != CallState::Idle {
                debug!(
                    "Device busy ({:?}), not ringing for {}",
                    device.call_state, info.conversation_id
                );
                return Ok(());
            }
            device.conversation_id = Some(info.conversation_id.clone());
        }
        self.inner.apply(CallEvent::IncomingCall).await
    }

    async fn outgoing_call(&self, info: &CallInfo) -> Result<()> {
        {
            let mut device = self.inner.device.lock();
            if device.call_state != CallState::Idle {
                debug!("Device busy ({:?}), ignoring outgoing call", device.call_state);
                return Ok(());
            }
            device.conversation_id = Some(info.conversation_id.clone());
        }
        self.inner.apply(CallEvent::OutgoingCall).await?;
        self.inner.update_device_status(FLAG_HOOK, true).await
    }

    async fn answer_call(&self, conversation_id: &str, _auto_answer: bool) -> Result<()> {
        let ringing = {
            let mut device = self.inner.device.lock();
            if device.call_state == CallState::Idle {
                device.conversation_id = Some(conversation_id.to_string());
                false
            } else {
                true
            }
        };
        // Answered before the headset was told about the call
        if !ringing {
            self.inner.apply(CallEvent::IncomingCall).await?;
        }
        self.inner.apply(CallEvent::UiAnswer).await
    }

    async fn reject_call(&self, conversation_id: &str) -> Result<()> {
        if self.call_state() != CallState::Incoming {
            debug!("No ringing call to reject for {}", conversation_id);
            return Ok(());
        }
        self.inner.apply(CallEvent::UiEnd).await
    }

    async fn end_call(&self, conversation_id: &str, has_other_active_calls: bool) -> Result<()> {
        if has_other_active_calls {
            debug!(
                "Ending {} with other calls active, keeping the device off hook",
                conversation_id
            );
            return Ok(());
        }
        let event = match self.call_state() {
            CallState::Incoming => CallEvent::UiEnd,
            _ => CallEvent::CallEnd,
        };
        self.inner.apply(event).await
    }

    async fn end_all_calls(&self) -> Result<()> {
        {
            let mut device = self.inner.device.lock();
            device.call_state = CallState::Idle;
            device.conversation_id = None;
            device.held = false;
        }
        self.inner.base.set_held(false);
        for flag in [FLAG_RING, FLAG_HOOK, FLAG_HOLD] {
            self.inner.update_device_status(flag, false).await?;
        }
        Ok(())
    }

    async fn set_mute(&self, value: bool) -> Result<()> {
        self.inner.device.lock().muted = value;
        self.inner.base.set_muted(value);
        self.inner.update_device_status(FLAG_MUTE, value).await
    }

    async fn set_hold(&self, _conversation_id: &str, value: bool) -> Result<()> {
        self.inner.device.lock().held = value;
        self.inner.base.set_held(value);
        self.inner.update_device_status(FLAG_HOLD, value).await
    }
}

impl Inner {
    // ── Connection ────────────────────────────────────────────────

    async fn open_device(self: &Arc<Self>, device_label: &str) -> Result<()> {
        let filters = [DeviceFilter::vendor(self.config.vendor_id)];
        let Some(device) = self.find_device(&filters, device_label).await? else {
            return Err(HeadsetError::ConnectionTimeout {
                vendor: VendorId::Yealink,
                waited: Duration::from_millis(self.config.permission_timeout_ms),
            });
        };

        let session = self.provider.open(&device).await?;
        let profile = ChipProfile::for_product(device.product_id);
        info!(
            "Opened {} ({:04x}:{:04x}), {:?} chip",
            device.product_name, device.vendor_id, device.product_id, profile.family
        );

        *self.device.lock() = DeviceState {
            profile: Some(profile),
            ..DeviceState::default()
        };
        *self.writer.lock().await = Some(session.writer);

        let reader = tokio::spawn(read_reports(Arc::clone(self), session.reports));
        if let Some(previous) = self.reader.lock().replace(reader) {
            previous.abort();
        }

        self.base.set_connected(Some(DeviceMetadata {
            name: device.product_name,
            vendor_id: Some(device.vendor_id),
            product_id: Some(device.product_id),
        }));
        Ok(())
    }

    /// Already-permitted devices first; otherwise ask for one and wait a bounded time
    async fn find_device(
        &self,
        filters: &[DeviceFilter],
        device_label: &str,
    ) -> Result<Option<HidDeviceInfo>> {
        let permitted = self.provider.permitted_devices(filters).await?;
        if let Some(device) = pick_device(permitted, device_label) {
            return Ok(Some(device));
        }

        info!("No permitted Yealink device, requesting access");
        self.base.emitter().permission_requested();

        let wait = Duration::from_millis(self.config.permission_timeout_ms);
        match tokio::time::timeout(wait, self.provider.request_device(filters)).await {
            Ok(granted) => Ok(granted?),
            Err(_) => {
                warn!("No Yealink device granted within {:?}", wait);
                Ok(None)
            }
        }
    }

    async fn close_device(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.lock().await.take() {
            writer.close().await;
        }
        *self.device.lock() = DeviceState::default();
        self.base.set_disconnected();
    }

    // ── Device status ─────────────────────────────────────────────

    /// Set or clear one status flag and write the whole mask.
    /// Flags the chip does not implement are skipped.
    async fn update_device_status(&self, flag: u16, value: bool) -> Result<()> {
        let writer = self.writer.lock().await;
        let Some(writer) = writer.as_ref() else {
            return Err(HeadsetError::NotConnected);
        };

        let (report_id, payload) = {
            let mut device = self.device.lock();
            let Some(profile) = device.profile else {
                return Err(HeadsetError::NotConnected);
            };
            if !profile.supports(flag) {
                debug!("Flag {:#06x} not supported by {:?} chip", flag, profile.family);
                return Ok(());
            }
            device.status.set(flag, value);
            (profile.output_report_id, device.status.encode(profile.width))
        };

        debug!("Writing status report {:#04x} {:02x?}", report_id, payload);
        writer.write_output_report(report_id, &payload).await?;
        Ok(())
    }

    // ── Call state ────────────────────────────────────────────────

    /// Run one state machine event and perform its effects in order.
    /// A failed status write does not stop the signals that follow it; the
    /// first write error is returned once every effect has run.
    async fn apply(&self, event: CallEvent) -> Result<()> {
        let (effects, conversation_id) = {
            let mut device = self.device.lock();
            let confirm_required = device
                .profile
                .is_some_and(|p| p.commands.answer_confirm.is_some());
            let Some(t) = transition(device.call_state, event, confirm_required) else {
                debug!("Ignoring {} in {:?}", event.name(), device.call_state);
                return Ok(());
            };

            for state in &t.states {
                debug!("Call state {:?} -> {:?} ({})", device.call_state, state, event.name());
                device.call_state = *state;
            }

            let conversation_id = device.conversation_id.clone();
            if device.call_state == CallState::Idle {
                device.conversation_id = None;
                device.held = false;
            }
            (t.effects, conversation_id)
        };

        let mut failed = None;
        for effect in effects {
            let result = match effect {
                Effect::SetFlag(flag, value) => self.update_device_status(flag, value).await,
                Effect::Unmute => self.unmute_for_answer().await,
                Effect::EmitAnswered | Effect::EmitRejected | Effect::EmitEnded => {
                    self.emit(effect, event, conversation_id.as_deref());
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("{} effect {:?} failed: {}", event.name(), effect, e);
                if failed.is_none() {
                    failed = Some(e);
                }
            }
        }
        failed.map_or(Ok(()), Err)
    }

    fn emit(&self, effect: Effect, event: CallEvent, conversation_id: Option<&str>) {
        let Some(id) = conversation_id else {
            debug!("{} without a conversation, not reported", event.name());
            return;
        };
        let emitter = self.base.emitter();
        match effect {
            Effect::EmitAnswered => emitter.answered(event.name(), id),
            Effect::EmitRejected => emitter.rejected(event.name(), id),
            Effect::EmitEnded => emitter.ended(event.name(), id),
            Effect::SetFlag(..) | Effect::Unmute => {}
        }
    }

    async fn unmute_for_answer(&self) -> Result<()> {
        let was_muted = std::mem::replace(&mut self.device.lock().muted, false);
        if was_muted {
            self.base.set_muted(false);
            self.update_device_status(FLAG_MUTE, false).await?;
        }
        Ok(())
    }

    // ── Device input ──────────────────────────────────────────────

    async fn handle_input_report(&self, report: InputReport) {
        let Some(profile) = self.device.lock().profile else {
            return;
        };
        let Some(code) = profile.classify(report.report_id, &report.data) else {
            debug!(
                "Ignoring input report {:#04x} {:02x?}",
                report.report_id, report.data
            );
            return;
        };
        debug!("Button {:?}", code);

        let result = match code {
            ButtonCode::MuteToggle => self.toggle_mute().await,
            ButtonCode::Flash => self.toggle_hold().await,
            ButtonCode::HookSwitchOn => self.apply(CallEvent::HookSwitchOn).await,
            ButtonCode::HookSwitchOff => self.apply(CallEvent::HookSwitchOff).await,
            ButtonCode::Busy => self.apply(CallEvent::Busy).await,
            ButtonCode::AnswerConfirm => self.apply(CallEvent::AnswerConfirm).await,
        };
        if let Err(e) = result {
            warn!("Failed to handle {:?}: {}", code, e);
        }
    }

    /// Flip the mute state and re-assert it on the device
    async fn toggle_mute(&self) -> Result<()> {
        let (muted, conversation_id) = {
            let mut device = self.device.lock();
            device.muted = !device.muted;
            (device.muted, device.conversation_id.clone())
        };
        self.base.set_muted(muted);
        self.update_device_status(FLAG_MUTE, muted).await?;
        self.base
            .emitter()
            .mute_changed(muted, "MuteToggle", conversation_id.as_deref());
        Ok(())
    }

    async fn toggle_hold(&self) -> Result<()> {
        let (held, conversation_id) = {
            let mut device = self.device.lock();
            if device.call_state != CallState::Active {
                debug!("Flash outside an active call ignored");
                return Ok(());
            }
            device.held = !device.held;
            (device.held, device.conversation_id.clone())
        };
        self.base.set_held(held);
        self.update_device_status(FLAG_HOLD, held).await?;
        self.base
            .emitter()
            .hold_changed(held, "Flash", conversation_id.as_deref());
        Ok(())
    }

    async fn device_lost(&self) {
        if self.writer.lock().await.take().is_none() {
            return;
        }
        self.reader.lock().take();
        *self.device.lock() = DeviceState::default();
        warn!("Yealink device lost");
        self.base.set_disconnected();
    }
}

async fn read_reports(inner: Arc<Inner>, mut reports: mpsc::UnboundedReceiver<InputReport>) {
    while let Some(report) = reports.recv().await {
        inner.handle_input_report(report).await;
    }
    info!("Yealink input stream closed");
    inner.device_lost().await;
}

/// Prefer the device whose product name appears in the microphone label
fn pick_device(devices: Vec<HidDeviceInfo>, device_label: &str) -> Option<HidDeviceInfo> {
    let label = device_label.to_lowercase();
    let index = devices
        .iter()
        .position(|d| !d.product_name.is_empty() && label.contains(&d.product_name.to_lowercase()))
        .unwrap_or(0);
    devices.into_iter().nth(index)
}
