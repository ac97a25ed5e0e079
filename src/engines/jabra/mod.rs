//! Jabra headsets through the vendor's native desktop host
//!
//! Requests are `{deviceID, event, value}`; the host pushes `{msg, event, value, hidInput}`.
//! Ringing and off-hook need the SDK call lock, which is taken before the first call and
//! released once the last one ends.

pub mod bridge;

use self::bridge::NativeBridge;
use crate::core::config::JabraConfig;
use crate::core::error::{HeadsetError, Result};
use crate::core::events::VendorEmitter;
use crate::vendor::{
    label_contains_any, CallInfo, DeviceMetadata, VendorBase, VendorId, VendorImplementation,
    VendorState,
};
use anyhow::anyhow;
use async_trait::async_trait;
use headset_protocol::{
    bridge_events as events, bridge_hid_inputs as hid_inputs, bridge_msgs, BridgeMessage,
    BridgeRequest,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LABEL_KEYWORDS: &[&str] = &["jabra"];

#[derive(Default)]
struct Calls {
    device_id: u32,
    ringing: Option<String>,
    /// Conversation the headset buttons act on
    active: Option<String>,
    /// Off-hook conversations
    off_hook: HashSet<String>,
    lock_held: bool,
    muted: bool,
    held: bool,
}

impl Calls {
    fn is_idle(&self) -> bool {
        self.ringing.is_none() && self.off_hook.is_empty()
    }
}

struct Session {
    outbound: mpsc::UnboundedSender<BridgeRequest>,
    reader: JoinHandle<()>,
}

struct Inner {
    config: JabraConfig,
    bridge: Arc<dyn NativeBridge>,
    base: VendorBase,
    calls: Mutex<Calls>,
    session: Mutex<Option<Session>>,
    /// Completed by the host's `activedevice` event
    active_device: Mutex<Option<oneshot::Sender<u32>>>,
}

/// Native-host bridge engine
pub struct JabraHeadset {
    inner: Arc<Inner>,
}

impl JabraHeadset {
    pub fn new(config: JabraConfig, bridge: Arc<dyn NativeBridge>, emitter: VendorEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                bridge,
                base: VendorBase::new(emitter),
                calls: Mutex::new(Calls::default()),
                session: Mutex::new(None),
                active_device: Mutex::new(None),
            }),
        }
    }

    /// Whether the SDK call lock is currently held
    pub fn holds_call_lock(&self) -> bool {
        self.inner.calls.lock().lock_held
    }
}

impl Drop for JabraHeadset {
    fn drop(&mut self) {
        if let Some(session) = self.inner.session.lock().take() {
            session.reader.abort();
        }
    }
}

#[async_trait]
impl VendorImplementation for JabraHeadset {
    fn vendor(&self) -> VendorId {
        VendorId::Jabra
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

    async fn connect(&self, device_label: &str) -> Result<()> {
        if self.inner.base.is_connected() {
            debug!("Jabra already connected");
            return Ok(());
        }
        self.inner.close_session();
        self.inner.base.set_connecting();

        let result = self.inner.establish(device_label).await;
        if result.is_err() {
            self.inner.close_session();
            self.inner.base.set_disconnected();
        }
        result
    }

    async fn disconnect(&self) -> Result<()> {
        if self.inner.calls.lock().lock_held {
            // Best effort, the host goes away with the session
            let _ = self.inner.send(events::RELEASE_CALL_LOCK, true);
        }
        self.inner.close_session();
        *self.inner.calls.lock() = Calls::default();
        self.inner.base.set_disconnected();
        info!("Jabra disconnected");
        Ok(())
    }

    async fn incoming_call(&self, info: &CallInfo, _has_other_active_calls: bool) -> Result<()> {
        self.inner.ensure_call_lock()?;
        self.inner.calls.lock().ringing = Some(info.conversation_id.clone());
        self.inner.send(events::RING, true)
    }

    async fn outgoing_call(&self, info: &CallInfo) -> Result<()> {
        self.inner.ensure_call_lock()?;
        {
            let mut calls = self.inner.calls.lock();
            calls.off_hook.insert(info.conversation_id.clone());
            calls.active = Some(info.conversation_id.clone());
        }
        self.inner.send(events::OFF_HOOK, true)
    }

    async fn answer_call(&self, conversation_id: &str, _auto_answer: bool) -> Result<()> {
        self.inner.ensure_call_lock()?;
        let was_ringing = {
            let mut calls = self.inner.calls.lock();
            let was_ringing = calls.ringing.as_deref() == Some(conversation_id);
            if was_ringing {
                calls.ringing = None;
            }
            calls.off_hook.insert(conversation_id.to_string());
            calls.active = Some(conversation_id.to_string());
            was_ringing
        };
        if was_ringing {
            self.inner.send(events::RING, false)?;
        }
        self.inner.send(events::OFF_HOOK, true)
    }

    async fn reject_call(&self, conversation_id: &str) -> Result<()> {
        let was_ringing = {
            let mut calls = self.inner.calls.lock();
            let was_ringing = calls.ringing.as_deref() == Some(conversation_id);
            if was_ringing {
                calls.ringing = None;
            }
            was_ringing
        };
        if !was_ringing {
            debug!("{} is not ringing, nothing to reject", conversation_id);
            return Ok(());
        }
        self.inner.send(events::RING, false)?;
        self.inner.release_call_lock_if_idle()
    }

    async fn end_call(&self, conversation_id: &str, has_other_active_calls: bool) -> Result<()> {
        let keep_off_hook = {
            let mut calls = self.inner.calls.lock();
            calls.off_hook.remove(conversation_id);
            if calls.active.as_deref() == Some(conversation_id) {
                calls.active = None;
            }
            if calls.ringing.as_deref() == Some(conversation_id) {
                calls.ringing = None;
            }
            has_other_active_calls || !calls.off_hook.is_empty()
        };
        if keep_off_hook {
            debug!("Other calls active, keeping the headset off hook");
            return Ok(());
        }
        self.inner.send(events::OFF_HOOK, false)?;
        self.inner.release_call_lock_if_idle()
    }

    async fn end_all_calls(&self) -> Result<()> {
        let was_held = {
            let mut calls = self.inner.calls.lock();
            calls.ringing = None;
            calls.active = None;
            calls.off_hook.clear();
            std::mem::replace(&mut calls.held, false)
        };
        self.inner.send(events::RING, false)?;
        self.inner.send(events::OFF_HOOK, false)?;
        if was_held {
            self.inner.send(events::HOLD, false)?;
            self.inner.base.set_held(false);
        }
        self.inner.release_call_lock_if_idle()
    }

    async fn set_mute(&self, value: bool) -> Result<()> {
        self.inner.send(events::MUTE, value)?;
        self.inner.calls.lock().muted = value;
        self.inner.base.set_muted(value);
        Ok(())
    }

    async fn set_hold(&self, _conversation_id: &str, value: bool) -> Result<()> {
        self.inner.send(events::HOLD, value)?;
        self.inner.calls.lock().held = value;
        self.inner.base.set_held(value);
        Ok(())
    }
}

impl Inner {
    async fn establish(self: &Arc<Self>, device_label: &str) -> Result<()> {
        let channel = self.bridge.open().await?;

        let (device_tx, device_rx) = oneshot::channel();
        *self.active_device.lock() = Some(device_tx);
        let reader = tokio::spawn(read_messages(Arc::clone(self), channel.inbound));
        *self.session.lock() = Some(Session {
            outbound: channel.outbound,
            reader,
        });

        self.send(events::GET_ACTIVE_DEVICE, true)?;

        let wait = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(wait, device_rx).await {
            Ok(Ok(device_id)) => {
                info!("Jabra device {} active", device_id);
                self.base
                    .set_connected(Some(DeviceMetadata::named(device_label)));
                Ok(())
            }
            Ok(Err(_)) => Err(anyhow!("Native host exited before reporting a device").into()),
            Err(_) => Err(HeadsetError::ConnectionTimeout {
                vendor: VendorId::Jabra,
                waited: wait,
            }),
        }
    }

    fn send(&self, event: &str, value: bool) -> Result<()> {
        let device_id = self.calls.lock().device_id;
        let session = self.session.lock();
        let Some(session) = session.as_ref() else {
            return Err(HeadsetError::NotConnected);
        };
        debug!("-> {} {}", event, value);
        session
            .outbound
            .send(BridgeRequest {
                device_id,
                event: event.to_string(),
                value,
            })
            .map_err(|_| anyhow!("Native host connection closed"))?;
        Ok(())
    }

    fn ensure_call_lock(&self) -> Result<()> {
        let request = !std::mem::replace(&mut self.calls.lock().lock_held, true);
        if request {
            self.send(events::REQUEST_CALL_LOCK, true)?;
        }
        Ok(())
    }

    fn release_call_lock_if_idle(&self) -> Result<()> {
        let release = {
            let mut calls = self.calls.lock();
            let release = calls.lock_held && calls.is_idle();
            if release {
                calls.lock_held = false;
            }
            release
        };
        if release {
            self.send(events::RELEASE_CALL_LOCK, true)?;
        }
        Ok(())
    }

    fn close_session(&self) {
        self.active_device.lock().take();
        if let Some(session) = self.session.lock().take() {
            session.reader.abort();
        }
    }

    fn session_lost(&self) {
        self.active_device.lock().take();
        if self.session.lock().take().is_some() {
            warn!("Native host exited");
            *self.calls.lock() = Calls::default();
            self.base.set_disconnected();
        }
    }

    // ── Host messages ─────────────────────────────────────────────

    fn handle_message(&self, message: BridgeMessage) {
        match message.msg.as_str() {
            bridge_msgs::ERROR => self.handle_error(&message.value_text()),
            bridge_msgs::EVENT => self.handle_event(message),
            other => debug!("Ignoring bridge message kind {}", other),
        }
    }

    fn handle_error(&self, text: &str) {
        let err = classify_error(text);
        match &err {
            HeadsetError::ResourceConflict(_) => {
                // The lock request was refused, so there is nothing to release later
                self.calls.lock().lock_held = false;
                info!("Jabra: {}", err);
            }
            _ => error!("Jabra: {}", err),
        }
        self.base.emitter().loggable(err.to_string());
    }

    fn handle_event(&self, message: BridgeMessage) {
        match message.event.as_str() {
            events::ACTIVE_DEVICE => {
                let device_id = message.device_id.unwrap_or_default();
                self.calls.lock().device_id = device_id;
                if let Some(tx) = self.active_device.lock().take() {
                    let _ = tx.send(device_id);
                }
                return;
            }
            events::DEVICE_DETACHED => {
                warn!("Jabra device detached");
                *self.calls.lock() = Calls::default();
                self.base.set_disconnected();
                return;
            }
            _ => {}
        }

        let Some(input) = message.hid_input.as_deref() else {
            debug!("Ignoring bridge event {}", message.event);
            return;
        };
        if let Err(e) = self.handle_hid_input(input, message.value_flag()) {
            warn!("Failed to handle HID input {}: {}", input, e);
        }
    }

    fn handle_hid_input(&self, input: &str, value: bool) -> Result<()> {
        let emitter = self.base.emitter();
        match input {
            hid_inputs::HOOK_SWITCH if value => {
                let answered = {
                    let mut calls = self.calls.lock();
                    let ringing = calls.ringing.take();
                    if let Some(id) = &ringing {
                        calls.off_hook.insert(id.clone());
                        calls.active = Some(id.clone());
                    }
                    ringing
                };
                match answered {
                    Some(id) => emitter.answered("HookSwitch", &id),
                    None => debug!("Hook switch on without a ringing call"),
                }
            }
            hid_inputs::HOOK_SWITCH => {
                let ended = {
                    let mut calls = self.calls.lock();
                    let active = calls.active.take();
                    if let Some(id) = &active {
                        calls.off_hook.remove(id);
                    }
                    active
                };
                match ended {
                    Some(id) => {
                        emitter.ended("HookSwitch", &id);
                        self.release_call_lock_if_idle()?;
                    }
                    None => debug!("Hook switch off without an active call"),
                }
            }
            hid_inputs::REJECT if value => {
                let rejected = self.calls.lock().ringing.take();
                if let Some(id) = rejected {
                    self.send(events::RING, false)?;
                    emitter.rejected("Reject", &id);
                    self.release_call_lock_if_idle()?;
                }
            }
            hid_inputs::PHONE_MUTE if value => {
                let (muted, active) = {
                    let mut calls = self.calls.lock();
                    calls.muted = !calls.muted;
                    (calls.muted, calls.active.clone())
                };
                self.base.set_muted(muted);
                self.send(events::MUTE, muted)?;
                emitter.mute_changed(muted, "PhoneMute", active.as_deref());
            }
            hid_inputs::FLASH if value => {
                let toggled = {
                    let mut calls = self.calls.lock();
                    match calls.active.clone() {
                        Some(id) => {
                            calls.held = !calls.held;
                            Some((calls.held, id))
                        }
                        None => None,
                    }
                };
                if let Some((held, id)) = toggled {
                    self.base.set_held(held);
                    self.send(events::HOLD, held)?;
                    emitter.hold_changed(held, "Flash", Some(&id));
                }
            }
            hid_inputs::REJECT | hid_inputs::PHONE_MUTE | hid_inputs::FLASH => {} // Button release
            other => debug!("Ignoring HID input {}", other),
        }
        Ok(())
    }
}

async fn read_messages(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<BridgeMessage>) {
    while let Some(message) = inbound.recv().await {
        inner.handle_message(message);
    }
    inner.session_lost();
}

/// Call lock ownership complaints map to `ResourceConflict`, anything else to `Sdk`
fn classify_error(text: &str) -> HeadsetError {
    let lower = text.to_lowercase();
    let lock_conflict = lower.contains("lock")
        && (lower.contains("already") || lower.contains("not held") || lower.contains("not locked"));
    if lock_conflict {
        HeadsetError::ResourceConflict(text.to_string())
    } else {
        HeadsetError::Sdk {
            vendor: VendorId::Jabra,
            message: text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::bridge::BridgeChannel;
    use super::*;
    use crate::core::events::{VendorEvent, VendorEventBus, VendorEventKind};

    /// Scripted native host
    #[derive(Clone, Default)]
    struct MockHost {
        silent: bool,
        sent: Arc<Mutex<Vec<BridgeRequest>>>,
        to_engine: Arc<Mutex<Option<mpsc::UnboundedSender<BridgeMessage>>>>,
    }

    impl MockHost {
        fn push(&self, event: &str, value: serde_json::Value, hid_input: Option<&str>) {
            let message = BridgeMessage {
                msg: bridge_msgs::EVENT.to_string(),
                event: event.to_string(),
                value,
                hid_input: hid_input.map(str::to_string),
                device_id: None,
            };
            if let Some(tx) = self.to_engine.lock().as_ref() {
                let _ = tx.send(message);
            }
        }

        fn push_error(&self, text: &str) {
            let message = BridgeMessage {
                msg: bridge_msgs::ERROR.to_string(),
                event: String::new(),
                value: serde_json::Value::String(text.to_string()),
                hid_input: None,
                device_id: None,
            };
            if let Some(tx) = self.to_engine.lock().as_ref() {
                let _ = tx.send(message);
            }
        }

        fn sent(&self) -> Vec<(String, bool)> {
            self.sent
                .lock()
                .iter()
                .map(|r| (r.event.clone(), r.value))
                .collect()
        }
    }

    #[async_trait]
    impl NativeBridge for MockHost {
        async fn open(&self) -> anyhow::Result<BridgeChannel> {
            let (outbound, mut from_engine) = mpsc::unbounded_channel::<BridgeRequest>();
            let (to_engine, inbound) = mpsc::unbounded_channel::<BridgeMessage>();
            *self.to_engine.lock() = Some(to_engine.clone());

            let host = self.clone();
            tokio::spawn(async move {
                while let Some(request) = from_engine.recv().await {
                    if !host.silent && request.event == events::GET_ACTIVE_DEVICE {
                        let _ = to_engine.send(BridgeMessage {
                            msg: bridge_msgs::EVENT.to_string(),
                            event: events::ACTIVE_DEVICE.to_string(),
                            value: serde_json::Value::Bool(true),
                            hid_input: None,
                            device_id: Some(7),
                        });
                    }
                    host.sent.lock().push(request);
                }
            });
            Ok(BridgeChannel { outbound, inbound })
        }
    }

    async fn connected() -> (JabraHeadset, MockHost, mpsc::UnboundedReceiver<VendorEvent>) {
        let host = MockHost::default();
        let bus = VendorEventBus::new();
        let engine = JabraHeadset::new(
            JabraConfig::default(),
            Arc::new(host.clone()),
            bus.emitter(VendorId::Jabra),
        );
        engine.connect("Jabra Evolve2 65").await.unwrap();
        (engine, host, bus.into_receiver())
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<VendorEvent>) -> Vec<VendorEventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_connect_waits_for_active_device() {
        let (engine, host, _rx) = connected().await;
        assert!(engine.state().is_connected);
        settle().await;
        assert_eq!(host.sent()[0], (events::GET_ACTIVE_DEVICE.to_string(), true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let host = MockHost {
            silent: true,
            ..MockHost::default()
        };
        let bus = VendorEventBus::new();
        let engine = JabraHeadset::new(JabraConfig::default(), Arc::new(host), bus.emitter(VendorId::Jabra));
        let result = engine.connect("Jabra").await;
        assert!(matches!(result, Err(HeadsetError::ConnectionTimeout { .. })));
        assert!(!engine.state().is_connecting);
    }

    #[tokio::test]
    async fn test_call_lock_around_calls() {
        let (engine, host, _rx) = connected().await;
        engine.incoming_call(&CallInfo::new("c1"), false).await.unwrap();
        assert!(engine.holds_call_lock());
        engine.answer_call("c1", false).await.unwrap();
        engine.end_call("c1", false).await.unwrap();
        assert!(!engine.holds_call_lock());
        settle().await;

        let sent: Vec<String> = host.sent().into_iter().skip(1).map(|(e, _)| e).collect();
        assert_eq!(
            sent,
            vec![
                events::REQUEST_CALL_LOCK,
                events::RING,
                events::RING,
                events::OFF_HOOK,
                events::OFF_HOOK,
                events::RELEASE_CALL_LOCK,
            ]
        );
    }

    #[tokio::test]
    async fn test_hook_switch_answers_and_ends() {
        let (engine, host, mut rx) = connected().await;
        engine.incoming_call(&CallInfo::new("c1"), false).await.unwrap();
        drain(&mut rx);

        host.push("", serde_json::Value::Bool(true), Some(hid_inputs::HOOK_SWITCH));
        host.push("", serde_json::Value::Bool(false), Some(hid_inputs::HOOK_SWITCH));
        settle().await;

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [VendorEventKind::AnsweredCall(a), VendorEventKind::EndedCall(e)]
                if a.conversation_id == "c1" && e.conversation_id == "c1"
        ));
        assert!(!engine.holds_call_lock());
    }

    #[tokio::test]
    async fn test_reject_button() {
        let (engine, host, mut rx) = connected().await;
        engine.incoming_call(&CallInfo::new("c1"), false).await.unwrap();
        drain(&mut rx);

        host.push("", serde_json::Value::Bool(true), Some(hid_inputs::REJECT));
        settle().await;
        assert!(matches!(drain(&mut rx).as_slice(), [VendorEventKind::RejectedCall(_)]));
    }

    #[tokio::test]
    async fn test_mute_button_toggles() {
        let (engine, host, mut rx) = connected().await;
        host.push("", serde_json::Value::String("true".into()), Some(hid_inputs::PHONE_MUTE));
        settle().await;
        assert!(engine.state().is_muted);
        let events = drain(&mut rx);
        assert!(events.iter().any(|k| matches!(k, VendorEventKind::MuteChanged(m) if m.is_muted)));
    }

    #[tokio::test]
    async fn test_device_detached_disconnects() {
        let (engine, host, _rx) = connected().await;
        host.push(events::DEVICE_DETACHED, serde_json::Value::Null, None);
        settle().await;
        assert!(!engine.state().is_connected);
    }

    #[tokio::test]
    async fn test_lock_errors_are_conflicts() {
        let (_engine, host, mut rx) = connected().await;
        drain(&mut rx);
        host.push_error("Call lock already held by another application");
        settle().await;
        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [VendorEventKind::Loggable(m)] if m.starts_with("Resource ownership conflict")
        ));
    }

    #[tokio::test]
    async fn test_refused_lock_is_not_released() {
        let (engine, host, _rx) = connected().await;
        engine.incoming_call(&CallInfo::new("c1"), false).await.unwrap();
        assert!(engine.holds_call_lock());

        host.push_error("Call lock already held by another application");
        settle().await;
        assert!(!engine.holds_call_lock());

        engine.reject_call("c1").await.unwrap();
        settle().await;
        let sent: Vec<String> = host.sent().into_iter().map(|(e, _)| e).collect();
        assert!(!sent.iter().any(|e| e == events::RELEASE_CALL_LOCK));
    }

    #[test]
    fn test_classify_error() {
        assert!(matches!(classify_error("Lock not held"), HeadsetError::ResourceConflict(_)));
        assert!(matches!(classify_error("Device not found"), HeadsetError::Sdk { .. }));
    }
}
