//! Headset service - selects one vendor implementation, guards call-control actions
//! against redundant device commands, and re-emits vendor events as canonical events.

use super::config::ServiceConfig;
use super::conversations::{ConversationState, ConversationTable};
use super::error::{HeadsetError, Result};
use super::events::{
    ConnectionStatus, HeadsetEvent, LoggablePayload, VendorEvent, VendorEventBus, VendorEventKind,
};
use crate::vendor::{CallInfo, VendorId, VendorImplementation};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Implementation = Arc<dyn VendorImplementation>;

struct ServiceInner {
    /// One instance per known vendor
    implementations: Vec<Implementation>,
    /// The single active implementation (if any)
    selected: Mutex<Option<Implementation>>,
    /// Serializes selection changes across their connect/disconnect awaits
    selection_lock: tokio::sync::Mutex<()>,
    conversations: ConversationTable,
    events: broadcast::Sender<HeadsetEvent>,
}

/// Orchestrator between the softphone and the vendor engines
pub struct HeadsetService {
    inner: Arc<ServiceInner>,
    reconciler: JoinHandle<()>,
}

impl HeadsetService {
    /// Create the service and start draining `bus`.
    ///
    /// `implementations` must have been constructed with emitters from `bus`.
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: &ServiceConfig,
        bus: VendorEventBus,
        implementations: Vec<Implementation>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Arc::new(ServiceInner {
            implementations,
            selected: Mutex::new(None),
            selection_lock: tokio::sync::Mutex::new(()),
            conversations: ConversationTable::new(config.cleanup_delay()),
            events,
        });

        let reconciler = tokio::spawn(run_reconciler(Arc::clone(&inner), bus.into_receiver()));

        Self { inner, reconciler }
    }

    /// Canonical event stream
    pub fn subscribe(&self) -> broadcast::Receiver<HeadsetEvent> {
        self.inner.events.subscribe()
    }

    pub fn implementations(&self) -> &[Implementation] {
        &self.inner.implementations
    }

    pub fn implementation(&self, vendor: VendorId) -> Option<Implementation> {
        self.inner
            .implementations
            .iter()
            .find(|imp| imp.vendor() == vendor)
            .cloned()
    }

    pub fn selected_implementation(&self) -> Option<Implementation> {
        self.inner.selected.lock().clone()
    }

    pub fn selected_vendor(&self) -> Option<VendorId> {
        self.inner.selected_vendor()
    }

    pub fn conversation_state(&self, conversation_id: &str) -> Option<ConversationState> {
        self.inner.conversations.get(conversation_id)
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.inner.conversations.ids()
    }

    // ── Selection ─────────────────────────────────────────────────

    /// Select the first supported implementation whose vendor matches the
    /// microphone label; clear the selection when none does.
    pub async fn active_mic_change(&self, label: &str) -> Result<()> {
        let candidate = self
            .inner
            .implementations
            .iter()
            .find(|imp| imp.is_supported() && imp.device_label_matches_vendor(label))
            .cloned();

        match &candidate {
            Some(imp) => debug!("Microphone '{}' matches {}", label, imp.vendor()),
            None => debug!("Microphone '{}' matches no vendor", label),
        }

        self.change_implementation(candidate, label).await
    }

    /// Switch the active implementation: disconnect the old one, connect the new
    /// one, then emit `implementationChanged`. No-op when already selected.
    pub async fn change_implementation(
        &self,
        implementation: Option<Implementation>,
        device_label: &str,
    ) -> Result<()> {
        let _guard = self.inner.selection_lock.lock().await;

        let previous = self.inner.selected.lock().clone();
        let new_vendor = implementation.as_ref().map(|imp| imp.vendor());
        if previous.as_ref().map(|imp| imp.vendor()) == new_vendor {
            debug!("Implementation unchanged ({:?})", new_vendor);
            return Ok(());
        }

        if let Some(prev) = previous {
            info!("Disconnecting {}", prev.vendor());
            if let Err(e) = prev.disconnect().await {
                warn!("Failed to disconnect {}: {}", prev.vendor(), e);
            }
        }

        *self.inner.selected.lock() = implementation.clone();

        if let Some(imp) = &implementation {
            info!("Connecting {} for '{}'", imp.vendor(), device_label);
            match imp.connect(device_label).await {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => warn!("{} not connected: {}", imp.vendor(), e),
                Err(e) => error!("Failed to connect {}: {}", imp.vendor(), e),
            }
        }

        self.inner.publish(HeadsetEvent::ImplementationChanged(new_vendor));
        Ok(())
    }

    /// Reconnect the current selection
    pub async fn retry_connection(&self, device_label: &str) -> Result<()> {
        let selected = self
            .selected_implementation()
            .ok_or(HeadsetError::NoActiveHeadset)?;
        settle(
            selected.vendor(),
            "retry_connection",
            selected.connect(device_label).await,
        )
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.connection_status()
    }

    // ── Call control ──────────────────────────────────────────────

    pub async fn incoming_call(&self, info: &CallInfo, has_other_active_calls: bool) -> Result<()> {
        require_conversation_id(&info.conversation_id)?;
        let Some(imp) = self.connected_implementation("incoming_call") else {
            return Ok(());
        };
        let id = info.conversation_id.as_str();

        if self.inner.conversations.get(id).is_some_and(|s| s.ringing) {
            debug!("Conversation {} already ringing", id);
            return Ok(());
        }

        settle(imp.vendor(), "incoming_call", imp.incoming_call(info, has_other_active_calls).await)?;
        self.inner
            .conversations
            .upsert(id, |s| *s = ConversationState::ringing());
        Ok(())
    }

    pub async fn outgoing_call(&self, info: &CallInfo) -> Result<()> {
        require_conversation_id(&info.conversation_id)?;
        let Some(imp) = self.connected_implementation("outgoing_call") else {
            return Ok(());
        };
        let id = info.conversation_id.as_str();

        if self.inner.conversations.get(id).is_some_and(|s| s.off_hook) {
            debug!("Conversation {} already off hook", id);
            return Ok(());
        }

        settle(imp.vendor(), "outgoing_call", imp.outgoing_call(info).await)?;
        self.inner
            .conversations
            .upsert(id, |s| *s = ConversationState::off_hook());
        Ok(())
    }

    pub async fn answer_call(&self, conversation_id: &str, auto_answer: bool) -> Result<()> {
        require_conversation_id(conversation_id)?;
        let Some(imp) = self.connected_implementation("answer_call") else {
            return Ok(());
        };

        if self
            .inner
            .conversations
            .get(conversation_id)
            .is_some_and(|s| s.off_hook && !s.ringing)
        {
            debug!("Conversation {} already answered", conversation_id);
            return Ok(());
        }

        settle(imp.vendor(), "answer_call", imp.answer_call(conversation_id, auto_answer).await)?;
        self.inner.conversations.upsert(conversation_id, |s| {
            s.off_hook = true;
            s.ringing = false;
        });
        Ok(())
    }

    pub async fn reject_call(&self, conversation_id: &str) -> Result<()> {
        let Some(imp) = self.connected_implementation("reject_call") else {
            return Ok(());
        };

        if self
            .inner
            .conversations
            .get(conversation_id)
            .is_some_and(|s| s.is_idle())
        {
            debug!("Conversation {} already rejected", conversation_id);
            return Ok(());
        }

        settle(imp.vendor(), "reject_call", imp.reject_call(conversation_id).await)?;
        let existed = self
            .inner
            .conversations
            .update(conversation_id, |s| {
                s.ringing = false;
                s.off_hook = false;
            })
            .is_some();
        if existed {
            self.inner.conversations.schedule_removal(conversation_id);
        }
        Ok(())
    }

    /// Mute applies to every off-hook conversation; with none, it is compared
    /// against the implementation's own mute flag.
    pub async fn set_mute(&self, value: bool) -> Result<()> {
        let Some(imp) = self.connected_implementation("set_mute") else {
            return Ok(());
        };

        let active = self.inner.conversations.states_where(|s| s.off_hook);
        let is_different = if active.is_empty() {
            imp.state().is_muted != value
        } else {
            active.iter().any(|(_, s)| s.muted != value)
        };
        if !is_different {
            debug!("Mute already {}", value);
            return Ok(());
        }

        settle(imp.vendor(), "set_mute", imp.set_mute(value).await)?;
        for (id, _) in active {
            self.inner.conversations.update(&id, |s| s.muted = value);
        }
        Ok(())
    }

    pub async fn set_hold(&self, conversation_id: &str, value: bool) -> Result<()> {
        let Some(imp) = self.connected_implementation("set_hold") else {
            return Ok(());
        };

        if !imp.capabilities().supports_hold {
            info!("{} does not support hold, ignoring", imp.vendor());
            return Ok(());
        }

        if self
            .inner
            .conversations
            .get(conversation_id)
            .is_some_and(|s| s.held == value)
        {
            debug!("Conversation {} hold already {}", conversation_id, value);
            return Ok(());
        }

        settle(imp.vendor(), "set_hold", imp.set_hold(conversation_id, value).await)?;
        self.inner
            .conversations
            .update(conversation_id, |s| s.held = value);
        Ok(())
    }

    pub async fn end_call(&self, conversation_id: &str, has_other_active_calls: bool) -> Result<()> {
        let Some(imp) = self.connected_implementation("end_call") else {
            return Ok(());
        };

        if self
            .inner
            .conversations
            .get(conversation_id)
            .is_some_and(|s| s.is_idle())
        {
            debug!("Conversation {} already ended", conversation_id);
            return Ok(());
        }

        settle(
            imp.vendor(),
            "end_call",
            imp.end_call(conversation_id, has_other_active_calls).await,
        )?;
        self.inner.end_conversation(conversation_id);
        Ok(())
    }

    pub async fn end_all_calls(&self) -> Result<()> {
        let Some(imp) = self.connected_implementation("end_all_calls") else {
            return Ok(());
        };

        let conversations = &self.inner.conversations;
        if !conversations.is_empty() && conversations.states_where(|s| !s.is_idle()).is_empty() {
            debug!("No active conversations to end");
            return Ok(());
        }

        settle(imp.vendor(), "end_all_calls", imp.end_all_calls().await)?;
        let ids = conversations.update_all(|s| {
            s.off_hook = false;
            s.ringing = false;
            s.held = false;
        });
        for id in ids {
            conversations.schedule_removal(&id);
        }
        Ok(())
    }

    /// The selected implementation, if it is connected
    fn connected_implementation(&self, action: &str) -> Option<Implementation> {
        let selected = self.selected_implementation();
        match selected {
            Some(imp) if imp.state().is_connected => Some(imp),
            Some(imp) => {
                info!("{}: {} is not connected, ignoring", action, imp.vendor());
                None
            }
            None => {
                info!("{}: {}, ignoring", action, HeadsetError::NotConnected);
                None
            }
        }
    }
}

impl Drop for HeadsetService {
    fn drop(&mut self) {
        self.reconciler.abort();
    }
}

impl ServiceInner {
    fn selected_vendor(&self) -> Option<VendorId> {
        self.selected.lock().as_ref().map(|imp| imp.vendor())
    }

    fn connection_status(&self) -> ConnectionStatus {
        let state = self.selected.lock().as_ref().map(|imp| imp.state());
        ConnectionStatus::from_state(state.as_ref())
    }

    fn publish(&self, event: HeadsetEvent) {
        debug!("Emitting {}", event.event_name());
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn end_conversation(&self, conversation_id: &str) {
        let existed = self
            .conversations
            .update(conversation_id, |s| {
                s.off_hook = false;
                s.ringing = false;
                s.held = false;
            })
            .is_some();
        if existed {
            self.conversations.schedule_removal(conversation_id);
        }
    }

    fn handle_vendor_event(&self, event: VendorEvent) {
        let VendorEvent { vendor, kind } = event;

        match kind {
            VendorEventKind::Loggable(message) => {
                info!("[{}] {}", vendor, message);
                self.publish(HeadsetEvent::LoggableEvent(LoggablePayload { vendor, message }));
                return;
            }
            VendorEventKind::PermissionRequested => {
                self.publish(HeadsetEvent::HidPermissionRequested(vendor));
                return;
            }
            _ => {}
        }

        if self.selected_vendor() != Some(vendor) {
            debug!("Dropping {:?} from non-selected {}", kind, vendor);
            return;
        }

        match kind {
            VendorEventKind::ConnectionChanged => {
                self.publish(HeadsetEvent::DeviceConnectionStatusChanged(
                    self.connection_status(),
                ));
            }
            VendorEventKind::AnsweredCall(signal) => {
                self.conversations.upsert(&signal.conversation_id, |s| {
                    s.off_hook = true;
                    s.ringing = false;
                });
                self.publish(HeadsetEvent::DeviceAnsweredCall(signal));
            }
            VendorEventKind::RejectedCall(signal) => {
                let existed = self
                    .conversations
                    .update(&signal.conversation_id, |s| {
                        s.ringing = false;
                        s.off_hook = false;
                    })
                    .is_some();
                if existed {
                    self.conversations.schedule_removal(&signal.conversation_id);
                }
                self.publish(HeadsetEvent::DeviceRejectedCall(signal));
            }
            VendorEventKind::EndedCall(signal) => {
                self.end_conversation(&signal.conversation_id);
                self.publish(HeadsetEvent::DeviceEndedCall(signal));
            }
            VendorEventKind::MuteChanged(signal) => {
                if let Some(id) = &signal.conversation_id {
                    self.conversations.update(id, |s| s.muted = signal.is_muted);
                }
                self.publish(HeadsetEvent::DeviceMuteStatusChanged(signal));
            }
            VendorEventKind::HoldChanged(signal) => {
                if let Some(id) = &signal.conversation_id {
                    self.conversations.update(id, |s| s.held = signal.hold_requested);
                }
                self.publish(HeadsetEvent::DeviceHoldStatusChanged(signal));
            }
            VendorEventKind::Loggable(_) | VendorEventKind::PermissionRequested => {}
        }
    }
}

async fn run_reconciler(inner: Arc<ServiceInner>, mut rx: mpsc::UnboundedReceiver<VendorEvent>) {
    while let Some(event) = rx.recv().await {
        inner.handle_vendor_event(event);
    }
    debug!("Vendor event bus closed");
}

fn require_conversation_id(conversation_id: &str) -> Result<()> {
    if conversation_id.trim().is_empty() {
        return Err(HeadsetError::MissingConversationId);
    }
    Ok(())
}

/// Recoverable vendor errors are logged and swallowed; the rest fail the action
fn settle(vendor: VendorId, action: &str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_recoverable() => {
            info!("{} {}: {}", vendor, action, e);
            Ok(())
        }
        Err(e) => {
            error!("{} {} failed: {}", vendor, action, e);
            Err(e)
        }
    }
}
