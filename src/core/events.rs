//! Canonical event definitions and the vendor → service event bus

use crate::vendor::{VendorId, VendorState};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Call-level signal from a headset (answered / rejected / ended).
///
/// `name` is the vendor's own name for the signal, e.g. `HookSwitchOn`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    pub name: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteSignal {
    pub is_muted: bool,
    pub name: String,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldSignal {
    pub hold_requested: bool,
    pub name: String,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoggablePayload {
    pub vendor: VendorId,
    pub message: String,
}

/// Connection status of the selected implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    NoVendor,
    Checking,
    Running,
    NotRunning,
}

impl ConnectionStatus {
    /// Status for the selected implementation's state (`None` when nothing is selected)
    pub fn from_state(state: Option<&VendorState>) -> Self {
        match state {
            None => ConnectionStatus::NoVendor,
            Some(s) if s.is_connecting => ConnectionStatus::Checking,
            Some(s) if s.is_connected => ConnectionStatus::Running,
            Some(_) => ConnectionStatus::NotRunning,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::NoVendor => write!(f, "noVendor"),
            ConnectionStatus::Checking => write!(f, "checking"),
            ConnectionStatus::Running => write!(f, "running"),
            ConnectionStatus::NotRunning => write!(f, "notRunning"),
        }
    }
}

/// Canonical events re-emitted by the service to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "eventName", content = "payload", rename_all = "camelCase")]
pub enum HeadsetEvent {
    ImplementationChanged(Option<VendorId>),
    DeviceAnsweredCall(CallSignal),
    DeviceRejectedCall(CallSignal),
    DeviceEndedCall(CallSignal),
    DeviceMuteStatusChanged(MuteSignal),
    DeviceHoldStatusChanged(HoldSignal),
    DeviceConnectionStatusChanged(ConnectionStatus),
    LoggableEvent(LoggablePayload),
    #[serde(rename = "webHidPermissionRequested")]
    HidPermissionRequested(VendorId),
}

impl HeadsetEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            HeadsetEvent::ImplementationChanged(_) => "implementationChanged",
            HeadsetEvent::DeviceAnsweredCall(_) => "deviceAnsweredCall",
            HeadsetEvent::DeviceRejectedCall(_) => "deviceRejectedCall",
            HeadsetEvent::DeviceEndedCall(_) => "deviceEndedCall",
            HeadsetEvent::DeviceMuteStatusChanged(_) => "deviceMuteStatusChanged",
            HeadsetEvent::DeviceHoldStatusChanged(_) => "deviceHoldStatusChanged",
            HeadsetEvent::DeviceConnectionStatusChanged(_) => "deviceConnectionStatusChanged",
            HeadsetEvent::LoggableEvent(_) => "loggableEvent",
            HeadsetEvent::HidPermissionRequested(_) => "webHidPermissionRequested",
        }
    }
}

/// What a vendor engine reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorEventKind {
    AnsweredCall(CallSignal),
    RejectedCall(CallSignal),
    EndedCall(CallSignal),
    MuteChanged(MuteSignal),
    HoldChanged(HoldSignal),
    /// Connection flags changed; the service recomputes the status
    ConnectionChanged,
    Loggable(String),
    PermissionRequested,
}

/// Event published by one vendor engine, tagged with its origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorEvent {
    pub vendor: VendorId,
    pub kind: VendorEventKind,
}

/// Single channel all vendor engines publish into.
///
/// The service owns the receiving end and drains it in one task, so events from a
/// given engine arrive in emission order.
pub struct VendorEventBus {
    tx: mpsc::UnboundedSender<VendorEvent>,
    rx: mpsc::UnboundedReceiver<VendorEvent>,
}

impl Default for VendorEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VendorEventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Publishing handle for one vendor
    pub fn emitter(&self, vendor: VendorId) -> VendorEmitter {
        VendorEmitter {
            vendor,
            tx: self.tx.clone(),
        }
    }

    pub fn into_receiver(self) -> mpsc::UnboundedReceiver<VendorEvent> {
        self.rx
    }
}

/// Publishing handle given to a vendor engine at construction.
/// Every event it sends carries the engine's `VendorId`.
#[derive(Clone)]
pub struct VendorEmitter {
    vendor: VendorId,
    tx: mpsc::UnboundedSender<VendorEvent>,
}

impl VendorEmitter {
    pub fn vendor(&self) -> VendorId {
        self.vendor
    }

    pub fn emit(&self, kind: VendorEventKind) {
        let event = VendorEvent {
            vendor: self.vendor,
            kind,
        };
        if self.tx.send(event).is_err() {
            debug!("{} event dropped: service is gone", self.vendor);
        }
    }

    pub fn answered(&self, name: &str, conversation_id: &str) {
        self.emit(VendorEventKind::AnsweredCall(call_signal(name, conversation_id)));
    }

    pub fn rejected(&self, name: &str, conversation_id: &str) {
        self.emit(VendorEventKind::RejectedCall(call_signal(name, conversation_id)));
    }

    pub fn ended(&self, name: &str, conversation_id: &str) {
        self.emit(VendorEventKind::EndedCall(call_signal(name, conversation_id)));
    }

    pub fn mute_changed(&self, is_muted: bool, name: &str, conversation_id: Option<&str>) {
        self.emit(VendorEventKind::MuteChanged(MuteSignal {
            is_muted,
            name: name.to_string(),
            conversation_id: conversation_id.map(str::to_string),
        }));
    }

    pub fn hold_changed(&self, hold_requested: bool, name: &str, conversation_id: Option<&str>) {
        self.emit(VendorEventKind::HoldChanged(HoldSignal {
            hold_requested,
            name: name.to_string(),
            conversation_id: conversation_id.map(str::to_string),
        }));
    }

    pub fn connection_changed(&self) {
        self.emit(VendorEventKind::ConnectionChanged);
    }

    pub fn loggable(&self, message: impl Into<String>) {
        self.emit(VendorEventKind::Loggable(message.into()));
    }

    pub fn permission_requested(&self) {
        self.emit(VendorEventKind::PermissionRequested);
    }
}

fn call_signal(name: &str, conversation_id: &str) -> CallSignal {
    CallSignal {
        name: name.to_string(),
        conversation_id: conversation_id.to_string(),
    }
}
