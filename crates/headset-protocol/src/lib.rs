//! Shared wire formats for the headset-bridge vendor engines.
//!
//! This crate is intentionally lightweight (only `serde` + `serde_json`).
//! It defines:
//! - HID status flags and per-chip button tables (binary report headsets)
//! - JSON frames for the WebSocket vendor SDK
//! - Native-host bridge messages and their length-prefixed framing
//! - REST hub response envelope and call action table

use serde::{Deserialize, Serialize};

// ── HID status report ──────────────────────────────────────────────

/// Off-hook (call audio open)
pub const FLAG_HOOK: u16 = 0x0001;
/// Microphone muted
pub const FLAG_MUTE: u16 = 0x0004;
/// Ringer active
pub const FLAG_RING: u16 = 0x0008;
/// Call on hold (16-bit chips only)
pub const FLAG_HOLD: u16 = 0x0100;

/// Width of the status output report payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportWidth {
    /// One status byte
    Single,
    /// Two status bytes, little-endian
    Double,
}

/// Device status bitmask written to the output report.
///
/// Bit layout: bit0 = hook, bit2 = mute, bit3 = ring, bit8 = hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus(u16);

impl DeviceStatus {
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn contains(&self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    /// Set or clear `flag`
    pub fn set(&mut self, flag: u16, value: bool) {
        if value {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    /// Serialize into the output report payload.
    pub fn encode(&self, width: ReportWidth) -> Vec<u8> {
        match width {
            ReportWidth::Single => vec![(self.0 & 0xFF) as u8],
            ReportWidth::Double => self.0.to_le_bytes().to_vec(),
        }
    }
}

/// Semantic meaning of a button word reported by the headset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonCode {
    MuteToggle,
    HookSwitchOn,
    HookSwitchOff,
    Busy,
    Flash,
    AnswerConfirm,
}

/// Confirmation word the chip sends on a separate report once off-hook audio is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerConfirm {
    pub report_id: u8,
    pub code: u16,
}

/// Button words for one chip family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTable {
    pub mute_toggle: u16,
    pub hook_on: u16,
    pub hook_off: u16,
    pub busy: u16,
    pub flash: Option<u16>,
    pub answer_confirm: Option<AnswerConfirm>,
}

/// Chip family, derived from the USB product id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    /// 8-bit button words, single status byte
    Classic,
    /// 16-bit button words, two status bytes, hold support
    Extended,
}

/// Everything that varies between chip families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipProfile {
    pub family: ChipFamily,
    pub output_report_id: u8,
    pub input_report_id: u8,
    pub width: ReportWidth,
    /// Status flags this chip actually implements
    pub flag_support: u16,
    pub commands: CommandTable,
}

pub const CLASSIC_PROFILE: ChipProfile = ChipProfile {
    family: ChipFamily::Classic,
    output_report_id: 0x01,
    input_report_id: 0x01,
    width: ReportWidth::Single,
    flag_support: FLAG_HOOK | FLAG_MUTE | FLAG_RING,
    commands: CommandTable {
        mute_toggle: 0x13,
        hook_on: 0x11,
        hook_off: 0x10,
        busy: 0x14,
        flash: None,
        answer_confirm: Some(AnswerConfirm {
            report_id: 0x02,
            code: 0x01,
        }),
    },
};

pub const EXTENDED_PROFILE: ChipProfile = ChipProfile {
    family: ChipFamily::Extended,
    output_report_id: 0x02,
    input_report_id: 0x01,
    width: ReportWidth::Double,
    flag_support: FLAG_HOOK | FLAG_MUTE | FLAG_RING | FLAG_HOLD,
    commands: CommandTable {
        mute_toggle: 0x0203,
        hook_on: 0x0201,
        hook_off: 0x0200,
        busy: 0x0204,
        flash: Some(0x0202),
        answer_confirm: None,
    },
};

/// Product ids of headsets built on the 16-bit chip
pub const EXTENDED_PRODUCT_IDS: &[u16] = &[0xB0A1, 0xB0A2, 0xB0B1, 0xB0C4];

impl ChipProfile {
    /// Pick the profile for a product id. Unknown products use the classic chip.
    pub fn for_product(product_id: u16) -> &'static ChipProfile {
        if EXTENDED_PRODUCT_IDS.contains(&product_id) {
            &EXTENDED_PROFILE
        } else {
            &CLASSIC_PROFILE
        }
    }

    /// Read the button word at the start of an input report payload.
    /// 16-bit words are big-endian.
    pub fn decode_word(&self, data: &[u8]) -> Option<u16> {
        match self.width {
            ReportWidth::Single => data.first().map(|b| *b as u16),
            ReportWidth::Double => match data {
                [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
                _ => None,
            },
        }
    }

    /// Map an input report to a button code. Unknown report ids and words yield `None`.
    pub fn classify(&self, report_id: u8, data: &[u8]) -> Option<ButtonCode> {
        let word = self.decode_word(data)?;

        if let Some(confirm) = self.commands.answer_confirm {
            if report_id == confirm.report_id {
                return (word == confirm.code).then_some(ButtonCode::AnswerConfirm);
            }
        }

        if report_id != self.input_report_id {
            return None;
        }

        let table = &self.commands;
        if word == table.mute_toggle {
            Some(ButtonCode::MuteToggle)
        } else if word == table.hook_on {
            Some(ButtonCode::HookSwitchOn)
        } else if word == table.hook_off {
            Some(ButtonCode::HookSwitchOff)
        } else if word == table.busy {
            Some(ButtonCode::Busy)
        } else if table.flash == Some(word) {
            Some(ButtonCode::Flash)
        } else {
            None
        }
    }

    /// Whether the chip implements `flag`
    pub fn supports(&self, flag: u16) -> bool {
        flag & self.flag_support != 0
    }
}

// ── WebSocket SDK frames ───────────────────────────────────────────
//
// Every frame is a JSON text message: { Event, EventType, CallID?, HeadsetName?, ... }
// The application sends Requests, the SDK answers with Acks and pushes Notifications.

/// Kind of a socket frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketEventType {
    Request,
    Ack,
    Notification,
}

/// One JSON frame on the vendor socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketFrame {
    #[serde(rename = "Event")]
    pub event: String,
    #[serde(rename = "EventType")]
    pub event_type: SocketEventType,
    #[serde(rename = "CallID", default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u32>,
    #[serde(rename = "HeadsetName", default, skip_serializing_if = "Option::is_none")]
    pub headset_name: Option<String>,
    #[serde(rename = "ReturnCode", default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
}

impl SocketFrame {
    pub fn request(event: &str) -> Self {
        Self {
            event: event.to_string(),
            event_type: SocketEventType::Request,
            call_id: None,
            headset_name: None,
            return_code: None,
        }
    }

    pub fn with_call_id(mut self, call_id: u32) -> Self {
        self.call_id = Some(call_id);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Socket event names
pub mod socket_events {
    pub const ESTABLISH_CONNECTION: &str = "SPEstablishConnection";
    pub const SYSTEM_INFORMATION: &str = "SystemInformation";
    pub const HEADSET_CONNECTED: &str = "HeadsetConnected";
    pub const HEADSET_DISCONNECTED: &str = "HeadsetDisconnected";
    pub const INCOMING_CALL: &str = "IncomingCall";
    pub const OUTGOING_CALL: &str = "OutgoingCall";
    pub const INCOMING_CALL_ACCEPTED: &str = "IncomingCallAccepted";
    pub const INCOMING_CALL_REJECTED: &str = "IncomingCallRejected";
    pub const CALL_ENDED: &str = "CallEnded";
    pub const MUTE_HEADSET: &str = "MuteHeadset";
    pub const UNMUTE_HEADSET: &str = "UnmuteHeadset";
    pub const MUTE_FROM_HEADSET: &str = "MuteFromHeadset";
    pub const UNMUTE_FROM_HEADSET: &str = "UnmuteFromHeadset";
    pub const HOLD: &str = "Hold";
    pub const RESUME: &str = "Resume";
    pub const HOLD_FROM_HEADSET: &str = "HoldFromHeadset";
    pub const RESUME_FROM_HEADSET: &str = "ResumeFromHeadset";
}

// ── Native-host bridge ─────────────────────────────────────────────
//
// Every message on the host's stdio: [len: u32 LE][UTF-8 JSON]

/// Largest bridge message accepted from the host
pub const MAX_BRIDGE_FRAME: usize = 1024 * 1024;

/// Command sent to the desktop host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRequest {
    #[serde(rename = "deviceID")]
    pub device_id: u32,
    pub event: String,
    pub value: bool,
}

/// Message pushed by the desktop host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub msg: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(rename = "hidInput", default, skip_serializing_if = "Option::is_none")]
    pub hid_input: Option<String>,
    #[serde(rename = "deviceID", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<u32>,
}

impl BridgeMessage {
    /// `value` as a boolean; the host sends either `true`/`false` or a string.
    pub fn value_flag(&self) -> bool {
        match &self.value {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// `value` as text (error messages)
    pub fn value_text(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Bridge message kinds (`msg` field)
pub mod bridge_msgs {
    pub const EVENT: &str = "Event";
    pub const ERROR: &str = "Error";
}

/// Bridge event names
pub mod bridge_events {
    pub const GET_ACTIVE_DEVICE: &str = "getactivedevice";
    pub const ACTIVE_DEVICE: &str = "activedevice";
    pub const DEVICE_DETACHED: &str = "device detached";
    pub const REQUEST_CALL_LOCK: &str = "requestcalllock";
    pub const RELEASE_CALL_LOCK: &str = "releasecalllock";
    pub const RING: &str = "ring";
    pub const OFF_HOOK: &str = "offhook";
    pub const MUTE: &str = "mute";
    pub const HOLD: &str = "hold";
}

/// HID usage codes reported in `hidInput`
pub mod bridge_hid_inputs {
    pub const HOOK_SWITCH: &str = "20";
    pub const FLASH: &str = "21";
    pub const REJECT: &str = "24";
    pub const PHONE_MUTE: &str = "2f";
}

/// Prefix a JSON payload with its little-endian length
pub fn encode_bridge_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Payload length from a 4-byte frame header. Rejects oversized frames.
pub fn bridge_frame_len(header: [u8; 4]) -> Option<usize> {
    let len = u32::from_le_bytes(header) as usize;
    (len <= MAX_BRIDGE_FRAME).then_some(len)
}

// ── REST hub ───────────────────────────────────────────────────────

/// Default hub address
pub const DEFAULT_SPOKES_URL: &str = "http://127.0.0.1:32017";

/// Envelope around every hub response
#[derive(Debug, Clone, Deserialize)]
pub struct SpokesResponse<T> {
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "Result")]
    pub result: Option<T>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(rename = "Err", default)]
    pub err: Option<SpokesError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpokesError {
    #[serde(rename = "Description", default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpokesDeviceInfo {
    #[serde(rename = "ProductName", default)]
    pub product_name: String,
    #[serde(rename = "Uid", default)]
    pub uid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpokesCallId {
    #[serde(rename = "Id")]
    pub id: u32,
}

/// One queued call event
#[derive(Debug, Clone, Deserialize)]
pub struct SpokesCallEvent {
    #[serde(rename = "Action")]
    pub action: u32,
    #[serde(rename = "CallId")]
    pub call_id: SpokesCallId,
}

/// Call action codes reported by the hub
pub const SPOKES_CALL_ACTIONS: &[(u32, &str)] = &[
    (1, "IncomingCall"),
    (2, "OutgoingCall"),
    (3, "TerminateCall"),
    (4, "HoldCall"),
    (5, "ResumeCall"),
    (6, "Mute"),
    (7, "Unmute"),
    (8, "AcceptCall"),
    (9, "RejectCall"),
    (10, "CallEnded"),
];

/// Name of a hub call action code
pub fn spokes_action_name(action: u32) -> Option<&'static str> {
    SPOKES_CALL_ACTIONS
        .iter()
        .find(|(code, _)| *code == action)
        .map(|(_, name)| *name)
}

/// `callID` query value: `{"Id":n}`
pub fn spokes_call_id_param(id: u32) -> String {
    serde_json::to_string(&SpokesCallId { id }).unwrap_or_default()
}

/// `contact` query value: `{"Name":"..."}`
pub fn spokes_contact_param(name: &str) -> String {
    serde_json::json!({ "Name": name }).to_string()
}
