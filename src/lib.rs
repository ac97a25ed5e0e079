//! Headset Bridge
//!
//! Call-control bridge between a softphone and vendor headsets.
//!
//! # Features
//! - Selects one vendor implementation from the active microphone label
//! - Suppresses redundant device commands with per-conversation state
//! - Re-emits device-originated signals as canonical events
//! - Drives Yealink headsets over raw HID reports
//! - Talks to the Sennheiser/EPOS, Poly and Jabra vendor services

pub mod core;
pub mod engines;
pub mod hid;
pub mod registry;
pub mod vendor;

pub use crate::core::config::Config;
pub use crate::core::error::{HeadsetError, Result};
pub use crate::core::events::{ConnectionStatus, HeadsetEvent, VendorEventBus};
pub use crate::core::service::HeadsetService;
pub use crate::vendor::{CallInfo, VendorId, VendorImplementation};
