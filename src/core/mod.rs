//! Core module - Configuration, errors, events, and the headset service

pub mod config;
pub mod conversations;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod service;

pub use config::Config;
pub use error::{HeadsetError, Result};
pub use events::{ConnectionStatus, HeadsetEvent, VendorEmitter, VendorEventBus};
pub use service::HeadsetService;
