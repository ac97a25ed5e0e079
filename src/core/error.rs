//! Error kinds surfaced by vendor engines and the headset service

use crate::vendor::VendorId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeadsetError {
    /// A vendor engine was asked for a capability it does not implement
    #[error("{vendor} does not implement {method}")]
    NotImplemented {
        vendor: VendorId,
        method: &'static str,
    },

    #[error("No headset implementation is connected")]
    NotConnected,

    #[error("{vendor} did not connect within {waited:?}")]
    ConnectionTimeout { vendor: VendorId, waited: Duration },

    #[error("Ignored protocol input: {0}")]
    ProtocolDecode(String),

    /// The vendor SDK reported a call lock already held / not held
    #[error("Resource ownership conflict: {0}")]
    ResourceConflict(String),

    #[error("No active headset")]
    NoActiveHeadset,

    #[error("A conversationId is required to start a call")]
    MissingConversationId,

    #[error("{vendor} SDK error: {message}")]
    Sdk { vendor: VendorId, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl HeadsetError {
    /// Conditions the service recovers from locally instead of failing the caller
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HeadsetError::NotConnected
                | HeadsetError::ConnectionTimeout { .. }
                | HeadsetError::ProtocolDecode(_)
                | HeadsetError::ResourceConflict(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HeadsetError>;
