//! HID module - Platform HID access for binary-report headsets

mod device;
#[cfg(any(test, feature = "mock-hid"))]
pub mod mock;
mod provider;

pub use device::HidApiProvider;
pub use provider::{
    matches_any, DeviceFilter, HidDeviceInfo, HidProvider, HidSession, HidWriter, InputReport,
};
