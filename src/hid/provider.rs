//! HID platform capability injected into binary-report engines

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A HID device as seen during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceInfo {
    /// Platform path used to open the device
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_name: String,
}

/// Enumeration filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: None,
        }
    }

    pub fn matches(&self, device: &HidDeviceInfo) -> bool {
        device.vendor_id == self.vendor_id
            && self.product_id.map_or(true, |pid| pid == device.product_id)
    }
}

/// Whether any filter accepts the device
pub fn matches_any(filters: &[DeviceFilter], device: &HidDeviceInfo) -> bool {
    filters.iter().any(|f| f.matches(device))
}

/// One input report, split into report id and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputReport {
    pub report_id: u8,
    pub data: Vec<u8>,
}

/// Output side of an open device
#[async_trait]
pub trait HidWriter: Send + Sync {
    async fn write_output_report(&self, report_id: u8, data: &[u8]) -> Result<()>;

    /// Close the device. The input report stream ends afterwards.
    async fn close(&self);
}

/// An open device: writer plus its input report stream
pub struct HidSession {
    pub writer: Box<dyn HidWriter>,
    pub reports: mpsc::UnboundedReceiver<InputReport>,
}

#[async_trait]
pub trait HidProvider: Send + Sync {
    /// Whether the platform HID API could be initialized
    fn is_available(&self) -> bool;

    /// Devices that can be opened without asking the user
    async fn permitted_devices(&self, filters: &[DeviceFilter]) -> Result<Vec<HidDeviceInfo>>;

    /// Wait until the user grants (or plugs in) a matching device.
    /// Does not time out on its own; callers bound the wait.
    async fn request_device(&self, filters: &[DeviceFilter]) -> Result<Option<HidDeviceInfo>>;

    async fn open(&self, device: &HidDeviceInfo) -> Result<HidSession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(vendor_id: u16, product_id: u16) -> HidDeviceInfo {
        HidDeviceInfo {
            path: "p".to_string(),
            vendor_id,
            product_id,
            product_name: "Headset".to_string(),
        }
    }

    #[test]
    fn test_filter_matching() {
        let any_product = DeviceFilter::vendor(0x6993);
        assert!(any_product.matches(&device(0x6993, 0x0001)));
        assert!(!any_product.matches(&device(0x0B0E, 0x0001)));

        let exact = DeviceFilter {
            vendor_id: 0x6993,
            product_id: Some(0xB0A1),
        };
        assert!(exact.matches(&device(0x6993, 0xB0A1)));
        assert!(!exact.matches(&device(0x6993, 0x0001)));
        assert!(matches_any(&[exact, any_product], &device(0x6993, 0x0001)));
        assert!(!matches_any(&[], &device(0x6993, 0x0001)));
    }
}
