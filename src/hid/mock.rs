//! In-memory HID provider for tests and dry runs

use super::provider::{
    matches_any, DeviceFilter, HidDeviceInfo, HidProvider, HidSession, HidWriter, InputReport,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct MockState {
    unavailable: bool,
    permitted: Vec<HidDeviceInfo>,
    /// Returned by `request_device`; `None` keeps the request pending forever
    grantable: Option<HidDeviceInfo>,
    writes: Vec<(u8, Vec<u8>)>,
    reports: Option<mpsc::UnboundedSender<InputReport>>,
    open_count: usize,
    close_count: usize,
    /// Every write fails while set
    fail_writes: bool,
    /// Time each write takes to complete
    write_delay: Option<Duration>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Scriptable HID provider. Clones share state, so a test can keep one handle
/// while the engine owns another.
#[derive(Clone, Default)]
pub struct MockHidProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockHidProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose platform API failed to initialize
    pub fn unavailable() -> Self {
        let provider = Self::default();
        provider.state.lock().unavailable = true;
        provider
    }

    pub fn with_permitted(self, device: HidDeviceInfo) -> Self {
        self.state.lock().permitted.push(device);
        self
    }

    pub fn with_grantable(self, device: HidDeviceInfo) -> Self {
        self.state.lock().grantable = Some(device);
        self
    }

    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.state.lock().write_delay = Some(delay);
        self
    }

    /// Make subsequent output report writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Most writes ever in progress at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().peak_in_flight
    }

    /// Output reports written so far, as (report id, payload)
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    pub fn last_write(&self) -> Option<(u8, Vec<u8>)> {
        self.state.lock().writes.last().cloned()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Deliver an input report to the open session. False when nothing is open.
    pub fn push_report(&self, report_id: u8, data: &[u8]) -> bool {
        let state = self.state.lock();
        match &state.reports {
            Some(tx) => tx
                .send(InputReport {
                    report_id,
                    data: data.to_vec(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Simulate the device being unplugged
    pub fn unplug(&self) {
        self.state.lock().reports = None;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }
}

#[async_trait]
impl HidProvider for MockHidProvider {
    fn is_available(&self) -> bool {
        !self.state.lock().unavailable
    }

    async fn permitted_devices(&self, filters: &[DeviceFilter]) -> Result<Vec<HidDeviceInfo>> {
        Ok(self
            .state
            .lock()
            .permitted
            .iter()
            .filter(|d| matches_any(filters, d))
            .cloned()
            .collect())
    }

    async fn request_device(&self, filters: &[DeviceFilter]) -> Result<Option<HidDeviceInfo>> {
        let granted = self
            .state
            .lock()
            .grantable
            .clone()
            .filter(|d| matches_any(filters, d));
        match granted {
            Some(device) => {
                self.state.lock().permitted.push(device.clone());
                Ok(Some(device))
            }
            None => std::future::pending().await,
        }
    }

    async fn open(&self, _device: &HidDeviceInfo) -> Result<HidSession> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(anyhow!("HID API is not available"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.reports = Some(tx);
        state.open_count += 1;

        Ok(HidSession {
            writer: Box::new(MockWriter {
                state: Arc::clone(&self.state),
            }),
            reports: rx,
        })
    }
}

struct MockWriter {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl HidWriter for MockWriter {
    async fn write_output_report(&self, report_id: u8, data: &[u8]) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            if state.reports.is_none() {
                return Err(anyhow!("HID device is closed"));
            }
            if state.fail_writes {
                return Err(anyhow!("output report {:#04x} rejected", report_id));
            }
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            state.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.in_flight -= 1;
        state.writes.push((report_id, data.to_vec()));
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.reports = None;
        state.close_count += 1;
    }
}

/// Device descriptor helper for tests
pub fn device_info(vendor_id: u16, product_id: u16, product_name: &str) -> HidDeviceInfo {
    HidDeviceInfo {
        path: format!("mock:{:04x}:{:04x}", vendor_id, product_id),
        vendor_id,
        product_id,
        product_name: product_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_are_recorded() {
        let provider = MockHidProvider::new().with_permitted(device_info(0x6993, 1, "UH36"));
        let devices = provider
            .permitted_devices(&[DeviceFilter::vendor(0x6993)])
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);

        let mut session = provider.open(&devices[0]).await.unwrap();
        session.writer.write_output_report(0x01, &[0x01]).await.unwrap();
        assert_eq!(provider.last_write(), Some((0x01, vec![0x01])));

        assert!(provider.push_report(0x01, &[0x13]));
        let report = session.reports.recv().await.unwrap();
        assert_eq!(report.data, vec![0x13]);

        session.writer.close().await;
        assert!(session.reports.recv().await.is_none());
        assert!(session.writer.write_output_report(0x01, &[0]).await.is_err());
        assert_eq!(provider.close_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_writes_are_not_recorded() {
        let provider = MockHidProvider::new().with_permitted(device_info(0x6993, 1, "UH36"));
        let session = provider.open(&device_info(0x6993, 1, "UH36")).await.unwrap();
        provider.fail_writes(true);
        assert!(session.writer.write_output_report(0x01, &[0x01]).await.is_err());
        assert!(provider.writes().is_empty());

        provider.fail_writes(false);
        session.writer.write_output_report(0x01, &[0x01]).await.unwrap();
        assert_eq!(provider.writes().len(), 1);
        assert_eq!(provider.peak_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_without_grant_stays_pending() {
        let provider = MockHidProvider::new();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            provider.request_device(&[DeviceFilter::vendor(0x6993)]),
        )
        .await;
        assert!(result.is_err());
    }
}
