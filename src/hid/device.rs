//! hidapi-backed HID provider

use super::provider::{
    matches_any, DeviceFilter, HidDeviceInfo, HidProvider, HidSession, HidWriter, InputReport,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Polling interval while waiting for a device to appear
const RECONNECT_INITIAL_MS: u64 = 500;
const RECONNECT_MAX_MS: u64 = 5000;

/// Largest input report we expect from a headset
const INPUT_BUFFER_SIZE: usize = 64;

/// Desktop HID access through hidapi.
///
/// There is no permission prompt on desktop: every enumerated device is
/// permitted, and `request_device` waits for one to be plugged in.
pub struct HidApiProvider {
    /// HID API instance, absent when initialization failed
    api: Option<Arc<Mutex<HidApi>>>,
    /// Reader thread poll timeout
    read_timeout_ms: i32,
}

impl HidApiProvider {
    pub fn new(read_timeout_ms: i32) -> Self {
        let api = match HidApi::new() {
            Ok(api) => Some(Arc::new(Mutex::new(api))),
            Err(e) => {
                warn!("Failed to initialize HID API: {}", e);
                None
            }
        };
        Self {
            api,
            read_timeout_ms,
        }
    }

    fn api(&self) -> Result<Arc<Mutex<HidApi>>> {
        self.api
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| anyhow!("HID API is not available"))
    }
}

#[async_trait]
impl HidProvider for HidApiProvider {
    fn is_available(&self) -> bool {
        self.api.is_some()
    }

    async fn permitted_devices(&self, filters: &[DeviceFilter]) -> Result<Vec<HidDeviceInfo>> {
        let api = self.api()?;
        let filters = filters.to_vec();
        tokio::task::spawn_blocking(move || list_devices(&api, &filters))
            .await
            .context("HID enumeration task failed")
    }

    async fn request_device(&self, filters: &[DeviceFilter]) -> Result<Option<HidDeviceInfo>> {
        let mut interval_ms = RECONNECT_INITIAL_MS;
        loop {
            if let Some(device) = self.permitted_devices(filters).await?.into_iter().next() {
                return Ok(Some(device));
            }
            interval_ms = (interval_ms * 3 / 2).min(RECONNECT_MAX_MS);
            debug!("No matching HID device, next attempt in {}ms", interval_ms);
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }

    async fn open(&self, device: &HidDeviceInfo) -> Result<HidSession> {
        let api = self.api()?;
        let path = CString::new(device.path.clone()).context("Invalid HID device path")?;

        let hid = tokio::task::spawn_blocking(move || -> Result<HidDevice> {
            let dev = api
                .lock()
                .open_path(&path)
                .context("Failed to open HID device")?;
            dev.set_blocking_mode(false)
                .context("Failed to set non-blocking mode")?;
            Ok(dev)
        })
        .await
        .context("HID open task failed")??;

        info!(
            "Opened HID device: {} ({:04x}:{:04x})",
            device.product_name, device.vendor_id, device.product_id
        );

        let hid = Arc::new(Mutex::new(hid));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        start_reader_thread(Arc::clone(&hid), Arc::clone(&stop), tx, self.read_timeout_ms)?;

        Ok(HidSession {
            writer: Box::new(HidApiWriter { device: hid, stop }),
            reports: rx,
        })
    }
}

struct HidApiWriter {
    device: Arc<Mutex<HidDevice>>,
    /// Tells the reader thread to exit
    stop: Arc<AtomicBool>,
}

#[async_trait]
impl HidWriter for HidApiWriter {
    async fn write_output_report(&self, report_id: u8, data: &[u8]) -> Result<()> {
        let mut buffer = Vec::with_capacity(data.len() + 1);
        buffer.push(report_id);
        buffer.extend_from_slice(data);

        let device = Arc::clone(&self.device);
        let written = tokio::task::spawn_blocking(move || {
            device
                .lock()
                .write(&buffer)
                .context("Failed to write to HID device")
        })
        .await
        .context("HID write task failed")??;

        debug!("Wrote {} bytes to HID device (report {:#04x})", written, report_id);
        Ok(())
    }

    async fn close(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for HidApiWriter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn list_devices(api: &Mutex<HidApi>, filters: &[DeviceFilter]) -> Vec<HidDeviceInfo> {
    let mut api_guard = api.lock();
    if let Err(e) = api_guard.refresh_devices() {
        debug!("Failed to refresh device list: {}", e);
    }

    let mut devices: Vec<HidDeviceInfo> = Vec::new();
    for info in api_guard.device_list() {
        let device = HidDeviceInfo {
            path: info.path().to_string_lossy().into_owned(),
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            product_name: info.product_string().unwrap_or("Unknown").to_string(),
        };
        // One entry per path; composite devices list each interface
        if matches_any(filters, &device) && !devices.iter().any(|d| d.path == device.path) {
            devices.push(device);
        }
    }
    devices
}

/// Forward input reports until the device fails, the receiver is dropped,
/// or the writer is closed.
fn start_reader_thread(
    device: Arc<Mutex<HidDevice>>,
    stop: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<InputReport>,
    timeout_ms: i32,
) -> Result<()> {
    thread::Builder::new()
        .name("hid-reader".to_string())
        .spawn(move || {
            info!("HID reader thread started");
            let mut buffer = [0u8; INPUT_BUFFER_SIZE];

            while !stop.load(Ordering::Relaxed) {
                let read = device.lock().read_timeout(&mut buffer, timeout_ms);
                match read {
                    Ok(n) if n > 0 => {
                        let report = InputReport {
                            report_id: buffer[0],
                            data: buffer[1..n].to_vec(),
                        };
                        debug!("HID input report {:#04x} {:02x?}", report.report_id, report.data);
                        if tx.send(report).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {
                        // Timeout; release the lock so writes can go through
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        warn!("HID read error: {}", e);
                        break;
                    }
                }
            }
            info!("HID reader thread stopped");
        })
        .context("Failed to spawn HID reader thread")?;
    Ok(())
}
