//! Download-mode device enumeration
//!
//! The core consumes enumeration through a trait so the engine stays
//! independent of the host USB stack; the nusb implementation below is
//! the only one shipped.

use log::debug;

use crate::error::{Error, Result};
use crate::infrastructure::transport::usb::UsbTransport;
use crate::infrastructure::transport::Transport;

pub const SAMSUNG_VID: u16 = 0x04E8;
/// Product ids a device exposes in Odin download mode.
pub const ODIN_PIDS: [u16; 3] = [0x6601, 0x685D, 0x68C3];

/// One enumerated download-mode device.
#[derive(Debug, Clone)]
pub struct UsbDeviceInfo {
    /// Stable per-session identifier (`bus-address`), used by `--target`.
    pub sysname: String,
    pub vendor: u16,
    pub product: u16,
    pub serial: Option<String>,
}

impl UsbDeviceInfo {
    pub fn describe(&self) -> String {
        match &self.serial {
            Some(s) => format!(
                "{} [{:04x}:{:04x}] serial={}",
                self.sysname, self.vendor, self.product, s
            ),
            None => format!("{} [{:04x}:{:04x}]", self.sysname, self.vendor, self.product),
        }
    }
}

/// Platform device discovery, consumed by the CLI flows.
pub trait DeviceEnumerator {
    /// All devices currently in download mode.
    fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>>;

    /// Any device matching `sysname`, regardless of VID/PID.
    fn find_by_sysname(&self, sysname: &str) -> Result<Option<UsbDeviceInfo>>;

    /// Open a transport onto an enumerated device.
    fn open(&self, sysname: &str) -> Result<Box<dyn Transport>>;
}

/// nusb-backed enumerator.
pub struct NusbEnumerator;

impl NusbEnumerator {
    fn list(&self) -> Result<Vec<(nusb::DeviceInfo, UsbDeviceInfo)>> {
        let devices = nusb::list_devices()
            .map_err(|e| Error::DeviceGone(format!("USB enumeration failed: {e}")))?;

        Ok(devices
            .map(|d| {
                let info = UsbDeviceInfo {
                    sysname: format!("{}-{}", d.bus_number(), d.device_address()),
                    vendor: d.vendor_id(),
                    product: d.product_id(),
                    serial: d.serial_number().map(str::to_string),
                };
                (d, info)
            })
            .collect())
    }
}

impl DeviceEnumerator for NusbEnumerator {
    fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>> {
        let found: Vec<UsbDeviceInfo> = self
            .list()?
            .into_iter()
            .map(|(_, info)| info)
            .filter(|i| i.vendor == SAMSUNG_VID && ODIN_PIDS.contains(&i.product))
            .collect();
        debug!("enumerated {} download-mode device(s)", found.len());
        Ok(found)
    }

    fn find_by_sysname(&self, sysname: &str) -> Result<Option<UsbDeviceInfo>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|(_, info)| info)
            .find(|i| i.sysname == sysname))
    }

    fn open(&self, sysname: &str) -> Result<Box<dyn Transport>> {
        let (dev, _) = self
            .list()?
            .into_iter()
            .find(|(_, i)| i.sysname == sysname)
            .ok_or_else(|| Error::DeviceGone(format!("no device with sysname {sysname}")))?;

        let device = dev
            .open()
            .map_err(|e| Error::DeviceGone(format!("cannot open {sysname}: {e}")))?;
        Ok(Box::new(UsbTransport::open(device)?))
    }
}
