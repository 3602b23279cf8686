//! Bulk-USB transport over nusb
//!
//! A device in download mode exposes one interface with a bulk IN and
//! a bulk OUT endpoint. Writes are chunked; after each complete write a
//! zero-length packet is emitted as terminator until the device rejects
//! one, after which the latch stays off (some bootloaders accept ZLPs,
//! others stall the first one — that stall is not an error).

use std::time::Duration;

use async_io::Timer;
use futures_lite::future::block_on;
use futures_lite::FutureExt;
use log::{debug, trace};
use nusb::transfer::{Direction, EndpointType, RequestBuffer, TransferError};

use crate::error::{Error, Result};
use crate::infrastructure::transport::{Transport, TransportKind};

/// Bulk write chunk. Conservative usbfs-compatible value.
const BULK_CHUNK: usize = 16 * 1024;

const RETRY_PAUSE: Duration = Duration::from_millis(10);
const ZLP_SEND_TIMEOUT: Duration = Duration::from_millis(100);
const ZLP_RECV_TIMEOUT: Duration = Duration::from_millis(10);

pub struct UsbTransport {
    _device: nusb::Device, // Kept to maintain the claim
    interface: nusb::Interface,
    ep_in: u8,
    ep_out: u8,
    timeout: Duration,
    connected: bool,
    zlp_needed: bool,
}

impl UsbTransport {
    /// Claim the download-mode interface of an opened device and locate
    /// its bulk endpoint pair.
    pub fn open(device: nusb::Device) -> Result<UsbTransport> {
        let config = device.active_configuration().map_err(|e| {
            Error::DeviceGone(format!("cannot read active configuration: {e}"))
        })?;

        let mut found = None;
        for group in config.interfaces() {
            for alt in group.alt_settings() {
                let mut ep_in = 0u8;
                let mut ep_out = 0u8;
                for ep in alt.endpoints() {
                    if ep.transfer_type() != EndpointType::Bulk {
                        continue;
                    }
                    match ep.direction() {
                        Direction::In => ep_in = ep.address(),
                        Direction::Out => ep_out = ep.address(),
                    }
                }
                if ep_in != 0 && ep_out != 0 {
                    found = Some((alt.interface_number(), ep_in, ep_out));
                    break;
                }
            }
            if found.is_some() {
                break;
            }
        }

        let (ifc, ep_in, ep_out) = found.ok_or_else(|| {
            Error::DeviceGone("no interface with a bulk IN/OUT endpoint pair".into())
        })?;

        debug!("claiming interface {ifc} (IN 0x{ep_in:02x}, OUT 0x{ep_out:02x})");
        let interface = device.claim_interface(ifc)?;

        Ok(UsbTransport {
            _device: device,
            interface,
            ep_in,
            ep_out,
            timeout: Duration::from_secs(1),
            connected: true,
            zlp_needed: true,
        })
    }

    fn map_transfer_error(&mut self, e: TransferError) -> Error {
        if matches!(e, TransferError::Disconnected) {
            self.connected = false;
            return Error::DeviceGone("usb: device disconnected".into());
        }
        Error::Transfer(e)
    }

    fn bulk_write(&self, data: &[u8], timeout: Duration) -> std::result::Result<(), TransferError> {
        let fut = self.interface.bulk_out(self.ep_out, data.to_vec());
        block_on(
            async { fut.await.status }.or(async {
                Timer::after(timeout).await;
                Err(TransferError::Cancelled)
            }),
        )
    }

    fn bulk_read(&self, len: usize, timeout: Duration) -> std::result::Result<Vec<u8>, TransferError> {
        let fut = self.interface.bulk_in(self.ep_in, RequestBuffer::new(len));
        block_on(
            async { fut.await.into_result() }.or(async {
                Timer::after(timeout).await;
                Err(TransferError::Cancelled)
            }),
        )
    }
}

impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::UsbBulk
    }

    fn connected(&self) -> bool {
        self.connected
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout.max(Duration::from_millis(1));
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn send(&mut self, data: &[u8], retries: u32) -> Result<()> {
        if !self.connected {
            return Err(Error::DeviceGone("usb: not connected".into()));
        }

        for chunk in data.chunks(BULK_CHUNK) {
            let mut attempt = 0u32;
            loop {
                match self.bulk_write(chunk, self.timeout) {
                    Ok(()) => break,
                    Err(e) => {
                        let err = self.map_transfer_error(e);
                        if matches!(err, Error::DeviceGone(_)) || attempt >= retries {
                            return Err(err);
                        }
                        attempt += 1;
                        std::thread::sleep(RETRY_PAUSE);
                    }
                }
            }
        }
        trace!("usb out: {} bytes", data.len());

        if self.zlp_needed && self.bulk_write(&[], ZLP_SEND_TIMEOUT).is_err() {
            // Latch off after the first rejection; never an error.
            self.zlp_needed = false;
        }

        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], retries: u32) -> Result<usize> {
        if !self.connected {
            return Err(Error::DeviceGone("usb: not connected".into()));
        }
        if buf.is_empty() {
            return self.recv_zlp(retries).map(|_| 0);
        }

        let mut off = 0;
        while off < buf.len() {
            let want = (buf.len() - off).min(BULK_CHUNK);

            let mut attempt = 0u32;
            let data = loop {
                match self.bulk_read(want, self.timeout) {
                    Ok(data) => break data,
                    Err(e) => {
                        let err = self.map_transfer_error(e);
                        if matches!(err, Error::DeviceGone(_)) || attempt >= retries {
                            return Err(err);
                        }
                        attempt += 1;
                        std::thread::sleep(RETRY_PAUSE);
                    }
                }
            };

            buf[off..off + data.len()].copy_from_slice(&data);
            off += data.len();
            // A short packet ends the transfer.
            if data.len() < want {
                break;
            }
        }

        trace!("usb in: {off} bytes");
        Ok(off)
    }

    fn recv_zlp(&mut self, _retries: u32) -> Result<()> {
        if !self.connected {
            return Err(Error::DeviceGone("usb: not connected".into()));
        }
        let _ = self.bulk_read(0, ZLP_RECV_TIMEOUT);
        Ok(())
    }
}
