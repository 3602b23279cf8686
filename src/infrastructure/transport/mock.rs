//! Scripted device for testing
//!
//! An in-process model of a bootloader in download mode, driven
//! directly by the transport calls. Tests share the device state
//! through a handle and inspect what was "flashed" afterwards, so the
//! whole engine can run end-to-end without hardware.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::infrastructure::odin::wire::{
    cmd, init, pit, xmit, Request, Response, REQUEST_LEN,
};
use crate::infrastructure::transport::{Transport, TransportKind};

const ONE_MIB: usize = 1024 * 1024;

/// One completed XMIT window.
#[derive(Debug, Clone)]
pub struct WindowRecord {
    pub part_id: i32,
    pub dev_type: i32,
    pub size_to_flash: i32,
    pub is_last: bool,
    pub compressed: bool,
}

#[derive(Debug, Default)]
pub struct DeviceState {
    pub proto: u16,
    pub compressed_supported: bool,
    pub pit_bytes: Vec<u8>,

    handshaken: bool,
    pit_set_armed: bool,
    pit_upload_remaining: usize,

    packet_size: i32,
    raw_remaining: u64,
    raw_buf: Vec<u8>,
    window_compressed: bool,
    windows_begun: usize,

    out: VecDeque<Vec<u8>>,

    /// Fail the transport when the n-th XMIT begin arrives (1-based).
    pub fail_on_window: Option<usize>,

    /// Everything the device received, in order.
    pub wire_in: Vec<u8>,
    /// Flashed bytes per partition id, padding stripped.
    pub flashed: BTreeMap<i32, Vec<u8>>,
    pub windows: Vec<WindowRecord>,
    pub uploaded_pit: Option<Vec<u8>>,
    pub total_size: u64,
    pub close_params: Vec<i32>,
}

/// Test-side handle to a scripted device.
#[derive(Clone)]
pub struct ScriptedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl ScriptedDevice {
    pub fn new(proto: u16, compressed_supported: bool, pit_bytes: Vec<u8>) -> ScriptedDevice {
        ScriptedDevice {
            state: Arc::new(Mutex::new(DeviceState {
                proto,
                compressed_supported,
                pit_bytes,
                ..DeviceState::default()
            })),
        }
    }

    /// Open a transport onto this device.
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            state: Arc::clone(&self.state),
            timeout: Duration::from_secs(1),
            connected: true,
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> R {
        f(&self.state.lock().unwrap())
    }

    pub fn fail_on_window(&self, n: usize) {
        self.state.lock().unwrap().fail_on_window = Some(n);
    }
}

pub struct MockTransport {
    state: Arc<Mutex<DeviceState>>,
    timeout: Duration,
    connected: bool,
}

impl DeviceState {
    fn respond(&mut self, id: i32, ack: i32) {
        self.out.push_back(Response { id, ack }.encode().to_vec());
    }

    fn packet_bytes(&self) -> u64 {
        if self.packet_size > 0 {
            self.packet_size as u64
        } else {
            128 * 1024
        }
    }

    fn handle_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.wire_in.extend_from_slice(data);

        if !self.handshaken {
            if !data.starts_with(b"ODIN") {
                return Err(Error::protocol("scripted device: expected ODIN probe"));
            }
            self.handshaken = true;
            self.out.push_back(b"LOKE".to_vec());
            return Ok(());
        }

        if self.pit_upload_remaining > 0 {
            let n = data.len().min(self.pit_upload_remaining);
            self.uploaded_pit
                .get_or_insert_with(Vec::new)
                .extend_from_slice(&data[..n]);
            self.pit_upload_remaining -= n;
            if self.pit_upload_remaining == 0 {
                self.respond(cmd::PIT, 0);
            }
            return Ok(());
        }

        if self.raw_remaining > 0 {
            // One packet per send call, one ack per packet.
            self.raw_buf.extend_from_slice(data);
            self.raw_remaining = self.raw_remaining.saturating_sub(data.len() as u64);
            self.respond(cmd::EMPTY, 0);
            return Ok(());
        }

        if data == b"@#AuToTEstRst@#" {
            return Ok(());
        }

        if data.len() != REQUEST_LEN {
            return Err(Error::protocol(format!(
                "scripted device: unexpected {}-byte message",
                data.len()
            )));
        }
        let rq = Request::decode(data.try_into().unwrap());
        self.handle_request(&rq)
    }

    fn handle_request(&mut self, rq: &Request) -> Result<()> {
        match (rq.id, rq.param) {
            (cmd::INIT, p) if p == init::TARGET => {
                let mut ack = (self.proto as i32) << 16;
                if self.compressed_supported {
                    ack |= 0x8000;
                }
                self.respond(cmd::INIT, ack);
            }
            (cmd::INIT, p) if p == init::PACKETSIZE => {
                self.packet_size = rq.int_data[0];
                self.respond(cmd::INIT, 0);
            }
            (cmd::INIT, p) if p == init::TOTALSIZE => {
                self.total_size = if self.proto <= 1 {
                    rq.int_data[0] as u64
                } else {
                    (rq.int_data[0] as u32 as u64) | ((rq.int_data[1] as u32 as u64) << 32)
                };
                self.respond(cmd::INIT, 0);
            }
            (cmd::PIT, p) if p == pit::GET => {
                self.respond(cmd::PIT, self.pit_bytes.len() as i32);
            }
            (cmd::PIT, p) if p == pit::SET => {
                self.pit_set_armed = true;
                self.respond(cmd::PIT, 0);
            }
            (cmd::PIT, p) if p == pit::START => {
                if self.pit_set_armed {
                    self.pit_set_armed = false;
                    self.pit_upload_remaining = rq.int_data[0] as usize;
                    self.respond(cmd::PIT, 0);
                } else {
                    let idx = rq.int_data[0] as usize;
                    let off = idx * 500;
                    let n = 500.min(self.pit_bytes.len() - off);
                    let chunk = self.pit_bytes[off..off + n].to_vec();
                    self.out.push_back(chunk);
                }
            }
            (cmd::PIT, p) if p == pit::COMPLETE => {
                self.respond(cmd::PIT, 0);
            }
            (cmd::XMIT, p) if p == xmit::DOWNLOAD || p == xmit::COMPRESSED_DOWNLOAD => {
                self.windows_begun += 1;
                if self.fail_on_window == Some(self.windows_begun) {
                    return Err(Error::DeviceGone("scripted device: injected failure".into()));
                }
                self.window_compressed = p == xmit::COMPRESSED_DOWNLOAD;
                self.respond(cmd::XMIT, 0);
            }
            (cmd::XMIT, p) if p == xmit::START || p == xmit::COMPRESSED_START => {
                let declared = rq.int_data[0] as u32 as u64;
                let pkt = self.packet_bytes();
                self.raw_remaining = declared.div_ceil(pkt) * pkt;
                self.raw_buf.clear();
                self.respond(cmd::XMIT, 0);
            }
            (cmd::XMIT, p) if p == xmit::COMPLETE || p == xmit::COMPRESSED_COMPLETE => {
                let size = rq.int_data[1];
                let dev_type = rq.int_data[3];
                let part_id = rq.int_data[4];
                let is_last = rq.int_data[5] != 0;
                let compressed = p == xmit::COMPRESSED_COMPLETE;

                let data = if compressed {
                    decompress_window(&self.raw_buf, size as u64)?
                } else {
                    self.raw_buf[..size as usize].to_vec()
                };
                self.flashed.entry(part_id).or_default().extend_from_slice(&data);
                self.windows.push(WindowRecord {
                    part_id,
                    dev_type,
                    size_to_flash: size,
                    is_last,
                    compressed,
                });
                self.raw_buf.clear();
                self.respond(cmd::XMIT, 0);
            }
            (cmd::CLOSE, p) => {
                self.close_params.push(p);
                self.respond(cmd::CLOSE, 0);
            }
            _ => {
                return Err(Error::protocol(format!(
                    "scripted device: unhandled request {}/{}",
                    rq.id, rq.param
                )));
            }
        }
        Ok(())
    }
}

/// Decode a window of LZ4 frame blocks the way the bootloader would.
fn decompress_window(raw: &[u8], decomp_size: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(decomp_size as usize);
    let mut off = 0usize;

    while (out.len() as u64) < decomp_size {
        if off + 4 > raw.len() {
            return Err(Error::protocol("scripted device: truncated block stream"));
        }
        let word = u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
        off += 4;

        let uncompressed = word & 0x8000_0000 != 0;
        let payload = (word & 0x7FFF_FFFF) as usize;
        if off + payload > raw.len() {
            return Err(Error::protocol("scripted device: truncated block payload"));
        }

        let expected = ((decomp_size - out.len() as u64) as usize).min(ONE_MIB);
        if uncompressed {
            out.extend_from_slice(&raw[off..off + payload]);
        } else {
            let mut block = vec![0u8; expected];
            let written = lz4_flex::block::decompress_into(&raw[off..off + payload], &mut block)
                .map_err(|e| Error::protocol(format!("scripted device: lz4: {e}")))?;
            block.truncate(written);
            out.extend_from_slice(&block);
        }
        off += payload;
    }

    Ok(out)
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::UsbBulk
    }

    fn connected(&self) -> bool {
        self.connected
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn send(&mut self, data: &[u8], _retries: u32) -> Result<()> {
        if !self.connected {
            return Err(Error::DeviceGone("mock: not connected".into()));
        }
        let result = self.state.lock().unwrap().handle_bytes(data);
        if result.is_err() {
            self.connected = false;
        }
        result
    }

    fn recv(&mut self, buf: &mut [u8], _retries: u32) -> Result<usize> {
        if !self.connected {
            return Err(Error::DeviceGone("mock: not connected".into()));
        }

        let mut st = self.state.lock().unwrap();
        let Some(mut msg) = st.out.pop_front() else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "mock: nothing to read",
            )));
        };

        let n = msg.len().min(buf.len());
        buf[..n].copy_from_slice(&msg[..n]);
        if n < msg.len() {
            msg.drain(..n);
            st.out.push_front(msg);
        }
        Ok(n)
    }

    fn recv_zlp(&mut self, _retries: u32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::odin::commands::OdinLink;
    use crate::infrastructure::odin::pit_transfer::download_pit_bytes;

    #[test]
    fn handshake_and_version() {
        let dev = ScriptedDevice::new(3, true, vec![0u8; 28]);
        let mut t = dev.transport();
        let mut odin = OdinLink::new(&mut t);

        odin.handshake(0).unwrap();
        let info = odin.get_version(0).unwrap();
        assert_eq!(info.protocol() as i32, 3);
        assert!(info.supports_compressed_download());
    }

    #[test]
    fn pit_download_chunking() {
        // 1203 bytes: two full chunks and a 203-byte tail.
        let pit: Vec<u8> = (0..1203u32).map(|i| (i % 256) as u8).collect();
        let dev = ScriptedDevice::new(3, false, pit.clone());
        let mut t = dev.transport();
        let mut odin = OdinLink::new(&mut t);

        odin.handshake(0).unwrap();
        let bytes = download_pit_bytes(&mut odin, 0).unwrap();
        assert_eq!(bytes, pit);
    }

    #[test]
    fn pit_upload_round_trip() {
        let dev = ScriptedDevice::new(3, false, Vec::new());
        let mut t = dev.transport();
        let mut odin = OdinLink::new(&mut t);

        odin.handshake(0).unwrap();
        let blob: Vec<u8> = (0..999u32).map(|i| (i % 251) as u8).collect();
        odin.set_pit(&blob, 0).unwrap();

        dev.with_state(|s| assert_eq!(s.uploaded_pit.as_deref(), Some(&blob[..])));
    }
}
