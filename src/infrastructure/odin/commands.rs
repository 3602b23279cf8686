//! Odin command layer
//!
//! Request/response sequencing over a [`Transport`]. Every command is
//! strictly ordered on a single target: a response is consumed before
//! the next request goes out.

use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::infrastructure::odin::wire::{
    close, cmd, init, pit, xmit, Request, Response, RESPONSE_LEN,
};
use crate::infrastructure::transport::{Transport, TransportKind};

const BOOTLOADER_FAIL: i32 = -1; // 0xFFFFFFFF on the wire

/// PIT download transfer unit.
const PIT_TRANSMIT_UNIT: usize = 500;

/// Literal the bootloader expects after `CLOSE/REDOWNLOAD`.
const AUTOTEST_RESET: &[u8] = b"@#AuToTEstRst@#";

pub const DEFAULT_RETRIES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl ProtocolVersion {
    fn from_raw(raw: u16) -> ProtocolVersion {
        match raw {
            0 | 1 => ProtocolVersion::V1,
            2 => ProtocolVersion::V2,
            3 => ProtocolVersion::V3,
            4 => ProtocolVersion::V4,
            _ => ProtocolVersion::V5,
        }
    }
}

/// Ack word of `INIT/TARGET`: protocol version in the upper half, the
/// compressed-download feature bit at 0x8000.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitTargetInfo {
    pub ack_word: u32,
}

impl InitTargetInfo {
    pub fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::from_raw((self.ack_word >> 16) as u16)
    }

    pub fn supports_compressed_download(&self) -> bool {
        self.ack_word & 0x8000 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    NoReboot,
    Reboot,
    ReDownload,
}

/// Command methods over one borrowed transport.
pub struct OdinLink<'a> {
    conn: &'a mut dyn Transport,
}

impl<'a> OdinLink<'a> {
    pub fn new(conn: &'a mut dyn Transport) -> OdinLink<'a> {
        OdinLink { conn }
    }

    fn require_connected(&self) -> Result<()> {
        if self.conn.connected() {
            Ok(())
        } else {
            Err(Error::DeviceGone("transport not connected".into()))
        }
    }

    pub fn send_raw(&mut self, data: &[u8], retries: u32) -> Result<()> {
        self.require_connected()?;
        self.conn.send(data, retries)
    }

    pub fn recv_raw(&mut self, data: &mut [u8], retries: u32) -> Result<()> {
        self.require_connected()?;
        let mut off = 0;
        while off < data.len() {
            let got = self.conn.recv(&mut data[off..], retries)?;
            if got == 0 {
                return Err(Error::protocol("receive returned no data"));
            }
            off += got;
        }
        Ok(())
    }

    fn send_request(&mut self, rq: &Request, retries: u32) -> Result<()> {
        self.send_raw(&rq.encode(), retries)
    }

    /// Read one response and validate it. With `read_ack` the ack word
    /// is returned to the caller; otherwise a negative ack fails.
    pub fn recv_checked_response(
        &mut self,
        expected_id: i32,
        read_ack: bool,
        retries: u32,
    ) -> Result<Response> {
        let mut buf = [0u8; RESPONSE_LEN];
        self.recv_raw(&mut buf, retries)?;
        let r = Response::decode(&buf);

        if r.id == BOOTLOADER_FAIL {
            return Err(Error::protocol("bootloader returned FAIL"));
        }
        if r.id == i32::MIN {
            return Err(Error::protocol("invalid response id"));
        }
        if r.id != expected_id {
            return Err(Error::protocol(format!(
                "unexpected response id {} (expected {})",
                r.id, expected_id
            )));
        }
        if !read_ack && r.ack < 0 {
            return Err(Error::protocol(format!("operation failed (ack {})", r.ack)));
        }
        Ok(r)
    }

    fn rpc(&mut self, id: i32, param: i32, ints: &[i32], read_ack: bool, retries: u32) -> Result<Response> {
        self.send_request(&Request::new(id, param, ints), retries)?;
        self.recv_checked_response(id, read_ack, retries)
    }

    /// Probe with `"ODIN"` and expect `"LOKE"` back. USB carries a
    /// trailing NUL; the rest of a longer USB reply is discarded by the
    /// short-read semantics of the transport.
    pub fn handshake(&mut self, retries: u32) -> Result<()> {
        self.require_connected()?;

        if self.conn.kind() == TransportKind::UsbBulk {
            self.send_raw(b"ODIN\0", retries)?;
        } else {
            self.send_raw(b"ODIN", retries)?;
        }

        let mut resp = [0u8; 64];
        let mut have = 0;
        while have < 4 {
            let got = self.conn.recv(&mut resp[have..], retries)?;
            if got == 0 {
                return Err(Error::protocol("handshake receive failed"));
            }
            have += got;
        }

        if &resp[..4] != b"LOKE" {
            return Err(Error::protocol("handshake failed (expected LOKE)"));
        }
        Ok(())
    }

    /// Request protocol v5; the device answers with what it speaks.
    pub fn get_version(&mut self, retries: u32) -> Result<InitTargetInfo> {
        let r = self.rpc(cmd::INIT, init::TARGET, &[ProtocolVersion::V5 as i32], true, retries)?;
        let info = InitTargetInfo { ack_word: r.ack as u32 };
        debug!(
            "device protocol {:?}, compressed={}",
            info.protocol(),
            info.supports_compressed_download()
        );
        Ok(info)
    }

    pub fn setup_transfer_packet_size(&mut self, packet_size: i32, retries: u32) -> Result<()> {
        self.rpc(cmd::INIT, init::PACKETSIZE, &[packet_size], false, retries)?;
        Ok(())
    }

    /// v0/v1 devices take a single i32; v2+ split into low/high words.
    pub fn send_total_size(&mut self, total: u64, proto: ProtocolVersion, retries: u32) -> Result<()> {
        if proto <= ProtocolVersion::V1 {
            if total > i32::MAX as u64 {
                return Err(Error::protocol("TOTALSIZE exceeds int32 limit on protocol v1"));
            }
            self.rpc(cmd::INIT, init::TOTALSIZE, &[total as i32], false, retries)?;
        } else {
            let lo = (total & 0xFFFF_FFFF) as u32 as i32;
            let hi = (total >> 32) as u32 as i32;
            self.rpc(cmd::INIT, init::TOTALSIZE, &[lo, hi], false, retries)?;
        }
        Ok(())
    }

    pub fn get_pit_size(&mut self, retries: u32) -> Result<i32> {
        let r = self.rpc(cmd::PIT, pit::GET, &[], true, retries)?;
        Ok(r.ack)
    }

    /// Download the PIT into `out` (sized from [`Self::get_pit_size`])
    /// in 500-byte chunks, then consume the trailing ZLP and complete.
    pub fn get_pit(&mut self, out: &mut [u8], retries: u32) -> Result<()> {
        if out.is_empty() {
            return Err(Error::protocol("PIT output buffer empty"));
        }

        let parts = out.len().div_ceil(PIT_TRANSMIT_UNIT);
        for idx in 0..parts {
            self.send_request(&Request::new(cmd::PIT, pit::START, &[idx as i32]), retries)?;

            let off = idx * PIT_TRANSMIT_UNIT;
            let n = PIT_TRANSMIT_UNIT.min(out.len() - off);
            self.recv_raw(&mut out[off..off + n], retries)?;
        }

        self.conn.recv_zlp(0)?;
        self.rpc(cmd::PIT, pit::COMPLETE, &[], false, retries)?;
        Ok(())
    }

    /// Upload a replacement PIT: SET, START with the byte count, the
    /// raw bytes unchunked, one response, COMPLETE with the byte count.
    pub fn set_pit(&mut self, pit_bytes: &[u8], retries: u32) -> Result<()> {
        if pit_bytes.is_empty() {
            return Err(Error::protocol("PIT buffer empty"));
        }
        if pit_bytes.len() > i32::MAX as usize {
            return Err(Error::protocol("PIT too large for int32"));
        }
        let len = pit_bytes.len() as i32;

        self.rpc(cmd::PIT, pit::SET, &[], false, retries)?;
        self.rpc(cmd::PIT, pit::START, &[len], false, retries)?;

        self.send_raw(pit_bytes, retries)?;
        let mut ack = [0u8; RESPONSE_LEN];
        self.recv_raw(&mut ack, retries)?;

        self.rpc(cmd::PIT, pit::COMPLETE, &[len], false, retries)?;
        Ok(())
    }

    pub fn begin_download(&mut self, rounded_size: i32, retries: u32) -> Result<()> {
        self.rpc(cmd::XMIT, xmit::DOWNLOAD, &[], false, retries)?;
        self.rpc(cmd::XMIT, xmit::START, &[rounded_size], false, retries)?;
        Ok(())
    }

    pub fn begin_download_compressed(&mut self, comp_size: i32, retries: u32) -> Result<()> {
        self.rpc(cmd::XMIT, xmit::COMPRESSED_DOWNLOAD, &[], false, retries)?;
        self.rpc(cmd::XMIT, xmit::COMPRESSED_START, &[comp_size], false, retries)?;
        Ok(())
    }

    fn end_download_impl(
        &mut self,
        complete_param: i32,
        size_to_flash: i32,
        part_id: i32,
        dev_type: i32,
        is_last: bool,
        retries: u32,
    ) -> Result<()> {
        // [0, size, bin_type, dev_type, part_id, last, efs_clear, boot_update]
        let data = [
            0,
            size_to_flash,
            0,
            dev_type,
            part_id,
            i32::from(is_last),
            0,
            0,
        ];
        self.rpc(cmd::XMIT, complete_param, &data, false, retries)?;
        Ok(())
    }

    pub fn end_download(
        &mut self,
        size_to_flash: i32,
        part_id: i32,
        dev_type: i32,
        is_last: bool,
        retries: u32,
    ) -> Result<()> {
        self.end_download_impl(xmit::COMPLETE, size_to_flash, part_id, dev_type, is_last, retries)
    }

    /// `size_to_flash` is the decompressed window size.
    pub fn end_download_compressed(
        &mut self,
        size_to_flash: i32,
        part_id: i32,
        dev_type: i32,
        is_last: bool,
        retries: u32,
    ) -> Result<()> {
        self.end_download_impl(
            xmit::COMPRESSED_COMPLETE,
            size_to_flash,
            part_id,
            dev_type,
            is_last,
            retries,
        )
    }

    pub fn shutdown(&mut self, mode: ShutdownMode, retries: u32) -> Result<()> {
        self.require_connected()?;

        match mode {
            ShutdownMode::NoReboot => {
                self.rpc(cmd::CLOSE, close::END, &[], false, retries)?;
            }
            ShutdownMode::Reboot => {
                self.rpc(cmd::CLOSE, close::END, &[], false, retries)?;
                self.rpc(cmd::CLOSE, close::REBOOT, &[], false, retries)?;
            }
            ShutdownMode::ReDownload => {
                self.rpc(cmd::CLOSE, close::REDOWNLOAD, &[], false, retries)?;
                self.send_raw(AUTOTEST_RESET, retries)?;

                // Drain whatever the bootloader answers; it is about to
                // reset either way.
                let old = self.conn.timeout();
                self.conn.set_timeout(Duration::from_millis(500));
                let mut tmp = [0u8; 64];
                let _ = self.conn.recv(&mut tmp, 0);
                self.conn.set_timeout(old);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_version_zero_means_v1() {
        let info = InitTargetInfo { ack_word: 0 };
        assert_eq!(info.protocol(), ProtocolVersion::V1);
        assert!(!info.supports_compressed_download());

        let info = InitTargetInfo { ack_word: (3 << 16) | 0x8000 };
        assert_eq!(info.protocol(), ProtocolVersion::V3);
        assert!(info.supports_compressed_download());
    }
}
