//! TCP transport for wireless targets
//!
//! Wireless flashing accepts one inbound connection on port 13579 and
//! speaks the exact same wire protocol over it, no extra framing.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::infrastructure::transport::{Transport, TransportKind};

pub const WIRELESS_PORT: u16 = 13579;

const RETRY_PAUSE: Duration = Duration::from_millis(10);

pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
    connected: bool,
}

impl TcpTransport {
    fn new(stream: TcpStream, peer: SocketAddr) -> Result<TcpTransport> {
        stream.set_nodelay(true)?;
        let mut t = TcpTransport {
            stream,
            peer,
            timeout: Duration::from_secs(1),
            connected: true,
        };
        t.apply_timeout()?;
        Ok(t)
    }

    pub fn peer_label(&self) -> String {
        self.peer.to_string()
    }

    fn apply_timeout(&mut self) -> Result<()> {
        self.stream.set_read_timeout(Some(self.timeout))?;
        self.stream.set_write_timeout(Some(self.timeout))?;
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::TcpStream
    }

    fn connected(&self) -> bool {
        self.connected
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout.max(Duration::from_millis(1));
        let _ = self.apply_timeout();
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn send(&mut self, data: &[u8], retries: u32) -> Result<()> {
        if !self.connected {
            return Err(Error::DeviceGone("tcp: not connected".into()));
        }

        let mut off = 0;
        let mut retries = retries;
        while off < data.len() {
            match self.stream.write(&data[off..]) {
                Ok(0) => {
                    self.connected = false;
                    return Err(Error::DeviceGone("tcp: peer closed connection".into()));
                }
                Ok(n) => off += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    if retries == 0 {
                        warn!("tcp send: timeout, giving up");
                        return Err(Error::Io(e));
                    }
                    retries -= 1;
                    std::thread::sleep(RETRY_PAUSE);
                }
                Err(e) => {
                    self.connected = false;
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], retries: u32) -> Result<usize> {
        if !self.connected {
            return Err(Error::DeviceGone("tcp: not connected".into()));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut retries = retries;
        loop {
            match self.stream.read(buf) {
                Ok(0) => {
                    self.connected = false;
                    return Err(Error::DeviceGone("tcp: peer closed connection".into()));
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    if retries == 0 {
                        warn!("tcp recv: timeout, giving up");
                        return Err(Error::Io(e));
                    }
                    retries -= 1;
                    std::thread::sleep(RETRY_PAUSE);
                }
                Err(e) => {
                    self.connected = false;
                    return Err(Error::Io(e));
                }
            }
        }
    }

    fn recv_zlp(&mut self, _retries: u32) -> Result<()> {
        // ZLPs do not exist on a stream transport.
        Ok(())
    }
}

/// One-shot listener for the wireless mode.
pub struct WirelessListener {
    listener: TcpListener,
}

impl WirelessListener {
    pub fn bind() -> Result<WirelessListener> {
        let listener = TcpListener::bind(("0.0.0.0", WIRELESS_PORT))?;
        info!("listening on 0.0.0.0:{WIRELESS_PORT}");
        Ok(WirelessListener { listener })
    }

    /// Block until one device connects.
    pub fn accept_one(self) -> Result<TcpTransport> {
        let (stream, peer) = self.listener.accept()?;
        info!("accepted connection from {peer}");
        TcpTransport::new(stream, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).unwrap();
            s.write_all(b"LOKE").unwrap();
            buf
        });

        let stream = TcpStream::connect(addr).unwrap();
        let peer = stream.peer_addr().unwrap();
        let mut t = TcpTransport::new(stream, peer).unwrap();
        assert_eq!(t.kind(), TransportKind::TcpStream);

        t.send(b"ODIN", 0).unwrap();
        let mut buf = [0u8; 4];
        let n = t.recv(&mut buf, 2).unwrap();
        assert_eq!(&buf[..n], b"LOKE");
        t.recv_zlp(0).unwrap();

        assert_eq!(&server.join().unwrap(), b"ODIN");
    }
}
