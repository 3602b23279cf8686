//! Single-instance lock
//!
//! Exactly one process may drive the flash engine at a time. The lock
//! is a bound datagram socket: abstract-namespace on Linux (reclaimed
//! by the kernel on process death), a temp-dir path elsewhere.

use std::os::unix::net::UnixDatagram;

use crate::error::{Error, Result};

pub struct SingleInstanceLock {
    _socket: UnixDatagram,
    #[cfg(not(target_os = "linux"))]
    path: std::path::PathBuf,
}

impl SingleInstanceLock {
    #[cfg(target_os = "linux")]
    pub fn try_acquire(name: &str) -> Result<SingleInstanceLock> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::SocketAddr;

        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let socket = UnixDatagram::bind_addr(&addr).map_err(|_| Error::Lock)?;
        Ok(SingleInstanceLock { _socket: socket })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn try_acquire(name: &str) -> Result<SingleInstanceLock> {
        let path = std::env::temp_dir().join(format!("{name}.lock.sock"));

        match UnixDatagram::bind(&path) {
            Ok(socket) => Ok(SingleInstanceLock {
                _socket: socket,
                path,
            }),
            Err(_) => {
                // A stale socket from a dead process is reclaimable: if
                // nobody answers on it, unlink and rebind.
                let probe = UnixDatagram::unbound()?;
                if probe.connect(&path).is_ok() && probe.send(b"ping").is_ok() {
                    return Err(Error::Lock);
                }
                std::fs::remove_file(&path)?;
                let socket = UnixDatagram::bind(&path).map_err(|_| Error::Lock)?;
                Ok(SingleInstanceLock {
                    _socket: socket,
                    path,
                })
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Drop for SingleInstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let name = format!("sindri-lock-test-{}", std::process::id());
        let lock = SingleInstanceLock::try_acquire(&name).unwrap();
        assert!(matches!(
            SingleInstanceLock::try_acquire(&name),
            Err(Error::Lock)
        ));
        drop(lock);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn released_on_drop() {
        let name = format!("sindri-lock-test2-{}", std::process::id());
        drop(SingleInstanceLock::try_acquire(&name).unwrap());
        assert!(SingleInstanceLock::try_acquire(&name).is_ok());
    }
}
