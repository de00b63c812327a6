use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use crate::error::Error;

/// Cross-process ownership of the camera: whoever has the loopback port
/// bound owns the device. Dropping the lock frees the port.
#[derive(Debug)]
pub struct PortLock {
    listener: TcpListener,
}

impl PortLock {
    pub fn acquire(port: u16) -> Result<Self, Error> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).map_err(|e| {
            Error::CameraUnavailable(format!("lock port {} is taken: {}", port, e))
        })?;

        let lock = Self { listener };
        debug!(port = lock.port(), "camera lock acquired");

        Ok(lock)
    }

    /// Bound port; differs from the requested one only when that was 0.
    pub fn port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        debug!(port = self.port(), "camera lock released");
    }
}
