//! In-process virtual device.
//!
//! [`MemoryLink::pair`] returns the host side (a regular [`DuplexLink`]) and
//! the device side ([`MemoryDevice`]), which can inject output, observe what
//! the host wrote and simulate an unplugged cable. Used for dry runs and tests.

use async_trait::async_trait;
use chrono::Local;
use flume::{Receiver, Sender};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::{
    DeviceCategory, DisconnectEvent, DisconnectNotifier, DisconnectSubscription, DuplexLink,
    HaltFlag,
};
use crate::error::{PowerTestError, Result};

#[derive(Debug, Clone)]
enum Frame {
    Text(String),
    Fault(String),
}

struct Shared {
    category: DeviceCategory,
    name: String,
    open: AtomicBool,
    available: AtomicBool,
    broken: AtomicBool,
    closed: HaltFlag,
    disconnect: DisconnectNotifier,
}

pub struct MemoryLink {
    shared: Arc<Shared>,
    from_device: Receiver<Frame>,
    to_device: Sender<Vec<u8>>,
}

#[derive(Clone)]
pub struct MemoryDevice {
    shared: Arc<Shared>,
    to_host: Sender<Frame>,
    from_host: Receiver<Vec<u8>>,
}

impl MemoryLink {
    pub fn pair(category: DeviceCategory, name: impl Into<String>) -> (MemoryLink, MemoryDevice) {
        let closed = HaltFlag::new();
        closed.halt();
        let shared = Arc::new(Shared {
            category,
            name: name.into(),
            open: AtomicBool::new(false),
            available: AtomicBool::new(true),
            broken: AtomicBool::new(false),
            closed,
            disconnect: DisconnectNotifier::new(),
        });
        let (to_host, from_device) = flume::unbounded();
        let (to_device, from_host) = flume::unbounded();
        (
            MemoryLink {
                shared: shared.clone(),
                from_device,
                to_device,
            },
            MemoryDevice {
                shared,
                to_host,
                from_host,
            },
        )
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.broken.load(Ordering::SeqCst) {
            return Err(PowerTestError::io(self.shared.category, "device disconnected"));
        }
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(PowerTestError::io(self.shared.category, "link is not open"));
        }
        Ok(())
    }
}

#[async_trait]
impl DuplexLink for MemoryLink {
    fn category(&self) -> DeviceCategory {
        self.shared.category
    }

    fn describe(&self) -> String {
        self.shared.name.clone()
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<()> {
        if !self.shared.available.load(Ordering::SeqCst) || self.shared.broken.load(Ordering::SeqCst)
        {
            return Err(PowerTestError::unavailable(
                self.shared.category,
                format!("{} cannot be claimed", self.shared.name),
            ));
        }
        self.shared.open.store(true, Ordering::SeqCst);
        self.shared.closed.resume();
        log::debug!("{} virtual link {} opened", self.shared.category, self.shared.name);
        Ok(())
    }

    async fn close(&self) {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            self.shared.closed.halt();
            log::debug!("{} virtual link {} closed", self.shared.category, self.shared.name);
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.to_device
            .send(bytes.to_vec())
            .map_err(|_| PowerTestError::io(self.shared.category, "device side dropped"))
    }

    async fn read(&self) -> Result<String> {
        self.ensure_open()?;
        tokio::select! {
            frame = self.from_device.recv_async() => match frame {
                Ok(Frame::Text(text)) => Ok(text),
                Ok(Frame::Fault(reason)) => Err(PowerTestError::io(self.shared.category, reason)),
                Err(_) => Err(PowerTestError::io(self.shared.category, "device side dropped")),
            },
            _ = self.shared.closed.halted() => {
                Err(PowerTestError::io(self.shared.category, "link closed"))
            }
        }
    }

    fn subscribe_disconnect(&self) -> DisconnectSubscription {
        self.shared.disconnect.subscribe()
    }
}

impl MemoryDevice {
    pub fn category(&self) -> DeviceCategory {
        self.shared.category
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Queue output for the host to read.
    pub fn emit(&self, text: impl Into<String>) {
        let _ = self.to_host.send(Frame::Text(text.into()));
    }

    /// Wait for the next write from the host. `None` once the host side is gone.
    pub async fn next_write(&self) -> Option<String> {
        self.from_host
            .recv_async()
            .await
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Everything the host wrote that has not been consumed yet.
    pub fn drain_writes(&self) -> Vec<String> {
        self.from_host
            .drain()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .collect()
    }

    /// Make the next `open` fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Simulate an unplugged device: pending and future I/O fails and the
    /// link's subscribers get one notification.
    pub fn disconnect(&self, reason: &str) {
        if self.shared.broken.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.to_host.send(Frame::Fault(reason.to_string()));
        self.shared.disconnect.notify(DisconnectEvent {
            category: self.shared.category,
            port_name: self.shared.name.clone(),
            reason: reason.to_string(),
            at: Local::now(),
        });
    }
}
