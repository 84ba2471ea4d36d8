//! Duplex byte links to the servo and to the DUT console.
//!
//! A link hides the transport (serial port, in-memory virtual device) behind
//! `open/close/read/write`. Transport faults and unplugged devices all show up
//! the same way: a `LinkIo` error from `read`/`write` and one
//! [`DisconnectEvent`] for the subscribers of that link.

pub mod memory;
pub mod serial;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    pin::pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::Notify;

use crate::error::Result;

pub use memory::{MemoryDevice, MemoryLink};
pub use serial::SerialLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    #[strum(serialize = "servo")]
    Servo,
    #[strum(serialize = "DUT")]
    Dut,
}

#[async_trait]
pub trait DuplexLink: Send + Sync {
    fn category(&self) -> DeviceCategory;

    /// Human readable name of the underlying device (port path, virtual name).
    fn describe(&self) -> String;

    fn is_open(&self) -> bool;

    /// Claim the device. Fails with `LinkUnavailable`.
    async fn open(&self) -> Result<()>;

    /// Release the device. Idempotent and never fails.
    async fn close(&self);

    /// Fails with `LinkIo` on transport errors or when the link is closed.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Next chunk of text from the device. Fails with `LinkIo`.
    async fn read(&self) -> Result<String>;

    fn subscribe_disconnect(&self) -> DisconnectSubscription;
}

pub type SharedLink = Arc<dyn DuplexLink>;

/// Read one chunk, treating errors raised while halting as a normal stop.
///
/// Returns `Ok(None)` when the read failed after `halt` was set.
pub async fn read_unless_halted(link: &dyn DuplexLink, halt: &HaltFlag) -> Result<Option<String>> {
    match link.read().await {
        Ok(chunk) => Ok(Some(chunk)),
        Err(err) if halt.is_halted() => {
            log::debug!("{} read ended while halting: {err}", link.category());
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Reaction to a disconnect notification: halt the loops using the link (if
/// any are running) and close it. Secondary errors are only logged.
pub async fn release_after_disconnect(link: &dyn DuplexLink, halt: Option<&HaltFlag>) {
    if let Some(halt) = halt {
        halt.halt();
    }
    link.close().await;
    log::info!("{} link released after disconnect", link.category());
}

/// Cooperative stop flag shared between an owner and its loops.
///
/// Setting it never preempts a pending operation; loops observe it at their
/// next wake-up, either by polling [`HaltFlag::is_halted`] or by awaiting
/// [`HaltFlag::halted`].
#[derive(Clone, Default)]
pub struct HaltFlag {
    inner: Arc<HaltInner>,
}

#[derive(Default)]
struct HaltInner {
    halted: AtomicBool,
    notify: Notify,
}

impl std::fmt::Debug for HaltFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaltFlag")
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl HaltFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn halt(&self) {
        self.inner.halted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn resume(&self) {
        self.inner.halted.store(false, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set.
    pub async fn halted(&self) {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.is_halted() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub category: DeviceCategory,
    pub port_name: String,
    pub reason: String,
    pub at: DateTime<Local>,
}

type SubscriberList = Mutex<Vec<(u64, Sender<DisconnectEvent>)>>;

/// Fan-out of disconnect notifications for one link.
#[derive(Clone, Default)]
pub struct DisconnectNotifier {
    subscribers: Arc<SubscriberList>,
    next_id: Arc<AtomicU64>,
}

impl DisconnectNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> DisconnectSubscription {
        let (tx, rx) = flume::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, tx));
        DisconnectSubscription {
            id,
            rx,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn notify(&self, event: DisconnectEvent) {
        log::warn!(
            "{} device {} disconnected: {}",
            event.category,
            event.port_name,
            event.reason
        );
        self.subscribers
            .lock()
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Receiving end of a disconnect subscription. Dropping it unsubscribes.
pub struct DisconnectSubscription {
    id: u64,
    rx: Receiver<DisconnectEvent>,
    subscribers: Weak<SubscriberList>,
}

impl DisconnectSubscription {
    /// Wait for the next notification. `None` once the link is gone.
    pub async fn recv(&self) -> Option<DisconnectEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Like [`Self::recv`] but never resolves once the link is gone, which
    /// makes it usable as a `select!` branch.
    pub async fn next(&self) -> DisconnectEvent {
        match self.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    pub fn try_recv(&self) -> Option<DisconnectEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for DisconnectSubscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event() -> DisconnectEvent {
        DisconnectEvent {
            category: DeviceCategory::Servo,
            port_name: "/dev/ttyUSB0".to_string(),
            reason: "unplugged".to_string(),
            at: Local::now(),
        }
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let notifier = DisconnectNotifier::new();
        let first = notifier.subscribe();
        let second = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 2);

        drop(second);
        assert_eq!(notifier.subscriber_count(), 1);

        notifier.notify(event());
        assert_eq!(first.try_recv().map(|e| e.reason), Some("unplugged".to_string()));
        assert!(first.try_recv().is_none());
    }

    #[tokio::test]
    async fn halted_resolves_after_halt() {
        let flag = HaltFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.halted().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        flag.halt();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("halt not observed")
            .expect("waiter panicked");
        assert!(flag.is_halted());
    }
}
