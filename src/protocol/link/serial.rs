use async_trait::async_trait;
use chrono::Local;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::thread;

use super::{DeviceCategory, DisconnectEvent, DisconnectNotifier, DisconnectSubscription, DuplexLink};
use crate::{
    error::{PowerTestError, Result},
    protocol::runtime::{run_loop, LinkCommand, LinkEvent, LoopExit, SerialConfig},
    utils::ports::open_serial_port,
};

/// Serial port link. The port itself lives on a dedicated I/O thread; async
/// callers talk to it through channels.
pub struct SerialLink {
    category: DeviceCategory,
    port_name: Option<String>,
    config: SerialConfig,
    active: Mutex<Option<ActivePort>>,
    disconnect: DisconnectNotifier,
}

struct ActivePort {
    cmd_tx: Sender<LinkCommand>,
    evt_rx: Receiver<LinkEvent>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("category", &self.category)
            .field("port_name", &self.port_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SerialLink {
    pub fn new(category: DeviceCategory, port_name: Option<String>, config: SerialConfig) -> Self {
        Self {
            category,
            port_name,
            config,
            active: Mutex::new(None),
            disconnect: DisconnectNotifier::new(),
        }
    }

    fn channels(&self) -> Result<(Sender<LinkCommand>, Receiver<LinkEvent>)> {
        self.active
            .lock()
            .as_ref()
            .map(|port| (port.cmd_tx.clone(), port.evt_rx.clone()))
            .ok_or_else(|| PowerTestError::io(self.category, "link is not open"))
    }
}

#[async_trait]
impl DuplexLink for SerialLink {
    fn category(&self) -> DeviceCategory {
        self.category
    }

    fn describe(&self) -> String {
        self.port_name
            .clone()
            .unwrap_or_else(|| "<no device selected>".to_string())
    }

    fn is_open(&self) -> bool {
        self.active.lock().is_some()
    }

    async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let port_name = self
            .port_name
            .clone()
            .ok_or_else(|| PowerTestError::unavailable(self.category, "no device selected"))?;

        let handle = open_serial_port(&port_name, &self.config)
            .map_err(|err| PowerTestError::unavailable(self.category, err.to_string()))?;

        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (evt_tx, evt_rx) = flume::unbounded();
        let notifier = self.disconnect.clone();
        let category = self.category;
        let thread_port_name = port_name.clone();
        thread::Builder::new()
            .name(format!("{category}-link"))
            .spawn(move || {
                if let LoopExit::Fault(reason) = run_loop(handle, cmd_rx, evt_tx) {
                    notifier.notify(DisconnectEvent {
                        category,
                        port_name: thread_port_name,
                        reason,
                        at: Local::now(),
                    });
                }
            })
            .map_err(|err| PowerTestError::unavailable(self.category, err.to_string()))?;

        *self.active.lock() = Some(ActivePort { cmd_tx, evt_rx });
        log::info!("{} link opened on {port_name}", self.category);
        Ok(())
    }

    async fn close(&self) {
        let Some(port) = self.active.lock().take() else {
            return;
        };
        if port.cmd_tx.send(LinkCommand::Stop).is_err() {
            log::debug!("{} I/O thread already gone", self.category);
        }
        log::info!("{} link closed", self.category);
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let (cmd_tx, _) = self.channels()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        cmd_tx
            .send(LinkCommand::Write(bytes.to_vec(), ack_tx))
            .map_err(|_| PowerTestError::io(self.category, "I/O thread stopped"))?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(PowerTestError::io(self.category, reason)),
            Err(_) => Err(PowerTestError::io(self.category, "write was not acknowledged")),
        }
    }

    async fn read(&self) -> Result<String> {
        let (_, evt_rx) = self.channels()?;
        match evt_rx.recv_async().await {
            Ok(LinkEvent::Chunk(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Ok(LinkEvent::Error(reason)) => Err(PowerTestError::io(self.category, reason)),
            Ok(LinkEvent::Stopped) | Err(_) => Err(PowerTestError::io(self.category, "link closed")),
        }
    }

    fn subscribe_disconnect(&self) -> DisconnectSubscription {
        self.disconnect.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_without_device_is_unavailable() {
        let link = SerialLink::new(DeviceCategory::Dut, None, SerialConfig::default());
        let err = tokio_test::block_on(link.open()).unwrap_err();
        assert!(matches!(
            err,
            PowerTestError::LinkUnavailable {
                category: DeviceCategory::Dut,
                ..
            }
        ));
        assert!(!link.is_open());
    }

    #[test]
    fn io_on_closed_link_fails_and_close_is_idempotent() {
        let link = SerialLink::new(
            DeviceCategory::Servo,
            Some("/dev/does-not-exist".to_string()),
            SerialConfig::default(),
        );
        tokio_test::block_on(async {
            assert!(matches!(
                link.write(b"ina 0\n").await,
                Err(PowerTestError::LinkIo { .. })
            ));
            assert!(link.read().await.is_err());
            link.close().await;
            link.close().await;
        });
    }
}
