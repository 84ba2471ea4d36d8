use flume::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::{
    io::{ErrorKind, Read, Write},
    thread,
    time::Duration,
};

use serialport::{DataBits, SerialPort, StopBits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParityMode {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: ParityMode,
    /// Read timeout of the I/O thread. Short, so queued writes are not held
    /// back behind an idle read.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_baud() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_parity() -> ParityMode {
    ParityMode::None
}

fn default_read_timeout_ms() -> u64 {
    10
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: default_baud(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_parity(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl SerialConfig {
    pub fn apply_builder(&self, b: serialport::SerialPortBuilder) -> serialport::SerialPortBuilder {
        let b = b.data_bits(match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        });
        let b = b.stop_bits(match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        });
        let b = b.parity(match self.parity {
            ParityMode::None => serialport::Parity::None,
            ParityMode::Odd => serialport::Parity::Odd,
            ParityMode::Even => serialport::Parity::Even,
        });
        b.timeout(Duration::from_millis(self.read_timeout_ms))
    }
}

pub type WriteAck = oneshot::Sender<Result<(), String>>;

#[derive(Debug)]
pub enum LinkCommand {
    Write(Vec<u8>, WriteAck),
    Stop,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Chunk(bytes::Bytes),
    Error(String),
    Stopped,
}

/// Why the I/O loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Owner asked for it (`Stop`) or went away.
    Released,
    /// Transport failure; the device is considered gone.
    Fault(String),
}

/// Drive one serial port until stopped or until the transport fails.
/// Must run on its own thread: reads block for up to the configured timeout.
pub fn run_loop(
    mut serial: Box<dyn SerialPort + Send + 'static>,
    cmd_rx: Receiver<LinkCommand>,
    evt_tx: Sender<LinkEvent>,
) -> LoopExit {
    let mut buf = [0u8; 256];
    loop {
        loop {
            match cmd_rx.try_recv() {
                Ok(LinkCommand::Write(bytes, ack)) => {
                    let result = serial
                        .write_all(&bytes)
                        .and_then(|_| serial.flush())
                        .map_err(|err| format!("write failed: {err}"));
                    let fault = result.clone().err();
                    let _ = ack.send(result);
                    if let Some(reason) = fault {
                        let _ = evt_tx.send(LinkEvent::Error(reason.clone()));
                        return LoopExit::Fault(reason);
                    }
                }
                Ok(LinkCommand::Stop) => {
                    let _ = evt_tx.send(LinkEvent::Stopped);
                    return LoopExit::Released;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return LoopExit::Released,
            }
        }

        match serial.read(&mut buf) {
            Ok(n) if n > 0 => {
                if evt_tx
                    .send(LinkEvent::Chunk(bytes::Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    return LoopExit::Released;
                }
            }
            Ok(_) => thread::sleep(Duration::from_millis(1)),
            Err(err) if err.kind() == ErrorKind::TimedOut => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                let reason = format!("read failed: {err}");
                let _ = evt_tx.send(LinkEvent::Error(reason.clone()));
                return LoopExit::Fault(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let cfg: SerialConfig = serde_json::from_str(r#"{"baud": 9600}"#).unwrap();
        assert_eq!(cfg.baud, 9600);
        assert_eq!(cfg.data_bits, 8);
        assert_eq!(cfg.stop_bits, 1);
        assert_eq!(cfg.parity, ParityMode::None);
        assert_eq!(cfg.read_timeout_ms, 10);
    }
}
