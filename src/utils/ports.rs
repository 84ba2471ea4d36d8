use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashSet;

use serialport::{SerialPortInfo, SerialPortType};

use crate::protocol::runtime::SerialConfig;

pub const GOOGLE_VID: u16 = 0x18d1;
/// Servo v4p1.
pub const SERVO_PID: u16 = 0x520d;
/// DUT console (SuzyQ / CCD).
pub const DUT_CONSOLE_PID: u16 = 0x504a;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Servo,
    DutConsole,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortListing {
    pub port_name: String,
    pub kind: PortKind,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
}

pub fn classify(vid: u16, pid: u16) -> PortKind {
    match (vid, pid) {
        (GOOGLE_VID, SERVO_PID) => PortKind::Servo,
        (GOOGLE_VID, DUT_CONSOLE_PID) => PortKind::DutConsole,
        _ => PortKind::Other,
    }
}

/// Return the available serial ports, servo and DUT consoles first.
pub fn enumerate_ports() -> Vec<PortListing> {
    let raw = serialport::available_ports().unwrap_or_else(|err| {
        log::warn!("Failed to enumerate serial ports: {err}");
        Vec::new()
    });
    sort_and_dedup(raw.into_iter().map(to_listing).collect())
}

fn to_listing(info: SerialPortInfo) -> PortListing {
    match info.port_type {
        SerialPortType::UsbPort(usb) => PortListing {
            port_name: info.port_name,
            kind: classify(usb.vid, usb.pid),
            vid: Some(usb.vid),
            pid: Some(usb.pid),
            serial_number: usb.serial_number,
        },
        _ => PortListing {
            port_name: info.port_name,
            kind: PortKind::Other,
            vid: None,
            pid: None,
            serial_number: None,
        },
    }
}

pub(crate) fn sort_and_dedup(ports: Vec<PortListing>) -> Vec<PortListing> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique: Vec<PortListing> = ports
        .into_iter()
        .filter(|p| seen.insert(p.port_name.to_lowercase()))
        .collect();

    fn priority(p: &PortListing) -> i32 {
        let n = p.port_name.to_lowercase();
        match p.kind {
            PortKind::Servo => 0,
            PortKind::DutConsole => 1,
            PortKind::Other if n.contains("ttyusb") || n.contains("usb") => 2,
            PortKind::Other if n.contains("acm") => 3,
            PortKind::Other => 10,
        }
    }

    unique.sort_by(|a, b| {
        priority(a)
            .cmp(&priority(b))
            .then_with(|| a.port_name.cmp(&b.port_name))
    });
    unique
}

/// Open a serial port, enabling exclusive access on Unix systems.
pub fn open_serial_port(
    port: &str,
    config: &SerialConfig,
) -> Result<Box<dyn serialport::SerialPort + Send + 'static>> {
    let builder = config.apply_builder(serialport::new(port, config.baud));

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))?;
        handle
            .set_exclusive(true)
            .map_err(|err| anyhow!("Failed to acquire exclusive access to {port}: {err}"))?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder
            .open()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(name: &str, kind: PortKind) -> PortListing {
        PortListing {
            port_name: name.to_string(),
            kind,
            vid: None,
            pid: None,
            serial_number: None,
        }
    }

    #[test]
    fn classify_known_devices() {
        assert_eq!(classify(0x18d1, 0x520d), PortKind::Servo);
        assert_eq!(classify(0x18d1, 0x504a), PortKind::DutConsole);
        assert_eq!(classify(0x0403, 0x6001), PortKind::Other);
    }

    #[test]
    fn servo_and_dut_sorted_first_and_duplicates_removed() {
        let input = vec![
            listing("/dev/ttyS0", PortKind::Other),
            listing("/dev/ttyUSB3", PortKind::DutConsole),
            listing("/dev/ttyACM0", PortKind::Other),
            listing("/dev/ttyUSB0", PortKind::Servo),
            listing("/dev/ttyUSB0", PortKind::Servo),
        ];
        let names: Vec<_> = sort_and_dedup(input)
            .into_iter()
            .map(|p| p.port_name)
            .collect();
        assert_eq!(
            names,
            vec!["/dev/ttyUSB0", "/dev/ttyUSB3", "/dev/ttyACM0", "/dev/ttyS0"]
        );
    }
}
