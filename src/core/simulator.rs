//! Virtual servo and DUT for dry runs.
//!
//! Both devices sit on [`MemoryLink`] pairs. The servo answers every `ina 0`
//! with a frame split over two chunks; the DUT echoes what it receives and
//! plays the workload wrapper (`start`, load, `end`, `stop`) whenever a
//! script is executed. Power rises while the simulated workload runs.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

use crate::{
    protocol::{
        link::{DeviceCategory, MemoryDevice, MemoryLink, SharedLink},
        script::CANCEL_COMMAND,
        telemetry::INA_COMMAND,
    },
    utils::sleep::sleep_ms,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationProfile {
    pub idle_milliwatts: i64,
    pub load_milliwatts: i64,
    /// Spread added on top of the base power, cycling through `0..jitter`.
    pub jitter_milliwatts: i64,
    pub workload: Duration,
    /// Pause before `start` and after `end`, like the wrapper's `sleep 3`.
    pub settle: Duration,
    pub echo: bool,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            idle_milliwatts: 2500,
            load_milliwatts: 6500,
            jitter_milliwatts: 300,
            workload: Duration::from_secs(3),
            settle: Duration::from_millis(500),
            echo: true,
        }
    }
}

pub struct SimulatedFixture {
    pub servo: SharedLink,
    pub dut: SharedLink,
    servo_device: MemoryDevice,
    dut_device: MemoryDevice,
    tasks: Vec<JoinHandle<()>>,
}

impl SimulatedFixture {
    pub fn spawn(profile: SimulationProfile) -> Self {
        let (servo, servo_device) = MemoryLink::pair(DeviceCategory::Servo, "simulated-servo");
        let (dut, dut_device) = MemoryLink::pair(DeviceCategory::Dut, "simulated-dut");
        let loaded = Arc::new(AtomicBool::new(false));

        let tasks = vec![
            tokio::spawn(servo_device_loop(
                servo_device.clone(),
                profile.clone(),
                loaded.clone(),
            )),
            tokio::spawn(dut_device_loop(dut_device.clone(), profile, loaded)),
        ];

        Self {
            servo: Arc::new(servo),
            dut: Arc::new(dut),
            servo_device,
            dut_device,
            tasks,
        }
    }

    /// Device side of the servo, e.g. to simulate unplugging it.
    pub fn servo_device(&self) -> &MemoryDevice {
        &self.servo_device
    }

    pub fn dut_device(&self) -> &MemoryDevice {
        &self.dut_device
    }
}

impl Drop for SimulatedFixture {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn frame_halves(power: i64) -> (String, String) {
    (
        "ina 0\r\nConfiguration => 0x4127\nShunt voltage => 1024 uV\nBus voltage => 5120 mV\nPow"
            .to_string(),
        format!("er => {power} mW\nCalibration => 0x0a00\nMask/Enable => 0x0000\nAlert limit => 0x0000\n"),
    )
}

async fn servo_device_loop(device: MemoryDevice, profile: SimulationProfile, loaded: Arc<AtomicBool>) {
    let mut n: i64 = 0;
    while let Some(command) = device.next_write().await {
        if command != INA_COMMAND {
            continue;
        }
        n += 1;
        let base = if loaded.load(Ordering::SeqCst) {
            profile.load_milliwatts
        } else {
            profile.idle_milliwatts
        };
        let power = base + (n * 37) % profile.jitter_milliwatts.max(1);
        let (head, tail) = frame_halves(power);
        device.emit(head);
        device.emit(tail);
    }
}

async fn dut_device_loop(device: MemoryDevice, profile: SimulationProfile, loaded: Arc<AtomicBool>) {
    let mut workload: Option<JoinHandle<()>> = None;
    while let Some(line) = device.next_write().await {
        if profile.echo && line != CANCEL_COMMAND {
            device.emit(line.clone());
        }
        if line == CANCEL_COMMAND {
            if let Some(task) = workload.take() {
                task.abort();
            }
            loaded.store(false, Ordering::SeqCst);
            device.emit("^C\r\nlocalhost ~ # ");
        } else if line.starts_with("base64 -d ") {
            if let Some(task) = workload.take() {
                task.abort();
            }
            workload = Some(tokio::spawn(play_workload(
                device.clone(),
                profile.clone(),
                loaded.clone(),
            )));
        }
    }
    if let Some(task) = workload {
        task.abort();
    }
}

async fn play_workload(device: MemoryDevice, profile: SimulationProfile, loaded: Arc<AtomicBool>) {
    sleep_ms(profile.settle.as_millis() as u64).await;
    device.emit("start\r\n");
    loaded.store(true, Ordering::SeqCst);
    sleep_ms(profile.workload.as_millis() as u64).await;
    loaded.store(false, Ordering::SeqCst);
    device.emit("end\r\n");
    sleep_ms(profile.settle.as_millis() as u64).await;
    device.emit("stop\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::telemetry::{DecodeEvent, TelemetryDecoder};

    #[test]
    fn frame_halves_decode_to_one_sample() {
        let (head, tail) = frame_halves(4321);
        let mut decoder = TelemetryDecoder::new();
        assert_eq!(decoder.push_at(&head, 1), DecodeEvent::Pending);
        match decoder.push_at(&tail, 2) {
            DecodeEvent::Frame(frame) => assert_eq!(frame.sample.power_milliwatts, 4321),
            other => panic!("unexpected {other:?}"),
        }
    }
}
