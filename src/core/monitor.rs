//! Free-running recording without workload scripts.
//!
//! The monitor samples servo power (and, when a DUT console is attached,
//! its `start`/`end` markers) until halted. The result is stored in the
//! monitor file format:
//!
//! ```json
//! { "power": [{ "time": 1700000000000, "power": 5230 }],
//!   "annotation": [{ "time": 1700000000050, "text": "start" }] }
//! ```

use flume::Sender;
use serde::{Deserialize, Serialize};
use std::future::pending;

use super::{
    bus::{publish, CoreToUi},
    runner::{DutLoop, RunnerSettings},
    servo::ServoController,
    session::{AnnotationLabel, AnnotationMarker, IterationRecord, PowerSample},
    stats::{summarize_range, PowerSummary},
};
use crate::{
    error::{PowerTestError, Result},
    protocol::link::{release_after_disconnect, DisconnectSubscription, HaltFlag, SharedLink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorAnnotation {
    pub time: i64,
    pub text: AnnotationLabel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRecording {
    pub power: Vec<PowerSample>,
    pub annotation: Vec<MonitorAnnotation>,
}

impl MonitorRecording {
    pub fn from_record(record: &IterationRecord) -> Self {
        Self {
            power: record.samples.clone(),
            annotation: record
                .annotations
                .iter()
                .map(|m| MonitorAnnotation {
                    time: m.timestamp_millis,
                    text: m.label,
                })
                .collect(),
        }
    }

    pub fn into_record(self) -> IterationRecord {
        IterationRecord {
            samples: self.power,
            annotations: self
                .annotation
                .into_iter()
                .map(|a| AnnotationMarker {
                    timestamp_millis: a.time,
                    label: a.text,
                })
                .collect(),
        }
    }

    /// Summary over `[from, to]`, the whole recording when no bound is given.
    pub fn analyze(&self, from: Option<i64>, to: Option<i64>) -> Option<PowerSummary> {
        summarize_range(
            &self.power,
            from.unwrap_or(i64::MIN),
            to.unwrap_or(i64::MAX),
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json_str: &str) -> Result<Self> {
        Ok(serde_json::from_str(json_str)?)
    }
}

pub struct Monitor {
    servo: ServoController,
    dut: Option<SharedLink>,
    settings: RunnerSettings,
    halt: HaltFlag,
    events: Sender<CoreToUi>,
}

impl Monitor {
    pub fn new(
        servo: SharedLink,
        dut: Option<SharedLink>,
        settings: RunnerSettings,
        events: Sender<CoreToUi>,
    ) -> Self {
        Self {
            servo: ServoController::new(servo, settings.servo, events.clone()),
            dut,
            settings,
            halt: HaltFlag::new(),
            events,
        }
    }

    /// Flag that ends [`Monitor::run`] when set.
    pub fn halt_flag(&self) -> HaltFlag {
        self.halt.clone()
    }

    /// Record until halted. A disconnect or link fault also ends the
    /// recording; what was collected so far is kept.
    pub async fn run(&self) -> Result<MonitorRecording> {
        let servo_link = self.servo.link().clone();
        servo_link.open().await?;
        if let Some(dut) = &self.dut {
            if let Err(err) = dut.open().await {
                servo_link.close().await;
                return Err(err);
            }
        }
        log::info!("Monitoring {}", servo_link.describe());

        let servo_gone = servo_link.subscribe_disconnect();
        let dut_gone = self.dut.as_ref().map(|d| d.subscribe_disconnect());

        let (samples_tx, samples_rx) = flume::bounded(256);
        let (markers_tx, markers_rx) = flume::bounded(16);
        let (faults_tx, faults_rx) = flume::unbounded();
        let servo = self.servo.start(samples_tx, faults_tx.clone());
        let dut_loop = self.dut.as_ref().map(|dut| {
            DutLoop::spawn(
                dut.clone(),
                self.settings.clone(),
                markers_tx,
                faults_tx,
                self.events.clone(),
            )
        });

        let mut record = IterationRecord::default();
        let failure: Option<PowerTestError> = loop {
            tokio::select! {
                biased;
                _ = self.halt.halted() => break None,
                event = servo_gone.next() => {
                    release_after_disconnect(servo_link.as_ref(), Some(&servo.halt_flag())).await;
                    break Some(PowerTestError::io(event.category, event.reason));
                }
                event = next_disconnect(dut_gone.as_ref()) => {
                    if let Some(dut) = &self.dut {
                        let halt = dut_loop.as_ref().map(DutLoop::halt_flag);
                        release_after_disconnect(dut.as_ref(), halt.as_ref()).await;
                    }
                    break Some(PowerTestError::io(event.category, event.reason));
                }
                Ok(err) = faults_rx.recv_async() => break Some(err),
                Ok(sample) = samples_rx.recv_async() => {
                    record.samples.push(sample);
                    publish(&self.events, CoreToUi::Sample { slot: 0, sample });
                }
                Ok(marker) = markers_rx.recv_async() => {
                    record.annotations.push(marker);
                    publish(&self.events, CoreToUi::Annotation { slot: 0, marker });
                }
            }
        };

        if let Some(dut_loop) = dut_loop {
            dut_loop.stop().await;
        }
        let stats = servo.stop().await;
        publish(&self.events, CoreToUi::ServoStats { slot: 0, stats });
        servo_link.close().await;
        if let Some(dut) = &self.dut {
            dut.close().await;
        }

        if let Some(err) = failure {
            log::error!("Monitoring stopped: {err}");
            publish(&self.events, CoreToUi::Error(err.to_string()));
        }
        log::info!("Recorded {} samples", record.samples.len());
        Ok(MonitorRecording::from_record(&record))
    }
}

async fn next_disconnect(
    subscription: Option<&DisconnectSubscription>,
) -> crate::protocol::link::DisconnectEvent {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => pending().await,
    }
}
