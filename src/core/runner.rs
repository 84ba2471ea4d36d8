//! One configuration's lifecycle on the DUT.
//!
//! A runner owns the script of one configuration slot. Each call to
//! [`TestRunner::run_iteration`] uploads the script if needed, starts the servo
//! loops and the DUT console loop, kicks off the script and folds samples and
//! markers into a fresh [`IterationRecord`] until the script prints `end`.

use chrono::Local;
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{
    bus::{publish, CoreToUi},
    servo::{ServoController, ServoHandle, ServoTiming},
    session::{AnnotationLabel, AnnotationMarker, IterationRecord, PowerSample},
};
use crate::{
    error::{PowerTestError, Result},
    protocol::{
        link::{
            read_unless_halted, release_after_disconnect, DisconnectEvent,
            DisconnectSubscription, HaltFlag, SharedLink,
        },
        script::{remote_script_path, ScriptTransport},
    },
    utils::sleep::pace,
};

const SAMPLE_QUEUE: usize = 256;
const MARKER_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Uploading,
    Running { iteration: usize },
    Completed,
    Cancelled,
    Failed,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Idle => write!(f, "idle"),
            RunnerState::Uploading => write!(f, "uploading"),
            RunnerState::Running { iteration } => write!(f, "running (iteration {iteration})"),
            RunnerState::Completed => write!(f, "completed"),
            RunnerState::Cancelled => write!(f, "cancelled"),
            RunnerState::Failed => write!(f, "failed"),
        }
    }
}

/// Credentials typed into the DUT console when it shows a login prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DutLogin {
    pub prompt: String,
    pub user: String,
    pub password: String,
}

impl Default for DutLogin {
    fn default() -> Self {
        Self {
            prompt: "localhost login:".to_string(),
            user: "root".to_string(),
            password: "test0000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    pub servo: ServoTiming,
    /// Delay after each command written to the DUT console.
    pub command_pacing: Duration,
    /// Upload echo is drained until the console was quiet this long...
    pub settle_quiet: Duration,
    /// ...or at most this long.
    pub settle_limit: Duration,
    pub login: Option<DutLogin>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            servo: ServoTiming::default(),
            command_pacing: Duration::from_millis(20),
            settle_quiet: Duration::from_millis(300),
            settle_limit: Duration::from_secs(3),
            login: None,
        }
    }
}

/// Cloneable cancellation request shared by the orchestrator and its runners.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: HaltFlag,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        log::info!("Cancellation requested");
        self.flag.halt();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_halted()
    }

    pub async fn cancelled(&self) {
        self.flag.halted().await
    }

    pub fn reset(&self) {
        self.flag.resume();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed(IterationRecord),
    /// The record was discarded.
    Cancelled,
}

pub struct TestRunner {
    slot: usize,
    script: String,
    servo: ServoController,
    dut: SharedLink,
    transport: ScriptTransport,
    settings: RunnerSettings,
    uploaded: bool,
    state: RunnerState,
    events: Sender<CoreToUi>,
}

impl TestRunner {
    pub fn new(
        slot: usize,
        script: impl Into<String>,
        servo: SharedLink,
        dut: SharedLink,
        settings: RunnerSettings,
        events: Sender<CoreToUi>,
    ) -> Self {
        Self {
            slot,
            script: script.into(),
            servo: ServoController::new(servo, settings.servo, events.clone()),
            transport: ScriptTransport::new(dut.clone(), settings.command_pacing),
            dut,
            settings,
            uploaded: false,
            state: RunnerState::Idle,
            events,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn remote_path(&self) -> String {
        remote_script_path(self.slot)
    }

    fn set_state(&mut self, state: RunnerState) {
        if self.state != state {
            log::debug!("runner {}: {} -> {}", self.slot, self.state, state);
            self.state = state;
            publish(
                &self.events,
                CoreToUi::RunnerState {
                    slot: self.slot,
                    state,
                },
            );
        }
    }

    /// Run one iteration. A cancelled or failed iteration never yields a
    /// record.
    pub async fn run_iteration(
        &mut self,
        iteration: usize,
        cancel: &CancelHandle,
    ) -> Result<IterationOutcome> {
        let result = self.iteration(iteration, cancel).await;
        match &result {
            Ok(IterationOutcome::Completed(record)) => {
                log::info!(
                    "runner {}: iteration {} done, {} samples",
                    self.slot,
                    iteration,
                    record.samples.len()
                );
                self.set_state(RunnerState::Completed);
            }
            Ok(IterationOutcome::Cancelled) => self.set_state(RunnerState::Cancelled),
            Err(err) => {
                log::error!("runner {}: iteration {} failed: {err}", self.slot, iteration);
                self.set_state(RunnerState::Failed);
            }
        }
        result
    }

    async fn iteration(
        &mut self,
        iteration: usize,
        cancel: &CancelHandle,
    ) -> Result<IterationOutcome> {
        if cancel.is_cancelled() {
            return Ok(IterationOutcome::Cancelled);
        }

        let servo_gone = self.servo.link().subscribe_disconnect();
        let dut_gone = self.dut.subscribe_disconnect();

        if !self.uploaded {
            self.set_state(RunnerState::Uploading);
            let path = self.remote_path();
            let upload = async {
                self.transport.upload(&path, &self.script).await?;
                self.transport
                    .drain_echo(self.settings.settle_quiet, self.settings.settle_limit)
                    .await
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(IterationOutcome::Cancelled),
                event = servo_gone.next() => {
                    release_after_disconnect(self.servo.link().as_ref(), None).await;
                    return Err(disconnect_error(event));
                }
                event = dut_gone.next() => {
                    release_after_disconnect(self.dut.as_ref(), None).await;
                    return Err(disconnect_error(event));
                }
                result = upload => { result?; }
            }
            self.uploaded = true;
        }

        self.set_state(RunnerState::Running { iteration });

        let (samples_tx, samples_rx) = flume::bounded(SAMPLE_QUEUE);
        let (markers_tx, markers_rx) = flume::bounded(MARKER_QUEUE);
        let (faults_tx, faults_rx) = flume::unbounded();
        let servo = self.servo.start(samples_tx, faults_tx.clone());
        let dut = DutLoop::spawn(
            self.dut.clone(),
            self.settings.clone(),
            markers_tx,
            faults_tx,
            self.events.clone(),
        );

        let channels = IterationChannels {
            samples: samples_rx,
            markers: markers_rx,
            faults: faults_rx,
            servo_gone,
            dut_gone,
        };
        let outcome = self.collect(cancel, &channels, &servo, &dut).await;

        dut.stop().await;
        let stats = servo.stop().await;
        publish(
            &self.events,
            CoreToUi::ServoStats {
                slot: self.slot,
                stats,
            },
        );
        outcome
    }

    async fn collect(
        &self,
        cancel: &CancelHandle,
        channels: &IterationChannels,
        servo: &ServoHandle,
        dut: &DutLoop,
    ) -> Result<IterationOutcome> {
        self.transport.execute(&self.remote_path()).await?;

        let mut record = IterationRecord::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(IterationOutcome::Cancelled),
                event = channels.servo_gone.next() => {
                    release_after_disconnect(self.servo.link().as_ref(), Some(&servo.halt_flag())).await;
                    return Err(disconnect_error(event));
                }
                event = channels.dut_gone.next() => {
                    release_after_disconnect(self.dut.as_ref(), Some(&dut.halt)).await;
                    return Err(disconnect_error(event));
                }
                Ok(err) = channels.faults.recv_async() => return Err(err),
                Ok(sample) = channels.samples.recv_async() => {
                    record.samples.push(sample);
                    publish(&self.events, CoreToUi::Sample { slot: self.slot, sample });
                }
                Ok(marker) = channels.markers.recv_async() => {
                    let started = record.has_marker(AnnotationLabel::Start);
                    record.annotations.push(marker);
                    publish(&self.events, CoreToUi::Annotation { slot: self.slot, marker });
                    if marker.label == AnnotationLabel::End && started {
                        return Ok(IterationOutcome::Completed(record));
                    }
                }
            }
        }
    }
}

struct IterationChannels {
    samples: Receiver<PowerSample>,
    markers: Receiver<AnnotationMarker>,
    faults: Receiver<PowerTestError>,
    servo_gone: DisconnectSubscription,
    dut_gone: DisconnectSubscription,
}

fn disconnect_error(event: DisconnectEvent) -> PowerTestError {
    PowerTestError::io(
        event.category,
        format!("{} disconnected: {}", event.port_name, event.reason),
    )
}

/// DUT console reader: forwards text to the front end, turns `start`/`end`
/// lines into markers and answers the login prompt when configured.
pub struct DutLoop {
    halt: HaltFlag,
    task: JoinHandle<()>,
}

impl DutLoop {
    pub fn spawn(
        link: SharedLink,
        settings: RunnerSettings,
        markers: Sender<AnnotationMarker>,
        faults: Sender<PowerTestError>,
        events: Sender<CoreToUi>,
    ) -> Self {
        let halt = HaltFlag::new();
        let task = tokio::spawn(dut_read_loop(
            link,
            settings,
            halt.clone(),
            markers,
            faults,
            events,
        ));
        Self { halt, task }
    }

    pub fn halt_flag(&self) -> HaltFlag {
        self.halt.clone()
    }

    pub async fn stop(self) {
        self.halt.halt();
        if let Err(err) = self.task.await {
            log::error!("DUT loop task failed: {err}");
        }
    }
}

async fn dut_read_loop(
    link: SharedLink,
    settings: RunnerSettings,
    halt: HaltFlag,
    markers: Sender<AnnotationMarker>,
    faults: Sender<PowerTestError>,
    events: Sender<CoreToUi>,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = halt.halted() => break,
            chunk = read_unless_halted(link.as_ref(), &halt) => chunk,
        };
        let chunk = match chunk {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                let _ = faults.send(err);
                break;
            }
        };

        let now = Local::now().timestamp_millis();
        for label in AnnotationLabel::detect_all(&chunk) {
            let marker = AnnotationMarker {
                timestamp_millis: now,
                label,
            };
            if markers.send_async(marker).await.is_err() {
                log::debug!("DUT read loop stopped: marker receiver gone");
                return;
            }
        }

        if let Some(login) = &settings.login {
            if chunk.contains(&login.prompt) {
                log::info!("DUT login prompt seen, logging in as {}", login.user);
                if let Err(err) = answer_login(&link, login, settings.command_pacing).await {
                    let _ = faults.send(err);
                    break;
                }
            }
        }

        publish(&events, CoreToUi::ConsoleOutput(chunk));
    }
    log::debug!("DUT read loop stopped");
}

async fn answer_login(link: &SharedLink, login: &DutLogin, pacing: Duration) -> Result<()> {
    link.write(format!("{}\n", login.user).as_bytes()).await?;
    pace(pacing).await;
    link.write(format!("{}\n", login.password).as_bytes()).await?;
    pace(pacing).await;
    Ok(())
}
