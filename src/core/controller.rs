//! Whole-session orchestration: device selection, configuration slots, the
//! N configurations × M iterations run, finalization, import and export.

use flume::Sender;
use serde::Serialize;

use super::{
    bus::{publish, CoreToUi},
    runner::{CancelHandle, IterationOutcome, RunnerSettings, TestRunner},
    session::{RunnerConfig, Session},
    stats::{compare, Comparison},
};
use crate::{
    error::{PowerTestError, Result},
    protocol::{
        link::{DeviceCategory, SharedLink},
        script::ScriptTransport,
    },
};

/// Interrupts written to the DUT when a run ends.
const FINAL_INTERRUPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Initializing,
    Running { config: usize, iteration: usize },
    Cancelled,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Comparison),
    Cancelled,
}

enum RunEnd {
    Finished,
    Cancelled,
}

pub struct PowerTestController {
    servo: Option<SharedLink>,
    dut: Option<SharedLink>,
    session: Session,
    settings: RunnerSettings,
    state: ControllerState,
    cancel: CancelHandle,
    selected_iteration: Option<usize>,
    events: Sender<CoreToUi>,
}

impl PowerTestController {
    pub fn new(settings: RunnerSettings, events: Sender<CoreToUi>) -> Self {
        Self {
            servo: None,
            dut: None,
            session: Session::default(),
            settings,
            state: ControllerState::Idle,
            cancel: CancelHandle::new(),
            selected_iteration: None,
            events,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn selected_iteration(&self) -> Option<usize> {
        self.selected_iteration
    }

    fn set_state(&mut self, state: ControllerState) {
        if self.state != state {
            log::debug!("controller: {:?} -> {:?}", self.state, state);
            self.state = state;
            publish(&self.events, CoreToUi::State(state));
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.state == ControllerState::Idle {
            Ok(())
        } else {
            Err(PowerTestError::config("a measurement is in progress"))
        }
    }

    /// Route a failure through the error surface and hand it back.
    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            publish(&self.events, CoreToUi::Error(err.to_string()));
        }
        result
    }

    fn select_device(&mut self, expected: DeviceCategory, link: SharedLink) -> Result<()> {
        self.ensure_idle()?;
        if link.category() != expected {
            return Err(PowerTestError::config(format!(
                "{} selected as {expected} device",
                link.describe()
            )));
        }
        log::info!("{expected} device selected: {}", link.describe());
        match expected {
            DeviceCategory::Servo => self.servo = Some(link),
            DeviceCategory::Dut => self.dut = Some(link),
        }
        Ok(())
    }

    pub fn select_servo(&mut self, link: SharedLink) -> Result<()> {
        self.select_device(DeviceCategory::Servo, link)
    }

    pub fn select_dut(&mut self, link: SharedLink) -> Result<()> {
        self.select_device(DeviceCategory::Dut, link)
    }

    /// Append a configuration slot and return its index.
    pub fn add_config(&mut self, script: impl Into<String>) -> Result<usize> {
        self.ensure_idle()?;
        self.session.runner_configs.push(RunnerConfig::new(script));
        Ok(self.session.runner_configs.len() - 1)
    }

    pub fn remove_config(&mut self, slot: usize) -> Result<RunnerConfig> {
        self.ensure_idle()?;
        if slot >= self.session.runner_configs.len() {
            return Err(PowerTestError::config(format!("no configuration {slot}")));
        }
        Ok(self.session.runner_configs.remove(slot))
    }

    pub fn set_margin(&mut self, margin_millis: i64) -> Result<()> {
        self.ensure_idle()?;
        if margin_millis < 0 {
            return Err(PowerTestError::config("margin time must not be negative"));
        }
        self.session.margin_time_millis = margin_millis;
        Ok(())
    }

    /// The count never drops below the records already held; clear them by
    /// starting a new measurement or loading another session.
    pub fn set_iteration_count(&mut self, count: u32) -> Result<()> {
        self.ensure_idle()?;
        let recorded = self
            .session
            .runner_configs
            .iter()
            .map(|c| c.iteration_records.len())
            .max()
            .unwrap_or(0);
        if (count as usize) < recorded {
            return Err(PowerTestError::config(format!(
                "iteration count {count} is below the {recorded} iterations already recorded"
            )));
        }
        self.session.iteration_count = count;
        Ok(())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel_measurement(&self) {
        self.cancel.cancel();
    }

    fn validate(&self) -> Result<(SharedLink, SharedLink)> {
        if self.session.runner_configs.is_empty() {
            return Err(PowerTestError::config("no configuration to run"));
        }
        if self.session.iteration_count == 0 {
            return Err(PowerTestError::config("iteration count must be positive"));
        }
        let servo = self
            .servo
            .clone()
            .ok_or_else(|| PowerTestError::unavailable(DeviceCategory::Servo, "no device selected"))?;
        let dut = self
            .dut
            .clone()
            .ok_or_else(|| PowerTestError::unavailable(DeviceCategory::Dut, "no device selected"))?;
        Ok((servo, dut))
    }

    /// Run every configuration for every iteration. Records of a previous run
    /// are discarded first; a failed or cancelled run leaves the session
    /// incomplete.
    pub async fn start_measurement(&mut self) -> Result<RunOutcome> {
        let checked = self.ensure_idle().and_then(|_| self.validate());
        let (servo, dut) = self.report(checked)?;

        self.cancel.reset();
        self.session.clear_records();
        self.selected_iteration = None;
        self.set_state(ControllerState::Initializing);
        log::info!(
            "Starting measurement: {} configurations x {} iterations",
            self.session.runner_configs.len(),
            self.session.iteration_count
        );

        let result = self.run(&servo, &dut).await;
        self.finalize(&servo, &dut).await;

        match self.report(result)? {
            RunEnd::Cancelled => {
                log::info!("Measurement cancelled");
                Ok(RunOutcome::Cancelled)
            }
            RunEnd::Finished => {
                let comparison = compare(&self.session);
                publish(&self.events, CoreToUi::Summary(comparison.clone()));
                let last = self.session.iteration_count as usize - 1;
                self.select_iteration(last)?;
                log::info!("Measurement completed");
                Ok(RunOutcome::Completed(comparison))
            }
        }
    }

    async fn run(&mut self, servo: &SharedLink, dut: &SharedLink) -> Result<RunEnd> {
        servo.open().await?;
        dut.open().await?;

        let mut runners: Vec<TestRunner> = self
            .session
            .runner_configs
            .iter()
            .enumerate()
            .map(|(slot, config)| {
                TestRunner::new(
                    slot,
                    config.script_text.clone(),
                    servo.clone(),
                    dut.clone(),
                    self.settings.clone(),
                    self.events.clone(),
                )
            })
            .collect();
        let cancel = self.cancel.clone();

        for iteration in 0..self.session.iteration_count as usize {
            for runner in runners.iter_mut() {
                let slot = runner.slot();
                self.set_state(ControllerState::Running {
                    config: slot,
                    iteration,
                });
                match runner.run_iteration(iteration, &cancel).await? {
                    IterationOutcome::Completed(record) => {
                        self.session.runner_configs[slot]
                            .iteration_records
                            .push(record);
                        publish(&self.events, CoreToUi::IterationCompleted { slot, iteration });
                    }
                    IterationOutcome::Cancelled => {
                        self.set_state(ControllerState::Cancelled);
                        return Ok(RunEnd::Cancelled);
                    }
                }
            }
        }
        Ok(RunEnd::Finished)
    }

    /// Stop the workload, give the DUT its charger back and release both
    /// links. Failures are logged and otherwise ignored.
    async fn finalize(&mut self, servo: &SharedLink, dut: &SharedLink) {
        self.set_state(ControllerState::Finalizing);

        if dut.is_open() {
            let transport = ScriptTransport::new(dut.clone(), self.settings.command_pacing);
            for _ in 0..FINAL_INTERRUPTS {
                if let Err(err) = transport.cancel().await {
                    log::warn!("Failed to interrupt DUT workload: {err}");
                    break;
                }
            }
            if let Err(err) = transport.restore_power().await {
                log::warn!("Failed to restore DUT charging: {err}");
            }
        }

        servo.close().await;
        dut.close().await;
        self.set_state(ControllerState::Idle);
    }

    /// Republish every configuration's record of `iteration`.
    pub fn select_iteration(&mut self, iteration: usize) -> Result<()> {
        if iteration >= self.session.iteration_count as usize {
            return Err(PowerTestError::config(format!(
                "iteration {iteration} out of range (session has {})",
                self.session.iteration_count
            )));
        }
        for (slot, config) in self.session.runner_configs.iter().enumerate() {
            if let Some(record) = config.iteration_records.get(iteration) {
                publish(
                    &self.events,
                    CoreToUi::IterationGraph {
                        slot,
                        iteration,
                        record: record.clone(),
                    },
                );
            }
        }
        self.selected_iteration = Some(iteration);
        Ok(())
    }

    /// Replace the session with one read from a session file. No hardware is
    /// touched.
    pub fn load_session(&mut self, text: &str) -> Result<()> {
        let loaded = self.ensure_idle().and_then(|_| Session::from_json(text));
        self.session = self.report(loaded)?;
        log::info!(
            "Loaded session: {} configurations, {} iterations",
            self.session.runner_configs.len(),
            self.session.iteration_count
        );

        for (slot, config) in self.session.runner_configs.iter().enumerate() {
            if let Some(record) = config.iteration_records.first() {
                publish(
                    &self.events,
                    CoreToUi::IterationGraph {
                        slot,
                        iteration: 0,
                        record: record.clone(),
                    },
                );
            }
        }
        self.selected_iteration = Some(0);
        publish(&self.events, CoreToUi::Summary(self.summaries()));
        Ok(())
    }

    pub fn export_session(&self) -> Result<String> {
        self.session.to_json()
    }

    pub fn summaries(&self) -> Comparison {
        compare(&self.session)
    }
}
