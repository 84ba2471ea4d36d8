use std::{process::Command, sync::Arc, time::Duration};

use anyhow::Result;
use servo_power::{
    core::{
        bus::CoreToUi,
        controller::{ControllerState, PowerTestController, RunOutcome},
        runner::RunnerSettings,
        servo::ServoTiming,
        session::{AnnotationLabel, Session},
        simulator::{SimulatedFixture, SimulationProfile},
    },
    protocol::{
        link::{DeviceCategory, DuplexLink, MemoryDevice, MemoryLink},
        script::{CANCEL_COMMAND, RESTORE_POWER_COMMAND},
    },
    PowerTestError,
};

fn fast_settings() -> RunnerSettings {
    RunnerSettings {
        servo: ServoTiming {
            request_interval: Duration::from_millis(5),
            stale_request_timeout: Duration::from_millis(200),
        },
        command_pacing: Duration::ZERO,
        settle_quiet: Duration::from_millis(20),
        settle_limit: Duration::from_millis(300),
        login: None,
    }
}

fn fast_profile() -> SimulationProfile {
    SimulationProfile {
        workload: Duration::from_millis(150),
        settle: Duration::from_millis(20),
        ..SimulationProfile::default()
    }
}

fn simulated_controller(
    fixture: &SimulatedFixture,
    scripts: &[&str],
    iterations: u32,
) -> Result<(PowerTestController, flume::Receiver<CoreToUi>)> {
    let (events, rx) = flume::unbounded();
    let mut controller = PowerTestController::new(fast_settings(), events);
    controller.select_servo(fixture.servo.clone())?;
    controller.select_dut(fixture.dut.clone())?;
    controller.set_margin(20)?;
    controller.set_iteration_count(iterations)?;
    for script in scripts {
        controller.add_config(*script)?;
    }
    Ok((controller, rx))
}

#[tokio::test]
async fn two_configurations_two_iterations() -> Result<()> {
    let fixture = SimulatedFixture::spawn(fast_profile());
    let (mut controller, rx) = simulated_controller(&fixture, &["sleep 1", "stress-ng -c 1"], 2)?;

    let outcome = controller.start_measurement().await?;
    let RunOutcome::Completed(comparison) = outcome else {
        panic!("measurement did not complete");
    };

    let session = controller.session();
    assert!(session.is_complete());
    for config in &session.runner_configs {
        assert_eq!(config.iteration_records.len(), 2);
        for record in &config.iteration_records {
            assert!(record.workload_window().is_some());
            assert!(!record.trimmed_samples(session.margin_time_millis).is_empty());
        }
    }

    assert_eq!(comparison.configs.len(), 2);
    for config in &comparison.configs {
        let summary = config.summary.expect("trimmed samples");
        assert!(summary.mean > 2800.0, "workload power not measured: {summary:?}");
    }
    assert!(comparison.mean_difference.is_some());

    assert_eq!(controller.state(), ControllerState::Idle);
    assert_eq!(controller.selected_iteration(), Some(1));
    assert!(!fixture.servo.is_open() && !fixture.dut.is_open());

    let events: Vec<CoreToUi> = rx.drain().collect();
    let completed = events
        .iter()
        .filter(|e| matches!(e, CoreToUi::IterationCompleted { .. }))
        .count();
    assert_eq!(completed, 4);
    assert!(events.iter().any(|e| matches!(e, CoreToUi::Summary(_))));
    assert!(!events.iter().any(|e| matches!(e, CoreToUi::Error(_))));
    Ok(())
}

#[tokio::test]
async fn exported_session_loads_back_identically() -> Result<()> {
    let fixture = SimulatedFixture::spawn(fast_profile());
    let (mut controller, _rx) = simulated_controller(&fixture, &["true", "yes > /dev/null"], 3)?;
    controller.start_measurement().await?;
    assert!(controller.session().is_complete());
    let exported = controller.export_session()?;

    let (events, _rx) = flume::unbounded();
    let mut viewer = PowerTestController::new(RunnerSettings::default(), events);
    viewer.load_session(&exported)?;
    assert_eq!(viewer.session(), controller.session());
    assert_eq!(viewer.summaries(), controller.summaries());
    Ok(())
}

/// DUT that runs the workload wrapper for `start`/`end` on every execute and
/// requests cancellation on the execute numbered `cancel_on`.
fn spawn_scripted_dut(
    device: MemoryDevice,
    cancel: servo_power::core::CancelHandle,
    cancel_on: usize,
) -> (tokio::task::JoinHandle<()>, flume::Receiver<String>) {
    let (log_tx, log_rx) = flume::unbounded();
    let task = tokio::spawn(async move {
        let mut executes = 0;
        while let Some(line) = device.next_write().await {
            let _ = log_tx.send(line.clone());
            if !line.starts_with("base64 -d") {
                continue;
            }
            executes += 1;
            device.emit("start\n");
            if executes == cancel_on {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            } else {
                tokio::time::sleep(Duration::from_millis(30)).await;
                device.emit("end\n");
            }
        }
    });
    (task, log_rx)
}

fn spawn_servo(device: MemoryDevice) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while device.next_write().await.is_some() {
            device.emit("Power => 1200 mW\nAlert limit: 0\n");
        }
    })
}

#[tokio::test]
async fn cancel_discards_active_iteration_and_finalizes() -> Result<()> {
    let (servo, servo_dev) = MemoryLink::pair(DeviceCategory::Servo, "servo");
    let (dut, dut_dev) = MemoryLink::pair(DeviceCategory::Dut, "dut");
    let servo = Arc::new(servo);
    let dut = Arc::new(dut);

    let (events, _rx) = flume::unbounded();
    let mut controller = PowerTestController::new(fast_settings(), events);
    controller.select_servo(servo.clone())?;
    controller.select_dut(dut.clone())?;
    controller.set_iteration_count(3)?;
    controller.add_config("sleep 30")?;

    let servo_task = spawn_servo(servo_dev);
    let (dut_task, dut_writes) = spawn_scripted_dut(dut_dev, controller.cancel_handle(), 2);

    let outcome = controller.start_measurement().await?;
    assert_eq!(outcome, RunOutcome::Cancelled);

    let session = controller.session();
    assert!(!session.is_complete());
    assert_eq!(session.runner_configs[0].iteration_records.len(), 1);
    assert!(!servo.is_open() && !dut.is_open());

    // Let the DUT task log the finalization writes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let writes: Vec<String> = dut_writes.drain().collect();
    let interrupts = writes.iter().filter(|w| *w == CANCEL_COMMAND).count();
    assert_eq!(interrupts, 3);
    assert_eq!(writes.last().map(String::as_str), Some(RESTORE_POWER_COMMAND));

    servo_task.abort();
    dut_task.abort();
    Ok(())
}

#[tokio::test]
async fn servo_unplugged_mid_run_stops_the_session() -> Result<()> {
    let fixture = SimulatedFixture::spawn(fast_profile());
    let (mut controller, rx) = simulated_controller(&fixture, &["a", "b"], 2)?;

    let servo_device = fixture.servo_device().clone();
    let unplug = tokio::spawn(async move {
        while let Ok(event) = rx.recv_async().await {
            match event {
                CoreToUi::IterationCompleted { .. } => servo_device.disconnect("cable pulled"),
                CoreToUi::Error(message) => return Some(message),
                _ => {}
            }
        }
        None
    });

    let err = controller.start_measurement().await.unwrap_err();
    assert!(matches!(
        err,
        PowerTestError::LinkIo {
            category: DeviceCategory::Servo,
            ..
        }
    ));

    let session = controller.session();
    assert!(!session.is_complete());
    let recorded: usize = session
        .runner_configs
        .iter()
        .map(|c| c.iteration_records.len())
        .sum();
    assert_eq!(recorded, 1);
    assert_eq!(controller.state(), ControllerState::Idle);
    assert!(!fixture.dut.is_open());

    drop(controller);
    let message = unplug.await?;
    assert!(message.is_some_and(|m| m.contains("servo")));
    Ok(())
}

#[tokio::test]
async fn unavailable_dut_fails_before_recording() -> Result<()> {
    let fixture = SimulatedFixture::spawn(fast_profile());
    fixture.dut_device().set_available(false);
    let (mut controller, _rx) = simulated_controller(&fixture, &["true"], 1)?;

    let err = controller.start_measurement().await.unwrap_err();
    assert!(matches!(
        err,
        PowerTestError::LinkUnavailable {
            category: DeviceCategory::Dut,
            ..
        }
    ));
    assert!(controller.session().runner_configs[0].iteration_records.is_empty());
    assert!(!fixture.servo.is_open());
    Ok(())
}

#[test]
fn report_command_prints_statistics() -> Result<()> {
    let text = r#"{
        "margin": 100,
        "iterationNumber": 1,
        "data": [
            {"config": "sleep 1", "measuredData": [{
                "power": [
                    {"time": 0, "power": 1000}, {"time": 200, "power": 1100},
                    {"time": 300, "power": 1200}, {"time": 900, "power": 5000}
                ],
                "annotation": {"start": 50, "end": 850}
            }]}
        ]
    }"#;
    let session = Session::from_json(text)?;
    assert_eq!(
        session.runner_configs[0].iteration_records[0]
            .first_marker(AnnotationLabel::End),
        Some(850)
    );

    let path = std::env::temp_dir().join(format!("servo_power_report_{}.json", std::process::id()));
    std::fs::write(&path, text)?;

    let output = Command::new(env!("CARGO_BIN_EXE_servo-power"))
        .arg("report")
        .arg(&path)
        .arg("--json")
        .output()?;
    std::fs::remove_file(&path)?;

    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(value["configs"][0]["summary"]["count"], 2);
    assert_eq!(value["configs"][0]["summary"]["max"], 1200);
    Ok(())
}

#[test]
fn report_rejects_iteration_out_of_range() -> Result<()> {
    let path = std::env::temp_dir().join(format!("servo_power_range_{}.json", std::process::id()));
    std::fs::write(&path, r#"{"margin": 0, "iterationNumber": 1, "data": []}"#)?;

    let output = Command::new(env!("CARGO_BIN_EXE_servo-power"))
        .args(["report", "--iteration", "2"])
        .arg(&path)
        .output()?;
    std::fs::remove_file(&path)?;

    assert!(!output.status.success());
    Ok(())
}
