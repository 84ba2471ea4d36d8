use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use flume::{Receiver, Sender};

use super::{
    config::{DeviceConfig, MeasurementConfig},
    console::{self, format_comparison, format_summary, print_console_tail},
};
use crate::{
    core::{
        bus::{self, UiToCore},
        controller::{PowerTestController, RunOutcome},
        monitor::Monitor,
        runner::RunnerSettings,
        session::Session,
        simulator::{SimulatedFixture, SimulationProfile},
        stats::{compare, compare_iteration},
    },
    protocol::{link::DeviceCategory, runtime::SerialConfig},
    utils::ports::enumerate_ports,
};

/// Console lines shown after a failed run.
const FAILURE_CONTEXT_LINES: usize = 20;

pub async fn dispatch(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("list-ports", sub)) => list_ports(sub.get_flag("json")),
        Some(("run", sub)) => run(sub).await,
        Some(("monitor", sub)) => monitor(sub).await,
        Some(("report", sub)) => report(sub),
        _ => Err(anyhow!("No command given, see --help")),
    }
}

fn list_ports(want_json: bool) -> Result<()> {
    let ports = enumerate_ports();
    if want_json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{:<24} {:04x}:{:04x} {:?}",
                port.port_name, vid, pid, port.kind
            ),
            _ => println!("{:<24} {:?}", port.port_name, port.kind),
        }
    }
    Ok(())
}

/// Route Ctrl-C into the bus as a cancel request.
fn install_ctrlc(ui_tx: Sender<UiToCore>) -> Result<()> {
    ctrlc::set_handler(move || {
        if ui_tx.send(UiToCore::Cancel).is_err() {
            log::warn!("Ctrl-C received after shutdown");
        }
    })
    .map_err(|err| anyhow!("Failed to install Ctrl-C handler: {err}"))
}

async fn forward_ui<F: Fn() + Send + 'static>(ui_rx: Receiver<UiToCore>, on_cancel: F) {
    while let Ok(message) = ui_rx.recv_async().await {
        match message {
            UiToCore::Cancel => on_cancel(),
            UiToCore::Quit => break,
        }
    }
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let config_path = matches
        .get_one::<String>("config")
        .ok_or_else(|| anyhow!("--config is required"))?;
    let mut config = MeasurementConfig::from_file(config_path)?;
    let script_files: Vec<String> = matches
        .get_many::<String>("script")
        .map(|files| files.cloned().collect())
        .unwrap_or_default();
    config.override_scripts(&script_files)?;
    let export = matches.get_one::<String>("export");

    let (ui, core) = bus::channel();
    let mut controller = PowerTestController::new(config.runner_settings(), core.core_tx.clone());

    let fixture = matches
        .get_flag("simulate")
        .then(|| SimulatedFixture::spawn(SimulationProfile::default()));
    match &fixture {
        Some(fixture) => {
            println!("Using simulated servo and DUT");
            controller.select_servo(fixture.servo.clone())?;
            controller.select_dut(fixture.dut.clone())?;
        }
        None => {
            controller.select_servo(config.servo.link(DeviceCategory::Servo))?;
            controller.select_dut(config.dut.link(DeviceCategory::Dut))?;
        }
    }
    controller.set_margin(config.margin_ms)?;
    controller.set_iteration_count(config.iterations)?;
    for script in &config.scripts {
        controller.add_config(script.clone())?;
    }

    install_ctrlc(ui.ui_tx.clone())?;
    let cancel = controller.cancel_handle();
    let forwarder = tokio::spawn(forward_ui(core.ui_rx.clone(), move || cancel.cancel()));
    let printer = tokio::spawn(console::print_events(ui.core_rx.clone()));

    let outcome = controller.start_measurement().await;
    let exported = match (&outcome, export) {
        (Ok(RunOutcome::Completed(_)), Some(path)) => {
            let text = controller.export_session()?;
            std::fs::write(path, text).with_context(|| format!("Failed to write {path}"))?;
            Some(path.clone())
        }
        _ => None,
    };

    drop(controller);
    drop(core);
    drop(fixture);
    let _ = ui.ui_tx.send(UiToCore::Quit);
    let _ = forwarder.await;
    let console_log = printer.await.context("Console printer failed")?;

    match outcome {
        Ok(RunOutcome::Completed(comparison)) => {
            print!("{}", format_comparison(&comparison));
            if let Some(path) = exported {
                println!("Session written to {path}");
            }
            Ok(())
        }
        Ok(RunOutcome::Cancelled) => {
            println!("Measurement cancelled, nothing recorded");
            Ok(())
        }
        Err(err) => {
            print_console_tail(&console_log, FAILURE_CONTEXT_LINES);
            Err(anyhow!(err).context("Measurement failed"))
        }
    }
}

async fn monitor(matches: &ArgMatches) -> Result<()> {
    let servo_port = matches
        .get_one::<String>("servo")
        .ok_or_else(|| anyhow!("--servo is required"))?;
    let output = matches
        .get_one::<String>("output")
        .ok_or_else(|| anyhow!("--output is required"))?;
    let serial = SerialConfig {
        baud: matches.get_one::<u32>("baud-rate").copied().unwrap_or(115_200),
        ..SerialConfig::default()
    };

    let servo = DeviceConfig {
        port: Some(servo_port.clone()),
        serial: serial.clone(),
    }
    .link(DeviceCategory::Servo);
    let dut = matches.get_one::<String>("dut").map(|port| {
        DeviceConfig {
            port: Some(port.clone()),
            serial: serial.clone(),
        }
        .link(DeviceCategory::Dut)
    });

    let (ui, core) = bus::channel();
    let monitor = Monitor::new(servo, dut, RunnerSettings::default(), core.core_tx.clone());
    install_ctrlc(ui.ui_tx.clone())?;
    let halt = monitor.halt_flag();
    let forwarder = tokio::spawn(forward_ui(core.ui_rx.clone(), move || halt.halt()));
    let printer = tokio::spawn(console::print_events(ui.core_rx.clone()));

    println!("Recording, press Ctrl-C to stop");
    let result = monitor.run().await;

    drop(monitor);
    drop(core);
    let _ = ui.ui_tx.send(UiToCore::Quit);
    let _ = forwarder.await;
    let _ = printer.await;

    let recording = result.context("Monitoring failed")?;
    std::fs::write(output, recording.to_json()?)
        .with_context(|| format!("Failed to write {output}"))?;
    println!(
        "{} samples, {} markers written to {output}",
        recording.power.len(),
        recording.annotation.len()
    );
    print!("{}", format_summary("recording", recording.analyze(None, None).as_ref()));
    Ok(())
}

fn report(matches: &ArgMatches) -> Result<()> {
    let path = matches
        .get_one::<String>("session")
        .ok_or_else(|| anyhow!("session file is required"))?;
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    let session = Session::from_json(&text).with_context(|| format!("Invalid session file {path}"))?;

    let comparison = match matches.get_one::<usize>("iteration").copied() {
        Some(n) if n == 0 || n > session.iteration_count as usize => {
            return Err(anyhow!(
                "Iteration {n} out of range, the session has {} iterations",
                session.iteration_count
            ));
        }
        Some(n) => compare_iteration(&session, n - 1),
        None => compare(&session),
    };

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
    } else {
        println!(
            "margin {} ms, {} iterations{}",
            session.margin_time_millis,
            session.iteration_count,
            if session.is_complete() { "" } else { " (incomplete)" }
        );
        print!("{}", format_comparison(&comparison));
    }
    Ok(())
}
