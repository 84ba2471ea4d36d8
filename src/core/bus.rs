use flume::{Receiver, Sender};

use super::{
    controller::ControllerState,
    runner::RunnerState,
    servo::ServoStats,
    session::{AnnotationMarker, IterationRecord, PowerSample},
    stats::Comparison,
};

/// Messages sent from the front end to the core.
#[derive(Debug, Clone, PartialEq)]
pub enum UiToCore {
    /// Stop the current measurement; finalization still runs.
    Cancel,
    /// Graceful shutdown request.
    Quit,
}

/// Messages sent from the core back to the front end.
#[derive(Debug, Clone)]
pub enum CoreToUi {
    State(ControllerState),
    RunnerState { slot: usize, state: RunnerState },
    /// Raw text received from the DUT console.
    ConsoleOutput(String),
    /// Raw text of one servo telemetry frame.
    ServoOutput(String),
    Sample { slot: usize, sample: PowerSample },
    Annotation { slot: usize, marker: AnnotationMarker },
    ServoStats { slot: usize, stats: ServoStats },
    IterationCompleted { slot: usize, iteration: usize },
    /// Record to display for a configuration (iteration selection, import).
    IterationGraph {
        slot: usize,
        iteration: usize,
        record: IterationRecord,
    },
    Summary(Comparison),
    /// The single surface for user-visible failures.
    Error(String),
}

/// Holder passed into the front end containing the receiving side from core
/// and the sending side to core.
#[derive(Debug, Clone)]
pub struct Bus {
    pub core_rx: Receiver<CoreToUi>,
    pub ui_tx: Sender<UiToCore>,
}

impl Bus {
    pub fn new(core_rx: Receiver<CoreToUi>, ui_tx: Sender<UiToCore>) -> Self {
        Self { core_rx, ui_tx }
    }
}

/// Core-side ends of a [`Bus`].
#[derive(Debug, Clone)]
pub struct CoreEnds {
    pub core_tx: Sender<CoreToUi>,
    pub ui_rx: Receiver<UiToCore>,
}

/// Create both ends of the bus.
pub fn channel() -> (Bus, CoreEnds) {
    let (core_tx, core_rx) = flume::unbounded();
    let (ui_tx, ui_rx) = flume::unbounded();
    (Bus::new(core_rx, ui_tx), CoreEnds { core_tx, ui_rx })
}

/// Publish an event. A front end that went away is not an error for the core.
pub fn publish(sender: &Sender<CoreToUi>, event: CoreToUi) {
    if sender.send(event).is_err() {
        log::trace!("event dropped: no front end attached");
    }
}
