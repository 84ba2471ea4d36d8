//! Servo telemetry loops.
//!
//! Two tasks share one link: the write-pacing loop asks for a frame every
//! `request_interval`, the read loop feeds the decoder. They meet at the
//! [`RequestGate`]: at most one `ina 0` request is outstanding, a tick that
//! finds one in flight is skipped (never queued), and a request left
//! unanswered for `stale_request_timeout` is written off and reissued.

use flume::Sender;
use futures::future::join;
use parking_lot::Mutex;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use super::{
    bus::{publish, CoreToUi},
    session::PowerSample,
};
use crate::{
    error::PowerTestError,
    protocol::{
        link::{read_unless_halted, HaltFlag, SharedLink},
        telemetry::{DecodeEvent, TelemetryDecoder, INA_COMMAND},
    },
};

pub const REQUEST_INTERVAL: Duration = Duration::from_millis(100);
pub const STALE_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoTiming {
    pub request_interval: Duration,
    pub stale_request_timeout: Duration,
}

impl Default for ServoTiming {
    fn default() -> Self {
        Self {
            request_interval: REQUEST_INTERVAL,
            stale_request_timeout: STALE_REQUEST_TIMEOUT,
        }
    }
}

/// Counters of one servo session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServoStats {
    pub requests_sent: u64,
    pub requests_skipped: u64,
    pub stale_requests: u64,
    pub frames: u64,
    pub malformed_frames: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Send,
    /// A request is still outstanding.
    Skip,
    /// The outstanding request went stale; send a fresh one.
    ReissueStale,
}

/// In-flight flag with a staleness deadline.
#[derive(Debug, Clone)]
pub struct RequestGate {
    in_flight_since: Option<Instant>,
    stale_after: Duration,
}

impl RequestGate {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            in_flight_since: None,
            stale_after,
        }
    }

    /// Decide what the pacing tick at `now` does. `Send` and `ReissueStale`
    /// mark a request in flight from `now`.
    pub fn on_tick(&mut self, now: Instant) -> GateDecision {
        match self.in_flight_since {
            None => {
                self.in_flight_since = Some(now);
                GateDecision::Send
            }
            Some(since) if now.duration_since(since) >= self.stale_after => {
                self.in_flight_since = Some(now);
                GateDecision::ReissueStale
            }
            Some(_) => GateDecision::Skip,
        }
    }

    pub fn on_response(&mut self) {
        self.in_flight_since = None;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight_since.is_some()
    }
}

struct ServoShared {
    gate: RequestGate,
    stats: ServoStats,
}

impl ServoShared {
    fn on_tick(&mut self, now: Instant) -> GateDecision {
        let decision = self.gate.on_tick(now);
        match decision {
            GateDecision::Send => self.stats.requests_sent += 1,
            GateDecision::ReissueStale => {
                self.stats.requests_sent += 1;
                self.stats.stale_requests += 1;
            }
            GateDecision::Skip => self.stats.requests_skipped += 1,
        }
        decision
    }
}

pub struct ServoController {
    link: SharedLink,
    timing: ServoTiming,
    events: Sender<CoreToUi>,
}

impl ServoController {
    pub fn new(link: SharedLink, timing: ServoTiming, events: Sender<CoreToUi>) -> Self {
        Self {
            link,
            timing,
            events,
        }
    }

    pub fn link(&self) -> &SharedLink {
        &self.link
    }

    /// Spawn the write-pacing and read loops. Decoded samples go to
    /// `samples`; a loop that fails reports once on `faults` and ends.
    pub fn start(
        &self,
        samples: Sender<PowerSample>,
        faults: Sender<PowerTestError>,
    ) -> ServoHandle {
        let halt = HaltFlag::new();
        let shared = Arc::new(Mutex::new(ServoShared {
            gate: RequestGate::new(self.timing.stale_request_timeout),
            stats: ServoStats::default(),
        }));

        let writer = tokio::spawn(write_loop(
            self.link.clone(),
            self.timing,
            shared.clone(),
            halt.clone(),
            faults.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            self.link.clone(),
            shared.clone(),
            halt.clone(),
            samples,
            faults,
            self.events.clone(),
        ));

        ServoHandle {
            halt,
            shared,
            writer,
            reader,
        }
    }
}

/// Running servo loops.
pub struct ServoHandle {
    halt: HaltFlag,
    shared: Arc<Mutex<ServoShared>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl ServoHandle {
    pub fn halt_flag(&self) -> HaltFlag {
        self.halt.clone()
    }

    pub fn stats(&self) -> ServoStats {
        self.shared.lock().stats
    }

    /// Halt both loops and wait for them to exit.
    pub async fn stop(self) -> ServoStats {
        self.halt.halt();
        let (writer, reader) = join(self.writer, self.reader).await;
        for result in [writer, reader] {
            if let Err(err) = result {
                log::error!("servo loop task failed: {err}");
            }
        }
        let stats = self.shared.lock().stats;
        if stats.requests_skipped > 0 || stats.stale_requests > 0 {
            log::warn!(
                "servo: {} requests sent, {} skipped, {} stale",
                stats.requests_sent,
                stats.requests_skipped,
                stats.stale_requests
            );
        }
        stats
    }
}

async fn write_loop(
    link: SharedLink,
    timing: ServoTiming,
    shared: Arc<Mutex<ServoShared>>,
    halt: HaltFlag,
    faults: Sender<PowerTestError>,
) {
    let mut ticker = tokio::time::interval(timing.request_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = halt.halted() => break,
            _ = ticker.tick() => {}
        }

        let decision = shared.lock().on_tick(Instant::now());
        match decision {
            GateDecision::Send => {}
            GateDecision::Skip => {
                log::warn!("previous ina request is in progress, skipping");
                continue;
            }
            GateDecision::ReissueStale => {
                log::warn!(
                    "ina request unanswered for {:?}, reissuing",
                    timing.stale_request_timeout
                );
            }
        }

        if let Err(err) = link.write(INA_COMMAND.as_bytes()).await {
            if !halt.is_halted() {
                let _ = faults.send(err);
            }
            break;
        }
    }
    log::debug!("servo write loop stopped");
}

async fn read_loop(
    link: SharedLink,
    shared: Arc<Mutex<ServoShared>>,
    halt: HaltFlag,
    samples: Sender<PowerSample>,
    faults: Sender<PowerTestError>,
    events: Sender<CoreToUi>,
) {
    let mut decoder = TelemetryDecoder::new();

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

        let event = decoder.push(&chunk);
        if event.completes_request() {
            shared.lock().gate.on_response();
        }
        match event {
            DecodeEvent::Pending => {}
            DecodeEvent::Frame(frame) => {
                shared.lock().stats.frames += 1;
                publish(&events, CoreToUi::ServoOutput(frame.raw));
                if samples.send_async(frame.sample).await.is_err() {
                    break;
                }
            }
            DecodeEvent::Malformed { reason, .. } => {
                shared.lock().stats.malformed_frames += 1;
                log::warn!("{}", PowerTestError::ProtocolMalformed(reason));
            }
        }
    }
    log::debug!("servo read loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::link::{DeviceCategory, DuplexLink, MemoryDevice, MemoryLink};

    const FRAME: &str = "Power => 500 mW\nAlert limit: 0\n";

    #[test]
    fn gate_skips_while_in_flight() {
        let t0 = Instant::now();
        let mut gate = RequestGate::new(STALE_REQUEST_TIMEOUT);
        assert_eq!(gate.on_tick(t0), GateDecision::Send);
        assert_eq!(gate.on_tick(t0 + REQUEST_INTERVAL), GateDecision::Skip);
        gate.on_response();
        assert!(!gate.in_flight());
        assert_eq!(gate.on_tick(t0 + REQUEST_INTERVAL * 2), GateDecision::Send);
    }

    #[test]
    fn gate_reissues_stale_request() {
        let t0 = Instant::now();
        let mut gate = RequestGate::new(STALE_REQUEST_TIMEOUT);
        assert_eq!(gate.on_tick(t0), GateDecision::Send);
        assert_eq!(gate.on_tick(t0 + Duration::from_millis(900)), GateDecision::Skip);
        assert_eq!(gate.on_tick(t0 + STALE_REQUEST_TIMEOUT), GateDecision::ReissueStale);
        assert_eq!(gate.on_tick(t0 + Duration::from_millis(1100)), GateDecision::Skip);
    }

    async fn open_servo() -> (SharedLink, MemoryDevice) {
        let (link, device) = MemoryLink::pair(DeviceCategory::Servo, "virtual-servo");
        link.open().await.unwrap();
        (Arc::new(link), device)
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_skips_exactly_one_request() {
        let (link, device) = open_servo().await;
        let responder = {
            let device = device.clone();
            tokio::spawn(async move {
                let mut requests = 0;
                while let Some(request) = device.next_write().await {
                    assert_eq!(request, INA_COMMAND);
                    requests += 1;
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    device.emit(FRAME);
                }
                requests
            })
        };

        let (events, _events_rx) = flume::unbounded();
        let (samples_tx, samples_rx) = flume::bounded(64);
        let (faults_tx, faults_rx) = flume::unbounded();
        let servo = ServoController::new(link.clone(), ServoTiming::default(), events);
        let handle = servo.start(samples_tx, faults_tx);

        // Requests at 0, 200, 400; ticks at 100 and 300 find one in flight.
        tokio::time::sleep(Duration::from_millis(450)).await;
        let stats = handle.stop().await;

        assert_eq!(stats.requests_sent, 3);
        assert_eq!(stats.requests_skipped, 2);
        assert_eq!(stats.frames, 2);
        assert_eq!(samples_rx.drain().count(), 2);
        assert!(faults_rx.is_empty());

        link.close().await;
        drop(link);
        drop(device);
        responder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_goes_stale() {
        let (link, _device) = open_servo().await;
        let (events, _events_rx) = flume::unbounded();
        let (samples_tx, _samples_rx) = flume::bounded(64);
        let (faults_tx, _faults_rx) = flume::unbounded();
        let servo = ServoController::new(link, ServoTiming::default(), events);
        let handle = servo.start(samples_tx, faults_tx);

        tokio::time::sleep(Duration::from_millis(1050)).await;
        let stats = handle.stop().await;

        assert_eq!(stats.stale_requests, 1);
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.requests_skipped, 9);
        assert_eq!(stats.frames, 0);
    }

    #[tokio::test]
    async fn malformed_frame_is_counted_and_loop_continues() {
        let (link, device) = open_servo().await;
        let (events, _events_rx) = flume::unbounded();
        let (samples_tx, samples_rx) = flume::bounded(64);
        let (faults_tx, _faults_rx) = flume::unbounded();
        let servo = ServoController::new(link, ServoTiming::default(), events);
        let handle = servo.start(samples_tx, faults_tx);

        device.emit("Current => 3 mA\nAlert limit: 0\n");
        device.emit("Power => 700 mW\nAlert limit: 0\n");
        let sample = samples_rx.recv_async().await.unwrap();
        assert_eq!(sample.power_milliwatts, 700);

        let stats = handle.stop().await;
        assert_eq!(stats.malformed_frames, 1);
        assert_eq!(stats.frames, 1);
    }

    #[tokio::test]
    async fn disconnect_is_reported_as_fault() {
        let (link, device) = open_servo().await;
        let (events, _events_rx) = flume::unbounded();
        let (samples_tx, _samples_rx) = flume::bounded(64);
        let (faults_tx, faults_rx) = flume::unbounded();
        let servo = ServoController::new(link, ServoTiming::default(), events);
        let handle = servo.start(samples_tx, faults_tx);

        device.disconnect("unplugged");
        let fault = faults_rx.recv_async().await.unwrap();
        assert!(matches!(
            fault,
            PowerTestError::LinkIo {
                category: DeviceCategory::Servo,
                ..
            }
        ));
        handle.stop().await;
    }
}
