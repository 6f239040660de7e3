//! The acquisition coordinator: the recording state machine that drives
//! shutters and spectrometer workers through the dark/light cycle pattern.
//!
//! Built on this crate's established worker-thread idiom (own thread, task
//! channel, busy flag) for everything around the state machine itself; GPS,
//! altitude enrichment, and status-LED transitions are driven from the same
//! thread at the points the state machine names.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{info, warn};
use serde_json::Value;

use crate::data_dir::DataDir;
use crate::dispatcher::Component;
use crate::error::{CoreError, CoreResult};
use crate::hardware::{AltimeterDriver, GpsDriver, LedPattern, StatusLed};
use crate::integration::{IntegrationSource, IntegrationTimes};
use crate::message::MessageBus;
use crate::output::OutputHandle;
use crate::spectrometer::{SpectrometerHandle, SpectrometerResult, SpectrometerTask};
use crate::spectrum::{Direction, SpectraList};

/// `nCycles` may be a finite count or the "infinite" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleCount {
    Finite(u32),
    Infinite,
}

/// How often autointegration is triggered: never, once at record start,
/// or every `n`-th cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoMode {
    Never,
    AtStart,
    EveryNth(u32),
}

impl AutoMode {
    pub fn from_i32(mode: i32) -> Self {
        match mode {
            i32::MIN..=-1 => AutoMode::Never,
            0 => AutoMode::AtStart,
            n => AutoMode::EveryNth(n as u32),
        }
    }
}

/// One request submitted to the coordinator.
pub enum CoordinatorTask {
    SetTime { shutter: Direction, spectrometer: String, ms: u32 },
    SetMin { spectrometer: String, ms: u32 },
    SetMax { spectrometer: String, ms: u32 },
    SetAuto { mode: i32 },
    SetCurrentRun { name: String },
    SetNCycles { n_cycles: CycleCount },
    SetDelay { seconds: f64 },
    Record { out_dir: String, n_cycles: CycleCount, delay: f64 },
    Dark,
    Abort,
    Pause,
    Status,
    Shutdown,
}

enum Outcome {
    Value(Value),
    Error(CoreError),
}

struct Request {
    task: CoordinatorTask,
    reply: Sender<Outcome>,
}

/// Registers one spectrometer with the coordinator at construction time:
/// its handle plus the hardware limits to seed the integration-time table.
pub struct SpectrometerEntry {
    pub name: String,
    pub handle: SpectrometerHandle,
    pub min_ms: u32,
    pub max_ms: u32,
}

struct Worker {
    shutters: BTreeMap<Direction, Arc<crate::shutter::ShutterController>>,
    spectrometers: BTreeMap<String, SpectrometerHandle>,
    integration: IntegrationTimes,
    bus: MessageBus,
    output: OutputHandle,
    data_dir: Arc<DataDir>,
    gps: Arc<dyn GpsDriver>,
    altimeter: Arc<dyn AltimeterDriver>,
    led: Arc<dyn StatusLed>,
    auto_mode: AutoMode,
    current_run: String,
    n_cycles: CycleCount,
    delay: f64,
    need_dark: bool,
    paused: bool,
    recording: bool,
}

/// Handle used to submit tasks to a running coordinator, and what the
/// dispatcher registers under the `"coordinator"` component name.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tasks: Sender<Request>,
}

impl CoordinatorHandle {
    pub fn submit(&self, task: CoordinatorTask) -> CoreResult<Value> {
        let (reply, rx) = unbounded();
        self.tasks
            .send(Request { task, reply })
            .map_err(|_| CoreError::Other("coordinator has stopped".into()))?;
        match rx.recv() {
            Ok(Outcome::Value(v)) => Ok(v),
            Ok(Outcome::Error(e)) => Err(e),
            Err(_) => Err(CoreError::Other("coordinator has stopped".into())),
        }
    }
}

/// Implements [`Component`] so the dispatcher can route `(command, kwargs)`
/// pairs addressed to `"coordinator"` into typed [`CoordinatorTask`]s.
impl Component for CoordinatorHandle {
    fn execute(&mut self, command: &str, kwargs: &std::collections::HashMap<String, Value>) -> Result<Value, CoreError> {
        let bad_arg = |msg: &str| CoreError::BadArgument {
            command: command.to_string(),
            message: msg.to_string(),
        };
        let get_str = |key: &str| -> Result<String, CoreError> {
            kwargs
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| bad_arg(&format!("missing string argument '{key}'")))
        };
        let get_u32 = |key: &str| -> Result<u32, CoreError> {
            kwargs
                .get(key)
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .ok_or_else(|| bad_arg(&format!("missing numeric argument '{key}'")))
        };
        let get_direction = |key: &str| -> Result<Direction, CoreError> {
            match get_str(key)?.as_str() {
                "upwelling" => Ok(Direction::Upwelling),
                "downwelling" => Ok(Direction::Downwelling),
                other => Err(bad_arg(&format!("'{other}' is not a valid shutter direction"))),
            }
        };
        let n_cycles_of = |kwargs: &std::collections::HashMap<String, Value>| -> CycleCount {
            match kwargs.get("nCycles").and_then(Value::as_i64) {
                Some(n) if n < 0 => CycleCount::Infinite,
                Some(n) => CycleCount::Finite(n as u32),
                None => CycleCount::Finite(1),
            }
        };

        let task = match command {
            "setIntegrationTime" => CoordinatorTask::SetTime {
                shutter: get_direction("shutter")?,
                spectrometer: get_str("spectrometer")?,
                ms: get_u32("ms")?,
            },
            "setMinIntegrationTime" => CoordinatorTask::SetMin {
                spectrometer: get_str("spectrometer")?,
                ms: get_u32("ms")?,
            },
            "setMaxIntegrationTime" => CoordinatorTask::SetMax {
                spectrometer: get_str("spectrometer")?,
                ms: get_u32("ms")?,
            },
            "setAuto" => CoordinatorTask::SetAuto {
                mode: kwargs.get("mode").and_then(Value::as_i64).unwrap_or(-1) as i32,
            },
            "setCurrentRun" => CoordinatorTask::SetCurrentRun { name: get_str("name")? },
            "setNCycles" => CoordinatorTask::SetNCycles { n_cycles: n_cycles_of(kwargs) },
            "setDelay" => CoordinatorTask::SetDelay {
                seconds: kwargs.get("seconds").and_then(Value::as_f64).unwrap_or(0.0),
            },
            "record" => CoordinatorTask::Record {
                out_dir: get_str("outDir")?,
                n_cycles: n_cycles_of(kwargs),
                delay: kwargs.get("delay").and_then(Value::as_f64).unwrap_or(0.0),
            },
            "dark" => CoordinatorTask::Dark,
            "abort" => CoordinatorTask::Abort,
            "pause" => CoordinatorTask::Pause,
            "status" => CoordinatorTask::Status,
            other => {
                return Err(CoreError::UnknownCommand {
                    component: "coordinator".into(),
                    command: other.into(),
                })
            }
        };
        self.submit(task)
    }

    fn stop(&mut self) {
        let _ = self.submit(CoordinatorTask::Shutdown);
    }
}

/// Spawn the coordinator thread. `spectrometers` fixes the iteration order
/// acquisitions are issued in: shutter-then-spectrometer map order, not
/// completion order.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    shutters: BTreeMap<Direction, Arc<crate::shutter::ShutterController>>,
    spectrometers: Vec<SpectrometerEntry>,
    bus: MessageBus,
    output: OutputHandle,
    data_dir: Arc<DataDir>,
    gps: Arc<dyn GpsDriver>,
    altimeter: Arc<dyn AltimeterDriver>,
    led: Arc<dyn StatusLed>,
) -> CoordinatorHandle {
    let (tx, rx) = unbounded::<Request>();

    let mut integration = IntegrationTimes::new();
    let mut handles = BTreeMap::new();
    for entry in spectrometers {
        integration.set_limits(&entry.name, entry.min_ms, entry.max_ms);
        handles.insert(entry.name, entry.handle);
    }

    let mut worker = Worker {
        shutters,
        spectrometers: handles,
        integration,
        bus,
        output,
        data_dir,
        gps,
        altimeter,
        led,
        auto_mode: AutoMode::Never,
        current_run: "default".to_string(),
        n_cycles: CycleCount::Finite(1),
        delay: 0.0,
        need_dark: true,
        paused: false,
        recording: false,
    };

    thread::Builder::new()
        .name("piccolo-coordinator".into())
        .spawn(move || worker.run(rx))
        .expect("failed to spawn coordinator thread");

    CoordinatorHandle { tasks: tx }
}

/// Choose the dark/light measurement pattern for cycle `n` of `n_cycles`
/// total. Returns a sequence of `dark?` flags, in acquisition order,
/// never longer than two entries.
pub fn measurement_pattern(n: u32, n_cycles: CycleCount, need_dark: bool) -> Vec<bool> {
    let mut pattern = vec![false]; // light
    if n == 1 || need_dark {
        pattern.insert(0, true); // prepend dark
    }
    let is_last = matches!(n_cycles, CycleCount::Finite(total) if n == total);
    if is_last && pattern.len() < 2 {
        // Cycle ends without a dark yet (pure [light]): append one so the
        // cycle satisfies "first is dark, or last is dark, or both".
        if !*pattern.last().unwrap() {
            pattern.push(true);
        }
    }
    pattern.truncate(2);
    pattern
}

impl Worker {
    fn run(&mut self, tasks: Receiver<Request>) {
        self.led.blink(LedPattern::Idle);
        loop {
            let Ok(req) = tasks.recv() else { return };
            if self.paused && !matches!(req.task, CoordinatorTask::Pause | CoordinatorTask::Abort | CoordinatorTask::Shutdown | CoordinatorTask::Status) {
                let _ = req.reply.send(Outcome::Error(CoreError::Other("coordinator is paused".into())));
                continue;
            }
            match req.task {
                CoordinatorTask::Shutdown => {
                    self.shutdown_workers();
                    let _ = req.reply.send(Outcome::Value(Value::String("stopped".into())));
                    return;
                }
                CoordinatorTask::Record { out_dir, n_cycles, delay } => {
                    self.n_cycles = n_cycles;
                    self.delay = delay;
                    let _ = req.reply.send(Outcome::Value(Value::String("recording".into())));
                    if self.record(out_dir, &tasks) {
                        return;
                    }
                }
                other => {
                    let result = self.handle_sync(other);
                    let _ = req.reply.send(match result {
                        Ok(v) => Outcome::Value(v),
                        Err(e) => Outcome::Error(e),
                    });
                }
            }
        }
    }

    /// Stop every spectrometer worker and the output writer. Called exactly
    /// once, whether shutdown arrives while idle or mid-recording.
    fn shutdown_workers(&mut self) {
        info!("coordinator shutting down");
        for (_, s) in self.spectrometers.iter() {
            s.stop();
        }
        self.output.stop();
    }

    fn handle_sync(&mut self, task: CoordinatorTask) -> CoreResult<Value> {
        match task {
            CoordinatorTask::SetTime { shutter, spectrometer, ms } => {
                let outcome = self
                    .integration
                    .set(shutter, &spectrometer, ms, IntegrationSource::Manual, true);
                if outcome.changed {
                    self.bus.add_message(format!("IT|{spectrometer}|{shutter}"));
                    if outcome.need_dark {
                        self.need_dark = true;
                    }
                }
                Ok(serde_json::json!({"ms": outcome.ms}))
            }
            CoordinatorTask::SetMin { spectrometer, ms } => {
                if let Some(handle) = self.spectrometers.get(&spectrometer) {
                    let _ = handle.submit(SpectrometerTask::SetIntegrationLimits { min_ms: Some(ms), max_ms: None });
                }
                self.bus.add_message(format!("ITmin|{spectrometer}"));
                Ok(Value::Null)
            }
            CoordinatorTask::SetMax { spectrometer, ms } => {
                if let Some(handle) = self.spectrometers.get(&spectrometer) {
                    let _ = handle.submit(SpectrometerTask::SetIntegrationLimits { min_ms: None, max_ms: Some(ms) });
                }
                self.bus.add_message(format!("ITmax|{spectrometer}"));
                Ok(Value::Null)
            }
            CoordinatorTask::SetAuto { mode } => {
                self.auto_mode = AutoMode::from_i32(mode);
                Ok(Value::Null)
            }
            CoordinatorTask::SetCurrentRun { name } => {
                self.current_run = name.clone();
                self.bus.add_message(format!("CR|{name}"));
                Ok(Value::Null)
            }
            CoordinatorTask::SetNCycles { n_cycles } => {
                self.n_cycles = n_cycles;
                Ok(Value::Null)
            }
            CoordinatorTask::SetDelay { seconds } => {
                self.delay = seconds;
                Ok(Value::Null)
            }
            // `Dark` outside a recording marks the next cycle's pattern
            // rather than being rejected.
            CoordinatorTask::Dark => {
                self.need_dark = true;
                Ok(Value::Null)
            }
            CoordinatorTask::Abort => Ok(Value::String("not recording".into())),
            CoordinatorTask::Pause => {
                self.paused = !self.paused;
                Ok(Value::Bool(self.paused))
            }
            CoordinatorTask::Status => Ok(serde_json::json!({
                "run": self.current_run,
                "paused": self.paused,
                "recording": self.recording,
            })),
            CoordinatorTask::Record { .. } | CoordinatorTask::Shutdown => unreachable!(),
        }
    }

    /// Enter the Recording state and drive every cycle. Holds
    /// the coordinator busy for the duration; returns when recording ends
    /// normally, is aborted, or the process is shutting down. The return
    /// value tells `run` whether the worker threads were already torn down
    /// (a shutdown arriving mid-recording) so it shouldn't tear them down
    /// again or keep serving requests.
    fn record(&mut self, out_dir: String, tasks: &Receiver<Request>) -> bool {
        self.recording = true;
        self.led.blink(LedPattern::Recording);
        let run_dir: PathBuf = self.data_dir.join(&out_dir);
        let batch = self.data_dir.next_counter(&out_dir).unwrap_or(0);
        info!("starting recording batch {batch} into {}", run_dir.display());

        let mut n = 1u32;
        'cycles: loop {
            if let CycleCount::Finite(total) = self.n_cycles {
                if n > total {
                    break;
                }
            }

            if n > 1 && self.delay > 0.0 {
                match self.sleep_polling(self.delay, tasks) {
                    Some(Interrupt::Abort) => break 'cycles,
                    Some(Interrupt::Shutdown) => {
                        self.recording = false;
                        self.shutdown_workers();
                        return true;
                    }
                    None => {}
                }
            }

            let should_autointegrate = match self.auto_mode {
                AutoMode::Never => false,
                AutoMode::AtStart => n == 1,
                AutoMode::EveryNth(k) if k > 0 => (n - 1) % k == 0,
                AutoMode::EveryNth(_) => false,
            };
            if should_autointegrate {
                self.run_autointegration();
            }

            let pattern = measurement_pattern(n, self.n_cycles, self.need_dark);
            self.need_dark = false;

            let gps_fix = self.gps.location();
            let altitude = self.altimeter.altitude();

            let prefix = format!("b{:06}_s", batch);
            let mut list = SpectraList::new(prefix, n - 1);

            for dark in pattern {
                if let Some(interrupt) = self.drive_measurement(dark, &mut list, batch, &self.current_run.clone(), gps_fix, altitude, tasks) {
                    match interrupt {
                        Interrupt::Abort => {
                            self.output.submit(run_dir.clone(), list);
                            break 'cycles;
                        }
                        Interrupt::Shutdown => {
                            self.recording = false;
                            self.shutdown_workers();
                            return true;
                        }
                    }
                }
            }

            self.output.submit(run_dir.clone(), list);
            n += 1;
        }

        self.paused = false;
        self.recording = false;
        self.led.blink(LedPattern::Idle);
        info!("recording finished after {} cycle(s)", n - 1);
        false
    }

    /// For one measurement (`dark?`), open/close shutters, submit Acquire
    /// to every spectrometer in shutter-then-spectrometer order, and collect
    /// results after a fixed short wait.
    #[allow(clippy::too_many_arguments)]
    fn drive_measurement(
        &mut self,
        dark: bool,
        list: &mut SpectraList,
        batch: u32,
        run: &str,
        gps_fix: Option<crate::hardware::GpsFix>,
        altitude: Option<f64>,
        tasks: &Receiver<Request>,
    ) -> Option<Interrupt> {
        let directions: Vec<Direction> = self.shutters.keys().copied().collect();
        for direction in directions {
            if dark {
                for (_, s) in self.shutters.iter() {
                    let _ = s.close();
                }
            } else {
                for (&d, s) in self.shutters.iter() {
                    if d == direction {
                        if s.status() == "closed" {
                            let _ = s.open();
                        }
                    } else if s.status() == "open" {
                        let _ = s.close();
                    }
                }
            }

            for (name, handle) in self.spectrometers.iter() {
                let ms = self
                    .integration
                    .get(direction, name)
                    .map(|c| c.ms)
                    .unwrap_or(100);
                if handle.submit(SpectrometerTask::Acquire { integration_ms: ms, direction, dark }).is_err() {
                    warn!("spectrometer '{name}' rejected acquire (busy)");
                }
            }

            // Fixed short wait for completion before collecting; acquisitions
            // across workers aren't guaranteed to finish in submission order.
            thread::sleep(Duration::from_millis(200));
            for (name, handle) in self.spectrometers.iter() {
                match handle.results().recv_timeout(Duration::from_secs(5)) {
                    Ok(SpectrometerResult::Spectrum(mut s)) => {
                        s.set_batch_run(batch, run);
                        if let Some(fix) = gps_fix {
                            let _ = s.set_metadata("GPSLatitude", fix.latitude);
                            let _ = s.set_metadata("GPSLongitude", fix.longitude);
                        }
                        if let Some(alt) = altitude {
                            let _ = s.set_metadata("Altitude", alt);
                        }
                        list.push(s);
                    }
                    Ok(SpectrometerResult::Error(e)) => warn!("'{name}' acquire failed: {e}"),
                    Ok(_) => {}
                    Err(_) => warn!("'{name}' produced no result within timeout"),
                }
            }

            if let Some(interrupt) = self.poll_interrupt(tasks) {
                return Some(interrupt);
            }
        }
        None
    }

    fn run_autointegration(&mut self) {
        let directions: Vec<Direction> = self.shutters.keys().copied().collect();
        for direction in directions {
            if let Some(shutter) = self.shutters.get(&direction) {
                let _ = shutter.open();
            }
            for (name, handle) in self.spectrometers.iter() {
                if handle.submit(SpectrometerTask::Autointegrate { target_fraction: 0.7 }).is_err() {
                    continue;
                }
                match handle.results().recv_timeout(Duration::from_secs(30)) {
                    Ok(SpectrometerResult::AutointegrateOk { best_ms }) => {
                        let outcome = self.integration.set(direction, name, best_ms, IntegrationSource::Autointegrated, false);
                        if outcome.need_dark {
                            self.need_dark = true;
                        }
                        self.bus.add_message(format!("IT|{name}|{direction}"));
                    }
                    Ok(SpectrometerResult::AutointegrateFailed { message }) => {
                        warn!("autointegration failed for '{name}': {message}");
                        self.integration.mark_failed(direction, name);
                        self.led.blink(LedPattern::Error);
                        self.bus.warning(format!("autointegration failed for {name}: {message}"));
                    }
                    _ => {}
                }
            }
            if let Some(shutter) = self.shutters.get(&direction) {
                let _ = shutter.close();
            }
        }
    }

    /// Drain pending tasks, handling abort/shutdown/dark/pause immediately
    /// and replying to whatever else arrives via [`Worker::handle_sync`].
    /// While paused this blocks the recording loop, re-polling every 100ms,
    /// until unpaused, aborted, or shut down — the Recording↔Paused toggle
    /// of the state machine.
    fn poll_interrupt(&mut self, tasks: &Receiver<Request>) -> Option<Interrupt> {
        loop {
            while let Ok(req) = tasks.try_recv() {
                match req.task {
                    CoordinatorTask::Abort => {
                        let _ = req.reply.send(Outcome::Value(Value::String("aborting".into())));
                        return Some(Interrupt::Abort);
                    }
                    CoordinatorTask::Shutdown => {
                        let _ = req.reply.send(Outcome::Value(Value::String("stopping".into())));
                        return Some(Interrupt::Shutdown);
                    }
                    CoordinatorTask::Dark => {
                        self.need_dark = true;
                        let _ = req.reply.send(Outcome::Value(Value::Null));
                    }
                    CoordinatorTask::Pause => {
                        self.paused = !self.paused;
                        let _ = req.reply.send(Outcome::Value(Value::Bool(self.paused)));
                    }
                    CoordinatorTask::Record { .. } => {
                        let _ = req.reply.send(Outcome::Error(CoreError::Busy));
                    }
                    other if self.paused && !matches!(other, CoordinatorTask::Status) => {
                        let _ = req.reply.send(Outcome::Error(CoreError::Other("coordinator is paused".into())));
                    }
                    other => {
                        let result = self.handle_sync(other);
                        let _ = req.reply.send(match result {
                            Ok(v) => Outcome::Value(v),
                            Err(e) => Outcome::Error(e),
                        });
                    }
                }
            }
            if !self.paused {
                return None;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    /// Sleep `seconds`, polling for abort/shutdown/dark every 100ms rather
    /// than blocking the whole interval uninterruptibly. Returns the
    /// interrupt that cut the sleep short, if any.
    fn sleep_polling(&mut self, seconds: f64, tasks: &Receiver<Request>) -> Option<Interrupt> {
        let mut remaining = Duration::from_secs_f64(seconds.max(0.0));
        let step = Duration::from_millis(100);
        while remaining > Duration::ZERO {
            if let Some(interrupt) = self.poll_interrupt(tasks) {
                return Some(interrupt);
            }
            let slept = step.min(remaining);
            thread::sleep(slept);
            remaining = remaining.saturating_sub(slept);
        }
        None
    }
}

enum Interrupt {
    Abort,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_single_cycle_has_dark_then_light() {
        assert_eq!(measurement_pattern(1, CycleCount::Finite(1), false), vec![true, false]);
    }

    #[test]
    fn pattern_middle_cycle_is_light_only() {
        assert_eq!(measurement_pattern(2, CycleCount::Finite(3), false), vec![false]);
    }

    #[test]
    fn pattern_final_cycle_appends_dark() {
        assert_eq!(measurement_pattern(3, CycleCount::Finite(3), false), vec![false, true]);
    }

    #[test]
    fn pattern_first_cycle_of_multi_cycle_run() {
        assert_eq!(measurement_pattern(1, CycleCount::Finite(3), false), vec![true, false]);
    }

    #[test]
    fn pattern_need_dark_forces_prepend() {
        assert_eq!(measurement_pattern(5, CycleCount::Infinite, true), vec![true, false]);
    }

    #[test]
    fn pattern_never_exceeds_two_measurements() {
        for n in 1..5 {
            for need_dark in [false, true] {
                let pattern = measurement_pattern(n, CycleCount::Finite(4), need_dark);
                assert!(pattern.len() <= 2);
            }
        }
    }

    #[test]
    fn auto_mode_from_i32_matches_spec() {
        assert!(matches!(AutoMode::from_i32(-1), AutoMode::Never));
        assert!(matches!(AutoMode::from_i32(0), AutoMode::AtStart));
        assert!(matches!(AutoMode::from_i32(3), AutoMode::EveryNth(3)));
    }
}
