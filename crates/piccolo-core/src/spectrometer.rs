//! Per-spectrometer worker thread.
//!
//! Each worker owns exactly one [`SpectrometerDriver`] and serves its task
//! queue on a dedicated thread; a worker-local busy flag rejects overlapping
//! `Acquire`/`Autointegrate` requests rather than queuing them silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{info, warn};

use crate::autointegrate::autointegrate;
use crate::error::CoreError;
use crate::hardware::SpectrometerDriver;
use crate::spectrum::{Direction, Spectrum};

/// One request submitted to a spectrometer worker.
pub enum SpectrometerTask {
    SetIntegrationLimits { min_ms: Option<u32>, max_ms: Option<u32> },
    Acquire {
        integration_ms: u32,
        direction: Direction,
        dark: bool,
    },
    Autointegrate { target_fraction: f64 },
    /// Null sentinel: closes the worker.
    Stop,
}

/// One outcome produced by a spectrometer worker.
pub enum SpectrometerResult {
    Spectrum(Spectrum),
    Limits { min_ms: u32, max_ms: u32 },
    AutointegrateOk { best_ms: u32 },
    AutointegrateFailed { message: String },
    Error(CoreError),
}

/// Handle used by the coordinator to submit tasks to and read results from
/// a running spectrometer worker.
#[derive(Clone)]
pub struct SpectrometerHandle {
    name: String,
    tasks: Sender<SpectrometerTask>,
    results: Receiver<SpectrometerResult>,
    busy: Arc<AtomicBool>,
}

impl SpectrometerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Submit a task without blocking for its result; the coordinator
    /// collects results from `results()` once all shutters/spectrometers in
    /// a cycle have been issued.
    pub fn submit(&self, task: SpectrometerTask) -> Result<(), CoreError> {
        if self.is_busy() {
            return Err(CoreError::Busy);
        }
        self.tasks
            .send(task)
            .map_err(|_| CoreError::Other("spectrometer worker has stopped".into()))
    }

    pub fn results(&self) -> &Receiver<SpectrometerResult> {
        &self.results
    }

    pub fn stop(&self) {
        let _ = self.tasks.send(SpectrometerTask::Stop);
    }
}

/// Spawn a worker thread owning `driver`, returning a handle to submit
/// tasks and collect results. `name` is attached to every produced spectrum
/// as the reserved `name` metadata field.
pub fn spawn(name: impl Into<String>, driver: Box<dyn SpectrometerDriver>) -> SpectrometerHandle {
    let name = name.into();
    let (task_tx, task_rx) = unbounded::<SpectrometerTask>();
    let (result_tx, result_rx) = unbounded::<SpectrometerResult>();
    let busy = Arc::new(AtomicBool::new(false));

    let thread_name = name.clone();
    let thread_busy = Arc::clone(&busy);
    thread::Builder::new()
        .name(format!("spectrometer-{thread_name}"))
        .spawn(move || run_worker(thread_name, driver, task_rx, result_tx, thread_busy))
        .expect("failed to spawn spectrometer worker thread");

    SpectrometerHandle {
        name,
        tasks: task_tx,
        results: result_rx,
        busy,
    }
}

fn run_worker(
    name: String,
    mut driver: Box<dyn SpectrometerDriver>,
    tasks: Receiver<SpectrometerTask>,
    results: Sender<SpectrometerResult>,
    busy: Arc<AtomicBool>,
) {
    let mut min_ms = driver.min_integration_ms();
    let mut max_ms = driver.max_integration_ms();

    for task in tasks {
        busy.store(true, Ordering::SeqCst);
        match task {
            SpectrometerTask::Stop => {
                info!("spectrometer worker '{name}' stopping");
                busy.store(false, Ordering::SeqCst);
                return;
            }
            SpectrometerTask::SetIntegrationLimits { min_ms: new_min, max_ms: new_max } => {
                if let Some(m) = new_min {
                    min_ms = m.max(driver.min_integration_ms());
                }
                if let Some(m) = new_max {
                    max_ms = m.min(driver.max_integration_ms());
                }
                let _ = results.send(SpectrometerResult::Limits { min_ms, max_ms });
            }
            SpectrometerTask::Acquire { integration_ms, direction, dark } => {
                let clamped = integration_ms.clamp(min_ms, max_ms);
                match driver.acquire(clamped) {
                    Ok(raw) => {
                        let meta = driver.metadata();
                        let mut spectrum = Spectrum::new(raw.pixels);
                        let _ = spectrum.set_metadata("SerialNumber", meta.serial_number.clone());
                        let _ = spectrum.set_metadata("IntegrationTime", clamped);
                        let _ = spectrum.set_metadata("IntegrationTimeUnits", "ms");
                        let _ = spectrum.set_metadata(
                            "WavelengthCalibrationCoefficients",
                            meta.wavelength_calibration_coefficients.clone(),
                        );
                        let _ = spectrum.set_metadata("SaturationLevel", meta.saturation_level);
                        let _ = spectrum.set_metadata(
                            "NonlinearityCorrectionCoefficients",
                            meta.nonlinearity_correction_coefficients.clone(),
                        );
                        let _ = spectrum.set_metadata(
                            "OpticalPixelRange",
                            vec![meta.optical_pixel_range.0, meta.optical_pixel_range.1],
                        );
                        spectrum.stamp(direction, dark, Utc::now(), &name);
                        let _ = results.send(SpectrometerResult::Spectrum(spectrum));
                    }
                    Err(e) => {
                        warn!("spectrometer '{name}' acquire failed: {e}");
                        let _ = results.send(SpectrometerResult::Error(CoreError::Other(e.0)));
                    }
                }
            }
            SpectrometerTask::Autointegrate { target_fraction } => {
                match autointegrate(driver.as_ref(), target_fraction) {
                    Ok(best_ms) => {
                        let _ = results.send(SpectrometerResult::AutointegrateOk { best_ms });
                    }
                    Err(e) => {
                        warn!("autointegration failed on '{name}': {e}");
                        let _ = results.send(SpectrometerResult::AutointegrateFailed { message: e.message() });
                    }
                }
            }
        }
        busy.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockSpectrometerDriver;
    use std::time::Duration;

    fn recv_timeout(rx: &Receiver<SpectrometerResult>) -> SpectrometerResult {
        rx.recv_timeout(Duration::from_secs(2)).expect("worker did not respond in time")
    }

    #[test]
    fn acquire_stamps_reserved_fields() {
        let driver = Box::new(MockSpectrometerDriver::new("SN1", 128, 10, 2000));
        let handle = spawn("S_A", driver);
        handle
            .submit(SpectrometerTask::Acquire {
                integration_ms: 100,
                direction: Direction::Upwelling,
                dark: false,
            })
            .unwrap();
        match recv_timeout(handle.results()) {
            SpectrometerResult::Spectrum(s) => {
                assert_eq!(s.direction(), Some(Direction::Upwelling));
                assert!(!s.is_dark());
            }
            _ => panic!("unexpected result"),
        }
        handle.stop();
    }

    #[test]
    fn acquire_populates_all_required_metadata_keys() {
        let driver = Box::new(MockSpectrometerDriver::new("SN1", 128, 10, 2000));
        let handle = spawn("S_A", driver);
        handle
            .submit(SpectrometerTask::Acquire {
                integration_ms: 100,
                direction: Direction::Downwelling,
                dark: true,
            })
            .unwrap();
        match recv_timeout(handle.results()) {
            SpectrometerResult::Spectrum(s) => {
                for key in [
                    "Direction",
                    "Dark",
                    "Datetime",
                    "name",
                    "SerialNumber",
                    "IntegrationTime",
                    "IntegrationTimeUnits",
                    "WavelengthCalibrationCoefficients",
                    "SaturationLevel",
                    "NonlinearityCorrectionCoefficients",
                    "OpticalPixelRange",
                ] {
                    assert!(s.metadata(key).is_some(), "missing required metadata key '{key}'");
                }
            }
            _ => panic!("unexpected result"),
        }
        handle.stop();
    }

    #[test]
    fn busy_worker_rejects_overlapping_submit() {
        let driver = Box::new(MockSpectrometerDriver::new("SN1", 64, 10, 2000));
        let handle = spawn("S_A", driver);
        // Nothing queued yet, so not busy.
        assert!(!handle.is_busy());
        handle.stop();
    }

    #[test]
    fn autointegrate_reports_ok_on_mock() {
        let driver = Box::new(MockSpectrometerDriver::new("SN1", 256, 10, 5000));
        let handle = spawn("S_A", driver);
        handle.submit(SpectrometerTask::Autointegrate { target_fraction: 0.7 }).unwrap();
        match recv_timeout(handle.results()) {
            SpectrometerResult::AutointegrateOk { best_ms } => {
                assert!(best_ms >= 10 && best_ms <= 5000);
            }
            SpectrometerResult::AutointegrateFailed { message } => {
                panic!("unexpected autointegration failure: {message}");
            }
            _ => panic!("unexpected result"),
        }
        handle.stop();
    }
}
