//! Hardware driver interfaces: the surface external spectrometer, shutter,
//! GPS, altimeter, and status-LED drivers must implement.
//!
//! Real drivers for specific spectrometer/shutter/GPS/altimeter models live
//! outside this crate and implement these traits. `hardware::mock` is the
//! only implementation shipped here, used by tests and the CLI's demo mode.

use serde::{Deserialize, Serialize};

/// Error returned by a hardware driver call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct DriverError(pub String);

/// A raw, unprocessed spectrum read straight off a spectrometer.
#[derive(Debug, Clone)]
pub struct RawSpectrum {
    pub pixels: Vec<f64>,
}

/// Static metadata a spectrometer driver reports about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrometerMetadata {
    pub serial_number: String,
    pub wavelength_calibration_coefficients: Vec<f64>,
    pub saturation_level: f64,
    pub nonlinearity_correction_coefficients: Vec<f64>,
    pub optical_pixel_range: (u32, u32),
}

/// Driver surface for a single physical spectrometer.
pub trait SpectrometerDriver: Send {
    /// Acquire one spectrum at the given integration time.
    fn acquire(&self, integration_ms: u32) -> Result<RawSpectrum, DriverError>;
    /// Number of pixels this spectrometer reports.
    fn pixel_count(&self) -> usize;
    /// Static per-device metadata attached to every acquired spectrum.
    fn metadata(&self) -> SpectrometerMetadata;
    fn min_integration_ms(&self) -> u32;
    fn max_integration_ms(&self) -> u32;
}

/// Driver surface for a single shutter.
pub trait ShutterDriver: Send {
    fn open(&self) -> Result<(), DriverError>;
    fn close(&self) -> Result<(), DriverError>;
}

/// A GPS fix, attached to spectra as metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
}

/// Driver surface for the GPS receiver.
pub trait GpsDriver: Send {
    fn location(&self) -> Option<GpsFix>;
}

/// Driver surface for the laser altimeter.
pub trait AltimeterDriver: Send {
    fn altitude(&self) -> Option<f64>;
}

/// Blink patterns for the status LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    Idle,
    Recording,
    Error,
    Off,
}

/// Driver surface for the status LED.
pub trait StatusLed: Send {
    fn blink(&self, pattern: LedPattern);
}

/// Mock implementations used by tests and the CLI demo mode. None of this
/// talks to real hardware; `MockSpectrometerDriver` synthesizes a
/// deterministic Gaussian-ish peak so the autointegration algorithm has
/// something reproducible to converge on.
pub mod mock {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Synthetic spectrometer whose peak height scales with integration
    /// time up to a saturation ceiling, used to exercise acquisition and
    /// autointegration without real hardware.
    pub struct MockSpectrometerDriver {
        serial: String,
        pixels: usize,
        min_ms: u32,
        max_ms: u32,
        saturation: f64,
        /// Integration time (ms) at which the synthetic peak reaches
        /// saturation; `acquire` scales linearly toward that point.
        saturates_at_ms: f64,
        fail_next: AtomicBool,
    }

    impl MockSpectrometerDriver {
        pub fn new(serial: impl Into<String>, pixels: usize, min_ms: u32, max_ms: u32) -> Self {
            MockSpectrometerDriver {
                serial: serial.into(),
                pixels,
                min_ms,
                max_ms,
                saturation: 60000.0,
                saturates_at_ms: (max_ms as f64) * 0.6,
                fail_next: AtomicBool::new(false),
            }
        }

        /// Force the next `acquire` call to fail, to exercise the worker's
        /// hardware-transient retry path.
        pub fn fail_next_acquire(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    impl SpectrometerDriver for MockSpectrometerDriver {
        fn acquire(&self, integration_ms: u32) -> Result<RawSpectrum, DriverError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(DriverError("simulated hardware read failure".into()));
            }
            let fraction = (integration_ms as f64 / self.saturates_at_ms).min(1.2);
            let peak = self.saturation * fraction;
            let mut pixels = vec![50.0; self.pixels];
            let center = self.pixels / 2;
            let width = (self.pixels as f64 / 20.0).max(3.0);
            for (i, p) in pixels.iter_mut().enumerate() {
                let d = (i as f64 - center as f64) / width;
                *p += peak * (-0.5 * d * d).exp();
                if *p > self.saturation {
                    *p = self.saturation;
                }
            }
            Ok(RawSpectrum { pixels })
        }

        fn pixel_count(&self) -> usize {
            self.pixels
        }

        fn metadata(&self) -> SpectrometerMetadata {
            SpectrometerMetadata {
                serial_number: self.serial.clone(),
                wavelength_calibration_coefficients: vec![350.0, 0.38, 0.0, 0.0],
                saturation_level: self.saturation,
                nonlinearity_correction_coefficients: vec![1.0, 0.0, 0.0],
                optical_pixel_range: (2, (self.pixels as u32).saturating_sub(2)),
            }
        }

        fn min_integration_ms(&self) -> u32 {
            self.min_ms
        }

        fn max_integration_ms(&self) -> u32 {
            self.max_ms
        }
    }

    /// A shutter that just records its own open/closed state; real exclusion
    /// is enforced one layer up by `ShutterController`'s own mutex.
    pub struct MockShutterDriver {
        open: AtomicBool,
    }

    impl Default for MockShutterDriver {
        fn default() -> Self {
            MockShutterDriver {
                open: AtomicBool::new(false),
            }
        }
    }

    impl MockShutterDriver {
        pub fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    impl ShutterDriver for MockShutterDriver {
        fn open(&self) -> Result<(), DriverError> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) -> Result<(), DriverError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct MockGpsDriver {
        fix: Mutex<Option<GpsFix>>,
    }

    impl Default for MockGpsDriver {
        fn default() -> Self {
            MockGpsDriver {
                fix: Mutex::new(Some(GpsFix {
                    latitude: 55.9533,
                    longitude: -3.1883,
                })),
            }
        }
    }

    impl GpsDriver for MockGpsDriver {
        fn location(&self) -> Option<GpsFix> {
            *self.fix.lock().unwrap()
        }
    }

    #[derive(Default)]
    pub struct MockAltimeterDriver {
        altitude_m: AtomicU64,
    }

    impl MockAltimeterDriver {
        pub fn set_altitude(&self, meters: f64) {
            self.altitude_m.store(meters.to_bits(), Ordering::SeqCst);
        }
    }

    impl AltimeterDriver for MockAltimeterDriver {
        fn altitude(&self) -> Option<f64> {
            let bits = self.altitude_m.load(Ordering::SeqCst);
            if bits == 0 {
                Some(0.0)
            } else {
                Some(f64::from_bits(bits))
            }
        }
    }

    #[derive(Default)]
    pub struct MockStatusLed {
        last: Mutex<Option<LedPattern>>,
    }

    impl MockStatusLed {
        pub fn last_pattern(&self) -> Option<LedPattern> {
            *self.last.lock().unwrap()
        }
    }

    impl StatusLed for MockStatusLed {
        fn blink(&self, pattern: LedPattern) {
            *self.last.lock().unwrap() = Some(pattern);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn mock_spectrometer_peak_grows_with_integration_time() {
        let drv = MockSpectrometerDriver::new("SN1", 512, 10, 2000);
        let short = drv.acquire(10).unwrap();
        let long = drv.acquire(1000).unwrap();
        let peak = |s: &RawSpectrum| s.pixels.iter().cloned().fold(0.0, f64::max);
        assert!(peak(&long) > peak(&short));
    }

    #[test]
    fn mock_spectrometer_honors_fail_next() {
        let drv = MockSpectrometerDriver::new("SN1", 64, 10, 2000);
        drv.fail_next_acquire();
        assert!(drv.acquire(100).is_err());
        assert!(drv.acquire(100).is_ok());
    }
}
