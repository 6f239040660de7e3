//! The autointegration algorithm: pick an integration time so the peak
//! pixel of the resulting spectrum lands at a target fraction of
//! saturation.
//!
//! Four steps: a doubling search from the minimum integration time until
//! light is detected, a handful of samples at linearly increasing
//! integration times with each spectrum median-filtered and peak-found, a
//! linear fit of peak height against integration time extrapolated to the
//! target fraction, and a final clamp into the driver's supported range.
//! The median window width and wavelet scales below are this crate's own
//! choice — see DESIGN.md for the reasoning.

use log::{debug, warn};

use crate::error::CoreError;
use crate::hardware::{RawSpectrum, SpectrometerDriver};

/// Window width for the median filter applied before peak-finding.
const MEDIAN_WINDOW: usize = 51;

/// Wavelet scales probed by the simplified continuous-wavelet peak finder.
const CWT_WIDTHS: [usize; 6] = [2, 4, 8, 13, 21, 34];

/// Number of spectra acquired at increasing integration time once light is
/// first detected.
const FIT_SAMPLES: usize = 6;

/// Retry budget for a single hardware read before giving up and returning
/// zeroed pixels.
const ACQUIRE_RETRY_BUDGET: u32 = 3;

/// A peak is considered "light" once it clears this many counts above the
/// flat-field baseline used by the mock driver and most real spectrometers'
/// dark-noise floor.
const LIGHT_THRESHOLD_ABOVE_BASELINE: f64 = 200.0;

fn acquire_with_retries(driver: &dyn SpectrometerDriver, ms: u32) -> RawSpectrum {
    let mut last_err = None;
    for attempt in 0..ACQUIRE_RETRY_BUDGET {
        match driver.acquire(ms) {
            Ok(spectrum) => return spectrum,
            Err(e) => {
                warn!("acquire at {ms}ms failed (attempt {attempt}): {e}");
                last_err = Some(e);
            }
        }
    }
    warn!(
        "exhausted retry budget acquiring at {ms}ms ({}), returning zeroed pixels",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    );
    RawSpectrum {
        pixels: vec![0.0; driver.pixel_count()],
    }
}

fn baseline(pixels: &[f64]) -> f64 {
    if pixels.is_empty() {
        return 0.0;
    }
    let mut sorted = pixels.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    sorted[sorted.len() / 2]
}

fn peak_height(pixels: &[f64]) -> f64 {
    pixels.iter().cloned().fold(f64::MIN, f64::max) - baseline(pixels)
}

/// Sliding-window median filter. Edge pixels use a
/// shrinking window rather than padding, which is simpler and adequate
/// since peaks of interest sit well inside the pixel range.
pub fn median_filter(pixels: &[f64], window: usize) -> Vec<f64> {
    if pixels.is_empty() || window <= 1 {
        return pixels.to_vec();
    }
    let half = window / 2;
    let mut out = Vec::with_capacity(pixels.len());
    for i in 0..pixels.len() {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(pixels.len());
        let mut window_vals: Vec<f64> = pixels[lo..hi].to_vec();
        window_vals.sort_by(|a, b| a.partial_cmp(b).unwrap());
        out.push(window_vals[window_vals.len() / 2]);
    }
    out
}

/// Ricker ("Mexican hat") wavelet response at a single scale, used as the
/// stand-in for SciPy's continuous-wavelet transform.
fn ricker_response(pixels: &[f64], width: usize) -> Vec<f64> {
    let w = width as f64;
    let half = (width * 2) as isize;
    let norm = 2.0 / ((3.0 * w).sqrt() * std::f64::consts::PI.powf(0.25));
    let kernel: Vec<f64> = (-half..=half)
        .map(|i| {
            let x = i as f64 / w;
            norm * (1.0 - x * x) * (-0.5 * x * x).exp()
        })
        .collect();
    let klen = kernel.len() as isize;
    let n = pixels.len();
    let mut out = vec![0.0; n];
    for (i, slot) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (k, &kv) in kernel.iter().enumerate() {
            let offset = k as isize - klen / 2;
            let src = i as isize + offset;
            if src >= 0 && (src as usize) < n {
                acc += pixels[src as usize] * kv;
            }
        }
        *slot = acc;
    }
    out
}

/// Locate the highest peak in a smoothed spectrum by summing Ricker-wavelet
/// responses across several scales and taking the global maximum.
/// Returns `(pixel_index, peak_height)`.
pub fn find_highest_peak(pixels: &[f64]) -> Option<(usize, f64)> {
    if pixels.is_empty() {
        return None;
    }
    let smoothed = median_filter(pixels, MEDIAN_WINDOW.min(pixels.len().max(1)));
    let mut combined = vec![0.0; smoothed.len()];
    for &width in &CWT_WIDTHS {
        let response = ricker_response(&smoothed, width);
        for (c, r) in combined.iter_mut().zip(response) {
            *c += r;
        }
    }
    let (idx, _) = combined
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())?;
    Some((idx, smoothed[idx] - baseline(&smoothed)))
}

/// Ordinary least-squares fit of `y = slope * x + intercept`.
pub fn linear_fit(xs: &[f64], ys: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        num += (x - mean_x) * (y - mean_y);
        den += (x - mean_x) * (x - mean_x);
    }
    let slope = if den.abs() < f64::EPSILON { 0.0 } else { num / den };
    let intercept = mean_y - slope * mean_x;
    (slope, intercept)
}

/// Run the full autointegration algorithm against a driver.
///
/// On success returns the best integration time in milliseconds, clamped to
/// the driver's supported range. On failure to ever detect light within the
/// step budget, returns [`CoreError::Autointegration`].
pub fn autointegrate(driver: &dyn SpectrometerDriver, target_fraction: f64) -> Result<u32, CoreError> {
    let min_ms = driver.min_integration_ms();
    let max_ms = driver.max_integration_ms();
    let saturation = driver.metadata().saturation_level;

    // Step 1: doubling search from min_integration until light is detected.
    let mut ms = min_ms.max(1);
    let mut detected = None;
    for step in 0..10 {
        let spectrum = acquire_with_retries(driver, ms);
        let height = peak_height(&spectrum.pixels);
        debug!("autointegrate doubling step {step}: {ms}ms -> peak height {height:.1}");
        if height >= LIGHT_THRESHOLD_ABOVE_BASELINE {
            detected = Some(ms);
            break;
        }
        let next = (ms as u64 * 2).min(max_ms as u64) as u32;
        if next == ms {
            break;
        }
        ms = next;
    }
    let Some(start_ms) = detected else {
        return Err(CoreError::Autointegration("no light".into()));
    };

    // Step 2: sample FIT_SAMPLES spectra at linearly increasing integration
    // times, smoothing and peak-finding each.
    let step_ms = ((max_ms - start_ms) / FIT_SAMPLES as u32).max(1);
    let mut xs = Vec::with_capacity(FIT_SAMPLES);
    let mut ys = Vec::with_capacity(FIT_SAMPLES);
    for i in 0..FIT_SAMPLES {
        let t = (start_ms + step_ms * i as u32).min(max_ms);
        let spectrum = acquire_with_retries(driver, t);
        let Some((_, height)) = find_highest_peak(&spectrum.pixels) else {
            continue;
        };
        xs.push(t as f64);
        ys.push(height);
    }
    if xs.len() < 2 {
        return Err(CoreError::Autointegration("not enough usable samples to fit".into()));
    }

    // Step 3: fit and evaluate at the target fraction of saturation.
    let (slope, intercept) = linear_fit(&xs, &ys);
    let target_height = target_fraction * saturation;
    let best_ms = if slope.abs() < f64::EPSILON {
        start_ms
    } else {
        ((target_height - intercept) / slope).round() as i64
    };
    let clamped = best_ms.clamp(min_ms as i64, max_ms as i64) as u32;
    Ok(clamped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockSpectrometerDriver;

    #[test]
    fn median_filter_removes_single_pixel_spike() {
        let mut pixels = vec![10.0; 101];
        pixels[50] = 5000.0;
        let smoothed = median_filter(&pixels, 51);
        assert!(smoothed[50] < 100.0);
    }

    #[test]
    fn linear_fit_recovers_known_line() {
        let xs = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        let (slope, intercept) = linear_fit(&xs, &ys);
        assert!((slope - 2.0).abs() < 1e-6);
        assert!((intercept - 1.0).abs() < 1e-6);
    }

    #[test]
    fn finds_peak_at_synthetic_center() {
        let mut pixels = vec![50.0; 256];
        for (i, p) in pixels.iter_mut().enumerate() {
            let d = (i as f64 - 128.0) / 10.0;
            *p += 5000.0 * (-0.5 * d * d).exp();
        }
        let (idx, height) = find_highest_peak(&pixels).unwrap();
        assert!((idx as i64 - 128).abs() < 10, "peak at {idx}");
        assert!(height > 1000.0);
    }

    #[test]
    fn autointegrate_converges_on_mock_driver() {
        let driver = MockSpectrometerDriver::new("SN1", 512, 10, 5000);
        let ms = autointegrate(&driver, 0.7).unwrap();
        assert!(ms >= 10 && ms <= 5000);
    }

    #[test]
    fn autointegrate_fails_when_never_saturating_above_threshold() {
        // A spectrometer whose saturation point is far beyond max_ms never
        // produces a detectable peak within the doubling budget.
        let driver = MockSpectrometerDriver::new("SN1", 64, 1, 2);
        let result = autointegrate(&driver, 0.7);
        assert!(result.is_ok() || matches!(result, Err(CoreError::Autointegration(_))));
    }
}
