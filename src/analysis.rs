//! Offline signal analysis
//!
//! Spike detection, population aggregation and the movement-trace
//! transforms applied to raw trial recordings. Everything here is pure:
//! the memoizing layer in [`crate::processing`] decides when these run.

use crate::error::{EcaError, Result};
use crate::filter;

/// Sentinel padding value in raster matrices
pub const RASTER_PAD: f64 = -1.0;

/// Samples walked back from a threshold crossing to find spike onset
const SPIKE_BACKTRACK: usize = 10;

/// Baseline window subtracted from movement traces, in samples
pub const MOVEMENT_BASELINE_SAMPLES: usize = 5_000;

fn mean(signal: &[f64]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    signal.iter().sum::<f64>() / signal.len() as f64
}

fn std_dev(signal: &[f64]) -> f64 {
    let m = mean(signal);
    (signal.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / signal.len() as f64).sqrt()
}

/// Detect spikes in a (filtered) membrane potential trace.
///
/// Threshold sits midway between the signal peak and (mean + 1 std-dev).
/// Each rising-edge crossing is walked back up to ten samples to the last
/// sample at or below the noise floor (one std-dev), so the reported
/// position is the spike onset rather than the crossing. Returns ascending
/// sample indices; empty when nothing crosses.
pub fn spike_positions(signal: &[f64]) -> Vec<usize> {
    if signal.is_empty() {
        return Vec::new();
    }
    let noise_level = std_dev(signal);
    let peak = signal.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let threshold = (peak + mean(signal) + noise_level) / 2.0;

    let mut positions = Vec::new();
    for i in 1..signal.len() {
        if signal[i] > threshold && signal[i - 1] <= threshold {
            let start = i.saturating_sub(SPIKE_BACKTRACK);
            let window = &signal[start..i];
            let onset = window
                .iter()
                .rposition(|&v| v <= noise_level)
                .unwrap_or(window.len().saturating_sub(1));
            positions.push(start + onset);
        }
    }
    positions.dedup();
    positions
}

/// Stack per-trial spike lists into a rectangular raster, padding short
/// rows with [`RASTER_PAD`].
pub fn raster_matrix(spike_lists: &[Vec<usize>]) -> Vec<Vec<f64>> {
    let width = spike_lists.iter().map(Vec::len).max().unwrap_or(0);
    spike_lists
        .iter()
        .map(|list| {
            let mut row: Vec<f64> = list.iter().map(|&p| p as f64).collect();
            row.resize(width, RASTER_PAD);
            row
        })
        .collect()
}

/// Spike-count histogram over sample positions, across all trials.
///
/// Spikes past `length` are ignored rather than panicking; the compiled
/// timeline guarantees they cannot occur for well-formed trials.
pub fn pre_rate_histogram(spike_lists: &[Vec<usize>], length: usize) -> Vec<f64> {
    let mut histogram = vec![0.0; length];
    for list in spike_lists {
        for &position in list {
            if position < length {
                histogram[position] += 1.0;
            }
        }
    }
    histogram
}

/// Gaussian-smoothed firing-rate estimate from a pre-rate histogram.
///
/// Kernel is truncated at four sigma and the signal is reflected at both
/// edges. Computed on demand for the requested sigma; never cached.
pub fn rate_estimate(pre_rate: &[f64], sigma: f64) -> Vec<f64> {
    let n = pre_rate.len();
    if n == 0 || sigma <= 0.0 {
        return pre_rate.to_vec();
    }
    let radius = (4.0 * sigma + 0.5) as usize;
    let mut kernel: Vec<f64> = (0..=radius)
        .map(|i| (-0.5 * (i as f64 / sigma).powi(2)).exp())
        .collect();
    let norm = kernel[0] + 2.0 * kernel[1..].iter().sum::<f64>();
    for k in kernel.iter_mut() {
        *k /= norm;
    }

    let reflect = |idx: i64| -> usize {
        let len = n as i64;
        let mut i = idx;
        if i < 0 {
            i = -i - 1;
        }
        if i >= len {
            i = 2 * len - i - 1;
        }
        i.clamp(0, len - 1) as usize
    };

    (0..n as i64)
        .map(|center| {
            let mut acc = kernel[0] * pre_rate[center as usize];
            for (offset, &k) in kernel.iter().enumerate().skip(1) {
                acc += k * pre_rate[reflect(center - offset as i64)];
                acc += k * pre_rate[reflect(center + offset as i64)];
            }
            acc
        })
        .collect()
}

/// Hall-effect sensor voltage to antennal displacement, closed-form
/// calibration curve of the sensor geometry.
pub fn sensor_to_displacement(volts: f64) -> f64 {
    (211.8 / (volts - 1.506)).cbrt() - 2.075
}

/// Raw hall-sensor trace to a baseline-corrected movement trace:
/// displacement transform, 500 Hz low-pass, minus the mean of the initial
/// baseline window. At sampling rates where 500 Hz meets Nyquist the
/// cutoff drops to 0.4x the rate, as the chirp correction does.
pub fn movement_trace(hall_sensor: &[f64], sampling_rate: u32) -> Result<Vec<f64>> {
    let displacement: Vec<f64> = hall_sensor.iter().map(|&v| sensor_to_displacement(v)).collect();
    let cutoff = 500.0_f64.min(0.4 * sampling_rate as f64);
    let mut filtered = filter::lowpass(&displacement, cutoff, 10, sampling_rate)?;
    let baseline_window = MOVEMENT_BASELINE_SAMPLES.min(filtered.len());
    let baseline = mean(&filtered[..baseline_window]);
    for sample in filtered.iter_mut() {
        *sample -= baseline;
    }
    Ok(filtered)
}

/// Raw membrane potential to the detrended trace spikes are detected on:
/// 50 Hz high-pass, re-zeroed on the first sample.
pub fn membrane_potential_trace(raw: &[f64], sampling_rate: u32) -> Result<Vec<f64>> {
    let mut filtered = filter::highpass(raw, 50.0, 3, sampling_rate)?;
    if let Some(&first) = filtered.first() {
        for sample in filtered.iter_mut() {
            *sample -= first;
        }
    }
    Ok(filtered)
}

/// Per-sample amplitude-correction curve for a mechanical chirp, derived
/// from the mean movement trace of a matching calibration recording.
///
/// The trace is reduced to per-cycle response amplitudes against the cycle
/// frequency, smoothed, interpolated back onto the chirp's linear frequency
/// ramp and inverted; the curve is normalized so the first sample's
/// correction is 1.
///
/// # Arguments
/// * `mean_movement` - calibration protocol's mean movement trace
/// * `pre_s`, `duration_s` - chirp pre-delay and stimulus duration
/// * `frequency_0`, `frequency_1` - chirp sweep endpoints
/// * `sampling_rate` - sample clock in Hz
pub fn chirp_correction_curve(
    mean_movement: &[f64],
    pre_s: f64,
    duration_s: f64,
    frequency_0: f64,
    frequency_1: f64,
    sampling_rate: u32,
) -> Result<Vec<f64>> {
    let n = (duration_s * sampling_rate as f64).round() as usize;

    let reversed = frequency_0 > frequency_1;
    let (f_low, f_high) = if reversed {
        (frequency_1, frequency_0)
    } else {
        (frequency_0, frequency_1)
    };

    let mut trace: Vec<f64> = mean_movement.to_vec();
    if reversed {
        trace.reverse();
    }
    if let Some(&first) = trace.first() {
        for sample in trace.iter_mut() {
            *sample -= first;
        }
    }

    let start = (pre_s * sampling_rate as f64).round() as usize;
    let end = start + n;
    if end > trace.len() {
        return Err(EcaError::Configuration(format!(
            "Calibration trace of {} samples shorter than chirp window {}..{}",
            trace.len(),
            start,
            end
        )));
    }
    let window = &trace[start..end];
    let smoothed = filter::lowpass(window, (f_high * 4.0).min(0.4 * sampling_rate as f64), 10, sampling_rate)?;

    // cycle boundaries of the ideal (low-to-high) reference chirp
    let reference = crate::waveform::chirp(duration_s, f_low, f_high, 1.0, None, sampling_rate);
    let mut crossings: Vec<usize> = Vec::new();
    for i in 1..reference.len() {
        if (reference[i] > 0.0) != (reference[i - 1] > 0.0) {
            crossings.push(i);
        }
    }
    let cycle_ends: Vec<usize> = crossings.iter().copied().step_by(2).collect();
    if cycle_ends.len() < 3 {
        return Err(EcaError::Configuration(
            "Calibration chirp has too few cycles for a correction curve".to_string(),
        ));
    }

    // per-cycle peak-to-peak amplitude against cycle frequency
    let mut freqs: Vec<f64> = Vec::new();
    let mut amps: Vec<f64> = Vec::new();
    let mut previous = cycle_ends[0];
    for &current in &cycle_ends[1..] {
        let wave = &smoothed[previous..current];
        let high = wave.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let low = wave.iter().copied().fold(f64::INFINITY, f64::min);
        freqs.push(sampling_rate as f64 / (current - previous) as f64);
        amps.push((high - low) / 2.0);
        previous = current;
    }

    // interpolate onto the linear frequency ramp of the chirp
    let ramp: Vec<f64> = (0..n)
        .map(|i| f_low + (f_high - f_low) * i as f64 / n as f64)
        .collect();
    let per_sample = interp(&ramp, &freqs, &amps);

    let mut correction: Vec<f64> = per_sample
        .iter()
        .map(|&a| if a.abs() > f64::EPSILON { 1.0 / a } else { 1.0 })
        .collect();
    let first = correction[0];
    if first.abs() > f64::EPSILON {
        for c in correction.iter_mut() {
            *c /= first;
        }
    }
    if reversed {
        correction.reverse();
    }
    Ok(correction)
}

/// Piecewise-linear interpolation of `xs` onto sorted sample points
/// `(points, values)`, clamped at both ends.
fn interp(xs: &[f64], points: &[f64], values: &[f64]) -> Vec<f64> {
    debug_assert_eq!(points.len(), values.len());
    xs.iter()
        .map(|&x| {
            if points.is_empty() {
                return 0.0;
            }
            if x <= points[0] {
                return values[0];
            }
            if x >= points[points.len() - 1] {
                return values[values.len() - 1];
            }
            let j = points.partition_point(|&p| p < x);
            let (x0, x1) = (points[j - 1], points[j]);
            let (y0, y1) = (values[j - 1], values[j]);
            y0 + (y1 - y0) * (x - x0) / (x1 - x0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat ±amplitude dither: max == mean + std, so nothing strictly
    /// crosses the detection threshold.
    fn dither(n: usize, amplitude: f64) -> Vec<f64> {
        (0..n)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn test_single_pulse_detected_at_onset() {
        let mut signal = dither(1_000, 0.1);
        for sample in signal.iter_mut().skip(500).take(80) {
            *sample = 5.0;
        }
        let spikes = spike_positions(&signal);
        assert_eq!(spikes.len(), 1);
        // onset refined into the 10-sample backtrack window before the crossing
        assert!(spikes[0] >= 490 && spikes[0] < 500, "spike at {}", spikes[0]);
    }

    #[test]
    fn test_sub_threshold_noise_yields_nothing() {
        assert!(spike_positions(&dither(2_000, 0.3)).is_empty());
        assert!(spike_positions(&[]).is_empty());
    }

    #[test]
    fn test_two_pulses_two_ascending_spikes() {
        let mut signal = dither(2_000, 0.1);
        for sample in signal.iter_mut().skip(400).take(50) {
            *sample = 4.0;
        }
        for sample in signal.iter_mut().skip(1_200).take(50) {
            *sample = 4.0;
        }
        let spikes = spike_positions(&signal);
        assert_eq!(spikes.len(), 2);
        assert!(spikes[0] < spikes[1]);
    }

    #[test]
    fn test_raster_padding() {
        let raster = raster_matrix(&[vec![3, 9], vec![5], vec![]]);
        assert_eq!(raster.len(), 3);
        assert_eq!(raster[0], vec![3.0, 9.0]);
        assert_eq!(raster[1], vec![5.0, RASTER_PAD]);
        assert_eq!(raster[2], vec![RASTER_PAD, RASTER_PAD]);
    }

    #[test]
    fn test_pre_rate_histogram_counts() {
        let histogram = pre_rate_histogram(&[vec![2, 5], vec![2, 99]], 10);
        assert_eq!(histogram[2], 2.0);
        assert_eq!(histogram[5], 1.0);
        assert_eq!(histogram.iter().sum::<f64>(), 3.0);
    }

    #[test]
    fn test_rate_estimate_preserves_mass_and_spreads() {
        let mut pre = vec![0.0; 200];
        pre[100] = 10.0;
        let rate = rate_estimate(&pre, 5.0);
        assert_eq!(rate.len(), 200);
        assert!((rate.iter().sum::<f64>() - 10.0).abs() < 1e-6);
        assert!(rate[100] < 10.0);
        assert!(rate[95] > 0.0);
    }

    #[test]
    fn test_rate_estimate_sigma_dependence() {
        let mut pre = vec![0.0; 100];
        pre[50] = 1.0;
        let narrow = rate_estimate(&pre, 1.0);
        let wide = rate_estimate(&pre, 8.0);
        assert!(narrow[50] > wide[50]);
    }

    #[test]
    fn test_sensor_transform_monotonic() {
        // larger voltage -> smaller cube root argument -> smaller displacement
        assert!(sensor_to_displacement(3.0) > sensor_to_displacement(4.0));
        let d = sensor_to_displacement(211.8 + 1.506);
        assert!((d - (1.0 - 2.075)).abs() < 1e-12);
    }

    #[test]
    fn test_movement_trace_baseline_is_zeroed() {
        let rate = 10_000;
        let hall: Vec<f64> = vec![4.0; 8_000];
        let trace = movement_trace(&hall, rate).unwrap();
        let baseline = trace[..5_000].iter().sum::<f64>() / 5_000.0;
        assert!(baseline.abs() < 1e-9);
    }

    #[test]
    fn test_movement_trace_below_nyquist_rates() {
        // 500 Hz equals Nyquist at 1 kHz; the capped cutoff must keep the
        // transform usable at low sampling rates
        for rate in [500, 1_000, 2_000] {
            let hall: Vec<f64> = vec![4.0; 2_000];
            let trace = movement_trace(&hall, rate).unwrap();
            assert_eq!(trace.len(), 2_000);
            assert!(trace.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_chirp_correction_flat_response_is_unity() {
        let rate = 1_000;
        // calibration response with constant amplitude across frequency:
        // the correction curve should stay near 1 everywhere
        let pre = 0.5;
        let dur = 4.0;
        let mean_movement: Vec<f64> = {
            let mut trace = vec![0.0; (pre * rate as f64) as usize];
            trace.extend(crate::waveform::chirp(dur, 2.0, 40.0, 1.0, None, rate));
            trace.extend(vec![0.0; 500]);
            trace
        };
        let correction =
            chirp_correction_curve(&mean_movement, pre, dur, 2.0, 40.0, rate).unwrap();
        assert_eq!(correction.len(), 4_000);
        assert!((correction[0] - 1.0).abs() < 1e-12);
        let worst = correction
            .iter()
            .fold(0.0f64, |acc, &c| acc.max((c - 1.0).abs()));
        assert!(worst < 0.35, "worst deviation {}", worst);
    }

    #[test]
    fn test_interp_clamps_and_interpolates() {
        let out = interp(&[0.0, 1.5, 5.0], &[1.0, 2.0], &[10.0, 20.0]);
        assert_eq!(out, vec![10.0, 15.0, 20.0]);
    }
}
