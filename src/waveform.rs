//! Stimulus waveform synthesis
//!
//! Pure sample-array builders the protocol generators are assembled from.
//! Durations are in seconds against the session sample clock; analog
//! waveforms are f64, digital waveforms are 0/1 bytes.

use rand::Rng;

use crate::error::Result;
use crate::filter;

fn sample_count(duration_s: f64, sampling_rate: u32) -> usize {
    (duration_s * sampling_rate as f64).round() as usize
}

/// Unipolar square wave (values 0/1) at `frequency` Hz
pub fn square_wave(duration_s: f64, frequency: f64, duty_cycle: f64, sampling_rate: u32) -> Vec<f64> {
    let n = sample_count(duration_s, sampling_rate);
    let dt = 1.0 / sampling_rate as f64;
    (0..n)
        .map(|i| {
            let phase = (frequency * i as f64 * dt).rem_euclid(1.0);
            if phase < duty_cycle {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Unit-amplitude sine at `frequency` Hz
pub fn sine_wave(duration_s: f64, frequency: f64, sampling_rate: u32) -> Vec<f64> {
    let n = sample_count(duration_s, sampling_rate);
    let dt = 1.0 / sampling_rate as f64;
    (0..n)
        .map(|i| {
            let t = i as f64 * dt;
            (2.0 * std::f64::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Linear chirp from `frequency_0` to `frequency_1` Hz, scaled by
/// `amplitude`.
///
/// `correction` is an optional per-sample amplitude curve (from a recorded
/// calibration protocol, see [`crate::analysis::chirp_correction_curve`])
/// multiplied in before scaling; it is truncated/ignored past its length.
pub fn chirp(
    duration_s: f64,
    frequency_0: f64,
    frequency_1: f64,
    amplitude: f64,
    correction: Option<&[f64]>,
    sampling_rate: u32,
) -> Vec<f64> {
    let n = sample_count(duration_s, sampling_rate);
    let dt = 1.0 / sampling_rate as f64;
    let k = (frequency_1 - frequency_0) / duration_s;
    let mut wave: Vec<f64> = (0..n)
        .map(|i| {
            let t = i as f64 * dt;
            (2.0 * std::f64::consts::PI * (frequency_0 * t + (k / 2.0) * t * t)).sin()
        })
        .collect();
    if let Some(curve) = correction {
        for (sample, c) in wave.iter_mut().zip(curve.iter()) {
            *sample *= c;
        }
    }
    for sample in wave.iter_mut() {
        *sample *= amplitude;
    }
    wave
}

/// Band-limited white noise, low-passed at `frequency_0` Hz.
///
/// Synthesizes three durations of zero-mean uniform noise, filters the whole
/// stretch and keeps the middle third, so the returned window carries no
/// filter edge transients.
pub fn band_limited_noise<R: Rng>(
    duration_s: f64,
    frequency_0: f64,
    amplitude: f64,
    sampling_rate: u32,
    rng: &mut R,
) -> Result<Vec<f64>> {
    let n = sample_count(duration_s, sampling_rate);
    let total = 3 * n;
    let mut white: Vec<f64> = (0..total).map(|_| rng.random::<f64>()).collect();
    let mean = white.iter().sum::<f64>() / total as f64;
    for sample in white.iter_mut() {
        *sample = 2.0 * amplitude * (*sample - mean);
    }
    let filtered = filter::lowpass(&white, frequency_0, 10, sampling_rate)?;
    Ok(filtered[n..2 * n].to_vec())
}

/// Threshold an analog waveform into a 0/1 digital line
pub fn to_digital(wave: &[f64]) -> Vec<u8> {
    wave.iter().map(|&v| u8::from(v > 0.0)).collect()
}
