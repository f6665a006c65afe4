//! Zero-phase Butterworth filtering
//!
//! Filters are built as cascaded biquad sections (plus one first-order
//! section for odd pole counts) and applied forward-backward, so the
//! composite response has no phase delay. Cutoffs are given in Hz against
//! the session sampling rate.

use crate::error::{EcaError, Result};

/// Filter pass band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Lowpass,
    Highpass,
    /// Band-pass as a high-pass/low-pass cascade over (low_hz, high_hz)
    Bandpass,
}

/// One direct-form-I section, normalized so a0 = 1
#[derive(Debug, Clone, Copy)]
struct Section {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Section {
    fn apply(&self, signal: &mut [f64]) {
        let (mut x1, mut x2, mut y1, mut y2) = (0.0, 0.0, 0.0, 0.0);
        for value in signal.iter_mut() {
            let x0 = *value;
            let y0 = self.b0 * x0 + self.b1 * x1 + self.b2 * x2 - self.a1 * y1 - self.a2 * y2;
            x2 = x1;
            x1 = x0;
            y2 = y1;
            y1 = y0;
            *value = y0;
        }
    }
}

/// Butterworth pole-pair quality factors for an order-n cascade
fn butterworth_qs(poles: usize) -> Vec<f64> {
    let pairs = poles / 2;
    (0..pairs)
        .map(|k| {
            let theta = std::f64::consts::PI * (2.0 * k as f64 + 1.0) / (2.0 * poles as f64);
            1.0 / (2.0 * theta.sin())
        })
        .collect()
}

/// Pre-warped analog cutoff for the bilinear transform
fn warp(normalized: f64) -> f64 {
    (std::f64::consts::PI * normalized / 2.0).tan()
}

fn biquad(normalized: f64, q: f64, highpass: bool) -> Section {
    // RBJ cookbook with Butterworth Q per section
    let w0 = std::f64::consts::PI * normalized;
    let cos_w0 = w0.cos();
    let alpha = w0.sin() / (2.0 * q);
    let a0 = 1.0 + alpha;
    let (b0, b1, b2) = if highpass {
        let b = (1.0 + cos_w0) / 2.0;
        (b, -(1.0 + cos_w0), b)
    } else {
        let b = (1.0 - cos_w0) / 2.0;
        (b, 1.0 - cos_w0, b)
    };
    Section {
        b0: b0 / a0,
        b1: b1 / a0,
        b2: b2 / a0,
        a1: -2.0 * cos_w0 / a0,
        a2: (1.0 - alpha) / a0,
    }
}

fn first_order(normalized: f64, highpass: bool) -> Section {
    let wa = warp(normalized);
    let a0 = wa + 1.0;
    if highpass {
        Section {
            b0: 1.0 / a0,
            b1: -1.0 / a0,
            b2: 0.0,
            a1: (wa - 1.0) / a0,
            a2: 0.0,
        }
    } else {
        Section {
            b0: wa / a0,
            b1: wa / a0,
            b2: 0.0,
            a1: (wa - 1.0) / a0,
            a2: 0.0,
        }
    }
}

fn design(poles: usize, normalized: f64, highpass: bool) -> Result<Vec<Section>> {
    if poles == 0 {
        return Err(EcaError::Configuration(
            "Filter needs at least one pole".to_string(),
        ));
    }
    if !(normalized > 0.0 && normalized < 1.0) {
        return Err(EcaError::Configuration(format!(
            "Normalized cutoff {} outside (0, 1)",
            normalized
        )));
    }
    let mut sections: Vec<Section> = butterworth_qs(poles)
        .into_iter()
        .map(|q| biquad(normalized, q, highpass))
        .collect();
    if poles % 2 == 1 {
        sections.push(first_order(normalized, highpass));
    }
    Ok(sections)
}

fn run_cascade(sections: &[Section], signal: &mut [f64]) {
    for section in sections {
        section.apply(signal);
    }
}

/// Forward-backward filter, with odd-reflection edge padding to suppress
/// start-up transients (same scheme scipy's filtfilt defaults to).
fn filtfilt(sections: &[Section], signal: &[f64]) -> Vec<f64> {
    if signal.is_empty() {
        return Vec::new();
    }
    let pad = (3 * 2 * sections.len()).min(signal.len().saturating_sub(1));
    let n = signal.len();
    let mut extended = Vec::with_capacity(n + 2 * pad);
    let first = signal[0];
    let last = signal[n - 1];
    for i in (1..=pad).rev() {
        extended.push(2.0 * first - signal[i]);
    }
    extended.extend_from_slice(signal);
    for i in 1..=pad {
        extended.push(2.0 * last - signal[n - 1 - i]);
    }

    run_cascade(sections, &mut extended);
    extended.reverse();
    run_cascade(sections, &mut extended);
    extended.reverse();

    extended[pad..pad + n].to_vec()
}

/// Zero-phase Butterworth filter over a 1-D signal.
///
/// # Arguments
/// * `signal` - full-length input trace
/// * `cutoff_hz` - corner frequency; for `Pass::Bandpass` the low corner
/// * `high_hz` - high corner, only read for `Pass::Bandpass`
/// * `pass` - low/high/band selection
/// * `poles` - Butterworth order of each constituent filter
/// * `sampling_rate` - sample clock in Hz
pub fn filter(
    signal: &[f64],
    cutoff_hz: f64,
    high_hz: Option<f64>,
    pass: Pass,
    poles: usize,
    sampling_rate: u32,
) -> Result<Vec<f64>> {
    let nyquist = 0.5 * sampling_rate as f64;
    match pass {
        Pass::Lowpass => {
            let sections = design(poles, cutoff_hz / nyquist, false)?;
            Ok(filtfilt(&sections, signal))
        }
        Pass::Highpass => {
            let sections = design(poles, cutoff_hz / nyquist, true)?;
            Ok(filtfilt(&sections, signal))
        }
        Pass::Bandpass => {
            let high = high_hz.ok_or_else(|| {
                EcaError::Configuration("Bandpass filter needs a high corner".to_string())
            })?;
            let hp = design(poles, cutoff_hz / nyquist, true)?;
            let lp = design(poles, high / nyquist, false)?;
            Ok(filtfilt(&lp, &filtfilt(&hp, signal)))
        }
    }
}

/// Convenience low-pass used by movement traces and noise synthesis
pub fn lowpass(signal: &[f64], cutoff_hz: f64, poles: usize, sampling_rate: u32) -> Result<Vec<f64>> {
    filter(signal, cutoff_hz, None, Pass::Lowpass, poles, sampling_rate)
}

/// Convenience high-pass used for membrane potential detrending
pub fn highpass(signal: &[f64], cutoff_hz: f64, poles: usize, sampling_rate: u32) -> Result<Vec<f64>> {
    filter(signal, cutoff_hz, None, Pass::Highpass, poles, sampling_rate)
}
