//! Hardware seams: acquisition and arena devices
//!
//! The streaming engine talks to hardware through these two traits only, so
//! sessions run unchanged against a DAQ card, a simulator or the loopback
//! device used in tests.

use crate::error::{EcaError, Result};
use crate::types::{
    ArenaMode, ANALOG_IN_CHANNELS, ANALOG_OUT_CHANNELS, DIGITAL_IN_CHANNELS, DIGITAL_OUT_CHANNELS,
};

/// Synchronous write/read acquisition hardware.
///
/// One `acquire` call writes a block of output samples and returns the
/// input samples recorded over the same clock ticks, keeping output and
/// input aligned sample for sample.
pub trait AcquisitionDevice {
    /// Write one output block (row-major, 2 analog + 2 digital columns) and
    /// read back the matching input block (3 analog + 2 digital columns).
    fn acquire(&mut self, analog_out: &[f64], digital_out: &[u8]) -> Result<(Vec<f64>, Vec<u8>)>;

    /// Stop the hardware tasks; called once at session teardown.
    fn stop(&mut self);
}

/// The LED arena controller.
///
/// Brightness is set once per session; a pattern is pushed at every
/// segment start, before that segment's first output sample.
pub trait ArenaDevice {
    fn set_brightness(&mut self, percent: u8) -> Result<()>;
    fn send_pattern(&mut self, mode: ArenaMode, angular_size: f64) -> Result<()>;
}

/// Pure-software acquisition device that echoes its outputs back as inputs.
///
/// Channel mapping: analog in = (EXT I command, speaker drive, speaker
/// drive), digital in = digital out. Deterministic, so a full session
/// round-trips exactly and recorded trials can be compared against the
/// synthesized stimulus.
#[derive(Debug, Default)]
pub struct SoftwareLoopback;

impl AcquisitionDevice for SoftwareLoopback {
    fn acquire(&mut self, analog_out: &[f64], digital_out: &[u8]) -> Result<(Vec<f64>, Vec<u8>)> {
        if analog_out.len() % ANALOG_OUT_CHANNELS != 0
            || digital_out.len() % DIGITAL_OUT_CHANNELS != 0
            || analog_out.len() / ANALOG_OUT_CHANNELS != digital_out.len() / DIGITAL_OUT_CHANNELS
        {
            return Err(EcaError::Acquisition(format!(
                "Mismatched output block: {} analog / {} digital values",
                analog_out.len(),
                digital_out.len()
            )));
        }
        let rows = analog_out.len() / ANALOG_OUT_CHANNELS;
        let mut analog_in = Vec::with_capacity(rows * ANALOG_IN_CHANNELS);
        for row in analog_out.chunks_exact(ANALOG_OUT_CHANNELS) {
            analog_in.push(row[0]);
            analog_in.push(row[1]);
            analog_in.push(row[1]);
        }
        debug_assert_eq!(digital_out.len(), rows * DIGITAL_IN_CHANNELS);
        Ok((analog_in, digital_out.to_vec()))
    }

    fn stop(&mut self) {}
}

/// Arena stand-in that records every call, for tests and dry runs
#[derive(Debug, Default)]
pub struct RecordingArena {
    pub brightness: Option<u8>,
    pub patterns: Vec<(ArenaMode, f64)>,
}

impl ArenaDevice for RecordingArena {
    fn set_brightness(&mut self, percent: u8) -> Result<()> {
        self.brightness = Some(percent);
        Ok(())
    }

    fn send_pattern(&mut self, mode: ArenaMode, angular_size: f64) -> Result<()> {
        self.patterns.push((mode, angular_size));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_echoes_outputs() {
        let mut device = SoftwareLoopback;
        let analog_out = vec![0.1, 0.2, 0.3, 0.4];
        let digital_out = vec![1, 0, 0, 1];
        let (analog_in, digital_in) = device.acquire(&analog_out, &digital_out).unwrap();
        assert_eq!(analog_in, vec![0.1, 0.2, 0.2, 0.3, 0.4, 0.4]);
        assert_eq!(digital_in, digital_out);
    }

    #[test]
    fn test_loopback_rejects_ragged_blocks() {
        let mut device = SoftwareLoopback;
        assert!(device.acquire(&[0.0; 3], &[0; 2]).is_err());
        assert!(device.acquire(&[0.0; 4], &[0; 6]).is_err());
    }

    #[test]
    fn test_recording_arena_remembers_calls() {
        let mut arena = RecordingArena::default();
        arena.set_brightness(2).unwrap();
        arena.send_pattern(ArenaMode::Clockwise, 30.0).unwrap();
        assert_eq!(arena.brightness, Some(2));
        assert_eq!(arena.patterns, vec![(ArenaMode::Clockwise, 30.0)]);
    }
}
