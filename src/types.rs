use serde::{Deserialize, Serialize};

use crate::error::{EcaError, Result};

/// Number of arena motion modes
pub const ARENA_MODE_COUNT: usize = 6;

/// Analog output channels per sample (EXT I command, speaker drive)
pub const ANALOG_OUT_CHANNELS: usize = 2;

/// Digital output channels per sample (amplifier gate, arena advance line)
pub const DIGITAL_OUT_CHANNELS: usize = 2;

/// Analog input channels per sample (membrane potential, current monitor,
/// hall-effect sensor)
pub const ANALOG_IN_CHANNELS: usize = 3;

/// Digital input channels per sample (gate loopback, STCP)
pub const DIGITAL_IN_CHANNELS: usize = 2;

/// One output sample across both analog channels
pub type AnalogOutSample = [f64; ANALOG_OUT_CHANNELS];
/// One output sample across both digital lines
pub type DigitalOutSample = [u8; DIGITAL_OUT_CHANNELS];
/// One acquired analog sample
pub type AnalogInSample = [f64; ANALOG_IN_CHANNELS];
/// One acquired digital sample
pub type DigitalInSample = [u8; DIGITAL_IN_CHANNELS];

/// LED arena motion pattern
///
/// Closed set of the six patterns the arena firmware implements. The numeric
/// codes are part of the stimulus grammar (`vis`/`msv`/`mcv` mode parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArenaMode {
    Forward,
    Backward,
    Clockwise,
    Counterclockwise,
    SpotClockwise,
    SpotCounterclockwise,
}

impl ArenaMode {
    /// Convert a grammar mode code to an arena mode.
    ///
    /// Fails with a configuration error on out-of-range codes, matching the
    /// closed firmware pattern set.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Forward),
            1 => Ok(Self::Backward),
            2 => Ok(Self::Clockwise),
            3 => Ok(Self::Counterclockwise),
            4 => Ok(Self::SpotClockwise),
            5 => Ok(Self::SpotCounterclockwise),
            _ => Err(EcaError::Configuration(format!(
                "Arena mode not implemented - mode: {}",
                code
            ))),
        }
    }

    /// Firmware pattern code (position in the arena mode list)
    pub fn code(&self) -> u8 {
        match self {
            Self::Forward => 0,
            Self::Backward => 1,
            Self::Clockwise => 2,
            Self::Counterclockwise => 3,
            Self::SpotClockwise => 4,
            Self::SpotCounterclockwise => 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
            Self::Clockwise => "clockwise",
            Self::Counterclockwise => "counterclockwise",
            Self::SpotClockwise => "spot clockwise",
            Self::SpotCounterclockwise => "spot counterclockwise",
        }
    }

    pub fn from_label(label: &str) -> Result<Self> {
        match label {
            "forward" => Ok(Self::Forward),
            "backward" => Ok(Self::Backward),
            "clockwise" => Ok(Self::Clockwise),
            "counterclockwise" => Ok(Self::Counterclockwise),
            "spot clockwise" => Ok(Self::SpotClockwise),
            "spot counterclockwise" => Ok(Self::SpotCounterclockwise),
            other => Err(EcaError::Configuration(format!(
                "Unknown arena mode label: {}",
                other
            ))),
        }
    }
}

/// Session-wide acquisition parameters
///
/// The defaults reproduce the rig values: 10 kHz shared sample clock, 1000
/// sample I/O blocks, an output queue bounded to 50 blocks of lookahead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Shared hardware sample clock, in Hz
    pub sampling_rate: u32,
    /// Samples per synchronous write/read cycle
    pub block_size: usize,
    /// Bounded output queue capacity, in blocks
    pub output_queue_blocks: usize,
    /// Writer wait on an empty input queue before re-checking flags, ms
    pub input_timeout_ms: u64,
    /// Producer/acquisition wait on a full/empty output queue, ms
    pub output_timeout_ms: u64,
    /// Arena LED brightness applied at session start
    pub arena_brightness_percent: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 10_000,
            block_size: 1_000,
            output_queue_blocks: 50,
            input_timeout_ms: 5_000,
            output_timeout_ms: 100,
            arena_brightness_percent: 2,
        }
    }
}

impl SessionConfig {
    /// Seconds per sample
    pub fn dt(&self) -> f64 {
        1.0 / self.sampling_rate as f64
    }

    /// Samples for a duration in seconds, floored at one I/O block.
    ///
    /// Segments shorter than one block would break the resolver's
    /// two-segment guarantee, so every segment is at least one block long.
    pub fn samples_for(&self, seconds: f64) -> usize {
        let n = (seconds * self.sampling_rate as f64).round() as usize;
        n.max(self.block_size)
    }
}

/// Format a sample-clock duration as H:MM:SS for progress logs
pub fn seconds_to_hms(seconds: u64) -> String {
    let (m, s) = (seconds / 60, seconds % 60);
    let (h, m) = (m / 60, m % 60);
    format!("{}:{:02}:{:02}", h, m, s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_mode_codes_round_trip() {
        for code in 0..ARENA_MODE_COUNT as i64 {
            let mode = ArenaMode::from_code(code).unwrap();
            assert_eq!(mode.code() as i64, code);
            assert_eq!(ArenaMode::from_label(mode.label()).unwrap(), mode);
        }
    }

    #[test]
    fn test_arena_mode_out_of_range() {
        assert!(ArenaMode::from_code(6).is_err());
        assert!(ArenaMode::from_code(-1).is_err());
    }

    #[test]
    fn test_samples_for_floors_at_block() {
        let config = SessionConfig::default();
        assert_eq!(config.samples_for(5.0), 50_000);
        assert_eq!(config.samples_for(0.02), 1_000);
    }

    #[test]
    fn test_seconds_to_hms() {
        assert_eq!(seconds_to_hms(0), "0:00:00");
        assert_eq!(seconds_to_hms(3_725), "1:02:05");
    }
}
