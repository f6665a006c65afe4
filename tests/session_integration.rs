//! End-to-end streaming sessions against the software loopback device.

use std::sync::Arc;

use parking_lot::Mutex;

use eca_rs::device::{AcquisitionDevice, RecordingArena, SoftwareLoopback};
use eca_rs::protocol::{add_experiment, CompileOptions, CompiledExperiment};
use eca_rs::store::{keys, DataStore};
use eca_rs::stream::{run_session, SessionContext};
use eca_rs::types::{ArenaMode, SessionConfig};
use eca_rs::Result;

fn test_config() -> SessionConfig {
    SessionConfig {
        sampling_rate: 1_000,
        // 40 does not divide every boundary, so straddling blocks occur
        block_size: 40,
        output_queue_blocks: 50,
        input_timeout_ms: 50,
        output_timeout_ms: 10,
        arena_brightness_percent: 2,
    }
}

fn compiled_store(config: &SessionConfig) -> (Arc<Mutex<DataStore>>, CompiledExperiment) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut store = DataStore::in_memory();
    let options = CompileOptions {
        randomize: false,
        repeats: 2,
        seed: Some(17),
    };
    let compiled = add_experiment(
        &mut store,
        "exp",
        "mes(0.1,0.25,0.1,10,0.5);bla(0.35)",
        &options,
        config,
        None,
    )
    .unwrap();
    (Arc::new(Mutex::new(store)), compiled)
}

#[test]
fn test_full_session_round_trips_through_loopback() {
    let config = test_config();
    let (store, compiled) = compiled_store(&config);
    let total = compiled.total_samples();

    let mut daq = SoftwareLoopback;
    let mut arena = RecordingArena::default();
    let ctx = SessionContext::new();
    let summary = run_session(
        Arc::clone(&store),
        "exp",
        &mut daq,
        &mut arena,
        &config,
        &ctx,
    )
    .unwrap();

    assert!(summary.ended);
    assert!(!summary.aborted);
    assert_eq!(summary.samples_queued, total);
    assert_eq!(summary.samples_written, total);

    // one arena pattern per timeline entry, in order
    assert_eq!(arena.brightness, Some(2));
    assert_eq!(arena.patterns.len(), compiled.timeline().len());
    assert!(arena
        .patterns
        .iter()
        .all(|&(mode, size)| mode == ArenaMode::Forward && size == 10.0));

    let guard = store.lock();
    assert_eq!(
        guard.group("exp").unwrap().int_attr(keys::ARENA_BRIGHTNESS),
        Some(2)
    );

    // the repeated timeline leaves two completed trials per segment and
    // two in the shared warmup group (warmup plus cooldown)
    for path in [
        "exp/mes(0.1,0.25,0.1,10,0.5)/Trial-1",
        "exp/mes(0.1,0.25,0.1,10,0.5)/Trial-2",
        "exp/bla(0.35)/Trial-1",
        "exp/bla(0.35)/Trial-2",
        "warmup/Trial-1",
        "warmup/Trial-2",
    ] {
        let trial = guard.group(path).unwrap();
        assert_eq!(trial.bool_attr(keys::TRIAL_COMPLETED), Some(true), "{}", path);
        let analog = trial.dataset(keys::ANALOG_IN).unwrap();
        assert!(
            analog.float_data().unwrap().iter().all(|v| !v.is_nan()),
            "{} has unwritten rows",
            path
        );
    }
    assert!(!guard.contains("warmup/Trial-3"));

    // loopback echo: recorded inputs reproduce the synthesized stimulus
    let segment = compiled.segment(1);
    let trial = guard.group("exp/mes(0.1,0.25,0.1,10,0.5)/Trial-1").unwrap();
    let analog_in = trial.dataset(keys::ANALOG_IN).unwrap();
    assert_eq!(analog_in.column(1).unwrap(), segment.speaker());
    assert_eq!(analog_in.column(2).unwrap(), segment.speaker());
    assert_eq!(
        trial
            .dataset(keys::DIGITAL_IN)
            .unwrap()
            .byte_data()
            .unwrap(),
        &segment.digital_out[..]
    );
}

/// Loopback wrapper that raises the abort flag after a fixed number of
/// acquisition calls.
struct AbortingLoopback {
    inner: SoftwareLoopback,
    ctx: SessionContext,
    calls: usize,
    abort_at: usize,
}

impl AcquisitionDevice for AbortingLoopback {
    fn acquire(&mut self, analog_out: &[f64], digital_out: &[u8]) -> Result<(Vec<f64>, Vec<u8>)> {
        self.calls += 1;
        if self.calls == self.abort_at {
            self.ctx.request_abort();
        }
        self.inner.acquire(analog_out, digital_out)
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

#[test]
fn test_aborted_session_stops_early_and_keeps_partial_trial() {
    let config = test_config();
    let (store, compiled) = compiled_store(&config);

    let ctx = SessionContext::new();
    let mut daq = AbortingLoopback {
        inner: SoftwareLoopback,
        ctx: ctx.clone(),
        calls: 0,
        abort_at: 10,
    };
    let mut arena = RecordingArena::default();
    let summary = run_session(
        Arc::clone(&store),
        "exp",
        &mut daq,
        &mut arena,
        &config,
        &ctx,
    )
    .unwrap();

    assert!(summary.aborted);
    assert!(!summary.ended);
    let written = 10 * config.block_size as u64;
    assert_eq!(summary.samples_written, written);
    assert!(summary.samples_written < compiled.total_samples());

    // the interrupted warmup trial stays, incomplete and NaN past the cut
    let guard = store.lock();
    let trial = guard.group("warmup/Trial-1").unwrap();
    assert_eq!(trial.bool_attr(keys::TRIAL_COMPLETED), Some(false));
    let analog = trial.dataset(keys::ANALOG_IN).unwrap();
    assert!(analog
        .float_rows_slice(0, written as usize)
        .unwrap()
        .iter()
        .all(|v| !v.is_nan()));
    assert!(analog
        .float_rows_slice(written as usize, analog.rows())
        .unwrap()
        .iter()
        .all(|v| v.is_nan()));
    assert!(!guard.contains("exp/bla(0.35)/Trial-1"));
}
