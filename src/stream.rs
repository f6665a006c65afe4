//! Sample-indexed streaming engine
//!
//! Three cooperating loops run one experiment: a stimulus producer walks
//! the compiled timeline in fixed blocks and fills a bounded output queue,
//! the acquisition loop exchanges each output block for an input block
//! against the hardware, and a store writer lands input blocks into
//! per-trial datasets. Producer and writer resolve their absolute sample
//! cursors against the same boundary table, so they agree on trial
//! boundaries without ever talking to each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender,
};
use parking_lot::Mutex;

use crate::boundary;
use crate::device::{AcquisitionDevice, ArenaDevice};
use crate::error::{EcaError, Result};
use crate::protocol::CompiledExperiment;
use crate::store::{keys, AttrValue, DataStore, Dataset};
use crate::types::{
    seconds_to_hms, ArenaMode, SessionConfig, ANALOG_IN_CHANNELS, ANALOG_OUT_CHANNELS,
    DIGITAL_IN_CHANNELS, DIGITAL_OUT_CHANNELS,
};

/// Shared stop flags for one running session.
///
/// `abort` is set from outside (operator keypress, supervising UI) and
/// makes every loop wind down at its next timeout; `end` is set by the
/// producer once the final block is queued.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    abort: Arc<AtomicBool>,
    end: Arc<AtomicBool>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> bool {
        self.end.load(Ordering::SeqCst)
    }

    fn set_ended(&self) {
        self.end.store(true, Ordering::SeqCst);
    }
}

/// Arena/bookkeeping metadata attached to the first block of a trial
#[derive(Debug, Clone)]
pub struct TrialStart {
    pub name: String,
    pub arena_mode: ArenaMode,
    pub arena_angular_size: f64,
    pub duration_s: f64,
    /// Absolute sample index where this trial begins
    pub start_sample: u64,
}

/// One producer block: output samples plus where the cursor stands after it
#[derive(Debug, Clone)]
pub struct OutputBlock {
    /// Row-major `block_size x 2`
    pub analog_out: Vec<f64>,
    /// Row-major `block_size x 2`
    pub digital_out: Vec<u8>,
    /// Present when this block starts a new trial (possibly mid-block)
    pub new_trial: Option<TrialStart>,
    /// Absolute sample cursor after this block
    pub read_till: u64,
}

/// One acquired block, row counts implied by the channel constants
#[derive(Debug, Clone)]
pub struct InputBlock {
    pub analog_in: Vec<f64>,
    pub digital_in: Vec<u8>,
}

/// Walk the compiled timeline and queue output blocks until the end of the
/// experiment, an abort, or a closed queue. Returns the samples queued.
///
/// The bounded queue is the only pacing: when it is full, `send_timeout`
/// blocks briefly and the abort flag is re-checked, so an abort never waits
/// on a slow consumer.
pub fn stimulus_producer(
    experiment: Arc<CompiledExperiment>,
    config: SessionConfig,
    ctx: SessionContext,
    tx: Sender<OutputBlock>,
) -> Result<u64> {
    let total = experiment.total_samples();
    let block = config.block_size;
    let timeout = Duration::from_millis(config.output_timeout_ms);
    let mut read_till: u64 = 0;

    while read_till < total {
        if ctx.aborted() {
            log::info!("Stimulus producer exiting on abort at sample {}", read_till);
            return Ok(read_till);
        }

        // the final block shrinks to the timeline end
        let length = block.min((total - read_till) as usize);
        let spans = boundary::resolve(experiment.boundaries(), read_till, length)?;
        let mut analog_out = Vec::with_capacity(length * ANALOG_OUT_CHANNELS);
        let mut digital_out = Vec::with_capacity(length * DIGITAL_OUT_CHANNELS);
        for span in &spans {
            let segment = experiment.segment(span.index);
            analog_out.extend_from_slice(
                &segment.analog_out
                    [span.local_start * ANALOG_OUT_CHANNELS..span.local_end * ANALOG_OUT_CHANNELS],
            );
            digital_out.extend_from_slice(
                &segment.digital_out[span.local_start * DIGITAL_OUT_CHANNELS
                    ..span.local_end * DIGITAL_OUT_CHANNELS],
            );
        }

        // a trial starts when a block begins at sample 0 of a segment or
        // straddles into the next one
        let new_trial = if spans.len() == 2 || spans[0].local_start == 0 {
            let span = spans.last().unwrap();
            let segment = experiment.segment(span.index);
            Some(TrialStart {
                name: segment.id.clone(),
                arena_mode: segment.arena_mode,
                arena_angular_size: segment.arena_angular_size,
                duration_s: segment.length as f64 / config.sampling_rate as f64,
                start_sample: experiment.boundaries()[span.index],
            })
        } else {
            None
        };

        let mut item = OutputBlock {
            analog_out,
            digital_out,
            new_trial,
            read_till: read_till + length as u64,
        };
        loop {
            match tx.send_timeout(item, timeout) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if ctx.aborted() {
                        log::info!("Stimulus producer exiting on abort at sample {}", read_till);
                        return Ok(read_till);
                    }
                    item = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(EcaError::ChannelClosed("output queue".to_string()));
                }
            }
        }
        read_till += length as u64;
    }

    ctx.set_ended();
    log::info!("Stimulus producer done, {} samples queued", read_till);
    Ok(read_till)
}

fn allocate_trial(
    store: &mut DataStore,
    experiment: &CompiledExperiment,
    index: usize,
) -> Result<String> {
    let protocol_path = format!("{}/{}", experiment.name(), experiment.segment_id(index));
    let trial_number = store
        .group(&protocol_path)?
        .child_names()
        .iter()
        .filter(|name| name.starts_with("Trial-"))
        .count()
        + 1;
    let trial_path = format!("{}/Trial-{}", protocol_path, trial_number);
    let length = experiment.segment(index).length;
    let trial = store.create_group(&trial_path)?;
    trial.create_dataset(keys::ANALOG_IN, Dataset::float_filled(length, ANALOG_IN_CHANNELS))?;
    trial.create_dataset(keys::DIGITAL_IN, Dataset::byte_filled(length, DIGITAL_IN_CHANNELS))?;
    trial.set_attr(keys::TRIAL_COMPLETED, AttrValue::Bool(false));
    Ok(trial_path)
}

fn write_trial_rows(
    store: &mut DataStore,
    trial_path: &str,
    row_offset: usize,
    analog: &[f64],
    digital: &[u8],
) -> Result<()> {
    let trial = store.group_mut(trial_path)?;
    trial
        .dataset_mut(keys::ANALOG_IN)?
        .write_float_rows(row_offset, analog)?;
    trial
        .dataset_mut(keys::DIGITAL_IN)?
        .write_byte_rows(row_offset, digital)?;
    Ok(())
}

fn mark_completed(store: &mut DataStore, trial_path: &str) -> Result<()> {
    store
        .group_mut(trial_path)?
        .set_attr(keys::TRIAL_COMPLETED, AttrValue::Bool(true));
    Ok(())
}

/// Drain the input queue into per-trial datasets until the session winds
/// down. Returns the samples written.
///
/// Trials are allocated lazily when their first sample arrives and marked
/// completed when their last row is filled, whether the final block
/// straddles into the next segment or ends exactly on the boundary.
pub fn store_writer(
    store: Arc<Mutex<DataStore>>,
    experiment: Arc<CompiledExperiment>,
    config: SessionConfig,
    ctx: SessionContext,
    rx: Receiver<InputBlock>,
) -> Result<u64> {
    let timeout = Duration::from_millis(config.input_timeout_ms);
    let mut written_till: u64 = 0;
    let mut current_trial: Option<String> = None;

    loop {
        let item = match rx.recv_timeout(timeout) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => {
                if ctx.aborted() || ctx.ended() {
                    log::info!(
                        "Store writer exiting, abort: {} end: {}, {} samples written",
                        ctx.aborted(),
                        ctx.ended(),
                        written_till
                    );
                    store.lock().flush()?;
                    return Ok(written_till);
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                // the acquisition loop is gone and the queue is drained
                store.lock().flush()?;
                if ctx.aborted() || ctx.ended() {
                    return Ok(written_till);
                }
                return Err(EcaError::ChannelClosed("input queue".to_string()));
            }
        };

        let rows = item.analog_in.len() / ANALOG_IN_CHANNELS;
        if rows == 0 {
            continue;
        }
        if item.analog_in.len() % ANALOG_IN_CHANNELS != 0
            || item.digital_in.len() != rows * DIGITAL_IN_CHANNELS
        {
            return Err(EcaError::Acquisition(format!(
                "Mismatched input block: {} analog / {} digital values",
                item.analog_in.len(),
                item.digital_in.len()
            )));
        }

        let spans = boundary::resolve(experiment.boundaries(), written_till, rows)?;
        let mut guard = store.lock();
        match spans.as_slice() {
            [span] => {
                if span.local_start == 0 {
                    current_trial = Some(allocate_trial(&mut guard, &experiment, span.index)?);
                }
                let trial = current_trial.as_deref().ok_or_else(|| {
                    EcaError::Store("Input block with no open trial".to_string())
                })?;
                write_trial_rows(
                    &mut guard,
                    trial,
                    span.local_start,
                    &item.analog_in,
                    &item.digital_in,
                )?;
                if span.local_end == experiment.segment(span.index).length {
                    mark_completed(&mut guard, trial)?;
                }
            }
            [tail, head] => {
                let analog_split = tail.len() * ANALOG_IN_CHANNELS;
                let digital_split = tail.len() * DIGITAL_IN_CHANNELS;
                let trial = current_trial.as_deref().ok_or_else(|| {
                    EcaError::Store("Straddling block with no open trial".to_string())
                })?;
                write_trial_rows(
                    &mut guard,
                    trial,
                    tail.local_start,
                    &item.analog_in[..analog_split],
                    &item.digital_in[..digital_split],
                )?;
                mark_completed(&mut guard, trial)?;
                let next = allocate_trial(&mut guard, &experiment, head.index)?;
                write_trial_rows(
                    &mut guard,
                    &next,
                    0,
                    &item.analog_in[analog_split..],
                    &item.digital_in[digital_split..],
                )?;
                current_trial = Some(next);
            }
            _ => unreachable!("resolver returns one or two spans"),
        }
        drop(guard);
        written_till += rows as u64;
    }
}

/// Outcome of one streaming session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub aborted: bool,
    pub ended: bool,
    /// Output samples handed to the acquisition loop
    pub samples_queued: u64,
    /// Input samples landed in the store
    pub samples_written: u64,
}

/// Run one compiled experiment end to end.
///
/// Spawns the producer and writer threads, then drives the acquisition
/// loop on the calling thread: each output block is exchanged against the
/// device for an input block, with a store flush, an arena pattern update
/// and a progress log line at every trial start. Returns once the timeline
/// is exhausted or `ctx` is aborted; the store is flushed before returning.
pub fn run_session<D: AcquisitionDevice, A: ArenaDevice>(
    store: Arc<Mutex<DataStore>>,
    experiment_name: &str,
    daq: &mut D,
    arena: &mut A,
    config: &SessionConfig,
    ctx: &SessionContext,
) -> Result<SessionSummary> {
    let compiled = Arc::new(CompiledExperiment::load(&store.lock(), experiment_name)?);
    let total_duration = compiled.duration_s(config);

    arena.set_brightness(config.arena_brightness_percent)?;
    store.lock().group_mut(experiment_name)?.set_attr(
        keys::ARENA_BRIGHTNESS,
        AttrValue::Int(config.arena_brightness_percent as i64),
    );

    let (out_tx, out_rx) = bounded::<OutputBlock>(config.output_queue_blocks);
    let (in_tx, in_rx) = unbounded::<InputBlock>();

    let producer = {
        let experiment = Arc::clone(&compiled);
        let config = config.clone();
        let ctx = ctx.clone();
        thread::Builder::new()
            .name("stimulus-producer".to_string())
            .spawn(move || stimulus_producer(experiment, config, ctx, out_tx))?
    };
    let writer = {
        let store = Arc::clone(&store);
        let experiment = Arc::clone(&compiled);
        let config = config.clone();
        let ctx = ctx.clone();
        thread::Builder::new()
            .name("store-writer".to_string())
            .spawn(move || store_writer(store, experiment, config, ctx, in_rx))?
    };

    let timeout = Duration::from_millis(config.output_timeout_ms);
    let acquisition = loop {
        if ctx.aborted() {
            break Ok(());
        }
        let item = match out_rx.recv_timeout(timeout) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => {
                if ctx.ended() {
                    break Ok(());
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        };

        if let Some(trial) = &item.new_trial {
            store.lock().flush()?;
            arena.send_pattern(trial.arena_mode, trial.arena_angular_size)?;
            let done = trial.start_sample / config.sampling_rate as u64;
            log::info!(
                "Done {} of {}; current protocol: {} ({} s)",
                seconds_to_hms(done),
                seconds_to_hms(total_duration),
                trial.name,
                trial.duration_s
            );
        }

        match daq.acquire(&item.analog_out, &item.digital_out) {
            Ok((analog_in, digital_in)) => {
                if !analog_in.is_empty()
                    && in_tx
                        .send(InputBlock {
                            analog_in,
                            digital_in,
                        })
                        .is_err()
                {
                    // writer is gone; its join error carries the cause
                    break Ok(());
                }
            }
            Err(err) => break Err(err),
        }
    };

    daq.stop();
    // closing both queues unblocks whichever thread is still waiting
    drop(out_rx);
    drop(in_tx);

    let queued = producer
        .join()
        .map_err(|_| EcaError::Acquisition("Stimulus producer panicked".to_string()))?;
    let written = writer
        .join()
        .map_err(|_| EcaError::Acquisition("Store writer panicked".to_string()))?;
    store.lock().flush()?;

    acquisition?;
    let samples_written = written?;
    let samples_queued = match queued {
        Ok(n) => n,
        // the producer only sees a closed queue when the acquisition loop
        // bailed out first; that error is already surfaced above
        Err(EcaError::ChannelClosed(_)) if ctx.aborted() => 0,
        Err(err) => return Err(err),
    };

    log::info!(
        "Session over: abort: {} end: {} ({} samples written)",
        ctx.aborted(),
        ctx.ended(),
        samples_written
    );
    Ok(SessionSummary {
        aborted: ctx.aborted(),
        ended: ctx.ended(),
        samples_queued,
        samples_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{add_experiment, CompileOptions};

    fn test_config() -> SessionConfig {
        SessionConfig {
            sampling_rate: 1_000,
            block_size: 100,
            output_timeout_ms: 10,
            input_timeout_ms: 10,
            ..SessionConfig::default()
        }
    }

    fn compile(protocol: &str) -> (Arc<Mutex<DataStore>>, Arc<CompiledExperiment>) {
        let config = test_config();
        let mut store = DataStore::in_memory();
        let options = CompileOptions {
            randomize: false,
            repeats: 1,
            seed: Some(5),
        };
        let compiled = add_experiment(&mut store, "exp", protocol, &options, &config, None).unwrap();
        (Arc::new(Mutex::new(store)), Arc::new(compiled))
    }

    #[test]
    fn test_producer_emits_whole_timeline_in_order() {
        let config = test_config();
        let (_, compiled) = compile("mep(0.1,0.2,0.1,0.5);bla(0.25)");
        let total = compiled.total_samples();
        let blocks = total.div_ceil(config.block_size as u64) as usize;
        let (tx, rx) = bounded::<OutputBlock>(blocks);
        let ctx = SessionContext::new();

        let queued =
            stimulus_producer(Arc::clone(&compiled), config.clone(), ctx.clone(), tx).unwrap();
        assert_eq!(queued, total);
        assert!(ctx.ended());

        let items: Vec<OutputBlock> = rx.try_iter().collect();
        assert_eq!(items.len(), blocks);
        assert_eq!(items.last().unwrap().read_till, total);
        // one trial-start per timeline entry, in timeline order, each
        // carrying the segment's boundary start
        let starts: Vec<String> = items
            .iter()
            .filter_map(|i| i.new_trial.as_ref().map(|t| t.name.clone()))
            .collect();
        assert_eq!(starts, compiled.timeline());
        let start_samples: Vec<u64> = items
            .iter()
            .filter_map(|i| i.new_trial.as_ref().map(|t| t.start_sample))
            .collect();
        assert_eq!(
            start_samples,
            &compiled.boundaries()[..compiled.timeline().len()]
        );
        // concatenated blocks reproduce the speaker column of segment 1
        let mut speaker: Vec<f64> = Vec::new();
        for item in &items {
            speaker.extend(
                item.analog_out
                    .iter()
                    .skip(1)
                    .step_by(ANALOG_OUT_CHANNELS)
                    .copied(),
            );
        }
        let warmup_len = compiled.segment(0).length;
        let expected = compiled.segment(1).speaker();
        assert_eq!(&speaker[warmup_len..warmup_len + expected.len()], &expected[..]);
    }

    #[test]
    fn test_producer_stops_on_abort_with_full_queue() {
        let config = test_config();
        let (_, compiled) = compile("bla(0.5)");
        let (tx, rx) = bounded::<OutputBlock>(2);
        let ctx = SessionContext::new();
        ctx.request_abort();
        let queued = stimulus_producer(compiled, config, ctx.clone(), tx).unwrap();
        assert_eq!(queued, 0);
        assert!(!ctx.ended());
        drop(rx);
    }

    #[test]
    fn test_writer_lands_blocks_and_completes_trials() {
        let config = test_config();
        // timeline warmup(5000) + bla(250) + cooldown(5000) with block 100:
        // the bla/cooldown boundary straddles a block, the warmup boundary
        // and the timeline end land exactly on block edges
        let (store, compiled) = compile("bla(0.25)");
        let (tx, rx) = unbounded::<InputBlock>();
        let ctx = SessionContext::new();

        let total = compiled.total_samples() as usize;
        for start in (0..total).step_by(config.block_size) {
            let length = config.block_size.min(total - start);
            tx.send(InputBlock {
                analog_in: vec![start as f64; length * ANALOG_IN_CHANNELS],
                digital_in: vec![1; length * DIGITAL_IN_CHANNELS],
            })
            .unwrap();
        }
        ctx.set_ended();
        drop(tx);

        let written = store_writer(
            Arc::clone(&store),
            Arc::clone(&compiled),
            config,
            ctx,
            rx,
        )
        .unwrap();
        assert_eq!(written, total as u64);

        let guard = store.lock();
        // warmup (via the experiment link), one bla trial, cooldown trial
        for path in ["exp/warmup/Trial-1", "exp/bla(0.25)/Trial-1", "exp/cooldown/Trial-2"] {
            let trial = guard.group(path).unwrap();
            assert_eq!(trial.bool_attr(keys::TRIAL_COMPLETED), Some(true), "{}", path);
            let analog = trial.dataset(keys::ANALOG_IN).unwrap().float_data().unwrap();
            assert!(analog.iter().all(|v| !v.is_nan()), "{} has unwritten rows", path);
        }
        // cooldown shares the warmup group through the link chain
        assert!(guard.group("warmup").unwrap().has_child("Trial-2"));
    }
}
