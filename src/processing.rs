//! Memoized trial and protocol analysis
//!
//! Derived data lives next to the raw recordings in per-level
//! `Processed Data` groups. Each level is recomputed only when its cache is
//! absent, when `reanalyze` is forced, or when anything below it was
//! recomputed; otherwise the cached datasets are read back untouched. The
//! store-wide `Processed` attribute short-circuits whole files that were
//! already analyzed.

use crate::analysis;
use crate::error::{EcaError, Result};
use crate::protocol::{parse_call, GeneratorKind};
use crate::store::{keys, AttrValue, DataStore, Dataset, Node};
use crate::types::SessionConfig;

/// Derived data of one trial
#[derive(Debug, Clone)]
pub struct TrialSummary {
    pub membrane_potential: Vec<f64>,
    pub spike_positions: Vec<usize>,
    pub movement: Vec<f64>,
    /// False when every dataset came straight from the cache
    pub recomputed: bool,
}

/// Derived data of one protocol, aggregated over its completed trials
#[derive(Debug, Clone)]
pub struct ProtocolSummary {
    pub movement_traces: Vec<Vec<f64>>,
    pub mean_movement: Vec<f64>,
    pub raster: Vec<Vec<f64>>,
    pub pre_rate: Vec<f64>,
    pub recomputed: bool,
}

/// Completed trials of a protocol group, in recording order
pub fn completed_trials(store: &DataStore, protocol_path: &str) -> Result<Vec<String>> {
    let group = store.group(protocol_path)?;
    let mut trials: Vec<(usize, String)> = Vec::new();
    for name in group.child_names() {
        let Some(number) = name.strip_prefix("Trial-").and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        let trial = store.group(&format!("{}/{}", protocol_path, name))?;
        if trial.bool_attr(keys::TRIAL_COMPLETED) == Some(true) {
            trials.push((number, name));
        }
    }
    trials.sort_by_key(|(number, _)| *number);
    Ok(trials.into_iter().map(|(_, name)| name).collect())
}

/// Analyze one trial, reusing its `Processed Data` cache when allowed.
pub fn process_trial(
    store: &mut DataStore,
    trial_path: &str,
    reanalyze: bool,
    config: &SessionConfig,
) -> Result<TrialSummary> {
    let processed_path = format!("{}/{}", trial_path, keys::PROCESSED_DATA);
    if store.contains(&processed_path) {
        if !reanalyze {
            let processed = store.group(&processed_path)?;
            let spike_positions = processed
                .dataset(keys::SPIKE_POSITIONS)?
                .column(0)?
                .iter()
                .map(|&p| p as usize)
                .collect();
            return Ok(TrialSummary {
                membrane_potential: processed.dataset(keys::MEMBRANE_POTENTIAL)?.column(0)?,
                spike_positions,
                movement: processed.dataset(keys::MOVEMENT)?.column(0)?,
                recomputed: false,
            });
        }
        store.delete(&processed_path)?;
    }

    log::info!("Analyzing trial {}", trial_path);
    let analog_in = store.group(trial_path)?.dataset(keys::ANALOG_IN)?;
    let raw_potential = analog_in.column(0)?;
    let hall_sensor = analog_in.column(2)?;

    let membrane_potential =
        analysis::membrane_potential_trace(&raw_potential, config.sampling_rate)?;
    let movement = analysis::movement_trace(&hall_sensor, config.sampling_rate)?;
    let spike_positions = analysis::spike_positions(&membrane_potential);

    let processed = store.create_group(&processed_path)?;
    processed.put_dataset(
        keys::MEMBRANE_POTENTIAL,
        Dataset::from_floats(1, membrane_potential.clone())?,
    );
    processed.put_dataset(keys::MOVEMENT, Dataset::from_floats(1, movement.clone())?);
    processed.put_dataset(
        keys::SPIKE_POSITIONS,
        Dataset::from_floats(1, spike_positions.iter().map(|&p| p as f64).collect())?,
    );

    Ok(TrialSummary {
        membrane_potential,
        spike_positions,
        movement,
        recomputed: true,
    })
}

fn columnwise_mean(traces: &[Vec<f64>]) -> Vec<f64> {
    let Some(first) = traces.first() else {
        return Vec::new();
    };
    if traces.len() == 1 {
        return first.clone();
    }
    let mut mean = vec![0.0; first.len()];
    for trace in traces {
        for (acc, &value) in mean.iter_mut().zip(trace.iter()) {
            *acc += value;
        }
    }
    for value in mean.iter_mut() {
        *value /= traces.len() as f64;
    }
    mean
}

/// Analyze one protocol over its completed trials.
///
/// Returns `None` when the protocol has no completed trial. The protocol
/// cache is reused only when it exists, `reanalyze` is off, and no
/// constituent trial was recomputed; otherwise it is rebuilt from the
/// trial summaries.
pub fn process_protocol(
    store: &mut DataStore,
    protocol_path: &str,
    reanalyze: bool,
    config: &SessionConfig,
) -> Result<Option<ProtocolSummary>> {
    let trials = completed_trials(store, protocol_path)?;
    if trials.is_empty() {
        return Ok(None);
    }

    let mut summaries = Vec::with_capacity(trials.len());
    let mut any_recomputed = false;
    for trial in &trials {
        let summary = process_trial(
            store,
            &format!("{}/{}", protocol_path, trial),
            reanalyze,
            config,
        )?;
        any_recomputed |= summary.recomputed;
        summaries.push(summary);
    }

    let processed_path = format!("{}/{}", protocol_path, keys::PROCESSED_DATA);
    if store.contains(&processed_path) {
        if !reanalyze && !any_recomputed {
            let processed = store.group(&processed_path)?;
            let movement = processed.dataset(keys::MOVEMENT)?;
            let raster = processed.dataset(keys::RASTER)?;
            let rows_of = |dataset: &Dataset| -> Result<Vec<Vec<f64>>> {
                (0..dataset.rows())
                    .map(|r| Ok(dataset.float_rows_slice(r, r + 1)?.to_vec()))
                    .collect()
            };
            return Ok(Some(ProtocolSummary {
                movement_traces: rows_of(movement)?,
                raster: rows_of(raster)?,
                mean_movement: processed.dataset(keys::MEAN_MOVEMENT)?.column(0)?,
                pre_rate: processed.dataset(keys::PRE_RATE)?.column(0)?,
                recomputed: false,
            }));
        }
        store.delete(&processed_path)?;
    }

    log::info!("Analyzing protocol {}", protocol_path);
    let length = store
        .group(protocol_path)?
        .int_attr(keys::NUMBER_OF_SAMPLES)
        .ok_or_else(|| EcaError::Store(format!("{} has no sample count", protocol_path)))?
        as usize;

    let movement_traces: Vec<Vec<f64>> = summaries.iter().map(|s| s.movement.clone()).collect();
    let spike_lists: Vec<Vec<usize>> =
        summaries.iter().map(|s| s.spike_positions.clone()).collect();
    let mean_movement = columnwise_mean(&movement_traces);
    let raster = analysis::raster_matrix(&spike_lists);
    let pre_rate = analysis::pre_rate_histogram(&spike_lists, length);

    let processed = store.create_group(&processed_path)?;
    processed.put_dataset(keys::MOVEMENT, Dataset::from_float_rows(&movement_traces)?);
    processed.put_dataset(
        keys::MEAN_MOVEMENT,
        Dataset::from_floats(1, mean_movement.clone())?,
    );
    processed.put_dataset(keys::RASTER, Dataset::from_float_rows(&raster)?);
    processed.put_dataset(keys::PRE_RATE, Dataset::from_floats(1, pre_rate.clone())?);
    store.flush()?;

    Ok(Some(ProtocolSummary {
        movement_traces,
        mean_movement,
        raster,
        pre_rate,
        recomputed: true,
    }))
}

/// Protocol children of an experiment worth analyzing: real groups (links
/// like warmup/cooldown are shared across experiments and skipped) whose
/// generator records neural data; `dye` segments carry none.
fn analyzable_protocols(store: &DataStore, experiment: &str) -> Result<Vec<String>> {
    let group = store.group(experiment)?;
    let mut protocols = Vec::new();
    for (name, node) in &group.children {
        if !matches!(node, Node::Group(_)) {
            continue;
        }
        match parse_call(name) {
            Ok((GeneratorKind::Dye, _)) => continue,
            Ok(_) => protocols.push(name.clone()),
            Err(_) => continue,
        }
    }
    Ok(protocols)
}

/// Analyze every protocol of one experiment; returns how many protocol
/// caches were rebuilt.
pub fn process_experiment(
    store: &mut DataStore,
    experiment: &str,
    reanalyze: bool,
    config: &SessionConfig,
) -> Result<usize> {
    log::info!("Populating experiment {}, reanalyze: {}", experiment, reanalyze);
    let mut rebuilt = 0;
    for protocol in analyzable_protocols(store, experiment)? {
        let summary = process_protocol(
            store,
            &format!("{}/{}", experiment, protocol),
            reanalyze,
            config,
        )?;
        if summary.is_some_and(|s| s.recomputed) {
            rebuilt += 1;
        }
    }
    Ok(rebuilt)
}

/// Analyze a whole store.
///
/// A root without `Processed = true` is treated as unanalyzed and rebuilt
/// in full even when `reanalyze` is off. The attribute is set and the
/// store flushed on the way out, so a crash mid-analysis at worst repeats
/// it. Returns how many protocol caches were rebuilt.
pub fn process_store(
    store: &mut DataStore,
    reanalyze: bool,
    config: &SessionConfig,
) -> Result<usize> {
    let reanalyze = reanalyze || store.root().bool_attr(keys::PROCESSED) != Some(true);
    let experiments: Vec<String> = store
        .root()
        .children
        .iter()
        .filter(|(_, node)| matches!(node, Node::Group(group) if group.attr(keys::TITLE).is_some()))
        .map(|(name, _)| name.clone())
        .collect();

    let mut rebuilt = 0;
    for experiment in experiments {
        rebuilt += process_experiment(store, &experiment, reanalyze, config)?;
    }
    store.root_mut().set_attr(keys::PROCESSED, AttrValue::Bool(true));
    store.flush()?;
    Ok(rebuilt)
}
