//! Stimulus protocol grammar and compilation
//!
//! A protocol string is a `;`-separated list of generator calls, optionally
//! using bracket groups that expand by Cartesian product:
//! `"mes(4,5,4,[15/30],0.4)"` compiles to two segments. Compilation expands
//! the grammar, synthesizes each unique segment once, persists everything
//! into the data store and returns the realized timeline the streaming
//! engine runs against.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::analysis;
use crate::error::{EcaError, Result};
use crate::store::{keys, AttrValue, DataStore, Dataset};
use crate::types::{ArenaMode, SessionConfig, ANALOG_OUT_CHANNELS, DIGITAL_OUT_CHANNELS};
use crate::waveform;

/// Closed set of stimulus generators
///
/// The short names are the grammar keywords; arities are fixed and checked
/// at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    /// `bla(SD)` - silence on every line
    Blank,
    /// `brb(SD)` - 3 Hz current square wave into the amplifier EXT I line
    BridgeBalance,
    /// `mep(PrSD, SD, PoSD, a)` - constant speaker drive
    MechanicalPulse,
    /// `mes(PrSD, SD, PoSD, f, a)` - speaker sine
    MechanicalSine,
    /// `mec(PrSD, SD, PoSD, f0, f1, a)` - speaker chirp
    MechanicalChirp,
    /// `men(PrSD, SD, PoSD, f0, a)` - band-limited speaker noise
    MechanicalNoise,
    /// `vis(PrSD, SD, PoSD, size, mode, speed)` - arena advance square wave
    Visual,
    /// `vic(PrSD, SD, PoSD, size, mode, s0, s1)` - arena advance chirp
    VisualChirp,
    /// `msv(PrSD, MSD, VSD, MVD, PoSD, f, a, size, mode, speed)`
    MechanicalSineVisual,
    /// `mcv(PrSD, MSD, VSD, MVD, PoSD, f0, f1, a, size, mode, speed)`
    MechanicalChirpVisual,
    /// `dye(SD, f)` - amplifier gate square wave for dye iontophoresis
    Dye,
}

impl GeneratorKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "bla" => Ok(Self::Blank),
            "brb" => Ok(Self::BridgeBalance),
            "mep" => Ok(Self::MechanicalPulse),
            "mes" => Ok(Self::MechanicalSine),
            "mec" => Ok(Self::MechanicalChirp),
            "men" => Ok(Self::MechanicalNoise),
            "vis" => Ok(Self::Visual),
            "vic" => Ok(Self::VisualChirp),
            "msv" => Ok(Self::MechanicalSineVisual),
            "mcv" => Ok(Self::MechanicalChirpVisual),
            "dye" => Ok(Self::Dye),
            other => Err(EcaError::Configuration(format!(
                "Stimulus {} not implemented",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Blank => "bla",
            Self::BridgeBalance => "brb",
            Self::MechanicalPulse => "mep",
            Self::MechanicalSine => "mes",
            Self::MechanicalChirp => "mec",
            Self::MechanicalNoise => "men",
            Self::Visual => "vis",
            Self::VisualChirp => "vic",
            Self::MechanicalSineVisual => "msv",
            Self::MechanicalChirpVisual => "mcv",
            Self::Dye => "dye",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Blank => "Blank",
            Self::BridgeBalance => "Bridge Balance",
            Self::MechanicalPulse => "Mechanical Pulse",
            Self::MechanicalSine => "Mechanical Sine",
            Self::MechanicalChirp => "Mechanical Chirp",
            Self::MechanicalNoise => "Mechanical Noise",
            Self::Visual => "Visual",
            Self::VisualChirp => "Visual Chirp",
            Self::MechanicalSineVisual => "Mechanical Sine + Visual",
            Self::MechanicalChirpVisual => "Mechanical Chirp + Visual",
            Self::Dye => "Dye",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Self::Blank | Self::BridgeBalance => 1,
            Self::Dye => 2,
            Self::MechanicalPulse => 4,
            Self::MechanicalSine | Self::MechanicalNoise => 5,
            Self::MechanicalChirp | Self::Visual => 6,
            Self::VisualChirp => 7,
            Self::MechanicalSineVisual => 10,
            Self::MechanicalChirpVisual => 11,
        }
    }
}

/// Parse one segment id like `"mes(4,5,4,15,0.4)"` into its generator and
/// parameter list, checking the arity.
pub fn parse_call(id: &str) -> Result<(GeneratorKind, Vec<f64>)> {
    let malformed = || EcaError::Configuration(format!("Malformed protocol id: {}", id));
    let (name, rest) = id.split_once('(').ok_or_else(malformed)?;
    let params_text = rest.strip_suffix(')').ok_or_else(malformed)?;
    let kind = GeneratorKind::from_name(name)?;
    let mut params = Vec::new();
    if !params_text.is_empty() {
        for text in params_text.split(',') {
            params.push(text.parse::<f64>().map_err(|_| {
                EcaError::Configuration(format!("Bad parameter {:?} in {}", text, id))
            })?);
        }
    }
    if params.len() != kind.arity() {
        return Err(EcaError::Configuration(format!(
            "Protocol {} requires {} parameter(s). Got {:?}",
            kind.display_name(),
            kind.arity(),
            params
        )));
    }
    Ok((kind, params))
}

/// Expand a compact protocol string into the flat segment-id list.
///
/// Whitespace (including newlines) is stripped, clauses are split on `;`,
/// empty clauses are skipped, and every `[a/b/c]` group multiplies the
/// clause by its alternatives, leftmost group varying slowest. Unbalanced
/// or nested brackets are configuration errors.
pub fn expand_protocol(compact: &str) -> Result<Vec<String>> {
    let stripped: String = compact.chars().filter(|c| !c.is_whitespace()).collect();
    let mut expanded = Vec::new();
    for clause in stripped.split(';') {
        if clause.is_empty() {
            continue;
        }
        expanded.extend(expand_clause(clause)?);
    }
    Ok(expanded)
}

fn expand_clause(clause: &str) -> Result<Vec<String>> {
    let unbalanced = || EcaError::Configuration(format!("Unbalanced brackets in: {}", clause));
    let mut variants = vec![String::new()];
    let mut rest = clause;
    while let Some(open) = rest.find('[') {
        let close = rest[open + 1..].find(']').ok_or_else(unbalanced)? + open + 1;
        let literal = &rest[..open];
        let alternatives: Vec<&str> = rest[open + 1..close].split('/').collect();
        if alternatives.iter().any(|a| a.contains('[')) {
            return Err(unbalanced());
        }
        let mut next = Vec::with_capacity(variants.len() * alternatives.len());
        for prefix in &variants {
            for alternative in &alternatives {
                next.push(format!("{}{}{}", prefix, literal, alternative));
            }
        }
        variants = next;
        rest = &rest[close + 1..];
    }
    if rest.contains(']') {
        return Err(unbalanced());
    }
    for variant in variants.iter_mut() {
        variant.push_str(rest);
    }
    Ok(variants)
}

/// One synthesized stimulus segment: full-length output buffers plus the
/// arena settings applied when its first sample goes out.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: String,
    /// Samples, floored at one I/O block
    pub length: usize,
    pub arena_angular_size: f64,
    pub arena_mode: ArenaMode,
    /// Row-major `length x 2`: EXT I command, speaker drive
    pub analog_out: Vec<f64>,
    /// Row-major `length x 2`: amplifier gate, arena advance line
    pub digital_out: Vec<u8>,
}

impl Segment {
    fn blank(id: &str, total_s: f64, config: &SessionConfig) -> Segment {
        let length = config.samples_for(total_s);
        Segment {
            id: id.to_string(),
            length,
            arena_angular_size: 10.0,
            arena_mode: ArenaMode::Forward,
            analog_out: vec![0.0; length * ANALOG_OUT_CHANNELS],
            digital_out: vec![0; length * DIGITAL_OUT_CHANNELS],
        }
    }

    fn set_analog_column(&mut self, col: usize, start_row: usize, wave: &[f64]) -> Result<()> {
        if start_row + wave.len() > self.length {
            return Err(EcaError::Configuration(format!(
                "Stimulus window {}..{} outside segment {} of {} samples",
                start_row,
                start_row + wave.len(),
                self.id,
                self.length
            )));
        }
        for (i, &value) in wave.iter().enumerate() {
            self.analog_out[(start_row + i) * ANALOG_OUT_CHANNELS + col] = value;
        }
        Ok(())
    }

    fn set_digital_column(&mut self, col: usize, start_row: usize, wave: &[u8]) -> Result<()> {
        if start_row + wave.len() > self.length {
            return Err(EcaError::Configuration(format!(
                "Stimulus window {}..{} outside segment {} of {} samples",
                start_row,
                start_row + wave.len(),
                self.id,
                self.length
            )));
        }
        for (i, &value) in wave.iter().enumerate() {
            self.digital_out[(start_row + i) * DIGITAL_OUT_CHANNELS + col] = value;
        }
        Ok(())
    }

    /// Speaker drive column, the one most tests and calibration care about
    pub fn speaker(&self) -> Vec<f64> {
        self.analog_out
            .iter()
            .skip(1)
            .step_by(ANALOG_OUT_CHANNELS)
            .copied()
            .collect()
    }
}

fn sample_index(seconds: f64, sampling_rate: u32) -> Result<usize> {
    if seconds < 0.0 {
        return Err(EcaError::Configuration(format!(
            "Negative stimulus offset: {}",
            seconds
        )));
    }
    Ok((seconds * sampling_rate as f64).round() as usize)
}

fn mode_from_param(param: f64) -> Result<ArenaMode> {
    if param.fract() != 0.0 {
        return Err(EcaError::Configuration(format!(
            "Arena mode must be an integer code, got {}",
            param
        )));
    }
    ArenaMode::from_code(param as i64)
}

/// Start offsets for the two stimulus channels of `msv`/`mcv`.
///
/// A positive mechanical-visual delay pushes the visual channel later, a
/// negative one pushes the mechanical channel later; the stimulus window is
/// stretched to cover whichever channel ends last.
struct DelayedWindows {
    total_s: f64,
    mechanical_start_s: f64,
    visual_start_s: f64,
}

fn delayed_windows(pr_s: f64, mech_s: f64, vis_s: f64, delay_s: f64, post_s: f64) -> DelayedWindows {
    let (stimulus_s, mechanical_start_s, visual_start_s) = if delay_s > 0.0 {
        (mech_s.max(vis_s + delay_s), pr_s, pr_s + delay_s)
    } else if delay_s < 0.0 {
        (vis_s.max(mech_s - delay_s), pr_s - delay_s, pr_s)
    } else {
        (mech_s.max(vis_s), pr_s, pr_s)
    };
    DelayedWindows {
        total_s: pr_s + stimulus_s + post_s,
        mechanical_start_s,
        visual_start_s,
    }
}

/// A recorded chirp-calibration experiment in another (read-only) store
pub struct Calibration<'a> {
    pub store: &'a DataStore,
    pub experiment: &'a str,
}

impl Calibration<'_> {
    /// Per-sample amplitude correction for a chirp with these exact
    /// parameters, or `None` when the calibration experiment holds no
    /// matching processed `mec` protocol.
    pub fn correction_for(
        &self,
        duration_s: f64,
        frequency_0: f64,
        frequency_1: f64,
        amplitude: f64,
        config: &SessionConfig,
    ) -> Result<Option<Vec<f64>>> {
        let experiment = self.store.group(self.experiment)?;
        for id in experiment.child_names() {
            let Ok((kind, params)) = parse_call(&id) else {
                continue;
            };
            if kind != GeneratorKind::MechanicalChirp
                || params[1] != duration_s
                || params[3] != frequency_0
                || params[4] != frequency_1
                || params[5] != amplitude
            {
                continue;
            }
            let processed = format!("{}/{}/{}", self.experiment, id, keys::PROCESSED_DATA);
            if !self.store.contains(&processed) {
                log::warn!(
                    "Calibration protocol {} is unprocessed; chirp left uncorrected",
                    id
                );
                return Ok(None);
            }
            let mean_movement = self
                .store
                .group(&processed)?
                .dataset(keys::MEAN_MOVEMENT)?
                .column(0)?;
            let curve = analysis::chirp_correction_curve(
                &mean_movement,
                params[0],
                duration_s,
                frequency_0,
                frequency_1,
                config.sampling_rate,
            )?;
            return Ok(Some(curve));
        }
        log::warn!(
            "No calibration chirp matching ({}, {}, {}, {}); left uncorrected",
            duration_s,
            frequency_0,
            frequency_1,
            amplitude
        );
        Ok(None)
    }
}

/// Synthesize the full output buffers for one segment id.
pub fn synthesize<R: Rng>(
    id: &str,
    config: &SessionConfig,
    calibration: Option<&Calibration>,
    rng: &mut R,
) -> Result<Segment> {
    let (kind, p) = parse_call(id)?;
    let rate = config.sampling_rate;
    match kind {
        GeneratorKind::Blank => Ok(Segment::blank(id, p[0], config)),
        GeneratorKind::BridgeBalance => {
            let mut segment = Segment::blank(id, p[0], config);
            let wave: Vec<f64> = waveform::square_wave(p[0], 3.0, 0.5, rate)
                .iter()
                .map(|v| 0.05 * v)
                .collect();
            segment.set_analog_column(0, 0, &wave)?;
            Ok(segment)
        }
        GeneratorKind::MechanicalPulse => {
            let [pre, dur, post, amplitude] = [p[0], p[1], p[2], p[3]];
            let mut segment = Segment::blank(id, pre + dur + post, config);
            let start = sample_index(pre, rate)?;
            let n = sample_index(dur, rate)?;
            segment.set_analog_column(1, start, &vec![amplitude; n])?;
            Ok(segment)
        }
        GeneratorKind::MechanicalSine => {
            let [pre, dur, post, frequency, amplitude] = [p[0], p[1], p[2], p[3], p[4]];
            let mut segment = Segment::blank(id, pre + dur + post, config);
            let wave: Vec<f64> = waveform::sine_wave(dur, frequency, rate)
                .iter()
                .map(|v| amplitude * v)
                .collect();
            segment.set_analog_column(1, sample_index(pre, rate)?, &wave)?;
            Ok(segment)
        }
        GeneratorKind::MechanicalChirp => {
            let [pre, dur, post, f0, f1, amplitude] = [p[0], p[1], p[2], p[3], p[4], p[5]];
            let correction = match calibration {
                Some(c) => c.correction_for(dur, f0, f1, amplitude, config)?,
                None => None,
            };
            let mut segment = Segment::blank(id, pre + dur + post, config);
            let wave = waveform::chirp(dur, f0, f1, amplitude, correction.as_deref(), rate);
            segment.set_analog_column(1, sample_index(pre, rate)?, &wave)?;
            Ok(segment)
        }
        GeneratorKind::MechanicalNoise => {
            let [pre, dur, post, f0, amplitude] = [p[0], p[1], p[2], p[3], p[4]];
            let mut segment = Segment::blank(id, pre + dur + post, config);
            let wave = waveform::band_limited_noise(dur, f0, amplitude * 4.0, rate, rng)?;
            segment.set_analog_column(1, sample_index(pre, rate)?, &wave)?;
            Ok(segment)
        }
        GeneratorKind::Visual => {
            let [pre, dur, post, size, mode, speed] = [p[0], p[1], p[2], p[3], p[4], p[5]];
            let mut segment = Segment::blank(id, pre + dur + post, config);
            segment.arena_angular_size = size;
            segment.arena_mode = mode_from_param(mode)?;
            let wave = waveform::to_digital(&waveform::square_wave(dur, speed, 0.5, rate));
            segment.set_digital_column(1, sample_index(pre, rate)?, &wave)?;
            Ok(segment)
        }
        GeneratorKind::VisualChirp => {
            let [pre, dur, post, size, mode, s0, s1] = [p[0], p[1], p[2], p[3], p[4], p[5], p[6]];
            let arena_mode = mode_from_param(mode)?;
            // the spot patterns cannot step at chirp rates
            if arena_mode.code() > 3 {
                return Err(EcaError::Configuration(format!(
                    "Arena chirp mode not implemented - mode: {}",
                    mode
                )));
            }
            let mut segment = Segment::blank(id, pre + dur + post, config);
            segment.arena_angular_size = size;
            segment.arena_mode = arena_mode;
            let wave = waveform::to_digital(&waveform::chirp(dur, s0, s1, 1.0, None, rate));
            segment.set_digital_column(1, sample_index(pre, rate)?, &wave)?;
            Ok(segment)
        }
        GeneratorKind::MechanicalSineVisual => {
            let [pre, mech_s, vis_s, delay, post] = [p[0], p[1], p[2], p[3], p[4]];
            let [frequency, amplitude, size, mode, speed] = [p[5], p[6], p[7], p[8], p[9]];
            let windows = delayed_windows(pre, mech_s, vis_s, delay, post);
            let mut segment = Segment::blank(id, windows.total_s, config);
            segment.arena_angular_size = size;
            segment.arena_mode = mode_from_param(mode)?;
            let visual = waveform::to_digital(&waveform::square_wave(vis_s, speed, 0.5, rate));
            segment.set_digital_column(1, sample_index(windows.visual_start_s, rate)?, &visual)?;
            let mechanical: Vec<f64> = waveform::sine_wave(mech_s, frequency, rate)
                .iter()
                .map(|v| amplitude * v)
                .collect();
            segment.set_analog_column(
                1,
                sample_index(windows.mechanical_start_s, rate)?,
                &mechanical,
            )?;
            Ok(segment)
        }
        GeneratorKind::MechanicalChirpVisual => {
            let [pre, mech_s, vis_s, delay, post] = [p[0], p[1], p[2], p[3], p[4]];
            let [f0, f1, amplitude, size, mode, speed] = [p[5], p[6], p[7], p[8], p[9], p[10]];
            let correction = match calibration {
                Some(c) => c.correction_for(mech_s, f0, f1, amplitude, config)?,
                None => None,
            };
            let windows = delayed_windows(pre, mech_s, vis_s, delay, post);
            let mut segment = Segment::blank(id, windows.total_s, config);
            segment.arena_angular_size = size;
            segment.arena_mode = mode_from_param(mode)?;
            let visual = waveform::to_digital(&waveform::square_wave(vis_s, speed, 0.5, rate));
            segment.set_digital_column(1, sample_index(windows.visual_start_s, rate)?, &visual)?;
            let mechanical =
                waveform::chirp(mech_s, f0, f1, amplitude, correction.as_deref(), rate);
            segment.set_analog_column(
                1,
                sample_index(windows.mechanical_start_s, rate)?,
                &mechanical,
            )?;
            Ok(segment)
        }
        GeneratorKind::Dye => {
            let [dur, frequency] = [p[0], p[1]];
            let mut segment = Segment::blank(id, dur, config);
            let wave = waveform::to_digital(&waveform::square_wave(dur, frequency, 0.5, rate));
            segment.set_digital_column(0, 0, &wave)?;
            Ok(segment)
        }
    }
}

/// Compile-time experiment options
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Shuffle the expanded segment list before repeating it
    pub randomize: bool,
    /// Times the (shuffled) expanded list is played back to back
    pub repeats: usize,
    /// Fixed shuffle/noise seed; fresh OS entropy when `None`
    pub seed: Option<u64>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            randomize: true,
            repeats: 1,
            seed: None,
        }
    }
}

fn write_segment(store: &mut DataStore, path: &str, segment: &Segment) -> Result<()> {
    let group = store.create_group(path)?;
    group.set_attr(
        keys::ARENA_ANGULAR_SIZE,
        AttrValue::Float(segment.arena_angular_size),
    );
    group.set_attr(
        keys::ARENA_MODE,
        AttrValue::Text(segment.arena_mode.label().to_string()),
    );
    group.set_attr(keys::NUMBER_OF_SAMPLES, AttrValue::Int(segment.length as i64));
    group.create_dataset(
        keys::ANALOG_OUT,
        Dataset::from_floats(ANALOG_OUT_CHANNELS, segment.analog_out.clone())?,
    )?;
    group.create_dataset(
        keys::DIGITAL_OUT,
        Dataset::from_bytes(DIGITAL_OUT_CHANNELS, segment.digital_out.clone())?,
    )?;
    Ok(())
}

/// Compile a protocol string into the store under `name`.
///
/// Ensures the store-wide warmup segment (`bla(5)`) and the cooldown link
/// exist, expands and synthesizes the protocol, persists unique segments
/// with their attributes, and records the realized timeline and its
/// boundary table on the experiment group. Fails without touching the
/// experiment if one with this name already exists.
///
/// `calibration` must live in a different store than the one compiled into.
pub fn add_experiment(
    store: &mut DataStore,
    name: &str,
    protocol_string: &str,
    options: &CompileOptions,
    config: &SessionConfig,
    calibration: Option<&Calibration>,
) -> Result<CompiledExperiment> {
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    if store.contains(name) {
        return Err(EcaError::DuplicateExperiment(name.to_string()));
    }

    // validate the whole protocol before creating anything
    let mut expanded = expand_protocol(protocol_string)?;
    if expanded.is_empty() {
        return Err(EcaError::Configuration(
            "Protocol string expands to no segments".to_string(),
        ));
    }
    for id in &expanded {
        parse_call(id)?;
    }

    if !store.contains(keys::WARMUP) {
        let warmup = synthesize("bla(5)", config, None, &mut rng)?;
        write_segment(store, keys::WARMUP, &warmup)?;
    }
    if !store.contains(keys::COOLDOWN) {
        store.create_link(keys::COOLDOWN, &format!("/{}", keys::WARMUP))?;
    }

    if options.randomize {
        expanded.shuffle(&mut rng);
    }
    let mut unique: Vec<String> = Vec::new();
    for id in &expanded {
        if !unique.contains(id) {
            unique.push(id.clone());
        }
    }

    let experiment = store.create_group(name)?;
    experiment.set_attr(keys::TITLE, AttrValue::Text(name.to_string()));
    experiment.set_attr(
        keys::PROTOCOL_STRING,
        AttrValue::Text(protocol_string.to_string()),
    );
    experiment.set_attr(keys::RANDOMIZED, AttrValue::Bool(options.randomize));
    experiment.set_attr(keys::REPEATS, AttrValue::Int(options.repeats as i64));
    experiment.set_attr(
        keys::CREATED_AT,
        AttrValue::Text(chrono::Utc::now().to_rfc3339()),
    );

    for id in &unique {
        let segment = synthesize(id, config, calibration, &mut rng)?;
        write_segment(store, &format!("{}/{}", name, id), &segment)?;
    }
    store.create_link(
        &format!("{}/{}", name, keys::WARMUP),
        &format!("/{}", keys::WARMUP),
    )?;
    store.create_link(
        &format!("{}/{}", name, keys::COOLDOWN),
        &format!("/{}", keys::COOLDOWN),
    )?;

    let mut timeline: Vec<String> = vec![keys::WARMUP.to_string()];
    for _ in 0..options.repeats {
        timeline.extend(expanded.iter().cloned());
    }
    timeline.push(keys::COOLDOWN.to_string());

    let mut boundaries: Vec<u64> = vec![0];
    for id in &timeline {
        let length = store
            .group(&format!("{}/{}", name, id))?
            .int_attr(keys::NUMBER_OF_SAMPLES)
            .ok_or_else(|| EcaError::Store(format!("Segment {} has no sample count", id)))?;
        boundaries.push(boundaries.last().unwrap() + length as u64);
    }

    let experiment = store.group_mut(name)?;
    experiment.set_attr(keys::PROTOCOL_LIST, AttrValue::TextList(timeline));
    experiment.set_attr(keys::TRIAL_END_POINTS, AttrValue::IntList(boundaries));

    log::info!(
        "Compiled experiment {} ({} unique segments)",
        name,
        unique.len()
    );
    CompiledExperiment::load(store, name)
}

/// A compiled experiment loaded back out of the store: the realized
/// timeline, its boundary table and the unique segment buffers.
#[derive(Debug)]
pub struct CompiledExperiment {
    name: String,
    timeline: Vec<String>,
    boundaries: Vec<u64>,
    segments: HashMap<String, Arc<Segment>>,
}

impl CompiledExperiment {
    pub fn load(store: &DataStore, name: &str) -> Result<Self> {
        let experiment = store.group(name)?;
        let timeline: Vec<String> = experiment
            .text_list_attr(keys::PROTOCOL_LIST)
            .ok_or_else(|| EcaError::Store(format!("Experiment {} has no timeline", name)))?
            .to_vec();
        let boundaries: Vec<u64> = experiment
            .int_list_attr(keys::TRIAL_END_POINTS)
            .ok_or_else(|| EcaError::Store(format!("Experiment {} has no boundary table", name)))?
            .to_vec();
        if boundaries.len() != timeline.len() + 1 {
            return Err(EcaError::Store(format!(
                "Experiment {}: {} boundaries for {} timeline entries",
                name,
                boundaries.len(),
                timeline.len()
            )));
        }

        let mut segments: HashMap<String, Arc<Segment>> = HashMap::new();
        for id in &timeline {
            if segments.contains_key(id) {
                continue;
            }
            let group = store.group(&format!("{}/{}", name, id))?;
            let length = group
                .int_attr(keys::NUMBER_OF_SAMPLES)
                .ok_or_else(|| EcaError::Store(format!("Segment {} has no sample count", id)))?
                as usize;
            let arena_mode = ArenaMode::from_label(
                group
                    .text_attr(keys::ARENA_MODE)
                    .ok_or_else(|| EcaError::Store(format!("Segment {} has no arena mode", id)))?,
            )?;
            let segment = Segment {
                id: id.clone(),
                length,
                arena_angular_size: group.float_attr(keys::ARENA_ANGULAR_SIZE).unwrap_or(10.0),
                arena_mode,
                analog_out: group.dataset(keys::ANALOG_OUT)?.float_data()?.to_vec(),
                digital_out: group.dataset(keys::DIGITAL_OUT)?.byte_data()?.to_vec(),
            };
            segments.insert(id.clone(), Arc::new(segment));
        }

        // boundary deltas must match the stored segment lengths
        for (i, id) in timeline.iter().enumerate() {
            let expected = (boundaries[i + 1] - boundaries[i]) as usize;
            if segments[id].length != expected {
                return Err(EcaError::Store(format!(
                    "Segment {} is {} samples but the boundary table says {}",
                    id, segments[id].length, expected
                )));
            }
        }

        Ok(Self {
            name: name.to_string(),
            timeline,
            boundaries,
            segments,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeline(&self) -> &[String] {
        &self.timeline
    }

    pub fn boundaries(&self) -> &[u64] {
        &self.boundaries
    }

    pub fn total_samples(&self) -> u64 {
        *self.boundaries.last().unwrap_or(&0)
    }

    pub fn segment_id(&self, index: usize) -> &str {
        &self.timeline[index]
    }

    pub fn segment(&self, index: usize) -> &Arc<Segment> {
        &self.segments[&self.timeline[index]]
    }

    /// Wall-clock duration of the whole timeline, in whole seconds
    pub fn duration_s(&self, config: &SessionConfig) -> u64 {
        self.total_samples() / config.sampling_rate as u64
    }
}
