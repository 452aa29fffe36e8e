//! Ambisonic decoding engine - public context object
//!
//! [`AmbiEngine`] is shared between a real-time render thread and one or
//! more control threads (typically behind an `Arc`):
//! - setters store render-time parameters in atomics and decoder-affecting
//!   parameters in a pending [`Configuration`], flipping the codec status to
//!   `NotInitialised` when a rebuild is needed
//! - [`AmbiEngine::init_codec`] rebuilds decoders and HRTFs outside any lock
//!   the render path takes, then moves the result into the render state
//! - [`AmbiEngine::process`] renders only while the codec is `Initialised`
//!   and emits silence otherwise

use std::sync::Arc;

use ndarray::{Array2, Array3, s};
use num_complex::Complex32;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicF32, AtomicU8, AtomicU32, Ordering};

use rf_filterbank::{FILTERBANK_DELAY, FRAME_SIZE, NUM_BANDS, SampleRate, band_centre_frequencies};

use crate::binaural::{HrirLoader, HrirPreProc, HrirSource, HrtfSet};
use crate::config::{Configuration, FrameMode, HIGH_SLOT, LOW_SLOT, OutputLayout, clamp_crossover};
use crate::error::{AmbiError, AmbiResult};
use crate::hoa::{
    AmbisonicFormat, AmbisonicOrder, BinauralDecoder, ChannelOrdering, DecodingMethod, DiffuseEq, LoudspeakerDecoder, MAX_ORDER,
    Normalization, RotationSettings,
};
use crate::position::Direction;
use crate::render::{Codec, FrameParams, RenderCore, RenderState};
use crate::state::{CodecStatus, EngineState, ProcStatus};

// ============ Atomic Encodings ============

fn ordering_to_u8(o: ChannelOrdering) -> u8 {
    match o {
        ChannelOrdering::ACN => 0,
        ChannelOrdering::FuMa => 1,
    }
}

fn ordering_from_u8(v: u8) -> ChannelOrdering {
    if v == 1 { ChannelOrdering::FuMa } else { ChannelOrdering::ACN }
}

fn normalization_to_u8(n: Normalization) -> u8 {
    match n {
        Normalization::N3D => 0,
        Normalization::SN3D => 1,
        Normalization::FuMa => 2,
    }
}

fn normalization_from_u8(v: u8) -> Normalization {
    match v {
        0 => Normalization::N3D,
        2 => Normalization::FuMa,
        _ => Normalization::SN3D,
    }
}

fn eq_to_u8(eq: DiffuseEq) -> u8 {
    match eq {
        DiffuseEq::Amplitude => 0,
        DiffuseEq::Energy => 1,
    }
}

fn eq_from_u8(v: u8) -> DiffuseEq {
    if v == 1 { DiffuseEq::Energy } else { DiffuseEq::Amplitude }
}

// ============ Render-Time Parameters ============

/// Parameters read by the render path at every frame
struct RenderParams {
    ordering: AtomicU8,
    normalization: AtomicU8,
    crossover_hz: AtomicF32,
    max_re: [AtomicBool; 2],
    diffuse_eq: [AtomicU8; 2],
    yaw: AtomicF32,
    pitch: AtomicF32,
    roll: AtomicF32,
    flip_yaw: AtomicBool,
    flip_pitch: AtomicBool,
    flip_roll: AtomicBool,
    rpy_order: AtomicBool,
    rotation_enabled: AtomicBool,
    rotation_dirty: AtomicBool,
    band_orders: [AtomicU8; NUM_BANDS],
    exact_frames: AtomicBool,
}

impl RenderParams {
    fn new(config: &Configuration) -> Self {
        let params = Self {
            ordering: AtomicU8::new(0),
            normalization: AtomicU8::new(0),
            crossover_hz: AtomicF32::new(0.0),
            max_re: [AtomicBool::new(true), AtomicBool::new(true)],
            diffuse_eq: [AtomicU8::new(0), AtomicU8::new(0)],
            yaw: AtomicF32::new(0.0),
            pitch: AtomicF32::new(0.0),
            roll: AtomicF32::new(0.0),
            flip_yaw: AtomicBool::new(false),
            flip_pitch: AtomicBool::new(false),
            flip_roll: AtomicBool::new(false),
            rpy_order: AtomicBool::new(false),
            rotation_enabled: AtomicBool::new(true),
            rotation_dirty: AtomicBool::new(true),
            band_orders: std::array::from_fn(|_| AtomicU8::new(MAX_ORDER as u8)),
            exact_frames: AtomicBool::new(false),
        };
        params.store(config);
        params
    }

    /// Mirror the render-time fields of `config`
    fn store(&self, config: &Configuration) {
        self.ordering.store(ordering_to_u8(config.format.ordering), Ordering::Relaxed);
        self.normalization
            .store(normalization_to_u8(config.format.normalization), Ordering::Relaxed);
        self.crossover_hz.store(config.crossover_hz, Ordering::Relaxed);
        for slot in [LOW_SLOT, HIGH_SLOT] {
            self.max_re[slot].store(config.decoders[slot].max_re, Ordering::Relaxed);
            self.diffuse_eq[slot].store(eq_to_u8(config.decoders[slot].diffuse_eq), Ordering::Relaxed);
        }
        self.store_rotation(&config.rotation);
        for (band, atomic) in self.band_orders.iter().enumerate() {
            let order = config
                .band_orders
                .as_ref()
                .and_then(|orders| orders.get(band).copied())
                .unwrap_or(MAX_ORDER);
            atomic.store(order.clamp(1, MAX_ORDER) as u8, Ordering::Relaxed);
        }
        self.exact_frames
            .store(config.frame_mode == FrameMode::Exact, Ordering::Relaxed);
    }

    fn store_rotation(&self, rotation: &RotationSettings) {
        self.yaw.store(rotation.yaw, Ordering::Relaxed);
        self.pitch.store(rotation.pitch, Ordering::Relaxed);
        self.roll.store(rotation.roll, Ordering::Relaxed);
        self.flip_yaw.store(rotation.flip_yaw, Ordering::Relaxed);
        self.flip_pitch.store(rotation.flip_pitch, Ordering::Relaxed);
        self.flip_roll.store(rotation.flip_roll, Ordering::Relaxed);
        self.rpy_order.store(rotation.rpy_order, Ordering::Relaxed);
        self.rotation_dirty.store(true, Ordering::Release);
    }

    fn rotation(&self) -> RotationSettings {
        RotationSettings {
            yaw: self.yaw.load(Ordering::Relaxed),
            pitch: self.pitch.load(Ordering::Relaxed),
            roll: self.roll.load(Ordering::Relaxed),
            flip_yaw: self.flip_yaw.load(Ordering::Relaxed),
            flip_pitch: self.flip_pitch.load(Ordering::Relaxed),
            flip_roll: self.flip_roll.load(Ordering::Relaxed),
            rpy_order: self.rpy_order.load(Ordering::Relaxed),
        }
    }

    /// Block snapshot without rotation; each frame reads that through [`take_rotation`](Self::take_rotation)
    fn snapshot(&self) -> FrameParams {
        let mut band_orders = [MAX_ORDER as u8; NUM_BANDS];
        for (dst, src) in band_orders.iter_mut().zip(&self.band_orders) {
            *dst = src.load(Ordering::Relaxed);
        }

        FrameParams {
            format: AmbisonicFormat {
                ordering: ordering_from_u8(self.ordering.load(Ordering::Relaxed)),
                normalization: normalization_from_u8(self.normalization.load(Ordering::Relaxed)),
            },
            crossover_hz: self.crossover_hz.load(Ordering::Relaxed),
            max_re: [
                self.max_re[LOW_SLOT].load(Ordering::Relaxed),
                self.max_re[HIGH_SLOT].load(Ordering::Relaxed),
            ],
            diffuse_eq: [
                eq_from_u8(self.diffuse_eq[LOW_SLOT].load(Ordering::Relaxed)),
                eq_from_u8(self.diffuse_eq[HIGH_SLOT].load(Ordering::Relaxed)),
            ],
            rotation: None,
            rotation_dirty: false,
            band_orders,
        }
    }

    /// Clear the dirty flag, then read the angles
    ///
    /// Setters store the angles before raising the flag, so angles read
    /// after a successful swap are at least as new as the change that set
    /// it. A change landing after the swap raises the flag again and is
    /// picked up by the next frame.
    fn take_rotation(&self) -> (bool, Option<RotationSettings>) {
        let dirty = self.rotation_dirty.swap(false, Ordering::Acquire);
        let rotation = self.rotation();
        let enabled = self.rotation_enabled.load(Ordering::Relaxed) && !rotation.is_identity();
        (dirty, enabled.then_some(rotation))
    }
}

// ============ Control State ============

/// What an HRTF set was built from
#[derive(Debug, Clone, PartialEq)]
struct HrtfKey {
    source: HrirSource,
    preproc: HrirPreProc,
    rate: SampleRate,
    custom_loader: bool,
}

/// Control-path caches, guarded by the rebuild lock
#[derive(Default)]
struct ControlState {
    hrtf: Option<(HrtfKey, Arc<HrtfSet>)>,
    /// Interpolated `[band, ear]` HRTF per loudspeaker direction
    speaker_hrtfs: Vec<(Direction, Array2<Complex32>)>,
    custom_loader: Option<Arc<dyn HrirLoader>>,
}

impl ControlState {
    /// Processed HRTF set for `config`, reusing the cached one when nothing changed
    fn hrtf_set(&mut self, config: &Configuration, rate: SampleRate, fallback: &AtomicBool) -> AmbiResult<Arc<HrtfSet>> {
        let key = HrtfKey {
            source: config.hrir_source.clone(),
            preproc: config.hrir_preproc,
            rate,
            custom_loader: self.custom_loader.is_some(),
        };
        if let Some((cached_key, set)) = &self.hrtf {
            if *cached_key == key {
                return Ok(Arc::clone(set));
            }
        }

        let set = match &self.custom_loader {
            Some(loader) => HrtfSet::load(loader.as_ref(), rate, config.hrir_preproc)?,
            None => HrtfSet::load(config.hrir_source.loader().as_ref(), rate, config.hrir_preproc)?,
        };
        if set.is_fallback() {
            fallback.store(true, Ordering::Release);
        }

        let set = Arc::new(set);
        self.hrtf = Some((key, Arc::clone(&set)));
        self.speaker_hrtfs.clear();
        Ok(set)
    }

    /// `[band, ear, loudspeaker]` HRTFs, interpolating only directions not cached
    fn speaker_hrtfs(&mut self, set: &HrtfSet, directions: &[Direction]) -> Array3<Complex32> {
        let mut table = Array3::<Complex32>::zeros((NUM_BANDS, 2, directions.len()));

        for (l, dir) in directions.iter().enumerate() {
            let index = match self.speaker_hrtfs.iter().position(|(d, _)| d == dir) {
                Some(index) => index,
                None => {
                    let mut hrtf = Array2::<Complex32>::zeros((NUM_BANDS, 2));
                    set.interpolate(dir, hrtf.view_mut());
                    self.speaker_hrtfs.push((*dir, hrtf));
                    self.speaker_hrtfs.len() - 1
                }
            };
            table.slice_mut(s![.., .., l]).assign(&self.speaker_hrtfs[index].1);
        }

        // Drop directions no longer in the layout
        self.speaker_hrtfs.retain(|(d, _)| directions.contains(d));
        table
    }
}

// ============ Engine ============

/// Frequency-domain Ambisonic decoder for loudspeakers and headphones
pub struct AmbiEngine {
    state: EngineState,
    params: RenderParams,
    sample_rate: AtomicU32,
    /// Default HRIRs replaced a source that failed to load
    hrir_fallback: AtomicBool,
    shut_down: AtomicBool,
    pending: Mutex<Configuration>,
    /// Only ever `try_lock`ed by the render path
    render: Mutex<RenderState>,
    /// Serializes rebuilds and guards control-path caches
    control: Mutex<ControlState>,
}

impl Default for AmbiEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AmbiEngine {
    /// Create engine with the default configuration (not yet initialised)
    pub fn new() -> Self {
        Self::with_config(Configuration::default())
    }

    /// Create engine from a configuration
    pub fn with_config(config: Configuration) -> Self {
        let config = config.sanitised();
        let rate = SampleRate::default();
        Self {
            state: EngineState::new(),
            params: RenderParams::new(&config),
            sample_rate: AtomicU32::new(rate.hz()),
            hrir_fallback: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            pending: Mutex::new(config),
            render: Mutex::new(RenderState::new(band_centre_frequencies(rate))),
            control: Mutex::new(ControlState::default()),
        }
    }

    // ============ Lifecycle ============

    /// Select the host sample rate (nearest of 44.1/48 kHz)
    ///
    /// Cheap: only sets the band frequencies. HRTFs depend on the rate, so
    /// binaural decoders are rebuilt on the next [`init_codec`](Self::init_codec).
    pub fn init(&self, sample_rate: u32) {
        let rate = SampleRate::nearest(sample_rate);
        let previous = self.sample_rate.swap(rate.hz(), Ordering::AcqRel);
        if previous != rate.hz() {
            log::info!("Sample rate {} Hz (requested {})", rate.hz(), sample_rate);
            self.state.invalidate();
        }

        self.state.wait_for_render_idle();
        let mut render = self.render.lock();
        render.core.set_freqs(band_centre_frequencies(rate));
        render.core.clear();
        render.adapter.reset();
    }

    /// Rebuild decoders (and HRTFs if needed) from the pending configuration
    ///
    /// Returns `true` when the engine ends up `Initialised`. Returns `false`
    /// when the rebuild failed, when the engine is shut down, or when the
    /// configuration changed while building (call again).
    pub fn init_codec(&self) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }

        let mut control = self.control.lock();
        if !self.state.try_begin_init() {
            return self.state.codec_status() == CodecStatus::Initialised;
        }

        let config = self.pending.lock().sanitised();
        let rate = self.rate();

        let codec = match self.build_codec(&mut control, &config, rate) {
            Ok(codec) => codec,
            Err(e) => {
                log::warn!("Codec rebuild failed: {}", e);
                self.state.abort_init();
                return false;
            }
        };
        drop(control);

        log::info!(
            "Codec ready: order {}, {} outputs{}",
            codec.order(),
            codec.num_outputs(),
            if codec.is_binaural() { " (binaural)" } else { "" }
        );

        self.state.wait_for_render_idle();
        {
            let mut render = self.render.lock();
            render.core.install(codec);
            render.adapter.reset();
        }
        self.params.rotation_dirty.store(true, Ordering::Release);

        if self.state.finish_init() {
            true
        } else {
            log::debug!("Configuration changed during rebuild, codec left uninitialised");
            false
        }
    }

    fn build_codec(&self, control: &mut ControlState, config: &Configuration, rate: SampleRate) -> AmbiResult<Codec> {
        match config.output.loudspeakers() {
            None => {
                let hrtfs = control.hrtf_set(config, rate, &self.hrir_fallback)?;
                let decoder = BinauralDecoder::build(&hrtfs, config.order, config.diffuse_matching)?;
                if !decoder.is_finite() {
                    return Err(AmbiError::Numerical("binaural decoder is not finite".into()));
                }
                Ok(Codec::binaural(&decoder))
            }
            Some(directions) => {
                let low = LoudspeakerDecoder::build(&directions, config.order, config.decoders[LOW_SLOT].method)?;
                let high = if config.decoders[HIGH_SLOT].method == config.decoders[LOW_SLOT].method {
                    low.clone()
                } else {
                    LoudspeakerDecoder::build(&directions, config.order, config.decoders[HIGH_SLOT].method)?
                };
                for decoder in [&low, &high] {
                    if decoder.virtual_outputs > 0 {
                        log::debug!("{:?} decoder used {} virtual points", decoder.method, decoder.virtual_outputs);
                    }
                }

                let codec = Codec::loudspeaker(&low, &high);
                if config.binauralise_loudspeakers {
                    let hrtfs = control.hrtf_set(config, rate, &self.hrir_fallback)?;
                    let table = control.speaker_hrtfs(&hrtfs, &directions);
                    Ok(codec.with_speaker_hrtfs(table))
                } else {
                    Ok(codec)
                }
            }
        }
    }

    /// Stop rendering and release the codec; blocks until no frame is in flight
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.invalidate();
        let _control = self.control.lock();
        self.state.wait_for_render_idle();
        let mut render = self.render.lock();
        render.core.uninstall();
        render.adapter.reset();
        log::debug!("Engine shut down");
    }

    // ============ Render ============

    /// Render one host block
    ///
    /// `inputs` holds Ambisonic channels in the configured format, `outputs`
    /// loudspeaker or ear channels. Only the first `num_inputs`/`num_outputs`
    /// entries and `num_samples` samples are used. Never blocks or allocates;
    /// emits silence while the codec is not `Initialised`.
    pub fn process<I, O>(&self, inputs: &[I], outputs: &mut [O], num_inputs: usize, num_outputs: usize, num_samples: usize)
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        let inputs = &inputs[..num_inputs.min(inputs.len())];
        let num_outputs = num_outputs.min(outputs.len());
        let outputs = &mut outputs[..num_outputs];

        let Some(mut render) = self.render.try_lock() else {
            silence(outputs, num_samples);
            return;
        };

        let base = self.params.snapshot();
        let RenderState { adapter, core } = &mut *render;

        if self.params.exact_frames.load(Ordering::Relaxed) {
            if num_samples != FRAME_SIZE {
                silence(outputs, num_samples);
                return;
            }
            if !self.render_frame(core, inputs, outputs, base) {
                silence(outputs, num_samples);
            }
        } else {
            adapter.process_block(inputs, outputs, num_samples, |frame_in, frame_out| {
                self.render_frame(core, frame_in, frame_out, base)
            });
        }
    }

    fn render_frame<I, O>(&self, core: &mut RenderCore, inputs: &[I], outputs: &mut [O], base: FrameParams) -> bool
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        self.state.enter_frame();
        let rendered = if self.state.codec_status() == CodecStatus::Initialised {
            let (rotation_dirty, rotation) = self.params.take_rotation();
            let params = FrameParams {
                rotation,
                rotation_dirty,
                ..base
            };
            core.process_frame(inputs, outputs, &params)
        } else {
            false
        };
        self.state.leave_frame();
        rendered
    }

    // ============ Status ============

    pub fn codec_status(&self) -> CodecStatus {
        self.state.codec_status()
    }

    pub fn proc_status(&self) -> ProcStatus {
        self.state.proc_status()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    fn rate(&self) -> SampleRate {
        SampleRate::nearest(self.sample_rate())
    }

    /// Total latency in samples
    pub fn delay(&self) -> usize {
        if self.params.exact_frames.load(Ordering::Relaxed) {
            FILTERBANK_DELAY
        } else {
            FILTERBANK_DELAY + FRAME_SIZE
        }
    }

    /// True once the default HRIRs had to replace a source that failed to load
    pub fn using_default_hrirs_fallback(&self) -> bool {
        self.hrir_fallback.load(Ordering::Acquire)
    }

    /// Output channels the current configuration produces
    pub fn num_outputs(&self) -> usize {
        let config = self.pending.lock();
        match config.output.loudspeakers() {
            None => 2,
            Some(_) if config.binauralise_loudspeakers => 2,
            Some(dirs) => dirs.len(),
        }
    }

    /// Ambisonic input channels the current order expects
    pub fn num_inputs(&self) -> usize {
        AmbisonicOrder::clamped(self.order()).channel_count()
    }

    // ============ Configuration ============

    /// Snapshot of the configuration (pending values included)
    pub fn config(&self) -> Configuration {
        let mut config = self.pending.lock().clone();
        config.rotation = self.params.rotation();
        config
    }

    /// Replace the whole configuration
    pub fn apply_config(&self, config: Configuration) {
        let config = config.sanitised();
        let mut pending = self.pending.lock();

        let rebuild = pending.order != config.order
            || pending.decoders.iter().zip(&config.decoders).any(|(a, b)| a.method != b.method)
            || pending.diffuse_matching != config.diffuse_matching
            || pending.output != config.output
            || pending.binauralise_loudspeakers != config.binauralise_loudspeakers
            || pending.hrir_source != config.hrir_source
            || pending.hrir_preproc != config.hrir_preproc;
        if pending.hrir_source != config.hrir_source {
            self.hrir_fallback.store(false, Ordering::Release);
        }

        self.params.store(&config);
        log_format_clamp(config.format, config.order);
        *pending = config;
        drop(pending);

        if rebuild {
            self.state.invalidate();
        }
    }

    fn update(&self, rebuild: bool, f: impl FnOnce(&mut Configuration)) {
        f(&mut self.pending.lock());
        if rebuild {
            self.state.invalidate();
        }
    }

    // ============ Order ============

    /// Set the master order (clamped to 1-7)
    pub fn set_order(&self, order: usize) {
        let order = AmbisonicOrder::clamped(order).as_usize();
        let format = {
            let mut pending = self.pending.lock();
            if pending.order == order {
                return;
            }
            pending.order = order;
            pending.format
        };
        log_format_clamp(format, order);
        self.state.invalidate();
    }

    pub fn order(&self) -> usize {
        self.pending.lock().order
    }

    /// Set the order of one band (clamped to the master order at render time)
    pub fn set_band_order(&self, band: usize, order: usize) {
        let Some(atomic) = self.params.band_orders.get(band) else {
            return;
        };
        let order = order.clamp(1, MAX_ORDER);
        atomic.store(order as u8, Ordering::Relaxed);
        self.update(false, |c| {
            let orders = c.band_orders.get_or_insert_with(|| vec![MAX_ORDER; NUM_BANDS]);
            orders.resize(NUM_BANDS, MAX_ORDER);
            orders[band] = order;
        });
    }

    pub fn band_order(&self, band: usize) -> usize {
        self.params
            .band_orders
            .get(band)
            .map_or(MAX_ORDER, |a| a.load(Ordering::Relaxed) as usize)
    }

    // ============ Input Format ============

    pub fn set_channel_ordering(&self, ordering: ChannelOrdering) {
        self.params.ordering.store(ordering_to_u8(ordering), Ordering::Relaxed);
        let (format, order) = {
            let mut pending = self.pending.lock();
            pending.format.ordering = ordering;
            (pending.format, pending.order)
        };
        log_format_clamp(format, order);
    }

    pub fn set_normalization(&self, normalization: Normalization) {
        self.params
            .normalization
            .store(normalization_to_u8(normalization), Ordering::Relaxed);
        let (format, order) = {
            let mut pending = self.pending.lock();
            pending.format.normalization = normalization;
            (pending.format, pending.order)
        };
        log_format_clamp(format, order);
    }

    pub fn format(&self) -> AmbisonicFormat {
        self.pending.lock().format
    }

    // ============ Decoders ============

    /// Decoding method of a slot (0 = low, 1 = high)
    pub fn set_decoding_method(&self, slot: usize, method: DecodingMethod) {
        let slot = slot.min(HIGH_SLOT);
        let changed = {
            let mut pending = self.pending.lock();
            let changed = pending.decoders[slot].method != method;
            pending.decoders[slot].method = method;
            changed
        };
        if changed {
            self.state.invalidate();
        }
    }

    pub fn decoding_method(&self, slot: usize) -> DecodingMethod {
        self.pending.lock().decoders[slot.min(HIGH_SLOT)].method
    }

    pub fn set_max_re(&self, slot: usize, enabled: bool) {
        let slot = slot.min(HIGH_SLOT);
        self.params.max_re[slot].store(enabled, Ordering::Relaxed);
        self.update(false, |c| c.decoders[slot].max_re = enabled);
    }

    pub fn max_re(&self, slot: usize) -> bool {
        self.params.max_re[slot.min(HIGH_SLOT)].load(Ordering::Relaxed)
    }

    pub fn set_diffuse_eq(&self, slot: usize, eq: DiffuseEq) {
        let slot = slot.min(HIGH_SLOT);
        self.params.diffuse_eq[slot].store(eq_to_u8(eq), Ordering::Relaxed);
        self.update(false, |c| c.decoders[slot].diffuse_eq = eq);
    }

    pub fn diffuse_eq(&self, slot: usize) -> DiffuseEq {
        eq_from_u8(self.params.diffuse_eq[slot.min(HIGH_SLOT)].load(Ordering::Relaxed))
    }

    pub fn set_diffuse_matching(&self, enabled: bool) {
        self.update(true, |c| c.diffuse_matching = enabled);
    }

    /// Crossover between the low and high decoder, clamped to 500-2000 Hz
    pub fn set_crossover(&self, hz: f32) {
        let hz = clamp_crossover(hz);
        self.params.crossover_hz.store(hz, Ordering::Relaxed);
        self.update(false, |c| c.crossover_hz = hz);
    }

    pub fn crossover(&self) -> f32 {
        self.params.crossover_hz.load(Ordering::Relaxed)
    }

    // ============ Rotation ============

    /// Yaw, pitch and roll in degrees
    pub fn set_rotation(&self, yaw: f32, pitch: f32, roll: f32) {
        let finite = |x: f32| if x.is_finite() { x } else { 0.0 };
        let settings = RotationSettings {
            yaw: finite(yaw),
            pitch: finite(pitch),
            roll: finite(roll),
            ..self.params.rotation()
        };
        self.set_rotation_settings(settings);
    }

    /// Rotation from a quaternion (yaw-pitch-roll composition, flips cleared)
    pub fn set_rotation_quaternion(&self, q: &nalgebra::UnitQuaternion<f64>) {
        self.set_rotation_settings(RotationSettings::from_quaternion(q));
    }

    pub fn set_rotation_settings(&self, settings: RotationSettings) {
        self.params.store_rotation(&settings);
        self.update(false, |c| c.rotation = settings);
    }

    pub fn set_flips(&self, yaw: bool, pitch: bool, roll: bool) {
        let settings = RotationSettings {
            flip_yaw: yaw,
            flip_pitch: pitch,
            flip_roll: roll,
            ..self.params.rotation()
        };
        self.set_rotation_settings(settings);
    }

    pub fn set_rpy_order(&self, enabled: bool) {
        let settings = RotationSettings {
            rpy_order: enabled,
            ..self.params.rotation()
        };
        self.set_rotation_settings(settings);
    }

    pub fn set_rotation_enabled(&self, enabled: bool) {
        self.params.rotation_enabled.store(enabled, Ordering::Relaxed);
        self.params.rotation_dirty.store(true, Ordering::Release);
    }

    pub fn rotation(&self) -> RotationSettings {
        self.params.rotation()
    }

    // ============ Output ============

    pub fn set_output_layout(&self, layout: OutputLayout) {
        let layout = match layout {
            OutputLayout::Custom(dirs) if dirs.is_empty() => {
                log::warn!("Empty loudspeaker layout ignored");
                return;
            }
            OutputLayout::Custom(mut dirs) => {
                if dirs.len() > crate::MAX_LOUDSPEAKERS {
                    log::warn!("Layout of {} loudspeakers truncated to {}", dirs.len(), crate::MAX_LOUDSPEAKERS);
                    dirs.truncate(crate::MAX_LOUDSPEAKERS);
                }
                OutputLayout::Custom(dirs.iter().map(|d| d.wrapped()).collect())
            }
            other => other,
        };
        self.update(true, |c| c.output = layout);
    }

    pub fn output_layout(&self) -> OutputLayout {
        self.pending.lock().output.clone()
    }

    pub fn set_binauralise_loudspeakers(&self, enabled: bool) {
        self.update(true, |c| c.binauralise_loudspeakers = enabled);
    }

    pub fn set_frame_mode(&self, mode: FrameMode) {
        self.params.exact_frames.store(mode == FrameMode::Exact, Ordering::Relaxed);
        self.update(false, |c| c.frame_mode = mode);
    }

    // ============ HRIRs ============

    pub fn set_hrir_source(&self, source: HrirSource) {
        self.hrir_fallback.store(false, Ordering::Release);
        self.update(true, |c| c.hrir_source = source);
    }

    pub fn set_hrir_preproc(&self, preproc: HrirPreProc) {
        self.update(true, |c| c.hrir_preproc = preproc);
    }

    /// Use `loader` instead of the configured HRIR source (`None` restores it)
    pub fn set_custom_hrir_loader(&self, loader: Option<Arc<dyn HrirLoader>>) {
        {
            let mut control = self.control.lock();
            control.custom_loader = loader;
            control.hrtf = None;
            control.speaker_hrtfs.clear();
        }
        self.hrir_fallback.store(false, Ordering::Release);
        self.state.invalidate();
    }
}

impl Drop for AmbiEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn silence<O: AsMut<[f32]>>(outputs: &mut [O], num_samples: usize) {
    for out in outputs.iter_mut() {
        let out = out.as_mut();
        let n = num_samples.min(out.len());
        out[..n].fill(0.0);
    }
}

fn log_format_clamp(format: AmbisonicFormat, order: usize) {
    let effective = format.effective(order);
    if effective != format {
        log::info!(
            "{:?}/{:?} is first order only, using {:?}/{:?} at order {}",
            format.ordering,
            format.normalization,
            effective.ordering,
            effective.normalization,
            order
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LoudspeakerPreset;

    #[test]
    fn test_starts_uninitialised() {
        let engine = AmbiEngine::new();
        assert_eq!(engine.codec_status(), CodecStatus::NotInitialised);
        assert_eq!(engine.delay(), FILTERBANK_DELAY + FRAME_SIZE);
        assert_eq!(engine.num_outputs(), 2);
    }

    #[test]
    fn test_rotation_read_once_per_change() {
        let params = RenderParams::new(&Configuration::default());
        params.take_rotation();
        assert_eq!(params.take_rotation(), (false, None));

        params.store_rotation(&RotationSettings {
            yaw: 45.0,
            ..Default::default()
        });
        let (dirty, rotation) = params.take_rotation();
        assert!(dirty);
        assert_eq!(rotation.map(|r| r.yaw), Some(45.0));

        let (dirty, rotation) = params.take_rotation();
        assert!(!dirty);
        assert_eq!(rotation.map(|r| r.yaw), Some(45.0));
    }

    #[test]
    fn test_rendered_frame_consumes_rotation_change() {
        let engine = AmbiEngine::new();
        engine.set_order(1);
        engine.set_output_layout(crate::OutputLayout::Preset(LoudspeakerPreset::Octagon));
        assert!(engine.init_codec());

        let inputs = vec![vec![0.0f32; FRAME_SIZE]; 4];
        let mut outputs = vec![vec![0.0f32; FRAME_SIZE]; 8];
        engine.process(&inputs, &mut outputs, 4, 8, FRAME_SIZE);

        engine.set_rotation(90.0, 0.0, 0.0);
        engine.process(&inputs, &mut outputs, 4, 8, FRAME_SIZE);
        let (dirty, rotation) = engine.params.take_rotation();
        assert!(!dirty);
        assert_eq!(rotation.map(|r| r.yaw), Some(90.0));
    }

    #[test]
    fn test_render_time_setters_do_not_invalidate() {
        let engine = AmbiEngine::new();
        assert!(engine.init_codec());

        engine.set_crossover(100.0);
        assert_eq!(engine.crossover(), 500.0);
        engine.set_max_re(0, false);
        engine.set_diffuse_eq(1, DiffuseEq::Amplitude);
        engine.set_rotation(30.0, 0.0, 0.0);
        engine.set_band_order(5, 1);
        engine.set_normalization(Normalization::N3D);
        assert_eq!(engine.codec_status(), CodecStatus::Initialised);

        let config = engine.config();
        assert!(!config.decoders[0].max_re);
        assert_eq!(config.rotation.yaw, 30.0);
        assert_eq!(config.band_orders.as_ref().map(|o| o[5]), Some(1));
    }

    #[test]
    fn test_decoder_setters_invalidate() {
        let engine = AmbiEngine::new();
        assert!(engine.init_codec());
        engine.set_decoding_method(0, DecodingMethod::ModeMatching);
        assert_eq!(engine.codec_status(), CodecStatus::NotInitialised);
        assert!(engine.init_codec());

        engine.set_output_layout(OutputLayout::Preset(LoudspeakerPreset::Surround5_0));
        assert_eq!(engine.codec_status(), CodecStatus::NotInitialised);
        assert_eq!(engine.num_outputs(), 5);

        // Same method again is not a change
        assert!(engine.init_codec());
        engine.set_decoding_method(0, DecodingMethod::ModeMatching);
        assert_eq!(engine.codec_status(), CodecStatus::Initialised);
    }

    #[test]
    fn test_apply_config_round_trip() {
        let engine = AmbiEngine::new();
        let config = Configuration {
            order: 3,
            crossover_hz: 1200.0,
            output: OutputLayout::Preset(LoudspeakerPreset::Atmos7_0_4),
            ..Default::default()
        };
        engine.apply_config(config.clone());
        assert_eq!(engine.config(), config);
        assert_eq!(engine.crossover(), 1200.0);
        assert_eq!(engine.num_inputs(), 16);
    }

    #[test]
    fn test_shutdown_blocks_further_init() {
        let engine = AmbiEngine::new();
        assert!(engine.init_codec());
        engine.shutdown();
        assert_eq!(engine.codec_status(), CodecStatus::NotInitialised);
        assert!(!engine.init_codec());
    }

    #[test]
    fn test_exact_mode_rejects_other_block_sizes() {
        let engine = AmbiEngine::new();
        engine.set_frame_mode(FrameMode::Exact);
        assert!(engine.init_codec());
        assert_eq!(engine.delay(), FILTERBANK_DELAY);

        let inputs = vec![vec![1.0f32; 100]; 4];
        let mut outputs = vec![vec![0.5f32; 100]; 2];
        engine.process(&inputs, &mut outputs, 4, 2, 100);
        assert!(outputs.iter().all(|ch| ch.iter().all(|&s| s == 0.0)));
    }
}
