//! Render core - decoding of one internal frame in the hybrid band domain
//!
//! Everything here runs on the render path. Buffers are sized at
//! construction (or when a codec is installed from the control path) and
//! `process_frame` never allocates.

use ndarray::{Array2, Array3, s};
use num_complex::Complex32;

use rf_filterbank::{FRAME_SIZE, Filterbank, NUM_BANDS, TIME_SLOTS};

use crate::MAX_LOUDSPEAKERS;
use crate::config::{HIGH_SLOT, LOW_SLOT};
use crate::hoa::decoder::{BinauralDecoder, LoudspeakerDecoder};
use crate::hoa::{AmbisonicFormat, DiffuseEq, FormatConverter, MAX_ORDER, MAX_SH, RotationSettings, ShRotation, sh_count};

const ZERO: Complex32 = Complex32::new(0.0, 0.0);

// ============ Decoder Bank ============

/// Matrices of one sub-order: `[plain, max_re]`, each either one
/// frequency-independent matrix or one per band
#[derive(Debug, Clone)]
pub struct OrderMatrices {
    variants: [Vec<Array2<Complex32>>; 2],
    amplitude_norm: [f32; 2],
    energy_norm: [f32; 2],
}

impl OrderMatrices {
    #[inline]
    pub fn matrix(&self, max_re: bool, band: usize) -> &Array2<Complex32> {
        let variant = &self.variants[max_re as usize];
        if variant.len() == 1 { &variant[0] } else { &variant[band] }
    }

    #[inline]
    pub fn norm(&self, max_re: bool, eq: DiffuseEq) -> f32 {
        match eq {
            DiffuseEq::Amplitude => self.amplitude_norm[max_re as usize],
            DiffuseEq::Energy => self.energy_norm[max_re as usize],
        }
    }
}

/// Complex decoding matrices for every sub-order of one decoder
#[derive(Debug, Clone)]
pub struct DecoderBank {
    /// Index `n - 1` holds sub-order `n`
    orders: Vec<OrderMatrices>,
    num_outputs: usize,
}

impl DecoderBank {
    pub fn from_loudspeaker(decoder: &LoudspeakerDecoder) -> Self {
        let to_complex = |m: &nalgebra::DMatrix<f64>| {
            Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| Complex32::new(m[(i, j)] as f32, 0.0))
        };
        let orders = decoder
            .orders
            .iter()
            .map(|od| OrderMatrices {
                variants: [vec![to_complex(&od.plain)], vec![to_complex(&od.max_re)]],
                amplitude_norm: od.amplitude_norm.map(|x| x as f32),
                energy_norm: od.energy_norm.map(|x| x as f32),
            })
            .collect();

        Self {
            orders,
            num_outputs: decoder.num_outputs,
        }
    }

    pub fn from_binaural(decoder: &BinauralDecoder) -> Self {
        let to_complex = |m: &nalgebra::DMatrix<num_complex::Complex<f64>>| {
            Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| {
                let x = m[(i, j)];
                Complex32::new(x.re as f32, x.im as f32)
            })
        };
        let orders = decoder
            .orders
            .iter()
            .map(|bo| OrderMatrices {
                variants: [
                    bo.plain.iter().map(to_complex).collect(),
                    bo.max_re.iter().map(to_complex).collect(),
                ],
                amplitude_norm: [1.0; 2],
                energy_norm: [1.0; 2],
            })
            .collect();

        Self { orders, num_outputs: 2 }
    }

    pub fn order(&self) -> usize {
        self.orders.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// Matrices of sub-order `n`, clamped to the available range
    #[inline]
    pub fn sub_order(&self, n: usize) -> &OrderMatrices {
        &self.orders[n.clamp(1, self.orders.len()) - 1]
    }
}

// ============ Codec ============

/// Everything a rebuild produces, moved into the render state in one piece
#[derive(Debug, Clone)]
pub struct Codec {
    order: usize,
    /// `[low, high]`; binaural decoding uses a single bank
    slots: Vec<DecoderBank>,
    /// `[band, ear, loudspeaker]`, present when binauralising loudspeakers
    speaker_hrtfs: Option<Array3<Complex32>>,
    binaural: bool,
}

impl Codec {
    /// Loudspeaker codec from the low and high decoders
    pub fn loudspeaker(low: &LoudspeakerDecoder, high: &LoudspeakerDecoder) -> Self {
        let slots = vec![DecoderBank::from_loudspeaker(low), DecoderBank::from_loudspeaker(high)];
        Self::from_slots(slots, low.order(), false)
    }

    /// Direct binaural codec
    pub fn binaural(decoder: &BinauralDecoder) -> Self {
        Self::from_slots(vec![DecoderBank::from_binaural(decoder)], decoder.order(), true)
    }

    fn from_slots(slots: Vec<DecoderBank>, order: usize, binaural: bool) -> Self {
        Self {
            order: order.clamp(1, MAX_ORDER),
            slots,
            speaker_hrtfs: None,
            binaural,
        }
    }

    /// Render loudspeaker feeds to two ears with `[band, ear, loudspeaker]` HRTFs
    pub fn with_speaker_hrtfs(mut self, hrtfs: Array3<Complex32>) -> Self {
        if !self.binaural && hrtfs.dim() == (NUM_BANDS, 2, self.num_decoded()) {
            self.speaker_hrtfs = Some(hrtfs);
        } else {
            log::warn!("Ignoring loudspeaker HRTFs of shape {:?}", hrtfs.dim());
        }
        self
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Channels the decoder produces before any binauralisation
    pub fn num_decoded(&self) -> usize {
        self.slots.first().map_or(0, |b| b.num_outputs())
    }

    /// Channels written to the host
    pub fn num_outputs(&self) -> usize {
        if self.speaker_hrtfs.is_some() { 2 } else { self.num_decoded() }
    }

    pub fn is_binaural(&self) -> bool {
        self.binaural
    }

    pub fn binauralises_loudspeakers(&self) -> bool {
        self.speaker_hrtfs.is_some()
    }
}

// ============ Frame Parameters ============

/// Render-time parameters snapshotted at the start of a frame
#[derive(Debug, Clone, Copy)]
pub struct FrameParams {
    pub format: AmbisonicFormat,
    pub crossover_hz: f32,
    /// Per slot `[low, high]`
    pub max_re: [bool; 2],
    pub diffuse_eq: [DiffuseEq; 2],
    /// `None` when rotation is disabled
    pub rotation: Option<RotationSettings>,
    /// Angles changed since the previous frame
    pub rotation_dirty: bool,
    /// Per-band order, clamped to the master order at render time
    pub band_orders: [u8; NUM_BANDS],
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            format: AmbisonicFormat::ambix(),
            crossover_hz: crate::config::DEFAULT_CROSSOVER_HZ,
            max_re: [true; 2],
            diffuse_eq: [DiffuseEq::Amplitude, DiffuseEq::Energy],
            rotation: None,
            rotation_dirty: false,
            band_orders: [MAX_ORDER as u8; NUM_BANDS],
        }
    }
}

// ============ Render Core ============

/// Preallocated render buffers plus the installed codec
pub struct RenderCore {
    filterbank: Filterbank,
    /// `[MAX_SH][FRAME_SIZE]` ACN/N3D time frame
    sh_frame: Vec<Vec<f32>>,
    /// `[band, sh, slot]`
    spectra_in: Array3<Complex32>,
    /// `[band, output, slot]`
    spectra_out: Array3<Complex32>,
    /// `[band, ear, slot]`
    ears: Array3<Complex32>,
    rotation: ShRotation,
    /// Real SH rotation applied to the band-domain input, block diagonal by degree
    rotation_gains: Array2<f32>,
    rotation_valid: bool,
    rotated: [Complex32; MAX_SH],
    freqs: Vec<f32>,
    codec: Option<Codec>,
}

impl RenderCore {
    /// Allocate every buffer for the maximum channel counts
    pub fn new(freqs: Vec<f32>) -> Self {
        Self {
            filterbank: Filterbank::new(0, 0),
            sh_frame: vec![vec![0.0; FRAME_SIZE]; MAX_SH],
            spectra_in: Array3::zeros((NUM_BANDS, MAX_SH, TIME_SLOTS)),
            spectra_out: Array3::zeros((NUM_BANDS, MAX_LOUDSPEAKERS, TIME_SLOTS)),
            ears: Array3::zeros((NUM_BANDS, 2, TIME_SLOTS)),
            rotation: ShRotation::new(),
            rotation_gains: Array2::eye(MAX_SH),
            rotation_valid: false,
            rotated: [ZERO; MAX_SH],
            freqs,
            codec: None,
        }
    }

    /// Band centre frequencies (fixed per sample rate)
    pub fn set_freqs(&mut self, freqs: Vec<f32>) {
        self.freqs = freqs;
    }

    pub fn codec(&self) -> Option<&Codec> {
        self.codec.as_ref()
    }

    /// Install a freshly built codec (control path)
    pub fn install(&mut self, codec: Codec) {
        let num_inputs = sh_count(codec.order());
        let num_outputs = codec.num_outputs();
        self.filterbank.channel_change(num_inputs, num_outputs);
        self.filterbank.clear_buffers();
        self.rotation_valid = false;
        self.codec = Some(codec);
    }

    /// Drop the codec (control path)
    pub fn uninstall(&mut self) -> Option<Codec> {
        self.filterbank.clear_buffers();
        self.codec.take()
    }

    /// Zero all filterbank delay lines
    pub fn clear(&mut self) {
        self.filterbank.clear_buffers();
    }

    /// Decode one `FRAME_SIZE` frame
    ///
    /// Returns `false` (with silent outputs) when no codec is installed.
    /// Outputs beyond the produced channel count are zero-filled.
    pub fn process_frame<I, O>(&mut self, inputs: &[I], outputs: &mut [O], params: &FrameParams) -> bool
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        let Self {
            filterbank,
            sh_frame,
            spectra_in,
            spectra_out,
            ears,
            rotation,
            rotation_gains,
            rotation_valid,
            rotated,
            freqs,
            codec,
        } = self;

        let Some(codec) = codec.as_ref() else {
            for out in outputs.iter_mut() {
                out.as_mut().fill(0.0);
            }
            return false;
        };

        let order = codec.order;
        let nsh = sh_count(order);
        let num_decoded = codec.num_decoded();

        // Convention normalization, then analysis
        let converter = FormatConverter::new(params.format, order);
        converter.to_n3d(inputs, &mut sh_frame[..nsh]);
        filterbank.forward(&sh_frame[..nsh], spectra_in.slice_mut(s![.., ..nsh, ..]));

        // Rotate the sound field before decoding
        if let Some(settings) = params.rotation {
            if params.rotation_dirty || !*rotation_valid {
                rotation.compute(&settings.matrix(), order);
                let r = rotation.matrix();
                for i in 0..nsh {
                    for j in 0..nsh {
                        rotation_gains[[i, j]] = r[[i, j]] as f32;
                    }
                }
                *rotation_valid = true;
            }
            rotate_bands(spectra_in, rotation_gains, rotated, order);
        }

        for band in 0..NUM_BANDS {
            let band_order = (params.band_orders[band] as usize).clamp(1, order);
            let slot = if codec.binaural {
                LOW_SLOT
            } else if freqs.get(band).is_some_and(|&f| f >= params.crossover_hz) {
                HIGH_SLOT
            } else {
                LOW_SLOT
            };

            let matrices = codec.slots[slot.min(codec.slots.len() - 1)].sub_order(band_order);
            let max_re = params.max_re[slot];
            let matrix = matrices.matrix(max_re, band);
            let norm = matrices.norm(max_re, params.diffuse_eq[slot]);
            let band_sh = matrix.ncols().min(sh_count(band_order));

            for out in 0..num_decoded {
                for t in 0..TIME_SLOTS {
                    let mut acc = ZERO;
                    for k in 0..band_sh {
                        acc += matrix[[out, k]] * spectra_in[[band, k, t]];
                    }
                    spectra_out[[band, out, t]] = acc * norm;
                }
            }

            if let Some(hrtfs) = codec.speaker_hrtfs.as_ref() {
                let scale = 1.0 / (num_decoded as f32).sqrt();
                for ear in 0..2 {
                    for t in 0..TIME_SLOTS {
                        let mut acc = ZERO;
                        for speaker in 0..num_decoded {
                            acc += hrtfs[[band, ear, speaker]] * spectra_out[[band, speaker, t]];
                        }
                        ears[[band, ear, t]] = acc * scale;
                    }
                }
            }
        }

        let produced = if codec.speaker_hrtfs.is_some() {
            filterbank.inverse(ears.view(), outputs);
            2
        } else {
            filterbank.inverse(spectra_out.slice(s![.., ..num_decoded, ..]), outputs);
            num_decoded
        };

        for out in outputs.iter_mut().skip(produced) {
            out.as_mut().fill(0.0);
        }
        true
    }
}

/// Apply `gains` to every band and time slot of `spectra` in place
///
/// Only the diagonal blocks of each degree are visited; `scratch` holds one
/// degree of the input while it is overwritten.
fn rotate_bands(spectra: &mut Array3<Complex32>, gains: &Array2<f32>, scratch: &mut [Complex32; MAX_SH], order: usize) {
    for band in 0..NUM_BANDS {
        for t in 0..TIME_SLOTS {
            for l in 1..=order {
                let block = l * l..(l + 1) * (l + 1);
                for i in block.clone() {
                    scratch[i] = spectra[[band, i, t]];
                }
                for i in block.clone() {
                    let mut acc = ZERO;
                    for j in block.clone() {
                        acc += scratch[j] * gains[[i, j]];
                    }
                    spectra[[band, i, t]] = acc;
                }
            }
        }
    }
}

/// Render state owned behind the engine's render mutex
pub struct RenderState {
    pub adapter: rf_filterbank::FrameAdapter,
    pub core: RenderCore,
}

impl RenderState {
    pub fn new(freqs: Vec<f32>) -> Self {
        Self {
            adapter: rf_filterbank::FrameAdapter::new(MAX_SH, MAX_LOUDSPEAKERS),
            core: RenderCore::new(freqs),
        }
    }
}
