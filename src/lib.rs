//! # gsc-rt
//!
//! Streaming adaptive Generalized Sidelobe Canceller (GSC) for
//! multichannel microphone-array noise suppression.
//!
//! The canceller separates a fixed, calibration-derived directional
//! beamformer from an adaptively updated noise-cancelling branch, combined
//! with online gain correction. Inputs and outputs are frequency-domain
//! frames — STFT analysis/synthesis, WAV I/O, and room simulation live
//! outside this crate.
//!
//! ## Pipeline
//!
//! ```text
//! frame ─► fixed-branch correlation ─► null-space projection ─► adaptive
//!          correlation ─► error (= output) ─► weight update ─► projection-
//!          back rescale ─► frame emitted
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use gsc_rt::{compute_fixed_weights, CalibrationRecording, Gsc, GscConfig};
//!
//! // One-shot calibration from STFT frames of a dominant source.
//! let mut rec = CalibrationRecording::new(nfft / 2 + 1, nchannel);
//! for frame in calibration_frames {
//!     rec.push_frame(frame)?;
//! }
//! let weights = compute_fixed_weights(&rec)?;
//!
//! // Streaming session.
//! let mut gsc = Gsc::new(GscConfig::nlms(nfft, nchannel, fs, 0.01), weights)?;
//! let mut out = vec![num_complex::Complex64::new(0.0, 0.0); nfft / 2 + 1];
//! for frame in stft_frames {
//!     gsc.process(frame, &mut out)?;
//! }
//! ```
//!
//! ## Adaptive variants
//!
//! | Variant | Update | Cost/frame | Convergence |
//! |---------|--------|------------|-------------|
//! | [`AdaptiveKind::Nlms`] | normalized gradient step | O(channels) per bin | slow, very stable |
//! | [`AdaptiveKind::Newton`] | regularized solve on tracked statistics | O((channels/ds)³) per bin | fast, one-frame estimator lag |
//!
//! ## Invariants
//!
//! - Fixed weights are unit-norm per bin, established once by calibration
//!   and never renormalized afterwards.
//! - The null-space projection output is orthogonal to the fixed weight on
//!   every bin of every frame (up to floating-point error).
//! - Every division against streamed statistics is floored: silent input
//!   degrades to "hold the previous gain", never to NaN in the output or
//!   corrupted adaptive state.
//!
//! ## Concurrency
//!
//! `process` is frame-synchronous and single-threaded; all mutable state is
//! owned by the calling thread, and each processor is `Send` so sessions can
//! be moved across threads. Per-bin state is fully independent — nothing is
//! shared across bins.
//!
//! ## Logging
//!
//! This crate uses the `log` facade. Construction logs the session geometry
//! at info level; calibration warns about degenerate bins. The host
//! application installs the logger.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

pub mod adaptive;
pub mod calibration;
pub mod estimate;

pub use calibration::{compute_fixed_weights, CalibrationRecording, FixedWeights};

use adaptive::{downsample, herm_dot, project_null, NewtonBin, NlmsBin, Tracker};
use estimate::{LeakyIntegrator, SlidingAverage};

/// Magnitude floor under which the projection-back gain is held instead of
/// re-estimated.
const PB_FLOOR: f64 = 1e-15;

#[derive(Error, Debug)]
pub enum GscError {
    #[error("config error: {0}")]
    Config(String),
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    Shape {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("calibration error: {0}")]
    Calibration(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GscError>;

// ─────────────────────── Configuration ──────────────────────────

/// Covariance/cross-covariance estimator selection for the Newton branch.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum EstimatorKind {
    /// Exponential forgetting, `value ← ff·value + (1−ff)·x`.
    Leaky { ff: f64 },
    /// True moving average over the last `window` frames.
    Sliding { window: usize },
}

/// Adaptive-branch selection and parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum AdaptiveKind {
    /// Normalized least-mean-squares gradient updates.
    Nlms {
        /// NLMS gain μ; stable for `0 < μ < 2`, kept small in practice
        /// (0.005–0.05) under non-stationary interference.
        step_size: f64,
    },
    /// Regularized-Newton updates on tracked second-order statistics.
    Newton {
        /// Decimation factor for the blocking subspace; must divide the
        /// channel count.
        ds: usize,
        /// Diagonal loading ε added to the tracked covariance before every
        /// solve. An absolute value — adequate when input levels are
        /// normalized upstream.
        reg: f64,
        /// Statistics tracker.
        estimator: EstimatorKind,
    },
}

/// Session parameters, all fixed for the lifetime of a [`Gsc`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GscConfig {
    /// FFT length of the upstream STFT; the processor spans `nfft/2 + 1`
    /// bins.
    pub nfft: usize,
    /// Microphone channels per frame.
    pub nchannel: usize,
    /// Sampling frequency in Hz.
    pub fs: f64,
    /// Highest frequency to process, in Hz; bins above it are zeroed.
    pub f_max: f64,
    /// Projection-back forgetting factor, `0 < ff < 1`; close to 1 gives
    /// slow, stable gain tracking.
    pub pb_ff: f64,
    /// Reference channel the output is rescaled against.
    pub pb_ref_channel: usize,
    /// Adaptive-branch variant.
    pub adaptive: AdaptiveKind,
}

impl GscConfig {
    /// NLMS session with the usual defaults: full band, projection-back
    /// forgetting 0.99 against channel 0.
    pub fn nlms(nfft: usize, nchannel: usize, fs: f64, step_size: f64) -> Self {
        Self {
            nfft,
            nchannel,
            fs,
            f_max: fs / 2.0,
            pb_ff: 0.99,
            pb_ref_channel: 0,
            adaptive: AdaptiveKind::Nlms { step_size },
        }
    }

    /// Newton session with the usual defaults: leaky statistics at
    /// forgetting 0.8, diagonal loading 1e-15, full band.
    pub fn newton(nfft: usize, nchannel: usize, fs: f64, ds: usize) -> Self {
        Self {
            nfft,
            nchannel,
            fs,
            f_max: fs / 2.0,
            pb_ff: 0.99,
            pb_ref_channel: 0,
            adaptive: AdaptiveKind::Newton {
                ds,
                reg: 1e-15,
                estimator: EstimatorKind::Leaky { ff: 0.8 },
            },
        }
    }

    /// Check every parameter range. All violations surface here, at
    /// construction — never on the first frame.
    pub fn validate(&self) -> Result<()> {
        if self.nfft < 2 || self.nfft % 2 != 0 {
            return Err(GscError::Config(format!(
                "nfft must be even and ≥ 2, got {}",
                self.nfft
            )));
        }
        if self.nchannel < 1 {
            return Err(GscError::Config("nchannel must be ≥ 1".into()));
        }
        if !(self.fs > 0.0) {
            return Err(GscError::Config(format!("fs must be positive, got {}", self.fs)));
        }
        if !(self.f_max > 0.0 && self.f_max <= self.fs / 2.0) {
            return Err(GscError::Config(format!(
                "f_max must lie in (0, fs/2], got {} at fs {}",
                self.f_max, self.fs
            )));
        }
        if !(self.pb_ff > 0.0 && self.pb_ff < 1.0) {
            return Err(GscError::Config(format!(
                "projection-back forgetting factor must lie in (0, 1), got {}",
                self.pb_ff
            )));
        }
        if self.pb_ref_channel >= self.nchannel {
            return Err(GscError::Config(format!(
                "reference channel {} out of range for {} channels",
                self.pb_ref_channel, self.nchannel
            )));
        }
        match self.adaptive {
            AdaptiveKind::Nlms { step_size } => {
                if !(step_size > 0.0 && step_size < 2.0) {
                    return Err(GscError::Config(format!(
                        "NLMS step size must lie in (0, 2), got {step_size}"
                    )));
                }
            }
            AdaptiveKind::Newton { ds, reg, estimator } => {
                if ds < 1 || self.nchannel % ds != 0 {
                    return Err(GscError::Config(format!(
                        "decimation factor {ds} must evenly divide the channel count {}",
                        self.nchannel
                    )));
                }
                if !(reg > 0.0) {
                    return Err(GscError::Config(format!(
                        "covariance regularization must be positive, got {reg}"
                    )));
                }
                match estimator {
                    EstimatorKind::Leaky { ff } => {
                        if !(ff > 0.0 && ff < 1.0) {
                            return Err(GscError::Config(format!(
                                "estimator forgetting factor must lie in (0, 1), got {ff}"
                            )));
                        }
                    }
                    EstimatorKind::Sliding { window } => {
                        if window < 1 {
                            return Err(GscError::Config(
                                "estimator window must be ≥ 1".into(),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of frequency bins a frame carries, `nfft/2 + 1`.
    pub fn nfreq(&self) -> usize {
        self.nfft / 2 + 1
    }

    /// Write to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read from a JSON file and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

// ──────────────────────── Debug sink ────────────────────────────

/// Optional observer for per-frame diagnostic series.
///
/// The processor records into the sink opportunistically and never depends
/// on one being installed; a sink must therefore be cheap and must not
/// block.
pub trait DebugSink {
    /// Store one named per-frame vector (one value per frequency bin).
    fn record(&mut self, name: &str, values: &[f32]);
}

/// In-memory sink accumulating named time series, one vector per frame.
#[derive(Default)]
pub struct MemorySink {
    data: HashMap<String, Vec<Vec<f32>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All frames recorded under `name`, in arrival order.
    pub fn series(&self, name: &str) -> Option<&[Vec<f32>]> {
        self.data.get(name).map(|v| v.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(|k| k.as_str())
    }
}

impl DebugSink for MemorySink {
    fn record(&mut self, name: &str, values: &[f32]) {
        self.data
            .entry(name.to_string())
            .or_default()
            .push(values.to_vec());
    }
}

// ───────────────────── Projection-back ──────────────────────────

/// Per-bin online projection-back state: a one-tap adaptive gain mapping
/// the canceller output back onto the reference channel.
///
/// ```text
/// num ← ff·num + (1−ff)·e*·x_ref
/// den ← ff·den + (1−ff)·e*·e
/// out = e · (num / den)
/// ```
///
/// When `|den|` falls under the floor (silence) the previously applied gain
/// is held rather than re-estimated.
struct ProjBack {
    num: Complex64,
    den: Complex64,
    last_gain: Complex64,
    ff: f64,
}

impl ProjBack {
    fn new(ff: f64) -> Self {
        Self {
            num: Complex64::new(1.0, 0.0),
            den: Complex64::new(1.0, 0.0),
            last_gain: Complex64::new(1.0, 0.0),
            ff,
        }
    }

    fn apply(&mut self, err: Complex64, reference: Complex64) -> Complex64 {
        let ff = Complex64::new(self.ff, 0.0);
        let nf = Complex64::new(1.0 - self.ff, 0.0);
        let e_conj = err.conj();
        self.num = ff * self.num + nf * e_conj * reference;
        self.den = ff * self.den + nf * e_conj * err;
        if self.den.norm() > PB_FLOOR {
            self.last_gain = self.num / self.den;
        }
        err * self.last_gain
    }

    fn reset(&mut self) {
        self.num = Complex64::new(1.0, 0.0);
        self.den = Complex64::new(1.0, 0.0);
        self.last_gain = Complex64::new(1.0, 0.0);
    }
}

// ─────────────────────── The processor ──────────────────────────

enum Branch {
    Nlms(Vec<NlmsBin>),
    Newton { bins: Vec<NewtonBin>, ds: usize },
}

/// Streaming generalized sidelobe canceller.
///
/// One instance holds one session: immutable calibration weights plus the
/// per-bin adaptive state evolving frame by frame. `process` is invoked
/// once per STFT hop.
pub struct Gsc {
    config: GscConfig,
    fixed: FixedWeights,
    nfreq: usize,
    f_min_index: usize,
    f_max_index: usize,
    branch: Branch,
    projback: Vec<ProjBack>,
    frames_processed: u64,
    // Pre-allocated per-frame work buffers.
    work_noise: Vec<Complex64>,
    work_folded: Vec<Complex64>,
    work_db: Vec<f32>,
    sink: Option<Box<dyn DebugSink + Send>>,
}

impl Gsc {
    /// Create a session from validated parameters and calibration weights.
    ///
    /// The weight matrix must span the same bins and channels as the
    /// configuration; a mismatch is rejected here.
    pub fn new(config: GscConfig, fixed: FixedWeights) -> Result<Self> {
        config.validate()?;
        let nfreq = config.nfreq();
        if fixed.nfreq() != nfreq {
            return Err(GscError::Shape {
                what: "fixed weight bins",
                expected: nfreq,
                got: fixed.nfreq(),
            });
        }
        if fixed.nchannels() != config.nchannel {
            return Err(GscError::Shape {
                what: "fixed weight channels",
                expected: config.nchannel,
                got: fixed.nchannels(),
            });
        }

        // DC is skipped; f_max rounds to the closest bin.
        let f_min_index = 1;
        let f_max_index = ((config.f_max / config.fs * config.nfft as f64).round() as usize)
            .clamp(f_min_index, nfreq - 1);

        let (branch, folded_dim) = match config.adaptive {
            AdaptiveKind::Nlms { step_size } => {
                let bins = (0..nfreq)
                    .map(|_| NlmsBin::new(config.nchannel, step_size))
                    .collect();
                (Branch::Nlms(bins), 0)
            }
            AdaptiveKind::Newton { ds, reg, estimator } => {
                let dim = config.nchannel / ds;
                let bins = (0..nfreq)
                    .map(|_| {
                        let xcov = match estimator {
                            EstimatorKind::Leaky { ff } => {
                                Tracker::Leaky(LeakyIntegrator::new(dim, ff))
                            }
                            EstimatorKind::Sliding { window } => {
                                Tracker::Sliding(SlidingAverage::new(window, dim))
                            }
                        };
                        NewtonBin::new(dim, reg, make_cov_tracker(dim, reg, estimator), xcov)
                    })
                    .collect();
                (Branch::Newton { bins, ds }, dim)
            }
        };

        log::info!(
            "gsc session: {} channels, nfft {}, bins {}..={} of {}, {:?}",
            config.nchannel,
            config.nfft,
            f_min_index,
            f_max_index,
            nfreq,
            config.adaptive,
        );

        Ok(Self {
            projback: (0..nfreq).map(|_| ProjBack::new(config.pb_ff)).collect(),
            work_noise: vec![Complex64::new(0.0, 0.0); config.nchannel],
            work_folded: vec![Complex64::new(0.0, 0.0); folded_dim],
            work_db: vec![0.0; nfreq],
            fixed,
            nfreq,
            f_min_index,
            f_max_index,
            branch,
            frames_processed: 0,
            sink: None,
            config,
        })
    }

    /// Process one frequency-domain frame.
    ///
    /// `input` holds `nfreq · nchannel` values in bin-major layout (the
    /// channels of bin `f` are contiguous at `f·nchannel`); `output`
    /// receives one complex sample per bin. A frame of the wrong shape is
    /// rejected with [`GscError::Shape`] and leaves all state untouched —
    /// fatal for the caller's session, never silently truncated.
    pub fn process(&mut self, input: &[Complex64], output: &mut [Complex64]) -> Result<()> {
        let nchan = self.config.nchannel;
        let expected = self.nfreq * nchan;
        if input.len() != expected {
            return Err(GscError::Shape {
                what: "input frame",
                expected,
                got: input.len(),
            });
        }
        if output.len() != self.nfreq {
            return Err(GscError::Shape {
                what: "output frame",
                expected: self.nfreq,
                got: output.len(),
            });
        }

        // Everything outside the processed band is zero in the output.
        for o in output[..self.f_min_index].iter_mut() {
            *o = Complex64::new(0.0, 0.0);
        }
        for o in output[self.f_max_index + 1..].iter_mut() {
            *o = Complex64::new(0.0, 0.0);
        }

        for f in self.f_min_index..=self.f_max_index {
            let x = &input[f * nchan..(f + 1) * nchan];
            let w = self.fixed.bin(f);

            let out_fixed = herm_dot(w, x);
            project_null(x, w, out_fixed, &mut self.work_noise);

            let err = match &mut self.branch {
                Branch::Nlms(bins) => bins[f].process(&self.work_noise, out_fixed),
                Branch::Newton { bins, ds } => {
                    downsample(&self.work_noise, *ds, &mut self.work_folded);
                    bins[f].process(&self.work_folded, out_fixed)
                }
            };

            output[f] = self.projback[f].apply(err, x[self.config.pb_ref_channel]);
        }

        self.frames_processed += 1;

        if let Some(sink) = self.sink.as_deref_mut() {
            for (db, o) in self.work_db.iter_mut().zip(output.iter()) {
                *db = (20.0 * (o.norm() + 1e-12).log10()) as f32;
            }
            sink.record("output_db", &self.work_db);
        }

        Ok(())
    }

    /// Restore all adaptive state (weights, statistics, projection-back) to
    /// its post-construction value. The calibration weights are untouched.
    pub fn reset(&mut self) {
        match &mut self.branch {
            Branch::Nlms(bins) => bins.iter_mut().for_each(NlmsBin::reset),
            Branch::Newton { bins, .. } => bins.iter_mut().for_each(NewtonBin::reset),
        }
        for pb in self.projback.iter_mut() {
            pb.reset();
        }
        self.frames_processed = 0;
    }

    /// Install an observer for per-frame diagnostics; replaces any previous
    /// one.
    pub fn set_debug_sink(&mut self, sink: Box<dyn DebugSink + Send>) {
        self.sink = Some(sink);
    }

    /// Remove and return the installed observer.
    pub fn take_debug_sink(&mut self) -> Option<Box<dyn DebugSink + Send>> {
        self.sink.take()
    }

    pub fn config(&self) -> &GscConfig {
        &self.config
    }

    pub fn fixed_weights(&self) -> &FixedWeights {
        &self.fixed
    }

    /// Adaptive weight vector currently held at bin `f` — `nchannel` taps,
    /// or `nchannel/ds` for the Newton variant.
    pub fn adaptive_weights(&self, f: usize) -> &[Complex64] {
        match &self.branch {
            Branch::Nlms(bins) => bins[f].weights(),
            Branch::Newton { bins, .. } => bins[f].weights(),
        }
    }

    /// Number of frequency bins per frame.
    pub fn nfreq(&self) -> usize {
        self.nfreq
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }
}

fn make_cov_tracker(dim: usize, reg: f64, estimator: EstimatorKind) -> Tracker {
    match estimator {
        EstimatorKind::Leaky { ff } => {
            // Seed with reg·I so the tracked covariance starts
            // positive-definite.
            let mut seed = vec![Complex64::new(0.0, 0.0); dim * dim];
            for i in 0..dim {
                seed[i * dim + i] = Complex64::new(reg, 0.0);
            }
            Tracker::Leaky(LeakyIntegrator::with_seed(&seed, ff))
        }
        EstimatorKind::Sliding { window } => {
            Tracker::Sliding(SlidingAverage::new(window, dim * dim))
        }
    }
}

// Compile-time check that sessions can move across threads.
fn _assert_send<T: Send>() {}
fn _assert_gsc_is_send() {
    _assert_send::<Gsc>();
}

// ─────────────────────────── Tests ──────────────────────────────
