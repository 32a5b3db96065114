//! Blocking matrix and per-bin adaptive cancellation branches.
//!
//! Each frequency bin carries its own independent adaptive state, updated
//! once per frame. Two update rules are available:
//!
//! ## NLMS
//!
//! A normalized stochastic-gradient step on the cancellation weights:
//!
//! ```text
//! y[f]  = w[f]ᴴ · noise[f]                  (adaptive correlation)
//! e[f]  = fixed[f] − y[f]                   (error = output sample)
//! w[f] += (μ / ‖noise[f]‖²) · noise[f] · e[f]*
//! ```
//!
//! Stable for `0 < μ < 2` under stationary noise; in practice μ is kept
//! small (0.005–0.05) to ride out non-stationary interference. The update is
//! skipped when `‖noise[f]‖²` is under an epsilon floor so silent frames
//! cannot blow the weights up.
//!
//! ## Regularized Newton
//!
//! A second-order update that replaces the gradient step with a solve
//! against tracked noise statistics:
//!
//! ```text
//! Σ[f]    ← tracker( noise[f] · noise[f]ᴴ )
//! p[f]    ← tracker( noise[f] · fixed[f]* )
//! w[f]    = (Σ[f] + ε·I)⁻¹ · p[f]
//! ```
//!
//! The error is computed with the weights solved on the previous frame, so
//! the estimator lag is one frame by construction. The blocking-matrix
//! output may first be folded into a smaller subspace (`channels / ds`) to
//! shrink the linear system. The solve is an in-place complex Cholesky over
//! pre-allocated flat buffers; no heap allocation per frame.

use num_complex::Complex64;

use crate::estimate::{LeakyIntegrator, SlidingAverage};

/// Norm floor under which adaptive updates are skipped instead of divided.
pub(crate) const NORM_FLOOR: f64 = 1e-15;

// ─────────────────── Fixed branch / blocking ────────────────────

/// Complex inner product with conjugation on the first argument,
/// `Σ a[c]* · b[c]`. The fixed-branch output at a bin is `herm_dot(w, x)`.
#[inline]
pub fn herm_dot(a: &[Complex64], b: &[Complex64]) -> Complex64 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = Complex64::new(0.0, 0.0);
    for (ai, bi) in a.iter().zip(b.iter()) {
        acc += ai.conj() * bi;
    }
    acc
}

/// Remove the fixed beamformer's look direction from one bin of a frame:
/// `out = x − bf·w`, where `bf = herm_dot(w, x)` is the fixed-branch output
/// already computed for this bin.
///
/// With `w` unit-norm this is the exact rank-1 orthogonal projection onto
/// the null space of `w`: the result satisfies `herm_dot(w, out) = 0` up to
/// floating-point error, every bin, every frame. The adaptive branch relies
/// on this — it must only ever see components orthogonal to the look
/// direction.
#[inline]
pub fn project_null(x: &[Complex64], w: &[Complex64], bf: Complex64, out: &mut [Complex64]) {
    debug_assert_eq!(x.len(), w.len());
    debug_assert_eq!(x.len(), out.len());
    for ((o, xi), wi) in out.iter_mut().zip(x.iter()).zip(w.iter()) {
        *o = xi - bf * wi;
    }
}

/// Fold a noise reference into `len/ds` values by summing each group of
/// `ds` adjacent channels.
#[inline]
pub fn downsample(noise: &[Complex64], ds: usize, out: &mut [Complex64]) {
    debug_assert_eq!(noise.len(), out.len() * ds);
    for (j, o) in out.iter_mut().enumerate() {
        let mut acc = Complex64::new(0.0, 0.0);
        for i in 0..ds {
            acc += noise[j * ds + i];
        }
        *o = acc;
    }
}

// ──────────────────────── NLMS branch ───────────────────────────

/// Adaptive state for one frequency bin, NLMS variant.
pub(crate) struct NlmsBin {
    weights: Vec<Complex64>,
    step_size: f64,
}

impl NlmsBin {
    pub(crate) fn new(nchan: usize, step_size: f64) -> Self {
        Self {
            weights: vec![Complex64::new(0.0, 0.0); nchan],
            step_size,
        }
    }

    /// One frame transition: returns the error signal (the output sample for
    /// this bin) and steps the weights toward cancelling it.
    pub(crate) fn process(&mut self, noise: &[Complex64], out_fixed: Complex64) -> Complex64 {
        debug_assert_eq!(noise.len(), self.weights.len());

        let out_adaptive = herm_dot(&self.weights, noise);
        let err = out_fixed - out_adaptive;

        let norm: f64 = noise.iter().map(|v| v.norm_sqr()).sum();
        if norm > NORM_FLOOR {
            let g = self.step_size / norm;
            let e_conj = err.conj();
            for (w, n) in self.weights.iter_mut().zip(noise.iter()) {
                *w += *n * e_conj * g;
            }
        }

        err
    }

    pub(crate) fn weights(&self) -> &[Complex64] {
        &self.weights
    }

    pub(crate) fn reset(&mut self) {
        self.weights.fill(Complex64::new(0.0, 0.0));
    }
}

// ─────────────────────── Newton branch ──────────────────────────

/// Covariance/cross-covariance tracker: a typed choice between exponential
/// forgetting and a fixed-length sliding window.
pub(crate) enum Tracker {
    Leaky(LeakyIntegrator),
    Sliding(SlidingAverage),
}

impl Tracker {
    fn update(&mut self, x: &[Complex64]) {
        match self {
            Tracker::Leaky(t) => t.update(x),
            Tracker::Sliding(t) => t.update(x),
        }
    }

    fn get(&self) -> &[Complex64] {
        match self {
            Tracker::Leaky(t) => t.get(),
            Tracker::Sliding(t) => t.get(),
        }
    }

    fn reset(&mut self) {
        match self {
            Tracker::Leaky(t) => t.reset(),
            Tracker::Sliding(t) => t.reset(),
        }
    }
}

/// Adaptive state for one frequency bin, regularized-Newton variant.
///
/// `dim` is the (possibly downsampled) noise-reference dimension. The
/// covariance tracker holds a `dim × dim` row-major Hermitian matrix, the
/// cross-covariance tracker a `dim` vector.
pub(crate) struct NewtonBin {
    weights: Vec<Complex64>,
    cov: Tracker,
    xcov: Tracker,
    reg: f64,
    // per-frame solve scratch
    obs: Vec<Complex64>,
    chol: Vec<Complex64>,
    rhs: Vec<Complex64>,
}

impl NewtonBin {
    pub(crate) fn new(dim: usize, reg: f64, cov: Tracker, xcov: Tracker) -> Self {
        Self {
            weights: vec![Complex64::new(0.0, 0.0); dim],
            cov,
            xcov,
            reg,
            obs: vec![Complex64::new(0.0, 0.0); dim * dim],
            chol: vec![Complex64::new(0.0, 0.0); dim * dim],
            rhs: vec![Complex64::new(0.0, 0.0); dim],
        }
    }

    /// One frame transition. The error uses the weights solved on the
    /// previous frame; the trackers then absorb the current frame and the
    /// weights are re-solved for the next one.
    pub(crate) fn process(&mut self, noise: &[Complex64], out_fixed: Complex64) -> Complex64 {
        let d = self.weights.len();
        debug_assert_eq!(noise.len(), d);

        let out_adaptive = herm_dot(&self.weights, noise);
        let err = out_fixed - out_adaptive;

        // Rank-1 observations of the second-order statistics.
        for i in 0..d {
            for j in 0..d {
                self.obs[i * d + j] = noise[i] * noise[j].conj();
            }
        }
        self.cov.update(&self.obs);
        let fixed_conj = out_fixed.conj();
        for (r, n) in self.rhs.iter_mut().zip(noise.iter()) {
            *r = n * fixed_conj;
        }
        self.xcov.update(&self.rhs);

        // Regularized normal-equations solve into the weights. On a failed
        // factorization (tracked matrix not yet positive-definite) the
        // previous weights are kept.
        self.chol.copy_from_slice(self.cov.get());
        for i in 0..d {
            self.chol[i * d + i] += Complex64::new(self.reg, 0.0);
        }
        self.rhs.copy_from_slice(self.xcov.get());
        if cholesky_in_place(&mut self.chol, d) {
            solve_cholesky(&self.chol, &mut self.rhs, d);
            self.weights.copy_from_slice(&self.rhs);
        }

        err
    }

    pub(crate) fn weights(&self) -> &[Complex64] {
        &self.weights
    }

    pub(crate) fn reset(&mut self) {
        self.weights.fill(Complex64::new(0.0, 0.0));
        self.cov.reset();
        self.xcov.reset();
    }
}

// ─────────────────── Cholesky solve (flat) ──────────────────────

/// In-place Cholesky factorization of a Hermitian positive-definite matrix
/// stored row-major in `a` (`d × d`). On success the lower triangle holds
/// `L` with `A = L·Lᴴ`. Returns false (leaving `a` garbage) if a diagonal
/// pivot is not strictly positive.
fn cholesky_in_place(a: &mut [Complex64], d: usize) -> bool {
    debug_assert_eq!(a.len(), d * d);
    for j in 0..d {
        let mut diag = a[j * d + j].re;
        for k in 0..j {
            diag -= a[j * d + k].norm_sqr();
        }
        if diag <= 0.0 || !diag.is_finite() {
            return false;
        }
        let ljj = diag.sqrt();
        a[j * d + j] = Complex64::new(ljj, 0.0);

        for i in (j + 1)..d {
            let mut acc = a[i * d + j];
            for k in 0..j {
                acc -= a[i * d + k] * a[j * d + k].conj();
            }
            a[i * d + j] = acc / ljj;
        }
    }
    true
}

/// Solve `A·x = b` given the Cholesky factor from [`cholesky_in_place`],
/// overwriting `b` with `x`. Forward substitution on `L`, back substitution
/// on `Lᴴ`.
fn solve_cholesky(l: &[Complex64], b: &mut [Complex64], d: usize) {
    debug_assert_eq!(l.len(), d * d);
    debug_assert_eq!(b.len(), d);

    for i in 0..d {
        let mut acc = b[i];
        for k in 0..i {
            acc -= l[i * d + k] * b[k];
        }
        b[i] = acc / l[i * d + i].re;
    }
    for i in (0..d).rev() {
        let mut acc = b[i];
        for k in (i + 1)..d {
            acc -= l[k * d + i].conj() * b[k];
        }
        b[i] = acc / l[i * d + i].re;
    }
}

// ─────────────────────────── Tests ──────────────────────────────
