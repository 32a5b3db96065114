//! Streaming second-order statistics estimators.
//!
//! The adaptive branch tracks time-varying covariance and cross-covariance
//! from noisy per-frame observations. Two estimator primitives cover this:
//!
//! - [`SlidingAverage`] — fixed-length moving average over the last `L`
//!   frames (FIFO plus running sum)
//! - [`LeakyIntegrator`] — exponential forgetting,
//!   `value ← ff·value + (1−ff)·x`
//!
//! Both are pure state-holders over flat complex vectors: they know nothing
//! about the beamformer and are owned exclusively by the branch that created
//! them. All memory is pre-allocated at construction; after the first `L`
//! frames [`SlidingAverage::update`] recycles the evicted buffer, so neither
//! primitive allocates per frame.

use num_complex::Complex64;
use std::collections::VecDeque;

// ───────────────────── SlidingAverage ───────────────────────────

/// Moving average of the last `L` complex vectors.
///
/// `get()` ramps up during the first `L` updates (it divides by the number of
/// frames seen so far) and becomes a true moving average once the window is
/// full. `last()` exposes the most recent contribution for causal use.
pub struct SlidingAverage {
    buf: VecDeque<Vec<Complex64>>,
    sum: Vec<Complex64>,
    avg: Vec<Complex64>,
    window: usize,
    dim: usize,
}

impl SlidingAverage {
    /// Create an averager over vectors of length `dim` with window length
    /// `window` (≥ 1).
    pub fn new(window: usize, dim: usize) -> Self {
        let window = window.max(1);
        Self {
            buf: VecDeque::with_capacity(window + 1),
            sum: vec![Complex64::new(0.0, 0.0); dim],
            avg: vec![Complex64::new(0.0, 0.0); dim],
            window,
            dim,
        }
    }

    /// Push a new per-frame value into the window.
    pub fn update(&mut self, value: &[Complex64]) {
        debug_assert_eq!(value.len(), self.dim);

        // Evict the oldest contribution once the window is full, recycling
        // its buffer for the incoming value.
        let mut slot = if self.buf.len() == self.window {
            let old = self.buf.pop_front().unwrap();
            for (s, o) in self.sum.iter_mut().zip(old.iter()) {
                *s -= *o;
            }
            old
        } else {
            vec![Complex64::new(0.0, 0.0); self.dim]
        };

        slot.copy_from_slice(value);
        for (s, v) in self.sum.iter_mut().zip(slot.iter()) {
            *s += *v;
        }
        self.buf.push_back(slot);

        let count = self.buf.len() as f64;
        for (a, s) in self.avg.iter_mut().zip(self.sum.iter()) {
            *a = *s / count;
        }
    }

    /// Current average, `sum / frames_seen`. All zeros before the first
    /// update.
    pub fn get(&self) -> &[Complex64] {
        &self.avg
    }

    /// Most recent contribution, if any update has happened.
    pub fn last(&self) -> Option<&[Complex64]> {
        self.buf.back().map(|v| v.as_slice())
    }

    /// Number of frames currently in the window.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if no update has happened yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop all accumulated frames.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.sum.fill(Complex64::new(0.0, 0.0));
        self.avg.fill(Complex64::new(0.0, 0.0));
    }
}

// ───────────────────── LeakyIntegrator ──────────────────────────

/// Exponential-forgetting running average of a complex vector.
///
/// Each update computes `value ← ff·value + (1−ff)·x` element-wise. An
/// explicit seed can be supplied when the integrated quantity must start in a
/// particular state — a covariance matrix stored row-major, for instance, is
/// seeded with a small multiple of the identity so that it is
/// positive-definite before the first frame arrives.
pub struct LeakyIntegrator {
    value: Vec<Complex64>,
    seed: Vec<Complex64>,
    ff: f64,
}

impl LeakyIntegrator {
    /// Create a zero-initialized integrator over vectors of length `dim`
    /// with forgetting factor `ff ∈ (0, 1)`.
    pub fn new(dim: usize, ff: f64) -> Self {
        Self {
            value: vec![Complex64::new(0.0, 0.0); dim],
            seed: vec![Complex64::new(0.0, 0.0); dim],
            ff,
        }
    }

    /// Create an integrator starting from (and resetting to) `seed`.
    pub fn with_seed(seed: &[Complex64], ff: f64) -> Self {
        Self {
            value: seed.to_vec(),
            seed: seed.to_vec(),
            ff,
        }
    }

    /// Absorb one observation.
    pub fn update(&mut self, x: &[Complex64]) {
        debug_assert_eq!(x.len(), self.value.len());
        let ff = Complex64::new(self.ff, 0.0);
        let nf = Complex64::new(1.0 - self.ff, 0.0);
        for (v, xi) in self.value.iter_mut().zip(x.iter()) {
            *v = ff * *v + nf * *xi;
        }
    }

    /// Current integrated value.
    pub fn get(&self) -> &[Complex64] {
        &self.value
    }

    /// Forgetting factor this integrator was built with.
    pub fn forgetting_factor(&self) -> f64 {
        self.ff
    }

    /// Restore the seed value.
    pub fn reset(&mut self) {
        self.value.copy_from_slice(&self.seed);
    }
}

// ─────────────────────────── Tests ──────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    #[test]
    fn sliding_average_ramps_up_then_slides() {
        let mut sa = SlidingAverage::new(3, 1);

        sa.update(&[c(3.0)]);
        assert_eq!(sa.get()[0], c(3.0), "single frame average is the frame");
        assert_eq!(sa.len(), 1);

        sa.update(&[c(5.0)]);
        assert!((sa.get()[0] - c(4.0)).norm() < 1e-12, "mean of 3 and 5");

        sa.update(&[c(7.0)]);
        assert!((sa.get()[0] - c(5.0)).norm() < 1e-12, "mean of 3, 5, 7");

        // Window full: the 3 falls out.
        sa.update(&[c(9.0)]);
        assert_eq!(sa.len(), 3);
        assert!((sa.get()[0] - c(7.0)).norm() < 1e-12, "mean of 5, 7, 9");
    }

    #[test]
    fn sliding_average_last_is_most_recent() {
        let mut sa = SlidingAverage::new(2, 2);
        assert!(sa.last().is_none());

        sa.update(&[c(1.0), c(2.0)]);
        sa.update(&[c(3.0), c(4.0)]);
        let last = sa.last().unwrap();
        assert_eq!(last[0], c(3.0));
        assert_eq!(last[1], c(4.0));
    }

    #[test]
    fn sliding_average_reset_clears() {
        let mut sa = SlidingAverage::new(4, 1);
        sa.update(&[c(10.0)]);
        sa.reset();
        assert!(sa.is_empty());
        assert_eq!(sa.get()[0], Complex64::new(0.0, 0.0));
    }

    #[test]
    fn leaky_integrator_converges_to_stationary_input() {
        let mut li = LeakyIntegrator::new(1, 0.8);
        for _ in 0..200 {
            li.update(&[c(2.0)]);
        }
        assert!(
            (li.get()[0] - c(2.0)).norm() < 1e-12,
            "leaky average of a constant converges to it, got {}",
            li.get()[0]
        );
    }

    #[test]
    fn leaky_integrator_seed_and_reset() {
        // Seed a 2x2 identity stored row-major.
        let seed = [c(0.01), c(0.0), c(0.0), c(0.01)];
        let mut li = LeakyIntegrator::with_seed(&seed, 0.8);
        assert_eq!(li.get()[0], c(0.01));

        li.update(&[c(1.0), c(0.0), c(0.0), c(1.0)]);
        assert!((li.get()[0] - c(0.8 * 0.01 + 0.2)).norm() < 1e-12);

        li.reset();
        assert_eq!(li.get()[3], c(0.01), "reset restores the seed");
    }

    #[test]
    fn leaky_integrator_single_step_weighting() {
        let mut li = LeakyIntegrator::new(1, 0.9);
        li.update(&[Complex64::new(1.0, -1.0)]);
        let expect = Complex64::new(0.1, -0.1);
        assert!((li.get()[0] - expect).norm() < 1e-12);
    }
}
