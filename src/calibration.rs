//! One-shot computation of the fixed beamforming weights.
//!
//! Calibration runs once, before streaming begins, on the STFT of a
//! dedicated calibration recording (for instance an i.i.d. ±1 sequence
//! played from the look direction). For every frequency bin it forms the
//! spatial covariance across channels, averaged over frames,
//!
//! ```text
//! R[f] = (1/frames) · Σ_t  x_t[f] · x_t[f]ᴴ
//! ```
//!
//! and takes the unit-norm eigenvector of the largest eigenvalue — only the
//! top eigenpair is needed, so it is extracted by power iteration rather
//! than a full decomposition. When the calibration source dominates the
//! scene this eigenvector approximates the steering vector toward it.
//!
//! The resulting [`FixedWeights`] are immutable for the lifetime of the
//! streaming session and carry the unit-norm invariant established here:
//! `‖w[f]‖ = 1` for every bin, computed once and never renormalized again.
//!
//! Bins with no energy at all have an undefined principal direction; those
//! fall back to the reference-channel selector (still unit-norm) with a
//! warning rather than returning an unstable vector.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{GscError, Result};

/// Total covariance energy (trace) under which a bin is treated as silent.
const ENERGY_FLOOR: f64 = 1e-18;

/// Power-iteration stopping tolerance on the Rayleigh quotient.
const EIG_TOL: f64 = 1e-12;
const EIG_MAX_ITER: usize = 200;

// ─────────────────── CalibrationRecording ───────────────────────

/// STFT frames of the calibration signal, `(frames, freq_bins, channels)`.
///
/// Built frame-by-frame as the recording streams in; read-only input to
/// [`compute_fixed_weights`] and discarded afterwards.
pub struct CalibrationRecording {
    nfreq: usize,
    nchan: usize,
    data: Vec<Complex64>,
}

impl CalibrationRecording {
    pub fn new(nfreq: usize, nchan: usize) -> Self {
        Self {
            nfreq,
            nchan,
            data: Vec::new(),
        }
    }

    /// Append one frame, `nfreq * nchan` values in bin-major layout.
    pub fn push_frame(&mut self, frame: &[Complex64]) -> Result<()> {
        let expected = self.nfreq * self.nchan;
        if frame.len() != expected {
            return Err(GscError::Shape {
                what: "calibration frame",
                expected,
                got: frame.len(),
            });
        }
        self.data.extend_from_slice(frame);
        Ok(())
    }

    pub fn nframes(&self) -> usize {
        self.data.len() / (self.nfreq * self.nchan)
    }

    pub fn nfreq(&self) -> usize {
        self.nfreq
    }

    pub fn nchannels(&self) -> usize {
        self.nchan
    }

    /// Channel vector of frame `t` at bin `f`.
    fn channels(&self, t: usize, f: usize) -> &[Complex64] {
        let start = (t * self.nfreq + f) * self.nchan;
        &self.data[start..start + self.nchan]
    }
}

// ────────────────────── FixedWeights ────────────────────────────

/// Calibration-derived beamforming weights, `(freq_bins, channels)`,
/// row-wise unit-norm. Immutable after calibration.
#[derive(Clone, Debug)]
pub struct FixedWeights {
    nfreq: usize,
    nchan: usize,
    data: Vec<Complex64>,
}

/// On-disk form: dimensions plus split real/imaginary arrays.
#[derive(Serialize, Deserialize)]
struct WeightsFile {
    nfreq: usize,
    nchannel: usize,
    fixed_weights_real: Vec<f64>,
    fixed_weights_imag: Vec<f64>,
}

impl FixedWeights {
    /// Assemble from a flat bin-major buffer, checking dimensions and the
    /// unit-norm invariant of every row.
    pub fn from_parts(nfreq: usize, nchan: usize, data: Vec<Complex64>) -> Result<Self> {
        if data.len() != nfreq * nchan {
            return Err(GscError::Shape {
                what: "fixed weights",
                expected: nfreq * nchan,
                got: data.len(),
            });
        }
        let w = Self { nfreq, nchan, data };
        for f in 0..nfreq {
            let norm: f64 = w.bin(f).iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
            if (norm - 1.0).abs() > 1e-6 {
                return Err(GscError::Config(format!(
                    "fixed weight row {f} is not unit-norm (‖w‖ = {norm})"
                )));
            }
        }
        Ok(w)
    }

    pub fn nfreq(&self) -> usize {
        self.nfreq
    }

    pub fn nchannels(&self) -> usize {
        self.nchan
    }

    /// Weight vector of bin `f`.
    pub fn bin(&self, f: usize) -> &[Complex64] {
        &self.data[f * self.nchan..(f + 1) * self.nchan]
    }

    /// Write to a JSON file (split real/imaginary arrays).
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = WeightsFile {
            nfreq: self.nfreq,
            nchannel: self.nchan,
            fixed_weights_real: self.data.iter().map(|v| v.re).collect(),
            fixed_weights_imag: self.data.iter().map(|v| v.im).collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read back from a JSON file, re-checking shape and unit norm.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: WeightsFile = serde_json::from_str(&content)?;
        if file.fixed_weights_real.len() != file.fixed_weights_imag.len() {
            return Err(GscError::Config(
                "weight file real/imag arrays differ in length".into(),
            ));
        }
        let data: Vec<Complex64> = file
            .fixed_weights_real
            .iter()
            .zip(file.fixed_weights_imag.iter())
            .map(|(&re, &im)| Complex64::new(re, im))
            .collect();
        Self::from_parts(file.nfreq, file.nchannel, data)
    }
}

// ───────────────────────── Calibration ──────────────────────────

/// Compute the per-bin unit-norm principal eigenvector of the calibration
/// spatial covariance.
///
/// Fails if the recording holds no frames. Silent bins (covariance trace
/// under the energy floor) fall back to the reference-channel selector.
pub fn compute_fixed_weights(rec: &CalibrationRecording) -> Result<FixedWeights> {
    let nframes = rec.nframes();
    if nframes < 1 {
        return Err(GscError::Calibration(
            "calibration recording holds no frames".into(),
        ));
    }
    let nchan = rec.nchannels();
    let nfreq = rec.nfreq();
    if nchan < 1 {
        return Err(GscError::Calibration("calibration needs ≥ 1 channel".into()));
    }

    let mut weights = vec![Complex64::new(0.0, 0.0); nfreq * nchan];
    let scale = Complex64::new(1.0 / nframes as f64, 0.0);
    let mut degenerate = 0usize;

    for f in 0..nfreq {
        // Hermitian spatial covariance at this bin, averaged over frames.
        let mut r = DMatrix::<Complex64>::zeros(nchan, nchan);
        for t in 0..nframes {
            let x = rec.channels(t, f);
            for i in 0..nchan {
                for j in 0..nchan {
                    r[(i, j)] += x[i] * x[j].conj();
                }
            }
        }
        r *= scale;

        let row = &mut weights[f * nchan..(f + 1) * nchan];
        let trace: f64 = (0..nchan).map(|i| r[(i, i)].re).sum();
        if trace < ENERGY_FLOOR {
            // Undefined principal direction; steer at the reference channel.
            row[0] = Complex64::new(1.0, 0.0);
            degenerate += 1;
            continue;
        }

        let v = principal_eigenvector(&r);
        row.copy_from_slice(v.as_slice());
    }

    if degenerate > 0 {
        log::warn!(
            "calibration: {degenerate}/{nfreq} bins carried no energy; \
             falling back to the reference channel there"
        );
    }

    FixedWeights::from_parts(nfreq, nchan, weights)
}

/// Top eigenpair of a Hermitian PSD matrix by power iteration, returned
/// unit-norm. Starts from the column with the largest norm.
fn principal_eigenvector(r: &DMatrix<Complex64>) -> DVector<Complex64> {
    let n = r.nrows();

    let start = (0..n)
        .max_by(|&a, &b| {
            r.column(a)
                .norm()
                .partial_cmp(&r.column(b).norm())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(0);
    let mut v: DVector<Complex64> = r.column(start).into_owned();
    let norm = v.norm();
    if norm > 0.0 {
        v /= Complex64::new(norm, 0.0);
    } else {
        v[0] = Complex64::new(1.0, 0.0);
    }

    let mut lambda = 0.0f64;
    for _ in 0..EIG_MAX_ITER {
        let mut next = r * &v;
        let next_norm = next.norm();
        if next_norm <= 0.0 {
            break;
        }
        next /= Complex64::new(next_norm, 0.0);
        // For a PSD matrix the iterate norm converges to the top eigenvalue.
        if (next_norm - lambda).abs() <= EIG_TOL * next_norm {
            v = next;
            break;
        }
        lambda = next_norm;
        v = next;
    }

    let norm = v.norm();
    v /= Complex64::new(norm, 0.0);
    v
}

// ─────────────────────────── Tests ──────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic ±1-ish excitation, different per (frame, bin).
    fn excitation(t: usize, f: usize) -> Complex64 {
        let s = if ((t * 7 + f * 13) % 17) < 8 { 1.0 } else { -1.0 };
        let phase = 0.61803 * (t * 3 + f) as f64;
        Complex64::new(s * phase.cos(), s * phase.sin())
    }

    /// Two-channel steering vector at bin `f` for a plain delay model.
    fn steering(f: usize, nfft: usize) -> [Complex64; 2] {
        let delay = 3.2; // samples
        let phase = -2.0 * std::f64::consts::PI * f as f64 * delay / nfft as f64;
        [
            Complex64::new(1.0, 0.0),
            Complex64::new(phase.cos(), phase.sin()),
        ]
    }

    fn make_recording(nfft: usize, nframes: usize) -> CalibrationRecording {
        let nfreq = nfft / 2 + 1;
        let mut rec = CalibrationRecording::new(nfreq, 2);
        let mut frame = vec![Complex64::new(0.0, 0.0); nfreq * 2];
        for t in 0..nframes {
            for f in 0..nfreq {
                let d = steering(f, nfft);
                let s = excitation(t, f);
                frame[f * 2] = s * d[0];
                frame[f * 2 + 1] = s * d[1];
            }
            rec.push_frame(&frame).unwrap();
        }
        rec
    }

    #[test]
    fn weights_are_unit_norm_on_every_bin() {
        let rec = make_recording(64, 40);
        let w = compute_fixed_weights(&rec).unwrap();
        for f in 0..w.nfreq() {
            let norm: f64 = w.bin(f).iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
            assert!(
                (norm - 1.0).abs() < 1e-9,
                "bin {f} weight norm {norm} is not 1"
            );
        }
    }

    #[test]
    fn weights_align_with_the_true_steering_vector() {
        let nfft = 64;
        let rec = make_recording(nfft, 60);
        let w = compute_fixed_weights(&rec).unwrap();

        for f in [3usize, 9, 17, 30] {
            let d = steering(f, nfft);
            let dnorm = (d[0].norm_sqr() + d[1].norm_sqr()).sqrt();
            let inner: Complex64 = w.bin(f)
                .iter()
                .zip(d.iter())
                .map(|(wi, di)| wi.conj() * di)
                .sum();
            let align = inner.norm() / dnorm;
            assert!(
                align > 1.0 - 1e-6,
                "bin {f}: |⟨w, d⟩| = {align}, expected ≈ 1 up to global phase"
            );
        }
    }

    #[test]
    fn eigenvector_residual_is_small() {
        let rec = make_recording(32, 30);
        let nchan = 2;
        let nframes = rec.nframes();
        let f = 5;

        let mut r = DMatrix::<Complex64>::zeros(nchan, nchan);
        for t in 0..nframes {
            let x = rec.channels(t, f);
            for i in 0..nchan {
                for j in 0..nchan {
                    r[(i, j)] += x[i] * x[j].conj();
                }
            }
        }
        r /= Complex64::new(nframes as f64, 0.0);

        let v = principal_eigenvector(&r);
        let rv = &r * &v;
        let lambda = rv.norm();
        let residual = (&rv - &v * Complex64::new(lambda, 0.0)).norm();
        assert!(
            residual < 1e-8 * lambda.max(1e-30),
            "R·v is not parallel to v: residual {residual:e} vs λ {lambda:e}"
        );
    }

    #[test]
    fn silent_bins_fall_back_to_the_reference_channel() {
        let mut rec = CalibrationRecording::new(5, 3);
        let frame = vec![Complex64::new(0.0, 0.0); 5 * 3];
        rec.push_frame(&frame).unwrap();
        rec.push_frame(&frame).unwrap();

        let w = compute_fixed_weights(&rec).unwrap();
        for f in 0..5 {
            assert_eq!(w.bin(f)[0], Complex64::new(1.0, 0.0));
            let norm: f64 = w.bin(f).iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
            assert!((norm - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn empty_recording_is_rejected() {
        let rec = CalibrationRecording::new(8, 2);
        assert!(matches!(
            compute_fixed_weights(&rec),
            Err(GscError::Calibration(_))
        ));
    }

    #[test]
    fn push_frame_rejects_wrong_shape() {
        let mut rec = CalibrationRecording::new(8, 2);
        let bad = vec![Complex64::new(0.0, 0.0); 7];
        assert!(matches!(
            rec.push_frame(&bad),
            Err(GscError::Shape { .. })
        ));
    }

    #[test]
    fn weights_survive_a_save_load_round_trip() {
        let rec = make_recording(16, 20);
        let w = compute_fixed_weights(&rec).unwrap();

        let path = std::env::temp_dir().join("gsc_rt_calibration_roundtrip.json");
        w.save(&path).unwrap();
        let back = FixedWeights::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(back.nfreq(), w.nfreq());
        assert_eq!(back.nchannels(), w.nchannels());
        for f in 0..w.nfreq() {
            for (a, b) in w.bin(f).iter().zip(back.bin(f).iter()) {
                assert!((a - b).norm() < 1e-15, "bin {f} changed across the round trip");
            }
        }
    }

    #[test]
    fn from_parts_rejects_non_unit_rows() {
        let data = vec![Complex64::new(2.0, 0.0), Complex64::new(0.0, 0.0)];
        assert!(matches!(
            FixedWeights::from_parts(1, 2, data),
            Err(GscError::Config(_))
        ));
    }
}
