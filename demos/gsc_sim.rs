//! Example: run the sidelobe canceller on a synthetic frequency-domain scene.
//!
//! A 4-microphone line array is calibrated on a source at one direction,
//! then streamed frames of interference from another direction. The demo
//! reports how much interference power survives at the output, for both
//! adaptive variants.
//!
//! Usage: cargo run --example gsc_sim [frames]

use gsc_rt::{
    compute_fixed_weights, CalibrationRecording, Gsc, GscConfig,
};
use num_complex::Complex64;

const NFFT: usize = 256;
const NCHAN: usize = 4;
const FS: f64 = 16000.0;

/// Per-channel phase ramp of a far-field source at a given inter-channel
/// delay (in samples).
fn steering(f: usize, chan: usize, delay: f64) -> Complex64 {
    let phase = -2.0 * std::f64::consts::PI * f as f64 * chan as f64 * delay / NFFT as f64;
    Complex64::new(phase.cos(), phase.sin())
}

/// Small deterministic generator for the source excitations.
struct Lcg(u64);

impl Lcg {
    fn next_f64(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
    }

    fn next_complex(&mut self) -> Complex64 {
        Complex64::new(self.next_f64(), self.next_f64())
    }
}

fn fill_frame(frame: &mut [Complex64], rng: &mut Lcg, delay: f64) {
    let nfreq = NFFT / 2 + 1;
    for f in 0..nfreq {
        let s = rng.next_complex();
        for c in 0..NCHAN {
            frame[f * NCHAN + c] = s * steering(f, c, delay);
        }
    }
}

fn run_session(mut gsc: Gsc, frames: usize, interferer_delay: f64) -> (f64, f64) {
    let nfreq = NFFT / 2 + 1;
    let mut rng = Lcg(0x9e3779b97f4a7c15);
    let mut input = vec![Complex64::new(0.0, 0.0); nfreq * NCHAN];
    let mut output = vec![Complex64::new(0.0, 0.0); nfreq];

    let mut in_power = 0.0;
    let mut out_power = 0.0;
    let tail = (frames / 4).max(1);
    for t in 0..frames {
        fill_frame(&mut input, &mut rng, interferer_delay);
        gsc.process(&input, &mut output).expect("frame shape is fixed");

        // Measure over the last quarter, after adaptation has settled.
        if t >= frames - tail {
            in_power += input
                .chunks_exact(NCHAN)
                .map(|bin| bin[0].norm_sqr())
                .sum::<f64>();
            out_power += output.iter().map(|v| v.norm_sqr()).sum::<f64>();
        }
    }
    (in_power / tail as f64, out_power / tail as f64)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let frames: usize = std::env::args()
        .nth(1)
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(2000);

    let target_delay = 1.8;
    let interferer_delay = 0.4;
    let nfreq = NFFT / 2 + 1;

    // Calibrate on the target direction alone.
    println!("Calibrating on 100 frames of the target source...");
    let mut rec = CalibrationRecording::new(nfreq, NCHAN);
    let mut rng = Lcg(42);
    let mut frame = vec![Complex64::new(0.0, 0.0); nfreq * NCHAN];
    for _ in 0..100 {
        fill_frame(&mut frame, &mut rng, target_delay);
        rec.push_frame(&frame)?;
    }
    let weights = compute_fixed_weights(&rec)?;
    println!("Calibrated {} bins x {} channels.", weights.nfreq(), weights.nchannels());

    // Stream interference through both variants.
    for (name, config) in [
        ("NLMS", GscConfig::nlms(NFFT, NCHAN, FS, 0.05)),
        ("Newton", GscConfig::newton(NFFT, NCHAN, FS, 2)),
    ] {
        let gsc = Gsc::new(config, weights.clone())?;
        let (in_power, out_power) = run_session(gsc, frames, interferer_delay);
        let attenuation = 10.0 * (in_power / out_power.max(1e-300)).log10();
        println!(
            "{name:>7}: reference-channel power {in_power:10.3e}, \
             output power {out_power:10.3e}  ->  {attenuation:6.1} dB attenuation"
        );
    }

    Ok(())
}
