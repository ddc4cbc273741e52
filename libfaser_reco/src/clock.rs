use std::f64::consts::PI;

use nalgebra::Complex;
use serde::{Deserialize, Serialize};

use super::constants::{
    DEFAULT_CLOCK_MIN_SAMPLES, LHC_CLOCK_MAX_MHZ, LHC_CLOCK_MIN_MHZ, SAMPLE_PERIOD_NS,
};
use super::fit::{LeastSquares, ParamSpec};
use super::waveform::RawWaveform;

/// Digitizer clock reconstructed for one event.
///
/// A frequency of zero marks a clock that could not be recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveformClock {
    /// MHz
    pub frequency: f64,
    /// rad, in [-pi, pi]
    pub phase: f64,
    /// mV
    pub dc_offset: f64,
    /// mV, peak to peak
    pub amplitude: f64,
}

impl WaveformClock {
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.frequency > 0.0
    }

    /// Period in ns
    pub fn period(&self) -> f64 {
        1000.0 / self.frequency
    }

    /// Time in ns since the last rising edge of the clock, for an absolute time `t` in ns
    pub fn time_from_clock(&self, t: f64) -> f64 {
        let phase_cycles = self.phase / (2.0 * PI);
        let ncycle = (t * self.frequency / 1000.0 + phase_cycles + 0.25).floor();
        t - (ncycle - phase_cycles - 0.25) * 1000.0 / self.frequency
    }
}

/// Recovers the LHC clock from the digitizer clock channel with a discrete Fourier transform
#[derive(Debug, Clone, Copy)]
pub struct ClockPhaseExtractor {
    pub min_samples: usize,
    pub min_amplitude_mv: f64,
    pub min_frequency_mhz: f64,
    pub max_frequency_mhz: f64,
    /// Follow the bin interpolation with a sinusoid fit in the time domain. The interpolation
    /// alone is biased by the mirror line on short waveforms.
    pub refine_with_fit: bool,
}

impl Default for ClockPhaseExtractor {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_CLOCK_MIN_SAMPLES,
            min_amplitude_mv: 500.0,
            min_frequency_mhz: LHC_CLOCK_MIN_MHZ,
            max_frequency_mhz: LHC_CLOCK_MAX_MHZ,
            refine_with_fit: false,
        }
    }
}

impl ClockPhaseExtractor {
    pub fn extract(&self, wave: &RawWaveform) -> WaveformClock {
        let n = wave.len();
        if n < self.min_samples.max(4) {
            log::warn!(
                "Clock waveform has {} samples, need at least {}",
                n,
                self.min_samples
            );
            return WaveformClock::invalid();
        }
        let spectrum = real_dft(&wave.adc_counts);
        let magnitude: Vec<f64> = spectrum
            .iter()
            .enumerate()
            .map(|(k, c)| {
                let scale = if k == 0 { 1.0 } else { 2.0 };
                scale * c.norm() / n as f64
            })
            .collect();

        let last = magnitude.len() - 1;
        let Some(imax) = (1..=last).max_by(|a, b| magnitude[*a].total_cmp(&magnitude[*b])) else {
            return WaveformClock::invalid();
        };
        if magnitude[imax] <= 1.0e-9 * magnitude[0].max(1.0) {
            log::warn!("Clock spectrum has no line above DC");
            return WaveformClock::invalid();
        }

        let right = (imax < last).then(|| magnitude[imax + 1]).unwrap_or(0.0);
        let left = (imax > 1).then(|| magnitude[imax - 1]).unwrap_or(0.0);
        let dm = if right > left {
            right / (magnitude[imax] + right)
        } else {
            -left / (magnitude[imax] + left)
        };

        let mv_per_bit = wave.mv_per_bit();
        let frequency = (imax as f64 + dm) * 1000.0 / (SAMPLE_PERIOD_NS * n as f64);
        let phase = wrap_phase(spectrum[imax].im.atan2(spectrum[imax].re) - dm * PI);
        let amplitude = if dm.abs() < 1.0e-12 {
            2.0 * mv_per_bit * magnitude[imax]
        } else {
            mv_per_bit * 2.0 * PI * dm * magnitude[imax] / (PI * dm).sin()
        };
        let mut clock = WaveformClock {
            frequency,
            phase,
            dc_offset: magnitude[0] * mv_per_bit,
            amplitude,
        };
        if self.refine_with_fit {
            clock = refine(wave, clock);
        }
        let WaveformClock {
            frequency,
            phase,
            amplitude,
            ..
        } = clock;
        if ![frequency, phase, clock.dc_offset, amplitude]
            .iter()
            .all(|v| v.is_finite())
            || frequency <= 0.0
        {
            log::warn!("Clock reconstruction produced a non-finite result");
            return WaveformClock::invalid();
        }

        if amplitude < self.min_amplitude_mv {
            log::warn!("Clock amplitude {amplitude:.1} mV is below {} mV", self.min_amplitude_mv);
        }
        if frequency < self.min_frequency_mhz || frequency > self.max_frequency_mhz {
            log::warn!(
                "Clock frequency {frequency:.4} MHz outside [{}, {}] MHz",
                self.min_frequency_mhz,
                self.max_frequency_mhz
            );
        }
        log::debug!(
            "Clock: {frequency:.4} MHz, phase {phase:.4} rad, offset {:.1} mV, amplitude {amplitude:.1} mV",
            clock.dc_offset
        );
        clock
    }
}

/// Least squares fit of `offset + a * cos(2 pi f t + phase)` to the samples, seeded by the
/// spectral estimate. The seed is returned unchanged if the fit fails.
fn refine(wave: &RawWaveform, seed: WaveformClock) -> WaveformClock {
    let mv_per_bit = wave.mv_per_bit();
    let n = wave.len();
    let bin_mhz = 1000.0 / (SAMPLE_PERIOD_NS * n as f64);
    let t: Vec<f64> = (0..n).map(RawWaveform::time_of).collect();
    let y: Vec<f64> = wave.adc_counts.iter().map(|&c| c as f64).collect();
    let errors = vec![1.0; n];
    let fit = LeastSquares::default().fit_curve(
        &t,
        &y,
        &errors,
        |t, p| p[0] + p[1] * (2.0 * PI * p[2] * t / 1000.0 + p[3]).cos(),
        &[
            ParamSpec::free(seed.dc_offset / mv_per_bit),
            ParamSpec::bounded(seed.amplitude / (2.0 * mv_per_bit), 0.0, f64::INFINITY),
            ParamSpec::bounded(
                seed.frequency,
                seed.frequency - bin_mhz,
                seed.frequency + bin_mhz,
            ),
            ParamSpec::free(seed.phase),
        ],
    );
    if !fit.is_valid() {
        log::debug!("Clock sinusoid fit failed, keeping the spectral estimate");
        return seed;
    }
    WaveformClock {
        frequency: fit.params[2],
        phase: wrap_phase(fit.params[3]),
        dc_offset: fit.params[0] * mv_per_bit,
        amplitude: 2.0 * fit.params[1] * mv_per_bit,
    }
}

/// One-sided DFT of a real sequence, bins 0..=N/2
fn real_dft(samples: &[u16]) -> Vec<Complex<f64>> {
    let n = samples.len();
    let step = 2.0 * PI / n as f64;
    (0..=n / 2)
        .map(|k| {
            samples
                .iter()
                .enumerate()
                .fold(Complex::new(0.0, 0.0), |acc, (i, &s)| {
                    // Reduce the angle index first to keep the argument small
                    let angle = -step * ((k * i) % n) as f64;
                    acc + Complex::new(angle.cos(), angle.sin()) * s as f64
                })
        })
        .collect()
}

fn wrap_phase(phase: f64) -> f64 {
    let mut p = phase;
    while p > PI {
        p -= 2.0 * PI;
    }
    while p < -PI {
        p += 2.0 * PI;
    }
    p
}
