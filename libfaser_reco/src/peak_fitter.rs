use std::f64::consts::PI;

use super::constants::{
    CB_ALPHA_INITIAL, CB_ALPHA_MAX, CB_ALPHA_MIN, CB_INTEGRATION_STEP_NS, CB_N_INITIAL, CB_N_MAX,
    DEFAULT_RAW_SIGMA_NS, GAUSS_SIGMA_MAX_NS, SAMPLE_PERIOD_NS,
};
use super::fit::{crystal_ball, gaussian, rising_crossing, LeastSquares, ParamSpec};

/// Pulse parameters, from moments of the samples or from a fit
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeakEstimate {
    pub peak: f64,
    pub mean: f64,
    pub sigma: f64,
    pub integral: f64,
    pub localtime: f64,
    pub alpha: f64,
    pub nval: f64,
    pub chi2ndf: f64,
}

/// Everything the fitter learned about one windowed pulse
#[derive(Debug, Clone, PartialEq)]
pub struct PeakFitOutcome {
    pub raw: PeakEstimate,
    pub gauss: Option<PeakEstimate>,
    pub crystal_ball: Option<PeakEstimate>,
    pub overflow: bool,
    /// Samples seen by the Crystal Ball fit (overflow removed)
    pub time: Vec<f64>,
    pub voltage: Vec<f64>,
}

impl PeakFitOutcome {
    /// Crystal Ball if it worked, else gaussian, else the raw moments
    pub fn best(&self) -> PeakEstimate {
        self.crystal_ball.or(self.gauss).unwrap_or(self.raw)
    }
}

/// Gaussian then Crystal Ball fit of a windowed pulse (time in ns, voltage in mV, positive)
#[derive(Debug, Clone, Copy)]
pub struct PeakFitter {
    pub timing_peak_fraction: f64,
    pub remove_overflow: bool,
    pub fitter: LeastSquares,
}

impl Default for PeakFitter {
    fn default() -> Self {
        Self {
            timing_peak_fraction: 0.4,
            remove_overflow: true,
            fitter: LeastSquares::default(),
        }
    }
}

impl PeakFitter {
    /// Run the full fit chain over one window.
    ///
    /// `overflow_level` is the corrected voltage a saturated ADC sample turns into.
    pub fn fit(&self, time: &[f64], voltage: &[f64], overflow_level: f64) -> PeakFitOutcome {
        let raw = self.raw_estimate(time, voltage);
        let gauss = self.fit_gaussian(time, voltage, &raw);

        let mut t = time.to_vec();
        let mut v = voltage.to_vec();
        let overflow = self.remove_overflow && remove_overflow(&mut t, &mut v, overflow_level);
        if overflow {
            log::debug!(
                "Removed {} saturated samples before the Crystal Ball fit",
                time.len() - t.len()
            );
        }

        let seed = gauss.unwrap_or(raw);
        let crystal_ball = self.fit_crystal_ball(&t, &v, &seed, time);

        PeakFitOutcome {
            raw,
            gauss,
            crystal_ball,
            overflow,
            time: t,
            voltage: v,
        }
    }

    /// Moments of the window. Never returns a non-finite value.
    pub fn raw_estimate(&self, time: &[f64], voltage: &[f64]) -> PeakEstimate {
        if time.is_empty() || voltage.len() != time.len() {
            return PeakEstimate::default();
        }
        let (imax, peak) = voltage
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(im, vm), (i, v)| {
                if v > vm {
                    (i, v)
                } else {
                    (im, vm)
                }
            });
        let (sum, sum_t, sum_t2) = time
            .iter()
            .zip(voltage.iter())
            .fold((0.0, 0.0, 0.0), |(s, st, st2), (t, v)| {
                (s + v, st + t * v, st2 + t * t * v)
            });
        let t_first = time[0];
        let t_last = time[time.len() - 1];

        let mut mean = sum_t / sum;
        if !mean.is_finite() {
            mean = time[imax];
        }
        let mut sigma = (sum_t2 / sum - mean * mean).sqrt();
        if !sigma.is_finite() || sigma <= 0.0 {
            sigma = DEFAULT_RAW_SIGMA_NS;
        }
        mean = mean.clamp(t_first, t_last);

        let level = peak * self.timing_peak_fraction;
        let localtime = sample_crossing(time, voltage, level).unwrap_or(time[imax]);

        PeakEstimate {
            peak,
            mean,
            sigma,
            integral: SAMPLE_PERIOD_NS * sum,
            localtime,
            ..Default::default()
        }
    }

    /// Gaussian fit seeded by the raw moments. None when the fit or its timing fails.
    pub fn fit_gaussian(
        &self,
        time: &[f64],
        voltage: &[f64],
        raw: &PeakEstimate,
    ) -> Option<PeakEstimate> {
        let errors = vec![1.0; time.len()];
        let fit = self.fitter.fit_curve(
            time,
            voltage,
            &errors,
            gaussian,
            &[
                ParamSpec::free(raw.peak),
                ParamSpec::free(raw.mean),
                ParamSpec::bounded(raw.sigma, 0.0, GAUSS_SIGMA_MAX_NS),
            ],
        );
        if !fit.is_valid() {
            log::debug!("Gaussian fit did not converge");
            return None;
        }
        let p = &fit.params;
        let (peak, mean, sigma) = (p[0], p[1], p[2].abs());
        let localtime = self.leading_edge(|t| gaussian(t, p), peak, time[0], mean)?;
        Some(PeakEstimate {
            peak,
            mean,
            sigma,
            integral: peak * sigma * (2.0 * PI).sqrt(),
            localtime,
            chi2ndf: fit.reduced_chi2(),
            ..Default::default()
        })
    }

    /// Two stage Crystal Ball fit: tail power fixed first, then released.
    ///
    /// `window` is the full time range of the slice, used to integrate the fitted shape.
    pub fn fit_crystal_ball(
        &self,
        time: &[f64],
        voltage: &[f64],
        seed: &PeakEstimate,
        window: &[f64],
    ) -> Option<PeakEstimate> {
        if time.is_empty() || window.is_empty() {
            return None;
        }
        let errors = vec![1.0; time.len()];
        let sigma = seed.sigma.clamp(1.0e-3, GAUSS_SIGMA_MAX_NS);
        let first = self.fitter.fit_curve(
            time,
            voltage,
            &errors,
            crystal_ball,
            &[
                ParamSpec::free(seed.peak),
                ParamSpec::free(seed.mean),
                ParamSpec::bounded(sigma, 0.0, GAUSS_SIGMA_MAX_NS),
                ParamSpec::bounded(CB_ALPHA_INITIAL, CB_ALPHA_MIN, CB_ALPHA_MAX),
                ParamSpec::fixed(CB_N_INITIAL),
            ],
        );
        if !first.is_valid() {
            log::debug!("Crystal Ball fit with fixed tail did not converge");
            return None;
        }
        let p1 = &first.params;
        let second = self.fitter.fit_curve(
            time,
            voltage,
            &errors,
            crystal_ball,
            &[
                ParamSpec::free(p1[0]),
                ParamSpec::free(p1[1]),
                ParamSpec::bounded(p1[2], 0.0, GAUSS_SIGMA_MAX_NS),
                ParamSpec::bounded(p1[3], CB_ALPHA_MIN, CB_ALPHA_MAX),
                ParamSpec::bounded(p1[4], 0.0, CB_N_MAX),
            ],
        );
        if !second.is_valid() {
            log::debug!("Crystal Ball fit with free tail did not converge");
            return None;
        }
        let p = &second.params;
        let (peak, mean, sigma) = (p[0], p[1], p[2].abs());
        let localtime = self.leading_edge(|t| crystal_ball(t, p), peak, window[0], mean)?;
        let integral = integrate(
            |t| crystal_ball(t, p),
            window[0],
            window[window.len() - 1],
            CB_INTEGRATION_STEP_NS,
        );
        if !integral.is_finite() {
            return None;
        }
        Some(PeakEstimate {
            peak,
            mean,
            sigma,
            integral,
            localtime,
            alpha: p[3],
            nval: p[4],
            chi2ndf: second.reduced_chi2(),
        })
    }

    fn leading_edge<F: Fn(f64) -> f64>(&self, f: F, peak: f64, start: f64, mean: f64) -> Option<f64> {
        let level = peak * self.timing_peak_fraction;
        rising_crossing(f, level, start, mean).filter(|t| t.is_finite())
    }
}

/// Strip the contiguous run of saturated samples around the first maximum. Returns true if
/// any sample was removed.
pub fn remove_overflow(time: &mut Vec<f64>, voltage: &mut Vec<f64>, level: f64) -> bool {
    // Saturated samples tie, and the earliest run belongs to the primary pulse
    let Some(imax) = voltage
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, top)) if v <= top => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
    else {
        return false;
    };
    let saturated = |v: f64| v >= level - 1.0e-9;
    if !saturated(voltage[imax]) {
        return false;
    }
    let mut lo = imax;
    while lo > 0 && saturated(voltage[lo - 1]) {
        lo -= 1;
    }
    let mut hi = imax;
    while hi + 1 < voltage.len() && saturated(voltage[hi + 1]) {
        hi += 1;
    }
    time.drain(lo..=hi);
    voltage.drain(lo..=hi);
    true
}

/// Linear interpolation of the first upward crossing of `level` by the samples
fn sample_crossing(time: &[f64], voltage: &[f64], level: f64) -> Option<f64> {
    if voltage.first().is_some_and(|v| *v >= level) {
        return Some(time[0]);
    }
    voltage.windows(2).enumerate().find_map(|(i, w)| {
        (w[0] < level && w[1] >= level).then(|| {
            let frac = (level - w[0]) / (w[1] - w[0]);
            time[i] + frac * (time[i + 1] - time[i])
        })
    })
}

fn integrate<F: Fn(f64) -> f64>(f: F, start: f64, stop: f64, step: f64) -> f64 {
    if stop <= start {
        return 0.0;
    }
    let n = ((stop - start) / step).ceil().max(1.0) as usize;
    let h = (stop - start) / n as f64;
    let interior: f64 = (1..n).map(|i| f(start + i as f64 * h)).sum();
    h * (0.5 * (f(start) + f(stop)) + interior)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_pulse(peak: f64, mean: f64, sigma: f64, n: usize) -> (Vec<f64>, Vec<f64>) {
        let time: Vec<f64> = (0..n).map(|i| i as f64 * SAMPLE_PERIOD_NS).collect();
        let volt = time
            .iter()
            .map(|t| gaussian(*t, &[peak, mean, sigma]))
            .collect();
        (time, volt)
    }

    #[test]
    fn test_raw_estimate() {
        let (time, volt) = synthetic_pulse(1000.0, 50.0, 5.0, 50);
        let raw = PeakFitter::default().raw_estimate(&time, &volt);
        assert!((raw.mean - 50.0).abs() < 1e-6);
        assert!((raw.sigma - 5.0).abs() < 1e-3);
        assert_eq!(raw.peak, 1000.0);
        let expected_integral = 1000.0 * 5.0 * (2.0 * PI).sqrt();
        assert!((raw.integral - expected_integral).abs() / expected_integral < 1e-3);
    }

    #[test]
    fn test_raw_estimate_guards() {
        let time = vec![0.0, 2.0, 4.0, 6.0];
        let volt = vec![0.0, 0.0, 0.0, 0.0];
        let raw = PeakFitter::default().raw_estimate(&time, &volt);
        assert!(raw.mean.is_finite());
        assert!(raw.mean >= 0.0 && raw.mean <= 6.0);
        assert_eq!(raw.sigma, DEFAULT_RAW_SIGMA_NS);

        // Negative net charge pushes the first moment out of the window
        let volt = vec![-1.0, -1.0, 0.5, -1.0];
        let raw = PeakFitter::default().raw_estimate(&time, &volt);
        assert!(raw.mean >= 0.0 && raw.mean <= 6.0);
        assert!(raw.sigma.is_finite());
    }

    #[test]
    fn test_gaussian_pulse_fit() {
        let (time, volt) = synthetic_pulse(1000.0, 50.0, 5.0, 50);
        let fitter = PeakFitter::default();
        let outcome = fitter.fit(&time, &volt, f64::INFINITY);
        let gauss = outcome.gauss.expect("gaussian fit failed");
        assert!((gauss.peak - 1000.0).abs() / 1000.0 < 0.01);
        assert!((gauss.mean - 50.0).abs() / 50.0 < 0.01);
        assert!((gauss.sigma - 5.0).abs() / 5.0 < 0.01);
        let expected = 50.0 - 5.0 * (2.0 * (1.0f64 / 0.4).ln()).sqrt();
        assert!((gauss.localtime - expected).abs() < 0.01);
        assert!(!outcome.overflow);
    }

    #[test]
    fn test_crystal_ball_tail() {
        let time: Vec<f64> = (0..60).map(|i| i as f64 * SAMPLE_PERIOD_NS).collect();
        let truth = [500.0, 40.0, 4.0, -1.0, 3.0];
        let volt: Vec<f64> = time.iter().map(|t| crystal_ball(*t, &truth)).collect();
        let outcome = PeakFitter::default().fit(&time, &volt, f64::INFINITY);
        let cb = outcome.crystal_ball.expect("crystal ball fit failed");
        assert!((cb.peak - 500.0).abs() / 500.0 < 0.02);
        assert!((cb.mean - 40.0).abs() < 0.2);
        assert!(cb.alpha < 0.0);
        assert!(cb.localtime < cb.mean);
        assert_eq!(outcome.best(), cb);
    }

    #[test]
    fn test_overflow_removal() {
        let mut time: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let mut volt = vec![0.0, 5.0, 100.0, 100.0, 100.0, 40.0, 100.0, 3.0];
        assert!(remove_overflow(&mut time, &mut volt, 100.0));
        assert_eq!(volt, vec![0.0, 5.0, 40.0, 100.0, 3.0]);
        assert_eq!(time, vec![0.0, 1.0, 5.0, 6.0, 7.0]);
        assert!(!remove_overflow(&mut time, &mut vec![1.0, 2.0], 100.0));
    }

    #[test]
    fn test_overflow_removal_keeps_later_runs() {
        let mut time: Vec<f64> = (0..9).map(|i| i as f64).collect();
        let mut volt = vec![1.0, 80.0, 80.0, 20.0, 80.0, 80.0, 80.0, 10.0, 2.0];
        assert!(remove_overflow(&mut time, &mut volt, 80.0));
        assert_eq!(volt, vec![1.0, 20.0, 80.0, 80.0, 80.0, 10.0, 2.0]);
        assert_eq!(time, vec![0.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_saturated_pulse_sets_overflow() {
        let (time, volt) = synthetic_pulse(1000.0, 50.0, 5.0, 50);
        let clipped: Vec<f64> = volt.iter().map(|v| v.min(800.0)).collect();
        let outcome = PeakFitter::default().fit(&time, &clipped, 800.0);
        assert!(outcome.overflow);
        assert!(outcome.voltage.iter().all(|v| *v < 800.0));
        assert!(outcome.best().peak.is_finite());
    }
}
