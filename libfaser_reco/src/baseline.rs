use super::constants::{
    COARSE_HIST_BINS, COARSE_HIST_MAX, COARSE_HIST_MIN, DEFAULT_BASELINE_SAMPLES,
    FINE_HIST_WIDTH, MIN_BASELINE_FIT_BINS,
};
use super::fit::{gaussian, LeastSquares, ParamSpec};

/// Pedestal of a waveform in ADC counts
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BaselineResult {
    pub mean: f64,
    pub rms: f64,
    /// Height of the pedestal peak (entries); only meaningful for the histogram method
    pub peak: f64,
    pub valid: bool,
}

/// A way of estimating the pedestal of a raw waveform
pub trait BaselineStrategy {
    fn estimate(&self, counts: &[u16]) -> BaselineResult;
}

/// Average of the first samples of the waveform
#[derive(Debug, Clone, Copy)]
pub struct SimpleBaseline {
    pub n_samples: usize,
}

impl Default for SimpleBaseline {
    fn default() -> Self {
        Self {
            n_samples: DEFAULT_BASELINE_SAMPLES,
        }
    }
}

impl BaselineStrategy for SimpleBaseline {
    fn estimate(&self, counts: &[u16]) -> BaselineResult {
        if self.n_samples == 0 || counts.len() < self.n_samples {
            log::debug!(
                "Simple baseline needs {} samples, waveform has {}",
                self.n_samples,
                counts.len()
            );
            return BaselineResult::default();
        }
        let n = self.n_samples as f64;
        let (sum, sum2) = counts[..self.n_samples]
            .iter()
            .fold((0.0, 0.0), |(s, s2), &c| {
                let c = c as f64;
                (s + c, s2 + c * c)
            });
        let mean = sum / n;
        let rms = (sum2 / n - mean * mean).max(0.0).sqrt();
        BaselineResult {
            mean,
            rms,
            peak: 0.0,
            valid: true,
        }
    }
}

/// Two pass histogram of the pedestal region followed by a gaussian fit of the pedestal peak
#[derive(Debug, Clone, Copy)]
pub struct AdvancedBaseline {
    pub coarse_bins: usize,
    pub coarse_min: f64,
    pub coarse_max: f64,
    pub fine_width: usize,
    /// First sample considered
    pub range_start: usize,
    /// One past the last sample considered, None for the whole waveform
    pub range_end: Option<usize>,
    pub fitter: LeastSquares,
}

impl Default for AdvancedBaseline {
    fn default() -> Self {
        Self {
            coarse_bins: COARSE_HIST_BINS,
            coarse_min: COARSE_HIST_MIN,
            coarse_max: COARSE_HIST_MAX,
            fine_width: FINE_HIST_WIDTH,
            range_start: 0,
            range_end: None,
            fitter: LeastSquares::default(),
        }
    }
}

impl AdvancedBaseline {
    /// Coarse pass: centre of the most populated bin
    fn find_mode(&self, samples: &[u16]) -> Option<f64> {
        let bin_width = (self.coarse_max - self.coarse_min) / self.coarse_bins as f64;
        let mut hist = vec![0usize; self.coarse_bins];
        for &s in samples {
            let s = s as f64;
            if s < self.coarse_min || s >= self.coarse_max {
                continue;
            }
            let bin = (((s - self.coarse_min) / bin_width) as usize).min(self.coarse_bins - 1);
            hist[bin] += 1;
        }
        let mut mode = 0;
        for (bin, &count) in hist.iter().enumerate() {
            if count > hist[mode] {
                mode = bin;
            }
        }
        if hist[mode] == 0 {
            return None;
        }
        Some(self.coarse_min + (mode as f64 + 0.5) * bin_width)
    }
}

impl BaselineStrategy for AdvancedBaseline {
    fn estimate(&self, counts: &[u16]) -> BaselineResult {
        let end = self.range_end.unwrap_or(counts.len()).min(counts.len());
        if self.range_start >= end || self.coarse_bins == 0 || self.fine_width == 0 {
            return BaselineResult::default();
        }
        let samples = &counts[self.range_start..end];
        let Some(centre) = self.find_mode(samples) else {
            log::debug!("Baseline histogram is empty");
            return BaselineResult::default();
        };

        // Fine pass: one bin per ADC count, bin i holds the value low + i
        let low = (centre - self.fine_width as f64 / 2.0).floor();
        let mut fine = vec![0usize; self.fine_width];
        for &s in samples {
            let offset = s as f64 - low;
            if offset >= 0.0 && offset < self.fine_width as f64 {
                fine[offset as usize] += 1;
            }
        }
        let entries: usize = fine.iter().sum();
        if entries == 0 {
            return BaselineResult::default();
        }
        let (sum, sum2) = fine.iter().enumerate().fold((0.0, 0.0), |(s, s2), (i, &c)| {
            let v = low + i as f64;
            (s + v * c as f64, s2 + v * v * c as f64)
        });
        let mean = sum / entries as f64;
        let rms = (sum2 / entries as f64 - mean * mean).max(0.0).sqrt();
        let max_count = fine.iter().copied().max().unwrap_or(0) as f64;
        let pre_fit = BaselineResult {
            mean,
            rms,
            peak: max_count,
            valid: false,
        };

        let (x, y): (Vec<f64>, Vec<f64>) = fine
            .iter()
            .enumerate()
            .map(|(i, &c)| (low + i as f64, c as f64))
            .filter(|(v, c)| *c > 0.0 && (v - mean).abs() <= 2.0 * rms)
            .unzip();
        if x.len() < MIN_BASELINE_FIT_BINS {
            // A quiet pedestal spans too few counts to constrain the gaussian, the histogram
            // moments are the measurement
            return BaselineResult {
                valid: true,
                ..pre_fit
            };
        }
        let errors: Vec<f64> = y.iter().map(|c| c.sqrt()).collect();
        let fit = self.fitter.fit_curve(
            &x,
            &y,
            &errors,
            gaussian,
            &[
                ParamSpec::free(max_count),
                ParamSpec::free(mean),
                ParamSpec::bounded(rms, 1.0e-6, f64::INFINITY),
            ],
        );
        if !fit.is_valid() {
            log::debug!(
                "Baseline gaussian fit failed, keeping histogram mean {mean:.2} and rms {rms:.2}"
            );
            return pre_fit;
        }
        BaselineResult {
            mean: fit.params[1],
            rms: fit.params[2].abs(),
            peak: fit.params[0],
            valid: true,
        }
    }
}

/// The baseline algorithm chosen by configuration
#[derive(Debug, Clone, Copy)]
pub enum BaselineEstimator {
    Simple(SimpleBaseline),
    Advanced(AdvancedBaseline),
}

impl BaselineStrategy for BaselineEstimator {
    fn estimate(&self, counts: &[u16]) -> BaselineResult {
        match self {
            Self::Simple(b) => b.estimate(counts),
            Self::Advanced(b) => b.estimate(counts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_simple_constant() {
        let wave = vec![8000u16; 100];
        let result = SimpleBaseline::default().estimate(&wave);
        assert!(result.valid);
        assert_eq!(result.mean, 8000.0);
        assert_eq!(result.rms, 0.0);
    }

    #[test]
    fn test_simple_too_short() {
        let wave = vec![8000u16; 39];
        assert!(!SimpleBaseline::default().estimate(&wave).valid);
    }

    #[test]
    fn test_advanced_constant() {
        let wave = vec![8000u16; 100];
        let result = AdvancedBaseline::default().estimate(&wave);
        assert!(result.valid);
        assert_eq!(result.mean, 8000.0);
        assert_eq!(result.rms, 0.0);
        assert!(result.peak.is_finite());
    }

    #[test]
    fn test_advanced_quiet_pedestal() {
        let two: Vec<u16> = (0..300).map(|i| 8000 + (i % 2) as u16).collect();
        let result = AdvancedBaseline::default().estimate(&two);
        assert!(result.valid);
        assert!((result.mean - 8000.5).abs() < 1e-6);
        assert!((result.rms - 0.5).abs() < 1e-6);

        let three: Vec<u16> = (0..300).map(|i| 7999 + (i % 3) as u16).collect();
        let result = AdvancedBaseline::default().estimate(&three);
        assert!(result.valid);
        assert!((result.mean - 8000.0).abs() < 1e-6);
        assert!((result.rms - (2.0f64 / 3.0).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_advanced_overflow_only() {
        // Saturated high end is outside the coarse histogram range
        let wave = vec![16383u16; 100];
        let result = AdvancedBaseline::default().estimate(&wave);
        assert!(!result.valid);
        assert!(result.mean.is_finite() && result.rms.is_finite());
    }

    #[test]
    fn test_advanced_noisy() {
        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0_f64, 3.0).unwrap();
        let mut wave: Vec<u16> = (0..600)
            .map(|_| (12000.0_f64 + noise.sample(&mut rng)).round() as u16)
            .collect();
        // A pulse should not pull the pedestal
        for s in wave.iter_mut().skip(300).take(20) {
            *s = 9000;
        }
        let result = AdvancedBaseline::default().estimate(&wave);
        assert!(result.valid);
        assert!((result.mean - 12000.0).abs() < 0.5);
        assert!((result.rms - 3.0).abs() < 0.5);
    }

    #[test]
    fn test_advanced_sample_range() {
        let mut wave = vec![5000u16; 50];
        wave.extend(vec![7000u16; 100]);
        let estimator = AdvancedBaseline {
            range_end: Some(50),
            ..Default::default()
        };
        let result = estimator.estimate(&wave);
        assert!(result.valid);
        assert_eq!(result.mean, 5000.0);
    }
}
