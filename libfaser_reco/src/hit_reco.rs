use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::baseline::{AdvancedBaseline, BaselineEstimator, BaselineResult, BaselineStrategy};
use super::channel_map::ChannelMap;
use super::clock::{ClockPhaseExtractor, WaveformClock};
use super::constants::{ADC_FULL_SCALE_COUNTS, SAMPLE_PERIOD_NS, SECONDARY_EDGE_SAMPLES};
use super::detector_id::DetectorId;
use super::hit::{HitStatus, WaveformHit};
use super::peak_fitter::PeakFitter;
use super::waveform::RawWaveform;

/// Direction of a signal pulse relative to the pedestal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    Negative,
    Positive,
}

impl Polarity {
    /// Pulse height in mV of an ADC sample above the pedestal
    fn voltage(&self, baseline: f64, adc: u16, mv_per_bit: f64) -> f64 {
        match self {
            Self::Negative => (baseline - adc as f64) * mv_per_bit,
            Self::Positive => (adc as f64 - baseline) * mv_per_bit,
        }
    }

    /// Pulse height a saturated ADC reads as
    fn overflow_level(&self, baseline: f64, mv_per_bit: f64) -> f64 {
        match self {
            Self::Negative => self.voltage(baseline, 0, mv_per_bit),
            Self::Positive => self.voltage(baseline, (ADC_FULL_SCALE_COUNTS - 1.0) as u16, mv_per_bit),
        }
    }
}

/// Source of the expected trigger arrival time per channel
pub trait TimingCalibration {
    /// ns after the start of the readout window
    fn nominal_trigger_time(&self) -> f64;
    /// ns, added to the nominal time for this channel
    fn trigger_offset(&self, channel: u32) -> f64;
}

/// Timing constants read from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticTiming {
    pub nominal_trigger_time: f64,
    pub channel_offsets: FxHashMap<u32, f64>,
}

impl Default for StaticTiming {
    fn default() -> Self {
        Self {
            nominal_trigger_time: 820.0,
            channel_offsets: FxHashMap::default(),
        }
    }
}

impl TimingCalibration for StaticTiming {
    fn nominal_trigger_time(&self) -> f64 {
        self.nominal_trigger_time
    }

    fn trigger_offset(&self, channel: u32) -> f64 {
        self.channel_offsets.get(&channel).copied().unwrap_or(0.0)
    }
}

/// Hits and clock of one event's digitizer data
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventHits {
    pub clock: Option<WaveformClock>,
    pub hits: Vec<WaveformHit>,
}

/// Per channel pulse finding: primary hit in the trigger window, secondary hits outside it
#[derive(Debug, Clone)]
pub struct HitReconstructor {
    pub baseline: BaselineEstimator,
    pub peak_fitter: PeakFitter,
    pub clock: ClockPhaseExtractor,
    pub primary_peak_threshold: f64,
    pub secondary_peak_threshold: f64,
    /// Window start in samples relative to the trigger sample
    pub fit_window_start: i64,
    pub fit_window_width: usize,
    pub find_secondary_before: bool,
    pub find_secondary_after: bool,
    pub max_secondary_hits: usize,
    pub polarity: Polarity,
}

impl Default for HitReconstructor {
    fn default() -> Self {
        Self {
            baseline: BaselineEstimator::Advanced(AdvancedBaseline::default()),
            peak_fitter: PeakFitter::default(),
            clock: ClockPhaseExtractor::default(),
            primary_peak_threshold: 5.0,
            secondary_peak_threshold: 10.0,
            fit_window_start: -20,
            fit_window_width: 75,
            find_secondary_before: false,
            find_secondary_after: false,
            max_secondary_hits: 1,
            polarity: Polarity::Negative,
        }
    }
}

/// Baseline subtracted view of one waveform
struct PreparedWave {
    voltage: Vec<f64>,
    baseline: BaselineResult,
    mv_per_bit: f64,
}

impl HitReconstructor {
    /// Reconstruct every signal channel of the map plus the clock.
    ///
    /// A channel of the map with no waveform gets a WAVEFORM_MISSING hit.
    pub fn reconstruct_event<T: TimingCalibration>(
        &self,
        waveforms: &[RawWaveform],
        map: &ChannelMap,
        timing: &T,
    ) -> EventHits {
        let by_channel: FxHashMap<u32, &RawWaveform> =
            waveforms.iter().map(|w| (w.channel, w)).collect();

        let clock = map.get_clock_channel().map(|channel| match by_channel.get(&channel) {
            Some(wave) => self.clock.extract(wave),
            None => {
                log::warn!("Clock channel {channel} has no waveform");
                WaveformClock::invalid()
            }
        });

        let mut hits = Vec::new();
        for (channel, id) in map.signal_channels() {
            let wave = by_channel.get(&channel).copied();
            hits.extend(self.reconstruct_channel(wave, channel, Some(id), timing));
        }
        self.correct_times(&mut hits, clock.as_ref(), timing);
        EventHits { clock, hits }
    }

    /// Primary hit followed by any secondary hits for one channel
    pub fn reconstruct_channel<T: TimingCalibration>(
        &self,
        wave: Option<&RawWaveform>,
        channel: u32,
        identifier: Option<DetectorId>,
        timing: &T,
    ) -> Vec<WaveformHit> {
        let mut primary = WaveformHit::new(channel, identifier);
        let Some(wave) = wave else {
            primary.status.set(HitStatus::WAVEFORM_MISSING);
            return vec![primary];
        };
        if wave.is_empty() || !wave.is_length_valid() {
            log::debug!(
                "Channel {channel}: declared {} samples, decoded {}",
                wave.n_samples,
                wave.len()
            );
            primary.status.set(HitStatus::WAVEFORM_INVALID);
            return vec![primary];
        }

        let mv_per_bit = wave.mv_per_bit();
        let baseline = self.baseline.estimate(&wave.adc_counts);
        primary.baseline_mean = baseline.mean * mv_per_bit;
        primary.baseline_rms = baseline.rms * mv_per_bit;
        if !baseline.valid {
            log::debug!("Channel {channel}: baseline estimate failed");
            primary.status.set(HitStatus::BASELINE_FAILED);
            return vec![primary];
        }
        let prepared = PreparedWave {
            voltage: wave
                .adc_counts
                .iter()
                .map(|&adc| self.polarity.voltage(baseline.mean, adc, mv_per_bit))
                .collect(),
            baseline,
            mv_per_bit,
        };

        let trigger_time = timing.nominal_trigger_time() + timing.trigger_offset(channel);
        let trigger_sample = (trigger_time / SAMPLE_PERIOD_NS).round() as i64;
        let lo = trigger_sample + self.fit_window_start;
        let hi = lo + self.fit_window_width as i64;
        if lo < 0 || hi > wave.len() as i64 || self.fit_window_width == 0 {
            log::debug!(
                "Channel {channel}: window [{lo}, {hi}) outside {} samples",
                wave.len()
            );
            primary.status.set(HitStatus::WAVEFORM_INVALID);
            return vec![primary];
        }
        let (lo, hi) = (lo as usize, hi as usize);

        self.fill_hit(&mut primary, &prepared, lo, hi);
        if primary.is_threshold_failed() {
            return vec![primary];
        }

        let mut hits = vec![primary];
        let mut claimed = vec![(lo, hi)];
        while hits.len() <= self.max_secondary_hits {
            let Some(peak) = self.find_secondary_peak(&prepared, (lo, hi), &claimed) else {
                break;
            };
            let start = (peak as i64 + self.fit_window_start).max(0) as usize;
            let stop = (start + self.fit_window_width).min(prepared.voltage.len());
            let mut secondary = WaveformHit::new(channel, identifier);
            secondary.baseline_mean = prepared.baseline.mean * mv_per_bit;
            secondary.baseline_rms = prepared.baseline.rms * mv_per_bit;
            secondary.status.set(HitStatus::SECONDARY);
            self.fill_hit(&mut secondary, &prepared, start, stop);
            log::debug!(
                "Channel {channel}: secondary hit at sample {peak}, peak {:.2} mV",
                secondary.peak
            );
            claimed.push((start, stop));
            hits.push(secondary);
        }
        hits
    }

    /// Largest sample above the secondary threshold outside the claimed windows, or None
    fn find_secondary_peak(
        &self,
        wave: &PreparedWave,
        primary: (usize, usize),
        claimed: &[(usize, usize)],
    ) -> Option<usize> {
        let threshold = self.secondary_peak_threshold * wave.baseline.rms * wave.mv_per_bit;
        let unclaimed = |i: &usize| !claimed.iter().any(|(lo, hi)| *i >= *lo && *i < *hi);
        let best_in = |range: std::ops::Range<usize>| {
            range
                .filter(unclaimed)
                .max_by(|a, b| wave.voltage[*a].total_cmp(&wave.voltage[*b]))
                .filter(|i| wave.voltage[*i] > threshold)
        };

        // Samples hugging the primary window are its tail, not a new pulse
        let before = self
            .find_secondary_before
            .then(|| best_in(0..primary.0.saturating_sub(SECONDARY_EDGE_SAMPLES)))
            .flatten();
        let after = self
            .find_secondary_after
            .then(|| best_in(primary.1 + SECONDARY_EDGE_SAMPLES..wave.voltage.len()))
            .flatten();

        match (before, after) {
            (Some(b), Some(a)) => {
                if wave.voltage[a] > wave.voltage[b] {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (b, a) => b.or(a),
        }
    }

    /// Threshold check and pulse fit over the samples [lo, hi)
    fn fill_hit(&self, hit: &mut WaveformHit, wave: &PreparedWave, lo: usize, hi: usize) {
        let time: Vec<f64> = (lo..hi).map(RawWaveform::time_of).collect();
        let voltage = wave.voltage[lo..hi].to_vec();

        let raw = self.peak_fitter.raw_estimate(&time, &voltage);
        hit.raw_peak = raw.peak;
        hit.raw_integral = raw.integral;
        hit.peak = raw.peak;
        hit.mean = raw.mean;
        hit.width = raw.sigma;
        hit.integral = raw.integral;
        hit.localtime = raw.localtime;
        hit.time_vector = time;
        hit.wave_vector = voltage;

        let rms_mv = wave.baseline.rms * wave.mv_per_bit;
        if raw.peak < self.primary_peak_threshold * rms_mv {
            hit.status.set(HitStatus::THRESHOLD_FAILED);
            return;
        }

        let overflow_level = self.polarity.overflow_level(wave.baseline.mean, wave.mv_per_bit);
        let outcome = self
            .peak_fitter
            .fit(&hit.time_vector, &hit.wave_vector, overflow_level);
        if outcome.overflow {
            hit.status.set(HitStatus::WAVE_OVERFLOW);
        }
        if outcome.gauss.is_none() {
            hit.status.set(HitStatus::GFIT_FAILED);
        }
        if outcome.crystal_ball.is_none() {
            hit.status.set(HitStatus::CBFIT_FAILED);
        }
        let best = outcome.best();
        hit.peak = best.peak;
        hit.mean = best.mean;
        hit.width = best.sigma;
        hit.integral = best.integral;
        hit.localtime = best.localtime;
        hit.alpha = best.alpha;
        hit.nval = best.nval;
        hit.chi2ndf = best.chi2ndf;
    }

    /// Clock and trigger relative times of every usable hit
    pub fn correct_times<T: TimingCalibration>(
        &self,
        hits: &mut [WaveformHit],
        clock: Option<&WaveformClock>,
        timing: &T,
    ) {
        let clock = clock.filter(|c| c.is_valid());
        for hit in hits.iter_mut().filter(|h| !h.status.is_unusable()) {
            match clock {
                Some(clock) => hit.bcid_time = clock.time_from_clock(hit.localtime),
                None => {
                    hit.status.set(HitStatus::CLOCK_INVALID);
                    hit.bcid_time = -1.0;
                }
            }
            hit.trigger_time = hit.localtime
                - (timing.nominal_trigger_time() + timing.trigger_offset(hit.channel));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::SimpleBaseline;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn timing(nominal: f64) -> StaticTiming {
        StaticTiming {
            nominal_trigger_time: nominal,
            channel_offsets: FxHashMap::default(),
        }
    }

    fn simple_reco() -> HitReconstructor {
        HitReconstructor {
            baseline: BaselineEstimator::Simple(SimpleBaseline::default()),
            ..Default::default()
        }
    }

    /// Pedestal alternating 8000/8002 (mean 8001, rms 1) with a one sample dip at 60
    fn threshold_wave(dip: u16) -> RawWaveform {
        let mut counts: Vec<u16> = (0..150).map(|i| if i % 2 == 0 { 8000 } else { 8002 }).collect();
        for c in counts.iter_mut().skip(40) {
            *c = 8001;
        }
        counts[60] = dip;
        RawWaveform::new(0, counts, 2.0)
    }

    #[test]
    fn test_threshold_boundary() {
        let reco = simple_reco();
        let at = reco.reconstruct_channel(Some(&threshold_wave(7996)), 0, None, &timing(120.0));
        assert!(!at[0].is_threshold_failed());
        let below = reco.reconstruct_channel(Some(&threshold_wave(7997)), 0, None, &timing(120.0));
        assert!(below[0].is_threshold_failed());
        assert!(below[0].raw_peak > 0.0);
        assert_eq!(below.len(), 1);
    }

    #[test]
    fn test_missing_and_invalid_waveforms() {
        let reco = simple_reco();
        let t = timing(120.0);
        let missing = reco.reconstruct_channel(None, 3, None, &t);
        assert!(missing[0].status.test(HitStatus::WAVEFORM_MISSING));

        let mut bad = threshold_wave(7000);
        bad.n_samples = 200;
        let invalid = reco.reconstruct_channel(Some(&bad), 3, None, &t);
        assert!(invalid[0].status.test(HitStatus::WAVEFORM_INVALID));

        // Window past the end of the waveform
        let late = reco.reconstruct_channel(Some(&threshold_wave(7000)), 3, None, &timing(280.0));
        assert!(late[0].status.test(HitStatus::WAVEFORM_INVALID));

        let short = RawWaveform::new(3, vec![8000; 20], 2.0);
        let failed = reco.reconstruct_channel(Some(&short), 3, None, &timing(20.0));
        assert!(failed[0].status.test(HitStatus::BASELINE_FAILED));
    }

    fn pulse_wave(seed: u64, pulses: &[(f64, f64)]) -> RawWaveform {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0_f64, 2.0).unwrap();
        let counts = (0..150)
            .map(|i| {
                let signal: f64 = pulses
                    .iter()
                    .map(|(height, centre)| {
                        let z = (i as f64 - centre) / 2.0;
                        height * (-0.5 * z * z).exp()
                    })
                    .sum();
                (8000.0 - signal + noise.sample(&mut rng)).round() as u16
            })
            .collect();
        RawWaveform::new(0, counts, 2.0)
    }

    #[test]
    fn test_end_to_end_pulse() {
        let wave = pulse_wave(11, &[(600.0, 60.0)]);
        let reco = HitReconstructor::default();
        let hits = reco.reconstruct_channel(Some(&wave), 0, None, &timing(120.0));
        assert_eq!(hits.len(), 1);
        let hit = &hits[0];
        let mv = wave.mv_per_bit();
        assert!(!hit.is_threshold_failed());
        assert!((hit.baseline_mean - 8000.0 * mv).abs() < 0.5);
        assert!((hit.peak - 600.0 * mv).abs() < 2.0);
        assert!((hit.mean - 120.0).abs() < 1.0);
        // Leading edge at 40% of the peak for a 4 ns wide pulse
        let edge = 120.0 - 4.0 * (2.0 * (1.0f64 / 0.4).ln()).sqrt();
        assert!((hit.localtime - edge).abs() < 1.0);
        assert_eq!(hit.time_vector.len(), 75);
        assert_eq!(hit.time_vector[0], 40.0 * SAMPLE_PERIOD_NS);
        assert!(hit.peak.is_finite() && hit.integral.is_finite() && hit.chi2ndf.is_finite());
    }

    #[test]
    fn test_secondary_after_primary() {
        let wave = pulse_wave(5, &[(600.0, 60.0), (400.0, 135.0)]);
        let reco = HitReconstructor {
            find_secondary_after: true,
            ..Default::default()
        };
        let hits = reco.reconstruct_channel(Some(&wave), 0, None, &timing(120.0));
        assert_eq!(hits.len(), 2);
        assert!(!hits[0].is_secondary());
        assert!(hits[1].is_secondary());
        assert!((hits[1].mean - 270.0).abs() < 2.0);
        assert_eq!(hits[1].baseline_mean, hits[0].baseline_mean);

        let primary_only = HitReconstructor::default();
        assert_eq!(
            primary_only
                .reconstruct_channel(Some(&wave), 0, None, &timing(120.0))
                .len(),
            1
        );
    }

    #[test]
    fn test_secondary_skips_samples_next_to_primary() {
        // A large pulse two samples after the primary window ends hides a later, smaller one
        let wave = pulse_wave(5, &[(600.0, 60.0), (500.0, 117.0), (300.0, 135.0)]);
        let reco = HitReconstructor {
            find_secondary_after: true,
            ..Default::default()
        };
        let hits = reco.reconstruct_channel(Some(&wave), 0, None, &timing(120.0));
        assert_eq!(hits.len(), 2);
        assert!(hits[1].is_secondary());
        // Window opens 20 samples before the secondary peak at sample 135
        assert_eq!(hits[1].time_vector[0], 115.0 * SAMPLE_PERIOD_NS);
    }

    #[test]
    fn test_time_correction() {
        let reco = HitReconstructor::default();
        let t = timing(120.0);
        let mut hit = WaveformHit::new(0, None);
        hit.localtime = 115.0;
        let mut hits = vec![hit.clone()];
        reco.correct_times(&mut hits, None, &t);
        assert!(hits[0].status.test(HitStatus::CLOCK_INVALID));
        assert_eq!(hits[0].bcid_time, -1.0);
        assert_eq!(hits[0].trigger_time, -5.0);

        let clock = WaveformClock {
            frequency: 40.0,
            phase: 0.0,
            dc_offset: 0.0,
            amplitude: 1000.0,
        };
        let mut hits = vec![hit];
        reco.correct_times(&mut hits, Some(&clock), &t);
        assert!(!hits[0].status.test(HitStatus::CLOCK_INVALID));
        assert!((hits[0].bcid_time - clock.time_from_clock(115.0)).abs() < 1e-12);
    }
}
