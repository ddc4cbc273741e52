use serde::{Deserialize, Serialize};

use super::constants::{ADC_FULL_SCALE_COUNTS, SAMPLE_PERIOD_NS};

/// Header information of the digitizer board which recorded a waveform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardInfo {
    pub board_id: u32,
    pub board_fail: bool,
    pub trigger_tag: u32,
    pub event_counter: u32,
}

/// One digitizer channel's record for one event.
///
/// `n_samples` is the sample count declared by the board header; `adc_counts` is what was
/// actually decoded. The two disagree for corrupted fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWaveform {
    pub channel: u32,
    pub n_samples: usize,
    pub adc_counts: Vec<u16>,
    /// Full-scale input range in volts
    pub range: f64,
    #[serde(default)]
    pub board: BoardInfo,
}

impl RawWaveform {
    pub fn new(channel: u32, adc_counts: Vec<u16>, range: f64) -> Self {
        Self {
            channel,
            n_samples: adc_counts.len(),
            adc_counts,
            range,
            board: BoardInfo::default(),
        }
    }

    /// Conversion from ADC counts to mV, `range / 16.384` for the 14-bit ADC
    pub fn mv_per_bit(&self) -> f64 {
        self.range * 1000.0 / ADC_FULL_SCALE_COUNTS
    }

    pub fn is_length_valid(&self) -> bool {
        self.n_samples == self.adc_counts.len()
    }

    pub fn len(&self) -> usize {
        self.adc_counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adc_counts.is_empty()
    }

    /// Sample time in ns
    pub fn time_of(sample: usize) -> f64 {
        sample as f64 * SAMPLE_PERIOD_NS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mv_per_bit() {
        let wave = RawWaveform::new(0, vec![0; 10], 2.0);
        assert!((wave.mv_per_bit() - 0.1220703125).abs() < 1e-12);
        assert!(wave.is_length_valid());
        assert_eq!(RawWaveform::time_of(60), 120.0);
    }
}
