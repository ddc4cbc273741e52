use serde::{Deserialize, Serialize};
use std::fmt;

use super::detector_id::DetectorId;

/// Status bit-field of a reconstructed waveform hit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HitStatus(u32);

impl HitStatus {
    pub const THRESHOLD_FAILED: u32 = 1 << 0;
    pub const SECONDARY: u32 = 1 << 1;
    pub const WAVE_OVERFLOW: u32 = 1 << 2;
    pub const BASELINE_FAILED: u32 = 1 << 3;
    pub const GFIT_FAILED: u32 = 1 << 4;
    pub const CBFIT_FAILED: u32 = 1 << 5;
    pub const CLOCK_INVALID: u32 = 1 << 6;
    pub const WAVEFORM_MISSING: u32 = 1 << 7;
    pub const WAVEFORM_INVALID: u32 = 1 << 8;

    const NAMES: [(u32, &'static str); 9] = [
        (Self::THRESHOLD_FAILED, "THRESHOLD_FAILED"),
        (Self::SECONDARY, "SECONDARY"),
        (Self::WAVE_OVERFLOW, "WAVE_OVERFLOW"),
        (Self::BASELINE_FAILED, "BASELINE_FAILED"),
        (Self::GFIT_FAILED, "GFIT_FAILED"),
        (Self::CBFIT_FAILED, "CBFIT_FAILED"),
        (Self::CLOCK_INVALID, "CLOCK_INVALID"),
        (Self::WAVEFORM_MISSING, "WAVEFORM_MISSING"),
        (Self::WAVEFORM_INVALID, "WAVEFORM_INVALID"),
    ];

    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u32) {
        self.0 &= !bit;
    }

    pub fn test(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// The hit could not even be looked at: missing/invalid waveform or no baseline
    pub fn is_unusable(&self) -> bool {
        self.test(Self::WAVEFORM_MISSING | Self::WAVEFORM_INVALID | Self::BASELINE_FAILED)
    }
}

impl fmt::Display for HitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.test(*bit))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "OK")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// A reconstructed pulse on one digitizer channel.
///
/// Times are in ns, voltages in mV and integrals in mV*ns. Every numeric field is finite;
/// fields that could not be computed stay at zero (or -1 for the clock time).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveformHit {
    pub channel: u32,
    pub identifier: Option<DetectorId>,
    pub status: HitStatus,
    pub baseline_mean: f64,
    pub baseline_rms: f64,
    pub raw_peak: f64,
    pub raw_integral: f64,
    pub peak: f64,
    pub mean: f64,
    pub width: f64,
    pub integral: f64,
    pub localtime: f64,
    pub alpha: f64,
    pub nval: f64,
    pub chi2ndf: f64,
    pub bcid_time: f64,
    pub trigger_time: f64,
    pub time_vector: Vec<f64>,
    pub wave_vector: Vec<f64>,
}

impl WaveformHit {
    pub fn new(channel: u32, identifier: Option<DetectorId>) -> Self {
        Self {
            channel,
            identifier,
            bcid_time: -1.0,
            ..Default::default()
        }
    }

    pub fn is_secondary(&self) -> bool {
        self.status.test(HitStatus::SECONDARY)
    }

    pub fn is_threshold_failed(&self) -> bool {
        self.status.test(HitStatus::THRESHOLD_FAILED)
    }
}

/// Calibrated calorimeter energy deposit derived from a primary waveform hit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalorimeterHit {
    pub channel: u32,
    pub identifier: Option<DetectorId>,
    pub nmip: f64,
    pub e_dep: f64,
    pub e_em: f64,
    pub fit_to_raw_ratio: f64,
    /// Index of the source hit in the event's waveform hit container
    pub hit_index: usize,
}
