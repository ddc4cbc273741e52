use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::constants::INPUT_IMPEDANCE_OHM;
use super::hit::{CalorimeterHit, HitStatus, WaveformHit};

/// Relative PMT gain as a function of high voltage, linearly interpolated between points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainCurve {
    /// (high voltage in V, relative gain), sorted by voltage
    pub points: Vec<(f64, f64)>,
}

impl Default for GainCurve {
    fn default() -> Self {
        Self {
            points: vec![
                (800.0, 0.19),
                (900.0, 0.43),
                (1000.0, 1.0),
                (1100.0, 2.05),
                (1200.0, 3.95),
            ],
        }
    }
}

impl GainCurve {
    /// Gain at `hv`; outside the table the nearest segment is extended
    pub fn gain(&self, hv: f64) -> f64 {
        match self.points.len() {
            0 => 1.0,
            1 => self.points[0].1,
            n => {
                let i = self
                    .points
                    .partition_point(|(v, _)| *v < hv)
                    .clamp(1, n - 1);
                let (x0, y0) = self.points[i - 1];
                let (x1, y1) = self.points[i];
                if x1 == x0 {
                    return y0;
                }
                y0 + (hv - x0) * (y1 - y0) / (x1 - x0)
            }
        }
    }
}

/// Calibration constants of one calorimeter PMT
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    /// Operating high voltage in V
    pub hv: f64,
    /// Charge of a MIP in pC, measured at `mip_reference_hv`
    pub mip_charge: f64,
    pub mip_reference_hv: f64,
}

impl Default for ChannelCalibration {
    fn default() -> Self {
        Self {
            hv: 1000.0,
            mip_charge: 25.0,
            mip_reference_hv: 1000.0,
        }
    }
}

/// Turns primary calorimeter waveform hits into energy deposits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalorimeterHitMaker {
    pub gain_curve: GainCurve,
    /// Calibration used for channels missing from `channels`
    pub default_calibration: ChannelCalibration,
    pub channels: FxHashMap<u32, ChannelCalibration>,
    /// Energy deposited by one MIP, MeV
    pub mip_energy_mev: f64,
    /// Visible to electromagnetic energy scale
    pub em_scale: f64,
}

impl Default for CalorimeterHitMaker {
    fn default() -> Self {
        Self {
            gain_curve: GainCurve::default(),
            default_calibration: ChannelCalibration::default(),
            channels: FxHashMap::default(),
            mip_energy_mev: 93.0,
            em_scale: 1.0,
        }
    }
}

impl CalorimeterHitMaker {
    fn calibration(&self, channel: u32) -> &ChannelCalibration {
        self.channels
            .get(&channel)
            .unwrap_or(&self.default_calibration)
    }

    /// Gain of the channel relative to the gain its MIP charge was measured at
    pub fn gain_factor(&self, channel: u32) -> f64 {
        let cal = self.calibration(channel);
        let reference = self.gain_curve.gain(cal.mip_reference_hv);
        if reference == 0.0 {
            return 1.0;
        }
        self.gain_curve.gain(cal.hv) / reference
    }

    /// One calorimeter hit per usable primary calorimeter waveform hit
    pub fn make_hits(&self, hits: &[WaveformHit]) -> Vec<CalorimeterHit> {
        hits.iter()
            .enumerate()
            .filter(|(_, h)| h.identifier.as_ref().is_some_and(|id| id.is_calo()))
            .filter(|(_, h)| {
                !h.is_secondary()
                    && !h.status.is_unusable()
                    && !h.status.test(HitStatus::THRESHOLD_FAILED)
            })
            .filter_map(|(index, hit)| self.make_hit(index, hit))
            .collect()
    }

    fn make_hit(&self, index: usize, hit: &WaveformHit) -> Option<CalorimeterHit> {
        let cal = self.calibration(hit.channel);
        let gain = self.gain_factor(hit.channel);
        if cal.mip_charge <= 0.0 || gain <= 0.0 {
            log::warn!(
                "Calorimeter channel {} has an unusable calibration (MIP charge {}, gain {})",
                hit.channel,
                cal.mip_charge,
                gain
            );
            return None;
        }
        // mV * ns / ohm = pC
        let charge = hit.integral / INPUT_IMPEDANCE_OHM;
        let nmip = charge / (cal.mip_charge * gain);
        let e_dep = nmip * self.mip_energy_mev;
        Some(CalorimeterHit {
            channel: hit.channel,
            identifier: hit.identifier,
            nmip,
            e_dep,
            e_em: e_dep * self.em_scale,
            fit_to_raw_ratio: if hit.raw_integral == 0.0 {
                0.0
            } else {
                hit.integral / hit.raw_integral
            },
            hit_index: index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector_id::DetectorId;

    #[test]
    fn test_gain_curve() {
        let curve = GainCurve {
            points: vec![(900.0, 1.0), (1000.0, 2.0), (1100.0, 4.0)],
        };
        assert_eq!(curve.gain(1000.0), 2.0);
        assert!((curve.gain(950.0) - 1.5).abs() < 1e-12);
        // Extrapolated from the outer segments
        assert!((curve.gain(800.0) - 0.0).abs() < 1e-12);
        assert!((curve.gain(1200.0) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_calorimeter_energy() {
        let mut maker = CalorimeterHitMaker {
            mip_energy_mev: 100.0,
            em_scale: 2.0,
            ..Default::default()
        };
        maker.channels.insert(
            0,
            ChannelCalibration {
                hv: 1000.0,
                mip_charge: 10.0,
                mip_reference_hv: 1000.0,
            },
        );
        let calo = DetectorId::new("calo", &[0, 0]).unwrap();
        let mut primary = WaveformHit::new(0, Some(calo));
        primary.integral = 1000.0;
        primary.raw_integral = 800.0;
        let mut secondary = primary.clone();
        secondary.status.set(HitStatus::SECONDARY);
        let veto = WaveformHit::new(6, Some(DetectorId::new("veto", &[0, 0]).unwrap()));
        let mut below = WaveformHit::new(1, Some(calo));
        below.status.set(HitStatus::THRESHOLD_FAILED);

        let hits = maker.make_hits(&[veto, primary, secondary, below]);
        assert_eq!(hits.len(), 1);
        let hit = &hits[0];
        assert_eq!(hit.hit_index, 1);
        // 1000 mV ns / 50 ohm = 20 pC = 2 MIP
        assert!((hit.nmip - 2.0).abs() < 1e-12);
        assert!((hit.e_dep - 200.0).abs() < 1e-9);
        assert!((hit.e_em - 400.0).abs() < 1e-9);
        assert!((hit.fit_to_raw_ratio - 1.25).abs() < 1e-12);
    }
}
