//! Momentum from the bending of a track between two stations.
//!
//! The field bends tracks in the y-z plane. Each station gives a local direction from its
//! first and last space point; the change in direction over the distance between the
//! stations gives the radius of curvature and so the momentum.
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::constants::MOMENTUM_PER_TESLA_METER;
use super::error::MomentumError;
use super::seed::{Seed, SeedStrategy};

const STRAIGHT_TOLERANCE: f64 = 1.0e-12;

/// How the charge label of an estimate is decided
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeSign {
    /// Always report this charge
    Fixed(f64),
    /// +1 when the track bends towards negative y between the stations, -1 otherwise
    Sagitta,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumEstimator {
    pub field_tesla: f64,
    pub charge: ChargeSign,
}

impl Default for MomentumEstimator {
    fn default() -> Self {
        Self {
            field_tesla: 0.55,
            charge: ChargeSign::Sagitta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MomentumEstimate {
    /// GeV
    pub momentum: Vector3<f64>,
    pub p: f64,
    pub charge: f64,
}

/// A joined two-station seed and the momentum measured from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackCandidate {
    pub seed: Seed,
    pub estimate: MomentumEstimate,
}

impl MomentumEstimator {
    /// Estimate from three space points in each of two stations, ordered in z
    pub fn estimate(
        &self,
        station1: &[Vector3<f64>],
        station2: &[Vector3<f64>],
    ) -> Result<MomentumEstimate, MomentumError> {
        let (Ok(s1), Ok(s2)) = (
            <&[Vector3<f64>; 3]>::try_from(station1),
            <&[Vector3<f64>; 3]>::try_from(station2),
        ) else {
            return Err(MomentumError::WrongPointCount(station1.len(), station2.len()));
        };

        let d1 = s1[2] - s1[0];
        let d2 = s2[2] - s2[0];
        let yz1 = d1.y.hypot(d1.z);
        let yz2 = d2.y.hypot(d2.z);
        if yz1 == 0.0 || yz2 == 0.0 || d1.z == 0.0 {
            return Err(MomentumError::DegenerateDirection);
        }
        let r1 = d1.y / yz1;
        let r2 = d2.y / yz2;
        let bend = r2 - r1;
        if bend.abs() < STRAIGHT_TOLERANCE {
            return Err(MomentumError::StraightTrajectory);
        }

        let radius = (s2[0].z - s1[2].z) / bend;
        let p_yz = (MOMENTUM_PER_TESLA_METER * self.field_tesla * radius / 1000.0).abs();

        let pz = p_yz * d1.z / yz1;
        let py = p_yz * d1.y / yz1;
        let px = pz * d1.x / d1.z;
        let momentum = Vector3::new(px, py, pz);

        let charge = match self.charge {
            ChargeSign::Fixed(charge) => charge,
            ChargeSign::Sagitta => sagitta_charge(&s1[0], &s2[2], &((s1[2] + s2[0]) / 2.0)),
        };
        Ok(MomentumEstimate {
            momentum,
            p: momentum.norm(),
            charge,
        })
    }

    /// Track candidates from every joined seed; seeds whose momentum cannot be measured are
    /// logged and dropped.
    pub fn candidates(&self, seeds: &[Seed]) -> Vec<TrackCandidate> {
        seeds
            .iter()
            .filter(|s| s.strategy == SeedStrategy::TripletSpFirststation && s.positions.len() == 6)
            .filter_map(|seed| {
                match self.estimate(&seed.positions[..3], &seed.positions[3..]) {
                    Ok(estimate) => Some(TrackCandidate {
                        seed: seed.clone(),
                        estimate,
                    }),
                    Err(e) => {
                        log::debug!("No momentum for seed {:?}: {e}", seed.space_points);
                        None
                    }
                }
            })
            .collect()
    }
}

/// Sign from the y offset of `middle` with respect to the chord from `start` to `end`
fn sagitta_charge(start: &Vector3<f64>, end: &Vector3<f64>, middle: &Vector3<f64>) -> f64 {
    let t = (middle.z - start.z) / (end.z - start.z);
    let chord = start + (end - start) * t;
    if (middle - chord).y < 0.0 {
        1.0
    } else {
        -1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RADIUS: f64 = 10_000.0;

    fn on_circle(z: f64, sign: f64) -> Vector3<f64> {
        Vector3::new(0.0, sign * (RADIUS - (RADIUS * RADIUS - z * z).sqrt()), z)
    }

    fn stations(sign: f64) -> (Vec<Vector3<f64>>, Vec<Vector3<f64>>) {
        (
            [0.0, 50.0, 100.0].iter().map(|z| on_circle(*z, sign)).collect(),
            [1200.0, 1250.0, 1300.0].iter().map(|z| on_circle(*z, sign)).collect(),
        )
    }

    #[test]
    fn test_circle_momentum() {
        let (s1, s2) = stations(1.0);
        let estimator = MomentumEstimator::default();
        let est = estimator.estimate(&s1, &s2).unwrap();
        // The gap between the stations is shorter than the arc between the chord midpoints
        let expected = 0.3 * 0.55 * (1100.0 / 1200.0) * RADIUS / 1000.0;
        assert!((est.p - expected).abs() / expected < 0.01, "p = {}", est.p);
        assert_eq!(est.momentum.x, 0.0);
        assert!(est.momentum.z > 0.0 && est.momentum.y > 0.0);
        assert_eq!(est.charge, 1.0);

        let (s1, s2) = stations(-1.0);
        let est = estimator.estimate(&s1, &s2).unwrap();
        assert!((est.p - expected).abs() / expected < 0.01);
        assert_eq!(est.charge, -1.0);

        let fixed = MomentumEstimator {
            charge: ChargeSign::Fixed(1.0),
            ..Default::default()
        };
        assert_eq!(fixed.estimate(&s1, &s2).unwrap().charge, 1.0);
    }

    #[test]
    fn test_straight_and_malformed() {
        let line = |z: f64| Vector3::new(0.0, 0.01 * z, z);
        let s1: Vec<_> = [0.0, 50.0, 100.0].iter().map(|z| line(*z)).collect();
        let s2: Vec<_> = [1200.0, 1250.0, 1300.0].iter().map(|z| line(*z)).collect();
        let estimator = MomentumEstimator::default();
        assert!(matches!(
            estimator.estimate(&s1, &s2),
            Err(MomentumError::StraightTrajectory)
        ));
        assert!(matches!(
            estimator.estimate(&s1[..2], &s2),
            Err(MomentumError::WrongPointCount(2, 3))
        ));
        let flat = vec![Vector3::new(0.0, 0.0, 5.0); 3];
        assert!(matches!(
            estimator.estimate(&flat, &s2),
            Err(MomentumError::DegenerateDirection)
        ));
    }
}
