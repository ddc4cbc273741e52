use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::constants::{LAYERS_PER_STATION, MAX_STATION_SPACE_POINTS, MIN_STATION_SPACE_POINTS};
use super::fit::{LeastSquares, ParamSpec};
use super::space_point::SpacePoint;

/// How a seed was formed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeedStrategy {
    /// Two station triplets joined for global seeding
    TripletSpFirststation,
    TripletSp,
    DoubletSp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeedFit {
    pub chi2: f64,
    pub ndf: usize,
    pub edm: f64,
}

/// Space points believed to come from one track, with a straight line through them.
///
/// The line is `x(z) = p0 + p1 z`, `y(z) = p2 + p3 z`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    pub strategy: SeedStrategy,
    pub station: u8,
    /// Indices into the event's space point container
    pub space_points: Vec<usize>,
    pub positions: Vec<Vector3<f64>>,
    pub params: [f64; 4],
    pub fit: Option<SeedFit>,
}

/// Builds triplet (or doublet) seeds per station and joins two stations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedBuilder {
    pub max_chi2: f64,
    /// Fit all three points together; otherwise each point is compared to the line
    /// through the other two
    pub use_biased_residual: bool,
    pub make_doublets: bool,
    /// Fallback resolutions (mm) for space points without a usable covariance
    pub sigma_x: f64,
    pub sigma_y: f64,
    /// Stations whose triplets are joined into six point seeds
    pub cross_stations: (u8, u8),
    #[serde(skip)]
    pub fitter: LeastSquares,
}

impl Default for SeedBuilder {
    fn default() -> Self {
        Self {
            max_chi2: 20.0,
            use_biased_residual: true,
            make_doublets: false,
            sigma_x: 0.8,
            sigma_y: 0.02,
            cross_stations: (1, 2),
            fitter: LeastSquares::default(),
        }
    }
}

/// A space point prepared for fitting
#[derive(Debug, Clone, Copy)]
struct FitPoint {
    index: usize,
    position: Vector3<f64>,
    sigma_x: f64,
    sigma_y: f64,
}

impl SeedBuilder {
    /// All seeds of an event: per-station seeds first, then the joined seeds
    pub fn build(&self, points: &[SpacePoint]) -> Vec<Seed> {
        let mut stations: Vec<u8> = points.iter().map(|p| p.station).collect();
        stations.sort();
        stations.dedup();

        let mut seeds = Vec::new();
        let mut first = Vec::new();
        let mut second = Vec::new();
        for station in stations {
            let station_seeds = self.build_station(points, station);
            if station == self.cross_stations.0 {
                first = triplets_of(&station_seeds);
            }
            if station == self.cross_stations.1 {
                second = triplets_of(&station_seeds);
            }
            seeds.extend(station_seeds);
        }
        seeds.extend(join_stations(&first, &second));
        seeds
    }

    /// Seeds of one station. Empty when the station occupancy is outside the accepted range.
    pub fn build_station(&self, points: &[SpacePoint], station: u8) -> Vec<Seed> {
        let mut layers: [Vec<FitPoint>; LAYERS_PER_STATION] = Default::default();
        let mut occupancy = 0;
        for (index, sp) in points.iter().enumerate().filter(|(_, sp)| sp.station == station) {
            occupancy += 1;
            let Some(layer) = layers.get_mut(sp.layer as usize) else {
                log::debug!("Space point {index} has layer {} outside the station", sp.layer);
                continue;
            };
            layer.push(self.fit_point(index, sp));
        }
        if !(MIN_STATION_SPACE_POINTS..MAX_STATION_SPACE_POINTS).contains(&occupancy) {
            log::debug!("Station {station} has {occupancy} space points, not seeding");
            return Vec::new();
        }

        let mut seeds = Vec::new();
        for p0 in layers[0].iter() {
            for p1 in layers[1].iter() {
                for p2 in layers[2].iter() {
                    let triplet = [*p0, *p1, *p2];
                    let seed = if self.use_biased_residual {
                        self.fit_triplet(&triplet, station)
                    } else {
                        self.unbiased_triplet(&triplet, station)
                    };
                    seeds.extend(seed);
                }
            }
        }
        if seeds.is_empty() && self.make_doublets {
            for (i, j) in [(0, 1), (0, 2), (1, 2)] {
                for a in layers[i].iter() {
                    for b in layers[j].iter() {
                        seeds.extend(doublet(a, b, station));
                    }
                }
            }
        }
        log::debug!("Station {station}: {} seeds", seeds.len());
        seeds
    }

    fn fit_point(&self, index: usize, sp: &SpacePoint) -> FitPoint {
        let usable = |var: f64, fallback: f64| {
            let sigma = var.sqrt();
            if sigma.is_finite() && sigma > 0.0 {
                sigma
            } else {
                fallback
            }
        };
        FitPoint {
            index,
            position: sp.position,
            sigma_x: usable(sp.covariance[(0, 0)], self.sigma_x),
            sigma_y: usable(sp.covariance[(1, 1)], self.sigma_y),
        }
    }

    /// Chi-square fit of a straight line through three points
    fn fit_triplet(&self, triplet: &[FitPoint; 3], station: u8) -> Option<Seed> {
        let init = line_through(&triplet[0].position, &triplet[2].position)?;
        let fit = self.fitter.minimize(
            2 * triplet.len(),
            |p, r| {
                for (k, pt) in triplet.iter().enumerate() {
                    let z = pt.position.z;
                    r[2 * k] = (p[0] + p[1] * z - pt.position.x) / pt.sigma_x;
                    r[2 * k + 1] = (p[2] + p[3] * z - pt.position.y) / pt.sigma_y;
                }
            },
            &init.map(ParamSpec::free),
        );
        if !fit.is_valid() || fit.chi2 >= self.max_chi2 {
            return None;
        }
        Some(Seed {
            strategy: SeedStrategy::TripletSp,
            station,
            space_points: triplet.iter().map(|p| p.index).collect(),
            positions: triplet.iter().map(|p| p.position).collect(),
            params: [fit.params[0], fit.params[1], fit.params[2], fit.params[3]],
            fit: Some(SeedFit {
                chi2: fit.chi2,
                ndf: fit.ndf,
                edm: fit.edm,
            }),
        })
    }

    /// Each point against the line through the other two; no global fit
    fn unbiased_triplet(&self, triplet: &[FitPoint; 3], station: u8) -> Option<Seed> {
        let mut chi2 = 0.0;
        for k in 0..3 {
            let point = &triplet[k];
            let (a, b) = (&triplet[(k + 1) % 3], &triplet[(k + 2) % 3]);
            let line = line_through(&a.position, &b.position)?;
            let z = point.position.z;
            let dx = (line[0] + line[1] * z - point.position.x) / point.sigma_x;
            let dy = (line[2] + line[3] * z - point.position.y) / point.sigma_y;
            chi2 += dx * dx + dy * dy;
        }
        if !chi2.is_finite() || chi2 >= self.max_chi2 {
            return None;
        }
        Some(Seed {
            strategy: SeedStrategy::TripletSp,
            station,
            space_points: triplet.iter().map(|p| p.index).collect(),
            positions: triplet.iter().map(|p| p.position).collect(),
            params: line_through(&triplet[0].position, &triplet[2].position)?,
            fit: Some(SeedFit {
                chi2,
                ndf: 2,
                edm: 0.0,
            }),
        })
    }
}

fn doublet(a: &FitPoint, b: &FitPoint, station: u8) -> Option<Seed> {
    Some(Seed {
        strategy: SeedStrategy::DoubletSp,
        station,
        space_points: vec![a.index, b.index],
        positions: vec![a.position, b.position],
        params: line_through(&a.position, &b.position)?,
        fit: None,
    })
}

/// `[p0, p1, p2, p3]` of the line through two points; None if they share a z
fn line_through(a: &Vector3<f64>, b: &Vector3<f64>) -> Option<[f64; 4]> {
    let dz = b.z - a.z;
    if dz == 0.0 {
        return None;
    }
    let sx = (b.x - a.x) / dz;
    let sy = (b.y - a.y) / dz;
    Some([a.x - sx * a.z, sx, a.y - sy * a.z, sy])
}

fn triplets_of(seeds: &[Seed]) -> Vec<Seed> {
    seeds
        .iter()
        .filter(|s| s.strategy == SeedStrategy::TripletSp)
        .cloned()
        .collect()
}

/// Every triplet of the first station with every triplet of the second. The joined seed
/// keeps the line of the first station.
fn join_stations(first: &[Seed], second: &[Seed]) -> Vec<Seed> {
    let mut seeds = Vec::with_capacity(first.len() * second.len());
    for a in first {
        for b in second {
            let mut space_points = a.space_points.clone();
            space_points.extend(b.space_points.iter().copied());
            let mut positions = a.positions.clone();
            positions.extend(b.positions.iter().copied());
            seeds.push(Seed {
                strategy: SeedStrategy::TripletSpFirststation,
                station: a.station,
                space_points,
                positions,
                params: a.params,
                fit: a.fit,
            });
        }
    }
    seeds
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    fn sp(station: u8, layer: u8, x: f64, y: f64, z: f64) -> SpacePoint {
        SpacePoint {
            position: Vector3::new(x, y, z),
            covariance: Matrix3::from_diagonal(&Vector3::new(0.01, 0.01, 0.0)),
            station,
            layer,
            ..Default::default()
        }
    }

    fn track(station: u8, z0: f64, dy: f64) -> Vec<SpacePoint> {
        (0..3)
            .map(|l| {
                let z = z0 + 50.0 * l as f64;
                let y = 1.0 + 0.01 * z + if l == 1 { dy } else { 0.0 };
                sp(station, l, 2.0 - 0.002 * z, y, z)
            })
            .collect()
    }

    #[test]
    fn test_collinear_triplet_is_accepted() {
        let points = track(1, 1200.0, 0.0);
        let seeds = SeedBuilder::default().build_station(&points, 1);
        assert_eq!(seeds.len(), 1);
        let seed = &seeds[0];
        assert_eq!(seed.strategy, SeedStrategy::TripletSp);
        let fit = seed.fit.unwrap();
        assert!(fit.chi2 < 1e-8);
        assert_eq!(fit.ndf, 2);
        assert!((seed.params[1] + 0.002).abs() < 1e-6);
        assert!((seed.params[3] - 0.01).abs() < 1e-6);
        assert!((seed.params[2] - 1.0).abs() < 1e-3);

        let tight = SeedBuilder {
            max_chi2: 1e-3,
            ..Default::default()
        };
        assert_eq!(tight.build_station(&points, 1).len(), 1);
    }

    #[test]
    fn test_kinked_triplet_is_rejected() {
        // A 1 mm kink with 0.1 mm errors gives chi2 of about 67
        let points = track(1, 1200.0, 1.0);
        assert!(SeedBuilder::default().build_station(&points, 1).is_empty());
        let unbiased = SeedBuilder {
            use_biased_residual: false,
            ..Default::default()
        };
        assert!(unbiased.build_station(&points, 1).is_empty());
        let straight = track(1, 1200.0, 0.0);
        let seeds = unbiased.build_station(&straight, 1);
        assert_eq!(seeds.len(), 1);
        assert!(seeds[0].fit.unwrap().chi2 < 1e-8);
    }

    #[test]
    fn test_doublets_when_no_triplet() {
        let mut points = track(1, 1200.0, 5.0);
        let builder = SeedBuilder {
            make_doublets: true,
            ..Default::default()
        };
        let seeds = builder.build_station(&points, 1);
        assert_eq!(seeds.len(), 3);
        assert!(seeds.iter().all(|s| s.strategy == SeedStrategy::DoubletSp));
        assert!(seeds.iter().all(|s| s.fit.is_none() && s.space_points.len() == 2));

        // A single point is not enough to seed a station
        points.truncate(1);
        assert!(builder.build_station(&points, 1).is_empty());
    }

    #[test]
    fn test_crowded_station_is_skipped() {
        let points: Vec<SpacePoint> = (0..100)
            .map(|i| sp(1, (i % 3) as u8, 0.0, i as f64, 1200.0 + 50.0 * (i % 3) as f64))
            .collect();
        assert!(SeedBuilder::default().build_station(&points, 1).is_empty());
    }

    #[test]
    fn test_station_join() {
        let mut points = track(1, 1200.0, 0.0);
        points.extend(track(2, 2400.0, 0.0));
        points.extend(track(0, 0.0, 0.0));
        let seeds = SeedBuilder::default().build(&points);
        let joined: Vec<&Seed> = seeds
            .iter()
            .filter(|s| s.strategy == SeedStrategy::TripletSpFirststation)
            .collect();
        assert_eq!(seeds.len(), 4);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].space_points, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(joined[0].station, 1);
    }
}
