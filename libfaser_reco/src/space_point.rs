use fxhash::FxHashMap;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::cache::{EventContext, Scratch, SlotCache, SpacePointCache};
use super::constants::{MAX_SCT_GAP_PARAMETER, PHI_OVERLAP_GAP_WIDENING};
use super::error::RecoError;
use super::geometry::{SensorDesign, SensorGeometry};
use super::neighbour_table::{NeighbourSlot, NeighbourTable};
use super::tracker_id::{SensorHash, SensorId};

/// Adjacent fired strips on one sensor (mm)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SiCluster {
    pub sensor: SensorId,
    /// Position across the strips, relative to the sensor centre
    pub local_position: f64,
    pub width: f64,
}

/// Which cluster of which sensor a space point was built from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLink {
    pub sensor: SensorHash,
    pub index: usize,
}

/// 3-D point made from two clusters on neighbouring sensors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpacePoint {
    pub position: Vector3<f64>,
    pub covariance: Matrix3<f64>,
    pub sensors: (SensorHash, SensorHash),
    pub clusters: (ClusterLink, ClusterLink),
    pub station: u8,
    pub layer: u8,
}

/// Clusters of one event grouped by sensor, in arrival order
pub type ClusterContainer = FxHashMap<SensorHash, Vec<SiCluster>>;

/// Group the clusters of one event by sensor
pub fn group_clusters<G: SensorGeometry>(
    geometry: &G,
    clusters: &[SiCluster],
    event_number: u64,
) -> Result<ClusterContainer, RecoError> {
    let mut container = ClusterContainer::default();
    for cluster in clusters {
        let hash = cluster.sensor.sensor_hash();
        let Some(design) = geometry.design(hash) else {
            return Err(RecoError::UnknownSensor(event_number, hash.0));
        };
        let position = cluster.local_position;
        if !position.is_finite() || position.abs() > design.max_width / 2.0 {
            return Err(RecoError::ClusterOutsideSensor(event_number, hash.0, position));
        }
        container.entry(hash).or_default().push(*cluster);
    }
    Ok(container)
}

/// How two strips are combined into one point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntersectionMode {
    /// Midpoint of the closest approach of the two strip lines
    ClosestApproach,
    /// Point on the first strip whose line to the vertex crosses the second strip
    Vertex(Vector3<f64>),
}

/// Acceptance window on a cluster pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairWindow {
    /// Difference of the strip positions, measured across the strips of the first sensor
    Difference { min: f64, max: f64 },
    /// Own local position of each cluster
    PerCluster {
        min1: f64,
        max1: f64,
        min2: f64,
        max2: f64,
    },
}

/// Window of a neighbour pair from the half-widths of the two sensors
type PairWindowFn<'a> = &'a dyn Fn(f64, f64) -> PairWindow;

/// Strip end points reused between sensor pairs of the same slot
#[derive(Debug, Default)]
pub struct SpacePointScratch {
    ends1: Vec<(Vector3<f64>, Vector3<f64>)>,
    ends2: Vec<(Vector3<f64>, Vector3<f64>)>,
}

impl Scratch for SpacePointScratch {
    fn reset(&mut self) {
        self.ends1.clear();
        self.ends2.clear();
    }
}

/// Space points of one event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpacePointOutput {
    pub main: Vec<SpacePoint>,
    /// Points from phi overlaps between neighbouring modules
    pub overlap: Vec<SpacePoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpacePointMaker {
    pub overlap_limit_opposite: f64,
    pub overlap_limit_phi: f64,
    pub overlap_limit_eta_min: f64,
    pub overlap_limit_eta_max: f64,
    pub sct_gap_parameter: f64,
    pub strip_length_tolerance: f64,
    pub process_overlaps: bool,
    /// Skip the windows and try every pair
    pub all_clusters: bool,
    pub mode: IntersectionMode,
}

impl Default for SpacePointMaker {
    fn default() -> Self {
        Self {
            overlap_limit_opposite: 2.8,
            overlap_limit_phi: 5.64,
            overlap_limit_eta_min: 1.68,
            overlap_limit_eta_max: 3.0,
            sct_gap_parameter: 0.0,
            strip_length_tolerance: 0.01,
            process_overlaps: true,
            all_clusters: false,
            mode: IntersectionMode::ClosestApproach,
        }
    }
}

impl SpacePointMaker {
    /// The gap parameter is capped; larger values are clamped with a warning
    pub fn with_gap_parameter(mut self, gap: f64) -> Self {
        if gap > MAX_SCT_GAP_PARAMETER {
            log::warn!("SCT gap parameter {gap} is above {MAX_SCT_GAP_PARAMETER}, clamping");
            self.sct_gap_parameter = MAX_SCT_GAP_PARAMETER;
        } else {
            self.sct_gap_parameter = gap;
        }
        self
    }

    /// Space points of a whole event. Main collections go through the cache.
    pub fn make_event<G: SensorGeometry>(
        &self,
        ctx: &EventContext,
        geometry: &G,
        table: &NeighbourTable,
        clusters: &ClusterContainer,
        cache: &SpacePointCache,
        scratch: &SlotCache<SpacePointScratch>,
    ) -> SpacePointOutput {
        let mut state = scratch.checkout(ctx);
        let mut output = SpacePointOutput::default();

        let mut sensors: Vec<SensorHash> = clusters.keys().copied().collect();
        sensors.sort();
        for sensor in sensors {
            if table.neighbours(sensor).is_none() {
                continue;
            }
            if let Some(cached) = cache.get(sensor) {
                output.main.extend(cached.iter().cloned());
                continue;
            }
            let sensor_output =
                self.make_sensor_space_points(geometry, table, clusters, sensor, &mut state);
            output.overlap.extend(sensor_output.overlap);
            if cache.try_insert(sensor, sensor_output.main.clone()) {
                output.main.extend(sensor_output.main);
            } else if let Some(cached) = cache.get(sensor) {
                output.main.extend(cached.iter().cloned());
            }
        }
        scratch.checkin(ctx, state);
        log::debug!(
            "Event {}: {} space points, {} overlap space points",
            ctx.event_number,
            output.main.len(),
            output.overlap.len()
        );
        output
    }

    /// Pair the clusters of one axial sensor with those of its neighbours
    pub fn make_sensor_space_points<G: SensorGeometry>(
        &self,
        geometry: &G,
        table: &NeighbourTable,
        clusters: &ClusterContainer,
        sensor: SensorHash,
        scratch: &mut SpacePointScratch,
    ) -> SpacePointOutput {
        let mut output = SpacePointOutput::default();
        let (Some(neighbours), Some(design1), Some(clusters1)) = (
            table.neighbours(sensor),
            geometry.design(sensor),
            clusters.get(&sensor),
        ) else {
            return output;
        };
        let hw1 = table.half_width(sensor).unwrap_or(design1.max_width / 2.0);
        let first = (sensor, design1, clusters1.as_slice());
        let mut pair = |slot: NeighbourSlot, window: PairWindowFn| {
            let other = neighbours.get(slot)?;
            let design2 = geometry.design(other)?;
            let clusters2 = clusters.get(&other)?;
            let hw2 = table.half_width(other).unwrap_or(design2.max_width / 2.0);
            let second = (other, design2, clusters2.as_slice());
            Some(self.make_pair(first, second, window(hw1, hw2), scratch))
        };

        let opposite = self.overlap_limit_opposite;
        let opposite_window: PairWindowFn = &|_, _| PairWindow::Difference {
            min: -opposite,
            max: opposite,
        };
        output
            .main
            .extend(pair(NeighbourSlot::Opposite, opposite_window).unwrap_or_default());

        if self.process_overlaps {
            let limit = self.overlap_limit_phi;
            let widening = if self.sct_gap_parameter != 0.0 {
                PHI_OVERLAP_GAP_WIDENING
            } else {
                0.0
            };
            let next_window: PairWindowFn = &|hw1, hw2| PairWindow::PerCluster {
                min1: hw1 - limit - widening,
                max1: hw1 + widening,
                min2: -hw2,
                max2: -hw2 + limit,
            };
            let prev_window: PairWindowFn = &|hw1, hw2| PairWindow::PerCluster {
                min1: -hw1 - widening,
                max1: -hw1 + limit + widening,
                min2: hw2 - limit,
                max2: hw2,
            };
            output
                .overlap
                .extend(pair(NeighbourSlot::NextPhi, next_window).unwrap_or_default());
            output
                .overlap
                .extend(pair(NeighbourSlot::PrevPhi, prev_window).unwrap_or_default());
        }

        let (eta_min, eta_max) = (self.overlap_limit_eta_min, self.overlap_limit_eta_max);
        let next_eta: PairWindowFn = &|_, _| PairWindow::Difference {
            min: eta_min,
            max: eta_max,
        };
        let prev_eta: PairWindowFn = &|_, _| PairWindow::Difference {
            min: -eta_max,
            max: -eta_min,
        };
        output
            .main
            .extend(pair(NeighbourSlot::NextEta, next_eta).unwrap_or_default());
        output
            .main
            .extend(pair(NeighbourSlot::PrevEta, prev_eta).unwrap_or_default());
        output
    }

    /// All accepted space points of one sensor pair
    pub fn make_pair(
        &self,
        first: (SensorHash, &SensorDesign, &[SiCluster]),
        second: (SensorHash, &SensorDesign, &[SiCluster]),
        window: PairWindow,
        scratch: &mut SpacePointScratch,
    ) -> Vec<SpacePoint> {
        let (hash1, design1, clusters1) = first;
        let (hash2, design2, clusters2) = second;
        scratch.ends1.clear();
        scratch
            .ends1
            .extend(clusters1.iter().map(|c| design1.strip_ends(c.local_position)));
        scratch.ends2.clear();
        scratch
            .ends2
            .extend(clusters2.iter().map(|c| design2.strip_ends(c.local_position)));

        let gap_tolerance = if self.sct_gap_parameter != 0.0 {
            self.offset(design1, design2).1
        } else {
            0.0
        };

        let mut points = Vec::new();
        for (i, c1) in clusters1.iter().enumerate() {
            for (j, c2) in clusters2.iter().enumerate() {
                let ends2 = &scratch.ends2[j];
                if !self.all_clusters {
                    let accepted = match window {
                        PairWindow::Difference { min, max } => {
                            let centre2 = 0.5 * (ends2.0 + ends2.1);
                            let diff = design1.local_x(&centre2) - c1.local_position;
                            diff >= min && diff <= max
                        }
                        PairWindow::PerCluster {
                            min1,
                            max1,
                            min2,
                            max2,
                        } => {
                            c1.local_position >= min1
                                && c1.local_position <= max1
                                && c2.local_position >= min2
                                && c2.local_position <= max2
                        }
                    };
                    if !accepted {
                        continue;
                    }
                }
                let Some(position) = self.intersect(&scratch.ends1[i], ends2, gap_tolerance) else {
                    continue;
                };
                points.push(SpacePoint {
                    position,
                    covariance: covariance(design1, design2, c1.width, c2.width),
                    sensors: (hash1, hash2),
                    clusters: (
                        ClusterLink {
                            sensor: hash1,
                            index: i,
                        },
                        ClusterLink {
                            sensor: hash2,
                            index: j,
                        },
                    ),
                    station: design1.id.station,
                    layer: design1.id.layer,
                });
            }
        }
        points
    }

    /// Intersection of two strips given as end point pairs, None when it falls off either
    /// strip by more than the tolerances allow
    pub fn intersect(
        &self,
        ends1: &(Vector3<f64>, Vector3<f64>),
        ends2: &(Vector3<f64>, Vector3<f64>),
        gap_tolerance: f64,
    ) -> Option<Vector3<f64>> {
        let (a, b) = ends1;
        let (c, d) = ends2;
        let q = a - b;
        let r = c - d;
        let limit = 1.0 + self.strip_length_tolerance;

        let (m, n) = match self.mode {
            IntersectionMode::Vertex(v) => {
                let s = a + b - 2.0 * v;
                let t = c + d - 2.0 * v;
                let rt = r.cross(&t);
                let qs = q.cross(&s);
                let denom_m = q.dot(&rt);
                let denom_n = r.dot(&qs);
                if denom_m.abs() < f64::EPSILON || denom_n.abs() < f64::EPSILON {
                    return None;
                }
                (-s.dot(&rt) / denom_m, -t.dot(&qs) / denom_n)
            }
            IntersectionMode::ClosestApproach => {
                let mid1 = 0.5 * (a + b);
                let mid2 = 0.5 * (c + d);
                let w0 = mid1 - mid2;
                let (aa, bb, cc) = (q.dot(&q), q.dot(&r), r.dot(&r));
                let (dd, ee) = (q.dot(&w0), r.dot(&w0));
                let denom = aa * cc - bb * bb;
                if denom.abs() < f64::EPSILON * aa * cc {
                    return None;
                }
                // Points are mid + (m / 2) * direction
                let sc = (bb * ee - cc * dd) / denom;
                let tc = (aa * ee - bb * dd) / denom;
                (2.0 * sc, 2.0 * tc)
            }
        };

        let (m, n) = slide_into_strips((m, n), limit, gap_tolerance, &q, &r)?;
        let on_first = 0.5 * (a + b + m * q);
        let point = match self.mode {
            IntersectionMode::Vertex(_) => on_first,
            IntersectionMode::ClosestApproach => 0.5 * (on_first + 0.5 * (c + d + n * r)),
        };
        point.iter().all(|v| v.is_finite()).then_some(point)
    }

    /// Offset of the second sensor from the first and the strip length tolerance it implies
    pub fn offset(&self, design1: &SensorDesign, design2: &SensorDesign) -> (f64, f64) {
        let x12 = design1.phi_axis.dot(&design2.phi_axis);
        let normal = design1.normal();
        let r = design1.center.xy().norm();
        let s = (design1.center - design2.center).dot(&normal);
        let dm = self.sct_gap_parameter * r * (s * x12).abs();
        let sin2 = (1.0 - x12) * (1.0 + x12);
        if sin2 <= 0.0 {
            return (dm, 0.0);
        }
        let mut d = dm / sin2.sqrt();
        if normal.z.abs() > 0.7 && design1.center.z != 0.0 {
            d *= r / design1.center.z.abs();
        }
        (dm, d)
    }
}

/// Strip parameters after the tolerance checks. A parameter past the end of its strip by
/// no more than `gap_tolerance` (mm) is pulled back to the end, and the other parameter moves
/// by the projection of that step onto its own strip so both points slide together.
fn slide_into_strips(
    (mut m, mut n): (f64, f64),
    limit: f64,
    gap_tolerance: f64,
    q: &Vector3<f64>,
    r: &Vector3<f64>,
) -> Option<(f64, f64)> {
    if !m.is_finite() || !n.is_finite() {
        return None;
    }
    let (qq, rr, qr) = (q.dot(q), r.dot(r), q.dot(r));
    if qq == 0.0 || rr == 0.0 {
        return None;
    }
    // A step dm moves the first point by dm * q / 2
    let max_dm = 2.0 * gap_tolerance / qq.sqrt();
    let max_dn = 2.0 * gap_tolerance / rr.sqrt();
    let overshoot = |v: f64| v.signum() * (v.abs() - limit).max(0.0);

    let dm = overshoot(m);
    if dm != 0.0 {
        if dm.abs() > max_dm {
            return None;
        }
        m -= dm;
        n -= dm * qr / rr;
    }
    let dn = overshoot(n);
    if dn != 0.0 {
        if dn.abs() > max_dn {
            return None;
        }
        n -= dn;
        m -= dn * qr / qq;
    }
    // The second slide can push the first parameter back out
    let eps = 1.0e-12;
    (m.abs() <= limit + eps && n.abs() <= limit + eps).then_some((m, n))
}

/// Global covariance from the two cluster widths: the first measures across its strips,
/// the stereo angle turns the second into a measurement along them
fn covariance(
    design1: &SensorDesign,
    design2: &SensorDesign,
    width1: f64,
    width2: f64,
) -> Matrix3<f64> {
    let var_phi = width1 * width1 / 12.0;
    let sin_stereo = design1.phi_axis.cross(&design2.phi_axis).norm();
    let var_strip = if sin_stereo > 1.0e-6 {
        width2 * width2 / 12.0 / (sin_stereo * sin_stereo)
    } else {
        let length = 2.0 * design1.half_length;
        length * length / 12.0
    };
    let u = design1.phi_axis;
    let v = design1.strip_axis;
    u * u.transpose() * var_phi + v * v.transpose() * var_strip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::test_geometry;

    const WIDTH: f64 = 0.08;

    fn clusters_for_track<G: SensorGeometry>(
        geometry: &G,
        x: f64,
        y: f64,
        sensors: &[SensorId],
    ) -> Vec<SiCluster> {
        sensors
            .iter()
            .map(|id| {
                let design = geometry.design(id.sensor_hash()).unwrap();
                let p = Vector3::new(x, y, design.center.z);
                SiCluster {
                    sensor: *id,
                    local_position: design.local_x(&p),
                    width: WIDTH,
                }
            })
            .collect()
    }

    #[test]
    fn test_coplanar_crossing() {
        let maker = SpacePointMaker::default();
        let p = Vector3::new(3.0, -2.0, 0.0);
        let u = Vector3::new(1.0, 0.0, 0.0);
        let w = Vector3::new(0.6, 0.8, 0.0);
        let ends1 = (p + 10.0 * u, p - 30.0 * u);
        let ends2 = (p + 20.0 * w, p - 5.0 * w);
        let point = maker.intersect(&ends1, &ends2, 0.0).unwrap();
        assert!((point - p).norm() < 1e-3);

        // Second strip moved so that the crossing is well off its end
        let shifted = (ends2.0 + 40.0 * w, ends2.1 + 40.0 * w);
        assert!(maker.intersect(&ends1, &shifted, 0.0).is_none());
    }

    fn vertex_strips(y: f64) -> ((Vector3<f64>, Vector3<f64>), (Vector3<f64>, Vector3<f64>)) {
        let angle: f64 = 0.04;
        let ends1 = (Vector3::new(10.0, 50.0, 100.0), Vector3::new(10.0, -50.0, 100.0));
        // Point on the first strip seen from the origin, projected onto the plane z = 101
        let q = Vector3::new(10.0, y, 100.0) * 1.01;
        let dir = Vector3::new(angle.sin(), angle.cos(), 0.0);
        (ends1, (q + 50.0 * dir, q - 50.0 * dir))
    }

    #[test]
    fn test_vertex_constrained_intersection() {
        let maker = SpacePointMaker {
            mode: IntersectionMode::Vertex(Vector3::zeros()),
            ..Default::default()
        };
        let (ends1, ends2) = vertex_strips(5.0);
        let point = maker.intersect(&ends1, &ends2, 0.0).unwrap();
        assert!((point - Vector3::new(10.0, 5.0, 100.0)).norm() < 1e-3);

        let (ends1, ends2) = vertex_strips(60.0);
        assert!(maker.intersect(&ends1, &ends2, 0.0).is_none());
    }

    #[test]
    fn test_gap_tolerance_extends_strip() {
        let maker = SpacePointMaker {
            mode: IntersectionMode::Vertex(Vector3::zeros()),
            ..Default::default()
        };
        let (ends1, ends2) = vertex_strips(51.5);
        assert!(maker.intersect(&ends1, &ends2, 0.0).is_none());
        let point = maker.intersect(&ends1, &ends2, 5.0).unwrap();
        // Pulled back to the tolerated end of the first strip
        assert!((point.y - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_gap_tolerance_slides_both_strips() {
        let maker = SpacePointMaker {
            mode: IntersectionMode::Vertex(Vector3::zeros()),
            ..Default::default()
        };
        let (ends1, ends2) = vertex_strips(5.0);
        // Second strip moved along itself so the crossing is 0.5 mm past its end
        let dir = (ends2.0 - ends2.1).normalize();
        let short = (ends2.0 + 51.0 * dir, ends2.1 + 51.0 * dir);
        assert!(maker.intersect(&ends1, &short, 0.0).is_none());
        assert!(maker.intersect(&ends1, &short, 0.2).is_none());

        let point = maker.intersect(&ends1, &short, 5.0).unwrap();
        // The first point follows the second back by the stereo projection of the 0.5 mm
        let shift = 0.5 * dir.y;
        assert!((point.x - 10.0).abs() < 1e-9);
        assert!((point.y - (5.0 + shift)).abs() < 1e-6);
        assert!((point.z - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_event_space_points() {
        let geo = test_geometry();
        let table = NeighbourTable::build(&geo, 0.02);
        let axial = SensorId::new(1, 0, 1, 1, 0);
        let clusters = clusters_for_track(&geo, 5.0, 10.0, &[axial, axial.opposite()]);
        let container = group_clusters(&geo, &clusters, 1).unwrap();

        let maker = SpacePointMaker::default();
        let ctx = EventContext::new(1, 0);
        let cache = SpacePointCache::new();
        let scratch = SlotCache::new(1);
        let output = maker.make_event(&ctx, &geo, &table, &container, &cache, &scratch);
        assert_eq!(output.main.len(), 1);
        assert!(output.overlap.is_empty());
        let sp = &output.main[0];
        assert!((sp.position.x - 5.0).abs() < 1e-6);
        assert!((sp.position.y - 10.0).abs() < 1e-6);
        assert!((sp.position.z - 1200.5).abs() < 1e-6);
        assert_eq!((sp.station, sp.layer), (1, 0));
        assert_eq!(sp.clusters.1.index, 0);
        assert!(sp.covariance[(1, 1)] > 0.0 && sp.covariance[(0, 0)] > sp.covariance[(1, 1)]);
        assert!(cache.contains(axial.sensor_hash()));

        // A second pass over the same event reuses the cached collection
        let again = maker.make_event(&ctx, &geo, &table, &container, &cache, &scratch);
        assert_eq!(again.main, output.main);
    }

    #[test]
    fn test_phi_overlap_space_points() {
        let geo = test_geometry();
        let table = NeighbourTable::build(&geo, 0.02);
        let phi0 = SensorId::new(1, 0, 0, 1, 0);
        let phi1 = SensorId::new(1, 0, 1, 1, 0);
        let sensors = [phi0, phi0.opposite(), phi1, phi1.opposite()];
        let clusters = clusters_for_track(&geo, 5.0, 0.0, &sensors);
        let container = group_clusters(&geo, &clusters, 3).unwrap();

        let maker = SpacePointMaker::default();
        let ctx = EventContext::new(3, 0);
        let output = maker.make_event(
            &ctx,
            &geo,
            &table,
            &container,
            &SpacePointCache::new(),
            &SlotCache::new(1),
        );
        assert_eq!(output.main.len(), 2);
        assert_eq!(output.overlap.len(), 2);
        for sp in output.overlap.iter() {
            assert!(sp.position.y.abs() < 1e-6);
        }

        let no_overlaps = SpacePointMaker {
            process_overlaps: false,
            ..Default::default()
        };
        let output = no_overlaps.make_event(
            &ctx,
            &geo,
            &table,
            &container,
            &SpacePointCache::new(),
            &SlotCache::new(1),
        );
        assert_eq!(output.main.len(), 2);
        assert!(output.overlap.is_empty());
    }

    #[test]
    fn test_unknown_sensor() {
        let geo = test_geometry();
        let cluster = SiCluster {
            sensor: SensorId::new(9, 0, 0, 0, 0),
            local_position: 0.0,
            width: WIDTH,
        };
        assert!(matches!(
            group_clusters(&geo, &[cluster], 4),
            Err(RecoError::UnknownSensor(4, _))
        ));
    }

    #[test]
    fn test_gap_parameter_is_clamped() {
        let maker = SpacePointMaker::default().with_gap_parameter(0.01);
        assert_eq!(maker.sct_gap_parameter, MAX_SCT_GAP_PARAMETER);
    }
}
