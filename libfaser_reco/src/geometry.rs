//! Tracker sensor geometry.
//!
//! The detector description is produced elsewhere; reconstruction only needs the frame of
//! each sensor and who sits next to whom. [`SensorGeometry`] is that narrow interface and
//! [`DetectorGeometry`] an in-memory implementation loaded from YAML.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use fxhash::FxHashMap;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::error::GeometryError;
use super::tracker_id::{SensorHash, SensorId};

const FRAME_TOLERANCE: f64 = 1.0e-6;

/// Placement and shape of one sensor in global coordinates (mm)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDesign {
    pub id: SensorId,
    pub center: Vector3<f64>,
    /// Unit vector across the strips (the measured coordinate)
    pub phi_axis: Vector3<f64>,
    /// Unit vector along the strips
    pub strip_axis: Vector3<f64>,
    /// Half of the strip length
    pub half_length: f64,
    pub min_width: f64,
    pub max_width: f64,
}

impl SensorDesign {
    pub fn normal(&self) -> Vector3<f64> {
        self.phi_axis.cross(&self.strip_axis)
    }

    /// Global end points of the strip at local position `local_x`
    pub fn strip_ends(&self, local_x: f64) -> (Vector3<f64>, Vector3<f64>) {
        let middle = self.center + self.phi_axis * local_x;
        let half = self.strip_axis * self.half_length;
        (middle + half, middle - half)
    }

    /// Local measured coordinate of a global point
    pub fn local_x(&self, global: &Vector3<f64>) -> f64 {
        self.phi_axis.dot(&(global - self.center))
    }

    fn has_valid_frame(&self) -> bool {
        (self.phi_axis.norm() - 1.0).abs() < FRAME_TOLERANCE
            && (self.strip_axis.norm() - 1.0).abs() < FRAME_TOLERANCE
            && self.phi_axis.dot(&self.strip_axis).abs() < FRAME_TOLERANCE
            && self.half_length > 0.0
    }
}

/// What reconstruction needs to know about the tracker layout
pub trait SensorGeometry {
    /// Changes whenever the layout or alignment changes
    fn version(&self) -> u64;
    fn design(&self, hash: SensorHash) -> Option<&SensorDesign>;
    fn lookup(&self, id: &SensorId) -> Option<SensorHash>;
    /// All sensors, sorted by hash
    fn sensors(&self) -> Vec<SensorHash>;

    fn id_of(&self, hash: SensorHash) -> Option<SensorId> {
        self.design(hash).map(|d| d.id)
    }

    fn opposite(&self, hash: SensorHash) -> Option<SensorHash> {
        self.lookup(&self.id_of(hash)?.opposite())
    }

    fn neighbour(&self, hash: SensorHash, dphi: i8, deta: i8) -> Option<SensorHash> {
        self.lookup(&self.id_of(hash)?.shifted(dphi, deta)?)
    }

    fn prev_in_phi(&self, hash: SensorHash) -> Option<SensorHash> {
        self.neighbour(hash, -1, 0)
    }

    fn next_in_phi(&self, hash: SensorHash) -> Option<SensorHash> {
        self.neighbour(hash, 1, 0)
    }

    fn prev_in_eta(&self, hash: SensorHash) -> Option<SensorHash> {
        self.neighbour(hash, 0, -1)
    }

    fn next_in_eta(&self, hash: SensorHash) -> Option<SensorHash> {
        self.neighbour(hash, 0, 1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GeometryFile {
    version: u64,
    sensors: Vec<SensorDesign>,
}

/// Sensor layout read from a geometry YAML file
#[derive(Debug, Clone, Default)]
pub struct DetectorGeometry {
    version: u64,
    designs: FxHashMap<SensorHash, SensorDesign>,
    ids: FxHashMap<SensorId, SensorHash>,
}

impl DetectorGeometry {
    pub fn new(version: u64, sensors: Vec<SensorDesign>) -> Result<Self, GeometryError> {
        let mut geometry = Self {
            version,
            ..Default::default()
        };
        for sensor in sensors {
            let hash = sensor.id.sensor_hash();
            if !sensor.has_valid_frame() {
                return Err(GeometryError::BadSensorFrame(hash.0));
            }
            if geometry.designs.contains_key(&hash) {
                return Err(GeometryError::DuplicateSensor(hash.0));
            }
            geometry.ids.insert(sensor.id, hash);
            geometry.designs.insert(hash, sensor);
        }
        Ok(geometry)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, GeometryError> {
        let file: GeometryFile = serde_yaml::from_str(contents)?;
        Self::new(file.version, file.sensors)
    }

    pub fn to_yaml(&self) -> Result<String, GeometryError> {
        let mut sensors: Vec<SensorDesign> = self.designs.values().cloned().collect();
        sensors.sort_by_key(|s| s.id.sensor_hash());
        Ok(serde_yaml::to_string(&GeometryFile {
            version: self.version,
            sensors,
        })?)
    }

    pub fn len(&self) -> usize {
        self.designs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.designs.is_empty()
    }

    /// A regular tracker: each station has three layers of `n_phi` x `n_eta` modules, each
    /// module an axial sensor plus a stereo sensor rotated by `stereo_angle` (rad)
    /// 1 mm downstream. Used for demos and tests.
    pub fn regular(
        version: u64,
        station_z: &[f64],
        layer_pitch: f64,
        n_phi: u8,
        n_eta: u8,
        stereo_angle: f64,
    ) -> Result<Self, GeometryError> {
        const MODULE_WIDTH: f64 = 64.0;
        const PHI_PITCH: f64 = 60.0;
        const HALF_LENGTH: f64 = 24.0;
        let mut sensors = Vec::new();
        for (station, z0) in station_z.iter().enumerate() {
            for layer in 0..3u8 {
                for phi in 0..n_phi {
                    for eta in 0..n_eta {
                        let y = (phi as f64 - (n_phi as f64 - 1.0) / 2.0) * PHI_PITCH;
                        let x = (eta as f64 - (n_eta as f64 - 1.0) / 2.0) * 2.0 * HALF_LENGTH;
                        let z = z0 + layer as f64 * layer_pitch;
                        for side in 0..2u8 {
                            let angle = side as f64 * stereo_angle;
                            sensors.push(SensorDesign {
                                id: SensorId::new(station as u8, layer, phi, eta, side),
                                center: Vector3::new(x, y, z + side as f64),
                                phi_axis: Vector3::new(-angle.sin(), angle.cos(), 0.0),
                                strip_axis: Vector3::new(angle.cos(), angle.sin(), 0.0),
                                half_length: HALF_LENGTH,
                                min_width: MODULE_WIDTH,
                                max_width: MODULE_WIDTH,
                            });
                        }
                    }
                }
            }
        }
        Self::new(version, sensors)
    }
}

impl SensorGeometry for DetectorGeometry {
    fn version(&self) -> u64 {
        self.version
    }

    fn design(&self, hash: SensorHash) -> Option<&SensorDesign> {
        self.designs.get(&hash)
    }

    fn lookup(&self, id: &SensorId) -> Option<SensorHash> {
        self.ids.get(id).copied()
    }

    fn sensors(&self) -> Vec<SensorHash> {
        let mut hashes: Vec<SensorHash> = self.designs.keys().copied().collect();
        hashes.sort();
        hashes
    }
}

/// Read the geometry YAML file at `path`
pub fn read_geometry_file(path: &Path) -> Result<DetectorGeometry, GeometryError> {
    if !path.exists() {
        return Err(GeometryError::BadFilePath(path.to_path_buf()));
    }
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    DetectorGeometry::from_yaml(&contents)
}

#[cfg(test)]
pub(crate) fn test_geometry() -> DetectorGeometry {
    DetectorGeometry::regular(1, &[0.0, 1200.0, 2400.0], 50.0, 2, 2, 0.04)
        .expect("test geometry is well formed")
}
