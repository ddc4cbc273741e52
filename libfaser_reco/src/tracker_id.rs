use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of one silicon sensor (wafer side) in the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId {
    pub station: u8,
    pub layer: u8,
    /// Module position across the strips
    pub phi: u8,
    /// Module position along the strips
    pub eta: u8,
    /// 0 for the axial side, 1 for the stereo side
    pub side: u8,
}

impl SensorId {
    pub fn new(station: u8, layer: u8, phi: u8, eta: u8, side: u8) -> Self {
        Self {
            station,
            layer,
            phi,
            eta,
            side,
        }
    }

    /// The sensor on the other side of the same module
    pub fn opposite(&self) -> Self {
        Self {
            side: 1 - self.side.min(1),
            ..*self
        }
    }

    /// Same side, module shifted by (dphi, deta). None when that falls off the index range.
    pub fn shifted(&self, dphi: i8, deta: i8) -> Option<Self> {
        Some(Self {
            phi: self.phi.checked_add_signed(dphi)?,
            eta: self.eta.checked_add_signed(deta)?,
            ..*self
        })
    }

    pub fn is_axial(&self) -> bool {
        self.side == 0
    }

    pub fn sensor_hash(&self) -> SensorHash {
        SensorHash(generate_sensor_hash(
            self.station,
            self.layer,
            self.phi,
            self.eta,
            self.side,
        ))
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "station {} layer {} phi {} eta {} side {}",
            self.station, self.layer, self.phi, self.eta, self.side
        )
    }
}

/// Compact key of a sensor, used for tables and caches
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SensorHash(pub u32);

impl fmt::Display for SensorHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a unique number for a sensor address
pub fn generate_sensor_hash(station: u8, layer: u8, phi: u8, eta: u8, side: u8) -> u32 {
    (side as u32)
        + (eta as u32) * 10
        + (phi as u32) * 1_000
        + (layer as u32) * 100_000
        + (station as u32) * 1_000_000
}
