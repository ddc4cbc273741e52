use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::error::DetectorError;

/// The scintillator/calorimeter system a digitizer channel is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorKind {
    Calo,
    Preshower,
    Trigger,
    Veto,
    VetoNu,
    Clock,
}

impl FromStr for DetectorKind {
    type Err = DetectorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calo" => Ok(Self::Calo),
            "preshower" => Ok(Self::Preshower),
            "trigger" => Ok(Self::Trigger),
            "veto" => Ok(Self::Veto),
            "vetonu" => Ok(Self::VetoNu),
            "clock" => Ok(Self::Clock),
            _ => Err(DetectorError::InvalidKeyword(s.to_string())),
        }
    }
}

impl DetectorKind {
    /// Number of index columns the channel map carries for this kind
    pub fn n_indices(&self) -> usize {
        match self {
            Self::Calo | Self::Preshower | Self::Veto | Self::VetoNu => 2,
            Self::Trigger => 3,
            Self::Clock => 0,
        }
    }
}

/// DetectorId identifies the physical sensor (PMT) read out by a digitizer channel.
///
/// The meaning of the indices depends on the kind: (row, module) for the calorimeter,
/// (station, plate) for the scintillator planes and (station, plate, pmt) for the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetectorId {
    pub kind: DetectorKind,
    pub indices: [u8; 3],
}

impl DetectorId {
    pub fn new(kind: &str, indices: &[u8]) -> Result<Self, DetectorError> {
        let kind = DetectorKind::from_str(kind)?;
        if indices.len() != kind.n_indices() {
            return Err(DetectorError::BadIndexCount(indices.len(), kind.n_indices()));
        }
        let mut idx = [0; 3];
        idx[..indices.len()].copy_from_slice(indices);
        Ok(Self { kind, indices: idx })
    }

    pub fn clock() -> Self {
        Self {
            kind: DetectorKind::Clock,
            indices: [0; 3],
        }
    }

    pub fn is_calo(&self) -> bool {
        self.kind == DetectorKind::Calo
    }

    pub fn is_clock(&self) -> bool {
        self.kind == DetectorKind::Clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_detector_id() {
        let id = DetectorId::new("trigger", &[0, 1, 1]).unwrap();
        assert_eq!(id.kind, DetectorKind::Trigger);
        assert_eq!(id.indices, [0, 1, 1]);
        assert!(DetectorId::new("calo", &[0, 1, 1]).is_err());
        assert!(DetectorId::new("pads", &[]).is_err());
        assert!(DetectorId::new("clock", &[]).unwrap().is_clock());
    }
}
