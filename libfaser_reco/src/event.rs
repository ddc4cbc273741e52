use serde::{Deserialize, Serialize};
use std::path::Path;

use super::clock::WaveformClock;
use super::error::InputError;
use super::hit::{CalorimeterHit, WaveformHit};
use super::momentum::TrackCandidate;
use super::seed::Seed;
use super::space_point::{SiCluster, SpacePoint};
use super::waveform::RawWaveform;

/// One readout record of a run, as produced by the upstream decoder.
///
/// Fragments arrive ordered by event number; an event can be split over several fragments of
/// either kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputFragment {
    Digitizer {
        event_number: u64,
        waveforms: Vec<RawWaveform>,
    },
    Tracker {
        event_number: u64,
        clusters: Vec<SiCluster>,
    },
}

impl InputFragment {
    pub fn event_number(&self) -> u64 {
        match self {
            Self::Digitizer { event_number, .. } | Self::Tracker { event_number, .. } => {
                *event_number
            }
        }
    }
}

/// Everything read out for one event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEvent {
    pub event_number: u64,
    pub waveforms: Vec<RawWaveform>,
    pub clusters: Vec<SiCluster>,
}

impl RawEvent {
    /// Merge the fragments of one event. Fragments are assumed to share the event number.
    pub fn new(event_number: u64, fragments: Vec<InputFragment>) -> Self {
        let mut event = Self {
            event_number,
            ..Default::default()
        };
        for fragment in fragments {
            match fragment {
                InputFragment::Digitizer { waveforms, .. } => event.waveforms.extend(waveforms),
                InputFragment::Tracker { clusters, .. } => event.clusters.extend(clusters),
            }
        }
        event
    }
}

/// Contents of a run input file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    pub run_number: i32,
    pub fragments: Vec<InputFragment>,
}

impl RunInput {
    pub fn read(path: &Path) -> Result<Self, InputError> {
        if !path.exists() {
            return Err(InputError::BadFilePath(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

/// Reconstruction output of one event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoEvent {
    pub event_number: u64,
    pub clock: Option<WaveformClock>,
    pub hits: Vec<WaveformHit>,
    pub calo_hits: Vec<CalorimeterHit>,
    pub space_points: Vec<SpacePoint>,
    pub overlap_space_points: Vec<SpacePoint>,
    pub seeds: Vec<Seed>,
    pub tracks: Vec<TrackCandidate>,
}

impl RecoEvent {
    /// Total calorimeter EM energy (MeV)
    pub fn calo_energy(&self) -> f64 {
        self.calo_hits.iter().map(|h| h.e_em).sum()
    }
}
