//! The per-event algorithm chain.
//!
//! A [`Reconstructor`] is built once per job and shared by every worker. Each worker is an
//! execution slot: its scratch state lives in the slot cache under its worker id.
use std::sync::Arc;

use super::cache::{EventContext, SlotCache, SpacePointCache};
use super::calorimeter::CalorimeterHitMaker;
use super::channel_map::ChannelMap;
use super::config::Config;
use super::error::{ProcessorError, RecoError};
use super::event::{RawEvent, RecoEvent};
use super::geometry::{read_geometry_file, DetectorGeometry, SensorGeometry};
use super::hit_reco::{HitReconstructor, StaticTiming};
use super::momentum::MomentumEstimator;
use super::neighbour_table::NeighbourTableStore;
use super::seed::SeedBuilder;
use super::space_point::{group_clusters, SpacePointMaker, SpacePointScratch};

#[derive(Debug)]
pub struct Reconstructor {
    channel_map: ChannelMap,
    geometry: Option<DetectorGeometry>,
    tables: NeighbourTableStore,
    scratch: SlotCache<SpacePointScratch>,
    hits: HitReconstructor,
    timing: StaticTiming,
    calorimeter: CalorimeterHitMaker,
    space_points: SpacePointMaker,
    seeds: SeedBuilder,
    momentum: MomentumEstimator,
}

impl Reconstructor {
    pub fn new(
        config: &Config,
        channel_map: ChannelMap,
        geometry: Option<DetectorGeometry>,
        n_slots: usize,
    ) -> Self {
        Self {
            channel_map,
            geometry,
            tables: NeighbourTableStore::new(config.tracker.sensor_width_margin),
            scratch: SlotCache::new(n_slots),
            hits: config.waveform.hit_reconstructor(),
            timing: config.timing.clone(),
            calorimeter: config.calorimeter.clone(),
            space_points: config.tracker.space_point_maker(),
            seeds: config.tracker.seed_builder(),
            momentum: config.tracker.momentum_estimator(),
        }
    }

    /// Load the channel map and geometry named by the configuration
    pub fn from_config(config: &Config) -> Result<Arc<Self>, ProcessorError> {
        let channel_map = ChannelMap::new(config.channel_map_path.as_deref())?;
        let geometry = match &config.geometry_path {
            Some(path) => {
                let geometry = read_geometry_file(path)?;
                log::info!(
                    "Loaded geometry version {} with {} sensors",
                    geometry.version(),
                    geometry.len()
                );
                Some(geometry)
            }
            None => {
                log::warn!("No geometry configured, tracker reconstruction is disabled");
                None
            }
        };
        Ok(Arc::new(Self::new(
            config,
            channel_map,
            geometry,
            config.n_threads.max(1) as usize,
        )))
    }

    /// Run every algorithm on one event.
    ///
    /// An `Err` means the event's tracker input is unusable; the caller skips the event.
    ///
    /// The space point cache is keyed by sensor only, so it lives for one event: a shared
    /// cache would hand one event's points to the next. Within the event it still makes
    /// every sensor's collection first-fill-wins for passes that revisit a sensor.
    pub fn reconstruct_event(&self, raw: &RawEvent, slot: usize) -> Result<RecoEvent, RecoError> {
        let ctx = EventContext::new(raw.event_number, slot);
        let event_hits = self
            .hits
            .reconstruct_event(&raw.waveforms, &self.channel_map, &self.timing);
        let calo_hits = self.calorimeter.make_hits(&event_hits.hits);
        let mut event = RecoEvent {
            event_number: raw.event_number,
            clock: event_hits.clock,
            hits: event_hits.hits,
            calo_hits,
            ..Default::default()
        };

        let Some(geometry) = &self.geometry else {
            return Ok(event);
        };
        if raw.clusters.is_empty() {
            return Ok(event);
        }
        let table = self.tables.get_or_build(geometry);
        let clusters = group_clusters(geometry, &raw.clusters, raw.event_number)?;
        let cache = SpacePointCache::new();
        let output = self.space_points.make_event(
            &ctx,
            geometry,
            &table,
            &clusters,
            &cache,
            &self.scratch,
        );
        event.seeds = self.seeds.build(&output.main);
        event.tracks = self.momentum.candidates(&event.seeds);
        event.space_points = output.main;
        event.overlap_space_points = output.overlap;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::test_geometry;
    use crate::hit::HitStatus;
    use crate::seed::SeedStrategy;
    use crate::space_point::SiCluster;
    use crate::tracker_id::SensorId;
    use crate::waveform::RawWaveform;

    fn pulse_waveform(channel: u32) -> RawWaveform {
        // Negative pulse of 600 counts at sample 410 (t = 820 ns, the nominal trigger time)
        let counts = (0..600)
            .map(|i| {
                let d = (i as f64 - 410.0) / 2.0;
                (8000.0 - 600.0 * (-0.5 * d * d).exp()).round() as u16
            })
            .collect();
        RawWaveform::new(channel, counts, 2.0)
    }

    /// Axial and stereo cluster of a slowly bending track in every layer of a station.
    /// The track runs along x = -24, the middle of the eta 0 modules.
    fn track_clusters(geo: &DetectorGeometry, station: u8) -> Vec<SiCluster> {
        let mut clusters = Vec::new();
        for layer in 0..3 {
            for side in 0..2 {
                let id = SensorId::new(station, layer, 1, 0, side);
                let design = geo.design(geo.lookup(&id).unwrap()).unwrap();
                let z = 1200.0 * station as f64 + 50.0 * layer as f64;
                let mut point = design.center;
                point.y = 30.0 + (z - 1800.0).powi(2) / 200_000.0;
                clusters.push(SiCluster {
                    sensor: id,
                    local_position: design.local_x(&point),
                    width: 0.08,
                });
            }
        }
        clusters
    }

    #[test]
    fn test_reconstruct_event() {
        let geo = test_geometry();
        let mut raw = RawEvent {
            event_number: 7,
            waveforms: vec![pulse_waveform(0)],
            ..Default::default()
        };
        raw.clusters.extend(track_clusters(&geo, 1));
        raw.clusters.extend(track_clusters(&geo, 2));

        let mut config = Config::default();
        config.waveform.use_simple_baseline = true;
        let reco = Reconstructor::new(&config, ChannelMap::new(None).unwrap(), Some(geo), 2);
        let event = reco.reconstruct_event(&raw, 1).unwrap();
        assert_eq!(event.event_number, 7);

        let hit = event.hits.iter().find(|h| h.channel == 0).unwrap();
        assert!(!hit.status.test(HitStatus::THRESHOLD_FAILED));
        assert!((hit.mean - 820.0).abs() < 1.0);
        assert!(event
            .hits
            .iter()
            .filter(|h| h.channel != 0)
            .all(|h| h.status.test(HitStatus::WAVEFORM_MISSING)));

        assert_eq!(event.space_points.len(), 6);
        assert!(event
            .space_points
            .iter()
            .all(|sp| (sp.position.x + 24.0).abs() < 1e-6));
        let joined: Vec<_> = event
            .seeds
            .iter()
            .filter(|s| s.strategy == SeedStrategy::TripletSpFirststation)
            .collect();
        assert_eq!(joined.len(), 1);
        assert_eq!(event.tracks.len(), 1);
        assert!(event.tracks[0].estimate.p > 0.0);
    }

    #[test]
    fn test_space_points_do_not_leak_between_events() {
        let geo = test_geometry();
        let mut first = RawEvent {
            event_number: 1,
            ..Default::default()
        };
        first.clusters.extend(track_clusters(&geo, 1));
        let mut second = RawEvent {
            event_number: 2,
            ..Default::default()
        };
        // Same sensors, every cluster moved 2 mm along the strip measurement direction
        second.clusters = first
            .clusters
            .iter()
            .map(|c| SiCluster {
                local_position: c.local_position + 2.0,
                ..*c
            })
            .collect();

        let reco = Reconstructor::new(
            &Config::default(),
            ChannelMap::new(None).unwrap(),
            Some(geo),
            1,
        );
        let a = reco.reconstruct_event(&first, 0).unwrap();
        let b = reco.reconstruct_event(&second, 0).unwrap();
        assert_eq!(a.space_points.len(), 3);
        assert_eq!(b.space_points.len(), 3);
        for (pa, pb) in a.space_points.iter().zip(b.space_points.iter()) {
            assert!((pa.position - pb.position).norm() > 1.0);
        }
        let again = reco.reconstruct_event(&first, 0).unwrap();
        assert_eq!(again.space_points, a.space_points);
    }

    #[test]
    fn test_unknown_sensor_skips_event() {
        let geo = test_geometry();
        let raw = RawEvent {
            event_number: 3,
            clusters: vec![SiCluster {
                sensor: SensorId::new(9, 0, 0, 0, 0),
                local_position: 0.0,
                width: 0.08,
            }],
            ..Default::default()
        };
        let reco = Reconstructor::new(
            &Config::default(),
            ChannelMap::new(None).unwrap(),
            Some(geo),
            1,
        );
        assert!(matches!(
            reco.reconstruct_event(&raw, 0),
            Err(RecoError::UnknownSensor(3, _))
        ));
    }
}
