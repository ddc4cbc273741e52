use std::sync::{Arc, RwLock};

use fxhash::FxHashMap;

use super::constants::SENSOR_WIDTH_MARGIN;
use super::geometry::SensorGeometry;
use super::tracker_id::SensorHash;

/// Position of a neighbour in the per-sensor slot array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighbourSlot {
    Opposite = 0,
    PrevPhi = 1,
    NextPhi = 2,
    PrevEta = 3,
    NextEta = 4,
}

/// Up to five neighbours of an axial sensor, in slot order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Neighbours {
    pub slots: [Option<SensorHash>; 5],
}

impl Neighbours {
    pub fn get(&self, slot: NeighbourSlot) -> Option<SensorHash> {
        self.slots[slot as usize]
    }
}

/// Neighbours and half-widths of every sensor for one geometry version. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct NeighbourTable {
    version: u64,
    neighbours: FxHashMap<SensorHash, Neighbours>,
    half_widths: FxHashMap<SensorHash, f64>,
}

impl NeighbourTable {
    pub fn build<G: SensorGeometry>(geometry: &G, margin: f64) -> Self {
        let mut table = Self {
            version: geometry.version(),
            ..Default::default()
        };
        for hash in geometry.sensors() {
            let Some(design) = geometry.design(hash) else {
                continue;
            };
            table
                .half_widths
                .insert(hash, (design.min_width + design.max_width) / 4.0 + margin);
            if !design.id.is_axial() {
                continue;
            }
            let Some(opposite) = geometry.opposite(hash) else {
                log::debug!("Sensor {} has no stereo partner", design.id);
                continue;
            };
            // Neighbouring modules are looked up from the stereo partner; missing eta
            // neighbours at the edge of the tracker are expected
            table.neighbours.insert(
                hash,
                Neighbours {
                    slots: [
                        Some(opposite),
                        geometry.prev_in_phi(opposite),
                        geometry.next_in_phi(opposite),
                        geometry.prev_in_eta(opposite),
                        geometry.next_in_eta(opposite),
                    ],
                },
            );
        }
        log::info!(
            "Built neighbour table for geometry version {} with {} axial sensors",
            table.version,
            table.neighbours.len()
        );
        table
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn neighbours(&self, hash: SensorHash) -> Option<&Neighbours> {
        self.neighbours.get(&hash)
    }

    pub fn half_width(&self, hash: SensorHash) -> Option<f64> {
        self.half_widths.get(&hash).copied()
    }
}

/// Publishes the neighbour table of the current geometry version.
///
/// Readers get an `Arc` to a complete table. A new table is built outside the lock and only
/// then swapped in, so no reader ever sees a partial table.
#[derive(Debug)]
pub struct NeighbourTableStore {
    current: RwLock<Option<Arc<NeighbourTable>>>,
    margin: f64,
}

impl Default for NeighbourTableStore {
    fn default() -> Self {
        Self::new(SENSOR_WIDTH_MARGIN)
    }
}

impl NeighbourTableStore {
    pub fn new(margin: f64) -> Self {
        Self {
            current: RwLock::new(None),
            margin,
        }
    }

    /// Table for `version`, if it is the one currently published
    pub fn get(&self, version: u64) -> Option<Arc<NeighbourTable>> {
        let guard = self.current.read().ok()?;
        guard.as_ref().filter(|t| t.version == version).cloned()
    }

    pub fn publish(&self, table: NeighbourTable) -> Arc<NeighbourTable> {
        let table = Arc::new(table);
        match self.current.write() {
            Ok(mut guard) => *guard = Some(table.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(table.clone()),
        }
        table
    }

    /// Table matching the geometry's version, building and publishing it if needed
    pub fn get_or_build<G: SensorGeometry>(&self, geometry: &G) -> Arc<NeighbourTable> {
        if let Some(table) = self.get(geometry.version()) {
            return table;
        }
        self.publish(NeighbourTable::build(geometry, self.margin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{test_geometry, DetectorGeometry};
    use crate::tracker_id::SensorId;

    #[test]
    fn test_neighbour_slots() {
        let geo = test_geometry();
        let table = NeighbourTable::build(&geo, SENSOR_WIDTH_MARGIN);
        let hash = geo.lookup(&SensorId::new(1, 1, 0, 1, 0)).unwrap();
        let n = table.neighbours(hash).unwrap();
        assert_eq!(
            n.get(NeighbourSlot::Opposite),
            geo.lookup(&SensorId::new(1, 1, 0, 1, 1))
        );
        assert_eq!(n.get(NeighbourSlot::PrevPhi), None);
        assert_eq!(
            n.get(NeighbourSlot::NextPhi),
            geo.lookup(&SensorId::new(1, 1, 1, 1, 1))
        );
        assert_eq!(
            n.get(NeighbourSlot::PrevEta),
            geo.lookup(&SensorId::new(1, 1, 0, 0, 1))
        );
        assert_eq!(n.get(NeighbourSlot::NextEta), None);
        assert!((table.half_width(hash).unwrap() - 32.02).abs() < 1e-12);

        // Stereo sensors carry no neighbour entry
        let stereo = geo.lookup(&SensorId::new(1, 1, 0, 1, 1)).unwrap();
        assert!(table.neighbours(stereo).is_none());
    }

    #[test]
    fn test_store_versions() {
        let store = NeighbourTableStore::new(SENSOR_WIDTH_MARGIN);
        let geo = test_geometry();
        assert!(store.get(geo.version()).is_none());
        let first = store.get_or_build(&geo);
        let again = store.get_or_build(&geo);
        assert!(Arc::ptr_eq(&first, &again));

        let realigned = DetectorGeometry::regular(2, &[0.0], 50.0, 1, 1, 0.04).unwrap();
        let second = store.get_or_build(&realigned);
        assert_eq!(second.version(), 2);
        assert!(store.get(1).is_none());
        // Old readers keep their table
        assert_eq!(first.version(), 1);
    }
}
