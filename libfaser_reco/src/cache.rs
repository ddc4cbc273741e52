//! Shared state that outlives a single call.
//!
//! Locks are only held around presence tests, inserts and slot resets. Numerical work is
//! always done on values that have been taken out of the lock.
use std::sync::{Arc, Mutex, MutexGuard};

use fxhash::FxHashMap;

use super::space_point::SpacePoint;
use super::tracker_id::SensorHash;

/// Identifies the event being processed and the execution slot processing it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventContext {
    pub event_number: u64,
    pub slot: usize,
}

impl EventContext {
    pub fn new(event_number: u64, slot: usize) -> Self {
        Self { event_number, slot }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Space point collections keyed by sensor, filled at most once per key.
///
/// A caller tests for presence, builds the collection without holding the lock and then
/// tries to insert it. If someone else got there first the new collection is dropped.
#[derive(Debug, Default)]
pub struct SpacePointCache {
    collections: Mutex<FxHashMap<SensorHash, Arc<Vec<SpacePoint>>>>,
}

impl SpacePointCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, sensor: SensorHash) -> bool {
        lock(&self.collections).contains_key(&sensor)
    }

    pub fn get(&self, sensor: SensorHash) -> Option<Arc<Vec<SpacePoint>>> {
        lock(&self.collections).get(&sensor).cloned()
    }

    /// Insert unless the key is already filled. Returns true if this collection was kept.
    pub fn try_insert(&self, sensor: SensorHash, points: Vec<SpacePoint>) -> bool {
        let mut collections = lock(&self.collections);
        if collections.contains_key(&sensor) {
            log::debug!("Space points for sensor {sensor} already cached, discarding duplicate");
            return false;
        }
        collections.insert(sensor, Arc::new(points));
        true
    }

    pub fn len(&self) -> usize {
        lock(&self.collections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.collections).clear();
    }
}

/// Scratch state that can be emptied for reuse
pub trait Scratch: Default + Send {
    fn reset(&mut self);
}

#[derive(Debug, Default)]
struct SlotEntry<T> {
    event_number: Option<u64>,
    state: Option<T>,
}

/// One scratch value per execution slot, reset whenever the slot moves on to a new event
#[derive(Debug)]
pub struct SlotCache<T: Scratch> {
    slots: Vec<Mutex<SlotEntry<T>>>,
}

impl<T: Scratch> SlotCache<T> {
    pub fn new(n_slots: usize) -> Self {
        Self {
            slots: (0..n_slots.max(1))
                .map(|_| {
                    Mutex::new(SlotEntry {
                        event_number: None,
                        state: None,
                    })
                })
                .collect(),
        }
    }

    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    /// Take the slot's scratch value out, emptied if the slot last served another event
    pub fn checkout(&self, ctx: &EventContext) -> T {
        let mut entry = lock(&self.slots[ctx.slot % self.slots.len()]);
        let mut state = entry.state.take().unwrap_or_default();
        if entry.event_number != Some(ctx.event_number) {
            state.reset();
            entry.event_number = Some(ctx.event_number);
        }
        state
    }

    /// Hand the scratch value back to its slot
    pub fn checkin(&self, ctx: &EventContext, state: T) {
        let mut entry = lock(&self.slots[ctx.slot % self.slots.len()]);
        if entry.event_number == Some(ctx.event_number) {
            entry.state = Some(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};
    use std::thread;

    #[derive(Debug, Default)]
    struct Counter {
        values: Vec<u64>,
    }

    impl Scratch for Counter {
        fn reset(&mut self) {
            self.values.clear();
        }
    }

    fn point(x: f64) -> SpacePoint {
        SpacePoint {
            position: Vector3::new(x, 0.0, 0.0),
            covariance: Matrix3::identity(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_fill_wins() {
        let cache = SpacePointCache::new();
        let sensor = SensorHash(10);
        assert!(!cache.contains(sensor));
        assert!(cache.try_insert(sensor, vec![point(1.0)]));
        assert!(!cache.try_insert(sensor, vec![point(2.0), point(3.0)]));
        let kept = cache.get(sensor).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].position.x, 1.0);
    }

    #[test]
    fn test_concurrent_fill() {
        let cache = SpacePointCache::new();
        let inserted: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let cache = &cache;
                    s.spawn(move || {
                        let mut kept = 0;
                        for sensor in 0..50 {
                            if !cache.contains(SensorHash(sensor))
                                && cache.try_insert(SensorHash(sensor), vec![point(i as f64)])
                            {
                                kept += 1;
                            }
                        }
                        kept
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(inserted, 50);
        assert_eq!(cache.len(), 50);
    }

    #[test]
    fn test_slot_reset_on_new_event() {
        let cache: SlotCache<Counter> = SlotCache::new(2);
        let first = EventContext::new(1, 0);
        let mut state = cache.checkout(&first);
        state.values.push(1);
        cache.checkin(&first, state);

        // Same event, same slot: the scratch survives
        let state = cache.checkout(&first);
        assert_eq!(state.values, vec![1]);
        cache.checkin(&first, state);

        // Other slot is independent
        assert!(cache.checkout(&EventContext::new(1, 1)).values.is_empty());

        let second = EventContext::new(2, 0);
        assert!(cache.checkout(&second).values.is_empty());
    }
}
