use std::fs::File;
use std::hint;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::MappedRegion;

/// Current mapping of a handle family: the region plus the file it maps
/// (absent in memory-only mode).
#[derive(Clone)]
pub struct MapState {
    pub region: Arc<MappedRegion>,
    pub file: Option<Arc<File>>,
}

/// Control block shared by a family of duplicated handles.
///
/// A remap publishes in three steps: bump `gen`, install the new state,
/// store `marker = gen`. A sibling whose cached generation differs spins
/// until `marker == gen`, then copies the state and re-derives its header
/// pointer and private directory. Keeping the old region alive under an
/// `Arc` means a handle mid-operation on the previous mapping is never
/// left dangling.
pub struct SharedMap {
    gen: AtomicU64,
    marker: AtomicU64,
    nrefs: AtomicUsize,
    state: Mutex<MapState>,
}

impl SharedMap {
    pub fn new(state: MapState) -> SharedMap {
        SharedMap {
            gen: AtomicU64::new(0),
            marker: AtomicU64::new(0),
            nrefs: AtomicUsize::new(1),
            state: Mutex::new(state),
        }
    }

    pub fn generation(&self) -> u64 {
        self.marker.load(Ordering::Acquire)
    }

    /// Install a new mapping; returns the generation it published.
    pub fn publish(&self, state: MapState) -> u64 {
        let gen = self.gen.fetch_add(1, Ordering::AcqRel) + 1;
        *self.state.lock() = state;
        self.marker.store(gen, Ordering::Release);
        gen
    }

    /// Re-read the current state if `cached_gen` is stale. Returns the
    /// fresh state and generation, or None when the cache is current.
    pub fn refresh(&self, cached_gen: u64) -> Option<(MapState, u64)> {
        if self.gen.load(Ordering::Acquire) == cached_gen {
            return None;
        }
        loop {
            let gen = self.gen.load(Ordering::Acquire);
            if self.marker.load(Ordering::Acquire) == gen {
                break;
            }
            hint::spin_loop();
        }
        let state = self.state.lock().clone();
        Some((state, self.marker.load(Ordering::Acquire)))
    }

    pub fn snapshot(&self) -> (MapState, u64) {
        let state = self.state.lock().clone();
        (state, self.marker.load(Ordering::Acquire))
    }

    pub fn add_ref(&self) {
        self.nrefs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; true when this was the last handle.
    pub fn release(&self) -> bool {
        self.nrefs.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(len: usize) -> Arc<MappedRegion> {
        Arc::new(MappedRegion::map_anon(len).unwrap())
    }

    #[test]
    fn test_refresh_only_on_change() {
        let shared = SharedMap::new(MapState {
            region: region(4096),
            file: None,
        });
        let (_, gen0) = shared.snapshot();
        assert!(shared.refresh(gen0).is_none());

        let gen1 = shared.publish(MapState {
            region: region(8192),
            file: None,
        });
        let (state, gen) = shared.refresh(gen0).expect("stale cache must refresh");
        assert_eq!(gen, gen1);
        assert_eq!(state.region.len(), 8192);
    }

    #[test]
    fn test_old_region_outlives_publish() {
        let shared = SharedMap::new(MapState {
            region: region(4096),
            file: None,
        });
        let (old, _) = shared.snapshot();
        shared.publish(MapState {
            region: region(8192),
            file: None,
        });
        // The pre-remap region is still valid for the straggler.
        assert_eq!(old.region.len(), 4096);
        // SAFETY: region held alive by `old`.
        unsafe {
            assert_eq!(*old.region.ptr(), 0);
        }
    }

    #[test]
    fn test_refcount() {
        let shared = SharedMap::new(MapState {
            region: region(4096),
            file: None,
        });
        shared.add_ref();
        assert!(!shared.release());
        assert!(shared.release());
    }
}
