//! Visited markers for graph searches, pooled across searches.
//!
//! Each set stamps ids with the generation of the search that reached them, so
//! reusing a set costs one counter bump instead of a clear. Sets are sized from
//! the element count when handed out and grow when a search reaches an id
//! allocated after that, which concurrent inserts make possible.

use parking_lot::Mutex;

/// Per-id generation stamps. An id is visited when its stamp equals the
/// current generation.
#[derive(Debug)]
pub struct VisitedSet {
    stamps: Vec<u16>,
    generation: u16,
}

impl VisitedSet {
    pub fn with_len(len: usize) -> Self {
        Self {
            stamps: vec![0; len],
            generation: 1,
        }
    }

    /// Start a new search. Stamps are only zeroed when the generation wraps.
    fn reset(&mut self, len: usize) {
        if self.generation == u16::MAX {
            self.stamps.fill(0);
            self.generation = 1;
        } else {
            self.generation += 1;
        }
        if len > self.stamps.len() {
            self.stamps.resize(len, 0);
        }
    }

    /// Mark `id`. Returns `true` on the first visit in this search.
    #[inline]
    pub fn insert(&mut self, id: u32) -> bool {
        let idx = id as usize;
        if idx >= self.stamps.len() {
            self.stamps.resize((idx + 1).next_power_of_two(), 0);
        }
        let stamp = &mut self.stamps[idx];
        if *stamp == self.generation {
            return false;
        }
        *stamp = self.generation;
        true
    }

    #[cfg(test)]
    fn contains(&self, id: u32) -> bool {
        self.stamps
            .get(id as usize)
            .is_some_and(|&stamp| stamp == self.generation)
    }
}

/// Pool of visited sets shared by concurrent searches.
#[derive(Debug, Default)]
pub struct VisitedPool {
    free: Mutex<Vec<VisitedSet>>,
}

impl VisitedPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a fresh set presized for `len` ids.
    pub fn acquire(&self, len: usize) -> VisitedSet {
        let idle = self.free.lock().pop();
        match idle {
            Some(mut set) => {
                set.reset(len);
                set
            }
            None => VisitedSet::with_len(len),
        }
    }

    /// Return a set to the pool.
    pub fn release(&self, set: VisitedSet) {
        self.free.lock().push(set);
    }

    /// Number of idle sets.
    #[cfg(test)]
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_reset() {
        let mut vs = VisitedSet::with_len(100);
        assert!(vs.insert(0));
        assert!(!vs.insert(0));
        assert!(vs.insert(50));
        assert!(vs.contains(50));

        vs.reset(100);
        assert!(!vs.contains(50));
        assert!(vs.insert(0));
        assert!(vs.insert(50));
    }

    #[test]
    fn test_grows_past_initial_len() {
        let mut vs = VisitedSet::with_len(4);
        assert!(!vs.contains(1000));
        assert!(vs.insert(1000));
        assert!(!vs.insert(1000));
        assert!(vs.stamps.len() >= 1001);
    }

    #[test]
    fn test_generation_wraps() {
        let mut vs = VisitedSet::with_len(10);
        for _ in 0..65534 {
            vs.reset(10);
        }
        assert_eq!(vs.generation, u16::MAX);
        vs.insert(5);

        vs.reset(10);
        assert_eq!(vs.generation, 1);
        assert!(vs.insert(5));
    }

    #[test]
    fn test_pool_reuse() {
        let pool = VisitedPool::new();
        let mut set = pool.acquire(8);
        set.insert(3);
        pool.release(set);
        assert_eq!(pool.idle(), 1);

        let mut set = pool.acquire(16);
        assert_eq!(pool.idle(), 0);
        assert!(set.insert(3), "acquired set must start empty");
        assert!(set.stamps.len() >= 16);
        pool.release(set);
    }
}
