//! Node storage for the HNSW graph.
//!
//! Elements live in slots addressed by internal id. Neighbor references are
//! plain ids into those slots, so the (cyclic) graph owns nothing but integers.
//! Each slot carries:
//!
//! - the element data (label, top layer, vector), written once at allocation
//! - per-layer neighbor lists behind a `RwLock`, only ever replaced whole
//! - a mutation lock serialising writers of that slot's neighbor lists
//! - an atomic tombstone flag
//!
//! Slots are grouped in segments of doubling size that are materialised on
//! first use, so capacity is a limit rather than an up-front allocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::{MappedRwLockReadGuard, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::error::{Error, Result};

/// Internal node ID (dense, for array indexing).
pub type NodeId = u32;

/// User-chosen element label.
pub type Label = u64;

/// Segment `k` holds `2^(k + SEGMENT_BASE_BITS)` slots.
const SEGMENT_BASE_BITS: u32 = 6;
/// Enough segments to address every `NodeId`.
const SEGMENTS: usize = 32;

/// Segment index and offset of an id.
#[inline]
fn locate(id: usize) -> (usize, usize) {
    let shifted = id + (1 << SEGMENT_BASE_BITS);
    let segment = (usize::BITS - 1 - shifted.leading_zeros() - SEGMENT_BASE_BITS) as usize;
    (segment, shifted - segment_len(segment))
}

#[inline]
fn segment_len(segment: usize) -> usize {
    1 << (segment + SEGMENT_BASE_BITS as usize)
}

fn new_segment(segment: usize) -> Box<[Slot]> {
    (0..segment_len(segment)).map(|_| Slot::default()).collect()
}

/// Immutable data of an inserted element.
#[derive(Debug)]
pub(crate) struct Element {
    pub(crate) label: Label,
    pub(crate) level: usize,
    pub(crate) vector: Box<[f32]>,
}

#[derive(Debug, Default)]
struct Slot {
    element: OnceLock<Element>,
    links: RwLock<Vec<Vec<NodeId>>>,
    lock: Mutex<()>,
    deleted: AtomicBool,
}

impl Slot {
    fn populated(element: Element, links: Vec<Vec<NodeId>>, deleted: bool) -> Self {
        let slot = Slot {
            element: OnceLock::new(),
            links: RwLock::new(links),
            lock: Mutex::new(()),
            deleted: AtomicBool::new(deleted),
        };
        let _ = slot.element.set(element);
        slot
    }
}

/// Guard over the mutation locks of two slots, taken in ascending id order.
pub(crate) struct PairGuard<'a> {
    _low: MutexGuard<'a, ()>,
    _high: Option<MutexGuard<'a, ()>>,
}

/// Everything needed to rebuild one slot when loading a persisted index.
#[derive(Debug)]
pub(crate) struct StoredElement {
    pub(crate) label: Label,
    pub(crate) vector: Vec<f32>,
    pub(crate) links: Vec<Vec<NodeId>>,
    pub(crate) deleted: bool,
}

/// Element storage plus the label <-> id mapping.
#[derive(Debug)]
pub(crate) struct NodeStore {
    dim: usize,
    capacity: usize,
    segments: [OnceLock<Box<[Slot]>>; SEGMENTS],
    count: AtomicUsize,
    labels: RwLock<HashMap<Label, NodeId>>,
}

impl NodeStore {
    /// Create an empty store accepting up to `capacity` elements.
    pub(crate) fn new(dim: usize, capacity: usize) -> Self {
        Self {
            dim,
            capacity,
            segments: std::array::from_fn(|_| OnceLock::new()),
            count: AtomicUsize::new(0),
            labels: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild a store from decoded elements. Ids are the element positions.
    ///
    /// Only the segments covering `elements` are materialised.
    pub(crate) fn from_elements(dim: usize, capacity: usize, elements: Vec<StoredElement>) -> Self {
        let count = elements.len();
        let mut store = Self::new(dim, capacity.max(count));
        let labels = store.labels.get_mut();
        labels.reserve(count);

        for (id, stored) in elements.into_iter().enumerate() {
            labels.insert(stored.label, id as NodeId);
            let element = Element {
                label: stored.label,
                level: stored.links.len().saturating_sub(1),
                vector: stored.vector.into_boxed_slice(),
            };

            let (segment, offset) = locate(id);
            let cell = &mut store.segments[segment];
            cell.get_or_init(|| new_segment(segment));
            if let Some(slots) = cell.get_mut() {
                slots[offset] = Slot::populated(element, stored.links, stored.deleted);
            }
        }
        store.count = AtomicUsize::new(count);
        store
    }

    pub(crate) fn dim(&self) -> usize {
        self.dim
    }

    /// Number of allocated elements, live and tombstoned.
    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of allocated elements that are not tombstoned.
    pub(crate) fn live_len(&self) -> usize {
        (0..self.len() as NodeId)
            .filter(|&id| !self.is_deleted(id))
            .count()
    }

    #[inline]
    fn try_slot(&self, id: NodeId) -> Option<&Slot> {
        let (segment, offset) = locate(id as usize);
        self.segments.get(segment)?.get()?.get(offset)
    }

    /// Slot of an id handed out by [`allocate`](Self::allocate).
    #[inline]
    fn slot(&self, id: NodeId) -> &Slot {
        let (segment, offset) = locate(id as usize);
        let slots: &[Slot] = self.segments[segment].get().map_or(&[][..], |s| &s[..]);
        &slots[offset]
    }

    /// Register `label` and fill the next slot.
    ///
    /// All checks happen before anything is written, so a failed allocation
    /// leaves the store untouched.
    pub(crate) fn allocate(&self, label: Label, vector: &[f32], level: usize) -> Result<NodeId> {
        let mut labels = self.labels.write();
        if labels.contains_key(&label) {
            return Err(Error::DuplicateLabel(label));
        }

        let id = self.count.load(Ordering::Acquire);
        if id >= self.capacity {
            return Err(Error::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let (segment, offset) = locate(id);
        let slot = &self.segments[segment].get_or_init(|| new_segment(segment))[offset];
        // Slots at or past `count` are never populated: ids are handed out only
        // here, under the label lock.
        let _ = slot.element.set(Element {
            label,
            level,
            vector: vector.to_vec().into_boxed_slice(),
        });
        *slot.links.write() = vec![Vec::new(); level + 1];
        slot.deleted.store(false, Ordering::Release);

        labels.insert(label, id as NodeId);
        self.count.store(id + 1, Ordering::Release);
        Ok(id as NodeId)
    }

    /// Raise the capacity limit. Requires exclusive access.
    pub(crate) fn grow(&mut self, capacity: usize) {
        self.capacity = self.capacity.max(capacity);
    }

    #[inline]
    pub(crate) fn element(&self, id: NodeId) -> Option<&Element> {
        self.try_slot(id)?.element.get()
    }

    #[inline]
    pub(crate) fn vector(&self, id: NodeId) -> Option<&[f32]> {
        self.element(id).map(|e| &*e.vector)
    }

    #[inline]
    pub(crate) fn level(&self, id: NodeId) -> Option<usize> {
        self.element(id).map(|e| e.level)
    }

    #[inline]
    pub(crate) fn label(&self, id: NodeId) -> Option<Label> {
        self.element(id).map(|e| e.label)
    }

    #[inline]
    pub(crate) fn is_deleted(&self, id: NodeId) -> bool {
        self.slot(id).deleted.load(Ordering::Acquire)
    }

    /// Flip the tombstone. Returns the previous value.
    pub(crate) fn set_deleted(&self, id: NodeId, deleted: bool) -> bool {
        self.slot(id).deleted.swap(deleted, Ordering::AcqRel)
    }

    /// Resolve a label to its internal id, tombstoned or not.
    pub(crate) fn id_of(&self, label: Label) -> Result<NodeId> {
        self.labels
            .read()
            .get(&label)
            .copied()
            .ok_or(Error::NotFound(label))
    }

    /// Read-only view of a node's neighbor list at `layer`.
    ///
    /// Empty when the node does not reach that layer. The view pins the list, so
    /// a concurrent prune installs its replacement only after the view is dropped.
    #[inline]
    pub(crate) fn links(&self, id: NodeId, layer: usize) -> MappedRwLockReadGuard<'_, [NodeId]> {
        RwLockReadGuard::map(self.slot(id).links.read(), |links| {
            links.get(layer).map(Vec::as_slice).unwrap_or(&[])
        })
    }

    /// Replace a node's whole neighbor list at `layer`.
    ///
    /// Callers hold the slot's mutation lock and build `list` beforehand, so
    /// readers observe either the old or the new list.
    pub(crate) fn set_links(&self, id: NodeId, layer: usize, list: Vec<NodeId>) {
        let mut links = self.slot(id).links.write();
        if let Some(current) = links.get_mut(layer) {
            *current = list;
        }
    }

    /// All neighbor lists of a node, layer 0 first.
    pub(crate) fn all_links(&self, id: NodeId) -> Vec<Vec<NodeId>> {
        self.slot(id).links.read().clone()
    }

    /// Acquire the mutation lock of one slot.
    pub(crate) fn lock(&self, id: NodeId) -> MutexGuard<'_, ()> {
        self.slot(id).lock.lock()
    }

    /// Acquire the mutation locks of two slots in ascending id order.
    pub(crate) fn lock_pair(&self, a: NodeId, b: NodeId) -> PairGuard<'_> {
        if a == b {
            return PairGuard {
                _low: self.lock(a),
                _high: None,
            };
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let low = self.lock(low);
        let high = self.lock(high);
        PairGuard {
            _low: low,
            _high: Some(high),
        }
    }

    /// Snapshot of the label map as `(label, id)` pairs sorted by id.
    pub(crate) fn label_entries(&self) -> Vec<(Label, NodeId)> {
        let mut entries: Vec<(Label, NodeId)> = self
            .labels
            .read()
            .iter()
            .map(|(&label, &id)| (label, id))
            .collect();
        entries.sort_unstable_by_key(|&(_, id)| id);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocate_sequential_ids() {
        let store = NodeStore::new(2, 4);
        assert_eq!(store.allocate(10, &[1.0, 2.0], 0).unwrap(), 0);
        assert_eq!(store.allocate(20, &[3.0, 4.0], 2).unwrap(), 1);

        assert_eq!(store.len(), 2);
        assert_eq!(store.capacity(), 4);
        assert_eq!(store.vector(1).unwrap(), &[3.0, 4.0]);
        assert_eq!(store.level(1), Some(2));
        assert_eq!(store.label(0), Some(10));
        assert_eq!(store.id_of(20).unwrap(), 1);
        assert_eq!(store.all_links(1).len(), 3);
        assert!(store.vector(2).is_none());
    }

    #[test]
    fn test_duplicate_label() {
        let store = NodeStore::new(1, 4);
        store.allocate(7, &[1.0], 0).unwrap();
        assert!(matches!(
            store.allocate(7, &[2.0], 0),
            Err(Error::DuplicateLabel(7))
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(store.vector(0).unwrap(), &[1.0]);
    }

    #[test]
    fn test_capacity_and_grow() {
        let mut store = NodeStore::new(1, 1);
        store.allocate(1, &[1.0], 0).unwrap();
        assert!(matches!(
            store.allocate(2, &[2.0], 0),
            Err(Error::CapacityExceeded { capacity: 1 })
        ));
        // A rejected allocation must not register the label.
        assert!(matches!(store.id_of(2), Err(Error::NotFound(2))));

        store.grow(3);
        assert_eq!(store.capacity(), 3);
        assert_eq!(store.allocate(2, &[2.0], 0).unwrap(), 1);
    }

    #[test]
    fn test_tombstones() {
        let store = NodeStore::new(1, 2);
        store.allocate(1, &[1.0], 0).unwrap();
        store.allocate(2, &[2.0], 0).unwrap();

        assert!(!store.set_deleted(0, true));
        assert!(store.is_deleted(0));
        assert_eq!(store.live_len(), 1);
        // Tombstoned labels stay mapped.
        assert_eq!(store.id_of(1).unwrap(), 0);

        assert!(store.set_deleted(0, false));
        assert_eq!(store.live_len(), 2);
    }

    #[test]
    fn test_links_replace_whole_list() {
        let store = NodeStore::new(1, 3);
        store.allocate(1, &[1.0], 1).unwrap();
        store.set_links(0, 1, vec![1, 2]);
        assert_eq!(&*store.links(0, 1), &[1, 2]);
        assert!(store.links(0, 0).is_empty());
        assert!(store.links(0, 5).is_empty());

        // Layers above the node's top layer are ignored.
        store.set_links(0, 4, vec![9]);
        assert_eq!(store.all_links(0).len(), 2);
    }

    #[test]
    fn test_lock_pair_orders_locks() {
        let store = Arc::new(NodeStore::new(1, 2));
        store.allocate(1, &[1.0], 0).unwrap();
        store.allocate(2, &[2.0], 0).unwrap();

        // Opposite argument orders from two threads must not deadlock.
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = if t % 2 == 0 {
                            store.lock_pair(0, 1)
                        } else {
                            store.lock_pair(1, 0)
                        };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let _same = store.lock_pair(1, 1);
    }

    #[test]
    fn test_segment_layout() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(63), (0, 63));
        assert_eq!(locate(64), (1, 0));
        assert_eq!(locate(191), (1, 127));
        assert_eq!(locate(192), (2, 0));

        let (segment, offset) = locate(u32::MAX as usize - 1);
        assert!(segment < SEGMENTS);
        assert!(offset < segment_len(segment));

        // Consecutive ids tile the segments without gaps.
        let mut expected = (0, 0);
        for id in 0..2_000 {
            assert_eq!(locate(id), expected, "id {}", id);
            expected.1 += 1;
            if expected.1 == segment_len(expected.0) {
                expected = (expected.0 + 1, 0);
            }
        }
    }

    #[test]
    fn test_capacity_is_a_limit_not_an_allocation() {
        let mut store = NodeStore::new(2, u32::MAX as usize);
        assert!(store.segments.iter().all(|s| s.get().is_none()));

        for label in 0..100u64 {
            store.allocate(label, &[label as f32, 0.0], 0).unwrap();
        }
        let materialised = store.segments.iter().filter(|s| s.get().is_some()).count();
        assert_eq!(materialised, 2);
        assert_eq!(store.vector(99).unwrap(), &[99.0, 0.0]);

        store.grow(10);
        assert_eq!(store.capacity(), u32::MAX as usize);
    }

    #[test]
    fn test_from_elements() {
        let elements = vec![
            StoredElement {
                label: 5,
                vector: vec![0.5],
                links: vec![vec![1], vec![1]],
                deleted: false,
            },
            StoredElement {
                label: 6,
                vector: vec![0.6],
                links: vec![vec![0], vec![0]],
                deleted: true,
            },
        ];
        let store = NodeStore::from_elements(1, 4, elements);
        assert_eq!(store.len(), 2);
        assert_eq!(store.capacity(), 4);
        assert_eq!(store.level(0), Some(1));
        assert!(store.is_deleted(1));
        assert_eq!(store.label_entries(), vec![(5, 0), (6, 1)]);
        assert_eq!(store.allocate(7, &[0.7], 0).unwrap(), 2);
    }
}
