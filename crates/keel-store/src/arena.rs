//! Generational arena backing the objects a Store tracks.
//!
//! Handles are plain `Copy` indices. A slot's generation is bumped every
//! time its object is evicted, so a stale handle is detected instead of
//! silently aliasing whatever object reuses the slot.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_STORE_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies one Store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(u32);

impl StoreId {
    pub(crate) fn next() -> Self {
        StoreId(NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle to an object tracked by a Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    store: StoreId,
    index: u32,
    generation: u32,
}

impl ObjectId {
    pub fn store(&self) -> StoreId {
        self.store
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub(crate) struct Arena<T> {
    store: StoreId,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) fn new(store: StoreId) -> Self {
        Self {
            store,
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> ObjectId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return ObjectId {
                store: self.store,
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ObjectId {
            store: self.store,
            index,
            generation: 0,
        }
    }

    fn slot(&self, id: ObjectId) -> Option<&Slot<T>> {
        if id.store != self.store {
            return None;
        }
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn get(&self, id: ObjectId) -> Option<&T> {
        self.slot(id).and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Option<&mut T> {
        if id.store != self.store {
            return None;
        }
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Evict an object; its handle and every copy of it become stale.
    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<T> {
        if id.store != self.store {
            return None;
        }
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Handles of every live object, in slot order.
    pub(crate) fn ids(&self) -> Vec<ObjectId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ObjectId, &T)> {
        let store = self.store;
        self.slots.iter().enumerate().filter_map(move |(i, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    ObjectId {
                        store,
                        index: u32::try_from(i).unwrap_or(u32::MAX),
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Evict everything.
    pub(crate) fn clear(&mut self) {
        for id in self.ids() {
            self.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_after_remove() {
        let mut arena = Arena::new(StoreId::next());
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));
        let b = arena.insert("b");
        // Slot reused, generation bumped.
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_handles_do_not_cross_arenas() {
        let mut one = Arena::new(StoreId::next());
        let mut two = Arena::new(StoreId::next());
        let a = one.insert(1);
        let b = two.insert(2);
        assert!(two.get(a).is_none());
        assert!(one.get(b).is_none());
        assert_ne!(a.store(), b.store());
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let mut arena = Arena::new(StoreId::next());
        let ids: Vec<_> = (0..3).map(|i| arena.insert(i)).collect();
        arena.clear();
        assert_eq!(arena.len(), 0);
        assert!(ids.iter().all(|id| !arena.contains(*id)));
        let iter_order: Vec<_> = {
            let x = arena.insert(7);
            let y = arena.insert(8);
            vec![x, y]
        };
        assert_eq!(arena.ids().len(), 2);
        assert!(iter_order.iter().all(|id| arena.contains(*id)));
    }
}
