//! Fixed-capacity tables with generation-tagged identities
//!
//! An identity is `generation * stride + index`. The slot is recovered as
//! `id % capacity`; a lookup only succeeds when the full identity still
//! matches the one the slot last issued, so an identity held across a free
//! and reallocation of its slot no longer resolves.

/// A slot-indexed table that issues generation-tagged `u32` identities
#[derive(Debug, Clone)]
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    stride: u32,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    id: u32,
    value: Option<T>,
}

impl<T> SlotTable<T> {
    /// Creates an empty table
    ///
    /// `stride` is the distance between consecutive generations of one slot
    /// and must be a multiple of `capacity`. Slots are handed out lowest
    /// index first, then in LIFO order as they are released.
    pub fn new(capacity: usize, stride: u32) -> Self {
        debug_assert!(capacity > 0 && stride as usize % capacity == 0);
        Self {
            slots: (0..capacity)
                .map(|index| Slot {
                    id: index as u32,
                    value: None,
                })
                .collect(),
            free: (0..capacity).rev().collect(),
            stride,
        }
    }

    /// Creates a table whose every slot is populated up front
    ///
    /// Used by tables that decide liveness themselves and only need the
    /// identity bookkeeping (see [`SlotTable::reissue`]).
    pub fn filled<F>(capacity: usize, stride: u32, mut init: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        let mut table = Self::new(capacity, stride);
        for (index, slot) in table.slots.iter_mut().enumerate() {
            slot.value = Some(init(index));
        }
        table.free.clear();
        table
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot index named by an identity
    pub fn index_of(&self, id: u32) -> usize {
        id as usize % self.slots.len()
    }

    /// Identity currently issued for a slot
    pub fn id_at(&self, index: usize) -> u32 {
        self.slots[index].id
    }

    /// Advances the generation of a slot and returns its new identity
    ///
    /// Generations restart at 1 once the identity would no longer fit in a
    /// positive `i32`.
    pub fn reissue(&mut self, index: usize) -> u32 {
        let stride = u64::from(self.stride);
        let generation = u64::from(self.slots[index].id) / stride + 1;
        let mut id = generation * stride + index as u64;
        if id > i32::MAX as u64 {
            id = stride + index as u64;
        }
        self.slots[index].id = id as u32;
        self.slots[index].id
    }

    /// Takes a free slot, issues a fresh identity for it and stores the value
    /// built from that identity
    pub fn insert_with<F>(&mut self, build: F) -> Option<u32>
    where
        F: FnOnce(u32) -> T,
    {
        let index = self.free.pop()?;
        let id = self.reissue(index);
        self.slots[index].value = Some(build(id));
        Some(id)
    }

    /// Removes the value named by `id`, returning its slot to the free list
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let index = self.resolve(id)?;
        let value = self.slots[index].value.take();
        self.free.push(index);
        value
    }

    /// Resolves an identity to its slot index if it is live and current
    pub fn resolve(&self, id: u32) -> Option<usize> {
        let index = self.index_of(id);
        let slot = &self.slots[index];
        (slot.id == id && slot.value.is_some()).then_some(index)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.resolve(id).is_some()
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        let index = self.resolve(id)?;
        self.slots[index].value.as_ref()
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let index = self.resolve(id)?;
        self.slots[index].value.as_mut()
    }

    /// Value stored in a slot, regardless of identity
    pub fn at(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(|slot| slot.value.as_ref())
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(|slot| slot.value.as_mut())
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over occupied slots in index order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.slots
            .iter()
            .filter_map(|slot| slot.value.as_ref().map(|value| (slot.id, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_generation_ids() {
        let mut table: SlotTable<&str> = SlotTable::new(4, 4096);
        let a = table.insert_with(|_| "a").unwrap();
        let b = table.insert_with(|_| "b").unwrap();
        assert_eq!(a, 4096);
        assert_eq!(b, 4097);
        assert_eq!(table.index_of(b), 1);
        assert_eq!(table.get(a), Some(&"a"));
    }

    #[test]
    fn test_stale_id_does_not_resolve() {
        let mut table: SlotTable<u8> = SlotTable::new(4, 4096);
        let old = table.insert_with(|_| 1).unwrap();
        assert_eq!(table.remove(old), Some(1));
        assert!(table.get(old).is_none());

        let new = table.insert_with(|_| 2).unwrap();
        assert_eq!(table.index_of(new), table.index_of(old));
        assert_ne!(new, old);
        assert!(table.get(old).is_none());
        assert_eq!(table.get(new), Some(&2));
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut table: SlotTable<u8> = SlotTable::new(4, 4);
        let ids: Vec<u32> = (0..3).map(|i| table.insert_with(|_| i).unwrap()).collect();
        table.remove(ids[0]);
        table.remove(ids[2]);
        let next = table.insert_with(|_| 9).unwrap();
        assert_eq!(table.index_of(next), 2);
    }

    #[test]
    fn test_exhaustion() {
        let mut table: SlotTable<u8> = SlotTable::new(2, 2);
        assert!(table.insert_with(|_| 0).is_some());
        assert!(table.insert_with(|_| 1).is_some());
        assert!(table.insert_with(|_| 2).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_reissue_on_filled_table() {
        let mut table = SlotTable::filled(1024, 1024, |index| index);
        assert_eq!(table.id_at(5), 5);
        assert_eq!(table.reissue(5), 1029);
        assert_eq!(table.reissue(5), 2053);
        assert_eq!(table.resolve(2053), Some(5));
        assert_eq!(table.resolve(1029), None);
    }

    #[test]
    fn test_generation_wraps_to_one() {
        let mut table = SlotTable::filled(4, 4096, |_| ());
        let mut id = table.reissue(3);
        while id < i32::MAX as u32 - 4096 {
            id = table.reissue(3);
        }
        let wrapped = table.reissue(3);
        assert_eq!(wrapped, 4096 + 3);
    }
}
