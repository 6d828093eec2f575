/// `FlatStorage` is a slab: each inserted element gets a `usize` slot that stays valid until it is removed.
/// Freed slots are recycled through an intrusive free list, so slot numbers stay small and dense.
/// Selector loops use it for connections and deferred tasks; the slot becomes the poller key.
pub struct FlatStorage<T> {
    slots: Vec<Slot<T>>,
    count: usize,
    free: usize,
}

const NO_SLOT: usize = usize::MAX;

enum Slot<T> {
    Vacant(usize), // next free slot
    Occupied(T),
}

impl<T> Default for FlatStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FlatStorage<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            count: 0,
            free: NO_SLOT,
        }
    }
    pub fn len(&self) -> usize {
        self.count
    }
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Slot the next `add` will use.
    pub fn next_slot(&self) -> usize {
        if self.free == NO_SLOT {
            self.slots.len()
        } else {
            self.free
        }
    }

    /// return the slot assigned to the new element.
    pub fn add(&mut self, val: T) -> usize {
        self.count += 1;
        if self.free == NO_SLOT {
            self.slots.push(Slot::Occupied(val));
            return self.slots.len() - 1;
        }
        let slot = self.free;
        let prev = std::mem::replace(&mut self.slots[slot], Slot::Occupied(val));
        match prev {
            Slot::Vacant(next) => self.free = next,
            Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
        }
        slot
    }

    pub fn remove(&mut self, slot: usize) -> Option<T> {
        match self.slots.get(slot) {
            Some(Slot::Occupied(_)) => {}
            _ => return None,
        }
        let prev = std::mem::replace(&mut self.slots[slot], Slot::Vacant(self.free));
        self.free = slot;
        self.count -= 1;
        match prev {
            Slot::Occupied(val) => Some(val),
            Slot::Vacant(_) => None,
        }
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        match self.slots.get(slot) {
            Some(Slot::Occupied(val)) => Some(val),
            _ => None,
        }
    }
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        match self.slots.get_mut(slot) {
            Some(Slot::Occupied(val)) => Some(val),
            _ => None,
        }
    }

    /// Occupied slots in slot order.
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied(_) => Some(i),
            Slot::Vacant(_) => None,
        })
    }

    /// Remove every element, returning them in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        let slots = std::mem::take(&mut self.slots);
        self.count = 0;
        self.free = NO_SLOT;
        slots
            .into_iter()
            .filter_map(|s| match s {
                Slot::Occupied(val) => Some(val),
                Slot::Vacant(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    pub fn test_flat_storage_reuses_slots() {
        let mut storage = FlatStorage::new();
        let a = storage.add("a");
        let b = storage.add("b");
        let c = storage.add("c");
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(storage.remove(b), Some("b"));
        assert_eq!(storage.remove(b), None);
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.next_slot(), b);
        assert_eq!(storage.add("d"), b);
        assert_eq!(storage.get(b), Some(&"d"));
        assert_eq!(storage.slots().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    pub fn test_flat_storage_drain() {
        let mut storage = FlatStorage::new();
        storage.add(1);
        let two = storage.add(2);
        storage.add(3);
        storage.remove(two);
        if let Some(v) = storage.get_mut(0) {
            *v = 10;
        }
        assert_eq!(storage.drain(), vec![10, 3]);
        assert!(storage.is_empty());
        assert_eq!(storage.add(4), 0);
    }
}
