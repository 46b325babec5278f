//! Generational arena mapping opaque handle values onto sessions and objects.
//!
//! A handle packs a slot index and the generation of that slot. Releasing a
//! referent bumps the generation, so any copy of the old handle stops
//! resolving even after the slot is reused. Slot indices are scrambled with a
//! per-table mask so raw values do not reveal allocation order.

use rand::{RngCore, rngs::OsRng};

/// Opaque identifier handed to callers. The zero value is never issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    fn compose(index: u32, generation: u32, mask: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(index ^ mask))
    }

    fn split(self, mask: u32) -> (usize, u32) {
        let index = (self.0 as u32) ^ mask;
        let generation = (self.0 >> 32) as u32;
        (index as usize, generation)
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub struct HandleTable<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    live: usize,
    capacity: usize,
    mask: u32,
}

impl<T> HandleTable<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
            capacity: capacity.min(u32::MAX as usize),
            mask: OsRng.next_u32(),
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns `None` once the table holds `capacity` live referents.
    pub fn insert(&mut self, value: T) -> Option<Handle> {
        if self.live >= self.capacity {
            return None;
        }
        let (index, generation) = match self.free.pop() {
            Some(index) => {
                let generation = match self.entries[index as usize] {
                    Entry::Vacant { generation } => generation,
                    Entry::Occupied { .. } => return None,
                };
                self.entries[index as usize] = Entry::Occupied { generation, value };
                (index, generation)
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry::Occupied {
                    generation: 1,
                    value,
                });
                (index, 1)
            }
        };
        self.live += 1;
        Some(Handle::compose(index, generation, self.mask))
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let (index, generation) = handle.split(self.mask);
        match self.entries.get(index) {
            Some(Entry::Occupied {
                generation: current,
                value,
            }) if *current == generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let (index, generation) = handle.split(self.mask);
        match self.entries.get_mut(index) {
            Some(Entry::Occupied {
                generation: current,
                value,
            }) if *current == generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let (index, generation) = handle.split(self.mask);
        match self.entries.get(index) {
            Some(Entry::Occupied {
                generation: current,
                ..
            }) if *current == generation => {}
            _ => return None,
        }
        let next = match generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        let previous = std::mem::replace(&mut self.entries[index], Entry::Vacant { generation: next });
        self.free.push(index as u32);
        self.live -= 1;
        match previous {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    /// Remove every referent matching `predicate`, returning them with their
    /// former handles.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<(Handle, T)>
    where
        F: FnMut(&T) -> bool,
    {
        let doomed: Vec<Handle> = self
            .iter()
            .filter(|(_, value)| predicate(value))
            .map(|(handle, _)| handle)
            .collect();
        doomed
            .into_iter()
            .filter_map(|handle| self.remove(handle).map(|value| (handle, value)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        let mask = self.mask;
        self.entries
            .iter()
            .enumerate()
            .filter_map(move |(index, entry)| match entry {
                Entry::Occupied { generation, value } => {
                    Some((Handle::compose(index as u32, *generation, mask), value))
                }
                Entry::Vacant { .. } => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_stops_resolving_after_reuse() {
        let mut table = HandleTable::new(8);
        let first = table.insert("first").expect("insert");
        assert_eq!(table.remove(first), Some("first"));

        let second = table.insert("second").expect("insert");
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert_eq!(table.get(second), Some(&"second"));
        assert!(table.remove(first).is_none());
    }

    #[test]
    fn zero_is_never_issued() {
        let mut table = HandleTable::new(4);
        for value in 0..4 {
            let handle = table.insert(value).expect("insert");
            assert_ne!(handle, Handle::INVALID);
        }
        assert!(table.get(Handle::INVALID).is_none());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = HandleTable::new(2);
        let a = table.insert(1).expect("insert");
        table.insert(2).expect("insert");
        assert!(table.insert(3).is_none());
        table.remove(a);
        assert!(table.insert(3).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn remove_where_returns_former_handles() {
        let mut table = HandleTable::new(16);
        let handles: Vec<Handle> = (0..6).map(|v| table.insert(v).expect("insert")).collect();
        let removed = table.remove_where(|v| v % 2 == 0);
        assert_eq!(removed.len(), 3);
        for (handle, value) in removed {
            assert_eq!(handles[value as usize], handle);
            assert!(!table.contains(handle));
        }
        assert_eq!(table.len(), 3);
    }
}
