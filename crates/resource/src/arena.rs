//! Slot arena behind the resource manager

use runtime_core::ResourceClass;

use crate::handle::HandleState;

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub label: String,
    pub class: ResourceClass,
    pub size_bytes: u64,
    /// Allocation order, used to release handles oldest first
    pub serial: u64,
    pub readers: u32,
    pub writing: bool,
}

impl Entry {
    pub fn state(&self) -> HandleState {
        if self.readers == 0 && !self.writing {
            HandleState::Allocated
        } else {
            HandleState::InFlight {
                readers: self.readers,
                writing: self.writing,
            }
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Why a lookup found no live entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Miss {
    /// The slot was freed (and possibly reused) since the handle was issued
    Stale,
    /// No handle with this index was ever issued
    NeverIssued,
}

/// Generation-tagged slots with a LIFO free list
#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    bytes: u64,
    next_serial: u64,
}

impl Arena {
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Store `entry` and return its `(index, generation)`
    pub fn insert(&mut self, mut entry: Entry) -> (u32, u32) {
        entry.serial = self.next_serial;
        self.next_serial += 1;
        self.live += 1;
        self.bytes += entry.size_bytes;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return (index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        (index, 0)
    }

    pub fn get(&self, index: u32, generation: u32) -> Result<&Entry, Miss> {
        let slot = self.slots.get(index as usize).ok_or(Miss::NeverIssued)?;
        match &slot.entry {
            Some(entry) if slot.generation == generation => Ok(entry),
            _ => Err(Miss::Stale),
        }
    }

    pub fn get_mut(&mut self, index: u32, generation: u32) -> Result<&mut Entry, Miss> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(Miss::NeverIssued)?;
        if slot.generation != generation {
            return Err(Miss::Stale);
        }
        slot.entry.as_mut().ok_or(Miss::Stale)
    }

    /// Vacate a slot and bump its generation
    pub fn remove(&mut self, index: u32, generation: u32) -> Result<Entry, Miss> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(Miss::NeverIssued)?;
        if slot.generation != generation || slot.entry.is_none() {
            return Err(Miss::Stale);
        }
        let entry = slot.entry.take().ok_or(Miss::Stale)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
        self.bytes -= entry.size_bytes;
        Ok(entry)
    }

    /// Live `(index, generation, entry)` triples, oldest allocation first
    pub fn live_entries(&self) -> Vec<(u32, u32, &Entry)> {
        let mut live: Vec<(u32, u32, &Entry)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.entry.as_ref().map(|e| (i as u32, slot.generation, e)))
            .collect();
        live.sort_by_key(|(_, _, e)| e.serial);
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: &str, size: u64) -> Entry {
        Entry {
            label: label.to_string(),
            class: ResourceClass::Buffer,
            size_bytes: size,
            serial: 0,
            readers: 0,
            writing: false,
        }
    }

    #[test]
    fn test_reuse_bumps_generation() {
        let mut arena = Arena::default();
        let (i0, g0) = arena.insert(entry("a", 10));
        arena.remove(i0, g0).unwrap();

        let (i1, g1) = arena.insert(entry("b", 20));
        assert_eq!(i0, i1);
        assert_ne!(g0, g1);
        assert_eq!(arena.get(i0, g0).unwrap_err(), Miss::Stale);
        assert_eq!(arena.get(i1, g1).unwrap().label, "b");
    }

    #[test]
    fn test_accounting() {
        let mut arena = Arena::default();
        let (a, ga) = arena.insert(entry("a", 10));
        arena.insert(entry("b", 5));
        assert_eq!(arena.live(), 2);
        assert_eq!(arena.bytes(), 15);

        arena.remove(a, ga).unwrap();
        assert_eq!(arena.live(), 1);
        assert_eq!(arena.bytes(), 5);
        assert_eq!(arena.remove(a, ga).unwrap_err(), Miss::Stale);
        assert_eq!(arena.get(99, 0).unwrap_err(), Miss::NeverIssued);
    }

    #[test]
    fn test_live_entries_in_allocation_order() {
        let mut arena = Arena::default();
        let (a, ga) = arena.insert(entry("a", 1));
        arena.insert(entry("b", 1));
        arena.remove(a, ga).unwrap();
        arena.insert(entry("c", 1));

        let labels: Vec<&str> = arena
            .live_entries()
            .iter()
            .map(|(_, _, e)| e.label.as_str())
            .collect();
        assert_eq!(labels, vec!["b", "c"]);
    }
}
