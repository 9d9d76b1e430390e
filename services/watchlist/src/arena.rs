//! Generational slot arena
//!
//! Streams, requests and timers live in arenas and refer to each other by
//! [`Handle`]. Slots come from a [`Slab`]; every insert stamps its entry with
//! a fresh generation, so a stale handle never aliases the slot's next
//! occupant.

use slab::Slab;

/// Index of a live arena slot plus the generation it was issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: T,
}

/// Slot arena with O(1) insert, remove and lookup.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Slab<Entry<T>>,
    next_generation: u32,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            next_generation: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            next_generation: 0,
        }
    }

    /// Make room for `additional` more slots.
    pub fn reserve(&mut self, additional: usize) {
        self.slots.reserve(additional);
    }

    pub fn insert(&mut self, value: T) -> Handle {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.slots.insert(Entry { generation, value });
        Handle {
            index: index as u32,
            generation,
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        self.slots
            .try_remove(handle.index())
            .map(|entry| entry.value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index())
            .filter(|entry| entry.generation == handle.generation)
            .map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index())
            .filter(|entry| entry.generation == handle.generation)
            .map(|entry| &mut entry.value)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Live values
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots that can be filled without reallocating.
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Handles of every live value, in slot order.
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().map(|(index, entry)| {
            (
                Handle {
                    index: index as u32,
                    generation: entry.generation,
                },
                &entry.value,
            )
        })
    }
}
