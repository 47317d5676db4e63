//! Generation-checked storage for live relays.
//!
//! A [`RelayId`] stays valid only while the slot it names holds the same
//! generation. Once a relay is removed its id goes stale, so events that
//! arrive late for a destroyed relay find nothing instead of a reused slot.

use std::fmt;

/// Handle to a relay stored in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayId {
    index: u32,
    generation: u32,
}

impl RelayId {
    /// Slot index inside the arena
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this id was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slab of values addressed by generation-checked ids.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    /// Create an empty arena
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no live values
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a value built from its own id
    pub fn insert_with(&mut self, build: impl FnOnce(RelayId) -> T) -> RelayId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        let id = RelayId {
            index,
            generation: slot.generation,
        };
        slot.value = Some(build(id));
        self.len += 1;
        id
    }

    /// Store a value
    pub fn insert(&mut self, value: T) -> RelayId {
        self.insert_with(|_| value)
    }

    /// Look up a live value
    pub fn get(&self, id: RelayId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Look up a live value mutably
    pub fn get_mut(&mut self, id: RelayId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Whether the id still names a live value
    pub fn contains(&self, id: RelayId) -> bool {
        self.get(id).is_some()
    }

    /// Move a value out, invalidating its id
    pub fn remove(&mut self, id: RelayId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Ids of all live values, in slot order
    pub fn ids(&self) -> Vec<RelayId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| RelayId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len)
            .field("slots", &self.slots.len())
            .finish()
    }
}
