//! Native id bookkeeping.
//!
//! The kernel hands out small dense integer ids and reuses the lowest free one after a
//! delete. `IdMap` stores objects by native id and stamps each slot with a generation
//! that advances on removal, so a stale [`GeometryId`]/[`InstanceId`] from before a
//! remove/add cycle never resolves to the newcomer that inherited its native id.

use crate::native::INVALID_ID;

macro_rules! native_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            raw: u32,
            generation: u32,
        }

        impl $name {
            pub(crate) fn new(raw: u32, generation: u32) -> Self {
                Self { raw, generation }
            }

            /// The id assigned by the native kernel.
            pub fn raw(self) -> u32 {
                self.raw
            }

            pub fn generation(self) -> u32 {
                self.generation
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({}#{})", stringify!($name), self.raw, self.generation)
            }
        }
    };
}

native_id!(
    /// Handle to a mesh inside a [`Geometry`](crate::Geometry)
    GeometryId
);
native_id!(
    /// Handle to an instance inside a [`Scene`](crate::Scene)
    InstanceId
);

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational map keyed by native ids.
#[derive(Debug)]
pub(crate) struct IdMap<T> {
    slots: Vec<Slot<T>>,
    len: usize,
}

impl<T> Default for IdMap<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
        }
    }
}

impl<T> IdMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under the native id `raw` and returns the slot's generation.
    ///
    /// Hands `value` back if `raw` is the invalid sentinel or already occupied; the
    /// kernel issuing a live id twice means the bookkeeping is out of sync.
    pub fn insert_at(&mut self, raw: u32, value: T) -> Result<u32, T> {
        if raw == INVALID_ID {
            return Err(value);
        }
        let index = raw as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || Slot {
                generation: 0,
                value: None,
            });
        }

        let slot = &mut self.slots[index];
        if slot.value.is_some() {
            return Err(value);
        }
        slot.value = Some(value);
        self.len += 1;
        Ok(slot.generation)
    }

    pub fn get(&self, raw: u32, generation: u32) -> Option<&T> {
        self.slots
            .get(raw as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Current generation of an occupied slot.
    pub fn generation(&self, raw: u32) -> Option<u32> {
        self.slots
            .get(raw as usize)
            .filter(|slot| slot.value.is_some())
            .map(|slot| slot.generation)
    }

    pub fn remove(&mut self, raw: u32, generation: u32) -> Option<T> {
        let slot = self.slots.get_mut(raw as usize)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Occupied slots as `(raw, generation, value)` in native id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (index as u32, slot.generation, value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, u32, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|value| (index as u32, generation, value))
        })
    }
}
