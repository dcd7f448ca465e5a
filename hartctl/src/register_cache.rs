use std::collections::HashMap;

use crate::registers::RegisterId;

/// Shadow copies of hart registers.
///
/// An entry is either clean (matches the hart) or dirty (written by the
/// debugger, not yet committed to the hart).
#[derive(Debug, Default)]
pub struct RegisterCache {
    entries: HashMap<RegisterId, CacheEntry>,
}

impl RegisterCache {
    pub fn new() -> Self {
        RegisterCache {
            entries: HashMap::new(),
        }
    }

    /// Stores a value which was read from the hart.
    pub fn store(&mut self, register: RegisterId, value: u64) {
        self.entries.insert(
            register,
            CacheEntry {
                value,
                dirty: false,
            },
        );
    }

    /// Stores a value which still has to be written to the hart.
    pub fn store_dirty(&mut self, register: RegisterId, value: u64) {
        self.entries
            .insert(register, CacheEntry { value, dirty: true });
    }

    pub fn value_of(&self, register: RegisterId) -> Option<u64> {
        self.entries.get(&register).map(|entry| entry.value)
    }

    /// The registers which have to be written back, in register order.
    pub fn dirty_entries(&self) -> Vec<(RegisterId, u64)> {
        let mut dirty: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(register, entry)| (*register, entry.value))
            .collect();
        dirty.sort_by_key(|(register, _)| *register);
        dirty
    }

    pub fn is_dirty(&self) -> bool {
        self.entries.values().any(|entry| entry.dirty)
    }

    pub(crate) fn mark_clean(&mut self, register: RegisterId) {
        if let Some(entry) = self.entries.get_mut(&register) {
            entry.dirty = false;
        }
    }

    pub(crate) fn remove(&mut self, register: RegisterId) {
        self.entries.remove(&register);
    }

    /// Drops every entry, dirty ones included.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, PartialEq, Eq)]
struct CacheEntry {
    value: u64,
    dirty: bool,
}
