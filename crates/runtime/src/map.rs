//! Value-keyed map and set
//!
//! `ValueMap` is a Robin-Hood hash table: each slot records its probe
//! sequence length (psl), and an inserted entry displaces an incumbent
//! whose psl is shorter, keeping probe chains short and fair. Deletion
//! shifts the following chain backwards, so the map needs no tombstones.
//!
//! `ValueSet` shares the storage shape minus the values and psl; it uses
//! plain linear probing with a per-slot deleted flag.
//!
//! Valid keys are strings and finite numbers. Key validation happens at
//! the VM boundary; these structures assume valid keys.

use crate::value::Value;

const MAP_MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy, Debug)]
struct MapEntry {
    /// `Value::EMPTY` marks a vacant slot.
    key: Value,
    value: Value,
    psl: u32,
}

impl MapEntry {
    fn vacant() -> MapEntry {
        MapEntry {
            key: Value::EMPTY,
            value: Value::NULL,
            psl: 0,
        }
    }

    fn is_vacant(&self) -> bool {
        self.key.is_empty()
    }
}

#[derive(Default, Debug)]
pub struct ValueMap {
    count: usize,
    entries: Vec<MapEntry>,
}

impl ValueMap {
    pub fn new() -> ValueMap {
        ValueMap::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![MapEntry::vacant(); capacity]);
        self.count = 0;
        for entry in old {
            if !entry.is_vacant() {
                self.set(entry.key, entry.value);
            }
        }
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = key.key_hash() as usize & mask;
        let mut psl = 0u32;

        loop {
            let entry = &self.entries[index];
            if entry.is_vacant() {
                return None;
            }
            if entry.key.equals(key) {
                return Some(entry.value);
            }
            // An incumbent closer to home than we are means the key
            // cannot be further along the chain.
            if entry.psl < psl {
                return None;
            }
            index = (index + 1) & mask;
            psl += 1;
        }
    }

    pub fn has_key(&self, key: Value) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite; returns true when the key was new.
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * MAP_MAX_LOAD {
            self.grow();
        }

        let mask = self.entries.len() - 1;
        let mut index = key.key_hash() as usize & mask;
        let mut carry = MapEntry { key, value, psl: 0 };

        loop {
            let entry = &mut self.entries[index];
            if entry.is_vacant() {
                *entry = carry;
                self.count += 1;
                return true;
            }
            // An existing key is always met before any displacement can
            // happen, so this branch only ever sees the original key.
            if entry.key.equals(carry.key) {
                entry.value = carry.value;
                return false;
            }
            // Robin Hood: the richer entry (shorter psl) yields its slot.
            if entry.psl < carry.psl {
                std::mem::swap(entry, &mut carry);
            }
            index = (index + 1) & mask;
            carry.psl += 1;
        }
    }

    /// Backward-shift deletion keeps chains dense without tombstones.
    pub fn delete(&mut self, key: Value) -> bool {
        if self.count == 0 {
            return false;
        }
        let mask = self.entries.len() - 1;
        let mut index = key.key_hash() as usize & mask;
        let mut psl = 0u32;

        loop {
            let entry = &self.entries[index];
            if entry.is_vacant() || entry.psl < psl {
                return false;
            }
            if entry.key.equals(key) {
                break;
            }
            index = (index + 1) & mask;
            psl += 1;
        }

        self.entries[index] = MapEntry::vacant();
        self.count -= 1;

        // Shift the rest of the chain back one slot.
        let mut prev = index;
        let mut next = (index + 1) & mask;
        loop {
            let entry = self.entries[next];
            if entry.is_vacant() || entry.psl == 0 {
                break;
            }
            self.entries[prev] = MapEntry {
                key: entry.key,
                value: entry.value,
                psl: entry.psl - 1,
            };
            self.entries[next] = MapEntry::vacant();
            prev = next;
            next = (next + 1) & mask;
        }
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.is_vacant())
            .map(|e| (e.key, e.value))
    }

    pub fn bytes(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<MapEntry>()
    }
}

#[derive(Clone, Copy, Debug)]
struct SetEntry {
    /// `Value::EMPTY` marks a never-used slot.
    value: Value,
    deleted: bool,
}

impl SetEntry {
    fn vacant() -> SetEntry {
        SetEntry {
            value: Value::EMPTY,
            deleted: false,
        }
    }

    fn is_vacant(&self) -> bool {
        self.value.is_empty() && !self.deleted
    }

    fn is_live(&self) -> bool {
        !self.value.is_empty() && !self.deleted
    }
}

#[derive(Default, Debug)]
pub struct ValueSet {
    count: usize,
    entries: Vec<SetEntry>,
}

impl ValueSet {
    pub fn new() -> ValueSet {
        ValueSet::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![SetEntry::vacant(); capacity]);
        self.count = 0;
        for entry in old {
            if entry.is_live() {
                self.add(entry.value);
            }
        }
    }

    /// Returns true when the value was not already present.
    pub fn add(&mut self, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * MAP_MAX_LOAD {
            self.grow();
        }

        let mask = self.entries.len() - 1;
        let mut index = value.key_hash() as usize & mask;
        let mut reuse: Option<usize> = None;

        loop {
            let entry = &self.entries[index];
            if entry.is_vacant() {
                let slot = reuse.unwrap_or(index);
                self.entries[slot] = SetEntry {
                    value,
                    deleted: false,
                };
                self.count += 1;
                return true;
            }
            if entry.deleted {
                if reuse.is_none() {
                    reuse = Some(index);
                }
            } else if entry.value.equals(value) {
                return false;
            }
            index = (index + 1) & mask;
        }
    }

    pub fn contains(&self, value: Value) -> bool {
        if self.count == 0 {
            return false;
        }
        let mask = self.entries.len() - 1;
        let mut index = value.key_hash() as usize & mask;

        loop {
            let entry = &self.entries[index];
            if entry.is_vacant() {
                return false;
            }
            if !entry.deleted && entry.value.equals(value) {
                return true;
            }
            index = (index + 1) & mask;
        }
    }

    pub fn delete(&mut self, value: Value) -> bool {
        if self.count == 0 {
            return false;
        }
        let mask = self.entries.len() - 1;
        let mut index = value.key_hash() as usize & mask;

        loop {
            let entry = &mut self.entries[index];
            if entry.is_vacant() {
                return false;
            }
            if !entry.deleted && entry.value.equals(value) {
                entry.deleted = true;
                self.count -= 1;
                return true;
            }
            index = (index + 1) & mask;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries.iter().filter(|e| e.is_live()).map(|e| e.value)
    }

    pub fn bytes(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<SetEntry>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::number(n)
    }

    #[test]
    fn map_set_get() {
        let mut map = ValueMap::new();
        assert!(map.set(num(1.0), num(10.0)));
        assert!(map.set(num(2.0), num(20.0)));
        assert!(!map.set(num(1.0), num(11.0)));

        assert_eq!(map.get(num(1.0)), Some(num(11.0)));
        assert_eq!(map.get(num(2.0)), Some(num(20.0)));
        assert_eq!(map.get(num(3.0)), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn map_delete_backward_shifts() {
        let mut map = ValueMap::new();
        for i in 0..64 {
            map.set(num(i as f64), num((i * 2) as f64));
        }
        for i in (0..64).step_by(2) {
            assert!(map.delete(num(i as f64)), "delete {i}");
        }
        assert_eq!(map.len(), 32);
        for i in 0..64 {
            let expected = if i % 2 == 0 {
                None
            } else {
                Some(num((i * 2) as f64))
            };
            assert_eq!(map.get(num(i as f64)), expected, "key {i}");
        }
    }

    #[test]
    fn map_delete_missing_is_false() {
        let mut map = ValueMap::new();
        map.set(num(1.0), num(1.0));
        assert!(!map.delete(num(9.0)));
    }

    #[test]
    fn map_psl_invariant_holds_after_churn() {
        let mut map = ValueMap::new();
        for i in 0..256 {
            map.set(num(i as f64), num(i as f64));
        }
        for i in 0..128 {
            map.delete(num(i as f64));
        }
        for i in 256..384 {
            map.set(num(i as f64), num(i as f64));
        }

        // Every entry's recorded psl matches its actual displacement.
        let mask = map.entries.len() - 1;
        for (slot, entry) in map.entries.iter().enumerate() {
            if entry.is_vacant() {
                continue;
            }
            let home = entry.key.key_hash() as usize & mask;
            let displacement = (slot + map.entries.len() - home) & mask;
            assert_eq!(displacement as u32, entry.psl);
        }
    }

    #[test]
    fn map_clear() {
        let mut map = ValueMap::new();
        map.set(num(1.0), num(1.0));
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.get(num(1.0)), None);
    }

    #[test]
    fn set_add_contains_delete() {
        let mut set = ValueSet::new();
        assert!(set.add(num(1.0)));
        assert!(!set.add(num(1.0)));
        assert!(set.contains(num(1.0)));
        assert!(!set.contains(num(2.0)));

        assert!(set.delete(num(1.0)));
        assert!(!set.contains(num(1.0)));
        assert!(!set.delete(num(1.0)));
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn set_reuses_deleted_slots() {
        let mut set = ValueSet::new();
        for i in 0..32 {
            set.add(num(i as f64));
        }
        for i in 0..32 {
            set.delete(num(i as f64));
        }
        for i in 0..32 {
            assert!(set.add(num(i as f64)), "re-add {i}");
        }
        assert_eq!(set.len(), 32);
    }
}
