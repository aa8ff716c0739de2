//! String-keyed hash table
//!
//! Open addressing with linear probing. Capacities are powers of two so
//! probing is `hash & (capacity - 1)`; the load factor is 0.75. Deleted
//! entries become tombstones (no key, value `true`) so probe chains stay
//! intact; empty slots carry no key and value `null`.
//!
//! Keys are interned strings, so key comparison is pointer comparison.
//! Entries carry a read-only flag; overwriting a read-only entry is
//! refused and surfaces as a runtime error at the call site.

use crate::object::{Gc, ObjString};
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
pub struct Entry {
    pub key: Option<Gc<ObjString>>,
    pub value: Value,
    pub read_only: bool,
}

impl Entry {
    fn vacant() -> Entry {
        Entry {
            key: None,
            value: Value::NULL,
            read_only: false,
        }
    }

    #[cfg(test)]
    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !self.value.is_null()
    }
}

/// Overwrite of a read-only entry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOnlyEntry;

#[derive(Default)]
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn len(&self) -> usize {
        // count includes tombstones; expose live entries
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry(entries: &[Entry], key: Gc<ObjString>) -> usize {
        let mask = entries.len() - 1;
        let mut index = key.hash as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.value.is_null() {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(existing) if existing == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::vacant(); capacity];

        self.count = 0;
        for entry in &self.entries {
            let Some(key) = entry.key else { continue };
            let dest = Self::find_entry(&entries, key);
            entries[dest] = *entry;
            self.count += 1;
        }

        self.entries = entries;
    }

    pub fn get(&self, key: Gc<ObjString>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Insert or overwrite. Returns whether the key was new; refuses to
    /// touch an entry whose read-only flag is set.
    pub fn set(
        &mut self,
        key: Gc<ObjString>,
        value: Value,
        read_only: bool,
    ) -> Result<bool, ReadOnlyEntry> {
        if (self.count + 1) as f64 > self.capacity() as f64 * TABLE_MAX_LOAD {
            let capacity = if self.capacity() < 8 {
                8
            } else {
                self.capacity() * 2
            };
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new {
            if entry.value.is_null() {
                self.count += 1;
            }
        } else if entry.read_only {
            return Err(ReadOnlyEntry);
        }

        entry.key = Some(key);
        entry.value = value;
        entry.read_only = read_only;
        Ok(is_new)
    }

    /// Insert preserving each entry's flags, bypassing read-only checks.
    /// Used when cloning tables wholesale (class inheritance).
    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if let Some(key) = entry.key {
                // Existing read-only entries in `self` are not expected
                // here; destination tables are freshly created.
                let _ = self.set(key, entry.value, entry.read_only);
            }
        }
    }

    pub fn delete(&mut self, key: Gc<ObjString>) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::TRUE;
        entry.read_only = false;
        true
    }

    /// Content lookup used by the intern pool, before an `ObjString`
    /// exists for the bytes.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<Gc<ObjString>> {
        if self.count == 0 {
            return None;
        }

        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.value.is_null() {
                        return None;
                    }
                }
                Some(key) => {
                    if key.hash == hash && key.as_str() == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Drop entries whose keys were not marked; run between mark and
    /// sweep so the intern pool never holds freed strings.
    pub fn remove_white(&mut self) {
        let mut dead = Vec::new();
        for entry in &self.entries {
            if let Some(key) = entry.key {
                if !key.header.marked {
                    dead.push(key);
                }
            }
        }
        for key in dead {
            self.delete(key);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gc<ObjString>, Value, bool)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value, e.read_only)))
    }

    pub fn keys(&self) -> impl Iterator<Item = Gc<ObjString>> + '_ {
        self.entries.iter().filter_map(|e| e.key)
    }

    /// Shell bytes retained by the table, for GC accounting.
    pub fn bytes(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }

    #[cfg(test)]
    fn tombstones(&self) -> usize {
        self.entries.iter().filter(|e| e.is_tombstone()).count()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (k, v, _) in self.iter() {
            map.entry(&k.as_str(), &v);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn heap() -> Heap {
        Heap::new(false, false)
    }

    #[test]
    fn set_get_roundtrip() {
        let mut heap = heap();
        let mut table = Table::new();
        let key = heap.intern("alpha");

        assert_eq!(table.set(key, Value::number(1.0), false), Ok(true));
        assert_eq!(table.get(key), Some(Value::number(1.0)));
        assert_eq!(table.set(key, Value::number(2.0), false), Ok(false));
        assert_eq!(table.get(key), Some(Value::number(2.0)));
    }

    #[test]
    fn missing_key_is_none() {
        let mut heap = heap();
        let mut table = Table::new();
        let a = heap.intern("a");
        let b = heap.intern("b");
        table.set(a, Value::TRUE, false).unwrap();
        assert_eq!(table.get(b), None);
    }

    #[test]
    fn delete_leaves_a_tombstone() {
        let mut heap = heap();
        let mut table = Table::new();
        let key = heap.intern("gone");
        table.set(key, Value::TRUE, false).unwrap();

        assert!(table.delete(key));
        assert_eq!(table.get(key), None);
        assert_eq!(table.tombstones(), 1);
        assert!(!table.delete(key));
    }

    #[test]
    fn probing_survives_tombstones() {
        let mut heap = heap();
        let mut table = Table::new();
        let keys: Vec<_> = (0..32).map(|i| heap.intern(&format!("k{i}"))).collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(*key, Value::number(i as f64), false).unwrap();
        }
        for key in keys.iter().step_by(2) {
            table.delete(*key);
        }
        for (i, key) in keys.iter().enumerate() {
            let expected = if i % 2 == 0 {
                None
            } else {
                Some(Value::number(i as f64))
            };
            assert_eq!(table.get(*key), expected, "key k{i}");
        }
    }

    #[test]
    fn read_only_entries_refuse_overwrite() {
        let mut heap = heap();
        let mut table = Table::new();
        let key = heap.intern("const");
        table.set(key, Value::number(1.0), true).unwrap();
        assert_eq!(
            table.set(key, Value::number(2.0), false),
            Err(ReadOnlyEntry)
        );
        assert_eq!(table.get(key), Some(Value::number(1.0)));
    }

    #[test]
    fn find_string_matches_by_content() {
        let mut heap = heap();
        let mut table = Table::new();
        let key = heap.intern("needle");
        table.set(key, Value::NULL, false).unwrap();

        // count tracks slots in use, including null-valued entries
        let found = table.find_string("needle", key.hash);
        assert_eq!(found, Some(key));
        assert_eq!(table.find_string("missing", key.hash), None);
    }

    #[test]
    fn growth_preserves_entries() {
        let mut heap = heap();
        let mut table = Table::new();
        let keys: Vec<_> = (0..100).map(|i| heap.intern(&format!("g{i}"))).collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(*key, Value::number(i as f64), false).unwrap();
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.get(*key), Some(Value::number(i as f64)));
        }
        assert_eq!(table.len(), 100);
    }
}
