// File: src/table.rs
//
// Hand-rolled open-addressed hash table, used for the VM's global variable
// table, every class's method table, every instance's field table, and the
// backing store of dict values. Keys are interned strings (`Rc<str>`), so
// two equal keys are always the same allocation; entries use tombstone
// deletion so probe chains stay intact after a remove.

use std::fmt;
use std::rc::Rc;

use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;

#[derive(Clone)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(Rc<str>, Value),
}

pub struct Table {
    entries: Vec<Slot>,
    count: usize, // occupied + tombstones
    len: usize,   // occupied only
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("len", &self.len).finish()
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.find_slot(key);
        match &self.entries[index] {
            Slot::Occupied(_, value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Inserts or overwrites `key`. Returns `true` if this created a brand
    /// new entry (matching `tableSet`'s return value, used by `OP_SET_GLOBAL`
    /// to detect assignment to an undeclared global).
    pub fn set(&mut self, key: Rc<str>, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD_FACTOR {
            self.grow();
        }

        let index = self.find_slot(&key);
        let is_new = !matches!(self.entries[index], Slot::Occupied(..));
        let was_tombstone = matches!(self.entries[index], Slot::Tombstone);
        self.entries[index] = Slot::Occupied(key, value);
        if is_new {
            self.len += 1;
            if !was_tombstone {
                self.count += 1;
            }
        }
        is_new
    }

    pub fn delete(&mut self, key: &str) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = self.find_slot(key);
        if matches!(self.entries[index], Slot::Occupied(..)) {
            self.entries[index] = Slot::Tombstone;
            self.len -= 1;
            true
        } else {
            false
        }
    }

    pub fn add_all_from(&mut self, other: &Table) {
        for slot in &other.entries {
            if let Slot::Occupied(key, value) = slot {
                self.set(Rc::clone(key), value.clone());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &Value)> {
        self.entries.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((k, v)),
            _ => None,
        })
    }

    /// Linear probe starting at `hash(key) % capacity`, stopping at the
    /// first empty slot, the first matching key, or wrapping through a
    /// tombstone (which is remembered and reused if the key is absent).
    fn find_slot(&self, key: &str) -> usize {
        let capacity = self.entries.len();
        let mut index = fnv1a(key) as usize % capacity;
        let mut tombstone: Option<usize> = None;

        loop {
            match &self.entries[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) if k.as_ref() == key => return index,
                Slot::Occupied(..) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
        let old_entries = std::mem::replace(&mut self.entries, vec_empty(new_capacity));
        self.count = 0;
        self.len = 0;
        for slot in old_entries {
            if let Slot::Occupied(key, value) = slot {
                self.set(key, value);
            }
        }
    }
}

fn vec_empty(capacity: usize) -> Vec<Slot> {
    std::iter::repeat_with(|| Slot::Empty).take(capacity).collect()
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}: {v}")?;
        }
        write!(f, "}}")
    }
}

/// FNV-1a, 64-bit. Matches the hash family the teacher's stack otherwise
/// reaches for a crate to provide (`ahash`); this table hand-rolls it
/// because the keys are always short interned strings and the table needs
/// to control its own probing, not delegate to a `HashMap`.
fn fnv1a(bytes: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for byte in bytes.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Deduplicating string interner, backed by the same open-addressed `Table`
/// as globals/methods/fields/dicts (matching `vm.c`'s `vm.strings`, which is
/// an ordinary `Table` with its values unused). The canonical `Rc<str>` for
/// each interned text lives in the stored value, so a successful lookup
/// returns the same allocation every prior `intern` call returned, and
/// `Value::String` equality can be a pointer comparison everywhere else in
/// the VM.
#[derive(Default)]
pub struct StringInterner {
    table: Table,
}

impl StringInterner {
    pub fn new() -> Self {
        StringInterner { table: Table::new() }
    }

    pub fn intern(&mut self, text: &str) -> Rc<str> {
        if let Some(Value::String(existing)) = self.table.get(text) {
            return existing;
        }
        let rc: Rc<str> = Rc::from(text);
        self.table.set(Rc::clone(&rc), Value::String(Rc::clone(&rc)));
        rc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Rc<str> {
        Rc::from(s)
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut table = Table::new();
        table.set(key("a"), Value::Number(1.0));
        assert_eq!(table.get("a"), Some(Value::Number(1.0)));
        assert_eq!(table.get("missing"), None);
    }

    #[test]
    fn set_reports_whether_key_was_new() {
        let mut table = Table::new();
        assert!(table.set(key("a"), Value::Number(1.0)));
        assert!(!table.set(key("a"), Value::Number(2.0)));
        assert_eq!(table.get("a"), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_then_reinsert_reuses_tombstone_slot() {
        let mut table = Table::new();
        table.set(key("a"), Value::Number(1.0));
        table.set(key("b"), Value::Number(2.0));
        assert!(table.delete("a"));
        assert!(!table.delete("a"));
        assert_eq!(table.get("a"), None);
        assert_eq!(table.get("b"), Some(Value::Number(2.0)));
        table.set(key("a"), Value::Number(3.0));
        assert_eq!(table.get("a"), Some(Value::Number(3.0)));
    }

    #[test]
    fn grows_past_load_factor_and_keeps_all_entries() {
        let mut table = Table::new();
        for i in 0..100 {
            table.set(Rc::from(format!("k{i}").as_str()), Value::Number(i as f64));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            assert_eq!(table.get(&format!("k{i}")), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn interner_returns_identical_allocation_for_equal_content() {
        let mut interner = StringInterner::new();
        let a = interner.intern("hello");
        let b = interner.intern("hello");
        assert!(Rc::ptr_eq(&a, &b));
    }
}
