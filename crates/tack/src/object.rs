//! Insertion-ordered objects.
//!
//! An object maps interned-string keys to values. Iteration visits keys in
//! insertion order; deleting a key leaves a tombstone so that iteration
//! cursors held by running `for` loops stay valid. The cursor protocol
//! (`first_slot` / `next_slot` / `end_slot`) is what the `ForIter*`
//! opcodes drive: a cursor is a plain slot index that skips dead slots.

use ahash::AHashMap;

use crate::{intern::StringId, value::Value};

/// One key-value slot. `None` is a tombstone left by a deletion.
type Slot = Option<(StringId, Value)>;

/// An insertion-ordered map from interned key to value.
#[derive(Debug, Default)]
pub struct ObjectData {
    slots: Vec<Slot>,
    index: AHashMap<StringId, u32>,
    live: u32,
}

impl ObjectData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries (tombstones excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.live as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Inserts or overwrites `key`. A fresh key appends a slot, preserving
    /// insertion order; an existing key is updated in place.
    pub fn set(&mut self, key: StringId, value: Value) {
        if let Some(&slot) = self.index.get(&key) {
            self.slots[slot as usize] = Some((key, value));
        } else {
            let slot = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
            self.slots.push(Some((key, value)));
            self.index.insert(key, slot);
            self.live += 1;
        }
    }

    #[must_use]
    pub fn get(&self, key: StringId) -> Option<Value> {
        let &slot = self.index.get(&key)?;
        self.slots[slot as usize].map(|(_, v)| v)
    }

    /// Removes `key`, leaving a tombstone in its slot. Returns the removed
    /// value, if the key was present.
    pub fn remove(&mut self, key: StringId) -> Option<Value> {
        let slot = self.index.remove(&key)?;
        let removed = self.slots[slot as usize].take();
        if removed.is_some() {
            self.live -= 1;
        }
        removed.map(|(_, v)| v)
    }

    /// Cursor to the first live slot.
    #[must_use]
    pub fn first_slot(&self) -> u32 {
        self.next_live(0)
    }

    /// Cursor past `slot`'s successor tombstones.
    #[must_use]
    pub fn next_slot(&self, slot: u32) -> u32 {
        self.next_live(slot + 1)
    }

    /// One past the last slot; the cursor end condition.
    #[must_use]
    pub fn end_slot(&self) -> u32 {
        self.slots.len() as u32
    }

    fn next_live(&self, mut slot: u32) -> u32 {
        while (slot as usize) < self.slots.len() && self.slots[slot as usize].is_none() {
            slot += 1;
        }
        slot
    }

    /// Key at a live cursor position.
    ///
    /// # Panics
    /// Panics if `slot` is out of range or a tombstone.
    #[must_use]
    pub fn key_at(&self, slot: u32) -> StringId {
        self.slots[slot as usize].expect("cursor on tombstone").0
    }

    /// Value at a live cursor position.
    ///
    /// # Panics
    /// Panics if `slot` is out of range or a tombstone.
    #[must_use]
    pub fn value_at(&self, slot: u32) -> Value {
        self.slots[slot as usize].expect("cursor on tombstone").1
    }

    /// Live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.slots.iter().flatten().copied()
    }

    /// Live values, for the GC mark phase.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots.iter().flatten().map(|&(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interns;

    fn keys(interns: &mut Interns, names: &[&str]) -> Vec<StringId> {
        names.iter().map(|n| interns.intern(n)).collect()
    }

    #[test]
    fn iteration_is_insertion_order() {
        let mut interns = Interns::new();
        let ks = keys(&mut interns, &["b", "a", "c"]);
        let mut obj = ObjectData::new();
        for (i, &k) in ks.iter().enumerate() {
            obj.set(k, Value::number(i as f64));
        }
        let seen: Vec<StringId> = obj.iter().map(|(k, _)| k).collect();
        assert_eq!(seen, ks);
    }

    #[test]
    fn overwrite_keeps_original_position() {
        let mut interns = Interns::new();
        let ks = keys(&mut interns, &["x", "y"]);
        let mut obj = ObjectData::new();
        obj.set(ks[0], Value::number(1.0));
        obj.set(ks[1], Value::number(2.0));
        obj.set(ks[0], Value::number(3.0));
        let seen: Vec<(StringId, Value)> = obj.iter().collect();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (ks[0], Value::number(3.0)));
        assert_eq!(obj.len(), 2);
    }

    #[test]
    fn tombstones_are_skipped_by_cursors() {
        let mut interns = Interns::new();
        let ks = keys(&mut interns, &["a", "b", "c"]);
        let mut obj = ObjectData::new();
        for &k in &ks {
            obj.set(k, Value::NULL);
        }
        assert_eq!(obj.remove(ks[1]), Some(Value::NULL));
        assert_eq!(obj.len(), 2);

        let mut cursor = obj.first_slot();
        let mut seen = Vec::new();
        while cursor != obj.end_slot() {
            seen.push(obj.key_at(cursor));
            cursor = obj.next_slot(cursor);
        }
        assert_eq!(seen, vec![ks[0], ks[2]]);
    }

    #[test]
    fn removed_key_reads_as_missing() {
        let mut interns = Interns::new();
        let k = interns.intern("gone");
        let mut obj = ObjectData::new();
        obj.set(k, Value::TRUE);
        obj.remove(k);
        assert_eq!(obj.get(k), None);
        assert_eq!(obj.remove(k), None);
    }
}
