//! String interning.
//!
//! Identifiers, literal object keys, and string constants are stored once
//! in an intern table that lives as long as the VM. Interning returns a
//! `StringId`; equal text always yields the same id, so equality of
//! interned strings is id equality.

use ahash::AHashMap;

/// Index into the intern table.
///
/// `u32` keeps `StringId` small enough to embed in value payloads and
/// bytecode operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StringId(u32);

impl StringId {
    #[inline]
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// The intern table: append-only storage plus a content index.
///
/// Entries are never removed; the GC does not manage this table.
#[derive(Debug, Default)]
pub struct Interns {
    strings: Vec<Box<str>>,
    by_content: AHashMap<Box<str>, StringId>,
}

impl Interns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `text`, returning the canonical id for its content.
    pub fn intern(&mut self, text: &str) -> StringId {
        if let Some(&id) = self.by_content.get(text) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).unwrap_or(u32::MAX));
        self.strings.push(text.into());
        self.by_content.insert(text.into(), id);
        id
    }

    /// Returns the text for `id`.
    ///
    /// # Panics
    /// Panics if `id` did not come from this table.
    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.0 as usize]
    }

    /// Looks up an id by content without interning.
    #[must_use]
    pub fn lookup(&self, text: &str) -> Option<StringId> {
        self.by_content.get(text).copied()
    }

    /// Number of interned strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups_by_content() {
        let mut interns = Interns::new();
        let a = interns.intern("foo");
        let b = interns.intern("bar");
        let c = interns.intern("foo");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(interns.len(), 2);
        assert_eq!(interns.get(a), "foo");
        assert_eq!(interns.get(b), "bar");
    }

    #[test]
    fn lookup_does_not_intern() {
        let mut interns = Interns::new();
        assert_eq!(interns.lookup("x"), None);
        let id = interns.intern("x");
        assert_eq!(interns.lookup("x"), Some(id));
        assert_eq!(interns.len(), 1);
    }
}
