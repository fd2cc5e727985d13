use std::collections::HashMap;

use crate::error::{Result, TreeError};

/// Highest index addressable by the 15-bit key-info form.
const MAX_KEY_INDEX: usize = 32767;

/// File-wide interning dictionary for property names. Interned keys are
/// written as a 15-bit index in child entry headers instead of inline bytes;
/// the dictionary itself persists in the file header region.
#[derive(Debug)]
pub struct KeyIndexTable {
    keys: Vec<String>,
    lookup: HashMap<String, u16>,
    bytes_free: usize,
    dirty: bool,
}

impl KeyIndexTable {
    pub fn new(keys: Vec<String>, bytes_free: usize) -> Self {
        let lookup = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i as u16))
            .collect();
        Self {
            keys,
            lookup,
            bytes_free,
            dirty: false,
        }
    }

    /// Returns the key's index, interning it first if it qualifies. `None`
    /// means the caller must fall back to inline key bytes.
    pub fn get_or_add(&mut self, key: &str) -> Option<u16> {
        if let Some(&index) = self.lookup.get(key) {
            return Some(index);
        }
        // One-byte keys gain nothing over the inline form; oversized or
        // non-ASCII keys cannot be interned at all.
        if key.len() < 2 || key.len() > 128 || !key.is_ascii() {
            return None;
        }
        let cost = 1 + key.len();
        if self.keys.len() > MAX_KEY_INDEX || self.bytes_free < cost {
            return None;
        }
        let index = self.keys.len() as u16;
        self.keys.push(key.to_string());
        self.lookup.insert(key.to_string(), index);
        self.bytes_free -= cost;
        self.dirty = true;
        Some(index)
    }

    /// Index lookup without interning.
    pub fn find(&self, key: &str) -> Option<u16> {
        self.lookup.get(key).copied()
    }

    pub fn get(&self, index: u16) -> Result<&str> {
        self.keys
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| TreeError::Corrupt(format!("unknown key index {index}")))
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// True once when the table changed since the last call; used to decide
    /// whether the file header region needs rewriting.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interns_and_finds_keys() {
        let mut kit = KeyIndexTable::new(Vec::new(), 1024);
        let name = kit.get_or_add("name").expect("interned");
        let created = kit.get_or_add("created").expect("interned");
        assert_ne!(name, created);
        assert_eq!(kit.get_or_add("name"), Some(name));
        assert_eq!(kit.get(name).expect("lookup"), "name");
        assert!(kit.take_dirty());
        assert!(!kit.take_dirty());
    }

    #[test]
    fn rejects_unqualified_keys() {
        let mut kit = KeyIndexTable::new(Vec::new(), 1024);
        assert_eq!(kit.get_or_add("a"), None);
        assert_eq!(kit.get_or_add("héllo"), None);
        assert_eq!(kit.get_or_add(&"x".repeat(129)), None);
        assert!(!kit.take_dirty());
    }

    #[test]
    fn stops_interning_when_region_is_full() {
        let mut kit = KeyIndexTable::new(Vec::new(), 10);
        assert!(kit.get_or_add("abcd").is_some()); // costs 5
        assert!(kit.get_or_add("efgh").is_some()); // costs 5
        assert_eq!(kit.get_or_add("ijkl"), None);
        // Already-interned keys still resolve.
        assert!(kit.find("abcd").is_some());
    }

    #[test]
    fn survives_reload_from_key_list() {
        let mut kit = KeyIndexTable::new(Vec::new(), 1024);
        let index = kit.get_or_add("title").expect("interned");
        let reloaded = KeyIndexTable::new(kit.keys().to_vec(), 1000);
        assert_eq!(reloaded.find("title"), Some(index));
        assert_eq!(reloaded.get(index).expect("lookup"), "title");
    }
}
