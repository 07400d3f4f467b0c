use ahash::RandomState;
use std::collections::HashMap;

use crate::gc::{Arena, StringId};
use crate::lua_value::LuaString;

/// Content index over the string arena - ALL strings are interned
/// - Same content always returns same StringId
/// - O(1) hash lookup (ahash), collisions resolved by comparing bytes
/// - The sweeper removes entries of collected strings
pub struct StringInterner {
    map: HashMap<u64, Vec<StringId>, RandomState>,
    hashbuilder: RandomState,
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            map: HashMap::with_capacity_and_hasher(256, RandomState::new()),
            hashbuilder: RandomState::new(),
        }
    }

    #[inline]
    pub fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        self.hashbuilder.hash_one(bytes)
    }

    pub fn find(
        &self,
        hash: u64,
        bytes: &[u8],
        strings: &Arena<StringId, LuaString>,
    ) -> Option<StringId> {
        let ids = self.map.get(&hash)?;
        ids.iter().copied().find(|&id| {
            strings
                .get(id)
                .is_some_and(|s| s.as_bytes().len() == bytes.len() && s.as_bytes() == bytes)
        })
    }

    pub fn insert(&mut self, hash: u64, id: StringId) {
        self.map.entry(hash).or_default().push(id);
    }

    pub fn remove(&mut self, hash: u64, id: StringId) {
        if let Some(ids) = self.map.get_mut(&hash) {
            ids.retain(|&x| x != id);
            if ids.is_empty() {
                self.map.remove(&hash);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}
