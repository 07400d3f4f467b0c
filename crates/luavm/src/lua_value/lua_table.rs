// Lua table: array part for keys 1..n plus an insertion-ordered hash part.
//
// Invariants:
// - the array part never shrinks; it may hold nils
// - the hash part never holds a live integer key in 1..=array.len()+1,
//   so `array.len()` is a border whenever the last array slot is non-nil
// - removing a hash entry leaves a tombstone (nil value) so that `next`
//   keeps working while fields are cleared during traversal; tombstones are
//   compacted away only when a new key forces the node vector to grow

use ahash::RandomState;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::gc::TableId;
use crate::lua_value::lua_value::float_to_integer;
use crate::lua_value::LuaValue;

/// A normalized table key: never nil or NaN, floats with an integral value
/// are stored as integers.
#[derive(Clone, Copy, Debug)]
pub struct TableKey(LuaValue);

impl TableKey {
    #[inline]
    pub fn new(value: LuaValue) -> Result<TableKey, TableError> {
        match value {
            LuaValue::Nil => Err(TableError::NilKey),
            LuaValue::Float(f) => {
                if f.is_nan() {
                    Err(TableError::NanKey)
                } else if let Some(i) = float_to_integer(f) {
                    Ok(TableKey(LuaValue::Integer(i)))
                } else {
                    Ok(TableKey(value))
                }
            }
            _ => Ok(TableKey(value)),
        }
    }

    #[inline(always)]
    pub fn value(self) -> LuaValue {
        self.0
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        match (self.0, other.0) {
            (LuaValue::Float(a), LuaValue::Float(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a.raw_equal(&b) && a.kind() == b.kind(),
        }
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.0 {
            LuaValue::Nil => 0u8.hash(state),
            LuaValue::Boolean(b) => (1u8, b).hash(state),
            LuaValue::Integer(i) => (2u8, i).hash(state),
            LuaValue::Float(f) => (3u8, f.to_bits()).hash(state),
            LuaValue::String(id) => (4u8, id.0).hash(state),
            LuaValue::Table(id) => (5u8, id.0).hash(state),
            LuaValue::Function(id) => (6u8, id.0).hash(state),
            LuaValue::CFunction(f) => (7u8, f as usize).hash(state),
            LuaValue::Userdata(id) => (8u8, id.0).hash(state),
            LuaValue::Thread(id) => (9u8, id.0).hash(state),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    NilKey,
    NanKey,
}

impl TableError {
    pub fn message(self) -> &'static str {
        match self {
            TableError::NilKey => "index is nil",
            TableError::NanKey => "index is NaN",
        }
    }
}

#[derive(Clone, Copy)]
struct Node {
    key: TableKey,
    value: LuaValue,
}

pub struct LuaTable {
    array: Vec<LuaValue>,
    nodes: Vec<Node>,
    index: HashMap<TableKey, usize, RandomState>,
    tombstones: usize,
    pub metatable: Option<TableId>,
}

impl Default for LuaTable {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl LuaTable {
    pub fn new(narray: usize, nhash: usize) -> Self {
        Self {
            array: Vec::with_capacity(narray),
            nodes: Vec::with_capacity(nhash),
            index: HashMap::with_capacity_and_hasher(nhash, RandomState::new()),
            tombstones: 0,
            metatable: None,
        }
    }

    #[inline]
    pub fn get_int(&self, i: i64) -> LuaValue {
        if i >= 1 && (i as u64) <= self.array.len() as u64 {
            return self.array[(i - 1) as usize];
        }
        self.get_node(&TableKey(LuaValue::Integer(i)))
    }

    #[inline]
    pub fn get_str(&self, key: crate::gc::StringId) -> LuaValue {
        self.get_node(&TableKey(LuaValue::String(key)))
    }

    /// Raw get; nil and NaN keys simply miss
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        match key {
            LuaValue::Integer(i) => self.get_int(*i),
            LuaValue::String(id) => self.get_str(*id),
            _ => match TableKey::new(*key) {
                Ok(TableKey(LuaValue::Integer(i))) => self.get_int(i),
                Ok(k) => self.get_node(&k),
                Err(_) => LuaValue::Nil,
            },
        }
    }

    #[inline]
    fn get_node(&self, key: &TableKey) -> LuaValue {
        match self.index.get(key) {
            Some(&idx) => self.nodes[idx].value,
            None => LuaValue::Nil,
        }
    }

    /// Raw set. Returns true when a new hash key was created.
    pub fn set(&mut self, key: LuaValue, value: LuaValue) -> Result<bool, TableError> {
        let key = TableKey::new(key)?;
        if let LuaValue::Integer(i) = key.0 {
            return Ok(self.set_int(i, value));
        }
        Ok(self.set_node(key, value))
    }

    /// Raw set with an integer key. Returns true when a new hash key was created.
    pub fn set_int(&mut self, i: i64, value: LuaValue) -> bool {
        let len = self.array.len();
        if i >= 1 && (i as u64) <= len as u64 {
            self.array[(i - 1) as usize] = value;
            return false;
        }
        if i >= 1 && (i as u64) == len as u64 + 1 {
            if value.is_nil() {
                return false;
            }
            self.array.push(value);
            self.migrate_from_hash();
            return false;
        }
        self.set_node(TableKey(LuaValue::Integer(i)), value)
    }

    /// After the array grew, pull the following integer keys out of the hash part
    fn migrate_from_hash(&mut self) {
        loop {
            let next = TableKey(LuaValue::Integer(self.array.len() as i64 + 1));
            let Some(&idx) = self.index.get(&next) else {
                return;
            };
            let value = self.nodes[idx].value;
            if value.is_nil() {
                return;
            }
            self.nodes[idx].value = LuaValue::Nil;
            self.tombstones += 1;
            self.array.push(value);
        }
    }

    fn set_node(&mut self, key: TableKey, value: LuaValue) -> bool {
        if let Some(&idx) = self.index.get(&key) {
            let node = &mut self.nodes[idx];
            match (node.value.is_nil(), value.is_nil()) {
                (true, false) => self.tombstones -= 1,
                (false, true) => self.tombstones += 1,
                _ => {}
            }
            node.value = value;
            return false;
        }
        if value.is_nil() {
            return false;
        }
        if self.nodes.len() == self.nodes.capacity() && self.tombstones * 2 >= self.nodes.len() && self.tombstones > 0 {
            self.compact();
        }
        self.index.insert(key, self.nodes.len());
        self.nodes.push(Node { key, value });
        true
    }

    /// Drop tombstones and rebuild the index
    fn compact(&mut self) {
        self.nodes.retain(|n| !n.value.is_nil());
        self.index.clear();
        for (i, n) in self.nodes.iter().enumerate() {
            self.index.insert(n.key, i);
        }
        self.tombstones = 0;
    }

    /// Border: `t[n] ~= nil and t[n+1] == nil`, or 0 if `t[1] == nil`.
    /// The array length is returned when its last slot is occupied; otherwise
    /// a binary search finds a border inside the array part.
    pub fn len(&self) -> usize {
        let n = self.array.len();
        if n == 0 || !self.array[n - 1].is_nil() {
            return n;
        }
        let (mut i, mut j) = (0usize, n);
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.array[m - 1].is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    pub fn is_empty(&self) -> bool {
        self.array.iter().all(LuaValue::is_nil) && self.nodes.iter().all(|n| n.value.is_nil())
    }

    /// Traversal step: array part in order, then hash nodes in insertion order.
    /// `Err` means the key is not present in the table.
    pub fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, ()> {
        let mut array_start = 0usize;
        let mut node_start = 0usize;
        if !key.is_nil() {
            let key = TableKey::new(*key).map_err(|_| ())?;
            match key.0 {
                LuaValue::Integer(i) if i >= 1 && (i as u64) <= self.array.len() as u64 => {
                    array_start = i as usize;
                }
                _ => {
                    let idx = *self.index.get(&key).ok_or(())?;
                    array_start = self.array.len();
                    node_start = idx + 1;
                }
            }
        }
        for i in array_start..self.array.len() {
            let v = self.array[i];
            if !v.is_nil() {
                return Ok(Some((LuaValue::Integer(i as i64 + 1), v)));
            }
        }
        for node in &self.nodes[node_start.min(self.nodes.len())..] {
            if !node.value.is_nil() {
                return Ok(Some((node.key.0, node.value)));
            }
        }
        Ok(None)
    }

    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    pub fn hash_len(&self) -> usize {
        self.nodes.len() - self.tombstones
    }

    pub fn array_values(&self) -> &[LuaValue] {
        &self.array
    }

    /// Live hash entries
    pub fn entries(&self) -> impl Iterator<Item = (LuaValue, LuaValue)> + '_ {
        self.nodes
            .iter()
            .filter(|n| !n.value.is_nil())
            .map(|n| (n.key.0, n.value))
    }

    /// Remove entries rejected by `keep`; used by the collector for weak tables
    pub fn retain(&mut self, mut keep: impl FnMut(&LuaValue, &LuaValue) -> bool) {
        for (i, v) in self.array.iter_mut().enumerate() {
            if !v.is_nil() && !keep(&LuaValue::Integer(i as i64 + 1), v) {
                *v = LuaValue::Nil;
            }
        }
        for node in &mut self.nodes {
            if !node.value.is_nil() && !keep(&node.key.0, &node.value) {
                node.value = LuaValue::Nil;
                self.tombstones += 1;
            }
        }
    }

    /// Rough heap footprint for collector pacing
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<LuaTable>()
            + self.array.capacity() * std::mem::size_of::<LuaValue>()
            + self.nodes.capacity() * (std::mem::size_of::<Node>() + 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_growth_and_migration() {
        let mut t = LuaTable::new(0, 0);
        t.set_int(2, LuaValue::Integer(20));
        t.set_int(3, LuaValue::Integer(30));
        assert_eq!(t.array_len(), 0);
        assert_eq!(t.len(), 0);

        t.set_int(1, LuaValue::Integer(10));
        assert_eq!(t.array_len(), 3);
        assert_eq!(t.len(), 3);
        assert_eq!(t.get_int(2), LuaValue::Integer(20));
        assert_eq!(t.hash_len(), 0);
    }

    #[test]
    fn test_border_with_holes() {
        let mut t = LuaTable::new(0, 0);
        for i in 1..=8 {
            t.set_int(i, LuaValue::Integer(i));
        }
        t.set_int(8, LuaValue::Nil);
        t.set_int(7, LuaValue::Nil);
        let n = t.len();
        assert_eq!(n, 6);
        assert!(!t.get_int(n as i64).is_nil());
        assert!(t.get_int(n as i64 + 1).is_nil());
    }

    #[test]
    fn test_float_keys_normalize() {
        let mut t = LuaTable::new(0, 0);
        t.set(LuaValue::Float(1.0), LuaValue::Boolean(true)).unwrap();
        assert_eq!(t.get(&LuaValue::Integer(1)), LuaValue::Boolean(true));
        t.set(LuaValue::Float(1.5), LuaValue::Integer(7)).unwrap();
        assert_eq!(t.get(&LuaValue::Float(1.5)), LuaValue::Integer(7));
        assert_eq!(t.set(LuaValue::Nil, LuaValue::Integer(1)), Err(TableError::NilKey));
        assert_eq!(t.set(LuaValue::Float(f64::NAN), LuaValue::Integer(1)), Err(TableError::NanKey));
    }

    #[test]
    fn test_next_survives_clearing_during_traversal() {
        let mut t = LuaTable::new(0, 0);
        for i in 0..10 {
            t.set(LuaValue::Float(i as f64 + 0.5), LuaValue::Integer(i)).unwrap();
        }
        let mut key = LuaValue::Nil;
        let mut seen = 0;
        while let Ok(Some((k, _))) = t.next(&key) {
            t.set(k, LuaValue::Nil).unwrap();
            seen += 1;
            key = k;
        }
        assert_eq!(seen, 10);
        assert!(t.is_empty());
    }

    #[test]
    fn test_next_unknown_key() {
        let t = LuaTable::new(0, 0);
        assert!(t.next(&LuaValue::Integer(42)).is_err());
        assert_eq!(t.next(&LuaValue::Nil), Ok(None));
    }
}
