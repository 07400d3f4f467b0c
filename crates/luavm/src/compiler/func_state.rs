// Per-function compilation state: the chunk being built, the constant
// pool index, the block stack and the register counter.

use ahash::AHashMap;
use smol_str::SmolStr;

use crate::lua_value::{Chunk, Constant};

/// Declaration kind of a local variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Regular,
    /// `<const>`: assignments are rejected
    Const,
    /// `<close>`: read-only and closed on scope exit
    ToClose,
}

/// Active local variable declaration
#[derive(Debug, Clone)]
pub struct VarDesc {
    pub name: SmolStr,
    pub kind: VarKind,
    pub ridx: u32,
    /// Entry in the chunk's debug locals
    pub pidx: usize,
}

/// A label, or a pending goto (`break` is a goto to the label "break")
#[derive(Debug, Clone)]
pub struct LabelDesc {
    pub name: SmolStr,
    pub pc: usize,
    pub line: u32,
    /// Active locals at the label or goto
    pub nactvar: u32,
    /// The goto leaves the scope of a captured variable
    pub close: bool,
}

#[derive(Debug, Clone)]
pub struct BlockCnt {
    pub first_label: usize,
    pub first_goto: usize,
    /// Active locals outside the block
    pub nactvar: u32,
    /// Some local of the block is captured by a closure
    pub upval: bool,
    pub is_loop: bool,
    /// Inside the scope of a to-be-closed variable
    pub inside_tbc: bool,
}

/// Constant pool key; floats by bit pattern so `1` and `1.0` stay apart
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstKey {
    Nil,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Box<[u8]>),
}

pub struct FuncState {
    pub chunk: Chunk,
    constant_index: AHashMap<ConstKey, u32>,
    /// Declaration kind of each upvalue, for read-only checks
    pub upvalue_kinds: Vec<VarKind>,
    pub blocks: Vec<BlockCnt>,
    /// Last jump target; code before it cannot be merged with new code
    pub last_target: usize,
    /// First entry of this function in the parser's variable list
    pub first_local: usize,
    /// First entry of this function in the parser's label list
    pub first_label: usize,
    pub nactvar: u32,
    pub freereg: u32,
    /// Returns must close upvalues or to-be-closed variables
    pub needclose: bool,
}

impl FuncState {
    pub fn new(source: Option<SmolStr>, linedefined: u32, first_local: usize, first_label: usize) -> Self {
        let chunk = Chunk {
            source_name: source,
            linedefined,
            // Registers 0 and 1 are always valid
            max_stack_size: 2,
            ..Chunk::default()
        };
        FuncState {
            chunk,
            constant_index: AHashMap::new(),
            upvalue_kinds: Vec::new(),
            blocks: Vec::new(),
            last_target: 0,
            first_local,
            first_label,
            nactvar: 0,
            freereg: 0,
            needclose: false,
        }
    }

    #[inline]
    pub fn pc(&self) -> usize {
        self.chunk.code.len()
    }

    /// Index of `value` in the constant table, adding it when new
    pub fn add_constant(&mut self, key: ConstKey, value: Constant) -> u32 {
        if let Some(&idx) = self.constant_index.get(&key) {
            return idx;
        }
        let idx = self.chunk.constants.len() as u32;
        self.chunk.constants.push(value);
        self.constant_index.insert(key, idx);
        idx
    }

    pub fn string_constant(&mut self, s: &[u8]) -> u32 {
        self.add_constant(ConstKey::Str(s.into()), Constant::String(s.into()))
    }

    pub fn int_constant(&mut self, i: i64) -> u32 {
        self.add_constant(ConstKey::Int(i), Constant::Integer(i))
    }

    pub fn float_constant(&mut self, f: f64) -> u32 {
        self.add_constant(ConstKey::Float(f.to_bits()), Constant::Float(f))
    }

    pub fn bool_constant(&mut self, b: bool) -> u32 {
        self.add_constant(ConstKey::Bool(b), Constant::Boolean(b))
    }

    pub fn nil_constant(&mut self) -> u32 {
        self.add_constant(ConstKey::Nil, Constant::Nil)
    }

    pub fn is_string_constant(&self, idx: u32) -> bool {
        matches!(self.chunk.constants.get(idx as usize), Some(Constant::String(_)))
    }

    /// Register a local for debug information; returns its index
    pub fn register_local(&mut self, name: SmolStr) -> usize {
        let start_pc = self.pc() as u32;
        self.chunk.locals.push(crate::lua_value::LocVar {
            name,
            start_pc,
            end_pc: start_pc,
        });
        self.chunk.locals.len() - 1
    }

    /// Find the upvalue called `name`
    pub fn search_upvalue(&self, name: &str) -> Option<u32> {
        self.chunk
            .upvalue_descs
            .iter()
            .position(|u| u.name == name)
            .map(|i| i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_deduplicated_by_type() {
        let mut fs = FuncState::new(None, 0, 0, 0);
        let a = fs.int_constant(1);
        let b = fs.float_constant(1.0);
        let c = fs.int_constant(1);
        let d = fs.string_constant(b"1");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_ne!(d, a);
        assert_eq!(fs.chunk.constants.len(), 3);
        assert!(fs.is_string_constant(d));
        assert!(!fs.is_string_constant(b));
    }
}
