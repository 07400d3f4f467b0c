// Lua 5.4 value representation
// Values are Copy; every heap object is owned by the ObjectPool and accessed via ID
pub mod chunk_serializer;
mod lua_number;
mod lua_table;
#[allow(clippy::module_inception)]
mod lua_value;

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use smol_str::SmolStr;

use crate::gc::{TableId, ThreadId, UpvalueId};
use crate::lua_vm::{Instruction, LuaResult, LuaState, LuaVM};

pub use lua_number::{fmt_float, fmt_number};
pub use lua_table::{LuaTable, TableError, TableKey};
pub use lua_value::{
    CFunction, LuaValue, LuaValueKind, float_ceil_to_integer, float_floor_to_integer,
    float_to_integer,
};

/// Immutable byte string with its content hash cached
pub struct LuaString {
    bytes: Box<[u8]>,
    hash: u64,
}

impl LuaString {
    pub fn new(bytes: Box<[u8]>, hash: u64) -> Self {
        Self { bytes, hash }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// UTF-8 view, if the bytes are valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    #[inline(always)]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<LuaString>() + self.bytes.len()
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.bytes))
    }
}

/// Upvalue cell: open while the captured register is alive, closed afterwards.
/// The open -> closed transition happens exactly once.
#[derive(Debug, Clone, Copy)]
pub enum LuaUpvalue {
    Open { thread: ThreadId, index: usize },
    Closed(LuaValue),
}

/// Host closure body
pub type RustCallback = Rc<dyn Fn(&mut LuaVM) -> LuaResult<usize>>;

pub struct LuaClosure {
    pub proto: Rc<Proto>,
    pub upvalues: Vec<UpvalueId>,
}

pub struct HostClosure {
    pub func: RustCallback,
    /// Values captured by the host; traced by the collector
    pub upvalues: Vec<LuaValue>,
}

pub enum LuaFunction {
    Lua(LuaClosure),
    Host(HostClosure),
}

impl LuaFunction {
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<LuaFunction>()
            + match self {
                LuaFunction::Lua(c) => c.upvalues.len() * std::mem::size_of::<UpvalueId>(),
                LuaFunction::Host(c) => c.upvalues.len() * std::mem::size_of::<LuaValue>(),
            }
    }

    pub fn as_lua(&self) -> Option<&LuaClosure> {
        match self {
            LuaFunction::Lua(c) => Some(c),
            LuaFunction::Host(_) => None,
        }
    }
}

pub struct LuaUserdata {
    pub data: Box<dyn Any>,
    pub metatable: Option<TableId>,
    pub user_value: LuaValue,
    pub size_hint: usize,
}

impl LuaUserdata {
    pub fn new(data: Box<dyn Any>, size_hint: usize) -> Self {
        Self {
            data,
            metatable: None,
            user_value: LuaValue::Nil,
            size_hint,
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut::<T>()
    }
}

/// Thread object. The running thread's state is moved out into the VM
/// while it executes, so `state` is `None` exactly for the running thread.
pub struct LuaThread {
    pub state: Option<Box<LuaState>>,
}

impl LuaThread {
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<LuaThread>()
            + self
                .state
                .as_ref()
                .map(|s| s.byte_size())
                .unwrap_or(std::mem::size_of::<LuaState>())
    }
}

/// Compile-time constant, independent of any VM
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(Box<[u8]>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpvalueDesc {
    /// Captures a register of the enclosing function (true) or one of its upvalues
    pub in_stack: bool,
    pub index: u8,
    /// Name for error messages; empty when stripped
    pub name: SmolStr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocVar {
    pub name: SmolStr,
    /// First instruction where the variable is active
    pub start_pc: u32,
    /// First instruction where the variable is dead
    pub end_pc: u32,
}

/// Compiled function prototype, the output of the compiler and of `undump`
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub locals: Vec<LocVar>,
    pub param_count: usize,
    pub is_vararg: bool,
    pub max_stack_size: usize,
    pub child_protos: Vec<Rc<Chunk>>,
    pub upvalue_descs: Vec<UpvalueDesc>,
    /// Chunk name as given to the compiler; None when stripped
    pub source_name: Option<SmolStr>,
    /// Line number for each instruction; empty when stripped
    pub line_info: Vec<u32>,
    pub linedefined: u32,
    pub lastlinedefined: u32,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_info.get(pc).copied()
    }

    /// Name of the `n`-th (1-based) local active at `pc`
    pub fn local_name(&self, n: usize, pc: usize) -> Option<&SmolStr> {
        let mut remaining = n;
        for var in &self.locals {
            if var.start_pc as usize > pc {
                break;
            }
            if pc < var.end_pc as usize {
                remaining -= 1;
                if remaining == 0 {
                    return Some(&var.name);
                }
            }
        }
        None
    }
}

/// A chunk loaded into a VM: constants interned, children loaded recursively.
/// Shared by every closure instantiated from it.
pub struct Proto {
    pub chunk: Rc<Chunk>,
    pub constants: Vec<LuaValue>,
    pub child_protos: Vec<Rc<Proto>>,
    /// Last mark epoch in which the collector traced this prototype
    pub(crate) mark_epoch: Cell<u32>,
}

impl Proto {
    #[inline(always)]
    pub fn code(&self) -> &[Instruction] {
        &self.chunk.code
    }
}
