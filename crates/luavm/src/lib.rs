// Embeddable Lua 5.4 runtime
// Single-pass compiler, register-based interpreter, coroutines and an
// incremental/generational collector

#[cfg(test)]
mod test;

pub mod compiler;
pub mod gc;
pub mod lib_registry;
pub mod lua_value;
pub mod lua_vm;
pub mod stdlib;

pub use gc::{GcMode, GcModeOption, GcOptions, GenerationalParams, IncrementalParams};
pub use lib_registry::LibraryRegistry;
pub use lua_value::{CFunction, Chunk, LuaFunction, LuaTable, LuaValue};
pub use lua_vm::{
    CoroutineStatus, Instruction, LuaError, LuaResult, LuaVM, OpCode, ResumeResult, RuntimeError,
    RuntimeErrorKind, SafeOption,
};
pub use stdlib::Stdlib;
