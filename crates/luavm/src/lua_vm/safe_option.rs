use crate::gc::GcOptions;
use crate::lua_vm::lua_limits::{LUAI_MAXCCALLS, LUAI_MAXSTACK, MAX_CALL_DEPTH};

#[derive(Debug, Clone)]
pub struct SafeOption {
    /// Maximum stack slots per thread
    pub max_stack_size: usize,
    /// Maximum number of active call frames per thread
    pub max_call_depth: usize,
    /// Maximum nesting of Rust-level calls (natives, metamethods, resumes)
    pub max_native_depth: u32,
    pub gc: GcOptions,
}

impl Default for SafeOption {
    fn default() -> Self {
        Self {
            max_stack_size: LUAI_MAXSTACK,
            max_call_depth: MAX_CALL_DEPTH,
            max_native_depth: LUAI_MAXCCALLS,
            gc: GcOptions::default(),
        }
    }
}
