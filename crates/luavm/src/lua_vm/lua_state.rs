// Per-thread execution state: value stack, call frames, open upvalues and
// pending to-be-closed variables. The VM owns the running thread's state
// directly; every other thread keeps its state inside its arena slot.

use crate::gc::UpvalueId;
use crate::lua_value::LuaValue;
use crate::lua_vm::CallInfo;
use crate::lua_vm::lua_limits::BASIC_STACK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    Suspended,
    Running,
    /// Resumed another coroutine and waits for it
    Normal,
    Dead,
}

impl CoroutineStatus {
    pub fn name(self) -> &'static str {
        match self {
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    }
}

pub struct LuaState {
    pub stack: Vec<LuaValue>,
    /// First free slot; meaningful for native frames and after multi-result operations
    pub top: usize,
    pub call_infos: Vec<CallInfo>,
    /// Open upvalues of this thread, sorted by stack index
    pub open_upvalues: Vec<UpvalueId>,
    /// Stack indices of pending to-be-closed variables, ascending
    pub tbc_list: Vec<usize>,
    pub status: CoroutineStatus,
    /// Number of non-yieldable calls in the stack
    pub nny: u32,
    /// Error object of a coroutine that died by an error
    pub error_value: Option<LuaValue>,
}

impl LuaState {
    pub fn new() -> Self {
        Self {
            stack: vec![LuaValue::Nil; BASIC_STACK_SIZE],
            top: 0,
            call_infos: Vec::with_capacity(8),
            open_upvalues: Vec::new(),
            tbc_list: Vec::new(),
            status: CoroutineStatus::Suspended,
            nny: 0,
            error_value: None,
        }
    }

    /// A coroutine body is in progress (or finished) once a frame was pushed
    #[inline]
    pub fn is_started(&self) -> bool {
        !self.call_infos.is_empty()
    }

    /// Highest stack slot that may hold a live value
    pub fn live_top(&self) -> usize {
        let frames = self.call_infos.iter().map(|ci| ci.top).max().unwrap_or(0);
        frames.max(self.top).min(self.stack.len())
    }

    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<LuaState>()
            + self.stack.capacity() * std::mem::size_of::<LuaValue>()
            + self.call_infos.capacity() * std::mem::size_of::<CallInfo>()
    }
}

impl Default for LuaState {
    fn default() -> Self {
        Self::new()
    }
}
