// CallInfo - Information about a single function call

/// Call status flags
pub mod call_status {
    /// Lua function (has bytecode)
    pub const CIST_LUA: u32 = 1 << 0;
    /// Native function
    pub const CIST_C: u32 = 1 << 1;
    /// Function was tail called
    pub const CIST_TAIL: u32 = 1 << 2;
    /// Protected-call frame: `pcall`/`xpcall` waiting for its callee
    pub const CIST_YPCALL: u32 = 1 << 3;
    /// Protected call with a message handler stored right above the frame's function
    pub const CIST_XPCALL: u32 = 1 << 4;
    /// Native frame of a pending `coroutine.yield`
    pub const CIST_YIELD: u32 = 1 << 5;
}

use call_status::*;

/// Information about a single function call on the call stack
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Stack index of the function being called.
    /// Moved up by VARARGPREP, which copies the function above its varargs.
    pub func: usize,

    /// Base index in the stack for this call frame's registers
    pub base: usize,

    /// Top of stack for this frame (first slot past its registers)
    pub top: usize,

    /// Program counter (Lua functions only): index of the next instruction
    pub pc: usize,

    /// Number of expected results, -1 for "all of them"
    pub nresults: i32,

    /// Call status flags (CIST_*)
    pub call_status: u32,

    /// Number of extra arguments in vararg functions
    pub nextraargs: usize,
}

impl CallInfo {
    pub fn new_lua(func: usize, top: usize, nresults: i32) -> Self {
        Self {
            func,
            base: func + 1,
            top,
            pc: 0,
            nresults,
            call_status: CIST_LUA,
            nextraargs: 0,
        }
    }

    pub fn new_c(func: usize, top: usize, nresults: i32) -> Self {
        Self {
            func,
            base: func + 1,
            top,
            pc: 0,
            nresults,
            call_status: CIST_C,
            nextraargs: 0,
        }
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.call_status & CIST_LUA != 0
    }

    #[inline(always)]
    pub fn is_protected(&self) -> bool {
        self.call_status & CIST_YPCALL != 0
    }

    /// Index of the instruction being executed
    #[inline(always)]
    pub fn current_pc(&self) -> usize {
        self.pc.saturating_sub(1)
    }
}
