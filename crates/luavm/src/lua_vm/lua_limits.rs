//! Centralized VM limits and configuration constants.
//!
//! All magic numbers that control VM behavior are collected here
//! for easy tuning.

// ===== Stack =====

/// Extra stack slots above a frame top for temporaries and metamethod calls.
pub const EXTRA_STACK: usize = 5;

/// Minimum guaranteed stack slots available to native functions.
pub const LUA_MINSTACK: usize = 20;

/// Initial stack capacity for new states.
pub const BASIC_STACK_SIZE: usize = 2 * LUA_MINSTACK;

/// Default maximum stack size (number of slots).
pub const LUAI_MAXSTACK: usize = 1_000_000;

/// Default maximum function call nesting depth (Lua frames included).
pub const MAX_CALL_DEPTH: usize = 200_000;

/// Maximum nesting of Rust-level calls: natives, metamethods, resumes.
pub const LUAI_MAXCCALLS: u32 = 200;

/// Extra call depth granted while a message handler runs after an overflow.
pub const EXTRA_CI: usize = 30;

/// Extra native nesting granted while a message handler runs.
pub const EXTRA_CCALLS: u32 = 20;

// ===== Compiler =====

/// Maximum number of local variables per function.
pub const MAXVARS: usize = 200;

/// Maximum number of upvalues per function.
pub const MAXUPVAL: usize = 255;

/// Maximum number of registers in a function (must fit in A).
pub const MAXREGS: usize = 255;

/// Maximum parser recursion depth.
pub const MAXCCALLS: usize = 200;

/// "No register" sentinel value in the compiler.
pub const NO_REG: u32 = 255;

/// Number of list items to flush per SETLIST instruction in table constructors.
pub const LFIELDS_PER_FLUSH: u32 = 50;

/// Unary operator priority in expression parser.
pub const UNARY_PRIORITY: u8 = 12;

/// Maximum length of a source name in error messages.
pub const MAX_SRC_LEN: usize = 60;

// ===== Metamethods =====

/// Maximum depth for __index / __newindex chains.
pub const MAXTAGLOOP: usize = 2000;

/// Maximum number of chained `__call` metamethods for one call.
pub const MAX_CALL_CHAIN: usize = 15;
