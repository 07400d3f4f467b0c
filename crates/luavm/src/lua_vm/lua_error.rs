use smol_str::SmolStr;
use thiserror::Error;

use crate::lua_value::LuaValue;

pub type LuaResult<T> = Result<T, LuaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// Operation applied to an incompatible value
    Type,
    /// Indexing or calling nil
    Name,
    /// Call depth or register exhaustion
    StackOverflow,
    /// Raised by `error` or a host function
    User,
    /// Invalid coroutine operation
    Coroutine,
    /// The message handler of `xpcall` failed
    ErrorHandler,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    /// The error object as seen by scripts; any Lua value
    pub value: LuaValue,
    /// Rendered message, including the `chunk:line:` prefix when there is one
    pub message: String,
    /// Captured while the failing frames were still on the stack
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum LuaError {
    #[error("{chunk}:{line}: {message}")]
    Syntax {
        message: String,
        line: u32,
        chunk: SmolStr,
    },

    #[error("{0}")]
    Runtime(Box<RuntimeError>),

    #[error("bad binary chunk: {0}")]
    BadBytecode(String),

    /// Coroutine yield in flight - values stored in vm.yield_values
    #[error("attempt to yield from outside a coroutine")]
    Yield,

    /// A native asked the interpreter to run the protected-call protocol
    #[error("protected call requested outside the interpreter")]
    Protect,
}

impl LuaError {
    pub fn runtime(kind: RuntimeErrorKind, value: LuaValue, message: impl Into<String>) -> Self {
        LuaError::Runtime(Box::new(RuntimeError {
            kind,
            value,
            message: message.into(),
            traceback: None,
        }))
    }

    pub fn kind(&self) -> Option<RuntimeErrorKind> {
        match self {
            LuaError::Runtime(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn traceback(&self) -> Option<&str> {
        match self {
            LuaError::Runtime(e) => e.traceback.as_deref(),
            _ => None,
        }
    }

    /// Internal control signals never reach the host
    pub fn is_signal(&self) -> bool {
        matches!(self, LuaError::Yield | LuaError::Protect)
    }
}
