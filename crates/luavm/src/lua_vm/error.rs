// Error kinds are a 1-byte Copy enum so `LuaResult` stays small on the
// hot path; the error *object* (any Lua value) travels in the global
// state and is picked up by whichever protected frame catches the kind.

use crate::lua_value::LuaValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// In-interpreter failure; error object in the global state.
    Runtime,
    /// Chunk loading failed (malformed precompiled chunk).
    Syntax,
    /// Allocation ceiling hit even after an emergency collection.
    Memory,
    /// The xpcall error handler itself failed.
    ErrErr,
    /// Not an error: a coroutine yield unwinding to its resume point.
    Yield,
}

pub type LuaResult<T> = Result<T, LuaError>;

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaError::Runtime => write!(f, "runtime error"),
            LuaError::Syntax => write!(f, "syntax error"),
            LuaError::Memory => write!(f, "not enough memory"),
            LuaError::ErrErr => write!(f, "error in error handling"),
            LuaError::Yield => write!(f, "yield"),
        }
    }
}

impl std::error::Error for LuaError {}

/// Host-facing error: the kind plus the rendered error object. Built by
/// [`crate::LuaVm::into_full_error`] after catching a `LuaError`.
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind: LuaError,
    pub message: String,
}

impl std::fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LuaFullError {}

/// Panic hook: invoked when an error escapes every protected frame.
/// Expected not to return; if it does, the error is handed to the host
/// as an ordinary `Err`.
pub type PanicFn = fn(&LuaValue) -> ();
