use std::fmt;

use crate::gc::{FunctionId, GcId, StringId, TableId, ThreadId, UserdataId};
use crate::lua_vm::{LuaResult, LuaVM};

/// Native function signature: arguments are read from the current frame,
/// results are pushed onto the stack and their count returned.
pub type CFunction = fn(&mut LuaVM) -> LuaResult<usize>;

/// A Lua value. Primitive variants are stored inline; heap variants carry an
/// arena handle whose object is owned by the VM's `ObjectPool`.
#[derive(Clone, Copy, Default)]
pub enum LuaValue {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(StringId),
    Table(TableId),
    /// Lua closure or host closure
    Function(FunctionId),
    /// Light native function
    CFunction(CFunction),
    Userdata(UserdataId),
    Thread(ThreadId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaValueKind {
    Nil,
    Boolean,
    Integer,
    Float,
    String,
    Table,
    Function,
    CFunction,
    Userdata,
    Thread,
}

impl LuaValue {
    #[inline(always)]
    pub const fn nil() -> Self {
        LuaValue::Nil
    }

    #[inline(always)]
    pub const fn boolean(b: bool) -> Self {
        LuaValue::Boolean(b)
    }

    #[inline(always)]
    pub const fn integer(i: i64) -> Self {
        LuaValue::Integer(i)
    }

    #[inline(always)]
    pub const fn float(f: f64) -> Self {
        LuaValue::Float(f)
    }

    #[inline(always)]
    pub fn cfunction(f: CFunction) -> Self {
        LuaValue::CFunction(f)
    }

    pub fn kind(&self) -> LuaValueKind {
        match self {
            LuaValue::Nil => LuaValueKind::Nil,
            LuaValue::Boolean(_) => LuaValueKind::Boolean,
            LuaValue::Integer(_) => LuaValueKind::Integer,
            LuaValue::Float(_) => LuaValueKind::Float,
            LuaValue::String(_) => LuaValueKind::String,
            LuaValue::Table(_) => LuaValueKind::Table,
            LuaValue::Function(_) => LuaValueKind::Function,
            LuaValue::CFunction(_) => LuaValueKind::CFunction,
            LuaValue::Userdata(_) => LuaValueKind::Userdata,
            LuaValue::Thread(_) => LuaValueKind::Thread,
        }
    }

    /// Name reported by `type()`
    pub fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Boolean(_) => "boolean",
            LuaValue::Integer(_) | LuaValue::Float(_) => "number",
            LuaValue::String(_) => "string",
            LuaValue::Table(_) => "table",
            LuaValue::Function(_) | LuaValue::CFunction(_) => "function",
            LuaValue::Userdata(_) => "userdata",
            LuaValue::Thread(_) => "thread",
        }
    }

    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    /// `nil` and `false` are the only false values
    #[inline(always)]
    pub fn is_falsy(&self) -> bool {
        matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    #[inline(always)]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    #[inline(always)]
    pub fn is_number(&self) -> bool {
        matches!(self, LuaValue::Integer(_) | LuaValue::Float(_))
    }

    #[inline(always)]
    pub fn is_integer(&self) -> bool {
        matches!(self, LuaValue::Integer(_))
    }

    #[inline(always)]
    pub fn is_float(&self) -> bool {
        matches!(self, LuaValue::Float(_))
    }

    #[inline(always)]
    pub fn is_string(&self) -> bool {
        matches!(self, LuaValue::String(_))
    }

    #[inline(always)]
    pub fn is_table(&self) -> bool {
        matches!(self, LuaValue::Table(_))
    }

    #[inline(always)]
    pub fn is_function(&self) -> bool {
        matches!(self, LuaValue::Function(_) | LuaValue::CFunction(_))
    }

    #[inline(always)]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            LuaValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Integer, or float with an exact integer value
    pub fn to_integer_exact(&self) -> Option<i64> {
        match self {
            LuaValue::Integer(i) => Some(*i),
            LuaValue::Float(f) => float_to_integer(*f),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            LuaValue::Integer(i) => Some(*i as f64),
            LuaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            LuaValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_string_id(&self) -> Option<StringId> {
        match self {
            LuaValue::String(id) => Some(*id),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_table_id(&self) -> Option<TableId> {
        match self {
            LuaValue::Table(id) => Some(*id),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_function_id(&self) -> Option<FunctionId> {
        match self {
            LuaValue::Function(id) => Some(*id),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_thread_id(&self) -> Option<ThreadId> {
        match self {
            LuaValue::Thread(id) => Some(*id),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_userdata_id(&self) -> Option<UserdataId> {
        match self {
            LuaValue::Userdata(id) => Some(*id),
            _ => None,
        }
    }

    /// Collectable object behind this value, if any
    #[inline]
    pub fn gc_id(&self) -> Option<GcId> {
        match self {
            LuaValue::String(id) => Some(GcId::StringId(*id)),
            LuaValue::Table(id) => Some(GcId::TableId(*id)),
            LuaValue::Function(id) => Some(GcId::FunctionId(*id)),
            LuaValue::Userdata(id) => Some(GcId::UserdataId(*id)),
            LuaValue::Thread(id) => Some(GcId::ThreadId(*id)),
            _ => None,
        }
    }

    /// Primitive equality without metamethods
    pub fn raw_equal(&self, other: &LuaValue) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Integer(b)) => a == b,
            (LuaValue::Float(a), LuaValue::Float(b)) => a == b,
            (LuaValue::Integer(i), LuaValue::Float(f)) | (LuaValue::Float(f), LuaValue::Integer(i)) => {
                float_to_integer(*f) == Some(*i)
            }
            (LuaValue::String(a), LuaValue::String(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => a == b,
            (LuaValue::Function(a), LuaValue::Function(b)) => a == b,
            (LuaValue::CFunction(a), LuaValue::CFunction(b)) => std::ptr::fn_addr_eq(*a, *b),
            (LuaValue::Userdata(a), LuaValue::Userdata(b)) => a == b,
            (LuaValue::Thread(a), LuaValue::Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equal(other)
    }
}

impl fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{b}"),
            LuaValue::Integer(i) => write!(f, "{i}"),
            LuaValue::Float(n) => write!(f, "{n:?}"),
            LuaValue::String(id) => write!(f, "string#{}", id.0),
            LuaValue::Table(id) => write!(f, "table#{}", id.0),
            LuaValue::Function(id) => write!(f, "function#{}", id.0),
            LuaValue::CFunction(func) => write!(f, "cfunction@{:p}", *func as *const ()),
            LuaValue::Userdata(id) => write!(f, "userdata#{}", id.0),
            LuaValue::Thread(id) => write!(f, "thread#{}", id.0),
        }
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Boolean(b)
    }
}

impl From<i64> for LuaValue {
    fn from(i: i64) -> Self {
        LuaValue::Integer(i)
    }
}

impl From<f64> for LuaValue {
    fn from(f: f64) -> Self {
        LuaValue::Float(f)
    }
}

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// Float with an exact integer value in i64 range
#[inline]
pub fn float_to_integer(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && (-TWO_POW_63..TWO_POW_63).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

/// floor(f) as an integer, if representable
#[inline]
pub fn float_floor_to_integer(f: f64) -> Option<i64> {
    float_to_integer(f.floor())
}

/// ceil(f) as an integer, if representable
#[inline]
pub fn float_ceil_to_integer(f: f64) -> Option<i64> {
    float_to_integer(f.ceil())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_equality_across_number_subtypes() {
        assert_eq!(LuaValue::Integer(3), LuaValue::Float(3.0));
        assert_ne!(LuaValue::Integer(3), LuaValue::Float(3.5));
        assert_ne!(LuaValue::Float(f64::NAN), LuaValue::Float(f64::NAN));
        assert_ne!(LuaValue::Nil, LuaValue::Boolean(false));
    }

    #[test]
    fn test_float_to_integer_bounds() {
        assert_eq!(float_to_integer(-0.0), Some(0));
        assert_eq!(float_to_integer(2.5), None);
        assert_eq!(float_to_integer(TWO_POW_63), None);
        assert_eq!(float_to_integer(-TWO_POW_63), Some(i64::MIN));
        assert_eq!(float_floor_to_integer(-1.5), Some(-2));
        assert_eq!(float_ceil_to_integer(-1.5), Some(-1));
        assert_eq!(float_to_integer(f64::NAN), None);
    }
}
