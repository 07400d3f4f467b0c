//! Expression descriptor: an expression whose code is not fully emitted
//! yet, so its value can still go straight to the register that needs it
//! and constant operands can still be folded.

use crate::lua_value::LuaValue;

/// Empty jump list
pub const NO_JUMP: isize = -1;

/// Where the value of an expression lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpKind {
    /// No value; the empty expression list
    Void,
    Nil,
    True,
    False,
    /// Constant table entry (info = constant index)
    K,
    /// Float literal (nval)
    KFlt,
    /// Integer literal (ival)
    KInt,
    /// String literal, already in the constant table (info = constant index)
    KStr,
    /// Value in a fixed register (info = register)
    NonReloc,
    /// Local variable (var.ridx = register, var.vidx = declaration index)
    Local,
    /// Upvalue (info = upvalue index)
    Upval,
    /// `R[ind.t][R[ind.idx]]`
    Indexed,
    /// `Upvalue[ind.t][K[ind.idx]]`, a global access through `_ENV`
    IndexUp,
    /// `R[ind.t][ind.idx]` with a small integer key
    IndexI,
    /// `R[ind.t][K[ind.idx]]` with a string key
    IndexStr,
    /// Result of a comparison (info = pc of its jump)
    Jmp,
    /// Instruction at `info` still needs its target register
    Reloc,
    /// Function call (info = pc of the CALL)
    Call,
    /// `...` (info = pc of the VARARG)
    Vararg,
}

impl ExpKind {
    /// Can be the target of an assignment
    pub fn is_var(self) -> bool {
        matches!(
            self,
            ExpKind::Local
                | ExpKind::Upval
                | ExpKind::Indexed
                | ExpKind::IndexUp
                | ExpKind::IndexI
                | ExpKind::IndexStr
        )
    }

    pub fn is_indexed(self) -> bool {
        matches!(
            self,
            ExpKind::Indexed | ExpKind::IndexUp | ExpKind::IndexI | ExpKind::IndexStr
        )
    }

    /// Produces a variable number of values
    pub fn has_multret(self) -> bool {
        matches!(self, ExpKind::Call | ExpKind::Vararg)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexInfo {
    /// Table register or upvalue
    pub t: u32,
    /// Key register, constant index or integer key
    pub idx: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VarInfo {
    pub ridx: u32,
    /// Index of the declaration among the function's active variables
    pub vidx: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ExpDesc {
    pub kind: ExpKind,
    pub info: u32,
    pub ival: i64,
    pub nval: f64,
    pub ind: IndexInfo,
    pub var: VarInfo,
    /// Jumps taken when the expression is true
    pub t: isize,
    /// Jumps taken when the expression is false
    pub f: isize,
}

impl ExpDesc {
    pub fn new(kind: ExpKind, info: u32) -> Self {
        ExpDesc {
            kind,
            info,
            ival: 0,
            nval: 0.0,
            ind: IndexInfo::default(),
            var: VarInfo::default(),
            t: NO_JUMP,
            f: NO_JUMP,
        }
    }

    pub fn void() -> Self {
        Self::new(ExpKind::Void, 0)
    }

    pub fn int(value: i64) -> Self {
        let mut e = Self::new(ExpKind::KInt, 0);
        e.ival = value;
        e
    }

    pub fn float(value: f64) -> Self {
        let mut e = Self::new(ExpKind::KFlt, 0);
        e.nval = value;
        e
    }

    pub fn local(ridx: u32, vidx: usize) -> Self {
        let mut e = Self::new(ExpKind::Local, 0);
        e.var = VarInfo { ridx, vidx };
        e
    }

    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    /// Numeric literal without pending jumps
    pub fn numeral(&self) -> Option<LuaValue> {
        if self.has_jumps() {
            return None;
        }
        match self.kind {
            ExpKind::KInt => Some(LuaValue::Integer(self.ival)),
            ExpKind::KFlt => Some(LuaValue::Float(self.nval)),
            _ => None,
        }
    }
}
