// Stack access for native functions.
// A native sees its arguments in `base..top` of its own frame and returns
// results by pushing them, reporting how many it pushed.

use crate::gc::{StringId, TableId};
use crate::lua_value::{LuaFunction, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaVM, RuntimeErrorKind, TmKind};

impl LuaVM {
    #[inline]
    fn frame_base(&self) -> usize {
        self.state.call_infos.last().map(|ci| ci.base).unwrap_or(0)
    }

    /// Number of arguments passed to the running native
    #[inline]
    pub fn arg_count(&self) -> usize {
        self.state.top.saturating_sub(self.frame_base())
    }

    /// Argument `index` (1-based) of the running native
    #[inline]
    pub fn get_arg(&self, index: usize) -> Option<LuaValue> {
        if index == 0 || index > self.arg_count() {
            return None;
        }
        Some(self.state.stack[self.frame_base() + index - 1])
    }

    pub fn get_args(&self) -> Vec<LuaValue> {
        let base = self.frame_base();
        self.state.stack[base..self.state.top].to_vec()
    }

    /// Push one result
    #[inline]
    pub fn push_value(&mut self, value: LuaValue) -> LuaResult<()> {
        let top = self.state.top;
        if top >= self.state.stack.len() {
            self.grow_stack(top + 1)?;
        }
        self.state.stack[top] = value;
        self.state.top = top + 1;
        Ok(())
    }

    /// Drop arguments beyond `n`, or pad with nils up to `n`
    pub fn set_arg_count(&mut self, n: usize) -> LuaResult<()> {
        let new_top = self.frame_base() + n;
        self.grow_stack(new_top)?;
        for slot in self.state.top..new_top {
            self.state.stack[slot] = LuaValue::Nil;
        }
        self.state.top = new_top;
        Ok(())
    }

    /// Captured value `index` of the running host closure
    pub fn closure_upvalue(&self, index: usize) -> LuaValue {
        let Some(ci) = self.state.call_infos.last() else {
            return LuaValue::Nil;
        };
        match self.state.stack[ci.func] {
            LuaValue::Function(fid) => match &self.pool.functions[fid] {
                LuaFunction::Host(h) => h.upvalues.get(index).copied().unwrap_or_default(),
                LuaFunction::Lua(_) => LuaValue::Nil,
            },
            _ => LuaValue::Nil,
        }
    }

    // ===== Errors =====

    /// Error raised by a native, positioned at the Lua code that called it
    pub fn error(&mut self, msg: impl Into<String>) -> LuaError {
        let msg = format!("{}{}", self.where_(1), msg.into());
        self.error_with_kind(RuntimeErrorKind::User, msg)
    }

    /// Raise an arbitrary value as error object
    pub fn error_with_value(&mut self, value: LuaValue) -> LuaError {
        let message = self.display_error_value(value);
        LuaError::runtime(RuntimeErrorKind::User, value, message)
    }

    /// Error with a pre-rendered message
    pub(crate) fn error_with_kind(&mut self, kind: RuntimeErrorKind, msg: String) -> LuaError {
        let value = self.create_string(&msg);
        LuaError::runtime(kind, value, msg)
    }

    /// Error raised by the interpreter, positioned at the running Lua frame
    pub(crate) fn runtime_error(&mut self, kind: RuntimeErrorKind, msg: impl Into<String>) -> LuaError {
        let msg = format!("{}{}", self.where_(0), msg.into());
        self.error_with_kind(kind, msg)
    }

    pub fn arg_error(&mut self, mut arg: usize, extramsg: &str) -> LuaError {
        let (what, name) = match self.running_function_name() {
            Some((what, name)) => (what, name),
            None => ("", "?".to_string()),
        };
        if what == "method" {
            arg -= 1;
            if arg == 0 {
                return self.error(format!("calling '{name}' on bad self ({extramsg})"));
            }
        }
        self.error(format!("bad argument #{arg} to '{name}' ({extramsg})"))
    }

    /// `bad argument #n to 'f' (T expected, got U)`
    pub fn type_error_arg(&mut self, arg: usize, expected: &str) -> LuaError {
        let got = match self.get_arg(arg) {
            None => "no value".to_string(),
            Some(v) => self.type_name_with_meta(&v),
        };
        self.arg_error(arg, &format!("{expected} expected, got {got}"))
    }

    /// Type name, or the `__name` field of the metatable when it is a string
    pub(crate) fn type_name_with_meta(&self, v: &LuaValue) -> String {
        if let Some(mt) = self.get_metatable(v) {
            let key = self.pool.tm_name(TmKind::Name);
            if let LuaValue::String(id) = self.pool.tables[mt].get_str(key) {
                return self.pool.strings[id].to_string_lossy();
            }
        }
        v.type_name().to_string()
    }

    // ===== Argument checks =====

    pub fn check_any(&mut self, arg: usize) -> LuaResult<LuaValue> {
        match self.get_arg(arg) {
            Some(v) => Ok(v),
            None => Err(self.arg_error(arg, "value expected")),
        }
    }

    pub fn check_table(&mut self, arg: usize) -> LuaResult<TableId> {
        match self.get_arg(arg) {
            Some(LuaValue::Table(id)) => Ok(id),
            _ => Err(self.type_error_arg(arg, "table")),
        }
    }

    pub fn check_integer(&mut self, arg: usize) -> LuaResult<i64> {
        let v = self.get_arg(arg).unwrap_or_default();
        match self.to_integer(&v) {
            Some(i) => Ok(i),
            None if self.to_number(&v).is_some() => {
                Err(self.arg_error(arg, "number has no integer representation"))
            }
            None => Err(self.type_error_arg(arg, "number")),
        }
    }

    pub fn opt_integer(&mut self, arg: usize, default: i64) -> LuaResult<i64> {
        match self.get_arg(arg) {
            None | Some(LuaValue::Nil) => Ok(default),
            Some(_) => self.check_integer(arg),
        }
    }

    /// Number argument, strings coerced; the result is an Integer or Float value
    pub fn check_number(&mut self, arg: usize) -> LuaResult<LuaValue> {
        let v = self.get_arg(arg).unwrap_or_default();
        match self.to_number(&v) {
            Some(n) => Ok(n),
            None => Err(self.type_error_arg(arg, "number")),
        }
    }

    /// String argument; numbers are converted in place
    pub fn check_string(&mut self, arg: usize) -> LuaResult<StringId> {
        match self.get_arg(arg) {
            Some(LuaValue::String(id)) => Ok(id),
            Some(v @ (LuaValue::Integer(_) | LuaValue::Float(_))) => {
                let s = crate::lua_value::fmt_number(&v).unwrap_or_default();
                let id = self.intern_bytes(s.as_bytes());
                let slot = self.frame_base() + arg - 1;
                self.state.stack[slot] = LuaValue::String(id);
                Ok(id)
            }
            _ => Err(self.type_error_arg(arg, "string")),
        }
    }

    pub fn opt_string(&mut self, arg: usize) -> LuaResult<Option<StringId>> {
        match self.get_arg(arg) {
            None | Some(LuaValue::Nil) => Ok(None),
            Some(_) => self.check_string(arg).map(Some),
        }
    }
}
