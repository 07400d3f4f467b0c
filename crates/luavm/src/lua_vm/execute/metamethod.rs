// Metamethod lookup and the `tostring` conversion

use crate::gc::TableId;
use crate::lua_value::{LuaValue, fmt_number};
use crate::lua_vm::{LuaResult, LuaVM, RuntimeErrorKind, TmKind};

impl LuaVM {
    /// Raw lookup of an event in a metatable
    #[inline]
    pub(crate) fn raw_tm(&self, mt: TableId, tm: TmKind) -> LuaValue {
        self.pool.tables[mt].get_str(self.pool.tm_name(tm))
    }

    /// Metamethod of `v` for `tm`, nil when absent
    pub(crate) fn get_metamethod(&self, v: &LuaValue, tm: TmKind) -> LuaValue {
        match self.get_metatable(v) {
            Some(mt) => self.raw_tm(mt, tm),
            None => LuaValue::Nil,
        }
    }

    /// Call the binary metamethod of the first operand that has one
    pub(crate) fn try_bin_tm(&mut self, a: LuaValue, b: LuaValue, tm: TmKind) -> LuaResult<Option<LuaValue>> {
        let mut f = self.get_metamethod(&a, tm);
        if f.is_nil() {
            f = self.get_metamethod(&b, tm);
        }
        if f.is_nil() {
            return Ok(None);
        }
        self.call_value1(f, &[a, b]).map(Some)
    }

    /// String form of any value, as returned by `tostring`
    pub(crate) fn tostring_value(&mut self, v: LuaValue) -> LuaResult<LuaValue> {
        let tm = self.get_metamethod(&v, TmKind::ToString);
        if !tm.is_nil() {
            let r = self.call_value1(tm, &[v])?;
            return match r {
                LuaValue::String(_) => Ok(r),
                LuaValue::Integer(_) | LuaValue::Float(_) => {
                    let s = fmt_number(&r).unwrap_or_default();
                    Ok(self.create_string(&s))
                }
                _ => Err(self.error_with_kind(
                    RuntimeErrorKind::Type,
                    "'__tostring' must return a string".to_string(),
                )),
            };
        }
        let text = match v {
            LuaValue::String(_) => return Ok(v),
            LuaValue::Nil => "nil".to_string(),
            LuaValue::Boolean(b) => b.to_string(),
            LuaValue::Integer(_) | LuaValue::Float(_) => fmt_number(&v).unwrap_or_default(),
            _ => {
                let name = self.type_name_with_meta(&v);
                format!("{name}: 0x{:08x}", object_address(&v))
            }
        };
        Ok(self.create_string(&text))
    }
}

/// Stable pseudo address for printing; distinct per live object
fn object_address(v: &LuaValue) -> u64 {
    match v {
        LuaValue::CFunction(f) => *f as usize as u64,
        _ => match v.gc_id() {
            Some(id) => ((id.gc_type() as u64 + 1) << 32 | id.index() as u64) << 4,
            None => 0,
        },
    }
}
