// Table access with `__index` / `__newindex` chains, and raw writes that
// keep the collector's accounting and barriers up to date

use crate::gc::TableId;
use crate::lua_value::LuaValue;
use crate::lua_vm::lua_limits::MAXTAGLOOP;
use crate::lua_vm::{LuaError, LuaResult, LuaVM, RuntimeErrorKind, TmKind, ValueSource};

impl LuaVM {
    /// `t[key]`
    pub(crate) fn get_table_value(&mut self, t: LuaValue, key: LuaValue, src: ValueSource) -> LuaResult<LuaValue> {
        let mut t = t;
        let mut src = src;
        for _ in 0..MAXTAGLOOP {
            let tm = match t {
                LuaValue::Table(id) => {
                    let table = &self.pool.tables[id];
                    let v = table.get(&key);
                    if !v.is_nil() {
                        return Ok(v);
                    }
                    let Some(mt) = table.metatable else {
                        return Ok(LuaValue::Nil);
                    };
                    let tm = self.raw_tm(mt, TmKind::Index);
                    if tm.is_nil() {
                        return Ok(LuaValue::Nil);
                    }
                    tm
                }
                _ => {
                    let tm = self.get_metamethod(&t, TmKind::Index);
                    if tm.is_nil() {
                        return Err(self.index_error(t, src));
                    }
                    tm
                }
            };
            if tm.is_function() {
                return self.call_value1(tm, &[t, key]);
            }
            t = tm;
            src = ValueSource::None;
        }
        Err(self.runtime_error(
            RuntimeErrorKind::Type,
            "'__index' chain too long; possible loop",
        ))
    }

    /// `t[key] = value`
    pub(crate) fn set_table_value(
        &mut self,
        t: LuaValue,
        key: LuaValue,
        value: LuaValue,
        src: ValueSource,
    ) -> LuaResult<()> {
        let mut t = t;
        let mut src = src;
        for _ in 0..MAXTAGLOOP {
            let tm = match t {
                LuaValue::Table(id) => {
                    let table = &self.pool.tables[id];
                    let tm = match table.metatable {
                        Some(mt) if table.get(&key).is_nil() => self.raw_tm(mt, TmKind::NewIndex),
                        _ => LuaValue::Nil,
                    };
                    if tm.is_nil() {
                        return self.table_raw_set(id, key, value);
                    }
                    tm
                }
                _ => {
                    let tm = self.get_metamethod(&t, TmKind::NewIndex);
                    if tm.is_nil() {
                        return Err(self.index_error(t, src));
                    }
                    tm
                }
            };
            if tm.is_function() {
                self.call_value(tm, &[t, key, value])?;
                return Ok(());
            }
            t = tm;
            src = ValueSource::None;
        }
        Err(self.runtime_error(
            RuntimeErrorKind::Type,
            "'__newindex' chain too long; possible loop",
        ))
    }

    fn index_error(&mut self, t: LuaValue, src: ValueSource) -> LuaError {
        let kind = if t.is_nil() {
            RuntimeErrorKind::Name
        } else {
            RuntimeErrorKind::Type
        };
        let info = self.varinfo(src);
        let name = self.type_name_with_meta(&t);
        self.runtime_error(kind, format!("attempt to index a {name} value{info}"))
    }

    /// Raw assignment; nil and NaN keys are errors
    pub(crate) fn table_raw_set(&mut self, id: TableId, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        let table = &mut self.pool.tables[id];
        let before = table.byte_size();
        match table.set(key, value) {
            Ok(_) => {
                let after = table.byte_size();
                if after > before {
                    self.gc.account_alloc(after - before);
                }
                if key.gc_id().is_some() || value.gc_id().is_some() {
                    self.table_barrier(id);
                }
                Ok(())
            }
            Err(e) => Err(self.runtime_error(RuntimeErrorKind::Type, e.message())),
        }
    }

    /// SETLIST: `t[last + i] = stack[first + i - 1]` for `i` in `1..=n`
    pub(crate) fn set_list(&mut self, id: TableId, first: usize, n: usize, last: usize) {
        let table = &mut self.pool.tables[id];
        let before = table.byte_size();
        for i in 1..=n {
            table.set_int((last + i) as i64, self.state.stack[first + i - 1]);
        }
        let after = table.byte_size();
        if after > before {
            self.gc.account_alloc(after - before);
        }
        self.table_barrier(id);
    }
}
