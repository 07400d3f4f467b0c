// Closures, upvalue cells and to-be-closed variables.
//
// Open upvalues of a thread are kept sorted by stack slot so that closing a
// level pops from the end, and two closures capturing the same slot share
// one cell.

use std::rc::Rc;

use crate::gc::{FunctionId, GcId, UpvalueId};
use crate::lua_value::{LuaClosure, LuaFunction, LuaUpvalue, LuaValue, Proto};
use crate::lua_vm::{LuaError, LuaResult, LuaVM, RuntimeErrorKind, TmKind};

impl LuaVM {
    /// Upvalue cell `idx` of the Lua closure `fid`
    #[inline]
    pub(crate) fn closure_upvalue_id(&self, fid: FunctionId, idx: usize) -> LuaResult<UpvalueId> {
        match &self.pool.functions[fid] {
            LuaFunction::Lua(c) => c
                .upvalues
                .get(idx)
                .copied()
                .ok_or_else(|| LuaError::BadBytecode(format!("upvalue {idx} out of range"))),
            LuaFunction::Host(_) => Err(LuaError::BadBytecode(
                "upvalue access from a host closure".to_string(),
            )),
        }
    }

    pub(crate) fn upvalue_get(&self, uid: UpvalueId) -> LuaValue {
        match self.pool.upvalues[uid] {
            LuaUpvalue::Closed(v) => v,
            LuaUpvalue::Open { thread, index } => {
                if thread == self.current_thread {
                    self.state.stack[index]
                } else {
                    self.pool.threads[thread]
                        .state
                        .as_ref()
                        .map(|s| s.stack[index])
                        .unwrap_or_default()
                }
            }
        }
    }

    pub(crate) fn upvalue_set(&mut self, uid: UpvalueId, value: LuaValue) {
        match self.pool.upvalues[uid] {
            LuaUpvalue::Closed(_) => {
                self.pool.upvalues[uid] = LuaUpvalue::Closed(value);
                self.object_barrier(Some(GcId::UpvalueId(uid)), value);
            }
            LuaUpvalue::Open { thread, index } => {
                if thread == self.current_thread {
                    self.state.stack[index] = value;
                } else if let Some(state) = self.pool.threads[thread].state.as_mut() {
                    state.stack[index] = value;
                    // The owning thread may already be traversed
                    self.object_barrier(Some(GcId::ThreadId(thread)), value);
                }
            }
        }
    }

    /// Open upvalue for stack slot `index` of the running thread, shared
    /// with any closure that already captured it
    pub(crate) fn find_upvalue(&mut self, index: usize) -> UpvalueId {
        let mut pos = self.state.open_upvalues.len();
        while pos > 0 {
            let uid = self.state.open_upvalues[pos - 1];
            let slot = match self.pool.upvalues[uid] {
                LuaUpvalue::Open { index, .. } => index,
                LuaUpvalue::Closed(_) => 0,
            };
            if slot == index {
                return uid;
            }
            if slot < index {
                break;
            }
            pos -= 1;
        }
        let uid = self.alloc_upvalue(LuaUpvalue::Open {
            thread: self.current_thread,
            index,
        });
        self.state.open_upvalues.insert(pos, uid);
        uid
    }

    /// Close every open upvalue at or above `level`
    pub(crate) fn close_upvalues(&mut self, level: usize) {
        while let Some(&uid) = self.state.open_upvalues.last() {
            let index = match self.pool.upvalues[uid] {
                LuaUpvalue::Open { index, .. } => index,
                LuaUpvalue::Closed(_) => {
                    self.state.open_upvalues.pop();
                    continue;
                }
            };
            if index < level {
                break;
            }
            self.state.open_upvalues.pop();
            let value = self.state.stack[index];
            self.pool.upvalues[uid] = LuaUpvalue::Closed(value);
            self.object_barrier(Some(GcId::UpvalueId(uid)), value);
        }
    }

    /// CLOSURE: instantiate `proto` inside the running frame
    pub(crate) fn push_closure(
        &mut self,
        proto: Rc<Proto>,
        parent: FunctionId,
        base: usize,
    ) -> LuaResult<FunctionId> {
        let mut upvalues = Vec::with_capacity(proto.chunk.upvalue_descs.len());
        for desc in &proto.chunk.upvalue_descs {
            let uid = if desc.in_stack {
                self.find_upvalue(base + desc.index as usize)
            } else {
                self.closure_upvalue_id(parent, desc.index as usize)?
            };
            upvalues.push(uid);
        }
        Ok(self.alloc_function(LuaFunction::Lua(LuaClosure { proto, upvalues })))
    }

    // ===== To-be-closed variables =====

    /// TBC: register the value in `slot`; nil and false are ignored
    pub(crate) fn mark_tbc(&mut self, slot: usize) -> LuaResult<()> {
        let v = self.state.stack[slot];
        if v.is_falsy() {
            return Ok(());
        }
        if self.get_metamethod(&v, TmKind::Close).is_nil() {
            let name = self.local_name_at(slot).unwrap_or_else(|| "?".to_string());
            return Err(self.runtime_error(
                RuntimeErrorKind::Type,
                format!("variable '{name}' got a non-closable value"),
            ));
        }
        self.state.tbc_list.push(slot);
        Ok(())
    }

    fn pop_tbc_above(&mut self, level: usize) -> Option<LuaValue> {
        match self.state.tbc_list.last() {
            Some(&slot) if slot >= level => {
                self.state.tbc_list.pop();
                Some(self.state.stack[slot])
            }
            _ => None,
        }
    }

    /// Normal scope exit: call `__close(v, nil)` on pending variables at or
    /// above `level`, innermost first
    pub(crate) fn close_tbc(&mut self, level: usize) -> LuaResult<()> {
        while let Some(v) = self.pop_tbc_above(level) {
            let tm = self.get_metamethod(&v, TmKind::Close);
            self.call_value(tm, &[v, LuaValue::Nil])?;
        }
        Ok(())
    }

    /// Unwinding: call `__close(v, err)`; an error raised by a close method
    /// replaces the error passed to the following ones. Returns the final error.
    pub(crate) fn close_tbc_with_error(&mut self, level: usize, err: LuaValue) -> LuaValue {
        let mut err = err;
        while let Some(v) = self.pop_tbc_above(level) {
            let tm = self.get_metamethod(&v, TmKind::Close);
            let depth = self.state.call_infos.len();
            let top = self.state.top;
            if let Err(e) = self.call_value(tm, &[v, err]) {
                err = self.error_value(&e);
                self.state.call_infos.truncate(depth);
                self.state.top = top;
            }
        }
        err
    }
}
