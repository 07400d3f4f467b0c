// Call protocol: frame setup (precall), result delivery (poscall), nested
// calls from Rust and the recovery used by protected calls.
//
// Errors never pop frames while they propagate through `?`; only a
// protected-call recovery, a host boundary or a dying coroutine truncate
// the call stack. That keeps the failing frames visible to message
// handlers and tracebacks, and lets a yield travel through pcall frames.

use std::rc::Rc;

use crate::lua_value::{CFunction, LuaFunction, LuaValue, Proto, RustCallback};
use crate::lua_vm::call_status::{CIST_TAIL, CIST_XPCALL, CIST_YPCALL};
use crate::lua_vm::lua_limits::{EXTRA_CCALLS, EXTRA_CI, EXTRA_STACK, LUA_MINSTACK, MAX_CALL_CHAIN};
use crate::lua_vm::{CallInfo, LuaError, LuaResult, LuaVM, RuntimeErrorKind, TmKind, ValueSource};

/// Native callee: plain function pointer or host closure
enum CFunctionOrHost {
    Light(CFunction),
    Host(RustCallback),
}

enum Callee {
    Lua(Rc<Proto>),
    Native(CFunctionOrHost),
    Other(LuaValue),
}

impl LuaVM {
    /// Make sure the stack has at least `needed` slots
    pub(crate) fn grow_stack(&mut self, needed: usize) -> LuaResult<()> {
        let len = self.state.stack.len();
        if needed <= len {
            return Ok(());
        }
        let mut limit = self.options.max_stack_size;
        if self.handler_depth > 0 {
            limit += EXTRA_CI * LUA_MINSTACK;
        }
        if needed > limit {
            return Err(self.runtime_error(RuntimeErrorKind::StackOverflow, "stack overflow"));
        }
        let new_len = needed.max(len * 2).min(limit);
        self.state.stack.resize(new_len, LuaValue::Nil);
        Ok(())
    }

    fn call_depth_limit(&self) -> usize {
        if self.handler_depth > 0 {
            self.options.max_call_depth + EXTRA_CI
        } else {
            self.options.max_call_depth
        }
    }

    fn native_depth_limit(&self) -> u32 {
        if self.handler_depth > 0 {
            self.options.max_native_depth + EXTRA_CCALLS
        } else {
            self.options.max_native_depth
        }
    }

    /// First slot free for temporaries above the running frame
    #[inline]
    pub(crate) fn frame_top(&self) -> usize {
        match self.state.call_infos.last() {
            Some(ci) if ci.is_lua() => ci.top.max(self.state.top),
            _ => self.state.top,
        }
    }

    /// Prepare the call of the value at `func`, arguments in `func+1..top`.
    /// Returns true when a Lua frame was pushed and must be run; natives
    /// complete here with their results already moved into place.
    pub(crate) fn precall(&mut self, func: usize, nresults: i32) -> LuaResult<bool> {
        let mut chain = 0;
        loop {
            let callee = match self.state.stack[func] {
                LuaValue::Function(fid) => match &self.pool.functions[fid] {
                    LuaFunction::Lua(c) => Callee::Lua(c.proto.clone()),
                    LuaFunction::Host(h) => Callee::Native(CFunctionOrHost::Host(h.func.clone())),
                },
                LuaValue::CFunction(f) => Callee::Native(CFunctionOrHost::Light(f)),
                other => Callee::Other(other),
            };
            match callee {
                Callee::Lua(proto) => {
                    self.push_lua_frame(func, &proto, nresults)?;
                    return Ok(true);
                }
                Callee::Native(f) => return self.call_native(func, nresults, f),
                Callee::Other(v) => {
                    // Callable object: insert `__call` below the object
                    let tm = self.get_metamethod(&v, TmKind::Call);
                    if tm.is_nil() || chain >= MAX_CALL_CHAIN {
                        return Err(self.call_error(v, ValueSource::Stack(func)));
                    }
                    chain += 1;
                    let top = self.state.top;
                    self.grow_stack(top + 1 + EXTRA_STACK)?;
                    self.state.stack.copy_within(func..top, func + 1);
                    self.state.stack[func] = tm;
                    self.state.top = top + 1;
                }
            }
        }
    }

    pub(crate) fn push_lua_frame(&mut self, func: usize, proto: &Proto, nresults: i32) -> LuaResult<()> {
        if self.state.call_infos.len() >= self.call_depth_limit() {
            return Err(self.runtime_error(RuntimeErrorKind::StackOverflow, "stack overflow"));
        }
        let chunk = &proto.chunk;
        let nparams = chunk.param_count;
        let mut nargs = self.state.top - func - 1;
        let frame_top = func + 1 + chunk.max_stack_size;
        self.grow_stack(frame_top.max(self.state.top) + EXTRA_STACK)?;
        while nargs < nparams {
            self.state.stack[func + 1 + nargs] = LuaValue::Nil;
            nargs += 1;
        }
        // Vararg functions read the argument count from `top` in VARARGPREP
        self.state.top = func + 1 + nargs;
        self.state
            .call_infos
            .push(CallInfo::new_lua(func, frame_top, nresults));
        Ok(())
    }

    fn call_native(&mut self, func: usize, nresults: i32, f: CFunctionOrHost) -> LuaResult<bool> {
        if self.state.call_infos.len() >= self.call_depth_limit() {
            return Err(self.runtime_error(RuntimeErrorKind::StackOverflow, "stack overflow"));
        }
        let top = self.state.top;
        self.grow_stack(top + LUA_MINSTACK)?;
        self.state
            .call_infos
            .push(CallInfo::new_c(func, top + LUA_MINSTACK, nresults));
        let result = match f {
            CFunctionOrHost::Light(f) => f(self),
            CFunctionOrHost::Host(f) => (*f)(self),
        };
        match result {
            Ok(n) => {
                let base = func + 1;
                let first = self.state.top.saturating_sub(n).max(base);
                let n = self.state.top - first;
                self.poscall(first, n);
                Ok(false)
            }
            Err(LuaError::Protect) => self.begin_protected_call(),
            Err(e) => Err(e),
        }
    }

    /// Pop the top frame and move its `nres` results, starting at `first`,
    /// into the function slot, adjusted to the count the caller expects
    pub(crate) fn poscall(&mut self, first: usize, nres: usize) {
        let Some(ci) = self.state.call_infos.pop() else {
            return;
        };
        let res = ci.func;
        let wanted = if ci.nresults < 0 {
            nres
        } else {
            ci.nresults as usize
        };
        let n = nres.min(wanted);
        if first != res {
            self.state.stack.copy_within(first..first + n, res);
        }
        if res + wanted + EXTRA_STACK > self.state.stack.len() {
            self.state
                .stack
                .resize(res + wanted + EXTRA_STACK, LuaValue::Nil);
        }
        for slot in &mut self.state.stack[res + n..res + wanted] {
            *slot = LuaValue::Nil;
        }
        self.state.top = res + wanted;
    }

    /// `pcall`/`xpcall` turned their native frame into a protected-call
    /// frame; call the protected function above it
    fn begin_protected_call(&mut self) -> LuaResult<bool> {
        let with_handler = self.protect_request.take().unwrap_or(false);
        let ci_index = self.state.call_infos.len() - 1;
        let func = self.state.call_infos[ci_index].func;
        let callee = if with_handler {
            // [xpcall][f][msgh][args...] becomes [xpcall][msgh][f][args...]
            self.state.stack.swap(func + 1, func + 2);
            self.state.call_infos[ci_index].call_status |= CIST_YPCALL | CIST_XPCALL;
            func + 2
        } else {
            self.state.call_infos[ci_index].call_status |= CIST_YPCALL;
            func + 1
        };
        if self.precall(callee, -1)? {
            Ok(true)
        } else {
            self.finish_pcall();
            Ok(false)
        }
    }

    /// The callee of the protected-call frame on top returned: deliver
    /// `true` followed by its results
    pub(crate) fn finish_pcall(&mut self) {
        let Some(ci) = self.state.call_infos.last() else {
            return;
        };
        let first = if ci.call_status & CIST_XPCALL != 0 {
            ci.func + 1
        } else {
            ci.func
        };
        self.state.stack[first] = LuaValue::Boolean(true);
        let n = self.state.top - first;
        self.poscall(first, n);
    }

    /// Recover at the innermost protected-call frame above `base_depth`,
    /// or hand the error back when there is none
    pub(crate) fn recover_or_raise(&mut self, base_depth: usize, e: LuaError) -> LuaResult<()> {
        if e.is_signal() {
            return Err(e);
        }
        let marker = (base_depth..self.state.call_infos.len())
            .rev()
            .find(|&i| self.state.call_infos[i].is_protected());
        match marker {
            Some(index) => self.recover(index, e),
            None => Err(e),
        }
    }

    fn recover(&mut self, marker: usize, e: LuaError) -> LuaResult<()> {
        let ci = self.state.call_infos[marker].clone();
        let mut value = self.error_value(&e);
        if ci.call_status & CIST_XPCALL != 0 {
            // The handler runs on top of the failing frames
            let handler = self.state.stack[ci.func + 1];
            value = match self.call_message_handler(handler, value) {
                Ok(v) => v,
                Err(handler_error) => self.error_value(&handler_error),
            };
        }

        let level = ci.func + 1;
        self.state.top = self.state.live_top();
        self.state.call_infos.truncate(marker + 1);
        self.close_upvalues(level);
        value = self.close_tbc_with_error(level, value);
        // Failing __close calls may have left frames behind
        self.state.call_infos.truncate(marker + 1);
        self.close_upvalues(level);

        self.state.stack[ci.func] = LuaValue::Boolean(false);
        self.state.stack[ci.func + 1] = value;
        self.state.top = ci.func + 2;
        self.poscall(ci.func, 2);
        tracing::trace!(depth = marker, "recovered at protected call");
        Ok(())
    }

    /// Host-side protected boundary: drop frames above `depth`, close
    /// upvalues and pending to-be-closed variables above `top`
    pub(crate) fn unwind_to(&mut self, depth: usize, top: usize, mut e: LuaError) -> LuaError {
        self.state.top = self.state.live_top();
        self.state.call_infos.truncate(depth);
        self.close_upvalues(top);
        let value = self.error_value(&e);
        let closed = self.close_tbc_with_error(top, value);
        if closed != value {
            e = self.error_with_value(closed);
        }
        self.state.call_infos.truncate(depth);
        self.close_upvalues(top);
        self.state.top = top;
        e
    }

    /// Run a message handler on an error object. A failing handler turns
    /// the error into an `ErrorHandler` error.
    pub(crate) fn call_message_handler(&mut self, handler: LuaValue, value: LuaValue) -> LuaResult<LuaValue> {
        if self.handler_depth as usize >= EXTRA_CI {
            return Err(self.error_with_kind(
                RuntimeErrorKind::ErrorHandler,
                "error in error handling".to_string(),
            ));
        }
        self.handler_depth += 1;
        let result = self.call_value(handler, &[value]);
        self.handler_depth -= 1;
        match result {
            Ok(results) => Ok(results.first().copied().unwrap_or_default()),
            Err(e) if e.is_signal() => Err(e),
            Err(_) => Err(self.error_with_kind(
                RuntimeErrorKind::ErrorHandler,
                "error in error handling".to_string(),
            )),
        }
    }

    /// Call the value at `func` from Rust, running it to completion in a
    /// nested dispatch loop. Yields cannot cross this boundary.
    pub(crate) fn call_at(&mut self, func: usize, nresults: i32) -> LuaResult<()> {
        if self.n_ccalls >= self.native_depth_limit() {
            return Err(self.runtime_error(RuntimeErrorKind::StackOverflow, "C stack overflow"));
        }
        self.n_ccalls += 1;
        self.state.nny += 1;
        let base_depth = self.state.call_infos.len();
        tracing::trace!(depth = base_depth, nested = self.n_ccalls, "nested call");
        let result = match self.precall(func, nresults) {
            Ok(true) => self.execute_from(base_depth),
            Ok(false) => Ok(()),
            Err(e) => self
                .recover_or_raise(base_depth, e)
                .and_then(|_| self.execute_from(base_depth)),
        };
        self.state.nny -= 1;
        self.n_ccalls -= 1;
        result
    }

    /// Call `f` with `args` above the running frame and collect all results
    pub(crate) fn call_value(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        let func = self.push_call(f, args)?;
        self.call_at(func, -1)?;
        let results = self.state.stack[func..self.state.top].to_vec();
        self.state.top = func;
        Ok(results)
    }

    /// Single-result call, used for metamethods
    pub(crate) fn call_value1(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<LuaValue> {
        let func = self.push_call(f, args)?;
        self.call_at(func, 1)?;
        let result = self.state.stack[func];
        self.state.top = func;
        Ok(result)
    }

    fn push_call(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<usize> {
        let func = self.frame_top();
        self.grow_stack(func + args.len() + 1 + EXTRA_STACK)?;
        self.state.stack[func] = f;
        self.state.stack[func + 1..func + 1 + args.len()].copy_from_slice(args);
        self.state.top = func + 1 + args.len();
        Ok(func)
    }

    /// Proper tail call of the Lua function in `ra`: the new frame replaces
    /// the frame at `ci_index`
    pub(crate) fn tail_call_lua(&mut self, ci_index: usize, ra: usize, proto: &Proto) -> LuaResult<()> {
        let ci = &self.state.call_infos[ci_index];
        let mut func = ci.func;
        if proto.chunk.is_vararg {
            func -= ci.nextraargs + proto.chunk.param_count + 1;
        }
        let nresults = ci.nresults;
        let nargs = self.state.top - ra - 1;
        self.state.stack.copy_within(ra..ra + nargs + 1, func);
        self.state.top = func + nargs + 1;
        self.state.call_infos.truncate(ci_index);

        let LuaValue::Function(fid) = self.state.stack[func] else {
            return Err(self.call_error(self.state.stack[func], ValueSource::None));
        };
        let callee = match &self.pool.functions[fid] {
            LuaFunction::Lua(c) => c.proto.clone(),
            LuaFunction::Host(_) => return Err(self.call_error(LuaValue::Function(fid), ValueSource::None)),
        };
        self.push_lua_frame(func, &callee, nresults)?;
        if let Some(ci) = self.state.call_infos.last_mut() {
            ci.call_status |= CIST_TAIL;
        }
        Ok(())
    }

    /// `attempt to call a X value (global 'f')`
    pub(crate) fn call_error(&mut self, v: LuaValue, src: ValueSource) -> LuaError {
        let kind = if v.is_nil() {
            RuntimeErrorKind::Name
        } else {
            RuntimeErrorKind::Type
        };
        let info = self.varinfo(src);
        let name = self.type_name_with_meta(&v);
        self.runtime_error(kind, format!("attempt to call a {name} value{info}"))
    }
}
