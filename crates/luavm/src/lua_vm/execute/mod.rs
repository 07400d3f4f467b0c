/*----------------------------------------------------------------------
  Lua VM dispatch loop

  Lua-to-Lua calls and returns never recurse on the Rust stack: CALL
  pushes a CallInfo and jumps to 'newframe, RETURN pops it and resumes the
  caller at its saved pc. Natives, metamethods and finalizers run through
  `call_at`, which starts a nested `execute_from` bounded by the depth at
  which it was entered.
----------------------------------------------------------------------*/

mod arith;
mod call;
mod closure;
mod concat;
mod metamethod;
mod table_ops;

use crate::lua_value::{LuaFunction, LuaValue};
use crate::lua_vm::call_status::{CIST_XPCALL, CIST_YPCALL};
use crate::lua_vm::lua_limits::EXTRA_STACK;
use crate::lua_vm::{Instruction, LuaError, LuaResult, LuaVM, OpCode, RuntimeErrorKind, TmKind};

pub(crate) use arith::arith_numbers;

/// Where an operand came from, for variable names in error messages
#[derive(Debug, Clone, Copy)]
pub(crate) enum ValueSource {
    None,
    /// Absolute stack slot
    Stack(usize),
    /// Upvalue index of the running closure
    Upvalue(usize),
}

impl LuaVM {
    /// Run frames above `base_depth` until they all returned, recovering
    /// errors at protected-call frames above that depth
    pub(crate) fn execute_from(&mut self, base_depth: usize) -> LuaResult<()> {
        loop {
            match self.run(base_depth) {
                Ok(()) => return Ok(()),
                Err(e) => self.recover_or_raise(base_depth, e)?,
            }
        }
    }

    fn frame_error(&mut self) -> LuaError {
        self.runtime_error(RuntimeErrorKind::Type, "invalid call frame")
    }

    fn run(&mut self, base_depth: usize) -> LuaResult<()> {
        'newframe: loop {
            let depth = self.state.call_infos.len();
            if depth <= base_depth {
                return Ok(());
            }
            let ci_index = depth - 1;
            let ci = &self.state.call_infos[ci_index];
            if !ci.is_lua() {
                // A protected-call frame whose Lua callee just returned
                if ci.call_status & (CIST_YPCALL | CIST_XPCALL) != 0 {
                    self.finish_pcall();
                    continue 'newframe;
                }
                return Err(self.frame_error());
            }
            let func = ci.func;
            let mut base = ci.base;
            let mut pc = ci.pc;

            let LuaValue::Function(fid) = self.state.stack[func] else {
                return Err(self.frame_error());
            };
            let proto = match &self.pool.functions[fid] {
                LuaFunction::Lua(c) => c.proto.clone(),
                LuaFunction::Host(_) => return Err(self.frame_error()),
            };
            let code = proto.code();
            let k = &proto.constants;

            loop {
                let instr = code[pc];
                pc += 1;
                self.state.call_infos[ci_index].pc = pc;
                let a = instr.get_a() as usize;
                let ra = base + a;

                match instr.get_opcode() {
                    OpCode::Move => {
                        self.state.stack[ra] = self.state.stack[base + instr.get_b() as usize];
                    }
                    OpCode::LoadI => {
                        self.state.stack[ra] = LuaValue::Integer(instr.get_sbx() as i64);
                    }
                    OpCode::LoadF => {
                        self.state.stack[ra] = LuaValue::Float(instr.get_sbx() as f64);
                    }
                    OpCode::LoadK => {
                        self.state.stack[ra] = k[instr.get_bx() as usize];
                    }
                    OpCode::LoadKX => {
                        let ax = code[pc].get_ax() as usize;
                        pc += 1;
                        self.state.stack[ra] = k[ax];
                    }
                    OpCode::LoadFalse => {
                        self.state.stack[ra] = LuaValue::Boolean(false);
                    }
                    OpCode::LFalseSkip => {
                        self.state.stack[ra] = LuaValue::Boolean(false);
                        pc += 1;
                    }
                    OpCode::LoadTrue => {
                        self.state.stack[ra] = LuaValue::Boolean(true);
                    }
                    OpCode::LoadNil => {
                        let b = instr.get_b() as usize;
                        for slot in &mut self.state.stack[ra..=ra + b] {
                            *slot = LuaValue::Nil;
                        }
                    }
                    OpCode::GetUpval => {
                        let uid = self.closure_upvalue_id(fid, instr.get_b() as usize)?;
                        self.state.stack[ra] = self.upvalue_get(uid);
                    }
                    OpCode::SetUpval => {
                        let uid = self.closure_upvalue_id(fid, instr.get_b() as usize)?;
                        self.upvalue_set(uid, self.state.stack[ra]);
                    }
                    OpCode::GetTabUp => {
                        let b = instr.get_b() as usize;
                        let uid = self.closure_upvalue_id(fid, b)?;
                        let t = self.upvalue_get(uid);
                        let key = k[instr.get_c() as usize];
                        let v = self.get_table_value(t, key, ValueSource::Upvalue(b))?;
                        self.state.stack[ra] = v;
                    }
                    OpCode::GetTable => {
                        let rb = base + instr.get_b() as usize;
                        let t = self.state.stack[rb];
                        let key = self.state.stack[base + instr.get_c() as usize];
                        let v = match (t, key) {
                            (LuaValue::Table(id), LuaValue::Integer(i)) => {
                                let v = self.pool.tables[id].get_int(i);
                                if v.is_nil() {
                                    self.get_table_value(t, key, ValueSource::Stack(rb))?
                                } else {
                                    v
                                }
                            }
                            _ => self.get_table_value(t, key, ValueSource::Stack(rb))?,
                        };
                        self.state.stack[ra] = v;
                    }
                    OpCode::GetI => {
                        let rb = base + instr.get_b() as usize;
                        let t = self.state.stack[rb];
                        let key = LuaValue::Integer(instr.get_c() as i64);
                        let v = self.get_table_value(t, key, ValueSource::Stack(rb))?;
                        self.state.stack[ra] = v;
                    }
                    OpCode::GetField => {
                        let rb = base + instr.get_b() as usize;
                        let t = self.state.stack[rb];
                        let key = k[instr.get_c() as usize];
                        let v = self.get_table_value(t, key, ValueSource::Stack(rb))?;
                        self.state.stack[ra] = v;
                    }
                    OpCode::SetTabUp => {
                        let uid = self.closure_upvalue_id(fid, a)?;
                        let t = self.upvalue_get(uid);
                        let key = k[instr.get_b() as usize];
                        let value = self.rk(instr, base, k);
                        self.set_table_value(t, key, value, ValueSource::Upvalue(a))?;
                    }
                    OpCode::SetTable => {
                        let t = self.state.stack[ra];
                        let key = self.state.stack[base + instr.get_b() as usize];
                        let value = self.rk(instr, base, k);
                        self.set_table_value(t, key, value, ValueSource::Stack(ra))?;
                    }
                    OpCode::SetI => {
                        let t = self.state.stack[ra];
                        let key = LuaValue::Integer(instr.get_b() as i64);
                        let value = self.rk(instr, base, k);
                        self.set_table_value(t, key, value, ValueSource::Stack(ra))?;
                    }
                    OpCode::SetField => {
                        let t = self.state.stack[ra];
                        let key = k[instr.get_b() as usize];
                        let value = self.rk(instr, base, k);
                        self.set_table_value(t, key, value, ValueSource::Stack(ra))?;
                    }
                    OpCode::NewTable => {
                        let mut hash_size = instr.get_b() as usize;
                        if hash_size > 0 {
                            hash_size = 1 << (hash_size - 1);
                        }
                        let mut array_size = instr.get_c() as usize;
                        if instr.get_k() {
                            array_size += code[pc].get_ax() as usize * (Instruction::MAX_C as usize + 1);
                        }
                        pc += 1;
                        self.state.stack[ra] = self.create_table(array_size, hash_size);
                        self.gc_check()?;
                    }
                    OpCode::Self_ => {
                        let rb = base + instr.get_b() as usize;
                        let t = self.state.stack[rb];
                        let key = self.rk(instr, base, k);
                        self.state.stack[ra + 1] = t;
                        let v = self.get_table_value(t, key, ValueSource::Stack(rb))?;
                        self.state.stack[ra] = v;
                    }

                    OpCode::Add => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = match (self.state.stack[b], self.state.stack[c]) {
                            (LuaValue::Integer(x), LuaValue::Integer(y)) => LuaValue::Integer(x.wrapping_add(y)),
                            (LuaValue::Float(x), LuaValue::Float(y)) => LuaValue::Float(x + y),
                            _ => self.arith_slots(TmKind::Add, b, c)?,
                        };
                    }
                    OpCode::Sub => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = match (self.state.stack[b], self.state.stack[c]) {
                            (LuaValue::Integer(x), LuaValue::Integer(y)) => LuaValue::Integer(x.wrapping_sub(y)),
                            (LuaValue::Float(x), LuaValue::Float(y)) => LuaValue::Float(x - y),
                            _ => self.arith_slots(TmKind::Sub, b, c)?,
                        };
                    }
                    OpCode::Mul => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = match (self.state.stack[b], self.state.stack[c]) {
                            (LuaValue::Integer(x), LuaValue::Integer(y)) => LuaValue::Integer(x.wrapping_mul(y)),
                            (LuaValue::Float(x), LuaValue::Float(y)) => LuaValue::Float(x * y),
                            _ => self.arith_slots(TmKind::Mul, b, c)?,
                        };
                    }
                    OpCode::Mod => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = self.arith_slots(TmKind::Mod, b, c)?;
                    }
                    OpCode::Pow => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = self.arith_slots(TmKind::Pow, b, c)?;
                    }
                    OpCode::Div => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = self.arith_slots(TmKind::Div, b, c)?;
                    }
                    OpCode::IDiv => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = self.arith_slots(TmKind::IDiv, b, c)?;
                    }
                    OpCode::BAnd => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = self.arith_slots(TmKind::BAnd, b, c)?;
                    }
                    OpCode::BOr => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = self.arith_slots(TmKind::BOr, b, c)?;
                    }
                    OpCode::BXor => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = self.arith_slots(TmKind::BXor, b, c)?;
                    }
                    OpCode::Shl => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = self.arith_slots(TmKind::Shl, b, c)?;
                    }
                    OpCode::Shr => {
                        let (b, c) = (base + instr.get_b() as usize, base + instr.get_c() as usize);
                        self.state.stack[ra] = self.arith_slots(TmKind::Shr, b, c)?;
                    }
                    OpCode::Unm => {
                        let b = base + instr.get_b() as usize;
                        self.state.stack[ra] = match self.state.stack[b] {
                            LuaValue::Integer(x) => LuaValue::Integer(x.wrapping_neg()),
                            LuaValue::Float(x) => LuaValue::Float(-x),
                            _ => self.arith_slots(TmKind::Unm, b, b)?,
                        };
                    }
                    OpCode::BNot => {
                        let b = base + instr.get_b() as usize;
                        self.state.stack[ra] = self.arith_slots(TmKind::BNot, b, b)?;
                    }
                    OpCode::Not => {
                        let rb = self.state.stack[base + instr.get_b() as usize];
                        self.state.stack[ra] = LuaValue::Boolean(rb.is_falsy());
                    }
                    OpCode::Len => {
                        let b = base + instr.get_b() as usize;
                        let v = self.state.stack[b];
                        self.state.stack[ra] = self.len_of(v, ValueSource::Stack(b))?;
                    }
                    OpCode::Concat => {
                        let n = instr.get_b() as usize;
                        self.concat(ra, n)?;
                        self.gc_check()?;
                    }
                    OpCode::Close => {
                        self.close_upvalues(ra);
                        self.close_tbc(ra)?;
                    }
                    OpCode::Tbc => {
                        self.mark_tbc(ra)?;
                    }
                    OpCode::Jmp => {
                        pc = (pc as isize + instr.get_sj() as isize) as usize;
                    }
                    OpCode::Eq => {
                        let va = self.state.stack[ra];
                        let vb = self.state.stack[base + instr.get_b() as usize];
                        let cond = self.equal_values(va, vb)?;
                        if cond != instr.get_k() {
                            pc += 1;
                        }
                    }
                    OpCode::Lt => {
                        let va = self.state.stack[ra];
                        let vb = self.state.stack[base + instr.get_b() as usize];
                        let cond = match (va, vb) {
                            (LuaValue::Integer(x), LuaValue::Integer(y)) => x < y,
                            (LuaValue::Float(x), LuaValue::Float(y)) => x < y,
                            _ => self.less_than(va, vb)?,
                        };
                        if cond != instr.get_k() {
                            pc += 1;
                        }
                    }
                    OpCode::Le => {
                        let va = self.state.stack[ra];
                        let vb = self.state.stack[base + instr.get_b() as usize];
                        let cond = match (va, vb) {
                            (LuaValue::Integer(x), LuaValue::Integer(y)) => x <= y,
                            (LuaValue::Float(x), LuaValue::Float(y)) => x <= y,
                            _ => self.less_equal(va, vb)?,
                        };
                        if cond != instr.get_k() {
                            pc += 1;
                        }
                    }
                    OpCode::EqK => {
                        let cond = self.state.stack[ra].raw_equal(&k[instr.get_b() as usize]);
                        if cond != instr.get_k() {
                            pc += 1;
                        }
                    }
                    OpCode::Test => {
                        if self.state.stack[ra].is_truthy() != instr.get_k() {
                            pc += 1;
                        }
                    }
                    OpCode::TestSet => {
                        let rb = self.state.stack[base + instr.get_b() as usize];
                        if rb.is_falsy() == instr.get_k() {
                            pc += 1;
                        } else {
                            self.state.stack[ra] = rb;
                        }
                    }

                    OpCode::Call => {
                        let b = instr.get_b() as usize;
                        let nresults = instr.get_c() as i32 - 1;
                        if b != 0 {
                            self.state.top = ra + b;
                        }
                        if self.precall(ra, nresults)? {
                            continue 'newframe;
                        }
                        if nresults >= 0 {
                            self.state.top = self.state.call_infos[ci_index].top;
                        }
                    }
                    OpCode::TailCall => {
                        let b = instr.get_b() as usize;
                        if b != 0 {
                            self.state.top = ra + b;
                        }
                        let callee = match self.state.stack[ra] {
                            LuaValue::Function(id) => match &self.pool.functions[id] {
                                LuaFunction::Lua(c) => Some(c.proto.clone()),
                                LuaFunction::Host(_) => None,
                            },
                            _ => None,
                        };
                        match callee {
                            Some(_) => {
                                self.close_upvalues(base);
                                self.tail_call_lua(ci_index, ra, &proto)?;
                                continue 'newframe;
                            }
                            None => {
                                // Natives and callable objects run as a plain call;
                                // the RETURN that follows hands back their results
                                if self.precall(ra, -1)? {
                                    continue 'newframe;
                                }
                            }
                        }
                    }
                    OpCode::Return => {
                        let b = instr.get_b() as usize;
                        let n = if b != 0 { b - 1 } else { self.state.top.saturating_sub(ra) };
                        self.state.top = ra + n;
                        self.close_upvalues(base);
                        if instr.get_k() {
                            self.close_tbc(base)?;
                        }
                        if proto.chunk.is_vararg {
                            let ci = &mut self.state.call_infos[ci_index];
                            ci.func -= ci.nextraargs + proto.chunk.param_count + 1;
                        }
                        self.poscall(ra, n);
                        continue 'newframe;
                    }

                    OpCode::ForLoop => {
                        if self.for_loop(ra) {
                            pc -= instr.get_bx() as usize;
                        }
                    }
                    OpCode::ForPrep => {
                        if self.for_prep(ra)? {
                            pc += instr.get_bx() as usize + 1;
                        }
                    }
                    OpCode::TForPrep => {
                        self.mark_tbc(ra + 3)?;
                        pc += instr.get_bx() as usize;
                    }
                    OpCode::TForCall => {
                        // Copy iterator, state and control above the loop variables
                        self.state.stack.copy_within(ra..ra + 3, ra + 4);
                        self.state.top = ra + 4 + 3;
                        if self.precall(ra + 4, instr.get_c() as i32)? {
                            continue 'newframe;
                        }
                        self.state.top = self.state.call_infos[ci_index].top;
                    }
                    OpCode::TForLoop => {
                        let control = self.state.stack[ra + 4];
                        if !control.is_nil() {
                            self.state.stack[ra + 2] = control;
                            pc -= instr.get_bx() as usize;
                        }
                    }

                    OpCode::SetList => {
                        let mut n = instr.get_b() as usize;
                        if n == 0 {
                            n = self.state.top.saturating_sub(ra + 1);
                        }
                        let mut last = instr.get_c() as usize;
                        if instr.get_k() {
                            last += code[pc].get_ax() as usize * (Instruction::MAX_C as usize + 1);
                            pc += 1;
                        }
                        let LuaValue::Table(tid) = self.state.stack[ra] else {
                            return Err(self.frame_error());
                        };
                        self.set_list(tid, ra + 1, n, last);
                        self.state.top = self.state.call_infos[ci_index].top;
                    }
                    OpCode::Closure => {
                        let child = proto.child_protos[instr.get_bx() as usize].clone();
                        let closure = self.push_closure(child, fid, base)?;
                        self.state.stack[ra] = LuaValue::Function(closure);
                        self.gc_check()?;
                    }
                    OpCode::Vararg => {
                        let wanted = instr.get_c() as i32 - 1;
                        let ci = &self.state.call_infos[ci_index];
                        let nextra = ci.nextraargs;
                        let src = ci.func - nextra;
                        let n = if wanted < 0 { nextra } else { wanted as usize };
                        self.grow_stack(ra + n + EXTRA_STACK)?;
                        for j in 0..n {
                            self.state.stack[ra + j] = if j < nextra {
                                self.state.stack[src + j]
                            } else {
                                LuaValue::Nil
                            };
                        }
                        if wanted < 0 {
                            self.state.top = ra + n;
                        }
                    }
                    OpCode::VarargPrep => {
                        self.adjust_varargs(ci_index, &proto)?;
                        base = self.state.call_infos[ci_index].base;
                    }
                    OpCode::ExtraArg => {
                        return Err(self.frame_error());
                    }
                }
            }
        }
    }

    /// Value of an RK operand: constant C when k is set, register C otherwise
    #[inline(always)]
    fn rk(&self, instr: Instruction, base: usize, k: &[LuaValue]) -> LuaValue {
        let c = instr.get_c() as usize;
        if instr.get_k() {
            k[c]
        } else {
            self.state.stack[base + c]
        }
    }

    fn arith_slots(&mut self, op: TmKind, b: usize, c: usize) -> LuaResult<LuaValue> {
        let (vb, vc) = (self.state.stack[b], self.state.stack[c]);
        self.arith(op, vb, vc, ValueSource::Stack(b), ValueSource::Stack(c))
    }

    /// Move varargs below the frame: the function and fixed parameters are
    /// copied above the actual arguments, which stay in place as the extra ones
    fn adjust_varargs(&mut self, ci_index: usize, proto: &crate::lua_value::Proto) -> LuaResult<()> {
        let func = self.state.call_infos[ci_index].func;
        let nfix = proto.chunk.param_count;
        let actual = self.state.top - func - 1;
        let nextra = actual - nfix;
        let frame_size = proto.chunk.max_stack_size;
        let new_func = self.state.top;
        self.grow_stack(new_func + 1 + nfix.max(frame_size) + EXTRA_STACK)?;
        self.state.stack[new_func] = self.state.stack[func];
        for i in 1..=nfix {
            self.state.stack[new_func + i] = self.state.stack[func + i];
            self.state.stack[func + i] = LuaValue::Nil;
        }
        let ci = &mut self.state.call_infos[ci_index];
        ci.func = new_func;
        ci.base = new_func + 1;
        ci.top = new_func + 1 + frame_size;
        ci.nextraargs = nextra;
        self.state.top = ci.top;
        Ok(())
    }

    /// Numeric for loop setup; returns true when the loop must be skipped
    fn for_prep(&mut self, ra: usize) -> LuaResult<bool> {
        let init = self.state.stack[ra];
        let limit = self.state.stack[ra + 1];
        let step = self.state.stack[ra + 2];
        if let (LuaValue::Integer(init), LuaValue::Integer(step)) = (init, step) {
            if step == 0 {
                return Err(self.runtime_error(RuntimeErrorKind::Type, "'for' step is zero"));
            }
            self.state.stack[ra + 3] = LuaValue::Integer(init);
            let Some(limit) = self.for_limit(init, limit, step)? else {
                return Ok(true);
            };
            // Iteration count, computed without overflow
            let count = if step > 0 {
                (limit as u64).wrapping_sub(init as u64) / step as u64
            } else {
                let divisor = (-(step + 1)) as u64 + 1;
                (init as u64).wrapping_sub(limit as u64) / divisor
            };
            self.state.stack[ra + 1] = LuaValue::Integer(count as i64);
            return Ok(false);
        }

        let Some(flimit) = self.to_number(&limit).and_then(|v| v.as_number()) else {
            return Err(self.for_error(limit, "limit"));
        };
        let Some(fstep) = self.to_number(&step).and_then(|v| v.as_number()) else {
            return Err(self.for_error(step, "step"));
        };
        let Some(finit) = self.to_number(&init).and_then(|v| v.as_number()) else {
            return Err(self.for_error(init, "initial value"));
        };
        if fstep == 0.0 {
            return Err(self.runtime_error(RuntimeErrorKind::Type, "'for' step is zero"));
        }
        let skip = if fstep > 0.0 { flimit < finit } else { finit < flimit };
        if skip {
            return Ok(true);
        }
        self.state.stack[ra] = LuaValue::Float(finit);
        self.state.stack[ra + 1] = LuaValue::Float(flimit);
        self.state.stack[ra + 2] = LuaValue::Float(fstep);
        self.state.stack[ra + 3] = LuaValue::Float(finit);
        Ok(false)
    }

    /// Integer loop limit, clipped to the integer range; None when the
    /// loop must not run at all
    fn for_limit(&mut self, init: i64, limit: LuaValue, step: i64) -> LuaResult<Option<i64>> {
        let limit = match self.to_number(&limit) {
            Some(LuaValue::Integer(i)) => i,
            Some(LuaValue::Float(f)) => {
                let clipped = if step < 0 {
                    crate::lua_value::float_ceil_to_integer(f)
                } else {
                    crate::lua_value::float_floor_to_integer(f)
                };
                match clipped {
                    Some(i) => i,
                    None if f.is_nan() => return Ok(None),
                    // Out of range: clip to the integer range, or skip when
                    // the limit is on the wrong side of every integer
                    None if f > 0.0 => {
                        if step < 0 {
                            return Ok(None);
                        }
                        i64::MAX
                    }
                    None => {
                        if step > 0 {
                            return Ok(None);
                        }
                        i64::MIN
                    }
                }
            }
            _ => return Err(self.for_error(limit, "limit")),
        };
        let skip = if step > 0 { init > limit } else { init < limit };
        Ok(if skip { None } else { Some(limit) })
    }

    fn for_error(&mut self, v: LuaValue, what: &str) -> LuaError {
        let name = self.type_name_with_meta(&v);
        self.runtime_error(
            RuntimeErrorKind::Type,
            format!("bad 'for' {what} (number expected, got {name})"),
        )
    }

    /// Numeric for loop step; returns true to jump back into the body
    fn for_loop(&mut self, ra: usize) -> bool {
        match self.state.stack[ra + 2] {
            LuaValue::Integer(step) => {
                let LuaValue::Integer(count) = self.state.stack[ra + 1] else {
                    return false;
                };
                let count = count as u64;
                if count == 0 {
                    return false;
                }
                self.state.stack[ra + 1] = LuaValue::Integer((count - 1) as i64);
                let LuaValue::Integer(idx) = self.state.stack[ra] else {
                    return false;
                };
                let idx = idx.wrapping_add(step);
                self.state.stack[ra] = LuaValue::Integer(idx);
                self.state.stack[ra + 3] = LuaValue::Integer(idx);
                true
            }
            LuaValue::Float(step) => {
                let (LuaValue::Float(idx), LuaValue::Float(limit)) =
                    (self.state.stack[ra], self.state.stack[ra + 1])
                else {
                    return false;
                };
                let idx = idx + step;
                let go_on = if step > 0.0 { idx <= limit } else { limit <= idx };
                if go_on {
                    self.state.stack[ra] = LuaValue::Float(idx);
                    self.state.stack[ra + 3] = LuaValue::Float(idx);
                }
                go_on
            }
            _ => false,
        }
    }
}
