// Statements, blocks, local scopes, labels and gotos.

use smol_str::SmolStr;

use super::Parser;
use super::expdesc::{ExpDesc, ExpKind, NO_JUMP};
use super::func_state::{BlockCnt, LabelDesc, VarDesc, VarKind};
use super::lexer::Token;
use crate::lua_vm::lua_limits::MAXVARS;
use crate::lua_vm::{Instruction, LuaError, LuaResult, OpCode};

impl Parser<'_> {
    // ===== Token helpers =====

    fn error_expected(&self, token: &Token) -> LuaError {
        self.lex.syntax_error(&format!("{} expected", token.describe()))
    }

    pub(super) fn test_next(&mut self, token: &Token) -> LuaResult<bool> {
        if self.lex.token == *token {
            self.lex.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(super) fn check(&self, token: &Token) -> LuaResult<()> {
        if self.lex.token != *token {
            return Err(self.error_expected(token));
        }
        Ok(())
    }

    pub(super) fn check_next(&mut self, token: &Token) -> LuaResult<()> {
        self.check(token)?;
        self.lex.next()
    }

    /// Closing token `what` for the `who` opened at `line`
    pub(super) fn check_match(&mut self, what: &Token, who: &Token, line: u32) -> LuaResult<()> {
        if self.test_next(what)? {
            return Ok(());
        }
        if line == self.lex.line {
            Err(self.error_expected(what))
        } else {
            Err(self.lex.syntax_error(&format!(
                "{} expected (to close {} at line {})",
                what.describe(),
                who.describe(),
                line
            )))
        }
    }

    pub(super) fn str_checkname(&mut self) -> LuaResult<SmolStr> {
        if let Token::Name(name) = &self.lex.token {
            let name = name.clone();
            self.lex.next()?;
            Ok(name)
        } else {
            Err(self.error_expected(&Token::Name(SmolStr::default())))
        }
    }

    fn block_follow(&self, with_until: bool) -> bool {
        match self.lex.token {
            Token::Else | Token::ElseIf | Token::End | Token::Eos => true,
            Token::Until => with_until,
            _ => false,
        }
    }

    // ===== Local variables =====

    /// Declare a local; it becomes visible with `adjust_local_vars`
    pub(super) fn new_localvar(&mut self, name: SmolStr, kind: VarKind) -> LuaResult<usize> {
        let level = self.enclosing.len();
        if self.actvar.len() + 1 - self.fs.first_local > MAXVARS {
            return Err(self.error_limit(level, MAXVARS, "local variables"));
        }
        self.actvar.push(VarDesc {
            name,
            kind,
            ridx: 0,
            pidx: 0,
        });
        Ok(self.actvar.len() - 1 - self.fs.first_local)
    }

    /// Activate the last `nvars` declared locals
    pub(super) fn adjust_local_vars(&mut self, nvars: u32) {
        let mut reg = self.fs.nactvar;
        for _ in 0..nvars {
            let at = self.fs.first_local + self.fs.nactvar as usize;
            self.fs.nactvar += 1;
            let name = self.actvar[at].name.clone();
            let pidx = self.fs.register_local(name);
            let vd = &mut self.actvar[at];
            vd.ridx = reg;
            vd.pidx = pidx;
            reg += 1;
        }
    }

    fn remove_vars(&mut self, tolevel: u32) {
        let pc = self.fs.pc() as u32;
        while self.fs.nactvar > tolevel {
            self.fs.nactvar -= 1;
            let pidx = self.actvar[self.fs.first_local + self.fs.nactvar as usize].pidx;
            if let Some(local) = self.fs.chunk.locals.get_mut(pidx) {
                local.end_pc = pc;
            }
        }
        self.actvar.truncate(self.fs.first_local + tolevel as usize);
    }

    pub(super) fn set_vararg(&mut self, nparams: u32) {
        self.fs.chunk.is_vararg = true;
        self.code_abc(OpCode::VarargPrep, nparams, 0, 0);
    }

    /// Closing the current block closes a to-be-closed variable
    fn mark_to_be_closed(&mut self) {
        if let Some(bl) = self.fs.blocks.last_mut() {
            bl.upval = true;
            bl.inside_tbc = true;
        }
        self.fs.needclose = true;
    }

    fn check_readonly(&self, e: &ExpDesc) -> LuaResult<()> {
        let name = match e.kind {
            ExpKind::Local => {
                let vd = &self.actvar[self.fs.first_local + e.var.vidx];
                (vd.kind != VarKind::Regular).then(|| vd.name.clone())
            }
            ExpKind::Upval => {
                let idx = e.info as usize;
                (self.fs.upvalue_kinds[idx] != VarKind::Regular)
                    .then(|| self.fs.chunk.upvalue_descs[idx].name.clone())
            }
            _ => None,
        };
        match name {
            Some(name) => Err(self
                .lex
                .semantic_error(&format!("attempt to assign to const variable '{name}'"))),
            None => Ok(()),
        }
    }

    /// Adjust `nexps` values to `nvars` registers
    fn adjust_assign(&mut self, nvars: u32, nexps: u32, e: &mut ExpDesc) -> LuaResult<()> {
        let needed = nvars as i32 - nexps as i32;
        if e.kind.has_multret() {
            let extra = (needed + 1).max(0);
            self.set_returns(e, extra)?;
        } else {
            if e.kind != ExpKind::Void {
                self.exp2nextreg(e)?;
            }
            if needed > 0 {
                self.code_nil(self.fs.freereg, needed as u32);
            }
        }
        if needed > 0 {
            self.reserve_regs(needed as u32)?;
        } else {
            self.fs.freereg = (self.fs.freereg as i32 + needed) as u32;
        }
        Ok(())
    }

    // ===== Blocks =====

    pub(super) fn enter_block(&mut self, is_loop: bool) {
        let inside_tbc = self.fs.blocks.last().is_some_and(|bl| bl.inside_tbc);
        self.fs.blocks.push(BlockCnt {
            first_label: self.labels.len(),
            first_goto: self.gotos.len(),
            nactvar: self.fs.nactvar,
            upval: false,
            is_loop,
            inside_tbc,
        });
    }

    pub(super) fn leave_block(&mut self) -> LuaResult<()> {
        let Some(bl) = self.fs.blocks.last().cloned() else {
            return Ok(());
        };
        let stklevel = bl.nactvar;
        self.remove_vars(bl.nactvar);
        let has_close = if bl.is_loop {
            self.create_label(SmolStr::new_static("break"), 0, false)?
        } else {
            false
        };
        let nested = self.fs.blocks.len() > 1;
        if !has_close && nested && bl.upval {
            self.code_abc(OpCode::Close, stklevel, 0, 0);
        }
        self.fs.freereg = stklevel;
        self.labels.truncate(bl.first_label);
        self.fs.blocks.pop();
        if nested {
            self.move_gotos_out(&bl);
        } else if let Some(gt) = self.gotos.get(bl.first_goto) {
            return Err(self.undef_goto(gt));
        }
        Ok(())
    }

    /// Pending gotos of a closed block now leave from its parent
    fn move_gotos_out(&mut self, bl: &BlockCnt) {
        for gt in &mut self.gotos[bl.first_goto..] {
            if gt.nactvar > bl.nactvar {
                gt.close |= bl.upval;
            }
            gt.nactvar = bl.nactvar;
        }
    }

    fn undef_goto(&self, gt: &LabelDesc) -> LuaError {
        let msg = if gt.name == "break" {
            format!("break outside a loop at line {}", gt.line)
        } else {
            format!("no visible label '{}' for <goto> at line {}", gt.name, gt.line)
        };
        self.lex.semantic_error(&msg)
    }

    pub(super) fn block(&mut self) -> LuaResult<()> {
        self.enter_block(false);
        self.statlist()?;
        self.leave_block()
    }

    /// Code run when the outermost block of a function ends
    pub(super) fn finish_func(&mut self) -> LuaResult<()> {
        self.ret(self.fs.nactvar, 0);
        self.leave_block()?;
        self.finish_code()
    }

    // ===== Labels and gotos =====

    fn find_label(&self, name: &str) -> Option<&LabelDesc> {
        self.labels[self.fs.first_label..].iter().find(|lb| lb.name == name)
    }

    /// Declare a label at the current pc and resolve the pending gotos
    /// to it. True when a CLOSE was emitted for them.
    fn create_label(&mut self, name: SmolStr, line: u32, last: bool) -> LuaResult<bool> {
        let pc = self.get_label();
        let nactvar = match self.fs.blocks.last() {
            // Locals are already out of scope at the end of a block
            Some(bl) if last => bl.nactvar,
            _ => self.fs.nactvar,
        };
        let label = LabelDesc {
            name,
            pc,
            line,
            nactvar,
            close: false,
        };
        let needs_close = self.solve_gotos(&label)?;
        self.labels.push(label);
        if needs_close {
            self.code_abc(OpCode::Close, self.fs.nactvar, 0, 0);
        }
        Ok(needs_close)
    }

    fn solve_gotos(&mut self, label: &LabelDesc) -> LuaResult<bool> {
        let mut i = self.fs.blocks.last().map_or(0, |bl| bl.first_goto);
        let mut needs_close = false;
        while i < self.gotos.len() {
            if self.gotos[i].name == label.name {
                let gt = self.gotos.remove(i);
                needs_close |= gt.close;
                if gt.nactvar < label.nactvar {
                    let var = &self.actvar[self.fs.first_local + gt.nactvar as usize].name;
                    return Err(self.lex.semantic_error(&format!(
                        "<goto {}> at line {} jumps into the scope of local '{}'",
                        gt.name, gt.line, var
                    )));
                }
                self.patch_list(gt.pc as isize, label.pc)?;
            } else {
                i += 1;
            }
        }
        Ok(needs_close)
    }

    fn gotostat(&mut self) -> LuaResult<()> {
        let line = self.lex.line;
        let name = self.str_checkname()?;
        if let Some(lb) = self.find_label(&name) {
            // Backward jump
            let (lb_level, lb_pc) = (lb.nactvar, lb.pc);
            if self.fs.nactvar > lb_level {
                self.code_abc(OpCode::Close, lb_level, 0, 0);
            }
            let j = self.jump();
            self.patch_list(j as isize, lb_pc)
        } else {
            let pc = self.jump();
            self.gotos.push(LabelDesc {
                name,
                pc,
                line,
                nactvar: self.fs.nactvar,
                close: false,
            });
            Ok(())
        }
    }

    fn breakstat(&mut self) -> LuaResult<()> {
        let line = self.lex.line;
        self.lex.next()?;
        let pc = self.jump();
        self.gotos.push(LabelDesc {
            name: SmolStr::new_static("break"),
            pc,
            line,
            nactvar: self.fs.nactvar,
            close: false,
        });
        Ok(())
    }

    fn labelstat(&mut self, name: SmolStr, line: u32) -> LuaResult<()> {
        self.check_next(&Token::DbColon)?;
        while matches!(self.lex.token, Token::Char(b';') | Token::DbColon) {
            self.statement()?;
        }
        if let Some(lb) = self.find_label(&name) {
            return Err(self
                .lex
                .semantic_error(&format!("label '{}' already defined on line {}", name, lb.line)));
        }
        let last = self.block_follow(false);
        self.create_label(name, line, last)?;
        Ok(())
    }

    // ===== Statements =====

    pub(super) fn statlist(&mut self) -> LuaResult<()> {
        while !self.block_follow(true) {
            if self.lex.token == Token::Return {
                // 'return' must be the last statement
                return self.statement();
            }
            self.statement()?;
        }
        Ok(())
    }

    fn statement(&mut self) -> LuaResult<()> {
        let line = self.lex.line;
        self.enter_level()?;
        match self.lex.token {
            Token::Char(b';') => self.lex.next()?,
            Token::If => self.ifstat(line)?,
            Token::While => self.whilestat(line)?,
            Token::Do => {
                self.lex.next()?;
                self.block()?;
                self.check_match(&Token::End, &Token::Do, line)?;
            }
            Token::For => self.forstat(line)?,
            Token::Repeat => self.repeatstat(line)?,
            Token::Function => self.funcstat(line)?,
            Token::Local => {
                self.lex.next()?;
                if self.test_next(&Token::Function)? {
                    self.localfunc()?;
                } else {
                    self.localstat()?;
                }
            }
            Token::DbColon => {
                self.lex.next()?;
                let name = self.str_checkname()?;
                self.labelstat(name, line)?;
            }
            Token::Return => {
                self.lex.next()?;
                self.retstat()?;
            }
            Token::Break => self.breakstat()?,
            Token::Goto => {
                self.lex.next()?;
                self.gotostat()?;
            }
            _ => self.exprstat()?,
        }
        debug_assert!(self.fs.chunk.max_stack_size >= self.fs.freereg as usize);
        self.fs.freereg = self.fs.nactvar;
        self.leave_level();
        Ok(())
    }

    /// Condition of a loop or branch; returns its false exit list
    fn cond(&mut self) -> LuaResult<isize> {
        let mut v = self.expr()?;
        if v.kind == ExpKind::Nil {
            v.kind = ExpKind::False;
        }
        self.go_if_true(&mut v)?;
        Ok(v.f)
    }

    /// `[if | elseif] cond then block`
    fn test_then_block(&mut self, escapelist: &mut isize) -> LuaResult<()> {
        self.lex.next()?;
        let mut v = self.expr()?;
        self.check_next(&Token::Then)?;
        self.go_if_true(&mut v)?;
        self.enter_block(false);
        let jf = v.f;
        self.statlist()?;
        self.leave_block()?;
        if matches!(self.lex.token, Token::Else | Token::ElseIf) {
            let j = self.jump();
            self.concat_jumps(escapelist, j as isize)?;
        }
        self.patch_to_here(jf)
    }

    fn ifstat(&mut self, line: u32) -> LuaResult<()> {
        let mut escapelist = NO_JUMP;
        self.test_then_block(&mut escapelist)?;
        while self.lex.token == Token::ElseIf {
            self.test_then_block(&mut escapelist)?;
        }
        if self.test_next(&Token::Else)? {
            self.block()?;
        }
        self.check_match(&Token::End, &Token::If, line)?;
        self.patch_to_here(escapelist)
    }

    fn whilestat(&mut self, line: u32) -> LuaResult<()> {
        self.lex.next()?;
        let init = self.get_label();
        let exit = self.cond()?;
        self.enter_block(true);
        self.check_next(&Token::Do)?;
        self.block()?;
        let back = self.jump();
        self.patch_list(back as isize, init)?;
        self.check_match(&Token::End, &Token::While, line)?;
        self.leave_block()?;
        self.patch_to_here(exit)
    }

    fn repeatstat(&mut self, line: u32) -> LuaResult<()> {
        let init = self.get_label();
        self.enter_block(true);
        // The condition sees the body's locals
        self.enter_block(false);
        self.lex.next()?;
        self.statlist()?;
        self.check_match(&Token::Until, &Token::Repeat, line)?;
        let mut exit = self.cond()?;
        let scope = self.fs.blocks.last().cloned();
        self.leave_block()?;
        if let Some(scope) = scope
            && scope.upval
        {
            // Repeating must close the captured locals first
            let normal_exit = self.jump();
            self.patch_to_here(exit)?;
            self.code_abc(OpCode::Close, scope.nactvar, 0, 0);
            exit = self.jump() as isize;
            self.patch_to_here(normal_exit as isize)?;
        }
        self.patch_list(exit, init)?;
        self.leave_block()
    }

    /// Expression into the next register
    fn exp1(&mut self) -> LuaResult<()> {
        let mut e = self.expr()?;
        self.exp2nextreg(&mut e)
    }

    /// Patch the Bx jump of a FORPREP or FORLOOP
    fn fix_for_jump(&mut self, pc: usize, dest: usize, back: bool) -> LuaResult<()> {
        let mut offset = dest as i64 - (pc as i64 + 1);
        if back {
            offset = -offset;
        }
        if offset > Instruction::MAX_BX as i64 {
            return Err(self.lex.syntax_error("control structure too long"));
        }
        self.fs.chunk.code[pc].set_bx(offset as u32);
        Ok(())
    }

    fn forbody(&mut self, base: u32, line: u32, nvars: u32, generic: bool) -> LuaResult<()> {
        self.check_next(&Token::Do)?;
        let prep_op = if generic { OpCode::TForPrep } else { OpCode::ForPrep };
        let prep = self.code_abx(prep_op, base, 0);
        self.enter_block(false);
        self.adjust_local_vars(nvars);
        self.reserve_regs(nvars)?;
        self.block()?;
        self.leave_block()?;
        let here = self.get_label();
        self.fix_for_jump(prep, here, false)?;
        if generic {
            self.code_abc(OpCode::TForCall, base, 0, nvars);
            self.fix_line(line);
        }
        let loop_op = if generic { OpCode::TForLoop } else { OpCode::ForLoop };
        let endfor = self.code_abx(loop_op, base, 0);
        self.fix_for_jump(endfor, prep + 1, true)?;
        self.fix_line(line);
        Ok(())
    }

    /// `for name = init, limit [, step] do block end`
    fn fornum(&mut self, varname: SmolStr, line: u32) -> LuaResult<()> {
        let base = self.fs.freereg;
        for _ in 0..3 {
            self.new_localvar(SmolStr::new_static("(for state)"), VarKind::Regular)?;
        }
        self.new_localvar(varname, VarKind::Regular)?;
        self.check_next(&Token::Char(b'='))?;
        self.exp1()?;
        self.check_next(&Token::Char(b','))?;
        self.exp1()?;
        if self.test_next(&Token::Char(b','))? {
            self.exp1()?;
        } else {
            self.load_int(self.fs.freereg, 1);
            self.reserve_regs(1)?;
        }
        self.adjust_local_vars(3);
        self.forbody(base, line, 1, false)
    }

    /// `for names in explist do block end`
    fn forlist(&mut self, first: SmolStr) -> LuaResult<()> {
        let base = self.fs.freereg;
        // Generator, state, control and closing value
        for _ in 0..4 {
            self.new_localvar(SmolStr::new_static("(for state)"), VarKind::Regular)?;
        }
        self.new_localvar(first, VarKind::Regular)?;
        let mut nvars = 1;
        while self.test_next(&Token::Char(b','))? {
            let name = self.str_checkname()?;
            self.new_localvar(name, VarKind::Regular)?;
            nvars += 1;
        }
        self.check_next(&Token::In)?;
        let line = self.lex.line;
        let (mut e, nexps) = self.explist()?;
        self.adjust_assign(4, nexps, &mut e)?;
        self.adjust_local_vars(4);
        self.mark_to_be_closed();
        // Room to call the generator
        self.check_stack(3)?;
        self.forbody(base, line, nvars, true)
    }

    fn forstat(&mut self, line: u32) -> LuaResult<()> {
        self.enter_block(true);
        self.lex.next()?;
        let varname = self.str_checkname()?;
        match self.lex.token {
            Token::Char(b'=') => self.fornum(varname, line)?,
            Token::Char(b',') | Token::In => self.forlist(varname)?,
            _ => return Err(self.lex.syntax_error("'=' or 'in' expected")),
        }
        self.check_match(&Token::End, &Token::For, line)?;
        self.leave_block()
    }

    /// `name {'.' name} [':' name]`; true for a method
    fn funcname(&mut self) -> LuaResult<(ExpDesc, bool)> {
        let name = self.str_checkname()?;
        let mut v = self.singlevar(&name)?;
        while self.lex.token == Token::Char(b'.') {
            self.fieldsel(&mut v)?;
        }
        let is_method = self.lex.token == Token::Char(b':');
        if is_method {
            self.fieldsel(&mut v)?;
        }
        Ok((v, is_method))
    }

    fn funcstat(&mut self, line: u32) -> LuaResult<()> {
        self.lex.next()?;
        let (v, is_method) = self.funcname()?;
        let mut b = self.body(is_method, line)?;
        self.check_readonly(&v)?;
        self.store_var(&v, &mut b)?;
        self.fix_line(line);
        Ok(())
    }

    fn localfunc(&mut self) -> LuaResult<()> {
        let fvar = self.fs.first_local + self.fs.nactvar as usize;
        let name = self.str_checkname()?;
        self.new_localvar(name, VarKind::Regular)?;
        // Visible inside its own body for recursion
        self.adjust_local_vars(1);
        let line = self.lex.line;
        self.body(false, line)?;
        let pidx = self.actvar[fvar].pidx;
        let pc = self.fs.pc() as u32;
        if let Some(local) = self.fs.chunk.locals.get_mut(pidx) {
            local.start_pc = pc;
        }
        Ok(())
    }

    fn local_attribute(&mut self) -> LuaResult<VarKind> {
        if !self.test_next(&Token::Char(b'<'))? {
            return Ok(VarKind::Regular);
        }
        let attr = self.str_checkname()?;
        self.check_next(&Token::Char(b'>'))?;
        match attr.as_str() {
            "const" => Ok(VarKind::Const),
            "close" => Ok(VarKind::ToClose),
            _ => Err(self.lex.semantic_error(&format!("unknown attribute '{attr}'"))),
        }
    }

    /// `local name attrib {',' name attrib} ['=' explist]`
    fn localstat(&mut self) -> LuaResult<()> {
        let mut toclose = None;
        let mut nvars = 0;
        loop {
            let name = self.str_checkname()?;
            let kind = self.local_attribute()?;
            self.new_localvar(name, kind)?;
            if kind == VarKind::ToClose {
                if toclose.is_some() {
                    return Err(self
                        .lex
                        .semantic_error("multiple to-be-closed variables in local list"));
                }
                toclose = Some(self.fs.nactvar + nvars);
            }
            nvars += 1;
            if !self.test_next(&Token::Char(b','))? {
                break;
            }
        }
        let (mut e, nexps) = if self.test_next(&Token::Char(b'='))? {
            self.explist()?
        } else {
            (ExpDesc::void(), 0)
        };
        self.adjust_assign(nvars, nexps, &mut e)?;
        self.adjust_local_vars(nvars);
        if let Some(level) = toclose {
            self.mark_to_be_closed();
            self.code_abc(OpCode::Tbc, level, 0, 0);
        }
        Ok(())
    }

    /// `return [explist] [';']`
    fn retstat(&mut self) -> LuaResult<()> {
        let mut first = self.fs.nactvar;
        let nret = if self.block_follow(true) || self.lex.token == Token::Char(b';') {
            0
        } else {
            let (mut e, n) = self.explist()?;
            if e.kind.has_multret() {
                self.set_multret(&e)?;
                let inside_tbc = self.fs.blocks.last().is_some_and(|bl| bl.inside_tbc);
                if e.kind == ExpKind::Call && n == 1 && !inside_tbc {
                    self.fs.chunk.code[e.info as usize].set_opcode(OpCode::TailCall);
                }
                -1
            } else if n == 1 {
                first = self.exp2anyreg(&mut e)?;
                1
            } else {
                self.exp2nextreg(&mut e)?;
                debug_assert_eq!(n, self.fs.freereg - first);
                n as i32
            }
        };
        self.ret(first, nret);
        self.test_next(&Token::Char(b';'))?;
        Ok(())
    }

    /// Function call statement or assignment
    fn exprstat(&mut self) -> LuaResult<()> {
        let v = self.suffixedexp()?;
        if matches!(self.lex.token, Token::Char(b'=') | Token::Char(b',')) {
            self.restassign(v)
        } else {
            if v.kind != ExpKind::Call {
                return Err(self.lex.syntax_error("syntax error"));
            }
            // A call statement keeps no results
            self.fs.chunk.code[v.info as usize].set_c(1);
            Ok(())
        }
    }

    /// A variable being assigned may be the table or key of an earlier
    /// target in the same list; those targets then use a copy taken now
    fn check_conflict(&mut self, targets: &mut [ExpDesc], v: &ExpDesc) -> LuaResult<()> {
        let extra = self.fs.freereg;
        let mut conflict = false;
        for lh in targets.iter_mut().filter(|lh| lh.kind.is_indexed()) {
            if lh.kind == ExpKind::IndexUp {
                if v.kind == ExpKind::Upval && lh.ind.t == v.info {
                    conflict = true;
                    lh.kind = ExpKind::IndexStr;
                    lh.ind.t = extra;
                }
            } else {
                if v.kind == ExpKind::Local && lh.ind.t == v.var.ridx {
                    conflict = true;
                    lh.ind.t = extra;
                }
                if lh.kind == ExpKind::Indexed && v.kind == ExpKind::Local && lh.ind.idx == v.var.ridx {
                    conflict = true;
                    lh.ind.idx = extra;
                }
            }
        }
        if conflict {
            if v.kind == ExpKind::Local {
                self.code_abc(OpCode::Move, extra, v.var.ridx, 0);
            } else {
                self.code_abc(OpCode::GetUpval, extra, v.info, 0);
            }
            self.reserve_regs(1)?;
        }
        Ok(())
    }

    /// `var {',' var} '=' explist`
    fn restassign(&mut self, first: ExpDesc) -> LuaResult<()> {
        let mut targets = vec![first];
        let mut extra_levels = 0;
        loop {
            let Some(last) = targets.last() else { break };
            if !last.kind.is_var() {
                return Err(self.lex.syntax_error("syntax error"));
            }
            self.check_readonly(last)?;
            if !self.test_next(&Token::Char(b','))? {
                break;
            }
            let v = self.suffixedexp()?;
            if !v.kind.is_indexed() {
                self.check_conflict(&mut targets, &v)?;
            }
            self.enter_level()?;
            extra_levels += 1;
            targets.push(v);
        }
        self.check_next(&Token::Char(b'='))?;
        let nvars = targets.len() as u32;
        let (mut e, nexps) = self.explist()?;
        let mut rest = targets.len();
        if nexps != nvars {
            self.adjust_assign(nvars, nexps, &mut e)?;
        } else {
            self.set_one_ret(&mut e);
            rest -= 1;
            self.store_var(&targets[rest], &mut e)?;
        }
        // Remaining values sit on the stack, last target on top
        for target in targets[..rest].iter().rev() {
            let mut value = ExpDesc::new(ExpKind::NonReloc, self.fs.freereg - 1);
            self.store_var(target, &mut value)?;
        }
        for _ in 0..extra_levels {
            self.leave_level();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::compile;
    use crate::lua_vm::OpCode;

    fn ops(src: &str) -> Vec<OpCode> {
        let chunk = compile(src.as_bytes(), "=test").unwrap();
        chunk.code.iter().map(|i| i.get_opcode()).collect()
    }

    #[test]
    fn test_numeric_for_jumps() {
        let chunk = compile(b"for i = 1, 3 do end", "=test").unwrap();
        let prep = chunk.code.iter().position(|i| i.get_opcode() == OpCode::ForPrep).unwrap();
        let endfor = chunk.code.iter().position(|i| i.get_opcode() == OpCode::ForLoop).unwrap();
        // FORPREP skips past the FORLOOP; FORLOOP goes back to the body
        assert_eq!(prep + 1 + chunk.code[prep].get_bx() as usize + 1, endfor + 1);
        assert_eq!(endfor + 1 - chunk.code[endfor].get_bx() as usize, prep + 1);
    }

    #[test]
    fn test_generic_for_shape() {
        let code = ops("for k, v in pairs(t) do end");
        let prep = code.iter().position(|op| *op == OpCode::TForPrep).unwrap();
        assert_eq!(code[prep + 1], OpCode::TForCall);
        assert_eq!(code[prep + 2], OpCode::TForLoop);
    }

    #[test]
    fn test_tail_call_unless_to_be_closed() {
        assert!(ops("return f()").contains(&OpCode::TailCall));
        assert!(!ops("local x <close> = nil; return f()").contains(&OpCode::TailCall));
    }

    #[test]
    fn test_to_be_closed_marks_returns() {
        let chunk = compile(b"local x <close> = nil; return 1", "=test").unwrap();
        assert!(chunk.code.iter().any(|i| i.get_opcode() == OpCode::Tbc));
        assert!(
            chunk
                .code
                .iter()
                .filter(|i| i.get_opcode() == OpCode::Return)
                .all(|i| i.get_k())
        );
    }

    #[test]
    fn test_captured_loop_local_is_closed() {
        let code = ops("while true do local x; f(function() return x end) end");
        assert!(code.contains(&OpCode::Close));
    }

    #[test]
    fn test_local_debug_ranges() {
        let chunk = compile(b"local a = 1\ndo local b = 2 end\nlocal c = 3", "=test").unwrap();
        let names: Vec<_> = chunk.locals.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        let b = &chunk.locals[1];
        assert!(b.start_pc <= b.end_pc);
        assert!(b.end_pc <= chunk.locals[2].start_pc);
    }

    #[test]
    fn test_multiple_assignment_conflict_copies_table() {
        // `t` is reassigned while t[1] is pending; the store uses a copy
        let code = ops("local t = {}; t[1], t = 2, 3");
        assert!(code.contains(&OpCode::Move));
    }

    #[test]
    fn test_statement_errors() {
        let err = |src: &str| compile(src.as_bytes(), "=test").unwrap_err().to_string();
        assert_eq!(err("x"), "test:1: syntax error near <eof>");
        assert_eq!(err("::a:: ::a::"), "test:1: label 'a' already defined on line 1");
        assert_eq!(
            err("local a <close>, b <close> = 1, 2"),
            "test:1: multiple to-be-closed variables in local list"
        );
        assert_eq!(err("for i do end"), "test:1: '=' or 'in' expected near 'do'");
        assert_eq!(err("return 1 x = 2"), "test:1: <eof> expected near 'x'");
    }

    #[test]
    fn test_goto_backward_and_continue_label() {
        compile(b"local i = 0 ::top:: i = i + 1 if i < 3 then goto top end", "=test").unwrap();
        compile(b"for i = 1, 3 do if i == 2 then goto continue end ::continue:: end", "=test").unwrap();
    }
}
