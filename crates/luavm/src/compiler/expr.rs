// Expression productions and variable resolution.

use std::rc::Rc;

use smol_str::SmolStr;

use super::Parser;
use super::code::{BinOpr, UnOpr};
use super::expdesc::{ExpDesc, ExpKind};
use super::func_state::{FuncState, VarKind};
use super::lexer::Token;
use crate::lua_value::{Chunk, UpvalueDesc};
use crate::lua_vm::lua_limits::{LFIELDS_PER_FLUSH, MAXCCALLS, MAXUPVAL, UNARY_PRIORITY};
use crate::lua_vm::{LuaResult, OpCode};

/// State of a table constructor
struct ConsControl {
    /// Last list item read
    v: ExpDesc,
    /// Register of the table
    table: u32,
    /// Record items
    nh: u32,
    /// Array items already stored
    na: u32,
    /// Array items pending
    tostore: u32,
}

fn unary_op(token: &Token) -> Option<UnOpr> {
    match token {
        Token::Not => Some(UnOpr::Not),
        Token::Char(b'-') => Some(UnOpr::Minus),
        Token::Char(b'~') => Some(UnOpr::BNot),
        Token::Char(b'#') => Some(UnOpr::Len),
        _ => None,
    }
}

fn binary_op(token: &Token) -> Option<BinOpr> {
    Some(match token {
        Token::Char(b'+') => BinOpr::Add,
        Token::Char(b'-') => BinOpr::Sub,
        Token::Char(b'*') => BinOpr::Mul,
        Token::Char(b'%') => BinOpr::Mod,
        Token::Char(b'^') => BinOpr::Pow,
        Token::Char(b'/') => BinOpr::Div,
        Token::IDiv => BinOpr::IDiv,
        Token::Char(b'&') => BinOpr::BAnd,
        Token::Char(b'|') => BinOpr::BOr,
        Token::Char(b'~') => BinOpr::BXor,
        Token::Shl => BinOpr::Shl,
        Token::Shr => BinOpr::Shr,
        Token::Concat => BinOpr::Concat,
        Token::Ne => BinOpr::Ne,
        Token::Eq => BinOpr::Eq,
        Token::Char(b'<') => BinOpr::Lt,
        Token::Le => BinOpr::Le,
        Token::Char(b'>') => BinOpr::Gt,
        Token::Ge => BinOpr::Ge,
        Token::And => BinOpr::And,
        Token::Or => BinOpr::Or,
        _ => return None,
    })
}

impl Parser<'_> {
    // ===== Function nesting =====

    /// Function state at nesting `level`; the current function is at
    /// `enclosing.len()`
    fn fs_at(&self, level: usize) -> &FuncState {
        self.enclosing.get(level).unwrap_or(&self.fs)
    }

    fn fs_at_mut(&mut self, level: usize) -> &mut FuncState {
        match self.enclosing.get_mut(level) {
            Some(fs) => fs,
            None => &mut self.fs,
        }
    }

    pub(super) fn open_func(&mut self, linedefined: u32) {
        let child = FuncState::new(
            Some(self.source.clone()),
            linedefined,
            self.actvar.len(),
            self.labels.len(),
        );
        let parent = std::mem::replace(&mut self.fs, child);
        self.enclosing.push(parent);
        self.enter_block(false);
    }

    /// Finish the current nested function and return to its parent
    pub(super) fn close_func(&mut self) -> LuaResult<Chunk> {
        self.finish_func()?;
        let Some(parent) = self.enclosing.pop() else {
            return Err(self.lex.semantic_error("no enclosing function"));
        };
        let child = std::mem::replace(&mut self.fs, parent);
        Ok(child.chunk)
    }

    pub(super) fn enter_level(&mut self) -> LuaResult<()> {
        self.depth += 1;
        if self.depth > MAXCCALLS {
            return Err(self.lex.semantic_error("C stack overflow"));
        }
        Ok(())
    }

    pub(super) fn leave_level(&mut self) {
        self.depth -= 1;
    }

    /// "too many ..." error for the function at `level`
    pub(super) fn error_limit(&self, level: usize, limit: usize, what: &str) -> crate::lua_vm::LuaError {
        let line = self.fs_at(level).chunk.linedefined;
        let place = if line == 0 {
            "main function".to_string()
        } else {
            format!("function at line {line}")
        };
        self.lex
            .syntax_error(&format!("too many {what} (limit is {limit}) in {place}"))
    }

    // ===== Variables =====

    /// Active local called `name` in the function at `level`
    fn search_var(&self, level: usize, name: &str) -> Option<ExpDesc> {
        let fs = self.fs_at(level);
        (0..fs.nactvar as usize).rev().find_map(|i| {
            let vd = &self.actvar[fs.first_local + i];
            (vd.name == name).then(|| ExpDesc::local(vd.ridx, i))
        })
    }

    /// Flag the block declaring local `vidx` so it closes its upvalues
    fn mark_upval(&mut self, level: usize, vidx: usize) {
        let fs = self.fs_at_mut(level);
        if let Some(bl) = fs.blocks.iter_mut().rev().find(|bl| bl.nactvar as usize <= vidx) {
            bl.upval = true;
        }
        fs.needclose = true;
    }

    /// New upvalue of the function at `level` for variable `v` of its parent
    fn new_upvalue(&mut self, level: usize, name: &SmolStr, v: &ExpDesc) -> LuaResult<u32> {
        if self.fs_at(level).chunk.upvalue_descs.len() + 1 > MAXUPVAL {
            return Err(self.error_limit(level, MAXUPVAL, "upvalues"));
        }
        let parent = self.fs_at(level - 1);
        let (desc, kind) = if v.kind == ExpKind::Local {
            let kind = self.actvar[parent.first_local + v.var.vidx].kind;
            (
                UpvalueDesc {
                    in_stack: true,
                    index: v.var.ridx as u8,
                    name: name.clone(),
                },
                kind,
            )
        } else {
            let kind = parent.upvalue_kinds[v.info as usize];
            (
                UpvalueDesc {
                    in_stack: false,
                    index: v.info as u8,
                    name: name.clone(),
                },
                kind,
            )
        };
        let fs = self.fs_at_mut(level);
        fs.chunk.upvalue_descs.push(desc);
        fs.upvalue_kinds.push(kind);
        Ok(fs.chunk.upvalue_descs.len() as u32 - 1)
    }

    /// Resolve `name` in the function at `level`: local, upvalue, or void
    /// for a global. `base` is false when a nested function asks.
    fn singlevar_aux(&mut self, level: usize, name: &SmolStr, base: bool) -> LuaResult<ExpDesc> {
        if let Some(var) = self.search_var(level, name) {
            if !base {
                self.mark_upval(level, var.var.vidx);
            }
            return Ok(var);
        }
        if let Some(idx) = self.fs_at(level).search_upvalue(name) {
            return Ok(ExpDesc::new(ExpKind::Upval, idx));
        }
        if level == 0 {
            return Ok(ExpDesc::void());
        }
        let outer = self.singlevar_aux(level - 1, name, false)?;
        match outer.kind {
            ExpKind::Local | ExpKind::Upval => {
                let idx = self.new_upvalue(level, name, &outer)?;
                Ok(ExpDesc::new(ExpKind::Upval, idx))
            }
            _ => Ok(ExpDesc::void()),
        }
    }

    /// Variable reference; globals become `_ENV.name`
    pub(super) fn singlevar(&mut self, name: &SmolStr) -> LuaResult<ExpDesc> {
        let level = self.enclosing.len();
        let var = self.singlevar_aux(level, name, true)?;
        if var.kind != ExpKind::Void {
            return Ok(var);
        }
        let mut env = self.singlevar_aux(level, &SmolStr::new_static("_ENV"), true)?;
        if env.kind == ExpKind::Void {
            return Err(self.lex.semantic_error("no _ENV in scope"));
        }
        self.exp2anyregup(&mut env)?;
        let mut key = ExpDesc::new(ExpKind::KStr, self.fs.string_constant(name.as_bytes()));
        self.indexed(&mut env, &mut key)?;
        Ok(env)
    }

    // ===== Primary and suffixed expressions =====

    fn code_name(&mut self) -> LuaResult<ExpDesc> {
        let name = self.str_checkname()?;
        Ok(ExpDesc::new(ExpKind::KStr, self.fs.string_constant(name.as_bytes())))
    }

    /// `.name`
    pub(super) fn fieldsel(&mut self, v: &mut ExpDesc) -> LuaResult<()> {
        self.exp2anyregup(v)?;
        self.lex.next()?;
        let mut key = self.code_name()?;
        self.indexed(v, &mut key)
    }

    /// `[exp]`
    fn yindex(&mut self) -> LuaResult<ExpDesc> {
        self.lex.next()?;
        let mut v = self.expr()?;
        self.exp2val(&mut v)?;
        self.check_next(&Token::Char(b']'))?;
        Ok(v)
    }

    fn primaryexp(&mut self) -> LuaResult<ExpDesc> {
        match &self.lex.token {
            Token::Name(name) => {
                let name = name.clone();
                self.lex.next()?;
                self.singlevar(&name)
            }
            Token::Char(b'(') => {
                let line = self.lex.line;
                self.lex.next()?;
                let mut v = self.expr()?;
                self.check_match(&Token::Char(b')'), &Token::Char(b'('), line)?;
                self.discharge_vars(&mut v);
                Ok(v)
            }
            _ => Err(self.lex.syntax_error("unexpected symbol")),
        }
    }

    /// primaryexp { '.' NAME | '[' exp ']' | ':' NAME funcargs | funcargs }
    pub(super) fn suffixedexp(&mut self) -> LuaResult<ExpDesc> {
        let line = self.lex.line;
        let mut v = self.primaryexp()?;
        loop {
            match &self.lex.token {
                Token::Char(b'.') => self.fieldsel(&mut v)?,
                Token::Char(b'[') => {
                    self.exp2anyregup(&mut v)?;
                    let mut key = self.yindex()?;
                    self.indexed(&mut v, &mut key)?;
                }
                Token::Char(b':') => {
                    self.lex.next()?;
                    let mut key = self.code_name()?;
                    self.self_(&mut v, &mut key)?;
                    self.funcargs(&mut v, line)?;
                }
                Token::Char(b'(') | Token::Char(b'{') | Token::String(_) => {
                    self.exp2nextreg(&mut v)?;
                    self.funcargs(&mut v, line)?;
                }
                _ => return Ok(v),
            }
        }
    }

    /// Arguments of a call to the function in register `f.info`
    fn funcargs(&mut self, f: &mut ExpDesc, line: u32) -> LuaResult<()> {
        let mut args = match &self.lex.token {
            Token::Char(b'(') => {
                self.lex.next()?;
                if self.lex.token == Token::Char(b')') {
                    self.check_match(&Token::Char(b')'), &Token::Char(b'('), line)?;
                    ExpDesc::void()
                } else {
                    let (args, _) = self.explist()?;
                    if args.kind.has_multret() {
                        self.set_multret(&args)?;
                    }
                    self.check_match(&Token::Char(b')'), &Token::Char(b'('), line)?;
                    args
                }
            }
            Token::Char(b'{') => self.constructor()?,
            Token::String(s) => {
                let k = self.fs.string_constant(s);
                self.lex.next()?;
                ExpDesc::new(ExpKind::KStr, k)
            }
            _ => return Err(self.lex.syntax_error("function arguments expected")),
        };
        debug_assert_eq!(f.kind, ExpKind::NonReloc);
        let base = f.info;
        let b = if args.kind.has_multret() {
            0
        } else {
            if args.kind != ExpKind::Void {
                self.exp2nextreg(&mut args)?;
            }
            self.fs.freereg - base
        };
        f.info = self.code_abc(OpCode::Call, base, b, 2) as u32;
        f.kind = ExpKind::Call;
        self.fix_line(line);
        // The call leaves one result in the function's register
        self.fs.freereg = base + 1;
        Ok(())
    }

    // ===== Simple expressions =====

    fn simpleexp(&mut self) -> LuaResult<ExpDesc> {
        let v = match &self.lex.token {
            Token::Float(n) => ExpDesc::float(*n),
            Token::Int(i) => ExpDesc::int(*i),
            Token::String(s) => ExpDesc::new(ExpKind::KStr, self.fs.string_constant(s)),
            Token::Nil => ExpDesc::new(ExpKind::Nil, 0),
            Token::True => ExpDesc::new(ExpKind::True, 0),
            Token::False => ExpDesc::new(ExpKind::False, 0),
            Token::Dots => {
                if !self.fs.chunk.is_vararg {
                    return Err(self.lex.syntax_error("cannot use '...' outside a vararg function"));
                }
                ExpDesc::new(ExpKind::Vararg, self.code_abc(OpCode::Vararg, 0, 0, 1) as u32)
            }
            Token::Char(b'{') => return self.constructor(),
            Token::Function => {
                let line = self.lex.line;
                self.lex.next()?;
                return self.body(false, line);
            }
            _ => return self.suffixedexp(),
        };
        self.lex.next()?;
        Ok(v)
    }

    /// Expression whose binary operators bind tighter than `limit`;
    /// returns the first operator that does not
    fn subexpr(&mut self, v: &mut ExpDesc, limit: u8) -> LuaResult<Option<BinOpr>> {
        self.enter_level()?;
        if let Some(uop) = unary_op(&self.lex.token) {
            let line = self.lex.line;
            self.lex.next()?;
            self.subexpr(v, UNARY_PRIORITY)?;
            self.prefix(uop, v, line)?;
        } else {
            *v = self.simpleexp()?;
        }
        let mut op = binary_op(&self.lex.token);
        while let Some(bop) = op {
            let (left, right) = bop.priority();
            if left <= limit {
                break;
            }
            let line = self.lex.line;
            self.lex.next()?;
            self.infix(bop, v)?;
            let mut v2 = ExpDesc::void();
            let next = self.subexpr(&mut v2, right)?;
            self.posfix(bop, v, &mut v2, line)?;
            op = next;
        }
        self.leave_level();
        Ok(op)
    }

    pub(super) fn expr(&mut self) -> LuaResult<ExpDesc> {
        let mut v = ExpDesc::void();
        self.subexpr(&mut v, 0)?;
        Ok(v)
    }

    /// `expr { ',' expr }`; all but the last go to consecutive registers.
    /// Returns the last expression and the count.
    pub(super) fn explist(&mut self) -> LuaResult<(ExpDesc, u32)> {
        let mut v = self.expr()?;
        let mut n = 1;
        while self.test_next(&Token::Char(b','))? {
            self.exp2nextreg(&mut v)?;
            v = self.expr()?;
            n += 1;
        }
        Ok((v, n))
    }

    // ===== Table constructor =====

    fn constructor(&mut self) -> LuaResult<ExpDesc> {
        let line = self.lex.line;
        let pc = self.code_abc(OpCode::NewTable, 0, 0, 0);
        // Sizes are patched in once known
        self.code_extra_arg(0);
        let t = ExpDesc::new(ExpKind::NonReloc, self.fs.freereg);
        self.reserve_regs(1)?;
        let mut cc = ConsControl {
            v: ExpDesc::void(),
            table: t.info,
            nh: 0,
            na: 0,
            tostore: 0,
        };
        self.check_next(&Token::Char(b'{'))?;
        loop {
            if self.lex.token == Token::Char(b'}') {
                break;
            }
            self.close_list_field(&mut cc)?;
            self.field(&mut cc)?;
            if !self.test_next(&Token::Char(b','))? && !self.test_next(&Token::Char(b';'))? {
                break;
            }
        }
        self.check_match(&Token::Char(b'}'), &Token::Char(b'{'), line)?;
        self.last_list_field(&mut cc)?;
        self.set_table_size(pc, t.info, cc.na, cc.nh);
        Ok(t)
    }

    fn field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        match &self.lex.token {
            Token::Name(_) => {
                if *self.lex.lookahead()? == Token::Char(b'=') {
                    self.rec_field(cc)
                } else {
                    self.list_field(cc)
                }
            }
            Token::Char(b'[') => self.rec_field(cc),
            _ => self.list_field(cc),
        }
    }

    /// `name = exp` or `[exp] = exp`
    fn rec_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        let reg = self.fs.freereg;
        let mut key = if matches!(self.lex.token, Token::Name(_)) {
            self.code_name()?
        } else {
            self.yindex()?
        };
        cc.nh += 1;
        self.check_next(&Token::Char(b'='))?;
        let mut tab = ExpDesc::new(ExpKind::NonReloc, cc.table);
        self.indexed(&mut tab, &mut key)?;
        let mut val = self.expr()?;
        self.store_var(&tab, &mut val)?;
        self.fs.freereg = reg;
        Ok(())
    }

    fn list_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        cc.v = self.expr()?;
        cc.tostore += 1;
        Ok(())
    }

    fn close_list_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        if cc.v.kind == ExpKind::Void {
            return Ok(());
        }
        self.exp2nextreg(&mut cc.v)?;
        cc.v = ExpDesc::void();
        if cc.tostore == LFIELDS_PER_FLUSH {
            self.set_list(cc.table, cc.na, cc.tostore as i32);
            cc.na += cc.tostore;
            cc.tostore = 0;
        }
        Ok(())
    }

    fn last_list_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        if cc.tostore == 0 {
            return Ok(());
        }
        if cc.v.kind.has_multret() {
            self.set_multret(&cc.v)?;
            self.set_list(cc.table, cc.na, -1);
            // The open item is not counted
            cc.na += cc.tostore - 1;
        } else {
            if cc.v.kind != ExpKind::Void {
                self.exp2nextreg(&mut cc.v)?;
            }
            self.set_list(cc.table, cc.na, cc.tostore as i32);
            cc.na += cc.tostore;
        }
        Ok(())
    }

    // ===== Function bodies =====

    /// `(parlist) block end`; the closure lands in the next register
    pub(super) fn body(&mut self, is_method: bool, line: u32) -> LuaResult<ExpDesc> {
        self.open_func(line);
        self.check_next(&Token::Char(b'('))?;
        if is_method {
            self.new_localvar(SmolStr::new_static("self"), VarKind::Regular)?;
            self.adjust_local_vars(1);
        }
        self.parlist()?;
        self.check_next(&Token::Char(b')'))?;
        self.statlist()?;
        self.fs.chunk.lastlinedefined = self.lex.line;
        self.check_match(&Token::End, &Token::Function, line)?;
        let child = self.close_func()?;
        let idx = self.fs.chunk.child_protos.len() as u32;
        self.fs.chunk.child_protos.push(Rc::new(child));
        let mut e = ExpDesc::new(ExpKind::Reloc, self.code_abx(OpCode::Closure, 0, idx) as u32);
        self.exp2nextreg(&mut e)?;
        Ok(e)
    }

    fn parlist(&mut self) -> LuaResult<()> {
        let mut nparams = 0;
        let mut is_vararg = false;
        if self.lex.token != Token::Char(b')') {
            loop {
                match &self.lex.token {
                    Token::Name(_) => {
                        let name = self.str_checkname()?;
                        self.new_localvar(name, VarKind::Regular)?;
                        nparams += 1;
                    }
                    Token::Dots => {
                        self.lex.next()?;
                        is_vararg = true;
                    }
                    _ => return Err(self.lex.syntax_error("<name> expected")),
                }
                if is_vararg || !self.test_next(&Token::Char(b','))? {
                    break;
                }
            }
        }
        self.adjust_local_vars(nparams);
        let nactvar = self.fs.nactvar;
        self.fs.chunk.param_count = nactvar as usize;
        if is_vararg {
            self.set_vararg(nactvar);
        }
        self.reserve_regs(nactvar)
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
    fn test_method_call_uses_self() {
        let code = ops("local o; o:m(1)");
        assert!(code.contains(&OpCode::Self_));
        assert!(code.contains(&OpCode::Call));
    }

    #[test]
    fn test_constant_keys_pick_specialized_gets() {
        let code = ops("local t, k; return t.x, t[1], t[k], t[1000]");
        assert!(code.contains(&OpCode::GetField));
        assert!(code.contains(&OpCode::GetI));
        assert_eq!(code.iter().filter(|op| **op == OpCode::GetTable).count(), 2);
    }

    #[test]
    fn test_concat_chain_is_one_instruction() {
        let code = ops("local a, b, c; return a .. b .. c");
        assert_eq!(code.iter().filter(|op| **op == OpCode::Concat).count(), 1);
    }

    #[test]
    fn test_comparison_with_constant_uses_eqk() {
        let code = ops("local a; return a == 'x'");
        assert!(code.contains(&OpCode::EqK));
        let code = ops("local a; return a > 1");
        assert!(code.contains(&OpCode::Lt));
    }

    #[test]
    fn test_upvalue_through_two_levels() {
        let chunk = compile(b"local x; return function() return function() return x end end", "=test").unwrap();
        let middle = &chunk.child_protos[0];
        let inner = &middle.child_protos[0];
        assert!(middle.upvalue_descs[0].in_stack);
        assert!(!inner.upvalue_descs[0].in_stack);
        assert_eq!(inner.upvalue_descs[0].index, 0);
    }

    #[test]
    fn test_vararg_table_constructor_is_open() {
        let chunk = compile(b"return {...}", "=test").unwrap();
        let setlist = chunk
            .code
            .iter()
            .find(|i| i.get_opcode() == OpCode::SetList)
            .unwrap();
        assert_eq!(setlist.get_b(), 0);
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let src = format!("return {}1{}", "(".repeat(300), ")".repeat(300));
        assert!(compile(src.as_bytes(), "=test").is_err());
    }
}
