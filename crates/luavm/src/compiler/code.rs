// Code generation: instruction emission, register allocation, jump lists
// and the discharge of pending expressions into registers.

use super::Parser;
use super::expdesc::{ExpDesc, ExpKind, NO_JUMP};
use crate::lua_value::LuaValue;
use crate::lua_vm::lua_limits::{MAXREGS, NO_REG};
use crate::lua_vm::{Instruction, LuaResult, OpCode, TmKind, arith_numbers};

/// Binary operators, in the order of their priority table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpr {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Concat,
    Eq,
    Lt,
    Le,
    Ne,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOpr {
    Minus,
    BNot,
    Not,
    Len,
}

impl BinOpr {
    /// (left, right) priority; right lower than left means right associative
    pub fn priority(self) -> (u8, u8) {
        use BinOpr::*;
        match self {
            Add | Sub => (10, 10),
            Mul | Mod => (11, 11),
            Pow => (14, 13),
            Div | IDiv => (11, 11),
            BAnd => (6, 6),
            BOr => (4, 4),
            BXor => (5, 5),
            Shl | Shr => (7, 7),
            Concat => (9, 8),
            Eq | Lt | Le | Ne | Gt | Ge => (3, 3),
            And => (2, 2),
            Or => (1, 1),
        }
    }

    /// Arithmetic and bitwise operators, which can be folded
    fn tm(self) -> Option<TmKind> {
        use BinOpr::*;
        Some(match self {
            Add => TmKind::Add,
            Sub => TmKind::Sub,
            Mul => TmKind::Mul,
            Mod => TmKind::Mod,
            Pow => TmKind::Pow,
            Div => TmKind::Div,
            IDiv => TmKind::IDiv,
            BAnd => TmKind::BAnd,
            BOr => TmKind::BOr,
            BXor => TmKind::BXor,
            Shl => TmKind::Shl,
            Shr => TmKind::Shr,
            _ => return None,
        })
    }

    fn arith_opcode(self) -> OpCode {
        use BinOpr::*;
        match self {
            Add => OpCode::Add,
            Sub => OpCode::Sub,
            Mul => OpCode::Mul,
            Mod => OpCode::Mod,
            Pow => OpCode::Pow,
            Div => OpCode::Div,
            IDiv => OpCode::IDiv,
            BAnd => OpCode::BAnd,
            BOr => OpCode::BOr,
            BXor => OpCode::BXor,
            Shl => OpCode::Shl,
            _ => OpCode::Shr,
        }
    }
}

fn fits_sbx(i: i64) -> bool {
    let lo = -(Instruction::OFFSET_SBX as i64);
    let hi = (Instruction::MAX_BX as i64) - Instruction::OFFSET_SBX as i64;
    (lo..=hi).contains(&i)
}

/// Operands that are safe to fold at compile time
fn valid_fold(op: TmKind, v1: LuaValue, v2: LuaValue) -> bool {
    match op {
        TmKind::BAnd | TmKind::BOr | TmKind::BXor | TmKind::Shl | TmKind::Shr | TmKind::BNot => {
            v1.to_integer_exact().is_some() && v2.to_integer_exact().is_some()
        }
        TmKind::Div | TmKind::IDiv | TmKind::Mod => v2.as_number().is_some_and(|n| n != 0.0),
        _ => true,
    }
}

fn ceil_log2(x: u32) -> u32 {
    if x <= 1 { 0 } else { 32 - (x - 1).leading_zeros() }
}

impl Parser<'_> {
    // ===== Emission =====

    pub(super) fn code(&mut self, i: Instruction) -> usize {
        let pc = self.fs.pc();
        self.fs.chunk.code.push(i);
        self.fs.chunk.line_info.push(self.lex.last_line);
        pc
    }

    pub(super) fn code_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> usize {
        self.code(Instruction::create_abc(op, a, b, c))
    }

    pub(super) fn code_abck(&mut self, op: OpCode, a: u32, b: u32, c: u32, k: bool) -> usize {
        self.code(Instruction::create_abck(op, a, b, c, k))
    }

    pub(super) fn code_abx(&mut self, op: OpCode, a: u32, bx: u32) -> usize {
        self.code(Instruction::create_abx(op, a, bx))
    }

    fn code_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> usize {
        self.code(Instruction::create_asbx(op, a, sbx))
    }

    fn code_sj(&mut self, op: OpCode, sj: i32) -> usize {
        self.code(Instruction::create_sj(op, sj))
    }

    pub(super) fn code_extra_arg(&mut self, ax: u32) -> usize {
        self.code(Instruction::create_ax(OpCode::ExtraArg, ax))
    }

    /// Tag the last instruction with `line`
    pub(super) fn fix_line(&mut self, line: u32) {
        if let Some(last) = self.fs.chunk.line_info.last_mut() {
            *last = line;
        }
    }

    fn code_k(&mut self, reg: u32, k: u32) -> usize {
        if k <= Instruction::MAX_BX {
            self.code_abx(OpCode::LoadK, reg, k)
        } else {
            let pc = self.code_abx(OpCode::LoadKX, reg, 0);
            self.code_extra_arg(k);
            pc
        }
    }

    /// Last instruction, unless a jump may land after it
    fn previous_instruction(&self) -> Option<usize> {
        let pc = self.fs.pc();
        if pc > self.fs.last_target && pc > 0 {
            Some(pc - 1)
        } else {
            None
        }
    }

    // ===== Registers =====

    pub(super) fn check_stack(&mut self, n: u32) -> LuaResult<()> {
        let newstack = (self.fs.freereg + n) as usize;
        if newstack > self.fs.chunk.max_stack_size {
            if newstack >= MAXREGS {
                return Err(self
                    .lex
                    .semantic_error("function or expression needs too many registers"));
            }
            self.fs.chunk.max_stack_size = newstack;
        }
        Ok(())
    }

    pub(super) fn reserve_regs(&mut self, n: u32) -> LuaResult<()> {
        self.check_stack(n)?;
        self.fs.freereg += n;
        Ok(())
    }

    /// Free `reg` unless it holds a local variable
    fn free_reg(&mut self, reg: u32) {
        if reg >= self.fs.nactvar {
            self.fs.freereg -= 1;
            debug_assert_eq!(reg, self.fs.freereg, "registers freed out of order");
        }
    }

    /// Free two registers in the right order
    fn free_regs(&mut self, r1: u32, r2: u32) {
        if r1 > r2 {
            self.free_reg(r1);
            self.free_reg(r2);
        } else {
            self.free_reg(r2);
            self.free_reg(r1);
        }
    }

    pub(super) fn free_exp(&mut self, e: &ExpDesc) {
        if e.kind == ExpKind::NonReloc {
            self.free_reg(e.info);
        }
    }

    fn free_exps(&mut self, e1: &ExpDesc, e2: &ExpDesc) {
        let r1 = if e1.kind == ExpKind::NonReloc { e1.info as i64 } else { -1 };
        let r2 = if e2.kind == ExpKind::NonReloc { e2.info as i64 } else { -1 };
        let (first, second) = if r1 > r2 { (r1, r2) } else { (r2, r1) };
        for r in [first, second] {
            if r >= 0 {
                self.free_reg(r as u32);
            }
        }
    }

    // ===== Jumps =====

    pub(super) fn jump(&mut self) -> usize {
        self.code_sj(OpCode::Jmp, NO_JUMP as i32)
    }

    /// `return R[first], ... R[first+nret-1]`; `nret` -1 returns up to top
    pub(super) fn ret(&mut self, first: u32, nret: i32) {
        self.code_abc(OpCode::Return, first, (nret + 1) as u32, 0);
    }

    fn cond_jump(&mut self, op: OpCode, a: u32, b: u32, c: u32, k: bool) -> usize {
        self.code_abck(op, a, b, c, k);
        self.jump()
    }

    /// Mark the current pc as a jump target
    pub(super) fn get_label(&mut self) -> usize {
        let pc = self.fs.pc();
        self.fs.last_target = pc;
        pc
    }

    fn get_jump(&self, pc: usize) -> isize {
        let offset = self.fs.chunk.code[pc].get_sj() as isize;
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc as isize + 1 + offset
        }
    }

    fn fix_jump(&mut self, pc: usize, dest: usize) -> LuaResult<()> {
        let offset = dest as i64 - (pc as i64 + 1);
        let lo = -(Instruction::OFFSET_SJ as i64);
        let hi = Instruction::MAX_SJ as i64 - Instruction::OFFSET_SJ as i64;
        if !(lo..=hi).contains(&offset) {
            return Err(self.lex.syntax_error("control structure too long"));
        }
        self.fs.chunk.code[pc].set_sj(offset as i32);
        Ok(())
    }

    /// Append jump list `l2` to `l1`
    pub(super) fn concat_jumps(&mut self, l1: &mut isize, l2: isize) -> LuaResult<()> {
        if l2 == NO_JUMP {
            return Ok(());
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return Ok(());
        }
        let mut list = *l1 as usize;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next as usize;
        }
        self.fix_jump(list, l2 as usize)
    }

    /// Instruction controlling the jump at `pc`: its test when it has one
    fn jump_control_pc(&self, pc: usize) -> usize {
        if pc >= 1 && self.fs.chunk.code[pc - 1].get_opcode().is_test() {
            pc - 1
        } else {
            pc
        }
    }

    /// Point the TESTSET controlling `node` at `reg`, or turn it into a
    /// plain TEST when no value is wanted. False when the jump has no
    /// TESTSET.
    fn patch_test_reg(&mut self, node: usize, reg: u32) -> bool {
        let at = self.jump_control_pc(node);
        let i = self.fs.chunk.code[at];
        if i.get_opcode() != OpCode::TestSet {
            return false;
        }
        if reg != NO_REG && reg != i.get_b() {
            self.fs.chunk.code[at].set_a(reg);
        } else {
            self.fs.chunk.code[at] = Instruction::create_abck(OpCode::Test, i.get_b(), 0, 0, i.get_k());
        }
        true
    }

    fn remove_values(&mut self, mut list: isize) {
        while list != NO_JUMP {
            self.patch_test_reg(list as usize, NO_REG);
            list = self.get_jump(list as usize);
        }
    }

    /// Jumps that produce a value go to `vtarget` with the value in `reg`;
    /// the others go to `dtarget`
    fn patch_list_aux(&mut self, mut list: isize, vtarget: usize, reg: u32, dtarget: usize) -> LuaResult<()> {
        while list != NO_JUMP {
            let node = list as usize;
            let next = self.get_jump(node);
            if self.patch_test_reg(node, reg) {
                self.fix_jump(node, vtarget)?;
            } else {
                self.fix_jump(node, dtarget)?;
            }
            list = next;
        }
        Ok(())
    }

    pub(super) fn patch_list(&mut self, list: isize, target: usize) -> LuaResult<()> {
        self.patch_list_aux(list, target, NO_REG, target)
    }

    pub(super) fn patch_to_here(&mut self, list: isize) -> LuaResult<()> {
        let here = self.get_label();
        self.patch_list(list, here)
    }

    // ===== Loads =====

    pub(super) fn code_nil(&mut self, mut from: u32, n: u32) {
        let mut last = from + n - 1;
        if let Some(prev) = self.previous_instruction() {
            let i = self.fs.chunk.code[prev];
            if i.get_opcode() == OpCode::LoadNil {
                let pfrom = i.get_a();
                let plast = pfrom + i.get_b();
                if (pfrom <= from && from <= plast + 1) || (from <= pfrom && pfrom <= last + 1) {
                    from = from.min(pfrom);
                    last = last.max(plast);
                    let merged = &mut self.fs.chunk.code[prev];
                    merged.set_a(from);
                    merged.set_b(last - from);
                    return;
                }
            }
        }
        self.code_abc(OpCode::LoadNil, from, n - 1, 0);
    }

    pub(super) fn load_int(&mut self, reg: u32, i: i64) {
        if fits_sbx(i) {
            self.code_asbx(OpCode::LoadI, reg, i as i32);
        } else {
            let k = self.fs.int_constant(i);
            self.code_k(reg, k);
        }
    }

    fn load_float(&mut self, reg: u32, f: f64) {
        let integral = f.fract() == 0.0 && !(f == 0.0 && f.is_sign_negative());
        if integral && fits_sbx(f as i64) && (f as i64) as f64 == f {
            self.code_asbx(OpCode::LoadF, reg, f as i32);
        } else {
            let k = self.fs.float_constant(f);
            self.code_k(reg, k);
        }
    }

    fn code_loadbool(&mut self, reg: u32, op: OpCode) -> usize {
        self.get_label();
        self.code_abc(op, reg, 0, 0)
    }

    // ===== Multiple results =====

    /// Adjust a call or vararg to produce `nresults` values (-1: all)
    pub(super) fn set_returns(&mut self, e: &ExpDesc, nresults: i32) -> LuaResult<()> {
        let c = (nresults + 1) as u32;
        match e.kind {
            ExpKind::Call => {
                self.fs.chunk.code[e.info as usize].set_c(c);
            }
            ExpKind::Vararg => {
                let freereg = self.fs.freereg;
                let i = &mut self.fs.chunk.code[e.info as usize];
                i.set_c(c);
                i.set_a(freereg);
                self.reserve_regs(1)?;
            }
            _ => {}
        }
        Ok(())
    }

    pub(super) fn set_multret(&mut self, e: &ExpDesc) -> LuaResult<()> {
        self.set_returns(e, -1)
    }

    /// A call or vararg used as a single value
    pub(super) fn set_one_ret(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call => {
                e.kind = ExpKind::NonReloc;
                e.info = self.fs.chunk.code[e.info as usize].get_a();
            }
            ExpKind::Vararg => {
                self.fs.chunk.code[e.info as usize].set_c(2);
                e.kind = ExpKind::Reloc;
            }
            _ => {}
        }
    }

    // ===== Discharge =====

    /// Turn a variable into a value expression
    pub(super) fn discharge_vars(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Local => {
                e.info = e.var.ridx;
                e.kind = ExpKind::NonReloc;
            }
            ExpKind::Upval => {
                e.info = self.code_abc(OpCode::GetUpval, 0, e.info, 0) as u32;
                e.kind = ExpKind::Reloc;
            }
            ExpKind::IndexUp => {
                e.info = self.code_abc(OpCode::GetTabUp, 0, e.ind.t, e.ind.idx) as u32;
                e.kind = ExpKind::Reloc;
            }
            ExpKind::IndexI => {
                self.free_reg(e.ind.t);
                e.info = self.code_abc(OpCode::GetI, 0, e.ind.t, e.ind.idx) as u32;
                e.kind = ExpKind::Reloc;
            }
            ExpKind::IndexStr => {
                self.free_reg(e.ind.t);
                e.info = self.code_abc(OpCode::GetField, 0, e.ind.t, e.ind.idx) as u32;
                e.kind = ExpKind::Reloc;
            }
            ExpKind::Indexed => {
                self.free_regs(e.ind.t, e.ind.idx);
                e.info = self.code_abc(OpCode::GetTable, 0, e.ind.t, e.ind.idx) as u32;
                e.kind = ExpKind::Reloc;
            }
            ExpKind::Call | ExpKind::Vararg => self.set_one_ret(e),
            _ => {}
        }
    }

    fn discharge2reg(&mut self, e: &mut ExpDesc, reg: u32) {
        self.discharge_vars(e);
        match e.kind {
            ExpKind::Nil => self.code_nil(reg, 1),
            ExpKind::False => {
                self.code_abc(OpCode::LoadFalse, reg, 0, 0);
            }
            ExpKind::True => {
                self.code_abc(OpCode::LoadTrue, reg, 0, 0);
            }
            ExpKind::KStr | ExpKind::K => {
                self.code_k(reg, e.info);
            }
            ExpKind::KFlt => self.load_float(reg, e.nval),
            ExpKind::KInt => self.load_int(reg, e.ival),
            ExpKind::Reloc => {
                self.fs.chunk.code[e.info as usize].set_a(reg);
            }
            ExpKind::NonReloc => {
                if reg != e.info {
                    self.code_abc(OpCode::Move, reg, e.info, 0);
                }
            }
            // Jumps are patched by the caller; void has nothing to load
            _ => return,
        }
        e.info = reg;
        e.kind = ExpKind::NonReloc;
    }

    fn discharge2anyreg(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        if e.kind != ExpKind::NonReloc {
            self.reserve_regs(1)?;
            self.discharge2reg(e, self.fs.freereg - 1);
        }
        Ok(())
    }

    /// Some jump in `list` needs a value other than its tested one
    fn need_value(&self, mut list: isize) -> bool {
        while list != NO_JUMP {
            let at = self.jump_control_pc(list as usize);
            if self.fs.chunk.code[at].get_opcode() != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list as usize);
        }
        false
    }

    /// Put the final value of `e`, jumps included, into `reg`
    fn exp2reg(&mut self, e: &mut ExpDesc, reg: u32) -> LuaResult<()> {
        self.discharge2reg(e, reg);
        if e.kind == ExpKind::Jmp {
            let jump = e.info as isize;
            self.concat_jumps(&mut e.t, jump)?;
        }
        if e.has_jumps() {
            let mut load_false = self.fs.pc();
            let mut load_true = load_false;
            if self.need_value(e.t) || self.need_value(e.f) {
                let skip = if e.kind == ExpKind::Jmp { NO_JUMP } else { self.jump() as isize };
                load_false = self.code_loadbool(reg, OpCode::LFalseSkip);
                load_true = self.code_loadbool(reg, OpCode::LoadTrue);
                self.patch_to_here(skip)?;
            }
            let end = self.get_label();
            self.patch_list_aux(e.f, end, reg, load_false)?;
            self.patch_list_aux(e.t, end, reg, load_true)?;
        }
        e.f = NO_JUMP;
        e.t = NO_JUMP;
        e.info = reg;
        e.kind = ExpKind::NonReloc;
        Ok(())
    }

    pub(super) fn exp2nextreg(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        self.discharge_vars(e);
        self.free_exp(e);
        self.reserve_regs(1)?;
        self.exp2reg(e, self.fs.freereg - 1)
    }

    pub(super) fn exp2anyreg(&mut self, e: &mut ExpDesc) -> LuaResult<u32> {
        self.discharge_vars(e);
        if e.kind == ExpKind::NonReloc {
            if !e.has_jumps() {
                return Ok(e.info);
            }
            // A temporary can take the jumps' values in place
            if e.info >= self.fs.nactvar {
                self.exp2reg(e, e.info)?;
                return Ok(e.info);
            }
        }
        self.exp2nextreg(e)?;
        Ok(e.info)
    }

    /// Upvalues can be indexed in place
    pub(super) fn exp2anyregup(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        if e.kind != ExpKind::Upval || e.has_jumps() {
            self.exp2anyreg(e)?;
        }
        Ok(())
    }

    /// A register or a constant
    pub(super) fn exp2val(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        if e.has_jumps() {
            self.exp2anyreg(e)?;
        } else {
            self.discharge_vars(e);
        }
        Ok(())
    }

    /// Move a constant into the constant table when its index fits an operand
    fn exp2k(&mut self, e: &mut ExpDesc) -> bool {
        if e.has_jumps() {
            return false;
        }
        let info = match e.kind {
            ExpKind::True => self.fs.bool_constant(true),
            ExpKind::False => self.fs.bool_constant(false),
            ExpKind::Nil => self.fs.nil_constant(),
            ExpKind::KInt => self.fs.int_constant(e.ival),
            ExpKind::KFlt => self.fs.float_constant(e.nval),
            ExpKind::KStr | ExpKind::K => e.info,
            _ => return false,
        };
        if info <= Instruction::MAX_C {
            e.kind = ExpKind::K;
            e.info = info;
            true
        } else {
            false
        }
    }

    /// Constant operand if possible, otherwise a register
    fn exp2rk(&mut self, e: &mut ExpDesc) -> LuaResult<bool> {
        if self.exp2k(e) {
            Ok(true)
        } else {
            self.exp2anyreg(e)?;
            Ok(false)
        }
    }

    fn code_abrk(&mut self, op: OpCode, a: u32, b: u32, ec: &mut ExpDesc) -> LuaResult<()> {
        let k = self.exp2rk(ec)?;
        self.code_abck(op, a, b, ec.info, k);
        Ok(())
    }

    /// Assign `ex` to variable `var`
    pub(super) fn store_var(&mut self, var: &ExpDesc, ex: &mut ExpDesc) -> LuaResult<()> {
        match var.kind {
            ExpKind::Local => {
                self.free_exp(ex);
                return self.exp2reg(ex, var.var.ridx);
            }
            ExpKind::Upval => {
                let r = self.exp2anyreg(ex)?;
                self.code_abc(OpCode::SetUpval, r, var.info, 0);
            }
            ExpKind::IndexUp => self.code_abrk(OpCode::SetTabUp, var.ind.t, var.ind.idx, ex)?,
            ExpKind::IndexI => self.code_abrk(OpCode::SetI, var.ind.t, var.ind.idx, ex)?,
            ExpKind::IndexStr => self.code_abrk(OpCode::SetField, var.ind.t, var.ind.idx, ex)?,
            ExpKind::Indexed => self.code_abrk(OpCode::SetTable, var.ind.t, var.ind.idx, ex)?,
            _ => return Err(self.lex.syntax_error("syntax error")),
        }
        self.free_exp(ex);
        Ok(())
    }

    /// `e:key(...)`: method in a fresh register, `e` right after it
    pub(super) fn self_(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> LuaResult<()> {
        self.exp2anyreg(e)?;
        let ereg = e.info;
        self.free_exp(e);
        e.info = self.fs.freereg;
        e.kind = ExpKind::NonReloc;
        self.reserve_regs(2)?;
        self.code_abrk(OpCode::Self_, e.info, ereg, key)?;
        self.free_exp(key);
        Ok(())
    }

    // ===== Conditions =====

    fn negate_condition(&mut self, e: &ExpDesc) {
        let at = self.jump_control_pc(e.info as usize);
        let i = &mut self.fs.chunk.code[at];
        let k = i.get_k();
        i.set_k(!k);
    }

    /// Jump taken when `e` has truthiness `cond`
    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> LuaResult<usize> {
        if e.kind == ExpKind::Reloc {
            let ie = self.fs.chunk.code[e.info as usize];
            if ie.get_opcode() == OpCode::Not {
                // Test the operand of the NOT directly
                self.fs.chunk.code.pop();
                self.fs.chunk.line_info.pop();
                return Ok(self.cond_jump(OpCode::Test, ie.get_b(), 0, 0, !cond));
            }
        }
        self.discharge2anyreg(e)?;
        self.free_exp(e);
        Ok(self.cond_jump(OpCode::TestSet, NO_REG, e.info, 0, cond))
    }

    /// Fall through when `e` is true, jump out when false
    pub(super) fn go_if_true(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        self.discharge_vars(e);
        let pc = match e.kind {
            ExpKind::Jmp => {
                self.negate_condition(e);
                e.info as isize
            }
            ExpKind::K | ExpKind::KFlt | ExpKind::KInt | ExpKind::KStr | ExpKind::True => NO_JUMP,
            _ => self.jump_on_cond(e, false)? as isize,
        };
        self.concat_jumps(&mut e.f, pc)?;
        self.patch_to_here(e.t)?;
        e.t = NO_JUMP;
        Ok(())
    }

    /// Fall through when `e` is false, jump out when true
    pub(super) fn go_if_false(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        self.discharge_vars(e);
        let pc = match e.kind {
            ExpKind::Jmp => e.info as isize,
            ExpKind::Nil | ExpKind::False => NO_JUMP,
            _ => self.jump_on_cond(e, true)? as isize,
        };
        self.concat_jumps(&mut e.t, pc)?;
        self.patch_to_here(e.f)?;
        e.f = NO_JUMP;
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::K | ExpKind::KFlt | ExpKind::KInt | ExpKind::KStr | ExpKind::True => {
                e.kind = ExpKind::False
            }
            ExpKind::Jmp => self.negate_condition(e),
            _ => {
                self.discharge2anyreg(e)?;
                self.free_exp(e);
                e.info = self.code_abc(OpCode::Not, 0, e.info, 0) as u32;
                e.kind = ExpKind::Reloc;
            }
        }
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(())
    }

    // ===== Indexing =====

    fn is_kstr(&self, e: &ExpDesc) -> bool {
        e.kind == ExpKind::K
            && !e.has_jumps()
            && e.info <= Instruction::MAX_B
            && self.fs.is_string_constant(e.info)
    }

    fn is_cint(e: &ExpDesc) -> bool {
        e.kind == ExpKind::KInt && !e.has_jumps() && (0..=Instruction::MAX_C as i64).contains(&e.ival)
    }

    /// `t[k]`: `t` is already in a register or an upvalue
    pub(super) fn indexed(&mut self, t: &mut ExpDesc, k: &mut ExpDesc) -> LuaResult<()> {
        if k.kind == ExpKind::KStr {
            k.kind = ExpKind::K;
        }
        if t.kind == ExpKind::Upval && !self.is_kstr(k) {
            self.exp2anyreg(t)?;
        }
        if t.kind == ExpKind::Upval {
            t.ind.t = t.info;
            t.ind.idx = k.info;
            t.kind = ExpKind::IndexUp;
        } else {
            t.ind.t = if t.kind == ExpKind::Local { t.var.ridx } else { t.info };
            if self.is_kstr(k) {
                t.ind.idx = k.info;
                t.kind = ExpKind::IndexStr;
            } else if Self::is_cint(k) {
                t.ind.idx = k.ival as u32;
                t.kind = ExpKind::IndexI;
            } else {
                t.ind.idx = self.exp2anyreg(k)?;
                t.kind = ExpKind::Indexed;
            }
        }
        Ok(())
    }

    // ===== Operators =====

    /// Fold `e1 op e2` into `e1` when both are numerals
    fn const_folding(op: TmKind, e1: &mut ExpDesc, e2: &ExpDesc) -> bool {
        let (Some(v1), Some(v2)) = (e1.numeral(), e2.numeral()) else {
            return false;
        };
        if !valid_fold(op, v1, v2) {
            return false;
        }
        match arith_numbers(op, v1, v2) {
            Some(LuaValue::Integer(i)) => {
                e1.kind = ExpKind::KInt;
                e1.ival = i;
                true
            }
            // NaN and zero are left to run time
            Some(LuaValue::Float(n)) if !n.is_nan() && n != 0.0 => {
                e1.kind = ExpKind::KFlt;
                e1.nval = n;
                true
            }
            _ => false,
        }
    }

    fn code_unexpval(&mut self, op: OpCode, e: &mut ExpDesc, line: u32) -> LuaResult<()> {
        let r = self.exp2anyreg(e)?;
        self.free_exp(e);
        e.info = self.code_abc(op, 0, r, 0) as u32;
        e.kind = ExpKind::Reloc;
        self.fix_line(line);
        Ok(())
    }

    pub(super) fn prefix(&mut self, op: UnOpr, e: &mut ExpDesc, line: u32) -> LuaResult<()> {
        self.discharge_vars(e);
        match op {
            UnOpr::Minus | UnOpr::BNot => {
                let (tm, opcode) = if op == UnOpr::Minus {
                    (TmKind::Unm, OpCode::Unm)
                } else {
                    (TmKind::BNot, OpCode::BNot)
                };
                if Self::const_folding(tm, e, &ExpDesc::int(0)) {
                    return Ok(());
                }
                self.code_unexpval(opcode, e, line)
            }
            UnOpr::Len => self.code_unexpval(OpCode::Len, e, line),
            UnOpr::Not => self.code_not(e),
        }
    }

    /// Prepare the first operand before the second one is read
    pub(super) fn infix(&mut self, op: BinOpr, v: &mut ExpDesc) -> LuaResult<()> {
        match op {
            BinOpr::And => self.go_if_true(v),
            BinOpr::Or => self.go_if_false(v),
            BinOpr::Concat => self.exp2nextreg(v),
            BinOpr::Eq | BinOpr::Ne => {
                if v.numeral().is_none() {
                    self.exp2rk(v)?;
                }
                Ok(())
            }
            // Numerals wait for a possible fold
            _ => {
                if v.numeral().is_none() {
                    self.exp2anyreg(v)?;
                }
                Ok(())
            }
        }
    }

    /// Finish `e1 op e2`, leaving the result in `e1`
    pub(super) fn posfix(&mut self, op: BinOpr, e1: &mut ExpDesc, e2: &mut ExpDesc, line: u32) -> LuaResult<()> {
        self.discharge_vars(e2);
        if let Some(tm) = op.tm()
            && Self::const_folding(tm, e1, e2)
        {
            return Ok(());
        }
        match op {
            BinOpr::And => {
                debug_assert_eq!(e1.t, NO_JUMP);
                self.concat_jumps(&mut e2.f, e1.f)?;
                *e1 = *e2;
            }
            BinOpr::Or => {
                debug_assert_eq!(e1.f, NO_JUMP);
                self.concat_jumps(&mut e2.t, e1.t)?;
                *e1 = *e2;
            }
            BinOpr::Concat => {
                self.exp2nextreg(e2)?;
                self.code_concat(e1, e2, line)?;
            }
            BinOpr::Eq | BinOpr::Ne => self.code_eq(op, e1, e2)?,
            BinOpr::Lt => self.code_order(OpCode::Lt, e1, e2)?,
            BinOpr::Le => self.code_order(OpCode::Le, e1, e2)?,
            // a > b is b < a
            BinOpr::Gt => {
                std::mem::swap(e1, e2);
                self.code_order(OpCode::Lt, e1, e2)?;
            }
            BinOpr::Ge => {
                std::mem::swap(e1, e2);
                self.code_order(OpCode::Le, e1, e2)?;
            }
            _ => self.code_bin(op, e1, e2, line)?,
        }
        Ok(())
    }

    fn code_bin(&mut self, op: BinOpr, e1: &mut ExpDesc, e2: &mut ExpDesc, line: u32) -> LuaResult<()> {
        let r2 = self.exp2anyreg(e2)?;
        let r1 = self.exp2anyreg(e1)?;
        let pc = self.code_abc(op.arith_opcode(), 0, r1, r2);
        self.free_exps(e1, e2);
        e1.info = pc as u32;
        e1.kind = ExpKind::Reloc;
        self.fix_line(line);
        Ok(())
    }

    fn code_order(&mut self, op: OpCode, e1: &mut ExpDesc, e2: &mut ExpDesc) -> LuaResult<()> {
        let r1 = self.exp2anyreg(e1)?;
        let r2 = self.exp2anyreg(e2)?;
        self.free_exps(e1, e2);
        e1.info = self.cond_jump(op, r1, r2, 0, true) as u32;
        e1.kind = ExpKind::Jmp;
        Ok(())
    }

    fn code_eq(&mut self, op: BinOpr, e1: &mut ExpDesc, e2: &mut ExpDesc) -> LuaResult<()> {
        // A constant first operand trades places with the second
        if e1.kind != ExpKind::NonReloc {
            std::mem::swap(e1, e2);
        }
        let r1 = self.exp2anyreg(e1)?;
        let opcode = if self.exp2rk(e2)? { OpCode::EqK } else { OpCode::Eq };
        let r2 = e2.info;
        self.free_exps(e1, e2);
        e1.info = self.cond_jump(opcode, r1, r2, 0, op == BinOpr::Eq) as u32;
        e1.kind = ExpKind::Jmp;
        Ok(())
    }

    /// `e1` sits right below `e2`; consecutive concatenations merge into
    /// one instruction
    fn code_concat(&mut self, e1: &mut ExpDesc, e2: &mut ExpDesc, line: u32) -> LuaResult<()> {
        if let Some(prev) = self.previous_instruction()
            && self.fs.chunk.code[prev].get_opcode() == OpCode::Concat
        {
            let n = self.fs.chunk.code[prev].get_b();
            debug_assert_eq!(e1.info + 1, self.fs.chunk.code[prev].get_a());
            self.free_exp(e2);
            let i = &mut self.fs.chunk.code[prev];
            i.set_a(e1.info);
            i.set_b(n + 1);
        } else {
            self.code_abc(OpCode::Concat, e1.info, 2, 0);
            self.free_exp(e2);
            self.fix_line(line);
        }
        Ok(())
    }

    // ===== Tables =====

    /// Store `tostore` pending list items (-1: up to top) after the
    /// `nelems` already stored
    pub(super) fn set_list(&mut self, base: u32, nelems: u32, tostore: i32) {
        let b = if tostore < 0 { 0 } else { tostore as u32 };
        let limit = Instruction::MAX_C + 1;
        if nelems < limit {
            self.code_abc(OpCode::SetList, base, b, nelems);
        } else {
            self.code_abck(OpCode::SetList, base, b, nelems % limit, true);
            self.code_extra_arg(nelems / limit);
        }
        self.fs.freereg = base + 1;
    }

    /// Patch the NEWTABLE at `pc` and its EXTRAARG with the final sizes
    pub(super) fn set_table_size(&mut self, pc: usize, ra: u32, asize: u32, hsize: u32) {
        let limit = Instruction::MAX_C + 1;
        let rb = if hsize != 0 { ceil_log2(hsize) + 1 } else { 0 };
        let extra = asize / limit;
        let rc = asize % limit;
        self.fs.chunk.code[pc] = Instruction::create_abck(OpCode::NewTable, ra, rb, rc, extra > 0);
        self.fs.chunk.code[pc + 1] = Instruction::create_ax(OpCode::ExtraArg, extra);
    }

    // ===== Final pass =====

    /// Destination of the chain of unconditional jumps starting at `pc`
    fn final_target(&self, mut pc: usize) -> usize {
        for _ in 0..100 {
            let i = self.fs.chunk.code[pc];
            if i.get_opcode() != OpCode::Jmp {
                break;
            }
            pc = (pc as isize + 1 + i.get_sj() as isize) as usize;
        }
        pc
    }

    /// Mark returns that must close variables and shortcut jump chains
    pub(super) fn finish_code(&mut self) -> LuaResult<()> {
        for pc in 0..self.fs.pc() {
            let i = self.fs.chunk.code[pc];
            match i.get_opcode() {
                OpCode::Return => {
                    if self.fs.needclose {
                        self.fs.chunk.code[pc].set_k(true);
                    }
                }
                OpCode::Jmp => {
                    let target = self.final_target(pc);
                    self.fix_jump(pc, target)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priorities() {
        assert!(BinOpr::Mul.priority().0 > BinOpr::Add.priority().0);
        // Right associative
        let (l, r) = BinOpr::Pow.priority();
        assert!(r < l);
        let (l, r) = BinOpr::Concat.priority();
        assert!(r < l);
        assert!(BinOpr::And.priority().0 > BinOpr::Or.priority().0);
    }

    #[test]
    fn test_fold_rules() {
        let mut e = ExpDesc::int(7);
        assert!(Parser::const_folding(TmKind::IDiv, &mut e, &ExpDesc::int(2)));
        assert_eq!(e.ival, 3);

        let mut e = ExpDesc::int(1);
        assert!(!Parser::const_folding(TmKind::Mod, &mut e, &ExpDesc::int(0)));

        let mut e = ExpDesc::float(1.5);
        assert!(!Parser::const_folding(TmKind::BAnd, &mut e, &ExpDesc::int(1)));

        let mut e = ExpDesc::float(0.0);
        assert!(!Parser::const_folding(TmKind::Unm, &mut e, &ExpDesc::int(0)));
    }

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }
}
