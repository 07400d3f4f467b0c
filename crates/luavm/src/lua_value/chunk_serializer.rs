// Binary chunk format for `dump`/`load`.
//
// Layout: header (signature, version, format, check data, sizes and test
// numbers), one byte with the number of upvalues of the main function,
// then the main function. Functions are written recursively: source,
// line range, parameters, code, constants, upvalues, nested functions and
// debug info. Integers are little-endian; sizes are u32.
//
// Loaded code is verified before it reaches the interpreter: every
// register, constant, upvalue and nested-function operand must be in range
// and every jump must land inside the function.

use std::io::{Cursor, Read};
use std::rc::Rc;

use smol_str::SmolStr;

use super::{Chunk, Constant, LocVar, UpvalueDesc};
use crate::lua_vm::{Instruction, LuaError, LuaResult, OpCode};

const SIGNATURE: &[u8] = b"\x1bLua";
const VERSION: u8 = 0x54;
const FORMAT: u8 = 0;
/// Catches newline and EOF conversions of text-mode transfers
const CHECK_DATA: &[u8] = b"\x19\x93\r\n\x1a\n";
const CHECK_INT: i64 = 0x5678;
const CHECK_NUM: f64 = 370.5;

/// Nested functions deeper than this are rejected
const MAX_NESTING: usize = 200;

const TAG_NIL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x11;
const TAG_INTEGER: u8 = 0x03;
const TAG_FLOAT: u8 = 0x13;
const TAG_STRING: u8 = 0x04;

/// Serialize `chunk`. With `strip`, line info, local and upvalue names
/// and the source name are left out.
pub fn dump(chunk: &Chunk, strip: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + chunk.code.len() * 4);
    buf.extend_from_slice(SIGNATURE);
    buf.push(VERSION);
    buf.push(FORMAT);
    buf.extend_from_slice(CHECK_DATA);
    buf.push(std::mem::size_of::<Instruction>() as u8);
    buf.push(std::mem::size_of::<i64>() as u8);
    buf.push(std::mem::size_of::<f64>() as u8);
    write_i64(&mut buf, CHECK_INT);
    write_f64(&mut buf, CHECK_NUM);
    buf.push(chunk.upvalue_descs.len() as u8);
    write_function(&mut buf, chunk, strip);
    buf
}

/// Rebuild a chunk from `dump` output
pub fn undump(data: &[u8]) -> LuaResult<Chunk> {
    let mut reader = Reader {
        cursor: Cursor::new(data),
    };
    reader.check_header()?;
    let nupvalues = reader.u8()? as usize;
    let chunk = reader.function(0)?;
    if chunk.upvalue_descs.len() != nupvalues {
        return Err(bad("upvalue count mismatch"));
    }
    if (reader.cursor.position() as usize) != data.len() {
        return Err(bad("trailing bytes after chunk"));
    }
    verify(&chunk, None)?;
    Ok(chunk)
}

pub fn is_binary_chunk(data: &[u8]) -> bool {
    data.starts_with(SIGNATURE)
}

fn bad(msg: &str) -> LuaError {
    LuaError::BadBytecode(msg.to_string())
}

// ===== Writing =====

fn write_function(buf: &mut Vec<u8>, chunk: &Chunk, strip: bool) {
    match (&chunk.source_name, strip) {
        (Some(name), false) => write_bytes(buf, name.as_bytes()),
        _ => write_u32(buf, 0),
    }
    write_u32(buf, chunk.linedefined);
    write_u32(buf, chunk.lastlinedefined);
    buf.push(chunk.param_count as u8);
    buf.push(chunk.is_vararg as u8);
    buf.push(chunk.max_stack_size as u8);

    write_u32(buf, chunk.code.len() as u32);
    for instr in &chunk.code {
        write_u32(buf, instr.as_u32());
    }

    write_u32(buf, chunk.constants.len() as u32);
    for k in &chunk.constants {
        match k {
            Constant::Nil => buf.push(TAG_NIL),
            Constant::Boolean(false) => buf.push(TAG_FALSE),
            Constant::Boolean(true) => buf.push(TAG_TRUE),
            Constant::Integer(i) => {
                buf.push(TAG_INTEGER);
                write_i64(buf, *i);
            }
            Constant::Float(f) => {
                buf.push(TAG_FLOAT);
                write_f64(buf, *f);
            }
            Constant::String(s) => {
                buf.push(TAG_STRING);
                write_bytes(buf, s);
            }
        }
    }

    write_u32(buf, chunk.upvalue_descs.len() as u32);
    for desc in &chunk.upvalue_descs {
        buf.push(desc.in_stack as u8);
        buf.push(desc.index);
    }

    write_u32(buf, chunk.child_protos.len() as u32);
    for child in &chunk.child_protos {
        write_function(buf, child, strip);
    }

    if strip {
        write_u32(buf, 0);
        write_u32(buf, 0);
        write_u32(buf, 0);
        return;
    }
    write_u32(buf, chunk.line_info.len() as u32);
    for &line in &chunk.line_info {
        write_u32(buf, line);
    }
    write_u32(buf, chunk.locals.len() as u32);
    for var in &chunk.locals {
        write_bytes(buf, var.name.as_bytes());
        write_u32(buf, var.start_pc);
        write_u32(buf, var.end_pc);
    }
    write_u32(buf, chunk.upvalue_descs.len() as u32);
    for desc in &chunk.upvalue_descs {
        write_bytes(buf, desc.name.as_bytes());
    }
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_f64(buf: &mut Vec<u8>, value: f64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

// ===== Reading =====

struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl Reader<'_> {
    fn fill(&mut self, out: &mut [u8]) -> LuaResult<()> {
        self.cursor
            .read_exact(out)
            .map_err(|_| bad("truncated precompiled chunk"))
    }

    fn u8(&mut self) -> LuaResult<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        Ok(b[0])
    }

    fn u32(&mut self) -> LuaResult<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn i64(&mut self) -> LuaResult<i64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    fn f64(&mut self) -> LuaResult<f64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(f64::from_le_bytes(b))
    }

    /// Element count, checked against the bytes left so that a corrupt
    /// length cannot request a huge allocation
    fn count(&mut self, min_elem_size: usize) -> LuaResult<usize> {
        let n = self.u32()? as usize;
        let left = self.cursor.get_ref().len() - self.cursor.position() as usize;
        if n.saturating_mul(min_elem_size) > left {
            return Err(bad("truncated precompiled chunk"));
        }
        Ok(n)
    }

    fn bytes(&mut self) -> LuaResult<Vec<u8>> {
        let n = self.count(1)?;
        let mut out = vec![0u8; n];
        self.fill(&mut out)?;
        Ok(out)
    }

    fn name(&mut self) -> LuaResult<SmolStr> {
        let bytes = self.bytes()?;
        Ok(SmolStr::new(String::from_utf8_lossy(&bytes)))
    }

    fn check_header(&mut self) -> LuaResult<()> {
        let mut sig = [0u8; 4];
        self.fill(&mut sig).map_err(|_| bad("not a binary chunk"))?;
        if sig != SIGNATURE {
            return Err(bad("not a binary chunk"));
        }
        if self.u8()? != VERSION {
            return Err(bad("version mismatch"));
        }
        if self.u8()? != FORMAT {
            return Err(bad("format mismatch"));
        }
        let mut check = [0u8; 6];
        self.fill(&mut check)?;
        if check != CHECK_DATA {
            return Err(bad("corrupted chunk"));
        }
        if self.u8()? as usize != std::mem::size_of::<Instruction>() {
            return Err(bad("Instruction size mismatch"));
        }
        if self.u8()? as usize != std::mem::size_of::<i64>() {
            return Err(bad("lua_Integer size mismatch"));
        }
        if self.u8()? as usize != std::mem::size_of::<f64>() {
            return Err(bad("lua_Number size mismatch"));
        }
        if self.i64()? != CHECK_INT {
            return Err(bad("integer format mismatch"));
        }
        if self.f64()? != CHECK_NUM {
            return Err(bad("float format mismatch"));
        }
        Ok(())
    }

    fn function(&mut self, depth: usize) -> LuaResult<Chunk> {
        if depth > MAX_NESTING {
            return Err(bad("functions nested too deeply"));
        }
        let source = self.bytes()?;
        let source_name = if source.is_empty() {
            None
        } else {
            Some(SmolStr::new(String::from_utf8_lossy(&source)))
        };
        let linedefined = self.u32()?;
        let lastlinedefined = self.u32()?;
        let param_count = self.u8()? as usize;
        let is_vararg = self.u8()? != 0;
        let max_stack_size = self.u8()? as usize;
        if param_count > max_stack_size {
            return Err(bad("parameters exceed the frame size"));
        }

        let ncode = self.count(4)?;
        let mut code = Vec::with_capacity(ncode);
        for _ in 0..ncode {
            let instr = Instruction::from_u32(self.u32()?);
            if OpCode::from_u8(instr.opcode_byte()).is_none() {
                return Err(bad("invalid opcode"));
            }
            code.push(instr);
        }
        if code.is_empty() {
            return Err(bad("function without code"));
        }

        let nk = self.count(1)?;
        let mut constants = Vec::with_capacity(nk);
        for _ in 0..nk {
            let k = match self.u8()? {
                TAG_NIL => Constant::Nil,
                TAG_FALSE => Constant::Boolean(false),
                TAG_TRUE => Constant::Boolean(true),
                TAG_INTEGER => Constant::Integer(self.i64()?),
                TAG_FLOAT => Constant::Float(self.f64()?),
                TAG_STRING => Constant::String(self.bytes()?.into_boxed_slice()),
                _ => return Err(bad("unknown constant tag")),
            };
            constants.push(k);
        }

        let nup = self.count(2)?;
        let mut upvalue_descs = Vec::with_capacity(nup);
        for _ in 0..nup {
            let in_stack = self.u8()? != 0;
            let index = self.u8()?;
            upvalue_descs.push(UpvalueDesc {
                in_stack,
                index,
                name: SmolStr::default(),
            });
        }

        let nchild = self.count(1)?;
        let mut child_protos = Vec::with_capacity(nchild);
        for _ in 0..nchild {
            child_protos.push(Rc::new(self.function(depth + 1)?));
        }

        let nlines = self.count(4)?;
        if nlines != 0 && nlines != code.len() {
            return Err(bad("line info does not match the code"));
        }
        let mut line_info = Vec::with_capacity(nlines);
        for _ in 0..nlines {
            line_info.push(self.u32()?);
        }

        let nlocals = self.count(12)?;
        let mut locals = Vec::with_capacity(nlocals);
        for _ in 0..nlocals {
            let name = self.name()?;
            let start_pc = self.u32()?;
            let end_pc = self.u32()?;
            locals.push(LocVar {
                name,
                start_pc,
                end_pc,
            });
        }

        let nnames = self.count(4)?;
        if nnames != 0 && nnames != upvalue_descs.len() {
            return Err(bad("upvalue names do not match the upvalues"));
        }
        for desc in upvalue_descs.iter_mut().take(nnames) {
            desc.name = self.name()?;
        }

        Ok(Chunk {
            code,
            constants,
            locals,
            param_count,
            is_vararg,
            max_stack_size,
            child_protos,
            upvalue_descs,
            source_name,
            line_info,
            linedefined,
            lastlinedefined,
        })
    }
}

// ===== Verification =====

fn verify(chunk: &Chunk, parent: Option<&Chunk>) -> LuaResult<()> {
    if let Some(parent) = parent {
        for desc in &chunk.upvalue_descs {
            let limit = if desc.in_stack {
                parent.max_stack_size
            } else {
                parent.upvalue_descs.len()
            };
            if desc.index as usize >= limit {
                return Err(bad("upvalue index out of range"));
            }
        }
    }
    Verifier::new(chunk).run()?;
    for child in &chunk.child_protos {
        verify(child, Some(chunk))?;
    }
    Ok(())
}

/// Operand checks for one function body
struct Verifier<'a> {
    chunk: &'a Chunk,
    code: &'a [Instruction],
    frame: usize,
}

impl<'a> Verifier<'a> {
    fn new(chunk: &'a Chunk) -> Self {
        Verifier {
            chunk,
            code: &chunk.code,
            frame: chunk.max_stack_size,
        }
    }

    /// Register `r` lies inside the frame
    fn reg(&self, r: u32) -> LuaResult<()> {
        self.span(r, 1)
    }

    /// Registers `first..first + count` lie inside the frame
    fn span(&self, first: u32, count: usize) -> LuaResult<()> {
        if first as usize + count <= self.frame {
            Ok(())
        } else {
            Err(bad("register out of range"))
        }
    }

    fn konst(&self, index: usize) -> LuaResult<()> {
        if index < self.chunk.constants.len() {
            Ok(())
        } else {
            Err(bad("constant index out of range"))
        }
    }

    fn upval(&self, index: u32) -> LuaResult<()> {
        if (index as usize) < self.chunk.upvalue_descs.len() {
            Ok(())
        } else {
            Err(bad("upvalue index out of range"))
        }
    }

    /// Operand C: a constant with k set, a register otherwise
    fn rk(&self, instr: Instruction) -> LuaResult<()> {
        if instr.get_k() {
            self.konst(instr.get_c() as usize)
        } else {
            self.reg(instr.get_c())
        }
    }

    fn target(&self, pc: isize) -> LuaResult<usize> {
        if pc >= 0 && (pc as usize) < self.code.len() {
            Ok(pc as usize)
        } else {
            Err(bad("jump out of range"))
        }
    }

    /// Argument of the EXTRAARG that must follow `pc`
    fn extra_arg(&self, pc: usize) -> LuaResult<usize> {
        match self.code.get(pc + 1) {
            Some(next) if next.get_opcode() == OpCode::ExtraArg => Ok(next.get_ax() as usize),
            _ => Err(bad("missing EXTRAARG")),
        }
    }

    fn run(&self) -> LuaResult<()> {
        use OpCode::*;
        let code = self.code;
        let n = code.len();
        if code[n - 1].get_opcode() != Return {
            return Err(bad("function does not end with RETURN"));
        }
        if self.chunk.is_vararg != (code[0].get_opcode() == VarargPrep) {
            return Err(bad("vararg header does not match the code"));
        }

        let mut targets = Vec::new();
        let mut pc = 0;
        while pc < n {
            let instr = code[pc];
            let op = instr.get_opcode();
            let (a, b, c) = (instr.get_a(), instr.get_b(), instr.get_c());
            let next = pc as isize + 1;
            if op.is_test() && code.get(pc + 1).map(|i| i.get_opcode()) != Some(Jmp) {
                return Err(bad("comparison not followed by a jump"));
            }
            self.check_open_results(pc, instr)?;
            match op {
                Move | Unm | BNot | Not | Len | GetI => {
                    self.reg(a)?;
                    self.reg(b)?;
                }
                LoadI | LoadF | LoadFalse | LoadTrue | Close | Tbc | Test => self.reg(a)?,
                LoadK => {
                    self.reg(a)?;
                    self.konst(instr.get_bx() as usize)?;
                }
                LoadKX => {
                    self.reg(a)?;
                    self.konst(self.extra_arg(pc)?)?;
                    pc += 1;
                }
                LFalseSkip => {
                    self.reg(a)?;
                    targets.push(self.target(next + 1)?);
                }
                LoadNil => self.span(a, b as usize + 1)?,
                GetUpval | SetUpval => {
                    self.reg(a)?;
                    self.upval(b)?;
                }
                GetTabUp => {
                    self.reg(a)?;
                    self.upval(b)?;
                    self.konst(c as usize)?;
                }
                GetTable | Add | Sub | Mul | Mod | Pow | Div | IDiv | BAnd | BOr | BXor | Shl
                | Shr => {
                    self.reg(a)?;
                    self.reg(b)?;
                    self.reg(c)?;
                }
                GetField => {
                    self.reg(a)?;
                    self.reg(b)?;
                    self.konst(c as usize)?;
                }
                SetTabUp => {
                    self.upval(a)?;
                    self.konst(b as usize)?;
                    self.rk(instr)?;
                }
                SetTable => {
                    self.reg(a)?;
                    self.reg(b)?;
                    self.rk(instr)?;
                }
                SetI => {
                    self.reg(a)?;
                    self.rk(instr)?;
                }
                SetField => {
                    self.reg(a)?;
                    self.konst(b as usize)?;
                    self.rk(instr)?;
                }
                NewTable => {
                    self.reg(a)?;
                    let extra = self.extra_arg(pc)?;
                    let mut array = c as usize;
                    if instr.get_k() {
                        array += extra * (Instruction::MAX_C as usize + 1);
                    }
                    // Every constructor item costs at least one instruction
                    let hash_ok = b == 0 || 1usize.checked_shl(b - 1).is_some_and(|h| h <= 2 * n);
                    if array > n || !hash_ok {
                        return Err(bad("table size hint out of range"));
                    }
                    pc += 1;
                }
                Self_ => {
                    self.span(a, 2)?;
                    self.reg(b)?;
                    self.rk(instr)?;
                }
                Concat => {
                    if b == 0 {
                        return Err(bad("empty concatenation"));
                    }
                    self.span(a, b as usize)?;
                }
                Jmp => targets.push(self.target(next + instr.get_sj() as isize)?),
                Eq | Lt | Le | TestSet => {
                    self.reg(a)?;
                    self.reg(b)?;
                }
                EqK => {
                    self.reg(a)?;
                    self.konst(b as usize)?;
                }
                Call => {
                    self.reg(a)?;
                    if b != 0 {
                        self.span(a, b as usize)?;
                    }
                    if c != 0 {
                        self.span(a, c as usize - 1)?;
                    }
                }
                TailCall => {
                    self.reg(a)?;
                    if b != 0 {
                        self.span(a, b as usize)?;
                    }
                }
                Return => {
                    if b != 0 {
                        self.span(a, b as usize - 1)?;
                    } else {
                        self.span(a, 0)?;
                    }
                }
                ForLoop => {
                    self.span(a, 4)?;
                    targets.push(self.target(next - instr.get_bx() as isize)?);
                }
                ForPrep => {
                    self.span(a, 4)?;
                    targets.push(self.target(next + instr.get_bx() as isize + 1)?);
                }
                TForPrep => {
                    self.span(a, 4)?;
                    targets.push(self.target(next + instr.get_bx() as isize)?);
                }
                TForCall => {
                    self.span(a, 7)?;
                    self.span(a + 4, c as usize)?;
                }
                TForLoop => {
                    self.span(a, 5)?;
                    targets.push(self.target(next - instr.get_bx() as isize)?);
                }
                SetList => {
                    self.reg(a)?;
                    if b != 0 {
                        self.span(a, b as usize + 1)?;
                    }
                    if instr.get_k() {
                        self.extra_arg(pc)?;
                        pc += 1;
                    }
                }
                Closure => {
                    self.reg(a)?;
                    if instr.get_bx() as usize >= self.chunk.child_protos.len() {
                        return Err(bad("nested function index out of range"));
                    }
                }
                Vararg => {
                    if !self.chunk.is_vararg {
                        return Err(bad("VARARG in a function without varargs"));
                    }
                    self.reg(a)?;
                    if c != 0 {
                        self.span(a, c as usize - 1)?;
                    }
                }
                VarargPrep => {
                    if pc != 0 {
                        return Err(bad("VARARGPREP is not the first instruction"));
                    }
                }
                ExtraArg => return Err(bad("unexpected EXTRAARG")),
            }
            pc += 1;
        }

        for t in targets {
            if t == 0 && self.chunk.is_vararg {
                return Err(bad("jump back to VARARGPREP"));
            }
            if takes_open_args(code[t]) {
                return Err(bad("jump into an open call sequence"));
            }
        }
        Ok(())
    }

    /// Instructions leaving a variable number of values on the stack must
    /// hand them straight to an instruction that reads up to the top
    fn check_open_results(&self, pc: usize, instr: Instruction) -> LuaResult<()> {
        if leaves_open_results(instr) {
            let ok = self.code.get(pc + 1).is_some_and(|next| {
                takes_open_args(*next)
                    && match next.get_opcode() {
                        OpCode::Return => next.get_a() <= instr.get_a(),
                        _ => next.get_a() < instr.get_a(),
                    }
            });
            if !ok {
                return Err(bad("open results not consumed"));
            }
        }
        if takes_open_args(instr) && (pc == 0 || !leaves_open_results(self.code[pc - 1])) {
            return Err(bad("open arguments without a producer"));
        }
        Ok(())
    }
}

fn leaves_open_results(instr: Instruction) -> bool {
    match instr.get_opcode() {
        OpCode::Call | OpCode::Vararg => instr.get_c() == 0,
        OpCode::TailCall => true,
        _ => false,
    }
}

fn takes_open_args(instr: Instruction) -> bool {
    matches!(
        instr.get_opcode(),
        OpCode::Call | OpCode::TailCall | OpCode::Return | OpCode::SetList
    ) && instr.get_b() == 0
}
