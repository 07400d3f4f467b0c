// Debug information for error messages and tracebacks: source positions,
// names of the values involved in a failing instruction (recovered by
// symbolic execution of the bytecode), function names and stack traces.

use crate::lua_value::{Chunk, Constant, LuaFunction, LuaValue};
use crate::lua_vm::call_status::CIST_TAIL;
use crate::lua_vm::lua_limits::MAX_SRC_LEN;
use crate::lua_vm::{CallInfo, LuaError, LuaVM, OpCode, TmKind, ValueSource};

/// Levels shown at the top and at the bottom of a long traceback
const LEVELS1: usize = 10;
const LEVELS2: usize = 11;

/// Printable form of a chunk name: `=name` and `@file` are shown as is,
/// source text as `[string "first line..."]`
pub fn chunk_id(source: Option<&str>) -> String {
    let Some(source) = source else {
        return "?".to_string();
    };
    if let Some(rest) = source.strip_prefix('=') {
        return rest.chars().take(MAX_SRC_LEN - 1).collect();
    }
    if let Some(rest) = source.strip_prefix('@') {
        let len = rest.chars().count();
        if len < MAX_SRC_LEN {
            return rest.to_string();
        }
        let tail: String = rest.chars().skip(len - (MAX_SRC_LEN - 4)).collect();
        return format!("...{tail}");
    }
    const PRE: &str = "[string \"";
    const RETS: &str = "...";
    const POS: &str = "\"]";
    let budget = MAX_SRC_LEN - PRE.len() - RETS.len() - POS.len() - 1;
    let first_line = source.split('\n').next().unwrap_or("");
    let len = first_line.chars().count();
    if len < budget && first_line.len() == source.len() {
        format!("{PRE}{source}{POS}")
    } else {
        let kept: String = first_line.chars().take(budget).collect();
        format!("{PRE}{kept}{RETS}{POS}")
    }
}

fn upvalue_name(chunk: &Chunk, idx: usize) -> String {
    match chunk.upvalue_descs.get(idx) {
        Some(desc) if !desc.name.is_empty() => desc.name.to_string(),
        _ => "?".to_string(),
    }
}

fn constant_name(chunk: &Chunk, idx: usize) -> Option<String> {
    match chunk.constants.get(idx) {
        Some(Constant::String(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

/// Index of the last instruction before `lastpc` that unconditionally wrote `reg`
fn find_set_reg(chunk: &Chunk, lastpc: usize, reg: u32) -> Option<usize> {
    let mut setreg = None;
    let mut jmptarget = 0usize;
    for pc in 0..lastpc.min(chunk.code.len()) {
        let i = chunk.code[pc];
        let op = i.get_opcode();
        let a = i.get_a();
        let change = match op {
            OpCode::LoadNil => a <= reg && reg <= a + i.get_b(),
            OpCode::TForCall => reg >= a + 2,
            OpCode::Call | OpCode::TailCall => reg >= a,
            OpCode::Jmp => {
                let dest = pc as isize + 1 + i.get_sj() as isize;
                if dest <= lastpc as isize && dest > jmptarget as isize {
                    jmptarget = dest as usize;
                }
                false
            }
            _ => op.sets_a() && reg == a,
        };
        if change {
            // Writes inside a conditional jump say nothing about `reg`
            setreg = if pc < jmptarget { None } else { Some(pc) };
        }
    }
    setreg
}

/// "global" when the indexed table is `_ENV`, "field" otherwise
fn table_kind(chunk: &Chunk, pc: usize, table: u32, is_upvalue: bool) -> &'static str {
    let name = if is_upvalue {
        Some(upvalue_name(chunk, table as usize))
    } else {
        get_obj_name(chunk, pc, table).map(|(_, n)| n)
    };
    if name.as_deref() == Some("_ENV") {
        "global"
    } else {
        "field"
    }
}

/// Name of a register holding a constant string, "?" otherwise
fn register_constant_name(chunk: &Chunk, pc: usize, reg: u32) -> String {
    match get_obj_name(chunk, pc, reg) {
        Some(("constant", name)) => name,
        _ => "?".to_string(),
    }
}

/// Describe the value in register `reg` at instruction `lastpc`:
/// `("local", "x")`, `("global", "print")`, `("field", "y")`, ...
pub(crate) fn get_obj_name(chunk: &Chunk, lastpc: usize, reg: u32) -> Option<(&'static str, String)> {
    if let Some(name) = chunk.local_name(reg as usize + 1, lastpc) {
        return Some(("local", name.to_string()));
    }
    let pc = find_set_reg(chunk, lastpc, reg)?;
    let i = chunk.code[pc];
    match i.get_opcode() {
        OpCode::Move => {
            let b = i.get_b();
            if b < i.get_a() {
                get_obj_name(chunk, pc, b)
            } else {
                None
            }
        }
        OpCode::GetTabUp => {
            let name = constant_name(chunk, i.get_c() as usize).unwrap_or_else(|| "?".into());
            Some((table_kind(chunk, pc, i.get_b(), true), name))
        }
        OpCode::GetTable => {
            let name = register_constant_name(chunk, pc, i.get_c());
            Some((table_kind(chunk, pc, i.get_b(), false), name))
        }
        OpCode::GetI => Some(("field", "integer index".to_string())),
        OpCode::GetField => {
            let name = constant_name(chunk, i.get_c() as usize).unwrap_or_else(|| "?".into());
            Some((table_kind(chunk, pc, i.get_b(), false), name))
        }
        OpCode::GetUpval => Some(("upvalue", upvalue_name(chunk, i.get_b() as usize))),
        OpCode::LoadK => constant_name(chunk, i.get_bx() as usize).map(|n| ("constant", n)),
        OpCode::LoadKX => {
            let ax = chunk.code.get(pc + 1)?.get_ax();
            constant_name(chunk, ax as usize).map(|n| ("constant", n))
        }
        OpCode::Self_ => {
            let name = if i.get_k() {
                constant_name(chunk, i.get_c() as usize).unwrap_or_else(|| "?".into())
            } else {
                register_constant_name(chunk, pc, i.get_c())
            };
            Some(("method", name))
        }
        _ => None,
    }
}

/// Name of the function called by instruction `pc`
fn func_name_from_code(chunk: &Chunk, pc: usize) -> Option<(&'static str, String)> {
    let i = *chunk.code.get(pc)?;
    let tm = match i.get_opcode() {
        OpCode::Call | OpCode::TailCall => return get_obj_name(chunk, pc, i.get_a()),
        OpCode::TForCall => return Some(("for iterator", "for iterator".to_string())),
        OpCode::Self_ | OpCode::GetTabUp | OpCode::GetTable | OpCode::GetI | OpCode::GetField => TmKind::Index,
        OpCode::SetTabUp | OpCode::SetTable | OpCode::SetI | OpCode::SetField => TmKind::NewIndex,
        OpCode::Add => TmKind::Add,
        OpCode::Sub => TmKind::Sub,
        OpCode::Mul => TmKind::Mul,
        OpCode::Mod => TmKind::Mod,
        OpCode::Pow => TmKind::Pow,
        OpCode::Div => TmKind::Div,
        OpCode::IDiv => TmKind::IDiv,
        OpCode::BAnd => TmKind::BAnd,
        OpCode::BOr => TmKind::BOr,
        OpCode::BXor => TmKind::BXor,
        OpCode::Shl => TmKind::Shl,
        OpCode::Shr => TmKind::Shr,
        OpCode::Unm => TmKind::Unm,
        OpCode::BNot => TmKind::BNot,
        OpCode::Len => TmKind::Len,
        OpCode::Concat => TmKind::Concat,
        OpCode::Eq => TmKind::Eq,
        OpCode::Lt => TmKind::Lt,
        OpCode::Le => TmKind::Le,
        OpCode::Close | OpCode::Return => TmKind::Close,
        _ => return None,
    };
    Some(("metamethod", tm.short_name().to_string()))
}

impl LuaVM {
    /// Chunk of the Lua function running in `ci`
    fn frame_chunk(&self, ci: &CallInfo) -> Option<&Chunk> {
        if !ci.is_lua() {
            return None;
        }
        match self.state.stack.get(ci.func)? {
            LuaValue::Function(fid) => match self.pool.functions.get(*fid)? {
                LuaFunction::Lua(c) => Some(c.proto.chunk.as_ref()),
                LuaFunction::Host(_) => None,
            },
            _ => None,
        }
    }

    fn frame_at_level(&self, level: usize) -> Option<&CallInfo> {
        let len = self.state.call_infos.len();
        if level >= len {
            return None;
        }
        self.state.call_infos.get(len - 1 - level)
    }

    fn current_line(&self, ci: &CallInfo) -> Option<u32> {
        self.frame_chunk(ci)?.line_at(ci.current_pc())
    }

    /// `chunk:line: ` of the Lua function at `level` (0 = running function),
    /// empty for native frames
    pub fn where_(&self, level: usize) -> String {
        let Some(ci) = self.frame_at_level(level) else {
            return String::new();
        };
        let (Some(chunk), Some(line)) = (self.frame_chunk(ci), self.current_line(ci)) else {
            return String::new();
        };
        format!("{}:{}: ", chunk_id(chunk.source_name.as_deref()), line)
    }

    /// ` (local 'x')`-style description of where an operand came from
    pub(crate) fn varinfo(&self, src: ValueSource) -> String {
        let Some(ci) = self.state.call_infos.last() else {
            return String::new();
        };
        let Some(chunk) = self.frame_chunk(ci) else {
            return String::new();
        };
        let found = match src {
            ValueSource::None => None,
            ValueSource::Upvalue(idx) => Some(("upvalue", upvalue_name(chunk, idx))),
            ValueSource::Stack(slot) => {
                if slot >= ci.base && slot < ci.top {
                    get_obj_name(chunk, ci.current_pc(), (slot - ci.base) as u32)
                } else {
                    None
                }
            }
        };
        match found {
            Some((kind, name)) => format!(" ({kind} '{name}')"),
            None => String::new(),
        }
    }

    /// Name of the local variable stored in `slot` of the running Lua frame
    pub(crate) fn local_name_at(&self, slot: usize) -> Option<String> {
        let ci = self.state.call_infos.last()?;
        let chunk = self.frame_chunk(ci)?;
        let n = slot.checked_sub(ci.base)? + 1;
        chunk.local_name(n, ci.current_pc()).map(|s| s.to_string())
    }

    /// How the caller named the function running at call-info `index`
    fn call_site_name(&self, index: usize) -> Option<(&'static str, String)> {
        let ci = self.state.call_infos.get(index)?;
        if ci.call_status & CIST_TAIL != 0 || index == 0 {
            return None;
        }
        let caller = &self.state.call_infos[index - 1];
        let chunk = self.frame_chunk(caller)?;
        func_name_from_code(chunk, caller.current_pc())
    }

    /// `name` or `lib.name` of a function reachable from the globals
    pub(crate) fn global_function_name(&self, f: &LuaValue) -> Option<String> {
        if !f.is_function() {
            return None;
        }
        let globals = &self.pool.tables[self.globals];
        let mut libraries = Vec::new();
        let mut key = LuaValue::Nil;
        while let Ok(Some((k, v))) = globals.next(&key) {
            if let LuaValue::String(name) = k {
                if v.raw_equal(f) {
                    return Some(self.pool.strings[name].to_string_lossy());
                }
                if let LuaValue::Table(lib) = v {
                    if lib != self.globals {
                        libraries.push((name, lib));
                    }
                }
            }
            key = k;
        }
        for (lib_name, lib) in libraries {
            let table = &self.pool.tables[lib];
            let mut key = LuaValue::Nil;
            while let Ok(Some((k, v))) = table.next(&key) {
                if let (LuaValue::String(name), true) = (k, v.raw_equal(f)) {
                    return Some(format!(
                        "{}.{}",
                        self.pool.strings[lib_name].to_string_lossy(),
                        self.pool.strings[name].to_string_lossy()
                    ));
                }
                key = k;
            }
        }
        None
    }

    /// Kind and name of the running native, as used by argument errors
    pub(crate) fn running_function_name(&self) -> Option<(&'static str, String)> {
        let len = self.state.call_infos.len();
        if len == 0 {
            return None;
        }
        if let Some(found) = self.call_site_name(len - 1) {
            return Some(found);
        }
        let f = self.state.stack[self.state.call_infos[len - 1].func];
        self.global_function_name(&f).map(|name| ("global", name))
    }

    fn describe_function(&self, index: usize) -> String {
        let ci = &self.state.call_infos[index];
        let f = self.state.stack[ci.func];
        if let Some(name) = self.global_function_name(&f) {
            return format!("function '{name}'");
        }
        if let Some((kind, name)) = self.call_site_name(index) {
            return format!("{kind} '{name}'");
        }
        match self.frame_chunk(ci) {
            Some(chunk) if chunk.linedefined == 0 => "main chunk".to_string(),
            Some(chunk) => format!(
                "function <{}:{}>",
                chunk_id(chunk.source_name.as_deref()),
                chunk.linedefined
            ),
            None => "?".to_string(),
        }
    }

    fn traceback_line(&self, index: usize) -> String {
        let ci = &self.state.call_infos[index];
        let mut line = match self.frame_chunk(ci) {
            Some(chunk) => {
                let src = chunk_id(chunk.source_name.as_deref());
                match chunk.line_at(ci.current_pc()) {
                    Some(l) => format!("\n\t{src}:{l}: in "),
                    None => format!("\n\t{src}: in "),
                }
            }
            None => "\n\t[C]: in ".to_string(),
        };
        line.push_str(&self.describe_function(index));
        if ci.call_status & CIST_TAIL != 0 {
            line.push_str("\n\t(...tail calls...)");
        }
        line
    }

    /// Stack traceback starting at `level` (0 = running function), optionally
    /// preceded by a message line
    pub fn traceback(&self, msg: Option<&str>, level: usize) -> String {
        let mut out = String::new();
        if let Some(msg) = msg {
            out.push_str(msg);
            out.push('\n');
        }
        out.push_str("stack traceback:");
        let len = self.state.call_infos.len();
        let levels: Vec<usize> = (level..len).map(|l| len - 1 - l).collect();
        if levels.len() > LEVELS1 + LEVELS2 {
            for &index in &levels[..LEVELS1] {
                out.push_str(&self.traceback_line(index));
            }
            let skipped = levels.len() - LEVELS1 - LEVELS2;
            out.push_str(&format!("\n\t...\t(skipping {skipped} levels)"));
            for &index in &levels[levels.len() - LEVELS2..] {
                out.push_str(&self.traceback_line(index));
            }
        } else {
            for &index in &levels {
                out.push_str(&self.traceback_line(index));
            }
        }
        out
    }

    /// Record the traceback of the frames that are still on the stack
    pub(crate) fn attach_traceback(&self, e: LuaError) -> LuaError {
        match e {
            LuaError::Runtime(mut rt) if rt.traceback.is_none() => {
                rt.traceback = Some(self.traceback(None, 0));
                LuaError::Runtime(rt)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_forms() {
        assert_eq!(chunk_id(Some("=stdin")), "stdin");
        assert_eq!(chunk_id(Some("@script.lua")), "script.lua");
        assert_eq!(chunk_id(Some("x = 1")), "[string \"x = 1\"]");
        assert_eq!(chunk_id(Some("x = 1\ny = 2")), "[string \"x = 1...\"]");
        assert_eq!(chunk_id(None), "?");
        let long = "a".repeat(100);
        let id = chunk_id(Some(&long));
        assert!(id.starts_with("[string \"aaa"));
        assert!(id.ends_with("...\"]"));
        assert!(id.len() < MAX_SRC_LEN);
    }
}
