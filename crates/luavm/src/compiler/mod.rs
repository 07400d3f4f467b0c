// Lua compiler: source text to a `Chunk` in a single pass.
// The parser drives code generation directly. Pending expressions live in
// `ExpDesc`s until their destination register is known.
mod code;
mod expdesc;
mod expr;
mod func_state;
mod lexer;
mod parse_lua_number;
mod stmt;

use smol_str::SmolStr;

use crate::lua_value::{Chunk, UpvalueDesc};
use crate::lua_vm::{LuaResult, chunk_id};
use func_state::{FuncState, LabelDesc, VarDesc, VarKind};
use lexer::Lexer;

pub use lexer::Token;
pub use parse_lua_number::parse_number;

/// Compile `source`. `chunk_name` follows the usual convention: `@file`,
/// `=name`, or the source text itself.
pub fn compile(source: &[u8], chunk_name: &str) -> LuaResult<Chunk> {
    let source = skip_prelude(source, chunk_name);
    Parser::new(source, chunk_name).main_function()
}

/// Files may start with a UTF-8 byte order mark and a `#` line. The `#`
/// line is skipped up to its newline so line numbers stay right.
fn skip_prelude<'a>(source: &'a [u8], chunk_name: &str) -> &'a [u8] {
    if !chunk_name.starts_with('@') {
        return source;
    }
    let source = source.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(source);
    if source.first() == Some(&b'#') {
        let end = source
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')
            .unwrap_or(source.len());
        return &source[end..];
    }
    source
}

pub(crate) struct Parser<'s> {
    lex: Lexer<'s>,
    /// Function being compiled
    fs: FuncState,
    /// Enclosing functions, innermost last
    enclosing: Vec<FuncState>,
    /// Declared variables of all open functions
    actvar: Vec<VarDesc>,
    /// Pending gotos of all open functions
    gotos: Vec<LabelDesc>,
    /// Visible labels of all open functions
    labels: Vec<LabelDesc>,
    /// Nesting of recursive productions
    depth: usize,
    source: SmolStr,
}

impl<'s> Parser<'s> {
    fn new(src: &'s [u8], chunk_name: &str) -> Self {
        let source = SmolStr::new(chunk_name);
        Parser {
            lex: Lexer::new(src, SmolStr::new(chunk_id(Some(chunk_name)))),
            fs: FuncState::new(Some(source.clone()), 0, 0, 0),
            enclosing: Vec::new(),
            actvar: Vec::new(),
            gotos: Vec::new(),
            labels: Vec::new(),
            depth: 0,
            source,
        }
    }

    /// The main function is vararg and has `_ENV` as its only upvalue
    fn main_function(mut self) -> LuaResult<Chunk> {
        self.enter_block(false);
        self.set_vararg(0);
        self.fs.chunk.upvalue_descs.push(UpvalueDesc {
            in_stack: true,
            index: 0,
            name: SmolStr::new_static("_ENV"),
        });
        self.fs.upvalue_kinds.push(VarKind::Regular);
        self.lex.next()?;
        self.statlist()?;
        self.check(&Token::Eos)?;
        self.finish_func()?;
        Ok(self.fs.chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_value::Constant;
    use crate::lua_vm::{LuaError, OpCode};

    fn ops(chunk: &Chunk) -> Vec<OpCode> {
        chunk.code.iter().map(|i| i.get_opcode()).collect()
    }

    fn syntax_error(src: &str) -> String {
        match compile(src.as_bytes(), "=test") {
            Err(e @ LuaError::Syntax { .. }) => e.to_string(),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("compiled: {src}"),
        }
    }

    #[test]
    fn test_main_function_shape() {
        let chunk = compile(b"return 1", "=test").unwrap();
        assert!(chunk.is_vararg);
        assert_eq!(chunk.upvalue_descs[0].name, "_ENV");
        assert_eq!(
            ops(&chunk),
            vec![OpCode::VarargPrep, OpCode::LoadI, OpCode::Return, OpCode::Return]
        );
        assert_eq!(chunk.line_info.len(), chunk.code.len());
    }

    #[test]
    fn test_constant_folding() {
        let chunk = compile(b"return 2^53, 7 // 2, 1 / 0, -(3), 0x7fffffffffffffff + 1", "=test").unwrap();
        assert!(chunk.constants.contains(&Constant::Float(9007199254740992.0)));
        assert!(chunk.constants.contains(&Constant::Integer(i64::MIN)));
        // Division by zero is left to run time
        assert!(ops(&chunk).contains(&OpCode::Div));
        assert!(!ops(&chunk).contains(&OpCode::Unm));
        assert!(!ops(&chunk).contains(&OpCode::IDiv));
    }

    #[test]
    fn test_globals_go_through_env() {
        let chunk = compile(b"x = y", "=test").unwrap();
        assert_eq!(
            ops(&chunk),
            vec![OpCode::VarargPrep, OpCode::GetTabUp, OpCode::SetTabUp, OpCode::Return]
        );
    }

    #[test]
    fn test_closure_upvalues() {
        let chunk = compile(b"local a; local function f() return a end", "=test").unwrap();
        let child = &chunk.child_protos[0];
        assert_eq!(child.upvalue_descs.len(), 1);
        assert!(child.upvalue_descs[0].in_stack);
        assert_eq!(child.upvalue_descs[0].index, 0);
        assert_eq!(child.upvalue_descs[0].name, "a");
        assert_eq!(child.linedefined, 1);
        assert_eq!(chunk.locals.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(), vec!["a", "f"]);
    }

    #[test]
    fn test_table_constructor_has_extra_arg() {
        let chunk = compile(b"local t = {1, 2, x = 3}", "=test").unwrap();
        let code = ops(&chunk);
        let at = code.iter().position(|op| *op == OpCode::NewTable).unwrap();
        assert_eq!(code[at + 1], OpCode::ExtraArg);
        assert!(code.contains(&OpCode::SetList));
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(syntax_error("x = = 1"), "test:1: unexpected symbol near '='");
        assert_eq!(syntax_error("local x <const> = 1; x = 2"), "test:1: attempt to assign to const variable 'x'");
        assert_eq!(syntax_error("goto nowhere"), "test:1: no visible label 'nowhere' for <goto> at line 1");
        assert_eq!(syntax_error("break"), "test:1: break outside a loop at line 1");
        assert_eq!(
            syntax_error("if x then\n\nx = 1"),
            "test:3: 'end' expected (to close 'if' at line 1) near <eof>"
        );
        assert_eq!(syntax_error("local x <foo> = 1"), "test:1: unknown attribute 'foo'");
        assert_eq!(
            syntax_error("function g() return ... end"),
            "test:1: cannot use '...' outside a vararg function near '...'"
        );
    }

    #[test]
    fn test_goto_into_local_scope_rejected() {
        let msg = syntax_error("do goto l; local a; ::l:: print(a) end");
        assert_eq!(msg, "test:1: <goto l> at line 1 jumps into the scope of local 'a'");
    }

    #[test]
    fn test_shebang_and_bom_skipped_for_files() {
        let chunk = compile(b"\xEF\xBB\xBF#!/usr/bin/lua\nreturn 1", "@script.lua").unwrap();
        assert_eq!(chunk.line_info[1], 2);
        assert!(compile(b"#!/usr/bin/lua\nreturn 1", "=inline").is_err());
    }
}
