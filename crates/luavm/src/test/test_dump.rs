// Bytecode persistence through the host API and `dump`/`load`
use crate::lua_value::{Chunk, LuaValue};
use crate::lua_vm::{Instruction, LuaError, LuaVM, OpCode, SafeOption};
use crate::stdlib::Stdlib;

const PROGRAM: &str = r#"
local function fact(n)
    if n <= 1 then return 1 end
    return n * fact(n - 1)
end
local t = {}
for i = 1, 5 do t[i] = fact(i) end
return t[5], 2^10, "s" .. 1, 7 // 2, 7.0 // 2
"#;

#[test]
fn test_undump_dump_equivalence() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let chunk = vm.compile(PROGRAM, "=prog").unwrap();
    let expected = {
        let f = vm.load(chunk.clone());
        vm.call(f, &[]).unwrap()
    };

    for strip in [false, true] {
        let bytes = vm.dump(&chunk, strip);
        let restored = vm.undump(&bytes).unwrap();
        assert_eq!(restored.code, chunk.code);
        let f = vm.load(restored);
        let results = vm.call(f, &[]).unwrap();
        assert_eq!(results.len(), expected.len());
        assert!(matches!(results[0], LuaValue::Integer(120)));
        assert!(matches!(results[1], LuaValue::Float(f) if f == 1024.0));
        assert_eq!(vm.value_str(&results[2]), Some("s1"));
        assert!(matches!(results[3], LuaValue::Integer(3)));
        assert!(matches!(results[4], LuaValue::Float(f) if f == 3.0));
    }
}

#[test]
fn test_stripped_chunk_loses_line_info() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let chunk = vm.compile("local x = nil\nreturn x.y", "=prog").unwrap();

    let bytes = vm.dump(&chunk, false);
    let full = vm.load_binary(&bytes).unwrap();
    let err = vm.call(full, &[]).unwrap_err();
    assert_eq!(err.to_string(), "prog:2: attempt to index a nil value (local 'x')");

    let bytes = vm.dump(&chunk, true);
    let stripped = vm.load_binary(&bytes).unwrap();
    let err = vm.call(stripped, &[]).unwrap_err();
    let msg = err.to_string();
    assert!(msg.ends_with("attempt to index a nil value"), "{msg}");
    assert!(!msg.contains("prog:2:"));
}

#[test]
fn test_dump_and_load_from_scripts() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let result = vm.execute(
        r#"
        local function add(a, b) return a + b end
        local bin = dump(add)
        local again = load(bin, "add", "b")
        assert(again(2, 3) == 5)

        local f, msg = load(bin, "add", "t")
        assert(f == nil and msg == "attempt to load a binary chunk (mode is 't')")
        f, msg = load("return 1", "src", "b")
        assert(f == nil and msg == "attempt to load a text chunk (mode is 'b')")

        local ok, err = pcall(dump, print)
        assert(not ok)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_load_binary_rejects_garbage() {
    let mut vm = LuaVM::new(SafeOption::default());
    let err = vm.load_binary(b"\x1bLua\x54\x00garbage").unwrap_err();
    assert!(matches!(err, LuaError::BadBytecode(_)));
}

#[test]
fn test_load_binary_rejects_out_of_range_operands() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut chunk = vm.compile("local a, b = 1, 2\nreturn a + b", "=prog").unwrap();
    let last = chunk.code.len() - 1;
    chunk.code[last] = Instruction::create_abc(OpCode::Return, 250, 2, 0);
    let bytes = vm.dump(&chunk, true);
    let err = vm.load_binary(&bytes).unwrap_err();
    assert_eq!(err.to_string(), "bad binary chunk: register out of range");
}

#[test]
fn test_missing_upvalue_is_an_error() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut chunk = Chunk::new();
    chunk.code = vec![
        Instruction::create_abc(OpCode::GetUpval, 0, 2, 0),
        Instruction::create_abc(OpCode::Return, 0, 2, 0),
    ];
    chunk.max_stack_size = 2;
    let f = vm.load(chunk);
    let depth = vm.state.call_infos.len();
    let err = vm.call(f, &[]).unwrap_err();
    assert!(matches!(err, LuaError::BadBytecode(_)), "{err:?}");
    // The failed frame is gone and the VM keeps working
    assert_eq!(vm.state.call_infos.len(), depth);
    assert_eq!(vm.execute("return 1 + 1").unwrap().len(), 1);
}
