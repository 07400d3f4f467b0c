// Error raising, protected calls and message handlers
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaVM, RuntimeErrorKind, SafeOption};
use crate::stdlib::Stdlib;

fn new_vm() -> LuaVM {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    vm
}

fn run_err(vm: &mut LuaVM, src: &str) -> LuaError {
    match vm.execute_named(src, "=test") {
        Err(e) => e,
        Ok(v) => panic!("expected an error, got {v:?}"),
    }
}

#[test]
fn test_error_levels() {
    let mut vm = new_vm();
    let src = r#"
local function fail(level) error("msg", level) end
local function caller(level) fail(level) end
local ok1, e1 = pcall(caller, 1)
local ok2, e2 = pcall(caller, 2)
local ok0, e0 = pcall(caller, 0)
return e1, e2, e0
"#;
    let results = vm.execute_named(src, "=test").unwrap();
    assert_eq!(vm.value_str(&results[0]), Some("test:2: msg"));
    assert_eq!(vm.value_str(&results[1]), Some("test:3: msg"));
    assert_eq!(vm.value_str(&results[2]), Some("msg"));
}

#[test]
fn test_error_with_table_value() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local ok, e = pcall(error, {code = 42})
        assert(not ok and e.code == 42)
        local ok2, e2 = pcall(error)
        assert(not ok2 and e2 == nil)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_runtime_error_messages_name_variables() {
    let mut vm = new_vm();
    assert_eq!(
        run_err(&mut vm, "local t = nil; return t.x").to_string(),
        "test:1: attempt to index a nil value (local 't')"
    );
    assert_eq!(
        run_err(&mut vm, "return undefined_global.x").to_string(),
        "test:1: attempt to index a nil value (global 'undefined_global')"
    );
    assert_eq!(
        run_err(&mut vm, "local t = {}; t.a.b = 1").to_string(),
        "test:1: attempt to index a nil value (field 'a')"
    );
    assert_eq!(
        run_err(&mut vm, "missing()").to_string(),
        "test:1: attempt to call a nil value (global 'missing')"
    );
    assert_eq!(
        run_err(&mut vm, "local t = {}; t:nomethod()").to_string(),
        "test:1: attempt to call a nil value (method 'nomethod')"
    );
    assert_eq!(
        run_err(&mut vm, "local x; return x + 1").to_string(),
        "test:1: attempt to perform arithmetic on a nil value (local 'x')"
    );
    assert_eq!(
        run_err(&mut vm, "return {} < 1").to_string(),
        "test:1: attempt to compare table with number"
    );
    assert_eq!(
        run_err(&mut vm, "return 1 // 0").to_string(),
        "test:1: attempt to perform 'n//0'"
    );
    assert_eq!(
        run_err(&mut vm, "local up = nil\nlocal function f() return up.x end\nf()").to_string(),
        "test:2: attempt to index a nil value (upvalue 'up')"
    );
}

#[test]
fn test_error_kinds() {
    let mut vm = new_vm();
    assert_eq!(run_err(&mut vm, "missing()").kind(), Some(RuntimeErrorKind::Name));
    assert_eq!(run_err(&mut vm, "return 1 + {}").kind(), Some(RuntimeErrorKind::Type));
    assert_eq!(run_err(&mut vm, "error('x')").kind(), Some(RuntimeErrorKind::User));
    assert_eq!(
        run_err(&mut vm, "local function f() return f() + 1 end f()").kind(),
        Some(RuntimeErrorKind::StackOverflow)
    );
    assert!(matches!(run_err(&mut vm, "x ="), LuaError::Syntax { .. }));
}

#[test]
fn test_pcall_restores_stack() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local function deep(n)
            if n == 0 then error("bottom") end
            local a, b, c = n, n, n
            return deep(n - 1) + a
        end
        for i = 1, 100 do
            local ok, e = pcall(deep, 50)
            assert(not ok)
        end
        local ok, v = pcall(function(...) return ... end, 1, 2, 3)
        assert(ok and v == 1)
        assert(select('#', pcall(function() end)) == 1)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
    // Nothing is left on the main thread after the host call returns
    assert!(vm.state.call_infos.is_empty());
    assert_eq!(vm.state.top, 0);
}

#[test]
fn test_host_pcall_unwinds_and_keeps_traceback() {
    let mut vm = new_vm();
    let f = vm
        .load_source(
            "local function inner() error('deep failure') end\nlocal function outer() inner() end\nouter()",
            "=tb",
        )
        .unwrap();
    let err = vm.pcall(f, &[]).unwrap_err();
    assert_eq!(err.to_string(), "tb:1: deep failure");
    let traceback = err.traceback().unwrap();
    assert!(traceback.starts_with("stack traceback:"));
    assert!(traceback.contains("tb:1: in"));
    assert!(traceback.contains("tb:2: in"));
    assert!(vm.state.call_infos.is_empty());

    // The VM stays usable
    let results = vm.execute("return 1 + 1").unwrap();
    assert_eq!(results, vec![LuaValue::Integer(2)]);
}

#[test]
fn test_xpcall_handler_sees_failing_frames() {
    let mut vm = new_vm();
    let results = vm
        .execute_named(
            r#"
local function handler(e) return traceback(e, 1) end
function boom() error("bad") end
return xpcall(boom, handler)
"#,
            "=test",
        )
        .unwrap();
    assert_eq!(results[0], LuaValue::Boolean(false));
    let msg = vm.value_str(&results[1]).unwrap().to_string();
    assert!(msg.starts_with("test:3: bad\nstack traceback:"), "{msg}");
    assert!(msg.contains("boom"), "{msg}");
}

#[test]
fn test_xpcall_success_and_arguments() {
    let mut vm = new_vm();
    let results = vm
        .execute("return xpcall(function(a, b) return a * b end, print, 6, 7)")
        .unwrap();
    assert_eq!(results, vec![LuaValue::Boolean(true), LuaValue::Integer(42)]);
}

#[test]
fn test_error_in_message_handler() {
    let mut vm = new_vm();
    let results = vm
        .execute("return xpcall(error, function() error('again') end, 'first')")
        .unwrap();
    assert_eq!(results[0], LuaValue::Boolean(false));
    assert_eq!(vm.value_str(&results[1]), Some("error in error handling"));

    let f = vm.load_source("error('host')", "=h").unwrap();
    let handler = vm.load_source("error('handler fails')", "=h2").unwrap();
    let err = vm.pcall_with_handler(f, &[], handler).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::ErrorHandler));
}

#[test]
fn test_to_be_closed_on_error() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local log = {}
        local function closer(name)
            return setmetatable({}, {__close = function(_, e) log[#log + 1] = name .. ":" .. tostring(e) end})
        end
        local ok, err = pcall(function()
            local a <close> = closer("a")
            local b <close> = closer("b")
            error("oops", 0)
        end)
        assert(not ok and err == "oops")
        assert(log[1] == "b:oops" and log[2] == "a:oops")

        do
            local c <close> = closer("c")
        end
        assert(log[3] == "c:nil")

        local ok2, err2 = pcall(function()
            local d <close> = 42
        end)
        assert(not ok2)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_close_error_replaces_error() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            return pcall(function()
                local x <close> = setmetatable({}, {__close = function() error("in close", 0) end})
                error("original", 0)
            end)
            "#,
        )
        .unwrap();
    assert_eq!(results[0], LuaValue::Boolean(false));
    assert_eq!(vm.value_str(&results[1]), Some("in close"));
}

#[test]
fn test_stack_overflow_is_catchable() {
    let mut vm = new_vm();
    let results = vm
        .execute("local function r() return 1 + r() end return pcall(r)")
        .unwrap();
    assert_eq!(results[0], LuaValue::Boolean(false));
    let msg = vm.value_str(&results[1]).unwrap();
    assert!(msg.contains("stack overflow"), "{msg}");
}
