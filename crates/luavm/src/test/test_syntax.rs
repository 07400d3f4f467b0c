// Statements, scoping and lexical forms
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaVM, SafeOption};
use crate::stdlib::Stdlib;

fn new_vm() -> LuaVM {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    vm
}

fn syntax_error(vm: &LuaVM, src: &str) -> String {
    match vm.compile(src, "=s") {
        Err(e @ LuaError::Syntax { .. }) => e.to_string(),
        Err(other) => panic!("expected a syntax error, got {other:?}"),
        Ok(_) => panic!("expected a syntax error"),
    }
}

#[test]
fn test_numeric_for_loops() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local s = 0
        for i = 1, 10 do s = s + i end
        assert(s == 55)
        s = 0
        for i = 10, 1, -2 do s = s + i end
        assert(s == 30)
        local n = 0
        for i = 1, 0 do n = n + 1 end
        assert(n == 0)
        local last
        for x = 0, 1, 0.25 do last = x end
        assert(last == 1.0)
        n = 0
        for i = 9223372036854775806, 9223372036854775807 do n = n + 1 end
        assert(n == 2)
        -- The control variable is a fresh local per iteration
        for i = 1, 3 do i = i * 10 end
        local ok = pcall(function() for i = 1, 10, 0 do end end)
        assert(not ok)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");

    let err = vm.execute_named("for i = 'a', 2 do end", "=f").unwrap_err();
    assert_eq!(err.to_string(), "f:1: bad 'for' initial value (number expected, got string)");
}

#[test]
fn test_generic_for_and_closing_value() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local function iter(limit)
            return function(_, i)
                if i < limit then return i + 1, i * i end
            end, nil, 0
        end
        local keys, squares = 0, 0
        for k, sq in iter(4) do keys = keys + k; squares = squares + sq end
        assert(keys == 10 and squares == 0 + 1 + 4 + 9)

        local closed = false
        local closer = setmetatable({}, {__close = function() closed = true end})
        for i in function(_, i) if not i then return 1 end end, nil, nil, closer do
            break
        end
        assert(closed)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_while_repeat_and_break() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local i = 0
        while true do
            i = i + 1
            if i == 5 then break end
        end
        assert(i == 5)

        -- The until condition sees locals declared in the body
        local count = 0
        repeat
            local done = count >= 3
            count = count + 1
        until done
        assert(count == 4)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_goto_and_labels() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local out = {}
        for i = 1, 3 do
            for j = 1, 3 do
                if j == 2 then goto continue end
                out[#out + 1] = i * 10 + j
                ::continue::
            end
        end
        assert(#out == 6 and out[1] == 11 and out[2] == 13)

        local n = 0
        ::top::
        n = n + 1
        if n < 5 then goto top end
        assert(n == 5)

        -- Closures created before a backward goto capture fresh locals
        local fns = {}
        local k = 1
        ::again::
        local captured = k
        fns[k] = function() return captured end
        k = k + 1
        if k <= 3 then goto again end
        assert(fns[1]() == 1 and fns[3]() == 3)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");

    assert_eq!(
        syntax_error(&vm, "goto nowhere"),
        "s:1: no visible label 'nowhere' for <goto> at line 1"
    );
    assert_eq!(
        syntax_error(&vm, "::a:: ::a::"),
        "s:1: label 'a' already defined on line 1"
    );
    assert_eq!(
        syntax_error(&vm, "goto f\nlocal x\n::f:: print(x)"),
        "s:3: <goto f> at line 1 jumps into the scope of local 'x'"
    );
    assert_eq!(syntax_error(&vm, "break"), "s:1: break outside a loop at line 1");
}

#[test]
fn test_strings_and_escapes() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local long = [[
first
second]]
            local nested = [==[a]]b]==]
            return long, nested, "\65\066\x43\u{48}\z
                   I", 'tab\tq\'', "\u{7FF}", #"\0x"
            "#,
        )
        .unwrap();
    assert_eq!(vm.value_str(&results[0]), Some("first\nsecond"));
    assert_eq!(vm.value_str(&results[1]), Some("a]]b"));
    assert_eq!(vm.value_str(&results[2]), Some("ABCHI"));
    assert_eq!(vm.value_str(&results[3]), Some("tab\tq'"));
    assert_eq!(vm.value_bytes(&results[4]), Some("\u{7FF}".as_bytes()));
    assert_eq!(results[5], LuaValue::Integer(2));

    assert_eq!(
        syntax_error(&vm, "x = 'unfinished"),
        "s:1: unfinished string near <eof>"
    );
    assert_eq!(
        syntax_error(&vm, r#"x = "\q""#),
        r#"s:1: invalid escape sequence near '"\q'"#
    );
    assert_eq!(
        syntax_error(&vm, "x = [[never closed"),
        "s:1: unfinished long string near <eof>"
    );
}

#[test]
fn test_comments_and_numerals() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            -- line comment
            --[[ block
            comment ]]
            --[==[ another ]==]
            return 0xff, 1e-2, 3., .5, 0xA.8p0, 100 // 1
            "#,
        )
        .unwrap();
    assert!(matches!(results[0], LuaValue::Integer(255)));
    assert!(matches!(results[1], LuaValue::Float(f) if f == 0.01));
    assert!(matches!(results[2], LuaValue::Float(f) if f == 3.0));
    assert!(matches!(results[3], LuaValue::Float(f) if f == 0.5));
    assert!(matches!(results[4], LuaValue::Float(f) if f == 10.5));
    assert!(matches!(results[5], LuaValue::Integer(100)));

    assert_eq!(syntax_error(&vm, "x = 3x"), "s:1: malformed number near '3x'");
}

#[test]
fn test_attribs_const_and_close() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local limit <const> = 10
            local log = {}
            do
                local a <close> = setmetatable({}, {__close = function() log[#log + 1] = "a" end})
                local b <close> = nil
                local c <close> = setmetatable({}, {__close = function() log[#log + 1] = "c" end})
            end
            local function early()
                local r <close> = setmetatable({}, {__close = function() log[#log + 1] = "r" end})
                return "returned"
            end
            local v = early()
            return limit * 2, log[1], log[2], log[3], v
            "#,
        )
        .unwrap();
    assert_eq!(results[0], LuaValue::Integer(20));
    assert_eq!(vm.value_str(&results[1]), Some("c"));
    assert_eq!(vm.value_str(&results[2]), Some("a"));
    assert_eq!(vm.value_str(&results[3]), Some("r"));
    assert_eq!(vm.value_str(&results[4]), Some("returned"));

    assert_eq!(
        syntax_error(&vm, "local x <const> = 1; x = 2"),
        "s:1: attempt to assign to const variable 'x'"
    );
    assert_eq!(
        syntax_error(&vm, "local x <sticky> = 1"),
        "s:1: unknown attribute 'sticky'"
    );
    assert_eq!(
        syntax_error(&vm, "local a <close>, b <close> = 1, 2"),
        "s:1: multiple to-be-closed variables in local list"
    );
}

#[test]
fn test_multiple_assignment_order() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local a, b, c = 1, 2
            a, b = b, a
            local t = {}
            local i = 1
            i, t[i] = i + 1, "first slot"
            local function three() return 1, 2, 3 end
            local x, y, z, w = three()
            local p, q = three(), 10
            return a, b, c, t[1], x + y + z, w, p, q
            "#,
        )
        .unwrap();
    assert_eq!(results[0], LuaValue::Integer(2));
    assert_eq!(results[1], LuaValue::Integer(1));
    assert_eq!(results[2], LuaValue::Nil);
    assert_eq!(vm.value_str(&results[3]), Some("first slot"));
    assert_eq!(results[4], LuaValue::Integer(6));
    assert_eq!(results[5], LuaValue::Nil);
    assert_eq!(results[6], LuaValue::Integer(1));
    assert_eq!(results[7], LuaValue::Integer(10));
}

#[test]
fn test_table_constructors() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local function many() return 1, 2, 3 end
        local t = {many(), many()}
        assert(#t == 4)
        local u = {many(), (many())}
        assert(#u == 2)
        local mixed = {10, 20, x = "x", ["y z"] = 5, [1 + 2] = 30; 40}
        assert(mixed[1] == 10 and mixed[3] == 40 and mixed.x == "x" and mixed["y z"] == 5)
        local big = {}
        for i = 1, 300 do big[i] = i end
        assert(#big == 300)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_method_definitions_and_calls() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local Account = {}
            Account.__index = Account
            function Account.new(balance)
                return setmetatable({balance = balance}, Account)
            end
            function Account:deposit(v)
                self.balance = self.balance + v
                return self
            end
            local a = Account.new(10)
            a:deposit(5):deposit(7)
            local nested = {inner = {deep = {}}}
            function nested.inner.deep.f(x) return x * 2 end
            local call_string = type"x"
            local call_table = (function(t) return t[1] end){9}
            return a.balance, nested.inner.deep.f(21), call_string, call_table
            "#,
        )
        .unwrap();
    assert_eq!(results[0], LuaValue::Integer(22));
    assert_eq!(results[1], LuaValue::Integer(42));
    assert_eq!(vm.value_str(&results[2]), Some("string"));
    assert_eq!(results[3], LuaValue::Integer(9));
}

#[test]
fn test_varargs_in_main_chunk_and_select() {
    let mut vm = new_vm();
    let f = vm
        .load_source("local a, b = ... return select('#', ...), a, b", "=v")
        .unwrap();
    let results = vm
        .call(f, &[LuaValue::Integer(1), LuaValue::Nil, LuaValue::Nil])
        .unwrap();
    assert_eq!(
        results,
        vec![LuaValue::Integer(3), LuaValue::Integer(1), LuaValue::Nil]
    );

    assert_eq!(
        syntax_error(&vm, "function f() return ... end"),
        "s:1: cannot use '...' outside a vararg function near '...'"
    );
}

#[test]
fn test_syntax_error_messages() {
    let vm = new_vm();
    assert_eq!(syntax_error(&vm, "x ="), "s:1: unexpected symbol near <eof>");
    assert_eq!(syntax_error(&vm, "if x then"), "s:1: 'end' expected near <eof>");
    assert_eq!(
        syntax_error(&vm, "if x then\n\nelse"),
        "s:3: 'end' expected (to close 'if' at line 1) near <eof>"
    );
    assert_eq!(syntax_error(&vm, "local 1 = 2"), "s:1: <name> expected near '1'");
    assert_eq!(syntax_error(&vm, "x = }"), "s:1: unexpected symbol near '}'");
    assert_eq!(syntax_error(&vm, "f() = 1"), "s:1: syntax error near '='");
    assert_eq!(syntax_error(&vm, "x = 1 @"), "s:1: unexpected symbol near '@'");
}

#[test]
fn test_deep_nesting_limits() {
    let vm = new_vm();
    let deep = format!("x = {}1{}", "(".repeat(300), ")".repeat(300));
    let msg = syntax_error(&vm, &deep);
    assert_eq!(msg, "s:1: C stack overflow");
}
