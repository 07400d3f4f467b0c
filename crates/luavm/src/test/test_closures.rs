// Closures and upvalues
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, SafeOption};
use crate::stdlib::Stdlib;

#[test]
fn test_counter_closure() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let results = vm
        .execute(
            r#"
            local function counter()
                local n = 0
                return function() n = n + 1; return n end
            end
            local c1, c2 = counter(), counter()
            c1(); c1()
            return c1(), c2()
            "#,
        )
        .unwrap();
    assert_eq!(results, vec![LuaValue::Integer(3), LuaValue::Integer(1)]);
}

#[test]
fn test_per_iteration_loop_variables() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let result = vm.execute(
        r#"
        local fs = {}
        for i = 1, 3 do
            fs[i] = function() return i end
        end
        assert(fs[1]() == 1 and fs[2]() == 2 and fs[3]() == 3)

        local gs = {}
        for _, v in ipairs({"a", "b"}) do
            gs[#gs + 1] = function() return v end
        end
        assert(gs[1]() == "a" and gs[2]() == "b")

        local hs = {}
        local j = 0
        while j < 3 do
            j = j + 1
            local k = j * 10
            hs[j] = function() return k end
        end
        assert(hs[1]() == 10 and hs[3]() == 30)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_shared_upvalue_between_closures() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let result = vm.execute(
        r#"
        local function pair()
            local value = 0
            local function get() return value end
            local function set(v) value = v end
            return get, set
        end
        local get, set = pair()
        set(99)
        assert(get() == 99)

        -- still open while the declaring frame runs
        local x = 1
        local function bump() x = x + 1 end
        bump(); bump()
        assert(x == 3)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_nested_upvalue_chain() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let results = vm
        .execute(
            r#"
            local a = 1
            local function outer()
                local b = 2
                return function()
                    return function() a = a + 1; return a + b end
                end
            end
            local inner = outer()()
            inner()
            return inner(), a
            "#,
        )
        .unwrap();
    assert_eq!(results, vec![LuaValue::Integer(5), LuaValue::Integer(3)]);
}

#[test]
fn test_recursive_local_function() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let results = vm
        .execute(
            r#"
            local function fib(n)
                if n < 2 then return n end
                return fib(n - 1) + fib(n - 2)
            end
            return fib(20)
            "#,
        )
        .unwrap();
    assert_eq!(results, vec![LuaValue::Integer(6765)]);
}

#[test]
fn test_varargs_and_multiple_results() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let result = vm.execute(
        r#"
        local function pack(...) return {n = select('#', ...), ...} end
        local t = pack(1, nil, 3)
        assert(t.n == 3 and t[1] == 1 and t[3] == 3)

        local function three() return 1, 2, 3 end
        local a, b, c, d = three()
        assert(a == 1 and c == 3 and d == nil)
        local u = {three(), three()}
        assert(#u == 4)
        local v = {(three())}
        assert(#v == 1)

        local function count(...) return select('#', ...) end
        assert(count(three()) == 3 and count(three(), 10) == 2)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_deep_tail_calls_do_not_overflow() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let results = vm
        .execute(
            r#"
            local function loop(n, acc)
                if n == 0 then return acc end
                return loop(n - 1, acc + 1)
            end
            return loop(1000000, 0)
            "#,
        )
        .unwrap();
    assert_eq!(results, vec![LuaValue::Integer(1000000)]);
}
