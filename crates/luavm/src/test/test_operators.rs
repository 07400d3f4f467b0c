// Arithmetic, bitwise, comparison and concatenation semantics
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, SafeOption};
use crate::stdlib::Stdlib;

fn new_vm() -> LuaVM {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    vm
}

fn eval(vm: &mut LuaVM, expr: &str) -> LuaValue {
    let results = vm.execute(&format!("return {expr}")).unwrap();
    results.into_iter().next().unwrap_or_default()
}

#[test]
fn test_integer_and_float_results() {
    let mut vm = new_vm();
    assert!(matches!(eval(&mut vm, "1 + 2"), LuaValue::Integer(3)));
    assert!(matches!(eval(&mut vm, "1 + 2.0"), LuaValue::Float(f) if f == 3.0));
    assert!(matches!(eval(&mut vm, "7 / 2"), LuaValue::Float(f) if f == 3.5));
    assert!(matches!(eval(&mut vm, "4 / 2"), LuaValue::Float(f) if f == 2.0));
    assert!(matches!(eval(&mut vm, "2 ^ 2"), LuaValue::Float(f) if f == 4.0));
    assert!(matches!(eval(&mut vm, "-(-3)"), LuaValue::Integer(3)));
    assert!(matches!(eval(&mut vm, "3 * 1.5"), LuaValue::Float(f) if f == 4.5));
    assert!(matches!(eval(&mut vm, "0x10"), LuaValue::Integer(16)));
    assert!(matches!(eval(&mut vm, "1e2"), LuaValue::Float(f) if f == 100.0));
    assert!(matches!(eval(&mut vm, "0x1p4"), LuaValue::Float(f) if f == 16.0));
}

#[test]
fn test_floor_division_and_modulo() {
    let mut vm = new_vm();
    assert!(matches!(eval(&mut vm, "7 // 2"), LuaValue::Integer(3)));
    assert!(matches!(eval(&mut vm, "-7 // 2"), LuaValue::Integer(-4)));
    assert!(matches!(eval(&mut vm, "7 // -2"), LuaValue::Integer(-4)));
    assert!(matches!(eval(&mut vm, "-7.5 // 2"), LuaValue::Float(f) if f == -4.0));
    assert!(matches!(eval(&mut vm, "7 % 3"), LuaValue::Integer(1)));
    assert!(matches!(eval(&mut vm, "-7 % 3"), LuaValue::Integer(2)));
    assert!(matches!(eval(&mut vm, "7 % -3"), LuaValue::Integer(-2)));
    assert!(matches!(eval(&mut vm, "5.5 % 2"), LuaValue::Float(f) if f == 1.5));
    assert!(matches!(eval(&mut vm, "-5.5 % 2"), LuaValue::Float(f) if f == 0.5));
    assert!(matches!(eval(&mut vm, "1 // 0.0"), LuaValue::Float(f) if f == f64::INFINITY));
    assert!(matches!(eval(&mut vm, "1 % 0.0"), LuaValue::Float(f) if f.is_nan()));

    let err = vm.execute_named("return 1 % 0", "=m").unwrap_err();
    assert_eq!(err.to_string(), "m:1: attempt to perform 'n%0'");
}

#[test]
fn test_integer_overflow_wraps() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local max = 9223372036854775807
            local min = -9223372036854775807 - 1
            return max + 1 == min, min - 1 == max, min // -1, min % -1, max * 2
            "#,
        )
        .unwrap();
    assert_eq!(results[0], LuaValue::Boolean(true));
    assert_eq!(results[1], LuaValue::Boolean(true));
    assert!(matches!(results[2], LuaValue::Integer(i64::MIN)));
    assert!(matches!(results[3], LuaValue::Integer(0)));
    assert!(matches!(results[4], LuaValue::Integer(-2)));
    // Out-of-range integer literals become floats
    assert!(matches!(eval(&mut vm, "9223372036854775808"), LuaValue::Float(_)));
}

#[test]
fn test_bitwise_operators() {
    let mut vm = new_vm();
    assert!(matches!(eval(&mut vm, "0xF0 & 0x3C"), LuaValue::Integer(0x30)));
    assert!(matches!(eval(&mut vm, "0xF0 | 0x0F"), LuaValue::Integer(0xFF)));
    assert!(matches!(eval(&mut vm, "0xFF ~ 0x0F"), LuaValue::Integer(0xF0)));
    assert!(matches!(eval(&mut vm, "~0"), LuaValue::Integer(-1)));
    assert!(matches!(eval(&mut vm, "1 << 62"), LuaValue::Integer(0x4000_0000_0000_0000)));
    assert!(matches!(eval(&mut vm, "1 << 64"), LuaValue::Integer(0)));
    assert!(matches!(eval(&mut vm, "-1 >> 63"), LuaValue::Integer(1)));
    assert!(matches!(eval(&mut vm, "2 >> -1"), LuaValue::Integer(4)));
    assert!(matches!(eval(&mut vm, "3.0 | 0"), LuaValue::Integer(3)));
    assert!(matches!(eval(&mut vm, "'3' & 1"), LuaValue::Integer(1)));

    let err = vm.execute_named("return 1.5 | 0", "=b").unwrap_err();
    assert_eq!(
        err.to_string(),
        "b:1: number has no integer representation"
    );
    let err = vm.execute_named("local t = {} return t & 1", "=b").unwrap_err();
    assert_eq!(
        err.to_string(),
        "b:1: attempt to perform bitwise operation on a table value (local 't')"
    );
}

#[test]
fn test_comparisons() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        assert(1 == 1.0 and not (1 ~= 1.0))
        assert(1 < 1.5 and 2 > 1.5 and 1 <= 1.0)
        assert("a" < "b" and "abc" < "abd" and "" < "a" and "Z" < "a")
        assert(not ("10" == 10))
        assert(0/0 ~= 0/0)
        local t = {}
        assert(t == t and t ~= {})
        assert(9007199254740993 > 9007199254740992.0)
        assert(-0.0 == 0)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");

    let err = vm.execute_named("return 1 < 'x'", "=c").unwrap_err();
    assert_eq!(err.to_string(), "c:1: attempt to compare number with string");
}

#[test]
fn test_string_coercions_and_concat() {
    let mut vm = new_vm();
    assert!(matches!(eval(&mut vm, "'10' + 1"), LuaValue::Integer(11)));
    assert!(matches!(eval(&mut vm, "'0x10' * 1"), LuaValue::Integer(16)));
    assert!(matches!(eval(&mut vm, "'1.5' * 2"), LuaValue::Float(f) if f == 3.0));
    assert!(matches!(eval(&mut vm, "' 7 ' - 0"), LuaValue::Integer(7)));

    let v = eval(&mut vm, "1 .. 2");
    assert_eq!(vm.value_str(&v), Some("12"));
    let v = eval(&mut vm, "'x' .. 1.0 .. 'y' .. -2");
    assert_eq!(vm.value_str(&v), Some("x1.0y-2"));

    let err = vm.execute_named("return 'abc' + 1", "=s").unwrap_err();
    assert_eq!(
        err.to_string(),
        "s:1: attempt to perform arithmetic on a string value (constant 'abc')"
    );
    let err = vm.execute_named("local b = true return 'x' .. b", "=s").unwrap_err();
    assert_eq!(
        err.to_string(),
        "s:1: attempt to concatenate a boolean value (local 'b')"
    );
}

#[test]
fn test_length_operator() {
    let mut vm = new_vm();
    assert!(matches!(eval(&mut vm, "#'hello'"), LuaValue::Integer(5)));
    assert!(matches!(eval(&mut vm, "#{1, 2, 3}"), LuaValue::Integer(3)));
    assert!(matches!(eval(&mut vm, "#{}"), LuaValue::Integer(0)));
    let results = vm
        .execute("local t = {} for i = 1, 100 do t[i] = i end return #t")
        .unwrap();
    assert_eq!(results, vec![LuaValue::Integer(100)]);
}

#[test]
fn test_arithmetic_metamethods() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local V = {}
        V.__index = V
        local function vec(x, y) return setmetatable({x = x, y = y}, V) end
        V.__add = function(a, b) return vec(a.x + b.x, a.y + b.y) end
        V.__sub = function(a, b) return vec(a.x - b.x, a.y - b.y) end
        V.__mul = function(a, b)
            if type(a) == "number" then return vec(a * b.x, a * b.y) end
            return vec(a.x * b, a.y * b)
        end
        V.__unm = function(a) return vec(-a.x, -a.y) end
        V.__eq = function(a, b) return a.x == b.x and a.y == b.y end
        V.__lt = function(a, b) return a.x < b.x end
        V.__le = function(a, b) return a.x <= b.x end
        V.__len = function(a) return 2 end
        V.__concat = function(a, b)
            local function s(v) return type(v) == "table" and ("(" .. v.x .. "," .. v.y .. ")") or v end
            return s(a) .. s(b)
        end
        V.__call = function(self, k) return self[k] end
        V.__idiv = function() return "idiv" end
        V.__band = function() return "band" end
        V.__shl = function() return "shl" end
        V.__bnot = function() return "bnot" end

        local a, b = vec(1, 2), vec(3, 4)
        local c = a + b
        assert(c.x == 4 and c.y == 6)
        assert((b - a).x == 2)
        assert((2 * a).y == 4 and (a * 3).x == 3)
        assert((-a).x == -1)
        assert(a + b == vec(4, 6))
        assert(a ~= b)
        assert(a < b and a <= b and not (b < a) and b > a and b >= a)
        assert(#a == 2)
        assert(a .. "!" == "(1,2)!")
        assert("v=" .. a == "v=(1,2)")
        assert(a("x") == 1)
        assert(a // 1 == "idiv" and a & 1 == "band" and 1 << a == "shl" and ~a == "bnot")
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_eq_metamethod_only_for_same_types() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local calls = 0
        local mt = {__eq = function() calls = calls + 1 return true end}
        local a, b = setmetatable({}, mt), setmetatable({}, mt)
        assert(a == b)
        assert(a ~= 1)
        assert(rawequal(a, a) and not rawequal(a, b))
        assert(calls == 1)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_index_and_newindex_chains() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local base = {greet = "hello"}
        local mid = setmetatable({}, {__index = base})
        local top = setmetatable({}, {__index = mid})
        assert(top.greet == "hello")

        local log = {}
        local proxy = setmetatable({}, {__newindex = function(t, k, v) rawset(log, k, v) end})
        proxy.a = 1
        assert(rawget(proxy, "a") == nil and log.a == 1)

        local store = {}
        local redirect = setmetatable({}, {__newindex = store})
        redirect.b = 2
        assert(store.b == 2 and rawget(redirect, "b") == nil)

        local existing = setmetatable({c = 0}, {__newindex = function() error("not called") end})
        existing.c = 3
        assert(existing.c == 3)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_logical_operators_short_circuit() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local hits = 0
        local function hit(v) hits = hits + 1 return v end
        assert((nil and hit(1)) == nil)
        assert((false or hit(2)) == 2)
        assert((1 or hit(3)) == 1)
        assert(hits == 1)
        assert(not nil == true and not 0 == false)
        local x = nil
        local y = x and x.field or "default"
        assert(y == "default")
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}
