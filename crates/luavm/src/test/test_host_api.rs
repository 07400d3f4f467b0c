// Embedding: natives, userdata, registry and raw access from the host
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVM, SafeOption};
use crate::stdlib::Stdlib;

fn new_vm() -> LuaVM {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    vm
}

fn sum_args(vm: &mut LuaVM) -> LuaResult<usize> {
    let mut total = 0;
    for i in 1..=vm.arg_count() {
        total += vm.check_integer(i)?;
    }
    vm.push_value(LuaValue::Integer(total))?;
    Ok(1)
}

#[test]
fn test_register_function_and_call_from_script() {
    let mut vm = new_vm();
    vm.register_function("sum", sum_args);
    let results = vm.execute("return sum(1, 2, 3), sum()").unwrap();
    assert_eq!(results, vec![LuaValue::Integer(6), LuaValue::Integer(0)]);

    let err = vm.execute_named("return sum(1, {})", "=host").unwrap_err();
    assert_eq!(
        err.to_string(),
        "host:1: bad argument #2 to 'sum' (number expected, got table)"
    );
}

#[test]
fn test_register_closure_captures_rust_state() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let mut vm = new_vm();
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    vm.register_closure("record", move |vm| {
        let s = vm.check_string(1)?;
        let text = String::from_utf8_lossy(vm.string_bytes(s)).into_owned();
        sink.borrow_mut().push(text);
        Ok(0)
    });
    vm.execute("record('a') record(2) for i = 1, 3 do record('loop') end")
        .unwrap();
    assert_eq!(*log.borrow(), vec!["a", "2", "loop", "loop", "loop"]);
}

#[test]
fn test_closure_upvalues() {
    let mut vm = new_vm();
    let step = LuaValue::Integer(10);
    let adder = vm.create_closure(
        |vm| {
            let step = vm.closure_upvalue(0);
            let n = vm.check_integer(1)?;
            let LuaValue::Integer(step) = step else {
                return Err(vm.error("bad upvalue"));
            };
            vm.push_value(LuaValue::Integer(n + step))?;
            Ok(1)
        },
        vec![step],
    );
    vm.set_global("add10", adder);
    let results = vm.execute("return add10(5)").unwrap();
    assert_eq!(results, vec![LuaValue::Integer(15)]);
}

#[derive(Debug, PartialEq)]
struct Point {
    x: i64,
    y: i64,
}

fn point_x(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = vm.check_any(1)?;
    let Some(p) = vm.userdata_ref::<Point>(&v) else {
        return Err(vm.type_error_arg(1, "Point"));
    };
    let x = p.x;
    vm.push_value(LuaValue::Integer(x))?;
    Ok(1)
}

fn point_shift(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = vm.check_any(1)?;
    let dx = vm.check_integer(2)?;
    match vm.userdata_mut::<Point>(&v) {
        Some(p) => p.x += dx,
        None => return Err(vm.type_error_arg(1, "Point")),
    }
    Ok(0)
}

#[test]
fn test_userdata_with_methods() {
    let mut vm = new_vm();
    let methods = vm.create_table(0, 2);
    let key = vm.create_string("x");
    vm.raw_set(&methods, key, LuaValue::CFunction(point_x)).unwrap();
    let key = vm.create_string("shift");
    vm.raw_set(&methods, key, LuaValue::CFunction(point_shift)).unwrap();

    let mt = vm.create_table(0, 2);
    let key = vm.create_string("__index");
    vm.raw_set(&mt, key, methods).unwrap();
    let key = vm.create_string("__name");
    let name = vm.create_string("Point");
    vm.raw_set(&mt, key, name).unwrap();
    let LuaValue::Table(mt_id) = mt else {
        panic!("not a table");
    };

    let p = vm.create_userdata(Point { x: 1, y: 2 });
    vm.set_metatable(&p, Some(mt_id)).unwrap();
    vm.set_global("p", p);

    let results = vm
        .execute("p:shift(41) return p:x(), type(p), tostring(p)")
        .unwrap();
    assert_eq!(results[0], LuaValue::Integer(42));
    assert_eq!(vm.value_str(&results[1]), Some("userdata"));
    assert!(vm.value_str(&results[2]).unwrap().starts_with("Point: "));
    assert_eq!(vm.userdata_ref::<Point>(&p), Some(&Point { x: 42, y: 2 }));
    assert_eq!(vm.userdata_ref::<String>(&p), None);

    let err = vm.execute_named("return p.x({})", "=ud").unwrap_err();
    assert_eq!(
        err.to_string(),
        "ud:1: bad argument #1 to 'x' (Point expected, got table)"
    );
}

#[test]
fn test_globals_and_registry() {
    let mut vm = new_vm();
    vm.set_global("answer", LuaValue::Integer(42));
    let results = vm.execute("seen = answer * 2; return answer").unwrap();
    assert_eq!(results, vec![LuaValue::Integer(42)]);
    assert_eq!(vm.get_global("seen"), LuaValue::Integer(84));
    assert_eq!(vm.get_global("never_set"), LuaValue::Nil);

    let key = vm.create_string("host.config");
    let config = vm.create_table(0, 1);
    vm.registry_set(key, config).unwrap();
    assert_eq!(vm.registry_get(&key), config);

    // Registry entries survive collections without any other reference
    vm.collect_full();
    assert!(matches!(vm.registry_get(&key), LuaValue::Table(_)));

    assert!(vm.registry_set(LuaValue::Nil, LuaValue::Integer(1)).is_err());
}

#[test]
fn test_call_lua_function_from_host() {
    let mut vm = new_vm();
    vm.execute("function greet(name, n) return 'hi ' .. name, n + 1 end")
        .unwrap();
    let f = vm.get_global("greet");
    let name = vm.create_string("bob");
    let results = vm.call(f, &[name, LuaValue::Integer(1)]).unwrap();
    assert_eq!(vm.value_str(&results[0]), Some("hi bob"));
    assert_eq!(results[1], LuaValue::Integer(2));

    let err = vm.call(LuaValue::Integer(3), &[]).unwrap_err();
    assert_eq!(err.to_string(), "attempt to call a number value");
}

#[test]
fn test_raw_access_and_metamethod_access() {
    let mut vm = new_vm();
    vm.execute(
        "t = setmetatable({present = 1}, {__index = function(_, k) return 42 end})",
    )
    .unwrap();
    let t = vm.get_global("t");
    let missing = vm.create_string("missing");
    let present = vm.create_string("present");

    assert_eq!(vm.raw_get(&t, &missing), Some(LuaValue::Nil));
    assert_eq!(vm.get_field(t, missing).unwrap(), LuaValue::Integer(42));
    assert_eq!(vm.raw_get(&t, &present), Some(LuaValue::Integer(1)));

    vm.raw_set(&t, LuaValue::Integer(1), LuaValue::Boolean(true))
        .unwrap();
    assert_eq!(vm.raw_len(&t), Some(1));
    assert!(vm.raw_set(&t, LuaValue::Float(f64::NAN), LuaValue::Nil).is_err());
    assert!(vm.raw_set(&LuaValue::Integer(1), LuaValue::Nil, LuaValue::Nil).is_err());

    let s = vm.create_string("hello");
    assert_eq!(vm.raw_len(&s), Some(5));
    assert_eq!(vm.raw_len(&LuaValue::Boolean(true)), None);
}

#[test]
fn test_tostring_from_host() {
    let mut vm = new_vm();
    assert_eq!(vm.tostring(LuaValue::Integer(10)).unwrap(), "10");
    assert_eq!(vm.tostring(LuaValue::Float(1e100)).unwrap(), "1e+100");
    assert_eq!(vm.tostring(LuaValue::Float(-0.0)).unwrap(), "-0.0");
    assert_eq!(vm.tostring(LuaValue::Nil).unwrap(), "nil");
    vm.execute("obj = setmetatable({}, {__tostring = function() return 'custom' end})")
        .unwrap();
    let obj = vm.get_global("obj");
    assert_eq!(vm.tostring(obj).unwrap(), "custom");
}

#[test]
fn test_native_errors_are_catchable() {
    let mut vm = new_vm();
    vm.register_function("fail", |vm| Err(vm.error("native failure")));
    let results = vm
        .execute_named("return pcall(fail)", "=n")
        .unwrap();
    assert_eq!(results[0], LuaValue::Boolean(false));
    // Level 1 points at the native itself, which has no source position
    assert_eq!(vm.value_str(&results[1]), Some("native failure"));
}

#[test]
fn test_function_chunk_and_dump_of_loaded_function() {
    let mut vm = new_vm();
    let f = vm.load_source("return 1 + 2", "=c").unwrap();
    let chunk = vm.function_chunk(&f).unwrap();
    let bytes = vm.dump(&chunk, false);
    let again = vm.load_binary(&bytes).unwrap();
    assert_eq!(vm.call(again, &[]).unwrap(), vec![LuaValue::Integer(3)]);
    assert!(vm.function_chunk(&LuaValue::CFunction(sum_args)).is_none());
}

#[test]
fn test_native_can_swallow_errors_from_nested_calls() {
    let mut vm = new_vm();
    vm.register_function("try_call", |vm| {
        let f = vm.check_any(1)?;
        let ok = vm.call(f, &[]).is_ok();
        vm.push_value(LuaValue::Boolean(ok))?;
        Ok(1)
    });
    let depth = vm.state.call_infos.len();
    let results = vm
        .execute_named(
            r#"
            local function boom() local t = nil; return t.x end
            local function deep(n)
                if n == 0 then return boom() end
                return (deep(n - 1))
            end
            local a = try_call(function() return deep(10) end)
            local b = try_call(function() return 1 end)
            local c = try_call(boom)
            return a, b, c, "after"
            "#,
            "=swallow",
        )
        .unwrap();
    assert_eq!(
        results[..3],
        [
            LuaValue::Boolean(false),
            LuaValue::Boolean(true),
            LuaValue::Boolean(false)
        ]
    );
    assert_eq!(vm.value_str(&results[3]), Some("after"));
    assert_eq!(vm.state.call_infos.len(), depth);
}

#[test]
fn test_refs_anchor_values_for_the_host() {
    let mut vm = new_vm();
    let t = vm.execute("return {1, 2, 3}").unwrap()[0];
    let r = vm.create_ref(t);
    let n = vm.create_ref(LuaValue::Integer(5));
    assert!(r.ref_id().is_some());
    assert!(n.ref_id().is_none());
    assert_eq!(vm.ref_count(), 1);

    vm.collect_full();
    vm.collect_full();
    assert_eq!(vm.raw_len(&vm.get_ref(&r)), Some(3));
    assert_eq!(vm.get_ref(&n), LuaValue::Integer(5));

    vm.release_ref(r);
    vm.release_ref(n);
    assert_eq!(vm.ref_count(), 0);
    let again = vm.create_ref(vm.globals());
    assert_eq!(vm.ref_count(), 1);
    vm.release_ref(again);
}

#[test]
fn test_collected_handles_are_reported_not_panicking() {
    let mut vm = new_vm();
    let t = vm.execute("return {1, 2, 3}").unwrap()[0];
    vm.collect_full();
    assert!(!vm.is_live(&t));
    assert_eq!(vm.raw_get(&t, &LuaValue::Integer(1)), None);
    assert_eq!(vm.raw_len(&t), None);
    assert_eq!(vm.get_metatable(&t), None);
    let err = vm.call(t, &[]).unwrap_err();
    assert_eq!(err.to_string(), "attempt to use a collected table value");
    assert!(vm.get_field(t, LuaValue::Integer(1)).is_err());
    assert!(vm.tostring(t).is_err());
    assert!(vm.create_thread(t).is_err());
}
