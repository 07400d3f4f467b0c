// Coroutines from scripts and from the host
use crate::lua_value::LuaValue;
use crate::lua_vm::{CoroutineStatus, LuaVM, ResumeResult, RuntimeErrorKind, SafeOption};
use crate::stdlib::Stdlib;

fn new_vm() -> LuaVM {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    vm
}

#[test]
fn test_host_resume_yield_then_return() {
    let mut vm = new_vm();
    let f = vm
        .load_source("local x = ...; coroutine.yield(x + 1)", "=co")
        .unwrap();
    let co = vm.create_thread(f).unwrap();
    let LuaValue::Thread(tid) = co else {
        panic!("not a thread");
    };
    assert_eq!(vm.thread_status(tid), CoroutineStatus::Suspended);

    match vm.resume(co, &[LuaValue::Integer(41)]).unwrap() {
        ResumeResult::Yielded(values) => assert_eq!(values, vec![LuaValue::Integer(42)]),
        other => panic!("expected a yield, got {other:?}"),
    }
    assert_eq!(vm.thread_status(tid), CoroutineStatus::Suspended);

    match vm.resume(co, &[]).unwrap() {
        ResumeResult::Returned(values) => assert!(values.is_empty()),
        other => panic!("expected a return, got {other:?}"),
    }
    assert_eq!(vm.thread_status(tid), CoroutineStatus::Dead);

    let err = vm.resume(co, &[]).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::Coroutine));
    assert_eq!(err.to_string(), "cannot resume dead coroutine");
}

#[test]
fn test_host_resume_reports_errors() {
    let mut vm = new_vm();
    let f = vm.load_source("error('boom')", "=co").unwrap();
    let co = vm.create_thread(f).unwrap();
    match vm.resume(co, &[]).unwrap() {
        ResumeResult::Errored(e) => assert_eq!(e.to_string(), "co:1: boom"),
        other => panic!("expected an error, got {other:?}"),
    }
}

#[test]
fn test_resume_passes_values_both_ways() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local co = coroutine.create(function(a, b)
            local c = coroutine.yield(a + b)
            local d, e = coroutine.yield(c * 2)
            return d + e
        end)
        local ok, v = coroutine.resume(co, 1, 2)
        assert(ok and v == 3)
        ok, v = coroutine.resume(co, 10)
        assert(ok and v == 20)
        ok, v = coroutine.resume(co, 3, 4)
        assert(ok and v == 7)
        assert(coroutine.status(co) == "dead")
        local ok2, msg = coroutine.resume(co)
        assert(not ok2 and msg == "cannot resume dead coroutine")
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_generator_with_wrap() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local function range(n)
                return coroutine.wrap(function()
                    for i = 1, n do coroutine.yield(i) end
                end)
            end
            local sum = 0
            for i in range(10) do sum = sum + i end
            return sum
            "#,
        )
        .unwrap();
    assert_eq!(results, vec![LuaValue::Integer(55)]);
}

#[test]
fn test_wrap_propagates_errors_with_position() {
    let mut vm = new_vm();
    let err = vm
        .execute_named(
            "local f = coroutine.wrap(function() error('inner') end)\nf()",
            "=test",
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "test:2: test:1: inner");
}

#[test]
fn test_status_running_and_normal() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local main, is_main = coroutine.running()
        assert(is_main and type(main) == "thread")
        assert(not coroutine.isyieldable())

        local outer
        local inner = coroutine.create(function()
            assert(coroutine.status(outer) == "normal")
            local _, inner_main = coroutine.running()
            assert(not inner_main)
            assert(coroutine.isyieldable())
        end)
        outer = coroutine.create(function()
            assert(coroutine.status(outer) == "running")
            assert(coroutine.resume(inner))
        end)
        assert(coroutine.status(outer) == "suspended")
        assert(coroutine.resume(outer))
        assert(coroutine.status(outer) == "dead")
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_yield_across_pcall() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local co = coroutine.create(function()
            local ok, err = pcall(function()
                local v = coroutine.yield("first")
                error("after " .. v)
            end)
            coroutine.yield(ok, err)
            return "done"
        end)
        local _, v = coroutine.resume(co)
        assert(v == "first")
        local _, ok, err = coroutine.resume(co, "resume")
        assert(ok == false)
        local _, last = coroutine.resume(co)
        assert(last == "done")
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_yield_outside_coroutine() {
    let mut vm = new_vm();
    let results = vm.execute("return pcall(coroutine.yield, 1)").unwrap();
    assert_eq!(results[0], LuaValue::Boolean(false));
    assert_eq!(
        vm.value_str(&results[1]),
        Some("attempt to yield from outside a coroutine")
    );
}

#[test]
fn test_yield_across_metamethod_is_rejected() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local t = setmetatable({}, {__index = function() coroutine.yield() end})
            local co = coroutine.create(function() return t.x end)
            return coroutine.resume(co)
            "#,
        )
        .unwrap();
    assert_eq!(results[0], LuaValue::Boolean(false));
    assert_eq!(
        vm.value_str(&results[1]),
        Some("attempt to yield across a C-call boundary")
    );
}

#[test]
fn test_close_runs_pending_to_be_closed() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local closed = false
        local co = coroutine.create(function()
            local guard <close> = setmetatable({}, {__close = function() closed = true end})
            coroutine.yield()
        end)
        coroutine.resume(co)
        assert(not closed)
        assert(coroutine.close(co) == true)
        assert(closed)
        assert(coroutine.status(co) == "dead")

        local failed = coroutine.create(function() error({code = 7}) end)
        coroutine.resume(failed)
        local ok, err = coroutine.close(failed)
        assert(ok == false and err.code == 7)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_coroutine_error_closes_to_be_closed() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local seen
        local co = coroutine.create(function()
            local guard <close> = setmetatable({}, {__close = function(_, e) seen = e end})
            error("fail", 0)
        end)
        local ok, err = coroutine.resume(co)
        assert(not ok and err == "fail" and seen == "fail")
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_many_coroutines() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local cos = {}
            for i = 1, 200 do
                cos[i] = coroutine.create(function(x)
                    while true do x = x + coroutine.yield(x) end
                end)
            end
            local total = 0
            for round = 1, 3 do
                for i = 1, 200 do
                    local _, v = coroutine.resume(cos[i], i)
                    total = total + v
                end
            end
            return total
            "#,
        )
        .unwrap();
    // Round r yields r * i for coroutine i
    assert_eq!(results, vec![LuaValue::Integer(6 * 20100)]);
}
