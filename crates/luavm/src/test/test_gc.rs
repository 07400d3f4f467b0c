// Collector behavior: reachability, finalizers, weak tables and modes
use crate::gc::{GcMode, GenerationalParams, IncrementalParams};
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, SafeOption};
use crate::stdlib::Stdlib;

fn new_vm() -> LuaVM {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    vm
}

// Registers of a running frame are scanned up to the frame's top, so the
// tests drop references in one host call and collect from the host.

#[test]
fn test_upvalues_of_unreachable_closures_are_collected() {
    let mut vm = new_vm();
    vm.execute(
        r#"
        weak = setmetatable({}, {__mode = "v"})
        local function make(tag)
            local payload = {tag = tag}
            weak[tag] = payload
            return function() return payload.tag end
        end
        keep = make("kept")
        make("dropped")
        "#,
    )
    .unwrap();
    vm.collect_full();
    let result = vm.execute(
        r#"
        assert(weak.dropped == nil)
        assert(weak.kept ~= nil)
        assert(keep() == "kept")
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_weak_keys_and_values() {
    let mut vm = new_vm();
    vm.execute(
        r#"
        wk = setmetatable({}, {__mode = "k"})
        wv = setmetatable({}, {__mode = "v"})
        wkv = setmetatable({}, {__mode = "kv"})
        anchor = {}
        wk[anchor] = "a"
        wk[{}] = "gone"
        wv[1] = anchor
        wv[2] = {}
        wv[3] = "strings stay"
        wkv[{}] = anchor
        "#,
    )
    .unwrap();
    vm.collect_full();
    let result = vm.execute(
        r#"
        local n = 0
        for _ in pairs(wk) do n = n + 1 end
        assert(n == 1 and wk[anchor] == "a")
        assert(wv[1] == anchor and wv[2] == nil and wv[3] == "strings stay")
        assert(next(wkv) == nil)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_finalizers_run_once() {
    let mut vm = new_vm();
    vm.execute(
        r#"
        count = 0
        setmetatable({}, {__gc = function(o)
            count = count + 1
            resurrected = o
        end})
        "#,
    )
    .unwrap();
    vm.collect_full();
    let results = vm.execute("local n = count; resurrected = nil; return n").unwrap();
    assert_eq!(results, vec![LuaValue::Integer(1)]);
    vm.collect_full();
    vm.collect_full();
    let results = vm.execute("return count").unwrap();
    assert_eq!(results, vec![LuaValue::Integer(1)]);
}

#[test]
fn test_unreferenced_strings_are_collected() {
    let mut vm = new_vm();
    vm.execute("built = 'dyn' .. 12345; kept = 'dyn' .. 678").unwrap();
    assert!(vm.pool.find_string(b"dyn12345").is_some());
    let before = vm.pool.string_count();
    vm.execute("built = nil").unwrap();
    vm.collect_full();
    assert!(vm.pool.find_string(b"dyn12345").is_none());
    assert!(vm.pool.find_string(b"dyn678").is_some());
    assert!(vm.pool.string_count() < before);
}

#[test]
fn test_finalizer_needs_gc_field_at_setmetatable() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local ran = false
        do
            local mt = {}
            local obj = setmetatable({}, mt)
            mt.__gc = function() ran = true end
        end
        collectgarbage()
        assert(not ran)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_finalizer_errors_are_ignored() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        do
            setmetatable({}, {__gc = function() error("ignored") end})
        end
        collectgarbage()
        return "still running"
        "#,
    );
    let results = result.unwrap();
    assert_eq!(vm.value_str(&results[0]), Some("still running"));
}

#[test]
fn test_finalizers_run_when_vm_drops() {
    use std::cell::Cell;
    use std::rc::Rc;

    let hits = Rc::new(Cell::new(0));
    {
        let mut vm = new_vm();
        let counter = hits.clone();
        vm.register_closure("hit", move |_| {
            counter.set(counter.get() + 1);
            Ok(0)
        });
        vm.execute("keep = setmetatable({}, {__gc = function() hit() end})")
            .unwrap();
    }
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_count_drops_after_collection() {
    let mut vm = new_vm();
    vm.execute("garbage = {} for i = 1, 10000 do garbage[i] = {i} end").unwrap();
    let before = vm.gc_count();
    vm.execute("garbage = nil").unwrap();
    vm.collect_full();
    assert!(vm.gc_count() < before);

    let results = vm.execute("return collectgarbage('count')").unwrap();
    assert!(matches!(results[0], LuaValue::Float(kb) if kb > 0.0));
}

#[test]
fn test_collectgarbage_options() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        assert(collectgarbage("isrunning") == true)
        collectgarbage("stop")
        assert(collectgarbage("isrunning") == false)
        collectgarbage("restart")
        assert(collectgarbage("isrunning") == true)
        assert(collectgarbage("incremental") == "incremental")
        assert(collectgarbage("generational") == "incremental")
        assert(collectgarbage("incremental", 150, 200, 10) == "generational")
        assert(type(collectgarbage("step", 0)) == "boolean")
        assert(collectgarbage() == 0)
        local ok = pcall(collectgarbage, "bogus")
        assert(not ok)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_incremental_steps_finish_a_cycle() {
    let mut vm = new_vm();
    vm.execute("local t = {} for i = 1, 2000 do t[i] = {} end").unwrap();
    let mut finished = false;
    for _ in 0..10000 {
        if vm.collect_step(1) {
            finished = true;
            break;
        }
    }
    assert!(finished);
}

#[test]
fn test_generational_mode_keeps_live_data() {
    let mut vm = new_vm();
    assert_eq!(
        vm.set_generational(GenerationalParams::default()),
        GcMode::Incremental
    );
    let results = vm
        .execute(
            r#"
            local old = {value = "old"}
            collectgarbage("step")
            collectgarbage("step")
            -- old table now points at a young one
            old.child = {value = "young"}
            local weak = setmetatable({}, {__mode = "v"})
            for i = 1, 5000 do
                weak[i] = {i}
                if i % 1000 == 0 then collectgarbage("step") end
            end
            collectgarbage("step")
            return old.child.value, old.value
            "#,
        )
        .unwrap();
    assert_eq!(vm.value_str(&results[0]), Some("young"));
    assert_eq!(vm.value_str(&results[1]), Some("old"));
    assert_eq!(vm.gc_mode(), GcMode::Generational);

    assert_eq!(
        vm.set_incremental(IncrementalParams::default()),
        GcMode::Generational
    );
    vm.collect_full();
    let results = vm.execute("return 40 + 2").unwrap();
    assert_eq!(results, vec![LuaValue::Integer(42)]);
}

#[test]
fn test_coroutine_stacks_are_roots() {
    let mut vm = new_vm();
    let result = vm.execute(
        r#"
        local co = coroutine.wrap(function()
            local held = {value = 7}
            coroutine.yield()
            collectgarbage()
            return held.value
        end)
        co()
        collectgarbage()
        assert(co() == 7)
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_stress_with_small_pause() {
    let mut options = SafeOption::default();
    options.gc.incremental = IncrementalParams {
        pause: 100,
        step_mul: 400,
        step_size: 1024,
    };
    let mut vm = LuaVM::new(options);
    vm.open_stdlib(Stdlib::All).unwrap();
    let results = vm
        .execute(
            r#"
            local list = nil
            for i = 1, 20000 do
                list = {next = (i % 100 ~= 0) and list or nil, value = i}
            end
            local n = 0
            while list do n = n + 1; list = list.next end
            return n
            "#,
        )
        .unwrap();
    assert_eq!(results, vec![LuaValue::Integer(100)]);
}

#[test]
fn test_main_stack_survives_repeated_full_cycles() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local t = setmetatable({x = 1, name = "kept" .. 1}, {__index = function() return "meta" end})
            for cycle = 1, 3 do
                collectgarbage()
                for i = 1, 200 do local _ = {i} end
            end
            return t.x, t.name, t.missing
            "#,
        )
        .unwrap();
    assert_eq!(results[0], LuaValue::Integer(1));
    assert_eq!(vm.value_str(&results[1]), Some("kept1"));
    assert_eq!(vm.value_str(&results[2]), Some("meta"));

    // Same again with the cycles driven from the host between calls
    vm.execute("held = {list = {1, 2, 3}}").unwrap();
    for _ in 0..3 {
        vm.collect_full();
    }
    let results = vm.execute("return #held.list").unwrap();
    assert_eq!(results, vec![LuaValue::Integer(3)]);
}

#[test]
fn test_string_keys_survive_cycles() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local t = {}
            for i = 1, 100 do t["k" .. i] = i end
            collectgarbage()
            collectgarbage()
            for i = 1, 1000 do local s = "tmp" .. i end
            collectgarbage()
            local sum = 0
            for i = 1, 100 do sum = sum + t["k" .. i] end
            return sum
            "#,
        )
        .unwrap();
    assert_eq!(results, vec![LuaValue::Integer(5050)]);
}

#[test]
fn test_full_cycles_then_generational_switch() {
    let mut vm = new_vm();
    let results = vm
        .execute(
            r#"
            local t = {1, {2}}
            collectgarbage()
            collectgarbage()
            local previous = collectgarbage("generational")
            collectgarbage()
            for i = 1, 500 do local _ = {i} end
            collectgarbage("step")
            return previous, t[1] + t[2][1]
            "#,
        )
        .unwrap();
    assert_eq!(vm.value_str(&results[0]), Some("incremental"));
    assert_eq!(results[1], LuaValue::Integer(3));
    assert_eq!(vm.gc_mode(), GcMode::Generational);
}

#[test]
fn test_host_refs_survive_cycles() {
    let mut vm = new_vm();
    let t = vm.execute("return {value = 'anchored'}").unwrap()[0];
    let r = vm.create_ref(t);
    for _ in 0..3 {
        vm.collect_full();
        vm.execute("local junk = {} for i = 1, 1000 do junk[i] = {i} end")
            .unwrap();
    }
    vm.set_generational(GenerationalParams::default());
    vm.collect_full();

    let t = vm.get_ref(&r);
    assert!(vm.is_live(&t));
    let key = vm.create_string("value");
    let value = vm.get_field(t, key).unwrap();
    assert_eq!(vm.value_str(&value), Some("anchored"));
    vm.release_ref(r);
}

#[test]
fn test_generational_switch_inside_finalizer_is_applied_later() {
    let mut vm = new_vm();
    vm.execute(
        r#"
        setmetatable({}, {__gc = function()
            switched = collectgarbage("generational")
        end})
        "#,
    )
    .unwrap();
    vm.collect_full();
    // The finalizer ran while the collector was busy
    assert_eq!(vm.gc_mode(), GcMode::Incremental);
    let switched = vm.get_global("switched");
    assert_eq!(vm.value_str(&switched), Some("incremental"));

    vm.collect_step(0);
    assert_eq!(vm.gc_mode(), GcMode::Generational);
    let results = vm.execute("return collectgarbage('incremental')").unwrap();
    assert_eq!(vm.value_str(&results[0]), Some("generational"));
}
