// Coroutine library
// Implements: create, resume, yield, status, running, wrap, isyieldable, close

use crate::lib_registry::LibraryModule;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM, ResumeResult};

pub fn create_coroutine_lib() -> LibraryModule {
    crate::lib_module!("coroutine", {
        "create" => coroutine_create,
        "resume" => coroutine_resume,
        "yield" => coroutine_yield,
        "status" => coroutine_status,
        "running" => coroutine_running,
        "wrap" => coroutine_wrap,
        "isyieldable" => coroutine_isyieldable,
        "close" => coroutine_close,
    })
}

fn check_thread(vm: &mut LuaVM, arg: usize) -> LuaResult<LuaValue> {
    match vm.get_arg(arg) {
        Some(co @ LuaValue::Thread(_)) => Ok(co),
        _ => Err(vm.type_error_arg(arg, "coroutine")),
    }
}

/// String error objects get the position of the calling Lua code
fn with_position(vm: &mut LuaVM, e: LuaError) -> LuaError {
    let LuaError::Runtime(mut rt) = e else {
        return e;
    };
    if let LuaValue::String(id) = rt.value {
        let position = vm.where_(1);
        if !position.is_empty() {
            let mut bytes = position.into_bytes();
            bytes.extend_from_slice(vm.string_bytes(id));
            rt.message = String::from_utf8_lossy(&bytes).into_owned();
            rt.value = vm.create_bytes(&bytes);
        }
    }
    LuaError::Runtime(rt)
}

fn push_all(vm: &mut LuaVM, values: Vec<LuaValue>) -> LuaResult<usize> {
    let n = values.len();
    for v in values {
        vm.push_value(v)?;
    }
    Ok(n)
}

fn new_coroutine(vm: &mut LuaVM) -> LuaResult<LuaValue> {
    let f = vm.get_arg(1).unwrap_or_default();
    if !matches!(f, LuaValue::Function(_) | LuaValue::CFunction(_)) {
        return Err(vm.type_error_arg(1, "function"));
    }
    vm.create_thread(f)
}

/// coroutine.create(f)
fn coroutine_create(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = new_coroutine(vm)?;
    vm.push_value(co)?;
    Ok(1)
}

/// coroutine.resume(co, ...) - true and the yielded or returned values, or
/// false and the error object
fn coroutine_resume(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = check_thread(vm, 1)?;
    let args = vm.get_args().split_off(1);
    let outcome = match vm.resume(co, &args) {
        Ok(ResumeResult::Yielded(values)) | Ok(ResumeResult::Returned(values)) => Ok(values),
        Ok(ResumeResult::Errored(e)) => Err(e),
        Err(e) if e.is_signal() => return Err(e),
        // Resuming a running or dead coroutine is reported, not raised
        Err(e) => Err(e),
    };
    match outcome {
        Ok(values) => {
            vm.push_value(LuaValue::Boolean(true))?;
            Ok(1 + push_all(vm, values)?)
        }
        Err(e) => {
            let value = vm.error_value(&e);
            vm.push_value(LuaValue::Boolean(false))?;
            vm.push_value(value)?;
            Ok(2)
        }
    }
}

/// coroutine.yield(...)
fn coroutine_yield(vm: &mut LuaVM) -> LuaResult<usize> {
    let values = vm.get_args();
    vm.yield_values(values)
}

fn coroutine_status(vm: &mut LuaVM) -> LuaResult<usize> {
    let LuaValue::Thread(tid) = check_thread(vm, 1)? else {
        return Ok(0);
    };
    let name = vm.thread_status(tid).name();
    let s = vm.create_string(name);
    vm.push_value(s)?;
    Ok(1)
}

/// coroutine.running() - the running coroutine and whether it is the main one
fn coroutine_running(vm: &mut LuaVM) -> LuaResult<usize> {
    let (co, is_main) = vm.running_thread();
    vm.push_value(co)?;
    vm.push_value(LuaValue::Boolean(is_main))?;
    Ok(2)
}

/// coroutine.wrap(f) - a function that resumes a new coroutine and
/// propagates its errors
fn coroutine_wrap(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = new_coroutine(vm)?;
    let wrapper = vm.create_closure(wrap_resume, vec![co]);
    vm.push_value(wrapper)?;
    Ok(1)
}

fn wrap_resume(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = vm.closure_upvalue(0);
    let args = vm.get_args();
    match vm.resume(co, &args) {
        Ok(ResumeResult::Yielded(values)) | Ok(ResumeResult::Returned(values)) => push_all(vm, values),
        Ok(ResumeResult::Errored(e)) => Err(with_position(vm, e)),
        Err(e) if e.is_signal() => Err(e),
        Err(e) => Err(with_position(vm, e)),
    }
}

/// coroutine.isyieldable([co])
fn coroutine_isyieldable(vm: &mut LuaVM) -> LuaResult<usize> {
    let yieldable = match vm.get_arg(1) {
        None | Some(LuaValue::Nil) => vm.is_yieldable(),
        Some(_) => {
            let LuaValue::Thread(tid) = check_thread(vm, 1)? else {
                return Ok(0);
            };
            if tid == vm.current_thread {
                vm.is_yieldable()
            } else {
                tid != vm.main_thread
            }
        }
    };
    vm.push_value(LuaValue::Boolean(yieldable))?;
    Ok(1)
}

/// coroutine.close(co) - true, or false and the error object
fn coroutine_close(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = check_thread(vm, 1)?;
    match vm.close_thread(co) {
        Ok(None) => {
            vm.push_value(LuaValue::Boolean(true))?;
            Ok(1)
        }
        Ok(Some(err)) => {
            vm.push_value(LuaValue::Boolean(false))?;
            vm.push_value(err)?;
            Ok(2)
        }
        Err(e) => Err(with_position(vm, e)),
    }
}
