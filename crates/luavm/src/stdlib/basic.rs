// Basic library (_G global functions)
// Implements: assert, error, pcall, xpcall, type, tostring, tonumber,
// select, rawequal, rawget, rawset, rawlen, setmetatable, getmetatable,
// next, pairs, ipairs, print, collectgarbage, load, dump, traceback

use std::io::Write;

use crate::gc::{GcMode, GenerationalParams, IncrementalParams};
use crate::lib_registry::LibraryModule;
use crate::lua_value::chunk_serializer::is_binary_chunk;
use crate::lua_value::{Chunk, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaVM, TmKind};

pub fn create_basic_lib() -> LibraryModule {
    crate::lib_module!("_G", {
        "assert" => lua_assert,
        "error" => lua_error,
        "pcall" => lua_pcall,
        "xpcall" => lua_xpcall,
        "type" => lua_type,
        "tostring" => lua_tostring,
        "tonumber" => lua_tonumber,
        "select" => lua_select,
        "rawequal" => lua_rawequal,
        "rawget" => lua_rawget,
        "rawset" => lua_rawset,
        "rawlen" => lua_rawlen,
        "setmetatable" => lua_setmetatable,
        "getmetatable" => lua_getmetatable,
        "next" => lua_next,
        "pairs" => lua_pairs,
        "ipairs" => lua_ipairs,
        "print" => lua_print,
        "collectgarbage" => lua_collectgarbage,
        "load" => lua_load,
        "dump" => lua_dump,
        "traceback" => lua_traceback,
    })
    .with_value("_G", |vm| vm.globals())
    .with_value("_VERSION", |vm| vm.create_string("Lua 5.4"))
}

/// assert(v [, message]) - all arguments are returned when `v` is truthy
fn lua_assert(vm: &mut LuaVM) -> LuaResult<usize> {
    let condition = vm.check_any(1)?;
    if condition.is_truthy() {
        return Ok(vm.arg_count());
    }
    match vm.get_arg(2) {
        Some(msg) if !msg.is_nil() => Err(vm.error_with_value(msg)),
        _ => Err(vm.error("assertion failed!")),
    }
}

/// error(v [, level]) - string messages get the position of `level`
fn lua_error(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.get_arg(1).unwrap_or_default();
    let level = vm.opt_integer(2, 1)?;
    if let LuaValue::String(id) = value
        && level > 0
    {
        let position = vm.where_(level as usize);
        if !position.is_empty() {
            let mut bytes = position.into_bytes();
            bytes.extend_from_slice(vm.string_bytes(id));
            let message = vm.create_bytes(&bytes);
            return Err(vm.error_with_value(message));
        }
    }
    Err(vm.error_with_value(value))
}

/// pcall(f, ...) - the interpreter turns this frame into a protected call
fn lua_pcall(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.check_any(1)?;
    vm.protect_request = Some(false);
    Err(LuaError::Protect)
}

/// xpcall(f, msgh, ...)
fn lua_xpcall(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.check_any(2)?;
    vm.protect_request = Some(true);
    Err(LuaError::Protect)
}

fn lua_type(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.check_any(1)?;
    let name = vm.create_string(value.type_name());
    vm.push_value(name)?;
    Ok(1)
}

fn lua_tostring(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.check_any(1)?;
    let s = vm.tostring_value(value)?;
    vm.push_value(s)?;
    Ok(1)
}

/// tonumber(e [, base])
fn lua_tonumber(vm: &mut LuaVM) -> LuaResult<usize> {
    let result = match vm.get_arg(2) {
        None | Some(LuaValue::Nil) => {
            let value = vm.check_any(1)?;
            vm.to_number(&value).unwrap_or_default()
        }
        Some(_) => {
            let base = vm.check_integer(2)?;
            let id = match vm.get_arg(1) {
                Some(LuaValue::String(id)) => id,
                _ => return Err(vm.type_error_arg(1, "string")),
            };
            if !(2..=36).contains(&base) {
                return Err(vm.arg_error(2, "base out of range"));
            }
            parse_in_base(vm.string_bytes(id), base as u32)
                .map(LuaValue::Integer)
                .unwrap_or_default()
        }
    };
    vm.push_value(result)?;
    Ok(1)
}

/// Integer numeral in `base`, surrounded by optional whitespace; the
/// accumulation wraps around like integer arithmetic does
fn parse_in_base(bytes: &[u8], base: u32) -> Option<i64> {
    let text = bytes.trim_ascii();
    let (negative, digits) = match text.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, text),
    };
    if digits.is_empty() {
        return None;
    }
    let mut n: i64 = 0;
    for &b in digits {
        let digit = (b as char).to_digit(base)?;
        n = n.wrapping_mul(base as i64).wrapping_add(digit as i64);
    }
    Some(if negative { n.wrapping_neg() } else { n })
}

/// select(n, ...) or select('#', ...)
fn lua_select(vm: &mut LuaVM) -> LuaResult<usize> {
    let top = vm.arg_count() as i64;
    if let Some(LuaValue::String(id)) = vm.get_arg(1)
        && vm.string_bytes(id) == b"#"
    {
        vm.push_value(LuaValue::Integer(top - 1))?;
        return Ok(1);
    }
    let mut n = vm.check_integer(1)?;
    if n < 0 {
        n += top;
    } else if n > top {
        n = top;
    }
    if n < 1 {
        return Err(vm.arg_error(1, "index out of range"));
    }
    // The selected arguments already sit at the top of the frame
    Ok((top - n) as usize)
}

fn lua_rawequal(vm: &mut LuaVM) -> LuaResult<usize> {
    let a = vm.check_any(1)?;
    let b = vm.check_any(2)?;
    vm.push_value(LuaValue::Boolean(a.raw_equal(&b)))?;
    Ok(1)
}

fn lua_rawget(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = vm.check_table(1)?;
    let key = vm.check_any(2)?;
    let value = vm.raw_get(&LuaValue::Table(t), &key).unwrap_or_default();
    vm.push_value(value)?;
    Ok(1)
}

fn lua_rawset(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = LuaValue::Table(vm.check_table(1)?);
    let key = vm.check_any(2)?;
    let value = vm.check_any(3)?;
    vm.raw_set(&t, key, value)?;
    vm.push_value(t)?;
    Ok(1)
}

fn lua_rawlen(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.get_arg(1).unwrap_or_default();
    match vm.raw_len(&value) {
        Some(len) => {
            vm.push_value(LuaValue::Integer(len as i64))?;
            Ok(1)
        }
        None => Err(vm.arg_error(1, "table or string expected")),
    }
}

/// setmetatable(t, mt) - refused when the current metatable has `__metatable`
fn lua_setmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = LuaValue::Table(vm.check_table(1)?);
    let mt = match vm.get_arg(2) {
        Some(LuaValue::Nil) => None,
        Some(LuaValue::Table(mt)) => Some(mt),
        _ => return Err(vm.type_error_arg(2, "nil or table")),
    };
    if !vm.get_metamethod(&t, TmKind::Metatable).is_nil() {
        return Err(vm.error("cannot change a protected metatable"));
    }
    vm.set_metatable(&t, mt)?;
    vm.push_value(t)?;
    Ok(1)
}

/// getmetatable(v) - the `__metatable` field stands in for a protected metatable
fn lua_getmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.check_any(1)?;
    let result = match vm.get_metatable(&value) {
        Some(mt) => {
            let protected = vm.raw_tm(mt, TmKind::Metatable);
            if protected.is_nil() {
                LuaValue::Table(mt)
            } else {
                protected
            }
        }
        None => LuaValue::Nil,
    };
    vm.push_value(result)?;
    Ok(1)
}

/// next(t [, key])
fn lua_next(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = vm.check_table(1)?;
    let key = vm.get_arg(2).unwrap_or_default();
    match vm.pool.tables[t].next(&key) {
        Ok(Some((k, v))) => {
            vm.push_value(k)?;
            vm.push_value(v)?;
            Ok(2)
        }
        Ok(None) => {
            vm.push_value(LuaValue::Nil)?;
            Ok(1)
        }
        Err(()) => Err(vm.error("invalid key to 'next'")),
    }
}

/// pairs(t) - `__pairs` supplies the iterator triple when present
fn lua_pairs(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = vm.check_any(1)?;
    let tm = vm.get_metamethod(&t, TmKind::Pairs);
    if tm.is_nil() {
        vm.push_value(LuaValue::cfunction(lua_next))?;
        vm.push_value(t)?;
        vm.push_value(LuaValue::Nil)?;
        return Ok(3);
    }
    let results = vm.call_value(tm, &[t])?;
    for i in 0..3 {
        vm.push_value(results.get(i).copied().unwrap_or_default())?;
    }
    Ok(3)
}

fn lua_ipairs(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = vm.check_any(1)?;
    vm.push_value(LuaValue::cfunction(ipairs_next))?;
    vm.push_value(t)?;
    vm.push_value(LuaValue::Integer(0))?;
    Ok(3)
}

/// ipairs iterator; indexing honors `__index`
fn ipairs_next(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = vm.get_arg(1).unwrap_or_default();
    let i = vm.check_integer(2)?.wrapping_add(1);
    let value = match t {
        LuaValue::Table(id) if vm.get_metatable(&t).is_none() => vm.pool.tables[id].get_int(i),
        _ => vm.get_field(t, LuaValue::Integer(i))?,
    };
    if value.is_nil() {
        vm.push_value(LuaValue::Nil)?;
        return Ok(1);
    }
    vm.push_value(LuaValue::Integer(i))?;
    vm.push_value(value)?;
    Ok(2)
}

/// print(...) - tab-separated `tostring` of every argument
fn lua_print(vm: &mut LuaVM) -> LuaResult<usize> {
    let args = vm.get_args();
    let mut line = Vec::new();
    for (i, arg) in args.into_iter().enumerate() {
        if i > 0 {
            line.push(b'\t');
        }
        let s = vm.tostring_value(arg)?;
        line.extend_from_slice(vm.value_bytes(&s).unwrap_or_default());
    }
    line.push(b'\n');
    let mut out = std::io::stdout().lock();
    if let Err(e) = out.write_all(&line).and_then(|_| out.flush()) {
        tracing::warn!(error = %e, "print failed");
    }
    Ok(0)
}

fn mode_name(mode: GcMode) -> &'static str {
    match mode {
        GcMode::Incremental => "incremental",
        GcMode::Generational => "generational",
    }
}

/// Optional integer parameter; absent or zero keeps `current`
fn gc_param<T: TryFrom<i64>>(vm: &mut LuaVM, arg: usize, current: T) -> LuaResult<T> {
    let n = vm.opt_integer(arg, 0)?;
    if n <= 0 {
        return Ok(current);
    }
    Ok(T::try_from(n).unwrap_or(current))
}

/// collectgarbage([opt [, ...]])
fn lua_collectgarbage(vm: &mut LuaVM) -> LuaResult<usize> {
    let opt = match vm.opt_string(1)? {
        Some(id) => String::from_utf8_lossy(vm.string_bytes(id)).into_owned(),
        None => "collect".to_string(),
    };
    let result = match opt.as_str() {
        "collect" => {
            vm.collect_full();
            LuaValue::Integer(0)
        }
        "count" => LuaValue::Float(vm.gc_count() as f64 / 1024.0),
        "step" => {
            let kb = vm.opt_integer(2, 0)?.max(0) as usize;
            LuaValue::Boolean(vm.collect_step(kb))
        }
        "stop" => {
            vm.gc_stop();
            LuaValue::Integer(0)
        }
        "restart" => {
            vm.gc_restart();
            LuaValue::Integer(0)
        }
        "isrunning" => LuaValue::Boolean(vm.gc_is_running()),
        "incremental" => {
            let current = vm.gc.inc_params;
            let pause = gc_param(vm, 2, current.pause)?;
            let step_mul = gc_param(vm, 3, current.step_mul)?;
            // The step size is given as a power of two
            let step_size = match vm.opt_integer(4, 0)? {
                n if (1..usize::BITS as i64).contains(&n) => 1usize << n,
                _ => current.step_size,
            };
            let previous = vm.set_incremental(IncrementalParams {
                pause,
                step_mul,
                step_size,
            });
            vm.create_string(mode_name(previous))
        }
        "generational" => {
            let current = vm.gc.gen_params;
            let minor_mul = gc_param(vm, 2, current.minor_mul)?;
            let major_mul = gc_param(vm, 3, current.major_mul)?;
            let previous = vm.set_generational(GenerationalParams {
                minor_mul,
                major_mul,
            });
            vm.create_string(mode_name(previous))
        }
        other => {
            let msg = format!("invalid option '{other}'");
            return Err(vm.arg_error(1, &msg));
        }
    };
    vm.push_value(result)?;
    Ok(1)
}

/// Concatenate the pieces returned by a reader function until it returns
/// nil or an empty string
fn read_chunk_pieces(vm: &mut LuaVM, reader: LuaValue) -> LuaResult<Vec<u8>> {
    let mut source = Vec::new();
    loop {
        let piece = vm.call_value(reader, &[])?;
        match piece.first().copied().unwrap_or_default() {
            LuaValue::Nil => break,
            LuaValue::String(id) => {
                let bytes = vm.string_bytes(id);
                if bytes.is_empty() {
                    break;
                }
                source.extend_from_slice(bytes);
            }
            _ => return Err(vm.error("reader function must return a string")),
        }
    }
    Ok(source)
}

fn compile_chunk(vm: &mut LuaVM, source: &[u8], chunk_name: &str, mode: &[u8]) -> Result<Chunk, String> {
    let binary = is_binary_chunk(source);
    let (kind, allowed) = if binary {
        ("binary", mode.contains(&b'b'))
    } else {
        ("text", mode.contains(&b't'))
    };
    if !allowed {
        let mode = String::from_utf8_lossy(mode);
        return Err(format!("attempt to load a {kind} chunk (mode is '{mode}')"));
    }
    let compiled = if binary {
        vm.undump(source)
    } else {
        vm.compile_bytes(source, chunk_name)
    };
    compiled.map_err(|e| e.to_string())
}

/// load(chunk [, chunkname [, mode [, env]]]) - failures return nil and a message
fn lua_load(vm: &mut LuaVM) -> LuaResult<usize> {
    let chunk = vm.get_arg(1).unwrap_or_default();
    let (source, default_name) = match chunk {
        LuaValue::String(id) => {
            let bytes = vm.string_bytes(id).to_vec();
            let name = String::from_utf8_lossy(&bytes).into_owned();
            (bytes, name)
        }
        LuaValue::Function(_) | LuaValue::CFunction(_) => {
            (read_chunk_pieces(vm, chunk)?, "=(load)".to_string())
        }
        _ => return Err(vm.type_error_arg(1, "string")),
    };
    let chunk_name = match vm.opt_string(2)? {
        Some(id) => String::from_utf8_lossy(vm.string_bytes(id)).into_owned(),
        None => default_name,
    };
    let mode = match vm.opt_string(3)? {
        Some(id) => vm.string_bytes(id).to_vec(),
        None => b"bt".to_vec(),
    };
    match compile_chunk(vm, &source, &chunk_name, &mode) {
        Ok(chunk) => {
            let env = match vm.get_arg(4) {
                Some(env) => env,
                None => vm.globals(),
            };
            let f = vm.load_with_env(chunk.into(), env);
            vm.push_value(f)?;
            Ok(1)
        }
        Err(msg) => {
            let msg = vm.create_string(&msg);
            vm.push_value(LuaValue::Nil)?;
            vm.push_value(msg)?;
            Ok(2)
        }
    }
}

/// dump(f [, strip]) - binary chunk of a Lua function
fn lua_dump(vm: &mut LuaVM) -> LuaResult<usize> {
    let f = vm.check_any(1)?;
    let strip = vm.get_arg(2).is_some_and(|v| v.is_truthy());
    let Some(chunk) = vm.function_chunk(&f) else {
        return Err(vm.arg_error(1, "unable to dump given function"));
    };
    let bytes = vm.dump(&chunk, strip);
    let s = vm.create_bytes(&bytes);
    vm.push_value(s)?;
    Ok(1)
}

/// traceback([msg [, level]]) - non-string messages are returned untouched
fn lua_traceback(vm: &mut LuaVM) -> LuaResult<usize> {
    let msg = vm.get_arg(1).unwrap_or_default();
    let text = match msg {
        LuaValue::Nil => None,
        LuaValue::String(id) => Some(String::from_utf8_lossy(vm.string_bytes(id)).into_owned()),
        LuaValue::Integer(_) | LuaValue::Float(_) => Some(vm.tostring(msg)?),
        other => {
            vm.push_value(other)?;
            return Ok(1);
        }
    };
    let level = vm.opt_integer(2, 1)?.max(0) as usize;
    let trace = vm.traceback(text.as_deref(), level);
    let s = vm.create_string(&trace);
    vm.push_value(s)?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_in_base() {
        assert_eq!(parse_in_base(b"ff", 16), Some(255));
        assert_eq!(parse_in_base(b"  -101  ", 2), Some(-5));
        assert_eq!(parse_in_base(b"zz", 36), Some(1295));
        assert_eq!(parse_in_base(b"12", 2), None);
        assert_eq!(parse_in_base(b"", 10), None);
        assert_eq!(parse_in_base(b"-", 10), None);
        assert_eq!(parse_in_base(b"1 2", 10), None);
    }
}
