// Lua Virtual Machine
// Executes compiled bytecode with register-based architecture.
// The VM owns the heap (object pool + collector) and the state of the
// running thread; suspended coroutines keep their state in the thread arena.
mod call_info;
mod coroutine;
mod debug_info;
mod execute;
mod lua_error;
pub mod lua_limits;
mod lua_ref;
mod lua_state;
mod opcode;
mod safe_option;
mod stack_api;

use std::any::Any;
use std::rc::Rc;

use crate::compiler;
use crate::gc::{GarbageCollector, GcModeOption, ObjectPool, StringId, TableId, ThreadId};
use crate::lua_value::chunk_serializer;
use crate::lua_value::{
    CFunction, Chunk, Constant, HostClosure, LuaClosure, LuaFunction, LuaTable, LuaThread,
    LuaUpvalue, LuaUserdata, LuaValue, Proto,
};

pub use call_info::{CallInfo, call_status};
pub use coroutine::ResumeResult;
pub use debug_info::chunk_id;
pub use lua_error::{LuaError, LuaResult, RuntimeError, RuntimeErrorKind};
pub use lua_ref::{LuaRef, RefId};
pub use lua_state::{CoroutineStatus, LuaState};
pub use opcode::{Instruction, OpCode, OpMode};
pub use safe_option::SafeOption;

pub(crate) use execute::{ValueSource, arith_numbers};

/// Metamethod events. The order is also the index of each pre-interned name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmKind {
    Index,
    NewIndex,
    Gc,
    Mode,
    Len,
    Eq,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Lt,
    Le,
    Concat,
    Call,
    Close,
    ToString,
    Name,
    Metatable,
    Pairs,
}

impl TmKind {
    pub const ALL: [TmKind; 29] = [
        TmKind::Index,
        TmKind::NewIndex,
        TmKind::Gc,
        TmKind::Mode,
        TmKind::Len,
        TmKind::Eq,
        TmKind::Add,
        TmKind::Sub,
        TmKind::Mul,
        TmKind::Mod,
        TmKind::Pow,
        TmKind::Div,
        TmKind::IDiv,
        TmKind::BAnd,
        TmKind::BOr,
        TmKind::BXor,
        TmKind::Shl,
        TmKind::Shr,
        TmKind::Unm,
        TmKind::BNot,
        TmKind::Lt,
        TmKind::Le,
        TmKind::Concat,
        TmKind::Call,
        TmKind::Close,
        TmKind::ToString,
        TmKind::Name,
        TmKind::Metatable,
        TmKind::Pairs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Gc => "__gc",
            TmKind::Mode => "__mode",
            TmKind::Len => "__len",
            TmKind::Eq => "__eq",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Div => "__div",
            TmKind::IDiv => "__idiv",
            TmKind::BAnd => "__band",
            TmKind::BOr => "__bor",
            TmKind::BXor => "__bxor",
            TmKind::Shl => "__shl",
            TmKind::Shr => "__shr",
            TmKind::Unm => "__unm",
            TmKind::BNot => "__bnot",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Concat => "__concat",
            TmKind::Call => "__call",
            TmKind::Close => "__close",
            TmKind::ToString => "__tostring",
            TmKind::Name => "__name",
            TmKind::Metatable => "__metatable",
            TmKind::Pairs => "__pairs",
        }
    }

    /// Event name without the leading underscores, as used in error messages
    pub fn short_name(self) -> &'static str {
        &self.name()[2..]
    }
}

/// Registry slots fixed at creation
pub const RIDX_MAINTHREAD: i64 = 1;
pub const RIDX_GLOBALS: i64 = 2;

pub struct LuaVM {
    // Object pool: every heap object lives here
    pub(crate) pool: ObjectPool,

    // Collector bookkeeping; the algorithms are LuaVM methods in gc/collector.rs
    pub(crate) gc: GarbageCollector,

    /// State of the running thread
    pub(crate) state: Box<LuaState>,
    pub(crate) current_thread: ThreadId,
    pub(crate) main_thread: ThreadId,

    /// Threads left in `normal` status by nested resumes, outermost first
    pub(crate) resume_chain: Vec<ThreadId>,

    // Registry table (like Lua's LUA_REGISTRYINDEX), a GC root
    pub(crate) registry: TableId,
    // Global environment, `_ENV` of every loaded chunk
    pub(crate) globals: TableId,

    pub(crate) options: SafeOption,

    /// Nesting of Rust-level calls (natives calling back, metamethods, resumes)
    pub(crate) n_ccalls: u32,

    /// Values passed by the pending `coroutine.yield`
    pub(crate) yield_values: Vec<LuaValue>,

    /// Set by `pcall`/`xpcall` right before they return `LuaError::Protect`;
    /// true when a message handler sits in the first argument slot
    pub(crate) protect_request: Option<bool>,

    /// Message handlers currently running; each grants extra depth
    pub(crate) handler_depth: u32,

    /// Registry slots handed out by `create_ref`
    pub(crate) refs: lua_ref::RefManager,
}

impl LuaVM {
    pub fn new(option: SafeOption) -> Self {
        let mut pool = ObjectPool::new();
        let mut gc = GarbageCollector::new(&option.gc);

        let mut main_header = gc.new_header();
        main_header.fixed = true;
        let main_thread = pool.threads.insert(LuaThread { state: None }, main_header);

        let registry_table = LuaTable::new(2, 4);
        let globals_table = LuaTable::new(0, 32);
        gc.account_alloc(registry_table.byte_size() + globals_table.byte_size());
        let registry = pool.tables.insert(registry_table, gc.new_header());
        let globals = pool.tables.insert(globals_table, gc.new_header());

        let mut state = Box::new(LuaState::new());
        state.status = CoroutineStatus::Running;
        // The main thread can never yield
        state.nny = 1;
        gc.account_alloc(state.byte_size());

        let mut vm = LuaVM {
            pool,
            gc,
            state,
            current_thread: main_thread,
            main_thread,
            resume_chain: Vec::new(),
            registry,
            globals,
            options: option,
            n_ccalls: 0,
            yield_values: Vec::new(),
            protect_request: None,
            handler_depth: 0,
            refs: lua_ref::RefManager::new(),
        };

        let registry_table = &mut vm.pool.tables[registry];
        registry_table.set_int(RIDX_MAINTHREAD, LuaValue::Thread(main_thread));
        registry_table.set_int(RIDX_GLOBALS, LuaValue::Table(globals));

        vm.gc.estimate = vm.gc.total_bytes;
        vm.gc.set_pause();
        if vm.options.gc.mode == GcModeOption::Generational {
            let params = vm.options.gc.generational;
            vm.set_generational(params);
        }
        vm
    }

    pub fn options(&self) -> &SafeOption {
        &self.options
    }

    // ===== Compilation and loading =====

    /// Compile source text into a chunk without touching the heap
    pub fn compile(&self, source: &str, chunk_name: &str) -> LuaResult<Chunk> {
        self.compile_bytes(source.as_bytes(), chunk_name)
    }

    pub fn compile_bytes(&self, source: &[u8], chunk_name: &str) -> LuaResult<Chunk> {
        let chunk = compiler::compile(source, chunk_name)?;
        tracing::debug!(chunk = chunk_name, instructions = chunk.code.len(), "compiled chunk");
        Ok(chunk)
    }

    /// Instantiate a chunk as a closure. The first upvalue, if any, is `_ENV`
    /// bound to the globals table; any others start as nil.
    pub fn load(&mut self, chunk: impl Into<Rc<Chunk>>) -> LuaValue {
        let env = LuaValue::Table(self.globals);
        self.load_with_env(chunk.into(), env)
    }

    pub(crate) fn load_with_env(&mut self, chunk: Rc<Chunk>, env: LuaValue) -> LuaValue {
        let proto = self.load_proto(chunk);
        let upvalues = (0..proto.chunk.upvalue_descs.len())
            .map(|i| {
                let value = if i == 0 { env } else { LuaValue::Nil };
                self.alloc_upvalue(LuaUpvalue::Closed(value))
            })
            .collect();
        let fid = self.alloc_function(LuaFunction::Lua(LuaClosure { proto, upvalues }));
        tracing::debug!("loaded chunk as closure {:?}", fid);
        LuaValue::Function(fid)
    }

    /// Intern the constants of a chunk tree
    pub(crate) fn load_proto(&mut self, chunk: Rc<Chunk>) -> Rc<Proto> {
        let constants = chunk
            .constants
            .iter()
            .map(|c| match c {
                Constant::Nil => LuaValue::Nil,
                Constant::Boolean(b) => LuaValue::Boolean(*b),
                Constant::Integer(i) => LuaValue::Integer(*i),
                Constant::Float(f) => LuaValue::Float(*f),
                Constant::String(bytes) => LuaValue::String(self.intern_bytes(bytes)),
            })
            .collect();
        let child_protos = chunk
            .child_protos
            .iter()
            .map(|c| self.load_proto(c.clone()))
            .collect();
        Rc::new(Proto {
            chunk,
            constants,
            child_protos,
            mark_epoch: std::cell::Cell::new(0),
        })
    }

    pub fn load_source(&mut self, source: &str, chunk_name: &str) -> LuaResult<LuaValue> {
        let chunk = self.compile(source, chunk_name)?;
        Ok(self.load(chunk))
    }

    /// Load a chunk previously produced by `dump`
    pub fn load_binary(&mut self, bytes: &[u8]) -> LuaResult<LuaValue> {
        let chunk = self.undump(bytes)?;
        Ok(self.load(chunk))
    }

    /// Compile and run a source string; the source doubles as chunk name
    pub fn execute(&mut self, source: &str) -> LuaResult<Vec<LuaValue>> {
        let f = self.load_source(source, source)?;
        self.call(f, &[])
    }

    /// Compile and run a source string under an explicit chunk name
    pub fn execute_named(&mut self, source: &str, chunk_name: &str) -> LuaResult<Vec<LuaValue>> {
        let f = self.load_source(source, chunk_name)?;
        self.call(f, &[])
    }

    // ===== Bytecode persistence =====

    pub fn dump(&self, chunk: &Chunk, strip: bool) -> Vec<u8> {
        chunk_serializer::dump(chunk, strip)
    }

    pub fn undump(&self, bytes: &[u8]) -> LuaResult<Chunk> {
        chunk_serializer::undump(bytes)
    }

    /// Chunk behind a Lua function value
    pub fn function_chunk(&self, f: &LuaValue) -> Option<Rc<Chunk>> {
        match f {
            LuaValue::Function(fid) => self
                .pool
                .functions
                .get(*fid)
                .and_then(LuaFunction::as_lua)
                .map(|c| c.proto.chunk.clone()),
            _ => None,
        }
    }

    // ===== Calls =====

    /// Call a function. On error the frames this call pushed are unwound
    /// (closing pending to-be-closed variables) before the error is returned,
    /// so a native catching it finds its own frame on top.
    pub fn call(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        self.check_handles(&f, args)?;
        let depth = self.state.call_infos.len();
        let top = self.state.top;
        match self.call_value(f, args) {
            Ok(results) => Ok(results),
            Err(e) if e.is_signal() => Err(e),
            Err(e) => {
                let e = self.attach_traceback(e);
                Err(self.unwind_to(depth, top, e))
            }
        }
    }

    /// Protected call: call depth and stack top are restored on error
    pub fn pcall(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        self.check_handles(&f, args)?;
        let depth = self.state.call_infos.len();
        let top = self.state.top;
        match self.call_value(f, args) {
            Ok(results) => Ok(results),
            Err(e) if e.is_signal() => Err(e),
            Err(e) => {
                let e = self.attach_traceback(e);
                Err(self.unwind_to(depth, top, e))
            }
        }
    }

    /// Protected call with a message handler that sees the error before
    /// the failing frames are removed
    pub fn pcall_with_handler(
        &mut self,
        f: LuaValue,
        args: &[LuaValue],
        handler: LuaValue,
    ) -> LuaResult<Vec<LuaValue>> {
        self.check_handles(&f, args)?;
        self.check_handle(&handler)?;
        let depth = self.state.call_infos.len();
        let top = self.state.top;
        match self.call_value(f, args) {
            Ok(results) => Ok(results),
            Err(e) if e.is_signal() => Err(e),
            Err(e) => {
                let mut e = self.attach_traceback(e);
                let value = self.error_value(&e);
                match self.call_message_handler(handler, value) {
                    Ok(handled) => {
                        if let LuaError::Runtime(rt) = &mut e {
                            rt.message = self.display_error_value(handled);
                            rt.value = handled;
                        }
                    }
                    Err(handler_error) => e = handler_error,
                }
                Err(self.unwind_to(depth, top, e))
            }
        }
    }

    /// Reject handles whose object has been collected
    pub(crate) fn check_handle(&mut self, v: &LuaValue) -> LuaResult<()> {
        if self.is_live(v) {
            Ok(())
        } else {
            Err(self.error_with_kind(
                RuntimeErrorKind::Type,
                format!("attempt to use a collected {} value", v.type_name()),
            ))
        }
    }

    pub(crate) fn check_handles(&mut self, f: &LuaValue, args: &[LuaValue]) -> LuaResult<()> {
        self.check_handle(f)?;
        args.iter().try_for_each(|a| self.check_handle(a))
    }

    // ===== Host functions =====

    pub fn register_function(&mut self, name: &str, f: CFunction) {
        self.set_global(name, LuaValue::CFunction(f));
    }

    pub fn register_closure<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut LuaVM) -> LuaResult<usize> + 'static,
    {
        let value = self.create_closure(f, Vec::new());
        self.set_global(name, value);
    }

    /// Host closure value; `upvalues` are traced by the collector and
    /// reachable through `LuaVM::closure_upvalue`
    pub fn create_closure<F>(&mut self, f: F, upvalues: Vec<LuaValue>) -> LuaValue
    where
        F: Fn(&mut LuaVM) -> LuaResult<usize> + 'static,
    {
        let fid = self.alloc_function(LuaFunction::Host(HostClosure {
            func: Rc::new(f),
            upvalues,
        }));
        LuaValue::Function(fid)
    }

    // ===== Object creation =====

    pub fn create_string(&mut self, s: &str) -> LuaValue {
        LuaValue::String(self.intern_bytes(s.as_bytes()))
    }

    pub fn create_bytes(&mut self, bytes: &[u8]) -> LuaValue {
        LuaValue::String(self.intern_bytes(bytes))
    }

    pub fn create_table(&mut self, narray: usize, nhash: usize) -> LuaValue {
        LuaValue::Table(self.alloc_table(LuaTable::new(narray, nhash)))
    }

    pub fn create_userdata<T: Any>(&mut self, data: T) -> LuaValue {
        let size = std::mem::size_of::<T>();
        LuaValue::Userdata(self.alloc_userdata(LuaUserdata::new(Box::new(data), size)))
    }

    pub fn userdata_ref<T: Any>(&self, v: &LuaValue) -> Option<&T> {
        match v {
            LuaValue::Userdata(id) => self.pool.userdata.get(*id)?.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn userdata_mut<T: Any>(&mut self, v: &LuaValue) -> Option<&mut T> {
        match v {
            LuaValue::Userdata(id) => self.pool.userdata.get_mut(*id)?.downcast_mut::<T>(),
            _ => None,
        }
    }

    // ===== Strings =====

    /// Bytes of a string value
    pub fn value_bytes(&self, v: &LuaValue) -> Option<&[u8]> {
        match v {
            LuaValue::String(id) => self.pool.strings.get(*id).map(|s| s.as_bytes()),
            _ => None,
        }
    }

    /// UTF-8 view of a string value
    pub fn value_str(&self, v: &LuaValue) -> Option<&str> {
        match v {
            LuaValue::String(id) => self.pool.strings.get(*id).and_then(|s| s.as_str()),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn string_bytes(&self, id: StringId) -> &[u8] {
        self.pool.strings[id].as_bytes()
    }

    // ===== Globals and registry =====

    pub fn globals(&self) -> LuaValue {
        LuaValue::Table(self.globals)
    }

    pub fn registry(&self) -> LuaValue {
        LuaValue::Table(self.registry)
    }

    pub fn get_global(&mut self, name: &str) -> LuaValue {
        let key = self.intern_bytes(name.as_bytes());
        self.pool.tables[self.globals].get_str(key)
    }

    /// Store a global. `value` must be a live handle.
    pub fn set_global(&mut self, name: &str, value: LuaValue) {
        let key = LuaValue::String(self.intern_bytes(name.as_bytes()));
        // String keys are never rejected
        let _ = self.table_raw_set(self.globals, key, value);
    }

    pub fn registry_get(&self, key: &LuaValue) -> LuaValue {
        self.pool.tables[self.registry].get(key)
    }

    pub fn registry_set(&mut self, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        self.table_raw_set(self.registry, key, value)
    }

    // ===== Raw access =====

    /// `t[key]` without metamethods; `None` unless `t` is a live table
    pub fn raw_get(&self, t: &LuaValue, key: &LuaValue) -> Option<LuaValue> {
        match t {
            LuaValue::Table(id) => self.pool.tables.get(*id).map(|t| t.get(key)),
            _ => None,
        }
    }

    pub fn raw_set(&mut self, t: &LuaValue, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        self.check_handles(t, &[key, value])?;
        match t {
            LuaValue::Table(id) => self.table_raw_set(*id, key, value),
            other => Err(self.error(format!("table expected, got {}", other.type_name()))),
        }
    }

    pub fn raw_len(&self, v: &LuaValue) -> Option<usize> {
        match v {
            LuaValue::Table(id) => self.pool.tables.get(*id).map(|t| t.len()),
            LuaValue::String(id) => self.pool.strings.get(*id).map(|s| s.len()),
            _ => None,
        }
    }

    /// Indexing with `__index`
    pub fn get_field(&mut self, t: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
        self.check_handles(&t, &[key])?;
        self.get_table_value(t, key, ValueSource::None)
    }

    /// Assignment with `__newindex`
    pub fn set_field(&mut self, t: LuaValue, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        self.check_handles(&t, &[key, value])?;
        self.set_table_value(t, key, value, ValueSource::None)
    }

    // ===== Metatables =====

    pub fn get_metatable(&self, v: &LuaValue) -> Option<TableId> {
        match v {
            LuaValue::Table(id) => self.pool.tables.get(*id)?.metatable,
            LuaValue::Userdata(id) => self.pool.userdata.get(*id)?.metatable,
            _ => None,
        }
    }

    /// Set (or clear) the metatable of a table or userdata. A `__gc` field
    /// present at this point registers the object for finalization.
    pub fn set_metatable(&mut self, v: &LuaValue, mt: Option<TableId>) -> LuaResult<()> {
        self.check_handle(v)?;
        if let Some(mt) = mt {
            self.check_handle(&LuaValue::Table(mt))?;
        }
        match v {
            LuaValue::Table(id) => {
                self.pool.tables[*id].metatable = mt;
                if let Some(mt) = mt {
                    self.object_barrier(v.gc_id(), LuaValue::Table(mt));
                }
            }
            LuaValue::Userdata(id) => {
                self.pool.userdata[*id].metatable = mt;
                if let Some(mt) = mt {
                    self.object_barrier(v.gc_id(), LuaValue::Table(mt));
                }
            }
            other => {
                return Err(self.error(format!(
                    "cannot set metatable of a {} value",
                    other.type_name()
                )));
            }
        }
        if let Some(mt) = mt {
            self.check_finalizer(v, mt);
        }
        Ok(())
    }

    // ===== Conversions =====

    /// `tostring` semantics, honoring `__tostring` and `__name`
    pub fn tostring(&mut self, v: LuaValue) -> LuaResult<String> {
        self.check_handle(&v)?;
        let s = self.tostring_value(v)?;
        Ok(self
            .value_bytes(&s)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default())
    }

    /// Render an error object for messages; non-strings get a placeholder
    pub(crate) fn display_error_value(&self, v: LuaValue) -> String {
        match v {
            LuaValue::String(id) => self.pool.strings[id].to_string_lossy(),
            LuaValue::Integer(_) | LuaValue::Float(_) => {
                crate::lua_value::fmt_number(&v).unwrap_or_default()
            }
            LuaValue::Nil => "nil".to_string(),
            other => format!("(error object is a {} value)", other.type_name()),
        }
    }

    /// The Lua-visible error object carried by an error
    pub fn error_value(&mut self, e: &LuaError) -> LuaValue {
        match e {
            LuaError::Runtime(rt) => rt.value,
            LuaError::Syntax { .. } | LuaError::BadBytecode(_) => {
                let msg = e.to_string();
                self.create_string(&msg)
            }
            LuaError::Yield | LuaError::Protect => LuaValue::Nil,
        }
    }
}

impl Drop for LuaVM {
    fn drop(&mut self) {
        // Objects still registered for finalization get their `__gc` call
        self.finalize_all();
    }
}
