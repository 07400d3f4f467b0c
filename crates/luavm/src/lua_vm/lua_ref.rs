/// Registry references (like luaL_ref/luaL_unref in the C API)
///
/// Values handed to the host are plain handles: they stay valid until Lua
/// code runs again or the host triggers a collection. A `LuaRef` stores the
/// value in the registry so it survives any number of cycles, until
/// `release_ref` drops it.
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, RIDX_GLOBALS};

/// Registry slot of a reference; slots below this belong to the VM
pub type RefId = i64;

const FIRST_REF: RefId = RIDX_GLOBALS + 1;

pub(crate) struct RefManager {
    next_ref_id: RefId,
    free_list: Vec<RefId>,
}

impl RefManager {
    pub fn new() -> Self {
        RefManager {
            next_ref_id: FIRST_REF,
            free_list: Vec::new(),
        }
    }

    fn alloc_ref_id(&mut self) -> RefId {
        match self.free_list.pop() {
            Some(id) => id,
            None => {
                let id = self.next_ref_id;
                self.next_ref_id += 1;
                id
            }
        }
    }

    fn free_ref_id(&mut self, id: RefId) {
        if id >= FIRST_REF && !self.free_list.contains(&id) {
            self.free_list.push(id);
        }
    }

    /// References currently held
    pub fn live_count(&self) -> usize {
        (self.next_ref_id - FIRST_REF) as usize - self.free_list.len()
    }
}

/// A value anchored for the host. Not `Clone`: each reference is released
/// exactly once.
#[derive(Debug)]
pub struct LuaRef {
    inner: LuaRefInner,
}

#[derive(Debug)]
enum LuaRefInner {
    /// Numbers, booleans, nil and light functions need no anchoring
    Direct(LuaValue),
    Registry(RefId),
}

impl LuaRef {
    /// Registry slot, for collectable values
    pub fn ref_id(&self) -> Option<RefId> {
        match self.inner {
            LuaRefInner::Registry(id) => Some(id),
            LuaRefInner::Direct(_) => None,
        }
    }
}

impl LuaVM {
    /// Anchor `value` in the registry
    pub fn create_ref(&mut self, value: LuaValue) -> LuaRef {
        if value.gc_id().is_none() {
            return LuaRef {
                inner: LuaRefInner::Direct(value),
            };
        }
        let id = self.refs.alloc_ref_id();
        // Integer keys are never rejected
        let _ = self.table_raw_set(self.registry, LuaValue::Integer(id), value);
        LuaRef {
            inner: LuaRefInner::Registry(id),
        }
    }

    pub fn get_ref(&self, r: &LuaRef) -> LuaValue {
        match r.inner {
            LuaRefInner::Direct(v) => v,
            LuaRefInner::Registry(id) => self.pool.tables[self.registry].get_int(id),
        }
    }

    /// Drop the anchor; the value becomes collectable again
    pub fn release_ref(&mut self, r: LuaRef) {
        if let LuaRefInner::Registry(id) = r.inner {
            self.pool.tables[self.registry].set_int(id, LuaValue::Nil);
            self.refs.free_ref_id(id);
        }
    }

    pub fn ref_count(&self) -> usize {
        self.refs.live_count()
    }

    /// False once the object behind a handle has been collected
    pub fn is_live(&self, v: &LuaValue) -> bool {
        match v.gc_id() {
            None => true,
            Some(id) => self.pool.header(id).is_some(),
        }
    }
}
