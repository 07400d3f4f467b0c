// Object Pool
//
// Key Design Principles:
// 1. All IDs are u32 indices into Vec storage
// 2. Each object kind has its own arena; a slot carries the GC header inline
// 3. Free list for slot reuse, so ids of swept objects get recycled
// 4. ALL strings are interned, so string equality is id equality

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use crate::gc::string_interner::StringInterner;
use crate::gc::{
    FunctionId, GcColor, GcHeader, GcId, GcType, StringId, TableId, ThreadId, UpvalueId, UserdataId,
};
use crate::lua_value::{LuaFunction, LuaString, LuaTable, LuaThread, LuaUpvalue, LuaUserdata};
use crate::lua_vm::TmKind;

pub trait ArenaId: Copy {
    fn from_raw(raw: u32) -> Self;
    fn raw(self) -> u32;
}

macro_rules! impl_arena_id {
    ($($name:ident),*) => {
        $(
            impl ArenaId for $name {
                #[inline(always)]
                fn from_raw(raw: u32) -> Self {
                    $name(raw)
                }

                #[inline(always)]
                fn raw(self) -> u32 {
                    self.0
                }
            }
        )*
    };
}

impl_arena_id!(StringId, TableId, FunctionId, UpvalueId, UserdataId, ThreadId);

pub struct GcBox<T> {
    pub header: GcHeader,
    pub value: T,
}

/// Slot storage for one object kind
pub struct Arena<I: ArenaId, T> {
    slots: Vec<Option<GcBox<T>>>,
    free_list: Vec<u32>,
    live: usize,
    _id: PhantomData<I>,
}

impl<I: ArenaId, T> Default for Arena<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ArenaId, T> Arena<I, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
            _id: PhantomData,
        }
    }

    pub fn insert(&mut self, value: T, header: GcHeader) -> I {
        self.live += 1;
        let boxed = GcBox { header, value };
        if let Some(free) = self.free_list.pop() {
            self.slots[free as usize] = Some(boxed);
            I::from_raw(free)
        } else {
            self.slots.push(Some(boxed));
            I::from_raw((self.slots.len() - 1) as u32)
        }
    }

    pub fn remove(&mut self, id: I) -> Option<T> {
        let slot = self.slots.get_mut(id.raw() as usize)?;
        let boxed = slot.take()?;
        self.live -= 1;
        self.free_list.push(id.raw());
        Some(boxed.value)
    }

    #[inline]
    pub fn get(&self, id: I) -> Option<&T> {
        self.slots
            .get(id.raw() as usize)
            .and_then(|s| s.as_ref())
            .map(|b| &b.value)
    }

    #[inline]
    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        self.slots
            .get_mut(id.raw() as usize)
            .and_then(|s| s.as_mut())
            .map(|b| &mut b.value)
    }

    #[inline]
    pub fn header(&self, id: I) -> Option<&GcHeader> {
        self.slots
            .get(id.raw() as usize)
            .and_then(|s| s.as_ref())
            .map(|b| &b.header)
    }

    #[inline]
    pub fn header_mut(&mut self, id: I) -> Option<&mut GcHeader> {
        self.slots
            .get_mut(id.raw() as usize)
            .and_then(|s| s.as_mut())
            .map(|b| &mut b.header)
    }

    #[inline]
    pub fn contains(&self, id: I) -> bool {
        self.get(id).is_some()
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of slots, live or free; the sweeper walks `0..slot_count()`
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = I> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| I::from_raw(i as u32))
    }

    pub fn headers_mut(&mut self) -> impl Iterator<Item = &mut GcHeader> + '_ {
        self.slots.iter_mut().flatten().map(|b| &mut b.header)
    }
}

impl<I: ArenaId, T> Index<I> for Arena<I, T> {
    type Output = T;

    #[inline]
    fn index(&self, id: I) -> &T {
        match self.get(id) {
            Some(v) => v,
            None => panic!("dangling object id {}", id.raw()),
        }
    }
}

impl<I: ArenaId, T> IndexMut<I> for Arena<I, T> {
    #[inline]
    fn index_mut(&mut self, id: I) -> &mut T {
        match self.get_mut(id) {
            Some(v) => v,
            None => panic!("dangling object id {}", id.raw()),
        }
    }
}

/// All heap objects of one VM
pub struct ObjectPool {
    pub strings: Arena<StringId, LuaString>,
    pub tables: Arena<TableId, LuaTable>,
    pub functions: Arena<FunctionId, LuaFunction>,
    pub upvalues: Arena<UpvalueId, LuaUpvalue>,
    pub userdata: Arena<UserdataId, LuaUserdata>,
    pub threads: Arena<ThreadId, LuaThread>,
    interner: StringInterner,
    // Pre-cached metamethod names, indexed by TmKind
    tm_names: Vec<StringId>,
}

impl ObjectPool {
    pub fn new() -> Self {
        let mut pool = Self {
            strings: Arena::new(),
            tables: Arena::new(),
            functions: Arena::new(),
            upvalues: Arena::new(),
            userdata: Arena::new(),
            threads: Arena::new(),
            interner: StringInterner::new(),
            tm_names: Vec::with_capacity(TmKind::ALL.len()),
        };

        // Metamethod names are created white and fixed, they are never collected
        for tm in TmKind::ALL {
            let mut header = GcHeader::new(GcColor::White0);
            header.fixed = true;
            let (id, _) = pool.intern(tm.name().as_bytes(), header);
            pool.tm_names.push(id);
        }
        pool
    }

    #[inline]
    pub fn tm_name(&self, tm: TmKind) -> StringId {
        self.tm_names[tm as usize]
    }

    /// Intern a byte string; returns the id and whether a new object was created.
    /// A hit on a white string is repainted with the header's white so the
    /// sweeper cannot reclaim a string that is in use again.
    pub fn intern(&mut self, bytes: &[u8], header: GcHeader) -> (StringId, bool) {
        let hash = self.interner.hash_bytes(bytes);
        if let Some(id) = self.interner.find(hash, bytes, &self.strings) {
            if let Some(h) = self.strings.header_mut(id) {
                if h.is_white() && header.is_white() {
                    h.color = header.color;
                }
            }
            return (id, false);
        }
        let id = self.strings.insert(LuaString::new(bytes.into(), hash), header);
        self.interner.insert(hash, id);
        (id, true)
    }

    /// Lookup without creating
    pub fn find_string(&self, bytes: &[u8]) -> Option<StringId> {
        let hash = self.interner.hash_bytes(bytes);
        self.interner.find(hash, bytes, &self.strings)
    }

    /// Drop a string from the arena and the intern table
    pub fn free_string(&mut self, id: StringId) -> Option<LuaString> {
        let s = self.strings.remove(id)?;
        self.interner.remove(s.hash(), id);
        Some(s)
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    /// Header of any live object
    pub fn header(&self, id: GcId) -> Option<&GcHeader> {
        match id {
            GcId::StringId(i) => self.strings.header(i),
            GcId::TableId(i) => self.tables.header(i),
            GcId::FunctionId(i) => self.functions.header(i),
            GcId::UpvalueId(i) => self.upvalues.header(i),
            GcId::UserdataId(i) => self.userdata.header(i),
            GcId::ThreadId(i) => self.threads.header(i),
        }
    }

    pub fn header_mut(&mut self, id: GcId) -> Option<&mut GcHeader> {
        match id {
            GcId::StringId(i) => self.strings.header_mut(i),
            GcId::TableId(i) => self.tables.header_mut(i),
            GcId::FunctionId(i) => self.functions.header_mut(i),
            GcId::UpvalueId(i) => self.upvalues.header_mut(i),
            GcId::UserdataId(i) => self.userdata.header_mut(i),
            GcId::ThreadId(i) => self.threads.header_mut(i),
        }
    }

    /// Slots of the arena holding objects of type `ty`
    pub fn slot_count(&self, ty: GcType) -> usize {
        match ty {
            GcType::String => self.strings.slot_count(),
            GcType::Table => self.tables.slot_count(),
            GcType::Function => self.functions.slot_count(),
            GcType::Upvalue => self.upvalues.slot_count(),
            GcType::Userdata => self.userdata.slot_count(),
            GcType::Thread => self.threads.slot_count(),
        }
    }

    /// Apply `f` to the header of every live object
    pub fn for_each_header(&mut self, mut f: impl FnMut(&mut GcHeader)) {
        self.strings.headers_mut().for_each(&mut f);
        self.tables.headers_mut().for_each(&mut f);
        self.functions.headers_mut().for_each(&mut f);
        self.upvalues.headers_mut().for_each(&mut f);
        self.userdata.headers_mut().for_each(&mut f);
        self.threads.headers_mut().for_each(&mut f);
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}
