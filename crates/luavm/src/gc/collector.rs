// Collector algorithms as `LuaVM` methods: they need the object pool, the
// running state and the parked coroutine states together.
//
// Marking pushes gray objects on `gc.gray`; `traverse` blackens one gray
// object and marks what it references. Threads are re-traversed in the
// atomic phase since stack writes carry no barrier.

use std::mem;
use std::rc::Rc;

use crate::gc::{
    FINALIZERS_PER_STEP, FunctionId, GcAge, GcColor, GcId, GcMode, GcState, GcType,
    GenerationalParams, IncrementalParams, SWEEP_UNIT, StringId, TableId, ThreadId, UpvalueId,
    UserdataId, WORK2MEM,
};
use crate::lua_value::{LuaFunction, LuaTable, LuaThread, LuaUpvalue, LuaUserdata, LuaValue, Proto};
use crate::lua_vm::{LuaResult, LuaState, LuaVM, TmKind};

/// Weakness declared by a table's `__mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WeakMode {
    Strong,
    Values,
    Keys,
    All,
}

impl LuaVM {
    // ===== Allocation =====

    fn register_object(&mut self, id: GcId, size: usize) {
        self.gc.account_alloc(size);
        if self.gc.mode == GcMode::Generational {
            self.gc.young.push(id);
        }
    }

    /// Intern a byte string, reviving it if the sweeper has not reached it yet
    pub(crate) fn intern_bytes(&mut self, bytes: &[u8]) -> StringId {
        let header = self.gc.new_header();
        let (id, created) = self.pool.intern(bytes, header);
        if created {
            let size = self.pool.strings[id].byte_size();
            self.register_object(GcId::StringId(id), size);
        }
        id
    }

    pub(crate) fn alloc_table(&mut self, table: LuaTable) -> TableId {
        let size = table.byte_size();
        let id = self.pool.tables.insert(table, self.gc.new_header());
        self.register_object(GcId::TableId(id), size);
        id
    }

    pub(crate) fn alloc_function(&mut self, f: LuaFunction) -> FunctionId {
        let size = f.byte_size();
        let id = self.pool.functions.insert(f, self.gc.new_header());
        self.register_object(GcId::FunctionId(id), size);
        id
    }

    pub(crate) fn alloc_upvalue(&mut self, uv: LuaUpvalue) -> UpvalueId {
        let id = self.pool.upvalues.insert(uv, self.gc.new_header());
        self.register_object(GcId::UpvalueId(id), mem::size_of::<LuaUpvalue>());
        id
    }

    pub(crate) fn alloc_userdata(&mut self, ud: LuaUserdata) -> UserdataId {
        let size = mem::size_of::<LuaUserdata>() + ud.size_hint;
        let id = self.pool.userdata.insert(ud, self.gc.new_header());
        self.register_object(GcId::UserdataId(id), size);
        id
    }

    pub(crate) fn alloc_thread(&mut self, thread: LuaThread) -> ThreadId {
        let size = thread.byte_size();
        let id = self.pool.threads.insert(thread, self.gc.new_header());
        self.register_object(GcId::ThreadId(id), size);
        id
    }

    fn free_object(&mut self, id: GcId) {
        let size = match id {
            GcId::StringId(s) => self.pool.free_string(s).map(|s| s.byte_size()),
            GcId::TableId(t) => self.pool.tables.remove(t).map(|t| t.byte_size()),
            GcId::FunctionId(f) => self.pool.functions.remove(f).map(|f| f.byte_size()),
            GcId::UpvalueId(u) => self
                .pool
                .upvalues
                .remove(u)
                .map(|_| mem::size_of::<LuaUpvalue>()),
            GcId::UserdataId(u) => self
                .pool
                .userdata
                .remove(u)
                .map(|u| mem::size_of::<LuaUserdata>() + u.size_hint),
            GcId::ThreadId(t) => self.pool.threads.remove(t).map(|t| t.byte_size()),
        };
        if let Some(size) = size {
            self.gc.account_free(size);
        }
    }

    // ===== Barriers =====

    /// Forward barrier: black `parent` now references `child`
    pub(crate) fn object_barrier(&mut self, parent: Option<GcId>, child: LuaValue) {
        let (Some(parent), Some(child)) = (parent, child.gc_id()) else {
            return;
        };
        let Some(p) = self.pool.header(parent) else {
            return;
        };
        if !p.is_black() {
            return;
        }
        let parent_old = p.age.is_old();
        if !self.pool.header(child).is_some_and(|h| h.is_white()) {
            return;
        }
        if self.gc.keep_invariant() {
            self.mark_object(child);
            if self.gc.mode == GcMode::Generational && parent_old {
                if let Some(h) = self.pool.header_mut(child) {
                    h.age = GcAge::Old0;
                }
            }
        } else if let Some(p) = self.pool.header_mut(parent) {
            // Sweeping: the parent turns white instead of marking the child
            p.color = self.gc.current_white;
        }
    }

    /// Back barrier: a black table was written; traverse it again
    pub(crate) fn table_barrier(&mut self, id: TableId) {
        let generational = self.gc.mode == GcMode::Generational;
        let Some(h) = self.pool.tables.header_mut(id) else {
            return;
        };
        if !h.is_black() {
            return;
        }
        h.color = GcColor::Gray;
        if generational && h.age.is_old() {
            match h.age {
                GcAge::Touched1 => {}
                GcAge::Touched2 => h.age = GcAge::Touched1,
                _ => {
                    h.age = GcAge::Touched1;
                    self.gc.touched.push(GcId::TableId(id));
                }
            }
        } else {
            self.gc.grayagain.push(GcId::TableId(id));
        }
    }

    /// Register `v` for finalization when its new metatable has `__gc`
    pub(crate) fn check_finalizer(&mut self, v: &LuaValue, mt: TableId) {
        let Some(id) = v.gc_id() else {
            return;
        };
        if self.raw_tm(mt, TmKind::Gc).is_nil() {
            return;
        }
        let Some(h) = self.pool.header_mut(id) else {
            return;
        };
        if h.finalizable || h.finalized {
            return;
        }
        h.finalizable = true;
        self.gc.finobj.push(id);
    }

    // ===== Marking =====

    fn mark_object(&mut self, id: GcId) {
        let Some(h) = self.pool.header_mut(id) else {
            return;
        };
        if !h.is_white() {
            return;
        }
        if matches!(id, GcId::StringId(_)) {
            h.color = GcColor::Black;
        } else {
            h.color = GcColor::Gray;
            self.gc.gray.push(id);
        }
    }

    #[inline]
    fn mark_value(&mut self, v: LuaValue) {
        if let Some(id) = v.gc_id() {
            self.mark_object(id);
        }
    }

    fn mark_values(&mut self, values: Vec<LuaValue>) -> usize {
        let n = values.len();
        for v in values {
            self.mark_value(v);
        }
        n
    }

    #[inline]
    fn is_marked(&self, v: &LuaValue) -> bool {
        match v.gc_id() {
            None => true,
            Some(id) => self.pool.header(id).is_some_and(|h| !h.is_white()),
        }
    }

    /// Reachable for weak-table purposes; strings count as values
    fn is_alive_value(&self, v: &LuaValue) -> bool {
        match v.gc_id() {
            None | Some(GcId::StringId(_)) => true,
            Some(id) => self.pool.header(id).is_some_and(|h| !h.is_white()),
        }
    }

    fn mark_roots(&mut self) {
        self.mark_object(GcId::TableId(self.registry));
        self.mark_object(GcId::TableId(self.globals));
        self.mark_object(GcId::ThreadId(self.main_thread));
        self.mark_object(GcId::ThreadId(self.current_thread));
        for tid in self.resume_chain.clone() {
            self.mark_object(GcId::ThreadId(tid));
        }
        let pending = self.yield_values.clone();
        self.mark_values(pending);
        for id in self.gc.tobefnz.clone() {
            self.mark_object(id);
        }
    }

    fn propagate_one(&mut self) -> usize {
        match self.gc.gray.pop() {
            Some(id) => self.traverse(id),
            None => 0,
        }
    }

    fn propagate_all(&mut self) {
        while !self.gc.gray.is_empty() {
            self.propagate_one();
        }
    }

    /// Blacken a gray object; returns the work done
    fn traverse(&mut self, id: GcId) -> usize {
        match self.pool.header_mut(id) {
            Some(h) => h.color = GcColor::Black,
            None => return 0,
        }
        match id {
            GcId::StringId(_) => 1,
            GcId::TableId(t) => self.traverse_table(t),
            GcId::FunctionId(f) => self.traverse_function(f),
            GcId::UpvalueId(u) => match self.pool.upvalues[u] {
                LuaUpvalue::Closed(v) => {
                    self.mark_value(v);
                    1
                }
                LuaUpvalue::Open { thread, .. } => {
                    self.mark_object(GcId::ThreadId(thread));
                    1
                }
            },
            GcId::UserdataId(u) => {
                let ud = &self.pool.userdata[u];
                let mut refs = vec![ud.user_value];
                if let Some(mt) = ud.metatable {
                    refs.push(LuaValue::Table(mt));
                }
                1 + self.mark_values(refs)
            }
            GcId::ThreadId(t) => {
                if self.gc.state == GcState::Propagate && !self.gc.in_minor {
                    self.gc.grayagain.push(id);
                }
                self.traverse_thread(t)
            }
        }
    }

    fn weak_mode(&self, table: &LuaTable) -> WeakMode {
        let Some(mt) = table.metatable else {
            return WeakMode::Strong;
        };
        let LuaValue::String(mode) = self.raw_tm(mt, TmKind::Mode) else {
            return WeakMode::Strong;
        };
        let bytes = self.pool.strings[mode].as_bytes();
        match (bytes.contains(&b'k'), bytes.contains(&b'v')) {
            (false, false) => WeakMode::Strong,
            (false, true) => WeakMode::Values,
            (true, false) => WeakMode::Keys,
            (true, true) => WeakMode::All,
        }
    }

    fn traverse_table(&mut self, id: TableId) -> usize {
        let table = &self.pool.tables[id];
        // Minor collections keep every entry alive
        let mode = if self.gc.in_minor {
            WeakMode::Strong
        } else {
            self.weak_mode(table)
        };
        let mut refs = Vec::with_capacity(table.array_len() + 2 * table.hash_len() + 1);
        if let Some(mt) = table.metatable {
            refs.push(LuaValue::Table(mt));
        }
        match mode {
            WeakMode::Strong => {
                refs.extend(table.array_values().iter().copied());
                for (k, v) in table.entries() {
                    refs.push(k);
                    refs.push(v);
                }
            }
            WeakMode::Values => {
                for (k, v) in table.entries() {
                    refs.push(k);
                    if v.is_string() {
                        refs.push(v);
                    }
                }
                refs.extend(table.array_values().iter().filter(|v| v.is_string()).copied());
            }
            WeakMode::Keys => {
                refs.extend(table.array_values().iter().copied());
                for (k, v) in table.entries() {
                    if self.is_alive_value(&k) {
                        refs.push(k);
                        refs.push(v);
                    }
                }
            }
            WeakMode::All => {
                for (k, v) in table.entries() {
                    if k.is_string() {
                        refs.push(k);
                    }
                    if v.is_string() {
                        refs.push(v);
                    }
                }
                refs.extend(table.array_values().iter().filter(|v| v.is_string()).copied());
            }
        }
        match mode {
            WeakMode::Strong => {}
            WeakMode::Values => self.gc.weak.push(id),
            WeakMode::Keys => self.gc.ephemeron.push(id),
            WeakMode::All => self.gc.allweak.push(id),
        }
        1 + self.mark_values(refs)
    }

    fn collect_proto_constants(&self, proto: &Rc<Proto>, out: &mut Vec<LuaValue>) {
        if proto.mark_epoch.get() == self.gc.proto_epoch {
            return;
        }
        proto.mark_epoch.set(self.gc.proto_epoch);
        out.extend(proto.constants.iter().filter(|v| v.is_string()).copied());
        for child in &proto.child_protos {
            self.collect_proto_constants(child, out);
        }
    }

    fn traverse_function(&mut self, id: FunctionId) -> usize {
        let mut refs = Vec::new();
        let mut cells = Vec::new();
        match &self.pool.functions[id] {
            LuaFunction::Lua(c) => {
                cells.extend_from_slice(&c.upvalues);
                self.collect_proto_constants(&c.proto, &mut refs);
            }
            LuaFunction::Host(h) => refs.extend(h.upvalues.iter().copied()),
        }
        let work = 1 + cells.len();
        for uid in cells {
            self.mark_object(GcId::UpvalueId(uid));
        }
        work + self.mark_values(refs)
    }

    fn thread_state(&self, tid: ThreadId) -> Option<&LuaState> {
        if tid == self.current_thread {
            Some(&self.state)
        } else {
            self.pool.threads.get(tid)?.state.as_deref()
        }
    }

    fn traverse_thread(&mut self, tid: ThreadId) -> usize {
        let Some(state) = self.thread_state(tid) else {
            return 1;
        };
        let live = state.live_top();
        let mut refs: Vec<LuaValue> = state.stack[..live].to_vec();
        if let Some(err) = state.error_value {
            refs.push(err);
        }
        let upvalues = state.open_upvalues.clone();
        for uid in upvalues {
            self.mark_object(GcId::UpvalueId(uid));
        }
        1 + self.mark_values(refs)
    }

    /// Nil out stack slots above the live part of every thread
    fn clear_dead_stack_parts(&mut self) {
        let live = self.state.live_top();
        self.state.stack[live..].fill(LuaValue::Nil);
        for tid in self.pool.threads.ids().collect::<Vec<_>>() {
            if let Some(state) = self.pool.threads[tid].state.as_deref_mut() {
                let live = state.live_top();
                state.stack[live..].fill(LuaValue::Nil);
            }
        }
    }

    // ===== Weak tables =====

    /// Mark values whose ephemeron keys became reachable until nothing changes
    fn converge_ephemerons(&mut self) {
        loop {
            let mut newly = Vec::new();
            for &t in &self.gc.ephemeron {
                let Some(table) = self.pool.tables.get(t) else {
                    continue;
                };
                for (k, v) in table.entries() {
                    if self.is_alive_value(&k) && !self.is_marked(&v) {
                        newly.push(v);
                    }
                }
            }
            if newly.is_empty() {
                break;
            }
            self.mark_values(newly);
            self.propagate_all();
        }
    }

    fn clear_by_values(&mut self) {
        let lists: Vec<TableId> = self.gc.weak.iter().chain(self.gc.allweak.iter()).copied().collect();
        for t in lists {
            let Some(table) = self.pool.tables.get(t) else {
                continue;
            };
            let mut dead: Vec<LuaValue> = table
                .entries()
                .filter(|(_, v)| !self.is_alive_value(v))
                .map(|(k, _)| k)
                .collect();
            dead.extend(
                table
                    .array_values()
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| !self.is_alive_value(v))
                    .map(|(i, _)| LuaValue::Integer(i as i64 + 1)),
            );
            let table = &mut self.pool.tables[t];
            for k in dead {
                let _ = table.set(k, LuaValue::Nil);
            }
        }
    }

    fn clear_by_keys(&mut self) {
        let lists: Vec<TableId> = self
            .gc
            .ephemeron
            .iter()
            .chain(self.gc.allweak.iter())
            .copied()
            .collect();
        for t in lists {
            let Some(table) = self.pool.tables.get(t) else {
                continue;
            };
            let dead: Vec<LuaValue> = table
                .entries()
                .map(|(k, _)| k)
                .filter(|k| !self.is_alive_value(k))
                .collect();
            let table = &mut self.pool.tables[t];
            for k in dead {
                let _ = table.set(k, LuaValue::Nil);
            }
        }
    }

    // ===== Finalizers =====

    /// Move unreachable (or, with `all`, every) finalizable object to `tobefnz`
    fn separate_tobefnz(&mut self, all: bool) {
        let finobj = mem::take(&mut self.gc.finobj);
        for id in finobj {
            let Some(h) = self.pool.header(id) else {
                continue;
            };
            if all || h.is_white() {
                self.gc.tobefnz.push(id);
            } else {
                self.gc.finobj.push(id);
            }
        }
    }

    fn mark_being_finalized(&mut self) {
        for id in self.gc.tobefnz.clone() {
            self.mark_object(id);
        }
        self.propagate_all();
    }

    /// Run one pending finalizer; false when none is left
    fn call_one_finalizer(&mut self) -> bool {
        if self.gc.tobefnz.is_empty() {
            return false;
        }
        let id = self.gc.tobefnz.remove(0);
        let value = match id {
            GcId::TableId(t) => LuaValue::Table(t),
            GcId::UserdataId(u) => LuaValue::Userdata(u),
            _ => return true,
        };
        if let Some(h) = self.pool.header_mut(id) {
            h.finalizable = false;
            h.finalized = true;
        }
        let tm = self.get_metamethod(&value, TmKind::Gc);
        if !tm.is_function() {
            return true;
        }

        let saved_stopem = mem::replace(&mut self.gc.stopem, true);
        let saved_top = self.state.top;
        let level = self.frame_top();
        let depth = self.state.call_infos.len();
        if let Err(e) = self.call_value(tm, &[value]) {
            let e = self.unwind_to(depth, level, e);
            tracing::warn!(error = %e, "error in __gc metamethod");
        }
        self.state.top = saved_top;
        self.gc.stopem = saved_stopem;
        true
    }

    fn call_all_finalizers(&mut self) {
        while self.call_one_finalizer() {}
    }

    // ===== Incremental cycle =====

    fn restart_collection(&mut self) {
        self.gc.gray.clear();
        self.gc.grayagain.clear();
        self.gc.weak.clear();
        self.gc.ephemeron.clear();
        self.gc.allweak.clear();
        self.gc.proto_epoch = self.gc.proto_epoch.wrapping_add(1);
        self.mark_roots();
    }

    fn atomic(&mut self) {
        self.gc.state = GcState::Atomic;
        self.mark_roots();
        self.propagate_all();
        for id in mem::take(&mut self.gc.grayagain) {
            if let Some(h) = self.pool.header_mut(id) {
                h.color = GcColor::Gray;
                self.gc.gray.push(id);
            }
        }
        self.propagate_all();
        self.converge_ephemerons();
        // Weak values of objects about to be resurrected are cleared first
        self.clear_by_values();

        self.separate_tobefnz(false);
        self.mark_being_finalized();
        self.converge_ephemerons();
        self.clear_by_keys();
        self.clear_by_values();

        self.clear_dead_stack_parts();
        self.gc.current_white = self.gc.current_white.other_white();
        self.gc.state = GcState::Sweep;
        self.gc.sweep_type = 0;
        self.gc.sweep_index = 0;
        self.gc.sweep_survivors = 0;
    }

    /// Free `id` if dead; otherwise reset it for the next cycle
    fn sweep_object(&mut self, id: GcId, to_old: bool) {
        let white = self.gc.current_white;
        let Some(h) = self.pool.header_mut(id) else {
            return;
        };
        if h.color == white.other_white() && !h.fixed {
            self.free_object(id);
            return;
        }
        if to_old {
            h.color = GcColor::Black;
            h.age = GcAge::Old;
        } else {
            h.color = white;
        }
        self.gc.sweep_survivors += 1;
    }

    /// Sweep up to `budget` slots; true once every arena is done
    fn sweep_step(&mut self, budget: usize, to_old: bool) -> bool {
        let mut work = 0;
        while self.gc.sweep_type < GcType::ALL.len() {
            let ty = GcType::ALL[self.gc.sweep_type];
            let count = self.pool.slot_count(ty);
            while (self.gc.sweep_index as usize) < count && work < budget {
                let id = GcId::from_parts(ty, self.gc.sweep_index);
                self.sweep_object(id, to_old);
                self.gc.sweep_index += 1;
                work += 1;
            }
            if (self.gc.sweep_index as usize) < count {
                return false;
            }
            self.gc.sweep_type += 1;
            self.gc.sweep_index = 0;
        }
        true
    }

    /// One unit of incremental work; returns the work done
    fn single_step(&mut self) -> usize {
        match self.gc.state {
            GcState::Pause => {
                tracing::debug!(total = self.gc.total_bytes, "gc cycle started");
                self.restart_collection();
                self.gc.state = GcState::Propagate;
                1
            }
            GcState::Propagate => {
                if self.gc.gray.is_empty() {
                    self.gc.state = GcState::Atomic;
                    0
                } else {
                    self.propagate_one()
                }
            }
            GcState::Atomic => {
                self.atomic();
                1
            }
            GcState::Sweep => {
                if self.sweep_step(SWEEP_UNIT, false) {
                    self.gc.state = GcState::CallFin;
                }
                SWEEP_UNIT
            }
            GcState::CallFin => {
                let mut n = 0;
                while n < FINALIZERS_PER_STEP && self.call_one_finalizer() {
                    n += 1;
                }
                if self.gc.tobefnz.is_empty() {
                    self.gc.state = GcState::Pause;
                    self.gc.estimate = self.gc.total_bytes;
                    tracing::debug!(
                        total = self.gc.total_bytes,
                        survivors = self.gc.sweep_survivors,
                        "gc cycle finished"
                    );
                }
                n.max(1) * WORK2MEM
            }
        }
    }

    /// Pay off the allocation debt with marking/sweeping work; true when a
    /// cycle completed
    fn incremental_step(&mut self) -> bool {
        let params = self.gc.inc_params;
        let debt = self.gc.debt.max(0) as usize;
        let budget = ((debt + params.step_size) / WORK2MEM)
            .saturating_mul(params.step_mul.max(1) as usize)
            / 100;
        let budget = budget.max(SWEEP_UNIT);
        tracing::trace!(budget, state = ?self.gc.state, "gc step");

        let mut done = 0;
        let mut finished = false;
        loop {
            done += self.single_step();
            if self.gc.state == GcState::Pause {
                finished = true;
                break;
            }
            if done >= budget {
                break;
            }
        }
        if finished {
            self.gc.set_pause();
        } else {
            self.gc.debt = -(params.step_size as isize);
        }
        finished
    }

    // ===== Full and generational collections =====

    /// Stop-the-world mark & sweep of the whole heap. With `to_old`, every
    /// survivor becomes old and black, which is the generational baseline.
    fn full_mark_sweep(&mut self, to_old: bool) {
        let white = self.gc.current_white;
        self.pool.for_each_header(|h| h.color = white);
        self.gc.touched.clear();
        self.gc.old1.clear();
        self.gc.young.clear();
        self.restart_collection();
        self.gc.state = GcState::Propagate;
        self.propagate_all();
        self.atomic();
        while !self.sweep_step(usize::MAX, to_old) {}
        self.gc.estimate = self.gc.total_bytes;
        if to_old {
            self.gc.major_base = self.gc.total_bytes;
        }
    }

    /// Minor collection: only young objects, plus old objects that may
    /// point to them, are traversed; weak tables behave as strong
    fn young_collection(&mut self) {
        self.gc.state = GcState::Propagate;
        self.gc.in_minor = true;
        self.gc.proto_epoch = self.gc.proto_epoch.wrapping_add(1);
        self.gc.weak.clear();
        self.gc.ephemeron.clear();
        self.gc.allweak.clear();

        let old1 = mem::take(&mut self.gc.old1);
        let retrace: Vec<GcId> = old1
            .iter()
            .chain(self.gc.touched.iter())
            .chain(self.gc.grayagain.iter())
            .copied()
            .collect();
        self.gc.grayagain.clear();
        for id in retrace {
            if let Some(h) = self.pool.header_mut(id) {
                h.color = GcColor::Gray;
                self.gc.gray.push(id);
            }
        }

        self.mark_roots();
        // Old threads are not barriered, so every stack is a root here
        for tid in self.pool.threads.ids().collect::<Vec<_>>() {
            self.traverse_thread(tid);
        }
        self.propagate_all();

        // Unreachable young objects with finalizers
        let finobj = mem::take(&mut self.gc.finobj);
        for id in finobj {
            match self.pool.header(id) {
                Some(h) if h.is_white() => self.gc.tobefnz.push(id),
                Some(_) => self.gc.finobj.push(id),
                None => {}
            }
        }
        self.mark_being_finalized();
        self.gc.in_minor = false;
        self.clear_dead_stack_parts();

        self.sweep_young(old1);
    }

    fn sweep_young(&mut self, old1: Vec<GcId>) {
        let white = self.gc.current_white;
        let mut young = Vec::new();
        let mut new_old1 = Vec::new();
        for id in mem::take(&mut self.gc.young) {
            let Some(h) = self.pool.header_mut(id) else {
                continue;
            };
            if h.fixed {
                continue;
            }
            if h.is_white() {
                self.free_object(id);
                continue;
            }
            match h.age {
                GcAge::New => {
                    h.age = GcAge::Survival;
                    h.color = white;
                    young.push(id);
                }
                GcAge::Survival | GcAge::Old0 => {
                    h.age = GcAge::Old1;
                    h.color = GcColor::Black;
                    new_old1.push(id);
                }
                _ => {}
            }
        }
        for id in old1 {
            if let Some(h) = self.pool.header_mut(id) {
                if h.age == GcAge::Old1 {
                    h.age = GcAge::Old;
                }
            }
        }
        let mut touched = Vec::new();
        for id in mem::take(&mut self.gc.touched) {
            if let Some(h) = self.pool.header_mut(id) {
                match h.age {
                    GcAge::Touched1 => {
                        h.age = GcAge::Touched2;
                        touched.push(id);
                    }
                    GcAge::Touched2 => h.age = GcAge::Old,
                    _ => {}
                }
            }
        }
        self.gc.young = young;
        self.gc.old1 = new_old1;
        self.gc.touched = touched;
    }

    /// One generational step: a major collection once the heap grew past
    /// `major_mul` percent of its size after the last major, a minor one otherwise
    fn generational_step(&mut self) {
        let base = self.gc.major_base.max(1);
        let limit = base + (base / 100).saturating_mul(self.gc.gen_params.major_mul as usize);
        if self.gc.total_bytes > limit {
            tracing::debug!(total = self.gc.total_bytes, base, "major collection");
            self.full_mark_sweep(true);
            self.gc.state = GcState::Propagate;
        } else {
            let before = self.gc.total_bytes;
            self.young_collection();
            tracing::debug!(before, after = self.gc.total_bytes, "minor collection");
        }
        self.gc.set_minor_debt();
        self.call_all_finalizers();
    }

    // ===== Entry points =====

    /// Safe-point check: run a step when the allocation debt is positive
    pub(crate) fn gc_check(&mut self) -> LuaResult<()> {
        self.apply_pending_mode();
        if self.gc.debt > 0 && !self.gc.stopped && !self.gc.stopem {
            self.gc_step_now();
        }
        Ok(())
    }

    fn gc_step_now(&mut self) -> bool {
        match self.gc.mode {
            GcMode::Incremental => {
                self.gc.stopem = true;
                let finished = self.incremental_step();
                self.gc.stopem = false;
                finished
            }
            GcMode::Generational => {
                self.generational_step();
                true
            }
        }
    }

    /// Explicit step. With `kb > 0` the collector acts as if `kb` kilobytes
    /// were allocated. Returns true when a cycle finished.
    pub fn collect_step(&mut self, kb: usize) -> bool {
        if self.gc.stopem {
            return false;
        }
        self.apply_pending_mode();
        if kb == 0 {
            self.gc.debt = self.gc.debt.max(1);
        } else {
            self.gc.debt = self.gc.debt.max(0) + (kb as isize) * 1024;
        }
        self.gc_step_now()
    }

    /// Complete collection of the whole heap, finalizers included
    pub fn collect_full(&mut self) {
        if self.gc.stopem {
            return;
        }
        self.apply_pending_mode();
        self.gc.stopem = true;
        match self.gc.mode {
            GcMode::Incremental => {
                self.finish_cycle_quietly();
                self.full_mark_sweep(false);
                self.gc.state = GcState::Pause;
                self.gc.stopem = false;
                self.call_all_finalizers();
                self.gc.set_pause();
            }
            GcMode::Generational => {
                self.full_mark_sweep(true);
                self.gc.state = GcState::Propagate;
                self.gc.stopem = false;
                self.call_all_finalizers();
                self.gc.set_minor_debt();
            }
        }
        tracing::debug!(total = self.gc.total_bytes, "full collection");
    }

    /// Finish a pending incremental cycle, leaving finalizers queued
    fn finish_cycle_quietly(&mut self) {
        if self.gc.state == GcState::Pause {
            return;
        }
        while !matches!(self.gc.state, GcState::CallFin | GcState::Pause) {
            self.single_step();
        }
        self.gc.state = GcState::Pause;
    }

    /// Switch to incremental mode; returns the previous mode
    pub fn set_incremental(&mut self, params: IncrementalParams) -> GcMode {
        let previous = self.gc.mode;
        self.gc.inc_params = params;
        self.gc.pending_generational = false;
        if previous == GcMode::Generational {
            let white = self.gc.current_white;
            self.pool.for_each_header(|h| {
                h.color = white;
                h.age = GcAge::New;
            });
            self.gc.young.clear();
            self.gc.old1.clear();
            self.gc.touched.clear();
            self.gc.gray.clear();
            self.gc.grayagain.clear();
            self.gc.mode = GcMode::Incremental;
            self.gc.state = GcState::Pause;
            self.gc.estimate = self.gc.total_bytes;
            tracing::debug!("gc switched to incremental mode");
        }
        self.gc.set_pause();
        previous
    }

    /// Switch to generational mode; returns the previous mode
    /// Switch to generational mode; returns the previous mode. Inside a
    /// finalizer or a step the switch happens at the next safe point.
    pub fn set_generational(&mut self, params: GenerationalParams) -> GcMode {
        let previous = self.gc.mode;
        self.gc.gen_params = params;
        if previous == GcMode::Incremental {
            if self.gc.stopem {
                self.gc.pending_generational = true;
                tracing::debug!("generational mode deferred while the collector is busy");
                return previous;
            }
            self.enter_generational();
        }
        self.gc.set_minor_debt();
        previous
    }

    fn enter_generational(&mut self) {
        self.gc.stopem = true;
        self.finish_cycle_quietly();
        self.full_mark_sweep(true);
        self.gc.mode = GcMode::Generational;
        self.gc.state = GcState::Propagate;
        self.gc.stopem = false;
        self.call_all_finalizers();
        tracing::debug!(total = self.gc.total_bytes, "gc switched to generational mode");
    }

    fn apply_pending_mode(&mut self) {
        if self.gc.pending_generational && !self.gc.stopem {
            self.gc.pending_generational = false;
            if self.gc.mode == GcMode::Incremental {
                self.enter_generational();
                self.gc.set_minor_debt();
            }
        }
    }

    /// Bytes in use
    pub fn gc_count(&self) -> usize {
        self.gc.total_bytes
    }

    pub fn gc_stop(&mut self) {
        self.gc.stopped = true;
    }

    pub fn gc_restart(&mut self) {
        self.gc.stopped = false;
        self.gc.debt = self.gc.debt.min(0);
    }

    pub fn gc_is_running(&self) -> bool {
        !self.gc.stopped
    }

    pub fn gc_mode(&self) -> GcMode {
        self.gc.mode
    }

    /// Run the finalizers of every object still registered, as when the
    /// state is closed
    pub(crate) fn finalize_all(&mut self) {
        if self.gc.stopem {
            return;
        }
        self.separate_tobefnz(true);
        self.call_all_finalizers();
    }
}
