// Garbage collector
//
// Tri-color mark & sweep over the object arenas, with two whites so that
// objects created after the atomic phase are never swept by the cycle that
// is finishing. Two modes:
// - Incremental: Pause -> Propagate -> Atomic -> Sweep -> CallFin -> Pause,
//   each step bounded by a work budget derived from the allocation debt.
// - Generational: atomic minor collections over young objects, with
//   periodic major (full) collections after which every survivor is old.
//
// Object ages (generational mode):
// - New: created since the last collection
// - Survival: survived one minor collection
// - Old0: marked old by a forward barrier
// - Old1: first cycle as old, still traversed by the next minor
// - Old: really old
// - Touched1: old object written by a back barrier in this cycle
// - Touched2: old object touched in the previous cycle
//
// Collection only happens at interpreter safe points (table/closure
// creation, concatenation) and on explicit requests, so values held in
// Rust locals between safe points never see their objects move or vanish.
mod collector;
mod gc_id;
mod object_pool;
mod string_interner;

pub use gc_id::*;
pub use object_pool::*;
pub use string_interner::StringInterner;

/// Work units per byte of debt; one unit is roughly one slot or one field
pub(crate) const WORK2MEM: usize = 8;
/// Slots examined per sweep unit
pub(crate) const SWEEP_UNIT: usize = 16;
/// Finalizers run per incremental step
pub(crate) const FINALIZERS_PER_STEP: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcColor {
    White0,
    White1,
    Gray,
    Black,
}

impl GcColor {
    #[inline(always)]
    pub fn is_white(self) -> bool {
        matches!(self, GcColor::White0 | GcColor::White1)
    }

    #[inline(always)]
    pub fn other_white(self) -> GcColor {
        match self {
            GcColor::White0 => GcColor::White1,
            _ => GcColor::White0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcAge {
    New,
    Survival,
    Old0,
    Old1,
    Old,
    Touched1,
    Touched2,
}

impl GcAge {
    #[inline(always)]
    pub fn is_old(self) -> bool {
        !matches!(self, GcAge::New | GcAge::Survival)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GcHeader {
    pub color: GcColor,
    pub age: GcAge,
    /// Never collected (metamethod names, main thread, ...)
    pub fixed: bool,
    /// Has a `__gc` metamethod and sits in the finobj list
    pub finalizable: bool,
    /// Already went through finalization once
    pub finalized: bool,
}

impl GcHeader {
    pub fn new(white: GcColor) -> Self {
        Self {
            color: white,
            age: GcAge::New,
            fixed: false,
            finalizable: false,
            finalized: false,
        }
    }

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        self.color.is_white()
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        self.color == GcColor::Black
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    Atomic,
    Sweep,
    CallFin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    Incremental,
    Generational,
}

/// Incremental pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalParams {
    /// Percentage of the live heap to allocate before starting a new cycle
    pub pause: u32,
    /// Percentage of work done per allocated byte
    pub step_mul: u32,
    /// Bytes allocated between steps
    pub step_size: usize,
}

impl Default for IncrementalParams {
    fn default() -> Self {
        Self {
            pause: 200,
            step_mul: 100,
            step_size: 8 * 1024,
        }
    }
}

/// Generational pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationalParams {
    /// Heap growth (percent) that triggers a minor collection
    pub minor_mul: u32,
    /// Heap growth (percent) since the last major collection that triggers another
    pub major_mul: u32,
}

impl Default for GenerationalParams {
    fn default() -> Self {
        Self {
            minor_mul: 20,
            major_mul: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcOptions {
    pub mode: GcModeOption,
    pub incremental: IncrementalParams,
    pub generational: GenerationalParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcModeOption {
    #[default]
    Incremental,
    Generational,
}

/// Collector bookkeeping; the algorithms live in `collector.rs` as `LuaVM` methods
pub struct GarbageCollector {
    pub state: GcState,
    pub mode: GcMode,
    pub current_white: GcColor,
    pub inc_params: IncrementalParams,
    pub gen_params: GenerationalParams,

    /// Estimated bytes in use
    pub total_bytes: usize,
    /// Bytes allocated beyond the current threshold; a step runs when positive
    pub debt: isize,
    /// Live heap estimate at the end of the last cycle
    pub estimate: usize,
    /// Live heap after the last major collection (generational)
    pub major_base: usize,

    /// `collectgarbage("stop")`
    pub stopped: bool,
    /// Set while finalizers run or a step is in progress
    pub stopem: bool,
    /// A minor collection is marking; weak tables count as strong
    pub(crate) in_minor: bool,
    /// `set_generational` called while the collector could not run
    pub(crate) pending_generational: bool,

    pub gray: Vec<GcId>,
    pub grayagain: Vec<GcId>,
    pub weak: Vec<TableId>,
    pub ephemeron: Vec<TableId>,
    pub allweak: Vec<TableId>,

    /// Objects with a `__gc` metamethod, not yet separated
    pub finobj: Vec<GcId>,
    /// Unreachable objects waiting for their finalizer
    pub tobefnz: Vec<GcId>,

    /// Generational lists
    pub young: Vec<GcId>,
    pub old1: Vec<GcId>,
    pub touched: Vec<GcId>,

    pub(crate) sweep_type: usize,
    pub(crate) sweep_index: u32,
    pub(crate) sweep_survivors: usize,

    /// Stamp used to visit each shared prototype once per mark phase
    pub proto_epoch: u32,
}

impl GarbageCollector {
    pub fn new(options: &GcOptions) -> Self {
        Self {
            state: GcState::Pause,
            mode: GcMode::Incremental,
            current_white: GcColor::White0,
            inc_params: options.incremental,
            gen_params: options.generational,
            total_bytes: 0,
            debt: -(options.incremental.step_size as isize) * 8,
            estimate: 0,
            major_base: 0,
            stopped: false,
            stopem: false,
            in_minor: false,
            pending_generational: false,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            finobj: Vec::new(),
            tobefnz: Vec::new(),
            young: Vec::new(),
            old1: Vec::new(),
            touched: Vec::new(),
            sweep_type: 0,
            sweep_index: 0,
            sweep_survivors: 0,
            proto_epoch: 1,
        }
    }

    /// Header for a freshly allocated object
    #[inline]
    pub fn new_header(&self) -> GcHeader {
        GcHeader::new(self.current_white)
    }

    /// The tri-color invariant holds only while marking
    #[inline]
    pub fn keep_invariant(&self) -> bool {
        matches!(self.state, GcState::Propagate | GcState::Atomic)
            || self.mode == GcMode::Generational
    }

    pub fn account_alloc(&mut self, bytes: usize) {
        self.total_bytes += bytes;
        self.debt += bytes as isize;
    }

    pub fn account_free(&mut self, bytes: usize) {
        self.total_bytes = self.total_bytes.saturating_sub(bytes);
        self.debt -= bytes as isize;
    }

    /// Threshold after a finished incremental cycle
    pub fn set_pause(&mut self) {
        let threshold = (self.estimate / 100).saturating_mul(self.inc_params.pause as usize);
        let threshold = threshold.max(self.inc_params.step_size);
        self.debt = self.total_bytes as isize - threshold.max(self.total_bytes) as isize;
        if self.debt == 0 {
            self.debt = -(self.inc_params.step_size as isize);
        }
    }

    /// Threshold after a minor collection
    pub fn set_minor_debt(&mut self) {
        let grow = (self.total_bytes / 100).saturating_mul(self.gen_params.minor_mul as usize);
        self.debt = -(grow.max(self.inc_params.step_size) as isize);
    }
}
