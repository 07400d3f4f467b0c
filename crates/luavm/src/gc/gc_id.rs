// ============ Object IDs ============
// Every collectable object is addressed by a u32 slot index into its arena.

macro_rules! define_id {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, PartialOrd, Ord)]
            #[repr(transparent)]
            pub struct $name(pub u32);

            impl $name {
                #[inline(always)]
                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }
        )*
    };
}

define_id!(StringId, TableId, FunctionId, UpvalueId, UserdataId, ThreadId);

/// Object type tags, also the order in which the sweeper walks the arenas
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcType {
    String = 0,
    Table = 1,
    Function = 2,
    Upvalue = 3,
    Userdata = 4,
    Thread = 5,
}

impl GcType {
    pub const ALL: [GcType; 6] = [
        GcType::String,
        GcType::Table,
        GcType::Function,
        GcType::Upvalue,
        GcType::Userdata,
        GcType::Thread,
    ];
}

/// Unified GC object identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GcId {
    StringId(StringId),
    TableId(TableId),
    FunctionId(FunctionId),
    UpvalueId(UpvalueId),
    UserdataId(UserdataId),
    ThreadId(ThreadId),
}

impl GcId {
    #[inline(always)]
    pub fn gc_type(self) -> GcType {
        match self {
            GcId::StringId(_) => GcType::String,
            GcId::TableId(_) => GcType::Table,
            GcId::FunctionId(_) => GcType::Function,
            GcId::UpvalueId(_) => GcType::Upvalue,
            GcId::UserdataId(_) => GcType::Userdata,
            GcId::ThreadId(_) => GcType::Thread,
        }
    }

    #[inline(always)]
    pub fn index(self) -> u32 {
        match self {
            GcId::StringId(StringId(id)) => id,
            GcId::TableId(TableId(id)) => id,
            GcId::FunctionId(FunctionId(id)) => id,
            GcId::UpvalueId(UpvalueId(id)) => id,
            GcId::UserdataId(UserdataId(id)) => id,
            GcId::ThreadId(ThreadId(id)) => id,
        }
    }

    pub fn from_parts(ty: GcType, index: u32) -> Self {
        match ty {
            GcType::String => GcId::StringId(StringId(index)),
            GcType::Table => GcId::TableId(TableId(index)),
            GcType::Function => GcId::FunctionId(FunctionId(index)),
            GcType::Upvalue => GcId::UpvalueId(UpvalueId(index)),
            GcType::Userdata => GcId::UserdataId(UserdataId(index)),
            GcType::Thread => GcId::ThreadId(ThreadId(index)),
        }
    }
}
