mod instruction;

pub use instruction::Instruction;

/// Instruction format modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
    IAx,
    IsJ,
}

/// Register-machine instruction set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // Load/Move operations
    Move = 0,   // R[A] := R[B]
    LoadI,      // R[A] := sBx
    LoadF,      // R[A] := (float)sBx
    LoadK,      // R[A] := K[Bx]
    LoadKX,     // R[A] := K[extra arg]
    LoadFalse,  // R[A] := false
    LFalseSkip, // R[A] := false; pc++
    LoadTrue,   // R[A] := true
    LoadNil,    // R[A], R[A+1], ..., R[A+B] := nil

    // Upvalue operations
    GetUpval, // R[A] := UpValue[B]
    SetUpval, // UpValue[B] := R[A]

    // Table get operations
    GetTabUp, // R[A] := UpValue[B][K[C]:string]
    GetTable, // R[A] := R[B][R[C]]
    GetI,     // R[A] := R[B][C]
    GetField, // R[A] := R[B][K[C]:string]

    // Table set operations
    SetTabUp, // UpValue[A][K[B]:string] := RK(C)
    SetTable, // R[A][R[B]] := RK(C)
    SetI,     // R[A][B] := RK(C)
    SetField, // R[A][K[B]:string] := RK(C)

    NewTable, // R[A] := {}  (B: hash size hint, C: array size hint, EXTRAARG follows)
    Self_,    // R[A+1] := R[B]; R[A] := R[B][RK(C):string]

    // Arithmetic, register operands
    Add,  // R[A] := R[B] + R[C]
    Sub,  // R[A] := R[B] - R[C]
    Mul,  // R[A] := R[B] * R[C]
    Mod,  // R[A] := R[B] % R[C]
    Pow,  // R[A] := R[B] ^ R[C]
    Div,  // R[A] := R[B] / R[C]
    IDiv, // R[A] := R[B] // R[C]
    BAnd, // R[A] := R[B] & R[C]
    BOr,  // R[A] := R[B] | R[C]
    BXor, // R[A] := R[B] ~ R[C]
    Shl,  // R[A] := R[B] << R[C]
    Shr,  // R[A] := R[B] >> R[C]

    // Unary operations
    Unm,  // R[A] := -R[B]
    BNot, // R[A] := ~R[B]
    Not,  // R[A] := not R[B]
    Len,  // R[A] := #R[B]

    Concat, // R[A] := R[A].. ... ..R[A + B - 1]

    Close, // close all upvalues >= R[A]
    Tbc,   // mark variable A "to be closed"
    Jmp,   // pc += sJ

    // Comparison operations
    Eq,  // if ((R[A] == R[B]) ~= k) then pc++
    Lt,  // if ((R[A] <  R[B]) ~= k) then pc++
    Le,  // if ((R[A] <= R[B]) ~= k) then pc++
    EqK, // if ((R[A] == K[B]) ~= k) then pc++

    Test,    // if (not R[A] == k) then pc++
    TestSet, // if (not R[B] == k) then pc++ else R[A] := R[B]

    // Function calls
    Call,     // R[A], ... ,R[A+C-2] := R[A](R[A+1], ... ,R[A+B-1])
    TailCall, // return R[A](R[A+1], ... ,R[A+B-1])
    Return,   // return R[A], ... ,R[A+B-2]

    // Loop operations
    ForLoop,  // update counters; if loop continues then pc-=Bx;
    ForPrep,  // <check values and prepare counters>; if not to run then pc+=Bx+1;
    TForPrep, // create upvalue for R[A + 3]; pc+=Bx
    TForCall, // R[A+4], ... ,R[A+3+C] := R[A](R[A+1], R[A+2]);
    TForLoop, // if R[A+2] ~= nil then { R[A]=R[A+2]; pc -= Bx }

    SetList, // R[A][C+i] := R[A+i], 1 <= i <= B

    Closure,    // R[A] := closure(KPROTO[Bx])
    Vararg,     // R[A], R[A+1], ..., R[A+C-2] = vararg
    VarargPrep, // (adjust vararg parameters)
    ExtraArg,   // extra (larger) argument for previous opcode
}

const OPCODES: [OpCode; OpCode::COUNT] = {
    use OpCode::*;
    [
        Move, LoadI, LoadF, LoadK, LoadKX, LoadFalse, LFalseSkip, LoadTrue, LoadNil, GetUpval,
        SetUpval, GetTabUp, GetTable, GetI, GetField, SetTabUp, SetTable, SetI, SetField,
        NewTable, Self_, Add, Sub, Mul, Mod, Pow, Div, IDiv, BAnd, BOr, BXor, Shl, Shr, Unm, BNot,
        Not, Len, Concat, Close, Tbc, Jmp, Eq, Lt, Le, EqK, Test, TestSet, Call, TailCall,
        Return, ForLoop, ForPrep, TForPrep, TForCall, TForLoop, SetList, Closure, Vararg,
        VarargPrep, ExtraArg,
    ]
};

impl OpCode {
    pub const COUNT: usize = OpCode::ExtraArg as usize + 1;

    #[inline(always)]
    pub fn from_u8(byte: u8) -> Option<Self> {
        OPCODES.get(byte as usize).copied()
    }

    pub fn get_mode(self) -> OpMode {
        use OpCode::*;
        match self {
            LoadI | LoadF => OpMode::IAsBx,
            LoadK | LoadKX | ForLoop | ForPrep | TForPrep | TForLoop | Closure => OpMode::IABx,
            Jmp => OpMode::IsJ,
            ExtraArg => OpMode::IAx,
            _ => OpMode::IABC,
        }
    }

    /// Instruction writes register A
    pub fn sets_a(self) -> bool {
        use OpCode::*;
        !matches!(
            self,
            SetUpval
                | SetTabUp
                | SetTable
                | SetI
                | SetField
                | Close
                | Tbc
                | Jmp
                | Eq
                | Lt
                | Le
                | EqK
                | Test
                | Return
                | TForPrep
                | TForCall
                | SetList
                | ExtraArg
        )
    }

    /// Instruction is followed by a jump it controls
    pub fn is_test(self) -> bool {
        matches!(
            self,
            OpCode::Eq | OpCode::Lt | OpCode::Le | OpCode::EqK | OpCode::Test | OpCode::TestSet
        )
    }

    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadI => "LOADI",
            LoadF => "LOADF",
            LoadK => "LOADK",
            LoadKX => "LOADKX",
            LoadFalse => "LOADFALSE",
            LFalseSkip => "LFALSESKIP",
            LoadTrue => "LOADTRUE",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            SetUpval => "SETUPVAL",
            GetTabUp => "GETTABUP",
            GetTable => "GETTABLE",
            GetI => "GETI",
            GetField => "GETFIELD",
            SetTabUp => "SETTABUP",
            SetTable => "SETTABLE",
            SetI => "SETI",
            SetField => "SETFIELD",
            NewTable => "NEWTABLE",
            Self_ => "SELF",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Mod => "MOD",
            Pow => "POW",
            Div => "DIV",
            IDiv => "IDIV",
            BAnd => "BAND",
            BOr => "BOR",
            BXor => "BXOR",
            Shl => "SHL",
            Shr => "SHR",
            Unm => "UNM",
            BNot => "BNOT",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Close => "CLOSE",
            Tbc => "TBC",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            EqK => "EQK",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForPrep => "TFORPREP",
            TForCall => "TFORCALL",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Closure => "CLOSURE",
            Vararg => "VARARG",
            VarargPrep => "VARARGPREP",
            ExtraArg => "EXTRAARG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table_matches_discriminants() {
        for (i, op) in OPCODES.iter().enumerate() {
            assert_eq!(*op as usize, i);
            assert_eq!(OpCode::from_u8(i as u8), Some(*op));
        }
        assert_eq!(OpCode::from_u8(OpCode::COUNT as u8), None);
    }
}
