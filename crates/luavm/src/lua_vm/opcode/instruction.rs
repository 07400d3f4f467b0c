/*----------------------------------------------------------------------
  Instruction Format (32-bit):
  All instructions have an opcode in the first 7 bits.

        3 3 2 2 2 2 2 2 2 2 2 2 1 1 1 1 1 1 1 1 1 1 0 0 0 0 0 0 0 0 0 0
        1 0 9 8 7 6 5 4 3 2 1 0 9 8 7 6 5 4 3 2 1 0 9 8 7 6 5 4 3 2 1 0
  iABC          C(8)     |      B(8)     |k|     A(8)      |   Op(7)     |
  iABx                Bx(17)               |     A(8)      |   Op(7)     |
  iAsBx              sBx (signed)(17)      |     A(8)      |   Op(7)     |
  iAx                           Ax(25)                     |   Op(7)     |
  isJ                           sJ (signed)(25)            |   Op(7)     |

  A signed argument is represented in excess K: the represented value is
  the written unsigned value minus K, where K is half (rounded down) the
  maximum value for the corresponding unsigned argument.
----------------------------------------------------------------------*/

use super::OpCode;

/// 32-bit encoded instruction
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction(u32);

impl Instruction {
    #[inline(always)]
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    #[inline(always)]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    // Size of each field
    pub const SIZE_OP: u32 = 7;
    pub const SIZE_A: u32 = 8;
    pub const SIZE_B: u32 = 8;
    pub const SIZE_C: u32 = 8;
    pub const SIZE_K: u32 = 1;
    pub const SIZE_BX: u32 = Self::SIZE_C + Self::SIZE_B + Self::SIZE_K; // 17
    pub const SIZE_AX: u32 = Self::SIZE_BX + Self::SIZE_A; // 25
    pub const SIZE_SJ: u32 = Self::SIZE_BX + Self::SIZE_A; // 25

    // Position of each field
    pub const POS_OP: u32 = 0;
    pub const POS_A: u32 = Self::POS_OP + Self::SIZE_OP;
    pub const POS_K: u32 = Self::POS_A + Self::SIZE_A;
    pub const POS_B: u32 = Self::POS_K + Self::SIZE_K;
    pub const POS_C: u32 = Self::POS_B + Self::SIZE_B;
    pub const POS_BX: u32 = Self::POS_K;
    pub const POS_AX: u32 = Self::POS_A;
    pub const POS_SJ: u32 = Self::POS_A;

    // Maximum values
    pub const MAX_A: u32 = (1 << Self::SIZE_A) - 1;
    pub const MAX_B: u32 = (1 << Self::SIZE_B) - 1;
    pub const MAX_C: u32 = (1 << Self::SIZE_C) - 1;
    pub const MAX_BX: u32 = (1 << Self::SIZE_BX) - 1;
    pub const MAX_AX: u32 = (1 << Self::SIZE_AX) - 1;
    pub const MAX_SJ: u32 = (1 << Self::SIZE_SJ) - 1;

    pub const OFFSET_SBX: i32 = (Self::MAX_BX >> 1) as i32;
    pub const OFFSET_SJ: i32 = (Self::MAX_SJ >> 1) as i32;

    #[inline(always)]
    const fn mask1(n: u32, p: u32) -> u32 {
        (!((!0u32) << n)) << p
    }

    #[inline(always)]
    fn get_arg(self, pos: u32, size: u32) -> u32 {
        (self.0 >> pos) & Self::mask1(size, 0)
    }

    #[inline(always)]
    fn set_arg(&mut self, v: u32, pos: u32, size: u32) {
        let mask = Self::mask1(size, pos);
        self.0 = (self.0 & !mask) | ((v << pos) & mask);
    }

    /// Raw opcode byte
    #[inline(always)]
    pub fn opcode_byte(self) -> u8 {
        self.get_arg(Self::POS_OP, Self::SIZE_OP) as u8
    }

    /// Decoded opcode. Bytes outside the opcode table decode as `ExtraArg`,
    /// which the interpreter never executes; loaded bytecode is checked
    /// for such bytes before it runs.
    #[inline(always)]
    pub fn get_opcode(self) -> OpCode {
        OpCode::from_u8(self.opcode_byte()).unwrap_or(OpCode::ExtraArg)
    }

    #[inline(always)]
    pub fn set_opcode(&mut self, op: OpCode) {
        self.set_arg(op as u32, Self::POS_OP, Self::SIZE_OP);
    }

    #[inline(always)]
    pub fn get_a(self) -> u32 {
        self.get_arg(Self::POS_A, Self::SIZE_A)
    }

    #[inline(always)]
    pub fn set_a(&mut self, v: u32) {
        self.set_arg(v, Self::POS_A, Self::SIZE_A);
    }

    #[inline(always)]
    pub fn get_b(self) -> u32 {
        self.get_arg(Self::POS_B, Self::SIZE_B)
    }

    #[inline(always)]
    pub fn set_b(&mut self, v: u32) {
        self.set_arg(v, Self::POS_B, Self::SIZE_B);
    }

    #[inline(always)]
    pub fn get_c(self) -> u32 {
        self.get_arg(Self::POS_C, Self::SIZE_C)
    }

    #[inline(always)]
    pub fn set_c(&mut self, v: u32) {
        self.set_arg(v, Self::POS_C, Self::SIZE_C);
    }

    #[inline(always)]
    pub fn get_k(self) -> bool {
        self.get_arg(Self::POS_K, Self::SIZE_K) != 0
    }

    #[inline(always)]
    pub fn set_k(&mut self, v: bool) {
        self.set_arg(v as u32, Self::POS_K, Self::SIZE_K);
    }

    #[inline(always)]
    pub fn get_bx(self) -> u32 {
        self.get_arg(Self::POS_BX, Self::SIZE_BX)
    }

    #[inline(always)]
    pub fn set_bx(&mut self, v: u32) {
        self.set_arg(v, Self::POS_BX, Self::SIZE_BX);
    }

    #[inline(always)]
    pub fn get_sbx(self) -> i32 {
        self.get_bx() as i32 - Self::OFFSET_SBX
    }

    #[inline(always)]
    pub fn get_ax(self) -> u32 {
        self.get_arg(Self::POS_AX, Self::SIZE_AX)
    }

    #[inline(always)]
    pub fn get_sj(self) -> i32 {
        self.get_arg(Self::POS_SJ, Self::SIZE_SJ) as i32 - Self::OFFSET_SJ
    }

    #[inline(always)]
    pub fn set_sj(&mut self, v: i32) {
        self.set_arg((v + Self::OFFSET_SJ) as u32, Self::POS_SJ, Self::SIZE_SJ);
    }

    // Instruction creation
    pub fn create_abck(op: OpCode, a: u32, b: u32, c: u32, k: bool) -> Self {
        Self(
            ((op as u32) << Self::POS_OP)
                | (a << Self::POS_A)
                | ((k as u32) << Self::POS_K)
                | (b << Self::POS_B)
                | (c << Self::POS_C),
        )
    }

    pub fn create_abc(op: OpCode, a: u32, b: u32, c: u32) -> Self {
        Self::create_abck(op, a, b, c, false)
    }

    pub fn create_abx(op: OpCode, a: u32, bx: u32) -> Self {
        Self(((op as u32) << Self::POS_OP) | (a << Self::POS_A) | (bx << Self::POS_BX))
    }

    pub fn create_asbx(op: OpCode, a: u32, sbx: i32) -> Self {
        Self::create_abx(op, a, (sbx + Self::OFFSET_SBX) as u32)
    }

    pub fn create_ax(op: OpCode, ax: u32) -> Self {
        Self(((op as u32) << Self::POS_OP) | (ax << Self::POS_AX))
    }

    pub fn create_sj(op: OpCode, sj: i32) -> Self {
        Self(((op as u32) << Self::POS_OP) | (((sj + Self::OFFSET_SJ) as u32) << Self::POS_SJ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::opcode::OpMode;

    #[test]
    fn test_instruction_abck() {
        let instr = Instruction::create_abck(OpCode::SetField, 5, 10, 20, true);
        assert_eq!(instr.get_opcode(), OpCode::SetField);
        assert_eq!(instr.get_a(), 5);
        assert_eq!(instr.get_b(), 10);
        assert_eq!(instr.get_c(), 20);
        assert!(instr.get_k());
    }

    #[test]
    fn test_instruction_asbx() {
        let instr = Instruction::create_asbx(OpCode::LoadI, 2, -50);
        assert_eq!(instr.get_opcode(), OpCode::LoadI);
        assert_eq!(instr.get_a(), 2);
        assert_eq!(instr.get_sbx(), -50);
    }

    #[test]
    fn test_instruction_sj_patch() {
        let mut instr = Instruction::create_sj(OpCode::Jmp, -1);
        assert_eq!(instr.get_sj(), -1);
        instr.set_sj(1000);
        assert_eq!(instr.get_opcode(), OpCode::Jmp);
        assert_eq!(instr.get_sj(), 1000);
    }

    #[test]
    fn test_instruction_boundaries() {
        let instr = Instruction::create_abc(
            OpCode::Move,
            Instruction::MAX_A,
            Instruction::MAX_B,
            Instruction::MAX_C,
        );
        assert_eq!(instr.get_a(), Instruction::MAX_A);
        assert_eq!(instr.get_b(), Instruction::MAX_B);
        assert_eq!(instr.get_c(), Instruction::MAX_C);
        assert!(!instr.get_k());

        let instr = Instruction::create_ax(OpCode::ExtraArg, Instruction::MAX_AX);
        assert_eq!(instr.get_ax(), Instruction::MAX_AX);
    }

    #[test]
    fn test_unknown_opcode_byte() {
        let instr = Instruction::from_u32(0x7f);
        assert_eq!(instr.get_opcode(), OpCode::ExtraArg);
        assert!(OpCode::from_u8(0x7f).is_none());
    }

    #[test]
    fn test_opcode_mode() {
        assert_eq!(OpCode::Move.get_mode(), OpMode::IABC);
        assert_eq!(OpCode::LoadK.get_mode(), OpMode::IABx);
        assert_eq!(OpCode::LoadI.get_mode(), OpMode::IAsBx);
        assert_eq!(OpCode::Jmp.get_mode(), OpMode::IsJ);
        assert_eq!(OpCode::ExtraArg.get_mode(), OpMode::IAx);
    }
}
