//! x86-64 instruction encoder. Emitters are methods on [CodeBlock] so call
//! sites read as `cb.mov(dst, src)`. Only the subset of the architecture
//! the JIT emits is supported: 64/32/16/8-bit GP operands, base+disp
//! memory addressing, and rel32 control flow.

#![allow(dead_code)] // Not every emitter or register is used yet

use crate::asm::*;
use crate::virtualmem::CodePtr;

mod tests;

/// Condition codes, named by x86 mnemonic suffix. The discriminant is the
/// low opcode nibble shared by the Jcc (0F 8x), CMOVcc (0F 4x) and SETcc
/// (0F 9x) encodings.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Cc {
    O = 0x0,
    NO = 0x1,
    B = 0x2,
    AE = 0x3,
    E = 0x4,
    NE = 0x5,
    BE = 0x6,
    A = 0x7,
    S = 0x8,
    NS = 0x9,
    P = 0xa,
    NP = 0xb,
    L = 0xc,
    GE = 0xd,
    LE = 0xe,
    G = 0xf,
}

/// A general-purpose register of some operand width
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Reg {
    pub num_bits: u8,
    pub reg_no: u8,
}

/// A base+displacement memory location
#[derive(Clone, Copy, Debug)]
pub struct Mem {
    pub num_bits: u8,
    pub base_no: u8,
    pub disp: i32,
}

/// Operand to an instruction
#[derive(Clone, Copy, Debug)]
pub enum Opnd {
    None,
    Reg(Reg),
    Mem(Mem),
    /// Signed immediate. Width is decided per-instruction.
    Imm(i64),
    /// Unsigned immediate. Width is decided per-instruction.
    UImm(u64),
}

impl Opnd {
    /// Memory operand from a 64-bit base register and a displacement
    pub fn mem(num_bits: u8, base: Opnd, disp: i32) -> Opnd {
        match base {
            Opnd::Reg(reg) => {
                assert_eq!(reg.num_bits, 64, "memory base must be a 64-bit register");
                Opnd::Mem(Mem { num_bits, base_no: reg.reg_no, disp })
            }
            _ => unreachable!("memory base must be a register"),
        }
    }

    pub const fn imm(val: i64) -> Opnd {
        Opnd::Imm(val)
    }

    pub const fn uimm(val: u64) -> Opnd {
        Opnd::UImm(val)
    }

    pub fn const_ptr(ptr: *const u8) -> Opnd {
        Opnd::UImm(ptr as u64)
    }

    pub fn code_ptr(ptr: CodePtr) -> Opnd {
        Opnd::const_ptr(ptr.raw_ptr())
    }

    /// Operand width in bits. Immediates have no inherent width.
    pub fn num_bits(&self) -> u8 {
        match self {
            Opnd::Reg(reg) => reg.num_bits,
            Opnd::Mem(mem) => mem.num_bits,
            _ => unreachable!("width requested for a widthless operand"),
        }
    }

    /// Same location reinterpreted at a different width
    fn with_num_bits(self, num_bits: u8) -> Opnd {
        match self {
            Opnd::Reg(reg) => Opnd::Reg(Reg { num_bits, ..reg }),
            Opnd::Mem(mem) => Opnd::Mem(Mem { num_bits, ..mem }),
            _ => unreachable!(),
        }
    }

    /// Immediate value checked against what an imm field of width
    /// `dst_bits` can carry (with sign extension for 64-bit operands)
    fn imm_value(&self, dst_bits: u8) -> i64 {
        match *self {
            Opnd::Imm(val) => {
                assert!(
                    i32::try_from(val).is_ok(),
                    "signed immediate does not fit in 32 bits"
                );
                val
            }
            Opnd::UImm(val) => {
                let limit: u64 = match dst_bits {
                    8 => u8::MAX.into(),
                    16 => u16::MAX.into(),
                    32 => u32::MAX.into(),
                    // Only an imm32 is available and it gets sign extended
                    _ => i32::MAX as u64,
                };
                assert!(val <= limit, "unsigned immediate too large for operand");
                val as i64
            }
            _ => unreachable!(),
        }
    }

    fn is_imm(&self) -> bool {
        matches!(self, Opnd::Imm(_) | Opnd::UImm(_))
    }
}

const fn gp_opnd(num_bits: u8, reg_no: u8) -> Opnd {
    Opnd::Reg(Reg { num_bits, reg_no })
}

// 64-bit registers
pub const RAX: Opnd = gp_opnd(64, 0);
pub const RCX: Opnd = gp_opnd(64, 1);
pub const RDX: Opnd = gp_opnd(64, 2);
pub const RBX: Opnd = gp_opnd(64, 3);
pub const RSP: Opnd = gp_opnd(64, 4);
pub const RBP: Opnd = gp_opnd(64, 5);
pub const RSI: Opnd = gp_opnd(64, 6);
pub const RDI: Opnd = gp_opnd(64, 7);
pub const R8: Opnd = gp_opnd(64, 8);
pub const R9: Opnd = gp_opnd(64, 9);
pub const R10: Opnd = gp_opnd(64, 10);
pub const R11: Opnd = gp_opnd(64, 11);
pub const R12: Opnd = gp_opnd(64, 12);
pub const R13: Opnd = gp_opnd(64, 13);
pub const R14: Opnd = gp_opnd(64, 14);
pub const R15: Opnd = gp_opnd(64, 15);

// 32-bit registers
pub const EAX: Opnd = gp_opnd(32, 0);
pub const ECX: Opnd = gp_opnd(32, 1);
pub const EDX: Opnd = gp_opnd(32, 2);
pub const EBX: Opnd = gp_opnd(32, 3);
pub const EBP: Opnd = gp_opnd(32, 5);
pub const ESI: Opnd = gp_opnd(32, 6);
pub const EDI: Opnd = gp_opnd(32, 7);
pub const R8D: Opnd = gp_opnd(32, 8);
pub const R12D: Opnd = gp_opnd(32, 12);
pub const R14D: Opnd = gp_opnd(32, 14);

// 16-bit registers
pub const AX: Opnd = gp_opnd(16, 0);
pub const CX: Opnd = gp_opnd(16, 1);
pub const DX: Opnd = gp_opnd(16, 2);
pub const BX: Opnd = gp_opnd(16, 3);

// 8-bit registers
pub const AL: Opnd = gp_opnd(8, 0);
pub const CL: Opnd = gp_opnd(8, 1);
pub const DL: Opnd = gp_opnd(8, 2);
pub const BL: Opnd = gp_opnd(8, 3);
pub const SPL: Opnd = gp_opnd(8, 4);
pub const SIL: Opnd = gp_opnd(8, 6);
pub const R8B: Opnd = gp_opnd(8, 8);
pub const R9B: Opnd = gp_opnd(8, 9);

// Register numbers whose low three bits trigger special ModRM handling
const RSP_NO: u8 = 4;
const RBP_NO: u8 = 5;

/// The byte registers SPL/BPL/SIL/DIL are only reachable with a REX prefix;
/// without one, numbers 4-7 encode AH/CH/DH/BH.
fn reg8_needs_rex(reg: Reg) -> bool {
    reg.num_bits == 8 && (4..=7).contains(&reg.reg_no)
}

impl CodeBlock {
    /// Emit prefixes, opcode bytes, and the ModRM byte (plus SIB byte and
    /// displacement as needed) for an instruction with an r/m operand.
    /// `reg_field` is either a register number or an opcode extension.
    fn emit_rm(
        &mut self,
        sz_pref: bool,
        wide: bool,
        reg_field: u8,
        reg_rex8: bool,
        rm: Opnd,
        opcode: &[u8],
    ) {
        // Operand-size prefix comes before REX
        if sz_pref {
            self.write_byte(0x66);
        }

        // Work out the REX bits
        let r_bit = (reg_field >> 3) & 1;
        let (b_bit, rm_rex8) = match rm {
            Opnd::Reg(reg) => ((reg.reg_no >> 3) & 1, reg8_needs_rex(reg)),
            Opnd::Mem(mem) => ((mem.base_no >> 3) & 1, false),
            _ => unreachable!("bad r/m operand"),
        };

        if wide || r_bit != 0 || b_bit != 0 || reg_rex8 || rm_rex8 {
            let w_bit = if wide { 0b1000 } else { 0 };
            self.write_byte(0x40 | w_bit | (r_bit << 2) | b_bit);
        }

        self.write_bytes(opcode);

        match rm {
            Opnd::Reg(reg) => {
                // Register-direct form
                self.write_byte(0b11_000_000 | ((reg_field & 7) << 3) | (reg.reg_no & 7));
            }
            Opnd::Mem(mem) => {
                let base = mem.base_no & 7;

                // RSP/R12 as a base can only be encoded through a SIB byte
                let needs_sib = base == RSP_NO;

                // RBP/R13 with no displacement means rip-relative, so a
                // zero displacement must be spelled out for those bases.
                let (mode, disp_bits) = if mem.disp == 0 && base != RBP_NO {
                    (0b00, 0)
                } else if i8::try_from(mem.disp).is_ok() {
                    (0b01, 8)
                } else {
                    (0b10, 32)
                };

                let rm_bits = if needs_sib { 0b100 } else { base };
                self.write_byte((mode << 6) | ((reg_field & 7) << 3) | rm_bits);

                if needs_sib {
                    // Scale 1, no index register
                    self.write_byte(0b00_100_000 | base);
                }

                if disp_bits > 0 {
                    self.write_int(mem.disp as u64, disp_bits);
                }
            }
            _ => unreachable!(),
        }
    }

    /// Emit a two-operand form over the standard +0/+1/+2/+3 opcode layout:
    /// rm8,r8 / rm,r / r8,rm8 / r,rm
    fn rm_pair(&mut self, base_op: u8, dst: Opnd, src: Opnd) {
        let num_bits = dst.num_bits();
        let sz_pref = num_bits == 16;
        let wide = num_bits == 64;

        match (dst, src) {
            (Opnd::Reg(_) | Opnd::Mem(_), Opnd::Reg(src_reg)) => {
                assert_eq!(src_reg.num_bits, num_bits, "operand width mismatch");
                let op = if num_bits == 8 { base_op } else { base_op + 1 };
                self.emit_rm(sz_pref, wide, src_reg.reg_no, reg8_needs_rex(src_reg), dst, &[op]);
            }
            (Opnd::Reg(dst_reg), Opnd::Mem(_)) => {
                assert_eq!(src.num_bits(), num_bits, "operand width mismatch");
                let op = if num_bits == 8 { base_op + 2 } else { base_op + 3 };
                self.emit_rm(sz_pref, wide, dst_reg.reg_no, reg8_needs_rex(dst_reg), src, &[op]);
            }
            _ => unreachable!("bad operand pair: {:?}, {:?}", dst, src),
        }
    }

    /// Emit one of the classic ALU operations (add/or/and/sub/xor/cmp).
    /// They all share the same opcode layout: `base_op` selects the
    /// operation for register forms, `ext` selects it for immediate forms.
    fn alu(&mut self, base_op: u8, ext: u8, dst: Opnd, src: Opnd) {
        if !src.is_imm() {
            return self.rm_pair(base_op, dst, src);
        }

        let num_bits = dst.num_bits();
        let sz_pref = num_bits == 16;
        let wide = num_bits == 64;
        let val = src.imm_value(num_bits);

        if num_bits == 8 {
            // Byte operations only have the imm8 form
            assert!((-128..=255).contains(&val));
            self.emit_rm(false, false, ext, false, dst, &[0x80]);
            self.write_int(val as u64, 8);
        } else if i8::try_from(val).is_ok() {
            // Sign-extended imm8
            self.emit_rm(sz_pref, wide, ext, false, dst, &[0x83]);
            self.write_int(val as u64, 8);
        } else {
            // Full-width immediate (imm16 for 16-bit operands, else imm32)
            self.emit_rm(sz_pref, wide, ext, false, dst, &[0x81]);
            self.write_int(val as u64, if num_bits == 16 { 16 } else { 32 });
        }
    }

    /// Integer add
    pub fn add(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x00, 0, dst, src);
    }

    /// or - Bitwise OR
    pub fn or(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x08, 1, dst, src);
    }

    /// and - Bitwise AND
    pub fn and(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x20, 4, dst, src);
    }

    /// Integer subtract
    pub fn sub(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x28, 5, dst, src);
    }

    /// xor - Bitwise exclusive OR
    pub fn xor(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x30, 6, dst, src);
    }

    /// Compare, setting flags only
    pub fn cmp(&mut self, left: Opnd, right: Opnd) {
        self.alu(0x38, 7, left, right);
    }

    /// mov - Move data between registers, memory and immediates
    pub fn mov(&mut self, dst: Opnd, src: Opnd) {
        match (dst, src) {
            (Opnd::Reg(reg), Opnd::Imm(_) | Opnd::UImm(_)) => {
                self.mov_reg_imm(reg, src);
            }
            (Opnd::Mem(mem), Opnd::Imm(_) | Opnd::UImm(_)) => {
                let val = src.imm_value(mem.num_bits);
                if mem.num_bits == 8 {
                    self.emit_rm(false, false, 0, false, dst, &[0xc6]);
                    self.write_int(val as u64, 8);
                } else {
                    self.emit_rm(mem.num_bits == 16, mem.num_bits == 64, 0, false, dst, &[0xc7]);
                    self.write_int(val as u64, if mem.num_bits == 16 { 16 } else { 32 });
                }
            }
            _ => self.rm_pair(0x88, dst, src),
        }
    }

    /// mov reg, imm. Uses the shortest encoding that preserves the value:
    /// a 32-bit destination form zero-extends into 64-bit registers, and
    /// only values that need it get the 10-byte movabs form.
    fn mov_reg_imm(&mut self, reg: Reg, src: Opnd) {
        let rex_b = (reg.reg_no >> 3) & 1;

        // A positive value that fits in 32 bits can be loaded through the
        // 32-bit register name regardless of register width
        let as_imm32: Option<u32> = match src {
            Opnd::Imm(val) if val > 0 => u32::try_from(val).ok().filter(|_| val <= i32::MAX as i64),
            Opnd::UImm(val) => u32::try_from(val).ok(),
            _ => None,
        };

        match (reg.num_bits, as_imm32) {
            (64 | 32, Some(val32)) => {
                if rex_b != 0 {
                    self.write_byte(0x40 | rex_b);
                }
                self.write_byte(0xb8 | (reg.reg_no & 7));
                self.write_int(val32 as u64, 32);
            }
            (64, None) => {
                // movabs: B8+r with a full 64-bit immediate
                let val = match src {
                    Opnd::Imm(v) => v as u64,
                    Opnd::UImm(v) => v,
                    _ => unreachable!(),
                };
                self.write_byte(0x48 | rex_b);
                self.write_byte(0xb8 | (reg.reg_no & 7));
                self.write_int(val, 64);
            }
            (32, None) => {
                let val = src.imm_value(32);
                if rex_b != 0 {
                    self.write_byte(0x40 | rex_b);
                }
                self.write_byte(0xb8 | (reg.reg_no & 7));
                self.write_int(val as u64, 32);
            }
            (16, _) => {
                let val = src.imm_value(16);
                self.write_byte(0x66);
                if rex_b != 0 {
                    self.write_byte(0x40 | rex_b);
                }
                self.write_byte(0xb8 | (reg.reg_no & 7));
                self.write_int(val as u64, 16);
            }
            (8, _) => {
                let val = src.imm_value(8);
                if rex_b != 0 || reg8_needs_rex(reg) {
                    self.write_byte(0x40 | rex_b);
                }
                self.write_byte(0xb0 | (reg.reg_no & 7));
                self.write_int(val as u64, 8);
            }
            _ => unreachable!(),
        }
    }

    /// movsx - Move with sign extension
    pub fn movsx(&mut self, dst: Opnd, src: Opnd) {
        let dst_reg = match dst {
            Opnd::Reg(reg) => reg,
            _ => unreachable!("movsx destination must be a register"),
        };
        let src_bits = src.num_bits();
        assert!(src_bits < dst_reg.num_bits);

        let opcode: &[u8] = match src_bits {
            8 => &[0x0f, 0xbe],
            16 => &[0x0f, 0xbf],
            32 => &[0x63],
            _ => unreachable!(),
        };
        self.emit_rm(
            dst_reg.num_bits == 16,
            dst_reg.num_bits == 64,
            dst_reg.reg_no,
            false,
            src,
            opcode,
        );
    }

    /// test - Bitwise AND that only sets flags
    pub fn test(&mut self, rm: Opnd, src: Opnd) {
        let rm_bits = rm.num_bits();

        match src {
            Opnd::Reg(reg) => {
                assert_eq!(reg.num_bits, rm_bits);
                let op = if rm_bits == 8 { 0x84 } else { 0x85 };
                self.emit_rm(rm_bits == 16, rm_bits == 64, reg.reg_no, reg8_needs_rex(reg), rm, &[op]);
            }
            Opnd::UImm(val) => {
                // Use the narrowest immediate that holds the mask, viewing
                // the operand at that width
                let width: u8 = if val <= u8::MAX.into() {
                    8
                } else if val <= u16::MAX.into() {
                    16
                } else {
                    assert!(val <= u32::MAX.into());
                    32
                };
                assert!(width <= rm_bits);
                let rm = rm.with_num_bits(width);

                if width == 8 {
                    self.emit_rm(false, false, 0, false, rm, &[0xf6]);
                } else {
                    self.emit_rm(width == 16, false, 0, false, rm, &[0xf7]);
                }
                self.write_int(val, width as u32);
            }
            Opnd::Imm(val) => {
                // Signed masks only make sense at full width
                assert_eq!(rm_bits, 64);
                assert!(i32::try_from(val).is_ok());
                self.emit_rm(false, true, 0, false, rm, &[0xf7]);
                self.write_int(val as u64, 32);
            }
            _ => unreachable!(),
        }
    }

    /// not - Bitwise NOT
    pub fn not(&mut self, opnd: Opnd) {
        let num_bits = opnd.num_bits();
        if num_bits == 8 {
            self.emit_rm(false, false, 2, false, opnd, &[0xf6]);
        } else {
            self.emit_rm(num_bits == 16, num_bits == 64, 2, false, opnd, &[0xf7]);
        }
    }

    // Shift family. The extension field selects the operation.
    fn shift(&mut self, ext: u8, opnd: Opnd, amount: Opnd) {
        let num_bits = opnd.num_bits();
        assert!(num_bits >= 16);
        let sz_pref = num_bits == 16;
        let wide = num_bits == 64;

        match amount {
            Opnd::UImm(1) => {
                self.emit_rm(sz_pref, wide, ext, false, opnd, &[0xd1]);
            }
            Opnd::UImm(n) => {
                assert!(n < 256);
                self.emit_rm(sz_pref, wide, ext, false, opnd, &[0xc1]);
                self.write_byte(n as u8);
            }
            _ => unreachable!("shift amounts are immediate"),
        }
    }

    /// sal/shl - Shift left
    pub fn shl(&mut self, opnd: Opnd, amount: Opnd) {
        self.shift(4, opnd, amount);
    }

    /// sar - Arithmetic shift right
    pub fn sar(&mut self, opnd: Opnd, amount: Opnd) {
        self.shift(7, opnd, amount);
    }

    /// shr - Logical shift right
    pub fn shr(&mut self, opnd: Opnd, amount: Opnd) {
        self.shift(5, opnd, amount);
    }

    /// lea - Load effective address
    pub fn lea(&mut self, dst: Opnd, src: Opnd) {
        let reg = match dst {
            Opnd::Reg(reg) => reg,
            _ => unreachable!("lea destination must be a register"),
        };
        assert_eq!(reg.num_bits, 64);
        assert!(matches!(src, Opnd::Mem(_)));
        self.emit_rm(false, true, reg.reg_no, false, src, &[0x8d]);
    }

    /// cmovcc - Conditional move
    pub fn cmov(&mut self, cc: Cc, dst: Opnd, src: Opnd) {
        let reg = match dst {
            Opnd::Reg(reg) => reg,
            _ => unreachable!("cmov destination must be a register"),
        };
        assert!(reg.num_bits >= 16);
        assert!(matches!(src, Opnd::Reg(_) | Opnd::Mem(_)));
        self.emit_rm(
            reg.num_bits == 16,
            reg.num_bits == 64,
            reg.reg_no,
            false,
            src,
            &[0x0f, 0x40 | cc as u8],
        );
    }

    /// push - Push a 64-bit operand on the machine stack
    pub fn push(&mut self, opnd: Opnd) {
        match opnd {
            Opnd::Reg(reg) => {
                if reg.reg_no > 7 {
                    self.write_byte(0x41);
                }
                self.write_byte(0x50 | (reg.reg_no & 7));
            }
            Opnd::Mem(_) => {
                self.emit_rm(false, false, 6, false, opnd, &[0xff]);
            }
            _ => unreachable!(),
        }
    }

    /// pop - Pop a 64-bit operand off the machine stack
    pub fn pop(&mut self, opnd: Opnd) {
        match opnd {
            Opnd::Reg(reg) => {
                if reg.reg_no > 7 {
                    self.write_byte(0x41);
                }
                self.write_byte(0x58 | (reg.reg_no & 7));
            }
            Opnd::Mem(_) => {
                self.emit_rm(false, false, 0, false, opnd, &[0x8f]);
            }
            _ => unreachable!(),
        }
    }

    /// ret - Return, popping only the return address
    pub fn ret(&mut self) {
        self.write_byte(0xc3);
    }

    /// call - Direct call with a rel32 displacement
    pub fn call_rel32(&mut self, rel32: i32) {
        self.write_byte(0xe8);
        self.write_int(rel32 as u64, 32);
    }

    /// call - Call a C function. Uses the rel32 form when the target is in
    /// range, otherwise loads the address into the scratch register.
    pub fn call_ptr(&mut self, scratch: Opnd, dst_ptr: *const u8) {
        assert!(matches!(scratch, Opnd::Reg(_)));

        // Offset relative to the end of the 5-byte rel32 form
        let end_ptr = self.get_ptr(self.get_write_pos() + 5);
        let rel = dst_ptr as i64 - end_ptr.into_i64();

        if let Ok(rel32) = i32::try_from(rel) {
            self.call_rel32(rel32);
        } else {
            self.mov(scratch, Opnd::const_ptr(dst_ptr));
            self.call_opnd(scratch);
        }
    }

    /// call - Indirect call through a register or memory operand
    pub fn call_opnd(&mut self, opnd: Opnd) {
        self.emit_rm(false, false, 2, false, opnd, &[0xff]);
    }

    /// jmp - Indirect jump through a register or memory operand
    pub fn jmp_opnd(&mut self, opnd: Opnd) {
        self.emit_rm(false, false, 4, false, opnd, &[0xff]);
    }

    // Shared tail for rel32 jumps to a known address
    fn branch_rel32(&mut self, opcode: &[u8], dst: CodePtr) {
        self.write_bytes(opcode);

        // Offset is relative to the end of the displacement field
        let end_ptr = self.get_ptr(self.get_write_pos() + 4);
        let rel = dst.into_i64() - end_ptr.into_i64();

        if let Ok(rel32) = i32::try_from(rel) {
            self.write_int(rel32 as u64, 32);
        } else {
            // Too far for rel32. Report the failure.
            self.set_dropped_bytes(true);
        }
    }

    /// jmp - Unconditional jump to an address
    pub fn jmp_ptr(&mut self, dst: CodePtr) {
        self.branch_rel32(&[0xe9], dst);
    }

    /// jcc - Conditional jump to an address
    pub fn jcc_ptr(&mut self, cc: Cc, dst: CodePtr) {
        self.branch_rel32(&[0x0f, 0x80 | cc as u8], dst);
    }

    /// jmp - Unconditional jump to a label (always a rel32 form)
    pub fn jmp_label(&mut self, label: Label) {
        self.label_ref(label, 5, 0, |cb, end_addr, label_addr, _| {
            cb.write_byte(0xe9);
            cb.write_int((label_addr - end_addr) as u64, 32);
        });
    }

    /// jcc - Conditional jump to a label (always a rel32 form)
    pub fn jcc_label(&mut self, cc: Cc, label: Label) {
        self.label_ref(label, 6, cc as u8, |cb, end_addr, label_addr, cc| {
            cb.write_bytes(&[0x0f, 0x80 | cc]);
            cb.write_int((label_addr - end_addr) as u64, 32);
        });
    }

    /// lock - Prefix for atomic read-modify-write, eg: counter bumps
    pub fn lock_prefix(&mut self) {
        self.write_byte(0xf0);
    }

    /// nop - No-op of a given byte length, using the recommended multi-byte
    /// forms so patched-over code stays cheap to execute
    pub fn nop(&mut self, length: u32) {
        match length {
            0 => {}
            1 => self.write_byte(0x90),
            2 => self.write_bytes(&[0x66, 0x90]),
            3 => self.write_bytes(&[0x0f, 0x1f, 0x00]),
            4 => self.write_bytes(&[0x0f, 0x1f, 0x40, 0x00]),
            5 => self.write_bytes(&[0x0f, 0x1f, 0x44, 0x00, 0x00]),
            6 => self.write_bytes(&[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00]),
            7 => self.write_bytes(&[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00]),
            8 => self.write_bytes(&[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]),
            9 => self.write_bytes(&[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]),
            _ => {
                // Longest form, repeated
                let mut remaining = length;
                while remaining > 9 {
                    self.nop(9);
                    remaining -= 9;
                }
                self.nop(remaining);
            }
        }
    }
}
