#![cfg(test)]

use crate::asm::x86_64::*;

/// Emit through a closure and compare against the expected hex bytes
fn check(expected: &str, emit: impl FnOnce(&mut CodeBlock)) {
    let mut cb = CodeBlock::new_dummy(4096);
    emit(&mut cb);
    assert_eq!(format!("{:x}", cb), expected);
}

#[test]
fn test_alu_reg_forms() {
    check("4801d8", |cb| cb.add(RAX, RBX));
    check("01d1", |cb| cb.add(ECX, EDX));
    check("6601d9", |cb| cb.add(CX, BX));
    check("00d9", |cb| cb.add(CL, BL));
    check("4000e1", |cb| cb.add(CL, SPL));
    check("4c01f2", |cb| cb.add(RDX, R14));
    check("4421e5", |cb| cb.and(EBP, R12D));
    check("09f2", |cb| cb.or(EDX, ESI));
    check("31c0", |cb| cb.xor(EAX, EAX));
    check("38d1", |cb| cb.cmp(CL, DL));
}

#[test]
fn test_alu_mem_forms() {
    check("480110", |cb| cb.add(Opnd::mem(64, RAX, 0), RDX));
    check("480310", |cb| cb.add(RDX, Opnd::mem(64, RAX, 0)));
    check("48035008", |cb| cb.add(RDX, Opnd::mem(64, RAX, 8)));
    check("480390ff000000", |cb| cb.add(RDX, Opnd::mem(64, RAX, 255)));
    check("0110", |cb| cb.add(Opnd::mem(32, RAX, 0), EDX));
    // RSP and R12 bases force a SIB byte
    check("493b1424", |cb| cb.cmp(RDX, Opnd::mem(64, R12, 0)));
    // RBP bases force a displacement
    check("4803550c", |cb| cb.add(RDX, Opnd::mem(64, RBP, 12)));
}

#[test]
fn test_alu_imm_forms() {
    check("80c103", |cb| cb.add(CL, Opnd::imm(3)));
    check("4180c001", |cb| cb.add(R8B, Opnd::uimm(1)));
    check("4180c07f", |cb| cb.add(R8B, Opnd::imm(0x7f)));
    check("4883c408", |cb| cb.add(RSP, Opnd::imm(8)));
    check("83c108", |cb| cb.add(ECX, Opnd::imm(8)));
    check("81c1ff000000", |cb| cb.add(ECX, Opnd::imm(255)));
    check("6681c1ff7f", |cb| cb.add(CX, Opnd::uimm(0x7fff)));
    check("4881407fff000000", |cb| cb.add(Opnd::mem(64, RAX, 127), Opnd::imm(255)));
    check("48832008", |cb| cb.and(Opnd::mem(64, RAX, 0), Opnd::imm(8)));
    check("4883f802", |cb| cb.cmp(RAX, Opnd::imm(2)));
    check("81f900000080", |cb| cb.cmp(ECX, Opnd::uimm(0x8000_0000)));
}

#[test]
fn test_mov() {
    check("b807000000", |cb| cb.mov(EAX, Opnd::imm(7)));
    check("b8fdffffff", |cb| cb.mov(EAX, Opnd::imm(-3)));
    check("89d8", |cb| cb.mov(EAX, EBX));
    check("4889c3", |cb| cb.mov(RBX, RAX));
    check("4488c9", |cb| cb.mov(CL, R9B));
    check("40b60b", |cb| cb.mov(SIL, Opnd::imm(11)));
    check("488b442404", |cb| cb.mov(RAX, Opnd::mem(64, RSP, 4)));
    check("8b9380000000", |cb| cb.mov(EDX, Opnd::mem(32, RBX, 128)));
    check("41895814", |cb| cb.mov(Opnd::mem(32, R8, 20), EBX));
    check("4d8913", |cb| cb.mov(Opnd::mem(64, R11, 0), R10));
}

#[test]
fn test_mov_imm_widths() {
    // Positive values that fit use the zero-extending 32-bit form
    check("b834000000", |cb| cb.mov(RAX, Opnd::imm(0x34)));
    check("41b834000000", |cb| cb.mov(R8, Opnd::imm(0x34)));
    check("41bf03000000", |cb| cb.mov(R15, Opnd::imm(3)));
    check("b8ffffffff", |cb| cb.mov(RAX, Opnd::uimm(u32::MAX.into())));
    check("41b800000000", |cb| cb.mov(R8, Opnd::uimm(0)));

    // Everything else gets the movabs form
    check("49b80000008000000000", |cb| cb.mov(R8, Opnd::imm(0x80000000)));
    check("48b80000000001000000", |cb| cb.mov(RAX, Opnd::uimm(u32::MAX as u64 + 1)));
    check("48b8ffffffffffffffff", |cb| cb.mov(RAX, Opnd::imm(-1)));
    check("48b8ffffffffffffffff", |cb| cb.mov(RAX, Opnd::uimm(u64::MAX)));
    check("49b8ffffffffffffffff", |cb| cb.mov(R8, Opnd::uimm(u64::MAX)));

    // Narrow registers take immediates at their own width
    check("b001", |cb| cb.mov(AL, Opnd::uimm(1)));
    check("66b80100", |cb| cb.mov(AX, Opnd::uimm(1)));
}

#[test]
fn test_mov_mem_imm() {
    check("c60424fd", |cb| cb.mov(Opnd::mem(8, RSP, 0), Opnd::imm(-3)));
    check("48c7470801000000", |cb| cb.mov(Opnd::mem(64, RDI, 8), Opnd::imm(1)));
    check("c7400411000000", |cb| cb.mov(Opnd::mem(32, RAX, 4), Opnd::imm(17)));
    check("48c742f8f4ffffff", |cb| cb.mov(Opnd::mem(64, RDX, -8), Opnd::imm(-12)));
}

#[test]
fn test_movsx() {
    check("660fbec0", |cb| cb.movsx(AX, AL));
    check("0fbed0", |cb| cb.movsx(EDX, AL));
    check("480fbec3", |cb| cb.movsx(RAX, BL));
    check("0fbfc8", |cb| cb.movsx(ECX, AX));
    check("4863c1", |cb| cb.movsx(RAX, ECX));
    check("480fbe0424", |cb| cb.movsx(RAX, Opnd::mem(8, RSP, 0)));
}

#[test]
fn test_test() {
    check("84c0", |cb| cb.test(AL, AL));
    check("6685c0", |cb| cb.test(AX, AX));
    check("4885c0", |cb| cb.test(RAX, RAX));
    check("4885f0", |cb| cb.test(RAX, RSI));
    check("854640", |cb| cb.test(Opnd::mem(32, RSI, 64), EAX));
    check("4885472a", |cb| cb.test(Opnd::mem(64, RDI, 42), RAX));

    // Unsigned masks narrow the viewed operand width
    check("f6c108", |cb| cb.test(CL, Opnd::uimm(8)));
    check("f6c108", |cb| cb.test(RCX, Opnd::uimm(8)));
    check("f6420808", |cb| cb.test(Opnd::mem(8, RDX, 8), Opnd::uimm(8)));
    check("f64208ff", |cb| cb.test(Opnd::mem(8, RDX, 8), Opnd::uimm(255)));
    check("66f7c2ffff", |cb| cb.test(DX, Opnd::uimm(0xffff)));
    check("66f74208ffff", |cb| cb.test(Opnd::mem(16, RDX, 8), Opnd::uimm(0xffff)));
    check("f60601", |cb| cb.test(Opnd::mem(8, RSI, 0), Opnd::uimm(1)));
    check("f6461001", |cb| cb.test(Opnd::mem(8, RSI, 16), Opnd::uimm(1)));
    check("f646f001", |cb| cb.test(Opnd::mem(8, RSI, -16), Opnd::uimm(1)));

    // Signed masks use the sign-extended imm32 form
    check("48f74640f7ffffff", |cb| cb.test(Opnd::mem(64, RSI, 64), Opnd::imm(!0x08)));
    check("48f7464008000000", |cb| cb.test(Opnd::mem(64, RSI, 64), Opnd::imm(0x08)));
    check("48f7c108000000", |cb| cb.test(RCX, Opnd::imm(0x08)));
}

#[test]
fn test_not() {
    check("66f7d0", |cb| cb.not(AX));
    check("f7d0", |cb| cb.not(EAX));
    check("48f7d0", |cb| cb.not(RAX));
    check("49f7d3", |cb| cb.not(R11));
    check("f710", |cb| cb.not(Opnd::mem(32, RAX, 0)));
    check("49f71424", |cb| cb.not(Opnd::mem(64, R12, 0)));
    check("f71424", |cb| cb.not(Opnd::mem(32, RSP, 0)));
    check("f7542403", |cb| cb.not(Opnd::mem(32, RSP, 3)));
    check("f794242d010000", |cb| cb.not(Opnd::mem(32, RSP, 301)));
    check("f75500", |cb| cb.not(Opnd::mem(32, RBP, 0)));
    check("f7550d", |cb| cb.not(Opnd::mem(32, RBP, 13)));
    check("f75245", |cb| cb.not(Opnd::mem(32, RDX, 69)));
    check("f792f1ffff7f", |cb| cb.not(Opnd::mem(32, RDX, 0x7ffffff1)));
}

#[test]
fn test_shifts() {
    check("d1fa", |cb| cb.sar(EDX, Opnd::uimm(1)));
    check("49c1ee07", |cb| cb.shr(R14, Opnd::uimm(7)));
    check("66d1e1", |cb| cb.shl(CX, Opnd::uimm(1)));
    check("48d1e1", |cb| cb.shl(RCX, Opnd::uimm(1)));
    check("48d1642424", |cb| cb.shl(Opnd::mem(64, RSP, 36), Opnd::uimm(1)));
}

#[test]
fn test_lea() {
    check("488d5108", |cb| cb.lea(RDX, Opnd::mem(64, RCX, 8)));
}

#[test]
fn test_cmov() {
    check("0f4ff7", |cb| cb.cmov(Cc::G, ESI, EDI));
    check("0f4f750c", |cb| cb.cmov(Cc::G, ESI, Opnd::mem(32, RBP, 12)));
    check("0f4cc1", |cb| cb.cmov(Cc::L, EAX, ECX));
    check("480f4cdd", |cb| cb.cmov(Cc::L, RBX, RBP));
    check("0f4e742404", |cb| cb.cmov(Cc::LE, ESI, Opnd::mem(32, RSP, 4)));
    check("480f44c1", |cb| cb.cmov(Cc::E, RAX, RCX));
    check("480f45c1", |cb| cb.cmov(Cc::NE, RAX, RCX));
}

#[test]
fn test_push_pop() {
    check("50", |cb| cb.push(RAX));
    check("53", |cb| cb.push(RBX));
    check("4154", |cb| cb.push(R12));
    check("ff30", |cb| cb.push(Opnd::mem(64, RAX, 0)));
    check("41ff30", |cb| cb.push(Opnd::mem(64, R8, 0)));
    check("41ff7003", |cb| cb.push(Opnd::mem(64, R8, 3)));

    check("58", |cb| cb.pop(RAX));
    check("5b", |cb| cb.pop(RBX));
    check("5c", |cb| cb.pop(RSP));
    check("5d", |cb| cb.pop(RBP));
    check("415c", |cb| cb.pop(R12));
    check("8f00", |cb| cb.pop(Opnd::mem(64, RAX, 0)));
    check("418f00", |cb| cb.pop(Opnd::mem(64, R8, 0)));
    check("418f4003", |cb| cb.pop(Opnd::mem(64, R8, 3)));
}

#[test]
fn test_ret() {
    check("c3", |cb| cb.ret());
}

#[test]
fn test_calls_and_jumps() {
    check("ffd0", |cb| cb.call_opnd(RAX));
    check("ff542408", |cb| cb.call_opnd(Opnd::mem(64, RSP, 8)));
    check("41ffe4", |cb| cb.jmp_opnd(R12));

    // A call to the current position is a backwards rel32 of -5
    check("e8fbffffff", |cb| {
        let here = cb.get_write_ptr();
        cb.call_ptr(RAX, here.raw_ptr());
    });

    // Same for an unconditional jump
    check("e9fbffffff", |cb| {
        let here = cb.get_write_ptr();
        cb.jmp_ptr(here);
    });

    // Conditional jumps carry the 0F prefix
    check("0f84faffffff", |cb| {
        let here = cb.get_write_ptr();
        cb.jcc_ptr(Cc::E, here);
    });
    check("0f80faffffff", |cb| {
        let here = cb.get_write_ptr();
        cb.jcc_ptr(Cc::O, here);
    });
}

#[test]
fn test_jumps_to_labels() {
    // Backwards unconditional jump
    check("e9fbffffff", |cb| {
        let label = cb.new_label("loop");
        cb.write_label(label);
        cb.jmp_label(label);
        cb.link_labels();
    });

    // Forwards unconditional jump has a zero displacement
    check("e900000000", |cb| {
        let label = cb.new_label("next");
        cb.jmp_label(label);
        cb.write_label(label);
        cb.link_labels();
    });

    // Conditional jumps embed the condition code
    check("0f8dfaffffff", |cb| {
        let label = cb.new_label("loop");
        cb.write_label(label);
        cb.jcc_label(Cc::GE, label);
        cb.link_labels();
    });
    check("0f80faffffff", |cb| {
        let label = cb.new_label("loop");
        cb.write_label(label);
        cb.jcc_label(Cc::O, label);
        cb.link_labels();
    });
}

#[test]
fn test_nop() {
    check("90", |cb| cb.nop(1));
    check("6690", |cb| cb.nop(2));
    check("0f1f00", |cb| cb.nop(3));
    check("0f1f4000", |cb| cb.nop(4));
    check("0f1f440000", |cb| cb.nop(5));
    check("660f1f440000", |cb| cb.nop(6));
    check("0f1f8000000000", |cb| cb.nop(7));
    check("0f1f840000000000", |cb| cb.nop(8));
    check("660f1f840000000000", |cb| cb.nop(9));
    check("660f1f84000000000090", |cb| cb.nop(10));
    check("660f1f8400000000006690", |cb| cb.nop(11));
    check("660f1f8400000000000f1f00", |cb| cb.nop(12));
}

#[test]
fn test_lock_prefix() {
    check("f048010a", |cb| {
        cb.lock_prefix();
        cb.add(Opnd::mem(64, RDX, 0), RCX);
    });
}

#[test]
#[cfg(feature = "disasm")]
fn basic_capstone_usage() -> std::result::Result<(), capstone::Error> {
    // Smoke-test the capstone wiring
    use capstone::prelude::*;
    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()?;

    let insns = cs.disasm_all(&[0xcc], 0x1000)?;

    match insns.as_ref() {
        [insn] => {
            assert_eq!(Some("int3"), insn.mnemonic());
            Ok(())
        }
        _ => Err(capstone::Error::CustomError(
            "expected to disassemble to int3",
        )),
    }
}
