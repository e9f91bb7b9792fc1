//! Capstone-based disassembly of generated code, for debugging.

#![allow(dead_code)]

use crate::asm::CodeBlock;
use crate::virtualmem::CodePtr;

/// Disassemble an address range in a code block and produce a string.
/// Only available when the crate is built with the disasm feature.
pub fn disasm_addr_range(cb: &CodeBlock, start_addr: CodePtr, end_addr: CodePtr) -> String {
    use capstone::prelude::*;
    use std::fmt::Write;

    let mut out = String::from("");

    // Initialize capstone
    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .unwrap();

    // Disassemble the generated code
    let code_size = end_addr.into_usize() - start_addr.into_usize();
    let code_slice =
        unsafe { std::slice::from_raw_parts(start_addr.raw_ptr(), code_size) };
    let insns = cs
        .disasm_all(code_slice, start_addr.into_usize() as u64)
        .unwrap();

    // Walk the decoded instructions
    for insn in insns.as_ref() {
        // Comments for this instruction
        #[cfg(feature = "asm_comments")]
        if let Some(comment_list) = cb.comments_at(insn.address() as usize) {
            for comment in comment_list {
                writeln!(&mut out, "  \x1b[1m# {}\x1b[0m", comment).unwrap();
            }
        }
        #[cfg(not(feature = "asm_comments"))]
        let _ = cb;

        writeln!(&mut out, "  {}", insn).unwrap();
    }

    return out;
}
