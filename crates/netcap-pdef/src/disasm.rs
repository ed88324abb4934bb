//! Bytecode disassembly, for the `pdef parse --disasm` tool and debugging.

use std::fmt::Write;

use crate::types::{FilterRule, Instruction, OpCode};

fn operand_text(ins: &Instruction) -> String {
    match ins.opcode {
        OpCode::LoadU8
        | OpCode::LoadU16Be
        | OpCode::LoadU16Le
        | OpCode::LoadU32Be
        | OpCode::LoadU32Le
        | OpCode::LoadU64Be
        | OpCode::LoadU64Le
        | OpCode::LoadI8
        | OpCode::LoadI16Be
        | OpCode::LoadI16Le
        | OpCode::LoadI32Be
        | OpCode::LoadI32Le
        | OpCode::LoadI64Be
        | OpCode::LoadI64Le => format!("offset={}", ins.offset),
        OpCode::CmpEq
        | OpCode::CmpNe
        | OpCode::CmpGt
        | OpCode::CmpGe
        | OpCode::CmpLt
        | OpCode::CmpLe => format!("value=0x{:x} ({})", ins.operand, ins.operand as i64),
        OpCode::CmpMask => format!("mask=0x{:x}, expected=0x{:x}", ins.operand, ins.operand2),
        OpCode::JumpIfFalse | OpCode::Jump => format!("target={}", ins.jump_target),
        OpCode::ReturnTrue | OpCode::ReturnFalse => String::new(),
    }
}

/// One line per instruction: index, mnemonic and the relevant operand(s).
pub fn disassemble(bytecode: &[Instruction]) -> String {
    let mut out = String::new();
    for (i, ins) in bytecode.iter().enumerate() {
        let operands = operand_text(ins);
        if operands.is_empty() {
            let _ = writeln!(out, "  {:4}: {}", i, ins.opcode.name());
        } else {
            let _ = writeln!(out, "  {:4}: {:<16} {}", i, ins.opcode.name(), operands);
        }
    }
    out
}

/// Full rule listing: header plus the base (big-endian) bytecode.
pub fn disassemble_rule(rule: &FilterRule) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Filter: {}", rule.name);
    let _ = writeln!(out, "Structure: {}", rule.struct_name);
    let _ = writeln!(out, "Min packet size: {}", rule.min_packet_size);
    if rule.sliding_window {
        let _ = writeln!(out, "Sliding window: max_offset={}", rule.sliding_max_offset);
    }
    let _ = writeln!(out, "Bytecode ({} instructions):", rule.bytecode_be.len());
    out.push_str(&disassemble(&rule.bytecode_be));
    out
}
