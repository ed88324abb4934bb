//! Filter bytecode executor.
//!
//! A register machine with one 64-bit accumulator and a comparison flag.
//! Every load is bounds-checked against the packet slice; a violation, an
//! out-of-range jump target, or falling off the end of the bytecode all
//! evaluate to "no match" rather than faulting.

use crate::types::{DetectedEndian, EndianMode, FilterRule, Instruction, OpCode, ProtocolDef};

#[inline]
fn read_be(packet: &[u8], offset: usize, size: usize) -> u64 {
    let mut v = 0u64;
    for &b in &packet[offset..offset + size] {
        v = (v << 8) | u64::from(b);
    }
    v
}

#[inline]
fn read_le(packet: &[u8], offset: usize, size: usize) -> u64 {
    let mut v = 0u64;
    for (i, &b) in packet[offset..offset + size].iter().enumerate() {
        v |= u64::from(b) << (8 * i);
    }
    v
}

#[inline]
fn sign_extend(v: u64, size: usize) -> u64 {
    let shift = 64 - 8 * size as u32;
    (((v << shift) as i64) >> shift) as u64
}

/// Execute raw bytecode against a packet slice.
pub fn execute_bytecode(packet: &[u8], bytecode: &[Instruction]) -> bool {
    if bytecode.is_empty() {
        return false;
    }

    let len = packet.len();
    let code_len = bytecode.len() as u32;
    let mut ip: u32 = 0;
    let mut acc: u64 = 0;
    let mut cmp_result = false;

    while (ip as usize) < bytecode.len() {
        let ins = &bytecode[ip as usize];

        macro_rules! load {
            ($size:expr, $read:ident, $signed:expr) => {{
                let off = ins.offset as usize;
                if off + $size > len {
                    return false;
                }
                let raw = $read(packet, off, $size);
                acc = if $signed { sign_extend(raw, $size) } else { raw };
            }};
        }

        match ins.opcode {
            OpCode::LoadU8 => load!(1, read_be, false),
            OpCode::LoadU16Be => load!(2, read_be, false),
            OpCode::LoadU16Le => load!(2, read_le, false),
            OpCode::LoadU32Be => load!(4, read_be, false),
            OpCode::LoadU32Le => load!(4, read_le, false),
            OpCode::LoadU64Be => load!(8, read_be, false),
            OpCode::LoadU64Le => load!(8, read_le, false),
            OpCode::LoadI8 => load!(1, read_be, true),
            OpCode::LoadI16Be => load!(2, read_be, true),
            OpCode::LoadI16Le => load!(2, read_le, true),
            OpCode::LoadI32Be => load!(4, read_be, true),
            OpCode::LoadI32Le => load!(4, read_le, true),
            OpCode::LoadI64Be => load!(8, read_be, true),
            OpCode::LoadI64Le => load!(8, read_le, true),

            OpCode::CmpEq => cmp_result = acc == ins.operand,
            OpCode::CmpNe => cmp_result = acc != ins.operand,
            OpCode::CmpGt => cmp_result = acc > ins.operand,
            OpCode::CmpGe => cmp_result = acc >= ins.operand,
            OpCode::CmpLt => cmp_result = acc < ins.operand,
            OpCode::CmpLe => cmp_result = acc <= ins.operand,
            OpCode::CmpMask => cmp_result = (acc & ins.operand) == ins.operand2,

            OpCode::JumpIfFalse => {
                if !cmp_result {
                    if ins.jump_target >= code_len {
                        return false;
                    }
                    ip = ins.jump_target;
                    continue;
                }
            }
            OpCode::Jump => {
                if ins.jump_target >= code_len {
                    return false;
                }
                ip = ins.jump_target;
                continue;
            }
            OpCode::ReturnTrue => return true,
            OpCode::ReturnFalse => return false,
        }

        ip += 1;
    }

    // Fell off the end without an explicit return.
    false
}

/// Execute a rule's base bytecode with the quick size reject.
pub fn execute_filter(packet: &[u8], rule: &FilterRule) -> bool {
    if packet.len() < rule.min_packet_size as usize {
        return false;
    }
    execute_bytecode(packet, &rule.bytecode_be)
}

/// Run one rule against a packet slice under the protocol's endian policy.
///
/// In AUTO mode with nothing detected yet, big-endian is tried first; the
/// first variant to match writes the detection back via CAS. A detected
/// endian never changes afterwards.
fn match_with_endian(packet: &[u8], rule: &FilterRule, proto: &ProtocolDef) -> bool {
    match proto.endian_mode {
        EndianMode::Big => execute_bytecode(packet, &rule.bytecode_be),
        EndianMode::Little => execute_bytecode(packet, &rule.bytecode_le),
        EndianMode::Auto => match proto.detected_endian() {
            DetectedEndian::Big => execute_bytecode(packet, &rule.bytecode_be),
            DetectedEndian::Little => execute_bytecode(packet, &rule.bytecode_le),
            DetectedEndian::Unknown => {
                if execute_bytecode(packet, &rule.bytecode_be) {
                    if proto.try_set_detected(DetectedEndian::Big) {
                        tracing::info!(protocol = %proto.name, "auto-detected endian: big");
                    }
                    return true;
                }
                if execute_bytecode(packet, &rule.bytecode_le) {
                    if proto.try_set_detected(DetectedEndian::Little) {
                        tracing::info!(protocol = %proto.name, "auto-detected endian: little");
                    }
                    return true;
                }
                false
            }
        },
    }
}

/// Try every filter rule of `proto` against the packet; true on the first
/// match. `port` participates only when the (deprecated) port list is
/// non-empty.
pub fn protocol_match(packet: &[u8], port: u16, proto: &ProtocolDef) -> bool {
    if !proto.ports.is_empty() && !proto.ports.contains(&port) {
        return false;
    }

    for rule in &proto.filters {
        if rule.sliding_window {
            let mut limit = packet.len();
            if rule.sliding_max_offset > 0 && (rule.sliding_max_offset as usize) < limit {
                limit = rule.sliding_max_offset as usize;
            }
            for offset in 0..limit {
                let window = &packet[offset..];
                if window.len() < rule.min_packet_size as usize {
                    break;
                }
                if match_with_endian(window, rule, proto) {
                    return true;
                }
            }
        } else if match_with_endian(packet, rule, proto) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endian, EndianMode, ProtocolDef};

    fn rule_from(bytecode: Vec<Instruction>, min_size: u32) -> FilterRule {
        let bytecode_le = bytecode
            .iter()
            .map(|ins| Instruction { opcode: ins.opcode.swap_endian(), ..*ins })
            .collect();
        FilterRule {
            name: "t".into(),
            struct_name: "T".into(),
            bytecode_be: bytecode,
            bytecode_le,
            min_packet_size: min_size,
            sliding_window: false,
            sliding_max_offset: 0,
        }
    }

    fn magic_version_bytecode() -> Vec<Instruction> {
        vec![
            Instruction::load(OpCode::LoadU32Be, 0),
            Instruction::cmp(OpCode::CmpEq, 0x1234_5678),
            Instruction::jump_if_false(7),
            Instruction::load(OpCode::LoadU8, 4),
            Instruction::cmp(OpCode::CmpEq, 1),
            Instruction::jump_if_false(7),
            Instruction::ret(true),
            Instruction::ret(false),
        ]
    }

    #[test]
    fn basic_match_and_mismatch() {
        let code = magic_version_bytecode();
        let mut packet = vec![0x12, 0x34, 0x56, 0x78, 0x01, 0x05, 0x00, 0x10];
        assert!(execute_bytecode(&packet, &code));

        packet[0] = 0xFF;
        assert!(!execute_bytecode(&packet, &code));

        packet[0] = 0x12;
        packet[4] = 0x02;
        assert!(!execute_bytecode(&packet, &code));
    }

    #[test]
    fn short_packet_fails_on_load_bounds() {
        let code = vec![Instruction::load(OpCode::LoadU32Be, 0), Instruction::ret(true)];
        assert!(!execute_bytecode(&[0x12, 0x34], &code));
    }

    #[test]
    fn quick_reject_skips_execution() {
        // min_packet_size larger than the packet: false without any load.
        let rule = rule_from(vec![Instruction::ret(true)], 16);
        assert!(!execute_filter(&[0u8; 8], &rule));
        assert!(execute_filter(&[0u8; 16], &rule));
    }

    #[test]
    fn unsigned_comparisons() {
        let packet = [0x00u8, 0x00, 0x00, 0x64];
        let gt = vec![
            Instruction::load(OpCode::LoadU32Be, 0),
            Instruction::cmp(OpCode::CmpGt, 50),
            Instruction::jump_if_false(3),
            Instruction::ret(true),
            Instruction::ret(false),
        ];
        assert!(execute_bytecode(&packet, &gt));

        let lt = vec![
            Instruction::load(OpCode::LoadU32Be, 0),
            Instruction::cmp(OpCode::CmpLt, 200),
            Instruction::jump_if_false(3),
            Instruction::ret(true),
            Instruction::ret(false),
        ];
        assert!(execute_bytecode(&packet, &lt));
    }

    #[test]
    fn signed_loads_sign_extend() {
        // -1 as i16 BE; signed compare against u64::MAX (two's complement -1).
        let packet = [0xFFu8, 0xFF];
        let code = vec![
            Instruction::load(OpCode::LoadI16Be, 0),
            Instruction::cmp(OpCode::CmpEq, u64::MAX),
            Instruction::jump_if_false(3),
            Instruction::ret(true),
            Instruction::ret(false),
        ];
        assert!(execute_bytecode(&packet, &code));
    }

    #[test]
    fn mask_comparison() {
        let packet = [0x12u8, 0x34, 0x56, 0x78];
        let code = vec![
            Instruction::load(OpCode::LoadU32Be, 0),
            Instruction::mask(0xFF00_FF00, 0x1200_5600),
            Instruction::jump_if_false(3),
            Instruction::ret(true),
            Instruction::ret(false),
        ];
        assert!(execute_bytecode(&packet, &code));
    }

    #[test]
    fn invalid_jump_target_is_no_match() {
        let code = vec![
            Instruction::load(OpCode::LoadU8, 0),
            Instruction::cmp(OpCode::CmpEq, 99),
            Instruction::jump_if_false(100),
            Instruction::ret(true),
        ];
        assert!(!execute_bytecode(&[0x00], &code));
    }

    #[test]
    fn fall_off_end_is_no_match() {
        let code = vec![
            Instruction::load(OpCode::LoadU8, 0),
            Instruction::cmp(OpCode::CmpEq, 0),
        ];
        assert!(!execute_bytecode(&[0x00], &code));
    }

    #[test]
    fn empty_bytecode_is_no_match() {
        assert!(!execute_bytecode(&[0x00], &[]));
    }

    fn sliding_proto(sliding_max: u32) -> ProtocolDef {
        let mut rule = rule_from(
            vec![
                Instruction::load(OpCode::LoadU32Be, 0),
                Instruction::cmp(OpCode::CmpEq, 0xDEAD_BEEF),
                Instruction::jump_if_false(3),
                Instruction::ret(true),
                Instruction::ret(false),
            ],
            4,
        );
        rule.sliding_window = true;
        rule.sliding_max_offset = sliding_max;
        let mut proto = ProtocolDef::new("slide".into(), Endian::Big, EndianMode::Big);
        proto.filters.push(rule);
        proto
    }

    #[test]
    fn sliding_window_finds_offset_match() {
        let proto = sliding_proto(0);
        let mut packet = vec![0u8; 16];
        packet[5..9].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(protocol_match(&packet, 0, &proto));

        let clean = vec![0u8; 16];
        assert!(!protocol_match(&clean, 0, &proto));
    }

    #[test]
    fn sliding_max_bounds_the_scan() {
        let proto = sliding_proto(4);
        let mut packet = vec![0u8; 16];
        // Match sits at offset 8, beyond sliding_max=4.
        packet[8..12].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(!protocol_match(&packet, 0, &proto));

        // Within the window it is found.
        let mut packet2 = vec![0u8; 16];
        packet2[3..7].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(protocol_match(&packet2, 0, &proto));
    }

    #[test]
    fn sliding_equivalence_with_manual_scan() {
        // Property: sliding fires iff some offset within the cap matches.
        let proto = sliding_proto(12);
        let rule = &proto.filters[0];
        for hit_at in 0..14usize {
            let mut packet = vec![0u8; 18];
            packet[hit_at..hit_at + 4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
            let expected = (0..12.min(packet.len()))
                .any(|o| packet.len() - o >= 4 && execute_bytecode(&packet[o..], &rule.bytecode_be));
            assert_eq!(protocol_match(&packet, 0, &proto), expected, "offset {}", hit_at);
        }
    }

    #[test]
    fn auto_endian_detects_little_and_sticks() {
        let rule = rule_from(
            vec![
                Instruction::load(OpCode::LoadU16Be, 0),
                Instruction::cmp(OpCode::CmpEq, 0x1234),
                Instruction::jump_if_false(3),
                Instruction::ret(true),
                Instruction::ret(false),
            ],
            2,
        );
        let mut proto = ProtocolDef::new("auto".into(), Endian::Big, EndianMode::Auto);
        proto.filters.push(rule);

        // Bytes 0x34 0x12: only the LE interpretation equals 0x1234.
        let le_packet = [0x34u8, 0x12];
        assert!(protocol_match(&le_packet, 0, &proto));
        assert_eq!(proto.detected_endian(), DetectedEndian::Little);

        // Once detected, the BE interpretation of the same bytes must not
        // match and must not flip the detection.
        let be_packet = [0x12u8, 0x34];
        assert!(!protocol_match(&be_packet, 0, &proto));
        assert_eq!(proto.detected_endian(), DetectedEndian::Little);
    }

    #[test]
    fn forced_endian_modes_ignore_detection() {
        let rule = rule_from(
            vec![
                Instruction::load(OpCode::LoadU16Be, 0),
                Instruction::cmp(OpCode::CmpEq, 0x1234),
                Instruction::jump_if_false(3),
                Instruction::ret(true),
                Instruction::ret(false),
            ],
            2,
        );
        let mut be_proto = ProtocolDef::new("be".into(), Endian::Big, EndianMode::Big);
        be_proto.filters.push(rule.clone());
        assert!(protocol_match(&[0x12, 0x34], 0, &be_proto));
        assert!(!protocol_match(&[0x34, 0x12], 0, &be_proto));

        let mut le_proto = ProtocolDef::new("le".into(), Endian::Little, EndianMode::Little);
        le_proto.filters.push(rule);
        assert!(protocol_match(&[0x34, 0x12], 0, &le_proto));
        assert!(!protocol_match(&[0x12, 0x34], 0, &le_proto));
    }
}
