//! Compiled protocol model produced by the PDEF parser.
//!
//! A [`ProtocolDef`] owns the flattened struct layouts, the constants table
//! and the compiled filter rules. Each rule carries two bytecode variants
//! (big- and little-endian loads); which one runs is decided per packet by
//! the endian policy, with AUTO mode settling the question at runtime via a
//! compare-and-swap on [`ProtocolDef::detected_endian`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Primitive field types understood by the PDEF grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// `bytes[N]` — fixed-size opaque run.
    Bytes,
    /// `string[N]` — fixed-size text run.
    Str,
    /// `varbytes` — variable-length tail, must be the last field.
    VarBytes,
    /// Reference to another struct, expanded inline during flattening.
    Nested,
}

impl FieldType {
    /// Fixed size in bytes; 0 for variable-length and nested types
    /// (bytes/string sizes come from the `[N]` suffix instead).
    pub fn size(self) -> u32 {
        match self {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16 | FieldType::I16 => 2,
            FieldType::U32 | FieldType::I32 => 4,
            FieldType::U64 | FieldType::I64 => 8,
            FieldType::Bytes | FieldType::Str | FieldType::VarBytes | FieldType::Nested => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldType::U8 => "uint8",
            FieldType::U16 => "uint16",
            FieldType::U32 => "uint32",
            FieldType::U64 => "uint64",
            FieldType::I8 => "int8",
            FieldType::I16 => "int16",
            FieldType::I32 => "int32",
            FieldType::I64 => "int64",
            FieldType::Bytes => "bytes",
            FieldType::Str => "string",
            FieldType::VarBytes => "varbytes",
            FieldType::Nested => "nested",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// Endian policy configured in the `@protocol` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndianMode {
    Big,
    Little,
    /// Try big-endian first, settle on whichever variant matches first.
    Auto,
}

/// Runtime-detected endianness for AUTO mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedEndian {
    Unknown,
    Big,
    Little,
}

impl DetectedEndian {
    fn from_u8(v: u8) -> DetectedEndian {
        match v {
            1 => DetectedEndian::Big,
            2 => DetectedEndian::Little,
            _ => DetectedEndian::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DetectedEndian::Unknown => 0,
            DetectedEndian::Big => 1,
            DetectedEndian::Little => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DetectedEndian::Unknown => "unknown",
            DetectedEndian::Big => "big",
            DetectedEndian::Little => "little",
        }
    }
}

/// One flattened field: the dotted path from the struct root and the
/// absolute byte offset within the struct.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    pub offset: u32,
    pub size: u32,
    pub endian: Endian,
    pub is_variable: bool,
}

/// A struct after flattening: nested members expanded inline, offsets
/// absolute from the struct start. At most one variable-length field, which
/// is last and excluded from `min_size`.
#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<Field>,
    pub min_size: u32,
    pub has_variable: bool,
}

impl StructDef {
    pub fn find_field(&self, path: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == path)
    }
}

/// Bytecode opcodes for the filter VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    LoadU8,
    LoadU16Be,
    LoadU16Le,
    LoadU32Be,
    LoadU32Le,
    LoadU64Be,
    LoadU64Le,
    LoadI8,
    LoadI16Be,
    LoadI16Le,
    LoadI32Be,
    LoadI32Le,
    LoadI64Be,
    LoadI64Le,
    CmpEq,
    CmpNe,
    CmpGt,
    CmpGe,
    CmpLt,
    CmpLe,
    /// `(acc & operand) == operand2`
    CmpMask,
    JumpIfFalse,
    Jump,
    ReturnTrue,
    ReturnFalse,
}

impl OpCode {
    pub fn name(self) -> &'static str {
        match self {
            OpCode::LoadU8 => "LOAD_U8",
            OpCode::LoadU16Be => "LOAD_U16_BE",
            OpCode::LoadU16Le => "LOAD_U16_LE",
            OpCode::LoadU32Be => "LOAD_U32_BE",
            OpCode::LoadU32Le => "LOAD_U32_LE",
            OpCode::LoadU64Be => "LOAD_U64_BE",
            OpCode::LoadU64Le => "LOAD_U64_LE",
            OpCode::LoadI8 => "LOAD_I8",
            OpCode::LoadI16Be => "LOAD_I16_BE",
            OpCode::LoadI16Le => "LOAD_I16_LE",
            OpCode::LoadI32Be => "LOAD_I32_BE",
            OpCode::LoadI32Le => "LOAD_I32_LE",
            OpCode::LoadI64Be => "LOAD_I64_BE",
            OpCode::LoadI64Le => "LOAD_I64_LE",
            OpCode::CmpEq => "CMP_EQ",
            OpCode::CmpNe => "CMP_NE",
            OpCode::CmpGt => "CMP_GT",
            OpCode::CmpGe => "CMP_GE",
            OpCode::CmpLt => "CMP_LT",
            OpCode::CmpLe => "CMP_LE",
            OpCode::CmpMask => "CMP_MASK",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::Jump => "JUMP",
            OpCode::ReturnTrue => "RETURN_TRUE",
            OpCode::ReturnFalse => "RETURN_FALSE",
        }
    }

    /// Swap BE loads for LE loads and vice versa; everything else unchanged.
    pub fn swap_endian(self) -> OpCode {
        match self {
            OpCode::LoadU16Be => OpCode::LoadU16Le,
            OpCode::LoadU16Le => OpCode::LoadU16Be,
            OpCode::LoadU32Be => OpCode::LoadU32Le,
            OpCode::LoadU32Le => OpCode::LoadU32Be,
            OpCode::LoadU64Be => OpCode::LoadU64Le,
            OpCode::LoadU64Le => OpCode::LoadU64Be,
            OpCode::LoadI16Be => OpCode::LoadI16Le,
            OpCode::LoadI16Le => OpCode::LoadI16Be,
            OpCode::LoadI32Be => OpCode::LoadI32Le,
            OpCode::LoadI32Le => OpCode::LoadI32Be,
            OpCode::LoadI64Be => OpCode::LoadI64Le,
            OpCode::LoadI64Le => OpCode::LoadI64Be,
            other => other,
        }
    }
}

/// One bytecode word. Only the operands relevant to the opcode are set; the
/// rest stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub offset: u32,
    pub operand: u64,
    pub operand2: u64,
    pub jump_target: u32,
}

impl Instruction {
    pub fn load(opcode: OpCode, offset: u32) -> Instruction {
        Instruction { opcode, offset, operand: 0, operand2: 0, jump_target: 0 }
    }

    pub fn cmp(opcode: OpCode, operand: u64) -> Instruction {
        Instruction { opcode, offset: 0, operand, operand2: 0, jump_target: 0 }
    }

    pub fn mask(mask: u64, expected: u64) -> Instruction {
        Instruction { opcode: OpCode::CmpMask, offset: 0, operand: mask, operand2: expected, jump_target: 0 }
    }

    pub fn jump_if_false(target: u32) -> Instruction {
        Instruction { opcode: OpCode::JumpIfFalse, offset: 0, operand: 0, operand2: 0, jump_target: target }
    }

    pub fn jump(target: u32) -> Instruction {
        Instruction { opcode: OpCode::Jump, offset: 0, operand: 0, operand2: 0, jump_target: target }
    }

    pub fn ret(matched: bool) -> Instruction {
        Instruction {
            opcode: if matched { OpCode::ReturnTrue } else { OpCode::ReturnFalse },
            offset: 0,
            operand: 0,
            operand2: 0,
            jump_target: 0,
        }
    }
}

/// A compiled filter rule with both endian variants of its bytecode.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub name: String,
    pub struct_name: String,
    pub bytecode_be: Vec<Instruction>,
    pub bytecode_le: Vec<Instruction>,
    pub min_packet_size: u32,
    pub sliding_window: bool,
    /// Maximum sliding offset; 0 means unlimited.
    pub sliding_max_offset: u32,
}

/// A fully compiled protocol definition.
///
/// Shared read-only between the session that loaded it and its filter/writer
/// thread; the only mutable state is the pair of atomics driving AUTO endian
/// detection and its one-shot writeback.
#[derive(Debug)]
pub struct ProtocolDef {
    pub name: String,
    pub default_endian: Endian,
    pub endian_mode: EndianMode,
    /// Deprecated `ports=` list; always empty after parsing (a warning is
    /// logged when the clause is present).
    pub ports: Vec<u16>,
    pub constants: Vec<(String, u64)>,
    pub structs: Vec<StructDef>,
    pub filters: Vec<FilterRule>,
    /// Source file, when parsed from one; inline uploads leave this unset
    /// and skip the endian writeback.
    pub source_path: Option<PathBuf>,

    detected_endian: AtomicU8,
    writeback_claimed: AtomicBool,
}

impl ProtocolDef {
    pub fn new(name: String, default_endian: Endian, endian_mode: EndianMode) -> ProtocolDef {
        ProtocolDef {
            name,
            default_endian,
            endian_mode,
            ports: Vec::new(),
            constants: Vec::new(),
            structs: Vec::new(),
            filters: Vec::new(),
            source_path: None,
            detected_endian: AtomicU8::new(DetectedEndian::Unknown.as_u8()),
            writeback_claimed: AtomicBool::new(false),
        }
    }

    pub fn find_struct(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|s| s.name == name)
    }

    pub fn find_constant(&self, name: &str) -> Option<u64> {
        self.constants.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn find_filter(&self, name: &str) -> Option<&FilterRule> {
        self.filters.iter().find(|f| f.name == name)
    }

    pub fn detected_endian(&self) -> DetectedEndian {
        DetectedEndian::from_u8(self.detected_endian.load(Ordering::Acquire))
    }

    /// CAS Unknown → `endian`. Returns true when this call was the detector;
    /// false when another thread got there first (or it was already set).
    /// Once away from Unknown the value never changes again.
    pub fn try_set_detected(&self, endian: DetectedEndian) -> bool {
        self.detected_endian
            .compare_exchange(
                DetectedEndian::Unknown.as_u8(),
                endian.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// One-shot claim of the endian writeback; true exactly once per
    /// ProtocolDef instance.
    pub fn claim_writeback(&self) -> bool {
        !self.writeback_claimed.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detected_endian_cas_is_monotonic() {
        let proto = ProtocolDef::new("t".into(), Endian::Big, EndianMode::Auto);
        assert_eq!(proto.detected_endian(), DetectedEndian::Unknown);

        assert!(proto.try_set_detected(DetectedEndian::Little));
        assert_eq!(proto.detected_endian(), DetectedEndian::Little);

        // A second detection attempt never overwrites the first.
        assert!(!proto.try_set_detected(DetectedEndian::Big));
        assert_eq!(proto.detected_endian(), DetectedEndian::Little);
    }

    #[test]
    fn writeback_claim_fires_once() {
        let proto = ProtocolDef::new("t".into(), Endian::Big, EndianMode::Auto);
        assert!(proto.claim_writeback());
        assert!(!proto.claim_writeback());
        assert!(!proto.claim_writeback());
    }

    #[test]
    fn opcode_endian_swap_is_involutive() {
        let ops = [
            OpCode::LoadU16Be,
            OpCode::LoadU32Le,
            OpCode::LoadI64Be,
            OpCode::LoadU8,
            OpCode::CmpEq,
            OpCode::Jump,
        ];
        for op in ops {
            assert_eq!(op.swap_endian().swap_endian(), op);
        }
        assert_eq!(OpCode::LoadU32Be.swap_endian(), OpCode::LoadU32Le);
        assert_eq!(OpCode::LoadU8.swap_endian(), OpCode::LoadU8);
    }
}
