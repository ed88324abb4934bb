//! PDEF — a small textual protocol-definition language compiled into packet
//! filter bytecode.
//!
//! A PDEF source declares packed structs, constants and filter rules; the
//! parser flattens nested structs into absolute offsets and compiles each
//! rule into bytecode for the [`vm`] executor, in both big- and
//! little-endian variants so AUTO-mode protocols can settle their byte order
//! at runtime.

pub mod disasm;
pub mod lexer;
pub mod parser;
pub mod types;
pub mod vm;

pub use disasm::{disassemble, disassemble_rule};
pub use parser::{parse_file, parse_str, ParseError};
pub use types::{
    DetectedEndian, Endian, EndianMode, Field, FieldType, FilterRule, Instruction, OpCode,
    ProtocolDef, StructDef,
};
pub use vm::{execute_bytecode, execute_filter, protocol_match};
