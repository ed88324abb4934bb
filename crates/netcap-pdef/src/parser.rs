//! PDEF parser and bytecode compiler.
//!
//! Parsing happens in three passes: block parsing into raw structs/filters,
//! struct flattening (nested members expanded inline with absolute offsets),
//! and filter compilation into the VM bytecode. Filters compile to a
//! big-endian instruction sequence plus a little-endian variant produced by
//! swapping the load opcodes.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::lexer::{tokenize, Spanned, Token};
use crate::types::{
    Endian, EndianMode, Field, FieldType, FilterRule, Instruction, OpCode, ProtocolDef, StructDef,
};

/// Parse failure with the 1-based source line it was detected on.
#[derive(Debug, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl ParseError {
    pub fn at(line: u32, message: impl Into<String>) -> ParseError {
        ParseError { line, message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Mask,
    In,
    NotIn,
}

#[derive(Debug)]
struct Condition {
    field: String,
    op: CondOp,
    value: u64,
    mask: u64,
    values: Vec<u64>,
}

#[derive(Debug)]
struct RawFilter {
    name: String,
    conditions: Vec<Condition>,
    sliding: bool,
    sliding_max: u32,
}

#[derive(Debug)]
struct RawField {
    ty: FieldType,
    /// Struct name for nested fields.
    type_name: String,
    name: String,
    size: u32,
    is_array: bool,
    array_size: u32,
}

#[derive(Debug)]
struct RawStruct {
    name: String,
    fields: Vec<RawField>,
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    proto_name: String,
    default_endian: Endian,
    endian_mode: EndianMode,
    endian_set: bool,
    constants: Vec<(String, u64)>,
    const_index: HashMap<String, u64>,
    raw_structs: Vec<RawStruct>,
    raw_filters: Vec<RawFilter>,
}

impl Parser {
    fn new(source: &str) -> Result<Parser, ParseError> {
        Ok(Parser {
            tokens: tokenize(source)?,
            pos: 0,
            proto_name: String::new(),
            default_endian: Endian::Big,
            endian_mode: EndianMode::Auto,
            endian_set: false,
            constants: Vec::new(),
            const_index: HashMap::new(),
            raw_structs: Vec::new(),
            raw_filters: Vec::new(),
        })
    }

    fn cur(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos].token.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), ParseError> {
        if *self.cur() == want {
            self.bump();
            Ok(())
        } else {
            Err(ParseError::at(
                self.line(),
                format!("expected {}, got {}", want.describe(), self.cur().describe()),
            ))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.bump() {
            Token::Ident(s) => Ok(s),
            other => Err(ParseError::at(
                self.line(),
                format!("expected {}, got {}", what, other.describe()),
            )),
        }
    }

    fn expect_number(&mut self, what: &str) -> Result<u64, ParseError> {
        match self.bump() {
            Token::Number(n) => Ok(n),
            other => Err(ParseError::at(
                self.line(),
                format!("expected {}, got {}", what, other.describe()),
            )),
        }
    }

    /// Number literal or constant reference.
    fn expect_value(&mut self, what: &str) -> Result<u64, ParseError> {
        let line = self.line();
        match self.bump() {
            Token::Number(n) => Ok(n),
            Token::Ident(name) => self
                .const_index
                .get(&name)
                .copied()
                .ok_or_else(|| ParseError::at(line, format!("undefined constant '{}'", name))),
            other => {
                Err(ParseError::at(line, format!("expected {}, got {}", what, other.describe())))
            }
        }
    }

    fn eat_semicolon(&mut self) {
        if *self.cur() == Token::Semicolon {
            self.bump();
        }
    }

    // ── Block parsers ───────────────────────────────────────────────────

    fn parse_protocol_block(&mut self) -> Result<(), ParseError> {
        self.expect(Token::AtProtocol)?;
        self.expect(Token::LBrace)?;

        while *self.cur() != Token::RBrace {
            let line = self.line();
            let key = self.expect_ident("metadata key in @protocol block")?;
            // The `=` is optional so an auto-written `endian little;`
            // clause parses back.
            if *self.cur() == Token::Assign {
                self.bump();
            }

            match key.as_str() {
                "name" => match self.bump() {
                    Token::Str(s) | Token::Ident(s) => self.proto_name = s,
                    other => {
                        return Err(ParseError::at(
                            line,
                            format!("expected protocol name, got {}", other.describe()),
                        ))
                    }
                },
                "endian" => {
                    let value = self.expect_ident("'big', 'little' or 'auto'")?;
                    match value.as_str() {
                        "big" => {
                            self.default_endian = Endian::Big;
                            self.endian_mode = EndianMode::Big;
                        }
                        "little" => {
                            self.default_endian = Endian::Little;
                            self.endian_mode = EndianMode::Little;
                        }
                        "auto" => {
                            self.default_endian = Endian::Big;
                            self.endian_mode = EndianMode::Auto;
                        }
                        other => {
                            return Err(ParseError::at(
                                line,
                                format!("expected 'big', 'little' or 'auto' for endian, got '{}'", other),
                            ))
                        }
                    }
                    self.endian_set = true;
                }
                "ports" => {
                    // Deprecated: consume the list but keep no ports. Port
                    // selection is BPF's job; PDEF filters content only.
                    warn!(protocol = %self.proto_name,
                          "'ports' in @protocol is deprecated and ignored; use a BPF or port_filter");
                    loop {
                        self.expect_number("port number")?;
                        if *self.cur() == Token::Comma {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                other => {
                    return Err(ParseError::at(line, format!("unknown protocol metadata key: {}", other)))
                }
            }
            self.eat_semicolon();
        }

        self.expect(Token::RBrace)
    }

    fn parse_const_block(&mut self) -> Result<(), ParseError> {
        self.expect(Token::AtConst)?;
        self.expect(Token::LBrace)?;

        while *self.cur() != Token::RBrace {
            let name = self.expect_ident("constant name")?;
            self.expect(Token::Assign)?;
            let value = self.expect_number("constant value")?;
            self.const_index.insert(name.clone(), value);
            self.constants.push((name, value));
            self.eat_semicolon();
        }

        self.expect(Token::RBrace)
    }

    /// Dotted field path with optional array indices: `items[0].id`.
    fn parse_field_path(&mut self) -> Result<String, ParseError> {
        let mut path = self.expect_ident("field name")?;
        loop {
            match self.cur() {
                Token::LBracket => {
                    self.bump();
                    let idx = self.expect_number("array index")?;
                    self.expect(Token::RBracket)?;
                    path.push_str(&format!("[{}]", idx));
                }
                Token::Dot => {
                    self.bump();
                    let part = self.expect_ident("field name after '.'")?;
                    path.push('.');
                    path.push_str(&part);
                }
                _ => return Ok(path),
            }
        }
    }

    fn parse_filter_block(&mut self) -> Result<(), ParseError> {
        self.expect(Token::AtFilter)?;
        let name = self.expect_ident("filter name")?;
        self.expect(Token::LBrace)?;

        let mut filter = RawFilter { name, conditions: Vec::new(), sliding: false, sliding_max: 0 };

        while *self.cur() != Token::RBrace {
            let line = self.line();

            // Sliding-window configuration keys.
            let config_key = match self.cur() {
                Token::Ident(w) if w == "sliding" || w == "sliding_max" => w.clone(),
                _ => String::new(),
            };
            if !config_key.is_empty() {
                self.bump();
                self.expect(Token::Assign)?;
                if config_key == "sliding" {
                    filter.sliding = match self.bump() {
                        Token::Ident(v) if v == "true" => true,
                        Token::Ident(v) if v == "false" => false,
                        Token::Number(n) => n != 0,
                        other => {
                            return Err(ParseError::at(
                                line,
                                format!("expected boolean for sliding, got {}", other.describe()),
                            ))
                        }
                    };
                } else {
                    filter.sliding_max = self.expect_number("number for sliding_max")? as u32;
                }
                self.eat_semicolon();
                continue;
            }

            let field = self.parse_field_path()?;
            let cond = match self.cur().clone() {
                Token::Amp => {
                    self.bump();
                    let mask = self.expect_value("mask value")?;
                    self.expect(Token::Assign)?;
                    let value = self.expect_value("expected value after mask")?;
                    Condition { field, op: CondOp::Mask, value, mask, values: Vec::new() }
                }
                Token::Not | Token::In => {
                    let negate = if *self.cur() == Token::Not {
                        self.bump();
                        if *self.cur() != Token::In {
                            return Err(ParseError::at(line, "expected 'in' after '!'"));
                        }
                        true
                    } else {
                        false
                    };
                    self.bump(); // 'in'
                    self.expect(Token::LBracket)?;
                    let mut values = Vec::new();
                    loop {
                        values.push(self.expect_value("value in list")?);
                        match self.bump() {
                            Token::Comma => continue,
                            Token::RBracket => break,
                            other => {
                                return Err(ParseError::at(
                                    line,
                                    format!("expected ',' or ']' in list, got {}", other.describe()),
                                ))
                            }
                        }
                    }
                    if values.is_empty() {
                        return Err(ParseError::at(line, "empty value list is not allowed"));
                    }
                    Condition {
                        field,
                        op: if negate { CondOp::NotIn } else { CondOp::In },
                        value: 0,
                        mask: 0,
                        values,
                    }
                }
                other => {
                    let op = match other {
                        Token::Assign | Token::EqEq => CondOp::Eq,
                        Token::Ne => CondOp::Ne,
                        Token::Gt => CondOp::Gt,
                        Token::Ge => CondOp::Ge,
                        Token::Lt => CondOp::Lt,
                        Token::Le => CondOp::Le,
                        other => {
                            return Err(ParseError::at(
                                line,
                                format!("expected comparison operator, got {}", other.describe()),
                            ))
                        }
                    };
                    self.bump();
                    let value = self.expect_value("comparison value")?;
                    Condition { field, op, value, mask: 0, values: Vec::new() }
                }
            };
            filter.conditions.push(cond);
            self.eat_semicolon();
        }

        self.expect(Token::RBrace)?;
        self.raw_filters.push(filter);
        Ok(())
    }

    fn parse_struct_def(&mut self) -> Result<(), ParseError> {
        let name = self.expect_ident("struct name")?;
        self.expect(Token::LBrace)?;

        let mut fields: Vec<RawField> = Vec::new();
        let mut has_variable = false;

        while *self.cur() != Token::RBrace {
            let line = self.line();
            if has_variable {
                return Err(ParseError::at(
                    line,
                    format!("variable-length field must be the last field in struct '{}'", name),
                ));
            }

            let (ty, type_name) = match self.bump() {
                Token::Uint8 => (FieldType::U8, String::new()),
                Token::Uint16 => (FieldType::U16, String::new()),
                Token::Uint32 => (FieldType::U32, String::new()),
                Token::Uint64 => (FieldType::U64, String::new()),
                Token::Int8 => (FieldType::I8, String::new()),
                Token::Int16 => (FieldType::I16, String::new()),
                Token::Int32 => (FieldType::I32, String::new()),
                Token::Int64 => (FieldType::I64, String::new()),
                Token::Bytes => (FieldType::Bytes, String::new()),
                Token::String_ => (FieldType::Str, String::new()),
                Token::VarBytes => (FieldType::VarBytes, String::new()),
                Token::Ident(s) => (FieldType::Nested, s),
                other => {
                    return Err(ParseError::at(
                        line,
                        format!("expected field type, got {}", other.describe()),
                    ))
                }
            };

            // Fixed-size runs take their size from the [N] suffix on the type.
            let mut size = ty.size();
            if ty == FieldType::Bytes || ty == FieldType::Str {
                self.expect(Token::LBracket)?;
                size = self.expect_number("size for bytes/string")? as u32;
                self.expect(Token::RBracket)?;
            }

            let field_name = self.expect_ident("field name")?;

            let mut is_array = false;
            let mut array_size = 1u32;
            if *self.cur() == Token::LBracket {
                if ty != FieldType::Nested {
                    return Err(ParseError::at(
                        line,
                        "array syntax is only supported for nested struct fields",
                    ));
                }
                self.bump();
                array_size = self.expect_number("array size")? as u32;
                if array_size == 0 {
                    return Err(ParseError::at(line, "array size must be greater than 0"));
                }
                self.expect(Token::RBracket)?;
                is_array = true;
            }

            if ty == FieldType::VarBytes {
                has_variable = true;
            }

            fields.push(RawField { ty, type_name, name: field_name, size, is_array, array_size });
            self.eat_semicolon();
        }

        self.expect(Token::RBrace)?;
        self.raw_structs.push(RawStruct { name, fields });
        Ok(())
    }

    // ── Flattening ──────────────────────────────────────────────────────

    /// Expand nested structs inline, producing absolute offsets and dotted
    /// field names. Referenced structs must be defined before use.
    fn flatten(&self) -> Result<Vec<StructDef>, ParseError> {
        let mut flattened: Vec<StructDef> = Vec::new();

        for raw in &self.raw_structs {
            let mut fields: Vec<Field> = Vec::new();
            let mut offset = 0u32;
            let mut variable_seen = false;
            let mut has_variable = false;

            for f in &raw.fields {
                if variable_seen {
                    return Err(ParseError::at(
                        0,
                        format!(
                            "variable-length field '{}' must be last in struct '{}'",
                            f.name, raw.name
                        ),
                    ));
                }

                if f.ty == FieldType::Nested {
                    let nested = flattened
                        .iter()
                        .find(|s| s.name == f.type_name)
                        .ok_or_else(|| {
                            ParseError::at(0, format!("nested struct '{}' not found", f.type_name))
                        })?
                        .clone();

                    if nested.has_variable && f.array_size > 1 {
                        return Err(ParseError::at(
                            0,
                            format!(
                                "array of variable-length struct '{}' is not supported in '{}'",
                                f.type_name, raw.name
                            ),
                        ));
                    }

                    let repeat = if f.is_array { f.array_size } else { 1 };
                    for idx in 0..repeat {
                        let prefix = if f.is_array {
                            format!("{}[{}]", f.name, idx)
                        } else {
                            f.name.clone()
                        };
                        let base = offset + idx * nested.min_size;
                        for nf in &nested.fields {
                            fields.push(Field {
                                name: format!("{}.{}", prefix, nf.name),
                                ty: nf.ty,
                                offset: base + nf.offset,
                                size: nf.size,
                                endian: nf.endian,
                                is_variable: nf.is_variable,
                            });
                        }
                    }

                    if nested.has_variable {
                        variable_seen = true;
                        has_variable = true;
                    }
                    offset += nested.min_size * repeat;
                } else {
                    if f.is_array {
                        return Err(ParseError::at(
                            0,
                            format!(
                                "arrays are only supported for nested struct fields (field '{}' in struct '{}')",
                                f.name, raw.name
                            ),
                        ));
                    }

                    let is_variable = f.ty == FieldType::VarBytes;
                    fields.push(Field {
                        name: f.name.clone(),
                        ty: f.ty,
                        offset,
                        size: f.size,
                        endian: self.default_endian,
                        is_variable,
                    });

                    if is_variable {
                        variable_seen = true;
                        has_variable = true;
                    } else {
                        offset += f.size;
                    }
                }
            }

            flattened.push(StructDef { name: raw.name.clone(), fields, min_size: offset, has_variable });
        }

        Ok(flattened)
    }

    // ── Compilation ─────────────────────────────────────────────────────

    fn load_opcode(field: &Field) -> OpCode {
        match field.ty {
            FieldType::U8 => OpCode::LoadU8,
            FieldType::U16 => pick(field.endian, OpCode::LoadU16Be, OpCode::LoadU16Le),
            FieldType::U32 => pick(field.endian, OpCode::LoadU32Be, OpCode::LoadU32Le),
            FieldType::U64 => pick(field.endian, OpCode::LoadU64Be, OpCode::LoadU64Le),
            FieldType::I8 => OpCode::LoadI8,
            FieldType::I16 => pick(field.endian, OpCode::LoadI16Be, OpCode::LoadI16Le),
            FieldType::I32 => pick(field.endian, OpCode::LoadI32Be, OpCode::LoadI32Le),
            FieldType::I64 => pick(field.endian, OpCode::LoadI64Be, OpCode::LoadI64Le),
            _ => OpCode::LoadU8,
        }
    }

    fn cmp_opcode(op: CondOp) -> OpCode {
        match op {
            CondOp::Ne => OpCode::CmpNe,
            CondOp::Gt => OpCode::CmpGt,
            CondOp::Ge => OpCode::CmpGe,
            CondOp::Lt => OpCode::CmpLt,
            CondOp::Le => OpCode::CmpLe,
            CondOp::Mask => OpCode::CmpMask,
            _ => OpCode::CmpEq,
        }
    }

    fn compile(&self, structs: &[StructDef]) -> Result<Vec<FilterRule>, ParseError> {
        let mut rules = Vec::with_capacity(self.raw_filters.len());

        for raw in &self.raw_filters {
            // The target struct is the first one containing the first
            // condition's field; all other fields must come from it too.
            let target = raw
                .conditions
                .first()
                .and_then(|c0| structs.iter().find(|s| s.find_field(&c0.field).is_some()))
                .ok_or_else(|| {
                    ParseError::at(0, format!("cannot find struct for filter '{}'", raw.name))
                })?;

            // Instruction budget per condition, shared success/fail epilogue.
            let mut sizes = Vec::with_capacity(raw.conditions.len());
            let mut total = 2u32;
            for cond in &raw.conditions {
                let n = match cond.op {
                    CondOp::In => 3 * cond.values.len() as u32,
                    CondOp::NotIn => 1 + 3 * cond.values.len() as u32,
                    _ => 3,
                };
                sizes.push(n);
                total += n;
            }

            let success = total - 2;
            let fail = total - 1;
            let mut starts = Vec::with_capacity(raw.conditions.len());
            let mut acc = 0u32;
            for n in &sizes {
                starts.push(acc);
                acc += n;
            }

            let mut code = vec![Instruction::ret(false); total as usize];

            for (j, cond) in raw.conditions.iter().enumerate() {
                let field = target.find_field(&cond.field).ok_or_else(|| {
                    ParseError::at(
                        0,
                        format!("field '{}' not found in struct '{}'", cond.field, target.name),
                    )
                })?;
                let next_start = starts.get(j + 1).copied().unwrap_or(success);
                let mut idx = starts[j] as usize;

                code[idx] = Instruction::load(Self::load_opcode(field), field.offset);
                idx += 1;

                match cond.op {
                    CondOp::In => {
                        let count = cond.values.len();
                        for (v, value) in cond.values.iter().enumerate() {
                            code[idx] = Instruction::cmp(OpCode::CmpEq, *value);
                            idx += 1;
                            if v + 1 < count {
                                // Not this value: skip the success-jump and
                                // try the next one.
                                code[idx] = Instruction::jump_if_false(idx as u32 + 2);
                                idx += 1;
                                code[idx] = Instruction::jump(next_start);
                                idx += 1;
                            } else {
                                code[idx] = Instruction::jump_if_false(fail);
                                idx += 1;
                            }
                        }
                    }
                    CondOp::NotIn => {
                        let count = cond.values.len();
                        for (v, value) in cond.values.iter().enumerate() {
                            code[idx] = Instruction::cmp(OpCode::CmpEq, *value);
                            idx += 1;
                            let miss = if v + 1 < count { idx as u32 + 2 } else { next_start };
                            code[idx] = Instruction::jump_if_false(miss);
                            idx += 1;
                            // Value present in the exclusion list: fail.
                            code[idx] = Instruction::jump(fail);
                            idx += 1;
                        }
                    }
                    CondOp::Mask => {
                        code[idx] = Instruction::mask(cond.mask, cond.value);
                        idx += 1;
                        code[idx] = Instruction::jump_if_false(fail);
                    }
                    _ => {
                        code[idx] = Instruction::cmp(Self::cmp_opcode(cond.op), cond.value);
                        idx += 1;
                        code[idx] = Instruction::jump_if_false(fail);
                    }
                }
            }

            code[success as usize] = Instruction::ret(true);
            code[fail as usize] = Instruction::ret(false);

            // The compiled loads follow the protocol's default endian; the
            // opposite variant is derived by swapping them, so `bytecode_be`
            // always carries BE loads and `bytecode_le` LE loads whatever
            // the default was.
            let swapped: Vec<Instruction> = code
                .iter()
                .map(|ins| Instruction { opcode: ins.opcode.swap_endian(), ..*ins })
                .collect();
            let (bytecode_be, bytecode_le) = match self.default_endian {
                Endian::Big => (code, swapped),
                Endian::Little => (swapped, code),
            };

            rules.push(FilterRule {
                name: raw.name.clone(),
                struct_name: target.name.clone(),
                bytecode_be,
                bytecode_le,
                min_packet_size: target.min_size,
                sliding_window: raw.sliding,
                sliding_max_offset: raw.sliding_max,
            });
        }

        Ok(rules)
    }

    fn finish(mut self) -> Result<ProtocolDef, ParseError> {
        loop {
            match self.cur().clone() {
                Token::Eof => break,
                Token::AtProtocol => self.parse_protocol_block()?,
                Token::AtConst => self.parse_const_block()?,
                Token::AtFilter => self.parse_filter_block()?,
                Token::Ident(_) => self.parse_struct_def()?,
                other => {
                    return Err(ParseError::at(
                        self.line(),
                        format!("unexpected {} at top level", other.describe()),
                    ))
                }
            }
        }

        if !self.endian_set {
            debug!(protocol = %self.proto_name,
                   "endian not specified; defaulting to auto-detect (big-endian tried first)");
        }

        let structs = self.flatten()?;
        let filters = self.compile(&structs)?;

        let mut proto =
            ProtocolDef::new(self.proto_name.clone(), self.default_endian, self.endian_mode);
        proto.constants = self.constants;
        proto.structs = structs;
        proto.filters = filters;
        Ok(proto)
    }
}

fn pick(endian: Endian, be: OpCode, le: OpCode) -> OpCode {
    if endian == Endian::Big {
        be
    } else {
        le
    }
}

/// Parse PDEF source text into a compiled protocol.
pub fn parse_str(source: &str) -> Result<ProtocolDef, ParseError> {
    Parser::new(source)?.finish()
}

/// Parse a PDEF file; the path is remembered on the protocol for the AUTO
/// endian writeback.
pub fn parse_file(path: &Path) -> Result<ProtocolDef, ParseError> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| ParseError::at(0, format!("failed to read {}: {}", path.display(), e)))?;
    let mut proto = parse_str(&source)?;
    proto.source_path = Some(path.to_path_buf());
    Ok(proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::execute_filter;

    const SIMPLE: &str = r#"
        @protocol {
            name = "SimpleProtocol";
            endian = big;
        }

        @const {
            MAGIC = 0x12345678;
            VERSION_1 = 1;
        }

        Header {
            uint32 magic;
            uint8 version;
            uint8 flags;
            uint16 length;
        }

        Packet {
            Header header;
            varbytes payload;
        }

        @filter MagicMatch {
            header.magic = MAGIC;
            header.version = VERSION_1;
        }
    "#;

    #[test]
    fn parse_simple_protocol() {
        let proto = parse_str(SIMPLE).unwrap();
        assert_eq!(proto.name, "SimpleProtocol");
        assert_eq!(proto.endian_mode, EndianMode::Big);
        assert_eq!(proto.structs.len(), 2);
        assert_eq!(proto.find_constant("MAGIC"), Some(0x1234_5678));

        let header = proto.find_struct("Header").unwrap();
        assert_eq!(header.fields.len(), 4);
        assert_eq!(header.min_size, 8);
        assert!(!header.has_variable);

        let packet = proto.find_struct("Packet").unwrap();
        assert_eq!(packet.min_size, 8);
        assert!(packet.has_variable);
        assert_eq!(packet.fields[0].name, "header.magic");
        assert_eq!(packet.fields[3].name, "header.length");
        assert_eq!(packet.fields[3].offset, 6);
    }

    #[test]
    fn filter_compiles_against_nested_path() {
        let proto = parse_str(SIMPLE).unwrap();
        let rule = proto.find_filter("MagicMatch").unwrap();
        assert_eq!(rule.struct_name, "Packet");
        assert_eq!(rule.min_packet_size, 8);
        // 2 simple conditions * 3 + success + fail
        assert_eq!(rule.bytecode_be.len(), 8);

        let mut packet = vec![0x12, 0x34, 0x56, 0x78, 0x01, 0x00, 0x00, 0x10];
        assert!(execute_filter(&packet, rule));
        packet[4] = 0x02;
        assert!(!execute_filter(&packet, rule));
        packet[4] = 0x01;
        packet[0] = 0xFF;
        assert!(!execute_filter(&packet, rule));
    }

    #[test]
    fn in_and_not_in_lists() {
        let src = r#"
            @protocol { name = "InProto"; endian = big; }
            Packet { uint8 type; uint8 code; }
            @filter InList { type in [1, 2, 3]; }
            @filter NotInList { code !in [0xFF, 0x10]; }
        "#;
        let proto = parse_str(src).unwrap();
        let in_rule = proto.find_filter("InList").unwrap();
        let not_in_rule = proto.find_filter("NotInList").unwrap();

        let mut packet = vec![0x02u8, 0x11];
        assert!(execute_filter(&packet, in_rule));
        packet[0] = 0x09;
        assert!(!execute_filter(&packet, in_rule));

        let mut packet2 = vec![0x01u8, 0xFF];
        assert!(!execute_filter(&packet2, not_in_rule));
        packet2[1] = 0x01;
        assert!(execute_filter(&packet2, not_in_rule));
    }

    #[test]
    fn nested_arrays_flatten_with_indexed_names() {
        let src = r#"
            @protocol { name = "ArrayProto"; endian = big; }
            Item { uint16 id; uint16 count; }
            Inventory { Item items[2]; }
            @filter FirstItem { items[0].id = 0x0010; }
            @filter SecondCount { items[1].count > 100; }
        "#;
        let proto = parse_str(src).unwrap();
        let inv = proto.find_struct("Inventory").unwrap();
        assert_eq!(inv.fields.len(), 4);
        assert_eq!(inv.fields[0].name, "items[0].id");
        assert_eq!(inv.fields[0].offset, 0);
        assert_eq!(inv.fields[1].name, "items[0].count");
        assert_eq!(inv.fields[1].offset, 2);
        assert_eq!(inv.fields[2].name, "items[1].id");
        assert_eq!(inv.fields[2].offset, 4);
        assert_eq!(inv.fields[3].name, "items[1].count");
        assert_eq!(inv.fields[3].offset, 6);
        assert_eq!(inv.min_size, 8);

        let first = proto.find_filter("FirstItem").unwrap();
        let second = proto.find_filter("SecondCount").unwrap();

        let mut packet = vec![0x00, 0x10, 0x00, 0x02, 0x00, 0x01, 0x00, 0x65];
        assert!(execute_filter(&packet, first));
        packet[1] = 0x11;
        assert!(!execute_filter(&packet, first));

        packet[1] = 0x10;
        assert!(execute_filter(&packet, second));
        packet[7] = 0x01;
        assert!(!execute_filter(&packet, second));
    }

    #[test]
    fn varbytes_must_be_last() {
        let src = r#"
            @protocol { name = "BadVar"; endian = big; }
            Inner { uint8 len; varbytes payload; }
            Outer { uint8 prefix; Inner data; uint8 tail; }
        "#;
        let err = parse_str(src).unwrap_err();
        assert!(err.message.to_lowercase().contains("variable-length"), "{}", err);
    }

    #[test]
    fn varbytes_in_middle_of_struct_rejected() {
        let src = r#"
            @protocol { name = "Bad"; endian = big; }
            P { uint8 a; varbytes b; uint8 c; }
        "#;
        assert!(parse_str(src).is_err());
    }

    #[test]
    fn deprecated_ports_accepted_and_ignored() {
        let src = r#"
            @protocol { name = "Legacy"; endian = big; ports = 8080, 8081; }
            P { uint8 a; }
            @filter A { a = 1; }
        "#;
        let proto = parse_str(src).unwrap();
        assert!(proto.ports.is_empty());
    }

    #[test]
    fn endian_defaults_to_auto() {
        let src = r#"
            P { uint16 a; }
            @filter A { a = 1; }
        "#;
        let proto = parse_str(src).unwrap();
        assert_eq!(proto.endian_mode, EndianMode::Auto);
        assert_eq!(proto.default_endian, Endian::Big);
    }

    #[test]
    fn little_endian_protocol_loads_le() {
        let src = r#"
            @protocol { name = "LE"; endian = little; }
            P { uint16 a; }
            @filter A { a = 0x1234; }
        "#;
        let proto = parse_str(src).unwrap();
        let rule = proto.find_filter("A").unwrap();
        // Variants are normalized: BE bytecode carries BE loads even for a
        // little-endian protocol.
        assert_eq!(rule.bytecode_be[0].opcode, OpCode::LoadU16Be);
        assert_eq!(rule.bytecode_le[0].opcode, OpCode::LoadU16Le);

        // Forced-little protocols match via the LE variant.
        let le_packet = [0x34u8, 0x12];
        assert!(crate::vm::protocol_match(&le_packet, 0, &proto));
        let be_packet = [0x12u8, 0x34];
        assert!(!crate::vm::protocol_match(&be_packet, 0, &proto));
    }

    #[test]
    fn written_back_endian_clause_reparses() {
        // The shape produced by the endian writeback: no '=', '#' comment.
        let src = "@protocol {\n    endian little;  # auto-detected on 2025-01-01 00:00:00\n    name = \"W\";\n}\nP { uint16 a; }\n@filter F { a = 1; }\n";
        let proto = parse_str(src).unwrap();
        assert_eq!(proto.endian_mode, EndianMode::Little);
        assert_eq!(proto.name, "W");
    }

    #[test]
    fn undefined_constant_rejected() {
        let src = r#"
            P { uint8 a; }
            @filter A { a = NOPE; }
        "#;
        assert!(parse_str(src).is_err());
    }

    #[test]
    fn unknown_field_in_filter_rejected() {
        let src = r#"
            P { uint8 a; }
            @filter A { missing = 1; }
        "#;
        let err = parse_str(src).unwrap_err();
        assert!(err.message.contains("cannot find struct"), "{}", err);
    }

    #[test]
    fn sliding_configuration_parsed() {
        let src = r#"
            P { uint32 magic; }
            @filter S { sliding = true; sliding_max = 64; magic = 0xCAFE; }
        "#;
        let proto = parse_str(src).unwrap();
        let rule = proto.find_filter("S").unwrap();
        assert!(rule.sliding_window);
        assert_eq!(rule.sliding_max_offset, 64);
    }

    #[test]
    fn mask_condition_compiles() {
        let src = r#"
            P { uint32 flags; }
            @filter Masked { flags & 0xFF00FF00 = 0x12005600; }
        "#;
        let proto = parse_str(src).unwrap();
        let rule = proto.find_filter("Masked").unwrap();
        assert_eq!(rule.bytecode_be[1].opcode, OpCode::CmpMask);
        assert_eq!(rule.bytecode_be[1].operand, 0xFF00_FF00);
        assert_eq!(rule.bytecode_be[1].operand2, 0x1200_5600);

        let packet = [0x12u8, 0x34, 0x56, 0x78];
        assert!(execute_filter(&packet, rule));
        let packet_bad = [0x13u8, 0x34, 0x56, 0x78];
        assert!(!execute_filter(&packet_bad, rule));
    }

    #[test]
    fn parsing_is_deterministic() {
        let a = parse_str(SIMPLE).unwrap();
        let b = parse_str(SIMPLE).unwrap();
        let ra = a.find_filter("MagicMatch").unwrap();
        let rb = b.find_filter("MagicMatch").unwrap();
        assert_eq!(ra.bytecode_be, rb.bytecode_be);
        assert_eq!(ra.bytecode_le, rb.bytecode_le);
        assert_eq!(
            crate::disasm::disassemble_rule(ra),
            crate::disasm::disassemble_rule(rb)
        );
    }
}
