//! PDEF tokenizer.
//!
//! Whitespace-separated tokens, `//` line comments, identifiers, decimal and
//! `0x` hex integers, double-quoted strings with `\"` escapes, and the
//! `@protocol` / `@const` / `@filter` directives.

use crate::parser::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    Number(u64),
    Str(String),

    // Type keywords
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Bytes,
    String_,
    VarBytes,
    In,

    // Directives
    AtProtocol,
    AtConst,
    AtFilter,

    // Punctuation and operators
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Assign,
    Semicolon,
    Comma,
    Dot,
    Amp,
    Not,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    Eof,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier '{}'", s),
            Token::Number(n) => format!("number {}", n),
            Token::Str(s) => format!("string \"{}\"", s),
            Token::Eof => "end of input".into(),
            other => format!("'{}'", other.glyph()),
        }
    }

    fn glyph(&self) -> &'static str {
        match self {
            Token::Uint8 => "uint8",
            Token::Uint16 => "uint16",
            Token::Uint32 => "uint32",
            Token::Uint64 => "uint64",
            Token::Int8 => "int8",
            Token::Int16 => "int16",
            Token::Int32 => "int32",
            Token::Int64 => "int64",
            Token::Bytes => "bytes",
            Token::String_ => "string",
            Token::VarBytes => "varbytes",
            Token::In => "in",
            Token::AtProtocol => "@protocol",
            Token::AtConst => "@const",
            Token::AtFilter => "@filter",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Assign => "=",
            Token::Semicolon => ";",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Amp => "&",
            Token::Not => "!",
            Token::EqEq => "==",
            Token::Ne => "!=",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            _ => "?",
        }
    }
}

/// A token plus the 1-based source line it started on.
#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
}

fn keyword(word: &str) -> Option<Token> {
    Some(match word {
        "uint8" => Token::Uint8,
        "uint16" => Token::Uint16,
        "uint32" => Token::Uint32,
        "uint64" => Token::Uint64,
        "int8" => Token::Int8,
        "int16" => Token::Int16,
        "int32" => Token::Int32,
        "int64" => Token::Int64,
        "bytes" => Token::Bytes,
        "string" => Token::String_,
        "varbytes" => Token::VarBytes,
        "in" => Token::In,
        _ => return None,
    })
}

/// Tokenize a complete PDEF source. Returns the token stream terminated by
/// `Eof`, or the first lexical error.
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ParseError> {
    let mut out = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line: u32 = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    // Line comment: skip to end of line.
                    for c in chars.by_ref() {
                        if c == '\n' {
                            line += 1;
                            break;
                        }
                    }
                } else {
                    return Err(ParseError::at(line, "unexpected '/'"));
                }
            }
            '#' => {
                // The endian writeback annotates its clause with a `#`
                // comment, so those must survive a re-parse.
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '@' => {
                chars.next();
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.as_str() {
                    "protocol" => Token::AtProtocol,
                    "const" => Token::AtConst,
                    "filter" => Token::AtFilter,
                    other => {
                        return Err(ParseError::at(line, format!("unknown directive '@{}'", other)))
                    }
                };
                out.push(Spanned { token, line });
            }
            '"' => {
                chars.next();
                let start_line = line;
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('"') => value.push('"'),
                            Some('\\') => value.push('\\'),
                            Some(other) => {
                                value.push('\\');
                                value.push(other);
                            }
                            None => break,
                        },
                        '\n' => {
                            line += 1;
                            value.push(c);
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(ParseError::at(start_line, "unterminated string literal"));
                }
                out.push(Spanned { token: Token::Str(value), line: start_line });
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                text.push(c);
                chars.next();
                let hex = c == '0' && matches!(chars.peek().copied(), Some('x') | Some('X'));
                if hex {
                    chars.next();
                    text.clear();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_hexdigit() {
                            text.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if text.is_empty() {
                        return Err(ParseError::at(line, "hex literal with no digits"));
                    }
                } else {
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_digit() {
                            text.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
                let radix = if hex { 16 } else { 10 };
                let value = u64::from_str_radix(&text, radix)
                    .map_err(|_| ParseError::at(line, format!("invalid number '{}'", text)))?;
                out.push(Spanned { token: Token::Number(value), line });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = keyword(&word).unwrap_or(Token::Ident(word));
                out.push(Spanned { token, line });
            }
            _ => {
                chars.next();
                let token = match c {
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ';' => Token::Semicolon,
                    ',' => Token::Comma,
                    '.' => Token::Dot,
                    '&' => Token::Amp,
                    '=' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::EqEq
                        } else {
                            Token::Assign
                        }
                    }
                    '!' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Ne
                        } else {
                            Token::Not
                        }
                    }
                    '<' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Le
                        } else {
                            Token::Lt
                        }
                    }
                    '>' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Ge
                        } else {
                            Token::Gt
                        }
                    }
                    other => {
                        return Err(ParseError::at(line, format!("unexpected character '{}'", other)))
                    }
                };
                out.push(Spanned { token, line });
            }
        }
    }

    out.push(Spanned { token: Token::Eof, line });
    Ok(out)
}
