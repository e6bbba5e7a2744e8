//! The token definition for the federated query language.

/// A token is a single unit of the language, with a specific kind and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
}

/// The kind of a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    // Keywords
    Select,
    Distinct,
    From,
    Where,
    Group,
    Order,
    By,
    Asc,
    Desc,
    Limit,
    And,
    Or,
    Not,
    In,
    Like,
    Between,
    Is,
    Null,
    True,
    False,

    // Literals
    Identifier(&'a str),
    String(&'a str), // Content between the quotes, escapes not yet resolved
    Integer(i64),
    Float(f64),

    // Punctuation
    LParen, // (
    RParen, // )
    Comma,  // ,
    Star,   // *

    // Operators
    Eq,    // =
    NotEq, // != or <>
    Gt,    // >
    Lt,    // <
    Gte,   // >=
    Lte,   // <=

    // Special
    Illegal, // An illegal/unknown character or an unterminated literal
}

impl TokenKind<'_> {
    /// Human readable name used in parse errors.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Identifier(name) => format!("identifier '{}'", name),
            TokenKind::String(s) => format!("string '{}'", s),
            TokenKind::Integer(n) => format!("number {}", n),
            TokenKind::Float(n) => format!("number {}", n),
            TokenKind::Illegal => "illegal character".to_string(),
            other => format!("{:?}", other).to_uppercase(),
        }
    }
}

/// Represents a span in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// The starting byte offset.
    pub start: usize,
    /// The ending byte offset.
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}
