//! 查询语言的语法分析器
//!
//! ## 解析流程图
//!
//! ```text
//! parse()
//!   ├─ [SELECT [DISTINCT] (* | 列名列表)]
//!   ├─ FROM 数据源 (, 数据源)*
//!   ├─ [WHERE parse_or_expression()]
//!   │            └─ parse_and_expression()
//!   │                 └─ parse_primary_expression()
//!   │                      ├─ "(" → 分组表达式 (递归调用 parse_or_expression)
//!   │                      └─ 字段名 → parse_predicate()
//!   │                                   ├─ 比较运算符 + 字面值
//!   │                                   ├─ [NOT] IN (值列表)
//!   │                                   ├─ [NOT] LIKE 字符串
//!   │                                   └─ BETWEEN 字面值 AND 字面值
//!   ├─ [GROUP BY 字段 (, 字段)*]
//!   ├─ [ORDER BY 字段 [ASC|DESC] (, ...)*]
//!   └─ [LIMIT [offset,] rowcount]
//! ```
//!
//! ## 语法优先级（从高到低）
//!
//! 1. **括号分组** `(expression)`
//! 2. **比较操作** `field = value`, `field IN (...)`, `field BETWEEN a AND b`
//! 3. **AND操作** `expr1 AND expr2`
//! 4. **OR操作** `expr1 OR expr2`
//!
//! `BETWEEN` 自己消费其中的 `AND`, 因此 `a BETWEEN 1 AND 2 AND b = 3`
//! 会被解析为 `(a BETWEEN 1 AND 2) AND (b = 3)`。
//!
//! `NOT`、`IS [NOT] NULL` 与函数调用不受支持, 解析时直接报错。

use crate::ast::{CompOp, Expr, Identifier, Limit, Literal, OrderBy, Statement};
use crate::lexer::Lexer;
use crate::token::{Span, Token, TokenKind};
use std::fmt;

pub struct Parser<'a> {
    tokens: &'a [Token<'a>],
    position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Option<Span>,
}

impl ParseError {
    fn new(message: String, span: Option<Span>) -> Self {
        Self { message, span }
    }

    fn at_position(message: String, span: Span) -> Self {
        Self { message, span: Some(span) }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span {
            Some(span) => write!(f, "{} at position {}", self.message, span.start),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// 词法分析与语法分析一步完成
pub fn parse_statement(input: &str) -> Result<Statement, ParseError> {
    let tokens: Vec<_> = Lexer::new(input).collect();
    Parser::new(&tokens).parse()
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token<'a>]) -> Self {
        Self { tokens, position: 0 }
    }

    /// 返回当前 token，不推进位置
    fn peek(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position)
    }

    /// 返回当前 token 并推进位置
    fn advance(&mut self) -> Option<&'a Token<'a>> {
        let token = self.tokens.get(self.position)?;
        self.position += 1;
        Some(token)
    }

    /// 期望特定类型的 token 并推进，否则返回错误
    fn expect(&mut self, expected: TokenKind) -> Result<&'a Token<'a>, ParseError> {
        match self.tokens.get(self.position) {
            Some(token) if std::mem::discriminant(&token.kind) == std::mem::discriminant(&expected) => {
                self.position += 1;
                Ok(token)
            }
            Some(token) => Err(unexpected(&format!("{:?}", expected).to_uppercase(), token)),
            None => Err(ParseError::new(
                format!("Expected {}, but reached end of input", format!("{:?}", expected).to_uppercase()),
                None,
            )),
        }
    }

    /// 检查当前 token 是否匹配给定类型
    fn match_token(&self, kind: &TokenKind) -> bool {
        self.peek()
            .is_some_and(|token| std::mem::discriminant(&token.kind) == std::mem::discriminant(kind))
    }

    /// 当前 token 匹配时消费它
    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.match_token(kind) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    pub fn parse(&mut self) -> Result<Statement, ParseError> {
        if let Some(token) = self.tokens.iter().find(|t| t.kind == TokenKind::Illegal) {
            return Err(ParseError::at_position(
                "Illegal character or unterminated literal".to_string(),
                token.span,
            ));
        }

        let mut distinct = false;
        if self.eat(&TokenKind::Select) {
            distinct = self.eat(&TokenKind::Distinct);
            self.parse_projection()?;
        }

        self.expect(TokenKind::From)?;
        let sources = self.parse_identifier_list()?;

        let selection = if self.eat(&TokenKind::Where) {
            Some(self.parse_or_expression()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat(&TokenKind::Group) {
            self.expect(TokenKind::By)?;
            group_by = self.parse_identifier_list()?;
        }

        let mut order_by = Vec::new();
        if self.eat(&TokenKind::Order) {
            self.expect(TokenKind::By)?;
            order_by = self.parse_order_by()?;
        }

        let limit = if self.eat(&TokenKind::Limit) {
            Some(self.parse_limit()?)
        } else {
            None
        };

        if let Some(token) = self.peek() {
            return Err(ParseError::at_position(
                format!("Unexpected {} after end of statement", token.kind.describe()),
                token.span,
            ));
        }

        Ok(Statement {
            distinct,
            sources,
            selection,
            group_by,
            order_by,
            limit,
        })
    }

    /// `*` 或列名列表; 列名本身没有意义, 后端总是返回完整记录
    fn parse_projection(&mut self) -> Result<(), ParseError> {
        if self.eat(&TokenKind::Star) {
            return Ok(());
        }
        self.parse_identifier_list().map(|_| ())
    }

    fn parse_identifier(&mut self) -> Result<Identifier, ParseError> {
        match self.advance() {
            Some(Token { kind: TokenKind::Identifier(name), .. }) => Ok(Identifier::new(*name)),
            Some(token) => Err(unexpected("identifier", token)),
            None => Err(ParseError::new("Expected identifier, but reached end of input".to_string(), None)),
        }
    }

    fn parse_identifier_list(&mut self) -> Result<Vec<Identifier>, ParseError> {
        let mut items = vec![self.parse_identifier()?];
        while self.eat(&TokenKind::Comma) {
            items.push(self.parse_identifier()?);
        }
        Ok(items)
    }

    fn parse_order_by(&mut self) -> Result<Vec<OrderBy>, ParseError> {
        let mut items = Vec::new();
        loop {
            let field = self.parse_identifier()?;
            let descending = if self.eat(&TokenKind::Desc) {
                true
            } else {
                self.eat(&TokenKind::Asc);
                false
            };
            items.push(OrderBy { field, descending });
            if !self.eat(&TokenKind::Comma) {
                return Ok(items);
            }
        }
    }

    /// `LIMIT rowcount` 或 `LIMIT offset, rowcount`
    fn parse_limit(&mut self) -> Result<Limit, ParseError> {
        let first = self.parse_integer()?;
        if self.eat(&TokenKind::Comma) {
            let rowcount = self.parse_integer()?;
            Ok(Limit { offset: Some(first), rowcount })
        } else {
            Ok(Limit { offset: None, rowcount: first })
        }
    }

    fn parse_integer(&mut self) -> Result<i64, ParseError> {
        match self.advance() {
            Some(Token { kind: TokenKind::Integer(n), .. }) => Ok(*n),
            Some(token) => Err(unexpected("integer", token)),
            None => Err(ParseError::new("Expected integer, but reached end of input".to_string(), None)),
        }
    }

    /// 解析OR表达式 (最低优先级)
    ///
    /// 语法: `and_expr (OR and_expr)*`, 左结合
    fn parse_or_expression(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and_expression()?;
        while self.eat(&TokenKind::Or) {
            let right = self.parse_and_expression()?;
            left = Expr::or(left, right);
        }
        Ok(left)
    }

    /// 解析AND表达式
    ///
    /// 语法: `primary (AND primary)*`, 左结合
    fn parse_and_expression(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_primary_expression()?;
        while self.eat(&TokenKind::And) {
            let right = self.parse_primary_expression()?;
            left = Expr::and(left, right);
        }
        Ok(left)
    }

    fn parse_primary_expression(&mut self) -> Result<Expr, ParseError> {
        let token = match self.peek() {
            Some(token) => token,
            None => return Err(ParseError::new("Unexpected end of input".to_string(), None)),
        };

        match &token.kind {
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_or_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            TokenKind::Not => Err(ParseError::at_position(
                "'is'/'not' expression currently not supported".to_string(),
                token.span,
            )),
            TokenKind::Identifier(_) => {
                let field = self.parse_identifier()?;
                self.parse_predicate(field)
            }
            _ => Err(unexpected("field name or '('", token)),
        }
    }

    /// 解析字段名之后的部分
    fn parse_predicate(&mut self, field: Identifier) -> Result<Expr, ParseError> {
        let token = match self.advance() {
            Some(token) => token,
            None => {
                return Err(ParseError::new(
                    format!("Expected operator after '{}', but reached end of input", field),
                    None,
                ))
            }
        };

        let op = match &token.kind {
            TokenKind::Eq => CompOp::Eq,
            TokenKind::NotEq => CompOp::NotEq,
            TokenKind::Lt => CompOp::Lt,
            TokenKind::Gt => CompOp::Gt,
            TokenKind::Lte => CompOp::Lte,
            TokenKind::Gte => CompOp::Gte,
            TokenKind::In => CompOp::In,
            TokenKind::Like => CompOp::Like,
            TokenKind::Not => {
                if self.eat(&TokenKind::In) {
                    CompOp::NotIn
                } else if self.eat(&TokenKind::Like) {
                    CompOp::NotLike
                } else {
                    return Err(ParseError::at_position(
                        "'is'/'not' expression currently not supported".to_string(),
                        token.span,
                    ));
                }
            }
            TokenKind::Between => {
                let from = self.parse_literal()?;
                self.expect(TokenKind::And)?;
                let to = self.parse_literal()?;
                return Ok(Expr::Between { field, from, to });
            }
            TokenKind::Is => {
                return Err(ParseError::at_position(
                    "'is'/'not' expression currently not supported".to_string(),
                    token.span,
                ))
            }
            TokenKind::LParen => {
                return Err(ParseError::at_position(
                    format!("Function '{}' is not supported", field),
                    token.span,
                ))
            }
            _ => return Err(unexpected("comparison operator", token)),
        };

        let value = match op {
            CompOp::In | CompOp::NotIn => self.parse_literal_list()?,
            CompOp::Like | CompOp::NotLike => match self.advance() {
                Some(Token { kind: TokenKind::String(s), .. }) => Literal::String(unescape(s)),
                Some(token) => return Err(unexpected("pattern string", token)),
                None => return Err(ParseError::new("Expected pattern string".to_string(), None)),
            },
            _ => self.parse_literal()?,
        };

        Ok(Expr::Comparison { field, op, value })
    }

    /// `(v1, v2, ...)`, 不允许空列表和结尾逗号
    fn parse_literal_list(&mut self) -> Result<Literal, ParseError> {
        self.expect(TokenKind::LParen)?;
        if let Some(token) = self.peek() {
            if token.kind == TokenKind::RParen {
                return Err(ParseError::at_position("Empty value list".to_string(), token.span));
            }
        }

        let mut values = vec![self.parse_literal()?];
        while self.eat(&TokenKind::Comma) {
            values.push(self.parse_literal()?);
        }
        self.expect(TokenKind::RParen)?;
        Ok(Literal::List(values))
    }

    fn parse_literal(&mut self) -> Result<Literal, ParseError> {
        let token = match self.advance() {
            Some(token) => token,
            None => return Err(ParseError::new("Expected literal value".to_string(), None)),
        };

        match &token.kind {
            TokenKind::String(s) => Ok(Literal::String(unescape(s))),
            TokenKind::Integer(n) => Ok(Literal::Integer(*n)),
            TokenKind::Float(n) => Ok(Literal::Float(*n)),
            TokenKind::True => Ok(Literal::Bool(true)),
            TokenKind::False => Ok(Literal::Bool(false)),
            TokenKind::Identifier(name) => Ok(Literal::Column(Identifier::new(*name))),
            TokenKind::Null => Err(ParseError::at_position(
                "NULL values are not supported, use 'exist' instead".to_string(),
                token.span,
            )),
            _ => Err(unexpected("literal value", token)),
        }
    }
}

fn unexpected(expected: &str, found: &Token) -> ParseError {
    ParseError::at_position(
        format!("Expected {}, found {}", expected, found.kind.describe()),
        found.span,
    )
}

/// 解析字符串中的转义: 双写引号与反斜杠转义
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            },
            '\'' | '"' if chars.peek() == Some(&c) => {
                chars.next();
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
