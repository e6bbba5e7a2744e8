//! 查询语言的词法分析器

use crate::token::{Span, Token, TokenKind};

pub struct Lexer<'a> {
    input: &'a str,
    /// 当前在输入中的位置 (字节偏移)
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer { input, position: 0 }
    }

    /// 返回当前位置的字符，不推进位置
    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    /// 返回下一个字符，不推进位置
    fn peek_next(&self) -> Option<char> {
        self.input[self.position..].chars().nth(1)
    }

    /// 推进一个字符并返回它
    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if let Some(c) = c {
            self.position += c.len_utf8();
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn token(&self, kind: TokenKind<'a>, start: usize) -> Token<'a> {
        Token {
            kind,
            span: Span::new(start, self.position),
        }
    }

    /// 读取整数或浮点数字面量，符号已被消费
    fn read_number(&mut self, start: usize) -> Token<'a> {
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == '.' && !is_float && self.peek_next().is_some_and(|n| n.is_ascii_digit()) {
                is_float = true;
                self.bump();
            } else {
                break;
            }
        }

        let literal = &self.input[start..self.position];
        let kind = if is_float {
            literal.parse::<f64>().map(TokenKind::Float).unwrap_or(TokenKind::Illegal)
        } else {
            // 溢出的整数报告为非法 token
            literal.parse::<i64>().map(TokenKind::Integer).unwrap_or(TokenKind::Illegal)
        };
        self.token(kind, start)
    }

    /// 读取带引号的字符串字面量，开头的引号已被消费
    ///
    /// 双写引号 (`''`) 或反斜杠会转义下一个字符，返回的切片保留原样
    fn read_string(&mut self, start: usize, quote: char) -> Token<'a> {
        let content_start = self.position;
        loop {
            match self.peek() {
                None => return self.token(TokenKind::Illegal, start),
                Some('\\') => {
                    self.bump();
                    self.bump();
                }
                Some(c) if c == quote => {
                    if self.peek_next() == Some(quote) {
                        self.bump();
                        self.bump();
                    } else {
                        break;
                    }
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
        let content_end = self.position;
        self.bump(); // 结束引号

        self.token(TokenKind::String(&self.input[content_start..content_end]), start)
    }

    /// 读取反引号包裹的标识符，例如 `` `src ip` ``
    fn read_quoted_identifier(&mut self, start: usize) -> Token<'a> {
        let content_start = self.position;
        while let Some(c) = self.peek() {
            if c == '`' {
                break;
            }
            self.bump();
        }
        if self.peek().is_none() {
            return self.token(TokenKind::Illegal, start);
        }
        let content_end = self.position;
        self.bump();

        self.token(TokenKind::Identifier(&self.input[content_start..content_end]), start)
    }

    /// 读取标识符或关键字
    /// 标识符可以包含字母、数字、'_'、'-' 和 '.' (嵌套字段)
    fn read_identifier(&mut self, start: usize) -> Token<'a> {
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                self.bump();
            } else {
                break;
            }
        }
        let literal = &self.input[start..self.position];
        self.token(match_keyword(literal), start)
    }
}

fn match_keyword(s: &str) -> TokenKind {
    match s.to_ascii_lowercase().as_str() {
        "select" => TokenKind::Select,
        "distinct" => TokenKind::Distinct,
        "from" => TokenKind::From,
        "where" => TokenKind::Where,
        "group" => TokenKind::Group,
        "order" => TokenKind::Order,
        "by" => TokenKind::By,
        "asc" => TokenKind::Asc,
        "desc" => TokenKind::Desc,
        "limit" => TokenKind::Limit,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "in" => TokenKind::In,
        "like" => TokenKind::Like,
        "between" => TokenKind::Between,
        "is" => TokenKind::Is,
        "null" => TokenKind::Null,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        _ => TokenKind::Identifier(s),
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_whitespace();
        let start = self.position;

        let c = self.bump()?;

        let token = match c {
            '=' => self.token(TokenKind::Eq, start),
            '(' => self.token(TokenKind::LParen, start),
            ')' => self.token(TokenKind::RParen, start),
            ',' => self.token(TokenKind::Comma, start),
            '*' => self.token(TokenKind::Star, start),
            '<' => match self.peek() {
                Some('=') => {
                    self.bump();
                    self.token(TokenKind::Lte, start)
                }
                Some('>') => {
                    self.bump();
                    self.token(TokenKind::NotEq, start)
                }
                _ => self.token(TokenKind::Lt, start),
            },
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    self.token(TokenKind::Gte, start)
                } else {
                    self.token(TokenKind::Gt, start)
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    self.token(TokenKind::NotEq, start)
                } else {
                    self.token(TokenKind::Illegal, start)
                }
            }
            '\'' | '"' => self.read_string(start, c),
            '`' => self.read_quoted_identifier(start),
            '-' if self.peek().is_some_and(|n| n.is_ascii_digit()) => self.read_number(start),
            c if c.is_ascii_digit() => self.read_number(start),
            c if c.is_alphabetic() || c == '_' => self.read_identifier(start),
            _ => self.token(TokenKind::Illegal, start),
        };
        Some(token)
    }
}
