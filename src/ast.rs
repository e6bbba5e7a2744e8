//! 查询语言的 AST 定义
//!
//! `Statement` 是解析器的直接产物；`Query` 是经过校验和规范化后、
//! 交给各个后端编译器的规范查询。

use serde_json::Value as JsonValue;
use std::fmt;

/// 时间范围过滤使用的保留字段名
pub const DATETIME_FIELD: &str = "datetime";

/// `field = exist` / `field != exist` 表示字段存在 / 不存在
pub const EXISTS_SENTINEL: &str = "exist";

/// 解析器输出的原始语句, 尚未做任何语义校验
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub distinct: bool,
    /// FROM 之后的所有数据源
    pub sources: Vec<Identifier>,
    /// WHERE 条件, 可能缺失
    pub selection: Option<Expr>,
    pub group_by: Vec<Identifier>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<Limit>,
}

/// `LIMIT [offset,] rowcount`, 保留用户输入的原始值 (可能为负)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub offset: Option<i64>,
    pub rowcount: i64,
}

/// 规范化后的查询, offset 与 rowcount 总是有值
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub source: Identifier,
    pub predicate: Expr,
    pub order_by: Vec<OrderBy>,
    pub offset: u64,
    pub rowcount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(pub String);

impl Identifier {
    pub fn new(name: impl Into<String>) -> Self {
        Identifier(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 谓词树
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// 叶子节点: `field op value`
    Comparison {
        field: Identifier,
        op: CompOp,
        value: Literal,
    },
    /// `field BETWEEN from AND to`, 闭区间
    Between {
        field: Identifier,
        from: Literal,
        to: Literal,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// 使用括号分组的表达式
    Paren(Box<Expr>),
}

impl Expr {
    pub fn comparison(field: &str, op: CompOp, value: Literal) -> Self {
        Expr::Comparison {
            field: Identifier::new(field),
            op,
            value,
        }
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Expr::Or(Box::new(left), Box::new(right))
    }

    /// 是否是 `datetime BETWEEN ... AND ...`
    pub fn is_datetime_range(&self) -> bool {
        matches!(self, Expr::Between { field, .. } if field.as_str() == DATETIME_FIELD)
    }

    /// 树中时间范围条件的个数
    pub fn datetime_range_count(&self) -> usize {
        match self {
            Expr::Between { .. } if self.is_datetime_range() => 1,
            Expr::Comparison { .. } | Expr::Between { .. } => 0,
            Expr::And(l, r) | Expr::Or(l, r) => l.datetime_range_count() + r.datetime_range_count(),
            Expr::Paren(inner) => inner.datetime_range_count(),
        }
    }
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,      // =
    NotEq,   // != 或 <>
    Lt,      // <
    Gt,      // >
    Lte,     // <=
    Gte,     // >=
    In,      // IN (...)
    NotIn,   // NOT IN (...)
    Like,    // LIKE
    NotLike, // NOT LIKE
}

impl CompOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompOp::Eq => "=",
            CompOp::NotEq => "!=",
            CompOp::Lt => "<",
            CompOp::Gt => ">",
            CompOp::Lte => "<=",
            CompOp::Gte => ">=",
            CompOp::In => "IN",
            CompOp::NotIn => "NOT IN",
            CompOp::Like => "LIKE",
            CompOp::NotLike => "NOT LIKE",
        }
    }
}

/// 字面量值
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    /// 右侧是一个未加引号的标识符, 例如 `exist`
    Column(Identifier),
    /// IN / NOT IN 的值列表
    List(Vec<Literal>),
}

impl Literal {
    pub fn string(s: impl Into<String>) -> Self {
        Literal::String(s.into())
    }

    /// 转换为 JSON 值, 标识符按字符串处理
    pub fn to_json(&self) -> JsonValue {
        match self {
            Literal::String(s) => JsonValue::String(s.clone()),
            Literal::Integer(n) => JsonValue::from(*n),
            Literal::Float(f) => JsonValue::from(*f),
            Literal::Bool(b) => JsonValue::Bool(*b),
            Literal::Column(id) => JsonValue::String(id.0.clone()),
            Literal::List(items) => JsonValue::Array(items.iter().map(Literal::to_json).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: Identifier,
    pub descending: bool,
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for CompOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Integer(n) => write!(f, "{}", n),
            Literal::Float(n) => write!(f, "{}", n),
            Literal::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            Literal::Column(id) => write!(f, "{}", id),
            Literal::List(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Comparison { field, op, value } => write!(f, "{} {} {}", field, op, value),
            Expr::Between { field, from, to } => write!(f, "{} BETWEEN {} AND {}", field, from, to),
            Expr::And(l, r) => write!(f, "{} AND {}", l, r),
            Expr::Or(l, r) => write!(f, "{} OR {}", l, r),
            Expr::Paren(inner) => write!(f, "({})", inner),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FROM {} WHERE {}", self.source, self.predicate)?;
        for (i, order) in self.order_by.iter().enumerate() {
            f.write_str(if i == 0 { " ORDER BY " } else { ", " })?;
            write!(f, "{}", order.field)?;
            if order.descending {
                f.write_str(" DESC")?;
            }
        }
        write!(f, " LIMIT {},{}", self.offset, self.rowcount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_renders_canonical_text() {
        let query = Query {
            source: Identifier::new("ips"),
            predicate: Expr::and(
                Expr::Paren(Box::new(Expr::or(
                    Expr::comparison("ip", CompOp::Eq, Literal::string("8.8.8.8")),
                    Expr::comparison("ip", CompOp::In, Literal::List(vec![Literal::Integer(1), Literal::Integer(2)])),
                ))),
                Expr::Between {
                    field: Identifier::new(DATETIME_FIELD),
                    from: Literal::string("a"),
                    to: Literal::string("b"),
                },
            ),
            order_by: vec![OrderBy { field: Identifier::new("ip"), descending: true }],
            offset: 5,
            rowcount: 1,
        };

        assert_eq!(
            query.to_string(),
            "FROM ips WHERE (ip = '8.8.8.8' OR ip IN (1, 2)) AND datetime BETWEEN 'a' AND 'b' ORDER BY ip DESC LIMIT 5,1"
        );
    }

    #[test]
    fn test_string_literal_quotes_are_doubled() {
        assert_eq!(Literal::string("it's").to_string(), "'it''s'");
    }

    #[test]
    fn test_datetime_range_detection() {
        let range = Expr::Between {
            field: Identifier::new(DATETIME_FIELD),
            from: Literal::string("a"),
            to: Literal::string("b"),
        };
        let other = Expr::Between {
            field: Identifier::new("port"),
            from: Literal::Integer(1),
            to: Literal::Integer(2),
        };
        assert!(range.is_datetime_range());
        assert!(!other.is_datetime_range());

        let tree = Expr::and(range.clone(), Expr::Paren(Box::new(Expr::or(range, other))));
        assert_eq!(tree.datetime_range_count(), 2);
    }
}
