//! Restricted field expressions
//!
//! Visibility and mandatory conditions are parsed into a small tree and
//! evaluated against one record's field values. Nothing else is reachable
//! from an expression: no calls, no globals, no assignment.
//!
//! ```text
//! expr       := and_expr (("||" | "or") and_expr)*
//! and_expr   := unary (("&&" | "and") unary)*
//! unary      := ("!" | "not") unary | comparison
//! comparison := operand (op operand)?        op := === !== == != <= >= < >
//! operand    := "(" expr ")" | literal | ["doc."] identifier
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_until, take_while},
    character::complete::{char, multispace0, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, recognize, value},
    multi::fold_many0,
    number::complete::recognize_float,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{AtlasError, Result};

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::StrictEq => "===",
            CmpOp::StrictNe => "!==",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

impl Literal {
    fn to_value(&self) -> Value {
        match self {
            Literal::Str(s) => Value::String(s.clone()),
            Literal::Num(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Null => Value::Null,
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expr {
    Literal { value: Literal },
    Field { name: String },
    Not { operand: Box<Expr> },
    And { left: Box<Expr>, right: Box<Expr> },
    Or { left: Box<Expr>, right: Box<Expr> },
    Compare { op: CmpOp, left: Box<Expr>, right: Box<Expr> },
}

/// Parse an expression, with or without the `eval:` prefix
pub fn parse(source: &str) -> Result<Expr> {
    let body = source.trim();
    let body = body.strip_prefix("eval:").unwrap_or(body).trim();
    if body.is_empty() {
        return Err(AtlasError::Expression("empty expression".to_string()));
    }
    all_consuming(ws(or_expr))(body)
        .map(|(_, expr)| expr)
        .map_err(|e| AtlasError::Expression(format!("cannot parse '{}': {}", body, e)))
}

impl Expr {
    /// Field names the expression reads
    pub fn bindings(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_bindings(&mut out);
        out
    }

    fn collect_bindings(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal { .. } => {}
            Expr::Field { name } => {
                out.insert(name.clone());
            }
            Expr::Not { operand } => operand.collect_bindings(out),
            Expr::And { left, right } | Expr::Or { left, right } | Expr::Compare { left, right, .. } => {
                left.collect_bindings(out);
                right.collect_bindings(out);
            }
        }
    }

    /// Evaluate against a record; `&&` and `||` yield an operand like JavaScript does
    pub fn evaluate(&self, record: &Map<String, Value>) -> Value {
        match self {
            Expr::Literal { value } => value.to_value(),
            Expr::Field { name } => record.get(name).cloned().unwrap_or(Value::Null),
            Expr::Not { operand } => Value::Bool(!truthy(&operand.evaluate(record))),
            Expr::And { left, right } => {
                let l = left.evaluate(record);
                if truthy(&l) {
                    right.evaluate(record)
                } else {
                    l
                }
            }
            Expr::Or { left, right } => {
                let l = left.evaluate(record);
                if truthy(&l) {
                    l
                } else {
                    right.evaluate(record)
                }
            }
            Expr::Compare { op, left, right } => {
                Value::Bool(compare(*op, &left.evaluate(record), &right.evaluate(record)))
            }
        }
    }

    pub fn is_satisfied(&self, record: &Map<String, Value>) -> bool {
        truthy(&self.evaluate(record))
    }

    fn is_atom(&self) -> bool {
        matches!(self, Expr::Literal { .. } | Expr::Field { .. })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal { value } => match value {
                Literal::Str(s) => write!(f, "'{}'", s),
                Literal::Num(n) => write!(f, "{}", n),
                Literal::Bool(b) => write!(f, "{}", b),
                Literal::Null => f.write_str("null"),
            },
            Expr::Field { name } => write!(f, "doc.{}", name),
            Expr::Not { operand } if operand.is_atom() => write!(f, "!{}", operand),
            Expr::Not { operand } => write!(f, "!({})", operand),
            Expr::And { left, right } => write!(f, "({} && {})", left, right),
            Expr::Or { left, right } => write!(f, "({} || {})", left, right),
            Expr::Compare { op, left, right } => write!(f, "{} {} {}", left, op.symbol(), right),
        }
    }
}

/// JavaScript-style truthiness
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        _ => match (as_number(l), as_number(r)) {
            (Some(a), Some(b)) => a == b,
            _ => l == r,
        },
    }
}

fn strict_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> bool {
    match op {
        CmpOp::Eq => return loose_eq(l, r),
        CmpOp::Ne => return !loose_eq(l, r),
        CmpOp::StrictEq => return strict_eq(l, r),
        CmpOp::StrictNe => return !strict_eq(l, r),
        _ => {}
    }
    let ordering = match (l, r) {
        (Value::String(a), Value::String(b)) if as_number(l).is_none() || as_number(r).is_none() => {
            Some(a.cmp(b))
        }
        _ => match (as_number(l), as_number(r)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    match (op, ordering) {
        (_, None) => false,
        (CmpOp::Lt, Some(o)) => o == Ordering::Less,
        (CmpOp::Le, Some(o)) => o != Ordering::Greater,
        (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
        (_, Some(o)) => o != Ordering::Less,
    }
}

// =============================================================================
// PARSERS
// =============================================================================

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Case-insensitive keyword not followed by an identifier character
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input: &'a str| terminated(tag_no_case(kw), not(satisfy(is_ident_char)))(input)
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    fold_many0(
        preceded(ws(alt((tag("||"), keyword("or")))), and_expr),
        move || first.clone(),
        |left, right| Expr::Or {
            left: Box::new(left),
            right: Box::new(right),
        },
    )(input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    fold_many0(
        preceded(ws(alt((tag("&&"), keyword("and")))), unary),
        move || first.clone(),
        |left, right| Expr::And {
            left: Box::new(left),
            right: Box::new(right),
        },
    )(input)
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            preceded(ws(alt((terminated(tag("!"), not(char('='))), keyword("not")))), unary),
            |operand| Expr::Not {
                operand: Box::new(operand),
            },
        ),
        comparison,
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, left) = operand(input)?;
    let (input, rest) = opt(pair(ws(cmp_op), operand))(input)?;
    let expr = match rest {
        Some((op, right)) => Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        None => left,
    };
    Ok((input, expr))
}

fn cmp_op(input: &str) -> IResult<&str, CmpOp> {
    alt((
        value(CmpOp::StrictEq, tag("===")),
        value(CmpOp::StrictNe, tag("!==")),
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
    ))(input)
}

fn operand(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        delimited(char('('), or_expr, char(')')),
        map(literal, |value| Expr::Literal { value }),
        map(binding, |name| Expr::Field { name }),
    )))(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), take_until("\""), char('"')),
        delimited(char('\''), take_until("'"), char('\'')),
    ))(input)
}

fn literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(quoted, |s: &str| Literal::Str(s.to_string())),
        map(map_res(recognize_float, str::parse::<f64>), Literal::Num),
        value(Literal::Bool(true), keyword("true")),
        value(Literal::Bool(false), keyword("false")),
        value(
            Literal::Null,
            alt((keyword("null"), keyword("none"), keyword("undefined"))),
        ),
    ))(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))(input)
}

fn binding(input: &str) -> IResult<&str, String> {
    map(preceded(opt(tag("doc.")), identifier), String::from)(input)
}
