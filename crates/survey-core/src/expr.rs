//! Rule expression language.
//!
//! Expressions are small boolean formulas over prior answers, scenario
//! fields, and agent traits:
//!
//! ```text
//! q1 == 'no' and (scenario.region in ['EU', 'UK'] or agent.age >= 40)
//! ```
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! expr    := and ( ("or" | "||") and )*
//! and     := not ( ("and" | "&&") not )*
//! not     := ("not" | "!") not | cmp
//! cmp     := primary ( op primary )?
//! op      := == | != | < | <= | > | >= | in | not in
//! primary := literal | reference | "(" expr ")" | "[" (expr ("," expr)*)? "]"
//! ```
//!
//! Names resolve through [`Resolve`]. An absent answer resolves to `null`.
//! With exactly one `null` side, `!=` and `not in` are true and every other
//! operator is false.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---- References ----

/// A name an expression (or prompt template) can read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    /// `q1` or `q1.answer`
    Answer(String),
    /// `scenario.<field>`
    Scenario(String),
    /// `agent.name`
    AgentName,
    /// `agent.<trait>`
    AgentTrait(String),
}

impl Reference {
    /// Parse a dotted path. Returns `None` for shapes no namespace accepts.
    pub fn parse(path: &str) -> Option<Self> {
        let parts: Vec<&str> = path.split('.').collect();
        if !parts.iter().all(|p| is_identifier(p)) {
            return None;
        }
        match parts.as_slice() {
            ["scenario", field] => Some(Reference::Scenario((*field).to_string())),
            ["agent", "name"] => Some(Reference::AgentName),
            ["agent", name] => Some(Reference::AgentTrait((*name).to_string())),
            ["scenario" | "agent"] => None,
            [question] | [question, "answer"] => Some(Reference::Answer((*question).to_string())),
            _ => None,
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Answer(q) => write!(f, "{q}"),
            Reference::Scenario(field) => write!(f, "scenario.{field}"),
            Reference::AgentName => write!(f, "agent.name"),
            Reference::AgentTrait(name) => write!(f, "agent.{name}"),
        }
    }
}

/// Supplies values for references during evaluation.
pub trait Resolve {
    fn resolve(&self, reference: &Reference) -> Value;
}

// ---- Errors ----

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("at offset {position}: {message}")]
pub struct ExprError {
    pub position: usize,
    pub message: String,
}

impl ExprError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

// ---- Lexer ----

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let peek = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two = |t: Token| -> Option<(usize, Token)> { Some((pos, t)) };
        let double = match (c, peek) {
            ('=', Some('=')) => two(Token::Eq),
            ('!', Some('=')) => two(Token::Ne),
            ('<', Some('=')) => two(Token::Le),
            ('>', Some('=')) => two(Token::Ge),
            ('&', Some('&')) => two(Token::And),
            ('|', Some('|')) => two(Token::Or),
            _ => None,
        };
        if let Some(tok) = double {
            tokens.push(tok);
            i += 2;
            continue;
        }

        let single = match c {
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            '!' => Some(Token::Not),
            '-' => Some(Token::Minus),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(tok) = single {
            tokens.push((pos, tok));
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut out = String::new();
            i += 1;
            loop {
                let Some(&(_, ch)) = chars.get(i) else {
                    return Err(ExprError::new(pos, "unterminated string literal"));
                };
                i += 1;
                match ch {
                    '\\' => {
                        let Some(&(_, escaped)) = chars.get(i) else {
                            return Err(ExprError::new(pos, "unterminated string literal"));
                        };
                        i += 1;
                        out.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                    ch if ch == quote => break,
                    ch => out.push(ch),
                }
            }
            tokens.push((pos, Token::Str(out)));
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            let num = text
                .parse::<f64>()
                .map_err(|_| ExprError::new(pos, format!("invalid number {text:?}")))?;
            tokens.push((pos, Token::Num(num)));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '.')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            let tok = match word.as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                "in" => Token::In,
                "true" | "True" => Token::True,
                "false" | "False" => Token::False,
                "null" | "None" => Token::Null,
                _ => {
                    if word.ends_with('.') || word.contains("..") {
                        return Err(ExprError::new(pos, format!("malformed name {word:?}")));
                    }
                    Token::Ident(word)
                }
            };
            tokens.push((pos, tok));
            continue;
        }

        return Err(ExprError::new(pos, format!("unexpected character {c:?}")));
    }

    Ok(tokens)
}

// ---- AST ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ref(Reference),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

// ---- Parser ----

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(ExprError::new(self.offset(), format!("expected {what}")))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_not()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::In) => CmpOp::In,
            Some(Token::Not)
                if matches!(self.tokens.get(self.pos + 1), Some((_, Token::In))) =>
            {
                self.pos += 1;
                CmpOp::NotIn
            }
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_primary()?;
        Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let at = self.offset();
        match self.bump() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Minus) => match self.bump() {
                Some(Token::Num(n)) => Ok(Expr::Literal(number(-n))),
                _ => Err(ExprError::new(at, "expected number after '-'")),
            },
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(path)) => Reference::parse(&path)
                .map(Expr::Ref)
                .ok_or_else(|| ExprError::new(at, format!("unknown name {path:?}"))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma, "',' or ']'")?;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(tok) => Err(ExprError::new(at, format!("unexpected token {tok:?}"))),
            None => Err(ExprError::new(at, "unexpected end of expression")),
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ---- Expression ----

/// A parsed rule expression. Serializes as its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExprError::new(0, "empty expression"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let root = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(ExprError::new(parser.offset(), "trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every name the expression reads, deduplicated and sorted.
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        collect_refs(&self.root, &mut out);
        out.sort();
        out.dedup();
        out
    }

    /// Evaluate to a JSON value.
    pub fn value(&self, scope: &dyn Resolve) -> Value {
        eval(&self.root, scope)
    }

    /// Evaluate and coerce to a boolean.
    pub fn evaluate(&self, scope: &dyn Resolve) -> bool {
        truthy(&self.value(scope))
    }
}

impl TryFrom<String> for Expression {
    type Error = ExprError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Expression::parse(&value)
    }
}

impl From<Expression> for String {
    fn from(expr: Expression) -> Self {
        expr.source
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn collect_refs(expr: &Expr, out: &mut Vec<Reference>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Ref(r) => out.push(r.clone()),
        Expr::List(items) => items.iter().for_each(|e| collect_refs(e, out)),
        Expr::Not(inner) => collect_refs(inner, out),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(_, a, b) => {
            collect_refs(a, out);
            collect_refs(b, out);
        }
    }
}

// ---- Evaluation ----

fn eval(expr: &Expr, scope: &dyn Resolve) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Ref(r) => scope.resolve(r),
        Expr::List(items) => Value::Array(items.iter().map(|e| eval(e, scope)).collect()),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, scope))),
        Expr::And(a, b) => Value::Bool(truthy(&eval(a, scope)) && truthy(&eval(b, scope))),
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, scope)) || truthy(&eval(b, scope))),
        Expr::Compare(op, a, b) => Value::Bool(compare(*op, &eval(a, scope), &eval(b, scope))),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => as_number(a)?.partial_cmp(&as_number(b)?),
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> bool {
    match (lhs.is_null(), rhs.is_null()) {
        (true, true) => return op == CmpOp::Eq,
        (true, false) | (false, true) => return matches!(op, CmpOp::Ne | CmpOp::NotIn),
        _ => {}
    }
    match op {
        CmpOp::Eq => loose_eq(lhs, rhs),
        CmpOp::Ne => !loose_eq(lhs, rhs),
        CmpOp::Lt => order(lhs, rhs) == Some(Ordering::Less),
        CmpOp::Le => matches!(order(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => order(lhs, rhs) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(order(lhs, rhs), Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::In => contains(rhs, lhs),
        CmpOp::NotIn => !contains(rhs, lhs),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Array(items), _) => items.iter().any(|item| loose_eq(item, needle)),
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Object(map), Value::String(k)) => map.contains_key(k),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct Scope(HashMap<Reference, Value>);

    impl Resolve for Scope {
        fn resolve(&self, reference: &Reference) -> Value {
            self.0.get(reference).cloned().unwrap_or(Value::Null)
        }
    }

    fn scope(pairs: &[(&str, Value)]) -> Scope {
        Scope(
            pairs
                .iter()
                .map(|(k, v)| (Reference::parse(k).unwrap(), v.clone()))
                .collect(),
        )
    }

    fn eval_str(src: &str, s: &Scope) -> bool {
        Expression::parse(src).unwrap().evaluate(s)
    }

    #[test]
    fn test_reference_parsing() {
        assert_eq!(Reference::parse("q1"), Some(Reference::Answer("q1".into())));
        assert_eq!(
            Reference::parse("q1.answer"),
            Some(Reference::Answer("q1".into()))
        );
        assert_eq!(
            Reference::parse("scenario.topic"),
            Some(Reference::Scenario("topic".into()))
        );
        assert_eq!(Reference::parse("agent.name"), Some(Reference::AgentName));
        assert_eq!(
            Reference::parse("agent.age"),
            Some(Reference::AgentTrait("age".into()))
        );
        assert_eq!(Reference::parse("scenario"), None);
        assert_eq!(Reference::parse("a.b.c"), None);
    }

    #[test]
    fn test_equality_and_boolean_ops() {
        let s = scope(&[("q1", json!("no")), ("agent.age", json!(42))]);
        assert!(eval_str("q1 == 'no'", &s));
        assert!(eval_str("q1 != \"yes\"", &s));
        assert!(eval_str("q1 == 'no' and agent.age >= 40", &s));
        assert!(eval_str("q1 == 'yes' or agent.age > 41", &s));
        assert!(!eval_str("not (q1 == 'no')", &s));
        assert!(eval_str("!(q1 == 'yes') && true", &s));
    }

    #[test]
    fn test_numeric_comparisons_coerce_numeric_strings() {
        let s = scope(&[("q2", json!("7")), ("q3", json!(3.5))]);
        assert!(eval_str("q2 == 7", &s));
        assert!(eval_str("q2 > 6.5", &s));
        assert!(eval_str("q3 < 4", &s));
        assert!(eval_str("q3 >= -1", &s));
    }

    #[test]
    fn test_membership() {
        let s = scope(&[
            ("q1", json!(["red", "blue"])),
            ("scenario.region", json!("EU")),
            ("q2", json!("I like cats")),
        ]);
        assert!(eval_str("'red' in q1", &s));
        assert!(eval_str("'green' not in q1", &s));
        assert!(eval_str("scenario.region in ['EU', 'UK']", &s));
        assert!(eval_str("'cats' in q2", &s));
    }

    #[test]
    fn test_absent_answers_only_satisfy_inequality() {
        let s = scope(&[]);
        assert!(!eval_str("q1 == 'no'", &s));
        assert!(eval_str("q1 != 'no'", &s));
        assert!(!eval_str("q1 > 3", &s));
        assert!(!eval_str("q1 in ['no']", &s));
        assert!(eval_str("q1 not in ['no']", &s));
        assert!(eval_str("q1 == null", &s));
        assert!(!eval_str("q1 != null", &s));
        assert!(eval_str("not q1", &s));
    }

    #[test]
    fn test_answered_is_not_null() {
        let s = scope(&[("q1", json!("Yes"))]);
        assert!(eval_str("q1 != null", &s));
        assert!(!eval_str("q1 == null", &s));
        assert!(!eval_str("q1 < null", &s));
    }

    #[test]
    fn test_references_are_collected() {
        let expr =
            Expression::parse("q1 == 'x' and (scenario.topic in q2 or agent.name == 'a')").unwrap();
        assert_eq!(
            expr.references(),
            vec![
                Reference::Answer("q1".into()),
                Reference::Answer("q2".into()),
                Reference::Scenario("topic".into()),
                Reference::AgentName,
            ]
        );
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            "",
            "q1 ==",
            "q1 = 'x'",
            "(q1 == 'x'",
            "'unterminated",
            "q1 == 'x' q2",
            "scenario == 1",
            "[1, 2",
        ] {
            assert!(Expression::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_serde_as_source_string() {
        let expr = Expression::parse("q1 == 'no'").unwrap();
        let json = serde_json::to_string(&expr).unwrap();
        assert_eq!(json, "\"q1 == 'no'\"");
        let back: Expression = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expr);
        assert!(serde_json::from_str::<Expression>("\"q1 ==\"").is_err());
    }
}
