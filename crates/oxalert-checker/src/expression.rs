//! Trigger expressions.
//!
//! A small language over the trigger's target values that yields a
//! [`State`]:
//!
//! ```text
//! t1 > ERROR_VALUE ? ERROR : (t1 > WARN_VALUE ? WARN : OK)
//! (t1 - t2) / t2 > 0.5 && PREV_STATE != OK ? ERROR : OK
//! ```
//!
//! Numbers, `t1..tN`, `WARN_VALUE`, `ERROR_VALUE`, `PREV_STATE` and the state
//! constants `OK WARN ERROR NODATA EXCEPTION` are the only operands.
//! Arithmetic, comparison, `&& || !` and the ternary operator are supported.
//! Function calls are rejected.

use oxalert_common::types::State;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("function calls are not allowed: {0}()")]
    FunctionCall(String),
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),
    #[error("{0} is not set")]
    MissingValue(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("expression must evaluate to a state, got {0}")]
    NotAState(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(BinOp),
    Not,
    Question,
    Colon,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(n) => write!(f, "{n}"),
            Token::Ident(s) => write!(f, "'{s}'"),
            Token::Op(op) => write!(f, "'{op}'"),
            Token::Not => f.write_str("'!'"),
            Token::Question => f.write_str("'?'"),
            Token::Colon => f.write_str("':'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                i += 1;
                if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| ExprError::UnexpectedToken(text.clone()))?;
            tokens.push(Token::Num(n));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('&', Some('&')) => (Token::Op(BinOp::And), 2),
            ('|', Some('|')) => (Token::Op(BinOp::Or), 2),
            ('=', Some('=')) => (Token::Op(BinOp::Eq), 2),
            ('!', Some('=')) => (Token::Op(BinOp::Ne), 2),
            ('<', Some('=')) => (Token::Op(BinOp::Le), 2),
            ('>', Some('=')) => (Token::Op(BinOp::Ge), 2),
            ('<', _) => (Token::Op(BinOp::Lt), 1),
            ('>', _) => (Token::Op(BinOp::Gt), 1),
            ('+', _) => (Token::Op(BinOp::Add), 1),
            ('-', _) => (Token::Op(BinOp::Sub), 1),
            ('*', _) => (Token::Op(BinOp::Mul), 1),
            ('/', _) => (Token::Op(BinOp::Div), 1),
            ('%', _) => (Token::Op(BinOp::Mod), 1),
            ('!', _) => (Token::Not, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            _ => return Err(ExprError::UnexpectedChar(c, i)),
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Target(usize),
    WarnValue,
    ErrorValue,
    PrevState,
    State(State),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Operand(Operand),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

fn operand(name: &str) -> Result<Operand, ExprError> {
    let op = match name {
        "WARN_VALUE" => Operand::WarnValue,
        "ERROR_VALUE" => Operand::ErrorValue,
        "PREV_STATE" => Operand::PrevState,
        "OK" => Operand::State(State::Ok),
        "WARN" => Operand::State(State::Warn),
        "ERROR" => Operand::State(State::Error),
        "NODATA" => Operand::State(State::Nodata),
        "EXCEPTION" => Operand::State(State::Exception),
        _ => {
            let idx = name
                .strip_prefix('t')
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n >= 1)
                .ok_or_else(|| ExprError::UnknownIdentifier(name.to_string()))?;
            Operand::Target(idx)
        }
    };
    Ok(op)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), ExprError> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(ExprError::UnexpectedToken(t.to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.binary(0)?;
        if self.peek() != Some(&Token::Question) {
            return Ok(cond);
        }
        self.pos += 1;
        let then = self.ternary()?;
        self.expect(Token::Colon)?;
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary(
            Box::new(cond),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let prec = precedence(op);
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::Op(BinOp::Sub)) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    return Err(ExprError::FunctionCall(name));
                }
                Ok(Expr::Operand(operand(&name)?))
            }
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(t) => Err(ExprError::UnexpectedToken(t.to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

fn precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Or => 1,
        BinOp::And => 2,
        BinOp::Eq | BinOp::Ne => 3,
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 4,
        BinOp::Add | BinOp::Sub => 5,
        BinOp::Mul | BinOp::Div | BinOp::Mod => 6,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Num(f64),
    Bool(bool),
    State(State),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) => write!(f, "number {n}"),
            Value::Bool(b) => write!(f, "boolean {b}"),
            Value::State(s) => write!(f, "state {s}"),
        }
    }
}

/// Values an expression is evaluated against.
#[derive(Debug, Clone)]
pub struct Env<'a> {
    /// `t1..tN` keyed by name.
    pub targets: &'a BTreeMap<String, f64>,
    pub warn_value: Option<f64>,
    pub error_value: Option<f64>,
    pub prev_state: State,
}

/// A parsed trigger expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Expr,
}

impl Expression {
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(ExprError::UnexpectedEnd);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.ternary()?;
        if let Some(t) = parser.next() {
            return Err(ExprError::UnexpectedToken(t.to_string()));
        }
        Ok(Self { root })
    }

    pub fn evaluate(&self, env: &Env<'_>) -> Result<State, ExprError> {
        match eval(&self.root, env)? {
            Value::State(s) => Ok(s),
            other => Err(ExprError::NotAState(other.to_string())),
        }
    }
}

fn eval(expr: &Expr, env: &Env<'_>) -> Result<Value, ExprError> {
    match expr {
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Operand(op) => resolve(op, env),
        Expr::Neg(inner) => Ok(Value::Num(-number(eval(inner, env)?)?)),
        Expr::Not(inner) => Ok(Value::Bool(!boolean(eval(inner, env)?)?)),
        Expr::Ternary(cond, then, otherwise) => {
            if boolean(eval(cond, env)?)? {
                eval(then, env)
            } else {
                eval(otherwise, env)
            }
        }
        Expr::Binary(BinOp::And, l, r) => {
            Ok(Value::Bool(boolean(eval(l, env)?)? && boolean(eval(r, env)?)?))
        }
        Expr::Binary(BinOp::Or, l, r) => {
            Ok(Value::Bool(boolean(eval(l, env)?)? || boolean(eval(r, env)?)?))
        }
        Expr::Binary(op, l, r) => binary(*op, eval(l, env)?, eval(r, env)?),
    }
}

fn resolve(op: &Operand, env: &Env<'_>) -> Result<Value, ExprError> {
    match op {
        Operand::Target(idx) => {
            let name = format!("t{idx}");
            env.targets
                .get(&name)
                .copied()
                .map(Value::Num)
                .ok_or(ExprError::MissingValue(name))
        }
        Operand::WarnValue => env
            .warn_value
            .map(Value::Num)
            .ok_or_else(|| ExprError::MissingValue("WARN_VALUE".into())),
        Operand::ErrorValue => env
            .error_value
            .map(Value::Num)
            .ok_or_else(|| ExprError::MissingValue("ERROR_VALUE".into())),
        Operand::PrevState => Ok(Value::State(env.prev_state)),
        Operand::State(s) => Ok(Value::State(*s)),
    }
}

fn number(v: Value) -> Result<f64, ExprError> {
    match v {
        Value::Num(n) => Ok(n),
        other => Err(ExprError::Type(format!("expected number, got {other}"))),
    }
}

fn boolean(v: Value) -> Result<bool, ExprError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Type(format!("expected boolean, got {other}"))),
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, ExprError> {
    let out = match (op, l, r) {
        (BinOp::Add, Value::Num(a), Value::Num(b)) => Value::Num(a + b),
        (BinOp::Sub, Value::Num(a), Value::Num(b)) => Value::Num(a - b),
        (BinOp::Mul, Value::Num(a), Value::Num(b)) => Value::Num(a * b),
        (BinOp::Div, Value::Num(a), Value::Num(b)) => Value::Num(a / b),
        (BinOp::Mod, Value::Num(a), Value::Num(b)) => Value::Num(a % b),
        (BinOp::Lt, Value::Num(a), Value::Num(b)) => Value::Bool(a < b),
        (BinOp::Le, Value::Num(a), Value::Num(b)) => Value::Bool(a <= b),
        (BinOp::Gt, Value::Num(a), Value::Num(b)) => Value::Bool(a > b),
        (BinOp::Ge, Value::Num(a), Value::Num(b)) => Value::Bool(a >= b),
        (BinOp::Lt, Value::State(a), Value::State(b)) => Value::Bool(a < b),
        (BinOp::Le, Value::State(a), Value::State(b)) => Value::Bool(a <= b),
        (BinOp::Gt, Value::State(a), Value::State(b)) => Value::Bool(a > b),
        (BinOp::Ge, Value::State(a), Value::State(b)) => Value::Bool(a >= b),
        (BinOp::Eq, a, b) if same_kind(a, b) => Value::Bool(a == b),
        (BinOp::Ne, a, b) if same_kind(a, b) => Value::Bool(a != b),
        (op, a, b) => {
            return Err(ExprError::Type(format!("cannot apply '{op}' to {a} and {b}")));
        }
    };
    Ok(out)
}

fn same_kind(a: Value, b: Value) -> bool {
    std::mem::discriminant(&a) == std::mem::discriminant(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str, t1: f64, prev: State) -> Result<State, ExprError> {
        let mut targets = BTreeMap::new();
        targets.insert("t1".to_string(), t1);
        targets.insert("t2".to_string(), 10.0);
        let env = Env {
            targets: &targets,
            warn_value: Some(50.0),
            error_value: Some(90.0),
            prev_state: prev,
        };
        Expression::parse(src)?.evaluate(&env)
    }

    #[test]
    fn thresholds_via_ternary() {
        let src = "t1 >= ERROR_VALUE ? ERROR : t1 >= WARN_VALUE ? WARN : OK";
        assert_eq!(run(src, 95.0, State::Ok), Ok(State::Error));
        assert_eq!(run(src, 60.0, State::Ok), Ok(State::Warn));
        assert_eq!(run(src, 10.0, State::Ok), Ok(State::Ok));
    }

    #[test]
    fn arithmetic_precedence_and_logic() {
        assert_eq!(run("t1 - t2 * 2 == 0 ? OK : ERROR", 20.0, State::Ok), Ok(State::Ok));
        assert_eq!(run("(t1 - t2) * 2 == 0 ? OK : ERROR", 20.0, State::Ok), Ok(State::Error));
        assert_eq!(
            run("!(t1 > 5) || PREV_STATE == ERROR ? WARN : OK", 10.0, State::Error),
            Ok(State::Warn)
        );
        assert_eq!(run("-t1 < 0 && 1e1 == t2 ? OK : ERROR", 1.0, State::Ok), Ok(State::Ok));
    }

    #[test]
    fn state_operands_compare_by_severity() {
        assert_eq!(run("PREV_STATE > WARN ? PREV_STATE : OK", 0.0, State::Nodata), Ok(State::Nodata));
        assert_eq!(run("PREV_STATE", 0.0, State::Exception), Ok(State::Exception));
    }

    #[test]
    fn rejects_function_calls_and_unknowns() {
        assert!(matches!(
            Expression::parse("max(t1, t2) > 1 ? OK : ERROR"),
            Err(ExprError::FunctionCall(name)) if name == "max"
        ));
        assert!(matches!(
            Expression::parse("foo > 1 ? OK : ERROR"),
            Err(ExprError::UnknownIdentifier(_))
        ));
        assert!(matches!(Expression::parse("t0 > 1"), Err(ExprError::UnknownIdentifier(_))));
        assert!(matches!(Expression::parse("t1 >"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(Expression::parse("t1 # 2"), Err(ExprError::UnexpectedChar('#', 3))));
        assert!(matches!(Expression::parse("(OK"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(Expression::parse("OK OK"), Err(ExprError::UnexpectedToken(_))));
        assert!(matches!(Expression::parse("t1, t2"), Err(ExprError::UnexpectedToken(_))));
    }

    #[test]
    fn evaluation_errors() {
        assert!(matches!(run("t1 + 1", 1.0, State::Ok), Err(ExprError::NotAState(_))));
        assert!(matches!(run("t3 > 1 ? OK : ERROR", 1.0, State::Ok), Err(ExprError::MissingValue(_))));
        assert!(matches!(run("t1 ? OK : ERROR", 1.0, State::Ok), Err(ExprError::Type(_))));
        assert!(matches!(run("OK == 1 ? OK : ERROR", 1.0, State::Ok), Err(ExprError::Type(_))));
    }
}
