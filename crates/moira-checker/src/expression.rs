//! User expressions for `expression` triggers.
//!
//! ```text
//! t1 > ERROR_VALUE ? ERROR : (t1 > WARN_VALUE && PREV_STATE != OK ? WARN : OK)
//! ```
//!
//! Operands are numbers, the target values `t1..tN`, `WARN_VALUE`,
//! `ERROR_VALUE`, `PREV_STATE` and the state literals `OK WARN ERROR
//! NODATA`. The result of a whole expression must be a state.

use crate::error::{CheckError, Result};
use moira_common::state::State;
use std::collections::HashMap;

/// Values an expression is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct Env<'a> {
    pub values: Option<&'a HashMap<String, f64>>,
    pub warn_value: Option<f64>,
    pub error_value: Option<f64>,
    pub prev_state: State,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    State(State),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::State(_) => "state",
        }
    }

    fn number(self) -> Result<f64> {
        match self {
            Value::Number(n) => Ok(n),
            other => Err(CheckError::Expression(format!(
                "expected number, got {}",
                other.type_name()
            ))),
        }
    }

    fn truthy(self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(CheckError::Expression(format!(
                "expected bool, got {}",
                other.type_name()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(f64),
    State(State),
    Var(String),
    Not(Box<Node>),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
}

/// A parsed expression, reusable across metrics and points.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Node,
}

impl Expression {
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.ternary()?;
        if parser.pos < parser.tokens.len() {
            return Err(CheckError::Expression(format!(
                "unexpected {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self { root })
    }

    /// Evaluates to a state; any other result is an error.
    pub fn eval_state(&self, env: &Env<'_>) -> Result<State> {
        match eval(&self.root, env)? {
            Value::State(s) => Ok(s),
            other => Err(CheckError::Expression(format!(
                "expression must return a state, got {}",
                other.type_name()
            ))),
        }
    }
}

fn eval(node: &Node, env: &Env<'_>) -> Result<Value> {
    Ok(match node {
        Node::Number(n) => Value::Number(*n),
        Node::State(s) => Value::State(*s),
        Node::Var(name) => lookup(name, env)?,
        Node::Not(inner) => Value::Bool(!eval(inner, env)?.truthy()?),
        Node::Neg(inner) => Value::Number(-eval(inner, env)?.number()?),
        Node::Ternary(cond, a, b) => {
            if eval(cond, env)?.truthy()? {
                eval(a, env)?
            } else {
                eval(b, env)?
            }
        }
        Node::Binary(BinOp::And, l, r) => {
            Value::Bool(eval(l, env)?.truthy()? && eval(r, env)?.truthy()?)
        }
        Node::Binary(BinOp::Or, l, r) => {
            Value::Bool(eval(l, env)?.truthy()? || eval(r, env)?.truthy()?)
        }
        Node::Binary(op, l, r) => binary(*op, eval(l, env)?, eval(r, env)?)?,
    })
}

fn lookup(name: &str, env: &Env<'_>) -> Result<Value> {
    let missing = || CheckError::Expression(format!("{name} has no value"));
    match name {
        "WARN_VALUE" => env.warn_value.map(Value::Number).ok_or_else(missing),
        "ERROR_VALUE" => env.error_value.map(Value::Number).ok_or_else(missing),
        "PREV_STATE" => Ok(Value::State(env.prev_state)),
        _ => env
            .values
            .and_then(|v| v.get(name))
            .copied()
            .map(Value::Number)
            .ok_or_else(missing),
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value> {
    let numbers = || -> Result<(f64, f64)> { Ok((l.number()?, r.number()?)) };
    Ok(match op {
        BinOp::Eq => Value::Bool(equal(l, r)?),
        BinOp::Ne => Value::Bool(!equal(l, r)?),
        BinOp::And => Value::Bool(l.truthy()? && r.truthy()?),
        BinOp::Or => Value::Bool(l.truthy()? || r.truthy()?),
        BinOp::Add => numbers().map(|(a, b)| Value::Number(a + b))?,
        BinOp::Sub => numbers().map(|(a, b)| Value::Number(a - b))?,
        BinOp::Mul => numbers().map(|(a, b)| Value::Number(a * b))?,
        BinOp::Div => numbers().map(|(a, b)| Value::Number(a / b))?,
        BinOp::Rem => numbers().map(|(a, b)| Value::Number(a % b))?,
        BinOp::Lt => numbers().map(|(a, b)| Value::Bool(a < b))?,
        BinOp::Le => numbers().map(|(a, b)| Value::Bool(a <= b))?,
        BinOp::Gt => numbers().map(|(a, b)| Value::Bool(a > b))?,
        BinOp::Ge => numbers().map(|(a, b)| Value::Bool(a >= b))?,
    })
}

fn equal(l: Value, r: Value) -> Result<bool> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::State(a), Value::State(b)) => Ok(a == b),
        (a, b) => Err(CheckError::Expression(format!(
            "cannot compare {} with {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "&&", "||", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!", "?", ":", "(",
    ")",
];

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    'outer: while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            let literal = &text[start..i];
            let n = literal
                .parse()
                .map_err(|_| CheckError::Expression(format!("bad number {literal}")))?;
            tokens.push(Token::Number(n));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(Token::Ident(text[start..i].to_string()));
            continue;
        }
        for op in OPERATORS {
            if text[i..].starts_with(op) {
                tokens.push(Token::Op(op));
                i += op.len();
                continue 'outer;
            }
        }
        return Err(CheckError::Expression(format!(
            "unexpected character {c:?} at offset {i}"
        )));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn eat(&mut self, op: &str) -> bool {
        if self.peek_op() == Some(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: &str) -> Result<()> {
        if self.eat(op) {
            Ok(())
        } else {
            Err(CheckError::Expression(format!("expected '{op}'")))
        }
    }

    fn ternary(&mut self) -> Result<Node> {
        let cond = self.or()?;
        if !self.eat("?") {
            return Ok(cond);
        }
        let a = self.ternary()?;
        self.expect(":")?;
        let b = self.ternary()?;
        Ok(Node::Ternary(Box::new(cond), Box::new(a), Box::new(b)))
    }

    fn or(&mut self) -> Result<Node> {
        let mut left = self.and()?;
        while self.eat("||") {
            left = Node::Binary(BinOp::Or, Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Node> {
        let mut left = self.comparison()?;
        while self.eat("&&") {
            left = Node::Binary(BinOp::And, Box::new(left), Box::new(self.comparison()?));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Node> {
        let left = self.additive()?;
        let op = match self.peek_op() {
            Some("==") => BinOp::Eq,
            Some("!=") => BinOp::Ne,
            Some("<") => BinOp::Lt,
            Some("<=") => BinOp::Le,
            Some(">") => BinOp::Gt,
            Some(">=") => BinOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        Ok(Node::Binary(op, Box::new(left), Box::new(self.additive()?)))
    }

    fn additive(&mut self) -> Result<Node> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek_op() {
                Some("+") => BinOp::Add,
                Some("-") => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            left = Node::Binary(op, Box::new(left), Box::new(self.multiplicative()?));
        }
    }

    fn multiplicative(&mut self) -> Result<Node> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek_op() {
                Some("*") => BinOp::Mul,
                Some("/") => BinOp::Div,
                Some("%") => BinOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            left = Node::Binary(op, Box::new(left), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Node> {
        if self.eat("!") {
            return Ok(Node::Not(Box::new(self.unary()?)));
        }
        if self.eat("-") {
            return Ok(Node::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| CheckError::Expression("unexpected end of expression".to_string()))?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Node::Number(n)),
            Token::Ident(name) => Ok(match name.as_str() {
                "OK" => Node::State(State::Ok),
                "WARN" => Node::State(State::Warn),
                "ERROR" => Node::State(State::Error),
                "NODATA" => Node::State(State::Nodata),
                _ => Node::Var(name),
            }),
            Token::Op("(") => {
                let inner = self.ternary()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Op(op) => Err(CheckError::Expression(format!("unexpected '{op}'"))),
        }
    }
}
