//! Minimal expression language for value mappings and write validation
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := sum ( ("<" | "<=" | ">" | ">=" | "==" | "!=") sum )?
//! sum     := product ( ("+" | "-") product )*
//! product := unary ( ("*" | "/") unary )*
//! unary   := ("-" | "!") unary | primary
//! primary := number | string | "true" | "false" | ident | ident "(" args ")" | "(" or ")"
//! ```
//!
//! Formula mappings are restricted to the arithmetic subset with exactly one
//! identifier, which is what makes [`invert`] total.

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Expression errors raised while parsing, checking or evaluating
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unsupported in formula: {0}")]
    Unsupported(String),

    #[error("formula must reference exactly one variable, found {0}")]
    VariableCount(usize),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    Text(String),
    Variable(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Evaluation result
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Value {
    pub fn as_number(&self) -> Result<f64, ExprError> {
        match self {
            Value::Number(n) => Ok(*n),
            other => Err(ExprError::Type(format!("expected number, got {other:?}"))),
        }
    }

    pub fn as_bool(&self) -> Result<bool, ExprError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ExprError::Type(format!("expected boolean, got {other:?}"))),
        }
    }
}

/// Name resolution for evaluation
pub trait Scope {
    fn variable(&self, name: &str) -> Option<f64>;

    fn call(&self, name: &str, _args: &[Value]) -> Result<Value, ExprError> {
        Err(ExprError::UnknownFunction(name.to_string()))
    }
}

/// A scope with a single bound variable
pub struct Binding<'a> {
    pub name: &'a str,
    pub value: f64,
}

impl Scope for Binding<'_> {
    fn variable(&self, name: &str) -> Option<f64> {
        (name == self.name).then_some(self.value)
    }
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            position: 0,
            end: input.len(),
        };
        let expr = parser.or()?;
        match parser.peek() {
            None => Ok(expr),
            Some((offset, token)) => Err(ExprError::Syntax {
                offset,
                message: format!("unexpected {token:?}"),
            }),
        }
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Value, ExprError> {
        match self {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Text(s) => Ok(Value::Text(s.clone())),
            Expr::Variable(name) => scope
                .variable(name)
                .map(Value::Number)
                .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
            Expr::Unary(UnaryOp::Neg, operand) => {
                Ok(Value::Number(-operand.evaluate(scope)?.as_number()?))
            },
            Expr::Unary(UnaryOp::Not, operand) => {
                Ok(Value::Bool(!operand.evaluate(scope)?.as_bool()?))
            },
            Expr::Binary(BinaryOp::And, lhs, rhs) => Ok(Value::Bool(
                lhs.evaluate(scope)?.as_bool()? && rhs.evaluate(scope)?.as_bool()?,
            )),
            Expr::Binary(BinaryOp::Or, lhs, rhs) => Ok(Value::Bool(
                lhs.evaluate(scope)?.as_bool()? || rhs.evaluate(scope)?.as_bool()?,
            )),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = lhs.evaluate(scope)?;
                let rhs = rhs.evaluate(scope)?;
                apply(*op, &lhs, &rhs)
            },
            Expr::Call(name, args) => {
                let values = args
                    .iter()
                    .map(|arg| arg.evaluate(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                scope.call(name, &values)
            },
        }
    }

    /// Distinct identifiers referenced as variables
    pub fn variables(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.visit(&mut |expr| {
            if let Expr::Variable(name) = expr {
                names.insert(name.as_str());
            }
        });
        names
    }

    fn variable_occurrences(&self) -> usize {
        let mut count = 0;
        self.visit(&mut |expr| {
            if matches!(expr, Expr::Variable(_)) {
                count += 1;
            }
        });
        count
    }

    /// Pre-order traversal
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Unary(_, operand) => operand.visit(f),
            Expr::Binary(_, lhs, rhs) => {
                lhs.visit(f);
                rhs.visit(f);
            },
            Expr::Call(_, args) => args.iter().for_each(|arg| arg.visit(f)),
            _ => {},
        }
    }

    /// Reject anything outside numbers, one variable and `+ - * /`
    pub fn check_arithmetic(&self) -> Result<(), ExprError> {
        match self {
            Expr::Number(_) | Expr::Variable(_) => Ok(()),
            Expr::Unary(UnaryOp::Neg, operand) => operand.check_arithmetic(),
            Expr::Binary(op, lhs, rhs) if op.is_arithmetic() => {
                lhs.check_arithmetic()?;
                rhs.check_arithmetic()
            },
            other => Err(ExprError::Unsupported(other.to_string())),
        }
    }

    /// Collapse variable-free arithmetic subtrees into literals
    fn fold_constants(self) -> Expr {
        match self {
            Expr::Unary(UnaryOp::Neg, operand) => match operand.fold_constants() {
                Expr::Number(n) => Expr::Number(-n),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            },
            Expr::Binary(op, lhs, rhs) if op.is_arithmetic() => {
                match (lhs.fold_constants(), rhs.fold_constants()) {
                    (Expr::Number(a), Expr::Number(b)) => Expr::Number(arithmetic(op, a, b)),
                    (lhs, rhs) => Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
                }
            },
            other => other,
        }
    }
}

fn arithmetic(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        _ => f64::NAN,
    }
}

fn apply(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => Ok(Value::Number(
            arithmetic(op, lhs.as_number()?, rhs.as_number()?),
        )),
        BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let (a, b) = (lhs.as_number()?, rhs.as_number()?);
            Ok(Value::Bool(match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                _ => a >= b,
            }))
        },
        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(match op {
            BinaryOp::And => lhs.as_bool()? && rhs.as_bool()?,
            _ => lhs.as_bool()? || rhs.as_bool()?,
        })),
    }
}

/// Derive the inverse of a single-variable arithmetic formula.
///
/// Walks from the root towards the variable, wrapping the inverse at every
/// operator. The returned tree uses the same variable name as its input.
pub fn invert(expr: &Expr) -> Result<Expr, ExprError> {
    expr.check_arithmetic()?;
    let occurrences = expr.variable_occurrences();
    if occurrences != 1 {
        return Err(ExprError::VariableCount(occurrences));
    }

    let folded = expr.clone().fold_constants();
    let variable = folded
        .variables()
        .into_iter()
        .next()
        .map(str::to_string)
        .ok_or(ExprError::VariableCount(0))?;

    let mut inverse = Expr::Variable(variable);
    let mut node = &folded;
    loop {
        match node {
            Expr::Variable(_) => return Ok(inverse),
            Expr::Unary(UnaryOp::Neg, operand) => {
                inverse = Expr::Unary(UnaryOp::Neg, Box::new(inverse));
                node = operand;
            },
            Expr::Binary(op, lhs, rhs) => {
                let (constant, inner, variable_on_left) = match (lhs.as_ref(), rhs.as_ref()) {
                    (Expr::Number(k), inner) => (*k, inner, false),
                    (inner, Expr::Number(k)) => (*k, inner, true),
                    _ => return Err(ExprError::Unsupported(node.to_string())),
                };
                // a zero factor, numerator or divisor has no inverse
                let scales = matches!(op, BinaryOp::Mul | BinaryOp::Div);
                if (scales && constant == 0.0) || !constant.is_finite() {
                    return Err(ExprError::Unsupported(node.to_string()));
                }
                let k = Box::new(Expr::Number(constant));
                let y = Box::new(inverse);
                inverse = match (op, variable_on_left) {
                    // x+k, k+x => y-k
                    (BinaryOp::Add, _) => Expr::Binary(BinaryOp::Sub, y, k),
                    // x*k, k*x => y/k
                    (BinaryOp::Mul, _) => Expr::Binary(BinaryOp::Div, y, k),
                    // x-k => y+k
                    (BinaryOp::Sub, true) => Expr::Binary(BinaryOp::Add, y, k),
                    // k-x => k-y
                    (BinaryOp::Sub, false) => Expr::Binary(BinaryOp::Sub, k, y),
                    // x/k => y*k
                    (BinaryOp::Div, true) => Expr::Binary(BinaryOp::Mul, y, k),
                    // k/x => k/y
                    (BinaryOp::Div, false) => Expr::Binary(BinaryOp::Div, k, y),
                    _ => return Err(ExprError::Unsupported(node.to_string())),
                };
                node = inner;
            },
            other => return Err(ExprError::Unsupported(other.to_string())),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn operand(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
            match expr {
                Expr::Binary(..) => write!(f, "({expr})"),
                _ => write!(f, "{expr}"),
            }
        }

        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Text(s) => write!(f, "{s:?}"),
            Expr::Variable(name) => f.write_str(name),
            Expr::Unary(UnaryOp::Neg, inner) => {
                f.write_str("-")?;
                operand(f, inner)
            },
            Expr::Unary(UnaryOp::Not, inner) => {
                f.write_str("!")?;
                operand(f, inner)
            },
            Expr::Binary(op, lhs, rhs) => {
                operand(f, lhs)?;
                f.write_str(op.symbol())?;
                operand(f, rhs)
            },
            Expr::Call(name, args) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            },
        }
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Text(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: [&str; 16] = [
    "<=", ">=", "==", "!=", "&&", "||", "+", "-", "*", "/", "<", ">", "!", "(", ")", ",",
];

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let literal = &input[start..i];
            let value = literal.parse::<f64>().map_err(|_| ExprError::Syntax {
                offset: start,
                message: format!("invalid number '{literal}'"),
            })?;
            tokens.push((start, Token::Number(value)));
        } else if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(input[start..i].to_string())));
        } else if c == b'"' || c == b'\'' {
            i += 1;
            while i < bytes.len() && bytes[i] != c {
                i += 1;
            }
            if i >= bytes.len() {
                return Err(ExprError::Syntax {
                    offset: start,
                    message: "unterminated string".to_string(),
                });
            }
            tokens.push((start, Token::Text(input[start + 1..i].to_string())));
            i += 1;
        } else {
            let rest = &input[i..];
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or_else(|| ExprError::Syntax {
                    offset: start,
                    message: format!("unexpected character '{}'", char::from(c)),
                })?;
            i += op.len();
            let token = match *op {
                "(" => Token::LParen,
                ")" => Token::RParen,
                "," => Token::Comma,
                other => Token::Op(other),
            };
            tokens.push((start, token));
        }
    }
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<(usize, &Token)> {
        self.tokens
            .get(self.position)
            .map(|(offset, token)| (*offset, token))
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat_op(&mut self, candidates: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some((_, Token::Op(op))) if candidates.contains(op) => {
                let op = *op;
                self.position += 1;
                Some(op)
            },
            _ => None,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Syntax {
            offset: self.peek().map_or(self.end, |(offset, _)| offset),
            message: message.into(),
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.eat_op(&["||"]).is_some() {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.comparison()?;
        while self.eat_op(&["&&"]).is_some() {
            let rhs = self.comparison()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.sum()?;
        let op = match self.eat_op(&["<", "<=", ">", ">=", "==", "!="]) {
            Some("<") => BinaryOp::Lt,
            Some("<=") => BinaryOp::Le,
            Some(">") => BinaryOp::Gt,
            Some(">=") => BinaryOp::Ge,
            Some("==") => BinaryOp::Eq,
            Some(_) => BinaryOp::Ne,
            None => return Ok(lhs),
        };
        let rhs = self.sum()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn sum(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.product()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
            let rhs = self.product()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn product(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/"]) {
            let op = if op == "*" { BinaryOp::Mul } else { BinaryOp::Div };
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.eat_op(&["-", "!"]) {
            Some("-") => Ok(match self.unary()? {
                Expr::Number(n) => Expr::Number(-n),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            }),
            Some(_) => Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?))),
            None => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let Some((offset, token)) = self.next() else {
            return Err(self.error("unexpected end of expression"));
        };
        match token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Text(s) => Ok(Expr::Text(s)),
            Token::Ident(name) if name == "true" => Ok(Expr::Bool(true)),
            Token::Ident(name) if name == "false" => Ok(Expr::Bool(false)),
            Token::Ident(name) => {
                if !matches!(self.peek(), Some((_, Token::LParen))) {
                    return Ok(Expr::Variable(name));
                }
                self.position += 1;
                let mut args = Vec::new();
                if !matches!(self.peek(), Some((_, Token::RParen))) {
                    loop {
                        args.push(self.or()?);
                        if matches!(self.peek(), Some((_, Token::Comma))) {
                            self.position += 1;
                        } else {
                            break;
                        }
                    }
                }
                match self.next() {
                    Some((_, Token::RParen)) => Ok(Expr::Call(name, args)),
                    _ => Err(self.error(format!("expected ')' to close call to {name}"))),
                }
            },
            Token::LParen => {
                let inner = self.or()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            },
            other => Err(ExprError::Syntax {
                offset,
                message: format!("unexpected {other:?}"),
            }),
        }
    }
}
