//! Entry-action and guard expression language.
//!
//! Entry actions are statement sequences run once per state entry; guards are
//! single expressions whose truthiness decides whether a transition may fire.
//! Both are parsed when the model is loaded and interpreted against a
//! [`Context`] at run time.
//!
//! The language supports:
//!
//! - literals: `42`, `0.5`, `"text"` (with `\"`, `\\`, `\n`, `\t`), `true`, `false`
//! - `name` - value of a variable, input or output (in that order)
//! - `||`, `&&`, `==`, `!=`, `<`, `<=`, `>`, `>=`, `+`, `-`, `*`, `/`, `%`, `!`, unary `-`
//! - `name = expr;`, `name += expr;`, `name -= expr;`, `name++;`, `name--;`
//! - `if (cond) stmt else stmt`, `{ ... }` blocks, `//` and `/* */` comments
//!
//! Built-in functions:
//!
//! - `valueof("name")` - current value as text, empty if undefined
//! - `defined("name")` - true once the input has been set
//! - `called("name")` - true once per `call` pulse; reading clears the pulse
//! - `output("name", value)` - writes an output
//! - `elapsed()` - milliseconds since the current state was entered
//! - `atoi_safe(text)` - leading integer of `text`, `0` if none
//! - `log(text)` - emits a log message to controllers
//!
//! Examples:
//! - `defined("in") && atoi_safe(valueof("in")) == 1`
//! - `output("out", 1); count++;`
//! - `if (elapsed() > 1000) output("late", true); else log("on time")`
//!
//! Run-time problems never abort evaluation: they are logged and the offending
//! sub-expression yields an empty, zero or false value.

use crate::error::CoreError;
use crate::value::{atoi_safe, Value};
use std::cmp::Ordering;
use tracing::warn;

/// Symbol table and side-effect sink an expression is evaluated against.
pub trait Context {
    /// Reads a variable, input or output by name.
    fn lookup(&self, name: &str) -> Option<Value>;

    /// Returns whether the name currently holds a value.
    fn is_defined(&self, name: &str) -> bool;

    /// Returns and clears the pending call pulse of an input.
    fn take_call(&mut self, name: &str) -> bool;

    /// Writes an output.
    fn set_output(&mut self, name: &str, value: Value);

    /// Writes a variable; returns false when `name` is not a variable.
    fn assign(&mut self, name: &str, value: Value) -> bool;

    /// Milliseconds since the current state was entered.
    fn elapsed_ms(&self) -> i64;

    fn log(&mut self, message: String);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Call { name: String, args: Vec<Expr> },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign {
        name: String,
        op: AssignOp,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
    },
    Block(Vec<Stmt>),
}

/// A parsed entry action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    stmts: Vec<Stmt>,
}

impl Program {
    /// Parses a statement sequence. Empty source yields an empty program.
    pub fn parse(source: &str) -> Result<Self, CoreError> {
        let mut parser = Parser::new(source);
        let mut stmts = Vec::new();

        loop {
            parser.skip_whitespace();
            if parser.at_end() {
                break;
            }
            stmts.push(parser.parse_statement()?);
        }

        Ok(Self { stmts })
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    pub fn statements(&self) -> &[Stmt] {
        &self.stmts
    }

    /// Runs every statement in order.
    pub fn execute(&self, ctx: &mut dyn Context) {
        for stmt in &self.stmts {
            stmt.execute(ctx);
        }
    }
}

impl Stmt {
    pub fn execute(&self, ctx: &mut dyn Context) {
        match self {
            Stmt::Expr(expr) => {
                expr.evaluate(ctx);
            }
            Stmt::Assign { name, op, value } => {
                let rhs = value.evaluate(ctx);
                let new_value = match op {
                    AssignOp::Set => rhs,
                    AssignOp::Add => {
                        arithmetic(BinaryOp::Add, ctx.lookup(name).unwrap_or_default(), rhs)
                    }
                    AssignOp::Sub => {
                        arithmetic(BinaryOp::Sub, ctx.lookup(name).unwrap_or_default(), rhs)
                    }
                };
                if !ctx.assign(name, new_value) {
                    warn!("Ignoring assignment to '{}': not a variable", name);
                }
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if cond.evaluate(ctx).is_truthy() {
                    then.execute(ctx);
                } else if let Some(otherwise) = otherwise {
                    otherwise.execute(ctx);
                }
            }
            Stmt::Block(stmts) => {
                for stmt in stmts {
                    stmt.execute(ctx);
                }
            }
        }
    }
}

impl Expr {
    /// Parses a single expression, as used for transition guards.
    ///
    /// One trailing `;` is tolerated.
    pub fn parse(source: &str) -> Result<Self, CoreError> {
        let mut parser = Parser::new(source);
        parser.skip_whitespace();
        if parser.at_end() {
            return Err(CoreError::expression("empty expression"));
        }

        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.peek_char() == Some(';') {
            parser.pos += 1;
            parser.skip_whitespace();
        }
        if !parser.at_end() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Evaluates the expression.
    pub fn evaluate(&self, ctx: &mut dyn Context) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Ident(name) => ctx.lookup(name).unwrap_or_else(|| {
                warn!("Undefined name '{}'", name);
                Value::default()
            }),
            Expr::Call { name, args } => call_builtin(name, args, ctx),
            Expr::Unary(UnaryOp::Not, inner) => Value::Bool(!inner.evaluate(ctx).is_truthy()),
            Expr::Unary(UnaryOp::Neg, inner) => match inner.evaluate(ctx).numeric() {
                Some(Value::Int(n)) => Value::Int(n.wrapping_neg()),
                Some(Value::Float(x)) => Value::Float(-x),
                _ => {
                    warn!("Cannot negate a non-numeric value");
                    Value::Int(0)
                }
            },
            Expr::Binary(BinaryOp::Or, left, right) => {
                Value::Bool(left.evaluate(ctx).is_truthy() || right.evaluate(ctx).is_truthy())
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                Value::Bool(left.evaluate(ctx).is_truthy() && right.evaluate(ctx).is_truthy())
            }
            Expr::Binary(op, left, right) => {
                let l = left.evaluate(ctx);
                let r = right.evaluate(ctx);
                match op {
                    BinaryOp::Eq => Value::Bool(l.loose_eq(&r)),
                    BinaryOp::Ne => Value::Bool(!l.loose_eq(&r)),
                    BinaryOp::Lt => Value::Bool(l.loose_cmp(&r) == Some(Ordering::Less)),
                    BinaryOp::Le => Value::Bool(matches!(
                        l.loose_cmp(&r),
                        Some(Ordering::Less | Ordering::Equal)
                    )),
                    BinaryOp::Gt => Value::Bool(l.loose_cmp(&r) == Some(Ordering::Greater)),
                    BinaryOp::Ge => Value::Bool(matches!(
                        l.loose_cmp(&r),
                        Some(Ordering::Greater | Ordering::Equal)
                    )),
                    _ => arithmetic(*op, l, r),
                }
            }
        }
    }
}

fn arithmetic(op: BinaryOp, left: Value, right: Value) -> Value {
    if op == BinaryOp::Add && (matches!(left, Value::Str(_)) || matches!(right, Value::Str(_))) {
        return Value::Str(format!("{}{}", left, right));
    }

    let (Some(l), Some(r)) = (left.numeric(), right.numeric()) else {
        warn!("Arithmetic on non-numeric operands '{}' and '{}'", left, right);
        return Value::Int(0);
    };

    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Value::Int(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => {
                warn!("Division by zero");
                0
            }
            BinaryOp::Div => a.wrapping_div(b),
            BinaryOp::Rem => a.wrapping_rem(b),
            _ => 0,
        }),
        (l, r) => {
            let (a, b) = (l.as_f64(), r.as_f64());
            Value::Float(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
                    warn!("Division by zero");
                    0.0
                }
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                _ => 0.0,
            })
        }
    }
}

/// Resolves a name argument: a bare identifier names itself, anything else
/// is evaluated and used as text.
fn name_arg(arg: &Expr, ctx: &mut dyn Context) -> String {
    match arg {
        Expr::Ident(name) => name.clone(),
        other => other.evaluate(ctx).to_string(),
    }
}

fn call_builtin(name: &str, args: &[Expr], ctx: &mut dyn Context) -> Value {
    let expected = match name {
        "elapsed" => 0,
        "valueof" | "defined" | "called" | "atoi_safe" | "log" => 1,
        "output" => 2,
        _ => {
            warn!("Unknown function '{}'", name);
            return Value::default();
        }
    };
    if args.len() != expected {
        warn!(
            "{}() takes {} argument(s), got {}",
            name,
            expected,
            args.len()
        );
        return Value::default();
    }

    match name {
        "valueof" => {
            let target = name_arg(&args[0], ctx);
            Value::Str(
                ctx.lookup(&target)
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            )
        }
        "defined" => {
            let target = name_arg(&args[0], ctx);
            Value::Bool(ctx.is_defined(&target))
        }
        "called" => {
            let target = name_arg(&args[0], ctx);
            Value::Bool(ctx.take_call(&target))
        }
        "output" => {
            let target = name_arg(&args[0], ctx);
            let value = args[1].evaluate(ctx);
            ctx.set_output(&target, value.clone());
            value
        }
        "elapsed" => Value::Int(ctx.elapsed_ms()),
        "atoi_safe" => Value::Int(atoi_safe(&args[0].evaluate(ctx).to_string())),
        "log" => {
            let message = args[0].evaluate(ctx).to_string();
            ctx.log(message);
            Value::default()
        }
        _ => Value::default(),
    }
}

/// Deepest nesting of blocks, conditionals, parentheses and unary operators.
pub const MAX_NESTING: usize = 128;

/// Recursive descent parser for actions and guards.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
        }
    }

    fn error(&self, message: &str) -> CoreError {
        CoreError::expression(format!("{} at offset {}", message, self.pos))
    }

    /// Runs `parse` one nesting level deeper, failing past [`MAX_NESTING`].
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_statement(&mut self) -> Result<Stmt, CoreError> {
        self.nested(Self::parse_single_statement)
    }

    fn parse_single_statement(&mut self) -> Result<Stmt, CoreError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some(';') => {
                self.pos += 1;
                return Ok(Stmt::Block(Vec::new()));
            }
            Some('{') => {
                self.pos += 1;
                return self.parse_block();
            }
            _ => {}
        }

        if self.peek_keyword("if") {
            return self.parse_if();
        }

        if let Some(stmt) = self.try_parse_assignment()? {
            return Ok(stmt);
        }

        let expr = self.parse_expr()?;
        self.expect_terminator()?;
        Ok(Stmt::Expr(expr))
    }

    fn parse_block(&mut self) -> Result<Stmt, CoreError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek_char() {
                Some('}') => {
                    self.pos += 1;
                    return Ok(Stmt::Block(stmts));
                }
                None => return Err(self.error("expected '}'")),
                _ => stmts.push(self.parse_statement()?),
            }
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, CoreError> {
        self.pos += 2;
        self.skip_whitespace();
        self.expect_char('(')?;
        let cond = self.parse_expr()?;
        self.skip_whitespace();
        self.expect_char(')')?;

        let then = Box::new(self.parse_statement()?);

        self.skip_whitespace();
        let otherwise = if self.peek_keyword("else") {
            self.pos += 4;
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };

        Ok(Stmt::If {
            cond,
            then,
            otherwise,
        })
    }

    /// Parses `name op ...;` if the statement starts that way, otherwise
    /// rewinds and returns `None`.
    fn try_parse_assignment(&mut self) -> Result<Option<Stmt>, CoreError> {
        let start = self.pos;
        let Some(name) = self.parse_identifier() else {
            return Ok(None);
        };
        self.skip_whitespace();

        let step = |op| {
            Some(Stmt::Assign {
                name: name.clone(),
                op,
                value: Expr::Literal(Value::Int(1)),
            })
        };

        let stmt = if self.peek_str("++") {
            self.pos += 2;
            step(AssignOp::Add)
        } else if self.peek_str("--") {
            self.pos += 2;
            step(AssignOp::Sub)
        } else {
            let op = if self.peek_str("+=") {
                self.pos += 2;
                AssignOp::Add
            } else if self.peek_str("-=") {
                self.pos += 2;
                AssignOp::Sub
            } else if self.peek_char() == Some('=') && !self.peek_str("==") {
                self.pos += 1;
                AssignOp::Set
            } else {
                self.pos = start;
                return Ok(None);
            };
            let value = self.parse_expr()?;
            Some(Stmt::Assign {
                name: name.clone(),
                op,
                value,
            })
        };

        self.expect_terminator()?;
        Ok(stmt)
    }

    fn expect_terminator(&mut self) -> Result<(), CoreError> {
        self.skip_whitespace();
        match self.peek_char() {
            Some(';') => {
                self.pos += 1;
                Ok(())
            }
            None | Some('}') => Ok(()),
            Some(_) => Err(self.error("expected ';'")),
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), CoreError> {
        if self.peek_char() != Some(expected) {
            return Err(self.error(&format!("expected '{}'", expected)));
        }
        self.pos += expected.len_utf8();
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_equality()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_relational()?;

        loop {
            self.skip_whitespace();
            let op = if self.peek_str("==") {
                BinaryOp::Eq
            } else if self.peek_str("!=") {
                BinaryOp::Ne
            } else {
                return Ok(left);
            };
            self.pos += 2;
            let right = self.parse_relational()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_relational(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_additive()?;

        loop {
            self.skip_whitespace();
            let (op, len) = if self.peek_str("<=") {
                (BinaryOp::Le, 2)
            } else if self.peek_str(">=") {
                (BinaryOp::Ge, 2)
            } else if self.peek_char() == Some('<') {
                (BinaryOp::Lt, 1)
            } else if self.peek_char() == Some('>') {
                (BinaryOp::Gt, 1)
            } else {
                return Ok(left);
            };
            self.pos += len;
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_multiplicative()?;

        loop {
            self.skip_whitespace();
            if self.peek_str("+=") || self.peek_str("-=") || self.peek_str("++") || self.peek_str("--") {
                return Ok(left);
            }
            let op = match self.peek_char() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_unary()?;

        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        self.nested(Self::parse_unary_operand)
    }

    fn parse_unary_operand(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('!') => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)))
            }
            Some('-') => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(match inner {
                    Expr::Literal(Value::Int(n)) => Expr::Literal(Value::Int(n.wrapping_neg())),
                    Expr::Literal(Value::Float(x)) => Expr::Literal(Value::Float(-x)),
                    other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
                })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                self.expect_char(')')?;
                Ok(expr)
            }
            Some('"') => self.parse_string().map(|s| Expr::Literal(Value::Str(s))),
            Some(c) if c.is_ascii_digit() || (c == '.' && self.next_is_digit()) => {
                self.parse_number().map(Expr::Literal)
            }
            Some(_) => {
                let Some(name) = self.parse_identifier() else {
                    return Err(self.error("expected expression"));
                };
                match name.as_str() {
                    "true" => return Ok(Expr::Literal(Value::Bool(true))),
                    "false" => return Ok(Expr::Literal(Value::Bool(false))),
                    _ => {}
                }

                self.skip_whitespace();
                if self.peek_char() == Some('(') {
                    self.pos += 1;
                    let args = self.parse_arguments()?;
                    return Ok(Expr::Call { name, args });
                }
                Ok(Expr::Ident(name))
            }
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, CoreError> {
        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek_char() == Some(')') {
            self.pos += 1;
            return Ok(args);
        }

        loop {
            args.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some(')') => {
                    self.pos += 1;
                    return Ok(args);
                }
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String, CoreError> {
        self.pos += 1; // opening quote
        let mut out = String::new();

        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            match c {
                '"' => return Ok(out),
                '\\' => {
                    let Some(escaped) = self.peek_char() else {
                        break;
                    };
                    self.pos += escaped.len_utf8();
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                }
                c => out.push(c),
            }
        }

        Err(self.error("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Value, CoreError> {
        let start = self.pos;
        let mut is_float = false;

        self.skip_digits();
        if self.peek_char() == Some('.') {
            is_float = true;
            self.pos += 1;
            self.skip_digits();
        }
        if matches!(self.peek_char(), Some('e') | Some('E')) {
            let mark = self.pos;
            self.pos += 1;
            if matches!(self.peek_char(), Some('+') | Some('-')) {
                self.pos += 1;
            }
            if self.next_is_digit_here() {
                is_float = true;
                self.skip_digits();
            } else {
                self.pos = mark;
            }
        }

        let text = &self.input[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| self.error(&format!("invalid number '{}'", text)))
        } else {
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| self.error(&format!("integer literal '{}' out of range", text)))
        }
    }

    fn parse_identifier(&mut self) -> Option<String> {
        let start = self.pos;
        match self.peek_char() {
            Some(c) if c.is_alphabetic() || c == '_' => self.pos += c.len_utf8(),
            _ => return None,
        }
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        Some(self.input[start..self.pos].to_string())
    }

    fn skip_digits(&mut self) {
        while self.next_is_digit_here() {
            self.pos += 1;
        }
    }

    fn next_is_digit_here(&self) -> bool {
        matches!(self.peek_char(), Some(c) if c.is_ascii_digit())
    }

    /// True when the character after the current one is a digit.
    fn next_is_digit(&self) -> bool {
        matches!(self.input[self.pos..].chars().nth(1), Some(c) if c.is_ascii_digit())
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        if !self.peek_str(keyword) {
            return false;
        }
        !matches!(
            self.input[self.pos + keyword.len()..].chars().next(),
            Some(c) if c.is_alphanumeric() || c == '_'
        )
    }

    /// Skips whitespace and comments.
    fn skip_whitespace(&mut self) {
        loop {
            while let Some(c) = self.peek_char() {
                if c.is_whitespace() {
                    self.pos += c.len_utf8();
                } else {
                    break;
                }
            }

            if self.peek_str("//") {
                match self.input[self.pos..].find('\n') {
                    Some(offset) => self.pos += offset + 1,
                    None => self.pos = self.input.len(),
                }
            } else if self.peek_str("/*") {
                match self.input[self.pos + 2..].find("*/") {
                    Some(offset) => self.pos += offset + 4,
                    None => self.pos = self.input.len(),
                }
            } else {
                return;
            }
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct TestContext {
        variables: HashMap<String, Value>,
        inputs: HashMap<String, Value>,
        outputs: HashMap<String, Value>,
        calls: HashSet<String>,
        logs: Vec<String>,
        elapsed: i64,
    }

    impl Context for TestContext {
        fn lookup(&self, name: &str) -> Option<Value> {
            self.variables
                .get(name)
                .or_else(|| self.inputs.get(name))
                .or_else(|| self.outputs.get(name))
                .cloned()
        }

        fn is_defined(&self, name: &str) -> bool {
            self.lookup(name).is_some()
        }

        fn take_call(&mut self, name: &str) -> bool {
            self.calls.remove(name)
        }

        fn set_output(&mut self, name: &str, value: Value) {
            self.outputs.insert(name.to_string(), value);
        }

        fn assign(&mut self, name: &str, value: Value) -> bool {
            match self.variables.get_mut(name) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            }
        }

        fn elapsed_ms(&self) -> i64 {
            self.elapsed
        }

        fn log(&mut self, message: String) {
            self.logs.push(message);
        }
    }

    fn eval(source: &str, ctx: &mut TestContext) -> Value {
        Expr::parse(source).unwrap().evaluate(ctx)
    }

    fn run(source: &str, ctx: &mut TestContext) {
        Program::parse(source).unwrap().execute(ctx);
    }

    #[test]
    fn test_literals_and_arithmetic() {
        let mut ctx = TestContext::default();
        assert_eq!(eval("1 + 2 * 3", &mut ctx), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3", &mut ctx), Value::Int(9));
        assert_eq!(eval("7 / 2", &mut ctx), Value::Int(3));
        assert_eq!(eval("7 % 4", &mut ctx), Value::Int(3));
        assert_eq!(eval("7 / 2.0", &mut ctx), Value::Float(3.5));
        assert_eq!(eval("-7 + 2", &mut ctx), Value::Int(-5));
        assert_eq!(eval("5 / 0", &mut ctx), Value::Int(0));
        assert_eq!(eval("\"a\" + 1", &mut ctx), Value::from("a1"));
        assert_eq!(eval("\"x\\\"y\"", &mut ctx), Value::from("x\"y"));
    }

    #[test]
    fn test_comparison_and_logic() {
        let mut ctx = TestContext::default();
        ctx.inputs.insert("in".into(), Value::from("1"));

        assert_eq!(eval("in == 1", &mut ctx), Value::Bool(true));
        assert_eq!(eval("in != 1", &mut ctx), Value::Bool(false));
        assert_eq!(eval("in < 2 && in >= 1", &mut ctx), Value::Bool(true));
        assert_eq!(eval("in > 5 || !false", &mut ctx), Value::Bool(true));
        assert_eq!(eval("\"abc\" < \"abd\"", &mut ctx), Value::Bool(true));
        assert_eq!(eval("1 < 2 == true", &mut ctx), Value::Bool(true));
    }

    #[test]
    fn test_builtins() {
        let mut ctx = TestContext::default();
        ctx.inputs.insert("in".into(), Value::from("12abc"));
        ctx.elapsed = 1500;

        assert_eq!(
            eval("defined(\"in\") && atoi_safe(valueof(\"in\")) == 12", &mut ctx),
            Value::Bool(true)
        );
        assert_eq!(eval("defined(\"other\")", &mut ctx), Value::Bool(false));
        assert_eq!(eval("valueof(\"other\")", &mut ctx), Value::from(""));
        assert_eq!(eval("valueof(in)", &mut ctx), Value::from("12abc"));
        assert_eq!(eval("elapsed() > 1000", &mut ctx), Value::Bool(true));
        assert_eq!(eval("atoi_safe(\"\")", &mut ctx), Value::Int(0));
    }

    #[test]
    fn test_called_is_consumed_once() {
        let mut ctx = TestContext::default();
        ctx.calls.insert("go".into());

        let guard = Expr::parse("called(\"go\")").unwrap();
        assert_eq!(guard.evaluate(&mut ctx), Value::Bool(true));
        assert_eq!(guard.evaluate(&mut ctx), Value::Bool(false));
    }

    #[test]
    fn test_statements() {
        let mut ctx = TestContext::default();
        ctx.variables.insert("count".into(), Value::Int(0));

        run(
            r#"
            // entry action
            output("out", 1);
            count++; count += 10; count -= 2;
            if (count > 5) { log("big"); } else log("small");
            /* trailing statement without a semicolon */
            output("out2", count * 2)
            "#,
            &mut ctx,
        );

        assert_eq!(ctx.outputs.get("out"), Some(&Value::Int(1)));
        assert_eq!(ctx.variables.get("count"), Some(&Value::Int(9)));
        assert_eq!(ctx.outputs.get("out2"), Some(&Value::Int(18)));
        assert_eq!(ctx.logs, vec!["big".to_string()]);
    }

    #[test]
    fn test_assignment_to_non_variable_is_ignored() {
        let mut ctx = TestContext::default();
        ctx.inputs.insert("in".into(), Value::from("1"));

        run("in = 5; undefined_thing = 2;", &mut ctx);
        assert_eq!(ctx.inputs.get("in"), Some(&Value::from("1")));
        assert!(ctx.variables.is_empty());
    }

    #[test]
    fn test_if_else_chain() {
        let mut ctx = TestContext::default();
        ctx.variables.insert("x".into(), Value::Int(2));
        ctx.variables.insert("r".into(), Value::from(""));

        run(
            "if (x == 1) r = \"one\"; else if (x == 2) r = \"two\"; else r = \"many\";",
            &mut ctx,
        );
        assert_eq!(ctx.variables.get("r"), Some(&Value::from("two")));
    }

    #[test]
    fn test_runtime_problems_do_not_abort() {
        let mut ctx = TestContext::default();
        assert_eq!(eval("nope", &mut ctx), Value::from(""));
        assert_eq!(eval("mystery(1)", &mut ctx), Value::from(""));
        assert_eq!(eval("atoi_safe()", &mut ctx), Value::from(""));
        assert_eq!(eval("-\"abc\"", &mut ctx), Value::Int(0));
        assert_eq!(eval("true * 3", &mut ctx), Value::Int(3));
    }

    #[test]
    fn test_empty_program() {
        assert!(Program::parse("").unwrap().is_empty());
        assert!(Program::parse("  // nothing\n").unwrap().is_empty());
        assert_eq!(Program::parse(";;").unwrap().statements().len(), 2);
    }

    #[test]
    fn test_guard_with_trailing_semicolon() {
        let mut ctx = TestContext::default();
        assert_eq!(eval("1 == 1;", &mut ctx), Value::Bool(true));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("(1 + 2").is_err());
        assert!(Expr::parse("1 +").is_err());
        assert!(Expr::parse("a b").is_err());
        assert!(Expr::parse("\"open").is_err());
        assert!(Expr::parse("f(1, 2").is_err());
        assert!(Program::parse("x = ;").is_err());
        assert!(Program::parse("{ x = 1;").is_err());
        assert!(Program::parse("if x) y;").is_err());
        assert!(Program::parse("a = 1 b = 2").is_err());

        let err = Expr::parse("1 +").unwrap_err();
        assert!(matches!(err, CoreError::InvalidExpression { .. }));
    }

    #[test]
    fn test_nesting_limit() {
        let deep = 10_000;
        let nots = format!("{}1", "!".repeat(deep));
        let parens = format!("{}1{}", "(".repeat(deep), ")".repeat(deep));
        let calls = format!("{}1{}", "atoi_safe(".repeat(deep), ")".repeat(deep));
        let blocks = format!("{}{}", "{".repeat(deep), "}".repeat(deep));
        let ifs = format!("{}x = 1;", "if (1) ".repeat(deep));

        for source in [&nots, &parens, &calls] {
            let err = Expr::parse(source).unwrap_err();
            assert!(err.to_string().contains("nesting too deep"), "{}", err);
        }
        for source in [&blocks, &ifs] {
            let err = Program::parse(source).unwrap_err();
            assert!(err.to_string().contains("nesting too deep"), "{}", err);
        }

        let mut ctx = TestContext::default();
        let shallow = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(eval(&shallow, &mut ctx), Value::Int(1));
        let nots = format!("{}1", "!".repeat(100));
        assert_eq!(eval(&nots, &mut ctx), Value::Bool(true));
    }
}
