//! Dynamically typed runtime values.

use std::cmp::Ordering;
use std::fmt;

/// Storage type of a declared variable, resolved from its type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Int,
    Float,
    Bool,
    Str,
}

impl VarType {
    /// Resolves a declared type tag such as `int` or `double`.
    ///
    /// Unrecognised tags are treated as text.
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim().to_ascii_lowercase();
        let base = tag
            .trim_start_matches("unsigned ")
            .trim_start_matches("signed ");
        match base {
            "int" | "long" | "short" | "unsigned" | "long long" => VarType::Int,
            "float" | "double" => VarType::Float,
            "bool" | "boolean" => VarType::Bool,
            _ => VarType::Str,
        }
    }

    /// Zero value of this type.
    pub fn zero(&self) -> Value {
        match self {
            VarType::Int => Value::Int(0),
            VarType::Float => Value::Float(0.0),
            VarType::Bool => Value::Bool(false),
            VarType::Str => Value::Str(String::new()),
        }
    }
}

/// A value held by an input, output or variable, or produced by an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Default for Value {
    fn default() -> Self {
        Value::Str(String::new())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl Value {
    /// Non-zero numbers, `true` and non-empty strings are truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Returns the value as a number when it is one or is numeric text.
    ///
    /// Booleans count as `1`/`0`. The result is always `Int` or `Float`.
    pub fn numeric(&self) -> Option<Value> {
        match self {
            Value::Int(_) | Value::Float(_) => Some(self.clone()),
            Value::Bool(b) => Some(Value::Int(i64::from(*b))),
            Value::Str(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return None;
                }
                if let Ok(n) = s.parse::<i64>() {
                    return Some(Value::Int(n));
                }
                match s.parse::<f64>() {
                    Ok(x) if x.is_finite() => Some(Value::Float(x)),
                    _ => None,
                }
            }
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Int(n) => *n,
            Value::Float(x) => *x as i64,
            Value::Bool(b) => i64::from(*b),
            Value::Str(s) => atoi_safe(s),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Int(n) => *n as f64,
            Value::Float(x) => *x,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Str(s) => leading_float(s),
        }
    }

    /// Converts the value to the given storage type.
    pub fn coerce(self, ty: VarType) -> Value {
        match (ty, self) {
            (VarType::Int, v @ Value::Int(_)) => v,
            (VarType::Float, v @ Value::Float(_)) => v,
            (VarType::Bool, v @ Value::Bool(_)) => v,
            (VarType::Str, Value::Str(s)) => Value::Str(s),
            (VarType::Int, v) => Value::Int(v.as_i64()),
            (VarType::Float, v) => Value::Float(v.as_f64()),
            (VarType::Bool, Value::Str(s)) => Value::Bool(text_truthy(&s)),
            (VarType::Bool, v) => Value::Bool(v.is_truthy()),
            (VarType::Str, v) => Value::Str(v.to_string()),
        }
    }

    /// Parses wire or model text into a value of the given type.
    pub fn parse_as(text: &str, ty: VarType) -> Value {
        Value::Str(text.to_string()).coerce(ty)
    }

    /// Equality used by `==` and `!=`.
    pub fn loose_eq(&self, other: &Value) -> bool {
        self.loose_cmp(other) == Some(Ordering::Equal)
    }

    /// Ordering used by the relational operators.
    ///
    /// Compares numerically when both sides are numeric (or numeric text),
    /// textually otherwise. `None` only when a float comparison involves NaN.
    pub fn loose_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self.numeric(), other.numeric()) {
            (Some(Value::Int(a)), Some(Value::Int(b))) => Some(a.cmp(&b)),
            (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
            _ => Some(self.to_string().cmp(&other.to_string())),
        }
    }
}

/// Text truthiness for boolean storage: `false`, `0` and empty text are false.
fn text_truthy(text: &str) -> bool {
    let text = text.trim();
    if text.eq_ignore_ascii_case("false") {
        return false;
    }
    if text.eq_ignore_ascii_case("true") {
        return true;
    }
    match Value::Str(text.to_string()).numeric() {
        Some(n) => n.is_truthy(),
        None => !text.is_empty(),
    }
}

/// Parses a leading integer, ignoring anything after it.
///
/// Leading whitespace and one sign are accepted. Returns `0` when no digits
/// are present and saturates instead of overflowing.
pub fn atoi_safe(text: &str) -> i64 {
    let mut chars = text.trim_start().chars().peekable();

    let negative = match chars.peek() {
        Some('-') => {
            chars.next();
            true
        }
        Some('+') => {
            chars.next();
            false
        }
        _ => false,
    };

    let mut result: i64 = 0;
    for c in chars {
        let Some(digit) = c.to_digit(10) else {
            break;
        };
        let digit = i64::from(digit);
        result = if negative {
            result.saturating_mul(10).saturating_sub(digit)
        } else {
            result.saturating_mul(10).saturating_add(digit)
        };
    }
    result
}

/// Parses a leading decimal number (with optional exponent), `0.0` if none.
fn leading_float(text: &str) -> f64 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'-') | Some(b'+')) {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end == digits_start || &text[digits_start..end] == "." {
        return 0.0;
    }

    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'-' || bytes[exp_end] == b'+') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }

    text[..end].parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_atoi_safe() {
        assert_eq!(atoi_safe(""), 0);
        assert_eq!(atoi_safe("abc"), 0);
        assert_eq!(atoi_safe("12abc"), 12);
        assert_eq!(atoi_safe("  -42"), -42);
        assert_eq!(atoi_safe("+7"), 7);
        assert_eq!(atoi_safe("-"), 0);
        assert_eq!(atoi_safe("99999999999999999999999"), i64::MAX);
        assert_eq!(atoi_safe("-99999999999999999999999"), i64::MIN);
    }

    #[test]
    fn test_var_type_from_tag() {
        assert_eq!(VarType::from_tag("int"), VarType::Int);
        assert_eq!(VarType::from_tag("unsigned int"), VarType::Int);
        assert_eq!(VarType::from_tag("long"), VarType::Int);
        assert_eq!(VarType::from_tag("double"), VarType::Float);
        assert_eq!(VarType::from_tag("bool"), VarType::Bool);
        assert_eq!(VarType::from_tag("QString"), VarType::Str);
        assert_eq!(VarType::from_tag(""), VarType::Str);
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::Int(3).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(Value::from("0").is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::Bool(false).is_truthy());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Int(-3).to_string(), "-3");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::from("x y").to_string(), "x y");
    }

    #[test]
    fn test_coerce() {
        assert_eq!(Value::parse_as("5000", VarType::Int), Value::Int(5000));
        assert_eq!(Value::parse_as("12ms", VarType::Int), Value::Int(12));
        assert_eq!(Value::parse_as("2.5x", VarType::Float), Value::Float(2.5));
        assert_eq!(Value::parse_as("1e3", VarType::Float), Value::Float(1000.0));
        assert_eq!(Value::parse_as("", VarType::Float), Value::Float(0.0));
        assert_eq!(Value::parse_as("false", VarType::Bool), Value::Bool(false));
        assert_eq!(Value::parse_as("0", VarType::Bool), Value::Bool(false));
        assert_eq!(Value::parse_as("yes", VarType::Bool), Value::Bool(true));
        assert_eq!(Value::Float(2.9).coerce(VarType::Int), Value::Int(2));
        assert_eq!(Value::Int(1).coerce(VarType::Str), Value::from("1"));
    }

    #[test]
    fn test_loose_comparison() {
        assert!(Value::from("1").loose_eq(&Value::Int(1)));
        assert!(Value::from(" 1 ").loose_eq(&Value::Float(1.0)));
        assert!(!Value::from("abc").loose_eq(&Value::Int(0)));
        assert!(Value::from("abc").loose_eq(&Value::from("abc")));
        assert_eq!(
            Value::from("10").loose_cmp(&Value::from("9")),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Value::from("b").loose_cmp(&Value::from("a")),
            Some(Ordering::Greater)
        );
        assert!(Value::Bool(true).loose_eq(&Value::Int(1)));
    }

    proptest! {
        #[test]
        fn prop_atoi_safe_reads_integers(n in any::<i64>(), suffix in "[a-z .]{0,8}") {
            prop_assert_eq!(atoi_safe(&format!("{}{}", n, suffix)), n);
        }

        #[test]
        fn prop_atoi_safe_never_panics(s in "\\PC*") {
            let _ = atoi_safe(&s);
        }
    }
}
