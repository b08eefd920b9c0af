//! ABOUTME: Restricted, safe boolean condition evaluator used by step gating
//! ABOUTME: identifiers, field/index access, comparisons, and/or/not, len()
//!
//! This is deliberately a small hand-rolled recursive-descent evaluator
//! rather than an embedded scripting language: conditions can only read
//! values already present in the supplied [`Environment`], never execute
//! arbitrary code.

use std::collections::HashMap;
use std::fmt;

use crate::Value;

/// Named values a condition expression may reference.
#[derive(Debug, Default, Clone)]
pub struct Environment {
    vars: HashMap<String, Value>,
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.vars.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("condition syntax error: {0}")]
    Parse(String),
    #[error("condition evaluation error: {0}")]
    Eval(String),
}

/// Evaluates `expression` against `env`. Never panics; any parse or
/// evaluation error is returned rather than propagated as a crash. Callers
/// that want evaluation errors to count as `false` (logged with step
/// context) should do so at the call site.
pub fn evaluate(expression: &str, env: &Environment) -> Result<bool, ConditionError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        env,
    };
    let value = parser.parse_or()?;
    parser.expect_end()?;
    Ok(is_truthy(&value))
}

/// Like [`evaluate`] but returns the raw [`Value`] the expression reduces to
/// instead of coercing it to a boolean. Used to resolve `${expr}` templates
/// in step arguments against prior step results and context entries, with
/// the same restricted grammar conditions use (no arbitrary code execution).
pub fn evaluate_value(expression: &str, env: &Environment) -> Result<Value, ConditionError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        env,
    };
    let value = parser.parse_or()?;
    parser.expect_end()?;
    Ok(value)
}

#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Len,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err(ConditionError::Parse("unterminated string literal".into()));
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| ConditionError::Parse(format!("invalid number literal: {text}")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "len" => Token::Len,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "none" | "None" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(ConditionError::Parse(format!("unexpected character: {other}")));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    env: &'a Environment,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect_end(&self) -> Result<(), ConditionError> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(ConditionError::Parse(format!(
                "unexpected trailing tokens at position {}",
                self.pos
            )))
        }
    }

    fn parse_or(&mut self) -> Result<Value, ConditionError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let left_bool = is_truthy(&left);
            let right = self.parse_and()?;
            left = Value::Bool(left_bool || is_truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value, ConditionError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let left_bool = is_truthy(&left);
            let right = self.parse_not()?;
            left = Value::Bool(left_bool && is_truthy(&right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Value, ConditionError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Value::Bool(!is_truthy(&inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Value, ConditionError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(Token::Eq),
            Some(Token::Ne) => Some(Token::Ne),
            Some(Token::Lt) => Some(Token::Lt),
            Some(Token::Le) => Some(Token::Le),
            Some(Token::Gt) => Some(Token::Gt),
            Some(Token::Ge) => Some(Token::Ge),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.advance();
        let right = self.parse_primary()?;
        Ok(Value::Bool(compare(&op, &left, &right)?))
    }

    fn parse_primary(&mut self) -> Result<Value, ConditionError> {
        match self.advance().cloned() {
            Some(Token::Number(n)) => Ok(Value::from(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ConditionError::Parse("expected closing parenthesis".into())),
                }
            }
            Some(Token::Len) => {
                match self.advance() {
                    Some(Token::LParen) => {}
                    _ => return Err(ConditionError::Parse("expected '(' after len".into())),
                }
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => {}
                    _ => return Err(ConditionError::Parse("expected ')' after len(...)".into())),
                }
                Ok(Value::from(length_of(&inner)?))
            }
            Some(Token::Ident(name)) => {
                let base = self
                    .env
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| ConditionError::Eval(format!("unknown identifier: {name}")))?;
                self.parse_accessors(base)
            }
            other => Err(ConditionError::Parse(format!("unexpected token: {other:?}"))),
        }
    }

    /// Consumes a chain of `.field` and `[expr]` accessors applied to `base`.
    fn parse_accessors(&mut self, mut value: Value) -> Result<Value, ConditionError> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let field = match self.advance().cloned() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(ConditionError::Parse(format!(
                                "expected field name after '.', got {other:?}"
                            )))
                        }
                    };
                    value = index_field(&value, &field)?;
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index_value = self.parse_or()?;
                    match self.advance() {
                        Some(Token::RBracket) => {}
                        other => {
                            return Err(ConditionError::Parse(format!(
                                "expected closing ']', got {other:?}"
                            )))
                        }
                    }
                    value = index_value_into(&value, &index_value)?;
                }
                _ => break,
            }
        }
        Ok(value)
    }
}

fn index_field(value: &Value, field: &str) -> Result<Value, ConditionError> {
    match value {
        Value::Object(map) => Ok(map.get(field).cloned().unwrap_or(Value::Null)),
        _ => Err(ConditionError::Eval(format!(
            "cannot access field '{field}' on a non-object value"
        ))),
    }
}

fn index_value_into(value: &Value, index: &Value) -> Result<Value, ConditionError> {
    match (value, index) {
        (Value::Array(arr), Value::Number(n)) => {
            let idx = n
                .as_i64()
                .ok_or_else(|| ConditionError::Eval("array index must be an integer".into()))?;
            let idx = usize::try_from(idx).map_err(|_| ConditionError::Eval("array index out of range".into()))?;
            Ok(arr.get(idx).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(map), Value::String(key)) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
        _ => Err(ConditionError::Eval("unsupported index operation".into())),
    }
}

fn compare(op: &Token, left: &Value, right: &Value) -> Result<bool, ConditionError> {
    match op {
        Token::Eq => Ok(values_equal(left, right)),
        Token::Ne => Ok(!values_equal(left, right)),
        Token::Lt | Token::Le | Token::Gt | Token::Ge => {
            let (l, r) = (
                left.as_f64().ok_or_else(|| ConditionError::Eval("ordering comparison requires numbers".into()))?,
                right.as_f64().ok_or_else(|| ConditionError::Eval("ordering comparison requires numbers".into()))?,
            );
            Ok(match op {
                Token::Lt => l < r,
                Token::Le => l <= r,
                Token::Gt => l > r,
                Token::Ge => l >= r,
                _ => unreachable!(),
            })
        }
        _ => unreachable!(),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    left == right
}

fn length_of(value: &Value) -> Result<f64, ConditionError> {
    match value {
        Value::String(s) => Ok(s.chars().count() as f64),
        Value::Array(a) => Ok(a.len() as f64),
        Value::Object(o) => Ok(o.len() as f64),
        _ => Err(ConditionError::Eval("len() requires a string, array, or object".into())),
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env_with(pairs: &[(&str, Value)]) -> Environment {
        let mut env = Environment::new();
        for (k, v) in pairs {
            env.insert(*k, v.clone());
        }
        env
    }

    #[test]
    fn literal_true_is_truthy() {
        let env = Environment::new();
        assert!(evaluate("true", &env).unwrap());
        assert!(!evaluate("false", &env).unwrap());
    }

    #[test]
    fn dotted_field_access_and_equality() {
        let env = env_with(&[("a", json!({"skip": true}))]);
        assert!(evaluate("a.skip == true", &env).unwrap());
    }

    #[test]
    fn index_access_into_array() {
        let env = env_with(&[("items", json!([1, 2, 3]))]);
        assert!(evaluate("items[1] == 2", &env).unwrap());
    }

    #[test]
    fn and_or_not_short_circuit_semantics() {
        let env = env_with(&[("a", json!(true)), ("b", json!(false))]);
        assert!(evaluate("a and not b", &env).unwrap());
        assert!(evaluate("b or a", &env).unwrap());
        assert!(!evaluate("b and a", &env).unwrap());
    }

    #[test]
    fn len_of_string_and_array() {
        let env = env_with(&[("s", json!("hello")), ("xs", json!([1, 2]))]);
        assert!(evaluate("len(s) == 5", &env).unwrap());
        assert!(evaluate("len(xs) == 2", &env).unwrap());
    }

    #[test]
    fn unknown_identifier_is_an_error_not_a_panic() {
        let env = Environment::new();
        assert!(evaluate("missing == 1", &env).is_err());
    }

    #[test]
    fn ordering_comparisons() {
        let env = env_with(&[("n", json!(5))]);
        assert!(evaluate("n > 3", &env).unwrap());
        assert!(evaluate("n <= 5", &env).unwrap());
        assert!(!evaluate("n < 5", &env).unwrap());
    }

    #[test]
    fn bare_field_reference_is_truthy_coerced() {
        let env = env_with(&[("a", json!({"skip": true}))]);
        assert!(evaluate("a.skip", &env).unwrap());
    }

    #[test]
    fn malformed_expression_is_an_error() {
        let env = Environment::new();
        assert!(evaluate("1 ==", &env).is_err());
    }

    #[test]
    fn evaluate_value_resolves_a_field_reference_to_its_raw_value() {
        let env = env_with(&[("a", json!({"v": 2}))]);
        assert_eq!(evaluate_value("a.v", &env).unwrap(), json!(2));
    }

    #[test]
    fn evaluate_value_resolves_a_bare_identifier_to_its_whole_value() {
        let env = env_with(&[("a", json!({"v": 2, "skip": false}))]);
        assert_eq!(evaluate_value("a", &env).unwrap(), json!({"v": 2, "skip": false}));
    }
}
