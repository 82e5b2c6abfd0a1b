//! Expression evaluation on the child side of a worker.
//!
//! The serve loop is generic over an [`Evaluator`], so embedders can wire
//! in whatever evaluation strategy their child process supports. The
//! bundled [`ExprEvaluator`] handles integer arithmetic plus a few builtins
//! that exist mainly to exercise worker failure paths:
//!
//! - `error("msg")` fails the evaluation with a captured backtrace
//! - `abort()` aborts the child process outright
//! - `sleep(ms)` blocks the serve loop for `ms` milliseconds

use serde_json::Value;

use crate::worker::protocol::EvalError;

/// Evaluates expressions for [`serve_requests`].
///
/// [`serve_requests`]: crate::worker::serve_requests
pub trait Evaluator: Send {
    /// Evaluates `expr` in the namespace `module`.
    ///
    /// Evaluators without namespaces ignore `module`. Failures are returned
    /// as data; the serve loop forwards them to the parent verbatim.
    fn eval(&mut self, module: &str, expr: &str) -> Result<Value, EvalError>;
}

impl<F> Evaluator for F
where
    F: FnMut(&str, &str) -> Result<Value, EvalError> + Send,
{
    fn eval(&mut self, module: &str, expr: &str) -> Result<Value, EvalError> {
        self(module, expr)
    }
}

/// Integer arithmetic evaluator with failure-injection builtins.
///
/// Supports `+ - * /`, unary minus, parentheses, and 64-bit integer
/// literals. Division is integer division; division by zero and overflow
/// are evaluation errors, not panics.
///
/// # Example
///
/// ```
/// use taskutil::worker::{Evaluator, ExprEvaluator};
///
/// let mut eval = ExprEvaluator::new();
/// let value = eval.eval("Main", "(1 + 2) * -3").unwrap();
/// assert_eq!(value, serde_json::json!(-9));
/// ```
#[derive(Debug, Default)]
pub struct ExprEvaluator {
    _private: (),
}

impl ExprEvaluator {
    /// Creates an evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Evaluator for ExprEvaluator {
    fn eval(&mut self, _module: &str, expr: &str) -> Result<Value, EvalError> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser { tokens, pos: 0 };
        let value = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(EvalError::new(format!(
                "unexpected trailing input at offset {}",
                parser.pos
            )));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Ident(String),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('"') => text.push('"'),
                            Some('\\') => text.push('\\'),
                            Some(other) => {
                                return Err(EvalError::new(format!(
                                    "unsupported escape '\\{other}'"
                                )))
                            }
                            None => return Err(EvalError::new("unterminated string literal")),
                        },
                        Some(other) => text.push(other),
                        None => return Err(EvalError::new("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(text));
            }
            '0'..='9' => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = digits
                    .parse::<i64>()
                    .map_err(|_| EvalError::new(format!("integer literal out of range: {digits}")))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&i) = chars.peek() {
                    if i.is_ascii_alphanumeric() || i == '_' {
                        ident.push(i);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(EvalError::new(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
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
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), EvalError> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            other => Err(EvalError::new(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn expression(&mut self) -> Result<Value, EvalError> {
        // Strings stay strings until an operator forces integer coercion.
        let mut left = self.term_value()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Plus => {
                    self.pos += 1;
                    let l = as_int(left)?;
                    let r = as_int(self.term_value()?)?;
                    left = Value::from(
                        l.checked_add(r)
                            .ok_or_else(|| EvalError::new("integer overflow"))?,
                    );
                }
                Token::Minus => {
                    self.pos += 1;
                    let l = as_int(left)?;
                    let r = as_int(self.term_value()?)?;
                    left = Value::from(
                        l.checked_sub(r)
                            .ok_or_else(|| EvalError::new("integer overflow"))?,
                    );
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn term_value(&mut self) -> Result<Value, EvalError> {
        let mut left = self.factor()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Star => {
                    self.pos += 1;
                    let l = as_int(left)?;
                    let r = as_int(self.factor()?)?;
                    left = Value::from(
                        l.checked_mul(r)
                            .ok_or_else(|| EvalError::new("integer overflow"))?,
                    );
                }
                Token::Slash => {
                    self.pos += 1;
                    let l = as_int(left)?;
                    let r = as_int(self.factor()?)?;
                    if r == 0 {
                        return Err(EvalError::new("division by zero"));
                    }
                    left = Value::from(
                        l.checked_div(r)
                            .ok_or_else(|| EvalError::new("integer overflow"))?,
                    );
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Value, EvalError> {
        match self.next() {
            Some(Token::Int(value)) => Ok(Value::from(value)),
            Some(Token::Str(text)) => Ok(Value::from(text)),
            Some(Token::Minus) => {
                let value = as_int(self.factor()?)?;
                Ok(Value::from(
                    value
                        .checked_neg()
                        .ok_or_else(|| EvalError::new("integer overflow"))?,
                ))
            }
            Some(Token::LParen) => {
                let value = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => self.call(&name),
            other => Err(EvalError::new(format!("unexpected token {other:?}"))),
        }
    }

    fn call(&mut self, name: &str) -> Result<Value, EvalError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.expression()?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        match name {
            "error" => match args.as_slice() {
                [Value::String(message)] => Err(EvalError::new(message.clone())),
                _ => Err(EvalError::new("error() takes one string argument")),
            },
            "abort" => {
                // For crash testing: takes the whole child process down
                // without a response, the same way a native fault would.
                tracing::warn!("abort() builtin invoked; aborting child process");
                std::process::abort();
            }
            "sleep" => match args.as_slice() {
                [value] => {
                    let ms = u64::try_from(as_int(value.clone())?)
                        .map_err(|_| EvalError::new("sleep() duration must be non-negative"))?;
                    std::thread::sleep(std::time::Duration::from_millis(ms));
                    Ok(Value::Null)
                }
                _ => Err(EvalError::new("sleep() takes one integer argument")),
            },
            other => Err(EvalError::new(format!("unknown function '{other}'"))),
        }
    }
}

fn as_int(value: Value) -> Result<i64, EvalError> {
    value
        .as_i64()
        .ok_or_else(|| EvalError::new(format!("expected an integer, found {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str) -> Result<Value, EvalError> {
        ExprEvaluator::new().eval("Main", expr)
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval("1+2").unwrap(), json!(3));
        assert_eq!(eval("2 * 3 + 4").unwrap(), json!(10));
        assert_eq!(eval("2 + 3 * 4").unwrap(), json!(14));
        assert_eq!(eval("(2 + 3) * 4").unwrap(), json!(20));
        assert_eq!(eval("10 / 3").unwrap(), json!(3));
        assert_eq!(eval("-5 + 2").unwrap(), json!(-3));
        assert_eq!(eval("--5").unwrap(), json!(5));
    }

    #[test]
    fn string_literals() {
        assert_eq!(eval("\"hello\"").unwrap(), json!("hello"));
        assert_eq!(eval(r#""with \"quotes\"""#).unwrap(), json!("with \"quotes\""));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = eval("1/0").unwrap_err();
        assert_eq!(err.message(), "division by zero");
    }

    #[test]
    fn overflow_is_an_error() {
        let err = eval("9223372036854775807 + 1").unwrap_err();
        assert_eq!(err.message(), "integer overflow");
    }

    #[test]
    fn error_builtin_fails_with_message_and_backtrace() {
        let err = eval(r#"error("oops")"#).unwrap_err();
        assert_eq!(err.message(), "oops");
        assert!(!err.backtrace().is_empty());
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(eval("1 +").is_err());
        assert!(eval("(1").is_err());
        assert!(eval("1 2").is_err());
        assert!(eval("$").is_err());
        assert!(eval("nope()").is_err());
    }

    #[test]
    fn sleep_returns_null() {
        assert_eq!(eval("sleep(1)").unwrap(), Value::Null);
    }

    #[test]
    fn closures_are_evaluators() {
        let mut canned = |_module: &str, _expr: &str| Ok(json!("fixed"));
        assert_eq!(canned.eval("m", "anything").unwrap(), json!("fixed"));
    }
}
