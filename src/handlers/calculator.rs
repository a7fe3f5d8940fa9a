//! Calculator handler.
//!
//! Evaluates `+ - * /` expressions over floating-point numbers with the
//! usual precedence, parentheses and unary signs.
//!
//! ```text
//! Request:  TOKEN:<secret> CAL 2 + 3 * (4 - 1)
//! Response: RESULT: 11
//! ```

use crate::error::HandlerError;
use crate::pipeline::{Handler, Request};

pub struct CalculatorHandler;

impl Handler for CalculatorHandler {
    fn name(&self) -> &str {
        "calculator"
    }

    fn handle(&self, request: &Request) -> Option<Result<String, HandlerError>> {
        if !request.is_command("CAL") {
            return None;
        }
        Some(evaluate(&request.arguments).map(|value| format!("RESULT: {}", format_number(value))))
    }
}

/// Evaluate an arithmetic expression.
pub fn evaluate(expression: &str) -> Result<f64, HandlerError> {
    let mut parser = ExprParser {
        input: expression.as_bytes(),
        pos: 0,
        depth: 0,
    };

    parser.skip_whitespace();
    if parser.at_end() {
        return Err(HandlerError::Expression("empty expression".to_string()));
    }

    let value = parser.expr()?;
    parser.skip_whitespace();
    if let Some(c) = parser.peek() {
        return Err(HandlerError::Expression(format!(
            "unexpected '{}' at position {}",
            c as char, parser.pos
        )));
    }

    if !value.is_finite() {
        return Err(HandlerError::Expression("result out of range".to_string()));
    }
    Ok(value)
}

/// Integral values print without a fraction; `-0` prints as `0`.
fn format_number(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{value}")
}

/// Recursive-descent parser:
///
/// ```text
/// expr   := term (('+' | '-') term)*
/// term   := factor (('*' | '/') factor)*
/// factor := ('+' | '-') factor | number | '(' expr ')'
/// number := digits ['.' digits] [('e' | 'E') ['+' | '-'] digits]
/// ```
///
/// Nesting of parentheses and unary signs is capped at [`MAX_DEPTH`]; each
/// level costs several stack frames on the worker.
struct ExprParser<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

/// Deepest nesting of parentheses and unary signs accepted.
pub const MAX_DEPTH: usize = 256;

impl ExprParser<'_> {
    fn expr(&mut self) -> Result<f64, HandlerError> {
        let mut value = self.term()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(b'-') => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, HandlerError> {
        let mut value = self.factor()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Some(b'/') => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err(HandlerError::DivisionByZero);
                    }
                    value /= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    fn factor(&mut self) -> Result<f64, HandlerError> {
        if self.depth >= MAX_DEPTH {
            return Err(HandlerError::Expression(
                "expression nested too deeply".to_string(),
            ));
        }
        self.depth += 1;
        let value = self.nested_factor();
        self.depth -= 1;
        value
    }

    fn nested_factor(&mut self) -> Result<f64, HandlerError> {
        self.skip_whitespace();
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some(b'+') => {
                self.pos += 1;
                self.factor()
            }
            Some(b'(') => {
                self.pos += 1;
                let value = self.expr()?;
                self.skip_whitespace();
                if self.peek() != Some(b')') {
                    return Err(HandlerError::Expression("missing ')'".to_string()));
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) => Err(HandlerError::Expression(format!(
                "unexpected '{}' at position {}",
                c as char, self.pos
            ))),
            None => Err(HandlerError::Expression(
                "unexpected end of expression".to_string(),
            )),
        }
    }

    fn number(&mut self) -> Result<f64, HandlerError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == b'.') {
            self.pos += 1;
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let sign = usize::from(matches!(self.input.get(self.pos + 1), Some(b'+' | b'-')));
            if matches!(self.input.get(self.pos + 1 + sign), Some(c) if c.is_ascii_digit()) {
                self.pos += 1 + sign;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        // input is ASCII in this range, so the slice is valid UTF-8
        let text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|e| HandlerError::Expression(e.to_string()))?;
        text.parse::<f64>()
            .map_err(|_| HandlerError::Expression(format!("invalid number '{text}'")))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }
}
