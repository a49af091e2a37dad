//! Recursive-descent parser: expression text to [`Node`] tree.
//!
//! ```text
//! expression := term (('+' | '-') term)*
//! term       := factor (('*' | '/') factor)*
//! factor     := '-' factor | '(' expression ')' | number
//! ```
//!
//! The cursor lives inside a single [`parse`] call; nothing is shared
//! between calls.

use crate::error::ParseError;

use super::tree::{Node, Operator};

/// Parse `input` into an operation tree.
pub fn parse(input: &str) -> Result<Node, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut parser = Parser { src: input, pos: 0 };
    let node = parser.expression()?;

    parser.skip_whitespace();
    if let Some(found) = parser.current_char() {
        return Err(ParseError::TrailingInput {
            found,
            position: parser.pos,
        });
    }
    Ok(node)
}

struct Parser<'a> {
    src: &'a str,
    /// Byte offset. Only ever advanced over ASCII, so it stays on a char boundary.
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn current_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expression(&mut self) -> Result<Node, ParseError> {
        let mut left = self.term()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek() {
                Some(b'+') => Operator::Add,
                Some(b'-') => Operator::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.term()?;
            left = Node::binary(op, left, right);
        }
    }

    fn term(&mut self) -> Result<Node, ParseError> {
        let mut left = self.factor()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek() {
                Some(b'*') => Operator::Mul,
                Some(b'/') => Operator::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.factor()?;
            left = Node::binary(op, left, right);
        }
    }

    fn factor(&mut self) -> Result<Node, ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                // Keep every interior node binary: a negated sub-expression
                // becomes (-1) * operand.
                Ok(match self.factor()? {
                    Node::Value(v) => Node::Value(-v),
                    operand => Node::binary(Operator::Mul, Node::Value(-1.0), operand),
                })
            }
            Some(b'(') => {
                self.pos += 1;
                let node = self.expression()?;
                self.skip_whitespace();
                if self.peek() != Some(b')') {
                    return Err(ParseError::UnclosedParen { position: self.pos });
                }
                self.pos += 1;
                Ok(node)
            }
            Some(b'0'..=b'9' | b'.') => self.number(),
            _ => Err(ParseError::ExpectedOperand {
                found: match self.current_char() {
                    Some(c) => format!("'{c}'"),
                    None => "end of input".to_string(),
                },
                position: self.pos,
            }),
        }
    }

    fn number(&mut self) -> Result<Node, ParseError> {
        let start = self.pos;
        let mut seen_point = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => {}
                b'.' if seen_point => {
                    return Err(ParseError::MultipleDecimalPoints { position: self.pos });
                }
                b'.' => seen_point = true,
                _ => break,
            }
            self.pos += 1;
        }

        let literal = &self.src[start..self.pos];
        match literal.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Node::Value(value)),
            _ => Err(ParseError::InvalidNumber {
                literal: literal.to_string(),
            }),
        }
    }
}
