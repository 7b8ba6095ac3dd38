//! Arithmetic transforms over a single value.
//!
//! Formulas are written as a suffix applied to the value, the way device
//! files express them: `"/2.3-10.86"` reads as `x/2.3-10.86`. Only
//! `+ - * /`, unary minus, parentheses and decimal literals are accepted.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Value,
    Number(f64),
    Neg(Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

/// A parsed, validated formula.
#[derive(Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Formula(x{})", self.source)
    }
}

impl Formula {
    /// Parse a suffix formula such as `"*(1000/100)"`.
    pub fn parse(suffix: &str) -> Result<Self> {
        let tokens = tokenize(suffix)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            source: suffix,
        };
        // The bound value is the implicit leftmost operand.
        let expr = parser.expression(Some(Expr::Value))?;
        if parser.pos != tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: suffix.to_string(),
            expr,
        })
    }

    pub fn eval(&self, x: f64) -> f64 {
        eval(&self.expr, x)
    }
}

fn eval(expr: &Expr, x: f64) -> f64 {
    match expr {
        Expr::Value => x,
        Expr::Number(n) => *n,
        Expr::Neg(inner) => -eval(inner, x),
        Expr::Binary(op, lhs, rhs) => {
            let (l, r) = (eval(lhs, x), eval(rhs, x));
            match op {
                Op::Add => l + r,
                Op::Sub => l - r,
                Op::Mul => l * r,
                Op::Div => l / r,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Op(Op),
    Open,
    Close,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' | '-' | '*' | '/' => {
                chars.next();
                tokens.push(Token::Op(match c {
                    '+' => Op::Add,
                    '-' => Op::Sub,
                    '*' => Op::Mul,
                    _ => Op::Div,
                }));
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '0'..='9' | '.' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let literal = &src[start..end];
                let n = literal.parse().map_err(|_| Error::Formula {
                    formula: src.to_string(),
                    reason: format!("bad number `{literal}`"),
                })?;
                tokens.push(Token::Number(n));
            }
            other => {
                return Err(Error::Formula {
                    formula: src.to_string(),
                    reason: format!("unexpected character `{other}`"),
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> Error {
        Error::Formula {
            formula: self.source.to_string(),
            reason: format!("{reason} at token {}", self.pos),
        }
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.peek();
        self.pos += 1;
        t
    }

    // expression := term (('+' | '-') term)*
    // `seed` stands in for the first factor when parsing the top level.
    fn expression(&mut self, seed: Option<Expr>) -> Result<Expr> {
        let mut lhs = self.term(seed)?;
        while let Some(Token::Op(op @ (Op::Add | Op::Sub))) = self.peek() {
            self.pos += 1;
            let rhs = self.term(None)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // term := factor (('*' | '/') factor)*
    fn term(&mut self, seed: Option<Expr>) -> Result<Expr> {
        let mut lhs = match seed {
            Some(expr) => expr,
            None => self.factor()?,
        };
        while let Some(Token::Op(op @ (Op::Mul | Op::Div))) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // factor := number | '(' expression ')' | ('-' | '+') factor
    fn factor(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Op(Op::Sub)) => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some(Token::Op(Op::Add)) => self.factor(),
            Some(Token::Open) => {
                let inner = self.expression(None)?;
                match self.bump() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(self.error("missing `)`")),
                }
            }
            _ => Err(self.error("expected a number or `(`")),
        }
    }
}
