//! Boolean expressions over named auth checks.
//!
//! Expressions combine check names with `&&`, `||`, `!` and parentheses.
//! `!` binds tightest, then `&&`, then `||`; both binary operators are left
//! associative. Expressions are parsed once when a policy is compiled.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use thiserror::Error;

/// Errors produced while parsing or validating an expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("expression is empty")]
    Empty,

    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unexpected '{found}' at offset {offset}")]
    UnexpectedToken { found: String, offset: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("expression references unknown check '{0}'")]
    UnknownName(String),
}

/// A parsed boolean expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Name(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse an expression string.
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some((token, offset)) => Err(ExprError::UnexpectedToken {
                found: token.to_string(),
                offset: *offset,
            }),
        }
    }

    /// The conjunction of every name, in order.
    ///
    /// Returns `None` for an empty list.
    pub fn all_of<I, S>(names: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .map(|name| Expr::Name(name.into()))
            .reduce(|acc, next| Expr::And(Box::new(acc), Box::new(next)))
    }

    /// Every check name referenced by the expression.
    pub fn names(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Name(name) => {
                names.insert(name.as_str());
            }
            Expr::Not(inner) => inner.collect_names(names),
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.collect_names(names);
                rhs.collect_names(names);
            }
        }
    }

    /// Ensure every referenced name is one of `known`.
    pub fn validate(&self, known: &HashSet<String>) -> Result<(), ExprError> {
        match self.names().into_iter().find(|name| !known.contains(*name)) {
            Some(unknown) => Err(ExprError::UnknownName(unknown.to_string())),
            None => Ok(()),
        }
    }

    /// Evaluate with `resolve` answering each leaf, short-circuiting left to right.
    pub fn eval<F>(&self, resolve: &mut F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        match self {
            Expr::Name(name) => resolve(name),
            Expr::Not(inner) => !inner.eval(resolve),
            Expr::And(lhs, rhs) => lhs.eval(resolve) && rhs.eval(resolve),
            Expr::Or(lhs, rhs) => lhs.eval(resolve) || rhs.eval(resolve),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Name(name) => write!(f, "{}", name),
            Expr::Not(inner) => write!(f, "!{}", inner),
            Expr::And(lhs, rhs) => write!(f, "({} && {})", lhs, rhs),
            Expr::Or(lhs, rhs) => write!(f, "({} || {})", lhs, rhs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{}", name),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        match ch {
            c if c.is_whitespace() => {}
            '(' => tokens.push((Token::LParen, offset)),
            ')' => tokens.push((Token::RParen, offset)),
            '!' => tokens.push((Token::Not, offset)),
            '&' | '|' => match chars.next() {
                Some((_, next)) if next == ch => {
                    let token = if ch == '&' { Token::And } else { Token::Or };
                    tokens.push((token, offset));
                }
                _ => return Err(ExprError::UnexpectedChar { ch, offset }),
            },
            c if is_ident_char(c) => {
                let mut ident = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if !is_ident_char(next) {
                        break;
                    }
                    ident.push(next);
                    chars.next();
                }
                tokens.push((Token::Ident(ident), offset));
            }
            other => return Err(ExprError::UnexpectedChar { ch: other, offset }),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some((Token::Or, _))) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Some((Token::And, _))) {
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some((Token::Not, _)) => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            Some((Token::Ident(name), _)) => Ok(Expr::Name(name)),
            Some((Token::LParen, _)) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(inner),
                    Some((token, offset)) => Err(ExprError::UnexpectedToken {
                        found: token.to_string(),
                        offset,
                    }),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some((token, offset)) => Err(ExprError::UnexpectedToken {
                found: token.to_string(),
                offset,
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}
