//! Boolean label expressions used by context and rule criteria.
//!
//! Grammar (recursive descent):
//!   expr    := or
//!   or      := and ('||' and)*
//!   and     := unary ('&&' unary)*
//!   unary   := '!' unary | cmp
//!   cmp     := primary (('==' | '!=') primary)?
//!            | primary 'in' '(' literal (',' literal)* ')'
//!   primary := ident | string | 'true' | 'false' | '(' expr ')'
//!
//! Identifiers resolve against the label set being evaluated. A missing
//! label compares unequal to everything; a bare identifier is truthy only
//! when its value is the string "true".

use std::collections::BTreeMap;

use ballast_core::{BallastError, BallastResult};
use serde::{Deserialize, Serialize};

/// Match predicate: all of `require_all`, at least one of `require_any`
/// (when non-empty), and none of `require_none` must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Criteria {
    #[serde(rename = "require-all", default)]
    pub require_all: Vec<String>,
    #[serde(rename = "require-any", default)]
    pub require_any: Vec<String>,
    #[serde(rename = "require-none", default)]
    pub require_none: Vec<String>,
}

impl Criteria {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> BallastResult<bool> {
        for expr in &self.require_all {
            if !eval(expr, labels)? {
                return Ok(false);
            }
        }
        if !self.require_any.is_empty() {
            let mut any = false;
            for expr in &self.require_any {
                if eval(expr, labels)? {
                    any = true;
                    break;
                }
            }
            if !any {
                return Ok(false);
            }
        }
        for expr in &self.require_none {
            if eval(expr, labels)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Parse every expression without evaluating, for policy validation.
    pub fn check(&self) -> BallastResult<()> {
        for expr in
            self.require_all.iter().chain(&self.require_any).chain(&self.require_none)
        {
            parse(expr)?;
        }
        Ok(())
    }
}

/// Evaluate one expression against a label set.
pub fn eval(input: &str, labels: &BTreeMap<String, String>) -> BallastResult<bool> {
    parse(input)?.eval(labels, input)
}

/// Parse an expression, reporting syntax errors without evaluating.
pub fn parse(input: &str) -> BallastResult<Expr> {
    let tokens = lex(input)?;
    let mut parser = Parser { input, tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing input"));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Eq(Term, Term),
    Ne(Term, Term),
    In(Term, Vec<String>),
    Truthy(Term),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Label(String),
    Literal(String),
    Bool(bool),
}

impl Term {
    fn value<'a>(&'a self, labels: &'a BTreeMap<String, String>) -> Option<&'a str> {
        match self {
            Term::Label(name) => labels.get(name).map(String::as_str),
            Term::Literal(s) => Some(s),
            Term::Bool(true) => Some("true"),
            Term::Bool(false) => Some("false"),
        }
    }
}

impl Expr {
    fn eval(&self, labels: &BTreeMap<String, String>, input: &str) -> BallastResult<bool> {
        Ok(match self {
            Expr::Or(parts) => {
                let mut out = false;
                for p in parts {
                    if p.eval(labels, input)? {
                        out = true;
                        break;
                    }
                }
                out
            }
            Expr::And(parts) => {
                let mut out = true;
                for p in parts {
                    if !p.eval(labels, input)? {
                        out = false;
                        break;
                    }
                }
                out
            }
            Expr::Not(inner) => !inner.eval(labels, input)?,
            Expr::Eq(a, b) => match (a.value(labels), b.value(labels)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
            Expr::Ne(a, b) => match (a.value(labels), b.value(labels)) {
                (Some(x), Some(y)) => x != y,
                _ => true,
            },
            Expr::In(term, list) => match term.value(labels) {
                Some(v) => list.iter().any(|item| item == v),
                None => false,
            },
            Expr::Truthy(term) => term.value(labels) == Some("true"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    OrOr,
    AndAnd,
    Not,
    EqEq,
    NotEq,
    In,
    LParen,
    RParen,
    Comma,
}

fn lex(input: &str) -> BallastResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '|' if bytes.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '&' if bytes.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '=' if bytes.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(BallastError::Malformed(format!(
                        "expression {:?}: unterminated string",
                        input
                    )));
                }
                tokens.push(Token::Str(bytes[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/' => {
                let start = i;
                let mut j = i;
                while j < bytes.len()
                    && (bytes[j].is_alphanumeric()
                        || bytes[j] == '_'
                        || bytes[j] == '-'
                        || bytes[j] == '.'
                        || bytes[j] == '/')
                {
                    j += 1;
                }
                let word: String = bytes[start..j].iter().collect();
                tokens.push(match word.as_str() {
                    "in" => Token::In,
                    _ => Token::Ident(word),
                });
                i = j;
            }
            other => {
                return Err(BallastError::Malformed(format!(
                    "expression {:?}: unexpected character {:?}",
                    input, other
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> BallastError {
        BallastError::Malformed(format!("expression {:?}: {}", self.input, message))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token, what: &str) -> BallastResult<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            _ => Err(self.error(&format!("expected {}", what))),
        }
    }

    fn expr(&mut self) -> BallastResult<Expr> {
        let mut parts = vec![self.and()?];
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            parts.push(self.and()?);
        }
        Ok(if parts.len() == 1 { parts.pop().unwrap() } else { Expr::Or(parts) })
    }

    fn and(&mut self) -> BallastResult<Expr> {
        let mut parts = vec![self.unary()?];
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            parts.push(self.unary()?);
        }
        Ok(if parts.len() == 1 { parts.pop().unwrap() } else { Expr::And(parts) })
    }

    fn unary(&mut self) -> BallastResult<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> BallastResult<Expr> {
        // parenthesized subexpression vs. term: decide before consuming
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.expr()?;
            self.expect(Token::RParen, "closing parenthesis")?;
            return Ok(inner);
        }
        let lhs = self.term()?;
        match self.peek() {
            Some(Token::EqEq) => {
                self.next();
                let rhs = self.term()?;
                Ok(Expr::Eq(lhs, rhs))
            }
            Some(Token::NotEq) => {
                self.next();
                let rhs = self.term()?;
                Ok(Expr::Ne(lhs, rhs))
            }
            Some(Token::In) => {
                self.next();
                self.expect(Token::LParen, "opening parenthesis after in")?;
                let mut list = Vec::new();
                loop {
                    match self.next() {
                        Some(Token::Str(s)) => list.push(s),
                        Some(Token::Ident(s)) => list.push(s),
                        _ => return Err(self.error("expected literal in list")),
                    }
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        _ => return Err(self.error("expected , or ) in list")),
                    }
                }
                Ok(Expr::In(lhs, list))
            }
            _ => Ok(Expr::Truthy(lhs)),
        }
    }

    fn term(&mut self) -> BallastResult<Term> {
        match self.next() {
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Term::Bool(true),
                "false" => Term::Bool(false),
                _ => Term::Label(word),
            }),
            Some(Token::Str(s)) => Ok(Term::Literal(s)),
            _ => Err(self.error("expected a label or literal")),
        }
    }
}
