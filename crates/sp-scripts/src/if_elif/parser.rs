//! Recursive-descent parser producing an expression tree.
//!
//! The grammar is a small, side-effect free subset of boolean expressions:
//!
//! ```text
//! expr       := or
//! or         := and ("or" and)*
//! and        := not ("and" not)*
//! not        := "not" not | comparison
//! comparison := primary (cmp_op primary)*
//! primary    := literal | "(" expr ")" | list | dict | call
//! ```
//!
//! Bare names, attribute access and conditional expressions are rejected.

use super::lexer::{tokenize, Token};
use super::ExpressionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `a < b < c` keeps every operand so each is evaluated once.
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    Call(String, Vec<Expr>),
}

/// Functions callable from an expression.
pub const FUNCTIONS: [&str; 3] = ["regex_match", "is_empty", "length"];

/// Deepest allowed nesting of groups, literals, calls and `not`.
pub const MAX_DEPTH: usize = 100;

pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Syntax("Empty expression".into()));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(ExpressionError::Syntax(format!(
            "Unexpected token '{}'",
            token.describe()
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
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

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == keyword)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExpressionError::Syntax(format!(
                "Expected '{}' but found '{}'",
                expected.describe(),
                token.describe()
            ))),
            None => Err(ExpressionError::Syntax(format!(
                "Expected '{}' but reached end of expression",
                expected.describe()
            ))),
        }
    }

    /// Runs `f` one nesting level deeper.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ExpressionError>,
    ) -> Result<T, ExpressionError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExpressionError::Syntax(format!(
                "Expression is nested more than {} levels deep",
                MAX_DEPTH
            )));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            let inner = self.nested(Self::parse_not)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let first = self.parse_primary()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            let operand = self.parse_primary()?;
            rest.push((op, operand));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    /// Consumes a comparison operator if one is next.
    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek()? {
            Token::Eq => CmpOp::Eq,
            Token::Ne => CmpOp::Ne,
            Token::Lt => CmpOp::Lt,
            Token::Le => CmpOp::Le,
            Token::Gt => CmpOp::Gt,
            Token::Ge => CmpOp::Ge,
            Token::Ident(name) if name == "in" => CmpOp::In,
            Token::Ident(name) if name == "not" => {
                let follows_in =
                    matches!(self.tokens.get(self.pos + 1), Some(Token::Ident(n)) if n == "in");
                if !follows_in {
                    return None;
                }
                self.pos += 1;
                CmpOp::NotIn
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self
            .next()
            .ok_or_else(|| ExpressionError::Syntax("Unexpected end of expression".into()))?;

        let expr = match token {
            Token::Number(n) => Expr::Number(n),
            Token::Str(s) => Expr::Str(s),
            Token::LParen => self.nested(|p| {
                let inner = p.parse_or()?;
                p.expect(Token::RParen)?;
                Ok(inner)
            })?,
            Token::LBracket => Expr::List(self.nested(|p| p.parse_items(Token::RBracket))?),
            Token::LBrace => self.nested(Self::parse_dict)?,
            Token::Ident(name) => self.nested(|p| p.parse_name(name))?,
            other => {
                return Err(ExpressionError::Syntax(format!(
                    "Unexpected token '{}'",
                    other.describe()
                )))
            }
        };

        if let Some(Token::Dot) = self.peek() {
            return Err(ExpressionError::Syntax("Attribute access is not allowed".into()));
        }
        Ok(expr)
    }

    fn parse_name(&mut self, name: String) -> Result<Expr, ExpressionError> {
        match name.as_str() {
            "true" | "True" => return Ok(Expr::Bool(true)),
            "false" | "False" => return Ok(Expr::Bool(false)),
            "null" | "None" => return Ok(Expr::Null),
            _ => {}
        }

        if self.peek() != Some(&Token::LParen) {
            return Err(ExpressionError::Syntax(format!("Unknown name '{}'", name)));
        }
        if !FUNCTIONS.contains(&name.as_str()) {
            return Err(ExpressionError::Syntax(format!(
                "Unsupported function '{}'",
                name
            )));
        }
        self.pos += 1;
        let args = self.parse_items(Token::RParen)?;
        Ok(Expr::Call(name, args))
    }

    /// Comma separated expressions up to `close`; a trailing comma is allowed.
    fn parse_items(&mut self, close: Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.parse_or()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(token) if token == close => return Ok(items),
                Some(token) => {
                    return Err(ExpressionError::Syntax(format!(
                        "Unexpected token '{}'",
                        token.describe()
                    )))
                }
                None => {
                    return Err(ExpressionError::Syntax(format!(
                        "Missing closing '{}'",
                        close.describe()
                    )))
                }
            }
        }
    }

    fn parse_dict(&mut self) -> Result<Expr, ExpressionError> {
        let mut entries = Vec::new();
        loop {
            if self.peek() == Some(&Token::RBrace) {
                self.pos += 1;
                return Ok(Expr::Dict(entries));
            }
            let key = self.parse_or()?;
            self.expect(Token::Colon)?;
            let value = self.parse_or()?;
            entries.push((key, value));
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBrace) => return Ok(Expr::Dict(entries)),
                Some(token) => {
                    return Err(ExpressionError::Syntax(format!(
                        "Unexpected token '{}'",
                        token.describe()
                    )))
                }
                None => return Err(ExpressionError::Syntax("Missing closing '}'".into())),
            }
        }
    }
}
