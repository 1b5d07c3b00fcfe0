//! Recursive-descent parser for handler scripts
//!
//! Grammar (informal):
//!
//! ```text
//! program    := function*
//! function   := "fn" IDENT "(" params ")" block
//! block      := "{" statement* "}"
//! statement  := "let" IDENT "=" expr ";"
//!             | place "=" expr ";"
//!             | "if" expr block ("else" (if-stmt | block))?
//!             | "while" expr block
//!             | "return" expr? ";"
//!             | "throw" expr ";"
//!             | expr ";"
//! expr       := or ; usual precedence: || && == != < <= > >= + - * / % unary postfix
//! postfix    := primary ("." IDENT | "[" expr "]")*
//! primary    := literal | IDENT | IDENT "(" args ")" | "(" expr ")" | object | array
//! ```
//!
//! Nesting is bounded: blocks and parenthesized or prefixed expressions may
//! not nest deeper than [`MAX_NESTING_DEPTH`], and no expression tree may be
//! taller than that either, so hostile sources fail with an error instead of
//! exhausting the stack.

use std::collections::BTreeMap;

use super::tokenizer::{Span, SpannedToken, Token, Tokenizer};
use super::value::Value;
use crate::{Error, Result};

/// Deepest nesting of blocks and expressions, and tallest expression tree.
pub const MAX_NESTING_DEPTH: usize = 128;

/// An expression with the height of its tree
type Parsed = (Expr, usize);

// ── AST ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>, Span),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// One step of an assignment target path
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Field(String),
    Index(Expr),
}

/// Assignment target: a variable with an optional field/index path
#[derive(Debug, Clone, PartialEq)]
pub struct Place {
    pub root: String,
    pub path: Vec<PathSegment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let(String, Expr),
    Assign(Place, Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    While(Expr, Vec<Stmt>),
    Return(Option<Expr>),
    Throw(Expr),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

/// A compiled handler script
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    functions: BTreeMap<String, Function>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

// ── Parser ────────────────────────────────────────────────

pub struct Parser {
    tokens: Vec<SpannedToken>,
    position: usize,
    depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<SpannedToken>) -> Self {
        Parser {
            tokens,
            position: 0,
            depth: 0,
        }
    }

    pub fn parse_program(&mut self) -> Result<Program> {
        let mut program = Program::default();
        while !self.check(&Token::Eof) {
            let span = self.span();
            let function = self.parse_function()?;
            if program.functions.contains_key(&function.name) {
                return Err(self.error_at(
                    span,
                    format!("duplicate function '{}'", function.name),
                ));
            }
            program.functions.insert(function.name.clone(), function);
        }
        Ok(program)
    }

    // ── Token helpers ──────────────────────────────────────

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map(|t| t.span)
            .unwrap_or(Span {
                line: 1,
                column: 1,
                offset: 0,
            })
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String> {
        match self.peek().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected {what}, found {other:?}"))),
        }
    }

    fn error(&self, message: String) -> Error {
        self.error_at(self.span(), message)
    }

    fn error_at(&self, span: Span, message: String) -> Error {
        Error::Source(format!("{message} at {span}"))
    }

    /// Enter one level of recursion; pair with `self.depth -= 1`.
    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.error(format!("nesting deeper than {MAX_NESTING_DEPTH}")));
        }
        Ok(())
    }

    /// Height of a node whose tallest child is `height` high.
    fn grow(&self, height: usize) -> Result<usize> {
        let height = height + 1;
        if height > MAX_NESTING_DEPTH {
            return Err(self.error(format!(
                "expression nested deeper than {MAX_NESTING_DEPTH}"
            )));
        }
        Ok(height)
    }

    // ── Items & statements ─────────────────────────────────

    fn parse_function(&mut self) -> Result<Function> {
        self.expect(Token::Fn, "'fn'")?;
        let name = self.expect_identifier("function name")?;
        self.expect(Token::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                params.push(self.expect_identifier("parameter name")?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')'")?;
        let body = self.parse_block()?;
        Ok(Function { name, params, body })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        self.descend()?;
        self.expect(Token::LBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.check(&Token::Eof) {
                return Err(self.error("unterminated block".into()));
            }
            body.push(self.parse_statement()?);
        }
        self.expect(Token::RBrace, "'}'")?;
        self.depth -= 1;
        Ok(body)
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        match self.peek().clone() {
            Token::Let => {
                self.advance();
                let name = self.expect_identifier("variable name")?;
                self.expect(Token::Assign, "'='")?;
                let value = self.parse_expr()?;
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Let(name, value))
            }
            Token::If => self.parse_if(),
            Token::While => {
                self.advance();
                let condition = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::While(condition, body))
            }
            Token::Return => {
                self.advance();
                let value = if self.check(&Token::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Return(value))
            }
            Token::Throw => {
                self.advance();
                let value = self.parse_expr()?;
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Throw(value))
            }
            _ => {
                let span = self.span();
                let expr = self.parse_expr()?;
                let stmt = if self.eat(&Token::Assign) {
                    let place = self.into_place(expr, span)?;
                    Stmt::Assign(place, self.parse_expr()?)
                } else {
                    Stmt::Expr(expr)
                };
                self.expect(Token::Semicolon, "';'")?;
                Ok(stmt)
            }
        }
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.descend()?;
        self.expect(Token::If, "'if'")?;
        let condition = self.parse_expr()?;
        let then_branch = self.parse_block()?;
        let else_branch = if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                vec![self.parse_if()?]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };
        self.depth -= 1;
        Ok(Stmt::If(condition, then_branch, else_branch))
    }

    fn into_place(&self, expr: Expr, span: Span) -> Result<Place> {
        let mut path = Vec::new();
        let mut current = expr;
        loop {
            match current {
                Expr::Var(root) => {
                    path.reverse();
                    return Ok(Place { root, path });
                }
                Expr::Field(inner, name) => {
                    path.push(PathSegment::Field(name));
                    current = *inner;
                }
                Expr::Index(inner, index) => {
                    path.push(PathSegment::Index(*index));
                    current = *inner;
                }
                _ => return Err(self.error_at(span, "invalid assignment target".into())),
            }
        }
    }

    // ── Expressions ────────────────────────────────────────

    fn parse_expr(&mut self) -> Result<Expr> {
        Ok(self.parse_nested()?.0)
    }

    fn parse_nested(&mut self) -> Result<Parsed> {
        self.descend()?;
        let parsed = self.parse_binary(0)?;
        self.depth -= 1;
        Ok(parsed)
    }

    fn binary_op(token: &Token) -> Option<(BinaryOp, u8)> {
        let op = match token {
            Token::OrOr => (BinaryOp::Or, 1),
            Token::AndAnd => (BinaryOp::And, 2),
            Token::EqEq => (BinaryOp::Eq, 3),
            Token::NotEq => (BinaryOp::NotEq, 3),
            Token::Less => (BinaryOp::Less, 4),
            Token::LessEq => (BinaryOp::LessEq, 4),
            Token::Greater => (BinaryOp::Greater, 4),
            Token::GreaterEq => (BinaryOp::GreaterEq, 4),
            Token::Plus => (BinaryOp::Add, 5),
            Token::Minus => (BinaryOp::Sub, 5),
            Token::Star => (BinaryOp::Mul, 6),
            Token::Slash => (BinaryOp::Div, 6),
            Token::Percent => (BinaryOp::Rem, 6),
            _ => return None,
        };
        Some(op)
    }

    /// Precedence climbing; all binary operators are left-associative.
    fn parse_binary(&mut self, min_precedence: u8) -> Result<Parsed> {
        let (mut lhs, mut height) = self.parse_unary()?;
        while let Some((op, precedence)) = Self::binary_op(self.peek()) {
            if precedence <= min_precedence {
                break;
            }
            self.advance();
            let (rhs, rhs_height) = self.parse_binary(precedence)?;
            height = self.grow(height.max(rhs_height))?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok((lhs, height))
    }

    fn parse_unary(&mut self) -> Result<Parsed> {
        let op = if self.eat(&Token::Minus) {
            UnaryOp::Neg
        } else if self.eat(&Token::Bang) {
            UnaryOp::Not
        } else {
            return self.parse_postfix();
        };
        self.descend()?;
        let (operand, height) = self.parse_unary()?;
        self.depth -= 1;
        Ok((Expr::Unary(op, Box::new(operand)), self.grow(height)?))
    }

    fn parse_postfix(&mut self) -> Result<Parsed> {
        let (mut expr, mut height) = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.expect_identifier("field name")?;
                expr = Expr::Field(Box::new(expr), name);
                height = self.grow(height)?;
            } else if self.eat(&Token::LBracket) {
                let (index, index_height) = self.parse_nested()?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
                height = self.grow(height.max(index_height))?;
            } else {
                return Ok((expr, height));
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Parsed> {
        let span = self.span();
        match self.advance() {
            Token::IntegerLiteral(i) => leaf(Expr::Literal(Value::Integer(i))),
            Token::FloatLiteral(f) => leaf(Expr::Literal(Value::Float(f))),
            Token::StringLiteral(s) => leaf(Expr::Literal(Value::String(s))),
            Token::BooleanLiteral(b) => leaf(Expr::Literal(Value::Boolean(b))),
            Token::Null => leaf(Expr::Literal(Value::Null)),
            Token::Identifier(name) => {
                if self.eat(&Token::LParen) {
                    let (args, height) = self.parse_list(Token::RParen)?;
                    Ok((Expr::Call(name, args, span), self.grow(height)?))
                } else {
                    leaf(Expr::Var(name))
                }
            }
            Token::LParen => {
                let inner = self.parse_nested()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let (items, height) = self.parse_list(Token::RBracket)?;
                Ok((Expr::Array(items), self.grow(height)?))
            }
            Token::LBrace => self.parse_object(),
            other => Err(self.error_at(span, format!("unexpected {other:?}"))),
        }
    }

    /// Comma-separated expressions up to `close`; trailing comma allowed.
    /// Also returns the tallest item's height.
    fn parse_list(&mut self, close: Token) -> Result<(Vec<Expr>, usize)> {
        let mut items = Vec::new();
        let mut height = 0;
        while !self.check(&close) {
            let (item, item_height) = self.parse_nested()?;
            items.push(item);
            height = height.max(item_height);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(close, "closing delimiter")?;
        Ok((items, height))
    }

    fn parse_object(&mut self) -> Result<Parsed> {
        let mut fields = Vec::new();
        let mut height = 0;
        while !self.check(&Token::RBrace) {
            let key = match self.advance() {
                Token::Identifier(name) => name,
                Token::StringLiteral(s) => s,
                other => return Err(self.error(format!("expected object key, found {other:?}"))),
            };
            self.expect(Token::Colon, "':'")?;
            let (value, value_height) = self.parse_nested()?;
            fields.push((key, value));
            height = height.max(value_height);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RBrace, "'}'")?;
        Ok((Expr::Object(fields), self.grow(height)?))
    }
}

fn leaf(expr: Expr) -> Result<Parsed> {
    Ok((expr, 1))
}

/// Tokenize and parse `source`.
pub fn parse(source: &str) -> Result<Program> {
    let tokens = Tokenizer::new(source).tokenize()?;
    Parser::new(tokens).parse_program()
}
