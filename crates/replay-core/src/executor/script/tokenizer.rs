//! Script tokenizer - converts handler source into a token stream
//!
//! Handles: keywords, identifiers, string literals, integer/float literals,
//! operators and punctuation. Comments (//) are discarded.
//!
//! Guarantees:
//! - Deterministic: same input always produces same token stream
//! - Complete error reporting: line:column for every error

use crate::{Error, Result};

/// Token types for handler scripts
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Fn,
    Let,
    If,
    Else,
    While,
    Return,
    Throw,
    Null,

    // Literals
    StringLiteral(String),
    IntegerLiteral(i64),
    FloatLiteral(f64),
    BooleanLiteral(bool),

    // Punctuation
    LBrace,    // {
    RBrace,    // }
    LBracket,  // [
    RBracket,  // ]
    LParen,    // (
    RParen,    // )
    Colon,     // :
    Semicolon, // ;
    Comma,     // ,
    Dot,       // .

    // Operators
    Assign,    // =
    EqEq,      // ==
    NotEq,     // !=
    Less,      // <
    LessEq,    // <=
    Greater,   // >
    GreaterEq, // >=
    Plus,      // +
    Minus,     // -
    Star,      // *
    Slash,     // /
    Percent,   // %
    Bang,      // !
    AndAnd,    // &&
    OrOr,      // ||

    // Other
    Identifier(String),
    Eof,
}

/// Position in source text for error reporting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Token with source position
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Tokenizer for handler scripts
pub struct Tokenizer {
    input: Vec<char>,
    position: usize,
    line: usize,
    column: usize,
}

impl Tokenizer {
    pub fn new(text: &str) -> Self {
        Tokenizer {
            input: text.chars().collect(),
            position: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the entire input into a stream of spanned tokens
    pub fn tokenize(&mut self) -> Result<Vec<SpannedToken>> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace_and_comments();

            if self.is_at_end() {
                tokens.push(SpannedToken {
                    token: Token::Eof,
                    span: self.current_span(),
                });
                break;
            }

            let token = self.next_token()?;
            tokens.push(token);
        }

        Ok(tokens)
    }

    // ── Character helpers ──────────────────────────────────

    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_ahead(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.input.get(self.position).copied();
        if let Some(c) = ch {
            self.position += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        ch
    }

    fn current_span(&self) -> Span {
        Span {
            line: self.line,
            column: self.column,
            offset: self.position,
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while let Some(ch) = self.peek() {
                if ch.is_whitespace() {
                    self.advance();
                } else {
                    break;
                }
            }

            if self.peek() == Some('/') && self.peek_ahead(1) == Some('/') {
                while let Some(ch) = self.peek() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
                continue;
            }

            break;
        }
    }

    // ── Main dispatch ──────────────────────────────────────

    fn next_token(&mut self) -> Result<SpannedToken> {
        let span = self.current_span();
        let Some(ch) = self.peek() else {
            return Ok(SpannedToken {
                token: Token::Eof,
                span,
            });
        };

        let single = match ch {
            '{' => Some(Token::LBrace),
            '}' => Some(Token::RBrace),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ':' => Some(Token::Colon),
            ';' => Some(Token::Semicolon),
            ',' => Some(Token::Comma),
            '.' => Some(Token::Dot),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(SpannedToken { token, span });
        }

        match ch {
            '=' | '!' | '<' | '>' => self.read_comparison(ch, span),
            '&' | '|' => self.read_logical(ch, span),
            '"' => self.read_string(span),
            c if c.is_ascii_digit() => self.read_number(span),
            c if c.is_ascii_alphabetic() || c == '_' => Ok(self.read_identifier_or_keyword(span)),
            _ => Err(Error::Source(format!(
                "Unexpected character '{}' at {}",
                ch, span
            ))),
        }
    }

    fn read_comparison(&mut self, first: char, span: Span) -> Result<SpannedToken> {
        self.advance();
        let followed_by_eq = self.peek() == Some('=');
        if followed_by_eq {
            self.advance();
        }
        let token = match (first, followed_by_eq) {
            ('=', true) => Token::EqEq,
            ('=', false) => Token::Assign,
            ('!', true) => Token::NotEq,
            ('!', false) => Token::Bang,
            ('<', true) => Token::LessEq,
            ('<', false) => Token::Less,
            ('>', true) => Token::GreaterEq,
            _ => Token::Greater,
        };
        Ok(SpannedToken { token, span })
    }

    fn read_logical(&mut self, first: char, span: Span) -> Result<SpannedToken> {
        self.advance();
        if self.peek() != Some(first) {
            return Err(Error::Source(format!(
                "Expected '{first}{first}' at {span}"
            )));
        }
        self.advance();
        let token = if first == '&' { Token::AndAnd } else { Token::OrOr };
        Ok(SpannedToken { token, span })
    }

    // ── String literals ────────────────────────────────────

    fn read_string(&mut self, span: Span) -> Result<SpannedToken> {
        self.advance(); // consume opening "
        let mut value = String::new();

        loop {
            match self.advance() {
                None => {
                    return Err(Error::Source(format!(
                        "Unterminated string starting at {}",
                        span
                    )));
                }
                Some('"') => break,
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some(c) => {
                        return Err(Error::Source(format!(
                            "Invalid escape sequence '\\{}' at {}",
                            c,
                            self.current_span()
                        )));
                    }
                    None => {
                        return Err(Error::Source(format!(
                            "Unterminated escape sequence at {}",
                            self.current_span()
                        )));
                    }
                },
                Some(c) => value.push(c),
            }
        }

        Ok(SpannedToken {
            token: Token::StringLiteral(value),
            span,
        })
    }

    // ── Numbers ────────────────────────────────────────────

    fn read_number(&mut self, span: Span) -> Result<SpannedToken> {
        let start = self.position;
        let mut has_dot = false;

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                self.advance();
            } else if ch == '.'
                && !has_dot
                && self.peek_ahead(1).is_some_and(|c| c.is_ascii_digit())
            {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }

        let text: String = self.input[start..self.position].iter().collect();

        if has_dot {
            let val: f64 = text
                .parse()
                .map_err(|_| Error::Source(format!("Invalid float '{}' at {}", text, span)))?;
            Ok(SpannedToken {
                token: Token::FloatLiteral(val),
                span,
            })
        } else {
            let val: i64 = text
                .parse()
                .map_err(|_| Error::Source(format!("Invalid integer '{}' at {}", text, span)))?;
            Ok(SpannedToken {
                token: Token::IntegerLiteral(val),
                span,
            })
        }
    }

    // ── Identifiers & Keywords ─────────────────────────────

    fn read_identifier_or_keyword(&mut self, span: Span) -> SpannedToken {
        let start = self.position;

        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let text: String = self.input[start..self.position].iter().collect();

        let token = match text.as_str() {
            "fn" => Token::Fn,
            "let" => Token::Let,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "return" => Token::Return,
            "throw" => Token::Throw,
            "null" => Token::Null,
            "true" => Token::BooleanLiteral(true),
            "false" => Token::BooleanLiteral(false),
            _ => Token::Identifier(text),
        };

        SpannedToken { token, span }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(input: &str) -> Vec<Token> {
        Tokenizer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|st| st.token)
            .collect()
    }

    fn tokenize_err(input: &str) -> String {
        Tokenizer::new(input).tokenize().unwrap_err().to_string()
    }

    #[test]
    fn test_tokenize_keywords() {
        assert_eq!(
            tokenize("fn let if else while return throw null"),
            vec![
                Token::Fn,
                Token::Let,
                Token::If,
                Token::Else,
                Token::While,
                Token::Return,
                Token::Throw,
                Token::Null,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_operators() {
        assert_eq!(
            tokenize("= == != < <= > >= ! && ||"),
            vec![
                Token::Assign,
                Token::EqEq,
                Token::NotEq,
                Token::Less,
                Token::LessEq,
                Token::Greater,
                Token::GreaterEq,
                Token::Bang,
                Token::AndAnd,
                Token::OrOr,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_numbers() {
        assert_eq!(
            tokenize("42 2.5 7.x"),
            vec![
                Token::IntegerLiteral(42),
                Token::FloatLiteral(2.5),
                Token::IntegerLiteral(7),
                Token::Dot,
                Token::Identifier("x".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_string_escapes() {
        assert_eq!(
            tokenize(r#""a\"b\n""#),
            vec![Token::StringLiteral("a\"b\n".into()), Token::Eof]
        );
        assert!(tokenize_err("\"open").contains("Unterminated string"));
    }

    #[test]
    fn test_skip_comments() {
        assert_eq!(
            tokenize("// header\nstate.x // trailing\n"),
            vec![
                Token::Identifier("state".into()),
                Token::Dot,
                Token::Identifier("x".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_unexpected_character() {
        assert!(tokenize_err("let x = @;").contains("1:9"));
        assert!(tokenize_err("a & b").contains("Expected '&&'"));
    }

    #[test]
    fn test_span_tracking() {
        let tokens = Tokenizer::new("fn\n  handle").tokenize().unwrap();
        assert_eq!(tokens[1].span.line, 2);
        assert_eq!(tokens[1].span.column, 3);
    }

    #[test]
    fn test_tokenize_determinism() {
        let src = "fn handle(state, action) { return { state: state }; }";
        let first = tokenize(src);
        for _ in 0..100 {
            assert_eq!(tokenize(src), first);
        }
    }
}
