use crate::diagnostics::{Position, Span};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Function,
    Native,
    If,
    Else,
    While,
    For,
    In,
    Print,
    Return,
    TypeInt,
    TypeDouble,
    TypeString,
    TypeVoid,
    IntLit(i64),
    DoubleLit(f64),
    StrLit(String),
    Ident(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Semicolon,
    Comma,
    Range,
    Assign,
    AddAssign,
    SubAssign,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexError {
    #[error("{position}: unexpected character '{ch}'")]
    UnexpectedChar { ch: char, position: Position },
    #[error("{position}: unterminated string literal")]
    UnterminatedString { position: Position },
    #[error("{position}: unknown escape '\\{ch}'")]
    UnknownEscape { ch: char, position: Position },
    #[error("{position}: malformed number literal")]
    MalformedNumber { position: Position },
}

pub fn lex(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).lex()
}

struct Lexer {
    chars: Vec<char>,
    index: usize,
    line: u32,
    col: u32,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            index: 0,
            line: 1,
            col: 1,
        }
    }

    fn lex(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
                continue;
            }
            if ch == '/' && self.peek_at(1) == Some('/') {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
                continue;
            }

            let start = self.position();
            let kind = match ch {
                '(' => self.single(TokenKind::LParen),
                ')' => self.single(TokenKind::RParen),
                '{' => self.single(TokenKind::LBrace),
                '}' => self.single(TokenKind::RBrace),
                ';' => self.single(TokenKind::Semicolon),
                ',' => self.single(TokenKind::Comma),
                '*' => self.single(TokenKind::Star),
                '/' => self.single(TokenKind::Slash),
                '%' => self.single(TokenKind::Percent),
                '+' => {
                    self.advance();
                    if self.peek() == Some('=') {
                        self.advance();
                        TokenKind::AddAssign
                    } else {
                        TokenKind::Plus
                    }
                }
                '-' => {
                    self.advance();
                    if self.peek() == Some('=') {
                        self.advance();
                        TokenKind::SubAssign
                    } else {
                        TokenKind::Minus
                    }
                }
                '=' => {
                    self.advance();
                    if self.peek() == Some('=') {
                        self.advance();
                        TokenKind::EqEq
                    } else {
                        TokenKind::Assign
                    }
                }
                '!' => {
                    self.advance();
                    if self.peek() == Some('=') {
                        self.advance();
                        TokenKind::NotEq
                    } else {
                        TokenKind::Bang
                    }
                }
                '<' => {
                    self.advance();
                    if self.peek() == Some('=') {
                        self.advance();
                        TokenKind::LtEq
                    } else {
                        TokenKind::Lt
                    }
                }
                '>' => {
                    self.advance();
                    if self.peek() == Some('=') {
                        self.advance();
                        TokenKind::GtEq
                    } else {
                        TokenKind::Gt
                    }
                }
                '&' => {
                    self.advance();
                    if self.peek() == Some('&') {
                        self.advance();
                        TokenKind::AndAnd
                    } else {
                        return Err(LexError::UnexpectedChar {
                            ch: '&',
                            position: start,
                        });
                    }
                }
                '|' => {
                    self.advance();
                    if self.peek() == Some('|') {
                        self.advance();
                        TokenKind::OrOr
                    } else {
                        return Err(LexError::UnexpectedChar {
                            ch: '|',
                            position: start,
                        });
                    }
                }
                '.' => {
                    self.advance();
                    if self.peek() == Some('.') {
                        self.advance();
                        TokenKind::Range
                    } else {
                        return Err(LexError::UnexpectedChar {
                            ch: '.',
                            position: start,
                        });
                    }
                }
                '\'' => self.lex_string(start)?,
                c if c.is_ascii_digit() => self.lex_number(start)?,
                c if is_ident_start(c) => self.lex_ident(),
                c => {
                    return Err(LexError::UnexpectedChar {
                        ch: c,
                        position: start,
                    });
                }
            };
            let end = self.position();
            tokens.push(Token {
                kind,
                span: Span::new(start, end),
            });
        }

        let eof = self.position();
        tokens.push(Token {
            kind: TokenKind::Eof,
            span: Span::point(eof),
        });
        Ok(tokens)
    }

    fn lex_string(&mut self, start: Position) -> Result<TokenKind, LexError> {
        self.advance();
        let mut text = String::new();
        loop {
            let Some(ch) = self.peek() else {
                return Err(LexError::UnterminatedString { position: start });
            };
            match ch {
                '\'' => {
                    self.advance();
                    return Ok(TokenKind::StrLit(text));
                }
                '\n' => {
                    return Err(LexError::UnterminatedString { position: start });
                }
                '\\' => {
                    self.advance();
                    let Some(esc) = self.peek() else {
                        return Err(LexError::UnterminatedString { position: start });
                    };
                    let resolved = match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '\'' => '\'',
                        other => {
                            return Err(LexError::UnknownEscape {
                                ch: other,
                                position: self.position(),
                            });
                        }
                    };
                    text.push(resolved);
                    self.advance();
                }
                other => {
                    text.push(other);
                    self.advance();
                }
            }
        }
    }

    fn lex_number(&mut self, start: Position) -> Result<TokenKind, LexError> {
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        // A '.' starts a fractional part only when it is not the `..` range
        // operator and a digit follows.
        let mut is_double = false;
        if self.peek() == Some('.')
            && self.peek_at(1) != Some('.')
            && self.peek_at(1).is_some_and(|c| c.is_ascii_digit())
        {
            is_double = true;
            text.push('.');
            self.advance();
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    text.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if self.peek() == Some('e') || self.peek() == Some('E') {
            is_double = true;
            text.push('e');
            self.advance();
            if let Some(sign @ ('+' | '-')) = self.peek() {
                text.push(sign);
                self.advance();
            }
            let mut digits = 0;
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    text.push(ch);
                    self.advance();
                    digits += 1;
                } else {
                    break;
                }
            }
            if digits == 0 {
                return Err(LexError::MalformedNumber { position: start });
            }
        }

        if is_double {
            let value: f64 = text
                .parse()
                .map_err(|_| LexError::MalformedNumber { position: start })?;
            Ok(TokenKind::DoubleLit(value))
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| LexError::MalformedNumber { position: start })?;
            Ok(TokenKind::IntLit(value))
        }
    }

    fn lex_ident(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            if is_ident_continue(ch) {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        match text.as_str() {
            "function" => TokenKind::Function,
            "native" => TokenKind::Native,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "print" => TokenKind::Print,
            "return" => TokenKind::Return,
            "int" => TokenKind::TypeInt,
            "double" => TokenKind::TypeDouble,
            "string" => TokenKind::TypeString,
            "void" => TokenKind::TypeVoid,
            _ => TokenKind::Ident(text),
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.index + ahead).copied()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek() {
            self.index += 1;
            if ch == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
    }

    fn position(&self) -> Position {
        Position::new(self.line, self.col)
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lex_declaration_and_assignment() {
        assert_eq!(
            kinds("int x; x = 5;"),
            vec![
                TokenKind::TypeInt,
                TokenKind::Ident("x".to_string()),
                TokenKind::Semicolon,
                TokenKind::Ident("x".to_string()),
                TokenKind::Assign,
                TokenKind::IntLit(5),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_range_is_not_a_double() {
        assert_eq!(
            kinds("0..4"),
            vec![
                TokenKind::IntLit(0),
                TokenKind::Range,
                TokenKind::IntLit(4),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_double_literals() {
        assert_eq!(
            kinds("3.5 1e3"),
            vec![
                TokenKind::DoubleLit(3.5),
                TokenKind::DoubleLit(1000.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_string_escapes() {
        assert_eq!(
            kinds("'a\\n\\''"),
            vec![TokenKind::StrLit("a\n'".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_comments_are_skipped() {
        assert_eq!(
            kinds("1 // trailing\n2"),
            vec![TokenKind::IntLit(1), TokenKind::IntLit(2), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_unterminated_string_errors() {
        assert!(matches!(
            lex("'abc"),
            Err(LexError::UnterminatedString { .. })
        ));
    }
}
