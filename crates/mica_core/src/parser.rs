use crate::ast::{
    AssignOp, BinaryOp, Block, Expr, ExprKind, FunctionBody, FunctionDecl, NodeId, Param, Program,
    Stmt, StmtKind, Type, UnaryOp,
};
use crate::diagnostics::{Position, Span};
use crate::lexer::{Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("{position}: expected {expected}, found {found}")]
    Expected {
        expected: &'static str,
        found: String,
        position: Position,
    },
    #[error("{position}: expected an expression, found {found}")]
    ExpectedExpression { found: String, position: Position },
}

pub fn parse(tokens: &[Token]) -> Result<Program, ParseError> {
    Parser::new(tokens).parse_program()
}

struct Parser<'a> {
    tokens: &'a [Token],
    index: usize,
    next_id: NodeId,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            index: 0,
            next_id: 0,
        }
    }

    fn parse_program(mut self) -> Result<Program, ParseError> {
        let start = self.position();
        let id = self.fresh_id();
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::Eof) {
            if self.at(&TokenKind::Semicolon) {
                self.advance();
                continue;
            }
            stmts.push(self.parse_stmt()?);
        }
        let span = Span::new(start, self.position());
        Ok(Program {
            top: Block { id, stmts, span },
        })
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        let start = self.position();
        let id = self.fresh_id();
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            if self.at(&TokenKind::Eof) {
                return Err(self.expected("'}'"));
            }
            if self.at(&TokenKind::Semicolon) {
                self.advance();
                continue;
            }
            stmts.push(self.parse_stmt()?);
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        let span = Span::new(start, self.position());
        Ok(Block { id, stmts, span })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.peek_kind() {
            TokenKind::TypeInt => self.parse_decl(Type::Int),
            TokenKind::TypeDouble => self.parse_decl(Type::Double),
            TokenKind::TypeString => self.parse_decl(Type::Str),
            TokenKind::Function => self.parse_function(),
            TokenKind::Print => self.parse_print(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Ident(_) => {
                if matches!(self.peek_kind_at(1), TokenKind::LParen) {
                    self.parse_expr_stmt()
                } else {
                    self.parse_assign()
                }
            }
            _ => Err(self.expected("a statement")),
        }
    }

    fn parse_decl(&mut self, ty: Type) -> Result<Stmt, ParseError> {
        let start = self.position();
        let id = self.fresh_id();
        self.advance();
        let name = self.expect_ident()?;
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(Stmt {
            id,
            kind: StmtKind::Decl { name, ty },
            span: Span::new(start, self.position()),
        })
    }

    fn parse_assign(&mut self) -> Result<Stmt, ParseError> {
        let start = self.position();
        let id = self.fresh_id();
        let name = self.expect_ident()?;
        let op = match self.peek_kind() {
            TokenKind::Assign => AssignOp::Set,
            TokenKind::AddAssign => AssignOp::AddSet,
            TokenKind::SubAssign => AssignOp::SubSet,
            _ => return Err(self.expected("'=', '+=', or '-='")),
        };
        self.advance();
        let value = self.parse_expr()?;
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(Stmt {
            id,
            kind: StmtKind::Assign { name, op, value },
            span: Span::new(start, self.position()),
        })
    }

    fn parse_expr_stmt(&mut self) -> Result<Stmt, ParseError> {
        let start = self.position();
        let id = self.fresh_id();
        let expr = self.parse_expr()?;
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(Stmt {
            id,
            kind: StmtKind::Expr { expr },
            span: Span::new(start, self.position()),
        })
    }

    fn parse_print(&mut self) -> Result<Stmt, ParseError> {
        let start = self.position();
        let id = self.fresh_id();
        self.advance();
        self.expect(TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.at(&TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(Stmt {
            id,
            kind: StmtKind::Print { args },
            span: Span::new(start, self.position()),
        })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let start = self.position();
        let id = self.fresh_id();
        self.advance();
        self.expect(TokenKind::LParen, "'('")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        let then_block = self.parse_block()?;
        let else_block = if self.at(&TokenKind::Else) {
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(Stmt {
            id,
            kind: StmtKind::If {
                cond,
                then_block,
                else_block,
            },
            span: Span::new(start, self.position()),
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let start = self.position();
        let id = self.fresh_id();
        self.advance();
        self.expect(TokenKind::LParen, "'('")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        let body = self.parse_block()?;
        Ok(Stmt {
            id,
            kind: StmtKind::While { cond, body },
            span: Span::new(start, self.position()),
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let start = self.position();
        let id = self.fresh_id();
        self.advance();
        self.expect(TokenKind::LParen, "'('")?;
        let var = self.expect_ident()?;
        self.expect(TokenKind::In, "'in'")?;
        let from = self.parse_expr()?;
        self.expect(TokenKind::Range, "'..'")?;
        let to = self.parse_expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        let body = self.parse_block()?;
        Ok(Stmt {
            id,
            kind: StmtKind::For {
                var,
                from,
                to,
                body,
            },
            span: Span::new(start, self.position()),
        })
    }

    fn parse_return(&mut self) -> Result<Stmt, ParseError> {
        let start = self.position();
        let id = self.fresh_id();
        self.advance();
        let value = if self.at(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(Stmt {
            id,
            kind: StmtKind::Return { value },
            span: Span::new(start, self.position()),
        })
    }

    fn parse_function(&mut self) -> Result<Stmt, ParseError> {
        let start = self.position();
        let stmt_id = self.fresh_id();
        let fn_id = self.fresh_id();
        self.advance();
        let return_type = self.parse_type("a return type")?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                let param_start = self.position();
                let ty = self.parse_type("a parameter type")?;
                let name = self.expect_ident()?;
                params.push(Param {
                    name,
                    ty,
                    span: Span::new(param_start, self.position()),
                });
                if self.at(&TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;

        let body = if self.at(&TokenKind::Native) {
            self.advance();
            let symbol = match self.peek_kind().clone() {
                TokenKind::StrLit(symbol) => {
                    self.advance();
                    symbol
                }
                _ => return Err(self.expected("a native symbol string")),
            };
            self.expect(TokenKind::Semicolon, "';'")?;
            FunctionBody::Native { symbol }
        } else {
            FunctionBody::Block(self.parse_block()?)
        };

        let span = Span::new(start, self.position());
        Ok(Stmt {
            id: stmt_id,
            kind: StmtKind::Function(FunctionDecl {
                id: fn_id,
                name,
                params,
                return_type,
                body,
                span,
            }),
            span,
        })
    }

    fn parse_type(&mut self, expected: &'static str) -> Result<Type, ParseError> {
        let ty = match self.peek_kind() {
            TokenKind::TypeInt => Type::Int,
            TokenKind::TypeDouble => Type::Double,
            TokenKind::TypeString => Type::Str,
            TokenKind::TypeVoid => Type::Void,
            _ => return Err(self.expected(expected)),
        };
        self.advance();
        Ok(ty)
    }

    // ---- expressions, precedence climbing ----

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.at(&TokenKind::OrOr) {
            let start = left.span.start;
            let id = self.fresh_id();
            self.advance();
            let right = self.parse_and()?;
            left = self.binary(id, BinaryOp::Or, left, right, start);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        while self.at(&TokenKind::AndAnd) {
            let start = left.span.start;
            let id = self.fresh_id();
            self.advance();
            let right = self.parse_equality()?;
            left = self.binary(id, BinaryOp::And, left, right, start);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::Ne,
                _ => break,
            };
            let start = left.span.start;
            let id = self.fresh_id();
            self.advance();
            let right = self.parse_relational()?;
            left = self.binary(id, op, left, right, start);
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::LtEq => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::GtEq => BinaryOp::Ge,
                _ => break,
            };
            let start = left.span.start;
            let id = self.fresh_id();
            self.advance();
            let right = self.parse_additive()?;
            left = self.binary(id, op, left, right, start);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let start = left.span.start;
            let id = self.fresh_id();
            self.advance();
            let right = self.parse_multiplicative()?;
            left = self.binary(id, op, left, right, start);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            let start = left.span.start;
            let id = self.fresh_id();
            self.advance();
            let right = self.parse_unary()?;
            left = self.binary(id, op, left, right, start);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let start = self.position();
        let op = match self.peek_kind() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let id = self.fresh_id();
            self.advance();
            let operand = self.parse_unary()?;
            let span = Span::new(start, self.position());
            return Ok(Expr {
                id,
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let start = self.position();
        match self.peek_kind().clone() {
            TokenKind::IntLit(value) => {
                let id = self.fresh_id();
                self.advance();
                Ok(self.literal(id, ExprKind::IntLit(value), start))
            }
            TokenKind::DoubleLit(value) => {
                let id = self.fresh_id();
                self.advance();
                Ok(self.literal(id, ExprKind::DoubleLit(value), start))
            }
            TokenKind::StrLit(value) => {
                let id = self.fresh_id();
                self.advance();
                Ok(self.literal(id, ExprKind::StrLit(value), start))
            }
            TokenKind::Ident(name) => {
                let id = self.fresh_id();
                self.advance();
                if self.at(&TokenKind::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.at(&TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.at(&TokenKind::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                    Ok(Expr {
                        id,
                        kind: ExprKind::Call { name, args },
                        span: Span::new(start, self.position()),
                    })
                } else {
                    Ok(self.literal(id, ExprKind::Var(name), start))
                }
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            other => Err(ParseError::ExpectedExpression {
                found: describe(&other),
                position: start,
            }),
        }
    }

    fn literal(&self, id: NodeId, kind: ExprKind, start: Position) -> Expr {
        Expr {
            id,
            kind,
            span: Span::new(start, self.position()),
        }
    }

    fn binary(
        &self,
        id: NodeId,
        op: BinaryOp,
        left: Expr,
        right: Expr,
        start: Position,
    ) -> Expr {
        let span = Span::new(start, self.position());
        Expr {
            id,
            kind: ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        }
    }

    // ---- token plumbing ----

    fn peek(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_kind_at(&self, ahead: usize) -> &TokenKind {
        let index = (self.index + ahead).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) {
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
    }

    fn position(&self) -> Position {
        self.peek().span.start
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<(), ParseError> {
        if self.peek_kind() == &kind {
            self.advance();
            Ok(())
        } else {
            Err(self.expected(expected))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.expected("an identifier")),
        }
    }

    fn expected(&self, expected: &'static str) -> ParseError {
        ParseError::Expected {
            expected,
            found: describe(self.peek_kind()),
            position: self.position(),
        }
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(name) => format!("identifier '{name}'"),
        TokenKind::IntLit(value) => format!("integer literal {value}"),
        TokenKind::DoubleLit(value) => format!("double literal {value}"),
        TokenKind::StrLit(_) => "string literal".to_string(),
        TokenKind::Eof => "end of input".to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_source(source: &str) -> Program {
        parse(&lex(source).unwrap()).unwrap()
    }

    #[test]
    fn parse_declaration_and_assignment() {
        let program = parse_source("int x; x = 1 + 2 * 3;");
        assert_eq!(program.top.stmts.len(), 2);
        let StmtKind::Assign { name, op, value } = &program.top.stmts[1].kind else {
            panic!("expected assignment");
        };
        assert_eq!(name, "x");
        assert_eq!(*op, AssignOp::Set);
        let ExprKind::Binary { op, right, .. } = &value.kind else {
            panic!("expected binary expression");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn parse_nested_function() {
        let program = parse_source(
            "function int add(int a, int b) { return a + b; } print(add(2, 3));",
        );
        let StmtKind::Function(decl) = &program.top.stmts[0].kind else {
            panic!("expected function declaration");
        };
        assert_eq!(decl.name, "add");
        assert_eq!(decl.params.len(), 2);
        assert_eq!(decl.return_type, Type::Int);
    }

    #[test]
    fn parse_native_function() {
        let program = parse_source("function int slen(string s) native 'strlen';");
        let StmtKind::Function(decl) = &program.top.stmts[0].kind else {
            panic!("expected function declaration");
        };
        let FunctionBody::Native { symbol } = &decl.body else {
            panic!("expected native body");
        };
        assert_eq!(symbol, "strlen");
    }

    #[test]
    fn parse_for_range() {
        let program = parse_source("int i; for (i in 0..4) { print(i); }");
        assert!(matches!(
            program.top.stmts[1].kind,
            StmtKind::For { .. }
        ));
    }

    #[test]
    fn parse_missing_semicolon_errors() {
        let tokens = lex("int x").unwrap();
        assert!(matches!(parse(&tokens), Err(ParseError::Expected { .. })));
    }
}
