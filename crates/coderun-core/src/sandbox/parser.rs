//! Recursive descent parser for the snippet language
//!
//! Grammar is a small JavaScript subset: declarations, functions with
//! closures, `if`/`while`/`for`, `throw`, and the usual expression
//! operators. Anything outside the subset is a `SyntaxError`, reported with
//! line:column.
//!
//! Nesting depth is capped so that hostile input cannot exhaust the
//! evaluation thread's stack while parsing.

use std::rc::Rc;

use super::ast::*;
use super::tokenizer::{Span, SpannedToken, Token, Tokenizer};
use crate::error::ExecutionFault;

/// Maximum syntactic nesting (statements + expressions)
pub const MAX_NESTING: usize = 200;

type PResult<T> = Result<T, ExecutionFault>;

/// Parse snippet text into a [`Program`]
///
/// # Errors
/// Returns `ExecutionFault::Syntax` with line:column for syntax violations.
pub fn parse(source: &str) -> PResult<Program> {
    let tokens = Tokenizer::new(source).tokenize()?;
    Parser::new(tokens).parse_program()
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    depth: usize,
    loop_depth: usize,
    function_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<SpannedToken>) -> Self {
        Parser {
            tokens,
            pos: 0,
            depth: 0,
            loop_depth: 0,
            function_depth: 0,
        }
    }

    fn parse_program(&mut self) -> PResult<Program> {
        let mut body = Vec::new();
        while !self.check(&Token::Eof) {
            body.push(self.parse_statement()?);
        }
        Ok(Program { body })
    }

    // ── Token helpers ──────────────────────────────────────

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].token
    }

    fn span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].span
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
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

    fn expect(&mut self, token: &Token) -> PResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_identifier(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn unexpected(&self) -> ExecutionFault {
        match self.peek() {
            Token::Eof => ExecutionFault::Syntax("Unexpected end of input".into()),
            token => ExecutionFault::Syntax(format!(
                "Unexpected token {} at {}",
                describe_token(token),
                self.span()
            )),
        }
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ExecutionFault::Syntax(format!(
                "Nesting deeper than {} levels at {}",
                MAX_NESTING,
                self.span()
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Optional `;` after a simple statement
    fn end_statement(&mut self) {
        self.eat(&Token::Semicolon);
    }

    // ── Statements ─────────────────────────────────────────

    fn parse_statement(&mut self) -> PResult<Stmt> {
        self.enter()?;
        let stmt = self.parse_statement_inner();
        self.leave();
        stmt
    }

    fn parse_statement_inner(&mut self) -> PResult<Stmt> {
        match self.peek() {
            Token::LBrace => {
                self.advance();
                Ok(Stmt::Block(self.parse_block_body()?))
            }
            Token::Let | Token::Const | Token::Var => {
                let decl = self.parse_declaration()?;
                self.end_statement();
                Ok(decl)
            }
            Token::Function if matches!(self.peek_at(1), Token::Identifier(_)) => {
                self.advance();
                let def = self.parse_function_rest(true)?;
                Ok(Stmt::Function(def))
            }
            Token::If => self.parse_if(),
            Token::While => {
                self.advance();
                self.expect(&Token::LParen)?;
                let test = self.parse_expression()?;
                self.expect(&Token::RParen)?;
                let body = self.parse_loop_body()?;
                Ok(Stmt::While { test, body })
            }
            Token::For => self.parse_for(),
            Token::Return => {
                if self.function_depth == 0 {
                    return Err(ExecutionFault::Syntax(format!(
                        "Illegal return statement at {}",
                        self.span()
                    )));
                }
                self.advance();
                let value = if matches!(
                    self.peek(),
                    Token::Semicolon | Token::RBrace | Token::Eof
                ) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.end_statement();
                Ok(Stmt::Return(value))
            }
            Token::Break | Token::Continue => {
                let is_break = self.check(&Token::Break);
                if self.loop_depth == 0 {
                    return Err(ExecutionFault::Syntax(format!(
                        "Illegal {} statement at {}",
                        if is_break { "break" } else { "continue" },
                        self.span()
                    )));
                }
                self.advance();
                self.end_statement();
                Ok(if is_break { Stmt::Break } else { Stmt::Continue })
            }
            Token::Throw => {
                self.advance();
                let value = self.parse_expression()?;
                self.end_statement();
                Ok(Stmt::Throw(value))
            }
            Token::Semicolon => {
                self.advance();
                Ok(Stmt::Empty)
            }
            _ => {
                let expr = self.parse_expression()?;
                self.end_statement();
                Ok(Stmt::Expr(expr))
            }
        }
    }

    /// Statements up to the closing `}`; the opening brace is consumed
    fn parse_block_body(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.check(&Token::Eof) {
                return Err(self.unexpected());
            }
            body.push(self.parse_statement()?);
        }
        self.advance();
        Ok(body)
    }

    fn parse_declaration(&mut self) -> PResult<Stmt> {
        let kind = match self.advance() {
            Token::Let => DeclKind::Let,
            Token::Const => DeclKind::Const,
            _ => DeclKind::Var,
        };

        let mut declarators = Vec::new();
        loop {
            let span = self.span();
            let name = self.expect_identifier()?;
            let init = if self.eat(&Token::Assign) {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            if kind == DeclKind::Const && init.is_none() {
                return Err(ExecutionFault::Syntax(format!(
                    "Missing initializer in const declaration at {}",
                    span
                )));
            }
            declarators.push((name, init));
            if !self.eat(&Token::Comma) {
                break;
            }
        }

        Ok(Stmt::Declare { kind, declarators })
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        self.advance();
        self.expect(&Token::LParen)?;
        let test = self.parse_expression()?;
        self.expect(&Token::RParen)?;
        let then = Box::new(self.parse_statement()?);
        let otherwise = if self.eat(&Token::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            test,
            then,
            otherwise,
        })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        self.advance();
        self.expect(&Token::LParen)?;

        let init = match self.peek() {
            Token::Semicolon => None,
            Token::Let | Token::Const | Token::Var => Some(Box::new(self.parse_declaration()?)),
            _ => Some(Box::new(Stmt::Expr(self.parse_expression()?))),
        };
        self.expect(&Token::Semicolon)?;

        let test = if self.check(&Token::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(&Token::Semicolon)?;

        let update = if self.check(&Token::RParen) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(&Token::RParen)?;

        let body = self.parse_loop_body()?;
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    fn parse_loop_body(&mut self) -> PResult<Box<Stmt>> {
        self.loop_depth += 1;
        let body = self.parse_statement();
        self.loop_depth -= 1;
        Ok(Box::new(body?))
    }

    /// Parameters and body after `function`; the keyword is consumed
    fn parse_function_rest(&mut self, require_name: bool) -> PResult<Rc<FunctionDef>> {
        let name = match self.peek().clone() {
            Token::Identifier(name) => {
                self.advance();
                Some(name)
            }
            _ if require_name => return Err(self.unexpected()),
            _ => None,
        };

        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        while !self.check(&Token::RParen) {
            params.push(self.expect_identifier()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        self.expect(&Token::LBrace)?;

        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.function_depth += 1;
        let body = self.parse_block_body();
        self.function_depth -= 1;
        self.loop_depth = saved_loops;

        Ok(Rc::new(FunctionDef {
            name,
            params,
            body: body?,
        }))
    }

    // ── Expressions ────────────────────────────────────────

    fn parse_expression(&mut self) -> PResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> PResult<Expr> {
        self.enter()?;
        let expr = self.parse_assignment_inner();
        self.leave();
        expr
    }

    fn parse_assignment_inner(&mut self) -> PResult<Expr> {
        if self.at_arrow() {
            return self.parse_arrow();
        }
        let target = self.parse_conditional()?;

        let op = match self.peek() {
            Token::Assign => None,
            Token::PlusAssign => Some(BinaryOp::Add),
            Token::MinusAssign => Some(BinaryOp::Sub),
            Token::StarAssign => Some(BinaryOp::Mul),
            Token::SlashAssign => Some(BinaryOp::Div),
            Token::PercentAssign => Some(BinaryOp::Rem),
            _ => return Ok(target),
        };

        if !target.is_assignable() {
            return Err(ExecutionFault::Syntax(format!(
                "Invalid left-hand side in assignment at {}",
                self.span()
            )));
        }
        self.advance();
        let value = self.parse_assignment()?;

        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    /// `x =>` or `(a, b) =>` ahead
    fn at_arrow(&self) -> bool {
        match self.peek() {
            Token::Identifier(_) => matches!(self.peek_at(1), Token::Arrow),
            Token::LParen => {
                let mut offset = 1;
                loop {
                    match self.peek_at(offset) {
                        Token::RParen => return matches!(self.peek_at(offset + 1), Token::Arrow),
                        Token::Identifier(_) | Token::Comma => offset += 1,
                        _ => return false,
                    }
                }
            }
            _ => false,
        }
    }

    fn parse_arrow(&mut self) -> PResult<Expr> {
        let params = if self.eat(&Token::LParen) {
            let mut params = Vec::new();
            while !self.check(&Token::RParen) {
                params.push(self.expect_identifier()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
            params
        } else {
            vec![self.expect_identifier()?]
        };
        self.expect(&Token::Arrow)?;

        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.function_depth += 1;
        // A concise body is an implicit return
        let body = if self.eat(&Token::LBrace) {
            self.parse_block_body()
        } else {
            self.parse_assignment()
                .map(|expr| vec![Stmt::Return(Some(expr))])
        };
        self.function_depth -= 1;
        self.loop_depth = saved_loops;

        Ok(Expr::Function(Rc::new(FunctionDef {
            name: None,
            params,
            body: body?,
        })))
    }

    fn parse_conditional(&mut self) -> PResult<Expr> {
        let test = self.parse_logical_or()?;
        if !self.eat(&Token::Question) {
            return Ok(test);
        }
        let then = self.parse_assignment()?;
        self.expect(&Token::Colon)?;
        let otherwise = self.parse_assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn parse_logical_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_logical_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_logical_and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_equality()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::NotEq,
                Token::StrictEq => BinaryOp::StrictEq,
                Token::StrictNotEq => BinaryOp::StrictNotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_relational()?;
            left = binary(op, left, right);
        }
    }

    fn parse_relational(&mut self) -> PResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut left = self.parse_exponent()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_exponent()?;
            left = binary(op, left, right);
        }
    }

    /// `**` is right-associative
    fn parse_exponent(&mut self) -> PResult<Expr> {
        let base = self.parse_unary()?;
        if self.eat(&Token::StarStar) {
            let exponent = self.parse_exponent()?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        self.enter()?;
        let expr = self.parse_unary_inner();
        self.leave();
        expr
    }

    fn parse_unary_inner(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Plus,
            Token::Bang => UnaryOp::Not,
            Token::Typeof => UnaryOp::Typeof,
            Token::PlusPlus | Token::MinusMinus => {
                let increment = self.check(&Token::PlusPlus);
                self.advance();
                let target = self.parse_unary()?;
                return self.update(increment, true, target);
            }
            _ => return self.parse_postfix(),
        };
        self.advance();
        let expr = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let expr = self.parse_call_member()?;
        match self.peek() {
            Token::PlusPlus | Token::MinusMinus => {
                let increment = self.check(&Token::PlusPlus);
                self.advance();
                self.update(increment, false, expr)
            }
            _ => Ok(expr),
        }
    }

    fn update(&self, increment: bool, prefix: bool, target: Expr) -> PResult<Expr> {
        if !target.is_assignable() {
            return Err(ExecutionFault::Syntax(format!(
                "Invalid left-hand side expression in {} operation at {}",
                if prefix { "prefix" } else { "postfix" },
                self.span()
            )));
        }
        Ok(Expr::Update {
            increment,
            prefix,
            target: Box::new(target),
        })
    }

    fn parse_call_member(&mut self) -> PResult<Expr> {
        let mut expr = if self.check(&Token::New) {
            self.parse_new()?
        } else {
            self.parse_primary()?
        };

        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let property = self.expect_property_name()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Token::LParen => {
                    let args = self.parse_arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// `new Callee(args)`; the callee may be a dotted member path
    fn parse_new(&mut self) -> PResult<Expr> {
        self.advance();
        let mut callee = self.parse_primary()?;
        while self.eat(&Token::Dot) {
            let property = self.expect_property_name()?;
            callee = Expr::Member {
                object: Box::new(callee),
                property,
            };
        }
        let args = if self.check(&Token::LParen) {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        Ok(Expr::New {
            callee: Box::new(callee),
            args,
        })
    }

    /// Property names after `.` may be reserved words (`obj.new`)
    fn expect_property_name(&mut self) -> PResult<String> {
        let name = match self.peek() {
            Token::Identifier(name) => name.clone(),
            token => match keyword_text(token) {
                Some(text) => text.to_string(),
                None => return Err(self.unexpected()),
            },
        };
        self.advance();
        Ok(name)
    }

    fn parse_arguments(&mut self) -> PResult<Vec<Expr>> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        while !self.check(&Token::RParen) {
            args.push(self.parse_assignment()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        match self.peek().clone() {
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str(Rc::from(s.as_str())))
            }
            Token::Boolean(b) => {
                self.advance();
                Ok(Expr::Boolean(b))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            Token::Identifier(name) => {
                self.advance();
                Ok(Expr::Ident(name))
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                while !self.check(&Token::RBracket) {
                    elements.push(self.parse_assignment()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::Array(elements))
            }
            Token::LBrace => self.parse_object_literal(),
            Token::Function => {
                self.advance();
                Ok(Expr::Function(self.parse_function_rest(false)?))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_object_literal(&mut self) -> PResult<Expr> {
        self.advance();
        let mut properties = Vec::new();

        while !self.check(&Token::RBrace) {
            let (key, shorthand) = match self.peek().clone() {
                Token::Identifier(name) => (name, true),
                Token::Str(s) => (s, false),
                Token::Number(n) => (format_number_key(n), false),
                token => match keyword_text(&token) {
                    Some(text) => (text.to_string(), false),
                    None => return Err(self.unexpected()),
                },
            };
            self.advance();

            let value = if shorthand && matches!(self.peek(), Token::Comma | Token::RBrace) {
                Expr::Ident(key.clone())
            } else {
                self.expect(&Token::Colon)?;
                self.parse_assignment()?
            };
            properties.push((key, value));

            if !self.eat(&Token::Comma) {
                break;
            }
        }

        self.expect(&Token::RBrace)?;
        Ok(Expr::Object(properties))
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn format_number_key(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn keyword_text(token: &Token) -> Option<&'static str> {
    Some(match token {
        Token::Let => "let",
        Token::Const => "const",
        Token::Var => "var",
        Token::Function => "function",
        Token::Return => "return",
        Token::If => "if",
        Token::Else => "else",
        Token::While => "while",
        Token::For => "for",
        Token::Break => "break",
        Token::Continue => "continue",
        Token::Throw => "throw",
        Token::New => "new",
        Token::Typeof => "typeof",
        Token::Null => "null",
        Token::Boolean(true) => "true",
        Token::Boolean(false) => "false",
        _ => return None,
    })
}

fn describe_token(token: &Token) -> String {
    if let Some(keyword) = keyword_text(token) {
        return format!("'{}'", keyword);
    }
    let text = match token {
        Token::Number(n) => return format!("number {}", n),
        Token::Str(s) => return format!("string \"{}\"", s),
        Token::Identifier(name) => return format!("identifier '{}'", name),
        Token::LParen => "(",
        Token::RParen => ")",
        Token::LBrace => "{",
        Token::RBrace => "}",
        Token::LBracket => "[",
        Token::RBracket => "]",
        Token::Comma => ",",
        Token::Semicolon => ";",
        Token::Colon => ":",
        Token::Dot => ".",
        Token::Question => "?",
        Token::Arrow => "=>",
        Token::Plus => "+",
        Token::Minus => "-",
        Token::Star => "*",
        Token::StarStar => "**",
        Token::Slash => "/",
        Token::Percent => "%",
        Token::Bang => "!",
        Token::Assign => "=",
        Token::PlusAssign => "+=",
        Token::MinusAssign => "-=",
        Token::StarAssign => "*=",
        Token::SlashAssign => "/=",
        Token::PercentAssign => "%=",
        Token::PlusPlus => "++",
        Token::MinusMinus => "--",
        Token::Eq => "==",
        Token::StrictEq => "===",
        Token::NotEq => "!=",
        Token::StrictNotEq => "!==",
        Token::Lt => "<",
        Token::Le => "<=",
        Token::Gt => ">",
        Token::Ge => ">=",
        Token::AndAnd => "&&",
        Token::OrOr => "||",
        _ => "end of input",
    };
    format!("'{}'", text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_err(input: &str) -> String {
        parse(input).unwrap_err().to_string()
    }

    #[test]
    fn test_parse_simple_expression() {
        let program = parse("1+1").unwrap();
        assert_eq!(
            program.body,
            vec![Stmt::Expr(binary(
                BinaryOp::Add,
                Expr::Number(1.0),
                Expr::Number(1.0)
            ))]
        );
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let program = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            program.body,
            vec![Stmt::Expr(binary(
                BinaryOp::Add,
                Expr::Number(1.0),
                binary(BinaryOp::Mul, Expr::Number(2.0), Expr::Number(3.0))
            ))]
        );
    }

    #[test]
    fn test_exponent_is_right_associative() {
        let program = parse("2 ** 3 ** 2").unwrap();
        assert_eq!(
            program.body,
            vec![Stmt::Expr(binary(
                BinaryOp::Pow,
                Expr::Number(2.0),
                binary(BinaryOp::Pow, Expr::Number(3.0), Expr::Number(2.0))
            ))]
        );
    }

    #[test]
    fn test_parse_declarations_and_functions() {
        let program = parse(
            "let a = 1, b; const c = 2; function add(x, y) { return x + y; } add(a, c)",
        )
        .unwrap();
        assert_eq!(program.body.len(), 4);
        match &program.body[0] {
            Stmt::Declare { kind, declarators } => {
                assert_eq!(*kind, DeclKind::Let);
                assert_eq!(declarators.len(), 2);
                assert!(declarators[1].1.is_none());
            }
            other => panic!("expected declaration, got {:?}", other),
        }
        match &program.body[2] {
            Stmt::Function(def) => {
                assert_eq!(def.name.as_deref(), Some("add"));
                assert_eq!(def.params, vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_flow() {
        let program = parse(
            "for (let i = 0; i < 3; i++) { if (i == 1) continue; else break; } while (false) {}",
        )
        .unwrap();
        assert!(matches!(program.body[0], Stmt::For { .. }));
        assert!(matches!(program.body[1], Stmt::While { .. }));
    }

    #[test]
    fn test_statement_brace_is_block_expression_brace_is_object() {
        let program = parse("{ 1 } ({ a: 1, 'b': 2, c })").unwrap();
        assert!(matches!(program.body[0], Stmt::Block(_)));
        match &program.body[1] {
            Stmt::Expr(Expr::Object(props)) => {
                let keys: Vec<&str> = props.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, vec!["a", "b", "c"]);
                assert_eq!(props[2].1, Expr::Ident("c".into()));
            }
            other => panic!("expected object literal, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_new_error() {
        let program = parse("throw new Error('boom')").unwrap();
        match &program.body[0] {
            Stmt::Throw(Expr::New { callee, args }) => {
                assert_eq!(**callee, Expr::Ident("Error".into()));
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected throw new, got {:?}", other),
        }
    }

    #[test]
    fn test_error_unexpected_token() {
        let err = parse_err("1 +* 2");
        assert!(err.starts_with("SyntaxError: Unexpected token '*'"), "{}", err);
    }

    #[test]
    fn test_error_unexpected_end() {
        assert_eq!(parse_err("(1 + 2"), "SyntaxError: Unexpected end of input");
    }

    #[test]
    fn test_error_top_level_return() {
        assert!(parse_err("return 1").contains("Illegal return statement"));
    }

    #[test]
    fn test_error_break_outside_loop() {
        assert!(parse_err("break;").contains("Illegal break statement"));
        assert!(parse_err("while (true) { function f() { continue; } }")
            .contains("Illegal continue statement"));
    }

    #[test]
    fn test_error_invalid_assignment_target() {
        assert!(parse_err("1 = 2").contains("Invalid left-hand side"));
        assert!(parse_err("(a + b)++").contains("Invalid left-hand side"));
    }

    #[test]
    fn test_error_const_without_initializer() {
        assert!(parse_err("const x;").contains("Missing initializer"));
    }

    #[test]
    fn test_deep_nesting_is_rejected_not_overflowed() {
        let deep = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(parse_err(&deep).contains("Nesting deeper than"));

        let unary = format!("{}1", "-".repeat(10_000));
        assert!(parse_err(&unary).contains("Nesting deeper than"));
    }

    #[test]
    fn test_arrow_functions() {
        let program = parse("const double = x => x * 2").unwrap();
        let Stmt::Declare { declarators, .. } = &program.body[0] else {
            panic!("expected declaration");
        };
        let Some(Expr::Function(def)) = &declarators[0].1 else {
            panic!("expected function");
        };
        assert_eq!(def.params, vec!["x".to_string()]);
        assert!(matches!(def.body[0], Stmt::Return(Some(_))));

        let program = parse("((a, b) => { return a + b })(1, 2)").unwrap();
        assert!(matches!(program.body[0], Stmt::Expr(Expr::Call { .. })));
        assert!(parse("[1, 2].map(() => 0)").is_ok());
    }

    #[test]
    fn test_parenthesized_expression_is_not_arrow() {
        let err = parse("(a, b)").unwrap_err().to_string();
        assert!(err.starts_with("SyntaxError"), "{}", err);
        assert!(parse("(a)").is_ok());
    }

    #[test]
    fn test_parse_determinism_100_iterations() {
        let source = "let s = 0; for (let i = 0; i < 10; i++) { s += i } s";
        let first = parse(source).unwrap();
        for i in 0..100 {
            assert_eq!(first, parse(source).unwrap(), "Non-determinism at iteration {}", i);
        }
    }
}
