// Copyright 2025 Quarry Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pratt parser for the expression sub-language
//!
//! Parses stitched template text into the [`Expr`] AST: record and
//! sequence literals, member/index access, calls, lambdas, arithmetic,
//! boolean and comparison operators, `this`, `$`-parameters and `?`
//! substitution holes (numbered left to right).

use super::ast::{BinaryOp, Expr, RecordEntry, UnaryOp};
use super::error::ParseError;
use super::lexer::Lexer;
use super::precedence::Precedence;
use super::token::{Token, TokenType};

/// Expression parser
pub struct Parser {
    lexer: Lexer,
    cur_token: Token,
    peek_token: Token,
    errors: Vec<ParseError>,
    holes: usize,
}

impl Parser {
    /// Create a parser over the given input
    pub fn new(input: &str) -> Self {
        let mut lexer = Lexer::new(input);
        let cur_token = lexer.next_token();
        let peek_token = lexer.next_token();
        let mut parser = Self {
            lexer,
            cur_token,
            peek_token,
            errors: Vec::new(),
            holes: 0,
        };
        parser.check_token_error();
        parser
    }

    /// Parse the whole input as a single expression
    pub fn parse(mut self) -> Result<Expr, Vec<ParseError>> {
        let expr = self.parse_expression(Precedence::Lowest);
        if self.peek_token.token_type != TokenType::Eof {
            self.add_error(format!("unexpected {}", self.peek_token));
        }
        match (expr, self.errors.is_empty()) {
            (Some(expr), true) => Ok(expr),
            _ => Err(self.errors),
        }
    }

    /// Number of `?` holes encountered
    pub fn hole_count(&self) -> usize {
        self.holes
    }

    fn next_token(&mut self) {
        self.cur_token = std::mem::replace(&mut self.peek_token, self.lexer.next_token());
        self.check_token_error();
    }

    fn check_token_error(&mut self) {
        if self.peek_token.token_type == TokenType::Error {
            let message = self
                .peek_token
                .error
                .clone()
                .unwrap_or_else(|| "invalid token".to_string());
            self.errors
                .push(ParseError::new(message, self.peek_token.position));
        }
    }

    fn add_error(&mut self, message: impl Into<String>) {
        self.errors
            .push(ParseError::new(message, self.cur_token.position));
    }

    /// Advance iff the peek token is the given punctuator
    fn expect_peek_punctuator(&mut self, literal: &str) -> bool {
        if self.peek_token.is_punctuator(literal) {
            self.next_token();
            true
        } else {
            self.add_error(format!("expected '{}', found {}", literal, self.peek_token));
            false
        }
    }

    fn peek_precedence(&self) -> Precedence {
        match self.peek_token.token_type {
            TokenType::Operator => Precedence::for_operator(&self.peek_token.literal),
            TokenType::Punctuator => match self.peek_token.literal.as_str() {
                "." | "(" | "[" => Precedence::for_operator(&self.peek_token.literal),
                _ => Precedence::Lowest,
            },
            _ => Precedence::Lowest,
        }
    }

    /// Parse an expression at the given precedence
    pub fn parse_expression(&mut self, precedence: Precedence) -> Option<Expr> {
        let mut left = self.parse_prefix_expression()?;

        while self.peek_token.token_type != TokenType::Eof && precedence < self.peek_precedence() {
            self.next_token();
            left = self.parse_infix_expression(left)?;
        }

        Some(left)
    }

    /// Parse a prefix expression (literals, identifiers, unary operators, ...)
    fn parse_prefix_expression(&mut self) -> Option<Expr> {
        match self.cur_token.token_type {
            TokenType::Identifier => Some(Expr::Ident(self.cur_token.literal.clone())),
            TokenType::Keyword => self.parse_keyword_expression(),
            TokenType::Number => self.parse_number_literal(),
            TokenType::String => Some(Expr::Str(self.cur_token.literal.clone())),
            TokenType::Hole => {
                let index = self.holes;
                self.holes += 1;
                Some(Expr::SubsRef(index))
            }
            TokenType::Operator => self.parse_unary_expression(),
            TokenType::Punctuator => self.parse_punctuator_expression(),
            _ => {
                self.add_error(format!(
                    "no prefix parse for {} at {}",
                    self.cur_token, self.cur_token.position
                ));
                None
            }
        }
    }

    fn parse_keyword_expression(&mut self) -> Option<Expr> {
        match self.cur_token.literal.as_str() {
            "null" => Some(Expr::Null),
            "true" => Some(Expr::Bool(true)),
            "false" => Some(Expr::Bool(false)),
            "this" => Some(Expr::This),
            other => {
                self.add_error(format!("unexpected keyword '{}'", other));
                None
            }
        }
    }

    fn parse_number_literal(&mut self) -> Option<Expr> {
        match self.cur_token.literal.parse::<f64>() {
            Ok(value) => Some(Expr::Number(value)),
            Err(e) => {
                self.add_error(format!(
                    "could not parse {} as number: {}",
                    self.cur_token.literal, e
                ));
                None
            }
        }
    }

    fn parse_unary_expression(&mut self) -> Option<Expr> {
        let op = match self.cur_token.literal.as_str() {
            "!" => UnaryOp::Not,
            "-" => UnaryOp::Neg,
            other => {
                self.add_error(format!("unexpected operator '{}'", other));
                return None;
            }
        };
        self.next_token();
        let operand = self.parse_expression(Precedence::Prefix)?;
        Some(Expr::Unary(op, operand.boxed()))
    }

    fn parse_punctuator_expression(&mut self) -> Option<Expr> {
        match self.cur_token.literal.as_str() {
            "(" => self.parse_grouped_or_lambda(),
            "[" => self.parse_sequence_literal(),
            "{" => self.parse_record_literal(),
            other => {
                self.add_error(format!("unexpected '{}'", other));
                None
            }
        }
    }

    /// Parse `( ... )`: a grouped expression or a lambda parameter list
    fn parse_grouped_or_lambda(&mut self) -> Option<Expr> {
        let mut items = Vec::new();
        if self.peek_token.is_punctuator(")") {
            self.next_token();
        } else {
            self.next_token();
            items.push(self.parse_expression(Precedence::Lowest)?);
            while self.peek_token.is_punctuator(",") {
                self.next_token();
                self.next_token();
                items.push(self.parse_expression(Precedence::Lowest)?);
            }
            if !self.expect_peek_punctuator(")") {
                return None;
            }
        }

        if self.peek_token.is_operator("=>") {
            self.next_token(); // onto =>
            let params = self.lambda_params(items)?;
            self.next_token(); // onto the body
            let body = self.parse_expression(Precedence::Lowest)?;
            return Some(Expr::Lambda(params, body.boxed()));
        }

        match items.len() {
            1 => items.pop(),
            0 => {
                self.add_error("empty parentheses are not an expression");
                None
            }
            _ => {
                self.add_error("comma expression is only valid as lambda parameters");
                None
            }
        }
    }

    fn lambda_params(&mut self, items: Vec<Expr>) -> Option<Vec<String>> {
        let mut params = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Expr::Ident(name) => params.push(name),
                other => {
                    self.add_error(format!("invalid lambda parameter '{}'", other));
                    return None;
                }
            }
        }
        Some(params)
    }

    fn parse_sequence_literal(&mut self) -> Option<Expr> {
        let mut items = Vec::new();
        if self.peek_token.is_punctuator("]") {
            self.next_token();
            return Some(Expr::Sequence(items));
        }
        self.next_token();
        items.push(self.parse_expression(Precedence::Lowest)?);
        while self.peek_token.is_punctuator(",") {
            self.next_token();
            if self.peek_token.is_punctuator("]") {
                break; // trailing comma
            }
            self.next_token();
            items.push(self.parse_expression(Precedence::Lowest)?);
        }
        if !self.expect_peek_punctuator("]") {
            return None;
        }
        Some(Expr::Sequence(items))
    }

    fn parse_record_literal(&mut self) -> Option<Expr> {
        let mut entries = Vec::new();
        if self.peek_token.is_punctuator("}") {
            self.next_token();
            return Some(Expr::Record(entries));
        }
        loop {
            self.next_token();
            entries.push(self.parse_record_entry()?);
            if self.peek_token.is_punctuator(",") {
                self.next_token();
                if self.peek_token.is_punctuator("}") {
                    self.next_token(); // trailing comma
                    break;
                }
                continue;
            }
            if !self.expect_peek_punctuator("}") {
                return None;
            }
            break;
        }
        Some(Expr::Record(entries))
    }

    fn parse_record_entry(&mut self) -> Option<RecordEntry> {
        if self.cur_token.is_punctuator("...") {
            self.next_token();
            let expr = self.parse_expression(Precedence::Lowest)?;
            return Some(RecordEntry::Spread(expr));
        }

        let name = match self.cur_token.token_type {
            TokenType::Identifier | TokenType::Keyword | TokenType::String => {
                self.cur_token.literal.clone()
            }
            _ => {
                self.add_error(format!("invalid record key {}", self.cur_token));
                return None;
            }
        };

        if self.peek_token.is_punctuator(":") {
            self.next_token();
            self.next_token();
            let expr = self.parse_expression(Precedence::Lowest)?;
            Some(RecordEntry::Field(name, expr))
        } else {
            Some(RecordEntry::Shorthand(name))
        }
    }

    /// Parse an infix expression with the operator at the current token
    fn parse_infix_expression(&mut self, left: Expr) -> Option<Expr> {
        match self.cur_token.token_type {
            TokenType::Punctuator => match self.cur_token.literal.as_str() {
                "." => self.parse_member_access(left),
                "(" => self.parse_call(left),
                "[" => self.parse_index(left),
                other => {
                    self.add_error(format!("unexpected '{}'", other));
                    None
                }
            },
            TokenType::Operator => {
                if self.cur_token.literal == "=>" {
                    return self.parse_single_param_lambda(left);
                }
                let op = match self.cur_token.literal.as_str() {
                    "+" => BinaryOp::Add,
                    "-" => BinaryOp::Sub,
                    "*" => BinaryOp::Mul,
                    "/" => BinaryOp::Div,
                    "%" => BinaryOp::Rem,
                    "++" => BinaryOp::Concat,
                    "&&" => BinaryOp::And,
                    "||" => BinaryOp::Or,
                    "==" | "===" => BinaryOp::Eq,
                    "!=" | "!==" => BinaryOp::Ne,
                    "<" => BinaryOp::Lt,
                    "<=" => BinaryOp::Le,
                    ">" => BinaryOp::Gt,
                    ">=" => BinaryOp::Ge,
                    other => {
                        self.add_error(format!("unknown operator '{}'", other));
                        return None;
                    }
                };
                let precedence = Precedence::for_operator(&self.cur_token.literal);
                self.next_token();
                let right = self.parse_expression(precedence)?;
                Some(Expr::Binary(op, left.boxed(), right.boxed()))
            }
            _ => {
                self.add_error(format!("no infix parse for {}", self.cur_token));
                None
            }
        }
    }

    fn parse_member_access(&mut self, left: Expr) -> Option<Expr> {
        self.next_token();
        match self.cur_token.token_type {
            TokenType::Identifier | TokenType::Keyword => {
                let field = self.cur_token.literal.clone();
                Some(Expr::Member(left.boxed(), field))
            }
            _ => {
                self.add_error(format!("expected field name, found {}", self.cur_token));
                None
            }
        }
    }

    fn parse_call(&mut self, callee: Expr) -> Option<Expr> {
        let mut args = Vec::new();
        if self.peek_token.is_punctuator(")") {
            self.next_token();
            return Some(Expr::Call(callee.boxed(), args));
        }
        self.next_token();
        args.push(self.parse_expression(Precedence::Lowest)?);
        while self.peek_token.is_punctuator(",") {
            self.next_token();
            self.next_token();
            args.push(self.parse_expression(Precedence::Lowest)?);
        }
        if !self.expect_peek_punctuator(")") {
            return None;
        }
        Some(Expr::Call(callee.boxed(), args))
    }

    fn parse_index(&mut self, left: Expr) -> Option<Expr> {
        self.next_token();
        let index = self.parse_expression(Precedence::Lowest)?;
        if !self.expect_peek_punctuator("]") {
            return None;
        }
        Some(Expr::Index(left.boxed(), index.boxed()))
    }

    fn parse_single_param_lambda(&mut self, left: Expr) -> Option<Expr> {
        let param = match left {
            Expr::Ident(name) => name,
            other => {
                self.add_error(format!("invalid lambda parameter '{}'", other));
                return None;
            }
        };
        self.next_token();
        let body = self.parse_expression(Precedence::Lowest)?;
        Some(Expr::Lambda(vec![param], body.boxed()))
    }
}
