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

//! Expression parser
//!
//! The expression host of the engine: a lexer and Pratt parser for the
//! small, safe expression sub-language query templates are written in.

pub mod ast;
pub mod error;
pub mod expressions;
pub mod lexer;
pub mod precedence;
pub mod token;

pub use ast::{AggregateKind, BinaryOp, CompareOp, Expr, RecordEntry, UnaryOp};
pub use error::ParseError;
pub use expressions::Parser;
pub use lexer::Lexer;
pub use precedence::Precedence;
pub use token::{Position, Token, TokenType};

use crate::core::{Error, Result};

/// Parse a stitched template into an expression
pub fn parse(source: &str) -> Result<Expr> {
    Parser::new(source).parse().map_err(|errors| {
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Error::Parse(joined)
    })
}
