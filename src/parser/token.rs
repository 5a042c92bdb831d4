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

//! Token types for the expression lexer
//!
//! This module defines the token types used by the expression lexer and
//! parser. Identifiers keep their `$`/`$$` prefixes; substitution holes
//! (`?`) are their own token type.

use std::fmt;

/// Position represents a position in the input source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    /// Byte offset, starting at 0
    pub offset: usize,
    /// Line number, starting at 1
    pub line: usize,
    /// Column number, starting at 1
    pub column: usize,
}

impl Position {
    /// Create a new position
    pub fn new(offset: usize, line: usize, column: usize) -> Self {
        Self {
            offset,
            line,
            column,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// TokenType represents the type of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    /// Error token
    Error,
    /// End of file
    Eof,
    /// Identifier, including `$param` and `$$reserved` names
    Identifier,
    /// Keyword (null, true, false, this)
    Keyword,
    /// String literal ('hello' or "hello")
    String,
    /// Number literal (123, 1.5, 2e10)
    Number,
    /// Operator (==, ===, &&, +, =>, etc.)
    Operator,
    /// Punctuator (comma, colon, parentheses, braces, dot, spread)
    Punctuator,
    /// Substitution hole (?)
    Hole,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Error => write!(f, "ERROR"),
            TokenType::Eof => write!(f, "EOF"),
            TokenType::Identifier => write!(f, "IDENTIFIER"),
            TokenType::Keyword => write!(f, "KEYWORD"),
            TokenType::String => write!(f, "STRING"),
            TokenType::Number => write!(f, "NUMBER"),
            TokenType::Operator => write!(f, "OPERATOR"),
            TokenType::Punctuator => write!(f, "PUNCTUATOR"),
            TokenType::Hole => write!(f, "HOLE"),
        }
    }
}

/// The expression-language keywords
pub fn is_keyword(word: &str) -> bool {
    matches!(word, "null" | "true" | "false" | "this")
}

/// Characters that may start an operator
pub fn is_operator_char(ch: char) -> bool {
    matches!(
        ch,
        '!' | '=' | '<' | '>' | '&' | '|' | '+' | '-' | '*' | '/' | '%'
    )
}

/// The multi- and single-character operators, longest first
pub const OPERATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "++", "=>", "<", ">", "+", "-", "*", "/",
    "%", "!",
];

/// Token represents a lexical token
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The type of the token
    pub token_type: TokenType,
    /// The literal string value
    pub literal: String,
    /// The position in the source
    pub position: Position,
    /// Error message (if token_type is Error)
    pub error: Option<String>,
}

impl Token {
    /// Create a new token
    pub fn new(token_type: TokenType, literal: impl Into<String>, position: Position) -> Self {
        Self {
            token_type,
            literal: literal.into(),
            position,
            error: None,
        }
    }

    /// Create an EOF token
    pub fn eof(position: Position) -> Self {
        Self::new(TokenType::Eof, "", position)
    }

    /// Create an error token
    pub fn error(message: impl Into<String>, position: Position) -> Self {
        let message = message.into();
        Self {
            token_type: TokenType::Error,
            literal: String::new(),
            position,
            error: Some(message),
        }
    }

    /// Whether this token is a specific punctuator
    pub fn is_punctuator(&self, literal: &str) -> bool {
        self.token_type == TokenType::Punctuator && self.literal == literal
    }

    /// Whether this token is a specific operator
    pub fn is_operator(&self, literal: &str) -> bool {
        self.token_type == TokenType::Operator && self.literal == literal
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.token_type {
            TokenType::Eof => write!(f, "end of input"),
            _ => write!(f, "'{}'", self.literal),
        }
    }
}
