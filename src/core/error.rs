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

//! Error types for Quarry
//!
//! One crate-wide error enum covering the four failure classes: build-time
//! (builder/compiler misuse), plan-time (finalization), recoverable runtime
//! (store-level), and fatal runtime (evaluation, settled transactions).

use thiserror::Error;

/// Result type alias for Quarry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Quarry
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // =========================================================================
    // Build-time errors (builder / expression compiler)
    // =========================================================================
    /// Expression source failed to parse
    #[error("parse error: {0}")]
    Parse(String),

    /// An identifier does not resolve to a source alias, parameter, or scope name
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    /// A `$$`-prefixed name outside the reserved set was used
    #[error("reserved name '{0}' may not be referenced")]
    ReservedName(String),

    /// The same alias was bound twice in one query
    #[error("duplicate alias '{0}'")]
    DuplicateAlias(String),

    /// An aggregate call appeared where aggregates are not allowed
    #[error("aggregate '{0}' is not allowed in this expression")]
    AggregateNotAllowed(String),

    /// A fluent builder method was misused (called twice, out of order, ...)
    #[error("builder misuse: {0}")]
    BuilderMisuse(String),

    /// The builder was modified after finalize()
    #[error("query was already finalized")]
    Finalized,

    // =========================================================================
    // Plan-time errors (finalization)
    // =========================================================================
    /// Terms survived predicate hoisting without finding an owner
    #[error("{0} predicate term(s) could not be assigned to any relation")]
    UnassignedTerms(usize),

    /// A query referenced more than one distinct persistent store
    #[error("query spans multiple stores: '{0}' and '{1}'")]
    MultipleStores(String, String),

    /// A set operation joined children with incompatible schemas
    #[error("set operation over incompatible schemas")]
    IncompatibleSchemas,

    // =========================================================================
    // Runtime errors, recoverable (store-level)
    // =========================================================================
    /// Insert of a key that already exists
    #[error("duplicate key {0}")]
    DuplicateKey(String),

    /// A named source does not exist in the store
    #[error("source '{0}' not found")]
    SourceNotFound(String),

    /// A named index does not exist on a source
    #[error("index '{0}' not found on source '{1}'")]
    IndexNotFound(String, String),

    /// A record was missing a key under the source's key path
    #[error("record has no key under path '{0}'")]
    MissingKey(String),

    /// Cursor-level or store-level failure
    #[error("store error: {0}")]
    Store(String),

    // =========================================================================
    // Runtime errors, fatal
    // =========================================================================
    /// Expression evaluation failed
    #[error("evaluation error: {0}")]
    Eval(String),

    /// A value of this type cannot serve as a key
    #[error("{0} values cannot be used as keys")]
    InvalidKey(&'static str),

    /// Execution was attempted on an already settled transaction
    #[error("transaction is already settled")]
    TransactionSettled,

    /// The transaction was aborted
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an evaluation error from anything displayable
    pub fn eval(msg: impl Into<String>) -> Self {
        Error::Eval(msg.into())
    }

    /// Build a builder-misuse error from anything displayable
    pub fn misuse(msg: impl Into<String>) -> Self {
        Error::BuilderMisuse(msg.into())
    }

    /// True for the recoverable runtime class of store errors
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DuplicateKey(_)
                | Error::SourceNotFound(_)
                | Error::IndexNotFound(_, _)
                | Error::MissingKey(_)
                | Error::Store(_)
        )
    }
}
