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

//! # Quarry - embedded relational query engine
//!
//! Quarry executes fluent-builder queries against a mixture of in-memory
//! collections and an ordered key/value store with primary and secondary
//! indexes and range cursors. Predicates and projections are written as
//! small expression templates with positional `?` substitutions; the
//! compiler normalizes them, decomposes predicates into terms by
//! dependency set, and extracts key-range constraints. A rule-based
//! finalization pass hoists every predicate to the deepest relation that
//! satisfies it, attaches key ranges to sources for index selection,
//! fuses orderings, and wraps the plan in a transaction envelope. The
//! executor interprets the plan as a lazy, pull-based tuple stream.
//!
//! ## Quick start
//!
//! ```
//! use quarry::{params, record, select};
//!
//! let things = vec![
//!     record! { "id" => 1, "name" => "Apple", "calories" => 95, "type_id" => 1 },
//!     record! { "id" => 2, "name" => "Banana", "calories" => 105, "type_id" => 1 },
//!     record! { "id" => 3, "name" => "Cake", "calories" => 235, "type_id" => 2 },
//! ];
//! let types = vec![
//!     record! { "id" => 1, "name" => "Vegetable" },
//!     record! { "id" => 2, "name" => "Mineral" },
//! ];
//!
//! let rows = select("{name: thing.name, type_name: type.name}")
//!     .from("thing", things)
//!     .from("type", types)
//!     .where_("thing.type_id === type.id")
//!     .where_(("thing.calories > ?", [100]))
//!     .collect(params! {})
//!     .unwrap();
//! assert_eq!(rows.len(), 2);
//! ```
//!
//! ## Modules
//!
//! - [`api`] - the fluent builder and query execution surface
//! - [`core`] - values, records, tuples, errors
//! - [`parser`] - the expression sub-language
//! - [`compile`] - expression compilation, terms, range extraction
//! - [`range`] - the range algebra
//! - [`plan`] - the relational tree and finalization
//! - [`exec`] - streaming execution and index selection
//! - [`store`] - in-memory collections and the ordered key/value store
//! - [`txn`] - the transaction model

pub mod api;
pub mod compile;
pub mod core;
pub mod exec;
pub mod parser;
pub mod plan;
pub mod range;
pub mod store;
pub mod txn;

pub use api::{begin, delete_from, insert, select, store_source, update, upsert, QueryBuilder, Rows};
pub use core::{Error, KeyPath, Record, Result, Tuple, Value};
pub use compile::Template;
pub use store::{IndexSpec, KvStore, MemTable, SourceSpec, TxMode};
pub use txn::Transaction;
