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

//! Public query API
//!
//! The fluent builder and the execution surface.
//!
//! # Quick start
//!
//! ```
//! use quarry::{record, select};
//!
//! let things = vec![
//!     record! { "id" => 1, "name" => "Apple", "calories" => 95 },
//!     record! { "id" => 2, "name" => "Banana", "calories" => 105 },
//! ];
//!
//! let rows = select("{name: thing.name}")
//!     .from("thing", things)
//!     .where_(("thing.calories > ?", [100]))
//!     .collect(quarry::core::Record::new())
//!     .unwrap();
//! assert_eq!(rows.len(), 1);
//! ```

pub mod builder;
pub mod params;
pub mod query;

pub use builder::{
    delete_from, insert, select, thunk, update, upsert, IntoSource, IntoWriteTarget, QueryBuilder,
};
pub use query::{begin, store_source, Rows};
