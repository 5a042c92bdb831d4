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

//! Executor
//!
//! Pull-based streaming execution of finalized plans: the tuple stream
//! combinators, the per-node interpreters, group state, and index
//! selection for persistent sources.

pub mod context;
pub mod executor;
pub mod group;
pub mod index_select;
pub mod stream;

pub use context::ExecCtx;
pub use executor::execute;
pub use index_select::{choose_scan, PreparedRanges, ScanPlan};
pub use stream::{Replay, TupleResult, TupleStream};
