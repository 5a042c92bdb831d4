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

//! Query results
//!
//! [`Rows`] is the lazy stream a query yields: each element is the output
//! row as a [`Value`] (a projected record, or the full named tuple as a
//! record of records). Dropping the stream cancels upstream cursors and
//! pumps the deferred-task queue so idle transactions auto-commit.

use std::rc::Rc;

use crate::core::{Result, Value};
use crate::exec::TupleStream;
use crate::store::{KvStore, Store, TxMode};
use crate::txn::{ticks, Transaction};

/// The lazy row stream of one query execution
pub struct Rows {
    stream: TupleStream,
    /// Whether this execution owns its transaction; an explicitly passed
    /// transaction is left open for the caller's next query
    pump_on_drop: bool,
}

impl Rows {
    pub(crate) fn new(stream: TupleStream, pump_on_drop: bool) -> Self {
        Rows {
            stream,
            pump_on_drop,
        }
    }

    /// Materialise every row, stopping at the first error
    pub fn collect(self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for row in self {
            out.push(row?);
        }
        Ok(out)
    }
}

impl Iterator for Rows {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Result<Value>> {
        self.stream.next().map(|item| item.map(|t| t.to_value()))
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        // Cancel upstream, then let armed auto-commits run
        self.stream = TupleStream::empty();
        if self.pump_on_drop {
            ticks::pump();
        }
    }
}

/// Open an explicit transaction over a store, for chaining several
/// queries atomically
pub fn begin(store: &KvStore, sources: &[&str], mode: TxMode) -> Result<Transaction> {
    let names: Vec<String> = sources.iter().map(|s| s.to_string()).collect();
    let store_txn = store.transaction(&names, mode)?;
    Ok(Transaction::for_store(store_txn))
}

/// Wrap a store handle for use as a query source
pub fn store_source(store: &KvStore, source: &str) -> crate::plan::Source {
    crate::plan::Source::Store {
        store: Rc::new(store.clone()),
        source: source.to_string(),
    }
}
