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

//! In-memory collections
//!
//! A [`MemTable`] is an ordered collection of shared, mutable records.
//! Rows are `Arc<RwLock<Record>>` so a transaction overlay can shadow a
//! row by identity and commit the shadow back field by field.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::Record;

/// A shared, mutable row of an in-memory collection
pub type RowHandle = Arc<RwLock<Record>>;

/// Identity of a row, used to key transaction overlays
pub fn row_identity(row: &RowHandle) -> usize {
    Arc::as_ptr(row) as usize
}

/// An in-memory collection of records
#[derive(Clone, Default)]
pub struct MemTable {
    inner: Arc<RwLock<Vec<RowHandle>>>,
}

impl MemTable {
    /// An empty collection
    pub fn new() -> Self {
        MemTable::default()
    }

    /// Build a collection from records, preserving order
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let rows = records
            .into_iter()
            .map(|record| Arc::new(RwLock::new(record)))
            .collect();
        MemTable {
            inner: Arc::new(RwLock::new(rows)),
        }
    }

    /// Snapshot the row handles in collection order
    pub fn rows(&self) -> Vec<RowHandle> {
        self.inner.read().clone()
    }

    /// Append a record, returning its handle
    pub fn push(&self, record: Record) -> RowHandle {
        let row = Arc::new(RwLock::new(record));
        self.inner.write().push(row.clone());
        row
    }

    /// Append an existing row handle (commit of a staged insert)
    pub fn push_handle(&self, row: RowHandle) {
        self.inner.write().push(row);
    }

    /// Remove a row by identity
    pub fn remove(&self, row: &RowHandle) {
        self.inner.write().retain(|r| !Arc::ptr_eq(r, row));
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the collection is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Identity of the collection itself
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Whether two handles are the same collection
    pub fn same_as(&self, other: &MemTable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable").field("len", &self.len()).finish()
    }
}

impl FromIterator<Record> for MemTable {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        MemTable::from_records(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn test_rows_preserve_order() {
        let table = MemTable::from_records([record! { "id" => 1 }, record! { "id" => 2 }]);
        let ids: Vec<_> = table
            .rows()
            .iter()
            .map(|row| row.read().get_or_null("id"))
            .collect();
        assert_eq!(
            ids,
            vec![
                crate::core::Value::Number(1.0),
                crate::core::Value::Number(2.0)
            ]
        );
    }

    #[test]
    fn test_remove_by_identity() {
        let table = MemTable::from_records([record! { "id" => 1 }, record! { "id" => 1 }]);
        let rows = table.rows();
        table.remove(&rows[0]);
        assert_eq!(table.len(), 1, "only the identical row goes away");
    }
}
