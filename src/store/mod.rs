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

//! Storage layer
//!
//! The abstract contract a persistent backing store must satisfy -
//! transactions over named sources, primary and secondary indexes, range
//! cursors - plus the two built-in source kinds: plain in-memory
//! collections ([`MemTable`]) and the ordered key/value store
//! ([`KvStore`]).

pub mod kv;
pub mod memory;

pub use kv::KvStore;
pub use memory::{MemTable, RowHandle};

use std::rc::Rc;

use crate::core::{Error, KeyPath, Record, Result, Value};
use crate::range::Interval;

/// Transaction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Read,
    ReadWrite,
}

/// A native key range handed to a cursor
pub type NativeRange = Interval;

/// A stream of records off a cursor
pub type RecordCursor = Box<dyn Iterator<Item = Result<Record>>>;

// ============================================================================
// Source specification
// ============================================================================

/// Where a source's primary key lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPathSpec {
    /// Keyless: the primary key rides on the record's explicit key field
    None,
    /// A single path into the record
    Single(KeyPath),
    /// An ordered list of paths forming a composite key
    Composite(Vec<KeyPath>),
}

impl KeyPathSpec {
    /// The component paths, in order
    pub fn paths(&self) -> &[KeyPath] {
        match self {
            KeyPathSpec::None => &[],
            KeyPathSpec::Single(path) => std::slice::from_ref(path),
            KeyPathSpec::Composite(paths) => paths,
        }
    }

    /// Whether the key has more than one component
    pub fn is_composite(&self) -> bool {
        matches!(self, KeyPathSpec::Composite(_))
    }

    /// Extract the key of a record, if fully present
    pub fn extract(&self, record: &Record) -> Option<Value> {
        match self {
            KeyPathSpec::None => record.primary_key().cloned(),
            KeyPathSpec::Single(path) => match record.extract(path) {
                Value::Null => None,
                value => Some(value),
            },
            KeyPathSpec::Composite(paths) => {
                let mut parts = Vec::with_capacity(paths.len());
                for path in paths {
                    match record.extract(path) {
                        Value::Null => return None,
                        value => parts.push(value),
                    }
                }
                Some(Value::sequence(parts))
            }
        }
    }
}

/// A secondary index declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    /// Component key paths; one entry for a simple index
    pub key_paths: Vec<KeyPath>,
    /// Reject two records with the same index key
    pub unique: bool,
    /// Index each element of a sequence-valued key separately
    pub multi_entry: bool,
}

impl IndexSpec {
    /// A simple single-path index
    pub fn simple(name: impl Into<String>, path: impl Into<KeyPath>) -> Self {
        IndexSpec {
            name: name.into(),
            key_paths: vec![path.into()],
            unique: false,
            multi_entry: false,
        }
    }

    /// A composite index over several paths
    pub fn composite(name: impl Into<String>, paths: impl IntoIterator<Item = KeyPath>) -> Self {
        IndexSpec {
            name: name.into(),
            key_paths: paths.into_iter().collect(),
            unique: false,
            multi_entry: false,
        }
    }

    /// Mark unique
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark multi-entry
    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

/// A named source declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub key_path: KeyPathSpec,
    pub auto_increment: bool,
    pub indexes: Vec<IndexSpec>,
}

impl SourceSpec {
    /// A source keyed by a single path
    pub fn keyed(name: impl Into<String>, path: impl Into<KeyPath>) -> Self {
        SourceSpec {
            name: name.into(),
            key_path: KeyPathSpec::Single(path.into()),
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    /// A source keyed by a composite path list
    pub fn composite_keyed(
        name: impl Into<String>,
        paths: impl IntoIterator<Item = KeyPath>,
    ) -> Self {
        SourceSpec {
            name: name.into(),
            key_path: KeyPathSpec::Composite(paths.into_iter().collect()),
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    /// A keyless source (primary key rides on the record)
    pub fn keyless(name: impl Into<String>) -> Self {
        SourceSpec {
            name: name.into(),
            key_path: KeyPathSpec::None,
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    /// Enable auto-increment key assignment
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Attach a secondary index
    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    /// Look up a secondary index
    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|ix| ix.name == name)
    }
}

// ============================================================================
// Store contract
// ============================================================================

/// A source exposed by an open transaction
pub trait StoreSource {
    /// The source's declaration
    fn spec(&self) -> &SourceSpec;

    /// Scan the primary tree, optionally restricted to a native range
    fn open_cursor(&self, range: Option<&NativeRange>) -> Result<RecordCursor>;

    /// Scan a secondary index in index-key order
    fn open_index_cursor(&self, index: &str, range: Option<&NativeRange>) -> Result<RecordCursor>;

    /// Insert or overwrite; returns the record as persisted (keys assigned)
    fn put(&self, record: Record, key: Option<Value>) -> Result<Record>;

    /// Insert, failing on an existing key
    fn add(&self, record: Record, key: Option<Value>) -> Result<Record>;

    /// Delete by primary key
    fn delete(&self, key: &Value) -> Result<()>;
}

/// An open store transaction over a set of named sources
pub trait StoreTransaction {
    /// Access one of the named sources
    fn source(&self, name: &str) -> Result<Rc<dyn StoreSource>>;

    /// Apply every staged write and settle
    fn commit(&self) -> Result<()>;

    /// Discard staged writes and settle
    fn abort(&self, cause: &Error);

    /// Whether the transaction has settled either way
    fn is_settled(&self) -> bool;

    /// Run once on successful completion
    fn on_complete(&self, hook: Box<dyn FnOnce()>);

    /// Run once on abort, with the cause
    fn on_abort(&self, hook: Box<dyn FnOnce(&Error)>);
}

/// A persistent store: named sources plus transactions over them
pub trait Store {
    /// The store's name
    fn name(&self) -> &str;

    /// A stable identity for the underlying store, shared by every handle
    fn identity(&self) -> usize;

    /// The names of every source in the store
    fn source_names(&self) -> Vec<String>;

    /// Open a transaction over the given sources
    fn transaction(&self, sources: &[String], mode: TxMode) -> Result<Rc<dyn StoreTransaction>>;
}

/// Shared handle to a store
pub type StoreHandle = Rc<dyn Store>;

/// Identity comparison for the single-store check
pub fn same_store(a: &StoreHandle, b: &StoreHandle) -> bool {
    a.identity() == b.identity()
}
