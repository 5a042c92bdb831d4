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

//! Ordered key/value store
//!
//! An in-process implementation of the store contract: named sources
//! with primary key paths (single, composite or keyless), auto-increment,
//! and secondary indexes (unique / multi-entry) kept in ordered trees.
//! Transactions stage writes per source and merge the staged overlay into
//! every cursor, so a transaction reads its own writes; commit applies
//! the overlay under the table locks, abort discards it.
//!
//! Index trees are keyed by the flattened entry key
//! `[index key components..., primary key]`, so an index scan is a plain
//! ordered range over entry keys; native ranges over index keys convert
//! to entry-key ranges by prefix extension and `next_up` stepping.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::core::{Error, Record, Result, Value};
use crate::range::Interval;

use super::{
    IndexSpec, KeyPathSpec, NativeRange, RecordCursor, SourceSpec, Store, StoreSource,
    StoreTransaction, TxMode,
};

// ============================================================================
// KvStore
// ============================================================================

/// An ordered key/value store with named sources
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<KvStoreInner>,
}

struct KvStoreInner {
    name: String,
    tables: RwLock<FxHashMap<String, Arc<KvTable>>>,
}

struct KvTable {
    spec: SourceSpec,
    rows: RwLock<BTreeMap<Value, Record>>,
    /// index name -> entry key -> primary key
    indexes: RwLock<FxHashMap<String, BTreeMap<Value, Value>>>,
}

impl KvStore {
    /// Create an empty store
    pub fn new(name: impl Into<String>) -> Self {
        KvStore {
            inner: Arc::new(KvStoreInner {
                name: name.into(),
                tables: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    /// Declare a source
    pub fn create_source(&self, spec: SourceSpec) -> Result<()> {
        let mut tables = self.inner.tables.write();
        if tables.contains_key(&spec.name) {
            return Err(Error::Store(format!(
                "source '{}' already exists",
                spec.name
            )));
        }
        let mut indexes = FxHashMap::default();
        for index in &spec.indexes {
            indexes.insert(index.name.clone(), BTreeMap::new());
        }
        tables.insert(
            spec.name.clone(),
            Arc::new(KvTable {
                spec,
                rows: RwLock::new(BTreeMap::new()),
                indexes: RwLock::new(indexes),
            }),
        );
        Ok(())
    }

    /// Insert records outside any transaction (initial seeding)
    pub fn seed(
        &self,
        source: &str,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<()> {
        let table = self.table(source)?;
        for record in records {
            let mut record = record;
            let key = resolve_key(&table, &mut record, None, |k| {
                table.rows.read().contains_key(k)
            })?;
            apply_write(&table, &key, Some(record));
        }
        Ok(())
    }

    /// Read every record of a source, in primary-key order
    pub fn snapshot(&self, source: &str) -> Result<Vec<Record>> {
        let table = self.table(source)?;
        let rows = table.rows.read();
        Ok(rows.values().cloned().collect())
    }

    fn table(&self, name: &str) -> Result<Arc<KvTable>> {
        self.inner
            .tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SourceNotFound(name.to_string()))
    }
}

impl Store for KvStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn transaction(&self, sources: &[String], mode: TxMode) -> Result<Rc<dyn StoreTransaction>> {
        let mut scope = Vec::with_capacity(sources.len());
        for name in sources {
            // Fail fast on unknown sources
            self.table(name)?;
            scope.push(name.clone());
        }
        Ok(Rc::new(KvTransaction {
            inner: Rc::new(KvTxnInner {
                store: self.inner.clone(),
                mode,
                scope,
                staged: RefCell::new(FxHashMap::default()),
                settled: Cell::new(false),
                completed: Cell::new(false),
                complete_hooks: RefCell::new(Vec::new()),
                abort_hooks: RefCell::new(Vec::new()),
            }),
        }))
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Per-source staged writes: key -> new record or deletion
type Staged = BTreeMap<Value, Option<Record>>;

struct KvTxnInner {
    store: Arc<KvStoreInner>,
    mode: TxMode,
    scope: Vec<String>,
    staged: RefCell<FxHashMap<String, Staged>>,
    settled: Cell<bool>,
    completed: Cell<bool>,
    complete_hooks: RefCell<Vec<Box<dyn FnOnce()>>>,
    abort_hooks: RefCell<Vec<Box<dyn FnOnce(&Error)>>>,
}

/// An open transaction handle
#[derive(Clone)]
pub struct KvTransaction {
    inner: Rc<KvTxnInner>,
}

impl StoreTransaction for KvTransaction {
    fn source(&self, name: &str) -> Result<Rc<dyn StoreSource>> {
        if !self.inner.scope.iter().any(|s| s == name) {
            return Err(Error::Store(format!(
                "source '{}' is outside the transaction scope",
                name
            )));
        }
        let table = self
            .inner
            .store
            .tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SourceNotFound(name.to_string()))?;
        Ok(Rc::new(KvTxnSource {
            txn: self.inner.clone(),
            table,
            name: name.to_string(),
        }))
    }

    fn commit(&self) -> Result<()> {
        if self.inner.settled.get() {
            return Ok(());
        }
        self.inner.settled.set(true);
        self.inner.completed.set(true);

        let staged = std::mem::take(&mut *self.inner.staged.borrow_mut());
        let tables = self.inner.store.tables.read();
        for (name, ops) in staged {
            let Some(table) = tables.get(&name) else {
                continue;
            };
            for (key, op) in ops {
                apply_write(table, &key, op);
            }
        }
        drop(tables);

        for hook in self.inner.complete_hooks.borrow_mut().drain(..) {
            hook();
        }
        Ok(())
    }

    fn abort(&self, cause: &Error) {
        if self.inner.settled.get() {
            return;
        }
        self.inner.settled.set(true);
        self.inner.staged.borrow_mut().clear();
        for hook in self.inner.abort_hooks.borrow_mut().drain(..) {
            hook(cause);
        }
    }

    fn is_settled(&self) -> bool {
        self.inner.settled.get()
    }

    fn on_complete(&self, hook: Box<dyn FnOnce()>) {
        if self.inner.settled.get() {
            if self.inner.completed.get() {
                hook();
            }
            return;
        }
        self.inner.complete_hooks.borrow_mut().push(hook);
    }

    fn on_abort(&self, hook: Box<dyn FnOnce(&Error)>) {
        self.inner.abort_hooks.borrow_mut().push(hook);
    }
}

// ============================================================================
// Source view within a transaction
// ============================================================================

struct KvTxnSource {
    txn: Rc<KvTxnInner>,
    table: Arc<KvTable>,
    name: String,
}

impl KvTxnSource {
    fn check_writable(&self) -> Result<()> {
        if self.txn.settled.get() {
            return Err(Error::TransactionSettled);
        }
        if self.txn.mode != TxMode::ReadWrite {
            return Err(Error::Store(format!(
                "source '{}' is open read-only",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether a primary key is present in the merged view
    fn merged_contains(&self, key: &Value) -> bool {
        let staged = self.txn.staged.borrow();
        if let Some(ops) = staged.get(&self.name) {
            if let Some(op) = ops.get(key) {
                return op.is_some();
            }
        }
        self.table.rows.read().contains_key(key)
    }

    /// Primary keys currently holding the given index key
    fn merged_index_holders(&self, index: &IndexSpec, ikey: &Value) -> Vec<Value> {
        let range = entry_range_for_exact(ikey);
        let mut holders = Vec::new();

        let staged = self.txn.staged.borrow();
        let ops = staged.get(&self.name);

        let indexes = self.table.indexes.read();
        if let Some(tree) = indexes.get(&index.name) {
            for (_, pk) in tree_range(tree, &range) {
                let overridden = ops.map(|o| o.contains_key(&pk)).unwrap_or(false);
                if !overridden {
                    holders.push(pk);
                }
            }
        }
        if let Some(ops) = ops {
            for (pk, op) in ops.iter() {
                if let Some(record) = op {
                    for entry in index_entry_keys(index, record, pk) {
                        if range.contains(&entry) {
                            holders.push(pk.clone());
                        }
                    }
                }
            }
        }
        holders
    }

    fn stage(&self, key: Value, op: Option<Record>) {
        let mut staged = self.txn.staged.borrow_mut();
        staged.entry(self.name.clone()).or_default().insert(key, op);
    }

    fn write(&self, mut record: Record, key: Option<Value>, overwrite: bool) -> Result<Record> {
        self.check_writable()?;

        let key = resolve_key(&self.table, &mut record, key, |k| self.merged_contains(k))?;

        if !overwrite && self.merged_contains(&key) {
            return Err(Error::DuplicateKey(key.to_string()));
        }

        for index in &self.table.spec.indexes {
            if !index.unique {
                continue;
            }
            if let Some(ikey) = index_key(index, &record) {
                let holders = self.merged_index_holders(index, &ikey);
                if holders.iter().any(|pk| *pk != key) {
                    return Err(Error::DuplicateKey(format!(
                        "{} on index '{}'",
                        ikey, index.name
                    )));
                }
            }
        }

        self.stage(key, Some(record.clone()));
        Ok(record)
    }
}

impl StoreSource for KvTxnSource {
    fn spec(&self) -> &SourceSpec {
        &self.table.spec
    }

    fn open_cursor(&self, range: Option<&NativeRange>) -> Result<RecordCursor> {
        let bounds = match range {
            Some(iv) => {
                if iv.is_empty() {
                    return Ok(Box::new(std::iter::empty()));
                }
                (iv.lower.clone(), iv.upper.clone())
            }
            None => (Bound::Unbounded, Bound::Unbounded),
        };

        // Base rows in range, then the staged overlay on top
        let mut merged: BTreeMap<Value, Record> = {
            let rows = self.table.rows.read();
            rows.range(bounds)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let staged = self.txn.staged.borrow();
        if let Some(ops) = staged.get(&self.name) {
            let interval = range.cloned().unwrap_or_else(Interval::all);
            for (key, op) in ops.iter() {
                if !interval.contains(key) {
                    continue;
                }
                match op {
                    Some(record) => {
                        merged.insert(key.clone(), record.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }

        let records: Vec<Result<Record>> = merged.into_values().map(Ok).collect();
        Ok(Box::new(records.into_iter()))
    }

    fn open_index_cursor(&self, index: &str, range: Option<&NativeRange>) -> Result<RecordCursor> {
        let Some(spec) = self.table.spec.index(index) else {
            return Err(Error::IndexNotFound(index.to_string(), self.name.clone()));
        };

        let entry_bounds = match range {
            Some(iv) => {
                if iv.is_empty() {
                    return Ok(Box::new(std::iter::empty()));
                }
                entry_range(iv)?
            }
            None => Interval::all(),
        };

        let staged = self.txn.staged.borrow();
        let ops = staged.get(&self.name);

        // Committed entries not overridden by the transaction
        let mut entries: Vec<(Value, Value)> = Vec::new();
        {
            let indexes = self.table.indexes.read();
            if let Some(tree) = indexes.get(index) {
                for (entry, pk) in tree_range(tree, &entry_bounds) {
                    let overridden = ops.map(|o| o.contains_key(&pk)).unwrap_or(false);
                    if !overridden {
                        entries.push((entry, pk));
                    }
                }
            }
        }
        // Entries contributed by staged writes
        if let Some(ops) = ops {
            for (pk, op) in ops.iter() {
                if let Some(record) = op {
                    for entry in index_entry_keys(spec, record, pk) {
                        if entry_bounds.contains(&entry) {
                            entries.push((entry, pk.clone()));
                        }
                    }
                }
            }
        }
        entries.sort_by(|(a, _), (b, _)| a.total_cmp(b));

        let mut records = Vec::with_capacity(entries.len());
        {
            let rows = self.table.rows.read();
            for (_, pk) in entries {
                let record = match ops.and_then(|o| o.get(&pk)) {
                    Some(Some(record)) => Some(record.clone()),
                    Some(None) => None,
                    None => rows.get(&pk).cloned(),
                };
                if let Some(record) = record {
                    records.push(Ok(record));
                }
            }
        }
        Ok(Box::new(records.into_iter()))
    }

    fn put(&self, record: Record, key: Option<Value>) -> Result<Record> {
        self.write(record, key, true)
    }

    fn add(&self, record: Record, key: Option<Value>) -> Result<Record> {
        self.write(record, key, false)
    }

    fn delete(&self, key: &Value) -> Result<()> {
        self.check_writable()?;
        self.stage(key.clone(), None);
        Ok(())
    }
}

// ============================================================================
// Key resolution and index maintenance
// ============================================================================

/// Resolve the primary key of an incoming record, assigning auto-increment
/// keys and writing the key back into the record
fn resolve_key(
    table: &KvTable,
    record: &mut Record,
    explicit: Option<Value>,
    exists: impl Fn(&Value) -> bool,
) -> Result<Value> {
    let spec = &table.spec;
    let key = match (&spec.key_path, explicit) {
        (KeyPathSpec::None, Some(key)) => {
            record.set_primary_key(key.clone());
            Some(key)
        }
        (KeyPathSpec::None, None) => record.primary_key().cloned(),
        (_, Some(_)) => {
            return Err(Error::Store(
                "explicit key forbidden for a source with an in-line key path".to_string(),
            ))
        }
        (path, None) => path.extract(record),
    };

    let key = match key {
        Some(key) => key,
        None if spec.auto_increment => {
            let next = next_auto_key(table, &exists);
            match &spec.key_path {
                KeyPathSpec::Single(path) => record.set_path(path, next.clone()),
                KeyPathSpec::None => record.set_primary_key(next.clone()),
                KeyPathSpec::Composite(_) => {
                    return Err(Error::Store(
                        "auto-increment is not supported on composite keys".to_string(),
                    ))
                }
            }
            next
        }
        None => {
            return Err(Error::MissingKey(key_path_display(&spec.key_path)));
        }
    };

    if !key.is_valid_key() {
        return Err(Error::InvalidKey(key.type_name()));
    }
    Ok(key)
}

fn key_path_display(spec: &KeyPathSpec) -> String {
    match spec {
        KeyPathSpec::None => "<primary key>".to_string(),
        KeyPathSpec::Single(path) => path.to_string(),
        KeyPathSpec::Composite(paths) => paths
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Smallest unused numeric key greater than every existing numeric key
fn next_auto_key(table: &KvTable, exists: &impl Fn(&Value) -> bool) -> Value {
    let rows = table.rows.read();
    let mut max = 0.0f64;
    for key in rows.keys() {
        if let Value::Number(n) = key {
            if *n > max {
                max = *n;
            }
        }
    }
    drop(rows);
    let mut candidate = (max + 1.0).floor();
    while exists(&Value::Number(candidate)) {
        candidate += 1.0;
    }
    Value::Number(candidate)
}

/// Apply one committed write under the table locks
fn apply_write(table: &KvTable, key: &Value, op: Option<Record>) {
    let mut rows = table.rows.write();
    let mut indexes = table.indexes.write();

    if let Some(old) = rows.remove(key) {
        for index in &table.spec.indexes {
            if let Some(tree) = indexes.get_mut(&index.name) {
                for entry in index_entry_keys(index, &old, key) {
                    tree.remove(&entry);
                }
            }
        }
    }
    if let Some(record) = op {
        for index in &table.spec.indexes {
            if let Some(tree) = indexes.get_mut(&index.name) {
                for entry in index_entry_keys(index, &record, key) {
                    tree.insert(entry, key.clone());
                }
            }
        }
        rows.insert(key.clone(), record);
    }
}

/// The index key of a record: scalar for a simple index, sequence for a
/// composite one; None when any component is absent
fn index_key(index: &IndexSpec, record: &Record) -> Option<Value> {
    if index.key_paths.len() == 1 {
        match record.extract(&index.key_paths[0]) {
            Value::Null => None,
            value => Some(value),
        }
    } else {
        let mut parts = Vec::with_capacity(index.key_paths.len());
        for path in &index.key_paths {
            match record.extract(path) {
                Value::Null => return None,
                value => parts.push(value),
            }
        }
        Some(Value::sequence(parts))
    }
}

/// Entry keys a record contributes to an index tree
fn index_entry_keys(index: &IndexSpec, record: &Record, pk: &Value) -> Vec<Value> {
    let Some(ikey) = index_key(index, record) else {
        return Vec::new();
    };
    if index.multi_entry && index.key_paths.len() == 1 {
        if let Value::Sequence(elements) = &ikey {
            return elements
                .iter()
                .map(|element| Value::sequence(vec![element.clone(), pk.clone()]))
                .collect();
        }
    }
    let mut components = flatten_key(&ikey, index.key_paths.len());
    components.push(pk.clone());
    vec![Value::sequence(components)]
}

/// Components of an index key: composite keys flatten, scalars wrap
fn flatten_key(ikey: &Value, arity: usize) -> Vec<Value> {
    match ikey {
        Value::Sequence(parts) if arity > 1 => parts.as_ref().clone(),
        other => vec![other.clone()],
    }
}

/// Convert a native range over index keys into a range over entry keys
fn entry_range(range: &NativeRange) -> Result<Interval> {
    let wrap = |v: &Value| -> Vec<Value> {
        match v {
            Value::Sequence(parts) => parts.as_ref().clone(),
            other => vec![other.clone()],
        }
    };
    let step_last = |mut parts: Vec<Value>| -> Result<Vec<Value>> {
        let last = parts
            .pop()
            .ok_or_else(|| Error::Internal("empty index key bound".to_string()))?;
        parts.push(last.next_up()?);
        Ok(parts)
    };

    let lower = match &range.lower {
        Bound::Unbounded => Bound::Unbounded,
        // The prefix itself sorts before every entry extending it
        Bound::Included(v) => Bound::Included(Value::sequence(wrap(v))),
        // Skip every entry with this exact prefix
        Bound::Excluded(v) => Bound::Included(Value::sequence(step_last(wrap(v))?)),
    };
    let upper = match &range.upper {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Excluded(v) => Bound::Excluded(Value::sequence(wrap(v))),
        // Cover every entry with this exact prefix, then stop
        Bound::Included(v) => Bound::Excluded(Value::sequence(step_last(wrap(v))?)),
    };
    Ok(Interval { lower, upper })
}

/// The entry-key range holding exactly one index key
fn entry_range_for_exact(ikey: &Value) -> Interval {
    let point = Interval::point(ikey.clone());
    entry_range(&point).unwrap_or_else(|_| Interval::point(ikey.clone()))
}

/// Ordered scan of an index tree, guarded against inverted bounds
fn tree_range(tree: &BTreeMap<Value, Value>, interval: &Interval) -> Vec<(Value, Value)> {
    if interval.is_empty() {
        return Vec::new();
    }
    tree.range((interval.lower.clone(), interval.upper.clone()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
