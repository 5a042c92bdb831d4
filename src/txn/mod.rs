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

//! Transaction model
//!
//! A [`Transaction`] is a settlement machine: unsettled until the first
//! `complete` or `abort`, then terminal; settlement is idempotent and the
//! at-most-once hooks fire on the transition. In-memory sources get a
//! copy-on-write overlay - reads fall through to the base row, writes
//! shadow it until commit writes them back field by field (a `None`
//! shadow entry deletes the field). A persistent-store transaction is
//! carried alongside: aborting forwards to the store, and the store's own
//! completion/abort events settle the wrapper.
//!
//! The two-tick auto-complete runs on [`ticks`], a thread-local deferred
//! task queue standing in for the host event loop: `delay_complete` arms
//! two successive deferrals, and the second completes the transaction
//! unless a later `delay_complete` re-armed the timer in between.

pub mod ticks;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;

use crate::core::{Error, Record, Result, Value};
use crate::store::memory::row_identity;
use crate::store::{MemTable, RowHandle, StoreTransaction};

/// Terminal state of a transaction
#[derive(Debug, Clone)]
pub enum Settlement {
    /// Completed with the last value of the work it carried
    Completed(Value),
    /// Aborted with its cause
    Aborted(Error),
}

/// Per-row copy-on-write shadow
struct Overlay {
    row: RowHandle,
    /// field -> new value, or None to delete the field
    shadow: BTreeMap<String, Option<Value>>,
}

struct TxInner {
    settlement: Option<Settlement>,
    complete_hooks: Vec<Box<dyn FnOnce(&Value)>>,
    abort_hooks: Vec<Box<dyn FnOnce(&Error)>>,
    overlays: FxHashMap<usize, Overlay>,
    additions: Vec<(MemTable, RowHandle)>,
    removals: Vec<(MemTable, RowHandle)>,
    store_txn: Option<Rc<dyn StoreTransaction>>,
    delay_generation: u64,
}

/// An ambient query transaction
#[derive(Clone)]
pub struct Transaction {
    inner: Rc<RefCell<TxInner>>,
}

impl Transaction {
    /// A fresh in-memory transaction
    pub fn new() -> Self {
        Transaction {
            inner: Rc::new(RefCell::new(TxInner {
                settlement: None,
                complete_hooks: Vec::new(),
                abort_hooks: Vec::new(),
                overlays: FxHashMap::default(),
                additions: Vec::new(),
                removals: Vec::new(),
                store_txn: None,
                delay_generation: 0,
            })),
        }
    }

    /// A transaction wrapping an open store transaction
    ///
    /// The store's native settlement events settle this wrapper too.
    pub fn for_store(store_txn: Rc<dyn StoreTransaction>) -> Self {
        let txn = Transaction::new();
        txn.inner.borrow_mut().store_txn = Some(store_txn.clone());

        let weak = Rc::downgrade(&txn.inner);
        store_txn.on_abort(Box::new(move |cause: &Error| {
            if let Some(txn) = Transaction::upgrade(&weak) {
                txn.abort(cause.clone());
            }
        }));
        let weak = Rc::downgrade(&txn.inner);
        store_txn.on_complete(Box::new(move || {
            if let Some(txn) = Transaction::upgrade(&weak) {
                let _ = txn.complete(Value::Null);
            }
        }));
        txn
    }

    fn upgrade(weak: &Weak<RefCell<TxInner>>) -> Option<Transaction> {
        weak.upgrade().map(|inner| Transaction { inner })
    }

    /// The carried store transaction, if any
    pub fn store_txn(&self) -> Option<Rc<dyn StoreTransaction>> {
        self.inner.borrow().store_txn.clone()
    }

    /// Whether the transaction reached a terminal state
    pub fn is_settled(&self) -> bool {
        self.inner.borrow().settlement.is_some()
    }

    /// The terminal state, once settled
    pub fn outcome(&self) -> Option<Settlement> {
        self.inner.borrow().settlement.clone()
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    /// Complete: write overlays back, commit the store transaction, fire
    /// completion hooks. Idempotent once settled.
    pub fn complete(&self, value: Value) -> Result<()> {
        if self.is_settled() {
            return Ok(());
        }

        // Settle before committing: the store's own completion event calls
        // back into this transaction and must find it settled already.
        let (store_txn, overlays, additions, removals, hooks) = {
            let mut inner = self.inner.borrow_mut();
            inner.settlement = Some(Settlement::Completed(value.clone()));
            (
                inner.store_txn.clone(),
                std::mem::take(&mut inner.overlays),
                std::mem::take(&mut inner.additions),
                std::mem::take(&mut inner.removals),
                std::mem::take(&mut inner.complete_hooks),
            )
        };

        if let Some(store_txn) = store_txn {
            if let Err(err) = store_txn.commit() {
                let abort_hooks = {
                    let mut inner = self.inner.borrow_mut();
                    inner.settlement = Some(Settlement::Aborted(err.clone()));
                    std::mem::take(&mut inner.abort_hooks)
                };
                store_txn.abort(&err);
                for hook in abort_hooks {
                    hook(&err);
                }
                return Err(err);
            }
        }

        for overlay in overlays.into_values() {
            let mut base = overlay.row.write();
            for (field, change) in overlay.shadow {
                match change {
                    Some(new_value) => base.set(field, new_value),
                    None => {
                        base.remove(&field);
                    }
                }
            }
        }
        for (table, row) in additions {
            table.push_handle(row);
        }
        for (table, row) in removals {
            table.remove(&row);
        }

        for hook in hooks {
            hook(&value);
        }
        Ok(())
    }

    /// Abort: discard the overlay, abort the store transaction, fire
    /// abort hooks. Idempotent once settled.
    pub fn abort(&self, cause: Error) {
        if self.is_settled() {
            return;
        }

        let (store_txn, hooks) = {
            let mut inner = self.inner.borrow_mut();
            inner.settlement = Some(Settlement::Aborted(cause.clone()));
            inner.overlays.clear();
            inner.additions.clear();
            inner.removals.clear();
            (
                inner.store_txn.clone(),
                std::mem::take(&mut inner.abort_hooks),
            )
        };

        if let Some(store_txn) = store_txn {
            store_txn.abort(&cause);
        }
        for hook in hooks {
            hook(&cause);
        }
    }

    /// Run once on completion; fires immediately if already completed
    pub fn on_complete(&self, hook: impl FnOnce(&Value) + 'static) {
        let settled = self.inner.borrow().settlement.clone();
        match settled {
            Some(Settlement::Completed(value)) => hook(&value),
            Some(Settlement::Aborted(_)) => {}
            None => self.inner.borrow_mut().complete_hooks.push(Box::new(hook)),
        }
    }

    /// Run once on abort; fires immediately if already aborted
    pub fn on_abort(&self, hook: impl FnOnce(&Error) + 'static) {
        let settled = self.inner.borrow().settlement.clone();
        match settled {
            Some(Settlement::Aborted(cause)) => hook(&cause),
            Some(Settlement::Completed(_)) => {}
            None => self.inner.borrow_mut().abort_hooks.push(Box::new(hook)),
        }
    }

    // =========================================================================
    // In-memory overlay
    // =========================================================================

    /// Read a row through the overlay
    pub fn view(&self, row: &RowHandle) -> Record {
        let base = row.read().clone();
        let inner = self.inner.borrow();
        match inner.overlays.get(&row_identity(row)) {
            None => base,
            Some(overlay) => {
                let mut merged = base;
                for (field, change) in &overlay.shadow {
                    match change {
                        Some(value) => merged.set(field.clone(), value.clone()),
                        None => {
                            merged.remove(field);
                        }
                    }
                }
                merged
            }
        }
    }

    /// Shadow a full-record replacement of an existing row
    pub fn stage_put(&self, row: &RowHandle, record: Record) {
        let mut shadow: BTreeMap<String, Option<Value>> = BTreeMap::new();
        {
            let base = row.read();
            for (field, _) in base.iter() {
                if !record.contains(field) {
                    shadow.insert(field.clone(), None);
                }
            }
        }
        for (field, value) in record.iter() {
            shadow.insert(field.clone(), Some(value.clone()));
        }
        let mut inner = self.inner.borrow_mut();
        let id = row_identity(row);
        match inner.overlays.get_mut(&id) {
            Some(overlay) => overlay.shadow.extend(shadow),
            None => {
                inner.overlays.insert(
                    id,
                    Overlay {
                        row: row.clone(),
                        shadow,
                    },
                );
            }
        }
    }

    /// Stage an insert into an in-memory collection
    pub fn stage_insert(&self, table: &MemTable, record: Record) -> RowHandle {
        let row: RowHandle = std::sync::Arc::new(parking_lot::RwLock::new(record));
        self.inner
            .borrow_mut()
            .additions
            .push((table.clone(), row.clone()));
        row
    }

    /// Stage removal of a row from an in-memory collection
    pub fn stage_remove(&self, table: &MemTable, row: &RowHandle) {
        self.inner
            .borrow_mut()
            .removals
            .push((table.clone(), row.clone()));
    }

    /// The rows of a collection as this transaction sees them: base rows
    /// minus staged removals, plus staged additions
    pub fn mem_rows(&self, table: &MemTable) -> Vec<RowHandle> {
        let inner = self.inner.borrow();
        let removed: Vec<usize> = inner
            .removals
            .iter()
            .filter(|(t, _)| t.same_as(table))
            .map(|(_, row)| row_identity(row))
            .collect();
        let mut rows: Vec<RowHandle> = table
            .rows()
            .into_iter()
            .filter(|row| !removed.contains(&row_identity(row)))
            .collect();
        for (t, row) in &inner.additions {
            if t.same_as(table) {
                rows.push(row.clone());
            }
        }
        rows
    }

    // =========================================================================
    // Auto-completion
    // =========================================================================

    /// Arm (or re-arm) the two-tick auto-complete
    ///
    /// Two successive deferred callbacks are queued; the second completes
    /// the transaction unless a later `delay_complete` re-armed the timer
    /// or the transaction settled in the meantime.
    pub fn delay_complete(&self) {
        let generation = {
            let mut inner = self.inner.borrow_mut();
            inner.delay_generation += 1;
            inner.delay_generation
        };
        let weak = Rc::downgrade(&self.inner);
        ticks::defer(move || {
            let weak = weak.clone();
            ticks::defer(move || {
                let Some(txn) = Transaction::upgrade(&weak) else {
                    return;
                };
                let armed = {
                    let inner = txn.inner.borrow();
                    inner.settlement.is_none() && inner.delay_generation == generation
                };
                if armed {
                    let _ = txn.complete(Value::Null);
                }
            });
        });
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn test_overlay_reads_fall_through_until_staged() {
        let table = MemTable::from_records([record! { "a" => 1, "b" => 2 }]);
        let row = &table.rows()[0];
        let txn = Transaction::new();

        assert_eq!(txn.view(row).get_or_null("a"), Value::Number(1.0));
        txn.stage_put(row, record! { "a" => 10 });
        // Write visible inside the transaction, field `b` deleted
        assert_eq!(txn.view(row).get_or_null("a"), Value::Number(10.0));
        assert_eq!(txn.view(row).get_or_null("b"), Value::Null);
        // Base row untouched until commit
        assert_eq!(row.read().get_or_null("a"), Value::Number(1.0));

        txn.complete(Value::Null).expect("complete");
        assert_eq!(row.read().get_or_null("a"), Value::Number(10.0));
        assert!(!row.read().contains("b"));
    }

    #[test]
    fn test_abort_discards_everything() {
        let table = MemTable::from_records([record! { "a" => 1 }]);
        let row = &table.rows()[0];
        let txn = Transaction::new();
        txn.stage_put(row, record! { "a" => 99 });
        txn.stage_insert(&table, record! { "a" => 2 });
        txn.abort(Error::Store("boom".to_string()));

        assert_eq!(row.read().get_or_null("a"), Value::Number(1.0));
        assert_eq!(table.len(), 1);
        assert!(matches!(txn.outcome(), Some(Settlement::Aborted(_))));
    }

    #[test]
    fn test_settlement_is_idempotent() {
        let txn = Transaction::new();
        txn.complete(Value::Number(1.0)).expect("complete");
        txn.abort(Error::Store("late".to_string()));
        assert!(matches!(txn.outcome(), Some(Settlement::Completed(_))));
    }

    #[test]
    fn test_hooks_fire_at_most_once() {
        let txn = Transaction::new();
        let fired = Rc::new(std::cell::Cell::new(0));
        let counter = fired.clone();
        txn.on_complete(move |_| counter.set(counter.get() + 1));
        txn.complete(Value::Null).expect("complete");
        txn.complete(Value::Null).expect("idempotent");
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_mem_rows_merges_additions_and_removals() {
        let table = MemTable::from_records([record! { "a" => 1 }, record! { "a" => 2 }]);
        let txn = Transaction::new();
        let rows = table.rows();
        txn.stage_remove(&table, &rows[0]);
        txn.stage_insert(&table, record! { "a" => 3 });

        let seen: Vec<Value> = txn
            .mem_rows(&table)
            .iter()
            .map(|row| txn.view(row).get_or_null("a"))
            .collect();
        assert_eq!(seen, vec![Value::Number(2.0), Value::Number(3.0)]);

        txn.complete(Value::Null).expect("complete");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_two_tick_auto_complete() {
        let txn = Transaction::new();
        txn.delay_complete();
        assert!(!txn.is_settled(), "still unsettled before any tick");
        ticks::pump();
        assert!(txn.is_settled(), "auto-completed after going idle");
    }

    #[test]
    fn test_delay_complete_rearms() {
        let txn = Transaction::new();
        txn.delay_complete();
        // One tick runs the first deferral only
        ticks::tick();
        assert!(!txn.is_settled());
        // Re-arm: the stale second deferral must not complete
        txn.delay_complete();
        ticks::tick();
        assert!(!txn.is_settled(), "stale timer was disarmed");
        ticks::pump();
        assert!(txn.is_settled());
    }
}
