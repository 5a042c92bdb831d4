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

//! Execution context
//!
//! Carried into every node's execute: the parameter record, the current
//! outer tuple (accumulating under joins), the per-execution memoization
//! map, and the ambient transaction slot shared by the whole execution.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::core::{Record, Tuple};
use crate::txn::Transaction;

use super::stream::Replay;

/// Per-execution shared state
#[derive(Clone)]
pub struct ExecCtx {
    /// Parameter record backing `$name` accesses
    pub params: Rc<Record>,
    /// The current outer tuple
    pub tuple: Tuple,
    /// Memoized subtrees, keyed by node identity
    pub memo: Rc<RefCell<FxHashMap<usize, Replay>>>,
    /// The ambient transaction, installed by the envelope
    pub txn: Rc<RefCell<Option<Transaction>>>,
}

impl ExecCtx {
    /// A fresh context for one query execution
    pub fn new(params: Record, txn: Option<Transaction>) -> Self {
        ExecCtx {
            params: Rc::new(params),
            tuple: Tuple::empty(),
            memo: Rc::new(RefCell::new(FxHashMap::default())),
            txn: Rc::new(RefCell::new(txn)),
        }
    }

    /// The same execution with a different outer tuple
    pub fn with_tuple(&self, tuple: Tuple) -> Self {
        let mut ctx = self.clone();
        ctx.tuple = tuple;
        ctx
    }

    /// The ambient transaction, if installed
    pub fn transaction(&self) -> Option<Transaction> {
        self.txn.borrow().clone()
    }

    /// Install the ambient transaction
    pub fn install_transaction(&self, txn: Transaction) {
        *self.txn.borrow_mut() = Some(txn);
    }
}
