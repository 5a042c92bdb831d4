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

//! Plan execution
//!
//! Walks a finalized tree and yields a lazy tuple stream. Named sources
//! scan their collection (through the chosen index for persistent
//! sources) and filter by their hoisted predicates; joins run as nested
//! loops with the right side re-executed per left tuple; order-by and
//! group-by materialise on first pull; writes materialise their input
//! fully before the first mutation. The transaction envelope installs the
//! ambient transaction and aborts it when an error crosses it.

use std::rc::Rc;

use ahash::AHashSet;

use crate::compile::{eval, eval_compiled, CompiledExpr, EvalCtx};
use crate::core::{otherwise_record, Error, Record, Result, Tuple, Value};
use crate::parser::Expr;
use crate::plan::{
    EnvelopeNode, JoinKind, PlanNode, SetOpKind, Source, SourceNode, WriteNode, WriteTarget,
};
use crate::store::memory::row_identity;
use crate::store::{MemTable, RowHandle, StoreSource};
use crate::txn::Transaction;

use super::context::ExecCtx;
use super::group::fold_groups;
use super::index_select::{choose_scan, PreparedRanges, ScanPlan};
use super::stream::{Replay, TupleStream};

/// Execute a plan node, yielding its tuple stream
pub fn execute(node: &Rc<PlanNode>, ctx: &ExecCtx) -> TupleStream {
    match node.as_ref() {
        PlanNode::Source(_) => execute_source(node.clone(), ctx.clone()),
        PlanNode::Join(_) => execute_join(node.clone(), ctx.clone()),
        PlanNode::Where(w) => {
            let stream = execute(&w.child, ctx);
            match &w.predicate {
                None => stream,
                Some(predicate) => {
                    let predicate = predicate.clone();
                    let ctx = ctx.clone();
                    stream.filter_ok(move |tuple| eval_predicate(&predicate, tuple, &ctx))
                }
            }
        }
        PlanNode::Select(s) => {
            let selector = s.selector.clone();
            let ctx2 = ctx.clone();
            execute(&s.child, ctx).try_map(move |tuple| {
                let merged = ctx2.tuple.merge(&tuple);
                let cx = EvalCtx::bare(&merged, &ctx2.params);
                Ok(Tuple::anon(eval_compiled(&selector, &cx)?))
            })
        }
        PlanNode::GroupBy(g) => {
            let node = node.clone();
            let ctx = ctx.clone();
            TupleStream::deferred(move || {
                let PlanNode::GroupBy(g) = node.as_ref() else {
                    unreachable!()
                };
                let tuples = match execute(&g.child, &ctx).collect_ok() {
                    Ok(tuples) => tuples,
                    Err(error) => return TupleStream::error(error),
                };
                match fold_groups(tuples, &g.grouper, &g.selector, &ctx) {
                    Ok(groups) => TupleStream::from_results(groups.into_iter().map(Ok).collect()),
                    Err(error) => TupleStream::error(error),
                }
            })
        }
        PlanNode::OrderBy(_) => execute_order_by(node.clone(), ctx.clone()),
        PlanNode::SetOp(s) => {
            let left = execute(&s.left, ctx);
            let right = execute(&s.right, ctx);
            match s.kind {
                SetOpKind::UnionAll => left.chain_stream(right),
                SetOpKind::Union => {
                    let mut seen: AHashSet<Value> = AHashSet::new();
                    left.chain_stream(right)
                        .filter_ok(move |tuple| Ok(seen.insert(tuple.to_value())))
                }
            }
        }
        PlanNode::CompositeUnion(c) => {
            execute(&c.left, ctx).chain_stream(execute(&c.right, ctx))
        }
        PlanNode::Write(_) => execute_write(node.clone(), ctx.clone()),
        PlanNode::Memoize(m) => {
            let key = Rc::as_ptr(node) as *const () as usize;
            let existing = ctx.memo.borrow().get(&key).cloned();
            match existing {
                Some(replay) => replay.stream(),
                None => {
                    let replay = Replay::new(execute(&m.child, ctx));
                    ctx.memo.borrow_mut().insert(key, replay.clone());
                    replay.stream()
                }
            }
        }
        PlanNode::Envelope(e) => execute_envelope(e, ctx),
    }
}

/// Evaluate one predicate against the outer tuple merged with a candidate
fn eval_predicate(predicate: &CompiledExpr, tuple: &Tuple, ctx: &ExecCtx) -> Result<bool> {
    let merged = ctx.tuple.merge(tuple);
    let cx = EvalCtx::bare(&merged, &ctx.params);
    Ok(eval_compiled(predicate, &cx)?.truthy())
}

fn all_predicates(predicates: &[CompiledExpr], tuple: &Tuple, ctx: &ExecCtx) -> Result<bool> {
    for predicate in predicates {
        if !eval_predicate(predicate, tuple, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

// ============================================================================
// Named sources
// ============================================================================

fn execute_source(node: Rc<PlanNode>, ctx: ExecCtx) -> TupleStream {
    TupleStream::deferred(move || {
        let PlanNode::Source(s) = node.as_ref() else {
            unreachable!()
        };
        let records = match source_records(s, &ctx) {
            Ok(records) => records,
            Err(error) => return TupleStream::error(error),
        };

        let name = s.name.clone();
        let predicates = s.predicates.clone();
        let outer = ctx.clone();
        TupleStream::new(records.into_iter().map(move |record| {
            record.map(|record| Tuple::empty().with(name.clone(), Value::record(record)))
        }))
        .filter_ok(move |tuple| all_predicates(&predicates, tuple, &outer))
    })
}

fn source_records(s: &SourceNode, ctx: &ExecCtx) -> Result<Vec<Result<Record>>> {
    match &s.source {
        Source::Rows(table) => Ok(mem_records(table, ctx)),
        Source::Unit => Ok(vec![Ok(Record::new())]),
        Source::Thunk(f) => Ok(f()?.into_iter().map(Ok).collect()),
        Source::Query(plan) => {
            let sub = ctx.with_tuple(Tuple::empty());
            let mut out = Vec::new();
            for item in execute(plan, &sub) {
                out.push(item.and_then(|tuple| tuple_record(&tuple)));
            }
            Ok(out)
        }
        Source::Store { source, .. } => store_records(s, source, ctx),
    }
}

/// Scan an in-memory collection through the ambient transaction overlay
fn mem_records(table: &MemTable, ctx: &ExecCtx) -> Vec<Result<Record>> {
    let txn = ctx.transaction();
    let rows = match &txn {
        Some(txn) => txn.mem_rows(table),
        None => table.rows(),
    };
    rows.into_iter()
        .map(|row| {
            let mut record = match &txn {
                Some(txn) => txn.view(&row),
                None => row.read().clone(),
            };
            // Row identity rides the primary-key slot so a later write
            // can find its way back to this row
            record.set_primary_key(Value::Number(row_identity(&row) as f64));
            Ok(record)
        })
        .collect()
}

/// Scan a persistent source through the best index for its key ranges
fn store_records(s: &SourceNode, source_name: &str, ctx: &ExecCtx) -> Result<Vec<Result<Record>>> {
    let txn = ctx.transaction().ok_or_else(|| {
        Error::Internal("persistent source outside a transaction envelope".to_string())
    })?;
    let store_txn = txn.store_txn().ok_or_else(|| {
        Error::Store("ambient transaction does not cover the store".to_string())
    })?;
    let src = store_txn.source(source_name)?;

    let mut prepared = PreparedRanges::default();
    {
        let bound_eval = |expr: &Expr| -> Result<Value> {
            let cx = EvalCtx {
                tuple: &ctx.tuple,
                params: &ctx.params,
                subs: &s.range_subs,
                state: None,
                bound: None,
            };
            eval(expr, &cx)
        };
        for (path, range) in &s.key_ranges {
            prepared.insert(path.clone(), range.prepare(&bound_eval)?);
        }
    }

    let mut out = Vec::new();
    match choose_scan(src.spec(), &prepared)? {
        ScanPlan::Empty => {}
        ScanPlan::Full => out.extend(src.open_cursor(None)?),
        ScanPlan::Primary(scans) => {
            for scan in &scans {
                out.extend(src.open_cursor(Some(scan))?);
            }
        }
        ScanPlan::Index(index, scans) => {
            for scan in &scans {
                out.extend(src.open_index_cursor(&index, Some(scan))?);
            }
        }
    }
    Ok(out)
}

// ============================================================================
// Joins
// ============================================================================

fn execute_join(node: Rc<PlanNode>, ctx: ExecCtx) -> TupleStream {
    let PlanNode::Join(j) = node.as_ref() else {
        unreachable!()
    };
    let kind = j.kind;
    let right_node = j.right.clone();
    let predicates = j.predicates.clone();
    let right_names: Vec<String> = j
        .right
        .schema()
        .map(|schema| schema.names().cloned().collect())
        .unwrap_or_default();

    let left = execute(&j.left, &ctx);
    left.flat_map_ok(move |lt| {
        let rctx = ctx.with_tuple(ctx.tuple.merge(&lt));
        let combine_lt = lt.clone();
        let filter_ctx = ctx.clone();
        let filter_predicates = predicates.clone();
        let matched = execute(&right_node, &rctx)
            .map_ok(move |rt| combine_lt.merge(&rt))
            .filter_ok(move |tuple| all_predicates(&filter_predicates, tuple, &filter_ctx));

        match kind {
            JoinKind::Inner => matched,
            JoinKind::Outer => matched.default_if_empty(with_otherwise(&lt, &right_names)),
            JoinKind::Anti => {
                let otherwise = with_otherwise(&lt, &right_names);
                TupleStream::deferred(move || {
                    let mut matched = matched;
                    match matched.next() {
                        None => TupleStream::once(otherwise),
                        Some(Ok(_)) => TupleStream::empty(),
                        Some(Err(error)) => TupleStream::error(error),
                    }
                })
            }
        }
    })
}

/// The left tuple extended with the sentinel record per right source name
fn with_otherwise(lt: &Tuple, right_names: &[String]) -> Tuple {
    let mut out = lt.clone();
    for name in right_names {
        out = out.with(name.clone(), otherwise_record());
    }
    out
}

// ============================================================================
// Ordering
// ============================================================================

fn execute_order_by(node: Rc<PlanNode>, ctx: ExecCtx) -> TupleStream {
    TupleStream::deferred(move || {
        let PlanNode::OrderBy(o) = node.as_ref() else {
            unreachable!()
        };
        let tuples = match execute(&o.child, &ctx).collect_ok() {
            Ok(tuples) => tuples,
            Err(error) => return TupleStream::error(error),
        };

        // Evaluate every sort key up front so comparator calls stay pure
        let mut keyed: Vec<(Vec<Value>, Tuple)> = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let merged = ctx.tuple.merge(&tuple);
            let cx = EvalCtx::bare(&merged, &ctx.params);
            let mut keys = Vec::with_capacity(o.ordering.len());
            for entry in &o.ordering {
                match eval_compiled(&entry.expr, &cx) {
                    Ok(key) => keys.push(key),
                    Err(error) => return TupleStream::error(error),
                }
            }
            keyed.push((keys, tuple));
        }

        keyed.sort_by(|(a, _), (b, _)| {
            for (index, entry) in o.ordering.iter().enumerate() {
                let (ka, kb) = (&a[index], &b[index]);
                match (ka.is_null(), kb.is_null()) {
                    (true, true) => continue,
                    // +1 places nulls later, -1 earlier
                    (true, false) => {
                        return if entry.nulls > 0 {
                            std::cmp::Ordering::Greater
                        } else {
                            std::cmp::Ordering::Less
                        }
                    }
                    (false, true) => {
                        return if entry.nulls > 0 {
                            std::cmp::Ordering::Less
                        } else {
                            std::cmp::Ordering::Greater
                        }
                    }
                    (false, false) => {
                        let ord = ka.total_cmp(kb);
                        if ord != std::cmp::Ordering::Equal {
                            return if entry.direction < 0 { ord.reverse() } else { ord };
                        }
                    }
                }
            }
            std::cmp::Ordering::Equal
        });

        TupleStream::from_results(keyed.into_iter().map(|(_, tuple)| Ok(tuple)).collect())
    })
}

// ============================================================================
// Writes
// ============================================================================

fn execute_write(node: Rc<PlanNode>, ctx: ExecCtx) -> TupleStream {
    TupleStream::deferred(move || {
        let PlanNode::Write(w) = node.as_ref() else {
            unreachable!()
        };
        // Materialise fully before the first mutation so this query never
        // reads back its own writes
        let tuples = match execute(&w.child, &ctx).collect_ok() {
            Ok(tuples) => tuples,
            Err(error) => return TupleStream::error(error),
        };
        match apply_writes(w, tuples, &ctx) {
            Ok(written) => TupleStream::from_results(written.into_iter().map(Ok).collect()),
            Err(error) => TupleStream::error(error),
        }
    })
}

fn apply_writes(w: &WriteNode, tuples: Vec<Tuple>, ctx: &ExecCtx) -> Result<Vec<Tuple>> {
    let mut out = Vec::with_capacity(tuples.len());
    match &w.target {
        WriteTarget::Store { source, .. } => {
            let txn = ctx.transaction().ok_or_else(|| {
                Error::Internal("write outside a transaction envelope".to_string())
            })?;
            let store_txn = txn.store_txn().ok_or_else(|| {
                Error::Store("ambient transaction does not cover the store".to_string())
            })?;
            let src = store_txn.source(source)?;
            for tuple in tuples {
                let record = tuple_record(&tuple)?;
                let persisted = store_write_one(&*src, record, w)?;
                out.push(Tuple::anon(Value::record(persisted)));
            }
        }
        WriteTarget::Mem(table) => {
            let txn = ctx.transaction();
            for tuple in tuples {
                let record = tuple_record(&tuple)?;
                let written = mem_write_one(table, record, w, txn.as_ref())?;
                out.push(Tuple::anon(Value::record(written)));
            }
        }
    }
    Ok(out)
}

fn store_write_one(src: &dyn StoreSource, record: Record, w: &WriteNode) -> Result<Record> {
    if w.options.delete {
        let key = src.spec().key_path.extract(&record).ok_or_else(|| {
            Error::MissingKey(format!("{:?}", src.spec().key_path))
        })?;
        src.delete(&key)?;
        Ok(record)
    } else if w.options.overwrite {
        src.put(record, None)
    } else {
        src.add(record, None)
    }
}

fn mem_write_one(
    table: &MemTable,
    mut record: Record,
    w: &WriteNode,
    txn: Option<&Transaction>,
) -> Result<Record> {
    let existing = find_mem_row(table, &record, txn);
    if w.options.delete {
        if let Some(row) = existing {
            match txn {
                Some(txn) => txn.stage_remove(table, &row),
                None => table.remove(&row),
            }
        }
        return Ok(record);
    }
    match existing {
        Some(row) if w.options.overwrite => {
            record.clear_primary_key();
            match txn {
                Some(txn) => txn.stage_put(&row, record.clone()),
                None => *row.write() = record.clone(),
            }
        }
        _ => {
            record.clear_primary_key();
            match txn {
                Some(txn) => {
                    txn.stage_insert(table, record.clone());
                }
                None => {
                    table.push(record.clone());
                }
            }
        }
    }
    Ok(record)
}

/// Find the in-memory row a record came from, by row identity when the
/// record carries one, else by structural match
fn find_mem_row(table: &MemTable, record: &Record, txn: Option<&Transaction>) -> Option<RowHandle> {
    let rows = match txn {
        Some(txn) => txn.mem_rows(table),
        None => table.rows(),
    };
    if let Some(identity) = record.primary_key().and_then(Value::as_number) {
        return rows
            .into_iter()
            .find(|row| row_identity(row) as f64 == identity);
    }
    rows.into_iter().find(|row| {
        let current = match txn {
            Some(txn) => txn.view(row),
            None => row.read().clone(),
        };
        current == *record
    })
}

/// The record a tuple carries into a write
fn tuple_record(tuple: &Tuple) -> Result<Record> {
    match tuple.to_value() {
        Value::Record(record) => Ok(record.as_ref().clone()),
        other => Err(Error::eval(format!(
            "a {} cannot be written to a source",
            other.type_name()
        ))),
    }
}

// ============================================================================
// Transaction envelope
// ============================================================================

fn execute_envelope(e: &EnvelopeNode, ctx: &ExecCtx) -> TupleStream {
    let txn = match ctx.transaction() {
        Some(txn) => {
            if txn.is_settled() {
                return TupleStream::error(Error::TransactionSettled);
            }
            txn
        }
        None => {
            let txn = match &e.store {
                Some(store) => match store.transaction(&e.source_names, e.mode) {
                    Ok(store_txn) => Transaction::for_store(store_txn),
                    Err(error) => return TupleStream::error(error),
                },
                None => Transaction::new(),
            };
            ctx.install_transaction(txn.clone());
            txn
        }
    };

    // Hold the transaction open while chained executions queue up; it
    // commits on its own two idle ticks after the last one
    txn.delay_complete();

    let abort_txn = txn.clone();
    TupleStream::new(execute(&e.child, ctx).map(move |item| {
        if let Err(error) = &item {
            abort_txn.abort(error.clone());
        }
        item
    }))
}
