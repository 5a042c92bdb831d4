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

//! Finalization
//!
//! Two rewrite passes over the relational tree.
//!
//! `hoist_predicates` carries a single accumulator of available terms
//! down the tree: Where nodes over schema-bearing children dissolve into
//! it, and every term lands on the deepest node whose available schema
//! (the node's own sources plus the left siblings of enclosing joins)
//! satisfies its dependency set - a named source for index-friendly
//! placement, or an outer/anti join for right-side-dependent terms that
//! must not sink further. Consecutive orderings fuse, outermost first.
//! Terms still unassigned at the root fail the plan.
//!
//! `prepare_transaction` finds the single persistent store the tree may
//! touch (two is an error), notes whether any write is present, and wraps
//! the tree in a transaction envelope when one is needed.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::compile::{CompiledExpr, Schema, Term, TermGroups};
use crate::core::{Error, Result, Value};
use crate::store::{same_store, StoreHandle, TxMode};

use super::node::{
    EnvelopeNode, JoinKind, JoinNode, OrderByNode, PlanNode, Source, SourceNode, WhereNode,
    WriteTarget,
};

/// Run both finalization passes
pub fn finalize(root: Rc<PlanNode>) -> Result<Rc<PlanNode>> {
    let mut available = TermGroups::new();
    let hoisted = hoist(root, &mut available, &Schema::new())?;
    if !available.is_empty() {
        return Err(Error::UnassignedTerms(available.len()));
    }
    prepare_transaction(hoisted)
}

// ============================================================================
// Sub-pass 1: predicate hoisting
// ============================================================================

fn hoist(node: Rc<PlanNode>, available: &mut TermGroups, outer: &Schema) -> Result<Rc<PlanNode>> {
    match node.as_ref() {
        PlanNode::Where(w) => {
            if w.child.schema().is_some() {
                // The Where dissolves; its terms travel down with us
                available.merge(w.term_groups.clone());
                hoist(w.child.clone(), available, outer)
            } else {
                // The child hides its schema; keep the Where with the
                // merged conjunction as one predicate
                let predicate = compiled_conjunction(&w.term_groups);
                let child = hoist(w.child.clone(), available, outer)?;
                Ok(Rc::new(PlanNode::Where(WhereNode {
                    child,
                    term_groups: TermGroups::new(),
                    predicate,
                })))
            }
        }

        PlanNode::Source(s) => {
            let mut satisfied = outer.clone();
            satisfied.insert(s.name.clone(), s.id);

            let taken = available.take_terms(|term| {
                term.satisfied_by(|id| satisfied.has_id(id))
            });
            if taken.is_empty() {
                return Ok(node);
            }

            let mut out = s.clone();
            out.range_subs = Rc::new(available.subs.clone());
            for term in taken {
                attach_term(&mut out, term, &available.subs);
            }
            Ok(Rc::new(PlanNode::Source(out)))
        }

        PlanNode::Join(j) => {
            let mut predicates = j.predicates.clone();

            if j.kind != JoinKind::Inner {
                // Terms that touch the right relation and carry no key
                // range cannot survive outer/anti semantics further down
                let right_schema = j.right.schema().unwrap_or_default();
                let captured = available.take_terms(|term| {
                    !term.has_ranges()
                        && term.deps.values().any(|&id| right_schema.has_id(id))
                });
                for term in captured {
                    predicates.push(compiled_from_term(&term, &available.subs));
                }
            }

            available.merge(j.term_groups.clone());

            let left = hoist(j.left.clone(), available, outer)?;
            let mut right_outer = outer.clone();
            if let Some(left_schema) = left.schema() {
                right_outer = right_outer.union(&left_schema);
            }
            let right = hoist(j.right.clone(), available, &right_outer)?;

            Ok(Rc::new(PlanNode::Join(JoinNode {
                kind: j.kind,
                left,
                right,
                term_groups: TermGroups::new(),
                predicates,
            })))
        }

        PlanNode::OrderBy(o) => {
            if let PlanNode::OrderBy(inner) = o.child.as_ref() {
                // Consecutive orderings fuse; the outermost ordering has
                // the highest priority
                let mut ordering = o.ordering.clone();
                ordering.extend(inner.ordering.iter().cloned());
                let fused = Rc::new(PlanNode::OrderBy(OrderByNode {
                    child: inner.child.clone(),
                    ordering,
                }));
                return hoist(fused, available, outer);
            }
            let child = hoist(o.child.clone(), available, outer)?;
            Ok(Rc::new(PlanNode::OrderBy(OrderByNode {
                child,
                ordering: o.ordering.clone(),
            })))
        }

        PlanNode::GroupBy(g) => {
            let child = hoist(g.child.clone(), available, outer)?;
            let mut out = g.clone();
            out.child = child;
            Ok(Rc::new(PlanNode::GroupBy(out)))
        }

        PlanNode::Select(s) => {
            let child = hoist(s.child.clone(), available, outer)?;
            let mut out = s.clone();
            out.child = child;
            Ok(Rc::new(PlanNode::Select(out)))
        }

        PlanNode::SetOp(s) => {
            // Plan-time compatibility check: both legs must expose the
            // same source names (or both be anonymous)
            let left_names: Option<Vec<String>> =
                s.left.schema().map(|sc| sc.names().cloned().collect());
            let right_names: Option<Vec<String>> =
                s.right.schema().map(|sc| sc.names().cloned().collect());
            if left_names != right_names {
                return Err(Error::IncompatibleSchemas);
            }
            let left = hoist(s.left.clone(), available, outer)?;
            let right = hoist(s.right.clone(), available, outer)?;
            Ok(Rc::new(PlanNode::SetOp(super::node::SetOpNode {
                kind: s.kind,
                left,
                right,
            })))
        }

        PlanNode::CompositeUnion(c) => {
            let left = hoist(c.left.clone(), available, outer)?;
            let right = hoist(c.right.clone(), available, outer)?;
            Ok(Rc::new(PlanNode::CompositeUnion(
                super::node::CompositeUnionNode { left, right },
            )))
        }

        PlanNode::Write(w) => {
            let child = hoist(w.child.clone(), available, outer)?;
            let mut out = w.clone();
            out.child = child;
            Ok(Rc::new(PlanNode::Write(out)))
        }

        PlanNode::Memoize(m) => {
            let child = hoist(m.child.clone(), available, outer)?;
            Ok(Rc::new(PlanNode::Memoize(super::node::MemoizeNode {
                child,
            })))
        }

        PlanNode::Envelope(_) => Err(Error::Internal(
            "transaction envelope present before finalization".to_string(),
        )),
    }
}

/// Attach one satisfied term to a named source: its expression joins the
/// predicate list, and its key ranges against this source intersect with
/// any already present
fn attach_term(source: &mut SourceNode, mut term: Term, subs: &[Value]) {
    if let Some(paths) = term.ranges.remove(&source.id) {
        for (path, range) in paths {
            match source.key_ranges.remove(&path) {
                Some(existing) => {
                    source.key_ranges.insert(path, existing.intersection(range));
                }
                None => {
                    source.key_ranges.insert(path, range);
                }
            }
        }
    }
    source.predicates.push(compiled_from_term(&term, subs));
}

fn compiled_from_term(term: &Term, subs: &[Value]) -> CompiledExpr {
    CompiledExpr {
        expr: Rc::new(term.expr.clone()),
        deps: term.deps.clone(),
        agg_slots: 0,
        subs: Rc::new(subs.to_vec()),
        bound: Rc::new(BTreeMap::new()),
    }
}

fn compiled_conjunction(groups: &TermGroups) -> Option<CompiledExpr> {
    let expr = groups.merged_conjunction()?;
    let mut deps = BTreeMap::new();
    for term in &groups.terms {
        deps.extend(term.deps.iter().map(|(k, v)| (k.clone(), *v)));
    }
    Some(CompiledExpr {
        expr: Rc::new(expr),
        deps,
        agg_slots: 0,
        subs: Rc::new(groups.subs.clone()),
        bound: Rc::new(BTreeMap::new()),
    })
}

// ============================================================================
// Sub-pass 2: transaction preparation
// ============================================================================

fn prepare_transaction(root: Rc<PlanNode>) -> Result<Rc<PlanNode>> {
    let mut stores: Vec<(StoreHandle, Vec<String>)> = Vec::new();
    let mut has_write = false;
    let mut conflict: Option<(String, String)> = None;

    root.walk(&mut |node| {
        let touched: Option<(StoreHandle, String)> = match node {
            PlanNode::Source(s) => match &s.source {
                Source::Store { store, source } => Some((store.clone(), source.clone())),
                _ => None,
            },
            PlanNode::Write(w) => {
                has_write = true;
                match &w.target {
                    WriteTarget::Store { store, source } => Some((store.clone(), source.clone())),
                    WriteTarget::Mem(_) => None,
                }
            }
            _ => None,
        };
        if let Some((store, name)) = touched {
            match stores.iter_mut().find(|(s, _)| same_store(s, &store)) {
                Some((_, names)) => {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
                None => {
                    if let Some((first, _)) = stores.first() {
                        conflict
                            .get_or_insert((first.name().to_string(), store.name().to_string()));
                    }
                    stores.push((store, vec![name]));
                }
            }
        }
    });

    if let Some((a, b)) = conflict {
        return Err(Error::MultipleStores(a, b));
    }

    let mode = if has_write {
        TxMode::ReadWrite
    } else {
        TxMode::Read
    };

    match stores.pop() {
        Some((store, mut source_names)) => {
            source_names.sort();
            Ok(Rc::new(PlanNode::Envelope(EnvelopeNode {
                child: root,
                store: Some(store),
                source_names,
                mode,
            })))
        }
        // A write-only-in-memory query still needs an ambient transaction
        // for its overlay and auto-commit
        None if has_write => Ok(Rc::new(PlanNode::Envelope(EnvelopeNode {
            child: root,
            store: None,
            source_names: Vec::new(),
            mode,
        }))),
        None => Ok(root),
    }
}
