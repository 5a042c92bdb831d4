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

//! Term decomposition
//!
//! A predicate splits at its top-level conjunctions into [`Term`]s, each
//! carrying its dependency set and any key ranges extracted from it.
//! [`TermGroups`] holds the terms of one Where/Join plus the shared
//! substitution table; merging groups re-indexes the incoming
//! substitution references and conjoins terms with equal dependency sets.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::core::{KeyPath, Value};
use crate::parser::{Expr, RecordEntry};
use crate::range::KeyRange;

use super::SourceId;

/// Key ranges extracted from one term: dependency -> key path -> range
pub type TermRanges = FxHashMap<SourceId, FxHashMap<KeyPath, KeyRange>>;

/// One conjunctive atom of a predicate
#[derive(Debug, Clone)]
pub struct Term {
    /// Free source names of the expression and their identities
    pub deps: BTreeMap<String, SourceId>,
    /// The normalized expression
    pub expr: Expr,
    /// Key-range constraints discovered in the expression
    pub ranges: TermRanges,
}

impl Term {
    /// Whether every dependency is satisfied by the given identity test
    pub fn satisfied_by(&self, mut has_id: impl FnMut(SourceId) -> bool) -> bool {
        self.deps.values().all(|&id| has_id(id))
    }

    /// Whether the term carries any key range
    pub fn has_ranges(&self) -> bool {
        self.ranges.values().any(|paths| !paths.is_empty())
    }

    /// Conjoin another term with the same dependency set into this one
    fn absorb(&mut self, other: Term) {
        let lhs = std::mem::replace(&mut self.expr, Expr::Null);
        self.expr = Expr::and(lhs, other.expr);
        for (dep, paths) in other.ranges {
            let slot = self.ranges.entry(dep).or_default();
            for (path, range) in paths {
                match slot.remove(&path) {
                    Some(existing) => {
                        slot.insert(path, existing.intersection(range));
                    }
                    None => {
                        slot.insert(path, range);
                    }
                }
            }
        }
    }
}

/// The terms of one predicate plus their substitution table
#[derive(Debug, Clone, Default)]
pub struct TermGroups {
    pub terms: Vec<Term>,
    pub subs: Vec<Value>,
}

impl TermGroups {
    /// An empty group
    pub fn new() -> Self {
        TermGroups::default()
    }

    /// Whether the group holds no terms
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Number of terms
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// Insert a term, conjoining into an existing term with the same
    /// dependency set when there is one
    pub fn push_term(&mut self, term: Term) {
        for existing in &mut self.terms {
            if existing.deps == term.deps {
                existing.absorb(term);
                return;
            }
        }
        self.terms.push(term);
    }

    /// Merge another group into this one
    ///
    /// Re-indexes the incoming substitution references by the current
    /// table length, appends the incoming substitutions, and inserts or
    /// conjoins each incoming term.
    pub fn merge(&mut self, other: TermGroups) {
        let offset = self.subs.len();
        for mut term in other.terms {
            shift_term(&mut term, offset);
            self.push_term(term);
        }
        self.subs.extend(other.subs);
    }

    /// Remove and return every term matching the predicate
    pub fn take_terms(&mut self, mut keep_out: impl FnMut(&Term) -> bool) -> Vec<Term> {
        let mut taken = Vec::new();
        let mut remaining = Vec::with_capacity(self.terms.len());
        for term in self.terms.drain(..) {
            if keep_out(&term) {
                taken.push(term);
            } else {
                remaining.push(term);
            }
        }
        self.terms = remaining;
        taken
    }

    /// The conjunction of all terms, or None when the group is empty
    pub fn merged_conjunction(&self) -> Option<Expr> {
        let mut iter = self.terms.iter().map(|t| t.expr.clone());
        let first = iter.next()?;
        Some(iter.fold(first, Expr::and))
    }
}

fn shift_term(term: &mut Term, offset: usize) {
    if offset == 0 {
        return;
    }
    shift_expr(&mut term.expr, offset);
    for paths in term.ranges.values_mut() {
        for range in paths.values_mut() {
            shift_range(range, offset);
        }
    }
}

/// Re-index every substitution reference in an expression
pub fn shift_expr(expr: &mut Expr, offset: usize) {
    match expr {
        Expr::SubsRef(i) => *i += offset,
        Expr::Record(entries) => {
            for entry in entries {
                match entry {
                    RecordEntry::Field(_, e) | RecordEntry::Spread(e) => shift_expr(e, offset),
                    RecordEntry::Shorthand(_) => {}
                }
            }
        }
        Expr::Sequence(items) => {
            for item in items {
                shift_expr(item, offset);
            }
        }
        Expr::Member(base, _) => shift_expr(base, offset),
        Expr::Index(base, index) => {
            shift_expr(base, offset);
            shift_expr(index, offset);
        }
        Expr::Call(callee, args) => {
            shift_expr(callee, offset);
            for arg in args {
                shift_expr(arg, offset);
            }
        }
        Expr::Lambda(_, body) => shift_expr(body, offset),
        Expr::Unary(_, operand) => shift_expr(operand, offset),
        Expr::Binary(_, lhs, rhs) => {
            shift_expr(lhs, offset);
            shift_expr(rhs, offset);
        }
        Expr::Compare { lhs, rhs, .. } => {
            shift_expr(lhs, offset);
            shift_expr(rhs, offset);
        }
        Expr::Aggregate { args, .. } => {
            for arg in args {
                shift_expr(arg, offset);
            }
        }
        Expr::Null
        | Expr::Bool(_)
        | Expr::Number(_)
        | Expr::Str(_)
        | Expr::Ident(_)
        | Expr::This
        | Expr::ThisRow
        | Expr::Param(_) => {}
    }
}

fn shift_range(range: &mut KeyRange, offset: usize) {
    match range {
        KeyRange::Literal(_) => {}
        KeyRange::Expr { lower, upper, .. } => {
            if let Some(bound) = lower {
                shift_expr(std::rc::Rc::make_mut(&mut bound.expr), offset);
            }
            if let Some(bound) = upper {
                shift_expr(std::rc::Rc::make_mut(&mut bound.expr), offset);
            }
        }
        KeyRange::Union(left, right) | KeyRange::Intersection(left, right) => {
            shift_range(left, offset);
            shift_range(right, offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::BinaryOp;

    fn term_with_sub(dep: SourceId, sub_index: usize) -> Term {
        Term {
            deps: BTreeMap::from([("a".to_string(), dep)]),
            expr: Expr::SubsRef(sub_index),
            ranges: TermRanges::default(),
        }
    }

    #[test]
    fn test_merge_reindexes_subs() {
        let id = SourceId::fresh();
        let mut left = TermGroups {
            terms: vec![term_with_sub(id, 0)],
            subs: vec![Value::Number(1.0)],
        };
        let other_id = SourceId::fresh();
        let right = TermGroups {
            terms: vec![term_with_sub(other_id, 0)],
            subs: vec![Value::Number(2.0)],
        };
        left.merge(right);
        assert_eq!(left.subs.len(), 2);
        assert_eq!(left.terms.len(), 2);
        assert_eq!(left.terms[1].expr, Expr::SubsRef(1));
    }

    #[test]
    fn test_same_deps_terms_conjoin() {
        let id = SourceId::fresh();
        let mut groups = TermGroups::new();
        groups.push_term(term_with_sub(id, 0));
        groups.push_term(term_with_sub(id, 1));
        assert_eq!(groups.terms.len(), 1);
        assert!(matches!(
            groups.terms[0].expr,
            Expr::Binary(BinaryOp::And, _, _)
        ));
    }

    #[test]
    fn test_substitution_accounting() {
        // After a merge, the number of substitution entries matches the
        // references reachable from the terms.
        let a = SourceId::fresh();
        let b = SourceId::fresh();
        let mut groups = TermGroups {
            terms: vec![term_with_sub(a, 0)],
            subs: vec![Value::Number(10.0)],
        };
        groups.merge(TermGroups {
            terms: vec![term_with_sub(b, 0)],
            subs: vec![Value::Number(20.0)],
        });
        let mut seen = Vec::new();
        for term in &groups.terms {
            if let Expr::SubsRef(i) = term.expr {
                seen.push(i);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(groups.subs[1], Value::Number(20.0));
    }
}
