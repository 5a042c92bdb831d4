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

//! Key-range extraction
//!
//! Walks a normalized term expression looking for three-way comparisons
//! between a key path (a member chain rooted at a schema source) and an
//! expression independent of that source, and turns them into
//! [`KeyRange`] constraints. Negation toggles a complement flag;
//! conjunction and disjunction combine the (dependency, key path) pairs
//! present in both branches and drop one-sided pairs.

use std::collections::BTreeMap;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::core::KeyPath;
use crate::parser::{BinaryOp, CompareOp, Expr, RecordEntry, UnaryOp};
use crate::range::KeyRange;

use super::terms::TermRanges;
use super::SourceId;

/// Extract every key-range constraint from a term expression
pub fn extract_ranges(expr: &Expr, deps: &BTreeMap<String, SourceId>) -> TermRanges {
    extract(expr, deps, false)
}

fn extract(expr: &Expr, deps: &BTreeMap<String, SourceId>, complement: bool) -> TermRanges {
    match expr {
        Expr::Compare { op, lhs, rhs } => extract_compare(*op, lhs, rhs, deps, complement),

        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let union = complement; // !(A && B) == !A || !B
            combine(
                extract(lhs, deps, complement),
                extract(rhs, deps, complement),
                union,
            )
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let union = !complement;
            combine(
                extract(lhs, deps, complement),
                extract(rhs, deps, complement),
                union,
            )
        }

        Expr::Unary(UnaryOp::Not, operand) => extract(operand, deps, !complement),

        // No other operator shape constrains a key
        _ => TermRanges::default(),
    }
}

fn extract_compare(
    op: CompareOp,
    lhs: &Expr,
    rhs: &Expr,
    deps: &BTreeMap<String, SourceId>,
    complement: bool,
) -> TermRanges {
    let effective = if complement { op.complement() } else { Some(op) };
    let Some(op) = effective else {
        // A complemented equality constrains nothing
        return TermRanges::default();
    };

    let mut out = TermRanges::default();

    if let Some((source, id, path)) = key_path_of(lhs, deps) {
        if !depends_on(rhs, source) {
            insert_range(&mut out, id, path, range_for(op, rhs));
        }
    }
    if let Some((source, id, path)) = key_path_of(rhs, deps) {
        if !depends_on(lhs, source) {
            insert_range(&mut out, id, path, range_for(op.flipped(), lhs));
        }
    }

    out
}

fn insert_range(out: &mut TermRanges, id: SourceId, path: KeyPath, range: KeyRange) {
    let slot = out.entry(id).or_default();
    match slot.remove(&path) {
        Some(existing) => {
            slot.insert(path, existing.intersection(range));
        }
        None => {
            slot.insert(path, range);
        }
    }
}

fn range_for(op: CompareOp, bound: &Expr) -> KeyRange {
    let bound = Rc::new(bound.clone());
    match op {
        CompareOp::Eq => KeyRange::equality(bound),
        CompareOp::Ge => KeyRange::lower_bounded(bound, false),
        CompareOp::Gt => KeyRange::lower_bounded(bound, true),
        CompareOp::Le => KeyRange::upper_bounded(bound, false),
        CompareOp::Lt => KeyRange::upper_bounded(bound, true),
    }
}

/// Combine two branch results over the pairs present in both
fn combine(mut left: TermRanges, mut right: TermRanges, union: bool) -> TermRanges {
    let mut out = TermRanges::default();
    for (dep, mut left_paths) in left.drain() {
        let Some(right_paths) = right.remove(&dep) else {
            continue;
        };
        let mut right_paths: FxHashMap<_, _> = right_paths;
        let mut merged = FxHashMap::default();
        for (path, left_range) in left_paths.drain() {
            let Some(right_range) = right_paths.remove(&path) else {
                continue;
            };
            let combined = if union {
                left_range.union(right_range)
            } else {
                left_range.intersection(right_range)
            };
            merged.insert(path, combined);
        }
        if !merged.is_empty() {
            out.insert(dep, merged);
        }
    }
    out
}

/// A member chain rooted at a schema source, e.g. `thing.type_id`
fn key_path_of<'a>(
    expr: &'a Expr,
    deps: &BTreeMap<String, SourceId>,
) -> Option<(&'a str, SourceId, KeyPath)> {
    let mut segments: Vec<&str> = Vec::new();
    let mut current = expr;
    loop {
        match current {
            Expr::Member(base, field) => {
                segments.push(field);
                current = base;
            }
            Expr::Ident(name) => {
                if segments.is_empty() {
                    return None;
                }
                let id = *deps.get(name)?;
                segments.reverse();
                let path = KeyPath::from_segments(segments.iter().map(|s| s.to_string()));
                return Some((name.as_str(), id, path));
            }
            _ => return None,
        }
    }
}

/// Whether any identifier in the expression refers to the source
fn depends_on(expr: &Expr, source: &str) -> bool {
    match expr {
        Expr::Ident(name) => name == source,
        Expr::Record(entries) => entries.iter().any(|entry| match entry {
            RecordEntry::Field(_, e) | RecordEntry::Spread(e) => depends_on(e, source),
            RecordEntry::Shorthand(name) => name == source,
        }),
        Expr::Sequence(items) => items.iter().any(|item| depends_on(item, source)),
        Expr::Member(base, _) => depends_on(base, source),
        Expr::Index(base, index) => depends_on(base, source) || depends_on(index, source),
        Expr::Call(callee, args) => {
            depends_on(callee, source) || args.iter().any(|arg| depends_on(arg, source))
        }
        // A lambda parameter shadowing the source still counts as a
        // dependency here; over-approximation only costs a range.
        Expr::Lambda(_, body) => depends_on(body, source),
        Expr::Unary(_, operand) => depends_on(operand, source),
        Expr::Binary(_, lhs, rhs) => depends_on(lhs, source) || depends_on(rhs, source),
        Expr::Compare { lhs, rhs, .. } => depends_on(lhs, source) || depends_on(rhs, source),
        Expr::Aggregate { args, .. } => args.iter().any(|arg| depends_on(arg, source)),
        Expr::Null
        | Expr::Bool(_)
        | Expr::Number(_)
        | Expr::Str(_)
        | Expr::This
        | Expr::ThisRow
        | Expr::Param(_)
        | Expr::SubsRef(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Result, Value};

    fn deps_for(name: &str) -> (BTreeMap<String, SourceId>, SourceId) {
        let id = SourceId::fresh();
        (BTreeMap::from([(name.to_string(), id)]), id)
    }

    fn compare(op: CompareOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Compare {
            op,
            lhs: lhs.boxed(),
            rhs: rhs.boxed(),
        }
    }

    fn member(source: &str, field: &str) -> Expr {
        Expr::Member(Expr::Ident(source.to_string()).boxed(), field.to_string())
    }

    fn literal_eval(expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            other => panic!("unexpected bound expression {}", other),
        }
    }

    #[test]
    fn test_equality_extracts_point_range() {
        let (deps, id) = deps_for("item");
        let expr = compare(CompareOp::Eq, member("item", "store_id"), Expr::Number(1.0));
        let ranges = extract_ranges(&expr, &deps);
        let range = &ranges[&id][&KeyPath::parse("store_id")];
        assert!(range.is_equality());
        let prepared = range.prepare(&literal_eval).expect("prepare");
        assert_eq!(prepared.len(), 1);
        assert!(prepared[0].contains(&Value::Number(1.0)));
        assert!(!prepared[0].contains(&Value::Number(2.0)));
    }

    #[test]
    fn test_swapped_sides_flip_the_operator() {
        // 10 < item.n is item.n > 10
        let (deps, id) = deps_for("item");
        let expr = compare(CompareOp::Lt, Expr::Number(10.0), member("item", "n"));
        let ranges = extract_ranges(&expr, &deps);
        let prepared = ranges[&id][&KeyPath::parse("n")]
            .prepare(&literal_eval)
            .expect("prepare");
        assert!(prepared[0].contains(&Value::Number(11.0)));
        assert!(!prepared[0].contains(&Value::Number(10.0)));
    }

    #[test]
    fn test_complemented_inequality_inverts() {
        // !(item.n >= 5) is item.n < 5
        let (deps, id) = deps_for("item");
        let expr = Expr::Unary(
            UnaryOp::Not,
            compare(CompareOp::Ge, member("item", "n"), Expr::Number(5.0)).boxed(),
        );
        let ranges = extract_ranges(&expr, &deps);
        let prepared = ranges[&id][&KeyPath::parse("n")]
            .prepare(&literal_eval)
            .expect("prepare");
        assert!(prepared[0].contains(&Value::Number(4.0)));
        assert!(!prepared[0].contains(&Value::Number(5.0)));
    }

    #[test]
    fn test_complemented_equality_yields_nothing() {
        let (deps, _) = deps_for("item");
        let expr = Expr::Unary(
            UnaryOp::Not,
            compare(CompareOp::Eq, member("item", "n"), Expr::Number(5.0)).boxed(),
        );
        assert!(extract_ranges(&expr, &deps).is_empty());
    }

    #[test]
    fn test_disjunction_unions_common_pairs() {
        let (deps, id) = deps_for("item");
        let expr = Expr::Binary(
            BinaryOp::Or,
            compare(CompareOp::Lt, member("item", "n"), Expr::Number(2.0)).boxed(),
            compare(CompareOp::Gt, member("item", "n"), Expr::Number(8.0)).boxed(),
        );
        let ranges = extract_ranges(&expr, &deps);
        let prepared = ranges[&id][&KeyPath::parse("n")]
            .prepare(&literal_eval)
            .expect("prepare");
        assert_eq!(prepared.len(), 2);
    }

    #[test]
    fn test_disjunction_drops_one_sided_pairs() {
        let (deps, _) = deps_for("item");
        let expr = Expr::Binary(
            BinaryOp::Or,
            compare(CompareOp::Lt, member("item", "n"), Expr::Number(2.0)).boxed(),
            compare(CompareOp::Gt, member("item", "m"), Expr::Number(8.0)).boxed(),
        );
        assert!(extract_ranges(&expr, &deps).is_empty());
    }

    #[test]
    fn test_both_sides_can_produce_ranges() {
        // a.x === b.y ranges both sources, each bounded by the other side
        let a = SourceId::fresh();
        let b = SourceId::fresh();
        let deps = BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]);
        let expr = compare(CompareOp::Eq, member("a", "x"), member("b", "y"));
        let ranges = extract_ranges(&expr, &deps);
        assert!(ranges[&a].contains_key(&KeyPath::parse("x")));
        assert!(ranges[&b].contains_key(&KeyPath::parse("y")));
    }

    #[test]
    fn test_dependent_bound_is_rejected() {
        // item.a === item.b pins nothing: each side depends on the source
        let (deps, _) = deps_for("item");
        let expr = compare(CompareOp::Eq, member("item", "a"), member("item", "b"));
        assert!(extract_ranges(&expr, &deps).is_empty());
    }
}
