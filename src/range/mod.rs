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

//! Range algebra
//!
//! Intervals over the value domain with open/closed/unbounded endpoints,
//! and the [`KeyRange`] expression tree the compiler extracts from
//! comparisons: literal bounds, per-tuple expression bounds, unions and
//! intersections. `prepare` reduces any range to its canonical form - an
//! ordered list of non-overlapping, non-empty intervals; the empty list
//! denotes the empty relation.
//!
//! Composite-index scans are driven by [`composite_interval`], which
//! prepends an equality prefix to a final interval and rewrites closed
//! upper bounds into the half-open form native cursors use, stepping the
//! endpoint with `next_up`.

use std::cmp::Ordering;
use std::ops::Bound;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::core::{Result, Value};
use crate::parser::Expr;

/// The prepared form of a range: a short list of canonical intervals
pub type Prepared = SmallVec<[Interval; 2]>;

/// Evaluates a bound expression against the current execution context
pub type BoundEval<'a> = dyn Fn(&Expr) -> Result<Value> + 'a;

// ============================================================================
// Interval
// ============================================================================

/// A concrete interval over the value domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub lower: Bound<Value>,
    pub upper: Bound<Value>,
}

/// Order two lower bounds; unbounded sorts first, inclusive before exclusive
pub fn cmp_lower(a: &Bound<Value>, b: &Bound<Value>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => {
            x.total_cmp(y)
        }
        (Bound::Included(x), Bound::Excluded(y)) => x.total_cmp(y).then(Ordering::Less),
        (Bound::Excluded(x), Bound::Included(y)) => x.total_cmp(y).then(Ordering::Greater),
    }
}

/// Order two upper bounds; unbounded sorts last, exclusive before inclusive
pub fn cmp_upper(a: &Bound<Value>, b: &Bound<Value>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Greater,
        (_, Bound::Unbounded) => Ordering::Less,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => {
            x.total_cmp(y)
        }
        (Bound::Included(x), Bound::Excluded(y)) => x.total_cmp(y).then(Ordering::Greater),
        (Bound::Excluded(x), Bound::Included(y)) => x.total_cmp(y).then(Ordering::Less),
    }
}

impl Interval {
    /// The unbounded interval
    pub fn all() -> Self {
        Interval {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// The single-value interval `[v, v]`
    pub fn point(value: Value) -> Self {
        Interval {
            lower: Bound::Included(value.clone()),
            upper: Bound::Included(value),
        }
    }

    /// Whether no value can satisfy both bounds
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(a), Bound::Included(b)) => a.total_cmp(b) == Ordering::Greater,
            (Bound::Included(a), Bound::Excluded(b))
            | (Bound::Excluded(a), Bound::Included(b))
            | (Bound::Excluded(a), Bound::Excluded(b)) => a.total_cmp(b) != Ordering::Less,
            _ => false,
        }
    }

    /// Whether this interval is a single-value equality
    pub fn is_equality(&self) -> bool {
        matches!(
            (&self.lower, &self.upper),
            (Bound::Included(a), Bound::Included(b)) if a == b
        )
    }

    /// The equality value, when `is_equality` holds
    pub fn equality_value(&self) -> Option<&Value> {
        match (&self.lower, &self.upper) {
            (Bound::Included(a), Bound::Included(b)) if a == b => Some(a),
            _ => None,
        }
    }

    /// Membership test
    pub fn contains(&self, value: &Value) -> bool {
        let above_lower = match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(l) => value.total_cmp(l) != Ordering::Less,
            Bound::Excluded(l) => value.total_cmp(l) == Ordering::Greater,
        };
        let below_upper = match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(u) => value.total_cmp(u) != Ordering::Greater,
            Bound::Excluded(u) => value.total_cmp(u) == Ordering::Less,
        };
        above_lower && below_upper
    }

    /// Intersection, or None when the result is empty
    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        let lower = if cmp_lower(&self.lower, &other.lower) == Ordering::Less {
            other.lower.clone()
        } else {
            self.lower.clone()
        };
        let upper = if cmp_upper(&self.upper, &other.upper) == Ordering::Greater {
            other.upper.clone()
        } else {
            self.upper.clone()
        };
        let result = Interval { lower, upper };
        if result.is_empty() {
            None
        } else {
            Some(result)
        }
    }

    /// Whether the union of this interval and a later-starting one is contiguous
    fn connects_to(&self, next: &Interval) -> bool {
        match (&self.upper, &next.lower) {
            (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
            (Bound::Included(u), Bound::Included(l)) | (Bound::Included(u), Bound::Excluded(l)) => {
                u.total_cmp(l) != Ordering::Less
            }
            (Bound::Excluded(u), Bound::Included(l)) => u.total_cmp(l) != Ordering::Less,
            (Bound::Excluded(u), Bound::Excluded(l)) => u.total_cmp(l) == Ordering::Greater,
        }
    }

    /// Rewrite a closed upper bound as half-open using `next_up`
    pub fn open_upper(&self) -> Result<Interval> {
        match &self.upper {
            Bound::Included(u) => Ok(Interval {
                lower: self.lower.clone(),
                upper: Bound::Excluded(u.next_up()?),
            }),
            _ => Ok(self.clone()),
        }
    }
}

/// Canonicalize: drop empty intervals, order by lower bound, merge overlaps
pub fn canonicalize(mut intervals: Vec<Interval>) -> Prepared {
    intervals.retain(|iv| !iv.is_empty());
    intervals.sort_by(|a, b| cmp_lower(&a.lower, &b.lower));

    let mut out: Prepared = SmallVec::new();
    for iv in intervals {
        match out.last_mut() {
            Some(prev) if prev.connects_to(&iv) => {
                if cmp_upper(&iv.upper, &prev.upper) == Ordering::Greater {
                    prev.upper = iv.upper;
                }
            }
            _ => out.push(iv),
        }
    }
    out
}

// ============================================================================
// KeyRange
// ============================================================================

/// A bound given as an expression, evaluated per execution
#[derive(Debug, Clone)]
pub struct ExprBound {
    pub expr: Rc<Expr>,
    /// true = exclusive
    pub open: bool,
}

/// A key-range constraint against a single key path
///
/// Extracted from comparison sub-expressions at compile time; reduced to
/// canonical intervals with `prepare` once the execution context can
/// evaluate the bound expressions.
#[derive(Debug, Clone)]
pub enum KeyRange {
    /// Literal bounds known at compile time
    Literal(Interval),
    /// Bounds evaluated per tuple
    Expr {
        lower: Option<ExprBound>,
        upper: Option<ExprBound>,
        /// Both bounds are the same closed expression
        equality: bool,
    },
    /// Union of two ranges
    Union(Box<KeyRange>, Box<KeyRange>),
    /// Intersection of two ranges
    Intersection(Box<KeyRange>, Box<KeyRange>),
}

impl KeyRange {
    /// `[expr, expr]`
    pub fn equality(expr: Rc<Expr>) -> Self {
        KeyRange::Expr {
            lower: Some(ExprBound {
                expr: expr.clone(),
                open: false,
            }),
            upper: Some(ExprBound { expr, open: false }),
            equality: true,
        }
    }

    /// `[expr, +inf)` or `(expr, +inf)`
    pub fn lower_bounded(expr: Rc<Expr>, open: bool) -> Self {
        KeyRange::Expr {
            lower: Some(ExprBound { expr, open }),
            upper: None,
            equality: false,
        }
    }

    /// `(-inf, expr]` or `(-inf, expr)`
    pub fn upper_bounded(expr: Rc<Expr>, open: bool) -> Self {
        KeyRange::Expr {
            lower: None,
            upper: Some(ExprBound { expr, open }),
            equality: false,
        }
    }

    /// Union of two ranges
    pub fn union(self, other: KeyRange) -> Self {
        KeyRange::Union(Box::new(self), Box::new(other))
    }

    /// Intersection of two ranges
    pub fn intersection(self, other: KeyRange) -> Self {
        KeyRange::Intersection(Box::new(self), Box::new(other))
    }

    /// Sound, conservative equality test: true only when every prepared
    /// form is a single-value interval
    pub fn is_equality(&self) -> bool {
        match self {
            KeyRange::Literal(iv) => iv.is_equality(),
            KeyRange::Expr { equality, .. } => *equality,
            KeyRange::Union(_, _) | KeyRange::Intersection(_, _) => false,
        }
    }

    /// Reduce to the canonical ordered list of non-overlapping intervals
    pub fn prepare(&self, eval: &BoundEval) -> Result<Prepared> {
        match self {
            KeyRange::Literal(iv) => Ok(canonicalize(vec![iv.clone()])),
            KeyRange::Expr { lower, upper, .. } => {
                let lower = match lower {
                    None => Bound::Unbounded,
                    Some(b) => {
                        let v = eval(&b.expr)?;
                        if b.open {
                            Bound::Excluded(v)
                        } else {
                            Bound::Included(v)
                        }
                    }
                };
                let upper = match upper {
                    None => Bound::Unbounded,
                    Some(b) => {
                        let v = eval(&b.expr)?;
                        if b.open {
                            Bound::Excluded(v)
                        } else {
                            Bound::Included(v)
                        }
                    }
                };
                Ok(canonicalize(vec![Interval { lower, upper }]))
            }
            KeyRange::Union(left, right) => {
                let mut intervals: Vec<Interval> = left.prepare(eval)?.into_vec();
                intervals.extend(right.prepare(eval)?);
                Ok(canonicalize(intervals))
            }
            KeyRange::Intersection(left, right) => {
                let lhs = left.prepare(eval)?;
                let rhs = right.prepare(eval)?;
                let mut intervals = Vec::new();
                for a in &lhs {
                    for b in &rhs {
                        if let Some(iv) = a.intersect(b) {
                            intervals.push(iv);
                        }
                    }
                }
                Ok(canonicalize(intervals))
            }
        }
    }
}

// ============================================================================
// Composite synthesis
// ============================================================================

/// Synthesise the native interval for a composite-index probe
///
/// `equalities` are the fixed leading key components; `last` constrains the
/// following component. For a composite index the native key is a sequence
/// and the native scan is half-open, so a closed upper bound is stepped
/// with `next_up` to keep the original endpoint inside the scan.
pub fn composite_interval(equalities: &[Value], last: &Interval, composite: bool) -> Result<Interval> {
    if !composite {
        debug_assert!(equalities.is_empty());
        return Ok(last.clone());
    }

    let with_prefix = |v: &Value| -> Value {
        let mut key: Vec<Value> = equalities.to_vec();
        key.push(v.clone());
        Value::sequence(key)
    };

    let lower = match &last.lower {
        Bound::Included(v) => Bound::Included(with_prefix(v)),
        Bound::Excluded(v) => Bound::Excluded(with_prefix(v)),
        Bound::Unbounded => {
            if equalities.is_empty() {
                Bound::Unbounded
            } else {
                // The prefix itself sorts before every extension of it
                Bound::Included(Value::sequence(equalities.to_vec()))
            }
        }
    };

    let upper = match &last.upper {
        Bound::Excluded(v) => Bound::Excluded(with_prefix(v)),
        Bound::Included(v) => Bound::Excluded(with_prefix(&v.next_up()?)),
        Bound::Unbounded => {
            if equalities.is_empty() {
                Bound::Unbounded
            } else {
                // Step the final equality component to cover every suffix
                let mut key: Vec<Value> = equalities[..equalities.len() - 1].to_vec();
                key.push(equalities[equalities.len() - 1].next_up()?);
                Bound::Excluded(Value::sequence(key))
            }
        }
    };

    Ok(Interval { lower, upper })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    fn iv(lower: Bound<Value>, upper: Bound<Value>) -> Interval {
        Interval { lower, upper }
    }

    fn no_eval(_: &Expr) -> Result<Value> {
        unreachable!("literal ranges never evaluate bounds")
    }

    #[test]
    fn test_canonicalize_orders_and_merges() {
        let prepared = canonicalize(vec![
            iv(Bound::Included(num(5.0)), Bound::Included(num(9.0))),
            iv(Bound::Included(num(1.0)), Bound::Included(num(3.0))),
            iv(Bound::Included(num(2.0)), Bound::Included(num(6.0))),
        ]);
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].lower, Bound::Included(num(1.0)));
        assert_eq!(prepared[0].upper, Bound::Included(num(9.0)));
    }

    #[test]
    fn test_canonicalize_keeps_gaps() {
        let prepared = canonicalize(vec![
            iv(Bound::Included(num(1.0)), Bound::Excluded(num(2.0))),
            iv(Bound::Excluded(num(2.0)), Bound::Included(num(3.0))),
        ]);
        // 2 itself is in neither interval, so they must not merge
        assert_eq!(prepared.len(), 2);
    }

    #[test]
    fn test_canonicalize_merges_touching() {
        let prepared = canonicalize(vec![
            iv(Bound::Included(num(1.0)), Bound::Included(num(2.0))),
            iv(Bound::Excluded(num(2.0)), Bound::Included(num(3.0))),
        ]);
        assert_eq!(prepared.len(), 1);
    }

    #[test]
    fn test_canonicalize_drops_empty() {
        let prepared = canonicalize(vec![
            iv(Bound::Included(num(5.0)), Bound::Included(num(1.0))),
            iv(Bound::Excluded(num(2.0)), Bound::Included(num(2.0))),
        ]);
        assert!(prepared.is_empty());
    }

    #[test]
    fn test_union_membership() {
        let left = KeyRange::Literal(iv(Bound::Included(num(1.0)), Bound::Included(num(3.0))));
        let right = KeyRange::Literal(iv(Bound::Included(num(5.0)), Bound::Included(num(7.0))));
        let prepared = left.union(right).prepare(&no_eval).expect("prepare");

        for (value, expected) in [(2.0, true), (4.0, false), (6.0, true), (8.0, false)] {
            let hit = prepared.iter().any(|iv| iv.contains(&num(value)));
            assert_eq!(hit, expected, "membership of {}", value);
        }
    }

    #[test]
    fn test_intersection_membership() {
        let left = KeyRange::Literal(iv(Bound::Included(num(1.0)), Bound::Included(num(5.0))));
        let right = KeyRange::Literal(iv(Bound::Included(num(3.0)), Bound::Included(num(9.0))));
        let prepared = left.intersection(right).prepare(&no_eval).expect("prepare");
        assert_eq!(prepared.len(), 1);
        assert!(prepared[0].contains(&num(3.0)));
        assert!(prepared[0].contains(&num(5.0)));
        assert!(!prepared[0].contains(&num(2.0)));
        assert!(!prepared[0].contains(&num(6.0)));
    }

    #[test]
    fn test_empty_intersection_is_empty_relation() {
        let left = KeyRange::Literal(iv(Bound::Included(num(1.0)), Bound::Excluded(num(2.0))));
        let right = KeyRange::Literal(iv(Bound::Included(num(3.0)), Bound::Unbounded));
        let prepared = left.intersection(right).prepare(&no_eval).expect("prepare");
        assert!(prepared.is_empty());
    }

    #[test]
    fn test_open_upper_includes_endpoint() {
        let range = iv(Bound::Included(num(1.0)), Bound::Included(num(2.0)));
        let open = range.open_upper().expect("open_upper");
        assert!(matches!(open.upper, Bound::Excluded(_)));
        assert!(open.contains(&num(2.0)), "original endpoint stays inside");
    }

    #[test]
    fn test_composite_interval_equality_prefix() {
        // storeId === 1 && isbn > 200000 over a (storeId, isbn) key
        let last = iv(Bound::Excluded(num(200000.0)), Bound::Unbounded);
        let native = composite_interval(&[num(1.0)], &last, true).expect("composite");

        let key = |a: f64, b: f64| Value::sequence(vec![num(a), num(b)]);
        assert!(native.contains(&key(1.0, 234567.0)));
        assert!(native.contains(&key(1.0, 345678.0)));
        assert!(!native.contains(&key(1.0, 123456.0)));
        assert!(!native.contains(&key(2.0, 234567.0)));
    }

    #[test]
    fn test_composite_interval_closed_upper_steps() {
        let last = iv(Bound::Included(num(10.0)), Bound::Included(num(20.0)));
        let native = composite_interval(&[num(7.0)], &last, true).expect("composite");

        let key = |a: f64, b: f64| Value::sequence(vec![num(a), num(b)]);
        assert!(native.contains(&key(7.0, 20.0)), "closed endpoint included");
        assert!(!native.contains(&key(7.0, 20.5)));
    }

    #[test]
    fn test_composite_interval_unbounded_suffix() {
        let native = composite_interval(&[num(3.0)], &Interval::all(), true).expect("composite");
        let key = |a: f64, b: f64| Value::sequence(vec![num(a), num(b)]);
        assert!(native.contains(&key(3.0, f64::MIN)));
        assert!(native.contains(&key(3.0, f64::MAX)));
        assert!(!native.contains(&key(2.0, 0.0)));
        assert!(!native.contains(&key(4.0, 0.0)));
    }
}
