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

//! Index selection
//!
//! Given the key ranges attached to a persistent named source, choose the
//! most selective access path: the primary index when its key prefix is
//! usable, else a unique secondary, else any secondary, else a full scan.
//! An index prefix is usable while every component has a range and every
//! range before the last is an equality; the final component may carry a
//! general range. The chosen prefix becomes one native scan per element
//! of the cross product of the equalities' prepared points and the final
//! range's prepared intervals.

use rustc_hash::FxHashMap;

use crate::core::{Error, KeyPath, Result, Value};
use crate::range::{composite_interval, Interval, Prepared};
use crate::store::{NativeRange, SourceSpec};

/// Prepared ranges per key path
pub type PreparedRanges = FxHashMap<KeyPath, Prepared>;

/// The chosen access path for one source scan
#[derive(Debug)]
pub enum ScanPlan {
    /// Some range is unsatisfiable: the source contributes nothing
    Empty,
    /// No usable index: scan everything
    Full,
    /// Probe the primary tree with these native ranges
    Primary(Vec<NativeRange>),
    /// Probe a secondary index with these native ranges
    Index(String, Vec<NativeRange>),
}

/// Choose the access path for a source given its prepared key ranges
pub fn choose_scan(spec: &SourceSpec, prepared: &PreparedRanges) -> Result<ScanPlan> {
    // An empty prepared list denotes the empty relation
    if prepared.values().any(|list| list.is_empty()) {
        return Ok(ScanPlan::Empty);
    }
    if prepared.is_empty() {
        return Ok(ScanPlan::Full);
    }

    // The primary index wins whenever it is usable at all
    let primary_paths = spec.key_path.paths();
    if !primary_paths.is_empty() {
        let usable = usable_len(primary_paths, prepared);
        if usable > 0 {
            let scans = native_scans(
                &primary_paths[..usable],
                prepared,
                primary_paths.len() > 1,
            )?;
            return Ok(ScanPlan::Primary(scans));
        }
    }

    // Unique secondaries beat non-unique ones; multi-entry indexes are
    // never candidates
    let mut best: Option<(&str, usize, bool, usize)> = None;
    for index in &spec.indexes {
        if index.multi_entry {
            continue;
        }
        let usable = usable_len(&index.key_paths, prepared);
        if usable == 0 {
            continue;
        }
        let candidate = (index.name.as_str(), usable, index.unique, index.key_paths.len());
        let better = match best {
            None => true,
            Some((_, best_usable, best_unique, _)) => {
                (index.unique, usable) > (best_unique, best_usable)
            }
        };
        if better {
            best = Some(candidate);
        }
    }

    match best {
        Some((name, usable, _, arity)) => {
            let index = spec.index(name).ok_or_else(|| {
                Error::Internal(format!("chosen index '{}' disappeared", name))
            })?;
            let scans = native_scans(&index.key_paths[..usable], prepared, arity > 1)?;
            Ok(ScanPlan::Index(name.to_string(), scans))
        }
        None => Ok(ScanPlan::Full),
    }
}

/// The longest usable prefix of an index's key paths
fn usable_len(paths: &[KeyPath], prepared: &PreparedRanges) -> usize {
    let mut present = 0;
    for path in paths {
        if prepared.contains_key(path) {
            present += 1;
        } else {
            break;
        }
    }
    // Shrink until everything before the last component is an equality
    let mut usable = present;
    while usable > 1 && !all_equalities(&paths[..usable - 1], prepared) {
        usable -= 1;
    }
    usable
}

fn all_equalities(paths: &[KeyPath], prepared: &PreparedRanges) -> bool {
    paths.iter().all(|path| {
        prepared
            .get(path)
            .map(|list| !list.is_empty() && list.iter().all(Interval::is_equality))
            .unwrap_or(false)
    })
}

/// One native range per element of the cross product of equality points
/// and final-range intervals
fn native_scans(
    paths: &[KeyPath],
    prepared: &PreparedRanges,
    composite: bool,
) -> Result<Vec<NativeRange>> {
    let (equality_paths, last_path) = paths.split_at(paths.len() - 1);

    let mut equality_sets: Vec<Vec<Value>> = Vec::with_capacity(equality_paths.len());
    for path in equality_paths {
        let list = &prepared[path];
        let mut points = Vec::with_capacity(list.len());
        for interval in list {
            let value = interval.equality_value().ok_or_else(|| {
                Error::Internal(format!("non-equality prefix range on '{}'", path))
            })?;
            points.push(value.clone());
        }
        equality_sets.push(points);
    }

    let final_ranges = &prepared[&last_path[0]];

    let mut scans = Vec::new();
    let mut prefix = Vec::with_capacity(equality_sets.len());
    cross_product(&equality_sets, &mut prefix, &mut |prefix| {
        for interval in final_ranges {
            scans.push((prefix.to_vec(), interval.clone()));
        }
    });

    scans
        .into_iter()
        .map(|(prefix, interval)| composite_interval(&prefix, &interval, composite))
        .collect()
}

fn cross_product(sets: &[Vec<Value>], prefix: &mut Vec<Value>, emit: &mut impl FnMut(&[Value])) {
    match sets.split_first() {
        None => emit(prefix),
        Some((first, rest)) => {
            for value in first {
                prefix.push(value.clone());
                cross_product(rest, prefix, emit);
                prefix.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexSpec;
    use smallvec::smallvec;
    use std::ops::Bound;

    fn point(n: f64) -> Interval {
        Interval::point(Value::Number(n))
    }

    fn above(n: f64) -> Interval {
        Interval {
            lower: Bound::Excluded(Value::Number(n)),
            upper: Bound::Unbounded,
        }
    }

    fn composite_spec() -> SourceSpec {
        SourceSpec::composite_keyed(
            "inventory",
            [KeyPath::parse("storeId"), KeyPath::parse("isbn")],
        )
    }

    #[test]
    fn test_equality_prefix_plus_range_uses_primary() {
        let spec = composite_spec();
        let mut prepared = PreparedRanges::default();
        prepared.insert(KeyPath::parse("storeId"), smallvec![point(1.0)]);
        prepared.insert(KeyPath::parse("isbn"), smallvec![above(200000.0)]);

        let plan = choose_scan(&spec, &prepared).expect("choose");
        let ScanPlan::Primary(scans) = plan else {
            panic!("expected a primary scan, got {:?}", plan);
        };
        assert_eq!(scans.len(), 1);
        let key = |a: f64, b: f64| Value::sequence(vec![Value::Number(a), Value::Number(b)]);
        assert!(scans[0].contains(&key(1.0, 234567.0)));
        assert!(!scans[0].contains(&key(1.0, 123456.0)));
        assert!(!scans[0].contains(&key(2.0, 234567.0)));
    }

    #[test]
    fn test_range_prefix_truncates_to_first_component() {
        // A non-equality on the first component stops the prefix there
        let spec = composite_spec();
        let mut prepared = PreparedRanges::default();
        prepared.insert(KeyPath::parse("storeId"), smallvec![above(0.0)]);
        prepared.insert(KeyPath::parse("isbn"), smallvec![point(5.0)]);

        let plan = choose_scan(&spec, &prepared).expect("choose");
        let ScanPlan::Primary(scans) = plan else {
            panic!("expected a primary scan, got {:?}", plan);
        };
        // The scan covers every isbn under storeId > 0
        let key = |a: f64, b: f64| Value::sequence(vec![Value::Number(a), Value::Number(b)]);
        assert!(scans[0].contains(&key(1.0, 1.0)));
        assert!(scans[0].contains(&key(2.0, 99.0)));
    }

    #[test]
    fn test_unique_secondary_beats_non_unique() {
        let spec = SourceSpec::keyed("users", "id")
            .with_index(IndexSpec::simple("by_age", "age"))
            .with_index(IndexSpec::simple("by_email", "email").unique());
        let mut prepared = PreparedRanges::default();
        prepared.insert(KeyPath::parse("age"), smallvec![point(30.0)]);
        prepared.insert(KeyPath::parse("email"), smallvec![point(1.0)]);

        let plan = choose_scan(&spec, &prepared).expect("choose");
        assert!(matches!(plan, ScanPlan::Index(name, _) if name == "by_email"));
    }

    #[test]
    fn test_multi_entry_is_never_a_candidate() {
        let spec = SourceSpec::keyed("docs", "id")
            .with_index(IndexSpec::simple("by_tag", "tags").multi_entry());
        let mut prepared = PreparedRanges::default();
        prepared.insert(KeyPath::parse("tags"), smallvec![point(1.0)]);

        let plan = choose_scan(&spec, &prepared).expect("choose");
        assert!(matches!(plan, ScanPlan::Full));
    }

    #[test]
    fn test_unsatisfiable_range_empties_the_scan() {
        let spec = composite_spec();
        let mut prepared = PreparedRanges::default();
        prepared.insert(KeyPath::parse("storeId"), Prepared::new());

        let plan = choose_scan(&spec, &prepared).expect("choose");
        assert!(matches!(plan, ScanPlan::Empty));
    }

    #[test]
    fn test_union_equalities_cross_product() {
        // storeId in {1, 2} with an isbn range becomes two native scans
        let spec = composite_spec();
        let mut prepared = PreparedRanges::default();
        prepared.insert(
            KeyPath::parse("storeId"),
            smallvec![point(1.0), point(2.0)],
        );
        prepared.insert(KeyPath::parse("isbn"), smallvec![above(0.0)]);

        let plan = choose_scan(&spec, &prepared).expect("choose");
        let ScanPlan::Primary(scans) = plan else {
            panic!("expected a primary scan, got {:?}", plan);
        };
        assert_eq!(scans.len(), 2);
    }

    #[test]
    fn test_no_ranges_means_full_scan() {
        let spec = composite_spec();
        let plan = choose_scan(&spec, &PreparedRanges::default()).expect("choose");
        assert!(matches!(plan, ScanPlan::Full));
    }
}
