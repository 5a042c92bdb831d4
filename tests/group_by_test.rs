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

//! Group-By Tests
//!
//! Aggregates over grouped tuples: sums skipping nulls, counts, first-seen
//! group order, and filters over the grouped output.

use quarry::core::Record;
use quarry::{params, record, select, Value};

/// 100 records; `i` is absent for the first so nulls get exercised
fn quartile_records() -> Vec<Record> {
    (0..100)
        .map(|i| {
            let mut r = record! { "quartile" => (i / 25) as i64 };
            if i != 0 {
                r.set("i", i as i64);
            }
            r
        })
        .collect()
}

fn field(row: &Value, name: &str) -> Value {
    row.as_record()
        .unwrap_or_else(|| panic!("row is not a record: {}", row))
        .get_or_null(name)
}

#[test]
fn test_sum_per_quartile_excludes_nulls() {
    let rows = select("{quartile: r.quartile, total: sum(r.i)}")
        .from("r", quartile_records())
        .group_by("{quartile: r.quartile}")
        .collect(params! {})
        .expect("query");

    let totals: Vec<(Value, Value)> = rows
        .iter()
        .map(|row| (field(row, "quartile"), field(row, "total")))
        .collect();
    assert_eq!(
        totals,
        vec![
            (Value::Number(0.0), Value::Number(300.0)),
            (Value::Number(1.0), Value::Number(925.0)),
            (Value::Number(2.0), Value::Number(1550.0)),
            (Value::Number(3.0), Value::Number(2175.0)),
        ]
    );
}

#[test]
fn test_count_rows_vs_count_values() {
    let rows = select("{quartile: r.quartile, rows: count(), values: count(r.i)}")
        .from("r", quartile_records())
        .group_by("{quartile: r.quartile}")
        .collect(params! {})
        .expect("query");

    // The first quartile holds the record with no `i`
    assert_eq!(field(&rows[0], "rows"), Value::Number(25.0));
    assert_eq!(field(&rows[0], "values"), Value::Number(24.0));
    assert_eq!(field(&rows[1], "values"), Value::Number(25.0));
}

#[test]
fn test_min_max_avg() {
    let rows = select("{q: r.quartile, lo: min(r.i), hi: max(r.i), mid: avg(r.i)}")
        .from("r", quartile_records())
        .group_by("{q: r.quartile}")
        .collect(params! {})
        .expect("query");

    assert_eq!(field(&rows[1], "lo"), Value::Number(25.0));
    assert_eq!(field(&rows[1], "hi"), Value::Number(49.0));
    assert_eq!(field(&rows[1], "mid"), Value::Number(37.0));
}

#[test]
fn test_selector_keeps_last_tuple_fields() {
    // Non-aggregated fields reflect the group's final tuple
    let rows = select("{q: r.quartile, last_i: r.i, total: sum(r.i)}")
        .from("r", quartile_records())
        .group_by("{q: r.quartile}")
        .collect(params! {})
        .expect("query");
    assert_eq!(field(&rows[0], "last_i"), Value::Number(24.0));
    assert_eq!(field(&rows[3], "last_i"), Value::Number(99.0));
}

#[test]
fn test_groups_emit_in_first_seen_order() {
    let records = vec![
        record! { "k" => "b", "n" => 1 },
        record! { "k" => "a", "n" => 2 },
        record! { "k" => "b", "n" => 3 },
    ];
    let rows = select("{k: r.k, total: sum(r.n)}")
        .from("r", records)
        .group_by("{k: r.k}")
        .collect(params! {})
        .expect("query");
    assert_eq!(field(&rows[0], "k"), Value::text("b"));
    assert_eq!(field(&rows[0], "total"), Value::Number(4.0));
    assert_eq!(field(&rows[1], "k"), Value::text("a"));
}

#[test]
fn test_filter_over_grouped_output() {
    // A where after group_by filters the anonymous grouped rows
    let rows = select("{quartile: r.quartile, total: sum(r.i)}")
        .from("r", quartile_records())
        .group_by("{quartile: r.quartile}")
        .where_("total > 1000")
        .collect(params! {})
        .expect("query");
    assert_eq!(rows.len(), 2);
    assert_eq!(field(&rows[0], "total"), Value::Number(1550.0));
}

#[test]
fn test_group_over_join() {
    let things = vec![
        record! { "name" => "Apple", "calories" => 95, "type_id" => 1 },
        record! { "name" => "Banana", "calories" => 105, "type_id" => 1 },
        record! { "name" => "Cake", "calories" => 235, "type_id" => 2 },
    ];
    let types = vec![
        record! { "id" => 1, "name" => "Vegetable" },
        record! { "id" => 2, "name" => "Mineral" },
    ];

    let rows = select("{type_name: type.name, total: sum(thing.calories)}")
        .from("thing", things)
        .from("type", types)
        .where_("thing.type_id === type.id")
        .group_by("{type_name: type.name}")
        .collect(params! {})
        .expect("query");

    assert_eq!(rows.len(), 2);
    assert_eq!(field(&rows[0], "total"), Value::Number(200.0));
    assert_eq!(field(&rows[1], "total"), Value::Number(235.0));
}
