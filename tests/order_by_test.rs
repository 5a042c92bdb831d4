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

//! Order-By Tests
//!
//! Directions, null placement, stable ties, cross-type ordering, and the
//! fusion of consecutive orderings.

use quarry::core::Record;
use quarry::{params, record, select, Value};

fn field(row: &Value, name: &str) -> Value {
    row.as_record()
        .unwrap_or_else(|| panic!("row is not a record: {}", row))
        .get_or_null(name)
}

fn names(rows: &[Value]) -> Vec<Value> {
    rows.iter().map(|row| field(row, "name")).collect()
}

fn people() -> Vec<Record> {
    vec![
        record! { "name" => "ann", "age" => 30 },
        record! { "name" => "bob", "age" => 25 },
        record! { "name" => "cat" },
        record! { "name" => "dan", "age" => 25 },
    ]
}

#[test]
fn test_ascending_and_descending() {
    let mut asc = select("{name: p.name, age: p.age}")
        .from("p", people())
        .where_("p.age !== null")
        .order_by("p.age")
        .asc();
    let rows = asc.collect(params! {}).expect("query");
    assert_eq!(
        names(&rows),
        vec![Value::text("bob"), Value::text("dan"), Value::text("ann")]
    );

    let mut desc = select("{name: p.name, age: p.age}")
        .from("p", people())
        .where_("p.age !== null")
        .order_by("p.age")
        .desc();
    let rows = desc.collect(params! {}).expect("query");
    assert_eq!(field(&rows[0], "name"), Value::text("ann"));
}

#[test]
fn test_nulls_placement() {
    let rows = select("{name: p.name}")
        .from("p", people())
        .order_by("p.age")
        .asc()
        .nulls_last()
        .collect(params! {})
        .expect("query");
    assert_eq!(field(&rows[3], "name"), Value::text("cat"));

    let rows = select("{name: p.name}")
        .from("p", people())
        .order_by("p.age")
        .asc()
        .nulls_first()
        .collect(params! {})
        .expect("query");
    assert_eq!(field(&rows[0], "name"), Value::text("cat"));
}

#[test]
fn test_nulls_placement_survives_descending() {
    // The null branch ignores direction; only `nulls` places them
    let rows = select("{name: p.name}")
        .from("p", people())
        .order_by("p.age")
        .desc()
        .nulls_last()
        .collect(params! {})
        .expect("query");
    assert_eq!(field(&rows[0], "name"), Value::text("ann"));
    assert_eq!(field(&rows[3], "name"), Value::text("cat"));
}

#[test]
fn test_stable_ties_keep_source_order() {
    let rows = select("{name: p.name}")
        .from("p", people())
        .where_("p.age === 25")
        .order_by("p.age")
        .asc()
        .collect(params! {})
        .expect("query");
    assert_eq!(names(&rows), vec![Value::text("bob"), Value::text("dan")]);
}

#[test]
fn test_consecutive_orderings_fuse_outermost_first() {
    // The later order_by is outermost and takes priority; the earlier one
    // breaks its ties
    let records = vec![
        record! { "name" => "a", "x" => 2, "y" => 1 },
        record! { "name" => "b", "x" => 1, "y" => 2 },
        record! { "name" => "c", "x" => 2, "y" => 2 },
        record! { "name" => "d", "x" => 1, "y" => 1 },
    ];
    let rows = select("{name: r.name}")
        .from("r", records)
        .order_by("r.x")
        .desc()
        .order_by("r.y")
        .asc()
        .collect(params! {})
        .expect("query");

    // Primary: y ascending; ties broken by x descending
    assert_eq!(
        names(&rows),
        vec![
            Value::text("a"),
            Value::text("d"),
            Value::text("c"),
            Value::text("b")
        ]
    );
}

#[test]
fn test_cross_type_order_follows_the_total_order() {
    let records = vec![
        record! { "name" => "text", "k" => "zzz" },
        record! { "name" => "number", "k" => 5 },
        record! { "name" => "sequence", "k" => Value::sequence(vec![Value::Number(0.0)]) },
    ];
    let rows = select("{name: r.name}")
        .from("r", records)
        .order_by("r.k")
        .asc()
        .collect(params! {})
        .expect("query");
    assert_eq!(
        names(&rows),
        vec![
            Value::text("number"),
            Value::text("text"),
            Value::text("sequence")
        ]
    );
}

#[test]
fn test_order_over_join_output() {
    let rows = select("{a: a.n, b: b.n}")
        .from("a", vec![record! { "n" => 1 }, record! { "n" => 2 }])
        .from("b", vec![record! { "n" => 10 }, record! { "n" => 20 }])
        .order_by("b.n - a.n")
        .desc()
        .collect(params! {})
        .expect("query");
    assert_eq!(field(&rows[0], "a"), Value::Number(1.0));
    assert_eq!(field(&rows[0], "b"), Value::Number(20.0));
}
