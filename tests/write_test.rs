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

//! Write Tests
//!
//! Insert, upsert, update and delete against the ordered key/value store
//! and in-memory collections; duplicate-key rollback; returning
//! projections; auto-increment key assignment.

use quarry::core::Record;
use quarry::{
    delete_from, insert, params, record, select, update, upsert, Error, KvStore, MemTable,
    SourceSpec, Value,
};

fn field(row: &Value, name: &str) -> Value {
    row.as_record()
        .unwrap_or_else(|| panic!("row is not a record: {}", row))
        .get_or_null(name)
}

fn book_store() -> KvStore {
    let store = KvStore::new("library");
    store
        .create_source(SourceSpec::keyed("books", "isbn"))
        .expect("create source");
    store
}

#[test]
fn test_insert_into_store() {
    let store = book_store();
    let written = insert(("{isbn: ?, title: ?}", [Value::from(1), Value::from("Ficciones")]))
        .into((&store, "books"))
        .collect(params! {})
        .expect("insert");
    assert_eq!(written.len(), 1);
    assert_eq!(field(&written[0], "title"), Value::text("Ficciones"));

    let rows = store.snapshot("books").expect("snapshot");
    assert_eq!(rows.len(), 1, "auto-commit persisted the row");
}

#[test]
fn test_insert_duplicate_key_rolls_back_the_batch() {
    let store = book_store();
    store
        .seed("books", [record! { "isbn" => 123456, "title" => "Existing" }])
        .expect("seed");

    // The first projected row is fine; the second collides. Nothing from
    // this statement may persist.
    let source = vec![
        record! { "isbn" => 777, "title" => "New" },
        record! { "isbn" => 123456, "title" => "Clash" },
    ];
    let err = insert("{isbn: row.isbn, title: row.title}")
        .from("row", source)
        .into((&store, "books"))
        .collect(params! {})
        .expect_err("duplicate key must fail");
    assert!(matches!(err, Error::DuplicateKey(_)), "got {:?}", err);

    let rows = store.snapshot("books").expect("snapshot");
    assert_eq!(rows.len(), 1, "the queued write before the clash rolled back");
    assert_eq!(rows[0].get_or_null("title"), Value::text("Existing"));
}

#[test]
fn test_upsert_overwrites() {
    let store = book_store();
    store
        .seed("books", [record! { "isbn" => 1, "title" => "Old" }])
        .expect("seed");

    upsert(("{isbn: 1, title: ?}", [Value::from("New")]))
        .into((&store, "books"))
        .collect(params! {})
        .expect("upsert");

    let rows = store.snapshot("books").expect("snapshot");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_or_null("title"), Value::text("New"));
}

#[test]
fn test_update_merges_into_prior_record() {
    let store = book_store();
    store
        .seed(
            "books",
            [
                record! { "isbn" => 1, "title" => "Ficciones", "stock" => 2 },
                record! { "isbn" => 2, "title" => "El Aleph", "stock" => 5 },
            ],
        )
        .expect("seed");

    update("{stock: book.stock + 10}")
        .from("book", (&store, "books"))
        .where_("book.isbn === 1")
        .into((&store, "books"))
        .collect(params! {})
        .expect("update");

    let rows = store.snapshot("books").expect("snapshot");
    assert_eq!(rows[0].get_or_null("stock"), Value::Number(12.0));
    assert_eq!(
        rows[0].get_or_null("title"),
        Value::text("Ficciones"),
        "untouched fields survive the shallow merge"
    );
    assert_eq!(rows[1].get_or_null("stock"), Value::Number(5.0));
}

#[test]
fn test_update_composite_key_preserves_the_key() {
    let store = KvStore::new("shop");
    store
        .create_source(SourceSpec::composite_keyed(
            "inventory",
            [quarry::KeyPath::parse("storeId"), quarry::KeyPath::parse("isbn")],
        ))
        .expect("create source");
    store
        .seed(
            "inventory",
            [record! { "storeId" => 1, "isbn" => 5, "quantity" => 3 }],
        )
        .expect("seed");

    update("{quantity: item.quantity - 1}")
        .from("item", (&store, "inventory"))
        .where_("item.storeId === 1 && item.isbn === 5")
        .into((&store, "inventory"))
        .collect(params! {})
        .expect("update");

    let rows = store.snapshot("inventory").expect("snapshot");
    assert_eq!(rows.len(), 1, "the row stayed under its composite key");
    assert_eq!(rows[0].get_or_null("quantity"), Value::Number(2.0));
}

#[test]
fn test_delete_from_store() {
    let store = book_store();
    store
        .seed(
            "books",
            [
                record! { "isbn" => 1, "title" => "Keep" },
                record! { "isbn" => 2, "title" => "Drop" },
            ],
        )
        .expect("seed");

    delete_from((&store, "books"))
        .from("book", (&store, "books"))
        .where_("book.isbn === 2")
        .collect(params! {})
        .expect("delete");

    let rows = store.snapshot("books").expect("snapshot");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_or_null("title"), Value::text("Keep"));
}

#[test]
fn test_returning_projects_written_rows() {
    let store = KvStore::new("notes");
    store
        .create_source(SourceSpec::keyed("notes", "id").auto_increment())
        .expect("create source");

    let rows = insert(("{text: ?}", [Value::from("hello")]))
        .into((&store, "notes"))
        .returning("{id: id, loud: text ++ '!'}")
        .collect(params! {})
        .expect("insert");

    assert_eq!(field(&rows[0], "id"), Value::Number(1.0), "store-assigned key");
    assert_eq!(field(&rows[0], "loud"), Value::text("hello!"));
}

#[test]
fn test_insert_into_mem_table() {
    let table = MemTable::new();
    insert(("{n: ?}", [7]))
        .into(table.clone())
        .collect(params! {})
        .expect("insert");
    assert_eq!(table.len(), 1);
    assert_eq!(
        table.rows()[0].read().get_or_null("n"),
        Value::Number(7.0)
    );
}

#[test]
fn test_update_mem_table_rows() {
    let table = MemTable::from_records([
        record! { "name" => "a", "hits" => 0 },
        record! { "name" => "b", "hits" => 0 },
    ]);

    update("{hits: row.hits + 1}")
        .from("row", table.clone())
        .where_("row.name === 'b'")
        .into(table.clone())
        .collect(params! {})
        .expect("update");

    let hits: Vec<Value> = table
        .rows()
        .iter()
        .map(|row| row.read().get_or_null("hits"))
        .collect();
    assert_eq!(hits, vec![Value::Number(0.0), Value::Number(1.0)]);
}

#[test]
fn test_delete_from_mem_table() {
    let table = MemTable::from_records([
        record! { "name" => "a" },
        record! { "name" => "b" },
    ]);

    delete_from(table.clone())
        .from("row", table.clone())
        .where_("row.name === 'a'")
        .collect(params! {})
        .expect("delete");

    assert_eq!(table.len(), 1);
    assert_eq!(
        table.rows()[0].read().get_or_null("name"),
        Value::text("b")
    );
}

#[test]
fn test_write_reads_do_not_observe_own_writes() {
    // The write materialises its input before mutating, so inserting a
    // table into itself does not loop
    let table = MemTable::from_records([record! { "n" => 1 }, record! { "n" => 2 }]);

    insert("{n: row.n + 10}")
        .from("row", table.clone())
        .into(table.clone())
        .collect(params! {})
        .expect("insert");

    assert_eq!(table.len(), 4);
}

#[test]
fn test_insert_select_between_stores_is_rejected() {
    let a = book_store();
    let b = KvStore::new("other");
    b.create_source(SourceSpec::keyed("books", "isbn"))
        .expect("create source");

    let err = insert("{isbn: book.isbn}")
        .from("book", (&a, "books"))
        .into((&b, "books"))
        .collect(params! {})
        .expect_err("two stores in one query must fail");
    assert!(matches!(err, Error::MultipleStores(_, _)), "got {:?}", err);
}

#[test]
fn test_missing_key_is_a_stream_error() {
    let store = book_store();
    let err = insert("{title: 'No key'}")
        .into((&store, "books"))
        .collect(params! {})
        .expect_err("missing key must fail");
    assert!(matches!(err, Error::MissingKey(_)), "got {:?}", err);
}
