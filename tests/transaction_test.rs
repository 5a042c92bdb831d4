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

//! Transaction Tests
//!
//! Explicit transactions shared across queries, read-your-writes through
//! the staged overlay, abort discarding, settled-transaction rejection,
//! and the two-tick idle auto-completion.

use quarry::api::begin;
use quarry::txn::ticks;
use quarry::{
    insert, params, record, select, upsert, Error, KvStore, SourceSpec, Transaction, TxMode, Value,
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
fn test_chained_queries_share_one_transaction() {
    let store = book_store();
    let txn = begin(&store, &["books"], TxMode::ReadWrite).expect("begin");

    insert(("{isbn: 1, title: ?}", [Value::from("Ficciones")]))
        .into((&store, "books"))
        .query_in(params! {}, Some(txn.clone()))
        .expect("insert")
        .collect()
        .expect("rows");

    // The write is visible through the shared transaction...
    let seen = select("{title: book.title}")
        .from("book", (&store, "books"))
        .query_in(params! {}, Some(txn.clone()))
        .expect("select")
        .collect()
        .expect("rows");
    assert_eq!(seen.len(), 1);
    assert_eq!(field(&seen[0], "title"), Value::text("Ficciones"));

    // ...but not outside until completion
    assert_eq!(store.snapshot("books").expect("snapshot").len(), 0);

    txn.complete(Value::Null).expect("complete");
    assert_eq!(store.snapshot("books").expect("snapshot").len(), 1);
}

#[test]
fn test_explicit_abort_discards_writes() {
    let store = book_store();
    let txn = begin(&store, &["books"], TxMode::ReadWrite).expect("begin");

    insert(("{isbn: 1, title: ?}", [Value::from("Doomed")]))
        .into((&store, "books"))
        .query_in(params! {}, Some(txn.clone()))
        .expect("insert")
        .collect()
        .expect("rows");

    txn.abort(Error::Store("changed my mind".to_string()));
    assert_eq!(store.snapshot("books").expect("snapshot").len(), 0);
}

#[test]
fn test_settled_transaction_is_rejected() {
    let store = book_store();
    let txn = begin(&store, &["books"], TxMode::ReadWrite).expect("begin");
    txn.complete(Value::Null).expect("complete");

    let err = select("{title: book.title}")
        .from("book", (&store, "books"))
        .query_in(params! {}, Some(txn))
        .expect("query builds")
        .collect()
        .expect_err("settled transaction must be rejected");
    assert_eq!(err, Error::TransactionSettled);
}

#[test]
fn test_implicit_transaction_auto_commits_on_idle() {
    let store = book_store();

    // query() without an explicit transaction opens one per execution and
    // commits it two ticks after going idle; collect pumps those ticks.
    upsert(("{isbn: 9, title: ?}", [Value::from("Idle")]))
        .into((&store, "books"))
        .collect(params! {})
        .expect("upsert");

    assert_eq!(store.snapshot("books").expect("snapshot").len(), 1);
}

#[test]
fn test_delay_complete_holds_across_rearm() {
    let txn = Transaction::new();
    txn.delay_complete();
    ticks::tick();
    assert!(!txn.is_settled(), "one tick is not idle enough");

    // Re-arming between the two ticks keeps the transaction open
    txn.delay_complete();
    ticks::tick();
    assert!(!txn.is_settled());

    ticks::pump();
    assert!(txn.is_settled(), "idle after the second tick completes it");
}

#[test]
fn test_completion_hooks_fire_once() {
    let store = book_store();
    let txn = begin(&store, &["books"], TxMode::ReadWrite).expect("begin");

    let fired = std::rc::Rc::new(std::cell::Cell::new(0));
    let counter = fired.clone();
    txn.on_complete(move |_| counter.set(counter.get() + 1));

    txn.complete(Value::Null).expect("complete");
    txn.complete(Value::Null).expect("idempotent");
    assert_eq!(fired.get(), 1);
}

#[test]
fn test_stream_error_aborts_the_transaction() {
    let store = book_store();
    store
        .seed("books", [record! { "isbn" => 1, "title" => "Existing" }])
        .expect("seed");

    let txn = begin(&store, &["books"], TxMode::ReadWrite).expect("begin");
    let aborted = std::rc::Rc::new(std::cell::Cell::new(false));
    let flag = aborted.clone();
    txn.on_abort(move |_| flag.set(true));

    let result = insert("{isbn: 1, title: 'Clash'}")
        .into((&store, "books"))
        .query_in(params! {}, Some(txn.clone()))
        .expect("query builds")
        .collect();

    assert!(result.is_err());
    assert!(aborted.get(), "the error crossing the envelope aborted");
    assert!(txn.is_settled());
}
