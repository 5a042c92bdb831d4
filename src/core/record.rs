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

//! Records, tuples and key paths
//!
//! A [`Record`] is the string-keyed row unit every source yields. A
//! [`Tuple`] is what flows through the executor: one bound record per
//! source name in scope, or a single anonymous row after a projection.
//! For keyless stores the primary key rides on the record as an explicit
//! field rather than an overloaded attribute.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use smallvec::SmallVec;

use super::value::Value;

// ============================================================================
// KeyPath
// ============================================================================

/// A dotted path into a record (`a` or `a.b.c`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath(pub SmallVec<[String; 2]>);

impl KeyPath {
    /// Parse a dotted path
    pub fn parse(path: &str) -> Self {
        KeyPath(path.split('.').map(str::to_string).collect())
    }

    /// Build a path from segments
    pub fn from_segments(segments: impl IntoIterator<Item = String>) -> Self {
        KeyPath(segments.into_iter().collect())
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::parse(path)
    }
}

// ============================================================================
// Record
// ============================================================================

/// A string-keyed record
///
/// Fields are kept ordered so structural equality, hashing and the record
/// leg of the value total order are deterministic. The primary-key slot
/// is carried metadata, not part of the mapping: it never participates in
/// structural equality or ordering.
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: BTreeMap<String, Value>,
    /// Primary key of a record read from a keyless source, or the row
    /// identity of a record read from an in-memory collection
    primary_key: Option<Value>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for Record {}

impl std::hash::Hash for Record {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for (name, value) in &self.fields {
            name.hash(state);
            value.hash(state);
        }
    }
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Record::default()
    }

    /// Create a record from field pairs
    pub fn from_fields(fields: impl IntoIterator<Item = (String, Value)>) -> Self {
        Record {
            fields: fields.into_iter().collect(),
            primary_key: None,
        }
    }

    /// Get a field; absent fields read as nothing, not an error
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get a field as a value, absent mapping to null
    pub fn get_or_null(&self, name: &str) -> Value {
        self.fields.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Set a field
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Remove a field
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Whether the field exists
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Iterate fields in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Shallow merge: `other`'s fields override this record's
    pub fn merged_with(&self, other: &Record) -> Record {
        let mut out = self.clone();
        for (name, value) in other.iter() {
            out.set(name.clone(), value.clone());
        }
        if other.primary_key.is_some() {
            out.primary_key = other.primary_key.clone();
        }
        out
    }

    /// Walk a key path; missing segments read as null
    pub fn extract(&self, path: &KeyPath) -> Value {
        let mut current: Option<&Value> = None;
        for (i, segment) in path.segments().iter().enumerate() {
            let field = if i == 0 {
                self.get(segment)
            } else {
                match current {
                    Some(Value::Record(r)) => r.get(segment),
                    _ => None,
                }
            };
            match field {
                Some(v) => current = Some(v),
                None => return Value::Null,
            }
        }
        current.cloned().unwrap_or(Value::Null)
    }

    /// Write a value at a key path, creating intermediate records
    pub fn set_path(&mut self, path: &KeyPath, value: Value) {
        let segments = path.segments();
        if segments.len() == 1 {
            self.set(segments[0].clone(), value);
            return;
        }
        let mut nested = match self.get(&segments[0]) {
            Some(Value::Record(r)) => r.as_ref().clone(),
            _ => Record::new(),
        };
        nested.set_path(&KeyPath::from_segments(segments[1..].iter().cloned()), value);
        self.set(segments[0].clone(), Value::record(nested));
    }

    /// The explicit primary key of a keyless-store record
    pub fn primary_key(&self) -> Option<&Value> {
        self.primary_key.as_ref()
    }

    /// Attach the primary key of a keyless-store record
    pub fn set_primary_key(&mut self, key: Value) {
        self.primary_key = Some(key);
    }

    /// Drop the carried primary key
    pub fn clear_primary_key(&mut self) {
        self.primary_key = None;
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        // Field-pair lexicographic order; the shorter record sorts first
        let mut a = self.fields.iter();
        let mut b = other.fields.iter();
        loop {
            match (a.next(), b.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some((ka, va)), Some((kb, vb))) => match ka.cmp(kb).then_with(|| va.cmp(vb)) {
                    Ordering::Equal => continue,
                    ord => return ord,
                },
            }
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Record::from_fields(iter)
    }
}

/// Build a [`Record`] from `"field" => value` pairs
#[macro_export]
macro_rules! record {
    () => { $crate::core::Record::new() };
    ( $($name:expr => $value:expr),+ $(,)? ) => {{
        let mut record = $crate::core::Record::new();
        $( record.set($name, $crate::core::Value::from($value)); )+
        record
    }};
}

// ============================================================================
// Tuple
// ============================================================================

/// The sentinel record an outer/anti join emits for a missing right side
pub fn otherwise_record() -> Value {
    let mut r = Record::new();
    r.set("otherwise", Value::Bool(true));
    Value::record(r)
}

/// The aggregate row flowing through the executor
///
/// Named tuples carry one record per source name in scope; a tuple's key
/// set always equals exactly the sources in scope at that point. Anonymous
/// tuples carry the output row of a projection, grouping or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tuple {
    /// One bound record per source name
    Named(BTreeMap<String, Value>),
    /// An anonymous output row
    Anon(Value),
}

impl Tuple {
    /// The empty named tuple
    pub fn empty() -> Self {
        Tuple::Named(BTreeMap::new())
    }

    /// A named tuple from (source, record) pairs
    pub fn named(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Tuple::Named(entries.into_iter().collect())
    }

    /// An anonymous tuple
    pub fn anon(row: Value) -> Self {
        Tuple::Anon(row)
    }

    /// Whether this tuple carries named sources
    pub fn is_named(&self) -> bool {
        matches!(self, Tuple::Named(_))
    }

    /// The record bound to a source name
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Tuple::Named(entries) => entries.get(name),
            Tuple::Anon(_) => None,
        }
    }

    /// The anonymous row, if any
    pub fn row(&self) -> Option<&Value> {
        match self {
            Tuple::Anon(row) => Some(row),
            Tuple::Named(_) => None,
        }
    }

    /// Bind a record under a source name, returning the extended tuple
    pub fn with(&self, name: impl Into<String>, record: Value) -> Tuple {
        let mut entries = match self {
            Tuple::Named(entries) => entries.clone(),
            // An anonymous tuple has no names to extend; binding over it is
            // an internal bug upstream, but stay total.
            Tuple::Anon(_) => BTreeMap::new(),
        };
        entries.insert(name.into(), record);
        Tuple::Named(entries)
    }

    /// Union of two named tuples; `other` wins on collisions
    pub fn merge(&self, other: &Tuple) -> Tuple {
        match (self, other) {
            (Tuple::Named(a), Tuple::Named(b)) => {
                let mut entries = a.clone();
                for (name, record) in b {
                    entries.insert(name.clone(), record.clone());
                }
                Tuple::Named(entries)
            }
            (_, anon @ Tuple::Anon(_)) => anon.clone(),
            (anon @ Tuple::Anon(_), _) => anon.clone(),
        }
    }

    /// Source names bound in this tuple
    pub fn names(&self) -> Vec<&str> {
        match self {
            Tuple::Named(entries) => entries.keys().map(String::as_str).collect(),
            Tuple::Anon(_) => Vec::new(),
        }
    }

    /// Structural key used by dedup and group-by
    pub fn to_value(&self) -> Value {
        match self {
            Tuple::Named(entries) => {
                let record: Record = entries
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                Value::record(record)
            }
            Tuple::Anon(row) => row.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_nested_path() {
        let inner = record! { "b" => 7 };
        let outer = record! { "a" => Value::record(inner) };
        assert_eq!(outer.extract(&KeyPath::parse("a.b")), Value::Number(7.0));
        assert_eq!(outer.extract(&KeyPath::parse("a.c")), Value::Null);
        assert_eq!(outer.extract(&KeyPath::parse("x")), Value::Null);
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut r = Record::new();
        r.set_path(&KeyPath::parse("a.b"), Value::Number(1.0));
        assert_eq!(r.extract(&KeyPath::parse("a.b")), Value::Number(1.0));
    }

    #[test]
    fn test_merged_with_overrides() {
        let base = record! { "a" => 1, "b" => 2 };
        let patch = record! { "b" => 3, "c" => 4 };
        let merged = base.merged_with(&patch);
        assert_eq!(merged.get_or_null("a"), Value::Number(1.0));
        assert_eq!(merged.get_or_null("b"), Value::Number(3.0));
        assert_eq!(merged.get_or_null("c"), Value::Number(4.0));
    }

    #[test]
    fn test_tuple_merge_prefers_right() {
        let left = Tuple::empty().with("a", Value::record(record! { "x" => 1 }));
        let right = Tuple::empty().with("a", Value::record(record! { "x" => 2 }));
        let merged = left.merge(&right);
        let a = merged.get("a").expect("merged tuple keeps the binding");
        assert_eq!(
            a.as_record().expect("a is a record").get_or_null("x"),
            Value::Number(2.0)
        );
    }

    #[test]
    fn test_tuple_structural_key_is_stable() {
        let t1 = Tuple::empty()
            .with("a", Value::record(record! { "x" => 1 }))
            .with("b", Value::record(record! { "y" => 2 }));
        let t2 = Tuple::empty()
            .with("b", Value::record(record! { "y" => 2 }))
            .with("a", Value::record(record! { "x" => 1 }));
        assert_eq!(t1.to_value(), t2.to_value());
    }
}
