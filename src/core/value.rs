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

//! Value type for Quarry - the ordered runtime value domain
//!
//! This module provides the unified `Value` enum and the total order every
//! comparison in the engine goes through: key extraction, range bounds,
//! predicate evaluation, ordering and grouping all compare with
//! [`Value::total_cmp`]. Cross-type comparisons follow the fixed sequence
//! `Null < Bool < Number < Timestamp < Text < Sequence < Record`; within a
//! type the natural order applies.
//!
//! `next_up` produces the least value strictly greater than its input,
//! which the range algebra uses to rewrite closed upper bounds into the
//! half-open form native cursors understand.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::error::{Error, Result};
use super::record::Record;

/// A runtime value
///
/// Text and Sequence use `Arc` for cheap cloning: rows are cloned on every
/// tuple merge and scan step.
#[derive(Debug, Clone)]
pub enum Value {
    /// Null / absent
    Null,

    /// Boolean value
    Bool(bool),

    /// Finite 64-bit floating point number (integers included)
    Number(f64),

    /// Timestamp (UTC)
    Timestamp(DateTime<Utc>),

    /// UTF-8 text string
    Text(Arc<str>),

    /// Ordered sequence of values
    Sequence(Arc<Vec<Value>>),

    /// String-keyed record
    Record(Arc<Record>),
}

impl Value {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a number value
    pub fn number(value: impl Into<f64>) -> Self {
        Value::Number(value.into())
    }

    /// Create a text value
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(Arc::from(value.into().as_str()))
    }

    /// Create a timestamp value
    pub fn timestamp(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }

    /// Create a sequence value
    pub fn sequence(values: impl Into<Vec<Value>>) -> Self {
        Value::Sequence(Arc::new(values.into()))
    }

    /// Create a record value
    pub fn record(record: Record) -> Self {
        Value::Record(Arc::new(record))
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Human-readable type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Timestamp(_) => "timestamp",
            Value::Text(_) => "text",
            Value::Sequence(_) => "sequence",
            Value::Record(_) => "record",
        }
    }

    /// Whether this value is null/absent
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness for boolean contexts (`&&`, `||`, predicates)
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Text(s) => !s.is_empty(),
            Value::Timestamp(_) | Value::Sequence(_) | Value::Record(_) => true,
        }
    }

    /// Numeric view, if this value is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Text view, if this value is text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Record view, if this value is a record
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Sequence view, if this value is a sequence
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value may serve as a key or key component
    ///
    /// Keys are numbers, timestamps, text, and sequences of keys; null,
    /// booleans and records are not orderable key material.
    pub fn is_valid_key(&self) -> bool {
        match self {
            Value::Number(_) | Value::Timestamp(_) | Value::Text(_) => true,
            Value::Sequence(items) => items.iter().all(Value::is_valid_key),
            Value::Null | Value::Bool(_) | Value::Record(_) => false,
        }
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    /// Rank of the type in the cross-type order
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Text(_) => 4,
            Value::Sequence(_) => 5,
            Value::Record(_) => 6,
        }
    }

    /// The total order over the value domain
    ///
    /// Every value is comparable to every other; this is the `cmp` exposed
    /// to expressions and the order all indexes and ranges use.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => cmp_numbers(*a, *b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Sequence(a), Value::Sequence(b)) => cmp_sequences(a, b),
            (Value::Record(a), Value::Record(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }

    /// The least value strictly greater than `self` in the total order
    ///
    /// Defined over the key domain: numbers step to the next representable
    /// float (`+inf` crosses into the earliest timestamp), timestamps step
    /// one millisecond (the maximum timestamp crosses into the empty
    /// string), strings append a NUL, sequences append the least key.
    pub fn next_up(&self) -> Result<Value> {
        match self {
            Value::Number(n) => {
                if *n == f64::INFINITY {
                    Ok(Value::Timestamp(DateTime::<Utc>::MIN_UTC))
                } else {
                    Ok(Value::Number(float_next_up(*n)))
                }
            }
            Value::Timestamp(ts) => {
                if *ts == DateTime::<Utc>::MAX_UTC {
                    Ok(Value::text(""))
                } else {
                    let stepped = ts
                        .checked_add_signed(Duration::milliseconds(1))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    Ok(Value::Timestamp(stepped))
                }
            }
            Value::Text(s) => {
                let mut next = s.to_string();
                next.push('\0');
                Ok(Value::text(next))
            }
            Value::Sequence(items) => {
                let mut next = items.as_ref().clone();
                next.push(Value::Number(f64::NEG_INFINITY));
                Ok(Value::sequence(next))
            }
            other => Err(Error::InvalidKey(other.type_name())),
        }
    }
}

/// Number order: finite floats naturally, `-0.0 == 0.0`, NaN greatest
fn cmp_numbers(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Sequence order: elementwise, then shorter sorts first
fn cmp_sequences(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.total_cmp(y) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    a.len().cmp(&b.len())
}

/// Next representable float above `x`
fn float_next_up(x: f64) -> f64 {
    if x.is_nan() || x == f64::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f64::from_bits(1);
    }
    let bits = x.to_bits();
    if x > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

/// Canonical bit pattern for hashing floats consistently with equality
fn canonical_bits(n: f64) -> u64 {
    if n.is_nan() {
        f64::NAN.to_bits()
    } else if n == 0.0 {
        0u64
    } else {
        n.to_bits()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.total_cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Value::Number(n) => {
                state.write_u8(2);
                state.write_u64(canonical_bits(*n));
            }
            Value::Timestamp(ts) => {
                state.write_u8(3);
                ts.timestamp_millis().hash(state);
            }
            Value::Text(s) => {
                state.write_u8(4);
                s.hash(state);
            }
            Value::Sequence(items) => {
                state.write_u8(5);
                for item in items.iter() {
                    item.hash(state);
                }
            }
            Value::Record(r) => {
                state.write_u8(6);
                r.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record(r) => write!(f, "{}", r),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value as f64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Number(value as f64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::text(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::sequence(value)
    }
}

impl From<Record> for Value {
    fn from(value: Record) -> Self {
        Value::record(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
