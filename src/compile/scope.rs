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

//! The standard scope
//!
//! Functions expressions may call without declaring a dependency: `cmp`
//! (the total comparator) and the tagged aggregates avg/count/max/min/sum.
//! Aggregate state is a `(state, value) -> state'` fold threaded through
//! the group-state array; nulls never contribute.

use std::cmp::Ordering;

use crate::core::{Error, Result, Value};
use crate::parser::AggregateKind;

/// Whether a name resolves in the standard scope
pub fn is_scope_name(name: &str) -> bool {
    name == "cmp" || AggregateKind::from_name(name).is_some()
}

/// Call a non-aggregate scope function
pub fn call_builtin(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "cmp" => {
            if args.len() != 2 {
                return Err(Error::eval(format!(
                    "cmp expects 2 arguments, got {}",
                    args.len()
                )));
            }
            let ord = match args[0].total_cmp(&args[1]) {
                Ordering::Less => -1.0,
                Ordering::Equal => 0.0,
                Ordering::Greater => 1.0,
            };
            Ok(Value::Number(ord))
        }
        other => Err(Error::eval(format!("'{}' is not callable", other))),
    }
}

// ============================================================================
// Aggregate state
// ============================================================================

/// Per-slot aggregate state
///
/// One entry per aggregate call site, held in the group-state array and
/// updated every time the selector runs over a tuple of the group.
#[derive(Debug, Clone)]
pub enum AggState {
    Avg { sum: f64, count: f64 },
    Count(f64),
    Max(Option<Value>),
    Min(Option<Value>),
    Sum(Option<f64>),
}

impl AggState {
    /// Fresh state for an aggregate kind
    pub fn new(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Avg => AggState::Avg {
                sum: 0.0,
                count: 0.0,
            },
            AggregateKind::Count => AggState::Count(0.0),
            AggregateKind::Max => AggState::Max(None),
            AggregateKind::Min => AggState::Min(None),
            AggregateKind::Sum => AggState::Sum(None),
        }
    }

    /// Fold one row's argument values into the state
    pub fn update(&mut self, args: &[Value]) -> Result<()> {
        let arg = args.first();
        match self {
            AggState::Count(count) => {
                // count() counts rows; count(x) counts non-null x
                match arg {
                    Some(Value::Null) => {}
                    _ => *count += 1.0,
                }
            }
            AggState::Sum(sum) => {
                if let Some(v) = arg {
                    if !v.is_null() {
                        let n = v.as_number().ok_or_else(|| {
                            Error::eval(format!("sum over non-number {}", v.type_name()))
                        })?;
                        *sum = Some(sum.unwrap_or(0.0) + n);
                    }
                }
            }
            AggState::Avg { sum, count } => {
                if let Some(v) = arg {
                    if !v.is_null() {
                        let n = v.as_number().ok_or_else(|| {
                            Error::eval(format!("avg over non-number {}", v.type_name()))
                        })?;
                        *sum += n;
                        *count += 1.0;
                    }
                }
            }
            AggState::Max(best) => {
                if let Some(v) = arg {
                    if !v.is_null() {
                        let better = match best {
                            Some(current) => v.total_cmp(current) == Ordering::Greater,
                            None => true,
                        };
                        if better {
                            *best = Some(v.clone());
                        }
                    }
                }
            }
            AggState::Min(best) => {
                if let Some(v) = arg {
                    if !v.is_null() {
                        let better = match best {
                            Some(current) => v.total_cmp(current) == Ordering::Less,
                            None => true,
                        };
                        if better {
                            *best = Some(v.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The current aggregate value
    pub fn value(&self) -> Value {
        match self {
            AggState::Count(count) => Value::Number(*count),
            AggState::Sum(sum) => sum.map(Value::Number).unwrap_or(Value::Null),
            AggState::Avg { sum, count } => {
                if *count == 0.0 {
                    Value::Null
                } else {
                    Value::Number(sum / count)
                }
            }
            AggState::Max(best) | AggState::Min(best) => {
                best.clone().unwrap_or(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_skips_nulls() {
        let mut state = AggState::new(AggregateKind::Sum);
        for v in [Value::Number(1.0), Value::Null, Value::Number(2.0)] {
            state.update(&[v]).expect("update");
        }
        assert_eq!(state.value(), Value::Number(3.0));
    }

    #[test]
    fn test_sum_of_nothing_is_null() {
        let mut state = AggState::new(AggregateKind::Sum);
        state.update(&[Value::Null]).expect("update");
        assert_eq!(state.value(), Value::Null);
    }

    #[test]
    fn test_count_rows_vs_values() {
        let mut rows = AggState::new(AggregateKind::Count);
        let mut values = AggState::new(AggregateKind::Count);
        for v in [Value::Number(1.0), Value::Null] {
            rows.update(&[]).expect("update");
            values.update(&[v]).expect("update");
        }
        assert_eq!(rows.value(), Value::Number(2.0));
        assert_eq!(values.value(), Value::Number(1.0));
    }

    #[test]
    fn test_avg_and_extremes() {
        let mut avg = AggState::new(AggregateKind::Avg);
        let mut max = AggState::new(AggregateKind::Max);
        let mut min = AggState::new(AggregateKind::Min);
        for n in [4.0, 8.0, 6.0] {
            avg.update(&[Value::Number(n)]).expect("update");
            max.update(&[Value::Number(n)]).expect("update");
            min.update(&[Value::Number(n)]).expect("update");
        }
        assert_eq!(avg.value(), Value::Number(6.0));
        assert_eq!(max.value(), Value::Number(8.0));
        assert_eq!(min.value(), Value::Number(4.0));
    }

    #[test]
    fn test_cmp_builtin() {
        let out = call_builtin("cmp", &[Value::Number(1.0), Value::text("a")]).expect("cmp");
        assert_eq!(out, Value::Number(-1.0), "numbers sort below text");
    }
}
