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

//! Expression evaluation
//!
//! A tree-walking interpreter over normalized expressions. Evaluation is
//! deterministic and side-effect free except for aggregate nodes, which
//! fold their arguments into the group-state array and read the slot's
//! current value. Errors propagate as query errors.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::core::{Error, Record, Result, Tuple, Value};
use crate::parser::{BinaryOp, CompareOp, Expr, RecordEntry, UnaryOp};

use super::scope::{call_builtin, AggState};
use super::CompiledExpr;

/// Everything an expression may read during evaluation
pub struct EvalCtx<'a> {
    /// The current tuple
    pub tuple: &'a Tuple,
    /// The parameter record (`$name` accesses)
    pub params: &'a Record,
    /// The substitution table (`$$subs[i]` references)
    pub subs: &'a [Value],
    /// Group state for aggregate slots, when grouping
    pub state: Option<&'a RefCell<Vec<AggState>>>,
    /// Records frozen in by `partial`, shadowing the tuple
    pub bound: Option<&'a BTreeMap<String, Value>>,
}

impl<'a> EvalCtx<'a> {
    /// A context with no parameters, substitutions or group state
    pub fn bare(tuple: &'a Tuple, params: &'a Record) -> Self {
        EvalCtx {
            tuple,
            params,
            subs: &[],
            state: None,
            bound: None,
        }
    }
}

/// Evaluate a compiled expression against a context
pub fn eval_compiled(compiled: &CompiledExpr, cx: &EvalCtx) -> Result<Value> {
    let cx = EvalCtx {
        tuple: cx.tuple,
        params: cx.params,
        subs: &compiled.subs,
        state: cx.state,
        bound: if compiled.bound.is_empty() {
            cx.bound
        } else {
            Some(&compiled.bound)
        },
    };
    eval(&compiled.expr, &cx)
}

/// Evaluate a normalized expression
pub fn eval(expr: &Expr, cx: &EvalCtx) -> Result<Value> {
    let mut env = Vec::new();
    eval_env(expr, cx, &mut env)
}

type Env = Vec<(String, Value)>;

fn eval_env(expr: &Expr, cx: &EvalCtx, env: &mut Env) -> Result<Value> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Str(s) => Ok(Value::text(s.clone())),

        Expr::Ident(name) => lookup_ident(name, cx, env),

        Expr::This => Err(Error::Internal(
            "un-normalized `this` reached evaluation".to_string(),
        )),

        Expr::ThisRow => match cx.tuple.row() {
            Some(row) => Ok(row.clone()),
            None => Err(Error::eval("no implicit row in a named tuple context")),
        },

        Expr::Param(name) => Ok(cx.params.get_or_null(name)),

        Expr::SubsRef(i) => cx.subs.get(*i).cloned().ok_or_else(|| {
            Error::Internal(format!("substitution index {} out of range", i))
        }),

        Expr::Record(entries) => {
            let mut record = Record::new();
            for entry in entries {
                match entry {
                    RecordEntry::Field(name, e) => {
                        record.set(name.clone(), eval_env(e, cx, env)?);
                    }
                    RecordEntry::Shorthand(name) => {
                        record.set(name.clone(), lookup_ident(name, cx, env)?);
                    }
                    RecordEntry::Spread(e) => match eval_env(e, cx, env)? {
                        Value::Record(r) => {
                            for (name, value) in r.iter() {
                                record.set(name.clone(), value.clone());
                            }
                            // The primary-key sentinel rides along so a
                            // spread-merge keeps the row identifiable
                            if let Some(key) = r.primary_key() {
                                record.set_primary_key(key.clone());
                            }
                        }
                        Value::Null => {}
                        other => {
                            return Err(Error::eval(format!(
                                "cannot spread a {}",
                                other.type_name()
                            )))
                        }
                    },
                }
            }
            Ok(Value::record(record))
        }

        Expr::Sequence(items) => {
            let values = items
                .iter()
                .map(|item| eval_env(item, cx, env))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::sequence(values))
        }

        Expr::Member(base, field) => {
            let base = eval_env(base, cx, env)?;
            match base {
                Value::Record(r) => Ok(r.get_or_null(field)),
                Value::Null => Err(Error::eval(format!(
                    "cannot read field '{}' of null",
                    field
                ))),
                other => Err(Error::eval(format!(
                    "cannot read field '{}' of a {}",
                    field,
                    other.type_name()
                ))),
            }
        }

        Expr::Index(base, index) => {
            let base = eval_env(base, cx, env)?;
            let index = eval_env(index, cx, env)?;
            match (&base, &index) {
                (Value::Sequence(items), Value::Number(n)) => {
                    let i = *n as usize;
                    if n.fract() == 0.0 && *n >= 0.0 && i < items.len() {
                        Ok(items[i].clone())
                    } else {
                        Ok(Value::Null)
                    }
                }
                (Value::Record(r), Value::Text(name)) => Ok(r.get_or_null(name)),
                _ => Err(Error::eval(format!(
                    "cannot index a {} with a {}",
                    base.type_name(),
                    index.type_name()
                ))),
            }
        }

        Expr::Call(callee, args) => match callee.as_ref() {
            Expr::Lambda(params, body) => {
                if params.len() != args.len() {
                    return Err(Error::eval(format!(
                        "lambda expects {} argument(s), got {}",
                        params.len(),
                        args.len()
                    )));
                }
                let depth = env.len();
                for (param, arg) in params.iter().zip(args) {
                    let value = eval_env(arg, cx, env)?;
                    env.push((param.clone(), value));
                }
                let out = eval_env(body, cx, env);
                env.truncate(depth);
                out
            }
            Expr::Ident(name) if !is_env_bound(name, env) => {
                let values = args
                    .iter()
                    .map(|arg| eval_env(arg, cx, env))
                    .collect::<Result<Vec<_>>>()?;
                call_builtin(name, &values)
            }
            other => Err(Error::eval(format!("'{}' is not callable", other))),
        },

        Expr::Lambda(_, _) => Err(Error::eval("a lambda is not a value")),

        Expr::Unary(UnaryOp::Not, operand) => {
            let v = eval_env(operand, cx, env)?;
            Ok(Value::Bool(!v.truthy()))
        }
        Expr::Unary(UnaryOp::Neg, operand) => {
            let v = eval_env(operand, cx, env)?;
            match v.as_number() {
                Some(n) => Ok(Value::Number(-n)),
                None => Err(Error::eval(format!("cannot negate a {}", v.type_name()))),
            }
        }

        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let l = eval_env(lhs, cx, env)?;
            if l.truthy() {
                eval_env(rhs, cx, env)
            } else {
                Ok(l)
            }
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let l = eval_env(lhs, cx, env)?;
            if l.truthy() {
                Ok(l)
            } else {
                eval_env(rhs, cx, env)
            }
        }

        Expr::Binary(op, lhs, rhs) => {
            let l = eval_env(lhs, cx, env)?;
            let r = eval_env(rhs, cx, env)?;
            eval_binary(*op, l, r)
        }

        Expr::Compare { op, lhs, rhs } => {
            let l = eval_env(lhs, cx, env)?;
            let r = eval_env(rhs, cx, env)?;
            let ord = l.total_cmp(&r);
            let hit = match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
            };
            Ok(Value::Bool(hit))
        }

        Expr::Aggregate { slot, kind, args } => {
            let Some(state) = cx.state else {
                return Err(Error::eval(format!(
                    "aggregate '{}' outside a grouping context",
                    kind.name()
                )));
            };
            let values = args
                .iter()
                .map(|arg| eval_env(arg, cx, env))
                .collect::<Result<Vec<_>>>()?;
            let mut state = state.borrow_mut();
            while state.len() <= *slot {
                state.push(AggState::new(*kind));
            }
            state[*slot].update(&values)?;
            Ok(state[*slot].value())
        }
    }
}

fn lookup_ident(name: &str, cx: &EvalCtx, env: &Env) -> Result<Value> {
    // Innermost lambda binding wins
    for (bound, value) in env.iter().rev() {
        if bound == name {
            return Ok(value.clone());
        }
    }
    if let Some(bound) = cx.bound {
        if let Some(value) = bound.get(name) {
            return Ok(value.clone());
        }
    }
    if let Some(value) = cx.tuple.get(name) {
        return Ok(value.clone());
    }
    Err(Error::eval(format!(
        "'{}' is not bound in this tuple",
        name
    )))
}

fn is_env_bound(name: &str, env: &Env) -> bool {
    env.iter().any(|(bound, _)| bound == name)
}

fn eval_binary(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    match op {
        BinaryOp::Add => match (&l, &r) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::Text(_), _) | (_, Value::Text(_)) => {
                Ok(Value::text(format!("{}{}", stringify(&l), stringify(&r))))
            }
            _ => Err(Error::eval(format!(
                "cannot add {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
        BinaryOp::Concat => Ok(Value::text(format!("{}{}", stringify(&l), stringify(&r)))),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Some(a), Some(b)) = (l.as_number(), r.as_number()) else {
                return Err(Error::eval(format!(
                    "arithmetic over {} and {}",
                    l.type_name(),
                    r.type_name()
                )));
            };
            let out = match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                _ => unreachable!(),
            };
            Ok(Value::Number(out))
        }
        BinaryOp::Ne => Ok(Value::Bool(l.total_cmp(&r) != Ordering::Equal)),
        // Comparison operators are rewritten to Compare during
        // normalization; evaluate equivalently if one slips through.
        BinaryOp::Eq => Ok(Value::Bool(l.total_cmp(&r) == Ordering::Equal)),
        BinaryOp::Lt => Ok(Value::Bool(l.total_cmp(&r) == Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(l.total_cmp(&r) != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(l.total_cmp(&r) == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(l.total_cmp(&r) != Ordering::Less)),
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit forms handled above"),
    }
}

/// Text rendering for concatenation; strings render raw
fn stringify(v: &Value) -> String {
    match v {
        Value::Text(s) => s.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{compile_expr, CompileOptions, CompileSchema, Schema, SourceId, Template};
    use crate::record;

    fn eval_str(source: &str, tuple: &Tuple, params: &Record) -> Result<Value> {
        let schema: Schema = tuple
            .names()
            .into_iter()
            .map(|n| (n.to_string(), SourceId::fresh()))
            .collect();
        let compiled = compile_expr(
            &Template::new(source),
            &CompileSchema::Known(&schema),
            CompileOptions {
                allow_aggregates: true,
            },
        )?;
        let cx = EvalCtx::bare(tuple, params);
        eval_compiled(&compiled, &cx)
    }

    #[test]
    fn test_field_access_and_arithmetic() {
        let tuple = Tuple::empty().with("thing", Value::record(record! { "calories" => 95 }));
        let out = eval_str("thing.calories * 2 + 10", &tuple, &Record::new()).expect("eval");
        assert_eq!(out, Value::Number(200.0));
    }

    #[test]
    fn test_comparisons_use_total_order() {
        let tuple = Tuple::empty().with("a", Value::record(record! { "n" => 1 }));
        let out = eval_str("a.n < 'text'", &tuple, &Record::new()).expect("eval");
        assert_eq!(out, Value::Bool(true), "numbers sort below text");
    }

    #[test]
    fn test_missing_field_reads_null() {
        let tuple = Tuple::empty().with("r", Value::record(record! { "a" => 1 }));
        let out = eval_str("r.missing === null", &tuple, &Record::new()).expect("eval");
        assert_eq!(out, Value::Bool(true));
    }

    #[test]
    fn test_record_literal_projection() {
        let tuple = Tuple::empty().with(
            "thing",
            Value::record(record! { "name" => "Apple", "calories" => 95 }),
        );
        let out = eval_str("{name: thing.name}", &tuple, &Record::new()).expect("eval");
        let record = out.as_record().expect("record output");
        assert_eq!(record.get_or_null("name"), Value::text("Apple"));
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_spread_merges_records() {
        let tuple = Tuple::empty().with(
            "thing",
            Value::record(record! { "id" => 1, "name" => "Apple" }),
        );
        let out = eval_str("{...thing, name: 'Pie'}", &tuple, &Record::new()).expect("eval");
        let record = out.as_record().expect("record output");
        assert_eq!(record.get_or_null("id"), Value::Number(1.0));
        assert_eq!(record.get_or_null("name"), Value::text("Pie"));
    }

    #[test]
    fn test_params_and_subs() {
        let tuple = Tuple::empty().with("r", Value::record(record! { "n" => 7 }));
        let schema = Schema::single("r", SourceId::fresh());
        let compiled = compile_expr(
            &Template::new("r.n > $min && r.n < ?").bind(10),
            &CompileSchema::Known(&schema),
            CompileOptions::default(),
        )
        .expect("compile");
        let params = record! { "min" => 5 };
        let cx = EvalCtx::bare(&tuple, &params);
        assert_eq!(eval_compiled(&compiled, &cx).expect("eval"), Value::Bool(true));
    }

    #[test]
    fn test_lambda_call() {
        let tuple = Tuple::empty().with("r", Value::record(record! { "n" => 3 }));
        let out = eval_str("(x => x + 1)(r.n)", &tuple, &Record::new()).expect("eval");
        assert_eq!(out, Value::Number(4.0));
    }

    #[test]
    fn test_aggregate_folds_state() {
        let schema = Schema::single("r", SourceId::fresh());
        let compiled = compile_expr(
            &Template::new("{total: sum(r.i)}"),
            &CompileSchema::Known(&schema),
            CompileOptions {
                allow_aggregates: true,
            },
        )
        .expect("compile");

        let state = RefCell::new(Vec::new());
        let params = Record::new();
        let mut last = Value::Null;
        for i in [1.0, 2.0, 3.0] {
            let tuple = Tuple::empty().with("r", Value::record(record! { "i" => i }));
            let cx = EvalCtx {
                tuple: &tuple,
                params: &params,
                subs: &[],
                state: Some(&state),
                bound: None,
            };
            last = eval(&compiled.expr, &cx).expect("eval");
        }
        let record = last.as_record().expect("record output");
        assert_eq!(record.get_or_null("total"), Value::Number(6.0));
    }

    #[test]
    fn test_string_concatenation() {
        let tuple = Tuple::empty().with("r", Value::record(record! { "name" => "pie" }));
        let out = eval_str("'apple ' ++ r.name", &tuple, &Record::new()).expect("eval");
        assert_eq!(out, Value::text("apple pie"));
        let out = eval_str("r.name + '!'", &tuple, &Record::new()).expect("eval");
        assert_eq!(out, Value::text("pie!"));
    }

    #[test]
    fn test_evaluation_errors_propagate() {
        let tuple = Tuple::empty().with("r", Value::record(record! { "n" => 1 }));
        let err = eval_str("r.n.deeper", &tuple, &Record::new()).expect_err("must fail");
        assert!(matches!(err, Error::Eval(_)));
    }
}
