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

//! Group-by state
//!
//! Folds a materialised tuple stream into groups keyed by the grouper's
//! structural value. The selector runs once per tuple against the group's
//! shared state array - its aggregate slots are what update the state -
//! and the last returned projection is the group's output, so finished
//! aggregates and final-tuple fields land together. Groups emit in the
//! insertion order of their first tuple.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::compile::{eval_compiled, AggState, CompiledExpr, EvalCtx};
use crate::core::{Result, Tuple, Value};

use super::context::ExecCtx;

/// Fold tuples into per-group outputs
pub fn fold_groups(
    tuples: Vec<Tuple>,
    grouper: &CompiledExpr,
    selector: &CompiledExpr,
    ctx: &ExecCtx,
) -> Result<Vec<Tuple>> {
    struct Group {
        state: Rc<RefCell<Vec<AggState>>>,
        out: Value,
    }

    let mut order: Vec<Value> = Vec::new();
    let mut groups: FxHashMap<Value, Group> = FxHashMap::default();

    for tuple in tuples {
        let merged = ctx.tuple.merge(&tuple);

        let key = {
            let cx = EvalCtx::bare(&merged, &ctx.params);
            eval_compiled(grouper, &cx)?
        };

        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Group {
                state: Rc::new(RefCell::new(Vec::new())),
                out: Value::Null,
            }
        });

        let state = group.state.clone();
        let cx = EvalCtx {
            tuple: &merged,
            params: &ctx.params,
            subs: &[],
            state: Some(&state),
            bound: None,
        };
        group.out = eval_compiled(selector, &cx)?;
    }

    Ok(order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|group| Tuple::anon(group.out))
        .collect())
}
