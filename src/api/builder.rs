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

//! Fluent query builder
//!
//! Emits the relational tree: `from` binds aliased sources under a fresh
//! inner join, the join family wraps further joins (`right_join` swaps
//! sides, `full_join` synthesises outer + anti under a composite union),
//! `on` merges its predicate into the joins just added, `where_` stacks a
//! Where, `order_by`/`group_by`/`select` wrap their nodes, and the write
//! statements produce a Write over the projected stream. Build-time
//! misuse fails synchronously; `finalize` caches the planned tree and
//! later modification is refused.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::compile::{
    compile_expr, compile_terms, CompileOptions, CompileSchema, CompiledExpr, Schema, Template,
};
use crate::core::{Error, Record, Result, Value};
use crate::parser::{Expr, RecordEntry};
use crate::plan::{
    finalize, CompositeUnionNode, GroupByNode, JoinKind, JoinNode, MemoizeNode, OrderByNode,
    OrderingEntry, PlanNode, SelectNode, Source, SourceNode, WhereNode, WriteNode, WriteOptions,
    WriteTarget,
};
use crate::store::{KvStore, MemTable};
use crate::txn::Transaction;

use super::query::Rows;
use crate::exec::{execute, ExecCtx};

/// What statement the builder is assembling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
    Select,
    Insert,
    Upsert,
    Update,
    Delete,
}

/// Start a select statement
pub fn select(template: impl Into<Template>) -> QueryBuilder {
    QueryBuilder::new(StatementKind::Select, Some(template.into()))
}

/// Start an insert statement
pub fn insert(template: impl Into<Template>) -> QueryBuilder {
    QueryBuilder::new(StatementKind::Insert, Some(template.into()))
}

/// Start an upsert statement
pub fn upsert(template: impl Into<Template>) -> QueryBuilder {
    QueryBuilder::new(StatementKind::Upsert, Some(template.into()))
}

/// Start an update statement
pub fn update(template: impl Into<Template>) -> QueryBuilder {
    QueryBuilder::new(StatementKind::Update, Some(template.into()))
}

/// Start a delete statement against a write target
pub fn delete_from(target: impl IntoWriteTarget) -> QueryBuilder {
    let mut builder = QueryBuilder::new(StatementKind::Delete, None);
    match target.into_write_target() {
        Ok(target) => builder.target = Some(target),
        Err(error) => builder.fail(error),
    }
    builder
}

/// A source binding accepted by `from` and the join family
pub trait IntoSource {
    fn into_source(self) -> Result<Source>;
}

impl IntoSource for Source {
    fn into_source(self) -> Result<Source> {
        Ok(self)
    }
}

impl IntoSource for MemTable {
    fn into_source(self) -> Result<Source> {
        Ok(Source::Rows(self))
    }
}

impl IntoSource for Vec<Record> {
    fn into_source(self) -> Result<Source> {
        Ok(Source::Rows(MemTable::from_records(self)))
    }
}

impl IntoSource for (KvStore, &str) {
    fn into_source(self) -> Result<Source> {
        let (store, source) = self;
        Ok(Source::Store {
            store: Rc::new(store),
            source: source.to_string(),
        })
    }
}

impl IntoSource for (&KvStore, &str) {
    fn into_source(self) -> Result<Source> {
        (self.0.clone(), self.1).into_source()
    }
}

impl IntoSource for QueryBuilder {
    fn into_source(self) -> Result<Source> {
        let mut builder = self;
        let memoize = builder.memoize;
        let plan = builder.finalize()?;
        let plan = if memoize {
            Rc::new(PlanNode::Memoize(MemoizeNode { child: plan }))
        } else {
            plan
        };
        Ok(Source::Query(plan))
    }
}

/// Wrap a record-producing function as a query source
pub fn thunk(f: impl Fn() -> Result<Vec<Record>> + 'static) -> Source {
    Source::Thunk(Rc::new(f))
}

/// A write target accepted by `into` and `delete_from`
pub trait IntoWriteTarget {
    fn into_write_target(self) -> Result<WriteTarget>;
}

impl IntoWriteTarget for MemTable {
    fn into_write_target(self) -> Result<WriteTarget> {
        Ok(WriteTarget::Mem(self))
    }
}

impl IntoWriteTarget for (KvStore, &str) {
    fn into_write_target(self) -> Result<WriteTarget> {
        let (store, source) = self;
        Ok(WriteTarget::Store {
            store: Rc::new(store),
            source: source.to_string(),
        })
    }
}

impl IntoWriteTarget for (&KvStore, &str) {
    fn into_write_target(self) -> Result<WriteTarget> {
        (self.0.clone(), self.1).into_write_target()
    }
}

/// The fluent builder
pub struct QueryBuilder {
    kind: StatementKind,
    selector: Option<Template>,
    group_by: Option<Template>,
    /// Filters arriving after `group_by`; they apply over the grouped
    /// output, whose rows are anonymous
    having: Vec<Template>,
    returning: Option<Template>,
    target: Option<WriteTarget>,
    memoize: bool,
    root: Option<Rc<PlanNode>>,
    schema: Schema,
    /// Alias of the first bound source; writes resolve the prior record
    /// through it
    first_alias: Option<String>,
    /// How many joins the last join call added (targets for `on`)
    pending_joins: usize,
    finalized: Option<Rc<PlanNode>>,
    error: Option<Error>,
}

impl QueryBuilder {
    fn new(kind: StatementKind, selector: Option<Template>) -> Self {
        QueryBuilder {
            kind,
            selector,
            group_by: None,
            having: Vec::new(),
            returning: None,
            target: None,
            memoize: false,
            root: None,
            schema: Schema::new(),
            first_alias: None,
            pending_joins: 0,
            finalized: None,
            error: None,
        }
    }

    fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn check_open(&mut self) -> bool {
        if self.finalized.is_some() {
            self.fail(Error::Finalized);
            return false;
        }
        self.error.is_none()
    }

    /// Bind one aliased source
    pub fn from(self, alias: &str, source: impl IntoSource) -> Self {
        self.bind_source(alias, source, None)
    }

    /// Inner join one aliased source
    pub fn join(self, alias: &str, source: impl IntoSource) -> Self {
        self.bind_source(alias, source, Some(JoinKind::Inner))
    }

    /// Left outer join one aliased source
    pub fn left_join(self, alias: &str, source: impl IntoSource) -> Self {
        self.bind_source(alias, source, Some(JoinKind::Outer))
    }

    /// Right outer join: the new source becomes the preserved side
    pub fn right_join(mut self, alias: &str, source: impl IntoSource) -> Self {
        if !self.check_open() {
            return self;
        }
        let Some(node) = self.named_source(alias, source) else {
            return self;
        };
        let Some(existing) = self.root.take() else {
            self.fail(Error::misuse("join before from"));
            return self;
        };
        self.root = Some(Rc::new(PlanNode::Join(JoinNode {
            kind: JoinKind::Outer,
            left: node,
            right: existing,
            term_groups: Default::default(),
            predicates: Vec::new(),
        })));
        self.pending_joins = 1;
        self
    }

    /// Full outer join: composite union of an outer join and the swapped
    /// anti join
    pub fn full_join(mut self, alias: &str, source: impl IntoSource) -> Self {
        if !self.check_open() {
            return self;
        }
        let Some(node) = self.named_source(alias, source) else {
            return self;
        };
        let Some(existing) = self.root.take() else {
            self.fail(Error::misuse("join before from"));
            return self;
        };
        let outer = Rc::new(PlanNode::Join(JoinNode {
            kind: JoinKind::Outer,
            left: existing.clone(),
            right: node.clone(),
            term_groups: Default::default(),
            predicates: Vec::new(),
        }));
        let anti = Rc::new(PlanNode::Join(JoinNode {
            kind: JoinKind::Anti,
            left: node,
            right: existing,
            term_groups: Default::default(),
            predicates: Vec::new(),
        }));
        self.root = Some(Rc::new(PlanNode::CompositeUnion(CompositeUnionNode {
            left: outer,
            right: anti,
        })));
        self.pending_joins = 2;
        self
    }

    /// Anti join one aliased source
    pub fn anti_join(self, alias: &str, source: impl IntoSource) -> Self {
        self.bind_source(alias, source, Some(JoinKind::Anti))
    }

    fn named_source(&mut self, alias: &str, source: impl IntoSource) -> Option<Rc<PlanNode>> {
        if self.schema.contains(alias) {
            self.fail(Error::DuplicateAlias(alias.to_string()));
            return None;
        }
        let source = match source.into_source() {
            Ok(source) => source,
            Err(error) => {
                self.fail(error);
                return None;
            }
        };
        let node = SourceNode::new(alias, source);
        self.schema.insert(alias, node.id);
        if self.first_alias.is_none() {
            self.first_alias = Some(alias.to_string());
        }
        Some(Rc::new(PlanNode::Source(node)))
    }

    fn bind_source(
        mut self,
        alias: &str,
        source: impl IntoSource,
        kind: Option<JoinKind>,
    ) -> Self {
        if !self.check_open() {
            return self;
        }
        let Some(node) = self.named_source(alias, source) else {
            return self;
        };
        match (self.root.take(), kind) {
            (None, None) => {
                self.root = Some(node);
                self.pending_joins = 0;
            }
            (None, Some(_)) => {
                self.fail(Error::misuse("join before from"));
            }
            (Some(existing), kind) => {
                self.root = Some(Rc::new(PlanNode::Join(JoinNode {
                    kind: kind.unwrap_or(JoinKind::Inner),
                    left: existing,
                    right: node,
                    term_groups: Default::default(),
                    predicates: Vec::new(),
                })));
                self.pending_joins = 1;
            }
        }
        self
    }

    /// Attach a join predicate to the joins just added
    pub fn on(mut self, template: impl Into<Template>) -> Self {
        if !self.check_open() {
            return self;
        }
        if self.pending_joins == 0 {
            self.fail(Error::misuse("on without a preceding join"));
            return self;
        }
        let groups = match compile_terms(&template.into(), &CompileSchema::Known(&self.schema)) {
            Ok(groups) => groups,
            Err(error) => {
                self.fail(error);
                return self;
            }
        };
        let Some(root) = self.root.take() else {
            self.fail(Error::misuse("on without a tree"));
            return self;
        };
        let mut root = root;
        {
            let node = Rc::make_mut(&mut root);
            match node {
                PlanNode::Join(join) => join.term_groups.merge(groups),
                PlanNode::CompositeUnion(union) => {
                    // A full join carries the predicate on both synthesised joins
                    for leg in [&mut union.left, &mut union.right] {
                        if let PlanNode::Join(join) = Rc::make_mut(leg) {
                            join.term_groups.merge(groups.clone());
                        }
                    }
                }
                _ => {
                    self.fail(Error::misuse("on without a preceding join"));
                }
            }
        }
        self.root = Some(root);
        self
    }

    /// Filter the current tree
    pub fn where_(mut self, template: impl Into<Template>) -> Self {
        if !self.check_open() {
            return self;
        }
        if self.group_by.is_some() {
            // The grouping is assembled at finalize; a later filter sits
            // above it, over anonymous rows
            self.having.push(template.into());
            return self;
        }
        let Some(root) = self.root.take() else {
            self.fail(Error::misuse("where before from"));
            return self;
        };
        let schema = root.schema();
        let compile_schema = match &schema {
            Some(schema) => CompileSchema::Known(schema),
            None => CompileSchema::Unknown,
        };
        match compile_terms(&template.into(), &compile_schema) {
            Ok(term_groups) => {
                self.root = Some(Rc::new(PlanNode::Where(WhereNode {
                    child: root,
                    term_groups,
                    predicate: None,
                })));
            }
            Err(error) => {
                self.root = Some(root);
                self.fail(error);
            }
        }
        self.pending_joins = 0;
        self
    }

    /// Group rows; the select template becomes the per-group selector and
    /// may use aggregates
    pub fn group_by(mut self, template: impl Into<Template>) -> Self {
        if !self.check_open() {
            return self;
        }
        if self.kind != StatementKind::Select || self.selector.is_none() {
            self.fail(Error::misuse("group_by requires a select selector"));
            return self;
        }
        if self.group_by.is_some() {
            self.fail(Error::misuse("group_by called more than once"));
            return self;
        }
        self.group_by = Some(template.into());
        self
    }

    /// Order the current tree by an expression
    pub fn order_by(mut self, template: impl Into<Template>) -> Self {
        if !self.check_open() {
            return self;
        }
        let Some(root) = self.root.take() else {
            self.fail(Error::misuse("order_by before from"));
            return self;
        };
        let schema = root.schema();
        let compile_schema = match &schema {
            Some(schema) => CompileSchema::Known(schema),
            None => CompileSchema::Unknown,
        };
        match compile_expr(&template.into(), &compile_schema, CompileOptions::default()) {
            Ok(expr) => {
                let entry = OrderingEntry {
                    expr,
                    direction: 1,
                    nulls: 1,
                };
                self.root = Some(Rc::new(PlanNode::OrderBy(OrderByNode {
                    child: root,
                    ordering: vec![entry],
                })));
            }
            Err(error) => {
                self.root = Some(root);
                self.fail(error);
            }
        }
        self
    }

    fn adjust_last_ordering(&mut self, adjust: impl FnOnce(&mut OrderingEntry)) {
        if !self.check_open() {
            return;
        }
        let Some(root) = self.root.as_mut() else {
            self.fail(Error::misuse("ordering modifier before order_by"));
            return;
        };
        match Rc::make_mut(root) {
            PlanNode::OrderBy(order) => match order.ordering.last_mut() {
                Some(entry) => adjust(entry),
                None => self.fail(Error::misuse("ordering modifier before order_by")),
            },
            _ => self.fail(Error::misuse("ordering modifier before order_by")),
        }
    }

    /// Ascending order for the last `order_by`
    pub fn asc(mut self) -> Self {
        self.adjust_last_ordering(|entry| entry.direction = 1);
        self
    }

    /// Descending order for the last `order_by`
    pub fn desc(mut self) -> Self {
        self.adjust_last_ordering(|entry| entry.direction = -1);
        self
    }

    /// Explicit direction for the last `order_by`
    pub fn order(mut self, direction: i8) -> Self {
        self.adjust_last_ordering(|entry| entry.direction = if direction < 0 { -1 } else { 1 });
        self
    }

    /// Nulls first for the last `order_by`
    pub fn nulls_first(mut self) -> Self {
        self.adjust_last_ordering(|entry| entry.nulls = -1);
        self
    }

    /// Nulls last for the last `order_by`
    pub fn nulls_last(mut self) -> Self {
        self.adjust_last_ordering(|entry| entry.nulls = 1);
        self
    }

    /// Explicit null placement for the last `order_by`
    pub fn nulls(mut self, placement: i8) -> Self {
        self.adjust_last_ordering(|entry| entry.nulls = if placement < 0 { -1 } else { 1 });
        self
    }

    /// Write destination for insert/upsert/update
    pub fn into(mut self, target: impl IntoWriteTarget) -> Self {
        if !self.check_open() {
            return self;
        }
        if self.kind == StatementKind::Select {
            self.fail(Error::misuse("into on a select statement"));
            return self;
        }
        if self.target.is_some() {
            self.fail(Error::misuse("into called more than once"));
            return self;
        }
        match target.into_write_target() {
            Ok(target) => self.target = Some(target),
            Err(error) => self.fail(error),
        }
        self
    }

    /// Projection over a mutating statement's written rows
    pub fn returning(mut self, template: impl Into<Template>) -> Self {
        if !self.check_open() {
            return self;
        }
        if self.kind == StatementKind::Select {
            self.fail(Error::misuse("returning on a select statement"));
            return self;
        }
        self.returning = Some(template.into());
        self
    }

    /// Mark a select subquery for single-producer replay
    pub fn memoize(mut self) -> Self {
        if self.check_open() {
            self.memoize = true;
        }
        self
    }

    // =========================================================================
    // Finalization and execution
    // =========================================================================

    /// Plan the query; idempotent, and the builder refuses changes after
    pub fn finalize(&mut self) -> Result<Rc<PlanNode>> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if let Some(plan) = &self.finalized {
            return Ok(plan.clone());
        }
        let tree = self.assemble()?;
        let plan = finalize(tree)?;
        self.finalized = Some(plan.clone());
        Ok(plan)
    }

    fn assemble(&mut self) -> Result<Rc<PlanNode>> {
        let root = match self.root.clone() {
            Some(root) => root,
            None if self.kind == StatementKind::Insert || self.kind == StatementKind::Upsert => {
                // A from-less write projects its template over one empty row
                Rc::new(PlanNode::Source(SourceNode::new("", Source::Unit)))
            }
            None => return Err(Error::misuse("statement has no sources")),
        };
        let schema = root.schema();
        let compile_schema = match &schema {
            Some(schema) => CompileSchema::Known(schema),
            None => CompileSchema::Unknown,
        };

        match self.kind {
            StatementKind::Select => {
                let selector = self
                    .selector
                    .as_ref()
                    .ok_or_else(|| Error::misuse("select has no selector"))?;
                let tree = match &self.group_by {
                    Some(grouper) => {
                        let selector = compile_expr(
                            selector,
                            &compile_schema,
                            CompileOptions {
                                allow_aggregates: true,
                            },
                        )?;
                        let grouper =
                            compile_expr(grouper, &compile_schema, CompileOptions::default())?;
                        let mut tree = Rc::new(PlanNode::GroupBy(GroupByNode {
                            child: root,
                            selector,
                            grouper,
                        }));
                        for filter in &self.having {
                            let term_groups =
                                compile_terms(filter, &CompileSchema::Unknown)?;
                            tree = Rc::new(PlanNode::Where(WhereNode {
                                child: tree,
                                term_groups,
                                predicate: None,
                            }));
                        }
                        tree
                    }
                    None => {
                        let selector =
                            compile_expr(selector, &compile_schema, CompileOptions::default())?;
                        Rc::new(PlanNode::Select(SelectNode {
                            child: root,
                            selector,
                        }))
                    }
                };
                Ok(tree)
            }

            StatementKind::Insert | StatementKind::Upsert | StatementKind::Update
            | StatementKind::Delete => {
                let target = self
                    .target
                    .clone()
                    .ok_or_else(|| Error::misuse("write statement has no target"))?;

                let selector = match self.kind {
                    StatementKind::Delete => self.prior_record_selector(&schema)?,
                    StatementKind::Update => {
                        let template = self
                            .selector
                            .as_ref()
                            .ok_or_else(|| Error::misuse("update has no selector"))?;
                        let changes =
                            compile_expr(template, &compile_schema, CompileOptions::default())?;
                        self.merge_prior_into(changes, &schema)?
                    }
                    _ => {
                        let template = self
                            .selector
                            .as_ref()
                            .ok_or_else(|| Error::misuse("write has no selector"))?;
                        compile_expr(template, &compile_schema, CompileOptions::default())?
                    }
                };

                let options = WriteOptions {
                    overwrite: self.kind != StatementKind::Insert,
                    delete: self.kind == StatementKind::Delete,
                };
                let projected = Rc::new(PlanNode::Select(SelectNode {
                    child: root,
                    selector,
                }));
                let mut tree = Rc::new(PlanNode::Write(WriteNode {
                    child: projected,
                    target,
                    options,
                }));
                if let Some(returning) = &self.returning {
                    let selector =
                        compile_expr(returning, &CompileSchema::Unknown, CompileOptions::default())?;
                    tree = Rc::new(PlanNode::Select(SelectNode {
                        child: tree,
                        selector,
                    }));
                }
                Ok(tree)
            }
        }
    }

    /// The written alias's prior record, as a selector
    fn prior_record_selector(&self, schema: &Option<Schema>) -> Result<CompiledExpr> {
        let alias = self
            .first_alias
            .clone()
            .ok_or_else(|| Error::misuse("write statement has no sources"))?;
        let id = schema
            .as_ref()
            .and_then(|s| s.get(&alias))
            .ok_or_else(|| Error::UnknownIdentifier(alias.clone()))?;
        Ok(CompiledExpr {
            expr: Rc::new(Expr::Ident(alias.clone())),
            deps: BTreeMap::from([(alias, id)]),
            agg_slots: 0,
            subs: Rc::new(Vec::new()),
            bound: Rc::new(BTreeMap::new()),
        })
    }

    /// Shallow-merge the prior record under the written alias into the
    /// update selector's output; the selector's fields win
    fn merge_prior_into(
        &self,
        changes: CompiledExpr,
        schema: &Option<Schema>,
    ) -> Result<CompiledExpr> {
        let prior = self.prior_record_selector(schema)?;
        let expr = Expr::Record(vec![
            RecordEntry::Spread(prior.expr.as_ref().clone()),
            RecordEntry::Spread(changes.expr.as_ref().clone()),
        ]);
        let mut deps = changes.deps.clone();
        deps.extend(prior.deps.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(CompiledExpr {
            expr: Rc::new(expr),
            deps,
            agg_slots: changes.agg_slots,
            subs: changes.subs.clone(),
            bound: changes.bound.clone(),
        })
    }

    /// Plan (if needed) and run, yielding the lazy row stream
    pub fn query(&mut self, params: Record) -> Result<Rows> {
        self.query_in(params, None)
    }

    /// Plan (if needed) and run inside an existing transaction
    pub fn query_in(&mut self, params: Record, txn: Option<Transaction>) -> Result<Rows> {
        let plan = self.finalize()?;
        let owns_txn = txn.is_none();
        let ctx = ExecCtx::new(params, txn);
        Ok(Rows::new(execute(&plan, &ctx), owns_txn))
    }

    /// Run and materialise every output row
    pub fn collect(&mut self, params: Record) -> Result<Vec<Value>> {
        self.query(params)?.collect()
    }

    /// Run for side effects, invoking the callback per row
    pub fn for_each(&mut self, params: Record, mut f: impl FnMut(Value)) -> Result<()> {
        for row in self.query(params)? {
            f(row?);
        }
        Ok(())
    }
}
