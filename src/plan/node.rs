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

//! Relational tree
//!
//! The node types the builder emits and the planner rewrites. Nodes own
//! their children; after finalization the tree is immutable and shared
//! into the executor behind `Rc`. A node reports a schema only while its
//! output rows remain identifiable by source name - projections,
//! groupings and writes hide theirs.

use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::compile::{CompiledExpr, Schema, SourceId, TermGroups};
use crate::core::{KeyPath, Record, Result, Value};
use crate::range::KeyRange;
use crate::store::{MemTable, StoreHandle, TxMode};

/// Join flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    /// Left outer: a sentinel right side when no match
    Outer,
    /// Emit the left side only when the right side is empty
    Anti,
}

/// Set-operation flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    /// Structural dedup across both legs
    Union,
    /// Plain concatenation
    UnionAll,
}

/// What a named source reads from
#[derive(Clone)]
pub enum Source {
    /// An in-memory collection
    Rows(MemTable),
    /// A source of a persistent store
    Store { store: StoreHandle, source: String },
    /// An opaque subquery
    Query(Rc<PlanNode>),
    /// A function producing records at execution time
    Thunk(Rc<dyn Fn() -> Result<Vec<Record>>>),
    /// Exactly one empty record (seed for from-less writes)
    Unit,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Rows(table) => write!(f, "Rows(len={})", table.len()),
            Source::Store { store, source } => {
                write!(f, "Store({}/{})", store.name(), source)
            }
            Source::Query(_) => write!(f, "Query"),
            Source::Thunk(_) => write!(f, "Thunk"),
            Source::Unit => write!(f, "Unit"),
        }
    }
}

/// A leaf: a collection bound to an alias
#[derive(Debug, Clone)]
pub struct SourceNode {
    pub id: SourceId,
    pub name: String,
    pub source: Source,
    /// Predicates hoisted here during finalization, applied in order
    pub predicates: Vec<CompiledExpr>,
    /// Key ranges hoisted here during finalization
    pub key_ranges: FxHashMap<KeyPath, KeyRange>,
    /// Substitution table the key-range bound expressions reference
    pub range_subs: Rc<Vec<Value>>,
}

impl SourceNode {
    /// A fresh leaf with a new dependency identity
    pub fn new(name: impl Into<String>, source: Source) -> Self {
        SourceNode {
            id: SourceId::fresh(),
            name: name.into(),
            source,
            predicates: Vec::new(),
            key_ranges: FxHashMap::default(),
            range_subs: Rc::new(Vec::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinNode {
    pub kind: JoinKind,
    pub left: Rc<PlanNode>,
    pub right: Rc<PlanNode>,
    /// `on` predicates, consumed by finalization
    pub term_groups: TermGroups,
    /// Predicates that must stay on the join (outer/anti semantics)
    pub predicates: Vec<CompiledExpr>,
}

#[derive(Debug, Clone)]
pub struct WhereNode {
    pub child: Rc<PlanNode>,
    /// Predicate terms, consumed by finalization
    pub term_groups: TermGroups,
    /// The merged conjunction, set by finalization when the child hides
    /// its schema and the Where must survive
    pub predicate: Option<CompiledExpr>,
}

#[derive(Debug, Clone)]
pub struct GroupByNode {
    pub child: Rc<PlanNode>,
    pub selector: CompiledExpr,
    pub grouper: CompiledExpr,
}

/// One entry of an ordering: expression, direction, null placement
#[derive(Debug, Clone)]
pub struct OrderingEntry {
    pub expr: CompiledExpr,
    /// +1 ascending, -1 descending
    pub direction: i8,
    /// +1 nulls last, -1 nulls first
    pub nulls: i8,
}

#[derive(Debug, Clone)]
pub struct OrderByNode {
    pub child: Rc<PlanNode>,
    pub ordering: Vec<OrderingEntry>,
}

#[derive(Debug, Clone)]
pub struct SelectNode {
    pub child: Rc<PlanNode>,
    pub selector: CompiledExpr,
}

#[derive(Debug, Clone)]
pub struct SetOpNode {
    pub kind: SetOpKind,
    pub left: Rc<PlanNode>,
    pub right: Rc<PlanNode>,
}

/// Merges two tuple streams without deduplication (full-outer synthesis)
#[derive(Debug, Clone)]
pub struct CompositeUnionNode {
    pub left: Rc<PlanNode>,
    pub right: Rc<PlanNode>,
}

/// Where a write lands
#[derive(Clone)]
pub enum WriteTarget {
    Mem(MemTable),
    Store { store: StoreHandle, source: String },
}

impl fmt::Debug for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteTarget::Mem(table) => write!(f, "Mem(len={})", table.len()),
            WriteTarget::Store { store, source } => {
                write!(f, "Store({}/{})", store.name(), source)
            }
        }
    }
}

/// Write behaviour flags
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Overwrite existing keys (upsert/update/delete)
    pub overwrite: bool,
    /// Delete instead of write
    pub delete: bool,
}

#[derive(Debug, Clone)]
pub struct WriteNode {
    pub child: Rc<PlanNode>,
    pub target: WriteTarget,
    pub options: WriteOptions,
}

#[derive(Debug, Clone)]
pub struct MemoizeNode {
    pub child: Rc<PlanNode>,
}

/// The transaction envelope finalization wraps a planned tree in
#[derive(Clone)]
pub struct EnvelopeNode {
    pub child: Rc<PlanNode>,
    /// The single persistent store the tree touches, if any
    pub store: Option<StoreHandle>,
    /// Source names the store transaction must cover
    pub source_names: Vec<String>,
    pub mode: TxMode,
}

impl fmt::Debug for EnvelopeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeNode")
            .field("store", &self.store.as_ref().map(|s| s.name().to_string()))
            .field("source_names", &self.source_names)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// A node of the relational tree
#[derive(Debug, Clone)]
pub enum PlanNode {
    Source(SourceNode),
    Join(JoinNode),
    Where(WhereNode),
    GroupBy(GroupByNode),
    OrderBy(OrderByNode),
    Select(SelectNode),
    SetOp(SetOpNode),
    CompositeUnion(CompositeUnionNode),
    Write(WriteNode),
    Memoize(MemoizeNode),
    Envelope(EnvelopeNode),
}

impl PlanNode {
    /// The schema this node exposes to its parent, when its rows remain
    /// identifiable by source name
    pub fn schema(&self) -> Option<Schema> {
        match self {
            PlanNode::Source(s) => Some(Schema::single(s.name.clone(), s.id)),
            PlanNode::Join(j) => match j.kind {
                JoinKind::Anti => j.left.schema(),
                JoinKind::Inner | JoinKind::Outer => {
                    let left = j.left.schema()?;
                    let right = j.right.schema()?;
                    Some(left.union(&right))
                }
            },
            PlanNode::Where(w) => w.child.schema(),
            PlanNode::OrderBy(o) => o.child.schema(),
            PlanNode::Memoize(m) => m.child.schema(),
            PlanNode::SetOp(s) => s.left.schema(),
            PlanNode::Envelope(e) => e.child.schema(),
            PlanNode::GroupBy(_)
            | PlanNode::Select(_)
            | PlanNode::Write(_)
            | PlanNode::CompositeUnion(_) => None,
        }
    }

    /// Visit every node of the tree, parents before children
    pub fn walk(&self, visit: &mut impl FnMut(&PlanNode)) {
        visit(self);
        match self {
            PlanNode::Source(s) => {
                if let Source::Query(inner) = &s.source {
                    inner.walk(visit);
                }
            }
            PlanNode::Join(j) => {
                j.left.walk(visit);
                j.right.walk(visit);
            }
            PlanNode::Where(w) => w.child.walk(visit),
            PlanNode::GroupBy(g) => g.child.walk(visit),
            PlanNode::OrderBy(o) => o.child.walk(visit),
            PlanNode::Select(s) => s.child.walk(visit),
            PlanNode::SetOp(s) => {
                s.left.walk(visit);
                s.right.walk(visit);
            }
            PlanNode::CompositeUnion(c) => {
                c.left.walk(visit);
                c.right.walk(visit);
            }
            PlanNode::Write(w) => w.child.walk(visit),
            PlanNode::Memoize(m) => m.child.walk(visit),
            PlanNode::Envelope(e) => e.child.walk(visit),
        }
    }
}
