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

//! Expression compiler
//!
//! Turns predicate and projection templates into evaluable expressions
//! with explicit dependency sets: normalization passes over the parsed
//! tree, conjunction decomposition into [`TermGroups`], key-range
//! extraction, and the tree-walking evaluator.

pub mod compiler;
pub mod eval;
pub mod ranges;
pub mod scope;
pub mod terms;

pub use compiler::{compile_expr, compile_terms, CompileOptions, CompiledExpr};
pub use eval::{eval, eval_compiled, EvalCtx};
pub use scope::AggState;
pub use terms::{Term, TermGroups};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::core::Value;

// ============================================================================
// SourceId
// ============================================================================

/// The dependency identity of a named source
///
/// Two syntactically distinct sources get distinct identities even when
/// they wrap the same underlying collection; a predicate's free variables
/// resolve to identities, never to collection pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u64);

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

impl SourceId {
    /// The sentinel identity every unbound name resolves to when the
    /// schema is unknown
    pub const UNKNOWN: SourceId = SourceId(0);

    /// Mint a fresh identity
    pub fn fresh() -> SourceId {
        SourceId(NEXT_SOURCE_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Whether this is the unknown-dependency sentinel
    pub fn is_unknown(&self) -> bool {
        *self == SourceId::UNKNOWN
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "#unknown")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

// ============================================================================
// Schema
// ============================================================================

/// A mapping from source name to dependency identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    entries: BTreeMap<String, SourceId>,
}

impl Schema {
    /// The empty schema
    pub fn new() -> Self {
        Schema::default()
    }

    /// A single-source schema
    pub fn single(name: impl Into<String>, id: SourceId) -> Self {
        let mut schema = Schema::new();
        schema.insert(name, id);
        schema
    }

    /// Bind a name
    pub fn insert(&mut self, name: impl Into<String>, id: SourceId) {
        self.entries.insert(name.into(), id);
    }

    /// Look up a name
    pub fn get(&self, name: &str) -> Option<SourceId> {
        self.entries.get(name).copied()
    }

    /// Whether a name is bound
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Union with another schema; `other` wins on collisions
    pub fn union(&self, other: &Schema) -> Schema {
        let mut out = self.clone();
        for (name, id) in &other.entries {
            out.entries.insert(name.clone(), *id);
        }
        out
    }

    /// Iterate bindings in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, SourceId)> {
        self.entries.iter().map(|(name, id)| (name, *id))
    }

    /// The bound names
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// The bound identities
    pub fn ids(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.entries.values().copied()
    }

    /// Whether an identity is bound under any name
    pub fn has_id(&self, id: SourceId) -> bool {
        self.entries.values().any(|&bound| bound == id)
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the schema has no bindings
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, SourceId)> for Schema {
    fn from_iter<T: IntoIterator<Item = (String, SourceId)>>(iter: T) -> Self {
        Schema {
            entries: iter.into_iter().collect(),
        }
    }
}

/// The schema an expression compiles against
///
/// With an unknown schema every unbound identifier auto-declares a
/// dependency on the unknown sentinel and reads from the implicit row.
#[derive(Debug, Clone, Copy)]
pub enum CompileSchema<'a> {
    Known(&'a Schema),
    Unknown,
}

impl<'a> CompileSchema<'a> {
    /// Resolve a name against the schema
    pub fn resolve(&self, name: &str) -> Option<SourceId> {
        match self {
            CompileSchema::Known(schema) => schema.get(name),
            CompileSchema::Unknown => Some(SourceId::UNKNOWN),
        }
    }

    /// Whether the schema is the unknown sentinel
    pub fn is_unknown(&self) -> bool {
        matches!(self, CompileSchema::Unknown)
    }
}

// ============================================================================
// Template
// ============================================================================

/// An expression template: source text with `?` holes plus the
/// substitution values filling them, in order
#[derive(Debug, Clone, Default)]
pub struct Template {
    pub text: String,
    pub subs: Vec<Value>,
}

impl Template {
    /// A template with no substitutions
    pub fn new(text: impl Into<String>) -> Self {
        Template {
            text: text.into(),
            subs: Vec::new(),
        }
    }

    /// Append a substitution value for the next hole
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.subs.push(value.into());
        self
    }
}

impl From<&str> for Template {
    fn from(text: &str) -> Self {
        Template::new(text)
    }
}

impl From<String> for Template {
    fn from(text: String) -> Self {
        Template::new(text)
    }
}

impl<V: Into<Value>, const N: usize> From<(&str, [V; N])> for Template {
    fn from((text, subs): (&str, [V; N])) -> Self {
        Template {
            text: text.to_string(),
            subs: subs.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<(&str, Vec<Value>)> for Template {
    fn from((text, subs): (&str, Vec<Value>)) -> Self {
        Template {
            text: text.to_string(),
            subs,
        }
    }
}
