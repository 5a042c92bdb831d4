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

//! Expression compilation
//!
//! Normalizes a parsed template into its evaluable form:
//!
//! 1. comparison operators become three-way [`Expr::Compare`] nodes over
//!    the total order (idempotent by construction);
//! 2. aggregate calls become numbered group-state slots;
//! 3. `this` becomes the implicit row identifier;
//! 4. `$name` becomes a parameter access;
//! 5. every remaining unbound identifier must resolve in the standard
//!    scope or the schema, and schema hits are recorded as dependencies
//!    of the enclosing term (the unknown-schema sentinel otherwise).
//!
//! Predicates additionally split at top-level conjunctions into terms and
//! run key-range extraction per term.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::core::{Error, Result, Value};
use crate::parser::{
    AggregateKind, BinaryOp, CompareOp, Expr, Parser, RecordEntry,
};

use super::ranges::extract_ranges;
use super::scope::is_scope_name;
use super::terms::{Term, TermGroups};
use super::{CompileSchema, SourceId, Template};

/// Options for expression compilation
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Whether aggregate calls are permitted
    pub allow_aggregates: bool,
}

/// A fully compiled expression
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    /// The normalized expression
    pub expr: Rc<Expr>,
    /// Free source names and their identities
    pub deps: BTreeMap<String, SourceId>,
    /// Number of aggregate slots the expression allocates
    pub agg_slots: usize,
    /// The substitution table referenced by the expression
    pub subs: Rc<Vec<Value>>,
    /// Records frozen in by `partial`, consulted before the tuple
    pub bound: Rc<BTreeMap<String, Value>>,
}

impl CompiledExpr {
    /// Whether the expression reads any aggregate slot
    pub fn has_aggregates(&self) -> bool {
        self.agg_slots > 0
    }

    /// Pre-bind some sources, removing them from the dependency set
    ///
    /// Evaluation of the result needs only the remaining dependencies;
    /// the bound records shadow the tuple.
    pub fn partial(&self, binding: impl IntoIterator<Item = (String, Value)>) -> CompiledExpr {
        let mut bound = self.bound.as_ref().clone();
        let mut deps = self.deps.clone();
        for (name, value) in binding {
            deps.remove(&name);
            bound.insert(name, value);
        }
        CompiledExpr {
            expr: self.expr.clone(),
            deps,
            agg_slots: self.agg_slots,
            subs: self.subs.clone(),
            bound: Rc::new(bound),
        }
    }
}

/// Compile a predicate template into terms grouped by dependency set
pub fn compile_terms(template: &Template, schema: &CompileSchema) -> Result<TermGroups> {
    let parsed = parse_template(template)?;

    let mut roots = Vec::new();
    split_conjunctions(parsed, &mut roots);

    let mut groups = TermGroups {
        terms: Vec::new(),
        subs: template.subs.clone(),
    };
    let options = CompileOptions {
        allow_aggregates: false,
    };
    for root in roots {
        let mut normalizer = Normalizer::new(schema, options);
        let mut deps = BTreeMap::new();
        let expr = normalizer.normalize(root, &mut deps, &mut Vec::new())?;
        let ranges = extract_ranges(&expr, &deps);
        groups.push_term(Term { deps, expr, ranges });
    }
    Ok(groups)
}

/// Compile a whole template into a single evaluable expression
pub fn compile_expr(
    template: &Template,
    schema: &CompileSchema,
    options: CompileOptions,
) -> Result<CompiledExpr> {
    let parsed = parse_template(template)?;
    let mut normalizer = Normalizer::new(schema, options);
    let mut deps = BTreeMap::new();
    let expr = normalizer.normalize(parsed, &mut deps, &mut Vec::new())?;
    Ok(CompiledExpr {
        expr: Rc::new(expr),
        deps,
        agg_slots: normalizer.agg_slots,
        subs: Rc::new(template.subs.clone()),
        bound: Rc::new(BTreeMap::new()),
    })
}

fn parse_template(template: &Template) -> Result<Expr> {
    let parser = Parser::new(&template.text);
    // The parser numbers holes as it reads them; run it to completion
    // first, then check the count against the provided substitutions.
    match parser.parse() {
        Ok(expr) => {
            let holes = count_holes(&expr);
            if holes != template.subs.len() {
                return Err(Error::Parse(format!(
                    "template has {} substitution hole(s) but {} value(s) were bound",
                    holes,
                    template.subs.len()
                )));
            }
            Ok(expr)
        }
        Err(errors) => {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            Err(Error::Parse(joined))
        }
    }
}

fn count_holes(expr: &Expr) -> usize {
    let mut max = None;
    walk_subs(expr, &mut max);
    max.map(|m| m + 1).unwrap_or(0)
}

fn walk_subs(expr: &Expr, max: &mut Option<usize>) {
    match expr {
        Expr::SubsRef(i) => {
            *max = Some(max.map_or(*i, |m: usize| m.max(*i)));
        }
        Expr::Record(entries) => {
            for entry in entries {
                match entry {
                    RecordEntry::Field(_, e) | RecordEntry::Spread(e) => walk_subs(e, max),
                    RecordEntry::Shorthand(_) => {}
                }
            }
        }
        Expr::Sequence(items) => items.iter().for_each(|e| walk_subs(e, max)),
        Expr::Member(base, _) => walk_subs(base, max),
        Expr::Index(base, index) => {
            walk_subs(base, max);
            walk_subs(index, max);
        }
        Expr::Call(callee, args) => {
            walk_subs(callee, max);
            args.iter().for_each(|e| walk_subs(e, max));
        }
        Expr::Lambda(_, body) => walk_subs(body, max),
        Expr::Unary(_, operand) => walk_subs(operand, max),
        Expr::Binary(_, lhs, rhs) | Expr::Compare { lhs, rhs, .. } => {
            walk_subs(lhs, max);
            walk_subs(rhs, max);
        }
        Expr::Aggregate { args, .. } => args.iter().for_each(|e| walk_subs(e, max)),
        _ => {}
    }
}

/// Split at top-level conjunctions: a node is a term root iff its first
/// non-conjunction ancestor is the top-level expression
fn split_conjunctions(expr: Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            split_conjunctions(*lhs, out);
            split_conjunctions(*rhs, out);
        }
        other => out.push(other),
    }
}

// ============================================================================
// Normalizer
// ============================================================================

struct Normalizer<'a> {
    schema: &'a CompileSchema<'a>,
    options: CompileOptions,
    agg_slots: usize,
}

impl<'a> Normalizer<'a> {
    fn new(schema: &'a CompileSchema<'a>, options: CompileOptions) -> Self {
        Normalizer {
            schema,
            options,
            agg_slots: 0,
        }
    }

    fn normalize(
        &mut self,
        expr: Expr,
        deps: &mut BTreeMap<String, SourceId>,
        scopes: &mut Vec<Vec<String>>,
    ) -> Result<Expr> {
        match expr {
            // Comparison rewrite: cmp(lhs, rhs) <op> 0
            Expr::Binary(op, lhs, rhs)
                if matches!(
                    op,
                    BinaryOp::Eq | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
                ) =>
            {
                let cmp_op = match op {
                    BinaryOp::Eq => CompareOp::Eq,
                    BinaryOp::Lt => CompareOp::Lt,
                    BinaryOp::Le => CompareOp::Le,
                    BinaryOp::Gt => CompareOp::Gt,
                    BinaryOp::Ge => CompareOp::Ge,
                    _ => unreachable!(),
                };
                Ok(Expr::Compare {
                    op: cmp_op,
                    lhs: self.normalize(*lhs, deps, scopes)?.boxed(),
                    rhs: self.normalize(*rhs, deps, scopes)?.boxed(),
                })
            }

            Expr::Binary(op, lhs, rhs) => Ok(Expr::Binary(
                op,
                self.normalize(*lhs, deps, scopes)?.boxed(),
                self.normalize(*rhs, deps, scopes)?.boxed(),
            )),

            // Aggregate materialisation
            Expr::Call(callee, args) => {
                if let Expr::Ident(name) = callee.as_ref() {
                    if !is_locally_bound(name, scopes) {
                        if let Some(kind) = AggregateKind::from_name(name) {
                            if !self.options.allow_aggregates {
                                return Err(Error::AggregateNotAllowed(name.clone()));
                            }
                            let slot = self.agg_slots;
                            self.agg_slots += 1;
                            let args = args
                                .into_iter()
                                .map(|arg| self.normalize(arg, deps, scopes))
                                .collect::<Result<Vec<_>>>()?;
                            return Ok(Expr::Aggregate { slot, kind, args });
                        }
                        if is_scope_name(name) {
                            let args = args
                                .into_iter()
                                .map(|arg| self.normalize(arg, deps, scopes))
                                .collect::<Result<Vec<_>>>()?;
                            return Ok(Expr::Call(callee, args));
                        }
                    }
                }
                let callee = self.normalize(*callee, deps, scopes)?;
                let args = args
                    .into_iter()
                    .map(|arg| self.normalize(arg, deps, scopes))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::Call(callee.boxed(), args))
            }

            // `this` renames to the implicit row identifier
            Expr::This => Ok(Expr::ThisRow),

            Expr::Ident(name) => self.normalize_ident(name, deps, scopes),

            Expr::Record(entries) => {
                let entries = entries
                    .into_iter()
                    .map(|entry| {
                        Ok(match entry {
                            RecordEntry::Field(name, e) => {
                                RecordEntry::Field(name, self.normalize(e, deps, scopes)?)
                            }
                            RecordEntry::Shorthand(name) => {
                                let resolved = self.normalize_ident(name.clone(), deps, scopes)?;
                                RecordEntry::Field(name, resolved)
                            }
                            RecordEntry::Spread(e) => {
                                RecordEntry::Spread(self.normalize(e, deps, scopes)?)
                            }
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::Record(entries))
            }

            Expr::Sequence(items) => {
                let items = items
                    .into_iter()
                    .map(|item| self.normalize(item, deps, scopes))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::Sequence(items))
            }

            Expr::Member(base, field) => Ok(Expr::Member(
                self.normalize(*base, deps, scopes)?.boxed(),
                field,
            )),

            Expr::Index(base, index) => Ok(Expr::Index(
                self.normalize(*base, deps, scopes)?.boxed(),
                self.normalize(*index, deps, scopes)?.boxed(),
            )),

            Expr::Lambda(params, body) => {
                scopes.push(params.clone());
                let body = self.normalize(*body, deps, scopes);
                scopes.pop();
                Ok(Expr::Lambda(params, body?.boxed()))
            }

            Expr::Unary(op, operand) => {
                Ok(Expr::Unary(op, self.normalize(*operand, deps, scopes)?.boxed()))
            }

            // Already-compiled and literal forms pass through; the pass is
            // idempotent over its own output.
            Expr::Compare { op, lhs, rhs } => Ok(Expr::Compare {
                op,
                lhs: self.normalize(*lhs, deps, scopes)?.boxed(),
                rhs: self.normalize(*rhs, deps, scopes)?.boxed(),
            }),
            Expr::Aggregate { slot, kind, args } => {
                let args = args
                    .into_iter()
                    .map(|arg| self.normalize(arg, deps, scopes))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::Aggregate { slot, kind, args })
            }

            passthrough @ (Expr::Null
            | Expr::Bool(_)
            | Expr::Number(_)
            | Expr::Str(_)
            | Expr::ThisRow
            | Expr::Param(_)
            | Expr::SubsRef(_)) => Ok(passthrough),
        }
    }

    fn normalize_ident(
        &mut self,
        name: String,
        deps: &mut BTreeMap<String, SourceId>,
        scopes: &mut Vec<Vec<String>>,
    ) -> Result<Expr> {
        if is_locally_bound(&name, scopes) {
            return Ok(Expr::Ident(name));
        }

        if let Some(rest) = name.strip_prefix("$$") {
            return match rest {
                "this" => Ok(Expr::ThisRow),
                _ => Err(Error::ReservedName(name)),
            };
        }

        if let Some(rest) = name.strip_prefix('$') {
            if rest.is_empty() {
                return Err(Error::ReservedName(name));
            }
            return Ok(Expr::Param(rest.to_string()));
        }

        // Unbound names resolve to the standard scope first, then the schema
        if is_scope_name(&name) {
            return Ok(Expr::Ident(name));
        }

        match self.schema.resolve(&name) {
            Some(id) => {
                deps.insert(name.clone(), id);
                if self.schema.is_unknown() {
                    // Anonymous rows carry no names; read the field off the
                    // implicit row instead.
                    Ok(Expr::Member(Expr::ThisRow.boxed(), name))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            None => Err(Error::UnknownIdentifier(name)),
        }
    }
}

fn is_locally_bound(name: &str, scopes: &[Vec<String>]) -> bool {
    scopes
        .iter()
        .any(|frame| frame.iter().any(|param| param == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KeyPath;
    use crate::compile::Schema;

    fn two_source_schema() -> (Schema, SourceId, SourceId) {
        let thing = SourceId::fresh();
        let kind = SourceId::fresh();
        let mut schema = Schema::new();
        schema.insert("thing", thing);
        schema.insert("type", kind);
        (schema, thing, kind)
    }

    #[test]
    fn test_join_predicate_compiles_to_one_term() {
        let (schema, thing, kind) = two_source_schema();
        let groups = compile_terms(
            &Template::new("thing.type_id === type.id"),
            &CompileSchema::Known(&schema),
        )
        .expect("compile");
        assert_eq!(groups.terms.len(), 1);
        let term = &groups.terms[0];
        assert_eq!(term.deps.len(), 2);
        assert!(term.ranges[&thing].contains_key(&KeyPath::parse("type_id")));
        assert!(term.ranges[&kind].contains_key(&KeyPath::parse("id")));
    }

    #[test]
    fn test_conjunction_splits_by_dependency_set() {
        let (schema, thing, _) = two_source_schema();
        let groups = compile_terms(
            &Template::new("thing.calories > ? && thing.type_id === type.id").bind(100),
            &CompileSchema::Known(&schema),
        )
        .expect("compile");
        assert_eq!(groups.terms.len(), 2, "distinct dependency sets stay apart");
        let single = groups
            .terms
            .iter()
            .find(|t| t.deps.len() == 1)
            .expect("single-source term");
        assert!(single.ranges[&thing].contains_key(&KeyPath::parse("calories")));
        assert_eq!(groups.subs.len(), 1);
    }

    #[test]
    fn test_same_dependency_terms_merge() {
        let (schema, _, _) = two_source_schema();
        let groups = compile_terms(
            &Template::new("thing.a > 1 && thing.b < 2"),
            &CompileSchema::Known(&schema),
        )
        .expect("compile");
        assert_eq!(groups.terms.len(), 1);
    }

    #[test]
    fn test_free_variables_union_of_terms() {
        // Invariant: the predicate's free variables equal the union of its
        // terms' dependency sets.
        let (schema, thing, kind) = two_source_schema();
        let groups = compile_terms(
            &Template::new("thing.a > 1 && type.b < 2 && thing.c === type.d"),
            &CompileSchema::Known(&schema),
        )
        .expect("compile");
        let mut union: Vec<SourceId> = groups
            .terms
            .iter()
            .flat_map(|t| t.deps.values().copied())
            .collect();
        union.sort_unstable();
        union.dedup();
        assert_eq!(union, {
            let mut ids = vec![thing, kind];
            ids.sort_unstable();
            ids
        });
    }

    #[test]
    fn test_unknown_identifier_fails() {
        let (schema, _, _) = two_source_schema();
        let err = compile_terms(
            &Template::new("nosuch.field === 1"),
            &CompileSchema::Known(&schema),
        )
        .expect_err("must fail");
        assert_eq!(err, Error::UnknownIdentifier("nosuch".to_string()));
    }

    #[test]
    fn test_reserved_names_are_rejected() {
        let (schema, _, _) = two_source_schema();
        let err = compile_terms(
            &Template::new("$$secret === 1"),
            &CompileSchema::Known(&schema),
        )
        .expect_err("must fail");
        assert!(matches!(err, Error::ReservedName(_)));
    }

    #[test]
    fn test_dollar_names_become_parameters() {
        let (schema, _, _) = two_source_schema();
        let groups = compile_terms(
            &Template::new("thing.calories > $min"),
            &CompileSchema::Known(&schema),
        )
        .expect("compile");
        let printed = format!("{}", groups.terms[0].expr);
        assert!(printed.contains("$min"), "parameter survives as access: {}", printed);
        // Parameters are not dependencies
        assert_eq!(groups.terms[0].deps.len(), 1);
    }

    #[test]
    fn test_unknown_schema_reads_implicit_row() {
        let expr = compile_expr(
            &Template::new("name === 'Apple'"),
            &CompileSchema::Unknown,
            CompileOptions::default(),
        )
        .expect("compile");
        assert_eq!(expr.deps.values().next(), Some(&SourceId::UNKNOWN));
        let printed = format!("{}", expr.expr);
        assert!(printed.contains("$$this.name"), "rewritten: {}", printed);
    }

    #[test]
    fn test_aggregates_allocate_slots_in_order() {
        let (schema, _, _) = two_source_schema();
        let compiled = compile_expr(
            &Template::new("{total: sum(thing.calories), n: count()}"),
            &CompileSchema::Known(&schema),
            CompileOptions {
                allow_aggregates: true,
            },
        )
        .expect("compile");
        assert_eq!(compiled.agg_slots, 2);
    }

    #[test]
    fn test_aggregates_rejected_when_disallowed() {
        let (schema, _, _) = two_source_schema();
        let err = compile_expr(
            &Template::new("sum(thing.calories)"),
            &CompileSchema::Known(&schema),
            CompileOptions::default(),
        )
        .expect_err("must fail");
        assert_eq!(err, Error::AggregateNotAllowed("sum".to_string()));
    }

    #[test]
    fn test_substitution_count_mismatch() {
        let (schema, _, _) = two_source_schema();
        let err = compile_terms(
            &Template::new("thing.a > ?"),
            &CompileSchema::Known(&schema),
        )
        .expect_err("must fail");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_partial_removes_dependencies() {
        let (schema, _, _) = two_source_schema();
        let compiled = compile_expr(
            &Template::new("thing.a === type.b"),
            &CompileSchema::Known(&schema),
            CompileOptions::default(),
        )
        .expect("compile");
        assert_eq!(compiled.deps.len(), 2);
        let partial = compiled.partial([(
            "thing".to_string(),
            Value::record(crate::record! { "a" => 1 }),
        )]);
        assert_eq!(partial.deps.len(), 1);
        assert!(partial.deps.contains_key("type"));
    }
}
