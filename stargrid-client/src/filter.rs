//! # Filter Expressions
//!
//! Pure data model for server-side transaction filtering. A [`FilterExpr`]
//! is a small boolean-combinator tree over event attribute values; the
//! client only constructs and serializes it, all matching happens on the
//! server. Trees are immutable once built and serialize structurally, so a
//! serialized filter re-parses into an equal tree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A boolean expression over a single event attribute value.
///
/// The wire form is the externally tagged JSON object the server expects:
/// `{"match": v}`, `{"not": e}`, `{"allOf": [..]}`, `{"anyOf": [..]}`,
/// `{"oneOf": [..]}`. Child order within the combinator arrays is
/// preserved as given by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterExpr {
    /// Leaf: the attribute value equals the given string.
    Match(String),
    /// Negation of the inner expression.
    Not(Box<FilterExpr>),
    /// Every child expression must match.
    AllOf(Vec<FilterExpr>),
    /// At least one child expression must match.
    AnyOf(Vec<FilterExpr>),
    /// Exactly one child expression must match.
    OneOf(Vec<FilterExpr>),
}

impl FilterExpr {
    /// Leaf expression: attribute value equals `value`.
    pub fn matches(value: impl Into<String>) -> Self {
        FilterExpr::Match(value.into())
    }

    pub fn not(expr: FilterExpr) -> Self {
        FilterExpr::Not(Box::new(expr))
    }

    pub fn all_of(exprs: impl IntoIterator<Item = FilterExpr>) -> Self {
        FilterExpr::AllOf(exprs.into_iter().collect())
    }

    pub fn any_of(exprs: impl IntoIterator<Item = FilterExpr>) -> Self {
        FilterExpr::AnyOf(exprs.into_iter().collect())
    }

    pub fn one_of(exprs: impl IntoIterator<Item = FilterExpr>) -> Self {
        FilterExpr::OneOf(exprs.into_iter().collect())
    }
}

/// Filters for the attributes of a single named event. Multiple attribute
/// entries combine with an implicit AND.
pub type AttributeFilters = BTreeMap<String, FilterExpr>;

/// A mapping from event name to per-attribute filter expressions.
///
/// "Subscribe to events named K whose attribute A satisfies E, for every
/// (A, E) pair." Backed by ordered maps so serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct EventFilter(pub BTreeMap<String, AttributeFilters>);

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter expression for one attribute of one event.
    pub fn with(mut self, event: impl Into<String>, attr: impl Into<String>, expr: FilterExpr) -> Self {
        self.0
            .entry(event.into())
            .or_default()
            .insert(attr.into(), expr);
        self
    }
}
