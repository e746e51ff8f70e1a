//! Event filter builder.
//!
//! Projectors declare which `(stream, event type)` pairs they care about.
//! The catchup unions those declarations into a single [`EventFilter`] so one
//! query serves every projector, grouped per stream to keep the predicate
//! small: `OR` over `stream_name = s AND type IN {...}`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};

use crate::StoredEvent;

/// Which streams an interest covers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StreamMatch {
    Any,
    Named(String),
}

/// Which event types an interest covers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TypeMatch {
    Any,
    Exact(String),
    /// Every type starting with the prefix, e.g. `Scheduled:` for all
    /// scheduled commands of a stream.
    Prefix(String),
}

impl TypeMatch {
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            TypeMatch::Any => true,
            TypeMatch::Exact(t) => t == event_type,
            TypeMatch::Prefix(p) => event_type.starts_with(p.as_str()),
        }
    }
}

/// A single `(stream, type)` declaration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Interest {
    pub stream: StreamMatch,
    pub event_type: TypeMatch,
}

impl Interest {
    /// One event type on one stream.
    pub fn event(stream: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            stream: StreamMatch::Named(stream.into()),
            event_type: TypeMatch::Exact(event_type.into()),
        }
    }

    /// Every event type on one stream.
    pub fn stream(stream: impl Into<String>) -> Self {
        Self {
            stream: StreamMatch::Named(stream.into()),
            event_type: TypeMatch::Any,
        }
    }

    /// Every event type on one stream whose name starts with `prefix`.
    pub fn prefix(stream: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            stream: StreamMatch::Named(stream.into()),
            event_type: TypeMatch::Prefix(prefix.into()),
        }
    }

    /// One event type on any stream.
    pub fn any_stream(event_type: impl Into<String>) -> Self {
        Self {
            stream: StreamMatch::Any,
            event_type: TypeMatch::Exact(event_type.into()),
        }
    }

    /// Every event type on any stream whose name starts with `prefix`.
    pub fn any_stream_prefix(prefix: impl Into<String>) -> Self {
        Self {
            stream: StreamMatch::Any,
            event_type: TypeMatch::Prefix(prefix.into()),
        }
    }

    /// Every event in the store.
    pub fn all() -> Self {
        Self {
            stream: StreamMatch::Any,
            event_type: TypeMatch::Any,
        }
    }

    pub fn is_universal(&self) -> bool {
        self.stream == StreamMatch::Any && self.event_type == TypeMatch::Any
    }

    pub fn matches(&self, stream_name: &str, event_type: &str) -> bool {
        let stream_ok = match &self.stream {
            StreamMatch::Any => true,
            StreamMatch::Named(s) => s == stream_name,
        };
        stream_ok && self.event_type.matches(event_type)
    }
}

impl std::fmt::Display for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.stream {
            StreamMatch::Any => f.write_str("*")?,
            StreamMatch::Named(s) => f.write_str(s)?,
        }
        f.write_str(".")?;
        match &self.event_type {
            TypeMatch::Any => f.write_str("*"),
            TypeMatch::Exact(t) => f.write_str(t),
            TypeMatch::Prefix(p) => write!(f, "{p}*"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TypeSet {
    any: bool,
    exact: BTreeSet<String>,
    prefixes: BTreeSet<String>,
}

impl TypeSet {
    fn insert(&mut self, event_type: &TypeMatch) {
        match event_type {
            TypeMatch::Any => self.any = true,
            TypeMatch::Exact(t) => {
                self.exact.insert(t.clone());
            }
            TypeMatch::Prefix(p) => {
                self.prefixes.insert(p.clone());
            }
        }
    }

    fn normalize(&mut self) {
        if self.any {
            self.exact.clear();
            self.prefixes.clear();
            return;
        }
        let prefixes = self.prefixes.clone();
        self.exact
            .retain(|t| !prefixes.iter().any(|p| t.starts_with(p.as_str())));
    }

    fn is_empty(&self) -> bool {
        !self.any && self.exact.is_empty() && self.prefixes.is_empty()
    }

    fn matches(&self, event_type: &str) -> bool {
        self.any
            || self.exact.contains(event_type)
            || self.prefixes.iter().any(|p| event_type.starts_with(p.as_str()))
    }

    fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        if self.any {
            qb.push("TRUE");
            return;
        }
        let mut first = true;
        qb.push("(");
        if !self.exact.is_empty() {
            qb.push("event_type = ANY(");
            qb.push_bind(self.exact.iter().cloned().collect::<Vec<String>>());
            qb.push(")");
            first = false;
        }
        for prefix in &self.prefixes {
            if !first {
                qb.push(" OR ");
            }
            qb.push("starts_with(event_type, ");
            qb.push_bind(prefix.clone());
            qb.push(")");
            first = false;
        }
        qb.push(")");
    }
}

/// A predicate over stored events built from a set of interests.
///
/// The empty filter matches nothing, so a catchup whose projectors declare
/// no interest never scans the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    match_all: bool,
    any_stream: TypeSet,
    streams: BTreeMap<String, TypeSet>,
}

impl EventFilter {
    /// A filter matching every event.
    pub fn everything() -> Self {
        Self {
            match_all: true,
            ..Default::default()
        }
    }

    /// A filter matching no event.
    pub fn nothing() -> Self {
        Self::default()
    }

    /// Builds the union of the given interests.
    pub fn from_interests<'a>(interests: impl IntoIterator<Item = &'a Interest>) -> Self {
        let mut filter = Self::default();
        for interest in interests {
            if interest.is_universal() {
                return Self::everything();
            }
            match &interest.stream {
                StreamMatch::Any => filter.any_stream.insert(&interest.event_type),
                StreamMatch::Named(stream) => filter
                    .streams
                    .entry(stream.clone())
                    .or_default()
                    .insert(&interest.event_type),
            }
        }
        filter.any_stream.normalize();
        for types in filter.streams.values_mut() {
            types.normalize();
        }
        let any_stream = filter.any_stream.clone();
        if !any_stream.is_empty() {
            // stream groups already covered by an any-stream type set add nothing
            for types in filter.streams.values_mut() {
                types.exact.retain(|t| !any_stream.matches(t));
            }
            filter.streams.retain(|_, types| !types.is_empty());
        }
        filter
    }

    pub fn is_everything(&self) -> bool {
        self.match_all
    }

    pub fn is_nothing(&self) -> bool {
        !self.match_all && self.any_stream.is_empty() && self.streams.is_empty()
    }

    /// Number of per-stream groups in the predicate.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn matches(&self, stream_name: &str, event_type: &str) -> bool {
        if self.match_all {
            return true;
        }
        if self.any_stream.matches(event_type) {
            return true;
        }
        self.streams
            .get(stream_name)
            .is_some_and(|types| types.matches(event_type))
    }

    pub fn matches_event(&self, event: &StoredEvent) -> bool {
        self.matches(&event.stream_name, &event.event_type)
    }

    /// Appends this filter as a parenthesized boolean SQL expression over the
    /// `stream_name` and `event_type` columns.
    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        if self.match_all {
            qb.push("TRUE");
            return;
        }
        if self.is_nothing() {
            qb.push("FALSE");
            return;
        }
        qb.push("(");
        let mut first = true;
        if !self.any_stream.is_empty() {
            self.any_stream.push_sql(qb);
            first = false;
        }
        for (stream, types) in &self.streams {
            if !first {
                qb.push(" OR ");
            }
            qb.push("(stream_name = ");
            qb.push_bind(stream.clone());
            if !types.any {
                qb.push(" AND ");
                types.push_sql(qb);
            }
            qb.push(")");
            first = false;
        }
        qb.push(")");
    }
}

impl std::fmt::Display for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.match_all {
            return f.write_str("*");
        }
        if self.is_nothing() {
            return f.write_str("(none)");
        }
        let mut parts = Vec::new();
        let render = |stream: &str, types: &TypeSet, parts: &mut Vec<String>| {
            if types.any {
                parts.push(format!("{stream}.*"));
            }
            for t in &types.exact {
                parts.push(format!("{stream}.{t}"));
            }
            for p in &types.prefixes {
                parts.push(format!("{stream}.{p}*"));
            }
        };
        render("*", &self.any_stream, &mut parts);
        for (stream, types) in &self.streams {
            render(stream, types, &mut parts);
        }
        f.write_str(&parts.join(" | "))
    }
}
