//! In-process dispatch of events to subscribed projectors.

use std::collections::HashMap;

use event_store::{Interest, StreamMatch, TypeMatch};

/// Routes `(stream, event type)` pairs to the projectors interested in them.
///
/// Projectors are identified by their index in the catchup's projector list.
/// Lookup is by tag, through one table per kind of interest, and the result
/// is in ascending index order so every event reaches projectors in the same
/// order.
#[derive(Debug, Default)]
pub struct EventBus {
    exact: HashMap<String, HashMap<String, Vec<usize>>>,
    whole_stream: HashMap<String, Vec<usize>>,
    stream_prefix: HashMap<String, Vec<(String, usize)>>,
    any_stream: HashMap<String, Vec<usize>>,
    any_stream_prefix: Vec<(String, usize)>,
    universal: Vec<usize>,
    subscribed: Vec<usize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes projector `index` to `interests`. Subscribing the same
    /// projector twice has no effect.
    pub fn subscribe(&mut self, index: usize, interests: &[Interest]) {
        if self.is_subscribed(index) {
            return;
        }
        self.subscribed.push(index);
        for interest in interests {
            match (&interest.stream, &interest.event_type) {
                (StreamMatch::Named(s), TypeMatch::Exact(t)) => self
                    .exact
                    .entry(s.clone())
                    .or_default()
                    .entry(t.clone())
                    .or_default()
                    .push(index),
                (StreamMatch::Named(s), TypeMatch::Any) => {
                    self.whole_stream.entry(s.clone()).or_default().push(index)
                }
                (StreamMatch::Named(s), TypeMatch::Prefix(p)) => self
                    .stream_prefix
                    .entry(s.clone())
                    .or_default()
                    .push((p.clone(), index)),
                (StreamMatch::Any, TypeMatch::Exact(t)) => {
                    self.any_stream.entry(t.clone()).or_default().push(index)
                }
                (StreamMatch::Any, TypeMatch::Prefix(p)) => {
                    self.any_stream_prefix.push((p.clone(), index))
                }
                (StreamMatch::Any, TypeMatch::Any) => self.universal.push(index),
            }
        }
    }

    pub fn is_subscribed(&self, index: usize) -> bool {
        self.subscribed.contains(&index)
    }

    /// Indices of subscribed projectors, in subscription order.
    pub fn subscribed(&self) -> &[usize] {
        &self.subscribed
    }

    /// Projectors interested in an event, ascending and without duplicates.
    pub fn route(&self, stream_name: &str, event_type: &str) -> Vec<usize> {
        let mut targets = Vec::new();
        if let Some(types) = self.exact.get(stream_name)
            && let Some(indices) = types.get(event_type)
        {
            targets.extend_from_slice(indices);
        }
        if let Some(indices) = self.whole_stream.get(stream_name) {
            targets.extend_from_slice(indices);
        }
        if let Some(prefixes) = self.stream_prefix.get(stream_name) {
            targets.extend(
                prefixes
                    .iter()
                    .filter(|(p, _)| event_type.starts_with(p.as_str()))
                    .map(|(_, i)| *i),
            );
        }
        if let Some(indices) = self.any_stream.get(event_type) {
            targets.extend_from_slice(indices);
        }
        targets.extend(
            self.any_stream_prefix
                .iter()
                .filter(|(p, _)| event_type.starts_with(p.as_str()))
                .map(|(_, i)| *i),
        );
        targets.extend_from_slice(&self.universal);

        targets.sort_unstable();
        targets.dedup();
        targets
    }
}
