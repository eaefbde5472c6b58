//! Pattern index: which trigger patterns does a point satisfy?
//!
//! Dotted Graphite patterns go into a [`tree::PrefixTree`]. `seriesByTag`
//! patterns with a `name=` spec go into a second prefix tree keyed by that
//! name; the others form an unrestricted list. Candidates from either tag
//! path are confirmed by their residual [`tags::TagMatcher`].

pub mod tags;
pub mod tree;

use crate::lru::LruCache;
use moira_common::types::MetricPoint;
use std::sync::Arc;
use tags::{is_tag_pattern, RegexTreatment, TagPattern};
use tree::PrefixTree;

/// Compiled tag patterns reused across rebuilds, keyed by pattern string.
pub type MatcherCache = LruCache<String, Arc<TagPattern>>;

/// Immutable index over one pattern set.
#[derive(Default)]
pub struct PatternIndex {
    plain: PrefixTree<String>,
    names: PrefixTree<usize>,
    tagged: Vec<Arc<TagPattern>>,
    unrestricted: Vec<usize>,
    size: usize,
}

impl PatternIndex {
    /// Builds the index. Malformed patterns are logged and left out.
    pub fn build(patterns: &[String], cache: &mut MatcherCache, treatment: RegexTreatment) -> Self {
        let mut index = PatternIndex::default();
        let mut sorted: Vec<&String> = patterns.iter().collect();
        sorted.sort();
        sorted.dedup();

        for pattern in sorted {
            if is_tag_pattern(pattern) {
                let compiled = match cache.get(pattern) {
                    Some(compiled) => compiled.clone(),
                    None => match TagPattern::compile(pattern, treatment) {
                        Ok(compiled) => {
                            let compiled = Arc::new(compiled);
                            cache.insert(pattern.clone(), compiled.clone());
                            compiled
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Skipping malformed pattern");
                            continue;
                        }
                    },
                };
                let slot = index.tagged.len();
                match &compiled.name {
                    Some(name) => {
                        if let Err(e) = index.names.insert(name, slot) {
                            tracing::warn!(error = %e, "Skipping malformed pattern");
                            continue;
                        }
                    }
                    None => index.unrestricted.push(slot),
                }
                index.tagged.push(compiled);
            } else if let Err(e) = index.plain.insert(pattern, pattern.clone()) {
                tracing::warn!(error = %e, "Skipping malformed pattern");
                continue;
            }
            index.size += 1;
        }
        index
    }

    /// Number of patterns that made it into the index.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Patterns `point` satisfies, sorted and without duplicates.
    ///
    /// Points without labels are tried against both dotted and tag patterns;
    /// labelled points only against tag patterns.
    pub fn match_point(&self, point: &MetricPoint) -> Vec<String> {
        let mut matched = Vec::new();
        if point.labels.is_empty() {
            matched.extend(self.plain.matches(&point.name).into_iter().cloned());
        }
        for &slot in self.names.matches(&point.name) {
            let candidate = &self.tagged[slot];
            if candidate.residual.matches(point) {
                matched.push(candidate.pattern.clone());
            }
        }
        for &slot in &self.unrestricted {
            let candidate = &self.tagged[slot];
            if candidate.residual.matches(point) {
                matched.push(candidate.pattern.clone());
            }
        }
        matched.sort();
        matched.dedup();
        matched
    }
}
