//! Property-based tests for pattern index soundness.

use moira_common::types::MetricPoint;
use moira_filter::index::tags::wildcard_to_regex;
use moira_filter::index::{MatcherCache, PatternIndex};
use moira_filter::RegexTreatment;
use proptest::prelude::*;
use regex::Regex;
use std::collections::BTreeMap;

/// Part-by-part textual matcher used as the oracle.
fn textual_match(pattern: &str, name: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let name_parts: Vec<&str> = name.split('.').collect();
    if pattern_parts.len() != name_parts.len() {
        return false;
    }
    pattern_parts.iter().zip(&name_parts).all(|(p, n)| {
        let re = Regex::new(&format!("^(?:{})$", wildcard_to_regex(p))).unwrap();
        re.is_match(n)
    })
}

fn token() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-c]{1,2}",
        Just("*".to_string()),
        Just("?".to_string()),
        Just("{a,b}".to_string()),
        Just("{ab,c}".to_string()),
        Just("[a/]".to_string()),
        Just("[!b]".to_string()),
        Just("/".to_string()),
    ]
}

fn pattern_part() -> impl Strategy<Value = String> {
    prop::collection::vec(token(), 1..=3).prop_map(|tokens| tokens.concat())
}

fn pattern() -> impl Strategy<Value = String> {
    prop::collection::vec(pattern_part(), 1..=3).prop_map(|parts| parts.join("."))
}

fn metric_name() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-c/_:!#-]{1,4}", 1..=3).prop_map(|parts| parts.join("."))
}

fn plain(name: &str) -> MetricPoint {
    MetricPoint {
        name: name.to_string(),
        labels: BTreeMap::new(),
        value: 0.0,
        timestamp: 0,
    }
}

proptest! {
    #[test]
    fn index_agrees_with_textual_matcher(
        patterns in prop::collection::vec(pattern(), 1..6),
        name in metric_name(),
    ) {
        let index = PatternIndex::build(&patterns, &mut MatcherCache::new(8), RegexTreatment::Strict);
        let mut expected: Vec<String> = patterns
            .iter()
            .filter(|p| textual_match(p, &name))
            .cloned()
            .collect();
        expected.sort();
        expected.dedup();
        prop_assert_eq!(index.match_point(&plain(&name)), expected);
    }

    #[test]
    fn rebuild_order_does_not_change_matches(
        patterns in prop::collection::vec(pattern(), 1..6),
        name in metric_name(),
    ) {
        let mut reversed = patterns.clone();
        reversed.reverse();
        let a = PatternIndex::build(&patterns, &mut MatcherCache::new(8), RegexTreatment::Strict);
        let b = PatternIndex::build(&reversed, &mut MatcherCache::new(8), RegexTreatment::Strict);
        prop_assert_eq!(a.match_point(&plain(&name)), b.match_point(&plain(&name)));
    }
}
