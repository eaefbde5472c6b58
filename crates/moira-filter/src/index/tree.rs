use crate::error::{FilterError, Result};
use crate::index::tags::wildcard_to_regex;
use regex::Regex;
use std::collections::HashMap;

const WILDCARD_CHARS: &[char] = &['*', '?', '{', '}', '[', ']'];

/// How a non-literal pattern part matches a metric part.
#[derive(Debug)]
enum PartMatcher {
    /// `*` alone: any single part.
    Any,
    /// Every brace-expanded alternative folded into one anchored regex.
    Regex(Regex),
}

impl PartMatcher {
    fn parse(part: &str, pattern: &str) -> Result<Self> {
        if part == "*" {
            return Ok(PartMatcher::Any);
        }
        let alternatives =
            expand_braces(part).map_err(|reason| FilterError::pattern(pattern, reason))?;
        let body: Vec<String> = alternatives.iter().map(|alt| wildcard_to_regex(alt)).collect();
        let re = Regex::new(&format!("^(?:{})$", body.join("|")))
            .map_err(|e| FilterError::pattern(pattern, e.to_string()))?;
        Ok(PartMatcher::Regex(re))
    }

    fn matches(&self, part: &str) -> bool {
        match self {
            PartMatcher::Any => true,
            PartMatcher::Regex(re) => re.is_match(part),
        }
    }
}

/// Expands `{a,b}` groups into every alternative.
///
/// `x{a,b}y{1,2}` becomes `xay1 xay2 xby1 xby2`. Nested groups are expanded
/// recursively.
pub(crate) fn expand_braces(part: &str) -> std::result::Result<Vec<String>, String> {
    let Some(open) = part.find('{') else {
        if part.contains('}') {
            return Err(format!("unbalanced '}}' in {part:?}"));
        }
        return Ok(vec![part.to_string()]);
    };
    if part[..open].contains('}') {
        return Err(format!("unbalanced '}}' in {part:?}"));
    }

    let mut depth = 0usize;
    let mut close = None;
    let mut splits = Vec::new();
    for (i, c) in part[open..].char_indices() {
        let i = open + i;
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            ',' if depth == 1 => splits.push(i),
            _ => {}
        }
    }
    let Some(close) = close else {
        return Err(format!("unbalanced '{{' in {part:?}"));
    };

    let prefix = &part[..open];
    let suffixes = expand_braces(&part[close + 1..])?;
    let mut bounds = vec![open];
    bounds.extend(splits);
    bounds.push(close);

    let mut out = Vec::new();
    for window in bounds.windows(2) {
        let alt = &part[window[0] + 1..window[1]];
        for expanded in expand_braces(alt)? {
            for suffix in &suffixes {
                out.push(format!("{prefix}{expanded}{suffix}"));
            }
        }
    }
    Ok(out)
}

struct Node<T> {
    literal: HashMap<String, usize>,
    wildcard: Vec<(String, PartMatcher, usize)>,
    terminals: Vec<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            literal: HashMap::new(),
            wildcard: Vec::new(),
            terminals: Vec::new(),
        }
    }
}

/// Prefix tree over dot-separated Graphite patterns.
///
/// Nodes live in an arena; each edge is one pattern part. Matching walks the
/// tree one metric part at a time, following literal edges by hash and
/// testing wildcard edges.
pub struct PrefixTree<T> {
    nodes: Vec<Node<T>>,
}

impl<T> Default for PrefixTree<T> {
    fn default() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }
}

impl<T> PrefixTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `pattern` with `payload` returned on match.
    pub fn insert(&mut self, pattern: &str, payload: T) -> Result<()> {
        if pattern.is_empty() {
            return Err(FilterError::pattern(pattern, "empty pattern"));
        }
        // Parse every part first so a bad pattern leaves the tree untouched.
        let parts: Vec<(&str, Option<PartMatcher>)> = pattern
            .split('.')
            .map(|part| {
                if part.contains(WILDCARD_CHARS) {
                    PartMatcher::parse(part, pattern).map(|m| (part, Some(m)))
                } else {
                    Ok((part, None))
                }
            })
            .collect::<Result<_>>()?;

        let mut node = 0;
        for (part, matcher) in parts {
            node = match matcher {
                None => match self.nodes[node].literal.get(part) {
                    Some(&child) => child,
                    None => {
                        let child = self.push_node();
                        self.nodes[node].literal.insert(part.to_string(), child);
                        child
                    }
                },
                Some(matcher) => {
                    let existing = self.nodes[node]
                        .wildcard
                        .iter()
                        .find(|(raw, _, _)| raw == part)
                        .map(|(_, _, child)| *child);
                    match existing {
                        Some(child) => child,
                        None => {
                            let child = self.push_node();
                            self.nodes[node]
                                .wildcard
                                .push((part.to_string(), matcher, child));
                            child
                        }
                    }
                }
            };
        }
        self.nodes[node].terminals.push(payload);
        Ok(())
    }

    fn push_node(&mut self) -> usize {
        self.nodes.push(Node::default());
        self.nodes.len() - 1
    }

    /// Payloads of every pattern matching the dotted `name`.
    pub fn matches(&self, name: &str) -> Vec<&T> {
        let mut current = vec![0usize];
        let mut next = Vec::new();
        for part in name.split('.') {
            for &id in &current {
                let node = &self.nodes[id];
                if let Some(&child) = node.literal.get(part) {
                    next.push(child);
                }
                for (_, matcher, child) in &node.wildcard {
                    if matcher.matches(part) {
                        next.push(*child);
                    }
                }
            }
            std::mem::swap(&mut current, &mut next);
            next.clear();
            if current.is_empty() {
                return Vec::new();
            }
        }
        current
            .into_iter()
            .flat_map(|id| self.nodes[id].terminals.iter())
            .collect()
    }
}
