use crate::error::{FilterError, Result};
use moira_common::types::MetricPoint;
use regex::Regex;
use std::str::FromStr;

const SERIES_BY_TAG: &str = "seriesByTag(";

/// How `=~` tag regexes are anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegexTreatment {
    /// The regex must match from the start of the value.
    #[default]
    Strict,
    /// The regex may match anywhere in the value.
    Loose,
}

impl FromStr for RegexTreatment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(RegexTreatment::Strict),
            "loose" => Ok(RegexTreatment::Loose),
            _ => Err(format!("unknown regex treatment: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOp {
    Equal,
    NotEqual,
    Match,
    NotMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSpec {
    pub key: String,
    pub op: TagOp,
    pub value: String,
}

pub fn is_tag_pattern(pattern: &str) -> bool {
    pattern.trim_start().starts_with(SERIES_BY_TAG)
}

/// Parses `seriesByTag('k=v', "k!=~re", ...)` into its tag specs.
///
/// # Examples
///
/// ```
/// use moira_filter::index::tags::{parse_series_by_tag, TagOp};
///
/// let specs = parse_series_by_tag("seriesByTag('name=cpu.*', \"dc!=~ams|fra\")").unwrap();
/// assert_eq!(specs.len(), 2);
/// assert_eq!(specs[1].op, TagOp::NotMatch);
/// assert_eq!(specs[1].value, "ams|fra");
/// ```
pub fn parse_series_by_tag(pattern: &str) -> Result<Vec<TagSpec>> {
    let trimmed = pattern.trim();
    let inner = trimmed
        .strip_prefix(SERIES_BY_TAG)
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| FilterError::pattern(pattern, "not a seriesByTag expression"))?;

    let mut specs = Vec::new();
    let mut chars = inner.char_indices().peekable();
    loop {
        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        let Some((start, quote)) = chars.next() else {
            break;
        };
        if quote != '\'' && quote != '"' {
            return Err(FilterError::pattern(pattern, "tag spec must be quoted"));
        }
        let end = chars
            .by_ref()
            .find(|(_, c)| *c == quote)
            .map(|(i, _)| i)
            .ok_or_else(|| FilterError::pattern(pattern, "unterminated quote"))?;
        specs.push(parse_spec(&inner[start + 1..end], pattern)?);

        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        match chars.next() {
            None => break,
            Some((_, ',')) => continue,
            Some(_) => return Err(FilterError::pattern(pattern, "expected ',' between specs")),
        }
    }
    if specs.is_empty() {
        return Err(FilterError::pattern(pattern, "no tag specs"));
    }
    Ok(specs)
}

fn parse_spec(spec: &str, pattern: &str) -> Result<TagSpec> {
    let op_start = spec
        .find(['!', '='])
        .ok_or_else(|| FilterError::pattern(pattern, format!("spec {spec:?} has no operator")))?;
    let key = spec[..op_start].trim();
    if key.is_empty() {
        return Err(FilterError::pattern(pattern, format!("spec {spec:?} has no key")));
    }
    let rest = &spec[op_start..];
    let (op, value) = if let Some(v) = rest.strip_prefix("!=~") {
        (TagOp::NotMatch, v)
    } else if let Some(v) = rest.strip_prefix("=~") {
        (TagOp::Match, v)
    } else if let Some(v) = rest.strip_prefix("!=") {
        (TagOp::NotEqual, v)
    } else if let Some(v) = rest.strip_prefix('=') {
        (TagOp::Equal, v)
    } else {
        return Err(FilterError::pattern(pattern, format!("bad operator in {spec:?}")));
    };
    Ok(TagSpec {
        key: key.to_string(),
        op,
        value: value.trim().to_string(),
    })
}

pub(crate) fn has_wildcards(value: &str) -> bool {
    value.contains(['*', '?', '{'])
}

/// Rewrites Graphite wildcards as a regex body: `{a,b}` to `(a|b)`, `*` to
/// `.*`, `?` to `.` and `[...]` to a character class (`[!...]` negated).
/// Everything else is escaped, including commas outside a brace group and
/// a `[` that is never closed.
///
/// ```
/// use moira_filter::index::tags::wildcard_to_regex;
///
/// assert_eq!(wildcard_to_regex("a*.{x,y}?"), r"a.*\.(x|y).");
/// assert_eq!(wildcard_to_regex("[!a-c]/["), r"[^a-c]/\[");
/// ```
pub fn wildcard_to_regex(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut out = String::with_capacity(value.len() * 2);
    let mut depth = 0usize;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '{' => {
                depth += 1;
                out.push('(');
            }
            '}' if depth > 0 => {
                depth -= 1;
                out.push(')');
            }
            ',' if depth > 0 => out.push('|'),
            '[' => {
                let class = chars[i + 1..]
                    .iter()
                    .position(|c| *c == ']')
                    .filter(|len| *len > 0)
                    .map(|len| &chars[i + 1..i + 1 + len]);
                if let Some(class) = class {
                    push_class(&mut out, class);
                    i += class.len() + 2;
                    continue;
                }
                out.push_str(r"\[");
            }
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
        i += 1;
    }
    out
}

fn push_class(out: &mut String, class: &[char]) {
    out.push('[');
    let last = class.len() - 1;
    for (j, c) in class.iter().enumerate() {
        match c {
            '!' | '^' if j == 0 => out.push('^'),
            '-' if j > 0 && j < last => out.push('-'),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push(']');
}

#[derive(Debug)]
enum ValueMatcher {
    Equal(String),
    NotEqual(String),
    Match(Regex),
    NotMatch(Regex),
}

impl ValueMatcher {
    fn compile(spec: &TagSpec, treatment: RegexTreatment, pattern: &str) -> Result<Self> {
        let regex = |source: String| {
            Regex::new(&source).map_err(|e| FilterError::pattern(pattern, e.to_string()))
        };
        Ok(match spec.op {
            TagOp::Equal if has_wildcards(&spec.value) => {
                ValueMatcher::Match(regex(format!("^(?:{})$", wildcard_to_regex(&spec.value)))?)
            }
            TagOp::NotEqual if has_wildcards(&spec.value) => ValueMatcher::NotMatch(regex(
                format!("^(?:{})$", wildcard_to_regex(&spec.value)),
            )?),
            TagOp::Equal => ValueMatcher::Equal(spec.value.clone()),
            TagOp::NotEqual => ValueMatcher::NotEqual(spec.value.clone()),
            TagOp::Match => ValueMatcher::Match(regex(anchor(&spec.value, treatment))?),
            TagOp::NotMatch => ValueMatcher::NotMatch(regex(anchor(&spec.value, treatment))?),
        })
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            ValueMatcher::Equal(v) => v == value,
            ValueMatcher::NotEqual(v) => v != value,
            ValueMatcher::Match(re) => re.is_match(value),
            ValueMatcher::NotMatch(re) => !re.is_match(value),
        }
    }
}

fn anchor(source: &str, treatment: RegexTreatment) -> String {
    match treatment {
        RegexTreatment::Strict if !source.starts_with('^') => format!("^(?:{source})"),
        _ => source.to_string(),
    }
}

/// Residual handler: the tag specs left after the name index narrowed the
/// candidates, compiled once.
#[derive(Debug)]
pub struct TagMatcher {
    specs: Vec<(String, ValueMatcher)>,
}

impl TagMatcher {
    pub fn compile(specs: &[TagSpec], treatment: RegexTreatment, pattern: &str) -> Result<Self> {
        let specs = specs
            .iter()
            .map(|spec| {
                ValueMatcher::compile(spec, treatment, pattern).map(|m| (spec.key.clone(), m))
            })
            .collect::<Result<_>>()?;
        Ok(Self { specs })
    }

    /// Absent labels compare as the empty string.
    pub fn matches(&self, point: &MetricPoint) -> bool {
        self.specs
            .iter()
            .all(|(key, m)| m.matches(point.label(key).unwrap_or("")))
    }
}

/// A compiled `seriesByTag` pattern.
#[derive(Debug)]
pub struct TagPattern {
    pub pattern: String,
    /// Value of the first `name=` spec; routes the pattern through the name
    /// tree.
    pub name: Option<String>,
    pub residual: TagMatcher,
}

impl TagPattern {
    pub fn compile(pattern: &str, treatment: RegexTreatment) -> Result<Self> {
        let mut specs = parse_series_by_tag(pattern)?;
        let name_idx = specs
            .iter()
            .position(|s| s.key == "name" && s.op == TagOp::Equal && !s.value.is_empty());
        let name = name_idx.map(|i| specs.remove(i).value);
        let residual = TagMatcher::compile(&specs, treatment, pattern)?;
        Ok(Self {
            pattern: pattern.to_string(),
            name,
            residual,
        })
    }
}
