//! Graphite target language.
//!
//! A target is a metric pattern (dotted or `seriesByTag(...)`) optionally
//! wrapped in series functions. Parsing is done once per check; the leaf
//! patterns are resolved by a [`crate::source::MetricSource`] and the
//! functions are applied on the fetched series.

mod functions;

use crate::error::{CheckError, Result};
use crate::series::Series;
use std::collections::HashMap;
use std::fmt;

pub use functions::FUNCTIONS;

const SERIES_BY_TAG: &str = "seriesByTag";

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// A pattern resolved directly against the store.
    Path(String),
    Call { name: String, args: Vec<Arg> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Series(Target),
    Number(f64),
    Str(String),
}

impl Target {
    /// Parses a full target expression.
    ///
    /// # Examples
    ///
    /// ```
    /// use moira_checker::target::Target;
    ///
    /// let target = Target::parse("sumSeries(web.{a,b}.rps)").unwrap();
    /// assert_eq!(target.patterns(), vec!["web.{a,b}.rps".to_string()]);
    /// assert!(Target::parse("nope(web.rps)").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Target> {
        let mut parser = Parser {
            text,
            chars: text.char_indices().collect(),
            pos: 0,
        };
        let target = parser.series()?;
        parser.skip_ws();
        if parser.pos < parser.chars.len() {
            return Err(parser.error("trailing input"));
        }
        Ok(target)
    }

    /// Leaf patterns in order of appearance, without duplicates.
    pub fn patterns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_patterns(&mut out);
        out
    }

    fn collect_patterns(&self, out: &mut Vec<String>) {
        match self {
            Target::Path(p) => {
                if !out.contains(p) {
                    out.push(p.clone());
                }
            }
            Target::Call { args, .. } => {
                for arg in args {
                    if let Arg::Series(t) = arg {
                        t.collect_patterns(out);
                    }
                }
            }
        }
    }

    /// Applies the functions over `resolved`, which maps each leaf pattern
    /// to the series it matched.
    pub fn evaluate(&self, resolved: &HashMap<String, Vec<Series>>) -> Result<Vec<Series>> {
        match self {
            Target::Path(p) => Ok(resolved.get(p).cloned().unwrap_or_default()),
            Target::Call { name, args } => {
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(match arg {
                        Arg::Series(t) => functions::Value::Series(t.evaluate(resolved)?),
                        Arg::Number(n) => functions::Value::Number(*n),
                        Arg::Str(s) => functions::Value::Str(s.clone()),
                    });
                }
                functions::apply(name, &self.to_string(), evaluated)
            }
        }
    }
}

/// Every leaf pattern used by `targets`, sorted and deduplicated.
pub fn patterns_of(targets: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for target in targets {
        out.extend(Target::parse(target)?.patterns());
    }
    out.sort();
    out.dedup();
    Ok(out)
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Path(p) => f.write_str(p),
            Target::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    match arg {
                        Arg::Series(t) => write!(f, "{t}")?,
                        Arg::Number(n) => write!(f, "{n}")?,
                        Arg::Str(s) => write!(f, "\"{s}\"")?,
                    }
                }
                f.write_str(")")
            }
        }
    }
}

struct Parser<'a> {
    text: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> CheckError {
        CheckError::target(self.text, format!("{reason} at offset {}", self.offset()))
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(i, _)| *i)
            .unwrap_or(self.text.len())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn series(&mut self) -> Result<Target> {
        self.skip_ws();
        let start = self.pos;
        let token = self.path_token()?;
        if token.is_empty() {
            return Err(self.error("expected a metric path or function"));
        }
        if self.peek() != Some('(') {
            return Ok(Target::Path(token));
        }
        if token == SERIES_BY_TAG {
            self.pos = start;
            return self.series_by_tag();
        }
        if !FUNCTIONS.contains(&token.as_str()) {
            return Err(CheckError::target(
                self.text,
                format!("unknown function {token}"),
            ));
        }
        self.pos += 1;
        let mut args = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(')') {
                self.pos += 1;
                break;
            }
            args.push(self.arg()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(')') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
        Ok(Target::Call { name: token, args })
    }

    fn arg(&mut self) -> Result<Arg> {
        self.skip_ws();
        match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.pos += 1;
                let mut s = String::new();
                loop {
                    match self.peek() {
                        Some(c) if c == q => {
                            self.pos += 1;
                            return Ok(Arg::Str(s));
                        }
                        Some(c) => {
                            s.push(c);
                            self.pos += 1;
                        }
                        None => return Err(self.error("unterminated string")),
                    }
                }
            }
            _ => {
                let start = self.pos;
                let token = self.path_token()?;
                if self.peek() != Some('(') {
                    if let Ok(n) = token.parse::<f64>() {
                        return Ok(Arg::Number(n));
                    }
                }
                self.pos = start;
                Ok(Arg::Series(self.series()?))
            }
        }
    }

    /// Reads a path or identifier. Commas inside `{...}` belong to the path.
    fn path_token(&mut self) -> Result<String> {
        let mut out = String::new();
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            match c {
                '{' => depth += 1,
                '}' => {
                    if depth == 0 {
                        return Err(self.error("unbalanced '}'"));
                    }
                    depth -= 1;
                }
                ',' if depth > 0 => {}
                '(' | ')' | ',' | '"' | '\'' => break,
                c if c.is_whitespace() => break,
                _ => {}
            }
            out.push(c);
            self.pos += 1;
        }
        if depth > 0 {
            return Err(self.error("unbalanced '{'"));
        }
        Ok(out)
    }

    /// Captures `seriesByTag(...)` verbatim so it matches the stored
    /// pattern text.
    fn series_by_tag(&mut self) -> Result<Target> {
        let start = self.offset();
        self.pos += SERIES_BY_TAG.chars().count();
        self.pos += 1;
        let mut quote = None;
        loop {
            match (self.peek(), quote) {
                (None, _) => return Err(self.error("unterminated seriesByTag")),
                (Some(c), Some(q)) if c == q => quote = None,
                (Some(_), Some(_)) => {}
                (Some(c @ ('"' | '\'')), None) => quote = Some(c),
                (Some(')'), None) => {
                    self.pos += 1;
                    break;
                }
                (Some(_), None) => {}
            }
            self.pos += 1;
        }
        let end = self.offset();
        Ok(Target::Path(self.text[start..end].to_string()))
    }
}
