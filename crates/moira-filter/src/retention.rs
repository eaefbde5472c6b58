use crate::error::{FilterError, Result};
use crate::lru::LruCache;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Step used when no section matches.
pub const DEFAULT_RETENTION: i64 = 60;

/// How long a resolved retention is remembered per metric.
const RESOLVED_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetentionSection {
    pub name: String,
    pub pattern: Regex,
    /// Seconds per point of the finest archive.
    pub step: i64,
    pub retentions: String,
}

/// Parsed `storage-schemas` style retention file.
///
/// ```text
/// [carbon]
/// pattern = ^carbon\.
/// retentions = 10s:1d,1m:30d
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetentionConfig {
    pub sections: Vec<RetentionSection>,
}

struct PendingSection {
    name: String,
    line: usize,
    pattern: Option<String>,
    retentions: Option<String>,
}

impl RetentionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// # Examples
    ///
    /// ```
    /// use moira_filter::retention::RetentionConfig;
    ///
    /// let config = RetentionConfig::parse(
    ///     "[fast]\npattern = ^fast\\.\nretentions = 10s:1d\n\n[all]\npattern = .*\nretentions = 1m:7d\n",
    /// )
    /// .unwrap();
    /// assert_eq!(config.resolve("fast.cpu"), 10);
    /// assert_eq!(config.resolve("slow.cpu"), 60);
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let mut sections = Vec::new();
        let mut current: Option<PendingSection> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if let Some(done) = current.take() {
                    sections.push(finish_section(done)?);
                }
                current = Some(PendingSection {
                    name: name.trim().to_string(),
                    line: line_no,
                    pattern: None,
                    retentions: None,
                });
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(FilterError::Retention {
                    line: line_no,
                    reason: format!("expected key = value, got {line:?}"),
                });
            };
            let Some(section) = current.as_mut() else {
                return Err(FilterError::Retention {
                    line: line_no,
                    reason: "setting outside of a section".to_string(),
                });
            };
            match key.trim() {
                "pattern" => section.pattern = Some(value.trim().to_string()),
                "retentions" => section.retentions = Some(value.trim().to_string()),
                // Carbon keys such as xFilesFactor are irrelevant here.
                _ => {}
            }
        }
        if let Some(done) = current.take() {
            sections.push(finish_section(done)?);
        }
        Ok(Self { sections })
    }

    /// Step of the first section whose pattern matches `metric`.
    pub fn resolve(&self, metric: &str) -> i64 {
        self.sections
            .iter()
            .find(|s| s.pattern.is_match(metric))
            .map(|s| s.step)
            .unwrap_or(DEFAULT_RETENTION)
    }
}

fn finish_section(pending: PendingSection) -> Result<RetentionSection> {
    let err = |reason: String| FilterError::Retention {
        line: pending.line,
        reason: format!("section [{}]: {reason}", pending.name),
    };
    let pattern = pending
        .pattern
        .as_deref()
        .ok_or_else(|| err("missing pattern".to_string()))?;
    let retentions = pending
        .retentions
        .clone()
        .ok_or_else(|| err("missing retentions".to_string()))?;
    let pattern = Regex::new(pattern).map_err(|e| err(e.to_string()))?;
    let first = retentions
        .split(',')
        .next()
        .map(str::trim)
        .unwrap_or_default();
    let (step, _keep) = first
        .split_once(':')
        .ok_or_else(|| err(format!("retention {first:?} is not step:keep")))?;
    let step = parse_duration(step).map_err(err)?;
    if step <= 0 {
        return Err(err("step must be positive".to_string()));
    }
    Ok(RetentionSection {
        name: pending.name,
        pattern,
        step,
        retentions,
    })
}

/// Parses `60`, `10s`, `1m`, `5min`, `1h`, `1d`, `1w` or `1y` into seconds.
pub fn parse_duration(text: &str) -> std::result::Result<i64, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: i64 = number
        .parse()
        .map_err(|_| format!("bad duration {text:?}"))?;
    let multiplier = match unit {
        "" | "s" => 1,
        "m" | "min" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 7 * 86_400,
        "y" => 365 * 86_400,
        _ => return Err(format!("unknown unit {unit:?} in {text:?}")),
    };
    Ok(number * multiplier)
}

/// Per-worker memo of resolved retentions.
pub struct RetentionCache {
    config: Arc<RetentionConfig>,
    resolved: LruCache<String, (i64, Instant)>,
}

impl RetentionCache {
    pub fn new(config: Arc<RetentionConfig>, capacity: usize) -> Self {
        Self {
            config,
            resolved: LruCache::new(capacity),
        }
    }

    pub fn retention(&mut self, metric: &str) -> i64 {
        let key = metric.to_string();
        if let Some((step, at)) = self.resolved.get(&key) {
            if at.elapsed() < RESOLVED_TTL {
                return *step;
            }
        }
        let step = self.config.resolve(metric);
        self.resolved.insert(key, (step, Instant::now()));
        step
    }
}
