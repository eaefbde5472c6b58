use crate::error::{CheckError, Result};
use crate::series::Series;

/// Function names accepted by the parser.
pub const FUNCTIONS: &[&str] = &[
    "sumSeries",
    "sum",
    "averageSeries",
    "avg",
    "minSeries",
    "maxSeries",
    "diffSeries",
    "scale",
    "offset",
    "absolute",
    "transformNull",
    "alias",
    "aliasByNode",
];

pub(super) enum Value {
    Series(Vec<Series>),
    Number(f64),
    Str(String),
}

pub(super) fn apply(name: &str, text: &str, args: Vec<Value>) -> Result<Vec<Series>> {
    let mut args = args.into_iter();
    match name {
        "sumSeries" | "sum" => Ok(combine(text, collect_all(text, args)?, |vs| {
            Some(vs.iter().sum())
        })),
        "averageSeries" | "avg" => Ok(combine(text, collect_all(text, args)?, |vs| {
            Some(vs.iter().sum::<f64>() / vs.len() as f64)
        })),
        "minSeries" => Ok(combine(text, collect_all(text, args)?, |vs| {
            vs.iter().copied().reduce(f64::min)
        })),
        "maxSeries" => Ok(combine(text, collect_all(text, args)?, |vs| {
            vs.iter().copied().reduce(f64::max)
        })),
        "diffSeries" => Ok(diff(text, collect_all(text, args)?)),
        "scale" => {
            let series = series_arg(text, args.next())?;
            let factor = number_arg(text, args.next())?;
            Ok(rename_each(series, |s| format!("scale({s},{factor})"))
                .into_iter()
                .map(|s| s.map(|v| v * factor))
                .collect())
        }
        "offset" => {
            let series = series_arg(text, args.next())?;
            let delta = number_arg(text, args.next())?;
            Ok(rename_each(series, |s| format!("offset({s},{delta})"))
                .into_iter()
                .map(|s| s.map(|v| v + delta))
                .collect())
        }
        "absolute" => {
            let series = series_arg(text, args.next())?;
            Ok(rename_each(series, |s| format!("absolute({s})"))
                .into_iter()
                .map(|s| s.map(f64::abs))
                .collect())
        }
        "transformNull" => {
            let series = series_arg(text, args.next())?;
            let default = match args.next() {
                None => 0.0,
                value => number_arg(text, value)?,
            };
            Ok(rename_each(series, |s| format!("transformNull({s},{default})"))
                .into_iter()
                .map(|mut s| {
                    for v in &mut s.values {
                        v.get_or_insert(default);
                    }
                    s
                })
                .collect())
        }
        "alias" => {
            let series = series_arg(text, args.next())?;
            let alias = match args.next() {
                Some(Value::Str(s)) => s,
                _ => return Err(CheckError::target(text, "alias expects a string")),
            };
            Ok(rename_each(series, |_| alias.clone()))
        }
        "aliasByNode" => {
            let series = series_arg(text, args.next())?;
            let mut nodes = Vec::new();
            for arg in args {
                let n = number_arg(text, Some(arg))?;
                nodes.push(n as i64);
            }
            if nodes.is_empty() {
                return Err(CheckError::target(text, "aliasByNode expects node indexes"));
            }
            series
                .into_iter()
                .map(|mut s| {
                    s.name = alias_by_node(&s.name, &nodes)
                        .ok_or_else(|| CheckError::target(text, "node index out of range"))?;
                    Ok(s)
                })
                .collect()
        }
        other => Err(CheckError::target(text, format!("unknown function {other}"))),
    }
}

fn collect_all(text: &str, args: impl Iterator<Item = Value>) -> Result<Vec<Series>> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Value::Series(s) => out.extend(s),
            _ => return Err(CheckError::target(text, "expected series arguments")),
        }
    }
    Ok(out)
}

fn series_arg(text: &str, arg: Option<Value>) -> Result<Vec<Series>> {
    match arg {
        Some(Value::Series(s)) => Ok(s),
        _ => Err(CheckError::target(text, "expected a series argument")),
    }
}

fn number_arg(text: &str, arg: Option<Value>) -> Result<f64> {
    match arg {
        Some(Value::Number(n)) => Ok(n),
        _ => Err(CheckError::target(text, "expected a numeric argument")),
    }
}

fn rename_each(series: Vec<Series>, name: impl Fn(&str) -> String) -> Vec<Series> {
    series
        .into_iter()
        .map(|mut s| {
            s.name = name(&s.name);
            s
        })
        .collect()
}

/// Grid covering every input: the coarsest step from the earliest start to
/// the latest end.
fn common_grid(series: &[Series]) -> Option<(i64, i64, i64)> {
    let step = series.iter().map(|s| s.step).max()?;
    let start = series.iter().map(|s| s.start).min()?;
    let end = series.iter().map(Series::end).max()?;
    Some((start, end, step))
}

/// Folds the non-empty values of every slot; all-empty slots stay empty.
fn combine(name: &str, series: Vec<Series>, f: impl Fn(&[f64]) -> Option<f64>) -> Vec<Series> {
    let Some((start, end, step)) = common_grid(&series) else {
        return Vec::new();
    };
    let mut values = Vec::new();
    let mut ts = start;
    let mut slot = Vec::with_capacity(series.len());
    while ts <= end {
        slot.clear();
        slot.extend(series.iter().filter_map(|s| s.value_at(ts)));
        values.push(if slot.is_empty() { None } else { f(&slot) });
        ts += step;
    }
    vec![Series::new(name, start, step, values)]
}

/// First series minus every other series; gaps in the others count as zero.
fn diff(name: &str, series: Vec<Series>) -> Vec<Series> {
    let Some((start, end, step)) = common_grid(&series) else {
        return Vec::new();
    };
    let (first, rest) = series.split_at(1);
    let mut values = Vec::new();
    let mut ts = start;
    while ts <= end {
        values.push(
            first[0]
                .value_at(ts)
                .map(|v| v - rest.iter().filter_map(|s| s.value_at(ts)).sum::<f64>()),
        );
        ts += step;
    }
    vec![Series::new(name, start, step, values)]
}

fn alias_by_node(name: &str, nodes: &[i64]) -> Option<String> {
    let inner = name.rsplit('(').next().unwrap_or(name);
    let path = inner.split([',', ')', ';']).next().unwrap_or(inner);
    let parts: Vec<&str> = path.split('.').collect();
    let len = parts.len() as i64;
    let mut picked = Vec::with_capacity(nodes.len());
    for &n in nodes {
        let index = if n < 0 { len + n } else { n };
        if !(0..len).contains(&index) {
            return None;
        }
        picked.push(parts[index as usize]);
    }
    Some(picked.join("."))
}
