/// A time-aligned series returned by a metric source.
///
/// Slot `i` holds the value at `start + i * step`; `None` marks a gap.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub start: i64,
    pub step: i64,
    pub values: Vec<Option<f64>>,
}

impl Series {
    pub fn new(name: impl Into<String>, start: i64, step: i64, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            start,
            step: step.max(1),
            values,
        }
    }

    /// Empty slots covering `[from, until]` on the `step` grid.
    pub fn empty(name: impl Into<String>, from: i64, until: i64, step: i64) -> Self {
        let step = step.max(1);
        let start = first_slot(from, step);
        let len = if until >= start {
            ((until - start) / step + 1) as usize
        } else {
            0
        };
        Self::new(name, start, step, vec![None; len])
    }

    /// Last slot timestamp, or `start - step` when empty.
    pub fn end(&self) -> i64 {
        self.start + (self.values.len() as i64 - 1) * self.step
    }

    pub fn timestamp(&self, index: usize) -> i64 {
        self.start + index as i64 * self.step
    }

    /// Value of the slot containing `ts`.
    pub fn value_at(&self, ts: i64) -> Option<f64> {
        if ts < self.start {
            return None;
        }
        let index = ((ts - self.start) / self.step) as usize;
        self.values.get(index).copied().flatten()
    }

    /// `(timestamp, value)` for every non-empty slot, oldest first.
    pub fn points(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (self.timestamp(i), v)))
    }

    /// Timestamp of the newest non-empty slot.
    pub fn last_point(&self) -> Option<i64> {
        self.values
            .iter()
            .rposition(Option::is_some)
            .map(|i| self.timestamp(i))
    }

    pub fn map(mut self, f: impl Fn(f64) -> f64) -> Self {
        for v in self.values.iter_mut().flatten() {
            *v = f(*v);
        }
        self
    }
}

/// First multiple of `step` at or after `ts`.
pub(crate) fn first_slot(ts: i64, step: i64) -> i64 {
    let rem = ts.rem_euclid(step);
    if rem == 0 {
        ts
    } else {
        ts - rem + step
    }
}
