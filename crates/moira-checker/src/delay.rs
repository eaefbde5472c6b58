use std::collections::{BTreeMap, HashMap};

/// Trigger IDs ordered by due time.
///
/// Entries due in the same second pop in random order so a large trigger
/// population does not starve its tail.
#[derive(Debug, Default)]
pub struct DelaySet {
    queue: BTreeMap<(i64, u64), String>,
    due: HashMap<String, (i64, u64)>,
}

impl DelaySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.due.contains_key(id)
    }

    /// Schedules `id` at `at`, or moves it there.
    pub fn schedule(&mut self, id: &str, at: i64) {
        self.remove(id);
        let key = (at, rand::random::<u64>());
        self.queue.insert(key, id.to_string());
        self.due.insert(id.to_string(), key);
    }

    /// Schedules `id` at `at` unless it is already due earlier.
    pub fn schedule_earlier(&mut self, id: &str, at: i64) {
        match self.due.get(id) {
            Some((due, _)) if *due <= at => {}
            _ => self.schedule(id, at),
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.due.remove(id) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Removes and returns up to `limit` IDs due at or before `now`.
    pub fn pop_ready(&mut self, now: i64, limit: usize) -> Vec<String> {
        let mut out = Vec::new();
        while out.len() < limit {
            let Some(entry) = self.queue.first_entry() else {
                break;
            };
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            self.due.remove(&id);
            out.push(id);
        }
        out
    }

    /// IDs currently scheduled.
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.due.keys()
    }
}
