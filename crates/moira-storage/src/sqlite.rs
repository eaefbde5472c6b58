use crate::error::{Result, StorageError};
use crate::{now_millis, trigger_patterns, Database, METRIC_EVENTS_CAPACITY};
use async_trait::async_trait;
use moira_common::state::{NotifierState, SelfState, StateActor};
use moira_common::types::{
    CheckData, Contact, MatchedMetric, MetricEvent, MetricValue, NotificationEvent,
    NotificationHistoryEntry, ScheduledNotification, Subscription, Trigger,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

const METRICS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metric_values (
    metric TEXT NOT NULL,
    retention_ts INTEGER NOT NULL,
    ts INTEGER NOT NULL,
    value REAL NOT NULL,
    PRIMARY KEY (metric, retention_ts)
);
CREATE TABLE IF NOT EXISTS metric_retentions (
    metric TEXT PRIMARY KEY,
    retention INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pattern_metrics (
    pattern TEXT NOT NULL,
    metric TEXT NOT NULL,
    PRIMARY KEY (pattern, metric)
);
";

const TRIGGERS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS triggers (
    id TEXT PRIMARY KEY,
    is_remote INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS pattern_triggers (
    pattern TEXT NOT NULL,
    trigger_id TEXT NOT NULL,
    PRIMARY KEY (pattern, trigger_id)
);
CREATE INDEX IF NOT EXISTS idx_pattern_triggers_trigger ON pattern_triggers(trigger_id);
CREATE TABLE IF NOT EXISTS last_checks (
    trigger_id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
";

const SUBSCRIPTIONS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subscriptions (
    id TEXT PRIMARY KEY,
    any_tags INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS subscription_tags (
    tag TEXT NOT NULL,
    subscription_id TEXT NOT NULL,
    PRIMARY KEY (tag, subscription_id)
);
CREATE TABLE IF NOT EXISTS contacts (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
";

const QUEUES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS notification_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS notifications (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notifications_timestamp ON notifications(timestamp, seq);
CREATE TABLE IF NOT EXISTS notification_history (
    id TEXT PRIMARY KEY,
    contact_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_contact ON notification_history(contact_id, timestamp);
";

const STATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS throttling_hits (
    key TEXT NOT NULL,
    ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_throttling_hits ON throttling_hits(key, ts);
CREATE TABLE IF NOT EXISTS throttling_next (
    key TEXT PRIMARY KEY,
    ts INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS notifier_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    state TEXT NOT NULL,
    actor TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS locks (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// How often a blocked event consumer re-polls the queue table.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Store persisted to a single SQLite file.
///
/// Writes go through one connection guarded by a mutex; WAL mode lets
/// other processes read the same file concurrently. Pattern-hit events are
/// only broadcast inside this process.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    metric_events: broadcast::Sender<MetricEvent>,
}

impl SqliteDatabase {
    /// Opens (or creates) `moira.db` under `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| StorageError::Other(format!("create {}: {e}", data_dir.display())))?;
        let db_path = data_dir.join("moira.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(METRICS_SCHEMA)?;
        conn.execute_batch(TRIGGERS_SCHEMA)?;
        conn.execute_batch(SUBSCRIPTIONS_SCHEMA)?;
        conn.execute_batch(QUEUES_SCHEMA)?;
        conn.execute_batch(STATE_SCHEMA)?;
        tracing::info!(path = %db_path.display(), "Initialized sqlite store");

        let (metric_events, _) = broadcast::channel(METRIC_EVENTS_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            metric_events,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_json<T: DeserializeOwned>(&self, sql: &str, id: &str) -> Result<Option<T>> {
        let conn = self.conn();
        let body: Option<String> = conn
            .query_row(sql, params![id], |row| row.get(0))
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    fn pop_event(&self) -> Result<Option<NotificationEvent>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, body FROM notification_events ORDER BY seq ASC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((seq, body)) = row else {
            return Ok(None);
        };
        tx.execute("DELETE FROM notification_events WHERE seq = ?1", params![seq])?;
        tx.commit()?;
        Ok(Some(serde_json::from_str(&body)?))
    }
}

fn unindex_trigger(conn: &Connection, id: &str) -> Result<Vec<String>> {
    let patterns: Vec<String> = {
        let mut stmt =
            conn.prepare_cached("SELECT pattern FROM pattern_triggers WHERE trigger_id = ?1")?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        rows.collect::<std::result::Result<_, _>>()?
    };
    conn.execute(
        "DELETE FROM pattern_triggers WHERE trigger_id = ?1",
        params![id],
    )?;
    let mut orphaned = Vec::new();
    for pattern in patterns {
        let still_used: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pattern_triggers WHERE pattern = ?1",
            params![pattern],
            |row| row.get(0),
        )?;
        if !still_used {
            orphaned.push(pattern);
        }
    }
    Ok(orphaned)
}

fn column_strings(conn: &Connection, sql: &str, arg: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params![arg], |row| row.get(0))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

fn parse_self_state(s: &str) -> SelfState {
    match s {
        "ERROR" => SelfState::Error,
        _ => SelfState::Ok,
    }
}

fn parse_actor(s: &str) -> StateActor {
    match s {
        "manual" => StateActor::Manual,
        _ => StateActor::Auto,
    }
}

fn actor_str(actor: StateActor) -> &'static str {
    match actor {
        StateActor::Auto => "auto",
        StateActor::Manual => "manual",
    }
}

fn read_notifier_state(conn: &Connection) -> Result<NotifierState> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT state, actor FROM notifier_state WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row
        .map(|(state, actor)| NotifierState {
            state: parse_self_state(&state),
            actor: parse_actor(&actor),
        })
        .unwrap_or_default())
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn ping(&self) -> Result<()> {
        let conn = self.conn();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    async fn save_metrics(&self, metrics: &[MatchedMetric]) -> Result<()> {
        {
            let conn = self.conn();
            let tx = conn.unchecked_transaction()?;
            {
                let mut insert_value = tx.prepare_cached(
                    "INSERT OR REPLACE INTO metric_values (metric, retention_ts, ts, value) VALUES (?1, ?2, ?3, ?4)",
                )?;
                let mut insert_retention = tx.prepare_cached(
                    "INSERT OR REPLACE INTO metric_retentions (metric, retention) VALUES (?1, ?2)",
                )?;
                let mut insert_pattern = tx.prepare_cached(
                    "INSERT OR IGNORE INTO pattern_metrics (pattern, metric) VALUES (?1, ?2)",
                )?;
                for m in metrics {
                    insert_value.execute(params![
                        &m.metric,
                        m.retention_timestamp,
                        m.timestamp,
                        m.value
                    ])?;
                    insert_retention.execute(params![&m.metric, m.retention])?;
                    for pattern in &m.patterns {
                        insert_pattern.execute(params![pattern, &m.metric])?;
                    }
                }
            }
            tx.commit()?;
        }
        for m in metrics {
            for pattern in &m.patterns {
                let _ = self.metric_events.send(MetricEvent {
                    metric: m.metric.clone(),
                    pattern: pattern.clone(),
                });
            }
        }
        Ok(())
    }

    async fn get_metrics_values(
        &self,
        metrics: &[String],
        from: i64,
        until: i64,
    ) -> Result<HashMap<String, Vec<MetricValue>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT retention_ts, ts, value FROM metric_values
             WHERE metric = ?1 AND retention_ts >= ?2 AND retention_ts <= ?3
             ORDER BY retention_ts ASC",
        )?;
        let mut result = HashMap::with_capacity(metrics.len());
        for metric in metrics {
            let rows = stmt.query_map(params![metric, from, until], |row| {
                Ok(MetricValue {
                    retention_timestamp: row.get(0)?,
                    timestamp: row.get(1)?,
                    value: row.get(2)?,
                })
            })?;
            let values: Vec<MetricValue> = rows.collect::<std::result::Result<_, _>>()?;
            result.insert(metric.clone(), values);
        }
        Ok(result)
    }

    async fn get_metric_retention(&self, metric: &str) -> Result<Option<i64>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT retention FROM metric_retentions WHERE metric = ?1",
                params![metric],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn remove_metrics_values(&self, metrics: &[String], to: i64) -> Result<()> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("DELETE FROM metric_values WHERE metric = ?1 AND retention_ts < ?2")?;
        for metric in metrics {
            stmt.execute(params![metric, to])?;
        }
        Ok(())
    }

    async fn get_pattern_metrics(&self, pattern: &str) -> Result<Vec<String>> {
        column_strings(
            &self.conn(),
            "SELECT metric FROM pattern_metrics WHERE pattern = ?1 ORDER BY metric",
            pattern,
        )
    }

    async fn get_patterns(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT DISTINCT pattern FROM pattern_triggers")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    fn subscribe_metric_events(&self) -> broadcast::Receiver<MetricEvent> {
        self.metric_events.subscribe()
    }

    async fn save_trigger(&self, trigger: &Trigger) -> Result<()> {
        let body = serde_json::to_string(trigger)?;
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        unindex_trigger(&tx, &trigger.id)?;
        tx.execute(
            "INSERT OR REPLACE INTO triggers (id, is_remote, body) VALUES (?1, ?2, ?3)",
            params![&trigger.id, trigger.is_remote, body],
        )?;
        for pattern in trigger_patterns(trigger) {
            tx.execute(
                "INSERT OR IGNORE INTO pattern_triggers (pattern, trigger_id) VALUES (?1, ?2)",
                params![pattern, &trigger.id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<Trigger>> {
        self.get_json("SELECT body FROM triggers WHERE id = ?1", id)
    }

    async fn get_trigger_ids(&self, remote: bool) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare_cached("SELECT id FROM triggers WHERE is_remote = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![remote], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    async fn get_pattern_triggers(&self, pattern: &str) -> Result<Vec<String>> {
        column_strings(
            &self.conn(),
            "SELECT trigger_id FROM pattern_triggers WHERE pattern = ?1 ORDER BY trigger_id",
            pattern,
        )
    }

    async fn remove_trigger(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let orphaned = unindex_trigger(&tx, id)?;
        for pattern in orphaned {
            let metrics = column_strings(
                &tx,
                "SELECT metric FROM pattern_metrics WHERE pattern = ?1",
                &pattern,
            )?;
            for metric in metrics {
                tx.execute("DELETE FROM metric_values WHERE metric = ?1", params![metric])?;
                tx.execute(
                    "DELETE FROM metric_retentions WHERE metric = ?1",
                    params![metric],
                )?;
            }
            tx.execute(
                "DELETE FROM pattern_metrics WHERE pattern = ?1",
                params![pattern],
            )?;
        }
        tx.execute("DELETE FROM triggers WHERE id = ?1", params![id])?;
        tx.execute("DELETE FROM last_checks WHERE trigger_id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    async fn get_trigger_last_check(&self, id: &str) -> Result<Option<CheckData>> {
        self.get_json("SELECT body FROM last_checks WHERE trigger_id = ?1", id)
    }

    async fn set_trigger_last_check(&self, id: &str, data: &CheckData) -> Result<()> {
        let body = serde_json::to_string(data)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO last_checks (trigger_id, body) VALUES (?1, ?2)",
            params![id, body],
        )?;
        Ok(())
    }

    async fn commit_trigger_check(
        &self,
        id: &str,
        data: &CheckData,
        events: &[NotificationEvent],
    ) -> Result<()> {
        let body = serde_json::to_string(data)?;
        let event_bodies = events
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        for event in &event_bodies {
            tx.execute(
                "INSERT INTO notification_events (body) VALUES (?1)",
                params![event],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO last_checks (trigger_id, body) VALUES (?1, ?2)",
            params![id, body],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        let body = serde_json::to_string(subscription)?;
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM subscription_tags WHERE subscription_id = ?1",
            params![&subscription.id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO subscriptions (id, any_tags, body) VALUES (?1, ?2, ?3)",
            params![&subscription.id, subscription.any_tags, body],
        )?;
        for tag in &subscription.tags {
            tx.execute(
                "INSERT OR IGNORE INTO subscription_tags (tag, subscription_id) VALUES (?1, ?2)",
                params![tag, &subscription.id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>> {
        self.get_json("SELECT body FROM subscriptions WHERE id = ?1", id)
    }

    async fn get_tags_subscriptions(&self, tags: &[String]) -> Result<Vec<Subscription>> {
        let conn = self.conn();
        let mut bodies: BTreeMap<String, String> = BTreeMap::new();
        {
            let mut stmt =
                conn.prepare_cached("SELECT id, body FROM subscriptions WHERE any_tags = 1")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                let (id, body) = row?;
                bodies.insert(id, body);
            }
        }
        let mut stmt = conn.prepare_cached(
            "SELECT s.id, s.body FROM subscriptions s
             JOIN subscription_tags t ON t.subscription_id = s.id
             WHERE t.tag = ?1",
        )?;
        for tag in tags {
            let rows = stmt.query_map(params![tag], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                let (id, body) = row?;
                bodies.insert(id, body);
            }
        }
        bodies
            .into_values()
            .map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .collect()
    }

    async fn save_contact(&self, contact: &Contact) -> Result<()> {
        let body = serde_json::to_string(contact)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO contacts (id, body) VALUES (?1, ?2)",
            params![&contact.id, body],
        )?;
        Ok(())
    }

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>> {
        self.get_json("SELECT body FROM contacts WHERE id = ?1", id)
    }

    async fn get_contacts(&self, ids: &[String]) -> Result<Vec<Contact>> {
        let mut contacts = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(contact) = self.get_json("SELECT body FROM contacts WHERE id = ?1", id)? {
                contacts.push(contact);
            }
        }
        Ok(contacts)
    }

    async fn push_notification_event(&self, event: &NotificationEvent) -> Result<()> {
        let body = serde_json::to_string(event)?;
        self.conn().execute(
            "INSERT INTO notification_events (body) VALUES (?1)",
            params![body],
        )?;
        Ok(())
    }

    async fn fetch_notification_event(
        &self,
        timeout: Duration,
    ) -> Result<Option<NotificationEvent>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.pop_event()? {
                return Ok(Some(event));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(EVENT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn add_notifications(&self, notifications: &[ScheduledNotification]) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx
                .prepare_cached("INSERT INTO notifications (timestamp, body) VALUES (?1, ?2)")?;
            for n in notifications {
                stmt.execute(params![n.timestamp, serde_json::to_string(n)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn fetch_notifications(
        &self,
        to: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledNotification>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT seq, body FROM notifications WHERE timestamp <= ?1
                 ORDER BY timestamp ASC, seq ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![to, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        {
            let mut delete = tx.prepare_cached("DELETE FROM notifications WHERE seq = ?1")?;
            for (seq, _) in &rows {
                delete.execute(params![seq])?;
            }
        }
        tx.commit()?;
        rows.into_iter()
            .map(|(_, body)| serde_json::from_str(&body).map_err(StorageError::from))
            .collect()
    }

    async fn get_notifications(&self) -> Result<Vec<ScheduledNotification>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare_cached("SELECT body FROM notifications ORDER BY timestamp ASC, seq ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    async fn add_throttling_hit(&self, key: &str, timestamp: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO throttling_hits (key, ts) VALUES (?1, ?2)",
            params![key, timestamp],
        )?;
        Ok(())
    }

    async fn count_throttling_hits(&self, key: &str, since: i64) -> Result<usize> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM throttling_hits WHERE key = ?1 AND ts < \
             (SELECT MAX(ts) FROM throttling_hits WHERE key = ?1) - 86400",
            params![key],
        )?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM throttling_hits WHERE key = ?1 AND ts >= ?2",
            params![key, since],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn get_throttling_next(&self, key: &str) -> Result<i64> {
        let conn = self.conn();
        let next: Option<i64> = conn
            .query_row(
                "SELECT ts FROM throttling_next WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(next.unwrap_or(0))
    }

    async fn set_throttling_next(&self, key: &str, next: i64) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO throttling_next (key, ts) VALUES (?1, ?2)",
            params![key, next],
        )?;
        Ok(())
    }

    async fn get_notifier_state(&self) -> Result<NotifierState> {
        read_notifier_state(&self.conn())
    }

    async fn set_notifier_state(
        &self,
        state: SelfState,
        actor: StateActor,
    ) -> Result<NotifierState> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let current = read_notifier_state(&tx)?;
        if !current.accepts(state, actor) {
            return Ok(current);
        }
        tx.execute(
            "INSERT OR REPLACE INTO notifier_state (id, state, actor) VALUES (1, ?1, ?2)",
            params![state.to_string(), actor_str(actor)],
        )?;
        tx.commit()?;
        Ok(NotifierState { state, actor })
    }

    async fn acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = now_millis();
        let expires = now + ttl.as_millis() as i64;
        let changed = self.conn().execute(
            "INSERT INTO locks (name, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
             WHERE locks.expires_at <= ?4 OR locks.owner = excluded.owner",
            params![name, owner, expires, now],
        )?;
        Ok(changed > 0)
    }

    async fn extend_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = now_millis();
        let changed = self.conn().execute(
            "UPDATE locks SET expires_at = ?3 WHERE name = ?1 AND owner = ?2 AND expires_at > ?4",
            params![name, owner, now + ttl.as_millis() as i64, now],
        )?;
        Ok(changed > 0)
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM locks WHERE name = ?1 AND owner = ?2",
            params![name, owner],
        )?;
        Ok(())
    }

    async fn increment_counter(&self, name: &str, delta: i64) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO counters (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = value + excluded.value",
            params![name, delta],
        )?;
        Ok(conn.query_row(
            "SELECT value FROM counters WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?)
    }

    async fn get_counter(&self, name: &str) -> Result<i64> {
        let conn = self.conn();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM counters WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    async fn push_notification_history(&self, entry: &NotificationHistoryEntry) -> Result<()> {
        let body = serde_json::to_string(entry)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO notification_history (id, contact_id, timestamp, body)
             VALUES (?1, ?2, ?3, ?4)",
            params![&entry.id, &entry.contact_id, entry.timestamp, body],
        )?;
        Ok(())
    }

    async fn get_notification_history(
        &self,
        contact_id: &str,
        limit: usize,
    ) -> Result<Vec<NotificationHistoryEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT body FROM notification_history WHERE contact_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![contact_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}
