use moira_checker::{CheckSettings, RemoteSettings, SchedulerSettings};
use moira_common::types::Contact;
use moira_filter::{FilterSettings, RegexTreatment};
use moira_notifier::{NotifierSettings, SelfStateSettings, SenderConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub checker: CheckerConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub selfstate: SelfStateConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Snowflake node id; processes sharing one store need distinct values.
    #[serde(default = "default_node_id")]
    pub node_id: i32,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            filter: FilterConfig::default(),
            checker: CheckerConfig::default(),
            remote: RemoteConfig::default(),
            notifier: NotifierConfig::default(),
            selfstate: SelfStateConfig::default(),
            log: LogConfig::default(),
            node_id: default_node_id(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_node_id() -> i32 {
    1
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

// ---- [database] ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseBackend,
    /// Directory holding the SQLite file.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Startup connectivity check deadline.
    #[serde(default = "default_database_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            data_dir: default_data_dir(),
            timeout_secs: default_database_timeout_secs(),
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_database_timeout_secs() -> u64 {
    5
}

// ---- [filter] ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_listen_tcp")]
    pub listen_tcp: String,
    /// UDP ingest is off unless an address is set.
    #[serde(default)]
    pub listen_udp: Option<String>,
    /// `storage-schemas` style file; every metric gets 60s without one.
    #[serde(default)]
    pub retention_file: Option<String>,
    #[serde(default = "default_filter_workers")]
    pub workers: usize,
    #[serde(default = "default_filter_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_filter_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_filter_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_filter_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_pattern_refresh_secs")]
    pub pattern_refresh_secs: u64,
    /// `strict` or `loose` anchoring of `=~` tag regexes.
    #[serde(default = "default_regex_treatment")]
    pub regex_treatment: String,
    #[serde(default = "default_matcher_cache_size")]
    pub matcher_cache_size: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_tcp: default_listen_tcp(),
            listen_udp: None,
            retention_file: None,
            workers: default_filter_workers(),
            queue_size: default_filter_queue_size(),
            cache_capacity: default_filter_cache_capacity(),
            batch_size: default_filter_batch_size(),
            flush_interval_ms: default_filter_flush_interval_ms(),
            pattern_refresh_secs: default_pattern_refresh_secs(),
            regex_treatment: default_regex_treatment(),
            matcher_cache_size: default_matcher_cache_size(),
            max_line_length: default_max_line_length(),
        }
    }
}

impl FilterConfig {
    pub fn settings(&self) -> FilterSettings {
        FilterSettings {
            workers: self.workers,
            queue_size: self.queue_size,
            cache_capacity: self.cache_capacity,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }

    pub fn treatment(&self) -> anyhow::Result<RegexTreatment> {
        self.regex_treatment
            .parse()
            .map_err(|e: String| anyhow::anyhow!("Invalid [filter].regex_treatment: {e}"))
    }
}

fn default_true() -> bool {
    true
}

fn default_listen_tcp() -> String {
    "0.0.0.0:2003".to_string()
}

fn default_filter_workers() -> usize {
    4
}

fn default_filter_queue_size() -> usize {
    10_000
}

fn default_filter_cache_capacity() -> usize {
    100_000
}

fn default_filter_batch_size() -> usize {
    1_000
}

fn default_filter_flush_interval_ms() -> u64 {
    200
}

fn default_pattern_refresh_secs() -> u64 {
    1
}

fn default_regex_treatment() -> String {
    "strict".to_string()
}

fn default_matcher_cache_size() -> usize {
    10_000
}

fn default_max_line_length() -> usize {
    4_096
}

// ---- [checker] ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: i64,
    #[serde(default = "default_max_parallel_checks")]
    pub max_parallel_checks: usize,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_check_point_gap_secs")]
    pub check_point_gap_secs: i64,
    /// Stored points older than this are removed after each fetch; zero
    /// keeps everything.
    #[serde(default = "default_metrics_ttl_secs")]
    pub metrics_ttl_secs: i64,
    #[serde(default = "default_trigger_refresh_secs")]
    pub trigger_refresh_secs: u64,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval_secs(),
            max_parallel_checks: default_max_parallel_checks(),
            lock_ttl_secs: default_lock_ttl_secs(),
            check_point_gap_secs: default_check_point_gap_secs(),
            metrics_ttl_secs: default_metrics_ttl_secs(),
            trigger_refresh_secs: default_trigger_refresh_secs(),
        }
    }
}

impl CheckerConfig {
    pub fn check_settings(&self) -> CheckSettings {
        CheckSettings {
            check_interval: self.check_interval_secs,
            check_point_gap: self.check_point_gap_secs,
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_parallel_checks: self.max_parallel_checks,
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            trigger_refresh_interval: Duration::from_secs(self.trigger_refresh_secs),
            ..Default::default()
        }
    }
}

fn default_check_interval_secs() -> i64 {
    60
}

fn default_max_parallel_checks() -> usize {
    8
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_check_point_gap_secs() -> i64 {
    120
}

fn default_metrics_ttl_secs() -> i64 {
    3 * 60 * 60
}

fn default_trigger_refresh_secs() -> u64 {
    10
}

// ---- [remote] ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Graphite base URL, e.g. `http://graphite:8080`.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_remote_check_interval_secs")]
    pub check_interval_secs: i64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            user: None,
            password: None,
            timeout_secs: default_remote_timeout_secs(),
            check_interval_secs: default_remote_check_interval_secs(),
        }
    }
}

impl RemoteConfig {
    pub fn settings(&self) -> RemoteSettings {
        RemoteSettings {
            url: self.url.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn default_remote_timeout_secs() -> u64 {
    60
}

fn default_remote_check_interval_secs() -> i64 {
    60
}

// ---- [notifier] ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
    #[serde(default = "default_sending_timeout_secs")]
    pub sending_timeout_secs: u64,
    #[serde(default = "default_resending_timeout_secs")]
    pub resending_timeout_secs: u64,
    #[serde(default = "default_rescheduling_delay_secs")]
    pub rescheduling_delay_secs: u64,
    #[serde(default = "default_max_fail_attempts")]
    pub max_fail_attempts: u32,
    #[serde(default = "default_fetch_interval_ms")]
    pub fetch_interval_ms: u64,
    #[serde(default = "default_event_workers")]
    pub event_workers: usize,
    #[serde(default)]
    pub front_uri: String,
    #[serde(default)]
    pub senders: Vec<SenderConfig>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_batch_size: default_read_batch_size(),
            sending_timeout_secs: default_sending_timeout_secs(),
            resending_timeout_secs: default_resending_timeout_secs(),
            rescheduling_delay_secs: default_rescheduling_delay_secs(),
            max_fail_attempts: default_max_fail_attempts(),
            fetch_interval_ms: default_fetch_interval_ms(),
            event_workers: default_event_workers(),
            front_uri: String::new(),
            senders: Vec::new(),
        }
    }
}

impl NotifierConfig {
    pub fn settings(&self) -> NotifierSettings {
        NotifierSettings {
            read_batch_size: self.read_batch_size,
            sending_timeout: Duration::from_secs(self.sending_timeout_secs),
            resending_timeout: Duration::from_secs(self.resending_timeout_secs),
            rescheduling_delay: Duration::from_secs(self.rescheduling_delay_secs),
            max_fail_attempts: self.max_fail_attempts,
            fetch_interval: Duration::from_millis(self.fetch_interval_ms),
            front_uri: self.front_uri.clone(),
        }
    }
}

fn default_read_batch_size() -> usize {
    100
}

fn default_sending_timeout_secs() -> u64 {
    10
}

fn default_resending_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_rescheduling_delay_secs() -> u64 {
    60
}

fn default_max_fail_attempts() -> u32 {
    3
}

fn default_fetch_interval_ms() -> u64 {
    1_000
}

fn default_event_workers() -> usize {
    2
}

// ---- [selfstate] ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfStateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_selfstate_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_notice_interval_secs")]
    pub notice_interval_secs: i64,
    /// Store unreachable this long before the notifier is turned off.
    #[serde(default = "default_database_delay_secs")]
    pub database_delay_secs: i64,
    #[serde(default = "default_filter_delay_secs")]
    pub filter_delay_secs: i64,
    #[serde(default = "default_checker_delay_secs")]
    pub checker_delay_secs: i64,
    #[serde(default = "default_remote_checker_delay_secs")]
    pub remote_checker_delay_secs: i64,
    #[serde(default)]
    pub checker_turns_off_notifier: bool,
    #[serde(default)]
    pub admin_contacts: Vec<Contact>,
}

impl Default for SelfStateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_selfstate_check_interval_secs(),
            notice_interval_secs: default_notice_interval_secs(),
            database_delay_secs: default_database_delay_secs(),
            filter_delay_secs: default_filter_delay_secs(),
            checker_delay_secs: default_checker_delay_secs(),
            remote_checker_delay_secs: default_remote_checker_delay_secs(),
            checker_turns_off_notifier: false,
            admin_contacts: Vec::new(),
        }
    }
}

impl SelfStateConfig {
    pub fn settings(&self) -> SelfStateSettings {
        SelfStateSettings {
            check_interval: Duration::from_secs(self.check_interval_secs),
            notice_interval: self.notice_interval_secs,
            admin_contacts: self.admin_contacts.clone(),
        }
    }
}

fn default_selfstate_check_interval_secs() -> u64 {
    10
}

fn default_notice_interval_secs() -> i64 {
    300
}

fn default_database_delay_secs() -> i64 {
    30
}

fn default_filter_delay_secs() -> i64 {
    60
}

fn default_checker_delay_secs() -> i64 {
    120
}

fn default_remote_checker_delay_secs() -> i64 {
    300
}

// ---- [log] ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level for the `moira` crates; `RUST_LOG` directives still apply.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---- Seed file types (used by `init-seed` CLI subcommand) ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub triggers: Vec<moira_common::types::Trigger>,
    #[serde(default)]
    pub subscriptions: Vec<moira_common::types::Subscription>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{path}': {e}"))?;
        Self::parse(&content).map_err(|e| anyhow::anyhow!("Invalid config '{path}': {e}"))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.filter.treatment()?;
        if config.remote.enabled && config.remote.url.is_empty() {
            anyhow::bail!("[remote].url is required when remote checks are enabled");
        }
        Ok(config)
    }
}
