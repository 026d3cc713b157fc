use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConfigError, Result};
use crate::submission::InputZone;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_SMTP_SERVER: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;
/// In-memory SQLite; used by the testing profile.
pub const MEMORY_DB: &str = ":memory:";

/// Deployment profile. Drives defaults for poll cadence, log level and
/// how strictly the config is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Development,
    Testing,
    Staging,
    Production,
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Profile::Development => "development",
            Profile::Testing => "testing",
            Profile::Staging => "staging",
            Profile::Production => "production",
        };
        f.write_str(s)
    }
}

/// Top-level config (mailsched.toml + MAILSCHED_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailschedConfig {
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between polls. `None` picks the profile default.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    /// Upper bound on events examined per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Re-enqueue events left `claimed` by a previous process.
    #[serde(default = "bool_true")]
    pub recover_claimed_on_startup: bool,
    /// Seconds a claim stays owned without renewal before another instance
    /// may take it over. `None` derives it from the delivery timings.
    #[serde(default)]
    pub claim_lease_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: None,
            batch_size: default_batch_size(),
            recover_claimed_on_startup: true,
            claim_lease_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bound of the dispatcher → worker queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Total transport attempts before an event is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// A send exceeding this counts as a transient failure.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

impl DeliveryConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Longest a live worker goes without renewing a claim: one send plus
    /// the longest retry backoff.
    pub fn max_claim_hold(&self) -> Duration {
        self.send_timeout() + Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Real SMTP relay.
    Smtp,
    /// Log the rendered mail instead of sending it.
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// `None` picks the profile default (log for testing, smtp otherwise).
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default = "default_smtp_server")]
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// STARTTLS on a plain connection.
    #[serde(default = "bool_true")]
    pub use_tls: bool,
    /// Implicit TLS (port 465 style).
    #[serde(default)]
    pub use_ssl: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub default_sender: Option<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            transport: None,
            server: default_smtp_server(),
            port: default_smtp_port(),
            use_tls: true,
            use_ssl: false,
            username: None,
            password: None,
            default_sender: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// Zone for timestamps submitted without an offset:
    /// `utc`, `local`, or `±HH:MM`.
    #[serde(default = "default_input_zone")]
    pub input_zone: String,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            input_zone: default_input_zone(),
        }
    }
}

impl SubmissionConfig {
    pub fn zone(&self) -> Result<InputZone> {
        self.input_zone
            .parse()
            .map_err(|e: crate::error::ValidationError| ConfigError::Invalid {
                key: "submission.input_zone".into(),
                reason: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// A component that has not heartbeated for this long is unhealthy.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `mailsched_delivery=debug`.
    pub level: Option<String>,
    /// Also append logs to this file.
    pub file: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mailsched/mailsched.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_batch_size() -> usize {
    100
}
fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    256
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    2_000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_send_timeout_secs() -> u64 {
    20
}
fn default_smtp_server() -> String {
    DEFAULT_SMTP_SERVER.to_string()
}
fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}
fn default_input_zone() -> String {
    "utc".to_string()
}
fn default_stale_after_secs() -> u64 {
    60
}

impl MailschedConfig {
    /// Load config from a TOML file with MAILSCHED_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `MAILSCHED_DELIVERY__MAX_ATTEMPTS=5`. A missing file is not an error.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MAILSCHED_").split("__"))
    }

    /// Ready-made config for tests: testing profile, in-memory database.
    pub fn for_testing() -> Self {
        let mut config = Self {
            profile: Profile::Testing,
            ..Self::default()
        };
        config.database.path = MEMORY_DB.to_string();
        config
    }

    /// Poll interval, falling back to the profile default
    /// (1 s for development/testing, 10 s otherwise).
    pub fn poll_interval(&self) -> Duration {
        let secs = self
            .scheduler
            .poll_interval_secs
            .unwrap_or(match self.profile {
                Profile::Development | Profile::Testing => 1,
                Profile::Staging | Profile::Production => 10,
            });
        Duration::from_secs(secs.max(1))
    }

    /// Claim lease used by startup recovery. Defaults to a minute past the
    /// longest hold of a live worker.
    pub fn claim_lease(&self) -> Duration {
        match self.scheduler.claim_lease_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.delivery.max_claim_hold() + Duration::from_secs(60),
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.mail.transport.unwrap_or(match self.profile {
            Profile::Testing => TransportKind::Log,
            _ => TransportKind::Smtp,
        })
    }

    /// Default log filter when neither `RUST_LOG` nor `logging.level` is set.
    pub fn default_log_level(&self) -> &'static str {
        match self.profile {
            Profile::Development => "debug",
            Profile::Testing => "warn",
            Profile::Staging | Profile::Production => "info",
        }
    }

    /// Check the config against the rules of its profile.
    ///
    /// Production refuses to start without mail credentials; staging and
    /// development only log what is missing.
    pub fn validate(&self) -> Result<()> {
        if self.delivery.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "delivery.workers".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "delivery.max_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.delivery.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "delivery.queue_capacity".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.claim_lease() <= self.delivery.max_claim_hold() {
            return Err(ConfigError::Invalid {
                key: "scheduler.claim_lease_secs".into(),
                reason: format!(
                    "must exceed delivery.send_timeout_secs + delivery.backoff_max_ms ({}s)",
                    self.delivery.max_claim_hold().as_secs_f64()
                ),
            });
        }
        if self.mail.use_tls && self.mail.use_ssl {
            return Err(ConfigError::Invalid {
                key: "mail.use_ssl".into(),
                reason: "use_tls and use_ssl are mutually exclusive".into(),
            });
        }
        self.submission.zone()?;

        let missing = self.missing_mail_settings();
        match self.profile {
            Profile::Production if !missing.is_empty() => Err(ConfigError::Missing {
                profile: self.profile.to_string(),
                missing,
            }),
            Profile::Staging if !missing.is_empty() => {
                warn!(missing = %missing.join(", "), "staging config incomplete; sending may fail");
                Ok(())
            }
            Profile::Development if !missing.is_empty() => {
                info!(missing = %missing.join(", "), "mail credentials not set (fine for local development)");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn missing_mail_settings(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.mail.username.as_deref().map_or(true, str::is_empty) {
            missing.push("mail.username".to_string());
        }
        if self.mail.password.as_deref().map_or(true, str::is_empty) {
            missing.push("mail.password".to_string());
        }
        if self.mail.default_sender.as_deref().map_or(true, str::is_empty) {
            missing.push("mail.default_sender".to_string());
        }
        missing
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mailsched/mailsched.toml", home)
}
