//! Configuration types.
//!
//! A single [`AppConfig`] is built once at process start and handed to each
//! component constructor. Nothing reads the environment after that.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::routing::BUILTIN_RULE_IDS;

/// Category name reserved for "could not classify".
pub const UNKNOWN_CATEGORY: &str = "unknown";

/// Largest message body the IMAP client will hold in memory.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 25 * 1024 * 1024;

// ── Mailbox ─────────────────────────────────────────────────────────

/// Transport security for outbound SMTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// Plain SMTP (test servers only).
    None,
    /// Upgrade with STARTTLS after connecting.
    StartTls,
    /// Implicit TLS from the first byte.
    Tls,
}

impl std::str::FromStr for SmtpSecurity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "plain" => Ok(Self::None),
            "starttls" => Ok(Self::StartTls),
            "tls" | "ssl" => Ok(Self::Tls),
            other => Err(ConfigError::InvalidValue {
                key: "SMTP_SECURITY".into(),
                message: format!("expected none, starttls or tls, got '{other}'"),
            }),
        }
    }
}

/// Folders handled mail is moved into once it has been marked read.
/// A `None` entry leaves that kind of mail in the watched folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderMap {
    /// Forwarded and delivered.
    pub processed: Option<String>,
    /// Sent to (or held for) review.
    pub review: Option<String>,
    /// Dropped without delivery.
    pub skipped: Option<String>,
    /// Matched a quarantine category.
    pub quarantine: Option<String>,
}

impl FolderMap {
    /// Build from `IMAP_FOLDER_PROCESSED`, `IMAP_FOLDER_REVIEW`,
    /// `IMAP_FOLDER_SKIPPED` and `IMAP_FOLDER_QUARANTINE`.
    pub fn from_env() -> Self {
        Self {
            processed: optional_env("IMAP_FOLDER_PROCESSED"),
            review: optional_env("IMAP_FOLDER_REVIEW"),
            skipped: optional_env("IMAP_FOLDER_SKIPPED"),
            quarantine: optional_env("IMAP_FOLDER_QUARANTINE"),
        }
    }
}

/// IMAP/SMTP connection settings for the watched mailbox.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    /// Implicit TLS on the IMAP connection.
    pub imap_tls: bool,
    /// Folder to watch.
    pub folder: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_security: SmtpSecurity,
    pub username: String,
    pub password: SecretString,
    /// Address used as the From/envelope sender of forwarded mail.
    pub address: String,
    /// Socket read/write timeout for both protocols.
    pub io_timeout: Duration,
    pub folders: FolderMap,
    /// Messages larger than this are skipped and left unread.
    pub max_message_bytes: usize,
}

impl MailboxConfig {
    /// Build from `IMAP_*`, `SMTP_*` and `MAIL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let imap_host = required_env("IMAP_HOST")?;
        let smtp_host = std::env::var("SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));
        let username = required_env("MAIL_USERNAME")?;
        let password = SecretString::from(std::env::var("MAIL_PASSWORD").unwrap_or_default());
        let address = std::env::var("MAIL_ADDRESS").unwrap_or_else(|_| username.clone());

        Ok(Self {
            imap_host,
            imap_port: env_parse("IMAP_PORT", 993)?,
            imap_tls: env_bool("IMAP_TLS", true)?,
            folder: std::env::var("IMAP_FOLDER").unwrap_or_else(|_| "INBOX".to_string()),
            smtp_host,
            smtp_port: env_parse("SMTP_PORT", 587)?,
            smtp_security: match std::env::var("SMTP_SECURITY") {
                Ok(v) => v.parse()?,
                Err(_) => SmtpSecurity::StartTls,
            },
            username,
            password,
            address,
            io_timeout: Duration::from_secs(env_parse("MAIL_IO_TIMEOUT_SECS", 30)?),
            folders: FolderMap::from_env(),
            max_message_bytes: env_parse("MAIL_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?,
        })
    }
}

// ── Classifier ──────────────────────────────────────────────────────

/// Cloud LLM backends usable as the secondary classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudBackend {
    Anthropic,
    OpenAi,
}

/// Local Ollama server settings.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

/// Cloud provider settings.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub backend: CloudBackend,
    pub api_key: SecretString,
    pub model: String,
}

/// Provider chain settings.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Primary provider; skipped when `None`.
    pub ollama: Option<OllamaConfig>,
    /// Secondary provider; skipped when `None`.
    pub cloud: Option<CloudConfig>,
    /// Append the keyword heuristic as the last provider.
    pub heuristic: bool,
    /// Upper bound on a single provider call.
    pub provider_timeout: Duration,
    /// Extra attempts per provider before falling through.
    pub retries: u32,
    /// Delay before the first retry of a provider.
    pub retry_backoff: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ollama: None,
            cloud: None,
            heuristic: true,
            provider_timeout: Duration::from_secs(30),
            retries: 1,
            retry_backoff: Duration::from_millis(400),
        }
    }
}

impl ClassifierConfig {
    /// Build from `OLLAMA_*`, `ANTHROPIC_API_KEY` / `OPENAI_API_KEY` and
    /// `CLASSIFIER_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ollama = std::env::var("OLLAMA_MODEL").ok().map(|model| OllamaConfig {
            base_url: std::env::var("OLLAMA_HOST")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model,
        });

        let cloud = if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            Some(CloudConfig {
                backend: CloudBackend::Anthropic,
                api_key: SecretString::from(key),
                model: std::env::var("CLOUD_MODEL")
                    .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            })
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            Some(CloudConfig {
                backend: CloudBackend::OpenAi,
                api_key: SecretString::from(key),
                model: std::env::var("CLOUD_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            })
        } else {
            None
        };

        let defaults = Self::default();
        Ok(Self {
            ollama,
            cloud,
            heuristic: env_bool("CLASSIFIER_HEURISTIC", defaults.heuristic)?,
            provider_timeout: Duration::from_secs(env_parse(
                "CLASSIFIER_TIMEOUT_SECS",
                defaults.provider_timeout.as_secs(),
            )?),
            retries: env_parse("CLASSIFIER_RETRIES", defaults.retries)?,
            retry_backoff: defaults.retry_backoff,
        })
    }
}

// ── Routing ─────────────────────────────────────────────────────────

/// What happens to messages that no explicit rule claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    /// Trust the classifier above the review threshold.
    Forward,
    /// Send everything unmatched to review.
    Review,
}

/// An operator-authored keyword rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub id: String,
    pub keywords: Vec<String>,
    pub target: String,
    /// Optional sender substring filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// A classifier category and the mailbox it routes to.
///
/// Quarantine categories have no mailbox: confident matches are dropped and
/// filed into the quarantine folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRoute {
    pub name: String,
    #[serde(default)]
    pub mailbox: String,
    /// Shown to the LLM in the prompt.
    #[serde(default)]
    pub description: String,
    /// Used by the heuristic provider.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub quarantine: bool,
}

fn default_threshold() -> f32 {
    0.7
}

fn default_action() -> DefaultAction {
    DefaultAction::Forward
}

/// Routing configuration, consumed read-only by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<KeywordRule>,
    #[serde(default)]
    pub categories: Vec<CategoryRoute>,
    #[serde(default = "default_action")]
    pub default_action: DefaultAction,
    #[serde(default = "default_threshold")]
    pub review_threshold: f32,
    #[serde(default)]
    pub review_mailbox: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            categories: Vec::new(),
            default_action: default_action(),
            review_threshold: default_threshold(),
            review_mailbox: None,
        }
    }
}

impl RoutingConfig {
    /// Load a routing configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))
    }

    /// Names of the closed category set (excluding `unknown`).
    pub fn category_names(&self) -> Vec<String> {
        self.categories.iter().map(|c| c.name.clone()).collect()
    }

    fn category(&self, name: &str) -> Option<&CategoryRoute> {
        self.categories.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Mailbox for a category, if one is configured.
    pub fn mailbox_for(&self, category: &str) -> Option<&str> {
        self.category(category)
            .filter(|c| !c.quarantine && !c.mailbox.trim().is_empty())
            .map(|c| c.mailbox.as_str())
    }

    /// Whether confident matches of this category are quarantined.
    pub fn is_quarantine(&self, category: &str) -> bool {
        self.category(category).is_some_and(|c| c.quarantine)
    }

    /// Reject configurations a watch session cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.review_threshold) {
            return Err(invalid(
                "review_threshold",
                format!("{} is outside [0, 1]", self.review_threshold),
            ));
        }
        if self.rules.is_empty() {
            return Err(invalid("rules", "at least one rule is required"));
        }
        let mut ids = std::collections::HashSet::new();
        for (i, rule) in self.rules.iter().enumerate() {
            let id = rule.id.trim().to_lowercase();
            if id.is_empty() {
                return Err(invalid("rules", format!("rule #{i} has no id")));
            }
            if BUILTIN_RULE_IDS.contains(&id.as_str()) {
                return Err(invalid("rules", format!("rule id '{}' is reserved", rule.id)));
            }
            if !ids.insert(id) {
                return Err(invalid("rules", format!("duplicate rule id '{}'", rule.id)));
            }
            if rule.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(invalid("rules", format!("rule '{}' has no keywords", rule.id)));
            }
            if rule.target.trim().is_empty() {
                return Err(invalid("rules", format!("rule '{}' has no target", rule.id)));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for cat in &self.categories {
            let name = cat.name.to_lowercase();
            if name == UNKNOWN_CATEGORY {
                return Err(invalid("categories", "'unknown' is reserved"));
            }
            if !seen.insert(name) {
                return Err(invalid("categories", format!("duplicate category '{}'", cat.name)));
            }
            if !cat.quarantine && cat.mailbox.trim().is_empty() {
                return Err(invalid("categories", format!("category '{}' has no mailbox", cat.name)));
            }
        }
        match self.review_mailbox.as_deref() {
            Some(m) if !m.trim().is_empty() => Ok(()),
            _ => Err(invalid("review_mailbox", "a review mailbox is required")),
        }
    }
}

// ── Watch loop ──────────────────────────────────────────────────────

/// Watch loop and delivery policy.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Sleep between cycles.
    pub poll_interval: Duration,
    /// Consecutive failed cycles before the session gives up.
    pub max_failed_cycles: u32,
    /// Deliver `review` decisions to the review mailbox (otherwise only mark read).
    pub deliver_reviews: bool,
    /// Mark permanently failed messages read to avoid reprocessing loops.
    pub ack_failed: bool,
    /// Attempts for mailbox and delivery operations.
    pub io_attempts: u32,
    /// JSONL ledger location.
    pub ledger_path: PathBuf,
    /// Start watching as soon as the service is up.
    pub autostart: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_failed_cycles: 3,
            deliver_reviews: true,
            ack_failed: true,
            io_attempts: 3,
            ledger_path: PathBuf::from("./data/ledger.jsonl"),
            autostart: true,
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: Duration::from_secs(env_parse(
                "MAIL_ROUTER_POLL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            max_failed_cycles: env_parse("MAIL_ROUTER_MAX_FAILED_CYCLES", defaults.max_failed_cycles)?,
            deliver_reviews: env_bool("MAIL_ROUTER_DELIVER_REVIEWS", defaults.deliver_reviews)?,
            ack_failed: env_bool("MAIL_ROUTER_ACK_FAILED", defaults.ack_failed)?,
            io_attempts: env_parse("MAIL_ROUTER_IO_ATTEMPTS", defaults.io_attempts)?,
            ledger_path: std::env::var("MAIL_ROUTER_LEDGER")
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger_path),
            autostart: env_bool("MAIL_ROUTER_AUTOSTART", defaults.autostart)?,
        })
    }
}

// ── Application ─────────────────────────────────────────────────────

/// Everything the service needs, built once at start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mailbox: MailboxConfig,
    pub classifier: ClassifierConfig,
    pub routing: RoutingConfig,
    pub watch: WatchConfig,
    /// Bind address of the control surface.
    pub control_addr: String,
}

impl AppConfig {
    /// Build from the environment. Routing rules come from the JSON file
    /// named by `MAIL_ROUTER_RULES` (default `./routing.json`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let rules_path = std::env::var("MAIL_ROUTER_RULES")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./routing.json"));

        Ok(Self {
            mailbox: MailboxConfig::from_env()?,
            classifier: ClassifierConfig::from_env()?,
            routing: RoutingConfig::load(&rules_path)?,
            watch: WatchConfig::from_env()?,
            control_addr: std::env::var("MAIL_ROUTER_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
        })
    }

    /// Checks that must pass before a watch session starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox.address.trim().is_empty() {
            return Err(invalid("MAIL_ADDRESS", "agent address is empty"));
        }
        if self.watch.poll_interval.is_zero() {
            return Err(invalid("MAIL_ROUTER_POLL_SECS", "must be greater than zero"));
        }
        self.routing.validate()
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// A set, non-blank variable.
fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, e.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(invalid(key, format!("expected a boolean, got '{other}'"))),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_routing() -> RoutingConfig {
        RoutingConfig {
            rules: vec![KeywordRule {
                id: "hr".into(),
                keywords: vec!["resume".into(), "application".into()],
                target: "hr@mail.local".into(),
                from: None,
            }],
            categories: vec![CategoryRoute {
                name: "support".into(),
                mailbox: "support@mail.local".into(),
                description: String::new(),
                keywords: vec![],
                quarantine: false,
            }],
            review_mailbox: Some("review@mail.local".into()),
            ..RoutingConfig::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_routing().validate().is_ok());
    }

    #[test]
    fn empty_rule_set_is_rejected() {
        let cfg = RoutingConfig {
            rules: vec![],
            ..valid_routing()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("rules"));
    }

    #[test]
    fn missing_review_mailbox_is_rejected() {
        let cfg = RoutingConfig {
            review_mailbox: None,
            ..valid_routing()
        };
        assert!(cfg.validate().is_err());

        let blank = RoutingConfig {
            review_mailbox: Some("  ".into()),
            ..valid_routing()
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let cfg = RoutingConfig {
            review_threshold: 1.5,
            ..valid_routing()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_category_name_is_reserved() {
        let mut cfg = valid_routing();
        cfg.categories.push(CategoryRoute {
            name: "Unknown".into(),
            mailbox: "x@mail.local".into(),
            description: String::new(),
            keywords: vec![],
            quarantine: false,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_category_is_rejected() {
        let mut cfg = valid_routing();
        cfg.categories.push(cfg.categories[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rule_without_keywords_is_rejected() {
        let mut cfg = valid_routing();
        cfg.rules[0].keywords = vec!["  ".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builtin_rule_ids_are_reserved() {
        for id in ["default", "AI-Category", "self-sent", "quarantine"] {
            let mut cfg = valid_routing();
            cfg.rules[0].id = id.into();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("reserved"), "{id}: {err}");
        }
    }

    #[test]
    fn duplicate_rule_id_is_rejected() {
        let mut cfg = valid_routing();
        let mut again = cfg.rules[0].clone();
        again.id = "HR".into();
        cfg.rules.push(again);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate rule id"));
    }

    #[test]
    fn quarantine_category_needs_no_mailbox() {
        let json = r#"{
            "rules": [{"id": "hr", "keywords": ["resume"], "target": "hr@mail.local"}],
            "categories": [{"name": "spam", "quarantine": true}],
            "review_mailbox": "review@mail.local"
        }"#;
        let cfg: RoutingConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_ok());
        assert!(cfg.is_quarantine("SPAM"));
        assert_eq!(cfg.mailbox_for("spam"), None);
    }

    #[test]
    fn regular_category_without_mailbox_is_rejected() {
        let mut cfg = valid_routing();
        cfg.categories[0].mailbox = " ".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("no mailbox"));
    }

    #[test]
    fn routing_config_json_defaults() {
        let json = r#"{
            "rules": [{"id": "hr", "keywords": ["resume"], "target": "hr@mail.local"}],
            "review_mailbox": "review@mail.local"
        }"#;
        let cfg: RoutingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.default_action, DefaultAction::Forward);
        assert!((cfg.review_threshold - 0.7).abs() < f32::EPSILON);
        assert!(cfg.categories.is_empty());
        assert!(cfg.rules[0].from.is_none());
    }

    #[test]
    fn routing_config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.json");
        std::fs::write(
            &path,
            r#"{"rules": [], "default_action": "review", "review_threshold": 0.5}"#,
        )
        .unwrap();
        let cfg = RoutingConfig::load(&path).unwrap();
        assert_eq!(cfg.default_action, DefaultAction::Review);
        assert!((cfg.review_threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn routing_config_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            RoutingConfig::load(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn mailbox_for_is_case_insensitive() {
        let cfg = valid_routing();
        assert_eq!(cfg.mailbox_for("SUPPORT"), Some("support@mail.local"));
        assert_eq!(cfg.mailbox_for("sales"), None);
    }

    #[test]
    fn smtp_security_parses() {
        assert_eq!("STARTTLS".parse::<SmtpSecurity>().unwrap(), SmtpSecurity::StartTls);
        assert_eq!("ssl".parse::<SmtpSecurity>().unwrap(), SmtpSecurity::Tls);
        assert_eq!("none".parse::<SmtpSecurity>().unwrap(), SmtpSecurity::None);
        assert!("bogus".parse::<SmtpSecurity>().is_err());
    }
}
