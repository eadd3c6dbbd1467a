//! Executes routing decisions: forward over SMTP, then mark the original read.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, SmtpTransport, Transport};
use lru::LruCache;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{FolderMap, MailboxConfig, SmtpSecurity};
use crate::error::{ConfigError, DeliveryError, SourceError};
use crate::mail::message::Message;
use crate::mail::source::{self, MailSession};
use crate::retry::RetryPolicy;
use crate::routing::{MatchedRule, RouteAction, RoutingDecision};

/// Subject prefix for mail delivered to the review mailbox.
pub const REVIEW_PREFIX: &str = "[Review] ";

/// Delivered (message, decision) keys remembered for idempotency.
pub const DEFAULT_DELIVERED_CAPACITY: usize = 10_000;

/// A message ready to hand to the outbound transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub from: String,
    pub to: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
    /// Original sender, sent as `X-Forwarded-From`.
    pub forwarded_from: Option<String>,
}

/// Sends mail. Implemented over SMTP and by test fakes.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, mail: &OutboundMail) -> Result<(), DeliveryError>;
}

// ── SMTP ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct XForwardedFrom(String);

impl Header for XForwardedFrom {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Forwarded-From")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Blocking lettre transport driven from `spawn_blocking`.
#[derive(Clone)]
pub struct SmtpOutbound {
    transport: SmtpTransport,
}

impl SmtpOutbound {
    pub fn new(config: &MailboxConfig) -> Result<Self, ConfigError> {
        let relay_error = |e: lettre::transport::smtp::Error| ConfigError::InvalidValue {
            key: "SMTP_HOST".into(),
            message: format!("SMTP relay error: {e}"),
        };
        let builder = match config.smtp_security {
            SmtpSecurity::Tls => SmtpTransport::relay(&config.smtp_host).map_err(relay_error)?,
            SmtpSecurity::StartTls => {
                SmtpTransport::starttls_relay(&config.smtp_host).map_err(relay_error)?
            }
            SmtpSecurity::None => SmtpTransport::builder_dangerous(&config.smtp_host),
        };

        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(config.io_timeout));
        if !config.password.expose_secret().is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

fn parse_address(address: &str) -> Result<Address, DeliveryError> {
    address.trim().parse().map_err(|e: lettre::address::AddressError| DeliveryError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

/// Build the RFC 5322 message with an explicit envelope.
pub fn build_message(mail: &OutboundMail) -> Result<lettre::Message, DeliveryError> {
    let from = parse_address(&mail.from)?;
    let to = parse_address(&mail.to)?;
    let envelope = lettre::address::Envelope::new(Some(from.clone()), vec![to.clone()])
        .map_err(|e| DeliveryError::Build(e.to_string()))?;

    let mut builder = lettre::Message::builder()
        .from(Mailbox::new(None, from))
        .to(Mailbox::new(None, to))
        .subject(mail.subject.clone())
        .header(ContentType::TEXT_PLAIN)
        .envelope(envelope);
    if let Some(reply_to) = &mail.reply_to
        && let Ok(addr) = parse_address(reply_to)
    {
        builder = builder.reply_to(Mailbox::new(None, addr));
    }
    if let Some(original) = &mail.forwarded_from {
        builder = builder.header(XForwardedFrom(original.clone()));
    }

    builder
        .body(mail.body.clone())
        .map_err(|e| DeliveryError::Build(e.to_string()))
}

#[async_trait]
impl Outbound for SmtpOutbound {
    async fn send(&self, mail: &OutboundMail) -> Result<(), DeliveryError> {
        let message = build_message(mail)?;
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| DeliveryError::Transport {
                reason: format!("SMTP task failed: {e}"),
                permanent: false,
            })?
            .map_err(|e| DeliveryError::Transport {
                permanent: e.is_permanent(),
                reason: e.to_string(),
            })?;
        info!(to = %mail.to, subject = %mail.subject, "Mail sent");
        Ok(())
    }
}

// ── Sink ────────────────────────────────────────────────────────────

/// Final delivery state recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Delivered,
    Failed,
    Skipped,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        })
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// Result of executing one decision.
#[derive(Debug)]
pub struct Delivery {
    pub outcome: Outcome,
    /// Delivery error text, when the outcome is `failed`.
    pub error: Option<String>,
    /// Whether the original is now marked read.
    pub acknowledged: bool,
    /// Set when marking the original read failed after retries.
    pub ack_error: Option<SourceError>,
    /// Folder the original was moved into, if any.
    pub folder: Option<String>,
}

/// Idempotency key: message-id plus a hash of the decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DeliveryKey {
    message_id: String,
    decision: u64,
}

impl DeliveryKey {
    fn new(message: &Message, decision: &RoutingDecision) -> Self {
        let mut hasher = DefaultHasher::new();
        decision.hash(&mut hasher);
        Self {
            message_id: message.message_id.clone(),
            decision: hasher.finish(),
        }
    }
}

/// Delivery policy knobs.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Deliver `review` decisions (otherwise just mark read).
    pub deliver_reviews: bool,
    /// Mark messages read even when delivery failed.
    pub ack_failed: bool,
    pub retry: RetryPolicy,
    /// Where acknowledged mail is filed.
    pub folders: FolderMap,
    /// Bound on remembered deliveries; the least recently delivered is
    /// forgotten first.
    pub delivered_capacity: usize,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            deliver_reviews: true,
            ack_failed: true,
            retry: RetryPolicy::default(),
            folders: FolderMap::default(),
            delivered_capacity: DEFAULT_DELIVERED_CAPACITY,
        }
    }
}

/// Executes routing decisions against the outbound transport and the source.
pub struct MailSink {
    outbound: Arc<dyn Outbound>,
    agent_address: String,
    options: SinkOptions,
    delivered: Mutex<LruCache<DeliveryKey, ()>>,
}

impl MailSink {
    pub fn new(outbound: Arc<dyn Outbound>, agent_address: impl Into<String>, options: SinkOptions) -> Self {
        let capacity = NonZeroUsize::new(options.delivered_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            outbound,
            agent_address: agent_address.into(),
            options,
            delivered: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Sender address used on outbound mail.
    pub fn agent_address(&self) -> &str {
        &self.agent_address
    }

    /// Whether this message was already delivered under this decision.
    pub fn already_delivered(&self, message: &Message, decision: &RoutingDecision) -> bool {
        let key = DeliveryKey::new(message, decision);
        self.delivered
            .lock()
            .map(|cache| cache.contains(&key))
            .unwrap_or(false)
    }

    fn remember(&self, message: &Message, decision: &RoutingDecision) {
        if let Ok(mut cache) = self.delivered.lock() {
            cache.put(DeliveryKey::new(message, decision), ());
        }
    }

    /// Perform the decision's side effects, acknowledge the original and
    /// file it into its configured folder.
    pub async fn execute(
        &self,
        session: &mut dyn MailSession,
        message: &Message,
        decision: &RoutingDecision,
    ) -> Delivery {
        let (outcome, error) = self.deliver(message, decision).await;

        let ack = outcome != Outcome::Failed || self.options.ack_failed;
        let ack_error = if ack {
            source::acknowledge(session, message.uid, &self.options.retry)
                .await
                .err()
        } else {
            debug!(uid = message.uid, "Leaving failed message unread");
            None
        };
        if let Some(e) = &ack_error {
            warn!(uid = message.uid, error = %e, "Could not mark message read");
        }
        let acknowledged = ack && ack_error.is_none();

        let folder = match self.folder_for(decision, outcome) {
            Some(folder) if acknowledged => self.file(session, message.uid, folder).await,
            _ => None,
        };

        Delivery {
            outcome,
            error,
            acknowledged,
            ack_error,
            folder,
        }
    }

    fn folder_for(&self, decision: &RoutingDecision, outcome: Outcome) -> Option<&str> {
        if outcome == Outcome::Failed {
            return None;
        }
        let folders = &self.options.folders;
        let folder = match decision.action {
            _ if decision.matched_rule == MatchedRule::Quarantine => &folders.quarantine,
            RouteAction::Forward => &folders.processed,
            RouteAction::Review => &folders.review,
            RouteAction::Drop => &folders.skipped,
        };
        folder.as_deref()
    }

    /// Move the original. A failed move leaves it read in place.
    async fn file(&self, session: &mut dyn MailSession, uid: u32, folder: &str) -> Option<String> {
        match source::move_message(session, uid, folder, &self.options.retry).await {
            Ok(()) => {
                debug!(uid, folder, "Message filed");
                Some(folder.to_string())
            }
            Err(e) => {
                warn!(uid, folder, error = %e, "Could not file message");
                None
            }
        }
    }

    async fn deliver(&self, message: &Message, decision: &RoutingDecision) -> (Outcome, Option<String>) {
        let mail = match decision.action {
            RouteAction::Drop => return (Outcome::Skipped, None),
            RouteAction::Review if !self.options.deliver_reviews => return (Outcome::Skipped, None),
            RouteAction::Forward | RouteAction::Review => {
                let Some(target) = decision.target.as_deref() else {
                    return (Outcome::Failed, Some("decision has no target".into()));
                };
                self.compose(message, decision.action, target)
            }
        };

        if self.already_delivered(message, decision) {
            debug!(uid = message.uid, message_id = %message.message_id, "Already delivered, not resending");
            return (Outcome::Delivered, None);
        }

        let mut backoff = self.options.retry.backoff();
        loop {
            match self.outbound.send(&mail).await {
                Ok(()) => {
                    self.remember(message, decision);
                    return (Outcome::Delivered, None);
                }
                Err(e) if e.is_retryable() => match backoff.next() {
                    Some(delay) => {
                        warn!(uid = message.uid, error = %e, attempt = backoff.attempt(), "Send failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return (Outcome::Failed, Some(e.to_string())),
                },
                Err(e) => return (Outcome::Failed, Some(e.to_string())),
            }
        }
    }

    fn compose(&self, message: &Message, action: RouteAction, target: &str) -> OutboundMail {
        let subject = match action {
            RouteAction::Review => format!("{REVIEW_PREFIX}{}", message.subject),
            _ => message.subject.clone(),
        };
        OutboundMail {
            from: self.agent_address.clone(),
            to: target.to_string(),
            reply_to: Some(message.from.clone()),
            subject,
            body: forwarded_body(message),
            forwarded_from: Some(message.from.clone()),
        }
    }
}

/// Original body with a forwarded-message preamble.
pub fn forwarded_body(message: &Message) -> String {
    let mut body = String::with_capacity(message.body.len() + 256);
    body.push_str("---------- Forwarded message ----------\n");
    body.push_str(&format!("From: {}\n", message.from));
    if let Some(date) = message.date {
        body.push_str(&format!("Date: {}\n", date.to_rfc2822()));
    }
    body.push_str(&format!("Subject: {}\n", message.subject));
    if !message.to.is_empty() {
        body.push_str(&format!("To: {}\n", message.to.join(", ")));
    }
    body.push('\n');
    body.push_str(&message.body);
    body
}
