//! In-memory mailbox and outbound transport.
//!
//! Shared by the unit and integration tests; they implement the same
//! traits as the IMAP and SMTP adapters.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::classifier::{ClassificationResult, Classifier, FallbackChain};
use crate::config::{CategoryRoute, DefaultAction, KeywordRule, RoutingConfig};
use crate::error::{ClassifierError, DeliveryError, SourceError};
use crate::events::EventBus;
use crate::ledger::ProcessingLedger;
use crate::mail::message::Message;
use crate::mail::sink::{MailSink, OutboundMail, Outbound, SinkOptions};
use crate::mail::source::{MailSession, MailSource};
use crate::retry::RetryPolicy;
use crate::routing::RoutingEngine;
use crate::watch::Pipeline;

/// Agent address used by [`memory_pipeline`].
pub const AGENT_ADDRESS: &str = "company@mail.local";

/// Build a minimal message for tests and demos.
pub fn sample_message(uid: u32, subject: &str, body: &str) -> Message {
    Message {
        uid,
        message_id: format!("<msg-{uid}@example.com>"),
        from: "customer@example.com".to_string(),
        to: vec!["company@mail.local".to_string()],
        subject: subject.to_string(),
        body: body.to_string(),
        headers: Vec::new(),
        size: subject.len() + body.len(),
        date: None,
    }
}

/// Routing used across the test suites: an `hr` keyword rule, `support`
/// and `sales` categories, threshold 0.7, review to `review@mail.local`.
pub fn sample_routing() -> RoutingConfig {
    let category = |name: &str, keywords: &[&str]| CategoryRoute {
        name: name.to_string(),
        mailbox: format!("{name}@mail.local"),
        description: String::new(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        quarantine: false,
    };
    RoutingConfig {
        rules: vec![KeywordRule {
            id: "hr".into(),
            keywords: vec!["resume".into(), "job application".into()],
            target: "hr@mail.local".into(),
            from: None,
        }],
        categories: vec![
            category("support", &["help", "broken", "order"]),
            category("sales", &["pricing", "quote"]),
        ],
        default_action: DefaultAction::Forward,
        review_threshold: 0.7,
        review_mailbox: Some("review@mail.local".into()),
    }
}

/// Retry policy with millisecond delays and no jitter.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_base_delay(Duration::from_millis(1))
        .with_jitter(Duration::ZERO)
}

/// Pipeline over the in-memory fakes with millisecond retry delays.
/// Classifies "order" as support (0.92), "pricing" as sales (0.55) and
/// "lottery" as spam (0.95).
pub fn memory_pipeline(
    mailbox: &MemoryMailbox,
    outbound: &RecordingOutbound,
    routing: RoutingConfig,
    ledger_path: &Path,
) -> Pipeline {
    memory_pipeline_with(mailbox, outbound, routing, ledger_path, SinkOptions::default())
}

/// [`memory_pipeline`] with explicit sink options. The retry policy is
/// always replaced by [`fast_retry`].
pub fn memory_pipeline_with(
    mailbox: &MemoryMailbox,
    outbound: &RecordingOutbound,
    routing: RoutingConfig,
    ledger_path: &Path,
    options: SinkOptions,
) -> Pipeline {
    let classifier: Arc<dyn Classifier> = Arc::new(
        FixedClassifier::new()
            .answer("order", "support", 0.92)
            .answer("pricing", "sales", 0.55)
            .answer("lottery", "spam", 0.95),
    );
    let retry = fast_retry();
    let sink = MailSink::new(
        Arc::new(outbound.clone()),
        AGENT_ADDRESS,
        SinkOptions { retry, ..options },
    );
    Pipeline::new(
        Arc::new(mailbox.clone()),
        Arc::new(FallbackChain::new(vec![classifier], Duration::from_secs(1), 0)),
        Arc::new(RoutingEngine::new(routing)),
        Arc::new(sink),
        Arc::new(ProcessingLedger::new(ledger_path)),
        EventBus::new(),
    )
    .with_io_retry(retry)
}

#[derive(Debug, Default)]
struct MailboxState {
    messages: BTreeMap<u32, (Message, bool)>,
    folders: BTreeMap<String, Vec<u32>>,
    reject_logins: bool,
    unreachable: bool,
    fail_fetches: u32,
    fail_acks: u32,
    fail_searches: u32,
    opens: u32,
    closes: u32,
}

/// Shared in-memory mailbox. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an unread message (replaces any message with the same UID).
    pub fn deliver(&self, message: Message) {
        self.lock().messages.insert(message.uid, (message, false));
    }

    /// Remove a message as if it were expunged by another client.
    pub fn expunge(&self, uid: u32) {
        self.lock().messages.remove(&uid);
    }

    /// Mark a message unread again.
    pub fn mark_unread(&self, uid: u32) {
        if let Some((_, seen)) = self.lock().messages.get_mut(&uid) {
            *seen = false;
        }
    }

    pub fn unread_uids(&self) -> Vec<u32> {
        self.lock()
            .messages
            .iter()
            .filter(|(_, (_, seen))| !seen)
            .map(|(uid, _)| *uid)
            .collect()
    }

    pub fn read_uids(&self) -> Vec<u32> {
        self.lock()
            .messages
            .iter()
            .filter(|(_, (_, seen))| *seen)
            .map(|(uid, _)| *uid)
            .collect()
    }

    /// UIDs moved into `folder`, in move order.
    pub fn folder(&self, folder: &str) -> Vec<u32> {
        self.lock().folders.get(folder).cloned().unwrap_or_default()
    }

    /// Make every subsequent `open()` fail authentication.
    pub fn reject_logins(&self) {
        self.lock().reject_logins = true;
    }

    /// Make every subsequent `open()` fail to connect.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// The next `n` fetches fail with a transient error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.lock().fail_fetches = n;
    }

    /// The next `n` acknowledgements fail with a transient error.
    pub fn fail_next_acks(&self, n: u32) {
        self.lock().fail_acks = n;
    }

    /// The next `n` unread searches fail with a transient error.
    pub fn fail_next_searches(&self, n: u32) {
        self.lock().fail_searches = n;
    }

    /// Sessions opened so far.
    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    /// Sessions closed so far.
    pub fn closes(&self) -> u32 {
        self.lock().closes
    }
}

#[async_trait]
impl MailSource for MemoryMailbox {
    fn describe(&self) -> String {
        "memory://inbox".to_string()
    }

    async fn open(&self) -> Result<Box<dyn MailSession>, SourceError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(SourceError::Connection {
                host: "memory".into(),
                port: 0,
                reason: "unreachable".into(),
            });
        }
        if state.reject_logins {
            return Err(SourceError::Auth {
                user: "memory".into(),
                reason: "invalid credentials".into(),
            });
        }
        state.opens += 1;
        Ok(Box::new(MemorySession {
            mailbox: self.clone(),
            closed: false,
        }))
    }
}

struct MemorySession {
    mailbox: MemoryMailbox,
    closed: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), SourceError> {
        if self.closed {
            return Err(SourceError::Protocol("session closed".into()));
        }
        Ok(())
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl MailSession for MemorySession {
    async fn search_unread(&mut self) -> Result<Vec<u32>, SourceError> {
        self.ensure_open()?;
        let mut state = self.mailbox.lock();
        if take_failure(&mut state.fail_searches) {
            return Err(SourceError::Transient("search reset".into()));
        }
        Ok(state
            .messages
            .iter()
            .filter(|(_, (_, seen))| !seen)
            .map(|(uid, _)| *uid)
            .collect())
    }

    async fn fetch(&mut self, uid: u32) -> Result<Option<Message>, SourceError> {
        self.ensure_open()?;
        let mut state = self.mailbox.lock();
        if take_failure(&mut state.fail_fetches) {
            return Err(SourceError::Transient("fetch reset".into()));
        }
        Ok(state.messages.get(&uid).map(|(m, _)| m.clone()))
    }

    async fn acknowledge(&mut self, uid: u32) -> Result<(), SourceError> {
        self.ensure_open()?;
        let mut state = self.mailbox.lock();
        if take_failure(&mut state.fail_acks) {
            return Err(SourceError::Transient("store reset".into()));
        }
        if let Some((_, seen)) = state.messages.get_mut(&uid) {
            *seen = true;
        }
        Ok(())
    }

    async fn move_to(&mut self, uid: u32, folder: &str) -> Result<(), SourceError> {
        self.ensure_open()?;
        let mut state = self.mailbox.lock();
        if state.messages.remove(&uid).is_some() {
            state.folders.entry(folder.to_string()).or_default().push(uid);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if !self.closed {
            self.closed = true;
            self.mailbox.lock().closes += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OutboundState {
    sent: Vec<OutboundMail>,
    fail_next: u32,
    fail_always: bool,
}

/// Outbound transport that records what it was asked to send.
#[derive(Debug, Clone, Default)]
pub struct RecordingOutbound {
    state: Arc<Mutex<OutboundState>>,
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OutboundState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sent(&self) -> Vec<OutboundMail> {
        self.lock().sent.clone()
    }

    /// The next `n` sends fail with a transient SMTP error.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Every send fails with a permanent SMTP error.
    pub fn fail_always(&self, fail: bool) {
        self.lock().fail_always = fail;
    }
}

#[async_trait]
impl Outbound for RecordingOutbound {
    async fn send(&self, mail: &OutboundMail) -> Result<(), DeliveryError> {
        let mut state = self.lock();
        if state.fail_always {
            return Err(DeliveryError::Transport {
                reason: "550 mailbox unavailable".into(),
                permanent: true,
            });
        }
        if take_failure(&mut state.fail_next) {
            return Err(DeliveryError::Transport {
                reason: "451 try again later".into(),
                permanent: false,
            });
        }
        state.sent.push(mail.clone());
        Ok(())
    }
}

/// Classifier with canned answers keyed on a subject or body substring.
/// Messages matching no needle get `NoSignal`.
#[derive(Debug, Clone, Default)]
pub struct FixedClassifier {
    answers: Vec<(String, String, f32)>,
}

impl FixedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, needle: &str, category: &str, confidence: f32) -> Self {
        self.answers
            .push((needle.to_lowercase(), category.to_string(), confidence));
        self
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn analyze(
        &self,
        message: &Message,
        _previous: Option<&ClassificationResult>,
    ) -> Result<ClassificationResult, ClassifierError> {
        let text = message.searchable_text();
        self.answers
            .iter()
            .find(|(needle, _, _)| text.contains(needle.as_str()))
            .map(|(_, category, confidence)| ClassificationResult::new(category, *confidence, "fixed"))
            .ok_or_else(|| ClassifierError::NoSignal {
                provider: "fixed".into(),
            })
    }
}
