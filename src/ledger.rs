//! Append-only processing ledger (JSON Lines).
//!
//! One entry per processed message. Appends are serialized and synced before
//! returning. Readers open their own handle and may run while appends
//! continue; a half-written last line is skipped.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classifier::ClassificationResult;
use crate::error::LedgerError;
use crate::mail::message::Message;
use crate::mail::sink::Outcome;
use crate::routing::{MatchedRule, RouteAction, RoutingDecision};

/// Record of one processed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub uid: u32,
    pub message_id: String,
    pub subject: String,
    pub from: String,
    pub ai_category: String,
    pub ai_confidence: f32,
    pub ai_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_reason: Option<String>,
    pub final_action: RouteAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub matched_rule: MatchedRule,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Folder the original was filed into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub session_id: Uuid,
    pub processing_ms: u64,
}

impl LedgerEntry {
    pub fn new(
        session_id: Uuid,
        message: &Message,
        result: &ClassificationResult,
        decision: &RoutingDecision,
        outcome: Outcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            uid: message.uid,
            message_id: message.message_id.clone(),
            subject: message.subject.clone(),
            from: message.from.clone(),
            ai_category: result.category.clone(),
            ai_confidence: result.confidence,
            ai_provider: result.provider.clone(),
            ai_reason: result.rationale.clone(),
            final_action: decision.action,
            target: decision.target.clone(),
            matched_rule: decision.matched_rule.clone(),
            outcome,
            error: None,
            folder: None,
            session_id,
            processing_ms: 0,
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn with_folder(mut self, folder: Option<String>) -> Self {
        self.folder = folder;
        self
    }

    pub fn with_processing_ms(mut self, ms: u64) -> Self {
        self.processing_ms = ms;
        self
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTotals {
    pub processed: u64,
    pub forwarded: u64,
    pub review: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl SessionTotals {
    pub fn record(&mut self, entry: &LedgerEntry) {
        self.processed += 1;
        if entry.outcome == Outcome::Failed {
            self.failed += 1;
            return;
        }
        match entry.final_action {
            RouteAction::Forward => self.forwarded += 1,
            RouteAction::Review => self.review += 1,
            RouteAction::Drop => self.dropped += 1,
        }
    }
}

/// One watch session as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    pub totals: SessionTotals,
}

/// Criteria for reading entries back. Empty filter matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerFilter {
    pub message_id: Option<String>,
    pub action: Option<RouteAction>,
    pub outcome: Option<Outcome>,
    pub session_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    /// Stop after this many matches.
    pub limit: Option<usize>,
}

impl LedgerFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.message_id.as_ref().is_none_or(|id| *id == entry.message_id)
            && self.action.is_none_or(|a| a == entry.final_action)
            && self.outcome.is_none_or(|o| o == entry.outcome)
            && self.session_id.is_none_or(|s| s == entry.session_id)
            && self.since.is_none_or(|t| entry.timestamp >= t)
    }
}

/// The JSONL ledger file.
#[derive(Debug)]
pub struct ProcessingLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ProcessingLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and sync it to disk.
    pub async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(message_id = %entry.message_id, action = %entry.final_action, outcome = %entry.outcome, "Ledger entry appended");
        Ok(())
    }

    /// Lazily read entries matching `filter`, oldest first.
    pub fn read(&self, filter: LedgerFilter) -> Result<LedgerReader, LedgerError> {
        let reader = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(LedgerReader {
            reader,
            remaining: filter.limit,
            filter,
            line: 0,
        })
    }

    /// Run a blocking scan over a second handle on the same file.
    async fn scan<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&ProcessingLedger) -> Result<T, LedgerError> + Send + 'static,
    {
        let ledger = Self::new(self.path.clone());
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|e| LedgerError::Io(std::io::Error::other(e)))?
    }

    /// The most recent `n` entries matching `filter`, oldest first.
    pub async fn recent(&self, filter: LedgerFilter, n: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.scan(move |ledger| {
            let mut tail = VecDeque::with_capacity(n.min(1024));
            for entry in ledger.read(LedgerFilter { limit: None, ..filter })? {
                if tail.len() == n {
                    tail.pop_front();
                }
                if n > 0 {
                    tail.push_back(entry);
                }
            }
            Ok(tail.into_iter().collect())
        })
        .await
    }

    /// Every session with at least one entry, in order of first appearance.
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, LedgerError> {
        self.scan(|ledger| {
            let mut order: HashMap<Uuid, usize> = HashMap::new();
            let mut sessions: Vec<SessionSummary> = Vec::new();
            for entry in ledger.read(LedgerFilter::default())? {
                let i = *order.entry(entry.session_id).or_insert_with(|| {
                    sessions.push(SessionSummary {
                        session_id: entry.session_id,
                        first_at: entry.timestamp,
                        last_at: entry.timestamp,
                        totals: SessionTotals::default(),
                    });
                    sessions.len() - 1
                });
                let summary = &mut sessions[i];
                summary.first_at = summary.first_at.min(entry.timestamp);
                summary.last_at = summary.last_at.max(entry.timestamp);
                summary.totals.record(&entry);
            }
            Ok(sessions)
        })
        .await
    }

    /// Matching entries re-encoded as JSON Lines, oldest first.
    pub async fn export(&self, filter: LedgerFilter) -> Result<String, LedgerError> {
        self.scan(move |ledger| {
            let mut out = String::new();
            for entry in ledger.read(filter)? {
                out.push_str(&serde_json::to_string(&entry)?);
                out.push('\n');
            }
            Ok(out)
        })
        .await
    }
}

/// Iterator over ledger entries. Corrupt lines are logged and skipped.
pub struct LedgerReader {
    reader: Option<BufReader<File>>,
    filter: LedgerFilter,
    remaining: Option<usize>,
    line: usize,
}

impl Iterator for LedgerReader {
    type Item = LedgerEntry;

    fn next(&mut self) -> Option<LedgerEntry> {
        if self.remaining == Some(0) {
            return None;
        }
        let reader = self.reader.as_mut()?;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Ledger read failed");
                    return None;
                }
            }
            self.line += 1;
            // A writer may be mid-append.
            if buf.last() != Some(&b'\n') {
                return None;
            }
            let text = String::from_utf8_lossy(&buf);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(text) {
                Ok(entry) if self.filter.matches(&entry) => {
                    if let Some(n) = self.remaining.as_mut() {
                        *n -= 1;
                    }
                    return Some(entry);
                }
                Ok(_) => {}
                Err(e) => warn!(line = self.line, error = %e, "Skipping corrupt ledger line"),
            }
        }
    }
}
