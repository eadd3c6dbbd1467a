//! Mailbox ingestion abstraction.
//!
//! A [`MailSource`] opens a [`MailSession`]; the session hands out one
//! [`UnreadMessages`] cursor per search. The cursor fetches lazily, one
//! message per `next()`, and is consumed as it goes: to see newly arrived
//! mail, search again.

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::mail::message::Message;
use crate::retry::RetryPolicy;

/// Opens sessions against one mailbox.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Connect and authenticate. `Connection` and `Auth` errors are fatal.
    async fn open(&self) -> Result<Box<dyn MailSession>, SourceError>;
}

/// An authenticated session with the mailbox selected.
#[async_trait]
pub trait MailSession: Send {
    /// UIDs currently flagged unread, in ascending order.
    async fn search_unread(&mut self) -> Result<Vec<u32>, SourceError>;

    /// Fetch one message without marking it read. `None` if the UID is gone.
    async fn fetch(&mut self, uid: u32) -> Result<Option<Message>, SourceError>;

    /// Mark a message read. Acknowledging an already-read UID is a no-op.
    async fn acknowledge(&mut self, uid: u32) -> Result<(), SourceError>;

    /// Move a message into another folder. Moving a UID that is already
    /// gone is a no-op.
    async fn move_to(&mut self, uid: u32, folder: &str) -> Result<(), SourceError>;

    /// Release the session. Safe to call more than once.
    async fn close(&mut self) -> Result<(), SourceError>;
}

/// Search for unread mail and return a lazy cursor over the snapshot.
pub async fn fetch_unread(
    session: &mut dyn MailSession,
    retry: &RetryPolicy,
) -> Result<UnreadMessages, SourceError> {
    let mut backoff = retry.backoff();
    let uids = loop {
        match session.search_unread().await {
            Ok(uids) => break uids,
            Err(e) if e.is_transient() => match backoff.next() {
                Some(delay) => {
                    warn!(error = %e, attempt = backoff.attempt(), "Unread search failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    };
    debug!(count = uids.len(), "Unread snapshot taken");
    Ok(UnreadMessages {
        pending: uids.into(),
        retry: *retry,
    })
}

/// Acknowledge with bounded retries on transient errors.
pub async fn acknowledge(
    session: &mut dyn MailSession,
    uid: u32,
    retry: &RetryPolicy,
) -> Result<(), SourceError> {
    let mut backoff = retry.backoff();
    loop {
        match session.acknowledge(uid).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => match backoff.next() {
                Some(delay) => {
                    warn!(uid, error = %e, "Acknowledge failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

/// Move a message into `folder`, retrying transient errors.
pub async fn move_message(
    session: &mut dyn MailSession,
    uid: u32,
    folder: &str,
    retry: &RetryPolicy,
) -> Result<(), SourceError> {
    let mut backoff = retry.backoff();
    loop {
        match session.move_to(uid, folder).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => match backoff.next() {
                Some(delay) => {
                    warn!(uid, folder, error = %e, "Move failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

/// Finite, non-restartable sequence of unread messages from one search.
#[derive(Debug)]
pub struct UnreadMessages {
    pending: VecDeque<u32>,
    retry: RetryPolicy,
}

impl UnreadMessages {
    /// UIDs not yet pulled from the cursor.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Fetch the next message. UIDs that disappeared since the search are
    /// skipped. Returns `None` when the snapshot is exhausted.
    pub async fn next(
        &mut self,
        session: &mut dyn MailSession,
    ) -> Option<Result<Message, SourceError>> {
        while let Some(uid) = self.pending.pop_front() {
            let mut backoff = self.retry.backoff();
            let fetched = loop {
                match session.fetch(uid).await {
                    Ok(found) => break Ok(found),
                    Err(e) if e.is_transient() => match backoff.next() {
                        Some(delay) => {
                            warn!(uid, error = %e, "Fetch failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => break Err(e),
                    },
                    Err(e) => break Err(e),
                }
            };
            match fetched {
                Ok(Some(message)) => return Some(Ok(message)),
                Ok(None) => {
                    debug!(uid, "Message vanished since search, skipping");
                    continue;
                }
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
