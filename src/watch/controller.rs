//! Start/stop control of the watch loop.
//!
//! At most one session runs at a time. Session state lives behind a plain
//! mutex that is never held across an await, so `status()` answers
//! immediately even while a cycle is blocked on the network.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WatchConfig;
use crate::error::WatchError;
use crate::events::{EventSubscription, ProcessingEvent};
use crate::ledger::{LedgerEntry, ProcessingLedger};
use crate::watch::pipeline::{CycleContext, Pipeline};
use crate::watch::session::{StopSignal, WatchSession, WatchSnapshot, WatchStatus};

/// Handle to the watch loop. Clones share the same session.
#[derive(Clone)]
pub struct WatchController {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<WatchSession>,
    task: Mutex<Option<JoinHandle<()>>>,
    pipeline: Pipeline,
    config: WatchConfig,
}

impl WatchController {
    pub fn new(pipeline: Pipeline, config: WatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(WatchSession::default()),
                task: Mutex::new(None),
                pipeline,
                config,
            }),
        }
    }

    /// Start a continuous watch session.
    pub fn start(&self) -> Result<WatchSnapshot, WatchError> {
        self.launch(false)
    }

    /// Run a single cycle in a fresh session, then return to `stopped`.
    pub fn run_once(&self) -> Result<WatchSnapshot, WatchError> {
        self.launch(true)
    }

    /// Ask the running session to stop. The message in flight is finished;
    /// the rest of the unread snapshot is left for a later session.
    pub fn stop(&self) -> Result<WatchSnapshot, WatchError> {
        let mut state = self.inner.lock_state();
        if !state.transition(WatchStatus::Stopping) {
            return Err(WatchError::NotRunning);
        }
        state.stop.request();
        info!(session_id = ?state.session_id, "Stop requested");
        Ok(state.snapshot())
    }

    pub fn status(&self) -> WatchSnapshot {
        self.inner.lock_state().snapshot()
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.inner.pipeline.events().subscribe()
    }

    pub fn ledger(&self) -> &Arc<ProcessingLedger> {
        self.inner.pipeline.ledger()
    }

    /// Wait for the most recently launched session task to exit.
    pub async fn wait(&self) {
        let handle = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "Watch session task failed");
        }
    }

    fn launch(&self, one_shot: bool) -> Result<WatchSnapshot, WatchError> {
        let (session_id, stop, snapshot) = {
            let mut state = self.inner.lock_state();
            if state.status != WatchStatus::Stopped {
                return Err(WatchError::AlreadyRunning {
                    status: state.status.to_string(),
                });
            }
            self.inner.pipeline.engine().config().validate()?;
            let session_id = state
                .begin(one_shot)
                .ok_or_else(|| WatchError::AlreadyRunning {
                    status: state.status.to_string(),
                })?;
            (session_id, Arc::clone(&state.stop), state.snapshot())
        };

        self.inner.pipeline.events().publish(ProcessingEvent::SessionStarted {
            session_id,
            started_at: snapshot.started_at.unwrap_or_else(Utc::now),
            one_shot,
        });
        info!(%session_id, one_shot, "Watch session started");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_session(session_id, one_shot, stop).await });
        *self
            .inner
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        Ok(snapshot)
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, WatchSession> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update<R>(&self, f: impl FnOnce(&mut WatchSession) -> R) -> R {
        f(&mut self.lock_state())
    }

    fn is_running(&self) -> bool {
        self.lock_state().status == WatchStatus::Running
    }

    async fn run_session(self: Arc<Self>, session_id: Uuid, one_shot: bool, stop: Arc<StopSignal>) {
        let events = self.pipeline.events();
        let max_failures = self.config.max_failed_cycles.max(1);
        let mut ctx = CycleContext::new(session_id).with_stop(Arc::clone(&stop));

        let reason = loop {
            ctx.cycle += 1;
            let cycle = ctx.cycle;
            self.update(|s| s.cycles = cycle);
            events.publish(ProcessingEvent::CycleStarted { session_id, cycle });

            let mut processed = 0usize;
            let result = {
                let mut on_entry = |entry: &LedgerEntry| {
                    processed += 1;
                    self.update(|s| s.totals.record(entry));
                };
                self.pipeline.run_cycle(&mut ctx, &mut on_entry).await
            };

            let now = Utc::now();
            let (error_text, stop_reason) = match result {
                Ok(report) => {
                    self.update(|s| {
                        s.last_cycle_at = Some(now);
                        s.consecutive_failures = 0;
                    });
                    if report.duplicates > 0 {
                        info!(%session_id, cycle, duplicates = report.duplicates, "Acknowledged already-recorded messages");
                    }
                    if report.interrupted {
                        info!(%session_id, cycle, processed = report.processed, "Cycle cut short by stop request");
                    }
                    (None, None)
                }
                Err(e) => {
                    let text = e.to_string();
                    let failures = self.update(|s| {
                        s.last_cycle_at = Some(now);
                        s.last_error = Some(text.clone());
                        s.consecutive_failures += 1;
                        s.consecutive_failures
                    });
                    let stop_reason = if e.is_fatal() {
                        error!(%session_id, cycle, error = %e, "Fatal cycle error, stopping session");
                        Some(text.clone())
                    } else if failures >= max_failures {
                        error!(%session_id, cycle, failures, error = %e, "Too many failed cycles, stopping session");
                        Some(format!("{failures} consecutive failed cycles: {text}"))
                    } else {
                        warn!(%session_id, cycle, failures, error = %e, "Cycle failed");
                        None
                    };
                    (Some(text), stop_reason)
                }
            };

            events.publish(ProcessingEvent::CycleFinished {
                session_id,
                cycle,
                processed,
                error: error_text,
            });

            if stop_reason.is_some() {
                break stop_reason;
            }
            if one_shot || !self.is_running() {
                break None;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = stop.wait() => {}
            }
            if !self.is_running() {
                break None;
            }
        };

        let snapshot = self.update(|s| {
            s.transition(WatchStatus::Stopped);
            if let Some(r) = &reason {
                s.last_error = Some(r.clone());
            }
            s.snapshot()
        });
        info!(
            %session_id,
            cycles = snapshot.cycles,
            processed = snapshot.totals.processed,
            reason = reason.as_deref().unwrap_or("requested"),
            "Watch session stopped"
        );
        events.publish(ProcessingEvent::SessionStopped { session_id, reason });
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::config::RoutingConfig;
    use crate::ledger::LedgerFilter;
    use crate::testing::{MemoryMailbox, RecordingOutbound, memory_pipeline, sample_message, sample_routing};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        mailbox: MemoryMailbox,
        controller: WatchController,
        _dir: TempDir,
    }

    fn harness_with(routing: RoutingConfig, max_failed_cycles: u32) -> Harness {
        let dir = TempDir::new().unwrap();
        let mailbox = MemoryMailbox::new();
        let pipeline = memory_pipeline(
            &mailbox,
            &RecordingOutbound::new(),
            routing,
            &dir.path().join("ledger.jsonl"),
        );
        let config = WatchConfig {
            poll_interval: Duration::from_millis(20),
            max_failed_cycles,
            ledger_path: dir.path().join("ledger.jsonl"),
            ..WatchConfig::default()
        };
        Harness {
            mailbox,
            controller: WatchController::new(pipeline, config),
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(sample_routing(), 3)
    }

    async fn within<F: Future>(f: F) -> F::Output {
        tokio::time::timeout(TEST_TIMEOUT, f)
            .await
            .expect("timed out")
    }

    async fn wait_until(controller: &WatchController, pred: impl Fn(&WatchSnapshot) -> bool) {
        within(async {
            while !pred(&controller.status()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }

    #[tokio::test]
    async fn start_process_stop() {
        let h = harness();
        h.mailbox.deliver(sample_message(1, "Need help with order", ""));

        let snap = h.controller.start().unwrap();
        assert_eq!(snap.status, WatchStatus::Running);
        assert!(snap.session_id.is_some());

        wait_until(&h.controller, |s| s.totals.processed == 1).await;
        assert_eq!(h.controller.status().totals.forwarded, 1);

        let snap = h.controller.stop().unwrap();
        assert_eq!(snap.status, WatchStatus::Stopping);
        within(h.controller.wait()).await;
        assert_eq!(h.controller.status().status, WatchStatus::Stopped);
        assert!(h.controller.status().last_error.is_none());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let h = harness();
        h.controller.start().unwrap();

        assert!(matches!(h.controller.start(), Err(WatchError::AlreadyRunning { .. })));
        assert!(matches!(h.controller.run_once(), Err(WatchError::AlreadyRunning { .. })));

        h.controller.stop().unwrap();
        assert!(matches!(h.controller.stop(), Err(WatchError::NotRunning)));
        within(h.controller.wait()).await;
    }

    #[tokio::test]
    async fn stop_when_stopped_is_rejected() {
        let h = harness();
        assert!(matches!(h.controller.stop(), Err(WatchError::NotRunning)));
    }

    #[tokio::test]
    async fn invalid_config_keeps_stopped() {
        let routing = RoutingConfig {
            review_mailbox: None,
            ..sample_routing()
        };
        let h = harness_with(routing, 3);
        assert!(matches!(h.controller.start(), Err(WatchError::Config(_))));
        assert_eq!(h.controller.status().status, WatchStatus::Stopped);
        assert!(h.controller.status().session_id.is_none());
    }

    #[tokio::test]
    async fn run_once_emits_full_event_sequence() {
        let h = harness();
        h.mailbox.deliver(sample_message(1, "pricing", ""));
        let mut events = h.controller.subscribe();

        let snap = h.controller.run_once().unwrap();
        let id = snap.session_id.unwrap();
        within(h.controller.wait()).await;

        let mut kinds = Vec::new();
        loop {
            let event = within(events.recv()).await.unwrap();
            assert_eq!(event.session_id(), id);
            let stopped = matches!(event, ProcessingEvent::SessionStopped { .. });
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
            if stopped {
                break;
            }
        }
        assert_eq!(
            kinds,
            [
                "session_started",
                "cycle_started",
                "message_processed",
                "cycle_finished",
                "session_stopped"
            ]
        );

        let status = h.controller.status();
        assert_eq!(status.status, WatchStatus::Stopped);
        assert_eq!(status.cycles, 1);
        assert_eq!(status.totals.review, 1);
    }

    #[tokio::test]
    async fn fatal_source_error_stops_session() {
        let h = harness();
        h.mailbox.set_unreachable(true);
        h.controller.start().unwrap();
        within(h.controller.wait()).await;

        let status = h.controller.status();
        assert_eq!(status.status, WatchStatus::Stopped);
        assert_eq!(status.cycles, 1);
        assert!(status.last_error.unwrap().contains("Cannot reach"));
    }

    #[tokio::test]
    async fn repeated_transient_failures_stop_session() {
        let h = harness_with(sample_routing(), 2);
        h.mailbox.fail_next_searches(100);
        h.controller.start().unwrap();
        within(h.controller.wait()).await;

        let status = h.controller.status();
        assert_eq!(status.status, WatchStatus::Stopped);
        assert_eq!(status.cycles, 2);
        assert_eq!(status.consecutive_failures, 2);
        assert!(status.last_error.unwrap().contains("2 consecutive failed cycles"));
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_cycle() {
        let h = harness();
        let total = 300;
        for uid in 1..=total {
            h.mailbox.deliver(sample_message(uid, "Need help with order", ""));
        }

        h.controller.start().unwrap();
        wait_until(&h.controller, |s| s.totals.processed >= 1).await;
        h.controller.stop().unwrap();
        within(h.controller.wait()).await;

        let status = h.controller.status();
        let processed = status.totals.processed as usize;
        assert_eq!(status.status, WatchStatus::Stopped);
        assert_eq!(status.cycles, 1);
        assert!(processed < total as usize, "processed all {processed} after stop");
        assert_eq!(h.mailbox.unread_uids().len(), total as usize - processed);
    }

    #[tokio::test]
    async fn restart_gets_fresh_session() {
        let h = harness();
        h.mailbox.deliver(sample_message(1, "Need help with order", ""));
        let first = h.controller.run_once().unwrap().session_id;
        within(h.controller.wait()).await;
        assert_eq!(h.controller.status().totals.processed, 1);

        let snap = h.controller.run_once().unwrap();
        assert_ne!(snap.session_id, first);
        assert_eq!(snap.totals.processed, 0);
        within(h.controller.wait()).await;

        let entries: Vec<_> = h
            .controller
            .ledger()
            .read(LedgerFilter::default())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
