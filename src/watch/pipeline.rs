//! One watch cycle: fetch, classify, decide, deliver, record, announce.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{ClassificationResult, FallbackChain};
use crate::error::CycleError;
use crate::events::{EventBus, ProcessingEvent};
use crate::ledger::{LedgerEntry, ProcessingLedger};
use crate::mail::message::Message;
use crate::mail::sink::{MailSink, Outcome};
use crate::mail::source::{self, MailSession, MailSource};
use crate::retry::RetryPolicy;
use crate::routing::{MatchedRule, RoutingDecision, RoutingEngine};
use crate::watch::session::StopSignal;

/// State that outlives a single cycle within one session.
#[derive(Debug)]
pub struct CycleContext {
    pub session_id: Uuid,
    pub cycle: u64,
    /// Message-ids already recorded and acknowledged in this session.
    seen: HashSet<String>,
    stop: Arc<StopSignal>,
}

impl CycleContext {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            cycle: 0,
            seen: HashSet::new(),
            stop: Arc::new(StopSignal::default()),
        }
    }

    /// Abandon the rest of a cycle once `stop` is requested.
    pub fn with_stop(mut self, stop: Arc<StopSignal>) -> Self {
        self.stop = stop;
        self
    }

    pub fn has_seen(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }
}

/// Counts for one finished cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages that produced a ledger entry.
    pub processed: usize,
    /// Messages acknowledged without reprocessing.
    pub duplicates: usize,
    /// Stop was requested before the unread snapshot was exhausted.
    pub interrupted: bool,
}

/// The per-message processing path shared by every session.
pub struct Pipeline {
    source: Arc<dyn MailSource>,
    classifier: Arc<FallbackChain>,
    engine: Arc<RoutingEngine>,
    sink: Arc<MailSink>,
    ledger: Arc<ProcessingLedger>,
    events: EventBus,
    io_retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn MailSource>,
        classifier: Arc<FallbackChain>,
        engine: Arc<RoutingEngine>,
        sink: Arc<MailSink>,
        ledger: Arc<ProcessingLedger>,
        events: EventBus,
    ) -> Self {
        Self {
            source,
            classifier,
            engine,
            sink,
            ledger,
            events,
            io_retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for mailbox search, fetch and acknowledge.
    pub fn with_io_retry(mut self, retry: RetryPolicy) -> Self {
        self.io_retry = retry;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ledger(&self) -> &Arc<ProcessingLedger> {
        &self.ledger
    }

    pub fn engine(&self) -> &RoutingEngine {
        &self.engine
    }

    /// Run one cycle. The session is closed on every path. `on_entry` sees
    /// each ledger entry right after it is written.
    pub async fn run_cycle(
        &self,
        ctx: &mut CycleContext,
        on_entry: &mut (dyn FnMut(&LedgerEntry) + Send),
    ) -> Result<CycleReport, CycleError> {
        let mut session = self.source.open().await?;
        let result = self.process_unread(session.as_mut(), ctx, on_entry).await;
        if let Err(e) = session.close().await {
            warn!(source = %self.source.describe(), error = %e, "Failed to close mailbox session");
        }
        result
    }

    async fn process_unread(
        &self,
        session: &mut dyn MailSession,
        ctx: &mut CycleContext,
        on_entry: &mut (dyn FnMut(&LedgerEntry) + Send),
    ) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::default();
        let mut unread = source::fetch_unread(session, &self.io_retry).await?;
        if unread.remaining() > 0 {
            info!(
                session_id = %ctx.session_id,
                cycle = ctx.cycle,
                count = unread.remaining(),
                "Processing unread messages"
            );
        }

        loop {
            if ctx.stop_requested() {
                if unread.remaining() > 0 {
                    info!(session_id = %ctx.session_id, left = unread.remaining(), "Stop requested, leaving the rest unread");
                    report.interrupted = true;
                }
                break;
            }
            let Some(next) = unread.next(session).await else {
                break;
            };
            let message = next?;

            if ctx.has_seen(&message.message_id) {
                debug!(uid = message.uid, message_id = %message.message_id, "Already recorded this session");
                source::acknowledge(session, message.uid, &self.io_retry).await?;
                report.duplicates += 1;
                continue;
            }

            let started = Instant::now();
            let (result, decision) = self.route(&message).await;
            let delivery = self.sink.execute(session, &message, &decision).await;

            let error = delivery.error.or_else(|| {
                delivery
                    .ack_error
                    .as_ref()
                    .map(|e| format!("acknowledge failed: {e}"))
            });
            let entry = LedgerEntry::new(ctx.session_id, &message, &result, &decision, delivery.outcome)
                .with_error(error)
                .with_folder(delivery.folder)
                .with_processing_ms(started.elapsed().as_millis() as u64);

            self.ledger.append(&entry).await?;
            // A failed message left unread is retried by the next cycle.
            if delivery.acknowledged || delivery.outcome != Outcome::Failed {
                ctx.seen.insert(message.message_id.clone());
            }
            report.processed += 1;

            info!(
                uid = entry.uid,
                message_id = %entry.message_id,
                action = %entry.final_action,
                target = entry.target.as_deref().unwrap_or("-"),
                rule = %entry.matched_rule,
                outcome = %entry.outcome,
                "Message processed"
            );
            on_entry(&entry);
            self.events.publish(ProcessingEvent::MessageProcessed {
                session_id: ctx.session_id,
                entry,
            });

            if let Some(e) = delivery.ack_error {
                return Err(e.into());
            }
        }

        Ok(report)
    }

    async fn route(&self, message: &Message) -> (ClassificationResult, RoutingDecision) {
        if message.from.eq_ignore_ascii_case(self.sink.agent_address()) {
            debug!(uid = message.uid, "Message sent by this agent, dropping");
            return (
                ClassificationResult::unknown("sent by this agent"),
                RoutingDecision::dropped(MatchedRule::SelfSent),
            );
        }
        let result = self.classifier.classify(message, None).await;
        let decision = self.engine.decide(message, &result);
        (result, decision)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::{CategoryRoute, FolderMap, RoutingConfig};
    use crate::ledger::LedgerFilter;
    use crate::mail::sink::SinkOptions;
    use crate::routing::RouteAction;
    use crate::testing::{
        AGENT_ADDRESS, MemoryMailbox, RecordingOutbound, memory_pipeline_with, sample_message, sample_routing,
    };

    struct Harness {
        mailbox: MemoryMailbox,
        outbound: RecordingOutbound,
        pipeline: Pipeline,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        harness_with(sample_routing(), SinkOptions::default())
    }

    fn harness_with(routing: RoutingConfig, options: SinkOptions) -> Harness {
        let dir = TempDir::new().unwrap();
        let mailbox = MemoryMailbox::new();
        let outbound = RecordingOutbound::new();
        let pipeline = memory_pipeline_with(
            &mailbox,
            &outbound,
            routing,
            &dir.path().join("ledger.jsonl"),
            options,
        );
        Harness {
            mailbox,
            outbound,
            pipeline,
            _dir: dir,
        }
    }

    fn entries(h: &Harness) -> Vec<LedgerEntry> {
        h.pipeline
            .ledger()
            .read(LedgerFilter::default())
            .unwrap()
            .collect()
    }

    async fn cycle(h: &Harness, ctx: &mut CycleContext) -> Result<CycleReport, CycleError> {
        ctx.cycle += 1;
        h.pipeline.run_cycle(ctx, &mut |_| {}).await
    }

    #[tokio::test]
    async fn routes_and_records_each_message() {
        let h = harness();
        h.mailbox.deliver(sample_message(1, "Need help with order #42", ""));
        h.mailbox.deliver(sample_message(2, "My resume", "Attached."));
        h.mailbox.deliver(sample_message(3, "pricing question", ""));

        let mut ctx = CycleContext::new(Uuid::new_v4());
        let report = cycle(&h, &mut ctx).await.unwrap();
        assert_eq!(report.processed, 3);

        let entries = entries(&h);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].target.as_deref(), Some("support@mail.local"));
        assert_eq!(entries[0].matched_rule, MatchedRule::AiCategory);
        assert_eq!(entries[1].target.as_deref(), Some("hr@mail.local"));
        assert_eq!(entries[1].matched_rule, MatchedRule::Rule("hr".into()));
        assert_eq!(entries[2].final_action, RouteAction::Review);
        assert_eq!(entries[2].target.as_deref(), Some("review@mail.local"));
        assert!(entries.iter().all(|e| e.outcome == Outcome::Delivered));
        assert!(entries.iter().all(|e| e.session_id == ctx.session_id));

        assert_eq!(h.outbound.sent().len(), 3);
        assert!(h.mailbox.unread_uids().is_empty());
        assert_eq!(h.mailbox.opens(), h.mailbox.closes());
    }

    #[tokio::test]
    async fn same_cycle_twice_adds_nothing() {
        let h = harness();
        h.mailbox.deliver(sample_message(1, "Need help with order", ""));
        h.mailbox.deliver(sample_message(2, "pricing", ""));

        let mut ctx = CycleContext::new(Uuid::new_v4());
        cycle(&h, &mut ctx).await.unwrap();
        let first = entries(&h).len();

        let report = cycle(&h, &mut ctx).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(entries(&h).len(), first);
    }

    #[tokio::test]
    async fn redelivered_message_is_acknowledged_not_reprocessed() {
        let h = harness();
        h.mailbox.deliver(sample_message(1, "Need help with order", ""));

        let mut ctx = CycleContext::new(Uuid::new_v4());
        cycle(&h, &mut ctx).await.unwrap();
        h.mailbox.mark_unread(1);

        let report = cycle(&h, &mut ctx).await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(entries(&h).len(), 1);
        assert_eq!(h.outbound.sent().len(), 1);
        assert!(h.mailbox.unread_uids().is_empty());
    }

    #[tokio::test]
    async fn new_session_does_not_resend_delivered_mail() {
        let h = harness();
        h.mailbox.deliver(sample_message(1, "Need help with order", ""));
        cycle(&h, &mut CycleContext::new(Uuid::new_v4())).await.unwrap();

        h.mailbox.mark_unread(1);
        cycle(&h, &mut CycleContext::new(Uuid::new_v4())).await.unwrap();

        assert_eq!(entries(&h).len(), 2);
        assert_eq!(h.outbound.sent().len(), 1);
    }

    #[tokio::test]
    async fn self_sent_mail_is_dropped() {
        let h = harness();
        let mut msg = sample_message(1, "Need help with order", "");
        msg.from = AGENT_ADDRESS.to_uppercase();
        h.mailbox.deliver(msg);

        cycle(&h, &mut CycleContext::new(Uuid::new_v4())).await.unwrap();

        let entries = entries(&h);
        assert_eq!(entries[0].final_action, RouteAction::Drop);
        assert_eq!(entries[0].matched_rule, MatchedRule::SelfSent);
        assert_eq!(entries[0].outcome, Outcome::Skipped);
        assert!(h.outbound.sent().is_empty());
        assert!(h.mailbox.unread_uids().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_is_recorded() {
        let h = harness();
        h.outbound.fail_always(true);
        h.mailbox.deliver(sample_message(1, "Need help with order", ""));

        cycle(&h, &mut CycleContext::new(Uuid::new_v4())).await.unwrap();

        let entries = entries(&h);
        assert_eq!(entries[0].outcome, Outcome::Failed);
        assert!(entries[0].error.as_deref().unwrap_or("").contains("550"));
    }

    #[tokio::test]
    async fn failed_message_left_unread_is_retried_next_cycle() {
        let h = harness_with(
            sample_routing(),
            SinkOptions {
                ack_failed: false,
                ..SinkOptions::default()
            },
        );
        h.outbound.fail_always(true);
        h.mailbox.deliver(sample_message(1, "Need help with order", ""));

        let mut ctx = CycleContext::new(Uuid::new_v4());
        cycle(&h, &mut ctx).await.unwrap();
        assert!(h.outbound.sent().is_empty());
        assert_eq!(h.mailbox.unread_uids(), vec![1]);
        assert!(!ctx.has_seen("<msg-1@example.com>"));

        h.outbound.fail_always(false);
        let report = cycle(&h, &mut ctx).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.duplicates, 0);
        assert_eq!(h.outbound.sent().len(), 1);
        assert!(h.mailbox.unread_uids().is_empty());

        let outcomes: Vec<Outcome> = entries(&h).iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Failed, Outcome::Delivered]);
    }

    #[tokio::test]
    async fn stop_request_leaves_remaining_mail_unread() {
        let h = harness();
        for uid in 1..=3 {
            h.mailbox.deliver(sample_message(uid, "Need help with order", ""));
        }
        let stop = Arc::new(StopSignal::default());
        let mut ctx = CycleContext::new(Uuid::new_v4()).with_stop(Arc::clone(&stop));

        let mut processed = Vec::new();
        let report = h
            .pipeline
            .run_cycle(&mut ctx, &mut |e| {
                processed.push(e.uid);
                stop.request();
            })
            .await
            .unwrap();

        assert_eq!(processed, vec![1]);
        assert_eq!(report.processed, 1);
        assert!(report.interrupted);
        assert_eq!(h.mailbox.unread_uids(), vec![2, 3]);
        assert_eq!(h.mailbox.opens(), h.mailbox.closes());
    }

    #[tokio::test]
    async fn handled_mail_is_filed_and_recorded() {
        let mut routing = sample_routing();
        routing.categories.push(CategoryRoute {
            name: "spam".into(),
            mailbox: String::new(),
            description: String::new(),
            keywords: vec![],
            quarantine: true,
        });
        let h = harness_with(
            routing,
            SinkOptions {
                folders: FolderMap {
                    processed: Some("Processed".into()),
                    quarantine: Some("Junk".into()),
                    ..FolderMap::default()
                },
                ..SinkOptions::default()
            },
        );
        h.mailbox.deliver(sample_message(1, "Need help with order", ""));
        h.mailbox.deliver(sample_message(2, "You won the lottery", ""));
        h.mailbox.deliver(sample_message(3, "pricing question", ""));

        cycle(&h, &mut CycleContext::new(Uuid::new_v4())).await.unwrap();

        let entries = entries(&h);
        assert_eq!(entries[0].folder.as_deref(), Some("Processed"));
        assert_eq!(entries[1].matched_rule, MatchedRule::Quarantine);
        assert_eq!(entries[1].final_action, RouteAction::Drop);
        assert_eq!(entries[1].folder.as_deref(), Some("Junk"));
        assert!(entries[2].folder.is_none());
        assert_eq!(h.mailbox.folder("Processed"), vec![1]);
        assert_eq!(h.mailbox.folder("Junk"), vec![2]);
        assert_eq!(h.mailbox.read_uids(), vec![3]);
        assert_eq!(h.outbound.sent().len(), 2);
    }

    #[tokio::test]
    async fn ack_failure_records_entry_then_fails_cycle() {
        let h = harness();
        h.mailbox.deliver(sample_message(1, "Need help with order", ""));
        h.mailbox.deliver(sample_message(2, "pricing", ""));
        h.mailbox.fail_next_acks(10);

        let mut ctx = CycleContext::new(Uuid::new_v4());
        let err = cycle(&h, &mut ctx).await.unwrap_err();
        assert!(!err.is_fatal());

        let entries = entries(&h);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].error.as_deref().unwrap_or("").contains("acknowledge"));
        assert!(ctx.has_seen("<msg-1@example.com>"));
        assert_eq!(h.mailbox.opens(), h.mailbox.closes());
    }

    #[tokio::test]
    async fn unreachable_source_is_fatal() {
        let h = harness();
        h.mailbox.set_unreachable(true);
        let err = cycle(&h, &mut CycleContext::new(Uuid::new_v4())).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(entries(&h).is_empty());
    }

    #[tokio::test]
    async fn processed_messages_are_published() {
        let h = harness();
        let mut sub = h.pipeline.events().subscribe();
        h.mailbox.deliver(sample_message(7, "Need help with order", ""));

        let mut seen = Vec::new();
        let mut ctx = CycleContext::new(Uuid::new_v4());
        ctx.cycle = 1;
        h.pipeline
            .run_cycle(&mut ctx, &mut |e| seen.push(e.uid))
            .await
            .unwrap();

        assert_eq!(seen, vec![7]);
        match sub.recv().await.unwrap() {
            ProcessingEvent::MessageProcessed { session_id, entry } => {
                assert_eq!(session_id, ctx.session_id);
                assert_eq!(entry.uid, 7);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
