//! Watch loop: session state, the per-cycle pipeline and its controller.

pub mod controller;
pub mod pipeline;
pub mod session;

use std::sync::Arc;

pub use controller::WatchController;
pub use pipeline::{CycleContext, CycleReport, Pipeline};
pub use session::{SessionTotals, StopSignal, WatchSession, WatchSnapshot, WatchStatus};

use crate::classifier::FallbackChain;
use crate::config::AppConfig;
use crate::error::ConfigError;
use crate::events::EventBus;
use crate::ledger::ProcessingLedger;
use crate::mail::{ImapSource, MailSink, SinkOptions, SmtpOutbound};
use crate::retry::RetryPolicy;
use crate::routing::RoutingEngine;

/// Wire the IMAP source, classifier chain, SMTP sink and ledger into a
/// controller.
pub fn from_config(config: &AppConfig, events: EventBus) -> Result<WatchController, ConfigError> {
    let retry = RetryPolicy::default().with_attempts(config.watch.io_attempts.max(1));

    let outbound = SmtpOutbound::new(&config.mailbox)?;
    let sink = MailSink::new(
        Arc::new(outbound),
        config.mailbox.address.clone(),
        SinkOptions {
            deliver_reviews: config.watch.deliver_reviews,
            ack_failed: config.watch.ack_failed,
            retry,
            folders: config.mailbox.folders.clone(),
            ..SinkOptions::default()
        },
    );

    let pipeline = Pipeline::new(
        Arc::new(ImapSource::new(config.mailbox.clone())),
        Arc::new(FallbackChain::from_config(&config.classifier, &config.routing)),
        Arc::new(RoutingEngine::new(config.routing.clone())),
        Arc::new(sink),
        Arc::new(ProcessingLedger::new(config.watch.ledger_path.clone())),
        events,
    )
    .with_io_retry(retry);

    Ok(WatchController::new(pipeline, config.watch.clone()))
}
