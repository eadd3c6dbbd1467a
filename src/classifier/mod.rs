//! Message classification.
//!
//! Providers implement [`Classifier`]: a local Ollama model, a cloud model via
//! rig-core, and a keyword heuristic. [`FallbackChain`] tries them in order
//! and never fails; when nothing answers it reports `unknown` at zero
//! confidence and routing sends the message to review.

pub mod chain;
pub mod cloud;
pub mod heuristic;
pub mod ollama;
pub mod parse;
pub mod prompt;

pub use chain::FallbackChain;
pub use cloud::CloudClassifier;
pub use heuristic::HeuristicClassifier;
pub use ollama::OllamaClassifier;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::UNKNOWN_CATEGORY;
use crate::error::ClassifierError;
use crate::mail::message::Message;

/// Outcome of classifying one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Lowercased category name, or `unknown`.
    pub category: String,
    /// Always within `[0, 1]`.
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Provider that produced the result.
    pub provider: String,
    #[serde(skip)]
    pub latency: Duration,
}

impl ClassificationResult {
    /// Build a result. Confidence is clamped to `[0, 1]`; NaN becomes 0.
    pub fn new(category: impl Into<String>, confidence: f32, provider: impl Into<String>) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            category: category.into().trim().to_lowercase(),
            confidence,
            rationale: None,
            provider: provider.into(),
            latency: Duration::ZERO,
        }
    }

    /// The "could not classify" result.
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::new(UNKNOWN_CATEGORY, 0.0, "none").with_rationale(reason)
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        let rationale = rationale.into();
        self.rationale = (!rationale.trim().is_empty()).then_some(rationale);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn is_unknown(&self) -> bool {
        self.category == UNKNOWN_CATEGORY
    }
}

/// A classification provider.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Short provider name used in logs and ledger entries.
    fn name(&self) -> &str;

    /// Classify a message. `previous` is the result of an earlier provider
    /// in the chain, offered as a hint.
    async fn analyze(
        &self,
        message: &Message,
        previous: Option<&ClassificationResult>,
    ) -> Result<ClassificationResult, ClassifierError>;
}
