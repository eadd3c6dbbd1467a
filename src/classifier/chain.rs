//! Ordered provider chain with per-provider timeout and retry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classifier::{
    ClassificationResult, Classifier, CloudClassifier, HeuristicClassifier, OllamaClassifier,
};
use crate::config::{ClassifierConfig, RoutingConfig};
use crate::error::ClassifierError;
use crate::mail::message::Message;
use crate::retry::RetryPolicy;

/// Tries each provider in order; the first success wins.
pub struct FallbackChain {
    providers: Vec<Arc<dyn Classifier>>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl FallbackChain {
    pub fn new(providers: Vec<Arc<dyn Classifier>>, timeout: Duration, retries: u32) -> Self {
        Self {
            providers,
            timeout,
            retry: RetryPolicy::default().with_attempts(retries.saturating_add(1)),
        }
    }

    /// Override the delay between attempts on the same provider.
    pub fn with_backoff(mut self, base_delay: Duration) -> Self {
        self.retry = self.retry.with_base_delay(base_delay).with_jitter(Duration::ZERO);
        self
    }

    /// Build the configured chain: Ollama, then cloud, then the heuristic.
    pub fn from_config(config: &ClassifierConfig, routing: &RoutingConfig) -> Self {
        let mut providers: Vec<Arc<dyn Classifier>> = Vec::new();

        if let Some(ollama) = &config.ollama {
            providers.push(Arc::new(OllamaClassifier::new(
                ollama,
                &routing.categories,
                config.provider_timeout,
            )));
        }
        if let Some(cloud) = &config.cloud {
            match CloudClassifier::new(cloud, &routing.categories, config.provider_timeout) {
                Ok(c) => providers.push(Arc::new(c)),
                Err(e) => warn!(error = %e, "Cloud classifier unavailable, skipping"),
            }
        }
        if config.heuristic {
            providers.push(Arc::new(HeuristicClassifier::new(&routing.categories)));
        }

        info!(
            providers = ?providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            "Classifier chain ready"
        );
        Self::new(providers, config.provider_timeout, config.retries)
            .with_backoff(config.retry_backoff)
    }

    /// Classify a message. Never fails: when every provider errors the
    /// result is `unknown` with zero confidence.
    pub async fn classify(
        &self,
        message: &Message,
        previous: Option<&ClassificationResult>,
    ) -> ClassificationResult {
        for provider in &self.providers {
            match self.attempt(provider.as_ref(), message, previous).await {
                Ok(result) => {
                    debug!(
                        uid = message.uid,
                        provider = provider.name(),
                        category = %result.category,
                        confidence = result.confidence,
                        "Classified"
                    );
                    return result;
                }
                Err(e) => {
                    warn!(uid = message.uid, provider = provider.name(), error = %e, "Provider failed, falling back");
                }
            }
        }
        ClassificationResult::unknown("all providers failed")
    }

    async fn attempt(
        &self,
        provider: &dyn Classifier,
        message: &Message,
        previous: Option<&ClassificationResult>,
    ) -> Result<ClassificationResult, ClassifierError> {
        let mut backoff = self.retry.backoff();
        loop {
            let outcome = match tokio::time::timeout(self.timeout, provider.analyze(message, previous)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClassifierError::Timeout {
                    provider: provider.name().to_string(),
                    timeout: self.timeout,
                }),
            };
            match outcome {
                Ok(result) => return Ok(result),
                // The heuristic gives the same answer every time.
                Err(e @ ClassifierError::NoSignal { .. }) => return Err(e),
                Err(e) => match backoff.next() {
                    Some(delay) => {
                        debug!(provider = provider.name(), error = %e, attempt = backoff.attempt(), "Retrying provider");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::{CategoryRoute, KeywordRule};
    use crate::routing::{MatchedRule, RouteAction, RoutingEngine};
    use crate::testing::sample_message;

    enum Behavior {
        Succeed(&'static str, f32),
        Hang,
        FailTimes(u32, &'static str, f32),
        Malformed,
    }

    struct Scripted {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                behavior,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Classifier for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn analyze(
            &self,
            _message: &Message,
            previous: Option<&ClassificationResult>,
        ) -> Result<ClassificationResult, ClassifierError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Succeed(cat, conf) => {
                    let mut r = ClassificationResult::new(*cat, *conf, self.name);
                    if let Some(p) = previous {
                        r = r.with_rationale(format!("hint {}", p.category));
                    }
                    Ok(r)
                }
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    unreachable!()
                }
                Behavior::FailTimes(times, ..) if n < *times => Err(ClassifierError::Status {
                    provider: self.name.into(),
                    status: 503,
                }),
                Behavior::FailTimes(_, cat, conf) => Ok(ClassificationResult::new(*cat, *conf, self.name)),
                Behavior::Malformed => Err(ClassifierError::Malformed {
                    provider: self.name.into(),
                    reason: "not json".into(),
                }),
            }
        }
    }

    fn chain(providers: Vec<Arc<dyn Classifier>>, retries: u32) -> FallbackChain {
        FallbackChain::new(providers, Duration::from_millis(50), retries)
            .with_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn first_success_wins() {
        let primary = Scripted::new("primary", Behavior::Succeed("support", 0.9));
        let secondary = Scripted::new("secondary", Behavior::Succeed("sales", 0.9));
        let c = chain(vec![primary.clone(), secondary.clone()], 1);

        let r = c.classify(&sample_message(1, "a", "b"), None).await;
        assert_eq!(r.category, "support");
        assert_eq!(r.provider, "primary");
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn falls_through_on_malformed_after_retries() {
        let primary = Scripted::new("primary", Behavior::Malformed);
        let secondary = Scripted::new("secondary", Behavior::Succeed("sales", 0.8));
        let c = chain(vec![primary.clone(), secondary], 1);

        let r = c.classify(&sample_message(1, "a", "b"), None).await;
        assert_eq!(r.provider, "secondary");
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn retry_recovers_transient_failure() {
        let primary = Scripted::new("primary", Behavior::FailTimes(1, "support", 0.8));
        let c = chain(vec![primary.clone()], 1);
        let r = c.classify(&sample_message(1, "a", "b"), None).await;
        assert_eq!(r.category, "support");
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn all_timeouts_yield_unknown_and_review() {
        let primary = Scripted::new("primary", Behavior::Hang);
        let secondary = Scripted::new("secondary", Behavior::Hang);
        let c = chain(vec![primary, secondary], 0);

        let msg = sample_message(1, "Hello there", "nothing specific");
        let r = c.classify(&msg, None).await;
        assert!(r.is_unknown());
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.rationale.as_deref(), Some("all providers failed"));

        let engine = RoutingEngine::new(RoutingConfig {
            rules: vec![KeywordRule {
                id: "hr".into(),
                keywords: vec!["resume".into()],
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
        });
        let d = engine.decide(&msg, &r);
        assert_eq!(d.action, RouteAction::Review);
        assert_eq!(d.target.as_deref(), Some("review@mail.local"));
        assert_eq!(d.matched_rule, MatchedRule::Default);
    }

    #[tokio::test]
    async fn empty_chain_is_unknown() {
        let c = chain(vec![], 1);
        assert!(c.classify(&sample_message(1, "a", "b"), None).await.is_unknown());
    }

    #[tokio::test]
    async fn no_signal_is_not_retried() {
        let heuristic = Arc::new(HeuristicClassifier::new(&[]));
        let c = chain(vec![heuristic], 3);
        let r = c.classify(&sample_message(1, "a", "b"), None).await;
        assert!(r.is_unknown());
    }

    #[tokio::test]
    async fn previous_result_is_passed_as_hint() {
        let primary = Scripted::new("primary", Behavior::Succeed("support", 0.9));
        let c = chain(vec![primary], 0);
        let hint = ClassificationResult::new("sales", 0.4, "heuristic");
        let r = c.classify(&sample_message(1, "a", "b"), Some(&hint)).await;
        assert_eq!(r.rationale.as_deref(), Some("hint sales"));
    }

    #[tokio::test]
    async fn config_builds_heuristic_only_chain() {
        let c = FallbackChain::from_config(&ClassifierConfig::default(), &crate::testing::sample_routing());
        let r = c
            .classify(&sample_message(1, "Order broken", "please help"), None)
            .await;
        assert_eq!(r.provider, "heuristic");
        assert_eq!(r.category, "support");
    }
}
