//! Secondary provider: a hosted model reached through rig-core.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::{anthropic, openai};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::classifier::parse::parse_classification;
use crate::classifier::prompt::{system_prompt, user_prompt};
use crate::classifier::{ClassificationResult, Classifier};
use crate::config::{CategoryRoute, CloudBackend, CloudConfig};
use crate::error::ClassifierError;
use crate::mail::message::Message;

const MAX_TOKENS: u64 = 512;

enum CloudClient {
    Anthropic(rig::client::Client<anthropic::client::AnthropicExt>),
    OpenAi(rig::client::Client<openai::client::OpenAIResponsesExt>),
}

/// Classifies with Anthropic or OpenAI models.
pub struct CloudClassifier {
    client: CloudClient,
    provider: &'static str,
    model: String,
    system: String,
    categories: Vec<String>,
    timeout: Duration,
}

impl CloudClassifier {
    pub fn new(
        config: &CloudConfig,
        categories: &[CategoryRoute],
        timeout: Duration,
    ) -> Result<Self, ClassifierError> {
        let (client, provider) = match config.backend {
            CloudBackend::Anthropic => {
                let client: rig::client::Client<anthropic::client::AnthropicExt> =
                    anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
                        ClassifierError::Request {
                            provider: "anthropic".into(),
                            reason: format!("Failed to create Anthropic client: {e}"),
                        }
                    })?;
                (CloudClient::Anthropic(client), "anthropic")
            }
            CloudBackend::OpenAi => {
                let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                    openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
                        ClassifierError::Request {
                            provider: "openai".into(),
                            reason: format!("Failed to create OpenAI client: {e}"),
                        }
                    })?;
                (CloudClient::OpenAi(client), "openai")
            }
        };
        tracing::info!("Cloud classifier using {provider} (model: {})", config.model);

        Ok(Self {
            client,
            provider,
            model: config.model.clone(),
            system: system_prompt(categories),
            categories: categories.iter().map(|c| c.name.to_lowercase()).collect(),
            timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, user: String) -> Result<String, String> {
        let reply = match &self.client {
            CloudClient::Anthropic(c) => {
                c.agent(&self.model)
                    .preamble(&self.system)
                    .temperature(0.0)
                    .max_tokens(MAX_TOKENS)
                    .build()
                    .prompt(user)
                    .await
            }
            CloudClient::OpenAi(c) => {
                c.agent(&self.model)
                    .preamble(&self.system)
                    .temperature(0.0)
                    .max_tokens(MAX_TOKENS)
                    .build()
                    .prompt(user)
                    .await
            }
        };
        reply.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Classifier for CloudClassifier {
    fn name(&self) -> &str {
        self.provider
    }

    async fn analyze(
        &self,
        message: &Message,
        previous: Option<&ClassificationResult>,
    ) -> Result<ClassificationResult, ClassifierError> {
        let started = Instant::now();
        let user = user_prompt(message, previous);

        let raw = tokio::time::timeout(self.timeout, self.complete(user))
            .await
            .map_err(|_| ClassifierError::Timeout {
                provider: self.provider.into(),
                timeout: self.timeout,
            })?
            .map_err(|reason| ClassifierError::Request {
                provider: self.provider.into(),
                reason,
            })?;
        debug!(uid = message.uid, provider = self.provider, chars = raw.len(), "Cloud model responded");

        Ok(parse_classification(&raw, &self.categories, self.provider)?
            .with_latency(started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn config(backend: CloudBackend) -> CloudConfig {
        CloudConfig {
            backend,
            api_key: SecretString::from("test-key"),
            model: "test-model".into(),
        }
    }

    #[test]
    fn builds_for_each_backend() {
        let cats = vec![CategoryRoute {
            name: "Support".into(),
            mailbox: "support@mail.local".into(),
            description: String::new(),
            keywords: vec![],
            quarantine: false,
        }];

        let a = CloudClassifier::new(&config(CloudBackend::Anthropic), &cats, Duration::from_secs(1))
            .unwrap();
        assert_eq!(a.name(), "anthropic");
        assert_eq!(a.model(), "test-model");
        assert_eq!(a.categories, vec!["support".to_string()]);

        let o = CloudClassifier::new(&config(CloudBackend::OpenAi), &cats, Duration::from_secs(1))
            .unwrap();
        assert_eq!(o.name(), "openai");
    }
}
