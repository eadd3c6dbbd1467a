//! Primary provider: a local model served by Ollama.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::parse::parse_classification;
use crate::classifier::prompt::{system_prompt, user_prompt};
use crate::classifier::{ClassificationResult, Classifier};
use crate::config::{CategoryRoute, OllamaConfig};
use crate::error::ClassifierError;
use crate::mail::message::Message;

const PROVIDER: &str = "ollama";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    think: bool,
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Classifies through Ollama's `/api/generate` endpoint.
pub struct OllamaClassifier {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    system: String,
    categories: Vec<String>,
    timeout: Duration,
}

impl OllamaClassifier {
    pub fn new(config: &OllamaConfig, categories: &[CategoryRoute], timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: format!("{}/api/generate", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            system: system_prompt(categories),
            categories: categories.iter().map(|c| c.name.to_lowercase()).collect(),
            timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Classifier for OllamaClassifier {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn analyze(
        &self,
        message: &Message,
        previous: Option<&ClassificationResult>,
    ) -> Result<ClassificationResult, ClassifierError> {
        let started = Instant::now();
        let prompt = user_prompt(message, previous);
        let body = GenerateRequest {
            model: &self.model,
            system: &self.system,
            prompt: &prompt,
            stream: false,
            think: false,
            format: "json",
            options: GenerateOptions {
                temperature: 0.0,
                num_predict: 256,
            },
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClassifierError::Status {
                provider: PROVIDER.into(),
                status: status.as_u16(),
            });
        }

        let parsed: GenerateResponse = resp.json().await.map_err(|e| ClassifierError::Malformed {
            provider: PROVIDER.into(),
            reason: format!("invalid Ollama envelope: {e}"),
        })?;
        debug!(uid = message.uid, model = %self.model, chars = parsed.response.len(), "Ollama responded");

        Ok(parse_classification(&parsed.response, &self.categories, PROVIDER)?
            .with_latency(started.elapsed()))
    }
}

fn request_error(e: reqwest::Error, timeout: Duration) -> ClassifierError {
    if e.is_timeout() {
        ClassifierError::Timeout {
            provider: PROVIDER.into(),
            timeout,
        }
    } else {
        ClassifierError::Request {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        }
    }
}
