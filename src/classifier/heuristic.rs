//! Keyword-count heuristic, the last provider in the chain.
//!
//! Needs no network and never blocks, but its confidence is capped so that
//! on its own it rarely clears the review threshold.

use std::time::Instant;

use async_trait::async_trait;

use crate::classifier::{ClassificationResult, Classifier};
use crate::config::CategoryRoute;
use crate::error::ClassifierError;
use crate::mail::message::Message;

const PROVIDER: &str = "heuristic";
const BASE_CONFIDENCE: f32 = 0.4;
const PER_HIT: f32 = 0.1;
const MAX_CONFIDENCE: f32 = 0.65;

/// Scores categories by case-insensitive keyword hits in subject and body.
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    categories: Vec<(String, Vec<String>)>,
}

impl HeuristicClassifier {
    pub fn new(categories: &[CategoryRoute]) -> Self {
        Self {
            categories: categories
                .iter()
                .map(|c| {
                    let keywords = c
                        .keywords
                        .iter()
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .collect();
                    (c.name.to_lowercase(), keywords)
                })
                .collect(),
        }
    }

    /// Best category and its hit count. Ties go to the earlier category.
    fn best_match(&self, text: &str) -> Option<(&str, usize)> {
        let mut best: Option<(&str, usize)> = None;
        for (name, keywords) in &self.categories {
            let hits = keywords.iter().filter(|k| text.contains(k.as_str())).count();
            if hits > 0 && best.is_none_or(|(_, n)| hits > n) {
                best = Some((name.as_str(), hits));
            }
        }
        best
    }
}

/// Confidence for a number of keyword hits.
pub fn heuristic_confidence(hits: usize) -> f32 {
    (BASE_CONFIDENCE + PER_HIT * hits as f32).min(MAX_CONFIDENCE)
}

#[async_trait]
impl Classifier for HeuristicClassifier {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn analyze(
        &self,
        message: &Message,
        _previous: Option<&ClassificationResult>,
    ) -> Result<ClassificationResult, ClassifierError> {
        let started = Instant::now();
        let text = message.searchable_text();
        let (category, hits) = self
            .best_match(&text)
            .ok_or_else(|| ClassifierError::NoSignal {
                provider: PROVIDER.into(),
            })?;
        Ok(
            ClassificationResult::new(category, heuristic_confidence(hits), PROVIDER)
                .with_rationale(format!("{hits} keyword hit(s)"))
                .with_latency(started.elapsed()),
        )
    }
}
