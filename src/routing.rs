//! Routing decisions.
//!
//! Explicit keyword rules win. Without a rule match, a confident classifier
//! result routes to its category's mailbox, or is dropped when the category
//! is a quarantine category. Everything else goes to review.
//! `decide` has no side effects beyond logging and depends only on its
//! inputs and the configuration the engine was built from.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classifier::ClassificationResult;
use crate::config::{DefaultAction, KeywordRule, RoutingConfig};
use crate::mail::message::Message;

/// What to do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    Forward,
    Review,
    Drop,
}

impl fmt::Display for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Forward => "forward",
            Self::Review => "review",
            Self::Drop => "drop",
        })
    }
}

impl std::str::FromStr for RouteAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Self::Forward),
            "review" => Ok(Self::Review),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Identifiers of the built-in decision steps. Keyword rules may not use them.
pub const BUILTIN_RULE_IDS: [&str; 4] = ["ai-category", "default", "self-sent", "quarantine"];

/// Which step of the decision produced the action.
///
/// Serialized as a bare string: the rule id or one of [`BUILTIN_RULE_IDS`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MatchedRule {
    /// An explicit keyword rule, by id.
    Rule(String),
    /// The classifier's category mapping.
    AiCategory,
    /// No rule and no confident category.
    Default,
    /// The agent's own outgoing mail.
    SelfSent,
    /// A confident match on a quarantine category.
    Quarantine,
}

impl MatchedRule {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Rule(id) => id,
            Self::AiCategory => "ai-category",
            Self::Default => "default",
            Self::SelfSent => "self-sent",
            Self::Quarantine => "quarantine",
        }
    }
}

impl fmt::Display for MatchedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MatchedRule> for String {
    fn from(rule: MatchedRule) -> Self {
        rule.as_str().to_string()
    }
}

impl From<String> for MatchedRule {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ai-category" => Self::AiCategory,
            "default" => Self::Default,
            "self-sent" => Self::SelfSent,
            "quarantine" => Self::Quarantine,
            _ => Self::Rule(s),
        }
    }
}

/// The routing outcome for one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub action: RouteAction,
    /// Destination mailbox; present for forward and review, absent for drop.
    pub target: Option<String>,
    pub matched_rule: MatchedRule,
}

impl RoutingDecision {
    pub fn forward(target: impl Into<String>, matched_rule: MatchedRule) -> Self {
        Self {
            action: RouteAction::Forward,
            target: Some(target.into()),
            matched_rule,
        }
    }

    pub fn review(mailbox: impl Into<String>) -> Self {
        Self {
            action: RouteAction::Review,
            target: Some(mailbox.into()),
            matched_rule: MatchedRule::Default,
        }
    }

    pub fn dropped(matched_rule: MatchedRule) -> Self {
        Self {
            action: RouteAction::Drop,
            target: None,
            matched_rule,
        }
    }
}

/// A keyword rule with its matchers lowercased once.
#[derive(Debug, Clone)]
struct CompiledRule {
    id: String,
    keywords: Vec<String>,
    target: String,
    from: Option<String>,
}

impl CompiledRule {
    fn new(rule: &KeywordRule) -> Self {
        Self {
            id: rule.id.clone(),
            keywords: rule
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            target: rule.target.clone(),
            from: rule
                .from
                .as_deref()
                .map(|f| f.trim().to_lowercase())
                .filter(|f| !f.is_empty()),
        }
    }

    fn matches(&self, sender: &str, text: &str) -> bool {
        if let Some(from) = &self.from
            && !sender.contains(from.as_str())
        {
            return false;
        }
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

/// Decides where each message goes.
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    config: RoutingConfig,
    rules: Vec<CompiledRule>,
}

impl RoutingEngine {
    pub fn new(config: RoutingConfig) -> Self {
        let rules = config.rules.iter().map(CompiledRule::new).collect();
        Self { config, rules }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Decide the route for a classified message.
    pub fn decide(&self, message: &Message, result: &ClassificationResult) -> RoutingDecision {
        let text = message.searchable_text();
        let sender = message.from.to_lowercase();

        if let Some(rule) = self.rules.iter().find(|r| r.matches(&sender, &text)) {
            debug!(uid = message.uid, rule = %rule.id, target = %rule.target, "Keyword rule matched");
            return RoutingDecision::forward(&rule.target, MatchedRule::Rule(rule.id.clone()));
        }

        let confident = !result.is_unknown() && result.confidence >= self.config.review_threshold;
        if confident && self.config.is_quarantine(&result.category) {
            debug!(uid = message.uid, category = %result.category, "Quarantining message");
            return RoutingDecision::dropped(MatchedRule::Quarantine);
        }

        if self.config.default_action == DefaultAction::Forward
            && confident
            && let Some(mailbox) = self.config.mailbox_for(&result.category)
        {
            debug!(
                uid = message.uid,
                category = %result.category,
                confidence = result.confidence,
                "Routing on classifier category"
            );
            return RoutingDecision::forward(mailbox, MatchedRule::AiCategory);
        }

        match self.config.review_mailbox.as_deref().map(str::trim) {
            Some(mailbox) if !mailbox.is_empty() => RoutingDecision::review(mailbox),
            _ => {
                warn!(uid = message.uid, "No review mailbox configured, dropping message");
                RoutingDecision::dropped(MatchedRule::Default)
            }
        }
    }
}
