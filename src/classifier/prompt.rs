//! Prompt construction shared by the LLM providers.

use crate::classifier::ClassificationResult;
use crate::config::{CategoryRoute, UNKNOWN_CATEGORY};
use crate::mail::message::Message;

/// Characters of body text sent to the model.
pub const BODY_PREVIEW_CHARS: usize = 1200;

/// System prompt listing the closed category set.
pub fn system_prompt(categories: &[CategoryRoute]) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(
        "You are an automated email classification engine.\n\n\
         Output rules:\n\
         - Respond with ONLY a single JSON object, no markdown and no prose.\n\
         - Required fields: {\"category\": \"...\", \"confidence\": 0.0, \"reason\": \"...\"}\n\
         - \"confidence\" is a number between 0.0 and 1.0.\n\
         - \"reason\" is at most 20 words.\n\n\
         Categories:\n",
    );
    for cat in categories {
        prompt.push_str(&format!("- \"{}\"", cat.name.to_lowercase()));
        if !cat.description.trim().is_empty() {
            prompt.push_str(&format!(": {}", cat.description.trim()));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "- \"{UNKNOWN_CATEGORY}\": none of the above fits\n\n\
         Confidence calibration:\n\
         - 0.90-1.00: unmistakably clear\n\
         - 0.75-0.89: strong signals, minor ambiguity\n\
         - 0.60-0.74: several categories possible, best guess\n\
         - below 0.60: genuinely uncertain\n\
         Do not default to a high score; calibrate honestly."
    ));
    prompt
}

/// User prompt for one message, with an optional hint from an earlier provider.
pub fn user_prompt(message: &Message, previous: Option<&ClassificationResult>) -> String {
    let mut prompt = String::with_capacity(BODY_PREVIEW_CHARS + 256);
    prompt.push_str("Classify this email. Output ONLY the JSON object.\n\n");
    prompt.push_str(&format!("From: {}\n", message.from));
    prompt.push_str(&format!("Subject: {}\n", message.subject));
    prompt.push_str("Body:\n");
    let preview: String = message.body.chars().take(BODY_PREVIEW_CHARS).collect();
    prompt.push_str(preview.trim());
    prompt.push('\n');

    if let Some(prev) = previous {
        prompt.push_str(&format!(
            "\nA previous classifier ({}) suggested \"{}\" with confidence {:.2}. \
             Use it as a hint only.\n",
            prev.provider, prev.category, prev.confidence
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_message;

    fn categories() -> Vec<CategoryRoute> {
        vec![
            CategoryRoute {
                name: "Support".into(),
                mailbox: "support@mail.local".into(),
                description: "customer complaints, refunds, bug reports".into(),
                keywords: vec![],
                quarantine: false,
            },
            CategoryRoute {
                name: "sales".into(),
                mailbox: "sales@mail.local".into(),
                description: String::new(),
                keywords: vec![],
                quarantine: false,
            },
        ]
    }

    #[test]
    fn system_prompt_lists_categories_and_unknown() {
        let p = system_prompt(&categories());
        assert!(p.contains("- \"support\": customer complaints"));
        assert!(p.contains("- \"sales\"\n"));
        assert!(p.contains("- \"unknown\""));
        assert!(p.contains("ONLY a single JSON object"));
    }

    #[test]
    fn user_prompt_truncates_body() {
        let msg = sample_message(1, "Long", &"x".repeat(5000));
        let p = user_prompt(&msg, None);
        assert!(p.contains("Subject: Long"));
        assert!(p.contains("From: customer@example.com"));
        assert!(p.matches('x').count() <= BODY_PREVIEW_CHARS + 1);
    }

    #[test]
    fn user_prompt_includes_hint() {
        let msg = sample_message(1, "Hi", "body");
        let prev = ClassificationResult::new("sales", 0.4, "heuristic");
        let p = user_prompt(&msg, Some(&prev));
        assert!(p.contains("\"sales\" with confidence 0.40"));
        assert!(p.contains("heuristic"));
    }
}
