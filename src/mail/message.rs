//! Retrieved message model and RFC 822 parsing.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

/// A message fetched from the watched mailbox. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// IMAP UID, unique within one mailbox snapshot.
    pub uid: u32,
    /// Message-ID header, used as the idempotency key.
    pub message_id: String,
    /// Sender address.
    pub from: String,
    /// To recipients.
    pub to: Vec<String>,
    pub subject: String,
    /// Plain-text body (HTML-only mail is tag-stripped).
    pub body: String,
    /// Raw header fields in message order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    /// Size of the raw message in bytes.
    pub size: usize,
    /// Date header, if parseable.
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

impl Message {
    /// Parse raw RFC 822 bytes. Returns `None` if the bytes are not a message.
    pub fn parse(uid: u32, raw: &[u8]) -> Option<Self> {
        let parsed = MessageParser::default().parse(raw)?;

        let headers = parsed
            .headers()
            .iter()
            .map(|h| {
                let value = raw
                    .get(h.offset_start as usize..h.offset_end as usize)
                    .map(|v| String::from_utf8_lossy(v).trim().to_string())
                    .unwrap_or_default();
                (h.name().to_string(), value)
            })
            .collect();

        let message_id = parsed
            .message_id()
            .map(|id| format!("<{}>", id.trim_matches(|c| c == '<' || c == '>')))
            .unwrap_or_else(|| synthetic_message_id(uid));

        let date = parsed.date().and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(d.year as i32, u32::from(d.month), u32::from(d.day))
                .and_then(|date| {
                    date.and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))
                })
                .map(|naive| naive.and_utc())
        });

        Some(Self {
            uid,
            message_id,
            from: extract_addresses(parsed.from())
                .into_iter()
                .next()
                .unwrap_or_else(|| "unknown".to_string()),
            to: extract_addresses(parsed.to()),
            subject: parsed.subject().unwrap_or("(no subject)").to_string(),
            body: extract_text(&parsed),
            headers,
            size: raw.len(),
            date,
        })
    }

    /// First header value with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Lowercased subject and body, the text rules and heuristics match against.
    pub fn searchable_text(&self) -> String {
        format!("{}\n{}", self.subject, self.body).to_lowercase()
    }
}

/// Message-ID for mail that arrived without one.
pub fn synthetic_message_id(uid: u32) -> String {
    format!("<uid-{uid}@mail-router.local>")
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract email addresses from an optional mail_parser Address field.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Readable text of a parsed message: text part, else stripped HTML, else
/// the first textual attachment.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.trim().to_string();
        }
    }
    String::new()
}
