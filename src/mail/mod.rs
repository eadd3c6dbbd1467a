//! Mailbox ingestion and outbound delivery.

pub mod imap;
pub mod message;
pub mod sink;
pub mod source;

pub use imap::ImapSource;
pub use message::Message;
pub use sink::{Delivery, MailSink, Outbound, OutboundMail, Outcome, SinkOptions, SmtpOutbound};
pub use source::{MailSession, MailSource, UnreadMessages};
