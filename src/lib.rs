//! Mail router: watches a mailbox, classifies each message and forwards it
//! to the right department.

pub mod classifier;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod ledger;
pub mod mail;
pub mod retry;
pub mod routing;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod watch;
