//! Slack integration: alert rendering, posting, and request verification

mod blocks;
mod notifier;
mod signature;

pub use blocks::{auto_fix_confirmation, incident_alert, severity_marker};
pub use notifier::{SlackError, SlackNotifier};
pub use signature::{verify, SignatureError};
