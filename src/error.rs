//! Error types for session handling, signing and follow actions.

use thiserror::Error;

/// Failure reading or writing the session store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Failure reported by a signing capability.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no signing capability available")]
    Unavailable,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("signing failed: {0}")]
    Failed(String),
}

/// Reasons a login or follow/unfollow action is aborted.
///
/// None of these mutate the persisted session or the held follow list.
#[derive(Debug, Error)]
pub enum FollowError {
    #[error("follow list not retrieved from relays yet; wait a few seconds and try again")]
    NotReady,
    #[error("login failed: {0}")]
    LoginFailed(#[source] SignerError),
    #[error("event signing failed: {0}")]
    SigningFailed(#[source] SignerError),
    #[error("signed event rejected: {0}")]
    InvalidSignedEvent(&'static str),
    #[error("no relay acknowledged the event{}", describe_failures(.failures, .timed_out))]
    PublishNeverAcknowledged {
        failures: Vec<String>,
        timed_out: bool,
    },
    #[error("no relays configured for this session")]
    NoRelays,
    #[error("target identity is empty")]
    EmptyTarget,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("encoding relay map: {0}")]
    Encoding(#[from] serde_json::Error),
}

fn describe_failures(failures: &[String], timed_out: &bool) -> String {
    let mut out = String::new();
    if *timed_out {
        out.push_str(" before the timeout");
    }
    if !failures.is_empty() {
        out.push_str(" (");
        out.push_str(&failures.join("; "));
        out.push(')');
    }
    out
}
