//! User-facing notifications.
//!
//! The core only says what happened; rendering (dialogs, button states) is up
//! to whichever front-end implements [`Notifier`].

use tracing::{info, warn};

use crate::{error::FollowError, event::Identity};

pub trait Notifier: Send + Sync {
    /// A follow was acknowledged by at least one relay.
    fn followed(&self, target: &str);
    /// An unfollow was acknowledged by at least one relay.
    fn unfollowed(&self, target: &str);
    /// No baseline follow list yet; the user should retry shortly.
    fn not_ready(&self);
    fn login_failed(&self, err: &FollowError);
    fn action_failed(&self, target: &str, err: &FollowError);
    /// A newer follow list arrived from the relays.
    fn following_changed(&self, _identities: &[Identity]) {}
}

/// Notifier that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn followed(&self, target: &str) {
        info!(target_identity = target, "contact list updated; now following");
    }

    fn unfollowed(&self, target: &str) {
        info!(target_identity = target, "contact list updated; no longer following");
    }

    fn not_ready(&self) {
        warn!("waiting for relays to return your contact list; try again in a few seconds");
    }

    fn login_failed(&self, err: &FollowError) {
        warn!("could not read your public profile from the signer: {err}");
    }

    fn action_failed(&self, target: &str, err: &FollowError) {
        warn!(target_identity = target, "contact list update failed: {err}");
    }

    fn following_changed(&self, identities: &[Identity]) {
        info!(count = identities.len(), "contact list synchronized");
    }
}
