//! Follow and unfollow actions.
//!
//! An action signs a full replacement follow list and publishes it to every
//! session relay. It finishes on the first relay acknowledgment; the other
//! relays' answers are only logged.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures_util::{stream::select_all, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    controller::LoginController,
    error::FollowError,
    event::{validate_event, verify_signature, EventDraft, Identity},
    follow_list::{compute_add_tags, compute_remove_tags},
    relay::{PublishHandle, PublishSignal},
};

/// Default wait for the first relay acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowAction {
    Follow,
    Unfollow,
}

/// Result of an acknowledged action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub target: Identity,
    /// Whether the target is followed after the action.
    pub following: bool,
    pub event_id: String,
    /// Relay whose acknowledgment completed the action.
    pub acknowledged_by: String,
}

/// Runs follow/unfollow actions for one session, one at a time.
pub struct FollowHandler {
    controller: Arc<LoginController>,
    ack_timeout: Duration,
    in_flight: Mutex<()>,
}

impl FollowHandler {
    pub fn new(controller: Arc<LoginController>, ack_timeout: Duration) -> Self {
        Self {
            controller,
            ack_timeout,
            in_flight: Mutex::new(()),
        }
    }

    pub async fn perform_follow(&self, target: &str) -> Result<ActionOutcome, FollowError> {
        self.perform(FollowAction::Follow, target).await
    }

    pub async fn perform_unfollow(&self, target: &str) -> Result<ActionOutcome, FollowError> {
        self.perform(FollowAction::Unfollow, target).await
    }

    pub async fn perform(
        &self,
        action: FollowAction,
        target: &str,
    ) -> Result<ActionOutcome, FollowError> {
        let result = self.run(action, target).await;
        let notifier = self.controller.notifier();
        match &result {
            Ok(outcome) if outcome.following => notifier.followed(target),
            Ok(_) => notifier.unfollowed(target),
            Err(FollowError::NotReady) => notifier.not_ready(),
            // The controller has already reported it.
            Err(FollowError::LoginFailed(_)) => {}
            Err(err) => notifier.action_failed(target, err),
        }
        result
    }

    async fn run(&self, action: FollowAction, target: &str) -> Result<ActionOutcome, FollowError> {
        if target.is_empty() {
            return Err(FollowError::EmptyTarget);
        }
        let _guard = self.in_flight.lock().await;

        self.controller.login().await?;
        let identity = self.controller.identity().ok_or(FollowError::NotReady)?;

        let current = self.controller.follow_list();
        let tags = match action {
            FollowAction::Follow => compute_add_tags(current.as_ref(), target)?,
            FollowAction::Unfollow => compute_remove_tags(current.as_ref(), target)?,
        };

        let relays = self.controller.relay_map();
        let urls = relays.urls();
        if urls.is_empty() {
            return Err(FollowError::NoRelays);
        }
        let draft = EventDraft::follow_list(tags, &relays, unix_now())?;

        let signed = self
            .controller
            .signer()
            .sign_event(draft)
            .await
            .map_err(FollowError::SigningFailed)?;
        if !validate_event(&signed) {
            return Err(FollowError::InvalidSignedEvent("malformed event"));
        }
        if !verify_signature(&signed) {
            return Err(FollowError::InvalidSignedEvent("signature does not match"));
        }
        if signed.pubkey != identity {
            return Err(FollowError::InvalidSignedEvent("signed by a different identity"));
        }

        debug!(id = %signed.id, relays = urls.len(), "publishing follow list");
        let handles = self.controller.pool().publish(&urls, &signed).await;
        let acknowledged_by = first_ack(handles, self.ack_timeout).await?;
        info!(
            target_identity = target,
            relay = %acknowledged_by,
            "follow list accepted"
        );
        let event_id = signed.id.clone();
        // Still under the action lock: the next action starts from this list.
        self.controller.accept_published(signed);
        Ok(ActionOutcome {
            target: target.to_string(),
            following: action == FollowAction::Follow,
            event_id,
            acknowledged_by,
        })
    }
}

/// Wait for the first relay to accept a publish and return its URL.
///
/// `Seen` and `Failed` signals never complete the wait. Once one relay has
/// accepted, the remaining signals are drained in the background and logged.
/// Fails when every handle has closed without an acceptance, or after
/// `timeout`.
pub async fn first_ack(
    handles: Vec<PublishHandle>,
    timeout: Duration,
) -> Result<String, FollowError> {
    let mut signals = select_all(handles.into_iter().map(PublishHandle::into_stream));
    let mut failures = Vec::new();
    let wait = async {
        while let Some((url, signal)) = signals.next().await {
            match signal {
                PublishSignal::Ok => return Some(url),
                PublishSignal::Seen => debug!(relay = %url, "relay has seen the event"),
                PublishSignal::Failed(reason) => {
                    warn!(relay = %url, "failed to publish: {reason}");
                    failures.push(format!("{url}: {reason}"));
                }
            }
        }
        None
    };
    let outcome = tokio::time::timeout(timeout, wait).await;
    match outcome {
        Ok(Some(url)) => {
            tokio::spawn(async move {
                while let Some((url, signal)) = signals.next().await {
                    debug!(relay = %url, ?signal, "late publish signal");
                }
            });
            Ok(url)
        }
        Ok(None) => Err(FollowError::PublishNeverAcknowledged {
            failures,
            timed_out: false,
        }),
        Err(_) => Err(FollowError::PublishNeverAcknowledged {
            failures,
            timed_out: true,
        }),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
