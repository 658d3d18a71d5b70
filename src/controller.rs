//! Login and session lifecycle.
//!
//! [`LoginController`] owns the explicit [`SessionState`]: who is signed in,
//! which relays they use and the newest follow-list event seen for them. The
//! follow-list subscription runs as a background task that only ever replaces
//! the held event with a newer delivery.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::FollowError,
    event::{Event, Identity, RelayMap, FOLLOW_LIST_KIND},
    follow_list::followed_identities,
    notify::Notifier,
    relay::{Filter, RelayPool, Subscription},
    session::{SessionStore, PUBLIC_KEY_KEY, RELAYS_KEY},
    signer::Signer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginState {
    #[default]
    LoggedOut,
    LoggingIn,
    LoggedIn,
}

/// In-memory state of the current session.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub status: LoginState,
    pub identity: Option<Identity>,
    pub relays: RelayMap,
    /// Keys of `relays`, kept in step with it.
    pub relay_urls: Vec<String>,
    /// Latest follow-list event delivered by the relays.
    pub follow_list: Option<Event>,
}

impl SessionState {
    fn set_relays(&mut self, relays: RelayMap) {
        self.relay_urls = relays.urls();
        self.relays = relays;
    }
}

struct Shared {
    state: Mutex<SessionState>,
    store: Arc<dyn SessionStore>,
    notifier: Arc<dyn Notifier>,
    follow_list: watch::Sender<Option<Event>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a follow-list event. Returns `false` when it is ignored.
    ///
    /// The held event and the watch channel change together under the state
    /// lock, so a logout cannot be overtaken by a delivery already in progress.
    fn accept_follow_list(&self, event: Event) -> bool {
        let (identities, relays_json) = {
            let mut state = self.lock();
            if event.kind != FOLLOW_LIST_KIND
                || state.identity.as_deref() != Some(event.pubkey.as_str())
            {
                debug!(id = %event.id, "ignoring event that is not our follow list");
                return false;
            }
            if let Some(held) = &state.follow_list {
                if event.created_at < held.created_at || event.id == held.id {
                    debug!(id = %event.id, "ignoring stale follow list");
                    return false;
                }
            }
            let mut relays_json = None;
            if !event.content.trim().is_empty() {
                match RelayMap::from_json(&event.content) {
                    Ok(relays) if !relays.is_empty() => {
                        match relays.to_json() {
                            Ok(json) => relays_json = Some(json),
                            Err(e) => warn!("could not encode relay list: {e}"),
                        }
                        state.set_relays(relays);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("follow list content is not a relay map: {e}"),
                }
            }
            state.follow_list = Some(event.clone());
            let identities = followed_identities(&event);
            debug!(id = %event.id, count = identities.len(), "follow list updated");
            self.follow_list.send_replace(Some(event));
            (identities, relays_json)
        };
        if let Some(json) = relays_json {
            if let Err(e) = self.store.set(RELAYS_KEY, &json) {
                warn!("could not persist relay list: {e}");
            }
        }
        self.notifier.following_changed(&identities);
        true
    }
}

/// Background task feeding subscription deliveries into the session.
struct SubscriptionTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SubscriptionTask {
    fn spawn(shared: Arc<Shared>, mut sub: Subscription) -> Self {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => {
                        sub.unsubscribe();
                        debug!("follow list subscription cancelled");
                        return;
                    }
                    event = sub.next() => match event {
                        Some(event) => {
                            shared.accept_follow_list(event);
                        }
                        None => break,
                    },
                }
            }
            debug!("follow list subscription ended");
        });
        Self { stop, handle }
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Unsubscribe and wait for the task to finish.
    async fn cancel(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!("follow list subscription panicked: {e}");
            }
        }
    }
}

/// Establishes and tears down the signed-in session.
pub struct LoginController {
    shared: Arc<Shared>,
    signer: Arc<dyn Signer>,
    pool: Arc<dyn RelayPool>,
    subscription: Mutex<Option<SubscriptionTask>>,
}

impl LoginController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        signer: Arc<dyn Signer>,
        pool: Arc<dyn RelayPool>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (follow_list, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::default()),
                store,
                notifier,
                follow_list,
            }),
            signer,
            pool,
            subscription: Mutex::new(None),
        }
    }

    pub fn status(&self) -> LoginState {
        self.shared.lock().status
    }

    pub fn identity(&self) -> Option<Identity> {
        self.shared.lock().identity.clone()
    }

    pub fn relay_map(&self) -> RelayMap {
        self.shared.lock().relays.clone()
    }

    pub fn relay_urls(&self) -> Vec<String> {
        self.shared.lock().relay_urls.clone()
    }

    pub fn follow_list(&self) -> Option<Event> {
        self.shared.lock().follow_list.clone()
    }

    pub fn snapshot(&self) -> SessionState {
        self.shared.lock().clone()
    }

    pub(crate) fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    pub(crate) fn pool(&self) -> &Arc<dyn RelayPool> {
        &self.pool
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.shared.notifier
    }

    /// Restore a session from the store without asking the signer.
    pub fn check_login(&self) -> LoginState {
        if self.status() == LoginState::LoggedIn {
            return LoginState::LoggedIn;
        }
        match self.restore() {
            Ok(Some((identity, relays))) => {
                let mut state = self.shared.lock();
                debug!(identity = %identity, "restored session");
                state.identity = Some(identity);
                state.set_relays(relays);
                state.status = LoginState::LoggedIn;
                LoginState::LoggedIn
            }
            Ok(None) => LoginState::LoggedOut,
            Err(e) => {
                warn!("could not restore session: {e}");
                LoginState::LoggedOut
            }
        }
    }

    fn restore(&self) -> Result<Option<(Identity, RelayMap)>, FollowError> {
        let identity = self.shared.store.get(PUBLIC_KEY_KEY)?;
        let relays = self.shared.store.get(RELAYS_KEY)?;
        match (identity, relays) {
            (Some(identity), Some(relays)) if !identity.is_empty() => {
                Ok(Some((identity, RelayMap::from_json(&relays)?)))
            }
            _ => Ok(None),
        }
    }

    /// Ensure a signed-in session, asking the signer if none can be restored.
    pub async fn login(&self) -> Result<LoginState, FollowError> {
        if self.check_login() == LoginState::LoggedIn {
            self.connect().await;
            return Ok(LoginState::LoggedIn);
        }
        self.shared.lock().status = LoginState::LoggingIn;
        match self.request_profile().await {
            Ok((identity, relays)) => {
                {
                    let mut state = self.shared.lock();
                    state.identity = Some(identity.clone());
                    state.set_relays(relays);
                    state.status = LoginState::LoggedIn;
                }
                info!(identity = %identity, "logged in");
                self.connect().await;
                Ok(LoginState::LoggedIn)
            }
            Err(err) => {
                self.shared.lock().status = LoginState::LoggedOut;
                self.shared.notifier.login_failed(&err);
                Err(err)
            }
        }
    }

    async fn request_profile(&self) -> Result<(Identity, RelayMap), FollowError> {
        let identity = self
            .signer
            .get_public_key()
            .await
            .map_err(FollowError::LoginFailed)?;
        let relays = self
            .signer
            .get_relays()
            .await
            .map_err(FollowError::LoginFailed)?;
        self.shared.store.set(PUBLIC_KEY_KEY, &identity)?;
        self.shared.store.set(RELAYS_KEY, &relays.to_json()?)?;
        Ok((identity, relays))
    }

    /// Subscribe to our own follow list unless a subscription is already live.
    pub async fn connect(&self) {
        let (identity, urls) = {
            let state = self.shared.lock();
            match (state.status, &state.identity) {
                (LoginState::LoggedIn, Some(identity)) => {
                    (identity.clone(), state.relay_urls.clone())
                }
                _ => return,
            }
        };
        if self.subscription_alive() {
            return;
        }
        let sub = self
            .pool
            .subscribe(&urls, Filter::follow_list_of(&identity))
            .await;
        let task = SubscriptionTask::spawn(Arc::clone(&self.shared), sub);
        let old = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(old) = old {
            old.cancel().await;
        }
    }

    fn subscription_alive(&self) -> bool {
        let slot = self.subscription.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(SubscriptionTask::is_alive)
    }

    /// Adopt a follow list that a relay has just acknowledged, so the next
    /// action builds on it instead of on the last subscription delivery.
    pub(crate) fn accept_published(&self, event: Event) -> bool {
        self.shared.accept_follow_list(event)
    }

    /// Wait until a follow list has been delivered, up to `timeout`.
    pub async fn wait_for_follow_list(&self, timeout: Duration) -> Option<Event> {
        let mut rx = self.shared.follow_list.subscribe();
        let delivered = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        match delivered {
            Ok(Ok(event)) => (*event).clone(),
            _ => None,
        }
    }

    /// Drop the session. Safe to call when nothing is signed in.
    pub async fn logout(&self) -> Result<(), FollowError> {
        let task = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.cancel().await;
        }
        let urls = {
            let mut state = self.shared.lock();
            let urls = std::mem::take(&mut state.relay_urls);
            *state = SessionState::default();
            self.shared.follow_list.send_replace(None);
            urls
        };
        if !urls.is_empty() {
            self.pool.close(&urls).await;
        }
        self.shared.store.clear()?;
        info!("logged out");
        Ok(())
    }
}
