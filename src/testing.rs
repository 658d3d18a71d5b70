//! Scriptable signer, relay pool and notifier for unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::{FollowError, SignerError},
    event::{Event, EventDraft, Identity, RelayMap, Tag},
    notify::Notifier,
    relay::{Filter, PublishHandle, PublishSignal, RelayPool, Subscription},
    signer::{KeySigner, Signer},
};

pub struct MockSigner {
    keys: KeySigner,
    fail_login: bool,
    fail_sign: bool,
    corrupt_sig: bool,
    pub profile_calls: AtomicUsize,
    pub sign_calls: AtomicUsize,
}

impl MockSigner {
    pub fn new() -> Self {
        let relays = RelayMap::from_urls(["wss://one", "wss://two"]);
        Self {
            keys: KeySigner::from_hex(&"01".repeat(32), relays).unwrap(),
            fail_login: false,
            fail_sign: false,
            corrupt_sig: false,
            profile_calls: AtomicUsize::new(0),
            sign_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_login(mut self) -> Self {
        self.fail_login = true;
        self
    }

    pub fn failing_sign(mut self) -> Self {
        self.fail_sign = true;
        self
    }

    pub fn corrupting_signatures(mut self) -> Self {
        self.corrupt_sig = true;
        self
    }

    pub fn public_key(&self) -> Identity {
        self.keys.public_key_hex()
    }

    /// Sign without counting or failing, for building relay deliveries.
    pub async fn sign_quietly(&self, draft: EventDraft) -> Event {
        self.keys.sign_event(draft).await.unwrap()
    }
}

#[async_trait]
impl Signer for MockSigner {
    async fn get_public_key(&self) -> Result<Identity, SignerError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_login {
            return Err(SignerError::Rejected("user denied access".into()));
        }
        self.keys.get_public_key().await
    }

    async fn get_relays(&self) -> Result<RelayMap, SignerError> {
        self.keys.get_relays().await
    }

    async fn sign_event(&self, draft: EventDraft) -> Result<Event, SignerError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sign {
            return Err(SignerError::Rejected("user rejected signature".into()));
        }
        let mut ev = self.keys.sign_event(draft).await?;
        if self.corrupt_sig {
            let flipped = if ev.sig.starts_with("00") { "01" } else { "00" };
            ev.sig.replace_range(0..2, flipped);
        }
        Ok(ev)
    }
}

/// Follow-list event signed by `signer`'s key, as a relay would deliver it.
pub async fn follow_list_event(signer: &MockSigner, tags: Vec<Tag>, created_at: u64) -> Event {
    let draft = EventDraft {
        kind: crate::event::FOLLOW_LIST_KIND,
        created_at,
        tags,
        content: String::new(),
    };
    signer.sign_quietly(draft).await
}

/// Relay pool that records calls and answers publishes from a script.
///
/// URLs with a script get those signals and then close; URLs without one
/// never answer.
#[derive(Default)]
pub struct MockPool {
    script: Mutex<HashMap<String, Vec<PublishSignal>>>,
    subscriptions: Mutex<Vec<(Vec<String>, Filter, mpsc::UnboundedSender<Event>)>>,
    published: Mutex<Vec<(Vec<String>, Event)>>,
    closed: Mutex<Vec<Vec<String>>>,
    silent: Mutex<Vec<mpsc::UnboundedSender<PublishSignal>>>,
}

impl MockPool {
    pub fn scripted(script: Vec<(&str, Vec<PublishSignal>)>) -> Self {
        let pool = MockPool::default();
        *pool.script.lock().unwrap() = script
            .into_iter()
            .map(|(url, signals)| (url.to_string(), signals))
            .collect();
        pool
    }

    /// Push `event` to every open subscription.
    pub fn deliver(&self, event: Event) {
        for (_, _, tx) in self.subscriptions.lock().unwrap().iter() {
            let _ = tx.send(event.clone());
        }
    }

    pub fn subscription_requests(&self) -> Vec<(Vec<String>, Filter)> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(urls, filter, _)| (urls.clone(), filter.clone()))
            .collect()
    }

    /// Subscriptions whose consumer is still listening.
    pub fn open_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, tx)| !tx.is_closed())
            .count()
    }

    pub fn published(&self) -> Vec<(Vec<String>, Event)> {
        self.published.lock().unwrap().clone()
    }

    pub fn closed_urls(&self) -> Vec<Vec<String>> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayPool for MockPool {
    async fn subscribe(&self, urls: &[String], filter: Filter) -> Subscription {
        let (tx, sub) = Subscription::channel("mock");
        self.subscriptions
            .lock()
            .unwrap()
            .push((urls.to_vec(), filter, tx));
        sub
    }

    async fn publish(&self, urls: &[String], event: &Event) -> Vec<PublishHandle> {
        self.published
            .lock()
            .unwrap()
            .push((urls.to_vec(), event.clone()));
        let script = self.script.lock().unwrap();
        urls.iter()
            .map(|url| {
                let (tx, handle) = PublishHandle::channel(url.clone());
                match script.get(url) {
                    Some(signals) => {
                        for signal in signals {
                            tx.send(signal.clone()).unwrap();
                        }
                    }
                    None => self.silent.lock().unwrap().push(tx),
                }
                handle
            })
            .collect()
    }

    async fn close(&self, urls: &[String]) {
        self.closed.lock().unwrap().push(urls.to_vec());
    }
}

/// Notifier that records each call as a short string.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn followed(&self, target: &str) {
        self.record(format!("followed:{target}"));
    }

    fn unfollowed(&self, target: &str) {
        self.record(format!("unfollowed:{target}"));
    }

    fn not_ready(&self) {
        self.record("not_ready".into());
    }

    fn login_failed(&self, err: &FollowError) {
        self.record(format!("login_failed:{err}"));
    }

    fn action_failed(&self, target: &str, err: &FollowError) {
        self.record(format!("action_failed:{target}:{err}"));
    }

    fn following_changed(&self, identities: &[Identity]) {
        self.record(format!("following_changed:{}", identities.len()));
    }
}
