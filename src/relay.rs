//! Relay pool: subscriptions and publishing across several relays.
//!
//! [`WsRelayPool`] keeps one connection task per relay URL. Each task owns its
//! WebSocket and takes commands over a channel, so callers never wait on the
//! network: subscriptions and publish acknowledgments arrive on their own
//! channels as the relays answer.

use std::{collections::HashMap, sync::Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{
    stream::{self, BoxStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::event::{Event, FOLLOW_LIST_KIND};

/// NIP-01 subscription filter. Unset fields are left out of the JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// Latest follow-list event authored by `identity`.
    pub fn follow_list_of(identity: &str) -> Self {
        Filter {
            authors: Some(vec![identity.to_string()]),
            kinds: Some(vec![FOLLOW_LIST_KIND]),
            limit: Some(1),
        }
    }
}

/// Per-relay outcome of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishSignal {
    /// The relay accepted the event.
    Ok,
    /// The relay already had the event.
    Seen,
    /// The relay rejected the event or the connection failed.
    Failed(String),
}

/// Signals from one relay for one published event. The stream ends once the
/// relay has answered or the connection is gone.
#[derive(Debug)]
pub struct PublishHandle {
    url: String,
    signals: mpsc::UnboundedReceiver<PublishSignal>,
}

impl PublishHandle {
    pub fn channel(url: impl Into<String>) -> (mpsc::UnboundedSender<PublishSignal>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                url: url.into(),
                signals: rx,
            },
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn recv(&mut self) -> Option<PublishSignal> {
        self.signals.recv().await
    }

    /// Signals tagged with the relay URL, for merging handles together.
    pub fn into_stream(self) -> BoxStream<'static, (String, PublishSignal)> {
        let url = self.url;
        stream::unfold(self.signals, |mut rx| async move {
            rx.recv().await.map(|signal| (signal, rx))
        })
        .map(move |signal| (url.clone(), signal))
        .boxed()
    }
}

/// Stream of events matching a subscription filter.
///
/// It ends when every relay has dropped the subscription. Dropping it or
/// calling [`Subscription::unsubscribe`] cancels delivery.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    events: mpsc::UnboundedReceiver<Event>,
    relays: Vec<mpsc::UnboundedSender<Command>>,
}

impl Subscription {
    pub fn channel(id: impl Into<String>) -> (mpsc::UnboundedSender<Event>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                id: id.into(),
                events: rx,
                relays: Vec::new(),
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Stop delivery and send `CLOSE` to every relay serving this subscription.
    pub fn unsubscribe(mut self) {
        self.events.close();
        for relay in self.relays.drain(..) {
            let _ = relay.send(Command::Unsubscribe {
                sub_id: self.id.clone(),
            });
        }
    }
}

/// Multi-relay publish/subscribe client.
#[async_trait]
pub trait RelayPool: Send + Sync {
    async fn subscribe(&self, urls: &[String], filter: Filter) -> Subscription;
    /// Send `event` to every URL; one handle per URL, in the same order.
    async fn publish(&self, urls: &[String], event: &Event) -> Vec<PublishHandle>;
    /// Drop the connections to `urls`. Unknown URLs are ignored.
    async fn close(&self, urls: &[String]);
}

enum Command {
    Subscribe {
        sub_id: String,
        filter: Filter,
        events: mpsc::UnboundedSender<Event>,
    },
    Unsubscribe {
        sub_id: String,
    },
    Publish {
        event: Event,
        signals: mpsc::UnboundedSender<PublishSignal>,
    },
    Close,
}

/// Relay pool speaking NIP-01 over WebSockets, optionally through SOCKS5.
pub struct WsRelayPool {
    tor_socks: Option<String>,
    relays: Mutex<HashMap<String, mpsc::UnboundedSender<Command>>>,
}

impl WsRelayPool {
    pub fn new(tor_socks: Option<String>) -> Self {
        Self {
            tor_socks,
            relays: Mutex::new(HashMap::new()),
        }
    }

    /// Command channel for `url`, spawning a connection task if none is alive.
    fn connection(&self, url: &str) -> mpsc::UnboundedSender<Command> {
        let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = relays.get(url) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(url.to_string(), self.tor_socks.clone(), rx));
        relays.insert(url.to_string(), tx.clone());
        tx
    }
}

#[async_trait]
impl RelayPool for WsRelayPool {
    async fn subscribe(&self, urls: &[String], filter: Filter) -> Subscription {
        let sub_id = hex::encode(rand::random::<[u8; 8]>());
        let (events, mut sub) = Subscription::channel(sub_id.clone());
        for url in urls {
            let cmd = Command::Subscribe {
                sub_id: sub_id.clone(),
                filter: filter.clone(),
                events: events.clone(),
            };
            let relay = self.connection(url);
            if relay.send(cmd).is_err() {
                warn!(%url, "relay connection closed before subscribing");
                continue;
            }
            sub.relays.push(relay);
        }
        sub
    }

    async fn publish(&self, urls: &[String], event: &Event) -> Vec<PublishHandle> {
        urls.iter()
            .map(|url| {
                let (signals, handle) = PublishHandle::channel(url.clone());
                let cmd = Command::Publish {
                    event: event.clone(),
                    signals,
                };
                if let Err(mpsc::error::SendError(Command::Publish { signals, .. })) =
                    self.connection(url).send(cmd)
                {
                    let _ = signals.send(PublishSignal::Failed("relay connection closed".into()));
                }
                handle
            })
            .collect()
    }

    async fn close(&self, urls: &[String]) {
        let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
        for url in urls {
            if let Some(tx) = relays.remove(url) {
                let _ = tx.send(Command::Close);
            }
        }
    }
}

/// Connect to one relay and serve commands until closed. Whatever is still
/// queued when the connection ends is failed or dropped.
async fn run_connection(
    url: String,
    tor_socks: Option<String>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let reason = match connect_ws(&url, tor_socks.as_deref()).await {
        Ok(ws) => {
            debug!(%url, "connected to relay");
            let relay = Connection {
                url: url.clone(),
                ws,
                subs: HashMap::new(),
                pending: HashMap::new(),
            };
            match relay.run(&mut commands).await {
                Ok(()) => "connection closed".to_string(),
                Err(e) => {
                    warn!(%url, "relay connection error: {e}");
                    format!("connection error: {e}")
                }
            }
        }
        Err(e) => {
            warn!(%url, "relay connect failed: {e}");
            format!("connect failed: {e}")
        }
    };
    commands.close();
    while let Some(cmd) = commands.recv().await {
        if let Command::Publish { signals, .. } = cmd {
            let _ = signals.send(PublishSignal::Failed(reason.clone()));
        }
    }
}

type PublishWaiters = HashMap<String, Vec<mpsc::UnboundedSender<PublishSignal>>>;

struct Connection<S> {
    url: String,
    ws: WebSocketStream<S>,
    subs: HashMap<String, mpsc::UnboundedSender<Event>>,
    pending: PublishWaiters,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Result<()> {
        let result = self.serve(commands).await;
        let reason = match &result {
            Ok(()) => "connection closed before acknowledgment".to_string(),
            Err(e) => e.to_string(),
        };
        for (_, waiters) in self.pending.drain() {
            for tx in waiters {
                let _ = tx.send(PublishSignal::Failed(reason.clone()));
            }
        }
        result
    }

    async fn serve(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Result<()> {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Subscribe { sub_id, filter, events }) => {
                        let msg = serde_json::json!(["REQ", sub_id, filter]);
                        self.ws.send(Message::Text(msg.to_string())).await?;
                        self.subs.insert(sub_id, events);
                    }
                    Some(Command::Unsubscribe { sub_id }) => {
                        if self.subs.remove(&sub_id).is_some() {
                            let msg = serde_json::json!(["CLOSE", sub_id]);
                            self.ws.send(Message::Text(msg.to_string())).await?;
                        }
                    }
                    Some(Command::Publish { event, signals }) => {
                        let msg = serde_json::json!(["EVENT", event]);
                        if let Err(e) = self.ws.send(Message::Text(msg.to_string())).await {
                            let _ = signals.send(PublishSignal::Failed(e.to_string()));
                            return Err(e.into());
                        }
                        self.pending.entry(event.id).or_default().push(signals);
                    }
                    Some(Command::Close) | None => {
                        let subs: Vec<String> = self.subs.drain().map(|(id, _)| id).collect();
                        for sub_id in subs {
                            let msg = serde_json::json!(["CLOSE", sub_id]);
                            self.ws.send(Message::Text(msg.to_string())).await?;
                        }
                        self.ws.close(None).await.ok();
                        return Ok(());
                    }
                },
                msg = self.ws.next() => match msg {
                    Some(Ok(Message::Text(txt))) => {
                        if let Some(sub_id) = self.on_text(&txt) {
                            let msg = serde_json::json!(["CLOSE", sub_id]);
                            self.ws.send(Message::Text(msg.to_string())).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    /// Dispatch one relay frame. Returns a subscription id whose consumer has
    /// gone away and should be closed on the relay.
    fn on_text(&mut self, txt: &str) -> Option<String> {
        let val = serde_json::from_str::<Value>(txt).ok()?;
        let arr = val.as_array()?;
        match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") if arr.len() >= 3 => {
                let sub = arr[1].as_str()?;
                let ev = match serde_json::from_value::<Event>(arr[2].clone()) {
                    Ok(ev) => ev,
                    Err(e) => {
                        debug!(url = %self.url, "ignoring malformed event: {e}");
                        return None;
                    }
                };
                if let Some(tx) = self.subs.get(sub) {
                    if tx.send(ev).is_err() {
                        self.subs.remove(sub);
                        return Some(sub.to_string());
                    }
                }
            }
            Some("OK") if arr.len() >= 3 => {
                let id = arr[1].as_str()?;
                let accepted = arr[2].as_bool().unwrap_or(false);
                let message = arr.get(3).and_then(|v| v.as_str()).unwrap_or_default();
                if let Some(waiters) = self.pending.remove(id) {
                    for tx in waiters {
                        if accepted {
                            if message.starts_with("duplicate:") {
                                let _ = tx.send(PublishSignal::Seen);
                            }
                            let _ = tx.send(PublishSignal::Ok);
                        } else {
                            let reason = if message.is_empty() { "rejected" } else { message };
                            let _ = tx.send(PublishSignal::Failed(reason.to_string()));
                        }
                    }
                }
            }
            Some("CLOSED") if arr.len() >= 2 => {
                let sub = arr[1].as_str()?;
                debug!(url = %self.url, sub, "relay closed subscription");
                self.subs.remove(sub);
            }
            Some("EOSE") => debug!(url = %self.url, "end of stored events"),
            Some("NOTICE") => {
                let notice = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default();
                info!(url = %self.url, notice, "relay notice");
            }
            _ => debug!(url = %self.url, "ignoring relay frame"),
        }
        None
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
