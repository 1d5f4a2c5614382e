//! WebSocket transports: the session push socket and the change-feed.
//!
//! Both keep reconnecting with bounded exponential backoff until dropped and
//! publish their connection state on the bus. The push socket replays its
//! joined conversations after every reconnect; the feed resumes from the
//! last sequence number it delivered.

use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ConversationId, TransportTag, UserId},
    protocol::{
        ClientRequest, FeedEnvelope, MessagePayload, ServerEvent, StatusChangePayload,
    },
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::ClientError,
    transport::{BusHub, LifecycleEvent, MessageBus, PushChannel, TypingSignal},
};

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
        }
    }
}

/// Maps an `http(s)://` server url to the socket url for `path`.
pub fn socket_url(
    server_url: &str,
    path: &str,
    query: &[(&str, String)],
) -> Result<Url, ClientError> {
    let mut url = Url::parse(server_url).map_err(|err| {
        ClientError::TransportUnavailable(format!("invalid server url {server_url}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ClientError::TransportUnavailable(format!(
                "server url must be http(s), got {other}"
            )))
        }
    };
    if url.set_scheme(scheme).is_err() {
        return Err(ClientError::TransportUnavailable(format!(
            "cannot derive socket url from {server_url}"
        )));
    }
    let joined = format!("{}/{}", url.path().trim_end_matches('/'), path.trim_start_matches('/'));
    url.set_path(&joined);
    url.set_query(None);
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

fn decode_event(tag: TransportTag, text: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(transport = tag.as_str(), %err, "invalid server event");
            None
        }
    }
}

/// Channel A.
pub struct WsPushChannel {
    hub: Arc<BusHub>,
    outbound: mpsc::UnboundedSender<ClientRequest>,
    joined: Arc<Mutex<HashSet<ConversationId>>>,
    task: JoinHandle<()>,
}

impl WsPushChannel {
    pub fn connect(
        server_url: &str,
        user_id: UserId,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>, ClientError> {
        let url = socket_url(server_url, "ws", &[("user_id", user_id.0.to_string())])?;
        let hub = Arc::new(BusHub::new(TransportTag::Push, BUS_CAPACITY));
        let joined = Arc::new(Mutex::new(HashSet::new()));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_push(
            url,
            Arc::clone(&hub),
            Arc::clone(&joined),
            outbound_rx,
            policy,
        ));
        Ok(Arc::new(Self {
            hub,
            outbound,
            joined,
            task,
        }))
    }

    fn request(&self, request: ClientRequest) -> Result<(), ClientError> {
        self.outbound
            .send(request)
            .map_err(|_| ClientError::TransportUnavailable("push channel closed".to_string()))
    }
}

impl Drop for WsPushChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MessageBus for WsPushChannel {
    fn tag(&self) -> TransportTag {
        self.hub.tag()
    }

    fn on_message(&self) -> broadcast::Receiver<MessagePayload> {
        self.hub.on_message()
    }

    fn on_status_change(&self) -> broadcast::Receiver<StatusChangePayload> {
        self.hub.on_status_change()
    }

    fn on_typing(&self) -> broadcast::Receiver<TypingSignal> {
        self.hub.on_typing()
    }

    fn on_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.hub.on_lifecycle()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.hub.connectivity()
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn join(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.joined.lock().await.insert(conversation_id);
        // Replayed on the next connect when offline.
        if self.hub.is_connected() {
            self.request(ClientRequest::JoinConversation { conversation_id })?;
        }
        Ok(())
    }

    async fn leave(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.joined.lock().await.remove(&conversation_id);
        if self.hub.is_connected() {
            self.request(ClientRequest::LeaveConversation { conversation_id })?;
        }
        Ok(())
    }

    async fn send_typing(
        &self,
        conversation_id: ConversationId,
        receiver_id: UserId,
        is_typing: bool,
    ) -> Result<(), ClientError> {
        if !self.hub.is_connected() {
            return Err(ClientError::TransportUnavailable(
                "push channel disconnected".to_string(),
            ));
        }
        self.request(ClientRequest::Typing {
            conversation_id,
            receiver_id,
            is_typing,
        })
    }
}

async fn run_push(
    url: Url,
    hub: Arc<BusHub>,
    joined: Arc<Mutex<HashSet<ConversationId>>>,
    mut outbound: mpsc::UnboundedReceiver<ClientRequest>,
    policy: ReconnectPolicy,
) {
    let mut attempt = 0u32;
    loop {
        // Requests queued while offline are stale; joins are replayed below.
        while outbound.try_recv().is_ok() {}

        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                attempt = 0;
                let (mut writer, mut reader) = stream.split();
                // Connected before the snapshot: a join racing with it is
                // then either replayed here or queued on `outbound`.
                hub.set_connected(true);
                let rejoin: Vec<ConversationId> = joined.lock().await.iter().copied().collect();
                let mut ready = true;
                for conversation_id in rejoin {
                    let request = ClientRequest::JoinConversation { conversation_id };
                    if !send_request(&mut writer, &request).await {
                        ready = false;
                        break;
                    }
                }
                if ready {
                    info!(url = %url, "push channel connected");
                    loop {
                        tokio::select! {
                            frame = reader.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    if let Some(event) = decode_event(TransportTag::Push, &text) {
                                        hub.dispatch(event);
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!(%err, "push channel receive failed");
                                    break;
                                }
                            },
                            request = outbound.recv() => match request {
                                Some(request) => {
                                    if !send_request(&mut writer, &request).await {
                                        break;
                                    }
                                }
                                None => {
                                    hub.set_connected(false);
                                    return;
                                }
                            },
                        }
                    }
                }
                hub.set_connected(false);
                warn!(url = %url, "push channel disconnected");
            }
            Err(err) => {
                debug!(url = %url, %err, attempt, "push channel connect failed");
            }
        }
        tokio::time::sleep(policy.delay(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

async fn send_request<S>(writer: &mut S, request: &ClientRequest) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    let Ok(text) = serde_json::to_string(request) else {
        return true;
    };
    writer.send(Message::Text(text)).await.is_ok()
}

/// Channel B.
pub struct ChangeFeedChannel {
    hub: Arc<BusHub>,
    task: JoinHandle<()>,
}

impl ChangeFeedChannel {
    /// Without `since` the feed starts at the server's current head.
    pub fn connect(
        server_url: &str,
        user_id: UserId,
        since: Option<i64>,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>, ClientError> {
        let base = socket_url(server_url, "feed", &[("user_id", user_id.0.to_string())])?;
        let hub = Arc::new(BusHub::new(TransportTag::Feed, BUS_CAPACITY));
        let task = tokio::spawn(run_feed(base, Arc::clone(&hub), since, policy));
        Ok(Arc::new(Self { hub, task }))
    }
}

impl Drop for ChangeFeedChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MessageBus for ChangeFeedChannel {
    fn tag(&self) -> TransportTag {
        self.hub.tag()
    }

    fn on_message(&self) -> broadcast::Receiver<MessagePayload> {
        self.hub.on_message()
    }

    fn on_status_change(&self) -> broadcast::Receiver<StatusChangePayload> {
        self.hub.on_status_change()
    }

    fn on_typing(&self) -> broadcast::Receiver<TypingSignal> {
        self.hub.on_typing()
    }

    fn on_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.hub.on_lifecycle()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.hub.connectivity()
    }
}

async fn run_feed(base: Url, hub: Arc<BusHub>, mut since: Option<i64>, policy: ReconnectPolicy) {
    let mut attempt = 0u32;
    loop {
        let mut url = base.clone();
        if let Some(seq) = since {
            url.query_pairs_mut().append_pair("since", &seq.to_string());
        }
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                attempt = 0;
                hub.set_connected(true);
                info!(url = %url, "change-feed connected");
                let (_, mut reader) = stream.split();
                while let Some(frame) = reader.next().await {
                    match frame {
                        Ok(Message::Text(text)) => match serde_json::from_str::<FeedEnvelope>(&text) {
                            Ok(envelope) => {
                                if since.is_some_and(|last| envelope.seq <= last) {
                                    continue;
                                }
                                since = Some(envelope.seq);
                                hub.dispatch(envelope.event);
                            }
                            Err(err) => warn!(%err, "invalid feed envelope"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%err, "change-feed receive failed");
                            break;
                        }
                    }
                }
                hub.set_connected(false);
                warn!(resume_after = ?since, "change-feed disconnected");
            }
            Err(err) => {
                debug!(url = %url, %err, attempt, "change-feed connect failed");
            }
        }
        tokio::time::sleep(policy.delay(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
