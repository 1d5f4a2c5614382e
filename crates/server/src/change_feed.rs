//! Ledger change-feed.
//!
//! A single poller tails the change journal and broadcasts resolved items.
//! Subscribers back-fill from the journal before switching to the live
//! broadcast, and drop anything at or below the last sequence they sent,
//! so the stream they see is gap-free and duplicate-free per connection.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use server_api::{feed_head, feed_items, feed_page, ApiContext, FeedItem};
use shared::{domain::UserId, protocol::FeedEnvelope};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

pub(crate) fn spawn_poller(
    api: ApiContext,
    tx: broadcast::Sender<Arc<FeedItem>>,
    interval: Duration,
    batch: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut cursor = loop {
            match feed_head(&api).await {
                Ok(seq) => break seq,
                Err(error) => {
                    warn!(?error, "change-feed poller cannot read journal head");
                    tokio::time::sleep(interval).await;
                }
            }
        };
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            loop {
                let changes = match api.storage.changes_since(cursor, batch).await {
                    Ok(changes) => changes,
                    Err(error) => {
                        warn!(%error, "change-feed poll failed");
                        break;
                    }
                };
                let Some(last) = changes.last().map(|c| c.seq) else {
                    break;
                };
                match feed_items(&api, &changes).await {
                    Ok(items) => {
                        for item in items {
                            let _ = tx.send(Arc::new(item));
                        }
                        cursor = last;
                    }
                    Err(error) => {
                        warn!(?error, "change-feed items could not be resolved");
                        break;
                    }
                }
                if changes.len() < batch as usize {
                    break;
                }
            }
        }
    })
}

/// Streams feed envelopes for `user_id` starting after `since`.
///
/// Without `since` the subscriber starts at the current journal head.
pub(crate) async fn serve_subscriber(
    api: ApiContext,
    feed: broadcast::Sender<Arc<FeedItem>>,
    batch: u32,
    socket: WebSocket,
    user_id: UserId,
    since: Option<i64>,
) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before back-filling so nothing committed in between is lost.
    let mut live = feed.subscribe();

    let start = match since {
        Some(seq) => seq,
        None => match feed_head(&api).await {
            Ok(seq) => seq,
            Err(error) => {
                warn!(?error, "feed subscriber cannot read journal head");
                return;
            }
        },
    };

    let forward = async {
        let mut last_sent = start;
        if !backfill(&api, &mut sender, user_id, &mut last_sent, batch).await {
            return;
        }
        loop {
            match live.recv().await {
                Ok(item) => {
                    if item.seq <= last_sent {
                        continue;
                    }
                    // Items are broadcast in seq order; advancing past ones
                    // for other users keeps the resume point exact.
                    if item.is_for(user_id) && !send_envelope(&mut sender, &item.envelope()).await
                    {
                        return;
                    }
                    last_sent = item.seq;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(user_id = user_id.0, skipped, "feed subscriber lagged, back-filling");
                    if !backfill(&api, &mut sender, user_id, &mut last_sent, batch).await {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    };

    let drain = async { while let Some(Ok(_)) = receiver.next().await {} };

    tokio::select! {
        _ = forward => {}
        _ = drain => {}
    }
}

async fn backfill<S>(
    api: &ApiContext,
    sender: &mut S,
    user_id: UserId,
    last_sent: &mut i64,
    batch: u32,
) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    loop {
        let page = match feed_page(api, user_id, *last_sent, batch).await {
            Ok(page) => page,
            Err(error) => {
                warn!(?error, "feed back-fill failed");
                return false;
            }
        };
        for envelope in &page.envelopes {
            if !send_envelope(sender, envelope).await {
                return false;
            }
        }
        *last_sent = page.cursor;
        if page.complete {
            return true;
        }
    }
}

async fn send_envelope<S>(sender: &mut S, envelope: &FeedEnvelope) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    let Ok(text) = serde_json::to_string(envelope) else {
        return true;
    };
    sender.send(Message::Text(text)).await.is_ok()
}
