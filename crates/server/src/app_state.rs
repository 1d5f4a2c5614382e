use std::sync::Arc;

use server_api::{ApiContext, FeedItem};
use tokio::sync::broadcast;

use crate::gateway::Gateway;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) gateway: Arc<Gateway>,
    pub(crate) feed: broadcast::Sender<Arc<FeedItem>>,
    pub(crate) feed_batch: u32,
}

impl AppState {
    pub(crate) fn new(api: ApiContext, event_buffer: usize, feed_batch: u32) -> Self {
        let (feed, _) = broadcast::channel(event_buffer);
        Self {
            api,
            gateway: Arc::new(Gateway::default()),
            feed,
            feed_batch,
        }
    }
}
