use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
    protocol::{
        ConversationSummary, HideResponse, MessagePayload, OutgoingMessage, RetractResponse,
        SendMessageRequest, StatusChangePayload, UnreadCountResponse,
    },
};
use tracing::debug;
use url::Url;

use crate::{error::ClientError, transport::LedgerClient};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Serialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

/// [`LedgerClient`] over the server's JSON routes.
#[derive(Clone)]
pub struct HttpLedger {
    http: reqwest::Client,
    base: Url,
    user_id: UserId,
}

impl HttpLedger {
    pub fn new(server_url: &str, user_id: UserId, timeout: Duration) -> Result<Self, ClientError> {
        let mut base = Url::parse(server_url).map_err(|err| {
            ClientError::TransportUnavailable(format!("invalid server url {server_url}: {err}"))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ClientError::TransportUnavailable(format!(
                "server url must be http(s): {server_url}"
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            user_id,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|err| ClientError::TransportUnavailable(format!("bad endpoint {path}: {err}")))
    }

    fn user(&self) -> UserQuery {
        UserQuery {
            user_id: self.user_id.0,
        }
    }

    async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .query(&self.user())
            .send()
            .await?;
        decode(response).await
    }

    async fn get<T: DeserializeOwned, Q: Serialize>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T, ClientError> {
        let response = self
            .http
            .get(self.endpoint(path)?)
            .query(query)
            .send()
            .await?;
        decode(response).await
    }
}

/// Success bodies decode as `T`; error bodies as the server's [`ApiError`].
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    match response.json::<ApiError>().await {
        Ok(err) => {
            debug!(%status, code = ?err.code, "ledger rejected request");
            Err(ClientError::Rejected(err))
        }
        Err(_) => Err(ClientError::TransportUnavailable(format!(
            "unexpected response status {status}"
        ))),
    }
}

#[async_trait]
impl LedgerClient for HttpLedger {
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        receiver_id: UserId,
        message: &OutgoingMessage,
    ) -> Result<MessagePayload, ClientError> {
        let response = self
            .http
            .post(self.endpoint(&format!(
                "conversations/{}/messages",
                conversation_id.0
            ))?)
            .query(&self.user())
            .json(&SendMessageRequest {
                receiver_id,
                message: message.clone(),
            })
            .send()
            .await?;
        decode(response).await
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        self.get(
            &format!("conversations/{}/messages", conversation_id.0),
            &ListMessagesQuery {
                user_id: self.user_id.0,
                limit,
                before: before.map(|id| id.0),
            },
        )
        .await
    }

    async fn mark_delivered(
        &self,
        message_id: MessageId,
    ) -> Result<StatusChangePayload, ClientError> {
        self.post_empty(&format!("messages/{}/delivered", message_id.0))
            .await
    }

    async fn mark_seen(&self, message_id: MessageId) -> Result<StatusChangePayload, ClientError> {
        self.post_empty(&format!("messages/{}/seen", message_id.0))
            .await
    }

    async fn hide_message(&self, message_id: MessageId) -> Result<(), ClientError> {
        let _: HideResponse = self
            .post_empty(&format!("messages/{}/hide", message_id.0))
            .await?;
        Ok(())
    }

    async fn retract_message(&self, message_id: MessageId) -> Result<(), ClientError> {
        let _: RetractResponse = self
            .post_empty(&format!("messages/{}/retract", message_id.0))
            .await?;
        Ok(())
    }

    async fn unread_count(&self, conversation_id: ConversationId) -> Result<u32, ClientError> {
        let response: UnreadCountResponse = self
            .get(
                &format!("conversations/{}/unread", conversation_id.0),
                &self.user(),
            )
            .await?;
        Ok(response.unread_count)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        self.get("conversations", &self.user()).await
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
