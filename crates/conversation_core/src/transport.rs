use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future, StreamExt};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, Message, MessageId, UserId},
    error::ApiError,
    protocol::{
        DeleteMessagesRequest, EditMessageRequest, FetchPageQuery, ReactionRequest,
        SendMessageRequest, ServerEvent, TypingBroadcastRequest, TypingStopRequest,
    },
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

use crate::{BackendDataService, RealtimeFeed, TypingFeed, TypingUpdate};

/// Backend Data Service over the REST API and the realtime websocket.
pub struct HttpBackendService {
    http: Client,
    server_url: String,
    user_id: UserId,
}

impl HttpBackendService {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            user_id,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// REST endpoint under the server url. Each segment is percent-encoded,
    /// so ids containing `/`, `?` or `#` stay a single path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url: {}", self.server_url))?;
        url.path_segments_mut()
            .map_err(|()| anyhow!("server url cannot carry a path: {}", self.server_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn ws_url(&self, conversation_id: &ConversationId) -> Result<Url> {
        let base = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        Url::parse_with_params(
            &format!("{base}/ws"),
            &[
                ("conversation_id", conversation_id.as_str()),
                ("user_id", self.user_id.as_str()),
            ],
        )
        .context("invalid websocket url")
    }

    async fn open_socket(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<futures::stream::BoxStream<'static, ServerEvent>> {
        let ws_url = self.ws_url(conversation_id)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;

        let conversation_id = conversation_id.clone();
        let frames = ws_stream
            .take_while(|frame| future::ready(!matches!(frame, Err(_) | Ok(WsMessage::Close(_)))))
            .filter_map(move |frame| {
                let conversation_id = conversation_id.clone();
                async move {
                    let Ok(WsMessage::Text(text)) = frame else {
                        return None;
                    };
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::Error(err)) => {
                            warn!(%conversation_id, code = ?err.code, "realtime: server error frame: {}", err.message);
                            None
                        }
                        Ok(event) => Some(event),
                        Err(err) => {
                            debug!(%conversation_id, "realtime: undecodable frame: {err}");
                            None
                        }
                    }
                }
            });
        Ok(frames.boxed())
    }
}

/// Turn a non-success response into the server's [`ApiError`] when it sent
/// one.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(api_error.into()),
        Err(_) => Err(anyhow!("request failed with status {status}: {body}")),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    Ok(check(response).await?.json().await?)
}

#[async_trait]
impl BackendDataService for HttpBackendService {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendMessageRequest,
    ) -> Result<Message> {
        let response = self
            .http
            .post(self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?)
            .json(&request)
            .send()
            .await?;
        decode(response).await
    }

    async fn edit_message(&self, message_id: &MessageId, new_body: &str) -> Result<()> {
        let response = self
            .http
            .patch(self.endpoint(&["messages", message_id.as_str()])?)
            .json(&EditMessageRequest {
                body: new_body.to_string(),
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete_messages(&self, ids: &[MessageId]) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint(&["messages", "delete"])?)
            .json(&DeleteMessagesRequest { ids: ids.to_vec() })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn add_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint(&["messages", message_id.as_str(), "reactions"])?)
            .json(&ReactionRequest {
                emoji: emoji.to_string(),
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn remove_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.endpoint(&["messages", message_id.as_str(), "reactions"])?)
            .json(&ReactionRequest {
                emoji: emoji.to_string(),
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let response = self
            .http
            .get(self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?)
            .query(&FetchPageQuery { before, limit })
            .send()
            .await?;
        decode(response).await
    }

    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<RealtimeFeed> {
        let frames = self.open_socket(conversation_id).await?;
        Ok(frames
            .filter_map(|event| {
                future::ready(match event {
                    ServerEvent::Realtime(event) => Some(event),
                    _ => None,
                })
            })
            .boxed())
    }

    async fn broadcast_typing(
        &self,
        conversation_id: &ConversationId,
        update: TypingUpdate,
    ) -> Result<()> {
        let request = match update {
            TypingUpdate::Started(signal) => self
                .http
                .post(self.endpoint(&["conversations", conversation_id.as_str(), "typing"])?)
                .json(&TypingBroadcastRequest { signal }),
            TypingUpdate::Stopped(user_id) => self
                .http
                .post(self.endpoint(&[
                    "conversations",
                    conversation_id.as_str(),
                    "typing",
                    "stop",
                ])?)
                .json(&TypingStopRequest { user_id }),
        };
        check(request.send().await?).await?;
        Ok(())
    }

    async fn subscribe_typing(&self, conversation_id: &ConversationId) -> Result<TypingFeed> {
        let frames = self.open_socket(conversation_id).await?;
        Ok(frames
            .filter_map(|event| {
                future::ready(match event {
                    ServerEvent::Typing { signal, .. } => Some(TypingUpdate::Started(signal)),
                    ServerEvent::TypingStopped { user_id, .. } => {
                        Some(TypingUpdate::Stopped(user_id))
                    }
                    _ => None,
                })
            })
            .boxed())
    }
}
