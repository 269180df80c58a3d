//! Chat server REST client.

use crate::{ApiError, ApiResult};
use async_trait::async_trait;
use carelink_core::{Config, CoreError};
use carelink_store::{NewMessage, NewRoom};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

/// Server acknowledgement of a created message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAck {
    /// Idempotency token echoed by the server.
    #[serde(default)]
    pub cid: Option<String>,
    /// Server-side id, when returned.
    #[serde(default)]
    pub id: Option<String>,
}

/// The chat server's REST surface.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `POST /messages` with a queued payload.
    async fn create_message(&self, payload: &serde_json::Value) -> ApiResult<MessageAck>;

    /// `GET /rooms`.
    async fn list_rooms(&self) -> ApiResult<Vec<NewRoom>>;

    /// `POST /rooms`. Returns the room as the server stored it.
    async fn create_room(&self, room: &NewRoom) -> ApiResult<NewRoom>;

    /// `GET /messages/room/{room_id}`.
    async fn list_room_messages(&self, room_id: &str) -> ApiResult<Vec<NewMessage>>;

    /// `GET /health`. Used for connectivity probing.
    async fn health(&self) -> ApiResult<()>;
}

/// [`ChatApi`] over HTTP.
#[derive(Clone)]
pub struct HttpChatApi {
    http_client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpChatApi {
    pub fn new(base_url: Url, auth_token: Option<String>, timeout: Duration) -> ApiResult<Self> {
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Config(CoreError::Config(format!(
                "server url {base_url} cannot carry a path"
            ))));
        }
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url,
            auth_token,
        })
    }

    pub fn from_config(config: &Config) -> ApiResult<Self> {
        Self::new(
            config.server_url()?,
            config.auth_token.clone(),
            config.request_timeout(),
        )
    }

    /// Append `segments` to the base URL, keeping any base path prefix.
    /// Each segment is percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejects URLs that cannot take path segments.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, segments: &[&str]) -> reqwest::RequestBuilder {
        let builder = self.http_client.request(method, self.endpoint(segments));
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Check HTTP response for errors.
    async fn check_response(response: reqwest::Response) -> ApiResult<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!("Chat server request failed: {} - {}", status, body);
            return Err(ApiError::Status {
                status,
                message: body,
            });
        }
        Ok(response)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
        let bytes = Self::check_response(response).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn create_message(&self, payload: &serde_json::Value) -> ApiResult<MessageAck> {
        debug!("Posting message to chat server");
        let response = self
            .request(reqwest::Method::POST, &["messages"])
            .json(payload)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn list_rooms(&self) -> ApiResult<Vec<NewRoom>> {
        let response = self.request(reqwest::Method::GET, &["rooms"]).send().await?;
        Self::read_json(response).await
    }

    async fn create_room(&self, room: &NewRoom) -> ApiResult<NewRoom> {
        debug!(room_id = %room.id, "Creating room on chat server");
        let response = self
            .request(reqwest::Method::POST, &["rooms"])
            .json(room)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn list_room_messages(&self, room_id: &str) -> ApiResult<Vec<NewMessage>> {
        let response = self
            .request(reqwest::Method::GET, &["messages", "room", room_id])
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn health(&self) -> ApiResult<()> {
        let response = self.request(reqwest::Method::GET, &["health"]).send().await?;
        Self::check_response(response).await?;
        Ok(())
    }
}

impl std::fmt::Debug for HttpChatApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChatApi")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(base: &str) -> HttpChatApi {
        HttpChatApi::new(
            Url::parse(base).unwrap(),
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let with_path = api("http://localhost:4000/api/");
        assert_eq!(
            with_path.endpoint(&["messages"]).as_str(),
            "http://localhost:4000/api/messages"
        );
        assert_eq!(
            with_path.endpoint(&["messages", "room", "r1"]).as_str(),
            "http://localhost:4000/api/messages/room/r1"
        );

        let bare = api("http://localhost:4000");
        assert_eq!(bare.endpoint(&["rooms"]).as_str(), "http://localhost:4000/rooms");
    }

    #[test]
    fn test_endpoint_encodes_room_ids() {
        let api = api("http://localhost:4000/api");
        assert_eq!(
            api.endpoint(&["messages", "room", "ward 7/../admin?x#y"]).as_str(),
            "http://localhost:4000/api/messages/room/ward%207%2F..%2Fadmin%3Fx%23y"
        );
    }

    #[test]
    fn test_rejects_base_without_path() {
        let result = HttpChatApi::new(
            Url::parse("mailto:ops@example.org").unwrap(),
            None,
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ApiError::Config(_))));
    }

    #[test]
    fn test_debug_hides_token() {
        let rendered = format!("{:?}", api("http://localhost:4000/api"));
        assert!(rendered.contains("localhost"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_from_config_rejects_bad_url() {
        let config = Config {
            server_url: "not a url".to_string(),
            ..Config::default()
        };
        assert!(HttpChatApi::from_config(&config).is_err());
    }

    #[test]
    fn test_message_ack_tolerates_extra_fields() {
        let ack: MessageAck =
            serde_json::from_str(r#"{"cid":"c1","id":"srv-9","text":"hi"}"#).unwrap();
        assert_eq!(ack.cid.as_deref(), Some("c1"));
        assert_eq!(ack.id.as_deref(), Some("srv-9"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let api = HttpChatApi::new(
            Url::parse("http://127.0.0.1:9").unwrap(),
            None,
            Duration::from_millis(500),
        )
        .unwrap();
        let err = api.health().await.unwrap_err();
        assert!(err.is_transient());
    }
}
