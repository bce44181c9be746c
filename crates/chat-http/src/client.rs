use std::time::Duration;

use async_trait::async_trait;
use chat_core::{
    ApiResponse, ChatBackend, ChatError, CreateRoomRequest, ErrorCategory, Message, MessagePage,
    Room, RoomPage, SendMessageRequest, classify_http_status,
};
use reqwest::{Client, Method, RequestBuilder, StatusCode, header::RETRY_AFTER};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;
use url::Url;

use crate::config::HttpBackendConfig;

/// [`ChatBackend`] over the JSON envelope REST API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Serialize)]
struct MarkReadBody<'a> {
    room_id: &'a str,
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<&'a str>,
}

#[derive(Serialize)]
struct AddMemberBody<'a> {
    user_id: &'a str,
}

impl HttpBackend {
    pub fn new(config: &HttpBackendConfig) -> Result<Self, ChatError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(map_reqwest_error)?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, ChatError> {
        let url = endpoint(&self.base_url, segments)?;
        let builder = self.client.request(method, url);
        Ok(match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn execute<T>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<ApiResponse<T>, ChatError>
    where
        T: DeserializeOwned,
    {
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        debug!(operation, status = status.as_u16(), "backend responded");

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let mut err = error_from_status(operation, status, &body);
            if let Some(retry_after) = retry_after {
                err = err.with_retry_after(retry_after);
            }
            return Err(err);
        }

        response
            .json::<ApiResponse<T>>()
            .await
            .map_err(|err| ChatError::remote("invalid_payload", format!("{operation}: {err}")))
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn list_rooms(
        &self,
        user_id: &str,
        limit: u16,
        cursor: Option<&str>,
    ) -> Result<RoomPage, ChatError> {
        let limit = limit.to_string();
        let mut query = vec![("user_id", user_id), ("limit", limit.as_str())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let builder = self.request(Method::GET, &["rooms"])?.query(&query);
        self.execute::<Vec<Room>>("list_rooms", builder)
            .await?
            .into_room_page()
    }

    async fn create_room(&self, request: CreateRoomRequest) -> Result<Room, ChatError> {
        let builder = self.request(Method::POST, &["rooms"])?.json(&request);
        self.execute::<Room>("create_room", builder)
            .await?
            .into_data("create_room")
    }

    async fn list_messages(
        &self,
        room_id: &str,
        user_id: &str,
        limit: u16,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ChatError> {
        let limit = limit.to_string();
        let mut query = vec![
            ("room_id", room_id),
            ("user_id", user_id),
            ("limit", limit.as_str()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let builder = self.request(Method::GET, &["messages"])?.query(&query);
        self.execute::<Vec<Message>>("list_messages", builder)
            .await?
            .into_message_page()
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<Message, ChatError> {
        let builder = self.request(Method::POST, &["messages"])?.json(&request);
        self.execute::<Message>("send_message", builder)
            .await?
            .into_data("send_message")
    }

    async fn mark_read(
        &self,
        room_id: &str,
        user_id: &str,
        message_id: Option<&str>,
    ) -> Result<(), ChatError> {
        let body = MarkReadBody {
            room_id,
            user_id,
            message_id,
        };
        let builder = self
            .request(Method::POST, &["messages", "read"])?
            .json(&body);
        self.execute::<serde_json::Value>("mark_read", builder)
            .await?
            .into_ack("mark_read")
    }

    async fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), ChatError> {
        let builder = self
            .request(Method::POST, &["rooms", room_id, "members"])?
            .json(&AddMemberBody { user_id });
        self.execute::<serde_json::Value>("add_member", builder)
            .await?
            .into_ack("add_member")
    }

    async fn remove_member(&self, room_id: &str, user_id: &str) -> Result<(), ChatError> {
        let builder = self.request(Method::DELETE, &["rooms", room_id, "members", user_id])?;
        self.execute::<serde_json::Value>("remove_member", builder)
            .await?
            .into_ack("remove_member")
    }
}

/// Append percent-encoded path segments to the API root.
pub(crate) fn endpoint(base_url: &Url, segments: &[&str]) -> Result<Url, ChatError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| {
            ChatError::new(
                ErrorCategory::Internal,
                "invalid_base_url",
                format!("base url cannot carry a path: {base_url}"),
            )
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Error for a non-2xx response, preferring the envelope's message when present.
fn error_from_status(operation: &str, status: StatusCode, body: &str) -> ChatError {
    let detail = serde_json::from_str::<ApiResponse<serde_json::Value>>(body)
        .ok()
        .map(|envelope| envelope.message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| status.to_string());
    ChatError::new(
        classify_http_status(status.as_u16()),
        "http_status",
        format!("{operation}: {detail}"),
    )
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> ChatError {
    if err.is_timeout() {
        ChatError::new(ErrorCategory::Timeout, "http_timeout", err.to_string())
    } else if let Some(status) = err.status() {
        ChatError::new(
            classify_http_status(status.as_u16()),
            "http_status",
            err.to_string(),
        )
    } else if err.is_decode() {
        ChatError::remote("invalid_payload", err.to_string())
    } else {
        ChatError::remote("http_transport", err.to_string())
    }
}
