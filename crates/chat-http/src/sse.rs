use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use chat_core::{ChatError, PushEvent, PushFrame, PushSource, PushStream};
use futures_util::{Stream, StreamExt};
use reqwest::{
    Client, Method,
    header::{ACCEPT, HeaderValue},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    client::{endpoint, map_reqwest_error},
    config::HttpBackendConfig,
};

const FRAME_BUFFER: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest line the parser buffers while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// One dispatched Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence; only
/// complete lines are decoded. A partial line longer than the configured
/// limit is an error.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    max_line: usize,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseParser {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
            max_line,
        }
    }

    /// Feed a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, ChatError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8(line).map_err(|err| {
                ChatError::subscription(format!("event stream is not utf-8: {err}"))
            })?;
            if let Some(frame) = self.line(&line) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > self.max_line {
            let pending = self.buffer.len();
            self.buffer.clear();
            return Err(ChatError::subscription(format!(
                "event stream line exceeds {} bytes ({pending} pending)",
                self.max_line
            )));
        }
        Ok(frames)
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            // `id` and `retry` only matter to auto-reconnecting clients.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_owned()),
            data,
        })
    }
}

/// [`PushSource`] following `GET /messages/stream` for one room.
///
/// A stream that errors or is closed by the server ends the subscription;
/// reconnecting is left to the caller.
#[derive(Debug, Clone)]
pub struct SsePushSource {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl SsePushSource {
    pub fn new(config: &HttpBackendConfig) -> Result<Self, ChatError> {
        // Long-lived streams get a connect timeout only.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(config.timeout))
            .build()
            .map_err(map_reqwest_error)?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl PushSource for SsePushSource {
    async fn open(&self, room_id: &str, user_id: &str) -> Result<PushStream, ChatError> {
        let url = endpoint(&self.base_url, &["messages", "stream"])?;
        let mut request = self
            .client
            .request(Method::GET, url)
            .query(&[("room_id", room_id), ("user_id", user_id)])
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ChatError::subscription(map_reqwest_error(err).message))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::subscription(format!(
                "event stream for room {room_id} was refused: {status}"
            )));
        }

        info!(room_id, user_id, "event stream opened");
        let (frames, stop, stream) = PushStream::channel(FRAME_BUFFER);
        tokio::spawn(pump(
            room_id.to_owned(),
            Box::pin(response.bytes_stream()),
            frames,
            stop,
        ));
        Ok(stream)
    }
}

async fn pump<S, B>(
    room_id: String,
    mut body: Pin<Box<S>>,
    frames: mpsc::Sender<PushFrame>,
    stop: CancellationToken,
) where
    S: Stream<Item = reqwest::Result<B>> + Send,
    B: AsRef<[u8]> + Send,
{
    let mut parser = SseParser::default();

    let failure = loop {
        let chunk = tokio::select! {
            _ = stop.cancelled() => {
                debug!(room_id, "event stream stopped");
                return;
            }
            chunk = body.next() => chunk,
        };

        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => break format!("event stream failed: {err}"),
            None => break "event stream closed by server".to_owned(),
        };

        let parsed = match parser.push(bytes.as_ref()) {
            Ok(parsed) => parsed,
            Err(err) => break err.message,
        };
        for frame in parsed {
            match PushEvent::from_sse(&frame.event, &frame.data) {
                Ok(Some(event)) => {
                    if frames.send(PushFrame::Event(event)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => debug!(room_id, event = %frame.event, "ignoring unknown event"),
                Err(err) => {
                    let _ = frames.send(PushFrame::Error(err)).await;
                    return;
                }
            }
        }
    };

    warn!(room_id, reason = %failure, "event stream ended");
    let _ = frames
        .send(PushFrame::Error(ChatError::subscription(failure)))
        .await;
}
