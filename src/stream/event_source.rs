use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use url::Url;

use super::StreamError;
use crate::config::StreamingConfig;

const DEFAULT_EVENT_NAME: &str = "message";

/// A single server-sent event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SseEvent {
    event: Option<String>,
    data: String,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// The event name, `"message"` if the server did not send one.
    pub fn event(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT_NAME)
    }

    pub fn data(&self) -> &str {
        &self.data
    }
}

/// The events of one open connection. The stream ends when the server closes the connection.
pub type EventStream = BoxStream<'static, Result<SseEvent, StreamError>>;

/// EventSource opens connections to the streaming service.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<EventStream, StreamError>;
}

/// An [EventSource] reading the event stream over HTTP.
pub struct HttpEventSource {
    client: reqwest::Client,
    url: Url,
    sdk_key: String,
    read_timeout: Duration,
}

impl HttpEventSource {
    pub fn new(config: &StreamingConfig) -> Result<Self, StreamError> {
        Ok(Self {
            client: reqwest::Client::builder()
                .connect_timeout(config.read_timeout)
                .build()?,
            url: config.stream_url()?,
            sdk_key: config.sdk_key.clone(),
            read_timeout: config.read_timeout,
        })
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn connect(&self) -> Result<EventStream, StreamError> {
        let request = self
            .client
            .get(self.url.clone())
            .header(AUTHORIZATION, &self.sdk_key)
            .header(ACCEPT, "text/event-stream")
            .header(
                USER_AGENT,
                concat!("launchdarkly-server-sdk-engine/", env!("CARGO_PKG_VERSION")),
            )
            .send();
        let response = tokio::time::timeout(self.read_timeout, request)
            .await
            .map_err(|_| StreamError::ConnectTimeout)??;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::HttpStatus(status.as_u16()));
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(StreamError::from));
        Ok(sse_stream(body, self.read_timeout))
    }
}

struct SseState<S> {
    body: Pin<Box<S>>,
    parser: SseParser,
    ready: VecDeque<SseEvent>,
    done: bool,
}

/// Turn a response body into a stream of events. A body that stays silent for longer than
/// `read_timeout` fails with [StreamError::ReadTimeout]; the stream ends after the first error.
pub(crate) fn sse_stream<S>(body: S, read_timeout: Duration) -> EventStream
where
    S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        parser: SseParser::default(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match tokio::time::timeout(read_timeout, state.body.next()).await {
                Ok(Some(Ok(chunk))) => {
                    let events = state.parser.push(&chunk);
                    state.ready.extend(events);
                }
                Ok(Some(Err(e))) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                Ok(None) => return None,
                Err(_) => {
                    state.done = true;
                    return Some((Err(StreamError::ReadTimeout), state));
                }
            }
        }
    })
    .boxed()
}

/// Incremental parser for the `text/event-stream` format. Chunks may split lines and events at
/// arbitrary byte positions.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Option<String>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|&b| b == b'\n') {
            let end = consumed + offset;
            let line = String::from_utf8_lossy(&self.buffer[consumed..end]).into_owned();
            consumed = end + 1;
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                events.push(event);
            }
        }
        self.buffer.drain(..consumed);
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            // an event without data is not dispatched
            let data = self.data.take();
            let event = self.event.take();
            return data.map(|data| SseEvent { event, data });
        }
        if line.starts_with(':') {
            return None;
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    fn frames(chunks: &[&'static str]) -> impl Stream<Item = Result<Bytes, StreamError>> {
        stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(chunks: &[&'static str]) -> Vec<SseEvent> {
        sse_stream(frames(chunks), Duration::from_secs(5))
            .map(|event| event.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn parses_named_events() {
        let events = collect(&["event: put\ndata: {\"data\":{}}\n\n"]).await;
        assert_that!(events).is_equal_to(vec![SseEvent::new("put", "{\"data\":{}}")]);
    }

    #[tokio::test]
    async fn events_split_across_chunks() {
        let events = collect(&["eve", "nt: pat", "ch\r\nda", "ta: x\r", "\n", "\r\n"]).await;
        assert_that!(events).is_equal_to(vec![SseEvent::new("patch", "x")]);
    }

    #[tokio::test]
    async fn several_events_in_one_chunk() {
        let events = collect(&["event: a\ndata: 1\n\nevent: b\ndata: 2\n\n"]).await;
        assert_that!(events).has_length(2);
        assert_that!(events[1].event()).is_equal_to("b");
        assert_that!(events[1].data()).is_equal_to("2");
    }

    #[tokio::test]
    async fn multiple_data_lines_are_joined() {
        let events = collect(&["data: a\ndata:b\ndata\n\n"]).await;
        assert_that!(events[0].data()).is_equal_to("a\nb\n");
        assert_that!(events[0].event()).is_equal_to("message");
    }

    #[tokio::test]
    async fn comments_and_empty_events_are_skipped() {
        let events = collect(&[":heartbeat\n\n", "id: 3\nretry: 10\n\n", "event: x\ndata: y\n\n"]).await;
        assert_that!(events).is_equal_to(vec![SseEvent::new("x", "y")]);
    }

    #[tokio::test]
    async fn incomplete_event_at_eof_is_discarded() {
        let events = collect(&["event: put\ndata: partial"]).await;
        assert_that!(events).is_empty();
    }

    #[tokio::test]
    async fn body_error_ends_the_stream() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"event: a\ndata: 1\n\n")),
            Err(StreamError::HttpStatus(500)),
            Ok(Bytes::from_static(b"event: b\ndata: 2\n\n")),
        ]);
        let mut events = sse_stream(body, Duration::from_secs(5));

        assert_that!(events.next().await.unwrap().unwrap().event()).is_equal_to("a");
        assert!(matches!(
            events.next().await,
            Some(Err(StreamError::HttpStatus(500)))
        ));
        assert!(events.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_body_times_out() {
        let body = frames(&["event: a\ndata: 1\n\n"]).chain(stream::pending());
        let mut events = sse_stream(body, Duration::from_secs(30));

        assert!(events.next().await.unwrap().is_ok());
        assert!(matches!(
            events.next().await,
            Some(Err(StreamError::ReadTimeout))
        ));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() {
        // accepted by the kernel backlog but never answered
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = StreamingConfig::new("key")
            .with_base_url(format!("http://{}", listener.local_addr().unwrap()))
            .with_read_timeout(Duration::from_millis(200));
        let source = HttpEventSource::new(&config).unwrap();

        let result = source.connect().await;
        assert!(matches!(result, Err(StreamError::ConnectTimeout)));
        assert!(StreamError::ConnectTimeout.is_recoverable());
        drop(listener);
    }

    #[test]
    fn http_source_requires_valid_url() {
        let config = StreamingConfig::new("key").with_base_url("::");
        assert!(matches!(
            HttpEventSource::new(&config),
            Err(StreamError::InvalidUrl(_))
        ));

        let config = StreamingConfig::new("key");
        let source = HttpEventSource::new(&config).unwrap();
        assert_that!(source.url.as_str()).is_equal_to("https://stream.launchdarkly.com/all");
    }
}
