//! Streaming relay of completion output from the background to a page.
//!
//! A page opens a named duplex port, sends one [`PortRequest::CallAi`] and
//! then reads [`StreamEvent`]s: any number of `Chunk`s followed by exactly one
//! terminal `Done` or `Error`. The background holds the credentials and
//! speaks HTTP; the page only ever sees provider-shaped JSON chunks.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::ai::{chunk_text, AiError, CompletionRequest, CompletionTransport};
use crate::config::Credentials;
use crate::state::ChatMessage;
use crate::store::KeyValueStore;

pub const AI_STREAM_PORT: &str = "ai_stream";
pub const STREAM_SENTINEL: &str = "[DONE]";
const FRAME_PREFIX: &str = "data: ";
/// Longest line the decoder will hold while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PortRequest {
    #[serde(rename = "CALL_AI")]
    CallAi { messages: Vec<ChatMessage> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "AI_CHUNK")]
    Chunk { chunk: Value },
    #[serde(rename = "AI_STREAM_DONE")]
    Done,
    #[serde(rename = "AI_STREAM_ERROR")]
    Error { error: String },
}

/// Page end of a port.
pub struct PagePort {
    name: String,
    requests: mpsc::UnboundedSender<PortRequest>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// Background end of a port.
pub struct BackgroundPort {
    name: String,
    requests: mpsc::UnboundedReceiver<PortRequest>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

pub fn port_pair(name: &str) -> (PagePort, BackgroundPort) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();
    (
        PagePort {
            name: name.to_string(),
            requests: req_tx,
            events: evt_rx,
        },
        BackgroundPort {
            name: name.to_string(),
            requests: req_rx,
            events: evt_tx,
        },
    )
}

impl PagePort {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends the request and hands back a reader over the reply events.
    pub fn call(self, messages: Vec<ChatMessage>) -> StreamReader {
        if self.requests.send(PortRequest::CallAi { messages }).is_err() {
            debug!(port = %self.name, "background end already closed");
        }
        StreamReader::new(self.events)
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn send(&self, request: PortRequest) -> bool {
        self.requests.send(request).is_ok()
    }
}

impl BackgroundPort {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Opens streaming ports for a page.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open_stream(&self, messages: Vec<ChatMessage>) -> Result<StreamReader, String>;
}

/// One decoded line of the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(Value),
    Sentinel,
}

/// Splits body bytes into `data: ` frames. Bytes are buffered until a newline
/// so multi-byte characters and frames split across reads stay intact. A line
/// longer than [`MAX_LINE_BYTES`] is dropped up to its newline.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    overflowed: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if std::mem::take(&mut self.overflowed) {
                continue;
            }
            if let Some(frame) = decode_line(&line) {
                frames.push(frame);
            }
        }
        if self.buffer.len() > MAX_LINE_BYTES {
            warn!(bytes = self.buffer.len(), "dropping oversized stream line");
            self.buffer.clear();
            self.overflowed = true;
        }
        frames
    }

    /// Whatever is left once the body ends.
    pub fn finish(&mut self) -> Option<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.overflowed) {
            return None;
        }
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<Frame> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);
    let data = line.strip_prefix(FRAME_PREFIX)?;
    if data == STREAM_SENTINEL {
        return Some(Frame::Sentinel);
    }
    match serde_json::from_str(data) {
        Ok(value) => Some(Frame::Data(value)),
        Err(e) => {
            trace!(error = %e, "skipping incomplete frame");
            None
        }
    }
}

/// Background-side server for `ai_stream` ports.
#[derive(Clone)]
pub struct StreamBridge {
    transport: Arc<dyn CompletionTransport>,
    synced: Arc<dyn KeyValueStore>,
}

impl StreamBridge {
    pub fn new(transport: Arc<dyn CompletionTransport>, synced: Arc<dyn KeyValueStore>) -> Self {
        Self { transport, synced }
    }

    /// Serves requests until the page drops its end.
    pub async fn serve(&self, mut port: BackgroundPort) {
        if port.name != AI_STREAM_PORT {
            debug!(port = %port.name, "ignoring port");
            return;
        }
        while let Some(request) = port.requests.recv().await {
            match request {
                PortRequest::CallAi { messages } => self.call(messages, &port.events).await,
            }
        }
    }

    async fn call(&self, messages: Vec<ChatMessage>, events: &mpsc::UnboundedSender<StreamEvent>) {
        let credentials = match Credentials::load(self.synced.as_ref()).await {
            Ok(credentials) => credentials,
            Err(e) => {
                emit(events, StreamEvent::Error { error: e.to_string() });
                return;
            }
        };
        let Some((api_key, model)) = credentials.for_stream() else {
            emit(events, StreamEvent::Error { error: AiError::MissingCredentials.to_string() });
            return;
        };

        let request = CompletionRequest::new(api_key, model, messages, true);
        if let Err(e) = relay_completion(self.transport.as_ref(), &request, events).await {
            warn!(error = %e, "stream failed");
            emit(events, StreamEvent::Error { error: e.to_string() });
        }
    }
}

fn emit(events: &mpsc::UnboundedSender<StreamEvent>, event: StreamEvent) -> bool {
    events.send(event).is_ok()
}

/// Runs one request and forwards its output. On `Err` nothing terminal has
/// been sent yet; the caller reports the error.
pub async fn relay_completion(
    transport: &dyn CompletionTransport,
    request: &CompletionRequest,
    events: &mpsc::UnboundedSender<StreamEvent>,
) -> Result<(), AiError> {
    let response = transport.send(request).await?;
    if !response.is_success() {
        return Err(AiError::Status(response.status));
    }

    if !response.is_event_stream() {
        let chunk = response.json().await?;
        emit(events, StreamEvent::Chunk { chunk });
        emit(events, StreamEvent::Done);
        return Ok(());
    }

    let mut body = response.body;
    let mut decoder = FrameDecoder::new();
    let mut forwarded = 0usize;
    'read: loop {
        let frames = match body.next().await {
            Some(chunk) => decoder.push(&chunk?),
            None => {
                let tail = decoder.finish();
                if let Some(Frame::Data(chunk)) = tail {
                    emit(events, StreamEvent::Chunk { chunk });
                    forwarded += 1;
                }
                break 'read;
            }
        };
        for frame in frames {
            match frame {
                Frame::Sentinel => break 'read,
                Frame::Data(chunk) => {
                    if !emit(events, StreamEvent::Chunk { chunk }) {
                        debug!("page went away mid-stream");
                        return Ok(());
                    }
                    forwarded += 1;
                }
            }
        }
    }

    debug!(chunks = forwarded, "stream complete");
    emit(events, StreamEvent::Done);
    Ok(())
}

/// Progress of a streamed reply, as seen by the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUpdate {
    /// Accumulated text so far.
    Progress(String),
    Done(String),
    Failed(String),
}

/// Page-side accumulator over a port's events.
pub struct StreamReader {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    text: String,
    finished: bool,
}

impl StreamReader {
    pub fn new(events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self {
            events,
            text: String::new(),
            finished: false,
        }
    }

    /// `None` once a terminal update has been returned.
    pub async fn next(&mut self) -> Option<StreamUpdate> {
        if self.finished {
            return None;
        }
        let update = match self.events.recv().await {
            Some(StreamEvent::Chunk { chunk }) => {
                if let Some(piece) = chunk_text(&chunk) {
                    self.text.push_str(piece);
                }
                StreamUpdate::Progress(self.text.clone())
            }
            Some(StreamEvent::Done) => {
                self.finished = true;
                StreamUpdate::Done(self.text.clone())
            }
            Some(StreamEvent::Error { error }) => {
                self.finished = true;
                StreamUpdate::Failed(error)
            }
            None => {
                self.finished = true;
                StreamUpdate::Failed("connection closed before the reply finished".to_string())
            }
        };
        Some(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::ScriptedTransport;
    use crate::ai::TransportResponse;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn delta(text: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    fn sse(chunks: Vec<String>) -> TransportResponse {
        TransportResponse::from_chunks(
            200,
            Some("text/event-stream; charset=utf-8"),
            chunks.into_iter().map(String::into_bytes).collect(),
        )
    }

    async fn drain_events(mut port: PagePort) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = port.recv().await {
            out.push(event);
        }
        out
    }

    async fn run(transport: ScriptedTransport, synced: MemoryStore) -> Vec<StreamEvent> {
        let bridge = StreamBridge::new(Arc::new(transport), Arc::new(synced));
        let (page, background) = port_pair(AI_STREAM_PORT);
        assert!(page.send(PortRequest::CallAi {
            messages: vec![ChatMessage::user("什么是度？")],
        }));
        // Drop the request sender side by serving only the one queued call.
        let server = tokio::spawn(async move {
            let mut background = background;
            if let Some(PortRequest::CallAi { messages }) = background.requests.recv().await {
                bridge.call(messages, &background.events).await;
            }
        });
        server.await.unwrap();
        drain_events(page).await
    }

    async fn configured() -> MemoryStore {
        let synced = MemoryStore::new();
        Credentials::save(&synced, "sk-test", "Qwen/Qwen2.5-7B-Instruct")
            .await
            .unwrap();
        synced
    }

    #[test]
    fn test_decoder_handles_split_frames_and_utf8() {
        let mut decoder = FrameDecoder::new();
        let line = delta("度数");
        let bytes = line.as_bytes();
        // Split inside the multi-byte character.
        let cut = line.find('度').unwrap() + 1;
        assert!(decoder.push(&bytes[..cut]).is_empty());
        let frames = decoder.push(&bytes[cut..]);
        assert_eq!(frames.len(), 1);
        let Frame::Data(value) = &frames[0] else { panic!("expected data frame") };
        assert_eq!(chunk_text(value), Some("度数"));
    }

    #[test]
    fn test_decoder_skips_garbage_and_comments() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b": keep-alive\ndata: {not json\r\nevent: x\ndata: [DONE]\r\n");
        assert_eq!(frames, vec![Frame::Sentinel]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_drops_oversized_line() {
        let mut decoder = FrameDecoder::new();
        let mut huge = b"data: ".to_vec();
        huge.resize(MAX_LINE_BYTES + 16, b'x');
        assert!(decoder.push(&huge).is_empty());
        assert!(decoder.buffer.is_empty());

        // The rest of the oversized line is discarded, later lines decode.
        let frames = decoder.push(format!("xxxx\n{}", delta("next")).as_bytes());
        assert_eq!(frames.len(), 1);
        let Frame::Data(value) = &frames[0] else { panic!("expected data frame") };
        assert_eq!(chunk_text(value), Some("next"));

        decoder.push(&huge);
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn test_body_error_mid_stream_is_terminal_error() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(TransportResponse {
            status: 200,
            content_type: Some("text/event-stream".to_string()),
            body: Box::pin(futures_util::stream::iter(vec![
                Ok(delta("a").into_bytes()),
                Err(AiError::Transport("connection reset".to_string())),
            ])),
        }));

        let events = run(transport, configured().await).await;
        assert_eq!(events.len(), 2);
        let StreamEvent::Chunk { chunk } = &events[0] else { panic!("expected chunk") };
        assert_eq!(chunk_text(chunk), Some("a"));
        assert_eq!(
            events[1],
            StreamEvent::Error {
                error: "connection reset".to_string()
            }
        );
        assert!(!events.contains(&StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_stream_forwards_chunks_then_done() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(sse(vec![delta("pi"), delta("数组"), "data: [DONE]\n\n".into()])));

        let events = run(transport, configured().await).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::Chunk { .. }));
        assert_eq!(events[2], StreamEvent::Done);
    }

    #[tokio::test]
    async fn test_sentinel_stops_forwarding() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(sse(vec![
            format!("{}data: [DONE]\n\n{}", delta("one"), delta("after-in-same-read")),
            delta("after-in-next-read"),
        ])));

        let events = run(transport, configured().await).await;
        let chunks: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk { chunk } => chunk_text(chunk).map(str::to_string),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["one".to_string()]);
        assert_eq!(events.iter().filter(|e| **e == StreamEvent::Done).count(), 1);
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_abort() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(sse(vec![
            "data: {\"choices\": [\n".into(),
            delta("kept"),
        ])));

        let events = run(transport, configured().await).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEvent::Done);
    }

    #[tokio::test]
    async fn test_missing_credentials_reports_error() {
        let transport = ScriptedTransport::new();
        let events = run(transport, MemoryStore::new()).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                error: "API Key or Model not set.".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_non_stream_body_is_single_chunk() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"choices": [{"message": {"content": "整段回答"}}]}));

        let events = run(transport, configured().await).await;
        assert_eq!(events.len(), 2);
        let StreamEvent::Chunk { chunk } = &events[0] else { panic!("expected chunk") };
        assert_eq!(chunk_text(chunk), Some("整段回答"));
        assert_eq!(events[1], StreamEvent::Done);
    }

    #[tokio::test]
    async fn test_http_error_is_terminal_error() {
        let transport = ScriptedTransport::new();
        transport.push_json(429, json!({"message": "rate limited"}));
        let events = run(transport, configured().await).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                error: "HTTP error! status: 429".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_wrong_port_name_is_ignored() {
        let bridge = StreamBridge::new(Arc::new(ScriptedTransport::new()), Arc::new(MemoryStore::new()));
        let (page, background) = port_pair("other");
        page.send(PortRequest::CallAi { messages: vec![] });
        bridge.serve(background).await;
        assert!(drain_events(page).await.is_empty());
    }

    #[tokio::test]
    async fn test_reader_accumulates_until_terminal() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StreamEvent::Chunk { chunk: json!({"choices": [{"delta": {"role": "assistant"}}]}) })
            .unwrap();
        tx.send(StreamEvent::Chunk { chunk: json!({"choices": [{"delta": {"content": "松"}}]}) })
            .unwrap();
        tx.send(StreamEvent::Chunk { chunk: json!({"choices": [{"delta": {"content": "弛"}}]}) })
            .unwrap();
        tx.send(StreamEvent::Done).unwrap();
        tx.send(StreamEvent::Chunk { chunk: json!({}) }).unwrap();

        let mut reader = StreamReader::new(rx);
        assert_eq!(reader.next().await, Some(StreamUpdate::Progress(String::new())));
        assert_eq!(reader.next().await, Some(StreamUpdate::Progress("松".into())));
        assert_eq!(reader.next().await, Some(StreamUpdate::Progress("松弛".into())));
        assert_eq!(reader.next().await, Some(StreamUpdate::Done("松弛".into())));
        assert_eq!(reader.next().await, None);
    }

    #[tokio::test]
    async fn test_reader_reports_closed_port() {
        let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
        drop(tx);
        let mut reader = StreamReader::new(rx);
        assert!(matches!(reader.next().await, Some(StreamUpdate::Failed(_))));
        assert_eq!(reader.next().await, None);
    }

    #[test]
    fn test_event_wire_shape() {
        assert_eq!(
            serde_json::to_value(StreamEvent::Error { error: "x".into() }).unwrap(),
            json!({"type": "AI_STREAM_ERROR", "error": "x"})
        );
        assert_eq!(
            serde_json::to_value(PortRequest::CallAi { messages: vec![] }).unwrap(),
            json!({"type": "CALL_AI", "messages": []})
        );
    }
}
