use crate::embeddings::join_endpoint;
use crate::traits::{ChatDelta, ChatModel, ChatStream};
use crate::SearchError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::VecDeque;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(ChatDelta),
    Done,
}

/// Incremental decoder for `data:` lines of a chat-completions event stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, SearchError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            events.extend(parse_event_line(line.trim())?);
        }

        Ok(events)
    }

    /// Decodes whatever is left once the body ends without a final newline.
    pub fn finish(&mut self) -> Result<Vec<SseEvent>, SearchError> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        parse_event_line(line.trim())
    }
}

fn parse_event_line(line: &str) -> Result<Vec<SseEvent>, SearchError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(Vec::new());
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data == "[DONE]" {
        return Ok(vec![SseEvent::Done]);
    }

    let payload: Value = serde_json::from_str(data)?;
    if let Some(message) = payload.pointer("/error/message").and_then(Value::as_str) {
        return Err(SearchError::unavailable("chat model", message));
    }

    let mut events = Vec::new();
    let delta = payload.pointer("/choices/0/delta");
    let field = |name: &str| {
        delta
            .and_then(|delta| delta.get(name))
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    };
    if let Some(reasoning) = field("reasoning_content") {
        events.push(SseEvent::Delta(ChatDelta::Reasoning(reasoning)));
    }
    if let Some(content) = field("content") {
        events.push(SseEvent::Delta(ChatDelta::Content(content)));
    }
    Ok(events)
}

struct StreamState {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<ChatDelta>,
    finished: bool,
}

impl StreamState {
    fn absorb(&mut self, events: Vec<SseEvent>) {
        for event in events {
            match event {
                SseEvent::Delta(delta) => self.pending.push_back(delta),
                SseEvent::Done => self.finished = true,
            }
        }
    }
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChatClient {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
}

impl OpenAiChatClient {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            client: Client::new(),
            endpoint: join_endpoint(base_url, "chat/completions")?,
            model: model.into(),
            api_key,
            temperature: None,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
impl ChatModel for OpenAiChatClient {
    async fn stream(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<ChatStream, SearchError> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "stream": true,
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| SearchError::unavailable("chat model", error))?;
        if !response.status().is_success() {
            return Err(SearchError::unavailable(
                "chat model",
                format!("{} returned {}", self.endpoint, response.status()),
            ));
        }

        let state = StreamState {
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed(),
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(delta) = state.pending.pop_front() {
                    return Some((Ok(delta), state));
                }
                if state.finished {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => match state.decoder.push(&bytes) {
                        Ok(events) => state.absorb(events),
                        Err(error) => {
                            state.finished = true;
                            return Some((Err(error), state));
                        }
                    },
                    Some(Err(error)) => {
                        state.finished = true;
                        return Some((Err(SearchError::unavailable("chat model", error)), state));
                    }
                    None => {
                        let tail = state.decoder.finish();
                        state.finished = true;
                        match tail {
                            Ok(events) => state.absorb(events),
                            Err(error) => return Some((Err(error), state)),
                        }
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
