//! OpenAI-compatible streaming backend
//!
//! Talks to any server implementing `POST /chat/completions` with
//! `stream: true` and turns the upstream SSE chunks into fragments.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use streamgate_core::{
    InferenceRequest, Result, StreamError, TokenSource, TokenSourceFactory, TurnMetadata,
};
use tracing::debug;

const MAX_ERROR_BODY: usize = 512;

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// OpenAI-compatible chat completions backend
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    client: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    system_prompt: Option<String>,
}

impl OpenAiBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: None,
            model: model.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            system_prompt: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set custom base URL (for API-compatible services)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Default system prompt when the request carries none.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    fn request_body(&self, request: &InferenceRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(prompt) = request
            .system_prompt
            .as_ref()
            .or(self.system_prompt.as_ref())
        {
            messages.push(json!({"role": "system", "content": prompt}));
        }
        messages.push(json!({"role": "user", "content": request.query}));

        json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true }
        })
    }
}

#[async_trait]
impl TokenSourceFactory for OpenAiBackend {
    fn provider(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn open(&self, request: &InferenceRequest) -> Result<Box<dyn TokenSource>> {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&self.request_body(request));
        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| StreamError::Backend(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(StreamError::Backend(format!(
                "OpenAI returned {}: {}",
                status.as_u16(),
                message
            )));
        }

        debug!(conversation_id = %request.conversation_id, "Upstream stream opened");
        Ok(Box::new(OpenAiTokenSource::new(Box::pin(
            response.bytes_stream(),
        ))))
    }
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct StreamErrorBody {
    message: String,
}

/// Fragments parsed from an upstream chat completions stream.
pub struct OpenAiTokenSource {
    bytes: ByteStream,
    /// Bytes not yet decoded: an incomplete UTF-8 sequence or a trailing `\r`.
    undecoded: Vec<u8>,
    buffer: String,
    pending: VecDeque<String>,
    metadata: TurnMetadata,
    done: bool,
}

impl OpenAiTokenSource {
    fn new(bytes: ByteStream) -> Self {
        Self {
            bytes,
            undecoded: Vec::new(),
            buffer: String::new(),
            pending: VecDeque::new(),
            metadata: TurnMetadata::default(),
            done: false,
        }
    }

    /// Decode a network chunk into the text buffer.
    ///
    /// A multi-byte character or a `\r\n` pair may straddle two chunks; the
    /// unfinished tail is held back until the next chunk arrives.
    fn push_chunk(&mut self, chunk: &[u8]) {
        self.undecoded.extend_from_slice(chunk);
        let mut complete = match std::str::from_utf8(&self.undecoded) {
            Ok(_) => self.undecoded.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.undecoded.len(),
        };
        if self.undecoded[..complete].last() == Some(&b'\r') {
            complete -= 1;
        }
        let decoded: Vec<u8> = self.undecoded.drain(..complete).collect();
        self.push_text(&decoded);
    }

    fn push_text(&mut self, bytes: &[u8]) {
        self.buffer
            .push_str(&String::from_utf8_lossy(bytes).replace("\r\n", "\n"));
    }

    /// Parse every complete SSE event currently in the buffer.
    fn drain_events(&mut self) -> Result<()> {
        while let Some(pos) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..pos + 2).collect();
            self.parse_event(&event)?;
        }
        Ok(())
    }

    fn parse_event(&mut self, event: &str) -> Result<()> {
        for line in event.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                continue;
            }

            let parsed: StreamResponse = match serde_json::from_str(data) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };

            if let Some(error) = parsed.error {
                return Err(StreamError::Upstream(error.message));
            }
            if let Some(usage) = parsed.usage {
                self.metadata.input_tokens = Some(usage.prompt_tokens);
                self.metadata.output_tokens = Some(usage.completion_tokens);
            }
            for choice in parsed.choices {
                if let Some(content) = choice.delta.content
                    && !content.is_empty()
                {
                    self.pending.push_back(content);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TokenSource for OpenAiTokenSource {
    async fn next_fragment(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                return Ok(Some(fragment));
            }
            if self.done {
                return Ok(None);
            }

            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    self.push_chunk(&chunk);
                    self.drain_events()?;
                }
                Some(Err(e)) => {
                    return Err(StreamError::Upstream(format!("Stream error: {}", e)));
                }
                None => {
                    // The last event may lack its trailing blank line.
                    let tail = std::mem::take(&mut self.undecoded);
                    self.push_text(&tail);
                    let rest = std::mem::take(&mut self.buffer);
                    self.parse_event(&rest)?;
                    self.done = true;
                }
            }
        }
    }

    fn turn_metadata(&self) -> TurnMetadata {
        self.metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source_from_chunks(chunks: Vec<&'static str>) -> OpenAiTokenSource {
        let items: Vec<reqwest::Result<Bytes>> =
            chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
        OpenAiTokenSource::new(Box::pin(futures::stream::iter(items)))
    }

    async fn drain(source: &mut dyn TokenSource) -> Result<Vec<String>> {
        let mut out = Vec::new();
        while let Some(fragment) = source.next_fragment().await? {
            out.push(fragment);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_parses_fragments_split_across_chunks() {
        let mut source = source_from_chunks(vec![
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\ndata: {\"choi",
            "ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\ndata: [DONE]\n\n",
        ]);

        assert_eq!(drain(&mut source).await.unwrap(), vec!["Hel", "lo"]);
        let metadata = source.turn_metadata();
        assert_eq!(metadata.input_tokens, Some(5));
        assert_eq!(metadata.output_tokens, Some(2));
    }

    #[tokio::test]
    async fn test_multibyte_character_split_across_chunks() {
        let event = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let bytes = event.as_bytes();
        let split = event.find('é').unwrap() + 1;
        let items: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::copy_from_slice(&bytes[..split])),
            Ok(Bytes::copy_from_slice(&bytes[split..])),
        ];
        let mut source = OpenAiTokenSource::new(Box::pin(futures::stream::iter(items)));

        assert_eq!(drain(&mut source).await.unwrap(), vec!["café"]);
    }

    #[tokio::test]
    async fn test_crlf_split_across_chunks() {
        let mut source = source_from_chunks(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\r",
            "\n\r",
            "\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\r\n\r\n",
            "data: [DONE]\r\n\r\n",
        ]);

        assert_eq!(drain(&mut source).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_last_event_without_terminator_is_parsed() {
        let mut source =
            source_from_chunks(vec!["data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}"]);

        assert_eq!(drain(&mut source).await.unwrap(), vec!["tail"]);
    }

    #[tokio::test]
    async fn test_error_payload_becomes_upstream_error() {
        let mut source = source_from_chunks(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"overloaded\"}}\n\n",
        ]);

        assert_eq!(source.next_fragment().await.unwrap().as_deref(), Some("a"));
        assert!(matches!(
            source.next_fragment().await,
            Err(StreamError::Upstream(message)) if message == "overloaded"
        ));
    }

    #[tokio::test]
    async fn test_open_streams_from_server() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"model": "gpt-test", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new("gpt-test")
            .with_api_key("test-key")
            .with_base_url(format!("{}/v1/", server.uri()));
        let request = InferenceRequest {
            query: "hello".to_string(),
            ..Default::default()
        };

        let mut source = backend.open(&request).await.unwrap();
        assert_eq!(
            drain(source.as_mut()).await.unwrap(),
            vec!["Hi", " there"]
        );
    }

    #[tokio::test]
    async fn test_open_reports_http_failure_as_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new("gpt-test").with_base_url(server.uri());
        let result = backend.open(&InferenceRequest::default()).await;

        match result {
            Err(StreamError::Backend(message)) => {
                assert!(message.contains("503"));
                assert!(message.contains("upstream down"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_request_body_prefers_request_overrides() {
        let backend = OpenAiBackend::new("default-model").with_system_prompt("be brief");
        let request = InferenceRequest {
            query: "q".to_string(),
            model: Some("other-model".to_string()),
            system_prompt: Some("be verbose".to_string()),
            ..Default::default()
        };

        let body = backend.request_body(&request);
        assert_eq!(body["model"], "other-model");
        assert_eq!(body["messages"][0]["content"], "be verbose");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["stream"], true);
    }
}
