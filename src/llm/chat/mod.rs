pub mod gemini;
pub mod openai;

use async_trait::async_trait;
use futures::{ Stream, StreamExt };
use log::{ debug, info };
use reqwest::StatusCode;
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ LlmConfig, LlmType };
use self::gemini::GeminiChatClient;
use self::openai::OpenAIChatClient;
use crate::error::ChatError;
use crate::models::chat::{ ChatMessage, UserTurn };

/// Text fragments of one streamed reply, in delivery order.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Sends `turn` after the prior `history` and streams the reply.
    async fn stream_chat(
        &self,
        history: &[ChatMessage],
        turn: &UserTurn
    ) -> Result<TextStream, ChatError>;

    fn llm_type(&self) -> LlmType;

    fn get_model(&self) -> String;
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, ChatError> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::Gemini => {
            let specific_client = GeminiChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    info!(
        "Chat client configured: Type={}, Model={}",
        config.llm_type,
        client.get_model()
    );
    Ok(client)
}

pub(crate) fn require_api_key(config: &LlmConfig) -> Result<String, ChatError> {
    config.api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(||
            ChatError::MissingCredential(
                config.llm_type.display_name().to_string(),
                config.llm_type.as_str().to_string()
            )
        )
}

/// What one line of a server-sent event stream means to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Skip,
    Text(String),
    Done,
    Error(ChatError),
}

/// Payload of a `data:` line, or `None` for comments, blank lines and other fields.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    let line = line.trim_end_matches('\r');
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiErrorDetail {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Error body shape shared closely enough by both providers.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub details: Vec<ApiErrorDetail>,
}

impl ApiErrorBody {
    pub fn code_str(&self) -> Option<&str> {
        self.code.as_ref().and_then(|c| c.as_str())
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.details.iter().any(|d| d.reason.as_deref() == Some(reason))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

pub(crate) fn parse_error_body(body: &str) -> Option<ApiErrorBody> {
    let body = body.trim();
    if let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(body) {
        return Some(envelope.error);
    }
    serde_json
        ::from_str::<Vec<ApiErrorEnvelope>>(body)
        .ok()
        .and_then(|list| list.into_iter().next())
        .map(|e| e.error)
}

pub(crate) const STREAM_TRUNCATED: &str = "Response stream ended before completion";

/// Maps an HTTP failure to a classified error. `status` is `None` for
/// transport failures, where `body` is the transport error text.
pub type ErrorClassifier = fn(Option<StatusCode>, &str) -> ChatError;

/// POSTs `payload` and streams the parsed SSE lines of the response.
///
/// Lines are reassembled across network reads before `line_parser` sees them.
/// With `requires_done`, a body that ends before the parser reports
/// [`SseLine::Done`] yields a final error instead of a silently truncated reply.
pub async fn http_stream_generate(
    http: reqwest::Client,
    url: String,
    payload: impl serde::Serialize + Send + 'static,
    line_parser: fn(&str) -> SseLine,
    headers: Vec<(String, String)>,
    classify: ErrorClassifier,
    requires_done: bool
) -> Result<TextStream, ChatError> {
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let mut req = http.post(&url).json(&payload);
        for (name, value) in headers {
            req = req.header(name, value);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = tx.send(Err(classify(None, &e.to_string()))).await;
                return;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!("Provider returned {}: {}", status, body);
            let _ = tx.send(Err(classify(Some(status), &body))).await;
            return;
        }

        let mut buffer: Vec<u8> = Vec::new();
        let mut bytes = resp.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            let buf = match chunk {
                Ok(buf) => buf,
                Err(e) => {
                    let _ = tx.send(Err(classify(None, &e.to_string()))).await;
                    return;
                }
            };
            buffer.extend_from_slice(&buf);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                let parsed = line_parser(&line);
                if matches!(parsed, SseLine::Done) || !dispatch_line(&tx, parsed).await {
                    return;
                }
            }
        }
        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).into_owned();
            let parsed = line_parser(&line);
            if matches!(parsed, SseLine::Done) || !dispatch_line(&tx, parsed).await {
                return;
            }
        }
        if requires_done {
            debug!("Stream from {} ended without a completion marker", url);
            let _ = tx.send(Err(classify(None, STREAM_TRUNCATED))).await;
        }
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}

/// Forwards one parsed line; returns `false` when the stream should end.
async fn dispatch_line(tx: &mpsc::Sender<Result<String, ChatError>>, line: SseLine) -> bool {
    match line {
        SseLine::Skip => true,
        SseLine::Text(text) => {
            if text.is_empty() {
                return true;
            }
            tx.send(Ok(text)).await.is_ok()
        }
        SseLine::Done => false,
        SseLine::Error(e) => {
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::Router;

    /// Serves `router` on an ephemeral local port and returns its base URL.
    pub async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_data() {
        assert_eq!(sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data("data:{}\r"), Some("{}"));
        assert_eq!(sse_data(": keep-alive"), None);
        assert_eq!(sse_data("event: message"), None);
    }

    #[test]
    fn test_parse_error_body_object_and_array() {
        let body = r#"{"error":{"code":400,"message":"bad","status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#;
        let err = parse_error_body(body).unwrap();
        assert_eq!(err.message, "bad");
        assert!(err.has_reason("API_KEY_INVALID"));
        assert_eq!(err.code_str(), None);

        let wrapped = format!("[{}]", body);
        assert!(parse_error_body(&wrapped).is_some());

        let openai = r#"{"error":{"message":"nope","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        assert_eq!(parse_error_body(openai).unwrap().code_str(), Some("invalid_api_key"));

        assert!(parse_error_body("<html>502</html>").is_none());
    }

    #[test]
    fn test_missing_key_is_missing_credential() {
        let config = LlmConfig { llm_type: LlmType::OpenAI, ..LlmConfig::default() };
        assert!(matches!(new_client(&config), Err(ChatError::MissingCredential(..))));

        let blank = LlmConfig { api_key: Some("  ".into()), ..LlmConfig::default() };
        assert!(matches!(require_api_key(&blank), Err(ChatError::MissingCredential(..))));
    }

    #[test]
    fn test_factory_picks_provider() {
        let config = LlmConfig {
            llm_type: LlmType::Gemini,
            api_key: Some("key".into()),
            ..LlmConfig::default()
        };
        let client = new_client(&config).unwrap();
        assert_eq!(client.llm_type(), LlmType::Gemini);

        let config = LlmConfig { llm_type: LlmType::OpenAI, ..config };
        assert_eq!(new_client(&config).unwrap().llm_type(), LlmType::OpenAI);
    }
}
