use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::info;
use reqwest::{ Client as HttpClient, StatusCode, header::{ HeaderMap, HeaderValue, CONTENT_TYPE } };
use serde::{ Deserialize, Serialize };

use super::{
    ApiErrorBody,
    ChatClient,
    SseLine,
    TextStream,
    http_stream_generate,
    parse_error_body,
    require_api_key,
    sse_data,
};
use crate::config::DEFAULT_OPENAI_MODEL;
use crate::error::ChatError;
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::{ ChatMessage, ContentPart, ImageUrl, MessageContent, Role, UserTurn };

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const PROVIDER: &str = "OpenAI";

pub struct OpenAIChatClient {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: Role,
    content: MessageContent,
}

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: Option<OpenAIDelta>,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

fn classify_body(body: &ApiErrorBody) -> ChatError {
    match body.code_str() {
        Some("invalid_api_key") => ChatError::InvalidCredential(PROVIDER.to_string()),
        Some("unsupported_country_region_territory") => {
            ChatError::UnsupportedRegion(PROVIDER.to_string())
        }
        _ => classify_text(&body.message),
    }
}

fn classify_text(message: &str) -> ChatError {
    if message.contains("Incorrect API key") {
        return ChatError::InvalidCredential(PROVIDER.to_string());
    }
    ChatError::provider(PROVIDER, message)
}

pub(crate) fn classify_openai_error(status: Option<StatusCode>, body: &str) -> ChatError {
    match parse_error_body(body) {
        Some(parsed) => classify_body(&parsed),
        None => {
            let text = if body.trim().is_empty() {
                status.map(|s| s.to_string()).unwrap_or_default()
            } else {
                body.trim().to_string()
            };
            classify_text(&text)
        }
    }
}

pub(crate) fn parse_openai_line(line: &str) -> SseLine {
    let data = match sse_data(line) {
        Some(data) => data.trim(),
        None => return SseLine::Skip,
    };
    if data.is_empty() {
        return SseLine::Skip;
    }
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(stream_resp) => {
            if let Some(err) = stream_resp.error {
                return SseLine::Error(classify_body(&err));
            }
            let text: String = stream_resp.choices
                .iter()
                .filter_map(|c| c.delta.as_ref().and_then(|d| d.content.as_deref()))
                .collect();
            SseLine::Text(text)
        }
        Err(e) => {
            info!("JSON parse error: {} for data: {}", e, data);
            SseLine::Skip
        }
    }
}

impl OpenAIChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>
    ) -> Result<Self, ChatError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ChatError::provider(PROVIDER, e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            model: model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ChatError> {
        let api_key = require_api_key(config)?;
        Self::new(api_key, config.completion_model.clone(), config.base_url.clone())
    }

    fn build_request(&self, history: &[ChatMessage], turn: &UserTurn) -> OpenAIChatRequest {
        let mut messages: Vec<OpenAIMessage> = history
            .iter()
            .map(|msg| OpenAIMessage {
                role: msg.role,
                content: MessageContent::Text(msg.content.clone()),
            })
            .collect();

        let mut parts = vec![ContentPart::text(turn.text.clone())];
        if let Some(image) = &turn.image {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", image.mime_type, BASE64.encode(&image.data)),
                },
            });
        }
        messages.push(OpenAIMessage { role: Role::User, content: MessageContent::Parts(parts) });

        OpenAIChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
        }
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream_chat(
        &self,
        history: &[ChatMessage],
        turn: &UserTurn
    ) -> Result<TextStream, ChatError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        info!(
            "OpenAIChatClient::stream_chat() → model={} history={} image={}",
            self.model,
            history.len(),
            turn.image.is_some()
        );
        let payload = self.build_request(history, turn);
        let headers = vec![("Authorization".to_string(), format!("Bearer {}", self.api_key))];
        http_stream_generate(
            self.http.clone(),
            url,
            payload,
            parse_openai_line,
            headers,
            classify_openai_error,
            true
        ).await
    }

    fn llm_type(&self) -> LlmType {
        LlmType::OpenAI
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }
}
