use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::info;
use reqwest::{ Client as HttpClient, StatusCode };
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
use crate::config::{ GenerationConfig, DEFAULT_GEMINI_MODEL };
use crate::error::ChatError;
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::{ ChatMessage, Role, UserTurn };

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const PROVIDER: &str = "Gemini";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiBlob,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

impl From<&GenerationConfig> for GeminiGenerationConfig {
    fn from(c: &GenerationConfig) -> Self {
        Self {
            temperature: c.temperature,
            top_p: c.top_p,
            top_k: c.top_k,
            max_output_tokens: c.max_output_tokens,
        }
    }
}

#[derive(Deserialize)]
struct GoogleChunk {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct GoogleCandidate {
    #[serde(default)]
    content: Option<GoogleContent>,
}

#[derive(Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Deserialize)]
struct GooglePart {
    #[serde(default)]
    text: Option<String>,
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

fn classify_body(body: &ApiErrorBody) -> ChatError {
    let message = body.message.as_str();
    if body.has_reason("API_KEY_INVALID") {
        return ChatError::InvalidCredential(PROVIDER.to_string());
    }
    if
        body.status.as_deref() == Some("FAILED_PRECONDITION") &&
        message.to_lowercase().contains("location")
    {
        return ChatError::UnsupportedRegion(PROVIDER.to_string());
    }
    classify_text(message)
}

fn classify_text(message: &str) -> ChatError {
    if message.contains("API key not valid") {
        return ChatError::InvalidCredential(PROVIDER.to_string());
    }
    if message.contains("location") && message.contains("is not supported") {
        return ChatError::UnsupportedRegion(PROVIDER.to_string());
    }
    ChatError::provider(PROVIDER, message)
}

pub(crate) fn classify_gemini_error(status: Option<StatusCode>, body: &str) -> ChatError {
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

pub(crate) fn parse_gemini_line(line: &str) -> SseLine {
    let data = match sse_data(line) {
        Some(data) => data.trim(),
        None => return SseLine::Skip,
    };
    if data.is_empty() {
        return SseLine::Skip;
    }
    match serde_json::from_str::<GoogleChunk>(data) {
        Ok(chunk) => {
            if let Some(err) = chunk.error {
                return SseLine::Error(classify_body(&err));
            }
            let text: String = chunk.candidates
                .first()
                .and_then(|c| c.content.as_ref())
                .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect())
                .unwrap_or_default();
            SseLine::Text(text)
        }
        Err(e) => {
            info!("Gemini JSON parse error: {} for data: {}", e, data);
            SseLine::Skip
        }
    }
}

pub struct GeminiChatClient {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
    generation: GenerationConfig,
}

impl GeminiChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        generation: Option<GenerationConfig>
    ) -> Result<Self, ChatError> {
        let http = HttpClient::builder()
            .build()
            .map_err(|e| ChatError::provider(PROVIDER, e.to_string()))?;
        Ok(Self {
            http,
            api_key,
            model: model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            generation: generation.unwrap_or_default(),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ChatError> {
        let api_key = require_api_key(config)?;
        Self::new(
            api_key,
            config.completion_model.clone(),
            config.base_url.clone(),
            config.generation.clone()
        )
    }

    fn build_request(&self, history: &[ChatMessage], turn: &UserTurn) -> GeminiStreamRequest {
        let mut contents: Vec<GeminiContent> = history
            .iter()
            .map(|msg| GeminiContent {
                role: gemini_role(msg.role).to_string(),
                parts: vec![GeminiPart::Text { text: msg.content.clone() }],
            })
            .collect();

        let mut parts = vec![GeminiPart::Text { text: turn.text.clone() }];
        if let Some(image) = &turn.image {
            parts.push(GeminiPart::InlineData {
                inline_data: GeminiBlob {
                    mime_type: image.mime_type.clone(),
                    data: BASE64.encode(&image.data),
                },
            });
        }
        contents.push(GeminiContent { role: "user".to_string(), parts });

        GeminiStreamRequest {
            contents,
            generation_config: GeminiGenerationConfig::from(&self.generation),
        }
    }
}

#[async_trait]
impl ChatClient for GeminiChatClient {
    async fn stream_chat(
        &self,
        history: &[ChatMessage],
        turn: &UserTurn
    ) -> Result<TextStream, ChatError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        info!(
            "GeminiChatClient::stream_chat() → model={} history={} image={}",
            self.model,
            history.len(),
            turn.image.is_some()
        );
        let payload = self.build_request(history, turn);
        let headers = vec![("x-goog-api-key".to_string(), self.api_key.clone())];
        http_stream_generate(
            self.http.clone(),
            url,
            payload,
            parse_gemini_line,
            headers,
            classify_gemini_error,
            false
        ).await
    }

    fn llm_type(&self) -> LlmType {
        LlmType::Gemini
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }
}
