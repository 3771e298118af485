//! Application configuration persisted as a JSON file.
//!
//! The file always carries both provider sections, even when only one is in
//! use, and is rewritten wholesale on every change.

use crate::error::ChatError;
use crate::llm::{ LlmConfig, LlmType };
use log::{ info, warn };
use serde::{ Deserialize, Serialize };
use std::fs;
use std::path::Path;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash-latest";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_p: 1.0,
            top_k: 1,
            max_output_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    pub api_key: String,
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            generation_config: GenerationConfig::default(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAISettings {
    pub api_key: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for OpenAISettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub active_api: LlmType,
    pub gemini: GeminiSettings,
    pub openai: OpenAISettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            active_api: LlmType::Gemini,
            gemini: GeminiSettings::default(),
            openai: OpenAISettings::default(),
        }
    }
}

impl AppConfig {
    /// Reads the config file, writing the defaults first when it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, ChatError> {
        if !path.exists() {
            let config = AppConfig::default();
            config.save(path)?;
            info!("Created default config at {}", path.display());
            return Ok(config);
        }
        let json_str = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&json_str).map_err(|e|
            ChatError::Config(format!("Failed to parse {}: {}", path.display(), e))
        )?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ChatError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        fs::write(path, buf)?;
        Ok(())
    }

    pub fn api_key(&self, llm_type: LlmType) -> &str {
        match llm_type {
            LlmType::Gemini => &self.gemini.api_key,
            LlmType::OpenAI => &self.openai.api_key,
        }
    }

    pub fn set_api_key(&mut self, llm_type: LlmType, key: &str) {
        let key = key.trim().to_string();
        match llm_type {
            LlmType::Gemini => {
                self.gemini.api_key = key;
            }
            LlmType::OpenAI => {
                self.openai.api_key = key;
            }
        }
    }

    pub fn has_api_key(&self, llm_type: LlmType) -> bool {
        !self.api_key(llm_type).trim().is_empty()
    }

    pub fn model(&self, llm_type: LlmType) -> &str {
        match llm_type {
            LlmType::Gemini => &self.gemini.model,
            LlmType::OpenAI => &self.openai.model,
        }
    }

    /// Request settings for the active provider.
    pub fn llm_config(&self) -> LlmConfig {
        let llm_type = self.active_api;
        let api_key = Some(self.api_key(llm_type).to_string()).filter(|k| !k.trim().is_empty());
        match llm_type {
            LlmType::Gemini =>
                LlmConfig {
                    llm_type,
                    api_key,
                    completion_model: Some(self.gemini.model.clone()),
                    base_url: self.gemini.base_url.clone(),
                    generation: Some(self.gemini.generation_config.clone()),
                },
            LlmType::OpenAI =>
                LlmConfig {
                    llm_type,
                    api_key,
                    completion_model: Some(self.openai.model.clone()),
                    base_url: self.openai.base_url.clone(),
                    generation: None,
                },
        }
    }
}

/// Loads the config, falling back to defaults (in memory only) when the file
/// is unreadable. The load error is handed back so the caller never saves the
/// defaults over a file the user still has to fix.
pub fn load_config_or_default(path: &Path) -> (AppConfig, Option<ChatError>) {
    match AppConfig::load_or_create(path) {
        Ok(config) => (config, None),
        Err(e) => {
            warn!("Using default configuration: {}", e);
            (AppConfig::default(), Some(e))
        }
    }
}
