use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("{0} is not installed")]
    MissingDependency(String),

    #[error("No {0} API key configured. Set one with /key {1} <key>")]
    MissingCredential(String, String),

    #[error("The {0} API key is not valid. Please check it again.")]
    InvalidCredential(String),

    #[error("Your location may not be supported by the {0} API. Try using a VPN.")]
    UnsupportedRegion(String),

    #[error("Error from {provider} API: {message}")]
    Provider { provider: String, message: String },

    #[error("File error: {0}")]
    FileIo(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0} is already in progress")]
    Busy(String),

    #[error("No speech detected.")]
    SpeechTimeout,

    #[error("Could not recognize speech.")]
    SpeechUnrecognized,

    #[error("Speech service error: {0}")]
    SpeechServiceError(String),
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        ChatError::FileIo(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Config(e.to_string())
    }
}

impl ChatError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ChatError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Errors the user fixes through configuration rather than by retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ChatError::MissingCredential(..)
                | ChatError::InvalidCredential(_)
                | ChatError::MissingDependency(_)
                | ChatError::Config(_)
        )
    }
}
