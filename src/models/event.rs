use crate::error::ChatError;
use uuid::Uuid;

/// Results posted by a background chat request to the main loop.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Chunk {
        request_id: Uuid,
        text: String,
    },
    Finished {
        request_id: Uuid,
        text: String,
    },
    Failed {
        request_id: Uuid,
        error: ChatError,
    },
}

impl ChatEvent {
    pub fn request_id(&self) -> Uuid {
        match self {
            ChatEvent::Chunk { request_id, .. }
            | ChatEvent::Finished { request_id, .. }
            | ChatEvent::Failed { request_id, .. } => *request_id,
        }
    }
}

/// Results posted by the background speech recognizer.
#[derive(Debug, Clone)]
pub enum SpeechEvent {
    Status(String),
    Transcribed(String),
    Failed(ChatError),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Chat(ChatEvent),
    Speech(SpeechEvent),
}
