//! Speech input and output.
//!
//! Both directions shell out to external programs configured on the command
//! line, so any recognizer or synthesizer with a CLI can be plugged in.

pub mod recognizer;
pub mod tts;

use async_trait::async_trait;

use crate::error::ChatError;
pub use self::recognizer::CommandRecognizer;
pub use self::tts::CommandSpeaker;

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Listens once and returns the transcribed text.
    async fn listen(&self) -> Result<String, ChatError>;
}

pub trait Speaker: Send {
    fn is_speaking(&mut self) -> bool;

    fn speak(&mut self, text: &str) -> Result<(), ChatError>;

    fn stop(&mut self);
}

/// Splits a command line on whitespace into program and arguments.
pub(crate) fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut words = command.split_whitespace().map(|w| w.to_string());
    let program = words.next()?;
    Some((program, words.collect()))
}
