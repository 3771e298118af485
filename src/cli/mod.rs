use clap::Parser;

use crate::llm::LlmType;
use crate::speech::tts::DEFAULT_TTS_COMMAND;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Storage Args ---
    /// Path to the JSON configuration file. Created with defaults when missing.
    #[arg(long, env = "MACAN_CONFIG", default_value = "config.json")]
    pub config: String,

    /// Path to the append-only chat log (one JSON record per line).
    #[arg(long, env = "MACAN_CHATLOG", default_value = "chatlog.jsonl")]
    pub log: String,

    // --- Provider Args ---
    /// Provider to start with (gemini, openai). Overrides and persists the configured one.
    #[arg(long, env = "MACAN_API")]
    pub api: Option<LlmType>,

    // --- Speech Args ---
    /// Command used to speak a reply; the reply text is passed as the last argument.
    /// Leave empty to disable read-aloud.
    #[arg(long, env = "MACAN_TTS_COMMAND", default_value = DEFAULT_TTS_COMMAND)]
    pub tts_command: String,

    /// Command that records one utterance and prints its transcript on stdout.
    /// Leave empty to disable voice input.
    #[arg(long, env = "MACAN_STT_COMMAND", default_value = "")]
    pub stt_command: String,

    /// Seconds to wait for the speech recognition command before giving up.
    #[arg(long, env = "MACAN_STT_TIMEOUT_SECS", default_value = "15")]
    pub stt_timeout_secs: u64,
}
