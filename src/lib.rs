pub mod attachment;
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod repl;
pub mod session;
pub mod speech;

use cli::Args;
use config::AppConfig;
use history::ChatLog;
use log::{ info, warn };
use repl::Repl;
use session::ChatSession;
use speech::{ CommandRecognizer, CommandSpeaker };
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Config File: {}", args.config);
    info!("Chat Log: {}", args.log);
    info!("TTS Command: {}", if args.tts_command.is_empty() { "(disabled)" } else { args.tts_command.as_str() });
    info!("STT Command: {}", if args.stt_command.is_empty() { "(disabled)" } else { args.stt_command.as_str() });
    info!("STT Timeout: {}s", args.stt_timeout_secs);

    let config_path = Path::new(&args.config);
    let (mut config, config_error) = config::load_config_or_default(config_path);
    if let Some(api) = args.api {
        if api != config.active_api {
            config.active_api = api;
            if config_error.is_some() {
                warn!("Provider override applies to this run only; config file left untouched");
            } else if let Err(e) = config.save(config_path) {
                warn!("Could not persist provider override: {}", e);
            }
        }
    }
    info!("Active API: {} ({})", config.active_api, config.model(config.active_api));
    info!("-------------------------");

    let log = ChatLog::open(&args.log)?;
    let (mut session, events) = ChatSession::new(config, config_path, log);
    if let Some(e) = config_error {
        session = session.with_config_error(e);
    }

    match CommandSpeaker::from_command_line(&args.tts_command) {
        Some(speaker) => {
            session = session.with_speaker(Box::new(speaker));
        }
        None => info!("Text-to-speech disabled"),
    }
    let timeout = Duration::from_secs(args.stt_timeout_secs);
    match CommandRecognizer::from_command_line(&args.stt_command, timeout) {
        Some(recognizer) => {
            session = session.with_recognizer(Arc::new(recognizer));
        }
        None => info!("Speech recognition disabled"),
    }

    Repl::new(session, events).run().await?;
    Ok(())
}
