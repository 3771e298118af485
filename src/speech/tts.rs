use log::{ info, warn };
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::process::{ Child, Command };

use super::{ Speaker, split_command };
use crate::error::ChatError;

pub const DEFAULT_TTS_COMMAND: &str = "espeak -s 150";

/// Speaks text by spawning a synthesizer program with the text as its last
/// argument. Playback is fire-and-forget; only the running child is tracked.
pub struct CommandSpeaker {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl CommandSpeaker {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args, child: None }
    }

    pub fn from_command_line(command: &str) -> Option<Self> {
        let (program, args) = split_command(command)?;
        Some(Self::new(program, args))
    }
}

impl Speaker for CommandSpeaker {
    fn is_speaking(&mut self) -> bool {
        let running = match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        if !running {
            self.child = None;
        }
        running
    }

    fn speak(&mut self, text: &str) -> Result<(), ChatError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ChatError::MissingDependency(self.program.clone()),
                _ => ChatError::FileIo(format!("Failed to start {}: {}", self.program, e)),
            })?;
        info!("Speaking {} characters with {}", text.chars().count(), self.program);
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                warn!("Failed to stop speech playback: {}", e);
            }
        }
    }
}
