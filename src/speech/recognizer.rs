use async_trait::async_trait;
use log::{ debug, info };
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::{ SpeechRecognizer, split_command };
use crate::error::ChatError;

/// Runs an external program that records from the microphone and prints the
/// transcript on stdout.
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRecognizer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self { program: program.into(), args, timeout }
    }

    /// `None` when the command line is blank.
    pub fn from_command_line(command: &str, timeout: Duration) -> Option<Self> {
        let (program, args) = split_command(command)?;
        Some(Self::new(program, args, timeout))
    }
}

#[async_trait]
impl SpeechRecognizer for CommandRecognizer {
    async fn listen(&self) -> Result<String, ChatError> {
        info!("Listening with {} (timeout {:?})", self.program, self.timeout);
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ChatError::MissingDependency(self.program.clone()),
                _ => ChatError::SpeechServiceError(e.to_string()),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ChatError::SpeechServiceError(e.to_string()))?,
            Err(_) => {
                return Err(ChatError::SpeechTimeout);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() { output.status.to_string() } else { stderr };
            return Err(ChatError::SpeechServiceError(message));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("Recognizer output: {:?}", text);
        if text.is_empty() {
            return Err(ChatError::SpeechUnrecognized);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout_ms: u64) -> CommandRecognizer {
        CommandRecognizer::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            Duration::from_millis(timeout_ms)
        )
    }

    #[tokio::test]
    async fn test_transcript_is_trimmed_stdout() {
        let rec = sh("echo '  halo macan  '", 5_000);
        assert_eq!(rec.listen().await, Ok("halo macan".to_string()));
    }

    #[tokio::test]
    async fn test_empty_output_is_unrecognized() {
        assert_eq!(sh("true", 5_000).listen().await, Err(ChatError::SpeechUnrecognized));
    }

    #[tokio::test]
    async fn test_failure_is_service_error() {
        let result = sh("echo quota exceeded >&2; exit 3", 5_000).listen().await;
        assert_eq!(result, Err(ChatError::SpeechServiceError("quota exceeded".to_string())));
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        assert_eq!(sh("sleep 5", 100).listen().await, Err(ChatError::SpeechTimeout));
    }

    #[tokio::test]
    async fn test_missing_program_is_missing_dependency() {
        let rec = CommandRecognizer::new("macan-no-such-recognizer", vec![], Duration::from_secs(1));
        assert_eq!(
            rec.listen().await,
            Err(ChatError::MissingDependency("macan-no-such-recognizer".to_string()))
        );
    }

    #[test]
    fn test_blank_command_line() {
        assert!(CommandRecognizer::from_command_line("", Duration::from_secs(1)).is_none());
    }
}
