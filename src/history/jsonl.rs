use crate::error::ChatError;
use crate::models::chat::LogRecord;
use log::{ debug, info };
use std::fs::{ self, File, OpenOptions };
use std::io::{ BufRead, BufReader, Write };
use std::path::{ Path, PathBuf };

/// Append-only chat log, one JSON record per line.
#[derive(Debug, Clone)]
pub struct ChatLog {
    path: PathBuf,
}

impl ChatLog {
    /// Opens the log, creating an empty file when none exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ChatError> {
        let path = path.into();
        if !path.exists() {
            File::create(&path)?;
            info!("Created chat log at {}", path.display());
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn append(&self, record: &LogRecord) -> Result<(), ChatError> {
        let mut line = serde_json
            ::to_string(record)
            .map_err(|e| ChatError::FileIo(format!("Failed to encode log record: {}", e)))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ChatError::FileIo(format!("Failed to write to log: {}", e)))?;
        file.write_all(line.as_bytes()).map_err(|e|
            ChatError::FileIo(format!("Failed to write to log: {}", e))
        )?;
        Ok(())
    }

    /// Every parseable record in file order. Lines that are not valid records
    /// are skipped. A missing file reads as empty.
    pub fn records(&self) -> Result<Vec<LogRecord>, ChatError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e|
            ChatError::FileIo(format!("Failed to load history: {}", e))
        )?;
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| ChatError::FileIo(format!("Failed to load history: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => debug!("Skipping log line {}: {}", index + 1, e),
            }
        }
        Ok(records)
    }

    /// Deletes every record and leaves a fresh empty file behind.
    pub fn reset(&self) -> Result<(), ChatError> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e|
                ChatError::FileIo(format!("Failed to delete log file: {}", e))
            )?;
        }
        File::create(&self.path).map_err(|e|
            ChatError::FileIo(format!("Failed to recreate log file: {}", e))
        )?;
        info!("Chat log reset: {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{ MessageContent, Role };
    use tempfile::tempdir;

    fn record(text: &str) -> LogRecord {
        LogRecord {
            role: Role::User,
            content: MessageContent::Text(text.to_string()),
            conversation_id: Some("c1".into()),
            timestamp: Some("2024-05-01 10:00:00".into()),
        }
    }

    #[test]
    fn test_open_creates_empty_file() {
        let dir = tempdir().unwrap();
        let log = ChatLog::open(dir.path().join("chat.jsonl")).unwrap();
        assert!(log.exists());
        assert!(log.records().unwrap().is_empty());
    }

    #[test]
    fn test_each_record_is_one_line() {
        let dir = tempdir().unwrap();
        let log = ChatLog::open(dir.path().join("chat.jsonl")).unwrap();
        log.append(&record("first\nwith newline")).unwrap();
        log.append(&record("second")).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            assert!(serde_json::from_str::<serde_json::Value>(line).is_ok());
        }
        assert_eq!(log.records().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let log = ChatLog::open(dir.path().join("chat.jsonl")).unwrap();
        log.append(&record("ok")).unwrap();
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        writeln!(file, "{{ broken").unwrap();
        writeln!(file).unwrap();
        log.append(&record("also ok")).unwrap();

        let records = log.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].content.first_text(), Some("also ok"));
    }

    #[test]
    fn test_reset_leaves_fresh_empty_file() {
        let dir = tempdir().unwrap();
        let log = ChatLog::open(dir.path().join("chat.jsonl")).unwrap();
        log.append(&record("gone soon")).unwrap();
        log.reset().unwrap();
        assert!(log.exists());
        assert_eq!(fs::metadata(log.path()).unwrap().len(), 0);
        assert!(log.records().unwrap().is_empty());
    }
}
