pub mod jsonl;

use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fmt;

use crate::error::ChatError;
use crate::models::chat::{ ChatMessage, LogRecord };
pub use self::jsonl::ChatLog;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const CONVERSATION_ID_FORMAT: &str = "%Y%m%d%H%M%S%6f";
const SUMMARY_TEXT_LEN: usize = 30;

/// All records of one conversation, in log order.
#[derive(Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: Option<String>,
    pub records: Vec<LogRecord>,
}

impl Conversation {
    fn first_timestamp(&self) -> &str {
        self.records
            .first()
            .and_then(|r| r.timestamp.as_deref())
            .unwrap_or("0")
    }

    /// Sidebar label: `dd/mm HH:MM - <first text>...`.
    pub fn summary(&self) -> String {
        let first = match self.records.first() {
            Some(record) => record,
            None => return String::new(),
        };
        let text = first.content.first_text().unwrap_or("[Image]");
        let short: String = text.chars().take(SUMMARY_TEXT_LEN).collect();
        let ts = first.timestamp
            .as_deref()
            .and_then(|t| NaiveDateTime::parse_from_str(t, TIMESTAMP_FORMAT).ok())
            .map(|t| t.format("%d/%m %H:%M").to_string())
            .unwrap_or_else(|| "N/A".to_string());
        format!("{} - {}...", ts, short)
    }

    pub fn api_history(&self) -> Vec<ChatMessage> {
        api_history(&self.records)
    }
}

/// Groups records by conversation id, newest conversation first.
///
/// Conversations are ordered by the timestamp of their first record, which is
/// compared as a string; equal timestamps keep log order.
pub fn group_conversations(records: Vec<LogRecord>) -> Vec<Conversation> {
    let mut index: HashMap<Option<String>, usize> = HashMap::new();
    let mut conversations: Vec<Conversation> = Vec::new();
    for record in records {
        let key = record.conversation_id.clone();
        match index.get(&key) {
            Some(&i) => conversations[i].records.push(record),
            None => {
                index.insert(key.clone(), conversations.len());
                conversations.push(Conversation { id: key, records: vec![record] });
            }
        }
    }
    conversations.sort_by(|a, b| b.first_timestamp().cmp(a.first_timestamp()));
    conversations
}

pub fn load_conversations(log: &ChatLog) -> Result<Vec<Conversation>, ChatError> {
    Ok(group_conversations(log.records()?))
}

pub fn load_conversation(log: &ChatLog, conversation_id: &str) -> Result<Vec<LogRecord>, ChatError> {
    Ok(
        log
            .records()?
            .into_iter()
            .filter(|r| r.conversation_id.as_deref() == Some(conversation_id))
            .collect()
    )
}

pub fn api_history(records: &[LogRecord]) -> Vec<ChatMessage> {
    records
        .iter()
        .map(|r| ChatMessage {
            role: r.role,
            content: r.content.to_history_text(r.role),
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub timestamp: String,
    pub role: String,
    pub conversation_tag: String,
    pub text: String,
}

impl fmt::Display for SearchHit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ({}) {}: {}", self.timestamp, self.conversation_tag, self.role, self.text)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchResults {
    pub keyword: String,
    pub hits: Vec<SearchHit>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

impl fmt::Display for SearchResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits.is_empty() {
            return write!(f, "No results found for keyword '{}'.", self.keyword);
        }
        writeln!(f, "Search results:")?;
        for hit in &self.hits {
            writeln!(f, "{}", hit)?;
        }
        Ok(())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

/// Case-insensitive keyword search over the text of every logged message.
pub fn search(log: &ChatLog, keyword: &str) -> Result<SearchResults, ChatError> {
    if !log.exists() {
        return Err(ChatError::FileIo("The chat log file does not exist yet.".to_string()));
    }
    let needle = keyword.to_lowercase();
    let hits = log
        .records()?
        .into_iter()
        .filter_map(|record| {
            let text = record.content.first_text().unwrap_or("");
            if !text.to_lowercase().contains(&needle) {
                return None;
            }
            let conv_id = record.conversation_id.as_deref().unwrap_or("N/A");
            let tag_start = conv_id
                .char_indices()
                .rev()
                .nth(5)
                .map(|(i, _)| i)
                .unwrap_or(0);
            Some(SearchHit {
                timestamp: record.timestamp.clone().unwrap_or_else(|| "N/A".to_string()),
                role: capitalize(record.role.as_str()),
                conversation_tag: conv_id[tag_start..].to_string(),
                text: text.to_string(),
            })
        })
        .collect();
    Ok(SearchResults { keyword: keyword.to_string(), hits })
}
