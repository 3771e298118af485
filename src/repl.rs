//! Line-oriented terminal front end.

use log::{ debug, info };
use std::io::Write;
use tokio::io::{ AsyncBufReadExt, BufReader };
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::ChatError;
use crate::history::Conversation;
use crate::llm::LlmType;
use crate::models::chat::{ ContentPart, LogRecord, MessageContent, Role };
use crate::models::event::SessionEvent;
use crate::session::{ ChatSession, ReadAction, SessionUpdate };

pub const HELP: &str =
    "Commands:
  /new                      start a new conversation
  /reset                    delete the whole chat log
  /history                  list saved conversations
  /open <n>                 open conversation number n from /history
  /search <keyword>         search the chat log
  /api <gemini|openai>      switch provider
  /key <gemini|openai> <k>  set an API key
  /image <path>             attach an image to the next prompt
  /file <path>              append a text file to the draft
  /read                     read the last reply aloud (again to stop)
  /listen                   dictate the draft with speech recognition
  /help                     show this help
  /quit                     exit
Any other line is sent as a prompt. An empty line sends the current draft.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Prompt(String),
    SendDraft,
    NewChat,
    Reset,
    History,
    Open(usize),
    Search(String),
    Api(LlmType),
    Key(LlmType, String),
    Image(String),
    File(String),
    Read,
    Listen,
    Help,
    Quit,
}

fn parse_provider(arg: &str) -> Result<LlmType, String> {
    arg.parse::<LlmType>().map_err(|e| e.to_string())
}

/// Parses one input line. `Err` holds a usage message.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::SendDraft);
    }
    if !line.starts_with('/') {
        return Ok(Command::Prompt(line.to_string()));
    }

    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };
    match name {
        "/new" => Ok(Command::NewChat),
        "/reset" => Ok(Command::Reset),
        "/history" => Ok(Command::History),
        "/open" =>
            rest
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .map(Command::Open)
                .ok_or_else(|| "Usage: /open <n>".to_string()),
        "/search" => {
            if rest.is_empty() {
                return Err("Please enter a keyword to search.".to_string());
            }
            Ok(Command::Search(rest.to_string()))
        }
        "/api" => parse_provider(rest).map(Command::Api),
        "/key" => {
            let (provider, key) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "Usage: /key <gemini|openai> <key>".to_string())?;
            Ok(Command::Key(parse_provider(provider)?, key.trim().to_string()))
        }
        "/image" if !rest.is_empty() => Ok(Command::Image(rest.to_string())),
        "/image" => Err("Usage: /image <path>".to_string()),
        "/file" if !rest.is_empty() => Ok(Command::File(rest.to_string())),
        "/file" => Err("Usage: /file <path>".to_string()),
        "/read" => Ok(Command::Read),
        "/listen" => Ok(Command::Listen),
        "/help" => Ok(Command::Help),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command '{}'. Type /help for the list.", other)),
    }
}

fn speaker_label(role: Role) -> &'static str {
    match role {
        Role::User => "You",
        Role::Assistant => "AI",
    }
}

/// Renders one logged record the way it is shown when a conversation is opened.
pub fn render_record(record: &LogRecord) -> String {
    let body = match &record.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) =>
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.clone(),
                    ContentPart::ImagePath { image_path } => format!("[Image: {}]", image_path),
                    ContentPart::ImageUrl { .. } => "[Image]".to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
    };
    format!("{}: {}", speaker_label(record.role), body)
}

pub struct Repl {
    session: ChatSession,
    events: UnboundedReceiver<SessionEvent>,
    draft: String,
    listed: Vec<Conversation>,
}

impl Repl {
    pub fn new(session: ChatSession, events: UnboundedReceiver<SessionEvent>) -> Self {
        Self { session, events, draft: String::new(), listed: Vec::new() }
    }

    pub async fn run(mut self) -> Result<(), ChatError> {
        println!(
            "Macan Chat AI ({}, {}). Type /help for commands.",
            self.session.config().active_api.display_name(),
            self.session.config().model(self.session.config().active_api)
        );
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        self.flush_notices();
        self.prompt_marker();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line? {
                        Some(line) => line,
                        None => {
                            info!("Input closed, exiting");
                            break;
                        }
                    };
                    match parse_command(&line) {
                        Ok(Command::Quit) => break,
                        Ok(command) => self.execute(command).await,
                        Err(usage) => println!("{}", usage),
                    }
                    self.flush_notices();
                    if !self.session.is_busy() {
                        self.prompt_marker();
                    }
                }
                Some(event) = self.events.recv() => {
                    if let Some(update) = self.session.handle_event(event) {
                        self.render_update(update);
                    }
                    self.flush_notices();
                }
            }
        }
        Ok(())
    }

    fn prompt_marker(&self) {
        print!("> ");
        let _ = std::io::stdout().flush();
    }

    fn flush_notices(&mut self) {
        for notice in self.session.take_notices() {
            println!("Warning: {}", notice);
        }
    }

    fn report(&self, result: Result<(), ChatError>) {
        if let Err(e) = result {
            println!("{}", e);
        }
    }

    async fn execute(&mut self, command: Command) {
        debug!("Command: {:?}", command);
        match command {
            Command::Prompt(text) => {
                let prompt = if self.draft.is_empty() {
                    text
                } else {
                    format!("{}\n{}", std::mem::take(&mut self.draft), text)
                };
                self.send(prompt);
            }
            Command::SendDraft => {
                let draft = std::mem::take(&mut self.draft);
                if draft.trim().is_empty() && self.session.pending_image().is_none() {
                    return;
                }
                self.send(draft);
            }
            Command::NewChat => {
                let result = self.session.new_chat().map(|_| {
                    self.draft.clear();
                    println!("New conversation started.");
                });
                self.report(result);
            }
            Command::Reset => {
                let result = self.session.reset_history().map(|_| {
                    self.draft.clear();
                    self.listed.clear();
                    println!("Chat history has been reset.");
                });
                self.report(result);
            }
            Command::History => self.list_history(),
            Command::Open(n) => self.open(n),
            Command::Search(keyword) => {
                match self.session.search(&keyword) {
                    Ok(results) => println!("{}", results),
                    Err(e) => println!("{}", e),
                }
            }
            Command::Api(llm_type) => {
                let result = self.session.switch_provider(llm_type).map(|_| {
                    println!("Switched to {}.", llm_type.display_name());
                });
                self.report(result);
            }
            Command::Key(llm_type, key) => {
                match self.session.set_api_key(llm_type, &key) {
                    Ok(true) => println!("{} API key saved.", llm_type.display_name()),
                    Ok(false) => println!("API key is empty, nothing saved."),
                    Err(e) => println!("{}", e),
                }
            }
            Command::Image(path) => {
                match self.session.attach_image(&path) {
                    Ok(placeholder) => {
                        println!(
                            "{}\nType a question to send with it, or an empty line to send the image alone.",
                            placeholder
                        );
                    }
                    Err(e) => println!("{}", e),
                }
            }
            Command::File(path) => {
                match self.session.attach_text_file(&self.draft, &path) {
                    Ok(draft) => {
                        println!("File appended to the draft. Send an empty line to submit.");
                        self.draft = draft;
                    }
                    Err(e) => println!("{}", e),
                }
            }
            Command::Read => {
                match self.session.read_reply() {
                    Ok(ReadAction::Started) => println!("Reading the last reply..."),
                    Ok(ReadAction::Stopped) => println!("Stopped reading."),
                    Ok(ReadAction::NothingToRead) => println!("There is no reply to read."),
                    Err(e) => println!("{}", e),
                }
            }
            Command::Listen => {
                let result = self.session.start_listening();
                self.report(result);
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
        }
    }

    fn send(&mut self, prompt: String) {
        match self.session.submit(&prompt) {
            Ok(Some(_)) => print!("AI: "),
            Ok(None) => {}
            Err(e) => {
                println!("{}", e);
                if !matches!(e, ChatError::Busy(_)) {
                    self.draft = prompt;
                }
            }
        }
        let _ = std::io::stdout().flush();
    }

    fn list_history(&mut self) {
        match self.session.conversations() {
            Ok(conversations) => {
                if conversations.is_empty() {
                    println!("No conversations yet.");
                }
                for (i, conversation) in conversations.iter().enumerate() {
                    let current = conversation.id.as_deref() == Some(self.session.conversation_id());
                    println!(
                        "{:>3}. {}{}",
                        i + 1,
                        conversation.summary(),
                        if current { " (current)" } else { "" }
                    );
                }
                self.listed = conversations;
            }
            Err(e) => println!("{}", e),
        }
    }

    fn open(&mut self, n: usize) {
        let id = match self.listed.get(n - 1) {
            Some(conversation) =>
                match &conversation.id {
                    Some(id) => id.clone(),
                    None => {
                        println!("That conversation has no id and cannot be continued.");
                        return;
                    }
                }
            None => {
                println!("No conversation {}. Run /history first.", n);
                return;
            }
        };
        match self.session.open_conversation(&id) {
            Ok(Some(records)) => {
                self.draft.clear();
                for record in &records {
                    println!("{}", render_record(record));
                }
            }
            Ok(None) => println!("That conversation is already open."),
            Err(e) => println!("{}", e),
        }
    }

    fn render_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::Chunk(text) => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            SessionUpdate::Finished(_) => {
                println!();
                self.prompt_marker();
            }
            SessionUpdate::Failed(e) => {
                println!("\nError: {}", e);
                self.prompt_marker();
            }
            SessionUpdate::SpeechStatus(status) => {
                if !status.is_empty() {
                    println!("{}", status);
                }
            }
            SessionUpdate::Transcribed(text) => {
                println!("Heard: {}\nSend an empty line to submit it.", text);
                self.draft = text;
                self.prompt_marker();
            }
            SessionUpdate::SpeechFailed(e) => {
                println!("{}", e);
                self.prompt_marker();
            }
        }
    }
}
