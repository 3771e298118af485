//! Chat session state owned by the main loop.
//!
//! Background work (a provider request, a speech recognition pass) only ever
//! posts [`SessionEvent`]s onto the session channel; the loop feeds them back
//! through [`ChatSession::handle_event`], which is the single place where the
//! log, the in-memory history and the streaming bubble change.

use chrono::Local;
use futures::StreamExt;
use log::{ debug, info, warn };
use std::path::{ Path, PathBuf };
use std::sync::Arc;
use tokio::sync::mpsc::{ self, UnboundedReceiver, UnboundedSender };
use uuid::Uuid;

use crate::attachment::{ self, PendingImage };
use crate::config::AppConfig;
use crate::error::ChatError;
use crate::history::{
    self,
    ChatLog,
    Conversation,
    SearchResults,
    CONVERSATION_ID_FORMAT,
    TIMESTAMP_FORMAT,
};
use crate::llm::chat::{ ChatClient, new_client };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::{ ChatMessage, ContentPart, LogRecord, MessageContent, Role, UserTurn };
use crate::models::event::{ ChatEvent, SessionEvent, SpeechEvent };
use crate::speech::{ Speaker, SpeechRecognizer };

pub type ClientFactory = Arc<
    dyn (Fn(&LlmConfig) -> Result<Arc<dyn ChatClient>, ChatError>) + Send + Sync
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Sending,
    Streaming,
    Finished,
    Failed,
}

impl RequestState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RequestState::Sending | RequestState::Streaming)
    }
}

/// Reply text as it is being streamed in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingBubble {
    pub text: String,
}

/// What the front end should render after an event was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Chunk(String),
    Finished(String),
    Failed(ChatError),
    SpeechStatus(String),
    Transcribed(String),
    SpeechFailed(ChatError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAction {
    Started,
    Stopped,
    NothingToRead,
}

pub struct ChatSession {
    config: AppConfig,
    config_path: PathBuf,
    log: ChatLog,
    messages: Vec<ChatMessage>,
    conversation_id: String,
    last_reply: String,
    pending_image: Option<PendingImage>,
    state: RequestState,
    active_request: Option<Uuid>,
    bubble: Option<StreamingBubble>,
    listening: bool,
    notices: Vec<String>,
    events_tx: UnboundedSender<SessionEvent>,
    client_factory: ClientFactory,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    speaker: Option<Box<dyn Speaker>>,
    config_error: Option<ChatError>,
}

fn new_conversation_id() -> String {
    Local::now().format(CONVERSATION_ID_FORMAT).to_string()
}

fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

impl ChatSession {
    pub fn new(
        config: AppConfig,
        config_path: impl Into<PathBuf>,
        log: ChatLog
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            config,
            config_path: config_path.into(),
            log,
            messages: Vec::new(),
            conversation_id: new_conversation_id(),
            last_reply: String::new(),
            pending_image: None,
            state: RequestState::Idle,
            active_request: None,
            bubble: None,
            listening: false,
            notices: Vec::new(),
            events_tx,
            client_factory: Arc::new(new_client),
            recognizer: None,
            speaker: None,
            config_error: None,
        };
        (session, events_rx)
    }

    pub fn with_client_factory(mut self, factory: ClientFactory) -> Self {
        self.client_factory = factory;
        self
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn with_speaker(mut self, speaker: Box<dyn Speaker>) -> Self {
        self.speaker = Some(speaker);
        self
    }

    /// Marks the config file as unreadable: settings can no longer be saved
    /// until it is fixed, so the defaults in use never replace it.
    pub fn with_config_error(mut self, error: ChatError) -> Self {
        self.notices.push(format!("Using default settings. {}", error));
        self.config_error = Some(error);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn log(&self) -> &ChatLog {
        &self.log
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_in_flight() || self.listening
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last_reply(&self) -> &str {
        &self.last_reply
    }

    pub fn bubble(&self) -> Option<&StreamingBubble> {
        self.bubble.as_ref()
    }

    pub fn pending_image(&self) -> Option<&PendingImage> {
        self.pending_image.as_ref()
    }

    /// Non-fatal problems collected since the last call, for display.
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    fn ensure_idle(&self) -> Result<(), ChatError> {
        if self.state.is_in_flight() {
            return Err(ChatError::Busy("A chat request".to_string()));
        }
        if self.listening {
            return Err(ChatError::Busy("Speech recognition".to_string()));
        }
        Ok(())
    }

    fn log_chat(&mut self, role: Role, content: MessageContent) {
        let record = LogRecord {
            role,
            content,
            conversation_id: Some(self.conversation_id.clone()),
            timestamp: Some(now_timestamp()),
        };
        if let Err(e) = self.log.append(&record) {
            warn!("Logging error: {}", e);
            self.notices.push(e.to_string());
        }
    }

    /// Starts a request for `input`. Returns `None` when there is nothing to send.
    pub fn submit(&mut self, input: &str) -> Result<Option<Uuid>, ChatError> {
        self.ensure_idle()?;
        let prompt = input.trim();
        if prompt.is_empty() && self.pending_image.is_none() {
            return Ok(None);
        }

        let active = self.config.active_api;
        if !self.config.has_api_key(active) {
            return Err(
                ChatError::MissingCredential(
                    active.display_name().to_string(),
                    active.as_str().to_string()
                )
            );
        }
        let client = (self.client_factory)(&self.config.llm_config())?;

        let pending = self.pending_image.take();
        let text = attachment::effective_prompt_text(prompt, pending.is_some());

        let mut display_parts = vec![ContentPart::text(text.clone())];
        if let Some(image) = &pending {
            display_parts.push(ContentPart::ImagePath {
                image_path: image.path.display().to_string(),
            });
        }
        self.log_chat(Role::User, MessageContent::Parts(display_parts));

        let history = self.messages.clone();
        let mut history_text = text.clone();
        if pending.is_some() {
            history_text.push_str(" [user sent an image]");
        }
        self.messages.push(ChatMessage::user(history_text));

        let turn = UserTurn { text, image: pending.map(|p| p.image) };
        let request_id = Uuid::new_v4();
        self.state = RequestState::Sending;
        self.active_request = Some(request_id);
        self.bubble = Some(StreamingBubble::default());
        info!("Request {} sent to {} ({} prior turns)", request_id, active, history.len());

        tokio::spawn(run_chat_request(client, history, turn, request_id, self.events_tx.clone()));
        Ok(Some(request_id))
    }

    pub fn handle_event(&mut self, event: SessionEvent) -> Option<SessionUpdate> {
        match event {
            SessionEvent::Chat(event) => self.handle_chat_event(event),
            SessionEvent::Speech(event) => self.handle_speech_event(event),
        }
    }

    fn handle_chat_event(&mut self, event: ChatEvent) -> Option<SessionUpdate> {
        if self.active_request != Some(event.request_id()) || !self.state.is_in_flight() {
            debug!("Ignoring event for inactive request {}", event.request_id());
            return None;
        }
        match event {
            ChatEvent::Chunk { text, .. } => {
                self.state = RequestState::Streaming;
                self.bubble.get_or_insert_with(StreamingBubble::default).text.push_str(&text);
                Some(SessionUpdate::Chunk(text))
            }
            ChatEvent::Finished { text, .. } => {
                self.state = RequestState::Finished;
                self.active_request = None;
                self.bubble = Some(StreamingBubble { text: text.clone() });
                self.log_chat(Role::Assistant, MessageContent::Text(text.clone()));
                self.messages.push(ChatMessage::assistant(text.clone()));
                self.last_reply = text.clone();
                Some(SessionUpdate::Finished(text))
            }
            ChatEvent::Failed { error, .. } => {
                warn!("Request failed: {}", error);
                self.state = RequestState::Failed;
                self.active_request = None;
                self.bubble = Some(StreamingBubble { text: format!("Error: {}", error) });
                Some(SessionUpdate::Failed(error))
            }
        }
    }

    fn handle_speech_event(&mut self, event: SpeechEvent) -> Option<SessionUpdate> {
        match event {
            SpeechEvent::Status(status) => Some(SessionUpdate::SpeechStatus(status)),
            SpeechEvent::Transcribed(text) => {
                if !self.listening {
                    return None;
                }
                self.listening = false;
                Some(SessionUpdate::Transcribed(text))
            }
            SpeechEvent::Failed(error) => {
                if !self.listening {
                    return None;
                }
                self.listening = false;
                Some(SessionUpdate::SpeechFailed(error))
            }
        }
    }

    pub fn start_listening(&mut self) -> Result<(), ChatError> {
        self.ensure_idle()?;
        let recognizer = self.recognizer
            .clone()
            .ok_or_else(|| ChatError::MissingDependency("speech recognition".to_string()))?;
        self.listening = true;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(SessionEvent::Speech(SpeechEvent::Status("Listening...".to_string())));
            let event = match recognizer.listen().await {
                Ok(text) => SpeechEvent::Transcribed(text),
                Err(e) => SpeechEvent::Failed(e),
            };
            let _ = tx.send(SessionEvent::Speech(event));
            let _ = tx.send(SessionEvent::Speech(SpeechEvent::Status(String::new())));
        });
        Ok(())
    }

    /// Speaks the last reply, or stops playback if something is being spoken.
    pub fn read_reply(&mut self) -> Result<ReadAction, ChatError> {
        let speaker = self.speaker
            .as_mut()
            .ok_or_else(|| ChatError::MissingDependency("text-to-speech".to_string()))?;
        if speaker.is_speaking() {
            speaker.stop();
            return Ok(ReadAction::Stopped);
        }
        if self.last_reply.is_empty() || self.last_reply.to_lowercase().starts_with("error:") {
            return Ok(ReadAction::NothingToRead);
        }
        speaker.speak(&self.last_reply)?;
        Ok(ReadAction::Started)
    }

    pub fn new_chat(&mut self) -> Result<(), ChatError> {
        self.ensure_idle()?;
        self.messages.clear();
        self.last_reply.clear();
        self.pending_image = None;
        self.bubble = None;
        self.state = RequestState::Idle;
        let previous = std::mem::replace(&mut self.conversation_id, new_conversation_id());
        if previous == self.conversation_id {
            self.conversation_id.push('1');
        }
        info!("Started conversation {}", self.conversation_id);
        Ok(())
    }

    /// Deletes the whole log and starts over with a fresh conversation.
    pub fn reset_history(&mut self) -> Result<(), ChatError> {
        self.new_chat()?;
        self.log.reset()?;
        Ok(())
    }

    pub fn conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        history::load_conversations(&self.log)
    }

    /// Makes `conversation_id` the active conversation and returns its records,
    /// or `None` when it already is active.
    pub fn open_conversation(
        &mut self,
        conversation_id: &str
    ) -> Result<Option<Vec<LogRecord>>, ChatError> {
        self.ensure_idle()?;
        if conversation_id == self.conversation_id {
            return Ok(None);
        }
        let records = history::load_conversation(&self.log, conversation_id)?;
        self.messages = history::api_history(&records);
        self.conversation_id = conversation_id.to_string();
        self.pending_image = None;
        self.bubble = None;
        self.state = RequestState::Idle;
        Ok(Some(records))
    }

    pub fn search(&self, keyword: &str) -> Result<SearchResults, ChatError> {
        history::search(&self.log, keyword)
    }

    fn ensure_config_writable(&self) -> Result<(), ChatError> {
        match &self.config_error {
            Some(e) =>
                Err(
                    ChatError::Config(
                        format!(
                            "Settings not saved: fix or remove {} first. {}",
                            self.config_path.display(),
                            e
                        )
                    )
                ),
            None => Ok(()),
        }
    }

    pub fn switch_provider(&mut self, llm_type: LlmType) -> Result<(), ChatError> {
        self.ensure_config_writable()?;
        self.config.active_api = llm_type;
        self.config.save(&self.config_path)?;
        info!("Active provider is now {}", llm_type);
        Ok(())
    }

    /// Stores a new key; returns `false` when the key is blank and nothing changed.
    pub fn set_api_key(&mut self, llm_type: LlmType, key: &str) -> Result<bool, ChatError> {
        if key.trim().is_empty() {
            return Ok(false);
        }
        self.ensure_config_writable()?;
        self.config.set_api_key(llm_type, key);
        self.config.save(&self.config_path)?;
        Ok(true)
    }

    /// Queues an image for the next prompt and returns its input placeholder.
    pub fn attach_image(&mut self, path: impl AsRef<Path>) -> Result<String, ChatError> {
        let pending = attachment::load_image(path)?;
        let placeholder = pending.placeholder();
        self.pending_image = Some(pending);
        Ok(placeholder)
    }

    pub fn attach_text_file(
        &self,
        current_prompt: &str,
        path: impl AsRef<Path>
    ) -> Result<String, ChatError> {
        attachment::append_text_file(current_prompt, path)
    }
}

async fn run_chat_request(
    client: Arc<dyn ChatClient>,
    history: Vec<ChatMessage>,
    turn: UserTurn,
    request_id: Uuid,
    tx: UnboundedSender<SessionEvent>
) {
    let result = async {
        let mut stream = client.stream_chat(&history, &turn).await?;
        let mut full_response = String::new();
        while let Some(item) = stream.next().await {
            let chunk = item?;
            if chunk.is_empty() {
                continue;
            }
            full_response.push_str(&chunk);
            let event = ChatEvent::Chunk { request_id, text: chunk };
            if tx.send(SessionEvent::Chat(event)).is_err() {
                return Ok(full_response);
            }
        }
        Ok::<String, ChatError>(full_response)
    }.await;

    let event = match result {
        Ok(text) => ChatEvent::Finished { request_id, text },
        Err(error) => ChatEvent::Failed { request_id, error },
    };
    let _ = tx.send(SessionEvent::Chat(event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::TextStream;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{ TempDir, tempdir };

    #[derive(Clone)]
    enum Script {
        Chunks(Vec<Result<String, ChatError>>),
        Hang,
    }

    struct ScriptedClient {
        script: Script,
        seen: Arc<Mutex<Vec<(Vec<ChatMessage>, UserTurn)>>>,
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn stream_chat(
            &self,
            history: &[ChatMessage],
            turn: &UserTurn
        ) -> Result<TextStream, ChatError> {
            self.seen.lock().unwrap().push((history.to_vec(), turn.clone()));
            match &self.script {
                Script::Chunks(items) => Ok(Box::pin(futures::stream::iter(items.clone()))),
                Script::Hang => Ok(Box::pin(futures::stream::pending())),
            }
        }

        fn llm_type(&self) -> LlmType {
            LlmType::Gemini
        }

        fn get_model(&self) -> String {
            "scripted".to_string()
        }
    }

    type Seen = Arc<Mutex<Vec<(Vec<ChatMessage>, UserTurn)>>>;

    fn factory(script: Script, seen: Seen) -> ClientFactory {
        Arc::new(move |_config: &LlmConfig| {
            let client: Arc<dyn ChatClient> = Arc::new(ScriptedClient {
                script: script.clone(),
                seen: seen.clone(),
            });
            Ok(client)
        })
    }

    fn chunks(parts: &[&str]) -> Script {
        Script::Chunks(parts.iter().map(|p| Ok(p.to_string())).collect())
    }

    struct Fixture {
        _dir: TempDir,
        session: ChatSession,
        rx: UnboundedReceiver<SessionEvent>,
        seen: Seen,
        config_path: PathBuf,
    }

    fn fixture(script: Script) -> Fixture {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let mut config = AppConfig::load_or_create(&config_path).unwrap();
        config.set_api_key(LlmType::Gemini, "test-key");
        let log = ChatLog::open(dir.path().join("chat.jsonl")).unwrap();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let (session, rx) = ChatSession::new(config, &config_path, log);
        let session = session.with_client_factory(factory(script, seen.clone()));
        Fixture { _dir: dir, session, rx, seen, config_path }
    }

    async fn drain(f: &mut Fixture) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Some(event) = f.rx.recv().await {
            if let Some(update) = f.session.handle_event(event) {
                let done = matches!(update, SessionUpdate::Finished(_) | SessionUpdate::Failed(_));
                updates.push(update);
                if done {
                    break;
                }
            }
        }
        updates
    }

    #[tokio::test]
    async fn test_streaming_reply_is_concatenated_and_logged() {
        let mut f = fixture(chunks(&["Halo", ", ", "", "macan!"]));
        let request = f.session.submit("  hello  ").unwrap();
        assert!(request.is_some());
        assert_eq!(f.session.state(), RequestState::Sending);

        let updates = drain(&mut f).await;
        assert_eq!(updates, vec![
            SessionUpdate::Chunk("Halo".into()),
            SessionUpdate::Chunk(", ".into()),
            SessionUpdate::Chunk("macan!".into()),
            SessionUpdate::Finished("Halo, macan!".into()),
        ]);
        assert_eq!(f.session.state(), RequestState::Finished);
        assert_eq!(f.session.bubble().unwrap().text, "Halo, macan!");
        assert_eq!(f.session.last_reply(), "Halo, macan!");
        assert_eq!(f.session.messages(), &[
            ChatMessage::user("hello"),
            ChatMessage::assistant("Halo, macan!"),
        ]);

        let records = f.session.log().records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].role, Role::User);
        assert_eq!(records[0].content, MessageContent::Parts(vec![ContentPart::text("hello")]));
        assert_eq!(records[1].content, MessageContent::Text("Halo, macan!".into()));
        assert_eq!(records[1].conversation_id.as_deref(), Some(f.session.conversation_id()));
    }

    #[tokio::test]
    async fn test_history_excludes_new_turn() {
        let mut f = fixture(chunks(&["one"]));
        f.session.submit("first").unwrap();
        drain(&mut f).await;
        f.session.submit("second").unwrap();
        drain(&mut f).await;

        let seen = f.seen.lock().unwrap();
        assert!(seen[0].0.is_empty());
        assert_eq!(seen[0].1, UserTurn::text("first"));
        assert_eq!(seen[1].0, vec![ChatMessage::user("first"), ChatMessage::assistant("one")]);
        assert_eq!(seen[1].1.text, "second");
    }

    #[tokio::test]
    async fn test_missing_key_is_rejected_before_logging() {
        let mut f = fixture(chunks(&["x"]));
        f.session.set_api_key(LlmType::OpenAI, "").unwrap();
        f.session.switch_provider(LlmType::OpenAI).unwrap();

        let err = f.session.submit("hi").unwrap_err();
        assert!(matches!(err, ChatError::MissingCredential(..)));
        assert_eq!(f.session.state(), RequestState::Idle);
        assert!(f.session.log().records().unwrap().is_empty());
        assert!(f.session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_is_ignored() {
        let mut f = fixture(chunks(&["x"]));
        assert_eq!(f.session.submit("   ").unwrap(), None);
        assert_eq!(f.session.state(), RequestState::Idle);
    }

    #[tokio::test]
    async fn test_second_submit_while_streaming_is_busy() {
        let mut f = fixture(Script::Hang);
        f.session.submit("first").unwrap();
        assert!(f.session.is_busy());
        assert!(matches!(f.session.submit("second"), Err(ChatError::Busy(_))));
        assert!(matches!(f.session.new_chat(), Err(ChatError::Busy(_))));
        assert_eq!(f.session.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_shows_error_and_allows_retry() {
        let failing = Script::Chunks(vec![
            Ok("partial".to_string()),
            Err(ChatError::InvalidCredential("Gemini".into())),
        ]);
        let mut f = fixture(failing);
        f.session.submit("hello").unwrap();
        let updates = drain(&mut f).await;
        assert_eq!(
            updates.last(),
            Some(&SessionUpdate::Failed(ChatError::InvalidCredential("Gemini".into())))
        );
        assert_eq!(f.session.state(), RequestState::Failed);
        assert!(f.session.bubble().unwrap().text.starts_with("Error: "));
        assert_eq!(f.session.last_reply(), "");
        assert_eq!(f.session.log().records().unwrap().len(), 1);
        assert!(f.session.submit("again").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_and_late_events_are_ignored() {
        let mut f = fixture(chunks(&["done"]));
        let request_id = f.session.submit("hello").unwrap().unwrap();

        let stranger = ChatEvent::Chunk { request_id: Uuid::new_v4(), text: "noise".into() };
        assert_eq!(f.session.handle_event(SessionEvent::Chat(stranger)), None);

        drain(&mut f).await;
        let late_chunk = ChatEvent::Chunk { request_id, text: "late".into() };
        let late_error = ChatEvent::Failed { request_id, error: ChatError::provider("Gemini", "late") };
        let late_finish = ChatEvent::Finished { request_id, text: "again".into() };
        assert_eq!(f.session.handle_event(SessionEvent::Chat(late_chunk)), None);
        assert_eq!(f.session.handle_event(SessionEvent::Chat(late_error)), None);
        assert_eq!(f.session.handle_event(SessionEvent::Chat(late_finish)), None);

        assert_eq!(f.session.bubble().unwrap().text, "done");
        assert_eq!(f.session.state(), RequestState::Finished);
        assert_eq!(f.session.log().records().unwrap().len(), 2);
        assert_eq!(f.session.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_image_turn() {
        let mut f = fixture(chunks(&["a cat"]));
        let image_path = f._dir.path().join("cat.png");
        fs::write(&image_path, [1u8, 2, 3]).unwrap();

        let placeholder = f.session.attach_image(&image_path).unwrap();
        assert_eq!(placeholder, "[Image attached: cat.png]");
        f.session.submit(&placeholder).unwrap();
        drain(&mut f).await;

        let seen = f.seen.lock().unwrap();
        assert_eq!(seen[0].1.text, attachment::DEFAULT_IMAGE_PROMPT);
        assert_eq!(seen[0].1.image.as_ref().unwrap().data, vec![1, 2, 3]);
        assert_eq!(
            f.session.messages()[0].content,
            format!("{} [user sent an image]", attachment::DEFAULT_IMAGE_PROMPT)
        );
        let records = f.session.log().records().unwrap();
        assert!(records[0].content.has_image());
        assert!(f.session.pending_image().is_none());
    }

    #[tokio::test]
    async fn test_new_chat_and_reset() {
        let mut f = fixture(chunks(&["reply"]));
        f.session.submit("hello").unwrap();
        drain(&mut f).await;
        let first_id = f.session.conversation_id().to_string();

        f.session.new_chat().unwrap();
        assert_ne!(f.session.conversation_id(), first_id);
        assert!(f.session.messages().is_empty());
        assert_eq!(f.session.last_reply(), "");
        assert_eq!(f.session.conversations().unwrap().len(), 1);

        f.session.reset_history().unwrap();
        assert!(f.session.conversations().unwrap().is_empty());
        assert!(f.session.log().exists());
    }

    #[tokio::test]
    async fn test_open_conversation_rebuilds_history() {
        let mut f = fixture(chunks(&["first reply"]));
        f.session.submit("first question").unwrap();
        drain(&mut f).await;
        let old_id = f.session.conversation_id().to_string();
        f.session.new_chat().unwrap();

        let records = f.session.open_conversation(&old_id).unwrap().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(f.session.conversation_id(), old_id);
        assert_eq!(f.session.messages(), &[
            ChatMessage::user("first question"),
            ChatMessage::assistant("first reply"),
        ]);
        assert_eq!(f.session.open_conversation(&old_id).unwrap(), None);
    }

    #[tokio::test]
    async fn test_search_through_session() {
        let mut f = fixture(chunks(&["stripes"]));
        f.session.submit("tell me about tigers").unwrap();
        drain(&mut f).await;
        assert_eq!(f.session.search("TIGERS").unwrap().hits.len(), 1);
        assert!(f.session.search("zebra").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_switch_provider_persists() {
        let mut f = fixture(chunks(&["x"]));
        f.session.switch_provider(LlmType::OpenAI).unwrap();
        assert!(f.session.set_api_key(LlmType::OpenAI, "sk-1").unwrap());
        assert!(!f.session.set_api_key(LlmType::OpenAI, "  ").unwrap());

        let reloaded = AppConfig::load_or_create(&f.config_path).unwrap();
        assert_eq!(reloaded.active_api, LlmType::OpenAI);
        assert_eq!(reloaded.openai.api_key, "sk-1");
        assert_eq!(reloaded.gemini.api_key, "test-key");
    }

    #[tokio::test]
    async fn test_unreadable_config_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        fs::write(&config_path, "{ \"gemini\": { \"api_key\": \"hand-edited\" ").unwrap();
        let (config, error) = crate::config::load_config_or_default(&config_path);
        let log = ChatLog::open(dir.path().join("chat.jsonl")).unwrap();
        let (session, _rx) = ChatSession::new(config, &config_path, log);
        let mut session = session.with_config_error(error.unwrap());

        assert_eq!(session.take_notices().len(), 1);
        assert!(matches!(session.switch_provider(LlmType::OpenAI), Err(ChatError::Config(_))));
        assert!(matches!(session.set_api_key(LlmType::Gemini, "new"), Err(ChatError::Config(_))));
        assert_eq!(session.config().active_api, LlmType::Gemini);
        assert_eq!(
            fs::read_to_string(&config_path).unwrap(),
            "{ \"gemini\": { \"api_key\": \"hand-edited\" "
        );
    }

    struct FakeSpeaker {
        speaking: Arc<Mutex<Option<String>>>,
    }

    impl Speaker for FakeSpeaker {
        fn is_speaking(&mut self) -> bool {
            self.speaking.lock().unwrap().is_some()
        }

        fn speak(&mut self, text: &str) -> Result<(), ChatError> {
            *self.speaking.lock().unwrap() = Some(text.to_string());
            Ok(())
        }

        fn stop(&mut self) {
            *self.speaking.lock().unwrap() = None;
        }
    }

    #[tokio::test]
    async fn test_read_reply_toggles() {
        let mut f = fixture(chunks(&["say this"]));
        let speaking = Arc::new(Mutex::new(None));
        f.session = f.session.with_speaker(Box::new(FakeSpeaker { speaking: speaking.clone() }));

        assert_eq!(f.session.read_reply().unwrap(), ReadAction::NothingToRead);
        f.session.submit("hi").unwrap();
        drain(&mut f).await;

        assert_eq!(f.session.read_reply().unwrap(), ReadAction::Started);
        assert_eq!(speaking.lock().unwrap().as_deref(), Some("say this"));
        assert_eq!(f.session.read_reply().unwrap(), ReadAction::Stopped);
        assert!(speaking.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_reply_without_speaker() {
        let mut f = fixture(chunks(&["x"]));
        assert!(matches!(f.session.read_reply(), Err(ChatError::MissingDependency(_))));
    }

    struct FakeRecognizer(Result<String, ChatError>);

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn listen(&self) -> Result<String, ChatError> {
            self.0.clone()
        }
    }

    async fn listen_updates(f: &mut Fixture) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        for _ in 0..3 {
            let event = f.rx.recv().await.unwrap();
            if let Some(update) = f.session.handle_event(event) {
                updates.push(update);
            }
        }
        updates
    }

    #[tokio::test]
    async fn test_listening_posts_transcript() {
        let mut f = fixture(chunks(&["x"]));
        f.session = f.session.with_recognizer(Arc::new(FakeRecognizer(Ok("halo".into()))));

        f.session.start_listening().unwrap();
        assert!(f.session.is_listening());
        assert!(matches!(f.session.submit("hi"), Err(ChatError::Busy(_))));
        assert!(matches!(f.session.start_listening(), Err(ChatError::Busy(_))));

        let updates = listen_updates(&mut f).await;
        assert_eq!(updates, vec![
            SessionUpdate::SpeechStatus("Listening...".into()),
            SessionUpdate::Transcribed("halo".into()),
            SessionUpdate::SpeechStatus(String::new()),
        ]);
        assert!(!f.session.is_listening());
    }

    #[tokio::test]
    async fn test_listening_failure() {
        let mut f = fixture(chunks(&["x"]));
        f.session = f.session.with_recognizer(Arc::new(FakeRecognizer(Err(ChatError::SpeechTimeout))));
        f.session.start_listening().unwrap();
        let updates = listen_updates(&mut f).await;
        assert_eq!(updates[1], SessionUpdate::SpeechFailed(ChatError::SpeechTimeout));
        assert!(!f.session.is_busy());
    }

    #[tokio::test]
    async fn test_listening_without_recognizer() {
        let mut f = fixture(chunks(&["x"]));
        assert!(matches!(f.session.start_listening(), Err(ChatError::MissingDependency(_))));
        assert!(!f.session.is_listening());
    }
}
