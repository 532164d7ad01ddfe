//! Conversation history with debounced, quota-aware persistence.
//!
//! In-memory state is the source of truth: every mutation lands there
//! synchronously and stays correct even if all persistence fails. Durable
//! writes are coalesced behind a short debounce timer so message bursts do
//! not hammer storage, and quota failures trigger a pruning cascade on the
//! durable copy only — quota handling never evicts conversations from
//! memory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::error::HistoryWriteError;
use crate::models::{Conversation, Message, Role};

/// Aggressive fallback bound when pruning to `max_conversations` still
/// fails the durable write.
const AGGRESSIVE_PRUNE_COUNT: usize = 10;

/// Maximum derived title length.
const TITLE_MAX_LEN: usize = 50;

/// The on-disk shape of the history store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub conversations: Vec<Conversation>,
    pub current_id: Option<Uuid>,
}

/// Durable layer under the history store.
///
/// Kept as a trait so quota failures can be simulated; the production
/// implementation is an atomically-replaced JSON file.
pub trait HistoryBackend: Send + Sync + 'static {
    fn load(&self) -> Result<HistorySnapshot, HistoryWriteError>;
    fn save(&self, snapshot: &HistorySnapshot) -> Result<(), HistoryWriteError>;
    fn clear(&self) -> Result<(), HistoryWriteError>;
}

/// JSON-file backend. Writes go to a temp file first and are renamed into
/// place, so a crash mid-write leaves the previous snapshot intact.
pub struct FileHistoryBackend {
    path: PathBuf,
}

impl FileHistoryBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HistoryBackend for FileHistoryBackend {
    fn load(&self) -> Result<HistorySnapshot, HistoryWriteError> {
        if !self.path.exists() {
            return Ok(HistorySnapshot::default());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| HistoryWriteError::Io(e.to_string()))
    }

    fn save(&self, snapshot: &HistorySnapshot) -> Result<(), HistoryWriteError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload =
            serde_json::to_string(snapshot).map_err(|e| HistoryWriteError::Io(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), HistoryWriteError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

struct HistoryState {
    conversations: Vec<Conversation>,
    current_id: Option<Uuid>,
    pending_write: Option<JoinHandle<()>>,
}

struct Inner {
    backend: Box<dyn HistoryBackend>,
    config: HistoryConfig,
    state: Mutex<HistoryState>,
}

/// Conversation history manager. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<Inner>,
}

impl HistoryStore {
    /// Open the store, hydrating from the durable layer. A failed or
    /// missing load starts empty rather than failing.
    pub fn open(backend: Box<dyn HistoryBackend>, config: HistoryConfig) -> Self {
        let snapshot = backend.load().unwrap_or_else(|e| {
            warn!("failed to load history, starting empty: {e}");
            HistorySnapshot::default()
        });
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                state: Mutex::new(HistoryState {
                    conversations: snapshot.conversations,
                    current_id: snapshot.current_id,
                    pending_write: None,
                }),
            }),
        }
    }

    pub fn open_file(path: &Path, config: HistoryConfig) -> Self {
        Self::open(Box::new(FileHistoryBackend::new(path)), config)
    }

    /// Create a new empty conversation and make it current.
    pub fn create_conversation(&self) -> Uuid {
        let conversation = Conversation::new();
        let id = conversation.id;
        {
            let mut state = self.inner.state.lock().unwrap();
            state.conversations.push(conversation);
            state.current_id = Some(id);
        }
        self.schedule_write();
        id
    }

    /// Make an existing conversation current. Unknown ids are logged and
    /// ignored.
    pub fn load_conversation(&self, id: Uuid) {
        let mut state = self.inner.state.lock().unwrap();
        if state.conversations.iter().any(|c| c.id == id) {
            state.current_id = Some(id);
        } else {
            error!("conversation {id} not found");
        }
    }

    /// Delete a conversation. When the current one is deleted, the
    /// most-recently-updated remaining conversation becomes current, or a
    /// fresh empty one if none remain.
    pub fn delete_conversation(&self, id: Uuid) {
        let needs_new = {
            let mut state = self.inner.state.lock().unwrap();
            state.conversations.retain(|c| c.id != id);

            if state.current_id == Some(id) {
                match state
                    .conversations
                    .iter()
                    .max_by_key(|c| (c.updated_at, c.id))
                    .map(|c| c.id)
                {
                    Some(next) => {
                        state.current_id = Some(next);
                        false
                    }
                    None => true,
                }
            } else {
                false
            }
        };

        if needs_new {
            self.create_conversation();
        } else {
            self.schedule_write();
        }
    }

    /// Append a message to the given conversation, or to the current one
    /// (created on demand) when `conversation_id` is `None`.
    ///
    /// The message list is capped at `max_messages`; appends beyond the cap
    /// evict from the oldest end. The first user message derives the title,
    /// which is immutable afterwards.
    pub fn append_message(&self, message: Message, conversation_id: Option<Uuid>) {
        let target = match conversation_id {
            Some(id) => id,
            None => match self.current_id() {
                Some(id) => id,
                None => self.create_conversation(),
            },
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            let Some(conversation) = state.conversations.iter_mut().find(|c| c.id == target)
            else {
                error!("conversation {target} not found, dropping message");
                return;
            };

            if conversation.title.is_none() && message.role == Role::User {
                conversation.title = Some(derive_title(&message.content));
            }

            conversation.updated_at = message.timestamp;
            conversation.messages.push(message);
            let max = self.inner.config.max_messages;
            if conversation.messages.len() > max {
                let excess = conversation.messages.len() - max;
                conversation.messages.drain(..excess);
            }
        }

        self.schedule_write();
    }

    pub fn current_id(&self) -> Option<Uuid> {
        self.inner.state.lock().unwrap().current_id
    }

    /// Messages of the current conversation, in append order.
    pub fn current_messages(&self) -> Vec<Message> {
        let state = self.inner.state.lock().unwrap();
        state
            .current_id
            .and_then(|id| state.conversations.iter().find(|c| c.id == id))
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// All conversations, most recently updated first.
    pub fn conversations(&self) -> Vec<Conversation> {
        let state = self.inner.state.lock().unwrap();
        let mut out = state.conversations.clone();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Flush any pending debounced write synchronously. Call on shutdown.
    pub fn flush(&self) {
        if let Some(handle) = self.inner.state.lock().unwrap().pending_write.take() {
            handle.abort();
        }
        persist(&self.inner);
    }

    /// Arm (or re-arm) the debounce timer. Only the final fire writes, and
    /// it snapshots in-memory state at fire time, so rapid bursts coalesce
    /// into one durable write of the latest state.
    fn schedule_write(&self) {
        let inner = Arc::clone(&self.inner);
        let delay = Duration::from_millis(self.inner.config.debounce_ms);
        let mut state = self.inner.state.lock().unwrap();
        if let Some(previous) = state.pending_write.take() {
            previous.abort();
        }
        state.pending_write = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.state.lock().unwrap().pending_write = None;
            persist(&inner);
        }));
    }
}

/// Write the current snapshot, running the quota cascade on failure:
/// prune the durable copy to `max_conversations`, then to
/// [`AGGRESSIVE_PRUNE_COUNT`], then clear durable storage entirely rather
/// than leave it partial. In-memory state is never touched.
fn persist(inner: &Inner) {
    let mut snapshot = {
        let state = inner.state.lock().unwrap();
        HistorySnapshot {
            conversations: state.conversations.clone(),
            current_id: state.current_id,
        }
    };

    match inner.backend.save(&snapshot) {
        Ok(()) => return,
        Err(HistoryWriteError::QuotaExceeded) => {
            warn!("history write over quota, pruning durable copy");
        }
        Err(e) => {
            warn!("history write failed: {e}");
            return;
        }
    }

    for limit in [inner.config.max_conversations, AGGRESSIVE_PRUNE_COUNT] {
        prune_to(&mut snapshot, limit);
        match inner.backend.save(&snapshot) {
            Ok(()) => {
                debug!("history persisted after pruning to {limit}");
                return;
            }
            Err(HistoryWriteError::QuotaExceeded) => continue,
            Err(e) => {
                warn!("history write failed: {e}");
                return;
            }
        }
    }

    // Still over quota: better an empty durable store than a corrupt one.
    error!("history still over quota after pruning, clearing durable storage");
    if let Err(e) = inner.backend.clear() {
        warn!("failed to clear history storage: {e}");
    }
}

/// Keep only the `limit` most-recently-updated conversations, preserving
/// relative order of the survivors. Timestamp ties resolve toward earlier
/// list position, so the strictly newest conversations always survive.
fn prune_to(snapshot: &mut HistorySnapshot, limit: usize) {
    if snapshot.conversations.len() <= limit {
        return;
    }
    let mut ranked: Vec<usize> = (0..snapshot.conversations.len()).collect();
    // Stable sort: equal timestamps stay in list order.
    ranked.sort_by_key(|&i| std::cmp::Reverse(snapshot.conversations[i].updated_at));
    let keep: std::collections::HashSet<usize> = ranked[..limit].iter().copied().collect();

    let mut index = 0usize;
    snapshot.conversations.retain(|_| {
        let survives = keep.contains(&index);
        index += 1;
        survives
    });
}

/// Derive a conversation title from its first user message: trim, and
/// truncate at a word boundary near [`TITLE_MAX_LEN`].
pub fn derive_title(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "New conversation".to_string();
    }
    if trimmed.chars().count() <= TITLE_MAX_LEN {
        return trimmed.to_string();
    }

    let truncated: String = trimmed.chars().take(TITLE_MAX_LEN).collect();
    match truncated.rfind(' ') {
        // Break on a space only if it falls in the tail of the title;
        // otherwise a hard cut reads better than a one-word title.
        Some(pos) if pos > TITLE_MAX_LEN * 6 / 10 => format!("{}...", &truncated[..pos]),
        _ => format!("{truncated}..."),
    }
}
