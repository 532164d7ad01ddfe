//! Ties the subsystems together into one ask-and-answer flow.
//!
//! For each user turn: pull relevant cached knowledge, fold it into the
//! system prompt, send the running conversation to the engine, stream the
//! reply back, and record both turns in history. A dead knowledge cache
//! degrades to answering without reference material instead of failing.

use std::sync::Arc;

use tracing::warn;

use crate::config::Config;
use crate::engine::EngineManager;
use crate::error::EngineError;
use crate::history::HistoryStore;
use crate::models::{Message, Role};
use crate::retrieve::retrieve;
use crate::store::EntryStore;

pub struct Assistant {
    store: Arc<dyn EntryStore>,
    engine: Arc<EngineManager>,
    history: HistoryStore,
    system_prompt: String,
    budget_chars: usize,
}

impl Assistant {
    pub fn new(
        store: Arc<dyn EntryStore>,
        engine: Arc<EngineManager>,
        history: HistoryStore,
        config: &Config,
    ) -> Self {
        Self {
            store,
            engine,
            history,
            system_prompt: config.engine.system_prompt.clone(),
            budget_chars: config.retrieval.budget_chars,
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Answer one user turn, streaming fragments through `on_token`.
    ///
    /// The user message is recorded before generation, so it survives in
    /// history even when the engine errors out.
    pub async fn answer(
        &self,
        user_text: &str,
        on_token: impl FnMut(&str),
    ) -> Result<String, EngineError> {
        let context = match self.store.get_all().await {
            Ok(entries) => retrieve(&entries, user_text, self.budget_chars),
            Err(e) => {
                warn!("knowledge cache unavailable, answering without reference material: {e}");
                String::new()
            }
        };

        self.history
            .append_message(Message::new(Role::User, user_text), None);

        let mut transcript = vec![Message::new(Role::System, self.compose_system(&context))];
        transcript.extend(self.history.current_messages());

        let reply = self.engine.stream_chat(transcript, on_token).await?;
        self.history
            .append_message(Message::new(Role::Assistant, reply.clone()), None);
        Ok(reply)
    }

    fn compose_system(&self, context: &str) -> String {
        if context.is_empty() {
            return self.system_prompt.clone();
        }
        format!("{}\n\nReference material:\n{context}", self.system_prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbConfig, EngineConfig, HistoryConfig, RetrievalConfig, SyncConfig};
    use crate::engine::InferenceBackend;
    use crate::error::StoreError;
    use crate::models::Entry;
    use crate::store::MemoryEntryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Backend that records the transcript it was asked about and replies
    /// with fixed fragments.
    struct EchoBackend {
        seen: Arc<Mutex<Vec<Vec<Message>>>>,
        deltas: Vec<&'static str>,
    }

    #[async_trait]
    impl InferenceBackend for EchoBackend {
        async fn load(&mut self, _progress: &crate::engine::ProgressFn) -> Result<(), EngineError> {
            Ok(())
        }

        async fn generate(
            &mut self,
            messages: &[Message],
            deltas: &mpsc::Sender<String>,
        ) -> Result<(), EngineError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            for delta in &self.deltas {
                let _ = deltas.send(delta.to_string()).await;
            }
            Ok(())
        }

        async fn unload(&mut self) {}
    }

    struct BrokenStore;

    #[async_trait]
    impl EntryStore for BrokenStore {
        async fn get_all(&self) -> Result<Vec<Entry>, StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }

        async fn upsert_many(&self, _entries: &[Entry]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }

        async fn meta_version(&self, _source: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }

        async fn set_meta_version(&self, _source: &str, _version: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }
    }

    fn engine_with(
        seen: Arc<Mutex<Vec<Vec<Message>>>>,
        deltas: Vec<&'static str>,
    ) -> Arc<EngineManager> {
        Arc::new(EngineManager::with_factory(Box::new(move || {
            Box::new(EchoBackend {
                seen: seen.clone(),
                deltas: deltas.clone(),
            })
        })))
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            db: DbConfig {
                path: dir.path().join("kit.db"),
            },
            sync: SyncConfig::default(),
            retrieval: RetrievalConfig::default(),
            history: HistoryConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    async fn assistant_with(
        store: Arc<dyn EntryStore>,
        seen: Arc<Mutex<Vec<Vec<Message>>>>,
        dir: &tempfile::TempDir,
    ) -> Assistant {
        let config = test_config(dir);
        let engine = engine_with(seen, vec!["Cool it", " under running water."]);
        engine.initialize(None).await.unwrap();
        let history = HistoryStore::open_file(
            &dir.path().join("history.json"),
            config.history.clone(),
        );
        Assistant::new(store, engine, history, &config)
    }

    #[tokio::test]
    async fn folds_relevant_context_into_the_system_prompt() {
        let store = Arc::new(MemoryEntryStore::new());
        store
            .upsert_many(&[Entry {
                id: "burns".into(),
                content: "## burns\nRelated terms: burn, scald\nCool under water.".into(),
                version: "1".into(),
                updated_at: 0,
            }])
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let dir = tempfile::tempdir().unwrap();
        let assistant = assistant_with(store, seen.clone(), &dir).await;

        let reply = assistant.answer("I burned my hand", |_| {}).await.unwrap();
        assert_eq!(reply, "Cool it under running water.");

        let transcripts = seen.lock().unwrap();
        let system = &transcripts[0][0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.contains("Reference material:"));
        assert!(system.content.contains("## burns"));
        let last = transcripts[0].last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(last.content, "I burned my hand");
    }

    #[tokio::test]
    async fn records_both_turns_in_history() {
        let store = Arc::new(MemoryEntryStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dir = tempfile::tempdir().unwrap();
        let assistant = assistant_with(store, seen, &dir).await;

        assistant.answer("I burned my hand", |_| {}).await.unwrap();

        let messages = assistant.history().current_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Cool it under running water.");
    }

    #[tokio::test]
    async fn broken_cache_degrades_to_no_reference_material() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dir = tempfile::tempdir().unwrap();
        let assistant = assistant_with(Arc::new(BrokenStore), seen.clone(), &dir).await;

        let reply = assistant.answer("help", |_| {}).await.unwrap();
        assert!(!reply.is_empty());

        let transcripts = seen.lock().unwrap();
        assert!(!transcripts[0][0].content.contains("Reference material:"));
    }

    #[tokio::test]
    async fn follow_up_turns_carry_the_conversation() {
        let store = Arc::new(MemoryEntryStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dir = tempfile::tempdir().unwrap();
        let assistant = assistant_with(store, seen.clone(), &dir).await;

        assistant.answer("first question", |_| {}).await.unwrap();
        assistant.answer("second question", |_| {}).await.unwrap();

        let transcripts = seen.lock().unwrap();
        // System prompt + first exchange + the new user turn.
        assert_eq!(transcripts[1].len(), 4);
        assert_eq!(transcripts[1][1].content, "first question");
        assert_eq!(transcripts[1][3].content, "second question");
    }
}
