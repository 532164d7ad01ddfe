//! Inference engine lifecycle management.
//!
//! [`EngineManager`] is a small state machine over a dedicated worker task:
//!
//! | State           | Meaning                                            |
//! |-----------------|----------------------------------------------------|
//! | `Uninitialized` | No worker exists                                   |
//! | `Initializing`  | A worker is loading the model; callers can join    |
//! | `Ready`         | The worker serves chat requests                    |
//! | `Failed`        | The last load failed; the next initialize retries  |
//!
//! Initialization is single-flight: concurrent callers share one load and
//! all observe its outcome. At most one worker exists at any time, and the
//! model is only ever touched from inside that worker task.

mod backend;
mod worker;

pub use backend::{InferenceBackend, LlamaServerBackend};

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::Message;

use worker::{WorkerHandle, WorkerRequest};

/// Model load progress callback, called with values in `0.0..=1.0`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// Produces a fresh backend for each worker the manager spawns.
pub type BackendFactory = Box<dyn Fn() -> Box<dyn InferenceBackend> + Send + Sync>;

type InitOutcome = Option<Result<(), EngineError>>;

enum EngineState {
    Uninitialized,
    Initializing { done: watch::Receiver<InitOutcome> },
    Ready { worker: WorkerHandle },
    Failed,
}

pub struct EngineManager {
    factory: BackendFactory,
    state: Arc<Mutex<EngineState>>,
}

impl EngineManager {
    /// Manager backed by a local llama-server instance.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_factory(Box::new(move || {
            Box::new(LlamaServerBackend::new(config.clone()))
        }))
    }

    pub fn with_factory(factory: BackendFactory) -> Self {
        Self {
            factory,
            state: Arc::new(Mutex::new(EngineState::Uninitialized)),
        }
    }

    /// Bring the engine to the ready state, loading the model if needed.
    ///
    /// Idempotent: when already ready this returns immediately, and while a
    /// load is in flight additional callers wait on that same load rather
    /// than starting another. Only the caller that started the load has its
    /// `on_progress` invoked. A failed load leaves the engine retryable.
    ///
    /// The load itself runs in a spawned task, so a caller dropped
    /// mid-await (timeout, select) does not abandon it: the load still
    /// settles and later callers observe its outcome.
    pub async fn initialize(&self, on_progress: Option<ProgressFn>) -> Result<(), EngineError> {
        let rx = {
            let mut state = self.state.lock().await;
            if matches!(&*state, EngineState::Ready { .. }) {
                return Ok(());
            }
            if let EngineState::Initializing { done } = &*state {
                done.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                *state = EngineState::Initializing { done: rx.clone() };
                let backend = (self.factory)();
                let progress: ProgressFn = on_progress.unwrap_or_else(|| Arc::new(|_| {}));
                tokio::spawn(drive_load(backend, progress, Arc::clone(&self.state), tx));
                rx
            }
        };

        match wait_settled(rx).await {
            Some(outcome) => outcome,
            None => {
                self.recover_abandoned().await;
                Err(EngineError::InitFailed("initialization abandoned".into()))
            }
        }
    }

    /// The load driver died without reporting (task panic). Reset the
    /// state so the engine stays retryable instead of wedged.
    async fn recover_abandoned(&self) {
        let mut state = self.state.lock().await;
        if matches!(&*state, EngineState::Initializing { .. }) {
            warn!("model load abandoned without an outcome, resetting engine state");
            *state = EngineState::Failed;
        }
    }

    /// Stream a chat completion, invoking `on_token` for every output
    /// fragment in generation order, and return the full reply.
    pub async fn stream_chat(
        &self,
        messages: Vec<Message>,
        mut on_token: impl FnMut(&str),
    ) -> Result<String, EngineError> {
        let tx = {
            let state = self.state.lock().await;
            match &*state {
                EngineState::Ready { worker } => worker.sender(),
                _ => return Err(EngineError::NotReady),
            }
        };

        let (delta_tx, mut delta_rx) = mpsc::channel(32);
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(WorkerRequest::Chat {
            messages,
            deltas: delta_tx,
            done: done_tx,
        })
        .await
        .map_err(|_| EngineError::WorkerGone)?;

        let mut reply = String::new();
        while let Some(delta) = delta_rx.recv().await {
            on_token(&delta);
            reply.push_str(&delta);
        }

        match done_rx.await {
            Ok(Ok(())) => Ok(reply),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::WorkerGone),
        }
    }

    /// True when a chat request would be served right now.
    pub async fn is_ready(&self) -> bool {
        matches!(&*self.state.lock().await, EngineState::Ready { .. })
    }

    /// Unload the model and return to the cold state. Never fails.
    ///
    /// If a load is in flight, waits for it to settle first so no worker
    /// escapes the shutdown. Safe to call in any state, repeatedly.
    pub async fn teardown(&self) {
        loop {
            let mut state = self.state.lock().await;
            if let EngineState::Initializing { done } = &*state {
                let rx = done.clone();
                drop(state);
                if wait_settled(rx).await.is_none() {
                    self.recover_abandoned().await;
                }
                continue;
            }
            let prev = std::mem::replace(&mut *state, EngineState::Uninitialized);
            drop(state);
            if let EngineState::Ready { worker } = prev {
                worker.shutdown().await;
                info!("inference engine unloaded");
            }
            return;
        }
    }
}

/// Spawn a worker, drive the model load to completion, record the result
/// in `state`, and broadcast it. Runs detached from the initiating caller.
async fn drive_load(
    backend: Box<dyn InferenceBackend>,
    progress: ProgressFn,
    state: Arc<Mutex<EngineState>>,
    tx: watch::Sender<InitOutcome>,
) {
    let worker = WorkerHandle::spawn(backend);
    let (done_tx, done_rx) = oneshot::channel();
    let loaded = match worker
        .send(WorkerRequest::Init {
            progress,
            done: done_tx,
        })
        .await
    {
        Ok(()) => match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::WorkerGone),
        },
        Err(e) => Err(e),
    };

    let outcome = match loaded {
        Ok(()) => {
            *state.lock().await = EngineState::Ready { worker };
            info!("inference engine ready");
            Ok(())
        }
        Err(e) => {
            // Tear the half-built worker down before reporting, so no
            // stray task outlives the failure.
            worker.shutdown().await;
            *state.lock().await = EngineState::Failed;
            Err(e)
        }
    };
    let _ = tx.send(Some(outcome));
}

/// Wait until a load broadcasts its outcome. `None` means the driver went
/// away without ever reporting.
async fn wait_settled(mut rx: watch::Receiver<InitOutcome>) -> Option<Result<(), EngineError>> {
    loop {
        let current = rx.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        rx.changed().await.ok()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedBackend {
        loads: Arc<AtomicUsize>,
        load_delay: Duration,
        fail_load: bool,
        deltas: Vec<&'static str>,
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        async fn load(&mut self, progress: &ProgressFn) -> Result<(), EngineError> {
            tokio::time::sleep(self.load_delay).await;
            self.loads.fetch_add(1, Ordering::SeqCst);
            progress(1.0);
            if self.fail_load {
                Err(EngineError::InitFailed("model blob missing".into()))
            } else {
                Ok(())
            }
        }

        async fn generate(
            &mut self,
            _messages: &[Message],
            deltas: &mpsc::Sender<String>,
        ) -> Result<(), EngineError> {
            for delta in &self.deltas {
                if deltas.send(delta.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(())
        }

        async fn unload(&mut self) {}
    }

    fn scripted_manager(
        loads: Arc<AtomicUsize>,
        load_delay: Duration,
        deltas: Vec<&'static str>,
    ) -> EngineManager {
        EngineManager::with_factory(Box::new(move || {
            Box::new(ScriptedBackend {
                loads: loads.clone(),
                load_delay,
                fail_load: false,
                deltas: deltas.clone(),
            })
        }))
    }

    #[tokio::test]
    async fn concurrent_initialize_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(scripted_manager(
            loads.clone(),
            Duration::from_millis(50),
            vec![],
        ));

        let a = manager.clone();
        let b = manager.clone();
        let (ra, rb) = tokio::join!(a.initialize(None), b.initialize(None));

        assert!(ra.is_ok());
        assert!(rb.is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn streams_deltas_in_order() {
        let manager = scripted_manager(
            Arc::new(AtomicUsize::new(0)),
            Duration::ZERO,
            vec!["CALL", " 911", " IMMEDIATELY"],
        );
        manager.initialize(None).await.unwrap();

        let mut seen = Vec::new();
        let reply = manager
            .stream_chat(
                vec![Message::new(Role::User, "severe bleeding")],
                |token| seen.push(token.to_string()),
            )
            .await
            .unwrap();

        assert_eq!(seen, vec!["CALL", " 911", " IMMEDIATELY"]);
        assert_eq!(reply, "CALL 911 IMMEDIATELY");
    }

    #[tokio::test]
    async fn chat_before_initialize_is_rejected() {
        let manager = scripted_manager(Arc::new(AtomicUsize::new(0)), Duration::ZERO, vec![]);
        let result = manager
            .stream_chat(vec![Message::new(Role::User, "hello")], |_| {})
            .await;
        assert!(matches!(result, Err(EngineError::NotReady)));
    }

    #[tokio::test]
    async fn failed_load_allows_retry() {
        let loads = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        let loads_for_factory = loads.clone();
        let manager = EngineManager::with_factory(Box::new(move || {
            let first = attempts.fetch_add(1, Ordering::SeqCst) == 0;
            Box::new(ScriptedBackend {
                loads: loads_for_factory.clone(),
                load_delay: Duration::ZERO,
                fail_load: first,
                deltas: vec![],
            })
        }));

        let first = manager.initialize(None).await;
        assert!(matches!(first, Err(EngineError::InitFailed(_))));
        assert!(!manager.is_ready().await);

        manager.initialize(None).await.unwrap();
        assert!(manager.is_ready().await);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn teardown_returns_engine_to_cold_state() {
        let manager = scripted_manager(Arc::new(AtomicUsize::new(0)), Duration::ZERO, vec!["hi"]);
        manager.initialize(None).await.unwrap();
        manager.teardown().await;

        let result = manager
            .stream_chat(vec![Message::new(Role::User, "hello")], |_| {})
            .await;
        assert!(matches!(result, Err(EngineError::NotReady)));

        // A cold engine can be brought back up.
        manager.initialize(None).await.unwrap();
        assert!(manager.is_ready().await);
    }

    #[tokio::test]
    async fn teardown_waits_for_inflight_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(scripted_manager(
            loads.clone(),
            Duration::from_millis(80),
            vec![],
        ));

        let initializer = manager.clone();
        let init = tokio::spawn(async move { initializer.initialize(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.teardown().await;
        assert!(init.await.unwrap().is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(!manager.is_ready().await);
    }

    #[tokio::test]
    async fn aborted_caller_does_not_abandon_the_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(scripted_manager(
            loads.clone(),
            Duration::from_millis(50),
            vec![],
        ));

        let initializer = manager.clone();
        let caller = tokio::spawn(async move { initializer.initialize(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        // The load keeps running without its initiator and still settles.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.is_ready().await);

        manager.initialize(None).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_terminates_after_an_aborted_caller() {
        let manager = Arc::new(scripted_manager(
            Arc::new(AtomicUsize::new(0)),
            Duration::from_millis(50),
            vec![],
        ));

        let initializer = manager.clone();
        let caller = tokio::spawn(async move { initializer.initialize(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        tokio::time::timeout(Duration::from_secs(1), manager.teardown())
            .await
            .expect("teardown terminates");
        assert!(!manager.is_ready().await);
    }

    #[tokio::test]
    async fn teardown_is_safe_when_cold() {
        let manager = scripted_manager(Arc::new(AtomicUsize::new(0)), Duration::ZERO, vec![]);
        manager.teardown().await;
        manager.teardown().await;
    }

    #[tokio::test]
    async fn lead_caller_receives_progress() {
        let manager = scripted_manager(Arc::new(AtomicUsize::new(0)), Duration::ZERO, vec![]);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager
            .initialize(Some(Arc::new(move |p| sink.lock().unwrap().push(p))))
            .await
            .unwrap();
        assert!(seen.lock().unwrap().contains(&1.0));
    }
}
