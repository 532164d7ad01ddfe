//! The inference worker task.
//!
//! The worker exclusively owns its [`InferenceBackend`]; every interaction
//! with the model crosses an mpsc channel as a [`WorkerRequest`]. Dropping
//! the handle closes the channel, which makes the worker unload and exit.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::models::Message;

use super::backend::InferenceBackend;
use super::ProgressFn;

/// Requests the engine manager sends to the worker task.
pub(super) enum WorkerRequest {
    /// Load the model, reporting progress through the provided callback.
    Init {
        progress: ProgressFn,
        done: oneshot::Sender<Result<(), EngineError>>,
    },
    /// Generate a streamed reply to a full message transcript.
    Chat {
        messages: Vec<Message>,
        deltas: mpsc::Sender<String>,
        done: oneshot::Sender<Result<(), EngineError>>,
    },
    /// Unload the model and exit the task.
    Unload,
}

pub(super) struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub(super) fn spawn(backend: Box<dyn InferenceBackend>) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let join = tokio::spawn(run(backend, rx));
        Self { tx, join }
    }

    pub(super) fn sender(&self) -> mpsc::Sender<WorkerRequest> {
        self.tx.clone()
    }

    pub(super) async fn send(&self, request: WorkerRequest) -> Result<(), EngineError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::WorkerGone)
    }

    /// Ask the worker to unload and wait for the task to finish.
    pub(super) async fn shutdown(self) {
        if self.tx.send(WorkerRequest::Unload).await.is_err() {
            debug!("worker already gone at shutdown");
        }
        drop(self.tx);
        if let Err(e) = self.join.await {
            warn!("worker task ended abnormally: {e}");
        }
    }
}

async fn run(mut backend: Box<dyn InferenceBackend>, mut rx: mpsc::Receiver<WorkerRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            WorkerRequest::Init { progress, done } => {
                let result = backend.load(&progress).await;
                let _ = done.send(result);
            }
            WorkerRequest::Chat {
                messages,
                deltas,
                done,
            } => {
                let result = backend.generate(&messages, &deltas).await;
                let _ = done.send(result);
            }
            WorkerRequest::Unload => break,
        }
    }
    backend.unload().await;
    debug!("inference worker exited");
}
