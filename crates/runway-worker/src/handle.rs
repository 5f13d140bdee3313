//! Host-side handle to a worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::command::WorkerCommand;
use crate::error::WorkerError;
use crate::{WorkerRequest, WorkerResponse};

/// Handle to a spawned worker.
///
/// Dropping the handle terminates the worker but does not wait for the
/// thread; call [`WorkerHandle::join`] from a blocking context for that.
pub struct WorkerHandle {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) cmd_tx: mpsc::Sender<WorkerCommand>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) terminated: Arc<AtomicBool>,
    pub(crate) timeout: Duration,
    pub(crate) thread_handle: std::sync::Mutex<Option<thread::JoinHandle<Result<(), WorkerError>>>>,
}

impl WorkerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a request to the app and wait for its response.
    ///
    /// Fails with `Timeout` when the app takes longer than the configured
    /// per-request timeout and with `Terminated` when the worker goes away
    /// while the request is in flight.
    pub async fn fetch(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        if self.is_terminated() {
            return Err(WorkerError::Terminated);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::Fetch {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| WorkerError::Terminated)?;

        if self.timeout.is_zero() {
            return reply_rx.await.map_err(|_| WorkerError::Terminated)?;
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(reply) => reply.map_err(|_| WorkerError::Terminated)?,
            Err(_) => Err(WorkerError::Timeout(self.timeout)),
        }
    }

    /// Signal the worker thread to shut down. Idempotent.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Wait for the worker thread to finish. Blocks the calling thread.
    pub fn join(&self) -> Result<(), WorkerError> {
        let handle = match self.thread_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.join().map_err(|_| WorkerError::ThreadPanic)??;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
