//! Worker thread implementation.
//!
//! This is the loop that runs inside the spawned thread: it boots the app
//! runtime, then serves commands until shutdown is signalled or the host
//! drops its handle.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::command::WorkerCommand;
use crate::error::WorkerError;
use crate::runtime::{self, AppRuntime};
use crate::WorkerSpec;

pub(crate) async fn run_worker(
    spec: WorkerSpec,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
    terminated: Arc<AtomicBool>,
    init_tx: oneshot::Sender<Result<(), WorkerError>>,
) -> Result<(), WorkerError> {
    let name = spec.name.clone();

    let app: Rc<dyn AppRuntime> = match runtime::create(&spec).await {
        Ok(app) => Rc::from(app),
        Err(e) => {
            tracing::debug!("[run_worker:{}] Startup failed: {}", name, e);
            let _ = init_tx.send(Err(e.clone()));
            return Err(e);
        }
    };

    if init_tx.send(Ok(())).is_err() {
        // Host gave up waiting.
        app.shutdown().await;
        return Ok(());
    }

    loop {
        if *shutdown_rx.borrow() || terminated.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("[run_worker:{}] Received shutdown signal", name);
                    break;
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("[run_worker:{}] Command channel closed", name);
                    break;
                };

                match cmd {
                    WorkerCommand::Fetch { request, reply } => {
                        let app = app.clone();
                        tokio::task::spawn_local(async move {
                            let result = app.handle(request).await;
                            let _ = reply.send(result);
                        });
                    }
                }
            }
        }
    }

    app.shutdown().await;
    Ok(())
}
