//! Worker spawn function.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, oneshot, watch};

use crate::error::WorkerError;
use crate::handle::WorkerHandle;
use crate::worker::run_worker;
use crate::WorkerSpec;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Spawn a worker thread for one app version.
///
/// Resolves once the app runtime inside the thread is ready to serve, or
/// with the error that prevented it from starting.
pub async fn spawn_worker(spec: WorkerSpec) -> Result<WorkerHandle, WorkerError> {
    let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}#{}", spec.name, id);
    tracing::debug!("[spawn_worker] Starting {} for {}", name, spec.dir.display());

    let terminated = Arc::new(AtomicBool::new(false));
    let terminated_clone = terminated.clone();

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (init_tx, init_rx) = oneshot::channel::<Result<(), WorkerError>>();

    let timeout = spec.timeout;
    let thread_name = name.clone();
    let thread_handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || -> Result<(), WorkerError> {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let err = WorkerError::from(e);
                    let _ = init_tx.send(Err(err.clone()));
                    return Err(err);
                }
            };

            let local = tokio::task::LocalSet::new();
            let result = local.block_on(
                &rt,
                run_worker(spec, cmd_rx, shutdown_rx, terminated_clone.clone(), init_tx),
            );

            terminated_clone.store(true, Ordering::SeqCst);
            drop(local);
            rt.shutdown_background();
            tracing::debug!("[spawn_worker:{}] Thread exiting", thread_name);
            result
        })?;

    match init_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = thread_handle.join();
            return Err(e);
        }
        Err(_) => {
            let _ = thread_handle.join();
            return Err(WorkerError::ThreadPanic);
        }
    }

    tracing::debug!("[spawn_worker] {} is ready", name);

    Ok(WorkerHandle {
        id,
        name,
        cmd_tx,
        shutdown_tx,
        terminated,
        timeout,
        thread_handle: std::sync::Mutex::new(Some(thread_handle)),
    })
}
