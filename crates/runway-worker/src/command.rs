//! Commands sent to the worker thread.

use tokio::sync::oneshot;

use crate::error::WorkerError;
use crate::{WorkerRequest, WorkerResponse};

pub(crate) enum WorkerCommand {
    /// Serve one request and reply with the app's response.
    Fetch {
        request: WorkerRequest,
        reply: oneshot::Sender<Result<WorkerResponse, WorkerError>>,
    },
}
