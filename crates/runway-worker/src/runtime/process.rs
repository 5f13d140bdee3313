//! Child-process runtime.
//!
//! Runs the app entrypoint as a separate process listening on a private
//! loopback port and proxies every request to it.

use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header;
use tokio::process::{Child, Command};

use super::AppRuntime;
use crate::error::WorkerError;
use crate::{WorkerRequest, WorkerResponse, WorkerSpec};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct ProcessRuntime {
    name: String,
    origin: String,
    client: reqwest::Client,
    child: RefCell<Option<Child>>,
}

impl ProcessRuntime {
    /// Install dependencies if needed, start the entrypoint and wait until
    /// it accepts connections.
    pub async fn start(spec: &WorkerSpec, entrypoint: &str) -> Result<Self, WorkerError> {
        if spec.auto_install {
            install_dependencies(spec).await?;
        }

        let port = free_port()?;
        let mut command = build_command(spec, entrypoint);
        command
            .current_dir(&spec.dir)
            .env("PORT", port.to_string())
            .env("HOST", Ipv4Addr::LOCALHOST.to_string())
            .env("APP_DIR", &spec.dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            WorkerError::Startup(format!("failed to run '{}': {}", entrypoint, e))
        })?;

        tracing::info!(
            "[{}] Started '{}' (pid {:?}) on port {}",
            spec.name,
            entrypoint,
            child.id(),
            port
        );

        if let Err(e) = wait_until_listening(&mut child, port, spec.startup_timeout).await {
            let _ = child.start_kill();
            return Err(e);
        }

        Ok(Self {
            name: spec.name.clone(),
            origin: format!("http://{}:{}", Ipv4Addr::LOCALHOST, port),
            client: reqwest::Client::new(),
            child: RefCell::new(Some(child)),
        })
    }
}

#[async_trait(?Send)]
impl AppRuntime for ProcessRuntime {
    async fn handle(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.origin, path);

        let mut headers = parts.headers;
        headers.remove(header::HOST);

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| WorkerError::App(e.to_string()))?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream
            .bytes()
            .await
            .map_err(|e| WorkerError::App(e.to_string()))?;

        let mut response = http::Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response.headers_mut().remove(header::TRANSFER_ENCODING);
        Ok(response)
    }

    async fn shutdown(&self) {
        let child = self.child.borrow_mut().take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!("[{}] Process exited: {}", self.name, status),
                Ok(Err(e)) => tracing::warn!("[{}] Failed to reap process: {}", self.name, e),
                Err(_) => tracing::warn!("[{}] Process did not exit in time", self.name),
            }
        }
    }
}

fn build_command(spec: &WorkerSpec, entrypoint: &str) -> Command {
    match spec.launcher.split_first() {
        Some((program, args)) => {
            let mut command = Command::new(program);
            command.args(args).arg(entrypoint);
            command
        }
        None => Command::new(spec.dir.join(entrypoint)),
    }
}

async fn install_dependencies(spec: &WorkerSpec) -> Result<(), WorkerError> {
    let has_manifest = tokio::fs::metadata(spec.dir.join("package.json")).await.is_ok();
    let installed = tokio::fs::metadata(spec.dir.join("node_modules")).await.is_ok();
    if !has_manifest || installed {
        return Ok(());
    }

    let Some((program, args)) = spec.install_command.split_first() else {
        return Ok(());
    };

    tracing::info!("[{}] Installing dependencies", spec.name);
    let status = Command::new(program)
        .args(args)
        .current_dir(&spec.dir)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| WorkerError::Startup(format!("failed to run '{}': {}", program, e)))?;

    if !status.success() {
        return Err(WorkerError::Startup(format!(
            "dependency install failed with {}",
            status
        )));
    }
    Ok(())
}

fn free_port() -> Result<u16, WorkerError> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    Ok(listener.local_addr()?.port())
}

async fn wait_until_listening(
    child: &mut Child,
    port: u16,
    timeout: Duration,
) -> Result<(), WorkerError> {
    let deadline = Instant::now() + timeout;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    loop {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }

        if let Some(status) = child.try_wait()? {
            return Err(WorkerError::Startup(format!(
                "process exited before listening ({})",
                status
            )));
        }

        if Instant::now() >= deadline {
            return Err(WorkerError::Startup(format!(
                "process did not listen on port {} within {:?}",
                port, timeout
            )));
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
