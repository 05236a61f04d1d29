// src/sandbox.rs
//
// =============================================================================
// CRUCIBLE: SANDBOX DRIVER
// =============================================================================
//
// The narrow seam over the container runtime. The engine only ever talks to
// `SandboxRuntime`; `DockerRuntime` implements it against the local Docker
// daemon via bollard, except for `attach`: that endpoint hijacks the HTTP
// connection into a raw byte stream, so it is spoken directly on the
// runtime's unix socket and handed to the demultiplexer untouched.
//
// Failure policy:
// - create/upload/start/wait errors propagate to the supervisor.
// - kill/remove are best-effort; callers log, never abort, on error.

use crate::demux::AttachStream;
use crate::monitor::{StatsFrame, StatsStream};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, Stats, StatsOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::io::ReaderStream;

/// Label key carrying the project tag; the sweeper removes by it.
pub const LABEL_PROJECT: &str = "project";
/// Label key carrying the owning job id.
pub const LABEL_JOB_ID: &str = "jobId";

// ============================================================================
// 1. THE RUNTIME CONTRACT
// ============================================================================

/// What a sandbox is made of. `auto_remove` is deliberately not a knob:
/// sandboxes are always created without it so removal stays an explicit,
/// observable step even after failures.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub memory_bytes: i64,
    pub cpu_weight: i64,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Provision a sandbox; returns the runtime handle.
    async fn create(&self, spec: &SandboxSpec) -> Result<String>;

    /// Extract a tar archive into the sandbox filesystem at `path`.
    async fn upload(&self, id: &str, archive: Vec<u8>, path: &str) -> Result<()>;

    /// Open the multiplexed output stream. Must be called before `start`
    /// so the first bytes are captured.
    async fn attach(&self, id: &str) -> Result<AttachStream>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Live statistics frames until the sandbox stops.
    async fn stats(&self, id: &str) -> Result<StatsStream>;

    /// Block until the sandbox exits; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Best-effort terminate. The sandbox may already be dead.
    async fn kill(&self, id: &str) -> Result<()>;

    /// Idempotent removal of the sandbox and its resources.
    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    /// Handles of every sandbox carrying `key=value`.
    async fn list_labeled(&self, key: &str, value: &str) -> Result<Vec<String>>;
}

// ============================================================================
// 2. DOCKER IMPLEMENTATION
// ============================================================================

pub struct DockerRuntime {
    docker: Docker,
    socket_path: PathBuf,
}

impl DockerRuntime {
    pub fn connect(socket_path: &str) -> Result<Self> {
        let docker = Docker::connect_with_socket(socket_path, 120, API_DEFAULT_VERSION)
            .with_context(|| format!("failed to connect to container runtime at {socket_path}"))?;
        Ok(Self {
            docker,
            socket_path: PathBuf::from(socket_path),
        })
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes),
                cpu_shares: Some(spec.cpu_weight),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .context("sandbox create failed")?;
        Ok(created.id)
    }

    async fn upload(&self, id: &str, archive: Vec<u8>, path: &str) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), Bytes::from(archive))
            .await
            .context("sandbox upload failed")
    }

    async fn attach(&self, id: &str) -> Result<AttachStream> {
        let sock = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "failed to open runtime socket {}",
                    self.socket_path.display()
                )
            })?;
        let request = format!(
            "POST /containers/{id}/attach?stream=1&stdout=1&stderr=1 HTTP/1.1\r\n\
             Host: docker\r\n\
             Connection: Upgrade\r\n\
             Upgrade: tcp\r\n\
             Content-Length: 0\r\n\
             \r\n"
        );
        hijacked_stream(sock, &request).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .context("sandbox start failed")
    }

    async fn stats(&self, id: &str) -> Result<StatsStream> {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };
        let stream = self
            .docker
            .stats(id, Some(options))
            .map(|item| item.map(stats_to_frame).map_err(anyhow::Error::from))
            .boxed();
        Ok(stream)
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // A non-zero exit is a result, not a transport failure.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e).context("sandbox wait failed"),
            None => bail!("runtime closed the wait stream before an exit code arrived"),
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .context("sandbox kill failed")
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .context("sandbox remove failed")
    }

    async fn list_labeled(&self, key: &str, value: &str) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{key}={value}")]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("sandbox list failed")?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

fn stats_to_frame(stats: Stats) -> StatsFrame {
    StatsFrame {
        cpu_total_ns: Some(stats.cpu_stats.cpu_usage.total_usage),
        precpu_total_ns: Some(stats.precpu_stats.cpu_usage.total_usage),
        system_cpu_ns: stats.cpu_stats.system_cpu_usage,
        presystem_cpu_ns: stats.precpu_stats.system_cpu_usage,
        online_cpus: stats.cpu_stats.online_cpus,
        memory_usage_bytes: stats.memory_stats.usage,
    }
}

// ============================================================================
// 3. HIJACKED ATTACH PLUMBING
// ============================================================================

/// Issue the attach request and hand back everything after the response
/// head as a raw byte stream. The daemon answers 101 (upgrade honored) or
/// 200 (older daemons) and then abandons HTTP on this connection; bytes
/// already read past the head belong to the stream and are re-emitted
/// first.
async fn hijacked_stream<S>(mut sock: S, request: &str) -> Result<AttachStream>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    sock.write_all(request.as_bytes())
        .await
        .context("failed to send attach request")?;

    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 256];
    loop {
        let n = sock
            .read(&mut chunk)
            .await
            .context("failed to read attach response")?;
        if n == 0 {
            bail!("runtime closed the connection during attach");
        }
        head.extend_from_slice(&chunk[..n]);

        if let Some(end) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            let status = parse_status_line(&head)?;
            if status != 101 && status != 200 {
                bail!("attach rejected by runtime: HTTP {status}");
            }
            let leftover = head.split_off(end + 4);
            let first = futures::stream::iter(
                (!leftover.is_empty()).then(|| Ok(Bytes::from(leftover))),
            );
            return Ok(first.chain(ReaderStream::new(sock)).boxed());
        }
        if head.len() > 16 * 1024 {
            bail!("attach response head exceeded 16 KiB");
        }
    }
}

fn parse_status_line(head: &[u8]) -> Result<u16> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end]).context("attach status line not UTF-8")?;
    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .with_context(|| format!("malformed attach status line: {line:?}"))
}

// ============================================================================
// TESTS
// ============================================================================
