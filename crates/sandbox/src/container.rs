//! Container sandbox variant: a long-lived, pre-warmed container built from
//! a fixed base image. Capabilities dropped, process count and memory/CPU
//! capped, only the workspace and tools directories bind-mounted.

use crate::executor::{
    ExecuteOptions, ExecuteResult, Executor, ExecutorError, ExecutorHealth, ExecutorKind,
};
use crate::ExecutorConfig;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use std::time::{Duration, Instant};
use tokio::time::timeout as tokio_timeout;

const CONTAINER_NAME: &str = "flatline-sandbox";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Docker-backed executor. Grounded on the connection and image-pull
/// handling pattern used by container-runtime infrastructure elsewhere in
/// the agent-orchestration space: auto-detect the daemon, surface an
/// actionable error if it isn't reachable, and treat a missing image as a
/// recoverable pull rather than a hard failure.
pub struct ContainerExecutor {
    docker: Docker,
    cfg: ExecutorConfig,
    last_reset: SyncMutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl ContainerExecutor {
    /// Probe for a reachable Docker daemon and, if found, ensure the
    /// sandbox container is running (creating it if necessary).
    pub async fn connect(cfg: ExecutorConfig) -> Result<Self, ExecutorError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutorError::BoundaryGone(format!("docker unreachable: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| ExecutorError::BoundaryGone(format!("docker ping failed: {e}")))?;

        let exec = Self {
            docker,
            cfg,
            last_reset: SyncMutex::new(None),
        };
        exec.ensure_running().await?;
        Ok(exec)
    }

    async fn ensure_running(&self) -> Result<(), ExecutorError> {
        let exists = self.docker.inspect_container(CONTAINER_NAME, None).await;
        match exists {
            Ok(info) if info.state.and_then(|s| s.running).unwrap_or(false) => Ok(()),
            Ok(_) => self.start_existing().await,
            Err(_) => self.create_and_start().await,
        }
    }

    async fn start_existing(&self) -> Result<(), ExecutorError> {
        self.docker
            .start_container(CONTAINER_NAME, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ExecutorError::ResetFailed(format!("start failed: {e}")))
    }

    async fn create_and_start(&self) -> Result<(), ExecutorError> {
        let host_config = HostConfig {
            binds: Some(vec![
                format!("{}:/workspace", self.cfg.workspace_dir.display()),
                format!("{}:/tools", self.cfg.tools_dir.display()),
            ]),
            cap_drop: Some(vec!["ALL".into()]),
            memory: Some(self.cfg.memory_limit_bytes as i64),
            nano_cpus: Some(self.cfg.cpu_limit_nanos as i64),
            pids_limit: Some(self.cfg.process_limit as i64),
            network_mode: Some("bridge".into()),
            ..Default::default()
        };
        let proxy = format!("http://{}", self.cfg.egress_proxy_addr);
        let config = ContainerConfig {
            image: Some(self.cfg.base_image.clone()),
            cmd: Some(vec!["sleep".into(), "infinity".into()]),
            env: Some(vec![
                format!("HTTP_PROXY={proxy}"),
                format!("HTTPS_PROXY={proxy}"),
            ]),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: CONTAINER_NAME,
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ExecutorError::ResetFailed(format!("create failed: {e}")))?;
        self.start_existing().await?;
        self.bootstrap().await
    }

    /// Run `setup.sh` and the package-list install from the tools
    /// directory. Both are version-controlled alongside tool descriptors,
    /// so a sandbox reset reproduces the exact environment the agent last
    /// committed.
    async fn bootstrap(&self) -> Result<(), ExecutorError> {
        let setup = "test -x /tools/setup.sh && /tools/setup.sh || true";
        self.run_raw(setup, DEFAULT_TIMEOUT).await?;
        let packages = "test -f /tools/packages.txt && xargs -a /tools/packages.txt pip install || true";
        self.run_raw(packages, DEFAULT_TIMEOUT).await?;
        Ok(())
    }

    async fn run_raw(&self, command: &str, timeout: Duration) -> Result<ExecuteResult, ExecutorError> {
        let wrapped = format!(
            "timeout {}s sh -c {}",
            timeout.as_secs(),
            shell_quote(command)
        );
        let exec = self
            .docker
            .create_exec(
                CONTAINER_NAME,
                CreateExecOptions {
                    cmd: Some(vec!["sh".into(), "-c".into(), wrapped]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ExecutorError::BoundaryGone(format!("exec create failed: {e}")))?;

        let started = Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ExecutorError::BoundaryGone(format!("exec start failed: {e}")))?
        {
            while let Some(Ok(chunk)) = output.next().await {
                match chunk {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ExecutorError::BoundaryGone(format!("exec inspect failed: {e}")))?;
        let exit_code = inspect.exit_code.map(|c| c as i32);
        let timed_out = exit_code == Some(124); // `timeout`'s own sentinel exit code.

        Ok(ExecuteResult {
            exit_code,
            stdout,
            stderr,
            wall_time: started.elapsed(),
            timed_out,
        })
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[async_trait]
impl Executor for ContainerExecutor {
    async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<ExecuteResult, ExecutorError> {
        let inner_timeout = options.timeout.unwrap_or(DEFAULT_TIMEOUT);
        // The outer timer is generously larger so the inner `timeout`
        // wrapper reports a normal result in the common case; it only
        // fires if the boundary itself has wedged.
        let outer_timeout = inner_timeout + self.cfg.outer_timeout_grace;

        match tokio_timeout(outer_timeout, self.run_raw(command, inner_timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::BoundaryGone(
                "outer timeout exceeded, sandbox may be wedged".into(),
            )),
        }
    }

    async fn health_check(&self) -> ExecutorHealth {
        let alive = self.docker.ping().await.is_ok();
        ExecutorHealth {
            kind: ExecutorKind::Container,
            alive,
            last_reset_time: *self.last_reset.lock(),
        }
    }

    async fn reset(&self) -> Result<(), ExecutorError> {
        let _ = self
            .docker
            .stop_container(CONTAINER_NAME, None::<StopContainerOptions>)
            .await;
        self.docker
            .remove_container(
                CONTAINER_NAME,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ExecutorError::ResetFailed(format!("remove failed: {e}")))?;
        self.create_and_start().await?;
        *self.last_reset.lock() = Some(chrono::Utc::now());
        Ok(())
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Container
    }
}
