/// Docker-backed sandbox
///
/// **Execution Rules:**
/// 1. Pulls the language image if it is not cached
/// 2. Creates a container with network disabled and CPU/memory limits
/// 3. Writes the source, compiles or syntax-checks it when the language asks for it
/// 4. Runs the program with the test input on stdin and captures stdout/stderr
/// 5. Removes the container on every path, including cancellation (drop guard)
use super::{Sandbox, SandboxError, SandboxOutput};
use crate::language::{LanguageConfig, LanguageRegistry};
use anyhow::{bail, Context, Result};
use arbiter_common::types::Language;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Safety limits to prevent pathological inputs from reaching Docker
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB

const WORK_DIR: &str = "/code";

/// Container cleanup guard - guarantees container removal on drop.
/// Dropping the execute future (timeout or cancellation) still removes the container.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);

        // Drop cannot be async; hand the removal to the runtime if there is one.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let options = RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };
                if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                    warn!(container_id = %container_id, error = %e, "Failed to remove container");
                }
            });
        }
    }
}

pub struct DockerSandbox {
    docker: Docker,
    languages: Arc<LanguageRegistry>,
}

impl DockerSandbox {
    pub fn connect(languages: Arc<LanguageRegistry>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self { docker, languages })
    }

    /// Verify the image is cached locally, pulling it on a miss
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }
        info!(image, "Image pulled");
        Ok(())
    }

    /// Create and start an idle container for one run
    async fn start_container(&self, config: &LanguageConfig) -> Result<ContainerGuard> {
        let name = format!("arbiter-{}", uuid::Uuid::new_v4());
        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 300".to_string()]),
            entrypoint: Some(vec![]),
            network_disabled: Some(true),
            working_dir: Some(WORK_DIR.to_string()),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(i64::from(config.memory_limit_mb) * 1024 * 1024),
                nano_cpus: Some((f64::from(config.cpu_limit) * 1_000_000_000.0) as i64),
                readonly_rootfs: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions { name: name.as_str(), platform: None }),
                container_config,
            )
            .await
            .context("Failed to create container")?;

        let guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container.id,
        };

        self.docker
            .start_container(&guard.container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start container")?;

        Ok(guard)
    }

    /// Run a shell command inside the container and collect its output and exit code
    async fn exec(
        &self,
        container_id: &str,
        command: String,
    ) -> Result<(String, String, Option<i64>)> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let started = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions { detach: false, ..Default::default() }))
            .await
            .context("Failed to start exec")?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        match started {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg.context("Failed to read exec output")? {
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
            StartExecResults::Detached => bail!("Exec unexpectedly detached"),
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok((stdout, stderr, inspect.exit_code))
    }

    async fn write_source(
        &self,
        container_id: &str,
        config: &LanguageConfig,
        code: &str,
    ) -> Result<()> {
        let encoded = general_purpose::STANDARD.encode(code);
        let command = format!("echo '{}' | base64 -d > {}", encoded, config.source_file);
        let (_, stderr, exit_code) = self.exec(container_id, command).await?;
        if exit_code != Some(0) {
            bail!("Failed to write source code: {}", stderr.trim());
        }
        Ok(())
    }
}

fn unavailable(e: anyhow::Error) -> SandboxError {
    SandboxError::Unavailable(format!("{:#}", e))
}

#[async_trait]
impl Sandbox for DockerSandbox {
    #[tracing::instrument(
        skip(self, code, stdin),
        fields(language = %language, timeout_ms = timeout_ms)
    )]
    async fn execute(
        &self,
        code: &str,
        language: Language,
        stdin: &str,
        timeout_ms: u64,
    ) -> Result<SandboxOutput, SandboxError> {
        if code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(SandboxError::CompileError(format!(
                "Source code exceeds maximum size of {} bytes",
                MAX_SOURCE_CODE_BYTES
            )));
        }
        if stdin.len() > MAX_TEST_INPUT_BYTES {
            return Err(SandboxError::RuntimeError {
                message: format!(
                    "Test input exceeds maximum size of {} bytes",
                    MAX_TEST_INPUT_BYTES
                ),
                stdout: String::new(),
                exit_code: None,
            });
        }

        let config = self.languages.get(language).ok_or_else(|| {
            SandboxError::Unavailable(format!("no image configured for {}", language))
        })?;

        self.ensure_image(&config.image).await.map_err(unavailable)?;
        let container = self.start_container(config).await.map_err(unavailable)?;
        let container_id = container.container_id.clone();
        self.write_source(&container_id, config, code).await.map_err(unavailable)?;

        if let Some(compile) = &config.compile_command {
            let compile_started = Instant::now();
            let (out, err, exit_code) = self
                .exec(&container_id, format!("{} 2>&1", compile))
                .await
                .map_err(unavailable)?;
            if exit_code != Some(0) {
                warn!(
                    compile_ms = compile_started.elapsed().as_millis() as u64,
                    error_preview = out.lines().next().unwrap_or(""),
                    "Compilation failed"
                );
                let diagnostic = if out.trim().is_empty() { err } else { out };
                return Err(SandboxError::CompileError(diagnostic));
            }
            debug!(
                compile_ms = compile_started.elapsed().as_millis() as u64,
                "Compilation succeeded"
            );
        }

        let encoded_input = general_purpose::STANDARD.encode(stdin);
        let run = format!("echo '{}' | base64 -d | {}", encoded_input, config.run_command);

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.exec(&container_id, run),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // Container removal happens in the guard's drop
        drop(container);

        match result {
            Err(_) => Err(SandboxError::Timeout),
            Ok(Err(e)) => Err(unavailable(e)),
            Ok(Ok((stdout, stderr, Some(0)))) => Ok(SandboxOutput {
                stdout,
                stderr,
                exit_code: 0,
                duration_ms,
            }),
            Ok(Ok((stdout, mut stderr, exit_code))) => {
                match exit_code {
                    Some(137) => stderr.push_str("\n[Killed: likely exceeded memory limit]"),
                    Some(139) => stderr.push_str("\n[Killed: segmentation fault]"),
                    _ => {}
                }
                Err(SandboxError::RuntimeError { message: stderr, stdout, exit_code })
            }
        }
    }
}
