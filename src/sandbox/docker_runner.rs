use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, HostConfigLogConfig};
use bollard::query_parameters::{
    AttachContainerOptions, CreateContainerOptions, CreateImageOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use futures_util::stream::{Stream, StreamExt};
use parking_lot::Mutex;

use super::{
    CompileOutcome, OutputBuffers, RunOutcome, SandboxError, SandboxRunner, signal_from_exit_code,
};
use crate::config::ExecutorConfig;
use crate::language::LanguageProfile;
use crate::workspace::Workspace;

// Every container we create carries this label so leftovers can be found again
const MANAGED_LABEL: &str = "codexec.managed";
const CONTAINER_NAME_PREFIX: &str = "codexec";
// Output is only ever read through the attach stream, never persisted by the daemon
const LOG_DRIVER: &str = "none";

// Layout inside the sandbox
const SANDBOX_ROOT: &str = "/sandbox";
const SANDBOX_SOURCE_DIR: &str = "/sandbox/src";
const SANDBOX_BUILD_DIR: &str = "/sandbox/build";
const SANDBOX_STDIN: &str = "/sandbox/stdin.txt";
const SANDBOX_TMP: &str = "/tmp";

/// Resource and privilege limits applied to every container
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub memory_limit: i64,
    /// Memory plus swap
    pub memory_swap_limit: i64,
    pub nano_cpus: i64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
    pub tmpfs_size: String,
    pub user: Option<String>,
    pub max_output_bytes: usize,
    pub pull_images: bool,
}

impl From<&ExecutorConfig> for SandboxPolicy {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            memory_limit: config.memory_limit.as_docker(),
            memory_swap_limit: config.memory_swap_limit.as_docker(),
            nano_cpus: config.nano_cpus,
            cpu_shares: config.cpu_shares,
            pids_limit: config.pids_limit,
            tmpfs_size: config.tmpfs_size.clone(),
            user: config.user.clone(),
            max_output_bytes: config.max_output_bytes,
            pull_images: config.pull_images,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Compile,
    Run,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Compile => "compile",
            Phase::Run => "run",
        }
    }
}

/// What one container produced before it exited or was killed
#[derive(Debug)]
struct Captured {
    buffers: OutputBuffers,
    exit_code: Option<i64>,
    timed_out: bool,
    oom_killed: bool,
}

/// A sandbox runner backed by a Docker daemon
///
/// Each phase gets its own short-lived container: read-only root filesystem,
/// no network, no capabilities, an unprivileged user and cgroup limits on
/// memory, CPU and process count. The source and stdin files are bind-mounted
/// read-only; the build directory is writable only while compiling.
pub struct DockerRunner {
    docker: Docker,
    policy: SandboxPolicy,
    /// Containers created by this runner and not yet removed
    live: Arc<Mutex<HashSet<String>>>,
    /// Images known to be present on the daemon
    ready_images: Mutex<HashSet<String>>,
}

impl DockerRunner {
    /// Connects to the local Docker daemon using the standard environment
    pub fn connect(policy: SandboxPolicy) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(docker, policy))
    }

    pub fn with_client(docker: Docker, policy: SandboxPolicy) -> Self {
        Self {
            docker,
            policy,
            live: Arc::new(Mutex::new(HashSet::new())),
            ready_images: Mutex::new(HashSet::new()),
        }
    }

    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Number of containers created by this runner that still exist
    pub fn live_containers(&self) -> usize {
        self.live.lock().len()
    }

    /// Lists every container on the daemon carrying our label, running or not
    pub async fn managed_containers(&self) -> Result<Vec<String>, SandboxError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    /// Removes labelled containers left behind by a previous process
    pub async fn reap_orphans(&self) -> Result<usize, SandboxError> {
        let mut reaped = 0;
        for id in self.managed_containers().await? {
            if remove_container(&self.docker, &id).await {
                reaped += 1;
            }
        }

        if reaped > 0 {
            log::warn!("Removed {reaped} orphaned sandbox containers");
        }
        Ok(reaped)
    }

    /// Force-removes every container this runner still tracks
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.live.lock().drain().collect();
        for id in ids {
            log::warn!("Removing sandbox container {id} on shutdown");
            remove_container(&self.docker, &id).await;
        }
    }

    /// Makes sure `image` is present, pulling it when allowed
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.ready_images.lock().contains(image) {
            return Ok(());
        }

        if self.docker.inspect_image(image).await.is_err() {
            if !self.policy.pull_images {
                return Err(SandboxError::Image {
                    image: image.to_string(),
                    reason: "not present locally and pulling is disabled".to_string(),
                });
            }

            log::info!("Pulling sandbox image {image}");
            let options = CreateImageOptions {
                from_image: Some(image.to_string()),
                ..Default::default()
            };
            let mut progress = self.docker.create_image(Some(options), None, None);
            while let Some(step) = progress.next().await {
                step.map_err(|e| SandboxError::Image {
                    image: image.to_string(),
                    reason: e.to_string(),
                })?;
            }
            log::info!("Pulled sandbox image {image}");
        }

        self.ready_images.lock().insert(image.to_string());
        Ok(())
    }

    fn container_body(
        &self,
        phase: Phase,
        workspace: &Workspace,
        profile: &LanguageProfile,
        command: String,
    ) -> Result<ContainerCreateBody, SandboxError> {
        let mut binds = vec![
            format!(
                "{}:{SANDBOX_SOURCE_DIR}/{}:ro",
                host_path(workspace.source_path())?,
                workspace.source_name()
            ),
            format!("{}:{SANDBOX_STDIN}:ro", host_path(workspace.stdin_path())?),
        ];
        if let Some(build_dir) = workspace.build_dir() {
            let mode = match phase {
                Phase::Compile => "rw",
                Phase::Run => "ro",
            };
            binds.push(format!("{}:{SANDBOX_BUILD_DIR}:{mode}", host_path(build_dir)?));
        }

        let host_config = HostConfig {
            binds: Some(binds),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                SANDBOX_TMP.to_string(),
                format!("rw,nosuid,nodev,size={}", self.policy.tmpfs_size),
            )])),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            memory: Some(self.policy.memory_limit),
            memory_swap: Some(self.policy.memory_swap_limit),
            nano_cpus: Some(self.policy.nano_cpus),
            cpu_shares: Some(self.policy.cpu_shares),
            pids_limit: Some(self.policy.pids_limit),
            // docker-init reports a signal death of the program as exit status 128 + n
            init: Some(true),
            log_config: Some(HostConfigLogConfig {
                typ: Some(LOG_DRIVER.to_string()),
                config: None,
            }),
            ..Default::default()
        };

        Ok(ContainerCreateBody {
            image: Some(profile.image.clone()),
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), command]),
            working_dir: Some(SANDBOX_ROOT.to_string()),
            user: self.policy.user.clone(),
            env: Some(vec![format!("HOME={SANDBOX_TMP}")]),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(host_config),
            ..Default::default()
        })
    }

    /// Creates, runs and always removes one container
    async fn execute(
        &self,
        phase: Phase,
        workspace: &Workspace,
        profile: &LanguageProfile,
        command: String,
        limit: Duration,
    ) -> Result<Captured, SandboxError> {
        self.ensure_image(&profile.image).await?;

        let name = format!(
            "{CONTAINER_NAME_PREFIX}-{}-{}",
            workspace.token(),
            phase.as_str()
        );
        let body = self.container_body(phase, workspace, profile, command)?;
        let options = CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        };
        let created = self.docker.create_container(Some(options), body).await?;
        let container = ContainerGuard::new(self.docker.clone(), created.id, self.live.clone());
        log::debug!("Created container {name} ({})", container.id());

        let captured = self.drive(container.id(), limit).await;

        // Teardown strictly precedes the caller's workspace release
        container.teardown().await;
        captured
    }

    /// Starts the container and collects its output until it exits or the deadline passes
    async fn drive(&self, id: &str, limit: Duration) -> Result<Captured, SandboxError> {
        // Attach before starting so the first bytes written are not lost
        let options = AttachContainerOptions {
            stream: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let attached = self.docker.attach_container(id, Some(options)).await?;

        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;

        let mut buffers = OutputBuffers::new(self.policy.max_output_bytes);
        let finished =
            tokio::time::timeout(limit, self.collect(id, attached.output, &mut buffers)).await;

        let Ok(exit_code) = finished else {
            log::warn!("Container {id} exceeded its {limit:?} deadline, killing it");
            if let Err(e) = self
                .docker
                .kill_container(id, None::<KillContainerOptions>)
                .await
            {
                // Already exited between the deadline and the kill
                log::debug!("Kill of container {id} failed: {e}");
            }
            return Ok(Captured {
                buffers,
                exit_code: None,
                timed_out: true,
                oom_killed: false,
            });
        };

        let exit_code = exit_code?;
        let oom_killed = self.oom_killed(id).await;
        if buffers.is_truncated() {
            log::warn!("Output of container {id} exceeded the output cap and was truncated");
        }

        Ok(Captured {
            buffers,
            exit_code: Some(exit_code),
            timed_out: false,
            oom_killed,
        })
    }

    /// Demultiplexes the attach stream into `buffers`, then returns the exit status
    async fn collect(
        &self,
        id: &str,
        mut frames: impl Stream<Item = Result<LogOutput, BollardError>> + Unpin,
        buffers: &mut OutputBuffers,
    ) -> Result<i64, SandboxError> {
        while let Some(frame) = frames.next().await {
            buffers.accept(frame?);
        }

        let mut wait = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as errors
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(SandboxError::MissingStatus(id.to_string())),
        }
    }

    async fn oom_killed(&self, id: &str) -> bool {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(e) => {
                log::warn!("Failed to inspect container {id}: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl SandboxRunner for DockerRunner {
    async fn compile(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        limit: Duration,
    ) -> Result<CompileOutcome, SandboxError> {
        let Some(template) = &profile.compile else {
            return Ok(CompileOutcome {
                success: true,
                ..Default::default()
            });
        };

        let command = template.render(&sandbox_source_path(workspace), SANDBOX_BUILD_DIR);
        log::debug!("Compiling workspace {}: {command}", workspace.token());

        let captured = self
            .execute(Phase::Compile, workspace, profile, command, limit)
            .await?;
        let (stdout, stderr) = captured.buffers.into_strings();

        Ok(CompileOutcome {
            success: !captured.timed_out && captured.exit_code == Some(0),
            output: if stderr.trim().is_empty() { stdout } else { stderr },
            timed_out: captured.timed_out,
        })
    }

    async fn run(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        limit: Duration,
    ) -> Result<RunOutcome, SandboxError> {
        let program = profile
            .run
            .render(&sandbox_source_path(workspace), SANDBOX_BUILD_DIR);
        let command = format!("{program} < {SANDBOX_STDIN}");
        log::debug!("Running workspace {}: {command}", workspace.token());

        let captured = self
            .execute(Phase::Run, workspace, profile, command, limit)
            .await?;
        let truncated = captured.buffers.is_truncated();
        let (stdout, stderr) = captured.buffers.into_strings();

        Ok(RunOutcome {
            stdout,
            stderr,
            exit_code: captured.exit_code,
            signal: captured.exit_code.and_then(signal_from_exit_code),
            timed_out: captured.timed_out,
            oom_killed: captured.oom_killed,
            truncated,
        })
    }
}

fn sandbox_source_path(workspace: &Workspace) -> String {
    format!("{SANDBOX_SOURCE_DIR}/{}", workspace.source_name())
}

fn host_path(path: &Path) -> Result<&str, SandboxError> {
    path.to_str()
        .ok_or_else(|| SandboxError::InvalidPath(path.display().to_string()))
}

/// Force-removes a container, returning whether it is gone
async fn remove_container(docker: &Docker, id: &str) -> bool {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };

    match docker.remove_container(id, Some(options)).await {
        Ok(()) => {
            log::debug!("Removed container {id}");
            true
        }
        Err(BollardError::DockerResponseServerError {
            status_code: 404, ..
        }) => true,
        Err(e) => {
            log::error!("Failed to remove container {id}: {e}");
            false
        }
    }
}

/// Owns one container until it has been removed
///
/// The normal path calls [`ContainerGuard::teardown`]. If the owning future is
/// dropped or panics first, `Drop` hands the removal to the runtime instead.
struct ContainerGuard {
    docker: Docker,
    id: Option<String>,
    live: Arc<Mutex<HashSet<String>>>,
}

impl ContainerGuard {
    fn new(docker: Docker, id: String, live: Arc<Mutex<HashSet<String>>>) -> Self {
        live.lock().insert(id.clone());
        Self {
            docker,
            id: Some(id),
            live,
        }
    }

    fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    async fn teardown(mut self) {
        if let Some(id) = self.id.take()
            && remove_container(&self.docker, &id).await
        {
            self.live.lock().remove(&id);
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("Container {id} abandoned mid-execution, removing in background");
                let docker = self.docker.clone();
                let live = self.live.clone();
                handle.spawn(async move {
                    if remove_container(&docker, &id).await {
                        live.lock().remove(&id);
                    }
                });
            }
            Err(_) => log::error!("Container {id} leaked: no runtime available to remove it"),
        }
    }
}
