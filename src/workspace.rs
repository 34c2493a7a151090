use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

use crate::language::LanguageProfile;

// Workspace permissions; the sandbox runs as an unprivileged user
const WORKSPACE_DIR_PERMISSIONS: u32 = 0o755;
const WORKSPACE_FILE_PERMISSIONS: u32 = 0o644;
const BUILD_DIR_PERMISSIONS: u32 = 0o777;

const STDIN_FILE_NAME: &str = "stdin.txt";
const BUILD_DIR_NAME: &str = "build";
const RELEASE_ATTEMPTS: u32 = 3;
const RELEASE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
#[error("failed to prepare workspace: {0}")]
pub struct WorkspaceError(#[from] std::io::Error);

/// Allocates per-request workspaces under a shared root directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh workspace holding the source file and the stdin file
    ///
    /// The directory name carries a random token, so concurrent requests sharing
    /// the root never see each other's files. Compiled languages additionally get
    /// a writable `build/` directory for the compiler's artifacts.
    pub async fn acquire(
        &self,
        profile: &LanguageProfile,
        code: &str,
        stdin: Option<&str>,
    ) -> Result<Workspace, WorkspaceError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let token = Uuid::new_v4().to_string();
        let dir = self.root.join(format!("run-{token}"));
        tokio::fs::create_dir(&dir).await?;

        // From here on the directory is owned by the workspace and removed on drop
        let workspace = Workspace {
            source_path: dir.join(profile.source_name),
            stdin_path: dir.join(STDIN_FILE_NAME),
            build_dir: profile.is_compiled().then(|| dir.join(BUILD_DIR_NAME)),
            source_name: profile.source_name,
            token,
            dir,
            released: false,
        };

        set_mode(&workspace.dir, WORKSPACE_DIR_PERMISSIONS).await?;

        tokio::fs::write(&workspace.source_path, format!("{code}\n")).await?;
        set_mode(&workspace.source_path, WORKSPACE_FILE_PERMISSIONS).await?;

        tokio::fs::write(&workspace.stdin_path, stdin.unwrap_or_default()).await?;
        set_mode(&workspace.stdin_path, WORKSPACE_FILE_PERMISSIONS).await?;

        if let Some(build_dir) = &workspace.build_dir {
            tokio::fs::create_dir(build_dir).await?;
            set_mode(build_dir, BUILD_DIR_PERMISSIONS).await?;
        }

        log::debug!("Workspace {} acquired for {}", workspace.token, profile.id);
        Ok(workspace)
    }
}

async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    tokio::fs::set_permissions(path, fs::Permissions::from_mode(mode)).await
}

/// Ephemeral files of one execution
///
/// Removed by [`Workspace::release`] or, failing that, when dropped.
#[derive(Debug)]
pub struct Workspace {
    token: String,
    dir: PathBuf,
    source_name: &'static str,
    source_path: PathBuf,
    stdin_path: PathBuf,
    build_dir: Option<PathBuf>,
    released: bool,
}

impl Workspace {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source_name(&self) -> &str {
        self.source_name
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn stdin_path(&self) -> &Path {
        &self.stdin_path
    }

    pub fn build_dir(&self) -> Option<&Path> {
        self.build_dir.as_deref()
    }

    /// Deletes the workspace directory; later calls are no-ops
    ///
    /// Transient failures are retried with a growing pause. A failure is logged and
    /// otherwise swallowed: it must never change the outcome of the execution.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        for attempt in 1..=RELEASE_ATTEMPTS {
            match tokio::fs::remove_dir_all(&self.dir).await {
                Ok(()) => {
                    log::debug!("Workspace {} released", self.token);
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) if attempt < RELEASE_ATTEMPTS => {
                    log::warn!(
                        "Failed to remove workspace {} (attempt {attempt}): {e}",
                        self.token
                    );
                    tokio::time::sleep(RELEASE_BACKOFF * attempt).await;
                }
                Err(e) => {
                    log::error!(
                        "Giving up removing workspace {} at {}: {e}",
                        self.token,
                        self.dir.display()
                    );
                }
            }
        }
    }
}

impl Drop for Workspace {
    // Backstop for unwinding; the async release is the normal path
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => log::debug!("Workspace {} released on drop", self.token),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::error!(
                "Failed to remove workspace {} at {}: {e}",
                self.token,
                self.dir.display()
            ),
        }
    }
}
