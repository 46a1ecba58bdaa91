//! Loading images into a local container runtime.
//!
//! Runtimes are tried through an ordered list of [`RuntimeDetector`]s: the Docker
//! Engine API first, then `docker`, `podman` and `nerdctl` found on `PATH`.
//! Each detector yields a loader or reports that it is unavailable.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use bollard::models::BuildInfo;
use bollard::query_parameters::ImportImageOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::TryStreamExt;
use mkctr_core::error::{MkctrError, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// CLI binaries tried after the daemon API, in preference order.
pub const CLI_BINARIES: &[&str] = &["docker", "podman", "nerdctl"];

/// Something that can load a `docker save` tarball.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    fn describe(&self) -> String;

    async fn load(&self, repo_tag: &str, tarball: Vec<u8>) -> Result<()>;
}

/// A way of reaching a local runtime.
#[async_trait]
pub trait RuntimeDetector: Send + Sync {
    fn name(&self) -> String;

    /// A loader, or `None` when this runtime is unavailable.
    async fn detect(&self) -> Option<Box<dyn ImageLoader>>;

    /// Whether a failed load moves on to the next detector instead of failing.
    fn falls_through(&self) -> bool {
        false
    }
}

/// Ordered detector list.
pub struct LocalRuntime {
    detectors: Vec<Box<dyn RuntimeDetector>>,
}

impl LocalRuntime {
    pub fn new(detectors: Vec<Box<dyn RuntimeDetector>>) -> Self {
        Self { detectors }
    }

    /// Daemon API, then the known CLI binaries.
    pub fn detect() -> Self {
        let mut detectors: Vec<Box<dyn RuntimeDetector>> = vec![Box::new(DaemonDetector)];
        for binary in CLI_BINARIES {
            detectors.push(Box::new(CliDetector::new(*binary)));
        }
        Self::new(detectors)
    }

    /// Load a tarball with the first runtime that accepts it.
    pub async fn load(&self, repo_tag: &str, tarball: Vec<u8>) -> Result<()> {
        for detector in &self.detectors {
            let Some(loader) = detector.detect().await else {
                tracing::debug!(runtime = %detector.name(), "Runtime not available");
                continue;
            };
            match loader.load(repo_tag, tarball.clone()).await {
                Ok(()) => {
                    tracing::info!(reference = %repo_tag, runtime = %loader.describe(), "Loaded image");
                    return Ok(());
                }
                Err(e) if detector.falls_through() => {
                    tracing::warn!(runtime = %loader.describe(), error = %e, "Load failed, trying next runtime");
                }
                Err(e) => return Err(e),
            }
        }
        let tried: Vec<String> = self.detectors.iter().map(|p| p.name()).collect();
        Err(MkctrError::Publish {
            destination: repo_tag.to_string(),
            message: format!(
                "no suitable docker CLI-compatible binary found (tried {})",
                tried.join(", ")
            ),
        })
    }
}

/// Docker Engine API on the local socket.
pub struct DaemonDetector;

#[async_trait]
impl RuntimeDetector for DaemonDetector {
    fn name(&self) -> String {
        "docker daemon API".to_string()
    }

    async fn detect(&self) -> Option<Box<dyn ImageLoader>> {
        let docker = Docker::connect_with_local_defaults().ok()?;
        docker.ping().await.ok()?;
        Some(Box::new(DaemonLoader { docker }))
    }

    fn falls_through(&self) -> bool {
        true
    }
}

struct DaemonLoader {
    docker: Docker,
}

#[async_trait]
impl ImageLoader for DaemonLoader {
    fn describe(&self) -> String {
        "docker daemon API".to_string()
    }

    async fn load(&self, repo_tag: &str, tarball: Vec<u8>) -> Result<()> {
        let infos: Vec<BuildInfo> = self
            .docker
            .import_image(
                ImportImageOptions::default(),
                bollard::body_full(Bytes::from(tarball)),
                None,
            )
            .try_collect()
            .await
            .map_err(|e| MkctrError::Publish {
                destination: repo_tag.to_string(),
                message: format!("docker daemon import failed: {}", e),
            })?;

        for info in &infos {
            if let Some(msg) = &info.error {
                return Err(MkctrError::Publish {
                    destination: repo_tag.to_string(),
                    message: format!("docker daemon import failed: {}", msg),
                });
            }
            if let Some(stream) = &info.stream {
                tracing::debug!(output = %stream.trim_end(), "Daemon output");
            }
        }
        Ok(())
    }
}

/// A CLI-compatible binary on `PATH`.
pub struct CliDetector {
    binary: String,
}

impl CliDetector {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl RuntimeDetector for CliDetector {
    fn name(&self) -> String {
        self.binary.clone()
    }

    async fn detect(&self) -> Option<Box<dyn ImageLoader>> {
        let path = which::which(&self.binary).ok()?;
        Some(Box::new(CliLoader { path }))
    }
}

/// Runs `<binary> image load` with the tarball on stdin.
pub struct CliLoader {
    path: PathBuf,
}

impl CliLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ImageLoader for CliLoader {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self, repo_tag: &str, tarball: Vec<u8>) -> Result<()> {
        let publish_error = |message: String| MkctrError::Publish {
            destination: repo_tag.to_string(),
            message,
        };

        tracing::info!(command = %format!("{} image load", self.path.display()), "Running command");
        let mut child = Command::new(&self.path)
            .args(["image", "load"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| publish_error(format!("Failed to start {}: {}", self.path.display(), e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| publish_error("stdin not captured".to_string()))?;
        let writer = async move {
            let result = stdin.write_all(&tarball).await;
            drop(stdin);
            result
        };
        let (written, output) = tokio::join!(writer, child.wait_with_output());
        let output = output.map_err(|e| publish_error(format!("Failed to run {}: {}", self.path.display(), e)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        tracing::info!(output = %combined.trim_end(), "Command output");

        if !output.status.success() {
            return Err(publish_error(format!(
                "{} image load exited with {}: {}",
                self.path.display(),
                output.status,
                combined.trim_end()
            )));
        }
        written.map_err(|e| publish_error(format!("Failed to stream image: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeDetector {
        name: &'static str,
        available: bool,
        fails: bool,
        falls_through: bool,
        loads: Arc<AtomicUsize>,
    }

    struct FakeLoader {
        fails: bool,
        loads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ImageLoader for FakeLoader {
        fn describe(&self) -> String {
            "fake".to_string()
        }

        async fn load(&self, repo_tag: &str, _tarball: Vec<u8>) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fails {
                return Err(MkctrError::Publish {
                    destination: repo_tag.to_string(),
                    message: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RuntimeDetector for FakeDetector {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn detect(&self) -> Option<Box<dyn ImageLoader>> {
            self.available.then(|| {
                Box::new(FakeLoader {
                    fails: self.fails,
                    loads: self.loads.clone(),
                }) as Box<dyn ImageLoader>
            })
        }

        fn falls_through(&self) -> bool {
            self.falls_through
        }
    }

    fn detector(name: &'static str, available: bool, fails: bool, falls_through: bool) -> (Box<dyn RuntimeDetector>, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        (
            Box::new(FakeDetector {
                name,
                available,
                fails,
                falls_through,
                loads: loads.clone(),
            }),
            loads,
        )
    }

    #[tokio::test]
    async fn test_daemon_failure_falls_back_to_cli() {
        let (daemon, daemon_loads) = detector("daemon", true, true, true);
        let (cli, cli_loads) = detector("docker", true, false, false);
        let runtime = LocalRuntime::new(vec![daemon, cli]);
        runtime.load("app:v1", vec![1, 2, 3]).await.unwrap();
        assert_eq!(daemon_loads.load(Ordering::SeqCst), 1);
        assert_eq!(cli_loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_available_cli_wins() {
        let (daemon, _) = detector("daemon", false, false, true);
        let (docker, docker_loads) = detector("docker", false, false, false);
        let (podman, podman_loads) = detector("podman", true, false, false);
        let (nerdctl, nerdctl_loads) = detector("nerdctl", true, false, false);
        let runtime = LocalRuntime::new(vec![daemon, docker, podman, nerdctl]);
        runtime.load("app:v1", Vec::new()).await.unwrap();
        assert_eq!(docker_loads.load(Ordering::SeqCst), 0);
        assert_eq!(podman_loads.load(Ordering::SeqCst), 1);
        assert_eq!(nerdctl_loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cli_failure_is_fatal() {
        let (docker, _) = detector("docker", true, true, false);
        let (podman, podman_loads) = detector("podman", true, false, false);
        let runtime = LocalRuntime::new(vec![docker, podman]);
        assert!(runtime.load("app:v1", Vec::new()).await.is_err());
        assert_eq!(podman_loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_nothing_available_names_every_runtime() {
        let detectors = vec![
            detector("docker daemon API", false, false, true).0,
            detector("docker", false, false, false).0,
            detector("podman", false, false, false).0,
            detector("nerdctl", false, false, false).0,
        ];
        let err = LocalRuntime::new(detectors)
            .load("app:v1", Vec::new())
            .await
            .unwrap_err();
        let msg = err.to_string();
        for name in ["docker daemon API", "docker", "podman", "nerdctl"] {
            assert!(msg.contains(name), "{msg}");
        }
        assert!(msg.starts_with("Publish to app:v1 failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_loader_streams_stdin() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-docker");
        let sink = dir.path().join("received");
        std::fs::write(
            &script,
            format!("#!/bin/sh\n[ \"$1 $2\" = \"image load\" ] || exit 3\ncat > {}\necho Loaded\n", sink.display()),
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        CliLoader::new(&script)
            .load("app:v1", b"tarball-bytes".to_vec())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&sink).unwrap(), b"tarball-bytes");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_loader_reports_exit_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-podman");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\necho nope >&2\nexit 1\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = CliLoader::new(&script)
            .load("app:v1", b"x".to_vec())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
