//! Registry credentials from the Docker client configuration.
//!
//! Reads `$DOCKER_CONFIG/config.json` (default `~/.docker/config.json`).
//! A per-registry `credHelpers` entry wins, then the global `credsStore`,
//! then inline `auths`. Helpers are run as `docker-credential-<name> get`
//! with the server URL on stdin.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use base64::Engine as _;
use mkctr_core::error::{MkctrError, Result};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Server URL Docker Hub credentials are stored under.
const DOCKER_HUB_SERVER: &str = "https://index.docker.io/v1/";

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: HashMap<String, String>,
}

/// Reply of a credential helper's `get` command.
#[derive(Debug, Deserialize)]
struct HelperCredentials {
    #[serde(rename = "Username", default)]
    username: String,
    #[serde(rename = "Secret", default)]
    secret: String,
}

/// Read-only view of the Docker client credential file.
pub struct DockerConfig {
    path: PathBuf,
    search_path: Option<OsString>,
}

impl DockerConfig {
    /// The config file named by `DOCKER_CONFIG`, else `~/.docker/config.json`.
    pub fn default_path() -> Result<Self> {
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            return Ok(Self::new(PathBuf::from(dir).join("config.json")));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            MkctrError::Other("Cannot determine home directory for docker config".to_string())
        })?;
        Ok(Self::new(home.join(".docker").join("config.json")))
    }

    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            search_path: None,
        }
    }

    /// Look up credential helpers in `paths` instead of `PATH`.
    pub fn with_search_path(mut self, paths: impl Into<OsString>) -> Self {
        self.search_path = Some(paths.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Credentials for a registry as `(username, password)`.
    pub async fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        let wanted = normalize_registry(registry);

        let helper = file
            .cred_helpers
            .iter()
            .find(|(key, _)| normalize_registry(key) == wanted)
            .map(|(_, helper)| helper)
            .or(file.creds_store.as_ref());
        if let Some(helper) = helper {
            if let Some(creds) = self.run_helper(helper, &wanted).await? {
                return Ok(Some(creds));
            }
        }

        let entry = file
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(key) == wanted)
            .map(|(_, entry)| entry);
        let Some(entry) = entry else {
            return Ok(None);
        };

        if let (Some(u), Some(p)) = (&entry.username, &entry.password) {
            return Ok(Some((u.clone(), p.clone())));
        }
        match &entry.auth {
            Some(encoded) if !encoded.is_empty() => decode_auth(encoded).map(Some),
            _ => Ok(None),
        }
    }

    /// Ask `docker-credential-<helper>` for the credentials of `registry`.
    ///
    /// A missing helper binary or a "credentials not found" reply yields
    /// `None` so inline entries still apply.
    async fn run_helper(&self, helper: &str, registry: &str) -> Result<Option<(String, String)>> {
        let binary = format!("docker-credential-{}", helper);
        let found = match &self.search_path {
            Some(paths) => which::which_in(&binary, Some(paths), Path::new("/")),
            None => which::which(&binary),
        };
        let Ok(program) = found else {
            tracing::debug!(helper = %binary, "Credential helper not installed");
            return Ok(None);
        };

        let server = if registry == "index.docker.io" {
            DOCKER_HUB_SERVER.to_string()
        } else {
            registry.to_string()
        };
        tracing::debug!(helper = %binary, server = %server, "Querying credential helper");

        let mut child = Command::new(&program)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MkctrError::Other(format!("Failed to run {}: {}", binary, e)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MkctrError::Other(format!("No stdin for {}", binary)))?;
        let write = async move {
            let written = stdin.write_all(server.as_bytes()).await;
            drop(stdin);
            written
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output =
            output.map_err(|e| MkctrError::Other(format!("Failed to run {}: {}", binary, e)))?;

        if !output.status.success() {
            let message = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            if message.to_lowercase().contains("credentials not found") {
                tracing::debug!(helper = %binary, registry = %registry, "No stored credentials");
                return Ok(None);
            }
            return Err(MkctrError::Other(format!(
                "{} get failed ({}): {}",
                binary,
                output.status,
                message.trim()
            )));
        }
        written.map_err(|e| MkctrError::Other(format!("Failed to write to {}: {}", binary, e)))?;

        let creds: HelperCredentials = serde_json::from_slice(&output.stdout).map_err(|e| {
            MkctrError::Other(format!("Invalid reply from {}: {}", binary, e))
        })?;
        if creds.username.is_empty() && creds.secret.is_empty() {
            return Ok(None);
        }
        Ok(Some((creds.username, creds.secret)))
    }

    fn load(&self) -> Result<DockerConfigFile> {
        if !self.path.exists() {
            return Ok(DockerConfigFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            MkctrError::Other(format!(
                "Failed to read docker config {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            MkctrError::Other(format!(
                "Failed to parse docker config {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Decode a base64 `user:password` auth field.
fn decode_auth(encoded: &str) -> Result<(String, String)> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| MkctrError::Other(format!("Invalid auth entry in docker config: {}", e)))?;
    let text = String::from_utf8(raw)
        .map_err(|e| MkctrError::Other(format!("Invalid auth entry in docker config: {}", e)))?;
    let (user, pass) = text.split_once(':').ok_or_else(|| {
        MkctrError::Other("Invalid auth entry in docker config: missing ':'".to_string())
    })?;
    Ok((user.to_string(), pass.to_string()))
}

/// Reduce config keys such as `https://index.docker.io/v1/` to a bare host.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    let r = r
        .strip_prefix("https://")
        .or_else(|| r.strip_prefix("http://"))
        .unwrap_or(&r);
    let host = r.split('/').next().unwrap_or(r);
    match host {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => "index.docker.io".to_string(),
        other => other.to_string(),
    }
}
