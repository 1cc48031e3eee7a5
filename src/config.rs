// OpenReLife Desktop - Configuration Management
// Resolves the backend port from persisted settings and describes how the backend is launched

use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Fixed values shared by the supervisor and the clients
pub mod defaults {
    pub const HOST: &str = "127.0.0.1";
    pub const SERVER_PORT: u16 = 8082;
    pub const LAUNCHER: &str = "uv";
    pub const LAUNCHER_ARGS: [&str; 4] = ["run", "python", "-m", "openrelife.app"];
    pub const LAUNCHER_HINT: &str =
        "Install uv (https://docs.astral.sh/uv/) so it is on your PATH, then restart OpenReLife.";
    pub const SETTINGS_FILE: &str = "settings.json";
    pub const LOG_DIR: &str = "logs";
    pub const LOG_FILE: &str = "backend.log";
}

/// Persisted settings shared with the backend. Only `server_port` is consumed here;
/// every other key belongs to the backend and is ignored.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct PersistedSettings {
    #[serde(default)]
    pub server_port: Option<serde_json::Value>,
}

impl PersistedSettings {
    /// The configured port, if it is an integer in 1..=65535
    pub fn port(&self) -> Option<u16> {
        self.server_port
            .as_ref()
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
    }
}

/// Settings file operations
pub mod settings {
    use super::*;

    pub fn settings_path(data_dir: &Path) -> PathBuf {
        data_dir.join(defaults::SETTINGS_FILE)
    }

    /// Load settings from file. A missing or blank file yields the defaults.
    pub fn load(data_dir: &Path) -> anyhow::Result<PersistedSettings> {
        let path = settings_path(data_dir);
        if !path.exists() {
            return Ok(PersistedSettings::default());
        }
        let content = std::fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(PersistedSettings::default());
        }
        let value: serde_json::Value = serde_json::from_str(&content)?;
        if !value.is_object() {
            anyhow::bail!("settings root is not a JSON object");
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Port the backend should bind. Never fails: unreadable or malformed
    /// settings fall back to the default port.
    pub fn resolve_port(data_dir: &Path) -> u16 {
        match load(data_dir) {
            Ok(settings) => match settings.port() {
                Some(port) => {
                    log::info!("[Config] Using configured server_port {}", port);
                    port
                }
                None => {
                    log::info!(
                        "[Config] No valid server_port in settings, using default {}",
                        defaults::SERVER_PORT
                    );
                    defaults::SERVER_PORT
                }
            },
            Err(e) => {
                log::info!(
                    "[Config] Could not read {}: {}. Using default port {}",
                    settings_path(data_dir).display(),
                    e,
                    defaults::SERVER_PORT
                );
                defaults::SERVER_PORT
            }
        }
    }
}

/// Executable plus arguments used to start the backend
#[derive(Clone, Debug)]
pub struct Launcher {
    pub program: String,
    pub args: Vec<String>,
    /// Shown to the operator when `program` cannot be found
    pub install_hint: String,
}

impl Default for Launcher {
    fn default() -> Self {
        Self {
            program: defaults::LAUNCHER.to_string(),
            args: defaults::LAUNCHER_ARGS.iter().map(|s| s.to_string()).collect(),
            install_hint: defaults::LAUNCHER_HINT.to_string(),
        }
    }
}

/// Everything needed for one supervised run. Immutable once built.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub launcher: Launcher,
    pub log_path: PathBuf,
}

impl ServiceConfig {
    /// Config for the installed backend: default launcher, augmented PATH, unbuffered output
    pub fn for_installation(port: u16, backend_root: PathBuf, data_dir: &Path) -> Self {
        let mut environment = BTreeMap::new();
        if let Some(path) = augmented_path() {
            environment.insert("PATH".to_string(), path);
        }
        environment.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        Self {
            host: defaults::HOST.to_string(),
            port,
            working_directory: backend_root,
            environment,
            launcher: Launcher::default(),
            log_path: data_dir.join(defaults::LOG_DIR).join(defaults::LOG_FILE),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// User-local install locations for the launcher, in lookup order
fn extra_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(not(target_os = "windows"))]
    let home = std::env::var_os("HOME");
    #[cfg(target_os = "windows")]
    let home = std::env::var_os("USERPROFILE");

    if let Some(home) = home {
        let home = PathBuf::from(home);
        paths.push(home.join(".local").join("bin"));
        paths.push(home.join(".cargo").join("bin"));
    }

    #[cfg(not(target_os = "windows"))]
    {
        paths.push(PathBuf::from("/opt/homebrew/bin"));
        paths.push(PathBuf::from("/usr/local/bin"));
    }

    paths
}

/// Current PATH with the extra search paths prepended
fn augmented_path() -> Option<String> {
    let current: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();

    let mut combined = extra_search_paths();
    combined.retain(|p| !current.contains(p));
    combined.extend(current);

    std::env::join_paths(combined)
        .ok()
        .map(|p: OsString| p.to_string_lossy().into_owned())
}

/// Locate the backend root: bundled resources in production, the project root in development
pub fn backend_root(resource_dir: &Path) -> PathBuf {
    let bundled = resource_dir.join("backend");
    if bundled.join("openrelife").exists() {
        log::info!("[Config] Using bundled backend at {:?}", bundled);
        return bundled;
    }

    // In dev: resource_dir = .../target/debug/, the project root holds openrelife/
    let project_root = resource_dir
        .ancestors()
        .find(|p| p.join("openrelife").is_dir())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    log::info!("[Config] Using development backend at {:?}", project_root);
    project_root
}
