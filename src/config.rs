//! Host configuration.
//!
//! Built once at startup from environment keys (a `.env` file is loaded
//! first by the binary) and the host's well-known directories.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_ID: &str = "app.cumo.shell";

/// Ports tried in order when no explicit override is configured.
pub const PORT_CANDIDATES: [u16; 4] = [5001, 5000, 5002, 5050];

const ENTRY_SCRIPT: &str = "app.py";
const DEFAULT_ACCELERATOR: &str = "CommandOrControl+/";
const WINDOW_LABEL: &str = "main";
const WINDOW_WIDTH: f64 = 700.0;
const WINDOW_HEIGHT: f64 = 130.0;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

const ENV_DEPLOYMENT: &str = "CUMO_DEPLOYMENT";
const ENV_BACKEND_PORT: &str = "CUMO_BACKEND_PORT";
const ENV_PYTHON: &str = "CUMO_PYTHON";
const ENV_BACKEND_DIR: &str = "CUMO_BACKEND_DIR";
const ENV_SHORTCUT: &str = "CUMO_SHORTCUT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentMode {
    /// Precompiled worker binary shipped in the resource directory.
    Packaged,
    /// Interpreter + entry script from the source checkout.
    Development,
}

impl DeploymentMode {
    fn build_default() -> Self {
        if cfg!(debug_assertions) {
            Self::Development
        } else {
            Self::Packaged
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "packaged" | "production" | "prod" => Some(Self::Packaged),
            "development" | "dev" => Some(Self::Development),
            _ => None,
        }
    }
}

/// Directories the host knows about before any config is read.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub cwd: PathBuf,
    pub resource_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl HostPaths {
    pub fn detect() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let resource_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| cwd.clone());
        let data_dir = dirs::data_dir()
            .map(|dir| dir.join(APP_ID))
            .unwrap_or_else(|| cwd.join(".cumo"));

        Self {
            cwd,
            resource_dir,
            data_dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub mode: DeploymentMode,
    pub backend_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Raw override string; parsed by the port negotiator.
    pub port_override: Option<String>,
    pub port_candidates: Vec<u16>,
    pub interpreter_override: Option<String>,
    pub entry_script: String,
    pub shutdown_grace: Duration,
}

impl BackendConfig {
    pub fn binary_path(&self) -> PathBuf {
        self.backend_dir.join(packaged_binary_name())
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.backend_dir.join("credentials.json")
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join("token.json")
    }
}

#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub label: String,
    pub accelerator: String,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub backend: BackendConfig,
    pub window: WindowConfig,
}

impl ShellConfig {
    pub fn from_env(paths: &HostPaths) -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), paths)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, paths: &HostPaths) -> Self {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mode = match value(ENV_DEPLOYMENT) {
            Some(raw) => DeploymentMode::parse(&raw).unwrap_or_else(|| {
                let fallback = DeploymentMode::build_default();
                tracing::warn!(
                    "[main] Unknown {}={:?}, using {:?}",
                    ENV_DEPLOYMENT,
                    raw,
                    fallback
                );
                fallback
            }),
            None => DeploymentMode::build_default(),
        };

        let backend_dir = value(ENV_BACKEND_DIR).map_or_else(
            || match mode {
                DeploymentMode::Packaged => paths.resource_dir.join("backend"),
                DeploymentMode::Development => paths.cwd.join("backend"),
            },
            PathBuf::from,
        );

        Self {
            backend: BackendConfig {
                mode,
                backend_dir,
                data_dir: paths.data_dir.clone(),
                port_override: value(ENV_BACKEND_PORT),
                port_candidates: PORT_CANDIDATES.to_vec(),
                interpreter_override: value(ENV_PYTHON),
                entry_script: ENTRY_SCRIPT.to_string(),
                shutdown_grace: SHUTDOWN_GRACE,
            },
            window: WindowConfig {
                label: WINDOW_LABEL.to_string(),
                accelerator: value(ENV_SHORTCUT).unwrap_or_else(|| DEFAULT_ACCELERATOR.to_string()),
                width: WINDOW_WIDTH,
                height: WINDOW_HEIGHT,
            },
        }
    }
}

pub fn packaged_binary_name() -> &'static str {
    if cfg!(windows) {
        "cumo-backend.exe"
    } else {
        "cumo-backend"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn paths() -> HostPaths {
        HostPaths {
            cwd: PathBuf::from("/work"),
            resource_dir: PathBuf::from("/opt/cumo/resources"),
            data_dir: PathBuf::from("/home/u/.local/share/app.cumo.shell"),
        }
    }

    fn config(vars: &[(&str, &str)]) -> ShellConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ShellConfig::from_lookup(|key| vars.get(key).cloned(), &paths())
    }

    #[test]
    fn test_packaged_uses_resource_dir() {
        let cfg = config(&[("CUMO_DEPLOYMENT", "packaged")]);
        assert_eq!(cfg.backend.mode, DeploymentMode::Packaged);
        assert_eq!(cfg.backend.backend_dir, PathBuf::from("/opt/cumo/resources/backend"));
        assert_eq!(
            cfg.backend.credentials_path(),
            PathBuf::from("/opt/cumo/resources/backend/credentials.json")
        );
    }

    #[test]
    fn test_development_uses_cwd() {
        let cfg = config(&[("CUMO_DEPLOYMENT", "dev"), ("CUMO_PYTHON", "/usr/bin/python3.12")]);
        assert_eq!(cfg.backend.mode, DeploymentMode::Development);
        assert_eq!(cfg.backend.backend_dir, PathBuf::from("/work/backend"));
        assert_eq!(cfg.backend.interpreter_override.as_deref(), Some("/usr/bin/python3.12"));
        assert_eq!(cfg.backend.entry_script, "app.py");
    }

    #[test]
    fn test_overrides_and_defaults() {
        let cfg = config(&[
            ("CUMO_DEPLOYMENT", "development"),
            ("CUMO_BACKEND_PORT", "5123"),
            ("CUMO_BACKEND_DIR", "/srv/worker"),
            ("CUMO_PYTHON", "   "),
        ]);
        assert_eq!(cfg.backend.port_override.as_deref(), Some("5123"));
        assert_eq!(cfg.backend.backend_dir, PathBuf::from("/srv/worker"));
        assert!(cfg.backend.interpreter_override.is_none());
        assert_eq!(cfg.backend.port_candidates, vec![5001, 5000, 5002, 5050]);
        assert_eq!(cfg.window.accelerator, "CommandOrControl+/");
        assert_eq!(
            cfg.backend.token_path(),
            PathBuf::from("/home/u/.local/share/app.cumo.shell/token.json")
        );
    }

    #[test]
    fn test_unknown_mode_falls_back_to_build_default() {
        let cfg = config(&[("CUMO_DEPLOYMENT", "staging"), ("CUMO_SHORTCUT", "Alt+Space")]);
        assert_eq!(cfg.backend.mode, DeploymentMode::build_default());
        assert_eq!(cfg.window.accelerator, "Alt+Space");
    }
}
