//! Configuration file management for subdiv.
//!
//! Provides a TOML config file at `~/.config/subdiv/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use subdiv_core::PipelineConfig;
use subdiv_core::client::{DemoClient, GeminiClient, GeminiConfig, GenerationClient};

pub const ENV_STORE_PATH: &str = "SUBDIV_STORE_PATH";
pub const ENV_CLIENT: &str = "SUBDIV_CLIENT";
pub const ENV_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_API_BASE: &str = "GEMINI_API_BASE";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub store: StoreSection,
    pub client: ClientSection,
    pub gemini: GeminiConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub kind: ClientKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Which generation backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    /// Gemini when an API key is available, demo otherwise.
    #[default]
    Auto,
    Gemini,
    Demo,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Gemini => "gemini",
            Self::Demo => "demo",
        };
        f.write_str(s)
    }
}

impl FromStr for ClientKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "gemini" => Ok(Self::Gemini),
            "demo" => Ok(Self::Demo),
            other => Err(format!(
                "unknown client {other:?} (expected auto, gemini or demo)"
            )),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the subdiv config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/subdiv` or `~/.config/subdiv`,
/// on macOS too.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("subdiv");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("subdiv")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default candidate store: `$XDG_DATA_HOME/subdiv/candidates.json` or the
/// platform data directory.
pub fn default_store_path() -> PathBuf {
    let base = match std::env::var("XDG_DATA_HOME") {
        Ok(xdg) => PathBuf::from(xdg),
        Err(_) => dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")),
    };
    base.join("subdiv").join("candidates.json")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file at `path`. A missing file is `Ok(None)`; a file
/// that exists but does not parse is an error.
pub fn load_config_from(path: &Path) -> Result<Option<ConfigFile>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    let config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix since it may hold an API key.
pub fn save_config_to(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Backend after resolution; `Auto` never survives this far.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedClient {
    Demo,
    Gemini {
        api_key: String,
        config: GeminiConfig,
    },
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct SubdivConfig {
    pub store_path: PathBuf,
    pub client: ResolvedClient,
    pub pipeline: PipelineConfig,
}

impl SubdivConfig {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// - Store path: `cli_store` > `SUBDIV_STORE_PATH` > `store.path` > [`default_store_path`]
    /// - Client: `cli_client` > `SUBDIV_CLIENT` > `client.kind` > `auto`
    /// - API key: `GEMINI_API_KEY` > `client.api_key`
    /// - API base: `GEMINI_API_BASE` > `gemini.base_url` > built-in
    pub fn resolve(cli_store: Option<&Path>, cli_client: Option<ClientKind>) -> Result<Self> {
        let file = load_config_from(&config_path())?.unwrap_or_default();

        let store_path = if let Some(path) = cli_store {
            path.to_path_buf()
        } else if let Some(path) = env_var(ENV_STORE_PATH) {
            PathBuf::from(path)
        } else if let Some(path) = file.store.path.clone() {
            path
        } else {
            default_store_path()
        };

        let kind = match (cli_client, env_var(ENV_CLIENT)) {
            (Some(kind), _) => kind,
            (None, Some(raw)) => raw
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("invalid {ENV_CLIENT}"))?,
            (None, None) => file.client.kind,
        };

        let api_key = env_var(ENV_API_KEY).or(file.client.api_key);
        let mut gemini = file.gemini;
        if let Some(base) = env_var(ENV_API_BASE) {
            gemini.base_url = base;
        }

        let client = match (kind, api_key) {
            (ClientKind::Demo, _) | (ClientKind::Auto, None) => ResolvedClient::Demo,
            (ClientKind::Gemini | ClientKind::Auto, Some(api_key)) => ResolvedClient::Gemini {
                api_key,
                config: gemini,
            },
            (ClientKind::Gemini, None) => bail!(
                "gemini client selected but no API key found; set {ENV_API_KEY} or client.api_key in {}",
                config_path().display()
            ),
        };

        Ok(Self {
            store_path,
            client,
            pipeline: file.pipeline,
        })
    }

    pub fn build_client(&self) -> Arc<dyn GenerationClient> {
        match &self.client {
            ResolvedClient::Demo => Arc::new(DemoClient::new()),
            ResolvedClient::Gemini { api_key, config } => {
                Arc::new(GeminiClient::new(api_key.clone(), config.clone()))
            }
        }
    }
}

/// Env var value, treating empty as unset.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
