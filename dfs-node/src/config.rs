//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Node configuration. File: `--config PATH`, else ~/.config/dfs/config.toml or /etc/dfs/config.toml.
/// Env overrides: DFS_LISTEN_ADDR, DFS_STORAGE_ROOT, DFS_BOOTSTRAP_NODES, DFS_SHARD_WIDTH.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Transport listen address (default 0.0.0.0:3000).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Storage root; derived from the listen address when unset.
    #[serde(default)]
    pub storage_root: Option<PathBuf>,
    /// Hex characters per directory level (default 5).
    #[serde(default = "default_shard_width")]
    pub shard_width: usize,
    /// Peers to dial on start. Empty entries are ignored.
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    #[serde(default)]
    pub handshake: HandshakeKind,
    /// Largest accepted frame in bytes (default 16 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeKind {
    #[default]
    Nop,
    Version,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_shard_width() -> usize {
    dfs_core::DEFAULT_SHARD_WIDTH
}
fn default_max_frame_len() -> u32 {
    dfs_core::wire::DEFAULT_MAX_FRAME_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            storage_root: None,
            shard_width: default_shard_width(),
            bootstrap_nodes: Vec::new(),
            handshake: HandshakeKind::default(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl Config {
    /// Configured root, or `<listen addr>_network` with ':' made filesystem friendly.
    pub fn storage_root(&self) -> PathBuf {
        self.storage_root.clone().unwrap_or_else(|| {
            PathBuf::from(format!("{}_network", self.listen_addr.replace(':', "_")))
        })
    }

    pub fn bootstrap_nodes(&self) -> Vec<String> {
        self.bootstrap_nodes
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(s) = get("DFS_LISTEN_ADDR") {
            self.listen_addr = s;
        }
        if let Some(s) = get("DFS_STORAGE_ROOT") {
            self.storage_root = Some(PathBuf::from(s));
        }
        if let Some(s) = get("DFS_BOOTSTRAP_NODES") {
            self.bootstrap_nodes = s.split(',').map(str::to_string).collect();
        }
        if let Some(s) = get("DFS_SHARD_WIDTH") {
            match s.parse::<usize>() {
                Ok(w) => self.shard_width = w,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid DFS_SHARD_WIDTH"),
            }
        }
    }
}

/// Load config: default, then config file (explicit path or first existing default), then env vars.
/// An explicit path that can't be read or parsed is an error; default locations fall back silently.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => config_paths()
            .into_iter()
            .find(|p| p.exists())
            .and_then(|p| match load_file(&p) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "ignoring config file");
                    None
                }
            })
            .unwrap_or_default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dfs/config.toml"));
    }
    out.push(PathBuf::from("/etc/dfs/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("failed to parse config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.listen_addr, "0.0.0.0:3000");
        assert_eq!(c.shard_width, 5);
        assert_eq!(c.handshake, HandshakeKind::Nop);
        assert_eq!(c.storage_root(), PathBuf::from("0.0.0.0_3000_network"));
    }

    #[test]
    fn parses_file() {
        let c: Config = toml::from_str(
            r#"
            listen_addr = ":4000"
            bootstrap_nodes = ["", "127.0.0.1:3000"]
            handshake = "version"
            storage_root = "/var/lib/dfs"
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_addr, ":4000");
        assert_eq!(c.bootstrap_nodes(), vec!["127.0.0.1:3000".to_string()]);
        assert_eq!(c.handshake, HandshakeKind::Version);
        assert_eq!(c.storage_root(), PathBuf::from("/var/lib/dfs"));
        assert_eq!(c.max_frame_len, dfs_core::wire::DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(toml::from_str::<Config>("proxy_port = 1").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("DFS_LISTEN_ADDR", "127.0.0.1:5000"),
            ("DFS_BOOTSTRAP_NODES", "a:1, ,b:2"),
            ("DFS_SHARD_WIDTH", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_addr, "127.0.0.1:5000");
        assert_eq!(c.bootstrap_nodes(), vec!["a:1".to_string(), "b:2".to_string()]);
        assert_eq!(c.shard_width, 5);
    }

    #[test]
    fn explicit_file_errors_surface() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_file(&missing).is_err());

        let path = dir.path().join("dfs.toml");
        std::fs::write(&path, "shard_width = 8\n").unwrap();
        assert_eq!(load_file(&path).unwrap().shard_width, 8);
    }
}
