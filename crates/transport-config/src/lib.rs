//! Daemon/node configuration (§4.8, AMBIENT). TOML-backed, loaded the way
//! `obsidian-config`/`onyx-config` load theirs: a flat `Deserialize` struct
//! with `#[serde(default = "...")]` hooks and a `ConfigError::{Read,Parse}`
//! pair.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Producer,
    Consumer,
    Filter,
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default = "defaults::target_buffer")]
    pub target_buffer: u32,
    #[serde(default = "defaults::dll_bandwidth")]
    pub dll_bandwidth: f32,
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "defaults::socket_path")]
    pub socket_path: String,
    #[serde(default = "defaults::max_inputs")]
    pub max_inputs: u32,
    #[serde(default = "defaults::max_outputs")]
    pub max_outputs: u32,
    #[serde(default = "defaults::ring_size")]
    pub ring_size: u32,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub node: Vec<NodeConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn socket_path() -> String {
        "/run/graphd/graphd-0".into()
    }

    pub fn max_inputs() -> u32 {
        64
    }

    pub fn max_outputs() -> u32 {
        64
    }

    pub fn ring_size() -> u32 {
        4096
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn target_buffer() -> u32 {
        1024
    }

    pub fn dll_bandwidth() -> f32 {
        0.5
    }
}

impl DaemonConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.to_string(), source })?;
        let config: DaemonConfig = toml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_applies_defaults_for_omitted_fields() {
        let dir = std::env::temp_dir().join(format!("transport-config-test-{}", std::process::id()));
        std::fs::write(&dir, "[[node]]\nname = \"mic\"\nkind = \"producer\"\n").unwrap();
        let config = DaemonConfig::load(dir.to_str().unwrap()).unwrap();
        std::fs::remove_file(&dir).unwrap();

        assert_eq!(config.ring_size, 4096);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.node.len(), 1);
        assert_eq!(config.node[0].kind, NodeKind::Producer);
        assert_eq!(config.node[0].target_buffer, 1024);
    }

    #[test]
    fn load_missing_file_is_a_read_error() {
        let err = DaemonConfig::load("/nonexistent/graphd.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_malformed_toml_is_a_parse_error() {
        let dir = std::env::temp_dir().join(format!("transport-config-bad-{}", std::process::id()));
        std::fs::write(&dir, "this is not toml : :").unwrap();
        let err = DaemonConfig::load(dir.to_str().unwrap()).unwrap_err();
        std::fs::remove_file(&dir).unwrap();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
