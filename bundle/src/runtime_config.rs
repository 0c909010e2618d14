use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default amount of memory handed to the monitor when the bundle
/// doesn't request a specific size.
pub const DEFAULT_MEMORY_MIB: u32 = 512;

/// The sentinel entrypoint name `args` is rewritten to once a pause
/// container's hack has been applied. Distinct from the pre-rewrite
/// `/pause` string `is_pause_sentinel` matches against.
pub const PAUSE_NABLA_NAME: &str = "pause.nabla";

/// How the network handler should wire up the container's single
/// network interface. Resolved from the `nablarun.network/mode`
/// annotation; defaults to `Bridge`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Bridge,
    Macvtap,
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::Bridge
    }
}

/// Represents the subset of the [OCI Container Configuration
/// file](https://github.com/opencontainers/runtime-spec/blob/v1.0.0/config.md)
/// this runtime reads.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(rename = "ociVersion")]
    pub oci_version: String,
    pub root: Option<Root>,
    pub mounts: Option<Vec<Mount>>,
    pub process: Option<Process>,
    pub hooks: Option<Hooks>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Host path to a network namespace to enter instead of creating a
    /// fresh one. Not part of the upstream `config.json` schema; carried
    /// across the init handshake as a first-class field instead of being
    /// smuggled through an annotation.
    #[serde(default)]
    pub netns_path: Option<PathBuf>,

    /// Labels surfaced on `state`: annotations plus a `bundle` entry
    /// filled in by `Bundle::load`. Not itself part of `config.json`;
    /// populated after deserialization.
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Memory, in MiB, handed to the monitor's `--mem` flag.
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
}

fn default_memory_mib() -> u32 {
    DEFAULT_MEMORY_MIB
}

impl RuntimeConfig {
    pub fn network_mode(&self) -> NetworkMode {
        match self.annotations.get("nablarun.network/mode").map(String::as_str) {
            Some("macvtap") => NetworkMode::Macvtap,
            _ => NetworkMode::Bridge,
        }
    }

    /// True when this is the Kubernetes pod-pause sentinel container,
    /// as named on the wire (`args == ["/pause"]`, before the hack is
    /// applied).
    pub fn is_pause_sentinel(&self) -> bool {
        matches!(
            self.process.as_ref().and_then(|p| p.args.as_ref()).map(Vec::as_slice),
            Some([only]) if only == "/pause"
        )
    }

    /// True once `apply_pause_hack` has rewritten `args` to the
    /// sentinel binary name. Init checks this, not `is_pause_sentinel`,
    /// since by the time init runs the rewrite has already happened.
    pub fn is_pause_nabla(&self) -> bool {
        matches!(
            self.process.as_ref().and_then(|p| p.args.as_ref()).map(Vec::as_slice),
            Some([only]) if only == PAUSE_NABLA_NAME
        )
    }

    /// Rewrites `args` to the pause sentinel binary name. Caller must
    /// have already confirmed `is_pause_sentinel()`.
    pub fn apply_pause_hack(&mut self) {
        if let Some(process) = self.process.as_mut() {
            process.args = Some(vec![PAUSE_NABLA_NAME.to_owned()]);
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Root {
    pub path: PathBuf,
    pub readonly: Option<bool>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Mount {
    pub destination: String,
    pub source: Option<String>,
    pub options: Option<Vec<String>>,
    pub r#type: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Process {
    pub terminal: Option<bool>,
    #[serde(rename = "consoleSize")]
    pub console_size: Option<ConsoleSize>,
    pub cwd: String,
    pub env: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub rlimits: Option<Vec<Rlimit>>,
    pub user: User,
    pub hostname: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConsoleSize {
    pub height: u32,
    pub width: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Rlimit {
    pub r#type: String,
    pub soft: u32,
    pub hard: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    pub umask: Option<u32>,
    #[serde(rename = "additionalGids")]
    pub additional_gids: Option<Vec<u32>>,
}

/// Only the prestart stage is meaningful to this runtime (see
/// `monitor`'s handling of `Exec.Run` never returning: there is no
/// later point at which `createContainer`/`startContainer` hooks could
/// run). The other stages are still deserialized so a bundle produced
/// for a different runtime doesn't fail to parse here, but they are
/// never invoked.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Hooks {
    pub prestart: Option<Vec<Hook>>,
    #[serde(rename = "createRuntime")]
    pub create_runtime: Option<Vec<Hook>>,
    #[serde(rename = "createContainer")]
    pub create_container: Option<Vec<Hook>>,
    #[serde(rename = "startContainer")]
    pub start_container: Option<Vec<Hook>>,
    pub poststart: Option<Vec<Hook>>,
    pub poststop: Option<Vec<Hook>>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Hook {
    pub path: String,
    pub args: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub timeout: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialization() {
        let fixture = test_helpers::fixture!("runtime_config.json");

        let config: RuntimeConfig = serde_json::from_str(fixture)
            .expect("failed to deserialize runtime config");

        assert_eq!(
            config.process.unwrap().rlimits.unwrap()[0].r#type,
            "RLIMIT_NOFILE"
        );
        assert_eq!(
            config.mounts.unwrap()[0].options.as_ref().unwrap()[0],
            "nosuid"
        );
        assert_eq!(config.memory_mib, DEFAULT_MEMORY_MIB);
    }

    #[test]
    fn test_network_mode_defaults_to_bridge() {
        let fixture = test_helpers::fixture!("runtime_config.json");
        let config: RuntimeConfig = serde_json::from_str(fixture).unwrap();

        assert_eq!(config.network_mode(), NetworkMode::Bridge);
    }

    #[test]
    fn test_network_mode_macvtap_annotation() {
        let fixture = test_helpers::fixture!("runtime_config_macvtap.json");
        let config: RuntimeConfig = serde_json::from_str(fixture).unwrap();

        assert_eq!(config.network_mode(), NetworkMode::Macvtap);
    }

    #[test]
    fn test_pause_sentinel_detection() {
        let fixture = test_helpers::fixture!("runtime_config_pause.json");
        let config: RuntimeConfig = serde_json::from_str(fixture).unwrap();

        assert!(config.is_pause_sentinel());
    }

    #[test]
    fn test_apply_pause_hack_rewrites_args() {
        let fixture = test_helpers::fixture!("runtime_config_pause.json");
        let mut config: RuntimeConfig = serde_json::from_str(fixture).unwrap();

        assert!(config.is_pause_sentinel());
        assert!(!config.is_pause_nabla());

        config.apply_pause_hack();

        assert!(!config.is_pause_sentinel());
        assert!(config.is_pause_nabla());
        assert_eq!(
            config.process.unwrap().args.unwrap(),
            vec![PAUSE_NABLA_NAME.to_owned()]
        );
    }
}
