pub mod runtime_config;

use std::{
    convert::AsRef,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Error};

pub use runtime_config::{Mount, NetworkMode, Process, Root, RuntimeConfig};

/// An OCI bundle: a directory holding `config.json` plus the resources
/// it refers to. Resolves the rootfs to an absolute path and derives the
/// `bundle=<path>` label the way an embedding engine expects to find it
/// back on `state`.
#[derive(Debug)]
pub struct Bundle {
    pub path: PathBuf,
    pub config: RuntimeConfig,
}

impl Bundle {
    #[fehler::throws]
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let config_file = File::open(path.join("config.json"))?;
        let reader = BufReader::new(config_file);
        let mut config: RuntimeConfig = serde_json::from_reader(reader)?;

        let rootfs_path = config
            .root
            .as_ref()
            .map(|root| path.join(&root.path))
            .ok_or_else(|| anyhow!("runtime config: root field must be set"))?;

        config.root = Some(Root {
            path: rootfs_path,
            readonly: config.root.as_ref().and_then(|root| root.readonly),
        });

        config
            .labels
            .insert("bundle".into(), path.display().to_string());

        tracing::debug!(bundle = %path.display(), "loaded bundle");

        Self {
            path: path.into(),
            config,
        }
    }

    pub fn rootfs(&self) -> &Path {
        self.config
            .root
            .as_ref()
            .map(|root| root.path.as_path())
            .expect("root is always set by Bundle::load")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_derives_bundle_label_and_rootfs() {
        let dir = test_helpers::fixture_path!("container");

        let bundle = Bundle::load(dir).expect("failed to load bundle");

        assert_eq!(
            bundle.config.labels.get("bundle").map(String::as_str),
            Some(dir.to_str().unwrap())
        );
        assert!(bundle.rootfs().starts_with(dir));
    }
}
