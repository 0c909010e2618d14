//! Filesystem handler: stages a container's rootfs and OCI mounts into
//! an ISO 9660 + Rock Ridge image the monitor hands to the unikernel
//! as its boot disk, following the original implementation's
//! `CreateIso`/`iso_storage.go`.
//!
//! There's no ISO-writing crate anywhere in this codebase's dependency
//! stack, and pulling one in without the original author's buy-in
//! would be inventing a dependency rather than learning one: this
//! shells out to `genisoimage` exactly as `storage_linux.go` does.

mod mount;

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{anyhow, Context, Error};
use bundle::Mount as ConfigMount;
use fehler::throws;
use llif::{FsHandler, HState, Input};

use mount::prefixed_destination;

const ISO_FILENAME: &str = "rootfs.iso";

/// Directories never copied into the image: the unikernel monitor
/// creates its own views of these inside the guest, and the original
/// implementation excludes exactly this set with `genisoimage`'s `-m`.
const EXCLUDED: [&str; 3] = ["dev", "sys", "proc"];

/// The only mount destinations staged into the image. Matches
/// `createRootfsISO`'s copy loop exactly -- every other mount is left
/// for the monitor/guest to deal with, not baked into the boot disk.
const STAGED_DESTINATIONS: [&str; 3] = ["/etc/resolv.conf", "/etc/hosts", "/etc/hostname"];

pub struct Handler;

impl FsHandler for Handler {
    fn create(&self, input: &Input) -> Result<HState, Error> {
        create(input)
    }

    fn run(&self, input: &Input) -> Result<HState, Error> {
        // The ISO was already built and handed to the monitor as a
        // boot disk at Create time; nothing left to do once the
        // container is actually running.
        Ok(input.fs_state.clone())
    }

    fn destroy(&self, input: &Input) -> Result<HState, Error> {
        destroy(input)
    }
}

#[throws]
fn create(input: &Input) -> HState {
    let rootfs = input.rootfs();

    stage_mounts(rootfs, input.config.mounts.as_deref().unwrap_or(&[]))?;

    let iso_path = input.container_root.join(ISO_FILENAME);
    build_iso(rootfs, &iso_path)?;

    tracing::info!(?iso_path, "staged container rootfs image");

    HState::default().with_option("FsPath", iso_path.to_string_lossy())
}

#[throws]
fn destroy(input: &Input) -> HState {
    let iso_path = input.container_root.join(ISO_FILENAME);

    if iso_path.exists() {
        std::fs::remove_file(&iso_path).with_context(|| format!("removing {:?}", iso_path))?;
    }

    HState::default()
}

/// Copies each bind mount's source into its sanitized destination
/// inside `rootfs`, restricted to the three destinations the original
/// implementation's `createRootfsISO` copies -- every other mount is
/// the guest's own problem, not baked into the boot disk. Real mount
/// namespaces don't apply here: everything ends up baked into a static
/// ISO, so "mounting" is just staging.
#[throws]
fn stage_mounts(rootfs: &Path, mounts: &[ConfigMount]) {
    for mount in mounts {
        if !STAGED_DESTINATIONS.contains(&mount.destination.as_str()) {
            continue;
        }

        let source = match &mount.source {
            Some(source) => source,
            None => continue,
        };

        let destination = prefixed_destination(rootfs, &mount.destination);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {:?}", parent))?;
        }

        copy_recursive(Path::new(source), &destination)?;
    }
}

#[throws]
fn copy_recursive(source: &Path, destination: &Path) {
    let metadata = source
        .metadata()
        .with_context(|| format!("statting mount source {:?}", source))?;

    if metadata.is_dir() {
        let status = Command::new("cp")
            .args(["-a", "-T"])
            .arg(source)
            .arg(destination)
            .status()
            .with_context(|| format!("running cp -a {:?} {:?}", source, destination))?;

        if !status.success() {
            fehler::throw!(anyhow!("cp -a {:?} {:?} exited with {}", source, destination, status));
        }
    } else {
        std::fs::copy(source, destination)
            .with_context(|| format!("copying {:?} -> {:?}", source, destination))?;
    }
}

#[throws]
fn build_iso(rootfs: &Path, iso_path: &Path) {
    let mut command = Command::new("genisoimage");
    for excluded in &EXCLUDED {
        command.arg("-m").arg(excluded);
    }
    command.args(["-l", "-r", "-o"]).arg(iso_path).arg(rootfs);

    let status = command
        .status()
        .context("running genisoimage; is it installed?")?;

    if !status.success() {
        fehler::throw!(anyhow!("genisoimage exited with {}", status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_mounts_only_copies_staged_destinations() {
        let source_dir = tempfile::tempdir().unwrap();
        std::fs::write(source_dir.path().join("resolv.conf"), "nameserver 1.1.1.1\n").unwrap();
        std::fs::write(source_dir.path().join("data.bin"), b"payload").unwrap();

        let rootfs = tempfile::tempdir().unwrap();
        let mounts = vec![
            ConfigMount {
                destination: "/etc/resolv.conf".into(),
                source: Some(source_dir.path().join("resolv.conf").to_string_lossy().into_owned()),
                options: None,
                r#type: None,
            },
            ConfigMount {
                destination: "/data/payload.bin".into(),
                source: Some(source_dir.path().join("data.bin").to_string_lossy().into_owned()),
                options: None,
                r#type: None,
            },
        ];

        stage_mounts(rootfs.path(), &mounts).unwrap();

        assert!(rootfs.path().join("etc/resolv.conf").exists());
        assert!(!rootfs.path().join("data/payload.bin").exists());
    }

    #[test]
    fn test_destroy_removes_iso_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join(ISO_FILENAME);
        std::fs::write(&iso, b"fake iso").unwrap();

        let input = Input::new("c1", dir.path(), test_config());
        destroy(&input).unwrap();

        assert!(!iso.exists());
    }

    fn test_config() -> bundle::RuntimeConfig {
        serde_json::from_str(test_helpers::fixture!("minimal_config.json")).unwrap()
    }
}
