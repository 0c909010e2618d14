//! Picks the file the monitor attaches as the rootfs disk, following
//! `runnc_cont.go`'s `setupDisk`: a staged ISO is used as-is, a
//! missing path gets a throwaway empty file (the monitor still wants
//! *some* disk argument even for a diskless unikernel), and a
//! directory is rejected outright since this runtime never flattens
//! one into an image at this stage -- that's `isofs`'s job, earlier.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Error};
use fehler::throws;

#[throws]
pub fn setup_disk(path: Option<&Path>) -> PathBuf {
    match path {
        None => create_dummy_disk()?,
        Some(path) => {
            let metadata = path.metadata().with_context(|| format!("statting disk {:?}", path))?;

            if metadata.is_dir() {
                fehler::throw!(anyhow!("input storage {:?} is not an ISO", path));
            }

            path.to_owned()
        }
    }
}

#[throws]
fn create_dummy_disk() -> PathBuf {
    let file = tempfile::Builder::new()
        .prefix("nablarun")
        .tempfile_in("/tmp")
        .context("creating dummy disk file")?;

    // Leak the `NamedTempFile` into a plain path: the disk needs to
    // outlive this function (the monitor opens it after exec), so
    // tying its deletion to a `Drop` here would be wrong.
    let (_, path) = file.keep().context("persisting dummy disk file")?;
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_file_is_used_as_is() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let disk = setup_disk(Some(file.path())).unwrap();
        assert_eq!(disk, file.path());
    }

    #[test]
    fn test_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = setup_disk(Some(dir.path())).unwrap_err();
        assert!(err.to_string().contains("is not an ISO"));
    }

    #[test]
    fn test_missing_path_creates_a_dummy_disk() {
        let disk = setup_disk(None).unwrap();
        assert!(disk.exists());
        std::fs::remove_file(disk).unwrap();
    }
}
