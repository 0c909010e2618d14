//! On-disk persistence for container state: the state document, the
//! start barrier (a named pipe), and the container directory itself.
//!
//! Unlike the generic, swappable key/value cache this crate's
//! predecessor offered, there is exactly one sensible backend here --
//! the filesystem, because the supervisor and the init process
//! rendezvous *through* the container directory (the barrier FIFO, the
//! state-dir file descriptor handed across the init pipe). `ContainerStore`
//! stays a trait purely so tests can substitute a throwaway tempdir
//! without reaching into a shared location.

pub mod error;

use std::{
    fs::{self, File, OpenOptions},
    os::unix::{fs::PermissionsExt, io::AsRawFd},
    path::{Path, PathBuf},
};

use bundle::RuntimeConfig;
use chrono::{DateTime, Utc};
use llif::HState;
use nix::unistd;
use serde::{Deserialize, Serialize};

pub use error::RuntimeError;

pub const STATE_FILENAME: &str = "state.json";
pub const BARRIER_FILENAME: &str = "exec.fifo";
const MAX_ID_LEN: usize = 1024;

/// `[\w+\-.]{1,1024}`, checked by hand: none of this crate's
/// dependencies already reach for a regex engine, and a character-class
/// check over a short string doesn't need one.
pub fn validate_id(id: &str) -> Result<(), RuntimeError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-' | '.')
        });

    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidIdFormat(id.into()))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Stopped,
    Created,
    Running,
    /// Defined for OCI-status compatibility; this runtime never enters it.
    Paused,
}

/// The full persisted state of a container: everything the supervisor
/// needs to resume driving the lifecycle after exiting and
/// re-invoking, plus everything `state`'s JSON output is built from.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ContainerState {
    pub id: String,
    pub config: RuntimeConfig,
    pub created: DateTime<Utc>,
    pub init_pid: i32,
    /// Kernel start-time of `init_pid` (ticks since boot, `/proc/pid/stat`
    /// field 22), captured once at `Created` and compared against the
    /// live value on every status refresh to detect pid reuse.
    pub init_start_time: u64,
    pub fs_state: HState,
    pub net_state: HState,
    pub exec_state: HState,
    pub status: ContainerStatus,
}

impl ContainerState {
    pub fn new(id: impl Into<String>, config: RuntimeConfig) -> Self {
        Self {
            id: id.into(),
            config,
            created: Utc::now(),
            init_pid: 0,
            init_start_time: 0,
            fs_state: HState::default(),
            net_state: HState::default(),
            exec_state: HState::default(),
            status: ContainerStatus::Stopped,
        }
    }
}

pub trait ContainerStore {
    fn mkdir_container(&self, id: &str) -> Result<PathBuf, RuntimeError>;
    fn container_dir(&self, id: &str) -> PathBuf;
    fn write_state(&self, id: &str, state: &ContainerState) -> Result<(), RuntimeError>;
    fn read_state(&self, id: &str) -> Result<ContainerState, RuntimeError>;
    fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
    fn exists(&self, id: &str) -> bool;

    /// Creates the start barrier FIFO, mode 0622, inside the container
    /// directory. Umask is cleared around the call so the mode sticks
    /// (matching the original implementation's handling of `mkfifo`).
    fn make_barrier(&self, id: &str) -> Result<(), RuntimeError>;

    /// Opens the barrier for reading. Blocks until a writer (the init
    /// process) opens its end -- this *is* the start synchronization
    /// point, not merely a detail of it.
    fn open_barrier_read(&self, id: &str) -> Result<File, RuntimeError>;

    fn remove_barrier(&self, id: &str) -> Result<(), RuntimeError>;
    fn barrier_exists(&self, id: &str) -> bool;
}

/// Directory-backed `ContainerStore`: `<root>/<id>/{state.json,exec.fifo}`.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    #[fehler::throws(RuntimeError)]
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|source| RuntimeError::SystemError {
            context: format!("creating store root {:?}", root),
            source,
        })?;

        Self { root: root.into() }
    }

    fn state_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(STATE_FILENAME)
    }

    fn barrier_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(BARRIER_FILENAME)
    }
}

impl ContainerStore for DirStore {
    #[fehler::throws(RuntimeError)]
    fn mkdir_container(&self, id: &str) -> PathBuf {
        validate_id(id)?;
        let dir = self.container_dir(id);

        fs::create_dir(&dir).map_err(|source| match source.kind() {
            std::io::ErrorKind::AlreadyExists => RuntimeError::IdInUse(id.into()),
            _ => RuntimeError::SystemError {
                context: format!("creating container directory {:?}", dir),
                source,
            },
        })?;

        fs::set_permissions(&dir, fs::Permissions::from_mode(0o711)).map_err(|source| {
            RuntimeError::SystemError {
                context: format!("chmod container directory {:?}", dir),
                source,
            }
        })?;

        tracing::info!(%id, ?dir, "created container directory");

        dir
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    #[fehler::throws(RuntimeError)]
    fn write_state(&self, id: &str, state: &ContainerState) {
        let path = self.state_path(id);
        let file = File::create(&path).map_err(|source| RuntimeError::SystemError {
            context: format!("creating {:?}", path),
            source,
        })?;

        serde_json::to_writer(file, state).map_err(|source| RuntimeError::ConfigInvalid {
            context: "serializing container state".into(),
            source: source.into(),
        })?;
    }

    #[fehler::throws(RuntimeError)]
    fn read_state(&self, id: &str) -> ContainerState {
        let path = self.state_path(id);
        let file = File::open(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => RuntimeError::ContainerNotExists(id.into()),
            _ => RuntimeError::SystemError {
                context: format!("opening {:?}", path),
                source,
            },
        })?;

        serde_json::from_reader(file).map_err(|source| RuntimeError::ConfigInvalid {
            context: format!("parsing {:?}", path),
            source: source.into(),
        })?
    }

    #[fehler::throws(RuntimeError)]
    fn remove_container(&self, id: &str) {
        let dir = self.container_dir(id);
        fs::remove_dir_all(&dir).map_err(|source| RuntimeError::SystemError {
            context: format!("removing container directory {:?}", dir),
            source,
        })?;
    }

    fn exists(&self, id: &str) -> bool {
        self.state_path(id).exists()
    }

    #[fehler::throws(RuntimeError)]
    fn make_barrier(&self, id: &str) {
        let path = self.barrier_path(id);

        // Clear the umask around mkfifo so the 0622 mode actually
        // sticks; restored immediately after.
        let previous = unsafe { libc::umask(0) };
        let result = unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o622));
        unsafe {
            libc::umask(previous);
        }

        result.map_err(|source| RuntimeError::SystemError {
            context: format!("mkfifo {:?}", path),
            source: nix_error_to_io(source),
        })?;
    }

    #[fehler::throws(RuntimeError)]
    fn open_barrier_read(&self, id: &str) -> File {
        let path = self.barrier_path(id);

        OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|source| RuntimeError::SystemError {
                context: format!("opening barrier {:?} for reading", path),
                source,
            })?
    }

    #[fehler::throws(RuntimeError)]
    fn remove_barrier(&self, id: &str) {
        let path = self.barrier_path(id);
        if let Err(source) = fs::remove_file(&path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                fehler::throw!(RuntimeError::SystemError {
                    context: format!("removing barrier {:?}", path),
                    source,
                });
            }
        }
    }

    fn barrier_exists(&self, id: &str) -> bool {
        self.barrier_path(id).exists()
    }
}

/// Opens the write side of the barrier relative to an already-open
/// directory file descriptor, so the init process can't be tricked
/// into writing to a FIFO substituted after the directory was handed
/// off. Mirrors `openat(statedir_fd, "exec.fifo", O_WRONLY|O_CLOEXEC)`.
#[fehler::throws(RuntimeError)]
pub fn open_barrier_write_at(dirfd: &File) -> File {
    use nix::fcntl::{self, OFlag};

    let fd = fcntl::openat(
        dirfd.as_raw_fd(),
        Path::new(BARRIER_FILENAME),
        OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        nix::sys::stat::Mode::empty(),
    )
    .map_err(|source| RuntimeError::SystemError {
        context: "openat exec.fifo for writing".into(),
        source: nix_error_to_io(source),
    })?;

    use std::os::unix::io::FromRawFd;
    unsafe { File::from_raw_fd(fd) }
}

fn nix_error_to_io(source: nix::Error) -> std::io::Error {
    source
        .as_errno()
        .map(|errno| std::io::Error::from_raw_os_error(errno as i32))
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn store() -> (DirStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (DirStore::new(dir.path()).unwrap(), dir)
    }

    fn config() -> RuntimeConfig {
        serde_json::from_str(test_helpers::fixture!("minimal_config.json")).unwrap()
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("my-container_1.0").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("has a space").is_err());
        assert!(validate_id(&"a".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_mkdir_container_then_reject_duplicate() {
        let (store, _dir) = store();

        store.mkdir_container("c1").expect("first create should succeed");

        let err = store.mkdir_container("c1").unwrap_err();
        assert!(matches!(err, RuntimeError::IdInUse(_)));
    }

    #[test]
    fn test_write_then_read_state_round_trips() {
        let (store, _dir) = store();
        store.mkdir_container("c1").unwrap();

        let state = ContainerState::new("c1", config());
        store.write_state("c1", &state).unwrap();

        let read_back = store.read_state("c1").unwrap();
        assert_eq!(read_back.id, "c1");
        assert_eq!(read_back.status, ContainerStatus::Stopped);
        assert_eq!(read_back.init_pid, 0);
    }

    #[test]
    fn test_read_state_missing_container_is_not_exists() {
        let (store, _dir) = store();

        let err = store.read_state("ghost").unwrap_err();
        assert!(matches!(err, RuntimeError::ContainerNotExists(_)));
    }

    #[test]
    fn test_barrier_round_trip() {
        let (store, _dir) = store();
        store.mkdir_container("c1").unwrap();
        store.make_barrier("c1").unwrap();

        assert!(store.barrier_exists("c1"));

        let dir_handle = File::open(store.container_dir("c1")).unwrap();
        let writer_thread = std::thread::spawn({
            let dir_handle = dir_handle.try_clone().unwrap();
            move || {
                let mut writer = open_barrier_write_at(&dir_handle).unwrap();
                writer.write_all(&[1]).unwrap();
            }
        });

        let mut reader = store.open_barrier_read("c1").unwrap();
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).unwrap();
        writer_thread.join().unwrap();

        assert_eq!(buf, [1]);

        store.remove_barrier("c1").unwrap();
        assert!(!store.barrier_exists("c1"));
    }

    #[test]
    fn test_remove_container_deletes_directory() {
        let (store, _dir) = store();
        let dir = store.mkdir_container("c1").unwrap();
        store.write_state("c1", &ContainerState::new("c1", config())).unwrap();

        store.remove_container("c1").unwrap();

        assert!(!dir.exists());
        assert!(!store.exists("c1"));
    }
}
