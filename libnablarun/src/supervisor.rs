//! Forks the init process and hands it its configuration. Mirrors
//! `nablaContainer.start`/`commandTemplate`: a sealed `AF_UNIX`
//! socketpair carries the JSON config across `exec`, and the
//! container directory is handed over as a bare fd so the init
//! process can `openat` the start barrier relative to it instead of
//! by path (closing off a substitution race between `create` and
//! `start`).

use std::{
    fs::File,
    os::unix::{
        io::{AsRawFd, FromRawFd, RawFd},
        process::CommandExt,
    },
    path::Path,
    process::{Command, Stdio},
};

use anyhow::{Context, Error};
use fehler::throws;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use serde::Serialize;

pub const INITPIPE_ENV: &str = "_LIBCONTAINER_INITPIPE";
pub const STATEDIR_ENV: &str = "_LIBCONTAINER_STATEDIR";

/// Fixed fd numbers the child `dup2`s its pipe and statedir handle
/// onto before exec; the exact numbers are arbitrary, they just need
/// to not collide with stdio.
const CHILD_INITPIPE_FD: RawFd = 3;
const CHILD_STATEDIR_FD: RawFd = 4;

pub struct SpawnedInit {
    pub pid: i32,
    pub init_start_time: u64,
}

/// Config written across the init pipe. Deliberately thin: anything
/// the init process needs beyond this it re-derives from `config`
/// itself (the same `RuntimeConfig` the supervisor already has).
#[derive(Serialize)]
pub struct InitConfig<'a> {
    pub container_id: &'a str,
    pub container_root: &'a Path,
    /// OCI bundle path, carried across purely so init can put it in the
    /// `bundle` field of the prestart hooks' `State` JSON.
    pub bundle_path: &'a Path,
    pub config: &'a bundle::RuntimeConfig,
    pub fs_state: &'a llif::HState,
    pub net_state: &'a llif::HState,
    pub exec_state: &'a llif::HState,
}

#[throws]
pub fn spawn_init(self_exe: &Path, container_root: &Path, config: InitConfig<'_>) -> SpawnedInit {
    let (parent_sock, child_sock) = socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .context("creating init socketpair")?;

    let statedir = File::open(container_root).with_context(|| format!("opening {:?}", container_root))?;
    let statedir_fd = statedir.as_raw_fd();

    let mut command = Command::new(self_exe);
    command
        .arg("init")
        .current_dir(container_root)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .env(INITPIPE_ENV, CHILD_INITPIPE_FD.to_string())
        .env(STATEDIR_ENV, CHILD_STATEDIR_FD.to_string());

    unsafe {
        command.pre_exec(move || {
            move_fd(child_sock, CHILD_INITPIPE_FD)?;
            move_fd(statedir_fd, CHILD_STATEDIR_FD)?;
            Ok(())
        });
    }

    let mut child = command.spawn().context("spawning init process")?;

    // The parent's copy of the child's end isn't needed once the
    // child owns a dup of it; the fd that matters from here is
    // `parent_sock`, the supervisor's end of the pair.
    let _ = unsafe { File::from_raw_fd(child_sock) };
    drop(statedir);

    let mut parent_pipe = unsafe { File::from_raw_fd(parent_sock) };
    serde_json::to_writer(&mut parent_pipe, &config).context("writing init config")?;

    let pid = child.id() as i32;
    let init_start_time = process_start_time(pid)?;

    // The child inherited everything it needs across exec; if it
    // exits immediately (e.g. a malformed config) that surfaces later
    // as a dead pid on the first status refresh, not here.
    let _ = child.try_wait();

    SpawnedInit { pid, init_start_time }
}

/// `dup2`s `fd` onto `target`, clearing `target`'s close-on-exec flag
/// so it survives into the child image. `fd` itself is left as-is;
/// its close-on-exec flag (if any) closes the original descriptor
/// once `dup2` returns, which is exactly what we want post-fork.
fn move_fd(fd: RawFd, target: RawFd) -> std::io::Result<()> {
    if fd != target {
        nix::unistd::dup2(fd, target).map_err(nix_error_to_io)?;
    }
    Ok(())
}

fn nix_error_to_io(source: nix::Error) -> std::io::Error {
    source
        .as_errno()
        .map(|errno| std::io::Error::from_raw_os_error(errno as i32))
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, source))
}

/// `/proc/<pid>/stat` field 22: ticks since boot the process started
/// at. Captured once here and compared on every later status refresh
/// to detect pid reuse, the same technique `system.GetProcessStartTime`
/// uses in the original implementation's supervising process.
#[throws]
pub fn process_start_time(pid: i32) -> u64 {
    let contents = std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .with_context(|| format!("reading /proc/{}/stat", pid))?;

    // Field 2 (comm) can itself contain spaces and parens; splitting
    // on the last ')' is the documented way to skip past it safely.
    let after_comm = contents
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .unwrap_or(&contents);

    after_comm
        .split_whitespace()
        .nth(19) // field 22 minus the 2 fields already consumed (pid, comm)
        .and_then(|field| field.parse().ok())
        .context("parsing starttime field out of /proc/<pid>/stat")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_start_time_reads_current_process() {
        let pid = std::process::id() as i32;
        let start_time = process_start_time(pid).expect("should read our own stat file");
        assert!(start_time > 0);
    }
}
