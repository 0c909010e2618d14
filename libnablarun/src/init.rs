//! Entry point for `nablarun init`, the process the supervisor forks
//! and re-execs itself into. Reads its config off the init pipe, runs
//! the filesystem Run phase, enters the configured network namespace,
//! runs prestart hooks, runs the network Run phase, signals the start
//! barrier, then either blocks forever (pause container) or hands off
//! to the exec handler, which never returns. Mirrors `init_nabla.go`'s
//! `initNabla`.

use std::{
    fs::File,
    io::Write,
    os::unix::io::{AsRawFd, FromRawFd},
    path::Path,
    time::Duration,
};

use anyhow::{Context, Error};
use fehler::throws;
use llif::{HandlerSet, Input};
use nix::sched::CloneFlags;
use serde::Deserialize;

use crate::{
    hooks,
    supervisor::{INITPIPE_ENV, STATEDIR_ENV},
};

#[derive(Deserialize)]
struct InitConfig {
    container_id: String,
    container_root: std::path::PathBuf,
    bundle_path: std::path::PathBuf,
    config: bundle::RuntimeConfig,
    fs_state: llif::HState,
    net_state: llif::HState,
    exec_state: llif::HState,
}

/// Runs the init process to completion. On success this never
/// returns -- the exec handler's `run` replaces the process image (or,
/// for a pause container, this function blocks forever itself). Only
/// a failure anywhere before that point produces an `Err`.
#[throws]
pub fn run(handlers: &HandlerSet) {
    let pipe_fd = env_fd(INITPIPE_ENV)?;
    let statedir_fd = env_fd(STATEDIR_ENV)?;

    let pipe = unsafe { File::from_raw_fd(pipe_fd) };
    let init_config: InitConfig = serde_json::from_reader(pipe).context("reading init config from pipe")?;

    let statedir = unsafe { File::from_raw_fd(statedir_fd) };

    // The two env vars that named these fds are meaningless to
    // anything this process execs into next and would otherwise leak.
    std::env::remove_var(INITPIPE_ENV);
    std::env::remove_var(STATEDIR_ENV);

    let mut input = Input::new(init_config.container_id, init_config.container_root, init_config.config);
    input.fs_state = init_config.fs_state;
    input.net_state = init_config.net_state;
    input.exec_state = init_config.exec_state;

    input.fs_state = handlers.fs.run(&input).context("filesystem run phase")?;

    enter_network_namespace(input.config.netns_path.as_deref()).context("entering network namespace")?;

    if let Some(prestart) = input.config.hooks.as_ref().and_then(|hooks| hooks.prestart.as_ref()) {
        let pid = std::process::id() as i32;
        hooks::run_prestart_hooks(prestart, &input.container_id, &init_config.bundle_path.to_string_lossy(), pid)
            .context("running prestart hooks")?;
    }

    input.net_state = handlers.network.run(&input).context("network run phase")?;

    signal_barrier(&statedir)?;

    if input.config.is_pause_nabla() {
        block_forever();
    }

    match handlers.exec.run(&input) {
        Ok(never) => match never {},
        Err(err) => fehler::throw!(err.context("exec run phase")),
    }
}

/// Enters `netns_path` if the bundle names one, otherwise unshares a
/// fresh network namespace -- every container gets its own, the same
/// way the original implementation's `network_linux.go` always
/// operates inside one rather than the host's.
#[throws]
fn enter_network_namespace(netns_path: Option<&Path>) {
    match netns_path {
        Some(path) => {
            let netns = File::open(path).with_context(|| format!("opening netns {:?}", path))?;
            nix::sched::setns(netns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
                .with_context(|| format!("entering netns {:?}", path))?;
        }
        None => {
            nix::sched::unshare(CloneFlags::CLONE_NEWNET).context("unsharing a fresh network namespace")?;
        }
    }
}

/// A pause container's sole purpose is to hold its network namespace
/// open for the pod's other containers; it never execs a unikernel.
/// Sleeping in a loop (rather than a single infinite sleep) keeps this
/// interruptible by a signal between iterations, matching how `kill`
/// on a real, schedulable process is expected to behave.
fn block_forever() -> ! {
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

#[throws]
fn signal_barrier(statedir: &File) {
    let mut writer = store::open_barrier_write_at(statedir).context("opening start barrier for writing")?;
    writer.write_all(&[1]).context("signaling start barrier")?;
}

#[throws]
fn env_fd(name: &str) -> std::os::unix::io::RawFd {
    std::env::var(name)
        .with_context(|| format!("reading {} from environment", name))?
        .parse()
        .with_context(|| format!("{} is not a valid fd number", name))?
}
