//! The five lifecycle operations (`create`, `start`, `state`, `kill`,
//! `delete`) tying `HandlerSet`, `ContainerStore` and the
//! supervisor/init handshake together. Mirrors `container_nabla.go`'s
//! `Create`/`Start`/`Status`/`Signal`/`Destroy`.

use std::{path::PathBuf, thread, time::Duration};

use anyhow::Error;
use bundle::Bundle;
use fehler::throws;
use llif::{HandlerSet, Input};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use store::{ContainerState, ContainerStatus, ContainerStore, RuntimeError};

use crate::supervisor;

/// Force-kill poll budget: ten seconds at 100ms, matching the patience
/// most orchestrators (kubelet included) give a container to die
/// before declaring the node unhealthy.
const FORCE_KILL_POLLS: u32 = 100;
const FORCE_KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Runtime<S: ContainerStore> {
    pub store: S,
    pub handlers: HandlerSet,
    pub self_exe: PathBuf,
}

impl<S: ContainerStore> Runtime<S> {
    #[throws(RuntimeError)]
    pub fn create(&self, id: &str, bundle: &Bundle) {
        let dir = self.store.mkdir_container(id)?;

        let mut config = bundle.config.clone();
        let is_pause = config.is_pause_sentinel();
        if is_pause {
            config.apply_pause_hack();
        }

        let input = Input::new(id, dir.clone(), config);
        let input = if is_pause {
            self.create_handlers_skipping_fs(input)
        } else {
            self.handlers.create(input)
        }
        .map_err(|source| config_error("running create handlers", source))?;

        self.store.make_barrier(id)?;

        let init_config = supervisor::InitConfig {
            container_id: id,
            container_root: &dir,
            bundle_path: &bundle.path,
            config: &input.config,
            fs_state: &input.fs_state,
            net_state: &input.net_state,
            exec_state: &input.exec_state,
        };

        // Prestart hooks run inside init, between netns entry and
        // Network.Run, not here: the supervisor only spawns init and
        // records its pid.
        let spawned = supervisor::spawn_init(&self.self_exe, &dir, init_config)
            .map_err(|source| config_error("spawning init process", source))?;

        let mut state = ContainerState::new(id, input.config.clone());
        state.init_pid = spawned.pid;
        state.init_start_time = spawned.init_start_time;
        state.fs_state = input.fs_state;
        state.net_state = input.net_state;
        state.exec_state = input.exec_state;
        state.status = ContainerStatus::Created;

        self.store.write_state(id, &state)?;
    }

    #[throws(RuntimeError)]
    pub fn start(&self, id: &str) {
        let mut state = self.refresh(id)?;

        if state.status != ContainerStatus::Created {
            fehler::throw!(RuntimeError::ContainerNotStopped {
                action: "start".into(),
                status: status_name(state.status).into(),
            });
        }

        let mut barrier = self.store.open_barrier_read(id)?;
        let mut buf = [0u8; 1];
        std::io::Read::read_exact(&mut barrier, &mut buf).map_err(|source| RuntimeError::SystemError {
            context: format!("reading start barrier for {:?}", id),
            source,
        })?;
        self.store.remove_barrier(id)?;

        state.status = ContainerStatus::Running;
        self.store.write_state(id, &state)?;
    }

    #[throws(RuntimeError)]
    pub fn state(&self, id: &str) -> ContainerState {
        self.refresh(id)?
    }

    #[throws(RuntimeError)]
    pub fn kill(&self, id: &str, sig: Signal, force: bool) {
        let state = self.refresh(id)?;

        if state.status != ContainerStatus::Running {
            fehler::throw!(RuntimeError::ContainerNotRunning {
                action: "kill".into(),
                status: status_name(state.status).into(),
            });
        }

        let pid = Pid::from_raw(state.init_pid);
        signal::kill(pid, sig).map_err(|source| RuntimeError::SystemError {
            context: format!("sending signal to {}", state.init_pid),
            source: nix_error_to_io(source),
        })?;

        if force {
            for _ in 0..FORCE_KILL_POLLS {
                if !is_alive(state.init_pid, state.init_start_time) {
                    return;
                }
                thread::sleep(FORCE_KILL_POLL_INTERVAL);
            }

            if is_alive(state.init_pid, state.init_start_time) {
                signal::kill(pid, Signal::SIGKILL).map_err(|source| RuntimeError::SystemError {
                    context: format!("force-killing {}", state.init_pid),
                    source: nix_error_to_io(source),
                })?;
            }
        }
    }

    #[throws(RuntimeError)]
    pub fn delete(&self, id: &str, force: bool) {
        let state = self.refresh(id)?;

        if state.status == ContainerStatus::Running {
            if !force {
                fehler::throw!(RuntimeError::ContainerNotStopped {
                    action: "delete".into(),
                    status: status_name(state.status).into(),
                });
            }
            self.kill(id, Signal::SIGKILL, true)?;
        }

        let dir = self.store.container_dir(id);
        let mut input = Input::new(id, dir.clone(), state.config.clone());
        input.fs_state = state.fs_state.clone();
        input.net_state = state.net_state.clone();
        input.exec_state = state.exec_state.clone();

        self.handlers
            .destroy(input)
            .map_err(|source| config_error("running destroy handlers", source))?;

        self.store.remove_container(id)?;
    }

    /// `HandlerSet::create` without the FS stage: a pause container
    /// never gets a rootfs ISO (§4.2 step 3), so Network.Create and
    /// Exec.Create run directly against the default `fs_state`.
    fn create_handlers_skipping_fs(&self, mut input: Input) -> Result<Input, Error> {
        input.net_state = self.handlers.network.create(&input)?;
        input.exec_state = self.handlers.exec.create(&input)?;
        Ok(input)
    }

    /// Re-derives the live status from the recorded pid and its
    /// captured start-time, persisting the correction when the init
    /// process has died without this runtime observing it directly
    /// (its own `wait4` is the supervisor's, not ours, across process
    /// restarts of the CLI itself).
    #[throws(RuntimeError)]
    fn refresh(&self, id: &str) -> ContainerState {
        let mut state = self.store.read_state(id)?;

        if state.status == ContainerStatus::Running && !is_alive(state.init_pid, state.init_start_time) {
            state.status = ContainerStatus::Stopped;
            self.store.write_state(id, &state)?;
        }

        state
    }
}

fn is_alive(pid: i32, expected_start_time: u64) -> bool {
    if signal::kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }

    matches!(supervisor::process_start_time(pid), Ok(start_time) if start_time == expected_start_time)
}

fn status_name(status: ContainerStatus) -> &'static str {
    match status {
        ContainerStatus::Stopped => "stopped",
        ContainerStatus::Created => "created",
        ContainerStatus::Running => "running",
        ContainerStatus::Paused => "paused",
    }
}

fn config_error(context: &str, source: Error) -> RuntimeError {
    RuntimeError::ConfigInvalid {
        context: context.into(),
        source,
    }
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
    use llif::{ExecHandler, FsHandler, HState, Input, NetworkHandler};
    use std::convert::Infallible;

    #[test]
    fn test_status_name_covers_every_variant() {
        assert_eq!(status_name(ContainerStatus::Stopped), "stopped");
        assert_eq!(status_name(ContainerStatus::Created), "created");
        assert_eq!(status_name(ContainerStatus::Running), "running");
        assert_eq!(status_name(ContainerStatus::Paused), "paused");
    }

    #[test]
    fn test_is_alive_false_for_implausible_pid() {
        assert!(!is_alive(i32::MAX, 0));
    }

    struct NoopFs;
    impl FsHandler for NoopFs {
        fn create(&self, _: &Input) -> Result<HState, Error> {
            Ok(HState::default().with_option("FsCreated", "true"))
        }
        fn run(&self, _: &Input) -> Result<HState, Error> {
            Ok(HState::default())
        }
        fn destroy(&self, _: &Input) -> Result<HState, Error> {
            Ok(HState::default())
        }
    }

    struct NoopNetwork;
    impl NetworkHandler for NoopNetwork {
        fn create(&self, _: &Input) -> Result<HState, Error> {
            Ok(HState::default())
        }
        fn run(&self, _: &Input) -> Result<HState, Error> {
            Ok(HState::default())
        }
        fn destroy(&self, _: &Input) -> Result<HState, Error> {
            Ok(HState::default())
        }
    }

    struct NoopExec;
    impl ExecHandler for NoopExec {
        fn create(&self, _: &Input) -> Result<HState, Error> {
            Ok(HState::default())
        }
        fn run(&self, _: &Input) -> Result<Infallible, Error> {
            Err(anyhow::anyhow!("test double never execs"))
        }
        fn destroy(&self, _: &Input) -> Result<HState, Error> {
            Ok(HState::default())
        }
    }

    fn test_runtime(tempdir: &tempfile::TempDir) -> Runtime<store::DirStore> {
        Runtime {
            store: store::DirStore::new(tempdir.path()).unwrap(),
            handlers: HandlerSet {
                fs: Box::new(NoopFs),
                network: Box::new(NoopNetwork),
                exec: Box::new(NoopExec),
            },
            // `/bin/true` stands in for the supervisor's own exe: it
            // exits immediately on "init", which is enough to let
            // `create` observe a pid without ever reaching the exec
            // handler (started by a separate, unrelated subcommand
            // this test never invokes).
            self_exe: PathBuf::from("/bin/true"),
        }
    }

    fn test_bundle(tempdir: &tempfile::TempDir) -> Bundle {
        let config: bundle::RuntimeConfig =
            serde_json::from_str(test_helpers::fixture!("minimal_config.json")).unwrap();
        Bundle {
            path: tempdir.path().to_owned(),
            config,
        }
    }

    #[test]
    fn test_create_persists_created_status() {
        let tempdir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(&tempdir);
        let bundle = test_bundle(&tempdir);

        runtime.create("c1", &bundle).expect("create should succeed");

        let state = runtime.store.read_state("c1").unwrap();
        assert_eq!(state.status, ContainerStatus::Created);
        assert_eq!(state.fs_state.option("FsCreated"), Some("true"));
        assert!(state.init_pid > 0);
    }

    #[test]
    fn test_create_skips_fs_and_rewrites_args_for_pause_container() {
        let tempdir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(&tempdir);
        let mut bundle = test_bundle(&tempdir);
        bundle.config.process.as_mut().unwrap().args = Some(vec!["/pause".to_owned()]);

        runtime.create("c1", &bundle).expect("create should succeed");

        let state = runtime.store.read_state("c1").unwrap();
        assert_eq!(state.fs_state.option("FsCreated"), None);
        assert_eq!(
            state.config.process.unwrap().args.unwrap(),
            vec![bundle::PAUSE_NABLA_NAME.to_owned()]
        );
    }

    #[test]
    fn test_create_rejects_duplicate_id() {
        let tempdir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(&tempdir);
        let bundle = test_bundle(&tempdir);

        runtime.create("c1", &bundle).unwrap();
        let err = runtime.create("c1", &bundle).unwrap_err();
        assert!(matches!(err, RuntimeError::IdInUse(_)));
    }

    #[test]
    fn test_delete_requires_force_while_running() {
        let tempdir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(&tempdir);
        let bundle = test_bundle(&tempdir);

        runtime.create("c1", &bundle).unwrap();
        let mut state = runtime.store.read_state("c1").unwrap();
        state.status = ContainerStatus::Running;
        runtime.store.write_state("c1", &state).unwrap();

        let err = runtime.delete("c1", false).unwrap_err();
        assert!(matches!(err, RuntimeError::ContainerNotStopped { .. }));
    }

    #[test]
    fn test_delete_removes_stopped_container() {
        let tempdir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(&tempdir);
        let bundle = test_bundle(&tempdir);

        runtime.create("c1", &bundle).unwrap();
        let mut state = runtime.store.read_state("c1").unwrap();
        state.status = ContainerStatus::Stopped;
        runtime.store.write_state("c1", &state).unwrap();

        runtime.delete("c1", false).expect("delete should succeed");
        assert!(!runtime.store.exists("c1"));
    }

    #[test]
    fn test_refresh_marks_dead_init_pid_stopped() {
        let tempdir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(&tempdir);
        let bundle = test_bundle(&tempdir);

        runtime.create("c1", &bundle).unwrap();
        let mut state = runtime.store.read_state("c1").unwrap();
        state.status = ContainerStatus::Running;
        state.init_pid = i32::MAX;
        runtime.store.write_state("c1", &state).unwrap();

        let refreshed = runtime.state("c1").unwrap();
        assert_eq!(refreshed.status, ContainerStatus::Stopped);
    }
}
