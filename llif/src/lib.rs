//! The three-stage, three-domain handler pipeline a container runs
//! through: filesystem, network and exec, each with a Create, Run and
//! Destroy phase. `HandlerSet` owns one implementation per domain and
//! drives them in the fixed order the container lifecycle requires.

use std::{
    any::Any,
    collections::HashMap,
    convert::Infallible,
    fmt,
    path::{Path, PathBuf},
};

use anyhow::Error;
use bundle::RuntimeConfig;

/// Per-domain state threaded through the pipeline.
///
/// `options` is the only part that is persisted (it rides along in
/// `state.json` and crosses the supervisor/init process boundary via the
/// init config pipe); `in_memory` is a same-process, same-phase
/// scratchpad for handing over things that don't serialize (file
/// descriptors, parsed structures) to a handler running immediately
/// after in the same phase. Cloning an `HState` (needed to snapshot it
/// into a persisted container document) only carries `options` forward
/// -- `in_memory` never survives a clone, since by definition nothing
/// in it should outlive the process/phase that put it there.
#[derive(Default, Serialize, Deserialize)]
pub struct HState {
    pub options: HashMap<String, String>,
    #[serde(skip)]
    pub in_memory: HashMap<String, Box<dyn Any + Send>>,
}

impl Clone for HState {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            in_memory: HashMap::new(),
        }
    }
}

impl fmt::Debug for HState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HState")
            .field("options", &self.options)
            .field("in_memory_keys", &self.in_memory.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HState {
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

use serde::{Deserialize, Serialize};

/// Everything a handler needs to see: the identifying and
/// configuration data that never changes across phases, plus the
/// current state of all three domains (a handler in one domain is
/// allowed to read -- never write -- the other two domains' state).
#[derive(Clone)]
pub struct Input {
    pub container_id: String,
    pub container_root: PathBuf,
    pub config: RuntimeConfig,
    pub fs_state: HState,
    pub net_state: HState,
    pub exec_state: HState,
}

impl Input {
    pub fn new(container_id: impl Into<String>, container_root: impl Into<PathBuf>, config: RuntimeConfig) -> Self {
        Self {
            container_id: container_id.into(),
            container_root: container_root.into(),
            config,
            fs_state: HState::default(),
            net_state: HState::default(),
            exec_state: HState::default(),
        }
    }

    pub fn rootfs(&self) -> &Path {
        self.config
            .root
            .as_ref()
            .map(|root| root.path.as_path())
            .unwrap_or(&self.container_root)
    }
}

pub trait FsHandler {
    fn create(&self, input: &Input) -> Result<HState, Error>;
    fn run(&self, input: &Input) -> Result<HState, Error>;
    fn destroy(&self, input: &Input) -> Result<HState, Error>;
}

pub trait NetworkHandler {
    fn create(&self, input: &Input) -> Result<HState, Error>;
    fn run(&self, input: &Input) -> Result<HState, Error>;
    fn destroy(&self, input: &Input) -> Result<HState, Error>;
}

pub trait ExecHandler {
    fn create(&self, input: &Input) -> Result<HState, Error>;
    /// Replaces the current process with the monitor on success: the
    /// `Ok` variant is uninhabited, so a caller that gets a `Result`
    /// back at all knows the exec failed.
    fn run(&self, input: &Input) -> Result<Infallible, Error>;
    fn destroy(&self, input: &Input) -> Result<HState, Error>;
}

/// Drives the three domains through a lifecycle phase in the order
/// fixed by the container lifecycle: Create and Run go
/// filesystem -> network -> exec; Destroy reverses that order.
pub struct HandlerSet {
    pub fs: Box<dyn FsHandler + Send + Sync>,
    pub network: Box<dyn NetworkHandler + Send + Sync>,
    pub exec: Box<dyn ExecHandler + Send + Sync>,
}

impl HandlerSet {
    pub fn create(&self, mut input: Input) -> Result<Input, Error> {
        input.fs_state = self.fs.create(&input)?;
        input.net_state = self.network.create(&input)?;
        input.exec_state = self.exec.create(&input)?;

        Ok(input)
    }

    pub fn run(&self, mut input: Input) -> Result<Infallible, Error> {
        input.fs_state = self.fs.run(&input)?;
        input.net_state = self.network.run(&input)?;

        self.exec.run(&input)
    }

    pub fn destroy(&self, mut input: Input) -> Result<Input, Error> {
        input.exec_state = self.exec.destroy(&input)?;
        input.net_state = self.network.destroy(&input)?;
        input.fs_state = self.fs.destroy(&input)?;

        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    struct RecordingFs(Recorder);
    struct RecordingNetwork(Recorder);
    struct RecordingExec(Recorder);

    impl FsHandler for RecordingFs {
        fn create(&self, _: &Input) -> Result<HState, Error> {
            self.0 .0.lock().unwrap().push("fs.create");
            Ok(HState::default())
        }
        fn run(&self, _: &Input) -> Result<HState, Error> {
            self.0 .0.lock().unwrap().push("fs.run");
            Ok(HState::default())
        }
        fn destroy(&self, _: &Input) -> Result<HState, Error> {
            self.0 .0.lock().unwrap().push("fs.destroy");
            Ok(HState::default())
        }
    }

    impl NetworkHandler for RecordingNetwork {
        fn create(&self, _: &Input) -> Result<HState, Error> {
            self.0 .0.lock().unwrap().push("network.create");
            Ok(HState::default())
        }
        fn run(&self, _: &Input) -> Result<HState, Error> {
            self.0 .0.lock().unwrap().push("network.run");
            Ok(HState::default())
        }
        fn destroy(&self, _: &Input) -> Result<HState, Error> {
            self.0 .0.lock().unwrap().push("network.destroy");
            Ok(HState::default())
        }
    }

    impl ExecHandler for RecordingExec {
        fn create(&self, _: &Input) -> Result<HState, Error> {
            self.0 .0.lock().unwrap().push("exec.create");
            Ok(HState::default())
        }
        fn run(&self, _: &Input) -> Result<Infallible, Error> {
            self.0 .0.lock().unwrap().push("exec.run");
            Err(anyhow::anyhow!("test double never actually execs"))
        }
        fn destroy(&self, _: &Input) -> Result<HState, Error> {
            self.0 .0.lock().unwrap().push("exec.destroy");
            Ok(HState::default())
        }
    }

    fn fixture() -> (HandlerSet, Recorder) {
        let recorder = Recorder::default();

        let set = HandlerSet {
            fs: Box::new(RecordingFs(Recorder(recorder.0.clone()))),
            network: Box::new(RecordingNetwork(Recorder(recorder.0.clone()))),
            exec: Box::new(RecordingExec(Recorder(recorder.0.clone()))),
        };

        (set, recorder)
    }

    fn input() -> Input {
        Input::new("container", "/tmp/container", test_config())
    }

    fn test_config() -> RuntimeConfig {
        serde_json::from_str(test_helpers::fixture!("minimal_config.json")).unwrap()
    }

    #[test]
    fn test_create_phase_order() {
        let (set, recorder) = fixture();

        set.create(input()).expect("create should succeed");

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["fs.create", "network.create", "exec.create"]
        );
    }

    #[test]
    fn test_run_phase_order() {
        let (set, recorder) = fixture();

        let result = set.run(input());

        assert!(result.is_err(), "exec test double always errors");
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["fs.run", "network.run", "exec.run"]
        );
    }

    #[test]
    fn test_destroy_phase_order_is_reversed() {
        let (set, recorder) = fixture();

        set.destroy(input()).expect("destroy should succeed");

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["exec.destroy", "network.destroy", "fs.destroy"]
        );
    }

    #[test]
    fn test_options_propagate_within_a_domain_across_phases() {
        struct StatefulFs;

        impl FsHandler for StatefulFs {
            fn create(&self, _: &Input) -> Result<HState, Error> {
                Ok(HState::default().with_option("FsPath", "/tmp/rootfs.iso"))
            }
            fn run(&self, input: &Input) -> Result<HState, Error> {
                assert_eq!(input.fs_state.option("FsPath"), Some("/tmp/rootfs.iso"));
                Ok(input.fs_state.clone())
            }
            fn destroy(&self, input: &Input) -> Result<HState, Error> {
                assert_eq!(input.fs_state.option("FsPath"), Some("/tmp/rootfs.iso"));
                Ok(HState::default())
            }
        }

        let recorder = Recorder::default();
        let set = HandlerSet {
            fs: Box::new(StatefulFs),
            network: Box::new(RecordingNetwork(Recorder(recorder.0.clone()))),
            exec: Box::new(RecordingExec(Recorder(recorder.0.clone()))),
        };

        let created = set.create(input()).expect("create should succeed");
        assert_eq!(created.fs_state.option("FsPath"), Some("/tmp/rootfs.iso"));
    }
}
