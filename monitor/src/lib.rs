//! Exec handler: builds the `nabla-run` monitor's argv and the
//! unikernel boot command line, then replaces the init process with
//! the monitor. Grounded in `runnc_cont.go`'s `Run` and `rumprun.go`'s
//! `CreateRumprunArgs`.

mod cmdline;
mod disk;

use std::{
    convert::Infallible,
    ffi::CString,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Error};
use fehler::throws;
use llif::{ExecHandler, HState, Input};
use nix::unistd;

/// `nabla-run`'s heap-exec flag, required on every invocation
/// regardless of workload; matches the constant flag
/// `runnc_cont.go`'s `Run` always passes.
const NABLA_RUN_HEAP_FLAG: &str = "--x-exec-heap";
const DEFAULT_NABLA_RUN_BIN: &str = "nabla-run";

pub struct Handler;

impl ExecHandler for Handler {
    fn create(&self, input: &Input) -> Result<HState, Error> {
        create(input)
    }

    fn run(&self, input: &Input) -> Result<Infallible, Error> {
        run(input)
    }

    fn destroy(&self, input: &Input) -> Result<HState, Error> {
        destroy(input)
    }
}

#[throws]
fn create(_input: &Input) -> HState {
    // Identity no-op: unikernel resolution is failure-prone (a missing
    // or non-`.nabla` entrypoint) and belongs to the Run phase, which
    // is the one that actually execs it.
    HState::default()
}

#[throws]
fn destroy(_input: &Input) -> HState {
    HState::default()
}

fn run(input: &Input) -> Result<Infallible, Error> {
    let nabla_run_bin = which(DEFAULT_NABLA_RUN_BIN).unwrap_or_else(|| DEFAULT_NABLA_RUN_BIN.into());

    let unikernel = resolve_unikernel_path(input)?;

    let tap = input
        .net_state
        .option("TapName")
        .ok_or_else(|| anyhow!("net state is missing TapName; network create phase didn't run"))?;

    let disk_option = input.fs_state.option("FsPath").map(Path::new);
    let disk = disk::setup_disk(disk_option)?;

    let unikernel_args = unikernel_cmdline(input, &unikernel)?;

    let mut args = vec![
        nabla_run_bin.to_string_lossy().into_owned(),
        NABLA_RUN_HEAP_FLAG.to_owned(),
        format!("--mem={}", input.config.memory_mib),
    ];

    if let Some(mac) = input.net_state.option("Mac") {
        args.push(format!("--net-mac={}", mac));
    }

    args.push(format!("--net={}", tap));
    args.push(format!("--disk={}", disk.display()));
    args.push(unikernel.to_string_lossy().into_owned());
    args.push(unikernel_args);

    tracing::info!(?args, "executing monitor");

    let env = strip_ld_library_path(std::env::vars())?;
    let c_args = to_cstrings(&args)?;
    let c_env = to_cstrings(&env)?;

    unistd::execvpe(&c_args[0], &c_args, &c_env)
        .context("execve into nabla-run failed")?;

    unreachable!("execvpe only returns on failure, which is mapped to Err above")
}

#[throws]
fn unikernel_cmdline(input: &Input, unikernel: &Path) -> String {
    let unikernel = unikernel.to_string_lossy();

    let process = input.config.process.as_ref();
    let args = process.and_then(|process| process.args.as_ref());
    let env = process
        .and_then(|process| process.env.clone())
        .unwrap_or_default();
    let cwd = process.map(|process| process.cwd.clone()).unwrap_or_else(|| "/".into());

    let mut cmdline_parts = vec![unikernel.into_owned()];
    if let Some(args) = args {
        cmdline_parts.extend(args.iter().cloned());
    }

    let net = cmdline::Network::static_v4(
        input.net_state.option("IPAddress").unwrap_or("10.0.0.2"),
        input.net_state.option("IPMask").unwrap_or("24"),
        input.net_state.option("Gateway").unwrap_or("10.0.0.1"),
    );

    let rump_args = cmdline::RumpArgs {
        cwd,
        cmdline: cmdline_parts.join(" "),
        net,
        blk: Some(cmdline::Block::rootfs("/")),
        env,
        mem: Some(input.config.memory_mib.to_string()),
    };

    rump_args.to_json().context("serializing unikernel command line")?
}

#[throws]
fn resolve_unikernel_path(input: &Input) -> PathBuf {
    let args = input
        .config
        .process
        .as_ref()
        .and_then(|process| process.args.as_ref())
        .ok_or_else(|| anyhow!("process.args is required to name the unikernel binary"))?;

    let name = args
        .first()
        .ok_or_else(|| anyhow!("process.args must contain at least the unikernel binary name"))?;

    if name != bundle::PAUSE_NABLA_NAME && !name.ends_with(".nabla") {
        fehler::throw!(anyhow!("entrypoint is not a .nabla file"));
    }

    let rootfs_relative = input.rootfs().join(name);
    if rootfs_relative.exists() {
        rootfs_relative
    } else if let Some(found) = which(name) {
        found
    } else {
        fehler::throw!(anyhow!("could not find unikernel binary {:?}", name));
    }
}

fn which(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        return None;
    }

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// Drops any inherited `LD_LIBRARY_PATH` and forces `/lib64`, matching
/// `runnc_cont.go`'s env rewrite before `syscall.Exec` -- the monitor
/// links against its own bundled libraries, not whatever the runtime's
/// own process happened to inherit.
fn strip_ld_library_path(vars: impl Iterator<Item = (String, String)>) -> Result<Vec<String>, Error> {
    let mut env: Vec<String> = vars
        .filter(|(key, _)| key != "LD_LIBRARY_PATH")
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();

    env.push("LD_LIBRARY_PATH=/lib64".to_owned());
    Ok(env)
}

fn to_cstrings(values: &[String]) -> Result<Vec<CString>, Error> {
    values
        .iter()
        .map(|value| CString::new(value.as_bytes()).context("argument contains a NUL byte"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ld_library_path_removes_and_reappends() {
        let vars = vec![
            ("PATH".to_owned(), "/usr/bin".to_owned()),
            ("LD_LIBRARY_PATH".to_owned(), "/usr/lib".to_owned()),
        ];

        let env = strip_ld_library_path(vars.into_iter()).unwrap();

        assert!(env.contains(&"PATH=/usr/bin".to_owned()));
        assert_eq!(env.iter().filter(|entry| entry.starts_with("LD_LIBRARY_PATH=")).count(), 1);
        assert!(env.contains(&"LD_LIBRARY_PATH=/lib64".to_owned()));
    }

    #[test]
    fn test_which_rejects_paths_with_slashes() {
        assert!(which("./foo").is_none());
    }

    #[test]
    fn test_unikernel_cmdline_embeds_duplicate_env_keys() {
        let mut input = Input::new("container1234567", "/tmp/container1234567", test_config());
        input.net_state = HState::default().with_option("TapName", "tap0");

        let json = unikernel_cmdline(&input, Path::new("/unikernel.nabla")).unwrap();
        assert!(json.contains("\"cmdline\":\"/unikernel.nabla\""));
    }

    #[test]
    fn test_create_is_identity_no_op() {
        let input = Input::new("container1234567", "/tmp/container1234567", test_config());
        let state = create(&input).unwrap();
        assert!(state.options.is_empty());
    }

    #[test]
    fn test_resolve_unikernel_path_rejects_non_nabla_entrypoint() {
        let mut config = test_config();
        config.process.as_mut().unwrap().args = Some(vec!["/bin/sh".to_owned()]);
        let input = Input::new("container1234567", "/tmp/container1234567", config);

        let err = resolve_unikernel_path(&input).unwrap_err();
        assert_eq!(err.to_string(), "entrypoint is not a .nabla file");
    }

    #[test]
    fn test_resolve_unikernel_path_allows_pause_sentinel() {
        let mut config = test_config();
        config.process.as_mut().unwrap().args = Some(vec![bundle::PAUSE_NABLA_NAME.to_owned()]);
        let input = Input::new("container1234567", "/tmp/container1234567", config);

        let err = resolve_unikernel_path(&input).unwrap_err();
        assert_ne!(err.to_string(), "entrypoint is not a .nabla file");
    }

    fn test_config() -> bundle::RuntimeConfig {
        serde_json::from_str(test_helpers::fixture!("minimal_config.json")).unwrap()
    }
}
