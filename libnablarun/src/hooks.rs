//! OCI prestart hook execution. Only the prestart stage is ever
//! invoked: `run` replaces this process with the monitor and never
//! returns, so there's no later point createRuntime/createContainer/
//! startContainer/poststart/poststop hooks could meaningfully run at.

use std::{
    io::Write,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context, Error};
use bundle::Hook;
use fehler::throws;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};

/// JSON blob piped into a hook's stdin, per the OCI runtime spec's
/// hook contract: the container id, bundle path and pid at the time
/// the hook runs.
#[derive(serde::Serialize)]
struct HookState<'a> {
    #[serde(rename = "ociVersion")]
    oci_version: &'a str,
    id: &'a str,
    status: &'a str,
    pid: i32,
    bundle: &'a str,
}

#[throws]
pub fn run_prestart_hooks(hooks: &[Hook], container_id: &str, bundle: &str, pid: i32) {
    for hook in hooks {
        run_hook(hook, container_id, bundle, pid)?;
    }
}

#[throws]
fn run_hook(hook: &Hook, container_id: &str, bundle: &str, pid: i32) {
    let state = HookState {
        oci_version: "1.0.2",
        id: container_id,
        status: "creating",
        pid,
        bundle,
    };
    let state_json = serde_json::to_vec(&state).context("serializing hook state")?;

    let mut command = Command::new(&hook.path);
    if let Some(args) = &hook.args {
        command.args(args.iter().skip(1));
    }
    if let Some(env) = &hook.env {
        command.env_clear();
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                command.env(key, value);
            }
        }
    }
    command.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::null());

    let mut child = command.spawn().with_context(|| format!("spawning hook {:?}", hook.path))?;
    child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("hook child has no stdin"))?
        .write_all(&state_json)
        .context("writing hook state to stdin")?;

    let pid = child.id();

    match hook.timeout {
        None => {
            let status = child.wait().context("waiting for hook")?;
            check_status(hook, status.success())?;
        }
        Some(seconds) => {
            let (sender, receiver) = crossbeam_channel::bounded(1);
            thread::spawn(move || {
                let _ = sender.send(child.wait());
            });

            match receiver.recv_timeout(Duration::from_secs(seconds as u64)) {
                Ok(Ok(status)) => check_status(hook, status.success())?,
                Ok(Err(err)) => fehler::throw!(Error::new(err).context("waiting for hook")),
                Err(_) => {
                    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    fehler::throw!(anyhow!(
                        "hook {:?} timed out after {}s and was killed",
                        hook.path,
                        seconds
                    ));
                }
            }
        }
    }
}

#[throws]
fn check_status(hook: &Hook, success: bool) {
    if !success {
        fehler::throw!(anyhow!("hook {:?} exited unsuccessfully", hook.path));
    }
}
