//! Wires the concrete filesystem, network and exec handlers into a
//! `HandlerSet` and exposes the lifecycle operations the CLI drives.

pub mod hooks;
pub mod init;
pub mod lifecycle;
pub mod supervisor;

use std::path::PathBuf;

use llif::HandlerSet;
use store::DirStore;

pub use lifecycle::Runtime;

/// Builds the handler pipeline this runtime actually ships: ISO 9660
/// staging for the filesystem domain, TAP/bridge or macvtap for
/// network, `nabla-run` for exec.
pub fn handlers() -> HandlerSet {
    HandlerSet {
        fs: Box::new(isofs::Handler),
        network: Box::new(netzwerk::Handler),
        exec: Box::new(monitor::Handler),
    }
}

#[fehler::throws(store::RuntimeError)]
pub fn runtime(root: impl Into<PathBuf>, self_exe: impl Into<PathBuf>) -> Runtime<DirStore> {
    Runtime {
        store: DirStore::new(root)?,
        handlers: handlers(),
        self_exe: self_exe.into(),
    }
}
