//! Path sanitization shared by every place that needs to resolve a
//! container-relative path (a mount destination, `cwd`) against a host
//! rootfs directory.

use std::path::{Component, Path, PathBuf};

/// Mount destinations and working directories in the runtime config
/// are container-relative; joining them onto the rootfs naively would
/// let a `..` or an absolute component escape it. Keeping only
/// `Component::Normal` segments is the same sanitization the original
/// codebase's `prefixed_destination` helper applied.
pub fn prefixed_destination(rootfs: impl AsRef<Path>, destination: impl AsRef<Path>) -> PathBuf {
    let mut result = rootfs.as_ref().to_owned();

    for component in destination.as_ref().components() {
        if let Component::Normal(component) = component {
            result.push(component);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_dotdot_and_root() {
        let rootfs = Path::new("/var/lib/nablarun/abc/rootfs");
        assert_eq!(
            prefixed_destination(rootfs, "/../../etc/passwd"),
            PathBuf::from("/var/lib/nablarun/abc/rootfs/etc/passwd")
        );
    }

    #[test]
    fn test_plain_destination() {
        let rootfs = Path::new("/rootfs");
        assert_eq!(prefixed_destination(rootfs, "/data"), PathBuf::from("/rootfs/data"));
    }
}
