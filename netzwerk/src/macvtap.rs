//! Macvtap child-link creation and the sysfs dance needed to turn it
//! into a char device the monitor can open directly, mirroring the
//! original implementation's macvtap setup in `network_linux.go`.

use std::{fs, os::unix::ffi::OsStrExt, path::PathBuf};

use anyhow::{anyhow, Context, Error};
use nix::sys::stat::{self, Mode, SFlag};

use crate::netlink::Netlink;

/// Creates a macvtap device named `name` as a child of `master`, brings
/// it up and returns the char-device path sysfs assigned it (not a
/// fixed `/dev/tapN`; the kernel picks the minor at creation time).
#[fehler::throws]
pub async fn create_macvtap_device(netlink: &Netlink, name: &str, master: &str) -> PathBuf {
    let master_index = netlink.link_index(master).await?;

    netlink.add_macvtap(name, master_index).await?;

    let index = netlink.link_index(name).await?;
    netlink.set_link_up(index).await?;

    mknod_from_sysfs(name)?
}

/// Reads `/sys/class/net/<name>/macvtap/tapN/dev` (`major:minor`) and
/// creates the matching char device under `/dev`, the same
/// sysfs-to-mknod path `runnc_cont.go`'s disk/tap setup takes for
/// devices the kernel names dynamically.
#[fehler::throws]
fn mknod_from_sysfs(name: &str) -> PathBuf {
    let macvtap_dir = PathBuf::from(format!("/sys/class/net/{}/macvtap", name));

    let entry = fs::read_dir(&macvtap_dir)
        .with_context(|| format!("reading {}", macvtap_dir.display()))?
        .next()
        .ok_or_else(|| anyhow!("no macvtap entry under {}", macvtap_dir.display()))??;

    let tap_name = entry.file_name().to_string_lossy().into_owned();
    let dev_file = entry.path().join("dev");
    let dev_contents = fs::read_to_string(&dev_file)
        .with_context(|| format!("reading {}", dev_file.display()))?;

    let (major, minor) = dev_contents
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow!("malformed dev file: {}", dev_contents))?;

    let major: u64 = major.parse().context("parsing macvtap major")?;
    let minor: u64 = minor.parse().context("parsing macvtap minor")?;

    let device_path = PathBuf::from(format!("/dev/{}", tap_name));
    let dev = stat::makedev(major, minor);

    let path_c = std::ffi::CString::new(device_path.as_os_str().as_bytes())?;
    let result = unsafe {
        libc::mknod(
            path_c.as_ptr(),
            (SFlag::S_IFCHR | Mode::from_bits_truncate(0o666)).bits(),
            dev as libc::dev_t,
        )
    };

    if result != 0 && nix::errno::errno() != libc::EEXIST {
        fehler::throw!(std::io::Error::last_os_error());
    }

    device_path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path_is_under_dev() {
        let name = "tap0";
        assert_eq!(PathBuf::from(format!("/dev/{}", name)), PathBuf::from("/dev/tap0"));
    }
}
