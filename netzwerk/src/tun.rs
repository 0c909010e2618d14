//! `/dev/net/tun` bookkeeping and the container-id -> tap-name derivation.
//! Mirrors the original implementation's `verifyTunDevice`/`createTunDevice`
//! split exactly: the device is host-global, so this only creates it if
//! absent and otherwise checks its major/minor match what the kernel's
//! tun/tap driver actually registers.

use std::{ffi::CString, fs::OpenOptions, os::unix::ffi::OsStrExt, os::unix::io::AsRawFd, path::Path};

use anyhow::{anyhow, Error};
use common_lib::AsSignedBytes;
use nix::sys::stat::{self, Mode, SFlag};

const TUN_PATH: &str = "/dev/net/tun";
const TUN_MAJOR: u64 = 10;
const TUN_MINOR: u64 = 200;
const IFNAMSIZ: usize = 16;

// linux/if_tun.h: `_IOW('T', 202, int)` / `_IOW('T', 203, int)`.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

// `struct ifreq` on Linux: a 16-byte name followed by a union that's
// padded out to 40 bytes total. TUNSETIFF only reads `ifr_name` and the
// `short` at the union's start (`ifr_flags`); the rest is there purely
// so the struct is the size the kernel expects to copy in.
#[repr(C)]
#[derive(Default)]
struct TunIfReq {
    name: [libc::c_char; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Creates a persistent TAP device named `name` via `/dev/net/tun` +
/// `TUNSETIFF`/`TUNSETPERSIST`, the same ioctl dance `common_lib`'s
/// `AsSignedBytes` helper was written for on the FreeBSD side of this
/// codebase, just aimed at Linux's tun/tap driver instead of an
/// `ifconfig`-style socket ioctl.
#[fehler::throws]
pub fn create_tap_device(name: &str) {
    let file = OpenOptions::new().read(true).write(true).open(TUN_PATH)?;

    let mut req = TunIfReq::default();
    let name_bytes = name.as_signed_bytes();
    let len = name_bytes.len().min(IFNAMSIZ - 1);
    req.name[..len].copy_from_slice(&name_bytes[..len]);
    req.flags = IFF_TAP | IFF_NO_PI;

    let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut req) };
    if result < 0 {
        fehler::throw!(std::io::Error::last_os_error());
    }

    let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETPERSIST, 1) };
    if result < 0 {
        fehler::throw!(std::io::Error::last_os_error());
    }

    tracing::info!(%name, "created persistent tap device");
}

/// `("tap" + id)[:IFNAMSIZ-1]`. Panics if `id` is shorter than eight
/// characters: a container id that short is a caller bug (ids are
/// generated, not user-typed), not a runtime condition to recover from.
pub fn tap_name(id: &str) -> String {
    assert!(
        id.len() >= 8,
        "container id must be at least 8 characters to derive a tap name, got {:?}",
        id
    );

    let mut name = format!("tap{}", id);
    name.truncate(IFNAMSIZ - 1);
    name
}

#[fehler::throws]
pub fn ensure_tun_device() {
    let path = Path::new(TUN_PATH);

    match stat::stat(path) {
        Ok(stat) => {
            let major = unsafe { libc::major(stat.st_rdev) } as u64;
            let minor = unsafe { libc::minor(stat.st_rdev) } as u64;

            if major != TUN_MAJOR || minor != TUN_MINOR {
                fehler::throw!(anyhow!(
                    "{} exists but is not the tun/tap character device (major={}, minor={})",
                    TUN_PATH,
                    major,
                    minor
                ));
            }
        }
        Err(nix::Error::Sys(nix::errno::Errno::ENOENT)) => create_tun_device()?,
        Err(err) => fehler::throw!(Error::from(err).context(format!("stat {}", TUN_PATH))),
    }
}

#[fehler::throws]
fn create_tun_device() {
    std::fs::create_dir_all("/dev/net")?;

    let path = CString::new(Path::new(TUN_PATH).as_os_str().as_bytes())?;
    let dev = stat::makedev(TUN_MAJOR, TUN_MINOR);

    let result = unsafe {
        libc::mknod(
            path.as_ptr(),
            (SFlag::S_IFCHR | Mode::from_bits_truncate(0o666)).bits(),
            dev as libc::dev_t,
        )
    };

    if result != 0 {
        fehler::throw!(std::io::Error::last_os_error());
    }

    tracing::info!(path = TUN_PATH, "created tun/tap character device");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_name_truncates_to_ifnamsiz() {
        let name = tap_name("0123456789abcdef0123456789");
        assert_eq!(name.len(), IFNAMSIZ - 1);
        assert!(name.starts_with("tap"));
    }

    #[test]
    #[should_panic]
    fn test_tap_name_rejects_short_ids() {
        tap_name("short");
    }
}
