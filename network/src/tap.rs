//! Persistent TAP devices via `/dev/net/tun`.
//!
//! The device is created with `TUNSETIFF` and marked persistent so it
//! outlives our file descriptor; the hypervisor reopens it by name.

use crate::error::NetError;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETPERSIST: libc::c_ulong = 0x400454cb;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct Ifreq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

pub fn create_persistent_tap(name: &str) -> Result<(), NetError> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(NetError::Tap(format!("invalid TAP device name {name:?}")));
    }

    let fd = unsafe { libc::open(c"/dev/net/tun".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(NetError::Tap(format!(
            "failed to open /dev/net/tun: {}",
            io::Error::last_os_error()
        )));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut ifr = Ifreq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: IFF_TAP | IFF_NO_PI,
        _padding: [0; 22],
    };
    for (dst, &src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = src as libc::c_char;
    }

    if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut ifr as *mut Ifreq) } < 0 {
        return Err(NetError::Tap(format!(
            "TUNSETIFF {name} failed: {}",
            io::Error::last_os_error()
        )));
    }

    if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETPERSIST as _, 1 as libc::c_ulong) } < 0 {
        return Err(NetError::Tap(format!(
            "TUNSETPERSIST {name} failed: {}",
            io::Error::last_os_error()
        )));
    }

    tracing::debug!(tap = %name, "created persistent TAP device");
    Ok(())
}
