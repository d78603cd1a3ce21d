//! Process privilege controls used by the init process and the shim.

#![allow(unsafe_code)]

use std::fs;
use std::io;

use nix::sys::prctl;

/// Where the kernel reports its highest capability number.
const CAP_LAST_CAP: &str = "/proc/sys/kernel/cap_last_cap";

/// `_LINUX_CAPABILITY_VERSION_3`.
const CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// `struct __user_cap_header_struct`.
#[repr(C)]
struct CapHeader {
    /// Capability ABI version.
    version: u32,
    /// Target thread, zero for the caller.
    pid: libc::c_int,
}

/// `struct __user_cap_data_struct`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    /// Effective set, one 32-bit word.
    effective: u32,
    /// Permitted set, one 32-bit word.
    permitted: u32,
    /// Inheritable set, one 32-bit word.
    inheritable: u32,
}

/// Reads the highest capability number supported by the running kernel.
///
/// `/proc` is gone once init leaves the intermediate root, so this must be
/// read early and passed to [`drop_all`].
pub fn last_cap() -> io::Result<u32> {
    let raw = fs::read_to_string(CAP_LAST_CAP)?;
    raw.trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{CAP_LAST_CAP}: {e}")))
}

/// Toggles whether the process may be ptraced and core dumped by its owner.
pub fn set_dumpable(dumpable: bool) -> io::Result<()> {
    prctl::set_dumpable(dumpable).map_err(io::Error::from)
}

/// Sets `no_new_privs` so no later `execve` can gain privileges.
pub fn no_new_privs() -> io::Result<()> {
    prctl::set_no_new_privs().map_err(io::Error::from)
}

/// Gives up every capability for good.
///
/// Sets `no_new_privs`, clears the ambient set, drops `0..=last_cap` from
/// the bounding set and finally empties the effective, permitted and
/// inheritable sets. Mount operations are impossible afterwards.
pub fn drop_all(last_cap: u32) -> io::Result<()> {
    no_new_privs()?;

    // SAFETY: plain prctl calls with integer arguments.
    unsafe {
        if libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
        for cap in 0..=last_cap {
            if libc::prctl(libc::PR_CAPBSET_DROP, libc::c_ulong::from(cap), 0, 0, 0) != 0 {
                let err = io::Error::last_os_error();
                // capabilities newer than the headers are reported as EINVAL
                if err.raw_os_error() != Some(libc::EINVAL) {
                    return Err(err);
                }
            }
        }
    }

    let header = CapHeader {
        version: CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [CapData::default(); 2];
    // SAFETY: header and data are valid for the v3 ABI, which reads two words.
    let ret = unsafe { libc::syscall(libc::SYS_capset, &raw const header, data.as_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_last_cap() {
        // CAP_AUDIT_READ (37) has been present since Linux 3.16
        assert!(last_cap().unwrap() >= 37);
    }
}
