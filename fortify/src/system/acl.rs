//! POSIX access ACL editing through the `system.posix_acl_access` xattr.

#![allow(unsafe_code)]

use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Extended attribute holding the access ACL.
const XATTR: &CStr = c"system.posix_acl_access";
/// On-disk format version.
const VERSION: u32 = 2;
/// Size of the header and of each entry.
const HEADER_LEN: usize = 4;
const ENTRY_LEN: usize = 8;
/// Id stored for entries without a qualifier.
const UNDEFINED_ID: u32 = u32::MAX;

/// Entry tags, ordered as the kernel expects them.
const USER_OBJ: u16 = 0x01;
const USER: u16 = 0x02;
const GROUP_OBJ: u16 = 0x04;
const GROUP: u16 = 0x08;
const MASK: u16 = 0x10;
const OTHER: u16 = 0x20;

/// Permission bits of one ACL entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Perms(u16);

impl Perms {
    /// Execute, or search on directories.
    pub const EXECUTE: Self = Self(1);
    /// Write.
    pub const WRITE: Self = Self(2);
    /// Read.
    pub const READ: Self = Self(4);
    /// Read, write and execute.
    pub const ALL: Self = Self(7);

    /// No permissions.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Builds from read, write and execute switches.
    pub const fn from_rwx(read: bool, write: bool, execute: bool) -> Self {
        let mut bits = 0;
        if read {
            bits |= Self::READ.0;
        }
        if write {
            bits |= Self::WRITE.0;
        }
        if execute {
            bits |= Self::EXECUTE.0;
        }
        Self(bits)
    }
}

impl std::ops::BitOr for Perms {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |p: Self, c: char| if self.contains(p) { c } else { '-' };
        write!(f, "{}{}{}", bit(Self::READ, 'r'), bit(Self::WRITE, 'w'), bit(Self::EXECUTE, 'x'))
    }
}

/// One ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    tag: u16,
    perm: u16,
    id: u32,
}

/// An access ACL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    entries: Vec<Entry>,
}

impl Acl {
    /// The minimal ACL equivalent to permission bits `mode`.
    pub fn from_mode(mode: u32) -> Self {
        let bits = |shift: u32| ((mode >> shift) & 0o7) as u16;
        Self {
            entries: vec![
                Entry { tag: USER_OBJ, perm: bits(6), id: UNDEFINED_ID },
                Entry { tag: GROUP_OBJ, perm: bits(3), id: UNDEFINED_ID },
                Entry { tag: OTHER, perm: bits(0), id: UNDEFINED_ID },
            ],
        }
    }

    /// Decodes the xattr representation.
    pub fn parse(buf: &[u8]) -> io::Result<Self> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_owned());
        if buf.len() < HEADER_LEN || (buf.len() - HEADER_LEN) % ENTRY_LEN != 0 {
            return Err(invalid("malformed acl xattr"));
        }
        let version = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if version != VERSION {
            return Err(invalid("unsupported acl version"));
        }
        let entries = buf[HEADER_LEN..]
            .chunks_exact(ENTRY_LEN)
            .map(|c| Entry {
                tag: u16::from_le_bytes([c[0], c[1]]),
                perm: u16::from_le_bytes([c[2], c[3]]),
                id: u32::from_le_bytes([c[4], c[5], c[6], c[7]]),
            })
            .collect();
        Ok(Self { entries })
    }

    /// Encodes to the xattr representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.entries.len() * ENTRY_LEN);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        for e in &self.entries {
            buf.extend_from_slice(&e.tag.to_le_bytes());
            buf.extend_from_slice(&e.perm.to_le_bytes());
            buf.extend_from_slice(&e.id.to_le_bytes());
        }
        buf
    }

    /// Permissions of the named user entry for `uid`, if present.
    pub fn user(&self, uid: u32) -> Option<Perms> {
        self.entries
            .iter()
            .find(|e| e.tag == USER && e.id == uid)
            .map(|e| Perms(e.perm))
    }

    /// Permissions of the mask entry, if present.
    pub fn mask(&self) -> Option<Perms> {
        self.entries.iter().find(|e| e.tag == MASK).map(|e| Perms(e.perm))
    }

    /// Replaces the named user entry for `uid` with `perms`, removing it
    /// when `perms` is empty, then recomputes the mask.
    pub fn set_user(&mut self, uid: u32, perms: Perms) {
        self.entries.retain(|e| !(e.tag == USER && e.id == uid));
        if !perms.is_empty() {
            self.entries.push(Entry { tag: USER, perm: perms.0, id: uid });
        }
        self.recalculate_mask();
        self.entries.sort_by_key(|e| (e.tag, e.id));
    }

    /// Keeps a mask covering every group-class entry while named entries
    /// exist, and drops it once the ACL is minimal again.
    fn recalculate_mask(&mut self) {
        self.entries.retain(|e| e.tag != MASK);
        let named = self.entries.iter().any(|e| e.tag == USER || e.tag == GROUP);
        if named {
            let perm = self
                .entries
                .iter()
                .filter(|e| matches!(e.tag, USER | GROUP | GROUP_OBJ))
                .fold(0, |acc, e| acc | e.perm);
            self.entries.push(Entry { tag: MASK, perm, id: UNDEFINED_ID });
        }
    }
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Reads the access ACL of `path`, synthesizing it from the mode when the
/// file has none.
pub fn read(path: &Path) -> io::Result<Acl> {
    let cpath = c_path(path)?;
    let name = XATTR;
    loop {
        // SAFETY: a null buffer of size 0 queries the attribute size.
        let size = unsafe { libc::getxattr(cpath.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENODATA) {
                let mode = std::fs::metadata(path)?.mode();
                return Ok(Acl::from_mode(mode));
            }
            return Err(err);
        }

        let mut buf = vec![0u8; size.unsigned_abs()];
        // SAFETY: `buf` is valid for `buf.len()` bytes.
        let n = unsafe { libc::getxattr(cpath.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // grew between the two calls
            if err.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return Err(err);
        }
        buf.truncate(n.unsigned_abs());
        return Acl::parse(&buf);
    }
}

/// Writes `acl` as the access ACL of `path`.
pub fn write(path: &Path, acl: &Acl) -> io::Result<()> {
    let cpath = c_path(path)?;
    let name = XATTR;
    let buf = acl.to_bytes();
    // SAFETY: `buf` is valid for `buf.len()` bytes.
    let rc = unsafe { libc::setxattr(cpath.as_ptr(), name.as_ptr(), buf.as_ptr().cast(), buf.len(), 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Sets the named entry for `uid` on `path` to `perms`; empty `perms`
/// removes it.
pub fn update_perm(path: &Path, uid: u32, perms: Perms) -> io::Result<()> {
    let mut acl = read(path)?;
    acl.set_user(uid, perms);
    write(path, &acl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perms_display() {
        assert_eq!(Perms::empty().to_string(), "---");
        assert_eq!(Perms::READ.to_string(), "r--");
        assert_eq!((Perms::READ | Perms::EXECUTE).to_string(), "r-x");
        assert_eq!(Perms::from_rwx(true, true, true), Perms::ALL);
        assert_eq!(Perms::from_rwx(false, true, false).to_string(), "-w-");
    }

    #[test]
    fn from_mode_is_minimal() {
        let acl = Acl::from_mode(0o40750);
        assert_eq!(acl.entries.len(), 3);
        assert_eq!(acl.entries[0].perm, 7);
        assert_eq!(acl.entries[1].perm, 5);
        assert_eq!(acl.entries[2].perm, 0);
        assert!(acl.mask().is_none());
    }

    #[test]
    fn grant_adds_entry_and_mask() {
        let mut acl = Acl::from_mode(0o700);
        acl.set_user(1000, Perms::EXECUTE);
        assert_eq!(acl.user(1000), Some(Perms::EXECUTE));
        assert_eq!(acl.mask(), Some(Perms::EXECUTE));

        let tags: Vec<_> = acl.entries.iter().map(|e| e.tag).collect();
        assert_eq!(tags, [USER_OBJ, USER, GROUP_OBJ, MASK, OTHER]);
    }

    #[test]
    fn grant_replaces_and_revoke_restores_minimal() {
        let original = Acl::from_mode(0o750);
        let mut acl = original.clone();
        acl.set_user(1000, Perms::READ);
        acl.set_user(1000, Perms::ALL);
        assert_eq!(acl.entries.iter().filter(|e| e.tag == USER).count(), 1);
        assert_eq!(acl.mask(), Some(Perms::ALL));

        acl.set_user(2000, Perms::READ);
        acl.set_user(1000, Perms::empty());
        assert_eq!(acl.user(1000), None);
        assert_eq!(acl.mask(), Some(Perms::READ | Perms::EXECUTE));

        acl.set_user(2000, Perms::empty());
        assert_eq!(acl, original);
    }

    #[test]
    fn encode_parse_and_reject() {
        let mut acl = Acl::from_mode(0o644);
        acl.set_user(42, Perms::READ | Perms::WRITE);
        let bytes = acl.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + 5 * ENTRY_LEN);
        assert_eq!(Acl::parse(&bytes).unwrap(), acl);

        assert!(Acl::parse(&bytes[..6]).is_err());
        let mut bad = bytes;
        bad[0] = 1;
        assert!(Acl::parse(&bad).is_err());
    }

    #[test]
    fn read_synthesizes_or_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "").unwrap();
        // filesystems without ACL support report EOPNOTSUPP instead
        if let Ok(acl) = read(&path) {
            assert!(acl.entries.iter().any(|e| e.tag == USER_OBJ));
        }
        assert!(read(&dir.path().join("missing")).is_err());
    }
}
