//! Descriptor handoff across `exec`.
//!
//! The sending side creates a pipe, queues the read end on an
//! [`ExtraFiles`] set and keeps the write end as a [`Sender`]. The child
//! finds the read end at a fixed descriptor number published through an
//! environment variable, decodes exactly one payload from it and keeps the
//! descriptor open until its own setup has finished.
//!
//! Every descriptor created here carries `O_CLOEXEC`; only the numbers
//! installed by [`ExtraFiles::install`] survive into the child.

#![allow(unsafe_code)]

use std::env;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Descriptor number of the first inherited file in a child.
pub const FIRST_EXTRA_FD: RawFd = 3;

/// Errors raised while picking up a setup payload.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReceiveError {
    /// The environment variable naming the setup descriptor is absent.
    #[error("{0} is not set")]
    NotSet(String),

    /// The published value is not a usable descriptor.
    #[error("invalid setup descriptor {0:?}")]
    Invalid(String),

    /// The payload could not be read or decoded.
    #[error("cannot decode setup payload: {0}")]
    Decode(#[source] io::Error),
}

/// Files a child inherits at consecutive descriptor numbers starting at
/// [`FIRST_EXTRA_FD`].
#[derive(Debug, Default)]
pub struct ExtraFiles {
    /// Queued descriptors, in child descriptor order.
    files: Vec<OwnedFd>,
}

impl ExtraFiles {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self { files: Vec::new() }
    }

    /// Queues `fd` and returns the number it will carry in the child.
    pub fn push(&mut self, fd: impl Into<OwnedFd>) -> RawFd {
        self.files.push(fd.into());
        Self::target(self.files.len() - 1)
    }

    /// Number of queued descriptors.
    pub const fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether nothing is queued.
    pub const fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Consumes the set, returning the queued descriptors in order.
    pub fn into_inner(self) -> Vec<OwnedFd> {
        self.files
    }

    /// Descriptor number slot `index` maps to in the child.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    const fn target(index: usize) -> RawFd {
        FIRST_EXTRA_FD + index as RawFd
    }

    /// Moves every queued descriptor above the range the set will occupy in
    /// the child, so that installing one slot never clobbers the source of
    /// another, and marks the moved copies close-on-exec. Must run in the
    /// parent before forking.
    pub fn prepare(&mut self) -> io::Result<()> {
        let floor = Self::target(self.files.len());
        for fd in &mut self.files {
            // SAFETY: F_DUPFD_CLOEXEC on a valid descriptor; the result is owned below.
            let moved = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
            if moved < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: `moved` is a freshly duplicated descriptor nobody else owns.
            *fd = unsafe { OwnedFd::from_raw_fd(moved) };
        }
        Ok(())
    }

    /// Installs the queued descriptors at their child numbers.
    ///
    /// Only async-signal-safe calls are made, so this may run between
    /// `fork` and `exec`. [`prepare`](Self::prepare) must have run first.
    pub fn install(&self) -> io::Result<()> {
        for (i, fd) in self.files.iter().enumerate() {
            // SAFETY: dup2 is async-signal-safe; both numbers are valid.
            if unsafe { libc::dup2(fd.as_raw_fd(), Self::target(i)) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Write end of a setup pipe. Sending consumes it, so each pipe transfers
/// at most one payload and is closed immediately afterwards.
#[derive(Debug)]
pub struct Sender {
    /// Write end of the pipe.
    file: File,
}

impl Sender {
    /// Encodes `value` into the pipe and closes it.
    pub fn send(mut self, value: &impl Serialize) -> io::Result<()> {
        crate::write_payload(&mut self.file, value)
    }
}

/// Creates a setup pipe whose read end is queued on `extra`.
///
/// Returns the descriptor number the child will find the payload at,
/// together with the sending half.
pub fn setup(extra: &mut ExtraFiles) -> io::Result<(RawFd, Sender)> {
    let (r, w) = pipe2(OFlag::O_CLOEXEC)?;
    let fd = extra.push(r);
    Ok((fd, Sender { file: File::from(w) }))
}

/// Child side of a setup pipe, held open until setup completes.
#[derive(Debug)]
pub struct Receiver {
    /// Read end of the pipe.
    file: File,
}

impl Receiver {
    /// Descriptor number the payload was read from.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Closes the setup descriptor, reporting any error from `close(2)`.
    pub fn close(self) -> io::Result<()> {
        let fd = self.file.into_raw_fd();
        // SAFETY: `fd` was just released by `File` and is closed exactly once.
        if unsafe { libc::close(fd) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Reads the setup payload from the descriptor named by environment
/// variable `key`.
pub fn receive<T: DeserializeOwned>(key: &str) -> Result<(T, Receiver), ReceiveError> {
    let raw = env::var(key).map_err(|_| ReceiveError::NotSet(key.to_owned()))?;
    let fd: RawFd = raw
        .parse()
        .map_err(|_| ReceiveError::Invalid(raw.clone()))?;
    receive_from(fd).map_err(|e| match e {
        ReceiveError::Invalid(_) => ReceiveError::Invalid(raw),
        other => other,
    })
}

/// Reads the setup payload from descriptor `fd`, taking ownership of it.
pub fn receive_from<T: DeserializeOwned>(fd: RawFd) -> Result<(T, Receiver), ReceiveError> {
    if fd < FIRST_EXTRA_FD {
        return Err(ReceiveError::Invalid(fd.to_string()));
    }
    // SAFETY: F_SETFD on an arbitrary number; failure means it is not open.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(ReceiveError::Invalid(fd.to_string()));
    }
    // SAFETY: the descriptor is open and was handed to this process to own.
    let mut file = unsafe { File::from_raw_fd(fd) };
    let value = crate::read_payload(&mut file).map_err(ReceiveError::Decode)?;
    Ok((value, Receiver { file }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Setup {
        hostname: String,
        count: usize,
    }

    #[test]
    fn push_assigns_consecutive_numbers() {
        let mut extra = ExtraFiles::new();
        let (a, _wa) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (b, _wb) = pipe2(OFlag::O_CLOEXEC).unwrap();
        assert_eq!(extra.push(a), 3);
        assert_eq!(extra.push(b), 4);
        assert_eq!(extra.len(), 2);
    }

    #[test]
    fn prepare_moves_low_descriptors_out_of_range() {
        let mut extra = ExtraFiles::new();
        for _ in 0..3 {
            let (r, _w) = pipe2(OFlag::O_CLOEXEC).unwrap();
            extra.push(r);
        }
        extra.prepare().unwrap();
        for fd in extra.into_inner() {
            assert!(fd.as_raw_fd() >= 6, "fd {} still in target range", fd.as_raw_fd());
        }
    }

    #[test]
    fn send_then_receive() {
        let mut extra = ExtraFiles::new();
        let (child_fd, sender) = setup(&mut extra).unwrap();
        assert_eq!(child_fd, FIRST_EXTRA_FD);

        let sent = Setup {
            hostname: "sandbox".into(),
            count: 2,
        };
        sender.send(&sent).unwrap();

        let read_end = extra.into_inner().pop().unwrap();
        let (got, receiver): (Setup, _) = receive_from(read_end.into_raw_fd()).unwrap();
        assert_eq!(got, sent);
        receiver.close().unwrap();
    }

    #[test]
    fn dropped_sender_is_decode_error() {
        let mut extra = ExtraFiles::new();
        let (_, sender) = setup(&mut extra).unwrap();
        drop(sender);

        let read_end = extra.into_inner().pop().unwrap();
        let err = receive_from::<Setup>(read_end.into_raw_fd()).unwrap_err();
        assert!(matches!(err, ReceiveError::Decode(_)));
    }

    #[test]
    fn rejects_standard_streams() {
        let err = receive_from::<Setup>(1).unwrap_err();
        assert!(matches!(err, ReceiveError::Invalid(_)));
    }

    #[test]
    fn missing_variable() {
        let err = receive::<Setup>("FORTIFY_TEST_UNSET_HANDOFF").unwrap_err();
        assert!(matches!(err, ReceiveError::NotSet(ref k) if k == "FORTIFY_TEST_UNSET_HANDOFF"));
    }
}
