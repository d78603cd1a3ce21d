//! Files published on the host for the target user.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

/// How a tmpfile gets its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Source {
    /// Copied from a host file at commit time.
    Copy(PathBuf),
    /// Hard link to a host file.
    Link(PathBuf),
    /// Written from memory.
    Write(Vec<u8>),
}

/// A file created on commit and removed on revert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Tmpfile {
    /// Where the file is created.
    pub(super) dst: PathBuf,
    /// Where its contents come from.
    pub(super) src: Source,
}

impl Tmpfile {
    pub(super) fn apply(&self) -> io::Result<()> {
        match &self.src {
            Source::Copy(src) => {
                debug!(dst = %self.dst.display(), src = %src.display(), "publishing tmpfile");
                let mut from = fs::File::open(src)?;
                let mut to = create(&self.dst)?;
                io::copy(&mut from, &mut to)?;
                to.sync_all()
            }
            Source::Link(src) => {
                debug!(dst = %self.dst.display(), src = %src.display(), "linking tmpfile");
                fs::hard_link(src, &self.dst)
            }
            Source::Write(data) => {
                debug!(dst = %self.dst.display(), len = data.len(), "writing tmpfile");
                create(&self.dst)?.write_all(data)
            }
        }
    }

    pub(super) fn revert(&self) -> io::Result<()> {
        debug!(dst = %self.dst.display(), "removing tmpfile");
        match fs::remove_file(&self.dst) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Opens `path` for writing with mode 0600, truncating it.
fn create(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

impl fmt::Display for Tmpfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.src {
            Source::Copy(src) => write!(f, "tmpfile {} copied from {}", self.dst.display(), src.display()),
            Source::Link(src) => write!(f, "tmpfile {} linked to {}", self.dst.display(), src.display()),
            Source::Write(data) => write!(f, "tmpfile {} ({} bytes)", self.dst.display(), data.len()),
        }
    }
}
