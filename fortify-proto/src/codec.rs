//! Length-prefixed frame codec over any `Read`/`Write` stream.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`. A setup pipe
//! carries exactly one frame, so the reader never blocks on a partial
//! payload once the writer has closed its end.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Largest setup payload accepted in either direction.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Size of the big-endian length header.
const HEADER: usize = 4;

/// An [`io::ErrorKind::InvalidData`] error.
fn invalid(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Writes `value` to `w` as one frame, in a single write.
pub fn write_payload<W: Write>(w: &mut W, value: &impl Serialize) -> io::Result<()> {
    let payload = postcard::to_allocvec(value).map_err(invalid)?;
    if payload.len() > MAX_PAYLOAD {
        return Err(invalid(format!("setup payload of {} bytes is too large", payload.len())));
    }
    let len = u32::try_from(payload.len()).map_err(invalid)?;

    let mut frame = Vec::with_capacity(HEADER + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    w.write_all(&frame)?;
    w.flush()
}

/// Reads one frame from `r` and decodes its payload.
///
/// A writer that closed without sending anything, or stopped partway,
/// surfaces as [`io::ErrorKind::UnexpectedEof`].
pub fn read_payload<T: DeserializeOwned>(r: &mut impl Read) -> io::Result<T> {
    let mut header = [0u8; HEADER];
    r.read_exact(&mut header)?;
    let declared = u32::from_be_bytes(header);
    let len = usize::try_from(declared).map_err(invalid)?;
    if len > MAX_PAYLOAD {
        return Err(invalid(format!("setup payload of {len} bytes is too large")));
    }

    let mut payload = Vec::with_capacity(len);
    r.by_ref().take(u64::from(declared)).read_to_end(&mut payload)?;
    if payload.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("setup payload truncated at {} of {len} bytes", payload.len()),
        ));
    }
    postcard::from_bytes(&payload).map_err(invalid)
}
