//! Setup payload transport between the fortify process tiers.
//!
//! The launcher, the shim and the container init never share memory; each
//! one hands the next its configuration through an inherited pipe. Payloads
//! are serialized with [`postcard`] and framed with a 4-byte big-endian
//! length prefix, and the pipe's descriptor number is published to the child
//! through an environment variable.

mod codec;
pub mod handoff;

pub use codec::{MAX_PAYLOAD, read_payload, write_payload};
pub use handoff::{ExtraFiles, FIRST_EXTRA_FD, Receiver, ReceiveError, Sender};
