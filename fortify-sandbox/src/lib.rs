//! Namespace container for fortify applications.
//!
//! The host side builds a [`ContainerParams`] describing the filesystem
//! layout ([`Op`]) and hardening of the sandbox, then hands it to a
//! [`Container`] which clones the init process into fresh namespaces. The
//! init process ([`init`]) runs as PID 1, assembles the root filesystem,
//! drops every privilege, starts the target program and reaps every child
//! until the tree drains.

pub mod caps;
pub mod container;
pub mod error;
pub mod init;
pub mod logging;
pub mod ops;
pub mod params;
pub mod reap;
pub mod seccomp;

pub use container::Container;
pub use error::SetupError;
pub use ops::{BindMount, DevNodes, Op};
pub use params::{ContainerParams, HardeningFlags};
pub use seccomp::FilterOpts;
