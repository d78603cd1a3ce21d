//! Per-application Linux namespace sandboxes for desktop programs.
//!
//! Each application id maps to a dedicated target user. The unprivileged
//! launcher seals a [`Config`] into container parameters and host changes,
//! commits those changes, and starts the shim as the target user through
//! the setuid identity-switch helper. The shim clones the container init,
//! which builds the sandbox and runs the program.
//!
//! Host changes live in a [`Transaction`]. When a launcher exits, only the
//! changes no other running launcher of the same user still needs are
//! reverted; the running launchers are tracked in a [`Store`].
//!
//! ```no_run
//! # async fn launch() -> fortify::Result<()> {
//! use fortify::{App, Config, Helpers, Std};
//!
//! let config = Config::load("app.json".as_ref())?;
//! let mut app = App::new(Std::default(), Helpers::discover()?);
//! app.seal(config)?;
//! let started = app.start(std::future::pending()).await;
//! let state = app.wait().await;
//! started?;
//! std::process::exit(state.exit_code());
//! # }
//! ```

mod app;
mod config;
mod enablement;
mod error;
mod id;
pub mod os;
pub mod shim;
mod state;
pub mod system;

pub use app::{App, ExitState, OVERFLOW_ID, Phase};
pub use config::{Config, Confinement, DbusConfig, ExtraPerm, FilesystemConfig, MAX_APP_ID, SandboxConfig};
pub use enablement::{Criteria, Enablement, Enablements};
pub use error::{EntryError, Error, Result, RevertError, StoreError, TransactionError};
pub use id::{Id, ParseIdError};
pub use os::{FileInfo, Helpers, Paths, Std, System};
pub use state::{Cursor, LauncherRecord, Store};
pub use system::Transaction;
