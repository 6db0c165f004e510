//! Single-instance application coordination.
//!
//! At most one live process per application identity per host: the first
//! launch takes a named lock and listens on a unix socket; every later launch
//! forwards its argument vector over that socket and exits with whatever exit
//! code the primary's callback produced.
//!
//! ```no_run
//! use std::sync::Arc;
//! use solo_instance::{InstanceConfig, InstanceRunner};
//!
//! # async fn demo() -> Result<(), solo_instance::InstanceError> {
//! let runner = InstanceRunner::new(
//!     "com.example.myapp",
//!     Arc::new(|args: &[String], first_instance: bool| {
//!         println!("args={args:?} first={first_instance}");
//!         0
//!     }),
//!     InstanceConfig::default(),
//! )?;
//! let exit_code = runner.run(std::env::args().skip(1).collect()).await?;
//! # let _ = exit_code;
//! # Ok(())
//! # }
//! ```

use tokio::task::JoinHandle;
use tracing::Instrument;

pub mod channel;
pub mod handler;
pub mod identity;
pub mod listener;
pub mod lock;
pub mod runner;
pub mod wire;

pub use channel::{ChannelError, DuplexChannel, UnixChannel, request_exit_code};
pub use handler::InstanceHandler;
pub use identity::{RESOURCE_PREFIX, ResourcePaths, derive_paths};
pub use listener::ChannelListener;
pub use lock::{FileLock, LockError, LockState, NamedLock};
pub use runner::{InstanceConfig, InstanceError, InstanceRunner};
pub use wire::{ArgvCodec, LengthPrefixCodec, WireError};

/// Spawn a task wrapped in a tracing span carrying its name.
pub fn spawn_named<F>(name: &str, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let span = tracing::info_span!("task", task_name = %name);
    tokio::spawn(fut.instrument(span))
}
