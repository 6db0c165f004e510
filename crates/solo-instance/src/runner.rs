//! Top-level orchestration: decide primary vs. secondary, drive the
//! retry/fallback ladder, and keep teardown ordered (listener fully stopped
//! before the lock is released).

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, LazyLock, Mutex},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelError, DuplexChannel, UnixChannel, request_exit_code},
    handler::{InstanceHandler, invoke_guarded},
    identity::{ResourcePaths, derive_paths},
    listener::ChannelListener,
    lock::{FileLock, LockError, LockState, NamedLock},
    wire::{ArgvCodec, LengthPrefixCodec},
};

/// Tunables for one coordinated run. The retry delay and busy-retry ceiling
/// mirror the behavior of classic single-instance frameworks; they are
/// defaults here, not invariants.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Bound on channel connect and on waiting for the primary's response.
    pub marshal_timeout: Duration,
    /// Pause before the second marshal attempt, tolerating a primary that is
    /// mid-shutdown.
    pub retry_delay: Duration,
    /// Connect retries when the channel exists but is busy.
    pub busy_retries: u32,
    /// Bound on waiting for the listener task to stop.
    pub stop_timeout: Duration,
    /// Exit code substituted when the application callback panics.
    pub failure_exit_code: i32,
    /// When false, skip coordination entirely and run standalone.
    pub single_instance: bool,
    /// Base directory for the lock file and socket. `None` means
    /// `$XDG_RUNTIME_DIR`, falling back to `/tmp`.
    pub runtime_dir: Option<PathBuf>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        // Short bound while developing, generous in release builds where a
        // busy primary may legitimately take a while to answer.
        let marshal_timeout = if cfg!(debug_assertions) {
            Duration::from_secs(3)
        } else {
            Duration::from_secs(30)
        };
        Self {
            marshal_timeout,
            retry_delay: Duration::from_secs(10),
            busy_retries: 3,
            stop_timeout: marshal_timeout,
            failure_exit_code: -1,
            single_instance: true,
            runtime_dir: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("application identity must not be empty")]
    InvalidIdentity,
    /// A live runner for this identity already exists in this process.
    #[error("an instance runner for {identity:?} is already active in this process")]
    AlreadyRunning { identity: String },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// One live runner per identity per process. The original framework asserted
/// a process-wide singleton; a registry keyed by identity keeps that guarantee
/// per application while letting one process host runners for distinct apps.
static ACTIVE: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Coordinates a single-instance application run.
///
/// Construct once at process entry and call [`InstanceRunner::run`]. The
/// returned exit code is what the process should exit with, whether this
/// launch became the primary or was forwarded to one.
pub struct InstanceRunner {
    identity: String,
    paths: ResourcePaths,
    handler: Arc<dyn InstanceHandler>,
    codec: Arc<dyn ArgvCodec>,
    config: InstanceConfig,
}

impl InstanceRunner {
    pub fn new(
        identity: impl Into<String>,
        handler: Arc<dyn InstanceHandler>,
        config: InstanceConfig,
    ) -> Result<Self, InstanceError> {
        let identity = identity.into();
        if identity.trim().is_empty() {
            return Err(InstanceError::InvalidIdentity);
        }

        {
            let mut active = ACTIVE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !active.insert(identity.clone()) {
                return Err(InstanceError::AlreadyRunning { identity });
            }
        }

        let paths = derive_paths(&identity, config.runtime_dir.as_deref());
        Ok(Self {
            identity,
            paths,
            handler,
            codec: Arc::new(LengthPrefixCodec),
            config,
        })
    }

    /// Substitute the wire codec. Both ends of an identity must agree.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn ArgvCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Resource paths this runner coordinates through, mostly for diagnostics.
    pub fn paths(&self) -> &ResourcePaths {
        &self.paths
    }

    /// Run the application, coordinating with any existing instance.
    ///
    /// Exactly one of three things happens: this process becomes the primary
    /// and serves later launches until the callback returns; the argument
    /// vector is forwarded to an existing primary and its exit code comes
    /// back; or, after the full fallback ladder fails, the callback runs
    /// standalone. `on_closed` and `on_shutdown` fire exactly once, in that
    /// order, before this returns.
    pub async fn run(self, args: Vec<String>) -> Result<i32, InstanceError> {
        let args = self.handler.preprocess_args(args);

        let code = if self.config.single_instance {
            self.run_coordinated(args).await?
        } else {
            debug!("single-instance coordination disabled, running standalone");
            self.run_callback(args).await
        };

        self.handler.on_closed();
        self.handler.on_shutdown();
        Ok(code)
    }

    async fn run_coordinated(&self, args: Vec<String>) -> Result<i32, InstanceError> {
        let mut lock = FileLock::new(&self.paths.lock)?;

        match lock.try_acquire()? {
            LockState::Acquired | LockState::AbandonedRecovered => {
                self.run_primary(lock, args).await
            }
            LockState::AlreadyHeld => self.run_secondary(lock, args).await,
        }
    }

    /// Primary path: listener up, callback in-process, ordered teardown.
    async fn run_primary(
        &self,
        mut lock: FileLock,
        args: Vec<String>,
    ) -> Result<i32, InstanceError> {
        info!(identity = %self.identity, "running as primary instance");

        let channel = UnixChannel::new(&self.paths.socket, self.config.busy_retries);
        let acceptor = match channel.bind().await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                // Do not leave the lock looking abandoned on a bind failure.
                let _ = lock.release();
                return Err(e.into());
            }
        };

        let listener = ChannelListener::spawn(
            acceptor,
            self.handler.clone(),
            self.codec.clone(),
            self.config.failure_exit_code,
        );

        let code = self.run_callback(args).await;

        // Teardown order is load-bearing: a new primary must not be able to
        // bind the channel while our listener is still mid-flight.
        listener.stop(self.config.stop_timeout).await;
        let _ = std::fs::remove_file(&self.paths.socket);
        lock.release()?;

        Ok(code)
    }

    /// Secondary path: marshal, wait, marshal, try to take over, then give up
    /// and run standalone.
    async fn run_secondary(
        &self,
        mut lock: FileLock,
        args: Vec<String>,
    ) -> Result<i32, InstanceError> {
        debug!(identity = %self.identity, "another instance holds the lock, marshaling");

        let channel = UnixChannel::new(&self.paths.socket, self.config.busy_retries);

        if let Some(code) = self.marshal(&channel, &args).await {
            return Ok(code);
        }

        // The primary may be mid-shutdown; give it a moment and try again.
        debug!(delay = ?self.config.retry_delay, "primary unreachable, waiting before retry");
        tokio::time::sleep(self.config.retry_delay).await;

        if let Some(code) = self.marshal(&channel, &args).await {
            return Ok(code);
        }

        // Maybe the old primary exited in the meantime.
        match lock.try_acquire()? {
            LockState::Acquired | LockState::AbandonedRecovered => {
                info!(identity = %self.identity, "previous primary gone, taking over");
                self.run_primary(lock, args).await
            }
            LockState::AlreadyHeld => {
                // Deliberate degradation, not an error: better a brief
                // dual-instance window than refusing to launch.
                warn!(
                    identity = %self.identity,
                    "cannot reach primary or take its lock, running standalone"
                );
                Ok(self.run_callback(args).await)
            }
        }
    }

    async fn marshal(&self, channel: &UnixChannel, args: &[String]) -> Option<i32> {
        match request_exit_code(channel, self.codec.as_ref(), args, self.config.marshal_timeout)
            .await
        {
            Ok(code) => {
                debug!(code, "primary handled forwarded launch");
                Some(code)
            }
            Err(e) => {
                debug!(error = %e, "marshal attempt failed");
                None
            }
        }
    }

    async fn run_callback(&self, args: Vec<String>) -> i32 {
        invoke_guarded(
            self.handler.clone(),
            args,
            true,
            self.config.failure_exit_code,
        )
        .await
    }
}

impl Drop for InstanceRunner {
    fn drop(&mut self) {
        let mut active = ACTIVE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        active.remove(&self.identity);
    }
}
