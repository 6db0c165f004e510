//! Primary-side accept loop.
//!
//! One background task owns the accepting end of the channel. Requests are
//! served strictly one at a time; the stop signal is only observed at the
//! accept boundary, so an in-flight request always runs to completion and its
//! client always gets a matched response.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    channel::ChannelAcceptor,
    handler::{InstanceHandler, invoke_guarded},
    spawn_named,
    wire::{self, ArgvCodec},
};

/// Cooperative stop flag: set once, wakes every waiter, stays set.
#[derive(Clone, Default)]
struct StopSignal {
    flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl StopSignal {
    fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.wake.notify_waiters();
        }
    }

    async fn triggered(&self) {
        // Register interest before checking the flag, otherwise a trigger
        // between the check and the await would be lost.
        let waiter = self.wake.notified();
        if self.flag.load(Ordering::SeqCst) {
            return;
        }
        waiter.await;
    }
}

/// Handle to the accept-loop task. Created only while holding the instance
/// lock; must be fully stopped before the lock is released.
pub struct ChannelListener {
    stop: StopSignal,
    worker: JoinHandle<()>,
}

impl ChannelListener {
    /// Start the accept loop on a named background task.
    pub fn spawn<A>(
        acceptor: A,
        handler: Arc<dyn InstanceHandler>,
        codec: Arc<dyn ArgvCodec>,
        failure_exit_code: i32,
    ) -> Self
    where
        A: ChannelAcceptor,
    {
        let stop = StopSignal::default();
        let loop_stop = stop.clone();
        let worker = spawn_named("instance-listener", async move {
            accept_loop(acceptor, handler, codec, failure_exit_code, loop_stop).await;
        });
        Self { stop, worker }
    }

    /// Signal the loop to stop and wait for it, bounded by `timeout`.
    ///
    /// A request already in flight is allowed to finish; only if the worker
    /// still has not stopped within the bound is it aborted. That is a last
    /// resort, acceptable only because the owning process exits right after.
    pub async fn stop(mut self, timeout: Duration) {
        self.stop.trigger();
        match tokio::time::timeout(timeout, &mut self.worker).await {
            Ok(_) => debug!("listener stopped cleanly"),
            Err(_) => {
                warn!(?timeout, "listener did not stop in time, aborting worker");
                self.worker.abort();
            }
        }
    }
}

async fn accept_loop<A>(
    mut acceptor: A,
    handler: Arc<dyn InstanceHandler>,
    codec: Arc<dyn ArgvCodec>,
    failure_exit_code: i32,
    stop: StopSignal,
) where
    A: ChannelAcceptor,
{
    loop {
        let stream = tokio::select! {
            () = stop.triggered() => break,
            accepted = acceptor.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        // Not raced against the stop signal: a connection we accepted is
        // served to completion.
        if let Err(e) = serve_connection(
            stream,
            handler.clone(),
            codec.as_ref(),
            failure_exit_code,
        )
        .await
        {
            // Contained: one bad connection never takes the loop down.
            warn!(error = %e, "dropping connection");
        }
    }
    debug!("accept loop exited");
}

async fn serve_connection<S>(
    mut stream: S,
    handler: Arc<dyn InstanceHandler>,
    codec: &dyn ArgvCodec,
    failure_exit_code: i32,
) -> Result<(), wire::WireError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    let args = wire::read_request(&mut stream, codec).await?;
    debug!(argc = args.len(), "serving forwarded launch");

    let code = invoke_guarded(handler, args, false, failure_exit_code).await;

    wire::write_response(&mut stream, code).await?;
    Ok(())
}
