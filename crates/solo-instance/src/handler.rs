use std::sync::Arc;

use tracing::{error, info_span};

/// Application entry point invoked by the coordinator.
///
/// `run_instance` is called with `first_instance = true` on the process that
/// won (or fell back to running standalone), and `first_instance = false` on
/// the primary for every argument vector forwarded by a later launch. It is
/// never invoked concurrently: the listener serializes forwarded requests and
/// the primary's own run happens on the caller's path.
pub trait InstanceHandler: Send + Sync + 'static {
    fn run_instance(&self, args: &[String], first_instance: bool) -> i32;

    /// Adjust launch arguments before any coordination happens. Useful for
    /// absolutizing paths relative to the secondary's working directory.
    fn preprocess_args(&self, args: Vec<String>) -> Vec<String> {
        args
    }

    /// Fired once per run, after the callback completes, before `on_shutdown`.
    fn on_closed(&self) {}

    /// Fired once per run, immediately after `on_closed`.
    fn on_shutdown(&self) {}
}

/// A plain closure works as a handler.
impl<F> InstanceHandler for F
where
    F: Fn(&[String], bool) -> i32 + Send + Sync + 'static,
{
    fn run_instance(&self, args: &[String], first_instance: bool) -> i32 {
        self(args, first_instance)
    }
}

/// Invoke the handler with panics contained.
///
/// Runs on a blocking thread so a long-running callback cannot starve the
/// listener's runtime, and so a panic surfaces as a `JoinError` instead of
/// unwinding through the coordinator. A panicking callback yields
/// `failure_exit_code`.
pub(crate) async fn invoke_guarded(
    handler: Arc<dyn InstanceHandler>,
    args: Vec<String>,
    first_instance: bool,
    failure_exit_code: i32,
) -> i32 {
    let span = info_span!("run_instance", first_instance);
    let result = tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        handler.run_instance(&args, first_instance)
    })
    .await;

    match result {
        Ok(code) => code,
        Err(join_err) => {
            error!(%join_err, "application callback panicked, mapping to failure exit code");
            failure_exit_code
        }
    }
}
