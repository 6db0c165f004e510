use std::fs::File;

use rustix::process::getpid;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Args;

/// Log to the requested file, or `/tmp/solo-demo-$PID.log` by default.
/// `SOLO_DEMO_LOG_STDERR=1` switches to stderr for interactive debugging.
pub fn init_tracing(args: &Args) {
    if std::env::var_os("SOLO_DEMO_LOG_STDERR").is_some() {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
        return;
    }

    let log_path: &str = match &args.log_path {
        Some(path) => path,
        None => {
            let pid = getpid().as_raw_nonzero();
            &format!("/tmp/solo-demo-{pid}.log")
        }
    };

    let file = File::create(log_path).expect("Could not initialize log");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_target(false),
        )
        .init();
}
