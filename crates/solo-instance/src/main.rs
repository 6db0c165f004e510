use std::{sync::Arc, time::Duration};

use clap::Parser;
use solo_instance::{InstanceConfig, InstanceHandler, InstanceRunner};
use tracing::info;

pub mod cli;
pub mod tracing_init;

use cli::Args;
use tracing_init::init_tracing;

/// Demo application: print every argument vector it is asked to run,
/// optionally hold the primary alive so later launches have a peer.
struct DemoApp {
    exit_code: i32,
    hold: Option<Duration>,
}

impl InstanceHandler for DemoApp {
    fn run_instance(&self, args: &[String], first_instance: bool) -> i32 {
        println!(
            "{} instance, args: {args:?}",
            if first_instance { "first" } else { "forwarded" }
        );

        if first_instance && let Some(hold) = self.hold {
            println!("holding primary alive for {}s", hold.as_secs());
            std::thread::sleep(hold);
        }

        self.exit_code
    }

    fn on_closed(&self) {
        info!("closed");
    }

    fn on_shutdown(&self) {
        info!("shutdown");
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let app = DemoApp {
        exit_code: args.exit_code,
        hold: args.hold_secs.map(Duration::from_secs),
    };

    let runner = InstanceRunner::new(
        args.app_name.clone(),
        Arc::new(app),
        InstanceConfig::default(),
    )?;

    let code = runner.run(args.forward.clone()).await?;
    info!(code, "run finished");
    std::process::exit(code);
}
