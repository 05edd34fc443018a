use clap::Parser;
use sense_ble_gateway::app::{self, Options};
use std::panic::{self, PanicHookInfo};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr. `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    match app::run(options, app::shutdown_signal()).await {
        Ok(()) => {
            tracing::info!("bye");
            std::process::exit(EXIT_SUCCESS)
        }
        Err(why) => {
            error!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
