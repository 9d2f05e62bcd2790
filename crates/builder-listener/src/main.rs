// Entry point for the builder-listener process. Parses the command line,
// sets up logging and hands over to the runner.

use builder_common::constants::{self, return_code, variables};
use builder_listener::command_settings::{usage, CommandSettings};
use builder_listener::runner;
use builder_sdk::StringUtil;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build Tokio runtime: {e}");
            std::process::exit(return_code::TERMINATED_ERROR);
        }
    };

    let exit_code = runtime.block_on(run());

    // Build programs still running after the grace period are not waited for.
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    init_logging();

    let command = CommandSettings::parse();

    if command.is_version() {
        println!("{VERSION}");
        return return_code::SUCCESS;
    }
    if command.is_help() {
        println!("{}", usage());
        return return_code::SUCCESS;
    }
    if let Some(unknown) = command.unknown_command() {
        tracing::error!("Unknown command: '{unknown}'");
        eprintln!("{}", usage());
        return return_code::CONFIGURATION_ERROR;
    }

    tracing::info!("builder-listener {} starting on {}", VERSION, constants::CURRENT_PLATFORM);

    let exit_code = runner::execute_command(&command).await;
    tracing::info!("builder-listener exiting with code {}", exit_code);
    exit_code
}

fn init_logging() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var(variables::LOG_JSON)
        .ok()
        .and_then(|v| StringUtil::convert_to_bool(&v))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
