//! Foreman CLI entry point: parse arguments, initialize logging, and route
//! to the library.

use clap::Parser;

use foreman::app;
use foreman::cli::{execute, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    app::init_logging(cli.verbose);

    if let Err(e) = execute(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
