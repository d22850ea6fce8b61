mod commands;

use clap::Parser;
use commands::Cli;
use common::cli::utils;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);

    if let Err(e) = cli.run().await {
        eprintln!("Error: {e}");
        for cause in e.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
        std::process::exit(1);
    }
}
