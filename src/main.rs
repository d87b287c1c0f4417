mod cli;
mod commands;

use clap::Parser;
use cli::Cli;

#[tokio::main]
async fn main() -> Result<(), commands::AnyError> {
    let cli = Cli::parse();
    commands::run(cli).await
}
