mod app;
mod cli;
mod config;
mod core;
mod executors;
mod organizers;
mod reporters;
mod skills;
mod ui;
mod utils;

use clap::Parser;

#[tokio::main]
async fn main() {
    human_panic::setup_panic!();

    let cli = cli::args::Cli::parse();
    if let Err(err) = app::run(cli).await {
        eprintln!("fatal: {:#}", err);
        std::process::exit(1);
    }
}
