mod cli;
mod command;
mod config;
mod error;
mod game;
mod logging;
mod mod_set;
mod overlay;
mod paths;

use anyhow::Result;

fn main() -> Result<()> {
    logging::init();
    cli::run()
}
