use std::sync::Arc;

use bot::Bot;
use config::{Config, Environment, File};
use log::info;

mod bot;
mod calendar;
mod cfg;
mod commands;
mod store;

/// Loads the configuration using the `config` crate
fn load_config() -> Result<cfg::Config, anyhow::Error> {
    let settings = Config::builder()
        .add_source(File::with_name("config"))
        .add_source(Environment::with_prefix("VACANCY").separator("__"))
        .build()?;

    Ok(settings.try_deserialize()?)
}

#[tokio::main]
/// Entrypoint for the vacancy watcher.
/// It polls a reservation calendar page and pushes a message to the registered
/// recipient as soon as one of the watched dates opens up.
///
/// Commands (`help` for the list) are read from stdin.
async fn main() -> Result<(), anyhow::Error> {
    // Initialize the logger, filtered with RUST_LOG
    pretty_env_logger::init();

    // load the config
    let config = Arc::new(load_config()?);
    info!("watching {}", config.target.url);

    let bot = Bot::new(config)?;
    bot.start().await
}
