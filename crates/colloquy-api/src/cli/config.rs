//! `colloquy config` subcommands.

use colloquy_infra::config::config_path;

use crate::state::load_effective_config;

use super::{ConfigCommand, ModelArgs};

pub async fn run(action: ConfigCommand, overrides: &ModelArgs) -> anyhow::Result<()> {
    let (data_dir, config) = load_effective_config(overrides).await;
    match action {
        ConfigCommand::Show => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommand::Path => {
            println!("{}", config_path(&data_dir).display());
        }
    }
    Ok(())
}
