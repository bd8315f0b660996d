//! Application state wiring the store, client and controller together.

use std::path::PathBuf;

use colloquy_core::chat::{SharedStore, TurnController};
use colloquy_infra::config::{load_global_config, resolve_api_key, resolve_data_dir};
use colloquy_infra::llm::create_client;
use colloquy_types::config::GlobalConfig;

use crate::cli::ModelArgs;

/// Everything a chat or ask command needs.
pub struct AppState {
    pub config: GlobalConfig,
    pub controller: TurnController,
}

impl AppState {
    /// Load configuration, apply CLI overrides and build the turn controller.
    pub async fn init(overrides: &ModelArgs) -> anyhow::Result<Self> {
        let (data_dir, config) = load_effective_config(overrides).await;

        let api_key = resolve_api_key(&config)?;
        let client = create_client(&config, api_key)?;
        let store = SharedStore::from_config(&config);
        let controller = TurnController::new(store, client);

        tracing::info!(
            endpoint = %config.endpoint,
            model = %config.model.model,
            data_dir = %data_dir.display(),
            "application state ready"
        );

        Ok(Self {
            config,
            controller,
        })
    }

    pub fn store(&self) -> &SharedStore {
        self.controller.store()
    }
}

/// Data directory plus `config.toml` with CLI overrides applied.
pub async fn load_effective_config(overrides: &ModelArgs) -> (PathBuf, GlobalConfig) {
    let data_dir = resolve_data_dir();
    let mut config = load_global_config(&data_dir).await;
    overrides.apply(&mut config);
    (data_dir, config)
}
