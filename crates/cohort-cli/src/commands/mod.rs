pub mod catalog;
pub mod completions;
pub mod config;
pub mod cycle;
pub mod participant;
pub mod pool;

use std::path::Path;

use cohort_core::{CoreConfig, HttpDirectory, HttpStore, OpsChannel, PushGateway};

/// Clients every remote command needs, built once from the config.
pub struct Services {
    pub config: CoreConfig,
    pub store: HttpStore,
    pub directory: HttpDirectory,
    pub gateway: PushGateway,
    pub ops: OpsChannel,
}

pub fn services(config_path: Option<&Path>) -> Result<Services, Box<dyn std::error::Error>> {
    let config = CoreConfig::load(config_path)?;
    config.require_api()?;
    let store = HttpStore::new(&config.api)?;
    let directory = HttpDirectory::new(&config.api)?;
    let gateway = PushGateway::new(&config.api)?;
    let ops = OpsChannel::new(config.ops.webhook_url.clone());
    Ok(Services {
        config,
        store,
        directory,
        gateway,
        ops,
    })
}
