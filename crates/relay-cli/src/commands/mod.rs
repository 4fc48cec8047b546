//! CLI command implementations.

pub mod history;
pub mod run;

use anyhow::Result;
use std::path::Path;

pub fn validate(path: &Path) -> Result<()> {
    match relay_config::load_config(path) {
        Ok(config) => {
            println!(
                "Configuration is valid: {} pipeline(s), {} resource(s), {} alert sink(s)",
                config.registry.len(),
                config.resources.len(),
                config.alerts.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error in {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}
