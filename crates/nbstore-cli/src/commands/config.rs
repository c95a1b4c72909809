//! Config command handler

use std::path::Path;

use anyhow::Result;

use nbstore_core::StoreConfig;

use crate::output::{Output, OutputFormat};

/// Show the effective configuration
pub fn show(config: &StoreConfig, config_path: &Path, output: &Output) -> Result<()> {
    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "event_capacity": config.event_capacity,
                    "log_level": config.log_level,
                    "config_file": config_path,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:       {}", config.data_dir.display());
            println!("  event_capacity: {}", config.event_capacity);
            println!("  log_level:      {}", config.log_level);
            println!();
            println!("Config file: {}", config_path.display());
        }
    }

    Ok(())
}
