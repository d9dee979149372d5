//! # fedarb-cli: Command-Line Interface for the Arbitration Authority
//!
//! Provides the `fedarb` binary. The authority itself is a library that a
//! routing layer embeds; the CLI exists for operators and for reproducing
//! arbitration behavior offline.
//!
//! ## Subcommands
//!
//! - `fedarb config`: Print the effective, validated configuration.
//! - `fedarb simulate --scenario <file>`: Replay a scripted sequence of
//!   requests against an authority on a simulated clock.
//!
//! ```bash
//! fedarb config --config arbitration.yaml
//! fedarb simulate --scenario scenarios/fresh-dispute.yaml --json
//! ```

pub mod config;
pub mod simulate;

use std::path::Path;

use anyhow::{Context, Result};

use fedarb_core::ArbitrationConfig;

/// Load the configuration at `path`, or the defaults when none is given.
pub fn load_config(path: Option<&Path>) -> Result<ArbitrationConfig> {
    match path {
        Some(path) => ArbitrationConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(ArbitrationConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn missing_path_gives_defaults() {
        assert_eq!(load_config(None).unwrap(), ArbitrationConfig::default());
    }

    #[test]
    fn partial_file_overrides_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbitration.yaml");
        std::fs::write(&path, "delay_interval_ms: 1500\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.delay_interval, Duration::from_millis(1_500));
        assert_eq!(config.cleanup_interval, ArbitrationConfig::default().cleanup_interval);
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");
        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("missing.yaml"));
    }
}
