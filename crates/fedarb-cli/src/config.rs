//! # Config Subcommand
//!
//! Prints the configuration the authority would run with: the file given
//! by `--config` merged over the defaults and validated, as YAML.

use anyhow::Result;
use clap::Args;

use fedarb_core::ArbitrationConfig;

/// Arguments for the config subcommand.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print JSON instead of YAML.
    #[arg(long)]
    pub json: bool,
}

/// Execute the config subcommand.
pub fn run_config(args: &ConfigArgs, config: &ArbitrationConfig) -> Result<u8> {
    print!("{}", render(args, config)?);
    Ok(0)
}

fn render(args: &ConfigArgs, config: &ArbitrationConfig) -> Result<String> {
    if args.json {
        Ok(format!("{}\n", serde_json::to_string_pretty(config)?))
    } else {
        Ok(config.to_yaml()?)
    }
}
