//! Config command - View and validate the shiplink configuration
//!
//! Provides the `shiplink config` CLI command which:
//! 1. Shows the effective configuration (YAML or JSON), with the SOAP
//!    password masked
//! 2. Validates the configuration file and reports errors

use anyhow::{Context as _, Result};
use clap::Subcommand;
use shiplink_core::config::Config;
use tracing::info;

use crate::{
    output::{get_formatter, OutputFormat},
    Context,
};

const MASK: &str = "********";

/// Config subcommands
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
}

impl ConfigCommand {
    /// Execute the config command
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        match self {
            ConfigCommand::Show => execute_show(ctx),
            ConfigCommand::Validate => execute_validate(ctx),
        }
    }
}

/// Copy of `config` that is safe to print.
fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if config.soap.password.is_some() {
        config.soap.password = Some(MASK.to_string());
    }
    config
}

fn execute_show(ctx: &Context) -> Result<()> {
    let formatter = get_formatter(ctx.format, ctx.quiet);
    let config_path = &ctx.config_path;
    let config = redacted(&Config::load_or_default(config_path));

    info!(config_path = %config_path.display(), "Showing configuration");

    if ctx.format == OutputFormat::Json {
        let json = serde_json::to_value(&config)
            .context("Failed to serialize configuration to JSON")?;
        formatter.print_json(&json);
    } else {
        formatter.success(&format!("Configuration ({})", config_path.display()));
        formatter.info("");

        let yaml = serde_yaml::to_string(&config)
            .context("Failed to serialize configuration to YAML")?;
        for line in yaml.lines() {
            formatter.info(line);
        }
    }

    Ok(())
}

fn execute_validate(ctx: &Context) -> Result<()> {
    let formatter = get_formatter(ctx.format, ctx.quiet);
    let config_path = &ctx.config_path;
    let is_json = ctx.format == OutputFormat::Json;

    if !config_path.exists() {
        if is_json {
            formatter.print_json(&serde_json::json!({
                "valid": true,
                "config_path": config_path.display().to_string(),
                "errors": [],
                "defaults": true,
            }));
        } else {
            formatter.info(&format!(
                "Configuration file not found at {}",
                config_path.display()
            ));
            formatter.success("Default configuration is in use");
        }
        return Ok(());
    }

    let config = match Config::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            if is_json {
                formatter.print_json(&serde_json::json!({
                    "valid": false,
                    "config_path": config_path.display().to_string(),
                    "errors": [format!("Failed to parse configuration: {e}")],
                }));
            } else {
                formatter.error(&format!("Failed to parse configuration: {e}"));
                formatter.info(&format!("File: {}", config_path.display()));
            }
            std::process::exit(1);
        }
    };

    info!(config_path = %config_path.display(), "Validating configuration");

    let errors = config.validate();

    if is_json {
        let error_strings: Vec<String> = errors.iter().map(ToString::to_string).collect();
        formatter.print_json(&serde_json::json!({
            "valid": errors.is_empty(),
            "config_path": config_path.display().to_string(),
            "errors": error_strings,
        }));
    } else if errors.is_empty() {
        formatter.success("Configuration is valid");
        formatter.info(&format!("File: {}", config_path.display()));
    } else {
        formatter.error(&format!(
            "Configuration has {} error{}:",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" }
        ));
        formatter.info(&format!("File: {}", config_path.display()));
        formatter.info("");
        for error in &errors {
            formatter.info(&format!("  {} - {}", error.field, error.message));
        }
    }

    if !errors.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
