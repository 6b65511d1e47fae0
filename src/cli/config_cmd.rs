//! Configuration commands.

use std::path::Path;

use anyhow::Context;
use console::style;
use tunegate::{Orchestrator, OrchestratorConfig};

use super::icons::{dim_arrow, error, success};

/// Load from `path`, or fall back to defaults with environment overrides.
fn resolve(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            OrchestratorConfig::load(path)?
        }
        None => OrchestratorConfig::from_env()?,
    };
    Ok(config)
}

/// Print the resolved configuration.
pub async fn cmd_config_show(path: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = resolve(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

/// Validate the configuration and print a summary.
pub async fn cmd_config_validate(path: Option<&Path>) -> anyhow::Result<()> {
    let source = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults + environment".to_string());

    let config = resolve(path)
        .with_context(|| format!("{} Invalid configuration ({})", error(), source))?;
    let orchestrator = Orchestrator::new(config)?;
    let config = orchestrator.config();

    eprintln!("{} Configuration is valid", success());
    eprintln!("  {} Source: {}", dim_arrow(), source);
    for (api, limits) in &config.throttle {
        eprintln!(
            "  {} throttle.{}: {:?} apart, {} parallel, {:?} queue timeout",
            dim_arrow(),
            style(api).cyan(),
            limits.min_interval,
            limits.max_parallel,
            limits.queue_timeout
        );
    }
    for (api, options) in &config.retry {
        eprintln!(
            "  {} retry.{}: {} retries, delay {:?}..{:?}{}",
            dim_arrow(),
            style(api).cyan(),
            options.max_retries,
            options.initial_delay,
            options.max_delay,
            if options.adaptive { ", adaptive" } else { "" }
        );
    }
    eprintln!(
        "  {} health: degraded after {} errors, retried after {:?}",
        dim_arrow(),
        config.health.error_threshold,
        config.health.recovery_interval
    );
    eprintln!(
        "  {} cache: default TTL {:?}, {} content kinds",
        dim_arrow(),
        config.cache.default_ttl,
        config.cache.ttl_by_kind.len()
    );

    Ok(())
}
