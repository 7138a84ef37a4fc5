//! Dropzone agent.
//!
//! Loads the configuration, opens the plugin library and runs every pipeline
//! until interrupted. Also hosts the `check-config` and `plugins`
//! maintenance commands.

mod cli;
mod logging;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dropzone_config::{AgentConfig, ConfigSource, ConfigWarnings, validate};
use dropzone_core::{DispatchStatus, Orchestrator, PluginHost, PluginLoader, PluginRegistry};
use tokio::sync::mpsc;
use tracing::{info, warn};

use cli::{Cli, Command, PluginCommand};

/// Bound on waiting for the last dispatch reports after the pipelines stop.
const REPORT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Plugin calls still running on blocking threads are abandoned after this.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The configuration decides where logs go, so loading it runs under a
    // console-only subscriber until the real one is installed.
    let (config, source) =
        tracing::subscriber::with_default(logging::bootstrap(), || load_config(&cli))?;
    let _log_guard = logging::init(config.debug, config.log_dir.as_deref())?;
    log_source(&source);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("dropzone-agent")
                .build()
                .context("failed to start async runtime")?;
            let result = runtime.block_on(run(config));
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
            result
        }
        Command::CheckConfig => check_config(&config, &source),
        Command::Plugins { action } => manage_plugins(&config, action),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<(AgentConfig, ConfigSource)> {
    match &cli.config {
        Some(path) => Ok((
            AgentConfig::load_from_file(path)?,
            ConfigSource::File(path.clone()),
        )),
        None => AgentConfig::load_from_env().context("failed to load configuration"),
    }
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let host = open_plugins(&config)?;
    let warnings = validate(&config, &registered_names(&host))?;
    log_warnings(&warnings);

    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let orchestrator =
        Orchestrator::new(config.to_settings(), Arc::new(host)).with_reports(reports_tx);
    orchestrator
        .start()
        .await
        .context("failed to start pipelines")?;

    let tally = tokio::spawn(async move {
        let (mut dispatched, mut failed) = (0usize, 0usize);
        while let Some(report) = reports.recv().await {
            match report.status {
                DispatchStatus::Success => dispatched += 1,
                DispatchStatus::Failed { .. } => failed += 1,
                DispatchStatus::Duplicate => {}
            }
        }
        (dispatched, failed)
    });

    info!("dropzone agent running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    orchestrator.stop().await;
    drop(orchestrator);
    match tokio::time::timeout(REPORT_DRAIN_TIMEOUT, tally).await {
        Ok(Ok((dispatched, failed))) => info!(dispatched, failed, "dispatch summary"),
        Ok(Err(err)) => warn!(error = %err, "dispatch summary task failed"),
        Err(_) => warn!("dispatch reports still open after shutdown; skipping summary"),
    }
    Ok(())
}

fn check_config(config: &AgentConfig, source: &ConfigSource) -> anyhow::Result<()> {
    println!("configuration: {}", describe_source(source));
    let host = open_plugins(config)?;
    let warnings = validate(config, &registered_names(&host))?;

    if warnings.is_empty() {
        println!("no warnings");
    }
    for warning in warnings.iter() {
        println!("warning: {}", warning.message);
        if let Some(hint) = &warning.hint {
            println!("  hint: {hint}");
        }
    }
    println!(
        "pipelines: classification={} baseline={} uploads={}",
        config.classification.is_some(),
        config.baseline.is_some(),
        config.uploads.len()
    );
    Ok(())
}

fn manage_plugins(config: &AgentConfig, action: PluginCommand) -> anyhow::Result<()> {
    let host = open_plugins(config)?;
    let registry = host.registry();

    match action {
        PluginCommand::List => {
            let plugins = registry.list();
            if plugins.is_empty() {
                println!("no plugins in {}", registry.library_dir().display());
            }
            for plugin in plugins {
                println!("{:<24} {:<10} {}", plugin.name, plugin.version, plugin.path.display());
            }
        }
        PluginCommand::Add { module } => {
            let descriptor = registry
                .register(&module)
                .with_context(|| format!("failed to add plugin {}", module.display()))?;
            println!("added {} {}", descriptor.name, descriptor.version);
        }
        PluginCommand::Remove { name } => {
            let descriptor = registry
                .remove(&name)
                .with_context(|| format!("failed to remove plugin {name}"))?;
            println!("removed {}", descriptor.name);
        }
    }
    Ok(())
}

/// The registry library plus every module named in configuration.
fn open_plugins(config: &AgentConfig) -> anyhow::Result<PluginHost> {
    let loader = Arc::new(PluginLoader::new());
    let registry = PluginRegistry::open(&config.plugins.library_dir, Arc::clone(&loader))
        .with_context(|| {
            format!(
                "failed to open plugin library {}",
                config.plugins.library_dir.display()
            )
        })?;

    for (name, path) in &config.plugins.modules {
        if let Err(err) = registry.declare(name, path) {
            warn!(plugin = %name, path = %path.display(), error = %err, "ignoring configured plugin");
        }
    }
    Ok(PluginHost::new(Arc::new(registry), loader))
}

fn registered_names(host: &PluginHost) -> Vec<String> {
    host.registry()
        .list()
        .into_iter()
        .map(|descriptor| descriptor.name)
        .collect()
}

fn log_source(source: &ConfigSource) {
    match source {
        ConfigSource::Default => info!("no configuration found; running with defaults"),
        ConfigSource::EnvInline => info!("configuration loaded from inline environment json"),
        ConfigSource::EnvPath(path) => {
            info!(path = %path.display(), "configuration loaded from env path")
        }
        ConfigSource::File(path) => info!(path = %path.display(), "configuration loaded from file"),
    }
}

fn describe_source(source: &ConfigSource) -> String {
    let path_text = |path: &Path| path.display().to_string();
    match source {
        ConfigSource::Default => "defaults".to_string(),
        ConfigSource::EnvInline => "inline $DROPZONE_CONFIG_JSON".to_string(),
        ConfigSource::EnvPath(path) => format!("{} (from $DROPZONE_CONFIG_PATH)", path_text(path)),
        ConfigSource::File(path) => path_text(path),
    }
}

fn log_warnings(warnings: &ConfigWarnings) {
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }
}
